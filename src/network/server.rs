//! NodeNet Server
//!
//! The server accepts connections, runs each one through the login
//! handshake while it sits in quarantine, and routes envelopes between the
//! admitted nodes. It is itself a node: the first entry of every session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;

use super::connection::{Connection, ConnectionError};
use super::listeners::{ConnectionChangeListener, ListenerList, MessageListener};
use super::routing::RoutingTable;
use super::transport::{ChannelId, Transport, TransportListener};
use super::{Messenger, MessengerError, MessengerResult};
use crate::login::{
    sanitize_name, Admission, AllowAll, LoginValidator, NameAllocator, ServerConversation,
    ServerLoginStep,
};
use crate::moderation::{InMemoryOnly, Moderation, ModerationStore, DEFAULT_DEPARTED_CACHE};
use crate::node::{find_local_address, same_name, Node};
use crate::protocol::{ChatMessage, Message, MessageEnvelope, Payload, DEFAULT_PORT, MAX_MESSAGE_SIZE};

pub const BANNED_REASON: &str = "You have been banned from this game";
pub const LOGIN_TIMEOUT_REASON: &str = "Login timed out";
pub const DEFAULT_MUTE_NOTICE: &str = "You have been muted";
pub const DEFAULT_CHAT_CHANNEL: &str = "chat";

const LISTEN_BACKLOG: u32 = 10;

/// Runtime settings of a server messenger
#[derive(Clone)]
pub struct ServerConfig {
    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,
    /// Display name of the server node
    pub name: String,
    /// Quarantined channels are closed after this long
    pub login_timeout: Duration,
    pub max_message_size: usize,
    pub accept_new_connections: bool,
    /// Chat payloads on this channel are subject to mutes
    pub chat_channel: String,
    /// Text sent back to a muted sender
    pub mute_notice: String,
    /// How often expired bans and mutes are purged
    pub sweep_interval: Duration,
    pub departed_cache: usize,
    pub validator: Arc<dyn LoginValidator>,
    pub store: Arc<dyn ModerationStore>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            name: "Server".to_string(),
            login_timeout: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
            accept_new_connections: true,
            chat_channel: DEFAULT_CHAT_CHANNEL.to_string(),
            mute_notice: DEFAULT_MUTE_NOTICE.to_string(),
            sweep_interval: Duration::from_secs(60),
            departed_cache: DEFAULT_DEPARTED_CACHE,
            validator: Arc::new(AllowAll),
            store: Arc::new(InMemoryOnly),
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn LoginValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ModerationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }
}

struct ServerInner {
    config: ServerConfig,
    local_node: Node,
    bound_addr: SocketAddr,
    transport: Transport,
    table: RoutingTable,
    /// Channels still logging in
    quarantine: DashMap<ChannelId, Mutex<ServerConversation>>,
    names: NameAllocator,
    moderation: Moderation,
    accept_new: AtomicBool,
    shut_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    message_listeners: ListenerList<dyn MessageListener>,
    connection_listeners: ListenerList<dyn ConnectionChangeListener>,
}

/// NodeNet Server
pub struct ServerMessenger {
    inner: Arc<ServerInner>,
}

impl ServerMessenger {
    /// Bind the listening port and start accepting connections
    pub async fn bind(config: ServerConfig) -> MessengerResult<Self> {
        let listener = {
            let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket
                .bind(bind_addr)
                .map_err(|e| MessengerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))?;
            socket.listen(LISTEN_BACKLOG)?
        };
        let bound_addr = listener.local_addr()?;

        let address = find_local_address();
        let local_node = Node::new(sanitize_name(&config.name, None), address, bound_addr.port());
        tracing::info!("Server listening on {} as {}", bound_addr, local_node);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let moderation = Moderation::with_departed_capacity(config.store.clone(), config.departed_cache);

        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let transport_listener: Weak<dyn TransportListener> = weak.clone();
            ServerInner {
                accept_new: AtomicBool::new(config.accept_new_connections),
                config,
                local_node,
                bound_addr,
                transport: Transport::new(transport_listener),
                table: RoutingTable::new(),
                quarantine: DashMap::new(),
                names: NameAllocator::new(),
                moderation,
                shut_down: AtomicBool::new(false),
                shutdown_tx,
                message_listeners: ListenerList::new(),
                connection_listeners: ListenerList::new(),
            }
        });

        tokio::spawn(accept_loop(inner.clone(), listener, shutdown_rx.clone()));
        tokio::spawn(sweep_loop(Arc::downgrade(&inner), shutdown_rx));

        Ok(Self { inner })
    }

    /// Address the listening socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.bound_addr
    }

    /// Every node in the session, the server included
    pub fn get_nodes(&self) -> Vec<Node> {
        let mut nodes = self.inner.table.nodes();
        nodes.push(self.inner.local_node.clone());
        nodes.sort_by(|a, b| a.cmp_by_name(b));
        nodes
    }

    /// Admitted node with this name, ignoring case
    pub fn find_node(&self, name: &str) -> Option<Node> {
        if same_name(self.inner.local_node.name(), name) {
            return Some(self.inner.local_node.clone());
        }
        self.inner.table.find_by_name(name)
    }

    pub fn set_accept_new_connections(&self, accept: bool) {
        tracing::info!("{} new connections", if accept { "Accepting" } else { "Refusing" });
        self.inner.accept_new.store(accept, Ordering::SeqCst);
    }

    pub fn is_accepting_new_connections(&self) -> bool {
        self.inner.accept_new.load(Ordering::SeqCst)
    }

    /// Evict a node and close its channel
    pub fn remove_connection(&self, node: &Node) -> MessengerResult<()> {
        self.inner.remove_connection(node, "Removed from game")
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionChangeListener>) {
        self.inner.connection_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionChangeListener>) -> bool {
        self.inner.connection_listeners.remove(listener)
    }

    pub fn moderation(&self) -> &Moderation {
        &self.inner.moderation
    }

    /// Ban a node by name, IP and MAC, persist the ban and evict the node
    pub fn ban_player(&self, node: &Node, expires: Option<DateTime<Utc>>) -> MessengerResult<()> {
        if *node == self.inner.local_node {
            return Err(MessengerError::CannotRemoveSelf);
        }
        let name = self.admitted_name(node);
        self.inner.moderation.ban_player(&name, node.address(), None, expires)?;
        self.inner.remove_connection(node, BANNED_REASON)
    }

    pub fn is_player_banned(&self, name: &str, ip: IpAddr, mac: Option<&str>) -> bool {
        self.inner.moderation.is_player_banned(name, ip, mac)
    }

    /// Mute a node by username and, when known, by MAC
    pub fn mute_player(&self, node: &Node, expires: Option<DateTime<Utc>>) -> MessengerResult<()> {
        let name = self.admitted_name(node);
        self.inner.moderation.mute_username(&name, expires)?;
        if let Some(mac) = self.inner.moderation.player_mac(&name) {
            self.inner.moderation.mute_mac(&mac, expires)?;
        }
        Ok(())
    }

    pub fn mini_ban_username(&self, username: &str, expires: Option<DateTime<Utc>>) {
        self.inner.moderation.mini_ban_username(username, expires);
    }

    pub fn mini_ban_ip(&self, ip: IpAddr, expires: Option<DateTime<Utc>>) {
        self.inner.moderation.mini_ban_ip(ip, expires);
    }

    pub fn mini_ban_mac(&self, mac: &str, expires: Option<DateTime<Utc>>) {
        self.inner.moderation.mini_ban_mac(mac, expires);
    }

    fn admitted_name(&self, node: &Node) -> String {
        self.inner
            .table
            .resolve(node)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| node.name().to_string())
    }
}

impl Messenger for ServerMessenger {
    fn send(&self, payload: Payload, to: &Node) {
        let inner = &self.inner;
        if *to == inner.local_node {
            inner.deliver_local(&payload, &inner.local_node);
            return;
        }
        match inner.table.channel_of(to) {
            Some(channel) => {
                let envelope = MessageEnvelope::unicast(to.clone(), inner.local_node.clone(), payload);
                if let Err(e) = inner.transport.send(channel, Message::Envelope(envelope)) {
                    tracing::debug!("Dropped message to {}: {}", to, e);
                }
            }
            None => tracing::debug!("Dropped message to departed node {}", to),
        }
    }

    fn broadcast(&self, payload: Payload) {
        let inner = &self.inner;
        let envelope = Message::Envelope(MessageEnvelope::broadcast(inner.local_node.clone(), payload));
        for channel in inner.table.channels() {
            let _ = inner.transport.send(channel, envelope.clone());
        }
    }

    fn local_node(&self) -> Node {
        self.inner.local_node.clone()
    }

    fn server_node(&self) -> Node {
        self.inner.local_node.clone()
    }

    fn is_connected(&self) -> bool {
        !self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn is_server(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.inner.message_listeners.add(listener);
    }

    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.inner.message_listeners.remove(listener)
    }
}

impl Drop for ServerMessenger {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ServerInner {
    fn accept(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        if !self.accept_new.load(Ordering::SeqCst) {
            tracing::info!("Refused connection from {}: not accepting new connections", remote);
            return;
        }

        let conn = Connection::new(stream, remote, self.config.max_message_size);
        let validator = self.config.validator.clone();
        let channel = self.transport.add_with(conn, |id| {
            self.quarantine
                .insert(id, Mutex::new(ServerConversation::new(remote, validator)));
        });
        tracing::info!("New connection from {} quarantined on channel {}", remote, channel);

        let weak = Arc::downgrade(self);
        let timeout = self.config.login_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if inner.end_login(channel, LOGIN_TIMEOUT_REASON) {
                    tracing::info!("Login from {} timed out", remote);
                }
            }
        });
    }

    fn handle_login(&self, channel: ChannelId, message: Message) {
        let (step, remote) = {
            let Some(entry) = self.quarantine.get(&channel) else {
                return;
            };
            let mut conversation = entry.lock();
            let step = conversation.handle(message, self);
            (step, conversation.remote())
        };

        match step {
            ServerLoginStep::Reply(reply) => {
                if let Err(e) = self.transport.send(channel, reply) {
                    tracing::debug!("Login reply to {} failed: {}", remote, e);
                }
            }
            ServerLoginStep::Admit { name, mac_hash } => self.admit(channel, remote, name, mac_hash),
            ServerLoginStep::Reject { reason } => {
                tracing::info!("Rejected login from {}: {}", remote, reason);
                self.end_login(channel, &reason);
            }
        }
    }

    /// Move a channel from quarantine into the routing table.
    /// The name reservation is kept until the node leaves.
    fn admit(&self, channel: ChannelId, remote: SocketAddr, name: String, mac_hash: String) {
        // Whoever removes the quarantine entry owns the outcome of the login
        if self.quarantine.remove(&channel).is_none() {
            tracing::debug!("Login of {} on channel {} already ended", name, channel);
            return;
        }

        let node = Node::from_socket_addr(name.clone(), remote);
        let accepted = Message::LoginAccepted {
            assigned_name: name.clone(),
            client_address: remote,
            server_node: self.local_node.clone(),
        };
        let sent = self.transport.send(channel, accepted);
        let inserted = sent.is_ok() && self.table.insert(node.clone(), channel);

        if !inserted {
            tracing::warn!("Could not admit {} on channel {}", node, channel);
            self.names.release(&name);
            self.transport.close(channel, "Login failed");
            return;
        }

        self.moderation.player_login(&name, &mac_hash);
        tracing::info!("Admitted {} on channel {}", node, channel);
        self.connection_listeners.for_each(|l| l.connection_added(&node));
    }

    /// Reject and close a quarantined channel. Returns false if it already left quarantine.
    fn end_login(&self, channel: ChannelId, reason: &str) -> bool {
        let Some((_, conversation)) = self.quarantine.remove(&channel) else {
            return false;
        };
        if let Some(name) = conversation.lock().assigned_name() {
            self.names.release(name);
        }
        let _ = self.transport.send(
            channel,
            Message::LoginRejected {
                reason: reason.to_string(),
            },
        );
        self.transport.close(channel, reason);
        true
    }

    /// Route one envelope received on an admitted channel
    fn route(&self, channel: ChannelId, envelope: MessageEnvelope) -> MessengerResult<()> {
        let Some(sender) = self.table.node_of(channel) else {
            tracing::debug!("Envelope on departed channel {} dropped", channel);
            return Ok(());
        };
        if envelope.from != sender {
            return Err(MessengerError::ProtocolViolation {
                channel,
                admitted: sender,
                claimed: Some(envelope.from),
            });
        }

        if envelope.payload.chat_on(&self.config.chat_channel).is_some()
            && self.moderation.is_player_muted(sender.name())
        {
            tracing::info!("Suppressed chat from muted player {}", sender);
            let notice = MessageEnvelope::unicast(
                sender.clone(),
                self.local_node.clone(),
                Payload::Chat(ChatMessage::new(
                    self.config.chat_channel.clone(),
                    self.config.mute_notice.clone(),
                )),
            );
            let _ = self.transport.send(channel, Message::Envelope(notice));
            return Ok(());
        }

        match &envelope.to {
            None => {
                let message = Message::Envelope(envelope.clone());
                for other in self.table.channels() {
                    if other != channel {
                        // A node may leave between listing and sending
                        let _ = self.transport.send(other, message.clone());
                    }
                }
                self.deliver_local(&envelope.payload, &sender);
                Ok(())
            }
            Some(to) if *to == self.local_node => {
                self.deliver_local(&envelope.payload, &sender);
                Ok(())
            }
            Some(to) => {
                let target = self
                    .table
                    .channel_of(to)
                    .ok_or_else(|| MessengerError::UnknownDestination(to.clone()))?;
                let _ = self.transport.send(target, Message::Envelope(envelope));
                Ok(())
            }
        }
    }

    fn deliver_local(&self, payload: &Payload, from: &Node) {
        self.message_listeners.for_each(|l| l.message_received(payload, from));
    }

    /// The one path by which a node leaves the routing table
    fn remove_connection(&self, node: &Node, reason: &str) -> MessengerResult<()> {
        if *node == self.local_node {
            return Err(MessengerError::CannotRemoveSelf);
        }
        let Some((removed, channel)) = self.table.remove_node(node) else {
            tracing::debug!("{} already removed", node);
            return Ok(());
        };

        self.moderation.player_departed(removed.name());
        self.names.remember(removed.address(), removed.name());
        self.names.release(removed.name());
        self.transport.close(channel, reason);

        tracing::info!("Removed {}: {}", removed, reason);
        self.connection_listeners.for_each(|l| l.connection_removed(&removed));
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Server shutting down");
        let _ = self.shutdown_tx.send(true);

        self.quarantine.clear();
        for node in self.table.nodes() {
            if let Some((removed, _)) = self.table.remove_node(&node) {
                self.names.release(removed.name());
            }
        }
        self.transport.shutdown("Server shutting down");
    }
}

impl Admission for ServerInner {
    fn assign_name(&self, requested: &str, remote: SocketAddr) -> String {
        // Admitted nodes keep their reservation, so only the server's name is passed
        self.names
            .allocate(requested, remote.ip(), [self.local_node.name()])
    }

    fn denial_reason(&self, name: &str, mac_hash: &str, remote: SocketAddr) -> Option<String> {
        if self.moderation.is_player_banned(name, remote.ip(), Some(mac_hash)) {
            return Some(BANNED_REASON.to_string());
        }
        None
    }
}

impl TransportListener for ServerInner {
    fn message_received(&self, channel: ChannelId, message: Message) {
        if self.quarantine.contains_key(&channel) {
            self.handle_login(channel, message);
            return;
        }

        match message {
            Message::Envelope(envelope) => match self.route(channel, envelope) {
                Ok(()) => {}
                Err(e @ MessengerError::ProtocolViolation { .. }) => {
                    tracing::error!("{}", e);
                    if let Some(node) = self.table.node_of(channel) {
                        let _ = self.remove_connection(&node, "Protocol violation");
                    }
                }
                Err(e) => tracing::error!("Routing failed on channel {}: {}", channel, e),
            },
            other => {
                tracing::warn!(
                    "Ignoring message {:#04x} on admitted channel {}",
                    other.type_id(),
                    channel
                );
            }
        }
    }

    fn socket_error(&self, channel: ChannelId, error: ConnectionError) {
        if let Some((_, conversation)) = self.quarantine.remove(&channel) {
            let conversation = conversation.into_inner();
            if let Some(name) = conversation.assigned_name() {
                self.names.release(name);
            }
            tracing::info!("Login from {} aborted: {}", conversation.remote(), error);
            return;
        }

        if let Some(node) = self.table.node_of(channel) {
            tracing::info!("Lost connection to {}: {}", node, error);
            let _ = self.remove_connection(&node, "Connection lost");
        }
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: tokio::net::TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => inner.accept(stream, remote),
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown_rx.changed() => {}
        }
    }
    tracing::debug!("Acceptor on {} stopped", inner.bound_addr);
}

async fn sweep_loop(inner: Weak<ServerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.sweep_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match inner.upgrade() {
                    Some(inner) => inner.moderation.purge_expired(Utc::now()),
                    None => break,
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
