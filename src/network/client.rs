//! NodeNet Client
//!
//! Connects to a server, logs in, and exchanges envelopes over the one
//! connection. Construction only succeeds once the server has admitted us.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionError, ConnectionHandle, Outbound};
use super::listeners::{ErrorListener, ListenerList, MessageListener};
use super::transport::now_micros;
use super::{resolve_host, Messenger};
use crate::login::{local_machine_hash, ClientConversation, ClientLoginStep, CredentialsProvider, LoginError, LoginOutcome, NoCredentials};
use crate::node::Node;
use crate::protocol::{Message, MessageEnvelope, Payload, DEFAULT_PORT, MAX_MESSAGE_SIZE};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Login failed: {0}")]
    Login(#[from] LoginError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Runtime settings of a client messenger
#[derive(Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Name to ask the server for
    pub name: String,
    /// Salted hash identifying this machine
    pub mac_hash: String,
    pub credentials: Arc<dyn CredentialsProvider>,
    /// Bounds the TCP connect and the whole login
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_message_size: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            mac_hash: local_machine_hash(),
            credentials: Arc::new(NoCredentials),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_mac_hash(mut self, mac_hash: impl Into<String>) -> Self {
        self.mac_hash = mac_hash.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT, "Player")
    }
}

struct ClientInner {
    local_node: Node,
    server_node: Node,
    handle: ConnectionHandle,
    shut_down: AtomicBool,
    message_listeners: ListenerList<dyn MessageListener>,
    error_listeners: ListenerList<dyn ErrorListener>,
}

/// NodeNet Client
pub struct ClientMessenger {
    inner: Arc<ClientInner>,
}

impl ClientMessenger {
    /// Connect and log in, failing if either does not finish within the connect timeout
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        tracing::info!("Connecting to {}:{} as '{}'", config.host, config.port, config.name);
        match tokio::time::timeout(config.connect_timeout, Self::establish(&config)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Connecting to {}:{} timed out", config.host, config.port);
                Err(ClientError::Timeout)
            }
        }
    }

    async fn establish(config: &ClientConfig) -> ClientResult<Self> {
        let server_addr = resolve_host(&config.host, config.port).await?;
        let stream = TcpStream::connect(server_addr).await?;
        let mut conn = Connection::new(stream, server_addr, config.max_message_size);

        let mut conversation =
            ClientConversation::new(config.name.clone(), config.mac_hash.clone(), config.credentials.clone());
        let outcome = login(&mut conn, &mut conversation).await?;
        conn.set_connected();
        tracing::info!(
            "Logged in to {} as {}",
            outcome.server_node,
            outcome.local_node
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            local_node: outcome.local_node,
            server_node: outcome.server_node,
            handle: ConnectionHandle::new(tx),
            shut_down: AtomicBool::new(false),
            message_listeners: ListenerList::new(),
            error_listeners: ListenerList::new(),
        });

        tokio::spawn(run_connection(inner.clone(), conn, rx, config.heartbeat_interval));
        Ok(Self { inner })
    }

    /// Queue an envelope, reporting a dead connection
    pub fn try_send(&self, payload: Payload, to: Option<&Node>) -> ClientResult<()> {
        let from = self.inner.local_node.clone();
        let envelope = match to {
            Some(to) => MessageEnvelope::unicast(to.clone(), from, payload),
            None => MessageEnvelope::broadcast(from, payload),
        };
        self.inner
            .handle
            .send(Message::Envelope(envelope))
            .map_err(|_| ClientError::NotConnected)
    }

    pub fn add_error_listener(&self, listener: Arc<dyn ErrorListener>) {
        self.inner.error_listeners.add(listener);
    }

    pub fn remove_error_listener(&self, listener: &Arc<dyn ErrorListener>) -> bool {
        self.inner.error_listeners.remove(listener)
    }

    /// Last measured round-trip time to the server, in microseconds
    pub fn rtt_us(&self) -> u64 {
        self.inner.handle.rtt_us()
    }
}

impl Messenger for ClientMessenger {
    fn send(&self, payload: Payload, to: &Node) {
        if let Err(e) = self.try_send(payload, Some(to)) {
            tracing::debug!("Dropped message to {}: {}", to, e);
        }
    }

    fn broadcast(&self, payload: Payload) {
        if let Err(e) = self.try_send(payload, None) {
            tracing::debug!("Dropped broadcast: {}", e);
        }
    }

    fn local_node(&self) -> Node {
        self.inner.local_node.clone()
    }

    fn server_node(&self) -> Node {
        self.inner.server_node.clone()
    }

    fn is_connected(&self) -> bool {
        self.inner.handle.is_connected()
    }

    fn is_server(&self) -> bool {
        false
    }

    fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Client shutting down");
        self.inner.handle.close("Client shutting down");
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.inner.message_listeners.add(listener);
    }

    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.inner.message_listeners.remove(listener)
    }
}

impl Drop for ClientMessenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drive the client half of the handshake to completion
async fn login(conn: &mut Connection, conversation: &mut ClientConversation) -> ClientResult<LoginOutcome> {
    conn.send(&conversation.start()?).await?;
    loop {
        let frame = conn.recv().await?.ok_or(LoginError::Closed)?;
        match conversation.handle(frame.message)? {
            ClientLoginStep::Send(reply) => conn.send(&reply).await?,
            ClientLoginStep::Done(outcome) => return Ok(outcome),
        }
    }
}

async fn run_connection(
    inner: Arc<ClientInner>,
    mut conn: Connection,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);

    let disconnect_reason: Option<String> = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(frame)) => match frame.message {
                        Message::Envelope(envelope) => {
                            if envelope.is_addressed_to(&inner.local_node) {
                                inner
                                    .message_listeners
                                    .for_each(|l| l.message_received(&envelope.payload, &envelope.from));
                            } else {
                                tracing::warn!("Envelope for {:?} delivered to {}", envelope.to, inner.local_node);
                            }
                        }
                        Message::Heartbeat { timestamp } => {
                            if let Err(e) = conn.send(&Message::HeartbeatAck { timestamp }).await {
                                break Some(format!("Send error: {}", e));
                            }
                        }
                        Message::HeartbeatAck { timestamp } => {
                            inner.handle.update_rtt(now_micros().saturating_sub(timestamp));
                        }
                        Message::Disconnect { reason } => break Some(reason),
                        other => {
                            tracing::warn!("Ignoring message {:#04x} from server", other.type_id());
                        }
                    },
                    Ok(None) => break Some("Connection closed".to_string()),
                    Err(e) => break Some(format!("Error: {}", e)),
                }
            }

            command = outbound.recv() => {
                match command {
                    Some(Outbound::Message(message)) => {
                        if let Err(e) = conn.send(&message).await {
                            break Some(format!("Send error: {}", e));
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        if let Err(e) = conn.close(&reason).await {
                            tracing::debug!("Unclean close: {}", e);
                        }
                        break None;
                    }
                    None => break None,
                }
            }

            _ = heartbeat_timer.tick() => {
                if let Err(e) = conn.send(&Message::Heartbeat { timestamp: now_micros() }).await {
                    break Some(format!("Heartbeat error: {}", e));
                }
            }
        }
    };

    inner.handle.mark_disconnected();

    if let Some(reason) = disconnect_reason {
        if inner.shut_down.load(Ordering::SeqCst) {
            tracing::debug!("Connection ended after shutdown: {}", reason);
        } else {
            tracing::warn!("Lost connection to {}: {}", inner.server_node, reason);
            inner.error_listeners.for_each(|l| l.messenger_invalid(&reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{EventForwarder, MessengerEvent, ServerConfig, ServerMessenger};
    use tokio::net::TcpListener;

    async fn pair() -> (ServerMessenger, ClientMessenger) {
        let server = ServerMessenger::bind(ServerConfig::new(0, "Host")).await.unwrap();
        let client = ClientMessenger::connect(ClientConfig::new("127.0.0.1", server.local_addr().port(), "guest"))
            .await
            .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_login_resolves_both_nodes() {
        let (server, client) = pair().await;
        assert!(client.is_connected());
        assert!(!client.is_server());
        assert_eq!(client.server_node(), server.local_node());
        assert_eq!(client.local_node().name(), "guest");
        assert_eq!(client.local_node().address().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_shutdown_twice() {
        let (_server, client) = pair().await;
        client.shutdown();
        client.shutdown();
        assert!(!client.is_connected());
        assert!(matches!(
            client.try_send(Payload::Data(vec![]), None),
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown() {
        let (_server, client) = pair().await;
        let client = Arc::new(client);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.shutdown() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_server_shutdown_invalidates_client() {
        let (server, client) = pair().await;
        let (forwarder, mut events) = EventForwarder::channel();
        client.add_error_listener(forwarder);

        server.shutdown();
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(MessengerEvent::Invalid { reason })) => assert_eq!(reason, "Server shutting down"),
            other => panic!("expected invalidation, got {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ClientConfig::new("127.0.0.1", port, "guest").with_connect_timeout(Duration::from_millis(200));
        assert!(matches!(ClientMessenger::connect(config).await, Err(ClientError::Timeout)));
    }

    #[tokio::test]
    async fn test_bad_mac_hash_is_rejected() {
        let server = ServerMessenger::bind(ServerConfig::new(0, "Host")).await.unwrap();
        let config = ClientConfig::new("127.0.0.1", server.local_addr().port(), "guest").with_mac_hash("deadbeef");

        match ClientMessenger::connect(config).await {
            Err(ClientError::Login(LoginError::Rejected(reason))) => {
                assert_eq!(reason, crate::login::INVALID_MAC_HASH)
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("login with a bad MAC hash succeeded"),
        }
    }
}
