//! Channel transport
//!
//! Each channel runs one task that owns its [`Connection`], reading frames
//! and draining the channel's outbound queue. Received frames are handed to
//! a [`TransportListener`] from that task. Heartbeats are answered here and
//! never reach the listener.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionError, ConnectionHandle, ConnectionResult, Outbound};
use crate::protocol::Message;

/// Identifies one accepted socket for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callbacks from channel tasks. Implementations must not block.
pub trait TransportListener: Send + Sync {
    fn message_received(&self, channel: ChannelId, message: Message);

    /// The channel failed or the peer went away. Not called for channels
    /// closed through [`Transport::close`].
    fn socket_error(&self, channel: ChannelId, error: ConnectionError);
}

/// Owns the I/O tasks of every open channel
pub struct Transport {
    listener: Weak<dyn TransportListener>,
    channels: Arc<DashMap<ChannelId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl Transport {
    pub fn new(listener: Weak<dyn TransportListener>) -> Self {
        Self {
            listener,
            channels: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start serving a connection. Must be called from within the runtime.
    pub fn add(&self, conn: Connection) -> ChannelId {
        self.add_with(conn, |_| {})
    }

    /// Like [`add`](Transport::add), running `on_open` before the channel's
    /// task starts so no callback for the channel can precede it.
    pub fn add_with<F>(&self, conn: Connection, on_open: F) -> ChannelId
    where
        F: FnOnce(ChannelId),
    {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx);
        self.channels.insert(id, handle.clone());
        on_open(id);

        tracing::debug!("Channel {} opened for {}", id, conn.remote_addr());
        tokio::spawn(run_channel(
            id,
            conn,
            rx,
            handle,
            self.channels.clone(),
            self.listener.clone(),
        ));
        id
    }

    /// Queue a message on a channel. Never blocks.
    pub fn send(&self, channel: ChannelId, message: Message) -> ConnectionResult<()> {
        let handle = self
            .channels
            .get(&channel)
            .map(|entry| entry.value().clone())
            .ok_or(ConnectionError::Closed)?;
        handle.send(message)
    }

    /// Close a channel after its queued messages, telling the peer why
    pub fn close(&self, channel: ChannelId, reason: &str) {
        if let Some((_, handle)) = self.channels.remove(&channel) {
            handle.close(reason);
        }
    }

    pub fn is_open(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    /// Round-trip time last measured on a channel, in microseconds
    pub fn rtt_us(&self, channel: ChannelId) -> Option<u64> {
        self.channels.get(&channel).map(|entry| entry.rtt_us())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Close every channel
    pub fn shutdown(&self, reason: &str) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.close(id, reason);
        }
    }
}

async fn run_channel(
    id: ChannelId,
    mut conn: Connection,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handle: ConnectionHandle,
    channels: Arc<DashMap<ChannelId, ConnectionHandle>>,
    listener: Weak<dyn TransportListener>,
) {
    let outcome: ConnectionResult<()> = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(frame)) => match frame.message {
                        Message::Heartbeat { timestamp } => {
                            if let Err(e) = conn.send(&Message::HeartbeatAck { timestamp }).await {
                                break Err(e);
                            }
                        }
                        Message::HeartbeatAck { timestamp } => {
                            handle.update_rtt(now_micros().saturating_sub(timestamp));
                        }
                        Message::Disconnect { reason } => {
                            break Err(ConnectionError::PeerDisconnected(reason));
                        }
                        message => match listener.upgrade() {
                            Some(listener) => listener.message_received(id, message),
                            None => break Ok(()),
                        },
                    },
                    Ok(None) => break Err(ConnectionError::Closed),
                    Err(e) => break Err(e),
                }
            }

            command = outbound.recv() => {
                match command {
                    Some(Outbound::Message(message)) => {
                        if let Err(e) = conn.send(&message).await {
                            break Err(e);
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        if let Err(e) = conn.close(&reason).await {
                            tracing::debug!("Channel {} closed uncleanly: {}", id, e);
                        }
                        break Ok(());
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    handle.mark_disconnected();
    let was_open = channels.remove(&id).is_some();
    tracing::debug!(
        "Channel {} finished: sent {} / received {} messages",
        id,
        conn.stats().messages_sent,
        conn.stats().messages_received
    );

    if let Err(e) = outcome {
        if was_open {
            if let Some(listener) = listener.upgrade() {
                listener.socket_error(id, e);
            }
        }
    }
}

/// Microseconds since the Unix epoch, as carried in heartbeats
pub(crate) fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_MESSAGE_SIZE;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(ChannelId, Message)>>,
        errors: Mutex<Vec<ChannelId>>,
    }

    impl TransportListener for Recorder {
        fn message_received(&self, channel: ChannelId, message: Message) {
            self.messages.lock().push((channel, message));
        }

        fn socket_error(&self, channel: ChannelId, _error: ConnectionError) {
            self.errors.lock().push(channel);
        }
    }

    async fn served_pair(transport: &Transport) -> (ChannelId, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, peer) = accepted.unwrap();
        let id = transport.add(Connection::new(server, peer, MAX_MESSAGE_SIZE));
        (id, Connection::new(client.unwrap(), addr, MAX_MESSAGE_SIZE))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_delivers_and_answers_heartbeats() {
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn TransportListener> = recorder.clone();
        let transport = Transport::new(Arc::downgrade(&as_listener));
        let (id, mut peer) = served_pair(&transport).await;

        peer.send(&Message::LoginName { name: "x".into() }).await.unwrap();
        peer.send(&Message::Heartbeat { timestamp: 42 }).await.unwrap();

        let ack = peer.recv().await.unwrap().unwrap();
        assert_eq!(ack.message, Message::HeartbeatAck { timestamp: 42 });
        settle().await;

        let messages = recorder.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, id);
    }

    #[tokio::test]
    async fn test_close_flushes_queue_without_error_callback() {
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn TransportListener> = recorder.clone();
        let transport = Transport::new(Arc::downgrade(&as_listener));
        let (id, mut peer) = served_pair(&transport).await;

        transport.send(id, Message::LoginRejected { reason: "no".into() }).unwrap();
        transport.close(id, "no");
        assert!(!transport.is_open(id));
        assert!(transport.send(id, Message::Heartbeat { timestamp: 0 }).is_err());

        let first = peer.recv().await.unwrap().unwrap();
        assert_eq!(first.message, Message::LoginRejected { reason: "no".into() });
        let second = peer.recv().await.unwrap().unwrap();
        assert_eq!(second.message, Message::Disconnect { reason: "no".into() });

        settle().await;
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_error() {
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn TransportListener> = recorder.clone();
        let transport = Transport::new(Arc::downgrade(&as_listener));
        let (id, peer) = served_pair(&transport).await;

        drop(peer);
        settle().await;
        assert_eq!(*recorder.errors.lock(), vec![id]);
        assert!(transport.is_empty());
    }
}
