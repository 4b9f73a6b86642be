//! Connection handling for NodeNet
//!
//! Manages individual peer connections, including:
//! - Message encoding/decoding
//! - Connection state management
//! - Handles for queueing outbound messages without blocking

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{Decoder, Encoder, Frame, Message};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection established, login not finished
    Quarantined,
    /// Login complete, carrying routed traffic
    Connected,
    /// Connection is closing gracefully
    Closing,
    /// Connection has been closed
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed connection to a remote node
pub struct Connection {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// Protocol encoder
    encoder: Encoder,
    /// Protocol decoder
    decoder: Decoder,
    /// Read buffer
    read_buf: BytesMut,
    /// Write buffer
    write_buf: BytesMut,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, max_message_size: usize) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", remote_addr, e);
        }
        Self {
            remote_addr,
            stream,
            encoder: Encoder::with_max_size(max_message_size),
            decoder: Decoder::with_max_size(max_message_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            state: ConnectionState::Quarantined,
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Mark the login as finished
    pub fn set_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive a message (returns None on a clean close)
    pub async fn recv(&mut self) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Try to receive a message with a timeout
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Frame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection gracefully
    pub async fn close(&mut self, reason: &str) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closing;

        let farewell = self
            .send(&Message::Disconnect {
                reason: reason.to_string(),
            })
            .await;

        self.stream.shutdown().await?;
        self.state = ConnectionState::Closed;

        farewell
    }
}

/// Commands queued for a connection's writer
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Message),
    /// Flush everything queued before, say goodbye and close
    Close(String),
}

/// A handle for queueing messages to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
    rtt_us: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            rtt_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a message. Never blocks.
    pub fn send(&self, message: Message) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(Outbound::Message(message))
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Ask the writer to close after the queued messages
    pub fn close(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.sender.send(Outbound::Close(reason.to_string()));
        }
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the current round-trip time in microseconds
    pub fn rtt_us(&self) -> u64 {
        self.rtt_us.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Update the RTT value
    pub fn update_rtt(&self, rtt_us: u64) {
        self.rtt_us.store(rtt_us, Ordering::SeqCst);
    }
}
