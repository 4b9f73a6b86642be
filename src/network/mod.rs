//! Network module - Node messaging over TCP
//!
//! Provides:
//! - Server messenger that admits nodes and routes envelopes between them
//! - Client messenger holding one connection to a server
//! - Channel transport, routing table and listener plumbing

mod client;
mod connection;
mod listeners;
mod routing;
mod server;
mod transport;

pub use client::*;
pub use connection::*;
pub use listeners::*;
pub use routing::*;
pub use server::*;
pub use transport::*;

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::moderation::ModerationError;
use crate::node::Node;
use crate::protocol::Payload;

/// Server messenger errors
#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Cannot remove the local node")]
    CannotRemoveSelf,

    /// An envelope claimed a sender other than the node admitted on its channel
    #[error("Protocol violation on channel {channel}: {admitted} sent as {claimed:?}")]
    ProtocolViolation {
        channel: ChannelId,
        admitted: Node,
        claimed: Option<Node>,
    },

    #[error("No route to {0}")]
    UnknownDestination(Node),

    #[error("Moderation error: {0}")]
    Moderation(#[from] ModerationError),
}

pub type MessengerResult<T> = Result<T, MessengerError>;

/// Common face of server and client messengers
pub trait Messenger: Send + Sync {
    /// Send a payload to one node. Never blocks; an unknown node is ignored.
    fn send(&self, payload: Payload, to: &Node);

    /// Send a payload to every other node
    fn broadcast(&self, payload: Payload);

    fn local_node(&self) -> Node;

    fn server_node(&self) -> Node;

    fn is_connected(&self) -> bool;

    fn is_server(&self) -> bool;

    /// Close everything. Safe to call more than once, from any task.
    fn shutdown(&self);

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>);

    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool;
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
