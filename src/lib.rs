//! NodeNet - Peer node messaging for networked game sessions
//!
//! A server admits nodes through a login handshake and routes addressed
//! envelopes between them; clients hold one connection to the server.

pub mod config;
pub mod login;
pub mod moderation;
pub mod network;
pub mod node;
pub mod protocol;

pub use network::{ClientMessenger, Messenger, ServerMessenger};
pub use node::{CorrelationId, Node};

/// Crate version, as reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
