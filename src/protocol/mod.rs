//! Protocol module - Defines the wire protocol for NodeNet communication
//!
//! The protocol uses a simple binary format:
//! - 4 bytes magic
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length bincode payload
//!
//! There is no version field at this layer.

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Default port for NodeNet servers
pub const DEFAULT_PORT: u16 = 3300;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x4E, 0x4E, 0x45, 0x54]; // "NNET"
