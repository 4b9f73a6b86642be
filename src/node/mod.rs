//! Node module - Identity of session participants
//!
//! Provides:
//! - `Node`, the addressable endpoint descriptor
//! - `CorrelationId` for pairing asynchronous requests with responses
//! - Self-address discovery for servers

mod address;
mod correlation;
mod identity;

pub use address::*;
pub use correlation::*;
pub use identity::*;
