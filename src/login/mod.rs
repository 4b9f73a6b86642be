//! Login module - Admission handshake for new connections
//!
//! A freshly accepted connection is quarantined until it completes the
//! challenge/response exchange. Only then does it enter the routing table.
//!
//! ```text
//!   client                               server
//!     | -- LoginName{name} ----------------> |  AwaitingName
//!     | <--------------- Challenge{props} -- |  ChallengeSent
//!     | -- ChallengeResponse{props, mac} --> |  Validating
//!     | <----- LoginAccepted / Rejected ---- |  Admitted | Rejected
//! ```

mod conversation;
mod mac;
mod naming;
mod validator;

pub use conversation::*;
pub use mac::*;
pub use naming::*;
pub use validator::*;

use thiserror::Error;

/// Login errors, surfaced to the party that initiated the handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("Login rejected: {0}")]
    Rejected(String),

    #[error("Unexpected message during login: {0}")]
    UnexpectedMessage(String),

    #[error("Connection closed during login")]
    Closed,

    #[error("Login already finished")]
    Finished,
}

pub type LoginResult<T> = Result<T, LoginError>;
