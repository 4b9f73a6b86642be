//! Login conversations
//!
//! Both sides of the handshake are explicit state machines fed one received
//! message at a time. They never touch sockets; the caller sends whatever a
//! step asks for, which keeps them independent of the transport's threading.

use std::net::SocketAddr;
use std::sync::Arc;

use super::{is_valid_mac_hash, CredentialsProvider, LoginError, LoginResult, LoginValidator};
use crate::node::Node;
use crate::protocol::{Message, Properties};

pub const INVALID_MAC_HASH: &str = "Invalid MAC address hash";
pub const UNEXPECTED_LOGIN_MESSAGE: &str = "Unexpected message during login";

/// Session-level admission policy consulted by the server conversation
pub trait Admission: Send + Sync {
    /// Pick (and reserve) the name a login from `remote` will be admitted under
    fn assign_name(&self, requested: &str, remote: SocketAddr) -> String;

    /// Reason to refuse this player regardless of credentials, e.g. a ban
    fn denial_reason(&self, name: &str, mac_hash: &str, remote: SocketAddr) -> Option<String>;
}

/// Server-side login progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLoginState {
    /// Raw socket, waiting for the client to name itself
    AwaitingName,
    ChallengeSent,
    Validating,
    Admitted,
    Rejected,
}

/// What the server must do after feeding a message to the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLoginStep {
    /// Send this message and stay quarantined
    Reply(Message),
    /// Promote the channel into the routing table
    Admit { name: String, mac_hash: String },
    /// Send the reason and close the channel
    Reject { reason: String },
}

/// Server half of the admission handshake for one connection
pub struct ServerConversation {
    remote: SocketAddr,
    validator: Arc<dyn LoginValidator>,
    state: ServerLoginState,
    name: Option<String>,
    challenge: Properties,
}

impl ServerConversation {
    pub fn new(remote: SocketAddr, validator: Arc<dyn LoginValidator>) -> Self {
        Self {
            remote,
            validator,
            state: ServerLoginState::AwaitingName,
            name: None,
            challenge: Properties::new(),
        }
    }

    pub fn state(&self) -> ServerLoginState {
        self.state
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Name reserved for this login, once the client has named itself
    pub fn assigned_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Advance the handshake with a message received from the client
    pub fn handle(&mut self, message: Message, admission: &dyn Admission) -> ServerLoginStep {
        match (self.state, message) {
            (ServerLoginState::AwaitingName, Message::LoginName { name }) => {
                let assigned = admission.assign_name(&name, self.remote);
                if assigned != name {
                    tracing::debug!("Login from {} asked for '{}', offering '{}'", self.remote, name, assigned);
                }
                self.challenge = self.validator.challenge_properties(&assigned, self.remote);
                self.name = Some(assigned);
                self.state = ServerLoginState::ChallengeSent;
                ServerLoginStep::Reply(Message::Challenge {
                    properties: self.challenge.clone(),
                })
            }
            (ServerLoginState::ChallengeSent, Message::ChallengeResponse { properties, mac_hash }) => {
                self.state = ServerLoginState::Validating;
                let name = self.name.clone().unwrap_or_default();
                match self.validate(&name, &properties, &mac_hash, admission) {
                    Some(reason) => self.reject(reason),
                    None => {
                        self.state = ServerLoginState::Admitted;
                        ServerLoginStep::Admit { name, mac_hash }
                    }
                }
            }
            (state, other) => {
                tracing::debug!(
                    "Unexpected {:#04x} from {} in login state {:?}",
                    other.type_id(),
                    self.remote,
                    state
                );
                self.reject(UNEXPECTED_LOGIN_MESSAGE.to_string())
            }
        }
    }

    fn validate(
        &self,
        name: &str,
        response: &Properties,
        mac_hash: &str,
        admission: &dyn Admission,
    ) -> Option<String> {
        if !is_valid_mac_hash(mac_hash) {
            return Some(INVALID_MAC_HASH.to_string());
        }
        if let Some(reason) = admission.denial_reason(name, mac_hash, self.remote) {
            return Some(reason);
        }
        self.validator
            .verify(&self.challenge, response, name, mac_hash, self.remote)
    }

    fn reject(&mut self, reason: String) -> ServerLoginStep {
        self.state = ServerLoginState::Rejected;
        ServerLoginStep::Reject { reason }
    }
}

/// Client-side login progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLoginState {
    RawSocket,
    NameSent,
    CredentialsSent,
    Admitted,
    Rejected,
}

/// Identities resolved by a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// This client as the server perceives it
    pub local_node: Node,
    pub server_node: Node,
}

/// What the client must do after feeding a message to the conversation
#[derive(Debug, Clone)]
pub enum ClientLoginStep {
    Send(Message),
    Done(LoginOutcome),
}

/// Client half of the admission handshake
pub struct ClientConversation {
    requested_name: String,
    mac_hash: String,
    credentials: Arc<dyn CredentialsProvider>,
    state: ClientLoginState,
}

impl ClientConversation {
    pub fn new(
        requested_name: impl Into<String>,
        mac_hash: impl Into<String>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            requested_name: requested_name.into(),
            mac_hash: mac_hash.into(),
            credentials,
            state: ClientLoginState::RawSocket,
        }
    }

    pub fn state(&self) -> ClientLoginState {
        self.state
    }

    /// First frame of the handshake
    pub fn start(&mut self) -> LoginResult<Message> {
        if self.state != ClientLoginState::RawSocket {
            return Err(LoginError::Finished);
        }
        self.state = ClientLoginState::NameSent;
        Ok(Message::LoginName {
            name: self.requested_name.clone(),
        })
    }

    /// Advance the handshake with a message received from the server
    pub fn handle(&mut self, message: Message) -> LoginResult<ClientLoginStep> {
        match (self.state, message) {
            (ClientLoginState::NameSent, Message::Challenge { properties }) => {
                self.state = ClientLoginState::CredentialsSent;
                Ok(ClientLoginStep::Send(Message::ChallengeResponse {
                    properties: self.credentials.respond(&properties),
                    mac_hash: self.mac_hash.clone(),
                }))
            }
            (ClientLoginState::CredentialsSent, Message::LoginAccepted {
                assigned_name,
                client_address,
                server_node,
            }) => {
                self.state = ClientLoginState::Admitted;
                Ok(ClientLoginStep::Done(LoginOutcome {
                    local_node: Node::from_socket_addr(assigned_name, client_address),
                    server_node,
                }))
            }
            (ClientLoginState::NameSent | ClientLoginState::CredentialsSent, Message::LoginRejected { reason }) => {
                self.state = ClientLoginState::Rejected;
                Err(LoginError::Rejected(reason))
            }
            (ClientLoginState::Admitted | ClientLoginState::Rejected, _) => Err(LoginError::Finished),
            (_, Message::Disconnect { .. }) => {
                self.state = ClientLoginState::Rejected;
                Err(LoginError::Closed)
            }
            (_, other) => {
                self.state = ClientLoginState::Rejected;
                Err(LoginError::UnexpectedMessage(format!("{:#04x}", other.type_id())))
            }
        }
    }
}
