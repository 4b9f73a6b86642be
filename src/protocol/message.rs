//! Protocol message definitions
//!
//! Defines the login handshake frames and the routed message envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::node::Node;

/// Challenge and response property map exchanged during login
pub type Properties = BTreeMap<String, String>;

/// The reserved chat-class payload consulted for mute enforcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Chat channel the line was posted to
    pub channel: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            text: text.into(),
        }
    }
}

/// Routed payload. Everything except chat is opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Chat(ChatMessage),
    Data(Vec<u8>),
}

impl Payload {
    /// The chat message, if this payload was posted to `channel`
    pub fn chat_on(&self, channel: &str) -> Option<&ChatMessage> {
        match self {
            Payload::Chat(chat) if chat.channel == channel => Some(chat),
            _ => None,
        }
    }
}

/// Addressed payload wrapper. `to == None` denotes broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub to: Option<Node>,
    pub from: Node,
    pub payload: Payload,
}

impl MessageEnvelope {
    pub fn unicast(to: Node, from: Node, payload: Payload) -> Self {
        Self {
            to: Some(to),
            from,
            payload,
        }
    }

    pub fn broadcast(from: Node, payload: Payload) -> Self {
        Self {
            to: None,
            from,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Whether this envelope should be delivered at `local`
    pub fn is_addressed_to(&self, local: &Node) -> bool {
        match &self.to {
            None => true,
            Some(to) => to == local,
        }
    }
}

/// All possible protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First frame from a connecting client
    LoginName {
        name: String,
    },

    /// Server challenge for the requested name
    Challenge {
        properties: Properties,
    },

    /// Client answer to the challenge
    ChallengeResponse {
        properties: Properties,
        mac_hash: String,
    },

    /// Admission granted
    LoginAccepted {
        /// Name the server admitted the client under
        assigned_name: String,
        /// Client address as the server sees it
        client_address: SocketAddr,
        server_node: Node,
    },

    /// Admission refused
    LoginRejected {
        reason: String,
    },

    /// Routed traffic
    Envelope(MessageEnvelope),

    /// Heartbeat to keep connection alive
    Heartbeat {
        timestamp: u64,
    },

    /// Response to heartbeat
    HeartbeatAck {
        timestamp: u64,
    },

    /// Graceful disconnect
    Disconnect {
        reason: String,
    },
}

impl Message {
    /// Get the message type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Message::LoginName { .. } => 0x01,
            Message::Challenge { .. } => 0x02,
            Message::ChallengeResponse { .. } => 0x03,
            Message::LoginAccepted { .. } => 0x04,
            Message::LoginRejected { .. } => 0x05,
            Message::Envelope(_) => 0x10,
            Message::Heartbeat { .. } => 0xF0,
            Message::HeartbeatAck { .. } => 0xF1,
            Message::Disconnect { .. } => 0xFE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(name: &str, port: u16) -> Node {
        Node::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_message_type_ids() {
        let msg = Message::Heartbeat { timestamp: 0 };
        assert_eq!(msg.type_id(), 0xF0);
        assert_eq!(Message::LoginRejected { reason: String::new() }.type_id(), 0x05);
    }

    #[test]
    fn test_broadcast_is_addressed_to_everyone() {
        let env = MessageEnvelope::broadcast(node("a", 1), Payload::Data(vec![1]));
        assert!(env.is_broadcast());
        assert!(env.is_addressed_to(&node("b", 2)));
    }

    #[test]
    fn test_unicast_addressing_uses_identity() {
        let env = MessageEnvelope::unicast(node("b", 2), node("a", 1), Payload::Data(vec![]));
        // Same address and port under another name is still the addressee
        assert!(env.is_addressed_to(&node("renamed", 2)));
        assert!(!env.is_addressed_to(&node("b", 3)));
    }

    #[test]
    fn test_chat_on_channel() {
        let payload = Payload::Chat(ChatMessage::new("lobby", "hi"));
        assert!(payload.chat_on("lobby").is_some());
        assert!(payload.chat_on("game").is_none());
        assert!(Payload::Data(vec![]).chat_on("lobby").is_none());
    }
}
