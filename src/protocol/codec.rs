//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization and framing of protocol messages.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

use super::{Message, MAGIC_BYTES};

/// Default maximum message size (10 MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + type(1) + length(4) + sequence(4) = 13 bytes
const HEADER_SIZE: usize = 13;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Type mismatch: header says {header:#04x}, payload is {payload:#04x}")]
    TypeMismatch { header: u8, payload: u8 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Message frame with metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sequence number for ordering
    pub sequence: u32,
    /// The actual message
    pub message: Message,
}

impl Frame {
    pub fn new(sequence: u32, message: Message) -> Self {
        Self { sequence, message }
    }
}

/// Encodes messages into the wire format
pub struct Encoder {
    sequence: u32,
    max_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            sequence: 0,
            max_size,
        }
    }

    /// Encode a message into a buffer
    pub fn encode(&mut self, message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(message)?;

        if payload.len() > self.max_size {
            return Err(CodecError::MessageTooLarge(payload.len(), self.max_size));
        }

        buf.reserve(HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(message.type_id());
        buf.put_u32(payload.len() as u32);
        buf.put_u32(self.sequence);
        buf.put_slice(&payload);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes messages from the wire format
pub struct Decoder {
    state: DecodeState,
    max_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        message_type: u8,
        length: usize,
        sequence: u32,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_size,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let message_type = buf[4];
                    let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                    let sequence = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]);

                    if length > self.max_size {
                        return Err(CodecError::MessageTooLarge(length, self.max_size));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload {
                        message_type,
                        length,
                        sequence,
                    };
                }
                DecodeState::Payload {
                    message_type,
                    length,
                    sequence,
                } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(length);
                    self.state = DecodeState::Header;

                    let message: Message = bincode::deserialize(&payload)?;
                    if message.type_id() != message_type {
                        return Err(CodecError::TypeMismatch {
                            header: message_type,
                            payload: message.type_id(),
                        });
                    }

                    return Ok(Some(Frame::new(sequence, message)));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::protocol::{ChatMessage, MessageEnvelope, Payload};

    fn sample_envelope() -> Message {
        let from = Node::new("alice", "10.0.0.2".parse().unwrap(), 5000);
        Message::Envelope(MessageEnvelope::broadcast(
            from,
            Payload::Chat(ChatMessage::new("lobby", "hello")),
        ))
    }

    #[test]
    fn test_envelope_survives_framing() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        encoder.encode(&sample_envelope(), &mut buf).unwrap();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();

        match frame.message {
            Message::Envelope(env) => {
                assert!(env.is_broadcast());
                assert_eq!(env.from.name(), "alice");
                assert_eq!(env.payload, Payload::Chat(ChatMessage::new("lobby", "hello")));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();

        let messages = vec![
            Message::Heartbeat { timestamp: 12345 },
            Message::LoginName { name: "bob".to_string() },
            sample_envelope(),
        ];

        for msg in &messages {
            encoder.encode(msg, &mut buf).unwrap();
        }

        for i in 0..messages.len() {
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.sequence, i as u32);
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more_data() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut full = BytesMut::new();
        encoder.encode(&sample_envelope(), &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..HEADER_SIZE + 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[HEADER_SIZE + 2..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        assert!(matches!(decoder.decode(&mut buf), Err(CodecError::InvalidMagic)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut encoder = Encoder::with_max_size(8);
        let mut buf = BytesMut::new();
        let result = encoder.encode(&sample_envelope(), &mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_, 8))));
    }
}
