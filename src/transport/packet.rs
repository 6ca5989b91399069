//! The Packet: plaintext unit carried inside one authenticated message.
//!
//! Plaintext layout:
//!
//! ```text
//! [timestamp: u16 BE][timestamp_reply: u16 BE][payload...]
//! ```
//!
//! Sequence and direction do not appear in the plaintext; they live in the
//! message nonce, which the AEAD binds to the ciphertext.

use crate::core::CryptoError;
use crate::crypto::{Direction, Message, Nonce};

/// One transport packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 63-bit session-unique sequence number.
    pub seq: u64,
    /// Which way this packet travels.
    pub direction: Direction,
    /// Sender clock, milliseconds mod 2^16; 0xFFFF means none.
    pub timestamp: u16,
    /// Echo of the peer's timestamp, corrected for hold time; 0xFFFF means none.
    pub timestamp_reply: u16,
    /// Fragment bytes (UDP) or compressed Instruction bytes (TCP).
    pub payload: Vec<u8>,
}

impl Packet {
    /// Assemble an outgoing packet.
    pub fn new(
        seq: u64,
        direction: Direction,
        timestamp: u16,
        timestamp_reply: u16,
        payload: Vec<u8>,
    ) -> Self {
        Packet {
            seq,
            direction,
            timestamp,
            timestamp_reply,
            payload,
        }
    }

    /// Convert to the message handed to the session for sealing.
    pub fn to_message(&self) -> Message {
        let mut text = Vec::with_capacity(4 + self.payload.len());
        text.extend_from_slice(&self.timestamp.to_be_bytes());
        text.extend_from_slice(&self.timestamp_reply.to_be_bytes());
        text.extend_from_slice(&self.payload);

        Message::new(Nonce::new(self.direction.apply_to_seq(self.seq)), text)
    }

    /// Recover a packet from an opened message.
    pub fn from_message(message: Message) -> Result<Self, CryptoError> {
        if message.text.len() < 4 {
            return Err(CryptoError::TruncatedPacket);
        }

        let timestamp = u16::from_be_bytes([message.text[0], message.text[1]]);
        let timestamp_reply = u16::from_be_bytes([message.text[2], message.text[3]]);

        Ok(Packet {
            seq: message.nonce.seq(),
            direction: message.nonce.direction(),
            timestamp,
            timestamp_reply,
            payload: message.text[4..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let packet = Packet::new(42, Direction::ToClient, 1234, 777, b"frag".to_vec());
        let restored = Packet::from_message(packet.to_message()).unwrap();
        assert_eq!(restored, packet);
    }

    #[test]
    fn test_direction_lands_in_nonce() {
        let packet = Packet::new(9, Direction::ToClient, 0, 0, Vec::new());
        let message = packet.to_message();
        assert_eq!(message.nonce.val() >> 63, 1);
        assert_eq!(message.nonce.seq(), 9);
    }

    #[test]
    fn test_truncated_plaintext_rejected() {
        let message = Message::new(Nonce::new(1), vec![0u8; 3]);
        assert!(matches!(
            Packet::from_message(message),
            Err(CryptoError::TruncatedPacket)
        ));
    }

    #[test]
    fn test_empty_payload_allowed() {
        let packet = Packet::new(0, Direction::ToServer, 1, 2, Vec::new());
        let restored = Packet::from_message(packet.to_message()).unwrap();
        assert!(restored.payload.is_empty());
    }
}
