//! Nonce construction.
//!
//! The AEAD nonce is 12 bytes:
//!
//! ```text
//! bytes[0..4]  = 0x00000000 (zero padding, never transmitted)
//! bytes[4..12] = direction_seq, big-endian
//! ```
//!
//! `direction_seq` packs the packet direction into bit 63 (1 = to-client)
//! and the 63-bit sequence below it. Only the 8-byte tail is sent on the
//! wire; the receiver restores the zero padding.

use crate::core::constants::{AEAD_NONCE_SIZE, NONCE_TAIL_SIZE};

const DIRECTION_MASK: u64 = 1 << 63;
const SEQUENCE_MASK: u64 = !DIRECTION_MASK;

/// Packet direction, encoded in the top bit of the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server (bit 63 = 0).
    ToServer,
    /// Server to client (bit 63 = 1).
    ToClient,
}

impl Direction {
    /// Recover the direction from a direction_seq value.
    pub fn from_seq(direction_seq: u64) -> Self {
        if direction_seq & DIRECTION_MASK == 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// Apply this direction to a bare sequence number.
    pub fn apply_to_seq(self, seq: u64) -> u64 {
        match self {
            Direction::ToServer => seq & SEQUENCE_MASK,
            Direction::ToClient => seq | DIRECTION_MASK,
        }
    }
}

/// A 12-byte AEAD nonce wrapping a direction_seq value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; AEAD_NONCE_SIZE]);

impl Nonce {
    /// Build a nonce from a direction_seq value.
    pub fn new(direction_seq: u64) -> Self {
        let mut bytes = [0u8; AEAD_NONCE_SIZE];
        bytes[4..].copy_from_slice(&direction_seq.to_be_bytes());
        Nonce(bytes)
    }

    /// Restore a nonce from the 8-byte tail at the front of a wire message.
    pub fn from_wire_prefix(bytes: &[u8]) -> Option<Self> {
        let tail: [u8; NONCE_TAIL_SIZE] = bytes.get(..NONCE_TAIL_SIZE)?.try_into().ok()?;
        let mut full = [0u8; AEAD_NONCE_SIZE];
        full[4..].copy_from_slice(&tail);
        Some(Nonce(full))
    }

    /// The full direction_seq value.
    pub fn val(&self) -> u64 {
        u64::from_be_bytes(self.0[4..].try_into().unwrap())
    }

    /// The sequence number without the direction bit.
    pub fn seq(&self) -> u64 {
        self.val() & SEQUENCE_MASK
    }

    /// The direction encoded in bit 63.
    pub fn direction(&self) -> Direction {
        Direction::from_seq(self.val())
    }

    /// The full 12 bytes, for the AEAD.
    pub fn as_bytes(&self) -> &[u8; AEAD_NONCE_SIZE] {
        &self.0
    }

    /// The 8 bytes that travel on the wire.
    pub fn tail_bytes(&self) -> &[u8] {
        &self.0[4..]
    }
}
