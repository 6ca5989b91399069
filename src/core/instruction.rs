//! The Instruction payload unit exchanged by the upper layer.
//!
//! The transport treats the payload as opaque; the four sequence fields are
//! read only for observability. Canonical wire format (before compression):
//!
//! ```text
//! +0   protocol version (1 byte)
//! +1   old_num        (8 bytes BE64)
//! +9   new_num        (8 bytes BE64)
//! +17  ack_num        (8 bytes BE64)
//! +25  throwaway_num  (8 bytes BE64)
//! +33  payload        (variable)
//! ```

use thiserror::Error;

use crate::core::constants::PROTOCOL_VERSION;

/// Header size in bytes (version byte + 4 x u64).
pub const INSTRUCTION_HEADER_SIZE: usize = 1 + 4 * 8;

/// One upper-layer message unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instruction {
    /// State number the payload diff was computed from.
    pub old_num: u64,
    /// State number the payload diff produces.
    pub new_num: u64,
    /// Highest peer state number acknowledged by the sender.
    pub ack_num: u64,
    /// State numbers below this will never be referenced again.
    pub throwaway_num: u64,
    /// Opaque body.
    pub payload: Vec<u8>,
}

impl Instruction {
    /// Encode to the canonical wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INSTRUCTION_HEADER_SIZE + self.payload.len());
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&self.old_num.to_be_bytes());
        buf.extend_from_slice(&self.new_num.to_be_bytes());
        buf.extend_from_slice(&self.ack_num.to_be_bytes());
        buf.extend_from_slice(&self.throwaway_num.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from the canonical wire form.
    pub fn parse(data: &[u8]) -> Result<Self, InstructionError> {
        if data.len() < INSTRUCTION_HEADER_SIZE {
            return Err(InstructionError::TooShort {
                expected: INSTRUCTION_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(InstructionError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: data[0],
            });
        }

        let word = |i: usize| u64::from_be_bytes(data[i..i + 8].try_into().unwrap());

        Ok(Instruction {
            old_num: word(1),
            new_num: word(9),
            ack_num: word(17),
            throwaway_num: word(25),
            payload: data[INSTRUCTION_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Instruction encoding/decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstructionError {
    /// Input data is shorter than the fixed header.
    #[error("instruction too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Protocol version byte does not match ours.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build speaks.
        expected: u8,
        /// Version found on the wire.
        actual: u8,
    },
}
