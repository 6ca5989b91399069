//! Splitting serialized Instructions into datagram-sized fragments.
//!
//! Fragment wire format (the plaintext payload of one UDP packet):
//!
//! ```text
//! [id: u16 BE][fragment_num: u16 BE, final flag in bit 15][contents...]
//! ```
//!
//! All fragments sharing an id reassemble into one compressed serialized
//! Instruction. The assembler keeps exactly one Instruction in flight:
//! a fragment with a newer id discards the partial assembly, and stale
//! ids are ignored.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::Instruction;
use crate::transport::compress::{compress, CompressionError};

const FINAL_FLAG: u16 = 0x8000;
const FRAGMENT_NUM_MASK: u16 = 0x7FFF;

/// One datagram-sized piece of a serialized Instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Which Instruction this fragment belongs to.
    pub id: u16,
    /// Position within the Instruction, starting at 0.
    pub fragment_num: u16,
    /// Whether this is the last fragment.
    pub is_final: bool,
    /// Slice of the compressed serialized Instruction.
    pub contents: Vec<u8>,
}

/// Fragment decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Input shorter than the fragment header.
    #[error("fragment too short: {0} bytes")]
    TooShort(usize),
}

impl Fragment {
    /// Fragment header length (id + fragment_num).
    pub const HEADER_LEN: usize = 4;

    /// Decode a fragment from a decrypted packet payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(FragmentError::TooShort(bytes.len()));
        }

        let id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let num_word = u16::from_be_bytes([bytes[2], bytes[3]]);

        Ok(Fragment {
            id,
            fragment_num: num_word & FRAGMENT_NUM_MASK,
            is_final: num_word & FINAL_FLAG != 0,
            contents: bytes[Self::HEADER_LEN..].to_vec(),
        })
    }

    /// Encode to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let num_word = self.fragment_num | if self.is_final { FINAL_FLAG } else { 0 };

        let mut bytes = Vec::with_capacity(Self::HEADER_LEN + self.contents.len());
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&num_word.to_be_bytes());
        bytes.extend_from_slice(&self.contents);
        bytes
    }
}

/// Splits Instructions into fragments sized for the current MTU.
#[derive(Debug, Default)]
pub struct Fragmenter {
    next_id: u16,
}

impl Fragmenter {
    /// Create a fragmenter.
    pub fn new() -> Self {
        Fragmenter::default()
    }

    /// Serialize, compress, and split one Instruction.
    ///
    /// `fragment_size` bounds the whole fragment including its header. An
    /// empty Instruction still yields one (final) fragment, so heartbeats
    /// make it onto the wire.
    pub fn make_fragments(
        &mut self,
        inst: &Instruction,
        fragment_size: usize,
    ) -> Result<Vec<Fragment>, CompressionError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let body = compress(&inst.serialize())?;
        let chunk_size = fragment_size.saturating_sub(Fragment::HEADER_LEN).max(1);

        let num_chunks = body.len().div_ceil(chunk_size).max(1);
        let fragments = (0..num_chunks)
            .map(|i| {
                let chunk = &body[i * chunk_size..body.len().min((i + 1) * chunk_size)];
                Fragment {
                    id,
                    fragment_num: i as u16,
                    is_final: i == num_chunks - 1,
                    contents: chunk.to_vec(),
                }
            })
            .collect();

        Ok(fragments)
    }
}

/// Reassembles fragments into Instructions, one id at a time.
#[derive(Debug, Default)]
pub struct FragmentAssembly {
    current_id: u16,
    arrived: BTreeMap<u16, Vec<u8>>,
    final_num: Option<u16>,
}

impl FragmentAssembly {
    /// Create an empty assembly.
    pub fn new() -> Self {
        FragmentAssembly::default()
    }

    /// Add one fragment.
    ///
    /// Returns the reassembled (still compressed) Instruction bytes once
    /// every fragment up to the final one has arrived.
    pub fn add_fragment(&mut self, frag: Fragment) -> Option<Vec<u8>> {
        if frag.id > self.current_id {
            self.arrived.clear();
            self.final_num = None;
            self.current_id = frag.id;
        } else if frag.id < self.current_id {
            return None;
        }

        if frag.is_final {
            self.final_num = Some(frag.fragment_num);
        }
        self.arrived.insert(frag.fragment_num, frag.contents);

        self.try_assemble()
    }

    fn try_assemble(&mut self) -> Option<Vec<u8>> {
        let final_num = self.final_num?;
        if self.arrived.len() <= final_num as usize {
            return None;
        }
        if (0..=final_num).any(|num| !self.arrived.contains_key(&num)) {
            return None;
        }

        let mut assembled = Vec::new();
        for num in 0..=final_num {
            assembled.extend_from_slice(&self.arrived[&num]);
        }

        self.arrived.clear();
        self.final_num = None;
        Some(assembled)
    }
}
