//! Core types shared by every transport: errors, protocol constants,
//! process-level configuration, and the Instruction payload unit.

mod config;
mod error;
mod instruction;

pub mod constants;

pub use config::{PortRange, TransportMode};
pub use error::{CryptoError, NetworkError, NetworkResult};
pub use instruction::{Instruction, InstructionError, INSTRUCTION_HEADER_SIZE};
