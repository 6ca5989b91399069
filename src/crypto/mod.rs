//! Authenticated encryption for transport packets.
//!
//! A session seals each packet with ChaCha20-Poly1305 under a shared key
//! agreed out of band. The 12-byte AEAD nonce is built from a 64-bit value
//! whose top bit encodes direction and whose low 63 bits are a monotone
//! per-session sequence; only the low 8 bytes travel on the wire. A peer
//! that reflects traffic back at its sender therefore produces a nonce
//! whose direction bit the receive path rejects.

mod nonce;
mod session;

pub use nonce::{Direction, Nonce};
pub use session::{Base64Key, Message, Session};

pub use crate::core::CryptoError;
