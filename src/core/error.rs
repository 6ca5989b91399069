//! Error types for the transport layer.

use std::io;

use thiserror::Error;

use crate::transport::CompressionError;

/// Convenience alias for transport results.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key string is not valid unpadded base64.
    #[error("key is not valid base64")]
    InvalidBase64,

    /// Decoded key has the wrong length.
    #[error("key must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length actually decoded.
        actual: usize,
    },

    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted ciphertext).
    #[error("decryption failed")]
    DecryptionFailed,

    /// Message is too short to carry a nonce tail and tag.
    #[error("message too short")]
    MessageTooShort,

    /// Decrypted plaintext is too short for the packet header.
    #[error("truncated packet")]
    TruncatedPacket,

    /// The 63-bit sequence space is exhausted; the session must end.
    #[error("nonce sequence exhausted")]
    SequenceExhausted,
}

/// Errors surfaced to the caller by transport construction and I/O.
///
/// Transient socket conditions (EAGAIN and friends) never appear here: the
/// non-blocking send and receive paths absorb them and report "not ready".
/// Protocol violations in received packets are dropped silently. What
/// remains is configuration mistakes, bind failures, broken sockets, and
/// failures sealing outgoing data.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Bad port specification, address literal, or transport mode.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No port in the requested range could be bound.
    #[error("could not bind {addr} on any port in [{low}..{high}]: {source}")]
    BindFailure {
        /// Address the bind was attempted on.
        addr: String,
        /// Low end of the attempted port range.
        low: u16,
        /// High end of the attempted port range.
        high: u16,
        /// Error from the final attempt.
        source: io::Error,
    },

    /// Unrecoverable socket error; the transport is broken.
    #[error("{context}: {source}")]
    FatalIo {
        /// Syscall or operation that failed.
        context: &'static str,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Crypto error on the send path.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Compression error on the send path.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
}
