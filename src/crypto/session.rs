//! ChaCha20-Poly1305 session: one shared key, direction-tagged nonces.
//!
//! Wire form of a sealed message:
//!
//! ```text
//! [nonce_tail: 8 bytes][ciphertext + tag: variable]
//! ```

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::core::constants::{KEY_SIZE, NONCE_TAIL_SIZE, SESSION_ADDED_BYTES};
use crate::core::CryptoError;
use crate::crypto::nonce::Nonce;

/// A shared session key, exchanged out of band as unpadded base64.
///
/// The key material is zeroized on drop.
#[derive(Clone)]
pub struct Base64Key {
    key: [u8; KEY_SIZE],
}

impl Base64Key {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Base64Key { key }
    }

    /// Decode a key from its printable form.
    pub fn from_printable(s: &str) -> Result<Self, CryptoError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::InvalidBase64)?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Base64Key { key })
    }

    /// The printable form handed to the peer out of band.
    pub fn printable_key(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(self.key)
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl Drop for Base64Key {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// The plaintext unit a session seals: a nonce and the packet bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Direction-tagged nonce; its 8-byte tail travels in clear.
    pub nonce: Nonce,
    /// Packet plaintext.
    pub text: Vec<u8>,
}

impl Message {
    /// Create a message.
    pub fn new(nonce: Nonce, text: Vec<u8>) -> Self {
        Message { nonce, text }
    }
}

/// An authenticated encryption session.
///
/// Owns the per-session 63-bit sequence generator: every outgoing packet
/// draws a unique value from [`Session::unique`], which becomes both the
/// nonce and the receiver's ordering handle.
pub struct Session {
    cipher: ChaCha20Poly1305,
    next_seq: u64,
}

impl Session {
    /// Create a session from a shared key.
    pub fn new(key: &Base64Key) -> Self {
        Session {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            next_seq: 0,
        }
    }

    /// Draw the next unique 63-bit sequence number.
    pub fn unique(&mut self) -> Result<u64, CryptoError> {
        if self.next_seq >> 63 != 0 {
            return Err(CryptoError::SequenceExhausted);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Seal a message into its wire form.
    pub fn encrypt(&self, message: &Message) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = self
            .cipher
            .encrypt(message.nonce.as_bytes().into(), message.text.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut wire = Vec::with_capacity(NONCE_TAIL_SIZE + ciphertext.len());
        wire.extend_from_slice(message.nonce.tail_bytes());
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Open a wire message. Fails on truncation or tag mismatch.
    pub fn decrypt(&self, wire: &[u8]) -> Result<Message, CryptoError> {
        if wire.len() < NONCE_TAIL_SIZE + SESSION_ADDED_BYTES {
            return Err(CryptoError::MessageTooShort);
        }

        let nonce = Nonce::from_wire_prefix(wire).ok_or(CryptoError::MessageTooShort)?;
        let text = self
            .cipher
            .decrypt(nonce.as_bytes().into(), &wire[NONCE_TAIL_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(Message { nonce, text })
    }
}
