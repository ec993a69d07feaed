//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Handshake act had the wrong length
    #[error("invalid act length: expected {expected}, got {actual}")]
    InvalidActLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Handshake act carried an unknown version byte
    #[error("unknown handshake version: {0}")]
    UnknownVersion(u8),

    /// Noise handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),

    /// Invalid state for operation
    #[error("invalid state for operation")]
    InvalidState,

    /// Transport message exceeds the maximum length
    #[error("message too long: {0} bytes")]
    MessageTooLong(usize),

    /// Key derivation produced an invalid key
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Commitment secret does not match previously stored secrets
    #[error("commitment secret inconsistent with stored secrets at index {0}")]
    InconsistentSecret(u64),

    /// Underlying secp256k1 failure
    #[error("secp256k1: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
}
