//! # THUNDER Crypto
//!
//! Cryptographic primitives for the THUNDER Lightning node core.
//!
//! This crate provides:
//! - BOLT-8 `Noise_XK` handshake and the encrypted transport that follows it
//! - `ChaCha20-Poly1305` AEAD with the counter nonce layout used on the wire
//! - SHA-256 / HMAC / HKDF helpers
//! - BOLT-3 per-commitment secret generation and compact storage (shachain)
//! - BOLT-3 key derivation (per-commitment and revocation keys)
//! - `ChaCha20` keystreams for onion obfuscation
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Key Exchange | ECDH over secp256k1 | SHA-256 of compressed point |
//! | AEAD | ChaCha20-Poly1305 | 96-bit nonce, 64-bit LE counter |
//! | Hash | SHA-256 | |
//! | KDF | HKDF-SHA256 | two 32-byte outputs |
//! | Signatures | ECDSA over secp256k1 | via `bitcoin::secp256k1` |
//! | Stream | ChaCha20 | zero nonce |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod derivation;
pub mod error;
pub mod hash;
pub mod noise;
pub mod random;
pub mod shachain;
pub mod stream;

pub use bitcoin::secp256k1;
pub use error::CryptoError;

/// Compressed secp256k1 public key size
pub const PUBLIC_KEY_SIZE: usize = 33;

/// secp256k1 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// Compact ECDSA signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// SHA-256 output size
pub const SHA256_OUTPUT_SIZE: usize = 32;
