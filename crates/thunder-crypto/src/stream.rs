//! ChaCha20 keystreams for onion packet obfuscation.
//!
//! Onion construction only ever uses a zero nonce: every key is derived
//! fresh per hop and used once.

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};

const ZERO_NONCE: [u8; 12] = [0u8; 12];

/// XOR `data` in place with the ChaCha20 keystream for `key`.
pub fn apply_keystream(key: &[u8; 32], data: &mut [u8]) {
    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(key),
        chacha20::Nonce::from_slice(&ZERO_NONCE),
    );
    cipher.apply_keystream(data);
}

/// Generate `len` bytes of keystream for `key`.
#[must_use]
pub fn keystream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    apply_keystream(key, &mut buf);
    buf
}
