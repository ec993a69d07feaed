//! ChaCha20-Poly1305 with the Lightning nonce layout.
//!
//! The 96-bit nonce is four zero bytes followed by a 64-bit little-endian
//! counter. Each key is used with a strictly increasing counter, so the
//! caller owns nonce management.

use crate::CryptoError;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};

fn nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt `plaintext` under `key`, binding `ad`. Returns ciphertext || tag.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
pub fn encrypt(
    key: &[u8; 32],
    counter: u64,
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce(counter);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt and authenticate `ciphertext` (ciphertext || tag).
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
pub fn decrypt(
    key: &[u8; 32],
    counter: u64,
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce(counter);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [0x42u8; 32];
        let ct = encrypt(&key, 7, b"ad", b"hello").unwrap();
        assert_eq!(ct.len(), 5 + crate::TAG_SIZE);
        assert_eq!(decrypt(&key, 7, b"ad", &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_counter_fails() {
        let key = [0x42u8; 32];
        let ct = encrypt(&key, 1, b"", b"hello").unwrap();
        assert!(matches!(
            decrypt(&key, 2, b"", &ct),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_ad_fails() {
        let key = [0x42u8; 32];
        let ct = encrypt(&key, 0, b"one", b"hello").unwrap();
        assert!(decrypt(&key, 0, b"two", &ct).is_err());
    }

    #[test]
    fn test_nonce_layout() {
        let n = nonce(0x0102);
        assert_eq!(&n[..4], &[0, 0, 0, 0]);
        assert_eq!(n[4], 0x02);
        assert_eq!(n[5], 0x01);
    }
}
