//! SHA-256 hashing, HMAC and HKDF.
//!
//! Thin wrappers over `bitcoin::hashes` returning plain byte arrays so
//! callers never have to name the hash newtypes.

use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine, sha256, sha256d};

/// SHA-256 output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute SHA-256 of input data.
#[must_use]
pub fn sha256(data: &[u8]) -> HashOutput {
    sha256::Hash::hash(data).to_byte_array()
}

/// Compute SHA-256 over the concatenation of several slices.
#[must_use]
pub fn sha256_concat(parts: &[&[u8]]) -> HashOutput {
    let mut engine = sha256::Hash::engine();
    for part in parts {
        engine.input(part);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Compute double SHA-256 (the digest gossip signatures commit to).
#[must_use]
pub fn double_sha256(data: &[u8]) -> HashOutput {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Compute HMAC-SHA256.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> HashOutput {
    let mut engine = HmacEngine::<sha256::Hash>::new(key);
    engine.input(data);
    Hmac::<sha256::Hash>::from_engine(engine).to_byte_array()
}

/// HKDF-SHA256 with an empty info string, producing two 32-byte outputs.
///
/// This is the two-output form used by the Noise handshake and key
/// rotation:
/// ```text
/// prk = HMAC(salt, ikm)
/// t1  = HMAC(prk, 0x01)
/// t2  = HMAC(prk, t1 || 0x02)
/// ```
#[must_use]
pub fn hkdf(salt: &[u8; 32], ikm: &[u8]) -> (HashOutput, HashOutput) {
    let prk = hmac_sha256(salt, ikm);
    let t1 = hmac_sha256(&prk, &[1]);

    let mut engine = HmacEngine::<sha256::Hash>::new(&prk);
    engine.input(&t1);
    engine.input(&[2]);
    let t2 = Hmac::<sha256::Hash>::from_engine(engine).to_byte_array();

    (t1, t2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_concat_matches_single() {
        assert_eq!(sha256_concat(&[b"foo", b"bar"]), sha256(b"foobar"));
    }

    #[test]
    fn test_double_sha256() {
        assert_eq!(double_sha256(b"abc"), sha256(&sha256(b"abc")));
    }

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hkdf_outputs_distinct() {
        let (a, b) = hkdf(&[0u8; 32], b"input");
        assert_ne!(a, b);
        assert_eq!(hkdf(&[0u8; 32], b"input"), (a, b));
    }
}
