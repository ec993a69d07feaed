//! Per-commitment secrets (BOLT-3 "shachain").
//!
//! Secrets are generated from a 32-byte seed at a 48-bit index. A secret at
//! index `I` can derive every secret at an index that shares `I`'s prefix
//! and has more trailing ones, so a receiver only needs to keep 49 secrets
//! to reconstruct any secret it has been given.

use crate::CryptoError;
use crate::hash::sha256;
use serde::{Deserialize, Serialize};

/// Number of slots in the compact store (one per trailing-zero count)
const SECRET_SLOTS: usize = 49;

/// One past the highest valid index
const INDEX_LIMIT: u64 = 1 << 48;

fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
    let mut res = secret;
    for i in 0..bits {
        let bitpos = bits - 1 - i;
        if idx & (1 << bitpos) == (1 << bitpos) {
            res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
            res = sha256(&res);
        }
    }
    res
}

/// Build the commitment secret for `idx` from `seed`.
#[must_use]
pub fn build_commitment_secret(seed: &[u8; 32], idx: u64) -> [u8; 32] {
    derive_secret(*seed, 48, idx)
}

/// Compact store of the counterparty's revealed commitment secrets.
///
/// Secrets must be provided in strictly descending index order, which is
/// how they are revealed as commitments are revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterpartyCommitmentSecrets {
    old_secrets: Vec<([u8; 32], u64)>,
}

impl Default for CounterpartyCommitmentSecrets {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterpartyCommitmentSecrets {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            old_secrets: vec![([0u8; 32], INDEX_LIMIT); SECRET_SLOTS],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn place_secret(idx: u64) -> u8 {
        for i in 0..48 {
            if idx & (1 << i) == (1 << i) {
                return i as u8;
            }
        }
        48
    }

    /// Lowest index stored so far, or `2^48` if empty.
    #[must_use]
    pub fn get_min_seen_secret(&self) -> u64 {
        self.old_secrets
            .iter()
            .map(|&(_, idx)| idx)
            .min()
            .unwrap_or(INDEX_LIMIT)
    }

    /// Store a newly revealed secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InconsistentSecret`] if the secret cannot
    /// derive the secrets already stored below it.
    pub fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), CryptoError> {
        let pos = Self::place_secret(idx);
        for i in 0..pos as usize {
            let (old_secret, old_idx) = self.old_secrets[i];
            if derive_secret(secret, pos, old_idx) != old_secret {
                return Err(CryptoError::InconsistentSecret(idx));
            }
        }
        if self.get_min_seen_secret() <= idx {
            return Ok(());
        }
        self.old_secrets[pos as usize] = (secret, idx);
        Ok(())
    }

    /// Reconstruct the secret at `idx`, if it has been revealed.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
        for (i, &(secret, stored_idx)) in self.old_secrets.iter().enumerate() {
            if idx & !((1u64 << i) - 1) == stored_idx {
                return Some(derive_secret(secret, i as u8, idx));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_from_zero_seed() {
        let secret = build_commitment_secret(&[0u8; 32], 281_474_976_710_655);
        assert_eq!(
            hex::encode(secret),
            "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"
        );
    }

    #[test]
    fn test_generate_from_ff_seed() {
        let secret = build_commitment_secret(&[0xff; 32], 281_474_976_710_655);
        assert_eq!(
            hex::encode(secret),
            "7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc"
        );
    }

    #[test]
    fn test_store_accepts_descending_secrets() {
        let seed = [0x55u8; 32];
        let mut store = CounterpartyCommitmentSecrets::new();
        let top = INDEX_LIMIT - 1;
        for n in 0..100 {
            let idx = top - n;
            store
                .provide_secret(idx, build_commitment_secret(&seed, idx))
                .unwrap();
        }
        assert_eq!(store.get_min_seen_secret(), top - 99);
        for n in 0..100 {
            let idx = top - n;
            assert_eq!(
                store.get_secret(idx),
                Some(build_commitment_secret(&seed, idx))
            );
        }
        assert_eq!(store.get_secret(top - 100), None);
    }

    #[test]
    fn test_store_rejects_foreign_secret() {
        let mut store = CounterpartyCommitmentSecrets::new();
        let top = INDEX_LIMIT - 1;
        store
            .provide_secret(top, build_commitment_secret(&[1u8; 32], top))
            .unwrap();
        // top - 1 has a trailing zero and must derive `top`
        let result = store.provide_secret(top - 1, build_commitment_secret(&[2u8; 32], top - 1));
        assert!(matches!(result, Err(CryptoError::InconsistentSecret(_))));
    }

    #[test]
    fn test_empty_store() {
        let store = CounterpartyCommitmentSecrets::default();
        assert_eq!(store.get_min_seen_secret(), INDEX_LIMIT);
        assert_eq!(store.get_secret(5), None);
    }
}
