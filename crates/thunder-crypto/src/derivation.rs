//! BOLT-3 key derivation.
//!
//! Every commitment transaction uses keys tweaked by that commitment's
//! per-commitment point, so a key revealed for one commitment tells an
//! observer nothing about the others:
//!
//! ```text
//! pubkey     = basepoint + SHA256(per_commitment_point || basepoint) * G
//! privkey    = basepoint_secret + SHA256(per_commitment_point || basepoint)
//!
//! revocationpubkey = revocation_basepoint * SHA256(revocation_basepoint || per_commitment_point)
//!                  + per_commitment_point * SHA256(per_commitment_point || revocation_basepoint)
//! ```

use crate::CryptoError;
use crate::hash::sha256_concat;
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification};

fn scalar(bytes: [u8; 32]) -> Result<Scalar, CryptoError> {
    Scalar::from_be_bytes(bytes).map_err(|_| CryptoError::KeyDerivationFailed)
}

/// Derive a per-commitment public key from a basepoint.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if the tweak is out of range.
pub fn derive_public_key<C: Verification>(
    secp: &Secp256k1<C>,
    per_commitment_point: &PublicKey,
    base_point: &PublicKey,
) -> Result<PublicKey, CryptoError> {
    let tweak = sha256_concat(&[&per_commitment_point.serialize(), &base_point.serialize()]);
    Ok(base_point.add_exp_tweak(secp, &scalar(tweak)?)?)
}

/// Derive the private key matching [`derive_public_key`].
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if the tweak is out of range.
pub fn derive_private_key<C: Signing>(
    secp: &Secp256k1<C>,
    per_commitment_point: &PublicKey,
    base_secret: &SecretKey,
) -> Result<SecretKey, CryptoError> {
    let base_point = PublicKey::from_secret_key(secp, base_secret);
    let tweak = sha256_concat(&[&per_commitment_point.serialize(), &base_point.serialize()]);
    Ok(base_secret.add_tweak(&scalar(tweak)?)?)
}

/// Derive the revocation public key for a commitment.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if a tweak is out of range.
pub fn derive_revocation_public_key<C: Verification>(
    secp: &Secp256k1<C>,
    per_commitment_point: &PublicKey,
    revocation_base_point: &PublicKey,
) -> Result<PublicKey, CryptoError> {
    let pcp = per_commitment_point.serialize();
    let rbp = revocation_base_point.serialize();
    let rev_append_commit = sha256_concat(&[&rbp, &pcp]);
    let commit_append_rev = sha256_concat(&[&pcp, &rbp]);

    let countersignatory = revocation_base_point.mul_tweak(secp, &scalar(rev_append_commit)?)?;
    let broadcaster = per_commitment_point.mul_tweak(secp, &scalar(commit_append_rev)?)?;
    Ok(countersignatory.combine(&broadcaster)?)
}

/// Derive the revocation private key once the per-commitment secret is known.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if a tweak is out of range.
pub fn derive_revocation_private_key<C: Signing>(
    secp: &Secp256k1<C>,
    per_commitment_secret: &SecretKey,
    revocation_base_secret: &SecretKey,
) -> Result<SecretKey, CryptoError> {
    let pcp = PublicKey::from_secret_key(secp, per_commitment_secret).serialize();
    let rbp = PublicKey::from_secret_key(secp, revocation_base_secret).serialize();
    let rev_append_commit = sha256_concat(&[&rbp, &pcp]);
    let commit_append_rev = sha256_concat(&[&pcp, &rbp]);

    let countersignatory = revocation_base_secret.mul_tweak(&scalar(rev_append_commit)?)?;
    let broadcaster = per_commitment_secret.mul_tweak(&scalar(commit_append_rev)?)?;
    Ok(countersignatory.add_tweak(&Scalar::from(broadcaster))?)
}
