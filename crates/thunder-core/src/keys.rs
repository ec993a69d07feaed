//! Key material: the node key, per-channel signers, and sweepable outputs.
//!
//! [`KeysManager`] derives everything from one 32-byte seed:
//!
//! ```text
//! seed --bip32--> m/0'  node secret
//!             \-> m/1'  destination (P2WPKH) key
//!             \-> m/2'  shutdown key
//!             \-> m/3'  channel master --HMAC(counter, start time)--> channel seed
//!             \-> m/4'  random-bytes master
//! ```
//!
//! Each channel seed is stretched into the funding key, the four
//! basepoint secrets and the commitment (shachain) seed by chained
//! HMAC-SHA256 steps.

use crate::commitment::{
    ChannelPublicKeys, CommitmentTransaction, TxCreationKeys, build_htlc_transaction, get_htlc_redeemscript,
    make_funding_redeemscript, p2wpkh_script, p2wsh_sighash,
};
use crate::msgs::UnsignedChannelAnnouncement;
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey, Signing};
use bitcoin::{Network, Script, ScriptBuf, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thunder_crypto::CryptoError;
use thunder_crypto::derivation::{derive_private_key, derive_revocation_private_key};
use thunder_crypto::hash::{hmac_sha256, sha256_concat};
use thunder_crypto::shachain::build_commitment_secret;
use zeroize::Zeroize;

/// Shared signing and verification context
pub(crate) static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// An output we can sweep, with the key material needed to do so
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendableOutputDescriptor {
    /// Pays a script from [`KeysInterface::get_destination_script`] or our
    /// shutdown key; no extra data needed
    StaticOutput {
        /// Where the output is
        outpoint: bitcoin::OutPoint,
        /// The output
        output: TxOut,
    },
    /// Our `to_local` or second-stage HTLC output, spendable with `key`
    /// after `to_self_delay` blocks with witness `[sig, <empty>, witness_script]`
    DynamicOutputP2WSH {
        /// Where the output is
        outpoint: bitcoin::OutPoint,
        /// Delayed payment key for this commitment
        key: SecretKey,
        /// The revokeable script
        witness_script: ScriptBuf,
        /// Required relative lock
        to_self_delay: u16,
        /// The output
        output: TxOut,
    },
    /// Our `to_remote` output on the counterparty's commitment, a plain
    /// P2WPKH of our payment key
    StaticOutputRemotePayment {
        /// Where the output is
        outpoint: bitcoin::OutPoint,
        /// Payment key
        key: SecretKey,
        /// The output
        output: TxOut,
    },
}

/// Supplier of node and channel keys
pub trait KeysInterface: Send + Sync {
    /// The node's identity key
    fn get_node_secret(&self) -> SecretKey;
    /// Script to sweep claimed funds to
    fn get_destination_script(&self) -> ScriptBuf;
    /// Key for cooperative-close outputs
    fn get_shutdown_pubkey(&self) -> PublicKey;
    /// Fresh signer for a new channel
    fn get_channel_keys(&self, inbound: bool, channel_value_satoshis: u64) -> ChannelKeys;
    /// 32 bytes that are never returned twice
    fn get_secure_random_bytes(&self) -> [u8; 32];
}

// ============ Channel Signer ============

/// The secrets of one channel and every signature it produces
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeys {
    funding_key: SecretKey,
    revocation_base_key: SecretKey,
    payment_key: SecretKey,
    delayed_payment_base_key: SecretKey,
    htlc_base_key: SecretKey,
    commitment_seed: [u8; 32],
    channel_value_satoshis: u64,
    pubkeys: ChannelPublicKeys,
}

impl fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKeys")
            .field("pubkeys", &self.pubkeys)
            .field("channel_value_satoshis", &self.channel_value_satoshis)
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelKeys {
    fn drop(&mut self) {
        self.commitment_seed.zeroize();
        self.funding_key.non_secure_erase();
        self.revocation_base_key.non_secure_erase();
        self.payment_key.non_secure_erase();
        self.delayed_payment_base_key.non_secure_erase();
        self.htlc_base_key.non_secure_erase();
    }
}

/// Hash `data` under `key` until the result is a valid secret key
fn secret_from_hmac(key: &[u8], data: &[u8]) -> SecretKey {
    let mut digest = hmac_sha256(key, data);
    loop {
        if let Ok(secret) = SecretKey::from_slice(&digest) {
            return secret;
        }
        digest = hmac_sha256(key, &digest);
    }
}

impl ChannelKeys {
    /// Stretch a 32-byte channel seed into a full key set
    pub fn from_seed<C: Signing>(secp: &Secp256k1<C>, channel_seed: &[u8; 32], channel_value_satoshis: u64) -> Self {
        let commitment_seed = hmac_sha256(channel_seed, b"commitment seed");
        let step = |prev: &[u8], label: &[u8]| secret_from_hmac(channel_seed, &[prev, label].concat());
        let funding_key = step(&commitment_seed, b"funding key");
        let revocation_base_key = step(&funding_key.secret_bytes(), b"revocation base key");
        let payment_key = step(&revocation_base_key.secret_bytes(), b"payment key");
        let delayed_payment_base_key = step(&payment_key.secret_bytes(), b"delayed payment base key");
        let htlc_base_key = step(&delayed_payment_base_key.secret_bytes(), b"HTLC base key");

        let pubkeys = ChannelPublicKeys {
            funding_pubkey: PublicKey::from_secret_key(secp, &funding_key),
            revocation_basepoint: PublicKey::from_secret_key(secp, &revocation_base_key),
            payment_point: PublicKey::from_secret_key(secp, &payment_key),
            delayed_payment_basepoint: PublicKey::from_secret_key(secp, &delayed_payment_base_key),
            htlc_basepoint: PublicKey::from_secret_key(secp, &htlc_base_key),
        };
        Self {
            funding_key,
            revocation_base_key,
            payment_key,
            delayed_payment_base_key,
            htlc_base_key,
            commitment_seed,
            channel_value_satoshis,
            pubkeys,
        }
    }

    /// Our public basepoints
    #[must_use]
    pub fn pubkeys(&self) -> &ChannelPublicKeys {
        &self.pubkeys
    }

    /// Channel capacity these keys were created for
    #[must_use]
    pub fn channel_value_satoshis(&self) -> u64 {
        self.channel_value_satoshis
    }

    /// Our payment key, which `to_remote` outputs on the counterparty's
    /// commitments pay directly
    #[must_use]
    pub fn payment_key(&self) -> &SecretKey {
        &self.payment_key
    }

    /// Per-commitment secret at shachain index `idx`
    #[must_use]
    pub fn commitment_secret(&self, idx: u64) -> [u8; 32] {
        build_commitment_secret(&self.commitment_seed, idx)
    }

    /// Per-commitment point at shachain index `idx`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] in the negligible case the
    /// secret is not a valid scalar.
    pub fn per_commitment_point<C: Signing>(&self, secp: &Secp256k1<C>, idx: u64) -> Result<PublicKey, CryptoError> {
        let secret = SecretKey::from_slice(&self.commitment_secret(idx)).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey::from_secret_key(secp, &secret))
    }

    /// Key for our delayed outputs on our commitment at `per_commitment_point`
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] on an out-of-range tweak.
    pub fn delayed_payment_key<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        per_commitment_point: &PublicKey,
    ) -> Result<SecretKey, CryptoError> {
        derive_private_key(secp, per_commitment_point, &self.delayed_payment_base_key)
    }

    fn sign_funding_input<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        tx: &Transaction,
        counterparty_funding_pubkey: &PublicKey,
    ) -> Result<Signature, CryptoError> {
        let script = make_funding_redeemscript(&self.pubkeys.funding_pubkey, counterparty_funding_pubkey);
        let sighash = p2wsh_sighash(tx, 0, &script, self.channel_value_satoshis)?;
        Ok(secp.sign_ecdsa(&sighash, &self.funding_key))
    }

    /// Sign the counterparty's commitment and its second-stage HTLC
    /// transactions. `to_self_delay` is the delay on the counterparty's
    /// own outputs, which we chose.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if a sighash or key derivation fails.
    pub fn sign_counterparty_commitment<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        commitment: &CommitmentTransaction,
        keys: &TxCreationKeys,
        counterparty_funding_pubkey: &PublicKey,
        to_self_delay: u16,
        feerate_per_kw: u32,
    ) -> Result<(Signature, Vec<Signature>), CryptoError> {
        let commitment_sig = self.sign_funding_input(secp, &commitment.tx, counterparty_funding_pubkey)?;
        let txid = commitment.tx.compute_txid();
        let htlc_key = derive_private_key(secp, &keys.per_commitment_point, &self.htlc_base_key)?;

        let mut htlc_sigs = Vec::new();
        for htlc in commitment.untrimmed_htlcs() {
            let htlc_tx = build_htlc_transaction(
                &txid,
                feerate_per_kw,
                to_self_delay,
                htlc,
                &keys.broadcaster_delayed_payment_key,
                &keys.revocation_key,
            );
            let script = get_htlc_redeemscript(htlc, keys);
            let sighash = p2wsh_sighash(&htlc_tx, 0, &script, htlc.amount_msat / 1000)?;
            htlc_sigs.push(secp.sign_ecdsa(&sighash, &htlc_key));
        }
        Ok((commitment_sig, htlc_sigs))
    }

    /// Sign our own commitment so it can be broadcast
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if the sighash cannot be computed.
    pub fn sign_holder_commitment<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        tx: &Transaction,
        counterparty_funding_pubkey: &PublicKey,
    ) -> Result<Signature, CryptoError> {
        self.sign_funding_input(secp, tx, counterparty_funding_pubkey)
    }

    /// Sign a cooperative closing transaction
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if the sighash cannot be computed.
    pub fn sign_closing_transaction<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        tx: &Transaction,
        counterparty_funding_pubkey: &PublicKey,
    ) -> Result<Signature, CryptoError> {
        self.sign_funding_input(secp, tx, counterparty_funding_pubkey)
    }

    /// Sign an input spending an HTLC output with our HTLC key for the
    /// commitment at `per_commitment_point`. Covers second-stage
    /// transactions on our commitments and direct claims on the
    /// counterparty's.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if a sighash or key derivation fails.
    pub fn sign_htlc_transaction<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        tx: &Transaction,
        input: usize,
        witness_script: &Script,
        amount_sat: u64,
        per_commitment_point: &PublicKey,
    ) -> Result<Signature, CryptoError> {
        let key = derive_private_key(secp, per_commitment_point, &self.htlc_base_key)?;
        let sighash = p2wsh_sighash(tx, input, witness_script, amount_sat)?;
        Ok(secp.sign_ecdsa(&sighash, &key))
    }

    /// Sign an input of a justice transaction spending a revoked output
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if a sighash or key derivation fails.
    pub fn sign_justice_transaction<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        tx: &Transaction,
        input: usize,
        amount_sat: u64,
        per_commitment_secret: &SecretKey,
        witness_script: &Script,
    ) -> Result<Signature, CryptoError> {
        let key = derive_revocation_private_key(secp, per_commitment_secret, &self.revocation_base_key)?;
        let sighash = p2wsh_sighash(tx, input, witness_script, amount_sat)?;
        Ok(secp.sign_ecdsa(&sighash, &key))
    }

    /// Our `bitcoin_signature` for a channel announcement
    pub fn sign_channel_announcement<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        msg: &UnsignedChannelAnnouncement,
    ) -> Signature {
        secp.sign_ecdsa(&msg.signing_message(), &self.funding_key)
    }
}

// ============ Keys Manager ============

/// Seed-derived [`KeysInterface`]
pub struct KeysManager {
    secp: Secp256k1<bitcoin::secp256k1::All>,
    node_secret: SecretKey,
    destination_script: ScriptBuf,
    shutdown_pubkey: PublicKey,
    channel_master: [u8; 32],
    rand_master: [u8; 32],
    unique_start: [u8; 32],
    channel_child_index: AtomicU64,
    rand_bytes_index: AtomicU64,
}

impl fmt::Debug for KeysManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysManager")
            .field("shutdown_pubkey", &self.shutdown_pubkey)
            .finish_non_exhaustive()
    }
}

impl KeysManager {
    /// Derive a key manager from `seed`.
    ///
    /// The starting time must differ between restarts that reuse a seed so
    /// channel keys are never handed out twice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if BIP-32 derivation
    /// fails for this seed.
    pub fn new(
        seed: &[u8; 32],
        network: Network,
        starting_time_secs: u64,
        starting_time_nanos: u32,
    ) -> Result<Self, CryptoError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed).map_err(|_| CryptoError::KeyDerivationFailed)?;
        let child = |idx: u32| -> Result<SecretKey, CryptoError> {
            let number = ChildNumber::from_hardened_idx(idx).map_err(|_| CryptoError::KeyDerivationFailed)?;
            Ok(master
                .derive_priv(&secp, &[number])
                .map_err(|_| CryptoError::KeyDerivationFailed)?
                .private_key)
        };

        let node_secret = child(0)?;
        let destination_key = PublicKey::from_secret_key(&secp, &child(1)?);
        let shutdown_pubkey = PublicKey::from_secret_key(&secp, &child(2)?);
        let channel_master = child(3)?.secret_bytes();
        let rand_master = child(4)?.secret_bytes();
        let unique_start = sha256_concat(&[
            seed,
            &starting_time_secs.to_be_bytes(),
            &starting_time_nanos.to_be_bytes(),
        ]);

        Ok(Self {
            destination_script: p2wpkh_script(&destination_key),
            secp,
            node_secret,
            shutdown_pubkey,
            channel_master,
            rand_master,
            unique_start,
            channel_child_index: AtomicU64::new(0),
            rand_bytes_index: AtomicU64::new(0),
        })
    }
}

impl Drop for KeysManager {
    fn drop(&mut self) {
        self.channel_master.zeroize();
        self.rand_master.zeroize();
        self.node_secret.non_secure_erase();
    }
}

impl KeysInterface for KeysManager {
    fn get_node_secret(&self) -> SecretKey {
        self.node_secret
    }

    fn get_destination_script(&self) -> ScriptBuf {
        self.destination_script.clone()
    }

    fn get_shutdown_pubkey(&self) -> PublicKey {
        self.shutdown_pubkey
    }

    fn get_channel_keys(&self, _inbound: bool, channel_value_satoshis: u64) -> ChannelKeys {
        let index = self.channel_child_index.fetch_add(1, Ordering::AcqRel);
        let channel_seed = hmac_sha256(&self.channel_master, &[&index.to_be_bytes()[..], &self.unique_start].concat());
        ChannelKeys::from_seed(&self.secp, &channel_seed, channel_value_satoshis)
    }

    fn get_secure_random_bytes(&self) -> [u8; 32] {
        let index = self.rand_bytes_index.fetch_add(1, Ordering::AcqRel);
        hmac_sha256(&self.rand_master, &[&index.to_be_bytes()[..], &self.unique_start].concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::{CommitmentTxParams, HTLCOutputInCommitment, build_commitment_transaction};
    use crate::types::PaymentHash;

    fn manager(time: u64) -> KeysManager {
        KeysManager::new(&[42u8; 32], Network::Regtest, time, 0).unwrap()
    }

    #[test]
    fn test_deterministic_node_key() {
        let a = manager(1);
        let b = manager(2);
        assert_eq!(a.get_node_secret(), b.get_node_secret());
        assert_eq!(a.get_destination_script(), b.get_destination_script());
        assert!(a.get_destination_script().is_p2wpkh());
    }

    #[test]
    fn test_channel_keys_unique() {
        let a = manager(1);
        let k1 = a.get_channel_keys(false, 100_000);
        let k2 = a.get_channel_keys(false, 100_000);
        assert_ne!(k1.pubkeys(), k2.pubkeys());

        // Same seed, different start time: no key reuse across restarts
        let b = manager(2);
        assert_ne!(b.get_channel_keys(false, 100_000).pubkeys(), k1.pubkeys());
    }

    #[test]
    fn test_random_bytes_never_repeat() {
        let a = manager(1);
        assert_ne!(a.get_secure_random_bytes(), a.get_secure_random_bytes());
    }

    #[test]
    fn test_per_commitment_point_matches_secret() {
        let secp = Secp256k1::new();
        let keys = manager(1).get_channel_keys(true, 50_000);
        let idx = crate::commitment::INITIAL_COMMITMENT_NUMBER - 3;
        let secret = SecretKey::from_slice(&keys.commitment_secret(idx)).unwrap();
        assert_eq!(
            keys.per_commitment_point(&secp, idx).unwrap(),
            PublicKey::from_secret_key(&secp, &secret)
        );
    }

    #[test]
    fn test_counterparty_commitment_signatures_verify() {
        let secp = Secp256k1::new();
        let ours = manager(1).get_channel_keys(false, 1_000_000);
        let theirs = manager(9).get_channel_keys(true, 1_000_000);

        let pcp = theirs.per_commitment_point(&secp, crate::commitment::INITIAL_COMMITMENT_NUMBER).unwrap();
        let keys = TxCreationKeys::derive(&secp, &pcp, theirs.pubkeys(), ours.pubkeys()).unwrap();
        let params = CommitmentTxParams {
            commitment_number: 0,
            obscure_factor: 0,
            funding_outpoint: bitcoin::OutPoint::null(),
            keys: &keys,
            countersignatory_payment_point: &ours.pubkeys().payment_point,
            to_self_delay: 144,
            dust_limit_sat: 546,
            feerate_per_kw: 253,
            broadcaster_is_opener: false,
            broadcaster_value_msat: 400_000_000,
            countersignatory_value_msat: 590_000_000,
        };
        let htlc = HTLCOutputInCommitment {
            offered: true,
            amount_msat: 10_000_000,
            cltv_expiry: 500,
            payment_hash: PaymentHash([7; 32]),
            transaction_output_index: None,
        };
        let commitment = build_commitment_transaction(&params, vec![htlc]);

        let (sig, htlc_sigs) = ours
            .sign_counterparty_commitment(&secp, &commitment, &keys, &theirs.pubkeys().funding_pubkey, 144, 253)
            .unwrap();
        assert_eq!(htlc_sigs.len(), 1);

        let script = make_funding_redeemscript(&ours.pubkeys().funding_pubkey, &theirs.pubkeys().funding_pubkey);
        let sighash = p2wsh_sighash(&commitment.tx, 0, &script, 1_000_000).unwrap();
        secp.verify_ecdsa(&sighash, &sig, &ours.pubkeys().funding_pubkey).unwrap();
    }
}
