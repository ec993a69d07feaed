//! BOLT-3 transaction and script construction.
//!
//! Everything here is a pure function of its inputs; signing lives in
//! [`crate::keys`].
//!
//! ```text
//!   funding output (2-of-2 P2WSH)
//!          |
//!   commitment tx  -- to_local  (revokeable, CSV delayed)
//!          |       -- to_remote (P2WPKH, static remotekey)
//!          |       -- offered HTLCs  --> HTLC-timeout tx --> revokeable
//!          |       -- received HTLCs --> HTLC-success tx --> revokeable
//! ```
//!
//! "Broadcaster" is the side holding the commitment and able to publish
//! it; "countersignatory" is the other side.

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_CSV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_HASH160, OP_IF, OP_NOTIF, OP_PUSHNUM_2, OP_SIZE, OP_SWAP,
};
use bitcoin::hashes::{Hash, hash160, ripemd160};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Secp256k1, Verification};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness, WPubkeyHash};
use serde::{Deserialize, Serialize};
use thunder_crypto::CryptoError;
use thunder_crypto::derivation::{derive_public_key, derive_revocation_public_key};
use thunder_crypto::hash::sha256_concat;

use crate::types::PaymentHash;

/// Secret index of the first commitment; indices count down from here
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// Weight of a commitment transaction with no HTLC outputs
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// Weight added per untrimmed HTLC output
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;
/// Weight of an HTLC-timeout transaction
pub const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;
/// Weight of an HTLC-success transaction
pub const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;

// ============ Keys ============

/// The public basepoints one side of a channel publishes at open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPublicKeys {
    /// Key in the 2-of-2 funding output
    pub funding_pubkey: PublicKey,
    /// Base for revocation keys the *other* side can derive
    pub revocation_basepoint: PublicKey,
    /// Untweaked `to_remote` key (static remotekey)
    pub payment_point: PublicKey,
    /// Base for `to_local` delayed keys
    pub delayed_payment_basepoint: PublicKey,
    /// Base for HTLC keys
    pub htlc_basepoint: PublicKey,
}

/// The per-commitment keys every script in one commitment uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCreationKeys {
    /// The broadcaster's per-commitment point
    pub per_commitment_point: PublicKey,
    /// Key the countersignatory can spend with once this commitment is revoked
    pub revocation_key: PublicKey,
    /// Broadcaster's HTLC key
    pub broadcaster_htlc_key: PublicKey,
    /// Countersignatory's HTLC key
    pub countersignatory_htlc_key: PublicKey,
    /// Broadcaster's delayed `to_local` key
    pub broadcaster_delayed_payment_key: PublicKey,
}

impl TxCreationKeys {
    /// Derive the keys for the broadcaster's commitment at `per_commitment_point`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] on an out-of-range tweak.
    pub fn derive<C: Verification>(
        secp: &Secp256k1<C>,
        per_commitment_point: &PublicKey,
        broadcaster: &ChannelPublicKeys,
        countersignatory: &ChannelPublicKeys,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            per_commitment_point: *per_commitment_point,
            revocation_key: derive_revocation_public_key(
                secp,
                per_commitment_point,
                &countersignatory.revocation_basepoint,
            )?,
            broadcaster_htlc_key: derive_public_key(secp, per_commitment_point, &broadcaster.htlc_basepoint)?,
            countersignatory_htlc_key: derive_public_key(
                secp,
                per_commitment_point,
                &countersignatory.htlc_basepoint,
            )?,
            broadcaster_delayed_payment_key: derive_public_key(
                secp,
                per_commitment_point,
                &broadcaster.delayed_payment_basepoint,
            )?,
        })
    }
}

// ============ Scripts ============

fn push_key(builder: Builder, key: &PublicKey) -> Builder {
    builder.push_slice(key.serialize())
}

/// The 2-of-2 funding witness script, keys sorted lexicographically
#[must_use]
pub fn make_funding_redeemscript(a: &PublicKey, b: &PublicKey) -> ScriptBuf {
    let (first, second) = if a.serialize()[..] < b.serialize()[..] { (a, b) } else { (b, a) };
    let builder = Builder::new().push_opcode(OP_PUSHNUM_2);
    let builder = push_key(push_key(builder, first), second);
    builder
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// The revokeable `to_local` script, also used by second-stage HTLC outputs
#[must_use]
pub fn get_revokeable_redeemscript(
    revocation_key: &PublicKey,
    to_self_delay: u16,
    delayed_payment_key: &PublicKey,
) -> ScriptBuf {
    let builder = push_key(Builder::new().push_opcode(OP_IF), revocation_key)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(to_self_delay))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);
    push_key(builder, delayed_payment_key)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// P2WPKH output paying `key`
#[must_use]
pub fn p2wpkh_script(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&key.serialize()))
}

/// P2WSH output for a witness script
#[must_use]
pub fn p2wsh_script(witness_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&witness_script.wscript_hash())
}

/// An HTLC as it appears in one particular commitment transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HTLCOutputInCommitment {
    /// Offered by the broadcaster (true) or received by it (false)
    pub offered: bool,
    /// Value
    pub amount_msat: u64,
    /// Absolute expiry height
    pub cltv_expiry: u32,
    /// Hash lock
    pub payment_hash: PaymentHash,
    /// Output index, `None` when trimmed to fee
    pub transaction_output_index: Option<u32>,
}

/// The offered or received HTLC witness script for `htlc` under `keys`
#[must_use]
pub fn get_htlc_redeemscript(htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys) -> ScriptBuf {
    let revocation_hash = hash160::Hash::hash(&keys.revocation_key.serialize()).to_byte_array();
    let payment_hash160 = ripemd160::Hash::hash(&htlc.payment_hash.0).to_byte_array();

    let builder = Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(revocation_hash)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE);
    let builder = push_key(builder, &keys.countersignatory_htlc_key)
        .push_opcode(OP_SWAP)
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUAL);

    let builder = if htlc.offered {
        let builder = builder
            .push_opcode(OP_NOTIF)
            .push_opcode(OP_DROP)
            .push_opcode(OP_PUSHNUM_2)
            .push_opcode(OP_SWAP);
        push_key(builder, &keys.broadcaster_htlc_key)
            .push_opcode(OP_PUSHNUM_2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_HASH160)
            .push_slice(payment_hash160)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
    } else {
        let builder = builder
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(payment_hash160)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_PUSHNUM_2)
            .push_opcode(OP_SWAP);
        push_key(builder, &keys.broadcaster_htlc_key)
            .push_opcode(OP_PUSHNUM_2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(i64::from(htlc.cltv_expiry))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
    };
    builder.push_opcode(OP_ENDIF).into_script()
}

// ============ Commitment Transactions ============

/// Lower 48 bits of `SHA256(opener_payment_point || acceptor_payment_point)`
#[must_use]
pub fn commitment_obscure_factor(opener_payment_point: &PublicKey, acceptor_payment_point: &PublicKey) -> u64 {
    let hash = sha256_concat(&[&opener_payment_point.serialize(), &acceptor_payment_point.serialize()]);
    let mut low = [0u8; 8];
    low[2..].copy_from_slice(&hash[26..]);
    u64::from_be_bytes(low)
}

/// Recover the commitment number hidden in a commitment transaction's
/// locktime and sequence, if it looks like one of ours
#[must_use]
pub fn commitment_number_from_tx(tx: &Transaction, obscure_factor: u64) -> Option<u64> {
    if tx.input.len() != 1 {
        return None;
    }
    let locktime = tx.lock_time.to_consensus_u32();
    let sequence = tx.input[0].sequence.0;
    if locktime >> 24 != 0x20 || sequence >> 24 != 0x80 {
        return None;
    }
    let obscured = u64::from(locktime & 0x00ff_ffff) | (u64::from(sequence & 0x00ff_ffff) << 24);
    Some(obscured ^ obscure_factor)
}

/// True if the HTLC is too small to be worth an output at this feerate
#[must_use]
pub fn is_htlc_trimmed(offered: bool, amount_msat: u64, dust_limit_sat: u64, feerate_per_kw: u32) -> bool {
    let weight = if offered { HTLC_TIMEOUT_TX_WEIGHT } else { HTLC_SUCCESS_TX_WEIGHT };
    let second_stage_fee = u64::from(feerate_per_kw) * weight / 1000;
    amount_msat / 1000 < dust_limit_sat + second_stage_fee
}

/// Fee of a commitment transaction with `num_htlcs` untrimmed HTLC outputs
#[must_use]
pub fn commitment_tx_fee_sat(feerate_per_kw: u32, num_htlcs: usize) -> u64 {
    u64::from(feerate_per_kw) * (COMMITMENT_TX_BASE_WEIGHT + COMMITMENT_TX_WEIGHT_PER_HTLC * num_htlcs as u64)
        / 1000
}

/// Inputs to [`build_commitment_transaction`]
#[derive(Debug, Clone)]
pub struct CommitmentTxParams<'a> {
    /// Commitment number counting up from 0
    pub commitment_number: u64,
    /// From [`commitment_obscure_factor`]
    pub obscure_factor: u64,
    /// The funding output being spent
    pub funding_outpoint: OutPoint,
    /// Per-commitment keys for this commitment
    pub keys: &'a TxCreationKeys,
    /// Countersignatory's static `to_remote` key
    pub countersignatory_payment_point: &'a PublicKey,
    /// CSV delay on the broadcaster's own outputs (chosen by the countersignatory)
    pub to_self_delay: u16,
    /// Broadcaster's dust limit
    pub dust_limit_sat: u64,
    /// Fee rate
    pub feerate_per_kw: u32,
    /// The broadcaster opened the channel and pays the fee
    pub broadcaster_is_opener: bool,
    /// Broadcaster's balance before fees
    pub broadcaster_value_msat: u64,
    /// Countersignatory's balance before fees
    pub countersignatory_value_msat: u64,
}

/// A built commitment transaction and what went into it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentTransaction {
    /// The unsigned transaction
    pub tx: Transaction,
    /// Every HTLC, untrimmed ones first in output order, then trimmed ones
    pub htlcs: Vec<HTLCOutputInCommitment>,
    /// Fee actually paid (capped by the opener's balance)
    pub fee_sat: u64,
    /// Broadcaster's output value, 0 if omitted
    pub to_broadcaster_sat: u64,
    /// Countersignatory's output value, 0 if omitted
    pub to_countersignatory_sat: u64,
}

impl CommitmentTransaction {
    /// Untrimmed HTLCs in output order
    pub fn untrimmed_htlcs(&self) -> impl Iterator<Item = &HTLCOutputInCommitment> {
        self.htlcs.iter().filter(|h| h.transaction_output_index.is_some())
    }
}

/// Build a commitment transaction.
///
/// `htlcs` carry `transaction_output_index: None` on input; the returned
/// copies have it set for every untrimmed HTLC.
#[must_use]
pub fn build_commitment_transaction(
    params: &CommitmentTxParams<'_>,
    htlcs: Vec<HTLCOutputInCommitment>,
) -> CommitmentTransaction {
    let (untrimmed, trimmed): (Vec<_>, Vec<_>) = htlcs.into_iter().partition(|h| {
        !is_htlc_trimmed(h.offered, h.amount_msat, params.dust_limit_sat, params.feerate_per_kw)
    });

    let fee = commitment_tx_fee_sat(params.feerate_per_kw, untrimmed.len());
    let mut to_broadcaster = params.broadcaster_value_msat / 1000;
    let mut to_countersignatory = params.countersignatory_value_msat / 1000;
    let opener_balance = if params.broadcaster_is_opener {
        &mut to_broadcaster
    } else {
        &mut to_countersignatory
    };
    let fee_sat = fee.min(*opener_balance);
    *opener_balance -= fee_sat;

    // (output, cltv for ordering ties, htlc slot)
    let mut outputs: Vec<(TxOut, u32, Option<usize>)> = Vec::with_capacity(untrimmed.len() + 2);
    if to_broadcaster >= params.dust_limit_sat {
        let script = get_revokeable_redeemscript(
            &params.keys.revocation_key,
            params.to_self_delay,
            &params.keys.broadcaster_delayed_payment_key,
        );
        outputs.push((
            TxOut {
                value: Amount::from_sat(to_broadcaster),
                script_pubkey: p2wsh_script(&script),
            },
            0,
            None,
        ));
    } else {
        to_broadcaster = 0;
    }
    if to_countersignatory >= params.dust_limit_sat {
        outputs.push((
            TxOut {
                value: Amount::from_sat(to_countersignatory),
                script_pubkey: p2wpkh_script(params.countersignatory_payment_point),
            },
            0,
            None,
        ));
    } else {
        to_countersignatory = 0;
    }
    for (slot, htlc) in untrimmed.iter().enumerate() {
        let script = get_htlc_redeemscript(htlc, params.keys);
        outputs.push((
            TxOut {
                value: Amount::from_sat(htlc.amount_msat / 1000),
                script_pubkey: p2wsh_script(&script),
            },
            htlc.cltv_expiry,
            Some(slot),
        ));
    }

    outputs.sort_by(|a, b| {
        a.0.value
            .cmp(&b.0.value)
            .then_with(|| a.0.script_pubkey.as_bytes().cmp(b.0.script_pubkey.as_bytes()))
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut ordered_htlcs = Vec::with_capacity(untrimmed.len() + trimmed.len());
    for (index, (_, _, slot)) in outputs.iter().enumerate() {
        if let Some(slot) = slot {
            let mut htlc = untrimmed[*slot].clone();
            htlc.transaction_output_index = Some(index as u32);
            ordered_htlcs.push(htlc);
        }
    }
    ordered_htlcs.extend(trimmed.into_iter().map(|mut h| {
        h.transaction_output_index = None;
        h
    }));

    let obscured = (params.commitment_number ^ params.obscure_factor) & INITIAL_COMMITMENT_NUMBER;
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus((0x20 << 24) | (obscured & 0x00ff_ffff) as u32),
        input: vec![TxIn {
            previous_output: params.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence((0x80 << 24) | ((obscured >> 24) & 0x00ff_ffff) as u32),
            witness: Witness::new(),
        }],
        output: outputs.into_iter().map(|(out, _, _)| out).collect(),
    };

    CommitmentTransaction {
        tx,
        htlcs: ordered_htlcs,
        fee_sat,
        to_broadcaster_sat: to_broadcaster,
        to_countersignatory_sat: to_countersignatory,
    }
}

/// Build the second-stage HTLC-timeout (offered) or HTLC-success
/// (received) transaction spending `htlc` from commitment `commitment_txid`
#[must_use]
pub fn build_htlc_transaction(
    commitment_txid: &bitcoin::Txid,
    feerate_per_kw: u32,
    to_self_delay: u16,
    htlc: &HTLCOutputInCommitment,
    broadcaster_delayed_payment_key: &PublicKey,
    revocation_key: &PublicKey,
) -> Transaction {
    let weight = if htlc.offered { HTLC_TIMEOUT_TX_WEIGHT } else { HTLC_SUCCESS_TX_WEIGHT };
    let fee = u64::from(feerate_per_kw) * weight / 1000;
    let script = get_revokeable_redeemscript(revocation_key, to_self_delay, broadcaster_delayed_payment_key);

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(if htlc.offered { htlc.cltv_expiry } else { 0 }),
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: *commitment_txid,
                vout: htlc.transaction_output_index.unwrap_or(0),
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat((htlc.amount_msat / 1000).saturating_sub(fee)),
            script_pubkey: p2wsh_script(&script),
        }],
    }
}

/// Build a cooperative closing transaction. The opener pays `fee_sat`;
/// outputs below `dust_limit_sat` are dropped.
#[must_use]
pub fn build_closing_transaction(
    funding_outpoint: OutPoint,
    opener_value_sat: u64,
    acceptor_value_sat: u64,
    opener_script: &Script,
    acceptor_script: &Script,
    fee_sat: u64,
    dust_limit_sat: u64,
) -> Transaction {
    let opener_value = opener_value_sat.saturating_sub(fee_sat);
    let mut output: Vec<TxOut> = [(opener_value, opener_script), (acceptor_value_sat, acceptor_script)]
        .into_iter()
        .filter(|(value, _)| *value >= dust_limit_sat)
        .map(|(value, script)| TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script.to_owned(),
        })
        .collect();
    output.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}

// ============ Signing Support ============

/// BIP-143 sighash of a P2WSH input, `SIGHASH_ALL`
///
/// # Errors
///
/// Returns an error if `input_index` is out of range.
pub fn p2wsh_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value_sat: u64,
) -> Result<bitcoin::secp256k1::Message, CryptoError> {
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(input_index, witness_script, Amount::from_sat(value_sat), EcdsaSighashType::All)
        .map_err(|_| CryptoError::InvalidState)?;
    Ok(bitcoin::secp256k1::Message::from_digest(sighash.to_byte_array()))
}

/// DER signature with the `SIGHASH_ALL` byte appended, as witnesses carry it
#[must_use]
pub fn witness_signature(sig: &bitcoin::secp256k1::ecdsa::Signature) -> Vec<u8> {
    let mut out = sig.serialize_der().to_vec();
    out.push(EcdsaSighashType::All as u8);
    out
}

/// Witness spending the funding output with both signatures
#[must_use]
pub fn funding_witness(
    funding_redeemscript: &Script,
    our_key: &PublicKey,
    our_sig: &bitcoin::secp256k1::ecdsa::Signature,
    their_key: &PublicKey,
    their_sig: &bitcoin::secp256k1::ecdsa::Signature,
) -> Witness {
    let (first, second) = if our_key.serialize()[..] < their_key.serialize()[..] {
        (our_sig, their_sig)
    } else {
        (their_sig, our_sig)
    };
    let mut witness = Witness::new();
    witness.push(Vec::<u8>::new());
    witness.push(witness_signature(first));
    witness.push(witness_signature(second));
    witness.push(funding_redeemscript.as_bytes());
    witness
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn key(byte: u8) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    fn keys() -> TxCreationKeys {
        TxCreationKeys {
            per_commitment_point: key(1),
            revocation_key: key(2),
            broadcaster_htlc_key: key(3),
            countersignatory_htlc_key: key(4),
            broadcaster_delayed_payment_key: key(5),
        }
    }

    fn htlc(offered: bool, amount_msat: u64, cltv_expiry: u32) -> HTLCOutputInCommitment {
        HTLCOutputInCommitment {
            offered,
            amount_msat,
            cltv_expiry,
            payment_hash: PaymentHash([amount_msat as u8; 32]),
            transaction_output_index: None,
        }
    }

    fn params<'a>(keys: &'a TxCreationKeys, remote: &'a PublicKey) -> CommitmentTxParams<'a> {
        CommitmentTxParams {
            commitment_number: 42,
            obscure_factor: 0x2bb0_3887_3fb6,
            funding_outpoint: OutPoint::null(),
            keys,
            countersignatory_payment_point: remote,
            to_self_delay: 144,
            dust_limit_sat: 546,
            feerate_per_kw: 15_000,
            broadcaster_is_opener: true,
            broadcaster_value_msat: 7_000_000_000,
            countersignatory_value_msat: 3_000_000_000,
        }
    }

    #[test]
    fn test_funding_script_sorted() {
        let a = make_funding_redeemscript(&key(1), &key(2));
        let b = make_funding_redeemscript(&key(2), &key(1));
        assert_eq!(a, b);
        assert_eq!(a.len(), 1 + 34 + 34 + 1 + 1);
    }

    #[test]
    fn test_obscured_commitment_number_recoverable() {
        let k = keys();
        let remote = key(9);
        let p = params(&k, &remote);
        let built = build_commitment_transaction(&p, Vec::new());
        assert_eq!(built.tx.lock_time.to_consensus_u32() >> 24, 0x20);
        assert_eq!(built.tx.input[0].sequence.0 >> 24, 0x80);
        assert_eq!(commitment_number_from_tx(&built.tx, p.obscure_factor), Some(42));
    }

    #[test]
    fn test_fee_paid_by_opener() {
        let k = keys();
        let remote = key(9);
        let p = params(&k, &remote);
        let built = build_commitment_transaction(&p, Vec::new());
        let fee = commitment_tx_fee_sat(15_000, 0);
        assert_eq!(built.fee_sat, fee);
        assert_eq!(built.to_broadcaster_sat, 7_000_000 - fee);
        assert_eq!(built.to_countersignatory_sat, 3_000_000);
    }

    #[test]
    fn test_htlc_trimming() {
        // 15000 sat/kw: timeout fee 9945 sat, success fee 10545 sat
        assert!(is_htlc_trimmed(true, 10_000_000, 546, 15_000));
        assert!(!is_htlc_trimmed(true, 10_491_000, 546, 15_000));
        assert!(is_htlc_trimmed(false, 11_000_000, 546, 15_000));
        assert!(!is_htlc_trimmed(false, 11_091_000, 546, 15_000));

        let k = keys();
        let remote = key(9);
        let p = params(&k, &remote);
        let built = build_commitment_transaction(
            &p,
            vec![htlc(true, 1_000_000, 500), htlc(false, 20_000_000, 501)],
        );
        assert_eq!(built.tx.output.len(), 3);
        assert_eq!(built.untrimmed_htlcs().count(), 1);
        assert_eq!(built.fee_sat, commitment_tx_fee_sat(15_000, 1));
    }

    #[test]
    fn test_outputs_sorted_and_indices_match() {
        let k = keys();
        let remote = key(9);
        let mut p = params(&k, &remote);
        p.feerate_per_kw = 253;
        let built = build_commitment_transaction(
            &p,
            vec![
                htlc(true, 5_000_000, 600),
                htlc(false, 2_000_000, 601),
                htlc(true, 5_000_000, 599),
            ],
        );
        let values: Vec<u64> = built.tx.output.iter().map(|o| o.value.to_sat()).collect();
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted);

        for h in built.untrimmed_htlcs() {
            let idx = h.transaction_output_index.unwrap() as usize;
            assert_eq!(built.tx.output[idx].value.to_sat(), h.amount_msat / 1000);
            assert_eq!(
                built.tx.output[idx].script_pubkey,
                p2wsh_script(&get_htlc_redeemscript(h, &k))
            );
        }
    }

    #[test]
    fn test_dust_balance_omitted() {
        let k = keys();
        let remote = key(9);
        let mut p = params(&k, &remote);
        p.countersignatory_value_msat = 500_000;
        let built = build_commitment_transaction(&p, Vec::new());
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.to_countersignatory_sat, 0);
    }

    #[test]
    fn test_htlc_transaction_shape() {
        let txid = bitcoin::Txid::all_zeros();
        let mut h = htlc(true, 5_000_000, 700);
        h.transaction_output_index = Some(2);
        let tx = build_htlc_transaction(&txid, 1000, 144, &h, &key(5), &key(2));
        assert_eq!(tx.lock_time.to_consensus_u32(), 700);
        assert_eq!(tx.input[0].previous_output.vout, 2);
        assert_eq!(tx.output[0].value.to_sat(), 5_000 - 663);

        h.offered = false;
        let tx = build_htlc_transaction(&txid, 1000, 144, &h, &key(5), &key(2));
        assert_eq!(tx.lock_time.to_consensus_u32(), 0);
        assert_eq!(tx.output[0].value.to_sat(), 5_000 - 703);
    }

    #[test]
    fn test_closing_transaction_drops_dust() {
        let a = p2wpkh_script(&key(1));
        let b = p2wpkh_script(&key(2));
        let tx = build_closing_transaction(OutPoint::null(), 100_000, 300, &a, &b, 1_000, 546);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 99_000);
    }

    #[test]
    fn test_offered_and_received_scripts_differ() {
        let k = keys();
        let offered = get_htlc_redeemscript(&htlc(true, 1000, 10), &k);
        let received = get_htlc_redeemscript(&htlc(false, 1000, 10), &k);
        assert_ne!(offered, received);
        assert!(received.len() > offered.len());
    }
}
