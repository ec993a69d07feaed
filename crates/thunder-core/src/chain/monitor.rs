//! Per-channel on-chain watcher.
//!
//! A [`ChannelMonitor`] holds everything needed to close a channel safely
//! without the channel manager: the latest holder commitment with the
//! counterparty's signatures, every counterparty commitment we signed,
//! revealed revocation secrets and known preimages. It is fed blocks and
//! reacts to spends of the funding output:
//!
//! ```text
//!   funding spent by ...
//!     revoked counterparty commitment --> justice tx (to_local + all HTLCs)
//!     current counterparty commitment --> preimage claims, timeout claims
//!     our own commitment              --> second-stage HTLC txs, delayed outputs
//! ```
//!
//! Everything learned from a block is keyed by height so that a
//! `block_disconnected` can undo it, and every block is recorded by hash so
//! replaying it is a no-op. Claims are rebroadcast on each new block until
//! their inputs are seen spent.

use crate::chain::{BroadcasterInterface, ConfirmationTarget, FeeEstimator, OutPoint, floored_feerate};
use crate::channel::htlc::HTLCSource;
use crate::commitment::{
    ChannelPublicKeys, HTLCOutputInCommitment, INITIAL_COMMITMENT_NUMBER, TxCreationKeys, build_htlc_transaction,
    commitment_number_from_tx, funding_witness, get_htlc_redeemscript, get_revokeable_redeemscript, p2wpkh_script,
    p2wsh_script, witness_signature,
};
use crate::error::MonitorUpdateError;
use crate::events::Event;
use crate::keys::{ChannelKeys, SECP, SpendableOutputDescriptor};
use crate::types::{PaymentHash, PaymentPreimage};
use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, BlockHash, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thunder_crypto::hash::sha256;
use thunder_crypto::shachain::CounterpartyCommitmentSecrets;
use tracing::{debug, error, info, trace, warn};

/// Confirmations before an on-chain resolution is treated as final
pub const ANTI_REORG_DELAY: u32 = 6;
/// Blocks before an inbound HTLC expires at which we go on chain to claim it
pub const CLTV_CLAIM_BUFFER: u32 = 6;
/// Blocks past an outbound HTLC's expiry we give the counterparty before
/// going on chain
pub const LATENCY_GRACE_PERIOD_BLOCKS: u32 = 3;
/// `update_id` of the force-close update
pub const CLOSED_CHANNEL_UPDATE_ID: u64 = u64::MAX;

/// Block hashes remembered for replay detection
const PROCESSED_BLOCK_HISTORY: u32 = 2016;
/// Non-witness bytes of a one-output P2WPKH transaction, excluding inputs
const CLAIM_TX_BASE_SIZE: u64 = 4 + 1 + 1 + 8 + 1 + 22 + 4;
/// Non-witness bytes of one input
const CLAIM_INPUT_SIZE: u64 = 32 + 4 + 1 + 4;
/// Pessimistic DER signature plus sighash byte
const SIG_WITNESS_SIZE: u64 = 1 + 73;

// ============ Updates ============

/// An HTLC on our commitment with what we need to spend it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderHTLCOutput {
    /// The HTLC as it appears in the commitment
    pub htlc: HTLCOutputInCommitment,
    /// Counterparty signature on the second-stage transaction, untrimmed only
    pub counterparty_sig: Option<Signature>,
    /// Who to tell when it resolves, for HTLCs we offered
    pub source: Option<HTLCSource>,
}

/// Our latest commitment, signed by the counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderCommitmentTransaction {
    /// Unsigned commitment transaction
    pub tx: Transaction,
    /// Counterparty's signature on the funding input
    pub counterparty_sig: Signature,
    /// Per-commitment keys it was built with
    pub keys: TxCreationKeys,
    /// Its fee rate, which second-stage transactions reuse
    pub feerate_per_kw: u32,
    /// Commitment number counting up from 0
    pub commitment_number: u64,
    /// Its HTLCs
    pub htlcs: Vec<HolderHTLCOutput>,
}

/// One step of a [`ChannelMonitorUpdate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMonitorUpdateStep {
    /// We received a new commitment
    LatestHolderCommitmentTxInfo {
        /// The commitment
        commitment: HolderCommitmentTransaction,
    },
    /// We signed a new counterparty commitment
    LatestCounterpartyCommitmentTxInfo {
        /// Its txid
        commitment_txid: Txid,
        /// Commitment number counting up from 0
        commitment_number: u64,
        /// The counterparty's point for it
        per_commitment_point: PublicKey,
        /// Its fee rate
        feerate_per_kw: u32,
        /// HTLCs with output indices as in the transaction, from the
        /// counterparty's point of view
        htlc_outputs: Vec<(HTLCOutputInCommitment, Option<HTLCSource>)>,
    },
    /// We learned a preimage
    PaymentPreimage {
        /// The preimage
        payment_preimage: PaymentPreimage,
    },
    /// The counterparty revoked a commitment
    CommitmentSecret {
        /// Shachain index
        idx: u64,
        /// The secret
        secret: [u8; 32],
    },
    /// The channel is closed off-chain; stop accepting commitments
    ChannelForceClosed {
        /// Broadcast our latest commitment now
        should_broadcast: bool,
    },
}

/// An ordered batch of monitor changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMonitorUpdate {
    /// Strictly increasing per channel; [`CLOSED_CHANNEL_UPDATE_ID`] for
    /// force-closes
    pub update_id: u64,
    /// Applied in order
    pub updates: Vec<ChannelMonitorUpdateStep>,
}

/// An HTLC we offered was resolved on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HTLCUpdate {
    /// Hash lock
    pub payment_hash: PaymentHash,
    /// Set when it was claimed, `None` when it timed out or vanished
    pub payment_preimage: Option<PaymentPreimage>,
    /// Who to tell
    pub source: HTLCSource,
}

/// Something the channel manager must act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// An outbound HTLC resolved on chain
    HTLCEvent(HTLCUpdate),
    /// We broadcast our commitment; the channel is closed
    CommitmentTxBroadcasted(OutPoint),
}

// ============ Internal State ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CounterpartyCommitment {
    commitment_number: u64,
    per_commitment_point: PublicKey,
    feerate_per_kw: u32,
    htlcs: Vec<(HTLCOutputInCommitment, Option<HTLCSource>)>,
}

/// A transaction we keep rebroadcasting until its inputs are spent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingClaim {
    tx: Transaction,
    /// Spent inputs with the height the spend was seen at
    outpoints: Vec<(bitcoin::OutPoint, Option<u32>)>,
    /// Height at which it becomes valid
    height_requirement: u32,
    /// Height of the block that made us build it; `None` if it does not
    /// depend on any block
    generated_at: Option<u32>,
    last_broadcast: Option<u32>,
    /// Output 0 pays our revokeable script and becomes spendable on confirmation
    delayed_output: Option<(ScriptBuf, SecretKey)>,
}

impl PendingClaim {
    fn is_resolved(&self) -> bool {
        self.outpoints.iter().all(|(_, spent)| spent.is_some())
    }

    fn resolved_at(&self) -> Option<u32> {
        self.outpoints.iter().map(|(_, spent)| *spent).try_fold(0, |max, h| h.map(|h| max.max(h)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum OnchainEvent {
    HTLCFailed { payment_hash: PaymentHash, source: HTLCSource },
    MaturingOutput { descriptor: SpendableOutputDescriptor },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OnchainEventEntry {
    height: u32,
    event: OnchainEvent,
}

/// Parameters fixed at channel funding
#[derive(Debug, Clone)]
pub struct MonitorParams {
    /// Our signer for this channel
    pub keys: ChannelKeys,
    /// Our cooperative-close key
    pub shutdown_pubkey: PublicKey,
    /// Where claims are swept to
    pub destination_script: ScriptBuf,
    /// Funding outpoint
    pub funding_outpoint: OutPoint,
    /// 2-of-2 funding witness script
    pub funding_redeemscript: ScriptBuf,
    /// Channel capacity
    pub channel_value_satoshis: u64,
    /// Counterparty basepoints
    pub counterparty_pubkeys: ChannelPublicKeys,
    /// CSV delay on our outputs, chosen by the counterparty
    pub holder_to_self_delay: u16,
    /// CSV delay on their outputs, chosen by us
    pub counterparty_to_self_delay: u16,
    /// Commitment number obscuring factor
    pub obscure_factor: u64,
    /// Our commitment 0
    pub initial_holder_commitment: HolderCommitmentTransaction,
    /// Txid of the counterparty's commitment 0
    pub initial_counterparty_commitment_txid: Txid,
    /// The counterparty's point for its commitment 0
    pub initial_counterparty_point: PublicKey,
}

// ============ Channel Monitor ============

/// Watches the chain on behalf of one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMonitor {
    latest_update_id: u64,
    funding_outpoint: OutPoint,
    funding_script_pubkey: ScriptBuf,
    funding_redeemscript: ScriptBuf,
    channel_value_satoshis: u64,
    keys: ChannelKeys,
    counterparty_pubkeys: ChannelPublicKeys,
    holder_to_self_delay: u16,
    counterparty_to_self_delay: u16,
    obscure_factor: u64,
    destination_script: ScriptBuf,
    shutdown_script: ScriptBuf,

    commitment_secrets: CounterpartyCommitmentSecrets,
    counterparty_commitments: HashMap<Txid, CounterpartyCommitment>,
    current_counterparty_txid: Option<Txid>,
    prev_counterparty_txid: Option<Txid>,
    current_holder_commitment: HolderCommitmentTransaction,
    prev_holder_commitment: Option<HolderCommitmentTransaction>,
    payment_preimages: HashMap<PaymentHash, PaymentPreimage>,

    pending_claims: Vec<PendingClaim>,
    claimed_outpoints: HashSet<bitcoin::OutPoint>,
    resolved_htlc_outpoints: HashSet<bitcoin::OutPoint>,
    onchain_events_waiting_threshold_conf: Vec<OnchainEventEntry>,
    processed_blocks: BTreeMap<u32, BlockHash>,
    funding_spend_seen: Option<(Txid, u32)>,
    holder_tx_broadcast: bool,
    lockdown_from_offchain: bool,

    pending_monitor_events: Vec<MonitorEvent>,
    pending_spendable_outputs: Vec<SpendableOutputDescriptor>,
}

impl ChannelMonitor {
    /// Monitor for a channel whose first commitments were just exchanged
    #[must_use]
    pub fn new(params: MonitorParams) -> Self {
        let funding_script_pubkey = p2wsh_script(&params.funding_redeemscript);
        let initial_counterparty = CounterpartyCommitment {
            commitment_number: 0,
            per_commitment_point: params.initial_counterparty_point,
            feerate_per_kw: params.initial_holder_commitment.feerate_per_kw,
            htlcs: Vec::new(),
        };
        Self {
            latest_update_id: 0,
            funding_outpoint: params.funding_outpoint,
            funding_script_pubkey,
            funding_redeemscript: params.funding_redeemscript,
            channel_value_satoshis: params.channel_value_satoshis,
            keys: params.keys,
            counterparty_pubkeys: params.counterparty_pubkeys,
            holder_to_self_delay: params.holder_to_self_delay,
            counterparty_to_self_delay: params.counterparty_to_self_delay,
            obscure_factor: params.obscure_factor,
            destination_script: params.destination_script,
            shutdown_script: p2wpkh_script(&params.shutdown_pubkey),
            commitment_secrets: CounterpartyCommitmentSecrets::new(),
            counterparty_commitments: HashMap::from([(
                params.initial_counterparty_commitment_txid,
                initial_counterparty,
            )]),
            current_counterparty_txid: Some(params.initial_counterparty_commitment_txid),
            prev_counterparty_txid: None,
            current_holder_commitment: params.initial_holder_commitment,
            prev_holder_commitment: None,
            payment_preimages: HashMap::new(),
            pending_claims: Vec::new(),
            claimed_outpoints: HashSet::new(),
            resolved_htlc_outpoints: HashSet::new(),
            onchain_events_waiting_threshold_conf: Vec::new(),
            processed_blocks: BTreeMap::new(),
            funding_spend_seen: None,
            holder_tx_broadcast: false,
            lockdown_from_offchain: false,
            pending_monitor_events: Vec::new(),
            pending_spendable_outputs: Vec::new(),
        }
    }

    /// Highest update id applied
    #[must_use]
    pub fn get_latest_update_id(&self) -> u64 {
        self.latest_update_id
    }

    /// Funding outpoint and its script
    #[must_use]
    pub fn get_funding_txo(&self) -> (OutPoint, &Script) {
        (self.funding_outpoint, &self.funding_script_pubkey)
    }

    /// Txids of every counterparty commitment we signed, for chain filters
    pub fn counterparty_commitment_txids(&self) -> impl Iterator<Item = &Txid> {
        self.counterparty_commitments.keys()
    }

    /// Serialize for persistence
    ///
    /// # Errors
    ///
    /// Returns the `bincode` error if serialization fails.
    pub fn write_to_vec(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Restore a persisted monitor
    ///
    /// # Errors
    ///
    /// Returns the `bincode` error on malformed data.
    pub fn read_from_slice(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    // ============ Updates ============

    /// Apply `update`. Updates at or below the latest applied id are
    /// ignored, so replaying persisted updates is safe.
    ///
    /// # Errors
    ///
    /// Returns a [`MonitorUpdateError`] if a step contradicts stored state,
    /// such as a revocation secret that does not match earlier ones.
    pub fn update_monitor(
        &mut self,
        update: &ChannelMonitorUpdate,
        broadcaster: &dyn BroadcasterInterface,
        fee_estimator: &dyn FeeEstimator,
    ) -> Result<(), MonitorUpdateError> {
        if update.update_id <= self.latest_update_id {
            debug!(
                update_id = update.update_id,
                latest = self.latest_update_id,
                "skipping already applied monitor update"
            );
            return Ok(());
        }
        for step in &update.updates {
            match step {
                ChannelMonitorUpdateStep::LatestHolderCommitmentTxInfo { commitment } => {
                    trace!(commitment_number = commitment.commitment_number, "new holder commitment");
                    self.provide_latest_holder_commitment(commitment.clone())?;
                }
                ChannelMonitorUpdateStep::LatestCounterpartyCommitmentTxInfo {
                    commitment_txid,
                    commitment_number,
                    per_commitment_point,
                    feerate_per_kw,
                    htlc_outputs,
                } => {
                    trace!(%commitment_txid, commitment_number, "new counterparty commitment");
                    self.prev_counterparty_txid = self.current_counterparty_txid.replace(*commitment_txid);
                    self.counterparty_commitments.insert(
                        *commitment_txid,
                        CounterpartyCommitment {
                            commitment_number: *commitment_number,
                            per_commitment_point: *per_commitment_point,
                            feerate_per_kw: *feerate_per_kw,
                            htlcs: htlc_outputs.clone(),
                        },
                    );
                }
                ChannelMonitorUpdateStep::PaymentPreimage { payment_preimage } => {
                    self.payment_preimages
                        .insert(payment_preimage.payment_hash(), *payment_preimage);
                }
                ChannelMonitorUpdateStep::CommitmentSecret { idx, secret } => {
                    self.commitment_secrets
                        .provide_secret(*idx, *secret)
                        .map_err(|e| MonitorUpdateError(format!("revocation secret rejected: {e}").into()))?;
                }
                ChannelMonitorUpdateStep::ChannelForceClosed { should_broadcast } => {
                    self.lockdown_from_offchain = true;
                    if *should_broadcast {
                        self.broadcast_latest_holder_commitment(broadcaster, fee_estimator, None);
                    } else {
                        warn!(
                            funding = %self.funding_outpoint,
                            "channel force-closed without broadcasting our commitment"
                        );
                    }
                }
            }
        }
        self.latest_update_id = update.update_id;
        Ok(())
    }

    fn provide_latest_holder_commitment(
        &mut self,
        commitment: HolderCommitmentTransaction,
    ) -> Result<(), MonitorUpdateError> {
        if self.holder_tx_broadcast {
            return Err(MonitorUpdateError(
                "latest holder commitment already broadcast, refusing a newer one".into(),
            ));
        }
        let prev = std::mem::replace(&mut self.current_holder_commitment, commitment);
        self.prev_holder_commitment = Some(prev);
        Ok(())
    }

    /// Take every pending [`MonitorEvent`]
    pub fn get_and_clear_pending_monitor_events(&mut self) -> Vec<MonitorEvent> {
        std::mem::take(&mut self.pending_monitor_events)
    }

    /// Take spendable-output events
    pub fn get_and_clear_pending_events(&mut self) -> Vec<Event> {
        let outputs = std::mem::take(&mut self.pending_spendable_outputs);
        if outputs.is_empty() {
            Vec::new()
        } else {
            vec![Event::SpendableOutputs { outputs }]
        }
    }

    // ============ Holder Commitment ============

    /// Our latest commitment and its HTLC transactions, fully signed.
    /// Once called the monitor refuses newer holder commitments.
    pub fn get_latest_holder_commitment_txn(&mut self) -> Vec<Transaction> {
        self.holder_tx_broadcast = true;
        match self.signed_holder_txn(&self.current_holder_commitment) {
            Ok(txn) => txn.into_iter().map(|(tx, _)| tx).collect(),
            Err(e) => {
                error!(error = %e, "failed to sign holder commitment");
                Vec::new()
            }
        }
    }

    /// The commitment plus each second-stage transaction we can complete,
    /// with the CLTV height second-stage transactions must wait for
    fn signed_holder_txn(
        &self,
        commitment: &HolderCommitmentTransaction,
    ) -> Result<Vec<(Transaction, u32)>, thunder_crypto::CryptoError> {
        let holder_funding = self.keys.pubkeys().funding_pubkey;
        let their_funding = self.counterparty_pubkeys.funding_pubkey;
        let our_sig = self.keys.sign_holder_commitment(&*SECP, &commitment.tx, &their_funding)?;
        let mut tx = commitment.tx.clone();
        tx.input[0].witness = funding_witness(
            &self.funding_redeemscript,
            &holder_funding,
            &our_sig,
            &their_funding,
            &commitment.counterparty_sig,
        );
        let txid = tx.compute_txid();
        let mut txn = vec![(tx, 0)];

        for output in &commitment.htlcs {
            let (Some(_), Some(their_sig)) = (output.htlc.transaction_output_index, output.counterparty_sig) else {
                continue;
            };
            let preimage = if output.htlc.offered {
                None
            } else {
                match self.payment_preimages.get(&output.htlc.payment_hash) {
                    Some(preimage) => Some(preimage),
                    None => continue,
                }
            };
            let mut htlc_tx = build_htlc_transaction(
                &txid,
                commitment.feerate_per_kw,
                self.holder_to_self_delay,
                &output.htlc,
                &commitment.keys.broadcaster_delayed_payment_key,
                &commitment.keys.revocation_key,
            );
            let script = get_htlc_redeemscript(&output.htlc, &commitment.keys);
            let our_htlc_sig = self.keys.sign_htlc_transaction(
                &*SECP,
                &htlc_tx,
                0,
                &script,
                output.htlc.amount_msat / 1000,
                &commitment.keys.per_commitment_point,
            )?;
            let mut witness = Witness::new();
            witness.push(Vec::<u8>::new());
            witness.push(witness_signature(&their_sig));
            witness.push(witness_signature(&our_htlc_sig));
            match preimage {
                Some(preimage) => witness.push(preimage.0),
                None => witness.push(Vec::<u8>::new()),
            }
            witness.push(script.as_bytes());
            htlc_tx.input[0].witness = witness;
            let height = if output.htlc.offered { output.htlc.cltv_expiry } else { 0 };
            txn.push((htlc_tx, height));
        }
        Ok(txn)
    }

    fn broadcast_latest_holder_commitment(
        &mut self,
        broadcaster: &dyn BroadcasterInterface,
        _fee_estimator: &dyn FeeEstimator,
        height: Option<u32>,
    ) {
        if self.holder_tx_broadcast && self.pending_claims.iter().any(|c| c.generated_at.is_none()) {
            return;
        }
        self.holder_tx_broadcast = true;
        let commitment = self.current_holder_commitment.clone();
        let txn = match self.signed_holder_txn(&commitment) {
            Ok(txn) => txn,
            Err(e) => {
                error!(error = %e, "failed to sign holder commitment");
                return;
            }
        };
        info!(
            funding = %self.funding_outpoint,
            commitment_number = commitment.commitment_number,
            "broadcasting holder commitment"
        );
        let delayed_script = get_revokeable_redeemscript(
            &commitment.keys.revocation_key,
            self.holder_to_self_delay,
            &commitment.keys.broadcaster_delayed_payment_key,
        );
        let delayed_key = self
            .keys
            .delayed_payment_key(&*SECP, &commitment.keys.per_commitment_point)
            .ok();
        for (index, (tx, height_requirement)) in txn.into_iter().enumerate() {
            let delayed_output = if index == 0 {
                None
            } else {
                delayed_key.map(|key| (delayed_script.clone(), key))
            };
            self.queue_claim(tx, height_requirement, None, delayed_output, height, broadcaster);
        }
        self.pending_monitor_events
            .push(MonitorEvent::CommitmentTxBroadcasted(self.funding_outpoint));
    }

    /// True if an HTLC on our current commitment is close enough to expiry
    /// that we must close on chain
    fn would_broadcast_at_height(&self, height: u32) -> bool {
        self.current_holder_commitment.htlcs.iter().any(|output| {
            let htlc = &output.htlc;
            if htlc.offered {
                output.source.is_some() && height >= htlc.cltv_expiry.saturating_add(LATENCY_GRACE_PERIOD_BLOCKS)
            } else {
                self.payment_preimages.contains_key(&htlc.payment_hash)
                    && height.saturating_add(CLTV_CLAIM_BUFFER) >= htlc.cltv_expiry
            }
        })
    }

    // ============ Claims ============

    fn queue_claim(
        &mut self,
        tx: Transaction,
        height_requirement: u32,
        generated_at: Option<u32>,
        delayed_output: Option<(ScriptBuf, SecretKey)>,
        height: Option<u32>,
        broadcaster: &dyn BroadcasterInterface,
    ) {
        let outpoints: Vec<_> = tx.input.iter().map(|input| (input.previous_output, None)).collect();
        if outpoints.iter().any(|(outpoint, _)| self.claimed_outpoints.contains(outpoint)) {
            trace!("claim for already claimed outpoint skipped");
            return;
        }
        self.claimed_outpoints.extend(outpoints.iter().map(|(outpoint, _)| *outpoint));
        let mut claim = PendingClaim {
            tx,
            outpoints,
            height_requirement,
            generated_at,
            last_broadcast: None,
            delayed_output,
        };
        if height.is_none_or(|h| h >= height_requirement) {
            debug!(txid = %claim.tx.compute_txid(), "broadcasting claim");
            broadcaster.broadcast_transaction(&claim.tx);
            claim.last_broadcast = height;
        }
        self.pending_claims.push(claim);
    }

    fn claim_tx(
        &self,
        inputs: Vec<TxIn>,
        total_sat: u64,
        witness_size: u64,
        lock_time: LockTime,
        feerate: u32,
    ) -> Option<Transaction> {
        let weight = 4 * (CLAIM_TX_BASE_SIZE + CLAIM_INPUT_SIZE * inputs.len() as u64) + 2 + witness_size;
        let fee = u64::from(feerate) * weight / 1000;
        let value = total_sat.checked_sub(fee)?;
        if value < self.destination_script.minimal_non_dust().to_sat() {
            return None;
        }
        Some(Transaction {
            version: Version::TWO,
            lock_time,
            input: inputs,
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: self.destination_script.clone(),
            }],
        })
    }

    /// Justice transaction for a revoked counterparty commitment
    fn build_justice_tx(
        &self,
        tx: &Transaction,
        per_commitment_secret: &SecretKey,
        fee_estimator: &dyn FeeEstimator,
    ) -> Result<Option<Transaction>, thunder_crypto::CryptoError> {
        let txid = tx.compute_txid();
        let pcp = PublicKey::from_secret_key(&*SECP, per_commitment_secret);
        let keys = TxCreationKeys::derive(&*SECP, &pcp, &self.counterparty_pubkeys, self.keys.pubkeys())?;
        let revokeable = get_revokeable_redeemscript(
            &keys.revocation_key,
            self.counterparty_to_self_delay,
            &keys.broadcaster_delayed_payment_key,
        );
        let revokeable_spk = p2wsh_script(&revokeable);

        // (input, script, amount, revocation witness element)
        let mut spends: Vec<(TxIn, ScriptBuf, u64, Vec<u8>)> = Vec::new();
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey == revokeable_spk {
                spends.push((
                    claim_input(txid, vout as u32, Sequence::MAX),
                    revokeable.clone(),
                    output.value.to_sat(),
                    vec![1],
                ));
            }
        }
        if let Some(commitment) = self.counterparty_commitments.get(&txid) {
            for (htlc, _) in &commitment.htlcs {
                let Some(vout) = htlc.transaction_output_index else { continue };
                let script = get_htlc_redeemscript(htlc, &keys);
                let amount = tx
                    .output
                    .get(vout as usize)
                    .map_or(htlc.amount_msat / 1000, |o| o.value.to_sat());
                spends.push((
                    claim_input(txid, vout, Sequence::MAX),
                    script,
                    amount,
                    keys.revocation_key.serialize().to_vec(),
                ));
            }
        }
        if spends.is_empty() {
            return Ok(None);
        }

        let total: u64 = spends.iter().map(|(_, _, amount, _)| amount).sum();
        let witness_size: u64 = spends
            .iter()
            .map(|(_, script, _, rev)| 1 + SIG_WITNESS_SIZE + 1 + rev.len() as u64 + 3 + script.len() as u64)
            .sum();
        let feerate = floored_feerate(fee_estimator, ConfirmationTarget::HighPriority);
        let inputs = spends.iter().map(|(input, _, _, _)| input.clone()).collect();
        let Some(mut justice) = self.claim_tx(inputs, total, witness_size, LockTime::ZERO, feerate) else {
            warn!(%txid, "revoked outputs not worth claiming at current fee rate");
            return Ok(None);
        };
        for (index, (_, script, amount, rev)) in spends.iter().enumerate() {
            let sig = self
                .keys
                .sign_justice_transaction(&*SECP, &justice, index, *amount, per_commitment_secret, script)?;
            let mut witness = Witness::new();
            witness.push(witness_signature(&sig));
            witness.push(rev);
            witness.push(script.as_bytes());
            justice.input[index].witness = witness;
        }
        Ok(Some(justice))
    }

    /// Claims against an unrevoked counterparty commitment: one transaction
    /// for every HTLC we have a preimage for, one per HTLC we offered
    /// (valid after its expiry)
    fn build_counterparty_htlc_claims(
        &self,
        tx: &Transaction,
        commitment: &CounterpartyCommitment,
        fee_estimator: &dyn FeeEstimator,
    ) -> Result<Vec<(Transaction, u32)>, thunder_crypto::CryptoError> {
        let txid = tx.compute_txid();
        let keys = TxCreationKeys::derive(
            &*SECP,
            &commitment.per_commitment_point,
            &self.counterparty_pubkeys,
            self.keys.pubkeys(),
        )?;
        let feerate = floored_feerate(fee_estimator, ConfirmationTarget::HighPriority);
        let mut claims = Vec::new();

        let mut preimage_spends = Vec::new();
        for (htlc, _) in &commitment.htlcs {
            let Some(vout) = htlc.transaction_output_index else { continue };
            let script = get_htlc_redeemscript(htlc, &keys);
            let amount = tx
                .output
                .get(vout as usize)
                .map_or(htlc.amount_msat / 1000, |o| o.value.to_sat());
            if htlc.offered {
                if let Some(preimage) = self.payment_preimages.get(&htlc.payment_hash) {
                    preimage_spends.push((claim_input(txid, vout, Sequence::MAX), script, amount, *preimage));
                }
            } else {
                let witness_size = 1 + SIG_WITNESS_SIZE + 1 + 3 + script.len() as u64;
                let input = claim_input(txid, vout, Sequence::ENABLE_LOCKTIME_NO_RBF);
                let lock_time = LockTime::from_consensus(htlc.cltv_expiry);
                let Some(mut claim) = self.claim_tx(vec![input], amount, witness_size, lock_time, feerate) else {
                    continue;
                };
                let sig = self.keys.sign_htlc_transaction(
                    &*SECP,
                    &claim,
                    0,
                    &script,
                    amount,
                    &commitment.per_commitment_point,
                )?;
                let mut witness = Witness::new();
                witness.push(witness_signature(&sig));
                witness.push(Vec::<u8>::new());
                witness.push(script.as_bytes());
                claim.input[0].witness = witness;
                claims.push((claim, htlc.cltv_expiry));
            }
        }

        if !preimage_spends.is_empty() {
            let total = preimage_spends.iter().map(|(_, _, amount, _)| amount).sum();
            let witness_size = preimage_spends
                .iter()
                .map(|(_, script, _, _)| 1 + SIG_WITNESS_SIZE + 33 + 3 + script.len() as u64)
                .sum();
            let inputs = preimage_spends.iter().map(|(input, _, _, _)| input.clone()).collect();
            if let Some(mut claim) = self.claim_tx(inputs, total, witness_size, LockTime::ZERO, feerate) {
                for (index, (_, script, amount, preimage)) in preimage_spends.iter().enumerate() {
                    let sig = self.keys.sign_htlc_transaction(
                        &*SECP,
                        &claim,
                        index,
                        script,
                        *amount,
                        &commitment.per_commitment_point,
                    )?;
                    let mut witness = Witness::new();
                    witness.push(witness_signature(&sig));
                    witness.push(preimage.0);
                    witness.push(script.as_bytes());
                    claim.input[index].witness = witness;
                }
                claims.push((claim, 0));
            }
        }
        Ok(claims)
    }

    // ============ Chain Events ============

    /// Process a connected block, broadcasting any claims it makes due.
    ///
    /// Blocks already processed at the same height and hash are skipped.
    pub fn block_connected(
        &mut self,
        header: &Header,
        txdata: &[(usize, &Transaction)],
        height: u32,
        broadcaster: &dyn BroadcasterInterface,
        fee_estimator: &dyn FeeEstimator,
    ) {
        let block_hash = header.block_hash();
        match self.processed_blocks.get(&height) {
            Some(seen) if *seen == block_hash => {
                trace!(height, %block_hash, "block already processed");
                return;
            }
            Some(_) => {
                warn!(height, "block at known height with a different hash, treating as reorg");
                self.undo_block(height);
            }
            None => {}
        }
        self.processed_blocks.insert(height, block_hash);
        let cutoff = height.saturating_sub(PROCESSED_BLOCK_HISTORY);
        self.processed_blocks = self.processed_blocks.split_off(&cutoff);

        for (_, tx) in txdata {
            let funding = self.funding_outpoint.into_bitcoin_outpoint();
            if tx.input.len() == 1 && tx.input[0].previous_output == funding {
                let txid = tx.compute_txid();
                info!(funding = %self.funding_outpoint, %txid, height, "funding output spent");
                self.funding_spend_seen = Some((txid, height));
                if !self.check_spend_counterparty_transaction(tx, height, broadcaster, fee_estimator) {
                    self.check_spend_holder_transaction(tx, height);
                }
            }
            self.check_claims_spent(tx, height);
            self.is_resolving_htlc_output(tx, height);
        }

        if self.funding_spend_seen.is_none() && !self.holder_tx_broadcast && self.would_broadcast_at_height(height) {
            info!(height, "HTLC nearing expiry, going on chain");
            self.broadcast_latest_holder_commitment(broadcaster, fee_estimator, Some(height));
        }

        self.mature_onchain_events(height);

        for claim in &mut self.pending_claims {
            if claim.is_resolved() || height < claim.height_requirement {
                continue;
            }
            if claim.last_broadcast.is_some_and(|h| h >= height) {
                continue;
            }
            trace!(txid = %claim.tx.compute_txid(), height, "rebroadcasting claim");
            broadcaster.broadcast_transaction(&claim.tx);
            claim.last_broadcast = Some(height);
        }
        self.pending_claims
            .retain(|claim| claim.resolved_at().is_none_or(|h| h + ANTI_REORG_DELAY > height + 1));
    }

    /// Undo everything learned from the block at `height`
    pub fn block_disconnected(&mut self, header: &Header, height: u32) {
        let block_hash = header.block_hash();
        if self.processed_blocks.get(&height).is_some_and(|seen| *seen != block_hash) {
            warn!(height, %block_hash, "disconnected block was not the one we processed");
        }
        debug!(height, %block_hash, "block disconnected");
        self.undo_block(height);
    }

    fn undo_block(&mut self, height: u32) {
        self.processed_blocks.remove(&height);
        self.onchain_events_waiting_threshold_conf.retain(|entry| entry.height != height);
        if self.funding_spend_seen.is_some_and(|(_, h)| h == height) {
            self.funding_spend_seen = None;
        }
        let mut unclaimed = Vec::new();
        self.pending_claims.retain(|claim| {
            if claim.generated_at == Some(height) {
                unclaimed.extend(claim.outpoints.iter().map(|(outpoint, _)| *outpoint));
                false
            } else {
                true
            }
        });
        for outpoint in unclaimed {
            self.claimed_outpoints.remove(&outpoint);
        }
        for claim in &mut self.pending_claims {
            for (_, spent) in &mut claim.outpoints {
                if *spent == Some(height) {
                    *spent = None;
                }
            }
            if claim.last_broadcast == Some(height) {
                claim.last_broadcast = None;
            }
        }
    }

    /// Returns true if `tx` was a counterparty commitment
    fn check_spend_counterparty_transaction(
        &mut self,
        tx: &Transaction,
        height: u32,
        broadcaster: &dyn BroadcasterInterface,
        fee_estimator: &dyn FeeEstimator,
    ) -> bool {
        let txid = tx.compute_txid();
        let Some(commitment_number) = commitment_number_from_tx(tx, self.obscure_factor) else {
            return false;
        };
        let holder_txids = [
            Some(self.current_holder_commitment.tx.compute_txid()),
            self.prev_holder_commitment.as_ref().map(|c| c.tx.compute_txid()),
        ];
        if holder_txids.contains(&Some(txid)) {
            return false;
        }

        let secret_idx = INITIAL_COMMITMENT_NUMBER - commitment_number;
        if let Some(secret) = self.commitment_secrets.get_secret(secret_idx) {
            error!(%txid, commitment_number, "counterparty broadcast a revoked commitment");
            let Ok(per_commitment_secret) = SecretKey::from_slice(&secret) else {
                return true;
            };
            match self.build_justice_tx(tx, &per_commitment_secret, fee_estimator) {
                Ok(Some(justice)) => {
                    info!(justice_txid = %justice.compute_txid(), "broadcasting justice transaction");
                    self.queue_claim(justice, 0, Some(height), None, Some(height), broadcaster);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to build justice transaction"),
            }
            self.record_to_remote_output(tx, height);
            self.fail_unbroadcast_htlcs(&[], height);
            return true;
        }

        let Some(commitment) = self.counterparty_commitments.get(&txid).cloned() else {
            // A commitment number we recognise but never signed: nothing to claim
            return false;
        };
        warn!(%txid, commitment_number, "counterparty broadcast its commitment");
        match self.build_counterparty_htlc_claims(tx, &commitment, fee_estimator) {
            Ok(claims) => {
                for (claim, height_requirement) in claims {
                    self.queue_claim(claim, height_requirement, Some(height), None, Some(height), broadcaster);
                }
            }
            Err(e) => error!(error = %e, "failed to build HTLC claims"),
        }
        self.record_to_remote_output(tx, height);
        // HTLCs we offered appear as received in the counterparty's commitment
        let present: Vec<_> = commitment
            .htlcs
            .iter()
            .filter(|(htlc, _)| !htlc.offered && htlc.transaction_output_index.is_some())
            .map(|(htlc, _)| (htlc.payment_hash, htlc.amount_msat))
            .collect();
        self.fail_unbroadcast_htlcs(&present, height);
        true
    }

    fn check_spend_holder_transaction(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.compute_txid();
        let commitment = if self.current_holder_commitment.tx.compute_txid() == txid {
            self.current_holder_commitment.clone()
        } else if let Some(prev) = self.prev_holder_commitment.as_ref().filter(|c| c.tx.compute_txid() == txid) {
            prev.clone()
        } else {
            debug!(%txid, "funding spent by a transaction we don't recognise, likely a cooperative close");
            self.record_static_outputs(tx, height);
            return;
        };
        info!(%txid, "our commitment confirmed");
        let delayed_script = get_revokeable_redeemscript(
            &commitment.keys.revocation_key,
            self.holder_to_self_delay,
            &commitment.keys.broadcaster_delayed_payment_key,
        );
        let delayed_spk = p2wsh_script(&delayed_script);
        if let Ok(key) = self
            .keys
            .delayed_payment_key(&*SECP, &commitment.keys.per_commitment_point)
        {
            for (vout, output) in tx.output.iter().enumerate() {
                if output.script_pubkey == delayed_spk {
                    self.onchain_events_waiting_threshold_conf.push(OnchainEventEntry {
                        height,
                        event: OnchainEvent::MaturingOutput {
                            descriptor: SpendableOutputDescriptor::DynamicOutputP2WSH {
                                outpoint: bitcoin::OutPoint { txid, vout: vout as u32 },
                                key,
                                witness_script: delayed_script.clone(),
                                to_self_delay: self.holder_to_self_delay,
                                output: output.clone(),
                            },
                        },
                    });
                }
            }
        }
        let present: Vec<_> = commitment
            .htlcs
            .iter()
            .filter(|output| output.htlc.offered && output.htlc.transaction_output_index.is_some())
            .map(|output| (output.htlc.payment_hash, output.htlc.amount_msat))
            .collect();
        self.fail_unbroadcast_htlcs(&present, height);
    }

    /// Our `to_remote` output on a counterparty commitment
    fn record_to_remote_output(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.compute_txid();
        let our_spk = p2wpkh_script(&self.keys.pubkeys().payment_point);
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey == our_spk {
                self.onchain_events_waiting_threshold_conf.push(OnchainEventEntry {
                    height,
                    event: OnchainEvent::MaturingOutput {
                        descriptor: SpendableOutputDescriptor::StaticOutputRemotePayment {
                            outpoint: bitcoin::OutPoint { txid, vout: vout as u32 },
                            key: *self.keys.payment_key(),
                            output: output.clone(),
                        },
                    },
                });
            }
        }
    }

    /// Outputs of a cooperative close paying our shutdown script
    fn record_static_outputs(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey == self.shutdown_script {
                self.onchain_events_waiting_threshold_conf.push(OnchainEventEntry {
                    height,
                    event: OnchainEvent::MaturingOutput {
                        descriptor: SpendableOutputDescriptor::StaticOutput {
                            outpoint: bitcoin::OutPoint { txid, vout: vout as u32 },
                            output: output.clone(),
                        },
                    },
                });
            }
        }
    }

    /// Schedule failure of every HTLC we offered that is not among
    /// `present` (payment hash, amount) in the confirmed commitment
    fn fail_unbroadcast_htlcs(&mut self, present: &[(PaymentHash, u64)], height: u32) {
        let mut sources: Vec<(PaymentHash, u64, HTLCSource)> = Vec::new();
        for output in &self.current_holder_commitment.htlcs {
            if let (true, Some(source)) = (output.htlc.offered, &output.source) {
                sources.push((output.htlc.payment_hash, output.htlc.amount_msat, source.clone()));
            }
        }
        for txid in [self.current_counterparty_txid, self.prev_counterparty_txid].into_iter().flatten() {
            if let Some(commitment) = self.counterparty_commitments.get(&txid) {
                for (htlc, source) in &commitment.htlcs {
                    if let (false, Some(source)) = (htlc.offered, source) {
                        sources.push((htlc.payment_hash, htlc.amount_msat, source.clone()));
                    }
                }
            }
        }
        let mut seen = Vec::new();
        for (payment_hash, amount_msat, source) in sources {
            if present.contains(&(payment_hash, amount_msat)) || seen.contains(&source) {
                continue;
            }
            if self.onchain_events_waiting_threshold_conf.iter().any(|entry| {
                matches!(&entry.event, OnchainEvent::HTLCFailed { source: s, .. } if *s == source)
            }) {
                continue;
            }
            debug!(%payment_hash, "HTLC missing from confirmed commitment, failing back after confirmations");
            seen.push(source.clone());
            self.onchain_events_waiting_threshold_conf.push(OnchainEventEntry {
                height,
                event: OnchainEvent::HTLCFailed { payment_hash, source },
            });
        }
    }

    fn check_claims_spent(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.compute_txid();
        for claim in &mut self.pending_claims {
            for input in &tx.input {
                for (outpoint, spent) in &mut claim.outpoints {
                    if *outpoint == input.previous_output && spent.is_none() {
                        *spent = Some(height);
                    }
                }
            }
            if claim.tx.compute_txid() == txid {
                if let Some((script, key)) = claim.delayed_output.clone() {
                    if let Some(output) = tx.output.first() {
                        self.onchain_events_waiting_threshold_conf.push(OnchainEventEntry {
                            height,
                            event: OnchainEvent::MaturingOutput {
                                descriptor: SpendableOutputDescriptor::DynamicOutputP2WSH {
                                    outpoint: bitcoin::OutPoint { txid, vout: 0 },
                                    key,
                                    witness_script: script,
                                    to_self_delay: self.holder_to_self_delay,
                                    output: output.clone(),
                                },
                            },
                        });
                    }
                }
            }
        }
    }

    /// Watch spends of HTLC outputs we offered: a revealed preimage is
    /// passed upstream at once, a timeout after confirmations
    fn is_resolving_htlc_output(&mut self, tx: &Transaction, height: u32) {
        for input in &tx.input {
            let prev = input.previous_output;
            if self.resolved_htlc_outpoints.contains(&prev) {
                continue;
            }
            let Some((payment_hash, source)) = self.offered_htlc_at(&prev) else {
                continue;
            };
            let preimage = input
                .witness
                .iter()
                .filter(|item| item.len() == 32)
                .find_map(|item| {
                    let hash = PaymentHash(sha256(item));
                    (hash == payment_hash).then(|| {
                        let mut preimage = [0u8; 32];
                        preimage.copy_from_slice(item);
                        PaymentPreimage(preimage)
                    })
                });
            self.resolved_htlc_outpoints.insert(prev);
            match preimage {
                Some(payment_preimage) => {
                    info!(%payment_hash, "preimage revealed on chain");
                    self.payment_preimages.insert(payment_hash, payment_preimage);
                    self.pending_monitor_events.push(MonitorEvent::HTLCEvent(HTLCUpdate {
                        payment_hash,
                        payment_preimage: Some(payment_preimage),
                        source,
                    }));
                }
                None => {
                    debug!(%payment_hash, "offered HTLC timed out on chain");
                    self.onchain_events_waiting_threshold_conf.push(OnchainEventEntry {
                        height,
                        event: OnchainEvent::HTLCFailed { payment_hash, source },
                    });
                }
            }
        }
    }

    /// Payment hash and source of the HTLC we offered at `outpoint`, if any
    fn offered_htlc_at(&self, outpoint: &bitcoin::OutPoint) -> Option<(PaymentHash, HTLCSource)> {
        if let Some(commitment) = self.counterparty_commitments.get(&outpoint.txid) {
            return commitment.htlcs.iter().find_map(|(htlc, source)| {
                match (htlc.offered, htlc.transaction_output_index, source) {
                    (false, Some(vout), Some(source)) if vout == outpoint.vout => {
                        Some((htlc.payment_hash, source.clone()))
                    }
                    _ => None,
                }
            });
        }
        let holder = std::iter::once(&self.current_holder_commitment).chain(self.prev_holder_commitment.as_ref());
        for commitment in holder {
            if commitment.tx.compute_txid() != outpoint.txid {
                continue;
            }
            return commitment.htlcs.iter().find_map(|output| {
                match (output.htlc.offered, output.htlc.transaction_output_index, &output.source) {
                    (true, Some(vout), Some(source)) if vout == outpoint.vout => {
                        Some((output.htlc.payment_hash, source.clone()))
                    }
                    _ => None,
                }
            });
        }
        None
    }

    fn mature_onchain_events(&mut self, height: u32) {
        let (matured, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.onchain_events_waiting_threshold_conf)
            .into_iter()
            .partition(|entry| entry.height + ANTI_REORG_DELAY - 1 <= height);
        self.onchain_events_waiting_threshold_conf = waiting;
        for entry in matured {
            match entry.event {
                OnchainEvent::HTLCFailed { payment_hash, source } => {
                    self.pending_monitor_events.push(MonitorEvent::HTLCEvent(HTLCUpdate {
                        payment_hash,
                        payment_preimage: None,
                        source,
                    }));
                }
                OnchainEvent::MaturingOutput { descriptor } => {
                    debug!(?descriptor, "output matured");
                    self.pending_spendable_outputs.push(descriptor);
                }
            }
        }
    }

    /// Channel capacity
    #[must_use]
    pub fn channel_value_satoshis(&self) -> u64 {
        self.channel_value_satoshis
    }

    /// True once the channel was force-closed off-chain
    #[must_use]
    pub fn is_locked_down(&self) -> bool {
        self.lockdown_from_offchain
    }
}

fn claim_input(txid: Txid, vout: u32, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output: bitcoin::OutPoint { txid, vout },
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    }
}
