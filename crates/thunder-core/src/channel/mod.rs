//! Per-channel state machine.
//!
//! A [`Channel`] owns everything about one payment channel except the
//! on-chain enforcement, which lives in its
//! [`ChannelMonitor`](crate::chain::monitor::ChannelMonitor):
//!
//! ```text
//!   NegotiatingOpen --> FundingCreated --> FundingSigned
//!          |                                   |
//!          +-------(acceptor)------------------+
//!                                              v
//!                  AwaitingFundingConfirmation --> NormalOperation --> Closing --> Closed
//! ```
//!
//! Channels never talk to the network. Every message handler returns the
//! messages to send and the [`ChannelMonitorUpdate`]s that must be
//! persisted first; the manager routes both.
//!
//! Commitment numbers count up from 0. Our commitment `n` uses the
//! per-commitment secret at index `INITIAL_COMMITMENT_NUMBER - n`.

pub mod htlc;
pub mod state;
mod updates;

use crate::chain::monitor::{
    CLOSED_CHANNEL_UPDATE_ID, ChannelMonitor, ChannelMonitorUpdate, ChannelMonitorUpdateStep,
    HolderCommitmentTransaction, MonitorParams,
};
use crate::chain::{ConfirmationTarget, FeeEstimator, OutPoint, floored_feerate};
use crate::channel::htlc::{DroppedHTLC, HTLCSource, LockedInHTLC, ResolvedHTLC};
use crate::channel::state::{
    ChannelFlags, ChannelState, CommitmentStats, CommitmentView, HoldingCellUpdate, LogUpdate,
    RAACommitmentOrder, UpdateLog, ViewHTLC, view_stats,
};
use crate::commitment::{
    COMMITMENT_TX_WEIGHT_PER_HTLC, ChannelPublicKeys, CommitmentTransaction, CommitmentTxParams,
    HTLC_SUCCESS_TX_WEIGHT, HTLC_TIMEOUT_TX_WEIGHT, HTLCOutputInCommitment, INITIAL_COMMITMENT_NUMBER,
    TxCreationKeys, build_closing_transaction, build_commitment_transaction, commitment_obscure_factor,
    commitment_tx_fee_sat, funding_witness, make_funding_redeemscript, p2wpkh_script, p2wsh_script,
    p2wsh_sighash,
};
use crate::config::{ChannelConfig, UserConfig};
use crate::error::{APIError, ChannelError};
use crate::events::CommitmentUpdate;
use crate::features::ChannelFeatures;
use crate::keys::{ChannelKeys, KeysInterface, SECP};
use crate::msgs::{
    AcceptChannel, AnnouncementSignatures, ChannelAnnouncement, ClosingSigned, FundingCreated,
    FundingLocked, FundingSigned, OpenChannel, RevokeAndACK, Shutdown, UnsignedChannelAnnouncement,
};
use crate::types::{ChannelId, scid_from_parts};
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{BlockHash, Script, ScriptBuf, Transaction, Txid};
use std::fmt;
use thunder_crypto::CryptoError;
use thunder_crypto::shachain::CounterpartyCommitmentSecrets;
use tracing::{debug, info, warn};

/// Channels must be smaller than this
pub const MAX_FUNDING_SATOSHIS: u64 = 1 << 24;

/// Protocol limit on HTLCs offered in one direction
pub const MAX_HTLCS: u16 = 483;

/// How many HTLCs we let the counterparty offer us at once
pub const OUR_MAX_HTLCS: u16 = 50;

/// Dust limit on our own commitments
pub const HOLDER_DUST_LIMIT_SATOSHIS: u64 = 546;

/// Confirmations before a public channel's announcement signatures go out
pub const ANNOUNCEMENT_DEPTH: u32 = 6;

/// Failure code bit flagging an onion we could not parse
pub const BADONION: u16 = 0x8000;

/// Expected weight of a two-output cooperative close
const CLOSING_TX_WEIGHT: u64 = 672;

/// Reserve we require the counterparty to keep: 1% of the channel, at
/// least 1000 sat, never more than the channel itself
#[must_use]
pub fn holder_selected_channel_reserve_satoshis(channel_value_satoshis: u64) -> u64 {
    channel_value_satoshis.min((channel_value_satoshis / 100).max(1000))
}

fn signer_error(err: CryptoError) -> ChannelError {
    ChannelError::close(format!("signer failure: {err}"))
}

fn is_acceptable_shutdown_script(script: &Script) -> bool {
    script.is_p2pkh() || script.is_p2sh() || script.is_p2wpkh() || script.is_p2wsh()
}

/// Parameters for [`Channel::new_outbound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundParams {
    /// Channel capacity
    pub channel_value_satoshis: u64,
    /// Amount gifted to the acceptor at open
    pub push_msat: u64,
    /// Opaque id echoed back in events
    pub user_id: u64,
}

/// Everything a channel message handler asks the manager to do
#[derive(Debug)]
pub struct ChannelOutcome {
    /// Revocation to send
    pub revoke_and_ack: Option<RevokeAndACK>,
    /// Updates and signature to send
    pub commitment_update: Option<CommitmentUpdate>,
    /// Which of the two goes first
    pub order: RAACommitmentOrder,
    /// Must be applied to the monitor before anything above is sent
    pub monitor_update: Option<ChannelMonitorUpdate>,
    /// `funding_locked` to retransmit
    pub funding_locked: Option<FundingLocked>,
    /// `shutdown` to retransmit
    pub shutdown: Option<Shutdown>,
    /// Received HTLCs now irrevocably committed
    pub locked_in: Vec<LockedInHTLC>,
    /// Our HTLCs the counterparty resolved
    pub resolved: Vec<ResolvedHTLC>,
    /// Held HTLCs that could not be sent and must be failed upstream
    pub dropped: Vec<DroppedHTLC>,
}

impl ChannelOutcome {
    fn new(order: RAACommitmentOrder) -> Self {
        Self {
            revoke_and_ack: None,
            commitment_update: None,
            order,
            monitor_update: None,
            funding_locked: None,
            shutdown: None,
            locked_in: Vec::new(),
            resolved: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

/// A commitment built for one side, its HTLCs matched back to log ids
struct BuiltCommitment {
    commitment: CommitmentTransaction,
    keys: TxCreationKeys,
    feerate_per_kw: u32,
    htlcs: Vec<(HTLCOutputInCommitment, ViewHTLC)>,
}

/// One payment channel with one peer
pub struct Channel {
    user_id: u64,
    channel_id: ChannelId,
    temporary_channel_id: ChannelId,
    state: ChannelState,
    flags: ChannelFlags,
    is_outbound: bool,
    counterparty_node_id: PublicKey,
    config: ChannelConfig,

    keys: ChannelKeys,
    shutdown_pubkey: PublicKey,
    destination_script: ScriptBuf,

    channel_value_satoshis: u64,
    funding_txo: Option<OutPoint>,
    obscure_factor: u64,
    funding_tx_confirmed_in: Option<(BlockHash, u32)>,
    best_block_height: u32,
    short_channel_id: Option<u64>,
    minimum_depth: u32,

    holder_dust_limit_satoshis: u64,
    counterparty_dust_limit_satoshis: u64,
    holder_selected_channel_reserve_satoshis: u64,
    counterparty_selected_channel_reserve_satoshis: u64,
    holder_htlc_minimum_msat: u64,
    counterparty_htlc_minimum_msat: u64,
    holder_max_htlc_value_in_flight_msat: u64,
    counterparty_max_htlc_value_in_flight_msat: u64,
    holder_max_accepted_htlcs: u16,
    counterparty_max_accepted_htlcs: u16,
    holder_selected_contest_delay: u16,
    counterparty_selected_contest_delay: u16,
    counterparty_pubkeys: Option<ChannelPublicKeys>,
    counterparty_first_point: Option<PublicKey>,
    counterparty_shutdown_scriptpubkey: Option<ScriptBuf>,

    local_log: UpdateLog,
    remote_log: UpdateLog,
    holding_cell: Vec<HoldingCellUpdate>,
    base_local_msat: u64,
    base_remote_msat: u64,
    feerate_per_kw: u32,
    holder_tip: CommitmentView,
    remote_tail: CommitmentView,
    remote_tip: CommitmentView,
    holder_commitment_number: u64,
    counterparty_tail_number: u64,
    counterparty_tip_number: u64,
    counterparty_cur_point: Option<PublicKey>,
    counterparty_next_point: Option<PublicKey>,
    counterparty_secrets: CounterpartyCommitmentSecrets,
    next_holder_htlc_id: u64,
    next_counterparty_htlc_id: u64,

    latest_monitor_update_id: u64,
    resend_order: RAACommitmentOrder,
    monitor_pending_revoke_and_ack: bool,
    monitor_pending_commitment_signed: bool,
    monitor_pending_locked_in: Vec<LockedInHTLC>,

    last_sent_closing_fee: Option<u64>,
    announcement_sigs_sent: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("is_outbound", &self.is_outbound)
            .field("channel_value_satoshis", &self.channel_value_satoshis)
            .finish_non_exhaustive()
    }
}

// ============ Opening ============

impl Channel {
    fn init(
        keys_provider: &dyn KeysInterface,
        counterparty_node_id: PublicKey,
        is_outbound: bool,
        channel_value_satoshis: u64,
        user_id: u64,
        config: &UserConfig,
    ) -> Self {
        let keys = keys_provider.get_channel_keys(!is_outbound, channel_value_satoshis);
        let temporary_channel_id = ChannelId(keys_provider.get_secure_random_bytes());
        Self {
            user_id,
            channel_id: temporary_channel_id,
            temporary_channel_id,
            state: ChannelState::NegotiatingOpen,
            flags: ChannelFlags::default(),
            is_outbound,
            counterparty_node_id,
            config: config.channel_options,
            keys,
            shutdown_pubkey: keys_provider.get_shutdown_pubkey(),
            destination_script: keys_provider.get_destination_script(),
            channel_value_satoshis,
            funding_txo: None,
            obscure_factor: 0,
            funding_tx_confirmed_in: None,
            best_block_height: 0,
            short_channel_id: None,
            minimum_depth: config.own_channel_config.minimum_depth,
            holder_dust_limit_satoshis: HOLDER_DUST_LIMIT_SATOSHIS,
            counterparty_dust_limit_satoshis: 0,
            holder_selected_channel_reserve_satoshis: holder_selected_channel_reserve_satoshis(
                channel_value_satoshis,
            ),
            counterparty_selected_channel_reserve_satoshis: 0,
            holder_htlc_minimum_msat: config.own_channel_config.our_htlc_minimum_msat.max(1),
            counterparty_htlc_minimum_msat: 0,
            holder_max_htlc_value_in_flight_msat: channel_value_satoshis * 1000,
            counterparty_max_htlc_value_in_flight_msat: 0,
            holder_max_accepted_htlcs: OUR_MAX_HTLCS,
            counterparty_max_accepted_htlcs: 0,
            holder_selected_contest_delay: config.own_channel_config.our_to_self_delay,
            counterparty_selected_contest_delay: 0,
            counterparty_pubkeys: None,
            counterparty_first_point: None,
            counterparty_shutdown_scriptpubkey: None,
            local_log: UpdateLog::default(),
            remote_log: UpdateLog::default(),
            holding_cell: Vec::new(),
            base_local_msat: 0,
            base_remote_msat: 0,
            feerate_per_kw: 0,
            holder_tip: CommitmentView::default(),
            remote_tail: CommitmentView::default(),
            remote_tip: CommitmentView::default(),
            holder_commitment_number: 0,
            counterparty_tail_number: 0,
            counterparty_tip_number: 0,
            counterparty_cur_point: None,
            counterparty_next_point: None,
            counterparty_secrets: CounterpartyCommitmentSecrets::new(),
            next_holder_htlc_id: 0,
            next_counterparty_htlc_id: 0,
            latest_monitor_update_id: 0,
            resend_order: RAACommitmentOrder::CommitmentFirst,
            monitor_pending_revoke_and_ack: false,
            monitor_pending_commitment_signed: false,
            monitor_pending_locked_in: Vec::new(),
            last_sent_closing_fee: None,
            announcement_sigs_sent: false,
        }
    }

    /// Start opening a channel to `counterparty_node_id`.
    ///
    /// # Errors
    ///
    /// [`APIError::APIMisuseError`] if the value is 2^24 sat or more, or
    /// the push amount exceeds it.
    pub fn new_outbound(
        keys_provider: &dyn KeysInterface,
        fee_estimator: &dyn FeeEstimator,
        counterparty_node_id: PublicKey,
        params: OutboundParams,
        config: &UserConfig,
    ) -> Result<Self, APIError> {
        let OutboundParams {
            channel_value_satoshis,
            push_msat,
            user_id,
        } = params;
        if channel_value_satoshis >= MAX_FUNDING_SATOSHIS {
            return Err(APIError::APIMisuseError {
                err: "funding value must be smaller than 2^24 sat".into(),
            });
        }
        if push_msat > channel_value_satoshis * 1000 {
            return Err(APIError::APIMisuseError {
                err: "push value exceeds the channel value".into(),
            });
        }
        let reserve = holder_selected_channel_reserve_satoshis(channel_value_satoshis);
        if reserve >= channel_value_satoshis {
            return Err(APIError::APIMisuseError {
                err: "funding value too small to cover the channel reserve".into(),
            });
        }

        let feerate = floored_feerate(fee_estimator, ConfirmationTarget::Normal);
        let mut channel = Self::init(keys_provider, counterparty_node_id, true, channel_value_satoshis, user_id, config);
        channel.base_local_msat = channel_value_satoshis * 1000 - push_msat;
        channel.base_remote_msat = push_msat;
        channel.feerate_per_kw = feerate;
        debug!(
            channel_id = %channel.channel_id,
            channel_value_satoshis,
            push_msat,
            "created outbound channel"
        );
        Ok(channel)
    }

    fn check_remote_fee(fee_estimator: &dyn FeeEstimator, feerate_per_kw: u32) -> Result<(), ChannelError> {
        if feerate_per_kw < floored_feerate(fee_estimator, ConfirmationTarget::Background) {
            return Err(ChannelError::close("peer's feerate much too low"));
        }
        let ceiling = floored_feerate(fee_estimator, ConfirmationTarget::HighPriority).saturating_mul(2);
        if feerate_per_kw > ceiling {
            return Err(ChannelError::close("peer's feerate much too high"));
        }
        Ok(())
    }

    fn set_counterparty_shutdown_script(&mut self, script: &[u8]) -> Result<(), ChannelError> {
        if script.is_empty() {
            return Ok(());
        }
        let script = ScriptBuf::from_bytes(script.to_vec());
        if !is_acceptable_shutdown_script(&script) {
            return Err(ChannelError::close("peer sent a non-standard upfront shutdown script"));
        }
        self.counterparty_shutdown_scriptpubkey = Some(script);
        Ok(())
    }

    /// Accept an inbound `open_channel`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] when the proposal breaks protocol rules or
    /// our [`crate::config::ChannelHandshakeLimits`].
    pub fn new_from_req(
        keys_provider: &dyn KeysInterface,
        fee_estimator: &dyn FeeEstimator,
        counterparty_node_id: PublicKey,
        msg: &OpenChannel,
        user_id: u64,
        config: &UserConfig,
    ) -> Result<Self, ChannelError> {
        let limits = &config.peer_channel_config_limits;
        let funding = msg.funding_satoshis;

        if funding >= MAX_FUNDING_SATOSHIS {
            return Err(ChannelError::close("funding value must be smaller than 2^24 sat"));
        }
        if msg.channel_reserve_satoshis > funding {
            return Err(ChannelError::close("bogus channel_reserve_satoshis"));
        }
        if msg.push_msat > (funding - msg.channel_reserve_satoshis) * 1000 {
            return Err(ChannelError::close("push_msat larger than funding value"));
        }
        if msg.dust_limit_satoshis > msg.channel_reserve_satoshis {
            return Err(ChannelError::close("bogus dust limit: greater than channel reserve"));
        }
        if msg.htlc_minimum_msat >= (funding - msg.channel_reserve_satoshis) * 1000 {
            return Err(ChannelError::close("minimum HTLC value was larger than full channel value"));
        }
        Self::check_remote_fee(fee_estimator, msg.feerate_per_kw)?;
        if msg.to_self_delay > limits.their_to_self_delay {
            return Err(ChannelError::close("they wanted our payments to be delayed by a needlessly long period"));
        }
        if msg.max_accepted_htlcs < 1 {
            return Err(ChannelError::close("0 max_accepted_htlcs makes for a useless channel"));
        }
        if msg.max_accepted_htlcs > MAX_HTLCS {
            return Err(ChannelError::close("max_accepted_htlcs was over 483"));
        }

        if funding < limits.min_funding_satoshis {
            return Err(ChannelError::close("funding satoshis is less than our minimum"));
        }
        if msg.htlc_minimum_msat > limits.max_htlc_minimum_msat {
            return Err(ChannelError::close("htlc_minimum_msat is higher than our limit"));
        }
        if msg.max_htlc_value_in_flight_msat < limits.min_max_htlc_value_in_flight_msat {
            return Err(ChannelError::close("max_htlc_value_in_flight_msat is lower than our limit"));
        }
        if msg.channel_reserve_satoshis > limits.max_channel_reserve_satoshis {
            return Err(ChannelError::close("channel_reserve_satoshis is higher than our limit"));
        }
        if msg.max_accepted_htlcs < limits.min_max_accepted_htlcs {
            return Err(ChannelError::close("max_accepted_htlcs is lower than our limit"));
        }
        if msg.dust_limit_satoshis < limits.min_dust_limit_satoshis {
            return Err(ChannelError::close("dust_limit_satoshis is lower than our limit"));
        }
        if msg.dust_limit_satoshis > limits.max_dust_limit_satoshis {
            return Err(ChannelError::close("dust_limit_satoshis is higher than our limit"));
        }
        let their_announce = msg.channel_flags & 1 == 1;
        if limits.force_announced_channel_preference && their_announce != config.channel_options.announced_channel {
            return Err(ChannelError::close("peer's announcement preference differs from ours"));
        }

        let holder_reserve = holder_selected_channel_reserve_satoshis(funding);
        if holder_reserve < msg.dust_limit_satoshis {
            return Err(ChannelError::close("suitable channel reserve not found"));
        }
        let their_balance_msat = funding * 1000 - msg.push_msat;
        if their_balance_msat < commitment_tx_fee_sat(msg.feerate_per_kw, 0) * 1000 {
            return Err(ChannelError::close("funding amount is insufficient for initial commitment fee"));
        }

        let mut channel = Self::init(keys_provider, counterparty_node_id, false, funding, user_id, config);
        channel.temporary_channel_id = msg.temporary_channel_id;
        channel.channel_id = msg.temporary_channel_id;
        channel.config.announced_channel = their_announce;
        channel.base_local_msat = msg.push_msat;
        channel.base_remote_msat = their_balance_msat;
        channel.feerate_per_kw = msg.feerate_per_kw;
        channel.counterparty_dust_limit_satoshis = msg.dust_limit_satoshis;
        channel.counterparty_selected_channel_reserve_satoshis = msg.channel_reserve_satoshis;
        channel.counterparty_htlc_minimum_msat = msg.htlc_minimum_msat;
        channel.counterparty_max_htlc_value_in_flight_msat = msg.max_htlc_value_in_flight_msat.min(funding * 1000);
        channel.counterparty_max_accepted_htlcs = msg.max_accepted_htlcs;
        channel.counterparty_selected_contest_delay = msg.to_self_delay;
        channel.counterparty_pubkeys = Some(ChannelPublicKeys {
            funding_pubkey: msg.funding_pubkey,
            revocation_basepoint: msg.revocation_basepoint,
            payment_point: msg.payment_point,
            delayed_payment_basepoint: msg.delayed_payment_basepoint,
            htlc_basepoint: msg.htlc_basepoint,
        });
        channel.counterparty_first_point = Some(msg.first_per_commitment_point);
        channel.counterparty_cur_point = Some(msg.first_per_commitment_point);
        channel.set_counterparty_shutdown_script(&msg.shutdown_scriptpubkey)?;

        debug!(
            channel_id = %channel.channel_id,
            funding_satoshis = funding,
            push_msat = msg.push_msat,
            "accepted inbound channel request"
        );
        Ok(channel)
    }

    fn upfront_shutdown_script(&self) -> Vec<u8> {
        if self.config.commit_upfront_shutdown_pubkey {
            p2wpkh_script(&self.shutdown_pubkey).to_bytes()
        } else {
            Vec::new()
        }
    }

    /// The `open_channel` message for an outbound channel.
    ///
    /// # Errors
    ///
    /// [`APIError::APIMisuseError`] if the channel is inbound or past
    /// negotiation.
    pub fn get_open_channel(&self, chain_hash: ChainHash) -> Result<OpenChannel, APIError> {
        if !self.is_outbound || self.state != ChannelState::NegotiatingOpen || self.counterparty_pubkeys.is_some() {
            return Err(APIError::APIMisuseError {
                err: "open_channel is only sent once, by the opener".into(),
            });
        }
        let pubkeys = self.keys.pubkeys();
        Ok(OpenChannel {
            chain_hash,
            temporary_channel_id: self.temporary_channel_id,
            funding_satoshis: self.channel_value_satoshis,
            push_msat: self.base_remote_msat,
            dust_limit_satoshis: self.holder_dust_limit_satoshis,
            max_htlc_value_in_flight_msat: self.holder_max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: self.holder_selected_channel_reserve_satoshis,
            htlc_minimum_msat: self.holder_htlc_minimum_msat,
            feerate_per_kw: self.feerate_per_kw,
            to_self_delay: self.holder_selected_contest_delay,
            max_accepted_htlcs: self.holder_max_accepted_htlcs,
            funding_pubkey: pubkeys.funding_pubkey,
            revocation_basepoint: pubkeys.revocation_basepoint,
            payment_point: pubkeys.payment_point,
            delayed_payment_basepoint: pubkeys.delayed_payment_basepoint,
            htlc_basepoint: pubkeys.htlc_basepoint,
            first_per_commitment_point: self.holder_point(0).map_err(|e| APIError::APIMisuseError {
                err: e.to_string().into(),
            })?,
            channel_flags: u8::from(self.config.announced_channel),
            shutdown_scriptpubkey: self.upfront_shutdown_script(),
        })
    }

    /// The `accept_channel` reply for an inbound channel.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the channel is outbound or past
    /// negotiation.
    pub fn get_accept_channel(&self) -> Result<AcceptChannel, ChannelError> {
        if self.is_outbound || self.state != ChannelState::NegotiatingOpen {
            return Err(ChannelError::close("accept_channel is only sent by the acceptor"));
        }
        let pubkeys = self.keys.pubkeys();
        Ok(AcceptChannel {
            temporary_channel_id: self.temporary_channel_id,
            dust_limit_satoshis: self.holder_dust_limit_satoshis,
            max_htlc_value_in_flight_msat: self.holder_max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: self.holder_selected_channel_reserve_satoshis,
            htlc_minimum_msat: self.holder_htlc_minimum_msat,
            minimum_depth: self.minimum_depth,
            to_self_delay: self.holder_selected_contest_delay,
            max_accepted_htlcs: self.holder_max_accepted_htlcs,
            funding_pubkey: pubkeys.funding_pubkey,
            revocation_basepoint: pubkeys.revocation_basepoint,
            payment_point: pubkeys.payment_point,
            delayed_payment_basepoint: pubkeys.delayed_payment_basepoint,
            htlc_basepoint: pubkeys.htlc_basepoint,
            first_per_commitment_point: self.holder_point(0)?,
            shutdown_scriptpubkey: self.upfront_shutdown_script(),
        })
    }

    /// Handle the acceptor's `accept_channel`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] when the reply breaks protocol rules or our
    /// limits.
    pub fn accept_channel(&mut self, msg: &AcceptChannel, config: &UserConfig) -> Result<(), ChannelError> {
        let limits = &config.peer_channel_config_limits;
        if !self.is_outbound {
            return Err(ChannelError::close("got an accept_channel message from an inbound peer"));
        }
        if self.state != ChannelState::NegotiatingOpen || self.counterparty_pubkeys.is_some() {
            return Err(ChannelError::close("got an accept_channel message at a strange time"));
        }
        let value = self.channel_value_satoshis;

        if msg.dust_limit_satoshis < limits.min_dust_limit_satoshis {
            return Err(ChannelError::close("dust_limit_satoshis is lower than our limit"));
        }
        if msg.dust_limit_satoshis > limits.max_dust_limit_satoshis {
            return Err(ChannelError::close("dust_limit_satoshis is higher than our limit"));
        }
        if msg.channel_reserve_satoshis > value {
            return Err(ChannelError::close("bogus channel_reserve_satoshis"));
        }
        if msg.dust_limit_satoshis > self.holder_selected_channel_reserve_satoshis {
            return Err(ChannelError::close("dust_limit_satoshis is greater than our channel reserve"));
        }
        if msg.channel_reserve_satoshis > value - self.holder_selected_channel_reserve_satoshis {
            return Err(ChannelError::close("bogus channel_reserve and dust_limit"));
        }
        if msg.htlc_minimum_msat >= (value - msg.channel_reserve_satoshis) * 1000 {
            return Err(ChannelError::close("minimum HTLC value is full channel value"));
        }
        if msg.to_self_delay > limits.their_to_self_delay {
            return Err(ChannelError::close("they wanted our payments to be delayed by a needlessly long period"));
        }
        if msg.max_accepted_htlcs < 1 {
            return Err(ChannelError::close("0 max_accepted_htlcs makes for a useless channel"));
        }
        if msg.max_accepted_htlcs > MAX_HTLCS {
            return Err(ChannelError::close("max_accepted_htlcs was over 483"));
        }
        if msg.htlc_minimum_msat > limits.max_htlc_minimum_msat {
            return Err(ChannelError::close("htlc_minimum_msat is higher than our limit"));
        }
        if msg.max_htlc_value_in_flight_msat < limits.min_max_htlc_value_in_flight_msat {
            return Err(ChannelError::close("max_htlc_value_in_flight_msat is lower than our limit"));
        }
        if msg.channel_reserve_satoshis > limits.max_channel_reserve_satoshis {
            return Err(ChannelError::close("channel_reserve_satoshis is higher than our limit"));
        }
        if msg.max_accepted_htlcs < limits.min_max_accepted_htlcs {
            return Err(ChannelError::close("max_accepted_htlcs is lower than our limit"));
        }
        if msg.minimum_depth > limits.max_minimum_depth {
            return Err(ChannelError::close("we consider the minimum depth to be unreasonably large"));
        }

        self.set_counterparty_shutdown_script(&msg.shutdown_scriptpubkey)?;
        self.minimum_depth = msg.minimum_depth.max(1);
        self.counterparty_dust_limit_satoshis = msg.dust_limit_satoshis;
        self.counterparty_selected_channel_reserve_satoshis = msg.channel_reserve_satoshis;
        self.counterparty_htlc_minimum_msat = msg.htlc_minimum_msat;
        self.counterparty_max_htlc_value_in_flight_msat = msg.max_htlc_value_in_flight_msat.min(value * 1000);
        self.counterparty_max_accepted_htlcs = msg.max_accepted_htlcs;
        self.counterparty_selected_contest_delay = msg.to_self_delay;
        self.counterparty_pubkeys = Some(ChannelPublicKeys {
            funding_pubkey: msg.funding_pubkey,
            revocation_basepoint: msg.revocation_basepoint,
            payment_point: msg.payment_point,
            delayed_payment_basepoint: msg.delayed_payment_basepoint,
            htlc_basepoint: msg.htlc_basepoint,
        });
        self.counterparty_first_point = Some(msg.first_per_commitment_point);
        self.counterparty_cur_point = Some(msg.first_per_commitment_point);
        debug!(channel_id = %self.channel_id, minimum_depth = self.minimum_depth, "peer accepted channel");
        Ok(())
    }

    // ============ Funding ============

    /// Hand over the funding outpoint with our signature on the acceptor's
    /// first commitment.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the channel is not an accepted outbound
    /// channel or signing fails.
    pub fn get_outbound_funding_created(&mut self, funding_txo: OutPoint) -> Result<FundingCreated, ChannelError> {
        if !self.is_outbound || self.state != ChannelState::NegotiatingOpen || self.counterparty_pubkeys.is_none() {
            return Err(ChannelError::close("funding_created only follows accept_channel on an outbound channel"));
        }
        let counterparty = *self.counterparty_pubkeys()?;
        self.funding_txo = Some(funding_txo);
        self.obscure_factor = commitment_obscure_factor(&self.keys.pubkeys().payment_point, &counterparty.payment_point);

        let built = self.build_initial_counterparty_commitment()?;
        let (signature, _) = self.sign_counterparty_commitment(&built)?;

        self.channel_id = funding_txo.to_channel_id();
        self.transition_to(ChannelState::FundingCreated)?;
        info!(channel_id = %self.channel_id, funding = %funding_txo, "funding outpoint assigned");
        Ok(FundingCreated {
            temporary_channel_id: self.temporary_channel_id,
            funding_txid: funding_txo.txid.to_byte_array(),
            funding_output_index: funding_txo.index,
            signature,
        })
    }

    /// Acceptor side: check the opener's signature on our first commitment
    /// and sign theirs. The returned monitor must be persisted before
    /// `funding_signed` is sent.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] on a bad signature or unexpected message.
    pub fn funding_created(&mut self, msg: &FundingCreated) -> Result<(FundingSigned, ChannelMonitor), ChannelError> {
        if self.is_outbound {
            return Err(ChannelError::close("received funding_created for an outbound channel"));
        }
        if self.state != ChannelState::NegotiatingOpen {
            return Err(ChannelError::close("received funding_created after we got the channel"));
        }
        let counterparty = *self.counterparty_pubkeys()?;
        let funding_txo = OutPoint {
            txid: Txid::from_byte_array(msg.funding_txid),
            index: msg.funding_output_index,
        };
        self.funding_txo = Some(funding_txo);
        self.obscure_factor = commitment_obscure_factor(&counterparty.payment_point, &self.keys.pubkeys().payment_point);

        let holder = match self.initial_holder_commitment(&msg.signature) {
            Ok(holder) => holder,
            Err(err) => {
                self.funding_txo = None;
                return Err(err);
            }
        };
        let built = self.build_initial_counterparty_commitment()?;
        let (signature, _) = self.sign_counterparty_commitment(&built)?;
        let monitor = self.build_monitor(holder, built.commitment.tx.compute_txid())?;

        self.channel_id = funding_txo.to_channel_id();
        self.transition_to(ChannelState::FundingSigned)?;
        info!(channel_id = %self.channel_id, funding = %funding_txo, "signed inbound channel funding");
        Ok((
            FundingSigned {
                channel_id: self.channel_id,
                signature,
            },
            monitor,
        ))
    }

    /// Opener side: check the acceptor's signature on our first
    /// commitment. The returned monitor must be persisted before the
    /// funding transaction is broadcast.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] on a bad signature or unexpected message.
    pub fn funding_signed(&mut self, msg: &FundingSigned) -> Result<ChannelMonitor, ChannelError> {
        if !self.is_outbound {
            return Err(ChannelError::close("received funding_signed for an inbound channel"));
        }
        if self.state != ChannelState::FundingCreated {
            return Err(ChannelError::close("received funding_signed in strange state"));
        }
        let holder = self.initial_holder_commitment(&msg.signature)?;
        let counterparty_txid = self.build_initial_counterparty_commitment()?.commitment.tx.compute_txid();
        let monitor = self.build_monitor(holder, counterparty_txid)?;
        self.transition_to(ChannelState::FundingSigned)?;
        info!(channel_id = %self.channel_id, "funding signed by peer");
        Ok(monitor)
    }

    fn initial_holder_commitment(&self, counterparty_sig: &Signature) -> Result<HolderCommitmentTransaction, ChannelError> {
        let keys = self.holder_tx_keys(0)?;
        let built = self.build_commitment(true, CommitmentView::default(), 0, keys)?;
        self.verify_funding_sig(&built.commitment.tx, counterparty_sig)?;
        Ok(HolderCommitmentTransaction {
            tx: built.commitment.tx,
            counterparty_sig: *counterparty_sig,
            keys: built.keys,
            feerate_per_kw: built.feerate_per_kw,
            commitment_number: 0,
            htlcs: Vec::new(),
        })
    }

    fn build_initial_counterparty_commitment(&self) -> Result<BuiltCommitment, ChannelError> {
        let point = self
            .counterparty_first_point
            .ok_or_else(|| ChannelError::close("counterparty first commitment point unknown"))?;
        let keys = self.counterparty_tx_keys(&point)?;
        self.build_commitment(false, CommitmentView::default(), 0, keys)
    }

    fn build_monitor(
        &self,
        initial_holder_commitment: HolderCommitmentTransaction,
        initial_counterparty_commitment_txid: Txid,
    ) -> Result<ChannelMonitor, ChannelError> {
        let funding_outpoint = self.funding_outpoint()?;
        let initial_counterparty_point = self
            .counterparty_first_point
            .ok_or_else(|| ChannelError::close("counterparty first commitment point unknown"))?;
        Ok(ChannelMonitor::new(MonitorParams {
            keys: self.keys.clone(),
            shutdown_pubkey: self.shutdown_pubkey,
            destination_script: self.destination_script.clone(),
            funding_outpoint,
            funding_redeemscript: self.funding_redeemscript()?,
            channel_value_satoshis: self.channel_value_satoshis,
            counterparty_pubkeys: *self.counterparty_pubkeys()?,
            holder_to_self_delay: self.counterparty_selected_contest_delay,
            counterparty_to_self_delay: self.holder_selected_contest_delay,
            obscure_factor: self.obscure_factor,
            initial_holder_commitment,
            initial_counterparty_commitment_txid,
            initial_counterparty_point,
        }))
    }

    /// Track the funding transaction's confirmations. Returns
    /// `funding_locked` once it reaches the required depth.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the confirmed funding output does not pay
    /// the expected script and value.
    pub fn block_connected(
        &mut self,
        header: &Header,
        txdata: &[(usize, &Transaction)],
        height: u32,
    ) -> Result<Option<FundingLocked>, ChannelError> {
        self.best_block_height = height;
        if !self.state.is_funded() || self.state == ChannelState::Closed {
            return Ok(None);
        }
        let funding_txo = self.funding_outpoint()?;

        if self.funding_tx_confirmed_in.is_none() {
            for (index, tx) in txdata {
                if tx.compute_txid() != funding_txo.txid {
                    continue;
                }
                let expected = p2wsh_script(&self.funding_redeemscript()?);
                let matches = tx
                    .output
                    .get(usize::from(funding_txo.index))
                    .is_some_and(|out| out.script_pubkey == expected && out.value.to_sat() == self.channel_value_satoshis);
                if !matches {
                    return Err(ChannelError::close("funding transaction output does not match the channel"));
                }
                let tx_index = u32::try_from(*index).map_err(|_| ChannelError::close("block too large"))?;
                self.funding_tx_confirmed_in = Some((header.block_hash(), height));
                self.short_channel_id = scid_from_parts(height, tx_index, funding_txo.index);
                if self.state == ChannelState::FundingSigned {
                    self.transition_to(ChannelState::AwaitingFundingConfirmation)?;
                }
                info!(channel_id = %self.channel_id, height, "funding transaction confirmed");
            }
        }

        let Some((_, conf_height)) = self.funding_tx_confirmed_in else {
            return Ok(None);
        };
        if self.flags.our_funding_locked || height.saturating_sub(conf_height) + 1 < self.minimum_depth {
            return Ok(None);
        }
        self.flags.our_funding_locked = true;
        if self.flags.their_funding_locked && self.state == ChannelState::AwaitingFundingConfirmation {
            self.transition_to(ChannelState::NormalOperation)?;
        }
        if self.flags.peer_disconnected {
            return Ok(None);
        }
        Ok(Some(self.get_funding_locked()?))
    }

    /// Forget a block. Returns true if the funding transaction was
    /// reorganized out after the channel was locked, which requires a
    /// force close.
    pub fn block_disconnected(&mut self, header: &Header, height: u32) -> bool {
        self.best_block_height = height.saturating_sub(1);
        let Some((hash, _)) = self.funding_tx_confirmed_in else {
            return false;
        };
        if hash != header.block_hash() {
            return false;
        }
        warn!(channel_id = %self.channel_id, height, "funding transaction reorganized out");
        self.funding_tx_confirmed_in = None;
        self.short_channel_id = None;
        if self.flags.our_funding_locked {
            return true;
        }
        if self.state == ChannelState::AwaitingFundingConfirmation {
            self.state = ChannelState::FundingSigned;
        }
        false
    }

    fn get_funding_locked(&self) -> Result<FundingLocked, ChannelError> {
        Ok(FundingLocked {
            channel_id: self.channel_id,
            next_per_commitment_point: self.holder_point(1)?,
        })
    }

    /// Handle the peer's `funding_locked`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] before funding or on a conflicting repeat;
    /// [`ChannelError::Ignore`] for a harmless retransmission.
    pub fn funding_locked(&mut self, msg: &FundingLocked) -> Result<(), ChannelError> {
        if !self.state.is_funded() {
            return Err(ChannelError::close("peer sent funding_locked before funding was signed"));
        }
        if self.flags.their_funding_locked {
            let same = self.counterparty_tip_number != 0 || self.counterparty_next_point == Some(msg.next_per_commitment_point);
            return if same {
                Err(ChannelError::ignore("duplicate funding_locked"))
            } else {
                Err(ChannelError::close("peer sent a reconnect funding_locked with a different point"))
            };
        }
        self.flags.their_funding_locked = true;
        self.counterparty_next_point = Some(msg.next_per_commitment_point);
        if self.flags.our_funding_locked
            && matches!(self.state, ChannelState::AwaitingFundingConfirmation | ChannelState::FundingSigned)
        {
            self.transition_to(ChannelState::NormalOperation)?;
        }
        debug!(channel_id = %self.channel_id, "peer sent funding_locked");
        Ok(())
    }

    // ============ Closing ============

    fn drain_holding_cell_adds(&mut self) -> Vec<DroppedHTLC> {
        let channel_id = self.channel_id;
        let mut dropped = Vec::new();
        self.holding_cell.retain(|update| match update {
            HoldingCellUpdate::AddHTLC { source, payment_hash, .. } => {
                dropped.push(DroppedHTLC {
                    source: source.clone(),
                    payment_hash: *payment_hash,
                    channel_id,
                });
                false
            }
            _ => true,
        });
        dropped
    }

    fn shutdown_msg(&self) -> Shutdown {
        Shutdown {
            channel_id: self.channel_id,
            scriptpubkey: p2wpkh_script(&self.shutdown_pubkey).to_bytes(),
        }
    }

    /// Begin a cooperative close. Held HTLCs that were never sent come back
    /// to be failed upstream.
    ///
    /// # Errors
    ///
    /// [`APIError::APIMisuseError`] if shutdown was already sent;
    /// [`APIError::ChannelUnavailable`] while disconnected or frozen.
    pub fn get_shutdown(&mut self) -> Result<(Shutdown, Vec<DroppedHTLC>), APIError> {
        if !self.state.is_funded() || self.state == ChannelState::Closed {
            return Err(APIError::ChannelUnavailable {
                err: "channel is not funded".into(),
            });
        }
        if self.flags.local_shutdown_sent {
            return Err(APIError::APIMisuseError {
                err: "shutdown already in progress".into(),
            });
        }
        if self.flags.peer_disconnected || self.flags.monitor_update_in_progress {
            return Err(APIError::ChannelUnavailable {
                err: "cannot begin shutdown while peer is disconnected or a monitor update is pending".into(),
            });
        }
        let dropped = self.drain_holding_cell_adds();
        self.flags.local_shutdown_sent = true;
        if self.state != ChannelState::Closing {
            self.transition_to(ChannelState::Closing).map_err(|e| APIError::ChannelUnavailable {
                err: e.to_string().into(),
            })?;
        }
        info!(channel_id = %self.channel_id, "sending shutdown");
        Ok((self.shutdown_msg(), dropped))
    }

    /// Handle the peer's `shutdown`, replying with ours if not yet sent.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] on a bad script or a shutdown before funding.
    pub fn shutdown(&mut self, msg: &Shutdown) -> Result<(Option<Shutdown>, Vec<DroppedHTLC>), ChannelError> {
        if !self.state.is_funded() {
            return Err(ChannelError::close("peer sent shutdown pre-funding"));
        }
        if self.flags.peer_disconnected {
            return Err(ChannelError::close("peer sent shutdown when we needed a channel_reestablish"));
        }
        let script = ScriptBuf::from_bytes(msg.scriptpubkey.clone());
        if !is_acceptable_shutdown_script(&script) {
            return Err(ChannelError::close("got a non-standard scriptpubkey in shutdown"));
        }
        if let Some(upfront) = &self.counterparty_shutdown_scriptpubkey {
            if *upfront != script {
                return Err(ChannelError::close("shutdown script does not match the committed upfront script"));
            }
        }
        if self.flags.remote_shutdown_sent {
            return Err(ChannelError::ignore("duplicate shutdown"));
        }

        self.counterparty_shutdown_scriptpubkey = Some(script);
        self.flags.remote_shutdown_sent = true;
        if self.state != ChannelState::Closing {
            self.transition_to(ChannelState::Closing)?;
        }
        let dropped = self.drain_holding_cell_adds();
        let reply = if self.flags.local_shutdown_sent {
            None
        } else {
            self.flags.local_shutdown_sent = true;
            Some(self.shutdown_msg())
        };
        info!(channel_id = %self.channel_id, "peer sent shutdown");
        Ok((reply, dropped))
    }

    fn is_quiescent(&self) -> bool {
        self.local_log.iter().next().is_none()
            && self.remote_log.iter().next().is_none()
            && self.holding_cell.is_empty()
            && !self.flags.awaiting_remote_revoke
            && !self.flags.monitor_update_in_progress
    }

    fn proposed_closing_fee(&self, fee_estimator: &dyn FeeEstimator) -> u64 {
        let fee = u64::from(floored_feerate(fee_estimator, ConfirmationTarget::Normal)) * CLOSING_TX_WEIGHT / 1000;
        let opener_msat = if self.is_outbound { self.base_local_msat } else { self.base_remote_msat };
        fee.min(opener_msat / 1000)
    }

    fn build_closing_tx(&self, fee_sat: u64) -> Result<Transaction, ChannelError> {
        let funding_txo = self.funding_outpoint()?;
        let ours = p2wpkh_script(&self.shutdown_pubkey);
        let theirs = self
            .counterparty_shutdown_scriptpubkey
            .as_ref()
            .ok_or_else(|| ChannelError::close("no counterparty shutdown script"))?;
        let local_sat = self.base_local_msat / 1000;
        let remote_sat = self.base_remote_msat / 1000;
        let (opener_sat, acceptor_sat, opener_script, acceptor_script) = if self.is_outbound {
            (local_sat, remote_sat, ours.as_script(), theirs.as_script())
        } else {
            (remote_sat, local_sat, theirs.as_script(), ours.as_script())
        };
        if fee_sat > opener_sat {
            return Err(ChannelError::close("closing fee exceeds the opener's balance"));
        }
        Ok(build_closing_transaction(
            funding_txo.into_bitcoin_outpoint(),
            opener_sat,
            acceptor_sat,
            opener_script,
            acceptor_script,
            fee_sat,
            self.holder_dust_limit_satoshis.max(self.counterparty_dust_limit_satoshis),
        ))
    }

    fn sign_closing(&self, tx: &Transaction) -> Result<Signature, ChannelError> {
        self.keys
            .sign_closing_transaction(&*SECP, tx, &self.counterparty_pubkeys()?.funding_pubkey)
            .map_err(signer_error)
    }

    fn finalize_closing_tx(&self, mut tx: Transaction, their_sig: &Signature) -> Result<Transaction, ChannelError> {
        let our_sig = self.sign_closing(&tx)?;
        let counterparty = self.counterparty_pubkeys()?;
        let witness = funding_witness(
            &self.funding_redeemscript()?,
            &self.keys.pubkeys().funding_pubkey,
            &our_sig,
            &counterparty.funding_pubkey,
            their_sig,
        );
        if let Some(input) = tx.input.first_mut() {
            input.witness = witness;
        }
        Ok(tx)
    }

    /// The opener's first `closing_signed`, once both shutdowns are out and
    /// no updates are pending.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the closing transaction cannot be built.
    pub fn maybe_propose_first_closing_signed(
        &mut self,
        fee_estimator: &dyn FeeEstimator,
    ) -> Result<Option<ClosingSigned>, ChannelError> {
        if !self.is_outbound
            || !self.flags.local_shutdown_sent
            || !self.flags.remote_shutdown_sent
            || self.flags.peer_disconnected
            || self.last_sent_closing_fee.is_some()
            || self.state == ChannelState::Closed
            || !self.is_quiescent()
        {
            return Ok(None);
        }
        let fee_satoshis = self.proposed_closing_fee(fee_estimator);
        let tx = self.build_closing_tx(fee_satoshis)?;
        let signature = self.sign_closing(&tx)?;
        self.last_sent_closing_fee = Some(fee_satoshis);
        debug!(channel_id = %self.channel_id, fee_satoshis, "proposing closing fee");
        Ok(Some(ClosingSigned {
            channel_id: self.channel_id,
            fee_satoshis,
            signature,
        }))
    }

    /// Handle a `closing_signed` proposal. Returns our reply, if any, and
    /// the fully signed closing transaction once fees agree.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] on a premature proposal or bad signature.
    pub fn closing_signed(
        &mut self,
        fee_estimator: &dyn FeeEstimator,
        msg: &ClosingSigned,
    ) -> Result<(Option<ClosingSigned>, Option<Transaction>), ChannelError> {
        if !self.flags.local_shutdown_sent || !self.flags.remote_shutdown_sent {
            return Err(ChannelError::close("closing_signed before both sides provided a shutdown"));
        }
        if !self.is_quiescent() {
            return Err(ChannelError::close("closing_signed while there were still pending updates"));
        }
        if self.state == ChannelState::Closed {
            return Err(ChannelError::ignore("channel already closed"));
        }
        let tx = self.build_closing_tx(msg.fee_satoshis)?;
        self.verify_funding_sig(&tx, &msg.signature)?;

        if self.last_sent_closing_fee == Some(msg.fee_satoshis) {
            let signed = self.finalize_closing_tx(tx, &msg.signature)?;
            self.transition_to(ChannelState::Closed)?;
            info!(channel_id = %self.channel_id, fee_satoshis = msg.fee_satoshis, "cooperative close agreed");
            return Ok((None, Some(signed)));
        }

        let our_fee = self
            .last_sent_closing_fee
            .unwrap_or_else(|| self.proposed_closing_fee(fee_estimator));
        let midpoint = (our_fee + msg.fee_satoshis) / 2;
        if msg.fee_satoshis == our_fee || midpoint == msg.fee_satoshis || midpoint == our_fee {
            let signature = self.sign_closing(&tx)?;
            let signed = self.finalize_closing_tx(tx, &msg.signature)?;
            self.last_sent_closing_fee = Some(msg.fee_satoshis);
            self.transition_to(ChannelState::Closed)?;
            info!(channel_id = %self.channel_id, fee_satoshis = msg.fee_satoshis, "accepted peer's closing fee");
            return Ok((
                Some(ClosingSigned {
                    channel_id: self.channel_id,
                    fee_satoshis: msg.fee_satoshis,
                    signature,
                }),
                Some(signed),
            ));
        }

        let counter = self.build_closing_tx(midpoint)?;
        let signature = self.sign_closing(&counter)?;
        self.last_sent_closing_fee = Some(midpoint);
        debug!(channel_id = %self.channel_id, ours = our_fee, theirs = msg.fee_satoshis, midpoint, "countering closing fee");
        Ok((
            Some(ClosingSigned {
                channel_id: self.channel_id,
                fee_satoshis: midpoint,
                signature,
            }),
            None,
        ))
    }

    /// Close without the peer. Returns the monitor update telling the
    /// monitor to broadcast (when funded) and every HTLC that never made it
    /// into a commitment.
    pub fn force_shutdown(&mut self, should_broadcast: bool) -> (Option<(OutPoint, ChannelMonitorUpdate)>, Vec<DroppedHTLC>) {
        let mut dropped = self.drain_holding_cell_adds();
        let channel_id = self.channel_id;
        for entry in self.local_log.range(self.remote_tip.ours, u64::MAX) {
            if let LogUpdate::Add {
                payment_hash,
                source: Some(source),
                ..
            } = &entry.update
            {
                dropped.push(DroppedHTLC {
                    source: source.clone(),
                    payment_hash: *payment_hash,
                    channel_id,
                });
            }
        }
        let has_monitor = self.state.is_funded() && self.state != ChannelState::Closed;
        self.state = ChannelState::Closed;
        warn!(channel_id = %self.channel_id, should_broadcast, dropped = dropped.len(), "force closing channel");

        let update = self.funding_txo.filter(|_| has_monitor).map(|funding_txo| {
            self.latest_monitor_update_id = CLOSED_CHANNEL_UPDATE_ID;
            (
                funding_txo,
                ChannelMonitorUpdate {
                    update_id: CLOSED_CHANNEL_UPDATE_ID,
                    updates: vec![ChannelMonitorUpdateStep::ChannelForceClosed { should_broadcast }],
                },
            )
        });
        (update, dropped)
    }

    // ============ Announcements ============

    /// The unsigned announcement for this channel with `node_id` as our
    /// side.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Ignore`] for private or unconfirmed channels.
    pub fn get_channel_announcement(
        &self,
        node_id: PublicKey,
        chain_hash: ChainHash,
    ) -> Result<UnsignedChannelAnnouncement, ChannelError> {
        if !self.config.announced_channel {
            return Err(ChannelError::ignore("channel is not available for public announcements"));
        }
        let short_channel_id = self
            .short_channel_id
            .ok_or_else(|| ChannelError::ignore("cannot announce a channel before its funding confirms"))?;
        let ours = self.keys.pubkeys().funding_pubkey;
        let theirs = self.counterparty_pubkeys()?.funding_pubkey;
        let were_node_one = node_id.serialize()[..] < self.counterparty_node_id.serialize()[..];
        let (node_id_1, node_id_2, bitcoin_key_1, bitcoin_key_2) = if were_node_one {
            (node_id, self.counterparty_node_id, ours, theirs)
        } else {
            (self.counterparty_node_id, node_id, theirs, ours)
        };
        Ok(UnsignedChannelAnnouncement {
            features: ChannelFeatures::known(),
            chain_hash,
            short_channel_id,
            node_id_1,
            node_id_2,
            bitcoin_key_1,
            bitcoin_key_2,
            excess_data: Vec::new(),
        })
    }

    fn funding_depth(&self) -> u32 {
        self.funding_tx_confirmed_in
            .map_or(0, |(_, height)| self.best_block_height.saturating_sub(height) + 1)
    }

    /// Our `announcement_signatures`, once a public channel is deep enough.
    /// Sent at most once per connection.
    pub fn get_announcement_signatures(
        &mut self,
        node_secret: &SecretKey,
        chain_hash: ChainHash,
    ) -> Option<AnnouncementSignatures> {
        if self.announcement_sigs_sent
            || self.state != ChannelState::NormalOperation
            || self.flags.peer_disconnected
            || self.funding_depth() < ANNOUNCEMENT_DEPTH
        {
            return None;
        }
        let node_id = PublicKey::from_secret_key(&*SECP, node_secret);
        let announcement = self.get_channel_announcement(node_id, chain_hash).ok()?;
        let node_signature = SECP.sign_ecdsa(&announcement.signing_message(), node_secret);
        let bitcoin_signature = self.keys.sign_channel_announcement(&*SECP, &announcement);
        self.announcement_sigs_sent = true;
        Some(AnnouncementSignatures {
            channel_id: self.channel_id,
            short_channel_id: announcement.short_channel_id,
            node_signature,
            bitcoin_signature,
        })
    }

    /// Combine the peer's `announcement_signatures` with ours into a
    /// broadcastable announcement.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] if the peer's signatures do not verify.
    pub fn announcement_signatures(
        &self,
        node_secret: &SecretKey,
        chain_hash: ChainHash,
        msg: &AnnouncementSignatures,
    ) -> Result<ChannelAnnouncement, ChannelError> {
        let node_id = PublicKey::from_secret_key(&*SECP, node_secret);
        let contents = self.get_channel_announcement(node_id, chain_hash)?;
        if contents.short_channel_id != msg.short_channel_id {
            return Err(ChannelError::close("announcement_signatures for the wrong short channel id"));
        }
        let digest = contents.signing_message();
        let their_funding = self.counterparty_pubkeys()?.funding_pubkey;
        if SECP.verify_ecdsa(&digest, &msg.node_signature, &self.counterparty_node_id).is_err()
            || SECP.verify_ecdsa(&digest, &msg.bitcoin_signature, &their_funding).is_err()
        {
            return Err(ChannelError::close("bad announcement_signatures"));
        }
        let our_node_sig = SECP.sign_ecdsa(&digest, node_secret);
        let our_bitcoin_sig = self.keys.sign_channel_announcement(&*SECP, &contents);
        let were_node_one = contents.node_id_1 == node_id;
        let (node_signature_1, node_signature_2, bitcoin_signature_1, bitcoin_signature_2) = if were_node_one {
            (our_node_sig, msg.node_signature, our_bitcoin_sig, msg.bitcoin_signature)
        } else {
            (msg.node_signature, our_node_sig, msg.bitcoin_signature, our_bitcoin_sig)
        };
        Ok(ChannelAnnouncement {
            node_signature_1,
            node_signature_2,
            bitcoin_signature_1,
            bitcoin_signature_2,
            contents,
        })
    }

    // ============ Shared Helpers ============

    fn transition_to(&mut self, to: ChannelState) -> Result<(), ChannelError> {
        if !self.state.can_transition(to) {
            return Err(ChannelError::close(format!("invalid channel state transition {:?} -> {to:?}", self.state)));
        }
        debug!(channel_id = %self.channel_id, from = ?self.state, to = ?to, "channel state transition");
        self.state = to;
        Ok(())
    }

    fn counterparty_pubkeys(&self) -> Result<&ChannelPublicKeys, ChannelError> {
        self.counterparty_pubkeys
            .as_ref()
            .ok_or_else(|| ChannelError::close("counterparty keys unknown before accept_channel"))
    }

    fn funding_outpoint(&self) -> Result<OutPoint, ChannelError> {
        self.funding_txo
            .ok_or_else(|| ChannelError::close("funding outpoint not yet known"))
    }

    fn funding_redeemscript(&self) -> Result<ScriptBuf, ChannelError> {
        Ok(make_funding_redeemscript(
            &self.keys.pubkeys().funding_pubkey,
            &self.counterparty_pubkeys()?.funding_pubkey,
        ))
    }

    fn holder_point(&self, commitment_number: u64) -> Result<PublicKey, ChannelError> {
        self.keys
            .per_commitment_point(&*SECP, INITIAL_COMMITMENT_NUMBER - commitment_number)
            .map_err(signer_error)
    }

    fn holder_tx_keys(&self, commitment_number: u64) -> Result<TxCreationKeys, ChannelError> {
        let point = self.holder_point(commitment_number)?;
        TxCreationKeys::derive(&*SECP, &point, self.keys.pubkeys(), self.counterparty_pubkeys()?).map_err(signer_error)
    }

    fn counterparty_tx_keys(&self, point: &PublicKey) -> Result<TxCreationKeys, ChannelError> {
        TxCreationKeys::derive(&*SECP, point, self.counterparty_pubkeys()?, self.keys.pubkeys()).map_err(signer_error)
    }

    fn stats(&self, view: CommitmentView) -> Result<CommitmentStats, ChannelError> {
        view_stats(
            &self.local_log,
            &self.remote_log,
            view,
            self.base_local_msat,
            self.base_remote_msat,
            self.feerate_per_kw,
        )
    }

    fn latest_view(&self) -> CommitmentView {
        CommitmentView {
            ours: self.local_log.next_index(),
            theirs: self.remote_log.next_index(),
        }
    }

    /// Build the commitment `holder` (ours) or the counterparty's at
    /// `view`, numbered `commitment_number`
    fn build_commitment(
        &self,
        holder: bool,
        view: CommitmentView,
        commitment_number: u64,
        keys: TxCreationKeys,
    ) -> Result<BuiltCommitment, ChannelError> {
        let stats = self.stats(view)?;
        let funding_txo = self.funding_outpoint()?;
        let counterparty = self.counterparty_pubkeys()?;

        let (broadcaster_value_msat, countersignatory_value_msat, countersignatory_payment_point) = if holder {
            (stats.local_msat, stats.remote_msat, counterparty.payment_point)
        } else {
            (stats.remote_msat, stats.local_msat, self.keys.pubkeys().payment_point)
        };
        let (to_self_delay, dust_limit_sat) = if holder {
            (self.counterparty_selected_contest_delay, self.holder_dust_limit_satoshis)
        } else {
            (self.holder_selected_contest_delay, self.counterparty_dust_limit_satoshis)
        };

        let htlcs_in = stats
            .htlcs
            .iter()
            .map(|h| HTLCOutputInCommitment {
                offered: h.outbound == holder,
                amount_msat: h.amount_msat,
                cltv_expiry: h.cltv_expiry,
                payment_hash: h.payment_hash,
                transaction_output_index: None,
            })
            .collect();
        let params = CommitmentTxParams {
            commitment_number,
            obscure_factor: self.obscure_factor,
            funding_outpoint: funding_txo.into_bitcoin_outpoint(),
            keys: &keys,
            countersignatory_payment_point: &countersignatory_payment_point,
            to_self_delay,
            dust_limit_sat,
            feerate_per_kw: stats.feerate_per_kw,
            broadcaster_is_opener: holder == self.is_outbound,
            broadcaster_value_msat,
            countersignatory_value_msat,
        };
        let commitment = build_commitment_transaction(&params, htlcs_in);

        // Pair each output back with the log entry it came from
        let mut unmatched: Vec<Option<ViewHTLC>> = stats.htlcs.into_iter().map(Some).collect();
        let mut htlcs = Vec::with_capacity(commitment.htlcs.len());
        for htlc in &commitment.htlcs {
            let slot = unmatched.iter_mut().find(|candidate| {
                candidate.as_ref().is_some_and(|c| {
                    (c.outbound == holder) == htlc.offered
                        && c.amount_msat == htlc.amount_msat
                        && c.cltv_expiry == htlc.cltv_expiry
                        && c.payment_hash == htlc.payment_hash
                })
            });
            if let Some(view_htlc) = slot.and_then(Option::take) {
                htlcs.push((htlc.clone(), view_htlc));
            }
        }

        Ok(BuiltCommitment {
            commitment,
            keys,
            feerate_per_kw: stats.feerate_per_kw,
            htlcs,
        })
    }

    fn sign_counterparty_commitment(&self, built: &BuiltCommitment) -> Result<(Signature, Vec<Signature>), ChannelError> {
        self.keys
            .sign_counterparty_commitment(
                &*SECP,
                &built.commitment,
                &built.keys,
                &self.counterparty_pubkeys()?.funding_pubkey,
                self.holder_selected_contest_delay,
                built.feerate_per_kw,
            )
            .map_err(signer_error)
    }

    fn verify_funding_sig(&self, tx: &Transaction, sig: &Signature) -> Result<(), ChannelError> {
        let script = self.funding_redeemscript()?;
        let sighash = p2wsh_sighash(tx, 0, &script, self.channel_value_satoshis).map_err(signer_error)?;
        SECP.verify_ecdsa(&sighash, sig, &self.counterparty_pubkeys()?.funding_pubkey)
            .map_err(|_| ChannelError::close("invalid funding signature from peer"))
    }

    /// Source of one of our own HTLCs, for monitor updates
    fn outbound_source(&self, htlc: &ViewHTLC) -> Option<HTLCSource> {
        if !htlc.outbound {
            return None;
        }
        match &self.local_log.find_add(htlc.htlc_id)?.update {
            LogUpdate::Add { source, .. } => source.clone(),
            _ => None,
        }
    }

    fn new_monitor_update(&mut self, updates: Vec<ChannelMonitorUpdateStep>) -> ChannelMonitorUpdate {
        self.latest_monitor_update_id += 1;
        ChannelMonitorUpdate {
            update_id: self.latest_monitor_update_id,
            updates,
        }
    }

    // ============ Getters ============

    /// Current id: temporary until funding, then derived from the outpoint
    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The id used during negotiation
    #[must_use]
    pub fn temporary_channel_id(&self) -> ChannelId {
        self.temporary_channel_id
    }

    /// Caller-chosen id
    #[must_use]
    pub fn get_user_id(&self) -> u64 {
        self.user_id
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Overlay flags
    #[must_use]
    pub fn flags(&self) -> ChannelFlags {
        self.flags
    }

    /// We opened it
    #[must_use]
    pub fn is_outbound(&self) -> bool {
        self.is_outbound
    }

    /// The peer
    #[must_use]
    pub fn get_counterparty_node_id(&self) -> PublicKey {
        self.counterparty_node_id
    }

    /// Capacity
    #[must_use]
    pub fn get_channel_value_satoshis(&self) -> u64 {
        self.channel_value_satoshis
    }

    /// Funding outpoint once assigned
    #[must_use]
    pub fn get_funding_txo(&self) -> Option<OutPoint> {
        self.funding_txo
    }

    /// Short channel id once funding confirmed
    #[must_use]
    pub fn get_short_channel_id(&self) -> Option<u64> {
        self.short_channel_id
    }

    /// The P2WSH script the funding output must pay.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Close`] before the counterparty's keys are known.
    pub fn get_funding_scriptpubkey(&self) -> Result<ScriptBuf, ChannelError> {
        Ok(p2wsh_script(&self.funding_redeemscript()?))
    }

    /// Base fee we charge for forwarding over this channel: what claiming
    /// one more HTLC output on chain would cost at the current fee rate
    #[must_use]
    pub fn get_our_fee_base_msat(&self, fee_estimator: &dyn FeeEstimator) -> u32 {
        let feerate = u64::from(floored_feerate(fee_estimator, ConfirmationTarget::Normal));
        let mut fee = feerate * HTLC_TIMEOUT_TX_WEIGHT.max(HTLC_SUCCESS_TX_WEIGHT) / 1000;
        if self.is_outbound {
            fee += u64::from(self.feerate_per_kw) * COMMITMENT_TX_WEIGHT_PER_HTLC / 1000;
        }
        u32::try_from(fee).unwrap_or(u32::MAX)
    }

    /// Per-channel options
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Smallest HTLC we accept
    #[must_use]
    pub fn get_holder_htlc_minimum_msat(&self) -> u64 {
        self.holder_htlc_minimum_msat
    }

    /// Smallest HTLC the counterparty accepts
    #[must_use]
    pub fn get_counterparty_htlc_minimum_msat(&self) -> u64 {
        self.counterparty_htlc_minimum_msat
    }

    /// Commitment fee rate currently in force
    #[must_use]
    pub fn get_feerate(&self) -> u32 {
        self.feerate_per_kw
    }

    /// Id of the last monitor update we generated
    #[must_use]
    pub fn get_latest_monitor_update_id(&self) -> u64 {
        self.latest_monitor_update_id
    }

    /// Our latest commitment number
    #[must_use]
    pub fn get_holder_commitment_number(&self) -> u64 {
        self.holder_commitment_number
    }

    /// The counterparty's latest commitment number
    #[must_use]
    pub fn get_counterparty_commitment_number(&self) -> u64 {
        self.counterparty_tip_number
    }

    /// Funded, locked and not shutting down
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.state == ChannelState::NormalOperation && !self.flags.local_shutdown_sent && !self.flags.remote_shutdown_sent
    }

    /// Usable and the peer is connected
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.is_usable() && !self.flags.peer_disconnected
    }

    /// A monitor update failed and the channel is frozen
    #[must_use]
    pub fn is_awaiting_monitor_update(&self) -> bool {
        self.flags.monitor_update_in_progress
    }

    /// `(inbound, outbound)` capacity in msat, reserves excluded
    #[must_use]
    pub fn get_inbound_outbound_available_balance_msat(&self) -> (u64, u64) {
        let Ok(stats) = self.stats(self.latest_view()) else {
            return (0, 0);
        };
        let held: u64 = self
            .holding_cell
            .iter()
            .map(|update| match update {
                HoldingCellUpdate::AddHTLC { amount_msat, .. } => *amount_msat,
                _ => 0,
            })
            .sum();
        let inbound = stats
            .remote_msat
            .saturating_sub(self.holder_selected_channel_reserve_satoshis * 1000);
        let outbound = stats
            .local_msat
            .saturating_sub(held)
            .saturating_sub(self.counterparty_selected_channel_reserve_satoshis * 1000);
        (inbound, outbound)
    }
}

#[cfg(test)]
pub(crate) mod tests;
