//! The channel manager: every channel this node has, and the HTLC
//! plumbing between them.
//!
//! ```text
//!   peer messages --> ChannelManager --> Channel (per channel id)
//!                          |                 |
//!                          |                 +--> ChannelMonitorUpdate --Watch--> ChainMonitor
//!                          |
//!                          +--> forward_htlcs ---------> outbound Channel
//!                          +--> claimable_htlcs -------> Event::PaymentReceived
//!                          +--> pending_msg_events ----> PeerManager
//! ```
//!
//! All channel state sits behind one mutex. Handlers take it, drive the
//! channel, apply any monitor update through [`Watch`] and only then queue
//! the resulting messages. A monitor update that fails temporarily freezes
//! the channel: the messages that depended on it are withheld until
//! [`ChannelManager::channel_monitor_updated`] reports the update durable.
//!
//! Lock order is `channel_state` before `pending_events`.

use crate::chain::monitor::{CLTV_CLAIM_BUFFER, HTLCUpdate, LATENCY_GRACE_PERIOD_BLOCKS, MonitorEvent};
use crate::chain::{BroadcasterInterface, ChannelMonitorUpdate, FeeEstimator, OutPoint, Watch};
use crate::channel::htlc::{
    DroppedHTLC, HTLCFailReason, HTLCFailureMsg, HTLCPreviousHopData, HTLCSource, LockedInHTLC,
    PendingHTLCInfo, PendingHTLCRouting, PendingHTLCStatus, ResolvedHTLC,
};
use crate::channel::state::{FailPayload, RAACommitmentOrder};
use crate::channel::{BADONION, Channel, ChannelOutcome, OutboundParams};
use crate::config::UserConfig;
use crate::error::{APIError, ChannelError, ChannelMonitorUpdateErr, ErrorAction, PaymentSendFailure};
use crate::events::{Event, EventsProvider, MessageSendEvent, MessageSendEventsProvider};
use crate::features::InitFeatures;
use crate::keys::{KeysInterface, SECP};
use crate::msgs::{
    AcceptChannel, AnnouncementSignatures, ChannelMessageHandler, ChannelReestablish, ChannelUpdate,
    ClosingSigned, CommitmentSigned, ErrorMessage, FundingCreated, FundingLocked, FundingSigned, Init,
    OpenChannel, RevokeAndACK, Shutdown, UnsignedChannelUpdate, UpdateAddHTLC, UpdateFailHTLC,
    UpdateFailMalformedHTLC, UpdateFee, UpdateFulfillHTLC,
};
use crate::onion::{
    self, AMOUNT_BELOW_MINIMUM, CHANNEL_DISABLED, EXPIRY_TOO_FAR, EXPIRY_TOO_SOON, FEE_INSUFFICIENT, FINAL_INCORRECT_CLTV_EXPIRY,
    FINAL_INCORRECT_HTLC_AMOUNT, FinalPaymentData, INCORRECT_CLTV_EXPIRY, INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS,
    INVALID_ONION_PAYLOAD, OnionDecodeError, PERMANENT_CHANNEL_FAILURE, TEMPORARY_CHANNEL_FAILURE,
    UNKNOWN_NEXT_PEER,
};
use crate::route::{Route, RouteHop};
use crate::ser::Writeable;
use crate::types::{ChannelId, PaymentHash, PaymentPreimage, PaymentSecret};
use bitcoin::block::Header;
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{BlockHash, Network, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thunder_crypto::hash::sha256;
use tracing::{debug, error, info, trace, warn};

/// CLTV delta we require between an incoming HTLC and the one we forward
pub const CLTV_EXPIRY_DELTA: u16 = 6 * 12;

/// Refuse HTLCs expiring further out than this many blocks
pub const CLTV_FAR_FAR_AWAY: u32 = 6 * 24 * 7;

/// Fail a held inbound HTLC back this many blocks before it expires
pub const HTLC_FAIL_BACK_BUFFER: u32 = CLTV_CLAIM_BUFFER + LATENCY_GRACE_PERIOD_BLOCKS;

/// Suggested batching delay in [`Event::PendingHTLCsForwardable`]
pub const MIN_HTLC_RELAY_HOLDING_CELL_MILLIS: u64 = 100;

/// Most paths a single payment may use
pub const MAX_PATHS: usize = 10;

/// Most hops in one path
pub const MAX_PATH_HOPS: usize = 20;

/// Short channel id key under which HTLCs paying us are queued
const RECEIVE_SCID: u64 = 0;

// ============ Channel Details ============

/// A snapshot of one channel, for the embedder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDetails {
    /// Current channel id (temporary until funding)
    pub channel_id: ChannelId,
    /// Assigned once the funding transaction confirms
    pub short_channel_id: Option<u64>,
    /// The counterparty
    pub remote_network_id: PublicKey,
    /// What the counterparty sent in `init`, if it is connected
    pub counterparty_features: InitFeatures,
    /// Capacity
    pub channel_value_satoshis: u64,
    /// Caller-chosen id, 0 for inbound channels
    pub user_id: u64,
    /// What we could send right now
    pub outbound_capacity_msat: u64,
    /// What we could receive right now
    pub inbound_capacity_msat: u64,
    /// Usable and the peer is connected
    pub is_live: bool,
}

// ============ Internal State ============

/// A received HTLC waiting in `forward_htlcs`
#[derive(Debug, Clone)]
struct PendingForward {
    prev_hop: HTLCPreviousHopData,
    info: PendingHTLCInfo,
}

/// One part of a payment to us, waiting for `claim_funds`
#[derive(Debug, Clone, Copy)]
struct ClaimableHTLC {
    prev_hop: HTLCPreviousHopData,
    value: u64,
    cltv_expiry: u32,
    payment_data: Option<FinalPaymentData>,
}

impl ClaimableHTLC {
    fn total_msat(&self) -> u64 {
        self.payment_data.map_or(self.value, |data| data.total_msat)
    }

    fn payment_secret(&self) -> Option<PaymentSecret> {
        self.payment_data.map(|data| data.payment_secret)
    }
}

/// Funding progress withheld while the first monitor persist is pending
#[derive(Debug, Clone)]
enum HeldFunding {
    Signed(FundingSigned),
    BroadcastSafe { funding_txo: OutPoint, user_channel_id: u64 },
}

/// Progress of announcing a channel as disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisableState {
    /// Seen not live once; disabled on the next tick if still down
    Staged,
    /// A disabling update went out
    Sent,
}

/// What happened to a monitor update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorApply {
    Done,
    Paused,
    Closed,
}

#[derive(Default)]
struct ChannelHolder {
    by_id: HashMap<ChannelId, Channel>,
    short_to_id: HashMap<u64, ChannelId>,
    forward_htlcs: HashMap<u64, Vec<PendingForward>>,
    claimable_htlcs: HashMap<PaymentHash, Vec<ClaimableHTLC>>,
    /// Claimed payments and the latest expiry among their parts. Kept until
    /// that height so a replayed HTLC cannot be claimed twice.
    claimed_payment_hashes: HashMap<PaymentHash, u32>,
    held_funding: HashMap<ChannelId, HeldFunding>,
    disabled_channels: HashMap<ChannelId, DisableState>,
    peer_features: HashMap<PublicKey, InitFeatures>,
    pending_msg_events: Vec<MessageSendEvent>,
}

fn event_node_id(event: &MessageSendEvent) -> Option<&PublicKey> {
    match event {
        MessageSendEvent::SendAcceptChannel { node_id, .. }
        | MessageSendEvent::SendOpenChannel { node_id, .. }
        | MessageSendEvent::SendFundingCreated { node_id, .. }
        | MessageSendEvent::SendFundingSigned { node_id, .. }
        | MessageSendEvent::SendFundingLocked { node_id, .. }
        | MessageSendEvent::SendAnnouncementSignatures { node_id, .. }
        | MessageSendEvent::UpdateHTLCs { node_id, .. }
        | MessageSendEvent::SendRevokeAndACK { node_id, .. }
        | MessageSendEvent::SendClosingSigned { node_id, .. }
        | MessageSendEvent::SendShutdown { node_id, .. }
        | MessageSendEvent::SendChannelReestablish { node_id, .. }
        | MessageSendEvent::HandleError { node_id, .. } => Some(node_id),
        MessageSendEvent::BroadcastChannelAnnouncement { .. }
        | MessageSendEvent::BroadcastNodeAnnouncement { .. }
        | MessageSendEvent::BroadcastChannelUpdate { .. }
        | MessageSendEvent::PaymentFailureNetworkUpdate { .. } => None,
    }
}

/// `amount || height`, the data of `incorrect_or_unknown_payment_details`
fn unknown_payment_data(amount_msat: u64, height: u32) -> Vec<u8> {
    let mut data = amount_msat.to_be_bytes().to_vec();
    data.extend_from_slice(&height.to_be_bytes());
    data
}

fn unix_time_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

// ============ Channel Manager ============

/// Owns every channel and routes HTLCs between them
pub struct ChannelManager {
    genesis_hash: ChainHash,
    fee_estimator: Arc<dyn FeeEstimator>,
    chain_monitor: Arc<dyn Watch>,
    broadcaster: Arc<dyn BroadcasterInterface>,
    keys_manager: Arc<dyn KeysInterface>,
    default_configuration: UserConfig,

    our_network_key: SecretKey,
    our_network_pubkey: PublicKey,

    latest_block_height: AtomicU32,
    last_block_hash: Mutex<BlockHash>,
    last_update_timestamp: AtomicU32,

    channel_state: Mutex<ChannelHolder>,
    pending_events: Mutex<Vec<Event>>,
}

impl ChannelManager {
    /// A manager with no channels, at chain tip `current_blockchain_height`
    #[must_use]
    pub fn new(
        network: Network,
        fee_estimator: Arc<dyn FeeEstimator>,
        chain_monitor: Arc<dyn Watch>,
        broadcaster: Arc<dyn BroadcasterInterface>,
        keys_manager: Arc<dyn KeysInterface>,
        config: UserConfig,
        current_blockchain_height: u32,
    ) -> Self {
        let our_network_key = keys_manager.get_node_secret();
        let our_network_pubkey = PublicKey::from_secret_key(&*SECP, &our_network_key);
        info!(node_id = %our_network_pubkey, %network, height = current_blockchain_height, "channel manager started");
        Self {
            genesis_hash: ChainHash::using_genesis_block(network),
            fee_estimator,
            chain_monitor,
            broadcaster,
            keys_manager,
            default_configuration: config,
            our_network_key,
            our_network_pubkey,
            latest_block_height: AtomicU32::new(current_blockchain_height),
            last_block_hash: Mutex::new(BlockHash::all_zeros()),
            last_update_timestamp: AtomicU32::new(0),
            channel_state: Mutex::new(ChannelHolder::default()),
            pending_events: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelHolder> {
        self.channel_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_event(&self, event: Event) {
        self.pending_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Our node id
    #[must_use]
    pub fn get_our_node_id(&self) -> PublicKey {
        self.our_network_pubkey
    }

    /// Genesis hash of the chain we operate on
    #[must_use]
    pub fn genesis_hash(&self) -> ChainHash {
        self.genesis_hash
    }

    /// Height of the last connected block
    #[must_use]
    pub fn latest_block_height(&self) -> u32 {
        self.latest_block_height.load(Ordering::Acquire)
    }

    /// Hash of the last connected block
    #[must_use]
    pub fn last_block_hash(&self) -> BlockHash {
        *self.last_block_hash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============ Opening ============

    /// Start opening a channel. `open_channel` is queued for the peer and
    /// the temporary channel id returned; an
    /// [`Event::FundingGenerationReady`] follows once it accepts.
    ///
    /// # Errors
    ///
    /// [`APIError::APIMisuseError`] for a value below 1000 sat or one the
    /// channel rejects, or a temporary id collision.
    pub fn create_channel(
        &self,
        their_network_key: PublicKey,
        channel_value_satoshis: u64,
        push_msat: u64,
        user_id: u64,
        override_config: Option<UserConfig>,
    ) -> Result<ChannelId, APIError> {
        if channel_value_satoshis < 1000 {
            return Err(APIError::APIMisuseError {
                err: "channel value must be at least 1000 satoshis".into(),
            });
        }
        let config = override_config.unwrap_or(self.default_configuration);
        let params = OutboundParams {
            channel_value_satoshis,
            push_msat,
            user_id,
        };
        let channel = Channel::new_outbound(
            self.keys_manager.as_ref(),
            self.fee_estimator.as_ref(),
            their_network_key,
            params,
            &config,
        )?;
        let msg = channel.get_open_channel(self.genesis_hash)?;
        let temporary_channel_id = channel.temporary_channel_id();

        let mut holder = self.lock_state();
        if holder.by_id.contains_key(&temporary_channel_id) {
            return Err(APIError::APIMisuseError {
                err: "temporary channel id collision".into(),
            });
        }
        holder.by_id.insert(temporary_channel_id, channel);
        holder.pending_msg_events.push(MessageSendEvent::SendOpenChannel {
            node_id: their_network_key,
            msg,
        });
        info!(channel_id = %temporary_channel_id, peer = %their_network_key, channel_value_satoshis, "opening channel");
        Ok(temporary_channel_id)
    }

    /// Hand over the funding outpoint for a channel announced by
    /// [`Event::FundingGenerationReady`]. The funding transaction must not
    /// be broadcast before [`Event::FundingBroadcastSafe`].
    ///
    /// # Errors
    ///
    /// [`APIError::APIMisuseError`] for an unknown channel,
    /// [`APIError::ChannelUnavailable`] if the channel rejects the outpoint
    /// and was closed.
    pub fn funding_transaction_generated(
        &self,
        temporary_channel_id: ChannelId,
        funding_txo: OutPoint,
    ) -> Result<(), APIError> {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(mut channel) = holder.by_id.remove(&temporary_channel_id) else {
            return Err(APIError::APIMisuseError {
                err: "no such channel".into(),
            });
        };
        let node_id = channel.get_counterparty_node_id();
        let msg = match channel.get_outbound_funding_created(funding_txo) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(channel_id = %temporary_channel_id, error = %e, "funding outpoint rejected, closing channel");
                Self::queue_error(holder, &node_id, temporary_channel_id, e.to_string());
                self.push_event(Event::ChannelClosed {
                    channel_id: temporary_channel_id,
                    reason: e.to_string(),
                });
                return Err(APIError::ChannelUnavailable { err: e.to_string().into() });
            }
        };
        let channel_id = channel.channel_id();
        if holder.by_id.contains_key(&channel_id) {
            error!(%channel_id, "funding outpoint already used by another channel");
            Self::queue_error(holder, &node_id, temporary_channel_id, "duplicate funding outpoint".to_owned());
            self.push_event(Event::ChannelClosed {
                channel_id: temporary_channel_id,
                reason: "duplicate funding outpoint".to_owned(),
            });
            return Err(APIError::APIMisuseError {
                err: "funding outpoint already used by another channel".into(),
            });
        }
        debug!(%channel_id, %funding_txo, "funding created");
        holder.by_id.insert(channel_id, channel);
        holder
            .pending_msg_events
            .push(MessageSendEvent::SendFundingCreated { node_id, msg });
        Ok(())
    }

    // ============ Closing ============

    /// Begin a cooperative close. Unfunded channels are simply dropped.
    ///
    /// # Errors
    ///
    /// [`APIError::ChannelUnavailable`] for an unknown channel or one that
    /// is already shutting down.
    pub fn close_channel(&self, channel_id: &ChannelId) -> Result<(), APIError> {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(channel) = holder.by_id.get_mut(channel_id) else {
            return Err(APIError::ChannelUnavailable {
                err: "no such channel".into(),
            });
        };
        if !channel.state().is_funded() {
            self.force_close_internal(holder, *channel_id, "closed by user before funding", false);
            return Ok(());
        }
        let node_id = channel.get_counterparty_node_id();
        let (msg, dropped) = channel.get_shutdown()?;
        info!(%channel_id, "initiating cooperative close");
        holder
            .pending_msg_events
            .push(MessageSendEvent::SendShutdown { node_id, msg });
        self.fail_dropped(holder, dropped);
        self.maybe_propose_closing(holder, *channel_id);
        Ok(())
    }

    /// Close a channel unilaterally, broadcasting our latest commitment.
    ///
    /// # Errors
    ///
    /// [`APIError::ChannelUnavailable`] for an unknown channel.
    pub fn force_close_channel(&self, channel_id: &ChannelId) -> Result<(), APIError> {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(node_id) = holder.by_id.get(channel_id).map(Channel::get_counterparty_node_id) else {
            return Err(APIError::ChannelUnavailable {
                err: "no such channel".into(),
            });
        };
        self.force_close_internal(holder, *channel_id, "force-closed by user", true);
        Self::queue_error(holder, &node_id, *channel_id, "channel force-closed".to_owned());
        Ok(())
    }

    /// Force-close every channel
    pub fn force_close_all_channels(&self) {
        let ids: Vec<ChannelId> = self.lock_state().by_id.keys().copied().collect();
        for channel_id in ids {
            // A channel removed concurrently is already closed
            let _ = self.force_close_channel(&channel_id);
        }
    }

    /// Propose a new commitment fee rate on a channel we opened.
    ///
    /// # Errors
    ///
    /// [`APIError::APIMisuseError`] for an unknown or inbound channel,
    /// [`APIError::ChannelUnavailable`] while it cannot take updates.
    pub fn update_fee(&self, channel_id: &ChannelId, feerate_per_kw: u32) -> Result<(), APIError> {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(channel) = holder.by_id.get_mut(channel_id) else {
            return Err(APIError::APIMisuseError {
                err: "no such channel".into(),
            });
        };
        if !channel.is_outbound() {
            return Err(APIError::APIMisuseError {
                err: "update_fee cannot be sent for an inbound channel".into(),
            });
        }
        if !channel.is_live() {
            return Err(APIError::ChannelUnavailable {
                err: "channel is either not yet fully established or peer is currently disconnected".into(),
            });
        }
        channel
            .send_update_fee(feerate_per_kw)
            .map_err(|e| APIError::ChannelUnavailable { err: e.to_string().into() })?;
        self.commit_channel(holder, *channel_id);
        Ok(())
    }

    // ============ Payments ============

    /// Send a payment over `route`. Multi-path routes require a
    /// `payment_secret`.
    ///
    /// # Errors
    ///
    /// See [`PaymentSendFailure`] for how failures are grouped.
    pub fn send_payment(
        &self,
        route: &Route,
        payment_hash: PaymentHash,
        payment_secret: Option<PaymentSecret>,
    ) -> Result<(), PaymentSendFailure> {
        if route.paths.is_empty() {
            return Err(PaymentSendFailure::ParameterError(APIError::RouteError {
                err: "there must be at least one path to send over".into(),
            }));
        }
        if route.paths.len() > MAX_PATHS {
            return Err(PaymentSendFailure::ParameterError(APIError::RouteError {
                err: "sending over more than 10 paths is not supported".into(),
            }));
        }
        if route.paths.len() > 1 && payment_secret.is_none() {
            return Err(PaymentSendFailure::ParameterError(APIError::APIMisuseError {
                err: "multi-path payments require a payment secret".into(),
            }));
        }

        let mut path_errs = Vec::with_capacity(route.paths.len());
        let mut has_err = false;
        for path in &route.paths {
            let check = if path.is_empty() || path.len() > MAX_PATH_HOPS {
                Err(APIError::RouteError {
                    err: "path didn't go anywhere or had too many hops".into(),
                })
            } else if path[..path.len() - 1]
                .iter()
                .any(|hop| hop.pubkey == self.our_network_pubkey)
            {
                Err(APIError::RouteError {
                    err: "path went through us but wasn't a simple rebalance loop to us".into(),
                })
            } else {
                Ok(())
            };
            has_err |= check.is_err();
            path_errs.push(check);
        }
        if has_err {
            return Err(PaymentSendFailure::PathParameterError(path_errs));
        }

        let total_msat = route.total_amount_msat();
        let cur_height = self.latest_block_height().saturating_add(1);
        let results: Vec<Result<(), APIError>> = {
            let mut guard = self.lock_state();
            let holder = &mut *guard;
            route
                .paths
                .iter()
                .map(|path| self.send_payment_along_path(holder, path, payment_hash, payment_secret, total_msat, cur_height))
                .collect()
        };

        let mut sent_any = false;
        let mut failed_any = false;
        for result in &results {
            match result {
                Ok(()) => sent_any = true,
                // The HTLC is committed locally and goes out once the
                // monitor catches up
                Err(APIError::MonitorUpdateFailed) => {
                    sent_any = true;
                    failed_any = true;
                }
                Err(_) => failed_any = true,
            }
        }
        match (sent_any, failed_any) {
            (_, false) => Ok(()),
            (true, true) => Err(PaymentSendFailure::PartialFailure(results)),
            (false, true) => Err(PaymentSendFailure::AllFailedRetrySafe(
                results.into_iter().filter_map(Result::err).collect(),
            )),
        }
    }

    fn send_payment_along_path(
        &self,
        holder: &mut ChannelHolder,
        path: &[RouteHop],
        payment_hash: PaymentHash,
        payment_secret: Option<PaymentSecret>,
        total_msat: u64,
        cur_height: u32,
    ) -> Result<(), APIError> {
        let session_priv = SecretKey::from_slice(&self.keys_manager.get_secure_random_bytes()).map_err(|_| {
            APIError::APIMisuseError {
                err: "random bytes did not form a valid session key".into(),
            }
        })?;
        let onion_keys = onion::construct_onion_keys(path, &session_priv)?;
        let (payloads, htlc_msat, htlc_cltv) =
            onion::build_onion_payloads(path, total_msat, payment_secret, cur_height)?;
        let onion_packet = onion::build_onion_packet(&payloads, &onion_keys, &session_priv, &payment_hash)?;

        let unavailable = || APIError::ChannelUnavailable {
            err: "no channel available with first hop".into(),
        };
        let first_hop = &path[0];
        let channel_id = holder
            .short_to_id
            .get(&first_hop.short_channel_id)
            .copied()
            .ok_or_else(unavailable)?;
        let channel = holder.by_id.get_mut(&channel_id).ok_or_else(unavailable)?;
        if channel.get_counterparty_node_id() != first_hop.pubkey {
            return Err(APIError::RouteError {
                err: "node id mismatch on first hop".into(),
            });
        }
        if !channel.is_live() || channel.is_awaiting_monitor_update() {
            return Err(APIError::ChannelUnavailable {
                err: "peer for first hop currently disconnected or pending monitor update".into(),
            });
        }
        let source = HTLCSource::OutboundRoute {
            path: path.to_vec(),
            session_priv,
            first_hop_htlc_msat: htlc_msat,
        };
        channel
            .send_htlc(htlc_msat, payment_hash, htlc_cltv, source, onion_packet)
            .map_err(|e| APIError::ChannelUnavailable { err: e.to_string().into() })?;
        debug!(%channel_id, %payment_hash, htlc_msat, htlc_cltv, hops = path.len(), "sent payment HTLC");
        match self.commit_channel(holder, channel_id) {
            MonitorApply::Done => Ok(()),
            MonitorApply::Paused => Err(APIError::MonitorUpdateFailed),
            MonitorApply::Closed => Err(APIError::ChannelUnavailable {
                err: "channel closed on monitor update failure".into(),
            }),
        }
    }

    /// Claim every part of a payment to us with `payment_preimage`.
    /// Returns false, failing the parts back, when nothing is claimable,
    /// the secret differs or the total is outside
    /// `[expected_amount, 2 * expected_amount]`.
    pub fn claim_funds(
        &self,
        payment_preimage: PaymentPreimage,
        payment_secret: Option<PaymentSecret>,
        expected_amount: u64,
    ) -> bool {
        let payment_hash = payment_preimage.payment_hash();
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(parts) = holder.claimable_htlcs.remove(&payment_hash) else {
            return false;
        };
        let received: u64 = parts.iter().map(|part| part.value).sum();
        let secret_matches = parts.iter().all(|part| part.payment_secret() == payment_secret);
        if !secret_matches || received < expected_amount || received > expected_amount.saturating_mul(2) {
            warn!(%payment_hash, received, expected_amount, secret_matches, "refusing to claim payment");
            let height = self.latest_block_height();
            for part in parts {
                self.fail_htlc_backwards_internal(
                    holder,
                    HTLCSource::PreviousHopData(part.prev_hop),
                    &payment_hash,
                    HTLCFailReason::reason(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, unknown_payment_data(part.value, height)),
                );
            }
            return false;
        }
        let latest_expiry = parts.iter().map(|part| part.cltv_expiry).max().unwrap_or(0);
        let expiry = holder.claimed_payment_hashes.entry(payment_hash).or_insert(0);
        *expiry = (*expiry).max(latest_expiry);
        info!(%payment_hash, received, parts = parts.len(), "claiming payment");
        let mut claimed_any = false;
        for part in parts {
            claimed_any |= self.claim_funds_from_hop(holder, part.prev_hop, payment_preimage);
        }
        claimed_any
    }

    /// Fail back every part of a payment to us whose secret matches.
    /// Returns whether any part was found.
    pub fn fail_htlc_backwards(&self, payment_hash: &PaymentHash, payment_secret: Option<PaymentSecret>) -> bool {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(parts) = holder.claimable_htlcs.remove(payment_hash) else {
            return false;
        };
        let (matching, rest): (Vec<_>, Vec<_>) = parts
            .into_iter()
            .partition(|part| part.payment_secret() == payment_secret);
        if !rest.is_empty() {
            holder.claimable_htlcs.insert(*payment_hash, rest);
        }
        let height = self.latest_block_height();
        for part in &matching {
            self.fail_htlc_backwards_internal(
                holder,
                HTLCSource::PreviousHopData(part.prev_hop),
                payment_hash,
                HTLCFailReason::reason(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, unknown_payment_data(part.value, height)),
            );
        }
        !matching.is_empty()
    }

    /// Move queued HTLCs onto their outbound channels, or into the
    /// claimable set when they pay us. Call after
    /// [`Event::PendingHTLCsForwardable`].
    pub fn process_pending_htlc_forwards(&self) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let forwards = std::mem::take(&mut holder.forward_htlcs);
        let mut failed: Vec<(HTLCSource, PaymentHash, HTLCFailReason)> = Vec::new();
        let mut touched: Vec<ChannelId> = Vec::new();

        for (short_channel_id, pending) in forwards {
            if short_channel_id == RECEIVE_SCID {
                for forward in pending {
                    self.receive_htlc(holder, forward, &mut failed);
                }
                continue;
            }
            let channel_id = holder.short_to_id.get(&short_channel_id).copied();
            let Some((channel_id, channel)) =
                channel_id.and_then(|id| holder.by_id.get_mut(&id).map(|channel| (id, channel)))
            else {
                for forward in pending {
                    failed.push((
                        HTLCSource::PreviousHopData(forward.prev_hop),
                        forward.info.payment_hash,
                        HTLCFailReason::reason(UNKNOWN_NEXT_PEER, Vec::new()),
                    ));
                }
                continue;
            };
            for forward in pending {
                let PendingHTLCRouting::Forward { onion_packet, .. } = forward.info.routing else {
                    continue;
                };
                let source = HTLCSource::PreviousHopData(forward.prev_hop);
                let payment_hash = forward.info.payment_hash;
                if let Err(e) = channel.send_htlc(
                    forward.info.amt_to_forward,
                    payment_hash,
                    forward.info.outgoing_cltv_value,
                    source.clone(),
                    onion_packet,
                ) {
                    debug!(%channel_id, %payment_hash, error = %e, "failed to forward HTLC");
                    let data = self.channel_update_data(channel, &[]);
                    failed.push((source, payment_hash, HTLCFailReason::reason(TEMPORARY_CHANNEL_FAILURE, data)));
                } else {
                    trace!(%channel_id, %payment_hash, "forwarded HTLC");
                }
            }
            touched.push(channel_id);
        }

        for channel_id in touched {
            self.commit_channel(holder, channel_id);
        }
        for (source, payment_hash, reason) in failed {
            self.fail_htlc_backwards_internal(holder, source, &payment_hash, reason);
        }
    }

    fn receive_htlc(
        &self,
        holder: &mut ChannelHolder,
        forward: PendingForward,
        failed: &mut Vec<(HTLCSource, PaymentHash, HTLCFailReason)>,
    ) {
        let PendingHTLCRouting::Receive {
            payment_data,
            incoming_cltv_expiry,
        } = forward.info.routing
        else {
            return;
        };
        let payment_hash = forward.info.payment_hash;
        let htlc = ClaimableHTLC {
            prev_hop: forward.prev_hop,
            value: forward.info.amt_to_forward,
            cltv_expiry: incoming_cltv_expiry,
            payment_data,
        };
        let height = self.latest_block_height();
        let reject = |htlc: &ClaimableHTLC| {
            (
                HTLCSource::PreviousHopData(htlc.prev_hop),
                payment_hash,
                HTLCFailReason::reason(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, unknown_payment_data(htlc.value, height)),
            )
        };

        if holder.claimed_payment_hashes.contains_key(&payment_hash) {
            warn!(%payment_hash, "HTLC replays an already claimed payment");
            failed.push(reject(&htlc));
            return;
        }
        let parts = holder.claimable_htlcs.entry(payment_hash).or_default();
        let mut received: u64 = parts.iter().map(|part| part.value).sum();
        if let Some(first) = parts.first() {
            let complete = received >= first.total_msat();
            let same_payment = first.payment_data.is_some() && first.payment_data == htlc.payment_data;
            if complete || !same_payment {
                warn!(%payment_hash, "HTLC replays or conflicts with a claimable payment");
                failed.push(reject(&htlc));
                return;
            }
        }
        received += htlc.value;
        let total = htlc.total_msat();
        let payment_secret = htlc.payment_secret();
        parts.push(htlc);
        if received >= total {
            info!(%payment_hash, amt = received, "payment received");
            self.push_event(Event::PaymentReceived {
                payment_hash,
                payment_secret,
                amt: received,
            });
        } else {
            debug!(%payment_hash, received, total, "received part of a multi-path payment");
        }
    }

    // ============ Timers & Monitors ============

    /// Announce channels that stayed down for a full tick as disabled, and
    /// re-enable them once they are back. Call once a minute.
    pub fn timer_chan_freshness_every_min(&self) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        for (channel_id, channel) in &holder.by_id {
            if !channel.config().announced_channel || channel.get_short_channel_id().is_none() {
                continue;
            }
            let live = channel.is_live();
            match (live, holder.disabled_channels.get(channel_id).copied()) {
                (false, None) => {
                    holder.disabled_channels.insert(*channel_id, DisableState::Staged);
                }
                (false, Some(DisableState::Staged)) => {
                    if let Some(msg) = self.get_channel_update(channel) {
                        debug!(%channel_id, "announcing channel disabled");
                        holder
                            .pending_msg_events
                            .push(MessageSendEvent::BroadcastChannelUpdate { msg });
                    }
                    holder.disabled_channels.insert(*channel_id, DisableState::Sent);
                }
                (true, Some(DisableState::Sent)) => {
                    if let Some(msg) = self.get_channel_update(channel) {
                        debug!(%channel_id, "announcing channel re-enabled");
                        holder
                            .pending_msg_events
                            .push(MessageSendEvent::BroadcastChannelUpdate { msg });
                    }
                    holder.disabled_channels.remove(channel_id);
                }
                (true, Some(DisableState::Staged)) => {
                    holder.disabled_channels.remove(channel_id);
                }
                _ => {}
            }
        }
    }

    /// A monitor update that previously failed temporarily is now durable.
    /// Unfreezes the channel once `highest_applied_update_id` is its latest
    /// update.
    pub fn channel_monitor_updated(&self, funding_txo: &OutPoint, highest_applied_update_id: u64) {
        let channel_id = funding_txo.to_channel_id();
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(channel) = holder.by_id.get_mut(&channel_id) else {
            return;
        };
        if !channel.is_awaiting_monitor_update() || channel.get_latest_monitor_update_id() != highest_applied_update_id {
            return;
        }
        let node_id = channel.get_counterparty_node_id();
        let outcome = channel.monitor_updating_restored();
        match holder.held_funding.remove(&channel_id) {
            Some(HeldFunding::Signed(msg)) => {
                holder
                    .pending_msg_events
                    .push(MessageSendEvent::SendFundingSigned { node_id, msg });
            }
            Some(HeldFunding::BroadcastSafe {
                funding_txo,
                user_channel_id,
            }) => self.push_event(Event::FundingBroadcastSafe {
                funding_txo,
                user_channel_id,
            }),
            None => {}
        }
        match outcome {
            Ok(outcome) => self.handle_channel_outcome(holder, channel_id, outcome),
            Err(e) => self.handle_channel_error(holder, channel_id, e),
        }
    }

    fn process_pending_monitor_events(&self) {
        let events = self.chain_monitor.release_pending_monitor_events();
        if events.is_empty() {
            return;
        }
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        for event in events {
            match event {
                MonitorEvent::HTLCEvent(HTLCUpdate {
                    payment_hash,
                    payment_preimage: Some(preimage),
                    source,
                }) => {
                    debug!(%payment_hash, "monitor claimed HTLC on chain");
                    self.claim_funds_internal(holder, source, preimage);
                }
                MonitorEvent::HTLCEvent(HTLCUpdate {
                    payment_hash,
                    payment_preimage: None,
                    source,
                }) => {
                    debug!(%payment_hash, "monitor timed out HTLC on chain");
                    self.fail_htlc_backwards_internal(
                        holder,
                        source,
                        &payment_hash,
                        HTLCFailReason::reason(PERMANENT_CHANNEL_FAILURE, Vec::new()),
                    );
                }
                MonitorEvent::CommitmentTxBroadcasted(funding_txo) => {
                    let channel_id = funding_txo.to_channel_id();
                    let node_id = holder.by_id.get(&channel_id).map(Channel::get_counterparty_node_id);
                    let closed =
                        self.force_close_internal(holder, channel_id, "commitment transaction broadcast by monitor", false);
                    if let Some(node_id) = node_id.filter(|_| closed) {
                        Self::queue_error(holder, &node_id, channel_id, "channel force-closed".to_owned());
                    }
                }
            }
        }
    }

    // ============ Queries ============

    /// Every channel, in no particular order
    #[must_use]
    pub fn list_channels(&self) -> Vec<ChannelDetails> {
        self.list_channels_with_filter(|_| true)
    }

    /// Channels that can carry a payment right now
    #[must_use]
    pub fn list_usable_channels(&self) -> Vec<ChannelDetails> {
        self.list_channels_with_filter(Channel::is_live)
    }

    fn list_channels_with_filter(&self, filter: impl Fn(&Channel) -> bool) -> Vec<ChannelDetails> {
        let holder = self.lock_state();
        holder
            .by_id
            .iter()
            .filter(|(_, channel)| filter(channel))
            .map(|(channel_id, channel)| {
                let (inbound_capacity_msat, outbound_capacity_msat) = channel.get_inbound_outbound_available_balance_msat();
                let remote_network_id = channel.get_counterparty_node_id();
                ChannelDetails {
                    channel_id: *channel_id,
                    short_channel_id: channel.get_short_channel_id(),
                    remote_network_id,
                    counterparty_features: holder
                        .peer_features
                        .get(&remote_network_id)
                        .cloned()
                        .unwrap_or_else(InitFeatures::empty),
                    channel_value_satoshis: channel.get_channel_value_satoshis(),
                    user_id: channel.get_user_id(),
                    outbound_capacity_msat,
                    inbound_capacity_msat,
                    is_live: channel.is_live(),
                }
            })
            .collect()
    }

    // ============ Chain Notifications ============

    /// A block was connected at `height`. `txdata` holds the transactions
    /// relevant to us with their index in the block.
    pub fn block_connected(&self, header: &Header, txdata: &[(usize, &Transaction)], height: u32) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let mut failed_channels = Vec::new();
        for (channel_id, channel) in &mut holder.by_id {
            match channel.block_connected(header, txdata, height) {
                Ok(funding_locked) => {
                    if let Some(short_channel_id) = channel.get_short_channel_id() {
                        holder.short_to_id.insert(short_channel_id, *channel_id);
                    }
                    let node_id = channel.get_counterparty_node_id();
                    if let Some(msg) = funding_locked {
                        holder
                            .pending_msg_events
                            .push(MessageSendEvent::SendFundingLocked { node_id, msg });
                    }
                    if let Some(msg) = channel.get_announcement_signatures(&self.our_network_key, self.genesis_hash) {
                        holder
                            .pending_msg_events
                            .push(MessageSendEvent::SendAnnouncementSignatures { node_id, msg });
                    }
                }
                Err(e) => failed_channels.push((*channel_id, e)),
            }
        }
        for (channel_id, e) in failed_channels {
            self.handle_channel_error(holder, channel_id, e);
        }

        let mut timed_out = Vec::new();
        holder.claimable_htlcs.retain(|payment_hash, parts| {
            parts.retain(|part| {
                let expiring = part.cltv_expiry < height.saturating_add(HTLC_FAIL_BACK_BUFFER);
                if expiring {
                    timed_out.push((*payment_hash, *part));
                }
                !expiring
            });
            !parts.is_empty()
        });
        for (payment_hash, part) in timed_out {
            debug!(%payment_hash, cltv_expiry = part.cltv_expiry, "failing back unclaimed HTLC close to expiry");
            self.fail_htlc_backwards_internal(
                holder,
                HTLCSource::PreviousHopData(part.prev_hop),
                &payment_hash,
                HTLCFailReason::reason(INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, unknown_payment_data(part.value, height)),
            );
        }

        holder.claimed_payment_hashes.retain(|_, expiry| *expiry >= height);

        self.latest_block_height.store(height, Ordering::Release);
        *self.last_block_hash.lock().unwrap_or_else(PoisonError::into_inner) = header.block_hash();
        trace!(height, "block connected");
    }

    /// The block at `height` was disconnected. Channels whose funding it
    /// confirmed are force-closed.
    pub fn block_disconnected(&self, header: &Header, height: u32) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let reorged: Vec<ChannelId> = holder
            .by_id
            .iter_mut()
            .filter_map(|(channel_id, channel)| channel.block_disconnected(header, height).then_some(*channel_id))
            .collect();
        for channel_id in reorged {
            warn!(%channel_id, height, "funding transaction reorged out");
            self.force_close_internal(holder, channel_id, "funding transaction reorged out", true);
        }
        self.latest_block_height
            .store(height.saturating_sub(1), Ordering::Release);
        *self.last_block_hash.lock().unwrap_or_else(PoisonError::into_inner) = header.prev_blockhash;
    }

    // ============ Internal Plumbing ============

    fn queue_error(holder: &mut ChannelHolder, node_id: &PublicKey, channel_id: ChannelId, data: String) {
        holder.pending_msg_events.push(MessageSendEvent::HandleError {
            node_id: *node_id,
            action: ErrorAction::SendErrorMessage {
                msg: ErrorMessage { channel_id, data },
            },
        });
    }

    /// Run `op` on the channel `their_node_id` addressed, turning errors
    /// into ignored messages or closures
    fn with_channel<R>(
        &self,
        holder: &mut ChannelHolder,
        their_node_id: &PublicKey,
        channel_id: ChannelId,
        op: impl FnOnce(&mut Channel) -> Result<R, ChannelError>,
    ) -> Option<R> {
        let Some(channel) = holder.by_id.get_mut(&channel_id) else {
            debug!(%channel_id, peer = %their_node_id, "message for unknown channel");
            Self::queue_error(holder, their_node_id, channel_id, "failed to find corresponding channel".to_owned());
            return None;
        };
        if channel.get_counterparty_node_id() != *their_node_id {
            warn!(%channel_id, peer = %their_node_id, "message for a channel with another peer");
            Self::queue_error(
                holder,
                their_node_id,
                channel_id,
                "got a message for a channel from the wrong node".to_owned(),
            );
            return None;
        }
        match op(channel) {
            Ok(result) => Some(result),
            Err(e) => {
                self.handle_channel_error(holder, channel_id, e);
                None
            }
        }
    }

    fn handle_channel_error(&self, holder: &mut ChannelHolder, channel_id: ChannelId, err: ChannelError) {
        match err {
            ChannelError::Ignore(msg) => debug!(%channel_id, error = %msg, "ignoring channel error"),
            ChannelError::Close(msg) => {
                warn!(%channel_id, error = %msg, "closing channel");
                let node_id = holder.by_id.get(&channel_id).map(Channel::get_counterparty_node_id);
                self.force_close_internal(holder, channel_id, &msg, true);
                if let Some(node_id) = node_id {
                    Self::queue_error(holder, &node_id, channel_id, msg.into_owned());
                }
            }
        }
    }

    /// Remove a channel, hand its final monitor update over and fail its
    /// held HTLCs back. Returns false if it was already gone.
    fn force_close_internal(&self, holder: &mut ChannelHolder, channel_id: ChannelId, reason: &str, should_broadcast: bool) -> bool {
        let Some(mut channel) = holder.by_id.remove(&channel_id) else {
            return false;
        };
        if let Some(short_channel_id) = channel.get_short_channel_id() {
            holder.short_to_id.remove(&short_channel_id);
        }
        holder.disabled_channels.remove(&channel_id);
        holder.held_funding.remove(&channel_id);

        let (monitor_update, dropped) = channel.force_shutdown(should_broadcast);
        if let Some((funding_txo, update)) = monitor_update {
            if let Err(e) = self.chain_monitor.update_channel(funding_txo, update) {
                warn!(%channel_id, error = %e, "final monitor update failed");
            }
        }
        for htlc in dropped {
            self.fail_htlc_backwards_internal(
                holder,
                htlc.source,
                &htlc.payment_hash,
                HTLCFailReason::reason(PERMANENT_CHANNEL_FAILURE, Vec::new()),
            );
        }
        if let Some(msg) = self.announced_update(&channel) {
            holder
                .pending_msg_events
                .push(MessageSendEvent::BroadcastChannelUpdate { msg });
        }
        info!(%channel_id, reason, should_broadcast, "channel closed");
        self.push_event(Event::ChannelClosed {
            channel_id,
            reason: reason.to_owned(),
        });
        true
    }

    fn finish_cooperative_close(&self, holder: &mut ChannelHolder, channel_id: ChannelId) {
        let Some(channel) = holder.by_id.remove(&channel_id) else {
            return;
        };
        if let Some(short_channel_id) = channel.get_short_channel_id() {
            holder.short_to_id.remove(&short_channel_id);
        }
        holder.disabled_channels.remove(&channel_id);
        if let Some(msg) = self.announced_update(&channel) {
            holder
                .pending_msg_events
                .push(MessageSendEvent::BroadcastChannelUpdate { msg });
        }
        info!(%channel_id, "channel closed cooperatively");
        self.push_event(Event::ChannelClosed {
            channel_id,
            reason: "cooperative close".to_owned(),
        });
    }

    fn apply_monitor_update(&self, holder: &mut ChannelHolder, channel_id: ChannelId, update: ChannelMonitorUpdate) -> MonitorApply {
        let Some(funding_txo) = holder.by_id.get(&channel_id).and_then(Channel::get_funding_txo) else {
            return MonitorApply::Closed;
        };
        match self.chain_monitor.update_channel(funding_txo, update) {
            Ok(()) => MonitorApply::Done,
            Err(ChannelMonitorUpdateErr::TemporaryFailure) => {
                warn!(%channel_id, "monitor update failed temporarily");
                MonitorApply::Paused
            }
            Err(ChannelMonitorUpdateErr::PermanentFailure) => {
                error!(%channel_id, "monitor update failed permanently");
                let node_id = holder.by_id.get(&channel_id).map(Channel::get_counterparty_node_id);
                self.force_close_internal(holder, channel_id, "permanent monitor update failure", false);
                if let Some(node_id) = node_id {
                    Self::queue_error(holder, &node_id, channel_id, "channel monitor update failed".to_owned());
                }
                MonitorApply::Closed
            }
        }
    }

    /// Sign and send whatever the channel has pending
    fn commit_channel(&self, holder: &mut ChannelHolder, channel_id: ChannelId) -> MonitorApply {
        let Some(channel) = holder.by_id.get_mut(&channel_id) else {
            return MonitorApply::Closed;
        };
        let node_id = channel.get_counterparty_node_id();
        match channel.send_commitment() {
            Ok(None) => MonitorApply::Done,
            Ok(Some((updates, monitor_update))) => {
                let applied = self.apply_monitor_update(holder, channel_id, monitor_update);
                match applied {
                    MonitorApply::Done => holder
                        .pending_msg_events
                        .push(MessageSendEvent::UpdateHTLCs { node_id, updates }),
                    MonitorApply::Paused => {
                        if let Some(channel) = holder.by_id.get_mut(&channel_id) {
                            channel.monitor_update_failed(false, true, Vec::new());
                        }
                    }
                    MonitorApply::Closed => {}
                }
                applied
            }
            Err(e) => {
                self.handle_channel_error(holder, channel_id, e);
                if holder.by_id.contains_key(&channel_id) {
                    MonitorApply::Done
                } else {
                    MonitorApply::Closed
                }
            }
        }
    }

    /// Apply a handler's outcome: persist first, then send, then route the
    /// HTLCs it locked in or resolved
    fn handle_channel_outcome(&self, holder: &mut ChannelHolder, channel_id: ChannelId, outcome: ChannelOutcome) {
        let ChannelOutcome {
            revoke_and_ack,
            commitment_update,
            order,
            monitor_update,
            funding_locked,
            shutdown,
            mut locked_in,
            resolved,
            dropped,
        } = outcome;

        if let Some(update) = monitor_update {
            match self.apply_monitor_update(holder, channel_id, update) {
                MonitorApply::Done => {}
                MonitorApply::Paused => {
                    if let Some(channel) = holder.by_id.get_mut(&channel_id) {
                        channel.monitor_update_failed(
                            revoke_and_ack.is_some(),
                            commitment_update.is_some(),
                            std::mem::take(&mut locked_in),
                        );
                    }
                    self.process_resolved(holder, resolved);
                    self.fail_dropped(holder, dropped);
                    return;
                }
                MonitorApply::Closed => {
                    self.process_resolved(holder, resolved);
                    return;
                }
            }
        }

        let Some(node_id) = holder.by_id.get(&channel_id).map(Channel::get_counterparty_node_id) else {
            return;
        };
        let events = &mut holder.pending_msg_events;
        if let Some(msg) = funding_locked {
            events.push(MessageSendEvent::SendFundingLocked { node_id, msg });
        }
        let raa = revoke_and_ack.map(|msg| MessageSendEvent::SendRevokeAndACK { node_id, msg });
        let commitment = commitment_update.map(|updates| MessageSendEvent::UpdateHTLCs { node_id, updates });
        match order {
            RAACommitmentOrder::CommitmentFirst => events.extend(commitment.into_iter().chain(raa)),
            RAACommitmentOrder::RevokeAndACKFirst => events.extend(raa.into_iter().chain(commitment)),
        }
        if let Some(msg) = shutdown {
            events.push(MessageSendEvent::SendShutdown { node_id, msg });
        }

        self.process_locked_in(holder, channel_id, locked_in);
        self.process_resolved(holder, resolved);
        self.fail_dropped(holder, dropped);
        self.maybe_propose_closing(holder, channel_id);
    }

    fn process_locked_in(&self, holder: &mut ChannelHolder, channel_id: ChannelId, locked_in: Vec<LockedInHTLC>) {
        if locked_in.is_empty() {
            return;
        }
        let Some(channel) = holder.by_id.get_mut(&channel_id) else {
            return;
        };
        let short_channel_id = channel.get_short_channel_id().unwrap_or(RECEIVE_SCID);
        let had_forwards = !holder.forward_htlcs.is_empty();
        let mut queued = false;
        let mut failed_any = false;
        for htlc in locked_in {
            match htlc.status {
                PendingHTLCStatus::Forward(info) => {
                    let prev_hop = HTLCPreviousHopData {
                        short_channel_id,
                        htlc_id: htlc.htlc_id,
                        incoming_packet_shared_secret: info.incoming_shared_secret,
                    };
                    let next = match &info.routing {
                        PendingHTLCRouting::Forward { short_channel_id, .. } => *short_channel_id,
                        PendingHTLCRouting::Receive { .. } => RECEIVE_SCID,
                    };
                    holder
                        .forward_htlcs
                        .entry(next)
                        .or_default()
                        .push(PendingForward { prev_hop, info });
                    queued = true;
                }
                PendingHTLCStatus::Fail(msg) => match channel.get_update_fail_htlc(htlc.htlc_id, FailPayload::from(msg)) {
                    Ok(()) => failed_any = true,
                    Err(e) => debug!(%channel_id, htlc_id = htlc.htlc_id, error = %e, "could not fail HTLC"),
                },
            }
        }
        if failed_any {
            self.commit_channel(holder, channel_id);
        }
        if queued && !had_forwards {
            self.push_event(Event::PendingHTLCsForwardable {
                time_forwardable: Duration::from_millis(MIN_HTLC_RELAY_HOLDING_CELL_MILLIS),
            });
        }
    }

    fn process_resolved(&self, holder: &mut ChannelHolder, resolved: Vec<ResolvedHTLC>) {
        for htlc in resolved {
            match htlc {
                ResolvedHTLC::Fulfilled { source, preimage } => self.claim_funds_internal(holder, source, preimage),
                ResolvedHTLC::Failed {
                    source,
                    payment_hash,
                    reason,
                } => self.fail_htlc_backwards_internal(holder, source, &payment_hash, reason),
            }
        }
    }

    fn fail_dropped(&self, holder: &mut ChannelHolder, dropped: Vec<DroppedHTLC>) {
        for htlc in dropped {
            let data = holder
                .by_id
                .get(&htlc.channel_id)
                .map(|channel| self.channel_update_data(channel, &[]))
                .unwrap_or_default();
            self.fail_htlc_backwards_internal(
                holder,
                htlc.source,
                &htlc.payment_hash,
                HTLCFailReason::reason(TEMPORARY_CHANNEL_FAILURE, data),
            );
        }
    }

    fn maybe_propose_closing(&self, holder: &mut ChannelHolder, channel_id: ChannelId) {
        let Some(channel) = holder.by_id.get_mut(&channel_id) else {
            return;
        };
        let node_id = channel.get_counterparty_node_id();
        match channel.maybe_propose_first_closing_signed(self.fee_estimator.as_ref()) {
            Ok(Some(msg)) => holder
                .pending_msg_events
                .push(MessageSendEvent::SendClosingSigned { node_id, msg }),
            Ok(None) => {}
            Err(e) => self.handle_channel_error(holder, channel_id, e),
        }
    }

    fn claim_funds_internal(&self, holder: &mut ChannelHolder, source: HTLCSource, preimage: PaymentPreimage) {
        match source {
            HTLCSource::OutboundRoute { .. } => {
                info!(payment_hash = %preimage.payment_hash(), "payment sent");
                self.push_event(Event::PaymentSent {
                    payment_preimage: preimage,
                });
            }
            HTLCSource::PreviousHopData(prev_hop) => {
                self.claim_funds_from_hop(holder, prev_hop, preimage);
            }
        }
    }

    fn claim_funds_from_hop(&self, holder: &mut ChannelHolder, prev_hop: HTLCPreviousHopData, preimage: PaymentPreimage) -> bool {
        let Some(channel_id) = holder.short_to_id.get(&prev_hop.short_channel_id).copied() else {
            warn!(short_channel_id = prev_hop.short_channel_id, "upstream channel gone, claim left to the monitor");
            return false;
        };
        let Some(channel) = holder.by_id.get_mut(&channel_id) else {
            return false;
        };
        match channel.get_update_fulfill_htlc(prev_hop.htlc_id, preimage) {
            Ok(update) => {
                match self.apply_monitor_update(holder, channel_id, update) {
                    MonitorApply::Done => {}
                    MonitorApply::Paused => {
                        if let Some(channel) = holder.by_id.get_mut(&channel_id) {
                            channel.monitor_update_failed(false, false, Vec::new());
                        }
                    }
                    MonitorApply::Closed => return true,
                }
                self.commit_channel(holder, channel_id);
                true
            }
            Err(e) => {
                self.handle_channel_error(holder, channel_id, e);
                false
            }
        }
    }

    fn fail_htlc_backwards_internal(
        &self,
        holder: &mut ChannelHolder,
        source: HTLCSource,
        payment_hash: &PaymentHash,
        reason: HTLCFailReason,
    ) {
        match source {
            HTLCSource::OutboundRoute { path, session_priv, .. } => {
                let (rejected_by_dest, network_update) = match &reason {
                    HTLCFailReason::LightningError { err } => {
                        let interpretation = onion::process_onion_failure(&path, &session_priv, err);
                        (interpretation.rejected_by_dest, interpretation.network_update)
                    }
                    HTLCFailReason::Reason { failure_code, .. } => (path.len() == 1 && failure_code & BADONION != 0, None),
                };
                if let Some(update) = network_update {
                    holder
                        .pending_msg_events
                        .push(MessageSendEvent::PaymentFailureNetworkUpdate { update });
                }
                info!(%payment_hash, rejected_by_dest, "payment failed");
                self.push_event(Event::PaymentFailed {
                    payment_hash: *payment_hash,
                    rejected_by_dest,
                });
            }
            HTLCSource::PreviousHopData(prev_hop) => {
                let secret = &prev_hop.incoming_packet_shared_secret;
                let packet = match reason {
                    HTLCFailReason::LightningError { mut err } => {
                        onion::crypt_failure_packet(secret, &mut err);
                        err
                    }
                    HTLCFailReason::Reason { failure_code, data } => {
                        onion::build_first_hop_failure_packet(secret, failure_code, &data)
                    }
                };
                let Some(channel_id) = holder.short_to_id.get(&prev_hop.short_channel_id).copied() else {
                    debug!(%payment_hash, "upstream channel gone, its monitor will time the HTLC out");
                    return;
                };
                let Some(channel) = holder.by_id.get_mut(&channel_id) else {
                    return;
                };
                match channel.get_update_fail_htlc(prev_hop.htlc_id, FailPayload::Relay(packet)) {
                    Ok(()) => {
                        trace!(%channel_id, %payment_hash, "failing HTLC backwards");
                        self.commit_channel(holder, channel_id);
                    }
                    Err(e) => self.handle_channel_error(holder, channel_id, e),
                }
            }
        }
    }

    // ============ Gossip ============

    fn next_update_timestamp(&self) -> u32 {
        let now = unix_time_secs();
        let previous = self
            .last_update_timestamp
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last.saturating_add(1))))
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    /// Our signed `channel_update` for `channel`, `None` before it has a
    /// short channel id
    fn get_channel_update(&self, channel: &Channel) -> Option<ChannelUpdate> {
        let short_channel_id = channel.get_short_channel_id()?;
        let were_node_one =
            self.our_network_pubkey.serialize()[..] < channel.get_counterparty_node_id().serialize()[..];
        let direction = u8::from(!were_node_one);
        let disabled = u8::from(!channel.is_live()) << 1;
        let contents = UnsignedChannelUpdate {
            chain_hash: self.genesis_hash,
            short_channel_id,
            timestamp: self.next_update_timestamp(),
            message_flags: 0,
            channel_flags: direction | disabled,
            cltv_expiry_delta: CLTV_EXPIRY_DELTA,
            htlc_minimum_msat: channel.get_holder_htlc_minimum_msat(),
            fee_base_msat: channel.get_our_fee_base_msat(self.fee_estimator.as_ref()),
            fee_proportional_millionths: channel.config().fee_proportional_millionths,
            htlc_maximum_msat: None,
            excess_data: Vec::new(),
        };
        let signature = SECP.sign_ecdsa(&contents.signing_message(), &self.our_network_key);
        Some(ChannelUpdate { signature, contents })
    }

    /// The closing update for a public channel, `None` for private ones
    fn announced_update(&self, channel: &Channel) -> Option<ChannelUpdate> {
        if channel.config().announced_channel {
            self.get_channel_update(channel)
        } else {
            None
        }
    }

    /// `prefix` followed by our length-prefixed `channel_update`, the data
    /// of an UPDATE-flagged failure
    fn channel_update_data(&self, channel: &Channel, prefix: &[u8]) -> Vec<u8> {
        let mut data = prefix.to_vec();
        if let Some(update) = self.get_channel_update(channel) {
            data.extend(update.encode().encode());
        }
        data
    }

    // ============ Onion Decoding ============

    /// Peel an incoming HTLC's onion and decide whether to accept, forward
    /// or fail it
    fn decode_update_add_htlc_onion(&self, holder: &ChannelHolder, msg: &UpdateAddHTLC) -> PendingHTLCStatus {
        let fail = |shared_secret: &[u8; 32], failure_code: u16, data: &[u8]| {
            PendingHTLCStatus::Fail(HTLCFailureMsg::Relay(UpdateFailHTLC {
                channel_id: msg.channel_id,
                htlc_id: msg.htlc_id,
                reason: onion::build_first_hop_failure_packet(shared_secret, failure_code, data),
            }))
        };

        let peeled = match onion::peel_onion_packet(&self.our_network_key, &msg.onion_routing_packet, &msg.payment_hash) {
            Ok(peeled) => peeled,
            Err(OnionDecodeError::Malformed { failure_code }) => {
                debug!(channel_id = %msg.channel_id, htlc_id = msg.htlc_id, failure_code, "malformed onion");
                return PendingHTLCStatus::Fail(HTLCFailureMsg::Malformed(UpdateFailMalformedHTLC {
                    channel_id: msg.channel_id,
                    htlc_id: msg.htlc_id,
                    sha256_of_onion: sha256(&msg.onion_routing_packet.encode()),
                    failure_code,
                }));
            }
            Err(OnionDecodeError::InvalidPayload { shared_secret }) => {
                return fail(&shared_secret, INVALID_ONION_PAYLOAD, &[]);
            }
        };
        let shared_secret = peeled.shared_secret;
        let payload = peeled.payload;
        let height = self.latest_block_height();

        let Some(next_packet) = peeled.next_packet else {
            if u64::from(msg.cltv_expiry) < u64::from(height) + u64::from(HTLC_FAIL_BACK_BUFFER) {
                return fail(
                    &shared_secret,
                    INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS,
                    &unknown_payment_data(msg.amount_msat, height),
                );
            }
            if payload.outgoing_cltv_value > msg.cltv_expiry {
                return fail(&shared_secret, FINAL_INCORRECT_CLTV_EXPIRY, &msg.cltv_expiry.to_be_bytes());
            }
            if payload.amt_to_forward > msg.amount_msat {
                return fail(&shared_secret, FINAL_INCORRECT_HTLC_AMOUNT, &msg.amount_msat.to_be_bytes());
            }
            return PendingHTLCStatus::Forward(PendingHTLCInfo {
                routing: PendingHTLCRouting::Receive {
                    payment_data: payload.payment_data,
                    incoming_cltv_expiry: msg.cltv_expiry,
                },
                incoming_shared_secret: shared_secret,
                payment_hash: msg.payment_hash,
                amt_to_forward: payload.amt_to_forward,
                outgoing_cltv_value: payload.outgoing_cltv_value,
            });
        };

        let Some(short_channel_id) = payload.short_channel_id else {
            return fail(&shared_secret, INVALID_ONION_PAYLOAD, &[]);
        };
        let Some(channel) = holder
            .short_to_id
            .get(&short_channel_id)
            .and_then(|channel_id| holder.by_id.get(channel_id))
        else {
            return fail(&shared_secret, UNKNOWN_NEXT_PEER, &[]);
        };
        if !channel.is_live() {
            let code = if channel.is_usable() { TEMPORARY_CHANNEL_FAILURE } else { CHANNEL_DISABLED };
            return fail(&shared_secret, code, &self.channel_update_data(channel, &[]));
        }
        let amt_to_forward = payload.amt_to_forward;
        if amt_to_forward < channel.get_counterparty_htlc_minimum_msat() {
            return fail(
                &shared_secret,
                AMOUNT_BELOW_MINIMUM,
                &self.channel_update_data(channel, &msg.amount_msat.to_be_bytes()),
            );
        }
        let fee = amt_to_forward
            .checked_mul(u64::from(channel.config().fee_proportional_millionths))
            .map(|proportional| proportional / 1_000_000)
            .and_then(|proportional| proportional.checked_add(u64::from(channel.get_our_fee_base_msat(self.fee_estimator.as_ref()))));
        let fee_paid = msg.amount_msat.checked_sub(amt_to_forward);
        if fee.is_none() || fee_paid.is_none() || fee_paid < fee {
            return fail(
                &shared_secret,
                FEE_INSUFFICIENT,
                &self.channel_update_data(channel, &msg.amount_msat.to_be_bytes()),
            );
        }
        if u64::from(msg.cltv_expiry) < u64::from(payload.outgoing_cltv_value) + u64::from(CLTV_EXPIRY_DELTA) {
            return fail(
                &shared_secret,
                INCORRECT_CLTV_EXPIRY,
                &self.channel_update_data(channel, &msg.cltv_expiry.to_be_bytes()),
            );
        }
        let cur_height = height.saturating_add(1);
        if msg.cltv_expiry <= cur_height.saturating_add(HTLC_FAIL_BACK_BUFFER) {
            return fail(&shared_secret, EXPIRY_TOO_SOON, &self.channel_update_data(channel, &[]));
        }
        if msg.cltv_expiry > cur_height.saturating_add(CLTV_FAR_FAR_AWAY) {
            return fail(&shared_secret, EXPIRY_TOO_FAR, &[]);
        }
        PendingHTLCStatus::Forward(PendingHTLCInfo {
            routing: PendingHTLCRouting::Forward {
                onion_packet: next_packet,
                short_channel_id,
            },
            incoming_shared_secret: shared_secret,
            payment_hash: msg.payment_hash,
            amt_to_forward,
            outgoing_cltv_value: payload.outgoing_cltv_value,
        })
    }
}

// ============ Event Providers ============

impl MessageSendEventsProvider for ChannelManager {
    fn get_and_clear_pending_msg_events(&self) -> Vec<MessageSendEvent> {
        self.process_pending_monitor_events();
        std::mem::take(&mut self.lock_state().pending_msg_events)
    }
}

impl EventsProvider for ChannelManager {
    fn get_and_clear_pending_events(&self) -> Vec<Event> {
        self.process_pending_monitor_events();
        std::mem::take(&mut *self.pending_events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ============ Message Handling ============

impl ChannelMessageHandler for ChannelManager {
    fn handle_open_channel(&self, their_node_id: &PublicKey, _their_features: InitFeatures, msg: &OpenChannel) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let temporary_channel_id = msg.temporary_channel_id;
        if msg.chain_hash != self.genesis_hash {
            Self::queue_error(holder, their_node_id, temporary_channel_id, "unknown genesis block hash".to_owned());
            return;
        }
        if holder.by_id.contains_key(&temporary_channel_id) {
            Self::queue_error(holder, their_node_id, temporary_channel_id, "temporary_channel_id collision".to_owned());
            return;
        }
        let accepted = Channel::new_from_req(
            self.keys_manager.as_ref(),
            self.fee_estimator.as_ref(),
            *their_node_id,
            msg,
            0,
            &self.default_configuration,
        )
        .and_then(|channel| channel.get_accept_channel().map(|accept| (channel, accept)));
        match accepted {
            Ok((channel, accept)) => {
                info!(channel_id = %temporary_channel_id, peer = %their_node_id, funding_satoshis = msg.funding_satoshis, "accepting inbound channel");
                holder.by_id.insert(temporary_channel_id, channel);
                holder.pending_msg_events.push(MessageSendEvent::SendAcceptChannel {
                    node_id: *their_node_id,
                    msg: accept,
                });
            }
            Err(e) => {
                debug!(channel_id = %temporary_channel_id, error = %e, "rejecting inbound channel");
                Self::queue_error(holder, their_node_id, temporary_channel_id, e.to_string());
            }
        }
    }

    fn handle_accept_channel(&self, their_node_id: &PublicKey, _their_features: InitFeatures, msg: &AcceptChannel) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let ready = self.with_channel(holder, their_node_id, msg.temporary_channel_id, |channel| {
            channel.accept_channel(msg, &self.default_configuration)?;
            Ok(Event::FundingGenerationReady {
                temporary_channel_id: msg.temporary_channel_id,
                channel_value_satoshis: channel.get_channel_value_satoshis(),
                output_script: channel.get_funding_scriptpubkey()?,
                user_channel_id: channel.get_user_id(),
            })
        });
        if let Some(event) = ready {
            self.push_event(event);
        }
    }

    fn handle_funding_created(&self, their_node_id: &PublicKey, msg: &FundingCreated) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let temporary_channel_id = msg.temporary_channel_id;
        match holder.by_id.get(&temporary_channel_id) {
            Some(channel) if channel.get_counterparty_node_id() == *their_node_id => {}
            _ => {
                Self::queue_error(holder, their_node_id, temporary_channel_id, "failed to find corresponding channel".to_owned());
                return;
            }
        }
        let Some(mut channel) = holder.by_id.remove(&temporary_channel_id) else {
            return;
        };
        let (signed, monitor) = match channel.funding_created(msg) {
            Ok(result) => result,
            Err(e) => {
                warn!(channel_id = %temporary_channel_id, error = %e, "bad funding_created, dropping channel");
                Self::queue_error(holder, their_node_id, temporary_channel_id, e.to_string());
                return;
            }
        };
        let channel_id = channel.channel_id();
        let Some(funding_txo) = channel.get_funding_txo() else {
            return;
        };
        if holder.by_id.contains_key(&channel_id) {
            Self::queue_error(
                holder,
                their_node_id,
                temporary_channel_id,
                "already had channel with the new channel_id".to_owned(),
            );
            return;
        }
        match self.chain_monitor.watch_channel(funding_txo, monitor) {
            Ok(()) => holder.pending_msg_events.push(MessageSendEvent::SendFundingSigned {
                node_id: *their_node_id,
                msg: signed,
            }),
            Err(ChannelMonitorUpdateErr::TemporaryFailure) => {
                channel.monitor_update_failed(false, false, Vec::new());
                holder.held_funding.insert(channel_id, HeldFunding::Signed(signed));
            }
            Err(ChannelMonitorUpdateErr::PermanentFailure) => {
                error!(%channel_id, "could not persist monitor for new channel");
                Self::queue_error(holder, their_node_id, temporary_channel_id, "failed to persist channel monitor".to_owned());
                return;
            }
        }
        info!(%channel_id, %funding_txo, "inbound channel funded");
        holder.by_id.insert(channel_id, channel);
    }

    fn handle_funding_signed(&self, their_node_id: &PublicKey, msg: &FundingSigned) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let channel_id = msg.channel_id;
        let signed = self.with_channel(holder, their_node_id, channel_id, |channel| {
            let monitor = channel.funding_signed(msg)?;
            let funding_txo = channel
                .get_funding_txo()
                .ok_or_else(|| ChannelError::close("funding outpoint unknown"))?;
            Ok((funding_txo, monitor, channel.get_user_id()))
        });
        let Some((funding_txo, monitor, user_channel_id)) = signed else {
            return;
        };
        match self.chain_monitor.watch_channel(funding_txo, monitor) {
            Ok(()) => self.push_event(Event::FundingBroadcastSafe {
                funding_txo,
                user_channel_id,
            }),
            Err(ChannelMonitorUpdateErr::TemporaryFailure) => {
                if let Some(channel) = holder.by_id.get_mut(&channel_id) {
                    channel.monitor_update_failed(false, false, Vec::new());
                }
                holder.held_funding.insert(
                    channel_id,
                    HeldFunding::BroadcastSafe {
                        funding_txo,
                        user_channel_id,
                    },
                );
            }
            Err(ChannelMonitorUpdateErr::PermanentFailure) => {
                error!(%channel_id, "could not persist monitor for new channel");
                self.force_close_internal(holder, channel_id, "failed to persist channel monitor", false);
                Self::queue_error(holder, their_node_id, channel_id, "failed to persist channel monitor".to_owned());
            }
        }
    }

    fn handle_funding_locked(&self, their_node_id: &PublicKey, msg: &FundingLocked) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let sigs = self.with_channel(holder, their_node_id, msg.channel_id, |channel| {
            channel.funding_locked(msg)?;
            if let Some(short_channel_id) = channel.get_short_channel_id() {
                trace!(channel_id = %msg.channel_id, short_channel_id, "channel locked");
            }
            Ok(channel.get_announcement_signatures(&self.our_network_key, self.genesis_hash))
        });
        if let Some(Some(msg)) = sigs {
            holder.pending_msg_events.push(MessageSendEvent::SendAnnouncementSignatures {
                node_id: *their_node_id,
                msg,
            });
        }
    }

    fn handle_shutdown(&self, their_node_id: &PublicKey, msg: &Shutdown) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some((reply, dropped)) = self.with_channel(holder, their_node_id, msg.channel_id, |channel| channel.shutdown(msg))
        else {
            return;
        };
        if let Some(reply) = reply {
            holder.pending_msg_events.push(MessageSendEvent::SendShutdown {
                node_id: *their_node_id,
                msg: reply,
            });
        }
        self.fail_dropped(holder, dropped);
        self.maybe_propose_closing(holder, msg.channel_id);
    }

    fn handle_closing_signed(&self, their_node_id: &PublicKey, msg: &ClosingSigned) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some((reply, closing_tx)) = self.with_channel(holder, their_node_id, msg.channel_id, |channel| {
            channel.closing_signed(self.fee_estimator.as_ref(), msg)
        }) else {
            return;
        };
        if let Some(reply) = reply {
            holder.pending_msg_events.push(MessageSendEvent::SendClosingSigned {
                node_id: *their_node_id,
                msg: reply,
            });
        }
        if let Some(tx) = closing_tx {
            info!(channel_id = %msg.channel_id, txid = %tx.compute_txid(), "broadcasting closing transaction");
            self.broadcaster.broadcast_transaction(&tx);
            self.finish_cooperative_close(holder, msg.channel_id);
        }
    }

    fn handle_update_add_htlc(&self, their_node_id: &PublicKey, msg: &UpdateAddHTLC) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let status = self.decode_update_add_htlc_onion(holder, msg);
        let incoming_update = holder
            .by_id
            .get(&msg.channel_id)
            .map(|channel| (channel.is_usable(), self.channel_update_data(channel, &[])));
        let status = match (status, incoming_update) {
            // Don't forward over a channel we are closing
            (PendingHTLCStatus::Forward(info), Some((false, data))) => {
                PendingHTLCStatus::Fail(HTLCFailureMsg::Relay(UpdateFailHTLC {
                    channel_id: msg.channel_id,
                    htlc_id: msg.htlc_id,
                    reason: onion::build_first_hop_failure_packet(&info.incoming_shared_secret, CHANNEL_DISABLED, &data),
                }))
            }
            (status, _) => status,
        };
        self.with_channel(holder, their_node_id, msg.channel_id, |channel| {
            channel.update_add_htlc(msg, status)
        });
    }

    fn handle_update_fulfill_htlc(&self, their_node_id: &PublicKey, msg: &UpdateFulfillHTLC) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        if let Some(resolved) =
            self.with_channel(holder, their_node_id, msg.channel_id, |channel| channel.update_fulfill_htlc(msg))
        {
            self.process_resolved(holder, vec![resolved]);
        }
    }

    fn handle_update_fail_htlc(&self, their_node_id: &PublicKey, msg: &UpdateFailHTLC) {
        let mut guard = self.lock_state();
        self.with_channel(&mut guard, their_node_id, msg.channel_id, |channel| channel.update_fail_htlc(msg));
    }

    fn handle_update_fail_malformed_htlc(&self, their_node_id: &PublicKey, msg: &UpdateFailMalformedHTLC) {
        let mut guard = self.lock_state();
        self.with_channel(&mut guard, their_node_id, msg.channel_id, |channel| {
            if msg.failure_code & BADONION == 0 {
                return Err(ChannelError::close("got update_fail_malformed_htlc with BADONION not set"));
            }
            channel.update_fail_malformed_htlc(msg)
        });
    }

    fn handle_commitment_signed(&self, their_node_id: &PublicKey, msg: &CommitmentSigned) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        if let Some(outcome) =
            self.with_channel(holder, their_node_id, msg.channel_id, |channel| channel.commitment_signed(msg))
        {
            self.handle_channel_outcome(holder, msg.channel_id, outcome);
        }
    }

    fn handle_revoke_and_ack(&self, their_node_id: &PublicKey, msg: &RevokeAndACK) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        if let Some(outcome) = self.with_channel(holder, their_node_id, msg.channel_id, |channel| channel.revoke_and_ack(msg))
        {
            self.handle_channel_outcome(holder, msg.channel_id, outcome);
        }
    }

    fn handle_update_fee(&self, their_node_id: &PublicKey, msg: &UpdateFee) {
        let mut guard = self.lock_state();
        self.with_channel(&mut guard, their_node_id, msg.channel_id, |channel| {
            channel.update_fee(self.fee_estimator.as_ref(), msg)
        });
    }

    fn handle_announcement_signatures(&self, their_node_id: &PublicKey, msg: &AnnouncementSignatures) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let announced = self.with_channel(holder, their_node_id, msg.channel_id, |channel| {
            let announcement = channel.announcement_signatures(&self.our_network_key, self.genesis_hash, msg)?;
            Ok((announcement, self.get_channel_update(channel)))
        });
        if let Some((msg, Some(update_msg))) = announced {
            info!(short_channel_id = msg.contents.short_channel_id, "announcing channel");
            holder
                .pending_msg_events
                .push(MessageSendEvent::BroadcastChannelAnnouncement { msg, update_msg });
        }
    }

    fn handle_channel_reestablish(&self, their_node_id: &PublicKey, msg: &ChannelReestablish) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let Some(outcome) =
            self.with_channel(holder, their_node_id, msg.channel_id, |channel| channel.channel_reestablish(msg))
        else {
            return;
        };
        self.handle_channel_outcome(holder, msg.channel_id, outcome);
        let sigs = holder
            .by_id
            .get_mut(&msg.channel_id)
            .and_then(|channel| channel.get_announcement_signatures(&self.our_network_key, self.genesis_hash));
        if let Some(sigs) = sigs {
            holder.pending_msg_events.push(MessageSendEvent::SendAnnouncementSignatures {
                node_id: *their_node_id,
                msg: sigs,
            });
        }
    }

    fn peer_disconnected(&self, their_node_id: &PublicKey, no_connection_possible: bool) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        holder.peer_features.remove(their_node_id);
        let with_peer: Vec<ChannelId> = holder
            .by_id
            .iter()
            .filter(|(_, channel)| channel.get_counterparty_node_id() == *their_node_id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel_id in with_peer {
            let funded = holder
                .by_id
                .get(&channel_id)
                .is_some_and(|channel| channel.state().is_funded());
            if no_connection_possible {
                self.force_close_internal(holder, channel_id, "peer can never be reached again", true);
            } else if !funded {
                self.force_close_internal(holder, channel_id, "peer disconnected before funding completed", false);
            } else if let Some(channel) = holder.by_id.get_mut(&channel_id) {
                channel.remove_uncommitted_htlcs_and_mark_paused();
            }
        }
        holder
            .pending_msg_events
            .retain(|event| event_node_id(event) != Some(their_node_id));
        debug!(peer = %their_node_id, no_connection_possible, "peer disconnected");
    }

    fn peer_connected(&self, their_node_id: &PublicKey, msg: &Init) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        holder.peer_features.insert(*their_node_id, msg.features.clone());
        let mut reestablish = Vec::new();
        for (channel_id, channel) in &holder.by_id {
            if channel.get_counterparty_node_id() != *their_node_id {
                continue;
            }
            match channel.get_channel_reestablish() {
                Ok(msg) => reestablish.push(MessageSendEvent::SendChannelReestablish {
                    node_id: *their_node_id,
                    msg,
                }),
                Err(e) => trace!(%channel_id, error = %e, "no reestablish for channel"),
            }
        }
        debug!(peer = %their_node_id, channels = reestablish.len(), "peer connected");
        holder.pending_msg_events.extend(reestablish);
    }

    fn handle_error(&self, their_node_id: &PublicKey, msg: &ErrorMessage) {
        let mut guard = self.lock_state();
        let holder = &mut *guard;
        let targets: Vec<ChannelId> = if msg.channel_id == ChannelId::ALL {
            holder
                .by_id
                .iter()
                .filter(|(_, channel)| channel.get_counterparty_node_id() == *their_node_id)
                .map(|(channel_id, _)| *channel_id)
                .collect()
        } else {
            holder
                .by_id
                .get(&msg.channel_id)
                .filter(|channel| channel.get_counterparty_node_id() == *their_node_id)
                .map(|_| vec![msg.channel_id])
                .unwrap_or_default()
        };
        for channel_id in targets {
            warn!(%channel_id, peer = %their_node_id, error = %msg.data, "peer sent error, closing channel");
            let reason = format!("counterparty error: {}", msg.data);
            self.force_close_internal(holder, channel_id, &reason, true);
        }
    }
}

#[cfg(test)]
mod tests;
