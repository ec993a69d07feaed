//! Channel lifecycle states and the update logs behind every commitment.
//!
//! Each side's proposals live in its own append-only log. A commitment is
//! a *view*: a pair of log positions `(ours, theirs)` saying how many
//! entries of each log it includes.
//!
//! ```text
//!   local log   [add 0][add 1][fulfill t3][fee]...
//!                 ^^^^^^^^^^^^^^^^ holder_tip.ours
//!   remote log  [add 3][fail 1]...
//!                 ^^^^^ holder_tip.theirs
//! ```
//!
//! An entry is locked in once both our latest commitment and the
//! counterparty's oldest unrevoked commitment include it. An HTLC and its
//! removal are folded into the base balances once both are locked in.

use crate::channel::htlc::{HTLCFailReason, HTLCFailureMsg, HTLCSource, PendingHTLCStatus};
use crate::error::ChannelError;
use crate::msgs::OnionPacket;
use crate::types::{PaymentHash, PaymentPreimage};
use tracing::debug;

// ============ Lifecycle ============

/// Where a channel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// `open_channel` sent or received, `accept_channel` pending or sent
    NegotiatingOpen,
    /// Funding outpoint handed over, waiting for the acceptor's signature
    FundingCreated,
    /// First commitments exchanged, funding transaction not yet seen
    FundingSigned,
    /// Funding transaction seen, `funding_locked` not yet exchanged both ways
    AwaitingFundingConfirmation,
    /// Open for payments
    NormalOperation,
    /// `shutdown` sent or received; no new HTLCs
    Closing,
    /// Cooperatively or forcibly closed
    Closed,
}

impl ChannelState {
    /// Whether moving to `to` is allowed
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        match (self, to) {
            (_, Self::Closed) => true,
            (Self::NegotiatingOpen, Self::FundingCreated | Self::FundingSigned) => true,
            (Self::FundingCreated, Self::FundingSigned) => true,
            (Self::FundingSigned, Self::AwaitingFundingConfirmation | Self::NormalOperation) => true,
            (Self::AwaitingFundingConfirmation, Self::NormalOperation | Self::FundingSigned) => true,
            (Self::FundingSigned | Self::AwaitingFundingConfirmation | Self::NormalOperation, Self::Closing) => true,
            _ => false,
        }
    }

    /// True once both sides may update commitments
    #[must_use]
    pub fn is_operational(self) -> bool {
        matches!(self, Self::NormalOperation | Self::Closing)
    }

    /// True once funding signatures were exchanged
    #[must_use]
    pub fn is_funded(self) -> bool {
        !matches!(self, Self::NegotiatingOpen | Self::FundingCreated)
    }
}

/// Conditions that overlay the lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    /// The peer connection is down; no messages may be exchanged
    pub peer_disconnected: bool,
    /// A monitor update failed temporarily; outbound commitment messages
    /// are withheld
    pub monitor_update_in_progress: bool,
    /// We sent `commitment_signed` and wait for `revoke_and_ack`
    pub awaiting_remote_revoke: bool,
    /// We sent `shutdown`
    pub local_shutdown_sent: bool,
    /// They sent `shutdown`
    pub remote_shutdown_sent: bool,
    /// We sent `funding_locked`
    pub our_funding_locked: bool,
    /// They sent `funding_locked`
    pub their_funding_locked: bool,
}

/// Which of `revoke_and_ack` and `commitment_signed` goes first when both
/// must be retransmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RAACommitmentOrder {
    /// Commitment first, then the revocation
    CommitmentFirst,
    /// Revocation first, then the commitment
    RevokeAndACKFirst,
}

// ============ Update Logs ============

/// How we fail an HTLC the counterparty offered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPayload {
    /// An obfuscated failure onion
    Relay(Vec<u8>),
    /// The onion could not be parsed
    Malformed {
        /// Hash of the onion we received
        sha256_of_onion: [u8; 32],
        /// A BADONION failure code
        failure_code: u16,
    },
}

impl From<HTLCFailureMsg> for FailPayload {
    fn from(msg: HTLCFailureMsg) -> Self {
        match msg {
            HTLCFailureMsg::Relay(msg) => Self::Relay(msg.reason),
            HTLCFailureMsg::Malformed(msg) => Self::Malformed {
                sha256_of_onion: msg.sha256_of_onion,
                failure_code: msg.failure_code,
            },
        }
    }
}

/// One proposed change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    /// New HTLC offered by the log's owner
    Add {
        /// Sequential id
        htlc_id: u64,
        /// Value
        amount_msat: u64,
        /// Hash lock
        payment_hash: PaymentHash,
        /// Absolute expiry
        cltv_expiry: u32,
        /// Onion sent along, kept for retransmission (ours only)
        onion: Option<Box<OnionPacket>>,
        /// Who to tell on resolution (ours only)
        source: Option<HTLCSource>,
        /// Decoded onion, handed out when locked in (theirs only)
        pending: Option<PendingHTLCStatus>,
    },
    /// Claim of an HTLC in the other log
    Fulfill {
        /// Id in the other log
        htlc_id: u64,
        /// The preimage
        preimage: PaymentPreimage,
    },
    /// Failure of an HTLC in the other log
    Fail {
        /// Id in the other log
        htlc_id: u64,
        /// What we send, for our own failures
        payload: Option<FailPayload>,
        /// What we report upstream, for theirs
        reason: Option<HTLCFailReason>,
    },
    /// New commitment fee rate, only ever from the opener
    Fee {
        /// Sat per 1000 weight
        feerate_per_kw: u32,
    },
}

/// A positioned log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Stable position; never renumbered
    pub log_index: u64,
    /// The change
    pub update: LogUpdate,
    /// Locked in and already handed out
    pub locked: bool,
}

/// One side's proposals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateLog {
    entries: Vec<LogEntry>,
    next_index: u64,
}

impl UpdateLog {
    /// Position the next entry will get
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Append `update`
    pub fn push(&mut self, update: LogUpdate) {
        self.entries.push(LogEntry {
            log_index: self.next_index,
            update,
            locked: false,
        });
        self.next_index += 1;
    }

    /// All live entries
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// All live entries, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LogEntry> {
        self.entries.iter_mut()
    }

    /// Entries below `end`
    pub fn included(&self, end: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.log_index < end)
    }

    /// Entries in `[start, end)`
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(move |e| e.log_index >= start && e.log_index < end)
    }

    /// The add for `htlc_id`
    #[must_use]
    pub fn find_add(&self, htlc_id: u64) -> Option<&LogEntry> {
        self.entries
            .iter()
            .find(|e| matches!(e.update, LogUpdate::Add { htlc_id: id, .. } if id == htlc_id))
    }

    /// The fulfill or fail of `htlc_id` from the other log
    #[must_use]
    pub fn find_removal(&self, htlc_id: u64) -> Option<&LogEntry> {
        self.entries.iter().find(|e| match e.update {
            LogUpdate::Fulfill { htlc_id: id, .. } | LogUpdate::Fail { htlc_id: id, .. } => id == htlc_id,
            _ => false,
        })
    }

    /// Drop every entry at or above `from`; the dropped entries are
    /// returned in order and their positions are reused
    pub fn truncate(&mut self, from: u64) -> Vec<LogEntry> {
        let (keep, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.log_index < from);
        self.entries = keep;
        if !dropped.is_empty() {
            debug!(from, dropped = dropped.len(), "dropped uncommitted updates");
            self.next_index = from;
        }
        dropped
    }

    /// Remove the entries for which `remove` returns true
    pub fn remove_where(&mut self, mut remove: impl FnMut(&LogEntry) -> bool) {
        self.entries.retain(|e| !remove(e));
    }
}

/// Positions in both logs a commitment includes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitmentView {
    /// Entries of our log below this are included
    pub ours: u64,
    /// Entries of their log below this are included
    pub theirs: u64,
}

/// An HTLC as a commitment view sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHTLC {
    /// We offered it
    pub outbound: bool,
    /// Id in the offerer's log
    pub htlc_id: u64,
    /// Value
    pub amount_msat: u64,
    /// Hash lock
    pub payment_hash: PaymentHash,
    /// Absolute expiry
    pub cltv_expiry: u32,
}

/// Balances, fee rate and pending HTLCs of one view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentStats {
    /// Our balance, HTLCs excluded
    pub local_msat: u64,
    /// Their balance, HTLCs excluded
    pub remote_msat: u64,
    /// Fee rate in effect
    pub feerate_per_kw: u32,
    /// HTLCs still pending
    pub htlcs: Vec<ViewHTLC>,
}

/// Compute what `view` contains, starting from the folded base state
pub fn view_stats(
    local_log: &UpdateLog,
    remote_log: &UpdateLog,
    view: CommitmentView,
    base_local_msat: u64,
    base_remote_msat: u64,
    base_feerate: u32,
) -> Result<CommitmentStats, ChannelError> {
    let mut local = i128::from(base_local_msat);
    let mut remote = i128::from(base_remote_msat);
    let mut feerate = base_feerate;
    let mut htlcs = Vec::new();

    for (outbound, adds, removals, add_end, removal_end) in [
        (true, local_log, remote_log, view.ours, view.theirs),
        (false, remote_log, local_log, view.theirs, view.ours),
    ] {
        for entry in adds.included(add_end) {
            let LogUpdate::Add {
                htlc_id,
                amount_msat,
                payment_hash,
                cltv_expiry,
                ..
            } = &entry.update
            else {
                continue;
            };
            let amount = i128::from(*amount_msat);
            let (offerer, taker) = if outbound { (&mut local, &mut remote) } else { (&mut remote, &mut local) };
            *offerer -= amount;
            let removal = removals
                .find_removal(*htlc_id)
                .filter(|removal| removal.log_index < removal_end);
            match removal.map(|r| &r.update) {
                Some(LogUpdate::Fulfill { .. }) => *taker += amount,
                Some(_) => *offerer += amount,
                None => htlcs.push(ViewHTLC {
                    outbound,
                    htlc_id: *htlc_id,
                    amount_msat: *amount_msat,
                    payment_hash: *payment_hash,
                    cltv_expiry: *cltv_expiry,
                }),
            }
        }
    }

    let fees = local_log
        .included(view.ours)
        .chain(remote_log.included(view.theirs));
    for entry in fees {
        if let LogUpdate::Fee { feerate_per_kw } = entry.update {
            feerate = feerate_per_kw;
        }
    }

    let local_msat = u64::try_from(local).map_err(|_| ChannelError::close("our balance went negative"))?;
    let remote_msat = u64::try_from(remote).map_err(|_| ChannelError::close("their balance went negative"))?;
    Ok(CommitmentStats {
        local_msat,
        remote_msat,
        feerate_per_kw: feerate,
        htlcs,
    })
}

// ============ Holding Cell ============

/// A local update parked while we cannot sign a new commitment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldingCellUpdate {
    /// Offer an HTLC
    AddHTLC {
        /// Value
        amount_msat: u64,
        /// Hash lock
        payment_hash: PaymentHash,
        /// Absolute expiry
        cltv_expiry: u32,
        /// Who to tell on resolution
        source: HTLCSource,
        /// Onion to send
        onion: Box<OnionPacket>,
    },
    /// Claim a received HTLC
    ClaimHTLC {
        /// Their id
        htlc_id: u64,
        /// The preimage
        preimage: PaymentPreimage,
    },
    /// Fail a received HTLC
    FailHTLC {
        /// Their id
        htlc_id: u64,
        /// Failure to send
        payload: FailPayload,
    },
    /// Change the commitment fee rate
    UpdateFee {
        /// Sat per 1000 weight
        feerate_per_kw: u32,
    },
}
