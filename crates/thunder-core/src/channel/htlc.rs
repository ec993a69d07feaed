//! HTLC bookkeeping shared by the channel, the manager and the monitor.

use crate::msgs::{OnionPacket, UpdateFailHTLC, UpdateFailMalformedHTLC};
use crate::route::RouteHop;
use crate::types::{ChannelId, PaymentHash, PaymentPreimage};
use bitcoin::secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

/// Where an inbound HTLC came from, so it can be resolved backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HTLCPreviousHopData {
    /// Incoming channel
    pub short_channel_id: u64,
    /// Id on the incoming channel
    pub htlc_id: u64,
    /// Onion shared secret, for wrapping failures
    pub incoming_packet_shared_secret: [u8; 32],
}

/// Who is waiting on an outbound HTLC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HTLCSource {
    /// Forwarded from another channel
    PreviousHopData(HTLCPreviousHopData),
    /// A payment we originated
    OutboundRoute {
        /// The path it travels
        path: Vec<RouteHop>,
        /// Ephemeral onion key, needed to decrypt failures
        session_priv: SecretKey,
        /// Amount put on the first hop
        first_hop_htlc_msat: u64,
    },
}

impl HTLCSource {
    /// True for payments we originated
    #[must_use]
    pub fn is_outbound_payment(&self) -> bool {
        matches!(self, Self::OutboundRoute { .. })
    }
}

/// Why an HTLC is being failed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HTLCFailReason {
    /// A failure onion from downstream, already wrapped by us if needed
    LightningError {
        /// Encrypted failure packet
        err: Vec<u8>,
    },
    /// A failure we generate ourselves
    Reason {
        /// BOLT-4 failure code
        failure_code: u16,
        /// Code-specific data
        data: Vec<u8>,
    },
}

impl HTLCFailReason {
    /// A locally generated failure
    #[must_use]
    pub fn reason(failure_code: u16, data: Vec<u8>) -> Self {
        Self::Reason { failure_code, data }
    }
}

/// What to do with a received HTLC once it is irrevocably committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingHTLCStatus {
    /// Forward it or accept it
    Forward(PendingHTLCInfo),
    /// Fail it back with this message
    Fail(HTLCFailureMsg),
}

/// A decoded inbound HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHTLCInfo {
    /// Where it goes next
    pub routing: PendingHTLCRouting,
    /// Onion shared secret with the sender
    pub incoming_shared_secret: [u8; 32],
    /// Hash lock
    pub payment_hash: PaymentHash,
    /// Amount to put on the outgoing HTLC (or delivered, if final)
    pub amt_to_forward: u64,
    /// Expiry of the outgoing HTLC (or the final CLTV)
    pub outgoing_cltv_value: u32,
}

/// Next step for a [`PendingHTLCInfo`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingHTLCRouting {
    /// Forward over `short_channel_id` with the peeled onion
    Forward {
        /// Onion for the next hop
        onion_packet: OnionPacket,
        /// Outgoing channel
        short_channel_id: u64,
    },
    /// We are the payee
    Receive {
        /// Secret and total, when the sender supplied them
        payment_data: Option<crate::onion::FinalPaymentData>,
        /// The HTLC's own expiry
        incoming_cltv_expiry: u32,
    },
}

/// The message used to fail an HTLC back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HTLCFailureMsg {
    /// Regular failure onion
    Relay(UpdateFailHTLC),
    /// We could not even parse the onion
    Malformed(UpdateFailMalformedHTLC),
}

/// A received HTLC handed to the manager once it is locked in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedInHTLC {
    /// Id on this channel
    pub htlc_id: u64,
    /// Amount received
    pub amount_msat: u64,
    /// Expiry of the received HTLC
    pub cltv_expiry: u32,
    /// Decoded routing decision
    pub status: PendingHTLCStatus,
}

/// An outbound HTLC resolved by the counterparty
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedHTLC {
    /// Claimed with a preimage
    Fulfilled {
        /// Our HTLC source
        source: HTLCSource,
        /// Preimage the counterparty revealed
        preimage: PaymentPreimage,
    },
    /// Failed back to us
    Failed {
        /// Our HTLC source
        source: HTLCSource,
        /// Its payment hash
        payment_hash: PaymentHash,
        /// Why
        reason: HTLCFailReason,
    },
}

/// An HTLC that can no longer be kept and must be failed back upstream,
/// for example when a channel closes before it was committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedHTLC {
    /// Who to tell
    pub source: HTLCSource,
    /// Payment hash
    pub payment_hash: PaymentHash,
    /// Channel it was on
    pub channel_id: ChannelId,
}
