//! Events surfaced to the embedder and messages queued for peers.
//!
//! Both queues are drained by swapping the whole vector out under the
//! owner's lock, so a concurrent producer never interleaves a partial
//! batch with a drain.

use crate::chain::OutPoint;
use crate::error::ErrorAction;
use crate::keys::SpendableOutputDescriptor;
use crate::msgs;
use crate::types::{ChannelId, PaymentHash, PaymentPreimage, PaymentSecret};
use bitcoin::ScriptBuf;
use bitcoin::secp256k1::PublicKey;
use std::time::Duration;

/// Something the embedding application must know about or act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The counterparty accepted our channel; build the funding transaction
    /// paying `output_script` and hand its outpoint to
    /// `funding_transaction_generated`
    FundingGenerationReady {
        /// Id to pass back to `funding_transaction_generated`
        temporary_channel_id: ChannelId,
        /// Amount the funding output must carry
        channel_value_satoshis: u64,
        /// P2WSH script of the 2-of-2 funding output
        output_script: ScriptBuf,
        /// Caller-chosen id from `create_channel`
        user_channel_id: u64,
    },
    /// The counterparty signed its commitment; the funding transaction may
    /// be broadcast
    FundingBroadcastSafe {
        /// The funding outpoint
        funding_txo: OutPoint,
        /// Caller-chosen id from `create_channel`
        user_channel_id: u64,
    },
    /// We hold HTLCs paying us; call `claim_funds` or `fail_htlc_backwards`
    PaymentReceived {
        /// Hash of the payment
        payment_hash: PaymentHash,
        /// Secret the sender included, if any
        payment_secret: Option<PaymentSecret>,
        /// Total amount across all parts
        amt: u64,
    },
    /// An outbound payment completed
    PaymentSent {
        /// Proof of payment
        payment_preimage: PaymentPreimage,
    },
    /// An outbound payment failed
    PaymentFailed {
        /// Hash of the payment
        payment_hash: PaymentHash,
        /// True if the payee itself rejected it; retrying is pointless
        rejected_by_dest: bool,
    },
    /// HTLCs are waiting to be forwarded; call
    /// `process_pending_htlc_forwards` after roughly `time_forwardable`
    PendingHTLCsForwardable {
        /// Suggested delay, for batching
        time_forwardable: Duration,
    },
    /// Outputs we may now spend with the included key material
    SpendableOutputs {
        /// The outputs
        outputs: Vec<SpendableOutputDescriptor>,
    },
    /// A channel closed, cooperatively or not
    ChannelClosed {
        /// The channel
        channel_id: ChannelId,
        /// Why it closed
        reason: String,
    },
}

/// The updates and signature of one `commitment_signed` round
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CommitmentUpdate {
    pub update_add_htlcs: Vec<msgs::UpdateAddHTLC>,
    pub update_fulfill_htlcs: Vec<msgs::UpdateFulfillHTLC>,
    pub update_fail_htlcs: Vec<msgs::UpdateFailHTLC>,
    pub update_fail_malformed_htlcs: Vec<msgs::UpdateFailMalformedHTLC>,
    pub update_fee: Option<msgs::UpdateFee>,
    pub commitment_signed: msgs::CommitmentSigned,
}

/// A message a handler wants sent, addressed by node id or broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MessageSendEvent {
    SendAcceptChannel { node_id: PublicKey, msg: msgs::AcceptChannel },
    SendOpenChannel { node_id: PublicKey, msg: msgs::OpenChannel },
    SendFundingCreated { node_id: PublicKey, msg: msgs::FundingCreated },
    SendFundingSigned { node_id: PublicKey, msg: msgs::FundingSigned },
    SendFundingLocked { node_id: PublicKey, msg: msgs::FundingLocked },
    SendAnnouncementSignatures { node_id: PublicKey, msg: msgs::AnnouncementSignatures },
    /// A batch of updates followed by `commitment_signed`
    UpdateHTLCs { node_id: PublicKey, updates: CommitmentUpdate },
    SendRevokeAndACK { node_id: PublicKey, msg: msgs::RevokeAndACK },
    SendClosingSigned { node_id: PublicKey, msg: msgs::ClosingSigned },
    SendShutdown { node_id: PublicKey, msg: msgs::Shutdown },
    SendChannelReestablish { node_id: PublicKey, msg: msgs::ChannelReestablish },
    /// Broadcast to every peer
    BroadcastChannelAnnouncement {
        msg: msgs::ChannelAnnouncement,
        update_msg: msgs::ChannelUpdate,
    },
    /// Broadcast to every peer
    BroadcastNodeAnnouncement { msg: msgs::NodeAnnouncement },
    /// Broadcast to every peer
    BroadcastChannelUpdate { msg: msgs::ChannelUpdate },
    /// Act against a misbehaving peer
    HandleError { node_id: PublicKey, action: ErrorAction },
    /// Feed a payment failure back into the routing graph
    PaymentFailureNetworkUpdate { update: msgs::HTLCFailChannelUpdate },
}

/// Source of [`MessageSendEvent`]s
pub trait MessageSendEventsProvider {
    /// Take every queued message event
    fn get_and_clear_pending_msg_events(&self) -> Vec<MessageSendEvent>;
}

/// Source of [`Event`]s
pub trait EventsProvider {
    /// Take every queued event. Events are never re-delivered.
    fn get_and_clear_pending_events(&self) -> Vec<Event>;
}
