//! On-chain collaborators and channel monitoring.
//!
//! The traits here are implemented by the embedding application; the
//! core only ever calls them:
//!
//! ```text
//!   ChannelManager --Watch--> ChainMonitor --Persist--> disk
//!                                  |
//!                                  +--> ChannelMonitor (per channel)
//!                                          |
//!                                          +--BroadcasterInterface--> network
//!                                          +--FeeEstimator (claim fees)
//! ```

pub mod chain_monitor;
pub mod monitor;

use crate::error::{ChannelMonitorUpdateErr, MonitorUpdateError};
use crate::types::ChannelId;
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::{Script, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use chain_monitor::{ChainMonitor, FilesystemPersister, Persist};
pub use monitor::{ChannelMonitor, ChannelMonitorUpdate, ChannelMonitorUpdateStep, HTLCUpdate, MonitorEvent};

/// Lowest fee rate the network relays, in sat per 1000 weight units
pub const FEERATE_FLOOR_SATS_PER_KW: u32 = 253;

// ============ Fees & Broadcast ============

/// How urgently a transaction must confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmationTarget {
    /// Within a day or so
    Background,
    /// Within a few hours
    Normal,
    /// Next few blocks; used for claims racing a timelock
    HighPriority,
}

/// Fee rate source
pub trait FeeEstimator: Send + Sync {
    /// Estimated fee rate in sat per 1000 weight units
    fn get_est_sat_per_1000_weight(&self, confirmation_target: ConfirmationTarget) -> u32;
}

/// Query `estimator`, never going below [`FEERATE_FLOOR_SATS_PER_KW`]
pub(crate) fn floored_feerate(estimator: &dyn FeeEstimator, target: ConfirmationTarget) -> u32 {
    estimator
        .get_est_sat_per_1000_weight(target)
        .max(FEERATE_FLOOR_SATS_PER_KW)
}

/// Transaction broadcaster. Fire and forget; dropped broadcasts are
/// retried by the monitor on later blocks.
pub trait BroadcasterInterface: Send + Sync {
    /// Send `tx` to the network
    fn broadcast_transaction(&self, tx: &Transaction);
}

// ============ Chain Access ============

/// Why [`Access::get_utxo`] could not return an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    /// We don't know about the requested chain
    #[error("unknown chain")]
    UnknownChain,
    /// The transaction or output is unknown or already spent
    #[error("unknown or spent transaction output")]
    UnknownTx,
}

/// UTXO lookup used to validate channel announcements
pub trait Access: Send + Sync {
    /// The funding output a short channel id points at
    ///
    /// # Errors
    ///
    /// [`AccessError::UnknownChain`] for a foreign genesis hash,
    /// [`AccessError::UnknownTx`] when the output is unknown or spent.
    fn get_utxo(&self, genesis_hash: &ChainHash, short_channel_id: u64) -> Result<TxOut, AccessError>;
}

/// Lets a light client learn which transactions and outputs the monitors
/// care about
pub trait Filter: Send + Sync {
    /// Watch for `txid`, whose output pays `script_pubkey`
    fn register_tx(&self, txid: &Txid, script_pubkey: &Script);
    /// Watch for spends of `outpoint`
    fn register_output(&self, outpoint: &OutPoint, script_pubkey: &Script);
}

/// The channel manager's view of the monitor set
pub trait Watch: Send + Sync {
    /// Start watching a newly funded channel
    ///
    /// # Errors
    ///
    /// Fails if the monitor cannot be persisted.
    fn watch_channel(&self, funding_txo: OutPoint, monitor: ChannelMonitor) -> Result<(), ChannelMonitorUpdateErr>;

    /// Apply and persist an update to an existing monitor
    ///
    /// # Errors
    ///
    /// Fails if the update cannot be applied or persisted.
    fn update_channel(&self, funding_txo: OutPoint, update: ChannelMonitorUpdate) -> Result<(), ChannelMonitorUpdateErr>;

    /// Take every event the monitors produced since the last call
    fn release_pending_monitor_events(&self) -> Vec<MonitorEvent>;
}

// ============ Outpoints ============

/// A funding outpoint. The index is 16 bits, as channel ids require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Funding transaction id
    pub txid: Txid,
    /// Output index
    pub index: u16,
}

impl OutPoint {
    /// The channel id this funding outpoint maps to
    #[must_use]
    pub fn to_channel_id(&self) -> ChannelId {
        ChannelId::from_funding_outpoint(&self.txid, self.index)
    }

    /// As a `bitcoin` outpoint
    #[must_use]
    pub fn into_bitcoin_outpoint(self) -> bitcoin::OutPoint {
        bitcoin::OutPoint {
            txid: self.txid,
            vout: u32::from(self.index),
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl From<MonitorUpdateError> for ChannelMonitorUpdateErr {
    fn from(_: MonitorUpdateError) -> Self {
        Self::PermanentFailure
    }
}
