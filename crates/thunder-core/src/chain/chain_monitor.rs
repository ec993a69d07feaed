//! The set of channel monitors and their persistence.
//!
//! [`ChainMonitor`] owns one [`ChannelMonitor`] per funding outpoint,
//! persists every change through a [`Persist`] implementation before
//! reporting success, and fans connected/disconnected blocks out to all
//! monitors.

use crate::chain::monitor::{ChannelMonitor, ChannelMonitorUpdate, MonitorEvent};
use crate::chain::{BroadcasterInterface, FeeEstimator, Filter, OutPoint, Watch};
use crate::error::ChannelMonitorUpdateErr;
use crate::events::{Event, EventsProvider};
use bitcoin::block::Header;
use bitcoin::{Transaction, Txid};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Durable storage for channel monitors.
///
/// Returning [`ChannelMonitorUpdateErr::TemporaryFailure`] freezes the
/// channel until the embedder calls
/// `ChannelManager::channel_monitor_updated`;
/// [`ChannelMonitorUpdateErr::PermanentFailure`] force-closes it.
pub trait Persist: Send + Sync {
    /// Store a monitor for a newly funded channel
    ///
    /// # Errors
    ///
    /// See the trait documentation.
    fn persist_new_channel(&self, funding_txo: OutPoint, monitor: &ChannelMonitor) -> Result<(), ChannelMonitorUpdateErr>;

    /// Store `update`, already applied to `monitor`
    ///
    /// # Errors
    ///
    /// See the trait documentation.
    fn update_persisted_channel(
        &self,
        funding_txo: OutPoint,
        update: &ChannelMonitorUpdate,
        monitor: &ChannelMonitor,
    ) -> Result<(), ChannelMonitorUpdateErr>;
}

// ============ Filesystem Persister ============

/// Writes each monitor to `<dir>/<funding txid>_<index>` in full on every
/// update, through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FilesystemPersister {
    path_to_channel_data: PathBuf,
}

impl FilesystemPersister {
    /// Persister rooted at `path_to_channel_data`, created on first write
    #[must_use]
    pub fn new(path_to_channel_data: impl Into<PathBuf>) -> Self {
        Self {
            path_to_channel_data: path_to_channel_data.into(),
        }
    }

    /// Directory monitors are stored in
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.path_to_channel_data
    }

    fn monitor_path(&self, funding_txo: OutPoint) -> PathBuf {
        self.path_to_channel_data
            .join(format!("{}_{}", funding_txo.txid, funding_txo.index))
    }

    fn write_monitor(&self, funding_txo: OutPoint, monitor: &ChannelMonitor) -> io::Result<()> {
        fs::create_dir_all(&self.path_to_channel_data)?;
        let data = monitor
            .write_to_vec()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let path = self.monitor_path(funding_txo);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        debug!(%funding_txo, path = %path.display(), "monitor persisted");
        Ok(())
    }

    /// Load every stored monitor, keyed by funding outpoint
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read, a file name is
    /// not a funding outpoint, or a monitor fails to deserialize.
    pub fn read_channel_monitors(&self) -> io::Result<Vec<(OutPoint, ChannelMonitor)>> {
        if !self.path_to_channel_data.exists() {
            return Ok(Vec::new());
        }
        let mut monitors = Vec::new();
        for entry in fs::read_dir(&self.path_to_channel_data)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let funding_txo = parse_monitor_file_name(name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad monitor file name {name}")))?;
            let monitor = ChannelMonitor::read_from_slice(&fs::read(&path)?)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if monitor.get_funding_txo().0 != funding_txo {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("monitor in {name} is for a different channel"),
                ));
            }
            monitors.push((funding_txo, monitor));
        }
        Ok(monitors)
    }
}

fn parse_monitor_file_name(name: &str) -> Option<OutPoint> {
    let (txid, index) = name.split_once('_')?;
    Some(OutPoint {
        txid: txid.parse::<Txid>().ok()?,
        index: index.parse().ok()?,
    })
}

impl Persist for FilesystemPersister {
    fn persist_new_channel(&self, funding_txo: OutPoint, monitor: &ChannelMonitor) -> Result<(), ChannelMonitorUpdateErr> {
        self.write_monitor(funding_txo, monitor).map_err(|e| {
            error!(%funding_txo, error = %e, "failed to persist new monitor");
            ChannelMonitorUpdateErr::PermanentFailure
        })
    }

    fn update_persisted_channel(
        &self,
        funding_txo: OutPoint,
        _update: &ChannelMonitorUpdate,
        monitor: &ChannelMonitor,
    ) -> Result<(), ChannelMonitorUpdateErr> {
        self.write_monitor(funding_txo, monitor).map_err(|e| {
            warn!(%funding_txo, error = %e, "failed to persist monitor update");
            ChannelMonitorUpdateErr::TemporaryFailure
        })
    }
}

// ============ Chain Monitor ============

/// Every channel monitor this node runs
pub struct ChainMonitor {
    monitors: Mutex<HashMap<OutPoint, ChannelMonitor>>,
    chain_source: Option<Arc<dyn Filter>>,
    broadcaster: Arc<dyn BroadcasterInterface>,
    fee_estimator: Arc<dyn FeeEstimator>,
    persister: Arc<dyn Persist>,
}

impl ChainMonitor {
    /// Create an empty monitor set
    #[must_use]
    pub fn new(
        chain_source: Option<Arc<dyn Filter>>,
        broadcaster: Arc<dyn BroadcasterInterface>,
        fee_estimator: Arc<dyn FeeEstimator>,
        persister: Arc<dyn Persist>,
    ) -> Self {
        Self {
            monitors: Mutex::new(HashMap::new()),
            chain_source,
            broadcaster,
            fee_estimator,
            persister,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OutPoint, ChannelMonitor>> {
        self.monitors.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Hand a block to every monitor
    pub fn block_connected(&self, header: &Header, txdata: &[(usize, &Transaction)], height: u32) {
        let mut monitors = self.lock();
        for monitor in monitors.values_mut() {
            monitor.block_connected(
                header,
                txdata,
                height,
                self.broadcaster.as_ref(),
                self.fee_estimator.as_ref(),
            );
        }
    }

    /// Undo the block at `height` in every monitor
    pub fn block_disconnected(&self, header: &Header, height: u32) {
        for monitor in self.lock().values_mut() {
            monitor.block_disconnected(header, height);
        }
    }

    /// Funding outpoints of every watched channel
    #[must_use]
    pub fn list_monitors(&self) -> Vec<OutPoint> {
        let mut outpoints: Vec<_> = self.lock().keys().copied().collect();
        outpoints.sort();
        outpoints
    }

    /// Latest update id applied to the monitor for `funding_txo`
    #[must_use]
    pub fn latest_update_id(&self, funding_txo: &OutPoint) -> Option<u64> {
        self.lock().get(funding_txo).map(ChannelMonitor::get_latest_update_id)
    }

    /// Signed commitment and HTLC transactions for a channel, for manual
    /// recovery. The monitor stops accepting newer commitments afterwards.
    pub fn get_latest_holder_commitment_txn(&self, funding_txo: &OutPoint) -> Vec<Transaction> {
        self.lock()
            .get_mut(funding_txo)
            .map(ChannelMonitor::get_latest_holder_commitment_txn)
            .unwrap_or_default()
    }

    fn register_with_filter(&self, funding_txo: OutPoint, monitor: &ChannelMonitor) {
        if let Some(filter) = &self.chain_source {
            let (outpoint, script) = monitor.get_funding_txo();
            filter.register_tx(&funding_txo.txid, script);
            filter.register_output(&outpoint, script);
        }
    }
}

impl Watch for ChainMonitor {
    fn watch_channel(&self, funding_txo: OutPoint, monitor: ChannelMonitor) -> Result<(), ChannelMonitorUpdateErr> {
        let mut monitors = self.lock();
        if monitors.contains_key(&funding_txo) {
            error!(%funding_txo, "refusing to replace an existing monitor");
            return Err(ChannelMonitorUpdateErr::PermanentFailure);
        }
        let persisted = self.persister.persist_new_channel(funding_txo, &monitor);
        if persisted == Err(ChannelMonitorUpdateErr::PermanentFailure) {
            return persisted;
        }
        // A temporarily failed persist still watches the chain
        self.register_with_filter(funding_txo, &monitor);
        info!(%funding_txo, "watching new channel");
        monitors.insert(funding_txo, monitor);
        persisted
    }

    fn update_channel(&self, funding_txo: OutPoint, update: ChannelMonitorUpdate) -> Result<(), ChannelMonitorUpdateErr> {
        let mut monitors = self.lock();
        let Some(monitor) = monitors.get_mut(&funding_txo) else {
            error!(%funding_txo, "update for unknown channel");
            return Err(ChannelMonitorUpdateErr::PermanentFailure);
        };
        debug!(%funding_txo, update_id = update.update_id, "applying monitor update");
        let applied = monitor.update_monitor(&update, self.broadcaster.as_ref(), self.fee_estimator.as_ref());
        if let Err(e) = &applied {
            error!(%funding_txo, error = %e, "monitor rejected update");
        }
        // Persist even a rejected update: the monitor may have broadcast
        self.persister.update_persisted_channel(funding_txo, &update, monitor)?;
        if let (Some(filter), Ok(())) = (&self.chain_source, &applied) {
            let script = monitor.get_funding_txo().1.to_owned();
            for txid in monitor.counterparty_commitment_txids() {
                filter.register_tx(txid, &script);
            }
        }
        applied.map_err(Into::into)
    }

    fn release_pending_monitor_events(&self) -> Vec<MonitorEvent> {
        self.lock()
            .values_mut()
            .flat_map(ChannelMonitor::get_and_clear_pending_monitor_events)
            .collect()
    }
}

impl EventsProvider for ChainMonitor {
    fn get_and_clear_pending_events(&self) -> Vec<Event> {
        self.lock()
            .values_mut()
            .flat_map(ChannelMonitor::get_and_clear_pending_events)
            .collect()
    }
}
