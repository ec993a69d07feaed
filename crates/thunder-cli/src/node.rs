//! A node assembled from the THUNDER crates.

use anyhow::Context;
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Network, Transaction};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thunder_core::chain::chain_monitor::{ChainMonitor, FilesystemPersister};
use thunder_core::chain::{BroadcasterInterface, ConfirmationTarget, FeeEstimator, Watch};
use thunder_core::events::{Event, EventsProvider};
use thunder_core::keys::{KeysInterface, KeysManager};
use thunder_core::{ChannelManager, MessageHandler, UserConfig};
use thunder_crypto::random::random_32;
use thunder_routing::NetGraphMsgHandler;
use thunder_transport::TokioPeerManager;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Fee estimator reporting one configured rate for every target
#[derive(Debug)]
pub struct FixedFeeEstimator {
    sat_per_kw: AtomicU32,
}

impl FixedFeeEstimator {
    /// Estimator answering `sat_per_kw`
    #[must_use]
    pub fn new(sat_per_kw: u32) -> Self {
        Self {
            sat_per_kw: AtomicU32::new(sat_per_kw),
        }
    }
}

impl FeeEstimator for FixedFeeEstimator {
    fn get_est_sat_per_1000_weight(&self, _: ConfirmationTarget) -> u32 {
        self.sat_per_kw.load(Ordering::Relaxed)
    }
}

/// Records every broadcast. No chain backend is attached, so transactions
/// are logged and kept for inspection.
#[derive(Debug, Default)]
pub struct LoggingBroadcaster {
    txn: Mutex<Vec<Transaction>>,
}

impl LoggingBroadcaster {
    /// Everything broadcast since the last call
    pub fn take(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.txn.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl BroadcasterInterface for LoggingBroadcaster {
    fn broadcast_transaction(&self, tx: &Transaction) {
        info!(txid = %tx.compute_txid(), inputs = tx.input.len(), outputs = tx.output.len(), "broadcasting transaction");
        self.txn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx.clone());
    }
}

/// Everything one node runs
pub struct Node {
    /// Channel state
    pub channel_manager: Arc<ChannelManager>,
    /// On-chain watchers for every funded channel
    pub chain_monitor: Arc<ChainMonitor>,
    /// Gossip and the network graph
    pub router: Arc<NetGraphMsgHandler>,
    /// Connections
    pub peer_manager: Arc<TokioPeerManager>,
    /// Broadcast sink
    pub broadcaster: Arc<LoggingBroadcaster>,
    node_id: PublicKey,
}

impl Node {
    /// Wire a node together from its seed. Monitors already stored under
    /// `monitors_dir` are loaded back into the chain monitor.
    ///
    /// # Errors
    ///
    /// Fails if key derivation, randomness or loading stored monitors fails.
    pub fn new(
        seed: &[u8; 32],
        network: Network,
        config: UserConfig,
        sat_per_kw: u32,
        monitors_dir: &Path,
        current_height: u32,
    ) -> anyhow::Result<Self> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let keys_manager = Arc::new(KeysManager::new(seed, network, now.as_secs(), now.subsec_nanos())?);
        let node_secret = keys_manager.get_node_secret();
        let node_id = PublicKey::from_secret_key(&Secp256k1::signing_only(), &node_secret);

        let broadcaster = Arc::new(LoggingBroadcaster::default());
        let fee_estimator = Arc::new(FixedFeeEstimator::new(sat_per_kw));
        let persister = Arc::new(FilesystemPersister::new(monitors_dir));
        let stored = persister
            .read_channel_monitors()
            .with_context(|| format!("loading monitors from {}", monitors_dir.display()))?;
        let chain_monitor = Arc::new(ChainMonitor::new(None, broadcaster.clone(), fee_estimator.clone(), persister));
        for (funding_txo, monitor) in stored {
            if let Err(e) = chain_monitor.watch_channel(funding_txo, monitor) {
                warn!(%funding_txo, error = ?e, "could not resume stored monitor");
            } else {
                info!(%funding_txo, "resumed watching stored monitor");
            }
        }

        let channel_manager = Arc::new(ChannelManager::new(
            network,
            fee_estimator,
            chain_monitor.clone(),
            broadcaster.clone(),
            keys_manager,
            config,
            current_height,
        ));
        let router = Arc::new(NetGraphMsgHandler::new(ChainHash::using_genesis_block(network), None));
        let handler = MessageHandler {
            chan_handler: channel_manager.clone(),
            route_handler: router.clone(),
        };
        let peer_manager = Arc::new(TokioPeerManager::new(handler, node_secret, &random_32()?));

        Ok(Self {
            channel_manager,
            chain_monitor,
            router,
            peer_manager,
            broadcaster,
            node_id,
        })
    }

    /// Our node id
    #[must_use]
    pub fn node_id(&self) -> PublicKey {
        self.node_id
    }

    /// Drain channel manager and monitor events. HTLCs waiting to be
    /// forwarded are processed on the spot; everything is returned to the
    /// caller as well.
    pub fn handle_events(&self) -> Vec<Event> {
        let mut events = self.channel_manager.get_and_clear_pending_events();
        events.extend(self.chain_monitor.get_and_clear_pending_events());
        for event in &events {
            match event {
                Event::PendingHTLCsForwardable { .. } => self.channel_manager.process_pending_htlc_forwards(),
                Event::FundingGenerationReady {
                    temporary_channel_id,
                    channel_value_satoshis,
                    ..
                } => warn!(
                    channel = %temporary_channel_id,
                    value = channel_value_satoshis,
                    "funding transaction needed but no wallet is attached"
                ),
                other => debug!(event = ?other, "event"),
            }
        }
        if !events.is_empty() {
            self.peer_manager.process_events();
        }
        events
    }
}

/// The node id a seed produces
///
/// # Errors
///
/// Fails if key derivation fails.
pub fn derive_node_id(seed: &[u8; 32], network: Network) -> anyhow::Result<PublicKey> {
    let keys_manager = KeysManager::new(seed, network, 0, 0)?;
    Ok(PublicKey::from_secret_key(
        &Secp256k1::signing_only(),
        &keys_manager.get_node_secret(),
    ))
}

/// Read the node seed from `path`, creating one if `create` is set and
/// the file is missing
///
/// # Errors
///
/// Fails if the file cannot be read or written, or holds something other
/// than 32 hex-encoded bytes.
pub fn load_seed(path: &Path, create: bool) -> anyhow::Result<Zeroizing<[u8; 32]>> {
    if !path.exists() {
        if !create {
            anyhow::bail!("no seed at {} (run `thunder keygen` first)", path.display());
        }
        let seed = Zeroizing::new(random_32()?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(*seed))?;
        info!(path = %path.display(), "generated new node seed");
        return Ok(seed);
    }
    let contents = Zeroizing::new(fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?);
    let bytes = Zeroizing::new(hex::decode(contents.trim()).context("seed file is not hex")?);
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("seed must be 32 bytes, found {}", bytes.len()))?;
    Ok(Zeroizing::new(seed))
}
