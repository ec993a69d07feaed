//! Several nodes wired together through an in-memory message pump.
//!
//! Messages skip the wire: each node's `MessageSendEvent`s are handed
//! straight to the addressed node's channel manager, and gossip broadcasts
//! reach every node's routing handler.
//!
//! ```no_run
//! use thunder_integration_tests::fixtures::TestNetwork;
//!
//! let mut net = TestNetwork::new(3);
//! let (_, scid_ab) = net.open_channel(0, 1, 100_000);
//! let (_, scid_bc) = net.open_channel(1, 2, 100_000);
//! net.announce_channels();
//! ```

use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, BlockHash, CompactTarget, Network, Transaction, TxMerkleNode, TxOut, absolute::LockTime};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thunder_core::chain::chain_monitor::{ChainMonitor, FilesystemPersister, Persist};
use thunder_core::chain::monitor::{ChannelMonitor, ChannelMonitorUpdate};
use thunder_core::chain::{BroadcasterInterface, ConfirmationTarget, FeeEstimator, OutPoint};
use thunder_core::error::{ChannelMonitorUpdateErr, ErrorAction};
use thunder_core::events::{Event, EventsProvider, MessageSendEvent, MessageSendEventsProvider};
use thunder_core::features::InitFeatures;
use thunder_core::keys::{KeysInterface, KeysManager};
use thunder_core::msgs::{ChannelMessageHandler, ErrorMessage, RoutingMessageHandler};
use thunder_core::{ChannelManager, UserConfig};
use thunder_routing::NetGraphMsgHandler;

/// Height every node starts at
pub const START_HEIGHT: u32 = 100;

/// Blocks a channel needs before it is announced
const ANNOUNCEMENT_DEPTH: u32 = 6;

/// A block header whose hash is unique per height
pub fn header(height: u32) -> Header {
    Header {
        version: BlockVersion::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_600_000_000 + height,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: height,
    }
}

struct FixedFee;

impl FeeEstimator for FixedFee {
    fn get_est_sat_per_1000_weight(&self, _: ConfirmationTarget) -> u32 {
        253
    }
}

/// Keeps every broadcast transaction
#[derive(Default)]
pub struct TestBroadcaster {
    /// Broadcast so far
    pub txn: Mutex<Vec<Transaction>>,
}

impl BroadcasterInterface for TestBroadcaster {
    fn broadcast_transaction(&self, tx: &Transaction) {
        self.txn.lock().unwrap().push(tx.clone());
    }
}

/// Persister that can be told to fail. Writes through to disk when given
/// a directory.
#[derive(Default)]
pub struct TogglePersister {
    fail_with: Mutex<Option<ChannelMonitorUpdateErr>>,
    disk: Option<FilesystemPersister>,
}

impl TogglePersister {
    /// Persister that also writes monitors under `dir`
    pub fn on_disk(dir: &Path) -> Self {
        Self {
            fail_with: Mutex::new(None),
            disk: Some(FilesystemPersister::new(dir)),
        }
    }

    /// Make every following call fail with `err`, or succeed again on `None`
    pub fn set_failure(&self, err: Option<ChannelMonitorUpdateErr>) {
        *self.fail_with.lock().unwrap() = err;
    }

    fn result(&self) -> Result<(), ChannelMonitorUpdateErr> {
        self.fail_with.lock().unwrap().map_or(Ok(()), Err)
    }
}

impl Persist for TogglePersister {
    fn persist_new_channel(&self, funding_txo: OutPoint, monitor: &ChannelMonitor) -> Result<(), ChannelMonitorUpdateErr> {
        self.result()?;
        match &self.disk {
            Some(disk) => disk.persist_new_channel(funding_txo, monitor),
            None => Ok(()),
        }
    }

    fn update_persisted_channel(
        &self,
        funding_txo: OutPoint,
        update: &ChannelMonitorUpdate,
        monitor: &ChannelMonitor,
    ) -> Result<(), ChannelMonitorUpdateErr> {
        self.result()?;
        match &self.disk {
            Some(disk) => disk.update_persisted_channel(funding_txo, update, monitor),
            None => Ok(()),
        }
    }
}

/// One node of a [`TestNetwork`]
pub struct TestNode {
    /// Channel state
    pub manager: Arc<ChannelManager>,
    /// Monitors
    pub chain_monitor: Arc<ChainMonitor>,
    /// Gossip and graph
    pub router: Arc<NetGraphMsgHandler>,
    /// Broadcast sink
    pub broadcaster: Arc<TestBroadcaster>,
    /// Persistence, switchable to failing
    pub persister: Arc<TogglePersister>,
    /// Identity
    pub node_id: PublicKey,
    /// Identity secret, for building a peer manager
    pub node_secret: SecretKey,
}

impl TestNode {
    /// A node with a deterministic identity from `seed`
    pub fn new(seed: u8, persister: TogglePersister) -> Self {
        let broadcaster = Arc::new(TestBroadcaster::default());
        let fee_estimator = Arc::new(FixedFee);
        let persister = Arc::new(persister);
        let chain_monitor = Arc::new(ChainMonitor::new(
            None,
            broadcaster.clone(),
            fee_estimator.clone(),
            persister.clone(),
        ));
        let keys = KeysManager::new(&[seed; 32], Network::Testnet, 1_600_000_000, u32::from(seed)).unwrap();
        let node_secret = keys.get_node_secret();
        let manager = Arc::new(ChannelManager::new(
            Network::Testnet,
            fee_estimator,
            chain_monitor.clone(),
            broadcaster.clone(),
            Arc::new(keys),
            TestNetwork::config(),
            START_HEIGHT,
        ));
        let node_id = manager.get_our_node_id();
        Self {
            manager,
            chain_monitor,
            router: Arc::new(NetGraphMsgHandler::new(ChainHash::using_genesis_block(Network::Testnet), None)),
            broadcaster,
            persister,
            node_id,
            node_secret,
        }
    }

    /// Drain and return this node's events
    pub fn events(&self) -> Vec<Event> {
        let mut events = self.manager.get_and_clear_pending_events();
        events.extend(self.chain_monitor.get_and_clear_pending_events());
        events
    }

    /// Process pending forwards and return what that produced
    pub fn forward(&self) -> Vec<Event> {
        self.manager.process_pending_htlc_forwards();
        self.events()
    }
}

/// A set of nodes sharing one simulated chain
pub struct TestNetwork {
    /// The nodes, indexed as created
    pub nodes: Vec<TestNode>,
    /// Current chain tip
    pub height: u32,
    /// Error messages exchanged so far
    pub errors: Vec<ErrorMessage>,
}

impl TestNetwork {
    /// The policy every fixture node runs with: single-block funding depth
    /// and announced channels
    pub fn config() -> UserConfig {
        let mut config = UserConfig::default();
        config.own_channel_config.minimum_depth = 1;
        config.channel_options.announced_channel = true;
        config
    }

    /// `count` nodes with in-memory persistence
    pub fn new(count: u8) -> Self {
        Self::from_nodes((1..=count).map(|seed| TestNode::new(seed, TogglePersister::default())).collect())
    }

    /// A network over prebuilt nodes
    pub fn from_nodes(nodes: Vec<TestNode>) -> Self {
        Self {
            nodes,
            height: START_HEIGHT,
            errors: Vec::new(),
        }
    }

    fn manager_for(&self, node_id: &PublicKey) -> Option<&ChannelManager> {
        self.nodes.iter().find(|n| n.node_id == *node_id).map(|n| n.manager.as_ref())
    }

    fn deliver(&mut self, from: usize, event: MessageSendEvent) {
        let them = self.nodes[from].node_id;
        match event {
            MessageSendEvent::SendOpenChannel { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_open_channel(&them, InitFeatures::known(), &msg);
                }
            }
            MessageSendEvent::SendAcceptChannel { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_accept_channel(&them, InitFeatures::known(), &msg);
                }
            }
            MessageSendEvent::SendFundingCreated { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_funding_created(&them, &msg);
                }
            }
            MessageSendEvent::SendFundingSigned { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_funding_signed(&them, &msg);
                }
            }
            MessageSendEvent::SendFundingLocked { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_funding_locked(&them, &msg);
                }
            }
            MessageSendEvent::SendAnnouncementSignatures { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_announcement_signatures(&them, &msg);
                }
            }
            MessageSendEvent::UpdateHTLCs { node_id, updates } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    for msg in &updates.update_add_htlcs {
                        cm.handle_update_add_htlc(&them, msg);
                    }
                    for msg in &updates.update_fulfill_htlcs {
                        cm.handle_update_fulfill_htlc(&them, msg);
                    }
                    for msg in &updates.update_fail_htlcs {
                        cm.handle_update_fail_htlc(&them, msg);
                    }
                    for msg in &updates.update_fail_malformed_htlcs {
                        cm.handle_update_fail_malformed_htlc(&them, msg);
                    }
                    if let Some(msg) = &updates.update_fee {
                        cm.handle_update_fee(&them, msg);
                    }
                    cm.handle_commitment_signed(&them, &updates.commitment_signed);
                }
            }
            MessageSendEvent::SendRevokeAndACK { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_revoke_and_ack(&them, &msg);
                }
            }
            MessageSendEvent::SendClosingSigned { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_closing_signed(&them, &msg);
                }
            }
            MessageSendEvent::SendShutdown { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_shutdown(&them, &msg);
                }
            }
            MessageSendEvent::SendChannelReestablish { node_id, msg } => {
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_channel_reestablish(&them, &msg);
                }
            }
            MessageSendEvent::BroadcastChannelAnnouncement { msg, update_msg } => {
                for node in &self.nodes {
                    let _ = node.router.handle_channel_announcement(&msg);
                    let _ = node.router.handle_channel_update(&update_msg);
                }
            }
            MessageSendEvent::BroadcastNodeAnnouncement { msg } => {
                for node in &self.nodes {
                    let _ = node.router.handle_node_announcement(&msg);
                }
            }
            MessageSendEvent::BroadcastChannelUpdate { msg } => {
                for node in &self.nodes {
                    let _ = node.router.handle_channel_update(&msg);
                }
            }
            MessageSendEvent::PaymentFailureNetworkUpdate { update } => {
                self.nodes[from].router.handle_htlc_fail_channel_update(&update);
            }
            MessageSendEvent::HandleError {
                node_id,
                action: ErrorAction::SendErrorMessage { msg },
            } => {
                self.errors.push(msg.clone());
                if let Some(cm) = self.manager_for(&node_id) {
                    cm.handle_error(&them, &msg);
                }
            }
            MessageSendEvent::HandleError { .. } => {}
        }
    }

    /// Deliver messages between all nodes until everyone goes quiet
    ///
    /// # Panics
    ///
    /// Panics if the nodes keep talking for too long.
    pub fn pump(&mut self) {
        for _ in 0..200 {
            let pending: Vec<(usize, Vec<MessageSendEvent>)> = self
                .nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (i, n.manager.get_and_clear_pending_msg_events()))
                .collect();
            if pending.iter().all(|(_, events)| events.is_empty()) {
                return;
            }
            for (from, events) in pending {
                for event in events {
                    self.deliver(from, event);
                }
            }
        }
        panic!("message pump did not settle");
    }

    /// Mine a block holding `txn` and hand it to every node
    pub fn connect_block(&mut self, txn: &[&Transaction]) {
        self.height += 1;
        let block = header(self.height);
        let txdata: Vec<(usize, &Transaction)> = txn.iter().enumerate().map(|(i, tx)| (i + 1, *tx)).collect();
        for node in &self.nodes {
            node.manager.block_connected(&block, &txdata, self.height);
            node.chain_monitor.block_connected(&block, &txdata, self.height);
        }
    }

    /// Open, fund and lock a channel from node `a` to node `b`. Returns the
    /// funding outpoint and short channel id.
    ///
    /// # Panics
    ///
    /// Panics if any step of the open fails.
    pub fn open_channel(&mut self, a: usize, b: usize, value_sat: u64) -> (OutPoint, u64) {
        self.open_channel_with_push(a, b, value_sat, 0)
    }

    /// [`TestNetwork::open_channel`], handing `push_msat` to `b` at open
    ///
    /// # Panics
    ///
    /// Panics if any step of the open fails.
    pub fn open_channel_with_push(&mut self, a: usize, b: usize, value_sat: u64, push_msat: u64) -> (OutPoint, u64) {
        let their_id = self.nodes[b].node_id;
        self.nodes[a]
            .manager
            .create_channel(their_id, value_sat, push_msat, 42, None)
            .unwrap();
        self.pump();

        let events = self.nodes[a].events();
        let [
            Event::FundingGenerationReady {
                temporary_channel_id,
                channel_value_satoshis,
                output_script,
                ..
            },
        ] = events.as_slice()
        else {
            panic!("expected FundingGenerationReady, got {events:?}");
        };
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(*channel_value_satoshis),
                script_pubkey: output_script.clone(),
            }],
        };
        let funding_txo = OutPoint {
            txid: tx.compute_txid(),
            index: 0,
        };
        self.nodes[a]
            .manager
            .funding_transaction_generated(*temporary_channel_id, funding_txo)
            .unwrap();
        self.pump();
        assert!(
            self.nodes[a]
                .events()
                .iter()
                .any(|e| matches!(e, Event::FundingBroadcastSafe { .. }))
        );

        self.connect_block(&[&tx]);
        self.pump();
        let short_channel_id = self.nodes[a]
            .manager
            .list_usable_channels()
            .into_iter()
            .find(|c| c.channel_id == funding_txo.to_channel_id())
            .and_then(|c| c.short_channel_id)
            .expect("channel usable after one confirmation");
        (funding_txo, short_channel_id)
    }

    /// Mine until every open channel is deep enough to announce, then let
    /// the announcements propagate
    pub fn announce_channels(&mut self) {
        for _ in 1..ANNOUNCEMENT_DEPTH {
            self.connect_block(&[]);
            self.pump();
        }
    }

    /// Deliver queued messages and return every node's events
    pub fn settle(&mut self) -> Vec<Vec<Event>> {
        self.pump();
        self.nodes.iter().map(TestNode::events).collect()
    }
}
