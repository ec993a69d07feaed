//! Gossip validation in front of the [`NetworkGraph`].
//!
//! Every announcement and update is checked before it touches the graph:
//!
//! | Check | Failure |
//! |-------|---------|
//! | signatures over the double-SHA256 of the signed content | close connection |
//! | chain hash | ignore |
//! | funding output on chain (when a UTXO source is present) | ignore |
//! | timestamp newer than the stored one | ignore |

use crate::graph::NetworkGraph;
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thunder_core::LightningError;
use thunder_core::chain::{Access, AccessError};
use thunder_core::commitment::{make_funding_redeemscript, p2wsh_script};
use thunder_core::msgs::{
    ChannelAnnouncement, ChannelUpdate, HTLCFailChannelUpdate, NodeAnnouncement, QueryChannelRange,
    ReplyChannelRange, RoutingMessageHandler,
};
use thunder_core::types::scid_block_height;
use tracing::{debug, trace, warn};

static SECP: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

/// Announcements with more unknown trailing data than this are accepted
/// but not relayed
const MAX_EXCESS_BYTES_FOR_RELAY: usize = 1024;

/// Ask this many peers for a full gossip dump, then stop
const FULL_SYNCS_TO_REQUEST: usize = 5;

/// Short channel ids per `reply_channel_range`, keeping each under the
/// 65535-byte message limit
const MAX_SCIDS_PER_REPLY: usize = 8000;

fn verify(msg: &Message, sig: &Signature, key: &PublicKey) -> Result<(), LightningError> {
    SECP.verify_ecdsa(msg, sig, key).map_err(|_| {
        LightningError::close_connection(format!("invalid signature from remote node {key}"))
    })
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Validates gossip and keeps the resulting [`NetworkGraph`]
pub struct NetGraphMsgHandler {
    genesis_hash: ChainHash,
    chain_access: Option<Arc<dyn Access>>,
    network_graph: RwLock<NetworkGraph>,
    full_syncs_requested: AtomicUsize,
}

impl NetGraphMsgHandler {
    /// Start from an empty graph. Without `chain_access` channel
    /// announcements are taken on their signatures alone.
    #[must_use]
    pub fn new(genesis_hash: ChainHash, chain_access: Option<Arc<dyn Access>>) -> Self {
        Self::from_net_graph(chain_access, NetworkGraph::new(genesis_hash))
    }

    /// Continue from a previously built graph
    #[must_use]
    pub fn from_net_graph(chain_access: Option<Arc<dyn Access>>, network_graph: NetworkGraph) -> Self {
        Self {
            genesis_hash: network_graph.genesis_hash(),
            chain_access,
            network_graph: RwLock::new(network_graph),
            full_syncs_requested: AtomicUsize::new(0),
        }
    }

    /// Shared access for route finding. Gossip handling blocks while the
    /// guard is held.
    pub fn read_locked_graph(&self) -> RwLockReadGuard<'_, NetworkGraph> {
        self.network_graph.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_graph(&self) -> RwLockWriteGuard<'_, NetworkGraph> {
        self.network_graph.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prune channels without an update in two weeks. Call about once a
    /// day.
    pub fn remove_stale_channels(&self) -> usize {
        self.write_graph().remove_stale_channels(unix_time())
    }

    fn check_chain_hash(&self, chain_hash: &ChainHash) -> Result<(), LightningError> {
        if *chain_hash == self.genesis_hash {
            Ok(())
        } else {
            Err(LightningError::ignore("gossip for a different chain"))
        }
    }

    /// Look the funding output up and check it pays the announced 2-of-2
    fn check_funding_output(&self, msg: &ChannelAnnouncement, access: &dyn Access) -> Result<u64, LightningError> {
        let contents = &msg.contents;
        match access.get_utxo(&contents.chain_hash, contents.short_channel_id) {
            Ok(txout) => {
                let expected = p2wsh_script(&make_funding_redeemscript(&contents.bitcoin_key_1, &contents.bitcoin_key_2));
                if txout.script_pubkey != expected {
                    debug!(scid = contents.short_channel_id, "funding script mismatch");
                    return Err(LightningError::ignore("channel announcement keys don't match on-chain script"));
                }
                Ok(txout.value.to_sat())
            }
            Err(AccessError::UnknownChain) => Err(LightningError::ignore(format!(
                "channel announced on an unknown chain ({})",
                contents.chain_hash
            ))),
            Err(AccessError::UnknownTx) => Err(LightningError::ignore(
                "channel announced without corresponding UTXO entry",
            )),
        }
    }
}

impl RoutingMessageHandler for NetGraphMsgHandler {
    fn handle_node_announcement(&self, msg: &NodeAnnouncement) -> Result<bool, LightningError> {
        verify(&msg.contents.signing_message(), &msg.signature, &msg.contents.node_id)?;
        self.write_graph()
            .update_node_from_unsigned_announcement(&msg.contents, Some(msg))?;
        Ok(msg.contents.excess_data.len() + msg.contents.excess_address_data.len() <= MAX_EXCESS_BYTES_FOR_RELAY)
    }

    fn handle_channel_announcement(&self, msg: &ChannelAnnouncement) -> Result<bool, LightningError> {
        let contents = &msg.contents;
        self.check_chain_hash(&contents.chain_hash)?;
        let digest = contents.signing_message();
        verify(&digest, &msg.node_signature_1, &contents.node_id_1)?;
        verify(&digest, &msg.node_signature_2, &contents.node_id_2)?;
        verify(&digest, &msg.bitcoin_signature_1, &contents.bitcoin_key_1)?;
        verify(&digest, &msg.bitcoin_signature_2, &contents.bitcoin_key_2)?;

        let (capacity_sats, checked) = match &self.chain_access {
            Some(access) => (Some(self.check_funding_output(msg, access.as_ref())?), true),
            None => (None, false),
        };
        self.write_graph().update_channel_from_unsigned_announcement(
            contents,
            Some(msg),
            capacity_sats,
            checked,
            unix_time(),
        )?;
        Ok(contents.excess_data.len() <= MAX_EXCESS_BYTES_FOR_RELAY)
    }

    fn handle_channel_update(&self, msg: &ChannelUpdate) -> Result<bool, LightningError> {
        let contents = &msg.contents;
        self.check_chain_hash(&contents.chain_hash)?;
        let mut graph = self.write_graph();
        let channel = graph
            .channels()
            .get(&contents.short_channel_id)
            .ok_or_else(|| LightningError::ignore("couldn't find channel for update"))?;
        let origin = if contents.channel_flags & 1 == 0 {
            channel.node_one
        } else {
            channel.node_two
        };
        verify(&contents.signing_message(), &msg.signature, &origin)?;
        graph.update_channel_unsigned(contents, Some(msg))?;
        Ok(contents.excess_data.len() <= MAX_EXCESS_BYTES_FOR_RELAY)
    }

    fn handle_htlc_fail_channel_update(&self, update: &HTLCFailChannelUpdate) {
        match update {
            HTLCFailChannelUpdate::ChannelUpdateMessage { msg } => {
                if let Err(e) = self.handle_channel_update(msg) {
                    trace!(scid = msg.contents.short_channel_id, error = %e, "failure update not applied");
                }
            }
            HTLCFailChannelUpdate::ChannelClosed {
                short_channel_id,
                is_permanent,
            } => {
                debug!(scid = short_channel_id, is_permanent, "channel failed a payment");
                self.write_graph().close_channel(*short_channel_id, *is_permanent);
            }
            HTLCFailChannelUpdate::NodeFailure { node_id, is_permanent } => {
                debug!(node = %node_id, is_permanent, "node failed a payment");
                self.write_graph().fail_node(node_id, *is_permanent);
            }
        }
    }

    fn get_next_channel_announcements(
        &self,
        starting_point: u64,
        batch_amount: u8,
    ) -> Vec<(ChannelAnnouncement, Option<ChannelUpdate>, Option<ChannelUpdate>)> {
        let graph = self.read_locked_graph();
        graph
            .channels()
            .range(starting_point..)
            .filter_map(|(_, channel)| {
                let announcement = channel.announcement_message.clone()?;
                let update = |dir: &Option<crate::graph::DirectionalChannelInfo>| {
                    dir.as_ref().and_then(|d| d.last_update_message.clone())
                };
                Some((announcement, update(&channel.one_to_two), update(&channel.two_to_one)))
            })
            .take(usize::from(batch_amount))
            .collect()
    }

    fn get_next_node_announcements(&self, starting_point: Option<&PublicKey>, batch_amount: u8) -> Vec<NodeAnnouncement> {
        let graph = self.read_locked_graph();
        let lower = starting_point.map_or(Bound::Unbounded, Bound::Excluded);
        graph
            .nodes()
            .range::<PublicKey, _>((lower, Bound::Unbounded))
            .filter_map(|(_, node)| node.announcement_info.as_ref()?.announcement_message.clone())
            .take(usize::from(batch_amount))
            .collect()
    }

    fn should_request_full_sync(&self, node_id: &PublicKey) -> bool {
        let requested = self
            .full_syncs_requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < FULL_SYNCS_TO_REQUEST).then_some(n + 1)
            })
            .is_ok();
        if requested {
            debug!(peer = %node_id, "requesting full gossip sync");
        }
        requested
    }

    fn handle_query_channel_range(
        &self,
        their_node_id: &PublicKey,
        msg: &QueryChannelRange,
    ) -> Result<Vec<ReplyChannelRange>, LightningError> {
        if msg.chain_hash != self.genesis_hash {
            warn!(peer = %their_node_id, "query_channel_range for a different chain");
            return Err(LightningError::ignore("query_channel_range for a different chain"));
        }
        let end = u64::from(msg.first_blocknum) + u64::from(msg.number_of_blocks);
        let scids: Vec<u64> = self
            .read_locked_graph()
            .channels()
            .keys()
            .copied()
            .filter(|scid| {
                let height = u64::from(scid_block_height(*scid));
                height >= u64::from(msg.first_blocknum) && height < end
            })
            .collect();
        trace!(peer = %their_node_id, channels = scids.len(), "answering query_channel_range");

        let reply = |short_channel_ids: Vec<u64>, sync_complete| ReplyChannelRange {
            chain_hash: msg.chain_hash,
            first_blocknum: msg.first_blocknum,
            number_of_blocks: msg.number_of_blocks,
            sync_complete,
            short_channel_ids,
        };
        if scids.is_empty() {
            return Ok(vec![reply(Vec::new(), true)]);
        }
        let chunks = scids.chunks(MAX_SCIDS_PER_REPLY).count();
        Ok(scids
            .chunks(MAX_SCIDS_PER_REPLY)
            .enumerate()
            .map(|(i, chunk)| reply(chunk.to_vec(), i + 1 == chunks))
            .collect())
    }
}
