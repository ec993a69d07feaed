//! The network graph: announced channels, their per-direction policies and
//! the nodes at their ends.
//!
//! Mutations here trust their input. Signature and on-chain checks happen
//! in [`crate::gossip::NetGraphMsgHandler`] before anything reaches the
//! graph.

use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::PublicKey;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thunder_core::LightningError;
use thunder_core::features::{ChannelFeatures, NodeFeatures};
use thunder_core::msgs::{
    ChannelAnnouncement, ChannelUpdate, NetAddress, NodeAnnouncement, UnsignedChannelAnnouncement,
    UnsignedChannelUpdate, UnsignedNodeAnnouncement,
};
use thunder_core::route::RoutingFees;
use tracing::{debug, trace};

/// A channel with no update this recent is pruned by
/// [`NetworkGraph::remove_stale_channels`]
pub const STALE_CHANNEL_AGE_LIMIT_SECS: u64 = 14 * 24 * 60 * 60;

/// One direction of a channel, from the latest `channel_update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionalChannelInfo {
    /// Timestamp of the update
    pub last_update: u32,
    /// False when the update carried the disable flag
    pub enabled: bool,
    /// CLTV delta the origin node requires to forward
    pub cltv_expiry_delta: u16,
    /// Smallest HTLC the origin node forwards
    pub htlc_minimum_msat: u64,
    /// Largest HTLC, if advertised
    pub htlc_maximum_msat: Option<u64>,
    /// Forwarding fees
    pub fees: RoutingFees,
    /// The update itself, for gossip sync. Absent when built from unsigned
    /// content.
    #[serde(skip)]
    pub last_update_message: Option<ChannelUpdate>,
}

/// Both directions of an announced channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    /// Channel features from the announcement
    #[serde(skip)]
    pub features: ChannelFeatures,
    /// Lexicographically lesser end
    pub node_one: PublicKey,
    /// Policy for payments from `node_one` to `node_two`
    pub one_to_two: Option<DirectionalChannelInfo>,
    /// The other end
    pub node_two: PublicKey,
    /// Policy for payments from `node_two` to `node_one`
    pub two_to_one: Option<DirectionalChannelInfo>,
    /// Funding output value, when the UTXO was checked
    pub capacity_sats: Option<u64>,
    /// When we learned of the channel, seconds since the epoch
    pub announcement_received_time: u64,
    /// The announcement itself, for gossip sync
    #[serde(skip)]
    pub announcement_message: Option<ChannelAnnouncement>,
}

impl ChannelInfo {
    /// Policy for payments leaving `source`, if `source` is an end of this
    /// channel and has published one
    #[must_use]
    pub fn direction_from(&self, source: &PublicKey) -> Option<&DirectionalChannelInfo> {
        if *source == self.node_one {
            self.one_to_two.as_ref()
        } else if *source == self.node_two {
            self.two_to_one.as_ref()
        } else {
            None
        }
    }

    /// The end that is not `node`
    #[must_use]
    pub fn other_end(&self, node: &PublicKey) -> Option<&PublicKey> {
        if *node == self.node_one {
            Some(&self.node_two)
        } else if *node == self.node_two {
            Some(&self.node_one)
        } else {
            None
        }
    }

    /// Timestamp of the most recent sign of life
    fn newest_activity(&self) -> u64 {
        [&self.one_to_two, &self.two_to_one]
            .into_iter()
            .flatten()
            .map(|dir| u64::from(dir.last_update))
            .max()
            .unwrap_or(self.announcement_received_time)
    }
}

/// What a node said about itself in its latest `node_announcement`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeAnnouncementInfo {
    /// Advertised features
    #[serde(skip)]
    pub features: NodeFeatures,
    /// Timestamp of the announcement
    pub last_update: u32,
    /// Display colour
    pub rgb: [u8; 3],
    /// Raw alias; may contain anything, print it sanitized
    #[serde(with = "hex_bytes")]
    pub alias: [u8; 32],
    /// Advertised addresses
    #[serde(skip)]
    pub addresses: Vec<NetAddress>,
    /// The announcement itself, for gossip sync
    #[serde(skip)]
    pub announcement_message: Option<NodeAnnouncement>,
}

/// A node with at least one announced channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Announced channels ending at this node
    pub channels: Vec<u64>,
    /// Set once the node announced itself
    pub announcement_info: Option<NodeAnnouncementInfo>,
}

mod hex_bytes {
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}

/// Channels and nodes known from gossip, keyed for ordered sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkGraph {
    #[serde(skip)]
    genesis_hash: ChainHash,
    channels: BTreeMap<u64, ChannelInfo>,
    nodes: BTreeMap<PublicKey, NodeInfo>,
}

impl NetworkGraph {
    /// An empty graph for the chain with this genesis hash
    #[must_use]
    pub fn new(genesis_hash: ChainHash) -> Self {
        Self {
            genesis_hash,
            channels: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// The chain this graph describes
    #[must_use]
    pub fn genesis_hash(&self) -> ChainHash {
        self.genesis_hash
    }

    /// All channels by short channel id
    #[must_use]
    pub fn channels(&self) -> &BTreeMap<u64, ChannelInfo> {
        &self.channels
    }

    /// All nodes by id
    #[must_use]
    pub fn nodes(&self) -> &BTreeMap<PublicKey, NodeInfo> {
        &self.nodes
    }

    /// Record a node's self-description. The node must already have a
    /// channel and the timestamp must be newer than what we have.
    ///
    /// # Errors
    ///
    /// [`LightningError`] with `IgnoreError` for unknown nodes or stale
    /// announcements.
    pub fn update_node_from_unsigned_announcement(
        &mut self,
        msg: &UnsignedNodeAnnouncement,
        full_msg: Option<&NodeAnnouncement>,
    ) -> Result<(), LightningError> {
        let node = self
            .nodes
            .get_mut(&msg.node_id)
            .ok_or_else(|| LightningError::ignore("no existing channels for node_announcement"))?;
        if let Some(info) = &node.announcement_info {
            if info.last_update >= msg.timestamp {
                return Err(LightningError::ignore("node_announcement older than last processed"));
            }
        }
        trace!(node = %msg.node_id, timestamp = msg.timestamp, "updated node announcement");
        node.announcement_info = Some(NodeAnnouncementInfo {
            features: msg.features.clone(),
            last_update: msg.timestamp,
            rgb: msg.rgb,
            alias: msg.alias,
            addresses: msg.addresses.clone(),
            announcement_message: full_msg.cloned(),
        });
        Ok(())
    }

    /// Add a channel. An already known id is only replaced when
    /// `replace_existing` is set, which callers do after checking the
    /// funding output on chain.
    ///
    /// # Errors
    ///
    /// [`LightningError`] with `IgnoreError` for a known channel.
    pub fn update_channel_from_unsigned_announcement(
        &mut self,
        msg: &UnsignedChannelAnnouncement,
        full_msg: Option<&ChannelAnnouncement>,
        capacity_sats: Option<u64>,
        replace_existing: bool,
        received_at: u64,
    ) -> Result<(), LightningError> {
        if self.channels.contains_key(&msg.short_channel_id) {
            if !replace_existing {
                return Err(LightningError::ignore("already have knowledge of channel"));
            }
            debug!(scid = msg.short_channel_id, "replacing channel after on-chain check");
            self.remove_channel(msg.short_channel_id);
        }

        self.channels.insert(
            msg.short_channel_id,
            ChannelInfo {
                features: msg.features.clone(),
                node_one: msg.node_id_1,
                one_to_two: None,
                node_two: msg.node_id_2,
                two_to_one: None,
                capacity_sats,
                announcement_received_time: received_at,
                announcement_message: full_msg.cloned(),
            },
        );
        for node_id in [msg.node_id_1, msg.node_id_2] {
            self.nodes
                .entry(node_id)
                .or_insert_with(|| NodeInfo {
                    channels: Vec::new(),
                    announcement_info: None,
                })
                .channels
                .push(msg.short_channel_id);
        }
        trace!(scid = msg.short_channel_id, capacity = ?capacity_sats, "added channel");
        Ok(())
    }

    /// Apply one direction's policy
    ///
    /// # Errors
    ///
    /// [`LightningError`] with `IgnoreError` for unknown channels, stale
    /// timestamps or a maximum above the channel capacity.
    pub fn update_channel_unsigned(
        &mut self,
        msg: &UnsignedChannelUpdate,
        full_msg: Option<&ChannelUpdate>,
    ) -> Result<(), LightningError> {
        let channel = self
            .channels
            .get_mut(&msg.short_channel_id)
            .ok_or_else(|| LightningError::ignore("couldn't find channel for update"))?;
        if let (Some(max), Some(capacity)) = (msg.htlc_maximum_msat, channel.capacity_sats) {
            if max > capacity.saturating_mul(1000) {
                return Err(LightningError::ignore("htlc_maximum_msat is larger than channel capacity"));
            }
        }
        let direction = if msg.channel_flags & 1 == 0 {
            &mut channel.one_to_two
        } else {
            &mut channel.two_to_one
        };
        if let Some(existing) = direction.as_ref() {
            if existing.last_update >= msg.timestamp {
                return Err(LightningError::ignore("channel_update older than last processed"));
            }
        }
        *direction = Some(DirectionalChannelInfo {
            last_update: msg.timestamp,
            enabled: msg.channel_flags & 2 == 0,
            cltv_expiry_delta: msg.cltv_expiry_delta,
            htlc_minimum_msat: msg.htlc_minimum_msat,
            htlc_maximum_msat: msg.htlc_maximum_msat,
            fees: RoutingFees {
                base_msat: msg.fee_base_msat,
                proportional_millionths: msg.fee_proportional_millionths,
            },
            last_update_message: full_msg.cloned(),
        });
        trace!(
            scid = msg.short_channel_id,
            direction = msg.channel_flags & 1,
            enabled = msg.channel_flags & 2 == 0,
            "updated channel policy"
        );
        Ok(())
    }

    /// A payment failure said the channel is unusable: forget it when
    /// permanent, otherwise disable both directions until fresh updates
    /// arrive
    pub fn close_channel(&mut self, short_channel_id: u64, is_permanent: bool) {
        if is_permanent {
            self.remove_channel(short_channel_id);
        } else if let Some(channel) = self.channels.get_mut(&short_channel_id) {
            for dir in [&mut channel.one_to_two, &mut channel.two_to_one].into_iter().flatten() {
                dir.enabled = false;
            }
        }
    }

    /// A payment failure blamed a node: forget it and its channels when
    /// permanent
    pub fn fail_node(&mut self, node_id: &PublicKey, is_permanent: bool) {
        if !is_permanent {
            return;
        }
        let Some(node) = self.nodes.get(node_id) else {
            return;
        };
        debug!(node = %node_id, channels = node.channels.len(), "removing failed node");
        for short_channel_id in node.channels.clone() {
            self.remove_channel(short_channel_id);
        }
        self.nodes.remove(node_id);
    }

    /// Drop channels whose newest update is more than two weeks older than
    /// `now` (seconds since the epoch), along with nodes left without
    /// channels. Returns how many channels were removed.
    pub fn remove_stale_channels(&mut self, now: u64) -> usize {
        let stale: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.newest_activity().saturating_add(STALE_CHANNEL_AGE_LIMIT_SECS) < now)
            .map(|(scid, _)| *scid)
            .collect();
        for short_channel_id in &stale {
            self.remove_channel(*short_channel_id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "pruned stale channels");
        }
        stale.len()
    }

    fn remove_channel(&mut self, short_channel_id: u64) {
        let Some(channel) = self.channels.remove(&short_channel_id) else {
            return;
        };
        for node_id in [channel.node_one, channel.node_two] {
            let Some(node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            node.channels.retain(|scid| *scid != short_channel_id);
            if node.channels.is_empty() {
                self.nodes.remove(&node_id);
            }
        }
    }
}

impl fmt::Display for NetworkGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network map")?;
        writeln!(f, "[Channels]")?;
        for (scid, channel) in &self.channels {
            writeln!(f, " {scid}: {} <-> {}", channel.node_one, channel.node_two)?;
        }
        writeln!(f, "[Nodes]")?;
        for (node_id, node) in &self.nodes {
            writeln!(f, " {node_id}: {} channels", node.channels.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    pub(crate) fn pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    pub(crate) fn unsigned_announcement(scid: u64, a: PublicKey, b: PublicKey) -> UnsignedChannelAnnouncement {
        let (node_id_1, node_id_2) = if a.serialize() < b.serialize() { (a, b) } else { (b, a) };
        UnsignedChannelAnnouncement {
            features: ChannelFeatures::empty(),
            chain_hash: ChainHash::TESTNET,
            short_channel_id: scid,
            node_id_1,
            node_id_2,
            bitcoin_key_1: pubkey(200),
            bitcoin_key_2: pubkey(201),
            excess_data: Vec::new(),
        }
    }

    pub(crate) fn unsigned_update(scid: u64, direction: u8, timestamp: u32) -> UnsignedChannelUpdate {
        UnsignedChannelUpdate {
            chain_hash: ChainHash::TESTNET,
            short_channel_id: scid,
            timestamp,
            message_flags: 0,
            channel_flags: direction,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 0,
            fee_base_msat: 1000,
            fee_proportional_millionths: 0,
            htlc_maximum_msat: None,
            excess_data: Vec::new(),
        }
    }

    fn graph_with_channel(scid: u64) -> NetworkGraph {
        let mut graph = NetworkGraph::new(ChainHash::TESTNET);
        graph
            .update_channel_from_unsigned_announcement(
                &unsigned_announcement(scid, pubkey(1), pubkey(2)),
                None,
                Some(100_000),
                false,
                1_000,
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_duplicate_channel_ignored_unless_replacing() {
        let mut graph = graph_with_channel(7);
        let msg = unsigned_announcement(7, pubkey(1), pubkey(2));
        assert!(graph.update_channel_from_unsigned_announcement(&msg, None, None, false, 0).is_err());
        graph.update_channel_from_unsigned_announcement(&msg, None, None, true, 0).unwrap();
        assert_eq!(graph.channels()[&7].capacity_sats, None);
        assert_eq!(graph.nodes()[&pubkey(1)].channels, vec![7]);
    }

    #[test]
    fn test_update_ordering_and_disable_flag() {
        let mut graph = graph_with_channel(7);
        graph.update_channel_unsigned(&unsigned_update(7, 0, 10), None).unwrap();
        assert!(graph.update_channel_unsigned(&unsigned_update(7, 0, 10), None).is_err());
        assert!(graph.update_channel_unsigned(&unsigned_update(7, 0, 9), None).is_err());

        graph.update_channel_unsigned(&unsigned_update(7, 2, 11), None).unwrap();
        let channel = &graph.channels()[&7];
        assert!(!channel.one_to_two.as_ref().unwrap().enabled);
        assert!(channel.two_to_one.is_none());

        assert!(graph.update_channel_unsigned(&unsigned_update(8, 0, 1), None).is_err());
    }

    #[test]
    fn test_update_maximum_above_capacity_ignored() {
        let mut graph = graph_with_channel(7);
        let mut update = unsigned_update(7, 1, 10);
        update.htlc_maximum_msat = Some(100_000_001);
        assert!(graph.update_channel_unsigned(&update, None).is_err());
        update.htlc_maximum_msat = Some(100_000_000);
        graph.update_channel_unsigned(&update, None).unwrap();
    }

    #[test]
    fn test_node_announcement_requires_channel() {
        let mut graph = graph_with_channel(7);
        let mut msg = UnsignedNodeAnnouncement {
            features: NodeFeatures::known(),
            timestamp: 5,
            node_id: pubkey(3),
            rgb: [0; 3],
            alias: [0; 32],
            addresses: Vec::new(),
            excess_address_data: Vec::new(),
            excess_data: Vec::new(),
        };
        assert!(graph.update_node_from_unsigned_announcement(&msg, None).is_err());
        msg.node_id = pubkey(1);
        graph.update_node_from_unsigned_announcement(&msg, None).unwrap();
        assert!(graph.update_node_from_unsigned_announcement(&msg, None).is_err());
    }

    #[test]
    fn test_permanent_failures_remove() {
        let mut graph = graph_with_channel(7);
        graph
            .update_channel_from_unsigned_announcement(
                &unsigned_announcement(8, pubkey(2), pubkey(3)),
                None,
                None,
                false,
                0,
            )
            .unwrap();
        graph.update_channel_unsigned(&unsigned_update(7, 0, 10), None).unwrap();

        graph.close_channel(7, false);
        assert!(!graph.channels()[&7].one_to_two.as_ref().unwrap().enabled);

        graph.fail_node(&pubkey(3), false);
        assert_eq!(graph.nodes().len(), 3);
        graph.fail_node(&pubkey(3), true);
        assert!(!graph.channels().contains_key(&8));
        assert_eq!(graph.nodes().len(), 2);

        graph.close_channel(7, true);
        assert!(graph.channels().is_empty());
        assert!(graph.nodes().is_empty());
    }

    #[test]
    fn test_remove_stale_channels() {
        let mut graph = graph_with_channel(7);
        graph
            .update_channel_from_unsigned_announcement(
                &unsigned_announcement(8, pubkey(1), pubkey(3)),
                None,
                None,
                false,
                1_000,
            )
            .unwrap();
        let fresh = 1_000 + STALE_CHANNEL_AGE_LIMIT_SECS;
        graph.update_channel_unsigned(&unsigned_update(8, 0, 900_000), None).unwrap();

        assert_eq!(graph.remove_stale_channels(fresh), 0);
        assert_eq!(graph.remove_stale_channels(fresh + 1), 1);
        assert!(graph.channels().contains_key(&8));
        assert!(!graph.nodes().contains_key(&pubkey(2)));
    }
}
