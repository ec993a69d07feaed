//! Payment pathfinding over the [`NetworkGraph`].
//!
//! The search runs Dijkstra backwards from the payee, so the amount each
//! node must receive (payment plus every downstream fee) is known when its
//! incoming channels are considered. Candidates are ordered by
//! `(total fee, total CLTV delta, discovery order)`.

use crate::graph::{DirectionalChannelInfo, NetworkGraph};
use bitcoin::secp256k1::PublicKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thunder_core::LightningError;
use thunder_core::features::{ChannelFeatures, NodeFeatures};
use thunder_core::manager::ChannelDetails;
use thunder_core::route::{Route, RouteHint, RouteHop, RoutingFees};
use tracing::{debug, trace};

/// Longest path we will build
pub const MAX_PATH_LENGTH: usize = 20;

/// Most CLTV delta the intermediate hops may add up to
pub const MAX_TOTAL_CLTV_EXPIRY_DELTA: u32 = 1008;

/// Every bitcoin that will ever exist, in millisatoshi
const MAX_VALUE_MSAT: u64 = 21_000_000 * 100_000_000 * 1000;

/// A channel into a node as the search sees it
struct Edge<'a> {
    source: PublicKey,
    short_channel_id: u64,
    fees: RoutingFees,
    cltv_expiry_delta: u16,
    htlc_minimum_msat: u64,
    /// Largest amount the channel can carry
    max_msat: u64,
    channel_features: &'a ChannelFeatures,
}

/// Best known way from a node to the payee
#[derive(Clone)]
struct Candidate {
    /// Amount that must arrive at this node
    value_msat: u64,
    /// Sum of the CLTV deltas this node and those after it add
    total_cltv_delta: u32,
    path_length: usize,
    seq: u64,
    /// How this node forwards toward the payee. `None` for the payee.
    next: Option<NextHop>,
}

#[derive(Clone)]
struct NextHop {
    node: PublicKey,
    short_channel_id: u64,
    /// What this node charges to forward
    fee_msat: u64,
    /// What this node adds to the CLTV
    cltv_expiry_delta: u32,
    channel_features: ChannelFeatures,
}

fn direction_edge<'a>(
    source: PublicKey,
    short_channel_id: u64,
    dir: &DirectionalChannelInfo,
    capacity_sats: Option<u64>,
    channel_features: &'a ChannelFeatures,
) -> Option<Edge<'a>> {
    if !dir.enabled {
        return None;
    }
    let capacity_msat = capacity_sats.map_or(u64::MAX, |sats| sats.saturating_mul(1000));
    Some(Edge {
        source,
        short_channel_id,
        fees: dir.fees,
        cltv_expiry_delta: dir.cltv_expiry_delta,
        htlc_minimum_msat: dir.htlc_minimum_msat,
        max_msat: dir.htlc_maximum_msat.map_or(capacity_msat, |max| max.min(capacity_msat)),
        channel_features,
    })
}

/// Find the cheapest path from `our_node_id` to `payee` delivering
/// `final_value_msat` with `final_cltv` at the payee.
///
/// `first_hops`, usually [`thunder_core::ChannelManager::list_usable_channels`],
/// replaces the graph's view of our own channels. `last_hops` adds private
/// channels into the payee from its invoice.
///
/// # Errors
///
/// A [`LightningError`] with `IgnoreError` when the request is nonsensical
/// or no path exists.
pub fn get_route(
    our_node_id: &PublicKey,
    network: &NetworkGraph,
    payee: &PublicKey,
    first_hops: Option<&[ChannelDetails]>,
    last_hops: &[RouteHint],
    final_value_msat: u64,
    final_cltv: u32,
) -> Result<Route, LightningError> {
    if payee == our_node_id {
        return Err(LightningError::ignore("cannot generate a route to ourselves"));
    }
    if final_value_msat == 0 {
        return Err(LightningError::ignore("cannot send a payment of 0 msat"));
    }
    if final_value_msat > MAX_VALUE_MSAT {
        return Err(LightningError::ignore(
            "cannot generate a route of more value than all existing satoshis",
        ));
    }

    let empty_features = ChannelFeatures::empty();
    let mut best: HashMap<PublicKey, Candidate> = HashMap::new();
    let mut settled: HashSet<PublicKey> = HashSet::new();
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;

    best.insert(
        *payee,
        Candidate {
            value_msat: final_value_msat,
            total_cltv_delta: 0,
            path_length: 0,
            seq,
            next: None,
        },
    );
    heap.push(Reverse((0u64, 0u32, seq, *payee)));

    while let Some(Reverse((_, _, popped_seq, node))) = heap.pop() {
        let Some(current) = best.get(&node).cloned() else {
            continue;
        };
        if current.seq != popped_seq || !settled.insert(node) {
            continue;
        }
        if node == *our_node_id {
            debug!(fee_msat = current.value_msat - final_value_msat, hops = current.path_length, "found route");
            return Ok(build_route(network, first_hops, our_node_id, &best, final_value_msat, final_cltv));
        }

        let mut edges = Vec::new();
        if let Some(info) = network.nodes().get(&node) {
            for scid in &info.channels {
                let Some(channel) = network.channels().get(scid) else {
                    continue;
                };
                let Some(source) = channel.other_end(&node) else {
                    continue;
                };
                if *source == *our_node_id && first_hops.is_some() {
                    continue;
                }
                if let Some(dir) = channel.direction_from(source) {
                    edges.extend(direction_edge(*source, *scid, dir, channel.capacity_sats, &channel.features));
                }
            }
        }
        for details in first_hops.unwrap_or_default() {
            let Some(short_channel_id) = details.short_channel_id else {
                continue;
            };
            if details.remote_network_id != node {
                continue;
            }
            edges.push(Edge {
                source: *our_node_id,
                short_channel_id,
                fees: RoutingFees {
                    base_msat: 0,
                    proportional_millionths: 0,
                },
                cltv_expiry_delta: 0,
                htlc_minimum_msat: 0,
                max_msat: details.outbound_capacity_msat,
                channel_features: &empty_features,
            });
        }
        if node == *payee {
            for hint in last_hops {
                edges.push(Edge {
                    source: hint.src_node_id,
                    short_channel_id: hint.short_channel_id,
                    fees: hint.fees,
                    cltv_expiry_delta: hint.cltv_expiry_delta,
                    htlc_minimum_msat: hint.htlc_minimum_msat,
                    max_msat: u64::MAX,
                    channel_features: &empty_features,
                });
            }
        }

        for edge in edges {
            if settled.contains(&edge.source) {
                continue;
            }
            let amount = current.value_msat;
            if amount < edge.htlc_minimum_msat || amount > edge.max_msat {
                trace!(scid = edge.short_channel_id, amount, "channel can't carry amount");
                continue;
            }
            if current.path_length + 1 > MAX_PATH_LENGTH {
                continue;
            }
            let ours = edge.source == *our_node_id;
            let (fee_msat, cltv_expiry_delta) = if ours {
                (0, 0)
            } else {
                let Some(fee) = edge.fees.fee_for(amount) else {
                    continue;
                };
                (fee, u32::from(edge.cltv_expiry_delta))
            };
            let Some(value_msat) = amount.checked_add(fee_msat).filter(|v| *v <= MAX_VALUE_MSAT) else {
                continue;
            };
            let total_cltv_delta = current.total_cltv_delta + cltv_expiry_delta;
            if total_cltv_delta > MAX_TOTAL_CLTV_EXPIRY_DELTA {
                continue;
            }

            let key = (value_msat - final_value_msat, total_cltv_delta);
            let improves = best
                .get(&edge.source)
                .is_none_or(|existing| key < (existing.value_msat - final_value_msat, existing.total_cltv_delta));
            if !improves {
                continue;
            }
            seq += 1;
            best.insert(
                edge.source,
                Candidate {
                    value_msat,
                    total_cltv_delta,
                    path_length: current.path_length + 1,
                    seq,
                    next: Some(NextHop {
                        node,
                        short_channel_id: edge.short_channel_id,
                        fee_msat,
                        cltv_expiry_delta,
                        channel_features: edge.channel_features.clone(),
                    }),
                },
            );
            heap.push(Reverse((key.0, key.1, seq, edge.source)));
        }
    }

    Err(LightningError::ignore("failed to find a path to the given destination"))
}

/// Walk the `next` links from us to the payee. Each hop carries the fee and
/// CLTV delta of the node it reaches; the payee's hop carries the amount
/// and final CLTV instead.
fn build_route(
    network: &NetworkGraph,
    first_hops: Option<&[ChannelDetails]>,
    our_node_id: &PublicKey,
    best: &HashMap<PublicKey, Candidate>,
    final_value_msat: u64,
    final_cltv: u32,
) -> Route {
    let node_features = |node_id: &PublicKey| {
        let announced = network
            .nodes()
            .get(node_id)
            .and_then(|info| info.announcement_info.as_ref())
            .map(|info| info.features.clone());
        announced
            .or_else(|| {
                first_hops?
                    .iter()
                    .find(|details| details.remote_network_id == *node_id)
                    .map(|details| details.counterparty_features.to_node_features())
            })
            .unwrap_or_else(NodeFeatures::empty)
    };

    let mut path = Vec::new();
    let mut cursor = best.get(our_node_id).and_then(|c| c.next.clone());
    while let Some(link) = cursor {
        let next = best.get(&link.node).and_then(|c| c.next.clone());
        let (fee_msat, cltv_expiry_delta) = match &next {
            Some(onward) => (onward.fee_msat, onward.cltv_expiry_delta),
            None => (final_value_msat, final_cltv),
        };
        path.push(RouteHop {
            pubkey: link.node,
            node_features: node_features(&link.node),
            short_channel_id: link.short_channel_id,
            channel_features: link.channel_features,
            fee_msat,
            cltv_expiry_delta,
        });
        cursor = next;
    }
    Route { paths: vec![path] }
}
