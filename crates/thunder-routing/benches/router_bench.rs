//! Pathfinding benchmarks over synthetic graphs.
//!
//! Run with: `cargo bench -p thunder-routing router`

use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use thunder_core::features::ChannelFeatures;
use thunder_core::msgs::{UnsignedChannelAnnouncement, UnsignedChannelUpdate};
use thunder_routing::{NetworkGraph, get_route};

fn node_ids(count: usize) -> Vec<PublicKey> {
    let secp = Secp256k1::signing_only();
    (1..=count)
        .map(|i| {
            let mut bytes = [0u8; 32];
            bytes[24..].copy_from_slice(&(i as u64).to_be_bytes());
            PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&bytes).unwrap())
        })
        .collect()
}

/// A ring with chords, so most pairs are a handful of hops apart and
/// there are many equal-length alternatives
fn build_graph(nodes: &[PublicKey]) -> NetworkGraph {
    let mut graph = NetworkGraph::new(ChainHash::TESTNET);
    let mut scid = 0u64;
    for i in 0..nodes.len() {
        for stride in [1, 7, 31] {
            let j = (i + stride) % nodes.len();
            scid += 1;
            let (a, b) = (nodes[i], nodes[j]);
            let (node_id_1, node_id_2) = if a.serialize() < b.serialize() { (a, b) } else { (b, a) };
            let announcement = UnsignedChannelAnnouncement {
                features: ChannelFeatures::empty(),
                chain_hash: ChainHash::TESTNET,
                short_channel_id: scid,
                node_id_1,
                node_id_2,
                bitcoin_key_1: node_id_1,
                bitcoin_key_2: node_id_2,
                excess_data: Vec::new(),
            };
            graph
                .update_channel_from_unsigned_announcement(&announcement, None, Some(1_000_000), false, 0)
                .unwrap();
            for direction in 0..2u8 {
                let update = UnsignedChannelUpdate {
                    chain_hash: ChainHash::TESTNET,
                    short_channel_id: scid,
                    timestamp: 1,
                    message_flags: 0,
                    channel_flags: direction,
                    cltv_expiry_delta: 40,
                    htlc_minimum_msat: 0,
                    fee_base_msat: 1000 + (scid % 13) as u32 * 100,
                    fee_proportional_millionths: (scid % 5) as u32 * 50,
                    htlc_maximum_msat: None,
                    excess_data: Vec::new(),
                };
                graph.update_channel_unsigned(&update, None).unwrap();
            }
        }
    }
    graph
}

fn bench_get_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_route");
    for size in [100usize, 1000] {
        let nodes = node_ids(size);
        let graph = build_graph(&nodes);
        let payee = nodes[size / 2];
        group.bench_with_input(BenchmarkId::from_parameter(size), &graph, |b, graph| {
            b.iter(|| get_route(&nodes[0], black_box(graph), &payee, None, &[], 100_000, 40))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_get_route);
criterion_main!(benches);
