//! Two nodes in one process, talking over loopback TCP: connect, open a
//! channel, pay across it and close it cooperatively.

use crate::node::Node;
use anyhow::Context;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, BlockHash, CompactTarget, Network, Transaction, TxMerkleNode, TxOut, absolute::LockTime};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thunder_core::chain::OutPoint;
use thunder_core::events::Event;
use thunder_core::manager::ChannelDetails;
use thunder_core::{PaymentPreimage, PaymentSecret, UserConfig};
use thunder_crypto::random::random_32;
use thunder_routing::get_route;
use tokio::net::TcpListener;
use tracing::info;

const START_HEIGHT: u32 = 100;
const FINAL_CLTV: u32 = 40;
const STEP_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// What the demo did, printed as JSON
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// Funder
    pub alice: String,
    /// Fundee and payee
    pub bob: String,
    /// Funding outpoint
    pub funding_txo: String,
    /// Where the funding landed
    pub short_channel_id: u64,
    /// Payment hash, hex
    pub payment_hash: String,
    /// Amount paid
    pub amount_msat: u64,
    /// Both sides' view of the channel right after the payment
    pub channels_after_payment: Vec<ChannelDetails>,
    /// Cooperative close transaction
    pub closing_txid: String,
}

fn header(height: u32) -> Header {
    Header {
        version: BlockVersion::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_600_000_000 + height,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: height,
    }
}

/// Poll `node` until one of its events matches `pick`
async fn wait_for_event<T>(node: &Node, what: &str, mut pick: impl FnMut(&Event) -> Option<T>) -> anyhow::Result<T> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            node.peer_manager.process_events();
            if let Some(found) = node.handle_events().iter().find_map(&mut pick) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

async fn wait_until(node: &Node, what: &str, mut done: impl FnMut(&Node) -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !done(node) {
            node.peer_manager.process_events();
            node.handle_events();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

/// Run the scenario with state kept under `data_dir`
///
/// # Errors
///
/// Fails if any step errors or stalls.
pub async fn run(
    data_dir: &Path,
    mut config: UserConfig,
    sat_per_kw: u32,
    channel_value_sat: u64,
    amount_msat: u64,
) -> anyhow::Result<DemoReport> {
    // The funding is confirmed by a single synthetic block
    config.own_channel_config.minimum_depth = 1;

    let alice = Node::new(
        &random_32()?,
        Network::Regtest,
        config,
        sat_per_kw,
        &data_dir.join("alice"),
        START_HEIGHT,
    )?;
    let bob = Node::new(
        &random_32()?,
        Network::Regtest,
        config,
        sat_per_kw,
        &data_dir.join("bob"),
        START_HEIGHT,
    )?;
    info!(alice = %alice.node_id(), bob = %bob.node_id(), "demo nodes ready");

    let timers = [&alice, &bob].map(|n| thunder_transport::spawn_timers(n.peer_manager.clone(), FLUSH_INTERVAL, PING_INTERVAL));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let bob_listener = tokio::spawn(thunder_transport::listen(bob.peer_manager.clone(), listener));
    let alice_connection = thunder_transport::connect_outbound(alice.peer_manager.clone(), bob.node_id(), addr).await?;
    let bob_id = bob.node_id();
    wait_until(&alice, "handshake", |n| n.peer_manager.get_peer_node_ids().contains(&bob_id)).await?;

    // Open
    alice
        .channel_manager
        .create_channel(bob_id, channel_value_sat, 0, 1, None)
        .map_err(|e| anyhow::anyhow!("create_channel: {e}"))?;
    let (temporary_channel_id, output_script) = wait_for_event(&alice, "funding request", |e| match e {
        Event::FundingGenerationReady {
            temporary_channel_id,
            output_script,
            ..
        } => Some((*temporary_channel_id, output_script.clone())),
        _ => None,
    })
    .await?;
    let funding_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: vec![TxOut {
            value: Amount::from_sat(channel_value_sat),
            script_pubkey: output_script,
        }],
    };
    let funding_txo = OutPoint {
        txid: funding_tx.compute_txid(),
        index: 0,
    };
    alice
        .channel_manager
        .funding_transaction_generated(temporary_channel_id, funding_txo)
        .map_err(|e| anyhow::anyhow!("funding_transaction_generated: {e}"))?;
    wait_for_event(&alice, "funding signatures", |e| {
        matches!(e, Event::FundingBroadcastSafe { .. }).then_some(())
    })
    .await?;

    // Confirm
    let height = START_HEIGHT + 1;
    let block = header(height);
    for node in [&alice, &bob] {
        node.channel_manager.block_connected(&block, &[(1, &funding_tx)], height);
        node.chain_monitor.block_connected(&block, &[(1, &funding_tx)], height);
    }
    wait_until(&alice, "channel to lock", |n| !n.channel_manager.list_usable_channels().is_empty()).await?;
    let short_channel_id = alice.channel_manager.list_usable_channels()[0]
        .short_channel_id
        .context("usable channel without a short channel id")?;
    info!(%funding_txo, short_channel_id, "channel open");

    // Pay
    let preimage = PaymentPreimage(random_32()?);
    let secret = PaymentSecret(random_32()?);
    let payment_hash = preimage.payment_hash();
    let first_hops = alice.channel_manager.list_usable_channels();
    let route = get_route(
        &alice.node_id(),
        &alice.router.read_locked_graph(),
        &bob_id,
        Some(first_hops.as_slice()),
        &[],
        amount_msat,
        FINAL_CLTV,
    )
    .map_err(|e| anyhow::anyhow!("no route: {}", e.err))?;
    alice
        .channel_manager
        .send_payment(&route, payment_hash, Some(secret))
        .map_err(|e| anyhow::anyhow!("send_payment: {e:?}"))?;
    let received = wait_for_event(&bob, "payment to arrive", |e| match e {
        Event::PaymentReceived { payment_hash: h, amt, .. } if *h == payment_hash => Some(*amt),
        _ => None,
    })
    .await?;
    anyhow::ensure!(
        bob.channel_manager.claim_funds(preimage, Some(secret), received),
        "bob could not claim the payment"
    );
    wait_for_event(&alice, "payment to complete", |e| match e {
        Event::PaymentSent { payment_preimage } if *payment_preimage == preimage => Some(()),
        _ => None,
    })
    .await?;
    info!(%payment_hash, amount_msat, "payment complete");

    // Let the final revoke_and_ack land before snapshotting balances
    wait_until(&bob, "commitment to settle", |n| {
        n.channel_manager
            .list_channels()
            .first()
            .is_some_and(|c| c.outbound_capacity_msat > 0)
    })
    .await?;
    let mut channels_after_payment = alice.channel_manager.list_channels();
    channels_after_payment.extend(bob.channel_manager.list_channels());

    // Close
    let channel_id = funding_txo.to_channel_id();
    alice
        .channel_manager
        .close_channel(&channel_id)
        .map_err(|e| anyhow::anyhow!("close_channel: {e}"))?;
    for node in [&alice, &bob] {
        wait_for_event(node, "channel close", |e| {
            matches!(e, Event::ChannelClosed { .. }).then_some(())
        })
        .await?;
    }
    let closing_txid = alice
        .broadcaster
        .take()
        .iter()
        .chain(bob.broadcaster.take().iter())
        .find(|tx| tx.input.iter().any(|i| i.previous_output.txid == funding_txo.txid))
        .map(Transaction::compute_txid)
        .context("no closing transaction was broadcast")?;
    info!(%closing_txid, "channel closed");

    alice_connection.abort();
    bob_listener.abort();
    for timer in timers {
        timer.abort();
    }

    Ok(DemoReport {
        alice: alice.node_id().to_string(),
        bob: bob_id.to_string(),
        funding_txo: funding_txo.to_string(),
        short_channel_id,
        payment_hash: payment_hash.to_string(),
        amount_msat,
        channels_after_payment,
        closing_txid: closing_txid.to_string(),
    })
}
