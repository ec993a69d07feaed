//! Two channels driven against each other, message by message.

use super::*;
use crate::channel::htlc::{
    HTLCPreviousHopData, PendingHTLCInfo, PendingHTLCRouting, PendingHTLCStatus,
};
use crate::channel::state::FailPayload;
use crate::keys::KeysManager;
use crate::msgs::{ONION_HOP_DATA_SIZE, OnionPacket, UpdateAddHTLC, UpdateFee, UpdateFulfillHTLC};
use crate::types::PaymentPreimage;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::transaction::Version;
use bitcoin::{Amount, CompactTarget, Network, TxMerkleNode, TxOut, absolute::LockTime};

pub(crate) struct TestFeeEstimator(pub u32);

impl FeeEstimator for TestFeeEstimator {
    fn get_est_sat_per_1000_weight(&self, _: ConfirmationTarget) -> u32 {
        self.0
    }
}

pub(crate) fn test_config() -> UserConfig {
    let mut config = UserConfig::default();
    config.own_channel_config.minimum_depth = 1;
    config
}

pub(crate) fn keys_manager(seed: u8) -> KeysManager {
    KeysManager::new(&[seed; 32], Network::Testnet, 1_600_000_000, u32::from(seed)).unwrap()
}

pub(crate) fn test_header(nonce: u32) -> Header {
    Header {
        version: BlockVersion::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_600_000_000,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce,
    }
}

pub(crate) fn dummy_onion() -> OnionPacket {
    OnionPacket {
        version: 0,
        public_key: [2; 33],
        hop_data: [0; ONION_HOP_DATA_SIZE],
        hmac: [0; 32],
    }
}

fn preimage(n: u8) -> PaymentPreimage {
    PaymentPreimage([n; 32])
}

fn prev_hop(htlc_id: u64) -> HTLCSource {
    HTLCSource::PreviousHopData(HTLCPreviousHopData {
        short_channel_id: 42,
        htlc_id,
        incoming_packet_shared_secret: [9; 32],
    })
}

fn receive_status(msg: &UpdateAddHTLC) -> PendingHTLCStatus {
    PendingHTLCStatus::Forward(PendingHTLCInfo {
        routing: PendingHTLCRouting::Receive {
            payment_data: None,
            incoming_cltv_expiry: msg.cltv_expiry,
        },
        incoming_shared_secret: [0; 32],
        payment_hash: msg.payment_hash,
        amt_to_forward: msg.amount_msat,
        outgoing_cltv_value: msg.cltv_expiry,
    })
}

const FEE: TestFeeEstimator = TestFeeEstimator(253);

/// Open a funded, locked channel of `value` sat; `a` is the opener
fn open_pair(value: u64, push_msat: u64) -> (Channel, Channel) {
    let keys_a = keys_manager(1);
    let keys_b = keys_manager(2);
    let node_a = PublicKey::from_secret_key(&*SECP, &keys_a.get_node_secret());
    let node_b = PublicKey::from_secret_key(&*SECP, &keys_b.get_node_secret());
    let config = test_config();

    let params = OutboundParams {
        channel_value_satoshis: value,
        push_msat,
        user_id: 7,
    };
    let mut a = Channel::new_outbound(&keys_a, &FEE, node_b, params, &config).unwrap();
    let open = a.get_open_channel(ChainHash::BITCOIN).unwrap();
    let mut b = Channel::new_from_req(&keys_b, &FEE, node_a, &open, 8, &config).unwrap();
    let accept = b.get_accept_channel().unwrap();
    a.accept_channel(&accept, &config).unwrap();

    let funding_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2wsh_script(&a.funding_redeemscript().unwrap()),
        }],
    };
    let funding_txo = OutPoint {
        txid: funding_tx.compute_txid(),
        index: 0,
    };
    let created = a.get_outbound_funding_created(funding_txo).unwrap();
    let (signed, _) = b.funding_created(&created).unwrap();
    a.funding_signed(&signed).unwrap();
    assert_eq!(a.channel_id(), b.channel_id());

    let header = test_header(0);
    let locked_a = a.block_connected(&header, &[(1, &funding_tx)], 100).unwrap().unwrap();
    let locked_b = b.block_connected(&header, &[(1, &funding_tx)], 100).unwrap().unwrap();
    b.funding_locked(&locked_a).unwrap();
    a.funding_locked(&locked_b).unwrap();
    assert_eq!(a.state(), ChannelState::NormalOperation);
    assert_eq!(b.state(), ChannelState::NormalOperation);
    (a, b)
}

/// What one full commitment round produced
struct Round {
    locked_in: Vec<LockedInHTLC>,
    resolved: Vec<ResolvedHTLC>,
}

fn deliver(to: &mut Channel, update: &CommitmentUpdate) -> Vec<ResolvedHTLC> {
    let mut resolved = Vec::new();
    for msg in &update.update_add_htlcs {
        to.update_add_htlc(msg, receive_status(msg)).unwrap();
    }
    for msg in &update.update_fulfill_htlcs {
        resolved.push(to.update_fulfill_htlc(msg).unwrap());
    }
    for msg in &update.update_fail_htlcs {
        to.update_fail_htlc(msg).unwrap();
    }
    for msg in &update.update_fail_malformed_htlcs {
        to.update_fail_malformed_htlc(msg).unwrap();
    }
    if let Some(msg) = &update.update_fee {
        to.update_fee(&FEE, msg).unwrap();
    }
    resolved
}

/// Send everything `sender` has pending and run the round to completion
fn commit_round(sender: &mut Channel, receiver: &mut Channel) -> Round {
    let (update, monitor_update) = sender.send_commitment().unwrap().expect("pending updates");
    assert_eq!(monitor_update.update_id, sender.get_latest_monitor_update_id());
    let mut resolved = deliver(receiver, &update);

    let out = receiver.commitment_signed(&update.commitment_signed).unwrap();
    let mut locked_in = out.locked_in;
    let raa = out.revoke_and_ack.expect("receiver revokes");
    let reply = out.commitment_update.expect("receiver signs back");
    assert!(reply.update_add_htlcs.is_empty());

    let out = sender.revoke_and_ack(&raa).unwrap();
    assert!(out.commitment_update.is_none());
    resolved.extend(out.resolved);
    let out = sender.commitment_signed(&reply.commitment_signed).unwrap();
    assert!(out.commitment_update.is_none());
    resolved.extend(out.resolved);
    let raa = out.revoke_and_ack.expect("sender revokes");

    let out = receiver.revoke_and_ack(&raa).unwrap();
    assert!(out.commitment_update.is_none());
    locked_in.extend(out.locked_in);
    resolved.extend(out.resolved);
    Round { locked_in, resolved }
}

#[test]
fn test_open_and_lock() {
    let (a, b) = open_pair(100_000, 10_000_000);
    assert!(a.is_usable() && b.is_usable());
    assert_eq!(a.get_short_channel_id(), b.get_short_channel_id());
    assert_eq!(a.base_local_msat, 90_000_000);
    assert_eq!(b.base_local_msat, 10_000_000);
    assert_eq!(a.get_holder_commitment_number(), 0);
}

#[test]
fn test_open_rejects_oversized_funding() {
    let keys = keys_manager(1);
    let node = PublicKey::from_secret_key(&*SECP, &keys_manager(2).get_node_secret());
    let params = OutboundParams {
        channel_value_satoshis: MAX_FUNDING_SATOSHIS,
        push_msat: 0,
        user_id: 0,
    };
    assert!(Channel::new_outbound(&keys, &FEE, node, params, &test_config()).is_err());
}

#[test]
fn test_inbound_rejects_bad_feerate() {
    let keys_a = keys_manager(1);
    let keys_b = keys_manager(2);
    let node_a = PublicKey::from_secret_key(&*SECP, &keys_a.get_node_secret());
    let node_b = PublicKey::from_secret_key(&*SECP, &keys_b.get_node_secret());
    let params = OutboundParams {
        channel_value_satoshis: 100_000,
        push_msat: 0,
        user_id: 0,
    };
    let a = Channel::new_outbound(&keys_a, &FEE, node_b, params, &test_config()).unwrap();
    let mut open = a.get_open_channel(ChainHash::BITCOIN).unwrap();
    open.feerate_per_kw = 100_000;
    let err = Channel::new_from_req(&keys_b, &FEE, node_a, &open, 0, &test_config()).unwrap_err();
    assert!(matches!(err, ChannelError::Close(_)));
}

#[test]
fn test_htlc_add_and_fulfill() {
    let (mut a, mut b) = open_pair(100_000, 0);
    let hash = preimage(1).payment_hash();

    a.send_htlc(10_000_000, hash, 500, prev_hop(0), dummy_onion()).unwrap();
    let round = commit_round(&mut a, &mut b);
    assert_eq!(round.locked_in.len(), 1);
    assert_eq!(round.locked_in[0].amount_msat, 10_000_000);
    assert_eq!(a.get_holder_commitment_number(), 1);
    assert_eq!(b.get_holder_commitment_number(), 1);

    b.get_update_fulfill_htlc(0, preimage(1)).unwrap();
    let round = commit_round(&mut b, &mut a);
    assert!(matches!(
        round.resolved.as_slice(),
        [ResolvedHTLC::Fulfilled { preimage: p, .. }] if *p == preimage(1)
    ));

    assert_eq!(a.base_local_msat, 90_000_000);
    assert_eq!(a.base_remote_msat, 10_000_000);
    assert_eq!(b.base_local_msat, 10_000_000);
    assert!(a.local_log.iter().next().is_none());
    assert!(b.remote_log.iter().next().is_none());
}

#[test]
fn test_htlc_fail_returns_funds() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(5_000_000, preimage(2).payment_hash(), 500, prev_hop(3), dummy_onion())
        .unwrap();
    commit_round(&mut a, &mut b);

    b.get_update_fail_htlc(0, FailPayload::Relay(vec![0; 256])).unwrap();
    let round = commit_round(&mut b, &mut a);
    match round.resolved.as_slice() {
        [ResolvedHTLC::Failed { source, .. }] => assert_eq!(*source, prev_hop(3)),
        other => panic!("unexpected resolution {other:?}"),
    }
    assert_eq!(a.base_local_msat, 100_000_000);
    assert_eq!(b.base_local_msat, 0);
}

#[test]
fn test_fee_update_applies_on_both_sides() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_update_fee(500).unwrap();
    a.send_update_fee(400).unwrap();
    assert_eq!(a.local_log.iter().count(), 1);
    commit_round(&mut a, &mut b);
    assert_eq!(a.get_feerate(), 400);
    assert_eq!(b.get_feerate(), 400);
}

#[test]
fn test_acceptor_cannot_update_fee() {
    let (mut a, mut b) = open_pair(100_000, 0);
    assert!(matches!(b.send_update_fee(500), Err(ChannelError::Ignore(_))));
    let msg = UpdateFee {
        channel_id: a.channel_id(),
        feerate_per_kw: 300,
    };
    assert!(matches!(a.update_fee(&FEE, &msg), Err(ChannelError::Close(_))));
}

#[test]
fn test_send_htlc_limits() {
    let (mut a, _) = open_pair(100_000, 0);
    let hash = preimage(3).payment_hash();
    assert!(matches!(
        a.send_htlc(0, hash, 500, prev_hop(0), dummy_onion()),
        Err(ChannelError::Ignore(_))
    ));
    assert!(matches!(
        a.send_htlc(99_900_000, hash, 500, prev_hop(0), dummy_onion()),
        Err(ChannelError::Ignore(_))
    ));
    assert!(a.local_log.iter().next().is_none());
}

#[test]
fn test_update_add_rejects_skipped_id() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(4).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    let mut msg = update.update_add_htlcs[0].clone();
    msg.htlc_id = 5;
    let err = b.update_add_htlc(&msg, receive_status(&msg)).unwrap_err();
    assert!(matches!(err, ChannelError::Close(_)));
}

#[test]
fn test_update_add_rejects_timestamp_expiry() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(4).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    let mut msg = update.update_add_htlcs[0].clone();
    msg.cltv_expiry = 500_000_000;
    assert!(b.update_add_htlc(&msg, receive_status(&msg)).is_err());
}

#[test]
fn test_fulfill_with_wrong_preimage_closes() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(5).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    commit_round(&mut a, &mut b);
    let msg = UpdateFulfillHTLC {
        channel_id: a.channel_id(),
        htlc_id: 0,
        payment_preimage: preimage(6),
    };
    assert!(matches!(a.update_fulfill_htlc(&msg), Err(ChannelError::Close(_))));
    assert!(matches!(b.get_update_fulfill_htlc(0, preimage(6)), Err(ChannelError::Ignore(_))));
}

#[test]
fn test_commitment_signed_without_updates_closes() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(7).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    // The add never arrived
    assert!(matches!(
        b.commitment_signed(&update.commitment_signed),
        Err(ChannelError::Close(_))
    ));
}

#[test]
fn test_holding_cell_while_awaiting_revoke() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(8).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    a.send_htlc(2_000_000, preimage(9).payment_hash(), 500, prev_hop(1), dummy_onion())
        .unwrap();
    assert_eq!(a.holding_cell.len(), 1);
    assert!(a.send_commitment().unwrap().is_none());

    deliver(&mut b, &update);
    let out = b.commitment_signed(&update.commitment_signed).unwrap();
    let out_a = a.revoke_and_ack(&out.revoke_and_ack.unwrap()).unwrap();
    // The held add goes out right after the revocation
    let freed = out_a.commitment_update.expect("holding cell freed");
    assert_eq!(freed.update_add_htlcs.len(), 1);
    assert_eq!(freed.update_add_htlcs[0].htlc_id, 1);
    assert!(a.holding_cell.is_empty());
}

#[test]
fn test_reestablish_resends_lost_commitment() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(3_000_000, preimage(10).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    // b got the add but not the signature
    deliver(&mut b, &update);

    a.remove_uncommitted_htlcs_and_mark_paused();
    b.remove_uncommitted_htlcs_and_mark_paused();
    assert!(!a.is_live());
    assert!(b.remote_log.iter().next().is_none());

    let reestablish_a = a.get_channel_reestablish().unwrap();
    let reestablish_b = b.get_channel_reestablish().unwrap();
    let out_b = b.channel_reestablish(&reestablish_a).unwrap();
    assert!(out_b.revoke_and_ack.is_none() && out_b.commitment_update.is_none());
    let out_a = a.channel_reestablish(&reestablish_b).unwrap();
    assert!(out_a.revoke_and_ack.is_none());
    let resent = out_a.commitment_update.expect("commitment retransmitted");
    assert_eq!(resent, update);

    deliver(&mut b, &resent);
    let out = b.commitment_signed(&resent.commitment_signed).unwrap();
    assert!(out.revoke_and_ack.is_some());
}

#[test]
fn test_reestablish_resends_lost_revoke_and_ack() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(3_000_000, preimage(11).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    deliver(&mut b, &update);
    let out = b.commitment_signed(&update.commitment_signed).unwrap();
    let lost_raa = out.revoke_and_ack.unwrap();
    let lost_cs = out.commitment_update.unwrap();

    a.remove_uncommitted_htlcs_and_mark_paused();
    b.remove_uncommitted_htlcs_and_mark_paused();
    let reestablish_a = a.get_channel_reestablish().unwrap();
    let reestablish_b = b.get_channel_reestablish().unwrap();

    let out_b = b.channel_reestablish(&reestablish_a).unwrap();
    assert_eq!(out_b.revoke_and_ack.as_ref(), Some(&lost_raa));
    assert_eq!(out_b.commitment_update.as_ref(), Some(&lost_cs));
    assert_eq!(out_b.order, RAACommitmentOrder::RevokeAndACKFirst);

    let out_a = a.channel_reestablish(&reestablish_b).unwrap();
    assert!(out_a.commitment_update.is_none());
    a.revoke_and_ack(&lost_raa).unwrap();
    let out = a.commitment_signed(&lost_cs.commitment_signed).unwrap();
    let out = b.revoke_and_ack(&out.revoke_and_ack.unwrap()).unwrap();
    assert_eq!(out.locked_in.len(), 1);
}

#[test]
fn test_reestablish_rejects_garbage_secret() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(3_000_000, preimage(12).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    commit_round(&mut a, &mut b);
    a.remove_uncommitted_htlcs_and_mark_paused();
    b.remove_uncommitted_htlcs_and_mark_paused();
    let mut reestablish_a = a.get_channel_reestablish().unwrap();
    reestablish_a.your_last_per_commitment_secret = [1; 32];
    assert!(matches!(b.channel_reestablish(&reestablish_a), Err(ChannelError::Close(_))));
}

#[test]
fn test_monitor_failure_withholds_and_restores() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(3_000_000, preimage(13).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    deliver(&mut b, &update);
    let out = b.commitment_signed(&update.commitment_signed).unwrap();
    let raa = out.revoke_and_ack.clone().unwrap();
    let cs = out.commitment_update.clone().unwrap();

    b.monitor_update_failed(true, true, out.locked_in);
    assert!(b.is_awaiting_monitor_update());
    let restored = b.monitor_updating_restored().unwrap();
    assert!(!b.is_awaiting_monitor_update());
    assert_eq!(restored.revoke_and_ack, Some(raa));
    assert_eq!(restored.commitment_update.unwrap().commitment_signed, cs.commitment_signed);
}

#[test]
fn test_cooperative_close() {
    let (mut a, mut b) = open_pair(100_000, 20_000_000);
    let (shutdown_a, dropped) = a.get_shutdown().unwrap();
    assert!(dropped.is_empty());
    let (reply, _) = b.shutdown(&shutdown_a).unwrap();
    let (none, _) = a.shutdown(&reply.unwrap()).unwrap();
    assert!(none.is_none());
    assert!(!a.is_usable());

    let proposal = a.maybe_propose_first_closing_signed(&FEE).unwrap().unwrap();
    assert!(b.maybe_propose_first_closing_signed(&FEE).unwrap().is_none());
    let (counter, tx_b) = b.closing_signed(&FEE, &proposal).unwrap();
    let (done, tx_a) = a.closing_signed(&FEE, &counter.unwrap()).unwrap();
    assert!(done.is_none());
    assert_eq!(tx_a.unwrap(), tx_b.unwrap());
    assert_eq!(a.state(), ChannelState::Closed);
    assert_eq!(b.state(), ChannelState::Closed);
}

#[test]
fn test_closing_fee_midpoint() {
    let (mut a, mut b) = open_pair(100_000, 0);
    let (shutdown_a, _) = a.get_shutdown().unwrap();
    let (reply, _) = b.shutdown(&shutdown_a).unwrap();
    a.shutdown(&reply.unwrap()).unwrap();

    let high = TestFeeEstimator(2530);
    let proposal = a.maybe_propose_first_closing_signed(&high).unwrap().unwrap();
    let (counter, tx) = b.closing_signed(&FEE, &proposal).unwrap();
    assert!(tx.is_none());
    let counter = counter.unwrap();
    assert!(counter.fee_satoshis < proposal.fee_satoshis);
    assert!(counter.fee_satoshis > b.proposed_closing_fee(&FEE));
}

#[test]
fn test_shutdown_drops_held_htlcs() {
    let (mut a, mut b) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(14).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, _) = a.send_commitment().unwrap().unwrap();
    a.send_htlc(1_000_000, preimage(15).payment_hash(), 500, prev_hop(1), dummy_onion())
        .unwrap();
    deliver(&mut b, &update);

    let (_, dropped) = a.get_shutdown().unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].source, prev_hop(1));
}

#[test]
fn test_force_shutdown_reports_uncommitted() {
    let (mut a, _) = open_pair(100_000, 0);
    a.send_htlc(1_000_000, preimage(16).payment_hash(), 500, prev_hop(0), dummy_onion())
        .unwrap();
    let (update, dropped) = a.force_shutdown(true);
    let (_, update) = update.unwrap();
    assert_eq!(update.update_id, CLOSED_CHANNEL_UPDATE_ID);
    assert_eq!(dropped.len(), 1);
    assert_eq!(a.state(), ChannelState::Closed);
}

#[test]
fn test_funding_reorg_after_lock_requires_close() {
    let (mut a, _) = open_pair(100_000, 0);
    assert!(!a.block_disconnected(&test_header(99), 100));
    assert!(a.block_disconnected(&test_header(0), 100));
    assert_eq!(a.get_short_channel_id(), None);
}
