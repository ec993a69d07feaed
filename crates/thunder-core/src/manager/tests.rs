//! Two managers wired together through an in-memory message pump.

use super::*;
use crate::chain::chain_monitor::{ChainMonitor, Persist};
use crate::chain::monitor::tests::TestBroadcaster;
use crate::chain::ChannelMonitor;
use crate::channel::tests::{TestFeeEstimator, keys_manager, test_config, test_header};
use crate::features::{ChannelFeatures, NodeFeatures};
use crate::msgs::OpenChannel;
use bitcoin::transaction::Version;
use bitcoin::{Amount, TxOut, absolute::LockTime};

const START_HEIGHT: u32 = 100;

#[derive(Default)]
struct TestPersister {
    fail_with: Mutex<Option<ChannelMonitorUpdateErr>>,
}

impl TestPersister {
    fn result(&self) -> Result<(), ChannelMonitorUpdateErr> {
        self.fail_with.lock().unwrap().map_or(Ok(()), Err)
    }
}

impl Persist for TestPersister {
    fn persist_new_channel(&self, _: OutPoint, _: &ChannelMonitor) -> Result<(), ChannelMonitorUpdateErr> {
        self.result()
    }

    fn update_persisted_channel(
        &self,
        _: OutPoint,
        _: &ChannelMonitorUpdate,
        _: &ChannelMonitor,
    ) -> Result<(), ChannelMonitorUpdateErr> {
        self.result()
    }
}

struct Node {
    manager: ChannelManager,
    broadcaster: Arc<TestBroadcaster>,
    node_id: PublicKey,
}

fn node(seed: u8) -> Node {
    let broadcaster = Arc::new(TestBroadcaster::default());
    let fee_estimator = Arc::new(TestFeeEstimator(253));
    let chain_monitor = Arc::new(ChainMonitor::new(
        None,
        broadcaster.clone(),
        fee_estimator.clone(),
        Arc::new(TestPersister::default()),
    ));
    let manager = ChannelManager::new(
        Network::Testnet,
        fee_estimator,
        chain_monitor,
        broadcaster.clone(),
        Arc::new(keys_manager(seed)),
        test_config(),
        START_HEIGHT,
    );
    let node_id = manager.get_our_node_id();
    Node {
        manager,
        broadcaster,
        node_id,
    }
}

fn deliver(from: &Node, to: &Node, event: MessageSendEvent) {
    let them = &from.node_id;
    let cm = &to.manager;
    match event {
        MessageSendEvent::SendOpenChannel { msg, .. } => cm.handle_open_channel(them, InitFeatures::known(), &msg),
        MessageSendEvent::SendAcceptChannel { msg, .. } => cm.handle_accept_channel(them, InitFeatures::known(), &msg),
        MessageSendEvent::SendFundingCreated { msg, .. } => cm.handle_funding_created(them, &msg),
        MessageSendEvent::SendFundingSigned { msg, .. } => cm.handle_funding_signed(them, &msg),
        MessageSendEvent::SendFundingLocked { msg, .. } => cm.handle_funding_locked(them, &msg),
        MessageSendEvent::SendAnnouncementSignatures { msg, .. } => cm.handle_announcement_signatures(them, &msg),
        MessageSendEvent::SendRevokeAndACK { msg, .. } => cm.handle_revoke_and_ack(them, &msg),
        MessageSendEvent::SendClosingSigned { msg, .. } => cm.handle_closing_signed(them, &msg),
        MessageSendEvent::SendShutdown { msg, .. } => cm.handle_shutdown(them, &msg),
        MessageSendEvent::SendChannelReestablish { msg, .. } => cm.handle_channel_reestablish(them, &msg),
        MessageSendEvent::UpdateHTLCs { updates, .. } => {
            for msg in &updates.update_add_htlcs {
                cm.handle_update_add_htlc(them, msg);
            }
            for msg in &updates.update_fulfill_htlcs {
                cm.handle_update_fulfill_htlc(them, msg);
            }
            for msg in &updates.update_fail_htlcs {
                cm.handle_update_fail_htlc(them, msg);
            }
            for msg in &updates.update_fail_malformed_htlcs {
                cm.handle_update_fail_malformed_htlc(them, msg);
            }
            if let Some(msg) = &updates.update_fee {
                cm.handle_update_fee(them, msg);
            }
            cm.handle_commitment_signed(them, &updates.commitment_signed);
        }
        MessageSendEvent::HandleError {
            action: ErrorAction::SendErrorMessage { msg },
            ..
        } => cm.handle_error(them, &msg),
        _ => {}
    }
}

/// Deliver messages between `a` and `b` until both go quiet. Returns the
/// errors each side sent.
fn pump(a: &Node, b: &Node) -> Vec<ErrorMessage> {
    let mut errors = Vec::new();
    for _ in 0..100 {
        let from_a = a.manager.get_and_clear_pending_msg_events();
        let from_b = b.manager.get_and_clear_pending_msg_events();
        if from_a.is_empty() && from_b.is_empty() {
            return errors;
        }
        for (from, to, events) in [(a, b, from_a), (b, a, from_b)] {
            for event in events {
                if let MessageSendEvent::HandleError {
                    action: ErrorAction::SendErrorMessage { msg },
                    ..
                } = &event
                {
                    errors.push(msg.clone());
                }
                deliver(from, to, event);
            }
        }
    }
    panic!("message pump did not settle");
}

fn funding_tx(events: &[Event]) -> (ChannelId, Transaction) {
    let [
        Event::FundingGenerationReady {
            temporary_channel_id,
            channel_value_satoshis,
            output_script,
            ..
        },
    ] = events
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
    (*temporary_channel_id, tx)
}

/// Open, fund and lock a channel from `a` to `b`
fn open_channel(a: &Node, b: &Node, value: u64, push_msat: u64) -> (OutPoint, u64) {
    a.manager
        .create_channel(b.node_id, value, push_msat, 42, None)
        .unwrap();
    assert!(pump(a, b).is_empty());

    let (temporary_channel_id, tx) = funding_tx(&a.manager.get_and_clear_pending_events());
    let funding_txo = OutPoint {
        txid: tx.compute_txid(),
        index: 0,
    };
    a.manager
        .funding_transaction_generated(temporary_channel_id, funding_txo)
        .unwrap();
    assert!(pump(a, b).is_empty());
    assert_eq!(
        a.manager.get_and_clear_pending_events(),
        vec![Event::FundingBroadcastSafe {
            funding_txo,
            user_channel_id: 42,
        }]
    );

    let height = START_HEIGHT + 1;
    let header = test_header(height);
    for n in [a, b] {
        n.manager.block_connected(&header, &[(1, &tx)], height);
    }
    assert!(pump(a, b).is_empty());
    let short_channel_id = a.manager.list_usable_channels()[0].short_channel_id.unwrap();
    (funding_txo, short_channel_id)
}

fn route_to(payee: &Node, short_channel_id: u64, amount_msat: u64) -> Route {
    Route {
        paths: vec![vec![RouteHop {
            pubkey: payee.node_id,
            node_features: NodeFeatures::known(),
            short_channel_id,
            channel_features: ChannelFeatures::known(),
            fee_msat: amount_msat,
            cltv_expiry_delta: 40,
        }]],
    }
}

fn hop(pubkey: PublicKey) -> RouteHop {
    RouteHop {
        pubkey,
        node_features: NodeFeatures::known(),
        short_channel_id: 1,
        channel_features: ChannelFeatures::known(),
        fee_msat: 1000,
        cltv_expiry_delta: 40,
    }
}

#[test]
fn test_create_channel_queues_open_channel() {
    let a = node(1);
    let b = node(2);
    let temporary_channel_id = a.manager.create_channel(b.node_id, 100_000, 0, 7, None).unwrap();

    let events = a.manager.get_and_clear_pending_msg_events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        MessageSendEvent::SendOpenChannel { node_id, msg } => {
            assert_eq!(*node_id, b.node_id);
            assert_eq!(msg.temporary_channel_id, temporary_channel_id);
            assert_eq!(msg.funding_satoshis, 100_000);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let channels = a.manager.list_channels();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].user_id, 7);
    assert!(!channels[0].is_live);
    assert!(a.manager.list_usable_channels().is_empty());
}

#[test]
fn test_create_channel_rejects_tiny_value() {
    let a = node(1);
    let b = node(2);
    assert!(matches!(
        a.manager.create_channel(b.node_id, 999, 0, 0, None),
        Err(APIError::APIMisuseError { .. })
    ));
    assert!(a.manager.list_channels().is_empty());
}

#[test]
fn test_open_channel_wrong_chain_is_refused() {
    let a = node(1);
    let b = node(2);
    a.manager.create_channel(b.node_id, 100_000, 0, 0, None).unwrap();
    let events = a.manager.get_and_clear_pending_msg_events();
    let MessageSendEvent::SendOpenChannel { msg, .. } = &events[0] else {
        panic!("expected open_channel");
    };
    let msg = OpenChannel {
        chain_hash: ChainHash::BITCOIN,
        ..msg.clone()
    };
    b.manager.handle_open_channel(&a.node_id, InitFeatures::known(), &msg);

    let replies = b.manager.get_and_clear_pending_msg_events();
    assert!(matches!(
        replies.as_slice(),
        [MessageSendEvent::HandleError {
            action: ErrorAction::SendErrorMessage { .. },
            ..
        }]
    ));
    assert!(b.manager.list_channels().is_empty());
}

#[test]
fn test_send_payment_parameter_errors() {
    let a = node(1);
    let b = node(2);
    let hash = PaymentPreimage([1; 32]).payment_hash();

    let empty = Route { paths: Vec::new() };
    assert!(matches!(
        a.manager.send_payment(&empty, hash, None),
        Err(PaymentSendFailure::ParameterError(APIError::RouteError { .. }))
    ));

    let too_many = Route {
        paths: vec![vec![hop(b.node_id)]; MAX_PATHS + 1],
    };
    assert!(matches!(
        a.manager.send_payment(&too_many, hash, Some(PaymentSecret([2; 32]))),
        Err(PaymentSendFailure::ParameterError(APIError::RouteError { .. }))
    ));

    let multi_path = Route {
        paths: vec![vec![hop(b.node_id)]; 2],
    };
    assert!(matches!(
        a.manager.send_payment(&multi_path, hash, None),
        Err(PaymentSendFailure::ParameterError(APIError::APIMisuseError { .. }))
    ));

    let mixed = Route {
        paths: vec![vec![hop(b.node_id)], vec![hop(b.node_id); MAX_PATH_HOPS + 1]],
    };
    match a.manager.send_payment(&mixed, hash, Some(PaymentSecret([2; 32]))) {
        Err(PaymentSendFailure::PathParameterError(results)) => {
            assert!(results[0].is_ok());
            assert!(results[1].is_err());
        }
        other => panic!("unexpected result {other:?}"),
    }

    let through_us = Route {
        paths: vec![vec![hop(a.node_id), hop(b.node_id)]],
    };
    assert!(matches!(
        a.manager.send_payment(&through_us, hash, None),
        Err(PaymentSendFailure::PathParameterError(_))
    ));
}

#[test]
fn test_send_payment_without_channel_is_retry_safe() {
    let a = node(1);
    let b = node(2);
    let route = route_to(&b, 12345, 1_000_000);
    match a.manager.send_payment(&route, PaymentPreimage([3; 32]).payment_hash(), None) {
        Err(PaymentSendFailure::AllFailedRetrySafe(errs)) => {
            assert!(matches!(errs.as_slice(), [APIError::ChannelUnavailable { .. }]));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_unknown_channel_operations() {
    let a = node(1);
    let unknown = ChannelId([5; 32]);
    assert!(a.manager.close_channel(&unknown).is_err());
    assert!(a.manager.force_close_channel(&unknown).is_err());
    assert!(a.manager.update_fee(&unknown, 1000).is_err());
    assert!(!a.manager.claim_funds(PaymentPreimage([1; 32]), None, 1000));
    assert!(!a.manager.fail_htlc_backwards(&PaymentPreimage([1; 32]).payment_hash(), None));
}

#[test]
fn test_message_from_wrong_peer_is_rejected() {
    let a = node(1);
    let b = node(2);
    let c = node(3);
    a.manager.create_channel(b.node_id, 100_000, 0, 0, None).unwrap();
    let events = a.manager.get_and_clear_pending_msg_events();
    let MessageSendEvent::SendOpenChannel { msg, .. } = &events[0] else {
        panic!("expected open_channel");
    };
    b.manager.handle_open_channel(&a.node_id, InitFeatures::known(), msg);
    let events = b.manager.get_and_clear_pending_msg_events();
    let MessageSendEvent::SendAcceptChannel { msg, .. } = &events[0] else {
        panic!("expected accept_channel");
    };

    a.manager.handle_accept_channel(&c.node_id, InitFeatures::known(), msg);
    assert!(a.manager.get_and_clear_pending_events().is_empty());
    assert_eq!(a.manager.list_channels().len(), 1);
}

#[test]
fn test_funding_flow_locks_channel() {
    let a = node(1);
    let b = node(2);
    let (funding_txo, short_channel_id) = open_channel(&a, &b, 100_000, 10_000_000);

    assert_eq!(short_channel_id >> 40, u64::from(START_HEIGHT + 1));
    for (n, other) in [(&a, &b), (&b, &a)] {
        let channels = n.manager.list_usable_channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_id, funding_txo.to_channel_id());
        assert_eq!(channels[0].remote_network_id, other.node_id);
        assert_eq!(channels[0].channel_value_satoshis, 100_000);
        assert!(channels[0].is_live);
    }
    assert_eq!(b.manager.list_channels()[0].user_id, 0);
    assert!(a.manager.list_channels()[0].outbound_capacity_msat < 90_000_000);
    assert_eq!(a.manager.latest_block_height(), START_HEIGHT + 1);
}

#[test]
fn test_claim_requires_matching_secret() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let preimage = PaymentPreimage([7; 32]);
    let payment_hash = preimage.payment_hash();
    let secret = PaymentSecret([8; 32]);

    a.manager
        .send_payment(&route_to(&b, short_channel_id, 5_000_000), payment_hash, Some(secret))
        .unwrap();
    assert!(pump(&a, &b).is_empty());

    let events = b.manager.get_and_clear_pending_events();
    assert!(matches!(events.as_slice(), [Event::PendingHTLCsForwardable { .. }]));
    b.manager.process_pending_htlc_forwards();
    assert_eq!(
        b.manager.get_and_clear_pending_events(),
        vec![Event::PaymentReceived {
            payment_hash,
            payment_secret: Some(secret),
            amt: 5_000_000,
        }]
    );

    assert!(!b.manager.claim_funds(preimage, Some(PaymentSecret([9; 32])), 5_000_000));
    assert!(pump(&a, &b).is_empty());
    assert!(matches!(
        a.manager.get_and_clear_pending_events().as_slice(),
        [Event::PaymentFailed { .. }]
    ));
}

#[test]
fn test_single_hop_payment_and_claim() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let preimage = PaymentPreimage([7; 32]);
    let secret = PaymentSecret([8; 32]);
    a.manager
        .send_payment(&route_to(&b, short_channel_id, 5_000_000), preimage.payment_hash(), Some(secret))
        .unwrap();
    pump(&a, &b);
    b.manager.process_pending_htlc_forwards();
    b.manager.get_and_clear_pending_events();
    assert!(b.manager.claim_funds(preimage, Some(secret), 5_000_000));
    assert!(pump(&a, &b).is_empty());
    assert_eq!(
        a.manager.get_and_clear_pending_events(),
        vec![Event::PaymentSent {
            payment_preimage: preimage,
        }]
    );
    let b_channel = &b.manager.list_channels()[0];
    assert!(b_channel.outbound_capacity_msat > 0);
}

#[test]
fn test_payment_failed_back_by_payee() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let payment_hash = PaymentPreimage([9; 32]).payment_hash();

    a.manager
        .send_payment(&route_to(&b, short_channel_id, 2_000_000), payment_hash, None)
        .unwrap();
    pump(&a, &b);
    b.manager.get_and_clear_pending_events();
    b.manager.process_pending_htlc_forwards();
    b.manager.get_and_clear_pending_events();

    assert!(b.manager.fail_htlc_backwards(&payment_hash, None));
    assert!(pump(&a, &b).is_empty());
    assert_eq!(
        a.manager.get_and_clear_pending_events(),
        vec![Event::PaymentFailed {
            payment_hash,
            rejected_by_dest: true,
        }]
    );
}

#[test]
fn test_claim_with_wrong_amount_fails_back() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let preimage = PaymentPreimage([4; 32]);

    a.manager
        .send_payment(&route_to(&b, short_channel_id, 1_000_000), preimage.payment_hash(), None)
        .unwrap();
    pump(&a, &b);
    b.manager.process_pending_htlc_forwards();
    b.manager.get_and_clear_pending_events();

    assert!(!b.manager.claim_funds(preimage, None, 5_000_000));
    pump(&a, &b);
    let events = a.manager.get_and_clear_pending_events();
    assert!(matches!(events.as_slice(), [Event::PaymentFailed { .. }]));
}

#[test]
fn test_cooperative_close() {
    let a = node(1);
    let b = node(2);
    let (funding_txo, _) = open_channel(&a, &b, 100_000, 0);
    let channel_id = funding_txo.to_channel_id();

    a.manager.close_channel(&channel_id).unwrap();
    assert!(pump(&a, &b).is_empty());

    assert!(a.manager.list_channels().is_empty());
    assert!(b.manager.list_channels().is_empty());
    let closing = a.broadcaster.txn.lock().unwrap();
    assert_eq!(closing.len(), 1);
    assert_eq!(closing[0].input[0].previous_output.txid, funding_txo.txid);
    for n in [&a, &b] {
        assert!(n
            .manager
            .get_and_clear_pending_events()
            .iter()
            .any(|e| matches!(e, Event::ChannelClosed { .. })));
    }
}

#[test]
fn test_force_close_broadcasts_and_notifies_peer() {
    let a = node(1);
    let b = node(2);
    let (funding_txo, _) = open_channel(&a, &b, 100_000, 0);
    a.manager.get_and_clear_pending_events();

    a.manager.force_close_channel(&funding_txo.to_channel_id()).unwrap();
    assert!(a.manager.list_channels().is_empty());
    assert!(
        a.manager
            .get_and_clear_pending_events()
            .iter()
            .any(|e| matches!(e, Event::ChannelClosed { .. }))
    );
    let errors = pump(&a, &b);
    assert_eq!(errors.len(), 1);
    assert!(b.manager.list_channels().is_empty());
}

#[test]
fn test_peer_disconnect_drops_unfunded_channel() {
    let a = node(1);
    let b = node(2);
    a.manager.create_channel(b.node_id, 100_000, 0, 0, None).unwrap();
    a.manager.peer_disconnected(&b.node_id, false);
    assert!(a.manager.list_channels().is_empty());
    assert!(a.manager.get_and_clear_pending_msg_events().is_empty());
}

#[test]
fn test_reconnect_resumes_channel() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);

    a.manager.peer_disconnected(&b.node_id, false);
    b.manager.peer_disconnected(&a.node_id, false);
    assert!(a.manager.list_usable_channels().is_empty());
    assert_eq!(a.manager.list_channels().len(), 1);

    let init = Init {
        features: InitFeatures::known(),
    };
    a.manager.peer_connected(&b.node_id, &init);
    b.manager.peer_connected(&a.node_id, &init);
    assert!(pump(&a, &b).is_empty());
    assert_eq!(a.manager.list_usable_channels().len(), 1);
    assert_eq!(a.manager.list_channels()[0].counterparty_features, InitFeatures::known());

    let payment_hash = PaymentPreimage([6; 32]).payment_hash();
    a.manager
        .send_payment(&route_to(&b, short_channel_id, 1_000_000), payment_hash, None)
        .unwrap();
}

#[test]
fn test_unclaimed_payment_fails_back_near_expiry() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let payment_hash = PaymentPreimage([2; 32]).payment_hash();

    a.manager
        .send_payment(&route_to(&b, short_channel_id, 1_000_000), payment_hash, None)
        .unwrap();
    pump(&a, &b);
    b.manager.process_pending_htlc_forwards();
    b.manager.get_and_clear_pending_events();

    // Final CLTV is START_HEIGHT + 2 + 40
    let height = START_HEIGHT + 2 + 40 - HTLC_FAIL_BACK_BUFFER + 1;
    b.manager.block_connected(&test_header(height), &[], height);
    pump(&a, &b);
    let events = a.manager.get_and_clear_pending_events();
    assert!(matches!(events.as_slice(), [Event::PaymentFailed { .. }]));
    assert!(!b.manager.claim_funds(PaymentPreimage([2; 32]), None, 1_000_000));
}

#[test]
fn test_update_timestamps_increase() {
    let a = node(1);
    let first = a.manager.next_update_timestamp();
    let second = a.manager.next_update_timestamp();
    assert!(second > first);
}

#[test]
fn test_claimed_payment_hash_replay_rejected() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let preimage = PaymentPreimage([11; 32]);
    let payment_hash = preimage.payment_hash();
    let route = route_to(&b, short_channel_id, 3_000_000);

    a.manager.send_payment(&route, payment_hash, None).unwrap();
    pump(&a, &b);
    b.manager.process_pending_htlc_forwards();
    b.manager.get_and_clear_pending_events();
    assert!(b.manager.claim_funds(preimage, None, 3_000_000));
    assert!(pump(&a, &b).is_empty());
    a.manager.get_and_clear_pending_events();

    // Same hash again: the payee must not offer it up a second time
    a.manager.send_payment(&route, payment_hash, None).unwrap();
    pump(&a, &b);
    b.manager.process_pending_htlc_forwards();
    let events = b.manager.get_and_clear_pending_events();
    assert!(
        !events.iter().any(|e| matches!(e, Event::PaymentReceived { .. })),
        "replayed HTLC surfaced as a new payment: {events:?}"
    );
    assert!(pump(&a, &b).is_empty());
    assert_eq!(
        a.manager.get_and_clear_pending_events(),
        vec![Event::PaymentFailed {
            payment_hash,
            rejected_by_dest: true,
        }]
    );
    assert!(!b.manager.claim_funds(preimage, None, 3_000_000));
}

#[test]
fn test_claimed_payment_hashes_pruned_after_expiry() {
    let a = node(1);
    let b = node(2);
    let (_, short_channel_id) = open_channel(&a, &b, 100_000, 0);
    let preimage = PaymentPreimage([12; 32]);

    a.manager
        .send_payment(&route_to(&b, short_channel_id, 1_000_000), preimage.payment_hash(), None)
        .unwrap();
    pump(&a, &b);
    b.manager.process_pending_htlc_forwards();
    b.manager.get_and_clear_pending_events();
    assert!(b.manager.claim_funds(preimage, None, 1_000_000));
    pump(&a, &b);

    let expiry = b.manager.lock_state().claimed_payment_hashes[&preimage.payment_hash()];
    b.manager.block_connected(&test_header(expiry), &[], expiry);
    assert!(b.manager.lock_state().claimed_payment_hashes.contains_key(&preimage.payment_hash()));

    b.manager.block_connected(&test_header(expiry + 1), &[], expiry + 1);
    assert!(b.manager.lock_state().claimed_payment_hashes.is_empty());
}
