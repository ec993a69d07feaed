use super::*;
use crate::msgs::{
    AcceptChannel, AnnouncementSignatures, ChannelAnnouncement, ChannelReestablish, ChannelUpdate, ClosingSigned,
    CommitmentSigned, FundingCreated, FundingLocked, FundingSigned, HTLCFailChannelUpdate, NodeAnnouncement,
    OpenChannel, QueryChannelRange, ReplyChannelRange, RevokeAndACK, Shutdown, UnsignedChannelUpdate,
    UpdateAddHTLC, UpdateFailHTLC, UpdateFailMalformedHTLC, UpdateFee, UpdateFulfillHTLC,
};
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::ecdsa::Signature;
use std::sync::atomic::AtomicUsize;
use thunder_crypto::secp256k1::Secp256k1;

#[derive(Clone)]
struct TestDescriptor {
    fd: u16,
    outbound_data: Arc<Mutex<Vec<u8>>>,
    disconnected: Arc<AtomicBool>,
    /// Bytes the socket still takes, unlimited when `None`
    room: Arc<Mutex<Option<usize>>>,
}

impl TestDescriptor {
    fn new(fd: u16) -> Self {
        Self {
            fd,
            outbound_data: Arc::new(Mutex::new(Vec::new())),
            disconnected: Arc::new(AtomicBool::new(false)),
            room: Arc::new(Mutex::new(None)),
        }
    }

    fn limit(&self, room: Option<usize>) {
        *self.room.lock().unwrap() = room;
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound_data.lock().unwrap())
    }
}

impl PartialEq for TestDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.fd == other.fd
    }
}

impl Eq for TestDescriptor {}

impl Hash for TestDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fd.hash(state);
    }
}

impl SocketDescriptor for TestDescriptor {
    fn send_data(&mut self, data: &[u8], _resume_read: bool) -> usize {
        let mut room = self.room.lock().unwrap();
        let taken = room.map_or(data.len(), |left| left.min(data.len()));
        if let Some(left) = room.as_mut() {
            *left -= taken;
        }
        self.outbound_data.lock().unwrap().extend_from_slice(&data[..taken]);
        taken
    }

    fn disconnect_socket(&mut self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct TestChannelHandler {
    pending_events: Mutex<Vec<MessageSendEvent>>,
    connected: Mutex<Vec<PublicKey>>,
    disconnected: Mutex<Vec<(PublicKey, bool)>>,
    errors: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl MessageSendEventsProvider for TestChannelHandler {
    fn get_and_clear_pending_msg_events(&self) -> Vec<MessageSendEvent> {
        std::mem::take(&mut *self.pending_events.lock().unwrap())
    }
}

impl ChannelMessageHandler for TestChannelHandler {
    fn handle_open_channel(&self, _: &PublicKey, _: InitFeatures, _: &OpenChannel) {}
    fn handle_accept_channel(&self, _: &PublicKey, _: InitFeatures, _: &AcceptChannel) {}
    fn handle_funding_created(&self, _: &PublicKey, _: &FundingCreated) {}
    fn handle_funding_signed(&self, _: &PublicKey, _: &FundingSigned) {}
    fn handle_funding_locked(&self, _: &PublicKey, _: &FundingLocked) {}
    fn handle_shutdown(&self, _: &PublicKey, _: &Shutdown) {
        self.shutdowns.fetch_add(1, Ordering::AcqRel);
    }
    fn handle_closing_signed(&self, _: &PublicKey, _: &ClosingSigned) {}
    fn handle_update_add_htlc(&self, _: &PublicKey, _: &UpdateAddHTLC) {}
    fn handle_update_fulfill_htlc(&self, _: &PublicKey, _: &UpdateFulfillHTLC) {}
    fn handle_update_fail_htlc(&self, _: &PublicKey, _: &UpdateFailHTLC) {}
    fn handle_update_fail_malformed_htlc(&self, _: &PublicKey, _: &UpdateFailMalformedHTLC) {}
    fn handle_commitment_signed(&self, _: &PublicKey, _: &CommitmentSigned) {}
    fn handle_revoke_and_ack(&self, _: &PublicKey, _: &RevokeAndACK) {}
    fn handle_update_fee(&self, _: &PublicKey, _: &UpdateFee) {}
    fn handle_announcement_signatures(&self, _: &PublicKey, _: &AnnouncementSignatures) {}
    fn handle_channel_reestablish(&self, _: &PublicKey, _: &ChannelReestablish) {}

    fn peer_disconnected(&self, their_node_id: &PublicKey, no_connection_possible: bool) {
        self.disconnected
            .lock()
            .unwrap()
            .push((*their_node_id, no_connection_possible));
    }

    fn peer_connected(&self, their_node_id: &PublicKey, _: &Init) {
        self.connected.lock().unwrap().push(*their_node_id);
    }

    fn handle_error(&self, _: &PublicKey, _: &ErrorMessage) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct TestRoutingHandler {
    request_full_sync: bool,
    updates: AtomicUsize,
}

impl RoutingMessageHandler for TestRoutingHandler {
    fn handle_node_announcement(&self, _: &NodeAnnouncement) -> Result<bool, LightningError> {
        Ok(true)
    }

    fn handle_channel_announcement(&self, _: &ChannelAnnouncement) -> Result<bool, LightningError> {
        Ok(true)
    }

    fn handle_channel_update(&self, msg: &ChannelUpdate) -> Result<bool, LightningError> {
        self.updates.fetch_add(1, Ordering::AcqRel);
        if msg.contents.timestamp == 0 {
            return Err(LightningError::ignore("stale"));
        }
        Ok(true)
    }

    fn handle_htlc_fail_channel_update(&self, _: &HTLCFailChannelUpdate) {}

    fn get_next_channel_announcements(
        &self,
        _: u64,
        _: u8,
    ) -> Vec<(ChannelAnnouncement, Option<ChannelUpdate>, Option<ChannelUpdate>)> {
        Vec::new()
    }

    fn get_next_node_announcements(&self, _: Option<&PublicKey>, _: u8) -> Vec<NodeAnnouncement> {
        Vec::new()
    }

    fn should_request_full_sync(&self, _: &PublicKey) -> bool {
        self.request_full_sync
    }

    fn handle_query_channel_range(
        &self,
        _: &PublicKey,
        _: &QueryChannelRange,
    ) -> Result<Vec<ReplyChannelRange>, LightningError> {
        Ok(Vec::new())
    }
}

struct Node {
    manager: PeerManager<TestDescriptor>,
    chan: Arc<TestChannelHandler>,
    route: Arc<TestRoutingHandler>,
    node_id: PublicKey,
}

fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fn node(byte: u8) -> Node {
    let chan = Arc::new(TestChannelHandler::default());
    let route = Arc::new(TestRoutingHandler::default());
    let handler = MessageHandler {
        chan_handler: Arc::clone(&chan) as Arc<dyn ChannelMessageHandler>,
        route_handler: Arc::clone(&route) as Arc<dyn RoutingMessageHandler>,
    };
    let node_secret = secret(byte);
    Node {
        manager: PeerManager::new(handler, node_secret, &[byte.wrapping_add(100); 32]),
        chan,
        route,
        node_id: PublicKey::from_secret_key(&Secp256k1::new(), &node_secret),
    }
}

/// Shuttle bytes both ways until neither side has anything left to say
fn exchange(a: &Node, a_desc: &mut TestDescriptor, b: &Node, b_desc: &mut TestDescriptor) {
    for _ in 0..20 {
        let to_b = a_desc.take();
        let to_a = b_desc.take();
        if to_a.is_empty() && to_b.is_empty() {
            return;
        }
        if !to_b.is_empty() {
            b.manager.read_event(b_desc, &to_b).unwrap();
        }
        if !to_a.is_empty() {
            a.manager.read_event(a_desc, &to_a).unwrap();
        }
    }
    panic!("peers never went quiet");
}

/// `a` connects to `b`; both sides finish init
fn connect(a: &Node, b: &Node, fd: u16) -> (TestDescriptor, TestDescriptor) {
    let mut a_desc = TestDescriptor::new(fd);
    let mut b_desc = TestDescriptor::new(fd + 1000);
    let act_one = a.manager.new_outbound_connection(b.node_id, a_desc.clone()).unwrap();
    b.manager.new_inbound_connection(b_desc.clone()).unwrap();
    b.manager.read_event(&mut b_desc, &act_one).unwrap();
    exchange(a, &mut a_desc, b, &mut b_desc);
    (a_desc, b_desc)
}

fn channel_update(timestamp: u32) -> ChannelUpdate {
    ChannelUpdate {
        signature: Signature::from_compact(&[1u8; 64]).unwrap(),
        contents: UnsignedChannelUpdate {
            chain_hash: ChainHash::TESTNET,
            short_channel_id: 42,
            timestamp,
            message_flags: 0,
            channel_flags: 0,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 0,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
            htlc_maximum_msat: None,
            excess_data: Vec::new(),
        },
    }
}

/// A raw session that has finished the handshake with `b`, for sending
/// hand-picked bytes
fn raw_session(b: &Node, fd: u16) -> (PeerSession, TestDescriptor) {
    let (mut session, act_one) = PeerSession::new_outbound(secret(77), b.node_id, secret(78)).unwrap();
    let mut b_desc = TestDescriptor::new(fd);
    b.manager.new_inbound_connection(b_desc.clone()).unwrap();
    b.manager.read_event(&mut b_desc, &act_one).unwrap();
    let events = session.read(&b_desc.take()).unwrap();
    let SessionEvent::Act(act_three) = &events[0] else {
        panic!("expected act three");
    };
    b.manager.read_event(&mut b_desc, act_three).unwrap();
    (session, b_desc)
}

#[test]
fn test_handshake_and_init_connect_both_sides() {
    let (a, b) = (node(1), node(2));
    let _descriptors = connect(&a, &b, 1);
    assert_eq!(a.manager.get_peer_node_ids(), vec![b.node_id]);
    assert_eq!(b.manager.get_peer_node_ids(), vec![a.node_id]);
    assert_eq!(*a.chan.connected.lock().unwrap(), vec![b.node_id]);
    assert_eq!(*b.chan.connected.lock().unwrap(), vec![a.node_id]);
}

#[test]
fn test_initial_sync_requested_when_routing_handler_asks() {
    let a = node(1);
    let mut b = node(2);
    b.route = Arc::new(TestRoutingHandler {
        request_full_sync: true,
        ..TestRoutingHandler::default()
    });
    b.manager = PeerManager::new(
        MessageHandler {
            chan_handler: Arc::clone(&b.chan) as Arc<dyn ChannelMessageHandler>,
            route_handler: Arc::clone(&b.route) as Arc<dyn RoutingMessageHandler>,
        },
        secret(2),
        &[9; 32],
    );
    let _descriptors = connect(&b, &a, 1);
    let holder = a.manager.lock_peers();
    let peer = holder.peers.values().next().unwrap();
    assert!(peer.their_features.as_ref().unwrap().initial_routing_sync());
    assert_eq!(peer.sync_status, InitSyncTracker::NoSyncRequested);
}

#[test]
fn test_duplicate_connection_is_rejected() {
    let (a, b) = (node(1), node(2));
    let _first = connect(&a, &b, 1);

    let mut second = TestDescriptor::new(2);
    let act_one = a.manager.new_outbound_connection(b.node_id, second.clone()).unwrap();
    let mut b_second = TestDescriptor::new(1002);
    b.manager.new_inbound_connection(b_second.clone()).unwrap();
    b.manager.read_event(&mut b_second, &act_one).unwrap();
    // Completing the handshake on a's side collides with the live connection
    assert!(a.manager.read_event(&mut second, &b_second.take()).is_err());
    assert_eq!(a.manager.get_peer_node_ids(), vec![b.node_id]);
    assert!(a.chan.disconnected.lock().unwrap().is_empty());
}

#[test]
fn test_ping_is_answered_and_missing_pong_disconnects() {
    let (a, b) = (node(1), node(2));
    let (mut a_desc, mut b_desc) = connect(&a, &b, 1);

    a.manager.timer_tick_occurred();
    exchange(&a, &mut a_desc, &b, &mut b_desc);
    // The pong came back, so the next tick pings again instead of dropping b
    a.manager.timer_tick_occurred();
    assert!(!a_desc.disconnected.load(Ordering::Acquire));

    // b never delivers this ping's pong
    a_desc.take();
    a.manager.timer_tick_occurred();
    assert!(a_desc.disconnected.load(Ordering::Acquire));
    assert!(a.manager.get_peer_node_ids().is_empty());
    assert_eq!(*a.chan.disconnected.lock().unwrap(), vec![(b.node_id, false)]);
}

#[test]
fn test_oversized_ponglen_gets_no_reply() {
    let b = node(2);
    let (mut session, mut b_desc) = raw_session(&b, 5);
    let init = wire::encode_msg(types::Init, &Init { features: InitFeatures::known() });
    b.manager.read_event(&mut b_desc, &session.encrypt(&init).unwrap()).unwrap();
    b_desc.take();

    let ping = wire::encode_msg(types::Ping, &Ping { ponglen: MAX_PONGLEN, byteslen: 0 });
    b.manager.read_event(&mut b_desc, &session.encrypt(&ping).unwrap()).unwrap();
    assert!(b_desc.take().is_empty());
}

#[test]
fn test_message_before_init_disconnects() {
    let b = node(2);
    let (mut session, mut b_desc) = raw_session(&b, 5);
    let ping = wire::encode_msg(types::Ping, &Ping { ponglen: 4, byteslen: 0 });
    assert!(b.manager.read_event(&mut b_desc, &session.encrypt(&ping).unwrap()).is_err());
    assert!(b.manager.get_peer_node_ids().is_empty());
    // Never initialized, so the channel handler never heard of it
    assert!(b.chan.disconnected.lock().unwrap().is_empty());
}

#[test]
fn test_init_with_unknown_required_feature_is_permanent() {
    let b = node(2);
    let (mut session, mut b_desc) = raw_session(&b, 5);
    let features = InitFeatures::known().with(100);
    let init = wire::encode_msg(types::Init, &Init { features });
    let err = b
        .manager
        .read_event(&mut b_desc, &session.encrypt(&init).unwrap())
        .unwrap_err();
    assert!(err.no_connection_possible);
}

#[test]
fn test_unknown_message_types() {
    let b = node(2);
    let (mut session, mut b_desc) = raw_session(&b, 5);
    let init = wire::encode_msg(types::Init, &Init { features: InitFeatures::known() });
    b.manager.read_event(&mut b_desc, &session.encrypt(&init).unwrap()).unwrap();

    let odd = 32_769u16.to_be_bytes();
    b.manager.read_event(&mut b_desc, &session.encrypt(&odd).unwrap()).unwrap();
    assert_eq!(b.manager.get_peer_node_ids().len(), 1);

    let even = 32_768u16.to_be_bytes();
    assert!(b.manager.read_event(&mut b_desc, &session.encrypt(&even).unwrap()).is_err());
    assert!(b.manager.get_peer_node_ids().is_empty());
    assert_eq!(b.chan.disconnected.lock().unwrap().len(), 1);
}

#[test]
fn test_error_for_all_channels_disconnects() {
    let (a, b) = (node(1), node(2));
    let (mut a_desc, mut b_desc) = connect(&a, &b, 1);
    a.chan.pending_events.lock().unwrap().push(MessageSendEvent::HandleError {
        node_id: b.node_id,
        action: ErrorAction::SendErrorMessage {
            msg: ErrorMessage {
                channel_id: ChannelId::ALL,
                data: "bye".into(),
            },
        },
    });
    a.manager.process_events();
    assert!(b.manager.read_event(&mut b_desc, &a_desc.take()).is_err());
    assert_eq!(b.chan.errors.load(Ordering::Acquire), 1);
    assert_eq!(*b.chan.disconnected.lock().unwrap(), vec![(a.node_id, false)]);
}

#[test]
fn test_channel_messages_reach_the_handler() {
    let (a, b) = (node(1), node(2));
    let (mut a_desc, mut b_desc) = connect(&a, &b, 1);
    a.chan.pending_events.lock().unwrap().push(MessageSendEvent::SendShutdown {
        node_id: b.node_id,
        msg: Shutdown {
            channel_id: ChannelId([7; 32]),
            scriptpubkey: vec![0; 22],
        },
    });
    a.manager.process_events();
    exchange(&a, &mut a_desc, &b, &mut b_desc);
    assert_eq!(b.chan.shutdowns.load(Ordering::Acquire), 1);
}

#[test]
fn test_close_connection_action_drops_peer() {
    let (a, b) = (node(1), node(2));
    let (a_desc, _b_desc) = connect(&a, &b, 1);
    a.chan.pending_events.lock().unwrap().push(MessageSendEvent::HandleError {
        node_id: b.node_id,
        action: ErrorAction::CloseConnection { msg: None },
    });
    a.manager.process_events();
    assert!(a_desc.disconnected.load(Ordering::Acquire));
    assert!(a.manager.get_peer_node_ids().is_empty());
}

fn shutdown_then_close(a: &Node, b: &Node) {
    let mut events = a.chan.pending_events.lock().unwrap();
    events.push(MessageSendEvent::SendShutdown {
        node_id: b.node_id,
        msg: Shutdown {
            channel_id: ChannelId([7; 32]),
            scriptpubkey: vec![0; 22],
        },
    });
    events.push(MessageSendEvent::HandleError {
        node_id: b.node_id,
        action: ErrorAction::CloseConnection {
            msg: Some(ErrorMessage {
                channel_id: ChannelId([7; 32]),
                data: "bad signature".into(),
            }),
        },
    });
}

#[test]
fn test_close_connection_error_follows_queued_frames() {
    let (a, b) = (node(1), node(2));
    let (a_desc, mut b_desc) = connect(&a, &b, 1);
    shutdown_then_close(&a, &b);
    a.manager.process_events();

    assert!(a_desc.disconnected.load(Ordering::Acquire));
    b.manager.read_event(&mut b_desc, &a_desc.take()).unwrap();
    assert_eq!(b.chan.shutdowns.load(Ordering::Acquire), 1);
    assert_eq!(b.chan.errors.load(Ordering::Acquire), 1);
}

#[test]
fn test_close_connection_stops_at_short_write() {
    let (a, b) = (node(1), node(2));
    let (a_desc, _b_desc) = connect(&a, &b, 1);
    a_desc.limit(Some(10));
    shutdown_then_close(&a, &b);
    a.manager.process_events();

    assert!(a_desc.disconnected.load(Ordering::Acquire));
    assert_eq!(a_desc.take().len(), 10);
    assert!(a.manager.get_peer_node_ids().is_empty());
}

#[test]
fn test_socket_disconnected_notifies_once() {
    let (a, b) = (node(1), node(2));
    let (a_desc, _b_desc) = connect(&a, &b, 1);
    a.manager.socket_disconnected(&a_desc);
    a.manager.socket_disconnected(&a_desc);
    assert_eq!(*a.chan.disconnected.lock().unwrap(), vec![(b.node_id, false)]);
}

#[test]
fn test_channel_update_broadcast_reaches_peers() {
    let (a, b, c) = (node(1), node(2), node(3));
    let (mut ab, mut ba) = connect(&a, &b, 1);
    let (mut ac, mut ca) = connect(&a, &c, 2);

    a.chan
        .pending_events
        .lock()
        .unwrap()
        .push(MessageSendEvent::BroadcastChannelUpdate { msg: channel_update(5) });
    a.manager.process_events();
    assert_eq!(a.route.updates.load(Ordering::Acquire), 1);

    exchange(&a, &mut ab, &b, &mut ba);
    exchange(&a, &mut ac, &c, &mut ca);
    assert_eq!(b.route.updates.load(Ordering::Acquire), 1);
    assert_eq!(c.route.updates.load(Ordering::Acquire), 1);
}

#[test]
fn test_received_gossip_is_relayed_except_to_origin() {
    let (a, b, c) = (node(1), node(2), node(3));
    let (mut ab, mut ba) = connect(&a, &b, 1);
    let (mut ac, mut ca) = connect(&a, &c, 2);

    b.chan
        .pending_events
        .lock()
        .unwrap()
        .push(MessageSendEvent::BroadcastChannelUpdate { msg: channel_update(5) });
    b.manager.process_events();
    a.manager.read_event(&mut ab, &ba.take()).unwrap();
    assert_eq!(a.route.updates.load(Ordering::Acquire), 1);
    // Nothing goes back to b
    assert!(ab.take().is_empty());

    exchange(&a, &mut ac, &c, &mut ca);
    assert_eq!(c.route.updates.load(Ordering::Acquire), 1);
}

#[test]
fn test_rejected_gossip_is_not_relayed() {
    let (a, b, c) = (node(1), node(2), node(3));
    let (mut ab, _ba) = connect(&a, &b, 1);
    let (ac, _ca) = connect(&a, &c, 2);

    let stale = wire::encode_msg(types::ChannelUpdate, &channel_update(0));
    let encrypted = {
        let mut holder = b.manager.lock_peers();
        let peer = holder.peers.values_mut().next().unwrap();
        peer.session.encrypt(&stale).unwrap()
    };
    a.manager.read_event(&mut ab, &encrypted).unwrap();
    assert_eq!(a.route.updates.load(Ordering::Acquire), 1);
    assert!(ac.take().is_empty());
    assert_eq!(a.manager.get_peer_node_ids().len(), 2);
}
