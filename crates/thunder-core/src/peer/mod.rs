//! Peer connections: encryption, framing, message dispatch and gossip relay.
//!
//! The embedder owns the sockets. It hands each one to the
//! [`PeerManager`] as a [`SocketDescriptor`], feeds received bytes to
//! [`PeerManager::read_event`] and calls [`PeerManager::process_events`]
//! whenever handlers may have queued messages.
//!
//! ```text
//!   socket bytes --read_event--> PeerSession --wire::read--> handlers
//!   handlers --MessageSendEvent--> process_events --encrypt--> send_data
//! ```
//!
//! Each connection moves through `handshake -> awaiting init -> established`
//! and is forgotten on disconnect. `init` must be the first message after
//! the handshake.

mod session;

use crate::error::{DecodeError, ErrorAction, LightningError, PeerHandleError};
use crate::events::{MessageSendEvent, MessageSendEventsProvider};
use crate::features::InitFeatures;
use crate::msgs::{ChannelMessageHandler, ErrorMessage, Init, Ping, Pong, RoutingMessageHandler};
use crate::ser::Writeable;
use crate::types::ChannelId;
use crate::wire::{self, Message, types};
use session::{PeerSession, SessionEvent};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thunder_crypto::hash::sha256_concat;
use thunder_crypto::secp256k1::{PublicKey, SecretKey};
use tracing::{debug, info, trace, warn};

/// Stop reading from a peer with this many messages waiting to be sent
const OUTBOUND_BUFFER_LIMIT_READ_PAUSE: usize = 10;

/// Skip gossip relay to a peer with this many messages waiting
const OUTBOUND_BUFFER_LIMIT_DROP_GOSSIP: usize = 20;

/// A `ping` asking for this many bytes or more gets no `pong`
const MAX_PONGLEN: u16 = 65532;

/// Padding we put in our own pings
const PING_BYTESLEN: u16 = 64;

/// A connected socket as the embedder sees it
pub trait SocketDescriptor: Eq + Hash + Clone {
    /// Write as much of `data` as the socket accepts right now and return
    /// how many bytes that was. When fewer than `data.len()` bytes were
    /// taken the embedder calls [`PeerManager::write_buffer_space_avail`]
    /// once the socket drains. `resume_read` asks to resume reading if it
    /// was paused.
    fn send_data(&mut self, data: &[u8], resume_read: bool) -> usize;

    /// Close the socket. [`PeerManager::socket_disconnected`] need not be
    /// called afterwards.
    fn disconnect_socket(&mut self);
}

/// The handlers a [`PeerManager`] dispatches to
pub struct MessageHandler {
    /// Channel messages, usually the `ChannelManager`
    pub chan_handler: Arc<dyn ChannelMessageHandler>,
    /// Gossip, usually the routing crate's graph handler
    pub route_handler: Arc<dyn RoutingMessageHandler>,
}

/// Progress of streaming our gossip to a peer that asked for a full sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitSyncTracker {
    NoSyncRequested,
    ChannelsSyncing(u64),
    NodesSyncing(Option<PublicKey>),
}

struct Peer {
    session: PeerSession,
    outbound: bool,
    their_features: Option<InitFeatures>,

    pending_outbound_buffer: VecDeque<Vec<u8>>,
    pending_outbound_buffer_first_msg_offset: usize,
    awaiting_write_event: bool,

    sync_status: InitSyncTracker,
    awaiting_pong: bool,
}

impl Peer {
    fn new(session: PeerSession, outbound: bool) -> Self {
        Self {
            session,
            outbound,
            their_features: None,
            pending_outbound_buffer: VecDeque::new(),
            pending_outbound_buffer_first_msg_offset: 0,
            awaiting_write_event: false,
            sync_status: InitSyncTracker::NoSyncRequested,
            awaiting_pong: false,
        }
    }

    /// Past the handshake and `init`
    fn is_initialized(&self) -> bool {
        self.their_features.is_some()
    }

    fn enqueue_raw(&mut self, plaintext: &[u8]) {
        match self.session.encrypt(plaintext) {
            Ok(encrypted) => self.pending_outbound_buffer.push_back(encrypted),
            Err(_) => warn!(len = plaintext.len(), "dropping message that could not be encrypted"),
        }
    }

    fn enqueue<M: Writeable>(&mut self, type_id: u16, msg: &M) {
        self.enqueue_raw(&wire::encode_msg(type_id, msg));
    }
}

struct PeerHolder<D: SocketDescriptor> {
    peers: HashMap<D, Peer>,
    node_id_to_descriptor: HashMap<PublicKey, D>,
}

/// Relay `plaintext` to every initialized peer not excluded and not
/// backlogged
fn broadcast<D: SocketDescriptor>(holder: &mut PeerHolder<D>, plaintext: &[u8], exclude: &[PublicKey]) {
    for peer in holder.peers.values_mut() {
        if !peer.is_initialized() {
            continue;
        }
        if peer
            .session
            .their_node_id()
            .is_some_and(|node_id| exclude.contains(&node_id))
        {
            continue;
        }
        if peer.pending_outbound_buffer.len() > OUTBOUND_BUFFER_LIMIT_DROP_GOSSIP {
            trace!(peer = ?peer.session.their_node_id(), "skipping gossip to backlogged peer");
            continue;
        }
        peer.enqueue_raw(plaintext);
    }
}

const fn disconnect(no_connection_possible: bool) -> PeerHandleError {
    PeerHandleError { no_connection_possible }
}

/// Drives every peer connection
pub struct PeerManager<D: SocketDescriptor> {
    message_handler: MessageHandler,
    peers: Mutex<PeerHolder<D>>,
    our_node_secret: SecretKey,
    ephemeral_random_data: [u8; 32],
    peer_counter: AtomicU64,
    events_in_progress: AtomicBool,
    events_rerun: AtomicBool,
}

impl<D: SocketDescriptor> PeerManager<D> {
    /// `ephemeral_random_data` seeds the per-connection handshake keys and
    /// must be fresh randomness
    pub fn new(message_handler: MessageHandler, our_node_secret: SecretKey, ephemeral_random_data: &[u8; 32]) -> Self {
        Self {
            message_handler,
            peers: Mutex::new(PeerHolder {
                peers: HashMap::new(),
                node_id_to_descriptor: HashMap::new(),
            }),
            our_node_secret,
            ephemeral_random_data: *ephemeral_random_data,
            peer_counter: AtomicU64::new(0),
            events_in_progress: AtomicBool::new(false),
            events_rerun: AtomicBool::new(false),
        }
    }

    fn lock_peers(&self) -> MutexGuard<'_, PeerHolder<D>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_ephemeral_key(&self) -> Result<SecretKey, PeerHandleError> {
        let counter = self.peer_counter.fetch_add(1, Ordering::AcqRel);
        let bytes = sha256_concat(&[&self.ephemeral_random_data, &counter.to_be_bytes()]);
        SecretKey::from_slice(&bytes).map_err(|_| disconnect(false))
    }

    /// Node ids of peers that completed the handshake and `init`
    pub fn get_peer_node_ids(&self) -> Vec<PublicKey> {
        self.lock_peers()
            .peers
            .values()
            .filter(|peer| peer.is_initialized())
            .filter_map(|peer| peer.session.their_node_id())
            .collect()
    }

    /// Register a connection we opened to `their_node_id`. The returned act
    /// one must be written to the socket first.
    ///
    /// # Errors
    ///
    /// [`PeerHandleError`] if the descriptor is already registered.
    pub fn new_outbound_connection(&self, their_node_id: PublicKey, descriptor: D) -> Result<Vec<u8>, PeerHandleError> {
        let (session, act_one) = PeerSession::new_outbound(self.our_node_secret, their_node_id, self.get_ephemeral_key()?)?;
        let mut holder = self.lock_peers();
        if holder.peers.contains_key(&descriptor) {
            return Err(disconnect(false));
        }
        debug!(peer = %their_node_id, "new outbound connection");
        holder.peers.insert(descriptor, Peer::new(session, true));
        Ok(act_one)
    }

    /// Register a connection the remote opened
    ///
    /// # Errors
    ///
    /// [`PeerHandleError`] if the descriptor is already registered.
    pub fn new_inbound_connection(&self, descriptor: D) -> Result<(), PeerHandleError> {
        let session = PeerSession::new_inbound(self.our_node_secret, self.get_ephemeral_key()?);
        let mut holder = self.lock_peers();
        if holder.peers.contains_key(&descriptor) {
            return Err(disconnect(false));
        }
        debug!("new inbound connection");
        holder.peers.insert(descriptor, Peer::new(session, false));
        Ok(())
    }

    /// The socket accepts writes again
    ///
    /// # Errors
    ///
    /// [`PeerHandleError`] for an unknown descriptor.
    pub fn write_buffer_space_avail(&self, descriptor: &mut D) -> Result<(), PeerHandleError> {
        let mut holder = self.lock_peers();
        let peer = holder.peers.get_mut(descriptor).ok_or(disconnect(false))?;
        peer.awaiting_write_event = false;
        self.do_attempt_write_data(descriptor, peer);
        Ok(())
    }

    /// Bytes arrived. Returns true if reading should pause until
    /// [`SocketDescriptor::send_data`] is called with `resume_read`.
    ///
    /// # Errors
    ///
    /// On error the peer is already forgotten; close the socket without
    /// calling [`Self::socket_disconnected`].
    pub fn read_event(&self, descriptor: &mut D, data: &[u8]) -> Result<bool, PeerHandleError> {
        match self.do_read_event(descriptor, data) {
            Ok(pause_read) => Ok(pause_read),
            Err(e) => {
                self.disconnect_event_internal(descriptor, e.no_connection_possible);
                Err(e)
            }
        }
    }

    fn do_read_event(&self, descriptor: &mut D, data: &[u8]) -> Result<bool, PeerHandleError> {
        let mut guard = self.lock_peers();
        let holder = &mut *guard;
        let peer = holder.peers.get_mut(descriptor).ok_or(disconnect(false))?;
        let events = peer.session.read(data)?;

        let mut relay = Vec::new();
        let mut result = Ok(());
        for event in events {
            match event {
                SessionEvent::Act(act) => peer.pending_outbound_buffer.push_back(act),
                SessionEvent::Established(their_node_id) => {
                    if holder.node_id_to_descriptor.contains_key(&their_node_id) {
                        debug!(peer = %their_node_id, "already connected, dropping duplicate connection");
                        result = Err(disconnect(false));
                        break;
                    }
                    holder.node_id_to_descriptor.insert(their_node_id, descriptor.clone());
                    info!(peer = %their_node_id, outbound = peer.outbound, "handshake complete");
                    if peer.outbound {
                        self.send_init(peer, &their_node_id);
                    }
                }
                SessionEvent::Message(bytes) => match self.handle_message(peer, &bytes) {
                    Ok(Some(gossip)) => relay.push(gossip),
                    Ok(None) => {}
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                },
            }
        }
        self.do_attempt_write_data(descriptor, peer);
        let pause_read = peer.pending_outbound_buffer.len() > OUTBOUND_BUFFER_LIMIT_READ_PAUSE;
        let origin = peer.session.their_node_id();
        result?;

        if !relay.is_empty() {
            let exclude: Vec<PublicKey> = origin.into_iter().collect();
            for gossip in relay {
                broadcast(holder, &gossip, &exclude);
            }
            for (descriptor, peer) in &mut holder.peers {
                let mut descriptor = descriptor.clone();
                self.do_attempt_write_data(&mut descriptor, peer);
            }
        }
        Ok(pause_read)
    }

    fn send_init(&self, peer: &mut Peer, their_node_id: &PublicKey) {
        let mut features = InitFeatures::known();
        if self.message_handler.route_handler.should_request_full_sync(their_node_id) {
            features.set_initial_routing_sync();
        }
        peer.enqueue(types::Init, &Init { features });
    }

    /// Dispatch one decrypted message. Returns gossip to relay to the other
    /// peers.
    fn handle_message(&self, peer: &mut Peer, bytes: &[u8]) -> Result<Option<Vec<u8>>, PeerHandleError> {
        let their_node_id = peer.session.their_node_id().ok_or(disconnect(false))?;
        let message = match wire::read(bytes) {
            Ok(message) => message,
            Err(DecodeError::UnknownRequiredFeature) => {
                debug!(peer = %their_node_id, "unknown even message type, disconnecting");
                return Err(disconnect(false));
            }
            Err(e) => {
                debug!(peer = %their_node_id, error = %e, "undecodable message, disconnecting");
                return Err(disconnect(false));
            }
        };
        trace!(peer = %their_node_id, type_id = message.type_id(), "received message");

        let Some(their_features) = peer.their_features.clone() else {
            let Message::Init(init) = message else {
                debug!(peer = %their_node_id, "first message was not init");
                return Err(disconnect(false));
            };
            if init.features.requires_unknown_bits() {
                info!(peer = %their_node_id, "peer requires features we don't know");
                return Err(disconnect(true));
            }
            if !peer.outbound {
                self.send_init(peer, &their_node_id);
            }
            if init.features.initial_routing_sync() {
                peer.sync_status = InitSyncTracker::ChannelsSyncing(0);
            }
            peer.their_features = Some(init.features.clone());
            self.message_handler.chan_handler.peer_connected(&their_node_id, &init);
            return Ok(None);
        };

        let chan = &self.message_handler.chan_handler;
        let route = &self.message_handler.route_handler;
        match message {
            Message::Init(_) => {
                debug!(peer = %their_node_id, "duplicate init");
                return Err(disconnect(false));
            }
            Message::Error(msg) => {
                warn!(peer = %their_node_id, channel_id = %msg.channel_id, data = %msg.data, "peer sent error");
                chan.handle_error(&their_node_id, &msg);
                if msg.channel_id == ChannelId::ALL {
                    return Err(disconnect(false));
                }
            }
            Message::Ping(msg) => {
                if msg.ponglen < MAX_PONGLEN {
                    peer.enqueue(types::Pong, &Pong { byteslen: msg.ponglen });
                }
            }
            Message::Pong(_) => peer.awaiting_pong = false,

            Message::OpenChannel(msg) => chan.handle_open_channel(&their_node_id, their_features, &msg),
            Message::AcceptChannel(msg) => chan.handle_accept_channel(&their_node_id, their_features, &msg),
            Message::FundingCreated(msg) => chan.handle_funding_created(&their_node_id, &msg),
            Message::FundingSigned(msg) => chan.handle_funding_signed(&their_node_id, &msg),
            Message::FundingLocked(msg) => chan.handle_funding_locked(&their_node_id, &msg),
            Message::Shutdown(msg) => chan.handle_shutdown(&their_node_id, &msg),
            Message::ClosingSigned(msg) => chan.handle_closing_signed(&their_node_id, &msg),
            Message::UpdateAddHTLC(msg) => chan.handle_update_add_htlc(&their_node_id, &msg),
            Message::UpdateFulfillHTLC(msg) => chan.handle_update_fulfill_htlc(&their_node_id, &msg),
            Message::UpdateFailHTLC(msg) => chan.handle_update_fail_htlc(&their_node_id, &msg),
            Message::UpdateFailMalformedHTLC(msg) => chan.handle_update_fail_malformed_htlc(&their_node_id, &msg),
            Message::CommitmentSigned(msg) => chan.handle_commitment_signed(&their_node_id, &msg),
            Message::RevokeAndACK(msg) => chan.handle_revoke_and_ack(&their_node_id, &msg),
            Message::UpdateFee(msg) => chan.handle_update_fee(&their_node_id, &msg),
            Message::ChannelReestablish(msg) => chan.handle_channel_reestablish(&their_node_id, &msg),
            Message::AnnouncementSignatures(msg) => chan.handle_announcement_signatures(&their_node_id, &msg),

            Message::ChannelAnnouncement(msg) => {
                return self.gossip_result(peer, route.handle_channel_announcement(&msg), || {
                    wire::encode_msg(types::ChannelAnnouncement, &msg)
                });
            }
            Message::NodeAnnouncement(msg) => {
                return self.gossip_result(peer, route.handle_node_announcement(&msg), || {
                    wire::encode_msg(types::NodeAnnouncement, &msg)
                });
            }
            Message::ChannelUpdate(msg) => {
                return self.gossip_result(peer, route.handle_channel_update(&msg), || {
                    wire::encode_msg(types::ChannelUpdate, &msg)
                });
            }
            Message::QueryChannelRange(msg) => match route.handle_query_channel_range(&their_node_id, &msg) {
                Ok(replies) => {
                    for reply in &replies {
                        peer.enqueue(types::ReplyChannelRange, reply);
                    }
                }
                Err(e) => self.handle_lightning_error(peer, e)?,
            },
            Message::ReplyChannelRange(msg) => {
                debug!(peer = %their_node_id, channels = msg.short_channel_ids.len(), "ignoring reply_channel_range");
            }
            Message::Unknown(type_id) => trace!(peer = %their_node_id, type_id, "ignoring unknown odd message"),
        }
        Ok(None)
    }

    fn gossip_result(
        &self,
        peer: &mut Peer,
        result: Result<bool, LightningError>,
        encode: impl FnOnce() -> Vec<u8>,
    ) -> Result<Option<Vec<u8>>, PeerHandleError> {
        match result {
            Ok(true) => Ok(Some(encode())),
            Ok(false) => Ok(None),
            Err(e) => {
                self.handle_lightning_error(peer, e)?;
                Ok(None)
            }
        }
    }

    fn handle_lightning_error(&self, peer: &mut Peer, e: LightningError) -> Result<(), PeerHandleError> {
        let their_node_id = peer.session.their_node_id();
        match e.action {
            ErrorAction::IgnoreError => {
                debug!(peer = ?their_node_id, error = %e.err, "ignoring message");
                Ok(())
            }
            ErrorAction::SendErrorMessage { msg } => {
                debug!(peer = ?their_node_id, error = %e.err, "sending error message");
                peer.enqueue(types::Error, &msg);
                Ok(())
            }
            ErrorAction::CloseConnection { msg } => {
                debug!(peer = ?their_node_id, error = %e.err, "closing connection");
                if let Some(msg) = msg {
                    peer.enqueue(types::Error, &msg);
                }
                Err(disconnect(false))
            }
        }
    }

    /// Top the buffer up with initial sync gossip, then write as much as
    /// the socket takes
    fn do_attempt_write_data(&self, descriptor: &mut D, peer: &mut Peer) {
        while !peer.awaiting_write_event {
            if peer.is_initialized() && peer.pending_outbound_buffer.len() < OUTBOUND_BUFFER_LIMIT_READ_PAUSE {
                self.fill_sync_gossip(peer);
            }
            let Some(next) = peer.pending_outbound_buffer.front() else {
                return;
            };
            let resume_read = peer.pending_outbound_buffer.len() < OUTBOUND_BUFFER_LIMIT_READ_PAUSE;
            let offset = peer.pending_outbound_buffer_first_msg_offset;
            let written = descriptor.send_data(&next[offset..], resume_read);
            let total = next.len();
            peer.pending_outbound_buffer_first_msg_offset += written;
            if peer.pending_outbound_buffer_first_msg_offset == total {
                peer.pending_outbound_buffer_first_msg_offset = 0;
                peer.pending_outbound_buffer.pop_front();
            } else {
                peer.awaiting_write_event = true;
            }
        }
    }

    fn fill_sync_gossip(&self, peer: &mut Peer) {
        let route = &self.message_handler.route_handler;
        let room = OUTBOUND_BUFFER_LIMIT_READ_PAUSE - peer.pending_outbound_buffer.len();
        let steps = u8::try_from(room).unwrap_or(u8::MAX);
        match peer.sync_status {
            InitSyncTracker::NoSyncRequested => {}
            InitSyncTracker::ChannelsSyncing(start) => {
                let batch = route.get_next_channel_announcements(start, steps);
                let mut next = start;
                for (announcement, update_1, update_2) in &batch {
                    peer.enqueue(types::ChannelAnnouncement, announcement);
                    for update in [update_1, update_2].into_iter().flatten() {
                        peer.enqueue(types::ChannelUpdate, update);
                    }
                    next = announcement.contents.short_channel_id.saturating_add(1);
                }
                peer.sync_status = if batch.len() < usize::from(steps) {
                    InitSyncTracker::NodesSyncing(None)
                } else {
                    InitSyncTracker::ChannelsSyncing(next)
                };
            }
            InitSyncTracker::NodesSyncing(start) => {
                let batch = route.get_next_node_announcements(start.as_ref(), steps);
                for announcement in &batch {
                    peer.enqueue(types::NodeAnnouncement, announcement);
                }
                peer.sync_status = match batch.last() {
                    Some(last) if batch.len() >= usize::from(steps) => {
                        InitSyncTracker::NodesSyncing(Some(last.contents.node_id))
                    }
                    _ => {
                        trace!(peer = ?peer.session.their_node_id(), "initial gossip sync complete");
                        InitSyncTracker::NoSyncRequested
                    }
                };
            }
        }
    }

    /// Send everything the handlers queued. Concurrent callers coalesce
    /// into one extra pass by whoever is already running.
    pub fn process_events(&self) {
        loop {
            if self.events_in_progress.swap(true, Ordering::AcqRel) {
                self.events_rerun.store(true, Ordering::Release);
                return;
            }
            self.events_rerun.store(false, Ordering::Release);
            self.do_process_events();
            self.events_in_progress.store(false, Ordering::Release);
            if !self.events_rerun.swap(false, Ordering::AcqRel) {
                return;
            }
        }
    }

    fn do_process_events(&self) {
        let events = self.message_handler.chan_handler.get_and_clear_pending_msg_events();
        let route = &self.message_handler.route_handler;
        let mut guard = self.lock_peers();
        let holder = &mut *guard;

        for event in events {
            match event {
                MessageSendEvent::SendAcceptChannel { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::AcceptChannel, &msg);
                }
                MessageSendEvent::SendOpenChannel { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::OpenChannel, &msg);
                }
                MessageSendEvent::SendFundingCreated { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::FundingCreated, &msg);
                }
                MessageSendEvent::SendFundingSigned { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::FundingSigned, &msg);
                }
                MessageSendEvent::SendFundingLocked { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::FundingLocked, &msg);
                }
                MessageSendEvent::SendAnnouncementSignatures { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::AnnouncementSignatures, &msg);
                }
                MessageSendEvent::SendRevokeAndACK { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::RevokeAndACK, &msg);
                }
                MessageSendEvent::SendClosingSigned { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::ClosingSigned, &msg);
                }
                MessageSendEvent::SendShutdown { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::Shutdown, &msg);
                }
                MessageSendEvent::SendChannelReestablish { node_id, msg } => {
                    Self::send_to(holder, &node_id, types::ChannelReestablish, &msg);
                }
                MessageSendEvent::UpdateHTLCs { node_id, updates } => {
                    let Some(peer) = Self::initialized_peer(holder, &node_id) else {
                        continue;
                    };
                    for msg in &updates.update_add_htlcs {
                        peer.enqueue(types::UpdateAddHTLC, msg);
                    }
                    for msg in &updates.update_fulfill_htlcs {
                        peer.enqueue(types::UpdateFulfillHTLC, msg);
                    }
                    for msg in &updates.update_fail_htlcs {
                        peer.enqueue(types::UpdateFailHTLC, msg);
                    }
                    for msg in &updates.update_fail_malformed_htlcs {
                        peer.enqueue(types::UpdateFailMalformedHTLC, msg);
                    }
                    if let Some(msg) = &updates.update_fee {
                        peer.enqueue(types::UpdateFee, msg);
                    }
                    peer.enqueue(types::CommitmentSigned, &updates.commitment_signed);
                }
                MessageSendEvent::BroadcastChannelAnnouncement { msg, update_msg } => {
                    if route.handle_channel_announcement(&msg).is_ok() && route.handle_channel_update(&update_msg).is_ok() {
                        let exclude = [msg.contents.node_id_1, msg.contents.node_id_2];
                        broadcast(holder, &wire::encode_msg(types::ChannelAnnouncement, &msg), &exclude);
                        broadcast(holder, &wire::encode_msg(types::ChannelUpdate, &update_msg), &exclude);
                    }
                }
                MessageSendEvent::BroadcastNodeAnnouncement { msg } => {
                    if route.handle_node_announcement(&msg).is_ok() {
                        broadcast(holder, &wire::encode_msg(types::NodeAnnouncement, &msg), &[]);
                    }
                }
                MessageSendEvent::BroadcastChannelUpdate { msg } => {
                    if route.handle_channel_update(&msg).is_ok() {
                        broadcast(holder, &wire::encode_msg(types::ChannelUpdate, &msg), &[]);
                    }
                }
                MessageSendEvent::PaymentFailureNetworkUpdate { update } => {
                    route.handle_htlc_fail_channel_update(&update);
                }
                MessageSendEvent::HandleError { node_id, action } => match action {
                    ErrorAction::IgnoreError => {}
                    ErrorAction::SendErrorMessage { msg } => {
                        Self::send_to(holder, &node_id, types::Error, &msg);
                    }
                    ErrorAction::CloseConnection { msg } => self.close_connection(holder, &node_id, msg.as_ref()),
                },
            }
        }

        for (descriptor, peer) in &mut holder.peers {
            let mut descriptor = descriptor.clone();
            self.do_attempt_write_data(&mut descriptor, peer);
        }
    }

    fn initialized_peer<'a>(holder: &'a mut PeerHolder<D>, node_id: &PublicKey) -> Option<&'a mut Peer> {
        let descriptor = holder.node_id_to_descriptor.get(node_id)?;
        let peer = holder.peers.get_mut(descriptor)?;
        if peer.is_initialized() {
            Some(peer)
        } else {
            trace!(peer = %node_id, "dropping message for peer that is not ready");
            None
        }
    }

    fn send_to<M: Writeable>(holder: &mut PeerHolder<D>, node_id: &PublicKey, type_id: u16, msg: &M) {
        if let Some(peer) = Self::initialized_peer(holder, node_id) {
            peer.enqueue(type_id, msg);
        }
    }

    fn close_connection(&self, holder: &mut PeerHolder<D>, node_id: &PublicKey, msg: Option<&ErrorMessage>) {
        let Some(mut descriptor) = holder.node_id_to_descriptor.remove(node_id) else {
            return;
        };
        let Some(mut peer) = holder.peers.remove(&descriptor) else {
            return;
        };
        if let Some(msg) = msg {
            // Best effort, behind whatever is still queued: frames carry
            // consecutive nonces and must leave in order
            peer.enqueue(types::Error, msg);
            if !peer.awaiting_write_event {
                let mut offset = peer.pending_outbound_buffer_first_msg_offset;
                for frame in &peer.pending_outbound_buffer {
                    let remaining = &frame[offset..];
                    if descriptor.send_data(remaining, false) < remaining.len() {
                        break;
                    }
                    offset = 0;
                }
            }
        }
        info!(peer = %node_id, "disconnecting peer");
        descriptor.disconnect_socket();
        if peer.is_initialized() {
            self.message_handler.chan_handler.peer_disconnected(node_id, false);
        }
    }

    /// The socket closed. Does nothing for descriptors already forgotten.
    pub fn socket_disconnected(&self, descriptor: &D) {
        self.disconnect_event_internal(descriptor, false);
    }

    fn disconnect_event_internal(&self, descriptor: &D, no_connection_possible: bool) {
        let mut holder = self.lock_peers();
        let Some(peer) = holder.peers.remove(descriptor) else {
            return;
        };
        let Some(node_id) = peer.session.their_node_id() else {
            return;
        };
        if holder.node_id_to_descriptor.get(&node_id) == Some(descriptor) {
            holder.node_id_to_descriptor.remove(&node_id);
        }
        debug!(peer = %node_id, no_connection_possible, "peer disconnected");
        if peer.is_initialized() {
            self.message_handler
                .chan_handler
                .peer_disconnected(&node_id, no_connection_possible);
        }
    }

    /// Ping every peer, disconnecting those that never answered the last
    /// one. Call every 30 seconds or so.
    pub fn timer_tick_occurred(&self) {
        let mut guard = self.lock_peers();
        let holder = &mut *guard;
        let mut unresponsive = Vec::new();
        for (descriptor, peer) in &mut holder.peers {
            if !peer.is_initialized() {
                continue;
            }
            if peer.awaiting_pong {
                unresponsive.push(descriptor.clone());
                continue;
            }
            peer.awaiting_pong = true;
            peer.enqueue(
                types::Ping,
                &Ping {
                    ponglen: 0,
                    byteslen: PING_BYTESLEN,
                },
            );
            let mut descriptor = descriptor.clone();
            self.do_attempt_write_data(&mut descriptor, peer);
        }

        for mut descriptor in unresponsive {
            let Some(peer) = holder.peers.remove(&descriptor) else {
                continue;
            };
            descriptor.disconnect_socket();
            if let Some(node_id) = peer.session.their_node_id() {
                holder.node_id_to_descriptor.remove(&node_id);
                info!(peer = %node_id, "peer did not answer ping, disconnecting");
                self.message_handler.chan_handler.peer_disconnected(&node_id, false);
            }
        }
    }
}

#[cfg(test)]
mod tests;
