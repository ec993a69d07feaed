//! Two peer managers joined by in-memory byte buffers, so every message
//! goes through the Noise transport and the wire codec.

use super::network::TestNode;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thunder_core::peer::{MessageHandler, PeerManager, SocketDescriptor};
use thunder_core::PeerHandleError;

/// Socket stand-in collecting whatever the peer manager writes
#[derive(Clone)]
pub struct WireDescriptor {
    id: u32,
    outbound: Arc<Mutex<Vec<u8>>>,
    disconnected: Arc<AtomicBool>,
}

impl WireDescriptor {
    fn new(id: u32) -> Self {
        Self {
            id,
            outbound: Arc::new(Mutex::new(Vec::new())),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound.lock().unwrap())
    }

    /// Whether the peer manager closed this socket
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl PartialEq for WireDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WireDescriptor {}

impl Hash for WireDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SocketDescriptor for WireDescriptor {
    fn send_data(&mut self, data: &[u8], _resume_read: bool) -> usize {
        self.outbound.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn disconnect_socket(&mut self) {
        self.disconnected.store(true, Ordering::Release);
    }
}

/// Peer managers for two [`TestNode`]s with a live connection between them
pub struct WirePair {
    /// Peer manager of the connecting node
    pub a: PeerManager<WireDescriptor>,
    /// Peer manager of the accepting node
    pub b: PeerManager<WireDescriptor>,
    /// `a`'s end of the connection
    pub a_desc: WireDescriptor,
    /// `b`'s end of the connection
    pub b_desc: WireDescriptor,
}

fn peer_manager(node: &TestNode, seed: u8) -> PeerManager<WireDescriptor> {
    let handler = MessageHandler {
        chan_handler: node.manager.clone(),
        route_handler: node.router.clone(),
    };
    PeerManager::new(handler, node.node_secret, &[seed; 32])
}

impl WirePair {
    /// Connect `a` to `b` and run the handshake and `init` exchange
    ///
    /// # Errors
    ///
    /// Returns the peer manager's error if either side drops the connection.
    pub fn connect(a: &TestNode, b: &TestNode) -> Result<Self, PeerHandleError> {
        let mut pair = Self {
            a: peer_manager(a, 1),
            b: peer_manager(b, 2),
            a_desc: WireDescriptor::new(1),
            b_desc: WireDescriptor::new(2),
        };
        let act_one = pair.a.new_outbound_connection(b.node_id, pair.a_desc.clone())?;
        pair.b.new_inbound_connection(pair.b_desc.clone())?;
        pair.b.read_event(&mut pair.b_desc, &act_one)?;
        pair.shuttle()?;
        Ok(pair)
    }

    /// Flush both peer managers and move bytes across until neither side
    /// has anything left to say
    ///
    /// # Errors
    ///
    /// Returns the peer manager's error if either side drops the connection.
    ///
    /// # Panics
    ///
    /// Panics if the two sides never go quiet.
    pub fn shuttle(&mut self) -> Result<(), PeerHandleError> {
        for _ in 0..200 {
            self.a.process_events();
            self.b.process_events();
            let to_b = self.a_desc.take();
            let to_a = self.b_desc.take();
            if to_a.is_empty() && to_b.is_empty() {
                return Ok(());
            }
            if !to_b.is_empty() {
                self.b.read_event(&mut self.b_desc, &to_b)?;
            }
            if !to_a.is_empty() {
                self.a.read_event(&mut self.a_desc, &to_a)?;
            }
        }
        panic!("peers never went quiet");
    }
}
