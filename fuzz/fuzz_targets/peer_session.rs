//! Fuzz target for an established peer session
//!
//! Completes a real handshake with the peer manager, then sends fuzzed
//! message bodies through the encrypted transport. Whatever arrives, the
//! peer manager must answer or disconnect without panicking.

#![no_main]

use arbitrary::Arbitrary;
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use libfuzzer_sys::fuzz_target;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use thunder_core::events::{MessageSendEvent, MessageSendEventsProvider};
use thunder_core::features::InitFeatures;
use thunder_core::msgs::*;
use thunder_core::peer::{MessageHandler, PeerManager, SocketDescriptor};
use thunder_core::wire::{self, Message};
use thunder_crypto::noise::NoiseHandshake;
use thunder_routing::NetGraphMsgHandler;

#[derive(Debug, Arbitrary)]
struct SessionInput {
    feature_bits: Vec<u8>,
    messages: Vec<Vec<u8>>,
}

#[derive(Clone)]
struct Descriptor(Arc<Mutex<Vec<u8>>>);

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl SocketDescriptor for Descriptor {
    fn send_data(&mut self, data: &[u8], _resume_read: bool) -> usize {
        self.0.lock().unwrap().extend_from_slice(data);
        data.len()
    }

    fn disconnect_socket(&mut self) {}
}

struct NoChannels;

impl MessageSendEventsProvider for NoChannels {
    fn get_and_clear_pending_msg_events(&self) -> Vec<MessageSendEvent> {
        Vec::new()
    }
}

impl ChannelMessageHandler for NoChannels {
    fn handle_open_channel(&self, _: &PublicKey, _: InitFeatures, _: &OpenChannel) {}
    fn handle_accept_channel(&self, _: &PublicKey, _: InitFeatures, _: &AcceptChannel) {}
    fn handle_funding_created(&self, _: &PublicKey, _: &FundingCreated) {}
    fn handle_funding_signed(&self, _: &PublicKey, _: &FundingSigned) {}
    fn handle_funding_locked(&self, _: &PublicKey, _: &FundingLocked) {}
    fn handle_shutdown(&self, _: &PublicKey, _: &Shutdown) {}
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
    fn peer_disconnected(&self, _: &PublicKey, _: bool) {}
    fn peer_connected(&self, _: &PublicKey, _: &Init) {}
    fn handle_error(&self, _: &PublicKey, _: &ErrorMessage) {}
}

fn key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fuzz_target!(|input: SessionInput| {
    let secp = Secp256k1::signing_only();
    let our_secret = key(0x21);
    let handler = MessageHandler {
        chan_handler: Arc::new(NoChannels),
        route_handler: Arc::new(NetGraphMsgHandler::new(ChainHash::TESTNET, None)),
    };
    let manager = PeerManager::new(handler, our_secret, &[0x33; 32]);

    let outbound = Arc::new(Mutex::new(Vec::new()));
    let mut descriptor = Descriptor(outbound.clone());
    manager.new_inbound_connection(descriptor.clone()).unwrap();

    let mut initiator =
        NoiseHandshake::new_initiator(key(0x11), PublicKey::from_secret_key(&secp, &our_secret), key(0x12));
    let act_one = initiator.write_act_one().unwrap();
    manager.read_event(&mut descriptor, &act_one).unwrap();
    let act_two = std::mem::take(&mut *outbound.lock().unwrap());
    let (act_three, mut transport) = initiator.read_act_two(&act_two).unwrap();
    manager.read_event(&mut descriptor, &act_three).unwrap();

    let mut features = InitFeatures::empty();
    for bit in input.feature_bits {
        features.set(usize::from(bit % 64));
    }
    let init = wire::write(&Message::Init(Init { features }));
    let mut frames = vec![init];
    frames.extend(input.messages);
    for frame in frames {
        let Ok(packet) = transport.encrypt_message(&frame) else {
            continue;
        };
        if manager.read_event(&mut descriptor, &packet).is_err() {
            return;
        }
        manager.process_events();
        outbound.lock().unwrap().clear();
    }
});
