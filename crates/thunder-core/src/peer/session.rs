//! One connection's encryption: the three handshake acts, then
//! length-prefixed encrypted frames.
//!
//! ```text
//! handshake:   act one (50) | act two (50) | act three (66)
//! established: [enc len (18)][enc body (len + 16)] ...
//! ```
//!
//! Bytes arrive in arbitrary chunks; [`PeerSession::read`] buffers them and
//! yields every complete act or frame.

use crate::error::PeerHandleError;
use thunder_crypto::TAG_SIZE;
use thunder_crypto::noise::{HandshakePhase, LENGTH_HEADER_SIZE, NoiseHandshake, NoiseTransport};
use thunder_crypto::secp256k1::{PublicKey, SecretKey};
use tracing::{debug, trace};

const fn disconnect() -> PeerHandleError {
    PeerHandleError {
        no_connection_possible: false,
    }
}

/// Something [`PeerSession::read`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    /// A handshake act to send back
    Act(Vec<u8>),
    /// The handshake finished; the remote is authenticated
    Established(PublicKey),
    /// A decrypted message
    Message(Vec<u8>),
}

/// Noise state and read framing for one connection
pub(crate) struct PeerSession {
    handshake: Option<NoiseHandshake>,
    transport: Option<NoiseTransport>,
    their_node_id: Option<PublicKey>,
    read_buf: Vec<u8>,
    pending_body_len: Option<usize>,
}

impl PeerSession {
    /// Start a connection we initiate; returns the session and act one
    pub(crate) fn new_outbound(
        our_node_secret: SecretKey,
        their_node_id: PublicKey,
        ephemeral: SecretKey,
    ) -> Result<(Self, Vec<u8>), PeerHandleError> {
        let mut handshake = NoiseHandshake::new_initiator(our_node_secret, their_node_id, ephemeral);
        let act_one = handshake.write_act_one().map_err(|e| {
            debug!(error = %e, "failed to start handshake");
            disconnect()
        })?;
        let session = Self {
            handshake: Some(handshake),
            transport: None,
            their_node_id: Some(their_node_id),
            read_buf: Vec::new(),
            pending_body_len: None,
        };
        Ok((session, act_one.to_vec()))
    }

    /// Wait for a remote's act one
    pub(crate) fn new_inbound(our_node_secret: SecretKey, ephemeral: SecretKey) -> Self {
        Self {
            handshake: Some(NoiseHandshake::new_responder(our_node_secret, ephemeral)),
            transport: None,
            their_node_id: None,
            read_buf: Vec::new(),
            pending_body_len: None,
        }
    }

    pub(crate) fn is_established(&self) -> bool {
        self.transport.is_some()
    }

    /// Known from the start for outbound connections, after act three for
    /// inbound ones
    pub(crate) fn their_node_id(&self) -> Option<PublicKey> {
        self.their_node_id
    }

    /// Feed received bytes in
    pub(crate) fn read(&mut self, data: &[u8]) -> Result<Vec<SessionEvent>, PeerHandleError> {
        self.read_buf.extend_from_slice(data);
        let mut events = Vec::new();
        let mut consumed = 0;
        loop {
            let available = &self.read_buf[consumed..];
            if let Some(handshake) = self.handshake.as_mut() {
                let Some(needed) = handshake.expected_act_size() else {
                    return Err(disconnect());
                };
                if available.len() < needed {
                    break;
                }
                let act = &available[..needed];
                consumed += needed;
                match handshake.phase() {
                    HandshakePhase::ResponderAwaitingActOne => {
                        let act_two = handshake.read_act_one(act).map_err(|e| {
                            debug!(error = %e, "bad act one");
                            disconnect()
                        })?;
                        events.push(SessionEvent::Act(act_two.to_vec()));
                    }
                    HandshakePhase::InitiatorAwaitingActTwo => {
                        let (act_three, transport) = handshake.read_act_two(act).map_err(|e| {
                            debug!(error = %e, "bad act two");
                            disconnect()
                        })?;
                        events.push(SessionEvent::Act(act_three.to_vec()));
                        let their_node_id = self.their_node_id.ok_or_else(disconnect)?;
                        self.handshake = None;
                        self.transport = Some(transport);
                        events.push(SessionEvent::Established(their_node_id));
                    }
                    HandshakePhase::ResponderAwaitingActThree => {
                        let (their_node_id, transport) = handshake.read_act_three(act).map_err(|e| {
                            debug!(error = %e, "bad act three");
                            disconnect()
                        })?;
                        self.handshake = None;
                        self.transport = Some(transport);
                        self.their_node_id = Some(their_node_id);
                        events.push(SessionEvent::Established(their_node_id));
                    }
                    HandshakePhase::InitiatorStarting | HandshakePhase::Complete => return Err(disconnect()),
                }
                continue;
            }

            let Some(transport) = self.transport.as_mut() else {
                return Err(disconnect());
            };
            match self.pending_body_len {
                None => {
                    if available.len() < LENGTH_HEADER_SIZE {
                        break;
                    }
                    let len = transport
                        .decrypt_length_header(&available[..LENGTH_HEADER_SIZE])
                        .map_err(|e| {
                            debug!(error = %e, "bad length header");
                            disconnect()
                        })?;
                    consumed += LENGTH_HEADER_SIZE;
                    self.pending_body_len = Some(usize::from(len) + TAG_SIZE);
                }
                Some(body_len) => {
                    if available.len() < body_len {
                        break;
                    }
                    let msg = transport.decrypt_message(&available[..body_len]).map_err(|e| {
                        debug!(error = %e, "bad message body");
                        disconnect()
                    })?;
                    consumed += body_len;
                    self.pending_body_len = None;
                    trace!(len = msg.len(), "decrypted message");
                    events.push(SessionEvent::Message(msg));
                }
            }
        }
        self.read_buf.drain(..consumed);
        Ok(events)
    }

    /// Encrypt one message for sending
    pub(crate) fn encrypt(&mut self, msg: &[u8]) -> Result<Vec<u8>, PeerHandleError> {
        let transport = self.transport.as_mut().ok_or_else(disconnect)?;
        transport.encrypt_message(msg).map_err(|e| {
            debug!(error = %e, "failed to encrypt message");
            disconnect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thunder_crypto::secp256k1::Secp256k1;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn established_pair() -> (PeerSession, PeerSession) {
        let secp = Secp256k1::new();
        let responder_id = PublicKey::from_secret_key(&secp, &key(2));
        let (mut initiator, act_one) = PeerSession::new_outbound(key(1), responder_id, key(3)).unwrap();
        let mut responder = PeerSession::new_inbound(key(2), key(4));

        let act_two = match responder.read(&act_one).unwrap().as_slice() {
            [SessionEvent::Act(act)] => act.clone(),
            other => panic!("unexpected {other:?}"),
        };
        let events = initiator.read(&act_two).unwrap();
        assert_eq!(events.len(), 2);
        let SessionEvent::Act(act_three) = &events[0] else {
            panic!("expected act three");
        };
        assert_eq!(events[1], SessionEvent::Established(responder_id));

        let events = responder.read(act_three).unwrap();
        let initiator_id = PublicKey::from_secret_key(&secp, &key(1));
        assert_eq!(events, vec![SessionEvent::Established(initiator_id)]);
        (initiator, responder)
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (initiator, responder) = established_pair();
        assert!(initiator.is_established());
        assert!(responder.is_established());
        assert!(responder.their_node_id().is_some());
    }

    #[test]
    fn test_messages_survive_byte_by_byte_delivery() {
        let (mut initiator, mut responder) = established_pair();
        let mut wire = initiator.encrypt(b"first").unwrap();
        wire.extend(initiator.encrypt(b"second").unwrap());

        let mut received = Vec::new();
        for byte in wire {
            received.extend(responder.read(&[byte]).unwrap());
        }
        assert_eq!(
            received,
            vec![
                SessionEvent::Message(b"first".to_vec()),
                SessionEvent::Message(b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn test_split_act_one_is_buffered() {
        let secp = Secp256k1::new();
        let responder_id = PublicKey::from_secret_key(&secp, &key(2));
        let (_, act_one) = PeerSession::new_outbound(key(1), responder_id, key(3)).unwrap();
        let mut responder = PeerSession::new_inbound(key(2), key(4));
        assert!(responder.read(&act_one[..20]).unwrap().is_empty());
        assert_eq!(responder.read(&act_one[20..]).unwrap().len(), 1);
    }

    #[test]
    fn test_act_one_for_another_node_fails() {
        let secp = Secp256k1::new();
        let wrong_id = PublicKey::from_secret_key(&secp, &key(9));
        let (_, act_one) = PeerSession::new_outbound(key(1), wrong_id, key(3)).unwrap();
        let mut responder = PeerSession::new_inbound(key(2), key(4));
        assert!(responder.read(&act_one).is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let (mut initiator, mut responder) = established_pair();
        let mut wire = initiator.encrypt(b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert!(responder.read(&wire).is_err());
    }

    #[test]
    fn test_encrypt_before_handshake_fails() {
        let mut responder = PeerSession::new_inbound(key(2), key(4));
        assert!(responder.encrypt(b"early").is_err());
    }
}
