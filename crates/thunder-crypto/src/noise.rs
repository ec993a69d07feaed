//! BOLT-8 `Noise_XK_secp256k1_ChaChaPoly_SHA256` handshake and transport.
//!
//! The initiator knows the responder's static key in advance. Three acts
//! authenticate both sides and derive a pair of transport keys:
//!
//! ```text
//! Initiator                                   Responder
//!   act one   (50 bytes)  e, es          ──────────▶
//!             ◀──────────  act two   (50 bytes)  e, ee
//!   act three (66 bytes)  s, se          ──────────▶
//! ```
//!
//! After the handshake every message is sent as an encrypted 2-byte length
//! (18 bytes with tag) followed by the encrypted body (length + 16 bytes).
//! Each direction rotates its key after 1000 encryptions.

use crate::hash::{hkdf, sha256, sha256_concat};
use crate::{CryptoError, TAG_SIZE, aead};
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

const PROTOCOL_NAME: &[u8] = b"Noise_XK_secp256k1_ChaChaPoly_SHA256";
const PROLOGUE: &[u8] = b"lightning";
const HANDSHAKE_VERSION: u8 = 0;

/// Act one and act two size
pub const ACT_ONE_SIZE: usize = 50;
/// Act two size
pub const ACT_TWO_SIZE: usize = 50;
/// Act three size
pub const ACT_THREE_SIZE: usize = 66;
/// Encrypted length prefix size (2-byte length + tag)
pub const LENGTH_HEADER_SIZE: usize = 2 + TAG_SIZE;
/// Maximum plaintext message length
pub const MAX_MESSAGE_SIZE: usize = 65535;
/// Number of encryptions after which a key is rotated
pub const KEY_ROTATION_INTERVAL: u64 = 1000;

fn ecdh(point: &PublicKey, scalar: &SecretKey) -> [u8; 32] {
    SharedSecret::new(point, scalar).secret_bytes()
}

/// Running chaining key and handshake hash.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
}

impl SymmetricState {
    fn new(responder_static: &PublicKey) -> Self {
        let h = sha256(PROTOCOL_NAME);
        let ck = h;
        let h = sha256_concat(&[&h, PROLOGUE]);
        let h = sha256_concat(&[&h, &responder_static.serialize()]);
        Self { ck, h }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.h = sha256_concat(&[&self.h, data]);
    }

    fn mix_key(&mut self, ikm: &[u8; 32]) -> [u8; 32] {
        let (ck, temp_k) = hkdf(&self.ck, ikm);
        self.ck = ck;
        temp_k
    }
}

/// Handshake phases, named from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: nothing sent yet
    InitiatorStarting,
    /// Initiator: act one sent, awaiting act two
    InitiatorAwaitingActTwo,
    /// Responder: awaiting act one
    ResponderAwaitingActOne,
    /// Responder: act two sent, awaiting act three
    ResponderAwaitingActThree,
    /// Handshake finished, transport keys handed out
    Complete,
}

/// In-progress BOLT-8 handshake.
pub struct NoiseHandshake {
    secp: Secp256k1<All>,
    phase: HandshakePhase,
    state: SymmetricState,
    local_static: SecretKey,
    ephemeral: SecretKey,
    remote_static: Option<PublicKey>,
    temp_k2: [u8; 32],
}

impl NoiseHandshake {
    /// Create a new handshake as the initiator, connecting to `remote_static`.
    #[must_use]
    pub fn new_initiator(
        local_static: SecretKey,
        remote_static: PublicKey,
        ephemeral: SecretKey,
    ) -> Self {
        Self {
            secp: Secp256k1::new(),
            phase: HandshakePhase::InitiatorStarting,
            state: SymmetricState::new(&remote_static),
            local_static,
            ephemeral,
            remote_static: Some(remote_static),
            temp_k2: [0u8; 32],
        }
    }

    /// Create a new handshake as the responder.
    #[must_use]
    pub fn new_responder(local_static: SecretKey, ephemeral: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let our_static = PublicKey::from_secret_key(&secp, &local_static);
        Self {
            secp,
            phase: HandshakePhase::ResponderAwaitingActOne,
            state: SymmetricState::new(&our_static),
            local_static,
            ephemeral,
            remote_static: None,
            temp_k2: [0u8; 32],
        }
    }

    /// Current handshake phase.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// The remote static key, known up front by the initiator and after
    /// act three by the responder.
    #[must_use]
    pub fn remote_static(&self) -> Option<PublicKey> {
        self.remote_static
    }

    /// Expected size of the next inbound act, if one is expected.
    #[must_use]
    pub fn expected_act_size(&self) -> Option<usize> {
        match self.phase {
            HandshakePhase::InitiatorAwaitingActTwo => Some(ACT_TWO_SIZE),
            HandshakePhase::ResponderAwaitingActOne => Some(ACT_ONE_SIZE),
            HandshakePhase::ResponderAwaitingActThree => Some(ACT_THREE_SIZE),
            _ => None,
        }
    }

    fn write_ephemeral_act(
        &mut self,
        remote: &PublicKey,
    ) -> Result<([u8; 50], [u8; 32]), CryptoError> {
        let our_ephemeral = PublicKey::from_secret_key(&self.secp, &self.ephemeral);
        let serialized = our_ephemeral.serialize();
        self.state.mix_hash(&serialized);
        let temp_k = self.state.mix_key(&ecdh(remote, &self.ephemeral));
        let tag = aead::encrypt(&temp_k, 0, &self.state.h, &[])?;
        self.state.mix_hash(&tag);

        let mut act = [0u8; 50];
        act[0] = HANDSHAKE_VERSION;
        act[1..34].copy_from_slice(&serialized);
        act[34..].copy_from_slice(&tag);
        Ok((act, temp_k))
    }

    fn read_ephemeral_act(
        &mut self,
        act: &[u8],
        expected: usize,
        our_key: &SecretKey,
    ) -> Result<(PublicKey, [u8; 32]), CryptoError> {
        if act.len() != expected {
            return Err(CryptoError::InvalidActLength {
                expected,
                actual: act.len(),
            });
        }
        if act[0] != HANDSHAKE_VERSION {
            return Err(CryptoError::UnknownVersion(act[0]));
        }
        let remote_ephemeral =
            PublicKey::from_slice(&act[1..34]).map_err(|_| CryptoError::InvalidPublicKey)?;
        self.state.mix_hash(&act[1..34]);
        let temp_k = self.state.mix_key(&ecdh(&remote_ephemeral, our_key));
        aead::decrypt(&temp_k, 0, &self.state.h, &act[34..])?;
        self.state.mix_hash(&act[34..]);
        Ok((remote_ephemeral, temp_k))
    }

    /// Initiator: produce act one.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if called out of order.
    pub fn write_act_one(&mut self) -> Result<[u8; ACT_ONE_SIZE], CryptoError> {
        if self.phase != HandshakePhase::InitiatorStarting {
            return Err(CryptoError::InvalidState);
        }
        let remote = self.remote_static.ok_or(CryptoError::InvalidState)?;
        let (act, _) = self.write_ephemeral_act(&remote)?;
        self.phase = HandshakePhase::InitiatorAwaitingActTwo;
        Ok(act)
    }

    /// Responder: consume act one and produce act two.
    ///
    /// # Errors
    ///
    /// Fails on bad length, unknown version, invalid key or MAC.
    pub fn read_act_one(&mut self, act: &[u8]) -> Result<[u8; ACT_TWO_SIZE], CryptoError> {
        if self.phase != HandshakePhase::ResponderAwaitingActOne {
            return Err(CryptoError::InvalidState);
        }
        let local_static = self.local_static;
        let (remote_ephemeral, _) = self.read_ephemeral_act(act, ACT_ONE_SIZE, &local_static)?;

        let (act_two, temp_k2) = self.write_ephemeral_act(&remote_ephemeral)?;
        self.temp_k2 = temp_k2;
        self.phase = HandshakePhase::ResponderAwaitingActThree;
        Ok(act_two)
    }

    /// Initiator: consume act two and produce act three plus the transport.
    ///
    /// # Errors
    ///
    /// Fails on bad length, unknown version, invalid key or MAC.
    pub fn read_act_two(
        &mut self,
        act: &[u8],
    ) -> Result<([u8; ACT_THREE_SIZE], NoiseTransport), CryptoError> {
        if self.phase != HandshakePhase::InitiatorAwaitingActTwo {
            return Err(CryptoError::InvalidState);
        }
        let ephemeral = self.ephemeral;
        let (remote_ephemeral, temp_k2) = self.read_ephemeral_act(act, ACT_TWO_SIZE, &ephemeral)?;

        let our_static = PublicKey::from_secret_key(&self.secp, &self.local_static);
        let encrypted_static = aead::encrypt(&temp_k2, 1, &self.state.h, &our_static.serialize())?;
        self.state.mix_hash(&encrypted_static);
        let temp_k3 = self
            .state
            .mix_key(&ecdh(&remote_ephemeral, &self.local_static));
        let tag = aead::encrypt(&temp_k3, 0, &self.state.h, &[])?;

        let (send_key, recv_key) = hkdf(&self.state.ck, &[]);
        let transport = NoiseTransport::new(self.state.ck, send_key, recv_key);

        let mut act_three = [0u8; ACT_THREE_SIZE];
        act_three[0] = HANDSHAKE_VERSION;
        act_three[1..50].copy_from_slice(&encrypted_static);
        act_three[50..].copy_from_slice(&tag);
        self.phase = HandshakePhase::Complete;
        Ok((act_three, transport))
    }

    /// Responder: consume act three, learning the initiator's static key.
    ///
    /// # Errors
    ///
    /// Fails on bad length, unknown version, invalid key or MAC.
    pub fn read_act_three(
        &mut self,
        act: &[u8],
    ) -> Result<(PublicKey, NoiseTransport), CryptoError> {
        if self.phase != HandshakePhase::ResponderAwaitingActThree {
            return Err(CryptoError::InvalidState);
        }
        if act.len() != ACT_THREE_SIZE {
            return Err(CryptoError::InvalidActLength {
                expected: ACT_THREE_SIZE,
                actual: act.len(),
            });
        }
        if act[0] != HANDSHAKE_VERSION {
            return Err(CryptoError::UnknownVersion(act[0]));
        }
        let encrypted_static = &act[1..50];
        let tag = &act[50..];

        let static_bytes = aead::decrypt(&self.temp_k2, 1, &self.state.h, encrypted_static)?;
        let remote_static =
            PublicKey::from_slice(&static_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        self.state.mix_hash(encrypted_static);
        let temp_k3 = self.state.mix_key(&ecdh(&remote_static, &self.ephemeral));
        aead::decrypt(&temp_k3, 0, &self.state.h, tag)?;

        let (recv_key, send_key) = hkdf(&self.state.ck, &[]);
        self.remote_static = Some(remote_static);
        self.phase = HandshakePhase::Complete;
        Ok((
            remote_static,
            NoiseTransport::new(self.state.ck, send_key, recv_key),
        ))
    }
}

/// Post-handshake encryptor/decryptor for one connection.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NoiseTransport {
    send_key: [u8; 32],
    send_nonce: u64,
    send_ck: [u8; 32],
    recv_key: [u8; 32],
    recv_nonce: u64,
    recv_ck: [u8; 32],
}

impl NoiseTransport {
    fn new(ck: [u8; 32], send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        Self {
            send_key,
            send_nonce: 0,
            send_ck: ck,
            recv_key,
            recv_nonce: 0,
            recv_ck: ck,
        }
    }

    fn rotate(key: &mut [u8; 32], nonce: &mut u64, ck: &mut [u8; 32]) {
        *nonce += 1;
        if *nonce == KEY_ROTATION_INTERVAL {
            let (new_ck, new_key) = hkdf(ck, key);
            *ck = new_ck;
            *key = new_key;
            *nonce = 0;
        }
    }

    /// Encrypt one message: encrypted length header followed by the
    /// encrypted body.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MessageTooLong`] for bodies over 65535 bytes.
    pub fn encrypt_message(&mut self, msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if msg.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::MessageTooLong(msg.len()));
        }
        let mut out = Vec::with_capacity(LENGTH_HEADER_SIZE + msg.len() + TAG_SIZE);

        #[allow(clippy::cast_possible_truncation)]
        let len = (msg.len() as u16).to_be_bytes();
        out.extend_from_slice(&aead::encrypt(&self.send_key, self.send_nonce, &[], &len)?);
        Self::rotate(&mut self.send_key, &mut self.send_nonce, &mut self.send_ck);

        out.extend_from_slice(&aead::encrypt(&self.send_key, self.send_nonce, &[], msg)?);
        Self::rotate(&mut self.send_key, &mut self.send_nonce, &mut self.send_ck);
        Ok(out)
    }

    /// Decrypt an 18-byte length header, returning the body length.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on MAC failure.
    pub fn decrypt_length_header(&mut self, header: &[u8]) -> Result<u16, CryptoError> {
        if header.len() != LENGTH_HEADER_SIZE {
            return Err(CryptoError::InvalidActLength {
                expected: LENGTH_HEADER_SIZE,
                actual: header.len(),
            });
        }
        let plain = aead::decrypt(&self.recv_key, self.recv_nonce, &[], header)?;
        Self::rotate(&mut self.recv_key, &mut self.recv_nonce, &mut self.recv_ck);
        Ok(u16::from_be_bytes([plain[0], plain[1]]))
    }

    /// Decrypt a message body (length + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on MAC failure.
    pub fn decrypt_message(&mut self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plain = aead::decrypt(&self.recv_key, self.recv_nonce, &[], body)?;
        Self::rotate(&mut self.recv_key, &mut self.recv_nonce, &mut self.recv_ck);
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn handshake() -> (NoiseTransport, NoiseTransport, PublicKey) {
        let secp = Secp256k1::new();
        let responder_static = key(0x21);
        let initiator_static = key(0x11);

        let mut initiator = NoiseHandshake::new_initiator(
            initiator_static,
            PublicKey::from_secret_key(&secp, &responder_static),
            key(0x12),
        );
        let mut responder = NoiseHandshake::new_responder(responder_static, key(0x22));

        let act_one = initiator.write_act_one().unwrap();
        let act_two = responder.read_act_one(&act_one).unwrap();
        let (act_three, init_transport) = initiator.read_act_two(&act_two).unwrap();
        let (remote, resp_transport) = responder.read_act_three(&act_three).unwrap();

        assert_eq!(initiator.phase(), HandshakePhase::Complete);
        assert_eq!(responder.phase(), HandshakePhase::Complete);
        (init_transport, resp_transport, remote)
    }

    #[test]
    fn test_handshake_authenticates_initiator() {
        let secp = Secp256k1::new();
        let (_, _, remote) = handshake();
        assert_eq!(remote, PublicKey::from_secret_key(&secp, &key(0x11)));
    }

    #[test]
    fn test_act_sizes() {
        let secp = Secp256k1::new();
        let mut initiator = NoiseHandshake::new_initiator(
            key(1),
            PublicKey::from_secret_key(&secp, &key(2)),
            key(3),
        );
        assert_eq!(initiator.write_act_one().unwrap().len(), ACT_ONE_SIZE);
        assert_eq!(initiator.expected_act_size(), Some(ACT_TWO_SIZE));
    }

    #[test]
    fn test_transport_both_directions() {
        let (mut a, mut b, _) = handshake();

        let wire = a.encrypt_message(b"hello responder").unwrap();
        let len = b.decrypt_length_header(&wire[..LENGTH_HEADER_SIZE]).unwrap();
        assert_eq!(len as usize, 15);
        let body = b.decrypt_message(&wire[LENGTH_HEADER_SIZE..]).unwrap();
        assert_eq!(body, b"hello responder");

        let wire = b.encrypt_message(b"hi").unwrap();
        a.decrypt_length_header(&wire[..LENGTH_HEADER_SIZE]).unwrap();
        assert_eq!(a.decrypt_message(&wire[LENGTH_HEADER_SIZE..]).unwrap(), b"hi");
    }

    #[test]
    fn test_key_rotation_keeps_in_sync() {
        let (mut a, mut b, _) = handshake();
        for i in 0..1002u32 {
            let msg = i.to_be_bytes();
            let wire = a.encrypt_message(&msg).unwrap();
            let len = b.decrypt_length_header(&wire[..LENGTH_HEADER_SIZE]).unwrap();
            assert_eq!(len, 4);
            assert_eq!(b.decrypt_message(&wire[LENGTH_HEADER_SIZE..]).unwrap(), msg);
        }
    }

    #[test]
    fn test_tampered_act_one_rejected() {
        let secp = Secp256k1::new();
        let mut initiator = NoiseHandshake::new_initiator(
            key(1),
            PublicKey::from_secret_key(&secp, &key(2)),
            key(3),
        );
        let mut responder = NoiseHandshake::new_responder(key(2), key(4));
        let mut act_one = initiator.write_act_one().unwrap();
        act_one[49] ^= 1;
        assert!(matches!(
            responder.read_act_one(&act_one),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_responder_key_rejected() {
        let secp = Secp256k1::new();
        let mut initiator = NoiseHandshake::new_initiator(
            key(1),
            PublicKey::from_secret_key(&secp, &key(2)),
            key(3),
        );
        let mut responder = NoiseHandshake::new_responder(key(9), key(4));
        let act_one = initiator.write_act_one().unwrap();
        assert!(responder.read_act_one(&act_one).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut responder = NoiseHandshake::new_responder(key(2), key(4));
        let mut act = [0u8; ACT_ONE_SIZE];
        act[0] = 1;
        assert!(matches!(
            responder.read_act_one(&act),
            Err(CryptoError::UnknownVersion(1))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (mut a, _, _) = handshake();
        let big = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            a.encrypt_message(&big),
            Err(CryptoError::MessageTooLong(_))
        ));
    }
}
