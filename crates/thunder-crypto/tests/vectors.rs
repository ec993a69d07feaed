//! Cryptographic test vectors from the Lightning BOLTs.
//!
//! This module contains test vectors from:
//! - BOLT-8 (transport handshake and first message)
//! - BOLT-3 Appendix D (per-commitment secret generation)
//!
//! These vectors ensure our implementations match the protocol exactly.

use thunder_crypto::noise::{LENGTH_HEADER_SIZE, NoiseHandshake};
use thunder_crypto::secp256k1::{PublicKey, Secp256k1, SecretKey};
use thunder_crypto::shachain::build_commitment_secret;

fn decode_hex(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

// ============================================================================
// BOLT-8 Transport Vectors
// ============================================================================

const ACT_ONE: &str = "00036360e856310ce5d294e8be33fc807077dc56ac80d95d9cd4ddbd21325eff73f70df6086551151f58b8afe6c195782c6a";
const ACT_TWO: &str = "0002466d7fcae563e5cb09a0d1870bb580344804617879a14949cf22285f1bae3f276e2470b93aac583c9ef6eafca3f730ae";
const ACT_THREE: &str = "00b9e3a702e93e3a9948c2ed6e5fd7590a6e1c3a0344cfc9d5b57357049aa22355361aa02e55a8fc28fef5bd6d71ad0c38228dc68b1c466263b47fdf31e560e139ba";

#[test]
fn test_bolt8_responder_static_key() {
    let secp = Secp256k1::new();
    let rs = PublicKey::from_secret_key(&secp, &secret(0x21));
    assert_eq!(
        hex::encode(rs.serialize()),
        "028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7"
    );
}

#[test]
fn test_bolt8_initiator_acts() {
    let secp = Secp256k1::new();
    let rs = PublicKey::from_secret_key(&secp, &secret(0x21));
    let mut initiator = NoiseHandshake::new_initiator(secret(0x11), rs, secret(0x12));

    let act_one = initiator.write_act_one().unwrap();
    assert_eq!(hex::encode(act_one), ACT_ONE);

    let (act_three, _) = initiator.read_act_two(&decode_hex(ACT_TWO)).unwrap();
    assert_eq!(hex::encode(act_three), ACT_THREE);
}

#[test]
fn test_bolt8_responder_acts() {
    let secp = Secp256k1::new();
    let mut responder = NoiseHandshake::new_responder(secret(0x21), secret(0x22));

    let act_two = responder.read_act_one(&decode_hex(ACT_ONE)).unwrap();
    assert_eq!(hex::encode(act_two), ACT_TWO);

    let (remote, _) = responder.read_act_three(&decode_hex(ACT_THREE)).unwrap();
    assert_eq!(remote, PublicKey::from_secret_key(&secp, &secret(0x11)));
}

#[test]
fn test_bolt8_first_message() {
    let secp = Secp256k1::new();
    let rs = PublicKey::from_secret_key(&secp, &secret(0x21));
    let mut initiator = NoiseHandshake::new_initiator(secret(0x11), rs, secret(0x12));
    initiator.write_act_one().unwrap();
    let (_, mut transport) = initiator.read_act_two(&decode_hex(ACT_TWO)).unwrap();

    let wire = transport.encrypt_message(b"hello").unwrap();
    assert_eq!(
        hex::encode(&wire),
        "cf2b30ddf0cf3f80e7c35a6e6730b59fe802473180f396d88a8fb0db8cbcf25d2f214cf9ea1d95"
    );
    assert_eq!(wire.len(), LENGTH_HEADER_SIZE + 5 + 16);
}

#[test]
fn test_bolt8_act_two_bad_mac() {
    let secp = Secp256k1::new();
    let rs = PublicKey::from_secret_key(&secp, &secret(0x21));
    let mut initiator = NoiseHandshake::new_initiator(secret(0x11), rs, secret(0x12));
    initiator.write_act_one().unwrap();

    let mut act_two = decode_hex(ACT_TWO);
    act_two[49] ^= 0x01;
    assert!(initiator.read_act_two(&act_two).is_err());
}

// ============================================================================
// BOLT-3 Per-Commitment Secret Generation
// ============================================================================

#[test]
fn test_bolt3_generate_ff_seed_alternating() {
    let secret = build_commitment_secret(&[0xff; 32], 0xaaa_aaaa_aaaa);
    assert_eq!(
        hex::encode(secret),
        "56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528"
    );
}

#[test]
fn test_bolt3_generate_lowest_index() {
    let secret = build_commitment_secret(&[0x01; 32], 1);
    assert_eq!(
        hex::encode(secret),
        "915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c"
    );
}
