//! Fuzz target for onion peeling
//!
//! Garbage packets must be rejected without panicking, and an onion built
//! for a fuzzed route must peel back into exactly the payloads it was built
//! from.

#![no_main]

use arbitrary::Arbitrary;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use libfuzzer_sys::fuzz_target;
use thunder_core::PaymentHash;
use thunder_core::features::{ChannelFeatures, NodeFeatures};
use thunder_core::msgs::{ONION_HOP_DATA_SIZE, OnionPacket};
use thunder_core::onion::{build_onion_packet, build_onion_payloads, construct_onion_keys, peel_onion_packet};
use thunder_core::route::RouteHop;

#[derive(Debug, Arbitrary)]
struct OnionInput {
    public_key: [u8; 33],
    hop_data: Vec<u8>,
    hmac: [u8; 32],
    hops: Vec<(u32, u16, bool)>,
    amount_msat: u32,
}

fn node_secret(i: usize) -> SecretKey {
    let mut bytes = [0x42u8; 32];
    bytes[31] = u8::try_from(i + 1).unwrap_or(u8::MAX);
    SecretKey::from_slice(&bytes).unwrap()
}

fuzz_target!(|input: OnionInput| {
    let payment_hash = PaymentHash([0x11; 32]);

    let mut hop_data = [0u8; ONION_HOP_DATA_SIZE];
    let len = input.hop_data.len().min(ONION_HOP_DATA_SIZE);
    hop_data[..len].copy_from_slice(&input.hop_data[..len]);
    let garbage = OnionPacket {
        version: 0,
        public_key: input.public_key,
        hop_data,
        hmac: input.hmac,
    };
    let _ = peel_onion_packet(&node_secret(0), &garbage, &payment_hash);

    if input.hops.is_empty() || input.hops.len() > 20 || input.amount_msat == 0 {
        return;
    }
    let secp = Secp256k1::signing_only();
    let last = input.hops.len() - 1;
    let path: Vec<RouteHop> = input
        .hops
        .iter()
        .enumerate()
        .map(|(i, &(fee, cltv, tlv))| RouteHop {
            pubkey: PublicKey::from_secret_key(&secp, &node_secret(i)),
            node_features: if tlv { NodeFeatures::known() } else { NodeFeatures::empty() },
            short_channel_id: i as u64 + 1,
            channel_features: ChannelFeatures::empty(),
            fee_msat: if i == last { u64::from(input.amount_msat) } else { u64::from(fee) },
            cltv_expiry_delta: u32::from(cltv),
        })
        .collect();

    let session_priv = SecretKey::from_slice(&[0x77; 32]).unwrap();
    let Ok(keys) = construct_onion_keys(&path, &session_priv) else {
        return;
    };
    let Ok((payloads, _, _)) = build_onion_payloads(&path, u64::from(input.amount_msat), None, 700_000) else {
        return;
    };
    let Ok(mut packet) = build_onion_packet(&payloads, &keys, &session_priv, &payment_hash) else {
        return;
    };

    for (i, expected) in payloads.iter().enumerate() {
        let peeled = peel_onion_packet(&node_secret(i), &packet, &payment_hash).unwrap();
        assert_eq!(&peeled.payload, expected);
        match peeled.next_packet {
            Some(next) => packet = next,
            None => {
                assert_eq!(i, last);
                return;
            }
        }
    }
    panic!("onion did not terminate at the payee");
});
