//! Wire codec and transport benchmarks.
//!
//! Run with: `cargo bench -p thunder-core wire`

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use thunder_core::msgs::{ONION_HOP_DATA_SIZE, OnionPacket, UpdateAddHTLC};
use thunder_core::wire::{self, Message};
use thunder_core::{ChannelId, PaymentHash};
use thunder_crypto::noise::NoiseHandshake;
use thunder_crypto::secp256k1::{PublicKey, Secp256k1, SecretKey};

fn update_add_htlc() -> Message {
    Message::UpdateAddHTLC(UpdateAddHTLC {
        channel_id: ChannelId([7; 32]),
        htlc_id: 42,
        amount_msat: 1_000_000,
        payment_hash: PaymentHash([9; 32]),
        cltv_expiry: 700_000,
        onion_routing_packet: OnionPacket {
            version: 0,
            public_key: [2; 33],
            hop_data: [0xAA; ONION_HOP_DATA_SIZE],
            hmac: [0x55; 32],
        },
    })
}

fn bench_update_add_htlc(c: &mut Criterion) {
    let msg = update_add_htlc();
    let bytes = wire::write(&msg);

    let mut group = c.benchmark_group("update_add_htlc");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| b.iter(|| wire::write(black_box(&msg))));
    group.bench_function("decode", |b| b.iter(|| wire::read(black_box(&bytes))));
    group.finish();
}

fn bench_transport(c: &mut Criterion) {
    let secp = Secp256k1::new();
    let key = |byte: u8| SecretKey::from_slice(&[byte; 32]).unwrap();
    let responder_id = PublicKey::from_secret_key(&secp, &key(2));

    let mut initiator = NoiseHandshake::new_initiator(key(1), responder_id, key(3));
    let mut responder = NoiseHandshake::new_responder(key(2), key(4));
    let act_one = initiator.write_act_one().unwrap();
    let act_two = responder.read_act_one(&act_one).unwrap();
    let (act_three, mut sender) = initiator.read_act_two(&act_two).unwrap();
    let (_, mut receiver) = responder.read_act_three(&act_three).unwrap();

    let plaintext = wire::write(&update_add_htlc());
    let mut group = c.benchmark_group("noise_transport");
    group.throughput(Throughput::Bytes(plaintext.len() as u64));
    group.bench_function("encrypt_and_decrypt", |b| {
        b.iter(|| {
            let frame = sender.encrypt_message(black_box(&plaintext)).unwrap();
            let (header, body) = frame.split_at(thunder_crypto::noise::LENGTH_HEADER_SIZE);
            receiver.decrypt_length_header(header).unwrap();
            receiver.decrypt_message(body).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_update_add_htlc, bench_transport);
criterion_main!(benches);
