//! Fuzz target for the wire message codec
//!
//! Arbitrary bytes must decode to a message or an error, and anything that
//! decodes must re-encode to something that decodes the same way.

#![no_main]

use libfuzzer_sys::fuzz_target;
use thunder_core::wire::{self, Message};

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = wire::read(data) else {
        return;
    };
    if matches!(msg, Message::Unknown(_)) {
        return;
    }
    let encoded = wire::write(&msg);
    assert_eq!(wire::read(&encoded).as_ref(), Ok(&msg));
});
