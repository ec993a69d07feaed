//! Fuzz target for channel configuration parsing
//!
//! Arbitrary TOML must never panic when read as a channel configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use thunder_core::UserConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<UserConfig, _> = toml::from_str(s);
    }
});
