//! Fuzz target: collaborator event JSON deserialization
//!
//! Feeds arbitrary bytes to serde_json to detect panics in ActivationEvent /
//! UpgradeEvent decoding (wallet validation runs inside deserialization).
//!
//! Run: cargo +nightly fuzz run fuzz_event_deserialize -- -max_len=4096

#![no_main]
use hive_core::{ActivationEvent, UpgradeEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _: Result<ActivationEvent, _> = serde_json::from_slice(data);

    if let Ok(event) = serde_json::from_slice::<UpgradeEvent>(data) {
        // a decoded event carries validated wallets
        assert!(!event.member.as_str().is_empty());
        assert_eq!(event.member.as_str(), event.member.as_str().to_lowercase());
    }
});
