//! Fuzz target: engine configuration parsing
//!
//! Arbitrary TOML must either fail to parse, fail validation, or yield a
//! config whose derived values stay in range.
//!
//! Run: cargo +nightly fuzz run fuzz_engine_config -- -max_len=2048

#![no_main]
use hive_core::allotment::starter_locked_for;
use hive_core::config::EngineConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = EngineConfig::from_toml_str(s) else {
        return;
    };
    if config.validate().is_err() {
        return;
    }
    for rank in [1u64, 9_999, 10_000, 100_000, u64::MAX] {
        let locked = starter_locked_for(rank, config.ledger.starter_locked, &config.ledger.tiers);
        assert!(locked <= config.ledger.starter_locked);
    }
    assert!(config.rewards.pending_window_secs > 0);
});
