// Shared fixtures for the engine's unit tests.

use hive_core::config::EngineConfig;
use hive_core::{level_price, ActivationEvent, UpgradeEvent, Wallet};
use tempfile::TempDir;

use crate::{ActivationOutcome, HiveEngine, HiveStore, UpgradeOutcome};

pub const HOUR: u64 = 3_600;

pub fn w(s: &str) -> Wallet {
    Wallet::parse(s).unwrap()
}

/// Engine over a fresh store in `dir` with `0xroot` registered at level 19.
pub fn engine_with(dir: &TempDir, config: EngineConfig) -> HiveEngine {
    let store = HiveStore::open(dir.path().join("hive")).unwrap();
    let engine = HiveEngine::with_store(store, config);
    engine.register_root(&w("0xroot"), 19, 0).unwrap();
    engine
}

pub fn open_engine(dir: &TempDir) -> HiveEngine {
    engine_with(dir, EngineConfig::default())
}

pub fn activate(engine: &HiveEngine, member: &str, referrer: &str, now: u64) -> ActivationOutcome {
    engine
        .handle_activation(
            &ActivationEvent {
                event_id: format!("act-{}", member),
                member: w(member),
                referrer: w(referrer),
            },
            now,
        )
        .unwrap()
}

pub fn upgrade(engine: &HiveEngine, member: &str, level: u8, now: u64) -> UpgradeOutcome {
    engine
        .handle_upgrade(
            &UpgradeEvent {
                event_id: format!("u-{}-{}", member, level),
                member: w(member),
                new_level: level,
                price_paid: level_price(level).unwrap(),
            },
            now,
        )
        .unwrap()
}
