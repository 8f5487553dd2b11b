//! Fuzz target: engine operation sequences
//!
//! Drives a temporary store with arbitrary activations, upgrades, claims,
//! releases and sweeps. Every call must return Ok/Err without panicking, no
//! error may be an integrity fault, and layer capacities must hold.
//!
//! Run: cargo +nightly fuzz run fuzz_engine_operations

#![no_main]
use arbitrary::Arbitrary;
use hive_core::config::EngineConfig;
use hive_core::{
    layer_capacity, level_price, ActivationEvent, HiveError, UpgradeEvent, Wallet, MAX_LAYER,
};
use hive_engine::{HiveEngine, HiveStore};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Activate { member: u8, referrer: u8 },
    Upgrade { member: u8, level: u8, underpay: bool },
    Claim { reward: u8, claimant: u8 },
    Release { member: u8 },
    Sweep { advance_hours: u16 },
}

fn wallet(i: u8) -> Wallet {
    Wallet::parse(&format!("0xf{:02x}", i % 48)).unwrap()
}

fn check(result: Result<(), HiveError>) {
    if let Err(HiveError::IntegrityFault(msg)) = result {
        panic!("integrity fault: {}", msg);
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let Ok(store) = HiveStore::open_temporary() else {
        return;
    };
    let engine = HiveEngine::with_store(store, EngineConfig::default());
    engine.register_root(&wallet(0), 19, 0).unwrap();

    let mut now = 1u64;
    let mut event = 0u64;
    let mut reward_ids: Vec<u64> = Vec::new();

    for op in ops.into_iter().take(64) {
        event += 1;
        now += 1;
        match op {
            Op::Activate { member, referrer } => {
                let r = engine.handle_activation(
                    &ActivationEvent {
                        event_id: format!("a-{}", event),
                        member: wallet(member),
                        referrer: wallet(referrer),
                    },
                    now,
                );
                if let Ok(out) = &r {
                    reward_ids.extend(out.rewards.iter().map(|r| r.id));
                }
                check(r.map(|_| ()));
            }
            Op::Upgrade { member, level, underpay } => {
                let level = level % 21;
                let price = level_price(level).unwrap_or(0);
                let r = engine.handle_upgrade(
                    &UpgradeEvent {
                        event_id: format!("u-{}", event),
                        member: wallet(member),
                        new_level: level,
                        price_paid: if underpay { price.saturating_sub(1) } else { price },
                    },
                    now,
                );
                if let Ok(out) = &r {
                    reward_ids.extend(out.rewards.iter().map(|r| r.id));
                }
                check(r.map(|_| ()));
            }
            Op::Claim { reward, claimant } => {
                if let Some(id) = reward_ids.get(reward as usize % reward_ids.len().max(1)) {
                    check(engine.claim(*id, &wallet(claimant), now).map(|_| ()));
                }
            }
            Op::Release { member } => {
                check(engine.release_locked(&wallet(member), now).map(|_| ()));
            }
            Op::Sweep { advance_hours } => {
                now += advance_hours as u64 * 3_600;
                check(engine.sweep(now).map(|_| ()));
            }
        }
    }

    for i in 0..48u8 {
        for layer in 1..=MAX_LAYER {
            let count = engine.store().layer_count(&wallet(i), layer).unwrap_or(0);
            assert!(count <= layer_capacity(layer));
        }
    }
});
