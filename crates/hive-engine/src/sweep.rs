// ─────────────────────────────────────────────────────────────────
// Timer Sweep — pending windows and scheduled releases
// ─────────────────────────────────────────────────────────────────
// Stateless and idempotent: every pass recomputes decisions from stored
// rows and the supplied clock, so a late or repeated pass only shifts
// timing. Per-row failures are logged and counted, never fatal.
// ─────────────────────────────────────────────────────────────────

use hive_core::config::ReleasePolicy;
use hive_core::{HiveError, RewardStatus, Wallet};
use log::{info, warn};
use serde::Serialize;

use crate::db::HiveStore;
use crate::distribution::{RewardDistribution, Settlement};
use crate::ledger::{BalanceLedger, ReleaseAvailability};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub now: u64,
    pub pending_scanned: usize,
    pub promoted: usize,
    pub rolled_up: usize,
    pub expired: usize,
    /// Members that may release now (manual policy).
    pub releases_available: Vec<ReleaseAvailability>,
    /// Members released by this pass (auto policy).
    pub releases_executed: Vec<(Wallet, u128)>,
    pub errors: usize,
}

#[derive(Clone)]
pub struct TimerSweep {
    store: HiveStore,
    distribution: RewardDistribution,
    ledger: BalanceLedger,
}

impl TimerSweep {
    pub fn new(store: HiveStore, distribution: RewardDistribution, ledger: BalanceLedger) -> Self {
        Self {
            store,
            distribution,
            ledger,
        }
    }

    pub fn run(&self, now: u64) -> Result<SweepReport, HiveError> {
        let mut report = SweepReport {
            now,
            ..Default::default()
        };

        // Collect ids first: settling writes to the tree being scanned.
        let mut pending = Vec::new();
        for reward in self.store.all_rewards() {
            let reward = reward?;
            if reward.status == RewardStatus::Pending {
                pending.push(reward.id);
            }
        }
        report.pending_scanned = pending.len();

        for id in pending {
            match self.distribution.settle(id, now) {
                Ok(Settlement::Unchanged) => {}
                Ok(Settlement::Promoted { .. }) => report.promoted += 1,
                Ok(Settlement::RolledUp { .. }) => report.rolled_up += 1,
                Ok(Settlement::Expired { .. }) => report.expired += 1,
                Err(e) => {
                    warn!("sweep: settle failed reward={}: {}", id, e);
                    report.errors += 1;
                }
            }
        }

        let available = self.ledger.releasable(now)?;
        match self.ledger.config().release_policy {
            ReleasePolicy::Manual => report.releases_available = available,
            ReleasePolicy::Auto => {
                for entry in available {
                    match self.ledger.release_locked(&entry.member, now) {
                        Ok(record) => report
                            .releases_executed
                            .push((entry.member, record.amount_released)),
                        // raced with a manual release
                        Err(HiveError::CooldownActive { .. })
                        | Err(HiveError::InsufficientLocked { .. }) => {}
                        Err(e) => {
                            warn!("sweep: release failed member={}: {}", entry.member, e);
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        info!(
            "sweep now={} pending={} promoted={} rolled_up={} expired={} releasable={} released={} errors={}",
            now,
            report.pending_scanned,
            report.promoted,
            report.rolled_up,
            report.expired,
            report.releases_available.len(),
            report.releases_executed.len(),
            report.errors
        );
        Ok(report)
    }
}
