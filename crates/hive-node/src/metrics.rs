// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE NODE - METRICS MODULE
//
// Prometheus-compatible metrics for production monitoring.
// Exposes counters, gauges, and histograms via /metrics endpoint.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::{HiveError, LayerReward};
use hive_engine::{ActivationOutcome, StoreStats, SweepReport, UpgradeOutcome};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct HiveMetrics {
    registry: Registry,

    // Placement metrics
    pub activations_total: IntCounter,
    pub duplicate_activations_total: IntCounter,
    pub spillovers_total: IntCounter,
    pub placement_retries_total: IntCounter,
    pub propagation_conflicts_total: IntCounter,

    // Alerts
    pub tree_exhausted_total: IntCounter,
    pub integrity_faults_total: IntCounter,

    // Reward metrics
    pub upgrades_total: IntCounter,
    /// Labelled by initial status: claimable | pending | rolled_up | expired
    pub rewards_created_total: IntCounterVec,
    pub claims_total: IntCounter,

    // Ledger metrics
    pub releases_total: IntCounter,

    // Sweep metrics
    pub sweep_runs_total: IntCounter,
    pub sweep_rollups_total: IntCounter,
    pub sweep_expiries_total: IntCounter,
    pub sweep_promotions_total: IntCounter,
    pub sweep_errors_total: IntCounter,
    pub sweep_duration_seconds: Histogram,

    // Database metrics
    pub db_size_bytes: Gauge,
    pub db_members_count: IntGauge,
    pub db_slots_count: IntGauge,
    pub db_rewards_count: IntGauge,

    // API metrics
    pub api_requests_total: IntCounter,
    pub api_errors_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl HiveMetrics {
    pub fn new() -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let activations_total = counter(
            &registry,
            "hive_activations_total",
            "Activations committed (placement + level-1 reward)",
        )?;
        let duplicate_activations_total = counter(
            &registry,
            "hive_duplicate_activations_total",
            "Redelivered activation events ignored",
        )?;
        let spillovers_total = counter(
            &registry,
            "hive_spillovers_total",
            "Activations placed under a root other than the referrer",
        )?;
        let placement_retries_total = counter(
            &registry,
            "hive_placement_retries_total",
            "Layer-1 placement restarts after losing a slot race",
        )?;
        let propagation_conflicts_total = counter(
            &registry,
            "hive_propagation_conflicts_total",
            "Ancestor-layer slots lost to a concurrent placement and re-resolved",
        )?;
        let tree_exhausted_total = counter(
            &registry,
            "hive_tree_exhausted_total",
            "Placements that found no member with a free layer-1 slot",
        )?;
        let integrity_faults_total = counter(
            &registry,
            "hive_integrity_faults_total",
            "Detected integrity faults (capacity overflow, inconsistent rows)",
        )?;
        let upgrades_total = counter(&registry, "hive_upgrades_total", "Level upgrades processed")?;

        let rewards_created_total = IntCounterVec::new(
            Opts::new(
                "hive_rewards_created_total",
                "Layer rewards created, by initial status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(rewards_created_total.clone()))?;

        let claims_total = counter(&registry, "hive_claims_total", "Rewards claimed")?;
        let releases_total = counter(
            &registry,
            "hive_releases_total",
            "Locked tranches moved to transferable",
        )?;

        let sweep_runs_total = counter(&registry, "hive_sweep_runs_total", "Timer sweep passes")?;
        let sweep_rollups_total = counter(
            &registry,
            "hive_sweep_rollups_total",
            "Pending rewards rolled up by the sweep",
        )?;
        let sweep_expiries_total = counter(
            &registry,
            "hive_sweep_expiries_total",
            "Rewards expired with no ancestor left",
        )?;
        let sweep_promotions_total = counter(
            &registry,
            "hive_sweep_promotions_total",
            "Pending rewards promoted to claimable by the sweep",
        )?;
        let sweep_errors_total = counter(
            &registry,
            "hive_sweep_errors_total",
            "Per-row failures during sweep passes",
        )?;
        let sweep_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("hive_sweep_duration_seconds", "Timer sweep pass latency")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(sweep_duration_seconds.clone()))?;

        let db_size_bytes =
            Gauge::with_opts(Opts::new("hive_db_size_bytes", "Database size in bytes"))?;
        registry.register(Box::new(db_size_bytes.clone()))?;
        let db_members_count = gauge(&registry, "hive_db_members_count", "Stored member records")?;
        let db_slots_count = gauge(&registry, "hive_db_slots_count", "Occupied matrix slots")?;
        let db_rewards_count = gauge(&registry, "hive_db_rewards_count", "Stored layer rewards")?;

        let api_requests_total =
            counter(&registry, "hive_api_requests_total", "Total REST API requests")?;
        let api_errors_total = counter(&registry, "hive_api_errors_total", "Total REST API errors")?;

        Ok(Arc::new(Self {
            registry,
            activations_total,
            duplicate_activations_total,
            spillovers_total,
            placement_retries_total,
            propagation_conflicts_total,
            tree_exhausted_total,
            integrity_faults_total,
            upgrades_total,
            rewards_created_total,
            claims_total,
            releases_total,
            sweep_runs_total,
            sweep_rollups_total,
            sweep_expiries_total,
            sweep_promotions_total,
            sweep_errors_total,
            sweep_duration_seconds,
            db_size_bytes,
            db_members_count,
            db_slots_count,
            db_rewards_count,
            api_requests_total,
            api_errors_total,
        }))
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn observe_rewards(&self, rewards: &[LayerReward]) {
        for reward in rewards {
            self.rewards_created_total
                .with_label_values(&[&reward.status.to_string()])
                .inc();
        }
    }

    pub fn observe_activation(&self, outcome: &ActivationOutcome) {
        self.activations_total.inc();
        if outcome.placement.spilled {
            self.spillovers_total.inc();
        }
        // `attempts` counts phase-1 restarts only; a clean placement reports 0.
        self.placement_retries_total
            .inc_by(outcome.placement.attempts as u64);
        self.propagation_conflicts_total
            .inc_by(outcome.placement.propagation_conflicts as u64);
        self.observe_rewards(&outcome.rewards);
    }

    pub fn observe_upgrade(&self, outcome: &UpgradeOutcome) {
        self.upgrades_total.inc();
        self.observe_rewards(&outcome.rewards);
    }

    /// Count an engine failure; duplicates and alerts get their own counters.
    pub fn observe_error(&self, err: &HiveError) {
        self.api_errors_total.inc();
        match err {
            HiveError::DuplicateActivation { .. } => self.duplicate_activations_total.inc(),
            HiveError::TreeExhausted { .. } => self.tree_exhausted_total.inc(),
            HiveError::IntegrityFault(_) => self.integrity_faults_total.inc(),
            _ => {}
        }
    }

    pub fn observe_sweep(&self, report: &SweepReport, elapsed_secs: f64) {
        self.sweep_runs_total.inc();
        self.sweep_rollups_total.inc_by(report.rolled_up as u64);
        self.sweep_expiries_total.inc_by(report.expired as u64);
        self.sweep_promotions_total.inc_by(report.promoted as u64);
        self.sweep_errors_total.inc_by(report.errors as u64);
        self.releases_total
            .inc_by(report.releases_executed.len() as u64);
        self.sweep_duration_seconds.observe(elapsed_secs);
    }

    pub fn update_db_metrics(&self, stats: &StoreStats) {
        self.db_size_bytes.set(stats.size_on_disk as f64);
        self.db_members_count.set(stats.members as i64);
        self.db_slots_count.set(stats.slots as i64);
        self.db_rewards_count.set(stats.rewards as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = HiveMetrics::new().unwrap();
        assert_eq!(metrics.activations_total.get(), 0);
        assert_eq!(metrics.db_slots_count.get(), 0);
    }

    #[test]
    fn test_metrics_export() {
        let metrics = HiveMetrics::new().unwrap();
        metrics.activations_total.inc_by(42);
        metrics
            .rewards_created_total
            .with_label_values(&["pending"])
            .inc();

        let output = metrics.export().unwrap();
        assert!(output.contains("hive_activations_total 42"));
        assert!(output.contains("hive_rewards_created_total{status=\"pending\"} 1"));
    }

    #[test]
    fn test_error_counters() {
        let metrics = HiveMetrics::new().unwrap();
        metrics.observe_error(&HiveError::DuplicateActivation {
            member: "0xa".to_string(),
        });
        metrics.observe_error(&HiveError::IntegrityFault("overflow".to_string()));
        metrics.observe_error(&HiveError::UnknownReward(9));

        assert_eq!(metrics.api_errors_total.get(), 3);
        assert_eq!(metrics.duplicate_activations_total.get(), 1);
        assert_eq!(metrics.integrity_faults_total.get(), 1);
        assert_eq!(metrics.tree_exhausted_total.get(), 0);
    }

    #[test]
    fn test_activation_counts_every_retry() {
        use hive_core::{BalanceAccount, MatrixSlot, Member, RewardStatus, SlotRef, Wallet};
        use hive_engine::PlacementResult;

        let w = |s: &str| Wallet::parse(s).unwrap();
        let slot = SlotRef::new(1, 0).unwrap();
        let reward = LayerReward {
            id: 1,
            trigger_member: w("0xb"),
            trigger_level: 1,
            layer: 1,
            candidate_chain: Vec::new(),
            recipient: w("0xc"),
            amount: 100,
            status: RewardStatus::Claimable,
            created_at: 5,
            decision_deadline: None,
            claimed_at: None,
            resolved_at: None,
            rollup_source: None,
        };
        let outcome = ActivationOutcome {
            member: Member {
                wallet: w("0xb"),
                level: 1,
                activation_seq: 2,
                referrer: Some(w("0xa")),
                direct_referrals: 0,
                placement: None,
                placed: true,
                activated_at: 5,
            },
            placement: PlacementResult {
                member: w("0xb"),
                referrer: w("0xa"),
                root: w("0xc"),
                slot,
                spilled: true,
                attempts: 2,
                propagation_conflicts: 1,
                rows: vec![MatrixSlot {
                    root: w("0xc"),
                    slot,
                    occupant: w("0xb"),
                }],
                resumed: false,
            },
            rewards: vec![reward],
            balance: BalanceAccount::default(),
        };

        let metrics = HiveMetrics::new().unwrap();
        metrics.observe_activation(&outcome);
        assert_eq!(metrics.activations_total.get(), 1);
        assert_eq!(metrics.spillovers_total.get(), 1);
        assert_eq!(metrics.placement_retries_total.get(), 2);
        assert_eq!(metrics.propagation_conflicts_total.get(), 1);
        assert_eq!(
            metrics
                .rewards_created_total
                .with_label_values(&["claimable"])
                .get(),
            1
        );

        let mut clean = outcome.clone();
        clean.placement.attempts = 0;
        clean.placement.propagation_conflicts = 0;
        metrics.observe_activation(&clean);
        assert_eq!(metrics.placement_retries_total.get(), 2);
    }

    #[test]
    fn test_sweep_observation() {
        let metrics = HiveMetrics::new().unwrap();
        let report = SweepReport {
            rolled_up: 2,
            expired: 1,
            ..Default::default()
        };
        metrics.observe_sweep(&report, 0.25);
        assert_eq!(metrics.sweep_runs_total.get(), 1);
        assert_eq!(metrics.sweep_rollups_total.get(), 2);
        assert_eq!(metrics.sweep_expiries_total.get(), 1);
        assert!(metrics.export().unwrap().contains("hive_sweep_duration_seconds"));
    }
}
