// ─────────────────────────────────────────────────────────────────
// Starter Allotment — activation-rank tiers
// ─────────────────────────────────────────────────────────────────
// Every member receives a locked starter allotment at first activation.
// Earlier activations receive a larger share:
//   rank 1 – 9,999        100.0%  (10,450 units)
//   rank 10,000 – 29,999   50.0%  ( 5,225 units)
//   rank 30,000 – 99,999   25.0%  ( 2,612 units)
//   rank 100,000+          12.5%  ( 1,306 units)
// Multipliers are basis points; results are floored to whole units.
// ─────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

/// 10000 bps = 100%
pub const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AllotmentTier {
    /// First activation rank covered (inclusive).
    pub min_rank: u64,
    /// Last activation rank covered (inclusive); `None` = unbounded.
    #[serde(default)]
    pub max_rank: Option<u64>,
    pub multiplier_bps: u32,
}

impl AllotmentTier {
    pub fn contains(&self, rank: u64) -> bool {
        rank >= self.min_rank && self.max_rank.map_or(true, |max| rank <= max)
    }
}

pub fn default_tiers() -> Vec<AllotmentTier> {
    vec![
        AllotmentTier {
            min_rank: 1,
            max_rank: Some(9_999),
            multiplier_bps: 10_000,
        },
        AllotmentTier {
            min_rank: 10_000,
            max_rank: Some(29_999),
            multiplier_bps: 5_000,
        },
        AllotmentTier {
            min_rank: 30_000,
            max_rank: Some(99_999),
            multiplier_bps: 2_500,
        },
        AllotmentTier {
            min_rank: 100_000,
            max_rank: None,
            multiplier_bps: 1_250,
        },
    ]
}

/// Locked units for the member with activation rank `rank`.
/// Rank 0 (network root) and ranks no tier covers receive nothing.
pub fn starter_locked_for(rank: u64, base: u128, tiers: &[AllotmentTier]) -> u128 {
    if rank == 0 {
        return 0;
    }
    tiers
        .iter()
        .find(|t| t.contains(rank))
        .map(|t| base.saturating_mul(t.multiplier_bps as u128) / BPS_DENOMINATOR)
        .unwrap_or(0)
}

/// Tiers must start at rank 1, be contiguous, end unbounded, and never exceed 100%.
pub fn validate_tiers(tiers: &[AllotmentTier]) -> Result<(), String> {
    if tiers.is_empty() {
        return Err("at least one allotment tier is required".to_string());
    }
    let mut expected_min = 1u64;
    for (i, tier) in tiers.iter().enumerate() {
        if tier.min_rank != expected_min {
            return Err(format!(
                "tier {} starts at rank {}, expected {}",
                i, tier.min_rank, expected_min
            ));
        }
        if tier.multiplier_bps as u128 > BPS_DENOMINATOR {
            return Err(format!(
                "tier {} multiplier {} bps exceeds 100%",
                i, tier.multiplier_bps
            ));
        }
        match tier.max_rank {
            Some(max) if max < tier.min_rank => {
                return Err(format!("tier {} ends before it starts", i));
            }
            Some(max) => expected_min = max.saturating_add(1),
            None if i + 1 != tiers.len() => {
                return Err(format!("tier {} is unbounded but not last", i));
            }
            None => return Ok(()),
        }
    }
    Err("last allotment tier must be unbounded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STARTER_LOCKED;

    #[test]
    fn test_default_tier_amounts() {
        let tiers = default_tiers();
        assert_eq!(starter_locked_for(1, STARTER_LOCKED, &tiers), 10_450);
        assert_eq!(starter_locked_for(9_999, STARTER_LOCKED, &tiers), 10_450);
        assert_eq!(starter_locked_for(10_000, STARTER_LOCKED, &tiers), 5_225);
        assert_eq!(starter_locked_for(30_000, STARTER_LOCKED, &tiers), 2_612);
        assert_eq!(starter_locked_for(5_000_000, STARTER_LOCKED, &tiers), 1_306);
    }

    #[test]
    fn test_root_rank_gets_nothing() {
        assert_eq!(starter_locked_for(0, STARTER_LOCKED, &default_tiers()), 0);
    }

    #[test]
    fn test_default_tiers_validate() {
        assert!(validate_tiers(&default_tiers()).is_ok());
    }

    #[test]
    fn test_gap_rejected() {
        let mut tiers = default_tiers();
        tiers[1].min_rank = 10_001;
        assert!(validate_tiers(&tiers).is_err());
    }

    #[test]
    fn test_bounded_last_tier_rejected() {
        let tiers = vec![AllotmentTier {
            min_rank: 1,
            max_rank: Some(10),
            multiplier_bps: 10_000,
        }];
        assert!(validate_tiers(&tiers).is_err());
    }
}
