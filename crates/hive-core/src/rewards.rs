// ─────────────────────────────────────────────────────────────────
// Reward lifecycle: eligibility policy and the pending-window decision
// ─────────────────────────────────────────────────────────────────
// Both functions are pure. The engine calls `evaluate` when a reward is
// created or rolled up, and `decide` from the sweep and from eager
// re-evaluation after a member's level or referral count changes.
// ─────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use crate::config::RewardsConfig;
use crate::RewardStatus;

/// The two member facts eligibility depends on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSnapshot {
    pub level: u8,
    pub direct_referrals: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    /// Both checks pass now: reward is created `claimable`.
    Eligible,
    /// Candidate is an active member below a threshold: reward waits out the window.
    Pending,
    /// Candidate cannot be observed becoming eligible: reward rolls up at once.
    Unreachable,
}

impl Eligibility {
    pub fn initial_status(self) -> Option<RewardStatus> {
        match self {
            Eligibility::Eligible => Some(RewardStatus::Claimable),
            Eligibility::Pending => Some(RewardStatus::Pending),
            Eligibility::Unreachable => None,
        }
    }
}

/// Eligibility of a candidate for a reward triggered by a purchase of `reward_level`.
///
/// The candidate must hold at least `reward_level` and meet the direct-referral
/// gate configured for that level. `None` means the candidate has no member record.
pub fn evaluate(
    policy: &RewardsConfig,
    candidate: Option<&CandidateSnapshot>,
    reward_level: u8,
) -> Eligibility {
    let Some(c) = candidate else {
        return Eligibility::Unreachable;
    };
    if c.level >= reward_level && c.direct_referrals >= policy.min_direct_referrals(reward_level) {
        Eligibility::Eligible
    } else {
        Eligibility::Pending
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepDecision {
    Keep,
    Promote,
    Rollup,
}

/// Next step for one reward row given the clock and current eligibility.
///
/// Idempotent: re-running on a row that already left `pending` is always `Keep`,
/// so a missed or repeated sweep only changes timing.
pub fn decide(
    status: RewardStatus,
    deadline: Option<u64>,
    now: u64,
    eligible_now: bool,
) -> SweepDecision {
    if status != RewardStatus::Pending {
        return SweepDecision::Keep;
    }
    let Some(deadline) = deadline else {
        // A pending row without a window cannot wait; treat it as elapsed.
        return SweepDecision::Rollup;
    };
    if now >= deadline {
        SweepDecision::Rollup
    } else if eligible_now {
        SweepDecision::Promote
    } else {
        SweepDecision::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(level: u8, direct_referrals: u32) -> CandidateSnapshot {
        CandidateSnapshot {
            level,
            direct_referrals,
        }
    }

    #[test]
    fn test_level_gate() {
        let policy = RewardsConfig::default();
        assert_eq!(evaluate(&policy, Some(&snap(3, 0)), 3), Eligibility::Eligible);
        assert_eq!(evaluate(&policy, Some(&snap(2, 9)), 3), Eligibility::Pending);
    }

    #[test]
    fn test_layer_two_referral_gate() {
        let policy = RewardsConfig::default();
        assert_eq!(evaluate(&policy, Some(&snap(5, 2)), 2), Eligibility::Pending);
        assert_eq!(evaluate(&policy, Some(&snap(5, 3)), 2), Eligibility::Eligible);
        // no gate on layer 1
        assert_eq!(evaluate(&policy, Some(&snap(1, 0)), 1), Eligibility::Eligible);
    }

    #[test]
    fn test_missing_candidate_unreachable() {
        let policy = RewardsConfig::default();
        assert_eq!(evaluate(&policy, None, 1), Eligibility::Unreachable);
        assert_eq!(Eligibility::Unreachable.initial_status(), None);
    }

    #[test]
    fn test_decide_pending_window() {
        use RewardStatus::*;
        assert_eq!(decide(Pending, Some(100), 50, false), SweepDecision::Keep);
        assert_eq!(decide(Pending, Some(100), 50, true), SweepDecision::Promote);
        assert_eq!(decide(Pending, Some(100), 100, false), SweepDecision::Rollup);
        // eligibility after the deadline does not rescue the row
        assert_eq!(decide(Pending, Some(100), 150, true), SweepDecision::Rollup);
        assert_eq!(decide(Pending, None, 0, true), SweepDecision::Rollup);
    }

    #[test]
    fn test_decide_ignores_settled_rows() {
        use RewardStatus::*;
        for status in [Claimable, Claimed, RolledUp, Expired] {
            assert_eq!(decide(status, Some(0), 1_000, true), SweepDecision::Keep);
        }
    }
}
