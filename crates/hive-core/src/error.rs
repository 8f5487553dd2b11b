use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a claim was refused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimRejection {
    /// Reward is not in `claimable` (already claimed, still pending, rolled up or expired).
    NotClaimable,
    /// Claimant is not the current recipient.
    WrongClaimant,
}

/// Unified error type for the placement, reward and ledger engines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HiveError {
    // Event handling
    #[error("Member {member} is already activated")]
    DuplicateActivation { member: String },

    #[error("Event {event_id} was already processed")]
    DuplicateEvent { event_id: String },

    #[error("Upgrade for {member} must target level {expected}, got {requested}")]
    NonSequentialLevel {
        member: String,
        expected: u8,
        requested: u8,
    },

    #[error("Level {0} outside 1..=19")]
    InvalidLevel(u8),

    #[error("Paid {paid} units for level {level}, price is {price}")]
    Underpaid { level: u8, paid: u128, price: u128 },

    #[error("Invalid wallet: {0}")]
    InvalidWallet(String),

    // Placement
    #[error("Slot conflict under {root} at layer {layer} after {attempts} attempts")]
    SlotConflict {
        root: String,
        layer: u8,
        attempts: u32,
    },

    #[error("No placement root available for {member}")]
    TreeExhausted { member: String },

    #[error("Integrity fault: {0}")]
    IntegrityFault(String),

    #[error("Unknown member {0}")]
    UnknownMember(String),

    #[error("Unknown referrer {0}")]
    UnknownReferrer(String),

    #[error("Referrer {0} is not placed yet")]
    ReferrerNotPlaced(String),

    // Rewards
    #[error("Unknown reward {0}")]
    UnknownReward(u64),

    #[error("Reward {reward_id} cannot be claimed: {reason:?}")]
    IneligibleClaim {
        reward_id: u64,
        reason: ClaimRejection,
    },

    // Ledger
    #[error("Release for {member} on cooldown, {remaining_secs}s remaining")]
    CooldownActive { member: String, remaining_secs: u64 },

    #[error("No locked balance to release for {member}")]
    InsufficientLocked { member: String },

    // Plumbing
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl HiveError {
    /// Errors that go away on retry or redelivery without any state change by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HiveError::SlotConflict { .. } | HiveError::Storage(_) | HiveError::ReferrerNotPlaced(_)
        )
    }

    /// Machine-readable kind for API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            HiveError::DuplicateActivation { .. } => "duplicate_activation",
            HiveError::DuplicateEvent { .. } => "duplicate_event",
            HiveError::NonSequentialLevel { .. } => "non_sequential_level",
            HiveError::InvalidLevel(_) => "invalid_level",
            HiveError::Underpaid { .. } => "underpaid",
            HiveError::InvalidWallet(_) => "invalid_wallet",
            HiveError::SlotConflict { .. } => "slot_conflict",
            HiveError::TreeExhausted { .. } => "tree_exhausted",
            HiveError::IntegrityFault(_) => "integrity_fault",
            HiveError::UnknownMember(_) => "unknown_member",
            HiveError::UnknownReferrer(_) => "unknown_referrer",
            HiveError::ReferrerNotPlaced(_) => "referrer_not_placed",
            HiveError::UnknownReward(_) => "unknown_reward",
            HiveError::IneligibleClaim { .. } => "ineligible_claim",
            HiveError::CooldownActive { .. } => "cooldown_active",
            HiveError::InsufficientLocked { .. } => "insufficient_locked",
            HiveError::Storage(_) => "storage",
            HiveError::Codec(_) => "codec",
            HiveError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HiveError::SlotConflict {
            root: "r".into(),
            layer: 1,
            attempts: 5
        }
        .is_transient());
        assert!(HiveError::Storage("io".into()).is_transient());
        assert!(!HiveError::IntegrityFault("dup".into()).is_transient());
        assert!(!HiveError::TreeExhausted { member: "m".into() }.is_transient());
    }

    #[test]
    fn test_cooldown_message_reports_wait() {
        let e = HiveError::CooldownActive {
            member: "0xaa".into(),
            remaining_secs: 7200,
        };
        assert_eq!(e.kind(), "cooldown_active");
        assert!(e.to_string().contains("7200s"));
    }
}
