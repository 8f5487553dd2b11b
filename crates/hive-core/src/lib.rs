// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE MATRIX - CORE MODULE
//
// Domain primitives: Wallet, Member, matrix slot addressing, LayerReward,
// BalanceAccount, and the fixed level price schedule.
// All token arithmetic uses u128 whole units (no floating-point).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod allotment;
pub mod config;
pub mod error;
pub mod rewards;

pub use error::{ClaimRejection, HiveError};

/// Deepest layer a member can occupy below any root.
pub const MAX_LAYER: u8 = 19;

/// Highest purchasable membership level.
pub const MAX_LEVEL: u8 = 19;

/// Children per matrix node (L, M, R).
pub const MATRIX_WIDTH: u64 = 3;

/// Level 1 price in token units.
pub const BASE_LEVEL_PRICE: u128 = 100;

/// Price increment per level above 1 (level 19 = 1000 units).
pub const LEVEL_PRICE_STEP: u128 = 50;

/// Decision window for a pending reward: 72 hours.
pub const PENDING_WINDOW_SECS: u64 = 72 * 60 * 60;

/// Minimum spacing between two locked-balance releases: 72 hours.
pub const RELEASE_COOLDOWN_SECS: u64 = 72 * 60 * 60;

/// Units moved from locked to transferable per release.
pub const RELEASE_TRANCHE: u128 = 100;

/// Full starter allotment (tier 1) seeded into the locked balance.
pub const STARTER_LOCKED: u128 = 10_450;

/// Transferable bonus granted at first activation.
pub const INITIAL_TRANSFERABLE: u128 = 500;

/// Longest accepted wallet identifier (bytes). Keys are length-prefixed with a u8.
pub const MAX_WALLET_LEN: usize = 128;

/// Price of a membership level, `None` outside 1..=19.
pub const fn level_price(level: u8) -> Option<u128> {
    if level == 0 || level > MAX_LEVEL {
        return None;
    }
    Some(BASE_LEVEL_PRICE + (level as u128 - 1) * LEVEL_PRICE_STEP)
}

/// Number of positions in a layer: 3^layer. Returns 0 for layer 0 or layers past 19.
pub const fn layer_capacity(layer: u8) -> u64 {
    if layer == 0 || layer > MAX_LAYER {
        return 0;
    }
    MATRIX_WIDTH.pow(layer as u32)
}

/// Validated member identity. Normalized to lowercase so that the same
/// wallet spelled with different hex casing maps to one member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Wallet(String);

impl Wallet {
    pub fn parse(raw: &str) -> Result<Self, HiveError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HiveError::InvalidWallet("wallet is empty".to_string()));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(HiveError::InvalidWallet(format!(
                "wallet {:?} contains whitespace or control characters",
                trimmed
            )));
        }
        // Lowercasing can grow the byte length; the key prefix is one byte.
        let normalized = trimmed.to_lowercase();
        if normalized.len() > MAX_WALLET_LEN {
            return Err(HiveError::InvalidWallet(format!(
                "wallet is {} bytes, max {}",
                normalized.len(),
                MAX_WALLET_LEN
            )));
        }
        Ok(Wallet(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for Wallet {
    type Error = HiveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Wallet::parse(&value)
    }
}

impl From<Wallet> for String {
    fn from(w: Wallet) -> Self {
        w.0
    }
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position letter of a slot relative to its parent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    L,
    M,
    R,
}

impl Leg {
    pub fn of_index(index: u64) -> Self {
        match index % MATRIX_WIDTH {
            0 => Leg::L,
            1 => Leg::M,
            _ => Leg::R,
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Leg::L => "L",
            Leg::M => "M",
            Leg::R => "R",
        };
        f.write_str(s)
    }
}

/// Address of one position inside a root's matrix.
///
/// `index` runs left to right across the layer, so the lowest free index is
/// the first available slot under the L→M→R rule. The parent of index `i`
/// at layer `n` sits at index `i / 3` of layer `n - 1`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub layer: u8,
    pub index: u64,
}

impl SlotRef {
    pub fn new(layer: u8, index: u64) -> Result<Self, HiveError> {
        let capacity = layer_capacity(layer);
        if capacity == 0 {
            return Err(HiveError::IntegrityFault(format!(
                "layer {} outside 1..={}",
                layer, MAX_LAYER
            )));
        }
        if index >= capacity {
            return Err(HiveError::IntegrityFault(format!(
                "index {} overflows layer {} capacity {}",
                index, layer, capacity
            )));
        }
        Ok(Self { layer, index })
    }

    pub fn leg(&self) -> Leg {
        Leg::of_index(self.index)
    }

    /// Index of the parent slot one layer up; `None` at layer 1 (parent is the root).
    pub fn parent_index(&self) -> Option<u64> {
        if self.layer <= 1 {
            None
        } else {
            Some(self.index / MATRIX_WIDTH)
        }
    }
}

/// One occupied position: (root, layer, index) → occupant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatrixSlot {
    pub root: Wallet,
    pub slot: SlotRef,
    pub occupant: Wallet,
}

/// Where a member physically hangs at layer 1 (its effective placement root).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlacementAnchor {
    pub root: Wallet,
    pub index: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub wallet: Wallet,
    /// Current membership level, 1..=19, raised one step per purchase.
    pub level: u8,
    /// Strictly increasing global counter assigned at first activation.
    pub activation_seq: u64,
    /// Direct referrer; `None` only for the network root.
    pub referrer: Option<Wallet>,
    pub direct_referrals: u32,
    /// Layer-1 position under the effective placement root. `None` for the network root.
    pub placement: Option<PlacementAnchor>,
    /// True once every ancestor row has been written.
    pub placed: bool,
    pub activated_at: u64,
}

impl Member {
    pub fn is_root(&self) -> bool {
        self.referrer.is_none()
    }

    /// Next hop of the ancestor chain.
    pub fn placement_root(&self) -> Option<&Wallet> {
        self.placement.as_ref().map(|p| &p.root)
    }
}

/// Immutable referrer → referred relationship.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReferralEdge {
    pub referrer: Wallet,
    pub referred: Wallet,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    Claimable,
    Claimed,
    RolledUp,
    Expired,
}

impl RewardStatus {
    /// Allowed lifecycle edges. Nothing is re-enterable.
    pub fn can_transition_to(self, next: RewardStatus) -> bool {
        use RewardStatus::*;
        matches!(
            (self, next),
            (Pending, Claimable) | (Pending, RolledUp) | (Pending, Expired) | (Claimable, Claimed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RewardStatus::Claimed | RewardStatus::RolledUp | RewardStatus::Expired
        )
    }
}

impl fmt::Display for RewardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Claimable => "claimable",
            RewardStatus::Claimed => "claimed",
            RewardStatus::RolledUp => "rolled_up",
            RewardStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Reward obligation created when a member upgrades.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LayerReward {
    pub id: u64,
    pub trigger_member: Wallet,
    pub trigger_level: u8,
    /// Layer of the triggering member under `recipient`.
    pub layer: u8,
    /// Candidates that held this obligation before `recipient`, oldest first.
    pub candidate_chain: Vec<Wallet>,
    pub recipient: Wallet,
    pub amount: u128,
    pub status: RewardStatus,
    pub created_at: u64,
    pub decision_deadline: Option<u64>,
    pub claimed_at: Option<u64>,
    /// When the row left `pending` (promotion, rollup or expiry).
    #[serde(default)]
    pub resolved_at: Option<u64>,
    /// Reward this one was rolled up from.
    pub rollup_source: Option<u64>,
}

impl LayerReward {
    /// Seconds left in the decision window, 0 once elapsed or when not pending.
    pub fn remaining_secs(&self, now: u64) -> u64 {
        match (self.status, self.decision_deadline) {
            (RewardStatus::Pending, Some(deadline)) => deadline.saturating_sub(now),
            _ => 0,
        }
    }
}

/// Per-member token account.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceAccount {
    pub transferable: u128,
    pub locked: u128,
    /// Never decreases.
    pub lifetime_earned: u128,
    pub last_updated: u64,
    pub last_release_at: Option<u64>,
    pub release_count: u64,
}

impl BalanceAccount {
    /// Seconds until the next release is allowed (0 = allowed now).
    pub fn release_wait_secs(&self, now: u64, cooldown_secs: u64) -> u64 {
        match self.last_release_at {
            Some(last) => (last.saturating_add(cooldown_secs)).saturating_sub(now),
            None => 0,
        }
    }
}

/// Append-only record of one locked → transferable unlock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub seq: u64,
    pub amount_released: u128,
    pub remaining_locked: u128,
    pub timestamp: u64,
}

/// Collaborator input: member passed payment/NFT verification for level 1.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActivationEvent {
    pub event_id: String,
    pub member: Wallet,
    pub referrer: Wallet,
}

/// Collaborator input: verified purchase of the next level.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpgradeEvent {
    pub event_id: String,
    pub member: Wallet,
    pub new_level: u8,
    pub price_paid: u128,
}
