// ─────────────────────────────────────────────────────────────────
// Read-only views derived from the authoritative trees
// ─────────────────────────────────────────────────────────────────

use hive_core::config::LedgerConfig;
use hive_core::{
    layer_capacity, BalanceAccount, HiveError, LayerReward, Leg, Member, ReleaseRecord,
    RewardStatus, Wallet, MAX_LAYER,
};
use serde::Serialize;

use crate::db::HiveStore;

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub index: u64,
    pub position: Leg,
    pub occupant: Wallet,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerView {
    pub layer: u8,
    pub capacity: u64,
    pub occupied: u64,
    pub fill_percent: f64,
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatrixView {
    pub root: Wallet,
    pub total_occupied: u64,
    pub layers: Vec<LayerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardEntry {
    pub reward: LayerReward,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RewardBook {
    pub pending: Vec<RewardEntry>,
    pub claimable: Vec<RewardEntry>,
    pub claimed: Vec<RewardEntry>,
    pub rolled_up: Vec<RewardEntry>,
    pub expired: Vec<RewardEntry>,
    pub claimable_total: u128,
    pub claimed_total: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSnapshot {
    pub wallet: Wallet,
    pub transferable: u128,
    pub locked: u128,
    pub lifetime_earned: u128,
    pub last_updated: u64,
    /// Seconds until `release_locked` is allowed again.
    pub next_release_in_secs: u64,
    pub releases: Vec<ReleaseRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberView {
    pub member: Member,
    pub referred: Vec<Wallet>,
    /// Number of roots under which this member holds a slot.
    pub ancestor_slots: usize,
}

/// Layers `1..=depth` of `root`'s matrix. Layers are read until the first
/// empty one: a layer can only fill once the one above it has members.
pub fn matrix_view(store: &HiveStore, root: &Wallet, depth: u8) -> Result<MatrixView, HiveError> {
    store.require_member(root)?;
    let mut layers = Vec::new();
    let mut total = 0u64;
    for layer in 1..=depth.min(MAX_LAYER) {
        let rows = store.layer_rows(root, layer)?;
        if rows.is_empty() {
            break;
        }
        let capacity = layer_capacity(layer);
        let occupied = rows.len() as u64;
        total += occupied;
        layers.push(LayerView {
            layer,
            capacity,
            occupied,
            fill_percent: occupied as f64 * 100.0 / capacity as f64,
            slots: rows
                .into_iter()
                .map(|(index, occupant)| SlotView {
                    index,
                    position: Leg::of_index(index),
                    occupant,
                })
                .collect(),
        });
    }
    Ok(MatrixView {
        root: root.clone(),
        total_occupied: total,
        layers,
    })
}

pub fn reward_book(store: &HiveStore, wallet: &Wallet, now: u64) -> Result<RewardBook, HiveError> {
    let mut book = RewardBook::default();
    for reward in store.rewards_for(wallet)? {
        let entry = RewardEntry {
            remaining_secs: reward.remaining_secs(now),
            reward,
        };
        match entry.reward.status {
            RewardStatus::Pending => book.pending.push(entry),
            RewardStatus::Claimable => {
                book.claimable_total += entry.reward.amount;
                book.claimable.push(entry)
            }
            RewardStatus::Claimed => {
                book.claimed_total += entry.reward.amount;
                book.claimed.push(entry)
            }
            RewardStatus::RolledUp => book.rolled_up.push(entry),
            RewardStatus::Expired => book.expired.push(entry),
        }
    }
    Ok(book)
}

pub fn balance_snapshot(
    store: &HiveStore,
    config: &LedgerConfig,
    wallet: &Wallet,
    now: u64,
) -> Result<BalanceSnapshot, HiveError> {
    let account = match store.get_balance(wallet)? {
        Some(a) => a,
        None => {
            store.require_member(wallet)?;
            BalanceAccount::default()
        }
    };
    Ok(BalanceSnapshot {
        wallet: wallet.clone(),
        transferable: account.transferable,
        locked: account.locked,
        lifetime_earned: account.lifetime_earned,
        last_updated: account.last_updated,
        next_release_in_secs: account.release_wait_secs(now, config.release_cooldown_secs),
        releases: store.releases_of(wallet)?,
    })
}

pub fn member_view(store: &HiveStore, wallet: &Wallet) -> Result<MemberView, HiveError> {
    let member = store.require_member(wallet)?;
    let referred = store
        .referrals_of(wallet)?
        .into_iter()
        .map(|edge| edge.referred)
        .collect();
    Ok(MemberView {
        ancestor_slots: store.occupancy_of(wallet)?.len(),
        member,
        referred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{activate, open_engine, upgrade, w, HOUR};
    use tempfile::TempDir;

    #[test]
    fn test_matrix_view_fill() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        activate(&engine, "0xb", "0xa", 2);
        let view = engine.matrix_view(&w("0xroot"), MAX_LAYER).unwrap();
        assert_eq!(view.total_occupied, 2);
        assert_eq!(view.layers.len(), 2);
        assert_eq!(view.layers[0].capacity, 3);
        assert_eq!(view.layers[1].slots[0].occupant, w("0xb"));
        assert!((view.layers[0].fill_percent - 33.333).abs() < 0.01);
        assert!(engine.matrix_view(&w("0xnobody"), 3).is_err());
    }

    #[test]
    fn test_reward_book_partitions() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let a = activate(&engine, "0xa", "0xroot", 1);
        activate(&engine, "0xb", "0xa", 2);
        upgrade(&engine, "0xb", 2, 3);
        engine
            .claim(a.rewards[0].id, &w("0xroot"), 4)
            .unwrap();

        let book = engine.reward_book(&w("0xroot"), 3 + HOUR).unwrap();
        assert_eq!(book.claimed.len(), 1);
        assert_eq!(book.claimed_total, 100);
        assert_eq!(book.pending.len(), 1);
        assert_eq!(book.pending[0].remaining_secs, 71 * HOUR);
        assert!(book.claimable.is_empty());
    }

    #[test]
    fn test_balance_and_member_views() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        activate(&engine, "0xb", "0xa", 2);
        engine.release_locked(&w("0xa"), 10).unwrap();

        let snap = engine.balance_snapshot(&w("0xa"), 10 + HOUR).unwrap();
        assert_eq!(snap.locked, 10_350);
        assert_eq!(snap.transferable, 600);
        assert_eq!(snap.next_release_in_secs, 71 * HOUR);
        assert_eq!(snap.releases.len(), 1);

        // root has no account until it earns
        let root = engine.balance_snapshot(&w("0xroot"), 0).unwrap();
        assert_eq!(root.transferable, 0);

        let view = engine.member_view(&w("0xa")).unwrap();
        assert_eq!(view.referred, vec![w("0xb")]);
        assert_eq!(view.member.direct_referrals, 1);
        assert_eq!(view.ancestor_slots, 1);
    }
}
