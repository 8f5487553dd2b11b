// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE MATRIX - PLACEMENT ENGINE
//
// Phase 1: pick the effective placement root. The direct referrer first,
//          then (spillover) the earliest-activated anchored member whose
//          layer 1 still has a free position.
// Phase 2: register the member under every ancestor of that root, one layer
//          deeper per hop, at the lowest free index of that layer.
//
// Every slot write is an insert-if-absent transaction over `slots` and its
// `occupancy` mirror. Rows are never moved or deleted.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::config::PlacementConfig;
use hive_core::{
    layer_capacity, HiveError, MatrixSlot, Member, PlacementAnchor, SlotRef, Wallet, MATRIX_WIDTH,
    MAX_LAYER,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::Transactional;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::{
    decode, encode, layer_cursor_key, pair_key, slot_key, tx_error, wallet_key, HiveStore,
    META_SPILL_CURSOR,
};

/// Outcome of placing one member.
#[derive(Debug, Clone, Serialize)]
pub struct PlacementResult {
    pub member: Wallet,
    pub referrer: Wallet,
    /// Effective placement root (may differ from `referrer` after spillover).
    pub root: Wallet,
    pub slot: SlotRef,
    pub spilled: bool,
    /// Phase-1 restarts caused by a root filling between examination and insert.
    pub attempts: u32,
    /// Phase-2 slots lost to a concurrent placement and re-resolved.
    pub propagation_conflicts: u32,
    /// Every row naming the member, layer 1 first.
    pub rows: Vec<MatrixSlot>,
    /// True when an earlier, interrupted placement was completed.
    pub resumed: bool,
}

enum LayerOneOutcome {
    Claimed(u64),
    /// Member was already anchored (interrupted or concurrent redelivery).
    Anchored(PlacementAnchor),
    Full,
}

enum InsertOutcome {
    Inserted,
    /// The member already holds this layer under the root (redelivery).
    AlreadyPresent(MatrixSlot),
    Taken,
}

fn abort<T>(e: HiveError) -> ConflictableTransactionResult<T, HiveError> {
    Err(ConflictableTransactionError::Abort(e))
}

pub struct MatrixPlacement {
    store: HiveStore,
    config: PlacementConfig,
}

impl MatrixPlacement {
    pub fn new(store: HiveStore, config: PlacementConfig) -> Self {
        Self { store, config }
    }

    /// Resolve and write every slot row for a registered member.
    ///
    /// Safe to call again after a crash or concurrently for the same member:
    /// rows already written are reused, never duplicated. Flipping
    /// `Member::placed` is left to the activation commit.
    pub fn place(&self, member: &Wallet, referrer: &Wallet) -> Result<PlacementResult, HiveError> {
        let record = self.store.require_member(member)?;
        if record.placed {
            return Err(HiveError::DuplicateActivation {
                member: member.to_string(),
            });
        }
        let referrer_record = self
            .store
            .get_member(referrer)?
            .ok_or_else(|| HiveError::UnknownReferrer(referrer.to_string()))?;
        if !referrer_record.placed {
            return Err(HiveError::ReferrerNotPlaced(referrer.to_string()));
        }

        let mut resumed = record.placement.is_some();
        let (anchor, attempts) = match record.placement {
            Some(anchor) => (anchor, 0),
            None => {
                let (anchor, attempts, was_anchored) = self.resolve_root(member, referrer)?;
                resumed |= was_anchored;
                (anchor, attempts)
            }
        };
        let slot = SlotRef::new(1, anchor.index)?;
        let mut rows = vec![MatrixSlot {
            root: anchor.root.clone(),
            slot,
            occupant: member.clone(),
        }];

        let propagation_conflicts = self.propagate(member, &anchor.root, &mut rows)?;
        let spilled = anchor.root != *referrer;

        if spilled {
            info!(
                "placement spillover member={} referrer={} root={} index={}",
                member, referrer, anchor.root, anchor.index
            );
        }
        info!(
            "placed member={} root={} position={} layers={} attempts={} resumed={}",
            member,
            anchor.root,
            slot.leg(),
            rows.len(),
            attempts,
            resumed
        );

        Ok(PlacementResult {
            member: member.clone(),
            referrer: referrer.clone(),
            root: anchor.root,
            slot,
            spilled,
            attempts,
            propagation_conflicts,
            rows,
            resumed,
        })
    }

    // ─────────────────────────────────────────────────────────────────
    // PHASE 1 — ROOT RESOLUTION
    // ─────────────────────────────────────────────────────────────────

    fn resolve_root(
        &self,
        member: &Wallet,
        referrer: &Wallet,
    ) -> Result<(PlacementAnchor, u32, bool), HiveError> {
        let mut rejected: HashSet<Wallet> = HashSet::new();
        let mut attempts = 0u32;

        loop {
            let candidate = match self.next_candidate_root(member, referrer, &rejected)? {
                Some(c) => c,
                None => {
                    error!("tree exhausted: no placement root for member={}", member);
                    return Err(HiveError::TreeExhausted {
                        member: member.to_string(),
                    });
                }
            };

            match self.claim_layer_one(&candidate, member)? {
                LayerOneOutcome::Claimed(index) => {
                    return Ok((
                        PlacementAnchor {
                            root: candidate,
                            index,
                        },
                        attempts,
                        false,
                    ))
                }
                LayerOneOutcome::Anchored(anchor) => return Ok((anchor, attempts, true)),
                LayerOneOutcome::Full => {
                    // Filled by a concurrent placement after we examined it.
                    rejected.insert(candidate.clone());
                    attempts += 1;
                    let delay = self.backoff(member, &candidate, attempts)?;
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Delay before phase-1 restart number `attempts` (1-based), doubling from
    /// `backoff_base_ms`. Past `max_retries` the conflict is surfaced.
    fn backoff(&self, member: &Wallet, root: &Wallet, attempts: u32) -> Result<Duration, HiveError> {
        if attempts > self.config.max_retries {
            warn!(
                "slot conflict budget exhausted member={} root={} attempts={}",
                member, root, attempts
            );
            return Err(HiveError::SlotConflict {
                root: root.to_string(),
                layer: 1,
                attempts,
            });
        }
        let shift = attempts.saturating_sub(1).min(10);
        let delay = self.config.backoff_base_ms.saturating_mul(1u64 << shift);
        debug!(
            "layer-1 race lost member={} root={} retry={} backoff_ms={}",
            member, root, attempts, delay
        );
        Ok(Duration::from_millis(delay))
    }

    /// Direct referrer if its layer 1 has room, else the first anchored member in
    /// activation order with room. Roots in `rejected` are never returned.
    fn next_candidate_root(
        &self,
        member: &Wallet,
        referrer: &Wallet,
        rejected: &HashSet<Wallet>,
    ) -> Result<Option<Wallet>, HiveError> {
        if !rejected.contains(referrer) && self.store.layer_count(referrer, 1)? < MATRIX_WIDTH {
            return Ok(Some(referrer.clone()));
        }

        let cursor = self.store.cursor(META_SPILL_CURSOR)?;
        // Members before `first_open` are known full forever; layer 1 never empties.
        let mut first_open: Option<u64> = None;
        let mut found = None;

        for item in self.store.activation_order_from(cursor) {
            let (seq, wallet) = item?;
            if wallet == *member {
                first_open.get_or_insert(seq);
                continue;
            }
            if rejected.contains(&wallet) {
                continue;
            }
            let full = self.store.layer_count(&wallet, 1)? >= MATRIX_WIDTH;
            if full {
                continue;
            }
            first_open.get_or_insert(seq);
            // Anchored members are valid roots: their placement chain is already fixed.
            let candidate: Option<Member> = self.store.get_member(&wallet)?;
            if candidate.is_some_and(|m| m.placed || m.placement.is_some()) {
                found = Some(wallet);
                break;
            }
        }

        if let Some(target) = first_open {
            self.store.advance_cursor(META_SPILL_CURSOR, target)?;
        }
        Ok(found)
    }

    /// Take the first free layer-1 position under `root` and anchor the member
    /// there, all in one transaction.
    fn claim_layer_one(&self, root: &Wallet, member: &Wallet) -> Result<LayerOneOutcome, HiveError> {
        let member_key = wallet_key(member);
        let occupancy_key = pair_key(member, root);

        (&self.store.slots, &self.store.occupancy, &self.store.members)
            .transaction(
                |(slots, occupancy, members)| -> ConflictableTransactionResult<LayerOneOutcome, HiveError> {
                let mut record: Member = match members.get(&member_key)? {
                    Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    None => return abort(HiveError::UnknownMember(member.to_string())),
                };
                if let Some(anchor) = record.placement.clone() {
                    return Ok(LayerOneOutcome::Anchored(anchor));
                }
                if occupancy.get(&occupancy_key)?.is_some() {
                    return abort(HiveError::IntegrityFault(format!(
                        "{} holds a slot under {} but has no anchor",
                        member, root
                    )));
                }

                for index in 0..MATRIX_WIDTH {
                    let key = slot_key(root, 1, index);
                    if slots.get(&key)?.is_some() {
                        continue;
                    }
                    let row = MatrixSlot {
                        root: root.clone(),
                        slot: SlotRef { layer: 1, index },
                        occupant: member.clone(),
                    };
                    record.placement = Some(PlacementAnchor {
                        root: root.clone(),
                        index,
                    });
                    let occupant = encode(member).map_err(ConflictableTransactionError::Abort)?;
                    let row_bytes = encode(&row).map_err(ConflictableTransactionError::Abort)?;
                    let record_bytes =
                        encode(&record).map_err(ConflictableTransactionError::Abort)?;
                    slots.insert(key, occupant)?;
                    occupancy.insert(occupancy_key.as_slice(), row_bytes)?;
                    members.insert(member_key.as_slice(), record_bytes)?;
                    return Ok(LayerOneOutcome::Claimed(index));
                }
                Ok(LayerOneOutcome::Full)
                },
            )
            .map_err(tx_error)
    }

    // ─────────────────────────────────────────────────────────────────
    // PHASE 2 — ANCESTOR PROPAGATION
    // ─────────────────────────────────────────────────────────────────

    /// Walk the chain of effective placement roots above `root`, writing one
    /// row per ancestor. Stops at the network root or at layer 19.
    fn propagate(
        &self,
        member: &Wallet,
        root: &Wallet,
        rows: &mut Vec<MatrixSlot>,
    ) -> Result<u32, HiveError> {
        let mut conflicts = 0u32;
        let mut current = root.clone();

        for distance in 1..MAX_LAYER {
            let layer = 1 + distance;
            let hop = self.store.get_member(&current)?.ok_or_else(|| {
                error!(
                    "integrity fault: ancestor {} of member={} has no record",
                    current, member
                );
                HiveError::IntegrityFault(format!("ancestor {} has no member record", current))
            })?;
            let Some(ancestor) = hop.placement_root().cloned() else {
                break;
            };
            let (row, lost) = self.place_under(member, &ancestor, layer)?;
            conflicts += lost;
            rows.push(row);
            current = ancestor;
        }
        Ok(conflicts)
    }

    /// Lowest free index of `layer` under `ancestor`; a slot lost to a racing
    /// placement is skipped and the next free one tried. The scan starts at the
    /// layer cursor: every index below it is occupied.
    fn place_under(
        &self,
        member: &Wallet,
        ancestor: &Wallet,
        layer: u8,
    ) -> Result<(MatrixSlot, u32), HiveError> {
        if let Some(existing) = self.store.occupancy_under(member, ancestor)? {
            if existing.slot.layer != layer {
                error!(
                    "integrity fault: member={} under root={} at layer {}, expected {}",
                    member, ancestor, existing.slot.layer, layer
                );
                return Err(HiveError::IntegrityFault(format!(
                    "{} sits at layer {} under {}, expected layer {}",
                    member, existing.slot.layer, ancestor, layer
                )));
            }
            return Ok((existing, 0));
        }

        let capacity = layer_capacity(layer);
        let cursor_key = layer_cursor_key(ancestor, layer);
        let mut from = self.store.cursor(&cursor_key)?;
        let mut lost = 0u32;
        loop {
            let index = self
                .store
                .lowest_free_index(ancestor, layer, from, capacity)?
                .ok_or_else(|| {
                    error!(
                        "integrity fault: layer {} under {} is at capacity {}",
                        layer, ancestor, capacity
                    );
                    HiveError::IntegrityFault(format!(
                        "layer {} under {} exceeds capacity {}",
                        layer, ancestor, capacity
                    ))
                })?;
            let row = MatrixSlot {
                root: ancestor.clone(),
                slot: SlotRef::new(layer, index)?,
                occupant: member.clone(),
            };
            match self.insert_if_absent(&row)? {
                InsertOutcome::Inserted => {
                    self.store.advance_cursor(&cursor_key, index + 1)?;
                    return Ok((row, lost));
                }
                InsertOutcome::AlreadyPresent(existing) => {
                    debug!(
                        "member={} already under root={} at layer={} index={}",
                        member, ancestor, layer, existing.slot.index
                    );
                    return Ok((existing, lost));
                }
                InsertOutcome::Taken => {
                    lost += 1;
                    debug!(
                        "slot taken member={} root={} layer={} index={}",
                        member, ancestor, layer, index
                    );
                    self.store.advance_cursor(&cursor_key, index + 1)?;
                    from = index + 1;
                }
            }
        }
    }

    fn insert_if_absent(&self, row: &MatrixSlot) -> Result<InsertOutcome, HiveError> {
        let key = slot_key(&row.root, row.slot.layer, row.slot.index);
        let occupancy_key = pair_key(&row.occupant, &row.root);
        let occupant = encode(&row.occupant)?;
        let row_bytes = encode(row)?;

        (&self.store.slots, &self.store.occupancy)
            .transaction(
                |(slots, occupancy)| -> ConflictableTransactionResult<InsertOutcome, HiveError> {
                if let Some(bytes) = occupancy.get(&occupancy_key)? {
                    let existing: MatrixSlot =
                        decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                    // A concurrent redelivery of the same member may have taken
                    // another index in this layer first; its row stands.
                    if existing.slot.layer == row.slot.layer {
                        return Ok(InsertOutcome::AlreadyPresent(existing));
                    }
                    return abort(HiveError::IntegrityFault(format!(
                        "{} already under {} at layer {} index {}, expected layer {}",
                        row.occupant,
                        row.root,
                        existing.slot.layer,
                        existing.slot.index,
                        row.slot.layer
                    )));
                }
                if let Some(bytes) = slots.get(&key)? {
                    let holder: Wallet =
                        decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                    if holder == row.occupant {
                        return abort(HiveError::IntegrityFault(format!(
                            "slot ({}, {}, {}) names {} without an occupancy row",
                            row.root, row.slot.layer, row.slot.index, holder
                        )));
                    }
                    return Ok(InsertOutcome::Taken);
                }
                slots.insert(key.as_slice(), occupant.as_slice())?;
                occupancy.insert(occupancy_key.as_slice(), row_bytes.as_slice())?;
                Ok(InsertOutcome::Inserted)
                },
            )
            .map_err(tx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{activate, engine_with, open_engine, w};
    use crate::HiveEngine;
    use hive_core::config::EngineConfig;
    use hive_core::{ActivationEvent, Leg};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_fills_referrer_left_to_right() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let a = activate(&engine, "0xa", "0xroot", 1);
        assert_eq!(a.placement.slot.leg(), Leg::L);
        let legs: Vec<Leg> = ["0xb", "0xc", "0xd"]
            .iter()
            .map(|m| activate(&engine, m, "0xa", 2).placement.slot.leg())
            .collect();
        assert_eq!(legs, vec![Leg::L, Leg::M, Leg::R]);
    }

    #[test]
    fn test_spillover_to_earliest_open_member() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        for m in ["0xb", "0xc", "0xd"] {
            activate(&engine, m, "0xa", 2);
        }
        // root still has two free layer-1 positions and is earliest in order
        let e = activate(&engine, "0xe", "0xa", 3);
        assert!(e.placement.spilled);
        assert_eq!(e.placement.root, w("0xroot"));
    }

    #[test]
    fn test_propagation_depth_and_layers() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        activate(&engine, "0xb", "0xa", 2);
        let c = activate(&engine, "0xc", "0xb", 3);
        let layers: Vec<(String, u8)> = c
            .placement
            .rows
            .iter()
            .map(|r| (r.root.to_string(), r.slot.layer))
            .collect();
        assert_eq!(
            layers,
            vec![
                ("0xb".to_string(), 1),
                ("0xa".to_string(), 2),
                ("0xroot".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_place_rejects_committed_member() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        let placement = MatrixPlacement::new(engine.store().clone(), Default::default());
        let err = placement.place(&w("0xa"), &w("0xroot")).unwrap_err();
        assert!(matches!(err, HiveError::DuplicateActivation { .. }));
    }

    /// Store a registered, unplaced member record directly.
    fn insert_unplaced(engine: &HiveEngine, member: &str, referrer: &str, seq: u64) {
        let record = Member {
            wallet: w(member),
            level: 1,
            activation_seq: seq,
            referrer: Some(w(referrer)),
            direct_referrals: 0,
            placement: None,
            placed: false,
            activated_at: seq,
        };
        engine
            .store()
            .members
            .insert(wallet_key(&w(member)), encode(&record).unwrap())
            .unwrap();
    }

    /// Occupy every index of (root, layer) with members that do not exist.
    fn fill_layer(engine: &HiveEngine, root: &str, layer: u8) {
        for index in 0..layer_capacity(layer) {
            engine
                .store()
                .slots
                .insert(
                    slot_key(&w(root), layer, index),
                    encode(&w(&format!("0xghost{}", index))).unwrap(),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_place_requires_committed_referrer() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        engine.register_member(&w("0xb"), &w("0xa"), 2).unwrap();
        // registration already refuses an unplaced referrer
        assert_eq!(
            engine.register_member(&w("0xc"), &w("0xb"), 3).unwrap_err(),
            HiveError::ReferrerNotPlaced("0xb".to_string())
        );

        // placement checks again for records written before the referrer stalled
        insert_unplaced(&engine, "0xc", "0xb", 3);
        let placement = MatrixPlacement::new(engine.store().clone(), Default::default());
        let err = placement.place(&w("0xc"), &w("0xb")).unwrap_err();
        assert_eq!(err, HiveError::ReferrerNotPlaced("0xb".to_string()));
        assert!(err.is_transient());
        assert!(engine.store().occupancy_of(&w("0xc")).unwrap().is_empty());
    }

    #[test]
    fn test_tree_exhausted_when_no_root_has_room() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        fill_layer(&engine, "0xroot", 1);

        let err = engine
            .handle_activation(
                &ActivationEvent {
                    event_id: "act-0xb".to_string(),
                    member: w("0xb"),
                    referrer: w("0xroot"),
                },
                1,
            )
            .unwrap_err();
        assert_eq!(
            err,
            HiveError::TreeExhausted {
                member: "0xb".to_string()
            }
        );
        let b = engine.store().require_member(&w("0xb")).unwrap();
        assert!(!b.placed);
        assert!(b.placement.is_none());
        // an activation that never committed does not count toward referral gates
        let root = engine.store().require_member(&w("0xroot")).unwrap();
        assert_eq!(root.direct_referrals, 0);
        assert!(engine.store().get_event("act-0xb").unwrap().is_none());
    }

    #[test]
    fn test_slot_conflict_after_retry_budget() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let config = PlacementConfig {
            max_retries: 2,
            backoff_base_ms: 10,
        };
        let placement = MatrixPlacement::new(engine.store().clone(), config);
        let (m, r) = (w("0xm"), w("0xroot"));

        assert_eq!(placement.backoff(&m, &r, 1).unwrap(), Duration::from_millis(10));
        assert_eq!(placement.backoff(&m, &r, 2).unwrap(), Duration::from_millis(20));
        let err = placement.backoff(&m, &r, 3).unwrap_err();
        assert_eq!(
            err,
            HiveError::SlotConflict {
                root: "0xroot".to_string(),
                layer: 1,
                attempts: 3
            }
        );
        assert!(err.is_transient());

        let no_retries = MatrixPlacement::new(
            engine.store().clone(),
            PlacementConfig {
                max_retries: 0,
                backoff_base_ms: 10,
            },
        );
        assert!(matches!(
            no_retries.backoff(&m, &r, 1),
            Err(HiveError::SlotConflict { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_full_ancestor_layer_is_integrity_fault() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        // layer 2 under root is full although 0xa still offers a layer-1 slot
        fill_layer(&engine, "0xroot", 2);

        let err = engine
            .handle_activation(
                &ActivationEvent {
                    event_id: "act-0xb".to_string(),
                    member: w("0xb"),
                    referrer: w("0xa"),
                },
                2,
            )
            .unwrap_err();
        assert!(matches!(err, HiveError::IntegrityFault(_)), "got {:?}", err);
        assert!(!engine.store().require_member(&w("0xb")).unwrap().placed);
        assert_eq!(engine.store().layer_count(&w("0xroot"), 2).unwrap(), 9);
        assert!(engine.store().occupancy_under(&w("0xb"), &w("0xroot")).unwrap().is_none());
    }

    #[test]
    fn test_resumes_partial_placement() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        activate(&engine, "0xa", "0xroot", 1);
        engine.register_member(&w("0xb"), &w("0xa"), 2).unwrap();
        let placement = MatrixPlacement::new(engine.store().clone(), Default::default());
        let first = placement.place(&w("0xb"), &w("0xa")).unwrap();
        // crash before the activation commit: placing again reuses every row
        let second = placement.place(&w("0xb"), &w("0xa")).unwrap();
        assert!(second.resumed);
        assert_eq!(first.rows, second.rows);
        assert_eq!(engine.store().occupancy_of(&w("0xb")).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_placements_keep_slots_unique() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.placement.max_retries = 64;
        config.placement.backoff_base_ms = 1;
        let engine = Arc::new(engine_with(&dir, config));
        activate(&engine, "0xa", "0xroot", 1);

        let handles: Vec<_> = (0..24)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let member = format!("0xm{:02}", i);
                    activate(&engine, &member, "0xa", 10 + i as u64);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store = engine.store();
        let mut seen = HashSet::new();
        for item in store.slots.iter() {
            let (k, _) = item.unwrap();
            assert!(seen.insert(k.to_vec()), "duplicate slot key");
        }
        for root in ["0xroot", "0xa"] {
            for layer in 1..=3u8 {
                assert!(store.layer_count(&w(root), layer).unwrap() <= layer_capacity(layer));
            }
        }
        for i in 0..24 {
            let m = w(&format!("0xm{:02}", i));
            let rows = store.occupancy_of(&m).unwrap();
            let roots: HashSet<_> = rows.iter().map(|r| r.root.clone()).collect();
            assert_eq!(roots.len(), rows.len());
            assert!(store.require_member(&m).unwrap().placed);
        }
        assert_eq!(store.layer_count(&w("0xa"), 1).unwrap(), 3);
    }

    #[test]
    fn test_concurrent_redelivery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.placement.max_retries = 64;
        config.placement.backoff_base_ms = 1;
        let engine = Arc::new(engine_with(&dir, config));
        activate(&engine, "0xa", "0xroot", 1);
        activate(&engine, "0xb", "0xa", 2);

        const MEMBERS: usize = 12;
        const DELIVERIES: usize = 6;
        let handles: Vec<_> = (0..MEMBERS * DELIVERIES)
            .map(|n| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let member = format!("0xm{:02}", n % MEMBERS);
                    let event = ActivationEvent {
                        event_id: format!("act-{}", member),
                        member: w(&member),
                        referrer: w("0xb"),
                    };
                    (member, engine.handle_activation(&event, 10))
                })
            })
            .collect();

        let mut committed: HashSet<String> = HashSet::new();
        for h in handles {
            let (member, result) = h.join().unwrap();
            match result {
                Ok(_) => assert!(committed.insert(member.clone()), "{} committed twice", member),
                Err(HiveError::DuplicateActivation { .. }) => {}
                Err(e) => panic!("redelivery of {} failed: {:?}", member, e),
            }
        }
        assert_eq!(committed.len(), MEMBERS);

        let store = engine.store();
        for i in 0..MEMBERS {
            let m = w(&format!("0xm{:02}", i));
            assert!(store.require_member(&m).unwrap().placed);
            let rows = store.occupancy_of(&m).unwrap();
            let roots: HashSet<_> = rows.iter().map(|r| r.root.clone()).collect();
            assert_eq!(roots.len(), rows.len());
            for (depth, row) in rows.iter().enumerate() {
                assert_eq!(row.slot.layer as usize, depth + 1);
                let holder = store.slot_occupant(&row.root, row.slot).unwrap();
                assert_eq!(holder.as_ref(), Some(&m));
            }
            let event = store.get_event(&format!("act-{}", m)).unwrap().unwrap();
            assert_eq!(event.reward_ids.len(), 1);
        }
        // every slot key has exactly one occupancy mirror
        assert_eq!(store.slots.len(), store.occupancy.len());
        assert_eq!(store.require_member(&w("0xb")).unwrap().direct_referrals, MEMBERS as u32);
    }
}
