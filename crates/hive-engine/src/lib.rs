// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE MATRIX - ENGINE
//
// Placement, reward distribution, balance ledger and timer sweep over one
// sled database. `HiveEngine` is the entry point for collaborator events
// (activation, upgrade), member commands (claim, release) and read views.
//
// All operations are synchronous and take the caller's clock (`now`, unix
// seconds) so that windows and cooldowns are deterministic under test.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::allotment::starter_locked_for;
use hive_core::config::EngineConfig;
use hive_core::{
    level_price, ActivationEvent, BalanceAccount, HiveError, Member, ReferralEdge,
    ReleaseRecord, UpgradeEvent, Wallet,
};
use log::{info, warn};
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::Transactional;
use std::path::Path;

pub mod db;
pub mod distribution;
pub mod ledger;
pub mod placement;
pub mod query;
pub mod sweep;

#[cfg(test)]
pub(crate) mod testutil;

pub use db::{EventKind, EventRecord, HiveStore, StoreStats};
pub use distribution::{ClaimReceipt, RewardDistribution, Settlement, UpgradeOutcome};
pub use ledger::{BalanceLedger, ReleaseAvailability};
pub use placement::{MatrixPlacement, PlacementResult};
pub use query::{BalanceSnapshot, MatrixView, MemberView, RewardBook};
pub use sweep::{SweepReport, TimerSweep};

use db::{
    decode, encode, pair_key, read_u64, tx_error, u64_key, wallet_key, META_NETWORK_ROOT,
    META_NEXT_SEQ,
};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationOutcome {
    pub member: Member,
    pub placement: PlacementResult,
    pub rewards: Vec<hive_core::LayerReward>,
    pub balance: BalanceAccount,
}

fn abort<T>(e: HiveError) -> ConflictableTransactionResult<T, HiveError> {
    Err(ConflictableTransactionError::Abort(e))
}

fn next_seq(
    meta: &sled::transaction::TransactionalTree,
) -> ConflictableTransactionResult<u64, HiveError> {
    let seq = match meta.get(META_NEXT_SEQ)? {
        Some(bytes) => read_u64(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => 0,
    };
    meta.insert(META_NEXT_SEQ, &u64_key(seq + 1)[..])?;
    Ok(seq)
}

pub struct HiveEngine {
    store: HiveStore,
    config: EngineConfig,
    placement: MatrixPlacement,
    distribution: RewardDistribution,
    ledger: BalanceLedger,
    timer: TimerSweep,
}

impl HiveEngine {
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self, HiveError> {
        config.validate()?;
        Ok(Self::with_store(HiveStore::open(path)?, config))
    }

    pub fn with_store(store: HiveStore, config: EngineConfig) -> Self {
        let placement = MatrixPlacement::new(store.clone(), config.placement.clone());
        let distribution = RewardDistribution::new(store.clone(), config.rewards.clone());
        let ledger = BalanceLedger::new(store.clone(), config.ledger.clone());
        let timer = TimerSweep::new(store.clone(), distribution.clone(), ledger.clone());
        Self {
            store,
            config,
            placement,
            distribution,
            ledger,
            timer,
        }
    }

    pub fn store(&self) -> &HiveStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn distribution(&self) -> &RewardDistribution {
        &self.distribution
    }

    pub fn ledger(&self) -> &BalanceLedger {
        &self.ledger
    }

    pub fn flush(&self) -> Result<(), HiveError> {
        self.store.flush()
    }

    // ─────────────────────────────────────────────────────────────────
    // REGISTRATION
    // ─────────────────────────────────────────────────────────────────

    /// Create the network root: no referrer, no placement, terminus of every
    /// ancestor chain. Re-registering the same wallet returns the stored record.
    pub fn register_root(&self, wallet: &Wallet, level: u8, now: u64) -> Result<Member, HiveError> {
        if level_price(level).is_none() {
            return Err(HiveError::InvalidLevel(level));
        }
        let key = wallet_key(wallet);
        let wallet_bytes = encode(wallet)?;

        let member = (
            &self.store.members,
            &self.store.activation_order,
            &self.store.meta,
        )
            .transaction(
                |(members, order, meta)| -> ConflictableTransactionResult<Member, HiveError> {
                    if let Some(bytes) = meta.get(META_NETWORK_ROOT)? {
                        let existing: Wallet =
                            decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                        if existing != *wallet {
                            return abort(HiveError::Config(format!(
                                "network root already registered as {}",
                                existing
                            )));
                        }
                        return match members.get(&key)? {
                            Some(bytes) => {
                                decode(&bytes).map_err(ConflictableTransactionError::Abort)
                            }
                            None => abort(HiveError::IntegrityFault(format!(
                                "network root {} has no member record",
                                wallet
                            ))),
                        };
                    }
                    if members.get(&key)?.is_some() {
                        return abort(HiveError::DuplicateActivation {
                            member: wallet.to_string(),
                        });
                    }
                    let seq = next_seq(meta)?;
                    let member = Member {
                        wallet: wallet.clone(),
                        level,
                        activation_seq: seq,
                        referrer: None,
                        direct_referrals: 0,
                        placement: None,
                        placed: true,
                        activated_at: now,
                    };
                    let bytes = encode(&member).map_err(ConflictableTransactionError::Abort)?;
                    members.insert(key.as_slice(), bytes)?;
                    order.insert(&u64_key(seq)[..], wallet_bytes.as_slice())?;
                    meta.insert(META_NETWORK_ROOT, wallet_bytes.as_slice())?;
                    Ok(member)
                },
            )
            .map_err(tx_error)?;

        info!("network root member={} level={}", wallet, member.level);
        Ok(member)
    }

    /// Record the member, its activation sequence and its referral edge.
    /// A registered but unplaced member is returned as-is so activation can resume.
    /// The referrer's direct-referral count moves at the activation commit.
    pub fn register_member(
        &self,
        member: &Wallet,
        referrer: &Wallet,
        now: u64,
    ) -> Result<Member, HiveError> {
        if member == referrer {
            return Err(HiveError::InvalidWallet(format!(
                "{} cannot refer itself",
                member
            )));
        }
        match self.store.get_member(referrer)? {
            None => return Err(HiveError::UnknownReferrer(referrer.to_string())),
            Some(r) if !r.placed => return Err(HiveError::ReferrerNotPlaced(referrer.to_string())),
            Some(_) => {}
        }

        let member_key = wallet_key(member);
        let member_bytes = encode(member)?;
        let edge = encode(&ReferralEdge {
            referrer: referrer.clone(),
            referred: member.clone(),
        })?;
        let edge_key = pair_key(referrer, member);

        (
            &self.store.members,
            &self.store.activation_order,
            &self.store.referrals,
            &self.store.meta,
        )
            .transaction(
                |(members, order, referrals, meta)| -> ConflictableTransactionResult<Member, HiveError> {
                    if let Some(bytes) = members.get(&member_key)? {
                        let existing: Member =
                            decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                        if existing.placed {
                            return abort(HiveError::DuplicateActivation {
                                member: member.to_string(),
                            });
                        }
                        return Ok(existing);
                    }
                    if members.get(wallet_key(referrer))?.is_none() {
                        return abort(HiveError::UnknownReferrer(referrer.to_string()));
                    }

                    let seq = next_seq(meta)?;
                    let record = Member {
                        wallet: member.clone(),
                        level: 1,
                        activation_seq: seq,
                        referrer: Some(referrer.clone()),
                        direct_referrals: 0,
                        placement: None,
                        placed: false,
                        activated_at: now,
                    };
                    let record_bytes = encode(&record).map_err(ConflictableTransactionError::Abort)?;
                    members.insert(member_key.as_slice(), record_bytes)?;
                    order.insert(&u64_key(seq)[..], member_bytes.as_slice())?;
                    referrals.insert(edge_key.as_slice(), edge.as_slice())?;
                    Ok(record)
                },
            )
            .map_err(tx_error)
    }

    // ─────────────────────────────────────────────────────────────────
    // EVENTS
    // ─────────────────────────────────────────────────────────────────

    /// First activation: register, seed the allotment, place, then commit the
    /// level-1 reward. Every step is safe to repeat after a partial failure.
    pub fn handle_activation(
        &self,
        event: &ActivationEvent,
        now: u64,
    ) -> Result<ActivationOutcome, HiveError> {
        let result = self.activate(event, now);
        if let Err(HiveError::DuplicateActivation { member }) = &result {
            info!(
                "duplicate activation ignored member={} event={}",
                member, event.event_id
            );
        }
        result
    }

    fn activate(&self, event: &ActivationEvent, now: u64) -> Result<ActivationOutcome, HiveError> {
        if self.store.get_event(&event.event_id)?.is_some() {
            return Err(HiveError::DuplicateActivation {
                member: event.member.to_string(),
            });
        }

        let registered = self.register_member(&event.member, &event.referrer, now)?;
        let referrer = match &registered.referrer {
            Some(original) if *original != event.referrer => {
                warn!(
                    "activation redelivered with a different referrer member={} stored={} event={}",
                    event.member, original, event.referrer
                );
                original.clone()
            }
            Some(original) => original.clone(),
            None => event.referrer.clone(),
        };

        let locked = starter_locked_for(
            registered.activation_seq,
            self.config.ledger.starter_locked,
            &self.config.ledger.tiers,
        );
        let balance = self
            .ledger
            .initialize_locked_allotment(&event.member, locked, now)?;
        let placement = self.placement.place(&event.member, &referrer)?;
        let rewards = self.distribution.commit_activation(event, now)?;

        // The referrer just gained a direct referral.
        if let Err(e) = self.distribution.refresh_pending(&referrer, now) {
            warn!("eager refresh failed member={}: {}", referrer, e);
        }

        let member = self.store.require_member(&event.member)?;
        info!(
            "activated member={} seq={} referrer={} root={} spilled={}",
            member.wallet, member.activation_seq, referrer, placement.root, placement.spilled
        );
        Ok(ActivationOutcome {
            member,
            placement,
            rewards,
            balance,
        })
    }

    pub fn handle_upgrade(&self, event: &UpgradeEvent, now: u64) -> Result<UpgradeOutcome, HiveError> {
        self.distribution.on_upgrade(event, now)
    }

    /// Placement alone, for a registered member whose activation is being resumed.
    pub fn place(&self, member: &Wallet, referrer: &Wallet) -> Result<PlacementResult, HiveError> {
        self.placement.place(member, referrer)
    }

    // ─────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────

    pub fn claim(&self, reward_id: u64, claimant: &Wallet, now: u64) -> Result<ClaimReceipt, HiveError> {
        self.distribution.claim(reward_id, claimant, now)
    }

    pub fn credit(&self, member: &Wallet, amount: u128, now: u64) -> Result<BalanceAccount, HiveError> {
        self.ledger.credit(member, amount, now)
    }

    pub fn initialize_locked_allotment(
        &self,
        member: &Wallet,
        amount: u128,
        now: u64,
    ) -> Result<BalanceAccount, HiveError> {
        self.ledger.initialize_locked_allotment(member, amount, now)
    }

    pub fn release_locked(&self, member: &Wallet, now: u64) -> Result<ReleaseRecord, HiveError> {
        self.ledger.release_locked(member, now)
    }

    pub fn sweep(&self, now: u64) -> Result<SweepReport, HiveError> {
        self.timer.run(now)
    }

    // ─────────────────────────────────────────────────────────────────
    // VIEWS
    // ─────────────────────────────────────────────────────────────────

    pub fn matrix_view(&self, root: &Wallet, depth: u8) -> Result<MatrixView, HiveError> {
        query::matrix_view(&self.store, root, depth)
    }

    pub fn reward_book(&self, wallet: &Wallet, now: u64) -> Result<RewardBook, HiveError> {
        query::reward_book(&self.store, wallet, now)
    }

    pub fn balance_snapshot(&self, wallet: &Wallet, now: u64) -> Result<BalanceSnapshot, HiveError> {
        query::balance_snapshot(&self.store, &self.config.ledger, wallet, now)
    }

    pub fn member_view(&self, wallet: &Wallet) -> Result<MemberView, HiveError> {
        query::member_view(&self.store, wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{activate, open_engine, w};
    use tempfile::TempDir;

    fn event(id: &str, member: &str, referrer: &str) -> ActivationEvent {
        ActivationEvent {
            event_id: id.to_string(),
            member: w(member),
            referrer: w(referrer),
        }
    }

    #[test]
    fn test_redelivered_activation_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let ev = event("evt-1", "0xa", "0xroot");
        engine.handle_activation(&ev, 1).unwrap();
        let slots_before = engine.store().stats().slots;

        let err = engine.handle_activation(&ev, 2).unwrap_err();
        assert!(matches!(err, HiveError::DuplicateActivation { .. }));
        // a different event id for the same member is a duplicate too
        let err = engine
            .handle_activation(&event("evt-2", "0xa", "0xroot"), 3)
            .unwrap_err();
        assert!(matches!(err, HiveError::DuplicateActivation { .. }));
        assert_eq!(engine.store().stats().slots, slots_before);
        assert_eq!(engine.store().rewards_for(&w("0xroot")).unwrap().len(), 1);
    }

    #[test]
    fn test_registration_rules() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        assert!(matches!(
            engine.handle_activation(&event("e", "0xa", "0xghost"), 1),
            Err(HiveError::UnknownReferrer(_))
        ));
        assert!(matches!(
            engine.handle_activation(&event("e", "0xa", "0xa"), 1),
            Err(HiveError::InvalidWallet(_))
        ));
        assert!(engine.store().get_member(&w("0xa")).unwrap().is_none());
    }

    #[test]
    fn test_root_registration_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let again = engine.register_root(&w("0xroot"), 19, 50).unwrap();
        assert_eq!(again.activation_seq, 0);
        assert_eq!(again.activated_at, 0);
        assert!(matches!(
            engine.register_root(&w("0xother"), 19, 50),
            Err(HiveError::Config(_))
        ));
        assert_eq!(engine.register_root(&w("0xx"), 0, 1).unwrap_err(), HiveError::InvalidLevel(0));
    }

    #[test]
    fn test_activation_seeds_tiered_allotment() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let a = activate(&engine, "0xa", "0xroot", 1);
        assert_eq!(a.member.activation_seq, 1);
        assert_eq!(a.balance.locked, 10_450);
        assert_eq!(a.balance.transferable, 500);
        let root = engine.store().require_member(&w("0xroot")).unwrap();
        assert_eq!(root.direct_referrals, 1);
    }

    #[test]
    fn test_referral_counted_at_commit() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        engine.register_member(&w("0xa"), &w("0xroot"), 1).unwrap();
        let root = engine.store().require_member(&w("0xroot")).unwrap();
        assert_eq!(root.direct_referrals, 0);

        engine
            .handle_activation(&event("evt-a", "0xa", "0xroot"), 2)
            .unwrap();
        let root = engine.store().require_member(&w("0xroot")).unwrap();
        assert_eq!(root.direct_referrals, 1);
        // a rejected redelivery leaves the count alone
        assert!(engine.handle_activation(&event("evt-a", "0xa", "0xroot"), 3).is_err());
        let root = engine.store().require_member(&w("0xroot")).unwrap();
        assert_eq!(root.direct_referrals, 1);
    }

    #[test]
    fn test_resumes_after_interrupted_activation() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        // registration and placement done, commit never ran
        engine.register_member(&w("0xa"), &w("0xroot"), 1).unwrap();
        engine.place(&w("0xa"), &w("0xroot")).unwrap();

        let out = engine
            .handle_activation(&event("evt-a", "0xa", "0xroot"), 2)
            .unwrap();
        assert!(out.placement.resumed);
        assert!(out.member.placed);
        assert_eq!(out.rewards.len(), 1);
        let root = engine.store().require_member(&w("0xroot")).unwrap();
        assert_eq!(root.direct_referrals, 1);
    }
}
