// ─────────────────────────────────────────────────────────────────
// Balance Ledger — transferable / locked accounts and tranche releases
// ─────────────────────────────────────────────────────────────────

use hive_core::config::LedgerConfig;
use hive_core::{BalanceAccount, HiveError, ReleaseRecord, Wallet};
use log::{debug, info, warn};
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::Transactional;

use crate::db::{decode, encode, storage, tx_error, wallet_key, wallet_seq_key, HiveStore};

/// A member whose cooldown has elapsed with locked units left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseAvailability {
    pub member: Wallet,
    pub locked: u128,
    pub next_tranche: u128,
}

/// Add `amount` to an account inside an open transaction.
pub(crate) fn credit_in_tx(
    balances: &TransactionalTree,
    member: &Wallet,
    amount: u128,
    now: u64,
) -> ConflictableTransactionResult<BalanceAccount, HiveError> {
    let key = wallet_key(member);
    let mut account: BalanceAccount = match balances.get(&key)? {
        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
        None => BalanceAccount::default(),
    };
    apply_credit(&mut account, amount, now).map_err(ConflictableTransactionError::Abort)?;
    let bytes = encode(&account).map_err(ConflictableTransactionError::Abort)?;
    balances.insert(key, bytes)?;
    Ok(account)
}

fn apply_credit(account: &mut BalanceAccount, amount: u128, now: u64) -> Result<(), HiveError> {
    account.transferable = account
        .transferable
        .checked_add(amount)
        .ok_or_else(|| HiveError::IntegrityFault("transferable balance overflow".to_string()))?;
    account.lifetime_earned = account
        .lifetime_earned
        .checked_add(amount)
        .ok_or_else(|| HiveError::IntegrityFault("lifetime earned overflow".to_string()))?;
    account.last_updated = now;
    Ok(())
}

#[derive(Clone)]
pub struct BalanceLedger {
    store: HiveStore,
    config: LedgerConfig,
}

impl BalanceLedger {
    pub fn new(store: HiveStore, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Seed a new account with `amount` locked plus the configured transferable
    /// bonus. An existing account is returned untouched, so redelivery never seeds twice.
    pub fn initialize_locked_allotment(
        &self,
        member: &Wallet,
        amount: u128,
        now: u64,
    ) -> Result<BalanceAccount, HiveError> {
        let key = wallet_key(member);
        let seeded = BalanceAccount {
            transferable: self.config.initial_transferable,
            locked: amount,
            lifetime_earned: self.config.initial_transferable,
            last_updated: now,
            last_release_at: None,
            release_count: 0,
        };
        let bytes = encode(&seeded)?;
        match self
            .store
            .balances
            .compare_and_swap(&key, None as Option<&[u8]>, Some(bytes))
            .map_err(|e| storage("failed to seed balance", e))?
        {
            Ok(()) => {
                info!(
                    "allotment seeded member={} locked={} transferable={}",
                    member, amount, self.config.initial_transferable
                );
                Ok(seeded)
            }
            Err(cas) => {
                debug!("allotment already present member={}", member);
                match cas.current {
                    Some(existing) => decode(&existing),
                    None => Err(HiveError::Storage(
                        "balance compare-and-swap failed without a current value".to_string(),
                    )),
                }
            }
        }
    }

    /// Atomic increment of transferable and lifetime-earned.
    pub fn credit(&self, member: &Wallet, amount: u128, now: u64) -> Result<BalanceAccount, HiveError> {
        let mut failure: Option<HiveError> = None;
        let updated = self
            .store
            .balances
            .update_and_fetch(wallet_key(member), |old| {
                let mut account = match old.map(decode::<BalanceAccount>) {
                    Some(Ok(a)) => a,
                    Some(Err(e)) => {
                        failure = Some(e);
                        return old.map(|b| b.to_vec());
                    }
                    None => BalanceAccount::default(),
                };
                if let Err(e) = apply_credit(&mut account, amount, now) {
                    failure = Some(e);
                    return old.map(|b| b.to_vec());
                }
                match encode(&account) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        failure = Some(e);
                        old.map(|b| b.to_vec())
                    }
                }
            })
            .map_err(|e| storage("failed to credit balance", e))?;
        if let Some(e) = failure {
            return Err(e);
        }
        let bytes = updated
            .ok_or_else(|| HiveError::Storage("credit produced no account".to_string()))?;
        decode(&bytes)
    }

    /// Move one tranche from locked to transferable, at most once per cooldown.
    pub fn release_locked(&self, member: &Wallet, now: u64) -> Result<ReleaseRecord, HiveError> {
        let key = wallet_key(member);
        let cooldown = self.config.release_cooldown_secs;
        let tranche = self.config.release_tranche;

        let record = (&self.store.balances, &self.store.releases)
            .transaction(
                |(balances, releases)| -> ConflictableTransactionResult<ReleaseRecord, HiveError> {
                    let mut account: BalanceAccount = match balances.get(&key)? {
                        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        None => {
                            return Err(ConflictableTransactionError::Abort(
                                HiveError::UnknownMember(member.to_string()),
                            ))
                        }
                    };
                    let wait = account.release_wait_secs(now, cooldown);
                    if wait > 0 {
                        return Err(ConflictableTransactionError::Abort(
                            HiveError::CooldownActive {
                                member: member.to_string(),
                                remaining_secs: wait,
                            },
                        ));
                    }
                    if account.locked == 0 {
                        return Err(ConflictableTransactionError::Abort(
                            HiveError::InsufficientLocked {
                                member: member.to_string(),
                            },
                        ));
                    }

                    let amount = account.locked.min(tranche);
                    account.locked -= amount;
                    account.transferable = account.transferable.checked_add(amount).ok_or(
                        ConflictableTransactionError::Abort(HiveError::IntegrityFault(
                            "transferable balance overflow".to_string(),
                        )),
                    )?;
                    account.last_updated = now;
                    account.last_release_at = Some(now);
                    account.release_count += 1;

                    let record = ReleaseRecord {
                        seq: account.release_count,
                        amount_released: amount,
                        remaining_locked: account.locked,
                        timestamp: now,
                    };
                    let account_bytes =
                        encode(&account).map_err(ConflictableTransactionError::Abort)?;
                    let record_bytes =
                        encode(&record).map_err(ConflictableTransactionError::Abort)?;
                    balances.insert(key.as_slice(), account_bytes)?;
                    releases.insert(wallet_seq_key(member, record.seq), record_bytes)?;
                    Ok(record)
                },
            )
            .map_err(tx_error)
            .inspect_err(|e| {
                if !matches!(
                    e,
                    HiveError::CooldownActive { .. } | HiveError::InsufficientLocked { .. }
                ) {
                    warn!("release failed member={}: {}", member, e);
                }
            })?;

        info!(
            "released member={} amount={} remaining_locked={} seq={}",
            member, record.amount_released, record.remaining_locked, record.seq
        );
        Ok(record)
    }

    /// Accounts that could release right now.
    pub fn releasable(&self, now: u64) -> Result<Vec<ReleaseAvailability>, HiveError> {
        let mut out = Vec::new();
        for row in self.store.all_balances() {
            let row = row?;
            if row.account.locked == 0
                || row
                    .account
                    .release_wait_secs(now, self.config.release_cooldown_secs)
                    > 0
            {
                continue;
            }
            out.push(ReleaseAvailability {
                next_tranche: row.account.locked.min(self.config.release_tranche),
                locked: row.account.locked,
                member: row.wallet,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HOUR: u64 = 3600;

    fn ledger(dir: &TempDir) -> BalanceLedger {
        BalanceLedger::new(HiveStore::open(dir.path()).unwrap(), LedgerConfig::default())
    }

    fn w(s: &str) -> Wallet {
        Wallet::parse(s).unwrap()
    }

    #[test]
    fn test_seed_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let first = ledger.initialize_locked_allotment(&w("0xaa"), 10_450, 1).unwrap();
        assert_eq!(first.locked, 10_450);
        assert_eq!(first.transferable, 500);
        assert_eq!(first.lifetime_earned, 500);
        let again = ledger.initialize_locked_allotment(&w("0xaa"), 99, 2).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_release_cooldown_scenario() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let m = w("0xaa");
        let t0 = 1_000_000;
        ledger.initialize_locked_allotment(&m, 450, t0).unwrap();

        let first = ledger.release_locked(&m, t0).unwrap();
        assert_eq!(first.amount_released, 100);
        assert_eq!(first.remaining_locked, 350);

        let err = ledger.release_locked(&m, t0 + 70 * HOUR).unwrap_err();
        assert_eq!(
            err,
            HiveError::CooldownActive {
                member: "0xaa".to_string(),
                remaining_secs: 2 * HOUR
            }
        );

        let third = ledger.release_locked(&m, t0 + 75 * HOUR).unwrap();
        assert_eq!(third.amount_released, 100);
        assert_eq!(third.remaining_locked, 250);
        assert_eq!(third.seq, 2);
        assert_eq!(ledger.store.releases_of(&m).unwrap().len(), 2);
    }

    #[test]
    fn test_release_partial_and_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let m = w("0xaa");
        ledger.initialize_locked_allotment(&m, 40, 0).unwrap();
        let r = ledger.release_locked(&m, 0).unwrap();
        assert_eq!(r.amount_released, 40);
        let err = ledger.release_locked(&m, 73 * HOUR).unwrap_err();
        assert!(matches!(err, HiveError::InsufficientLocked { .. }));
        let acct = ledger.store.get_balance(&m).unwrap().unwrap();
        assert_eq!(acct.transferable, 540);
        assert_eq!(acct.locked, 0);
    }

    #[test]
    fn test_release_unknown_member() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        assert!(matches!(
            ledger.release_locked(&w("0xnobody"), 0),
            Err(HiveError::UnknownMember(_))
        ));
    }

    #[test]
    fn test_concurrent_credits_not_lost() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(ledger(&dir));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        ledger.credit(&w("0xaa"), 10, 5).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let acct = ledger.store.get_balance(&w("0xaa")).unwrap().unwrap();
        assert_eq!(acct.transferable, 2_000);
        assert_eq!(acct.lifetime_earned, 2_000);
    }

    #[test]
    fn test_releasable_report() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger.initialize_locked_allotment(&w("0xaa"), 450, 0).unwrap();
        ledger.initialize_locked_allotment(&w("0xbb"), 0, 0).unwrap();
        ledger.initialize_locked_allotment(&w("0xcc"), 50, 0).unwrap();
        ledger.release_locked(&w("0xcc"), 0).unwrap();

        let ready = ledger.releasable(HOUR).unwrap();
        assert_eq!(
            ready,
            vec![ReleaseAvailability {
                member: w("0xaa"),
                locked: 450,
                next_tranche: 100
            }]
        );
    }
}
