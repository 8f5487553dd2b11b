// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE MATRIX - REWARD DISTRIBUTION ENGINE
//
// A purchase of level N pays the ancestor under whom the buyer sits at
// layer N. Eligible ancestors get a `claimable` row at once; the others get
// a `pending` row with a decision window. An elapsed window rolls the
// obligation one placement hop up, or expires it past the last ancestor.
//
//   pending ──► claimable ──► claimed
//      │
//      ├──► rolled_up  (successor row created for the next ancestor)
//      └──► expired
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::config::RewardsConfig;
use hive_core::rewards::{decide, evaluate, CandidateSnapshot, Eligibility, SweepDecision};
use hive_core::{
    level_price, ActivationEvent, BalanceAccount, ClaimRejection, HiveError, LayerReward, Member,
    RewardStatus, UpgradeEvent, Wallet, MAX_LAYER,
};
use log::{debug, info, warn};
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::Transactional;

use crate::db::{
    decode, encode, tx_error, u64_key, wallet_key, wallet_seq_key, EventKind, EventRecord,
    HiveStore,
};
use crate::ledger::credit_in_tx;

/// Result of re-evaluating one reward row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Settlement {
    Unchanged,
    Promoted { reward_id: u64 },
    RolledUp { reward_id: u64, successor: LayerReward },
    Expired { reward_id: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    pub member: Member,
    pub rewards: Vec<LayerReward>,
    pub settlements: Vec<Settlement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimReceipt {
    pub reward: LayerReward,
    pub balance: BalanceAccount,
}

/// Reward row plus its encoded form, prepared outside a transaction.
struct StagedReward {
    reward: LayerReward,
    bytes: Vec<u8>,
    index_key: Vec<u8>,
}

impl StagedReward {
    fn new(reward: LayerReward) -> Result<Self, HiveError> {
        Ok(Self {
            bytes: encode(&reward)?,
            index_key: wallet_seq_key(&reward.recipient, reward.id),
            reward,
        })
    }
}

fn stage_in_tx(
    rewards: &TransactionalTree,
    index: &TransactionalTree,
    staged: &[StagedReward],
) -> ConflictableTransactionResult<(), HiveError> {
    for s in staged {
        rewards.insert(&u64_key(s.reward.id)[..], s.bytes.as_slice())?;
        index.insert(s.index_key.as_slice(), &[] as &[u8])?;
    }
    Ok(())
}

fn abort<T>(e: HiveError) -> ConflictableTransactionResult<T, HiveError> {
    Err(ConflictableTransactionError::Abort(e))
}

fn snapshot(member: &Member) -> CandidateSnapshot {
    CandidateSnapshot {
        level: member.level,
        direct_referrals: member.direct_referrals,
    }
}

#[derive(Clone)]
pub struct RewardDistribution {
    store: HiveStore,
    config: RewardsConfig,
}

impl RewardDistribution {
    pub fn new(store: HiveStore, config: RewardsConfig) -> Self {
        Self { store, config }
    }

    fn eligibility_of(&self, candidate: &Wallet, reward_level: u8) -> Result<Eligibility, HiveError> {
        let member = self.store.get_member(candidate)?;
        Ok(evaluate(
            &self.config,
            member.as_ref().map(snapshot).as_ref(),
            reward_level,
        ))
    }

    /// Build one reward per ancestor under whom `member` sits at layer `level`.
    fn prepare_rewards(
        &self,
        member: &Wallet,
        level: u8,
        now: u64,
    ) -> Result<Vec<LayerReward>, HiveError> {
        let amount = level_price(level).ok_or(HiveError::InvalidLevel(level))?;
        let mut out = Vec::new();
        for row in self.store.occupancy_of(member)? {
            if row.slot.layer != level {
                continue;
            }
            let eligibility = self.eligibility_of(&row.root, level)?;
            let (status, decision_deadline) = self.initial_state(eligibility, now);
            out.push(LayerReward {
                id: self.store.next_reward_id()?,
                trigger_member: member.clone(),
                trigger_level: level,
                layer: row.slot.layer,
                candidate_chain: Vec::new(),
                recipient: row.root,
                amount,
                status,
                created_at: now,
                decision_deadline,
                claimed_at: None,
                resolved_at: None,
                rollup_source: None,
            });
        }
        Ok(out)
    }

    /// Unreachable candidates get an already-elapsed window so the first
    /// settle rolls them up.
    fn initial_state(&self, eligibility: Eligibility, now: u64) -> (RewardStatus, Option<u64>) {
        match eligibility.initial_status() {
            Some(RewardStatus::Claimable) => (RewardStatus::Claimable, None),
            Some(status) => (
                status,
                Some(now.saturating_add(self.config.pending_window_secs)),
            ),
            None => (RewardStatus::Pending, Some(now)),
        }
    }

    fn settle_created(&self, rewards: &[LayerReward], now: u64) -> Vec<Settlement> {
        rewards
            .iter()
            .filter(|r| r.decision_deadline.is_some_and(|d| d <= now))
            .filter_map(|r| match self.settle(r.id, now) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("settle after create failed reward={}: {}", r.id, e);
                    None
                }
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────
    // EVENT COMMITS
    // ─────────────────────────────────────────────────────────────────

    /// Final step of an activation: level-1 reward, event marker, the `placed`
    /// flag and the referrer's direct-referral count commit together.
    pub fn commit_activation(
        &self,
        event: &ActivationEvent,
        now: u64,
    ) -> Result<Vec<LayerReward>, HiveError> {
        let rewards = self.prepare_rewards(&event.member, 1, now)?;
        if rewards.is_empty() {
            return Err(HiveError::IntegrityFault(format!(
                "{} has no layer-1 slot at activation commit",
                event.member
            )));
        }
        let staged = rewards
            .iter()
            .cloned()
            .map(StagedReward::new)
            .collect::<Result<Vec<_>, _>>()?;
        let record = encode(&EventRecord {
            event_id: event.event_id.clone(),
            kind: EventKind::Activation,
            member: event.member.clone(),
            level: 1,
            reward_ids: rewards.iter().map(|r| r.id).collect(),
            processed_at: now,
        })?;
        let member_key = wallet_key(&event.member);
        let duplicate = || HiveError::DuplicateActivation {
            member: event.member.to_string(),
        };

        (
            &self.store.members,
            &self.store.events,
            &self.store.rewards,
            &self.store.reward_index,
        )
            .transaction(
                |(members, events, rewards_tx, index)| -> ConflictableTransactionResult<(), HiveError> {
                    if events.get(event.event_id.as_bytes())?.is_some() {
                        return abort(duplicate());
                    }
                    let mut member: Member = match members.get(&member_key)? {
                        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        None => return abort(HiveError::UnknownMember(event.member.to_string())),
                    };
                    if member.placed {
                        return abort(duplicate());
                    }
                    member.placed = true;
                    let bytes = encode(&member).map_err(ConflictableTransactionError::Abort)?;
                    members.insert(member_key.as_slice(), bytes)?;

                    if let Some(referrer) = &member.referrer {
                        let referrer_key = wallet_key(referrer);
                        let mut parent: Member = match members.get(&referrer_key)? {
                            Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                            None => return abort(HiveError::UnknownReferrer(referrer.to_string())),
                        };
                        parent.direct_referrals += 1;
                        let bytes = encode(&parent).map_err(ConflictableTransactionError::Abort)?;
                        members.insert(referrer_key.as_slice(), bytes)?;
                    }
                    events.insert(event.event_id.as_bytes(), record.as_slice())?;
                    stage_in_tx(rewards_tx, index, &staged)
                },
            )
            .map_err(tx_error)?;

        for r in &rewards {
            info!(
                "reward created id={} trigger={} level=1 recipient={} amount={} status={}",
                r.id, r.trigger_member, r.recipient, r.amount, r.status
            );
        }
        self.settle_created(&rewards, now);
        Ok(rewards)
    }

    /// Apply a verified level purchase: bump the level and create the layer rewards.
    pub fn on_upgrade(&self, event: &UpgradeEvent, now: u64) -> Result<UpgradeOutcome, HiveError> {
        let level = event.new_level;
        let price = level_price(level).ok_or(HiveError::InvalidLevel(level))?;
        if self.store.get_event(&event.event_id)?.is_some() {
            return Err(HiveError::DuplicateEvent {
                event_id: event.event_id.clone(),
            });
        }
        let current = match self.store.get_member(&event.member)? {
            Some(m) if m.placed => m,
            _ => return Err(HiveError::UnknownMember(event.member.to_string())),
        };
        let non_sequential = |current_level: u8| HiveError::NonSequentialLevel {
            member: event.member.to_string(),
            expected: current_level.saturating_add(1),
            requested: level,
        };
        if current.level.checked_add(1) != Some(level) {
            return Err(non_sequential(current.level));
        }
        if event.price_paid < price {
            return Err(HiveError::Underpaid {
                level,
                paid: event.price_paid,
                price,
            });
        }

        let rewards = self.prepare_rewards(&event.member, level, now)?;
        let staged = rewards
            .iter()
            .cloned()
            .map(StagedReward::new)
            .collect::<Result<Vec<_>, _>>()?;
        let record = encode(&EventRecord {
            event_id: event.event_id.clone(),
            kind: EventKind::Upgrade,
            member: event.member.clone(),
            level,
            reward_ids: rewards.iter().map(|r| r.id).collect(),
            processed_at: now,
        })?;
        let member_key = wallet_key(&event.member);

        let member = (
            &self.store.members,
            &self.store.events,
            &self.store.rewards,
            &self.store.reward_index,
        )
            .transaction(
                |(members, events, rewards_tx, index)| -> ConflictableTransactionResult<Member, HiveError> {
                    if events.get(event.event_id.as_bytes())?.is_some() {
                        return abort(HiveError::DuplicateEvent {
                            event_id: event.event_id.clone(),
                        });
                    }
                    let mut member: Member = match members.get(&member_key)? {
                        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        None => return abort(HiveError::UnknownMember(event.member.to_string())),
                    };
                    // A concurrent upgrade may have landed since the checks above.
                    if member.level.checked_add(1) != Some(level) {
                        return abort(non_sequential(member.level));
                    }
                    member.level = level;
                    let bytes = encode(&member).map_err(ConflictableTransactionError::Abort)?;
                    members.insert(member_key.as_slice(), bytes)?;
                    events.insert(event.event_id.as_bytes(), record.as_slice())?;
                    stage_in_tx(rewards_tx, index, &staged)?;
                    Ok(member)
                },
            )
            .map_err(tx_error)?;

        info!(
            "upgrade member={} level={} paid={} rewards={}",
            event.member,
            level,
            event.price_paid,
            rewards.len()
        );
        for r in &rewards {
            info!(
                "reward created id={} trigger={} level={} recipient={} amount={} status={}",
                r.id, r.trigger_member, level, r.recipient, r.amount, r.status
            );
        }

        let mut settlements = self.settle_created(&rewards, now);
        // The member's own pending rewards may have just become eligible.
        settlements.extend(self.refresh_pending(&event.member, now)?);

        Ok(UpgradeOutcome {
            member,
            rewards,
            settlements,
        })
    }

    // ─────────────────────────────────────────────────────────────────
    // CLAIM
    // ─────────────────────────────────────────────────────────────────

    /// Pay out a claimable reward to its current recipient exactly once.
    pub fn claim(&self, reward_id: u64, claimant: &Wallet, now: u64) -> Result<ClaimReceipt, HiveError> {
        let key = u64_key(reward_id);
        let receipt = (&self.store.rewards, &self.store.balances)
            .transaction(
                |(rewards, balances)| -> ConflictableTransactionResult<ClaimReceipt, HiveError> {
                    let mut reward: LayerReward = match rewards.get(key)? {
                        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        None => return abort(HiveError::UnknownReward(reward_id)),
                    };
                    if reward.status != RewardStatus::Claimable {
                        return abort(HiveError::IneligibleClaim {
                            reward_id,
                            reason: ClaimRejection::NotClaimable,
                        });
                    }
                    if reward.recipient != *claimant {
                        return abort(HiveError::IneligibleClaim {
                            reward_id,
                            reason: ClaimRejection::WrongClaimant,
                        });
                    }
                    reward.status = RewardStatus::Claimed;
                    reward.claimed_at = Some(now);
                    let bytes = encode(&reward).map_err(ConflictableTransactionError::Abort)?;
                    rewards.insert(&key[..], bytes)?;
                    let balance = credit_in_tx(balances, claimant, reward.amount, now)?;
                    Ok(ClaimReceipt { reward, balance })
                },
            )
            .map_err(tx_error)?;

        info!(
            "reward claimed id={} recipient={} amount={}",
            reward_id, claimant, receipt.reward.amount
        );
        Ok(receipt)
    }

    // ─────────────────────────────────────────────────────────────────
    // SETTLEMENT (sweep + eager promotion)
    // ─────────────────────────────────────────────────────────────────

    /// Apply the pending-window decision to one reward.
    pub fn settle(&self, reward_id: u64, now: u64) -> Result<Settlement, HiveError> {
        let reward = self
            .store
            .get_reward(reward_id)?
            .ok_or(HiveError::UnknownReward(reward_id))?;
        let eligible =
            self.eligibility_of(&reward.recipient, reward.trigger_level)? == Eligibility::Eligible;

        match decide(reward.status, reward.decision_deadline, now, eligible) {
            SweepDecision::Keep => Ok(Settlement::Unchanged),
            SweepDecision::Promote => self.promote(reward_id, now),
            SweepDecision::Rollup => self.rollup(reward, now),
        }
    }

    /// Re-evaluate every pending reward addressed to `wallet`.
    pub fn refresh_pending(&self, wallet: &Wallet, now: u64) -> Result<Vec<Settlement>, HiveError> {
        let mut out = Vec::new();
        for reward in self.store.rewards_for(wallet)? {
            if reward.status != RewardStatus::Pending {
                continue;
            }
            let s = self.settle(reward.id, now)?;
            if s != Settlement::Unchanged {
                out.push(s);
            }
        }
        Ok(out)
    }

    /// Pending → terminal-or-claimable transition guarded by the pending precondition.
    fn transition(
        &self,
        reward_id: u64,
        next: RewardStatus,
        now: u64,
        successor: Option<&StagedReward>,
    ) -> Result<bool, HiveError> {
        let key = u64_key(reward_id);
        (&self.store.rewards, &self.store.reward_index)
            .transaction(
                |(rewards, index)| -> ConflictableTransactionResult<bool, HiveError> {
                    let mut reward: LayerReward = match rewards.get(key)? {
                        Some(bytes) => decode(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        None => return abort(HiveError::UnknownReward(reward_id)),
                    };
                    if reward.status != RewardStatus::Pending {
                        // settled by a concurrent sweep or refresh
                        return Ok(false);
                    }
                    if !reward.status.can_transition_to(next) {
                        return abort(HiveError::IntegrityFault(format!(
                            "reward {} cannot move {} -> {}",
                            reward_id, reward.status, next
                        )));
                    }
                    reward.status = next;
                    reward.resolved_at = Some(now);
                    let bytes = encode(&reward).map_err(ConflictableTransactionError::Abort)?;
                    rewards.insert(&key[..], bytes)?;
                    if let Some(s) = successor {
                        stage_in_tx(rewards, index, std::slice::from_ref(s))?;
                    }
                    Ok(true)
                },
            )
            .map_err(tx_error)
    }

    fn promote(&self, reward_id: u64, now: u64) -> Result<Settlement, HiveError> {
        if self.transition(reward_id, RewardStatus::Claimable, now, None)? {
            info!("reward promoted id={}", reward_id);
            Ok(Settlement::Promoted { reward_id })
        } else {
            Ok(Settlement::Unchanged)
        }
    }

    /// Forward the obligation to the ancestor one placement hop above the
    /// current recipient, i.e. where the trigger member sits one layer deeper.
    fn rollup(&self, reward: LayerReward, now: u64) -> Result<Settlement, HiveError> {
        let next_layer = reward.layer + 1;
        let next = if next_layer > MAX_LAYER {
            None
        } else {
            self.store
                .occupancy_of(&reward.trigger_member)?
                .into_iter()
                .find(|row| row.slot.layer == next_layer)
        };

        let Some(row) = next else {
            if self.transition(reward.id, RewardStatus::Expired, now, None)? {
                info!(
                    "reward expired id={} trigger={} last_candidate={}",
                    reward.id, reward.trigger_member, reward.recipient
                );
                return Ok(Settlement::Expired {
                    reward_id: reward.id,
                });
            }
            return Ok(Settlement::Unchanged);
        };

        let eligibility = self.eligibility_of(&row.root, reward.trigger_level)?;
        let (status, decision_deadline) = self.initial_state(eligibility, now);
        let mut candidate_chain = reward.candidate_chain.clone();
        candidate_chain.push(reward.recipient.clone());
        let successor = LayerReward {
            id: self.store.next_reward_id()?,
            trigger_member: reward.trigger_member.clone(),
            trigger_level: reward.trigger_level,
            layer: row.slot.layer,
            candidate_chain,
            recipient: row.root,
            amount: reward.amount,
            status,
            created_at: now,
            decision_deadline,
            claimed_at: None,
            resolved_at: None,
            rollup_source: Some(reward.id),
        };
        let staged = StagedReward::new(successor)?;

        if !self.transition(reward.id, RewardStatus::RolledUp, now, Some(&staged))? {
            return Ok(Settlement::Unchanged);
        }
        let successor = staged.reward;
        info!(
            "reward rolled up id={} successor={} from={} to={} status={}",
            reward.id, successor.id, reward.recipient, successor.recipient, successor.status
        );

        if successor.decision_deadline.is_some_and(|d| d <= now) {
            // unreachable successor: keep walking up right away
            debug!("successor {} unreachable, settling immediately", successor.id);
            self.settle(successor.id, now)?;
        }
        Ok(Settlement::RolledUp {
            reward_id: reward.id,
            successor,
        })
    }
}
