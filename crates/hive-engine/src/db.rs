// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE MATRIX - STORAGE MODULE
//
// One sled database, one named tree per record kind, bincode values.
// `slots` is the single authority for occupancy: a (root, layer, index) key
// is written together with its `occupancy` mirror inside one transaction
// that checks both are absent.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::{
    BalanceAccount, HiveError, LayerReward, MatrixSlot, Member, ReferralEdge, ReleaseRecord,
    SlotRef, Wallet,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::{Db, Tree};
use std::path::Path;

const TREE_MEMBERS: &str = "members";
const TREE_ACTIVATION_ORDER: &str = "activation_order";
const TREE_REFERRALS: &str = "referrals";
const TREE_SLOTS: &str = "slots";
const TREE_OCCUPANCY: &str = "occupancy";
const TREE_REWARDS: &str = "rewards";
const TREE_REWARD_INDEX: &str = "reward_index";
const TREE_BALANCES: &str = "balances";
const TREE_RELEASES: &str = "releases";
const TREE_EVENTS: &str = "events";
const TREE_META: &str = "meta";

pub(crate) const META_NEXT_SEQ: &[u8] = b"next_activation_seq";
pub(crate) const META_NETWORK_ROOT: &[u8] = b"network_root";
pub(crate) const META_SPILL_CURSOR: &[u8] = b"spill_cursor";
const META_LAYER_CURSOR_PREFIX: &[u8] = b"layer_cursor/";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Activation,
    Upgrade,
}

/// Marker for a processed collaborator event, written in the same
/// transaction as the state change it caused.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_id: String,
    pub kind: EventKind,
    pub member: Wallet,
    pub level: u8,
    pub reward_ids: Vec<u64>,
    pub processed_at: u64,
}

// ─────────────────────────────────────────────────────────────────
// KEY LAYOUT
// ─────────────────────────────────────────────────────────────────
// Wallet components are prefixed with their byte length (u8) so that
// prefix scans over one wallet never match a longer wallet.

pub(crate) fn wallet_key(w: &Wallet) -> Vec<u8> {
    let bytes = w.as_bytes();
    let mut key = Vec::with_capacity(1 + bytes.len());
    key.push(bytes.len() as u8);
    key.extend_from_slice(bytes);
    key
}

pub(crate) fn slot_layer_prefix(root: &Wallet, layer: u8) -> Vec<u8> {
    let mut key = wallet_key(root);
    key.push(layer);
    key
}

pub(crate) fn slot_key(root: &Wallet, layer: u8, index: u64) -> Vec<u8> {
    let mut key = slot_layer_prefix(root, layer);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub(crate) fn pair_key(first: &Wallet, second: &Wallet) -> Vec<u8> {
    let mut key = wallet_key(first);
    key.extend_from_slice(&wallet_key(second));
    key
}

pub(crate) fn wallet_seq_key(w: &Wallet, seq: u64) -> Vec<u8> {
    let mut key = wallet_key(w);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Meta key of the free-index hint for one (root, layer).
pub(crate) fn layer_cursor_key(root: &Wallet, layer: u8) -> Vec<u8> {
    let mut key = META_LAYER_CURSOR_PREFIX.to_vec();
    key.extend_from_slice(&slot_layer_prefix(root, layer));
    key
}

pub(crate) fn u64_key(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn trailing_u64(key: &[u8]) -> Result<u64, HiveError> {
    if key.len() < 8 {
        return Err(HiveError::Codec(format!("key too short: {} bytes", key.len())));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_u64(bytes: &[u8]) -> Result<u64, HiveError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| HiveError::Codec(format!("expected 8-byte counter, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

// ─────────────────────────────────────────────────────────────────
// CODEC
// ─────────────────────────────────────────────────────────────────

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, HiveError> {
    bincode::serialize(value).map_err(|e| HiveError::Codec(format!("encode failed: {}", e)))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HiveError> {
    bincode::deserialize(bytes).map_err(|e| HiveError::Codec(format!("decode failed: {}", e)))
}

pub(crate) fn storage(context: &str, e: sled::Error) -> HiveError {
    HiveError::Storage(format!("{}: {}", context, e))
}

/// Unwrap a sled transaction failure into the domain error that aborted it.
pub(crate) fn tx_error(e: TransactionError<HiveError>) -> HiveError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(err) => HiveError::Storage(format!("transaction: {}", err)),
    }
}

/// Database handle with all named trees opened once.
#[derive(Clone)]
pub struct HiveStore {
    db: Db,
    pub(crate) members: Tree,
    pub(crate) activation_order: Tree,
    pub(crate) referrals: Tree,
    pub(crate) slots: Tree,
    pub(crate) occupancy: Tree,
    pub(crate) rewards: Tree,
    pub(crate) reward_index: Tree,
    pub(crate) balances: Tree,
    pub(crate) releases: Tree,
    pub(crate) events: Tree,
    pub(crate) meta: Tree,
}

impl HiveStore {
    /// Open or create the database, retrying with backoff while another
    /// process still holds the file lock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HiveError> {
        let path_ref = path.as_ref();
        let retry_delays_ms: [u64; 3] = [500, 1000, 2000];

        let mut last_err = match sled::open(path_ref) {
            Ok(db) => return Self::from_db(db),
            Err(e) if Self::is_lock_error(&e) => e,
            Err(e) => return Err(storage("failed to open database", e)),
        };

        for (i, delay_ms) in retry_delays_ms.iter().enumerate() {
            log::warn!(
                "database lock held at {}, retry {}/{} in {}ms",
                path_ref.display(),
                i + 1,
                retry_delays_ms.len(),
                delay_ms
            );
            std::thread::sleep(std::time::Duration::from_millis(*delay_ms));
            match sled::open(path_ref) {
                Ok(db) => return Self::from_db(db),
                Err(e) if Self::is_lock_error(&e) => last_err = e,
                Err(e) => return Err(storage("failed to open database", e)),
            }
        }

        Err(HiveError::Storage(format!(
            "database at {} still locked after {} retries: {}",
            path_ref.display(),
            retry_delays_ms.len(),
            last_err
        )))
    }

    /// In-memory database removed on drop (benches, property tests).
    pub fn open_temporary() -> Result<Self, HiveError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage("failed to open temporary database", e))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, HiveError> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| storage(&format!("failed to open {} tree", name), e))
        };
        Ok(Self {
            members: open(TREE_MEMBERS)?,
            activation_order: open(TREE_ACTIVATION_ORDER)?,
            referrals: open(TREE_REFERRALS)?,
            slots: open(TREE_SLOTS)?,
            occupancy: open(TREE_OCCUPANCY)?,
            rewards: open(TREE_REWARDS)?,
            reward_index: open(TREE_REWARD_INDEX)?,
            balances: open(TREE_BALANCES)?,
            releases: open(TREE_RELEASES)?,
            events: open(TREE_EVENTS)?,
            meta: open(TREE_META)?,
            db,
        })
    }

    /// sled reports a held file lock as an I/O error: either the raw
    /// EWOULDBLOCK from flock or its own "could not acquire lock" wrapper.
    fn is_lock_error(e: &sled::Error) -> bool {
        let sled::Error::Io(io) = e else {
            return false;
        };
        if io.kind() == std::io::ErrorKind::WouldBlock {
            return true;
        }
        let msg = io.to_string();
        msg.contains("could not acquire lock")
            || msg.contains("Resource temporarily unavailable")
            || msg.contains("EWOULDBLOCK")
    }

    pub fn flush(&self) -> Result<(), HiveError> {
        self.db
            .flush()
            .map_err(|e| storage("failed to flush database", e))?;
        Ok(())
    }

    /// Fresh id for a reward row. Gaps after restart are fine; ids only need to be unique.
    pub(crate) fn next_reward_id(&self) -> Result<u64, HiveError> {
        self.db
            .generate_id()
            .map_err(|e| storage("failed to generate reward id", e))
    }

    /// Monotonic hint stored under `key` in `meta`; 0 when never written.
    pub(crate) fn cursor(&self, key: &[u8]) -> Result<u64, HiveError> {
        match self
            .meta
            .get(key)
            .map_err(|e| storage("failed to read cursor", e))?
        {
            Some(bytes) => read_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Raise the cursor under `key` to `target`; never moves it backwards.
    pub(crate) fn advance_cursor(&self, key: &[u8], target: u64) -> Result<(), HiveError> {
        self.meta
            .fetch_and_update(key, |old| {
                let current = old.and_then(|b| read_u64(b).ok()).unwrap_or(0);
                Some(current.max(target).to_be_bytes().to_vec())
            })
            .map_err(|e| storage("failed to advance cursor", e))?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // MEMBERS
    // ─────────────────────────────────────────────────────────────────

    pub fn get_member(&self, wallet: &Wallet) -> Result<Option<Member>, HiveError> {
        match self
            .members
            .get(wallet_key(wallet))
            .map_err(|e| storage("failed to read member", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_member(&self, wallet: &Wallet) -> Result<Member, HiveError> {
        self.get_member(wallet)?
            .ok_or_else(|| HiveError::UnknownMember(wallet.to_string()))
    }

    pub fn network_root(&self) -> Result<Option<Wallet>, HiveError> {
        match self
            .meta
            .get(META_NETWORK_ROOT)
            .map_err(|e| storage("failed to read network root", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// (activation seq, wallet) pairs starting at `from_seq`, ascending.
    pub(crate) fn activation_order_from(
        &self,
        from_seq: u64,
    ) -> impl Iterator<Item = Result<(u64, Wallet), HiveError>> {
        self.activation_order
            .range(u64_key(from_seq)..)
            .map(|item| {
                let (k, v) = item.map_err(|e| storage("failed to scan activation order", e))?;
                Ok((read_u64(&k)?, decode(&v)?))
            })
    }

    pub fn referrals_of(&self, referrer: &Wallet) -> Result<Vec<ReferralEdge>, HiveError> {
        let mut edges = Vec::new();
        for item in self.referrals.scan_prefix(wallet_key(referrer)) {
            let (_, v) = item.map_err(|e| storage("failed to scan referrals", e))?;
            edges.push(decode(&v)?);
        }
        Ok(edges)
    }

    // ─────────────────────────────────────────────────────────────────
    // SLOTS
    // ─────────────────────────────────────────────────────────────────

    pub fn slot_occupant(&self, root: &Wallet, slot: SlotRef) -> Result<Option<Wallet>, HiveError> {
        match self
            .slots
            .get(slot_key(root, slot.layer, slot.index))
            .map_err(|e| storage("failed to read slot", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Occupied (index, occupant) pairs of one layer under `root`, ascending.
    pub fn layer_rows(&self, root: &Wallet, layer: u8) -> Result<Vec<(u64, Wallet)>, HiveError> {
        let mut rows = Vec::new();
        for item in self.slots.scan_prefix(slot_layer_prefix(root, layer)) {
            let (k, v) = item.map_err(|e| storage("failed to scan slots", e))?;
            rows.push((trailing_u64(&k)?, decode(&v)?));
        }
        Ok(rows)
    }

    pub fn layer_count(&self, root: &Wallet, layer: u8) -> Result<u64, HiveError> {
        let mut count = 0u64;
        for item in self.slots.scan_prefix(slot_layer_prefix(root, layer)).keys() {
            item.map_err(|e| storage("failed to count slots", e))?;
            count += 1;
        }
        Ok(count)
    }

    /// Lowest unoccupied index at or after `from` in (root, layer), or `None` when
    /// every index up to `capacity` is taken.
    pub(crate) fn lowest_free_index(
        &self,
        root: &Wallet,
        layer: u8,
        from: u64,
        capacity: u64,
    ) -> Result<Option<u64>, HiveError> {
        let prefix = slot_layer_prefix(root, layer);
        let mut expected = from;
        for item in self.slots.range(slot_key(root, layer, from)..).keys() {
            let k = item.map_err(|e| storage("failed to scan slots", e))?;
            if !k.starts_with(&prefix) {
                break;
            }
            if trailing_u64(&k)? != expected {
                break;
            }
            expected += 1;
        }
        Ok((expected < capacity).then_some(expected))
    }

    /// Every slot row naming `member` as occupant, one per root, layer 1 first.
    pub fn occupancy_of(&self, member: &Wallet) -> Result<Vec<MatrixSlot>, HiveError> {
        let mut rows: Vec<MatrixSlot> = Vec::new();
        for item in self.occupancy.scan_prefix(wallet_key(member)) {
            let (_, v) = item.map_err(|e| storage("failed to scan occupancy", e))?;
            rows.push(decode(&v)?);
        }
        rows.sort_by_key(|r| r.slot.layer);
        Ok(rows)
    }

    pub fn occupancy_under(
        &self,
        member: &Wallet,
        root: &Wallet,
    ) -> Result<Option<MatrixSlot>, HiveError> {
        match self
            .occupancy
            .get(pair_key(member, root))
            .map_err(|e| storage("failed to read occupancy", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // REWARDS
    // ─────────────────────────────────────────────────────────────────

    pub fn get_reward(&self, id: u64) -> Result<Option<LayerReward>, HiveError> {
        match self
            .rewards
            .get(u64_key(id))
            .map_err(|e| storage("failed to read reward", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rewards ever addressed to `recipient`, oldest id first.
    pub fn rewards_for(&self, recipient: &Wallet) -> Result<Vec<LayerReward>, HiveError> {
        let mut out = Vec::new();
        for item in self.reward_index.scan_prefix(wallet_key(recipient)).keys() {
            let k = item.map_err(|e| storage("failed to scan reward index", e))?;
            let id = trailing_u64(&k)?;
            match self.get_reward(id)? {
                Some(r) => out.push(r),
                None => {
                    return Err(HiveError::IntegrityFault(format!(
                        "reward index for {} names missing reward {}",
                        recipient, id
                    )))
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn all_rewards(&self) -> impl Iterator<Item = Result<LayerReward, HiveError>> {
        self.rewards.iter().values().map(|item| {
            let v = item.map_err(|e| storage("failed to scan rewards", e))?;
            decode(&v)
        })
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>, HiveError> {
        match self
            .events
            .get(event_id.as_bytes())
            .map_err(|e| storage("failed to read event", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // BALANCES
    // ─────────────────────────────────────────────────────────────────

    pub fn get_balance(&self, wallet: &Wallet) -> Result<Option<BalanceAccount>, HiveError> {
        match self
            .balances
            .get(wallet_key(wallet))
            .map_err(|e| storage("failed to read balance", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn all_balances(
        &self,
    ) -> impl Iterator<Item = Result<BalanceAccountRow, HiveError>> {
        self.balances.iter().map(|item| {
            let (k, v) = item.map_err(|e| storage("failed to scan balances", e))?;
            let len = *k.first().unwrap_or(&0) as usize;
            let raw = k
                .get(1..1 + len)
                .ok_or_else(|| HiveError::Codec("truncated balance key".to_string()))?;
            let text = std::str::from_utf8(raw)
                .map_err(|e| HiveError::Codec(format!("balance key not utf-8: {}", e)))?;
            Ok(BalanceAccountRow {
                wallet: Wallet::parse(text)?,
                account: decode(&v)?,
            })
        })
    }

    pub fn releases_of(&self, wallet: &Wallet) -> Result<Vec<ReleaseRecord>, HiveError> {
        let mut out = Vec::new();
        for item in self.releases.scan_prefix(wallet_key(wallet)).values() {
            let v = item.map_err(|e| storage("failed to scan releases", e))?;
            out.push(decode(&v)?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            members: self.members.len(),
            slots: self.slots.len(),
            rewards: self.rewards.len(),
            releases: self.releases.len(),
            size_on_disk: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

pub(crate) struct BalanceAccountRow {
    pub wallet: Wallet,
    pub account: BalanceAccount,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub members: usize,
    pub slots: usize,
    pub rewards: usize,
    pub releases: usize,
    pub size_on_disk: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn w(s: &str) -> Wallet {
        Wallet::parse(s).unwrap()
    }

    #[test]
    fn test_wallet_prefix_is_unambiguous() {
        let short = wallet_key(&w("0xab"));
        let long = wallet_key(&w("0xabc"));
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn test_lowest_free_index_finds_gap() {
        let dir = TempDir::new().unwrap();
        let store = HiveStore::open(dir.path()).unwrap();
        let root = w("0xroot");
        for idx in [0u64, 1, 3] {
            store
                .slots
                .insert(slot_key(&root, 2, idx), encode(&w("0xocc")).unwrap())
                .unwrap();
        }
        assert_eq!(store.lowest_free_index(&root, 2, 0, 9).unwrap(), Some(2));
        assert_eq!(store.lowest_free_index(&root, 2, 3, 9).unwrap(), Some(4));
        // another layer and another root are not visible
        assert_eq!(store.lowest_free_index(&root, 1, 0, 3).unwrap(), Some(0));
        assert_eq!(store.lowest_free_index(&w("0xroo"), 2, 0, 9).unwrap(), Some(0));
    }

    #[test]
    fn test_lowest_free_index_full_layer() {
        let dir = TempDir::new().unwrap();
        let store = HiveStore::open(dir.path()).unwrap();
        let root = w("0xroot");
        for idx in 0..3u64 {
            store
                .slots
                .insert(slot_key(&root, 1, idx), encode(&w("0xocc")).unwrap())
                .unwrap();
        }
        assert_eq!(store.lowest_free_index(&root, 1, 0, 3).unwrap(), None);
        assert_eq!(store.layer_count(&root, 1).unwrap(), 3);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = HiveStore::open(dir.path()).unwrap();
            store
                .balances
                .insert(wallet_key(&w("0xaa")), encode(&BalanceAccount::default()).unwrap())
                .unwrap();
            store.flush().unwrap();
        }
        let store = HiveStore::open(dir.path()).unwrap();
        assert!(store.get_balance(&w("0xaa")).unwrap().is_some());
        let rows: Vec<_> = store.all_balances().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wallet, w("0xaa"));
    }

    #[test]
    fn test_occupancy_of_orders_by_layer() {
        let dir = TempDir::new().unwrap();
        let store = HiveStore::open(dir.path()).unwrap();
        let member = w("0xm");
        // root wallets chosen so key order is the reverse of layer order
        for (root, layer) in [("0xa", 3u8), ("0xb", 2), ("0xc", 1)] {
            let row = MatrixSlot {
                root: w(root),
                slot: SlotRef::new(layer, 0).unwrap(),
                occupant: member.clone(),
            };
            store
                .occupancy
                .insert(pair_key(&member, &w(root)), encode(&row).unwrap())
                .unwrap();
        }
        let layers: Vec<u8> = store
            .occupancy_of(&member)
            .unwrap()
            .iter()
            .map(|r| r.slot.layer)
            .collect();
        assert_eq!(layers, vec![1, 2, 3]);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = HiveStore::open(dir.path()).unwrap();
        let key = layer_cursor_key(&w("0xroot"), 4);
        assert_eq!(store.cursor(&key).unwrap(), 0);
        store.advance_cursor(&key, 7).unwrap();
        store.advance_cursor(&key, 3).unwrap();
        assert_eq!(store.cursor(&key).unwrap(), 7);
        // other layers keep their own cursor
        assert_eq!(store.cursor(&layer_cursor_key(&w("0xroot"), 5)).unwrap(), 0);
    }

    #[test]
    fn test_only_lock_contention_is_retried() {
        use std::io::{Error, ErrorKind};
        let held = sled::Error::Io(Error::new(
            ErrorKind::Other,
            "could not acquire lock on \"hive/db\": WouldBlock",
        ));
        assert!(HiveStore::is_lock_error(&held));
        let flock = sled::Error::Io(Error::from(ErrorKind::WouldBlock));
        assert!(HiveStore::is_lock_error(&flock));

        let denied = sled::Error::Io(Error::new(
            ErrorKind::PermissionDenied,
            "cannot open hive/blocks.lock",
        ));
        assert!(!HiveStore::is_lock_error(&denied));
        let unsupported = sled::Error::Unsupported("lock file format".to_string());
        assert!(!HiveStore::is_lock_error(&unsupported));
    }

    #[test]
    fn test_tx_error_unwraps_abort() {
        let e = tx_error(TransactionError::Abort(HiveError::UnknownReward(7)));
        assert_eq!(e, HiveError::UnknownReward(7));
    }
}
