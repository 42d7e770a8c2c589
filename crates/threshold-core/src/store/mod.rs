//! Offline Store: sled-backed durable storage for nav logs, resource cache and gate state.
//!
//! | Tree | Key | Indexes |
//! |------|-----|---------|
//! | `nav_logs` | auto-increment id (big-endian u64) | `nav_logs_by_threshold` |
//! | `resource_cache` | logical cache key | `resource_cache_by_threshold`, `resource_cache_by_sync_status` |
//! | `gate_state` | cell id | `gate_state_by_lockdown` |
//! | `http_cache` | request key | none |
//! | `replay_queue` | auto-increment id | none |
//!
//! Index keys are `{value}\0{primary key}` with an empty value. A record and its index
//! entries commit in one multi-tree transaction and the db is flushed before a write
//! returns, so every acknowledged write survives a restart.

mod sync;

pub use sync::{LoopbackRemote, RemoteSync, SimulatedRemote, SyncReport, SyncVerdict};

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::types::{
    now_ms, GateStateEntry, NavLogEntry, ResourceCacheEntry, RouteStatus, SyncStatus, Threshold,
};

const TREE_NAV_LOGS: &str = "nav_logs";
const TREE_NAV_BY_THRESHOLD: &str = "nav_logs_by_threshold";
const TREE_CACHE: &str = "resource_cache";
const TREE_CACHE_BY_THRESHOLD: &str = "resource_cache_by_threshold";
const TREE_CACHE_BY_SYNC: &str = "resource_cache_by_sync_status";
const TREE_GATE: &str = "gate_state";
const TREE_GATE_BY_LOCKDOWN: &str = "gate_state_by_lockdown";
const TREE_HTTP_CACHE: &str = "http_cache";
const TREE_REPLAY_QUEUE: &str = "replay_queue";

/// Attempts for an operation that fails with an I/O error before the error is surfaced.
const STORAGE_ATTEMPTS: usize = 3;

const SYNC_STATUSES: [SyncStatus; 3] = [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Conflict];

struct StoreTrees {
    db: Db,
    nav_logs: Tree,
    nav_by_threshold: Tree,
    cache: Tree,
    cache_by_threshold: Tree,
    cache_by_sync: Tree,
    gate: Tree,
    gate_by_lockdown: Tree,
    http_cache: Tree,
    replay_queue: Tree,
}

impl StoreTrees {
    fn open(path: &Path) -> MeshResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            nav_logs: db.open_tree(TREE_NAV_LOGS)?,
            nav_by_threshold: db.open_tree(TREE_NAV_BY_THRESHOLD)?,
            cache: db.open_tree(TREE_CACHE)?,
            cache_by_threshold: db.open_tree(TREE_CACHE_BY_THRESHOLD)?,
            cache_by_sync: db.open_tree(TREE_CACHE_BY_SYNC)?,
            gate: db.open_tree(TREE_GATE)?,
            gate_by_lockdown: db.open_tree(TREE_GATE_BY_LOCKDOWN)?,
            http_cache: db.open_tree(TREE_HTTP_CACHE)?,
            replay_queue: db.open_tree(TREE_REPLAY_QUEUE)?,
            db,
        })
    }
}

fn index_key(value: &str, primary: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1 + primary.len());
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key.extend_from_slice(primary);
    key
}

fn index_prefix(value: &str) -> Vec<u8> {
    index_key(value, &[])
}

fn primary_from_index(index: &[u8], value: &str) -> Vec<u8> {
    index[value.len() + 1..].to_vec()
}

fn lockdown_label(lockdown: bool) -> &'static str {
    if lockdown {
        "1"
    } else {
        "0"
    }
}

fn tx_error(err: TransactionError<()>) -> MeshError {
    match err {
        TransactionError::Storage(e) => MeshError::Storage(e),
        TransactionError::Abort(()) => MeshError::InvalidInput("transaction aborted".to_string()),
    }
}

/// Runs a read or write, retrying transient I/O failures so they do not reach callers.
fn with_retry<T>(mut op: impl FnMut() -> MeshResult<T>) -> MeshResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(MeshError::Storage(sled::Error::Io(e))) if attempt < STORAGE_ATTEMPTS => {
                warn!(attempt, error = %e, "[STORE] transient storage failure, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Durable keyed storage for the mesh. Construct with [`OfflineStore::new`] and call
/// [`OfflineStore::init`] (or use [`OfflineStore::open`]) before any other operation.
pub struct OfflineStore {
    path: PathBuf,
    trees: OnceCell<StoreTrees>,
}

impl OfflineStore {
    /// Uninitialized handle; every operation fails with `NotInitialized` until `init()`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            trees: OnceCell::new(),
        }
    }

    /// Opens (or creates) the sled database. Idempotent.
    pub fn init(&self) -> MeshResult<()> {
        self.trees.get_or_try_init(|| {
            info!(path = %self.path.display(), "[STORE] opening offline store");
            StoreTrees::open(&self.path)
        })?;
        Ok(())
    }

    /// `new` + `init`.
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        let store = Self::new(path);
        store.init()?;
        Ok(store)
    }

    pub fn is_initialized(&self) -> bool {
        self.trees.get().is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn trees(&self) -> MeshResult<&StoreTrees> {
        self.trees.get().ok_or(MeshError::NotInitialized)
    }

    fn flush(&self, trees: &StoreTrees) -> MeshResult<()> {
        trees.db.flush()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Nav logs
    // -------------------------------------------------------------------------

    /// Appends a routing decision. Returns the assigned id.
    pub fn add_nav_log(&self, entry: &NavLogEntry) -> MeshResult<u64> {
        let trees = self.trees()?;
        let value = serde_json::to_vec(entry)?;
        with_retry(|| {
            let id = trees.db.generate_id()?;
            let key = id.to_be_bytes();
            let idx = index_key(entry.threshold.as_str(), &key);
            (&trees.nav_logs, &trees.nav_by_threshold)
                .transaction(|(logs, by_threshold)| {
                    logs.insert(&key[..], value.as_slice())?;
                    by_threshold.insert(idx.as_slice(), &[] as &[u8])?;
                    Ok::<_, ConflictableTransactionError<()>>(())
                })
                .map_err(tx_error)?;
            self.flush(trees)?;
            Ok(id)
        })
    }

    /// Most recent nav logs first, optionally filtered by threshold.
    pub fn get_nav_logs(&self, threshold: Option<Threshold>, limit: usize) -> MeshResult<Vec<NavLogEntry>> {
        let trees = self.trees()?;
        with_retry(|| Self::read_nav_logs(trees, threshold, limit))
    }

    fn read_nav_logs(
        trees: &StoreTrees,
        threshold: Option<Threshold>,
        limit: usize,
    ) -> MeshResult<Vec<NavLogEntry>> {
        let mut out = Vec::new();
        match threshold {
            Some(t) => {
                for item in trees.nav_by_threshold.scan_prefix(index_prefix(t.as_str())).rev() {
                    if out.len() >= limit {
                        break;
                    }
                    let (idx, _) = item?;
                    let key = primary_from_index(&idx, t.as_str());
                    if let Some(raw) = trees.nav_logs.get(key)? {
                        out.push(serde_json::from_slice(&raw)?);
                    }
                }
            }
            None => {
                for item in trees.nav_logs.iter().rev() {
                    if out.len() >= limit {
                        break;
                    }
                    let (_, raw) = item?;
                    out.push(serde_json::from_slice(&raw)?);
                }
            }
        }
        Ok(out)
    }

    pub fn count_nav_logs(&self) -> MeshResult<usize> {
        Ok(self.trees()?.nav_logs.len())
    }

    /// Percentage (0-100) of nav logs served by a failover or local route.
    pub fn get_latency_tolerance(&self) -> MeshResult<f64> {
        let trees = self.trees()?;
        with_retry(|| Self::read_latency_tolerance(trees))
    }

    fn read_latency_tolerance(trees: &StoreTrees) -> MeshResult<f64> {
        let mut total = 0usize;
        let mut survived = 0usize;
        for item in trees.nav_logs.iter() {
            let (_, raw) = item?;
            let entry: NavLogEntry = serde_json::from_slice(&raw)?;
            total += 1;
            if matches!(entry.route_status, RouteStatus::Local | RouteStatus::Failover) {
                survived += 1;
            }
        }
        if total == 0 {
            return Ok(0.0);
        }
        Ok(survived as f64 / total as f64 * 100.0)
    }

    // -------------------------------------------------------------------------
    // Resource cache
    // -------------------------------------------------------------------------

    /// Inserts or replaces a cache entry and re-indexes it.
    pub fn cache_resource(&self, entry: &ResourceCacheEntry) -> MeshResult<()> {
        let trees = self.trees()?;
        let value = serde_json::to_vec(entry)?;
        let key = entry.key.as_bytes();
        with_retry(|| {
            (&trees.cache, &trees.cache_by_threshold, &trees.cache_by_sync)
                .transaction(|(cache, by_threshold, by_sync)| {
                    for t in Threshold::all() {
                        by_threshold.remove(index_key(t.as_str(), key))?;
                    }
                    for s in SYNC_STATUSES {
                        by_sync.remove(index_key(s.as_str(), key))?;
                    }
                    cache.insert(key, value.as_slice())?;
                    by_threshold.insert(index_key(entry.threshold.as_str(), key), &[] as &[u8])?;
                    by_sync.insert(index_key(entry.sync_status.as_str(), key), &[] as &[u8])?;
                    Ok::<_, ConflictableTransactionError<()>>(())
                })
                .map_err(tx_error)?;
            self.flush(trees)
        })?;
        debug!(key = %entry.key, threshold = %entry.threshold, "[STORE] cached resource");
        Ok(())
    }

    /// Live cache entry for `key`; expired entries read as absent.
    pub fn get_cached_resource(&self, key: &str) -> MeshResult<Option<ResourceCacheEntry>> {
        let trees = self.trees()?;
        let Some(raw) = with_retry(|| Ok(trees.cache.get(key.as_bytes())?))? else {
            return Ok(None);
        };
        let entry: ResourceCacheEntry = serde_json::from_slice(&raw)?;
        if entry.is_expired_at(now_ms()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Live cache entries of one threshold.
    pub fn get_cached_by_threshold(&self, threshold: Threshold) -> MeshResult<Vec<ResourceCacheEntry>> {
        let trees = self.trees()?;
        let mut out = Vec::new();
        for item in trees.cache_by_threshold.scan_prefix(index_prefix(threshold.as_str())) {
            let (idx, _) = item?;
            let key = primary_from_index(&idx, threshold.as_str());
            if let Some(entry) = self.get_cached_resource(&String::from_utf8_lossy(&key))? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Live entries still waiting to be pushed to the remote side.
    pub fn get_pending_sync_resources(&self) -> MeshResult<Vec<ResourceCacheEntry>> {
        let trees = self.trees()?;
        let label = SyncStatus::Pending.as_str();
        let mut out = Vec::new();
        for item in trees.cache_by_sync.scan_prefix(index_prefix(label)) {
            let (idx, _) = item?;
            let key = primary_from_index(&idx, label);
            if let Some(entry) = self.get_cached_resource(&String::from_utf8_lossy(&key))? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub fn remove_cached_resource(&self, key: &str) -> MeshResult<bool> {
        let trees = self.trees()?;
        let key = key.as_bytes();
        let removed = with_retry(|| {
            let removed = (&trees.cache, &trees.cache_by_threshold, &trees.cache_by_sync)
                .transaction(|(cache, by_threshold, by_sync)| {
                    for t in Threshold::all() {
                        by_threshold.remove(index_key(t.as_str(), key))?;
                    }
                    for s in SYNC_STATUSES {
                        by_sync.remove(index_key(s.as_str(), key))?;
                    }
                    Ok::<_, ConflictableTransactionError<()>>(cache.remove(key)?.is_some())
                })
                .map_err(tx_error)?;
            self.flush(trees)?;
            Ok(removed)
        })?;
        Ok(removed)
    }

    /// Deletes every expired cache entry. Returns how many were removed.
    pub fn prune_expired(&self) -> MeshResult<usize> {
        let trees = self.trees()?;
        let now = now_ms();
        let mut expired = Vec::new();
        for item in trees.cache.iter() {
            let (key, raw) = item?;
            let entry: ResourceCacheEntry = serde_json::from_slice(&raw)?;
            if entry.is_expired_at(now) {
                expired.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        for key in &expired {
            self.remove_cached_resource(key)?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "[STORE] pruned expired cache entries");
        }
        Ok(expired.len())
    }

    fn set_sync_status(&self, key: &str, status: SyncStatus) -> MeshResult<()> {
        let trees = self.trees()?;
        let Some(raw) = with_retry(|| Ok(trees.cache.get(key.as_bytes())?))? else {
            return Err(MeshError::NotFound(format!("cache entry {}", key)));
        };
        let mut entry: ResourceCacheEntry = serde_json::from_slice(&raw)?;
        entry.sync_status = status;
        self.cache_resource(&entry)
    }

    /// Pushes every pending entry through `remote`. Accepted entries become `synced`,
    /// conflicts become `conflict`, transient failures stay `pending` for the next run.
    pub async fn sync_to_remote(&self, remote: &dyn RemoteSync) -> MeshResult<SyncReport> {
        let pending = self.get_pending_sync_resources()?;
        let mut report = SyncReport::default();
        for entry in pending {
            match remote.push(&entry).await {
                Ok(SyncVerdict::Accepted) => {
                    self.set_sync_status(&entry.key, SyncStatus::Synced)?;
                    report.synced += 1;
                }
                Ok(SyncVerdict::Conflict) => {
                    self.set_sync_status(&entry.key, SyncStatus::Conflict)?;
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "[STORE] sync push failed; entry stays pending");
                    report.deferred += 1;
                }
            }
        }
        info!(
            synced = report.synced,
            conflicts = report.conflicts,
            deferred = report.deferred,
            "[STORE] sync to remote finished"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Gate state
    // -------------------------------------------------------------------------

    pub fn update_gate_state(&self, state: &GateStateEntry) -> MeshResult<()> {
        let trees = self.trees()?;
        let value = serde_json::to_vec(state)?;
        let cell = state.cell_id.as_bytes();
        with_retry(|| {
            (&trees.gate, &trees.gate_by_lockdown)
                .transaction(|(gate, by_lockdown)| {
                    by_lockdown.remove(index_key(lockdown_label(true), cell))?;
                    by_lockdown.remove(index_key(lockdown_label(false), cell))?;
                    gate.insert(cell, value.as_slice())?;
                    by_lockdown.insert(index_key(lockdown_label(state.lockdown), cell), &[] as &[u8])?;
                    Ok::<_, ConflictableTransactionError<()>>(())
                })
                .map_err(tx_error)?;
            self.flush(trees)
        })
    }

    pub fn get_gate_state(&self, cell_id: &str) -> MeshResult<Option<GateStateEntry>> {
        let trees = self.trees()?;
        match with_retry(|| Ok(trees.gate.get(cell_id.as_bytes())?))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_all_gate_states(&self) -> MeshResult<Vec<GateStateEntry>> {
        let trees = self.trees()?;
        with_retry(|| {
            let mut out = Vec::new();
            for item in trees.gate.iter() {
                let (_, raw) = item?;
                out.push(serde_json::from_slice(&raw)?);
            }
            Ok(out)
        })
    }

    /// Cell ids currently in lockdown (lockdown index scan).
    pub fn get_locked_cells(&self) -> MeshResult<Vec<String>> {
        let trees = self.trees()?;
        let label = lockdown_label(true);
        with_retry(|| {
            let mut out = Vec::new();
            for item in trees.gate_by_lockdown.scan_prefix(index_prefix(label)) {
                let (idx, _) = item?;
                out.push(String::from_utf8_lossy(&primary_from_index(&idx, label)).into_owned());
            }
            Ok(out)
        })
    }

    // -------------------------------------------------------------------------
    // Fetch interception persistence
    // -------------------------------------------------------------------------

    pub fn put_http_cache<T: Serialize>(&self, key: &str, value: &T) -> MeshResult<()> {
        let trees = self.trees()?;
        let raw = serde_json::to_vec(value)?;
        with_retry(|| {
            trees.http_cache.insert(key.as_bytes(), raw.as_slice())?;
            self.flush(trees)
        })
    }

    pub fn get_http_cache<T: DeserializeOwned>(&self, key: &str) -> MeshResult<Option<T>> {
        let trees = self.trees()?;
        match with_retry(|| Ok(trees.http_cache.get(key.as_bytes())?))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Appends to the replay queue. Returns the queue id.
    pub fn enqueue_replay<T: Serialize>(&self, value: &T) -> MeshResult<u64> {
        let trees = self.trees()?;
        let raw = serde_json::to_vec(value)?;
        with_retry(|| {
            let id = trees.db.generate_id()?;
            trees.replay_queue.insert(id.to_be_bytes(), raw.as_slice())?;
            self.flush(trees)?;
            Ok(id)
        })
    }

    /// Queued entries in insertion order.
    pub fn replay_entries<T: DeserializeOwned>(&self) -> MeshResult<Vec<(u64, T)>> {
        let trees = self.trees()?;
        let mut out = Vec::new();
        for item in trees.replay_queue.iter() {
            let (key, raw) = item?;
            let mut id = [0u8; 8];
            if key.len() != id.len() {
                warn!("[STORE] skipping malformed replay key");
                continue;
            }
            id.copy_from_slice(&key);
            out.push((u64::from_be_bytes(id), serde_json::from_slice(&raw)?));
        }
        Ok(out)
    }

    pub fn remove_replay(&self, id: u64) -> MeshResult<()> {
        let trees = self.trees()?;
        with_retry(|| {
            trees.replay_queue.remove(id.to_be_bytes())?;
            self.flush(trees)
        })
    }

    pub fn replay_queue_len(&self) -> MeshResult<usize> {
        Ok(self.trees()?.replay_queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nav(threshold: Threshold, status: RouteStatus) -> NavLogEntry {
        NavLogEntry {
            path_used: format!("{}.test", threshold),
            threshold,
            latency_ms: 3,
            breach_attempts: 0,
            route_status: status,
            timestamp: now_ms(),
        }
    }

    #[test]
    fn operations_fail_before_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::new(dir.path());
        assert!(matches!(store.get_nav_logs(None, 5), Err(MeshError::NotInitialized)));
        assert!(matches!(store.get_gate_state("revenue"), Err(MeshError::NotInitialized)));
        store.init().unwrap();
        store.init().unwrap();
        assert!(store.get_nav_logs(None, 5).unwrap().is_empty());
    }

    #[test]
    fn nav_logs_filter_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        store.add_nav_log(&nav(Threshold::Wealth, RouteStatus::Primary)).unwrap();
        store.add_nav_log(&nav(Threshold::Info, RouteStatus::Local)).unwrap();
        store.add_nav_log(&nav(Threshold::Wealth, RouteStatus::Failover)).unwrap();

        let wealth = store.get_nav_logs(Some(Threshold::Wealth), 10).unwrap();
        assert_eq!(wealth.len(), 2);
        assert_eq!(wealth[0].route_status, RouteStatus::Failover);

        let all = store.get_nav_logs(None, 2).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].threshold, Threshold::Info);

        let tolerance = store.get_latency_tolerance().unwrap();
        assert!((tolerance - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn sync_status_index_follows_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let mut entry = ResourceCacheEntry::pending("doc:1", Threshold::Info, json!({"a": 1}), None);
        store.cache_resource(&entry).unwrap();
        assert_eq!(store.get_pending_sync_resources().unwrap().len(), 1);

        entry.sync_status = SyncStatus::Synced;
        store.cache_resource(&entry).unwrap();
        assert!(store.get_pending_sync_resources().unwrap().is_empty());
        assert_eq!(store.get_cached_by_threshold(Threshold::Info).unwrap().len(), 1);

        assert!(store.remove_cached_resource("doc:1").unwrap());
        assert!(store.get_cached_resource("doc:1").unwrap().is_none());
        assert!(store.get_cached_by_threshold(Threshold::Info).unwrap().is_empty());
    }

    #[test]
    fn expired_entries_read_absent_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let mut stale = ResourceCacheEntry::pending("seed:old", Threshold::Myth, json!({}), Some(1_000));
        stale.expires_at = Some(now_ms() - 1);
        store.cache_resource(&stale).unwrap();
        store
            .cache_resource(&ResourceCacheEntry::pending("seed:new", Threshold::Myth, json!({}), Some(60_000)))
            .unwrap();
        store
            .cache_resource(&ResourceCacheEntry::pending("feed:x", Threshold::Info, json!([]), None))
            .unwrap();

        assert!(store.get_cached_resource("seed:old").unwrap().is_none());
        assert!(store.get_cached_resource("seed:old").unwrap().is_none());
        assert_eq!(store.get_cached_by_threshold(Threshold::Myth).unwrap().len(), 1);
        assert_eq!(store.get_pending_sync_resources().unwrap().len(), 2);

        assert_eq!(store.prune_expired().unwrap(), 1);
        assert_eq!(store.prune_expired().unwrap(), 0);
        assert!(store.get_cached_resource("seed:new").unwrap().is_some());
        assert!(store.get_cached_resource("feed:x").unwrap().is_some());
    }

    struct ScriptedRemote;

    #[async_trait::async_trait]
    impl RemoteSync for ScriptedRemote {
        async fn push(&self, entry: &ResourceCacheEntry) -> MeshResult<SyncVerdict> {
            match entry.key.as_str() {
                "revenue:a" => Ok(SyncVerdict::Accepted),
                "revenue:b" => Ok(SyncVerdict::Conflict),
                _ => Err(MeshError::Remote("timeout".to_string())),
            }
        }
    }

    fn sync_status(store: &OfflineStore, key: &str) -> SyncStatus {
        store.get_cached_resource(key).unwrap().unwrap().sync_status
    }

    #[tokio::test]
    async fn sync_marks_accepted_conflicting_and_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        for key in ["revenue:a", "revenue:b", "revenue:c"] {
            store
                .cache_resource(&ResourceCacheEntry::pending(key, Threshold::Wealth, json!({}), None))
                .unwrap();
        }

        let report = store.sync_to_remote(&ScriptedRemote).await.unwrap();
        assert_eq!(report, SyncReport { synced: 1, conflicts: 1, deferred: 1 });
        assert_eq!(sync_status(&store, "revenue:a"), SyncStatus::Synced);
        assert_eq!(sync_status(&store, "revenue:b"), SyncStatus::Conflict);
        assert_eq!(sync_status(&store, "revenue:c"), SyncStatus::Pending);

        let pending = store.get_pending_sync_resources().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, "revenue:c");
    }

    fn io_failure() -> MeshError {
        MeshError::Storage(sled::Error::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, "busy")))
    }

    #[test]
    fn retry_absorbs_transient_io() {
        let mut calls = 0;
        let value = with_retry(|| {
            calls += 1;
            if calls < STORAGE_ATTEMPTS { Err(io_failure()) } else { Ok(7) }
        })
        .unwrap();
        assert_eq!((value, calls), (7, STORAGE_ATTEMPTS));

        let mut calls = 0;
        let err = with_retry(|| -> MeshResult<()> {
            calls += 1;
            Err(io_failure())
        })
        .unwrap_err();
        assert!(matches!(err, MeshError::Storage(_)));
        assert_eq!(calls, STORAGE_ATTEMPTS);

        let mut calls = 0;
        let err = with_retry(|| -> MeshResult<()> {
            calls += 1;
            Err(MeshError::InvalidInput("bad".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn gate_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = OfflineStore::open(dir.path()).unwrap();
            let mut state = GateStateEntry::open("revenue");
            state.lockdown = true;
            state.anomaly_count = 9;
            store.update_gate_state(&state).unwrap();
            store.update_gate_state(&GateStateEntry::open("archive")).unwrap();
        }
        let store = OfflineStore::open(dir.path()).unwrap();
        let state = store.get_gate_state("revenue").unwrap().unwrap();
        assert!(state.lockdown);
        assert_eq!(state.anomaly_count, 9);
        assert_eq!(store.get_all_gate_states().unwrap().len(), 2);
        assert_eq!(store.get_locked_cells().unwrap(), vec!["revenue".to_string()]);
    }

    #[test]
    fn replay_queue_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = OfflineStore::open(dir.path()).unwrap();
        let first = store.enqueue_replay(&json!({"n": 1})).unwrap();
        store.enqueue_replay(&json!({"n": 2})).unwrap();
        let entries: Vec<(u64, serde_json::Value)> = store.replay_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1["n"], 1);
        store.remove_replay(first).unwrap();
        assert_eq!(store.replay_queue_len().unwrap(), 1);
    }
}
