//! Remote reconciliation seam for cached resources.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::decision::DecisionSource;
use crate::error::{MeshError, MeshResult};
use crate::types::ResourceCacheEntry;

/// Outcome of pushing one cached entry to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncVerdict {
    Accepted,
    /// Remote holds a diverging version; the entry is parked as `conflict`.
    Conflict,
}

/// Counts from one `sync_to_remote` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub conflicts: usize,
    /// Entries left pending after a transient push failure.
    pub deferred: usize,
}

/// Remote side that receives pending cache entries once connectivity returns.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// `Err` is treated as transient: the entry stays pending.
    async fn push(&self, entry: &ResourceCacheEntry) -> MeshResult<SyncVerdict>;
}

/// Accepts everything. Used when no remote is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackRemote;

#[async_trait]
impl RemoteSync for LoopbackRemote {
    async fn push(&self, _entry: &ResourceCacheEntry) -> MeshResult<SyncVerdict> {
        Ok(SyncVerdict::Accepted)
    }
}

/// Simulated remote: the decision source chooses between acceptance and a transient outage.
pub struct SimulatedRemote {
    decision: Arc<dyn DecisionSource>,
}

impl SimulatedRemote {
    pub fn new(decision: Arc<dyn DecisionSource>) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl RemoteSync for SimulatedRemote {
    async fn push(&self, entry: &ResourceCacheEntry) -> MeshResult<SyncVerdict> {
        if self.decision.should_succeed("sync.push") {
            Ok(SyncVerdict::Accepted)
        } else {
            Err(MeshError::Remote(format!("remote unreachable for {}", entry.key)))
        }
    }
}
