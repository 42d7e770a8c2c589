//! Shared records for the mesh: thresholds, nav logs, cache entries and gate state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MeshError;

/// Current epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One of the three resource domains, each with its own flow and routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Threshold {
    Wealth,
    Info,
    Myth,
}

impl Threshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wealth => "wealth",
            Self::Info => "info",
            Self::Myth => "myth",
        }
    }

    /// Gate cell guarding the remote routes of this domain.
    pub fn default_cell(&self) -> &'static str {
        match self {
            Self::Wealth => "revenue",
            Self::Info => "archive",
            Self::Myth => "narrative",
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::Wealth, Self::Info, Self::Myth]
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Threshold {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wealth" => Ok(Self::Wealth),
            "info" => Ok(Self::Info),
            "myth" => Ok(Self::Myth),
            other => Err(MeshError::InvalidInput(format!("unknown threshold '{}'", other))),
        }
    }
}

/// Which tier of the route table served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Primary,
    Failover,
    Local,
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Failover => "failover",
            Self::Local => "local",
        }
    }
}

/// Sync state of a cached resource relative to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }
}

/// One routing decision. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavLogEntry {
    /// Route id that served the request (e.g. "wealth.primary").
    pub path_used: String,
    pub threshold: Threshold,
    pub latency_ms: u64,
    /// Routes skipped because their cell was locked.
    pub breach_attempts: u32,
    pub route_status: RouteStatus,
    pub timestamp: i64,
}

/// A cached value keyed by a logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCacheEntry {
    pub key: String,
    pub threshold: Threshold,
    pub payload: serde_json::Value,
    pub cached_at: i64,
    /// `None` never expires (feeds stay cached until explicitly cleared).
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub sync_status: SyncStatus,
}

impl ResourceCacheEntry {
    /// Pending entry expiring `ttl_ms` from now.
    pub fn pending(
        key: impl Into<String>,
        threshold: Threshold,
        payload: serde_json::Value,
        ttl_ms: Option<i64>,
    ) -> Self {
        let cached_at = now_ms();
        Self {
            key: key.into(),
            threshold,
            payload,
            cached_at,
            expires_at: ttl_ms.map(|ttl| cached_at.saturating_add(ttl)),
            sync_status: SyncStatus::Pending,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// Per-cell security posture, owned by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateStateEntry {
    pub cell_id: String,
    pub anomaly_count: u32,
    /// Current anomaly severity (0-100).
    #[serde(default)]
    pub severity: u8,
    pub lockdown: bool,
    pub last_validated: Option<i64>,
    pub updated_at: i64,
}

impl GateStateEntry {
    pub fn open(cell_id: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            anomaly_count: 0,
            severity: 0,
            lockdown: false,
            last_validated: None,
            updated_at: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_parse() {
        assert_eq!("Wealth".parse::<Threshold>().unwrap(), Threshold::Wealth);
        assert_eq!(" myth ".parse::<Threshold>().unwrap(), Threshold::Myth);
        assert!("power".parse::<Threshold>().is_err());
    }

    #[test]
    fn expiry_is_exclusive_of_deadline() {
        let mut entry = ResourceCacheEntry::pending("k", Threshold::Info, serde_json::json!(1), Some(10));
        let exp = entry.expires_at.unwrap();
        assert!(!entry.is_expired_at(exp));
        assert!(entry.is_expired_at(exp + 1));
        entry.expires_at = None;
        assert!(!entry.is_expired_at(i64::MAX));
    }
}
