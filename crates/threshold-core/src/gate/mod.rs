//! Zero-Trust Gate: per-cell token validation, per-flow rate limiting and anomaly lockdown.
//!
//! Each cell moves Open → Throttled → Locked as its anomaly severity rises. Locked cells
//! return to Open only through [`ZeroTrustGate::release_lockdown`]; there is no automatic
//! recovery. Isolation is per cell: locking `revenue` leaves `archive` untouched.
//!
//! Validation order for every request:
//! 1. token check against the registered credential (mismatch → `InvalidToken`);
//! 2. sliding-window rate limit per `(cell, flow)`; overflow records an anomaly;
//! 3. lockdown check; a locked cell denies regardless of 1 and 2.
//!
//! All cell state sits behind one mutex and is persisted before the lock is released, so
//! a lockdown or release is a single transition every flow observes at once.

pub mod policy;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::circuit::{create_anomaly_event, create_gate_event, CircuitAuditBridge};
use crate::error::{MeshError, MeshResult};
use crate::store::OfflineStore;
use crate::types::{now_ms, GateStateEntry};
use policy::{AnomalyAction, MAX_SEVERITY, RATE_WINDOW_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePosture {
    Open,
    Throttled,
    Locked,
}

impl GatePosture {
    fn of(state: &GateStateEntry) -> Self {
        if state.lockdown {
            Self::Locked
        } else if policy::action_for(state.severity) == AnomalyAction::Throttle {
            Self::Throttled
        } else {
            Self::Open
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    RateLimited,
    Lockdown,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Lockdown => "lockdown",
        }
    }
}

/// Policy outcome of a validated request. Validation errors are `Err`, not `Denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum GateDecision {
    Allowed { posture: GatePosture },
    Denied { reason: DenialReason },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// One access attempt against a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub cell_id: String,
    /// Rate-limit bucket (usually the threshold name).
    pub flow: String,
    pub token: String,
}

impl AccessRequest {
    pub fn new(cell_id: impl Into<String>, flow: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            flow: flow.into(),
            token: token.into(),
        }
    }
}

/// Snapshot of one cell for `gate-status` and gauges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellStatus {
    pub cell_id: String,
    pub posture: GatePosture,
    pub anomaly_count: u32,
    pub severity: u8,
    pub last_validated: Option<i64>,
    pub registered: bool,
}

#[derive(Default)]
struct GateInner {
    credentials: HashMap<String, String>,
    states: HashMap<String, GateStateEntry>,
    windows: HashMap<(String, String), VecDeque<i64>>,
}

/// Length-independent comparison so token checks do not leak prefix matches through timing.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

pub struct ZeroTrustGate {
    store: Arc<OfflineStore>,
    circuit: Arc<CircuitAuditBridge>,
    inner: Mutex<GateInner>,
}

impl ZeroTrustGate {
    /// Builds the gate and reloads persisted cell states; a lockdown survives restarts.
    pub fn new(store: Arc<OfflineStore>, circuit: Arc<CircuitAuditBridge>) -> MeshResult<Self> {
        let mut inner = GateInner::default();
        for state in store.get_all_gate_states()? {
            if state.lockdown {
                warn!(cell_id = %state.cell_id, "[GATE] cell restored in lockdown");
            }
            inner.states.insert(state.cell_id.clone(), state);
        }
        Ok(Self {
            store,
            circuit,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers (or rotates) the credential for a cell.
    pub fn register_cell(&self, cell_id: &str, token: &str) -> MeshResult<()> {
        let mut inner = self.lock();
        inner.credentials.insert(cell_id.to_string(), token.to_string());
        if !inner.states.contains_key(cell_id) {
            let state = GateStateEntry::open(cell_id);
            self.store.update_gate_state(&state)?;
            inner.states.insert(cell_id.to_string(), state);
        }
        info!(cell_id = %cell_id, "[GATE] cell registered");
        Ok(())
    }

    pub fn validate(&self, request: &AccessRequest) -> MeshResult<GateDecision> {
        self.validate_at(request, now_ms())
    }

    pub(crate) fn validate_at(&self, request: &AccessRequest, now: i64) -> MeshResult<GateDecision> {
        let mut inner = self.lock();
        let cell = request.cell_id.as_str();

        let Some(expected) = inner.credentials.get(cell) else {
            return Err(MeshError::UnknownCell(cell.to_string()));
        };
        if !tokens_match(expected, &request.token) {
            drop(inner);
            warn!(cell_id = %cell, flow = %request.flow, "[GATE] token mismatch");
            self.circuit
                .emit_circuit_event(create_gate_event(cell, &request.flow, false, Some("invalid_token")));
            return Err(MeshError::InvalidToken(cell.to_string()));
        }

        let mut state = inner
            .states
            .get(cell)
            .cloned()
            .unwrap_or_else(|| GateStateEntry::open(cell));
        let limit = policy::rate_limit(GatePosture::of(&state) == GatePosture::Throttled);

        let window = inner
            .windows
            .entry((cell.to_string(), request.flow.clone()))
            .or_default();
        let cutoff = now - RATE_WINDOW_MS;
        while window.front().is_some_and(|&t| t <= cutoff) {
            window.pop_front();
        }
        let rate_limited = window.len() >= limit;
        if !rate_limited {
            window.push_back(now);
        }

        let mut anomaly = None;
        if rate_limited {
            state.anomaly_count += 1;
            let severity = policy::severity_for_count(state.anomaly_count);
            let action = Self::apply_severity(&mut state, severity);
            anomaly = Some((state.severity, action));
        } else if !state.lockdown {
            state.last_validated = Some(now);
        }
        state.updated_at = now;
        self.store.update_gate_state(&state)?;

        let decision = if state.lockdown {
            GateDecision::Denied {
                reason: DenialReason::Lockdown,
            }
        } else if rate_limited {
            GateDecision::Denied {
                reason: DenialReason::RateLimited,
            }
        } else {
            GateDecision::Allowed {
                posture: GatePosture::of(&state),
            }
        };
        inner.states.insert(cell.to_string(), state);
        drop(inner);

        if let Some((severity, action)) = anomaly {
            self.emit_anomaly(cell, severity, action, "rate limit exceeded");
        }
        let reason = match decision {
            GateDecision::Denied { reason } => Some(reason.as_str()),
            GateDecision::Allowed { .. } => None,
        };
        self.circuit
            .emit_circuit_event(create_gate_event(cell, &request.flow, decision.is_allowed(), reason));
        Ok(decision)
    }

    /// Raises the cell severity (never lowers it) and applies the band action.
    fn apply_severity(state: &mut GateStateEntry, severity: u8) -> AnomalyAction {
        state.severity = state.severity.max(severity.min(MAX_SEVERITY));
        let action = policy::action_for(state.severity);
        if action == AnomalyAction::Lockdown {
            state.lockdown = true;
        }
        action
    }

    fn emit_anomaly(&self, cell: &str, severity: u8, action: AnomalyAction, reason: &str) {
        match action {
            AnomalyAction::Lockdown => {
                error!(cell_id = %cell, severity, reason, "[GATE] cell locked down")
            }
            AnomalyAction::Throttle => {
                warn!(cell_id = %cell, severity, reason, "[GATE] cell throttled")
            }
            AnomalyAction::Warn => warn!(cell_id = %cell, severity, reason, "[GATE] anomaly noted"),
        }
        self.circuit
            .emit_circuit_event(create_anomaly_event(cell, severity, action.as_str(), reason));
    }

    fn mutate_state<F>(&self, cell_id: &str, mutate: F) -> MeshResult<GateStateEntry>
    where
        F: FnOnce(&mut GateStateEntry),
    {
        self.transition(cell_id, mutate, |_| {})
    }

    /// Read-modify-persist of one cell under the gate lock. `on_windows` runs after the
    /// state is persisted, still inside the same critical section.
    fn transition<F, W>(&self, cell_id: &str, mutate: F, on_windows: W) -> MeshResult<GateStateEntry>
    where
        F: FnOnce(&mut GateStateEntry),
        W: FnOnce(&mut HashMap<(String, String), VecDeque<i64>>),
    {
        let mut inner = self.lock();
        let mut state = match inner.states.get(cell_id) {
            Some(s) => s.clone(),
            None => self
                .store
                .get_gate_state(cell_id)?
                .ok_or_else(|| MeshError::UnknownCell(cell_id.to_string()))?,
        };
        mutate(&mut state);
        state.updated_at = now_ms();
        self.store.update_gate_state(&state)?;
        inner.states.insert(cell_id.to_string(), state.clone());
        on_windows(&mut inner.windows);
        Ok(state)
    }

    /// Counts one anomaly; severity follows the count.
    pub fn record_anomaly(&self, cell_id: &str, reason: &str) -> MeshResult<GatePosture> {
        let mut action = AnomalyAction::Warn;
        let state = self.mutate_state(cell_id, |s| {
            s.anomaly_count += 1;
            action = Self::apply_severity(s, policy::severity_for_count(s.anomaly_count));
        })?;
        self.emit_anomaly(cell_id, state.severity, action, reason);
        Ok(GatePosture::of(&state))
    }

    /// Applies an externally scored severity (0-100) and counts it as one anomaly.
    pub fn report_anomaly(&self, cell_id: &str, severity: u8, reason: &str) -> MeshResult<GatePosture> {
        let mut action = AnomalyAction::Warn;
        let state = self.mutate_state(cell_id, |s| {
            s.anomaly_count += 1;
            action = Self::apply_severity(s, severity);
        })?;
        self.emit_anomaly(cell_id, state.severity, action, reason);
        Ok(GatePosture::of(&state))
    }

    /// Manual lockdown.
    pub fn trigger_lockdown(&self, cell_id: &str, reason: &str) -> MeshResult<()> {
        self.mutate_state(cell_id, |s| {
            s.lockdown = true;
            s.severity = MAX_SEVERITY;
        })?;
        self.emit_anomaly(cell_id, MAX_SEVERITY, AnomalyAction::Lockdown, reason);
        Ok(())
    }

    /// The only way out of lockdown: count, severity and lockdown reset in one transition.
    pub fn release_lockdown(&self, cell_id: &str) -> MeshResult<GateStateEntry> {
        let state = self.transition(
            cell_id,
            |s| {
                s.lockdown = false;
                s.anomaly_count = 0;
                s.severity = 0;
            },
            |windows| windows.retain(|(cell, _), _| cell != cell_id),
        )?;
        info!(cell_id = %cell_id, "[GATE] lockdown released");
        self.circuit
            .emit_circuit_event(create_gate_event(cell_id, "manual_release", true, Some("manual_release")));
        Ok(state)
    }

    pub fn posture(&self, cell_id: &str) -> MeshResult<GatePosture> {
        self.lock()
            .states
            .get(cell_id)
            .map(GatePosture::of)
            .ok_or_else(|| MeshError::UnknownCell(cell_id.to_string()))
    }

    /// Unknown cells are not locked.
    pub fn is_locked(&self, cell_id: &str) -> bool {
        self.lock().states.get(cell_id).is_some_and(|s| s.lockdown)
    }

    pub fn status(&self) -> Vec<CellStatus> {
        let inner = self.lock();
        let mut cells: Vec<CellStatus> = inner
            .states
            .values()
            .map(|s| CellStatus {
                cell_id: s.cell_id.clone(),
                posture: GatePosture::of(s),
                anomaly_count: s.anomaly_count,
                severity: s.severity,
                last_validated: s.last_validated,
                registered: inner.credentials.contains_key(&s.cell_id),
            })
            .collect();
        cells.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitSeverity, MemoryAuditSink};

    fn gate() -> (tempfile::TempDir, Arc<OfflineStore>, Arc<CircuitAuditBridge>, ZeroTrustGate) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OfflineStore::open(dir.path()).unwrap());
        let circuit = Arc::new(CircuitAuditBridge::new(Arc::new(MemoryAuditSink::default())));
        let gate = ZeroTrustGate::new(store.clone(), circuit.clone()).unwrap();
        gate.register_cell("revenue", "s3cret").unwrap();
        gate.register_cell("archive", "other").unwrap();
        (dir, store, circuit, gate)
    }

    #[test]
    fn token_checked_first() {
        let (_dir, _store, _circuit, gate) = gate();
        let err = gate.validate(&AccessRequest::new("revenue", "wealth", "nope")).unwrap_err();
        assert!(matches!(err, MeshError::InvalidToken(_)));
        let err = gate.validate(&AccessRequest::new("ghost", "wealth", "x")).unwrap_err();
        assert!(matches!(err, MeshError::UnknownCell(_)));
        assert!(!tokens_match("abc", "abcd"));
        assert!(tokens_match("abc", "abc"));
    }

    #[test]
    fn rate_limit_records_anomaly() {
        let (_dir, store, _circuit, gate) = gate();
        let req = AccessRequest::new("revenue", "wealth", "s3cret");
        let now = now_ms();
        for _ in 0..policy::RATE_LIMIT_PER_MINUTE {
            assert!(gate.validate_at(&req, now).unwrap().is_allowed());
        }
        let decision = gate.validate_at(&req, now).unwrap();
        assert_eq!(
            decision,
            GateDecision::Denied {
                reason: DenialReason::RateLimited
            }
        );
        assert_eq!(store.get_gate_state("revenue").unwrap().unwrap().anomaly_count, 1);
        // The window slides: a minute later the flow is admitted again.
        assert!(gate.validate_at(&req, now + RATE_WINDOW_MS + 1).unwrap().is_allowed());
    }

    #[test]
    fn throttled_cell_halves_the_limit() {
        let (_dir, _store, _circuit, gate) = gate();
        assert_eq!(gate.report_anomaly("revenue", 50, "scored upstream").unwrap(), GatePosture::Throttled);
        let req = AccessRequest::new("revenue", "wealth", "s3cret");
        let now = now_ms();
        for _ in 0..policy::rate_limit(true) {
            assert!(gate.validate_at(&req, now).unwrap().is_allowed());
        }
        assert!(!gate.validate_at(&req, now).unwrap().is_allowed());
    }

    #[test]
    fn lockdown_is_per_cell_and_needs_manual_release() {
        let (_dir, store, circuit, gate) = gate();
        for _ in 0..8 {
            gate.record_anomaly("revenue", "burst").unwrap();
        }
        assert!(gate.is_locked("revenue"));
        assert!(!gate.is_locked("archive"));
        assert!(!circuit.get_events_by_severity(CircuitSeverity::Critical).is_empty());

        let denied = gate.validate(&AccessRequest::new("revenue", "wealth", "s3cret")).unwrap();
        assert_eq!(
            denied,
            GateDecision::Denied {
                reason: DenialReason::Lockdown
            }
        );
        assert!(gate.validate(&AccessRequest::new("archive", "info", "other")).unwrap().is_allowed());

        let released = gate.release_lockdown("revenue").unwrap();
        assert_eq!(released.anomaly_count, 0);
        assert!(!store.get_gate_state("revenue").unwrap().unwrap().lockdown);
        assert_eq!(gate.posture("revenue").unwrap(), GatePosture::Open);
    }

    #[test]
    fn release_clears_rate_windows() {
        let (_dir, _store, _circuit, gate) = gate();
        let req = AccessRequest::new("revenue", "wealth", "s3cret");
        let now = now_ms();
        for _ in 0..policy::RATE_LIMIT_PER_MINUTE {
            assert!(gate.validate_at(&req, now).unwrap().is_allowed());
        }
        gate.trigger_lockdown("revenue", "operator").unwrap();
        gate.release_lockdown("revenue").unwrap();

        let state = gate.lock();
        assert!(state.windows.keys().all(|(cell, _)| cell != "revenue"));
        assert_eq!(state.states["revenue"].severity, 0);
        drop(state);
        assert!(gate.validate_at(&req, now).unwrap().is_allowed());
    }

    #[test]
    fn lockdown_survives_restart() {
        let (_dir, store, circuit, gate) = gate();
        gate.trigger_lockdown("archive", "operator").unwrap();
        drop(gate);
        let gate = ZeroTrustGate::new(store, circuit).unwrap();
        assert!(gate.is_locked("archive"));
        assert_eq!(gate.posture("archive").unwrap(), GatePosture::Locked);
    }
}
