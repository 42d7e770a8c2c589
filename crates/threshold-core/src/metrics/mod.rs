//! Mesh gauges: a read-only snapshot derived from store, gate, router and circuit state.
//! Nothing here is stored; every call recomputes from the sources.

use serde::{Deserialize, Serialize};

use crate::circuit::{CircuitAuditBridge, CircuitStatistics};
use crate::error::MeshResult;
use crate::flows::ProcessorHealth;
use crate::gate::{GatePosture, ZeroTrustGate};
use crate::router::ThresholdRouter;
use crate::store::OfflineStore;
use crate::types::now_ms;

/// Nav velocity above this marks the mesh degraded.
pub const UNSTABLE_NAV_VELOCITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshHealth {
    Healthy,
    /// Serving, but some cells are throttled or locked, routes are unstable or a processor is down.
    Degraded,
    /// Offline, or every known cell is locked: only local-only paths remain.
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshGauges {
    /// Percentage of nav logs served by failover or local routes.
    pub latency_tolerance: f64,
    /// Share of non-primary selections in the trailing router window (0.0–1.0).
    pub nav_velocity: f64,
    pub locked_cells: Vec<String>,
    pub throttled_cells: Vec<String>,
    pub total_anomalies: u32,
    pub pending_sync: usize,
    pub nav_log_count: usize,
    pub offline: bool,
    pub circuit: CircuitStatistics,
    pub processors: Vec<ProcessorHealth>,
    pub health: MeshHealth,
    pub computed_at: i64,
}

impl MeshGauges {
    pub fn compute(
        store: &OfflineStore,
        gate: &ZeroTrustGate,
        router: &ThresholdRouter,
        circuit: &CircuitAuditBridge,
        processors: Vec<ProcessorHealth>,
    ) -> MeshResult<Self> {
        let cells = gate.status();
        let locked_cells: Vec<String> = cells
            .iter()
            .filter(|c| c.posture == GatePosture::Locked)
            .map(|c| c.cell_id.clone())
            .collect();
        let throttled_cells: Vec<String> = cells
            .iter()
            .filter(|c| c.posture == GatePosture::Throttled)
            .map(|c| c.cell_id.clone())
            .collect();
        let total_anomalies = cells.iter().map(|c| c.anomaly_count).sum();
        let nav_velocity = router.get_nav_velocity();
        let offline = router.is_offline();

        let health = if offline || (!cells.is_empty() && locked_cells.len() == cells.len()) {
            MeshHealth::Isolated
        } else if !locked_cells.is_empty()
            || !throttled_cells.is_empty()
            || nav_velocity > UNSTABLE_NAV_VELOCITY
            || processors.iter().any(|p| !p.available)
        {
            MeshHealth::Degraded
        } else {
            MeshHealth::Healthy
        };

        Ok(Self {
            latency_tolerance: store.get_latency_tolerance()?,
            nav_velocity,
            locked_cells,
            throttled_cells,
            total_anomalies,
            pending_sync: store.get_pending_sync_resources()?.len(),
            nav_log_count: store.count_nav_logs()?,
            offline,
            circuit: circuit.get_statistics(),
            processors,
            health,
            computed_at: now_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::harness;

    #[test]
    fn health_follows_cell_postures() {
        let h = harness();
        let gauges = MeshGauges::compute(&h.store, &h.gate, &h.router, &h.circuit, Vec::new()).unwrap();
        assert_eq!(gauges.health, MeshHealth::Healthy);
        assert_eq!(gauges.latency_tolerance, 0.0);

        h.gate.report_anomaly("archive", 50, "scored upstream").unwrap();
        let gauges = MeshGauges::compute(&h.store, &h.gate, &h.router, &h.circuit, Vec::new()).unwrap();
        assert_eq!(gauges.health, MeshHealth::Degraded);
        assert_eq!(gauges.throttled_cells, vec!["archive".to_string()]);

        for cell in ["archive", "narrative", "revenue"] {
            h.gate.trigger_lockdown(cell, "drill").unwrap();
        }
        let gauges = MeshGauges::compute(&h.store, &h.gate, &h.router, &h.circuit, Vec::new()).unwrap();
        assert_eq!(gauges.health, MeshHealth::Isolated);
        assert_eq!(gauges.locked_cells.len(), 3);
    }
}
