//! Threshold Router: ordered failover per domain: primary → secondary → local-only.
//!
//! Remote routes are skipped when their gate cell is locked (counted as breach attempts) or
//! when the router is forced offline. A route that errors is abandoned immediately for the
//! next one; retries belong to the caller. Local-only never touches the transport and
//! always succeeds, so `route_request` only fails on storage errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::gate::ZeroTrustGate;
use crate::store::OfflineStore;
use crate::types::{now_ms, NavLogEntry, RouteStatus, Threshold};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    Primary,
    Secondary,
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDef {
    /// Stable id recorded as `path_used` (e.g. "wealth.primary").
    pub id: String,
    pub tier: RouteTier,
    /// Gate cell guarding this route; local-only routes have none.
    pub cell_id: Option<String>,
    /// Remote endpoint handed to the transport.
    pub endpoint: Option<String>,
}

impl RouteDef {
    pub fn remote(id: impl Into<String>, tier: RouteTier, cell_id: &str, endpoint: Option<&str>) -> Self {
        Self {
            id: id.into(),
            tier,
            cell_id: Some(cell_id.to_string()),
            endpoint: endpoint.map(str::to_string),
        }
    }

    pub fn local(threshold: Threshold) -> Self {
        Self {
            id: format!("{}.local", threshold),
            tier: RouteTier::LocalOnly,
            cell_id: None,
            endpoint: None,
        }
    }
}

/// Ordered routes per threshold.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: HashMap<Threshold, Vec<RouteDef>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        let mut routes = HashMap::new();
        for t in Threshold::all() {
            let cell = t.default_cell();
            routes.insert(
                t,
                vec![
                    RouteDef::remote(format!("{}.primary", t), RouteTier::Primary, cell, None),
                    RouteDef::remote(format!("{}.secondary", t), RouteTier::Secondary, cell, None),
                    RouteDef::local(t),
                ],
            );
        }
        Self { routes }
    }
}

impl RouteTable {
    /// Replaces the routes for a threshold. A trailing local-only route is appended when absent.
    pub fn set_routes(&mut self, threshold: Threshold, mut routes: Vec<RouteDef>) {
        routes.retain(|r| r.tier != RouteTier::LocalOnly);
        routes.push(RouteDef::local(threshold));
        self.routes.insert(threshold, routes);
    }

    pub fn routes(&self, threshold: Threshold) -> Option<&Vec<RouteDef>> {
        self.routes.get(&threshold)
    }
}

/// Executes a request against one remote route.
#[async_trait]
pub trait RouteTransport: Send + Sync {
    async fn dispatch(&self, route: &RouteDef, payload: &serde_json::Value) -> MeshResult<serde_json::Value>;
}

/// Result of routing one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOutcome {
    pub route_id: String,
    pub status: RouteStatus,
    pub latency_ms: u64,
    pub breach_attempts: u32,
    /// Remote response; `None` means the caller runs its local simulation.
    pub response: Option<serde_json::Value>,
    /// Errors from abandoned remote routes, in order.
    pub errors: Vec<String>,
}

impl RouteOutcome {
    pub fn is_local(&self) -> bool {
        self.status == RouteStatus::Local
    }
}

/// Availability of one route for `route-check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCheck {
    pub route_id: String,
    pub tier: RouteTier,
    pub cell_id: Option<String>,
    pub available: bool,
    pub reason: Option<String>,
}

pub struct ThresholdRouter {
    store: Arc<OfflineStore>,
    gate: Arc<ZeroTrustGate>,
    table: RwLock<RouteTable>,
    offline: AtomicBool,
    /// (timestamp, switched) per routed request, for nav velocity.
    history: Mutex<VecDeque<(i64, bool)>>,
    velocity_window_ms: i64,
}

impl ThresholdRouter {
    pub fn new(store: Arc<OfflineStore>, gate: Arc<ZeroTrustGate>, velocity_window_secs: u64) -> Self {
        Self::with_table(store, gate, RouteTable::default(), velocity_window_secs)
    }

    pub fn with_table(
        store: Arc<OfflineStore>,
        gate: Arc<ZeroTrustGate>,
        table: RouteTable,
        velocity_window_secs: u64,
    ) -> Self {
        Self {
            store,
            gate,
            table: RwLock::new(table),
            offline: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            velocity_window_ms: (velocity_window_secs as i64).saturating_mul(1000),
        }
    }

    pub fn set_routes(&self, threshold: Threshold, routes: Vec<RouteDef>) {
        self.table
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .set_routes(threshold, routes);
    }

    fn routes_for(&self, threshold: Threshold) -> MeshResult<Vec<RouteDef>> {
        self.table
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .routes(threshold)
            .cloned()
            .ok_or_else(|| MeshError::UnknownRoute(threshold.to_string()))
    }

    /// Forces every request onto local-only while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        info!(offline, "[ROUTER] offline mode changed");
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub async fn route_request(
        &self,
        threshold: Threshold,
        payload: &serde_json::Value,
        transport: &dyn RouteTransport,
    ) -> MeshResult<RouteOutcome> {
        let routes = self.routes_for(threshold)?;
        let started = Instant::now();
        let offline = self.is_offline();
        let mut breach_attempts = 0u32;
        let mut errors = Vec::new();

        for route in routes.iter().filter(|r| r.tier != RouteTier::LocalOnly) {
            if offline {
                continue;
            }
            if route.cell_id.as_deref().is_some_and(|c| self.gate.is_locked(c)) {
                breach_attempts += 1;
                debug!(route = %route.id, "[ROUTER] skipping route on locked cell");
                continue;
            }
            let attempt = Instant::now();
            match transport.dispatch(route, payload).await {
                Ok(response) => {
                    let status = if route.tier == RouteTier::Primary {
                        RouteStatus::Primary
                    } else {
                        RouteStatus::Failover
                    };
                    let latency_ms = attempt.elapsed().as_millis() as u64;
                    return self.record(
                        threshold,
                        route.id.clone(),
                        status,
                        latency_ms,
                        breach_attempts,
                        Some(response),
                        errors,
                    );
                }
                Err(e) => {
                    warn!(route = %route.id, error = %e, "[ROUTER] route failed, advancing");
                    errors.push(format!("{}: {}", route.id, e));
                }
            }
        }

        let local = routes
            .iter()
            .find(|r| r.tier == RouteTier::LocalOnly)
            .cloned()
            .unwrap_or_else(|| RouteDef::local(threshold));
        let latency_ms = started.elapsed().as_millis() as u64;
        self.record(threshold, local.id, RouteStatus::Local, latency_ms, breach_attempts, None, errors)
    }

    /// Records a local-only decision without attempting any remote route.
    pub fn route_local(&self, threshold: Threshold) -> MeshResult<RouteOutcome> {
        let local = self
            .routes_for(threshold)?
            .into_iter()
            .find(|r| r.tier == RouteTier::LocalOnly)
            .unwrap_or_else(|| RouteDef::local(threshold));
        self.record(threshold, local.id, RouteStatus::Local, 0, 0, None, Vec::new())
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        threshold: Threshold,
        route_id: String,
        status: RouteStatus,
        latency_ms: u64,
        breach_attempts: u32,
        response: Option<serde_json::Value>,
        errors: Vec<String>,
    ) -> MeshResult<RouteOutcome> {
        let timestamp = now_ms();
        self.store.add_nav_log(&NavLogEntry {
            path_used: route_id.clone(),
            threshold,
            latency_ms,
            breach_attempts,
            route_status: status,
            timestamp,
        })?;
        {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            history.push_back((timestamp, status != RouteStatus::Primary));
            Self::prune(&mut history, timestamp - self.velocity_window_ms);
        }
        debug!(threshold = %threshold, route = %route_id, status = status.as_str(), latency_ms, "[ROUTER] routed");
        Ok(RouteOutcome {
            route_id,
            status,
            latency_ms,
            breach_attempts,
            response,
            errors,
        })
    }

    fn prune(history: &mut VecDeque<(i64, bool)>, cutoff: i64) {
        while history.front().is_some_and(|&(t, _)| t < cutoff) {
            history.pop_front();
        }
    }

    /// Route switches (non-primary selections) divided by attempts over the trailing window.
    pub fn get_nav_velocity(&self) -> f64 {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        Self::prune(&mut history, now_ms() - self.velocity_window_ms);
        if history.is_empty() {
            return 0.0;
        }
        let switches = history.iter().filter(|(_, switched)| *switched).count();
        switches as f64 / history.len() as f64
    }

    /// Current availability of each route of a threshold.
    pub fn check_routes(&self, threshold: Threshold) -> MeshResult<Vec<RouteCheck>> {
        let offline = self.is_offline();
        Ok(self
            .routes_for(threshold)?
            .into_iter()
            .map(|r| {
                let reason = if r.tier == RouteTier::LocalOnly {
                    None
                } else if offline {
                    Some("offline".to_string())
                } else if r.cell_id.as_deref().is_some_and(|c| self.gate.is_locked(c)) {
                    Some("cell locked".to_string())
                } else {
                    None
                };
                RouteCheck {
                    route_id: r.id,
                    tier: r.tier,
                    cell_id: r.cell_id,
                    available: reason.is_none(),
                    reason,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitAuditBridge, MemoryAuditSink};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` dispatches, then echoes the route id.
    struct FlakyTransport {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RouteTransport for FlakyTransport {
        async fn dispatch(&self, route: &RouteDef, _payload: &serde_json::Value) -> MeshResult<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(MeshError::Remote(format!("{} down", route.id)))
            } else {
                Ok(json!({ "route": route.id }))
            }
        }
    }

    fn router() -> (tempfile::TempDir, Arc<OfflineStore>, Arc<ZeroTrustGate>, ThresholdRouter) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OfflineStore::open(dir.path()).unwrap());
        let circuit = Arc::new(CircuitAuditBridge::new(Arc::new(MemoryAuditSink::default())));
        let gate = Arc::new(ZeroTrustGate::new(store.clone(), circuit).unwrap());
        gate.register_cell("revenue", "t").unwrap();
        let router = ThresholdRouter::new(store.clone(), gate.clone(), 300);
        (dir, store, gate, router)
    }

    fn flaky(failures: usize) -> FlakyTransport {
        FlakyTransport {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn advances_through_tiers() {
        let (_dir, store, _gate, router) = router();
        let primary = router.route_request(Threshold::Wealth, &json!({}), &flaky(0)).await.unwrap();
        assert_eq!(primary.status, RouteStatus::Primary);
        assert_eq!(primary.response.unwrap()["route"], "wealth.primary");

        let failover = router.route_request(Threshold::Wealth, &json!({}), &flaky(1)).await.unwrap();
        assert_eq!(failover.status, RouteStatus::Failover);
        assert_eq!(failover.route_id, "wealth.secondary");
        assert_eq!(failover.errors.len(), 1);

        let local = router.route_request(Threshold::Wealth, &json!({}), &flaky(2)).await.unwrap();
        assert!(local.is_local());
        assert!(local.response.is_none());

        assert_eq!(store.count_nav_logs().unwrap(), 3);
        assert!((router.get_nav_velocity() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn locked_cell_bypasses_remote_routes() {
        let (_dir, store, gate, router) = router();
        gate.trigger_lockdown("revenue", "test").unwrap();
        let transport = flaky(0);
        let outcome = router.route_request(Threshold::Wealth, &json!({}), &transport).await.unwrap();
        assert!(outcome.is_local());
        assert_eq!(outcome.breach_attempts, 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        let logs = store.get_nav_logs(Some(Threshold::Wealth), 10).unwrap();
        assert!(logs.iter().all(|l| l.route_status == RouteStatus::Local));

        let checks = router.check_routes(Threshold::Wealth).unwrap();
        assert_eq!(checks.iter().filter(|c| c.available).count(), 1);
    }

    #[tokio::test]
    async fn offline_mode_forces_local() {
        let (_dir, _store, _gate, router) = router();
        router.set_offline(true);
        let transport = flaky(0);
        let outcome = router.route_request(Threshold::Info, &json!({}), &transport).await.unwrap();
        assert!(outcome.is_local());
        assert_eq!(outcome.breach_attempts, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_tables_always_end_local() {
        let mut table = RouteTable::default();
        table.set_routes(
            Threshold::Myth,
            vec![RouteDef::remote("myth.edge", RouteTier::Primary, "narrative", Some("https://edge"))],
        );
        let routes = table.routes(Threshold::Myth).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].tier, RouteTier::LocalOnly);
    }
}
