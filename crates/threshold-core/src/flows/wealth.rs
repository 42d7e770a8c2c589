//! Wealth flow: revenue processing with stripe → local-sim failover and memoized payouts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit::{create_flow_event, create_revenue_event, CircuitAuditBridge};
use crate::config::{FailoverPolicy, WealthSettings};
use crate::decision::DecisionSource;
use crate::error::{MeshError, MeshResult};
use crate::router::{RouteDef, RouteTransport, ThresholdRouter};
use crate::store::OfflineStore;
use crate::types::{now_ms, ResourceCacheEntry, Threshold};

pub const STRIPE: &str = "stripe";
pub const LOCAL_SIM: &str = "local-sim";

const PAYOUT_CACHE_TTL_MS: i64 = 60 * 60 * 1000;
/// Processed events kept in memory; older ones are read back from the store.
const MAX_TRACKED_EVENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevenueStatus {
    Pending,
    Completed,
    Failed,
}

/// A revenue attempt. `metadata.type` selects the stream (digital, service, tool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueEvent {
    pub id: String,
    pub amount: f64,
    pub processor: String,
    pub status: RevenueStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub payout: Option<PayoutCalculation>,
}

impl RevenueEvent {
    pub fn new(amount: f64, processor: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            amount,
            processor: processor.to_string(),
            status: RevenueStatus::Pending,
            metadata: json!({}),
            created_at: now_ms(),
            processed_at: None,
            payout: None,
        }
    }

    pub fn with_type(mut self, stream: &str) -> Self {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        self.metadata["type"] = json!(stream);
        self
    }

    pub fn stream_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(|t| t.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutCalculation {
    pub gross: f64,
    pub fees: f64,
    pub net: f64,
    pub processor: String,
    /// Served from the one-hour memo.
    pub cached: bool,
    pub calculated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorHealth {
    pub processor: String,
    pub available: bool,
    pub latency_ms: u64,
    pub last_check: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub processed: usize,
    pub failed: usize,
}

/// Completed events grouped by `metadata.type`. Other types land nowhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevenueStreams {
    pub digital: Vec<RevenueEvent>,
    pub service: Vec<RevenueEvent>,
    pub tool: Vec<RevenueEvent>,
}

/// Remote payment processor.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the processor's charge id.
    async fn charge(&self, event: &RevenueEvent) -> MeshResult<String>;

    async fn health(&self) -> MeshResult<()>;
}

/// Stand-in processor whose outcomes come from a `DecisionSource`.
pub struct SimulatedProcessor {
    name: String,
    decision: Arc<dyn DecisionSource>,
}

impl SimulatedProcessor {
    pub fn new(name: &str, decision: Arc<dyn DecisionSource>) -> Self {
        Self {
            name: name.to_string(),
            decision,
        }
    }
}

#[async_trait]
impl PaymentProcessor for SimulatedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn charge(&self, event: &RevenueEvent) -> MeshResult<String> {
        if self.decision.should_succeed(&format!("{}.charge", self.name)) {
            Ok(format!("ch_{}", event.id.replace('-', "")))
        } else {
            Err(MeshError::Remote(format!("{} charge declined for {}", self.name, event.id)))
        }
    }

    async fn health(&self) -> MeshResult<()> {
        if self.decision.should_succeed(&format!("{}.health", self.name)) {
            Ok(())
        } else {
            Err(MeshError::Remote(format!("{} unreachable", self.name)))
        }
    }
}

struct ChargeTransport<'a> {
    processor: &'a dyn PaymentProcessor,
    event: &'a RevenueEvent,
}

#[async_trait]
impl RouteTransport for ChargeTransport<'_> {
    async fn dispatch(&self, route: &RouteDef, _payload: &serde_json::Value) -> MeshResult<serde_json::Value> {
        let charge_id = self.processor.charge(self.event).await?;
        Ok(json!({ "processor": self.processor.name(), "charge_id": charge_id, "route": route.id }))
    }
}

struct CachedPayout {
    calc: PayoutCalculation,
    computed_at: i64,
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct WealthFlow {
    router: Arc<ThresholdRouter>,
    store: Arc<OfflineStore>,
    circuit: Arc<CircuitAuditBridge>,
    processor: Arc<dyn PaymentProcessor>,
    settings: WealthSettings,
    resource_ttl_ms: i64,
    active_processor: Mutex<String>,
    queue: Mutex<VecDeque<RevenueEvent>>,
    events: DashMap<String, RevenueEvent>,
    event_order: Mutex<VecDeque<String>>,
    event_capacity: usize,
    payouts: DashMap<(String, u64), CachedPayout>,
    health: DashMap<String, ProcessorHealth>,
}

impl WealthFlow {
    pub fn new(
        router: Arc<ThresholdRouter>,
        store: Arc<OfflineStore>,
        circuit: Arc<CircuitAuditBridge>,
        processor: Arc<dyn PaymentProcessor>,
        settings: WealthSettings,
        resource_ttl_secs: u64,
    ) -> Self {
        let active = processor.name().to_string();
        Self {
            router,
            store,
            circuit,
            processor,
            settings,
            resource_ttl_ms: (resource_ttl_secs as i64).saturating_mul(1000),
            active_processor: Mutex::new(active),
            queue: Mutex::new(VecDeque::new()),
            events: DashMap::new(),
            event_order: Mutex::new(VecDeque::new()),
            event_capacity: MAX_TRACKED_EVENTS,
            payouts: DashMap::new(),
            health: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    fn track_event(&self, event: &RevenueEvent) {
        let mut order = self.event_order.lock().unwrap_or_else(|p| p.into_inner());
        if self.events.insert(event.id.clone(), event.clone()).is_none() {
            order.push_back(event.id.clone());
        }
        while order.len() > self.event_capacity {
            if let Some(oldest) = order.pop_front() {
                self.events.remove(&oldest);
            }
        }
    }

    pub fn active_processor(&self) -> String {
        self.active_processor.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_active(&self, name: &str) {
        let mut active = self.active_processor.lock().unwrap_or_else(|p| p.into_inner());
        if *active != name {
            info!(from = %active.as_str(), to = name, "[WEALTH] active processor switched");
            *active = name.to_string();
        }
    }

    /// Clears a sticky failover.
    pub fn reset_active_processor(&self) {
        self.set_active(self.processor.name());
    }

    pub async fn process_revenue(&self, mut event: RevenueEvent) -> MeshResult<RevenueEvent> {
        if !event.amount.is_finite() || event.amount <= 0.0 {
            warn!(
                event_id = %event.id,
                amount = event.amount,
                "[WEALTH] rejecting revenue with invalid amount"
            );
            event.status = RevenueStatus::Failed;
            event.processed_at = Some(now_ms());
            self.circuit
                .emit_circuit_event(create_revenue_event(&event.id, event.amount, &event.processor, "failed"));
            self.track_event(&event);
            return Ok(event);
        }

        let sticky = self.settings.failover_policy == FailoverPolicy::Sticky
            && self.active_processor() == LOCAL_SIM;
        let outcome = if sticky {
            debug!(event_id = %event.id, "[WEALTH] sticky failover, staying on local-sim");
            self.router.route_local(Threshold::Wealth)?
        } else {
            let payload = serde_json::to_value(&event)?;
            let transport = ChargeTransport {
                processor: self.processor.as_ref(),
                event: &event,
            };
            self.router.route_request(Threshold::Wealth, &payload, &transport).await?
        };

        let processor = if outcome.response.is_some() {
            self.set_active(self.processor.name());
            self.processor.name().to_string()
        } else {
            if !outcome.errors.is_empty() && self.settings.failover_policy == FailoverPolicy::Sticky {
                warn!(
                    errors = outcome.errors.len(),
                    "[WEALTH] remote processor failed, failing over to local-sim"
                );
                self.set_active(LOCAL_SIM);
            }
            LOCAL_SIM.to_string()
        };

        event.payout = Some(self.calculate_payout(event.amount, &processor));
        event.processor = processor;
        event.status = RevenueStatus::Completed;
        event.processed_at = Some(now_ms());

        self.store.cache_resource(&ResourceCacheEntry::pending(
            format!("revenue:{}", event.id),
            Threshold::Wealth,
            serde_json::to_value(&event)?,
            Some(self.resource_ttl_ms),
        ))?;

        self.circuit
            .emit_circuit_event(create_revenue_event(&event.id, event.amount, &event.processor, "completed"));
        let status = if outcome.is_local() { "fallback" } else { "completed" };
        self.circuit.emit_circuit_event(create_flow_event(
            Threshold::Wealth,
            "process_revenue",
            status,
            json!({ "event_id": event.id, "route": outcome.route_id, "processor": event.processor }),
        ));
        info!(event_id = %event.id, processor = %event.processor, amount = event.amount, "[WEALTH] revenue processed");

        self.track_event(&event);
        Ok(event)
    }

    /// Queues an event for `process_queue`; returns its id.
    pub fn enqueue_revenue(&self, event: RevenueEvent) -> String {
        let id = event.id.clone();
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).push_back(event);
        id
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drains the queue in order. A storage error puts the current event back and stops.
    pub async fn process_queue(&self) -> MeshResult<QueueReport> {
        let mut report = QueueReport::default();
        loop {
            let next = self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
            let Some(event) = next else { break };
            match self.process_revenue(event.clone()).await {
                Ok(done) if done.status == RevenueStatus::Completed => report.processed += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    self.queue.lock().unwrap_or_else(|p| p.into_inner()).push_front(event);
                    return Err(e);
                }
            }
        }
        info!(processed = report.processed, failed = report.failed, "[WEALTH] queue drained");
        Ok(report)
    }

    /// Recent events from memory, older completed ones from the store cache.
    pub fn get_event(&self, id: &str) -> MeshResult<Option<RevenueEvent>> {
        if let Some(event) = self.events.get(id) {
            return Ok(Some(event.clone()));
        }
        match self.store.get_cached_resource(&format!("revenue:{}", id))? {
            Some(entry) => Ok(Some(serde_json::from_value(entry.payload)?)),
            None => Ok(None),
        }
    }

    pub fn events(&self) -> Vec<RevenueEvent> {
        let mut events: Vec<RevenueEvent> = self.events.iter().map(|e| e.value().clone()).collect();
        events.sort_by_key(|e| e.created_at);
        events
    }

    pub fn calculate_payout(&self, amount: f64, processor: &str) -> PayoutCalculation {
        self.calculate_payout_at(amount, processor, now_ms())
    }

    /// Memoized per exact `(processor, amount)` for one hour. The DashMap entry lock makes
    /// concurrent calls for the same key compute once.
    pub(crate) fn calculate_payout_at(&self, amount: f64, processor: &str, now: i64) -> PayoutCalculation {
        let gross = amount;
        let key = (processor.to_string(), amount.to_bits());
        if !self.payouts.contains_key(&key) {
            self.payouts
                .retain(|_, cached| now - cached.computed_at < PAYOUT_CACHE_TTL_MS);
        }
        let mut inserted = false;
        let mut slot = self.payouts.entry(key).or_insert_with(|| {
            inserted = true;
            CachedPayout {
                calc: self.compute_payout(gross, processor, now),
                computed_at: now,
            }
        });
        if inserted {
            return slot.calc.clone();
        }
        if now - slot.computed_at >= PAYOUT_CACHE_TTL_MS {
            *slot = CachedPayout {
                calc: self.compute_payout(gross, processor, now),
                computed_at: now,
            };
            return slot.calc.clone();
        }
        let mut calc = slot.calc.clone();
        calc.cached = true;
        calc
    }

    fn compute_payout(&self, gross: f64, processor: &str, now: i64) -> PayoutCalculation {
        let fees = if processor == STRIPE {
            round_cents(gross * self.settings.stripe_percent_fee + self.settings.stripe_fixed_fee).max(0.0)
        } else {
            0.0
        };
        PayoutCalculation {
            gross,
            fees,
            net: if fees == 0.0 { gross } else { gross - fees },
            processor: processor.to_string(),
            cached: false,
            calculated_at: now,
        }
    }

    pub fn partition_revenue_streams(events: &[RevenueEvent]) -> RevenueStreams {
        let mut streams = RevenueStreams::default();
        for event in events.iter().filter(|e| e.status == RevenueStatus::Completed) {
            match event.stream_type() {
                Some("digital") => streams.digital.push(event.clone()),
                Some("service") => streams.service.push(event.clone()),
                Some("tool") => streams.tool.push(event.clone()),
                _ => {}
            }
        }
        streams
    }

    /// Probes the remote processor. A healthy probe ends a sticky failover.
    pub async fn check_processor_health(&self) -> ProcessorHealth {
        let started = Instant::now();
        let result = self.processor.health().await;
        let health = ProcessorHealth {
            processor: self.processor.name().to_string(),
            available: result.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            last_check: now_ms(),
        };
        match result {
            Ok(()) => {
                if self.active_processor() == LOCAL_SIM {
                    info!("[WEALTH] processor healthy again, leaving local-sim");
                    self.reset_active_processor();
                }
            }
            Err(e) => warn!(processor = %health.processor, error = %e, "[WEALTH] processor health probe failed"),
        }
        self.health.insert(health.processor.clone(), health.clone());
        health
    }

    /// Last known health per processor; local-sim is always available.
    pub fn processor_health(&self) -> Vec<ProcessorHealth> {
        let mut all: Vec<ProcessorHealth> = self.health.iter().map(|h| h.value().clone()).collect();
        all.push(ProcessorHealth {
            processor: LOCAL_SIM.to_string(),
            available: true,
            latency_ms: 0,
            last_check: now_ms(),
        });
        all
    }
}
