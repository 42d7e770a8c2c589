//! Circuit–Audit Bridge: normalizes revenue, gate, anomaly and flow occurrences into
//! `CircuitEvent`s, keeps the most recent ones in a bounded ring buffer and forwards each
//! one to an external audit sink as an `AuditEntry`.
//!
//! Severity is derived from inputs only:
//!
//! | Event | Rule |
//! |-------|------|
//! | anomaly | severity > 75 → critical, > 40 → error, else warning |
//! | gate | allowed → info, denied → warning |
//! | revenue | failed → error, else info |
//! | flow | failed → error, fallback → warning, else info |

mod sink;

pub use sink::{AuditSink, JsonlAuditSink, MemoryAuditSink, TracingAuditSink};

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::types::{now_ms, Threshold};

/// Ring buffer capacity; the oldest event is evicted first.
pub const CIRCUIT_BUFFER_CAPACITY: usize = 1000;

const ANOMALY_CRITICAL_ABOVE: u8 = 75;
const ANOMALY_ERROR_ABOVE: u8 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitEventType {
    Revenue,
    Gate,
    Anomaly,
    Flow,
}

impl CircuitEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Gate => "gate",
            Self::Anomaly => "anomaly",
            Self::Flow => "flow",
        }
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl CircuitSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for CircuitSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized mesh occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: CircuitEventType,
    pub severity: CircuitSeverity,
    pub source: String,
    pub summary: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl CircuitEvent {
    fn new(
        event_type: CircuitEventType,
        severity: CircuitSeverity,
        source: impl Into<String>,
        summary: String,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity,
            source: source.into(),
            summary,
            data,
            timestamp: now_ms(),
        }
    }
}

/// Audit-log projection of one circuit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    pub level: String,
    pub source: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

pub fn create_revenue_event(event_id: &str, amount: f64, processor: &str, status: &str) -> CircuitEvent {
    let severity = if status == "failed" {
        CircuitSeverity::Error
    } else {
        CircuitSeverity::Info
    };
    CircuitEvent::new(
        CircuitEventType::Revenue,
        severity,
        "wealth_flow",
        format!("revenue {} {} via {} ({:.2})", event_id, status, processor, amount),
        json!({
            "event_id": event_id,
            "amount": amount,
            "processor": processor,
            "status": status,
        }),
    )
}

pub fn create_gate_event(cell_id: &str, flow: &str, allowed: bool, reason: Option<&str>) -> CircuitEvent {
    let severity = if allowed {
        CircuitSeverity::Info
    } else {
        CircuitSeverity::Warning
    };
    let verdict = if allowed { "allowed" } else { "denied" };
    CircuitEvent::new(
        CircuitEventType::Gate,
        severity,
        "zero_trust_gate",
        format!("{} {} on cell {}", flow, verdict, cell_id),
        json!({
            "cell_id": cell_id,
            "flow": flow,
            "allowed": allowed,
            "reason": reason,
        }),
    )
}

pub fn create_anomaly_event(cell_id: &str, severity: u8, action: &str, reason: &str) -> CircuitEvent {
    let level = if severity > ANOMALY_CRITICAL_ABOVE {
        CircuitSeverity::Critical
    } else if severity > ANOMALY_ERROR_ABOVE {
        CircuitSeverity::Error
    } else {
        CircuitSeverity::Warning
    };
    CircuitEvent::new(
        CircuitEventType::Anomaly,
        level,
        "zero_trust_gate",
        format!("anomaly severity {} on cell {}: {}", severity, cell_id, action),
        json!({
            "cell_id": cell_id,
            "severity": severity,
            "action": action,
            "reason": reason,
        }),
    )
}

pub fn create_flow_event(
    threshold: Threshold,
    operation: &str,
    status: &str,
    details: serde_json::Value,
) -> CircuitEvent {
    let severity = match status {
        "failed" => CircuitSeverity::Error,
        "fallback" => CircuitSeverity::Warning,
        _ => CircuitSeverity::Info,
    };
    CircuitEvent::new(
        CircuitEventType::Flow,
        severity,
        format!("{}_flow", threshold),
        format!("{} {}", operation, status),
        json!({
            "threshold": threshold,
            "operation": operation,
            "status": status,
            "details": details,
        }),
    )
}

/// One-to-one audit projection.
pub fn to_audit_entry(event: &CircuitEvent) -> AuditEntry {
    let timestamp = chrono::DateTime::from_timestamp_millis(event.timestamp)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    AuditEntry {
        timestamp,
        level: event.severity.as_str().to_string(),
        source: event.source.clone(),
        message: event.summary.clone(),
        metadata: json!({
            "event_id": event.id,
            "type": event.event_type,
            "data": event.data,
        }),
    }
}

/// Read-only summary of the buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatistics {
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

/// Bounded event buffer plus audit forwarding.
pub struct CircuitAuditBridge {
    buffer: Mutex<VecDeque<CircuitEvent>>,
    capacity: usize,
    sink: Arc<dyn AuditSink>,
}

impl CircuitAuditBridge {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::with_capacity(sink, CIRCUIT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sink,
        }
    }

    fn events(&self) -> std::sync::MutexGuard<'_, VecDeque<CircuitEvent>> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends to the ring buffer (evicting the oldest at capacity) and forwards the audit entry.
    pub fn emit_circuit_event(&self, event: CircuitEvent) -> AuditEntry {
        let entry = to_audit_entry(&event);
        {
            let mut events = self.events();
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
        self.sink.record(&entry);
        entry
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Up to `limit` most recent events, newest first.
    pub fn get_recent_events(&self, limit: usize) -> Vec<CircuitEvent> {
        self.events().iter().rev().take(limit).cloned().collect()
    }

    /// Events with exactly this severity, oldest first.
    pub fn get_events_by_severity(&self, severity: CircuitSeverity) -> Vec<CircuitEvent> {
        self.events()
            .iter()
            .filter(|e| e.severity == severity)
            .cloned()
            .collect()
    }

    pub fn get_statistics(&self) -> CircuitStatistics {
        let events = self.events();
        let mut stats = CircuitStatistics {
            total: events.len(),
            oldest: events.front().map(|e| e.timestamp),
            newest: events.back().map(|e| e.timestamp),
            ..Default::default()
        };
        for e in events.iter() {
            *stats.by_severity.entry(e.severity.as_str().to_string()).or_default() += 1;
            *stats.by_type.entry(e.event_type.as_str().to_string()).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_severity_bands() {
        assert_eq!(create_anomaly_event("c", 76, "lockdown", "r").severity, CircuitSeverity::Critical);
        assert_eq!(create_anomaly_event("c", 75, "throttle", "r").severity, CircuitSeverity::Error);
        assert_eq!(create_anomaly_event("c", 41, "throttle", "r").severity, CircuitSeverity::Error);
        assert_eq!(create_anomaly_event("c", 40, "warn", "r").severity, CircuitSeverity::Warning);
    }

    #[test]
    fn gate_and_flow_severity() {
        assert_eq!(create_gate_event("c", "f", true, None).severity, CircuitSeverity::Info);
        assert_eq!(create_gate_event("c", "f", false, Some("lockdown")).severity, CircuitSeverity::Warning);
        assert_eq!(
            create_flow_event(Threshold::Myth, "publish", "fallback", json!({})).severity,
            CircuitSeverity::Warning
        );
        assert_eq!(create_revenue_event("e", 1.0, "stripe", "failed").severity, CircuitSeverity::Error);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let sink = Arc::new(MemoryAuditSink::default());
        let bridge = CircuitAuditBridge::with_capacity(sink.clone(), 3);
        for i in 0..5 {
            bridge.emit_circuit_event(create_revenue_event(&format!("e{}", i), 1.0, "stripe", "completed"));
        }
        assert_eq!(bridge.len(), 3);
        let recent = bridge.get_recent_events(10);
        assert_eq!(recent[0].data["event_id"], "e4");
        assert_eq!(recent[2].data["event_id"], "e2");
        // Every event reaches the sink, evicted or not.
        assert_eq!(sink.entries().len(), 5);
    }

    #[test]
    fn projections_do_not_mutate() {
        let bridge = CircuitAuditBridge::new(Arc::new(MemoryAuditSink::default()));
        bridge.emit_circuit_event(create_gate_event("archive", "info", false, Some("rate_limited")));
        bridge.emit_circuit_event(create_anomaly_event("archive", 90, "lockdown", "rate"));
        let stats = bridge.get_statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_severity.get("critical"), Some(&1));
        assert_eq!(stats.by_type.get("gate"), Some(&1));
        assert_eq!(bridge.get_events_by_severity(CircuitSeverity::Warning).len(), 1);
        assert_eq!(bridge.len(), 2);
    }

    #[test]
    fn audit_entry_projection() {
        let event = create_flow_event(Threshold::Info, "search", "ok", json!({"hits": 2}));
        let entry = to_audit_entry(&event);
        assert_eq!(entry.level, "info");
        assert_eq!(entry.source, "info_flow");
        assert_eq!(entry.message, "search ok");
        assert_eq!(entry.metadata["data"]["details"]["hits"], 2);
        assert!(!entry.timestamp.is_empty());
    }
}
