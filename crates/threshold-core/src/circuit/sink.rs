//! Audit destinations. The mesh does not own the destination; it only hands entries over.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info, warn};

use super::AuditEntry;
use crate::error::MeshResult;

/// Receives every audit entry. Implementations must not fail the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Logs entries through `tracing` under target `threshold::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        match entry.level.as_str() {
            "critical" | "error" => error!(
                target: "threshold::audit",
                source = %entry.source,
                level = %entry.level,
                "{}",
                entry.message
            ),
            "warning" => warn!(target: "threshold::audit", source = %entry.source, "{}", entry.message),
            _ => info!(target: "threshold::audit", source = %entry.source, "{}", entry.message),
        }
    }
}

/// Append-only JSON-lines file.
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "[CIRCUIT] audit entry not serializable");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(error = %e, "[CIRCUIT] audit file write failed");
        }
    }
}

/// Keeps entries in memory (tests, dashboards).
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{create_gate_event, to_audit_entry};

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/mesh.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.record(&to_audit_entry(&create_gate_event("revenue", "wealth", true, None)));
        sink.record(&to_audit_entry(&create_gate_event("revenue", "wealth", false, Some("lockdown"))));
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.level, "warning");
    }
}
