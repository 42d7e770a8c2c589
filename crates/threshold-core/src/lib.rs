//! threshold-core: the threshold navigation mesh.
//!
//! Zero-trust gate, failover router and sled-backed offline store, with the wealth, info and
//! myth resource flows on top and a circuit bridge feeding the audit log. Build everything
//! through [`MeshContext`].

pub mod circuit;
pub mod config;
pub mod decision;
pub mod error;
pub mod flows;
pub mod gate;
pub mod intercept;
mod mesh;
pub mod metrics;
pub mod router;
pub mod store;
pub mod types;

// Ambient
pub use config::{FailoverPolicy, MeshConfig, WealthSettings};
pub use decision::{AlwaysFail, AlwaysSucceed, DecisionSource, RandomDecision, ScriptedDecision};
pub use error::{MeshError, MeshResult};
pub use types::{
    now_ms, GateStateEntry, NavLogEntry, ResourceCacheEntry, RouteStatus, SyncStatus, Threshold,
};

// Components
pub use circuit::{
    AuditEntry, AuditSink, CircuitAuditBridge, CircuitEvent, CircuitEventType, CircuitSeverity,
    CircuitStatistics, JsonlAuditSink, MemoryAuditSink, TracingAuditSink,
};
pub use gate::{AccessRequest, CellStatus, DenialReason, GateDecision, GatePosture, ZeroTrustGate};
pub use intercept::{FetchInterceptor, FetchRequest, FetchResponse, FetchStrategy, HttpNetwork, Network};
pub use metrics::{MeshGauges, MeshHealth};
pub use router::{RouteCheck, RouteDef, RouteOutcome, RouteTable, RouteTier, RouteTransport, ThresholdRouter};
pub use store::{LoopbackRemote, OfflineStore, RemoteSync, SimulatedRemote, SyncReport, SyncVerdict};

// Context
pub use mesh::{
    MeshBuilder, MeshContext, MeshRequest, MeshResponse, OfflineDrill, RouteCheckReport, SyncForceReport,
};
