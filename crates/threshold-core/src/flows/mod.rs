//! Resource flows: wealth (revenue), info (archive + feeds), myth (posts + personas).
//!
//! Each flow asks the router for a route, runs its remote collaborator through a
//! [`RouteTransport`](crate::router::RouteTransport) and falls back to a local simulation
//! that cannot fail when the router resolves to local-only.

pub mod info;
pub mod myth;
pub mod repository;
pub mod wealth;

pub use info::{
    parse_feed, ArchiveDocument, DocumentDraft, FeedFetcher, HttpFeedFetcher, ImportReport, InfoFlow, RssFeedEntry,
    SearchResult, StaticFeedFetcher,
};
pub use myth::{
    MythFlow, NarrativeSeed, Persona, Post, PostStatus, PublishReport, Publisher, SimulatedPublisher,
    SmsFallback,
};
pub use repository::{
    DocumentRepository, InMemoryDocumentRepository, InMemoryPersonaRepository, InMemoryPostRepository,
    PersonaRepository, PostRepository,
};
pub use wealth::{
    PaymentProcessor, PayoutCalculation, ProcessorHealth, QueueReport, RevenueEvent, RevenueStatus,
    RevenueStreams, SimulatedProcessor, WealthFlow, LOCAL_SIM, STRIPE,
};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::circuit::{CircuitAuditBridge, MemoryAuditSink};
    use crate::gate::ZeroTrustGate;
    use crate::router::ThresholdRouter;
    use crate::store::OfflineStore;
    use crate::types::Threshold;

    pub(crate) struct Harness {
        pub _dir: tempfile::TempDir,
        pub store: Arc<OfflineStore>,
        pub circuit: Arc<CircuitAuditBridge>,
        pub gate: Arc<ZeroTrustGate>,
        pub router: Arc<ThresholdRouter>,
    }

    pub(crate) fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OfflineStore::open(dir.path()).unwrap());
        let circuit = Arc::new(CircuitAuditBridge::new(Arc::new(MemoryAuditSink::default())));
        let gate = Arc::new(ZeroTrustGate::new(store.clone(), circuit.clone()).unwrap());
        for t in Threshold::all() {
            gate.register_cell(t.default_cell(), "token").unwrap();
        }
        let router = Arc::new(ThresholdRouter::new(store.clone(), gate.clone(), 300));
        Harness {
            _dir: dir,
            store,
            circuit,
            gate,
            router,
        }
    }
}
