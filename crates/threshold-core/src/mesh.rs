//! Mesh context: owns the store, circuit bridge, gate and router, and lazily builds one
//! instance of each flow. Pass the context (or an `Arc` of it) instead of reaching for globals;
//! tests build a fresh context per case.
//!
//! Request path: Gate → Router → Flow → Store → Circuit.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit::{AuditSink, CircuitAuditBridge, JsonlAuditSink, TracingAuditSink};
use crate::config::MeshConfig;
use crate::decision::{DecisionSource, RandomDecision};
use crate::error::{MeshError, MeshResult};
use crate::flows::{
    ArchiveDocument, DocumentDraft, FeedFetcher, HttpFeedFetcher, InMemoryDocumentRepository,
    InMemoryPersonaRepository, InMemoryPostRepository, InfoFlow, MythFlow, PaymentProcessor, Post, PublishReport,
    Publisher, RevenueEvent, RssFeedEntry, SearchResult, SimulatedProcessor, SimulatedPublisher, WealthFlow,
    STRIPE,
};
use crate::gate::{AccessRequest, CellStatus, DenialReason, GateDecision, ZeroTrustGate};
use crate::intercept::{FetchInterceptor, HttpNetwork, Network, ReplayReport};
use crate::metrics::MeshGauges;
use crate::router::{RouteCheck, ThresholdRouter};
use crate::store::{OfflineStore, RemoteSync, SimulatedRemote, SyncReport};
use crate::types::{now_ms, NavLogEntry, RouteStatus, Threshold};

const DEFAULT_SEARCH_LIMIT: usize = 10;
const ROUTE_CHECK_HISTORY: usize = 10;

/// A domain request entering the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MeshRequest {
    ProcessRevenue {
        amount: f64,
        #[serde(default)]
        processor: Option<String>,
        #[serde(default)]
        stream: Option<String>,
    },
    SearchArchive {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    AddDocument(DocumentDraft),
    FetchFeed {
        url: String,
    },
    CreatePost {
        content: String,
        platform: String,
        #[serde(default)]
        scheduled_for: Option<i64>,
    },
    PublishQueue,
}

impl MeshRequest {
    pub fn threshold(&self) -> Threshold {
        match self {
            Self::ProcessRevenue { .. } => Threshold::Wealth,
            Self::SearchArchive { .. } | Self::AddDocument(_) | Self::FetchFeed { .. } => Threshold::Info,
            Self::CreatePost { .. } | Self::PublishQueue => Threshold::Myth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MeshResponse {
    Revenue(RevenueEvent),
    Search(Vec<SearchResult>),
    Document(ArchiveDocument),
    Feed(Vec<RssFeedEntry>),
    Post(Post),
    Published(PublishReport),
    /// Policy denial from the gate; not an error.
    Denied { cell_id: String, reason: DenialReason },
}

impl MeshResponse {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

/// Result of `test-offline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineDrill {
    pub hours: f64,
    pub requests: usize,
    pub local_routes: usize,
    pub revenue_processor: String,
    pub search_hits: usize,
    pub posts_deferred: usize,
    /// Cached resources whose expiry falls inside the simulated outage.
    pub expiring_during_outage: usize,
    pub latency_tolerance: f64,
}

/// Result of `sync-force`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncForceReport {
    pub pruned: usize,
    pub sync: SyncReport,
    pub replay: ReplayReport,
    pub processor_available: bool,
}

/// Result of `route-check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCheckReport {
    pub threshold: Threshold,
    pub routes: Vec<RouteCheck>,
    pub recent: Vec<NavLogEntry>,
}

/// Holds the router offline until dropped, so a failing or panicking drill still reconnects.
struct OfflineGuard<'a>(&'a ThresholdRouter);

impl<'a> OfflineGuard<'a> {
    fn engage(router: &'a ThresholdRouter) -> Self {
        router.set_offline(true);
        Self(router)
    }
}

impl Drop for OfflineGuard<'_> {
    fn drop(&mut self) {
        self.0.set_offline(false);
    }
}

/// Overrides for the collaborators a context would otherwise build from config.
#[derive(Default)]
pub struct MeshBuilder {
    config: MeshConfig,
    decision: Option<Arc<dyn DecisionSource>>,
    processor: Option<Arc<dyn PaymentProcessor>>,
    fetcher: Option<Arc<dyn FeedFetcher>>,
    publisher: Option<Arc<dyn Publisher>>,
    remote: Option<Arc<dyn RemoteSync>>,
    network: Option<Arc<dyn Network>>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl MeshBuilder {
    /// Decision source for every simulated collaborator not overridden below.
    pub fn decision(mut self, decision: Arc<dyn DecisionSource>) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn feed_fetcher(mut self, fetcher: Arc<dyn FeedFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn remote_sync(mut self, remote: Arc<dyn RemoteSync>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> MeshResult<MeshContext> {
        let config = self.config;
        let store = Arc::new(OfflineStore::open(config.storage_dir())?);

        let sink: Arc<dyn AuditSink> = match (self.sink, &config.audit_log_path) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(JsonlAuditSink::open(path)?),
            (None, None) => Arc::new(TracingAuditSink),
        };
        let circuit = Arc::new(CircuitAuditBridge::new(sink));
        let gate = Arc::new(ZeroTrustGate::new(store.clone(), circuit.clone())?);

        let mut tokens = config.cells.clone();
        for t in Threshold::all() {
            tokens.entry(t.default_cell().to_string()).or_insert_with(|| {
                warn!(cell_id = t.default_cell(), "[GATE] no token configured, generated one for this process");
                Uuid::new_v4().to_string()
            });
        }
        for (cell, token) in &tokens {
            gate.register_cell(cell, token)?;
        }

        let router = Arc::new(ThresholdRouter::new(
            store.clone(),
            gate.clone(),
            config.nav_velocity_window_secs,
        ));

        let decision = self
            .decision
            .unwrap_or_else(|| Arc::new(RandomDecision::new(config.wealth.remote_success_rate)));
        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(SimulatedProcessor::new(STRIPE, decision.clone())));
        let publisher = self
            .publisher
            .unwrap_or_else(|| Arc::new(SimulatedPublisher::new(decision.clone())));
        let remote = self
            .remote
            .unwrap_or_else(|| Arc::new(SimulatedRemote::new(decision.clone())));
        let fetcher: Arc<dyn FeedFetcher> = match self.fetcher {
            Some(f) => f,
            None => Arc::new(HttpFeedFetcher::new()?),
        };
        let network: Arc<dyn Network> = match self.network {
            Some(n) => n,
            None => Arc::new(HttpNetwork::new(&config.upstream_url)?),
        };

        info!(storage = %config.storage_path, cells = tokens.len(), "[SYSTEM] threshold mesh ready");
        Ok(MeshContext {
            config,
            store,
            circuit,
            gate,
            router,
            tokens,
            processor,
            fetcher,
            publisher,
            remote,
            network,
            wealth: OnceCell::new(),
            info: OnceCell::new(),
            myth: OnceCell::new(),
            interceptor: OnceCell::new(),
        })
    }
}

pub struct MeshContext {
    config: MeshConfig,
    store: Arc<OfflineStore>,
    circuit: Arc<CircuitAuditBridge>,
    gate: Arc<ZeroTrustGate>,
    router: Arc<ThresholdRouter>,
    tokens: BTreeMap<String, String>,
    processor: Arc<dyn PaymentProcessor>,
    fetcher: Arc<dyn FeedFetcher>,
    publisher: Arc<dyn Publisher>,
    remote: Arc<dyn RemoteSync>,
    network: Arc<dyn Network>,
    wealth: OnceCell<Arc<WealthFlow>>,
    info: OnceCell<Arc<InfoFlow>>,
    myth: OnceCell<Arc<MythFlow>>,
    interceptor: OnceCell<Arc<FetchInterceptor>>,
}

impl MeshContext {
    pub fn builder(config: MeshConfig) -> MeshBuilder {
        MeshBuilder {
            config,
            ..MeshBuilder::default()
        }
    }

    /// Context with collaborators built from `config` (simulated processor/publisher,
    /// HTTP feeds and upstream).
    pub fn open(config: MeshConfig) -> MeshResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<OfflineStore> {
        self.store.clone()
    }

    pub fn gate(&self) -> Arc<ZeroTrustGate> {
        self.gate.clone()
    }

    pub fn router(&self) -> Arc<ThresholdRouter> {
        self.router.clone()
    }

    pub fn circuit_audit_bridge(&self) -> Arc<CircuitAuditBridge> {
        self.circuit.clone()
    }

    /// Token the context registered for a cell (configured or generated).
    pub fn cell_token(&self, cell_id: &str) -> Option<&str> {
        self.tokens.get(cell_id).map(String::as_str)
    }

    pub fn wealth_flow(&self) -> Arc<WealthFlow> {
        self.wealth
            .get_or_init(|| {
                Arc::new(WealthFlow::new(
                    self.router.clone(),
                    self.store.clone(),
                    self.circuit.clone(),
                    self.processor.clone(),
                    self.config.wealth.clone(),
                    self.config.resource_ttl_secs,
                ))
            })
            .clone()
    }

    pub fn info_flow(&self) -> Arc<InfoFlow> {
        self.info
            .get_or_init(|| {
                Arc::new(InfoFlow::new(
                    self.router.clone(),
                    self.store.clone(),
                    self.circuit.clone(),
                    self.fetcher.clone(),
                    Arc::new(InMemoryDocumentRepository::default()),
                ))
            })
            .clone()
    }

    pub fn myth_flow(&self) -> Arc<MythFlow> {
        self.myth
            .get_or_init(|| {
                Arc::new(MythFlow::new(
                    self.router.clone(),
                    self.store.clone(),
                    self.circuit.clone(),
                    self.publisher.clone(),
                    Arc::new(InMemoryPostRepository::default()),
                    Arc::new(InMemoryPersonaRepository::default()),
                    &self.config.sms_webhook_base,
                    self.config.resource_ttl_secs,
                ))
            })
            .clone()
    }

    pub fn interceptor(&self) -> Arc<FetchInterceptor> {
        self.interceptor
            .get_or_init(|| {
                Arc::new(FetchInterceptor::new(
                    self.store.clone(),
                    self.network.clone(),
                    &self.config.api_prefix,
                    &self.config.static_paths,
                ))
            })
            .clone()
    }

    /// Validates against the request's domain cell, then runs the flow operation.
    /// Bad tokens are `Err`; rate limits and lockdowns come back as `MeshResponse::Denied`.
    pub async fn handle(&self, token: &str, request: MeshRequest) -> MeshResult<MeshResponse> {
        let threshold = request.threshold();
        let cell_id = threshold.default_cell();
        let decision = self
            .gate
            .validate(&AccessRequest::new(cell_id, threshold.as_str(), token))?;
        if let GateDecision::Denied { reason } = decision {
            return Ok(MeshResponse::Denied {
                cell_id: cell_id.to_string(),
                reason,
            });
        }

        match request {
            MeshRequest::ProcessRevenue {
                amount,
                processor,
                stream,
            } => {
                let mut event = RevenueEvent::new(amount, processor.as_deref().unwrap_or(STRIPE));
                if let Some(stream) = stream {
                    event = event.with_type(&stream);
                }
                Ok(MeshResponse::Revenue(self.wealth_flow().process_revenue(event).await?))
            }
            MeshRequest::SearchArchive { query, limit } => Ok(MeshResponse::Search(
                self.info_flow()
                    .search_archive(&query, limit.unwrap_or(DEFAULT_SEARCH_LIMIT))?,
            )),
            MeshRequest::AddDocument(draft) => Ok(MeshResponse::Document(self.info_flow().add_document(draft)?)),
            MeshRequest::FetchFeed { url } => Ok(MeshResponse::Feed(self.info_flow().fetch_rss_feed(&url).await?)),
            MeshRequest::CreatePost {
                content,
                platform,
                scheduled_for,
            } => {
                let myth = self.myth_flow();
                let post = myth.create_post(&content, &platform)?;
                let post = match scheduled_for {
                    Some(at) => myth.schedule_post(&post.id, at)?,
                    None => post,
                };
                Ok(MeshResponse::Post(post))
            }
            MeshRequest::PublishQueue => Ok(MeshResponse::Published(self.myth_flow().publish_queue().await?)),
        }
    }

    /// Forces the router offline, runs one request per domain and restores connectivity,
    /// even when the drill itself fails.
    pub async fn test_offline(&self, hours: f64) -> MeshResult<OfflineDrill> {
        if !hours.is_finite() || hours < 0.0 {
            return Err(MeshError::InvalidInput(format!("hours must be a non-negative number, got {}", hours)));
        }
        info!(hours, "[SYSTEM] offline drill starting");
        let _offline = OfflineGuard::engage(&self.router);
        self.run_offline_drill(hours).await
    }

    async fn run_offline_drill(&self, hours: f64) -> MeshResult<OfflineDrill> {
        let logs_before = self.store.count_nav_logs()?;

        let revenue = self
            .wealth_flow()
            .process_revenue(RevenueEvent::new(1.0, STRIPE).with_type("digital"))
            .await?;
        let search_hits = self
            .info_flow()
            .search_archive("threshold", DEFAULT_SEARCH_LIMIT)?
            .len();
        let publish = self.myth_flow().publish_queue().await?;

        let new_logs = self.store.count_nav_logs()?.saturating_sub(logs_before);
        let local_routes = self
            .store
            .get_nav_logs(None, new_logs)?
            .iter()
            .filter(|l| l.route_status == RouteStatus::Local)
            .count();

        // `as` saturates at i64::MAX for huge windows
        let horizon = now_ms().saturating_add((hours * 3_600_000.0) as i64);
        let mut expiring = 0;
        for t in Threshold::all() {
            expiring += self
                .store
                .get_cached_by_threshold(t)?
                .iter()
                .filter(|e| e.is_expired_at(horizon))
                .count();
        }

        Ok(OfflineDrill {
            hours,
            requests: new_logs,
            local_routes,
            revenue_processor: revenue.processor,
            search_hits,
            posts_deferred: publish.deferred,
            expiring_during_outage: expiring,
            latency_tolerance: self.store.get_latency_tolerance()?,
        })
    }

    pub fn gate_status(&self) -> Vec<CellStatus> {
        self.gate.status()
    }

    /// Prunes expired cache entries, pushes pending ones to the remote, replays queued
    /// requests and re-probes the payment processor.
    pub async fn sync_force(&self) -> MeshResult<SyncForceReport> {
        let pruned = self.store.prune_expired()?;
        let sync = self.store.sync_to_remote(self.remote.as_ref()).await?;
        let replay = self.interceptor().replay_queued().await?;
        let processor_available = self.wealth_flow().check_processor_health().await.available;
        info!(
            pruned,
            synced = sync.synced,
            conflicts = sync.conflicts,
            replayed = replay.replayed,
            "[SYSTEM] forced sync finished"
        );
        Ok(SyncForceReport {
            pruned,
            sync,
            replay,
            processor_available,
        })
    }

    pub fn route_check(&self, threshold: Threshold) -> MeshResult<RouteCheckReport> {
        Ok(RouteCheckReport {
            threshold,
            routes: self.router.check_routes(threshold)?,
            recent: self.store.get_nav_logs(Some(threshold), ROUTE_CHECK_HISTORY)?,
        })
    }

    pub fn dashboard(&self) -> MeshResult<MeshGauges> {
        MeshGauges::compute(
            &self.store,
            &self.gate,
            &self.router,
            &self.circuit,
            self.wealth_flow().processor_health(),
        )
    }
}
