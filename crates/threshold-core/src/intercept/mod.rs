//! Fetch interception: per-request caching strategy plus an offline POST replay queue.
//!
//! | Request | Strategy |
//! |---------|----------|
//! | GET under the API prefix | stale-while-revalidate |
//! | GET on a static path | cache-first |
//! | any other GET | network-first, cache on failure |
//! | POST and other methods | network; queued for replay on failure, answered `202` |
//!
//! Only 2xx GET responses are cached. Cached responses and the replay queue live in the
//! offline store, so both survive restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::store::OfflineStore;
use crate::types::now_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl FetchRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            body: None,
            content_type: None,
        }
    }

    pub fn post(path: &str, body: &str) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.to_string(),
            body: Some(body.to_string()),
            content_type: Some("application/json".to_string()),
        }
    }

    fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    fn cache_key(&self) -> String {
        format!("{} {}", self.method.to_ascii_uppercase(), self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    Queued,
    /// Neither network nor cache could answer.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
    pub source: ResponseSource,
}

impl FetchResponse {
    fn json(status: u16, body: serde_json::Value, source: ResponseSource) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: Some("application/json".to_string()),
            source,
        }
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    response: FetchResponse,
    cached_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    StaleWhileRevalidate,
    CacheFirst,
    NetworkFirst,
    NetworkOrQueue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
}

/// Whatever actually sends a request upstream.
#[async_trait]
pub trait Network: Send + Sync {
    /// `Err` means the request never got an answer (offline, DNS, timeout).
    async fn send(&self, request: &FetchRequest) -> MeshResult<FetchResponse>;
}

pub struct HttpNetwork {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNetwork {
    pub fn new(base_url: &str) -> MeshResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn send(&self, request: &FetchRequest) -> MeshResult<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| MeshError::InvalidInput(format!("method {}: {}", request.method, e)))?;
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, request.path));
        if let Some(ct) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, ct.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await?;
        Ok(FetchResponse {
            status,
            body,
            content_type,
            source: ResponseSource::Network,
        })
    }
}

pub struct FetchInterceptor {
    store: Arc<OfflineStore>,
    network: Arc<dyn Network>,
    api_prefix: String,
    static_paths: Vec<String>,
    revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl FetchInterceptor {
    pub fn new(store: Arc<OfflineStore>, network: Arc<dyn Network>, api_prefix: &str, static_paths: &[String]) -> Self {
        Self {
            store,
            network,
            api_prefix: api_prefix.to_string(),
            static_paths: static_paths.to_vec(),
            revalidations: Mutex::new(Vec::new()),
        }
    }

    fn is_static(&self, path: &str) -> bool {
        self.static_paths
            .iter()
            .any(|p| path == p || (p.len() > 1 && p.ends_with('/') && path.starts_with(p.as_str())))
    }

    pub fn strategy_for(&self, request: &FetchRequest) -> FetchStrategy {
        if !request.is_get() {
            FetchStrategy::NetworkOrQueue
        } else if request.path.starts_with(&self.api_prefix) {
            FetchStrategy::StaleWhileRevalidate
        } else if self.is_static(&request.path) {
            FetchStrategy::CacheFirst
        } else {
            FetchStrategy::NetworkFirst
        }
    }

    pub async fn handle(&self, request: FetchRequest) -> MeshResult<FetchResponse> {
        let strategy = self.strategy_for(&request);
        debug!(method = %request.method, path = %request.path, ?strategy, "[INTERCEPT] request");
        match strategy {
            FetchStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            FetchStrategy::CacheFirst => self.cache_first(request).await,
            FetchStrategy::NetworkFirst => self.network_first(request).await,
            FetchStrategy::NetworkOrQueue => self.network_or_queue(request).await,
        }
    }

    fn cached(&self, request: &FetchRequest) -> MeshResult<Option<FetchResponse>> {
        Ok(self
            .store
            .get_http_cache::<CachedResponse>(&request.cache_key())?
            .map(|c| FetchResponse {
                source: ResponseSource::Cache,
                ..c.response
            }))
    }

    fn remember(store: &OfflineStore, request: &FetchRequest, response: &FetchResponse) -> MeshResult<()> {
        if response.is_success() {
            store.put_http_cache(
                &request.cache_key(),
                &CachedResponse {
                    response: response.clone(),
                    cached_at: now_ms(),
                },
            )?;
        }
        Ok(())
    }

    fn offline_response(request: &FetchRequest) -> FetchResponse {
        FetchResponse::json(503, json!({ "offline": true, "path": request.path }), ResponseSource::Offline)
    }

    async fn stale_while_revalidate(&self, request: FetchRequest) -> MeshResult<FetchResponse> {
        let Some(cached) = self.cached(&request)? else {
            return self.network_first(request).await;
        };
        let store = self.store.clone();
        let network = self.network.clone();
        let handle = tokio::spawn(async move {
            match network.send(&request).await {
                Ok(fresh) => {
                    if let Err(e) = Self::remember(&store, &request, &fresh) {
                        warn!(path = %request.path, error = %e, "[INTERCEPT] revalidated response not cached");
                    }
                }
                Err(e) => debug!(path = %request.path, error = %e, "[INTERCEPT] revalidation skipped"),
            }
        });
        let mut pending = self.revalidations.lock().unwrap_or_else(|p| p.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
        Ok(cached)
    }

    async fn cache_first(&self, request: FetchRequest) -> MeshResult<FetchResponse> {
        if let Some(cached) = self.cached(&request)? {
            return Ok(cached);
        }
        self.network_first(request).await
    }

    async fn network_first(&self, request: FetchRequest) -> MeshResult<FetchResponse> {
        match self.network.send(&request).await {
            Ok(response) => {
                Self::remember(&self.store, &request, &response)?;
                Ok(response)
            }
            Err(e) => {
                warn!(path = %request.path, error = %e, "[INTERCEPT] network failed, trying cache");
                Ok(self
                    .cached(&request)?
                    .unwrap_or_else(|| Self::offline_response(&request)))
            }
        }
    }

    async fn network_or_queue(&self, request: FetchRequest) -> MeshResult<FetchResponse> {
        match self.network.send(&request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let id = self.store.enqueue_replay(&request)?;
                info!(path = %request.path, queue_id = id, error = %e, "[INTERCEPT] request queued for replay");
                Ok(FetchResponse::json(
                    202,
                    json!({ "queued": true, "offline": true }),
                    ResponseSource::Queued,
                ))
            }
        }
    }

    /// Waits for background revalidations started so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.revalidations.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *pending)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "[INTERCEPT] revalidation task aborted");
            }
        }
    }

    pub fn queued_len(&self) -> MeshResult<usize> {
        self.store.replay_queue_len()
    }

    /// Replays queued requests oldest first and stops at the first one that still fails.
    pub async fn replay_queued(&self) -> MeshResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let entries = self.store.replay_entries::<FetchRequest>()?;
        let total = entries.len();
        for (id, request) in entries {
            match self.network.send(&request).await {
                Ok(response) => {
                    self.store.remove_replay(id)?;
                    report.replayed += 1;
                    debug!(path = %request.path, status = response.status, "[INTERCEPT] replayed");
                }
                Err(e) => {
                    warn!(path = %request.path, error = %e, "[INTERCEPT] replay halted");
                    break;
                }
            }
        }
        report.remaining = total - report.replayed;
        info!(replayed = report.replayed, remaining = report.remaining, "[INTERCEPT] replay finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Answers `200 "<path>#<n>"` while online, errors while offline.
    #[derive(Default)]
    struct ToggleNetwork {
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Network for ToggleNetwork {
        async fn send(&self, request: &FetchRequest) -> MeshResult<FetchResponse> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(MeshError::Remote("offline".to_string()));
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse {
                status: 200,
                body: format!("{}#{}", request.path, n),
                content_type: None,
                source: ResponseSource::Network,
            })
        }
    }

    fn interceptor() -> (tempfile::TempDir, Arc<ToggleNetwork>, FetchInterceptor) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OfflineStore::open(dir.path()).unwrap());
        let network = Arc::new(ToggleNetwork::default());
        let statics = vec!["/".to_string(), "/index.html".to_string(), "/static/".to_string()];
        let interceptor = FetchInterceptor::new(store, network.clone(), "/api/", &statics);
        (dir, network, interceptor)
    }

    #[test]
    fn strategy_selection() {
        let (_dir, _net, i) = interceptor();
        assert_eq!(i.strategy_for(&FetchRequest::get("/api/mesh")), FetchStrategy::StaleWhileRevalidate);
        assert_eq!(i.strategy_for(&FetchRequest::get("/static/app.js")), FetchStrategy::CacheFirst);
        assert_eq!(i.strategy_for(&FetchRequest::get("/")), FetchStrategy::CacheFirst);
        assert_eq!(i.strategy_for(&FetchRequest::get("/about")), FetchStrategy::NetworkFirst);
        assert_eq!(i.strategy_for(&FetchRequest::post("/api/x", "{}")), FetchStrategy::NetworkOrQueue);
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_cache_then_refreshes() {
        let (_dir, _net, i) = interceptor();
        let first = i.handle(FetchRequest::get("/api/mesh")).await.unwrap();
        assert_eq!(first.body, "/api/mesh#0");

        let second = i.handle(FetchRequest::get("/api/mesh")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.body, "/api/mesh#0");
        i.settle().await;

        let third = i.handle(FetchRequest::get("/api/mesh")).await.unwrap();
        assert_eq!(third.body, "/api/mesh#1");
        i.settle().await;
    }

    #[tokio::test]
    async fn network_first_falls_back_to_cache() {
        let (_dir, net, i) = interceptor();
        i.handle(FetchRequest::get("/about")).await.unwrap();
        net.offline.store(true, Ordering::SeqCst);
        let cached = i.handle(FetchRequest::get("/about")).await.unwrap();
        assert_eq!(cached.source, ResponseSource::Cache);
        let missing = i.handle(FetchRequest::get("/never")).await.unwrap();
        assert_eq!(missing.status, 503);
    }

    #[tokio::test]
    async fn failed_posts_queue_and_replay_in_order() {
        let (_dir, net, i) = interceptor();
        net.offline.store(true, Ordering::SeqCst);
        let queued = i.handle(FetchRequest::post("/api/revenue", "{\"amount\":1}")).await.unwrap();
        assert_eq!(queued.status, 202);
        let body: serde_json::Value = serde_json::from_str(&queued.body).unwrap();
        assert_eq!(body, json!({ "queued": true, "offline": true }));
        i.handle(FetchRequest::post("/api/revenue", "{\"amount\":2}")).await.unwrap();

        let stalled = i.replay_queued().await.unwrap();
        assert_eq!(stalled, ReplayReport { replayed: 0, remaining: 2 });

        net.offline.store(false, Ordering::SeqCst);
        let done = i.replay_queued().await.unwrap();
        assert_eq!(done, ReplayReport { replayed: 2, remaining: 0 });
        assert_eq!(i.queued_len().unwrap(), 0);
    }
}
