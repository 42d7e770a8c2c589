//! Info flow: in-memory archive search plus RSS/Atom feed ingestion.
//!
//! Search scoring per document:
//! - +10 when the title contains the query
//! - +5 per content match, at most 3, each returned as a fragment with ±30 chars of context
//! - +3 per tag containing the query
//!
//! Feeds are cached per URL until cleared. A fetch that cannot reach any remote route
//! yields an empty list, never an error.

use async_trait::async_trait;
use dashmap::DashMap;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::repository::DocumentRepository;
use crate::circuit::{create_flow_event, CircuitAuditBridge};
use crate::error::{MeshError, MeshResult};
use crate::router::{RouteDef, RouteTransport, ThresholdRouter};
use crate::store::OfflineStore;
use crate::types::{now_ms, ResourceCacheEntry, Threshold};

const TITLE_SCORE: u32 = 10;
const FRAGMENT_SCORE: u32 = 5;
const TAG_SCORE: u32 = 3;
const MAX_FRAGMENTS: usize = 3;
const CONTEXT_CHARS: usize = 30;
const FEED_KEY_PREFIX: &str = "feed:";
const USER_AGENT: &str = "threshold-mesh/0.1 (feed reader)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: String,
    pub created_at: i64,
}

/// Input for `add_document` / `batch_import`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentDraft {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl DocumentDraft {
    pub fn new(title: &str, content: &str, tags: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssFeedEntry {
    pub title: String,
    pub link: Option<String>,
    pub description: String,
    pub published: Option<String>,
    /// Feed URL the entry came from.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub document: ArchiveDocument,
    pub score: u32,
    pub fragments: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> MeshResult<Vec<RssFeedEntry>>;
}

/// Fetches feeds over HTTP and parses them with `scraper`.
pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new() -> MeshResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> MeshResult<Vec<RssFeedEntry>> {
        let body = self.client.get(url).send().await?.error_for_status()?.text().await?;
        Ok(parse_feed(&body, url))
    }
}

/// Serves fixed feed bodies by URL; unknown URLs fail like an unreachable host.
#[derive(Debug, Clone, Default)]
pub struct StaticFeedFetcher {
    bodies: HashMap<String, String>,
}

impl StaticFeedFetcher {
    pub fn with_feed(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl FeedFetcher for StaticFeedFetcher {
    async fn fetch(&self, url: &str) -> MeshResult<Vec<RssFeedEntry>> {
        self.bodies
            .get(url)
            .map(|body| parse_feed(body, url))
            .ok_or_else(|| MeshError::Remote(format!("feed unreachable: {}", url)))
    }
}

fn element_text(el: ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// `<link>` is void in HTML, so an RSS link's URL ends up in the following text node.
fn entry_link(item: ElementRef, link_sel: &Selector) -> Option<String> {
    let link = item.select(link_sel).next()?;
    if let Some(href) = link.value().attr("href") {
        return Some(href.to_string());
    }
    let inner = element_text(link);
    if !inner.is_empty() {
        return Some(inner);
    }
    link.next_sibling()
        .and_then(|n| n.value().as_text().map(|t| t.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// Extracts RSS `<item>`s and Atom `<entry>`s. Entries without a title are skipped.
pub fn parse_feed(body: &str, source: &str) -> Vec<RssFeedEntry> {
    let document = Html::parse_document(body);
    let (Ok(item_sel), Ok(title_sel), Ok(link_sel), Ok(desc_sel), Ok(date_sel)) = (
        Selector::parse("item, entry"),
        Selector::parse("title"),
        Selector::parse("link"),
        Selector::parse("description, summary, content"),
        Selector::parse("pubdate, published, updated"),
    ) else {
        return Vec::new();
    };

    document
        .select(&item_sel)
        .filter_map(|item| {
            let title = item.select(&title_sel).next().map(element_text)?;
            if title.is_empty() {
                return None;
            }
            Some(RssFeedEntry {
                title,
                link: entry_link(item, &link_sel),
                description: item
                    .select(&desc_sel)
                    .next()
                    .map(element_text)
                    .unwrap_or_default(),
                published: item
                    .select(&date_sel)
                    .next()
                    .map(element_text)
                    .filter(|d| !d.is_empty()),
                source: source.to_string(),
            })
        })
        .collect()
}

/// Up to `max` case-insensitive matches of `needle_lower`, each with context on both sides.
/// Works on char positions so multi-byte text is never split.
fn match_fragments(content: &str, needle_lower: &str, max: usize) -> Vec<String> {
    let needle_chars = needle_lower.chars().count();
    if needle_chars == 0 {
        return Vec::new();
    }
    let bounds: Vec<usize> = content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(content.len()))
        .collect();
    let total = bounds.len() - 1;

    let mut fragments = Vec::new();
    let mut pos = 0;
    while pos + needle_chars <= total && fragments.len() < max {
        if content[bounds[pos]..bounds[pos + needle_chars]].to_lowercase() == needle_lower {
            let start = pos.saturating_sub(CONTEXT_CHARS);
            let end = (pos + needle_chars + CONTEXT_CHARS).min(total);
            fragments.push(content[bounds[start]..bounds[end]].to_string());
            pos += needle_chars;
        } else {
            pos += 1;
        }
    }
    fragments
}

fn score_document(document: &ArchiveDocument, query_lower: &str) -> (u32, Vec<String>) {
    let mut score = 0;
    if document.title.to_lowercase().contains(query_lower) {
        score += TITLE_SCORE;
    }
    let fragments = match_fragments(&document.content, query_lower, MAX_FRAGMENTS);
    score += FRAGMENT_SCORE * fragments.len() as u32;
    score += TAG_SCORE
        * document
            .tags
            .iter()
            .filter(|t| t.to_lowercase().contains(query_lower))
            .count() as u32;
    (score, fragments)
}

struct FeedTransport<'a> {
    fetcher: &'a dyn FeedFetcher,
    url: &'a str,
}

#[async_trait]
impl RouteTransport for FeedTransport<'_> {
    async fn dispatch(&self, _route: &RouteDef, _payload: &serde_json::Value) -> MeshResult<serde_json::Value> {
        let entries = self.fetcher.fetch(self.url).await?;
        Ok(serde_json::to_value(entries)?)
    }
}

pub struct InfoFlow {
    router: Arc<ThresholdRouter>,
    store: Arc<OfflineStore>,
    circuit: Arc<CircuitAuditBridge>,
    fetcher: Arc<dyn FeedFetcher>,
    documents: Arc<dyn DocumentRepository>,
    feeds: DashMap<String, Vec<RssFeedEntry>>,
}

impl InfoFlow {
    pub fn new(
        router: Arc<ThresholdRouter>,
        store: Arc<OfflineStore>,
        circuit: Arc<CircuitAuditBridge>,
        fetcher: Arc<dyn FeedFetcher>,
        documents: Arc<dyn DocumentRepository>,
    ) -> Self {
        Self {
            router,
            store,
            circuit,
            fetcher,
            documents,
            feeds: DashMap::new(),
        }
    }

    pub fn add_document(&self, draft: DocumentDraft) -> MeshResult<ArchiveDocument> {
        let title = draft.title.trim();
        if title.is_empty() {
            return Err(MeshError::InvalidInput("document title is required".to_string()));
        }
        let document = ArchiveDocument {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            content: draft.content,
            tags: draft.tags,
            source: draft.source.unwrap_or_else(|| "manual".to_string()),
            created_at: now_ms(),
        };
        self.documents.insert(document.clone())?;
        debug!(document_id = %document.id, "[INFO] document archived");
        Ok(document)
    }

    pub fn get_document(&self, id: &str) -> MeshResult<Option<ArchiveDocument>> {
        self.documents.get(id)
    }

    pub fn remove_document(&self, id: &str) -> MeshResult<bool> {
        self.documents.remove(id)
    }

    pub fn document_count(&self) -> MeshResult<usize> {
        Ok(self.documents.all()?.len())
    }

    /// Scored hits, best first, truncated to `limit`. A blank query matches nothing.
    pub fn search_archive(&self, query: &str, limit: usize) -> MeshResult<Vec<SearchResult>> {
        let query_lower = query.trim().to_lowercase();
        if query_lower.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut results: Vec<SearchResult> = self
            .documents
            .all()?
            .into_iter()
            .filter_map(|document| {
                let (score, fragments) = score_document(&document, &query_lower);
                (score > 0).then_some(SearchResult {
                    document,
                    score,
                    fragments,
                })
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.document.created_at.cmp(&b.document.created_at))
                .then(a.document.id.cmp(&b.document.id))
        });
        results.truncate(limit);
        debug!(query = %query, hits = results.len(), "[INFO] archive searched");
        Ok(results)
    }

    pub fn search_by_tag(&self, tag: &str) -> MeshResult<Vec<ArchiveDocument>> {
        let mut hits: Vec<ArchiveDocument> = self
            .documents
            .all()?
            .into_iter()
            .filter(|d| d.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
            .collect();
        hits.sort_by_key(|d| d.created_at);
        Ok(hits)
    }

    /// Each draft is inserted on its own; failures are collected, never fatal.
    pub fn batch_import(&self, drafts: Vec<DocumentDraft>) -> ImportReport {
        let mut report = ImportReport::default();
        for draft in drafts {
            let label = draft.title.clone();
            match self.add_document(draft) {
                Ok(_) => report.imported += 1,
                Err(e) => {
                    warn!(title = %label, error = %e, "[INFO] document import failed");
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", label, e));
                }
            }
        }
        info!(imported = report.imported, failed = report.failed, "[INFO] batch import finished");
        report
    }

    fn feed_key(url: &str) -> String {
        format!("{}{}", FEED_KEY_PREFIX, url)
    }

    /// Cached entries for `url`, fetching through the router on a miss. Unreachable feeds
    /// return an empty list and are not cached.
    pub async fn fetch_rss_feed(&self, url: &str) -> MeshResult<Vec<RssFeedEntry>> {
        if let Some(cached) = self.feeds.get(url) {
            return Ok(cached.clone());
        }
        if let Some(entry) = self.store.get_cached_resource(&Self::feed_key(url))? {
            let entries: Vec<RssFeedEntry> = serde_json::from_value(entry.payload)?;
            self.feeds.insert(url.to_string(), entries.clone());
            return Ok(entries);
        }

        let transport = FeedTransport {
            fetcher: self.fetcher.as_ref(),
            url,
        };
        let outcome = self
            .router
            .route_request(Threshold::Info, &json!({ "url": url }), &transport)
            .await?;

        let Some(response) = outcome.response else {
            warn!(url = %url, route = %outcome.route_id, "[INFO] feed unavailable, serving empty list");
            self.circuit.emit_circuit_event(create_flow_event(
                Threshold::Info,
                "fetch_rss_feed",
                "fallback",
                json!({ "url": url, "errors": outcome.errors }),
            ));
            return Ok(Vec::new());
        };

        let entries: Vec<RssFeedEntry> = serde_json::from_value(response)?;
        self.store.cache_resource(&ResourceCacheEntry::pending(
            Self::feed_key(url),
            Threshold::Info,
            serde_json::to_value(&entries)?,
            None,
        ))?;
        self.feeds.insert(url.to_string(), entries.clone());
        self.circuit.emit_circuit_event(create_flow_event(
            Threshold::Info,
            "fetch_rss_feed",
            "completed",
            json!({ "url": url, "entries": entries.len(), "route": outcome.route_id }),
        ));
        info!(url = %url, entries = entries.len(), "[INFO] feed cached");
        Ok(entries)
    }

    /// Drops one feed (or every feed) from both caches; returns how many were removed.
    pub fn clear_feed_cache(&self, url: Option<&str>) -> MeshResult<usize> {
        let urls: Vec<String> = match url {
            Some(u) => vec![u.to_string()],
            None => {
                let mut all: Vec<String> = self.feeds.iter().map(|e| e.key().clone()).collect();
                for entry in self.store.get_cached_by_threshold(Threshold::Info)? {
                    if let Some(u) = entry.key.strip_prefix(FEED_KEY_PREFIX) {
                        if !all.iter().any(|a| a == u) {
                            all.push(u.to_string());
                        }
                    }
                }
                all
            }
        };
        let mut removed = 0;
        for u in urls {
            let in_memory = self.feeds.remove(&u).is_some();
            let in_store = self.store.remove_cached_resource(&Self::feed_key(&u))?;
            if in_memory || in_store {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Fetches a feed and archives each entry as a document tagged `feed`.
    pub async fn import_feed(&self, url: &str) -> MeshResult<ImportReport> {
        let drafts = self
            .fetch_rss_feed(url)
            .await?
            .into_iter()
            .map(|e| DocumentDraft {
                title: e.title,
                content: e.description,
                tags: vec!["feed".to_string()],
                source: Some(e.link.unwrap_or(e.source)),
            })
            .collect();
        Ok(self.batch_import(drafts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::repository::InMemoryDocumentRepository;
    use crate::flows::testing::{harness, Harness};

    const FEED_URL: &str = "https://feeds.example.org/mesh.xml";
    const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Mesh</title>
<item><title>Offline first</title><link>https://example.org/a</link>
<description>Routing without a network</description><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
<item><title>Zero trust cells</title><link>https://example.org/b</link><description>Gate posture</description></item>
<item><description>untitled</description></item>
</channel></rss>"#;

    fn flow(h: &Harness, fetcher: StaticFeedFetcher) -> InfoFlow {
        InfoFlow::new(
            h.router.clone(),
            h.store.clone(),
            h.circuit.clone(),
            Arc::new(fetcher),
            Arc::new(InMemoryDocumentRepository::default()),
        )
    }

    #[test]
    fn parses_rss_items() {
        let entries = parse_feed(FEED, FEED_URL);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Offline first");
        assert_eq!(entries[0].link.as_deref(), Some("https://example.org/a"));
        assert_eq!(entries[0].description, "Routing without a network");
        assert!(entries[0].published.is_some());
        assert_eq!(entries[1].published, None);
    }

    #[test]
    fn scoring_and_fragments() {
        let h = harness();
        let flow = flow(&h, StaticFeedFetcher::default());
        flow.add_document(DocumentDraft::new(
            "Quantum Computing",
            "Introduction to quantum computing concepts",
            &["quantum"],
        ))
        .unwrap();
        flow.add_document(DocumentDraft::new("Cooking", "Quantum soup, quantum bread, quantum cake, quantum tea", &[]))
            .unwrap();
        flow.add_document(DocumentDraft::new("Gardening", "Nothing to see", &["soil"])).unwrap();

        let results = flow.search_archive("quantum", 10).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].document.title.contains("Quantum"));
        assert_eq!(results[0].score, 10 + 5 + 3);
        assert_eq!(results[1].score, 15);
        assert_eq!(results[1].fragments.len(), 3);
        assert_eq!(flow.search_archive("quantum", 1).unwrap().len(), 1);
        assert!(flow.search_archive("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn fragments_respect_char_boundaries() {
        let text = format!("{}quantum{}", "é".repeat(40), "ü".repeat(40));
        let fragments = match_fragments(&text, "quantum", 3);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].chars().count(), 30 + 7 + 30);
    }

    #[test]
    fn batch_import_is_best_effort() {
        let h = harness();
        let flow = flow(&h, StaticFeedFetcher::default());
        let report = flow.batch_import(vec![
            DocumentDraft::new("One", "", &[]),
            DocumentDraft::new("", "no title", &[]),
            DocumentDraft::new("Three", "", &["x"]),
        ]);
        assert_eq!(report.imported, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(flow.search_by_tag("X").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn feeds_cache_until_cleared() {
        let h = harness();
        let flow = flow(&h, StaticFeedFetcher::default().with_feed(FEED_URL, FEED));
        assert_eq!(flow.fetch_rss_feed(FEED_URL).await.unwrap().len(), 2);
        assert!(h.store.get_cached_resource("feed:https://feeds.example.org/mesh.xml").unwrap().is_some());
        assert_eq!(flow.clear_feed_cache(None).unwrap(), 1);
        assert!(flow.fetch_rss_feed("https://down.example.org/rss").await.unwrap().is_empty());

        let report = flow.import_feed(FEED_URL).await.unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(flow.search_by_tag("feed").unwrap().len(), 2);
    }
}
