//! Myth flow: post lifecycle (draft → queued → published | failed), personas and narrative seeds.
//!
//! Exactly one persona is active once any exists; `rotate_persona` swaps it atomically.
//! `publish_queue` routes each due post on its own: a remote publish failure marks only that
//! post `failed`, while a route that resolves to local-only without trying a remote (offline,
//! cell locked) leaves the post queued for the next run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::repository::{PersonaRepository, PostRepository};
use crate::circuit::{create_flow_event, CircuitAuditBridge};
use crate::decision::DecisionSource;
use crate::error::{MeshError, MeshResult};
use crate::router::{RouteDef, RouteTransport, ThresholdRouter};
use crate::store::OfflineStore;
use crate::types::{now_ms, ResourceCacheEntry, Threshold};

const SMS_PLATFORM: &str = "sms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Queued,
    Published,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub content: String,
    pub platform: String,
    pub status: PostStatus,
    pub scheduled_for: Option<i64>,
    pub persona_id: Option<String>,
    pub created_at: i64,
    pub published_at: Option<i64>,
    pub remote_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub voice: String,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeSeed {
    pub id: String,
    pub persona_id: String,
    pub theme: String,
    pub prompt: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
    /// Due posts left queued because no remote route was available.
    pub deferred: usize,
}

/// Queued SMS draft plus the webhook an external sender should call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsFallback {
    pub post: Post,
    pub webhook_url: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the platform's id for the published post.
    async fn publish(&self, post: &Post) -> MeshResult<String>;
}

pub struct SimulatedPublisher {
    decision: Arc<dyn DecisionSource>,
}

impl SimulatedPublisher {
    pub fn new(decision: Arc<dyn DecisionSource>) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl Publisher for SimulatedPublisher {
    async fn publish(&self, post: &Post) -> MeshResult<String> {
        if self.decision.should_succeed(&format!("{}.publish", post.platform)) {
            Ok(format!("{}-{}", post.platform, &post.id[..8.min(post.id.len())]))
        } else {
            Err(MeshError::Remote(format!("{} rejected post {}", post.platform, post.id)))
        }
    }
}

struct PublishTransport<'a> {
    publisher: &'a dyn Publisher,
    post: &'a Post,
}

#[async_trait]
impl RouteTransport for PublishTransport<'_> {
    async fn dispatch(&self, _route: &RouteDef, _payload: &serde_json::Value) -> MeshResult<serde_json::Value> {
        let remote_id = self.publisher.publish(self.post).await?;
        Ok(json!({ "remote_id": remote_id }))
    }
}

pub struct MythFlow {
    router: Arc<ThresholdRouter>,
    store: Arc<OfflineStore>,
    circuit: Arc<CircuitAuditBridge>,
    publisher: Arc<dyn Publisher>,
    posts: Arc<dyn PostRepository>,
    personas: Arc<dyn PersonaRepository>,
    sms_webhook_base: String,
    resource_ttl_ms: i64,
}

impl MythFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<ThresholdRouter>,
        store: Arc<OfflineStore>,
        circuit: Arc<CircuitAuditBridge>,
        publisher: Arc<dyn Publisher>,
        posts: Arc<dyn PostRepository>,
        personas: Arc<dyn PersonaRepository>,
        sms_webhook_base: &str,
        resource_ttl_secs: u64,
    ) -> Self {
        Self {
            router,
            store,
            circuit,
            publisher,
            posts,
            personas,
            sms_webhook_base: sms_webhook_base.trim_end_matches('/').to_string(),
            resource_ttl_ms: (resource_ttl_secs as i64).saturating_mul(1000),
        }
    }

    pub fn create_post(&self, content: &str, platform: &str) -> MeshResult<Post> {
        if content.trim().is_empty() {
            return Err(MeshError::InvalidInput("post content is empty".to_string()));
        }
        let post = Post {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            platform: platform.to_string(),
            status: PostStatus::Draft,
            scheduled_for: None,
            persona_id: self.personas.active()?.map(|p| p.id),
            created_at: now_ms(),
            published_at: None,
            remote_id: None,
            error: None,
        };
        self.posts.save(post.clone())?;
        Ok(post)
    }

    pub fn get_post(&self, id: &str) -> MeshResult<Option<Post>> {
        self.posts.get(id)
    }

    /// Queues a draft (or re-queues a failed post) for `scheduled_for` (ms since epoch).
    pub fn schedule_post(&self, id: &str, scheduled_for: i64) -> MeshResult<Post> {
        let mut post = self
            .posts
            .get(id)?
            .ok_or_else(|| MeshError::NotFound(format!("post {}", id)))?;
        if post.status == PostStatus::Published {
            return Err(MeshError::InvalidInput(format!("post {} already published", id)));
        }
        post.status = PostStatus::Queued;
        post.scheduled_for = Some(scheduled_for);
        post.error = None;
        self.posts.save(post.clone())?;
        Ok(post)
    }

    /// Queued posts, earliest first.
    pub fn pending_queue(&self) -> MeshResult<Vec<Post>> {
        let mut queued: Vec<Post> = self
            .posts
            .all()?
            .into_iter()
            .filter(|p| p.status == PostStatus::Queued)
            .collect();
        queued.sort_by_key(|p| (p.scheduled_for.unwrap_or(i64::MIN), p.created_at));
        Ok(queued)
    }

    pub async fn publish_queue(&self) -> MeshResult<PublishReport> {
        let now = now_ms();
        let due: Vec<Post> = self
            .pending_queue()?
            .into_iter()
            .filter(|p| p.scheduled_for.map_or(true, |at| at <= now))
            .collect();

        let mut report = PublishReport::default();
        for mut post in due {
            let payload = serde_json::to_value(&post)?;
            let transport = PublishTransport {
                publisher: self.publisher.as_ref(),
                post: &post,
            };
            let outcome = self.router.route_request(Threshold::Myth, &payload, &transport).await?;

            let status = match outcome.response {
                Some(response) => {
                    post.status = PostStatus::Published;
                    post.published_at = Some(now_ms());
                    post.remote_id = response.get("remote_id").and_then(|v| v.as_str()).map(str::to_string);
                    self.store.cache_resource(&ResourceCacheEntry::pending(
                        format!("post:{}", post.id),
                        Threshold::Myth,
                        serde_json::to_value(&post)?,
                        Some(self.resource_ttl_ms),
                    ))?;
                    report.published += 1;
                    "completed"
                }
                None if !outcome.errors.is_empty() => {
                    warn!(post_id = %post.id, "[MYTH] publish failed on every remote route");
                    post.status = PostStatus::Failed;
                    post.error = Some(outcome.errors.join("; "));
                    report.failed += 1;
                    "failed"
                }
                None => {
                    report.deferred += 1;
                    "fallback"
                }
            };
            self.posts.save(post.clone())?;
            self.circuit.emit_circuit_event(create_flow_event(
                Threshold::Myth,
                "publish_post",
                status,
                json!({ "post_id": post.id, "platform": post.platform, "route": outcome.route_id }),
            ));
        }
        info!(
            published = report.published,
            failed = report.failed,
            deferred = report.deferred,
            "[MYTH] publish queue processed"
        );
        Ok(report)
    }

    /// New personas start inactive unless none is active yet.
    pub fn create_persona(&self, name: &str, voice: &str) -> MeshResult<Persona> {
        if name.trim().is_empty() {
            return Err(MeshError::InvalidInput("persona name is empty".to_string()));
        }
        let persona = Persona {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            voice: voice.to_string(),
            active: self.personas.active()?.is_none(),
            created_at: now_ms(),
        };
        self.personas.insert(persona.clone())?;
        Ok(persona)
    }

    pub fn rotate_persona(&self, id: &str) -> MeshResult<Persona> {
        let persona = self.personas.rotate(id)?;
        info!(persona = %persona.name, "[MYTH] persona rotated");
        Ok(persona)
    }

    pub fn active_persona(&self) -> MeshResult<Option<Persona>> {
        self.personas.active()
    }

    pub fn personas(&self) -> MeshResult<Vec<Persona>> {
        self.personas.all()
    }

    /// Local, deterministic seed from the active persona's voice.
    pub fn generate_narrative_seed(&self, theme: &str) -> MeshResult<NarrativeSeed> {
        let persona = self
            .personas
            .active()?
            .ok_or_else(|| MeshError::NotFound("active persona".to_string()))?;
        let seed = NarrativeSeed {
            id: Uuid::new_v4().to_string(),
            persona_id: persona.id.clone(),
            theme: theme.to_string(),
            prompt: format!("{} speaks in a {} voice about {}.", persona.name, persona.voice, theme),
            created_at: now_ms(),
        };
        self.store.cache_resource(&ResourceCacheEntry::pending(
            format!("seed:{}", seed.id),
            Threshold::Myth,
            serde_json::to_value(&seed)?,
            Some(self.resource_ttl_ms),
        ))?;
        Ok(seed)
    }

    /// Stores the message as an SMS draft; delivery belongs to whoever serves the webhook.
    pub fn send_sms_fallback(&self, message: &str) -> MeshResult<SmsFallback> {
        let post = self.create_post(message, SMS_PLATFORM)?;
        let webhook_url = format!("{}/sms/{}", self.sms_webhook_base, post.id);
        self.circuit.emit_circuit_event(create_flow_event(
            Threshold::Myth,
            "sms_fallback",
            "fallback",
            json!({ "post_id": post.id, "webhook_url": webhook_url }),
        ));
        Ok(SmsFallback { post, webhook_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{AlwaysSucceed, ScriptedDecision};
    use crate::flows::repository::{InMemoryPersonaRepository, InMemoryPostRepository};
    use crate::flows::testing::{harness, Harness};

    fn flow(h: &Harness, decision: Arc<dyn DecisionSource>) -> MythFlow {
        MythFlow::new(
            h.router.clone(),
            h.store.clone(),
            h.circuit.clone(),
            Arc::new(SimulatedPublisher::new(decision)),
            Arc::new(InMemoryPostRepository::default()),
            Arc::new(InMemoryPersonaRepository::default()),
            "http://hooks.local/",
            3600,
        )
    }

    #[tokio::test]
    async fn due_posts_publish_independently() {
        let h = harness();
        // post a: primary ok; post b: primary and secondary fail
        let flow = flow(&h, Arc::new(ScriptedDecision::new([true, false, false], true)));
        let a = flow.create_post("first", "x").unwrap();
        let b = flow.create_post("second", "x").unwrap();
        let later = flow.create_post("later", "x").unwrap();
        let now = now_ms();
        flow.schedule_post(&a.id, now - 2000).unwrap();
        flow.schedule_post(&b.id, now - 1000).unwrap();
        flow.schedule_post(&later.id, now + 3_600_000).unwrap();

        let report = flow.publish_queue().await.unwrap();
        assert_eq!(report, PublishReport { published: 1, failed: 1, deferred: 0 });
        assert_eq!(flow.get_post(&a.id).unwrap().unwrap().status, PostStatus::Published);
        assert_eq!(flow.get_post(&b.id).unwrap().unwrap().status, PostStatus::Failed);
        let pending = flow.pending_queue().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, later.id);
    }

    #[tokio::test]
    async fn offline_router_defers_posts() {
        let h = harness();
        let flow = flow(&h, Arc::new(AlwaysSucceed));
        let post = flow.create_post("hold", "x").unwrap();
        flow.schedule_post(&post.id, now_ms() - 1000).unwrap();
        h.router.set_offline(true);
        let report = flow.publish_queue().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(flow.pending_queue().unwrap().len(), 1);
    }

    #[test]
    fn rotation_keeps_one_active_persona() {
        let h = harness();
        let flow = flow(&h, Arc::new(AlwaysSucceed));
        let first = flow.create_persona("Oracle", "calm").unwrap();
        let second = flow.create_persona("Trickster", "playful").unwrap();
        let third = flow.create_persona("Scribe", "precise").unwrap();
        assert!(first.active && !second.active && !third.active);

        for id in [&third.id, &second.id, &second.id, &first.id, &third.id] {
            flow.rotate_persona(id).unwrap();
            let active: Vec<Persona> = flow.personas().unwrap().into_iter().filter(|p| p.active).collect();
            assert_eq!(active.len(), 1);
            assert_eq!(&active[0].id, id);
        }
        assert!(matches!(flow.rotate_persona("missing"), Err(MeshError::NotFound(_))));
        assert_eq!(flow.active_persona().unwrap().unwrap().id, third.id);

        let seed = flow.generate_narrative_seed("thresholds").unwrap();
        assert_eq!(seed.persona_id, third.id);
        assert!(seed.prompt.contains("precise"));
    }

    #[test]
    fn sms_fallback_returns_webhook() {
        let h = harness();
        let flow = flow(&h, Arc::new(AlwaysSucceed));
        let sms = flow.send_sms_fallback("we are offline").unwrap();
        assert_eq!(sms.post.status, PostStatus::Draft);
        assert_eq!(sms.webhook_url, format!("http://hooks.local/sms/{}", sms.post.id));
        assert!(flow.send_sms_fallback("  ").is_err());
    }
}
