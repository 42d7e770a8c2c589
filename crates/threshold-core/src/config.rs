//! Mesh configuration loaded from file and environment.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | storage_path | ./data/threshold_mesh | sled directory for nav logs, cache and gate state |
//! | audit_log_path | (unset) | optional JSONL file that receives every audit entry |
//! | sms_webhook_base | http://127.0.0.1:8010/hooks | base URL handed back by the SMS fallback |
//! | api_prefix | /api/ | GET paths under this prefix use stale-while-revalidate |
//! | static_paths | ["/", "/index.html", "/static/"] | GET paths served cache-first |
//! | gateway_port | 8010 | HTTP port for `threshold serve` |
//! | upstream_url | http://127.0.0.1:8080 | origin that intercepted `/fetch/*` requests are forwarded to |
//! | nav_velocity_window_secs | 300 | trailing window for route-switch velocity |
//! | resource_ttl_secs | 86400 | expiry for cached flow results |
//! | wealth.failover_policy | sticky | `sticky` or `probe` |
//! | wealth.remote_success_rate | 0.95 | success odds of the simulated remote processor |
//! | wealth.stripe_percent_fee | 0.029 | percentage fee charged by stripe |
//! | wealth.stripe_fixed_fee | 0.30 | fixed fee per stripe charge |
//! | cells.<cell_id> | (generated) | access token per gate cell; unset cells get a random token |
//!
//! Precedence: env `THRESHOLD_CONFIG` path > `config/threshold` > defaults, then any
//! `THRESHOLD__*` environment variable (nested keys use `__`, e.g.
//! `THRESHOLD__WEALTH__FAILOVER_POLICY=probe`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::MeshResult;

const DEFAULT_CONFIG_PATH: &str = "config/threshold";
const DEFAULT_STORAGE_PATH: &str = "./data/threshold_mesh";
const DEFAULT_SMS_WEBHOOK_BASE: &str = "http://127.0.0.1:8010/hooks";
const DEFAULT_API_PREFIX: &str = "/api/";
const DEFAULT_GATEWAY_PORT: u16 = 8010;
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_NAV_VELOCITY_WINDOW_SECS: u64 = 300;
const DEFAULT_RESOURCE_TTL_SECS: u64 = 86_400;

fn default_static_paths() -> Vec<String> {
    vec!["/".to_string(), "/index.html".to_string(), "/static/".to_string()]
}

/// How the wealth flow treats the active processor after a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverPolicy {
    /// One stripe failure switches the session to local-sim until a healthy probe or reset.
    #[default]
    Sticky,
    /// Every call tries stripe first, regardless of earlier failures.
    Probe,
}

/// Wealth domain settings (`[wealth]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WealthSettings {
    #[serde(default)]
    pub failover_policy: FailoverPolicy,
    #[serde(default = "default_remote_success_rate")]
    pub remote_success_rate: f64,
    #[serde(default = "default_stripe_percent_fee")]
    pub stripe_percent_fee: f64,
    #[serde(default = "default_stripe_fixed_fee")]
    pub stripe_fixed_fee: f64,
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_remote_success_rate() -> f64 {
    0.95
}

fn default_stripe_percent_fee() -> f64 {
    0.029
}

fn default_stripe_fixed_fee() -> f64 {
    0.30
}

impl Default for WealthSettings {
    fn default() -> Self {
        Self {
            failover_policy: FailoverPolicy::default(),
            remote_success_rate: default_remote_success_rate(),
            stripe_percent_fee: default_stripe_percent_fee(),
            stripe_fixed_fee: default_stripe_fixed_fee(),
        }
    }
}

/// Top-level mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub storage_path: String,
    #[serde(default)]
    pub audit_log_path: Option<String>,
    pub sms_webhook_base: String,
    pub api_prefix: String,
    #[serde(default = "default_static_paths")]
    pub static_paths: Vec<String>,
    pub gateway_port: u16,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    pub nav_velocity_window_secs: u64,
    pub resource_ttl_secs: u64,
    #[serde(default)]
    pub wealth: WealthSettings,
    /// Cell id → access token.
    #[serde(default)]
    pub cells: BTreeMap<String, String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            storage_path: DEFAULT_STORAGE_PATH.to_string(),
            audit_log_path: None,
            sms_webhook_base: DEFAULT_SMS_WEBHOOK_BASE.to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            static_paths: default_static_paths(),
            gateway_port: DEFAULT_GATEWAY_PORT,
            upstream_url: default_upstream_url(),
            nav_velocity_window_secs: DEFAULT_NAV_VELOCITY_WINDOW_SECS,
            resource_ttl_secs: DEFAULT_RESOURCE_TTL_SECS,
            wealth: WealthSettings::default(),
            cells: BTreeMap::new(),
        }
    }
}

impl MeshConfig {
    /// Load config from file and environment.
    pub fn load() -> MeshResult<Self> {
        let config_path =
            std::env::var("THRESHOLD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load config from an explicit file (if it exists) layered over defaults and env.
    pub fn load_from(path: &Path) -> MeshResult<Self> {
        let wealth = WealthSettings::default();
        let builder = config::Config::builder()
            .set_default("storage_path", DEFAULT_STORAGE_PATH)?
            .set_default("sms_webhook_base", DEFAULT_SMS_WEBHOOK_BASE)?
            .set_default("api_prefix", DEFAULT_API_PREFIX)?
            .set_default("static_paths", default_static_paths())?
            .set_default("gateway_port", DEFAULT_GATEWAY_PORT as i64)?
            .set_default("upstream_url", DEFAULT_UPSTREAM_URL)?
            .set_default("nav_velocity_window_secs", DEFAULT_NAV_VELOCITY_WINDOW_SECS as i64)?
            .set_default("resource_ttl_secs", DEFAULT_RESOURCE_TTL_SECS as i64)?
            .set_default("wealth.failover_policy", "sticky")?
            .set_default("wealth.remote_success_rate", wealth.remote_success_rate)?
            .set_default("wealth.stripe_percent_fee", wealth.stripe_percent_fee)?
            .set_default("wealth.stripe_fixed_fee", wealth.stripe_fixed_fee)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            // `config` also resolves extension-less names (config/threshold.toml).
            builder.add_source(config::File::with_name(&path.to_string_lossy()).required(false))
        };

        let built = builder
            .add_source(config::Environment::with_prefix("THRESHOLD").separator("__"))
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Config rooted at a specific storage directory (tests, `--data` overrides).
    pub fn with_storage_path(mut self, path: impl AsRef<Path>) -> Self {
        self.storage_path = path.as_ref().to_string_lossy().into_owned();
        self
    }

    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_loader_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = MeshConfig::load_from(&dir.path().join("absent")).unwrap();
        let defaults = MeshConfig::default();
        assert_eq!(loaded.storage_path, defaults.storage_path);
        assert_eq!(loaded.api_prefix, defaults.api_prefix);
        assert_eq!(loaded.static_paths, defaults.static_paths);
        assert_eq!(loaded.wealth.failover_policy, FailoverPolicy::Sticky);
        assert_eq!(loaded.nav_velocity_window_secs, 300);
        assert!(loaded.cells.is_empty());
    }

    #[test]
    fn file_overrides_wealth_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        std::fs::write(
            &path,
            "storage_path = \"/tmp/mesh\"\n[wealth]\nfailover_policy = \"probe\"\n[cells]\nrevenue = \"r-token\"\n",
        )
        .unwrap();
        let loaded = MeshConfig::load_from(&path).unwrap();
        assert_eq!(loaded.storage_path, "/tmp/mesh");
        assert_eq!(loaded.wealth.failover_policy, FailoverPolicy::Probe);
        assert!((loaded.wealth.stripe_percent_fee - 0.029).abs() < f64::EPSILON);
        assert_eq!(loaded.cells.get("revenue").map(String::as_str), Some("r-token"));
    }
}
