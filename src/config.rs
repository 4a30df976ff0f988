//! Configuration types for triage-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Routing *policy* (alpha,
//! thresholds, quality/cost tables) lives in the artifact, not here — config
//! holds deployment shape: ports, provider endpoints, candidate lists,
//! control-plane cadence, and SLO overrides.
//!
//! # Example
//! ```toml
//! [gateway]
//! port = 8080
//!
//! [artifact]
//! url = "file://./artifact.json"
//!
//! [buckets.cheap]
//! candidates = ["openai/gpt-5-mini", "google/gemini-2.5-flash"]
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub artifact: ArtifactConfig,

    /// Per-provider endpoint overrides. Absent providers use the documented
    /// production endpoints.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Ordered candidate model slugs per bucket. Slugs are
    /// `provider/model`, e.g. `anthropic/claude-sonnet-4`.
    #[serde(default)]
    pub buckets: BucketsConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub slo: SloConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub control: ControlConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Every candidate slug must carry a known provider prefix
        for (bucket, list) in [
            ("cheap", &self.buckets.cheap),
            ("mid", &self.buckets.mid),
            ("hard", &self.buckets.hard),
        ] {
            anyhow::ensure!(
                !list.candidates.is_empty(),
                "bucket `{bucket}` has no candidates"
            );
            for slug in &list.candidates {
                anyhow::ensure!(
                    ProviderKind::split_slug(slug).is_some(),
                    "bucket `{bucket}` candidate `{slug}` has no known provider prefix"
                );
            }
        }

        // Provider override keys must name a known provider
        for key in self.providers.keys() {
            anyhow::ensure!(
                key.parse::<ProviderKind>().is_ok(),
                "[providers.{key}] is not a known provider \
                 (expected openai, google, anthropic, or openrouter)"
            );
        }

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.selector.epsilon),
            "selector.epsilon must be in [0, 1], got {}",
            self.selector.epsilon
        );
        anyhow::ensure!(
            self.selector.exploration_top_n >= 1,
            "selector.exploration_top_n must be at least 1"
        );
        anyhow::ensure!(
            self.executor.breaker_threshold >= 1,
            "executor.breaker_threshold must be at least 1"
        );
        anyhow::ensure!(
            self.metrics.buffer_capacity > 0,
            "metrics.buffer_capacity must be positive"
        );

        // Control-plane cron expressions must parse up front
        for (name, expr) in [
            ("control.catalog_cron", &self.control.catalog_cron),
            ("control.tuning_cron", &self.control.tuning_cron),
        ] {
            expr.parse::<cron::Schedule>()
                .with_context(|| format!("{name} is not a valid cron expression: `{expr}`"))?;
        }

        Ok(())
    }

    /// Candidate list for a bucket, in configured order.
    pub fn candidates(&self, bucket: crate::triage::Bucket) -> &[String] {
        match bucket {
            crate::triage::Bucket::Cheap => &self.buckets.cheap.candidates,
            crate::triage::Bucket::Mid => &self.buckets.mid.candidates,
            crate::triage::Bucket::Hard => &self.buckets.hard.candidates,
        }
    }

    /// Effective provider settings, merging overrides over documented defaults.
    pub fn provider(&self, kind: ProviderKind) -> ProviderConfig {
        self.providers
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| ProviderConfig::default_for(kind))
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize via serde defaults")
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client-facing API (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Port for the read-only dashboard (default: 8081, localhost).
    #[serde(default = "defaults::dashboard_port")]
    pub dashboard_port: u16,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            dashboard_port: defaults::dashboard_port(),
            log_level: None,
        }
    }
}

/// Where the routing artifact comes from and how it is cached.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactConfig {
    /// Artifact source URL: `file://…`, `http(s)://…`, or `s3://bucket/key`.
    /// The `ARTIFACT_STORE_URL` env var overrides this.
    #[serde(default = "defaults::artifact_url")]
    pub url: String,

    /// Directory for the on-disk known-good copy.
    #[serde(default = "defaults::artifact_cache_dir")]
    pub cache_dir: String,

    /// Hot-reload interval in seconds.
    #[serde(default = "defaults::artifact_reload_secs")]
    pub reload_secs: u64,

    /// In-memory copy is served without refetching while younger than this.
    #[serde(default = "defaults::artifact_freshness_secs")]
    pub freshness_secs: u64,

    /// Remote fetch timeout in milliseconds.
    #[serde(default = "defaults::artifact_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        toml::from_str("").expect("artifact defaults")
    }
}

/// A provider endpoint binding.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Base URL without a trailing slash.
    pub base_url: String,

    /// Environment variable name whose value is the API key. The inbound
    /// credential, when one matches, takes precedence over this.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in milliseconds (default: 30 000).
    #[serde(default = "defaults::provider_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProviderConfig {
    /// Documented production endpoint for a provider.
    pub fn default_for(kind: ProviderKind) -> Self {
        let (base_url, api_key_env) = match kind {
            ProviderKind::OpenAI => ("https://api.openai.com", Some("OPENAI_API_KEY")),
            ProviderKind::Google => (
                "https://generativelanguage.googleapis.com",
                Some("GEMINI_API_KEY"),
            ),
            ProviderKind::Anthropic => ("https://api.anthropic.com", Some("ANTHROPIC_API_KEY")),
            ProviderKind::OpenRouter => ("https://openrouter.ai/api", Some("OPENROUTER_API_KEY")),
        };
        Self {
            base_url: base_url.to_string(),
            api_key_env: api_key_env.map(str::to_string),
            timeout_ms: defaults::provider_timeout_ms(),
        }
    }

    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Ordered candidates for one bucket.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BucketCandidates {
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// Candidate lists for all three buckets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketsConfig {
    #[serde(default = "defaults::cheap_candidates")]
    pub cheap: BucketCandidates,
    #[serde(default = "defaults::mid_candidates")]
    pub mid: BucketCandidates,
    #[serde(default = "defaults::hard_candidates")]
    pub hard: BucketCandidates,
}

impl Default for BucketsConfig {
    fn default() -> Self {
        Self {
            cheap: defaults::cheap_candidates(),
            mid: defaults::mid_candidates(),
            hard: defaults::hard_candidates(),
        }
    }
}

/// In-bucket selection knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorConfig {
    /// Probability of exploring among the top scorers instead of picking
    /// greedily. 0 disables exploration entirely.
    #[serde(default)]
    pub epsilon: f64,

    /// Pool size for exploration picks.
    #[serde(default = "defaults::exploration_top_n")]
    pub exploration_top_n: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.0,
            exploration_top_n: defaults::exploration_top_n(),
        }
    }
}

/// Executor resilience knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Consecutive failures before a breaker opens.
    #[serde(default = "defaults::breaker_threshold")]
    pub breaker_threshold: u32,

    /// Seconds an open breaker waits before allowing a half-open probe.
    #[serde(default = "defaults::breaker_reset_secs")]
    pub breaker_reset_secs: u64,

    /// Additional attempts after the first failure of a retryable error.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Initial retry delay in milliseconds. Doubles per attempt.
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        toml::from_str("").expect("executor defaults")
    }
}

/// SLO thresholds evaluated over a metrics window.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SloConfig {
    #[serde(default = "defaults::slo_p95_latency_ms")]
    pub p95_latency_ms: f64,
    #[serde(default = "defaults::slo_failover_misfire_rate")]
    pub failover_misfire_rate: f64,
    #[serde(default = "defaults::slo_uptime")]
    pub uptime: f64,
    #[serde(default = "defaults::slo_mean_cost_per_task")]
    pub mean_cost_per_task: f64,
    #[serde(default = "defaults::slo_win_rate")]
    pub win_rate: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        toml::from_str("").expect("slo defaults")
    }
}

/// Metrics buffering and warehouse emission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Ring-buffer capacity. Oldest records are dropped on overflow.
    #[serde(default = "defaults::metrics_capacity")]
    pub buffer_capacity: usize,

    /// Warehouse endpoint for per-record POSTs. The `METRICS_WAREHOUSE_URL`
    /// env var overrides this. Unset disables emission.
    #[serde(default)]
    pub warehouse_url: Option<String>,

    /// JSON-lines log file appended per record. The `POSTHOOK_LOGS_PATH`
    /// env var overrides this. Unset disables the log.
    #[serde(default)]
    pub logs_path: Option<String>,

    /// Bounded warehouse emission queue; oldest pending emission dropped on
    /// overflow.
    #[serde(default = "defaults::emit_queue_capacity")]
    pub emit_queue_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        toml::from_str("").expect("metrics defaults")
    }
}

/// Control-plane cadence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Nightly full catalog refresh (cron, UTC). Default 02:00.
    #[serde(default = "defaults::catalog_cron")]
    pub catalog_cron: String,

    /// Drift-check interval in seconds. Default 6 h.
    #[serde(default = "defaults::drift_check_secs")]
    pub drift_check_secs: u64,

    /// Catalog service base URL. The `CATALOG_SERVICE_URL` env var overrides.
    #[serde(default)]
    pub catalog_url: Option<String>,

    /// Catalog fetch timeout in milliseconds.
    #[serde(default = "defaults::catalog_timeout_ms")]
    pub catalog_timeout_ms: u64,

    /// Weekly tuning run (cron, UTC). Default Sunday 03:00.
    #[serde(default = "defaults::tuning_cron")]
    pub tuning_cron: String,

    /// Minimum metric records before a tuning run is attempted.
    #[serde(default = "defaults::tuning_min_samples")]
    pub tuning_min_samples: usize,

    /// External trainer command; stdout must be an artifact candidate.
    /// Unset disables tuning runs.
    #[serde(default)]
    pub trainer_cmd: Option<String>,

    /// Canary evaluation interval in seconds. Default 5 min.
    #[serde(default = "defaults::canary_eval_secs")]
    pub canary_eval_secs: u64,

    /// Minimum samples per canary stage.
    #[serde(default = "defaults::canary_min_samples")]
    pub canary_min_samples: usize,

    /// Minimum minutes a canary stage must run.
    #[serde(default = "defaults::canary_min_stage_minutes")]
    pub canary_min_stage_minutes: i64,

    /// Recommendation sweep interval in seconds. Default 6 h.
    #[serde(default = "defaults::recommend_secs")]
    pub recommend_secs: u64,

    /// Alert webhook. The `ALERT_WEBHOOK_URL` env var overrides.
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        toml::from_str("").expect("control defaults")
    }
}

mod defaults {
    use super::BucketCandidates;

    pub fn port() -> u16 { 8080 }
    pub fn dashboard_port() -> u16 { 8081 }
    pub fn artifact_url() -> String { "file://./artifact.json".into() }
    pub fn artifact_cache_dir() -> String { "./.cache/artifacts".into() }
    pub fn artifact_reload_secs() -> u64 { 300 }
    pub fn artifact_freshness_secs() -> u64 { 600 }
    pub fn artifact_timeout_ms() -> u64 { 10_000 }
    pub fn provider_timeout_ms() -> u64 { 30_000 }
    pub fn exploration_top_n() -> usize { 3 }
    pub fn breaker_threshold() -> u32 { 5 }
    pub fn breaker_reset_secs() -> u64 { 60 }
    pub fn max_retries() -> u32 { 2 }
    pub fn retry_delay_ms() -> u64 { 100 }
    pub fn slo_p95_latency_ms() -> f64 { 2_500.0 }
    pub fn slo_failover_misfire_rate() -> f64 { 0.05 }
    pub fn slo_uptime() -> f64 { 0.995 }
    pub fn slo_mean_cost_per_task() -> f64 { 0.10 }
    pub fn slo_win_rate() -> f64 { 0.85 }
    pub fn metrics_capacity() -> usize { 50_000 }
    pub fn emit_queue_capacity() -> usize { 256 }
    pub fn catalog_cron() -> String { "0 0 2 * * *".into() }
    pub fn drift_check_secs() -> u64 { 6 * 3600 }
    pub fn catalog_timeout_ms() -> u64 { 10_000 }
    pub fn tuning_cron() -> String { "0 0 3 * * Sun".into() }
    pub fn tuning_min_samples() -> usize { 1_000 }
    pub fn canary_eval_secs() -> u64 { 300 }
    pub fn canary_min_samples() -> usize { 100 }
    pub fn canary_min_stage_minutes() -> i64 { 15 }
    pub fn recommend_secs() -> u64 { 6 * 3600 }

    fn bucket(slugs: &[&str]) -> BucketCandidates {
        BucketCandidates {
            candidates: slugs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn cheap_candidates() -> BucketCandidates {
        bucket(&[
            "openai/gpt-5-mini",
            "google/gemini-2.5-flash",
            "openrouter/deepseek/deepseek-chat",
        ])
    }

    pub fn mid_candidates() -> BucketCandidates {
        bucket(&[
            "anthropic/claude-sonnet-4",
            "openai/gpt-5",
            "google/gemini-2.5-pro",
        ])
    }

    pub fn hard_candidates() -> BucketCandidates {
        bucket(&[
            "anthropic/claude-opus-4",
            "openai/gpt-5",
            "google/gemini-2.5-pro",
        ])
    }
}
