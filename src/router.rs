//! The decision-and-dispatch pipeline.
//!
//! One request flows auth → features → triage → guardrail → selection →
//! execution → metric, against a single artifact snapshot taken at entry.
//! The canary traffic splitter sits at the snapshot step: a seeded fraction
//! of requests is served by the staged candidate bundle and tagged so the
//! canary controller can judge it.
//!
//! [`GatewayState`] is the shared application state injected into every
//! handler. Construction wires the one cross-component ownership subtlety:
//! the Anthropic auth adapter and the executor share a single cooldown
//! table, so a 429 recorded during execution short-circuits the same user's
//! next request.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    artifact::{ArtifactBundle, ArtifactStore},
    auth::{AuthInfo, AuthRegistry},
    config::Config,
    control::{canary::CanaryController, recommend::RecommendationEngine},
    error::RouteError,
    executor::{cooldown::CooldownTable, ProviderExecutor, RoutingDecision},
    features::FeatureExtractor,
    guardrail::{ContextGuardrail, GuardrailLimits},
    metrics::{MetricRecord, MetricsEngine},
    selector,
    triage::{self, Bucket},
};

/// Staged canary artifact shared between the tuning pipeline (writer), the
/// canary loop (promoter/clearer), and the request path (reader).
pub type CanarySlot = Arc<RwLock<Option<Arc<ArtifactBundle>>>>;

/// Shared application state injected via [`axum::extract::State`].
pub struct GatewayState {
    pub config: Arc<Config>,
    pub artifacts: Arc<ArtifactStore>,
    pub registry: AuthRegistry,
    pub extractor: FeatureExtractor,
    pub guardrail: ContextGuardrail,
    pub executor: ProviderExecutor,
    pub metrics: Arc<MetricsEngine>,
    pub canary: Arc<CanaryController>,
    pub canary_slot: CanarySlot,
    pub recommender: Arc<RecommendationEngine>,
    /// Present only when `GOOGLE_CLIENT_ID` is configured.
    pub oauth: Option<Arc<crate::oauth::GoogleOAuth>>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>) -> Self {
        let cooldowns = Arc::new(CooldownTable::new());
        let candidates = crate::control::all_candidates(&config);
        let artifacts = Arc::new(ArtifactStore::new(&config.artifact, candidates));
        let metrics = Arc::new(MetricsEngine::new(
            &config.metrics,
            config.slo.clone(),
            Arc::clone(&cooldowns),
        ));
        let canary = Arc::new(CanaryController::new(
            crate::control::canary::CanaryGates {
                min_samples_per_stage: config.control.canary_min_samples,
                min_stage_minutes: config.control.canary_min_stage_minutes,
            },
        ));
        let recommender = Arc::new(RecommendationEngine::new(Arc::clone(&metrics)));

        Self {
            registry: AuthRegistry::standard(Arc::clone(&cooldowns)),
            extractor: FeatureExtractor::new(None),
            guardrail: ContextGuardrail::new(GuardrailLimits::default()),
            executor: ProviderExecutor::new(Arc::clone(&config), cooldowns),
            artifacts,
            metrics,
            canary,
            canary_slot: Arc::new(RwLock::new(None)),
            recommender,
            oauth: crate::oauth::GoogleOAuth::from_env().map(Arc::new),
            started_at: Instant::now(),
            config,
        }
    }

    /// Pick the artifact snapshot for this request: the canary candidate for
    /// the rollout's traffic fraction, the published artifact otherwise.
    async fn snapshot_for(&self, seed: u64) -> (Arc<ArtifactBundle>, bool) {
        let fraction = self.canary.traffic_fraction();
        if fraction > 0.0 {
            let staged = self
                .canary_slot
                .read()
                .expect("canary slot poisoned")
                .clone();
            if let Some(bundle) = staged {
                if (seed % 10_000) as f64 / 10_000.0 < fraction {
                    return (bundle, true);
                }
            }
        }
        match self.artifacts.current() {
            Some(bundle) => (bundle, false),
            None => (self.artifacts.load(false).await, false),
        }
    }
}

/// What a successful route produced, for the boundary layer.
#[derive(Debug)]
pub struct RoutedResponse {
    pub body: Value,
    pub bucket: Bucket,
    pub model_slug: String,
    pub fallback_used: bool,
    /// Set while the gateway is serving the emergency artifact.
    pub degraded: bool,
}

/// Route one chat-completion request end to end.
#[tracing::instrument(skip(state, headers, body), fields(bucket = tracing::field::Empty, model = tracing::field::Empty))]
pub async fn route(
    state: &GatewayState,
    headers: &HeaderMap,
    body: Value,
    request_id: &str,
) -> Result<RoutedResponse, RouteError> {
    let seed = seed_from(request_id);
    let auth = state.registry.find_match(headers).map(|(_, info)| info);
    let (bundle, canary) = state.snapshot_for(seed).await;
    let artifact = &bundle.artifact;

    // Features from the ordered message sequence.
    let messages = parse_messages(&body);
    let features = state.extractor.extract(&messages, &bundle.index).await;

    // Triage probabilities → bucket, then the capacity guardrail.
    let probs = triage::predict(&bundle.triage, &features, artifact);
    let triaged = probs.pick(artifact.thresholds.cheap, artifact.thresholds.hard);
    let hard_candidates = state.config.candidates(Bucket::Hard);
    let adjustment = state.guardrail.adjust(triaged, &features, hard_candidates);
    let bucket = adjustment.bucket;
    if adjustment.escalated {
        debug!(from = %triaged, to = %bucket, reason = ?adjustment.reason, "guardrail escalated");
    }

    // α-score selection inside the bucket.
    let candidates = state.config.candidates(bucket);
    let latency_variance = state.metrics.latency_variance_by_model();
    let selection = selector::select(
        candidates,
        &features,
        artifact,
        &state.config.selector,
        &latency_variance,
        seed,
    )
    .ok_or_else(|| {
        RouteError::new(
            crate::error::ErrorKind::InvalidArtifact,
            format!("bucket {bucket} has no candidates configured"),
        )
    })?;

    // Emergency escalation pins the widest-window model; otherwise the
    // α-score winner stands.
    let slug = adjustment
        .recommended_model
        .clone()
        .unwrap_or(selection.model);
    tracing::Span::current().record("bucket", bucket.as_str());
    tracing::Span::current().record("model", slug.as_str());

    let mut decision = RoutingDecision::from_slug(&slug).ok_or_else(|| {
        RouteError::new(
            crate::error::ErrorKind::InvalidArtifact,
            format!("candidate `{slug}` has no known provider prefix"),
        )
    })?;
    decision.fallbacks = candidates
        .iter()
        .filter(|c| **c != slug)
        .cloned()
        .collect();

    let report = state
        .executor
        .execute(&decision, &body, &features, bucket, auth.as_ref(), artifact)
        .await;

    // Metric emission happens strictly after execution, success or not.
    let record = MetricRecord {
        timestamp: Utc::now(),
        request_id: request_id.to_string(),
        bucket,
        provider: report.provider,
        model: report.model_slug.clone(),
        success: report.outcome.is_ok(),
        execution_time_ms: report.execution_time_ms,
        cost_estimate: report.cost_estimate,
        prompt_tokens: report.prompt_tokens,
        completion_tokens: report.completion_tokens,
        total_tokens: report.total_tokens,
        fallback_used: report.fallback_used,
        canary,
        error_kind: report
            .outcome
            .as_ref()
            .err()
            .map(|e| e.kind.as_str().to_string()),
        user_id: auth.as_ref().and_then(|a: &AuthInfo| a.user_id.clone()),
        anthropic_429: report.anthropic_429,
        win_rate_vs_baseline: win_rate_from(headers),
    };
    state.metrics.record(record);

    let response = report.outcome?;
    info!(model = %report.model_slug, fallback = report.fallback_used, "request routed");
    Ok(RoutedResponse {
        body: response,
        bucket,
        model_slug: report.model_slug,
        fallback_used: report.fallback_used,
        degraded: state
            .artifacts
            .degraded
            .load(std::sync::atomic::Ordering::Relaxed),
    })
}

/// Ordered `(role, content)` pairs from the request body. Non-string content
/// parts are skipped rather than rejected.
fn parse_messages(body: &Value) -> Vec<(String, String)> {
    body["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .map(|m| {
                    (
                        m["role"].as_str().unwrap_or("user").to_string(),
                        m["content"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Stable per-request seed for exploration and the canary splitter.
fn seed_from(request_id: &str) -> u64 {
    let digest = Sha256::digest(request_id.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// External evaluator's win-rate input; defaults to 1.0 when absent.
fn win_rate_from(headers: &HeaderMap) -> f64 {
    headers
        .get("x-win-rate")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
        .unwrap_or(1.0)
}
