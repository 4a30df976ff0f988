//! Provider execution: one outbound call plus at most one fallback attempt.
//!
//! The executor owns the process-wide resilience state — circuit breakers,
//! per-user Anthropic cooldowns, and per-provider request counters — and
//! applies tier-appropriate thinking parameters before dispatch.
//!
//! Failure handling is table-driven: the error kind decides retryability
//! (5xx retries with exponential backoff inside the same attempt; rate
//! limits never retry) and fallback eligibility (the §4.G substitution
//! rules). A second failure surfaces as `fallback_failed`.

pub mod breaker;
pub mod cooldown;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    artifact::Artifact,
    auth::{AuthInfo, AuthType},
    config::Config,
    error::{ErrorKind, RouteError},
    features::Features,
    providers::{Credential, ProviderClient, ProviderKind},
    triage::Bucket,
};

use breaker::{Admission, BreakerTable};
use cooldown::CooldownTable;

/// Gemini thinking-budget bounds, tokens.
const THINKING_BUDGET_MIN: u64 = 128;
const THINKING_BUDGET_MAX: u64 = 32_768;
const THINKING_BUDGET_MID_DEFAULT: u64 = 6_000;
const THINKING_BUDGET_HARD_DEFAULT: u64 = 20_000;

/// Prompt size past which Gemini budgets saturate to the hard maximum.
const LONG_CONTEXT_TOKENS: u64 = 200_000;

/// The executor's input: where to send the request and with what shape.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub provider: ProviderKind,
    /// Full `provider/model` slug.
    pub slug: String,
    /// Bare model name sent on the wire.
    pub model: String,
    /// Provider-specific parameter bag (`reasoning_effort`,
    /// `thinking_budget`, pass-through provider prefs).
    pub params: Value,
    /// Ordered fallback slugs, consumed front-first by OpenRouter retries.
    pub fallbacks: Vec<String>,
}

impl RoutingDecision {
    /// Build a decision from a slug; fails only on an unknown provider prefix.
    pub fn from_slug(slug: &str) -> Option<Self> {
        let (provider, model) = ProviderKind::split_slug(slug)?;
        Some(Self {
            provider,
            slug: slug.to_string(),
            model: model.to_string(),
            params: json!({}),
            fallbacks: Vec::new(),
        })
    }
}

/// What one execution produced, success or not. The metric record is
/// assembled from this regardless of outcome.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Result<Value, RouteError>,
    pub provider: ProviderKind,
    pub model_slug: String,
    pub fallback_used: bool,
    pub anthropic_429: bool,
    pub execution_time_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_estimate: f64,
}

/// Owns breakers, cooldowns, and per-provider counters.
pub struct ProviderExecutor {
    config: Arc<Config>,
    pub breakers: Arc<BreakerTable>,
    pub cooldowns: Arc<CooldownTable>,
    pub requests_by_provider: DashMap<ProviderKind, u64>,
}

impl ProviderExecutor {
    pub fn new(config: Arc<Config>, cooldowns: Arc<CooldownTable>) -> Self {
        let breakers = Arc::new(BreakerTable::new(
            config.executor.breaker_threshold,
            Duration::from_secs(config.executor.breaker_reset_secs),
        ));
        Self {
            config,
            breakers,
            cooldowns,
            requests_by_provider: DashMap::new(),
        }
    }

    /// Execute a routing decision with cooldown gate, breaker gate, retry,
    /// and one fallback attempt.
    pub async fn execute(
        &self,
        decision: &RoutingDecision,
        body: &Value,
        features: &Features,
        bucket: Bucket,
        auth: Option<&AuthInfo>,
        artifact: &Artifact,
    ) -> ExecutionReport {
        let user_id = auth.and_then(|a| a.user_id.clone());

        // Local cooldown short-circuit: no upstream call happens.
        if decision.provider == ProviderKind::Anthropic {
            if let Some(user) = &user_id {
                if let Some(active) = self.cooldowns.check(user) {
                    let remaining = active.remaining_secs(chrono::Utc::now());
                    debug!(user = %user, remaining, "cooldown short-circuit");
                    return ExecutionReport {
                        outcome: Err(RouteError::new(
                            ErrorKind::RateLimitCooldown,
                            format!("user is cooling down for {remaining}s after an upstream rate limit"),
                        )
                        .with_status(429)
                        .with_retry_after(remaining)),
                        provider: decision.provider,
                        model_slug: decision.slug.clone(),
                        fallback_used: false,
                        anthropic_429: false,
                        execution_time_ms: 0,
                        prompt_tokens: 0,
                        completion_tokens: 0,
                        total_tokens: 0,
                        cost_estimate: 0.0,
                    };
                }
            }
        }

        let t0 = Instant::now();
        let primary = self
            .attempt(decision, body, features, bucket, auth)
            .await;

        match primary {
            Ok(response) => {
                self.finish(decision, response, false, false, t0, artifact)
            }
            Err(err) => {
                let mut anthropic_429 = false;
                if decision.provider == ProviderKind::Anthropic
                    && err.kind == ErrorKind::RateLimitUpstream
                {
                    anthropic_429 = true;
                    if let Some(user) = &user_id {
                        let applied =
                            self.cooldowns.apply(user, err.retry_after, "anthropic_429");
                        info!(user = %user, retry_after = applied.retry_after_seconds,
                              "cooldown applied after upstream 429");
                    }
                }

                if !err.kind.triggers_fallback() {
                    return self.finish_error(decision, err, false, anthropic_429, t0);
                }

                let Some(fallback) = self.pick_fallback(decision, &err, features, bucket) else {
                    return self.finish_error(decision, err, false, anthropic_429, t0);
                };
                info!(from = %decision.slug, to = %fallback.slug, kind = %err.kind,
                      "attempting fallback");

                match self.attempt(&fallback, body, features, bucket, auth).await {
                    Ok(response) => {
                        self.finish(&fallback, response, true, anthropic_429, t0, artifact)
                    }
                    Err(second) => {
                        let composite = RouteError::new(
                            ErrorKind::FallbackFailed,
                            format!(
                                "primary {} failed ({err}), fallback {} failed ({second})",
                                decision.slug, fallback.slug
                            ),
                        )
                        .with_status(502);
                        self.finish_error(&fallback, composite, true, anthropic_429, t0)
                    }
                }
            }
        }
    }

    /// One provider attempt: breaker gate, credential resolution, thinking
    /// parameters, and retry-with-backoff on retryable kinds.
    async fn attempt(
        &self,
        decision: &RoutingDecision,
        body: &Value,
        features: &Features,
        bucket: Bucket,
        auth: Option<&AuthInfo>,
    ) -> Result<Value, RouteError> {
        let provider = decision.provider;

        if self.breakers.admit("provider", provider.as_str()) == Admission::Rejected {
            return Err(RouteError::new(
                ErrorKind::CircuitOpen,
                format!("circuit open for {provider}"),
            ));
        }

        let credential = self.resolve_credential(provider, auth)?;
        let provider_cfg = self.config.provider(provider);
        let client = ProviderClient::new(provider, &provider_cfg, credential);

        let mut outbound = body.clone();
        prepare_body(&mut outbound, decision, features, bucket);

        *self.requests_by_provider.entry(provider).or_insert(0) += 1;

        let max_retries = self.config.executor.max_retries;
        let mut delay = Duration::from_millis(self.config.executor.retry_delay_ms);
        let mut attempt = 0u32;
        loop {
            match client.chat(&outbound).await {
                Ok(response) => {
                    self.breakers.record_success("provider", provider.as_str());
                    return Ok(response);
                }
                Err(err) => {
                    self.breakers.record_failure("provider", provider.as_str());
                    if err.kind.is_retryable() && attempt < max_retries {
                        attempt += 1;
                        warn!(%provider, attempt, error = %err, "retryable provider failure");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Resolve the outbound credential: a matching inbound credential wins,
    /// then the provider's configured environment key.
    fn resolve_credential(
        &self,
        provider: ProviderKind,
        auth: Option<&AuthInfo>,
    ) -> Result<Credential, RouteError> {
        if let Some(info) = auth.filter(|a| a.provider == provider) {
            return Ok(match info.auth_type {
                AuthType::Bearer => Credential::Bearer(info.token.clone()),
                AuthType::ApiKey => Credential::ApiKey(info.token.clone()),
            });
        }
        self.config
            .provider(provider)
            .api_key()
            .map(Credential::ApiKey)
            .ok_or_else(|| {
                RouteError::new(
                    ErrorKind::AuthMissing,
                    format!("no credential available for {provider}"),
                )
                .with_status(401)
            })
    }

    /// The fallback decision table.
    fn pick_fallback(
        &self,
        decision: &RoutingDecision,
        err: &RouteError,
        features: &Features,
        bucket: Bucket,
    ) -> Option<RoutingDecision> {
        match decision.provider {
            ProviderKind::Anthropic => Some(self.anthropic_substitute(features)),
            ProviderKind::OpenAI => {
                let mut d = RoutingDecision::from_slug("google/gemini-2.5-pro")?;
                if bucket == Bucket::Hard {
                    d.params = json!({ "thinking_budget": THINKING_BUDGET_HARD_DEFAULT });
                }
                Some(d)
            }
            ProviderKind::Google => {
                let mut d = RoutingDecision::from_slug("openai/gpt-5")?;
                d.params = json!({ "reasoning_effort": "high" });
                Some(d)
            }
            ProviderKind::OpenRouter => {
                let _ = err;
                let next = decision.fallbacks.first()?;
                let mut d = RoutingDecision::from_slug(next)?;
                d.fallbacks = decision.fallbacks[1..].to_vec();
                Some(d)
            }
        }
    }

    /// Non-Anthropic substitute after an Anthropic rate limit.
    fn anthropic_substitute(&self, features: &Features) -> RoutingDecision {
        if features.tokens > LONG_CONTEXT_TOKENS {
            let mut d = RoutingDecision::from_slug("google/gemini-2.5-pro")
                .expect("static slug parses");
            d.params = json!({ "thinking_budget": THINKING_BUDGET_MAX });
            return d;
        }
        if features.has_code || features.has_math {
            let mut d = RoutingDecision::from_slug("openai/gpt-5").expect("static slug parses");
            d.params = json!({ "reasoning_effort": "high" });
            return d;
        }
        // Cheapest configured OpenRouter candidate, or the stock one.
        let slug = self
            .config
            .buckets
            .cheap
            .candidates
            .iter()
            .find(|s| s.starts_with("openrouter/"))
            .cloned()
            .unwrap_or_else(|| "openrouter/deepseek/deepseek-chat".to_string());
        RoutingDecision::from_slug(&slug).expect("configured slug parses")
    }

    fn finish(
        &self,
        decision: &RoutingDecision,
        response: Value,
        fallback_used: bool,
        anthropic_429: bool,
        t0: Instant,
        artifact: &Artifact,
    ) -> ExecutionReport {
        let prompt_tokens = response["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let completion_tokens = response["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let total_tokens = response["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or(prompt_tokens + completion_tokens);

        // Normalized cost score scaled by volume; a per-token price book is
        // the catalog's concern, not the hot path's.
        let cost_estimate = artifact
            .chat
            .get(&decision.slug)
            .copied()
            .unwrap_or(0.5)
            * (total_tokens as f64 / 1_000.0)
            * 0.01;

        ExecutionReport {
            outcome: Ok(response),
            provider: decision.provider,
            model_slug: decision.slug.clone(),
            fallback_used,
            anthropic_429,
            execution_time_ms: t0.elapsed().as_millis() as u64,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_estimate,
        }
    }

    fn finish_error(
        &self,
        decision: &RoutingDecision,
        err: RouteError,
        fallback_used: bool,
        anthropic_429: bool,
        t0: Instant,
    ) -> ExecutionReport {
        ExecutionReport {
            outcome: Err(err),
            provider: decision.provider,
            model_slug: decision.slug.clone(),
            fallback_used,
            anthropic_429,
            execution_time_ms: t0.elapsed().as_millis() as u64,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost_estimate: 0.0,
        }
    }
}

/// Rewrite the outbound body for the decision: bare model name, decision
/// params, and tier-appropriate thinking parameters where absent.
fn prepare_body(body: &mut Value, decision: &RoutingDecision, features: &Features, bucket: Bucket) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".into(), Value::String(decision.model.clone()));
        obj.remove("stream");
        if let Some(params) = decision.params.as_object() {
            for (k, v) in params {
                obj.insert(k.clone(), v.clone());
            }
        }
    }
    apply_thinking_params(body, decision, features, bucket);
}

/// Inject `reasoning_effort` / `thinking_budget` when the decision has not
/// already pinned them.
fn apply_thinking_params(
    body: &mut Value,
    decision: &RoutingDecision,
    features: &Features,
    bucket: Bucket,
) {
    let Some(obj) = body.as_object_mut() else { return };

    match decision.provider {
        ProviderKind::OpenAI if decision.model.contains("gpt-5") => {
            obj.entry("reasoning_effort").or_insert_with(|| {
                Value::String(
                    match bucket {
                        Bucket::Cheap => "low",
                        Bucket::Mid => "medium",
                        Bucket::Hard => "high",
                    }
                    .to_string(),
                )
            });
        }
        ProviderKind::Google if decision.model.contains("gemini") => {
            if !obj.contains_key("thinking_budget") {
                let budget = if features.tokens > LONG_CONTEXT_TOKENS {
                    THINKING_BUDGET_MAX
                } else {
                    match bucket {
                        Bucket::Cheap => return,
                        Bucket::Mid => THINKING_BUDGET_MID_DEFAULT,
                        Bucket::Hard => THINKING_BUDGET_HARD_DEFAULT,
                    }
                };
                obj.insert("thinking_budget".into(), json!(clamp_budget(budget)));
            } else if let Some(budget) = obj["thinking_budget"].as_u64() {
                obj.insert("thinking_budget".into(), json!(clamp_budget(budget)));
            }
        }
        _ => {}
    }
}

fn clamp_budget(budget: u64) -> u64 {
    budget.clamp(THINKING_BUDGET_MIN, THINKING_BUDGET_MAX)
}
