//! Read-only dashboard surface (localhost by default).
//!
//! Everything here is derived from snapshots — the metrics window, breaker
//! table, cooldown table, canary state — and none of it touches the request
//! hot path. The one mutating route is the admin cooldown clear.
//!
//! `/metrics` renders JSON by default and Prometheus text exposition with
//! `?format=prometheus`. Because aggregates come from a sliding window,
//! every metric is emitted as a gauge; labelled families use the stable
//! label names `{bucket, provider}`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde_json::json;

use crate::router::GatewayState;

/// Build the dashboard router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/slo-status", get(slo_status))
        .route("/deployment-readiness", get(deployment_readiness))
        .route("/provider-health", get(provider_health))
        .route("/cost-analysis", get(cost_analysis))
        .route("/alerts", get(alerts))
        .route("/canary", get(canary))
        .route("/recommendations", get(recommendations))
        .route("/cooldowns", get(cooldowns))
        .route("/cooldowns/{user_id}", delete(clear_cooldown))
        .with_state(state)
}

/// `?window=<ms>` query parameter, when present.
fn window_from(params: &HashMap<String, String>) -> Option<Duration> {
    params
        .get("window")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// `GET /health` — liveness plus the degraded-mode flag.
async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    use std::sync::atomic::Ordering;
    let degraded = state.artifacts.degraded.load(Ordering::Relaxed);
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "degraded": degraded,
        "artifact_version": state.artifacts.current().map(|b| b.artifact.version.clone()),
        "artifact_backups": state.artifacts.backups(),
        "feature_fallbacks": state.extractor.fallback_count.load(Ordering::Relaxed),
        "emergency_escalations": state.guardrail.emergency_escalations.load(Ordering::Relaxed),
    }))
}

/// `GET /metrics?window=<ms>&format=json|prometheus`.
async fn metrics(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot(window_from(&params));
    if params.get("format").map(String::as_str) == Some("prometheus") {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            render_prometheus(&snapshot),
        )
            .into_response()
    } else {
        Json(snapshot).into_response()
    }
}

/// `GET /slo-status?window=<ms>`.
async fn slo_status(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    Json(state.metrics.check_slo(window_from(&params)))
}

/// `GET /deployment-readiness`.
async fn deployment_readiness(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let degraded = state
        .artifacts
        .degraded
        .load(std::sync::atomic::Ordering::Relaxed);
    Json(state.metrics.deployment_readiness(degraded))
}

/// `GET /provider-health?window=<ms>`.
async fn provider_health(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot(window_from(&params));
    let requests_total: std::collections::HashMap<String, u64> = state
        .executor
        .requests_by_provider
        .iter()
        .map(|e| (e.key().as_str().to_string(), *e.value()))
        .collect();
    Json(json!({
        "window_secs": snapshot.window_secs,
        "providers": snapshot.providers,
        "requests_total": requests_total,
    }))
}

/// `GET /cost-analysis?window=<ms>`.
async fn cost_analysis(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot(window_from(&params));
    Json(json!({
        "window_secs": snapshot.window_secs,
        "overall": snapshot.cost_overall,
        "by_bucket": snapshot.cost_by_bucket,
        "route_share": snapshot.route_share,
    }))
}

/// `GET /alerts` — currently firing conditions.
async fn alerts(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let mut firing: Vec<serde_json::Value> = Vec::new();

    for v in state.metrics.check_slo(None).violations {
        firing.push(json!({
            "rule": format!("slo:{}", v.name),
            "threshold": v.threshold,
            "observed": v.observed,
        }));
    }
    for (component, operation, breaker_state) in state.executor.breakers.tripped() {
        firing.push(json!({
            "rule": "circuit_breaker",
            "component": component,
            "operation": operation,
            "state": breaker_state,
        }));
    }
    if let Some(rollout) = state.canary.snapshot() {
        use crate::control::canary::RolloutStatus;
        if matches!(rollout.status, RolloutStatus::RolledBack | RolloutStatus::Failed) {
            firing.push(json!({
                "rule": "canary",
                "rollout": rollout.id,
                "status": rollout.status,
            }));
        }
    }
    let dropped = state
        .metrics
        .dropped_emissions
        .load(std::sync::atomic::Ordering::Relaxed);
    if dropped > 0 {
        firing.push(json!({ "rule": "dropped_emissions", "count": dropped }));
    }

    Json(json!({ "firing": firing }))
}

/// `GET /canary` — current rollout, if any.
async fn canary(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "rollout": state.canary.snapshot(),
        "traffic_fraction": state.canary.traffic_fraction(),
    }))
}

/// `GET /recommendations` — pending advisory recommendations.
async fn recommendations(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "pending": state.recommender.snapshot() }))
}

/// `GET /cooldowns` — active per-user cooldowns.
async fn cooldowns(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "active": state.executor.cooldowns.active() }))
}

/// `DELETE /cooldowns/{user_id}` — admin clear.
async fn clear_cooldown(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    if state.executor.cooldowns.clear(&user_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Prometheus text exposition for the windowed snapshot.
fn render_prometheus(snapshot: &crate::metrics::DashboardMetrics) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str("# HELP tgw_requests Requests observed in the window.\n");
    out.push_str("# TYPE tgw_requests gauge\n");
    out.push_str(&format!("tgw_requests {}\n\n", snapshot.total_requests));

    out.push_str("# HELP tgw_route_share Fraction of requests routed to each bucket.\n");
    out.push_str("# TYPE tgw_route_share gauge\n");
    let mut buckets: Vec<_> = snapshot.route_share.iter().collect();
    buckets.sort_by(|a, b| a.0.cmp(b.0));
    for (bucket, share) in buckets {
        out.push_str(&format!("tgw_route_share{{bucket=\"{bucket}\"}} {share}\n"));
    }
    out.push('\n');

    out.push_str("# HELP tgw_latency_ms Latency aggregates over the window.\n");
    out.push_str("# TYPE tgw_latency_ms gauge\n");
    out.push_str(&format!(
        "tgw_latency_ms{{stat=\"avg\"}} {}\n",
        snapshot.avg_latency_ms
    ));
    out.push_str(&format!(
        "tgw_latency_ms{{stat=\"p95\"}} {}\n",
        snapshot.p95_latency_ms
    ));
    out.push_str(&format!(
        "tgw_latency_ms{{stat=\"p99\"}} {}\n\n",
        snapshot.p99_latency_ms
    ));

    out.push_str("# HELP tgw_cost_mean Mean cost estimate per bucket.\n");
    out.push_str("# TYPE tgw_cost_mean gauge\n");
    let mut costs: Vec<_> = snapshot.cost_by_bucket.iter().collect();
    costs.sort_by(|a, b| a.0.cmp(b.0));
    for (bucket, stats) in costs {
        out.push_str(&format!("tgw_cost_mean{{bucket=\"{bucket}\"}} {}\n", stats.mean));
    }
    out.push('\n');

    out.push_str("# HELP tgw_win_rate Mean win rate vs baseline.\n");
    out.push_str("# TYPE tgw_win_rate gauge\n");
    out.push_str(&format!("tgw_win_rate {}\n\n", snapshot.win_rate_overall));

    out.push_str("# HELP tgw_anthropic_429_rate Share of Anthropic calls rate-limited.\n");
    out.push_str("# TYPE tgw_anthropic_429_rate gauge\n");
    out.push_str(&format!("tgw_anthropic_429_rate {}\n\n", snapshot.anthropic_429_rate));

    out.push_str("# HELP tgw_cooldown_users Users currently in cooldown.\n");
    out.push_str("# TYPE tgw_cooldown_users gauge\n");
    out.push_str(&format!("tgw_cooldown_users {}\n\n", snapshot.cooldown_users));

    out.push_str("# HELP tgw_provider_availability Success rate per provider.\n");
    out.push_str("# TYPE tgw_provider_availability gauge\n");
    out.push_str("# HELP tgw_provider_latency_ms Average latency per provider.\n");
    out.push_str("# TYPE tgw_provider_latency_ms gauge\n");
    let mut providers: Vec<_> = snapshot.providers.iter().collect();
    providers.sort_by(|a, b| a.0.cmp(b.0));
    for (provider, health) in providers {
        out.push_str(&format!(
            "tgw_provider_availability{{provider=\"{provider}\"}} {}\n",
            health.availability
        ));
        out.push_str(&format!(
            "tgw_provider_latency_ms{{provider=\"{provider}\"}} {}\n",
            health.avg_latency_ms
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::test_record;
    use crate::providers::ProviderKind;
    use crate::triage::Bucket;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<GatewayState> {
        let mut config = Config::default();
        config.artifact.url = "http://127.0.0.1:9/unreachable.json".into();
        config.artifact.cache_dir = tempfile::tempdir()
            .unwrap()
            .keep()
            .to_string_lossy()
            .into_owned();
        config.artifact.timeout_ms = 200;
        Arc::new(GatewayState::new(Arc::new(config)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_uptime_and_version() {
        let state = test_state();
        let (status, body) = get_json(router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn metrics_json_contains_window_aggregates() {
        let state = test_state();
        state
            .metrics
            .record(test_record(Bucket::Mid, ProviderKind::Anthropic, true));

        let (status, body) = get_json(router(Arc::clone(&state)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_requests"], 1);
        assert!(body["route_share"]["mid"].as_f64().unwrap() > 0.99);
    }

    #[tokio::test]
    async fn metrics_prometheus_renders_help_and_type_headers() {
        let state = test_state();
        state
            .metrics
            .record(test_record(Bucket::Cheap, ProviderKind::OpenAI, true));

        let resp = router(state)
            .oneshot(
                Request::get("/metrics?format=prometheus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("# HELP tgw_requests"));
        assert!(text.contains("# TYPE tgw_route_share gauge"));
        assert!(text.contains("tgw_route_share{bucket=\"cheap\"} 1"));
        assert!(text.contains("tgw_provider_availability{provider=\"openai\"}"));
    }

    #[tokio::test]
    async fn slo_status_is_compliant_on_empty_window() {
        let (status, body) = get_json(router(test_state()), "/slo-status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["compliant"], true);
    }

    #[tokio::test]
    async fn deployment_readiness_blocks_on_degraded_artifact() {
        let state = test_state();
        state
            .artifacts
            .degraded
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let (_, body) = get_json(router(state), "/deployment-readiness").await;
        assert_eq!(body["ready"], false);
        assert!(body["blockers"]
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b == "artifact_unavailable"));
    }

    #[tokio::test]
    async fn cost_analysis_exposes_bucket_breakdown() {
        let state = test_state();
        state
            .metrics
            .record(test_record(Bucket::Hard, ProviderKind::Google, true));
        let (_, body) = get_json(router(state), "/cost-analysis?window=3600000").await;
        assert!(body["by_bucket"]["hard"]["mean"].as_f64().is_some());
    }

    #[tokio::test]
    async fn alerts_lists_tripped_breakers() {
        let state = test_state();
        for _ in 0..5 {
            state.executor.breakers.record_failure("provider", "google");
        }
        let (_, body) = get_json(router(state), "/alerts").await;
        let firing = body["firing"].as_array().unwrap();
        assert!(firing
            .iter()
            .any(|a| a["rule"] == "circuit_breaker" && a["operation"] == "google"));
    }

    #[tokio::test]
    async fn cooldown_admin_clear_round_trip() {
        let state = test_state();
        state
            .executor
            .cooldowns
            .apply("u_1", Some(120), "anthropic_429");

        let (_, body) = get_json(router(Arc::clone(&state)), "/cooldowns").await;
        assert_eq!(body["active"].as_array().unwrap().len(), 1);

        let resp = router(Arc::clone(&state))
            .oneshot(
                Request::delete("/cooldowns/u_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = router(state)
            .oneshot(
                Request::delete("/cooldowns/u_1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
