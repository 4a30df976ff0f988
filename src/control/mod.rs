//! Control plane: the background activities that keep routing policy fresh.
//!
//! Four independent tasks share the process with the request path but never
//! run on it: catalog refresh, canary evaluation, weekly tuning, and
//! recommendation sweeps. They communicate with the hot path only through
//! the shared stores (artifact store, metrics engine, canary controller).

pub mod canary;
pub mod catalog;
pub mod recommend;
pub mod tuning;

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tracing::{info, warn};

use crate::{
    artifact::ArtifactStore,
    config::Config,
    metrics::MetricsEngine,
};

use canary::{CanaryController, StageObservation, Verdict};
use catalog::CatalogRefresher;
use recommend::RecommendationEngine;
use tuning::TuningPipeline;

/// Spawn every control-plane task. The returned handles are aborted on
/// shutdown; none of the loops exits on its own.
pub fn spawn_all(
    config: Arc<Config>,
    store: Arc<ArtifactStore>,
    engine: Arc<MetricsEngine>,
    canary: Arc<CanaryController>,
    recommender: Arc<RecommendationEngine>,
    slot: crate::router::CanarySlot,
) -> Vec<tokio::task::JoinHandle<()>> {
    let refresher = Arc::new(CatalogRefresher::new(&config.control, Arc::clone(&store)));
    let tuning = Arc::new(TuningPipeline::new(
        &config.control,
        config.metrics.logs_path.clone(),
        all_candidates(&config),
        Arc::clone(&engine),
        Arc::clone(&canary),
        Arc::clone(&slot),
    ));

    vec![
        tokio::spawn(catalog::refresh_loop(refresher, config.control.clone())),
        tokio::spawn(tuning::tuning_loop(tuning, config.control.clone())),
        tokio::spawn(canary_loop(
            Arc::clone(&canary),
            Arc::clone(&engine),
            store,
            slot,
            alert_webhook(&config),
            Duration::from_secs(config.control.canary_eval_secs),
        )),
        tokio::spawn(recommend::recommend_loop(
            recommender,
            Duration::from_secs(config.control.recommend_secs),
        )),
    ]
}

pub fn all_candidates(config: &Config) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for list in [
        &config.buckets.cheap.candidates,
        &config.buckets.mid.candidates,
        &config.buckets.hard.candidates,
    ] {
        for slug in list {
            if !out.contains(slug) {
                out.push(slug.clone());
            }
        }
    }
    out
}

fn alert_webhook(config: &Config) -> Option<String> {
    std::env::var("ALERT_WEBHOOK_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| config.control.alert_webhook_url.clone())
}

/// Periodic canary evaluation against canary-attributed metrics.
///
/// Completion publishes the staged bundle to the artifact store; rollback
/// clears the staged slot so the splitter sees 0 % immediately either way.
async fn canary_loop(
    canary: Arc<CanaryController>,
    engine: Arc<MetricsEngine>,
    store: Arc<ArtifactStore>,
    slot: crate::router::CanarySlot,
    alert_url: Option<String>,
    interval: Duration,
) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(stage_start) = canary.current_stage_start() else {
            continue;
        };

        let obs = observe_canary(&engine, stage_start);
        match canary.evaluate(obs) {
            Verdict::Hold => {}
            Verdict::Advanced(stage) => info!(stage, "canary stage advanced"),
            Verdict::Completed => {
                let staged = slot.write().expect("canary slot poisoned").take();
                if let Some(bundle) = staged {
                    info!(version = %bundle.artifact.version, "canary completed, publishing artifact");
                    store.publish(bundle);
                }
            }
            Verdict::RolledBack(reason) => {
                warn!(%reason, "canary rolled back");
                slot.write().expect("canary slot poisoned").take();
                if let Some(url) = &alert_url {
                    let payload = json!({
                        "event": "canary_rolled_back",
                        "reason": reason,
                        "rollout": canary.snapshot().map(|r| r.id),
                    });
                    if let Err(e) = client.post(url).json(&payload).send().await {
                        // The rollback itself already took effect; a dead
                        // webhook only costs the notification.
                        warn!(error = %e, "rollback alert delivery failed");
                        canary.mark_failed();
                    }
                }
            }
        }
    }
}

/// Aggregate canary-tagged records since the stage started.
fn observe_canary(engine: &MetricsEngine, since: chrono::DateTime<chrono::Utc>) -> StageObservation {
    let records: Vec<_> = engine
        .recent(None)
        .into_iter()
        .filter(|r| r.canary && r.timestamp >= since)
        .collect();
    let samples = records.len();
    if samples == 0 {
        return StageObservation::default();
    }

    let errors = records.iter().filter(|r| !r.success).count();
    let avg =
        |f: &dyn Fn(&crate::metrics::MetricRecord) -> f64| -> f64 {
            records.iter().map(|r| f(r)).sum::<f64>() / samples as f64
        };

    StageObservation {
        samples,
        error_rate: errors as f64 / samples as f64,
        win_rate: avg(&|r| r.win_rate_vs_baseline),
        avg_cost: avg(&|r| r.cost_estimate),
        avg_latency_ms: avg(&|r| r.execution_time_ms as f64),
    }
}
