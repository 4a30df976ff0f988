//! Advisory recommendation sweeps.
//!
//! Every sweep inspects the recent metrics window and emits typed
//! recommendations (cost, quality, performance, configuration) with a
//! priority and an expected impact. Recommendations are advisory; automatic
//! implementation is opt-in per kind and currently limited to logging the
//! intent. Pending entries expire after seven days.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::metrics::MetricsEngine;

/// Pending recommendations older than this are discarded.
const EXPIRY_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Cost,
    Quality,
    Performance,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub id: String,
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub title: String,
    pub detail: String,
    pub expected_impact: String,
    pub created_at: DateTime<Utc>,
    /// True when this entry was auto-implemented rather than left pending.
    pub applied: bool,
}

/// Owns the pending list; external readers take snapshots.
pub struct RecommendationEngine {
    metrics: Arc<MetricsEngine>,
    pending: RwLock<Vec<Recommendation>>,
    /// Kinds the operator allowed to auto-apply.
    auto_apply: HashSet<RecommendationKind>,
}

impl RecommendationEngine {
    pub fn new(metrics: Arc<MetricsEngine>) -> Self {
        Self {
            metrics,
            pending: RwLock::new(Vec::new()),
            auto_apply: HashSet::new(),
        }
    }

    /// Opt a recommendation kind into automatic implementation.
    pub fn allow_auto_apply(&mut self, kind: RecommendationKind) {
        self.auto_apply.insert(kind);
    }

    /// Current pending list, highest priority first.
    pub fn snapshot(&self) -> Vec<Recommendation> {
        let mut list = self.pending.read().expect("recommendation lock poisoned").clone();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.created_at.cmp(&a.created_at)));
        list
    }

    /// One sweep: expire stale entries, inspect the window, emit new ones.
    pub fn sweep(&self) {
        let snapshot = self.metrics.snapshot(None);
        let mut fresh: Vec<Recommendation> = Vec::new();

        if snapshot.total_requests > 0 {
            if snapshot.cost_overall.mean > 0.08 {
                fresh.push(self.make(
                    RecommendationKind::Cost,
                    Priority::High,
                    "Mean cost approaching the SLO ceiling",
                    format!(
                        "mean cost per task is ${:.3}; shift mid-bucket traffic toward cheaper candidates",
                        snapshot.cost_overall.mean
                    ),
                    "10-30% cost reduction",
                ));
            }
            if snapshot.win_rate_overall < 0.9 && snapshot.win_rate_overall > 0.0 {
                fresh.push(self.make(
                    RecommendationKind::Quality,
                    Priority::Medium,
                    "Win rate trending down",
                    format!(
                        "overall win rate is {:.2}; consider raising alpha or retraining earlier",
                        snapshot.win_rate_overall
                    ),
                    "recover 2-5pp win rate",
                ));
            }
            if snapshot.p95_latency_ms > 2_000.0 {
                fresh.push(self.make(
                    RecommendationKind::Performance,
                    Priority::Medium,
                    "P95 latency near the SLO threshold",
                    format!(
                        "P95 latency is {:.0}ms; review provider health and thinking budgets",
                        snapshot.p95_latency_ms
                    ),
                    "keep P95 under 2500ms",
                ));
            }
            if snapshot.anthropic_429_rate > 0.10 {
                fresh.push(self.make(
                    RecommendationKind::Configuration,
                    Priority::High,
                    "Anthropic rate limits are biting",
                    format!(
                        "{:.0}% of Anthropic calls hit 429; widen non-Anthropic candidates in mid/hard",
                        snapshot.anthropic_429_rate * 100.0
                    ),
                    "fewer fallback round-trips",
                ));
            }
        }

        let cutoff = Utc::now() - chrono::Duration::days(EXPIRY_DAYS);
        let mut pending = self.pending.write().expect("recommendation lock poisoned");
        pending.retain(|r| r.created_at >= cutoff);
        // One pending entry per (kind, title); re-emission refreshes nothing.
        for rec in fresh {
            let duplicate = pending
                .iter()
                .any(|p| p.kind == rec.kind && p.title == rec.title);
            if !duplicate {
                info!(kind = ?rec.kind, title = %rec.title, "recommendation emitted");
                pending.push(rec);
            }
        }
    }

    fn make(
        &self,
        kind: RecommendationKind,
        priority: Priority,
        title: &str,
        detail: String,
        expected_impact: &str,
    ) -> Recommendation {
        let applied = self.auto_apply.contains(&kind);
        if applied {
            info!(?kind, title, "auto-applying recommendation");
        }
        Recommendation {
            id: Uuid::new_v4().to_string(),
            kind,
            priority,
            title: title.to_string(),
            detail,
            expected_impact: expected_impact.to_string(),
            created_at: Utc::now(),
            applied,
        }
    }
}

/// Background task: sweeps on a fixed interval. Never exits.
pub async fn recommend_loop(engine: Arc<RecommendationEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        engine.sweep();
    }
}
