//! Per-request outcome recording, SLO evaluation, and dashboard aggregates.
//!
//! [`MetricsEngine`] owns a fixed-capacity ring buffer of the most recent
//! request records; once full, the oldest entry is evicted so memory stays
//! bounded regardless of volume. Every aggregate — route share, cost and
//! latency percentiles, provider health, SLO state — is computed from a
//! stable copy of the buffer taken at call time.
//!
//! Emission to the warehouse and the JSON-lines log is asynchronous and
//! best-effort: `record` pushes onto a bounded queue and returns; a
//! background task drains it. On overflow the oldest pending emission is
//! dropped and counted, never blocking the request path.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{MetricsConfig, SloConfig};
use crate::error::ErrorKind;
use crate::executor::cooldown::CooldownTable;
use crate::providers::ProviderKind;
use crate::triage::Bucket;

/// Default aggregation window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Smallest accepted aggregation window.
const MIN_WINDOW: Duration = Duration::from_secs(5 * 60);

/// One completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub bucket: Bucket,
    pub provider: ProviderKind,
    pub model: String,
    pub success: bool,
    pub execution_time_ms: u64,
    pub cost_estimate: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub fallback_used: bool,
    /// True when this request was served by the canary artifact.
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub anthropic_429: bool,
    /// Supplied by an external evaluator; defaults to 1.0 upstream.
    pub win_rate_vs_baseline: f64,
}

impl MetricRecord {
    fn is_429(&self) -> bool {
        self.anthropic_429
            || self.error_kind.as_deref() == Some(ErrorKind::RateLimitUpstream.as_str())
    }
}

/// Latency/availability summary for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub requests: usize,
    pub availability: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
}

/// One point of the 24-hour trend, most-recent-last in the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub hour_start: DateTime<Utc>,
    pub requests: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

/// Mean/P95 cost pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostStats {
    pub mean: f64,
    pub p95: f64,
}

/// A single exceeded threshold.
#[derive(Debug, Clone, Serialize)]
pub struct SloViolation {
    pub name: String,
    pub threshold: f64,
    pub observed: f64,
}

/// SLO evaluation result.
#[derive(Debug, Clone, Serialize)]
pub struct SloReport {
    pub compliant: bool,
    pub violations: Vec<SloViolation>,
}

/// Deployment gate outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
}

/// Everything the dashboard renders for one window.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardMetrics {
    pub window_secs: u64,
    pub total_requests: usize,
    pub route_share: HashMap<String, f64>,
    pub cost_overall: CostStats,
    pub cost_by_bucket: HashMap<String, CostStats>,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub anthropic_429_rate: f64,
    pub rate_limit_429s_last_hour: usize,
    pub cooldown_users: usize,
    pub win_rate_overall: f64,
    pub win_rate_by_bucket: HashMap<String, f64>,
    pub hourly_trend: Vec<TrendPoint>,
    pub providers: HashMap<String, ProviderHealth>,
    pub slo: SloReport,
}

/// Owns the metric ring buffer and the emission queue.
pub struct MetricsEngine {
    capacity: usize,
    records: Mutex<VecDeque<MetricRecord>>,
    slo: SloConfig,
    cooldowns: Arc<CooldownTable>,

    // Asynchronous emission
    warehouse_url: Option<String>,
    logs_path: Option<String>,
    queue: Mutex<VecDeque<MetricRecord>>,
    queue_capacity: usize,
    notify: Notify,
    pub dropped_emissions: AtomicU64,
}

impl MetricsEngine {
    pub fn new(cfg: &MetricsConfig, slo: SloConfig, cooldowns: Arc<CooldownTable>) -> Self {
        let warehouse_url = std::env::var("METRICS_WAREHOUSE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| cfg.warehouse_url.clone());
        let logs_path = std::env::var("POSTHOOK_LOGS_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| cfg.logs_path.clone());

        Self {
            capacity: cfg.buffer_capacity,
            records: Mutex::new(VecDeque::with_capacity(cfg.buffer_capacity.min(4_096))),
            slo,
            cooldowns,
            warehouse_url,
            logs_path,
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: cfg.emit_queue_capacity,
            notify: Notify::new(),
            dropped_emissions: AtomicU64::new(0),
        }
    }

    /// Record one completed request. Never blocks on emission.
    pub fn record(&self, record: MetricRecord) {
        {
            let mut records = self.records.lock().expect("metrics lock poisoned");
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        if self.warehouse_url.is_some() || self.logs_path.is_some() {
            let mut queue = self.queue.lock().expect("emit queue lock poisoned");
            if queue.len() == self.queue_capacity {
                queue.pop_front();
                self.dropped_emissions.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
            drop(queue);
            self.notify.notify_one();
        }
    }

    /// Stable copy of the records inside `window`, oldest first.
    pub fn recent(&self, window: Option<Duration>) -> Vec<MetricRecord> {
        let window = clamp_window(window);
        let cutoff = Utc::now() - chrono::Duration::from_std(window).expect("window fits");
        self.records
            .lock()
            .expect("metrics lock poisoned")
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Count of records currently buffered (any age).
    pub fn buffered(&self) -> usize {
        self.records.lock().expect("metrics lock poisoned").len()
    }

    /// Relative latency variance (stddev ÷ mean) per model, for the
    /// selector's latency penalty.
    pub fn latency_variance_by_model(&self) -> HashMap<String, f64> {
        let records = self.recent(None);
        let mut grouped: HashMap<&str, Vec<f64>> = HashMap::new();
        for r in &records {
            if r.success {
                grouped.entry(&r.model).or_default().push(r.execution_time_ms as f64);
            }
        }
        grouped
            .into_iter()
            .filter(|(_, xs)| xs.len() >= 2)
            .map(|(model, xs)| {
                let mean = xs.iter().sum::<f64>() / xs.len() as f64;
                let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>()
                    / xs.len() as f64;
                let rel = if mean > 0.0 { var.sqrt() / mean } else { 0.0 };
                (model.to_string(), rel)
            })
            .collect()
    }

    /// Full dashboard aggregate over `window`.
    pub fn snapshot(&self, window: Option<Duration>) -> DashboardMetrics {
        let window = clamp_window(window);
        let records = self.recent(Some(window));
        let now = Utc::now();
        let total = records.len();

        let mut route_share: HashMap<String, f64> = HashMap::new();
        for r in &records {
            *route_share.entry(r.bucket.as_str().to_string()).or_default() += 1.0;
        }
        for share in route_share.values_mut() {
            *share /= total.max(1) as f64;
        }

        let costs: Vec<f64> = records.iter().map(|r| r.cost_estimate).collect();
        let cost_overall = cost_stats(&costs);
        let mut cost_by_bucket: HashMap<String, CostStats> = HashMap::new();
        for bucket in [Bucket::Cheap, Bucket::Mid, Bucket::Hard] {
            let xs: Vec<f64> = records
                .iter()
                .filter(|r| r.bucket == bucket)
                .map(|r| r.cost_estimate)
                .collect();
            if !xs.is_empty() {
                cost_by_bucket.insert(bucket.as_str().to_string(), cost_stats(&xs));
            }
        }

        let latencies: Vec<f64> = records.iter().map(|r| r.execution_time_ms as f64).collect();

        let anthropic_total = records
            .iter()
            .filter(|r| r.provider == ProviderKind::Anthropic)
            .count();
        let anthropic_429s = records.iter().filter(|r| r.anthropic_429).count();
        let anthropic_429_rate = if anthropic_total == 0 {
            0.0
        } else {
            anthropic_429s as f64 / anthropic_total as f64
        };

        let hour_ago = now - chrono::Duration::hours(1);
        let rate_limit_429s_last_hour = records
            .iter()
            .filter(|r| r.timestamp >= hour_ago && r.is_429())
            .count();

        let win_rate_overall = mean(records.iter().map(|r| r.win_rate_vs_baseline));
        let mut win_rate_by_bucket: HashMap<String, f64> = HashMap::new();
        for bucket in [Bucket::Cheap, Bucket::Mid, Bucket::Hard] {
            let xs: Vec<f64> = records
                .iter()
                .filter(|r| r.bucket == bucket)
                .map(|r| r.win_rate_vs_baseline)
                .collect();
            if !xs.is_empty() {
                win_rate_by_bucket
                    .insert(bucket.as_str().to_string(), xs.iter().sum::<f64>() / xs.len() as f64);
            }
        }

        let slo = self.check_slo_records(&records);

        DashboardMetrics {
            window_secs: window.as_secs(),
            total_requests: total,
            route_share,
            cost_overall,
            cost_by_bucket,
            avg_latency_ms: mean(latencies.iter().copied()),
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            anthropic_429_rate,
            rate_limit_429s_last_hour,
            cooldown_users: self.cooldowns.unique_users(),
            win_rate_overall,
            win_rate_by_bucket,
            hourly_trend: hourly_trend(&records, now),
            providers: provider_health(&records),
            slo,
        }
    }

    /// Evaluate the configured SLO thresholds over `window`.
    pub fn check_slo(&self, window: Option<Duration>) -> SloReport {
        let records = self.recent(Some(clamp_window(window)));
        self.check_slo_records(&records)
    }

    fn check_slo_records(&self, records: &[MetricRecord]) -> SloReport {
        let mut violations = Vec::new();
        if records.is_empty() {
            return SloReport { compliant: true, violations };
        }

        let latencies: Vec<f64> = records.iter().map(|r| r.execution_time_ms as f64).collect();
        let p95 = percentile(&latencies, 0.95);
        if p95 > self.slo.p95_latency_ms {
            violations.push(SloViolation {
                name: "p95_latency_ms".into(),
                threshold: self.slo.p95_latency_ms,
                observed: p95,
            });
        }

        // Failover misfire: fallback attempts that still failed.
        let fallbacks = records.iter().filter(|r| r.fallback_used).count();
        if fallbacks > 0 {
            let misfires = records
                .iter()
                .filter(|r| r.fallback_used && !r.success)
                .count();
            let rate = misfires as f64 / fallbacks as f64;
            if rate > self.slo.failover_misfire_rate {
                violations.push(SloViolation {
                    name: "failover_misfire_rate".into(),
                    threshold: self.slo.failover_misfire_rate,
                    observed: rate,
                });
            }
        }

        let uptime = records.iter().filter(|r| r.success).count() as f64 / records.len() as f64;
        if uptime < self.slo.uptime {
            violations.push(SloViolation {
                name: "uptime".into(),
                threshold: self.slo.uptime,
                observed: uptime,
            });
        }

        let mean_cost = mean(records.iter().map(|r| r.cost_estimate));
        if mean_cost > self.slo.mean_cost_per_task {
            violations.push(SloViolation {
                name: "mean_cost_per_task".into(),
                threshold: self.slo.mean_cost_per_task,
                observed: mean_cost,
            });
        }

        let win_rate = mean(records.iter().map(|r| r.win_rate_vs_baseline));
        if win_rate < self.slo.win_rate {
            violations.push(SloViolation {
                name: "win_rate".into(),
                threshold: self.slo.win_rate,
                observed: win_rate,
            });
        }

        SloReport { compliant: violations.is_empty(), violations }
    }

    /// Deployment gates: hard blockers stop a rollout, warnings inform it.
    pub fn deployment_readiness(&self, artifact_degraded: bool) -> ReadinessReport {
        let mut blockers = Vec::new();
        let mut warnings = Vec::new();

        if artifact_degraded {
            blockers.push("artifact_unavailable".to_string());
        }

        let slo = self.check_slo(None);
        for v in &slo.violations {
            match v.name.as_str() {
                "uptime" | "win_rate" => blockers.push(format!("slo:{}", v.name)),
                _ => warnings.push(format!("slo:{}", v.name)),
            }
        }

        if self.buffered() == 0 {
            warnings.push("no_recent_traffic".to_string());
        }
        let dropped = self.dropped_emissions.load(Ordering::Relaxed);
        if dropped > 0 {
            warnings.push(format!("dropped_emissions:{dropped}"));
        }

        ReadinessReport {
            ready: blockers.is_empty(),
            blockers,
            warnings,
        }
    }
}

/// Background task: drains the emission queue into the warehouse endpoint
/// and/or the JSON-lines log. Failures log a warning and never propagate.
pub async fn emitter_loop(engine: Arc<MetricsEngine>) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");

    loop {
        engine.notify.notified().await;
        loop {
            let record = {
                let mut queue = engine.queue.lock().expect("emit queue lock poisoned");
                queue.pop_front()
            };
            let Some(record) = record else { break };

            if let Some(url) = &engine.warehouse_url {
                if let Err(e) = client.post(url).json(&record).send().await {
                    warn!(error = %e, "warehouse emission failed");
                }
            }
            if let Some(path) = &engine.logs_path {
                let line = serde_json::to_string(&record).expect("record serializes");
                let append = tokio::task::spawn_blocking({
                    let path = path.clone();
                    move || {
                        use std::io::Write;
                        std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&path)
                            .and_then(|mut f| writeln!(f, "{line}"))
                    }
                })
                .await;
                match append {
                    Ok(Ok(())) => debug!("metric appended to log"),
                    Ok(Err(e)) => warn!(error = %e, "metric log append failed"),
                    Err(e) => warn!(error = %e, "metric log task failed"),
                }
            }
        }
    }
}

fn clamp_window(window: Option<Duration>) -> Duration {
    window.unwrap_or(DEFAULT_WINDOW).max(MIN_WINDOW)
}

fn mean(xs: impl Iterator<Item = f64>) -> f64 {
    let xs: Vec<f64> = xs.collect();
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Nearest-rank percentile over an unsorted sample. 0 for empty input.
fn percentile(xs: &[f64], p: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

fn cost_stats(xs: &[f64]) -> CostStats {
    CostStats {
        mean: mean(xs.iter().copied()),
        p95: percentile(xs, 0.95),
    }
}

fn provider_health(records: &[MetricRecord]) -> HashMap<String, ProviderHealth> {
    let mut grouped: HashMap<ProviderKind, Vec<&MetricRecord>> = HashMap::new();
    for r in records {
        grouped.entry(r.provider).or_default().push(r);
    }

    grouped
        .into_iter()
        .map(|(provider, rs)| {
            let total = rs.len();
            let successes = rs.iter().filter(|r| r.success).count();
            let latencies: Vec<f64> = rs.iter().map(|r| r.execution_time_ms as f64).collect();
            let last_success = rs
                .iter()
                .filter(|r| r.success)
                .map(|r| r.timestamp)
                .max();
            (
                provider.as_str().to_string(),
                ProviderHealth {
                    requests: total,
                    availability: successes as f64 / total.max(1) as f64,
                    error_rate: (total - successes) as f64 / total.max(1) as f64,
                    avg_latency_ms: mean(latencies.iter().copied()),
                    p95_latency_ms: percentile(&latencies, 0.95),
                    p99_latency_ms: percentile(&latencies, 0.99),
                    last_success,
                },
            )
        })
        .collect()
}

/// 24 hourly points ending at the current hour, most-recent-last.
fn hourly_trend(records: &[MetricRecord], now: DateTime<Utc>) -> Vec<TrendPoint> {
    let current_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    (0..24)
        .rev()
        .map(|back| {
            let start = current_hour - chrono::Duration::hours(back);
            let end = start + chrono::Duration::hours(1);
            let hour: Vec<&MetricRecord> = records
                .iter()
                .filter(|r| r.timestamp >= start && r.timestamp < end)
                .collect();
            let total = hour.len();
            let errors = hour.iter().filter(|r| !r.success).count();
            TrendPoint {
                hour_start: start,
                requests: total,
                error_rate: if total == 0 { 0.0 } else { errors as f64 / total as f64 },
                avg_latency_ms: mean(hour.iter().map(|r| r.execution_time_ms as f64)),
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_record(bucket: Bucket, provider: ProviderKind, success: bool) -> MetricRecord {
    MetricRecord {
        timestamp: Utc::now(),
        request_id: uuid::Uuid::new_v4().to_string(),
        bucket,
        provider,
        model: format!("{}/test-model", provider.as_str()),
        success,
        execution_time_ms: 100,
        cost_estimate: 0.01,
        prompt_tokens: 100,
        completion_tokens: 50,
        total_tokens: 150,
        fallback_used: false,
        canary: false,
        error_kind: None,
        user_id: None,
        anthropic_429: false,
        win_rate_vs_baseline: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MetricsEngine {
        engine_with_capacity(1_000)
    }

    fn engine_with_capacity(capacity: usize) -> MetricsEngine {
        let cfg = MetricsConfig {
            buffer_capacity: capacity,
            warehouse_url: None,
            logs_path: None,
            emit_queue_capacity: 8,
        };
        MetricsEngine::new(&cfg, SloConfig::default(), Arc::new(CooldownTable::new()))
    }

    // -----------------------------------------------------------------------
    // Ring buffer
    // -----------------------------------------------------------------------

    #[test]
    fn oldest_record_evicted_at_capacity() {
        let e = engine_with_capacity(3);
        for i in 0..4 {
            let mut r = test_record(Bucket::Cheap, ProviderKind::OpenAI, true);
            r.request_id = format!("req-{i}");
            e.record(r);
        }
        let records = e.recent(None);
        assert_eq!(records.len(), 3);
        assert!(!records.iter().any(|r| r.request_id == "req-0"));
        assert!(records.iter().any(|r| r.request_id == "req-3"));
    }

    #[test]
    fn snapshot_is_stable_without_intervening_writes() {
        let e = engine();
        e.record(test_record(Bucket::Mid, ProviderKind::Anthropic, true));
        e.record(test_record(Bucket::Cheap, ProviderKind::OpenAI, false));

        let a = e.snapshot(None);
        let b = e.snapshot(None);
        assert_eq!(a.total_requests, b.total_requests);
        assert_eq!(a.route_share, b.route_share);
        assert_eq!(a.p95_latency_ms, b.p95_latency_ms);
        assert_eq!(a.slo.compliant, b.slo.compliant);
    }

    // -----------------------------------------------------------------------
    // Aggregates
    // -----------------------------------------------------------------------

    #[test]
    fn route_share_sums_to_one() {
        let e = engine();
        for _ in 0..6 {
            e.record(test_record(Bucket::Cheap, ProviderKind::OpenAI, true));
        }
        for _ in 0..3 {
            e.record(test_record(Bucket::Mid, ProviderKind::Anthropic, true));
        }
        e.record(test_record(Bucket::Hard, ProviderKind::Google, true));

        let snap = e.snapshot(None);
        let sum: f64 = snap.route_share.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((snap.route_share["cheap"] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn latency_percentiles_are_ordered() {
        let e = engine();
        for ms in [10, 20, 50, 100, 500, 1_000, 5_000] {
            let mut r = test_record(Bucket::Mid, ProviderKind::OpenAI, true);
            r.execution_time_ms = ms;
            e.record(r);
        }
        let snap = e.snapshot(None);
        assert!(snap.avg_latency_ms <= snap.p95_latency_ms);
        assert!(snap.p95_latency_ms <= snap.p99_latency_ms);
        assert_eq!(snap.p99_latency_ms, 5_000.0);
    }

    #[test]
    fn anthropic_429_rate_uses_anthropic_calls_as_denominator() {
        let e = engine();
        for _ in 0..8 {
            e.record(test_record(Bucket::Mid, ProviderKind::Anthropic, true));
        }
        for _ in 0..2 {
            let mut r = test_record(Bucket::Mid, ProviderKind::Anthropic, false);
            r.anthropic_429 = true;
            e.record(r);
        }
        // OpenAI traffic must not dilute the rate.
        for _ in 0..10 {
            e.record(test_record(Bucket::Cheap, ProviderKind::OpenAI, true));
        }

        let snap = e.snapshot(None);
        assert!((snap.anthropic_429_rate - 0.2).abs() < 1e-9);
        assert_eq!(snap.rate_limit_429s_last_hour, 2);
    }

    #[test]
    fn win_rate_by_bucket_only_covers_observed_buckets() {
        let e = engine();
        let mut r = test_record(Bucket::Hard, ProviderKind::Google, true);
        r.win_rate_vs_baseline = 0.9;
        e.record(r);

        let snap = e.snapshot(None);
        assert!((snap.win_rate_by_bucket["hard"] - 0.9).abs() < 1e-9);
        assert!(!snap.win_rate_by_bucket.contains_key("cheap"));
    }

    #[test]
    fn hourly_trend_has_24_points_most_recent_last() {
        let e = engine();
        e.record(test_record(Bucket::Cheap, ProviderKind::OpenAI, true));
        let snap = e.snapshot(None);
        assert_eq!(snap.hourly_trend.len(), 24);
        let last = snap.hourly_trend.last().unwrap();
        let first = snap.hourly_trend.first().unwrap();
        assert!(last.hour_start > first.hour_start);
        assert_eq!(last.requests, 1);
    }

    #[test]
    fn provider_health_tracks_availability_and_last_success() {
        let e = engine();
        e.record(test_record(Bucket::Mid, ProviderKind::Google, true));
        e.record(test_record(Bucket::Mid, ProviderKind::Google, false));

        let snap = e.snapshot(None);
        let google = &snap.providers["google"];
        assert_eq!(google.requests, 2);
        assert!((google.availability - 0.5).abs() < 1e-9);
        assert!(google.last_success.is_some());
    }

    // -----------------------------------------------------------------------
    // SLO
    // -----------------------------------------------------------------------

    #[test]
    fn empty_window_is_compliant() {
        let report = engine().check_slo(None);
        assert!(report.compliant);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn slow_p95_violates_latency_slo() {
        let e = engine();
        for _ in 0..20 {
            let mut r = test_record(Bucket::Mid, ProviderKind::OpenAI, true);
            r.execution_time_ms = 4_000;
            e.record(r);
        }
        let report = e.check_slo(None);
        assert!(!report.compliant);
        assert!(report.violations.iter().any(|v| v.name == "p95_latency_ms"));
    }

    #[test]
    fn failed_fallbacks_violate_misfire_slo() {
        let e = engine();
        for i in 0..10 {
            let mut r = test_record(Bucket::Mid, ProviderKind::OpenAI, i > 0);
            r.fallback_used = true;
            e.record(r);
        }
        // 1 of 10 fallbacks failed → 10 % > 5 % threshold
        let report = e.check_slo(None);
        assert!(report
            .violations
            .iter()
            .any(|v| v.name == "failover_misfire_rate"));
    }

    #[test]
    fn low_win_rate_violates_slo() {
        let e = engine();
        for _ in 0..10 {
            let mut r = test_record(Bucket::Cheap, ProviderKind::OpenAI, true);
            r.win_rate_vs_baseline = 0.5;
            e.record(r);
        }
        let report = e.check_slo(None);
        assert!(report.violations.iter().any(|v| v.name == "win_rate"));
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    #[test]
    fn degraded_artifact_blocks_deployment() {
        let report = engine().deployment_readiness(true);
        assert!(!report.ready);
        assert!(report.blockers.contains(&"artifact_unavailable".to_string()));
    }

    #[test]
    fn healthy_engine_is_ready_with_traffic_warning_only() {
        let report = engine().deployment_readiness(false);
        assert!(report.ready);
        assert!(report.warnings.contains(&"no_recent_traffic".to_string()));
    }

    #[test]
    fn uptime_violation_is_a_blocker() {
        let e = engine();
        for i in 0..10 {
            e.record(test_record(Bucket::Mid, ProviderKind::OpenAI, i >= 2));
        }
        // 80 % uptime < 99.5 %
        let report = e.deployment_readiness(false);
        assert!(!report.ready);
        assert!(report.blockers.iter().any(|b| b == "slo:uptime"));
    }

    // -----------------------------------------------------------------------
    // Latency variance
    // -----------------------------------------------------------------------

    #[test]
    fn latency_variance_requires_two_samples_and_is_relative() {
        let e = engine();
        let mut once = test_record(Bucket::Mid, ProviderKind::OpenAI, true);
        once.model = "openai/solo".into();
        e.record(once);

        for ms in [100, 300] {
            let mut r = test_record(Bucket::Mid, ProviderKind::OpenAI, true);
            r.model = "openai/jittery".into();
            r.execution_time_ms = ms;
            e.record(r);
        }

        let variance = e.latency_variance_by_model();
        assert!(!variance.contains_key("openai/solo"));
        // mean 200, stddev 100 → relative 0.5
        assert!((variance["openai/jittery"] - 0.5).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // Percentile helper
    // -----------------------------------------------------------------------

    #[test]
    fn percentile_nearest_rank_behaviour() {
        let xs: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&xs, 0.95), 95.0);
        assert_eq!(percentile(&xs, 0.99), 99.0);
        assert_eq!(percentile(&[42.0], 0.95), 42.0);
        assert_eq!(percentile(&[], 0.95), 0.0);
    }

    // -----------------------------------------------------------------------
    // Emission queue
    // -----------------------------------------------------------------------

    #[test]
    fn emission_queue_drops_oldest_on_overflow() {
        let cfg = MetricsConfig {
            buffer_capacity: 100,
            warehouse_url: Some("http://127.0.0.1:9/warehouse".into()),
            logs_path: None,
            emit_queue_capacity: 2,
        };
        let e = MetricsEngine::new(&cfg, SloConfig::default(), Arc::new(CooldownTable::new()));
        for _ in 0..5 {
            e.record(test_record(Bucket::Cheap, ProviderKind::OpenAI, true));
        }
        assert_eq!(e.dropped_emissions.load(Ordering::Relaxed), 3);
        assert_eq!(e.queue.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn emitter_posts_records_to_warehouse() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = MetricsConfig {
            buffer_capacity: 100,
            warehouse_url: Some(format!("{}/ingest", server.uri())),
            logs_path: None,
            emit_queue_capacity: 8,
        };
        let e = Arc::new(MetricsEngine::new(
            &cfg,
            SloConfig::default(),
            Arc::new(CooldownTable::new()),
        ));
        let task = tokio::spawn(emitter_loop(Arc::clone(&e)));

        e.record(test_record(Bucket::Mid, ProviderKind::Anthropic, true));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();
    }

    #[tokio::test]
    async fn emitter_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("posthook.jsonl");
        let cfg = MetricsConfig {
            buffer_capacity: 100,
            warehouse_url: None,
            logs_path: Some(log.to_string_lossy().into_owned()),
            emit_queue_capacity: 8,
        };
        let e = Arc::new(MetricsEngine::new(
            &cfg,
            SloConfig::default(),
            Arc::new(CooldownTable::new()),
        ));
        let task = tokio::spawn(emitter_loop(Arc::clone(&e)));

        e.record(test_record(Bucket::Hard, ProviderKind::Google, true));
        e.record(test_record(Bucket::Cheap, ProviderKind::OpenAI, false));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();

        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: MetricRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.bucket, Bucket::Hard);
    }
}
