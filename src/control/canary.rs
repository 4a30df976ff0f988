//! Staged rollout of a pending routing artifact.
//!
//! A rollout walks four traffic stages (5 % → 25 % → 50 % → 100 %). Each
//! evaluation pass first checks the rollback triggers — any one flips canary
//! traffic to zero immediately — then the progression gates. Only one
//! rollout may be running process-wide; the request-path traffic splitter
//! reads the current stage's percentage from a snapshot.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Traffic percentage per stage, in order.
const STAGE_TRAFFIC_PCT: [f64; 4] = [5.0, 25.0, 50.0, 100.0];

/// Progression gates.
const MAX_STAGE_ERROR_RATE: f64 = 0.05;
const MIN_STAGE_WIN_RATE: f64 = 0.85;
const MAX_COST_INCREASE: f64 = 0.20;
const MAX_LATENCY_INCREASE: f64 = 0.15;

/// Rollback triggers. Any one fires an immediate rollback.
const ROLLBACK_ERROR_RATE: f64 = 0.10;
const ROLLBACK_LATENCY_INCREASE: f64 = 0.50;
const ROLLBACK_COST_INCREASE: f64 = 0.30;
const ROLLBACK_WIN_RATE_DROP: f64 = 0.10;

/// Rollout lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Planning,
    Running,
    Completed,
    RolledBack,
    Failed,
}

/// Reference metrics captured before the rollout started.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BaselineMetrics {
    pub win_rate: f64,
    pub avg_cost: f64,
    pub avg_latency_ms: f64,
}

/// Observed canary metrics for the current stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageObservation {
    pub samples: usize,
    pub error_rate: f64,
    pub win_rate: f64,
    pub avg_cost: f64,
    pub avg_latency_ms: f64,
}

/// One stage's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct Stage {
    pub traffic_pct: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub samples: usize,
    pub error_rate: f64,
    pub win_rate: f64,
    pub passed: Option<bool>,
}

impl Stage {
    fn new(traffic_pct: f64) -> Self {
        Self {
            traffic_pct,
            started_at: None,
            ended_at: None,
            samples: 0,
            error_rate: 0.0,
            win_rate: 0.0,
            passed: None,
        }
    }
}

/// A rollout in some lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct CanaryRollout {
    pub id: String,
    pub artifact_version: String,
    pub start_time: DateTime<Utc>,
    pub stages: Vec<Stage>,
    pub current_stage: usize,
    pub baseline: BaselineMetrics,
    pub status: RolloutStatus,
}

/// Evaluation knobs, from config.
#[derive(Debug, Clone, Copy)]
pub struct CanaryGates {
    pub min_samples_per_stage: usize,
    pub min_stage_minutes: i64,
}

/// What one evaluation pass decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No rollout running, or gates not yet satisfied.
    Hold,
    /// Moved to the next stage.
    Advanced(usize),
    /// All stages passed; rollout completed.
    Completed,
    /// A rollback trigger fired.
    RolledBack(String),
}

/// Owns the single process-wide rollout slot.
pub struct CanaryController {
    rollout: RwLock<Option<CanaryRollout>>,
    gates: CanaryGates,
}

impl CanaryController {
    pub fn new(gates: CanaryGates) -> Self {
        Self {
            rollout: RwLock::new(None),
            gates,
        }
    }

    /// Begin a rollout for a new artifact version.
    ///
    /// Fails while another rollout is `running` — at most one runs at a time.
    pub fn start(
        &self,
        artifact_version: &str,
        baseline: BaselineMetrics,
    ) -> anyhow::Result<String> {
        let mut slot = self.rollout.write().expect("canary lock poisoned");
        if let Some(active) = slot.as_ref() {
            anyhow::ensure!(
                active.status != RolloutStatus::Running,
                "rollout {} is already running for version {}",
                active.id,
                active.artifact_version
            );
        }

        let id = Uuid::new_v4().to_string();
        let mut stages: Vec<Stage> = STAGE_TRAFFIC_PCT.iter().map(|&p| Stage::new(p)).collect();
        stages[0].started_at = Some(Utc::now());

        *slot = Some(CanaryRollout {
            id: id.clone(),
            artifact_version: artifact_version.to_string(),
            start_time: Utc::now(),
            stages,
            current_stage: 0,
            baseline,
            status: RolloutStatus::Running,
        });
        info!(rollout = %id, version = artifact_version, "canary rollout started");
        Ok(id)
    }

    /// Fraction of traffic the canary artifact should receive right now.
    pub fn traffic_fraction(&self) -> f64 {
        let slot = self.rollout.read().expect("canary lock poisoned");
        match slot.as_ref() {
            Some(r) if r.status == RolloutStatus::Running => {
                r.stages[r.current_stage].traffic_pct / 100.0
            }
            _ => 0.0,
        }
    }

    /// Snapshot for the dashboard.
    pub fn snapshot(&self) -> Option<CanaryRollout> {
        self.rollout.read().expect("canary lock poisoned").clone()
    }

    /// Start time of the stage currently collecting samples.
    pub fn current_stage_start(&self) -> Option<DateTime<Utc>> {
        let slot = self.rollout.read().expect("canary lock poisoned");
        slot.as_ref()
            .filter(|r| r.status == RolloutStatus::Running)
            .and_then(|r| r.stages[r.current_stage].started_at)
    }

    /// One evaluation pass against the current stage's observation.
    pub fn evaluate(&self, obs: StageObservation) -> Verdict {
        let mut slot = self.rollout.write().expect("canary lock poisoned");
        let Some(rollout) = slot.as_mut().filter(|r| r.status == RolloutStatus::Running) else {
            return Verdict::Hold;
        };

        let baseline = rollout.baseline;
        let stage = &mut rollout.stages[rollout.current_stage];
        stage.samples = obs.samples;
        stage.error_rate = obs.error_rate;
        stage.win_rate = obs.win_rate;

        // Rollback triggers run on whatever samples exist.
        if obs.samples > 0 {
            if let Some(reason) = rollback_reason(&obs, &baseline) {
                stage.passed = Some(false);
                stage.ended_at = Some(Utc::now());
                rollout.status = RolloutStatus::RolledBack;
                warn!(rollout = %rollout.id, %reason, "canary rolled back");
                return Verdict::RolledBack(reason);
            }
        }

        // Progression gates.
        if obs.samples < self.gates.min_samples_per_stage {
            return Verdict::Hold;
        }
        let ran_long_enough = stage
            .started_at
            .is_some_and(|t| Utc::now() - t >= Duration::minutes(self.gates.min_stage_minutes));
        if !ran_long_enough {
            return Verdict::Hold;
        }
        if obs.error_rate > MAX_STAGE_ERROR_RATE
            || obs.win_rate < MIN_STAGE_WIN_RATE
            || obs.win_rate < baseline.win_rate
            || relative_increase(baseline.avg_cost, obs.avg_cost) > MAX_COST_INCREASE
            || relative_increase(baseline.avg_latency_ms, obs.avg_latency_ms)
                > MAX_LATENCY_INCREASE
        {
            return Verdict::Hold;
        }

        stage.passed = Some(true);
        stage.ended_at = Some(Utc::now());

        if rollout.current_stage + 1 == rollout.stages.len() {
            rollout.status = RolloutStatus::Completed;
            info!(rollout = %rollout.id, "canary rollout completed");
            return Verdict::Completed;
        }

        rollout.current_stage += 1;
        rollout.stages[rollout.current_stage].started_at = Some(Utc::now());
        info!(rollout = %rollout.id, stage = rollout.current_stage, "canary advanced");
        Verdict::Advanced(rollout.current_stage)
    }

    /// Mark a rollback attempt as failed (traffic could not be flipped).
    pub fn mark_failed(&self) {
        let mut slot = self.rollout.write().expect("canary lock poisoned");
        if let Some(rollout) = slot.as_mut() {
            rollout.status = RolloutStatus::Failed;
            warn!(rollout = %rollout.id, "canary rollback failed, emergency attention required");
        }
    }
}

fn relative_increase(baseline: f64, observed: f64) -> f64 {
    if baseline <= 0.0 {
        0.0
    } else {
        (observed - baseline) / baseline
    }
}

fn rollback_reason(obs: &StageObservation, baseline: &BaselineMetrics) -> Option<String> {
    if obs.error_rate > ROLLBACK_ERROR_RATE {
        return Some(format!("error rate spike: {:.1}%", obs.error_rate * 100.0));
    }
    if relative_increase(baseline.avg_latency_ms, obs.avg_latency_ms) > ROLLBACK_LATENCY_INCREASE {
        return Some(format!(
            "latency increase: {:.0}ms vs baseline {:.0}ms",
            obs.avg_latency_ms, baseline.avg_latency_ms
        ));
    }
    if relative_increase(baseline.avg_cost, obs.avg_cost) > ROLLBACK_COST_INCREASE {
        return Some(format!(
            "cost increase: {:.4} vs baseline {:.4}",
            obs.avg_cost, baseline.avg_cost
        ));
    }
    if baseline.win_rate - obs.win_rate > ROLLBACK_WIN_RATE_DROP {
        return Some(format!(
            "win rate drop: {:.2} vs baseline {:.2}",
            obs.win_rate, baseline.win_rate
        ));
    }
    None
}
