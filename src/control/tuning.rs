//! Weekly retraining hook.
//!
//! Reads accumulated metric records (the JSON-lines log plus whatever is
//! still in memory), rejects underpowered runs, balances the sample by
//! bucket, hands the data to an external trainer process, and pushes the
//! resulting artifact candidate into a canary rollout. The training process
//! itself is opaque: any command that reads JSONL records on stdin and
//! writes an artifact JSON on stdout qualifies.
//!
//! Runs are single-flight: a tick that fires while a run is still going is
//! skipped.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    artifact::{Artifact, ArtifactBundle},
    config::ControlConfig,
    control::canary::{BaselineMetrics, CanaryController},
    metrics::{MetricRecord, MetricsEngine},
    triage::Bucket,
};

/// Outcome of one tuning attempt, for logs and tests.
#[derive(Debug, PartialEq, Eq)]
pub enum TuningOutcome {
    /// Another run is still in flight.
    Skipped,
    /// No trainer command configured.
    Disabled,
    /// Fewer samples than the configured minimum.
    Underpowered { samples: usize },
    /// Trainer failed or produced an invalid candidate.
    TrainerFailed,
    /// Candidate validated and handed to the canary controller.
    CandidateStaged { version: String },
}

pub struct TuningPipeline {
    min_samples: usize,
    trainer_cmd: Option<String>,
    logs_path: Option<String>,
    candidates: Vec<String>,
    engine: Arc<MetricsEngine>,
    canary: Arc<CanaryController>,
    /// Where the validated candidate bundle is staged for the splitter.
    slot: crate::router::CanarySlot,
    in_progress: AtomicBool,
}

impl TuningPipeline {
    pub fn new(
        cfg: &ControlConfig,
        logs_path: Option<String>,
        candidates: Vec<String>,
        engine: Arc<MetricsEngine>,
        canary: Arc<CanaryController>,
        slot: crate::router::CanarySlot,
    ) -> Self {
        Self {
            min_samples: cfg.tuning_min_samples,
            trainer_cmd: cfg.trainer_cmd.clone(),
            logs_path,
            candidates,
            engine,
            canary,
            slot,
            in_progress: AtomicBool::new(false),
        }
    }

    /// One tuning attempt end-to-end.
    pub async fn run(&self) -> TuningOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("tuning run already in progress, skipping");
            return TuningOutcome::Skipped;
        }
        let outcome = self.run_inner().await;
        self.in_progress.store(false, Ordering::Release);
        outcome
    }

    async fn run_inner(&self) -> TuningOutcome {
        let Some(cmd) = &self.trainer_cmd else {
            return TuningOutcome::Disabled;
        };

        let mut records = self.read_log_records().await;
        records.extend(self.engine.recent(None));
        if records.len() < self.min_samples {
            info!(samples = records.len(), min = self.min_samples, "tuning run underpowered");
            return TuningOutcome::Underpowered { samples: records.len() };
        }

        let balanced = balance_by_bucket(records);
        info!(samples = balanced.len(), "invoking trainer");

        let candidate = match self.invoke_trainer(cmd, &balanced).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(error = %e, "trainer invocation failed");
                return TuningOutcome::TrainerFailed;
            }
        };

        // Staging gate: the candidate must validate exactly like a fetched
        // artifact before any traffic sees it.
        let Some(matrix) = crate::artifact::inline_centroid_matrix(&candidate) else {
            warn!("trainer candidate has no inline centroid matrix");
            return TuningOutcome::TrainerFailed;
        };
        let bundle = match ArtifactBundle::build(candidate.clone(), matrix, &self.candidates) {
            Ok(bundle) => Arc::new(bundle),
            Err(e) => {
                warn!(error = %e, "trainer candidate failed validation");
                return TuningOutcome::TrainerFailed;
            }
        };

        let snapshot = self.engine.snapshot(None);
        let baseline = BaselineMetrics {
            win_rate: snapshot.win_rate_overall,
            avg_cost: snapshot.cost_overall.mean,
            avg_latency_ms: snapshot.avg_latency_ms,
        };
        match self.canary.start(&candidate.version, baseline) {
            Ok(id) => {
                *self.slot.write().expect("canary slot poisoned") = Some(bundle);
                info!(rollout = %id, version = %candidate.version, "tuning candidate staged");
                TuningOutcome::CandidateStaged { version: candidate.version }
            }
            Err(e) => {
                warn!(error = %e, "could not stage tuning candidate");
                TuningOutcome::TrainerFailed
            }
        }
    }

    async fn read_log_records(&self) -> Vec<MetricRecord> {
        let Some(path) = &self.logs_path else {
            return Vec::new();
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn invoke_trainer(
        &self,
        cmd: &str,
        records: &[MetricRecord],
    ) -> anyhow::Result<Artifact> {
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        let mut payload = String::new();
        for record in records {
            payload.push_str(&serde_json::to_string(record)?);
            payload.push('\n');
        }
        stdin.write_all(payload.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        anyhow::ensure!(output.status.success(), "trainer exited with {}", output.status);

        let mut artifact: Artifact = serde_json::from_slice(&output.stdout)?;
        if artifact.version.is_empty() {
            artifact.version = Utc::now().to_rfc3339();
        }
        Ok(artifact)
    }
}

/// Downsample so every observed bucket contributes equally.
fn balance_by_bucket(records: Vec<MetricRecord>) -> Vec<MetricRecord> {
    let mut grouped: HashMap<Bucket, Vec<MetricRecord>> = HashMap::new();
    for r in records {
        grouped.entry(r.bucket).or_default().push(r);
    }
    let floor = grouped.values().map(Vec::len).min().unwrap_or(0);
    grouped
        .into_values()
        .flat_map(|mut rs| {
            rs.truncate(floor);
            rs
        })
        .collect()
}

/// Background task: fires on the weekly cron schedule. Never exits.
pub async fn tuning_loop(pipeline: Arc<TuningPipeline>, cfg: ControlConfig) {
    let schedule = cron::Schedule::from_str(&cfg.tuning_cron)
        .expect("tuning cron validated at config load");
    loop {
        let wait = schedule
            .upcoming(Utc)
            .next()
            .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_secs(24 * 3600));
        tokio::time::sleep(wait).await;
        pipeline.run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricsConfig, SloConfig};
    use crate::control::canary::CanaryGates;
    use crate::executor::cooldown::CooldownTable;
    use crate::metrics::test_record;
    use crate::providers::ProviderKind;

    fn engine() -> Arc<MetricsEngine> {
        let cfg = MetricsConfig {
            buffer_capacity: 10_000,
            warehouse_url: None,
            logs_path: None,
            emit_queue_capacity: 8,
        };
        Arc::new(MetricsEngine::new(
            &cfg,
            SloConfig::default(),
            Arc::new(CooldownTable::new()),
        ))
    }

    fn canary() -> Arc<CanaryController> {
        Arc::new(CanaryController::new(CanaryGates {
            min_samples_per_stage: 100,
            min_stage_minutes: 15,
        }))
    }

    fn pipeline(trainer_cmd: Option<&str>, engine: Arc<MetricsEngine>) -> TuningPipeline {
        let cfg = ControlConfig {
            trainer_cmd: trainer_cmd.map(str::to_string),
            tuning_min_samples: 10,
            ..ControlConfig::default()
        };
        let slot = Arc::new(std::sync::RwLock::new(None));
        TuningPipeline::new(&cfg, None, vec![], engine, canary(), slot)
    }

    fn seed(engine: &MetricsEngine, n: usize) {
        for i in 0..n {
            let bucket = match i % 3 {
                0 => Bucket::Cheap,
                1 => Bucket::Mid,
                _ => Bucket::Hard,
            };
            engine.record(test_record(bucket, ProviderKind::OpenAI, true));
        }
    }

    // -----------------------------------------------------------------------
    // Gate conditions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn disabled_without_trainer_command() {
        let e = engine();
        seed(&e, 100);
        assert_eq!(pipeline(None, e).run().await, TuningOutcome::Disabled);
    }

    #[tokio::test]
    async fn underpowered_run_is_rejected() {
        let e = engine();
        seed(&e, 3);
        let outcome = pipeline(Some("cat"), e).run().await;
        assert_eq!(outcome, TuningOutcome::Underpowered { samples: 3 });
    }

    #[tokio::test]
    async fn failing_trainer_is_reported() {
        let e = engine();
        seed(&e, 100);
        let outcome = pipeline(Some("exit 3"), e).run().await;
        assert_eq!(outcome, TuningOutcome::TrainerFailed);
    }

    #[tokio::test]
    async fn garbage_trainer_output_is_rejected() {
        let e = engine();
        seed(&e, 100);
        let outcome = pipeline(Some("echo not-json"), e).run().await;
        assert_eq!(outcome, TuningOutcome::TrainerFailed);
    }

    #[tokio::test]
    async fn valid_candidate_is_staged_into_a_canary() {
        let e = engine();
        seed(&e, 100);

        // A trainer that emits a minimal valid artifact.
        let mut candidate = Artifact::emergency_for(&[]);
        candidate.version = "v-tuned-1".into();
        let artifact = serde_json::to_string(&candidate).unwrap();
        let cmd = format!("cat > /dev/null; echo '{artifact}'");
        let p = pipeline(Some(&cmd), e);

        match p.run().await {
            TuningOutcome::CandidateStaged { version } => assert_eq!(version, "v-tuned-1"),
            other => panic!("expected staged candidate, got {other:?}"),
        }
        assert!(p.canary.snapshot().is_some());
        assert!(p.slot.read().unwrap().is_some(), "bundle staged for the splitter");
    }

    // -----------------------------------------------------------------------
    // Balancing
    // -----------------------------------------------------------------------

    #[test]
    fn balance_downsamples_to_smallest_bucket() {
        let mut records = Vec::new();
        for _ in 0..9 {
            records.push(test_record(Bucket::Cheap, ProviderKind::OpenAI, true));
        }
        for _ in 0..6 {
            records.push(test_record(Bucket::Mid, ProviderKind::OpenAI, true));
        }
        for _ in 0..3 {
            records.push(test_record(Bucket::Hard, ProviderKind::OpenAI, true));
        }

        let balanced = balance_by_bucket(records);
        assert_eq!(balanced.len(), 9);
        for bucket in [Bucket::Cheap, Bucket::Mid, Bucket::Hard] {
            assert_eq!(balanced.iter().filter(|r| r.bucket == bucket).count(), 3);
        }
    }

    #[test]
    fn balance_of_empty_input_is_empty() {
        assert!(balance_by_bucket(Vec::new()).is_empty());
    }
}
