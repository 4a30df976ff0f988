//! Routing-artifact store: load, validate, cache, hot-reload.
//!
//! The artifact is the policy in force — alpha, triage thresholds, penalty
//! weights, per-cluster quality scores, normalized costs, and handles to the
//! triage model and centroid matrix. The store owns the current artifact
//! exclusively; every reader takes an `Arc` snapshot that stays consistent
//! for the life of one request, and replacement swaps the `Arc` without
//! tearing a read in progress.
//!
//! Load order: in-memory copy while fresh → remote source (scheme-dispatched:
//! local file, HTTP(S), object store) → on-disk known-good copy → synthesized
//! emergency artifact with deterministic defaults, flagged degraded.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ArtifactConfig;
use crate::features::CentroidIndex;
use crate::triage::TriageModel;

/// Maximum demoted artifacts retained for rollback.
const BACKUP_CAPACITY: usize = 3;

/// File name of the on-disk known-good copy inside the cache directory.
const CACHE_FILE: &str = "latest.json";

/// Triage cut-offs, both in `[0, 1]`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Thresholds {
    pub cheap: f64,
    pub hard: f64,
}

/// Non-negative penalty weights applied by the selector.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Penalties {
    pub latency_sd: f64,
    pub ctx_over_80pct: f64,
}

/// Handle to the triage model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GbdtHandle {
    /// Framework tag: `trees` (built-in ensemble interpreter) or `emergency`.
    pub framework: String,
    /// Inline model payload. Empty when `model_path` is used instead.
    #[serde(default)]
    pub model: Value,
    /// Asset path resolved relative to the artifact URL base.
    #[serde(default)]
    pub model_path: Option<String>,
    /// Ordered feature names the model expects as input.
    #[serde(default)]
    pub feature_schema: Vec<String>,
}

/// The routing policy in force, versioned by an opaque string.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Artifact {
    pub version: String,
    /// Quality-vs-cost weight in `[0, 1]`.
    pub alpha: f64,
    pub thresholds: Thresholds,
    pub penalties: Penalties,
    /// model slug → K per-cluster quality scores in `[0, 1]`.
    pub qhat: HashMap<String, Vec<f64>>,
    /// model slug → normalized cost score in `[0, 1]`.
    pub chat: HashMap<String, f64>,
    pub gbdt: GbdtHandle,
    /// Either an inline K×D centroid matrix or an asset path string
    /// resolved relative to the artifact URL base.
    pub centroids: Value,
}

impl Artifact {
    /// Hard-coded emergency artifact for the given candidate slugs.
    ///
    /// Deterministic defaults: every candidate scores quality 0.6 and cost
    /// 0.5 over a single cluster, so the selector degenerates to first-wins
    /// order while the store is degraded.
    pub fn emergency_for(candidates: &[String]) -> Self {
        let qhat = candidates
            .iter()
            .map(|m| (m.clone(), vec![0.6]))
            .collect();
        let chat = candidates.iter().map(|m| (m.clone(), 0.5)).collect();
        Self {
            version: "emergency".into(),
            alpha: 0.5,
            thresholds: Thresholds { cheap: 0.5, hard: 0.5 },
            penalties: Penalties { latency_sd: 0.05, ctx_over_80pct: 0.1 },
            qhat,
            chat,
            gbdt: GbdtHandle {
                framework: "emergency".into(),
                model: Value::Null,
                model_path: None,
                feature_schema: vec![
                    "tokens".into(),
                    "has_code".into(),
                    "has_math".into(),
                    "ngram_entropy".into(),
                    "context_ratio".into(),
                    "cluster_id".into(),
                ],
            },
            centroids: serde_json::json!([[0.0]]),
        }
    }

    /// Emergency artifact over the default candidate lists.
    pub fn emergency() -> Self {
        let buckets = crate::config::BucketsConfig::default();
        let candidates: Vec<String> = buckets
            .cheap
            .candidates
            .iter()
            .chain(&buckets.mid.candidates)
            .chain(&buckets.hard.candidates)
            .cloned()
            .collect();
        Self::emergency_for(&candidates)
    }
}

/// A validated artifact with its resolved collaborators.
#[derive(Debug)]
pub struct ArtifactBundle {
    pub artifact: Artifact,
    pub index: CentroidIndex,
    pub triage: TriageModel,
}

impl ArtifactBundle {
    /// Resolve assets, parse the triage model, and check the §3 invariants.
    pub fn build(
        artifact: Artifact,
        centroid_matrix: Vec<Vec<f32>>,
        candidates: &[String],
    ) -> anyhow::Result<Self> {
        validate(&artifact, centroid_matrix.len(), candidates)?;
        let triage = TriageModel::from_handle(&artifact.gbdt);
        Ok(Self {
            artifact,
            index: CentroidIndex::new(centroid_matrix),
            triage,
        })
    }
}

/// Artifact invariants from the data model.
fn validate(artifact: &Artifact, k: usize, candidates: &[String]) -> anyhow::Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&artifact.alpha),
        "alpha must be in [0, 1], got {}",
        artifact.alpha
    );
    for (name, v) in [
        ("thresholds.cheap", artifact.thresholds.cheap),
        ("thresholds.hard", artifact.thresholds.hard),
    ] {
        anyhow::ensure!((0.0..=1.0).contains(&v), "{name} must be in [0, 1], got {v}");
    }
    for (name, v) in [
        ("penalties.latency_sd", artifact.penalties.latency_sd),
        ("penalties.ctx_over_80pct", artifact.penalties.ctx_over_80pct),
    ] {
        anyhow::ensure!(v >= 0.0, "{name} must be non-negative, got {v}");
    }
    anyhow::ensure!(k > 0, "centroid matrix is empty");

    for model in candidates {
        let q = artifact
            .qhat
            .get(model)
            .with_context(|| format!("candidate `{model}` missing from qhat"))?;
        anyhow::ensure!(
            q.len() == k,
            "qhat[`{model}`] has {} scores but the index has {k} clusters",
            q.len()
        );
        anyhow::ensure!(
            artifact.chat.contains_key(model),
            "candidate `{model}` missing from chat"
        );
    }
    for (model, scores) in &artifact.qhat {
        anyhow::ensure!(
            scores.iter().all(|s| (0.0..=1.0).contains(s)),
            "qhat[`{model}`] contains scores outside [0, 1]"
        );
    }
    for (model, cost) in &artifact.chat {
        anyhow::ensure!(
            (0.0..=1.0).contains(cost),
            "chat[`{model}`] = {cost} is outside [0, 1]"
        );
    }
    Ok(())
}

struct Loaded {
    bundle: Arc<ArtifactBundle>,
    loaded_at: Instant,
}

/// Loads, validates, caches, and hot-reloads the routing artifact.
pub struct ArtifactStore {
    source_url: String,
    cache_dir: PathBuf,
    freshness: Duration,
    client: reqwest::Client,
    /// Flat candidate list used for invariant checks.
    candidates: Vec<String>,
    current: RwLock<Option<Loaded>>,
    backups: Mutex<Vec<Arc<ArtifactBundle>>>,
    /// True while the emergency artifact is in force.
    pub degraded: AtomicBool,
}

impl ArtifactStore {
    pub fn new(cfg: &ArtifactConfig, candidates: Vec<String>) -> Self {
        let source_url = std::env::var("ARTIFACT_STORE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| cfg.url.clone());
        Self {
            source_url,
            cache_dir: PathBuf::from(&cfg.cache_dir),
            freshness: Duration::from_secs(cfg.freshness_secs),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(cfg.timeout_ms))
                .build()
                .expect("failed to build reqwest client"),
            candidates,
            current: RwLock::new(None),
            backups: Mutex::new(Vec::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current artifact, if any load has completed.
    pub fn current(&self) -> Option<Arc<ArtifactBundle>> {
        self.current
            .read()
            .expect("artifact lock poisoned")
            .as_ref()
            .map(|l| Arc::clone(&l.bundle))
    }

    /// Demoted artifact versions, newest first.
    pub fn backups(&self) -> Vec<String> {
        self.backups
            .lock()
            .expect("backup lock poisoned")
            .iter()
            .map(|b| b.artifact.version.clone())
            .collect()
    }

    /// Load an artifact, observing freshness unless `force_refresh`.
    ///
    /// Never fails: the emergency artifact is the terminal fallback.
    pub async fn load(&self, force_refresh: bool) -> Arc<ArtifactBundle> {
        if !force_refresh {
            let guard = self.current.read().expect("artifact lock poisoned");
            if let Some(loaded) = guard.as_ref() {
                if loaded.loaded_at.elapsed() < self.freshness {
                    return Arc::clone(&loaded.bundle);
                }
            }
        }

        match self.fetch_and_build().await {
            Ok(bundle) => {
                let bundle = Arc::new(bundle);
                self.write_disk_cache(&bundle.artifact);
                self.install(Arc::clone(&bundle));
                self.degraded.store(false, Ordering::Relaxed);
                info!(version = %bundle.artifact.version, "artifact loaded");
                return bundle;
            }
            Err(e) => {
                warn!(url = %self.source_url, error = %e, "artifact fetch failed");
            }
        }

        // Keep serving the in-memory copy even when stale.
        if let Some(bundle) = self.current() {
            return bundle;
        }

        match self.load_disk_cache() {
            Ok(bundle) => {
                let bundle = Arc::new(bundle);
                self.install(Arc::clone(&bundle));
                self.degraded.store(false, Ordering::Relaxed);
                info!(version = %bundle.artifact.version, "artifact restored from disk cache");
                bundle
            }
            Err(e) => {
                warn!(error = %e, "no usable disk cache, synthesizing emergency artifact");
                let artifact = Artifact::emergency_for(&self.candidates);
                let matrix = parse_centroid_matrix(&artifact.centroids).unwrap_or(vec![vec![0.0]]);
                let bundle = Arc::new(
                    ArtifactBundle::build(artifact, matrix, &self.candidates)
                        .expect("emergency artifact must validate"),
                );
                self.install(Arc::clone(&bundle));
                self.degraded.store(true, Ordering::Relaxed);
                bundle
            }
        }
    }

    /// Publish an already-validated bundle (canary promotion path). The
    /// previous artifact is demoted to the backup list like any replacement.
    pub fn publish(&self, bundle: Arc<ArtifactBundle>) {
        self.write_disk_cache(&bundle.artifact);
        self.install(bundle);
        self.degraded.store(false, Ordering::Relaxed);
    }

    fn install(&self, bundle: Arc<ArtifactBundle>) {
        let mut guard = self.current.write().expect("artifact lock poisoned");
        if let Some(old) = guard.take() {
            if old.bundle.artifact.version != bundle.artifact.version {
                let mut backups = self.backups.lock().expect("backup lock poisoned");
                backups.insert(0, old.bundle);
                backups.truncate(BACKUP_CAPACITY);
            }
        }
        *guard = Some(Loaded {
            bundle,
            loaded_at: Instant::now(),
        });
    }

    async fn fetch_and_build(&self) -> anyhow::Result<ArtifactBundle> {
        let raw = self.fetch_url(&self.source_url).await?;
        let mut artifact: Artifact =
            serde_json::from_str(&raw).context("parsing artifact JSON")?;
        let matrix = self.resolve_centroids(&artifact).await?;
        if artifact.centroids.is_string() {
            // Inline the resolved matrix so the disk copy is self-contained.
            artifact.centroids =
                serde_json::to_value(&matrix).context("inlining centroid matrix")?;
        }
        let artifact = self.resolve_gbdt(artifact).await?;
        ArtifactBundle::build(artifact, matrix, &self.candidates)
    }

    async fn resolve_centroids(&self, artifact: &Artifact) -> anyhow::Result<Vec<Vec<f32>>> {
        match &artifact.centroids {
            Value::String(asset) => {
                let url = resolve_relative(&self.source_url, asset);
                let raw = self.fetch_url(&url).await.context("fetching centroid asset")?;
                let v: Value = serde_json::from_str(&raw).context("parsing centroid asset")?;
                parse_centroid_matrix(&v).context("centroid asset is not a numeric matrix")
            }
            inline => parse_centroid_matrix(inline).context("inline centroids are not a matrix"),
        }
    }

    async fn resolve_gbdt(&self, mut artifact: Artifact) -> anyhow::Result<Artifact> {
        if artifact.gbdt.model.is_null() {
            if let Some(asset) = artifact.gbdt.model_path.clone() {
                let url = resolve_relative(&self.source_url, &asset);
                let raw = self.fetch_url(&url).await.context("fetching gbdt asset")?;
                artifact.gbdt.model =
                    serde_json::from_str(&raw).context("parsing gbdt asset")?;
            }
        }
        Ok(artifact)
    }

    async fn fetch_url(&self, url: &str) -> anyhow::Result<String> {
        if let Some(path) = url.strip_prefix("file://") {
            return std::fs::read_to_string(path).with_context(|| format!("reading {path}"));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("GET {url}"))?;
            anyhow::ensure!(
                response.status().is_success(),
                "artifact source returned HTTP {}",
                response.status()
            );
            return response.text().await.context("reading artifact body");
        }
        if let Some(rest) = url.strip_prefix("s3://") {
            // Anonymous virtual-hosted access; credentialed clients are a
            // deployment concern.
            let (bucket, key) = rest
                .split_once('/')
                .context("s3 URL must be s3://bucket/key")?;
            let https = format!("https://{bucket}.s3.amazonaws.com/{key}");
            return Box::pin(self.fetch_url(&https)).await;
        }
        // Bare path — treat as local file.
        std::fs::read_to_string(url).with_context(|| format!("reading {url}"))
    }

    fn disk_cache_path(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE)
    }

    fn write_disk_cache(&self, artifact: &Artifact) {
        if let Err(e) = std::fs::create_dir_all(&self.cache_dir).and_then(|_| {
            let json = serde_json::to_string_pretty(artifact).expect("artifact serializes");
            std::fs::write(self.disk_cache_path(), json)
        }) {
            warn!(error = %e, "failed to write artifact disk cache");
        }
    }

    fn load_disk_cache(&self) -> anyhow::Result<ArtifactBundle> {
        let path = self.disk_cache_path();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let artifact: Artifact = serde_json::from_str(&raw).context("parsing cached artifact")?;
        let matrix =
            parse_centroid_matrix(&artifact.centroids).context("cached centroids not inline")?;
        ArtifactBundle::build(artifact, matrix, &self.candidates)
    }
}

/// The artifact's centroid matrix, when carried inline rather than as an
/// asset path. Trainer candidates are required to use the inline form.
pub fn inline_centroid_matrix(artifact: &Artifact) -> Option<Vec<Vec<f32>>> {
    parse_centroid_matrix(&artifact.centroids)
}

/// Parse an inline JSON matrix into centroid rows.
fn parse_centroid_matrix(v: &Value) -> Option<Vec<Vec<f32>>> {
    let rows = v.as_array()?;
    let mut matrix = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row.as_array()?;
        let mut out = Vec::with_capacity(cells.len());
        for c in cells {
            out.push(c.as_f64()? as f32);
        }
        matrix.push(out);
    }
    if matrix.is_empty() {
        None
    } else {
        Some(matrix)
    }
}

/// Resolve `asset` relative to the artifact URL base (everything up to the
/// last path segment).
fn resolve_relative(base: &str, asset: &str) -> String {
    if asset.contains("://") || Path::new(asset).is_absolute() {
        return asset.to_string();
    }
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], asset),
        None => asset.to_string(),
    }
}

/// Background task: hot-reloads the artifact on a fixed interval.
///
/// Failures inside `load` degrade gracefully on their own; this loop only
/// provides the cadence. The initial tick fires immediately and is skipped
/// so startup's explicit load is not repeated.
pub async fn reload_loop(store: Arc<ArtifactStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let before = store.current().map(|b| b.artifact.version.clone());
        let after = store.load(false).await.artifact.version.clone();
        if before.as_deref() != Some(after.as_str()) {
            info!(version = %after, "artifact hot-reloaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidates() -> Vec<String> {
        vec!["openai/gpt-5".into(), "google/gemini-2.5-pro".into()]
    }

    fn valid_artifact_json() -> Value {
        json!({
            "version": "2026-07-30T02:00:00Z",
            "alpha": 0.6,
            "thresholds": { "cheap": 0.55, "hard": 0.6 },
            "penalties": { "latency_sd": 0.05, "ctx_over_80pct": 0.1 },
            "qhat": {
                "openai/gpt-5": [0.8, 0.7],
                "google/gemini-2.5-pro": [0.75, 0.8],
            },
            "chat": {
                "openai/gpt-5": 0.65,
                "google/gemini-2.5-pro": 0.5,
            },
            "gbdt": {
                "framework": "emergency",
                "feature_schema": ["tokens", "has_code"],
            },
            "centroids": [[0.0, 0.0], [1.0, 1.0]],
        })
    }

    fn store_with_url(url: &str, cache_dir: &Path) -> ArtifactStore {
        let cfg = ArtifactConfig {
            url: url.to_string(),
            cache_dir: cache_dir.to_string_lossy().into_owned(),
            reload_secs: 300,
            freshness_secs: 600,
            timeout_ms: 2_000,
        };
        ArtifactStore::new(&cfg, candidates())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn valid_artifact_builds() {
        let artifact: Artifact = serde_json::from_value(valid_artifact_json()).unwrap();
        let matrix = parse_centroid_matrix(&artifact.centroids).unwrap();
        assert!(ArtifactBundle::build(artifact, matrix, &candidates()).is_ok());
    }

    #[test]
    fn rejects_alpha_out_of_range() {
        let mut v = valid_artifact_json();
        v["alpha"] = json!(1.5);
        let artifact: Artifact = serde_json::from_value(v).unwrap();
        let matrix = parse_centroid_matrix(&artifact.centroids).unwrap();
        assert!(ArtifactBundle::build(artifact, matrix, &candidates()).is_err());
    }

    #[test]
    fn rejects_candidate_missing_from_qhat() {
        let mut v = valid_artifact_json();
        v["qhat"].as_object_mut().unwrap().remove("openai/gpt-5");
        let artifact: Artifact = serde_json::from_value(v).unwrap();
        let matrix = parse_centroid_matrix(&artifact.centroids).unwrap();
        assert!(ArtifactBundle::build(artifact, matrix, &candidates()).is_err());
    }

    #[test]
    fn rejects_qhat_length_mismatch_with_cluster_count() {
        let mut v = valid_artifact_json();
        v["qhat"]["openai/gpt-5"] = json!([0.8]); // K is 2
        let artifact: Artifact = serde_json::from_value(v).unwrap();
        let matrix = parse_centroid_matrix(&artifact.centroids).unwrap();
        assert!(ArtifactBundle::build(artifact, matrix, &candidates()).is_err());
    }

    #[test]
    fn rejects_negative_penalties() {
        let mut v = valid_artifact_json();
        v["penalties"]["latency_sd"] = json!(-0.1);
        let artifact: Artifact = serde_json::from_value(v).unwrap();
        let matrix = parse_centroid_matrix(&artifact.centroids).unwrap();
        assert!(ArtifactBundle::build(artifact, matrix, &candidates()).is_err());
    }

    #[test]
    fn rejects_cost_score_out_of_range() {
        let mut v = valid_artifact_json();
        v["chat"]["openai/gpt-5"] = json!(1.8);
        let artifact: Artifact = serde_json::from_value(v).unwrap();
        let matrix = parse_centroid_matrix(&artifact.centroids).unwrap();
        assert!(ArtifactBundle::build(artifact, matrix, &candidates()).is_err());
    }

    // -----------------------------------------------------------------------
    // Round-trip
    // -----------------------------------------------------------------------

    #[test]
    fn serialize_reload_round_trip_is_equivalent() {
        let artifact: Artifact = serde_json::from_value(valid_artifact_json()).unwrap();
        let json = serde_json::to_string(&artifact).unwrap();
        let reloaded: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(artifact, reloaded);
    }

    // -----------------------------------------------------------------------
    // Load paths
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn loads_from_http_source_and_writes_disk_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(valid_artifact_json()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url(&format!("{}/artifact.json", server.uri()), dir.path());

        let bundle = store.load(false).await;
        assert_eq!(bundle.artifact.version, "2026-07-30T02:00:00Z");
        assert!(!store.degraded.load(Ordering::Relaxed));
        assert!(dir.path().join("latest.json").exists());
    }

    #[tokio::test]
    async fn fresh_in_memory_copy_short_circuits_refetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(valid_artifact_json()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url(&format!("{}/artifact.json", server.uri()), dir.path());

        store.load(false).await;
        store.load(false).await; // second call must hit the in-memory copy
    }

    #[tokio::test]
    async fn force_refresh_bypasses_freshness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(valid_artifact_json()))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url(&format!("{}/artifact.json", server.uri()), dir.path());

        store.load(false).await;
        store.load(true).await;
    }

    #[tokio::test]
    async fn fetch_failure_falls_back_to_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let artifact: Artifact = serde_json::from_value(valid_artifact_json()).unwrap();
        std::fs::write(
            dir.path().join("latest.json"),
            serde_json::to_string(&artifact).unwrap(),
        )
        .unwrap();

        let store = store_with_url("http://127.0.0.1:9/unreachable.json", dir.path());
        let bundle = store.load(false).await;
        assert_eq!(bundle.artifact.version, "2026-07-30T02:00:00Z");
        assert!(!store.degraded.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn no_source_and_no_cache_yields_emergency_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url("http://127.0.0.1:9/unreachable.json", dir.path());

        let bundle = store.load(false).await;
        assert_eq!(bundle.artifact.version, "emergency");
        assert!(store.degraded.load(Ordering::Relaxed));
        // Emergency policy still satisfies the candidate invariant.
        for c in candidates() {
            assert!(bundle.artifact.qhat.contains_key(&c));
            assert!(bundle.artifact.chat.contains_key(&c));
        }
    }

    #[tokio::test]
    async fn invalid_remote_artifact_keeps_prior_copy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(valid_artifact_json()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url(&format!("{}/artifact.json", server.uri()), dir.path());
        store.load(false).await;

        // Replace the mock with an invalid payload and force a refresh.
        server.reset().await;
        let mut bad = valid_artifact_json();
        bad["alpha"] = json!(7.0);
        bad["version"] = json!("bad");
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bad))
            .mount(&server)
            .await;

        let bundle = store.load(true).await;
        assert_eq!(bundle.artifact.version, "2026-07-30T02:00:00Z");
    }

    #[tokio::test]
    async fn replaced_artifact_is_demoted_to_bounded_backups() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url(&format!("{}/artifact.json", server.uri()), dir.path());

        for i in 0..5 {
            server.reset().await;
            let mut v = valid_artifact_json();
            v["version"] = json!(format!("v{i}"));
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(v))
                .mount(&server)
                .await;
            store.load(true).await;
        }

        let backups = store.backups();
        assert_eq!(backups.len(), BACKUP_CAPACITY);
        // Newest demotion first
        assert_eq!(backups[0], "v3");
    }

    #[tokio::test]
    async fn centroid_asset_is_resolved_relative_to_artifact_url() {
        let server = MockServer::start().await;
        let mut v = valid_artifact_json();
        v["centroids"] = json!("centroids.json");
        Mock::given(method("GET"))
            .and(path("/policy/artifact.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(v))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/policy/centroids.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([[0.0, 0.0], [1.0, 1.0]])),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_with_url(&format!("{}/policy/artifact.json", server.uri()), dir.path());
        let bundle = store.load(false).await;
        assert_eq!(bundle.index.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn resolve_relative_joins_on_base_directory() {
        assert_eq!(
            resolve_relative("https://x.example/policy/artifact.json", "centroids.json"),
            "https://x.example/policy/centroids.json"
        );
        assert_eq!(
            resolve_relative("file:///srv/a/artifact.json", "gbdt.json"),
            "file:///srv/a/gbdt.json"
        );
        // Absolute asset URLs pass through
        assert_eq!(
            resolve_relative("https://x.example/a.json", "https://y.example/c.json"),
            "https://y.example/c.json"
        );
    }

    #[test]
    fn parse_centroid_matrix_rejects_ragged_or_empty_input() {
        assert!(parse_centroid_matrix(&json!([])).is_none());
        assert!(parse_centroid_matrix(&json!("path.json")).is_none());
        assert!(parse_centroid_matrix(&json!([[1.0, "x"]])).is_none());
    }
}
