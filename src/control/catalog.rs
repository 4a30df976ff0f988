//! Catalog refresh: nightly full diff plus a lighter 6-hour drift check.
//!
//! The catalog service reports per-provider model listings (price, context
//! window, capability bits). A full refresh diffs the fresh listing against
//! the previous snapshot and records every change with a normalized
//! magnitude; any significant change (≥ 0.3) invalidates the routing
//! artifact, forcing the store to refetch and demote the old version into
//! its backup list. The drift check touches only five well-known models and
//! triggers an immediate full refresh when one of them moved far (≥ 0.5).

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::config::ControlConfig;

/// Change magnitude at or above which a catalog change is significant.
const SIGNIFICANT_MAGNITUDE: f64 = 0.3;

/// Drift magnitude at or above which a full refresh is scheduled immediately.
const DRIFT_MAGNITUDE: f64 = 0.5;

/// Bounded history of recorded changes.
const CHANGE_LOG_CAPACITY: usize = 256;

/// Models probed by the lightweight drift check.
const DRIFT_PROBE_MODELS: [&str; 5] = [
    "openai/gpt-5",
    "openai/gpt-5-mini",
    "anthropic/claude-sonnet-4",
    "google/gemini-2.5-pro",
    "google/gemini-2.5-flash",
];

/// One model's catalog listing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CatalogEntry {
    pub slug: String,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub context_window: u64,
    #[serde(default)]
    pub supports_reasoning: bool,
}

/// A recorded catalog change.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogChange {
    pub slug: String,
    pub field: String,
    pub magnitude: f64,
    pub significant: bool,
    pub at: DateTime<Utc>,
}

/// Drives the refresh schedule and owns the previous snapshot.
pub struct CatalogRefresher {
    base_url: Option<String>,
    client: reqwest::Client,
    store: Arc<ArtifactStore>,
    previous: Mutex<HashMap<String, CatalogEntry>>,
    changes: Mutex<Vec<CatalogChange>>,
}

impl CatalogRefresher {
    pub fn new(cfg: &ControlConfig, store: Arc<ArtifactStore>) -> Self {
        let base_url = std::env::var("CATALOG_SERVICE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| cfg.catalog_url.clone());
        Self {
            base_url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(cfg.catalog_timeout_ms))
                .build()
                .expect("failed to build reqwest client"),
            store,
            previous: Mutex::new(HashMap::new()),
            changes: Mutex::new(Vec::new()),
        }
    }

    /// Recorded changes, newest first.
    pub fn recent_changes(&self) -> Vec<CatalogChange> {
        self.changes.lock().expect("change log poisoned").clone()
    }

    /// Full refresh: fetch, diff, record, and invalidate on significance.
    pub async fn full_refresh(&self) {
        let Some(base) = &self.base_url else {
            return; // no catalog service configured
        };
        let fresh = match self.fetch_catalog(base).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "catalog fetch failed, keeping previous snapshot");
                return;
            }
        };

        let significant = {
            let mut previous = self.previous.lock().expect("catalog snapshot poisoned");
            let diffs = diff_catalogs(&previous, &fresh);
            let significant = diffs.iter().filter(|c| c.significant).count();

            let mut log = self.changes.lock().expect("change log poisoned");
            for change in diffs {
                log.insert(0, change);
            }
            log.truncate(CHANGE_LOG_CAPACITY);

            *previous = fresh;
            significant
        };

        if significant >= 1 {
            info!(significant, "significant catalog changes, invalidating artifact");
            self.store.load(true).await;
        }
    }

    /// Drift check over the five probe models only.
    pub async fn drift_check(&self) {
        let Some(base) = &self.base_url else { return };
        let fresh = match self.fetch_catalog(base).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "drift check fetch failed");
                return;
            }
        };

        let drifted = {
            let previous = self.previous.lock().expect("catalog snapshot poisoned");
            DRIFT_PROBE_MODELS.iter().any(|slug| {
                match (previous.get(*slug), fresh.get(*slug)) {
                    (Some(old), Some(new)) => {
                        entry_changes(old, new).iter().any(|(_, m)| *m >= DRIFT_MAGNITUDE)
                    }
                    _ => false,
                }
            })
        };

        if drifted {
            info!("drift check exceeded threshold, running immediate full refresh");
            self.full_refresh().await;
        }
    }

    async fn fetch_catalog(&self, base: &str) -> anyhow::Result<HashMap<String, CatalogEntry>> {
        let url = format!("{}/catalog", base.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        anyhow::ensure!(
            response.status().is_success(),
            "catalog service returned HTTP {}",
            response.status()
        );
        let entries: Vec<CatalogEntry> = response.json().await?;
        Ok(entries.into_iter().map(|e| (e.slug.clone(), e)).collect())
    }
}

/// Normalized per-field change magnitudes between two listings of one model.
fn entry_changes(old: &CatalogEntry, new: &CatalogEntry) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    for (field, a, b) in [
        ("input_price", old.input_price_per_million, new.input_price_per_million),
        ("output_price", old.output_price_per_million, new.output_price_per_million),
        ("context_window", old.context_window as f64, new.context_window as f64),
    ] {
        if a != b {
            let magnitude = if a == 0.0 { 1.0 } else { ((b - a) / a).abs() };
            out.push((field.to_string(), magnitude));
        }
    }
    if old.supports_reasoning != new.supports_reasoning {
        out.push(("supports_reasoning".to_string(), 1.0));
    }
    out
}

fn diff_catalogs(
    previous: &HashMap<String, CatalogEntry>,
    fresh: &HashMap<String, CatalogEntry>,
) -> Vec<CatalogChange> {
    let now = Utc::now();
    let mut changes = Vec::new();
    for (slug, new) in fresh {
        let Some(old) = previous.get(slug) else { continue };
        for (field, magnitude) in entry_changes(old, new) {
            changes.push(CatalogChange {
                slug: slug.clone(),
                field,
                magnitude,
                significant: magnitude >= SIGNIFICANT_MAGNITUDE,
                at: now,
            });
        }
    }
    changes
}

/// Background task: nightly full refresh (cron) interleaved with the drift
/// interval. Never exits.
pub async fn refresh_loop(refresher: Arc<CatalogRefresher>, cfg: ControlConfig) {
    let schedule = cron::Schedule::from_str(&cfg.catalog_cron)
        .expect("catalog cron validated at config load");
    let drift_every = Duration::from_secs(cfg.drift_check_secs);
    let mut drift_ticker = tokio::time::interval(drift_every);
    drift_ticker.tick().await; // immediate first tick is skipped

    loop {
        let next_full = schedule
            .upcoming(Utc)
            .next()
            .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(drift_every);

        tokio::select! {
            _ = tokio::time::sleep(next_full) => {
                refresher.full_refresh().await;
            }
            _ = drift_ticker.tick() => {
                refresher.drift_check().await;
            }
        }
    }
}
