//! In-bucket α-score model selection.
//!
//! Every candidate is scored `α·quality − (1−α)·cost − penalty` against the
//! current artifact. Quality is the per-cluster `qhat` entry (mean over
//! clusters when the request's cluster has no score); cost is the normalized
//! `chat` entry. Candidates missing either table are disqualified. Ties break
//! on input order, so the configured candidate order is the final tiebreak.
//!
//! Exploration is opt-in: with probability ε the pick is uniform over the
//! top-N scorers, seeded per request so replays are reproducible.

use std::collections::HashMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::warn;

use crate::artifact::Artifact;
use crate::config::SelectorConfig;
use crate::features::Features;

/// Context-ratio level above which the long-context penalty applies.
const CTX_PENALTY_THRESHOLD: f64 = 0.8;

/// Token count above which non-Gemini candidates are penalized.
const LONG_CONTEXT_TOKENS: u64 = 100_000;

/// The selector's verdict for one request.
#[derive(Debug, Clone)]
pub struct Selection {
    pub model: String,
    pub score: f64,
    /// True when the ε-greedy path chose among the top-N instead of greedy.
    pub explored: bool,
}

/// Pick the best candidate inside the chosen bucket.
///
/// `latency_variance` maps model slug → relative latency variance observed
/// recently (empty when no history exists). `seed` drives the exploration
/// RNG and should be derived from the request id.
pub fn select(
    candidates: &[String],
    features: &Features,
    artifact: &Artifact,
    cfg: &SelectorConfig,
    latency_variance: &HashMap<String, f64>,
    seed: u64,
) -> Option<Selection> {
    if candidates.is_empty() {
        warn!("selector called with an empty candidate list");
        return None;
    }

    let mut scored: Vec<(usize, f64)> = Vec::with_capacity(candidates.len());
    for (i, model) in candidates.iter().enumerate() {
        match score(model, features, artifact, latency_variance) {
            Some(s) => scored.push((i, s)),
            None => warn!(%model, "candidate disqualified: missing qhat/chat entry"),
        }
    }

    if scored.is_empty() {
        // Nothing qualified — fall back to the configured first candidate.
        return Some(Selection {
            model: candidates[0].clone(),
            score: 0.0,
            explored: false,
        });
    }

    // Greedy winner: strictly-greater comparison keeps the earliest index on ties.
    let &(best_idx, best_score) = scored
        .iter()
        .reduce(|best, cur| if cur.1 > best.1 { cur } else { best })
        .expect("scored is non-empty");

    if cfg.epsilon > 0.0 {
        let mut rng = StdRng::seed_from_u64(seed);
        if rng.gen_range(0.0..1.0) < cfg.epsilon {
            let mut ranked = scored.clone();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            ranked.truncate(cfg.exploration_top_n.max(1));
            let &(idx, s) = &ranked[rng.gen_range(0..ranked.len())];
            return Some(Selection {
                model: candidates[idx].clone(),
                score: s,
                explored: true,
            });
        }
    }

    Some(Selection {
        model: candidates[best_idx].clone(),
        score: best_score,
        explored: false,
    })
}

/// α-score for one candidate; `None` disqualifies.
fn score(
    model: &str,
    features: &Features,
    artifact: &Artifact,
    latency_variance: &HashMap<String, f64>,
) -> Option<f64> {
    let cluster_scores = artifact.qhat.get(model)?;
    let cost = *artifact.chat.get(model)?;

    let quality = cluster_scores
        .get(features.cluster_id)
        .copied()
        .unwrap_or_else(|| {
            cluster_scores.iter().sum::<f64>() / cluster_scores.len().max(1) as f64
        });

    let mut penalty = 0.0;
    if features.context_ratio > CTX_PENALTY_THRESHOLD {
        penalty += artifact.penalties.ctx_over_80pct;
    }
    penalty += artifact.penalties.latency_sd
        * latency_variance.get(model).copied().unwrap_or(0.0);
    penalty += model_adjustment(model, features);

    let alpha = artifact.alpha;
    Some(alpha * quality - (1.0 - alpha) * cost - penalty)
}

/// The closed set of model-specific score adjustments, expressed as a
/// penalty delta (negative values are bonuses).
fn model_adjustment(model: &str, features: &Features) -> f64 {
    let mut adj = 0.0;
    if features.has_code && model.contains("deepseek") {
        adj -= 0.05;
    }
    if features.has_math && !is_reasoning_model(model) {
        adj += 0.10;
    }
    if features.tokens > LONG_CONTEXT_TOKENS && !model.contains("gemini") {
        adj += 0.15;
    }
    adj
}

/// Whether a slug names a model with a latent-reasoning mode.
pub(crate) fn is_reasoning_model(model: &str) -> bool {
    (model.contains("gpt-5") && !model.contains("mini") && !model.contains("nano"))
        || model.contains("claude-opus")
        || model.contains("claude-sonnet")
        || model.contains("gemini-2.5-pro")
        || model.contains("reasoner")
}
