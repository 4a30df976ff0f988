//! Bucket triage: cheap / mid / hard probabilities from request features.
//!
//! The classifier is polymorphic over `{schema, score}` through the
//! [`TriageModel`] enum, discriminated by the artifact's `gbdt.framework`
//! tag. The `trees` framework is a gradient-boosted ensemble interpreter
//! over the artifact's JSON model payload; `emergency` is a hand-tuned rule
//! set that is always available as the terminal fallback.
//!
//! `predict` assembles the numeric input in the artifact's feature-schema
//! order (unknown names zero-imputed), evaluates the model, and softmax
//! normalizes, so the output components are non-negative and sum to 1.

use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, GbdtHandle};
use crate::features::Features;

/// Quality tier a request is routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Cheap,
    Mid,
    Hard,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cheap => "cheap",
            Self::Mid => "mid",
            Self::Hard => "hard",
        }
    }

    /// One escalation step; `hard` saturates.
    pub fn escalate(self) -> Self {
        match self {
            Self::Cheap => Self::Mid,
            Self::Mid | Self::Hard => Self::Hard,
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-negative triage probabilities summing to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketProbs {
    pub cheap: f64,
    pub mid: f64,
    pub hard: f64,
}

impl BucketProbs {
    fn one_hot(bucket: Bucket) -> Self {
        match bucket {
            Bucket::Cheap => Self { cheap: 1.0, mid: 0.0, hard: 0.0 },
            Bucket::Mid => Self { cheap: 0.0, mid: 1.0, hard: 0.0 },
            Bucket::Hard => Self { cheap: 0.0, mid: 0.0, hard: 1.0 },
        }
    }

    /// Apply the artifact's triage cut-offs.
    ///
    /// `cheap` wins when its probability clears the cheap threshold; `hard`
    /// wins when its probability clears the hard threshold; everything else
    /// is `mid`. Cheap is checked first so that a degenerate artifact with
    /// both thresholds at 0 still routes cheaply.
    pub fn pick(&self, cheap_threshold: f64, hard_threshold: f64) -> Bucket {
        if self.cheap >= cheap_threshold && self.cheap >= self.hard {
            Bucket::Cheap
        } else if self.hard >= hard_threshold {
            Bucket::Hard
        } else {
            Bucket::Mid
        }
    }
}

/// A single decision-tree node in the ensemble payload.
///
/// Leaves carry a 3-vector of class contributions; internal nodes compare
/// one schema feature against a threshold and branch by node index.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: [f64; 3],
    },
}

/// One boosted tree: nodes indexed from the root at 0.
pub type Tree = Vec<TreeNode>;

/// Gradient-boosted ensemble over the artifact's feature schema.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TreeEnsemble {
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    /// Sum leaf contributions across trees. Malformed node indices terminate
    /// the walk for that tree and contribute nothing.
    fn score(&self, input: &[f64]) -> [f64; 3] {
        let mut logits = [0.0; 3];
        for tree in &self.trees {
            let mut idx = 0usize;
            for _ in 0..tree.len() {
                match tree.get(idx) {
                    Some(TreeNode::Split { feature, threshold, left, right }) => {
                        let v = input.get(*feature).copied().unwrap_or(0.0);
                        idx = if v < *threshold { *left } else { *right };
                    }
                    Some(TreeNode::Leaf { value }) => {
                        for (l, v) in logits.iter_mut().zip(value.iter()) {
                            *l += v;
                        }
                        break;
                    }
                    None => break,
                }
            }
        }
        logits
    }
}

/// Concrete triage implementation, discriminated by the artifact's
/// `gbdt.framework` tag.
#[derive(Debug, Clone)]
pub enum TriageModel {
    Trees(TreeEnsemble),
    Emergency,
}

impl TriageModel {
    /// Build from the artifact's gbdt handle.
    ///
    /// Unknown framework tags and unparseable payloads degrade to
    /// [`TriageModel::Emergency`] — the caller keeps routing either way.
    pub fn from_handle(handle: &GbdtHandle) -> Self {
        match handle.framework.as_str() {
            "trees" => match serde_json::from_value::<TreeEnsemble>(handle.model.clone()) {
                Ok(ensemble) if !ensemble.trees.is_empty() => Self::Trees(ensemble),
                Ok(_) => {
                    tracing::warn!("triage model payload has no trees, using emergency rules");
                    Self::Emergency
                }
                Err(e) => {
                    tracing::warn!(error = %e, "triage model payload unparseable, using emergency rules");
                    Self::Emergency
                }
            },
            "emergency" => Self::Emergency,
            other => {
                tracing::warn!(framework = other, "unknown triage framework, using emergency rules");
                Self::Emergency
            }
        }
    }
}

/// Produce bucket probabilities for one request.
pub fn predict(model: &TriageModel, features: &Features, artifact: &Artifact) -> BucketProbs {
    match model {
        TriageModel::Trees(ensemble) => {
            let input = assemble_input(&artifact.gbdt.feature_schema, features);
            softmax(ensemble.score(&input))
        }
        TriageModel::Emergency => emergency_rules(features),
    }
}

/// The hand-tuned terminal fallback, expressed as a one-hot vector.
pub fn emergency_rules(features: &Features) -> BucketProbs {
    let bucket = if features.tokens > 100_000 || (features.has_code && features.has_math) {
        Bucket::Hard
    } else if features.tokens < 1_000 && !features.has_code && !features.has_math {
        Bucket::Cheap
    } else {
        Bucket::Mid
    };
    BucketProbs::one_hot(bucket)
}

/// Assemble the numeric input in schema order; unknown names impute 0.
fn assemble_input(schema: &[String], features: &Features) -> Vec<f64> {
    schema
        .iter()
        .map(|name| match name.as_str() {
            "tokens" => features.tokens as f64,
            "has_code" => features.has_code as u8 as f64,
            "has_math" => features.has_math as u8 as f64,
            "ngram_entropy" => features.ngram_entropy,
            "context_ratio" => features.context_ratio,
            "cluster_id" => features.cluster_id as f64,
            other => {
                if let Some(i) = other.strip_prefix("dist_").and_then(|s| s.parse::<usize>().ok()) {
                    features.centroid_distances.get(i).copied().unwrap_or(0.0) as f64
                } else if let Some(i) =
                    other.strip_prefix("emb_").and_then(|s| s.parse::<usize>().ok())
                {
                    features.embedding.get(i).copied().unwrap_or(0.0) as f64
                } else {
                    0.0
                }
            }
        })
        .collect()
}

fn softmax(logits: [f64; 3]) -> BucketProbs {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    BucketProbs {
        cheap: exp[0] / sum,
        mid: exp[1] / sum,
        hard: exp[2] / sum,
    }
}
