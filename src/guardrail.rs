//! Context-capacity guardrail.
//!
//! Triage decides how *hard* a request is; the guardrail decides whether the
//! chosen bucket can physically hold it. Each bucket carries input/output
//! capacity limits with a 10 % safety margin. A request that does not fit
//! escalates one step, or straight to `hard` when the intermediate step is
//! still too small. A request too large even for `hard` is flagged as an
//! emergency escalation and routed to `hard` anyway, with the
//! largest-window candidate recommended.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::features::Features;
use crate::triage::Bucket;

/// Fraction of a limit considered usable.
const SAFETY_MARGIN: f64 = 0.9;

/// Input/output token capacity for one bucket.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BucketLimits {
    pub input: u64,
    pub output: u64,
}

/// Capacity limits for all three buckets.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct GuardrailLimits {
    pub cheap: BucketLimits,
    pub mid: BucketLimits,
    pub hard: BucketLimits,
}

impl Default for GuardrailLimits {
    fn default() -> Self {
        Self {
            cheap: BucketLimits { input: 32_768, output: 8_192 },
            mid: BucketLimits { input: 128_000, output: 8_192 },
            hard: BucketLimits { input: 1_048_576, output: 8_192 },
        }
    }
}

impl GuardrailLimits {
    fn for_bucket(&self, bucket: Bucket) -> BucketLimits {
        match bucket {
            Bucket::Cheap => self.cheap,
            Bucket::Mid => self.mid,
            Bucket::Hard => self.hard,
        }
    }
}

/// Outcome of the capacity check.
#[derive(Debug, Clone, Serialize)]
pub struct Adjustment {
    pub bucket: Bucket,
    pub escalated: bool,
    pub reason: Option<String>,
    /// Set only on emergency escalation: the candidate with the largest
    /// input window.
    pub recommended_model: Option<String>,
}

/// Holds the limits and the emergency-escalation counter.
pub struct ContextGuardrail {
    limits: GuardrailLimits,
    pub emergency_escalations: AtomicU64,
}

impl ContextGuardrail {
    pub fn new(limits: GuardrailLimits) -> Self {
        Self {
            limits,
            emergency_escalations: AtomicU64::new(0),
        }
    }

    /// Escalate `bucket` until prompt + estimated output fit, within the
    /// cheap → mid → hard ladder.
    pub fn adjust(
        &self,
        bucket: Bucket,
        features: &Features,
        available_models: &[String],
    ) -> Adjustment {
        let needed_out = estimated_output_tokens(features);

        if self.fits(bucket, features.tokens, needed_out) {
            return Adjustment {
                bucket,
                escalated: false,
                reason: None,
                recommended_model: None,
            };
        }

        let next = bucket.escalate();
        if next != bucket && self.fits(next, features.tokens, needed_out) {
            return Adjustment {
                bucket: next,
                escalated: true,
                reason: Some(format!(
                    "{} tokens exceed {bucket} capacity",
                    features.tokens
                )),
                recommended_model: None,
            };
        }

        if self.fits(Bucket::Hard, features.tokens, needed_out) {
            return Adjustment {
                bucket: Bucket::Hard,
                escalated: true,
                reason: Some(format!(
                    "{} tokens exceed {next} capacity, escalating to hard",
                    features.tokens
                )),
                recommended_model: None,
            };
        }

        // Even `hard` cannot hold this prompt. Route there regardless and
        // surface the widest-window candidate.
        self.emergency_escalations.fetch_add(1, Ordering::Relaxed);
        let recommended = available_models
            .iter()
            .max_by_key(|slug| input_window(slug))
            .cloned();
        Adjustment {
            bucket: Bucket::Hard,
            escalated: true,
            reason: Some(format!(
                "{} tokens exceed every bucket, emergency escalation",
                features.tokens
            )),
            recommended_model: recommended,
        }
    }

    fn fits(&self, bucket: Bucket, prompt_tokens: u64, output_tokens: u64) -> bool {
        let limits = self.limits.for_bucket(bucket);
        let safe_input = limits.input as f64 * SAFETY_MARGIN;
        let safe_total = (limits.input + limits.output) as f64 * SAFETY_MARGIN;
        prompt_tokens as f64 <= safe_input
            && (prompt_tokens + output_tokens) as f64 <= safe_total
    }
}

/// Estimate completion size from request shape. The largest applicable rule
/// wins; short plain prompts get a reduced base.
pub(crate) fn estimated_output_tokens(features: &Features) -> u64 {
    let mut estimate = if features.tokens < 1_000 { 1_024 } else { 2_048 };
    if features.tokens > 20_000 {
        estimate = estimate.max(4_096);
    }
    if features.tokens > 50_000 {
        estimate = estimate.max(8_192);
    }
    if features.has_code {
        estimate = estimate.max(4_096);
    }
    if features.has_math {
        estimate = estimate.max(3_072);
    }
    estimate
}

/// Documented input window for a model slug; conservative default when the
/// model is unrecognized.
pub(crate) fn input_window(slug: &str) -> u64 {
    if slug.contains("gemini") {
        1_048_576
    } else if slug.contains("claude-opus") {
        1_000_000
    } else if slug.contains("gpt-5") && !slug.contains("mini") && !slug.contains("nano") {
        400_000
    } else if slug.contains("claude") {
        200_000
    } else {
        128_000
    }
}
