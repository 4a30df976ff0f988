//! Closed error-kind set for the routing pipeline, plus the axum adapter.
//!
//! Every component on the request path returns a typed outcome built from
//! [`ErrorKind`]. The set is closed: provider-shaped failures are mapped
//! into it deterministically (status code first, then error-body `type`
//! field) so no caller ever has to pattern-match on message text.
//!
//! [`AppError`] converts a [`RouteError`] into the provider-neutral JSON body
//! `{"error": {"message", "type", "code?"}}` with an HTTP status reflecting
//! the kind. Handlers return `Result<T, AppError>` and propagate with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// The closed set of failure kinds the gateway distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Artifact validation failed; the prior artifact stays in force.
    InvalidArtifact,
    /// Feature extraction exceeded its soft deadline; fallback features used.
    FeatureTimeout,
    /// Triage model could not be evaluated; emergency framework used.
    TriageUnavailable,
    /// No credential could be matched on the inbound request.
    AuthMissing,
    /// A local cooldown short-circuited the request before any upstream call.
    RateLimitCooldown,
    /// The upstream provider returned 429.
    RateLimitUpstream,
    /// A circuit breaker rejected the call without reaching the provider.
    CircuitOpen,
    /// Provider 5xx or transport-level failure.
    Provider5xx,
    /// Provider 4xx other than 429. Never retried, never falls back.
    Provider4xx,
    /// Both the primary and the fallback attempt failed.
    FallbackFailed,
    /// No artifact could be loaded from any source; emergency policy active.
    ArtifactUnavailable,
}

impl ErrorKind {
    /// Whether the executor may retry this failure within the same attempt.
    ///
    /// Rate limits are deliberately excluded: they are surfaced immediately
    /// so the fallback table (and cooldown bookkeeping) can act on them.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Provider5xx)
    }

    /// Whether this failure makes the decision eligible for a fallback attempt.
    pub fn triggers_fallback(self) -> bool {
        matches!(
            self,
            Self::RateLimitUpstream | Self::Provider5xx | Self::CircuitOpen
        )
    }

    /// HTTP status surfaced to the caller when this kind terminates a request.
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::AuthMissing => StatusCode::UNAUTHORIZED,
            Self::RateLimitCooldown | Self::RateLimitUpstream => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::Provider4xx => StatusCode::BAD_REQUEST,
            Self::FallbackFailed | Self::Provider5xx => StatusCode::BAD_GATEWAY,
            Self::InvalidArtifact
            | Self::FeatureTimeout
            | Self::TriageUnavailable
            | Self::ArtifactUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable wire name, identical to the serde rename.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArtifact => "invalid_artifact",
            Self::FeatureTimeout => "feature_timeout",
            Self::TriageUnavailable => "triage_unavailable",
            Self::AuthMissing => "auth_missing",
            Self::RateLimitCooldown => "rate_limit_cooldown",
            Self::RateLimitUpstream => "rate_limit_upstream",
            Self::CircuitOpen => "circuit_open",
            Self::Provider5xx => "provider_5xx",
            Self::Provider4xx => "provider_4xx",
            Self::FallbackFailed => "fallback_failed",
            Self::ArtifactUnavailable => "artifact_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed routing failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RouteError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream HTTP status, when one was observed.
    pub status: Option<u16>,
    /// Seconds the caller should wait, for rate-limit kinds.
    pub retry_after: Option<u64>,
}

impl RouteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

/// Map an upstream HTTP failure to an [`ErrorKind`].
///
/// Status code wins; the error body's `error.type` field refines 4xx cases
/// where providers report rate limiting under a 400-family status.
pub fn classify_status(status: u16, body: &serde_json::Value) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimitUpstream,
        500..=599 => ErrorKind::Provider5xx,
        400..=499 => {
            let err_type = body
                .pointer("/error/type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if err_type.contains("rate_limit") {
                ErrorKind::RateLimitUpstream
            } else {
                ErrorKind::Provider4xx
            }
        }
        _ => ErrorKind::Provider5xx,
    }
}

/// Wraps a [`RouteError`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(pub RouteError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = %self.0.kind, error = %self.0.message, "request failed");

        let mut error = json!({
            "message": self.0.message,
            "type": self.0.kind.as_str(),
        });
        if let Some(status) = self.0.status {
            error["code"] = json!(status);
        }

        let mut response =
            (self.0.kind.http_status(), Json(json!({ "error": error }))).into_response();

        if let Some(secs) = self.0.retry_after {
            if let Ok(v) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }

        response
    }
}

impl From<RouteError> for AppError {
    fn from(e: RouteError) -> Self {
        Self(e)
    }
}
