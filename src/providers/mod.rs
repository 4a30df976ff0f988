//! Provider adapters and the unified outbound client.
//!
//! [`ProviderClient`] is an enum that wraps a concrete provider adapter chosen
//! at construction time from a [`ProviderKind`]. The executor interacts with a
//! single `chat` method; adapter-specific protocol differences — schema
//! translation, auth placement, endpoint paths, thinking parameters — are
//! fully encapsulated in the adapter modules.
//!
//! All adapters accept and return the OpenAI chat-completions schema; Google
//! and Anthropic translate at the edge.

mod anthropic;
mod google;
mod openai;
mod openrouter;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;
pub use openrouter::OpenRouterAdapter;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ProviderConfig,
    error::{ErrorKind, RouteError},
};

/// The four provider back-ends the gateway can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAI,
    Google,
    Anthropic,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Google => "google",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Split a `provider/model` slug into its provider and bare model name.
    ///
    /// OpenRouter model names may themselves contain slashes
    /// (`openrouter/deepseek/deepseek-chat`), so only the first segment is
    /// consumed.
    pub fn split_slug(slug: &str) -> Option<(Self, &str)> {
        let (prefix, model) = slug.split_once('/')?;
        let kind = prefix.parse().ok()?;
        if model.is_empty() {
            return None;
        }
        Some((kind, model))
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAI),
            "google" => Ok(Self::Google),
            "anthropic" => Ok(Self::Anthropic),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

/// A resolved outbound credential.
///
/// The token value is opaque; how it is placed on the wire (header vs query
/// parameter) is each adapter's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl Credential {
    pub fn token(&self) -> &str {
        match self {
            Self::Bearer(t) | Self::ApiKey(t) => t,
        }
    }
}

/// Unified provider client — enum dispatch over concrete adapters.
pub enum ProviderClient {
    OpenAI(OpenAiAdapter),
    Google(GoogleAdapter),
    Anthropic(AnthropicAdapter),
    OpenRouter(OpenRouterAdapter),
}

impl ProviderClient {
    /// Build a client for `kind` from its effective config and credential.
    pub fn new(kind: ProviderKind, cfg: &ProviderConfig, credential: Credential) -> Self {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        match kind {
            ProviderKind::OpenAI => {
                Self::OpenAI(OpenAiAdapter::new(base_url, cfg.timeout_ms, credential))
            }
            ProviderKind::Google => {
                Self::Google(GoogleAdapter::new(base_url, cfg.timeout_ms, credential))
            }
            ProviderKind::Anthropic => {
                Self::Anthropic(AnthropicAdapter::new(base_url, cfg.timeout_ms, credential))
            }
            ProviderKind::OpenRouter => {
                Self::OpenRouter(OpenRouterAdapter::new(base_url, cfg.timeout_ms, credential))
            }
        }
    }

    /// Execute one chat completion against the provider.
    ///
    /// `body` is OpenAI-shaped with `model` and any thinking parameters
    /// already injected by the executor. The response is OpenAI-shaped
    /// regardless of provider.
    pub async fn chat(&self, body: &Value) -> Result<Value, RouteError> {
        match self {
            Self::OpenAI(a) => a.chat(body).await,
            Self::Google(a) => a.chat(body).await,
            Self::Anthropic(a) => a.chat(body).await,
            Self::OpenRouter(a) => a.chat(body).await,
        }
    }
}

/// Parse a `retry-after` header value into whole seconds.
///
/// Only the delta-seconds form is recognized; HTTP-date values are rare on
/// provider APIs and fall through to `None`.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Shared non-2xx handling: read the body, classify, and build a
/// [`RouteError`] carrying status and any `retry-after`.
pub(crate) async fn error_from_response(
    provider: ProviderKind,
    response: reqwest::Response,
) -> RouteError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let text = response.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let kind = crate::error::classify_status(status, &body);

    let message = body
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{provider} returned HTTP {status}"));

    let mut err = RouteError::new(kind, message).with_status(status);
    if let Some(secs) = retry_after {
        err = err.with_retry_after(secs);
    }
    err
}

/// Shared transport-failure handling.
pub(crate) fn error_from_transport(provider: ProviderKind, err: reqwest::Error) -> RouteError {
    RouteError::new(
        ErrorKind::Provider5xx,
        format!("{provider} transport failure: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Slug parsing
    // -----------------------------------------------------------------------

    #[test]
    fn split_slug_handles_simple_slugs() {
        assert_eq!(
            ProviderKind::split_slug("openai/gpt-5"),
            Some((ProviderKind::OpenAI, "gpt-5"))
        );
        assert_eq!(
            ProviderKind::split_slug("google/gemini-2.5-pro"),
            Some((ProviderKind::Google, "gemini-2.5-pro"))
        );
    }

    #[test]
    fn split_slug_keeps_openrouter_nested_model_names() {
        assert_eq!(
            ProviderKind::split_slug("openrouter/deepseek/deepseek-chat"),
            Some((ProviderKind::OpenRouter, "deepseek/deepseek-chat"))
        );
    }

    #[test]
    fn split_slug_rejects_unknown_provider_and_bare_names() {
        assert!(ProviderKind::split_slug("acme/model").is_none());
        assert!(ProviderKind::split_slug("gpt-5").is_none());
        assert!(ProviderKind::split_slug("openai/").is_none());
    }

    #[test]
    fn provider_kind_round_trips_through_str() {
        for kind in [
            ProviderKind::OpenAI,
            ProviderKind::Google,
            ProviderKind::Anthropic,
            ProviderKind::OpenRouter,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    // -----------------------------------------------------------------------
    // retry-after parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_retry_after_reads_delta_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(120));
    }

    #[test]
    fn parse_retry_after_ignores_http_dates() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "retry-after",
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn parse_retry_after_none_when_header_absent() {
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
    }
}
