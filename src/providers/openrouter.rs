//! OpenRouter adapter — OpenAI-compatible passthrough.
//!
//! OpenRouter speaks the OpenAI chat-completions wire format, so no schema
//! translation is needed. Provider-prefs keys the caller supplied
//! (`max_price`, `allow_fallbacks`, …) ride along in the body untouched;
//! they are pass-through metadata, not enforced here.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::Value;

use super::{Credential, ProviderKind};
use crate::error::RouteError;

pub struct OpenRouterAdapter {
    client: Client,
    base_url: String,
}

impl OpenRouterAdapter {
    pub fn new(base_url: String, timeout_ms: u64, credential: Credential) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {}", credential.token());
        if let Ok(v) = header::HeaderValue::from_str(&value) {
            headers.insert(header::AUTHORIZATION, v);
        }
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url }
    }

    /// Forward to `POST /v1/chat/completions` verbatim.
    pub async fn chat(&self, body: &Value) -> Result<Value, RouteError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::OpenRouter, e))?;

        if !response.status().is_success() {
            return Err(super::error_from_response(ProviderKind::OpenRouter, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::OpenRouter, e))
    }
}
