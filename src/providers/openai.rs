//! OpenAI chat completions adapter.
//!
//! The gateway's internal schema *is* the OpenAI schema, so the request body
//! is forwarded as-is. The only adapter-owned concern is auth placement:
//! whatever credential shape was matched inbound, OpenAI receives
//! `Authorization: Bearer <key>`.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::Value;

use super::{Credential, ProviderKind};
use crate::error::RouteError;

pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(base_url: String, timeout_ms: u64, credential: Credential) -> Self {
        let mut headers = header::HeaderMap::new();
        // OpenAI takes every credential shape as a bearer token.
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

    /// Forward a chat completions request to `POST /v1/chat/completions`.
    pub async fn chat(&self, body: &Value) -> Result<Value, RouteError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::OpenAI, e))?;

        if !response.status().is_success() {
            return Err(super::error_from_response(ProviderKind::OpenAI, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::OpenAI, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> OpenAiAdapter {
        OpenAiAdapter::new(
            server.uri(),
            5_000,
            Credential::ApiKey("sk-test-key-value-0123456789abcdefghij".into()),
        )
    }

    #[tokio::test]
    async fn chat_posts_bearer_auth_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header(
                "authorization",
                "Bearer sk-test-key-value-0123456789abcdefghij",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "hi" } }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4 },
            })))
            .mount(&server)
            .await;

        let out = adapter_for(&server)
            .chat(&json!({ "model": "gpt-5", "messages": [] }))
            .await
            .unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi");
    }

    #[tokio::test]
    async fn chat_maps_429_to_rate_limit_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .set_body_json(json!({
                        "error": { "message": "Rate limit reached", "type": "rate_limit_error" }
                    })),
            )
            .mount(&server)
            .await;

        let err = adapter_for(&server)
            .chat(&json!({ "model": "gpt-5", "messages": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitUpstream);
        assert_eq!(err.retry_after, Some(30));
        assert_eq!(err.status, Some(429));
    }

    #[tokio::test]
    async fn chat_maps_500_to_provider_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = adapter_for(&server)
            .chat(&json!({ "model": "gpt-5", "messages": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Provider5xx);
    }
}
