//! Anthropic Messages API adapter.
//!
//! Translates between the OpenAI chat completions schema (used internally by
//! the gateway) and Anthropic's `/v1/messages` API.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Finish reasons | `"stop"`, `"length"` | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth | n/a | `Authorization: Bearer` + `anthropic-version` |

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{Credential, ProviderKind};
use crate::error::{ErrorKind, RouteError};

/// Default max_tokens when the caller omits it. Required by Anthropic.
const DEFAULT_MAX_TOKENS: u64 = 8_192;

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, timeout_ms: u64, credential: Credential) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {}", credential.token());
        if let Ok(v) = header::HeaderValue::from_str(&value) {
            headers.insert(header::AUTHORIZATION, v);
        }
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );
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

    /// Translate and forward a chat completions request to `POST /v1/messages`,
    /// then translate the response back to the OpenAI schema.
    pub async fn chat(&self, body: &Value) -> Result<Value, RouteError> {
        let anthropic_req = to_anthropic(body)?;
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&anthropic_req)
            .send()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::Anthropic, e))?;

        if !response.status().is_success() {
            return Err(super::error_from_response(ProviderKind::Anthropic, response).await);
        }

        let resp: Value = response
            .json()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::Anthropic, e))?;

        from_anthropic(resp)
    }
}

/// Convert an OpenAI chat completions request to the Anthropic Messages format.
pub(crate) fn to_anthropic(request: &Value) -> Result<Value, RouteError> {
    let model = request["model"].as_str().ok_or_else(|| {
        RouteError::new(ErrorKind::Provider4xx, "`model` field is required")
    })?;

    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

    let raw_messages = request["messages"].as_array().ok_or_else(|| {
        RouteError::new(ErrorKind::Provider4xx, "`messages` array is required")
    })?;

    // Anthropic treats system content as a top-level field, not a message role.
    // If multiple system messages are present, concatenate them.
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        if msg["role"].as_str() == Some("system") {
            if let Some(content) = msg["content"].as_str() {
                system_parts.push(content);
            }
        } else {
            messages.push(msg.clone());
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }

    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = stop.clone();
    }

    Ok(req)
}

/// Convert an Anthropic Messages API response to the OpenAI chat completions schema.
pub(crate) fn from_anthropic(resp: Value) -> Result<Value, RouteError> {
    // Anthropic responses contain a `content` array of typed blocks.
    // Extract the first text block; non-text blocks (tool_use, etc.) are
    // out of scope for the routing core.
    let text = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| {
            RouteError::new(
                ErrorKind::Provider5xx,
                "no text block in Anthropic response `content` array",
            )
        })?
        .to_string();

    let model = resp["model"].as_str().unwrap_or("unknown");

    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
        "end_turn" => "stop",
        "max_tokens" => "length",
        other => other,
    };

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}
