//! Google Gemini `generateContent` adapter.
//!
//! Translates the OpenAI chat schema to Gemini's `contents`/`parts` shape and
//! back. Two credential placements are supported, matching what the auth
//! registry extracts inbound:
//!
//! - OAuth bearer → `Authorization: Bearer …` header.
//! - API key → `?key=…` query parameter (the documented AIza… form).
//!
//! The executor's `thinking_budget` parameter travels in the body and is
//! mapped to `generationConfig.thinkingConfig.thinkingBudget` here.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{Credential, ProviderKind};
use crate::error::{ErrorKind, RouteError};

pub struct GoogleAdapter {
    client: Client,
    base_url: String,
    query_key: Option<String>,
}

impl GoogleAdapter {
    pub fn new(base_url: String, timeout_ms: u64, credential: Credential) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let query_key = match &credential {
            Credential::Bearer(token) => {
                let value = format!("Bearer {token}");
                if let Ok(v) = header::HeaderValue::from_str(&value) {
                    headers.insert(header::AUTHORIZATION, v);
                }
                None
            }
            Credential::ApiKey(key) => Some(key.clone()),
        };

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url,
            query_key,
        }
    }

    /// Translate and forward to `POST /v1beta/models/{model}:generateContent`.
    pub async fn chat(&self, body: &Value) -> Result<Value, RouteError> {
        let model = body["model"].as_str().ok_or_else(|| {
            RouteError::new(ErrorKind::Provider4xx, "`model` field is required")
        })?;
        let gemini_req = to_gemini(body)?;

        let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url);
        let mut request = self.client.post(&url).json(&gemini_req);
        if let Some(key) = &self.query_key {
            request = request.query(&[("key", key.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::Google, e))?;

        if !response.status().is_success() {
            return Err(super::error_from_response(ProviderKind::Google, response).await);
        }

        let resp: Value = response
            .json()
            .await
            .map_err(|e| super::error_from_transport(ProviderKind::Google, e))?;

        from_gemini(model, resp)
    }
}

/// Convert an OpenAI chat completions request to the Gemini format.
///
/// Gemini has no `system` role; system messages become `systemInstruction`.
/// Assistant turns map to role `model`.
pub(crate) fn to_gemini(request: &Value) -> Result<Value, RouteError> {
    let raw_messages = request["messages"].as_array().ok_or_else(|| {
        RouteError::new(ErrorKind::Provider4xx, "`messages` array is required")
    })?;

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        let text = msg["content"].as_str().unwrap_or_default();
        match msg["role"].as_str() {
            Some("system") => system_parts.push(json!({ "text": text })),
            Some("assistant") => {
                contents.push(json!({ "role": "model", "parts": [{ "text": text }] }));
            }
            _ => contents.push(json!({ "role": "user", "parts": [{ "text": text }] })),
        }
    }

    let mut generation_config = json!({});
    if let Some(max) = request["max_tokens"].as_u64() {
        generation_config["maxOutputTokens"] = json!(max);
    }
    if let Some(temp) = request["temperature"].as_f64() {
        generation_config["temperature"] = json!(temp);
    }
    if let Some(budget) = request["thinking_budget"].as_u64() {
        generation_config["thinkingConfig"] = json!({ "thinkingBudget": budget });
    }

    let mut req = json!({ "contents": contents });
    if !system_parts.is_empty() {
        req["systemInstruction"] = json!({ "parts": system_parts });
    }
    if generation_config.as_object().is_some_and(|o| !o.is_empty()) {
        req["generationConfig"] = generation_config;
    }

    Ok(req)
}

/// Convert a Gemini response to the OpenAI chat completions schema.
pub(crate) fn from_gemini(model: &str, resp: Value) -> Result<Value, RouteError> {
    let candidate = resp["candidates"].get(0).ok_or_else(|| {
        RouteError::new(ErrorKind::Provider5xx, "Gemini response has no candidates")
    })?;

    let text = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let finish_reason = match candidate["finishReason"].as_str().unwrap_or("STOP") {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        other => return Err(RouteError::new(
            ErrorKind::Provider5xx,
            format!("Gemini finished abnormally: {other}"),
        )),
    };

    let usage = &resp["usageMetadata"];
    let prompt_tokens = usage["promptTokenCount"].as_u64().unwrap_or(0);
    let completion_tokens = usage["candidatesTokenCount"].as_u64().unwrap_or(0);
    let total_tokens = usage["totalTokenCount"]
        .as_u64()
        .unwrap_or(prompt_tokens + completion_tokens);

    Ok(json!({
        "id": resp["responseId"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": total_tokens,
        },
    }))
}
