//! Client-facing gateway API.
//!
//! A thin layer over [`crate::router::route`]: handlers translate HTTP
//! concerns (status codes, the degraded-mode `warning` field, response
//! headers) and nothing else. Errors surface through [`AppError`] as the
//! provider-neutral `{error: {message, type, code?}}` body.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::{
    api::request_id::RequestId,
    error::AppError,
    router::{self, GatewayState},
};

/// Build the client-facing axum router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/oauth/authorize", get(oauth_authorize))
        .route("/oauth/callback", get(oauth_callback))
        .with_state(state)
}

/// `GET /healthz` — bare liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// `POST /v1/chat/completions` — the routed completion endpoint.
async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    request_id: Option<Extension<RequestId>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let routed = router::route(&state, &headers, body, &request_id).await?;

    let mut response = routed.body;
    // Degraded mode stays invisible except for this advisory field.
    if routed.degraded {
        if let Some(obj) = response.as_object_mut() {
            obj.insert(
                "warning".into(),
                json!("routing policy degraded: emergency artifact in force"),
            );
        }
    }

    let headers = [
        ("x-routed-bucket", routed.bucket.as_str().to_string()),
        ("x-routed-model", routed.model_slug),
        ("x-fallback-used", routed.fallback_used.to_string()),
    ];
    Ok((headers, Json(response)))
}

/// `GET /oauth/authorize?user_id=…` — start the Google PKCE flow.
///
/// 404 unless `GOOGLE_CLIENT_ID` is configured.
async fn oauth_authorize(
    State(state): State<Arc<GatewayState>>,
    axum::extract::Query(params): axum::extract::Query<std::collections::HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(oauth) = &state.oauth else {
        return (axum::http::StatusCode::NOT_FOUND, Json(json!({}))).into_response();
    };
    let user_id = params.get("user_id").cloned().unwrap_or_else(|| "anonymous".into());
    let (url, oauth_state) = oauth.authorize_url(&user_id);
    Json(json!({ "authorize_url": url, "state": oauth_state })).into_response()
}

/// `GET /oauth/callback?code=…&state=…` — complete the PKCE exchange.
async fn oauth_callback(
    State(state): State<Arc<GatewayState>>,
    axum::extract::Query(params): axum::extract::Query<std::collections::HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(oauth) = &state.oauth else {
        return (axum::http::StatusCode::NOT_FOUND, Json(json!({}))).into_response();
    };
    let (Some(code), Some(oauth_state)) = (params.get("code"), params.get("state")) else {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": "code and state are required", "type": "auth_missing" } })),
        )
            .into_response();
    };
    match oauth.exchange_code(code, oauth_state).await {
        Ok(_) => Json(json!({ "status": "authorized" })).into_response(),
        Err(e) => (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": e.to_string(), "type": "auth_missing" } })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProviderConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn app_for(server: &MockServer) -> Router {
        let mut config = Config::default();
        for kind in ["openai", "google", "anthropic", "openrouter"] {
            config.providers.insert(
                kind.into(),
                ProviderConfig {
                    base_url: server.uri(),
                    api_key_env: Some("TGW_GATEWAY_TEST_KEY".into()),
                    timeout_ms: 5_000,
                },
            );
        }
        config.artifact.url = "http://127.0.0.1:9/unreachable.json".into();
        config.artifact.cache_dir = tempfile::tempdir()
            .unwrap()
            .keep()
            .to_string_lossy()
            .into_owned();
        config.artifact.timeout_ms = 200;
        config.executor.max_retries = 0;
        // SAFETY: tests are the only writers of this variable.
        unsafe { std::env::set_var("TGW_GATEWAY_TEST_KEY", "test-key-value") };

        let state = Arc::new(GatewayState::new(Arc::new(config)));
        router(state).layer(axum::middleware::from_fn(
            crate::api::request_id::request_id_middleware,
        ))
    }

    fn completion_request(content: &str) -> Request<Body> {
        Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "messages": [{ "role": "user", "content": content }] }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_is_public_and_plain() {
        let server = MockServer::start().await;
        let app = app_for(&server).await;
        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn successful_route_sets_bucket_and_model_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "hi" } }],
                "usage": { "prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3 },
            })))
            .mount(&server)
            .await;

        let app = app_for(&server).await;
        let resp = app.oneshot(completion_request("hello")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-routed-bucket"], "cheap");
        assert!(resp.headers().contains_key("x-request-id"));

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        // Emergency artifact in force → degraded warning present.
        assert!(body["warning"].as_str().unwrap().contains("degraded"));
        assert_eq!(body["choices"][0]["message"]["content"], "hi");
    }

    #[tokio::test]
    async fn provider_4xx_maps_to_neutral_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "bad", "type": "invalid_request_error" }
            })))
            .mount(&server)
            .await;

        let app = app_for(&server).await;
        let resp = app.oneshot(completion_request("hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "provider_4xx");
    }
}
