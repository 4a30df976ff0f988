//! Google OAuth helper: RFC 7636 PKCE material and a per-user token cache.
//!
//! The gateway never brokers a browser flow itself; it prepares the
//! authorization URL (S256 challenge, `<state>_<user_id>` state encoding),
//! exchanges the returned code, and caches access/refresh tokens per user.
//! Everything here is optional — without `GOOGLE_CLIENT_ID` the gateway
//! simply relies on API keys.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// RFC 7636 minimum verifier length.
const VERIFIER_LEN: usize = 64;

/// Unreserved characters allowed in a code verifier.
const VERIFIER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// A verifier/challenge pair for one authorization attempt.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

/// Generate a fresh PKCE pair: 64-char verifier, S256 challenge.
pub fn generate_pkce() -> PkcePair {
    let mut rng = rand::thread_rng();
    let verifier: String = (0..VERIFIER_LEN)
        .map(|_| VERIFIER_CHARSET[rng.gen_range(0..VERIFIER_CHARSET.len())] as char)
        .collect();
    let challenge = challenge_for(&verifier);
    PkcePair { verifier, challenge }
}

/// `base64url(sha256(verifier))`, unpadded.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Encode the CSRF state with the requesting user: `<state>_<user_id>`.
///
/// The random state part never contains underscores, so decoding splits on
/// the first one even though user ids may contain their own.
pub fn encode_state(state: &str, user_id: &str) -> String {
    format!("{state}_{user_id}")
}

/// Split `<state>_<user_id>` back apart.
pub fn decode_state(encoded: &str) -> Option<(&str, &str)> {
    let (state, user_id) = encoded.split_once('_')?;
    if state.is_empty() || user_id.is_empty() {
        return None;
    }
    Some((state, user_id))
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingAuth {
    verifier: String,
    user_id: String,
}

/// OAuth client state: pending authorizations keyed by state, tokens by user.
pub struct GoogleOAuth {
    client_id: String,
    redirect_uri: String,
    token_endpoint: String,
    client: reqwest::Client,
    pending: DashMap<String, PendingAuth>,
    tokens: DashMap<String, CachedToken>,
}

impl GoogleOAuth {
    /// Build from environment; `None` when `GOOGLE_CLIENT_ID` is unset.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("GOOGLE_CLIENT_ID").ok().filter(|v| !v.is_empty())?;
        let redirect_uri = std::env::var("GOOGLE_REDIRECT_URI")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "http://localhost:8080/oauth/callback".into());
        Some(Self::new(client_id, redirect_uri, TOKEN_ENDPOINT.into()))
    }

    pub fn new(client_id: String, redirect_uri: String, token_endpoint: String) -> Self {
        Self {
            client_id,
            redirect_uri,
            token_endpoint,
            client: reqwest::Client::new(),
            pending: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    /// Authorization URL for `user_id`, remembering the verifier for the
    /// later exchange. Returns `(url, encoded_state)`.
    pub fn authorize_url(&self, user_id: &str) -> (String, String) {
        let pkce = generate_pkce();
        let state: String = {
            let mut rng = rand::thread_rng();
            (0..24)
                .map(|_| {
                    let charset = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
                    charset[rng.gen_range(0..charset.len())] as char
                })
                .collect()
        };
        let encoded = encode_state(&state, user_id);
        self.pending.insert(
            encoded.clone(),
            PendingAuth {
                verifier: pkce.verifier,
                user_id: user_id.to_string(),
            },
        );

        let mut url = reqwest::Url::parse(AUTH_ENDPOINT).expect("static endpoint parses");
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", "https://www.googleapis.com/auth/generative-language")
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &encoded);
        (url.to_string(), encoded)
    }

    /// Exchange an authorization code, caching the tokens for the user the
    /// state was issued to.
    pub async fn exchange_code(&self, code: &str, state: &str) -> anyhow::Result<String> {
        let (_, pending) = self
            .pending
            .remove(state)
            .ok_or_else(|| anyhow::anyhow!("unknown or replayed oauth state"))?;

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.client_id),
                ("redirect_uri", &self.redirect_uri),
                ("code_verifier", &pending.verifier),
            ])
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "token endpoint returned HTTP {}",
            response.status()
        );

        let body: serde_json::Value = response.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("token response missing access_token"))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        self.tokens.insert(
            pending.user_id.clone(),
            CachedToken {
                access_token: access_token.clone(),
                refresh_token: body["refresh_token"].as_str().map(str::to_string),
                expires_at: Utc::now() + Duration::seconds(expires_in),
            },
        );
        Ok(access_token)
    }

    /// Cached, unexpired access token for a user.
    pub fn cached_token(&self, user_id: &str) -> Option<String> {
        let entry = self.tokens.get(user_id)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(entry.access_token.clone())
    }

    /// Whether a refresh token is on file for the user.
    pub fn has_refresh_token(&self, user_id: &str) -> bool {
        self.tokens
            .get(user_id)
            .is_some_and(|t| t.refresh_token.is_some())
    }
}
