// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Browser-facing OAuth redirect handler with PKCE (S256).
//!
//! ## Security
//!
//! - `redirect_uri` must match the configured allowlist **exactly**; no
//!   normalisation is applied before comparison.
//! - The code verifier is 32 random bytes (base64url); the challenge is
//!   its SHA-256, base64url-encoded, sent as `code_challenge_method=S256`.
//! - The `state` parameter is bound to the ephemeral session and checked
//!   for equality on callback (CSRF / code-interception defence).
//! - Authorization codes are single-use: the session is deleted before a
//!   successful callback returns, so replaying the callback fails with
//!   `session not found`.
//!
//! Ephemeral sessions expire after the configured TTL and are swept every
//! 60 s by a background task owned by the handler and cancelled by
//! [`OAuthRedirectHandler::destroy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, SharedAudit};
use crate::config::{Environment, OAuthRedirectConfig};

/// Audit source tag for redirect-flow events.
const AUDIT_SOURCE: &str = "oauth:redirect";

/// Interval between expired-session sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// OAuth redirect-flow error.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("redirect_uri is not in the configured allowlist")]
    RedirectUriNotAllowed,
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("Invalid state parameter")]
    StateMismatch,
    #[error("authorization code exchange failed")]
    ExchangeFailed(String),
    #[error("token endpoint must use HTTPS in production")]
    InsecureEndpoint,
}

impl OAuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OAuthError::RedirectUriNotAllowed | OAuthError::StateMismatch => {
                StatusCode::BAD_REQUEST
            }
            OAuthError::SessionNotFound | OAuthError::SessionExpired => StatusCode::NOT_FOUND,
            OAuthError::ExchangeFailed(_) => StatusCode::BAD_GATEWAY,
            OAuthError::InsecureEndpoint => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// One ephemeral authorization session. Single-use.
#[derive(Debug, Clone)]
struct OAuthSession {
    code_verifier: String,
    #[allow(dead_code)]
    code_challenge: String,
    state: String,
    redirect_uri: String,
    #[allow(dead_code)]
    scopes: Vec<String>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Result of [`OAuthRedirectHandler::authorize`].
#[derive(Debug, Clone)]
pub struct AuthorizeOutcome {
    pub authorize_url: String,
    pub state: String,
    pub session_id: String,
}

/// Browser-facing PKCE redirect handler.
pub struct OAuthRedirectHandler {
    config: OAuthRedirectConfig,
    env: Environment,
    sessions: Mutex<HashMap<String, OAuthSession>>,
    client: reqwest::Client,
    audit: SharedAudit,
    shutdown: CancellationToken,
}

impl OAuthRedirectHandler {
    pub fn new(
        config: OAuthRedirectConfig,
        env: Environment,
        audit: SharedAudit,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            config,
            env,
            sessions: Mutex::new(HashMap::new()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| OAuthError::ExchangeFailed(e.to_string()))?,
            audit,
            shutdown: CancellationToken::new(),
        })
    }

    /// Begin an authorization-code flow.
    ///
    /// Rejects `redirect_uri` values not in the allowlist (exact string
    /// match), generates the PKCE pair, persists an ephemeral session and
    /// returns the IDP authorize URL.
    pub async fn authorize(
        &self,
        redirect_uri: &str,
        scopes: Option<Vec<String>>,
        state: Option<String>,
    ) -> Result<AuthorizeOutcome, OAuthError> {
        // Exact-string allowlist; deliberately no normalisation.
        if !self
            .config
            .allowed_redirect_uris
            .iter()
            .any(|allowed| allowed == redirect_uri)
        {
            self.audit.append(
                AuditEntry::new(AUDIT_SOURCE, "authorize")
                    .failed("redirect_uri not in allowlist"),
            );
            return Err(OAuthError::RedirectUriNotAllowed);
        }

        let verifier_bytes: [u8; 32] = rand::rng().random();
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        let state = state.unwrap_or_else(|| {
            let bytes: [u8; 16] = rand::rng().random();
            hex::encode(bytes)
        });
        let session_id = uuid::Uuid::new_v4().to_string();
        let scopes = scopes.unwrap_or_else(|| self.config.default_scopes.clone());

        let now = Utc::now();
        let session = OAuthSession {
            code_verifier,
            code_challenge: code_challenge.clone(),
            state: state.clone(),
            redirect_uri: redirect_uri.to_string(),
            scopes: scopes.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.session_ttl_seconds as i64),
        };

        let mut url = url::Url::parse(&self.config.authorization_endpoint)
            .map_err(|e| OAuthError::ExchangeFailed(format!("bad authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");

        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), session);

        self.audit.append(
            AuditEntry::new(AUDIT_SOURCE, "authorize").with_metadata(serde_json::json!({
                "sessionId": session_id,
                "scopes": scopes,
            })),
        );

        Ok(AuthorizeOutcome {
            authorize_url: url.to_string(),
            state,
            session_id,
        })
    }

    /// Complete the flow: validate the session and exchange the code.
    ///
    /// On success the session is deleted *before* returning - codes are
    /// single-use. A failed IDP exchange leaves the session in place for
    /// one retry within the TTL.
    pub async fn callback(
        &self,
        code: &str,
        state: &str,
        session_id: &str,
    ) -> Result<serde_json::Value, OAuthError> {
        if self.env.requires_https() && !self.config.token_endpoint.starts_with("https://") {
            return Err(OAuthError::InsecureEndpoint);
        }

        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(session_id) else {
                self.audit_callback_failure(session_id, "session not found");
                return Err(OAuthError::SessionNotFound);
            };
            if session.expires_at <= Utc::now() {
                sessions.remove(session_id);
                self.audit_callback_failure(session_id, "session expired");
                return Err(OAuthError::SessionExpired);
            }
            if session.state != state {
                // The session survives: an attacker presenting a stolen
                // code with the wrong state must not burn the victim's
                // pending flow.
                self.audit_callback_failure(session_id, "state mismatch");
                return Err(OAuthError::StateMismatch);
            }
            session.clone()
        };

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &session.redirect_uri),
            ("client_id", &self.config.client_id),
            ("code_verifier", &session.code_verifier),
        ];

        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| OAuthError::ExchangeFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            self.audit_callback_failure(session_id, &format!("IDP returned {status}"));
            return Err(OAuthError::ExchangeFailed(format!(
                "token endpoint returned {status}"
            )));
        }

        let tokens: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OAuthError::ExchangeFailed(e.to_string()))?;

        // Single-use: delete before returning.
        self.sessions.lock().await.remove(session_id);

        self.audit.append(
            AuditEntry::new(AUDIT_SOURCE, "callback")
                .with_metadata(serde_json::json!({ "sessionId": session_id })),
        );

        Ok(tokens)
    }

    /// Spawn the expired-session sweep. Runs until [`Self::destroy`].
    pub fn start_sweeper(self: Arc<Self>) {
        let shutdown = self.shutdown.clone();
        let handler = self;
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = SWEEP_INTERVAL.as_secs(),
                "OAuth session sweeper starting"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {},
                    _ = shutdown.cancelled() => {
                        tracing::info!("OAuth session sweeper shutting down");
                        return;
                    }
                }
                handler.sweep().await;
            }
        });
    }

    /// Remove expired sessions.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, session| session.expires_at > now);
    }

    /// Stop the sweeper and drop all pending sessions.
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        self.sessions.lock().await.clear();
    }

    /// Number of pending sessions (metrics, tests).
    pub async fn pending_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn audit_callback_failure(&self, session_id: &str, reason: &str) {
        self.audit.append(
            AuditEntry::new(AUDIT_SOURCE, "callback")
                .failed(reason.to_string())
                .with_metadata(serde_json::json!({ "sessionId": session_id })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use axum::routing::post;
    use axum::{Json, Router};

    fn config(token_endpoint: &str) -> OAuthRedirectConfig {
        serde_json::from_value(serde_json::json!({
            "idpName": "primary",
            "authorizationEndpoint": "https://idp.example.com/authorize",
            "tokenEndpoint": token_endpoint,
            "clientId": "broker",
            "allowedRedirectUris": ["https://app.example.com/callback"],
            "sessionTtlSeconds": 600
        }))
        .unwrap()
    }

    fn handler(token_endpoint: &str) -> (OAuthRedirectHandler, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (
            OAuthRedirectHandler::new(config(token_endpoint), Environment::Test, sink.clone())
                .unwrap(),
            sink,
        )
    }

    /// Spin up a loopback IDP token endpoint returning a fixed grant.
    async fn fake_idp() -> String {
        let app = Router::new().route(
            "/token",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "granted",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/token")
    }

    #[tokio::test]
    async fn authorize_builds_s256_challenge() {
        let (handler, _) = handler("https://idp.example.com/token");
        let outcome = handler
            .authorize("https://app.example.com/callback", None, None)
            .await
            .unwrap();

        let url = url::Url::parse(&outcome.authorize_url).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["state"], outcome.state);
        assert_eq!(pairs["redirect_uri"], "https://app.example.com/callback");

        // The challenge matches the stored verifier.
        let sessions = handler.sessions.lock().await;
        let session = sessions.get(&outcome.session_id).unwrap();
        let expected =
            URL_SAFE_NO_PAD.encode(Sha256::digest(session.code_verifier.as_bytes()));
        assert_eq!(pairs["code_challenge"], expected);
        // 32 random bytes -> 43 base64url chars, within RFC 7636 bounds.
        assert_eq!(session.code_verifier.len(), 43);
    }

    #[tokio::test]
    async fn authorize_rejects_unlisted_redirect_uri() {
        let (handler, sink) = handler("https://idp.example.com/token");
        // Even a trailing slash is a different string: no normalisation.
        let err = handler
            .authorize("https://app.example.com/callback/", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::RedirectUriNotAllowed));
        assert!(!sink.entries()[0].success);
    }

    #[tokio::test]
    async fn callback_unknown_session_fails() {
        let (handler, _) = handler("https://idp.example.com/token");
        let err = handler.callback("code", "state", "missing").await.unwrap_err();
        assert!(matches!(err, OAuthError::SessionNotFound));
    }

    #[tokio::test]
    async fn callback_state_mismatch_preserves_session() {
        let (handler, _) = handler("https://idp.example.com/token");
        let outcome = handler
            .authorize("https://app.example.com/callback", None, None)
            .await
            .unwrap();

        // Attacker replays the victim's code with their own state.
        let err = handler
            .callback("stolen-code", "attacker-state", &outcome.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::StateMismatch));
        assert_eq!(err.to_string(), "Invalid state parameter");

        // The victim's pending session is unaffected.
        assert_eq!(handler.pending_sessions().await, 1);
    }

    #[tokio::test]
    async fn successful_callback_is_single_use() {
        let endpoint = fake_idp().await;
        let (handler, _) = handler(&endpoint);
        let outcome = handler
            .authorize("https://app.example.com/callback", None, None)
            .await
            .unwrap();

        let tokens = handler
            .callback("auth-code", &outcome.state, &outcome.session_id)
            .await
            .unwrap();
        assert_eq!(tokens["access_token"], "granted");

        // Replay: the session is gone.
        let err = handler
            .callback("auth-code", &outcome.state, &outcome.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::SessionNotFound));
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_removed() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut cfg = config("https://idp.example.com/token");
        cfg.session_ttl_seconds = 0;
        let handler = OAuthRedirectHandler::new(cfg, Environment::Test, sink).unwrap();

        let outcome = handler
            .authorize("https://app.example.com/callback", None, None)
            .await
            .unwrap();
        let err = handler
            .callback("code", &outcome.state, &outcome.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::SessionExpired));
        assert_eq!(handler.pending_sessions().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions() {
        let sink = Arc::new(MemoryAuditSink::new());
        let mut cfg = config("https://idp.example.com/token");
        cfg.session_ttl_seconds = 0;
        let handler = OAuthRedirectHandler::new(cfg, Environment::Test, sink).unwrap();
        handler
            .authorize("https://app.example.com/callback", None, None)
            .await
            .unwrap();

        handler.sweep().await;
        assert_eq!(handler.pending_sessions().await, 0);
    }

    #[tokio::test]
    async fn production_requires_https_token_endpoint() {
        let sink = Arc::new(MemoryAuditSink::new());
        let handler = OAuthRedirectHandler::new(
            config("http://idp.example.com/token"),
            Environment::Production,
            sink,
        )
        .unwrap();
        let outcome = handler
            .authorize("https://app.example.com/callback", None, None)
            .await
            .unwrap();
        let err = handler
            .callback("code", &outcome.state, &outcome.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::InsecureEndpoint));
    }

    #[tokio::test]
    async fn custom_state_and_scopes_are_respected() {
        let (handler, _) = handler("https://idp.example.com/token");
        let outcome = handler
            .authorize(
                "https://app.example.com/callback",
                Some(vec!["openid".to_string(), "profile".to_string()]),
                Some("caller-state".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(outcome.state, "caller-state");
        let url = url::Url::parse(&outcome.authorize_url).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["scope"], "openid profile");
    }
}
