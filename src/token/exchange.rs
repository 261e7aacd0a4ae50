// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! RFC 8693 token-exchange client.
//!
//! Exchanges the caller's requestor JWT for a delegation token bound to a
//! downstream audience. Results are cached in the encrypted token cache
//! under `te:<audience>` when the module's cache policy allows, keyed to
//! the exact requestor token via AAD - a refreshed caller token can never
//! receive another token's cached delegation.
//!
//! IDP rejections are *expected* negatives and come back inside
//! [`ExchangeOutcome`], not as errors. Every exchange, hit or miss,
//! success or failure, is audited with
//! `source = "delegation:token-exchange"` and its duration.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;

use crate::audit::{AuditEntry, SharedAudit};
use crate::auth::AuthError;
use crate::config::{Environment, TokenExchangeConfig};

use super::cache::EncryptedTokenCache;

/// Audit source tag for exchange events.
const AUDIT_SOURCE: &str = "delegation:token-exchange";

/// RFC 8693 grant type.
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Outcome of one exchange attempt.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOutcome {
    pub success: bool,
    pub access_token: Option<String>,
    pub issued_token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// Whether the token came from the encrypted cache.
    pub cache_hit: bool,
}

impl ExchangeOutcome {
    fn failure(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_description: Some(description.into()),
            ..Self::default()
        }
    }
}

/// Successful token endpoint response body (RFC 8693 §2.2.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    issued_token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Error token endpoint response body (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// RFC 8693 client with encrypted-cache integration.
pub struct TokenExchangeEngine {
    client: reqwest::Client,
    cache: Arc<EncryptedTokenCache>,
    env: Environment,
    audit: SharedAudit,
}

impl TokenExchangeEngine {
    pub fn new(
        cache: Arc<EncryptedTokenCache>,
        env: Environment,
        audit: SharedAudit,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| AuthError::InternalError(format!("HTTP client: {e}")))?,
            cache,
            env,
            audit,
        })
    }

    /// Handle to the encrypted cache (session activation, metrics).
    pub fn cache(&self) -> &Arc<EncryptedTokenCache> {
        &self.cache
    }

    /// Exchange `requestor_jwt` for a delegation token per `config`.
    ///
    /// `session_id`/`jwt_subject` enable the encrypted cache; without them
    /// every call hits the IDP.
    pub async fn perform_exchange(
        &self,
        config: &TokenExchangeConfig,
        requestor_jwt: &str,
        session_id: Option<&str>,
        jwt_subject: Option<&str>,
    ) -> ExchangeOutcome {
        let started = Instant::now();
        let outcome = self
            .perform_exchange_inner(config, requestor_jwt, session_id, jwt_subject)
            .await;

        let mut entry = AuditEntry::new(AUDIT_SOURCE, "token_exchange").with_metadata(
            serde_json::json!({
                "audience": config.audience,
                "idp": config.idp_name,
                "durationMs": started.elapsed().as_millis() as u64,
                "cacheHit": outcome.cache_hit,
            }),
        );
        if !outcome.success {
            entry = entry.failed(
                outcome
                    .error_description
                    .clone()
                    .or_else(|| outcome.error.clone())
                    .unwrap_or_else(|| "exchange failed".to_string()),
            );
            if let Some(error) = &outcome.error {
                entry = entry.with_error(error.clone());
            }
        }
        if let Some(subject) = jwt_subject {
            entry = entry.with_user(subject);
        }
        self.audit.append(entry);
        outcome
    }

    async fn perform_exchange_inner(
        &self,
        config: &TokenExchangeConfig,
        requestor_jwt: &str,
        session_id: Option<&str>,
        jwt_subject: Option<&str>,
    ) -> ExchangeOutcome {
        if self.env.requires_https() && !config.token_endpoint.starts_with("https://") {
            return ExchangeOutcome::failure(
                "insecure_endpoint",
                "token endpoint must use HTTPS in production",
            );
        }

        let cache_enabled = config.cache.as_ref().map(|c| c.enabled).unwrap_or(false);
        let cache_key = format!("te:{}", config.audience);

        if cache_enabled {
            if let Some(session_id) = session_id {
                if let Some(token) = self.cache.get(session_id, &cache_key, requestor_jwt).await {
                    return ExchangeOutcome {
                        success: true,
                        access_token: Some(token),
                        issued_token_type: Some(
                            "urn:ietf:params:oauth:token-type:access_token".to_string(),
                        ),
                        cache_hit: true,
                        ..ExchangeOutcome::default()
                    };
                }
            }
        }

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", GRANT_TYPE),
            ("subject_token", requestor_jwt),
            ("subject_token_type", &config.subject_token_type),
            ("audience", &config.audience),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ];
        if let Some(resource) = &config.resource {
            form.push(("resource", resource));
        }
        if let Some(scope) = &config.scope {
            form.push(("scope", scope));
        }
        if let Some(requested) = &config.requested_token_type {
            form.push(("requested_token_type", requested));
        }

        let response = match self
            .client
            .post(&config.token_endpoint)
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                return ExchangeOutcome::failure(
                    "endpoint_unreachable",
                    format!("token endpoint request failed: {error}"),
                );
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body: TokenErrorResponse = response.json().await.unwrap_or(TokenErrorResponse {
                error: None,
                error_description: None,
            });
            return ExchangeOutcome::failure(
                body.error.unwrap_or_else(|| format!("http_{}", status.as_u16())),
                body.error_description
                    .unwrap_or_else(|| "IDP rejected the token exchange".to_string()),
            );
        }

        let body: TokenResponse = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                return ExchangeOutcome::failure(
                    "invalid_response",
                    format!("token endpoint returned malformed JSON: {error}"),
                );
            }
        };

        if cache_enabled {
            if let (Some(expires_in), Some(subject)) = (body.expires_in, jwt_subject) {
                let session_id = self.cache.activate_session(requestor_jwt, subject).await;
                let expires_at = Utc::now() + chrono::Duration::seconds(expires_in as i64);
                if let Err(error) = self
                    .cache
                    .set(
                        &session_id,
                        &cache_key,
                        &body.access_token,
                        requestor_jwt,
                        expires_at,
                    )
                    .await
                {
                    tracing::warn!(error = %error, "failed to cache delegation token");
                }
            }
        }

        ExchangeOutcome {
            success: true,
            access_token: Some(body.access_token),
            issued_token_type: body.issued_token_type,
            expires_in: body.expires_in,
            error: None,
            error_description: None,
            cache_hit: false,
        }
    }
}

/// Decode a JWT payload **without** verifying the signature.
///
/// Only for tokens received directly from the IDP over TLS (the exchange
/// response); anything arriving from a caller goes through the
/// authenticator instead.
pub fn decode_claims_unverified(
    token: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
    let data = jsonwebtoken::dangerous::insecure_decode::<
        serde_json::Map<String, serde_json::Value>,
    >(token)
    .map_err(|_| AuthError::InvalidEncoding)?;
    Ok(data.claims)
}
