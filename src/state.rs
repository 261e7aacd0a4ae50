// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Application State
//!
//! Shared state handed to every Axum handler via the `State` extractor.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            AppState                               │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌───────────────────┐  │
//! │  │ Authenticator  │  │ DelegationRegistry│ │ EncryptedToken    │  │
//! │  │  (multi-IDP,   │  │  (trust boundary, │ │ Cache (AES-GCM,   │  │
//! │  │   JWKS cached) │  │   module table)   │ │  AAD-bound)       │  │
//! │  └────────────────┘  └──────────────────┘  └───────────────────┘  │
//! │  ┌────────────────┐  ┌──────────────────────────────────────────┐ │
//! │  │ OAuth redirect │  │ AuditSink (tracing / memory / null)      │ │
//! │  │ (PKCE, opt.)   │  │                                          │ │
//! │  └────────────────┘  └──────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is reference-counted; `AppState` is `Clone` and shared
//! across request tasks. Each map inside has a single owning component -
//! handlers only hold these `Arc` handles.

use std::sync::Arc;

use crate::api::ratelimit::RateLimiter;
use crate::audit::{MemoryAuditSink, SharedAudit};
use crate::auth::Authenticator;
use crate::config::{BrokerConfig, Environment};
use crate::delegation::DelegationRegistry;
use crate::oauth::OAuthRedirectHandler;
use crate::token::EncryptedTokenCache;

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub env: Environment,
    pub authenticator: Arc<Authenticator>,
    pub registry: Arc<DelegationRegistry>,
    pub cache: Arc<EncryptedTokenCache>,
    /// Present only when `oauthRedirect` is configured.
    pub oauth: Option<Arc<OAuthRedirectHandler>>,
    pub audit: SharedAudit,
    /// In-memory audit ring backing the admin query endpoint; `None`
    /// when auditing is disabled.
    pub audit_log: Option<Arc<MemoryAuditSink>>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BrokerConfig>,
        env: Environment,
        authenticator: Arc<Authenticator>,
        registry: Arc<DelegationRegistry>,
        cache: Arc<EncryptedTokenCache>,
        oauth: Option<Arc<OAuthRedirectHandler>>,
        audit: SharedAudit,
    ) -> Self {
        let rate_limiting = config.rate_limiting.clone();
        Self {
            config,
            env,
            authenticator,
            registry,
            cache,
            oauth,
            audit,
            audit_log: None,
            rate_limiter: Arc::new(RateLimiter::new(rate_limiting)),
        }
    }

    /// Retain an in-memory audit ring for the admin query endpoint.
    pub fn with_audit_log(mut self, audit_log: Arc<MemoryAuditSink>) -> Self {
        self.audit_log = Some(audit_log);
        self
    }
}

#[cfg(test)]
pub mod test_support {
    //! Builders for handler and router tests.

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::TokenCacheConfig;
    use crate::delegation::CoreContext;
    use crate::token::TokenExchangeEngine;

    /// Minimal development-profile state with one trusted IDP and an
    /// in-memory audit sink.
    pub fn test_state() -> (AppState, Arc<MemoryAuditSink>) {
        test_state_with(test_config_tree())
    }

    pub fn test_config_tree() -> serde_json::Value {
        serde_json::json!({
            "server": { "name": "broker-test", "url": "http://localhost:8080" },
            "auth": {
                "trustedIDPs": [{
                    "name": "primary",
                    "issuer": "https://idp.example.com",
                    "jwksUri": "https://idp.example.com/jwks",
                    "audience": "broker",
                    "roleMapping": {
                        "adminRoles": ["broker-admin"],
                        "userRoles": ["broker-user"]
                    }
                }],
                "requiredScopes": ["broker:delegate"]
            },
            "delegation": { "modules": {} },
            "oauthRedirect": {
                "idpName": "primary",
                "authorizationEndpoint": "https://idp.example.com/authorize",
                "tokenEndpoint": "https://idp.example.com/token",
                "clientId": "broker",
                "allowedRedirectUris": ["https://app.example.com/callback"]
            }
        })
    }

    pub fn test_state_with(tree: serde_json::Value) -> (AppState, Arc<MemoryAuditSink>) {
        let sink: Arc<MemoryAuditSink> = Arc::new(MemoryAuditSink::new());
        let audit: SharedAudit = sink.clone();
        let config =
            Arc::new(BrokerConfig::from_value(tree, Environment::Test).expect("test config"));

        let authenticator = Arc::new(
            Authenticator::new(config.auth.trusted_idps.clone(), audit.clone())
                .expect("authenticator"),
        );
        let cache = Arc::new(EncryptedTokenCache::new(
            TokenCacheConfig::default(),
            audit.clone(),
        ));
        let exchange = Arc::new(
            TokenExchangeEngine::new(cache.clone(), Environment::Test, audit.clone())
                .expect("exchange engine"),
        );
        let registry = Arc::new(DelegationRegistry::new(
            CoreContext {
                exchange: exchange.clone(),
            },
            audit.clone(),
        ));
        let oauth = config.oauth_redirect.clone().map(|cfg| {
            Arc::new(
                OAuthRedirectHandler::new(cfg, Environment::Test, audit.clone())
                    .expect("oauth handler"),
            )
        });

        (
            AppState::new(
                config,
                Environment::Test,
                authenticator,
                registry,
                cache,
                oauth,
                audit,
            )
            .with_audit_log(sink.clone()),
            sink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_state;

    #[test]
    fn state_can_be_cloned() {
        let (state, _) = test_state();
        let cloned = state.clone();
        assert_eq!(cloned.config.server.name, "broker-test");
        assert!(cloned.oauth.is_some());
    }
}
