// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relational_delegation_broker::api::router;
use relational_delegation_broker::audit::{
    MemoryAuditSink, NullAuditSink, SharedAudit, TeeAuditSink, TracingAuditSink,
};
use relational_delegation_broker::auth::Authenticator;
use relational_delegation_broker::config::{
    BrokerConfig, Environment, ModuleKind, CONFIG_PATH_ENV, SECRETS_PATH_ENV, SERVER_PORT_ENV,
};
use relational_delegation_broker::delegation::kerberos::KerberosModule;
use relational_delegation_broker::delegation::sql::mssql::MssqlDelegationModule;
use relational_delegation_broker::delegation::sql::postgres::PostgresDelegationModule;
use relational_delegation_broker::delegation::{
    CoreContext, DelegationModule, DelegationRegistry,
};
use relational_delegation_broker::oauth::OAuthRedirectHandler;
use relational_delegation_broker::secrets::{
    EnvSecretProvider, FileSecretProvider, ResolutionMode, SecretProvider, SecretResolver,
};
use relational_delegation_broker::state::AppState;
use relational_delegation_broker::token::{EncryptedTokenCache, TokenExchangeEngine};

#[tokio::main]
async fn main() {
    init_tracing();
    let env = Environment::from_env();
    info!(environment = %env, "Delegation broker starting");

    if let Err(error) = run(env).await {
        tracing::error!(error = %error, "startup failed");
        std::process::exit(1);
    }
}

async fn run(env: Environment) -> Result<(), Box<dyn std::error::Error>> {
    // ========== Load and resolve configuration ==========
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "broker.json".to_string());
    info!(path = %config_path, "Loading configuration");
    let mut tree = BrokerConfig::load_raw(&config_path)?;

    // Audit enablement is read from the raw tree so secret resolution
    // itself is audited through the configured sink.
    let audit_enabled = tree
        .get("audit")
        .and_then(|a| a.get("enabled"))
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let retained_entries = tree
        .get("audit")
        .and_then(|a| a.get("retainedEntries"))
        .and_then(|v| v.as_u64())
        .unwrap_or(4096) as usize;
    let (audit, audit_log): (SharedAudit, Option<Arc<MemoryAuditSink>>) = if audit_enabled {
        let ring = Arc::new(MemoryAuditSink::with_capacity(retained_entries));
        (
            Arc::new(TeeAuditSink::new(vec![
                Arc::new(TracingAuditSink) as SharedAudit,
                ring.clone() as SharedAudit,
            ])),
            Some(ring),
        )
    } else {
        (Arc::new(NullAuditSink), None)
    };

    let mut providers: Vec<Box<dyn SecretProvider>> = vec![Box::new(EnvSecretProvider)];
    if let Ok(secrets_path) = std::env::var(SECRETS_PATH_ENV) {
        info!(path = %secrets_path, "Secrets file provider enabled");
        providers.push(Box::new(FileSecretProvider::load(&secrets_path)?));
    }
    SecretResolver::new(providers, ResolutionMode::FailFast, audit.clone())
        .resolve_tree(&mut tree)?;

    let config = Arc::new(BrokerConfig::from_value(tree, env)?);
    info!(
        idps = config.auth.trusted_idps.len(),
        modules = config.delegation.modules.len(),
        "Configuration loaded"
    );

    // ========== Authentication ==========
    let authenticator = Arc::new(Authenticator::new(
        config.auth.trusted_idps.clone(),
        audit.clone(),
    )?);
    prefetch_jwks(&authenticator).await;

    // ========== Token exchange and encrypted cache ==========
    // Cache limits come from the first module that configures them; the
    // cache instance is shared across modules.
    let cache_config = config
        .delegation
        .modules
        .values()
        .find_map(|m| m.token_exchange.as_ref().and_then(|te| te.cache.clone()))
        .unwrap_or_default();
    let cache = Arc::new(EncryptedTokenCache::new(cache_config, audit.clone()));
    cache.clone().start_sweeper();
    let exchange = Arc::new(TokenExchangeEngine::new(cache.clone(), env, audit.clone())?);

    // ========== Delegation registry ==========
    let registry = Arc::new(DelegationRegistry::new(
        CoreContext {
            exchange: exchange.clone(),
        },
        audit.clone(),
    ));
    for (name, module_config) in &config.delegation.modules {
        let module: Arc<dyn DelegationModule> = match module_config.kind {
            ModuleKind::Postgres => {
                Arc::new(PostgresDelegationModule::new(name.clone(), module_config)?)
            }
            ModuleKind::Mssql => {
                Arc::new(MssqlDelegationModule::new(name.clone(), module_config)?)
            }
            ModuleKind::Kerberos => Arc::new(KerberosModule::new(name.clone())),
        };
        registry.register(module)?;
    }
    if let Err(error) = registry.initialize_all().await {
        // Pools initialise lazily on first delegate; a back-end that is
        // down at boot must not take the broker with it.
        warn!(error = %error, "some delegation modules failed to initialize");
    }

    // ========== OAuth redirect handler ==========
    let oauth = match &config.oauth_redirect {
        Some(redirect_config) => {
            let handler = Arc::new(OAuthRedirectHandler::new(
                redirect_config.clone(),
                env,
                audit.clone(),
            )?);
            handler.clone().start_sweeper();
            info!("OAuth redirect handler enabled");
            Some(handler)
        }
        None => None,
    };

    // ========== HTTP surface ==========
    let mut state = AppState::new(
        config.clone(),
        env,
        authenticator,
        registry.clone(),
        cache.clone(),
        oauth.clone(),
        audit,
    );
    if let Some(ring) = audit_log {
        state = state.with_audit_log(ring);
    }

    let app = router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: Duration,
                     _span: &tracing::Span| {
                        tracing::info!(
                            status = %response.status().as_u16(),
                            latency_ms = %latency.as_millis(),
                            "response"
                        );
                    },
                ),
        );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var(SERVER_PORT_ENV)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    info!(address = %addr, docs = "/docs", "Delegation broker listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ========== Graceful drain ==========
    info!("Draining delegation modules");
    registry.destroy_all().await;
    cache.destroy().await;
    if let Some(oauth) = oauth {
        oauth.destroy().await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Pre-fetch every IDP's JWKS with retry - DNS may not be ready
/// immediately in containerized environments.
async fn prefetch_jwks(authenticator: &Authenticator) {
    let max_retries = 5u32;
    for attempt in 1..=max_retries {
        match authenticator.prefetch_jwks().await {
            Ok(()) => {
                info!("JWKS pre-fetch succeeded - authentication ready");
                return;
            }
            Err(error) => {
                if attempt < max_retries {
                    let delay = Duration::from_secs(u64::from(attempt));
                    warn!(
                        attempt,
                        max_retries,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "JWKS fetch failed, retrying..."
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(
                        error = %error,
                        "JWKS fetch failed after {max_retries} attempts - \
                         token validation will fail until a refresh succeeds"
                    );
                }
            }
        }
    }
}

/// Initialize the tracing subscriber with JSON output for production.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}
