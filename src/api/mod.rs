// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::Path,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::state::AppState;

pub mod audit_events;
pub mod bearer;
pub mod delegate;
pub mod health;
pub mod metadata;
pub mod oauth;
pub mod ratelimit;
pub mod security;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        // Delegation endpoints (auth required)
        .route("/delegate/{module}", post(delegate::delegate))
        .route("/modules", get(delegate::list_modules))
        .route("/modules/health", get(delegate::modules_health))
        .route("/cache/metrics", get(delegate::cache_metrics))
        .route("/audit/events", get(audit_events::query_audit_events))
        // Browser-facing PKCE flow (unauthenticated by design: it IS the
        // authentication step)
        .route("/oauth/authorize", post(oauth::authorize))
        .route("/oauth/callback", get(oauth::callback))
        // Rate limiting wraps the API surface; discovery and health stay
        // unmetered.
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            ratelimit::enforce,
        ))
        .with_state(state.clone());

    Router::new()
        // Discovery and health (no auth required)
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata::authorization_server),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(metadata::protected_resource),
        )
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
        // API v1 routes
        .nest("/v1", v1_routes)
        // Swagger/OpenAPI docs
        .route("/api-doc/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui_index))
        .route("/docs/", get(swagger_ui_index))
        .route("/docs/{*rest}", get(swagger_ui_asset))
        .layer(axum::middleware::from_fn(security::security_headers))
        .layer(build_cors_layer())
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn swagger_ui_index() -> Response {
    serve_swagger_ui("index.html")
}

async fn swagger_ui_asset(Path(rest): Path<String>) -> Response {
    serve_swagger_ui(&rest)
}

fn serve_swagger_ui(path: &str) -> Response {
    let config = Arc::new(utoipa_swagger_ui::Config::from("/api-doc/openapi.json"));
    let asset_path = if path.is_empty() || path == "/" {
        "index.html"
    } else {
        path
    };

    match utoipa_swagger_ui::serve(asset_path, config) {
        Ok(Some(file)) => {
            let content_type = file.content_type;
            let body = file.bytes.into_owned();
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

/// CORS policy for the broker surface.
///
/// The transport shell in front may tighten this; the broker itself
/// serves any origin, exposes `WWW-Authenticate` so browser clients can
/// read challenges, and answers preflights for GET/POST.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::WWW_AUTHENTICATE])
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Delegation endpoints
        delegate::delegate,
        delegate::list_modules,
        delegate::modules_health,
        delegate::cache_metrics,
        audit_events::query_audit_events,
        // OAuth redirect flow
        oauth::authorize,
        oauth::callback,
        // Discovery
        metadata::authorization_server,
        metadata::protected_resource,
        // Health endpoints
        health::health,
        health::readiness
    ),
    components(
        schemas(
            crate::auth::Role,
            crate::audit::AuditEntry,
            crate::delegation::ModuleHealth,
            crate::token::CacheMetrics,
            delegate::DelegateRequest,
            delegate::DelegateResponse,
            oauth::AuthorizeRequest,
            oauth::AuthorizeResponse,
            oauth::CallbackQuery,
            health::HealthResponse,
            health::HealthChecks,
            health::ReadyResponse
        )
    ),
    tags(
        (name = "Delegation", description = "Identity-switched operations against legacy back-ends"),
        (name = "OAuth", description = "Browser-facing PKCE authorization-code flow"),
        (name = "Metadata", description = "OAuth discovery documents"),
        (name = "Health", description = "Liveness and readiness checks")
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

/// Security scheme for OpenAPI documentation
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
            let scheme = Http::builder()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .description(Some("IDP-issued bearer JWT"))
                .build();
            components.add_security_scheme("bearer", SecurityScheme::Http(scheme));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let (state, _) = test_state();
        let app = router(state);
        let _ = app.into_make_service();
    }

    #[tokio::test]
    async fn health_serves_without_auth() {
        let (state, _) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metadata_serves_without_auth() {
        let (state, _) = test_state();
        let app = router(state);
        for uri in [
            "/.well-known/oauth-authorization-server",
            "/.well-known/oauth-protected-resource",
        ] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn delegate_without_bearer_is_challenged() {
        let (state, _) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/delegate/sql")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"action":"query","params":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .expect("challenge header")
            .to_str()
            .unwrap();
        assert!(challenge.starts_with("Bearer realm="));
    }

    #[tokio::test]
    async fn generate_openapi_json() {
        let json = ApiDoc::openapi().to_pretty_json().unwrap();
        assert!(json.contains("openapi"));
        assert!(json.contains("/v1/delegate/{module}"));
    }

    mod end_to_end {
        use super::*;
        use crate::auth::test_keys;
        use crate::auth::UserSession;
        use crate::config::ModuleKind;
        use crate::delegation::{
            DelegationContext, DelegationError, DelegationModule, DelegationResult, ModuleHealth,
        };
        use crate::state::test_support::{test_config_tree, test_state_with};
        use async_trait::async_trait;

        /// Stub module that records the identity it saw and succeeds.
        struct EchoModule;

        #[async_trait]
        impl DelegationModule for EchoModule {
            fn name(&self) -> &str {
                "echo"
            }

            fn module_type(&self) -> ModuleKind {
                ModuleKind::Postgres
            }

            async fn initialize(&self) -> Result<(), DelegationError> {
                Ok(())
            }

            async fn delegate(
                &self,
                session: &UserSession,
                action: &str,
                params: &serde_json::Value,
                context: DelegationContext<'_>,
            ) -> DelegationResult {
                let trail = crate::audit::AuditEntry::new("delegation:echo", action.to_string())
                    .with_user(session.user_id.clone());
                DelegationResult::ok(
                    serde_json::json!({
                        "echo": params,
                        "user": session.user_id,
                        "role": session.role.to_string(),
                        "hadCacheSession": context.session_id.is_some(),
                    }),
                    trail,
                )
            }

            async fn validate_access(&self, session: &UserSession, _action: &str) -> bool {
                !session.rejected
            }

            async fn health_check(&self) -> ModuleHealth {
                ModuleHealth::healthy()
            }

            async fn destroy(&self) {}
        }

        async fn signed_state() -> (crate::state::AppState, std::sync::Arc<crate::audit::MemoryAuditSink>)
        {
            let jwks_uri = test_keys::serve_jwks().await;
            let mut tree = test_config_tree();
            tree["auth"]["trustedIDPs"][0]["jwksUri"] = serde_json::json!(jwks_uri);
            let (state, sink) = test_state_with(tree);
            state.registry.register(Arc::new(EchoModule)).unwrap();
            (state, sink)
        }

        #[tokio::test]
        async fn signed_token_delegates_through_the_registry() {
            let (state, sink) = signed_state().await;
            let token = test_keys::sign_token(&test_keys::base_claims(
                "https://idp.example.com",
                "broker",
            ));
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/delegate/echo")
                        .header("Authorization", format!("Bearer {token}"))
                        .header("content-type", "application/json")
                        .body(Body::from(
                            r#"{"action":"query","params":{"sql":"SELECT 1"}}"#,
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["success"], true);
            assert_eq!(body["data"]["user"], "user_1");
            assert_eq!(body["data"]["role"], "admin");
            assert_eq!(body["data"]["hadCacheSession"], true);

            // The overlaid module trail reached the audit pipeline with
            // registry ground truth and no violation.
            let entries = sink.entries();
            let overlay = entries
                .iter()
                .find(|e| e.source == "delegation:echo")
                .expect("module trail emitted");
            assert_eq!(overlay.module_reported_success, Some(true));
            assert_eq!(overlay.registry_verified_success, Some(true));
            assert!(overlay.registry_timestamp.is_some());
            assert!(!entries
                .iter()
                .any(|e| e.action == "trust_boundary_violation"));
        }

        #[tokio::test]
        async fn unmapped_role_is_rejected_before_dispatch() {
            let (state, sink) = signed_state().await;
            let mut claims =
                test_keys::base_claims("https://idp.example.com", "broker");
            claims["roles"] = serde_json::json!(["unknown-bucket"]);
            let token = test_keys::sign_token(&claims);
            let app = router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/delegate/echo")
                        .header("Authorization", format!("Bearer {token}"))
                        .header("content-type", "application/json")
                        .body(Body::from(r#"{"action":"query","params":{}}"#))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);

            // The module never ran: no delegation:echo trail exists.
            assert!(!sink
                .entries()
                .iter()
                .any(|e| e.source == "delegation:echo"));
        }

        #[tokio::test]
        async fn admin_gated_endpoints_respect_roles() {
            let (state, _) = signed_state().await;
            let app = router(state);

            // broker-admin maps to the admin role: metrics are served.
            let admin_token = test_keys::sign_token(&test_keys::base_claims(
                "https://idp.example.com",
                "broker",
            ));
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/v1/cache/metrics")
                        .header("Authorization", format!("Bearer {admin_token}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            // A plain user is refused.
            let mut claims =
                test_keys::base_claims("https://idp.example.com", "broker");
            claims["roles"] = serde_json::json!(["broker-user"]);
            let user_token = test_keys::sign_token(&claims);
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/v1/cache/metrics")
                        .header("Authorization", format!("Bearer {user_token}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);

            // The audit ring is queryable by admins and carries the
            // authentication events just produced.
            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/v1/audit/events?limit=50")
                        .header("Authorization", format!("Bearer {admin_token}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert!(entries
                .as_array()
                .unwrap()
                .iter()
                .any(|e| e["source"] == "auth:service"));
        }
    }
}
