// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! OAuth metadata documents (RFC 8414 authorization-server metadata and
//! RFC 9728 protected-resource metadata).

use axum::{extract::State, Json};

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /.well-known/oauth-authorization-server`
///
/// Describes the primary trusted IDP to OAuth 2.1 clients. 500 when no
/// IDPs are configured (the broker cannot authenticate anything).
#[utoipa::path(
    get,
    path = "/.well-known/oauth-authorization-server",
    tag = "Metadata",
    responses(
        (status = 200, description = "Authorization server metadata"),
        (status = 500, description = "No trusted IDPs configured")
    )
)]
pub async fn authorization_server(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let idps = state.authenticator.idp_configs();
    let Some(primary) = idps.first() else {
        return Err(ApiError::internal("no trusted identity providers configured"));
    };

    // Signing algorithms across all IDPs, deduplicated, insertion-ordered.
    let mut algorithms: Vec<String> = Vec::new();
    for idp in &idps {
        for alg in &idp.algorithms {
            let name = alg.to_string();
            if !algorithms.contains(&name) {
                algorithms.push(name);
            }
        }
    }

    let (authorization_endpoint, token_endpoint) = match &state.config.oauth_redirect {
        Some(redirect) => (
            redirect.authorization_endpoint.clone(),
            redirect.token_endpoint.clone(),
        ),
        None => (
            format!("{}/authorize", primary.issuer.trim_end_matches('/')),
            format!("{}/token", primary.issuer.trim_end_matches('/')),
        ),
    };

    Ok(Json(serde_json::json!({
        "issuer": primary.issuer,
        "authorization_endpoint": authorization_endpoint,
        "token_endpoint": token_endpoint,
        "jwks_uri": primary.jwks_uri,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code"],
        "code_challenge_methods_supported": ["S256"],
        "id_token_signing_alg_values_supported": algorithms,
    })))
}

/// `GET /.well-known/oauth-protected-resource`
#[utoipa::path(
    get,
    path = "/.well-known/oauth-protected-resource",
    tag = "Metadata",
    responses(
        (status = 200, description = "Protected resource metadata")
    )
)]
pub async fn protected_resource(State(state): State<AppState>) -> Json<serde_json::Value> {
    let idps = state.authenticator.idp_configs();
    let authorization_servers: Vec<&str> = idps.iter().map(|i| i.issuer.as_str()).collect();

    let mut algorithms: Vec<String> = Vec::new();
    for idp in &idps {
        for alg in &idp.algorithms {
            let name = alg.to_string();
            if !algorithms.contains(&name) {
                algorithms.push(name);
            }
        }
    }

    Json(serde_json::json!({
        "resource": state.config.server.url,
        "authorization_servers": authorization_servers,
        "bearer_methods_supported": ["header"],
        "resource_signing_alg_values_supported": algorithms,
        "scopes_supported": state.config.auth.required_scopes,
        "resource_documentation": format!("{}/docs", state.config.server.url),
    }))
}
