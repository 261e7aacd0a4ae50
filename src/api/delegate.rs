// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delegation endpoints: the transport face of the registry.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Role;
use crate::delegation::ModuleHealth;
use crate::error::ApiError;
use crate::state::AppState;
use crate::token::CacheMetrics;

use super::bearer::{require_session, Bearer};

/// Body of `POST /v1/delegate/{module}`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRequest {
    /// Module action (e.g. `query`, `list_schemas`).
    pub action: String,
    /// Action parameters; shape is module-defined.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: serde_json::Value,
    /// Optional explicit IDP hint for authentication.
    #[serde(default)]
    pub idp_name: Option<String>,
}

/// Body of a delegation response. Audit detail stays in the pipeline;
/// callers only see the sanitised outcome.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelegateResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /v1/delegate/{module}` - run one delegated operation.
#[utoipa::path(
    post,
    path = "/v1/delegate/{module}",
    tag = "Delegation",
    request_body = DelegateRequest,
    params(("module" = String, Path, description = "Delegation module name")),
    responses(
        (status = 200, description = "Delegation outcome", body = DelegateResponse),
        (status = 401, description = "Authentication failed"),
        (status = 403, description = "Session rejected or insufficient role")
    ),
    security(("bearer" = []))
)]
pub async fn delegate(
    State(state): State<AppState>,
    Path(module): Path<String>,
    Bearer(token): Bearer,
    Json(body): Json<DelegateRequest>,
) -> Result<Json<DelegateResponse>, Response> {
    let session = require_session(&state, &token, body.idp_name.as_deref()).await?;

    // Establish the encrypted-cache session so token exchange can bind
    // delegation tokens to this exact requestor JWT.
    let session_id = state
        .cache
        .activate_session(&session.requestor_jwt, &session.user_id)
        .await;

    let result = state
        .registry
        .delegate(&module, &session, &body.action, &body.params, Some(&session_id))
        .await;

    Ok(Json(DelegateResponse {
        success: result.success,
        data: result.data,
        error: result.error,
    }))
}

/// `GET /v1/modules` - registered module names.
#[utoipa::path(
    get,
    path = "/v1/modules",
    tag = "Delegation",
    responses((status = 200, description = "Registered modules")),
    security(("bearer" = []))
)]
pub async fn list_modules(
    State(state): State<AppState>,
    Bearer(token): Bearer,
) -> Result<Json<Vec<String>>, Response> {
    let _session = require_session(&state, &token, None).await?;
    Ok(Json(state.registry.list()))
}

/// `GET /v1/modules/health` - per-module health (admin only).
#[utoipa::path(
    get,
    path = "/v1/modules/health",
    tag = "Delegation",
    responses((status = 200, description = "Module health report")),
    security(("bearer" = []))
)]
pub async fn modules_health(
    State(state): State<AppState>,
    Bearer(token): Bearer,
) -> Result<Json<std::collections::BTreeMap<String, ModuleHealth>>, Response> {
    let session = require_session(&state, &token, None).await?;
    if session.role != Role::Admin {
        return Err(ApiError::forbidden("admin role required").into_response());
    }
    Ok(Json(state.registry.health_check_all().await))
}

/// `GET /v1/cache/metrics` - encrypted token cache counters (admin only).
#[utoipa::path(
    get,
    path = "/v1/cache/metrics",
    tag = "Delegation",
    responses((status = 200, description = "Cache metrics", body = CacheMetrics)),
    security(("bearer" = []))
)]
pub async fn cache_metrics(
    State(state): State<AppState>,
    Bearer(token): Bearer,
) -> Result<Json<CacheMetrics>, Response> {
    let session = require_session(&state, &token, None).await?;
    if session.role != Role::Admin {
        return Err(ApiError::forbidden("admin role required").into_response());
    }
    Ok(Json(state.cache.get_metrics().await))
}
