// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Browser-facing OAuth redirect endpoints (PKCE flow).

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::oauth::OAuthError;
use crate::state::AppState;

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Exchange detail is not echoed; it reaches the audit pipeline.
        let message = match &self {
            OAuthError::ExchangeFailed(_) => "authorization code exchange failed".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Body of `POST /v1/oauth/authorize`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Response of `POST /v1/oauth/authorize`.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub authorize_url: String,
    pub state: String,
    pub session_id: String,
}

/// Query of `GET /v1/oauth/callback`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
    pub session_id: String,
}

/// `POST /v1/oauth/authorize` - begin a PKCE authorization-code flow.
#[utoipa::path(
    post,
    path = "/v1/oauth/authorize",
    tag = "OAuth",
    request_body = AuthorizeRequest,
    responses(
        (status = 200, description = "Authorization URL and ephemeral session", body = AuthorizeResponse),
        (status = 400, description = "redirect_uri not allowed"),
        (status = 503, description = "OAuth redirect handler not configured")
    )
)]
pub async fn authorize(
    State(state): State<AppState>,
    Json(body): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, Response> {
    let handler = state
        .oauth
        .as_ref()
        .ok_or_else(|| {
            ApiError::service_unavailable("OAuth redirect flow is not configured").into_response()
        })?;

    let outcome = handler
        .authorize(&body.redirect_uri, body.scopes, body.state)
        .await
        .map_err(|e| e.into_response())?;

    Ok(Json(AuthorizeResponse {
        authorize_url: outcome.authorize_url,
        state: outcome.state,
        session_id: outcome.session_id,
    }))
}

/// `GET /v1/oauth/callback` - complete the flow; codes are single-use.
#[utoipa::path(
    get,
    path = "/v1/oauth/callback",
    tag = "OAuth",
    params(
        ("code" = String, Query, description = "Authorization code"),
        ("state" = String, Query, description = "State bound at authorize time"),
        ("sessionId" = String, Query, description = "Ephemeral session id")
    ),
    responses(
        (status = 200, description = "Token response from the IDP"),
        (status = 400, description = "State mismatch"),
        (status = 404, description = "Session unknown or expired")
    )
)]
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let handler = state
        .oauth
        .as_ref()
        .ok_or_else(|| {
            ApiError::service_unavailable("OAuth redirect flow is not configured").into_response()
        })?;

    let tokens = handler
        .callback(&query.code, &query.state, &query.session_id)
        .await
        .map_err(|e| e.into_response())?;
    Ok(Json(tokens))
}
