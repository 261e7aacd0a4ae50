// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bearer-token extraction with RFC 6750 challenges.
//!
//! A missing or malformed `Authorization` header yields a `401` carrying
//! `WWW-Authenticate: Bearer realm="<serverName>"` plus, when configured,
//! the advertised scopes and the RFC 9728 `resource_metadata` pointer.
//! Signature/claim failures from the authenticator come back as plain
//! [`AuthError`] responses - the challenge is only for header problems.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::auth::UserSession;
use crate::error::ApiError;
use crate::state::AppState;

/// Raw bearer token extracted from the `Authorization` header.
pub struct Bearer(pub String);

/// 401 challenge response for absent/malformed credentials.
#[derive(Debug)]
pub struct Challenge {
    header: String,
}

impl Challenge {
    fn from_state(state: &AppState) -> Self {
        let mut header = format!("Bearer realm=\"{}\"", state.config.server.name);
        if !state.config.auth.required_scopes.is_empty() {
            header.push_str(&format!(
                ", scope=\"{}\"",
                state.config.auth.required_scopes.join(" ")
            ));
        }
        header.push_str(&format!(
            ", resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
            state.config.server.url
        ));
        Self { header }
    }
}

impl IntoResponse for Challenge {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Bearer token required" })),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&self.header) {
            response
                .headers_mut()
                .insert("WWW-Authenticate", value);
        }
        response
    }
}

impl FromRequestParts<AppState> for Bearer {
    type Rejection = Challenge;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Challenge::from_state(state))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Challenge::from_state(state))?;

        if token.is_empty() {
            return Err(Challenge::from_state(state));
        }
        Ok(Bearer(token.to_string()))
    }
}

/// Authenticate a bearer token and apply the dual rejection check.
///
/// Both the outcome's `rejected` flag and the session's own flag are
/// checked before the session is released to a tool handler - a rejected
/// session must never reach a delegation module.
pub async fn require_session(
    state: &AppState,
    token: &str,
    idp_hint: Option<&str>,
) -> Result<UserSession, Response> {
    let outcome = state
        .authenticator
        .authenticate(token, idp_hint)
        .await
        .map_err(|error| error.into_response())?;

    if outcome.rejected || outcome.session.rejected {
        return Err(ApiError::forbidden("Session was rejected by role mapping").into_response());
    }
    Ok(outcome.session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use axum::body::to_bytes;
    use axum::http::Request;

    fn parts_with(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/v1/delegate/sql");
        if let Some(value) = header {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn missing_header_produces_challenge() {
        let (state, _) = test_state();
        let mut parts = parts_with(None);
        let challenge = Bearer::from_request_parts(&mut parts, &state)
            .await
            .err()
            .unwrap();

        let response = challenge.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let header = response
            .headers()
            .get("WWW-Authenticate")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(header.starts_with("Bearer realm=\"broker-test\""));
        assert!(header.contains("scope=\"broker:delegate\""));
        assert!(header.contains(
            "resource_metadata=\"http://localhost:8080/.well-known/oauth-protected-resource\""
        ));
    }

    #[tokio::test]
    async fn malformed_prefix_produces_challenge() {
        let (state, _) = test_state();
        for value in ["Basic abc", "bearer lowercase", "Bearer ", "token"] {
            let mut parts = parts_with(Some(value));
            assert!(
                Bearer::from_request_parts(&mut parts, &state).await.is_err(),
                "{value:?} must be challenged"
            );
        }
    }

    #[tokio::test]
    async fn well_formed_header_extracts_token() {
        let (state, _) = test_state();
        let mut parts = parts_with(Some("Bearer h.p.s"));
        let Bearer(token) = Bearer::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(token, "h.p.s");
    }

    #[tokio::test]
    async fn require_session_surfaces_auth_errors() {
        let (state, _) = test_state();
        let response = require_session(&state, "garbage", None).await.err().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error_code"], "invalid_format");
    }
}
