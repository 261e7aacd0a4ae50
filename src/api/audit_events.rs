// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admin access to the retained audit ring.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::audit::AuditEntry;
use crate::auth::Role;
use crate::error::ApiError;
use crate::state::AppState;

use super::bearer::{require_session, Bearer};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuditQuery {
    /// Maximum entries to return, newest last. Defaults to 100.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Filter by exact `source` tag.
    #[serde(default)]
    pub source: Option<String>,
}

/// `GET /v1/audit/events` - recent audit entries (admin only).
///
/// Served from the bounded in-memory ring; the durable record is
/// whatever the tracing sink ships to the log pipeline.
#[utoipa::path(
    get,
    path = "/v1/audit/events",
    tag = "Delegation",
    params(
        ("limit" = Option<usize>, Query, description = "Maximum entries to return"),
        ("source" = Option<String>, Query, description = "Filter by source tag")
    ),
    responses(
        (status = 200, description = "Recent audit entries", body = [AuditEntry]),
        (status = 403, description = "Admin role required"),
        (status = 503, description = "Audit retention disabled")
    ),
    security(("bearer" = []))
)]
pub async fn query_audit_events(
    State(state): State<AppState>,
    Bearer(token): Bearer,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, Response> {
    let session = require_session(&state, &token, None).await?;
    if session.role != Role::Admin {
        return Err(ApiError::forbidden("admin role required").into_response());
    }

    let Some(ring) = &state.audit_log else {
        return Err(
            ApiError::service_unavailable("audit retention is disabled").into_response()
        );
    };

    let limit = query.limit.unwrap_or(100);
    let mut entries = ring.entries();
    if let Some(source) = &query.source {
        entries.retain(|e| &e.source == source);
    }
    let skip = entries.len().saturating_sub(limit);
    Ok(Json(entries.split_off(skip)))
}
