// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-request user session.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use super::roles::Role;

/// Process-wide monotonic session version counter.
static SESSION_VERSION: AtomicU64 = AtomicU64::new(1);

/// The resolved identity of one authenticated request.
///
/// Created per request by the authenticator and discarded when the request
/// completes; never persisted. The `requestor_jwt` field carries the exact
/// bearer-token bytes that produced the session - token exchange binds its
/// cache entries to them via AAD.
///
/// **Invariant**: `rejected` is `true` exactly when `role` is
/// [`Role::Unassigned`]; the constructor enforces this and the fields are
/// read-only afterwards.
#[derive(Clone)]
pub struct UserSession {
    pub user_id: String,
    pub username: String,
    /// Back-end-native principal used when no token exchange is configured.
    pub legacy_username: Option<String>,
    pub role: Role,
    /// Raw role strings preserved for downstream gates, in claim order.
    pub custom_roles: Vec<String>,
    pub scopes: BTreeSet<String>,
    /// The verified claim set, as projected from the token payload.
    pub claims: serde_json::Map<String, serde_json::Value>,
    pub rejected: bool,
    /// Exact bytes of the bearer token that produced this session.
    pub requestor_jwt: String,
    version: u64,
}

impl UserSession {
    /// Construct a session; `rejected` is derived from `role`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        username: String,
        legacy_username: Option<String>,
        role: Role,
        custom_roles: Vec<String>,
        scopes: BTreeSet<String>,
        claims: serde_json::Map<String, serde_json::Value>,
        requestor_jwt: String,
    ) -> Self {
        Self {
            user_id,
            username,
            legacy_username,
            role,
            custom_roles,
            scopes,
            claims,
            rejected: role == Role::Unassigned,
            requestor_jwt,
            version: SESSION_VERSION.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Monotonically increasing creation ordinal.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the session carries the given scope.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

// Manual Debug: the requestor JWT is a credential and must not land in
// logs through derive.
impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("legacy_username", &self.legacy_username)
            .field("role", &self.role)
            .field("custom_roles", &self.custom_roles)
            .field("scopes", &self.scopes)
            .field("rejected", &self.rejected)
            .field("requestor_jwt", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}
