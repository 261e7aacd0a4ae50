// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delegation: untrusted modules behind a trusted registry.
//!
//! A [`DelegationModule`] executes operations against one back-end under
//! a switched legacy identity. Modules are *untrusted for audit purposes*:
//! whatever audit trail a module authors, the registry overlays its own
//! ground-truth fields before anything reaches the audit pipeline (see
//! [`registry`]).

pub mod kerberos;
pub mod registry;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;

use crate::audit::AuditEntry;
use crate::auth::UserSession;
use crate::config::ModuleKind;
use crate::token::TokenExchangeEngine;

pub use registry::DelegationRegistry;

/// Error raised inside delegation modules.
///
/// Modules catch these and fold them into a [`DelegationResult`]; only
/// the sanitised public message crosses the module boundary, while the
/// full detail goes to the module's audit trail.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("insufficient permissions for this statement")]
    InsufficientPermissions { detail: String },
    #[error("statement contains a dangerous operation")]
    DangerousOperation { detail: String },
    #[error("identifier failed validation")]
    InvalidIdentifier { detail: String },
    #[error("no legacy identity available: token exchange is not configured and the session carries no legacy username")]
    UnresolvedLegacyIdentity,
    #[error("token exchange failed")]
    TokenExchangeFailed { detail: String },
    #[error("required claim missing from delegation token")]
    MissingDelegationClaim { claim: String },
    #[error("database connection failed")]
    ConnectionFailed { detail: String },
    #[error("query execution failed")]
    QueryFailed { detail: String },
    #[error("unsupported action: {action}")]
    UnsupportedAction { action: String },
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("module is already registered: {0}")]
    DuplicateModule(String),
    #[error("module initialization failed: {0}")]
    InitFailed(String),
}

impl DelegationError {
    /// Internal detail for the audit trail. Unlike [`std::fmt::Display`],
    /// this may carry identifiers and statement fragments.
    pub fn audit_detail(&self) -> String {
        match self {
            DelegationError::InsufficientPermissions { detail }
            | DelegationError::DangerousOperation { detail }
            | DelegationError::InvalidIdentifier { detail }
            | DelegationError::TokenExchangeFailed { detail }
            | DelegationError::ConnectionFailed { detail }
            | DelegationError::QueryFailed { detail } => detail.clone(),
            DelegationError::MissingDelegationClaim { claim } => {
                format!("delegation token lacks required claim {claim}")
            }
            other => other.to_string(),
        }
    }
}

/// Result of one delegated operation, with the module-authored audit
/// trail attached. The registry overlays ground truth before emitting it.
#[derive(Debug, Clone)]
pub struct DelegationResult<T = serde_json::Value> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub audit_trail: AuditEntry,
}

impl DelegationResult {
    pub fn ok(data: serde_json::Value, audit_trail: AuditEntry) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            audit_trail,
        }
    }

    pub fn failed(error: impl Into<String>, audit_trail: AuditEntry) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            audit_trail,
        }
    }
}

/// Module health report.
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ModuleHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Shared services the registry hands to modules on every call.
#[derive(Clone)]
pub struct CoreContext {
    pub exchange: Arc<TokenExchangeEngine>,
}

/// Per-call context for [`DelegationModule::delegate`].
pub struct DelegationContext<'a> {
    /// Encrypted-cache session id, when the transport established one.
    pub session_id: Option<&'a str>,
    pub core: &'a CoreContext,
}

/// One delegation back-end.
///
/// The capability set is closed: a module is its name, its kind, and the
/// five lifecycle/dispatch operations below. Anything module-specific
/// travels through `action` + `params`.
#[async_trait]
pub trait DelegationModule: Send + Sync {
    fn name(&self) -> &str;

    fn module_type(&self) -> ModuleKind;

    /// Prepare the module (connection pool, warm-up). Called once by
    /// `initialize_all`; lazily again on first use if it failed.
    async fn initialize(&self) -> Result<(), DelegationError>;

    /// Execute one delegated operation.
    ///
    /// Must not panic and must not throw: every failure is captured in
    /// the returned [`DelegationResult`] with a module audit trail.
    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        params: &serde_json::Value,
        context: DelegationContext<'_>,
    ) -> DelegationResult;

    /// Cheap pre-check whether `session` may invoke `action` at all.
    async fn validate_access(&self, session: &UserSession, action: &str) -> bool;

    async fn health_check(&self) -> ModuleHealth;

    /// Release resources (drain pools). Idempotent.
    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegation_result_constructors() {
        let entry = AuditEntry::new("delegation:test", "op");
        let ok = DelegationResult::ok(serde_json::json!({"x": 1}), entry.clone());
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = DelegationResult::failed("denied", entry);
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("denied"));
        assert!(failed.data.is_none());
    }

    #[test]
    fn public_messages_hide_detail() {
        let error = DelegationError::InsufficientPermissions {
            detail: "DROP requires admin; caller had [sql-read]".to_string(),
        };
        let public = error.to_string();
        assert!(!public.contains("DROP"));
        assert!(error.audit_detail().contains("DROP"));
    }

    #[test]
    fn module_health_constructors() {
        assert!(ModuleHealth::healthy().healthy);
        let bad = ModuleHealth::unhealthy("pool down");
        assert!(!bad.healthy);
        assert_eq!(bad.detail.as_deref(), Some("pool down"));
    }
}
