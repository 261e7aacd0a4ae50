// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Kerberos constrained-delegation placeholder.
//!
//! S4U2self/S4U2proxy delegation is a declared non-goal of the current
//! release; this module keeps the registry slot (and configuration shape)
//! reserved without pretending to work. Every delegate call fails cleanly
//! and health reports unavailable.

use async_trait::async_trait;

use crate::audit::AuditEntry;
use crate::auth::UserSession;
use crate::config::ModuleKind;

use super::{DelegationContext, DelegationError, DelegationModule, DelegationResult, ModuleHealth};

pub struct KerberosModule {
    name: String,
}

impl KerberosModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DelegationModule for KerberosModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> ModuleKind {
        ModuleKind::Kerberos
    }

    async fn initialize(&self) -> Result<(), DelegationError> {
        tracing::warn!(module = %self.name, "Kerberos delegation is a placeholder and not functional");
        Ok(())
    }

    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        _params: &serde_json::Value,
        _context: DelegationContext<'_>,
    ) -> DelegationResult {
        let trail = AuditEntry::new(format!("delegation:{}", self.name), action.to_string())
            .with_user(session.user_id.clone())
            .failed("Kerberos delegation is not implemented");
        DelegationResult::failed("Kerberos delegation is not implemented", trail)
    }

    async fn validate_access(&self, _session: &UserSession, _action: &str) -> bool {
        false
    }

    async fn health_check(&self) -> ModuleHealth {
        ModuleHealth::unhealthy("placeholder module; S4U delegation not implemented")
    }

    async fn destroy(&self) {}
}
