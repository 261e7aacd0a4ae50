// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delegation registry: trusted dispatch over untrusted modules.
//!
//! ## Trust boundary
//!
//! A module authors its own audit trail, but the registry is the only
//! component allowed to write delegation entries into the audit pipeline.
//! On every dispatch it captures the ground truth (`registry_verified_success`
//! from the result it actually observed, plus its own timestamp) and
//! overlays it onto the module's trail. When a module's claimed success
//! disagrees with the observed one, a separate `trust_boundary_violation`
//! entry is emitted - a lying or buggy module cannot falsify the
//! authoritative log.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::audit::{AuditEntry, SharedAudit};
use crate::auth::UserSession;

use super::{
    CoreContext, DelegationContext, DelegationError, DelegationModule, DelegationResult,
    ModuleHealth,
};

/// Audit source for registry-level events.
const REGISTRY_SOURCE: &str = "delegation:registry";

/// Audit source for trust-boundary violations.
const SECURITY_SOURCE: &str = "delegation:registry:security";

/// Registry of delegation modules. Owns the module set exclusively.
pub struct DelegationRegistry {
    modules: RwLock<HashMap<String, Arc<dyn DelegationModule>>>,
    context: CoreContext,
    audit: SharedAudit,
}

impl DelegationRegistry {
    pub fn new(context: CoreContext, audit: SharedAudit) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            context,
            audit,
        }
    }

    /// Register a module. Duplicate names are rejected.
    pub fn register(&self, module: Arc<dyn DelegationModule>) -> Result<(), DelegationError> {
        let name = module.name().to_string();
        let mut modules = self.modules.write().expect("modules lock poisoned");
        if modules.contains_key(&name) {
            return Err(DelegationError::DuplicateModule(name));
        }
        tracing::info!(module = %name, kind = %module.module_type(), "delegation module registered");
        modules.insert(name, module);
        Ok(())
    }

    /// Remove a module, returning it if present.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn DelegationModule>> {
        self.modules.write().expect("modules lock poisoned").remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DelegationModule>> {
        self.modules.read().expect("modules lock poisoned").get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.modules.read().expect("modules lock poisoned").contains_key(name)
    }

    /// Registered module names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .read()
            .expect("modules lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Initialize every registered module.
    ///
    /// Each module's outcome is audited individually; failures are
    /// collected and re-thrown as one aggregate error.
    pub async fn initialize_all(&self) -> Result<(), DelegationError> {
        let modules = self.snapshot();
        let mut failures = Vec::new();

        for module in modules {
            let name = module.name().to_string();
            match module.initialize().await {
                Ok(()) => {
                    self.audit.append(
                        AuditEntry::new(REGISTRY_SOURCE, "module_initialize")
                            .with_metadata(serde_json::json!({ "module": name })),
                    );
                }
                Err(error) => {
                    self.audit.append(
                        AuditEntry::new(REGISTRY_SOURCE, "module_initialize")
                            .failed(error.audit_detail())
                            .with_metadata(serde_json::json!({ "module": name })),
                    );
                    failures.push(format!("{name}: {error}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DelegationError::InitFailed(failures.join("; ")))
        }
    }

    /// Destroy every module and clear the registry.
    pub async fn destroy_all(&self) {
        let modules: Vec<Arc<dyn DelegationModule>> = {
            let mut map = self.modules.write().expect("modules lock poisoned");
            map.drain().map(|(_, m)| m).collect()
        };
        for module in modules {
            module.destroy().await;
            self.audit.append(
                AuditEntry::new(REGISTRY_SOURCE, "module_destroy")
                    .with_metadata(serde_json::json!({ "module": module.name() })),
            );
        }
    }

    /// Health of every registered module, by name.
    pub async fn health_check_all(&self) -> BTreeMap<String, ModuleHealth> {
        let mut report = BTreeMap::new();
        for module in self.snapshot() {
            report.insert(module.name().to_string(), module.health_check().await);
        }
        report
    }

    /// Dispatch one delegated operation through the trust boundary.
    pub async fn delegate(
        &self,
        module_name: &str,
        session: &UserSession,
        action: &str,
        params: &serde_json::Value,
        session_id: Option<&str>,
    ) -> DelegationResult {
        let Some(module) = self.get(module_name) else {
            let entry = AuditEntry::new(REGISTRY_SOURCE, "delegate")
                .with_user(session.user_id.clone())
                .failed(format!("unknown delegation module: {module_name}"));
            self.audit.append(entry.clone());
            return DelegationResult::failed("unknown delegation module", entry);
        };

        let mut result = module
            .delegate(
                session,
                action,
                params,
                DelegationContext {
                    session_id,
                    core: &self.context,
                },
            )
            .await;

        // Ground truth: what the registry actually observed.
        let registry_verified_success = result.success;
        let registry_timestamp = Utc::now();
        let module_reported_success = result.audit_trail.success;

        let trail = &mut result.audit_trail;
        trail.module_reported_success = Some(module_reported_success);
        trail.registry_verified_success = Some(registry_verified_success);
        trail.registry_timestamp = Some(registry_timestamp);
        trail.user_id = Some(session.user_id.clone());
        if trail.source.trim().is_empty() {
            trail.source = format!("delegation:{module_name}");
        }

        if module_reported_success != registry_verified_success {
            self.audit.append(
                AuditEntry::new(SECURITY_SOURCE, "trust_boundary_violation")
                    .with_user(session.user_id.clone())
                    .failed(format!(
                        "module {module_name} reported success={module_reported_success} \
                         but registry observed success={registry_verified_success}"
                    ))
                    .with_metadata(serde_json::json!({
                        "module": module_name,
                        "action": action,
                        "moduleReportedSuccess": module_reported_success,
                        "registryVerifiedSuccess": registry_verified_success,
                        "registryTimestamp": registry_timestamp.to_rfc3339(),
                    })),
            );
        }

        self.audit.append(result.audit_trail.clone());
        result
    }

    fn snapshot(&self) -> Vec<Arc<dyn DelegationModule>> {
        self.modules
            .read()
            .expect("modules lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::auth::Role;
    use crate::config::{Environment, ModuleKind, TokenCacheConfig};
    use crate::token::{EncryptedTokenCache, TokenExchangeEngine};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    /// Configurable fake module for registry tests.
    struct FakeModule {
        name: &'static str,
        /// Actual result success.
        succeed: bool,
        /// Success the module *claims* in its audit trail.
        claim: bool,
        /// Whether the trail carries a source.
        with_source: bool,
        init_error: Option<&'static str>,
    }

    impl FakeModule {
        fn honest(name: &'static str) -> Self {
            Self {
                name,
                succeed: true,
                claim: true,
                with_source: true,
                init_error: None,
            }
        }

        fn lying(name: &'static str) -> Self {
            Self {
                name,
                succeed: false,
                claim: true,
                with_source: true,
                init_error: None,
            }
        }
    }

    #[async_trait]
    impl DelegationModule for FakeModule {
        fn name(&self) -> &str {
            self.name
        }

        fn module_type(&self) -> ModuleKind {
            ModuleKind::Postgres
        }

        async fn initialize(&self) -> Result<(), DelegationError> {
            match self.init_error {
                Some(message) => Err(DelegationError::InitFailed(message.to_string())),
                None => Ok(()),
            }
        }

        async fn delegate(
            &self,
            _session: &UserSession,
            _action: &str,
            _params: &serde_json::Value,
            _context: DelegationContext<'_>,
        ) -> DelegationResult {
            let mut trail = AuditEntry::new(
                if self.with_source {
                    format!("delegation:{}", self.name)
                } else {
                    String::new()
                },
                "delegate",
            );
            trail.success = self.claim;
            if self.succeed {
                DelegationResult::ok(serde_json::json!({ "rows": [] }), trail)
            } else {
                DelegationResult::failed("boom", trail)
            }
        }

        async fn validate_access(&self, _session: &UserSession, _action: &str) -> bool {
            true
        }

        async fn health_check(&self) -> ModuleHealth {
            ModuleHealth::healthy()
        }

        async fn destroy(&self) {}
    }

    fn session() -> UserSession {
        UserSession::new(
            "user_1".to_string(),
            "alice".to_string(),
            None,
            Role::Admin,
            Vec::new(),
            BTreeSet::new(),
            serde_json::Map::new(),
            "h.p.s".to_string(),
        )
    }

    fn registry() -> (DelegationRegistry, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let cache = Arc::new(EncryptedTokenCache::new(
            TokenCacheConfig::default(),
            sink.clone(),
        ));
        let exchange =
            Arc::new(TokenExchangeEngine::new(cache, Environment::Test, sink.clone()).unwrap());
        (
            DelegationRegistry::new(CoreContext { exchange }, sink.clone()),
            sink,
        )
    }

    #[test]
    fn register_rejects_duplicates() {
        let (registry, _) = registry();
        registry.register(Arc::new(FakeModule::honest("sql"))).unwrap();
        let err = registry
            .register(Arc::new(FakeModule::honest("sql")))
            .unwrap_err();
        assert!(matches!(err, DelegationError::DuplicateModule(_)));
        assert_eq!(registry.list(), vec!["sql"]);
    }

    #[test]
    fn unregister_and_has() {
        let (registry, _) = registry();
        registry.register(Arc::new(FakeModule::honest("sql"))).unwrap();
        assert!(registry.has("sql"));
        assert!(registry.unregister("sql").is_some());
        assert!(!registry.has("sql"));
        assert!(registry.unregister("sql").is_none());
    }

    #[tokio::test]
    async fn delegate_unknown_module_audits_and_fails() {
        let (registry, sink) = registry();
        let result = registry
            .delegate("missing", &session(), "query", &serde_json::json!({}), None)
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown delegation module"));
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "delegation:registry");
        assert!(!entries[0].success);
    }

    #[tokio::test]
    async fn honest_module_gets_ground_truth_overlay() {
        let (registry, sink) = registry();
        registry.register(Arc::new(FakeModule::honest("sql"))).unwrap();

        let result = registry
            .delegate("sql", &session(), "query", &serde_json::json!({}), None)
            .await;

        assert!(result.success);
        let trail = &result.audit_trail;
        assert_eq!(trail.module_reported_success, Some(true));
        assert_eq!(trail.registry_verified_success, Some(true));
        assert!(trail.registry_timestamp.is_some());
        assert_eq!(trail.user_id.as_deref(), Some("user_1"));

        // No violation entry; the overlay entry was emitted.
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "delegation:sql");
    }

    #[tokio::test]
    async fn lying_module_triggers_trust_boundary_violation() {
        let (registry, sink) = registry();
        registry.register(Arc::new(FakeModule::lying("sql"))).unwrap();

        let result = registry
            .delegate("sql", &session(), "query", &serde_json::json!({}), None)
            .await;

        assert!(!result.success);
        let trail = &result.audit_trail;
        assert_eq!(trail.module_reported_success, Some(true));
        assert_eq!(trail.registry_verified_success, Some(false));

        let entries = sink.entries();
        let violations: Vec<_> = entries
            .iter()
            .filter(|e| e.action == "trust_boundary_violation")
            .collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].source, "delegation:registry:security");
        // The violation records the same registry timestamp as the overlay.
        let overlay = entries
            .iter()
            .find(|e| e.action == "delegate")
            .unwrap();
        assert_eq!(
            violations[0].metadata.as_ref().unwrap()["registryTimestamp"],
            overlay
                .registry_timestamp
                .unwrap()
                .to_rfc3339()
        );
    }

    #[tokio::test]
    async fn missing_trail_source_defaults_to_module_name() {
        let (registry, sink) = registry();
        registry
            .register(Arc::new(FakeModule {
                name: "sql",
                succeed: true,
                claim: true,
                with_source: false,
                init_error: None,
            }))
            .unwrap();

        let result = registry
            .delegate("sql", &session(), "query", &serde_json::json!({}), None)
            .await;
        assert_eq!(result.audit_trail.source, "delegation:sql");
        assert_eq!(sink.entries()[0].source, "delegation:sql");
    }

    #[tokio::test]
    async fn initialize_all_collects_failures_and_audits_each() {
        let (registry, sink) = registry();
        registry.register(Arc::new(FakeModule::honest("good"))).unwrap();
        registry
            .register(Arc::new(FakeModule {
                name: "bad",
                succeed: true,
                claim: true,
                with_source: true,
                init_error: Some("pool exploded"),
            }))
            .unwrap();

        let err = registry.initialize_all().await.unwrap_err();
        assert!(matches!(err, DelegationError::InitFailed(_)));
        assert!(err.to_string().contains("bad"));

        let entries = sink.entries();
        let init_entries: Vec<_> = entries
            .iter()
            .filter(|e| e.action == "module_initialize")
            .collect();
        assert_eq!(init_entries.len(), 2);
        assert_eq!(init_entries.iter().filter(|e| e.success).count(), 1);
    }

    #[tokio::test]
    async fn destroy_all_empties_the_registry() {
        let (registry, _) = registry();
        registry.register(Arc::new(FakeModule::honest("sql"))).unwrap();
        registry.destroy_all().await;
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn health_check_all_reports_by_name() {
        let (registry, _) = registry();
        registry.register(Arc::new(FakeModule::honest("sql"))).unwrap();
        let report = registry.health_check_all().await;
        assert!(report["sql"].healthy);
    }
}
