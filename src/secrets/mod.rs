// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret resolution over the raw configuration tree.
//!
//! A **secret descriptor** is a JSON object containing exactly one key
//! `"$secret"` whose value is a non-empty string naming a logical secret.
//! The resolver walks the tree depth-first and replaces each descriptor
//! with the first value any provider in the configured chain returns.
//!
//! Array elements are walked (an object nested inside an array still has
//! its properties substituted) but are never substituted *as elements*,
//! so a bare descriptor sitting directly in an array stays intact.
//!
//! ## Modes
//!
//! - [`ResolutionMode::FailFast`] (default at startup): the first
//!   unresolved descriptor aborts with [`SecretError::NotResolved`]
//!   carrying the dotted path.
//! - [`ResolutionMode::Lenient`]: unresolved descriptors are left intact.
//!
//! A provider that errors is treated as having no value; the chain moves
//! on. Every resolution attempt, successful or not, is audited with
//! `source = "secret:resolution"`.

mod providers;

pub use providers::{EnvSecretProvider, FileSecretProvider, SecretProvider};

use crate::audit::{AuditEntry, SharedAudit};

/// Audit source tag for all resolution events.
const AUDIT_SOURCE: &str = "secret:resolution";

/// Key that marks an object as a secret descriptor.
const DESCRIPTOR_KEY: &str = "$secret";

/// Secret resolution error.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// No provider produced a value for the descriptor at `path`.
    #[error("secret not resolved at {path} (logical name {name})")]
    NotResolved { path: String, name: String },
    /// A provider failed in a way that should surface (currently only
    /// used by providers' own constructors, never by the walk).
    #[error("secret provider {provider} failed: {message}")]
    Provider { provider: String, message: String },
}

/// Behaviour on an unresolved descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    #[default]
    FailFast,
    Lenient,
}

/// Walks a configuration tree and substitutes secret descriptors using a
/// prioritised provider chain.
pub struct SecretResolver {
    providers: Vec<Box<dyn SecretProvider>>,
    mode: ResolutionMode,
    audit: SharedAudit,
}

impl SecretResolver {
    pub fn new(
        providers: Vec<Box<dyn SecretProvider>>,
        mode: ResolutionMode,
        audit: SharedAudit,
    ) -> Self {
        Self {
            providers,
            mode,
            audit,
        }
    }

    /// Resolve all descriptors in `tree` in place.
    ///
    /// Resolving an already-resolved tree is a no-op: substituted values
    /// are plain strings and no longer match the descriptor shape.
    pub fn resolve_tree(&self, tree: &mut serde_json::Value) -> Result<(), SecretError> {
        self.walk(tree, &mut Vec::new())
    }

    fn walk(&self, node: &mut serde_json::Value, path: &mut Vec<String>) -> Result<(), SecretError> {
        match node {
            serde_json::Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    path.push(key.clone());
                    if let Some(name) = descriptor_name(child) {
                        self.substitute(child, &name, path)?;
                    } else {
                        self.walk(child, path)?;
                    }
                    path.pop();
                }
                Ok(())
            }
            serde_json::Value::Array(items) => {
                // Elements are walked but never substituted directly.
                for (index, child) in items.iter_mut().enumerate() {
                    path.push(index.to_string());
                    self.walk(child, path)?;
                    path.pop();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn substitute(
        &self,
        node: &mut serde_json::Value,
        name: &str,
        path: &[String],
    ) -> Result<(), SecretError> {
        let dotted = path.join(".");
        for provider in &self.providers {
            // A provider error counts as "no value"; the chain continues.
            match provider.resolve(name) {
                Ok(Some(value)) => {
                    self.audit.append(
                        AuditEntry::new(AUDIT_SOURCE, "resolve")
                            .with_metadata(serde_json::json!({
                                "path": dotted,
                                "name": name,
                                "provider": provider.name(),
                            })),
                    );
                    *node = serde_json::Value::String(value);
                    return Ok(());
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(
                        provider = provider.name(),
                        secret = name,
                        error = %error,
                        "secret provider failed; trying next"
                    );
                }
            }
        }

        self.audit.append(
            AuditEntry::new(AUDIT_SOURCE, "resolve")
                .failed(format!("no provider resolved secret {name}"))
                .with_metadata(serde_json::json!({ "path": dotted, "name": name })),
        );

        match self.mode {
            ResolutionMode::FailFast => Err(SecretError::NotResolved {
                path: dotted,
                name: name.to_string(),
            }),
            ResolutionMode::Lenient => Ok(()),
        }
    }
}

/// Return the logical name if `node` is a well-formed secret descriptor.
fn descriptor_name(node: &serde_json::Value) -> Option<String> {
    let map = node.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let name = map.get(DESCRIPTOR_KEY)?.as_str()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Test provider backed by a static map; errors when poisoned.
    struct MapProvider {
        name: &'static str,
        values: BTreeMap<String, String>,
        poisoned: bool,
    }

    impl MapProvider {
        fn new(name: &'static str, pairs: &[(&str, &str)]) -> Self {
            Self {
                name,
                values: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                poisoned: false,
            }
        }

        fn poisoned(name: &'static str) -> Self {
            Self {
                name,
                values: BTreeMap::new(),
                poisoned: true,
            }
        }
    }

    impl SecretProvider for MapProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn resolve(&self, name: &str) -> Result<Option<String>, SecretError> {
            if self.poisoned {
                return Err(SecretError::Provider {
                    provider: self.name.to_string(),
                    message: "unavailable".to_string(),
                });
            }
            Ok(self.values.get(name).cloned())
        }
    }

    fn resolver(providers: Vec<Box<dyn SecretProvider>>, mode: ResolutionMode) -> (SecretResolver, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (SecretResolver::new(providers, mode, sink.clone()), sink)
    }

    #[test]
    fn resolves_descriptor_via_first_matching_provider() {
        let (resolver, sink) = resolver(
            vec![
                Box::new(MapProvider::new("env", &[])),
                Box::new(MapProvider::new("file", &[("PG", "pw")])),
            ],
            ResolutionMode::FailFast,
        );
        let mut tree = serde_json::json!({ "db": { "password": { "$secret": "PG" } } });
        resolver.resolve_tree(&mut tree).unwrap();

        assert_eq!(tree["db"]["password"], "pw");
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, "secret:resolution");
        assert_eq!(entries[0].metadata.as_ref().unwrap()["provider"], "file");
    }

    #[test]
    fn earlier_provider_wins() {
        let (resolver, _) = resolver(
            vec![
                Box::new(MapProvider::new("env", &[("PG", "from-env")])),
                Box::new(MapProvider::new("file", &[("PG", "from-file")])),
            ],
            ResolutionMode::FailFast,
        );
        let mut tree = serde_json::json!({ "password": { "$secret": "PG" } });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["password"], "from-env");
    }

    #[test]
    fn erroring_provider_is_skipped() {
        let (resolver, _) = resolver(
            vec![
                Box::new(MapProvider::poisoned("vault")),
                Box::new(MapProvider::new("file", &[("PG", "pw")])),
            ],
            ResolutionMode::FailFast,
        );
        let mut tree = serde_json::json!({ "password": { "$secret": "PG" } });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["password"], "pw");
    }

    #[test]
    fn fail_fast_reports_dotted_path() {
        let (resolver, sink) = resolver(
            vec![Box::new(MapProvider::new("env", &[]))],
            ResolutionMode::FailFast,
        );
        let mut tree = serde_json::json!({ "db": { "password": { "$secret": "MISSING" } } });
        let err = resolver.resolve_tree(&mut tree).unwrap_err();

        match err {
            SecretError::NotResolved { path, name } => {
                assert_eq!(path, "db.password");
                assert_eq!(name, "MISSING");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sink.entries().len(), 1);
        assert!(!sink.entries()[0].success);
    }

    #[test]
    fn lenient_mode_leaves_descriptor_intact() {
        let (resolver, _) = resolver(
            vec![Box::new(MapProvider::new("env", &[]))],
            ResolutionMode::Lenient,
        );
        let mut tree = serde_json::json!({ "password": { "$secret": "MISSING" } });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["password"]["$secret"], "MISSING");
    }

    #[test]
    fn array_elements_are_not_substituted_directly() {
        let (resolver, _) = resolver(
            vec![Box::new(MapProvider::new("env", &[("A", "resolved")]))],
            ResolutionMode::FailFast,
        );
        // A bare descriptor sitting in an array stays intact...
        let mut tree = serde_json::json!({ "list": [ { "$secret": "A" } ] });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["list"][0]["$secret"], "A");

        // ...but object properties nested inside array elements resolve.
        let mut tree = serde_json::json!({ "list": [ { "inner": { "$secret": "A" } } ] });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["list"][0]["inner"], "resolved");
    }

    #[test]
    fn malformed_descriptors_are_walked_not_substituted() {
        let (resolver, _) = resolver(
            vec![Box::new(MapProvider::new("env", &[("A", "resolved")]))],
            ResolutionMode::FailFast,
        );
        // Two keys: not a descriptor.
        let mut tree = serde_json::json!({ "x": { "$secret": "A", "other": 1 } });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["x"]["$secret"], "A");

        // Empty logical name: not a descriptor.
        let mut tree = serde_json::json!({ "x": { "$secret": "" } });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["x"]["$secret"], "");

        // Non-string value: not a descriptor.
        let mut tree = serde_json::json!({ "x": { "$secret": 42 } });
        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree["x"]["$secret"], 42);
    }

    #[test]
    fn resolution_is_idempotent() {
        let (resolver, sink) = resolver(
            vec![Box::new(MapProvider::new("env", &[("PG", "pw")]))],
            ResolutionMode::FailFast,
        );
        let mut tree = serde_json::json!({ "db": { "password": { "$secret": "PG" } } });
        resolver.resolve_tree(&mut tree).unwrap();
        let resolved = tree.clone();

        resolver.resolve_tree(&mut tree).unwrap();
        assert_eq!(tree, resolved);
        // Only the first pass produced an audit entry.
        assert_eq!(sink.entries().len(), 1);
    }
}
