// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret providers.
//!
//! Providers are consulted in configuration order; the first `Some` wins.
//! Built-ins cover the process environment and a JSON secrets file
//! (`SECRETS_PATH`). Deployment-specific providers implement
//! [`SecretProvider`] and slot into the same chain.

use std::collections::BTreeMap;
use std::path::Path;

use super::SecretError;

/// A source of secret values, addressed by logical name.
pub trait SecretProvider: Send + Sync {
    /// Provider name used in audit metadata.
    fn name(&self) -> &str;

    /// Resolve a logical secret name. `Ok(None)` means "not mine";
    /// an `Err` is treated identically by the resolver chain.
    fn resolve(&self, name: &str) -> Result<Option<String>, SecretError>;
}

/// Resolves secrets from the process environment.
#[derive(Debug, Default)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn name(&self) -> &str {
        "env"
    }

    fn resolve(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(std::env::var(name).ok())
    }
}

/// Resolves secrets from a flat JSON object loaded once at construction.
///
/// The file holds `{ "LOGICAL_NAME": "value", ... }`. Values must be
/// strings; anything else in the map is ignored.
#[derive(Debug)]
pub struct FileSecretProvider {
    values: BTreeMap<String, String>,
}

impl FileSecretProvider {
    /// Load the secrets file. Fails if the file is unreadable or not a
    /// JSON object, so a misconfigured `SECRETS_PATH` is caught at startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SecretError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| SecretError::Provider {
            provider: "file".to_string(),
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| SecretError::Provider {
                provider: "file".to_string(),
                message: format!("{} is not valid JSON: {e}", path.display()),
            })?;
        let map = value.as_object().ok_or_else(|| SecretError::Provider {
            provider: "file".to_string(),
            message: format!("{} must contain a JSON object", path.display()),
        })?;

        let values = map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        Ok(Self { values })
    }

    /// Build from an in-memory map (tests, embedded defaults).
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

impl SecretProvider for FileSecretProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn resolve(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(self.values.get(name).cloned())
    }
}
