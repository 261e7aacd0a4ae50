// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Append-only audit pipeline.
//!
//! Every subsystem emits structured [`AuditEntry`] values through an
//! [`AuditSink`]. The `source` provenance tag (`component:subcomponent`)
//! is a non-optional field: an entry without one cannot be constructed
//! through [`AuditEntry::new`]. Entries arriving from *untrusted* module
//! code may still carry an empty string; the sink defensively stamps those
//! `"unknown"` and records a self-audit violation.
//!
//! ## Sinks
//!
//! - [`TracingAuditSink`] - production sink, emits through `tracing`
//! - [`MemoryAuditSink`] - bounded in-memory ring, used by tests and the
//!   admin audit query endpoint
//! - [`NullAuditSink`] - used when auditing is disabled; callers never
//!   branch on its presence
//!
//! Appending never fails back into the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Shared handle to the configured audit sink.
pub type SharedAudit = Arc<dyn AuditSink>;

/// Source tag stamped on entries that arrived without one.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// One audit record.
///
/// `module_reported_success`, `registry_verified_success` and
/// `registry_timestamp` are ground-truth fields injected by the delegation
/// registry; they are `None` on entries that never crossed the registry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Provenance tag of form `component:subcomponent`.
    pub source: String,
    /// Acting user, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// What happened (e.g. `authenticate`, `delegate`, `cache_invalidation`).
    pub action: String,
    /// Whether the operation succeeded, as reported by the emitter.
    pub success: bool,
    /// Internal reason; never echoed to API clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error description for failed operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
    /// Success as claimed by the module's own audit trail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_reported_success: Option<bool>,
    /// Success as observed by the registry (ground truth).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_verified_success: Option<bool>,
    /// When the registry captured the ground truth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_timestamp: Option<DateTime<Utc>>,
}

impl AuditEntry {
    /// Create a new entry. `source` and `action` are mandatory.
    pub fn new(source: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            user_id: None,
            action: action.into(),
            success: true,
            reason: None,
            error: None,
            metadata: None,
            module_reported_success: None,
            registry_verified_success: None,
            registry_timestamp: None,
        }
    }

    /// Set the acting user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach an internal reason without changing the outcome.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Mark the entry failed with a reason.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.reason = Some(reason.into());
        self
    }

    /// Record an error description (keeps the current `success` flag,
    /// which `failed` usually set already).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Merge a key into the metadata object, creating it if needed.
    pub fn metadata_insert(&mut self, key: &str, value: serde_json::Value) {
        match self.metadata.as_mut().and_then(|m| m.as_object_mut()) {
            Some(map) => {
                map.insert(key.to_string(), value);
            }
            None => {
                self.metadata = Some(serde_json::json!({ key: value }));
            }
        }
    }
}

/// Append-only event sink.
///
/// Implementations must accept any well-formed entry in arrival order and
/// must never propagate an error to the caller.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: AuditEntry);
}

/// Stamp `"unknown"` onto an entry whose untrusted producer left the
/// source empty, and emit a self-audit violation alongside it.
fn sanitize(sink: &dyn AuditSink, mut entry: AuditEntry) -> AuditEntry {
    if entry.source.trim().is_empty() {
        let violation = AuditEntry::new("audit:pipeline", "missing_source")
            .failed(format!("entry for action {:?} had no source", entry.action));
        entry.source = UNKNOWN_SOURCE.to_string();
        sink.append(violation);
    }
    entry
}

// =============================================================================
// Tracing sink
// =============================================================================

/// Production sink: each entry becomes one structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, entry: AuditEntry) {
        let entry = sanitize(self, entry);
        // Serialization of a plain struct cannot fail; fall back to Debug
        // formatting rather than dropping the record.
        let payload = serde_json::to_string(&entry)
            .unwrap_or_else(|_| format!("{entry:?}"));
        if entry.success {
            tracing::info!(
                target: "audit",
                source = %entry.source,
                action = %entry.action,
                entry = %payload,
                "audit"
            );
        } else {
            tracing::warn!(
                target: "audit",
                source = %entry.source,
                action = %entry.action,
                entry = %payload,
                "audit"
            );
        }
    }
}

// =============================================================================
// Memory sink
// =============================================================================

/// Default capacity of the in-memory ring.
const DEFAULT_MEMORY_CAPACITY: usize = 4096;

/// Bounded in-memory sink retaining the most recent entries.
#[derive(Debug)]
pub struct MemoryAuditSink {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: AuditEntry) {
        let entry = sanitize(self, entry);
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }
}

// =============================================================================
// Tee sink
// =============================================================================

/// Fans each entry out to every inner sink in order.
///
/// Used to combine the tracing sink with the in-memory ring that backs
/// the admin audit query endpoint.
pub struct TeeAuditSink {
    sinks: Vec<SharedAudit>,
}

impl TeeAuditSink {
    pub fn new(sinks: Vec<SharedAudit>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for TeeAuditSink {
    fn append(&self, entry: AuditEntry) {
        for sink in &self.sinks {
            sink.append(entry.clone());
        }
    }
}

// =============================================================================
// Null sink
// =============================================================================

/// Sink used when auditing is disabled. Accepts and discards everything so
/// call sites never branch on whether auditing is on.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn append(&self, _entry: AuditEntry) {}
}
