// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Session-scoped encrypted cache for delegation tokens.
//!
//! ## Security
//!
//! - Each session gets its own 32-byte AES-256-GCM key from the OS RNG;
//!   the key never leaves this module and is overwritten with zeros when
//!   the session is cleared.
//! - Every encryption uses a fresh random 96-bit IV. IV reuse under the
//!   same key is forbidden; randomness is the mechanism.
//! - The SHA-256 hex digest of the requestor JWT is the GCM *Additional
//!   Authenticated Data*, stored alongside the entry. A `get` presenting
//!   a different JWT deletes the entry and misses - cached delegation
//!   tokens die automatically when the caller's token is refreshed.
//! - Any decryption failure deletes the entry and is audited.
//!
//! ## Bounds
//!
//! Two capacity bounds (per-session and global, both evicting the oldest
//! `created_at`) and a time bound: effective expiry is
//! `min(delegation token exp, now + configured TTL)`. Expired entries are
//! removed lazily on access and proactively by the 60 s sweep, which also
//! clears sessions idle past the session timeout.
//!
//! ## Concurrency
//!
//! `get`/`set`/`clear_session` on one session are mutually exclusive via a
//! per-session async mutex; different sessions proceed concurrently. The
//! sweep takes each session lock in turn, serialising against writers. At
//! most one session lock is ever held at a time, so lock ordering is flat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::audit::{AuditEntry, SharedAudit};
use crate::config::TokenCacheConfig;

/// Audit source tag for cache events.
const AUDIT_SOURCE: &str = "delegation:token-cache";

/// Interval between background sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Cache error type.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no active cache session for the given id")]
    SessionNotFound,
    #[error("encryption failed")]
    Encrypt,
}

/// One encrypted cache entry.
struct CacheEntry {
    ciphertext: Vec<u8>,
    iv: [u8; 12],
    auth_tag: [u8; TAG_LEN],
    /// SHA-256 hex of the requestor JWT used as AAD.
    jwt_hash: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

/// Per-session state. The encryption key is exclusively owned here.
struct SessionMetadata {
    encryption_key: [u8; 32],
    #[allow(dead_code)]
    jwt_subject: String,
    last_active: Instant,
    entries: HashMap<String, CacheEntry>,
}

impl SessionMetadata {
    /// Overwrite the key bytes before the struct is dropped.
    fn zeroise(&mut self) {
        self.encryption_key.fill(0);
    }
}

/// Counters exposed by [`EncryptedTokenCache::get_metrics`].
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

/// Snapshot of cache metrics.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub expired: u64,
    pub active_sessions: usize,
    pub total_entries: usize,
}

/// Session-scoped AES-256-GCM token cache.
pub struct EncryptedTokenCache {
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionMetadata>>>>,
    config: TokenCacheConfig,
    counters: Counters,
    audit: SharedAudit,
    shutdown: CancellationToken,
}

impl EncryptedTokenCache {
    pub fn new(config: TokenCacheConfig, audit: SharedAudit) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            counters: Counters::default(),
            audit,
            shutdown: CancellationToken::new(),
        }
    }

    /// Derive the session id for a requestor JWT.
    ///
    /// `SHA-256-hex(jwt)` - deterministic, so an existing session can be
    /// re-activated from the token alone.
    pub fn session_id_for(requestor_jwt: &str) -> String {
        sha256_hex(requestor_jwt)
    }

    /// Activate (or re-activate) the session for a requestor JWT.
    ///
    /// A new session gets a fresh random encryption key; an existing one
    /// only has its activity timestamp bumped.
    pub async fn activate_session(&self, requestor_jwt: &str, jwt_subject: &str) -> String {
        let session_id = Self::session_id_for(requestor_jwt);
        let mut sessions = self.sessions.lock().await;
        match sessions.get(&session_id) {
            Some(existing) => {
                existing.lock().await.last_active = Instant::now();
            }
            None => {
                let key = Aes256Gcm::generate_key(&mut OsRng);
                sessions.insert(
                    session_id.clone(),
                    Arc::new(Mutex::new(SessionMetadata {
                        encryption_key: key.into(),
                        jwt_subject: jwt_subject.to_string(),
                        last_active: Instant::now(),
                        entries: HashMap::new(),
                    })),
                );
            }
        }
        session_id
    }

    /// Fetch a cached token.
    ///
    /// Returns `None` on miss, expiry, AAD mismatch (which also deletes
    /// the entry) or decryption failure (likewise).
    pub async fn get(
        &self,
        session_id: &str,
        cache_key: &str,
        requestor_jwt: &str,
    ) -> Option<String> {
        let session = self.session_handle(session_id).await?;
        let mut session = session.lock().await;
        session.last_active = Instant::now();

        let entry = match session.entries.get(cache_key) {
            Some(entry) => entry,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        // Lazy expiry.
        if entry.expires_at <= Utc::now() {
            session.entries.remove(cache_key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // AAD binding: a different requestor JWT invalidates the entry.
        let supplied_hash = sha256_hex(requestor_jwt);
        if entry.jwt_hash != supplied_hash {
            session.entries.remove(cache_key);
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.audit.append(
                AuditEntry::new(AUDIT_SOURCE, "cache_invalidation")
                    .with_reason("requestor token changed; entry deleted")
                    .with_metadata(serde_json::json!({ "cacheKey": cache_key })),
            );
            return None;
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session.encryption_key));
        let mut sealed = entry.ciphertext.clone();
        sealed.extend_from_slice(&entry.auth_tag);
        let nonce = Nonce::from_slice(&entry.iv);
        let payload = Payload {
            msg: &sealed,
            aad: entry.jwt_hash.as_bytes(),
        };

        match cipher.decrypt(nonce, payload) {
            Ok(plaintext) => match String::from_utf8(plaintext) {
                Ok(token) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Some(token)
                }
                Err(_) => {
                    session.entries.remove(cache_key);
                    self.audit_decrypt_failure(cache_key, "plaintext not UTF-8");
                    None
                }
            },
            Err(_) => {
                session.entries.remove(cache_key);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.audit_decrypt_failure(cache_key, "GCM authentication failed");
                None
            }
        }
    }

    /// Store a token, bound to `requestor_jwt` via AAD.
    ///
    /// Effective expiry is `min(expires_at, now + TTL)`.
    pub async fn set(
        &self,
        session_id: &str,
        cache_key: &str,
        token: &str,
        requestor_jwt: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let session = self
            .session_handle(session_id)
            .await
            .ok_or(CacheError::SessionNotFound)?;

        {
            let mut session = session.lock().await;
            session.last_active = Instant::now();

            let jwt_hash = sha256_hex(requestor_jwt);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session.encryption_key));
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let payload = Payload {
                msg: token.as_bytes(),
                aad: jwt_hash.as_bytes(),
            };
            let mut sealed = cipher.encrypt(&nonce, payload).map_err(|_| CacheError::Encrypt)?;

            let tag_offset = sealed.len() - TAG_LEN;
            let mut auth_tag = [0u8; TAG_LEN];
            auth_tag.copy_from_slice(&sealed[tag_offset..]);
            sealed.truncate(tag_offset);

            let now = Utc::now();
            let ttl_cap = now + chrono::Duration::seconds(self.config.ttl_seconds as i64);
            let entry = CacheEntry {
                ciphertext: sealed,
                iv: nonce.into(),
                auth_tag,
                jwt_hash,
                expires_at: expires_at.min(ttl_cap),
                created_at: now,
            };
            session.entries.insert(cache_key.to_string(), entry);

            // Per-session bound: evict the oldest entries in this session.
            while session.entries.len() > self.config.max_entries_per_session {
                if let Some(oldest) = session
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(k, _)| k.clone())
                {
                    session.entries.remove(&oldest);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Global bound, evaluated without holding any session lock.
        self.evict_global().await;
        Ok(())
    }

    /// Bump a session's activity timestamp.
    pub async fn heartbeat(&self, session_id: &str) {
        if let Some(session) = self.session_handle(session_id).await {
            session.lock().await.last_active = Instant::now();
        }
    }

    /// Remove a session, zeroising its encryption key.
    pub async fn clear_session(&self, session_id: &str) {
        let removed = self.sessions.lock().await.remove(session_id);
        if let Some(session) = removed {
            session.lock().await.zeroise();
        }
    }

    /// Snapshot of cache counters and sizes.
    pub async fn get_metrics(&self) -> CacheMetrics {
        let sessions = self.sessions.lock().await;
        let mut total_entries = 0;
        for session in sessions.values() {
            total_entries += session.lock().await.entries.len();
        }
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
            total_entries,
        }
    }

    /// Spawn the background sweep. Runs until [`Self::destroy`].
    pub fn start_sweeper(self: Arc<Self>) {
        let shutdown = self.shutdown.clone();
        let cache = self;
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = SWEEP_INTERVAL.as_secs(),
                "token cache sweeper starting"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {},
                    _ = shutdown.cancelled() => {
                        tracing::info!("token cache sweeper shutting down");
                        return;
                    }
                }
                cache.sweep().await;
            }
        });
    }

    /// One sweep: drop idle sessions (zeroising keys) and expired entries.
    pub async fn sweep(&self) {
        let session_timeout = Duration::from_millis(self.config.session_timeout_ms);
        let mut sessions = self.sessions.lock().await;
        let ids: Vec<String> = sessions.keys().cloned().collect();

        for id in ids {
            let Some(handle) = sessions.get(&id).cloned() else {
                continue;
            };
            let mut session = handle.lock().await;
            if session.last_active.elapsed() >= session_timeout {
                session.zeroise();
                drop(session);
                sessions.remove(&id);
                continue;
            }
            let now = Utc::now();
            let before = session.entries.len();
            session.entries.retain(|_, entry| entry.expires_at > now);
            let removed = before - session.entries.len();
            if removed > 0 {
                self.counters
                    .expired
                    .fetch_add(removed as u64, Ordering::Relaxed);
            }
        }
    }

    /// Tear the cache down: stop the sweeper and zeroise every key.
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.lock().await.zeroise();
        }
    }

    async fn session_handle(&self, session_id: &str) -> Option<Arc<Mutex<SessionMetadata>>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Enforce the global entry bound by evicting the oldest entry across
    /// all sessions until under the limit. Holds at most one session lock
    /// at a time.
    async fn evict_global(&self) {
        loop {
            let handles: Vec<(String, Arc<Mutex<SessionMetadata>>)> = {
                let sessions = self.sessions.lock().await;
                sessions
                    .iter()
                    .map(|(id, h)| (id.clone(), Arc::clone(h)))
                    .collect()
            };

            let mut total = 0;
            let mut oldest: Option<(Arc<Mutex<SessionMetadata>>, String, DateTime<Utc>)> = None;
            for (_, handle) in &handles {
                let session = handle.lock().await;
                total += session.entries.len();
                for (key, entry) in &session.entries {
                    let is_older = oldest
                        .as_ref()
                        .map(|(_, _, at)| entry.created_at < *at)
                        .unwrap_or(true);
                    if is_older {
                        oldest = Some((Arc::clone(handle), key.clone(), entry.created_at));
                    }
                }
            }

            if total <= self.config.max_total_entries {
                return;
            }
            let Some((handle, key, _)) = oldest else {
                return;
            };
            let mut session = handle.lock().await;
            if session.entries.remove(&key).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn audit_decrypt_failure(&self, cache_key: &str, reason: &str) {
        self.audit.append(
            AuditEntry::new(AUDIT_SOURCE, "decrypt_failure")
                .failed(reason.to_string())
                .with_metadata(serde_json::json!({ "cacheKey": cache_key })),
        );
    }
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn cache() -> EncryptedTokenCache {
        cache_with(TokenCacheConfig::default()).0
    }

    fn cache_with(config: TokenCacheConfig) -> (EncryptedTokenCache, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (EncryptedTokenCache::new(config, sink.clone()), sink)
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    #[tokio::test]
    async fn session_id_is_sha256_of_jwt() {
        let cache = cache();
        let id = cache.activate_session("h.p.s", "user_1").await;
        assert_eq!(id, sha256_hex("h.p.s"));
        assert_eq!(id.len(), 64);
        // Re-activation returns the same id.
        let again = cache.activate_session("h.p.s", "user_1").await;
        assert_eq!(id, again);
    }

    #[tokio::test]
    async fn round_trip_with_matching_jwt() {
        let cache = cache();
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache
            .set(&sid, "te:legacy-db", "delegation-token", "jwt-1", far_future())
            .await
            .unwrap();

        let token = cache.get(&sid, "te:legacy-db", "jwt-1").await;
        assert_eq!(token.as_deref(), Some("delegation-token"));

        let metrics = cache.get_metrics().await;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.total_entries, 1);
    }

    #[tokio::test]
    async fn aad_mismatch_deletes_entry_and_audits() {
        let (cache, sink) = cache_with(TokenCacheConfig::default());
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache
            .set(&sid, "te:legacy-db", "delegation-token", "jwt-1", far_future())
            .await
            .unwrap();

        // A refreshed requestor token misses and invalidates.
        assert_eq!(cache.get(&sid, "te:legacy-db", "jwt-2").await, None);
        // The entry is gone even for the original token.
        assert_eq!(cache.get(&sid, "te:legacy-db", "jwt-1").await, None);

        let metrics = cache.get_metrics().await;
        assert_eq!(metrics.invalidations, 1);
        assert!(sink
            .entries()
            .iter()
            .any(|e| e.action == "cache_invalidation"));
    }

    #[tokio::test]
    async fn expired_entries_are_removed_lazily() {
        let cache = cache();
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache
            .set(
                &sid,
                "te:legacy-db",
                "delegation-token",
                "jwt-1",
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        assert_eq!(cache.get(&sid, "te:legacy-db", "jwt-1").await, None);
        let metrics = cache.get_metrics().await;
        assert_eq!(metrics.expired, 1);
        assert_eq!(metrics.total_entries, 0);
    }

    #[tokio::test]
    async fn ttl_caps_effective_expiry() {
        let mut config = TokenCacheConfig::default();
        config.ttl_seconds = 0; // everything expires immediately
        let (cache, _) = cache_with(config);
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache
            .set(&sid, "k", "token", "jwt-1", far_future())
            .await
            .unwrap();
        assert_eq!(cache.get(&sid, "k", "jwt-1").await, None);
    }

    #[tokio::test]
    async fn set_without_session_fails() {
        let cache = cache();
        let err = cache
            .set("missing", "k", "token", "jwt-1", far_future())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::SessionNotFound));
    }

    #[tokio::test]
    async fn per_session_capacity_evicts_oldest() {
        let mut config = TokenCacheConfig::default();
        config.max_entries_per_session = 2;
        let (cache, _) = cache_with(config);
        let sid = cache.activate_session("jwt-1", "user_1").await;

        for key in ["te:a", "te:b", "te:c"] {
            cache.set(&sid, key, "token", "jwt-1", far_future()).await.unwrap();
            // created_at ordering needs distinct timestamps at millisecond
            // resolution on fast machines.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(cache.get(&sid, "te:a", "jwt-1").await, None);
        assert!(cache.get(&sid, "te:b", "jwt-1").await.is_some());
        assert!(cache.get(&sid, "te:c", "jwt-1").await.is_some());
        assert_eq!(cache.get_metrics().await.evictions, 1);
    }

    #[tokio::test]
    async fn global_capacity_evicts_oldest_across_sessions() {
        let mut config = TokenCacheConfig::default();
        config.max_total_entries = 2;
        config.max_entries_per_session = 10;
        let (cache, _) = cache_with(config);

        let sid1 = cache.activate_session("jwt-1", "user_1").await;
        let sid2 = cache.activate_session("jwt-2", "user_2").await;

        cache.set(&sid1, "te:a", "t", "jwt-1", far_future()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set(&sid2, "te:b", "t", "jwt-2", far_future()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set(&sid2, "te:c", "t", "jwt-2", far_future()).await.unwrap();

        // The globally oldest entry (session 1's) was evicted.
        assert_eq!(cache.get(&sid1, "te:a", "jwt-1").await, None);
        assert_eq!(cache.get_metrics().await.total_entries, 2);
    }

    #[tokio::test]
    async fn clear_session_removes_everything() {
        let cache = cache();
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache.set(&sid, "k", "token", "jwt-1", far_future()).await.unwrap();

        cache.clear_session(&sid).await;
        assert_eq!(cache.get(&sid, "k", "jwt-1").await, None);
        assert_eq!(cache.get_metrics().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn sweep_clears_idle_sessions() {
        let mut config = TokenCacheConfig::default();
        config.session_timeout_ms = 0; // everything is idle immediately
        let (cache, _) = cache_with(config);
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache.set(&sid, "k", "token", "jwt-1", far_future()).await.unwrap();

        cache.sweep().await;
        assert_eq!(cache.get_metrics().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries_from_live_sessions() {
        let cache = cache();
        let sid = cache.activate_session("jwt-1", "user_1").await;
        cache
            .set(
                &sid,
                "k",
                "token",
                "jwt-1",
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        cache.sweep().await;
        let metrics = cache.get_metrics().await;
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.total_entries, 0);
    }

    #[tokio::test]
    async fn destroy_clears_all_sessions() {
        let cache = cache();
        for i in 0..3 {
            let jwt = format!("jwt-{i}");
            let sid = cache.activate_session(&jwt, "user").await;
            cache.set(&sid, "k", "token", &jwt, far_future()).await.unwrap();
        }
        cache.destroy().await;
        assert_eq!(cache.get_metrics().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn ivs_are_unique_across_encryptions() {
        let cache = cache();
        let sid = cache.activate_session("jwt-1", "user_1").await;

        let mut ivs = std::collections::BTreeSet::new();
        for i in 0..64 {
            let key = format!("te:aud-{i}");
            cache.set(&sid, &key, "token", "jwt-1", far_future()).await.unwrap();
            let sessions = cache.sessions.lock().await;
            let session = sessions.get(&sid).unwrap().lock().await;
            let entry = session.entries.get(&key).unwrap();
            assert!(ivs.insert(entry.iv), "IV reused at iteration {i}");
        }
        assert_eq!(ivs.len(), 64);
    }

    #[tokio::test]
    async fn heartbeat_keeps_session_alive() {
        let mut config = TokenCacheConfig::default();
        config.session_timeout_ms = 10_000;
        let (cache, _) = cache_with(config);
        let sid = cache.activate_session("jwt-1", "user_1").await;

        cache.heartbeat(&sid).await;
        cache.sweep().await;
        // The session is active well within the timeout.
        assert_eq!(cache.get_metrics().await.active_sessions, 1);
    }
}
