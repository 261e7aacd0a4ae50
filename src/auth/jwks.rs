// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWKS (JSON Web Key Set) fetching and caching, one cache per IDP.
//!
//! ## Security
//!
//! - Keys are cached with a configurable TTL
//! - An unknown `kid` triggers exactly one refresh (single-flight across
//!   concurrent requests) before the token is rejected
//! - Only asymmetric key material is ever constructed; a JWKS entry that
//!   is not RSA/EC/OKP is skipped

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::DecodingKey;
use tokio::sync::{Mutex, RwLock};

use super::error::AuthError;

/// Default JWKS cache TTL (5 minutes).
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// HTTP timeout for JWKS fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// JWKS cache entry.
struct CacheEntry {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// Per-IDP JWKS cache.
pub struct JwksCache {
    jwks_uri: String,
    cache_ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
    /// Serialises refresh-on-unknown-kid so a burst of requests bearing a
    /// freshly rotated key causes one fetch, not one per request.
    refresh_lock: Mutex<()>,
    client: reqwest::Client,
}

impl JwksCache {
    pub fn new(jwks_uri: impl Into<String>) -> Result<Self, AuthError> {
        Ok(Self {
            jwks_uri: jwks_uri.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .map_err(|e| AuthError::InternalError(format!("HTTP client: {e}")))?,
        })
    }

    /// Create with custom cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    /// Get a decoding key for the given key ID.
    ///
    /// A `kid` miss triggers a single-flight refresh before failing with
    /// [`AuthError::UnknownKid`]. Tokens without a `kid` get the first key
    /// that converts.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let jwks = self.get_jwks().await?;
        if let Some(key) = select_key(&jwks, kid) {
            return jwk_to_decoding_key(key);
        }

        // Unknown kid: refresh once, under the single-flight lock.
        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited.
        if let Some(jwks) = self.cached().await {
            if let Some(key) = select_key(&jwks, kid) {
                return jwk_to_decoding_key(key);
            }
        }

        let jwks = self.refresh_inner().await?;
        match select_key(&jwks, kid) {
            Some(key) => jwk_to_decoding_key(key),
            None => Err(AuthError::UnknownKid),
        }
    }

    /// Force refresh the JWKS cache (startup pre-fetch, health checks).
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_inner().await.map(|_| ())
    }

    /// Check if JWKS is currently cached and valid.
    pub async fn is_cached(&self) -> bool {
        let cache = self.cache.read().await;
        match &*cache {
            Some(entry) => entry.fetched_at.elapsed() < self.cache_ttl,
            None => false,
        }
    }

    async fn cached(&self) -> Option<JwkSet> {
        let cache = self.cache.read().await;
        cache.as_ref().map(|entry| entry.jwks.clone())
    }

    /// Fetch JWKS, using the cache while it is fresh.
    async fn get_jwks(&self) -> Result<JwkSet, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = &*cache {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(entry.jwks.clone());
                }
            }
        }
        self.refresh_inner().await
    }

    async fn refresh_inner(&self) -> Result<JwkSet, AuthError> {
        let response = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetchError(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchError(e.to_string()))?;

        let mut cache = self.cache.write().await;
        *cache = Some(CacheEntry {
            jwks: jwks.clone(),
            fetched_at: Instant::now(),
        });
        Ok(jwks)
    }
}

/// Find the JWKS entry for a `kid`, or the first convertible key when the
/// token header carries none.
fn select_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid)),
        None => jwks.keys.iter().find(|k| jwk_to_decoding_key(k).is_ok()),
    }
}

/// Convert a JWK to a DecodingKey. Symmetric keys are unrepresentable
/// here: only RSA, EC and OKP parameters are handled.
fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, AuthError> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| AuthError::InternalError(format!("Failed to create RSA key: {e}"))),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
            .map_err(|e| AuthError::InternalError(format!("Failed to create EC key: {e}"))),
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x)
            .map_err(|e| AuthError::InternalError(format!("Failed to create Ed key: {e}"))),
        _ => Err(AuthError::InternalError(
            "Unsupported key type in JWKS".to_string(),
        )),
    }
}
