// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fixed-window request limiting per caller.
//!
//! The caller key is the SHA-256 of the bearer token when one is present
//! (limits follow the credential, not the NAT), falling back to the
//! forwarded client IP and finally to a shared anonymous bucket. Disabled
//! unless `rateLimiting.enabled` is set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::config::RateLimitingConfig;
use crate::state::AppState;
use crate::token::sha256_hex;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter per caller key.
pub struct RateLimiter {
    config: RateLimitingConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitingConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record one request for `key`; `false` means over the limit.
    pub fn check(&self, key: &str) -> bool {
        let window_len = Duration::from_secs(self.config.window_seconds.max(1));
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        // Opportunistic cleanup keeps the map bounded by active callers.
        if windows.len() > 4096 {
            windows.retain(|_, w| w.started.elapsed() < window_len);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: Instant::now(),
            count: 0,
        });
        if window.started.elapsed() >= window_len {
            window.started = Instant::now();
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.config.max_requests
    }
}

/// Middleware enforcing the limiter on every request it wraps.
pub async fn enforce(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.rate_limiter.enabled() {
        return next.run(request).await;
    }

    let key = client_key(&request);
    if state.rate_limiter.check(&key) {
        next.run(request).await
    } else {
        tracing::warn!("rate limit exceeded");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "Too many requests" })),
        )
            .into_response()
    }
}

/// Derive the caller key: bearer hash, else forwarded IP, else shared.
fn client_key(request: &Request) -> String {
    if let Some(token) = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return sha256_hex(token);
    }
    if let Some(ip) = extract_client_ip(request) {
        return ip.to_string();
    }
    "anonymous".to_string()
}

/// Extract client IP from `X-Forwarded-For` or `X-Real-IP` headers.
fn extract_client_ip(request: &Request) -> Option<IpAddr> {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}
