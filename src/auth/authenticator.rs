// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Multi-IDP JWT authenticator.
//!
//! Validates a bearer token against one of the trusted identity providers
//! and projects it into a [`UserSession`].
//!
//! ## Rejection policy
//!
//! Structural and cryptographic failures (bad encoding, unknown issuer,
//! invalid signature, expired token) are typed [`AuthError`]s. A
//! role-mapping failure is **not** an error: it yields a session with
//! `rejected = true` and `role = UNASSIGNED_ROLE`, which the transport
//! must check before invoking any tool. Every outcome - success, rejected
//! session, or error - emits an audit entry with `source = "auth:service"`.

use std::collections::BTreeSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, Validation};

use crate::audit::{AuditEntry, SharedAudit};
use crate::config::{IdpAlgorithm, IdpConfig};

use super::error::AuthError;
use super::jwks::JwksCache;
use super::roles::{Role, RoleMapper};
use super::session::UserSession;

/// Audit source tag for authentication events.
const AUDIT_SOURCE: &str = "auth:service";

/// Result of an authentication attempt that got far enough to build a
/// session. `rejected` mirrors `session.rejected`; the transport checks
/// both (dual rejection check).
#[derive(Debug)]
pub struct AuthOutcome {
    pub session: UserSession,
    pub rejected: bool,
    pub rejection_reason: Option<String>,
    pub audit_entry: AuditEntry,
}

/// One trusted IDP with its key cache and role mapper.
struct IdpEntry {
    config: IdpConfig,
    jwks: JwksCache,
    mapper: RoleMapper,
}

/// Multi-IDP JWT authenticator.
pub struct Authenticator {
    idps: Vec<IdpEntry>,
    audit: SharedAudit,
}

impl Authenticator {
    pub fn new(configs: Vec<IdpConfig>, audit: SharedAudit) -> Result<Self, AuthError> {
        let mut idps = Vec::with_capacity(configs.len());
        for config in configs {
            let jwks = JwksCache::new(&config.jwks_uri)?;
            let mapper = RoleMapper::new(config.role_mapping.clone());
            idps.push(IdpEntry {
                config,
                jwks,
                mapper,
            });
        }
        Ok(Self { idps, audit })
    }

    /// Names of all trusted IDPs.
    pub fn idp_names(&self) -> Vec<&str> {
        self.idps.iter().map(|i| i.config.name.as_str()).collect()
    }

    /// Configurations of all trusted IDPs (metadata endpoints).
    pub fn idp_configs(&self) -> Vec<&IdpConfig> {
        self.idps.iter().map(|i| &i.config).collect()
    }

    /// Pre-fetch every IDP's key set (startup warm-up, readiness checks).
    pub async fn prefetch_jwks(&self) -> Result<(), AuthError> {
        for idp in &self.idps {
            idp.jwks.refresh().await?;
        }
        Ok(())
    }

    /// Whether every IDP currently holds a fresh key set.
    pub async fn jwks_cached(&self) -> bool {
        for idp in &self.idps {
            if !idp.jwks.is_cached().await {
                return false;
            }
        }
        true
    }

    /// Authenticate a bearer token.
    ///
    /// `idp_hint` selects the IDP explicitly; otherwise the `iss` claim is
    /// matched against the trusted set.
    pub async fn authenticate(
        &self,
        token: &str,
        idp_hint: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        match self.authenticate_inner(token, idp_hint).await {
            Ok(outcome) => {
                self.audit.append(outcome.audit_entry.clone());
                Ok(outcome)
            }
            Err(error) => {
                self.audit.append(
                    AuditEntry::new(AUDIT_SOURCE, "authenticate")
                        .failed(error.to_string())
                        .with_error(error.error_code().to_string()),
                );
                Err(error)
            }
        }
    }

    async fn authenticate_inner(
        &self,
        token: &str,
        idp_hint: Option<&str>,
    ) -> Result<AuthOutcome, AuthError> {
        // 1. Structural parse.
        let (header, payload) = parse_segments(token)?;

        // 2. IDP resolution: explicit hint, else `iss` match.
        let idp = match idp_hint {
            Some(name) => self
                .idps
                .iter()
                .find(|i| i.config.name == name)
                .ok_or(AuthError::UntrustedIssuer)?,
            None => {
                let issuer = payload
                    .get("iss")
                    .and_then(|v| v.as_str())
                    .ok_or(AuthError::MissingClaim("iss"))?;
                self.idps
                    .iter()
                    .find(|i| i.config.issuer == issuer)
                    .ok_or(AuthError::UntrustedIssuer)?
            }
        };

        // 3. Algorithm gate before any key material is touched. The
        // allowlist is asymmetric-only, so `none` and HMAC fail here.
        let alg_name = header
            .get("alg")
            .and_then(|v| v.as_str())
            .ok_or(AuthError::InvalidFormat)?;
        let algorithm = idp
            .config
            .algorithms
            .iter()
            .copied()
            .find(|a| a.to_string() == alg_name)
            .ok_or(AuthError::UnsupportedAlgorithm)?;

        // 4. JWKS selection (cached; single-flight refresh on unknown kid).
        let kid = header.get("kid").and_then(|v| v.as_str());
        let decoding_key = idp.jwks.decoding_key(kid).await?;

        // 5. Signature and claim verification.
        let claims = verify_token(token, &decoding_key, algorithm, &idp.config)?;

        // 6-8. Projection, role derivation, session construction.
        let outcome = self.project_session(token, &claims, idp)?;
        Ok(outcome)
    }

    fn project_session(
        &self,
        token: &str,
        claims: &serde_json::Map<String, serde_json::Value>,
        idp: &IdpEntry,
    ) -> Result<AuthOutcome, AuthError> {
        let mappings = &idp.config.claim_mappings;
        let claims_value = serde_json::Value::Object(claims.clone());

        let user_id = navigate(&claims_value, &mappings.user_id)
            .and_then(|v| v.as_str())
            .ok_or(AuthError::MissingClaim("userId"))?
            .to_string();

        let username = navigate(&claims_value, &mappings.username)
            .and_then(|v| v.as_str())
            .unwrap_or(&user_id)
            .to_string();

        let legacy_username = navigate(&claims_value, &mappings.legacy_username)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let scopes = navigate(&claims_value, &mappings.scopes)
            .map(parse_scopes)
            .unwrap_or_default();

        // Role derivation. A missing roles claim maps through the default
        // bucket; a wrongly-typed one is a mapping failure. Neither is an
        // error: both produce a (possibly rejected) session.
        let decision = match navigate(&claims_value, &mappings.roles) {
            Some(raw) => idp.mapper.map(raw),
            None => idp.mapper.map_values(&[]),
        };

        let rejected = decision.role == Role::Unassigned;
        let rejection_reason = if rejected {
            Some(
                decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "role mapping produced no role".to_string()),
            )
        } else {
            None
        };

        let session = UserSession::new(
            user_id.clone(),
            username,
            legacy_username,
            decision.role,
            decision.custom_roles,
            scopes,
            claims.clone(),
            token.to_string(),
        );

        let mut audit_entry = AuditEntry::new(AUDIT_SOURCE, "authenticate")
            .with_user(user_id)
            .with_metadata(serde_json::json!({
                "idp": idp.config.name,
                "role": session.role.to_string(),
            }));
        if let Some(reason) = &rejection_reason {
            audit_entry = audit_entry.failed(reason.clone());
        }

        Ok(AuthOutcome {
            rejected,
            rejection_reason,
            audit_entry,
            session,
        })
    }
}

/// Split and decode the three JWT segments without verifying anything.
fn parse_segments(
    token: &str,
) -> Result<(serde_json::Value, serde_json::Value), AuthError> {
    let mut segments = token.split('.');
    let (header, payload, signature) = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty() => {
            (h, p, s)
        }
        _ => return Err(AuthError::InvalidFormat),
    };
    let _ = signature;

    let decode_json = |segment: &str| -> Result<serde_json::Value, AuthError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|_| AuthError::InvalidEncoding)?;
        serde_json::from_slice(&bytes).map_err(|_| AuthError::InvalidEncoding)
    };

    Ok((decode_json(header)?, decode_json(payload)?))
}

/// Run signature and registered-claim verification for one IDP.
fn verify_token(
    token: &str,
    key: &jsonwebtoken::DecodingKey,
    algorithm: IdpAlgorithm,
    idp: &IdpConfig,
) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
    let mut validation = Validation::new(algorithm.to_jwt_algorithm());
    validation.leeway = idp.security.clock_tolerance;
    validation.set_audience(&[&idp.audience]);
    validation.set_issuer(&[&idp.issuer]);
    validation.validate_nbf = true;
    if idp.security.require_nbf {
        validation.required_spec_claims.insert("nbf".to_string());
    }

    let data = decode::<serde_json::Map<String, serde_json::Value>>(token, key, &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            jsonwebtoken::errors::ErrorKind::ImmatureSignature => AuthError::NotBefore,
            jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
            jsonwebtoken::errors::ErrorKind::InvalidIssuer => AuthError::UntrustedIssuer,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
                "nbf" => AuthError::MissingClaim("nbf"),
                "exp" => AuthError::MissingClaim("exp"),
                _ => AuthError::InvalidFormat,
            },
            _ => AuthError::SignatureInvalid,
        })?;

    let claims = data.claims;

    // Maximum token age: `iat >= now - maxTokenAge` (with clock tolerance).
    let iat = claims
        .get("iat")
        .and_then(|v| v.as_i64())
        .ok_or(AuthError::MissingClaim("iat"))?;
    let now = Utc::now().timestamp();
    let max_age = idp.security.max_token_age as i64 + idp.security.clock_tolerance as i64;
    if iat < now - max_age {
        return Err(AuthError::NotBefore);
    }

    Ok(claims)
}

/// Navigate a JSON value using dot notation (e.g. `realm_access.roles`).
fn navigate<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Parse a scopes claim: space-separated string or array of strings.
fn parse_scopes(value: &serde_json::Value) -> BTreeSet<String> {
    match value {
        serde_json::Value::String(s) => s
            .split_whitespace()
            .map(|s| s.to_string())
            .collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        _ => BTreeSet::new(),
    }
}
