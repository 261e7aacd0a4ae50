// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication errors.
//!
//! These cover structural and cryptographic failures only. A role-mapping
//! failure is *not* an error: it produces a rejected session (see the
//! authenticator), which the transport must check separately.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Authentication error type.
///
/// Public messages are sanitised; claim values and key material never
/// appear here - detailed reasons go to the audit pipeline.
#[derive(Debug)]
pub enum AuthError {
    /// Token is not three base64url segments
    InvalidFormat,
    /// A segment did not decode to valid base64url/JSON
    InvalidEncoding,
    /// A required claim is absent
    MissingClaim(&'static str),
    /// A claim has the wrong type or value shape
    InvalidClaim(&'static str),
    /// `iss` does not match any trusted IDP
    UntrustedIssuer,
    /// Header algorithm is not accepted for the resolved IDP
    UnsupportedAlgorithm,
    /// No key with the token's `kid` exists even after a JWKS refresh
    UnknownKid,
    /// Signature verification failed
    SignatureInvalid,
    /// Token expired (`exp` with tolerance)
    TokenExpired,
    /// Token not yet valid (`nbf`) or too old (`iat` beyond max age)
    NotBefore,
    /// Audience containment failed
    InvalidAudience,
    /// JWKS fetch failed
    JwksFetchError(String),
    /// Role gate failed at the transport
    InsufficientPermissions,
    /// Internal error
    InternalError(String),
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
    error_code: String,
}

impl AuthError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidFormat => "invalid_format",
            AuthError::InvalidEncoding => "invalid_encoding",
            AuthError::MissingClaim(_) => "missing_claim",
            AuthError::InvalidClaim(_) => "invalid_claim",
            AuthError::UntrustedIssuer => "untrusted_issuer",
            AuthError::UnsupportedAlgorithm => "unsupported_algorithm",
            AuthError::UnknownKid => "unknown_kid",
            AuthError::SignatureInvalid => "signature_invalid",
            AuthError::TokenExpired => "token_expired",
            AuthError::NotBefore => "not_before",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::JwksFetchError(_) => "jwks_fetch_error",
            AuthError::InsufficientPermissions => "insufficient_permissions",
            AuthError::InternalError(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidFormat
            | AuthError::InvalidEncoding
            | AuthError::MissingClaim(_)
            | AuthError::InvalidClaim(_) => StatusCode::BAD_REQUEST,
            AuthError::UntrustedIssuer
            | AuthError::UnsupportedAlgorithm
            | AuthError::UnknownKid
            | AuthError::SignatureInvalid
            | AuthError::TokenExpired
            | AuthError::NotBefore
            | AuthError::InvalidAudience => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::JwksFetchError(_) | AuthError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidFormat => write!(f, "Token is not a well-formed JWT"),
            AuthError::InvalidEncoding => write!(f, "Token segment is not valid base64url JSON"),
            AuthError::MissingClaim(claim) => write!(f, "Required claim is missing: {claim}"),
            AuthError::InvalidClaim(claim) => write!(f, "Claim has an invalid type: {claim}"),
            AuthError::UntrustedIssuer => write!(f, "Token issuer is not trusted"),
            AuthError::UnsupportedAlgorithm => {
                write!(f, "Token algorithm is not accepted for this issuer")
            }
            AuthError::UnknownKid => write!(f, "No matching signing key found"),
            AuthError::SignatureInvalid => write!(f, "Token signature is invalid"),
            AuthError::TokenExpired => write!(f, "Token has expired"),
            AuthError::NotBefore => write!(f, "Token is not valid at this time"),
            AuthError::InvalidAudience => write!(f, "Token audience is invalid"),
            AuthError::JwksFetchError(msg) => write!(f, "Failed to fetch JWKS: {msg}"),
            AuthError::InsufficientPermissions => {
                write!(f, "Insufficient permissions for this operation")
            }
            AuthError::InternalError(msg) => write!(f, "Internal authentication error: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(AuthErrorBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}
