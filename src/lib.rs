// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Relational Delegation Broker
//!
//! An **authenticating delegation broker** between OAuth 2.1 clients and
//! legacy back-ends. Each inbound request presents a bearer JWT; the
//! broker validates it against one of several trusted identity providers,
//! resolves the caller into a per-request session with an authorisation
//! role, exchanges the token for an audience-bound *delegation token*
//! (RFC 8693) on demand, and executes database operations while the
//! connection's effective identity is switched to the legacy principal
//! carried in the delegation token's claims.
//!
//! ## Architecture Overview
//!
//! ```text
//! bearer JWT ──▶ Authenticator ──▶ UserSession (role, scopes, claims)
//!                     │
//!                     ▼
//!            Delegation Registry  ──ground-truth──▶ Audit Pipeline
//!                     │  (trust boundary)
//!                     ▼
//!          Database Module (pg / mssql)
//!            │  TokenExchange ──▶ Encrypted Token Cache (AES-256-GCM,
//!            │   (RFC 8693)        AAD = SHA-256(requestor JWT))
//!            ▼
//!   switch identity → execute → revert identity → release connection
//! ```
//!
//! ## Modules
//!
//! - [`api`] - HTTP surface: bearer challenges, OAuth discovery, health
//! - [`audit`] - append-only audit pipeline with mandatory provenance
//! - [`auth`] - multi-IDP JWT validation, role mapping, sessions
//! - [`config`] - JSON configuration tree and runtime profile
//! - [`delegation`] - module registry with trust boundary, SQL modules
//! - [`error`] - transport error type with HTTP status mapping
//! - [`oauth`] - browser-facing PKCE redirect handler
//! - [`secrets`] - `{"$secret": ...}` resolution over the config tree
//! - [`state`] - application state shared across handlers
//! - [`token`] - encrypted token cache and RFC 8693 exchange engine
//!
//! ## Security Model
//!
//! 1. **No trust in modules**: the registry overlays its observed outcome
//!    onto every module audit trail and flags disagreements as
//!    `trust_boundary_violation`.
//! 2. **Token binding**: cached delegation tokens are sealed with the
//!    SHA-256 of the exact requestor JWT as AEAD associated data; a
//!    refreshed caller token can never unseal another token's cache.
//! 3. **Scoped identity**: database work runs between an identity switch
//!    and an unconditional revert on the same pooled connection.
//! 4. **Sanitised surfaces**: claim values, identifiers and SQL fragments
//!    reach the audit pipeline, never HTTP response bodies.

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod delegation;
pub mod error;
pub mod oauth;
pub mod secrets;
pub mod state;
pub mod token;
