// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication: multi-IDP JWT validation, role mapping, sessions.

mod authenticator;
mod error;
mod jwks;
mod roles;
mod session;
#[cfg(test)]
pub mod test_keys;

pub use authenticator::{AuthOutcome, Authenticator};
pub use error::AuthError;
pub use jwks::JwksCache;
pub use roles::{Role, RoleDecision, RoleMapper};
pub use session::UserSession;
