// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared machinery for the SQL delegation module family.
//!
//! Both database back-ends (PostgreSQL, SQL Server) follow the same
//! contract: resolve the effective legacy identity (token exchange first,
//! session fallback), validate the statement against the role matrix,
//! validate every identifier, then run the operation under a scoped
//! identity switch that is *always* reverted. This module holds the parts
//! that are back-end independent and pure enough to test exhaustively:
//! statement classification, the role matrix, the deny-list fallback,
//! identifier validation, action parsing, and legacy-identity resolution.
//!
//! The deny-list deliberately matches keywords as substrings of the
//! upper-cased statement. That over-rejects (a column named `dropdown`
//! trips `DROP`); the behaviour is retained until a real SQL classifier
//! replaces it.

pub mod mssql;
pub mod postgres;

use std::sync::OnceLock;

use regex::Regex;

use crate::auth::{Role, UserSession};
use crate::config::TokenExchangeConfig;
use crate::token::decode_claims_unverified;

use super::{DelegationContext, DelegationError};

/// Role string granting read-class statements.
const ROLE_SQL_READ: &str = "sql-read";
/// Role string granting write-class statements.
const ROLE_SQL_WRITE: &str = "sql-write";
/// Role string granting admin-class statements.
const ROLE_SQL_ADMIN: &str = "sql-admin";
/// Internal admin role string.
const ROLE_ADMIN: &str = "admin";

/// Keywords scanned as substrings when the caller has no derived roles.
const DENY_LIST: &[&str] = &[
    "DROP", "TRUNCATE", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "GRANT", "REVOKE",
    "EXEC", "MERGE", "SHUTDOWN",
];

/// Statement class under the role matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Read,
    Write,
    Admin,
    Dangerous,
    Unknown,
}

/// Classify a statement by its primary (first) keyword.
pub fn classify_statement(sql: &str) -> (String, CommandClass) {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or("")
        .to_uppercase();

    let class = match keyword.as_str() {
        "SELECT" | "WITH" | "EXPLAIN" | "SHOW" | "DESCRIBE" => CommandClass::Read,
        "INSERT" | "UPDATE" | "DELETE" => CommandClass::Write,
        "CREATE" | "ALTER" | "GRANT" | "REVOKE" => CommandClass::Admin,
        "DROP" | "TRUNCATE" => CommandClass::Dangerous,
        _ => CommandClass::Unknown,
    };
    (keyword, class)
}

/// Apply the role matrix, or the deny-list fallback when no roles were
/// derived for the caller.
///
/// | class     | any-of                                    |
/// |-----------|-------------------------------------------|
/// | read      | sql-read, sql-write, sql-admin, admin     |
/// | write     | sql-write, sql-admin, admin               |
/// | admin     | sql-admin, admin                          |
/// | dangerous | admin                                     |
/// | unknown   | sql-admin, admin                          |
pub fn authorize_statement(
    sql: &str,
    keyword: &str,
    class: CommandClass,
    roles: &[String],
) -> Result<(), DelegationError> {
    if roles.is_empty() {
        // No derived roles: deny-list scan over the upper-cased statement.
        let upper = sql.to_uppercase();
        if let Some(hit) = DENY_LIST.iter().find(|k| upper.contains(**k)) {
            return Err(DelegationError::DangerousOperation {
                detail: format!("statement contains deny-listed keyword {hit}"),
            });
        }
        return Ok(());
    }

    let allowed: &[&str] = match class {
        CommandClass::Read => &[ROLE_SQL_READ, ROLE_SQL_WRITE, ROLE_SQL_ADMIN, ROLE_ADMIN],
        CommandClass::Write => &[ROLE_SQL_WRITE, ROLE_SQL_ADMIN, ROLE_ADMIN],
        CommandClass::Admin | CommandClass::Unknown => &[ROLE_SQL_ADMIN, ROLE_ADMIN],
        CommandClass::Dangerous => &[ROLE_ADMIN],
    };

    if roles.iter().any(|r| allowed.contains(&r.as_str())) {
        Ok(())
    } else {
        Err(DelegationError::InsufficientPermissions {
            detail: format!(
                "{keyword} requires one of {allowed:?}; caller roles {roles:?}"
            ),
        })
    }
}

/// Validate an identifier for PostgreSQL (`^[A-Za-z_][A-Za-z0-9_]*$`).
pub fn validate_identifier_pg(name: &str) -> Result<(), DelegationError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern")
    });
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(DelegationError::InvalidIdentifier {
            detail: format!("identifier {name:?} failed validation"),
        })
    }
}

/// Validate an identifier for SQL Server; also permits `\` so
/// `DOMAIN\user` principals pass (`^[A-Za-z_][A-Za-z0-9_\\]*$`).
pub fn validate_identifier_mssql(name: &str) -> Result<(), DelegationError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_\\]*$").expect("identifier pattern")
    });
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(DelegationError::InvalidIdentifier {
            detail: format!("identifier {name:?} failed validation"),
        })
    }
}

/// Quote a PostgreSQL identifier, doubling embedded `"`.
pub fn quote_identifier_pg(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL Server string literal, doubling embedded `'`.
pub fn quote_literal_mssql(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The operations a SQL delegation module accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlAction {
    Query {
        sql: String,
        params: Vec<serde_json::Value>,
    },
    ListSchemas,
    ListTables {
        schema: String,
    },
    DescribeTable {
        schema: String,
        table: String,
    },
    ExecuteProcedure {
        name: String,
        args: Vec<serde_json::Value>,
    },
}

impl SqlAction {
    /// Parse `(action, params)` as received from the registry.
    pub fn parse(action: &str, params: &serde_json::Value) -> Result<Self, DelegationError> {
        let str_field = |key: &str| -> Result<String, DelegationError> {
            params
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| DelegationError::InvalidParams(format!("missing field {key}")))
        };
        let array_field = |key: &str| -> Vec<serde_json::Value> {
            params
                .get(key)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default()
        };

        match action {
            "query" => Ok(SqlAction::Query {
                sql: str_field("sql")?,
                params: array_field("params"),
            }),
            "list_schemas" => Ok(SqlAction::ListSchemas),
            "list_tables" => Ok(SqlAction::ListTables {
                schema: str_field("schema")?,
            }),
            "describe_table" => Ok(SqlAction::DescribeTable {
                schema: str_field("schema")?,
                table: str_field("table")?,
            }),
            "execute_procedure" => Ok(SqlAction::ExecuteProcedure {
                name: str_field("procedure")?,
                args: array_field("args"),
            }),
            other => Err(DelegationError::UnsupportedAction {
                action: other.to_string(),
            }),
        }
    }

    /// Command class used for role gating of non-query actions.
    pub fn command_class(&self) -> CommandClass {
        match self {
            SqlAction::Query { .. } => CommandClass::Unknown, // classified from SQL
            SqlAction::ListSchemas
            | SqlAction::ListTables { .. }
            | SqlAction::DescribeTable { .. } => CommandClass::Read,
            SqlAction::ExecuteProcedure { .. } => CommandClass::Write,
        }
    }
}

/// The identity a module switches the connection to.
#[derive(Debug, Clone)]
pub struct LegacyIdentity {
    pub username: String,
    /// Delegation roles carried by the exchanged token, if any.
    pub roles: Vec<String>,
    pub token_exchange_used: bool,
}

/// Resolve the effective legacy identity for one delegate call.
///
/// With token exchange configured, the caller's requestor JWT is exchanged
/// for a delegation token whose `required_claim` (default `legacy_name`)
/// becomes the identity; `roles_claim` optionally contributes delegation
/// roles. Without it, `session.legacy_username` is the fallback. Neither
/// yielding a value is [`DelegationError::UnresolvedLegacyIdentity`].
pub async fn resolve_legacy_identity(
    te_config: Option<&TokenExchangeConfig>,
    session: &UserSession,
    context: &DelegationContext<'_>,
) -> Result<LegacyIdentity, DelegationError> {
    let Some(config) = te_config else {
        return match &session.legacy_username {
            Some(username) => Ok(LegacyIdentity {
                username: username.clone(),
                roles: Vec::new(),
                token_exchange_used: false,
            }),
            None => Err(DelegationError::UnresolvedLegacyIdentity),
        };
    };

    let outcome = context
        .core
        .exchange
        .perform_exchange(
            config,
            &session.requestor_jwt,
            context.session_id,
            Some(&session.user_id),
        )
        .await;

    if !outcome.success {
        return Err(DelegationError::TokenExchangeFailed {
            detail: outcome
                .error_description
                .or(outcome.error)
                .unwrap_or_else(|| "exchange failed".to_string()),
        });
    }
    let token = outcome
        .access_token
        .ok_or_else(|| DelegationError::TokenExchangeFailed {
            detail: "exchange succeeded without an access token".to_string(),
        })?;

    let claims = decode_claims_unverified(&token).map_err(|_| {
        DelegationError::TokenExchangeFailed {
            detail: "delegation token payload is not decodable".to_string(),
        }
    })?;

    let username = claims
        .get(&config.required_claim)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DelegationError::MissingDelegationClaim {
            claim: config.required_claim.clone(),
        })?
        .to_string();

    let roles = claims
        .get(&config.roles_claim)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(LegacyIdentity {
        username,
        roles,
        token_exchange_used: true,
    })
}

/// Combine identity, session and internal roles for the role matrix.
///
/// Delegation-token roles come first, then the session's preserved claim
/// roles; an internal `admin` session role contributes `admin`.
pub fn effective_roles(identity: &LegacyIdentity, session: &UserSession) -> Vec<String> {
    let mut roles: Vec<String> = Vec::new();
    for role in identity.roles.iter().chain(session.custom_roles.iter()) {
        if !roles.contains(role) {
            roles.push(role.clone());
        }
    }
    if session.role == Role::Admin && !roles.iter().any(|r| r == ROLE_ADMIN) {
        roles.push(ROLE_ADMIN.to_string());
    }
    roles
}
