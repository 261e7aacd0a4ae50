// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Internal roles and the raw-claim role mapper.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::RoleMappingConfig;

/// Internal authorisation role.
///
/// ## Role Hierarchy
///
/// - `Admin` - may invoke any delegated operation
/// - `User` - standard delegated access
/// - `Guest` - restricted access
/// - `Unassigned` - role mapping failed; the session is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum Role {
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "guest")]
    Guest,
    /// Sentinel: no configured bucket matched. Always paired with a
    /// rejected session.
    #[serde(rename = "UNASSIGNED_ROLE")]
    Unassigned,
}

impl Role {
    /// Check if this role has at least the privileges of `required`.
    pub fn has_privilege(&self, required: Role) -> bool {
        match (self, required) {
            (Role::Admin, _) => true,
            (Role::User, Role::User | Role::Guest) => true,
            (Role::Guest, Role::Guest) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
            Role::Guest => write!(f, "guest"),
            Role::Unassigned => write!(f, "UNASSIGNED_ROLE"),
        }
    }
}

/// Outcome of mapping raw claim values onto an internal role.
#[derive(Debug, Clone)]
pub struct RoleDecision {
    pub role: Role,
    /// Raw role strings preserved for downstream gates (e.g. `sql-read`),
    /// in input order.
    pub custom_roles: Vec<String>,
    /// Why mapping failed, when `role` is [`Role::Unassigned`].
    pub reason: Option<String>,
}

impl RoleDecision {
    fn unassigned(reason: impl Into<String>) -> Self {
        Self {
            role: Role::Unassigned,
            custom_roles: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Maps raw role claim values onto internal roles using configured buckets.
///
/// Tie-break across values: `admin` wins over `user` wins over `guest`.
#[derive(Debug, Clone)]
pub struct RoleMapper {
    config: RoleMappingConfig,
}

impl RoleMapper {
    pub fn new(config: RoleMappingConfig) -> Self {
        Self { config }
    }

    /// Map the raw `roles` claim value.
    ///
    /// The source must be an array of strings or a single string (treated
    /// as a one-element array); any other shape is a mapping failure and
    /// yields [`Role::Unassigned`] with a reason, never an error.
    pub fn map(&self, raw: &serde_json::Value) -> RoleDecision {
        let values = match raw {
            serde_json::Value::String(s) => vec![s.clone()],
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => values.push(s.to_string()),
                        None => {
                            return RoleDecision::unassigned(format!(
                                "roles claim contains a non-string element ({})",
                                type_name(item)
                            ));
                        }
                    }
                }
                values
            }
            other => {
                return RoleDecision::unassigned(format!(
                    "roles claim must be an array or string, got {}",
                    type_name(other)
                ));
            }
        };

        self.map_values(&values)
    }

    /// Map already-extracted role strings.
    pub fn map_values(&self, values: &[String]) -> RoleDecision {
        let mut best: Option<Role> = None;
        let mut custom_roles = Vec::new();

        for value in values {
            if self.config.admin_roles.iter().any(|r| r == value) {
                best = Some(strongest(best, Role::Admin));
            } else if self.config.user_roles.iter().any(|r| r == value) {
                best = Some(strongest(best, Role::User));
            } else if self.config.guest_roles.iter().any(|r| r == value) {
                best = Some(strongest(best, Role::Guest));
            }
            // Custom buckets preserve the raw value for downstream gates.
            // With no custom buckets configured every raw value is kept,
            // so delegation role gates work without extra wiring.
            if self.config.custom_roles.is_empty()
                || self.config.custom_roles.iter().any(|r| r == value)
            {
                custom_roles.push(value.clone());
            }
        }

        let role = best.or_else(|| self.default_role());
        match role {
            Some(role) => RoleDecision {
                role,
                custom_roles,
                reason: None,
            },
            None => {
                let mut decision =
                    RoleDecision::unassigned("no configured role bucket matched the claim values");
                decision.custom_roles = custom_roles;
                decision
            }
        }
    }

    fn default_role(&self) -> Option<Role> {
        match self.config.default_role.as_deref() {
            Some("admin") => Some(Role::Admin),
            Some("user") => Some(Role::User),
            Some("guest") => Some(Role::Guest),
            _ => None,
        }
    }
}

/// Stronger of two roles under the admin > user > guest ordering.
fn strongest(current: Option<Role>, candidate: Role) -> Role {
    match current {
        None => candidate,
        Some(existing) => {
            if rank(candidate) > rank(existing) {
                candidate
            } else {
                existing
            }
        }
    }
}

fn rank(role: Role) -> u8 {
    match role {
        Role::Admin => 3,
        Role::User => 2,
        Role::Guest => 1,
        Role::Unassigned => 0,
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> RoleMapper {
        RoleMapper::new(RoleMappingConfig {
            admin_roles: vec!["broker-admin".to_string()],
            user_roles: vec!["broker-user".to_string()],
            guest_roles: vec!["broker-guest".to_string()],
            custom_roles: Vec::new(),
            default_role: None,
        })
    }

    #[test]
    fn admin_wins_over_user_and_guest() {
        let decision = mapper().map(&serde_json::json!([
            "broker-guest",
            "broker-admin",
            "broker-user"
        ]));
        assert_eq!(decision.role, Role::Admin);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn user_wins_over_guest() {
        let decision = mapper().map(&serde_json::json!(["broker-guest", "broker-user"]));
        assert_eq!(decision.role, Role::User);
    }

    #[test]
    fn single_string_is_singleton_wrapped() {
        let decision = mapper().map(&serde_json::json!("broker-user"));
        assert_eq!(decision.role, Role::User);
    }

    #[test]
    fn non_array_non_string_is_unassigned() {
        let decision = mapper().map(&serde_json::json!({ "nested": true }));
        assert_eq!(decision.role, Role::Unassigned);
        assert!(decision.reason.as_deref().unwrap().contains("object"));
    }

    #[test]
    fn non_string_array_element_is_unassigned() {
        let decision = mapper().map(&serde_json::json!(["broker-admin", 42]));
        assert_eq!(decision.role, Role::Unassigned);
        assert!(decision.reason.as_deref().unwrap().contains("non-string"));
    }

    #[test]
    fn no_match_without_default_is_unassigned() {
        let decision = mapper().map(&serde_json::json!(["something-else"]));
        assert_eq!(decision.role, Role::Unassigned);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn default_role_applies_when_nothing_matches() {
        let mut config = RoleMappingConfig::default();
        config.default_role = Some("guest".to_string());
        let decision = RoleMapper::new(config).map(&serde_json::json!(["unmatched"]));
        assert_eq!(decision.role, Role::Guest);
    }

    #[test]
    fn custom_roles_preserved_in_order_without_buckets() {
        let decision = mapper().map(&serde_json::json!(["sql-read", "broker-user", "sql-write"]));
        assert_eq!(
            decision.custom_roles,
            vec!["sql-read", "broker-user", "sql-write"]
        );
    }

    #[test]
    fn custom_buckets_filter_preserved_values() {
        let mut config = RoleMappingConfig::default();
        config.user_roles = vec!["broker-user".to_string()];
        config.custom_roles = vec!["sql-read".to_string(), "sql-write".to_string()];
        let decision = RoleMapper::new(config).map(&serde_json::json!([
            "sql-write",
            "broker-user",
            "unrelated"
        ]));
        assert_eq!(decision.role, Role::User);
        assert_eq!(decision.custom_roles, vec!["sql-write"]);
    }

    #[test]
    fn privilege_ordering() {
        assert!(Role::Admin.has_privilege(Role::Guest));
        assert!(Role::User.has_privilege(Role::Guest));
        assert!(!Role::Guest.has_privilege(Role::User));
        assert!(!Role::Unassigned.has_privilege(Role::Guest));
    }

    #[test]
    fn serde_renders_unassigned_sentinel() {
        let json = serde_json::to_string(&Role::Unassigned).unwrap();
        assert_eq!(json, r#""UNASSIGNED_ROLE""#);
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), r#""admin""#);
    }
}
