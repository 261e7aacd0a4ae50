// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Broker Configuration
//!
//! Configuration is a JSON tree loaded from `CONFIG_PATH` at startup.
//! Secret descriptors (`{"$secret": "LOGICAL_NAME"}`) are resolved against
//! the provider chain *before* the tree is deserialized into the typed
//! structs below, so no typed field ever observes an unresolved secret.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `APP_ENV` | Runtime profile (`development`, `test`, `production`) | `development` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `SERVER_PORT` | Server bind port | `8080` |
//! | `CONFIG_PATH` | Path to the JSON configuration file | `broker.json` |
//! | `SECRETS_PATH` | Path to the JSON secrets file (file provider) | Optional |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//!
//! In `development` and `test`, the HTTPS requirement on IDP issuer, JWKS
//! and token-exchange endpoints is relaxed so local fixtures can serve
//! plain HTTP. In `production` a non-HTTPS endpoint is a startup error.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Environment variable naming the runtime profile.
pub const APP_ENV: &str = "APP_ENV";

/// Environment variable naming the configuration file path.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Environment variable naming the secrets file path.
pub const SECRETS_PATH_ENV: &str = "SECRETS_PATH";

/// Environment variable naming the server port.
pub const SERVER_PORT_ENV: &str = "SERVER_PORT";

/// Runtime profile, derived from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    /// Read the profile from `APP_ENV`, defaulting to `Development`.
    ///
    /// Unknown values fall back to `Production` so a typo in a deployed
    /// environment fails closed rather than open.
    pub fn from_env() -> Self {
        match std::env::var(APP_ENV).ok().as_deref() {
            None | Some("development") => Environment::Development,
            Some("test") => Environment::Test,
            _ => Environment::Production,
        }
    }

    /// Whether outbound IDP/JWKS/token endpoints must be HTTPS.
    pub fn requires_https(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Configuration load/validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("endpoint {url} must use HTTPS in production ({context})")]
    InsecureEndpoint { url: String, context: &'static str },
}

// =============================================================================
// Identity providers
// =============================================================================

/// Signature algorithms accepted from trusted IDPs.
///
/// The set is closed: `none` and symmetric (HMAC) algorithms are
/// unrepresentable, so a token presenting one fails at header validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdpAlgorithm {
    RS256,
    ES256,
    EdDSA,
}

impl IdpAlgorithm {
    /// Map to the `jsonwebtoken` algorithm.
    pub fn to_jwt_algorithm(self) -> jsonwebtoken::Algorithm {
        match self {
            IdpAlgorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            IdpAlgorithm::ES256 => jsonwebtoken::Algorithm::ES256,
            IdpAlgorithm::EdDSA => jsonwebtoken::Algorithm::EdDSA,
        }
    }
}

impl fmt::Display for IdpAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdpAlgorithm::RS256 => write!(f, "RS256"),
            IdpAlgorithm::ES256 => write!(f, "ES256"),
            IdpAlgorithm::EdDSA => write!(f, "EdDSA"),
        }
    }
}

/// Dot-notation paths from which abstract claims are projected.
///
/// Paths navigate nested objects (`realm_access.roles`); a missing path
/// yields no value rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaimMappings {
    pub user_id: String,
    pub username: String,
    pub legacy_username: String,
    pub roles: String,
    pub scopes: String,
}

impl Default for ClaimMappings {
    fn default() -> Self {
        Self {
            user_id: "sub".to_string(),
            username: "preferred_username".to_string(),
            legacy_username: "legacy_name".to_string(),
            roles: "roles".to_string(),
            scopes: "scope".to_string(),
        }
    }
}

/// Time-bound and claim-presence policy for one IDP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdpSecurity {
    /// Allowed clock skew in seconds when checking `exp`/`nbf`.
    pub clock_tolerance: u64,
    /// Maximum accepted token age in seconds (`iat >= now - maxTokenAge`).
    pub max_token_age: u64,
    /// Whether `nbf` must be present and honoured.
    pub require_nbf: bool,
}

impl Default for IdpSecurity {
    fn default() -> Self {
        Self {
            clock_tolerance: 60,
            max_token_age: 3600,
            require_nbf: false,
        }
    }
}

/// One trusted identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdpConfig {
    /// Short name used for `idpName` hints and token-exchange references.
    pub name: String,
    /// Issuer URI (`iss` claim); HTTPS in production.
    pub issuer: String,
    /// JWKS endpoint for this issuer.
    pub jwks_uri: String,
    /// Expected audience (`aud` containment).
    pub audience: String,
    /// Accepted signature algorithms.
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<IdpAlgorithm>,
    /// Abstract claim -> JSON path projections.
    #[serde(default)]
    pub claim_mappings: ClaimMappings,
    /// Time-bound policy.
    #[serde(default)]
    pub security: IdpSecurity,
    /// Role mapping applied to this IDP's raw role values.
    #[serde(default)]
    pub role_mapping: RoleMappingConfig,
}

fn default_algorithms() -> Vec<IdpAlgorithm> {
    vec![IdpAlgorithm::RS256]
}

/// Raw-claim-value buckets mapped onto internal roles.
///
/// Matching is first-bucket-wins per value; across values the strongest
/// bucket wins (admin over user over guest).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleMappingConfig {
    pub admin_roles: Vec<String>,
    pub user_roles: Vec<String>,
    pub guest_roles: Vec<String>,
    /// Buckets preserved verbatim as custom roles (e.g. `sql-read`).
    pub custom_roles: Vec<String>,
    /// Role assigned when no bucket matches; absent means unassigned.
    pub default_role: Option<String>,
}

// =============================================================================
// Token exchange
// =============================================================================

/// Cache policy for delegation tokens obtained via token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenCacheConfig {
    pub enabled: bool,
    /// Upper bound on cached-token lifetime in seconds.
    pub ttl_seconds: u64,
    /// Idle-session timeout in milliseconds before the session is cleared.
    pub session_timeout_ms: u64,
    pub max_entries_per_session: usize,
    pub max_total_entries: usize,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            session_timeout_ms: 30 * 60 * 1000,
            max_entries_per_session: 16,
            max_total_entries: 4096,
        }
    }
}

/// Per-module RFC 8693 token-exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeConfig {
    /// Name of the trusted IDP whose exchange endpoint is used.
    pub idp_name: String,
    /// Token endpoint URL; HTTPS in production.
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    /// Downstream audience the delegation token is bound to.
    pub audience: String,
    /// Claim that must be present in the delegation token.
    #[serde(default = "default_required_claim")]
    pub required_claim: String,
    /// Claim carrying delegation roles, if any.
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,
    /// RFC 8693 `subject_token_type`; the canonical default is
    /// `urn:ietf:params:oauth:token-type:access_token`.
    #[serde(default = "default_subject_token_type")]
    pub subject_token_type: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub requested_token_type: Option<String>,
    #[serde(default)]
    pub cache: Option<TokenCacheConfig>,
}

fn default_required_claim() -> String {
    "legacy_name".to_string()
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

fn default_subject_token_type() -> String {
    "urn:ietf:params:oauth:token-type:access_token".to_string()
}

// =============================================================================
// Delegation modules
// =============================================================================

/// Database connection settings shared by the SQL module family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Whether to require TLS to the database. Defaults on.
    #[serde(default = "default_true")]
    pub tls: bool,
}

fn default_true() -> bool {
    true
}

/// Connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    pub idle_timeout_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            idle_timeout_millis: 30_000,
        }
    }
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// Back-end flavour of one delegation module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Postgres,
    Mssql,
    Kerberos,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Postgres => write!(f, "postgres"),
            ModuleKind::Mssql => write!(f, "mssql"),
            ModuleKind::Kerberos => write!(f, "kerberos"),
        }
    }
}

/// Configuration of one delegation module under `delegation.modules.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    /// Connection settings; absent for non-database modules.
    #[serde(default)]
    pub connection: Option<DbConnectionConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub token_exchange: Option<TokenExchangeConfig>,
}

// =============================================================================
// OAuth redirect handler
// =============================================================================

/// Configuration of the browser-facing PKCE redirect handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthRedirectConfig {
    /// Name of the trusted IDP used for the authorization-code flow.
    pub idp_name: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    /// Exact-string allowlist; no normalisation is applied.
    pub allowed_redirect_uris: Vec<String>,
    #[serde(default = "default_oauth_scopes")]
    pub default_scopes: Vec<String>,
    /// Lifetime of an ephemeral authorization session in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
}

fn default_oauth_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_session_ttl() -> u64 {
    600
}

// =============================================================================
// Top-level tree
// =============================================================================

/// Audit pipeline switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// How many recent entries the in-memory ring retains for the admin
    /// query endpoint.
    pub retained_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retained_entries: 4096,
        }
    }
}

/// Fixed-window request limiting per caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Requests allowed per caller per window.
    pub max_requests: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_seconds: 60,
            max_requests: 120,
        }
    }
}

/// Authentication section: the trusted IDP set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSection {
    #[serde(rename = "trustedIDPs")]
    pub trusted_idps: Vec<IdpConfig>,
    /// Scopes advertised in `WWW-Authenticate` challenges, if any.
    #[serde(default)]
    pub required_scopes: Vec<String>,
}

/// Delegation section: the module table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationSection {
    #[serde(default = "default_tool_prefix")]
    pub default_tool_prefix: String,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

fn default_tool_prefix() -> String {
    "delegate".to_string()
}

/// Server identity advertised in challenges and metadata documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSection {
    pub name: String,
    /// Externally visible base URL (used for `resource_metadata`).
    pub url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "delegation-broker".to_string(),
            url: "http://localhost:8080".to_string(),
        }
    }
}

/// The full configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerSection,
    pub auth: AuthSection,
    pub delegation: DelegationSection,
    #[serde(default)]
    pub oauth_redirect: Option<OAuthRedirectConfig>,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

impl BrokerConfig {
    /// Read the raw JSON tree from disk without interpreting it.
    ///
    /// Secret resolution runs on this raw tree before [`Self::from_value`].
    pub fn load_raw(path: impl AsRef<Path>) -> Result<serde_json::Value, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Deserialize and validate a (secret-resolved) configuration tree.
    pub fn from_value(value: serde_json::Value, env: Environment) -> Result<Self, ConfigError> {
        let config: BrokerConfig = serde_json::from_value(value)?;
        config.validate(env)?;
        Ok(config)
    }

    /// Cross-field validation, including the production HTTPS policy.
    pub fn validate(&self, env: Environment) -> Result<(), ConfigError> {
        if self.auth.trusted_idps.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.trustedIDPs must list at least one identity provider".to_string(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for idp in &self.auth.trusted_idps {
            if !seen.insert(idp.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate IDP name: {}",
                    idp.name
                )));
            }
            if idp.algorithms.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "IDP {} lists no accepted algorithms",
                    idp.name
                )));
            }
            if env.requires_https() {
                require_https(&idp.issuer, "IDP issuer")?;
                require_https(&idp.jwks_uri, "JWKS endpoint")?;
            }
        }

        for (name, module) in &self.delegation.modules {
            if matches!(module.kind, ModuleKind::Postgres | ModuleKind::Mssql)
                && module.connection.is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "module {name} is a database module but has no connection settings"
                )));
            }
            if let Some(te) = &module.token_exchange {
                if !self.auth.trusted_idps.iter().any(|i| i.name == te.idp_name) {
                    return Err(ConfigError::Invalid(format!(
                        "module {name} references unknown IDP {}",
                        te.idp_name
                    )));
                }
                if env.requires_https() {
                    require_https(&te.token_endpoint, "token-exchange endpoint")?;
                }
            }
        }

        if let Some(redirect) = &self.oauth_redirect {
            if redirect.allowed_redirect_uris.is_empty() {
                return Err(ConfigError::Invalid(
                    "oauthRedirect.allowedRedirectUris must not be empty".to_string(),
                ));
            }
            if env.requires_https() {
                require_https(&redirect.authorization_endpoint, "authorization endpoint")?;
                require_https(&redirect.token_endpoint, "token endpoint")?;
            }
        }

        Ok(())
    }

    /// Look up a trusted IDP by name.
    pub fn idp(&self, name: &str) -> Option<&IdpConfig> {
        self.auth.trusted_idps.iter().find(|i| i.name == name)
    }

    /// Look up a trusted IDP by issuer.
    pub fn idp_by_issuer(&self, issuer: &str) -> Option<&IdpConfig> {
        self.auth.trusted_idps.iter().find(|i| i.issuer == issuer)
    }
}

fn require_https(raw: &str, context: &'static str) -> Result<(), ConfigError> {
    match url::Url::parse(raw) {
        Ok(parsed) if parsed.scheme() == "https" => Ok(()),
        _ => Err(ConfigError::InsecureEndpoint {
            url: raw.to_string(),
            context,
        }),
    }
}
