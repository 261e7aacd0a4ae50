// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! SQL Server delegation module.
//!
//! Identity switch discipline: `EXECUTE AS USER = '<legacy>'` after
//! acquiring a pooled connection, `REVERT` on every exit path. The switch
//! is a property of the connection, so the revert must run on the *same*
//! pooled connection before it is released; a failed revert is retried
//! once and the secondary failure is swallowed after logging. The
//! identifier pattern additionally permits `\` so `DOMAIN\user`
//! principals validate.

use std::time::Duration;

use async_trait::async_trait;
use bb8_tiberius::ConnectionManager;
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::audit::AuditEntry;
use crate::auth::UserSession;
use crate::config::{
    DbConnectionConfig, ModuleConfig, ModuleKind, PoolConfig, TimeoutConfig, TokenExchangeConfig,
};
use crate::delegation::{
    DelegationContext, DelegationError, DelegationModule, DelegationResult, ModuleHealth,
};

use super::{
    authorize_statement, classify_statement, effective_roles, quote_literal_mssql,
    resolve_legacy_identity, validate_identifier_mssql, CommandClass, LegacyIdentity, SqlAction,
};

type MssqlPool = bb8::Pool<ConnectionManager>;
type MssqlClient = tiberius::Client<tokio_util::compat::Compat<tokio::net::TcpStream>>;

pub struct MssqlDelegationModule {
    name: String,
    connection: DbConnectionConfig,
    pool_config: PoolConfig,
    timeouts: TimeoutConfig,
    te_config: Option<TokenExchangeConfig>,
    pool: RwLock<Option<MssqlPool>>,
}

impl MssqlDelegationModule {
    pub fn new(name: impl Into<String>, config: &ModuleConfig) -> Result<Self, DelegationError> {
        let connection = config
            .connection
            .clone()
            .ok_or_else(|| DelegationError::InitFailed("missing connection settings".to_string()))?;
        Ok(Self {
            name: name.into(),
            connection,
            pool_config: config.pool.clone(),
            timeouts: config.timeouts.clone(),
            te_config: config.token_exchange.clone(),
            pool: RwLock::new(None),
        })
    }

    fn audit_source(&self) -> String {
        format!("delegation:{}", self.name)
    }

    /// Lazily initialise the connection pool.
    async fn pool(&self) -> Result<MssqlPool, DelegationError> {
        {
            let pool = self.pool.read().await;
            if let Some(pool) = &*pool {
                return Ok(pool.clone());
            }
        }

        let mut guard = self.pool.write().await;
        if let Some(pool) = &*guard {
            return Ok(pool.clone());
        }

        let conn = &self.connection;
        let mut config = tiberius::Config::new();
        config.host(&conn.host);
        config.port(conn.port);
        config.database(&conn.database);
        config.authentication(tiberius::AuthMethod::sql_server(
            &conn.username,
            &conn.password,
        ));
        if conn.tls {
            config.encryption(tiberius::EncryptionLevel::Required);
        } else {
            config.encryption(tiberius::EncryptionLevel::NotSupported);
        }

        let manager = ConnectionManager::new(config);
        let pool = bb8::Pool::builder()
            .max_size(self.pool_config.max)
            .min_idle(Some(self.pool_config.min))
            .idle_timeout(Some(Duration::from_millis(
                self.pool_config.idle_timeout_millis,
            )))
            .connection_timeout(Duration::from_millis(self.timeouts.connection_timeout_ms))
            .build(manager)
            .await
            .map_err(|e| DelegationError::ConnectionFailed {
                detail: e.to_string(),
            })?;

        tracing::info!(module = %self.name, "SQL Server pool initialised");
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Run one validated action under a scoped identity switch.
    async fn run_switched(
        &self,
        identity: &LegacyIdentity,
        action: SqlAction,
    ) -> Result<serde_json::Value, DelegationError> {
        let pool = self.pool().await?;
        let switch = format!(
            "EXECUTE AS USER = {}",
            quote_literal_mssql(&identity.username)
        );
        let request_timeout = Duration::from_millis(self.timeouts.request_timeout_ms);

        // Detached so caller cancellation cannot skip the revert; the
        // revert itself is never cancelled.
        let handle = tokio::spawn(async move {
            let conn = pool.get().await.map_err(|e| DelegationError::ConnectionFailed {
                detail: e.to_string(),
            });
            let mut conn = match conn {
                Ok(conn) => conn,
                Err(error) => return Err(error),
            };

            if let Err(error) = conn.execute(switch.as_str(), &[]).await {
                return Err(DelegationError::QueryFailed {
                    detail: format!("identity switch failed: {error}"),
                });
            }

            let outcome = std::panic::AssertUnwindSafe(run_action(&mut conn, &action))
                .catch_unwind()
                .await;

            // Revert on the same connection. A failure is retried once;
            // a secondary failure is swallowed after logging.
            if let Err(revert_error) = conn.execute("REVERT", &[]).await {
                tracing::warn!(error = %revert_error, "identity revert failed; retrying once");
                if let Err(second) = conn.execute("REVERT", &[]).await {
                    tracing::error!(error = %second, "secondary identity revert failed");
                }
            }

            match outcome {
                Ok(result) => result,
                Err(_) => Err(DelegationError::QueryFailed {
                    detail: "statement execution panicked".to_string(),
                }),
            }
        });

        match tokio::time::timeout(request_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DelegationError::QueryFailed {
                detail: format!("execution task failed: {join_error}"),
            }),
            Err(_) => Err(DelegationError::QueryFailed {
                detail: format!(
                    "request timeout of {}ms elapsed",
                    self.timeouts.request_timeout_ms
                ),
            }),
        }
    }

    fn base_trail(&self, session: &UserSession, action: &str) -> AuditEntry {
        AuditEntry::new(self.audit_source(), action.to_string()).with_user(session.user_id.clone())
    }
}

#[async_trait]
impl DelegationModule for MssqlDelegationModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> ModuleKind {
        ModuleKind::Mssql
    }

    async fn initialize(&self) -> Result<(), DelegationError> {
        self.pool().await.map(|_| ())
    }

    async fn delegate(
        &self,
        session: &UserSession,
        action: &str,
        params: &serde_json::Value,
        context: DelegationContext<'_>,
    ) -> DelegationResult {
        let mut trail = self.base_trail(session, action);

        let parsed = match SqlAction::parse(action, params) {
            Ok(parsed) => parsed,
            Err(error) => {
                trail = trail.failed(error.audit_detail());
                return DelegationResult::failed(error.to_string(), trail);
            }
        };

        let identity =
            match resolve_legacy_identity(self.te_config.as_ref(), session, &context).await {
                Ok(identity) => identity,
                Err(error) => {
                    trail = trail.failed(error.audit_detail());
                    return DelegationResult::failed(error.to_string(), trail);
                }
            };
        trail.metadata_insert(
            "legacyUsername",
            serde_json::json!(identity.username.clone()),
        );
        trail.metadata_insert(
            "tokenExchangeUsed",
            serde_json::json!(identity.token_exchange_used),
        );

        if let Err(error) = validate_request(&identity, &parsed, session) {
            trail = trail.failed(error.audit_detail());
            return DelegationResult::failed(error.to_string(), trail);
        }

        match self.run_switched(&identity, parsed).await {
            Ok(data) => DelegationResult::ok(data, trail),
            Err(error) => {
                trail = trail.failed(error.audit_detail());
                DelegationResult::failed(error.to_string(), trail)
            }
        }
    }

    async fn validate_access(&self, session: &UserSession, action: &str) -> bool {
        !session.rejected
            && matches!(
                action,
                "query" | "list_schemas" | "list_tables" | "describe_table" | "execute_procedure"
            )
    }

    async fn health_check(&self) -> ModuleHealth {
        match self.pool().await {
            Ok(pool) => match pool.get().await {
                // The stream must be drained before the connection goes
                // back to the pool.
                Ok(mut conn) => match conn.simple_query("SELECT 1").await {
                    Ok(stream) => match stream.into_first_result().await {
                        Ok(_) => ModuleHealth::healthy(),
                        Err(error) => {
                            ModuleHealth::unhealthy(format!("probe query failed: {error}"))
                        }
                    },
                    Err(error) => ModuleHealth::unhealthy(format!("probe query failed: {error}")),
                },
                Err(error) => ModuleHealth::unhealthy(format!("pool checkout failed: {error}")),
            },
            Err(error) => ModuleHealth::unhealthy(error.to_string()),
        }
    }

    async fn destroy(&self) {
        // bb8 pools close their idle connections on drop.
        if self.pool.write().await.take().is_some() {
            tracing::info!(module = %self.name, "SQL Server pool released");
        }
    }
}

/// Identifier and authorisation checks, before any connection is touched.
fn validate_request(
    identity: &LegacyIdentity,
    action: &SqlAction,
    session: &UserSession,
) -> Result<(), DelegationError> {
    validate_identifier_mssql(&identity.username)?;
    let roles = effective_roles(identity, session);

    match action {
        SqlAction::Query { sql, .. } => {
            let (keyword, class) = classify_statement(sql);
            authorize_statement(sql, &keyword, class, &roles)
        }
        SqlAction::ListSchemas => {
            authorize_statement("SELECT", "SELECT", CommandClass::Read, &roles)
        }
        SqlAction::ListTables { schema } => {
            validate_identifier_mssql(schema)?;
            authorize_statement("SELECT", "SELECT", CommandClass::Read, &roles)
        }
        SqlAction::DescribeTable { schema, table } => {
            validate_identifier_mssql(schema)?;
            validate_identifier_mssql(table)?;
            authorize_statement("SELECT", "SELECT", CommandClass::Read, &roles)
        }
        SqlAction::ExecuteProcedure { name, .. } => {
            validate_identifier_mssql(name)?;
            authorize_statement("EXEC", "EXEC", CommandClass::Write, &roles)
        }
    }
}

/// Execute a validated action on a switched connection.
async fn run_action(
    conn: &mut MssqlClient,
    action: &SqlAction,
) -> Result<serde_json::Value, DelegationError> {
    match action {
        SqlAction::Query { sql, params } => {
            let (keyword, class) = classify_statement(sql);
            if class == CommandClass::Read {
                let mut query = tiberius::Query::new(sql.clone());
                bind_params(&mut query, params);
                let stream = query.query(conn).await.map_err(query_error)?;
                let rows = stream.into_first_result().await.map_err(query_error)?;
                let rows: Vec<serde_json::Value> = rows.into_iter().map(row_to_json).collect();
                Ok(serde_json::json!({
                    "rows": rows,
                    "rowCount": rows.len(),
                    "command": keyword,
                }))
            } else {
                let mut query = tiberius::Query::new(sql.clone());
                bind_params(&mut query, params);
                let result = query.execute(conn).await.map_err(query_error)?;
                let count: u64 = result.rows_affected().iter().sum();
                Ok(serde_json::json!({
                    "success": true,
                    "rowCount": count,
                    "command": keyword,
                    "message": format!("{keyword} affected {count} row(s)"),
                }))
            }
        }
        SqlAction::ListSchemas => {
            let stream = conn
                .simple_query("SELECT name FROM sys.schemas ORDER BY name")
                .await
                .map_err(query_error)?;
            let rows = stream.into_first_result().await.map_err(query_error)?;
            let schemas: Vec<serde_json::Value> = rows
                .iter()
                .filter_map(|row| row.get::<&str, _>(0))
                .map(|s| serde_json::Value::String(s.to_string()))
                .collect();
            Ok(serde_json::json!({ "schemas": schemas }))
        }
        SqlAction::ListTables { schema } => {
            let mut query = tiberius::Query::new(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = @P1 ORDER BY TABLE_NAME",
            );
            query.bind(schema.clone());
            let stream = query.query(conn).await.map_err(query_error)?;
            let rows = stream.into_first_result().await.map_err(query_error)?;
            let tables: Vec<serde_json::Value> = rows
                .iter()
                .filter_map(|row| row.get::<&str, _>(0))
                .map(|s| serde_json::Value::String(s.to_string()))
                .collect();
            Ok(serde_json::json!({ "schema": schema, "tables": tables }))
        }
        SqlAction::DescribeTable { schema, table } => {
            let mut query = tiberius::Query::new(
                "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 \
                 ORDER BY ORDINAL_POSITION",
            );
            query.bind(schema.clone());
            query.bind(table.clone());
            let stream = query.query(conn).await.map_err(query_error)?;
            let rows = stream.into_first_result().await.map_err(query_error)?;
            let columns: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "name": row.get::<&str, _>(0).unwrap_or_default(),
                        "dataType": row.get::<&str, _>(1).unwrap_or_default(),
                        "nullable": row.get::<&str, _>(2) == Some("YES"),
                    })
                })
                .collect();
            Ok(serde_json::json!({ "schema": schema, "table": table, "columns": columns }))
        }
        SqlAction::ExecuteProcedure { name, args } => {
            let placeholders: Vec<String> = (1..=args.len()).map(|i| format!("@P{i}")).collect();
            // The procedure name passed identifier validation upstream.
            let call = format!("EXEC [{}] {}", name, placeholders.join(", "));
            let mut query = tiberius::Query::new(call);
            bind_params(&mut query, args);
            let result = query.execute(conn).await.map_err(query_error)?;
            let count: u64 = result.rows_affected().iter().sum();
            Ok(serde_json::json!({
                "success": true,
                "procedure": name,
                "rowCount": count,
            }))
        }
    }
}

fn query_error(error: tiberius::error::Error) -> DelegationError {
    DelegationError::QueryFailed {
        detail: error.to_string(),
    }
}

/// Bind JSON parameters positionally (`@P1`, `@P2`, ...). User data is
/// always bound, never interpolated.
fn bind_params(query: &mut tiberius::Query<'_>, params: &[serde_json::Value]) {
    for param in params {
        match param {
            serde_json::Value::Null => query.bind(None::<String>),
            serde_json::Value::Bool(b) => query.bind(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i);
                } else {
                    query.bind(n.as_f64().unwrap_or(0.0));
                }
            }
            serde_json::Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        }
    }
}

/// Shape one row into a JSON object from the wire column data.
fn row_to_json(row: tiberius::Row) -> serde_json::Value {
    use tiberius::ColumnData;

    let names: Vec<String> = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut object = serde_json::Map::new();
    for (name, data) in names.into_iter().zip(row.into_iter()) {
        let value = match data {
            ColumnData::Bit(v) => v.map(serde_json::Value::Bool),
            ColumnData::U8(v) => v.map(|x| serde_json::json!(x)),
            ColumnData::I16(v) => v.map(|x| serde_json::json!(x)),
            ColumnData::I32(v) => v.map(|x| serde_json::json!(x)),
            ColumnData::I64(v) => v.map(|x| serde_json::json!(x)),
            ColumnData::F32(v) => v.map(|x| serde_json::json!(x)),
            ColumnData::F64(v) => v.map(|x| serde_json::json!(x)),
            ColumnData::String(v) => v.map(|s| serde_json::Value::String(s.into_owned())),
            ColumnData::Guid(v) => v.map(|g| serde_json::Value::String(g.to_string())),
            ColumnData::Numeric(v) => v.map(|n| serde_json::Value::String(n.to_string())),
            ColumnData::Binary(v) => v.map(|b| serde_json::Value::String(hex::encode(b))),
            // Temporal and exotic wire types surface as debug strings
            // until a caller needs them structured.
            other => Some(serde_json::Value::String(format!("{other:?}"))),
        };
        object.insert(name, value.unwrap_or(serde_json::Value::Null));
    }
    serde_json::Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use std::collections::BTreeSet;

    fn session(role: Role, custom: &[&str], legacy: Option<&str>) -> UserSession {
        UserSession::new(
            "user_1".to_string(),
            "alice".to_string(),
            legacy.map(|s| s.to_string()),
            role,
            custom.iter().map(|s| s.to_string()).collect(),
            BTreeSet::new(),
            serde_json::Map::new(),
            "h.p.s".to_string(),
        )
    }

    fn identity(username: &str, roles: &[&str]) -> LegacyIdentity {
        LegacyIdentity {
            username: username.to_string(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            token_exchange_used: false,
        }
    }

    fn module_config() -> ModuleConfig {
        serde_json::from_value(serde_json::json!({
            "type": "mssql",
            "connection": {
                "host": "localhost", "port": 1433, "database": "app",
                "username": "broker", "password": "pw", "tls": false
            }
        }))
        .unwrap()
    }

    #[test]
    fn construction_requires_connection() {
        let config: ModuleConfig =
            serde_json::from_value(serde_json::json!({ "type": "mssql" })).unwrap();
        assert!(MssqlDelegationModule::new("mssql", &config).is_err());
        assert!(MssqlDelegationModule::new("mssql", &module_config()).is_ok());
    }

    #[test]
    fn domain_principal_passes_identifier_validation() {
        let action = SqlAction::Query {
            sql: "SELECT 1 AS x".to_string(),
            params: Vec::new(),
        };
        let s = session(Role::Admin, &[], Some("DOMAIN\\alice"));
        assert!(validate_request(&identity("DOMAIN\\alice", &[]), &action, &s).is_ok());
    }

    #[test]
    fn injection_shaped_principal_is_rejected() {
        let action = SqlAction::Query {
            sql: "SELECT 1".to_string(),
            params: Vec::new(),
        };
        let s = session(Role::Admin, &[], None);
        let err =
            validate_request(&identity("x'; DROP TABLE t; --", &[]), &action, &s).unwrap_err();
        assert!(matches!(err, DelegationError::InvalidIdentifier { .. }));
    }

    #[test]
    fn switch_statement_escapes_quotes() {
        // The switch literal doubles embedded quotes, so even a principal
        // that somehow contained one could not break out. (The identifier
        // gate rejects it first.)
        assert_eq!(
            format!("EXECUTE AS USER = {}", quote_literal_mssql("O'Brien")),
            "EXECUTE AS USER = 'O''Brien'"
        );
    }

    #[test]
    fn sql_read_user_cannot_truncate() {
        let action = SqlAction::Query {
            sql: "TRUNCATE TABLE t".to_string(),
            params: Vec::new(),
        };
        let s = session(Role::User, &["sql-read"], None);
        let err = validate_request(&identity("legacy", &[]), &action, &s).unwrap_err();
        match err {
            DelegationError::InsufficientPermissions { detail } => {
                assert!(detail.contains("TRUNCATE"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn validate_access_mirrors_postgres_contract() {
        let module = MssqlDelegationModule::new("mssql", &module_config()).unwrap();
        let ok = session(Role::User, &[], None);
        assert!(module.validate_access(&ok, "list_schemas").await);
        assert!(!module.validate_access(&ok, "unknown").await);
        let rejected = session(Role::Unassigned, &[], None);
        assert!(!module.validate_access(&rejected, "query").await);
    }

    #[tokio::test]
    async fn delegate_fails_cleanly_without_legacy_identity() {
        let module = MssqlDelegationModule::new("mssql", &module_config()).unwrap();
        let sink = std::sync::Arc::new(crate::audit::NullAuditSink);
        let cache = std::sync::Arc::new(crate::token::EncryptedTokenCache::new(
            crate::config::TokenCacheConfig::default(),
            sink.clone(),
        ));
        let core = crate::delegation::CoreContext {
            exchange: std::sync::Arc::new(
                crate::token::TokenExchangeEngine::new(
                    cache,
                    crate::config::Environment::Test,
                    sink,
                )
                .unwrap(),
            ),
        };

        let s = session(Role::Admin, &[], None);
        let result = module
            .delegate(
                &s,
                "query",
                &serde_json::json!({ "sql": "SELECT 1" }),
                DelegationContext {
                    session_id: None,
                    core: &core,
                },
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.audit_trail.source, "delegation:mssql");
    }
}
