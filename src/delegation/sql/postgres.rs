// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! PostgreSQL delegation module.
//!
//! Identity switch discipline: `SET ROLE "<legacy>"` after acquiring a
//! pooled connection, `RESET ROLE` on **every** exit path - success, SQL
//! error, panic, caller cancellation. The switched section runs in a
//! spawned task so cancelling the request cannot skip the revert; if the
//! revert itself fails the connection is detached from the pool and
//! dropped rather than returned with a switched identity.

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::audit::AuditEntry;
use crate::auth::UserSession;
use crate::config::{DbConnectionConfig, ModuleConfig, ModuleKind, PoolConfig, TimeoutConfig, TokenExchangeConfig};
use crate::delegation::{
    DelegationContext, DelegationError, DelegationModule, DelegationResult, ModuleHealth,
};

use super::{
    authorize_statement, classify_statement, effective_roles, quote_identifier_pg,
    resolve_legacy_identity, validate_identifier_pg, CommandClass, LegacyIdentity, SqlAction,
};

pub struct PostgresDelegationModule {
    name: String,
    connection: DbConnectionConfig,
    pool_config: PoolConfig,
    timeouts: TimeoutConfig,
    te_config: Option<TokenExchangeConfig>,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresDelegationModule {
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
    async fn pool(&self) -> Result<PgPool, DelegationError> {
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
        let options = PgConnectOptions::new()
            .host(&conn.host)
            .port(conn.port)
            .database(&conn.database)
            .username(&conn.username)
            .password(&conn.password)
            .ssl_mode(if conn.tls {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });

        let pool = PgPoolOptions::new()
            .min_connections(self.pool_config.min)
            .max_connections(self.pool_config.max)
            .idle_timeout(Duration::from_millis(self.pool_config.idle_timeout_millis))
            .acquire_timeout(Duration::from_millis(self.timeouts.connection_timeout_ms))
            .connect_with(options)
            .await
            .map_err(|e| DelegationError::ConnectionFailed {
                detail: e.to_string(),
            })?;

        tracing::info!(module = %self.name, "PostgreSQL pool initialised");
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
        let set_role = format!("SET ROLE {}", quote_identifier_pg(&identity.username));
        let request_timeout = Duration::from_millis(self.timeouts.request_timeout_ms);

        // The switched section runs detached: a cancelled caller abandons
        // the JoinHandle but the task continues through the revert.
        let handle = tokio::spawn(async move {
            let conn = pool
                .acquire()
                .await
                .map_err(|e| DelegationError::ConnectionFailed {
                    detail: e.to_string(),
                });
            let mut conn = match conn {
                Ok(conn) => conn,
                Err(error) => return Err(error),
            };

            if let Err(error) = sqlx::query(&set_role).execute(&mut *conn).await {
                return Err(DelegationError::QueryFailed {
                    detail: format!("identity switch failed: {error}"),
                });
            }

            // Panics inside the statement must still reach the revert.
            let outcome = std::panic::AssertUnwindSafe(run_action(&mut conn, &action))
                .catch_unwind()
                .await;

            if let Err(revert_error) = sqlx::query("RESET ROLE").execute(&mut *conn).await {
                tracing::error!(
                    error = %revert_error,
                    "identity revert failed; discarding connection"
                );
                // Never return a switched connection to the pool.
                drop(conn.detach());
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
            // The spawned task keeps running and reverts; the caller only
            // stops waiting.
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
impl DelegationModule for PostgresDelegationModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> ModuleKind {
        ModuleKind::Postgres
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

        // Effective legacy identity: token exchange first, session fallback.
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
            Ok(pool) => match sqlx::query("SELECT 1").fetch_one(&pool).await {
                Ok(_) => ModuleHealth::healthy(),
                Err(error) => ModuleHealth::unhealthy(format!("probe query failed: {error}")),
            },
            Err(error) => ModuleHealth::unhealthy(error.to_string()),
        }
    }

    async fn destroy(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!(module = %self.name, "PostgreSQL pool closed");
        }
    }
}

/// Identifier and authorisation checks, before any connection is touched.
fn validate_request(
    identity: &LegacyIdentity,
    action: &SqlAction,
    session: &UserSession,
) -> Result<(), DelegationError> {
    validate_identifier_pg(&identity.username)?;
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
            validate_identifier_pg(schema)?;
            authorize_statement("SELECT", "SELECT", CommandClass::Read, &roles)
        }
        SqlAction::DescribeTable { schema, table } => {
            validate_identifier_pg(schema)?;
            validate_identifier_pg(table)?;
            authorize_statement("SELECT", "SELECT", CommandClass::Read, &roles)
        }
        SqlAction::ExecuteProcedure { name, .. } => {
            validate_identifier_pg(name)?;
            authorize_statement("CALL", "CALL", CommandClass::Write, &roles)
        }
    }
}

/// Execute a validated action on a switched connection.
async fn run_action(
    conn: &mut sqlx::PgConnection,
    action: &SqlAction,
) -> Result<serde_json::Value, DelegationError> {
    match action {
        SqlAction::Query { sql, params } => {
            let (keyword, class) = classify_statement(sql);
            if class == CommandClass::Read {
                let rows = bind_params(sqlx::query(sql), params)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(query_error)?;
                let rows: Vec<serde_json::Value> = rows.iter().map(row_to_json).collect();
                Ok(serde_json::json!({
                    "rows": rows,
                    "rowCount": rows.len(),
                    "command": keyword,
                }))
            } else {
                let result = bind_params(sqlx::query(sql), params)
                    .execute(&mut *conn)
                    .await
                    .map_err(query_error)?;
                let count = result.rows_affected();
                Ok(serde_json::json!({
                    "success": true,
                    "rowCount": count,
                    "command": keyword,
                    "message": format!("{keyword} affected {count} row(s)"),
                }))
            }
        }
        SqlAction::ListSchemas => {
            let rows = sqlx::query(
                "SELECT schema_name FROM information_schema.schemata ORDER BY schema_name",
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?;
            let schemas: Vec<serde_json::Value> = rows
                .iter()
                .filter_map(|row| row.try_get::<String, _>(0).ok())
                .map(serde_json::Value::String)
                .collect();
            Ok(serde_json::json!({ "schemas": schemas }))
        }
        SqlAction::ListTables { schema } => {
            let rows = sqlx::query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 ORDER BY table_name",
            )
            .bind(schema)
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?;
            let tables: Vec<serde_json::Value> = rows
                .iter()
                .filter_map(|row| row.try_get::<String, _>(0).ok())
                .map(serde_json::Value::String)
                .collect();
            Ok(serde_json::json!({ "schema": schema, "tables": tables }))
        }
        SqlAction::DescribeTable { schema, table } => {
            let rows = sqlx::query(
                "SELECT column_name, data_type, is_nullable \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
            )
            .bind(schema)
            .bind(table)
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?;
            let columns: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "name": row.try_get::<String, _>(0).unwrap_or_default(),
                        "dataType": row.try_get::<String, _>(1).unwrap_or_default(),
                        "nullable": row
                            .try_get::<String, _>(2)
                            .map(|v| v == "YES")
                            .unwrap_or(false),
                    })
                })
                .collect();
            Ok(serde_json::json!({ "schema": schema, "table": table, "columns": columns }))
        }
        SqlAction::ExecuteProcedure { name, args } => {
            let placeholders: Vec<String> =
                (1..=args.len()).map(|i| format!("${i}")).collect();
            let call = format!(
                "CALL {}({})",
                quote_identifier_pg(name),
                placeholders.join(", ")
            );
            let result = bind_params(sqlx::query(&call), args)
                .execute(&mut *conn)
                .await
                .map_err(query_error)?;
            Ok(serde_json::json!({
                "success": true,
                "procedure": name,
                "rowCount": result.rows_affected(),
            }))
        }
    }
}

fn query_error(error: sqlx::Error) -> DelegationError {
    DelegationError::QueryFailed {
        detail: error.to_string(),
    }
}

/// Bind JSON parameters positionally. User data is always bound, never
/// interpolated.
fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: &[serde_json::Value],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            serde_json::Value::Null => query.bind(None::<String>),
            serde_json::Value::Bool(b) => query.bind(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Shape one row into a JSON object by column type.
fn row_to_json(row: &PgRow) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => json_cell(row.try_get::<Option<bool>, _>(idx)),
            "INT2" => json_cell(row.try_get::<Option<i16>, _>(idx)),
            "INT4" => json_cell(row.try_get::<Option<i32>, _>(idx)),
            "INT8" => json_cell(row.try_get::<Option<i64>, _>(idx)),
            "FLOAT4" => json_cell(row.try_get::<Option<f32>, _>(idx)),
            "FLOAT8" => json_cell(row.try_get::<Option<f64>, _>(idx)),
            "UUID" => json_cell(row.try_get::<Option<uuid::Uuid>, _>(idx)),
            "TIMESTAMPTZ" => {
                json_cell(row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx))
            }
            "TIMESTAMP" => json_cell(row.try_get::<Option<chrono::NaiveDateTime>, _>(idx)),
            "DATE" => json_cell(row.try_get::<Option<chrono::NaiveDate>, _>(idx)),
            _ => json_cell(row.try_get::<Option<String>, _>(idx)),
        };
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}

fn json_cell<T: serde::Serialize>(cell: Result<Option<T>, sqlx::Error>) -> serde_json::Value {
    match cell {
        Ok(Some(value)) => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::Null,
    }
}
