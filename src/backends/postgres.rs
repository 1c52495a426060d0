//! PostgreSQL provider
//!
//! Sessions wrap a single tokio-postgres client; the connection driver runs
//! on a spawned task. Connection strings use the libpq `key=value` form
//! (`host=... dbname=...`); username and password from [`ConnectOptions`]
//! are appended when the string itself carries none.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Client, NoTls};

use crate::core::connection::ConnectOptions;
use crate::core::error::{DbError, Result};
use crate::core::meta::{CacheTable, MetaContext};
use crate::core::provider::{
    Capabilities, ExecOutcome, ParamStyle, Provider, Session, TransactionMode,
};
use crate::core::recordset::{FieldDesc, Recordset, Schema};
use crate::core::value::{Value, ValueType};

/// PostgreSQL provider descriptor
#[derive(Default)]
pub struct PostgresProvider;

impl PostgresProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for PostgresProvider {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transaction_modes: vec![
                TransactionMode::None,
                TransactionMode::ReadCommitted,
                TransactionMode::Serializable,
            ],
            supports_parameters: true,
            param_style: ParamStyle::Dollar,
        }
    }

    async fn connect(
        &self,
        connection_string: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>> {
        let mut config = connection_string.to_string();
        if !config.contains("user=") {
            if let Some(username) = options.get_username() {
                config.push_str(&format!(" user={username}"));
            }
        }
        if !config.contains("password=") {
            if let Some(password) = options.get_password() {
                config.push_str(&format!(" password={password}"));
            }
        }

        let (client, connection) = tokio_postgres::connect(&config, NoTls)
            .await
            .map_err(|e| {
                DbError::connection_with_source("failed to connect to PostgreSQL", Box::new(e))
            })?;

        // Drive the wire protocol until the client goes away.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres connection task ended");
            }
        });

        tracing::debug!("postgres session established");
        Ok(Box::new(PostgresSession {
            client: tokio::sync::Mutex::new(Some(client)),
        }))
    }
}

/// One PostgreSQL session
pub struct PostgresSession {
    client: tokio::sync::Mutex<Option<Client>>,
}

fn pg_error(err: tokio_postgres::Error) -> DbError {
    let code = err
        .code()
        .map(|state| state.code().to_string())
        .unwrap_or_else(|| "-1".to_string());
    DbError::execution(code, err.to_string())
}

fn value_to_param(value: &Value) -> Box<dyn tokio_postgres::types::ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(None::<i64>),
        Value::Bool(v) => Box::new(*v),
        Value::Int(v) => Box::new(*v),
        Value::Long(v) => Box::new(*v),
        Value::Double(v) => Box::new(*v),
        Value::String(v) => Box::new(v.clone()),
        Value::Bytes(v) => Box::new(v.clone()),
        Value::Timestamp(v) => {
            let micros = Duration::from_micros(v.unsigned_abs());
            let time = if *v >= 0 {
                UNIX_EPOCH + micros
            } else {
                UNIX_EPOCH - micros
            };
            Box::new(time)
        }
    }
}

fn column_type(pg_type: &tokio_postgres::types::Type) -> ValueType {
    match pg_type.name() {
        "bool" => ValueType::Bool,
        "int2" | "int4" => ValueType::Int,
        "int8" => ValueType::Long,
        "float4" | "float8" => ValueType::Double,
        "bytea" => ValueType::Bytes,
        "timestamp" | "timestamptz" => ValueType::Timestamp,
        _ => ValueType::String,
    }
}

fn field_value(row: &tokio_postgres::Row, idx: usize, ty: ValueType) -> Value {
    match ty {
        ValueType::Bool => row
            .get::<_, Option<bool>>(idx)
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        ValueType::Int => row
            .get::<_, Option<i32>>(idx)
            .map(Value::Int)
            .unwrap_or(Value::Null),
        ValueType::Long => row
            .get::<_, Option<i64>>(idx)
            .map(Value::Long)
            .unwrap_or(Value::Null),
        ValueType::Double => row
            .get::<_, Option<f64>>(idx)
            .map(Value::Double)
            .unwrap_or(Value::Null),
        ValueType::Bytes => row
            .get::<_, Option<Vec<u8>>>(idx)
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        ValueType::Timestamp => row
            .get::<_, Option<SystemTime>>(idx)
            .map(|t| {
                let micros = match t.duration_since(UNIX_EPOCH) {
                    Ok(d) => d.as_micros() as i64,
                    Err(e) => -(e.duration().as_micros() as i64),
                };
                Value::Timestamp(micros)
            })
            .unwrap_or(Value::Null),
        ValueType::String => row
            .get::<_, Option<String>>(idx)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn rows_to_recordset(
    columns: &[tokio_postgres::Column],
    rows: &[tokio_postgres::Row],
) -> Recordset {
    let fields: Vec<FieldDesc> = columns
        .iter()
        .map(|c| FieldDesc::new(c.name(), column_type(c.type_())))
        .collect();
    let types: Vec<ValueType> = fields.iter().map(|f| f.ty).collect();
    let data = rows
        .iter()
        .map(|row| {
            types
                .iter()
                .enumerate()
                .map(|(i, ty)| field_value(row, i, *ty))
                .collect()
        })
        .collect();
    Recordset::from_rows(Schema::new(fields), data)
}

impl PostgresSession {
    async fn run(&self, text: &str, params: &[Value], want_rows: bool) -> Result<ExecOutcome> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DbError::ConnectionClosed)?;

        let boxed: Vec<Box<dyn tokio_postgres::types::ToSql + Sync + Send>> =
            params.iter().map(value_to_param).collect();
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = boxed
            .iter()
            .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        let statement = client.prepare(text).await.map_err(pg_error)?;
        if want_rows || !statement.columns().is_empty() {
            let rows = client.query(&statement, &refs).await.map_err(pg_error)?;
            Ok(ExecOutcome::Rows(rows_to_recordset(
                statement.columns(),
                &rows,
            )))
        } else {
            let affected = client.execute(&statement, &refs).await.map_err(pg_error)?;
            Ok(ExecOutcome::Count(affected))
        }
    }

    async fn batch(&self, sql: &str) -> Result<()> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DbError::ConnectionClosed)?;
        client.batch_execute(sql).await.map_err(pg_error)
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn execute(&self, text: &str, params: &[Value], want_rows: bool) -> Result<ExecOutcome> {
        self.run(text, params, want_rows).await
    }

    async fn introspect(&self, scope: &MetaContext) -> Result<Vec<Vec<Value>>> {
        let filter_value = |column: &str| -> Option<String> {
            scope
                .filter()
                .filter(|(name, _)| *name == column)
                .map(|(_, value)| value.as_string())
        };

        let (sql, filter) = match scope.table() {
            CacheTable::Catalog => (
                "SELECT current_database() AS catalog_name".to_string(),
                None,
            ),
            CacheTable::Schemata => {
                let filter = filter_value("schema_name");
                let mut sql = "SELECT catalog_name::text, schema_name::text, \
                               schema_owner::text FROM information_schema.schemata"
                    .to_string();
                if filter.is_some() {
                    sql.push_str(" WHERE schema_name = $1");
                }
                sql.push_str(" ORDER BY schema_name");
                (sql, filter)
            }
            CacheTable::Tables => {
                let filter = filter_value("table_name");
                let mut sql = "SELECT table_schema::text, table_name::text, table_type::text \
                               FROM information_schema.tables \
                               WHERE table_schema NOT IN ('pg_catalog', 'information_schema')"
                    .to_string();
                if filter.is_some() {
                    sql.push_str(" AND table_name = $1");
                }
                sql.push_str(" ORDER BY table_schema, table_name");
                (sql, filter)
            }
            CacheTable::Columns => {
                let filter = filter_value("table_name");
                let mut sql = "SELECT table_schema::text, table_name::text, column_name::text, \
                               ordinal_position::int8, data_type::text, \
                               (is_nullable = 'YES') AS is_nullable \
                               FROM information_schema.columns \
                               WHERE table_schema NOT IN ('pg_catalog', 'information_schema')"
                    .to_string();
                if filter.is_some() {
                    sql.push_str(" AND table_name = $1");
                }
                sql.push_str(" ORDER BY table_schema, table_name, ordinal_position");
                (sql, filter)
            }
        };

        let params: Vec<Value> = filter.into_iter().map(Value::String).collect();
        let outcome = self.run(&sql, &params, true).await?;
        let rs = outcome
            .into_rows()
            .ok_or_else(|| DbError::internal("introspection query produced no recordset"))?;
        Ok(rs.iter().map(|row| row.values().to_vec()).collect())
    }

    async fn begin(&self, mode: TransactionMode) -> Result<()> {
        let sql = match mode {
            TransactionMode::None | TransactionMode::ReadCommitted => {
                "BEGIN ISOLATION LEVEL READ COMMITTED"
            }
            TransactionMode::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
        };
        self.batch(sql).await
    }

    async fn commit(&self) -> Result<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        self.batch("ROLLBACK").await
    }

    async fn close(&self) -> Result<()> {
        // Dropping the client ends the spawned driver task.
        let mut guard = self.client.lock().await;
        guard.take();
        Ok(())
    }
}
