//! MySQL provider
//!
//! Sessions are backed by a mysql_async pool. Autocommit statements borrow
//! whatever pooled connection is free; a transaction pins one connection for
//! its whole begin/commit span. Connection strings are `mysql://` URLs;
//! username and password from [`ConnectOptions`] override the URL when set.

use async_trait::async_trait;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Pool, Row};

use crate::core::connection::ConnectOptions;
use crate::core::error::{DbError, Result};
use crate::core::meta::{CacheTable, MetaContext};
use crate::core::provider::{
    Capabilities, ExecOutcome, ParamStyle, Provider, Session, TransactionMode,
};
use crate::core::recordset::{FieldDesc, Recordset, Schema};
use crate::core::value::{Value, ValueType};

/// MySQL provider descriptor
#[derive(Default)]
pub struct MysqlProvider;

impl MysqlProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for MysqlProvider {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transaction_modes: vec![
                TransactionMode::None,
                TransactionMode::ReadCommitted,
                TransactionMode::Serializable,
            ],
            supports_parameters: true,
            param_style: ParamStyle::Qmark,
        }
    }

    async fn connect(
        &self,
        connection_string: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>> {
        let opts = Opts::from_url(connection_string).map_err(|e| {
            DbError::connection_with_source("invalid MySQL connection URL", Box::new(e))
        })?;
        let mut builder = OptsBuilder::from_opts(opts);
        if let Some(username) = options.get_username() {
            builder = builder.user(Some(username));
        }
        if let Some(password) = options.get_password() {
            builder = builder.pass(Some(password));
        }
        let pool = Pool::new(builder);

        // Validate reachability with an initial checkout.
        let conn = pool.get_conn().await.map_err(|e| {
            DbError::connection_with_source("failed to connect to MySQL", Box::new(e))
        })?;
        drop(conn);

        tracing::debug!("mysql session established");
        Ok(Box::new(MysqlSession {
            pool: parking_lot::Mutex::new(Some(pool)),
            tx: tokio::sync::Mutex::new(None),
        }))
    }
}

/// One pooled MySQL session
pub struct MysqlSession {
    pool: parking_lot::Mutex<Option<Pool>>,
    /// Pinned connection while a transaction is active
    tx: tokio::sync::Mutex<Option<Conn>>,
}

fn my_error(err: mysql_async::Error) -> DbError {
    match err {
        mysql_async::Error::Server(ref server) => {
            DbError::execution(server.code.to_string(), server.message.clone())
        }
        other => DbError::execution("-1", other.to_string()),
    }
}

fn value_to_my(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(v) => mysql_async::Value::Int(*v as i64),
        Value::Int(v) => mysql_async::Value::Int(*v as i64),
        Value::Long(v) => mysql_async::Value::Int(*v),
        Value::Double(v) => mysql_async::Value::Double(*v),
        Value::String(v) => mysql_async::Value::Bytes(v.clone().into_bytes()),
        Value::Bytes(v) => mysql_async::Value::Bytes(v.clone()),
        // Unix micros convention, matching the crate's Timestamp value
        Value::Timestamp(v) => mysql_async::Value::Int(*v),
    }
}

fn value_from_my(value: &mysql_async::Value) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(v) => Value::Long(*v),
        mysql_async::Value::UInt(v) => Value::Long(*v as i64),
        mysql_async::Value::Float(v) => Value::Double(*v as f64),
        mysql_async::Value::Double(v) => Value::Double(*v),
        mysql_async::Value::Bytes(b) => match String::from_utf8(b.clone()) {
            Ok(s) => Value::String(s),
            Err(_) => Value::Bytes(b.clone()),
        },
        mysql_async::Value::Date(year, month, day, hour, minute, second, micros) => {
            let datetime = chrono::NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .and_then(|d| {
                    d.and_hms_micro_opt(*hour as u32, *minute as u32, *second as u32, *micros)
                });
            match datetime {
                Some(dt) => Value::Timestamp(dt.and_utc().timestamp_micros()),
                None => Value::Null,
            }
        }
        mysql_async::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            Value::String(format!(
                "{sign}{}:{:02}:{:02}.{:06}",
                u64::from(*days) * 24 + u64::from(*hours),
                minutes,
                seconds,
                micros
            ))
        }
    }
}

fn rows_to_recordset(rows: &[Row]) -> Recordset {
    let Some(first) = rows.first() else {
        return Recordset::empty();
    };
    let names: Vec<String> = first
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();

    let data: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            (0..names.len())
                .map(|i| row.as_ref(i).map(value_from_my).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    let fields = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let ty = data
                .iter()
                .find_map(|r: &Vec<Value>| r[i].value_type())
                .unwrap_or(ValueType::String);
            FieldDesc::new(name, ty)
        })
        .collect();
    Recordset::from_rows(Schema::new(fields), data)
}

impl MysqlSession {
    fn pool(&self) -> Result<Pool> {
        self.pool
            .lock()
            .as_ref()
            .cloned()
            .ok_or(DbError::ConnectionClosed)
    }

    async fn run_on(
        conn: &mut Conn,
        text: &str,
        params: &[Value],
        want_rows: bool,
    ) -> Result<ExecOutcome> {
        let params = if params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(params.iter().map(value_to_my).collect())
        };
        if want_rows {
            let rows: Vec<Row> = conn.exec(text, params).await.map_err(my_error)?;
            Ok(ExecOutcome::Rows(rows_to_recordset(&rows)))
        } else {
            conn.exec_drop(text, params).await.map_err(my_error)?;
            Ok(ExecOutcome::Count(conn.affected_rows()))
        }
    }
}

#[async_trait]
impl Session for MysqlSession {
    async fn execute(&self, text: &str, params: &[Value], want_rows: bool) -> Result<ExecOutcome> {
        let mut tx_guard = self.tx.lock().await;
        match tx_guard.as_mut() {
            Some(conn) => Self::run_on(conn, text, params, want_rows).await,
            None => {
                drop(tx_guard);
                let mut conn = self.pool()?.get_conn().await.map_err(|e| {
                    DbError::connection_with_source("failed to acquire connection", Box::new(e))
                })?;
                Self::run_on(&mut conn, text, params, want_rows).await
            }
        }
    }

    async fn introspect(&self, scope: &MetaContext) -> Result<Vec<Vec<Value>>> {
        let filter_value = |column: &str| -> Option<String> {
            scope
                .filter()
                .filter(|(name, _)| *name == column)
                .map(|(_, value)| value.as_string())
        };

        let (sql, filter) = match scope.table() {
            // The MySQL information schema names every catalog `def`
            CacheTable::Catalog => return Ok(vec![vec![Value::from("def")]]),
            CacheTable::Schemata => {
                let filter = filter_value("schema_name");
                let mut sql = "SELECT catalog_name, schema_name, NULL AS schema_owner \
                               FROM information_schema.schemata"
                    .to_string();
                if filter.is_some() {
                    sql.push_str(" WHERE schema_name = ?");
                }
                sql.push_str(" ORDER BY schema_name");
                (sql, filter)
            }
            CacheTable::Tables => {
                let filter = filter_value("table_name");
                let mut sql = "SELECT table_schema, table_name, table_type \
                               FROM information_schema.tables WHERE table_schema = DATABASE()"
                    .to_string();
                if filter.is_some() {
                    sql.push_str(" AND table_name = ?");
                }
                sql.push_str(" ORDER BY table_name");
                (sql, filter)
            }
            CacheTable::Columns => {
                let filter = filter_value("table_name");
                let mut sql = "SELECT table_schema, table_name, column_name, ordinal_position, \
                               data_type, (is_nullable = 'YES') AS is_nullable \
                               FROM information_schema.columns WHERE table_schema = DATABASE()"
                    .to_string();
                if filter.is_some() {
                    sql.push_str(" AND table_name = ?");
                }
                sql.push_str(" ORDER BY table_name, ordinal_position");
                (sql, filter)
            }
        };

        let params: Vec<Value> = filter.into_iter().map(Value::String).collect();
        let outcome = self.execute(&sql, &params, true).await?;
        let rs = outcome
            .into_rows()
            .ok_or_else(|| DbError::internal("introspection query produced no recordset"))?;
        Ok(rs.iter().map(|row| row.values().to_vec()).collect())
    }

    async fn begin(&self, mode: TransactionMode) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        if let Some(mut stale) = tx_guard.take() {
            // A timed-out envelope can leave a pinned transaction behind.
            let _ = stale.query_drop("ROLLBACK").await;
        }

        let level = match mode {
            TransactionMode::None | TransactionMode::ReadCommitted => "READ COMMITTED",
            TransactionMode::Serializable => "SERIALIZABLE",
        };
        let mut conn = self.pool()?.get_conn().await.map_err(|e| {
            DbError::connection_with_source("failed to acquire connection", Box::new(e))
        })?;
        conn.query_drop(format!("SET TRANSACTION ISOLATION LEVEL {level}"))
            .await
            .map_err(my_error)?;
        conn.query_drop("START TRANSACTION").await.map_err(my_error)?;
        *tx_guard = Some(conn);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        let mut conn = tx_guard
            .take()
            .ok_or_else(|| DbError::internal("no active transaction"))?;
        conn.query_drop("COMMIT").await.map_err(my_error)
    }

    async fn rollback(&self) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        let mut conn = tx_guard
            .take()
            .ok_or_else(|| DbError::internal("no active transaction"))?;
        conn.query_drop("ROLLBACK").await.map_err(my_error)
    }

    async fn close(&self) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        if let Some(mut stale) = tx_guard.take() {
            let _ = stale.query_drop("ROLLBACK").await;
        }
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.disconnect().await.map_err(my_error)?;
        }
        Ok(())
    }
}
