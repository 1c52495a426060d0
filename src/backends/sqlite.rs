//! SQLite provider
//!
//! Sessions are backed by a deadpool-sqlite connection pool. Autocommit
//! statements run on whatever pooled connection is free; a transaction pins
//! one pooled connection for its whole begin/commit span, since transaction
//! state is per-connection.
//!
//! Connection strings use `key=value;` pairs: `DB_NAME` (required, `:memory:`
//! allowed) and `DB_DIR` (optional directory prefix). A string without `=` is
//! taken as a plain path.

use async_trait::async_trait;
use std::path::PathBuf;

use deadpool_sqlite::{Config, Object, Pool, Runtime};
use rusqlite::params_from_iter;

use crate::core::connection::ConnectOptions;
use crate::core::error::{DbError, Result};
use crate::core::meta::{CacheTable, MetaContext};
use crate::core::provider::{
    Capabilities, ExecOutcome, ParamStyle, Provider, Session, TransactionMode,
};
use crate::core::recordset::{FieldDesc, Recordset, Schema};
use crate::core::value::{Value, ValueType};

/// SQLite provider descriptor
#[derive(Default)]
pub struct SqliteProvider;

impl SqliteProvider {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a `key=value;` connection string into a database path
    fn resolve_path(connection_string: &str, options: &ConnectOptions) -> Result<PathBuf> {
        if !connection_string.contains('=') {
            if connection_string.is_empty() {
                return Err(DbError::connection("empty connection string"));
            }
            return Ok(PathBuf::from(connection_string));
        }

        let mut db_name: Option<String> = None;
        let mut db_dir: Option<String> = None;
        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((key, value)) => match key.trim().to_ascii_uppercase().as_str() {
                    "DB_NAME" => db_name = Some(value.trim().to_string()),
                    "DB_DIR" => db_dir = Some(value.trim().to_string()),
                    other => {
                        tracing::debug!(key = other, "ignoring connection string key");
                    }
                },
                None => {
                    return Err(DbError::connection(format!(
                        "malformed connection string segment: {pair}"
                    )))
                }
            }
        }

        let db_name = db_name
            .or_else(|| options.get_option("DB_NAME").map(str::to_string))
            .ok_or_else(|| DbError::connection("DB_NAME missing from connection string"))?;
        let db_dir = db_dir.or_else(|| options.get_option("DB_DIR").map(str::to_string));

        if db_name == ":memory:" {
            return Ok(PathBuf::from(":memory:"));
        }
        Ok(match db_dir {
            Some(dir) => PathBuf::from(dir).join(db_name),
            None => PathBuf::from(db_name),
        })
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &'static str {
        "SQLite"
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
        let path = Self::resolve_path(connection_string, options)?;

        let mut config = Config::new(path.clone());
        if path == PathBuf::from(":memory:") {
            // Every pooled connection opens its own in-memory database, so
            // in-memory sessions are pinned to a single connection.
            config.pool = Some(deadpool::managed::PoolConfig::new(1));
        }
        let pool = config.create_pool(Runtime::Tokio1).map_err(|e| {
            DbError::connection_with_source("failed to create connection pool", Box::new(e))
        })?;

        // Validate the configuration with an initial checkout.
        let conn = pool.get().await.map_err(|e| {
            DbError::connection_with_source("failed to acquire initial connection", Box::new(e))
        })?;
        conn.interact(|conn| conn.execute_batch("PRAGMA foreign_keys = ON"))
            .await
            .map_err(|e| DbError::internal(format!("interact error: {e}")))?
            .map_err(DbError::from)?;
        drop(conn);

        tracing::debug!(path = %path.display(), "sqlite session established");
        Ok(Box::new(SqliteSession {
            pool,
            tx: tokio::sync::Mutex::new(None),
        }))
    }
}

/// One pooled SQLite session
pub struct SqliteSession {
    pool: Pool,
    /// Pinned connection while a transaction is active
    tx: tokio::sync::Mutex<Option<Object>>,
}

impl SqliteSession {
    async fn checkout(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| {
            DbError::connection_with_source("failed to acquire connection", Box::new(e))
        })
    }

    /// Run a closure on the pinned transaction connection, or any pooled one
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tx_guard = self.tx.lock().await;
        if let Some(pinned) = tx_guard.as_ref() {
            pinned
                .interact(f)
                .await
                .map_err(|e| DbError::internal(format!("interact error: {e}")))?
        } else {
            drop(tx_guard);
            let conn = self.checkout().await?;
            conn.interact(f)
                .await
                .map_err(|e| DbError::internal(format!("interact error: {e}")))?
        }
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn execute(&self, text: &str, params: &[Value], want_rows: bool) -> Result<ExecOutcome> {
        let text = text.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&text)?;
            let sql_params: Vec<Box<dyn rusqlite::ToSql>> =
                params.iter().map(value_to_param).collect();
            if want_rows || stmt.column_count() > 0 {
                let rs = collect_recordset(&mut stmt, &sql_params)?;
                Ok(ExecOutcome::Rows(rs))
            } else {
                let affected = stmt.execute(params_from_iter(sql_params.iter()))?;
                Ok(ExecOutcome::Count(affected as u64))
            }
        })
        .await
    }

    async fn introspect(&self, scope: &MetaContext) -> Result<Vec<Vec<Value>>> {
        let scope = scope.clone();
        self.with_conn(move |conn| introspect_conn(conn, &scope)).await
    }

    async fn begin(&self, mode: TransactionMode) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        if let Some(stale) = tx_guard.take() {
            // A timed-out envelope can leave a pinned transaction behind.
            let _ = stale
                .interact(|conn| conn.execute_batch("ROLLBACK"))
                .await;
        }

        // SQLite has no isolation-level clause; read-committed maps to a
        // deferred transaction, serializable to an immediate one.
        let sql = match mode {
            TransactionMode::None | TransactionMode::ReadCommitted => "BEGIN DEFERRED",
            TransactionMode::Serializable => "BEGIN IMMEDIATE",
        };
        let conn = self.checkout().await?;
        conn.interact(move |conn| conn.execute_batch(sql))
            .await
            .map_err(|e| DbError::internal(format!("interact error: {e}")))?
            .map_err(DbError::from)?;
        *tx_guard = Some(conn);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        let conn = tx_guard
            .take()
            .ok_or_else(|| DbError::internal("no active transaction"))?;
        conn.interact(|conn| conn.execute_batch("COMMIT"))
            .await
            .map_err(|e| DbError::internal(format!("interact error: {e}")))?
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        let conn = tx_guard
            .take()
            .ok_or_else(|| DbError::internal("no active transaction"))?;
        conn.interact(|conn| conn.execute_batch("ROLLBACK"))
            .await
            .map_err(|e| DbError::internal(format!("interact error: {e}")))?
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut tx_guard = self.tx.lock().await;
        if let Some(stale) = tx_guard.take() {
            let _ = stale
                .interact(|conn| conn.execute_batch("ROLLBACK"))
                .await;
        }
        self.pool.close();
        Ok(())
    }
}

/// Convert a field value to a rusqlite parameter
fn value_to_param(value: &Value) -> Box<dyn rusqlite::ToSql> {
    match value {
        Value::Null => Box::new(None::<i64>),
        Value::Bool(v) => Box::new(*v),
        Value::Int(v) => Box::new(*v),
        Value::Long(v) => Box::new(*v),
        Value::Double(v) => Box::new(*v),
        Value::String(v) => Box::new(v.clone()),
        Value::Bytes(v) => Box::new(v.clone()),
        Value::Timestamp(v) => Box::new(*v),
    }
}

fn value_from_ref(vr: rusqlite::types::ValueRef<'_>) -> Value {
    match vr {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(v) => Value::Long(v),
        rusqlite::types::ValueRef::Real(v) => Value::Double(v),
        rusqlite::types::ValueRef::Text(v) => Value::String(String::from_utf8_lossy(v).to_string()),
        rusqlite::types::ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
    }
}

fn column_type(decl: Option<&str>) -> Option<ValueType> {
    decl.map(str::to_ascii_uppercase)
        .and_then(|decl| match decl.as_str() {
            "TEXT" => Some(ValueType::String),
            "INTEGER" | "INT" | "BIGINT" => Some(ValueType::Long),
            "BOOLEAN" => Some(ValueType::Bool),
            "REAL" | "DOUBLE" => Some(ValueType::Double),
            "BLOB" => Some(ValueType::Bytes),
            "TIMESTAMP" => Some(ValueType::Timestamp),
            _ => None,
        })
}

/// Execute a prepared select and package the rows
fn collect_recordset(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[Box<dyn rusqlite::ToSql>],
) -> Result<Recordset> {
    let mut field_types: Vec<Option<ValueType>> = stmt
        .columns()
        .iter()
        .map(|c| column_type(c.decl_type()))
        .collect();
    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut sql_rows = stmt.query(params_from_iter(params.iter()))?;
    let mut rows: Vec<Vec<Value>> = Vec::new();
    while let Some(row) = sql_rows.next()? {
        let mut values = Vec::with_capacity(names.len());
        for i in 0..names.len() {
            values.push(value_from_ref(row.get_ref(i)?));
        }
        rows.push(values);
    }

    // Columns without a declared type take the type of the first non-null
    // value seen, then string.
    for (i, ty) in field_types.iter_mut().enumerate() {
        if ty.is_none() {
            *ty = rows
                .iter()
                .find_map(|r| r[i].value_type())
                .or(Some(ValueType::String));
        }
    }

    let fields = names
        .into_iter()
        .zip(field_types)
        .map(|(name, ty)| FieldDesc::new(name, ty.unwrap_or(ValueType::String)))
        .collect();
    Ok(Recordset::from_rows(Schema::new(fields), rows))
}

/// Query SQLite's introspection surface for one cache-table scope
///
/// Rows come back aligned to the scope's [`CacheTable::columns`] layout.
/// Filters on `table_name` (tables, columns) and `schema_name` (schemata)
/// are honored; other filter columns widen to the full scope.
fn introspect_conn(
    conn: &mut rusqlite::Connection,
    scope: &MetaContext,
) -> Result<Vec<Vec<Value>>> {
    let filter_value = |column: &str| -> Option<String> {
        scope
            .filter()
            .filter(|(name, _)| *name == column)
            .map(|(_, value)| value.as_string())
    };

    match scope.table() {
        CacheTable::Catalog => Ok(vec![vec![Value::from("main")]]),

        CacheTable::Schemata => {
            let wanted = filter_value("schema_name");
            let mut stmt = conn.prepare("PRAGMA database_list")?;
            let mut sql_rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = sql_rows.next()? {
                let name: String = row.get(1)?;
                if let Some(wanted) = &wanted {
                    if *wanted != name {
                        continue;
                    }
                }
                out.push(vec![Value::from("main"), Value::from(name), Value::Null]);
            }
            Ok(out)
        }

        CacheTable::Tables => {
            let rows = list_tables(conn, filter_value("table_name"))?;
            Ok(rows
                .into_iter()
                .map(|(name, kind)| {
                    vec![Value::from("main"), Value::from(name), Value::from(kind)]
                })
                .collect())
        }

        CacheTable::Columns => {
            let tables = list_tables(conn, filter_value("table_name"))?;
            let mut out = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT cid, name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            for (table, _) in tables {
                let mut sql_rows = stmt.query(rusqlite::params![table])?;
                while let Some(row) = sql_rows.next()? {
                    let cid: i64 = row.get(0)?;
                    let name: String = row.get(1)?;
                    let data_type: String = row.get(2)?;
                    let notnull: i64 = row.get(3)?;
                    out.push(vec![
                        Value::from("main"),
                        Value::from(table.clone()),
                        Value::from(name),
                        Value::Long(cid + 1),
                        Value::from(data_type),
                        Value::Bool(notnull == 0),
                    ]);
                }
            }
            Ok(out)
        }
    }
}

/// Tables and views, `(name, information-schema table type)`
fn list_tables(
    conn: &rusqlite::Connection,
    name_filter: Option<String>,
) -> Result<Vec<(String, &'static str)>> {
    let base = "SELECT name, type FROM sqlite_master \
                WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'";
    let mut out = Vec::new();
    let mut collect = |sql_rows: &mut rusqlite::Rows<'_>| -> Result<()> {
        while let Some(row) = sql_rows.next()? {
            let name: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let kind = if kind == "view" { "VIEW" } else { "BASE TABLE" };
            out.push((name, kind));
        }
        Ok(())
    };
    match name_filter {
        Some(name) => {
            let mut stmt = conn.prepare(&format!("{base} AND name = ?1 ORDER BY name"))?;
            let mut sql_rows = stmt.query(rusqlite::params![name])?;
            collect(&mut sql_rows)?;
        }
        None => {
            let mut stmt = conn.prepare(&format!("{base} ORDER BY name"))?;
            let mut sql_rows = stmt.query([])?;
            collect(&mut sql_rows)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_key_value() {
        let options = ConnectOptions::new();
        let path =
            SqliteProvider::resolve_path("DB_DIR=/tmp/data;DB_NAME=test", &options).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/data/test"));

        let path = SqliteProvider::resolve_path("DB_NAME=:memory:", &options).unwrap();
        assert_eq!(path, PathBuf::from(":memory:"));
    }

    #[test]
    fn test_resolve_path_plain() {
        let options = ConnectOptions::new();
        let path = SqliteProvider::resolve_path("/tmp/plain.db", &options).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/plain.db"));
    }

    #[test]
    fn test_resolve_path_missing_name() {
        let options = ConnectOptions::new();
        let err = SqliteProvider::resolve_path("DB_DIR=/tmp", &options).unwrap_err();
        assert!(matches!(err, DbError::ConnectionError { .. }));
    }

    #[test]
    fn test_resolve_path_options_fallback() {
        let options = ConnectOptions::new().option("DB_NAME", "fallback.db");
        let path = SqliteProvider::resolve_path("DB_DIR=/tmp;", &options).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/fallback.db"));
    }

    #[tokio::test]
    async fn test_session_execute_roundtrip() {
        let provider = SqliteProvider::new();
        let session = provider
            .connect("DB_NAME=:memory:", &ConnectOptions::new())
            .await
            .unwrap();

        let outcome = session
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[], false)
            .await
            .unwrap();
        assert_eq!(outcome.count(), 0);

        let outcome = session
            .execute(
                "INSERT INTO t (name) VALUES (?)",
                &[Value::from("Alice")],
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.count(), 1);

        let outcome = session.execute("SELECT * FROM t", &[], true).await.unwrap();
        let rows = outcome.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows.row(0).unwrap().get("name").and_then(Value::as_str),
            Some("Alice")
        );
    }

    #[tokio::test]
    async fn test_session_transaction_rollback() {
        let provider = SqliteProvider::new();
        let session = provider
            .connect("DB_NAME=:memory:", &ConnectOptions::new())
            .await
            .unwrap();
        session
            .execute("CREATE TABLE t (id INTEGER)", &[], false)
            .await
            .unwrap();

        session.begin(TransactionMode::Serializable).await.unwrap();
        session
            .execute("INSERT INTO t VALUES (1)", &[], false)
            .await
            .unwrap();
        session.rollback().await.unwrap();

        let outcome = session
            .execute("SELECT COUNT(*) AS n FROM t", &[], true)
            .await
            .unwrap();
        let n = outcome
            .rows()
            .unwrap()
            .row(0)
            .unwrap()
            .get("n")
            .unwrap()
            .as_long();
        assert_eq!(n, Some(0));
    }

    #[tokio::test]
    async fn test_session_introspect_columns() {
        let provider = SqliteProvider::new();
        let session = provider
            .connect("DB_NAME=:memory:", &ConnectOptions::new())
            .await
            .unwrap();
        session
            .execute(
                "CREATE TABLE user (name TEXT PRIMARY KEY, num INTEGER)",
                &[],
                false,
            )
            .await
            .unwrap();

        let scope = MetaContext::with_filter(CacheTable::Columns, "table_name", "user");
        let rows = session.introspect(&scope).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][2], Value::from("name"));
        assert_eq!(rows[0][4], Value::from("TEXT"));
        assert_eq!(rows[1][2], Value::from("num"));
        assert_eq!(rows[1][4], Value::from("INTEGER"));
    }
}
