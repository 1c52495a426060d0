//! Meta store
//!
//! A locally cached, queryable mirror of database catalog information. The
//! cache is backed by an embedded SQLite database (in-memory by default,
//! file-backed via [`MetaStore::open`]) holding one table per entry of the
//! closed [`CacheTable`] vocabulary.
//!
//! Freshness is explicit: the store never refreshes itself. Writes happen
//! only through [`Connection::update_meta_store`](crate::core::Connection::update_meta_store),
//! which introspects the live database and applies the result here as one
//! atomic upsert. Reads happen only through [`MetaStore::extract`], which
//! touches the local cache alone.

use std::path::Path;
use std::sync::Arc;

use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::core::error::{DbError, Result};
use crate::core::recordset::{FieldDesc, Recordset, Schema};
use crate::core::value::{Value, ValueType};

/// Closed vocabulary of catalog cache tables
///
/// Metadata keys resolve to fixed column layouts and natural keys at compile
/// time; there is no runtime dictionary of cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheTable {
    /// `_information_schema_catalog`: the single catalog name
    Catalog,
    /// `_schemata`: namespaces within the catalog
    Schemata,
    /// `_tables`: tables and views
    Tables,
    /// `_columns`: columns of every table
    Columns,
}

impl CacheTable {
    /// Every cache table, in refresh order
    pub const ALL: [CacheTable; 4] = [
        CacheTable::Catalog,
        CacheTable::Schemata,
        CacheTable::Tables,
        CacheTable::Columns,
    ];

    /// SQL-visible name of the cache table
    pub fn table_name(self) -> &'static str {
        match self {
            CacheTable::Catalog => "_information_schema_catalog",
            CacheTable::Schemata => "_schemata",
            CacheTable::Tables => "_tables",
            CacheTable::Columns => "_columns",
        }
    }

    /// Ordered column layout of the cache table
    pub fn columns(self) -> &'static [(&'static str, ValueType)] {
        match self {
            CacheTable::Catalog => &[("catalog_name", ValueType::String)],
            CacheTable::Schemata => &[
                ("catalog_name", ValueType::String),
                ("schema_name", ValueType::String),
                ("schema_owner", ValueType::String),
            ],
            CacheTable::Tables => &[
                ("table_schema", ValueType::String),
                ("table_name", ValueType::String),
                ("table_type", ValueType::String),
            ],
            CacheTable::Columns => &[
                ("table_schema", ValueType::String),
                ("table_name", ValueType::String),
                ("column_name", ValueType::String),
                ("ordinal_position", ValueType::Long),
                ("data_type", ValueType::String),
                ("is_nullable", ValueType::Bool),
            ],
        }
    }

    /// Natural key columns used for upsert matching
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            CacheTable::Catalog => &["catalog_name"],
            CacheTable::Schemata => &["schema_name"],
            CacheTable::Tables => &["table_schema", "table_name"],
            CacheTable::Columns => &["table_schema", "table_name", "column_name"],
        }
    }

    /// Resolve a SQL-visible name back into the vocabulary
    pub fn from_table_name(name: &str) -> Option<Self> {
        CacheTable::ALL
            .into_iter()
            .find(|t| t.table_name() == name)
    }

    fn create_sql(self) -> String {
        let columns: Vec<String> = self
            .columns()
            .iter()
            .map(|(name, ty)| {
                let sql_ty = match ty {
                    ValueType::Long | ValueType::Int => "INTEGER",
                    ValueType::Bool => "BOOLEAN",
                    ValueType::Double => "REAL",
                    ValueType::Bytes => "BLOB",
                    ValueType::Timestamp => "TIMESTAMP",
                    ValueType::String => "TEXT",
                };
                format!("{name} {sql_ty}")
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            self.table_name(),
            columns.join(", "),
            self.key_columns().join(", ")
        )
    }
}

/// Scope descriptor for one catalog synchronization
///
/// Transient: constructed per `update_meta_store` call, never persisted.
#[derive(Debug, Clone)]
pub struct MetaContext {
    table: CacheTable,
    filter: Option<(String, Value)>,
}

impl MetaContext {
    /// Refresh the whole cache table
    pub fn new(table: CacheTable) -> Self {
        Self {
            table,
            filter: None,
        }
    }

    /// Restrict the refresh to rows where `column` equals `value`
    ///
    /// The column must belong to the target cache table's layout.
    pub fn with_filter(table: CacheTable, column: &str, value: impl Into<Value>) -> Self {
        Self {
            table,
            filter: Some((column.to_string(), value.into())),
        }
    }

    pub fn table(&self) -> CacheTable {
        self.table
    }

    pub fn filter(&self) -> Option<(&str, &Value)> {
        self.filter.as_ref().map(|(c, v)| (c.as_str(), v))
    }
}

/// The synchronized catalog cache
pub struct MetaStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl MetaStore {
    /// Create an in-memory store
    pub fn in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn)
    }

    /// Create or reopen a file-backed store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        for table in CacheTable::ALL {
            conn.execute_batch(&table.create_sql())?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read-only query against the local cache only
    ///
    /// The query must be a `SELECT` over the cache-table vocabulary; it never
    /// touches the live database. `params` bind to positional `?`
    /// placeholders. Fails with [`DbError::UnknownCacheTable`] when the query
    /// targets a table outside the vocabulary.
    pub async fn extract(&self, query: &str, params: &[Value]) -> Result<Recordset> {
        validate_cache_query(query)?;

        let query = query.to_string();
        let params = params.to_vec();
        let conn_arc = Arc::clone(&self.conn);

        let task = tokio::task::spawn_blocking(move || -> Result<Recordset> {
            let conn = conn_arc.blocking_lock();
            let mut stmt = conn.prepare(&query)?;

            let mut field_types: Vec<Option<ValueType>> = stmt
                .columns()
                .iter()
                .map(|c| c.decl_type().and_then(decl_to_type))
                .collect();
            let names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();

            let sql_params: Vec<Box<dyn rusqlite::ToSql>> =
                params.iter().map(value_to_sql).collect();
            let mut sql_rows = stmt.query(params_from_iter(sql_params.iter()))?;

            let mut rows: Vec<Vec<Value>> = Vec::new();
            while let Some(row) = sql_rows.next()? {
                let mut values = Vec::with_capacity(names.len());
                for (i, declared) in field_types.iter().enumerate() {
                    let raw = value_from_ref(row.get_ref(i)?);
                    values.push(coerce_declared(raw, *declared));
                }
                rows.push(values);
            }

            // Declared types are unknown for computed columns; fall back to
            // the first non-null value seen, then to string.
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
        });

        task.await
            .map_err(|e| DbError::internal(format!("task join error: {e}")))?
    }

    /// Full ordered contents of one cache table
    ///
    /// Rows come back sorted by natural key, so two snapshots of identical
    /// cache state render identically.
    pub async fn snapshot(&self, table: CacheTable) -> Result<Recordset> {
        let query = format!(
            "SELECT * FROM {} ORDER BY {}",
            table.table_name(),
            table.key_columns().join(", ")
        );
        self.extract(&query, &[]).await
    }

    /// Apply one synchronization result: upsert live rows, drop vanished ones
    ///
    /// Live rows are matched by the cache table's natural key (replaced on
    /// match, inserted on miss), and cache rows inside the context's scope
    /// that no live row touched are deleted. The whole set is a single
    /// transaction; a concurrent `extract` sees either none or all of it.
    pub(crate) async fn apply(&self, ctx: &MetaContext, rows: Vec<Vec<Value>>) -> Result<()> {
        let table = ctx.table();
        let columns = table.columns();
        for row in &rows {
            if row.len() != columns.len() {
                return Err(DbError::internal(format!(
                    "introspection row has {} values, cache table {} has {} columns",
                    row.len(),
                    table.table_name(),
                    columns.len()
                )));
            }
        }
        if let Some((column, _)) = ctx.filter() {
            if !columns.iter().any(|(name, _)| *name == column) {
                return Err(DbError::internal(format!(
                    "filter column {column} not in cache table {}",
                    table.table_name()
                )));
            }
        }

        let ctx = ctx.clone();
        let conn_arc = Arc::clone(&self.conn);

        let task = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = conn_arc.blocking_lock();
            let tx = conn.transaction().map_err(DbError::from)?;

            let table = ctx.table();
            let columns = table.columns();
            let keys = table.key_columns();
            let key_positions: Vec<usize> = keys
                .iter()
                .map(|k| {
                    columns
                        .iter()
                        .position(|(name, _)| name == k)
                        .expect("key columns are a subset of the layout")
                })
                .collect();

            let (scope_sql, scope_param) = match ctx.filter() {
                Some((column, value)) => (format!(" WHERE {column} = ?"), Some(value.clone())),
                None => (String::new(), None),
            };

            // Keys already cached within the scope, before this refresh.
            let select_keys = format!(
                "SELECT {} FROM {}{}",
                keys.join(", "),
                table.table_name(),
                scope_sql
            );
            let mut existing: Vec<Vec<String>> = Vec::new();
            {
                let mut stmt = tx.prepare(&select_keys).map_err(DbError::from)?;
                let scope_params: Vec<Box<dyn rusqlite::ToSql>> =
                    scope_param.iter().map(value_to_sql).collect();
                let mut sql_rows = stmt
                    .query(params_from_iter(scope_params.iter()))
                    .map_err(DbError::from)?;
                while let Some(row) = sql_rows.next().map_err(DbError::from)? {
                    let mut key = Vec::with_capacity(keys.len());
                    for i in 0..keys.len() {
                        key.push(value_from_ref(row.get_ref(i).map_err(DbError::from)?).as_string());
                    }
                    existing.push(key);
                }
            }

            let upsert = format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                table.table_name(),
                columns
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", "),
                vec!["?"; columns.len()].join(", ")
            );
            let mut live_keys: std::collections::HashSet<Vec<String>> =
                std::collections::HashSet::new();
            {
                let mut stmt = tx.prepare(&upsert).map_err(DbError::from)?;
                for row in &rows {
                    let sql_params: Vec<Box<dyn rusqlite::ToSql>> =
                        row.iter().map(value_to_sql).collect();
                    stmt.execute(params_from_iter(sql_params.iter()))
                        .map_err(DbError::from)?;
                    live_keys.insert(
                        key_positions
                            .iter()
                            .map(|&i| row[i].as_string())
                            .collect(),
                    );
                }
            }

            // Rows in scope that the live catalog no longer has.
            let delete = format!(
                "DELETE FROM {} WHERE {}",
                table.table_name(),
                keys.iter()
                    .map(|k| format!("{k} = ?"))
                    .collect::<Vec<_>>()
                    .join(" AND ")
            );
            let mut deleted = 0usize;
            {
                let mut stmt = tx.prepare(&delete).map_err(DbError::from)?;
                for key in existing.iter().filter(|k| !live_keys.contains(*k)) {
                    stmt.execute(params_from_iter(key.iter()))
                        .map_err(DbError::from)?;
                    deleted += 1;
                }
            }

            tx.commit().map_err(DbError::from)?;
            tracing::debug!(
                table = table.table_name(),
                upserted = rows.len(),
                deleted,
                "meta store refresh applied"
            );
            Ok(())
        });

        task.await
            .map_err(|e| DbError::internal(format!("task join error: {e}")))?
    }
}

/// Reject anything but a SELECT over the cache-table vocabulary
fn validate_cache_query(query: &str) -> Result<()> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for c in query.chars() {
        if in_string {
            if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => in_string = true,
            c if c.is_ascii_alphanumeric() || c == '_' => current.push(c),
            c => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                if c == '(' || c == ')' {
                    tokens.push(c.to_string());
                }
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    match tokens.first() {
        Some(first) if first.eq_ignore_ascii_case("select") => {}
        _ => {
            return Err(DbError::execution(
                "-1",
                "meta store queries must be read-only SELECT statements",
            ))
        }
    }

    let mut expect_table = false;
    for token in &tokens {
        if expect_table {
            expect_table = false;
            if token.as_str() != "(" && CacheTable::from_table_name(token).is_none() {
                return Err(DbError::UnknownCacheTable(token.clone()));
            }
        }
        if token.eq_ignore_ascii_case("from") || token.eq_ignore_ascii_case("join") {
            expect_table = true;
        } else if token.starts_with('_') && CacheTable::from_table_name(token).is_none() {
            return Err(DbError::UnknownCacheTable(token.clone()));
        }
    }
    Ok(())
}

fn decl_to_type(decl: &str) -> Option<ValueType> {
    match decl.to_ascii_uppercase().as_str() {
        "TEXT" => Some(ValueType::String),
        "INTEGER" | "INT" | "BIGINT" => Some(ValueType::Long),
        "BOOLEAN" => Some(ValueType::Bool),
        "REAL" | "DOUBLE" => Some(ValueType::Double),
        "BLOB" => Some(ValueType::Bytes),
        "TIMESTAMP" => Some(ValueType::Timestamp),
        _ => None,
    }
}

/// Align a raw storage value with the column's declared type
fn coerce_declared(value: Value, declared: Option<ValueType>) -> Value {
    match (declared, value) {
        (Some(ValueType::Bool), Value::Long(n)) => Value::Bool(n != 0),
        (Some(ValueType::Timestamp), Value::Long(n)) => Value::Timestamp(n),
        (_, value) => value,
    }
}

fn value_to_sql(value: &Value) -> Box<dyn rusqlite::ToSql> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn columns_row(table: &str, column: &str, position: i64, ty: &str) -> Vec<Value> {
        vec![
            Value::String("main".to_string()),
            Value::String(table.to_string()),
            Value::String(column.to_string()),
            Value::Long(position),
            Value::String(ty.to_string()),
            Value::Bool(true),
        ]
    }

    #[test]
    fn test_vocabulary_is_closed() {
        assert_eq!(
            CacheTable::from_table_name("_columns"),
            Some(CacheTable::Columns)
        );
        assert_eq!(CacheTable::from_table_name("_views"), None);
        for table in CacheTable::ALL {
            assert!(table.table_name().starts_with('_'));
            for key in table.key_columns() {
                assert!(table.columns().iter().any(|(name, _)| name == key));
            }
        }
    }

    #[test]
    fn test_validate_rejects_unknown_table() {
        assert!(validate_cache_query("SELECT * FROM _tables").is_ok());
        assert!(validate_cache_query("select table_name from _columns where x = 1").is_ok());

        let err = validate_cache_query("SELECT * FROM _views").unwrap_err();
        assert!(matches!(err, DbError::UnknownCacheTable(name) if name == "_views"));

        let err = validate_cache_query("SELECT * FROM users").unwrap_err();
        assert!(matches!(err, DbError::UnknownCacheTable(name) if name == "users"));
    }

    #[test]
    fn test_validate_rejects_non_select() {
        let err = validate_cache_query("DELETE FROM _tables").unwrap_err();
        assert!(matches!(err, DbError::ExecutionError { .. }));
    }

    #[test]
    fn test_validate_ignores_string_literals() {
        assert!(
            validate_cache_query("SELECT * FROM _columns WHERE table_name = '_not_a_table'")
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_apply_then_extract() {
        let store = MetaStore::in_memory().unwrap();
        let ctx = MetaContext::new(CacheTable::Columns);
        store
            .apply(
                &ctx,
                vec![
                    columns_row("user", "name", 1, "TEXT"),
                    columns_row("user", "num", 2, "INTEGER"),
                ],
            )
            .await
            .unwrap();

        let rs = store
            .extract(
                "SELECT * FROM _columns WHERE table_name = ?",
                &[Value::from("user")],
            )
            .await
            .unwrap();
        assert_eq!(rs.len(), 2);
        let row = rs.row(0).unwrap();
        assert_eq!(row.get("column_name").and_then(Value::as_str), Some("name"));
        assert_eq!(row.get("is_nullable").unwrap(), &Value::Bool(true));
    }

    #[tokio::test]
    async fn test_apply_scoped_delete() {
        let store = MetaStore::in_memory().unwrap();

        // Two tables cached, then the refresh scoped to "user" drops one of
        // user's columns; "other" must stay untouched.
        let ctx = MetaContext::new(CacheTable::Columns);
        store
            .apply(
                &ctx,
                vec![
                    columns_row("user", "name", 1, "TEXT"),
                    columns_row("user", "num", 2, "INTEGER"),
                    columns_row("other", "id", 1, "INTEGER"),
                ],
            )
            .await
            .unwrap();

        let scoped = MetaContext::with_filter(CacheTable::Columns, "table_name", "user");
        store
            .apply(&scoped, vec![columns_row("user", "name", 1, "TEXT")])
            .await
            .unwrap();

        let rs = store.snapshot(CacheTable::Columns).await.unwrap();
        let names: Vec<String> = rs
            .iter()
            .map(|r| {
                format!(
                    "{}.{}",
                    r.get("table_name").unwrap().as_string(),
                    r.get("column_name").unwrap().as_string()
                )
            })
            .collect();
        assert_eq!(names, vec!["other.id", "user.name"]);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MetaStore::in_memory().unwrap();
        let ctx = MetaContext::new(CacheTable::Tables);
        let rows = vec![vec![
            Value::from("main"),
            Value::from("user"),
            Value::from("BASE TABLE"),
        ]];

        store.apply(&ctx, rows.clone()).await.unwrap();
        let first = store.snapshot(CacheTable::Tables).await.unwrap().dump();
        store.apply(&ctx, rows).await.unwrap();
        let second = store.snapshot(CacheTable::Tables).await.unwrap().dump();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_filter_column_must_exist() {
        let store = MetaStore::in_memory().unwrap();
        let ctx = MetaContext::with_filter(CacheTable::Tables, "no_such_column", 1);
        let err = store.apply(&ctx, vec![]).await.unwrap_err();
        assert!(matches!(err, DbError::Internal(_)));
    }
}
