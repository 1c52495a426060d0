//! Integration tests for the access layer
//!
//! These tests exercise the full stack against the SQLite provider:
//! - registry resolution and connection lifecycle
//! - command execution, parameters and timeouts
//! - batch atomicity, failure reporting and cooperative stop
//! - meta store synchronization, staleness and idempotence

#![cfg(feature = "sqlite")]

use std::sync::Arc;
use std::time::Duration;

use dbaccess::prelude::*;

async fn memory_connection() -> Connection {
    ProviderRegistry::with_defaults()
        .open("SQLite", "DB_NAME=:memory:", &ConnectOptions::new())
        .await
        .expect("in-memory connection")
}

async fn count_rows(conn: &Connection, table: &str) -> i64 {
    let outcome = conn
        .create_command(format!("SELECT COUNT(*) AS n FROM {table}"))
        .execute()
        .await
        .expect("count query");
    outcome
        .rows()
        .expect("select yields rows")
        .row(0)
        .unwrap()
        .get("n")
        .unwrap()
        .as_long()
        .unwrap()
}

mod registry {
    use super::*;
    use async_trait::async_trait;

    #[tokio::test]
    async fn open_unknown_provider_fails() {
        let registry = ProviderRegistry::with_defaults();
        let err = registry
            .open("NoSuchDb", "whatever", &ConnectOptions::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbError::UnknownProvider(name) if name == "NoSuchDb"));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = ProviderRegistry::with_defaults();
        let err = registry
            .register("SQLite", Arc::new(SqliteProvider::new()))
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateProvider(_)));
    }

    /// A provider stub without transaction support, exercising the
    /// capability check at the provider seam.
    struct FixedModeProvider;

    struct FixedModeSession;

    #[async_trait]
    impl Session for FixedModeSession {
        async fn execute(
            &self,
            _text: &str,
            _params: &[Value],
            _want_rows: bool,
        ) -> Result<ExecOutcome> {
            Ok(ExecOutcome::Count(0))
        }

        async fn introspect(&self, _scope: &MetaContext) -> Result<Vec<Vec<Value>>> {
            Ok(Vec::new())
        }

        async fn begin(&self, _mode: TransactionMode) -> Result<()> {
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Provider for FixedModeProvider {
        fn name(&self) -> &'static str {
            "FixedMode"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                transaction_modes: vec![TransactionMode::None],
                supports_parameters: true,
                param_style: ParamStyle::Qmark,
            }
        }

        async fn connect(
            &self,
            _connection_string: &str,
            _options: &ConnectOptions,
        ) -> Result<Box<dyn Session>> {
            Ok(Box::new(FixedModeSession))
        }
    }

    #[tokio::test]
    async fn unsupported_transaction_mode_is_rejected() {
        let registry = ProviderRegistry::new();
        registry
            .register("FixedMode", Arc::new(FixedModeProvider))
            .unwrap();
        let conn = registry
            .open("FixedMode", "", &ConnectOptions::new())
            .await
            .unwrap();

        let err = conn
            .set_transaction_mode(TransactionMode::Serializable)
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::UnsupportedMode {
                mode: TransactionMode::Serializable,
                ..
            }
        ));
        assert_eq!(conn.transaction_mode(), TransactionMode::None);
    }
}

mod connection {
    use super::*;

    #[tokio::test]
    async fn execute_after_close_fails_with_connection_closed() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (id INTEGER)")
            .execute()
            .await
            .unwrap();

        let command = conn.create_command("INSERT INTO t VALUES (1)");
        assert!(conn.is_open());
        conn.close().await.unwrap();
        assert!(!conn.is_open());
        // close is idempotent
        conn.close().await.unwrap();

        let err = command.execute().await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionClosed));
    }

    #[tokio::test]
    async fn command_outlives_dropped_connection() {
        let conn = memory_connection().await;
        let command = conn.create_command("SELECT 1");
        drop(conn);

        let err = command.execute().await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionClosed));
    }

    #[tokio::test]
    async fn insert_then_select_roundtrip() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE user (name TEXT PRIMARY KEY, num INTEGER)")
            .execute()
            .await
            .unwrap();

        let mut insert = conn.create_command("INSERT INTO user VALUES (:name, :num)");
        insert.create_parameter("name", ValueType::String, "A");
        insert.create_parameter("num", ValueType::Long, 1i64);
        let outcome = insert.execute().await.unwrap();
        assert_eq!(outcome.count(), 1);

        let outcome = conn
            .create_command("SELECT * FROM user")
            .execute()
            .await
            .unwrap();
        let rows = outcome.rows().unwrap();
        assert_eq!(rows.len(), 1);
        let row = rows.row(0).unwrap();
        assert_eq!(row.get("name").and_then(Value::as_str), Some("A"));
        assert_eq!(row.get("num").and_then(Value::as_long), Some(1));
    }

    #[tokio::test]
    async fn parameter_update_between_executions() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (v INTEGER)")
            .execute()
            .await
            .unwrap();

        let mut insert = conn.create_command("INSERT INTO t VALUES (:v)");
        insert.create_parameter("v", ValueType::Long, 1i64);
        insert.execute().await.unwrap();
        insert.set_parameter("v", 2i64).unwrap();
        insert.execute().await.unwrap();

        assert_eq!(count_rows(&conn, "t").await, 2);
    }

    #[tokio::test]
    async fn unregistered_parameter_fails_before_dispatch() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (v INTEGER)")
            .execute()
            .await
            .unwrap();

        let command = conn.create_command("INSERT INTO t VALUES (:v)");
        let err = command.execute().await.unwrap_err();
        assert!(matches!(err, DbError::ParameterMismatch { name } if name == "v"));
        assert_eq!(count_rows(&conn, "t").await, 0);
    }

    #[tokio::test]
    async fn provider_error_is_surfaced_verbatim() {
        let conn = memory_connection().await;
        let err = conn
            .create_command("SELECT * FROM missing_table")
            .execute()
            .await
            .unwrap_err();
        match err {
            DbError::ExecutionError { message, .. } => {
                assert!(message.contains("missing_table"), "message: {message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let conn = memory_connection().await;
        let mut command = conn.create_command(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000) \
             SELECT COUNT(*) FROM c",
        );
        command.set_timeout(Duration::from_millis(25));
        let err = command.execute().await.unwrap_err();
        assert!(matches!(err, DbError::Timeout { timeout_ms: 25 }));
    }

    #[tokio::test]
    async fn serializable_mode_wraps_single_commands() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (v INTEGER)")
            .execute()
            .await
            .unwrap();

        conn.set_transaction_mode(TransactionMode::Serializable)
            .unwrap();
        conn.create_command("INSERT INTO t VALUES (1)")
            .execute()
            .await
            .unwrap();
        conn.set_transaction_mode(TransactionMode::None).unwrap();

        assert_eq!(count_rows(&conn, "t").await, 1);
    }
}

mod batch {
    use super::*;

    #[tokio::test]
    async fn script_loads_and_runs() {
        let conn = memory_connection().await;
        let mut batch = conn.create_batch();
        let loaded = batch
            .load_str(
                "-- schema\n\
                 CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);\n\
                 \n\
                 # data\n\
                 INSERT INTO t (name) VALUES ('a');\n\
                 INSERT INTO t (name) VALUES ('b');\n",
                false,
            )
            .unwrap();
        assert_eq!(loaded, 3);

        let summary = batch.start().await.unwrap();
        assert_eq!(summary.executed, 3);
        assert_eq!(summary.rows_affected, 2);
        assert!(!batch.is_running());
        assert_eq!(count_rows(&conn, "t").await, 2);
    }

    #[tokio::test]
    async fn load_file_and_parse_errors() {
        let conn = memory_connection().await;
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good.sql");
        std::fs::write(&good, "CREATE TABLE t (id INTEGER);\nINSERT INTO t VALUES (1);").unwrap();
        let mut batch = conn.create_batch();
        assert_eq!(batch.load_file(&good, true).await.unwrap(), 2);

        let bad = dir.path().join("bad.sql");
        std::fs::write(&bad, "INSERT INTO t VALUES ('unterminated").unwrap();
        let err = batch.load_file(&bad, true).await.unwrap_err();
        assert!(matches!(err, DbError::ParseError { line: 1, .. }));

        let err = batch
            .load_file(dir.path().join("missing.sql"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Io(_)));
    }

    /// Mid-batch failure under a rollback-capable mode: no command's effect
    /// survives, and the error names the failing command.
    #[tokio::test]
    async fn failure_rolls_back_whole_batch_under_serializable() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute()
            .await
            .unwrap();

        let mut batch = conn.create_batch();
        batch.set_transaction_mode(TransactionMode::Serializable).unwrap();
        batch
            .load_str(
                "INSERT INTO t VALUES (1);\n\
                 INSERT INTO t VALUES (1);\n\
                 INSERT INTO t VALUES (2);",
                false,
            )
            .unwrap();

        let err = batch.start().await.unwrap_err();
        match err {
            DbError::BatchFailed { index, source } => {
                assert_eq!(index, 1);
                assert!(matches!(*source, DbError::ExecutionError { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(count_rows(&conn, "t").await, 0);
    }

    /// The same failure under mode `None`: the first command's effect
    /// remains, the rest never ran.
    #[tokio::test]
    async fn failure_keeps_prior_effects_without_transaction() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute()
            .await
            .unwrap();

        let mut batch = conn.create_batch();
        batch
            .load_str(
                "INSERT INTO t VALUES (1);\n\
                 INSERT INTO t VALUES (1);\n\
                 INSERT INTO t VALUES (2);",
                false,
            )
            .unwrap();

        let err = batch.start().await.unwrap_err();
        assert!(matches!(err, DbError::BatchFailed { index: 1, .. }));

        let outcome = conn
            .create_command("SELECT id FROM t")
            .execute()
            .await
            .unwrap();
        let rows = outcome.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.row(0).unwrap().at(0).and_then(Value::as_long), Some(1));
    }

    #[tokio::test]
    async fn stop_is_cooperative_and_only_one_batch_runs() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (v INTEGER)")
            .execute()
            .await
            .unwrap();

        let mut batch = conn.create_batch();
        batch
            .load_str(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 20000000) \
                 SELECT COUNT(*) FROM c;\n\
                 INSERT INTO t VALUES (1);",
                false,
            )
            .unwrap();
        let batch = Arc::new(batch);

        let runner = Arc::clone(&batch);
        let handle = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(batch.is_running());

        // A second batch on the same connection is refused while one runs.
        let mut other = conn.create_batch();
        other.load_str("SELECT 1;", false).unwrap();
        let err = other.start().await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyRunning));

        batch.stop();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.executed, 1);
        assert!(!batch.is_running());
        assert_eq!(count_rows(&conn, "t").await, 0);
    }
}

mod meta_store {
    use super::*;

    /// The concrete end-to-end scenario: register, open, create, insert,
    /// sync scoped to one table, extract column rows from the cache.
    #[tokio::test]
    async fn scoped_sync_then_extract_columns() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::with_defaults();
        let conn = registry
            .open(
                "SQLite",
                &format!("DB_DIR={};DB_NAME=test", dir.path().display()),
                &ConnectOptions::new(),
            )
            .await
            .unwrap();

        conn.create_command("CREATE TABLE user (name TEXT PRIMARY KEY, num INTEGER)")
            .execute()
            .await
            .unwrap();
        conn.create_command("INSERT INTO user VALUES ('A', 1)")
            .execute()
            .await
            .unwrap();

        let scope = MetaContext::with_filter(CacheTable::Columns, "table_name", "user");
        conn.update_meta_store(Some(&scope)).await.unwrap();

        let rows = conn
            .meta_store()
            .extract("SELECT * FROM _columns WHERE table_name = 'user'", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let first = rows.row(0).unwrap();
        assert_eq!(first.get("column_name").and_then(Value::as_str), Some("name"));
        assert_eq!(first.get("data_type").and_then(Value::as_str), Some("TEXT"));
        let second = rows.row(1).unwrap();
        assert_eq!(second.get("column_name").and_then(Value::as_str), Some("num"));
        assert_eq!(
            second.get("data_type").and_then(Value::as_str),
            Some("INTEGER")
        );

        conn.close().await.unwrap();
    }

    /// The cache never reflects live state newer than the latest covering
    /// sync.
    #[tokio::test]
    async fn extract_is_stale_until_explicit_sync() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE first_table (id INTEGER)")
            .execute()
            .await
            .unwrap();
        conn.update_meta_store(None).await.unwrap();

        conn.create_command("CREATE TABLE second_table (id INTEGER)")
            .execute()
            .await
            .unwrap();

        let rows = conn
            .meta_store()
            .extract("SELECT table_name FROM _tables", &[])
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.at(0).unwrap().as_string()).collect();
        assert_eq!(names, vec!["first_table"]);

        conn.update_meta_store(None).await.unwrap();
        let rows = conn
            .meta_store()
            .extract("SELECT table_name FROM _tables ORDER BY table_name", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    /// Two syncs with no intervening schema change leave the cache
    /// row-for-row identical.
    #[tokio::test]
    async fn sync_is_idempotent() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE t (a TEXT, b INTEGER)")
            .execute()
            .await
            .unwrap();

        conn.update_meta_store(None).await.unwrap();
        let mut first = Vec::new();
        for table in CacheTable::ALL {
            first.push(conn.meta_store().snapshot(table).await.unwrap().dump());
        }

        conn.update_meta_store(None).await.unwrap();
        let mut second = Vec::new();
        for table in CacheTable::ALL {
            second.push(conn.meta_store().snapshot(table).await.unwrap().dump());
        }

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dropped_table_disappears_after_sync() {
        let conn = memory_connection().await;
        conn.create_command("CREATE TABLE doomed (id INTEGER)")
            .execute()
            .await
            .unwrap();
        conn.update_meta_store(None).await.unwrap();

        conn.create_command("DROP TABLE doomed")
            .execute()
            .await
            .unwrap();
        conn.update_meta_store(None).await.unwrap();

        let rows = conn
            .meta_store()
            .extract("SELECT * FROM _tables WHERE table_name = 'doomed'", &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
        let rows = conn
            .meta_store()
            .extract("SELECT * FROM _columns WHERE table_name = 'doomed'", &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn extract_rejects_unknown_cache_table() {
        let conn = memory_connection().await;
        let err = conn
            .meta_store()
            .extract("SELECT * FROM _views", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownCacheTable(name) if name == "_views"));

        // Live tables are not reachable through the meta store either.
        conn.create_command("CREATE TABLE real_table (id INTEGER)")
            .execute()
            .await
            .unwrap();
        let err = conn
            .meta_store()
            .extract("SELECT * FROM real_table", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownCacheTable(_)));
    }

    #[tokio::test]
    async fn sync_after_close_fails() {
        let conn = memory_connection().await;
        conn.close().await.unwrap();
        let err = conn.update_meta_store(None).await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionClosed));
    }
}
