//! # dbaccess
//!
//! A pluggable database access layer: a registry of provider backends, live
//! connections with pooled command execution, batch scripts under selectable
//! transaction modes, and a locally cached, explicitly synchronized mirror of
//! database catalog metadata (the meta store).
//!
//! ## Features
//!
//! - **Provider registry**: resolve backends by name; SQLite is built in,
//!   PostgreSQL and MySQL behind feature flags
//! - **Commands**: raw or parameterized statements with per-command timeouts
//! - **Batches**: delimiter-separated scripts executed sequentially, atomic
//!   under rollback-capable transaction modes, cooperatively cancellable
//! - **Meta store**: an embedded SQLite mirror of catalog information,
//!   refreshed only on explicit request and queryable without touching the
//!   live database
//! - **Recordsets**: immutable typed results with deterministic diagnostic
//!   dumps
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dbaccess::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = ProviderRegistry::with_defaults();
//!     let conn = registry
//!         .open("SQLite", "DB_NAME=:memory:", &ConnectOptions::new())
//!         .await?;
//!
//!     conn.create_command("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
//!         .execute()
//!         .await?;
//!
//!     let mut insert = conn.create_command("INSERT INTO users (name) VALUES (:name)");
//!     insert.create_parameter("name", ValueType::String, "Alice");
//!     insert.execute().await?;
//!
//!     let rows = conn
//!         .create_command("SELECT * FROM users")
//!         .execute()
//!         .await?
//!         .into_rows()
//!         .expect("select produces rows");
//!     println!("{}", rows.dump());
//!
//!     // Catalog introspection goes through the meta store: refresh
//!     // explicitly, then query the local cache as often as needed.
//!     conn.update_meta_store(None).await?;
//!     let columns = conn
//!         .meta_store()
//!         .extract("SELECT * FROM _columns WHERE table_name = 'users'", &[])
//!         .await?;
//!     assert_eq!(columns.len(), 2);
//!
//!     conn.close().await
//! }
//! ```
//!
//! ## Concurrency model
//!
//! All operations are explicit and block the caller until complete; nothing
//! refreshes or retries in the background. A connection serves one thread of
//! control at a time, at most one batch runs per connection, and a meta store
//! refresh is atomic from any reader's point of view.

/// Core access-layer types and traits
pub mod core;

/// Provider backend implementations
pub mod backends;

/// Prelude for convenient imports
///
/// ```rust
/// use dbaccess::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let registry = ProviderRegistry::with_defaults();
///     assert!(registry.find("no-such-provider").is_err());
///     Ok(())
/// }
/// ```
pub mod prelude {
    pub use crate::core::{
        Batch, BatchSummary, CacheTable, Capabilities, Command, CommandFlags, ConnectOptions,
        Connection, DbError, ExecOutcome, MetaContext, MetaStore, ParamStyle, Provider,
        ProviderRegistry, Recordset, Result, Row, Session, TransactionMode, Value, ValueType,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::backends::SqliteProvider;

    #[cfg(feature = "postgres")]
    pub use crate::backends::PostgresProvider;

    #[cfg(feature = "mysql")]
    pub use crate::backends::MysqlProvider;
}

// Re-export at root level for convenience
pub use crate::core::{
    Batch, BatchSummary, CacheTable, Capabilities, Command, CommandFlags, ConnectOptions,
    Connection, DbError, ExecOutcome, MetaContext, MetaStore, ParamStyle, Provider,
    ProviderRegistry, Recordset, Result, Row, Schema, Session, TransactionMode, Value, ValueType,
};

#[cfg(feature = "sqlite")]
pub use backends::SqliteProvider;
