//! Provider backend implementations
//!
//! Concrete implementations of the [`Provider`](crate::core::Provider) and
//! [`Session`](crate::core::Session) traits for the supported database
//! technologies.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteProvider, SqliteSession};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresProvider, PostgresSession};

#[cfg(feature = "mysql")]
pub use mysql::{MysqlProvider, MysqlSession};
