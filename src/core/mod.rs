//! Core access-layer types and traits
//!
//! This module provides the fundamental building blocks of the access layer:
//! error types, the provider boundary, connections, commands, batches, the
//! meta store and the recordset model.

pub mod batch;
pub mod command;
pub mod connection;
pub mod error;
pub mod meta;
pub mod provider;
pub mod recordset;
pub mod registry;
pub mod value;

// Re-export commonly used types
pub use batch::{Batch, BatchSummary};
pub use command::{Command, CommandFlags, Parameter};
pub use connection::{ConnectOptions, Connection, DEFAULT_OPERATION_TIMEOUT};
pub use error::{DbError, Result};
pub use meta::{CacheTable, MetaContext, MetaStore};
pub use provider::{
    Capabilities, ExecOutcome, ParamStyle, Provider, Session, TransactionMode,
};
pub use recordset::{FieldDesc, Recordset, Row, Schema};
pub use registry::ProviderRegistry;
pub use value::{Value, ValueType};
