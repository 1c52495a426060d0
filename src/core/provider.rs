//! Provider boundary
//!
//! A [`Provider`] describes one database technology and opens [`Session`]s
//! against it. The core depends only on this contract: `connect`, `execute`,
//! `introspect` and the capability set. No wire protocol is assumed here;
//! concrete backends live in `crate::backends`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::connection::ConnectOptions;
use crate::core::error::Result;
use crate::core::meta::MetaContext;
use crate::core::recordset::Recordset;
use crate::core::value::Value;

/// Transaction modes selectable on a connection or batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionMode {
    /// Autocommit; no transactional envelope, no rollback on failure
    #[default]
    None,
    /// Read-committed isolation
    ReadCommitted,
    /// Serializable isolation
    Serializable,
}

impl TransactionMode {
    pub fn to_str(self) -> &'static str {
        match self {
            TransactionMode::None => "none",
            TransactionMode::ReadCommitted => "read-committed",
            TransactionMode::Serializable => "serializable",
        }
    }

    /// Whether a mid-batch failure can undo prior statements in this mode
    pub fn supports_rollback(self) -> bool {
        !matches!(self, TransactionMode::None)
    }
}

impl std::fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Placeholder convention a provider expects after named-parameter rewriting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `?` positional placeholders (SQLite, MySQL)
    Qmark,
    /// `$1`, `$2`, ... placeholders (PostgreSQL)
    Dollar,
}

/// Capability set advertised by a provider
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Transaction modes the provider can honor
    pub transaction_modes: Vec<TransactionMode>,
    /// Whether parameterized commands are supported
    pub supports_parameters: bool,
    /// Placeholder convention for parameter substitution
    pub param_style: ParamStyle,
}

impl Capabilities {
    pub fn supports_mode(&self, mode: TransactionMode) -> bool {
        self.transaction_modes.contains(&mode)
    }
}

/// Result of dispatching one command to a session
#[derive(Debug)]
pub enum ExecOutcome {
    /// Select-type command: the produced recordset
    Rows(Recordset),
    /// Non-select command: affected row count
    Count(u64),
}

impl ExecOutcome {
    /// The recordset, for select-type outcomes
    pub fn rows(&self) -> Option<&Recordset> {
        match self {
            ExecOutcome::Rows(rs) => Some(rs),
            ExecOutcome::Count(_) => None,
        }
    }

    /// Consume the outcome, keeping the recordset if there is one
    pub fn into_rows(self) -> Option<Recordset> {
        match self {
            ExecOutcome::Rows(rs) => Some(rs),
            ExecOutcome::Count(_) => None,
        }
    }

    /// Affected row count; zero for select-type outcomes
    pub fn count(&self) -> u64 {
        match self {
            ExecOutcome::Rows(_) => 0,
            ExecOutcome::Count(n) => *n,
        }
    }
}

/// Descriptor for one pluggable backend
///
/// Immutable once registered; registration happens at process start and the
/// registry table is read-mostly afterwards.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Canonical provider name (registry key by convention)
    fn name(&self) -> &'static str;

    /// Capability flags for this backend
    fn capabilities(&self) -> Capabilities;

    /// Establish a live session
    async fn connect(
        &self,
        connection_string: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Session>>;
}

/// One live session against a database
///
/// Sessions are driven exclusively by [`Connection`](crate::core::Connection):
/// parameter resolution, timeouts and the transaction envelope are applied
/// there, so implementations only translate to the native driver.
#[async_trait]
pub trait Session: Send + Sync {
    /// Dispatch one statement
    ///
    /// `params` are positional, already rewritten to this provider's
    /// [`ParamStyle`]. `want_rows` tells the session whether the caller
    /// classified the statement as select-type.
    async fn execute(&self, text: &str, params: &[Value], want_rows: bool) -> Result<ExecOutcome>;

    /// Query the provider's introspection surface for the given scope
    ///
    /// Rows are ordered sequences of values aligned to
    /// [`CacheTable::columns`](crate::core::meta::CacheTable::columns) of the
    /// scope's target table.
    async fn introspect(&self, scope: &MetaContext) -> Result<Vec<Vec<Value>>>;

    /// Begin a transaction at the given isolation mode
    async fn begin(&self, mode: TransactionMode) -> Result<()>;

    /// Commit the active transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the active transaction
    async fn rollback(&self) -> Result<()>;

    /// Release the underlying session; further calls fail
    async fn close(&self) -> Result<()>;
}
