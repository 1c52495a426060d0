//! Connections
//!
//! A [`Connection`] owns one live session to a database reached through a
//! provider. It tracks open/closed state, the current transaction mode and
//! the default command timeout, and is the single dispatch point for command
//! execution and meta store synchronization.
//!
//! A connection may be used from one thread of control at a time; concurrent
//! use requires external synchronization by the caller. Internally only as
//! much locking is done as safety requires.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::core::batch::Batch;
use crate::core::command::Command;
use crate::core::error::{DbError, Result};
use crate::core::meta::{CacheTable, MetaContext, MetaStore};
use crate::core::provider::{Capabilities, ExecOutcome, Provider, Session, TransactionMode};

/// Default timeout for database operations (30 seconds)
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Options passed alongside the connection string when opening a session
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    username: Option<String>,
    password: Option<String>,
    extra: HashMap<String, String>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the username
    pub fn username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add a provider-specific option
    pub fn option<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn get_username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn get_password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn get_option(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) provider_name: String,
    pub(crate) capabilities: Capabilities,
    /// `None` once the connection is closed
    pub(crate) session: tokio::sync::Mutex<Option<Box<dyn Session>>>,
    pub(crate) tx_mode: parking_lot::Mutex<TransactionMode>,
    pub(crate) default_timeout: parking_lot::Mutex<Duration>,
    /// At most one batch may run against a connection at a time
    pub(crate) batch_running: AtomicBool,
    pub(crate) meta: MetaStore,
}

/// A live session to one database via one provider
///
/// Cloning is cheap and yields a handle to the same underlying session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Establish a session through `provider`
    ///
    /// Normally reached via
    /// [`ProviderRegistry::open`](crate::core::ProviderRegistry::open).
    pub(crate) async fn open(
        provider: Arc<dyn Provider>,
        provider_name: &str,
        connection_string: &str,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let capabilities = provider.capabilities();
        let session = provider.connect(connection_string, options).await?;
        let meta = MetaStore::in_memory()?;
        tracing::debug!(provider = provider_name, "connection opened");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                provider_name: provider_name.to_string(),
                capabilities,
                session: tokio::sync::Mutex::new(Some(session)),
                tx_mode: parking_lot::Mutex::new(TransactionMode::None),
                default_timeout: parking_lot::Mutex::new(DEFAULT_OPERATION_TIMEOUT),
                batch_running: AtomicBool::new(false),
                meta,
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Name the connection's provider was registered under
    pub fn provider_name(&self) -> &str {
        &self.inner.provider_name
    }

    /// Capability flags of the underlying provider
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Whether the session is still open
    ///
    /// Best-effort point-in-time read; a busy session counts as open.
    pub fn is_open(&self) -> bool {
        self.inner
            .session
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }

    /// Release the underlying session
    ///
    /// Idempotent. Commands and batches bound to this connection fail with
    /// [`DbError::ConnectionClosed`] afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.inner.session.lock().await;
        if let Some(session) = guard.take() {
            session.close().await?;
            tracing::debug!(provider = %self.inner.provider_name, "connection closed");
        }
        Ok(())
    }

    /// Current transaction mode
    pub fn transaction_mode(&self) -> TransactionMode {
        *self.inner.tx_mode.lock()
    }

    /// Change the transaction mode; takes effect on the next execute
    ///
    /// Fails with [`DbError::UnsupportedMode`] if the provider's capability
    /// set lacks the mode.
    pub fn set_transaction_mode(&self, mode: TransactionMode) -> Result<()> {
        if !self.inner.capabilities.supports_mode(mode) {
            return Err(DbError::UnsupportedMode {
                provider: self.inner.provider_name.clone(),
                mode,
            });
        }
        *self.inner.tx_mode.lock() = mode;
        Ok(())
    }

    /// Default timeout applied to commands without an override
    pub fn default_timeout(&self) -> Duration {
        *self.inner.default_timeout.lock()
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.inner.default_timeout.lock() = timeout;
    }

    /// Create a command bound to this connection
    pub fn create_command(&self, text: impl Into<String>) -> Command {
        Command::bound(self.downgrade(), text)
    }

    /// Create an empty batch bound to this connection
    pub fn create_batch(&self) -> Batch {
        Batch::new(self.downgrade())
    }

    /// Execute a command against this connection
    ///
    /// Named parameters are resolved to the provider's placeholder
    /// convention; select-type commands yield a recordset, others an
    /// affected-row count. In a transaction mode other than `None` the
    /// command runs inside its own begin/commit envelope at that isolation
    /// level. Exceeding the command's timeout fails with [`DbError::Timeout`]
    /// and abandons the in-flight operation (best-effort at the provider
    /// boundary).
    pub async fn execute(&self, command: &Command) -> Result<ExecOutcome> {
        let (text, params) = command.resolve(self.inner.capabilities.param_style)?;
        if !params.is_empty() && !self.inner.capabilities.supports_parameters {
            return Err(DbError::execution(
                "-1",
                "provider does not support parameterized commands",
            ));
        }
        let timeout = command.timeout().unwrap_or_else(|| self.default_timeout());
        let mode = self.transaction_mode();
        let want_rows = command.flags().is_select;

        let guard = self.inner.session.lock().await;
        let session = guard.as_deref().ok_or(DbError::ConnectionClosed)?;

        tracing::debug!(
            provider = %self.inner.provider_name,
            mode = %mode,
            params = params.len(),
            "executing command"
        );

        let dispatch = async {
            if mode == TransactionMode::None {
                session.execute(&text, &params, want_rows).await
            } else {
                session.begin(mode).await?;
                match session.execute(&text, &params, want_rows).await {
                    Ok(outcome) => {
                        session.commit().await?;
                        Ok(outcome)
                    }
                    Err(err) => {
                        let _ = session.rollback().await;
                        Err(err)
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, dispatch).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    provider = %self.inner.provider_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out"
                );
                Err(DbError::timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// The connection-owned meta store
    ///
    /// Reads from it never touch the live database; freshness comes only
    /// from [`Connection::update_meta_store`] calls.
    pub fn meta_store(&self) -> &MetaStore {
        &self.inner.meta
    }

    /// Synchronize the meta store with the live catalog
    ///
    /// With a context, only the context's scope is refreshed; without one the
    /// full catalog vocabulary is. Matching cache rows are replaced, vanished
    /// ones removed and new ones inserted, atomically per cache table.
    pub async fn update_meta_store(&self, context: Option<&MetaContext>) -> Result<()> {
        let timeout = self.default_timeout();
        let guard = self.inner.session.lock().await;
        let session = guard.as_deref().ok_or(DbError::ConnectionClosed)?;

        match context {
            Some(ctx) => self.refresh_one(session, ctx, timeout).await,
            None => {
                for table in CacheTable::ALL {
                    let ctx = MetaContext::new(table);
                    self.refresh_one(session, &ctx, timeout).await?;
                }
                Ok(())
            }
        }
    }

    async fn refresh_one(
        &self,
        session: &dyn Session,
        ctx: &MetaContext,
        timeout: Duration,
    ) -> Result<()> {
        let rows = match tokio::time::timeout(timeout, session.introspect(ctx)).await {
            Ok(rows) => rows?,
            Err(_) => return Err(DbError::timeout(timeout.as_millis() as u64)),
        };
        self.inner.meta.apply(ctx, rows).await
    }
}
