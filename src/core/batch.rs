//! Batches
//!
//! A [`Batch`] is an ordered script of commands executed sequentially against
//! one connection under a selectable transaction mode. Scripts load from a
//! file or string: statements separated by `;`, `--` and `#` line comments
//! and blank lines ignored, no nested structure.
//!
//! At most one batch may run against a connection at a time. Cancellation via
//! [`Batch::stop`] is cooperative and checked between commands; a command
//! already mid-execution completes first.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::core::command::Command;
use crate::core::connection::ConnectionInner;
use crate::core::error::{DbError, Result};
use crate::core::provider::TransactionMode;

/// Outcome of a completed (or stopped) batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Number of commands that executed
    pub executed: usize,
    /// Total affected rows across non-select commands
    pub rows_affected: u64,
}

/// Ordered collection of commands run sequentially under one transaction mode
pub struct Batch {
    conn: Weak<ConnectionInner>,
    commands: Vec<Command>,
    /// Batch-level override; inherits the connection's mode when unset
    mode: Option<TransactionMode>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

/// Clears the per-connection and per-batch running flags when a run ends,
/// on success and on every error path alike.
struct RunGuard<'a> {
    conn: &'a ConnectionInner,
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.conn.batch_running.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Batch {
    pub(crate) fn new(conn: Weak<ConnectionInner>) -> Self {
        Self {
            conn,
            commands: Vec::new(),
            mode: None,
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Err(DbError::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    /// Parse a script file into commands, one per statement
    ///
    /// With `clean` set, existing commands are dropped first. Returns the
    /// number of commands loaded. Fails with [`DbError::ParseError`] on
    /// malformed scripts and [`DbError::Io`] on unreadable files.
    pub async fn load_file(&mut self, path: impl AsRef<Path>, clean: bool) -> Result<usize> {
        self.ensure_idle()?;
        let script = tokio::fs::read_to_string(path).await?;
        self.load_str(&script, clean)
    }

    /// In-memory equivalent of [`Batch::load_file`]
    pub fn load_str(&mut self, script: &str, clean: bool) -> Result<usize> {
        self.ensure_idle()?;
        let statements = parse_script(script)?;
        if clean {
            self.commands.clear();
        }
        let loaded = statements.len();
        for statement in statements {
            self.commands
                .push(Command::bound(self.conn.clone(), statement));
        }
        Ok(loaded)
    }

    /// Append a command; it is rebound to this batch's connection
    pub fn add_command(&mut self, mut command: Command) -> Result<()> {
        self.ensure_idle()?;
        command.bind(self.conn.clone());
        self.commands.push(command);
        Ok(())
    }

    /// Drop all commands
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.commands.clear();
        Ok(())
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Override the transaction mode for this batch as a whole
    ///
    /// Capability support is checked when the batch starts.
    pub fn set_transaction_mode(&mut self, mode: TransactionMode) -> Result<()> {
        self.ensure_idle()?;
        self.mode = Some(mode);
        Ok(())
    }

    /// Request cooperative cancellation of an in-progress run
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Point-in-time read of the running state
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Execute all commands sequentially against the bound connection
    ///
    /// Under a rollback-capable transaction mode a mid-batch failure rolls
    /// the whole batch back; under mode `None` prior commands keep their
    /// effects. Either way the error is [`DbError::BatchFailed`] naming the
    /// zero-based index of the failing command. A stop request ends the run
    /// after the current command; work done so far is committed.
    pub async fn start(&self) -> Result<BatchSummary> {
        let inner = self.conn.upgrade().ok_or(DbError::ConnectionClosed)?;
        let mode = self.mode.unwrap_or_else(|| *inner.tx_mode.lock());
        if !inner.capabilities.supports_mode(mode) {
            return Err(DbError::UnsupportedMode {
                provider: inner.provider_name.clone(),
                mode,
            });
        }
        if inner
            .batch_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DbError::AlreadyRunning);
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let _guard = RunGuard {
            conn: inner.as_ref(),
            running: self.running.as_ref(),
        };

        let session_guard = inner.session.lock().await;
        let session = session_guard.as_deref().ok_or(DbError::ConnectionClosed)?;
        let default_timeout = *inner.default_timeout.lock();
        let param_style = inner.capabilities.param_style;
        let tx_active = mode.supports_rollback();

        tracing::debug!(
            provider = %inner.provider_name,
            commands = self.commands.len(),
            mode = %mode,
            "batch started"
        );

        if tx_active {
            session.begin(mode).await?;
        }

        let mut executed = 0usize;
        let mut rows_affected = 0u64;
        for (index, command) in self.commands.iter().enumerate() {
            if self.stop_requested.load(Ordering::SeqCst) {
                tracing::debug!(index, "batch stopped before command");
                break;
            }

            let timeout = command.timeout().unwrap_or(default_timeout);
            let step = async {
                let (text, params) = command.resolve(param_style)?;
                session
                    .execute(&text, &params, command.flags().is_select)
                    .await
            };
            let result = match tokio::time::timeout(timeout, step).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(timeout.as_millis() as u64)),
            };

            match result {
                Ok(outcome) => {
                    executed += 1;
                    rows_affected += outcome.count();
                }
                Err(err) => {
                    if tx_active {
                        let _ = session.rollback().await;
                    }
                    tracing::warn!(index, error = %err, "batch command failed");
                    return Err(DbError::BatchFailed {
                        index,
                        source: Box::new(err),
                    });
                }
            }
        }

        if tx_active {
            session.commit().await?;
        }
        tracing::debug!(executed, rows_affected, "batch finished");
        Ok(BatchSummary {
            executed,
            rows_affected,
        })
    }
}

/// Split a script into statements
///
/// Statements end at `;` outside string literals. `--` and `#` start line
/// comments; blank statements are dropped; trailing text without a
/// terminator counts as a final statement.
fn parse_script(script: &str) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut line = 1usize;
    let mut string_start = 0usize;
    let mut in_string = false;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
        }
        if in_string {
            current.push(c);
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    // escaped quote
                    current.push('\'');
                    chars.next();
                } else {
                    in_string = false;
                }
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                string_start = line;
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '#' => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ';' => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if in_string {
        return Err(DbError::parse(string_start, "unterminated string literal"));
    }
    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    Ok(statements)
}
