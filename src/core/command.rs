//! Executable commands
//!
//! A [`Command`] is one unit of work: statement text, named parameters and
//! type flags, bound to a connection. The binding is weak: a command never
//! keeps its connection alive, and executing against a closed or dropped
//! connection fails with [`DbError::ConnectionClosed`].

use std::sync::Weak;
use std::time::Duration;

use crate::core::connection::{Connection, ConnectionInner};
use crate::core::error::{DbError, Result};
use crate::core::provider::{ExecOutcome, ParamStyle};
use crate::core::value::{Value, ValueType};

/// A named command parameter
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    ty: ValueType,
    value: Value,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.ty
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Command type flags derived from the statement's leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags {
    /// Produces a recordset when executed
    pub is_select: bool,
    /// Schema-changing statement (CREATE / ALTER / DROP)
    pub is_ddl: bool,
    /// Advisory: sensible inside a batch (select results are discarded there)
    pub is_batchable: bool,
}

impl CommandFlags {
    /// Classify a statement by its first keyword
    pub fn classify(text: &str) -> Self {
        let keyword = text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let is_select = matches!(keyword.as_str(), "SELECT" | "PRAGMA" | "EXPLAIN" | "WITH");
        let is_ddl = matches!(keyword.as_str(), "CREATE" | "ALTER" | "DROP");
        CommandFlags {
            is_select,
            is_ddl,
            is_batchable: !is_select,
        }
    }
}

/// An executable unit of work bound to a connection
#[derive(Debug, Clone)]
pub struct Command {
    conn: Option<Weak<ConnectionInner>>,
    text: String,
    flags: CommandFlags,
    params: Vec<Parameter>,
    timeout: Option<Duration>,
}

impl Command {
    /// Create an unbound command; executing it fails with
    /// [`DbError::NoConnection`] until it is bound
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let flags = CommandFlags::classify(&text);
        Self {
            conn: None,
            text,
            flags,
            params: Vec::new(),
            timeout: None,
        }
    }

    pub(crate) fn bound(conn: Weak<ConnectionInner>, text: impl Into<String>) -> Self {
        let mut cmd = Self::new(text);
        cmd.conn = Some(conn);
        cmd
    }

    pub(crate) fn bind(&mut self, conn: Weak<ConnectionInner>) {
        self.conn = Some(conn);
    }

    /// Replace the statement text; validity is checked only at execute time
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.flags = CommandFlags::classify(&self.text);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// Override the derived type flags
    pub fn set_flags(&mut self, flags: CommandFlags) {
        self.flags = flags;
    }

    /// Register a named parameter, overwriting any previous one of the same
    /// name
    pub fn create_parameter(
        &mut self,
        name: impl Into<String>,
        ty: ValueType,
        value: impl Into<Value>,
    ) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.params.iter_mut().find(|p| p.name == name) {
            existing.ty = ty;
            existing.value = value;
        } else {
            self.params.push(Parameter { name, ty, value });
        }
    }

    /// Update the value of an already registered parameter
    pub fn set_parameter(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => {
                param.value = value.into();
                Ok(())
            }
            None => Err(DbError::parameter_mismatch(name)),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Per-command timeout override; the connection default applies when unset
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Execute against the bound connection
    pub async fn execute(&self) -> Result<ExecOutcome> {
        let weak = self.conn.as_ref().ok_or(DbError::NoConnection)?;
        let inner = weak.upgrade().ok_or(DbError::ConnectionClosed)?;
        Connection::from_inner(inner).execute(self).await
    }

    /// Rewrite `:name` placeholders to the provider's positional convention
    /// and collect the referenced values in placeholder order
    ///
    /// Fails with [`DbError::ParameterMismatch`] when the text references a
    /// name that was never registered. Quoted literals and `::` casts are
    /// left untouched.
    pub(crate) fn resolve(&self, style: ParamStyle) -> Result<(String, Vec<Value>)> {
        let mut out = String::with_capacity(self.text.len());
        let mut values = Vec::new();
        let mut chars = self.text.chars().peekable();
        let mut in_single = false;
        let mut in_double = false;

        while let Some(c) = chars.next() {
            match c {
                '\'' if !in_double => {
                    in_single = !in_single;
                    out.push(c);
                }
                '"' if !in_single => {
                    in_double = !in_double;
                    out.push(c);
                }
                ':' if !in_single && !in_double => {
                    if chars.peek() == Some(&':') {
                        // `::` cast, not a placeholder
                        chars.next();
                        out.push_str("::");
                        continue;
                    }
                    let mut name = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_alphanumeric() || next == '_' {
                            name.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if name.is_empty() {
                        out.push(':');
                        continue;
                    }
                    let param = self
                        .params
                        .iter()
                        .find(|p| p.name == name)
                        .ok_or_else(|| DbError::parameter_mismatch(&name))?;
                    values.push(param.value.clone());
                    match style {
                        ParamStyle::Qmark => out.push('?'),
                        ParamStyle::Dollar => out.push_str(&format!("${}", values.len())),
                    }
                }
                _ => out.push(c),
            }
        }

        Ok((out, values))
    }
}
