//! Tabular results
//!
//! A [`Recordset`] is the immutable result of a select-type command or a meta
//! store extraction: an ordered schema of `(name, type)` pairs shared by all
//! rows, and the rows themselves. Multiple readers may hold references
//! concurrently; there is no mutation after construction.

use serde::Serialize;
use std::sync::Arc;

use crate::core::value::{Value, ValueType};

/// One field description within a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDesc {
    pub name: String,
    pub ty: ValueType,
}

impl FieldDesc {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered field descriptions shared by every row of a recordset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct Schema {
    fields: Vec<FieldDesc>,
}

impl Schema {
    pub fn new(fields: Vec<FieldDesc>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of a field by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Immutable tabular result of a command or meta store query
#[derive(Debug, Clone, Serialize)]
pub struct Recordset {
    schema: Arc<Schema>,
    rows: Vec<Vec<Value>>,
}

impl Recordset {
    /// Build a recordset from a schema and rows
    ///
    /// Every row must have exactly one value per schema field.
    pub fn from_rows(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == schema.len()));
        Self {
            schema: Arc::new(schema),
            rows,
        }
    }

    /// An empty recordset with no fields and no rows
    pub fn empty() -> Self {
        Self::from_rows(Schema::default(), Vec::new())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row at `idx`, if present
    pub fn row(&self, idx: usize) -> Option<Row<'_>> {
        self.rows.get(idx).map(|values| Row {
            schema: &self.schema,
            values,
        })
    }

    /// Iterate over all rows in order
    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            schema: &self.schema,
            values,
        })
    }

    /// Deterministic human-readable rendering for diagnostics
    ///
    /// Header row of field names followed by one line per row, columns
    /// padded to the widest cell. Identical recordsets produce identical
    /// dumps.
    pub fn dump(&self) -> String {
        let mut widths: Vec<usize> = self
            .schema
            .fields()
            .iter()
            .map(|f| f.name.len())
            .collect();
        let rendered: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(Value::as_string).collect())
            .collect();
        for row in &rendered {
            for (i, cell) in row.iter().enumerate() {
                if cell.len() > widths[i] {
                    widths[i] = cell.len();
                }
            }
        }

        let mut out = String::new();
        for (i, field) in self.schema.fields().iter().enumerate() {
            if i > 0 {
                out.push_str(" | ");
            }
            out.push_str(&format!("{:<width$}", field.name, width = widths[i]));
        }
        out.push('\n');
        for (i, width) in widths.iter().enumerate() {
            if i > 0 {
                out.push_str("-+-");
            }
            out.push_str(&"-".repeat(*width));
        }
        out.push('\n');
        for row in &rendered {
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    out.push_str(" | ");
                }
                out.push_str(&format!("{:<width$}", cell, width = widths[i]));
            }
            out.push('\n');
        }
        out
    }
}

/// A borrowed view of one recordset row
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    schema: &'a Schema,
    values: &'a [Value],
}

impl<'a> Row<'a> {
    /// Field value by position
    pub fn at(&self, idx: usize) -> Option<&'a Value> {
        self.values.get(idx)
    }

    /// Field value by name
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.schema.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }
}
