//! Row change events.
//!
//! Two layers of event representation:
//!
//! - [`SourceEvent`] / [`RowsChange`] is what a binlog session delivers:
//!   one event may carry several rows, values are positional and
//!   column-nameless, updates arrive as before/after pairs.
//! - [`RowEvent`] is what the mutation pipeline consumes: one row per
//!   event, with the owning table's column names attached by the pump.

use crate::position::BinlogPosition;
use serde_json::Value;
use std::sync::Arc;

/// A single-row change handed from the pump to the mutation pipeline.
#[derive(Debug, Clone)]
pub struct RowEvent {
    /// Schema (database) name
    pub schema: String,
    /// Table name
    pub table: String,
    /// Column names, positionally matching the row values
    pub columns: Arc<Vec<String>>,
    /// The change itself
    pub op: RowOp,
    /// Coordinate at which the event was emitted
    pub position: BinlogPosition,
}

/// Row operation carried by a [`RowEvent`].
#[derive(Debug, Clone)]
pub enum RowOp {
    /// Row inserted (or read during the initial snapshot)
    Insert { row: Vec<Value> },
    /// Row updated; before and after images have equal arity
    Update {
        before: Vec<Value>,
        after: Vec<Value>,
    },
    /// Row deleted
    Delete { row: Vec<Value> },
}

impl RowEvent {
    /// Create an insert event.
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Arc<Vec<String>>,
        row: Vec<Value>,
        position: BinlogPosition,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns,
            op: RowOp::Insert { row },
            position,
        }
    }

    /// Create an update event.
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Arc<Vec<String>>,
        before: Vec<Value>,
        after: Vec<Value>,
        position: BinlogPosition,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns,
            op: RowOp::Update { before, after },
            position,
        }
    }

    /// Create a delete event.
    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Arc<Vec<String>>,
        row: Vec<Value>,
        position: BinlogPosition,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns,
            op: RowOp::Delete { row },
            position,
        }
    }
}

/// An event as it arrives from a binlog session.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// One or more row changes on a single table
    Rows(RowsChange),
    /// A DDL statement touched the table; cached column metadata is stale
    Ddl { schema: String, table: String },
}

/// A multi-row change event with positional values.
#[derive(Debug, Clone)]
pub struct RowsChange {
    pub schema: String,
    pub table: String,
    pub rows: ChangeRows,
    /// Coordinate of the binlog event that carried these rows
    pub position: BinlogPosition,
}

/// Rows of a [`RowsChange`], shaped by the operation.
#[derive(Debug, Clone)]
pub enum ChangeRows {
    Insert(Vec<Vec<Value>>),
    /// Before/after image pairs
    Update(Vec<(Vec<Value>, Vec<Value>)>),
    Delete(Vec<Vec<Value>>),
}

impl ChangeRows {
    /// Arity of the first row, if any.
    pub fn arity(&self) -> Option<usize> {
        match self {
            ChangeRows::Insert(rows) | ChangeRows::Delete(rows) => rows.first().map(Vec::len),
            ChangeRows::Update(pairs) => pairs.first().map(|(_, after)| after.len()),
        }
    }
}

/// A raw row produced by the external dump tool during the snapshot phase.
#[derive(Debug, Clone)]
pub struct DumpRow {
    pub schema: String,
    pub table: String,
    pub values: Vec<Value>,
}
