//! Declarative per-table replication rules.
//!
//! A [`Rule`] maps rows of one source table (or a wildcard of tables)
//! onto documents of one target index: which columns rename to which
//! fields, which column (or composite of columns) becomes the document
//! id, and whether updates replace the whole document or patch only the
//! changed fields.
//!
//! Rules reference columns by name. Row events carry positional values;
//! the pump attaches the column names it reads from the upstream schema
//! query at session setup, so rule files never need to mirror column
//! order.

use crate::action::BulkAction;
use crate::error::{EstuaryError, Result};
use crate::event::{RowEvent, RowOp};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Wildcard marker for rule schema/table fields.
pub const WILDCARD: &str = "*";

fn default_id_separator() -> String {
    ":".to_string()
}

/// A static mapping from one source table to one target index.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// Source schema, `*` matches any
    pub schema: String,
    /// Source table, `*` matches any
    pub table: String,
    /// Target index name
    pub index: String,
    /// Source column name to target field name; unmapped columns pass
    /// through under their own names
    #[serde(default)]
    pub field_map: HashMap<String, String>,
    /// Column whose value is the document id
    #[serde(default)]
    pub id_column: Option<String>,
    /// Composite id columns, joined with `id_separator` in declared order
    #[serde(default)]
    pub id_columns: Vec<String>,
    #[serde(default = "default_id_separator")]
    pub id_separator: String,
    /// Optional ingest pipeline tag attached to every action
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Send the full after-image on updates instead of a changed-field patch
    #[serde(default)]
    pub full_replace: bool,
}

impl Rule {
    /// Check the rule is internally consistent. Called at load time.
    pub fn validate(&self) -> Result<()> {
        if self.index.is_empty() {
            return Err(EstuaryError::config(format!(
                "rule for {}.{} has an empty target index",
                self.schema, self.table
            )));
        }
        match (&self.id_column, self.id_columns.is_empty()) {
            (None, true) => Err(EstuaryError::config(format!(
                "rule for {}.{} names no id column",
                self.schema, self.table
            ))),
            (Some(_), false) => Err(EstuaryError::config(format!(
                "rule for {}.{} sets both id_column and id_columns",
                self.schema, self.table
            ))),
            _ => Ok(()),
        }
    }

    fn matches(&self, schema: &str, table: &str) -> bool {
        (self.schema == schema || self.schema == WILDCARD)
            && (self.table == table || self.table == WILDCARD)
    }

    fn is_exact_for(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }

    /// Columns the rule requires to be present in the event's schema.
    fn required_columns(&self) -> impl Iterator<Item = &str> {
        self.id_column
            .as_deref()
            .into_iter()
            .chain(self.id_columns.iter().map(String::as_str))
            .chain(self.field_map.keys().map(String::as_str))
    }

    fn target_field<'a>(&'a self, column: &'a str) -> &'a str {
        self.field_map.get(column).map(String::as_str).unwrap_or(column)
    }

    /// Derive the document id from a row.
    fn doc_id(&self, columns: &[String], row: &[Value]) -> Option<String> {
        if !self.id_columns.is_empty() {
            let parts: Option<Vec<String>> = self
                .id_columns
                .iter()
                .map(|c| column_index(columns, c).and_then(|i| row.get(i)).map(scalar_string))
                .collect();
            return parts.map(|p| p.join(&self.id_separator));
        }
        let id_column = self.id_column.as_deref()?;
        column_index(columns, id_column)
            .and_then(|i| row.get(i))
            .map(scalar_string)
    }

    /// Full document body: every event column, renames applied.
    fn full_body(&self, columns: &[String], row: &[Value]) -> Map<String, Value> {
        columns
            .iter()
            .zip(row.iter())
            .map(|(column, value)| (self.target_field(column).to_string(), value.clone()))
            .collect()
    }

    /// Patch body: only columns whose value changed between images.
    fn patch_body(
        &self,
        columns: &[String],
        before: &[Value],
        after: &[Value],
    ) -> Map<String, Value> {
        columns
            .iter()
            .enumerate()
            .filter(|(i, _)| before.get(*i) != after.get(*i))
            .filter_map(|(i, column)| {
                after
                    .get(i)
                    .map(|value| (self.target_field(column).to_string(), value.clone()))
            })
            .collect()
    }
}

/// Stringify a scalar value for use as (part of) a document id.
fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn column_index(columns: &[String], name: &str) -> Option<usize> {
    columns.iter().position(|c| c == name)
}

/// An ordered, read-only collection of rules with exact-over-wildcard
/// matching and de-duplicated schema-mismatch reporting.
pub struct RuleSet {
    rules: Vec<Rule>,
    reported: Mutex<HashSet<(String, String, String)>>,
}

impl RuleSet {
    /// Build a rule set, validating every rule.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self {
            rules,
            reported: Mutex::new(HashSet::new()),
        })
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check whether the set holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the rule for a table: an exact match beats a wildcard match,
    /// first declared wins among equals.
    pub fn matching(&self, schema: &str, table: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.is_exact_for(schema, table))
            .or_else(|| self.rules.iter().find(|r| r.matches(schema, table)))
    }

    /// Translate a row event into bulk actions.
    ///
    /// Returns an empty vector when no rule matches the table, or when
    /// the matching rule references a column the event does not carry
    /// (reported once per `(schema, table, column)` triple).
    pub fn convert(&self, event: &RowEvent) -> Vec<BulkAction> {
        let Some(rule) = self.matching(&event.schema, &event.table) else {
            return Vec::new();
        };

        if let Some(missing) = rule
            .required_columns()
            .find(|&c| column_index(&event.columns, c).is_none())
        {
            self.report_mismatch(&event.schema, &event.table, missing);
            return Vec::new();
        }

        let columns = event.columns.as_slice();
        match &event.op {
            RowOp::Insert { row } => {
                let Some(id) = rule.doc_id(columns, row) else {
                    return Vec::new();
                };
                vec![BulkAction::index_doc(
                    &rule.index,
                    id,
                    rule.pipeline.clone(),
                    rule.full_body(columns, row),
                )]
            }
            RowOp::Delete { row } => {
                let Some(id) = rule.doc_id(columns, row) else {
                    return Vec::new();
                };
                vec![BulkAction::delete(&rule.index, id, rule.pipeline.clone())]
            }
            RowOp::Update { before, after } => {
                let (Some(old_id), Some(new_id)) =
                    (rule.doc_id(columns, before), rule.doc_id(columns, after))
                else {
                    return Vec::new();
                };
                if old_id != new_id {
                    // Identity moved: retire the old document, write the new
                    // one in full. Both actions share the source coordinate.
                    debug!(
                        "document id changed {} -> {} on {}.{}",
                        old_id, new_id, event.schema, event.table
                    );
                    return vec![
                        BulkAction::delete(&rule.index, old_id, rule.pipeline.clone()),
                        BulkAction::index_doc(
                            &rule.index,
                            new_id,
                            rule.pipeline.clone(),
                            rule.full_body(columns, after),
                        ),
                    ];
                }
                let body = if rule.full_replace {
                    rule.full_body(columns, after)
                } else {
                    rule.patch_body(columns, before, after)
                };
                vec![BulkAction::update(
                    &rule.index,
                    new_id,
                    rule.pipeline.clone(),
                    body,
                )]
            }
        }
    }

    fn report_mismatch(&self, schema: &str, table: &str, column: &str) {
        let key = (schema.to_string(), table.to_string(), column.to_string());
        let mut reported = self.reported.lock().unwrap_or_else(|e| e.into_inner());
        if reported.insert(key) {
            warn!(
                "rule skipped: {}.{} has no column {}",
                schema, table, column
            );
        }
    }
}
