//! Bulk actions and batches.
//!
//! [`BulkAction`] models one line pair of the bulk API: a metadata line
//! naming the action, index and document id, and an optional body line.
//! A [`Batch`] is the unit shipped to the sink in one round-trip, tagged
//! with the highest source coordinate among its actions.

use crate::position::BinlogPosition;
use serde_json::{Map, Value};

/// Bulk action verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Index,
}

impl ActionKind {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Index => "index",
        }
    }
}

/// One document mutation destined for the bulk endpoint.
///
/// Invariants: `delete` carries no body; `update` carries a partial body
/// that is wrapped as a `{"doc": ...}` patch on the wire; `index` and
/// `create` carry the full document.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub kind: ActionKind,
    pub index: String,
    pub id: String,
    pub pipeline: Option<String>,
    pub body: Option<Map<String, Value>>,
}

impl BulkAction {
    /// Full-document index action.
    pub fn index_doc(
        index: impl Into<String>,
        id: impl Into<String>,
        pipeline: Option<String>,
        body: Map<String, Value>,
    ) -> Self {
        Self {
            kind: ActionKind::Index,
            index: index.into(),
            id: id.into(),
            pipeline,
            body: Some(body),
        }
    }

    /// Partial update action.
    pub fn update(
        index: impl Into<String>,
        id: impl Into<String>,
        pipeline: Option<String>,
        body: Map<String, Value>,
    ) -> Self {
        Self {
            kind: ActionKind::Update,
            index: index.into(),
            id: id.into(),
            pipeline,
            body: Some(body),
        }
    }

    /// Delete action, no body.
    pub fn delete(
        index: impl Into<String>,
        id: impl Into<String>,
        pipeline: Option<String>,
    ) -> Self {
        Self {
            kind: ActionKind::Delete,
            index: index.into(),
            id: id.into(),
            pipeline,
            body: None,
        }
    }

    /// The bulk metadata line, e.g. `{"index": {"_index": "users", "_id": "7"}}`.
    pub fn meta_line(&self) -> Value {
        let mut meta = Map::new();
        meta.insert("_index".to_string(), Value::String(self.index.clone()));
        meta.insert("_id".to_string(), Value::String(self.id.clone()));
        if let Some(pipeline) = &self.pipeline {
            meta.insert("pipeline".to_string(), Value::String(pipeline.clone()));
        }
        meta.insert("_type".to_string(), Value::String("_doc".to_string()));

        let mut line = Map::new();
        line.insert(self.kind.as_str().to_string(), Value::Object(meta));
        Value::Object(line)
    }

    /// The bulk body line, if the action carries one.
    pub fn body_line(&self) -> Option<Value> {
        match self.kind {
            ActionKind::Delete => None,
            ActionKind::Update => {
                let mut doc = Map::new();
                doc.insert(
                    "doc".to_string(),
                    Value::Object(self.body.clone().unwrap_or_default()),
                );
                Some(Value::Object(doc))
            }
            ActionKind::Create | ActionKind::Index => {
                Some(Value::Object(self.body.clone().unwrap_or_default()))
            }
        }
    }
}

/// An ordered run of bulk actions shipped to the sink in one request.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Actions in source-event order
    pub actions: Vec<BulkAction>,
    /// Highest source coordinate among the actions; becomes durable once
    /// the sink acknowledges the batch
    pub position: BinlogPosition,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
