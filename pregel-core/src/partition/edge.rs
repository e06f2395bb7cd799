use anyhow::{Context, Result};
use serde_json::Value;

use super::result_document;
use crate::{
    mapping::Mapping,
    store::{DocumentStore, FROM, KEY, TO},
};

/// Per-run state of one out-edge.
#[derive(Clone, Debug)]
pub struct EdgeEntry {
    pub(crate) shard: String,
    pub(crate) document: Value,
    pub(crate) result: Value,
    pub(crate) deleted: bool,
    pub(crate) dirty: bool,
}

impl EdgeEntry {
    pub(crate) fn new(shard: String, document: Value) -> Self {
        Self {
            shard,
            document,
            result: Value::Null,
            deleted: false,
            // Every loaded edge appears in the result collection.
            dirty: true,
        }
    }

    fn key(&self) -> &str {
        self.document.get(KEY).and_then(Value::as_str).unwrap_or_default()
    }

    pub(crate) fn save(&mut self, store: &dyn DocumentStore, mapping: &Mapping) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let result_shard = mapping
            .result_shard(&self.shard)
            .with_context(|| format!("no result shard for edge shard `{}`", self.shard))?;

        if self.deleted {
            store.remove_document(result_shard, self.key())?;
        } else {
            let mut document = result_document(&self.document, &self.result);
            for attribute in [FROM, TO] {
                let rewritten = document
                    .get(attribute)
                    .and_then(Value::as_str)
                    .and_then(|id| mapping.result_id(id));
                if let Some(id) = rewritten {
                    document[attribute] = Value::String(id);
                }
            }
            store.upsert_document(result_shard, document)?;
        }
        self.dirty = false;
        Ok(())
    }
}

/// Mutable view of an out-edge, handed out by
/// [`VertexView::edges`](super::VertexView::edges).
pub struct EdgeView<'a> {
    pub(crate) entry: &'a mut EdgeEntry,
    pub(crate) store: &'a dyn DocumentStore,
    pub(crate) mapping: &'a Mapping,
}

impl<'a> EdgeView<'a> {
    pub fn key(&self) -> &str {
        self.entry.key()
    }

    /// Id of the source vertex.
    pub fn from(&self) -> &str {
        self.entry
            .document
            .get(FROM)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Id of the target vertex.
    pub fn to(&self) -> &str {
        self.entry
            .document
            .get(TO)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn document(&self) -> &Value {
        &self.entry.document
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.entry.document.get(attribute)
    }

    pub fn result(&self) -> &Value {
        &self.entry.result
    }

    pub fn set_result(&mut self, result: Value) {
        self.entry.result = result;
        self.entry.dirty = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.entry.deleted
    }

    /// Remove the edge from the result graph. Deleted edges are no longer
    /// returned by [`VertexView::edges`](super::VertexView::edges).
    pub fn delete(&mut self) {
        if !self.entry.deleted {
            self.entry.deleted = true;
            self.entry.dirty = true;
        }
    }

    /// Persist the edge into its result shard.
    pub fn save(&mut self) -> Result<()> {
        self.entry.save(self.store, self.mapping)
    }
}
