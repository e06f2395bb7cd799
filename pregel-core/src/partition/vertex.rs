use anyhow::{Context, Result};
use serde_json::Value;

use super::{edge::EdgeEntry, result_document, EdgeView};
use crate::{mapping::Mapping, message::LocationRef, store::DocumentStore};

/// Per-run state of one vertex.
#[derive(Clone, Debug)]
pub struct VertexEntry {
    pub(crate) key: String,
    pub(crate) id: String,
    pub(crate) shard: String,
    pub(crate) document: Value,
    pub(crate) result: Value,
    pub(crate) active: bool,
    pub(crate) deleted: bool,
    pub(crate) dirty: bool,
    pub(crate) edges: Option<Vec<EdgeEntry>>,
}

impl VertexEntry {
    pub(crate) fn new(key: String, id: String, shard: String, document: Value) -> Self {
        Self {
            key,
            id,
            shard,
            document,
            result: Value::Null,
            active: true,
            deleted: false,
            // Every vertex appears in the result collection at least once.
            dirty: true,
            edges: None,
        }
    }

    pub(crate) fn save(&mut self, store: &dyn DocumentStore, mapping: &Mapping) -> Result<()> {
        if self.dirty {
            let result_shard = mapping
                .result_shard(&self.shard)
                .with_context(|| format!("no result shard for vertex shard `{}`", self.shard))?;
            if self.deleted {
                store.remove_document(result_shard, &self.key)?;
            } else {
                store.upsert_document(result_shard, result_document(&self.document, &self.result))?;
            }
            self.dirty = false;
        }

        for edge in self.edges.iter_mut().flatten() {
            edge.save(store, mapping)?;
        }
        Ok(())
    }

    /// Load the out-edges from the responsible edge shards unless loaded.
    pub(crate) fn load_edges(&mut self, store: &dyn DocumentStore, mapping: &Mapping) -> Result<()> {
        if self.edges.is_none() {
            let mut edges = Vec::new();
            for shard in mapping.responsible_edge_shards(&self.shard) {
                for document in store.edges_from(shard, &self.id)? {
                    edges.push(EdgeEntry::new(shard.to_string(), document));
                }
            }
            self.edges = Some(edges);
        }
        Ok(())
    }
}

/// Mutable view of a vertex during one invocation of a vertex program.
///
/// Activation changes are mirrored into the partition's active counter:
/// activating an active vertex or deactivating an inactive one is a no-op,
/// and deleting a vertex deactivates it exactly once.
pub struct VertexView<'a> {
    pub(crate) entry: &'a mut VertexEntry,
    pub(crate) active: &'a mut u64,
    pub(crate) store: &'a dyn DocumentStore,
    pub(crate) mapping: &'a Mapping,
}

impl<'a> VertexView<'a> {
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn shard(&self) -> &str {
        &self.entry.shard
    }

    pub fn location(&self) -> LocationRef {
        LocationRef {
            id: self.entry.id.clone(),
            shard: self.entry.shard.clone(),
        }
    }

    /// The original, read-only document.
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

    pub fn is_active(&self) -> bool {
        self.entry.active
    }

    pub fn activate(&mut self) {
        if !self.entry.active && !self.entry.deleted {
            self.entry.active = true;
            *self.active += 1;
        }
    }

    pub fn deactivate(&mut self) {
        if self.entry.active {
            self.entry.active = false;
            *self.active -= 1;
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.entry.deleted
    }

    /// Delete the vertex from the result graph. A deleted vertex is never
    /// invoked again, not even in the final step.
    pub fn delete(&mut self) {
        if !self.entry.deleted {
            self.deactivate();
            self.entry.deleted = true;
            self.entry.dirty = true;
        }
    }

    /// Out-edges of the vertex, loaded from the store on first access.
    /// Deleted edges are skipped.
    pub fn edges(&mut self) -> Result<Vec<EdgeView<'_>>> {
        self.entry.load_edges(self.store, self.mapping)?;

        let store = self.store;
        let mapping = self.mapping;
        Ok(self
            .entry
            .edges
            .iter_mut()
            .flatten()
            .filter(|edge| !edge.deleted)
            .map(|entry| EdgeView {
                entry,
                store,
                mapping,
            })
            .collect())
    }

    /// Number of non-deleted out-edges.
    pub fn out_degree(&mut self) -> Result<usize> {
        Ok(self.edges()?.len())
    }

    /// Persist the vertex and its modified edges into the result shards.
    pub fn save(&mut self) -> Result<()> {
        self.entry.save(self.store, self.mapping)
    }
}
