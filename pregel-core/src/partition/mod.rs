//! Vertex partitions and the views user algorithms work through.
//!
//! A [`VertexPartition`] holds the vertices one local worker owns for the
//! duration of an execution: every vertex of the server's shards whose key
//! hashes to that worker (see [`local_worker_index`]). Original documents are
//! never modified; each vertex carries a per-run record of its activity,
//! deletion flag and result, which is persisted into the result shard that
//! mirrors its input shard.
use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use serde_json::Value;

pub use self::{
    edge::EdgeView,
    vertex::{VertexEntry, VertexView},
};
use crate::{
    mapping::{local_worker_index, Mapping},
    message::LocationRef,
    store::{DocumentStore, ID, KEY, REV},
};

mod edge;
mod vertex;

pub struct VertexPartition {
    entries: Vec<VertexEntry>,
    by_id: HashMap<String, usize>,
    active: u64,
    store: Arc<dyn DocumentStore>,
    mapping: Arc<Mapping>,
}

impl VertexPartition {
    pub fn new(store: Arc<dyn DocumentStore>, mapping: Arc<Mapping>) -> Self {
        Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
            active: 0,
            store,
            mapping,
        }
    }

    /// Load the vertices of the given shards owned by local worker `worker`
    /// out of `workers`, one partition per worker.
    pub fn load_all(
        store: &Arc<dyn DocumentStore>,
        mapping: &Arc<Mapping>,
        shards: &[&str],
        workers: usize,
    ) -> Result<Vec<VertexPartition>> {
        let mut partitions: Vec<_> = (0..workers.max(1))
            .map(|_| VertexPartition::new(store.clone(), mapping.clone()))
            .collect();
        let workers = partitions.len();

        for shard in shards {
            for document in store.shard_documents(shard)? {
                let key = document
                    .get(KEY)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("vertex in shard `{shard}` has no `{KEY}`"))?;
                partitions[local_worker_index(key, workers)].push(shard, document.clone())?;
            }
        }

        Ok(partitions)
    }

    /// Add a vertex document. New vertices start active.
    pub fn push(&mut self, shard: &str, document: Value) -> Result<()> {
        let key = document
            .get(KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("vertex has no `{KEY}`"))?
            .to_string();
        let id = document
            .get(ID)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("vertex `{key}` has no `{ID}`"))?
            .to_string();

        self.by_id.insert(id.clone(), self.entries.len());
        self.entries
            .push(VertexEntry::new(key, id, shard.to_string(), document));
        self.active += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of vertices currently flagged active.
    pub fn active_count(&self) -> u64 {
        self.active
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn entry(&self, index: usize) -> &VertexEntry {
        &self.entries[index]
    }

    pub fn id(&self, index: usize) -> &str {
        &self.entries[index].id
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        self.entries[index].deleted
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.entries[index].active
    }

    pub fn location(&self, index: usize) -> LocationRef {
        let entry = &self.entries[index];
        LocationRef {
            id: entry.id.clone(),
            shard: entry.shard.clone(),
        }
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn view(&mut self, index: usize) -> VertexView<'_> {
        VertexView {
            entry: &mut self.entries[index],
            active: &mut self.active,
            store: &*self.store,
            mapping: &self.mapping,
        }
    }

    /// Persist every vertex and edge with unsaved changes. Out-edges of
    /// surviving vertices are loaded first so the result graph holds them
    /// all, touched by the algorithm or not.
    pub fn persist_pending(&mut self) -> Result<()> {
        for entry in &mut self.entries {
            if !entry.deleted {
                entry.load_edges(&*self.store, &self.mapping)?;
            }
            entry.save(&*self.store, &self.mapping)?;
        }
        Ok(())
    }
}

/// The result-side copy of a document: original attributes without `_id`
/// and `_rev`, plus `result`.
pub(crate) fn result_document(original: &Value, result: &Value) -> Value {
    let mut document = original.clone();
    if let Value::Object(object) = &mut document {
        object.remove(ID);
        object.remove(REV);
        object.insert("result".to_string(), result.clone());
    }
    document
}
