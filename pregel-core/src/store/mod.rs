//! The sharded document store the engine reads graphs from and writes results
//! into.
//!
//! The engine does not own storage. It needs a handful of operations from the
//! store:
//! - graph and collection metadata, including which server owns every shard
//!   and how documents are placed onto shards,
//! - shard scans and out-edge lookups to load partitions,
//! - creation of result collections congruent to the input collections, and
//!   their removal once a result is dropped,
//! - document upserts and removals on explicit shards to persist results.
//!
//! [`MemoryStore`](memory::MemoryStore) implements all of it in process.
//!
//! Documents are JSON objects. Every document carries `_key`; `_id` is
//! `collection/_key`. Edge documents carry `_from` and `_to` ids.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod memory;

/// Attribute names shared by every document.
pub const KEY: &str = "_key";
pub const ID: &str = "_id";
pub const REV: &str = "_rev";
pub const FROM: &str = "_from";
pub const TO: &str = "_to";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Vertex,
    Edge,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: String,
    pub server: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub kind: CollectionKind,
    /// Shards in placement order: a document goes to
    /// `shards[shard_index(shard_key_value(doc), shards.len())]`.
    pub shards: Vec<ShardInfo>,
    pub shard_keys: Vec<String>,
    /// Collection whose shard placement this collection mirrors.
    pub distribute_shards_like: Option<String>,
}

impl CollectionInfo {
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.shards.iter().map(|shard| shard.server.as_str())
    }
}

/// Options for [`DocumentStore::create_collection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionOptions {
    pub kind: CollectionKind,
    pub number_of_shards: usize,
    pub shard_keys: Vec<String>,
    pub distribute_shards_like: Option<String>,
}

impl CollectionOptions {
    pub fn vertex(number_of_shards: usize) -> Self {
        Self {
            kind: CollectionKind::Vertex,
            number_of_shards,
            shard_keys: vec![KEY.to_string()],
            distribute_shards_like: None,
        }
    }

    /// Edges sharded by `_from`, placed like the given vertex collection.
    pub fn edge_like(vertex_collection: &str, number_of_shards: usize) -> Self {
        Self {
            kind: CollectionKind::Edge,
            number_of_shards,
            shard_keys: vec![FROM.to_string()],
            distribute_shards_like: Some(vertex_collection.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    pub vertex_collections: Vec<String>,
    pub edge_collections: Vec<String>,
}

/// Access to the sharded document store.
///
/// Calls are synchronous: the engine invokes them from compute loops that
/// never hold locks across await points.
pub trait DocumentStore: Send + Sync + 'static {
    fn graph(&self, name: &str) -> Result<GraphDefinition>;

    fn create_graph(&self, graph: GraphDefinition) -> Result<()>;

    fn drop_graph(&self, name: &str) -> Result<()>;

    fn has_collection(&self, name: &str) -> bool;

    fn collection(&self, name: &str) -> Result<CollectionInfo>;

    fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<CollectionInfo>;

    /// Create a collection with the kind, shard keys and per-shard servers of
    /// `prototype`.
    fn create_collection_like(&self, name: &str, prototype: &str) -> Result<CollectionInfo>;

    fn drop_collection(&self, name: &str) -> Result<()>;

    /// All documents of a shard, ordered by key.
    fn shard_documents(&self, shard: &str) -> Result<Vec<Value>>;

    /// Edges of an edge shard whose `_from` equals `from`.
    fn edges_from(&self, shard: &str, from: &str) -> Result<Vec<Value>>;

    /// Insert a document into the shard its shard keys select. Returns the
    /// document with `_id` set.
    fn insert(&self, collection: &str, document: Value) -> Result<Value>;

    fn document(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    fn upsert_document(&self, shard: &str, document: Value) -> Result<()>;

    fn remove_document(&self, shard: &str, key: &str) -> Result<()>;

    fn count(&self, collection: &str) -> Result<usize>;
}

/// The value a document is placed by.
///
/// `_from` and `_to` contribute only their key part, so edges sharded by
/// `_from` land on the shard index of their source vertex.
pub fn shard_key_value(document: &Value, shard_keys: &[String]) -> Option<String> {
    let parts = shard_keys
        .iter()
        .map(|attribute| {
            let value = document.get(attribute)?;
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if attribute == FROM || attribute == TO {
                crate::common::split_id(&value).map(|(_, key)| key.to_string())
            } else {
                Some(value)
            }
        })
        .collect::<Option<Vec<_>>>()?;

    Some(parts.join(":"))
}
