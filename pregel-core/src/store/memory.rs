//! A [`DocumentStore`] kept entirely in memory.
//!
//! Shards are assigned to the store's servers round-robin unless a collection
//! is declared `distribute_shards_like` another one, in which case it copies
//! the other collection's placement shard by shard. Documents are placed with
//! [`shard_index`], the same function the [`Mapping`](crate::mapping::Mapping)
//! uses to locate message targets.
//!
//! ```
//! use pregel::store::{DocumentStore, CollectionOptions, memory::MemoryStore};
//! use serde_json::json;
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! let store = MemoryStore::new(["db1", "db2"]);
//! store.create_collection("v", CollectionOptions::vertex(4))?;
//! store.insert("v", json!({"_key": "a"}))?;
//! assert_eq!(store.count("v")?, 1);
//! # Ok(())
//! # }
//! ```
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use dashmap::DashMap;
use serde_json::Value;

use super::{
    shard_key_value, CollectionInfo, CollectionKind, CollectionOptions, DocumentStore,
    GraphDefinition, ShardInfo, FROM, ID, KEY, TO,
};
use crate::{config::DEFAULT_SERVER_NAME, mapping::shard_index};

const FIRST_SHARD_ID: u64 = 100001;

struct Shard {
    collection: String,
    documents: BTreeMap<String, Value>,
}

pub struct MemoryStore {
    servers: Vec<String>,
    next_shard: AtomicU64,
    next_server: AtomicUsize,
    next_key: AtomicU64,
    graphs: DashMap<String, GraphDefinition>,
    collections: DashMap<String, CollectionInfo>,
    shards: DashMap<String, Shard>,
}

impl MemoryStore {
    /// Create an empty store whose shards live on the given servers.
    pub fn new<S: Into<String>>(servers: impl IntoIterator<Item = S>) -> Self {
        let mut servers: Vec<String> = servers.into_iter().map(Into::into).collect();
        if servers.is_empty() {
            servers.push(DEFAULT_SERVER_NAME.to_string());
        }

        Self {
            servers,
            next_shard: AtomicU64::new(FIRST_SHARD_ID),
            next_server: AtomicUsize::new(0),
            next_key: AtomicU64::new(1),
            graphs: Default::default(),
            collections: Default::default(),
            shards: Default::default(),
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    fn new_shard(&self, collection: &str, server: String) -> ShardInfo {
        let id = format!("s{}", self.next_shard.fetch_add(1, Ordering::Relaxed));
        self.shards.insert(
            id.clone(),
            Shard {
                collection: collection.to_string(),
                documents: BTreeMap::new(),
            },
        );
        ShardInfo { id, server }
    }

    fn register(&self, info: CollectionInfo) -> Result<CollectionInfo> {
        match self.collections.entry(info.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Shards were allocated optimistically; release them.
                for shard in &info.shards {
                    self.shards.remove(&shard.id);
                }
                bail!("collection `{}` already exists", info.name)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(info.clone());
                Ok(info)
            }
        }
    }

    fn prepare(&self, collection: &CollectionInfo, document: Value) -> Result<(String, Value)> {
        let Value::Object(mut object) = document else {
            bail!("documents must be objects");
        };

        if collection.kind == CollectionKind::Edge {
            for attribute in [FROM, TO] {
                ensure!(
                    object.get(attribute).and_then(Value::as_str).is_some(),
                    "edge is missing `{attribute}`"
                );
            }
        }
        let key = match object.get(KEY) {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            Some(_) => bail!("`{KEY}` must be a non-empty string"),
            None => {
                let key = self.next_key.fetch_add(1, Ordering::Relaxed).to_string();
                object.insert(KEY.to_string(), Value::String(key.clone()));
                key
            }
        };
        object.insert(
            ID.to_string(),
            Value::String(format!("{}/{key}", collection.name)),
        );

        Ok((key, Value::Object(object)))
    }
}

impl DocumentStore for MemoryStore {
    fn graph(&self, name: &str) -> Result<GraphDefinition> {
        self.graphs
            .get(name)
            .map(|graph| graph.clone())
            .ok_or_else(|| anyhow!("graph `{name}` not found"))
    }

    fn create_graph(&self, graph: GraphDefinition) -> Result<()> {
        for collection in graph
            .vertex_collections
            .iter()
            .chain(graph.edge_collections.iter())
        {
            ensure!(
                self.has_collection(collection),
                "collection `{collection}` not found"
            );
        }
        ensure!(
            !self.graphs.contains_key(&graph.name),
            "graph `{}` already exists",
            graph.name
        );
        self.graphs.insert(graph.name.clone(), graph);
        Ok(())
    }

    fn drop_graph(&self, name: &str) -> Result<()> {
        self.graphs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("graph `{name}` not found"))
    }

    fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    fn collection(&self, name: &str) -> Result<CollectionInfo> {
        self.collections
            .get(name)
            .map(|info| info.clone())
            .ok_or_else(|| anyhow!("collection `{name}` not found"))
    }

    fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<CollectionInfo> {
        ensure!(options.number_of_shards > 0, "a collection needs shards");
        ensure!(!options.shard_keys.is_empty(), "a collection needs shard keys");

        let servers: Vec<String> = match &options.distribute_shards_like {
            Some(prototype) => {
                let prototype = self.collection(prototype)?;
                ensure!(
                    prototype.shards.len() == options.number_of_shards,
                    "`{name}` must have as many shards as `{}`",
                    prototype.name
                );
                prototype.servers().map(str::to_string).collect()
            }
            None => (0..options.number_of_shards)
                .map(|_| {
                    let next = self.next_server.fetch_add(1, Ordering::Relaxed);
                    self.servers[next % self.servers.len()].clone()
                })
                .collect(),
        };

        let shards = servers
            .into_iter()
            .map(|server| self.new_shard(name, server))
            .collect();

        self.register(CollectionInfo {
            name: name.to_string(),
            kind: options.kind,
            shards,
            shard_keys: options.shard_keys,
            distribute_shards_like: options.distribute_shards_like,
        })
    }

    fn create_collection_like(&self, name: &str, prototype: &str) -> Result<CollectionInfo> {
        let prototype = self.collection(prototype)?;
        let shards = prototype
            .shards
            .iter()
            .map(|shard| self.new_shard(name, shard.server.clone()))
            .collect();

        self.register(CollectionInfo {
            name: name.to_string(),
            kind: prototype.kind,
            shards,
            shard_keys: prototype.shard_keys.clone(),
            distribute_shards_like: Some(prototype.name.clone()),
        })
    }

    fn drop_collection(&self, name: &str) -> Result<()> {
        let (_, info) = self
            .collections
            .remove(name)
            .ok_or_else(|| anyhow!("collection `{name}` not found"))?;
        for shard in info.shards {
            self.shards.remove(&shard.id);
        }
        Ok(())
    }

    fn shard_documents(&self, shard: &str) -> Result<Vec<Value>> {
        let shard = self
            .shards
            .get(shard)
            .ok_or_else(|| anyhow!("shard `{shard}` not found"))?;
        Ok(shard.documents.values().cloned().collect())
    }

    fn edges_from(&self, shard: &str, from: &str) -> Result<Vec<Value>> {
        let shard = self
            .shards
            .get(shard)
            .ok_or_else(|| anyhow!("shard `{shard}` not found"))?;
        Ok(shard
            .documents
            .values()
            .filter(|edge| edge.get(FROM).and_then(Value::as_str) == Some(from))
            .cloned()
            .collect())
    }

    fn insert(&self, collection: &str, document: Value) -> Result<Value> {
        let info = self.collection(collection)?;
        let (key, document) = self.prepare(&info, document)?;
        let value = shard_key_value(&document, &info.shard_keys)
            .with_context(|| format!("document `{key}` lacks the shard keys of `{collection}`"))?;
        let shard = &info.shards[shard_index(&value, info.shards.len())].id;

        let mut shard = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| anyhow!("shard `{shard}` not found"))?;
        shard.documents.insert(key, document.clone());
        Ok(document)
    }

    fn document(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let info = self.collection(collection)?;
        for shard in &info.shards {
            if let Some(shard) = self.shards.get(&shard.id) {
                if let Some(document) = shard.documents.get(key) {
                    return Ok(Some(document.clone()));
                }
            }
        }
        Ok(None)
    }

    fn upsert_document(&self, shard: &str, document: Value) -> Result<()> {
        let mut entry = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| anyhow!("shard `{shard}` not found"))?;
        let Value::Object(mut object) = document else {
            bail!("documents must be objects");
        };
        let key = object
            .get(KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("document is missing `{KEY}`"))?;
        object.insert(
            ID.to_string(),
            Value::String(format!("{}/{key}", entry.collection)),
        );
        entry.documents.insert(key, Value::Object(object));
        Ok(())
    }

    fn remove_document(&self, shard: &str, key: &str) -> Result<()> {
        let mut entry = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| anyhow!("shard `{shard}` not found"))?;
        entry.documents.remove(key);
        Ok(())
    }

    fn count(&self, collection: &str) -> Result<usize> {
        let info = self.collection(collection)?;
        Ok(info
            .shards
            .iter()
            .filter_map(|shard| self.shards.get(&shard.id))
            .map(|shard| shard.documents.len())
            .sum())
    }
}
