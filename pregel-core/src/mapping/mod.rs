//! Translation between input shards, result shards, collections and servers.
//!
//! A [`Mapping`] is built once when an execution starts, shipped to every
//! worker with the setup command, and never changes afterwards. Workers share
//! it read-only across their local tasks.
//!
//! # Design notes
//!
//! - Result collections are named `pregel_<execution>_<collection>` and are
//!   created [like](crate::store::DocumentStore::create_collection_like) the
//!   input collection, so the n-th result shard lives on the same server as
//!   the n-th input shard.
//! - [`Mapping::location_of`] is the only place shard ownership is computed
//!   from document content. It uses [`shard_index`], which is the placement
//!   function of the store.
//! - Vertex collections must be sharded by `_key`; anything else would make
//!   message targets unaddressable from an id alone.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::{
    common::{split_id, ExecutionId},
    error::{PregelError, Result},
    message::LocationRef,
    store::{CollectionKind, DocumentStore, GraphDefinition, ShardInfo, FROM, KEY, TO},
};

const SHARD_SEED: u64 = 0;
const LOCAL_WORKER_SEED: u64 = 1;

/// Index of the shard a shard-key value is placed on.
pub fn shard_index(value: &str, shards: usize) -> usize {
    (xxh64(value.as_bytes(), SHARD_SEED) % shards.max(1) as u64) as usize
}

/// Index of the local worker owning a vertex key.
///
/// A different seed than [`shard_index`] keeps the vertices of one shard
/// spread over all local workers.
pub fn local_worker_index(key: &str, workers: usize) -> usize {
    (xxh64(key.as_bytes(), LOCAL_WORKER_SEED) % workers.max(1) as u64) as usize
}

/// Name of the result collection of `collection` for an execution.
pub fn result_collection_name(execution: ExecutionId, collection: &str) -> String {
    format!("pregel_{execution}_{collection}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub name: String,
    pub kind: CollectionKind,
    pub shards: Vec<ShardInfo>,
    pub shard_keys: Vec<String>,
    pub distribute_shards_like: Option<String>,
    pub result_collection: String,
    /// Result shard ids, index-aligned with `shards`.
    pub result_shards: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MappingData {
    graph: String,
    result_graph: String,
    collections: Vec<CollectionMapping>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "MappingData", into = "MappingData")]
pub struct Mapping {
    graph: String,
    result_graph: String,
    collections: Vec<CollectionMapping>,
    by_name: HashMap<String, usize>,
    /// shard id -> (collection index, shard index)
    by_shard: HashMap<String, (usize, usize)>,
}

impl From<MappingData> for Mapping {
    fn from(data: MappingData) -> Self {
        let mut by_name = HashMap::new();
        let mut by_shard = HashMap::new();
        for (c, collection) in data.collections.iter().enumerate() {
            by_name.insert(collection.name.clone(), c);
            for (s, shard) in collection.shards.iter().enumerate() {
                by_shard.insert(shard.id.clone(), (c, s));
            }
        }

        Self {
            graph: data.graph,
            result_graph: data.result_graph,
            collections: data.collections,
            by_name,
            by_shard,
        }
    }
}

impl From<Mapping> for MappingData {
    fn from(mapping: Mapping) -> Self {
        Self {
            graph: mapping.graph,
            result_graph: mapping.result_graph,
            collections: mapping.collections,
        }
    }
}

impl Mapping {
    pub fn new(graph: String, result_graph: String, collections: Vec<CollectionMapping>) -> Self {
        MappingData {
            graph,
            result_graph,
            collections,
        }
        .into()
    }

    /// Build the mapping of `graph` for an execution, creating its result
    /// collections and result graph in the store.
    ///
    /// On failure, result collections created so far are dropped again.
    pub fn create(store: &dyn DocumentStore, graph: &str, execution: ExecutionId) -> Result<Self> {
        let definition = store
            .graph(graph)
            .map_err(|err| PregelError::BadParameter(format!("{err:#}")))?;

        let mut collections = Vec::new();
        let outcome = Self::create_result_collections(store, &definition, execution, &mut collections);
        if let Err(err) = outcome {
            for collection in &collections {
                _ = store.drop_collection(&collection.result_collection);
            }
            return Err(err);
        }

        let result_graph = result_collection_name(execution, graph);
        let result_definition = GraphDefinition {
            name: result_graph.clone(),
            vertex_collections: collections
                .iter()
                .filter(|c| c.kind == CollectionKind::Vertex)
                .map(|c| c.result_collection.clone())
                .collect(),
            edge_collections: collections
                .iter()
                .filter(|c| c.kind == CollectionKind::Edge)
                .map(|c| c.result_collection.clone())
                .collect(),
        };
        if let Err(err) = store.create_graph(result_definition) {
            for collection in &collections {
                _ = store.drop_collection(&collection.result_collection);
            }
            return Err(PregelError::internal(format!("{err:#}")));
        }

        debug!(%execution, graph, collections = collections.len(), "built mapping");
        Ok(Self::new(graph.to_string(), result_graph, collections))
    }

    fn create_result_collections(
        store: &dyn DocumentStore,
        definition: &GraphDefinition,
        execution: ExecutionId,
        out: &mut Vec<CollectionMapping>,
    ) -> Result<()> {
        let names = definition
            .vertex_collections
            .iter()
            .map(|name| (name, CollectionKind::Vertex))
            .chain(
                definition
                    .edge_collections
                    .iter()
                    .map(|name| (name, CollectionKind::Edge)),
            );

        for (name, expected) in names {
            let info = store
                .collection(name)
                .map_err(|err| PregelError::BadParameter(format!("{err:#}")))?;
            if info.kind != expected {
                return Err(PregelError::BadParameter(format!(
                    "collection `{name}` is not a {expected:?} collection"
                )));
            }
            if expected == CollectionKind::Vertex && info.shard_keys != [KEY] {
                return Err(PregelError::BadParameter(format!(
                    "vertex collection `{name}` must be sharded by `{KEY}`"
                )));
            }

            let result_collection = result_collection_name(execution, name);
            let result = store
                .create_collection_like(&result_collection, name)
                .map_err(|err| PregelError::internal(format!("{err:#}")))?;

            out.push(CollectionMapping {
                name: info.name,
                kind: info.kind,
                shards: info.shards,
                shard_keys: info.shard_keys,
                distribute_shards_like: info.distribute_shards_like,
                result_collection,
                result_shards: result.shards.into_iter().map(|shard| shard.id).collect(),
            });
        }

        Ok(())
    }

    pub fn graph(&self) -> &str {
        &self.graph
    }

    pub fn result_graph(&self) -> &str {
        &self.result_graph
    }

    pub fn collections(&self) -> &[CollectionMapping] {
        &self.collections
    }

    /// Servers owning at least one shard, in name order.
    pub fn servers(&self) -> Vec<String> {
        self.collections
            .iter()
            .flat_map(|c| c.shards.iter().map(|shard| shard.server.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every shard of the execution.
    pub fn global_shards(&self) -> Vec<&str> {
        self.collections
            .iter()
            .flat_map(|c| c.shards.iter().map(|shard| shard.id.as_str()))
            .collect()
    }

    /// Shards owned by `server`.
    pub fn local_shards(&self, server: &str) -> Vec<&str> {
        self.collections
            .iter()
            .flat_map(|c| c.shards.iter())
            .filter(|shard| shard.server == server)
            .map(|shard| shard.id.as_str())
            .collect()
    }

    /// Vertex shards owned by `server`.
    pub fn local_vertex_shards(&self, server: &str) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|c| c.kind == CollectionKind::Vertex)
            .flat_map(|c| c.shards.iter())
            .filter(|shard| shard.server == server)
            .map(|shard| shard.id.as_str())
            .collect()
    }

    pub fn server_of(&self, shard: &str) -> Option<&str> {
        let &(c, s) = self.by_shard.get(shard)?;
        Some(self.collections[c].shards[s].server.as_str())
    }

    pub fn collection_of(&self, shard: &str) -> Option<&CollectionMapping> {
        let &(c, _) = self.by_shard.get(shard)?;
        Some(&self.collections[c])
    }

    /// Edge shards that must be scanned to find the out-edges of a vertex on
    /// `vertex_shard`.
    ///
    /// Edge collections sharded by `_from` and placed like the vertex
    /// collection, with as many shards, keep the out-edges of a vertex on the
    /// index-aligned edge shard.
    /// For any other edge collection all shards are responsible.
    pub fn responsible_edge_shards(&self, vertex_shard: &str) -> Vec<&str> {
        let Some(&(c, s)) = self.by_shard.get(vertex_shard) else {
            return Vec::new();
        };
        let vertex = &self.collections[c];

        self.collections
            .iter()
            .filter(|edges| edges.kind == CollectionKind::Edge)
            .flat_map(|edges| {
                let aligned = edges.distribute_shards_like.as_deref() == Some(&vertex.name)
                    && edges.shards.len() == vertex.shards.len()
                    && edges.shard_keys == [FROM];
                if aligned {
                    vec![edges.shards[s].id.as_str()]
                } else {
                    edges.shards.iter().map(|shard| shard.id.as_str()).collect()
                }
            })
            .collect()
    }

    pub fn result_collection(&self, collection: &str) -> Option<&str> {
        let &c = self.by_name.get(collection)?;
        Some(self.collections[c].result_collection.as_str())
    }

    pub fn result_shard(&self, shard: &str) -> Option<&str> {
        let &(c, s) = self.by_shard.get(shard)?;
        self.collections[c].result_shards.get(s).map(String::as_str)
    }

    /// Result id of a document id: `v/1` becomes `pregel_<id>_v/1`.
    pub fn result_id(&self, id: &str) -> Option<String> {
        let (collection, key) = split_id(id)?;
        Some(format!("{}/{key}", self.result_collection(collection)?))
    }

    /// Locate the vertex with the given id.
    pub fn location_of(&self, id: &str) -> Result<LocationRef> {
        if id.is_empty() {
            return Err(PregelError::NoTargetProvided);
        }
        let (collection, key) =
            split_id(id).ok_or_else(|| PregelError::InvalidTargetVertex(id.to_string()))?;
        let vertices = self
            .by_name
            .get(collection)
            .map(|&c| &self.collections[c])
            .filter(|c| c.kind == CollectionKind::Vertex)
            .ok_or_else(|| PregelError::InvalidTargetVertex(id.to_string()))?;

        let shard = vertices
            .shards
            .get(shard_index(key, vertices.shards.len()))
            .ok_or_else(|| PregelError::InvalidTargetVertex(id.to_string()))?;
        Ok(LocationRef {
            id: id.to_string(),
            shard: shard.id.clone(),
        })
    }

    /// Locate the `_to` vertex of an edge document.
    pub fn to_location(&self, edge: &Value) -> Result<LocationRef> {
        let to = edge
            .get(TO)
            .and_then(Value::as_str)
            .ok_or(PregelError::NoTargetProvided)?;
        self.location_of(to)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::{
        serializer::Serializer,
        store::{memory::MemoryStore, CollectionOptions},
    };

    const EXECUTION: ExecutionId = ExecutionId(42);

    fn store() -> MemoryStore {
        let store = MemoryStore::new(["db1", "db2"]);
        store
            .create_collection("v", CollectionOptions::vertex(4))
            .unwrap();
        store
            .create_collection("e", CollectionOptions::edge_like("v", 4))
            .unwrap();
        store
            .create_graph(GraphDefinition {
                name: "g".to_string(),
                vertex_collections: vec!["v".to_string()],
                edge_collections: vec!["e".to_string()],
            })
            .unwrap();
        for key in 1..=20 {
            store.insert("v", json!({ "_key": key.to_string() })).unwrap();
        }
        store
    }

    #[test]
    fn creates_congruent_result_collections() {
        let store = store();
        let mapping = Mapping::create(&store, "g", EXECUTION).unwrap();

        assert_eq!(mapping.result_graph(), "pregel_42_g");
        assert_eq!(mapping.result_collection("v"), Some("pregel_42_v"));
        let v = store.collection("v").unwrap();
        let result = store.collection("pregel_42_v").unwrap();
        for (original, result) in v.shards.iter().zip(result.shards.iter()) {
            assert_eq!(mapping.result_shard(&original.id), Some(result.id.as_str()));
            assert_eq!(original.server, result.server);
        }
        assert!(store.graph("pregel_42_g").is_ok());
    }

    #[test]
    fn splits_shards_by_server() {
        let store = store();
        let mapping = Mapping::create(&store, "g", EXECUTION).unwrap();

        assert_eq!(mapping.servers(), vec!["db1", "db2"]);
        assert_eq!(mapping.global_shards().len(), 8);
        assert_eq!(mapping.local_shards("db1").len(), 4);
        assert_eq!(mapping.local_vertex_shards("db2").len(), 2);
        for shard in mapping.local_shards("db2") {
            assert_eq!(mapping.server_of(shard), Some("db2"));
        }
    }

    #[test]
    fn aligned_edge_shard_is_responsible() {
        let store = store();
        let mapping = Mapping::create(&store, "g", EXECUTION).unwrap();
        let v = store.collection("v").unwrap();
        let e = store.collection("e").unwrap();

        for (index, shard) in v.shards.iter().enumerate() {
            assert_eq!(
                mapping.responsible_edge_shards(&shard.id),
                vec![e.shards[index].id.as_str()]
            );
        }
    }

    #[test]
    fn unaligned_edges_scan_every_shard() {
        let store = store();
        store
            .create_collection(
                "loose",
                CollectionOptions {
                    kind: CollectionKind::Edge,
                    number_of_shards: 3,
                    shard_keys: vec![KEY.to_string()],
                    distribute_shards_like: None,
                },
            )
            .unwrap();
        store
            .create_graph(GraphDefinition {
                name: "loose_graph".to_string(),
                vertex_collections: vec!["v".to_string()],
                edge_collections: vec!["loose".to_string()],
            })
            .unwrap();
        let mapping = Mapping::create(&store, "loose_graph", EXECUTION).unwrap();
        let v = store.collection("v").unwrap();

        assert_eq!(mapping.responsible_edge_shards(&v.shards[0].id).len(), 3);
    }

    #[test]
    fn edges_placed_like_vertices_but_keyed_otherwise_scan_every_shard() {
        let store = store();
        store
            .create_collection(
                "by_key",
                CollectionOptions {
                    kind: CollectionKind::Edge,
                    number_of_shards: 4,
                    shard_keys: vec![KEY.to_string()],
                    distribute_shards_like: Some("v".to_string()),
                },
            )
            .unwrap();
        store
            .create_graph(GraphDefinition {
                name: "by_key_graph".to_string(),
                vertex_collections: vec!["v".to_string()],
                edge_collections: vec!["by_key".to_string()],
            })
            .unwrap();
        for _ in 0..16 {
            store
                .insert("by_key", json!({"_from": "v/1", "_to": "v/1"}))
                .unwrap();
        }
        let mapping = Mapping::create(&store, "by_key_graph", EXECUTION).unwrap();
        let location = mapping.location_of("v/1").unwrap();

        let shards = mapping.responsible_edge_shards(&location.shard);
        let found: usize = shards
            .iter()
            .map(|shard| store.edges_from(shard, "v/1").unwrap().len())
            .sum();

        assert_eq!(shards.len(), 4);
        assert_eq!(found, 16);
    }

    #[test]
    fn vertex_collections_without_shards_are_not_addressable() {
        let mapping = Mapping::new(
            "g".to_string(),
            "pregel_42_g".to_string(),
            vec![CollectionMapping {
                name: "v".to_string(),
                kind: CollectionKind::Vertex,
                shards: Vec::new(),
                shard_keys: vec![KEY.to_string()],
                distribute_shards_like: None,
                result_collection: "pregel_42_v".to_string(),
                result_shards: Vec::new(),
            }],
        );

        assert!(matches!(
            mapping.location_of("v/1"),
            Err(PregelError::InvalidTargetVertex(_))
        ));
    }

    #[test]
    fn locates_vertices_where_the_store_put_them() {
        let store = store();
        let mapping = Mapping::create(&store, "g", EXECUTION).unwrap();

        for key in 1..=20 {
            let id = format!("v/{key}");
            let location = mapping.location_of(&id).unwrap();
            let documents = store.shard_documents(&location.shard).unwrap();
            assert!(documents.iter().any(|doc| doc["_id"] == id), "{id}");
        }

        let edge = json!({"_from": "v/1", "_to": "v/7"});
        assert_eq!(
            mapping.to_location(&edge).unwrap(),
            mapping.location_of("v/7").unwrap()
        );
    }

    #[test]
    fn rejects_bad_targets() {
        let store = store();
        let mapping = Mapping::create(&store, "g", EXECUTION).unwrap();

        assert_eq!(mapping.location_of(""), Err(PregelError::NoTargetProvided));
        assert!(matches!(
            mapping.location_of("missing/1"),
            Err(PregelError::InvalidTargetVertex(_))
        ));
        assert!(matches!(
            mapping.location_of("e/1"),
            Err(PregelError::InvalidTargetVertex(_))
        ));
        assert_eq!(
            mapping.to_location(&json!({"_from": "v/1"})),
            Err(PregelError::NoTargetProvided)
        );
    }

    #[test]
    fn rejects_vertex_collections_not_sharded_by_key() {
        let store = MemoryStore::new(["db1"]);
        store
            .create_collection(
                "v",
                CollectionOptions {
                    shard_keys: vec!["name".to_string()],
                    ..CollectionOptions::vertex(2)
                },
            )
            .unwrap();
        store
            .create_graph(GraphDefinition {
                name: "g".to_string(),
                vertex_collections: vec!["v".to_string()],
                edge_collections: vec![],
            })
            .unwrap();

        assert!(matches!(
            Mapping::create(&store, "g", EXECUTION),
            Err(PregelError::BadParameter(_))
        ));
        assert!(!store.has_collection("pregel_42_v"));
    }

    #[test]
    fn survives_the_wire() {
        let store = store();
        let mapping = Mapping::create(&store, "g", EXECUTION).unwrap();
        let bytes = Serializer::Cbor.to_bytes(&mapping).unwrap();
        let decoded: Mapping = Serializer::Cbor.from_bytes(&bytes).unwrap();

        let shard = mapping.global_shards()[0];
        assert_eq!(decoded.server_of(shard), mapping.server_of(shard));
        assert_eq!(decoded.result_shard(shard), mapping.result_shard(shard));
    }
}
