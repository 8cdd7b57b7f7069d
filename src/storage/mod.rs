//! Storage adapter contracts
//!
//! Tiers never talk to a backend directly. Each capability is an async trait
//! so the embedded backends shipped here can be swapped for networked ones
//! (Redis, PostgreSQL, Qdrant, Neo4j, Typesense) without touching tier code.
//!
//! | Adapter          | Embedded backend        | Used by          |
//! |------------------|-------------------------|------------------|
//! | `KvStore`        | `MemoryKv` (DashMap)    | L1, locks, breakers, watermarks |
//! | `DocumentStore`  | `RocksDocumentStore`    | L1 durable, L2, L4 |
//! | `VectorStore`    | `MemoryVectorStore`     | L3 |
//! | `GraphStore`     | `MemoryGraphStore`      | L3 |
//! | `FullTextStore`  | `TantivyStore`          | L4 |

pub mod document;
pub mod fulltext;
pub mod graph;
pub mod kv;
pub mod vector;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use document::{MemoryDocumentStore, RocksDocumentStore};
pub use fulltext::TantivyStore;
pub use graph::MemoryGraphStore;
pub use kv::MemoryKv;
pub use vector::MemoryVectorStore;

use crate::errors::Result;

/// JSON object attached to vectors and graph elements
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Result of probing one adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AdapterHealth {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            detail: None,
        }
    }

    pub fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Key-value store with TTLs, lists and compare-and-swap
///
/// Lists and plain values share one keyspace; reading a list key with `get`
/// returns `None`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Set only when the key is absent or expired
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool>;

    /// Atomically replace `expected` with `new`
    ///
    /// `expected = None` means the key must be absent; `new = None` deletes.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Increment an integer counter, creating it at 1
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Append to a list, trimming from the front to `max_len`; returns the new length
    async fn list_push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        ttl: Option<Duration>,
    ) -> Result<usize>;

    /// All list entries, oldest first
    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Replace a list wholesale
    async fn list_replace(&self, key: &str, values: &[Vec<u8>], ttl: Option<Duration>)
        -> Result<()>;

    /// Live keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn health_check(&self) -> AdapterHealth;
}

/// JSON document store addressed by collection and id
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, collection: &str, id: &str, doc: &serde_json::Value) -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Documents whose id starts with `prefix`, in id order
    async fn scan(
        &self,
        collection: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, serde_json::Value)>>;

    async fn health_check(&self) -> AdapterHealth;
}

/// Stored vector with its payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub payload: Payload,
}

/// Similarity search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Equality constraints on payload fields
pub type PayloadFilter = Vec<(String, serde_json::Value)>;

/// Returns whether every filter constraint matches the payload
pub fn payload_matches(payload: &Payload, filter: &PayloadFilter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| payload.get(field) == Some(expected))
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace by id
    async fn upsert(&self, record: VectorRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>>;

    /// Cosine top-k among records matching `filter`
    async fn search(&self, query: &[f32], k: usize, filter: &PayloadFilter)
        -> Result<Vec<VectorHit>>;

    /// Records matching `filter`, in id order
    async fn scan(&self, filter: &PayloadFilter, limit: usize) -> Result<Vec<VectorRecord>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn health_check(&self) -> AdapterHealth;
}

/// Labelled graph node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub properties: Payload,
}

/// Directed, typed edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relation: String,
    pub properties: Payload,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or replace a node, keeping its edges
    async fn upsert_node(&self, node: GraphNode) -> Result<()>;

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>>;

    /// Remove a node and every edge touching it
    async fn delete_node(&self, id: &str) -> Result<bool>;

    /// Both endpoints must exist; an edge with the same endpoints and relation is merged
    async fn add_edge(&self, edge: GraphEdge) -> Result<()>;

    /// Edges touching `id`, optionally restricted to one relation
    async fn edges(&self, id: &str, relation: Option<&str>) -> Result<Vec<GraphEdge>>;

    /// Nodes adjacent to `id` in either direction
    async fn neighbors(&self, id: &str, relation: Option<&str>) -> Result<Vec<GraphNode>>;

    async fn nodes_by_label(&self, label: &str, limit: usize) -> Result<Vec<GraphNode>>;

    async fn health_check(&self) -> AdapterHealth;
}

/// Document indexed for BM25 search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDocument {
    pub id: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait FullTextStore: Send + Sync {
    /// Index or re-index by id; visible to search on return
    async fn index(&self, doc: TextDocument) -> Result<()>;

    /// (id, score) pairs by descending BM25 score
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn health_check(&self) -> AdapterHealth;
}

/// Read and decode a JSON value from the KV store
pub async fn kv_get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value to the KV store
pub async fn kv_set_json<T: Serialize + Sync>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    kv.set(key, &bytes, ttl).await
}

/// Typed `DocumentStore::put`
pub async fn put_typed<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    value: &T,
) -> Result<()> {
    store.put(collection, id, &serde_json::to_value(value)?).await
}

/// Typed `DocumentStore::get`
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>> {
    match store.get(collection, id).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed `DocumentStore::scan`; undecodable documents are skipped with a warning
pub async fn scan_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    prefix: &str,
    limit: usize,
) -> Result<Vec<T>> {
    let raw = store.scan(collection, prefix, limit).await?;
    let mut out = Vec::with_capacity(raw.len());
    for (id, value) in raw {
        match serde_json::from_value(value) {
            Ok(decoded) => out.push(decoded),
            Err(e) => tracing::warn!(collection, id = %id, error = %e, "Skipping undecodable document"),
        }
    }
    Ok(out)
}

/// Duration to whole milliseconds, saturating
pub(crate) fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64)
}
