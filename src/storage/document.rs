//! Document stores
//!
//! Documents are JSON values keyed `{collection}/{id}` so a collection scan is
//! a RocksDB prefix iteration. RocksDB calls block, so they run on the
//! blocking pool.

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{AdapterHealth, DocumentStore};
use crate::errors::Result;

fn doc_key(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// RocksDB-backed document store
pub struct RocksDocumentStore {
    db: Arc<DB>,
}

impl RocksDocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(crate::errors::MemoryError::storage)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path)?;
        info!("Document store opened at {:?}", path);
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[async_trait]
impl DocumentStore for RocksDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: &serde_json::Value) -> Result<()> {
        let key = doc_key(collection, id);
        let value = serde_json::to_vec(doc)?;
        self.blocking(move |db| Ok(db.put(key.as_bytes(), value)?))
            .await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let key = doc_key(collection, id);
        self.blocking(move |db| match db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let key = doc_key(collection, id);
        self.blocking(move |db| {
            if db.get(key.as_bytes())?.is_none() {
                return Ok(false);
            }
            db.delete(key.as_bytes())?;
            Ok(true)
        })
        .await
    }

    async fn scan(
        &self,
        collection: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let collection_prefix = doc_key(collection, "");
        let full_prefix = doc_key(collection, prefix);
        self.blocking(move |db| {
            let mut out = Vec::new();
            let iter = db.iterator(IteratorMode::From(
                full_prefix.as_bytes(),
                rocksdb::Direction::Forward,
            ));
            for item in iter {
                let (key, value) = item?;
                let key_str = String::from_utf8_lossy(&key);
                if !key_str.starts_with(&full_prefix) {
                    break;
                }
                let id = key_str[collection_prefix.len()..].to_string();
                out.push((id, serde_json::from_slice(&value)?));
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
        .await
    }

    async fn health_check(&self) -> AdapterHealth {
        let probe = self
            .blocking(|db| {
                db.put(b"__health__", b"ok")?;
                Ok(db.get(b"__health__")?.is_some())
            })
            .await;
        match probe {
            Ok(true) => AdapterHealth::ok("documents:rocksdb"),
            Ok(false) => AdapterHealth::failed("documents:rocksdb", "probe key not readable"),
            Err(e) => AdapterHealth::failed("documents:rocksdb", e.to_string()),
        }
    }
}

/// Ordered in-memory document store for tests and ephemeral deployments
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: &serde_json::Value) -> Result<()> {
        self.docs.write().insert(doc_key(collection, id), doc.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.docs.read().get(&doc_key(collection, id)).cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.docs.write().remove(&doc_key(collection, id)).is_some())
    }

    async fn scan(
        &self,
        collection: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let collection_prefix = doc_key(collection, "");
        let full_prefix = doc_key(collection, prefix);
        let docs = self.docs.read();
        Ok(docs
            .range(full_prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&full_prefix))
            .take(limit)
            .map(|(key, value)| (key[collection_prefix.len()..].to_string(), value.clone()))
            .collect())
    }

    async fn health_check(&self) -> AdapterHealth {
        AdapterHealth::ok("documents:memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn exercise(store: &dyn DocumentStore) {
        store.put("facts", "s1:b", &json!({"n": 2})).await.unwrap();
        store.put("facts", "s1:a", &json!({"n": 1})).await.unwrap();
        store.put("facts", "s2:a", &json!({"n": 3})).await.unwrap();
        store.put("other", "s1:z", &json!({"n": 4})).await.unwrap();

        let scanned = store.scan("facts", "s1:", 10).await.unwrap();
        let ids: Vec<_> = scanned.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["s1:a", "s1:b"]);

        assert_eq!(store.scan("facts", "", 2).await.unwrap().len(), 2);
        assert_eq!(
            store.get("facts", "s2:a").await.unwrap(),
            Some(json!({"n": 3}))
        );
        assert!(store.delete("facts", "s2:a").await.unwrap());
        assert!(!store.delete("facts", "s2:a").await.unwrap());
        assert!(store.health_check().await.healthy);
    }

    #[tokio::test]
    async fn test_rocks_document_store() {
        let dir = TempDir::new().unwrap();
        let store = RocksDocumentStore::open(dir.path()).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_memory_document_store() {
        exercise(&MemoryDocumentStore::new()).await;
    }

    #[tokio::test]
    async fn test_rocks_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksDocumentStore::open(dir.path()).unwrap();
            store.put("turns", "t1", &json!({"c": "hi"})).await.unwrap();
        }
        let store = RocksDocumentStore::open(dir.path()).unwrap();
        assert!(store.get("turns", "t1").await.unwrap().is_some());
    }
}
