//! In-memory vector store with brute-force cosine search

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{payload_matches, AdapterHealth, PayloadFilter, VectorHit, VectorRecord, VectorStore};
use crate::errors::Result;
use crate::similarity::cosine_similarity;

#[derive(Default)]
pub struct MemoryVectorStore {
    records: RwLock<BTreeMap<String, VectorRecord>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<VectorHit>> {
        let records = self.records.read();
        let mut scored: Vec<(OrderedFloat<f32>, &VectorRecord)> = records
            .values()
            .filter(|r| payload_matches(&r.payload, filter))
            .map(|r| (OrderedFloat(cosine_similarity(query, &r.embedding)), r))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, r)| VectorHit {
                id: r.id.clone(),
                score: score.0,
                payload: r.payload.clone(),
            })
            .collect())
    }

    async fn scan(&self, filter: &PayloadFilter, limit: usize) -> Result<Vec<VectorRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| payload_matches(&r.payload, filter))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().remove(id).is_some())
    }

    async fn health_check(&self) -> AdapterHealth {
        AdapterHealth::ok("vectors:memory")
    }
}
