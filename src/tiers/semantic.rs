//! L4 semantic memory: distilled knowledge documents
//!
//! Documents live in the `knowledge` collection and are mirrored into the
//! BM25 index for full-text queries. Writes from distillation go through
//! `upsert_deduplicated`: a candidate whose embedding similarity to an
//! existing document reaches the dedup threshold updates that document
//! instead of creating a near-duplicate. Documents are archived, never
//! deleted, by the lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ContextCandidate, ContextRequest, MemoryTier, QueryFilters, TierHealth, TierKind};
use crate::clock::SharedClock;
use crate::constants::{L4_DEDUP_SCAN_LIMIT, USEFULNESS_REWARD};
use crate::embeddings::Embedder;
use crate::errors::Result;
use crate::memory::types::KnowledgeDocument;
use crate::metrics::KNOWLEDGE_DOCUMENTS_TOTAL;
use crate::similarity::cosine_similarity;
use crate::storage::{get_typed, put_typed, scan_typed, DocumentStore, FullTextStore, TextDocument};

const KNOWLEDGE: &str = "knowledge";

/// Full-text hits examined for near-duplicates
const DEDUP_TEXT_CANDIDATES: usize = 10;

/// What `upsert_deduplicated` did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { id: String },
    Updated { id: String, similarity: f32 },
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Created { id } | Self::Updated { id, .. } => id,
        }
    }
}

pub struct SemanticTier {
    docs: Arc<dyn DocumentStore>,
    fulltext: Arc<dyn FullTextStore>,
    embedder: Arc<dyn Embedder>,
    clock: SharedClock,
    dedup_threshold: f32,
}

impl SemanticTier {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        fulltext: Arc<dyn FullTextStore>,
        embedder: Arc<dyn Embedder>,
        clock: SharedClock,
        dedup_threshold: f32,
    ) -> Self {
        Self {
            docs,
            fulltext,
            embedder,
            clock,
            dedup_threshold,
        }
    }

    pub fn dedup_threshold(&self) -> f32 {
        self.dedup_threshold
    }

    async fn write(&self, doc: &KnowledgeDocument) -> Result<()> {
        doc.validate()?;
        put_typed(self.docs.as_ref(), KNOWLEDGE, &doc.id, doc).await?;
        if doc.archived {
            self.fulltext.delete(&doc.id).await?;
        } else {
            self.fulltext.index(TextDocument::from(doc)).await?;
        }
        Ok(())
    }

    /// Save changes to an existing document
    pub async fn update(&self, doc: &KnowledgeDocument) -> Result<()> {
        self.write(doc).await
    }

    /// Non-archived documents, in id order
    pub async fn active_documents(&self, limit: usize) -> Result<Vec<KnowledgeDocument>> {
        let mut docs: Vec<KnowledgeDocument> =
            scan_typed(self.docs.as_ref(), KNOWLEDGE, "", usize::MAX).await?;
        docs.retain(|d| !d.archived);
        docs.truncate(limit);
        Ok(docs)
    }

    pub async fn archive(&self, id: &str) -> Result<bool> {
        let Some(mut doc) = get_typed::<KnowledgeDocument>(self.docs.as_ref(), KNOWLEDGE, id).await? else {
            return Ok(false);
        };
        if doc.archived {
            return Ok(false);
        }
        doc.archived = true;
        doc.updated_at = self.clock.now();
        self.write(&doc).await?;
        KNOWLEDGE_DOCUMENTS_TOTAL.with_label_values(&["archived"]).inc();
        info!(doc_id = %id, usefulness = doc.usefulness_score, "Knowledge document archived");
        Ok(true)
    }

    /// Most similar active document at or above the dedup threshold
    pub async fn find_near_duplicate(
        &self,
        candidate: &KnowledgeDocument,
    ) -> Result<Option<(KnowledgeDocument, f32)>> {
        let embedding = self.embedder.encode(&candidate.comparison_text())?;

        let mut pool: Vec<KnowledgeDocument> = Vec::new();
        let hits = self
            .fulltext
            .search(&candidate.comparison_text(), DEDUP_TEXT_CANDIDATES)
            .await?;
        for (id, _) in hits {
            if let Some(doc) = get_typed::<KnowledgeDocument>(self.docs.as_ref(), KNOWLEDGE, &id).await? {
                pool.push(doc);
            }
        }
        // Lexical search can miss paraphrases; fall back to a bounded scan
        if pool.is_empty() {
            pool = self.active_documents(L4_DEDUP_SCAN_LIMIT).await?;
        }

        let mut best: Option<(KnowledgeDocument, f32)> = None;
        for doc in pool.into_iter().filter(|d| !d.archived && d.id != candidate.id) {
            let other = self.embedder.encode(&doc.comparison_text())?;
            let similarity = cosine_similarity(&embedding, &other);
            if similarity >= self.dedup_threshold
                && best.as_ref().map_or(true, |(_, s)| similarity > *s)
            {
                best = Some((doc, similarity));
            }
        }
        Ok(best)
    }

    /// Create the candidate, or fold it into its nearest existing duplicate
    pub async fn upsert_deduplicated(&self, candidate: KnowledgeDocument) -> Result<UpsertOutcome> {
        candidate.validate()?;
        let now = self.clock.now();

        let Some((mut existing, similarity)) = self.find_near_duplicate(&candidate).await? else {
            self.write(&candidate).await?;
            KNOWLEDGE_DOCUMENTS_TOTAL.with_label_values(&["created"]).inc();
            debug!(doc_id = %candidate.id, "Knowledge document created");
            return Ok(UpsertOutcome::Created { id: candidate.id });
        };

        merge_into(&mut existing, candidate, now);
        self.write(&existing).await?;
        KNOWLEDGE_DOCUMENTS_TOTAL.with_label_values(&["updated"]).inc();
        debug!(doc_id = %existing.id, similarity, "Knowledge document updated from near-duplicate");
        Ok(UpsertOutcome::Updated {
            id: existing.id,
            similarity,
        })
    }
}

/// Newer synthesis wins on text; provenance and entities accumulate
fn merge_into(existing: &mut KnowledgeDocument, candidate: KnowledgeDocument, now: DateTime<Utc>) {
    let episodes: BTreeSet<String> = existing
        .source_episode_ids
        .drain(..)
        .chain(candidate.source_episode_ids)
        .collect();
    existing.source_episode_ids = episodes.into_iter().collect();

    let mut seen: BTreeSet<String> = existing.entities.iter().map(|e| e.to_lowercase()).collect();
    for entity in candidate.entities {
        if seen.insert(entity.to_lowercase()) {
            existing.entities.push(entity);
        }
    }

    existing.title = candidate.title;
    existing.content = candidate.content;
    existing.confidence = existing.confidence.max(candidate.confidence);
    existing.usefulness_score = (existing.usefulness_score + USEFULNESS_REWARD).min(1.0);
    existing.validation_count = existing.validation_count.saturating_add(1);
    existing.updated_at = now;
    existing.last_validated = Some(now);
}

#[async_trait]
impl MemoryTier for SemanticTier {
    type Input = KnowledgeDocument;
    type Record = KnowledgeDocument;

    fn kind(&self) -> TierKind {
        TierKind::Semantic
    }

    /// Plain insert or replace by id, without duplicate detection
    async fn store(&self, doc: KnowledgeDocument) -> Result<String> {
        self.write(&doc).await?;
        Ok(doc.id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<KnowledgeDocument>> {
        get_typed(self.docs.as_ref(), KNOWLEDGE, id).await
    }

    async fn query(&self, filters: &QueryFilters, limit: usize) -> Result<Vec<KnowledgeDocument>> {
        let Some(text) = filters.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            let mut docs: Vec<KnowledgeDocument> =
                scan_typed(self.docs.as_ref(), KNOWLEDGE, "", usize::MAX).await?;
            docs.retain(|d| filters.include_archived || !d.archived);
            docs.sort_by(|a, b| b.usefulness_score.total_cmp(&a.usefulness_score));
            docs.truncate(limit);
            return Ok(docs);
        };

        let mut out = Vec::new();
        for (id, _) in self.fulltext.search(text, limit.saturating_mul(2).max(1)).await? {
            match get_typed::<KnowledgeDocument>(self.docs.as_ref(), KNOWLEDGE, &id).await? {
                Some(doc) if filters.include_archived || !doc.archived => out.push(doc),
                Some(_) => {}
                None => warn!(doc_id = %id, "Full-text hit without a stored document"),
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.docs.delete(KNOWLEDGE, id).await?;
        self.fulltext.delete(id).await?;
        Ok(removed)
    }

    async fn health_check(&self) -> TierHealth {
        TierHealth::from_adapters(
            TierKind::Semantic,
            vec![self.docs.health_check().await, self.fulltext.health_check().await],
        )
    }

    /// BM25 relevance weighted by confidence and usefulness
    async fn context_candidates(&self, request: &ContextRequest) -> Result<Vec<ContextCandidate>> {
        if request.query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (id, bm25) in self.fulltext.search(&request.query, request.limit).await? {
            let Some(doc) = get_typed::<KnowledgeDocument>(self.docs.as_ref(), KNOWLEDGE, &id).await? else {
                continue;
            };
            if doc.archived {
                continue;
            }
            out.push(ContextCandidate {
                tier: TierKind::Semantic,
                id: doc.id.clone(),
                content: format!("{}: {}", doc.title, doc.content),
                score: bm25 * doc.confidence * (0.5 + 0.5 * doc.usefulness_score),
                timestamp: doc.updated_at,
            });
        }
        Ok(out)
    }
}

impl From<&KnowledgeDocument> for TextDocument {
    fn from(doc: &KnowledgeDocument) -> Self {
        TextDocument {
            id: doc.id.clone(),
            title: doc.title.clone(),
            body: doc.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::storage::{MemoryDocumentStore, TantivyStore};

    /// Maps known texts to fixed vectors
    struct FixedEmbedder;

    impl Embedder for FixedEmbedder {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(if text.contains("Python") {
                vec![1.0, 0.0]
            } else if text.contains("scripting") {
                // cos = 0.9 against the Python vector
                vec![0.9, (1.0f32 - 0.81).sqrt()]
            } else {
                vec![0.0, 1.0]
            })
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn doc(id: &str, title: &str, content: &str, episodes: &[&str]) -> KnowledgeDocument {
        let now = Utc::now();
        KnowledgeDocument {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            confidence: 0.7,
            source_episode_ids: episodes.iter().map(|s| s.to_string()).collect(),
            entities: vec![],
            usefulness_score: 0.5,
            validation_count: 0,
            created_at: now,
            updated_at: now,
            last_validated: None,
            archived: false,
        }
    }

    fn tier() -> SemanticTier {
        SemanticTier::new(
            Arc::new(MemoryDocumentStore::default()),
            Arc::new(TantivyStore::in_ram().unwrap()),
            Arc::new(FixedEmbedder),
            system_clock(),
            0.85,
        )
    }

    #[tokio::test]
    async fn test_similar_document_updates_existing() {
        let tier = tier();
        let first = tier
            .upsert_deduplicated(doc("k1", "Language preference", "User codes in Python", &["e1"]))
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Created { id: "k1".into() });

        let second = tier
            .upsert_deduplicated(doc("k2", "Language preference", "User does scripting work", &["e2"]))
            .await
            .unwrap();
        match second {
            UpsertOutcome::Updated { id, similarity } => {
                assert_eq!(id, "k1");
                assert!((similarity - 0.9).abs() < 1e-3);
            }
            other => panic!("expected update, got {other:?}"),
        }

        let stored = tier.retrieve("k1").await.unwrap().unwrap();
        assert_eq!(stored.source_episode_ids, vec!["e1", "e2"]);
        assert_eq!(stored.validation_count, 1);
        assert!(tier.retrieve("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dissimilar_document_is_created() {
        let tier = tier();
        tier.upsert_deduplicated(doc("k1", "Language", "User codes in Python", &["e1"]))
            .await
            .unwrap();
        let outcome = tier
            .upsert_deduplicated(doc("k2", "Diet", "User is vegetarian", &["e2"]))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Created { id: "k2".into() });
    }

    #[tokio::test]
    async fn test_archived_documents_leave_search() {
        let tier = tier();
        tier.store(doc("k1", "Diet", "User is vegetarian", &["e1"])).await.unwrap();
        let filters = QueryFilters {
            text: Some("vegetarian".into()),
            ..QueryFilters::default()
        };
        assert_eq!(tier.query(&filters, 5).await.unwrap().len(), 1);

        assert!(tier.archive("k1").await.unwrap());
        assert!(tier.query(&filters, 5).await.unwrap().is_empty());
        assert!(tier.retrieve("k1").await.unwrap().unwrap().archived);
    }
}
