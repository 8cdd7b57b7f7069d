//! L2 working memory
//!
//! Significance-filtered facts keyed `{session}/{fact_id}` in the `facts`
//! collection, with a `fact_sessions` index so facts can be fetched by id
//! alone. Writes below the CIAR threshold are rejected with
//! `ThresholdNotMet`; reads through `retrieve` count as an access and
//! re-score the fact.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{ContextCandidate, ContextRequest, MemoryTier, QueryFilters, TierHealth, TierKind};
use crate::clock::SharedClock;
use crate::constants::{CIAR_SCORE_EPSILON, L2_SCAN_LIMIT};
use crate::embeddings::Embedder;
use crate::errors::{MemoryError, Result};
use crate::memory::ciar::CiarScorer;
use crate::memory::types::Fact;
use crate::metrics::FACTS_PROMOTED_TOTAL;
use crate::similarity::cosine_similarity;
use crate::storage::{get_typed, put_typed, scan_typed, DocumentStore};

const FACTS: &str = "facts";
const FACT_SESSIONS: &str = "fact_sessions";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FactLocation {
    session_id: String,
}

pub struct WorkingTier {
    docs: Arc<dyn DocumentStore>,
    scorer: CiarScorer,
    embedder: Arc<dyn Embedder>,
    clock: SharedClock,
    threshold: f32,
    ttl: Duration,
}

impl WorkingTier {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        scorer: CiarScorer,
        embedder: Arc<dyn Embedder>,
        clock: SharedClock,
        threshold: f32,
        ttl_days: i64,
    ) -> Self {
        Self {
            docs,
            scorer,
            embedder,
            clock,
            threshold,
            ttl: Duration::days(ttl_days.max(1)),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn scorer(&self) -> &CiarScorer {
        &self.scorer
    }

    fn doc_id(session_id: &str, fact_id: &str) -> String {
        format!("{session_id}/{fact_id}")
    }

    async fn locate(&self, fact_id: &str) -> Result<Option<String>> {
        let location: Option<FactLocation> =
            get_typed(self.docs.as_ref(), FACT_SESSIONS, fact_id).await?;
        Ok(location.map(|l| l.session_id))
    }

    async fn write(&self, fact: &Fact) -> Result<()> {
        put_typed(
            self.docs.as_ref(),
            FACTS,
            &Self::doc_id(&fact.session_id, &fact.id),
            fact,
        )
        .await
    }

    /// Read without counting an access (engine paths)
    pub async fn peek(&self, fact_id: &str) -> Result<Option<Fact>> {
        let Some(session_id) = self.locate(fact_id).await? else {
            return Ok(None);
        };
        get_typed(self.docs.as_ref(), FACTS, &Self::doc_id(&session_id, fact_id)).await
    }

    /// All facts of a session, consolidated or not
    pub async fn session_facts(&self, session_id: &str) -> Result<Vec<Fact>> {
        scan_typed(
            self.docs.as_ref(),
            FACTS,
            &format!("{session_id}/"),
            L2_SCAN_LIMIT,
        )
        .await
    }

    /// Unconsolidated facts extracted at or before `cutoff`, oldest first
    pub async fn unconsolidated(&self, session_id: &str, cutoff: DateTime<Utc>) -> Result<Vec<Fact>> {
        let mut facts = self.session_facts(session_id).await?;
        facts.retain(|f| !f.is_consolidated() && f.extracted_at <= cutoff);
        facts.sort_by(|a, b| {
            a.source_timestamp
                .cmp(&b.source_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(facts)
    }

    /// Unconsolidated facts extracted after `cutoff`, oldest first
    pub async fn unsettled(&self, session_id: &str, cutoff: DateTime<Utc>) -> Result<Vec<Fact>> {
        let mut facts = self.session_facts(session_id).await?;
        facts.retain(|f| !f.is_consolidated() && f.extracted_at > cutoff);
        facts.sort_by(|a, b| a.source_timestamp.cmp(&b.source_timestamp));
        Ok(facts)
    }

    /// Sessions that still hold unconsolidated facts
    pub async fn sessions_with_pending(&self) -> Result<Vec<String>> {
        let facts: Vec<Fact> = scan_typed(self.docs.as_ref(), FACTS, "", usize::MAX).await?;
        let sessions: BTreeSet<String> = facts
            .into_iter()
            .filter(|f| !f.is_consolidated())
            .map(|f| f.session_id)
            .collect();
        Ok(sessions.into_iter().collect())
    }

    /// Stamp source facts with the episode they were folded into
    #[instrument(skip(self, fact_ids), fields(session_id = %session_id, episode_id = %episode_id))]
    pub async fn mark_consolidated(
        &self,
        session_id: &str,
        fact_ids: &[String],
        episode_id: &str,
    ) -> Result<usize> {
        let mut marked = 0;
        for fact_id in fact_ids {
            let doc_id = Self::doc_id(session_id, fact_id);
            let Some(mut fact) = get_typed::<Fact>(self.docs.as_ref(), FACTS, &doc_id).await? else {
                warn!(fact_id = %fact_id, "Fact vanished before it could be marked consolidated");
                continue;
            };
            if fact.consolidated_to_episode_id.as_deref() == Some(episode_id) {
                continue;
            }
            fact.consolidated_to_episode_id = Some(episode_id.to_string());
            self.write(&fact).await?;
            marked += 1;
        }
        Ok(marked)
    }

    /// Count an access: bump the counter and re-score
    pub async fn record_access(&self, fact_id: &str) -> Result<Option<Fact>> {
        let Some(mut fact) = self.peek(fact_id).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        fact.access_count = fact.access_count.saturating_add(1);
        fact.last_accessed = Some(now);
        fact.ciar = self.scorer.rescore_access(&fact, now, fact.access_count)?;
        self.write(&fact).await?;
        Ok(Some(fact))
    }

    /// Delete unconsolidated facts past their TTL; consolidated facts stay
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
        let facts: Vec<Fact> = scan_typed(self.docs.as_ref(), FACTS, "", usize::MAX).await?;
        let mut removed = 0;
        for fact in facts {
            if fact.is_consolidated() || now - fact.extracted_at < self.ttl {
                continue;
            }
            self.docs
                .delete(FACTS, &Self::doc_id(&fact.session_id, &fact.id))
                .await?;
            self.docs.delete(FACT_SESSIONS, &fact.id).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Expired unconsolidated L2 facts");
        }
        Ok(removed)
    }

    fn check_score(&self, fact: &Fact) -> Result<()> {
        let c = &fact.ciar;
        let expected = (c.certainty() * c.impact() * c.age_decay() * c.recency_boost()).clamp(0.0, 1.0);
        if (expected - fact.ciar_score()).abs() > CIAR_SCORE_EPSILON {
            return Err(MemoryError::validation(
                "ciar",
                format!("score {} disagrees with components ({expected})", fact.ciar_score()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryTier for WorkingTier {
    type Input = Fact;
    type Record = Fact;

    fn kind(&self) -> TierKind {
        TierKind::Working
    }

    /// Store a fact; re-storing the same fact keeps its access history
    async fn store(&self, mut fact: Fact) -> Result<String> {
        if fact.content.trim().is_empty() {
            return Err(MemoryError::validation("content", "must not be empty"));
        }
        self.check_score(&fact)?;
        let score = fact.ciar_score();
        if score < self.threshold {
            FACTS_PROMOTED_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(MemoryError::ThresholdNotMet {
                score,
                threshold: self.threshold,
            });
        }

        let doc_id = Self::doc_id(&fact.session_id, &fact.id);
        if let Some(existing) = get_typed::<Fact>(self.docs.as_ref(), FACTS, &doc_id).await? {
            if existing.is_consolidated() {
                debug!(fact_id = %fact.id, "Fact already consolidated, keeping stored copy");
                return Ok(existing.id);
            }
            fact.access_count = fact.access_count.max(existing.access_count);
            fact.last_accessed = fact.last_accessed.or(existing.last_accessed);
        }

        self.write(&fact).await?;
        put_typed(
            self.docs.as_ref(),
            FACT_SESSIONS,
            &fact.id,
            &FactLocation {
                session_id: fact.session_id.clone(),
            },
        )
        .await?;
        FACTS_PROMOTED_TOTAL.with_label_values(&["promoted"]).inc();
        Ok(fact.id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Fact>> {
        self.record_access(id).await
    }

    async fn query(&self, filters: &QueryFilters, limit: usize) -> Result<Vec<Fact>> {
        let mut facts = match filters.session_id.as_deref() {
            Some(session_id) => self.session_facts(session_id).await?,
            None => scan_typed(self.docs.as_ref(), FACTS, "", L2_SCAN_LIMIT).await?,
        };
        facts.retain(|f| {
            (filters.include_consolidated || !f.is_consolidated())
                && filters.min_score.map_or(true, |m| f.ciar_score() >= m)
                && filters.since.map_or(true, |s| f.source_timestamp >= s)
        });

        if let Some(query) = filters.embedding.as_deref() {
            let mut scored = Vec::with_capacity(facts.len());
            for fact in facts {
                let embedding = self.embedder.encode(&fact.content)?;
                scored.push((cosine_similarity(query, &embedding), fact));
            }
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            return Ok(scored.into_iter().take(limit).map(|(_, f)| f).collect());
        }

        facts.sort_by(|a, b| b.ciar_score().total_cmp(&a.ciar_score()));
        facts.truncate(limit);
        Ok(facts)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(session_id) = self.locate(id).await? else {
            return Ok(false);
        };
        let removed = self.docs.delete(FACTS, &Self::doc_id(&session_id, id)).await?;
        self.docs.delete(FACT_SESSIONS, id).await?;
        Ok(removed)
    }

    async fn health_check(&self) -> TierHealth {
        TierHealth::from_adapters(TierKind::Working, vec![self.docs.health_check().await])
    }

    /// Blend of semantic match and significance
    async fn context_candidates(&self, request: &ContextRequest) -> Result<Vec<ContextCandidate>> {
        let facts = self.session_facts(&request.session_id).await?;
        let mut candidates = Vec::with_capacity(facts.len());
        for fact in facts {
            let embedding = self.embedder.encode(&fact.content)?;
            let similarity = cosine_similarity(&request.embedding, &embedding).max(0.0);
            candidates.push(ContextCandidate {
                tier: TierKind::Working,
                id: fact.id.clone(),
                content: fact.content.clone(),
                score: 0.6 * similarity + 0.4 * fact.ciar_score(),
                timestamp: fact.source_timestamp,
            });
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(request.limit);
        Ok(candidates)
    }
}
