//! Memory orchestrator
//!
//! Owns one handle per tier and the three lifecycle engines. Write path:
//! `store_turn` appends to L1 and, once a session has a full batch waiting,
//! kicks off promotion in the background. Read path: `retrieve_context`
//! queries every enabled tier concurrently under a per-tier timeout,
//! min-max normalizes each tier's scores, weights them, and fills a
//! character budget. A tier that fails or times out is reported and
//! skipped; the read never fails as a whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::ciar::CiarScorer;
use super::consolidation::{ConsolidationEngine, ConsolidationReport, EpisodeSummarizer};
use super::distillation::{DistillationEngine, DistillationReport};
use super::episodes::EpisodeConsolidator;
use super::promotion::{PromotionEngine, PromotionReport};
use super::synthesis::KnowledgeSynthesizer;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, StrataConfig, TierWeights};
use crate::embeddings::Embedder;
use crate::errors::{MemoryError, Result};
use crate::extraction::FactExtractor;
use crate::llm::{GuardedLlm, LlmClient};
use crate::memory::types::{ProcessingState, Role, Turn};
use crate::metrics::{record_error, Timer, RETRIEVE_DURATION, TIER_QUERIES_TOTAL};
use crate::resilience::{CircuitBreakerRecord, SharedCircuitBreaker};
use crate::scheduler::{spawn_engine_loop, EngineExit, ShutdownSignal};
use crate::storage::{
    DocumentStore, FullTextStore, GraphStore, KvStore, MemoryDocumentStore, MemoryGraphStore,
    MemoryKv, MemoryVectorStore, RocksDocumentStore, TantivyStore, VectorStore,
};
use crate::tiers::{
    ActiveTier, ContextCandidate, ContextRequest, EpisodicTier, HealthStatus, MemoryTier,
    SemanticTier, TierHealth, TierKind, WorkingTier,
};

/// Scores closer than this are treated as equal during normalization
const NORMALIZE_EPSILON: f32 = 1e-6;

/// The five backing stores
#[derive(Clone)]
pub struct StrataStores {
    pub kv: Arc<dyn KvStore>,
    pub docs: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub fulltext: Arc<dyn FullTextStore>,
}

impl StrataStores {
    /// Everything in process memory
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        Ok(Self {
            kv: Arc::new(MemoryKv::new(clock)),
            docs: Arc::new(MemoryDocumentStore::new()),
            vectors: Arc::new(MemoryVectorStore::new()),
            graph: Arc::new(MemoryGraphStore::new()),
            fulltext: Arc::new(TantivyStore::in_ram()?),
        })
    }

    /// Durable documents (RocksDB) and full-text index (tantivy) under `path`
    pub fn embedded(path: &Path, clock: SharedClock) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(MemoryError::storage)?;
        Ok(Self {
            kv: Arc::new(MemoryKv::new(clock)),
            docs: Arc::new(RocksDocumentStore::open(&path.join("docs"))?),
            vectors: Arc::new(MemoryVectorStore::new()),
            graph: Arc::new(MemoryGraphStore::new()),
            fulltext: Arc::new(TantivyStore::open(&path.join("fulltext"))?),
        })
    }
}

/// One entry of an assembled context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub tier: TierKind,
    pub id: String,
    pub content: String,
    /// Tier-native relevance before normalization
    pub raw_score: f32,
    /// Normalized and weighted
    pub score: f32,
    pub timestamp: DateTime<Utc>,
}

/// How one tier answered a read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: TierKind,
    pub enabled: bool,
    pub candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub items: Vec<ContextItem>,
    /// At least one enabled tier failed or timed out
    pub degraded: bool,
    pub tiers: Vec<TierReport>,
    pub used_chars: usize,
}

impl RetrievedContext {
    /// Items rendered one per line, tagged with their tier
    pub fn as_text(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("[{}] {}", item.tier, item.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub tiers: Vec<TierHealth>,
    pub breakers: Vec<CircuitBreakerRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

fn weight_for(weights: &TierWeights, tier: TierKind) -> f32 {
    match tier {
        TierKind::Active => weights.l1,
        TierKind::Working => weights.l2,
        TierKind::Episodic => weights.l3,
        TierKind::Semantic => weights.l4,
    }
}

/// Min-max normalize one tier's candidates in place; a flat tier scores 1.0
fn normalize_scores(candidates: &[ContextCandidate]) -> Vec<f32> {
    let min = candidates.iter().map(|c| c.score).fold(f32::INFINITY, f32::min);
    let max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    candidates
        .iter()
        .map(|c| {
            if span.abs() < NORMALIZE_EPSILON {
                1.0
            } else {
                (c.score - min) / span
            }
        })
        .collect()
}

fn content_key(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub struct MemoryOrchestrator {
    config: StrataConfig,
    clock: SharedClock,
    embedder: Arc<dyn Embedder>,
    active: Arc<ActiveTier>,
    working: Arc<WorkingTier>,
    episodic: Arc<EpisodicTier>,
    semantic: Arc<SemanticTier>,
    promotion: Arc<PromotionEngine>,
    consolidation: ConsolidationEngine,
    distillation: DistillationEngine,
    breakers: Vec<SharedCircuitBreaker>,
}

impl MemoryOrchestrator {
    pub fn new(
        config: StrataConfig,
        stores: StrataStores,
        llm: Option<Arc<dyn LlmClient>>,
        embedder: Arc<dyn Embedder>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let scorer = CiarScorer::new(&config.ciar)?;

        let active = Arc::new(ActiveTier::new(
            stores.kv.clone(),
            stores.docs.clone(),
            clock.clone(),
            &config.tiers,
        ));
        let working = Arc::new(WorkingTier::new(
            stores.docs.clone(),
            scorer,
            embedder.clone(),
            clock.clone(),
            config.ciar.ciar_threshold,
            config.tiers.l2_ttl_days,
        ));
        let episodic = Arc::new(EpisodicTier::new(
            stores.vectors.clone(),
            stores.graph.clone(),
            stores.docs.clone(),
            stores.kv.clone(),
            &config.tiers,
        ));
        let semantic = Arc::new(SemanticTier::new(
            stores.docs.clone(),
            stores.fulltext.clone(),
            embedder.clone(),
            clock.clone(),
            config.distillation.similarity_dedup_threshold,
        ));

        let breaker = |name: &str, engine: &EngineConfig| {
            SharedCircuitBreaker::new(
                name,
                engine.circuit_breaker.clone().into(),
                stores.kv.clone(),
                clock.clone(),
            )
        };
        let extraction_breaker = breaker("llm.extraction", &config.promotion);
        let summary_breaker = breaker("llm.summarization", &config.consolidation);
        let synthesis_breaker = breaker("llm.synthesis", &config.distillation);
        let guarded = |breaker: &SharedCircuitBreaker, engine: &EngineConfig| {
            llm.clone()
                .map(|client| GuardedLlm::new(client, breaker.clone(), engine.llm_timeout()))
        };

        let promotion = Arc::new(PromotionEngine::new(
            active.clone(),
            working.clone(),
            FactExtractor::new(
                llm.clone(),
                extraction_breaker.clone(),
                config.promotion.llm_timeout(),
            ),
            stores.kv.clone(),
            stores.docs.clone(),
            clock.clone(),
            &config.promotion,
            &config.lifecycle,
        ));
        let consolidation = ConsolidationEngine::new(
            working.clone(),
            episodic.clone(),
            embedder.clone(),
            stores.kv.clone(),
            EpisodeConsolidator::new(config.clustering.clone(), config.ciar.high_significance),
            EpisodeSummarizer::new(
                guarded(&summary_breaker, &config.consolidation),
                config.lifecycle.summary_char_budget,
            ),
            clock.clone(),
            &config.consolidation,
            &config.lifecycle,
        );
        let distillation = DistillationEngine::new(
            episodic.clone(),
            semantic.clone(),
            embedder.clone(),
            KnowledgeSynthesizer::new(guarded(&synthesis_breaker, &config.distillation)),
            clock.clone(),
            &config.distillation,
            &config.lifecycle,
        );

        info!(
            llm = llm.is_some(),
            embedding_dim = embedder.dimension(),
            "Memory orchestrator ready"
        );
        Ok(Self {
            config,
            clock,
            embedder,
            active,
            working,
            episodic,
            semantic,
            promotion,
            consolidation,
            distillation,
            breakers: vec![extraction_breaker, summary_breaker, synthesis_breaker],
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn active(&self) -> &Arc<ActiveTier> {
        &self.active
    }

    pub fn working(&self) -> &Arc<WorkingTier> {
        &self.working
    }

    pub fn episodic(&self) -> &Arc<EpisodicTier> {
        &self.episodic
    }

    pub fn semantic(&self) -> &Arc<SemanticTier> {
        &self.semantic
    }

    pub fn promotion(&self) -> &Arc<PromotionEngine> {
        &self.promotion
    }

    pub fn breakers(&self) -> &[SharedCircuitBreaker] {
        &self.breakers
    }

    /// Append a turn to L1; fails only when L1 itself rejects the write
    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub async fn store_turn(&self, session_id: &str, role: Role, content: &str) -> Result<Turn> {
        let turn = self.active.append(session_id, role, content).await?;

        if self.config.auto_promote {
            match self.promotion.load_state(session_id).await {
                Ok(state) => {
                    let waiting = turn.turn_id.saturating_sub(state.last_processed_turn_id) as usize;
                    if waiting >= self.promotion.batch_size() {
                        let engine = self.promotion.clone();
                        let session = session_id.to_string();
                        debug!(session_id, waiting, "Full batch waiting, promoting in background");
                        tokio::spawn(async move {
                            if let Err(e) = engine.promote_session(&session, false).await {
                                record_error(&e, "promotion");
                                warn!(session_id = %session, error = %e, "Background promotion failed");
                            }
                        });
                    }
                }
                Err(e) => warn!(session_id, error = %e, "Could not read watermark, promotion left to the cycle"),
            }
        }
        Ok(turn)
    }

    async fn query_tier<T>(
        &self,
        tier: &T,
        request: &ContextRequest,
    ) -> (TierReport, Vec<ContextCandidate>)
    where
        T: MemoryTier + ?Sized,
    {
        let kind = tier.kind();
        let mut report = TierReport {
            tier: kind,
            enabled: self.config.retrieval.enabled_tiers[kind.index()],
            candidates: 0,
            error: None,
        };
        if !report.enabled {
            return (report, Vec::new());
        }

        let timeout = self.config.retrieval.tier_timeout();
        let outcome = tokio::time::timeout(timeout, tier.context_candidates(request)).await;
        let candidates = match outcome {
            Ok(Ok(candidates)) => {
                TIER_QUERIES_TOTAL.with_label_values(&[kind.label(), "ok"]).inc();
                candidates
            }
            Ok(Err(e)) => {
                TIER_QUERIES_TOTAL.with_label_values(&[kind.label(), "error"]).inc();
                record_error(&e, kind.label());
                warn!(tier = %kind, error = %e, "Tier query failed, continuing without it");
                report.error = Some(e.to_string());
                Vec::new()
            }
            Err(_) => {
                TIER_QUERIES_TOTAL.with_label_values(&[kind.label(), "timeout"]).inc();
                warn!(tier = %kind, timeout_ms = timeout.as_millis() as u64, "Tier query timed out");
                report.error = Some(format!("timed out after {}ms", timeout.as_millis()));
                Vec::new()
            }
        };
        report.candidates = candidates.len();
        (report, candidates)
    }

    /// Assemble context for `query` from every enabled tier
    #[instrument(skip(self, query, weights), fields(session_id = %session_id))]
    pub async fn retrieve_context(
        &self,
        session_id: &str,
        query: &str,
        weights: Option<TierWeights>,
    ) -> RetrievedContext {
        let _timer = Timer::new(RETRIEVE_DURATION.clone());
        let weights = weights.unwrap_or(self.config.retrieval.weights);

        let embedding = match self.embedder.encode(query) {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, similarity tiers get an empty vector");
                Vec::new()
            }
        };
        let request = ContextRequest {
            session_id: session_id.to_string(),
            query: query.to_string(),
            embedding,
            limit: self.config.retrieval.candidates_per_tier,
        };

        let (l1, l2, l3, l4) = tokio::join!(
            self.query_tier(self.active.as_ref(), &request),
            self.query_tier(self.working.as_ref(), &request),
            self.query_tier(self.episodic.as_ref(), &request),
            self.query_tier(self.semantic.as_ref(), &request),
        );

        let mut tiers = Vec::with_capacity(4);
        let mut ranked: Vec<ContextItem> = Vec::new();
        for (report, candidates) in [l1, l2, l3, l4] {
            let weight = weight_for(&weights, report.tier);
            if weight > 0.0 && !candidates.is_empty() {
                let normalized = normalize_scores(&candidates);
                ranked.extend(candidates.into_iter().zip(normalized).map(|(c, norm)| {
                    ContextItem {
                        tier: c.tier,
                        id: c.id,
                        content: c.content,
                        raw_score: c.score,
                        score: norm * weight,
                        timestamp: c.timestamp,
                    }
                }));
            }
            tiers.push(report);
        }

        // Ties go to the lower tier, then the newer item
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.tier.cmp(&b.tier))
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });

        let budget = self.config.retrieval.char_budget;
        let mut used_chars = 0;
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for item in ranked {
            let len = item.content.chars().count();
            if used_chars + len > budget || !seen.insert(content_key(&item.content)) {
                continue;
            }
            used_chars += len;
            items.push(item);
        }

        for item in items.iter().filter(|i| i.tier == TierKind::Working) {
            if let Err(e) = self.working.record_access(&item.id).await {
                warn!(fact_id = %item.id, error = %e, "Failed to record fact access");
            }
        }

        let degraded = tiers.iter().any(|t| t.error.is_some());
        debug!(
            items = items.len(),
            used_chars,
            degraded,
            "Context assembled"
        );
        RetrievedContext {
            items,
            degraded,
            tiers,
            used_chars,
        }
    }

    pub async fn run_promotion_cycle(&self) -> Result<PromotionReport> {
        self.promotion.run_cycle().await
    }

    pub async fn run_consolidation_cycle(&self) -> Result<ConsolidationReport> {
        self.consolidation.run_cycle().await
    }

    pub async fn run_distillation_cycle(&self) -> Result<DistillationReport> {
        self.distillation.run_cycle().await
    }

    /// Promotion watermark plus the last consolidation time
    pub async fn processing_state(&self, session_id: &str) -> Result<ProcessingState> {
        let mut state = self.promotion.processing_state(session_id).await?;
        state.last_consolidation_at = self.consolidation.last_consolidated(session_id).await?;
        Ok(state)
    }

    /// Per-tier and per-breaker status; a failing part degrades the report
    pub async fn health_check(&self) -> HealthReport {
        let tiers = vec![
            self.active.health_check().await,
            self.working.health_check().await,
            self.episodic.health_check().await,
            self.semantic.health_check().await,
        ];

        let mut problems = Vec::new();
        let mut breakers = Vec::with_capacity(self.breakers.len());
        for breaker in &self.breakers {
            match breaker.snapshot().await {
                Ok(record) => breakers.push(record),
                Err(e) => problems.push(format!("breaker {}: {e}", breaker.name())),
            }
        }

        let unhealthy = tiers
            .iter()
            .filter(|t| t.status == HealthStatus::Unhealthy)
            .count();
        let status = if unhealthy == tiers.len() {
            HealthStatus::Unhealthy
        } else if unhealthy > 0 || !problems.is_empty() || tiers.iter().any(|t| !t.is_healthy()) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            tiers,
            breakers,
            problems,
        }
    }

    /// Spawn the three engine loops on their configured intervals
    pub fn spawn_background(self: &Arc<Self>, shutdown: &ShutdownSignal) -> Vec<JoinHandle<EngineExit>> {
        let promotion = {
            let orchestrator = self.clone();
            spawn_engine_loop(
                "promotion",
                self.config.promotion.interval(),
                shutdown.clone(),
                move || {
                    let orchestrator = orchestrator.clone();
                    async move { orchestrator.run_promotion_cycle().await }
                },
            )
        };
        let consolidation = {
            let orchestrator = self.clone();
            spawn_engine_loop(
                "consolidation",
                self.config.consolidation.interval(),
                shutdown.clone(),
                move || {
                    let orchestrator = orchestrator.clone();
                    async move { orchestrator.run_consolidation_cycle().await }
                },
            )
        };
        let distillation = {
            let orchestrator = self.clone();
            spawn_engine_loop(
                "distillation",
                self.config.distillation.interval(),
                shutdown.clone(),
                move || {
                    let orchestrator = orchestrator.clone();
                    async move { orchestrator.run_distillation_cycle().await }
                },
            )
        };
        vec![promotion, consolidation, distillation]
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tier: TierKind, id: &str, score: f32) -> ContextCandidate {
        ContextCandidate {
            tier,
            id: id.into(),
            content: id.into(),
            score,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_spreads_to_unit_range() {
        let scores = normalize_scores(&[
            candidate(TierKind::Episodic, "a", 2.0),
            candidate(TierKind::Episodic, "b", 4.0),
            candidate(TierKind::Episodic, "c", 3.0),
        ]);
        assert_eq!(scores, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_flat_tier_normalizes_to_one() {
        let scores = normalize_scores(&[
            candidate(TierKind::Semantic, "a", 0.3),
            candidate(TierKind::Semantic, "b", 0.3),
        ]);
        assert_eq!(scores, vec![1.0, 1.0]);
    }

    #[test]
    fn test_content_key_ignores_case_and_spacing() {
        assert_eq!(content_key("User  likes\nPython"), content_key("user likes python"));
    }
}
