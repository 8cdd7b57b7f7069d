//! Lifecycle Tests
//!
//! Drives turns through the whole pipeline with a manual clock:
//! L1 turns -> promotion -> L2 facts -> consolidation -> L3 episodes
//! -> distillation -> L4 knowledge, then reads the result back.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use strata_memory::chrono::Duration;
use strata_memory::clock::{ManualClock, SharedClock};
use strata_memory::config::StrataConfig;
use strata_memory::embeddings::Embedder;
use strata_memory::llm::{LlmClient, LlmError, StructuredResult};
use strata_memory::memory::{MemoryOrchestrator, Role, StrataStores};
use strata_memory::resilience::CircuitState;
use strata_memory::tiers::{HealthStatus, MemoryTier, QueryFilters, TierKind};

/// Every text maps to the same direction, so facts of a session cluster
struct ConstantEmbedder;

impl Embedder for ConstantEmbedder {
    fn encode(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0, 0.0])
    }

    fn dimension(&self) -> usize {
        4
    }
}

/// LLM that fails every call
struct DownLlm;

#[async_trait]
impl LlmClient for DownLlm {
    async fn extract_structured(
        &self,
        _prompt: &str,
        _schema: &serde_json::Value,
        _timeout: StdDuration,
    ) -> Result<StructuredResult, LlmError> {
        Err(LlmError::Provider("connection refused".into()))
    }

    async fn generate_text(&self, _prompt: &str, _timeout: StdDuration) -> Result<String, LlmError> {
        Err(LlmError::Provider("connection refused".into()))
    }

    fn name(&self) -> &str {
        "down"
    }
}

const SESSIONS: [&str; 3] = ["s1", "s2", "s3"];

fn orchestrator(
    llm: Option<Arc<dyn LlmClient>>,
    configure: impl FnOnce(&mut StrataConfig),
) -> (MemoryOrchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let shared: SharedClock = clock.clone();
    let mut config = StrataConfig {
        auto_promote: false,
        ..StrataConfig::default()
    };
    configure(&mut config);
    let stores = StrataStores::in_memory(shared.clone()).expect("in-memory stores");
    let orchestrator =
        MemoryOrchestrator::new(config, stores, llm, Arc::new(ConstantEmbedder), shared)
            .expect("valid config");
    (orchestrator, clock)
}

async fn seed_sessions(orchestrator: &MemoryOrchestrator) {
    for session in SESSIONS {
        orchestrator
            .store_turn(session, Role::User, "I really prefer Python for data work.")
            .await
            .unwrap();
        orchestrator
            .store_turn(session, Role::User, "We have to ship Python services before the deadline.")
            .await
            .unwrap();
    }
}

// =============================================================================
// FULL PIPELINE
// =============================================================================

#[tokio::test]
async fn test_turns_flow_up_to_knowledge() {
    let (orchestrator, clock) = orchestrator(None, |_| {});
    seed_sessions(&orchestrator).await;

    // Partial batches wait until they are old enough
    let early = orchestrator.run_promotion_cycle().await.unwrap();
    assert_eq!(early.facts_promoted, 0);
    clock.advance(Duration::minutes(6));

    let promotion = orchestrator.run_promotion_cycle().await.unwrap();
    assert_eq!(promotion.sessions_scanned, 3);
    assert_eq!(promotion.turns_processed, 6);
    assert_eq!(promotion.facts_promoted, 6);
    assert!(promotion.failed_sessions.is_empty());

    let state = orchestrator.processing_state("s1").await.unwrap();
    assert_eq!(state.last_processed_turn_id, 2);
    assert_eq!(state.pending_turns, 0);
    assert!(state.last_consolidation_at.is_none());

    // Facts become eligible after the consolidation delay
    clock.advance(Duration::minutes(45));
    let consolidation = orchestrator.run_consolidation_cycle().await.unwrap();
    assert_eq!(consolidation.episodes_created, 3);
    assert_eq!(consolidation.facts_consolidated, 6);
    assert_eq!(consolidation.episodes_deferred, 0);

    let episodes = orchestrator
        .episodic()
        .query(&QueryFilters::for_session("s1"), 10)
        .await
        .unwrap();
    assert_eq!(episodes.len(), 1);
    let episode = &episodes[0];
    assert_eq!(episode.source_fact_ids.len(), 2);
    assert!(episode.entities.iter().any(|e| e == "Python"));
    assert!(episode.fact_valid_to.is_some());
    assert!(episode.fact_valid_from <= episode.fact_valid_to.unwrap());
    assert!(orchestrator.episodic().is_consistent(&episode.id).await.unwrap());

    let state = orchestrator.processing_state("s1").await.unwrap();
    assert!(state.last_consolidation_at.is_some());

    // Nothing left to consolidate
    let again = orchestrator.run_consolidation_cycle().await.unwrap();
    assert_eq!(again.episodes_created, 0);

    let distillation = orchestrator.run_distillation_cycle().await.unwrap();
    assert_eq!(distillation.episodes_scanned, 3);
    assert!(distillation.candidates_mined >= 1);
    assert_eq!(distillation.documents_created, 1);
    assert!(distillation.failed_patterns.is_empty());

    let documents = orchestrator.semantic().active_documents(10).await.unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].source_episode_ids.len(), 3);
    assert!(documents[0].confidence > 0.0 && documents[0].confidence <= 1.0);

    // A repeat cycle folds into the existing document
    let repeat = orchestrator.run_distillation_cycle().await.unwrap();
    assert_eq!(repeat.documents_created, 0);
    assert!(repeat.documents_updated >= 1);
    assert_eq!(orchestrator.semantic().active_documents(10).await.unwrap().len(), 1);

    let context = orchestrator
        .retrieve_context("s1", "Python deadline", None)
        .await;
    assert!(!context.degraded);
    for tier in [TierKind::Active, TierKind::Episodic, TierKind::Semantic] {
        assert!(
            context.items.iter().any(|item| item.tier == tier),
            "expected a {tier} item in {:?}",
            context.items
        );
    }
    assert!(context.used_chars <= orchestrator.config().retrieval.char_budget);
}

// =============================================================================
// LLM OUTAGE
// =============================================================================

#[tokio::test]
async fn test_llm_outage_falls_back_and_opens_breakers() {
    let llm: Arc<dyn LlmClient> = Arc::new(DownLlm);
    let (orchestrator, clock) = orchestrator(Some(llm), |config| {
        config.promotion.circuit_breaker.failure_threshold = 1;
        config.consolidation.circuit_breaker.failure_threshold = 1;
    });
    seed_sessions(&orchestrator).await;
    clock.advance(Duration::minutes(6));

    let promotion = orchestrator.run_promotion_cycle().await.unwrap();
    assert_eq!(promotion.facts_promoted, 6);
    assert_eq!(promotion.fallback_batches, 3);

    clock.advance(Duration::minutes(45));
    let consolidation = orchestrator.run_consolidation_cycle().await.unwrap();
    assert_eq!(consolidation.episodes_created, 3);
    assert_eq!(consolidation.fallback_summaries, 3);

    let health = orchestrator.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    let state_of = |name: &str| {
        health
            .breakers
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.state)
    };
    assert_eq!(state_of("llm.extraction"), Some(CircuitState::Open));
    assert_eq!(state_of("llm.summarization"), Some(CircuitState::Open));
    assert_eq!(state_of("llm.synthesis"), Some(CircuitState::Closed));
}
