//! Orchestrator Tests
//!
//! Read path behaviour of `MemoryOrchestrator`:
//! - tier weighting, character budget and duplicate suppression
//! - partial results when a tier fails or times out
//! - access tracking for L2 facts surfaced in context
//! - health rollup and background promotion from `store_turn`

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strata_memory::chrono::Utc;
use strata_memory::clock::system_clock;
use strata_memory::config::{StrataConfig, TierWeights};
use strata_memory::embeddings::HashEmbedder;
use strata_memory::memory::{
    ExtractedUnit, Fact, FactType, MemoryOrchestrator, Role, StrataStores, TurnRange, UnitKind,
};
use strata_memory::storage::{
    AdapterHealth, MemoryDocumentStore, MemoryGraphStore, MemoryKv, MemoryVectorStore,
    PayloadFilter, TantivyStore, VectorHit, VectorRecord, VectorStore,
};
use strata_memory::tiers::{HealthStatus, MemoryTier, TierKind};
use strata_memory::{MemoryError, Result};

// =============================================================================
// FIXTURES
// =============================================================================

const HEALTHY: u8 = 0;
const FAILING: u8 = 1;
const SLOW: u8 = 2;

/// Vector store whose reads can be made to fail or hang
#[derive(Default)]
struct FaultyVectors {
    inner: MemoryVectorStore,
    mode: AtomicU8,
}

impl FaultyVectors {
    fn with_mode(mode: u8) -> Arc<Self> {
        let store = Self::default();
        store.mode.store(mode, Ordering::SeqCst);
        Arc::new(store)
    }
}

#[async_trait]
impl VectorStore for FaultyVectors {
    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        self.inner.upsert(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        self.inner.get(id).await
    }

    async fn search(&self, query: &[f32], k: usize, filter: &PayloadFilter) -> Result<Vec<VectorHit>> {
        match self.mode.load(Ordering::SeqCst) {
            FAILING => Err(MemoryError::Storage("vector index offline".into())),
            SLOW => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.inner.search(query, k, filter).await
            }
            _ => self.inner.search(query, k, filter).await,
        }
    }

    async fn scan(&self, filter: &PayloadFilter, limit: usize) -> Result<Vec<VectorRecord>> {
        self.inner.scan(filter, limit).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn health_check(&self) -> AdapterHealth {
        match self.mode.load(Ordering::SeqCst) {
            FAILING => AdapterHealth::failed("vector:faulty", "index offline"),
            _ => AdapterHealth::ok("vector:faulty"),
        }
    }
}

fn create_orchestrator(
    vectors: Arc<FaultyVectors>,
    configure: impl FnOnce(&mut StrataConfig),
) -> MemoryOrchestrator {
    let clock = system_clock();
    let stores = StrataStores {
        kv: Arc::new(MemoryKv::new(clock.clone())),
        docs: Arc::new(MemoryDocumentStore::default()),
        vectors,
        graph: Arc::new(MemoryGraphStore::default()),
        fulltext: Arc::new(TantivyStore::in_ram().expect("in-ram index")),
    };
    let mut config = StrataConfig {
        auto_promote: false,
        ..StrataConfig::default()
    };
    configure(&mut config);
    MemoryOrchestrator::new(config, stores, None, Arc::new(HashEmbedder::default()), clock)
        .expect("valid config")
}

fn fact(orchestrator: &MemoryOrchestrator, session: &str, content: &str) -> Fact {
    let now = Utc::now();
    let unit = ExtractedUnit {
        content: content.to_string(),
        kind: UnitKind::Fact,
        fact_type: FactType::Preference,
        certainty: Some(0.9),
        impact: Some(0.8),
        entities: vec![],
        source_turn_range: TurnRange::single(1),
        observed_at: now,
    };
    let ciar = orchestrator
        .working()
        .scorer()
        .score(&unit, now, 0)
        .expect("in-range components");
    Fact::from_unit(session, unit, ciar, now)
}

// =============================================================================
// RANKING AND BUDGET
// =============================================================================

#[tokio::test]
async fn test_weights_select_tiers() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(HEALTHY), |_| {});
    for content in ["first turn here", "second turn here", "third turn here"] {
        orchestrator.store_turn("s1", Role::User, content).await.unwrap();
    }

    let context = orchestrator.retrieve_context("s1", "turn", None).await;
    assert!(!context.degraded);
    assert_eq!(context.tiers.len(), 4);
    assert_eq!(context.items.len(), 3);
    // Newest turn ranks first within L1
    assert!(context.items[0].content.contains("third"));
    assert!(context.as_text().starts_with("[l1] user: third turn here"));

    let muted = TierWeights {
        l1: 0.0,
        ..TierWeights::default()
    };
    let context = orchestrator.retrieve_context("s1", "turn", Some(muted)).await;
    assert!(context.items.is_empty());
    let l1 = context.tiers.iter().find(|t| t.tier == TierKind::Active).unwrap();
    assert_eq!(l1.candidates, 3);
}

#[tokio::test]
async fn test_budget_and_duplicate_suppression() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(HEALTHY), |config| {
        config.retrieval.char_budget = 40;
    });
    orchestrator.store_turn("s1", Role::User, "Short note about tea").await.unwrap();
    orchestrator.store_turn("s1", Role::User, "short  note about TEA").await.unwrap();
    orchestrator
        .store_turn("s1", Role::User, &"a much longer turn that cannot fit ".repeat(3))
        .await
        .unwrap();

    let context = orchestrator.retrieve_context("s1", "tea", None).await;
    assert_eq!(context.items.len(), 1);
    assert!(context.used_chars <= 40);
    assert_eq!(context.used_chars, context.items[0].content.chars().count());
}

// =============================================================================
// DEGRADED READS
// =============================================================================

#[tokio::test]
async fn test_failed_tier_degrades_but_returns_the_rest() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(FAILING), |_| {});
    orchestrator.store_turn("s1", Role::User, "hello there").await.unwrap();

    let context = orchestrator.retrieve_context("s1", "hello", None).await;
    assert!(context.degraded);
    assert_eq!(context.items.len(), 1);
    assert_eq!(context.items[0].tier, TierKind::Active);

    let l3 = context.tiers.iter().find(|t| t.tier == TierKind::Episodic).unwrap();
    assert!(l3.error.as_deref().unwrap().contains("offline"));
    let l1 = context.tiers.iter().find(|t| t.tier == TierKind::Active).unwrap();
    assert!(l1.error.is_none());
}

#[tokio::test]
async fn test_slow_tier_times_out() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(SLOW), |config| {
        config.retrieval.tier_timeout_ms = 50;
    });
    orchestrator.store_turn("s1", Role::User, "hello there").await.unwrap();

    let started = std::time::Instant::now();
    let context = orchestrator.retrieve_context("s1", "hello", None).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(context.degraded);
    assert_eq!(context.items.len(), 1);
    let l3 = context.tiers.iter().find(|t| t.tier == TierKind::Episodic).unwrap();
    assert!(l3.error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_disabled_tier_is_not_queried() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(FAILING), |config| {
        config.retrieval.enabled_tiers = [true, true, false, true];
    });
    orchestrator.store_turn("s1", Role::User, "hello there").await.unwrap();

    let context = orchestrator.retrieve_context("s1", "hello", None).await;
    assert!(!context.degraded);
    let l3 = context.tiers.iter().find(|t| t.tier == TierKind::Episodic).unwrap();
    assert!(!l3.enabled);
    assert_eq!(l3.candidates, 0);
}

// =============================================================================
// ACCESS TRACKING
// =============================================================================

#[tokio::test]
async fn test_surfaced_facts_record_access() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(HEALTHY), |_| {});
    let id = orchestrator
        .working()
        .store(fact(&orchestrator, "s1", "User prefers Python for scripting"))
        .await
        .unwrap();

    let context = orchestrator
        .retrieve_context("s1", "Python scripting", None)
        .await;
    assert!(context
        .items
        .iter()
        .any(|item| item.tier == TierKind::Working && item.id == id));

    let stored = orchestrator.working().peek(&id).await.unwrap().unwrap();
    assert_eq!(stored.access_count, 1);
    assert!(stored.last_accessed.is_some());
}

// =============================================================================
// HEALTH AND WRITE PATH
// =============================================================================

#[tokio::test]
async fn test_health_rollup() {
    let healthy = create_orchestrator(FaultyVectors::with_mode(HEALTHY), |_| {});
    let report = healthy.health_check().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.tiers.len(), 4);
    assert_eq!(report.breakers.len(), 3);
    assert!(report.problems.is_empty());

    let degraded = create_orchestrator(FaultyVectors::with_mode(FAILING), |_| {});
    let report = degraded.health_check().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    let l3 = report.tiers.iter().find(|t| t.tier == TierKind::Episodic).unwrap();
    assert_eq!(l3.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_store_turn_rejects_empty_content() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(HEALTHY), |_| {});
    let err = orchestrator.store_turn("s1", Role::User, "   ").await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_full_batch_promotes_in_background() {
    let orchestrator = create_orchestrator(FaultyVectors::with_mode(HEALTHY), |config| {
        config.auto_promote = true;
    });
    for i in 0..10 {
        orchestrator
            .store_turn("s1", Role::User, &format!("I really prefer Python for task {i}."))
            .await
            .unwrap();
    }

    let mut promoted = false;
    for _ in 0..100 {
        let state = orchestrator.processing_state("s1").await.unwrap();
        if state.last_processed_turn_id == 10 {
            promoted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(promoted, "background promotion never advanced the watermark");
    assert_eq!(orchestrator.working().session_facts("s1").await.unwrap().len(), 10);
}
