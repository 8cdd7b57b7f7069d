//! Tier persistence tests
//!
//! Exercises the tiers against the embedded backends (RocksDB documents,
//! tantivy full-text) in a temp directory:
//! - L1 recovers its window from the durable copy after losing the KV fast path
//! - L2 facts and their access history survive a reopen
//! - L4 documents stay searchable across a reopen, archived ones do not

use std::sync::Arc;

use strata_memory::chrono::{Duration, Utc};
use strata_memory::clock::{Clock, ManualClock, SharedClock};
use strata_memory::config::TierConfig;
use strata_memory::embeddings::HashEmbedder;
use strata_memory::memory::{
    CiarScorer, ExtractedUnit, Fact, FactType, KnowledgeDocument, Role, TurnRange, UnitKind,
};
use strata_memory::storage::{DocumentStore, MemoryKv, RocksDocumentStore, TantivyStore};
use strata_memory::tiers::{
    ActiveTier, MemoryTier, QueryFilters, SemanticTier, WorkingTier,
};
use strata_memory::MemoryError;
use tempfile::TempDir;

// =============================================================================
// FIXTURES
// =============================================================================

fn open_docs(dir: &TempDir) -> Arc<dyn DocumentStore> {
    Arc::new(RocksDocumentStore::open(&dir.path().join("docs")).expect("open rocksdb"))
}

fn working_tier(docs: Arc<dyn DocumentStore>, clock: SharedClock) -> WorkingTier {
    WorkingTier::new(
        docs,
        CiarScorer::default(),
        Arc::new(HashEmbedder::default()),
        clock,
        0.6,
        7,
    )
}

fn preference(tier: &WorkingTier, session: &str, content: &str, certainty: f32, impact: f32) -> Fact {
    let now = Utc::now();
    let unit = ExtractedUnit {
        content: content.to_string(),
        kind: UnitKind::Fact,
        fact_type: FactType::Preference,
        certainty: Some(certainty),
        impact: Some(impact),
        entities: vec!["Python".to_string()],
        source_turn_range: TurnRange::single(1),
        observed_at: now,
    };
    let ciar = tier.scorer().score(&unit, now, 0).expect("in-range components");
    Fact::from_unit(session, unit, ciar, now)
}

fn knowledge(id: &str, title: &str, content: &str) -> KnowledgeDocument {
    let now = Utc::now();
    KnowledgeDocument {
        id: id.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        confidence: 0.7,
        source_episode_ids: vec!["ep_1".to_string()],
        entities: vec![],
        usefulness_score: 0.5,
        validation_count: 0,
        created_at: now,
        updated_at: now,
        last_validated: None,
        archived: false,
    }
}

// =============================================================================
// L1 ACTIVE CONTEXT
// =============================================================================

#[tokio::test]
async fn test_l1_window_recovers_from_durable_store() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let shared: SharedClock = clock.clone();
    let docs = open_docs(&dir);
    let config = TierConfig::default();

    let tier = ActiveTier::new(
        Arc::new(MemoryKv::new(shared.clone())),
        docs.clone(),
        shared.clone(),
        &config,
    );
    for i in 1..=25 {
        tier.append("s1", Role::User, &format!("message number {i}"))
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
    }

    let recent = tier.recent_turns("s1").await.unwrap();
    assert_eq!(recent.len(), 20);
    assert_eq!(recent.first().unwrap().turn_id, 6);
    assert_eq!(recent.last().unwrap().turn_id, 25);

    // A cold KV store, as after a cache restart
    let cold = ActiveTier::new(
        Arc::new(MemoryKv::new(shared.clone())),
        docs.clone(),
        shared.clone(),
        &config,
    );
    let recovered = cold.recent_turns("s1").await.unwrap();
    let ids: Vec<u64> = recovered.iter().map(|t| t.turn_id).collect();
    assert_eq!(ids, (6..=25).collect::<Vec<_>>());

    // Turn ids continue from the durable session record
    let next = cold.append("s1", Role::Assistant, "a reply").await.unwrap();
    assert_eq!(next.turn_id, 26);
    assert_eq!(cold.recent_turns("s1").await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_l1_turns_expire_after_ttl() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let shared: SharedClock = clock.clone();
    let tier = ActiveTier::new(
        Arc::new(MemoryKv::new(shared.clone())),
        open_docs(&dir),
        shared,
        &TierConfig::default(),
    );

    tier.append("s1", Role::User, "remember the milk").await.unwrap();
    clock.advance(Duration::hours(25));

    assert!(tier.recent_turns("s1").await.unwrap().is_empty());
    assert_eq!(tier.expire(clock.now()).await.unwrap(), 1);
}

// =============================================================================
// L2 WORKING MEMORY
// =============================================================================

#[tokio::test]
async fn test_l2_gate_and_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::starting_now());

    let fact_id = {
        let tier = working_tier(open_docs(&dir), clock.clone());

        // 0.9 * 0.8 = 0.72 passes the 0.6 gate
        let strong = preference(&tier, "s1", "User prefers Python for scripting", 0.9, 0.8);
        assert!((strong.ciar_score() - 0.72).abs() < 1e-3);
        let id = tier.store(strong).await.unwrap();

        let weak = preference(&tier, "s1", "User mentioned the weather", 0.5, 0.4);
        let err = tier.store(weak).await.unwrap_err();
        assert!(matches!(err, MemoryError::ThresholdNotMet { .. }));

        tier.retrieve(&id).await.unwrap();
        tier.retrieve(&id).await.unwrap();
        id
    };

    let reopened = working_tier(open_docs(&dir), clock);
    let fact = reopened.peek(&fact_id).await.unwrap().expect("fact survives reopen");
    assert_eq!(fact.access_count, 2);
    assert!(fact.ciar.recency_boost() > 1.0);
    assert_eq!(reopened.session_facts("s1").await.unwrap().len(), 1);
    assert_eq!(reopened.sessions_with_pending().await.unwrap(), vec!["s1"]);
}

#[tokio::test]
async fn test_l2_query_filters_by_score() {
    let dir = TempDir::new().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::starting_now());
    let tier = working_tier(open_docs(&dir), clock);

    tier.store(preference(&tier, "s1", "User prefers Python", 0.9, 0.8))
        .await
        .unwrap();
    tier.store(preference(&tier, "s1", "User likes green tea", 0.8, 0.8))
        .await
        .unwrap();

    let filters = QueryFilters {
        session_id: Some("s1".to_string()),
        min_score: Some(0.7),
        ..QueryFilters::default()
    };
    let facts = tier.query(&filters, 10).await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].content, "User prefers Python");
}

// =============================================================================
// L4 SEMANTIC MEMORY
// =============================================================================

#[tokio::test]
async fn test_l4_documents_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::starting_now());
    let open = |clock: SharedClock| {
        SemanticTier::new(
            open_docs(&dir),
            Arc::new(TantivyStore::open(&dir.path().join("fulltext")).expect("open index")),
            Arc::new(HashEmbedder::default()),
            clock,
            0.85,
        )
    };

    {
        let tier = open(clock.clone());
        tier.store(knowledge("kn_diet", "Diet", "User is vegetarian and avoids fish"))
            .await
            .unwrap();
        tier.store(knowledge("kn_lang", "Languages", "User writes Rust at work"))
            .await
            .unwrap();
        assert!(tier.archive("kn_lang").await.unwrap());
    }

    let tier = open(clock);
    let search = |text: &str| QueryFilters {
        text: Some(text.to_string()),
        ..QueryFilters::default()
    };
    let hits = tier.query(&search("vegetarian"), 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "kn_diet");

    assert!(tier.query(&search("Rust"), 5).await.unwrap().is_empty());
    let archived = tier.retrieve("kn_lang").await.unwrap().unwrap();
    assert!(archived.archived);
    assert_eq!(tier.active_documents(10).await.unwrap().len(), 1);
}

// =============================================================================
// RANDOMIZED INTERLEAVING
// =============================================================================

#[tokio::test]
async fn test_window_invariant_under_random_interleaving() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use strata_memory::storage::MemoryDocumentStore;

    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let config = TierConfig {
            l1_window_size: rng.gen_range(1..=8),
            ..TierConfig::default()
        };
        let tier = ActiveTier::new(
            Arc::new(MemoryKv::new(clock.clone())),
            Arc::new(MemoryDocumentStore::default()),
            clock,
            &config,
        );

        let sessions = ["a", "b", "c"];
        let mut appended = [0u64; 3];
        for _ in 0..rng.gen_range(10..60) {
            let s = rng.gen_range(0..sessions.len());
            let turn = tier
                .append(sessions[s], Role::User, &format!("turn {}", appended[s] + 1))
                .await
                .unwrap();
            appended[s] += 1;
            assert_eq!(turn.turn_id, appended[s]);
        }

        for (s, session) in sessions.iter().enumerate() {
            let ids: Vec<u64> = tier
                .recent_turns(session)
                .await
                .unwrap()
                .iter()
                .map(|t| t.turn_id)
                .collect();
            let expected_len = (appended[s] as usize).min(config.l1_window_size);
            assert_eq!(ids.len(), expected_len, "seed {seed} session {session}");
            let first = appended[s] + 1 - expected_len as u64;
            assert_eq!(ids, (first..=appended[s]).collect::<Vec<_>>());
        }
    }
}
