//! Promotion engine: L1 turns to L2 facts
//!
//! Per session the engine walks `idle -> batching -> extracting -> scoring
//! -> writing -> idle`. Turns past the session watermark are cut into
//! batches of `batch_size`; a trailing partial batch waits until its oldest
//! turn is older than `batch_max_age` (or the caller forces it). Each batch
//! costs one extraction call, every unit is CIAR-scored, and the results are
//! offered to L2, which rejects anything under threshold.
//!
//! The watermark (`ProcessingState`) advances after every written batch and
//! lives in the KV store under `state:{session}`, mirrored to the document
//! store so a restart with a cold KV resumes without reprocessing.

use chrono::Duration;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::record_cycle;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, LifecycleConfig};
use crate::errors::{ErrorRecord, MemoryError, Result};
use crate::extraction::{BatchMetadata, FactExtractor};
use crate::memory::types::{Fact, ProcessingState, Turn};
use crate::metrics::record_error;
use crate::resilience::{LeaseConfig, LeaseLock};
use crate::storage::{get_typed, kv_get_json, kv_set_json, put_typed, DocumentStore, KvStore};
use crate::tiers::{ActiveTier, MemoryTier, WorkingTier};

const PROCESSING_STATE: &str = "processing_state";

/// Where a session is in the promotion state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Batching,
    Extracting,
    Scoring,
    Writing,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Batching => "batching",
            SessionPhase::Extracting => "extracting",
            SessionPhase::Scoring => "scoring",
            SessionPhase::Writing => "writing",
        };
        f.write_str(name)
    }
}

/// Outcome of promoting one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPromotion {
    pub batches: usize,
    pub turns_processed: usize,
    pub units_extracted: usize,
    pub facts_promoted: usize,
    pub below_threshold: usize,
    pub units_rejected: usize,
    pub fallback_batches: usize,
    /// Turns left waiting for a full batch
    pub turns_waiting: usize,
    /// Another worker held the session
    pub skipped_locked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromotionReport {
    pub sessions_scanned: usize,
    pub sessions_promoted: usize,
    pub sessions_locked: usize,
    pub turns_processed: usize,
    pub units_extracted: usize,
    pub facts_promoted: usize,
    pub below_threshold: usize,
    pub units_rejected: usize,
    pub fallback_batches: usize,
    pub turns_expired: usize,
    pub failed_sessions: Vec<ErrorRecord>,
    pub duration_ms: u64,
}

impl PromotionReport {
    fn absorb(&mut self, session: SessionPromotion) {
        if session.skipped_locked {
            self.sessions_locked += 1;
        }
        if session.batches > 0 {
            self.sessions_promoted += 1;
        }
        self.turns_processed += session.turns_processed;
        self.units_extracted += session.units_extracted;
        self.facts_promoted += session.facts_promoted;
        self.below_threshold += session.below_threshold;
        self.units_rejected += session.units_rejected;
        self.fallback_batches += session.fallback_batches;
    }
}

impl fmt::Display for PromotionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sessions, {} turns, {} promoted, {} below threshold, {} failed",
            self.sessions_scanned,
            self.turns_processed,
            self.facts_promoted,
            self.below_threshold,
            self.failed_sessions.len()
        )
    }
}

pub struct PromotionEngine {
    active: Arc<ActiveTier>,
    working: Arc<WorkingTier>,
    extractor: FactExtractor,
    kv: Arc<dyn KvStore>,
    docs: Arc<dyn DocumentStore>,
    locks: LeaseLock,
    clock: SharedClock,
    phases: DashMap<String, SessionPhase>,
    batch_size: usize,
    batch_max_age: Duration,
    max_concurrent: usize,
}

impl PromotionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        active: Arc<ActiveTier>,
        working: Arc<WorkingTier>,
        extractor: FactExtractor,
        kv: Arc<dyn KvStore>,
        docs: Arc<dyn DocumentStore>,
        clock: SharedClock,
        engine: &EngineConfig,
        lifecycle: &LifecycleConfig,
    ) -> Self {
        Self {
            active,
            working,
            extractor,
            locks: LeaseLock::new(kv.clone(), LeaseConfig::default()),
            kv,
            docs,
            clock,
            phases: DashMap::new(),
            batch_size: engine.batch_size.max(1),
            batch_max_age: Duration::seconds(lifecycle.batch_max_age_secs.max(0)),
            max_concurrent: engine.max_concurrent_sessions.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn extractor(&self) -> &FactExtractor {
        &self.extractor
    }

    pub fn phase(&self, session_id: &str) -> SessionPhase {
        self.phases
            .get(session_id)
            .map_or(SessionPhase::Idle, |p| *p)
    }

    fn enter(&self, session_id: &str, phase: SessionPhase) {
        let previous = self.phases.insert(session_id.to_string(), phase);
        if previous != Some(phase) {
            debug!(session_id, %phase, "Promotion phase");
        }
    }

    fn state_key(session_id: &str) -> String {
        format!("state:{session_id}")
    }

    /// Stored watermark, falling back to the durable mirror
    pub async fn load_state(&self, session_id: &str) -> Result<ProcessingState> {
        if let Some(state) = kv_get_json(self.kv.as_ref(), &Self::state_key(session_id)).await? {
            return Ok(state);
        }
        Ok(get_typed(self.docs.as_ref(), PROCESSING_STATE, session_id)
            .await?
            .unwrap_or_else(|| ProcessingState::new(session_id)))
    }

    pub async fn save_state(&self, state: &ProcessingState) -> Result<()> {
        kv_set_json(self.kv.as_ref(), &Self::state_key(&state.session_id), state, None).await?;
        put_typed(self.docs.as_ref(), PROCESSING_STATE, &state.session_id, state).await
    }

    /// Watermark with a fresh count of turns still waiting
    pub async fn processing_state(&self, session_id: &str) -> Result<ProcessingState> {
        let mut state = self.load_state(session_id).await?;
        state.pending_turns = self
            .active
            .turns_after(session_id, state.last_processed_turn_id)
            .await?
            .len();
        Ok(state)
    }

    /// Promote one session; skipped when another worker holds it
    pub async fn promote_session(&self, session_id: &str, force: bool) -> Result<SessionPromotion> {
        let Some(guard) = self.locks.try_acquire(&format!("promotion:{session_id}")).await? else {
            debug!(session_id, "Session promotion already running elsewhere");
            return Ok(SessionPromotion {
                skipped_locked: true,
                ..Default::default()
            });
        };

        let result = self.promote_locked(session_id, force).await;
        self.enter(session_id, SessionPhase::Idle);
        if let Err(e) = guard.release().await {
            warn!(session_id, error = %e, "Failed to release promotion lease");
        }
        result
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn promote_locked(&self, session_id: &str, force: bool) -> Result<SessionPromotion> {
        let mut stats = SessionPromotion::default();
        let mut state = self.load_state(session_id).await?;
        let pending = self
            .active
            .turns_after(session_id, state.last_processed_turn_id)
            .await?;
        if pending.is_empty() {
            return Ok(stats);
        }
        self.enter(session_id, SessionPhase::Batching);

        let now = self.clock.now();
        let mut remaining = pending.len();
        for batch in pending.chunks(self.batch_size) {
            let partial = batch.len() < self.batch_size;
            if partial && !force && now - batch[0].timestamp < self.batch_max_age {
                stats.turns_waiting = batch.len();
                break;
            }

            self.promote_batch(session_id, batch, &mut stats).await?;

            remaining -= batch.len();
            if let Some(last) = batch.last() {
                state.last_processed_turn_id = last.turn_id;
            }
            state.last_promotion_at = Some(now);
            state.pending_turns = remaining;
            self.save_state(&state).await?;
            stats.batches += 1;
            stats.turns_processed += batch.len();
        }

        if stats.batches > 0 {
            info!(
                session_id,
                turns = stats.turns_processed,
                promoted = stats.facts_promoted,
                below_threshold = stats.below_threshold,
                watermark = state.last_processed_turn_id,
                "Promoted session turns"
            );
        }
        Ok(stats)
    }

    async fn promote_batch(&self, session_id: &str, batch: &[Turn], stats: &mut SessionPromotion) -> Result<()> {
        let now = self.clock.now();

        self.enter(session_id, SessionPhase::Extracting);
        let metadata = BatchMetadata {
            session_id: session_id.to_string(),
            now,
        };
        let outcome = self.extractor.extract(batch, &metadata).await?;
        if outcome.used_fallback() {
            stats.fallback_batches += 1;
        }
        stats.units_extracted += outcome.units.len();

        self.enter(session_id, SessionPhase::Scoring);
        let mut scored = Vec::with_capacity(outcome.units.len());
        for unit in outcome.units {
            match self.working.scorer().score(&unit, now, 0) {
                Ok(ciar) => scored.push(Fact::from_unit(session_id, unit, ciar, now)),
                Err(e) => {
                    record_error(&e, "promotion");
                    warn!(session_id, error = %e, "Dropping unit with out-of-contract scores");
                    stats.units_rejected += 1;
                }
            }
        }

        self.enter(session_id, SessionPhase::Writing);
        for fact in scored {
            match self.working.store(fact).await {
                Ok(_) => stats.facts_promoted += 1,
                Err(MemoryError::ThresholdNotMet { .. }) => stats.below_threshold += 1,
                Err(e) if e.is_fatal() => {
                    record_error(&e, "promotion");
                    warn!(session_id, error = %e, "L2 rejected fact");
                    stats.units_rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// One pass over every known session with bounded concurrency
    ///
    /// A failing session is recorded in the report and never aborts the
    /// others; its watermark stays put so the next cycle retries it.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<PromotionReport> {
        let started = Instant::now();
        let sessions = self.active.sessions().await?;
        let mut report = PromotionReport {
            sessions_scanned: sessions.len(),
            ..Default::default()
        };

        let results: Vec<(String, Result<SessionPromotion>)> = stream::iter(sessions)
            .map(|record| async move {
                let outcome = self.promote_session(&record.session_id, false).await;
                (record.session_id, outcome)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (session_id, outcome) in results {
            match outcome {
                Ok(stats) => report.absorb(stats),
                Err(e) => {
                    record_error(&e, "promotion");
                    warn!(session_id = %session_id, error = %e, "Session promotion failed");
                    report.failed_sessions.push(e.to_record(Some(&session_id)));
                }
            }
        }

        match self.active.expire(self.clock.now()).await {
            Ok(n) => report.turns_expired = n,
            Err(e) => warn!(error = %e, "L1 expiry sweep failed"),
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        record_cycle("promotion", started, report.failed_sessions.is_empty());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CircuitBreakerSettings, TierConfig};
    use crate::embeddings::HashEmbedder;
    use crate::memory::ciar::CiarScorer;
    use crate::memory::types::Role;
    use crate::resilience::SharedCircuitBreaker;
    use crate::storage::{MemoryDocumentStore, MemoryKv};
    use std::time::Duration as StdDuration;

    struct Fixture {
        clock: Arc<ManualClock>,
        active: Arc<ActiveTier>,
        working: Arc<WorkingTier>,
        engine: PromotionEngine,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(shared.clone()));
        let docs: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let active = Arc::new(ActiveTier::new(kv.clone(), docs.clone(), shared.clone(), &TierConfig::default()));
        let working = Arc::new(WorkingTier::new(
            docs.clone(),
            CiarScorer::default(),
            Arc::new(HashEmbedder::default()),
            shared.clone(),
            0.6,
            7,
        ));
        let breaker = SharedCircuitBreaker::new(
            "llm.extraction",
            CircuitBreakerSettings::default().into(),
            kv.clone(),
            shared.clone(),
        );
        let extractor = FactExtractor::new(None, breaker, StdDuration::from_secs(1));
        let engine_config = EngineConfig {
            batch_size,
            ..EngineConfig::promotion_defaults()
        };
        let engine = PromotionEngine::new(
            active.clone(),
            working.clone(),
            extractor,
            kv,
            docs,
            shared,
            &engine_config,
            &LifecycleConfig::default(),
        );
        Fixture {
            clock,
            active,
            working,
            engine,
        }
    }

    #[tokio::test]
    async fn test_full_batch_promotes_and_advances_watermark() {
        let f = fixture(2);
        f.active
            .append("s1", Role::User, "I really prefer Python for data work.")
            .await
            .unwrap();
        f.active.append("s1", Role::User, "hello there").await.unwrap();

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.turns_processed, 2);
        assert_eq!(report.facts_promoted, 1);

        let state = f.engine.processing_state("s1").await.unwrap();
        assert_eq!(state.last_processed_turn_id, 2);
        assert_eq!(state.pending_turns, 0);
        assert_eq!(f.working.session_facts("s1").await.unwrap().len(), 1);

        // Nothing new: the second cycle does no work
        let again = f.engine.run_cycle().await.unwrap();
        assert_eq!(again.turns_processed, 0);
        assert_eq!(f.engine.phase("s1"), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_age() {
        let f = fixture(10);
        f.active
            .append("s1", Role::User, "I can't eat peanuts at all.")
            .await
            .unwrap();

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.turns_processed, 0);
        assert_eq!(f.engine.processing_state("s1").await.unwrap().pending_turns, 1);

        f.clock.advance(Duration::minutes(10));
        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.turns_processed, 1);
        assert_eq!(report.facts_promoted, 1);
    }

    #[tokio::test]
    async fn test_forced_batch_without_facts_advances_watermark() {
        let f = fixture(1);
        f.active
            .append("s1", Role::User, "What about Kubernetes")
            .await
            .unwrap();
        let stats = f.engine.promote_session("s1", true).await.unwrap();
        assert_eq!(stats.facts_promoted, 0);
        assert!(f.working.session_facts("s1").await.unwrap().is_empty());
        assert_eq!(f.engine.load_state("s1").await.unwrap().last_processed_turn_id, 1);
    }

    #[tokio::test]
    async fn test_turns_that_left_the_window_are_still_promoted() {
        let f = fixture(50);
        f.active
            .append("s1", Role::User, "I am allergic to peanuts.")
            .await
            .unwrap();
        for i in 0..24 {
            f.active
                .append("s1", Role::Assistant, &format!("ok {i}"))
                .await
                .unwrap();
        }
        assert_eq!(f.active.recent_turns("s1").await.unwrap().len(), 20);

        let stats = f.engine.promote_session("s1", true).await.unwrap();
        assert_eq!(stats.turns_processed, 25);
        let facts = f.working.session_facts("s1").await.unwrap();
        assert!(facts.iter().any(|fact| fact.content.contains("peanuts")));
        assert_eq!(f.engine.load_state("s1").await.unwrap().last_processed_turn_id, 25);
    }
}
