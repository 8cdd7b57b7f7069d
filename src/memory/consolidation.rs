//! Consolidation engine: L2 facts to L3 episodes
//!
//! Each cycle first retries episodes parked by an earlier failed dual write,
//! then for every session with unconsolidated facts:
//!
//! 1. select facts older than the consolidation delay
//! 2. cluster them into episode drafts
//! 3. summarize each draft (LLM, else truncated concatenation)
//! 4. embed the summary and dual-write the episode to L3
//! 5. stamp the source facts with the episode id
//!
//! A retryable write failure (lock contention, rolled-back dual write) parks
//! the episode in the pending set and leaves its facts unconsolidated; the
//! idempotency key keeps the retry from writing a second copy.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::episodes::{EmbeddedFact, EpisodeConsolidator, EpisodeDraft};
use super::record_cycle;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, LifecycleConfig};
use crate::embeddings::Embedder;
use crate::errors::{ErrorRecord, Result};
use crate::llm::GuardedLlm;
use crate::memory::types::{Episode, Fact};
use crate::metrics::record_error;
use crate::storage::{kv_get_json, kv_set_json, KvStore};
use crate::tiers::{EpisodicTier, MemoryTier, NewEpisode, WorkingTier};

const SUMMARY_INSTRUCTIONS: &str = "Summarize the following related statements from one \
conversation in one or two sentences. Keep names, numbers and dates. Reply with the summary only.";

/// Episode summaries with a deterministic fallback
pub struct EpisodeSummarizer {
    llm: Option<GuardedLlm>,
    char_budget: usize,
}

impl EpisodeSummarizer {
    pub fn new(llm: Option<GuardedLlm>, char_budget: usize) -> Self {
        Self {
            llm,
            char_budget: char_budget.max(16),
        }
    }

    /// Summary text and whether the fallback produced it
    pub async fn summarize(&self, facts: &[Fact]) -> Result<(String, bool)> {
        if let Some(llm) = &self.llm {
            let mut prompt = String::from(SUMMARY_INSTRUCTIONS);
            prompt.push_str("\n\n");
            for fact in facts {
                prompt.push_str("- ");
                prompt.push_str(fact.content.trim());
                prompt.push('\n');
            }
            if let Some(text) = llm.generate_text(&prompt).await? {
                return Ok((truncate_chars(text.trim(), self.char_budget), false));
            }
        }
        Ok((self.fallback_summary(facts), true))
    }

    /// Fact contents joined in time order, cut to the character budget
    pub fn fallback_summary(&self, facts: &[Fact]) -> String {
        let joined = facts
            .iter()
            .map(|f| f.content.trim().trim_end_matches('.'))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        truncate_chars(&joined, self.char_budget)
    }
}

fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let mut out: String = text.chars().take(budget.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConsolidation {
    pub facts_considered: usize,
    pub episodes_created: usize,
    pub singleton_episodes: usize,
    pub facts_consolidated: usize,
    pub episodes_deferred: usize,
    pub fallback_summaries: usize,
    pub failed_episodes: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub sessions_scanned: usize,
    pub facts_considered: usize,
    pub episodes_created: usize,
    pub singleton_episodes: usize,
    pub facts_consolidated: usize,
    pub episodes_deferred: usize,
    pub pending_retried: usize,
    pub pending_recovered: usize,
    pub fallback_summaries: usize,
    pub facts_expired: usize,
    pub failed_episodes: Vec<ErrorRecord>,
    pub failed_sessions: Vec<ErrorRecord>,
    pub duration_ms: u64,
}

impl ConsolidationReport {
    fn absorb(&mut self, session: SessionConsolidation) {
        self.facts_considered += session.facts_considered;
        self.episodes_created += session.episodes_created;
        self.singleton_episodes += session.singleton_episodes;
        self.facts_consolidated += session.facts_consolidated;
        self.episodes_deferred += session.episodes_deferred;
        self.fallback_summaries += session.fallback_summaries;
        self.failed_episodes.extend(session.failed_episodes);
    }
}

impl fmt::Display for ConsolidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sessions, {} facts, {} episodes, {} deferred, {} recovered",
            self.sessions_scanned,
            self.facts_considered,
            self.episodes_created,
            self.episodes_deferred,
            self.pending_recovered
        )
    }
}

pub struct ConsolidationEngine {
    working: Arc<WorkingTier>,
    episodic: Arc<EpisodicTier>,
    embedder: Arc<dyn Embedder>,
    kv: Arc<dyn KvStore>,
    consolidator: EpisodeConsolidator,
    summarizer: EpisodeSummarizer,
    clock: SharedClock,
    delay: Duration,
    max_concurrent: usize,
}

impl ConsolidationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        working: Arc<WorkingTier>,
        episodic: Arc<EpisodicTier>,
        embedder: Arc<dyn Embedder>,
        kv: Arc<dyn KvStore>,
        consolidator: EpisodeConsolidator,
        summarizer: EpisodeSummarizer,
        clock: SharedClock,
        engine: &EngineConfig,
        lifecycle: &LifecycleConfig,
    ) -> Self {
        Self {
            working,
            episodic,
            embedder,
            kv,
            consolidator,
            summarizer,
            clock,
            delay: Duration::minutes(lifecycle.consolidation_delay_minutes.max(0)),
            max_concurrent: engine.max_concurrent_sessions.max(1),
        }
    }

    fn consolidated_key(session_id: &str) -> String {
        format!("consolidated:{session_id}")
    }

    /// When the session last had an episode committed
    pub async fn last_consolidated(&self, session_id: &str) -> Result<Option<DateTime<Utc>>> {
        kv_get_json(self.kv.as_ref(), &Self::consolidated_key(session_id)).await
    }

    async fn commit(&self, new: NewEpisode) -> Result<String> {
        let session_id = new.episode.session_id.clone();
        let fact_ids = new.episode.source_fact_ids.clone();
        let episode_id = self.episodic.store(new).await?;
        self.working
            .mark_consolidated(&session_id, &fact_ids, &episode_id)
            .await?;
        Ok(episode_id)
    }

    /// Replay parked episodes; returns (retried, recovered) and the fact ids
    /// still held by episodes that remain parked
    async fn retry_pending(&self) -> Result<(usize, usize, HashSet<String>)> {
        let pending = self.episodic.pending().await?;
        let mut recovered = 0;
        let mut held = HashSet::new();
        for parked in &pending {
            let key = parked.episode.idempotency_key.clone();
            match self.commit(parked.clone()).await {
                Ok(episode_id) => {
                    self.episodic.clear_pending(&key).await?;
                    recovered += 1;
                    info!(episode_id = %episode_id, "Recovered parked episode");
                }
                Err(e) => {
                    record_error(&e, "consolidation");
                    warn!(
                        episode_id = %parked.episode.id,
                        error = %e,
                        "Parked episode still failing, keeping it for the next cycle"
                    );
                    held.extend(parked.episode.source_fact_ids.iter().cloned());
                }
            }
        }
        Ok((pending.len(), recovered, held))
    }

    fn episode_from(&self, draft: &EpisodeDraft, summary: String) -> Episode {
        let fact_ids = draft.fact_ids();
        let key = Episode::idempotency_key_for(&draft.session_id, &fact_ids);
        Episode {
            id: Episode::id_for_key(&key),
            session_id: draft.session_id.clone(),
            summary,
            source_fact_ids: fact_ids,
            entities: draft.entities.clone(),
            time_window: draft.time_window,
            fact_valid_from: draft.fact_valid_from,
            fact_valid_to: draft.fact_valid_to,
            source_observation_timestamp: self.clock.now(),
            importance_score: draft.importance,
            idempotency_key: key,
            refs: None,
        }
    }

    fn embed(&self, facts: Vec<Fact>) -> Result<Vec<EmbeddedFact>> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }
        let contents: Vec<&str> = facts.iter().map(|f| f.content.as_str()).collect();
        let embeddings = self.embedder.encode_batch(&contents)?;
        Ok(facts
            .into_iter()
            .zip(embeddings)
            .map(|(fact, embedding)| EmbeddedFact { fact, embedding })
            .collect())
    }

    /// Cluster and commit one session's eligible facts
    #[instrument(skip(self, held), fields(session_id = %session_id))]
    pub async fn consolidate_session(
        &self,
        session_id: &str,
        held: &HashSet<String>,
    ) -> Result<SessionConsolidation> {
        let now = self.clock.now();
        let mut stats = SessionConsolidation::default();

        let cutoff = now - self.delay;
        let facts: Vec<Fact> = self
            .working
            .unconsolidated(session_id, cutoff)
            .await?
            .into_iter()
            .filter(|f| !held.contains(&f.id))
            .collect();
        if facts.is_empty() {
            return Ok(stats);
        }
        stats.facts_considered = facts.len();

        let embedded = self.embed(facts)?;
        let fresh = self.embed(self.working.unsettled(session_id, cutoff).await?)?;

        for draft in self.consolidator.cluster(session_id, embedded, &fresh) {
            let (summary, fallback) = self.summarizer.summarize(&draft.facts).await?;
            if fallback {
                stats.fallback_summaries += 1;
            }
            let embedding = self.embedder.encode(&summary)?;
            let new = NewEpisode {
                episode: self.episode_from(&draft, summary),
                embedding,
            };

            match self.commit(new.clone()).await {
                Ok(_) => {
                    stats.episodes_created += 1;
                    stats.facts_consolidated += draft.facts.len();
                    if draft.singleton {
                        stats.singleton_episodes += 1;
                    }
                }
                Err(e) if e.is_retryable() => {
                    record_error(&e, "consolidation");
                    warn!(
                        episode_id = %new.episode.id,
                        error = %e,
                        "Episode write failed, parking it for the next cycle"
                    );
                    self.episodic.defer(&new).await?;
                    stats.episodes_deferred += 1;
                }
                Err(e) => {
                    record_error(&e, "consolidation");
                    warn!(episode_id = %new.episode.id, error = %e, "Episode rejected");
                    stats
                        .failed_episodes
                        .push(e.to_record(Some(&new.episode.id)));
                }
            }
        }

        if stats.episodes_created > 0 {
            kv_set_json(self.kv.as_ref(), &Self::consolidated_key(session_id), &now, None).await?;
        }
        debug!(
            session_id,
            episodes = stats.episodes_created,
            deferred = stats.episodes_deferred,
            "Session consolidated"
        );
        Ok(stats)
    }

    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<ConsolidationReport> {
        let started = Instant::now();
        let mut report = ConsolidationReport::default();

        let (retried, recovered, held) = self.retry_pending().await?;
        report.pending_retried = retried;
        report.pending_recovered = recovered;

        let sessions = self.working.sessions_with_pending().await?;
        report.sessions_scanned = sessions.len();

        let held = &held;
        let results: Vec<(String, Result<SessionConsolidation>)> = stream::iter(sessions)
            .map(|session_id| async move {
                let outcome = self.consolidate_session(&session_id, held).await;
                (session_id, outcome)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (session_id, outcome) in results {
            match outcome {
                Ok(stats) => report.absorb(stats),
                Err(e) => {
                    record_error(&e, "consolidation");
                    warn!(session_id = %session_id, error = %e, "Session consolidation failed");
                    report.failed_sessions.push(e.to_record(Some(&session_id)));
                }
            }
        }

        match self.working.expire(self.clock.now()).await {
            Ok(n) => report.facts_expired = n,
            Err(e) => warn!(error = %e, "L2 expiry sweep failed"),
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        record_cycle("consolidation", started, report.failed_sessions.is_empty());
        info!(%report, "Consolidation cycle finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{ClusteringConfig, TierConfig};
    use crate::memory::ciar::CiarScorer;
    use crate::memory::types::{CiarComponents, FactType, TurnRange, UnitKind};
    use crate::storage::{
        DocumentStore, KvStore, MemoryDocumentStore, MemoryGraphStore, MemoryKv, MemoryVectorStore,
    };

    struct SameVector;

    impl Embedder for SameVector {
        fn encode(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    fn fact(id: &str, content: &str, at: chrono::DateTime<chrono::Utc>) -> Fact {
        Fact {
            id: id.into(),
            session_id: "s1".into(),
            content: content.into(),
            kind: UnitKind::Fact,
            fact_type: FactType::Preference,
            ciar: CiarComponents::new(0.8, 0.8, 1.0, 1.0).unwrap(),
            entities: vec!["Python".into()],
            source_turn_range: TurnRange::single(1),
            access_count: 0,
            last_accessed: None,
            extracted_at: at,
            source_timestamp: at,
            consolidated_to_episode_id: None,
        }
    }

    #[test]
    fn test_fallback_summary_truncates() {
        let summarizer = EpisodeSummarizer::new(None, 20);
        let now = chrono::Utc::now();
        let summary = summarizer.fallback_summary(&[
            fact("a", "User prefers Python.", now),
            fact("b", "User writes data pipelines", now),
        ]);
        assert_eq!(summary.chars().count(), 20);
        assert_eq!(summary, "User prefers Pyth...");
    }

    #[tokio::test]
    async fn test_cycle_creates_episode_and_marks_facts() {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(shared.clone()));
        let docs: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let embedder: Arc<dyn Embedder> = Arc::new(SameVector);
        let working = Arc::new(WorkingTier::new(
            docs.clone(),
            CiarScorer::default(),
            embedder.clone(),
            shared.clone(),
            0.6,
            7,
        ));
        let episodic = Arc::new(EpisodicTier::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryGraphStore::new()),
            docs,
            kv.clone(),
            &TierConfig::default(),
        ));

        let t = clock.now();
        working.store(fact("f1", "User prefers Python", t)).await.unwrap();
        working
            .store(fact("f2", "User writes Python data pipelines", t))
            .await
            .unwrap();

        let engine = ConsolidationEngine::new(
            working.clone(),
            episodic.clone(),
            embedder,
            kv,
            EpisodeConsolidator::new(ClusteringConfig::default(), 0.8),
            EpisodeSummarizer::new(None, 200),
            shared,
            &EngineConfig::consolidation_defaults(),
            &LifecycleConfig::default(),
        );

        // Too fresh: left for promotion to settle
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.episodes_created, 0);

        clock.advance(Duration::minutes(45));
        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.episodes_created, 1);
        assert_eq!(report.facts_consolidated, 2);
        assert_eq!(report.fallback_summaries, 1);

        let f1 = working.peek("f1").await.unwrap().unwrap();
        let episode_id = f1.consolidated_to_episode_id.unwrap();
        let episode = episodic.retrieve(&episode_id).await.unwrap().unwrap();
        assert!(episode.is_committed());
        assert_eq!(episode.summary, "User prefers Python; User writes Python data pipelines");
        // Nothing related is still arriving, so the topic is closed
        assert_eq!(episode.fact_valid_from, t);
        assert_eq!(episode.fact_valid_to, Some(t));

        assert_eq!(engine.last_consolidated("s1").await.unwrap(), Some(clock.now()));

        let again = engine.run_cycle().await.unwrap();
        assert_eq!(again.facts_considered, 0);
    }
}
