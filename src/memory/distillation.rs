//! Distillation engine: L3 episodes to L4 knowledge
//!
//! A cycle mines patterns over the lookback window, synthesizes each one
//! into a document (deduplicated against L4), then walks existing documents:
//! documents due for validation are checked against episodes observed since
//! they were last validated, and documents that stay unsupported long enough
//! to fall under the usefulness floor are archived.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::pattern_detection::{EpisodeEvidence, PatternCandidate, PatternMiner};
use super::record_cycle;
use super::synthesis::KnowledgeSynthesizer;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, LifecycleConfig};
use crate::constants::{USEFULNESS_PENALTY, USEFULNESS_REWARD, VALIDATION_SUPPORT_SIMILARITY};
use crate::embeddings::Embedder;
use crate::errors::{ErrorRecord, Result};
use crate::memory::types::KnowledgeDocument;
use crate::metrics::record_error;
use crate::similarity::cosine_similarity;
use crate::tiers::{EpisodicTier, SemanticTier, UpsertOutcome};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistillationReport {
    pub episodes_scanned: usize,
    pub candidates_mined: usize,
    pub documents_created: usize,
    pub documents_updated: usize,
    pub fallback_syntheses: usize,
    pub documents_validated: usize,
    pub documents_supported: usize,
    pub documents_penalized: usize,
    pub documents_archived: usize,
    pub failed_patterns: Vec<ErrorRecord>,
    pub duration_ms: u64,
}

impl fmt::Display for DistillationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} episodes, {} patterns, {} created, {} updated, {} validated, {} archived",
            self.episodes_scanned,
            self.candidates_mined,
            self.documents_created,
            self.documents_updated,
            self.documents_validated,
            self.documents_archived
        )
    }
}

pub struct DistillationEngine {
    episodic: Arc<EpisodicTier>,
    semantic: Arc<SemanticTier>,
    embedder: Arc<dyn Embedder>,
    miner: PatternMiner,
    synthesizer: KnowledgeSynthesizer,
    clock: SharedClock,
    lookback: Duration,
    validation_window: Duration,
    usefulness_floor: f32,
    archive_after: Duration,
}

impl DistillationEngine {
    pub fn new(
        episodic: Arc<EpisodicTier>,
        semantic: Arc<SemanticTier>,
        embedder: Arc<dyn Embedder>,
        synthesizer: KnowledgeSynthesizer,
        clock: SharedClock,
        engine: &EngineConfig,
        lifecycle: &LifecycleConfig,
    ) -> Self {
        Self {
            episodic,
            semantic,
            embedder,
            miner: PatternMiner::new(engine.min_episode_support),
            synthesizer,
            clock,
            lookback: Duration::days(lifecycle.lookback_days.max(1)),
            validation_window: Duration::days(lifecycle.validation_window_days.max(1)),
            usefulness_floor: lifecycle.usefulness_floor,
            archive_after: Duration::days(lifecycle.archive_after_days.max(1)),
        }
    }

    /// Committed episodes in the lookback window with their graph entities
    pub async fn gather_evidence(&self, now: DateTime<Utc>) -> Result<Vec<EpisodeEvidence>> {
        let episodes = self.episodic.episodes_since(now - self.lookback).await?;
        let mut evidence = Vec::with_capacity(episodes.len());
        for (episode, embedding) in episodes {
            let mut entities = episode.entities.clone();
            match self.episodic.linked_entities(&episode.id).await {
                Ok(linked) => {
                    for name in linked {
                        if !entities.iter().any(|e| e.eq_ignore_ascii_case(&name)) {
                            entities.push(name);
                        }
                    }
                }
                Err(e) => warn!(episode_id = %episode.id, error = %e, "Graph entity lookup failed"),
            }
            evidence.push(EpisodeEvidence {
                episode,
                embedding,
                entities,
            });
        }
        Ok(evidence)
    }

    /// Synthesize one pattern and fold it into L4
    #[instrument(skip_all, fields(pattern = %candidate.signature))]
    pub async fn distill_pattern(
        &self,
        candidate: &PatternCandidate,
        by_id: &HashMap<&str, &EpisodeEvidence>,
    ) -> Result<(UpsertOutcome, bool)> {
        let supporting: Vec<&EpisodeEvidence> = candidate
            .episode_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();
        let synthesized = self
            .synthesizer
            .synthesize(candidate, &supporting, self.clock.now())
            .await?;
        let outcome = self.semantic.upsert_deduplicated(synthesized.document).await?;
        Ok((outcome, synthesized.fallback))
    }

    fn is_supported(
        &self,
        doc: &KnowledgeDocument,
        doc_embedding: &[f32],
        fresh: &[&EpisodeEvidence],
    ) -> bool {
        fresh.iter().any(|ev| {
            doc.source_episode_ids.contains(&ev.episode.id)
                || cosine_similarity(doc_embedding, &ev.embedding) >= VALIDATION_SUPPORT_SIMILARITY
        })
    }

    /// Re-check documents due for validation, then archive stale ones
    async fn maintain_documents(
        &self,
        evidence: &[EpisodeEvidence],
        now: DateTime<Utc>,
        report: &mut DistillationReport,
    ) -> Result<()> {
        for mut doc in self.semantic.active_documents(usize::MAX).await? {
            let validated_at = doc.last_validated.unwrap_or(doc.created_at);

            if now - doc.updated_at.max(validated_at) >= self.validation_window {
                report.documents_validated += 1;
                let fresh: Vec<&EpisodeEvidence> = evidence
                    .iter()
                    .filter(|ev| ev.episode.source_observation_timestamp > validated_at)
                    .collect();
                let embedding = self.embedder.encode(&doc.comparison_text())?;

                if self.is_supported(&doc, &embedding, &fresh) {
                    doc.usefulness_score = (doc.usefulness_score + USEFULNESS_REWARD).min(1.0);
                    doc.validation_count = doc.validation_count.saturating_add(1);
                    doc.last_validated = Some(now);
                    report.documents_supported += 1;
                } else {
                    doc.usefulness_score = (doc.usefulness_score - USEFULNESS_PENALTY).max(0.0);
                    report.documents_penalized += 1;
                }
                doc.updated_at = now;
                self.semantic.update(&doc).await?;
                debug!(
                    doc_id = %doc.id,
                    usefulness = doc.usefulness_score,
                    "Knowledge document validated"
                );
            }

            let unvalidated_for = now - doc.last_validated.unwrap_or(doc.created_at);
            if doc.usefulness_score < self.usefulness_floor
                && unvalidated_for >= self.archive_after
                && self.semantic.archive(&doc.id).await?
            {
                report.documents_archived += 1;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<DistillationReport> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = DistillationReport::default();

        let evidence = self.gather_evidence(now).await?;
        report.episodes_scanned = evidence.len();

        let candidates = self.miner.mine(&evidence, now);
        report.candidates_mined = candidates.len();

        let by_id: HashMap<&str, &EpisodeEvidence> = evidence
            .iter()
            .map(|ev| (ev.episode.id.as_str(), ev))
            .collect();

        for candidate in &candidates {
            match self.distill_pattern(candidate, &by_id).await {
                Ok((outcome, fallback)) => {
                    match outcome {
                        UpsertOutcome::Created { .. } => report.documents_created += 1,
                        UpsertOutcome::Updated { .. } => report.documents_updated += 1,
                    }
                    if fallback {
                        report.fallback_syntheses += 1;
                    }
                }
                Err(e) => {
                    record_error(&e, "distillation");
                    warn!(pattern = %candidate.signature, error = %e, "Pattern distillation failed");
                    report
                        .failed_patterns
                        .push(e.to_record(Some(&candidate.signature)));
                }
            }
        }

        let maintained = self.maintain_documents(&evidence, now, &mut report).await;
        if let Err(e) = &maintained {
            record_error(e, "distillation");
            warn!(error = %e, "Knowledge validation pass failed");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        record_cycle(
            "distillation",
            started,
            report.failed_patterns.is_empty() && maintained.is_ok(),
        );
        info!(%report, "Distillation cycle finished");
        Ok(report)
    }
}
