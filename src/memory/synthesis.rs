//! Knowledge synthesis: ranked pattern + evidence -> KnowledgeDocument

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::pattern_detection::{EpisodeEvidence, PatternCandidate};
use crate::constants::INITIAL_USEFULNESS;
use crate::errors::Result;
use crate::llm::GuardedLlm;
use crate::memory::types::KnowledgeDocument;

/// Evidence summaries included in a synthesis prompt
const MAX_PROMPT_EVIDENCE: usize = 12;

/// Support at which confidence reaches half its ceiling
const SUPPORT_HALF_CONFIDENCE: f32 = 2.0;

/// Synthesized document and whether the template produced it
#[derive(Debug, Clone)]
pub struct SynthesizedKnowledge {
    pub document: KnowledgeDocument,
    pub fallback: bool,
}

pub struct KnowledgeSynthesizer {
    llm: Option<GuardedLlm>,
}

impl KnowledgeSynthesizer {
    pub fn new(llm: Option<GuardedLlm>) -> Self {
        Self { llm }
    }

    /// Confidence from support size and evidence recency
    ///
    /// Explicit statements carry their own importance in place of support.
    pub fn confidence_for(candidate: &PatternCandidate, evidence: &[&EpisodeEvidence]) -> f32 {
        let recency_factor = 0.6 + 0.4 * candidate.recency.clamp(0.0, 1.0);
        let base = if candidate.is_explicit() && candidate.support == 1 {
            evidence
                .iter()
                .map(|ev| ev.episode.importance_score)
                .fold(0.0f32, f32::max)
        } else {
            let support = candidate.support as f32;
            support / (support + SUPPORT_HALF_CONFIDENCE)
        };
        (base * recency_factor).clamp(0.0, 1.0)
    }

    pub async fn synthesize(
        &self,
        candidate: &PatternCandidate,
        evidence: &[&EpisodeEvidence],
        now: DateTime<Utc>,
    ) -> Result<SynthesizedKnowledge> {
        let (title, content, fallback) = match self.with_llm(candidate, evidence).await? {
            Some((title, content)) => (title, content, false),
            None => {
                let (title, content) = template(candidate, evidence);
                (title, content, true)
            }
        };

        let document = KnowledgeDocument {
            id: format!("kn_{}", Uuid::new_v4().simple()),
            title,
            content,
            confidence: Self::confidence_for(candidate, evidence),
            source_episode_ids: candidate.episode_ids.clone(),
            entities: candidate.entities.clone(),
            usefulness_score: INITIAL_USEFULNESS,
            validation_count: 0,
            created_at: now,
            updated_at: now,
            last_validated: None,
            archived: false,
        };
        debug!(
            pattern = %candidate.signature,
            doc_id = %document.id,
            fallback,
            "Synthesized knowledge document"
        );
        Ok(SynthesizedKnowledge { document, fallback })
    }

    async fn with_llm(
        &self,
        candidate: &PatternCandidate,
        evidence: &[&EpisodeEvidence],
    ) -> Result<Option<(String, String)>> {
        let Some(llm) = &self.llm else {
            return Ok(None);
        };

        let schema = json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["title", "content"]
        });
        let mut prompt = format!(
            "These conversation episodes share a recurring pattern ({}). Write one general, \
             reusable statement of what they show about the user. Return JSON with a short \
             \"title\" and a \"content\" of at most three sentences.\n\nEpisodes:\n",
            candidate.label
        );
        for ev in evidence.iter().take(MAX_PROMPT_EVIDENCE) {
            prompt.push_str(&format!(
                "- [{}] {}\n",
                ev.episode.fact_valid_from.format("%Y-%m-%d"),
                ev.episode.summary
            ));
        }

        let Some(value) = llm.extract_structured(&prompt, &schema).await? else {
            return Ok(None);
        };
        let title = value.get("title").and_then(|v| v.as_str()).map(str::trim);
        let content = value.get("content").and_then(|v| v.as_str()).map(str::trim);
        match (title, content) {
            (Some(t), Some(c)) if !t.is_empty() && !c.is_empty() => {
                Ok(Some((t.to_string(), c.to_string())))
            }
            _ => {
                debug!(pattern = %candidate.signature, "Synthesis output missing fields, using template");
                Ok(None)
            }
        }
    }
}

/// Deterministic title and bulleted evidence
fn template(candidate: &PatternCandidate, evidence: &[&EpisodeEvidence]) -> (String, String) {
    let title = if candidate.is_explicit() && candidate.support == 1 {
        format!("Stated: {}", candidate.label)
    } else {
        format!("Recurring: {}", candidate.label)
    };

    let mut content = match (evidence.first(), evidence.last()) {
        (Some(first), Some(last)) if evidence.len() > 1 => format!(
            "Seen in {} episodes between {} and {}:\n",
            evidence.len(),
            first.episode.fact_valid_from.format("%Y-%m-%d"),
            last.episode.fact_valid_from.format("%Y-%m-%d")
        ),
        _ => String::new(),
    };
    let lines: Vec<String> = evidence
        .iter()
        .map(|ev| format!("- {}", ev.episode.summary.trim()))
        .collect();
    content.push_str(&lines.join("\n"));
    (title, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pattern_detection::PatternSignal;
    use crate::memory::types::{Episode, TimeWindow};
    use chrono::Duration;

    fn ev(id: &str, summary: &str, at: DateTime<Utc>, importance: f32) -> EpisodeEvidence {
        EpisodeEvidence {
            episode: Episode {
                id: id.into(),
                session_id: "s1".into(),
                summary: summary.into(),
                source_fact_ids: vec![format!("f_{id}")],
                entities: vec![],
                time_window: TimeWindow { start: at, end: at },
                fact_valid_from: at,
                fact_valid_to: Some(at),
                source_observation_timestamp: at,
                importance_score: importance,
                idempotency_key: format!("key_{id}"),
                refs: None,
            },
            embedding: vec![1.0],
            entities: vec![],
        }
    }

    fn candidate(ids: &[&str], signals: Vec<PatternSignal>, recency: f32) -> PatternCandidate {
        PatternCandidate {
            signature: "sig".into(),
            label: "Python".into(),
            signals,
            episode_ids: ids.iter().map(|s| s.to_string()).collect(),
            entities: vec!["Python".into()],
            support: ids.len(),
            frequency: 0.5,
            recency,
            confidence: 0.6,
            impact: 0.5,
            rank: 0.5,
        }
    }

    #[tokio::test]
    async fn test_template_fallback_without_llm() {
        let now = Utc::now();
        let evidence = [
            ev("e1", "Used Python for ETL", now - Duration::days(3), 0.5),
            ev("e2", "Wrote Python tests", now - Duration::days(1), 0.5),
        ];
        let refs: Vec<&EpisodeEvidence> = evidence.iter().collect();
        let signals = vec![PatternSignal::EntityCooccurrence {
            entities: vec!["Python".into()],
        }];

        let out = KnowledgeSynthesizer::new(None)
            .synthesize(&candidate(&["e1", "e2"], signals, 1.0), &refs, now)
            .await
            .unwrap();

        assert!(out.fallback);
        assert_eq!(out.document.title, "Recurring: Python");
        assert!(out.document.content.contains("- Used Python for ETL"));
        assert!(out.document.content.contains("- Wrote Python tests"));
        assert_eq!(out.document.source_episode_ids, vec!["e1", "e2"]);
        assert!(out.document.validate().is_ok());
    }

    #[test]
    fn test_confidence_grows_with_support_and_recency() {
        let now = Utc::now();
        let evidence: Vec<EpisodeEvidence> = (0..6)
            .map(|i| ev(&format!("e{i}"), "x", now, 0.5))
            .collect();
        let refs: Vec<&EpisodeEvidence> = evidence.iter().collect();
        let entity = || {
            vec![PatternSignal::EntityCooccurrence {
                entities: vec!["Python".into()],
            }]
        };

        let small = candidate(&["e0", "e1", "e2"], entity(), 1.0);
        let large = candidate(&["e0", "e1", "e2", "e3", "e4", "e5"], entity(), 1.0);
        let stale = candidate(&["e0", "e1", "e2"], entity(), 0.0);

        let c_small = KnowledgeSynthesizer::confidence_for(&small, &refs[..3]);
        let c_large = KnowledgeSynthesizer::confidence_for(&large, &refs);
        let c_stale = KnowledgeSynthesizer::confidence_for(&stale, &refs[..3]);

        assert!((c_small - 0.6).abs() < 1e-6);
        assert!(c_large > c_small);
        assert!(c_stale < c_small);
    }
}
