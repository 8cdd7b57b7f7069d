//! LLM-backed batch extraction
//!
//! One structured-output call per batch of turns. The model sees each turn as
//! `[turn_id] role: content` and returns facts with certainty, impact,
//! entities, type and the turn range they came from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::{LlmClient, LlmError};
use crate::memory::types::{ExtractedUnit, FactType, Turn, TurnRange, UnitKind};

const EXTRACTION_INSTRUCTIONS: &str = "Extract durable facts about the user from the conversation below. \
Return JSON only. Each fact must be a standalone sentence. Rate certainty (how sure the statement is) \
and impact (how much it should change future answers) between 0 and 1. \
fact_type is one of: preference, constraint, instruction, identity, event, mention. \
kind is 'fact' or 'topic_segment' for a multi-turn discussion. \
source_turns is [first_turn_id, last_turn_id]. Skip small talk.";

/// Raw fact as returned by the model
#[derive(Debug, Deserialize)]
struct RawFact {
    content: String,
    #[serde(default)]
    certainty: Option<f32>,
    #[serde(default)]
    impact: Option<f32>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    fact_type: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    source_turns: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    facts: Vec<RawFact>,
}

/// JSON schema sent with every extraction request
pub fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": {"type": "string"},
                        "certainty": {"type": "number", "minimum": 0, "maximum": 1},
                        "impact": {"type": "number", "minimum": 0, "maximum": 1},
                        "entities": {"type": "array", "items": {"type": "string"}},
                        "fact_type": {"type": "string"},
                        "kind": {"type": "string"},
                        "source_turns": {"type": "array", "items": {"type": "integer"}}
                    },
                    "required": ["content"]
                }
            }
        },
        "required": ["facts"]
    })
}

pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    pub fn build_prompt(turns: &[Turn]) -> String {
        let mut prompt = String::from(EXTRACTION_INSTRUCTIONS);
        prompt.push_str("\n\nConversation:\n");
        for turn in turns {
            prompt.push_str(&format!("[{}] {}: {}\n", turn.turn_id, turn.role, turn.content));
        }
        prompt
    }

    /// Run one extraction call for the batch
    pub async fn extract(
        &self,
        turns: &[Turn],
        timeout: Duration,
    ) -> Result<Vec<ExtractedUnit>, LlmError> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = Self::build_prompt(turns);
        let schema = extraction_schema();
        let result = tokio::time::timeout(
            timeout,
            self.client.extract_structured(&prompt, &schema, timeout),
        )
        .await
        .map_err(|_| LlmError::Timeout(timeout))??;

        let raw: RawExtraction = serde_json::from_value(result.value)
            .map_err(|e| LlmError::InvalidOutput(e.to_string()))?;
        let units = Self::convert(raw.facts, turns);
        debug!(
            model = %result.model,
            turns = turns.len(),
            units = units.len(),
            "LLM extraction complete"
        );
        Ok(units)
    }

    fn convert(facts: Vec<RawFact>, turns: &[Turn]) -> Vec<ExtractedUnit> {
        let timestamps: HashMap<u64, DateTime<Utc>> =
            turns.iter().map(|t| (t.turn_id, t.timestamp)).collect();
        let first_id = turns.iter().map(|t| t.turn_id).min().unwrap_or(0);
        let last_id = turns.iter().map(|t| t.turn_id).max().unwrap_or(0);
        let batch_end = turns.iter().map(|t| t.timestamp).max().unwrap_or_else(Utc::now);

        facts
            .into_iter()
            .filter_map(|raw| {
                let content = raw.content.trim().to_string();
                if content.is_empty() {
                    return None;
                }

                // Ranges outside the batch fall back to the whole batch
                let range = match raw.source_turns.as_slice() {
                    [single] => TurnRange::single(*single),
                    [a, b, ..] => TurnRange::new(*a, *b),
                    [] => TurnRange::new(first_id, last_id),
                };
                let range = if range.first < first_id || range.last > last_id {
                    TurnRange::new(first_id, last_id)
                } else {
                    range
                };

                let observed_at = (range.first..=range.last)
                    .rev()
                    .find_map(|id| timestamps.get(&id).copied())
                    .unwrap_or(batch_end);

                let kind = match raw.kind.as_deref() {
                    Some("topic_segment") | Some("segment") => UnitKind::TopicSegment,
                    _ => UnitKind::Fact,
                };

                Some(ExtractedUnit {
                    content,
                    kind,
                    fact_type: raw
                        .fact_type
                        .as_deref()
                        .map(FactType::parse)
                        .unwrap_or(FactType::Mention),
                    certainty: unit_interval("certainty", raw.certainty),
                    impact: unit_interval("impact", raw.impact),
                    entities: raw
                        .entities
                        .into_iter()
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect(),
                    source_turn_range: range,
                    observed_at,
                })
            })
            .collect()
    }
}

/// Model-reported ratings outside [0, 1] are discarded so type defaults apply
fn unit_interval(field: &str, value: Option<f32>) -> Option<f32> {
    match value {
        Some(v) if (0.0..=1.0).contains(&v) => Some(v),
        Some(v) => {
            warn!(field, value = v, "Discarding out-of-range rating from LLM");
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StructuredResult;
    use crate::memory::types::Role;
    use async_trait::async_trait;

    struct CannedLlm(serde_json::Value);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn extract_structured(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            _timeout: Duration,
        ) -> Result<StructuredResult, LlmError> {
            Ok(StructuredResult {
                value: self.0.clone(),
                model: "canned".into(),
            })
        }

        async fn generate_text(&self, _prompt: &str, _timeout: Duration) -> Result<String, LlmError> {
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn turns() -> Vec<Turn> {
        let base = Utc::now();
        (1..=3)
            .map(|i| Turn {
                session_id: "s1".into(),
                turn_id: i,
                role: Role::User,
                content: format!("turn {i}"),
                timestamp: base + chrono::Duration::seconds(i as i64),
            })
            .collect()
    }

    #[test]
    fn test_prompt_lists_turns() {
        let prompt = LlmExtractor::build_prompt(&turns());
        assert!(prompt.contains("[2] user: turn 2"));
    }

    #[tokio::test]
    async fn test_converts_model_output() {
        let turns = turns();
        let llm = CannedLlm(serde_json::json!({
            "facts": [
                {"content": "User prefers Python", "certainty": 0.9, "impact": 0.8,
                 "entities": ["Python"], "fact_type": "preference", "source_turns": [2, 2]},
                {"content": "Bad rating", "certainty": 1.7, "source_turns": [9, 12]},
                {"content": "  "}
            ]
        }));
        let extractor = LlmExtractor::new(Arc::new(llm));
        let units = extractor.extract(&turns, Duration::from_secs(1)).await.unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].fact_type, FactType::Preference);
        assert_eq!(units[0].certainty, Some(0.9));
        assert_eq!(units[0].observed_at, turns[1].timestamp);

        assert_eq!(units[1].certainty, None);
        assert_eq!(units[1].source_turn_range, TurnRange::new(1, 3));
        assert_eq!(units[1].fact_type, FactType::Mention);
    }

    /// Ignores the timeout it is handed
    struct StalledLlm;

    #[async_trait]
    impl LlmClient for StalledLlm {
        async fn extract_structured(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            _timeout: Duration,
        ) -> Result<StructuredResult, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StructuredResult {
                value: serde_json::json!({"facts": []}),
                model: "stalled".into(),
            })
        }

        async fn generate_text(&self, _prompt: &str, _timeout: Duration) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_timeout_is_enforced_on_stalled_client() {
        let extractor = LlmExtractor::new(Arc::new(StalledLlm));
        let started = std::time::Instant::now();
        let err = extractor
            .extract(&turns(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(err, LlmError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_malformed_output_is_invalid() {
        let extractor = LlmExtractor::new(Arc::new(CannedLlm(serde_json::json!({"facts": "nope"}))));
        let err = extractor.extract(&turns(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidOutput(_)));
    }
}
