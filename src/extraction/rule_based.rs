//! Deterministic rule-based extraction
//!
//! Used whenever the LLM path is unavailable. Each user or assistant sentence
//! is classified by keyword patterns; entities are capitalized spans and
//! all-caps acronyms. Turns that yield no facts but keep returning to the same
//! entity are folded into a topic segment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::constants::ASSISTANT_CERTAINTY_FACTOR;
use crate::memory::ciar::default_certainty_impact;
use crate::memory::types::{ExtractedUnit, FactType, Role, Turn, TurnRange, UnitKind};

static PREFERENCE_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static CONSTRAINT_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static INSTRUCTION_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static IDENTITY_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static EVENT_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static HEDGE_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static ENTITY_REGEX: OnceLock<regex::Regex> = OnceLock::new();
static SENTENCE_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn preference_regex() -> &'static regex::Regex {
    PREFERENCE_REGEX.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(i|we|you)\s+(really\s+|usually\s+|always\s+)?(prefer|like|love|enjoy|hate|dislike|favou?r)\b|\bmy\s+favou?rite\b",
        )
        .unwrap()
    })
}

fn constraint_regex() -> &'static regex::Regex {
    CONSTRAINT_REGEX.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(i|we)\s+(can't|cannot|can not|must not|mustn't|shouldn't|have to|need to|must)\b|\ballergic\b|\bbudget\b|\bdeadline\b|\bno later than\b",
        )
        .unwrap()
    })
}

fn instruction_regex() -> &'static regex::Regex {
    INSTRUCTION_REGEX.get_or_init(|| {
        regex::Regex::new(
            r"(?i)^\s*(please\s+)?(always|never|don't|do not|remember|make sure|from now on)\b",
        )
        .unwrap()
    })
}

fn identity_regex() -> &'static regex::Regex {
    IDENTITY_REGEX.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(my name is|call me|i am an?|i'm an?|i work (as|at|for|on)|i live in|i'm from|i am from|i was born)\b",
        )
        .unwrap()
    })
}

fn event_regex() -> &'static regex::Regex {
    EVENT_REGEX.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(tomorrow|tonight|next (week|month|year)|on (monday|tuesday|wednesday|thursday|friday|saturday|sunday)|meeting|appointment|flight|trip|scheduled|deadline is)\b",
        )
        .unwrap()
    })
}

fn hedge_regex() -> &'static regex::Regex {
    HEDGE_REGEX.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(maybe|perhaps|probably|might|i think|i guess|not sure|possibly)\b")
            .unwrap()
    })
}

fn entity_regex() -> &'static regex::Regex {
    ENTITY_REGEX.get_or_init(|| {
        regex::Regex::new(r"\b([A-Z][a-zA-Z0-9+#.]*[a-zA-Z0-9+#](?:\s+[A-Z][a-zA-Z0-9+#]*)*|[A-Z])\b")
            .unwrap()
    })
}

fn sentence_regex() -> &'static regex::Regex {
    SENTENCE_REGEX.get_or_init(|| regex::Regex::new(r"[^.!?\n]+[.!?]?").unwrap())
}

/// Capitalized words that are never entities on their own
const NON_ENTITIES: &[&str] = &[
    "I", "I'm", "I've", "I'd", "I'll", "A", "An", "The", "My", "We", "Our", "You", "Your", "It",
    "This", "That", "These", "Those", "Please", "Also", "And", "But", "So", "If", "When", "What",
    "Why", "How", "Where", "Who", "Yes", "No", "Ok", "Okay", "Sure", "Thanks", "Thank", "Hi",
    "Hello", "Hey", "Always", "Never", "Remember", "Maybe", "Perhaps", "Actually", "Just", "Let",
    "Can", "Could", "Would", "Should", "Do", "Don't", "Is", "Are", "Was", "Were", "Will",
];

/// Minimum turns that must mention an entity for a topic segment
const TOPIC_SEGMENT_MIN_TURNS: usize = 3;

/// Hedged statements keep this share of their certainty
const HEDGE_FACTOR: f32 = 0.7;

#[derive(Debug, Default, Clone)]
pub struct RuleBasedExtractor {
    _private: (),
}

impl RuleBasedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capitalized spans and acronyms, in order of first appearance
    pub fn extract_entities(&self, text: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for m in entity_regex().find_iter(text) {
            let span = m.as_str().trim_end_matches('.');
            let words: Vec<&str> = span
                .split_whitespace()
                .skip_while(|w| NON_ENTITIES.contains(w))
                .collect();
            if words.is_empty() {
                continue;
            }
            let candidate = words.join(" ");
            if candidate.len() < 2 || NON_ENTITIES.contains(&candidate.as_str()) {
                continue;
            }
            if seen.insert(candidate.to_lowercase()) {
                out.push(candidate);
            }
        }
        out
    }

    fn classify(&self, sentence: &str, entities: &[String]) -> Option<FactType> {
        if identity_regex().is_match(sentence) {
            Some(FactType::Identity)
        } else if instruction_regex().is_match(sentence) {
            Some(FactType::Instruction)
        } else if preference_regex().is_match(sentence) {
            Some(FactType::Preference)
        } else if constraint_regex().is_match(sentence) {
            Some(FactType::Constraint)
        } else if event_regex().is_match(sentence) {
            Some(FactType::Event)
        } else if !entities.is_empty() {
            Some(FactType::Mention)
        } else {
            None
        }
    }

    /// Extract units from a batch of turns
    pub fn extract(&self, turns: &[Turn]) -> Vec<ExtractedUnit> {
        let mut units = Vec::new();
        // entity (lowercase) -> (display form, turn ids without facts)
        let mut loose_mentions: BTreeMap<String, (String, Vec<&Turn>)> = BTreeMap::new();

        for turn in turns {
            let role_factor = match turn.role {
                Role::User => 1.0,
                Role::Assistant => ASSISTANT_CERTAINTY_FACTOR,
                Role::System | Role::Tool => continue,
            };

            let mut produced = false;
            let turn_entities = self.extract_entities(&turn.content);

            for sentence in sentence_regex().find_iter(&turn.content) {
                let sentence = sentence.as_str().trim();
                if sentence.split_whitespace().count() < 3 {
                    continue;
                }
                let entities = self.extract_entities(sentence);
                let Some(fact_type) = self.classify(sentence, &entities) else {
                    continue;
                };
                // Bare mentions only count from the user
                if fact_type == FactType::Mention && turn.role != Role::User {
                    continue;
                }

                let (base_certainty, _) = default_certainty_impact(fact_type);
                let mut certainty = base_certainty * role_factor;
                if hedge_regex().is_match(sentence) {
                    certainty *= HEDGE_FACTOR;
                }

                units.push(ExtractedUnit {
                    content: sentence.trim_end_matches(['.', '!']).trim().to_string(),
                    kind: UnitKind::Fact,
                    fact_type,
                    certainty: Some(certainty.clamp(0.0, 1.0)),
                    impact: None,
                    entities,
                    source_turn_range: TurnRange::single(turn.turn_id),
                    observed_at: turn.timestamp,
                });
                if fact_type != FactType::Mention {
                    produced = true;
                }
            }

            if !produced {
                for entity in turn_entities {
                    loose_mentions
                        .entry(entity.to_lowercase())
                        .or_insert_with(|| (entity.clone(), Vec::new()))
                        .1
                        .push(turn);
                }
            }
        }

        for (display, mention_turns) in loose_mentions.into_values() {
            if mention_turns.len() < TOPIC_SEGMENT_MIN_TURNS {
                continue;
            }
            let first = mention_turns.iter().map(|t| t.turn_id).min().unwrap_or(0);
            let last = mention_turns.iter().map(|t| t.turn_id).max().unwrap_or(0);
            let observed_at = mention_turns
                .iter()
                .map(|t| t.timestamp)
                .max()
                .unwrap_or_else(chrono::Utc::now);
            units.push(ExtractedUnit {
                content: format!("Extended discussion about {display}"),
                kind: UnitKind::TopicSegment,
                fact_type: FactType::Mention,
                certainty: None,
                impact: None,
                entities: vec![display],
                source_turn_range: TurnRange::new(first, last),
                observed_at,
            });
        }

        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(id: u64, role: Role, content: &str) -> Turn {
        Turn {
            session_id: "s1".into(),
            turn_id: id,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_entities() {
        let extractor = RuleBasedExtractor::new();
        let entities =
            extractor.extract_entities("I moved to New York and use Python with AWS daily.");
        assert_eq!(entities, vec!["New York", "Python", "AWS"]);
    }

    #[test]
    fn test_classifies_preference_and_constraint() {
        let extractor = RuleBasedExtractor::new();
        let units = extractor.extract(&[turn(
            1,
            Role::User,
            "I really prefer Python for data work. I can't use Java at my job.",
        )]);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].fact_type, FactType::Preference);
        assert_eq!(units[0].certainty, Some(0.8));
        assert_eq!(units[1].fact_type, FactType::Constraint);
        assert!(units[0].entities.contains(&"Python".to_string()));
    }

    #[test]
    fn test_assistant_and_hedge_lower_certainty() {
        let extractor = RuleBasedExtractor::new();
        let units = extractor.extract(&[
            turn(1, Role::Assistant, "I think you prefer dark mode in editors."),
            turn(2, Role::System, "My name is System Prompt."),
        ]);
        assert_eq!(units.len(), 1);
        let certainty = units[0].certainty.unwrap();
        assert!((certainty - 0.8 * 0.8 * 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_topic_segment_from_repeated_mentions() {
        let extractor = RuleBasedExtractor::new();
        let units = extractor.extract(&[
            turn(1, Role::User, "What about Kubernetes"),
            turn(2, Role::User, "is Kubernetes hard"),
            turn(3, Role::User, "ok, Kubernetes again"),
        ]);
        let segment = units
            .iter()
            .find(|u| u.kind == UnitKind::TopicSegment)
            .expect("topic segment");
        assert_eq!(segment.source_turn_range, TurnRange::new(1, 3));
        assert_eq!(segment.entities, vec!["Kubernetes"]);
    }
}
