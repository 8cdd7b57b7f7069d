//! Type definitions for the memory system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::errors::{MemoryError, Result};

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One conversational turn (L1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: String,
    /// Monotonic per session, starting at 1
    pub turn_id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// CIAR
// =============================================================================

#[derive(Deserialize)]
struct CiarComponentsRaw {
    certainty: f32,
    impact: f32,
    age_decay: f32,
    recency_boost: f32,
}

impl TryFrom<CiarComponentsRaw> for CiarComponents {
    type Error = MemoryError;

    fn try_from(raw: CiarComponentsRaw) -> Result<Self> {
        CiarComponents::new(raw.certainty, raw.impact, raw.age_decay, raw.recency_boost)
    }
}

/// Certainty x Impact x Age-decay x Recency-boost
///
/// Components are validated on construction and the score is always derived
/// from them, so a stored score can never drift from its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CiarComponentsRaw")]
pub struct CiarComponents {
    certainty: f32,
    impact: f32,
    age_decay: f32,
    recency_boost: f32,
}

impl CiarComponents {
    pub fn new(certainty: f32, impact: f32, age_decay: f32, recency_boost: f32) -> Result<Self> {
        check_unit("certainty", certainty)?;
        check_unit("impact", impact)?;
        check_unit("age_decay", age_decay)?;
        if !recency_boost.is_finite() || recency_boost < 0.0 {
            return Err(MemoryError::validation(
                "recency_boost",
                format!("{recency_boost} must be a finite value >= 0"),
            ));
        }
        Ok(Self {
            certainty,
            impact,
            age_decay,
            recency_boost,
        })
    }

    pub fn certainty(&self) -> f32 {
        self.certainty
    }

    pub fn impact(&self) -> f32 {
        self.impact
    }

    pub fn age_decay(&self) -> f32 {
        self.age_decay
    }

    pub fn recency_boost(&self) -> f32 {
        self.recency_boost
    }

    /// Product of the components, clamped to [0, 1]
    pub fn score(&self) -> f32 {
        (self.certainty * self.impact * self.age_decay * self.recency_boost).clamp(0.0, 1.0)
    }

    /// Same components with a new recency boost
    pub fn with_recency_boost(self, recency_boost: f32) -> Result<Self> {
        Self::new(self.certainty, self.impact, self.age_decay, recency_boost)
    }

    /// Same components with a new age decay
    pub fn with_age_decay(self, age_decay: f32) -> Result<Self> {
        Self::new(self.certainty, self.impact, age_decay, self.recency_boost)
    }
}

fn check_unit(field: &str, value: f32) -> Result<()> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(MemoryError::validation(
            field,
            format!("{value} is outside [0, 1]"),
        ));
    }
    Ok(())
}

// =============================================================================
// EXTRACTION OUTPUT
// =============================================================================

/// Semantic category of an extracted unit; drives default certainty/impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Preference,
    Constraint,
    Instruction,
    Identity,
    Event,
    Mention,
}

impl FactType {
    /// Lenient parse of model output; unknown labels become `Mention`
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "preference" | "like" | "dislike" => FactType::Preference,
            "constraint" | "requirement" | "limitation" => FactType::Constraint,
            "instruction" | "directive" | "rule" => FactType::Instruction,
            "identity" | "entity" | "personal" | "profile" => FactType::Identity,
            "event" | "plan" | "schedule" => FactType::Event,
            _ => FactType::Mention,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::Preference => "preference",
            FactType::Constraint => "constraint",
            FactType::Instruction => "instruction",
            FactType::Identity => "identity",
            FactType::Event => "event",
            FactType::Mention => "mention",
        }
    }
}

/// Granularity of an extracted unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Fact,
    TopicSegment,
}

/// Inclusive range of source turn ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRange {
    pub first: u64,
    pub last: u64,
}

impl TurnRange {
    pub fn single(turn_id: u64) -> Self {
        Self {
            first: turn_id,
            last: turn_id,
        }
    }

    pub fn new(a: u64, b: u64) -> Self {
        Self {
            first: a.min(b),
            last: a.max(b),
        }
    }
}

/// Unit produced by the extractor, not yet scored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedUnit {
    pub content: String,
    pub kind: UnitKind,
    pub fact_type: FactType,
    /// `None` falls back to the per-type default
    pub certainty: Option<f32>,
    pub impact: Option<f32>,
    pub entities: Vec<String>,
    pub source_turn_range: TurnRange,
    /// Timestamp of the newest source turn
    pub observed_at: DateTime<Utc>,
}

// =============================================================================
// L2 FACT
// =============================================================================

/// Scored unit held in working memory (L2)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub kind: UnitKind,
    pub fact_type: FactType,
    pub ciar: CiarComponents,
    pub entities: Vec<String>,
    pub source_turn_range: TurnRange,
    pub access_count: u32,
    pub last_accessed: Option<DateTime<Utc>>,
    pub extracted_at: DateTime<Utc>,
    /// When the underlying statement was made
    pub source_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub consolidated_to_episode_id: Option<String>,
}

impl Fact {
    /// Build a fact from a scored unit; the id is stable for the same
    /// session, source turns and content so re-extraction is idempotent
    pub fn from_unit(
        session_id: &str,
        unit: ExtractedUnit,
        ciar: CiarComponents,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        let id = Self::stable_id(session_id, unit.source_turn_range, &unit.content);
        Self {
            id,
            session_id: session_id.to_string(),
            content: unit.content,
            kind: unit.kind,
            fact_type: unit.fact_type,
            ciar,
            entities: unit.entities,
            source_turn_range: unit.source_turn_range,
            access_count: 0,
            last_accessed: None,
            extracted_at,
            source_timestamp: unit.observed_at,
            consolidated_to_episode_id: None,
        }
    }

    pub fn stable_id(session_id: &str, range: TurnRange, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update(range.first.to_be_bytes());
        hasher.update(range.last.to_be_bytes());
        hasher.update(content.trim().to_lowercase().as_bytes());
        format!("fact_{}", hex_prefix(&hasher.finalize(), 16))
    }

    pub fn ciar_score(&self) -> f32 {
        self.ciar.score()
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated_to_episode_id.is_some()
    }
}

// =============================================================================
// L3 EPISODE
// =============================================================================

/// Closed time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Cross-references written once both index writes succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualIndexRefs {
    pub vector_ref: String,
    pub graph_ref: String,
}

/// Consolidated cluster of facts (L3)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub session_id: String,
    pub summary: String,
    pub source_fact_ids: Vec<String>,
    pub entities: Vec<String>,
    pub time_window: TimeWindow,
    /// Earliest source-fact timestamp
    pub fact_valid_from: DateTime<Utc>,
    /// Latest source-fact timestamp; `None` while the topic is still open
    pub fact_valid_to: Option<DateTime<Utc>>,
    /// Consolidation wall-clock time
    pub source_observation_timestamp: DateTime<Utc>,
    pub importance_score: f32,
    /// Hash of session + sorted source fact ids
    pub idempotency_key: String,
    /// Present only after a committed dual write
    #[serde(default)]
    pub refs: Option<DualIndexRefs>,
}

impl Episode {
    pub fn idempotency_key_for(session_id: &str, fact_ids: &[String]) -> String {
        let mut sorted: Vec<&str> = fact_ids.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        for id in sorted {
            hasher.update(b"\x1f");
            hasher.update(id.as_bytes());
        }
        hex_prefix(&hasher.finalize(), 32)
    }

    /// Episode id derived from the idempotency key so retries reuse it
    pub fn id_for_key(idempotency_key: &str) -> String {
        format!("ep_{}", &idempotency_key[..idempotency_key.len().min(24)])
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(to) = self.fact_valid_to {
            if self.fact_valid_from > to {
                return Err(MemoryError::validation(
                    "fact_valid_to",
                    "must not precede fact_valid_from",
                ));
            }
        }
        if self.time_window.start > self.time_window.end {
            return Err(MemoryError::validation("time_window", "start after end"));
        }
        if self.source_fact_ids.is_empty() {
            return Err(MemoryError::validation(
                "source_fact_ids",
                "an episode needs at least one source fact",
            ));
        }
        check_unit("importance_score", self.importance_score)?;
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.refs.is_some()
    }
}

// =============================================================================
// L4 KNOWLEDGE
// =============================================================================

/// Distilled, generalized knowledge (L4)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    pub confidence: f32,
    pub source_episode_ids: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    pub usefulness_score: f32,
    pub validation_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
}

impl KnowledgeDocument {
    pub fn validate(&self) -> Result<()> {
        check_unit("confidence", self.confidence)?;
        check_unit("usefulness_score", self.usefulness_score)?;
        if self.title.trim().is_empty() {
            return Err(MemoryError::validation("title", "must not be empty"));
        }
        Ok(())
    }

    /// Text used for embedding and near-duplicate comparison
    pub fn comparison_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }
}

// =============================================================================
// PROCESSING STATE
// =============================================================================

/// Per-session lifecycle watermark
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub session_id: String,
    pub last_processed_turn_id: u64,
    pub last_promotion_at: Option<DateTime<Utc>>,
    pub last_consolidation_at: Option<DateTime<Utc>>,
    /// Turns past the watermark still waiting for promotion
    #[serde(default)]
    pub pending_turns: usize,
}

impl ProcessingState {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }
}

pub(crate) fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ciar_rejects_out_of_range() {
        assert!(CiarComponents::new(1.2, 0.5, 1.0, 1.0).is_err());
        assert!(CiarComponents::new(0.5, f32::NAN, 1.0, 1.0).is_err());
        assert!(CiarComponents::new(0.5, 0.5, 1.0, -0.1).is_err());
        let c = CiarComponents::new(0.9, 0.8, 1.0, 1.0).unwrap();
        assert!((c.score() - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_ciar_score_clamped() {
        let c = CiarComponents::new(1.0, 1.0, 1.0, 2.0).unwrap();
        assert_eq!(c.score(), 1.0);
    }

    #[test]
    fn test_ciar_deserialize_validates() {
        let ok: CiarComponents = serde_json::from_str(
            r#"{"certainty":0.5,"impact":0.5,"age_decay":1.0,"recency_boost":1.0}"#,
        )
        .unwrap();
        assert_eq!(ok.score(), 0.25);

        let bad = serde_json::from_str::<CiarComponents>(
            r#"{"certainty":1.5,"impact":0.5,"age_decay":1.0,"recency_boost":1.0}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_fact_id_is_stable() {
        let a = Fact::stable_id("s1", TurnRange::new(3, 5), "Prefers Python");
        let b = Fact::stable_id("s1", TurnRange::new(5, 3), "  prefers python ");
        let c = Fact::stable_id("s2", TurnRange::new(3, 5), "Prefers Python");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("fact_"));
    }

    #[test]
    fn test_idempotency_key_ignores_order() {
        let a = Episode::idempotency_key_for("s1", &["f2".into(), "f1".into()]);
        let b = Episode::idempotency_key_for("s1", &["f1".into(), "f2".into()]);
        assert_eq!(a, b);
        assert_eq!(Episode::id_for_key(&a), Episode::id_for_key(&b));
    }

    #[test]
    fn test_episode_validation() {
        let now = Utc::now();
        let mut episode = Episode {
            id: "ep_1".into(),
            session_id: "s1".into(),
            summary: "summary".into(),
            source_fact_ids: vec!["f1".into()],
            entities: vec![],
            time_window: TimeWindow {
                start: now - chrono::Duration::hours(1),
                end: now,
            },
            fact_valid_from: now - chrono::Duration::hours(1),
            fact_valid_to: Some(now),
            source_observation_timestamp: now,
            importance_score: 0.7,
            idempotency_key: "k".into(),
            refs: None,
        };
        assert!(episode.validate().is_ok());

        episode.fact_valid_to = Some(now - chrono::Duration::hours(2));
        assert!(episode.validate().is_err());

        episode.fact_valid_to = None;
        assert!(episode.validate().is_ok());
    }

    #[test]
    fn test_fact_type_parse_is_lenient() {
        assert_eq!(FactType::parse(" Preference "), FactType::Preference);
        assert_eq!(FactType::parse("schedule"), FactType::Event);
        assert_eq!(FactType::parse("whatever"), FactType::Mention);
    }
}
