//! Pattern mining over consolidated episodes
//!
//! Three independent signals propose groups of episodes:
//! 1. **Entity co-occurrence**: entities (and entity pairs) mentioned across
//!    at least `min_support` episodes
//! 2. **Themes**: connected components of episodes whose summary embeddings
//!    are mutually similar
//! 3. **Temporal regularity**: a proposed group whose episodes recur at a
//!    near-constant interval gets an extra signal
//!
//! A single episode with very high importance (an explicit statement such as
//! "always answer in French") is proposed on its own without support.
//!
//! Groups proposing the same episode set are merged, scored, filtered against
//! a blacklist and a confidence floor, then ranked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::types::{hex_prefix, Episode};
use crate::constants::{
    EVIDENCE_RECENCY_HALF_LIFE_DAYS, EXPLICIT_STATEMENT_CONFIDENCE, MAX_PATTERN_CANDIDATES,
    PATTERN_CONFIDENCE_FLOOR, TEMPORAL_REGULARITY_MAX_CV, THEME_SIMILARITY_THRESHOLD,
};
use crate::similarity::cosine_similarity;

/// Signal strength of one shared entity
const ENTITY_SIGNAL_STRENGTH: f32 = 0.6;

/// Signal strength of an entity pair appearing together
const ENTITY_PAIR_SIGNAL_STRENGTH: f32 = 0.7;

/// Signal strength of a regular recurrence interval
const TEMPORAL_SIGNAL_STRENGTH: f32 = 0.5;

const RANK_WEIGHT_FREQUENCY: f32 = 0.3;
const RANK_WEIGHT_RECENCY: f32 = 0.2;
const RANK_WEIGHT_CONFIDENCE: f32 = 0.3;
const RANK_WEIGHT_IMPACT: f32 = 0.2;

/// Entities and summaries that never make a pattern on their own
const BOILERPLATE: &[&str] = &[
    "user",
    "assistant",
    "i",
    "me",
    "you",
    "it",
    "this",
    "that",
    "thing",
    "things",
    "something",
    "hello",
    "hi",
    "hey",
    "thanks",
    "thank you",
    "ok",
    "okay",
    "yes",
    "no",
    "today",
    "tomorrow",
    "yesterday",
];

fn normalize(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

fn is_boilerplate(text: &str) -> bool {
    let key = normalize(text);
    key.chars().count() < 2 || BOILERPLATE.contains(&key.as_str())
}

/// One episode as seen by the miner
#[derive(Debug, Clone)]
pub struct EpisodeEvidence {
    pub episode: Episode,
    pub embedding: Vec<f32>,
    /// Episode entities plus those linked to it in the graph
    pub entities: Vec<String>,
}

impl EpisodeEvidence {
    /// Latest point in time the episode speaks about
    fn latest(&self) -> DateTime<Utc> {
        self.episode
            .fact_valid_to
            .unwrap_or(self.episode.time_window.end)
    }
}

/// Why a group of episodes was proposed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PatternSignal {
    EntityCooccurrence {
        entities: Vec<String>,
    },
    Theme {
        avg_similarity: f32,
    },
    TemporalRegularity {
        interval_hours: f64,
        coefficient_of_variation: f64,
    },
    ExplicitStatement {
        importance: f32,
    },
}

impl PatternSignal {
    pub fn name(&self) -> &'static str {
        match self {
            PatternSignal::EntityCooccurrence { .. } => "entity_cooccurrence",
            PatternSignal::Theme { .. } => "theme",
            PatternSignal::TemporalRegularity { .. } => "temporal_regularity",
            PatternSignal::ExplicitStatement { .. } => "explicit_statement",
        }
    }

    fn strength(&self) -> f32 {
        match self {
            PatternSignal::EntityCooccurrence { entities } if entities.len() > 1 => {
                ENTITY_PAIR_SIGNAL_STRENGTH
            }
            PatternSignal::EntityCooccurrence { .. } => ENTITY_SIGNAL_STRENGTH,
            PatternSignal::Theme { avg_similarity } => avg_similarity.clamp(0.0, 1.0),
            PatternSignal::TemporalRegularity { .. } => TEMPORAL_SIGNAL_STRENGTH,
            PatternSignal::ExplicitStatement { importance } => importance.clamp(0.0, 1.0),
        }
    }
}

/// A ranked pattern ready for synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCandidate {
    /// Stable hash of the supporting episode ids
    pub signature: String,
    pub label: String,
    pub signals: Vec<PatternSignal>,
    /// Supporting episodes, oldest first
    pub episode_ids: Vec<String>,
    pub entities: Vec<String>,
    pub support: usize,
    pub frequency: f32,
    pub recency: f32,
    pub confidence: f32,
    pub impact: f32,
    pub rank: f32,
}

impl PatternCandidate {
    pub fn is_explicit(&self) -> bool {
        self.signals
            .iter()
            .any(|s| matches!(s, PatternSignal::ExplicitStatement { .. }))
    }
}

#[derive(Default)]
struct Group {
    signals: Vec<PatternSignal>,
    entities: Vec<String>,
}

impl Group {
    fn add_entities(&mut self, names: &[String]) {
        for name in names {
            if !self
                .entities
                .iter()
                .any(|e| e.eq_ignore_ascii_case(name))
            {
                self.entities.push(name.clone());
            }
        }
    }
}

type Groups = BTreeMap<BTreeSet<usize>, Group>;

fn propose(groups: &mut Groups, members: BTreeSet<usize>, signal: PatternSignal) {
    let group = groups.entry(members).or_default();
    if let PatternSignal::EntityCooccurrence { entities } = &signal {
        group.add_entities(entities);
    }
    group.signals.push(signal);
}

pub struct PatternMiner {
    min_support: usize,
    theme_threshold: f32,
    confidence_floor: f32,
    max_candidates: usize,
}

impl PatternMiner {
    pub fn new(min_support: usize) -> Self {
        Self {
            min_support: min_support.max(1),
            theme_threshold: THEME_SIMILARITY_THRESHOLD,
            confidence_floor: PATTERN_CONFIDENCE_FLOOR,
            max_candidates: MAX_PATTERN_CANDIDATES,
        }
    }

    /// Mine ranked candidates from a lookback window of episodes
    pub fn mine(&self, evidence: &[EpisodeEvidence], now: DateTime<Utc>) -> Vec<PatternCandidate> {
        let mut groups = Groups::new();
        self.entity_groups(evidence, &mut groups);
        self.theme_groups(evidence, &mut groups);
        self.explicit_statements(evidence, &mut groups);
        self.temporal_regularities(evidence, &mut groups);

        let mut candidates: Vec<PatternCandidate> = groups
            .into_iter()
            .filter_map(|(members, group)| self.score(&members, group, evidence, now))
            .collect();

        candidates.sort_by(|a, b| {
            b.rank
                .total_cmp(&a.rank)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        candidates.truncate(self.max_candidates);
        candidates
    }

    fn entity_groups(&self, evidence: &[EpisodeEvidence], groups: &mut Groups) {
        // normalized name -> (display name, episodes)
        let mut by_entity: BTreeMap<String, (String, BTreeSet<usize>)> = BTreeMap::new();
        for (i, ev) in evidence.iter().enumerate() {
            for name in &ev.entities {
                if is_boilerplate(name) {
                    continue;
                }
                by_entity
                    .entry(normalize(name))
                    .or_insert_with(|| (name.trim().to_string(), BTreeSet::new()))
                    .1
                    .insert(i);
            }
        }

        let frequent: Vec<&(String, BTreeSet<usize>)> = by_entity
            .values()
            .filter(|(_, members)| members.len() >= self.min_support)
            .collect();

        for (name, members) in &frequent {
            propose(
                groups,
                members.clone(),
                PatternSignal::EntityCooccurrence {
                    entities: vec![name.clone()],
                },
            );
        }

        for (a, (name_a, members_a)) in frequent.iter().enumerate() {
            for (name_b, members_b) in frequent.iter().skip(a + 1) {
                let shared: BTreeSet<usize> =
                    members_a.intersection(members_b).copied().collect();
                if shared.len() >= self.min_support {
                    propose(
                        groups,
                        shared,
                        PatternSignal::EntityCooccurrence {
                            entities: vec![name_a.clone(), name_b.clone()],
                        },
                    );
                }
            }
        }
    }

    fn theme_groups(&self, evidence: &[EpisodeEvidence], groups: &mut Groups) {
        let n = evidence.len();
        let mut visited = vec![false; n];

        for start in 0..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut component = BTreeSet::from([start]);
            let mut queue = VecDeque::from([start]);
            while let Some(i) = queue.pop_front() {
                for j in 0..n {
                    if visited[j] {
                        continue;
                    }
                    let sim = cosine_similarity(&evidence[i].embedding, &evidence[j].embedding);
                    if sim >= self.theme_threshold {
                        visited[j] = true;
                        component.insert(j);
                        queue.push_back(j);
                    }
                }
            }

            if component.len() < self.min_support {
                continue;
            }
            let members: Vec<usize> = component.iter().copied().collect();
            let mut total = 0.0f32;
            let mut pairs = 0usize;
            for (a, &i) in members.iter().enumerate() {
                for &j in &members[a + 1..] {
                    total += cosine_similarity(&evidence[i].embedding, &evidence[j].embedding);
                    pairs += 1;
                }
            }
            let avg_similarity = if pairs == 0 { 1.0 } else { total / pairs as f32 };
            propose(groups, component, PatternSignal::Theme { avg_similarity });
        }
    }

    fn explicit_statements(&self, evidence: &[EpisodeEvidence], groups: &mut Groups) {
        for (i, ev) in evidence.iter().enumerate() {
            let importance = ev.episode.importance_score;
            if importance >= EXPLICIT_STATEMENT_CONFIDENCE {
                propose(
                    groups,
                    BTreeSet::from([i]),
                    PatternSignal::ExplicitStatement { importance },
                );
            }
        }
    }

    /// Add a regularity signal to proposed groups that recur at a steady pace
    fn temporal_regularities(&self, evidence: &[EpisodeEvidence], groups: &mut Groups) {
        for (members, group) in groups.iter_mut() {
            if members.len() < 3 {
                continue;
            }
            let mut times: Vec<DateTime<Utc>> = members
                .iter()
                .map(|&i| evidence[i].episode.fact_valid_from)
                .collect();
            times.sort();
            let intervals: Vec<f64> = times
                .windows(2)
                .map(|w| (w[1] - w[0]).num_seconds() as f64 / 3600.0)
                .collect();
            let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
            if mean <= 0.0 {
                continue;
            }
            let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / intervals.len() as f64;
            let cv = variance.sqrt() / mean;
            if cv <= TEMPORAL_REGULARITY_MAX_CV {
                group.signals.push(PatternSignal::TemporalRegularity {
                    interval_hours: mean,
                    coefficient_of_variation: cv,
                });
            }
        }
    }

    fn score(
        &self,
        members: &BTreeSet<usize>,
        group: Group,
        evidence: &[EpisodeEvidence],
        now: DateTime<Utc>,
    ) -> Option<PatternCandidate> {
        let mut supporting: Vec<&EpisodeEvidence> = members.iter().map(|&i| &evidence[i]).collect();
        supporting.sort_by_key(|ev| ev.episode.fact_valid_from);

        if supporting
            .iter()
            .all(|ev| is_boilerplate(&ev.episode.summary))
        {
            return None;
        }

        // Noisy-or over independent signals
        let confidence = 1.0
            - group
                .signals
                .iter()
                .map(|s| 1.0 - s.strength())
                .product::<f32>();
        if confidence < self.confidence_floor {
            return None;
        }

        let support = supporting.len();
        let latest = supporting.iter().map(|ev| ev.latest()).max()?;
        let age_days = ((now - latest).num_seconds() as f64 / 86_400.0).max(0.0);
        let recency = 0.5f64.powf(age_days / EVIDENCE_RECENCY_HALF_LIFE_DAYS) as f32;
        let frequency = support as f32 / (support + self.min_support) as f32;
        let impact = supporting
            .iter()
            .map(|ev| ev.episode.importance_score)
            .sum::<f32>()
            / support as f32;
        let rank = RANK_WEIGHT_FREQUENCY * frequency
            + RANK_WEIGHT_RECENCY * recency
            + RANK_WEIGHT_CONFIDENCE * confidence
            + RANK_WEIGHT_IMPACT * impact;

        let episode_ids: Vec<String> = supporting.iter().map(|ev| ev.episode.id.clone()).collect();
        let label = if group.entities.is_empty() {
            supporting[0].episode.summary.chars().take(60).collect()
        } else {
            group
                .entities
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };

        Some(PatternCandidate {
            signature: signature(&episode_ids),
            label,
            signals: group.signals,
            episode_ids,
            entities: group.entities,
            support,
            frequency,
            recency,
            confidence: confidence.clamp(0.0, 1.0),
            impact,
            rank,
        })
    }
}

fn signature(episode_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = episode_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\x1f");
    }
    hex_prefix(&hasher.finalize(), 16)
}
