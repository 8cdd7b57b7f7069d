//! Episode consolidator: time-windowed density clustering of L2 facts
//!
//! A session's unconsolidated facts are cut into coarse, overlapping time
//! windows. Within a window, facts are clustered DBSCAN-style over cosine
//! similarity of their embeddings: two facts are neighbours when their
//! similarity is at or above the threshold (so `eps = 1 - threshold` in
//! distance terms), and a fact with at least `min_points` neighbours
//! (itself included) is a core point.
//!
//! Facts are visited in time order, so a border fact reachable from two
//! clusters lands in the one formed first. Facts left as noise in one window
//! are reconsidered in the next window if they fall in the overlap. A lone
//! fact at or above the high-significance bar becomes a singleton episode;
//! other noise stays in L2 for a later cycle.
//!
//! Bi-temporal bounds are derived from the members: `fact_valid_from` is the
//! earliest statement, `fact_valid_to` the latest. A topic stays open
//! (`fact_valid_to = None`) only while the session holds facts that are too
//! fresh to cluster yet and similar to a member.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::config::ClusteringConfig;
use crate::memory::types::{Fact, TimeWindow};
use crate::similarity::cosine_similarity;

/// Fact plus the embedding of its content
#[derive(Debug, Clone)]
pub struct EmbeddedFact {
    pub fact: Fact,
    pub embedding: Vec<f32>,
}

/// Cluster ready to become an episode
#[derive(Debug, Clone)]
pub struct EpisodeDraft {
    pub session_id: String,
    pub facts: Vec<Fact>,
    pub time_window: TimeWindow,
    pub fact_valid_from: DateTime<Utc>,
    pub fact_valid_to: Option<DateTime<Utc>>,
    pub importance: f32,
    pub entities: Vec<String>,
    pub singleton: bool,
}

impl EpisodeDraft {
    pub fn fact_ids(&self) -> Vec<String> {
        self.facts.iter().map(|f| f.id.clone()).collect()
    }
}

pub struct EpisodeConsolidator {
    config: ClusteringConfig,
    high_significance: f32,
}

impl EpisodeConsolidator {
    pub fn new(config: ClusteringConfig, high_significance: f32) -> Self {
        Self {
            config,
            high_significance,
        }
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Overlapping windows covering `[first, last]`
    pub fn windows(&self, first: DateTime<Utc>, last: DateTime<Utc>) -> Vec<TimeWindow> {
        let length = Duration::hours(self.config.window_hours.max(1));
        let overlap = Duration::minutes(self.config.window_overlap_minutes.max(0));
        let stride = if overlap < length {
            length - overlap
        } else {
            length
        };

        let mut windows = Vec::new();
        let mut start = first;
        loop {
            let end = start + length;
            windows.push(TimeWindow { start, end });
            if end >= last {
                break;
            }
            start += stride;
        }
        windows
    }

    /// Group one session's facts into episode drafts
    ///
    /// Every fact appears in at most one draft. Facts that end up in no draft
    /// are left for a later cycle. `fresh` holds the session's facts still
    /// inside the consolidation delay; they only decide whether a topic is open.
    pub fn cluster(
        &self,
        session_id: &str,
        mut facts: Vec<EmbeddedFact>,
        fresh: &[EmbeddedFact],
    ) -> Vec<EpisodeDraft> {
        if facts.is_empty() {
            return Vec::new();
        }
        facts.sort_by(|a, b| {
            a.fact
                .source_timestamp
                .cmp(&b.fact.source_timestamp)
                .then_with(|| a.fact.id.cmp(&b.fact.id))
        });

        let first = facts[0].fact.source_timestamp;
        let last = facts[facts.len() - 1].fact.source_timestamp;
        let mut assigned = vec![false; facts.len()];
        let mut drafts = Vec::new();

        for window in self.windows(first, last) {
            let members: Vec<usize> = (0..facts.len())
                .filter(|&i| !assigned[i] && window.contains(facts[i].fact.source_timestamp))
                .collect();
            if members.is_empty() {
                continue;
            }

            let (clusters, noise) =
                dbscan(&facts, &members, self.config.similarity_threshold, self.config.min_points);

            for cluster in clusters {
                for part in self.split_oversized(&facts, cluster, self.config.similarity_threshold) {
                    for &i in &part {
                        assigned[i] = true;
                    }
                    drafts.push(self.draft(session_id, &facts, &part, window, fresh, false));
                }
            }

            for i in noise {
                if facts[i].fact.ciar_score() >= self.high_significance {
                    assigned[i] = true;
                    drafts.push(self.draft(session_id, &facts, &[i], window, fresh, true));
                }
            }
        }

        debug!(
            session_id,
            facts = facts.len(),
            drafts = drafts.len(),
            unassigned = assigned.iter().filter(|a| !**a).count(),
            "Clustered session facts"
        );
        drafts
    }

    /// Re-cluster an oversized cluster at a stricter threshold until every
    /// part fits; leftovers join the most similar part with room, and
    /// anything still left is chunked in time order
    fn split_oversized(&self, facts: &[EmbeddedFact], cluster: Vec<usize>, threshold: f32) -> Vec<Vec<usize>> {
        let max = self.config.max_cluster_size.max(2);
        if cluster.len() <= max {
            return vec![cluster];
        }

        let stricter = threshold + self.config.split_step.max(0.01);
        if stricter > 1.0 {
            return chunk_in_order(cluster, max);
        }

        let (parts, noise) = dbscan(facts, &cluster, stricter, self.config.min_points);
        if parts.is_empty() {
            return chunk_in_order(cluster, max);
        }

        let mut out: Vec<Vec<usize>> = Vec::new();
        for part in parts {
            out.extend(self.split_oversized(facts, part, stricter));
        }

        let mut leftovers = Vec::new();
        for i in noise {
            let best = out
                .iter()
                .enumerate()
                .filter(|(_, part)| part.len() < max)
                .map(|(p, part)| {
                    let sim = part
                        .iter()
                        .map(|&j| cosine_similarity(&facts[i].embedding, &facts[j].embedding))
                        .fold(f32::MIN, f32::max);
                    (p, sim)
                })
                .max_by(|a, b| a.1.total_cmp(&b.1));
            match best {
                Some((p, _)) => out[p].push(i),
                None => leftovers.push(i),
            }
        }
        if !leftovers.is_empty() {
            out.extend(chunk_in_order(leftovers, max));
        }
        for part in &mut out {
            part.sort_unstable();
        }
        out
    }

    fn draft(
        &self,
        session_id: &str,
        facts: &[EmbeddedFact],
        members: &[usize],
        window: TimeWindow,
        fresh: &[EmbeddedFact],
        singleton: bool,
    ) -> EpisodeDraft {
        let selected: Vec<Fact> = members.iter().map(|&i| facts[i].fact.clone()).collect();

        let valid_from = selected
            .iter()
            .map(|f| f.source_timestamp)
            .min()
            .unwrap_or(window.start);
        let latest = selected
            .iter()
            .map(|f| f.source_timestamp)
            .max()
            .unwrap_or(window.end);
        let continued = fresh.iter().any(|newer| {
            members.iter().any(|&i| {
                cosine_similarity(&newer.embedding, &facts[i].embedding) >= self.config.similarity_threshold
            })
        });
        let valid_to = if continued { None } else { Some(latest) };

        let scores: Vec<f32> = selected.iter().map(Fact::ciar_score).collect();
        let peak = scores.iter().copied().fold(0.0f32, f32::max);
        let mean = scores.iter().sum::<f32>() / scores.len().max(1) as f32;
        let importance = (0.6 * peak + 0.4 * mean).clamp(0.0, 1.0);

        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        for fact in &selected {
            for entity in &fact.entities {
                if seen.insert(entity.to_lowercase()) {
                    entities.push(entity.clone());
                }
            }
        }

        EpisodeDraft {
            session_id: session_id.to_string(),
            facts: selected,
            time_window: TimeWindow {
                start: window.start.min(valid_from),
                end: window.end.max(latest),
            },
            fact_valid_from: valid_from,
            fact_valid_to: valid_to,
            importance,
            entities,
            singleton,
        }
    }
}

/// Density clustering over `members` (indices into `facts`, time-ordered)
///
/// Returns clusters in formation order and the noise points.
fn dbscan(
    facts: &[EmbeddedFact],
    members: &[usize],
    threshold: f32,
    min_points: usize,
) -> (Vec<Vec<usize>>, Vec<usize>) {
    let neighbours = |i: usize| -> Vec<usize> {
        members
            .iter()
            .copied()
            .filter(|&j| i == j || cosine_similarity(&facts[i].embedding, &facts[j].embedding) >= threshold)
            .collect()
    };

    let mut label: HashMap<usize, Option<usize>> = HashMap::new();
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for &point in members {
        if label.contains_key(&point) {
            continue;
        }
        let seeds = neighbours(point);
        if seeds.len() < min_points.max(1) {
            label.insert(point, None);
            continue;
        }

        let cluster_id = clusters.len();
        let mut cluster = vec![point];
        label.insert(point, Some(cluster_id));

        let mut queue: VecDeque<usize> = seeds.into_iter().filter(|&j| j != point).collect();
        while let Some(q) = queue.pop_front() {
            match label.get(&q) {
                // Claimed by an earlier cluster: stays there
                Some(Some(_)) => continue,
                // Former noise becomes a border point
                Some(None) => {
                    label.insert(q, Some(cluster_id));
                    cluster.push(q);
                    continue;
                }
                None => {}
            }
            label.insert(q, Some(cluster_id));
            cluster.push(q);
            let reach = neighbours(q);
            if reach.len() >= min_points.max(1) {
                queue.extend(reach.into_iter().filter(|j| !matches!(label.get(j), Some(Some(_)))));
            }
        }
        cluster.sort_unstable();
        clusters.push(cluster);
    }

    let noise = members
        .iter()
        .copied()
        .filter(|i| matches!(label.get(i), Some(None)))
        .collect();
    (clusters, noise)
}

fn chunk_in_order(mut indices: Vec<usize>, max: usize) -> Vec<Vec<usize>> {
    indices.sort_unstable();
    indices.chunks(max).map(<[usize]>::to_vec).collect()
}
