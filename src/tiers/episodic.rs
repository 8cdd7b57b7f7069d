//! L3 episodic memory: dual-indexed episodes
//!
//! Every episode lives in the vector store (keyed by summary embedding) and in
//! the graph store (episode node linked to its session and entities), or in
//! neither. There is no shared transaction, so the write is a saga under a
//! per-session lease:
//!
//! 1. Vector upsert with `status = pending` (invisible to readers)
//! 2. Graph writes
//! 3. Vector upsert with `status = committed` and the cross-references
//!
//! A side that still fails after its retries triggers a compensating delete
//! of everything written so far and a `Consistency` error. Session and entity
//! nodes the saga created are removed too unless something else links to
//! them by then. Episode ids derive from the idempotency key, so a retried
//! saga overwrites rather than duplicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::{ContextCandidate, ContextRequest, MemoryTier, QueryFilters, TierHealth, TierKind};
use crate::config::TierConfig;
use crate::errors::{MemoryError, Result};
use crate::memory::types::{DualIndexRefs, Episode};
use crate::metrics::EPISODES_TOTAL;
use crate::resilience::{LeaseConfig, LeaseLock};
use crate::storage::{
    get_typed, put_typed, scan_typed, DocumentStore, GraphEdge, GraphNode, GraphStore, KvStore,
    Payload, PayloadFilter, VectorRecord, VectorStore,
};

const STATUS_PENDING: &str = "pending";
const STATUS_COMMITTED: &str = "committed";
const PENDING_EPISODES: &str = "pending_episodes";

pub const EPISODE_LABEL: &str = "Episode";
pub const ENTITY_LABEL: &str = "Entity";
pub const SESSION_LABEL: &str = "Session";
pub const MENTIONS: &str = "MENTIONS";
pub const CONTAINS: &str = "CONTAINS";

/// Episode plus the embedding of its summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEpisode {
    pub episode: Episode,
    pub embedding: Vec<f32>,
}

pub fn entity_node_id(name: &str) -> String {
    format!("entity:{}", name.trim().to_lowercase())
}

fn session_node_id(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub struct EpisodicTier {
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    docs: Arc<dyn DocumentStore>,
    locks: LeaseLock,
    retries: u32,
    backoff: Duration,
}

impl EpisodicTier {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        docs: Arc<dyn DocumentStore>,
        kv: Arc<dyn KvStore>,
        config: &TierConfig,
    ) -> Self {
        Self {
            vectors,
            graph,
            docs,
            locks: LeaseLock::new(
                kv,
                LeaseConfig::with_ttl(Duration::from_millis(config.lock_ttl_ms)),
            ),
            retries: config.dual_write_retries.max(1),
            backoff: Duration::from_millis(config.dual_write_backoff_ms),
        }
    }

    fn lock_resource(session_id: &str) -> String {
        format!("episode:{session_id}")
    }

    fn committed_filter(session_id: Option<&str>) -> PayloadFilter {
        let mut filter = vec![(
            "status".to_string(),
            serde_json::Value::String(STATUS_COMMITTED.to_string()),
        )];
        if let Some(session_id) = session_id {
            filter.push((
                "session_id".to_string(),
                serde_json::Value::String(session_id.to_string()),
            ));
        }
        filter
    }

    fn vector_record(episode: &Episode, embedding: &[f32], status: &str) -> Result<VectorRecord> {
        let mut payload = Payload::new();
        payload.insert("session_id".into(), episode.session_id.clone().into());
        payload.insert("status".into(), status.into());
        payload.insert("idempotency_key".into(), episode.idempotency_key.clone().into());
        payload.insert("graph_ref".into(), episode.id.clone().into());
        payload.insert("episode".into(), serde_json::to_value(episode)?);
        Ok(VectorRecord {
            id: episode.id.clone(),
            embedding: embedding.to_vec(),
            payload,
        })
    }

    fn decode(record: &VectorRecord) -> Option<Episode> {
        if record.payload.get("status").and_then(|s| s.as_str()) != Some(STATUS_COMMITTED) {
            return None;
        }
        let raw = record.payload.get("episode")?.clone();
        match serde_json::from_value(raw) {
            Ok(episode) => Some(episode),
            Err(e) => {
                warn!(episode_id = %record.id, error = %e, "Undecodable episode payload");
                None
            }
        }
    }

    /// Run `op` up to the configured attempts with exponential backoff
    async fn with_retries<T, F, Fut>(&self, step: &'static str, episode_id: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() || attempt + 1 >= self.retries => return Err(e),
                Err(e) => {
                    warn!(step, episode_id, attempt, error = %e, "Dual-write step failed, retrying");
                    tokio::time::sleep(self.backoff.saturating_mul(1 << attempt.min(8))).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Graph side of the saga; ids of nodes it had to create go to `created`
    async fn write_graph(&self, episode: &Episode, created: &Mutex<Vec<String>>) -> Result<()> {
        let mut props = Payload::new();
        props.insert("session_id".into(), episode.session_id.clone().into());
        props.insert("summary".into(), episode.summary.clone().into());
        props.insert("vector_ref".into(), episode.id.clone().into());
        props.insert("importance".into(), serde_json::json!(episode.importance_score));
        props.insert("fact_valid_from".into(), serde_json::to_value(episode.fact_valid_from)?);
        props.insert("fact_valid_to".into(), serde_json::to_value(episode.fact_valid_to)?);
        props.insert(
            "source_observation_timestamp".into(),
            serde_json::to_value(episode.source_observation_timestamp)?,
        );
        self.graph
            .upsert_node(GraphNode {
                id: episode.id.clone(),
                label: EPISODE_LABEL.into(),
                properties: props,
            })
            .await?;

        let session_node = session_node_id(&episode.session_id);
        if self.graph.get_node(&session_node).await?.is_none() {
            let mut props = Payload::new();
            props.insert("session_id".into(), episode.session_id.clone().into());
            self.graph
                .upsert_node(GraphNode {
                    id: session_node.clone(),
                    label: SESSION_LABEL.into(),
                    properties: props,
                })
                .await?;
            created.lock().push(session_node.clone());
        }
        self.graph
            .add_edge(GraphEdge {
                from: session_node,
                to: episode.id.clone(),
                relation: CONTAINS.into(),
                properties: Payload::new(),
            })
            .await?;

        for entity in &episode.entities {
            let node_id = entity_node_id(entity);
            if self.graph.get_node(&node_id).await?.is_none() {
                let mut props = Payload::new();
                props.insert("name".into(), entity.clone().into());
                self.graph
                    .upsert_node(GraphNode {
                        id: node_id.clone(),
                        label: ENTITY_LABEL.into(),
                        properties: props,
                    })
                    .await?;
                created.lock().push(node_id.clone());
            }
            // Bi-temporal validity travels on the relationship
            let mut edge_props = Payload::new();
            edge_props.insert("valid_from".into(), serde_json::to_value(episode.fact_valid_from)?);
            edge_props.insert("valid_to".into(), serde_json::to_value(episode.fact_valid_to)?);
            edge_props.insert(
                "observed_at".into(),
                serde_json::to_value(episode.source_observation_timestamp)?,
            );
            self.graph
                .add_edge(GraphEdge {
                    from: episode.id.clone(),
                    to: node_id,
                    relation: MENTIONS.into(),
                    properties: edge_props,
                })
                .await?;
        }
        Ok(())
    }

    /// Undo both sides; failures are logged, a leftover pending vector stays invisible
    async fn compensate(&self, episode_id: &str, created: &[String]) {
        if let Err(e) = self
            .with_retries("graph_compensation", episode_id, || self.graph.delete_node(episode_id))
            .await
        {
            error!(episode_id, critical = true, error = %e, "Graph compensation failed");
        }
        for node_id in created {
            if let Err(e) = self.remove_orphan(episode_id, node_id).await {
                error!(episode_id, node_id = %node_id, critical = true, error = %e, "Graph compensation failed");
            }
        }
        if let Err(e) = self
            .with_retries("vector_compensation", episode_id, || self.vectors.delete(episode_id))
            .await
        {
            error!(episode_id, critical = true, error = %e, "Vector compensation failed");
        }
    }

    /// Delete a saga-created node unless another episode linked to it meanwhile
    async fn remove_orphan(&self, episode_id: &str, node_id: &str) -> Result<()> {
        self.with_retries("graph_compensation", episode_id, || async move {
            if self.graph.neighbors(node_id, None).await?.is_empty() {
                self.graph.delete_node(node_id).await?;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, episode, embedding), fields(episode_id = %episode.id, session_id = %episode.session_id))]
    async fn dual_write(&self, mut episode: Episode, embedding: Vec<f32>) -> Result<String> {
        let id = episode.id.clone();

        // Idempotent replay of an already committed saga
        if let Some(existing) = self.vectors.get(&id).await?.as_ref().and_then(Self::decode) {
            if existing.is_committed() && self.graph.get_node(&id).await?.is_some() {
                debug!(episode_id = %id, "Episode already committed");
                EPISODES_TOTAL.with_label_values(&["duplicate"]).inc();
                return Ok(id);
            }
        }

        episode.refs = None;
        let pending = Self::vector_record(&episode, &embedding, STATUS_PENDING)?;
        self.with_retries("vector_write", &id, || self.vectors.upsert(pending.clone()))
            .await?;

        let created = Mutex::new(Vec::new());
        if let Err(e) = self
            .with_retries("graph_write", &id, || self.write_graph(&episode, &created))
            .await
        {
            let rollback = created.lock().clone();
            self.compensate(&id, &rollback).await;
            EPISODES_TOTAL.with_label_values(&["rolled_back"]).inc();
            error!(
                episode_id = %id,
                session_id = %episode.session_id,
                critical = true,
                error = %e,
                "Graph write failed, vector write rolled back"
            );
            return Err(MemoryError::Consistency {
                episode_id: id,
                detail: format!("graph write failed: {e}"),
            });
        }

        episode.refs = Some(DualIndexRefs {
            vector_ref: id.clone(),
            graph_ref: id.clone(),
        });
        let committed = Self::vector_record(&episode, &embedding, STATUS_COMMITTED)?;
        if let Err(e) = self
            .with_retries("vector_commit", &id, || self.vectors.upsert(committed.clone()))
            .await
        {
            let rollback = created.lock().clone();
            self.compensate(&id, &rollback).await;
            EPISODES_TOTAL.with_label_values(&["rolled_back"]).inc();
            error!(episode_id = %id, critical = true, error = %e, "Commit failed, episode rolled back");
            return Err(MemoryError::Consistency {
                episode_id: id,
                detail: format!("commit failed: {e}"),
            });
        }

        EPISODES_TOTAL.with_label_values(&["committed"]).inc();
        info!(
            episode_id = %id,
            session_id = %episode.session_id,
            facts = episode.source_fact_ids.len(),
            "Episode committed to vector and graph indexes"
        );
        Ok(id)
    }

    /// Committed episodes whose time window ends at or after `since`
    pub async fn episodes_since(&self, since: DateTime<Utc>) -> Result<Vec<(Episode, Vec<f32>)>> {
        let records = self
            .vectors
            .scan(&Self::committed_filter(None), usize::MAX)
            .await?;
        let mut out: Vec<(Episode, Vec<f32>)> = records
            .into_iter()
            .filter_map(|r| Self::decode(&r).map(|e| (e, r.embedding)))
            .filter(|(e, _)| e.time_window.end >= since)
            .collect();
        out.sort_by(|a, b| {
            a.0.fact_valid_from
                .cmp(&b.0.fact_valid_from)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        Ok(out)
    }

    /// Entity names linked to an episode in the graph
    pub async fn linked_entities(&self, episode_id: &str) -> Result<Vec<String>> {
        let nodes = self.graph.neighbors(episode_id, Some(MENTIONS)).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.label == ENTITY_LABEL)
            .filter_map(|n| n.properties.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }

    /// True when both indexes agree on the episode's existence
    pub async fn is_consistent(&self, episode_id: &str) -> Result<bool> {
        let committed = self
            .vectors
            .get(episode_id)
            .await?
            .as_ref()
            .and_then(Self::decode)
            .is_some();
        let in_graph = self.graph.get_node(episode_id).await?.is_some();
        Ok(committed == in_graph)
    }

    /// Park a failed episode for the next consolidation cycle
    pub async fn defer(&self, episode: &NewEpisode) -> Result<()> {
        put_typed(
            self.docs.as_ref(),
            PENDING_EPISODES,
            &episode.episode.idempotency_key,
            episode,
        )
        .await
    }

    pub async fn pending(&self) -> Result<Vec<NewEpisode>> {
        scan_typed(self.docs.as_ref(), PENDING_EPISODES, "", usize::MAX).await
    }

    pub async fn clear_pending(&self, idempotency_key: &str) -> Result<bool> {
        self.docs.delete(PENDING_EPISODES, idempotency_key).await
    }

    pub async fn is_pending(&self, idempotency_key: &str) -> Result<bool> {
        Ok(get_typed::<NewEpisode>(self.docs.as_ref(), PENDING_EPISODES, idempotency_key)
            .await?
            .is_some())
    }
}

#[async_trait]
impl MemoryTier for EpisodicTier {
    type Input = NewEpisode;
    type Record = Episode;

    fn kind(&self) -> TierKind {
        TierKind::Episodic
    }

    async fn store(&self, input: NewEpisode) -> Result<String> {
        let NewEpisode { episode, embedding } = input;
        episode.validate()?;
        if embedding.is_empty() {
            return Err(MemoryError::validation("embedding", "must not be empty"));
        }

        let guard = self
            .locks
            .acquire(&Self::lock_resource(&episode.session_id))
            .await?;
        let result = self.dual_write(episode, embedding).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release episode lease");
        }
        result
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Episode>> {
        Ok(self.vectors.get(id).await?.as_ref().and_then(Self::decode))
    }

    async fn query(&self, filters: &QueryFilters, limit: usize) -> Result<Vec<Episode>> {
        let filter = Self::committed_filter(filters.session_id.as_deref());
        let mut episodes: Vec<Episode> = match filters.embedding.as_deref() {
            Some(query) => self
                .vectors
                .search(query, limit.saturating_mul(4).max(limit), &filter)
                .await?
                .into_iter()
                .filter_map(|hit| {
                    Self::decode(&VectorRecord {
                        id: hit.id,
                        embedding: Vec::new(),
                        payload: hit.payload,
                    })
                })
                .collect(),
            None => {
                let mut all: Vec<Episode> = self
                    .vectors
                    .scan(&filter, usize::MAX)
                    .await?
                    .iter()
                    .filter_map(Self::decode)
                    .collect();
                all.sort_by(|a, b| b.fact_valid_from.cmp(&a.fact_valid_from));
                all
            }
        };
        if let Some(since) = filters.since {
            episodes.retain(|e| e.time_window.end >= since);
        }
        episodes.truncate(limit);
        Ok(episodes)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(record) = self.vectors.get(id).await? else {
            return Ok(self.graph.delete_node(id).await?);
        };
        let session_id = record
            .payload
            .get("session_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let guard = self.locks.acquire(&Self::lock_resource(&session_id)).await?;
        let graph_removed = self.graph.delete_node(id).await;
        let vector_removed = self.vectors.delete(id).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release episode lease");
        }
        Ok(graph_removed? | vector_removed?)
    }

    async fn health_check(&self) -> TierHealth {
        TierHealth::from_adapters(
            TierKind::Episodic,
            vec![self.vectors.health_check().await, self.graph.health_check().await],
        )
    }

    async fn context_candidates(&self, request: &ContextRequest) -> Result<Vec<ContextCandidate>> {
        let hits = self
            .vectors
            .search(
                &request.embedding,
                request.limit,
                &Self::committed_filter(Some(&request.session_id)),
            )
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let score = hit.score;
                let episode = Self::decode(&VectorRecord {
                    id: hit.id,
                    embedding: Vec::new(),
                    payload: hit.payload,
                })?;
                Some(ContextCandidate {
                    tier: TierKind::Episodic,
                    id: episode.id.clone(),
                    content: episode.summary.clone(),
                    score: score * (0.5 + 0.5 * episode.importance_score),
                    timestamp: episode.fact_valid_to.unwrap_or(episode.fact_valid_from),
                })
            })
            .collect())
    }
}
