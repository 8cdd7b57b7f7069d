//! L1 active context
//!
//! A fixed-size sliding window of the most recent turns per session. Reads hit
//! the KV list `l1:{session}:turns`; a miss falls back to the durable copy in
//! the `turns` collection and repopulates the list. Turn ids are assigned from
//! the durable session record so they survive restarts.
//!
//! The durable copy keeps every turn until its TTL, so turns that slide out of
//! the window before promotion are still readable through `turns_after`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{term_overlap, ContextCandidate, ContextRequest, MemoryTier, QueryFilters, TierHealth, TierKind};
use crate::clock::SharedClock;
use crate::config::TierConfig;
use crate::errors::{MemoryError, Result};
use crate::memory::types::{Role, Turn};
use crate::metrics::TURNS_STORED_TOTAL;
use crate::storage::{get_typed, put_typed, scan_typed, DocumentStore, KvStore};

const TURNS: &str = "turns";
const SESSIONS: &str = "sessions";

/// Durable per-session bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub last_turn_id: u64,
    pub updated_at: DateTime<Utc>,
}

pub struct ActiveTier {
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DocumentStore>,
    clock: SharedClock,
    window: usize,
    ttl: Duration,
}

impl ActiveTier {
    pub fn new(
        kv: Arc<dyn KvStore>,
        durable: Arc<dyn DocumentStore>,
        clock: SharedClock,
        config: &TierConfig,
    ) -> Self {
        Self {
            kv,
            durable,
            clock,
            window: config.l1_window_size.max(1),
            ttl: Duration::hours(config.l1_ttl_hours.max(1)),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window
    }

    fn list_key(session_id: &str) -> String {
        format!("l1:{session_id}:turns")
    }

    fn seq_key(session_id: &str) -> String {
        format!("l1:{session_id}:seq")
    }

    fn turn_doc_id(session_id: &str, turn_id: u64) -> String {
        format!("{session_id}/{turn_id:020}")
    }

    /// Record ids look like `{session}:{turn_id}`
    pub fn record_id(turn: &Turn) -> String {
        format!("{}:{}", turn.session_id, turn.turn_id)
    }

    fn parse_record_id(id: &str) -> Result<(&str, u64)> {
        let (session, turn) = id
            .rsplit_once(':')
            .ok_or_else(|| MemoryError::validation("turn_id", format!("malformed id '{id}'")))?;
        let turn_id = turn
            .parse::<u64>()
            .map_err(|_| MemoryError::validation("turn_id", format!("malformed id '{id}'")))?;
        Ok((session, turn_id))
    }

    fn std_ttl(&self) -> std::time::Duration {
        self.ttl.to_std().unwrap_or(std::time::Duration::from_secs(3600))
    }

    fn is_live(&self, turn: &Turn, now: DateTime<Utc>) -> bool {
        now - turn.timestamp < self.ttl
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        get_typed(self.durable.as_ref(), SESSIONS, session_id).await
    }

    /// Known sessions, in id order
    pub async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        scan_typed(self.durable.as_ref(), SESSIONS, "", usize::MAX).await
    }

    /// Atomic per-session counter, seeded from the durable session record
    async fn next_turn_id(&self, session_id: &str) -> Result<u64> {
        let key = Self::seq_key(session_id);
        if self.kv.get(&key).await?.is_none() {
            let last = self.session(session_id).await?.map_or(0, |s| s.last_turn_id);
            self.kv
                .set_if_absent(&key, last.to_string().as_bytes(), None)
                .await?;
        }
        let next = self.kv.incr(&key).await?;
        u64::try_from(next).map_err(|_| MemoryError::Storage(format!("negative turn counter for {session_id}")))
    }

    /// Append a turn, assigning the next turn id for the session
    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub async fn append(&self, session_id: &str, role: Role, content: &str) -> Result<Turn> {
        if session_id.trim().is_empty() {
            return Err(MemoryError::validation("session_id", "must not be empty"));
        }
        if content.trim().is_empty() {
            return Err(MemoryError::validation("content", "must not be empty"));
        }

        let turn = Turn {
            session_id: session_id.to_string(),
            turn_id: self.next_turn_id(session_id).await?,
            role,
            content: content.to_string(),
            timestamp: self.clock.now(),
        };
        self.store(turn.clone()).await?;
        Ok(turn)
    }

    /// Most recent live turns, oldest first
    pub async fn recent_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        let now = self.clock.now();
        let key = Self::list_key(session_id);

        match self.kv.list_range(&key).await {
            Ok(raw) if !raw.is_empty() => {
                let mut turns = Vec::with_capacity(raw.len());
                for bytes in raw {
                    let turn: Turn = serde_json::from_slice(&bytes)?;
                    if self.is_live(&turn, now) {
                        turns.push(turn);
                    }
                }
                return Ok(turns);
            }
            Ok(_) => debug!(session_id, "L1 fast path miss"),
            Err(e) => warn!(session_id, error = %e, "L1 fast path unavailable, reading durable store"),
        }

        let mut turns: Vec<Turn> =
            scan_typed(self.durable.as_ref(), TURNS, &format!("{session_id}/"), usize::MAX).await?;
        turns.retain(|t| self.is_live(t, now));
        if turns.len() > self.window {
            turns.drain(..turns.len() - self.window);
        }

        if !turns.is_empty() {
            let encoded = turns
                .iter()
                .map(serde_json::to_vec)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if let Err(e) = self.kv.list_replace(&key, &encoded, Some(self.std_ttl())).await {
                warn!(session_id, error = %e, "Failed to repopulate L1 fast path");
            }
        }
        Ok(turns)
    }

    /// Live turns with an id greater than `after`
    ///
    /// The window only covers the newest turns; when `after` lies behind it
    /// the durable copy supplies the turns that slid out unprocessed.
    pub async fn turns_after(&self, session_id: &str, after: u64) -> Result<Vec<Turn>> {
        let mut turns = self.recent_turns(session_id).await?;
        let covered = turns.first().map_or(false, |t| t.turn_id <= after.saturating_add(1));
        if !covered {
            let now = self.clock.now();
            turns = scan_typed(self.durable.as_ref(), TURNS, &format!("{session_id}/"), usize::MAX).await?;
            turns.retain(|t| self.is_live(t, now));
        }
        turns.retain(|t| t.turn_id > after);
        Ok(turns)
    }

    /// Remove durable turns past their TTL; returns how many were removed
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
        let turns: Vec<Turn> = scan_typed(self.durable.as_ref(), TURNS, "", usize::MAX).await?;
        let mut removed = 0;
        for turn in turns.iter().filter(|t| !self.is_live(t, now)) {
            if self
                .durable
                .delete(TURNS, &Self::turn_doc_id(&turn.session_id, turn.turn_id))
                .await?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Expired L1 turns");
        }
        Ok(removed)
    }
}

#[async_trait]
impl MemoryTier for ActiveTier {
    type Input = Turn;
    type Record = Turn;

    fn kind(&self) -> TierKind {
        TierKind::Active
    }

    /// Durable write first; it is the only failure surfaced to callers
    async fn store(&self, turn: Turn) -> Result<String> {
        let doc_id = Self::turn_doc_id(&turn.session_id, turn.turn_id);
        put_typed(self.durable.as_ref(), TURNS, &doc_id, &turn).await?;

        let previous = self.session(&turn.session_id).await?;
        let record = SessionRecord {
            session_id: turn.session_id.clone(),
            last_turn_id: previous
                .as_ref()
                .map_or(turn.turn_id, |s| s.last_turn_id.max(turn.turn_id)),
            updated_at: turn.timestamp,
        };
        put_typed(self.durable.as_ref(), SESSIONS, &turn.session_id, &record).await?;

        let bytes = serde_json::to_vec(&turn)?;
        if let Err(e) = self
            .kv
            .list_push(&Self::list_key(&turn.session_id), &bytes, self.window, Some(self.std_ttl()))
            .await
        {
            // The next read repopulates from the durable store
            warn!(session_id = %turn.session_id, error = %e, "L1 fast path write failed");
            let _ = self.kv.delete(&Self::list_key(&turn.session_id)).await;
        }

        TURNS_STORED_TOTAL.inc();
        Ok(Self::record_id(&turn))
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Turn>> {
        let (session_id, turn_id) = Self::parse_record_id(id)?;
        let turn: Option<Turn> =
            get_typed(self.durable.as_ref(), TURNS, &Self::turn_doc_id(session_id, turn_id)).await?;
        let now = self.clock.now();
        Ok(turn.filter(|t| self.is_live(t, now)))
    }

    async fn query(&self, filters: &QueryFilters, limit: usize) -> Result<Vec<Turn>> {
        let Some(session_id) = filters.session_id.as_deref() else {
            return Err(MemoryError::validation("session_id", "L1 queries are per session"));
        };
        let mut turns = self.recent_turns(session_id).await?;
        if let Some(since) = filters.since {
            turns.retain(|t| t.timestamp >= since);
        }
        if let Some(text) = filters.text.as_deref() {
            turns.retain(|t| term_overlap(text, &t.content) > 0.0);
        }
        // Newest first
        turns.reverse();
        turns.truncate(limit);
        Ok(turns)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let (session_id, turn_id) = Self::parse_record_id(id)?;
        let removed = self
            .durable
            .delete(TURNS, &Self::turn_doc_id(session_id, turn_id))
            .await?;
        if removed {
            // Rebuild the fast path without the deleted turn
            self.kv.delete(&Self::list_key(session_id)).await?;
        }
        Ok(removed)
    }

    async fn health_check(&self) -> TierHealth {
        TierHealth::from_adapters(
            TierKind::Active,
            vec![self.kv.health_check().await, self.durable.health_check().await],
        )
    }

    async fn context_candidates(&self, request: &ContextRequest) -> Result<Vec<ContextCandidate>> {
        let turns = self.recent_turns(&request.session_id).await?;
        let count = turns.len().max(1) as f32;
        // Recency dominates; lexical overlap breaks ties toward the query
        Ok(turns
            .iter()
            .enumerate()
            .rev()
            .take(request.limit)
            .map(|(position, turn)| ContextCandidate {
                tier: TierKind::Active,
                id: Self::record_id(turn),
                content: format!("{}: {}", turn.role, turn.content),
                score: (position as f32 + 1.0) / count + 0.5 * term_overlap(&request.query, &turn.content),
                timestamp: turn.timestamp,
            })
            .collect())
    }
}
