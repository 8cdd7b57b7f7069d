//! Circuit breaker shared through the KV store
//!
//! # States
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected until `timeout` has elapsed since opening
//! - **HalfOpen**: up to `half_open_trials` trial calls probe recovery;
//!   a trial success closes the breaker, a trial failure re-opens it
//!
//! The breaker record lives under `breaker:{name}` and every transition is a
//! compare-and-swap on the serialized record, so concurrent engine workers
//! (in one process or many) never lose an update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::CircuitBreakerSettings;
use crate::constants::BREAKER_CAS_ATTEMPTS;
use crate::errors::Result;
use crate::metrics::{CIRCUIT_BREAKER_STATE, CIRCUIT_BREAKER_TRANSITIONS};
use crate::storage::{ttl_to_chrono, KvStore};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Dependency is failing - requests rejected immediately
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl CircuitState {
    fn gauge_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Persisted breaker record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Trial calls granted in the current half-open period
    #[serde(default)]
    pub trials_in_flight: u32,
    #[serde(default)]
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerRecord {
    fn closed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trials_in_flight: 0,
            trial_started_at: None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration the circuit stays open before allowing a trial
    pub timeout: Duration,
    /// Trial calls allowed while half-open
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerSettings::default().into()
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            timeout: settings.timeout(),
            half_open_trials: settings.half_open_trials.max(1),
        }
    }
}

/// Outcome of asking the breaker for permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// Breaker closed, call normally
    Normal,
    /// Half-open probe; its outcome decides the next state
    Trial,
    /// Breaker open, use the fallback
    Rejected,
}

impl CallPermit {
    pub fn allowed(self) -> bool {
        !matches!(self, CallPermit::Rejected)
    }
}

/// Breaker for one external dependency
#[derive(Clone)]
pub struct SharedCircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
}

impl SharedCircuitBreaker {
    pub fn new(
        name: &str,
        config: CircuitBreakerConfig,
        kv: Arc<dyn KvStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            kv,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        format!("breaker:{}", self.name)
    }

    async fn load(&self) -> Result<(Option<Vec<u8>>, CircuitBreakerRecord)> {
        let raw = self.kv.get(&self.key()).await?;
        let record = match &raw {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => CircuitBreakerRecord::closed(&self.name),
        };
        Ok((raw, record))
    }

    async fn swap(&self, expected: Option<&[u8]>, next: &CircuitBreakerRecord) -> Result<bool> {
        let bytes = serde_json::to_vec(next)?;
        self.kv
            .compare_and_swap(&self.key(), expected, Some(&bytes), None)
            .await
    }

    fn open_elapsed(&self, record: &CircuitBreakerRecord, now: DateTime<Utc>) -> bool {
        record
            .opened_at
            .map_or(true, |at| now - at >= ttl_to_chrono(self.config.timeout))
    }

    fn note_transition(&self, state: CircuitState) {
        CIRCUIT_BREAKER_TRANSITIONS
            .with_label_values(&[&self.name, &state.to_string()])
            .inc();
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[&self.name])
            .set(state.gauge_value());
    }

    /// Current persisted record
    pub async fn snapshot(&self) -> Result<CircuitBreakerRecord> {
        Ok(self.load().await?.1)
    }

    /// Effective state: an open breaker past its timeout reports half-open
    pub async fn state(&self) -> Result<CircuitState> {
        let record = self.snapshot().await?;
        if record.state == CircuitState::Open && self.open_elapsed(&record, self.clock.now()) {
            return Ok(CircuitState::HalfOpen);
        }
        Ok(record.state)
    }

    /// Ask whether a call may go to the dependency
    pub async fn allow_request(&self) -> Result<CallPermit> {
        for _ in 0..BREAKER_CAS_ATTEMPTS {
            let (raw, record) = self.load().await?;
            let now = self.clock.now();

            let next = match record.state {
                CircuitState::Closed => return Ok(CallPermit::Normal),
                CircuitState::Open => {
                    if !self.open_elapsed(&record, now) {
                        return Ok(CallPermit::Rejected);
                    }
                    CircuitBreakerRecord {
                        state: CircuitState::HalfOpen,
                        trials_in_flight: 1,
                        trial_started_at: Some(now),
                        ..record.clone()
                    }
                }
                CircuitState::HalfOpen => {
                    let stale = record
                        .trial_started_at
                        .map_or(true, |at| now - at >= ttl_to_chrono(self.config.timeout));
                    if record.trials_in_flight < self.config.half_open_trials {
                        CircuitBreakerRecord {
                            trials_in_flight: record.trials_in_flight + 1,
                            trial_started_at: Some(now),
                            ..record.clone()
                        }
                    } else if stale {
                        // Trial holder never reported back
                        CircuitBreakerRecord {
                            trials_in_flight: 1,
                            trial_started_at: Some(now),
                            ..record.clone()
                        }
                    } else {
                        return Ok(CallPermit::Rejected);
                    }
                }
            };

            if self.swap(raw.as_deref(), &next).await? {
                if record.state == CircuitState::Open {
                    info!(
                        breaker = %self.name,
                        "Circuit breaker transitioning from Open to HalfOpen after {:?}",
                        self.config.timeout
                    );
                    self.note_transition(CircuitState::HalfOpen);
                }
                return Ok(CallPermit::Trial);
            }
        }

        warn!(breaker = %self.name, "Breaker update contention, treating call as rejected");
        Ok(CallPermit::Rejected)
    }

    /// Record a successful call
    pub async fn record_success(&self) -> Result<CircuitState> {
        for _ in 0..BREAKER_CAS_ATTEMPTS {
            let (raw, record) = self.load().await?;
            let next = match record.state {
                CircuitState::Closed if record.consecutive_failures == 0 => {
                    return Ok(CircuitState::Closed)
                }
                CircuitState::Closed => CircuitBreakerRecord {
                    consecutive_failures: 0,
                    ..record.clone()
                },
                CircuitState::HalfOpen => CircuitBreakerRecord::closed(&self.name),
                // A call admitted before the breaker opened; it proves nothing
                CircuitState::Open => return Ok(CircuitState::Open),
            };

            if self.swap(raw.as_deref(), &next).await? {
                if record.state == CircuitState::HalfOpen {
                    info!(breaker = %self.name, "Circuit breaker closing after successful trial");
                    self.note_transition(CircuitState::Closed);
                }
                return Ok(next.state);
            }
        }
        warn!(breaker = %self.name, "Could not record breaker success after retries");
        self.state().await
    }

    /// Record a failed or timed-out call
    pub async fn record_failure(&self) -> Result<CircuitState> {
        for _ in 0..BREAKER_CAS_ATTEMPTS {
            let (raw, record) = self.load().await?;
            let now = self.clock.now();
            let failures = record.consecutive_failures.saturating_add(1);

            let next = match record.state {
                CircuitState::Closed if failures >= self.config.failure_threshold => {
                    CircuitBreakerRecord {
                        state: CircuitState::Open,
                        consecutive_failures: failures,
                        opened_at: Some(now),
                        trials_in_flight: 0,
                        trial_started_at: None,
                        ..record.clone()
                    }
                }
                CircuitState::Closed | CircuitState::Open => CircuitBreakerRecord {
                    consecutive_failures: failures,
                    ..record.clone()
                },
                CircuitState::HalfOpen => CircuitBreakerRecord {
                    state: CircuitState::Open,
                    consecutive_failures: failures,
                    opened_at: Some(now),
                    trials_in_flight: 0,
                    trial_started_at: None,
                    ..record.clone()
                },
            };

            if self.swap(raw.as_deref(), &next).await? {
                if next.state == CircuitState::Open && record.state != CircuitState::Open {
                    warn!(
                        breaker = %self.name,
                        "Circuit breaker opening after {} consecutive failures",
                        failures
                    );
                    self.note_transition(CircuitState::Open);
                } else {
                    debug!(breaker = %self.name, failures, "Breaker failure recorded");
                }
                return Ok(next.state);
            }
        }
        warn!(breaker = %self.name, "Could not record breaker failure after retries");
        self.state().await
    }

    /// Force the breaker closed
    pub async fn reset(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&CircuitBreakerRecord::closed(&self.name))?;
        self.kv.set(&self.key(), &bytes, None).await?;
        self.note_transition(CircuitState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKv;

    fn breaker() -> (SharedCircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_trials: 1,
        };
        (
            SharedCircuitBreaker::new("llm:test", config, kv, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let (breaker, _) = breaker();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Normal);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            assert_eq!(breaker.record_failure().await.unwrap(), CircuitState::Closed);
        }
        assert_eq!(breaker.record_failure().await.unwrap(), CircuitState::Open);
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Rejected);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            breaker.record_failure().await.unwrap();
        }
        breaker.record_success().await.unwrap();
        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.snapshot().await.unwrap().consecutive_failures, 1);
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_single_trial_then_close() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);

        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Trial);
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Rejected);

        assert_eq!(breaker.record_success().await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Normal);
    }

    #[tokio::test]
    async fn test_trial_failure_reopens() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Trial);
        assert_eq!(breaker.record_failure().await.unwrap(), CircuitState::Open);
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Rejected);

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(breaker.allow_request().await.unwrap(), CallPermit::Trial);
    }

    #[tokio::test]
    async fn test_state_shared_between_handles() {
        let (breaker, _) = breaker();
        let other = breaker.clone();
        for _ in 0..5 {
            breaker.record_failure().await.unwrap();
        }
        assert_eq!(other.allow_request().await.unwrap(), CallPermit::Rejected);
    }
}
