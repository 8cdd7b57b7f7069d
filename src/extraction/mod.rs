//! Turn-to-unit extraction with breaker-guarded LLM and rule-based fallback
//!
//! The strategy is chosen per batch:
//! - No LLM configured, or breaker open: rule-based
//! - Otherwise one LLM call per batch under a hard timeout; any failure or
//!   timeout is recorded against the breaker and the batch is re-extracted
//!   with rules, so callers always get units back

pub mod llm_extractor;
pub mod rule_based;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use llm_extractor::LlmExtractor;
pub use rule_based::RuleBasedExtractor;

use crate::errors::{MemoryError, Result};
use crate::llm::{LlmClient, LlmError};
use crate::memory::types::{ExtractedUnit, Turn};
use crate::metrics::EXTRACTION_TOTAL;
use crate::resilience::{CallPermit, SharedCircuitBreaker};

/// Which path produced a batch's units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    LlmBacked,
    RuleBased,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmBacked => "llm",
            Self::RuleBased => "rule_based",
        }
    }
}

/// Context for one extraction call
#[derive(Debug, Clone)]
pub struct BatchMetadata {
    pub session_id: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub units: Vec<ExtractedUnit>,
    pub strategy: ExtractionStrategy,
    /// Why the LLM path was skipped or abandoned
    pub fallback_reason: Option<String>,
}

impl ExtractionOutcome {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

pub struct FactExtractor {
    llm: Option<LlmExtractor>,
    breaker: SharedCircuitBreaker,
    rules: RuleBasedExtractor,
    timeout: Duration,
}

impl FactExtractor {
    pub fn new(
        llm: Option<Arc<dyn LlmClient>>,
        breaker: SharedCircuitBreaker,
        timeout: Duration,
    ) -> Self {
        Self {
            llm: llm.map(LlmExtractor::new),
            breaker,
            rules: RuleBasedExtractor::new(),
            timeout,
        }
    }

    pub fn breaker(&self) -> &SharedCircuitBreaker {
        &self.breaker
    }

    pub fn rules(&self) -> &RuleBasedExtractor {
        &self.rules
    }

    /// Extract units from a batch of turns
    ///
    /// Only storage errors while consulting the breaker propagate; LLM
    /// failures always degrade to the rule-based path.
    pub async fn extract(&self, turns: &[Turn], metadata: &BatchMetadata) -> Result<ExtractionOutcome> {
        let Some(llm) = &self.llm else {
            return Ok(self.rule_based(turns, None));
        };

        let permit = self.breaker.allow_request().await?;
        if permit == CallPermit::Rejected {
            let reason = MemoryError::CircuitOpen {
                dependency: self.breaker.name().to_string(),
            };
            debug!(session_id = %metadata.session_id, "{}", reason);
            return Ok(self.rule_based(turns, Some(reason.message())));
        }

        match llm.extract(turns, self.timeout).await {
            Ok(units) => {
                self.breaker.record_success().await?;
                EXTRACTION_TOTAL
                    .with_label_values(&[ExtractionStrategy::LlmBacked.as_str()])
                    .inc();
                if permit == CallPermit::Trial {
                    info!(session_id = %metadata.session_id, "LLM extraction recovered");
                }
                Ok(ExtractionOutcome {
                    units,
                    strategy: ExtractionStrategy::LlmBacked,
                    fallback_reason: None,
                })
            }
            Err(e) => {
                let state = self.breaker.record_failure().await?;
                let err = MemoryError::from(e.clone());
                crate::metrics::record_error(&err, "extraction");
                warn!(
                    session_id = %metadata.session_id,
                    client = llm.client_name(),
                    breaker_state = %state,
                    error = %e,
                    "LLM extraction failed, using rule-based fallback"
                );
                let reason = match e {
                    LlmError::Timeout(after) => format!("llm timed out after {after:?}"),
                    other => other.to_string(),
                };
                Ok(self.rule_based(turns, Some(reason)))
            }
        }
    }

    fn rule_based(&self, turns: &[Turn], reason: Option<String>) -> ExtractionOutcome {
        EXTRACTION_TOTAL
            .with_label_values(&[ExtractionStrategy::RuleBased.as_str()])
            .inc();
        ExtractionOutcome {
            units: self.rules.extract(turns),
            strategy: ExtractionStrategy::RuleBased,
            fallback_reason: reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::llm::StructuredResult;
    use crate::memory::types::Role;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::storage::MemoryKv;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn extract_structured(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            timeout: Duration,
        ) -> std::result::Result<StructuredResult, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Timeout(timeout))
        }

        async fn generate_text(
            &self,
            _prompt: &str,
            timeout: Duration,
        ) -> std::result::Result<String, LlmError> {
            Err(LlmError::Timeout(timeout))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn turns() -> Vec<Turn> {
        vec![Turn {
            session_id: "s1".into(),
            turn_id: 1,
            role: Role::User,
            content: "I prefer Python for scripting.".into(),
            timestamp: Utc::now(),
        }]
    }

    #[tokio::test]
    async fn test_fallback_and_breaker_opens() {
        let clock = Arc::new(ManualClock::starting_now());
        let shared: SharedClock = clock.clone();
        let kv = Arc::new(MemoryKv::new(shared.clone()));
        let breaker = SharedCircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: 2,
                timeout: Duration::from_secs(60),
                half_open_trials: 1,
            },
            kv,
            shared,
        );
        let llm = Arc::new(FailingLlm {
            calls: AtomicUsize::new(0),
        });
        let client: Arc<dyn LlmClient> = llm.clone();
        let extractor = FactExtractor::new(Some(client), breaker, Duration::from_millis(50));
        let metadata = BatchMetadata {
            session_id: "s1".into(),
            now: Utc::now(),
        };

        for _ in 0..2 {
            let outcome = extractor.extract(&turns(), &metadata).await.unwrap();
            assert_eq!(outcome.strategy, ExtractionStrategy::RuleBased);
            assert_eq!(outcome.units.len(), 1);
        }
        assert_eq!(extractor.breaker().state().await.unwrap(), CircuitState::Open);

        // Open breaker skips the LLM entirely
        let outcome = extractor.extract(&turns(), &metadata).await.unwrap();
        assert!(outcome.used_fallback());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_llm_is_rule_based_without_reason() {
        let kv = Arc::new(MemoryKv::default());
        let breaker = SharedCircuitBreaker::new(
            "llm",
            CircuitBreakerConfig::default(),
            kv,
            crate::clock::system_clock(),
        );
        let extractor = FactExtractor::new(None, breaker, Duration::from_secs(1));
        let outcome = extractor
            .extract(
                &turns(),
                &BatchMetadata {
                    session_id: "s1".into(),
                    now: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.strategy, ExtractionStrategy::RuleBased);
        assert!(!outcome.used_fallback());
    }
}
