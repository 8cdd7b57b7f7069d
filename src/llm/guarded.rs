//! Breaker-guarded LLM calls for callers with a deterministic fallback
//!
//! Summaries and knowledge synthesis only need "text or nothing": any
//! rejection, timeout or provider error returns `Ok(None)` and the caller
//! takes its fallback path. Only breaker storage failures propagate.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{LlmClient, LlmError};
use crate::errors::{MemoryError, Result};
use crate::metrics::record_error;
use crate::resilience::{CallPermit, SharedCircuitBreaker};

#[derive(Clone)]
pub struct GuardedLlm {
    client: Arc<dyn LlmClient>,
    breaker: SharedCircuitBreaker,
    timeout: Duration,
}

impl GuardedLlm {
    pub fn new(client: Arc<dyn LlmClient>, breaker: SharedCircuitBreaker, timeout: Duration) -> Self {
        Self {
            client,
            breaker,
            timeout,
        }
    }

    pub fn breaker(&self) -> &SharedCircuitBreaker {
        &self.breaker
    }

    /// Free text, or `None` when the caller should fall back
    pub async fn generate_text(&self, prompt: &str) -> Result<Option<String>> {
        if !self.permitted().await? {
            return Ok(None);
        }
        let call = self.client.generate_text(prompt, self.timeout);
        let outcome = tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(LlmError::Timeout(self.timeout)))
            .and_then(|text| {
                if text.trim().is_empty() {
                    Err(LlmError::InvalidOutput("empty completion".to_string()))
                } else {
                    Ok(text)
                }
            });
        self.settle(outcome).await
    }

    /// JSON matching `schema`, or `None` when the caller should fall back
    pub async fn extract_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        if !self.permitted().await? {
            return Ok(None);
        }
        let outcome = tokio::time::timeout(
            self.timeout,
            self.client.extract_structured(prompt, schema, self.timeout),
        )
        .await
        .unwrap_or(Err(LlmError::Timeout(self.timeout)))
        .map(|r| r.value);
        self.settle(outcome).await
    }

    async fn permitted(&self) -> Result<bool> {
        let permit = self.breaker.allow_request().await?;
        if permit == CallPermit::Rejected {
            debug!(breaker = self.breaker.name(), "Breaker open, skipping LLM call");
        }
        Ok(permit.allowed())
    }

    async fn settle<T>(&self, outcome: std::result::Result<T, LlmError>) -> Result<Option<T>> {
        match outcome {
            Ok(value) => {
                self.breaker.record_success().await?;
                Ok(Some(value))
            }
            Err(e) => {
                let state = self.breaker.record_failure().await?;
                record_error(&MemoryError::from(e.clone()), self.breaker.name());
                warn!(
                    client = self.client.name(),
                    breaker = self.breaker.name(),
                    breaker_state = %state,
                    error = %e,
                    "LLM call failed, using fallback"
                );
                Ok(None)
            }
        }
    }
}
