//! LLM client abstraction
//!
//! Extraction, episode summaries and knowledge synthesis each call a language
//! model through `LlmClient`. Every call carries a hard timeout; callers wrap
//! it in a circuit breaker and fall back to deterministic code paths.

pub mod guarded;
pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use guarded::GuardedLlm;
pub use ollama::OllamaClient;

use crate::errors::MemoryError;

/// JSON produced by a structured-output call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredResult {
    pub value: serde_json::Value,
    pub model: String,
}

/// LLM call failures
#[derive(Debug, Clone, PartialEq)]
pub enum LlmError {
    /// The call exceeded its hard timeout
    Timeout(Duration),
    /// Transport or provider-side failure
    Provider(String),
    /// Output did not parse as the requested structure
    InvalidOutput(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "LLM call timed out after {after:?}"),
            Self::Provider(msg) => write!(f, "LLM provider error: {msg}"),
            Self::InvalidOutput(msg) => write!(f, "LLM returned invalid output: {msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<LlmError> for MemoryError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(after) => MemoryError::Timeout {
                operation: "llm".to_string(),
                after_ms: after.as_millis() as u64,
            },
            other => MemoryError::ExtractionFailure(other.to_string()),
        }
    }
}

/// Language model client
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate JSON conforming to `schema`
    async fn extract_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        timeout: Duration,
    ) -> Result<StructuredResult, LlmError>;

    /// Generate free text
    async fn generate_text(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError>;

    /// Provider name for breaker keys and logs
    fn name(&self) -> &str;
}

/// Pull the first balanced JSON object out of model output
///
/// Models wrap JSON in markdown fences or chatter; this strips both.
pub fn extract_json(output: &str) -> Option<&str> {
    let cleaned = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = cleaned.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in cleaned[start..].char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&cleaned[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_output() {
        let output = "```json\n{\"facts\": [{\"content\": \"likes {braces}\"}]}\n```";
        let json = extract_json(output).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["facts"][0]["content"], "likes {braces}");
    }

    #[test]
    fn test_extract_json_with_chatter() {
        let output = "Sure! Here it is: {\"a\": 1} hope that helps";
        assert_eq!(extract_json(output), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{\"unterminated\": "), None);
    }

    #[test]
    fn test_timeout_maps_to_timeout_error() {
        let err: MemoryError = LlmError::Timeout(Duration::from_millis(250)).into();
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.counts_as_dependency_failure());

        let err: MemoryError = LlmError::InvalidOutput("bad".into()).into();
        assert_eq!(err.code(), "EXTRACTION_FAILURE");
    }
}
