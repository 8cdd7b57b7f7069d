//! Structured error types for the tiered memory system
//!
//! Every failure the tiers and engines can surface maps to one variant with a
//! stable machine-readable code. Engines use the classification helpers to
//! decide between failing fast, falling back, retrying, and deferring to the
//! next cycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error record for reports and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Unit, session or episode the error is scoped to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Memory system error taxonomy
#[derive(Debug)]
pub enum MemoryError {
    // Contract violations (fatal, fail fast)
    Validation { field: String, reason: String },
    ThresholdNotMet { score: f32, threshold: f32 },

    // Dependency failures (recovered through fallback)
    ExtractionFailure(String),
    CircuitOpen { dependency: String },
    Timeout { operation: String, after_ms: u64 },

    // Coordination failures (retried, then deferred)
    LockAcquisition { resource: String, reason: String },

    // Partial dual-index write (compensated, logged as critical)
    Consistency { episode_id: String, detail: String },

    // Storage layer
    NotFound(String),
    Storage(String),
    Serialization(String),

    // Generic wrapper for adapter internals
    Internal(anyhow::Error),
}

impl MemoryError {
    /// Shorthand for a field validation failure
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a storage failure from any displayable error
    pub fn storage(err: impl fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Shorthand for a lock failure
    pub fn lock_failed(resource: &str, reason: &str) -> Self {
        Self::LockAcquisition {
            resource: resource.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Get error code for identification in logs and reports
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::ThresholdNotMet { .. } => "THRESHOLD_NOT_MET",
            Self::ExtractionFailure(_) => "EXTRACTION_FAILURE",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Timeout { .. } => "TIMEOUT",
            Self::LockAcquisition { .. } => "LOCK_ACQUISITION_FAILED",
            Self::Consistency { .. } => "CONSISTENCY_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get detailed error message
    pub fn message(&self) -> String {
        match self {
            Self::Validation { field, reason } => {
                format!("Invalid value for '{field}': {reason}")
            }
            Self::ThresholdNotMet { score, threshold } => {
                format!("CIAR score {score:.4} is below the promotion threshold {threshold:.4}")
            }
            Self::ExtractionFailure(msg) => format!("Extraction failed: {msg}"),
            Self::CircuitOpen { dependency } => {
                format!("Circuit breaker for '{dependency}' is open")
            }
            Self::Timeout { operation, after_ms } => {
                format!("Operation '{operation}' timed out after {after_ms}ms")
            }
            Self::LockAcquisition { resource, reason } => {
                format!("Failed to acquire lock on '{resource}': {reason}")
            }
            Self::Consistency { episode_id, detail } => {
                format!("Dual-index consistency violation for episode {episode_id}: {detail}")
            }
            Self::NotFound(id) => format!("Record not found: {id}"),
            Self::Storage(msg) => format!("Storage error: {msg}"),
            Self::Serialization(msg) => format!("Serialization error: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }

    /// Errors that violate a contract and must never be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::ThresholdNotMet { .. })
    }

    /// Errors worth retrying on a later attempt or cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockAcquisition { .. }
                | Self::Consistency { .. }
                | Self::Timeout { .. }
                | Self::Storage(_)
        )
    }

    /// Errors that count against a dependency's circuit breaker
    pub fn counts_as_dependency_failure(&self) -> bool {
        matches!(self, Self::ExtractionFailure(_) | Self::Timeout { .. })
    }

    /// Convert to a serializable record
    pub fn to_record(&self, scope: Option<&str>) -> ErrorRecord {
        ErrorRecord {
            code: self.code().to_string(),
            message: self.message(),
            scope: scope.map(str::to_string),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for MemoryError {}

impl From<anyhow::Error> for MemoryError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for MemoryError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<tantivy::TantivyError> for MemoryError {
    fn from(err: tantivy::TantivyError) -> Self {
        Self::Storage(format!("full-text index: {err}"))
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::anyhow!("background task failed: {err}"))
    }
}

/// Type alias for Results using MemoryError
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MemoryError::validation("certainty", "out of range").code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            MemoryError::ThresholdNotMet {
                score: 0.2,
                threshold: 0.6
            }
            .code(),
            "THRESHOLD_NOT_MET"
        );
        assert_eq!(MemoryError::NotFound("x".into()).code(), "NOT_FOUND");
    }

    #[test]
    fn test_classification() {
        assert!(MemoryError::validation("impact", "NaN").is_fatal());
        assert!(!MemoryError::validation("impact", "NaN").is_retryable());
        assert!(MemoryError::lock_failed("episode:s1", "held").is_retryable());
        assert!(MemoryError::Timeout {
            operation: "llm".into(),
            after_ms: 10
        }
        .counts_as_dependency_failure());
        assert!(!MemoryError::Storage("down".into()).counts_as_dependency_failure());
    }

    #[test]
    fn test_error_record() {
        let err = MemoryError::Consistency {
            episode_id: "ep_1".into(),
            detail: "graph write failed".into(),
        };
        let record = err.to_record(Some("session-1"));

        assert_eq!(record.code, "CONSISTENCY_ERROR");
        assert!(record.message.contains("ep_1"));
        assert_eq!(record.scope.as_deref(), Some("session-1"));
    }
}
