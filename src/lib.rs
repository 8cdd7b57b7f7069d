//! Strata-Memory Library
//!
//! Tiered, significance-aware memory for long-running conversational agents.
//!
//! # Tiers
//! - L1 active context: the most recent turns per session
//! - L2 working memory: facts that pass the CIAR significance gate
//! - L3 episodic memory: consolidated, bi-temporal episodes indexed in a
//!   vector store and a graph store at once
//! - L4 semantic memory: knowledge distilled from recurring patterns
//!
//! # Lifecycle
//! Three background engines move information upward (promotion,
//! consolidation, distillation). Each degrades to a deterministic fallback
//! when the LLM is unavailable, guarded by a circuit breaker whose state is
//! shared through the KV store.

pub mod clock;
pub mod config;
pub mod constants;
pub mod decay;
pub mod embeddings;
pub mod errors;
pub mod extraction;
pub mod llm;
pub mod memory;
pub mod metrics;
pub mod resilience;
pub mod scheduler;
pub mod similarity;
pub mod storage;
pub mod tiers;
pub mod tracing_setup;

pub use errors::{MemoryError, Result};
pub use memory::{MemoryOrchestrator, RetrievedContext, StrataStores};

// Re-export dependencies to ensure tests/benchmarks use the same version
pub use chrono;
pub use uuid;
