//! Embedding generation
//!
//! Episodes, facts and knowledge documents are compared in embedding space for
//! clustering, deduplication and retrieval. The default `HashEmbedder` needs
//! no model files; deployments with a real encoder implement `Embedder` and
//! hand it to the orchestrator.

pub mod hashed;

use anyhow::Result;

pub use hashed::HashEmbedder;

/// Trait for embedding generation
pub trait Embedder: Send + Sync {
    /// Generate embedding for text
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Get embedding dimension
    fn dimension(&self) -> usize;

    /// Batch encode multiple texts (default: sequential)
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.encode(text)).collect()
    }
}
