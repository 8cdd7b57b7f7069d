//! Hashed bag-of-stems embedder
//!
//! Each stemmed content word is hashed into a bucket with a hashed sign, and
//! word bigrams add a lighter second signal. Texts sharing vocabulary land
//! close together, which is enough for episode clustering and near-duplicate
//! detection without a neural model.
//!
//! Features are hashed with SHA-256 so persisted embeddings stay comparable
//! across builds.

use anyhow::Result;
use rust_stemmers::{Algorithm, Stemmer};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::Embedder;
use crate::constants::HASH_EMBEDDING_DIM;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
    "in", "on", "at", "for", "with", "by", "from", "it", "its", "this", "that", "these", "those",
    "as", "do", "does", "did", "have", "has", "had", "i", "me", "my", "we", "our", "you", "your",
    "he", "she", "they", "them", "their", "so", "if", "then", "than", "not", "no", "can", "will",
    "would", "should", "could", "just", "very", "also", "about", "into", "user",
];

const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashEmbedder {
    dimension: usize,
    stemmer: Stemmer,
    stopwords: HashSet<&'static str>,
}

impl std::fmt::Debug for HashEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashEmbedder")
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(HASH_EMBEDDING_DIM)
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
            stemmer: Stemmer::create(Algorithm::English),
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    /// Lowercased, stemmed content words in order
    pub fn terms(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .filter(|w| !self.stopwords.contains(w.as_str()))
            .map(|w| self.stemmer.stem(&w).into_owned())
            .collect()
    }

    fn add_feature(&self, embedding: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let hash = u64::from_be_bytes(prefix);

        let index = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        embedding[index] += sign * weight;
    }
}

impl Embedder for HashEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0; self.dimension];
        let terms = self.terms(text);

        for term in &terms {
            self.add_feature(&mut embedding, term, 1.0);
        }
        for pair in terms.windows(2) {
            self.add_feature(&mut embedding, &format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut embedding {
                *val /= norm;
            }
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[test]
    fn test_embedding_is_normalized() {
        let embedder = HashEmbedder::default();
        let v = embedder.encode("Prefers dark roast coffee in the morning").unwrap();
        assert_eq!(v.len(), HASH_EMBEDDING_DIM);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::default();
        let v = embedder.encode("the and of").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_shared_vocabulary_is_closer() {
        let embedder = HashEmbedder::default();
        let a = embedder.encode("User prefers Python for data analysis").unwrap();
        let b = embedder.encode("prefers python for analysing data").unwrap();
        let c = embedder.encode("Flight to Lisbon departs on Friday").unwrap();

        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert!(cosine_similarity(&a, &a) > 0.999);
    }

    #[test]
    fn test_buckets_are_fixed() {
        let embedder = HashEmbedder::default();
        let v = embedder.encode("Python").unwrap();
        assert_eq!(v[73], 1.0);
        assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 1);

        let narrow = HashEmbedder::new(384).encode("python").unwrap();
        assert_eq!(narrow[329], 1.0);
    }

    #[test]
    fn test_terms_are_stemmed() {
        let embedder = HashEmbedder::default();
        assert_eq!(embedder.terms("Running runs"), vec!["run", "run"]);
    }
}
