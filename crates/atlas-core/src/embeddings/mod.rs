//! Embedding service - semantic vectors for events, entities, and queries
//!
//! Two backends behind one interface:
//! - **Hashed** (always available): deterministic feature-hashed bag-of-words
//!   vectors, unit-normalized. No model download, fully offline, stable
//!   across runs, which keeps SIMILAR_TO math and tier-2 entity resolution
//!   testable.
//! - **Local** (feature `embeddings`): fastembed ONNX inference.
//!
//! Vectors are 384-dimensional by default (configurable at construction).

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Default embedding dimensionality
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Query-embedding cache capacity
const QUERY_CACHE_CAPACITY: usize = 128;

/// Embedding error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Backend failed to produce a vector
    #[error("Embedding backend error: {0}")]
    Backend(String),
}

/// Embedding result type
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// A dense embedding vector with its dimensionality
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dimensions: usize,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }
}

enum Backend {
    Hashed { dimensions: usize },
    #[cfg(feature = "embeddings")]
    Local(Mutex<fastembed::TextEmbedding>),
}

/// Batchable embedding service with an LRU cache for repeated queries
pub struct Embedder {
    backend: Backend,
    model_id: String,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Embedder {
    /// Deterministic feature-hash embedder (the offline default)
    pub fn hashed(dimensions: usize) -> Self {
        Self {
            backend: Backend::Hashed { dimensions },
            model_id: format!("feature-hash-{dimensions}"),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
        }
    }

    /// Local ONNX model via fastembed
    #[cfg(feature = "embeddings")]
    pub fn local() -> Result<Self> {
        let model = fastembed::TextEmbedding::try_new(Default::default())
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
        Ok(Self {
            backend: Backend::Local(Mutex::new(model)),
            model_id: "fastembed-default".to_string(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("non-zero capacity"),
            )),
        })
    }

    /// Identifier of the active model, recorded in provenance metadata
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Embed one text, consulting the query cache first
    pub fn embed(&self, text: &str) -> Result<Embedding> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(vector) = cache.get(text) {
                return Ok(Embedding::new(vector.clone()));
            }
        }
        let embedding = self.embed_uncached(text)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), embedding.vector.clone());
        }
        Ok(embedding)
    }

    /// Embed a batch of texts
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        match &self.backend {
            Backend::Hashed { .. } => texts.iter().map(|t| self.embed(t)).collect(),
            #[cfg(feature = "embeddings")]
            Backend::Local(model) => {
                let mut model = model
                    .lock()
                    .map_err(|_| EmbeddingError::Backend("model lock poisoned".to_string()))?;
                let vectors = model
                    .embed(texts.to_vec(), None)
                    .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
                Ok(vectors.into_iter().map(Embedding::new).collect())
            }
        }
    }

    fn embed_uncached(&self, text: &str) -> Result<Embedding> {
        match &self.backend {
            Backend::Hashed { dimensions } => Ok(Embedding::new(hashed_embedding(text, *dimensions))),
            #[cfg(feature = "embeddings")]
            Backend::Local(model) => {
                let mut model = model
                    .lock()
                    .map_err(|_| EmbeddingError::Backend("model lock poisoned".to_string()))?;
                let mut vectors = model
                    .embed(vec![text.to_string()], None)
                    .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
                vectors
                    .pop()
                    .map(Embedding::new)
                    .ok_or_else(|| EmbeddingError::Backend("empty batch result".to_string()))
            }
        }
    }
}

/// Deterministic feature-hashed embedding: each lowercase token (and its
/// bigram with the previous token) is hashed into a signed bucket, then the
/// vector is unit-normalized.
fn hashed_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    let tokens: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let mut add_feature = |feature: &str| {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes")) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket % dimensions] += sign;
    };

    for (i, token) in tokens.iter().enumerate() {
        add_feature(token);
        if i > 0 {
            add_feature(&format!("{} {}", tokens[i - 1], token));
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// Cosine similarity between two vectors; 0.0 when shapes differ or either
/// is a zero vector
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_embedding_is_deterministic_and_normalized() {
        let embedder = Embedder::hashed(EMBEDDING_DIMENSIONS);
        let a = embedder.embed("configure email notifications").unwrap();
        let b = embedder.embed("configure email notifications").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dimensions, EMBEDDING_DIMENSIONS);

        let norm: f32 = a.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let embedder = Embedder::hashed(EMBEDDING_DIMENSIONS);
        let a = embedder.embed("send email alert to the user").unwrap();
        let b = embedder.embed("email alert sent to user").unwrap();
        let c = embedder.embed("compile the rust kernel module").unwrap();

        let close = cosine_similarity(&a.vector, &b.vector);
        let far = cosine_similarity(&a.vector, &c.vector);
        assert!(close > far, "close={close} far={far}");
    }

    #[test]
    fn identical_vectors_have_unit_similarity() {
        let embedder = Embedder::hashed(EMBEDDING_DIMENSIONS);
        let a = embedder.embed("same text").unwrap();
        assert!((cosine_similarity(&a.vector, &a.vector) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn batch_matches_single() {
        let embedder = Embedder::hashed(EMBEDDING_DIMENSIONS);
        let single = embedder.embed("alpha beta").unwrap();
        let batch = embedder
            .embed_batch(&["alpha beta".to_string(), "gamma".to_string()])
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], single);
    }
}
