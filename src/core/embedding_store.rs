//! Embedding storage and the text-embedding collaborator.
//!
//! The store is a plain key-value map from resource to vector with a fixed
//! dimension checked on every `put`. Vectors are owned per resource: a `put`
//! always stores a fresh allocation, so two resources never alias one vector.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fxhash::hash64;
use parking_lot::RwLock;

use crate::core::MatchError;
use crate::util::serde::ResourceId;

/// Check that `vector` has `dimension` finite components.
pub(crate) fn validate_vector(dimension: usize, vector: &[f32]) -> Result<(), MatchError> {
    if vector.len() != dimension {
        return Err(MatchError::DimensionMismatch {
            expected: dimension,
            got: vector.len(),
        });
    }
    if vector.iter().any(|c| !c.is_finite()) {
        return Err(MatchError::Embedding("vector has non-finite components".into()));
    }
    Ok(())
}

/// Thread-safe resource → vector map.
pub struct EmbeddingStore {
    dimension: usize,
    vectors: RwLock<HashMap<ResourceId, Arc<Vec<f32>>>>,
}

impl EmbeddingStore {
    /// Create an empty store for vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Store (or replace) the vector for a resource.
    pub fn put(&self, resource_id: ResourceId, vector: Vec<f32>) -> Result<(), MatchError> {
        validate_vector(self.dimension, &vector)?;
        self.vectors.write().insert(resource_id, Arc::new(vector));
        Ok(())
    }

    /// Fetch the vector for a resource.
    pub fn get(&self, resource_id: ResourceId) -> Option<Arc<Vec<f32>>> {
        self.vectors.read().get(&resource_id).cloned()
    }

    /// Drop the vector for a resource, returning it if present.
    pub fn remove(&self, resource_id: ResourceId) -> Option<Arc<Vec<f32>>> {
        self.vectors.write().remove(&resource_id)
    }

    /// Configured dimension.
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.read().len()
    }

    /// True when no vectors are stored.
    pub fn is_empty(&self) -> bool {
        self.vectors.read().is_empty()
    }
}

/// External text-embedding collaborator (e.g. a sentence-transformer endpoint).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimension of `embed`.
    fn dimension(&self) -> usize;

    /// Embed free text into a dense vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError>;
}

/// Deterministic bag-of-words embedder using feature hashing.
///
/// Tokens are lowercased alphanumeric runs; each token adds ±1 to a hashed
/// bucket and the result is L2-normalized. Texts sharing words end up close
/// under cosine distance, which is enough for development and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    /// Create an embedder producing `dimension`-component vectors.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Synchronous embedding used by the async trait impl.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimension];
        if self.dimension == 0 {
            return v;
        }
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = hash64(token.to_lowercase().as_bytes());
            #[allow(clippy::cast_possible_truncation)]
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize_in_place(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        Ok(self.embed_text(text))
    }
}

/// Scale `v` to unit length; zero vectors are left untouched.
pub fn l2_normalize_in_place(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
