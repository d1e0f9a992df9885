//! Embedding distance probe (component B).
//!
//! Computes cosine distance between two text spans via an injected
//! embedding client, with the gate's whitespace-only short-circuit applied
//! by the caller (see [`crate::gate`]).

use async_trait::async_trait;

use crate::error::GateError;

/// A dense embedding vector. All vectors returned by one client call share
/// dimensionality.
pub type Vector = Vec<f32>;

/// Capability interface for an embedding provider, injected at construction.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts. Returning fewer vectors than inputs is a
    /// protocol error the caller surfaces as [`GateError::EmbeddingProtocolError`].
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vector>, GateError>;
}

/// Cosine distance between two spans, via a 2-vector batch from `client`.
///
/// If either vector is all-zero, returns `1.0` (maximally distant). If the
/// client returns fewer than two vectors, fails with
/// [`GateError::EmbeddingProtocolError`].
pub async fn distance(
    client: &dyn EmbeddingClient,
    old_span: &str,
    new_span: &str,
) -> Result<f64, GateError> {
    let vectors = client
        .embed_many(&[old_span.to_string(), new_span.to_string()])
        .await?;

    if vectors.len() < 2 {
        return Err(GateError::EmbeddingProtocolError {
            expected: 2,
            got: vectors.len(),
        });
    }

    Ok(cosine_distance(&vectors[0], &vectors[1]))
}

/// Raw cosine distance between two vectors of equal length.
///
/// All-zero vectors on either side return `1.0`. Similarity is clamped to
/// `[-1, 1]` before computing `1 - similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    let similarity = (dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0);
    1.0 - similarity
}

/// A deterministic fixed-vector embedding client for tests and demos.
///
/// Returns the same pre-seeded vector for every text in the batch it is
/// configured with; real deployments inject a provider backed by a remote
/// embedding API instead.
#[derive(Debug, Clone, Default)]
pub struct FixedVectorEmbeddingClient {
    vectors: Vec<Vector>,
}

impl FixedVectorEmbeddingClient {
    /// Construct a client that always returns `vectors` regardless of input,
    /// for exactly as many texts as were requested (cycling if fewer vectors
    /// than texts were provided).
    pub fn new(vectors: Vec<Vector>) -> Self {
        Self { vectors }
    }
}

#[async_trait]
impl EmbeddingClient for FixedVectorEmbeddingClient {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vector>, GateError> {
        if self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, _)| self.vectors[i % self.vectors.len()].clone())
            .collect())
    }
}
