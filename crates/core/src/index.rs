use crate::embeddings::EmbeddingProvider;
use crate::error::PipelineError;
use crate::models::{IndexMetadata, IndexStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub text: String,
    pub vector: Vec<f32>,
}

/// Immutable set of (chunk text, vector) pairs searched by cosine distance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorIndex {
    metadata: IndexMetadata,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Embeds every chunk and returns a fresh index.
    pub fn build(
        collection: &str,
        chunks: &[String],
        provider: &dyn EmbeddingProvider,
    ) -> Result<Self, PipelineError> {
        if chunks.is_empty() {
            return Err(PipelineError::EmptyInput(
                "cannot build an index from zero chunks".to_string(),
            ));
        }

        let vectors = provider.embed(chunks)?;
        if vectors.len() != chunks.len() {
            return Err(PipelineError::external(
                provider.model_id(),
                format!(
                    "embedding count {} doesn't match chunk count {}",
                    vectors.len(),
                    chunks.len()
                ),
            ));
        }

        let metadata = IndexMetadata {
            build_id: Uuid::new_v4(),
            collection: collection.to_string(),
            embedding_model: provider.model_id().to_string(),
            dimension: provider.dimensions(),
            created_at: Utc::now(),
        };

        let entries = chunks
            .iter()
            .cloned()
            .zip(vectors)
            .map(|(text, vector)| IndexEntry { text, vector })
            .collect();

        Self::from_parts(metadata, entries)
    }

    /// Reassembles an index, rejecting vectors whose dimension differs from the metadata.
    pub fn from_parts(
        metadata: IndexMetadata,
        entries: Vec<IndexEntry>,
    ) -> Result<Self, PipelineError> {
        if let Some((position, entry)) = entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.vector.len() != metadata.dimension)
        {
            return Err(PipelineError::InvalidArgument(format!(
                "vector {position} has dimension {} but the index expects {}",
                entry.vector.len(),
                metadata.dimension
            )));
        }

        Ok(Self { metadata, entries })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            ready: true,
            count: self.entries.len(),
        }
    }

    /// Embeds the query with `provider` and returns the nearest chunk texts.
    pub fn query(
        &self,
        query_text: &str,
        top_k: usize,
        provider: &dyn EmbeddingProvider,
    ) -> Result<Vec<String>, PipelineError> {
        if provider.model_id() != self.metadata.embedding_model {
            return Err(PipelineError::InvalidArgument(format!(
                "index was built with {} but the query provider is {}",
                self.metadata.embedding_model,
                provider.model_id()
            )));
        }

        let query_vector = provider.embed_query(query_text)?;
        self.nearest(&query_vector, top_k)
    }

    /// Nearest first; equal distances keep insertion order.
    pub fn nearest(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<String>, PipelineError> {
        if query_vector.len() != self.metadata.dimension {
            return Err(PipelineError::InvalidArgument(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.metadata.dimension
            )));
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, cosine_distance(query_vector, &entry.vector)))
            .collect();

        // Stable sort, so ties stay in insertion order.
        scored.sort_by(|left, right| left.1.partial_cmp(&right.1).unwrap_or(Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k.min(self.entries.len()))
            .map(|(position, _)| self.entries[position].text.clone())
            .collect())
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        1.0
    } else {
        1.0 - dot / (mag_a * mag_b)
    }
}
