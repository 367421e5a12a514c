use crate::chunking::TextChunk;
use crate::error::{RagError, RagResult};
use crate::gemini::GeminiClient;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity, 0.0 for zero vectors or mismatched dimensions
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.values.iter().zip(&other.values) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom <= f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }
}

/// Turns text into embeddings.
///
/// The same implementation must embed both the indexed chunks and the questions
/// asked against them.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed_query(&self, text: &str) -> RagResult<Embedding>;

    /// Embed chunks, one embedding per chunk in input order
    async fn embed_chunks(&self, chunks: &[TextChunk]) -> RagResult<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(chunks.len());

        for (idx, chunk) in chunks.iter().enumerate() {
            debug!("Embedding chunk {}/{}", idx + 1, chunks.len());
            embeddings.push(self.embed_query(&chunk.text).await?);
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed_query(&self, text: &str) -> RagResult<Embedding> {
        self.embed_text(text)
            .await
            .map(Embedding::new)
            .map_err(|e| RagError::EmbeddingService(format!("{:#}", e)))
    }
}
