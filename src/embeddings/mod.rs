// Embeddings module
// Remote embedding generation and deterministic text chunking

pub mod chunking;
pub mod client;

use async_trait::async_trait;

use crate::{KbError, Result};

pub use chunking::{ChunkingConfig, TextChunk, chunk_text};
pub use client::EmbeddingClient;

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimensionality of every vector this embedder produces
    fn dimension(&self) -> usize;

    /// Embed many texts, preserving input order
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_many(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| KbError::RemoteService("Embedding response was empty".to_string()))
    }
}
