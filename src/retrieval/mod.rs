// Retrieval
// Embeds a question and ranks a knowledge base's chunks against it


use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::database::vector::ChunkMetadata;
use crate::knowledge::KnowledgeBaseRegistry;
use crate::{KbError, Result};

/// A retrieved chunk with its score and source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub score: f32,
    pub document_id: String,
    pub chunk_id: String,
    pub ordinal: usize,
    pub title: String,
    pub text: String,
}

pub struct RetrievalEngine {
    registry: Arc<KnowledgeBaseRegistry>,
    defaults: RetrievalConfig,
}

impl RetrievalEngine {
    #[inline]
    pub fn new(registry: Arc<KnowledgeBaseRegistry>, defaults: RetrievalConfig) -> Self {
        Self { registry, defaults }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<KnowledgeBaseRegistry> {
        &self.registry
    }

    #[inline]
    pub fn defaults(&self) -> RetrievalConfig {
        self.defaults
    }

    /// Query with the configured `top_k` and score threshold
    #[inline]
    pub async fn query_default(&self, question: &str, kb_id: &str) -> Result<Vec<ContextItem>> {
        self.query(
            question,
            kb_id,
            self.defaults.top_k,
            self.defaults.score_threshold,
        )
        .await
    }

    /// Top `k` chunks of a knowledge base scoring at least `threshold`, best first
    #[inline]
    pub async fn query(
        &self,
        question: &str,
        kb_id: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ContextItem>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(KbError::Validation("Query cannot be empty".to_string()));
        }
        if k == 0 {
            return Err(KbError::Validation(
                "Number of results must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(KbError::Validation(format!(
                "Score threshold must be between 0 and 1, got {}",
                threshold
            )));
        }

        let kb = self.registry.get_knowledge_base(kb_id).await?;
        let vectors = self.registry.vector_index();
        if !vectors.has_collection(&kb.vector_collection_id).await? {
            return Err(KbError::NotFound(format!(
                "Vector collection {} for knowledge base {}",
                kb.vector_collection_id, kb.id
            )));
        }

        let embedding = self.registry.embedder().embed_one(question).await?;
        let hits = vectors
            .similarity_search(&kb.vector_collection_id, &embedding, k, threshold)
            .await?;

        let mut items = Vec::with_capacity(hits.len());
        for hit in hits {
            match ChunkMetadata::from_map(&hit.metadata) {
                Ok(metadata) => items.push(ContextItem {
                    score: hit.score,
                    document_id: metadata.document_id,
                    chunk_id: metadata.chunk_id,
                    ordinal: metadata.ordinal,
                    title: metadata.title,
                    text: metadata.text,
                }),
                Err(e) => warn!("Skipping search hit {} with bad metadata: {}", hit.id, e),
            }
        }

        debug!(
            "Retrieved {} chunks from knowledge base {} (k={}, threshold={})",
            items.len(),
            kb.id,
            k,
            threshold
        );
        Ok(items)
    }
}

/// Render context items as numbered source blocks for a model prompt
#[inline]
pub fn format_context(items: &[ContextItem]) -> String {
    if items.is_empty() {
        return "No relevant passages were found in the knowledge base.".to_string();
    }

    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str("\n\n");
        }
        let _ = write!(
            out,
            "[{}] {} (document {}, chunk {}, score {:.2})\n{}",
            index + 1,
            item.title,
            item.document_id,
            item.ordinal,
            item.score,
            item.text
        );
    }
    out
}
