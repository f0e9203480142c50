// Vector index abstraction
// One trait, one adapter per backend, and the ranking rules both adapters share


use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, VectorBackendKind};
use crate::database::lancedb::LanceVectorIndex;
use crate::database::milvus::MilvusVectorIndex;
use crate::{KbError, Result};

/// Longest collection name either backend accepts
pub const MAX_COLLECTION_NAME_LEN: usize = 255;

/// A vector to store; a missing `id` is assigned on upsert
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: Option<String>,
    pub vector: Vec<f32>,
    pub metadata: Map<String, Value>,
}

/// Raw hit reported by a backend, in backend order
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCandidate {
    pub id: String,
    /// Cosine distance, absent when the backend did not report one
    pub distance: Option<f32>,
    pub metadata: Map<String, Value>,
}

/// Ranked search hit
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f32,
    pub metadata: Map<String, Value>,
}

/// Metadata stored alongside every chunk vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub knowledge_base_id: String,
    pub document_id: String,
    pub chunk_id: String,
    pub ordinal: usize,
    pub title: String,
    pub text: String,
}

impl ChunkMetadata {
    #[inline]
    pub fn into_map(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    #[inline]
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| KbError::VectorBackend(format!("Malformed chunk metadata: {}", e)))
    }
}

/// Per-collection vector storage with cosine similarity search
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Create the collection if absent; an existing one must have the same dimension
    async fn create_or_get_collection(&self, name: &str, dimension: usize) -> Result<()>;

    async fn has_collection(&self, name: &str) -> Result<bool>;

    /// Insert or replace records by id, returning the ids in input order
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>>;

    /// At most `k` records scoring at least `threshold`, best first
    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>>;

    async fn delete_records(&self, collection: &str, ids: &[String]) -> Result<()>;

    async fn count(&self, collection: &str) -> Result<usize>;

    /// Drop the collection; dropping a missing collection is not an error
    async fn delete_collection(&self, name: &str) -> Result<()>;
}

/// Convert a cosine distance into a similarity score in `(-inf, 1]`
#[inline]
pub fn distance_to_similarity(distance: Option<f32>) -> f32 {
    match distance {
        Some(d) if d.is_finite() => (1.0 - d).min(1.0),
        _ => 0.0,
    }
}

/// Score, filter and order backend candidates.
///
/// Candidates below `threshold` are dropped, the rest sorted by descending score with
/// ties kept in backend order, and at most `k` returned.
#[inline]
pub fn rank_candidates(
    candidates: Vec<SearchCandidate>,
    k: usize,
    threshold: f32,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = candidates
        .into_iter()
        .map(|candidate| ScoredRecord {
            score: distance_to_similarity(candidate.distance),
            id: candidate.id,
            metadata: candidate.metadata,
        })
        .filter(|record| record.score >= threshold)
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

/// Collection names must be identifiers: ASCII letter or `_` first, then letters, digits, `_`
#[inline]
pub fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_head && valid_tail && name.len() <= MAX_COLLECTION_NAME_LEN {
        Ok(())
    } else {
        Err(KbError::Validation(format!(
            "Invalid collection name '{}'",
            name
        )))
    }
}

/// Collection backing a knowledge base: `kb_` plus the id with `-` mapped to `_`
#[inline]
pub fn collection_name_for(knowledge_base_id: &str) -> String {
    format!("kb_{}", knowledge_base_id.replace('-', "_"))
}

/// Fill in missing ids, returning records paired with their final id
pub(crate) fn assign_ids(records: Vec<VectorRecord>) -> Vec<(String, VectorRecord)> {
    records
        .into_iter()
        .map(|record| {
            let id = record
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            (id, record)
        })
        .collect()
}

pub(crate) fn check_dimension(collection: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KbError::Validation(format!(
            "Vector has {} dimensions but collection '{}' declares {}",
            actual, collection, expected
        )))
    }
}

/// Process-wide vector client, constructed at most once even under concurrent first use
#[derive(Default)]
pub struct VectorIndexHandle {
    cell: OnceCell<Arc<dyn VectorIndex>>,
}

impl VectorIndexHandle {
    #[inline]
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Return the client, connecting with `config` on first use
    #[inline]
    pub async fn get_or_connect(&self, config: &Config) -> Result<Arc<dyn VectorIndex>> {
        self.get_or_init_with(|| connect_vector_index(config)).await
    }

    /// Return the client, running `init` only if no client exists yet.
    ///
    /// Concurrent callers wait for the single in-flight initialisation; a failed
    /// initialisation leaves the handle empty so a later call can retry.
    #[inline]
    pub async fn get_or_init_with<F, Fut>(&self, init: F) -> Result<Arc<dyn VectorIndex>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn VectorIndex>>>,
    {
        self.cell.get_or_try_init(init).await.map(Arc::clone)
    }

    #[inline]
    pub fn get(&self) -> Option<Arc<dyn VectorIndex>> {
        self.cell.get().map(Arc::clone)
    }
}

/// Construct the configured backend; misconfiguration fails here, before any request
#[inline]
pub async fn connect_vector_index(config: &Config) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match config.vector.backend {
        VectorBackendKind::Lance => {
            Arc::new(LanceVectorIndex::open(&config.vector_database_path()).await?)
        }
        VectorBackendKind::Milvus => {
            Arc::new(MilvusVectorIndex::connect(&config.vector.milvus).await?)
        }
    };
    info!("Connected {} vector backend", index.backend_name());
    Ok(index)
}
