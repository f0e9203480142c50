// Deterministic fakes shared by unit tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::agent::llm::{ChatMessage, ChatModel, GenerateParams, ModelReply, ToolCall, ToolDefinition};
use crate::database::Database;
use crate::database::lancedb::LanceVectorIndex;
use crate::database::vector::{ScoredRecord, VectorIndex, VectorRecord};
use crate::embeddings::{ChunkingConfig, Embedder};
use crate::knowledge::KnowledgeBaseRegistry;
use crate::{KbError, Result};

pub(crate) const TEST_DIMENSION: usize = 32;

/// Bag-of-words embedder: each word bumps one hashed bucket, vectors are unit length
pub(crate) struct HashEmbedder {
    pub(crate) calls: AtomicUsize,
}

impl HashEmbedder {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn vector_for(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; TEST_DIMENSION];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
                    (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
                });
            vector[(hash % TEST_DIMENSION as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        } else {
            vector[0] = 1.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        TEST_DIMENSION
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

/// Embedder whose remote endpoint is always down
pub(crate) struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn dimension(&self) -> usize {
        TEST_DIMENSION
    }

    async fn embed_many(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(KbError::RemoteService("embedding endpoint returned HTTP 500".to_string()))
    }
}

/// Wraps a real index and can be told to fail upserts or collection drops
pub(crate) struct FlakyVectorIndex {
    pub(crate) inner: Arc<dyn VectorIndex>,
    pub(crate) fail_upsert: AtomicBool,
    pub(crate) fail_drop: AtomicBool,
}

impl FlakyVectorIndex {
    pub(crate) fn new(inner: Arc<dyn VectorIndex>) -> Self {
        Self {
            inner,
            fail_upsert: AtomicBool::new(false),
            fail_drop: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl VectorIndex for FlakyVectorIndex {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn create_or_get_collection(&self, name: &str, dimension: usize) -> Result<()> {
        self.inner.create_or_get_collection(name, dimension).await
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        self.inner.has_collection(name).await
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        if self.fail_upsert.load(Ordering::SeqCst) {
            // Land the first record so rollback has something to remove
            let partial: Vec<VectorRecord> = records.into_iter().take(1).collect();
            self.inner.upsert(collection, partial).await?;
            return Err(KbError::VectorBackend("upsert interrupted".to_string()));
        }
        self.inner.upsert(collection, records).await
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        self.inner
            .similarity_search(collection, query, k, threshold)
            .await
    }

    async fn delete_records(&self, collection: &str, ids: &[String]) -> Result<()> {
        self.inner.delete_records(collection, ids).await
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.inner.count(collection).await
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        if self.fail_drop.load(Ordering::SeqCst) {
            return Err(KbError::VectorBackend("drop refused".to_string()));
        }
        self.inner.delete_collection(name).await
    }
}

pub(crate) async fn open_database(dir: &Path) -> Database {
    Database::initialize_from_config_dir(dir)
        .await
        .expect("should open database")
}

pub(crate) async fn open_lance(dir: &Path) -> Arc<dyn VectorIndex> {
    Arc::new(
        LanceVectorIndex::open(&dir.join("vectors"))
            .await
            .expect("should open vector index"),
    )
}

pub(crate) fn small_chunks() -> ChunkingConfig {
    ChunkingConfig::new(120, 20)
}

/// Registry over a fresh SQLite file and LanceDB directory in `dir`
pub(crate) async fn lance_registry(
    dir: &Path,
    embedder: Arc<dyn Embedder>,
) -> KnowledgeBaseRegistry {
    KnowledgeBaseRegistry::new(
        open_database(dir).await,
        open_lance(dir).await,
        embedder,
        small_chunks(),
    )
}

/// Chat model that replays canned replies and records what it was sent
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<ModelReply>>,
    repeat: Option<ModelReply>,
    pub(crate) requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub(crate) fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Returns the same reply forever
    pub(crate) fn repeating(reply: ModelReply) -> Self {
        Self {
            repeat: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub(crate) fn last_request(&self) -> Vec<ChatMessage> {
        self.requests
            .lock()
            .expect("requests lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _params: &GenerateParams,
    ) -> Result<ModelReply> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(messages.to_vec());
        let next = self.replies.lock().expect("replies lock").pop_front();
        next.or_else(|| self.repeat.clone())
            .ok_or_else(|| KbError::RemoteService("completion endpoint returned HTTP 503".to_string()))
    }
}

pub(crate) fn text_reply(content: &str) -> ModelReply {
    ModelReply {
        content: Some(content.to_string()),
        tool_calls: Vec::new(),
    }
}

pub(crate) fn tool_reply(name: &str, arguments: &str) -> ModelReply {
    ModelReply {
        content: None,
        tool_calls: vec![ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
    }
}
