// Knowledge base lifecycle
// Keeps SQLite rows and vector records in step for knowledge bases, documents and workspaces


use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::sqlite::models::{
    Chunk, Document, KnowledgeBase, NewDocument, Workspace, WorkspaceSettingsOverrides,
};
use crate::database::vector::{ChunkMetadata, VectorIndex, VectorRecord, collection_name_for};
use crate::database::Database;
use crate::embeddings::{ChunkingConfig, Embedder, chunk_text};
use crate::extract::extract_file;
use crate::{KbError, Result};

/// Row and vector counts for one knowledge base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnowledgeBaseStats {
    pub documents: i64,
    pub chunks: i64,
    pub vectors: usize,
}

/// Chunks and vectors computed for a document body, not yet stored anywhere
struct PreparedChunks {
    chunks: Vec<Chunk>,
    records: Vec<VectorRecord>,
}

pub struct KnowledgeBaseRegistry {
    database: Database,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    document_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KnowledgeBaseRegistry {
    #[inline]
    pub fn new(
        database: Database,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            database,
            vectors,
            embedder,
            chunking,
            document_locks: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    #[inline]
    pub fn vector_index(&self) -> Arc<dyn VectorIndex> {
        Arc::clone(&self.vectors)
    }

    #[inline]
    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Create the vector collection first, then the row; a collection failure stores nothing
    #[inline]
    pub async fn create_knowledge_base(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<KnowledgeBase> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KbError::Validation(
                "Knowledge base name cannot be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let dimension = self.embedder.dimension();
        let kb = KnowledgeBase {
            vector_collection_id: collection_name_for(&id),
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            embedding_dimension: i64::try_from(dimension)
                .map_err(|_| KbError::Validation(format!("Dimension {} too large", dimension)))?,
            created_at: Utc::now(),
        };

        self.vectors
            .create_or_get_collection(&kb.vector_collection_id, dimension)
            .await?;

        if let Err(e) = self.database.insert_knowledge_base(&kb).await {
            if let Err(cleanup) = self.vectors.delete_collection(&kb.vector_collection_id).await {
                warn!(
                    "Failed to drop collection {} after insert failure: {}",
                    kb.vector_collection_id, cleanup
                );
            }
            return Err(KbError::database(e));
        }

        info!("Created knowledge base '{}' ({})", kb.name, kb.id);
        Ok(kb)
    }

    #[inline]
    pub async fn get_knowledge_base(&self, id: &str) -> Result<KnowledgeBase> {
        self.database
            .get_knowledge_base(id)
            .await
            .map_err(KbError::database)?
            .ok_or_else(|| KbError::NotFound(format!("Knowledge base {}", id)))
    }

    #[inline]
    pub async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        self.database
            .list_knowledge_bases()
            .await
            .map_err(KbError::database)
    }

    /// Drop the collection, then the rows.
    ///
    /// Once the collection is gone the rows must follow; a failure at that point is
    /// logged as fatal and returned without retry.
    #[inline]
    pub async fn delete_knowledge_base(&self, id: &str) -> Result<()> {
        let kb = self.get_knowledge_base(id).await?;

        self.vectors
            .delete_collection(&kb.vector_collection_id)
            .await?;

        if let Err(e) = self.database.delete_knowledge_base(&kb.id).await {
            error!(
                fatal = true,
                knowledge_base_id = %kb.id,
                collection = %kb.vector_collection_id,
                "Vector collection deleted but metadata deletion failed: {:#}",
                e
            );
            return Err(KbError::database(e));
        }

        info!("Deleted knowledge base '{}' ({})", kb.name, kb.id);
        Ok(())
    }

    /// Chunk, embed and store a document; on failure no vectors or rows remain
    #[inline]
    pub async fn add_document(&self, new_document: NewDocument, kb_id: &str) -> Result<Document> {
        let kb = self.get_knowledge_base(kb_id).await?;
        if new_document.title.trim().is_empty() {
            return Err(KbError::Validation("Document title cannot be empty".to_string()));
        }

        let now = Utc::now();
        let mut document = Document {
            id: Uuid::new_v4().to_string(),
            knowledge_base_id: kb.id.clone(),
            title: new_document.title,
            doc_type: new_document.doc_type,
            content: new_document.content,
            metadata: new_document.metadata,
            chunk_ids: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let prepared = self
            .prepare_chunks(&kb, &document.id, &document.title, &document.content)
            .await?;
        let chunk_ids = self.store_vectors(&kb, prepared.records).await?;

        if let Err(e) = self
            .database
            .insert_document_with_chunks(&document, &prepared.chunks)
            .await
        {
            self.rollback_vectors(&kb, &chunk_ids).await;
            return Err(KbError::database(e));
        }

        document.chunk_ids = chunk_ids;
        info!(
            "Added document '{}' ({}) to knowledge base {} with {} chunks",
            document.title,
            document.id,
            kb.id,
            document.chunk_ids.len()
        );
        Ok(document)
    }

    /// Re-chunk and re-embed a document, then retire its old vectors
    #[inline]
    pub async fn update_document(&self, document_id: &str, new_content: &str) -> Result<Document> {
        let lock = self.document_lock(document_id);
        let guard = lock.lock().await;
        let outcome = self.replace_content(document_id, new_content).await;
        drop(guard);
        drop(lock);
        self.release_document_lock(document_id);
        outcome
    }

    async fn replace_content(&self, document_id: &str, new_content: &str) -> Result<Document> {
        let existing = self.get_document(document_id).await?;
        let kb = self.get_knowledge_base(&existing.knowledge_base_id).await?;

        let prepared = self
            .prepare_chunks(&kb, &existing.id, &existing.title, new_content)
            .await?;
        let new_ids = self.store_vectors(&kb, prepared.records).await?;

        let replaced = self
            .database
            .replace_document_content(&existing.id, new_content, existing.version, &prepared.chunks)
            .await;
        match replaced {
            Ok(true) => {}
            Ok(false) => {
                self.rollback_vectors(&kb, &new_ids).await;
                return Err(KbError::Validation(format!(
                    "Document {} was modified concurrently",
                    existing.id
                )));
            }
            Err(e) => {
                self.rollback_vectors(&kb, &new_ids).await;
                return Err(KbError::database(e));
            }
        }

        if let Err(e) = self
            .vectors
            .delete_records(&kb.vector_collection_id, &existing.chunk_ids)
            .await
        {
            error!(
                document_id = %existing.id,
                "Failed to delete {} superseded vectors: {}",
                existing.chunk_ids.len(),
                e
            );
        }

        info!(
            "Updated document {} to version {} with {} chunks",
            existing.id,
            existing.version + 1,
            prepared.chunks.len()
        );
        self.get_document(&existing.id).await
    }

    /// Delete a document's vectors, then its rows
    #[inline]
    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        let lock = self.document_lock(document_id);
        let guard = lock.lock().await;
        let outcome = self.remove_document(document_id).await;
        drop(guard);
        drop(lock);
        self.release_document_lock(document_id);
        outcome
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        let document = self.get_document(document_id).await?;
        let kb = self.get_knowledge_base(&document.knowledge_base_id).await?;

        self.vectors
            .delete_records(&kb.vector_collection_id, &document.chunk_ids)
            .await?;
        self.database
            .delete_document(&document.id)
            .await
            .map_err(KbError::database)?;

        info!("Deleted document {}", document_id);
        Ok(())
    }

    #[inline]
    pub async fn get_document(&self, document_id: &str) -> Result<Document> {
        self.database
            .get_document(document_id)
            .await
            .map_err(KbError::database)?
            .ok_or_else(|| KbError::NotFound(format!("Document {}", document_id)))
    }

    #[inline]
    pub async fn list_documents(&self, kb_id: &str) -> Result<Vec<Document>> {
        let kb = self.get_knowledge_base(kb_id).await?;
        self.database
            .list_documents(&kb.id)
            .await
            .map_err(KbError::database)
    }

    /// Extract a file's text and add it as a document titled after the file stem
    #[inline]
    pub async fn ingest_file(&self, path: &Path, kb_id: &str) -> Result<Document> {
        let extracted = extract_file(path).await?;
        let title = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .map(str::to_string)
            .or_else(|| extracted.title.clone())
            .unwrap_or_else(|| "Untitled".to_string());

        let mut metadata = serde_json::Map::new();
        metadata.insert("source_path".to_string(), json!(path.display().to_string()));
        if let Some(heading) = &extracted.title {
            metadata.insert("source_title".to_string(), json!(heading));
        }

        debug!("Ingesting {} as '{}'", path.display(), title);
        self.add_document(
            NewDocument {
                title,
                doc_type: extracted.kind.as_str().to_string(),
                content: extracted.text,
                metadata,
            },
            kb_id,
        )
        .await
    }

    /// Create a workspace together with its own knowledge base
    #[inline]
    pub async fn create_workspace(
        &self,
        name: &str,
        settings: WorkspaceSettingsOverrides,
    ) -> Result<Workspace> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KbError::Validation("Workspace name cannot be empty".to_string()));
        }
        if settings.message_limit.is_some_and(|limit| limit < 0) {
            return Err(KbError::Validation(
                "Message limit cannot be negative".to_string(),
            ));
        }

        let kb = self
            .create_knowledge_base(name, Some(&format!("Knowledge base for workspace {}", name)))
            .await?;

        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            knowledge_base_id: kb.id.clone(),
            settings,
            created_at: Utc::now(),
        };

        if let Err(e) = self.database.insert_workspace(&workspace).await {
            if let Err(cleanup) = self.delete_knowledge_base(&kb.id).await {
                warn!("Failed to remove knowledge base {} after workspace insert failure: {}", kb.id, cleanup);
            }
            return Err(KbError::database(e));
        }

        info!("Created workspace '{}' ({})", workspace.name, workspace.id);
        Ok(workspace)
    }

    #[inline]
    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.database
            .get_workspace(id)
            .await
            .map_err(KbError::database)?
            .ok_or_else(|| KbError::NotFound(format!("Workspace {}", id)))
    }

    #[inline]
    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.database.list_workspaces().await.map_err(KbError::database)
    }

    #[inline]
    pub async fn stats(&self, kb_id: &str) -> Result<KnowledgeBaseStats> {
        let kb = self.get_knowledge_base(kb_id).await?;
        let documents = self
            .database
            .count_documents(&kb.id)
            .await
            .map_err(KbError::database)?;
        let chunks = self
            .database
            .count_chunks(&kb.id)
            .await
            .map_err(KbError::database)?;
        let vectors = self.vectors.count(&kb.vector_collection_id).await?;
        Ok(KnowledgeBaseStats {
            documents,
            chunks,
            vectors,
        })
    }

    async fn prepare_chunks(
        &self,
        kb: &KnowledgeBase,
        document_id: &str,
        title: &str,
        content: &str,
    ) -> Result<PreparedChunks> {
        let expected = usize::try_from(kb.embedding_dimension).unwrap_or_default();
        if self.embedder.dimension() != expected {
            return Err(KbError::Validation(format!(
                "Embedder produces {} dimensions but knowledge base {} expects {}",
                self.embedder.dimension(),
                kb.id,
                expected
            )));
        }

        let text_chunks = chunk_text(content, &self.chunking)?;
        if text_chunks.is_empty() {
            return Err(KbError::Validation(
                "Document has no text to index".to_string(),
            ));
        }

        let texts: Vec<String> = text_chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_many(&texts).await?;
        if embeddings.len() != texts.len() {
            return Err(KbError::RemoteService(format!(
                "Expected {} embeddings, received {}",
                texts.len(),
                embeddings.len()
            )));
        }

        let mut chunks = Vec::with_capacity(texts.len());
        let mut records = Vec::with_capacity(texts.len());
        for (text_chunk, embedding) in text_chunks.into_iter().zip(embeddings) {
            let chunk_id = Uuid::new_v4().to_string();
            let metadata = ChunkMetadata {
                knowledge_base_id: kb.id.clone(),
                document_id: document_id.to_string(),
                chunk_id: chunk_id.clone(),
                ordinal: text_chunk.ordinal,
                title: title.to_string(),
                text: text_chunk.text.clone(),
            };
            records.push(VectorRecord {
                id: Some(chunk_id.clone()),
                vector: embedding.clone(),
                metadata: metadata.into_map(),
            });
            chunks.push(Chunk {
                id: chunk_id,
                document_id: document_id.to_string(),
                ordinal: i64::try_from(text_chunk.ordinal).unwrap_or(i64::MAX),
                text: text_chunk.text,
                embedding,
            });
        }

        debug!(
            "Prepared {} chunks for document {}",
            chunks.len(),
            document_id
        );
        Ok(PreparedChunks { chunks, records })
    }

    /// Upsert vectors; a partial failure removes whatever may have landed
    async fn store_vectors(
        &self,
        kb: &KnowledgeBase,
        records: Vec<VectorRecord>,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = records.iter().filter_map(|r| r.id.clone()).collect();
        match self.vectors.upsert(&kb.vector_collection_id, records).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                self.rollback_vectors(kb, &ids).await;
                Err(e)
            }
        }
    }

    async fn rollback_vectors(&self, kb: &KnowledgeBase, ids: &[String]) {
        if let Err(e) = self
            .vectors
            .delete_records(&kb.vector_collection_id, ids)
            .await
        {
            error!(
                collection = %kb.vector_collection_id,
                "Failed to roll back {} vectors: {}",
                ids.len(),
                e
            );
        } else {
            debug!("Rolled back {} vectors in {}", ids.len(), kb.vector_collection_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_document_locks(&self) -> usize {
        self.document_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn document_lock(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .document_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    /// Drop the map entry once no caller holds or waits on it
    fn release_document_lock(&self, document_id: &str) {
        let mut locks = self
            .document_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if locks
            .get(document_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(document_id);
        }
    }
}
