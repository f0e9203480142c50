use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::database::sqlite::models::{
    Chunk, ChatTurn, Document, KnowledgeBase, MessageCounter, Workspace,
};
use crate::database::sqlite::queries::{
    ChatQueries, ChunkQueries, DocumentQueries, KnowledgeBaseQueries, MessageCounterQueries,
    WorkspaceQueries,
};

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of committing one user/assistant exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeCommit {
    Committed,
    /// The counter had already reached the limit; nothing was written
    LimitReached,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_url: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        let db_path = config_dir.join("metadata.db");

        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(&db_path).await
    }

    // Knowledge base operations
    #[inline]
    pub async fn insert_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        KnowledgeBaseQueries::create(&self.pool, kb).await
    }

    #[inline]
    pub async fn get_knowledge_base(&self, id: &str) -> Result<Option<KnowledgeBase>> {
        KnowledgeBaseQueries::get_by_id(&self.pool, id).await
    }

    #[inline]
    pub async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        KnowledgeBaseQueries::list_all(&self.pool).await
    }

    /// Delete the knowledge base row; documents, chunks and its workspace cascade
    #[inline]
    pub async fn delete_knowledge_base(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let deleted = KnowledgeBaseQueries::delete(&mut tx, id).await?;
        tx.commit().await.context("Failed to commit knowledge base deletion")?;
        Ok(deleted)
    }

    // Document operations
    /// Persist a document and its chunks atomically
    #[inline]
    pub async fn insert_document_with_chunks(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        DocumentQueries::insert(&mut tx, document).await?;
        ChunkQueries::insert_many(&mut tx, chunks).await?;
        tx.commit().await.context("Failed to commit document")?;
        Ok(())
    }

    /// Swap a document's content and chunks if its version is still `expected_version`.
    ///
    /// Returns false, writing nothing, when another update won the race.
    #[inline]
    pub async fn replace_document_content(
        &self,
        document_id: &str,
        content: &str,
        expected_version: i64,
        chunks: &[Chunk],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let updated =
            DocumentQueries::update_content(&mut tx, document_id, content, expected_version, Utc::now())
                .await?;
        if !updated {
            tx.rollback().await.context("Failed to roll back document update")?;
            return Ok(false);
        }
        ChunkQueries::delete_by_document(&mut tx, document_id).await?;
        ChunkQueries::insert_many(&mut tx, chunks).await?;
        tx.commit().await.context("Failed to commit document update")?;
        Ok(true)
    }

    #[inline]
    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        DocumentQueries::get_by_id(&self.pool, id).await
    }

    #[inline]
    pub async fn list_documents(&self, knowledge_base_id: &str) -> Result<Vec<Document>> {
        DocumentQueries::list_by_knowledge_base(&self.pool, knowledge_base_id).await
    }

    #[inline]
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        ChunkQueries::delete_by_document(&mut tx, id).await?;
        let deleted = DocumentQueries::delete(&mut tx, id).await?;
        tx.commit().await.context("Failed to commit document deletion")?;
        Ok(deleted)
    }

    #[inline]
    pub async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        ChunkQueries::list_by_document(&self.pool, document_id).await
    }

    #[inline]
    pub async fn count_documents(&self, knowledge_base_id: &str) -> Result<i64> {
        DocumentQueries::count_by_knowledge_base(&self.pool, knowledge_base_id).await
    }

    #[inline]
    pub async fn count_chunks(&self, knowledge_base_id: &str) -> Result<i64> {
        ChunkQueries::count_by_knowledge_base(&self.pool, knowledge_base_id).await
    }

    // Workspace operations
    #[inline]
    pub async fn insert_workspace(&self, workspace: &Workspace) -> Result<()> {
        WorkspaceQueries::create(&self.pool, workspace).await
    }

    #[inline]
    pub async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        WorkspaceQueries::get_by_id(&self.pool, id).await
    }

    #[inline]
    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        WorkspaceQueries::list_all(&self.pool).await
    }

    // Chat operations
    #[inline]
    pub async fn recent_turns(
        &self,
        workspace_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        ChatQueries::recent_turns(&self.pool, workspace_id, user_id, limit).await
    }

    #[inline]
    pub async fn clear_turns(&self, workspace_id: &str, user_id: &str) -> Result<u64> {
        ChatQueries::delete_turns(&self.pool, workspace_id, user_id).await
    }

    #[inline]
    pub async fn message_count(&self, workspace_id: &str, user_id: &str) -> Result<i64> {
        Ok(self
            .message_counter(workspace_id, user_id)
            .await?
            .map_or(0, |counter| counter.count))
    }

    #[inline]
    pub async fn message_counter(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Option<MessageCounter>> {
        MessageCounterQueries::get(&self.pool, workspace_id, user_id).await
    }

    /// Write both turns and bump the counter in one transaction.
    ///
    /// The counter update is conditional on `count < limit`; when it matches no row the
    /// transaction is rolled back and neither turn is stored.
    #[inline]
    pub async fn commit_exchange(
        &self,
        user_turn: &ChatTurn,
        assistant_turn: &ChatTurn,
        limit: i64,
    ) -> Result<ExchangeCommit> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        ChatQueries::insert_turn(&mut tx, user_turn).await?;
        ChatQueries::insert_turn(&mut tx, assistant_turn).await?;
        let incremented = MessageCounterQueries::try_increment(
            &mut tx,
            &user_turn.workspace_id,
            &user_turn.user_id,
            limit,
            assistant_turn.created_at,
        )
        .await?;

        if !incremented {
            tx.rollback().await.context("Failed to roll back exchange")?;
            debug!(
                "Counter for workspace {} user {} already at limit {}",
                user_turn.workspace_id, user_turn.user_id, limit
            );
            return Ok(ExchangeCommit::LimitReached);
        }

        tx.commit().await.context("Failed to commit exchange")?;
        Ok(ExchangeCommit::Committed)
    }
}
