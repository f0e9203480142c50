#[cfg(test)]
mod tests;

use super::models::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

pub struct KnowledgeBaseQueries;

impl KnowledgeBaseQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, kb: &KnowledgeBase) -> Result<()> {
        sqlx::query(
            "INSERT INTO knowledge_bases (id, name, description, vector_collection_id, embedding_dimension, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&kb.id)
        .bind(&kb.name)
        .bind(&kb.description)
        .bind(&kb.vector_collection_id)
        .bind(kb.embedding_dimension)
        .bind(kb.created_at)
        .execute(pool)
        .await
        .context("Failed to create knowledge base")?;
        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<KnowledgeBase>> {
        sqlx::query_as::<_, KnowledgeBase>(
            r#"
            SELECT id, name, description, vector_collection_id, embedding_dimension, created_at
            FROM knowledge_bases WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get knowledge base by id")
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<KnowledgeBase>> {
        sqlx::query_as::<_, KnowledgeBase>(
            r#"
            SELECT id, name, description, vector_collection_id, embedding_dimension, created_at
            FROM knowledge_bases ORDER BY created_at, name
            "#,
        )
        .fetch_all(pool)
        .await
        .context("Failed to list knowledge bases")
    }

    /// Delete the knowledge base; documents, chunks and its workspace cascade
    #[inline]
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await
            .context("Failed to delete knowledge base")?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct DocumentQueries;

impl DocumentQueries {
    #[inline]
    pub async fn insert(conn: &mut SqliteConnection, document: &Document) -> Result<()> {
        let metadata =
            serde_json::to_string(&document.metadata).context("Failed to encode metadata")?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, knowledge_base_id, title, doc_type, content, metadata, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.knowledge_base_id)
        .bind(&document.title)
        .bind(&document.doc_type)
        .bind(&document.content)
        .bind(metadata)
        .bind(document.version)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(conn)
        .await
        .context("Failed to insert document")?;
        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, knowledge_base_id, title, doc_type, content, metadata, version, created_at, updated_at
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get document by id")?;

        match row {
            Some(row) => {
                let chunk_ids = ChunkQueries::ids_for_document(pool, &row.id).await?;
                Ok(Some(row.into_document(chunk_ids)?))
            }
            None => Ok(None),
        }
    }

    #[inline]
    pub async fn list_by_knowledge_base(
        pool: &SqlitePool,
        knowledge_base_id: &str,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, knowledge_base_id, title, doc_type, content, metadata, version, created_at, updated_at
            FROM documents WHERE knowledge_base_id = ? ORDER BY created_at, title
            "#,
        )
        .bind(knowledge_base_id)
        .fetch_all(pool)
        .await
        .context("Failed to list documents")?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_ids = ChunkQueries::ids_for_document(pool, &row.id).await?;
            documents.push(row.into_document(chunk_ids)?);
        }
        Ok(documents)
    }

    /// Replace content if the stored version still matches; returns false on a version race
    #[inline]
    pub async fn update_content(
        conn: &mut SqliteConnection,
        id: &str,
        content: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET content = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
        )
        .bind(content)
        .bind(now)
        .bind(id)
        .bind(expected_version)
        .execute(conn)
        .await
        .context("Failed to update document content")?;
        Ok(result.rows_affected() == 1)
    }

    #[inline]
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await
            .context("Failed to delete document")?;
        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn count_by_knowledge_base(pool: &SqlitePool, knowledge_base_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE knowledge_base_id = ?")
            .bind(knowledge_base_id)
            .fetch_one(pool)
            .await
            .context("Failed to count documents")
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    #[inline]
    pub async fn insert_many(conn: &mut SqliteConnection, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, ordinal, text, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(encode_embedding(&chunk.embedding))
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to insert chunk {}", chunk.ordinal))?;
        }
        debug!("Inserted {} chunks", chunks.len());
        Ok(())
    }

    #[inline]
    pub async fn list_by_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            "SELECT id, document_id, ordinal, text, embedding FROM chunks WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .fetch_all(pool)
        .await
        .context("Failed to list chunks")?;

        rows.into_iter().map(ChunkRow::into_chunk).collect()
    }

    #[inline]
    pub async fn ids_for_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ? ORDER BY ordinal")
            .bind(document_id)
            .fetch_all(pool)
            .await
            .context("Failed to list chunk ids")
    }

    #[inline]
    pub async fn delete_by_document(conn: &mut SqliteConnection, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(conn)
            .await
            .context("Failed to delete chunks")?;
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn count_by_knowledge_base(pool: &SqlitePool, knowledge_base_id: &str) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            JOIN documents d ON c.document_id = d.id
            WHERE d.knowledge_base_id = ?
            "#,
        )
        .bind(knowledge_base_id)
        .fetch_one(pool)
        .await
        .context("Failed to count chunks")
    }
}

pub struct WorkspaceQueries;

impl WorkspaceQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, workspace: &Workspace) -> Result<()> {
        let settings = &workspace.settings;
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, knowledge_base_id, message_limit, ai_provider, ai_model, max_tokens, temperature, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.knowledge_base_id)
        .bind(settings.message_limit)
        .bind(&settings.ai_provider)
        .bind(&settings.ai_model)
        .bind(settings.max_tokens.map(i64::from))
        .bind(settings.temperature.map(f64::from))
        .bind(workspace.created_at)
        .execute(pool)
        .await
        .context("Failed to create workspace")?;
        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT id, name, knowledge_base_id, message_limit, ai_provider, ai_model, max_tokens, temperature, created_at
            FROM workspaces WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get workspace by id")?;
        Ok(row.map(Workspace::from))
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT id, name, knowledge_base_id, message_limit, ai_provider, ai_model, max_tokens, temperature, created_at
            FROM workspaces ORDER BY created_at, name
            "#,
        )
        .fetch_all(pool)
        .await
        .context("Failed to list workspaces")?;
        Ok(rows.into_iter().map(Workspace::from).collect())
    }
}

pub struct ChatQueries;

impl ChatQueries {
    #[inline]
    pub async fn insert_turn(conn: &mut SqliteConnection, turn: &ChatTurn) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_turns (id, workspace_id, user_id, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&turn.id)
        .bind(&turn.workspace_id)
        .bind(&turn.user_id)
        .bind(turn.role)
        .bind(&turn.content)
        .bind(turn.created_at)
        .execute(conn)
        .await
        .context("Failed to insert chat turn")?;
        Ok(())
    }

    /// The most recent `limit` turns, returned oldest first
    #[inline]
    pub async fn recent_turns(
        pool: &SqlitePool,
        workspace_id: &str,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatTurn>> {
        let mut turns = sqlx::query_as::<_, ChatTurn>(
            r#"
            SELECT id, workspace_id, user_id, role, content, created_at
            FROM chat_turns WHERE workspace_id = ? AND user_id = ?
            ORDER BY seq DESC LIMIT ?
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to load chat history")?;
        turns.reverse();
        Ok(turns)
    }

    #[inline]
    pub async fn delete_turns(pool: &SqlitePool, workspace_id: &str, user_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chat_turns WHERE workspace_id = ? AND user_id = ?")
            .bind(workspace_id)
            .bind(user_id)
            .execute(pool)
            .await
            .context("Failed to clear chat history")?;
        Ok(result.rows_affected())
    }
}

pub struct MessageCounterQueries;

impl MessageCounterQueries {
    #[inline]
    pub async fn get(
        pool: &SqlitePool,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Option<MessageCounter>> {
        sqlx::query_as::<_, MessageCounter>(
            r#"
            SELECT workspace_id, user_id, count, last_message_at
            FROM message_counters WHERE workspace_id = ? AND user_id = ?
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get message counter")
    }

    /// Increment the counter only while it is below `limit`; returns whether it moved
    #[inline]
    pub async fn try_increment(
        conn: &mut SqliteConnection,
        workspace_id: &str,
        user_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        sqlx::query(
            r#"
            INSERT INTO message_counters (workspace_id, user_id, count, last_message_at)
            VALUES (?, ?, 0, NULL)
            ON CONFLICT (workspace_id, user_id) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .context("Failed to initialise message counter")?;

        let result = sqlx::query(
            r#"
            UPDATE message_counters SET count = count + 1, last_message_at = ?
            WHERE workspace_id = ? AND user_id = ? AND count < ?
            "#,
        )
        .bind(now)
        .bind(workspace_id)
        .bind(user_id)
        .bind(limit)
        .execute(&mut *conn)
        .await
        .context("Failed to increment message counter")?;

        Ok(result.rows_affected() == 1)
    }
}
