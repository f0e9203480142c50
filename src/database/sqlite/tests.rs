use super::*;
use crate::database::sqlite::models::{ChatRole, WorkspaceSettingsOverrides};
use anyhow::Result;
use std::collections::HashSet;
use tempfile::TempDir;

async fn create_test_database() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let database = Database::initialize_from_config_dir(temp_dir.path()).await?;
    Ok((temp_dir, database))
}

async fn seed_workspace(database: &Database) -> Result<()> {
    database
        .insert_knowledge_base(&KnowledgeBase {
            id: "kb".to_string(),
            name: "Policies".to_string(),
            description: None,
            vector_collection_id: "kb_kb".to_string(),
            embedding_dimension: 3,
            created_at: Utc::now(),
        })
        .await?;
    database
        .insert_workspace(&Workspace {
            id: "ws".to_string(),
            name: "Staff".to_string(),
            knowledge_base_id: "kb".to_string(),
            settings: WorkspaceSettingsOverrides::default(),
            created_at: Utc::now(),
        })
        .await
}

#[tokio::test]
async fn connections_use_write_ahead_logging() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(database.pool())
        .await?;
    assert_eq!(mode.to_lowercase(), "wal");
    Ok(())
}

#[tokio::test]
async fn integration_schema_migration() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%'",
    )
    .fetch_all(database.pool())
    .await?;

    let expected_tables: HashSet<&'static str> = [
        "knowledge_bases",
        "documents",
        "chunks",
        "workspaces",
        "chat_turns",
        "message_counters",
    ]
    .into_iter()
    .collect();

    let actual_tables: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
    assert_eq!(actual_tables, expected_tables);

    Ok(())
}

#[tokio::test]
async fn integration_reopen_keeps_data() -> Result<()> {
    let temp_dir = TempDir::new()?;
    {
        let database = Database::initialize_from_config_dir(temp_dir.path()).await?;
        seed_workspace(&database).await?;
    }
    let reopened = Database::initialize_from_config_dir(temp_dir.path()).await?;
    assert!(reopened.get_workspace("ws").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn integration_commit_exchange_respects_limit() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    seed_workspace(&database).await?;

    for round in 0..3 {
        let user = ChatTurn::new("ws", "u", ChatRole::User, &format!("question {}", round));
        let assistant = ChatTurn::new("ws", "u", ChatRole::Assistant, "answer");
        let outcome = database.commit_exchange(&user, &assistant, 2).await?;
        if round < 2 {
            assert_eq!(outcome, ExchangeCommit::Committed);
        } else {
            assert_eq!(outcome, ExchangeCommit::LimitReached);
        }
    }

    assert_eq!(database.message_count("ws", "u").await?, 2);
    let turns = database.recent_turns("ws", "u", 10).await?;
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[0].role, ChatRole::User);
    assert_eq!(turns[3].role, ChatRole::Assistant);

    Ok(())
}

#[tokio::test]
async fn integration_clear_keeps_counter() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    seed_workspace(&database).await?;

    let user = ChatTurn::new("ws", "u", ChatRole::User, "q");
    let assistant = ChatTurn::new("ws", "u", ChatRole::Assistant, "a");
    database.commit_exchange(&user, &assistant, 100).await?;

    assert_eq!(database.clear_turns("ws", "u").await?, 2);
    assert!(database.recent_turns("ws", "u", 10).await?.is_empty());
    assert_eq!(database.message_count("ws", "u").await?, 1);
    Ok(())
}

#[tokio::test]
async fn integration_replace_document_content() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    seed_workspace(&database).await?;

    let now = Utc::now();
    let document = Document {
        id: "doc".to_string(),
        knowledge_base_id: "kb".to_string(),
        title: "Rules".to_string(),
        doc_type: "txt".to_string(),
        content: "old".to_string(),
        metadata: serde_json::Map::new(),
        chunk_ids: Vec::new(),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    let old_chunk = Chunk {
        id: "old".to_string(),
        document_id: "doc".to_string(),
        ordinal: 0,
        text: "old".to_string(),
        embedding: vec![1.0, 0.0, 0.0],
    };
    database
        .insert_document_with_chunks(&document, std::slice::from_ref(&old_chunk))
        .await?;

    let new_chunk = Chunk {
        id: "new".to_string(),
        text: "new".to_string(),
        ..old_chunk
    };
    assert!(
        database
            .replace_document_content("doc", "new", 1, std::slice::from_ref(&new_chunk))
            .await?
    );
    assert!(
        !database
            .replace_document_content("doc", "stale", 1, &[])
            .await?
    );

    let stored = database.get_document("doc").await?.expect("document exists");
    assert_eq!(stored.content, "new");
    assert_eq!(stored.version, 2);
    assert_eq!(stored.chunk_ids, vec!["new".to_string()]);
    Ok(())
}

#[tokio::test]
async fn integration_document_requires_knowledge_base() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    let now = Utc::now();
    let orphan = Document {
        id: "doc".to_string(),
        knowledge_base_id: "missing".to_string(),
        title: "Orphan".to_string(),
        doc_type: "txt".to_string(),
        content: "text".to_string(),
        metadata: serde_json::Map::new(),
        chunk_ids: Vec::new(),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    assert!(database.insert_document_with_chunks(&orphan, &[]).await.is_err());
    assert!(database.get_document("doc").await?.is_none());
    Ok(())
}
