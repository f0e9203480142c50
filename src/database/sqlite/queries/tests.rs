use super::*;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn create_test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .foreign_keys(true),
        )
        .await
        .expect("Failed to create test pool");

    sqlx::raw_sql(include_str!("../migrations/001_initial_schema.sql"))
        .execute(&pool)
        .await
        .expect("Failed to run migrations");

    (temp_dir, pool)
}

fn knowledge_base(id: &str) -> KnowledgeBase {
    KnowledgeBase {
        id: id.to_string(),
        name: format!("KB {}", id),
        description: Some("Policies".to_string()),
        vector_collection_id: format!("kb_{}", id),
        embedding_dimension: 3,
        created_at: Utc::now(),
    }
}

fn document(id: &str, kb_id: &str) -> Document {
    let now = Utc::now();
    let mut metadata = serde_json::Map::new();
    metadata.insert("source".to_string(), json!("upload"));
    Document {
        id: id.to_string(),
        knowledge_base_id: kb_id.to_string(),
        title: "Handbook".to_string(),
        doc_type: "txt".to_string(),
        content: "Attendance is mandatory.".to_string(),
        metadata,
        chunk_ids: Vec::new(),
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

fn chunk(id: &str, document_id: &str, ordinal: i64) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        ordinal,
        text: format!("chunk {}", ordinal),
        embedding: vec![ordinal as f32, 1.0, 0.0],
    }
}

fn workspace(id: &str, kb_id: &str) -> Workspace {
    Workspace {
        id: id.to_string(),
        name: "Year 7".to_string(),
        knowledge_base_id: kb_id.to_string(),
        settings: WorkspaceSettingsOverrides {
            message_limit: Some(2),
            ..WorkspaceSettingsOverrides::default()
        },
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn knowledge_base_crud_operations() {
    let (_temp_dir, pool) = create_test_pool().await;

    KnowledgeBaseQueries::create(&pool, &knowledge_base("a"))
        .await
        .expect("Failed to create knowledge base");
    KnowledgeBaseQueries::create(&pool, &knowledge_base("b"))
        .await
        .expect("Failed to create knowledge base");

    let fetched = KnowledgeBaseQueries::get_by_id(&pool, "a")
        .await
        .expect("Failed to get knowledge base")
        .expect("Knowledge base should exist");
    assert_eq!(fetched.vector_collection_id, "kb_a");
    assert_eq!(fetched.description.as_deref(), Some("Policies"));

    let all = KnowledgeBaseQueries::list_all(&pool).await.expect("list");
    assert_eq!(all.len(), 2);

    let mut conn = pool.acquire().await.expect("connection");
    assert!(KnowledgeBaseQueries::delete(&mut conn, "a").await.expect("delete"));
    assert!(!KnowledgeBaseQueries::delete(&mut conn, "a").await.expect("delete"));
    drop(conn);

    assert!(
        KnowledgeBaseQueries::get_by_id(&pool, "a")
            .await
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn document_with_chunks_round_trip() {
    let (_temp_dir, pool) = create_test_pool().await;
    KnowledgeBaseQueries::create(&pool, &knowledge_base("kb"))
        .await
        .expect("create kb");

    let mut tx = pool.begin().await.expect("begin");
    DocumentQueries::insert(&mut tx, &document("doc", "kb"))
        .await
        .expect("insert document");
    ChunkQueries::insert_many(
        &mut tx,
        &[chunk("c1", "doc", 1), chunk("c0", "doc", 0)],
    )
    .await
    .expect("insert chunks");
    tx.commit().await.expect("commit");

    let fetched = DocumentQueries::get_by_id(&pool, "doc")
        .await
        .expect("get")
        .expect("document exists");
    assert_eq!(fetched.chunk_ids, vec!["c0".to_string(), "c1".to_string()]);
    assert_eq!(fetched.metadata["source"], "upload");

    let chunks = ChunkQueries::list_by_document(&pool, "doc")
        .await
        .expect("list chunks");
    assert_eq!(chunks[1].embedding, vec![1.0, 1.0, 0.0]);

    assert_eq!(
        ChunkQueries::count_by_knowledge_base(&pool, "kb")
            .await
            .expect("count"),
        2
    );
}

#[tokio::test]
async fn update_content_checks_version() {
    let (_temp_dir, pool) = create_test_pool().await;
    KnowledgeBaseQueries::create(&pool, &knowledge_base("kb"))
        .await
        .expect("create kb");
    let mut conn = pool.acquire().await.expect("connection");
    DocumentQueries::insert(&mut conn, &document("doc", "kb"))
        .await
        .expect("insert");

    assert!(
        DocumentQueries::update_content(&mut conn, "doc", "v2", 1, Utc::now())
            .await
            .expect("update")
    );
    assert!(
        !DocumentQueries::update_content(&mut conn, "doc", "stale", 1, Utc::now())
            .await
            .expect("update")
    );
    drop(conn);

    let fetched = DocumentQueries::get_by_id(&pool, "doc")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.content, "v2");
    assert_eq!(fetched.version, 2);
}

#[tokio::test]
async fn deleting_knowledge_base_cascades() {
    let (_temp_dir, pool) = create_test_pool().await;
    KnowledgeBaseQueries::create(&pool, &knowledge_base("kb"))
        .await
        .expect("create kb");
    WorkspaceQueries::create(&pool, &workspace("ws", "kb"))
        .await
        .expect("create workspace");

    let mut conn = pool.acquire().await.expect("connection");
    DocumentQueries::insert(&mut conn, &document("doc", "kb"))
        .await
        .expect("insert");
    ChunkQueries::insert_many(&mut conn, &[chunk("c0", "doc", 0)])
        .await
        .expect("chunks");
    ChatQueries::insert_turn(&mut conn, &ChatTurn::new("ws", "u", ChatRole::User, "hi"))
        .await
        .expect("turn");

    assert!(KnowledgeBaseQueries::delete(&mut conn, "kb").await.expect("delete"));
    drop(conn);

    assert!(DocumentQueries::get_by_id(&pool, "doc").await.expect("get").is_none());
    assert!(
        ChunkQueries::list_by_document(&pool, "doc")
            .await
            .expect("chunks")
            .is_empty()
    );
    assert!(WorkspaceQueries::get_by_id(&pool, "ws").await.expect("get").is_none());
}

#[tokio::test]
async fn workspace_settings_are_stored() {
    let (_temp_dir, pool) = create_test_pool().await;
    KnowledgeBaseQueries::create(&pool, &knowledge_base("kb"))
        .await
        .expect("create kb");
    WorkspaceQueries::create(&pool, &workspace("ws", "kb"))
        .await
        .expect("create workspace");

    let fetched = WorkspaceQueries::get_by_id(&pool, "ws")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(fetched.settings.message_limit, Some(2));
    assert_eq!(fetched.settings.ai_model, None);
    assert_eq!(fetched.effective_settings().ai_model, "gpt-3.5-turbo");

    let second_for_same_kb = WorkspaceQueries::create(&pool, &workspace("ws2", "kb")).await;
    assert!(second_for_same_kb.is_err(), "one workspace per knowledge base");
}

#[tokio::test]
async fn recent_turns_are_oldest_first() {
    let (_temp_dir, pool) = create_test_pool().await;
    KnowledgeBaseQueries::create(&pool, &knowledge_base("kb"))
        .await
        .expect("create kb");
    WorkspaceQueries::create(&pool, &workspace("ws", "kb"))
        .await
        .expect("create workspace");

    let mut conn = pool.acquire().await.expect("connection");
    for i in 0..5 {
        let role = if i % 2 == 0 {
            ChatRole::User
        } else {
            ChatRole::Assistant
        };
        ChatQueries::insert_turn(&mut conn, &ChatTurn::new("ws", "u", role, &format!("m{}", i)))
            .await
            .expect("turn");
    }
    ChatQueries::insert_turn(&mut conn, &ChatTurn::new("ws", "other", ChatRole::User, "x"))
        .await
        .expect("turn");
    drop(conn);

    let turns = ChatQueries::recent_turns(&pool, "ws", "u", 3)
        .await
        .expect("history");
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["m2", "m3", "m4"]);
    assert_eq!(turns[1].role, ChatRole::Assistant);

    assert_eq!(
        ChatQueries::delete_turns(&pool, "ws", "u")
            .await
            .expect("clear"),
        5
    );
    assert_eq!(
        ChatQueries::recent_turns(&pool, "ws", "other", 10)
            .await
            .expect("history")
            .len(),
        1
    );
}

#[tokio::test]
async fn counter_increments_only_below_limit() {
    let (_temp_dir, pool) = create_test_pool().await;
    KnowledgeBaseQueries::create(&pool, &knowledge_base("kb"))
        .await
        .expect("create kb");
    WorkspaceQueries::create(&pool, &workspace("ws", "kb"))
        .await
        .expect("create workspace");

    assert!(
        MessageCounterQueries::get(&pool, "ws", "u")
            .await
            .expect("get")
            .is_none()
    );

    let mut conn = pool.acquire().await.expect("connection");
    assert!(
        MessageCounterQueries::try_increment(&mut conn, "ws", "u", 2, Utc::now())
            .await
            .expect("inc")
    );
    assert!(
        MessageCounterQueries::try_increment(&mut conn, "ws", "u", 2, Utc::now())
            .await
            .expect("inc")
    );
    assert!(
        !MessageCounterQueries::try_increment(&mut conn, "ws", "u", 2, Utc::now())
            .await
            .expect("inc")
    );
    drop(conn);

    let counter = MessageCounterQueries::get(&pool, "ws", "u")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(counter.count, 2);
    assert!(counter.last_message_at.is_some());
}
