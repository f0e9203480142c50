#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! The same sequence of operations run against every vector backend

mod common;

use kb_rag::KbError;
use kb_rag::config::MilvusConfig;
use kb_rag::database::lancedb::LanceVectorIndex;
use kb_rag::database::milvus::MilvusVectorIndex;
use kb_rag::database::{VectorIndex, VectorRecord};
use tempfile::TempDir;

use common::{FakeMilvus, metadata};

const COLLECTION: &str = "kb_contract";

fn unit(axis: usize) -> Vec<f32> {
    let mut vector = vec![0.0; 4];
    vector[axis] = 1.0;
    vector
}

fn record(id: Option<&str>, vector: Vec<f32>, title: &str) -> VectorRecord {
    VectorRecord {
        id: id.map(str::to_string),
        vector,
        metadata: metadata(title),
    }
}

async fn exercise(index: &dyn VectorIndex) {
    // Collections
    index
        .create_or_get_collection(COLLECTION, 4)
        .await
        .expect("should create");
    index
        .create_or_get_collection(COLLECTION, 4)
        .await
        .expect("create is idempotent");
    assert!(index.has_collection(COLLECTION).await.expect("has"));
    assert!(!index.has_collection("kb_missing").await.expect("has"));
    assert!(
        index.create_or_get_collection(COLLECTION, 8).await.is_err(),
        "{}: dimension conflict must fail",
        index.backend_name()
    );

    // Upsert with caller-supplied and generated ids
    let ids = index
        .upsert(
            COLLECTION,
            vec![
                record(Some("a"), unit(0), "A"),
                record(Some("b"), unit(1), "B"),
                record(Some("c"), vec![0.7, 0.7, 0.0, 0.0], "C"),
                record(None, unit(3), "D"),
            ],
        )
        .await
        .expect("should upsert");
    assert_eq!(ids.len(), 4);
    assert_eq!(&ids[..3], ["a", "b", "c"]);
    assert!(!ids[3].is_empty());
    assert_eq!(index.count(COLLECTION).await.expect("count"), 4);

    // Search ordering, k and threshold
    let hits = index
        .similarity_search(COLLECTION, &unit(0), 10, 0.0)
        .await
        .expect("should search");
    assert_eq!(hits[0].id, "a");
    assert!((hits[0].score - 1.0).abs() < 1e-4);
    assert_eq!(hits[1].id, "c");
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(hits[0].metadata["title"], "A");

    let top_one = index
        .similarity_search(COLLECTION, &unit(0), 1, 0.0)
        .await
        .expect("should search");
    assert_eq!(top_one.len(), 1);

    let strict = index
        .similarity_search(COLLECTION, &unit(0), 10, 0.9)
        .await
        .expect("should search");
    assert_eq!(strict.len(), 1);

    // Upserting an existing id replaces it
    index
        .upsert(COLLECTION, vec![record(Some("a"), unit(2), "A2")])
        .await
        .expect("should replace");
    assert_eq!(index.count(COLLECTION).await.expect("count"), 4);
    let moved = index
        .similarity_search(COLLECTION, &unit(2), 1, 0.0)
        .await
        .expect("should search");
    assert_eq!(moved[0].id, "a");
    assert_eq!(moved[0].metadata["title"], "A2");

    // Dimension checks
    let wrong = index
        .upsert(COLLECTION, vec![record(Some("e"), vec![1.0; 3], "E")])
        .await;
    assert!(matches!(wrong, Err(KbError::Validation(_))));
    let wrong_query = index.similarity_search(COLLECTION, &[1.0; 5], 3, 0.0).await;
    assert!(matches!(wrong_query, Err(KbError::Validation(_))));

    // Deletes
    index
        .delete_records(COLLECTION, &["b".to_string(), "never-stored".to_string()])
        .await
        .expect("should delete");
    assert_eq!(index.count(COLLECTION).await.expect("count"), 3);
    index
        .delete_records(COLLECTION, &[])
        .await
        .expect("empty delete is a no-op");

    index
        .delete_collection(COLLECTION)
        .await
        .expect("should drop");
    assert!(!index.has_collection(COLLECTION).await.expect("has"));
    index
        .delete_collection(COLLECTION)
        .await
        .expect("dropping twice is fine");

    let gone = index
        .similarity_search(COLLECTION, &unit(0), 3, 0.0)
        .await;
    assert!(matches!(gone, Err(KbError::NotFound(_))));
    let gone_upsert = index
        .upsert(COLLECTION, vec![record(Some("z"), unit(0), "Z")])
        .await;
    assert!(matches!(gone_upsert, Err(KbError::NotFound(_))));
}

#[tokio::test]
async fn lance_backend_honours_contract() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = LanceVectorIndex::open(&temp_dir.path().join("vectors"))
        .await
        .expect("should open");
    exercise(&index).await;
}

#[tokio::test]
async fn milvus_backend_honours_contract() {
    let server = FakeMilvus::start().await;
    let index = MilvusVectorIndex::connect(&MilvusConfig {
        url: Some(server.uri()),
        token: None,
        database: "default".to_string(),
        timeout_secs: 5,
    })
    .await
    .expect("should connect");
    exercise(&index).await;
}

#[tokio::test]
async fn invalid_collection_names_are_rejected() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = LanceVectorIndex::open(&temp_dir.path().join("vectors"))
        .await
        .expect("should open");
    for name in ["", "has space", "semi;colon"] {
        let result = index.create_or_get_collection(name, 4).await;
        assert!(matches!(result, Err(KbError::Validation(_))), "{name:?}");
    }
}

#[tokio::test]
async fn milvus_without_url_fails_before_any_request() {
    let result = MilvusVectorIndex::connect(&MilvusConfig {
        url: None,
        ..MilvusConfig::default()
    })
    .await;
    assert!(result.is_err());
}
