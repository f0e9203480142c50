#![allow(dead_code, reason = "each test binary uses a different subset")]

// Stateful fakes for the remote services the crate talks to

use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use kb_rag::config::{Config, EmbeddingConfig, LlmConfig, ProviderConfig};

pub const DIMENSION: usize = 32;

pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("kb_rag=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Bag-of-words vector: each word bumps one hashed bucket, result is unit length
pub fn hash_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMENSION];
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
        vector[(hash % DIMENSION as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    } else {
        vector[0] = 1.0;
    }
    vector
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// OpenAI-style `/embeddings` endpoint backed by `hash_vector`
pub struct FakeEmbeddings;

impl Respond for FakeEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        let data: Vec<Value> = body["input"]
            .as_array()
            .map(|inputs| {
                inputs
                    .iter()
                    .enumerate()
                    .map(|(index, text)| {
                        json!({
                            "index": index,
                            "embedding": hash_vector(text.as_str().unwrap_or_default()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(json!({ "object": "list", "data": data }))
    }
}

struct FakeCollection {
    dimension: usize,
    rows: BTreeMap<String, (Vec<f32>, Value)>,
}

/// In-memory Milvus REST v2 server covering the calls the vector index makes
#[derive(Clone, Default)]
pub struct FakeMilvus {
    collections: Arc<Mutex<HashMap<String, FakeCollection>>>,
}

impl FakeMilvus {
    pub async fn start() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/v2/vectordb/"))
            .respond_with(Self::default())
            .mount(&server)
            .await;
        server
    }

    fn handle(&self, endpoint: &str, body: &Value) -> Result<Value, String> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| "state poisoned".to_string())?;
        let name = body["collectionName"].as_str().unwrap_or_default().to_string();

        match endpoint {
            "collections/list" => Ok(json!(collections.keys().collect::<Vec<_>>())),
            "collections/has" => Ok(json!({ "has": collections.contains_key(&name) })),
            "collections/create" => {
                let dimension = body["schema"]["fields"]
                    .as_array()
                    .and_then(|fields| {
                        fields
                            .iter()
                            .find(|f| f["dataType"] == "FloatVector")
                            .and_then(|f| f["elementTypeParams"]["dim"].as_str())
                            .and_then(|d| d.parse().ok())
                    })
                    .ok_or("missing dim")?;
                collections.insert(
                    name,
                    FakeCollection {
                        dimension,
                        rows: BTreeMap::new(),
                    },
                );
                Ok(json!({}))
            }
            "collections/describe" => {
                let collection = collections.get(&name).ok_or("collection not found")?;
                Ok(json!({
                    "collectionName": name,
                    "fields": [
                        { "name": "id", "type": "VarChar" },
                        {
                            "name": "vector",
                            "type": "FloatVector",
                            "params": [{ "key": "dim", "value": collection.dimension.to_string() }]
                        },
                        { "name": "metadata", "type": "JSON" }
                    ]
                }))
            }
            "collections/load" => Ok(json!({})),
            "collections/drop" => {
                collections.remove(&name);
                Ok(json!({}))
            }
            "entities/upsert" => {
                let collection = collections.get_mut(&name).ok_or("collection not found")?;
                let rows = body["data"].as_array().ok_or("missing data")?;
                for row in rows {
                    let id = row["id"].as_str().ok_or("missing id")?.to_string();
                    let vector: Vec<f32> = serde_json::from_value(row["vector"].clone())
                        .map_err(|e| e.to_string())?;
                    if vector.len() != collection.dimension {
                        return Err("dimension mismatch".to_string());
                    }
                    collection.rows.insert(id, (vector, row["metadata"].clone()));
                }
                Ok(json!({ "upsertCount": rows.len() }))
            }
            "entities/delete" => {
                let collection = collections.get_mut(&name).ok_or("collection not found")?;
                let filter = body["filter"].as_str().unwrap_or_default();
                let list = filter.split_once(" in ").map_or("[]", |(_, list)| list);
                let ids: Vec<String> = serde_json::from_str(list).map_err(|e| e.to_string())?;
                for id in ids {
                    collection.rows.remove(&id);
                }
                Ok(json!({}))
            }
            "entities/query" => {
                let collection = collections.get(&name).ok_or("collection not found")?;
                Ok(json!([{ "count(*)": collection.rows.len() }]))
            }
            "entities/search" => {
                let collection = collections.get(&name).ok_or("collection not found")?;
                let query: Vec<f32> = serde_json::from_value(body["data"][0].clone())
                    .map_err(|e| e.to_string())?;
                let limit = body["limit"].as_u64().unwrap_or(10) as usize;
                let mut hits: Vec<(f32, &String, &Value)> = collection
                    .rows
                    .iter()
                    .map(|(id, (vector, metadata))| (cosine(&query, vector), id, metadata))
                    .collect();
                hits.sort_by(|a, b| b.0.total_cmp(&a.0));
                hits.truncate(limit);
                let hits: Vec<Value> = hits
                    .into_iter()
                    .map(|(score, id, metadata)| {
                        json!({ "id": id, "distance": score, "metadata": metadata })
                    })
                    .collect();
                Ok(Value::Array(hits))
            }
            other => Err(format!("unsupported endpoint {}", other)),
        }
    }
}

impl Respond for FakeMilvus {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let endpoint = request
            .url
            .path()
            .trim_start_matches("/v2/vectordb/")
            .to_string();
        let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
        match self.handle(&endpoint, &body) {
            Ok(data) => ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": data })),
            Err(message) => ResponseTemplate::new(200)
                .set_body_json(json!({ "code": 1100, "message": message })),
        }
    }
}

/// Chat completion that always answers with `text`
pub async fn mount_completion(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop"
            }]
        })))
        .mount(server)
        .await;
}

pub async fn mount_embeddings(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(FakeEmbeddings)
        .mount(server)
        .await;
}

/// Configuration rooted in `dir` whose embedding and completion endpoints point at `server`
pub fn config_for(dir: &std::path::Path, server: &MockServer) -> Config {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: Some("test-key".to_string()),
        },
    );
    Config {
        embedding: EmbeddingConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: Some("test-key".to_string()),
            dimension: DIMENSION,
            batch_size: 8,
            timeout_secs: 5,
            ..EmbeddingConfig::default()
        },
        llm: LlmConfig {
            timeout_secs: 5,
            providers,
        },
        base_dir: dir.to_path_buf(),
        ..Config::default()
    }
}

pub fn metadata(title: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("title".to_string(), json!(title));
    map
}
