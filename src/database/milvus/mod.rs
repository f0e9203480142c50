// Milvus vector database module
// Networked backend reached through the Milvus REST v2 API


use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

use crate::config::MilvusConfig;
use crate::database::vector::{
    ScoredRecord, SearchCandidate, VectorIndex, VectorRecord, assign_ids, check_dimension,
    rank_candidates, validate_collection_name,
};
use crate::http::{build_agent, describe_error, post_json};
use crate::{KbError, Result};

const ID_FIELD: &str = "id";
const VECTOR_FIELD: &str = "vector";
const METADATA_FIELD: &str = "metadata";
const MAX_ID_LENGTH: usize = 128;

/// Vector index backed by a Milvus cluster
pub struct MilvusVectorIndex {
    client: Arc<MilvusClient>,
    /// Collection dimensions learned from create/describe calls
    dimensions: Mutex<HashMap<String, usize>>,
}

/// Blocking REST client; every call runs on the blocking pool
struct MilvusClient {
    base: Url,
    token: Option<String>,
    database: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct MilvusEnvelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

impl MilvusClient {
    fn call(&self, endpoint: &str, mut body: Value) -> Result<Value> {
        if let Value::Object(map) = &mut body {
            map.insert("dbName".to_string(), json!(self.database));
        }
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| KbError::VectorBackend(format!("Invalid Milvus endpoint: {}", e)))?;

        let response_text = post_json(
            &self.agent,
            url.as_str(),
            self.token.as_deref(),
            &body.to_string(),
        )
        .map_err(|e| KbError::VectorBackend(describe_error("Milvus", &e)))?;

        let envelope: MilvusEnvelope = serde_json::from_str(&response_text).map_err(|e| {
            KbError::VectorBackend(format!("Failed to parse Milvus response: {}", e))
        })?;

        if envelope.code != 0 {
            return Err(KbError::VectorBackend(format!(
                "Milvus {} failed with code {}: {}",
                endpoint,
                envelope.code,
                envelope.message.unwrap_or_default()
            )));
        }
        Ok(envelope.data)
    }
}

impl MilvusVectorIndex {
    /// Connect and health-check the cluster; a missing URL fails before any request
    #[inline]
    pub async fn connect(config: &MilvusConfig) -> Result<Self> {
        let base = config
            .endpoint_url()
            .map_err(|e| KbError::VectorBackend(e.to_string()))?
            .join("v2/vectordb/")
            .map_err(|e| KbError::VectorBackend(format!("Invalid Milvus URL: {}", e)))?;

        let index = Self {
            client: Arc::new(MilvusClient {
                base,
                token: config.resolved_token(),
                database: config.database.clone(),
                agent: build_agent(config.timeout()),
            }),
            dimensions: Mutex::new(HashMap::new()),
        };

        index.request("collections/list", json!({})).await?;
        info!("Connected to Milvus database '{}'", config.database);
        Ok(index)
    }

    async fn request(&self, endpoint: &'static str, body: Value) -> Result<Value> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.call(endpoint, body))
            .await
            .map_err(|e| KbError::VectorBackend(format!("Milvus task failed: {}", e)))?
    }

    fn cached_dimension(&self, name: &str) -> Option<usize> {
        self.dimensions
            .lock()
            .ok()
            .and_then(|dims| dims.get(name).copied())
    }

    fn remember_dimension(&self, name: &str, dimension: Option<usize>) {
        if let Ok(mut dims) = self.dimensions.lock() {
            match dimension {
                Some(dim) => {
                    dims.insert(name.to_string(), dim);
                }
                None => {
                    dims.remove(name);
                }
            }
        }
    }

    /// Dimension of an existing collection, `NotFound` if it does not exist
    async fn collection_dimension(&self, name: &str) -> Result<usize> {
        validate_collection_name(name)?;
        if !self.has_collection(name).await? {
            self.remember_dimension(name, None);
            return Err(KbError::NotFound(format!("Collection '{}'", name)));
        }
        if let Some(dim) = self.cached_dimension(name) {
            return Ok(dim);
        }

        let described = self
            .request("collections/describe", json!({ "collectionName": name }))
            .await?;
        let dim = parse_vector_dimension(&described).ok_or_else(|| {
            KbError::VectorBackend(format!(
                "Collection '{}' has no float vector field",
                name
            ))
        })?;
        self.remember_dimension(name, Some(dim));
        Ok(dim)
    }
}

/// Declared schema: VarChar primary key, float vector, JSON metadata, COSINE index
pub(crate) fn create_collection_body(name: &str, dimension: usize) -> Value {
    json!({
        "collectionName": name,
        "schema": {
            "autoId": false,
            "enableDynamicField": false,
            "fields": [
                {
                    "fieldName": ID_FIELD,
                    "dataType": "VarChar",
                    "isPrimary": true,
                    "elementTypeParams": { "max_length": MAX_ID_LENGTH.to_string() }
                },
                {
                    "fieldName": VECTOR_FIELD,
                    "dataType": "FloatVector",
                    "elementTypeParams": { "dim": dimension.to_string() }
                },
                {
                    "fieldName": METADATA_FIELD,
                    "dataType": "JSON"
                }
            ]
        },
        "indexParams": [
            {
                "fieldName": VECTOR_FIELD,
                "indexName": "vector_index",
                "metricType": "COSINE",
                "indexType": "AUTOINDEX"
            }
        ]
    })
}

/// Read the vector dimension out of a `collections/describe` payload
pub(crate) fn parse_vector_dimension(described: &Value) -> Option<usize> {
    described["fields"]
        .as_array()?
        .iter()
        .find(|field| field["name"] == VECTOR_FIELD || field["type"] == "FloatVector")?["params"]
        .as_array()?
        .iter()
        .find(|param| param["key"] == "dim")
        .and_then(|param| match &param["value"] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
            _ => None,
        })
}

/// Filter expression selecting rows by primary key
pub(crate) fn id_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| Value::String(id.clone()).to_string())
        .collect();
    format!("{} in [{}]", ID_FIELD, quoted.join(", "))
}

/// Convert `entities/search` hits into candidates.
///
/// With the COSINE metric Milvus reports similarity in the `distance` field, so it is
/// turned back into a cosine distance here.
pub(crate) fn parse_search_hits(data: &Value) -> Result<Vec<SearchCandidate>> {
    let hits = match data {
        Value::Array(hits) => hits,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(KbError::VectorBackend(format!(
                "Unexpected Milvus search payload: {}",
                other
            )));
        }
    };

    hits.iter()
        .map(|hit| {
            let id = match &hit[ID_FIELD] {
                Value::String(s) => s.clone(),
                Value::Null => {
                    return Err(KbError::VectorBackend(
                        "Milvus search hit without id".to_string(),
                    ));
                }
                other => other.to_string(),
            };
            let distance = hit["distance"]
                .as_f64()
                .map(|similarity| 1.0 - similarity as f32);
            let metadata = match &hit[METADATA_FIELD] {
                Value::Object(map) => map.clone(),
                Value::String(raw) => serde_json::from_str::<Map<String, Value>>(raw)
                    .map_err(|e| {
                        KbError::VectorBackend(format!("Stored metadata is not JSON: {}", e))
                    })?,
                _ => Map::new(),
            };
            Ok(SearchCandidate {
                id,
                distance,
                metadata,
            })
        })
        .collect()
}

fn parse_count(data: &Value) -> Option<usize> {
    data.as_array()?
        .first()?
        .get("count(*)")?
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
}

#[async_trait]
impl VectorIndex for MilvusVectorIndex {
    #[inline]
    fn backend_name(&self) -> &'static str {
        "milvus"
    }

    async fn create_or_get_collection(&self, name: &str, dimension: usize) -> Result<()> {
        validate_collection_name(name)?;
        if dimension == 0 {
            return Err(KbError::Validation(
                "Collection dimension must be greater than 0".to_string(),
            ));
        }

        if self.has_collection(name).await? {
            let existing = self.collection_dimension(name).await?;
            if existing != dimension {
                return Err(KbError::VectorBackend(format!(
                    "Collection '{}' exists with {} dimensions, requested {}",
                    name, existing, dimension
                )));
            }
            debug!("Collection '{}' already exists", name);
            return Ok(());
        }

        info!("Creating collection '{}' with {} dimensions", name, dimension);
        self.request("collections/create", create_collection_body(name, dimension))
            .await?;
        self.remember_dimension(name, Some(dimension));
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        validate_collection_name(name)?;
        let data = self
            .request("collections/has", json!({ "collectionName": name }))
            .await?;
        Ok(data["has"].as_bool().unwrap_or(false))
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        let dimension = self.collection_dimension(collection).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        for record in &records {
            check_dimension(collection, dimension, record.vector.len())?;
        }

        let assigned = assign_ids(records);
        let ids: Vec<String> = assigned.iter().map(|(id, _)| id.clone()).collect();
        if let Some(long) = ids.iter().find(|id| id.len() > MAX_ID_LENGTH) {
            return Err(KbError::Validation(format!(
                "Record id '{}' exceeds {} bytes",
                long, MAX_ID_LENGTH
            )));
        }

        let rows: Vec<Value> = assigned
            .into_iter()
            .map(|(id, record)| {
                json!({
                    ID_FIELD: id,
                    VECTOR_FIELD: record.vector,
                    METADATA_FIELD: Value::Object(record.metadata),
                })
            })
            .collect();

        self.request(
            "entities/upsert",
            json!({ "collectionName": collection, "data": rows }),
        )
        .await?;

        debug!("Upserted {} records into '{}'", ids.len(), collection);
        Ok(ids)
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let dimension = self.collection_dimension(collection).await?;
        check_dimension(collection, dimension, query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        self.request("collections/load", json!({ "collectionName": collection }))
            .await?;

        let data = self
            .request(
                "entities/search",
                json!({
                    "collectionName": collection,
                    "data": [query],
                    "annsField": VECTOR_FIELD,
                    "limit": k,
                    "outputFields": [ID_FIELD, METADATA_FIELD],
                    "searchParams": { "metricType": "COSINE" }
                }),
            )
            .await?;

        let candidates = parse_search_hits(&data)?;
        debug!(
            "Milvus returned {} candidates from '{}'",
            candidates.len(),
            collection
        );
        Ok(rank_candidates(candidates, k, threshold))
    }

    async fn delete_records(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() || !self.has_collection(collection).await? {
            return Ok(());
        }
        self.request(
            "entities/delete",
            json!({ "collectionName": collection, "filter": id_filter(ids) }),
        )
        .await?;
        debug!("Deleted {} records from '{}'", ids.len(), collection);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        self.collection_dimension(collection).await?;
        self.request("collections/load", json!({ "collectionName": collection }))
            .await?;
        let data = self
            .request(
                "entities/query",
                json!({
                    "collectionName": collection,
                    "filter": "",
                    "outputFields": ["count(*)"]
                }),
            )
            .await?;
        parse_count(&data)
            .ok_or_else(|| KbError::VectorBackend("Milvus count query returned no count".to_string()))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.remember_dimension(name, None);
        if !self.has_collection(name).await? {
            debug!("Collection '{}' already absent", name);
            return Ok(());
        }
        info!("Dropping collection '{}'", name);
        self.request("collections/drop", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }
}
