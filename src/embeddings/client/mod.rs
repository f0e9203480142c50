
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::http::{build_agent, describe_error, post_json};
use crate::{KbError, Result};

/// OpenAI-compatible embedding client (`POST {base_url}/embeddings`)
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    batch_size: usize,
    dimension: usize,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Debug, Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        config.validate()?;
        let base_url = config.endpoint_url()?;
        let endpoint = base_url
            .join("embeddings")
            .map_err(|e| KbError::Config(format!("Failed to build embedding URL: {}", e)))?;

        Ok(Self {
            endpoint,
            api_key: config.resolved_api_key(),
            model: config.model.clone(),
            batch_size: config.batch_size,
            dimension: config.dimension,
            agent: build_agent(config.timeout()),
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Send one batch and return its vectors in input order
    fn embed_batch_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request_json = serde_json::to_string(&EmbedRequest {
            model: &self.model,
            input: texts,
        })
        .map_err(|e| KbError::RemoteService(format!("Failed to encode request: {}", e)))?;

        let response_text = post_json(
            &self.agent,
            self.endpoint.as_str(),
            self.api_key.as_deref(),
            &request_json,
        )
        .map_err(|e| KbError::RemoteService(describe_error("Embedding endpoint", &e)))?;

        let response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            KbError::RemoteService(format!("Failed to parse embedding response: {}", e))
        })?;

        self.order_and_validate(texts.len(), response.data)
    }

    fn order_and_validate(
        &self,
        expected: usize,
        mut items: Vec<EmbedItem>,
    ) -> Result<Vec<Vec<f32>>> {
        if items.len() != expected {
            return Err(KbError::RemoteService(format!(
                "Mismatch between request and response counts: {} vs {}",
                expected,
                items.len()
            )));
        }

        if items.iter().all(|item| item.index.is_some()) {
            items.sort_by_key(|item| item.index);
        }

        items
            .into_iter()
            .map(|item| {
                if item.embedding.len() == self.dimension {
                    Ok(item.embedding)
                } else {
                    Err(KbError::RemoteService(format!(
                        "Embedding has {} dimensions, expected {}",
                        item.embedding.len(),
                        self.dimension
                    )))
                }
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating embeddings for {} texts in batches of {}",
            texts.len(),
            self.batch_size
        );

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let client = self.clone();
            let batch = batch.to_vec();
            let batch_vectors = tokio::task::spawn_blocking(move || {
                client.embed_batch_blocking(&batch)
            })
            .await
            .map_err(|e| KbError::RemoteService(format!("Embedding task failed: {}", e)))??;
            vectors.extend(batch_vectors);
        }

        info!("Generated {} embeddings", vectors.len());
        Ok(vectors)
    }
}
