// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Vector Memory Store Adapter
//
// HTTP client for the external semantic-memory index. Content is embedded
// through an OpenAI-compatible embeddings endpoint, then queried/upserted
// against a Pinecone-shaped vector API. The similarity threshold lives
// here, not in the retrieval stage.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::config::{resolve_secret, MemoryConfig};
use crate::domain::memory::{MemoryHit, MemoryQuery, MemoryStore};

/// Vector metadata payload cap; larger content is truncated before upsert.
const METADATA_CONTENT_LIMIT: usize = 4000;

/// Client for the embeddings endpoint.
pub struct EmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, api_key, model }
    }

    pub async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({ "input": [text], "model": self.model }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("embeddings endpoint returned no vectors"))
    }
}

pub struct HttpVectorStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    embedder: EmbeddingClient,
    /// Relevance floor owned by the store, not the retrieval stage.
    min_similarity: f64,
}

#[derive(Serialize)]
struct VectorQueryRequest<'a> {
    vector: &'a [f32],
    #[serde(rename = "topK")]
    top_k: usize,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct VectorQueryResponse {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}

#[derive(Deserialize)]
struct VectorMatch {
    id: String,
    score: f64,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl HttpVectorStore {
    pub fn from_config(config: &MemoryConfig) -> anyhow::Result<Self> {
        let api_key = resolve_secret(&config.api_key)?;
        let embedding_key = resolve_secret(&config.embedding_api_key)?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            embedder: EmbeddingClient::new(
                config.embedding_endpoint.clone(),
                embedding_key,
                config.embedding_model.clone(),
            ),
            min_similarity: config.min_similarity,
        })
    }
}

#[async_trait]
impl MemoryStore for HttpVectorStore {
    async fn query(&self, query: &MemoryQuery) -> anyhow::Result<Vec<MemoryHit>> {
        debug!("Querying memory: {:.80}", query.text);

        let vector = self.embedder.embed(&query.text).await?;
        let request = VectorQueryRequest {
            vector: &vector,
            top_k: query.top_k,
            include_metadata: true,
            filter: query.filter.as_ref(),
        };

        let response = self
            .client
            .post(format!("{}/query", self.endpoint))
            .header("Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let parsed: VectorQueryResponse = response.json().await?;
        let total = parsed.matches.len();
        let floor = self.min_similarity.max(query.min_similarity);

        let hits: Vec<MemoryHit> = parsed
            .matches
            .into_iter()
            .filter(|m| m.score >= floor)
            .map(|mut m| {
                let content = m
                    .metadata
                    .remove("content")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                MemoryHit {
                    id: m.id,
                    similarity: (m.score * 10_000.0).round() / 10_000.0,
                    content,
                    metadata: m.metadata,
                }
            })
            .collect();

        info!("Memory query matched {}/{} above similarity {:.2}", hits.len(), total, floor);
        Ok(hits)
    }

    async fn upsert(
        &self,
        id: &str,
        content: &str,
        mut metadata: HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<bool> {
        info!("Upserting memory '{}' ({} chars)", id, content.len());

        let vector = self.embedder.embed(content).await?;

        let truncated: String = content.chars().take(METADATA_CONTENT_LIMIT).collect();
        metadata.insert("content".to_string(), json!(truncated));
        metadata.insert("ingested_at".to_string(), json!(Utc::now().to_rfc3339()));
        metadata
            .entry("source".to_string())
            .or_insert_with(|| json!("agent-distillation"));

        let response = self
            .client
            .post(format!("{}/vectors/upsert", self.endpoint))
            .header("Api-Key", &self.api_key)
            .json(&json!({
                "vectors": [{ "id": id, "values": vector, "metadata": metadata }]
            }))
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}

/// Stand-in used when the memory collaborator is disabled: lookups find
/// nothing and writes are dropped.
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn query(&self, _query: &MemoryQuery) -> anyhow::Result<Vec<MemoryHit>> {
        Ok(Vec::new())
    }

    async fn upsert(
        &self,
        _id: &str,
        _content: &str,
        _metadata: HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_for(server: &mockito::Server) -> HttpVectorStore {
        HttpVectorStore {
            client: reqwest::Client::new(),
            endpoint: server.url(),
            api_key: "k".to_string(),
            embedder: EmbeddingClient::new(server.url(), "k".to_string(), "embed-model".to_string()),
            min_similarity: 0.7,
        }
    }

    #[tokio::test]
    async fn query_filters_below_min_similarity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[0.1,0.2]}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/query")
            .with_status(200)
            .with_body(
                r#"{"matches":[
                    {"id":"a","score":0.91,"metadata":{"content":"strong match"}},
                    {"id":"b","score":0.42,"metadata":{"content":"weak match"}}
                ]}"#,
            )
            .create_async()
            .await;

        let store = store_for(&server);
        let hits = store.query(&MemoryQuery::new("vpn gateway", 3)).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].content, "strong match");
    }

    #[tokio::test]
    async fn upsert_reports_rejection_as_false() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[0.1]}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/vectors/upsert")
            .with_status(500)
            .create_async()
            .await;

        let store = store_for(&server);
        let accepted = store.upsert("exp-1", "lesson", HashMap::new()).await.unwrap();
        assert!(!accepted);
    }
}
