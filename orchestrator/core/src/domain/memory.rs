// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Semantic Memory Domain Interface
//
// Contract for the external experience store (vector similarity search and
// upsert). Implementations are best-effort collaborators: the orchestration
// loop tolerates every failure here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One similarity match returned by the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    /// Cosine similarity in [0, 1].
    pub similarity: f64,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Parameters of a similarity lookup.
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub text: String,
    pub top_k: usize,
    pub filter: Option<HashMap<String, serde_json::Value>>,
    /// Hits below this similarity are dropped by the store.
    pub min_similarity: f64,
}

impl MemoryQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self { text: text.into(), top_k, filter: None, min_similarity: 0.7 }
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Retrieve semantically similar past experience records, best first.
    async fn query(&self, query: &MemoryQuery) -> anyhow::Result<Vec<MemoryHit>>;

    /// Store a new experience record. Returns whether the write was accepted.
    async fn upsert(
        &self,
        id: &str,
        content: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<bool>;
}
