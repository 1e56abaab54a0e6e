// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Live Research Adapter
//
// Client for a Sonar-style research backend: chat-completions request in,
// synthesized answer with source citations out. Grounds drafts in current
// vendor documentation instead of model memory.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::domain::config::{resolve_secret, ResearchConfig};
use crate::domain::research::{ResearchFindings, ResearchProvider};

const RESEARCH_SYSTEM_PROMPT: &str = "You are a technical research assistant specializing in \
cloud platforms, identity systems, infrastructure-as-code and enterprise IT operations. \
Provide precise, current, and actionable answers. Always cite your sources.";

pub struct SonarResearchClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ResearchResponse {
    #[serde(default)]
    choices: Vec<ResearchChoice>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Deserialize)]
struct ResearchChoice {
    message: ResearchMessage,
}

#[derive(Deserialize)]
struct ResearchMessage {
    content: String,
}

impl SonarResearchClient {
    pub fn from_config(config: &ResearchConfig) -> anyhow::Result<Self> {
        let api_key = resolve_secret(&config.api_key)?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ResearchProvider for SonarResearchClient {
    async fn search(&self, query: &str) -> anyhow::Result<ResearchFindings> {
        debug!("Research query: {:.80}", query);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": RESEARCH_SYSTEM_PROMPT },
                    { "role": "user", "content": query },
                ],
                "max_tokens": self.max_tokens,
                "temperature": 0.1,
                "return_citations": true,
            }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: ResearchResponse = response.json().await?;
        let answer = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        info!("Research returned {} chars, {} citations", answer.len(), parsed.citations.len());
        Ok(ResearchFindings { answer, citations: parsed.citations })
    }
}

/// Stand-in used when the research collaborator is disabled.
pub struct NullResearchProvider;

#[async_trait]
impl ResearchProvider for NullResearchProvider {
    async fn search(&self, _query: &str) -> anyhow::Result<ResearchFindings> {
        Ok(ResearchFindings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_extracts_answer_and_citations() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{
                    "choices":[{"message":{"role":"assistant","content":"Standard SKUs require..."}}],
                    "citations":["https://learn.microsoft.com/lb"]
                }"#,
            )
            .create_async()
            .await;

        let client = SonarResearchClient {
            client: reqwest::Client::new(),
            endpoint: server.url(),
            api_key: "k".to_string(),
            model: "sonar-pro".to_string(),
            max_tokens: 512,
        };

        let findings = client.search("load balancer limits").await.unwrap();
        assert!(findings.answer.starts_with("Standard SKUs"));
        assert_eq!(findings.citations.len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/chat/completions").with_status(502).create_async().await;

        let client = SonarResearchClient {
            client: reqwest::Client::new(),
            endpoint: server.url(),
            api_key: "k".to_string(),
            model: "sonar-pro".to_string(),
            max_tokens: 512,
        };

        assert!(client.search("anything").await.is_err());
    }
}
