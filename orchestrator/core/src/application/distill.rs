// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Experience Distillation
//
// After a delivered run, compress the interaction into a concise lesson and
// store it in semantic memory for future recall. Side-channel improvement
// mechanism: every failure here is logged and swallowed.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::llm::{ChatMessage, GenerationBackend, GenerationOptions, ModelTier};
use crate::domain::memory::MemoryStore;
use crate::domain::run::RunState;

/// Pure classification hook over (query, solution); swappable for tests and
/// alternative taxonomies.
pub type Categorizer = fn(&str, &str) -> Option<&'static str>;

/// Solutions at or below this length skip LLM compression.
const COMPRESSION_THRESHOLD: usize = 500;

pub struct DistillService {
    backend: Arc<dyn GenerationBackend>,
    memory: Arc<dyn MemoryStore>,
    compression_enabled: bool,
    categorizer: Categorizer,
    generation_timeout: Duration,
}

impl DistillService {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        memory: Arc<dyn MemoryStore>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            memory,
            compression_enabled: true,
            categorizer: keyword_category,
            generation_timeout,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_categorizer(mut self, categorizer: Categorizer) -> Self {
        self.categorizer = categorizer;
        self
    }

    /// Store the lesson for a delivered run. Returns the stored document id,
    /// or None when distillation was skipped or failed.
    pub async fn distill(&self, state: &RunState) -> Option<String> {
        let deliverable = state.final_deliverable.as_deref()?;
        let route = state.route.map(|r| r.as_str()).unwrap_or("unknown");
        let score = state.review.as_ref().map(|v| v.score).unwrap_or(0);

        info!("Distilling experience: {:.60}", state.query);

        let lesson = if self.compression_enabled && deliverable.len() > COMPRESSION_THRESHOLD {
            match self.compress_with_llm(state, deliverable, route, score).await {
                Ok(lesson) if !lesson.is_empty() => lesson,
                Ok(_) => raw_lesson(state, deliverable, route, score),
                Err(e) => {
                    warn!("LLM compression failed ({}), using raw compression", e);
                    raw_lesson(state, deliverable, route, score)
                }
            }
        } else {
            raw_lesson(state, deliverable, route, score)
        };

        let doc_id = format!("exp-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), route);
        let metadata = self.build_metadata(state, deliverable, route, score);

        match self.memory.upsert(&doc_id, &lesson, metadata).await {
            Ok(true) => {
                info!("Experience '{}' stored ({} chars)", doc_id, lesson.len());
                Some(doc_id)
            }
            Ok(false) => {
                warn!("Experience '{}' was not accepted by the memory store", doc_id);
                None
            }
            Err(e) => {
                warn!("Experience storage failed (non-fatal): {}", e);
                None
            }
        }
    }

    fn build_metadata(
        &self,
        state: &RunState,
        deliverable: &str,
        route: &str,
        score: u8,
    ) -> HashMap<String, serde_json::Value> {
        let query_excerpt: String = state.query.chars().take(300).collect();
        let mut metadata = HashMap::from([
            ("type".to_string(), json!("experience")),
            ("route".to_string(), json!(route)),
            ("score".to_string(), json!(score)),
            ("iterations".to_string(), json!(state.iteration)),
            ("query".to_string(), json!(query_excerpt)),
            ("context_sources".to_string(), json!(state.context.sources().join(","))),
            ("had_errors".to_string(), json!(!state.validation_errors.is_empty())),
            ("distilled_at".to_string(), json!(Utc::now().to_rfc3339())),
        ]);

        if !state.validation_errors.is_empty() {
            let summary: String =
                state.validation_errors.join("; ").chars().take(500).collect();
            metadata.insert("error_summary".to_string(), json!(summary));
        }

        if let Some(category) = (self.categorizer)(&state.query, deliverable) {
            metadata.insert("category".to_string(), json!(category));
        }

        metadata
    }

    async fn compress_with_llm(
        &self,
        state: &RunState,
        deliverable: &str,
        route: &str,
        score: u8,
    ) -> anyhow::Result<String> {
        let excerpt: String = deliverable.chars().take(3000).collect();
        let error_section = if state.validation_errors.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nErrors that were fixed during iteration:\n{}",
                state
                    .validation_errors
                    .iter()
                    .map(|e| format!("- {}", e))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        };

        let prompt = format!(
            "Compress this infrastructure task into a concise lesson for future reference.\n\
             Focus on: the problem pattern, the key solution technique, and any gotchas discovered.\n\
             Keep it under 500 words. Make it searchable — someone with a similar problem should find this useful.\n\n\
             TASK: {}\nROUTE: {}\nQUALITY SCORE: {}/10{}\n\n\
             SOLUTION (excerpt):\n{}\n\nWrite the compressed lesson:",
            state.query, route, score, error_section, excerpt
        );

        let response = tokio::time::timeout(
            self.generation_timeout,
            self.backend.generate(
                ModelTier::Triage,
                &[ChatMessage::user(prompt)],
                &GenerationOptions { max_tokens: Some(1024), temperature: Some(0.1), json_mode: false },
            ),
        )
        .await
        .map_err(|_| anyhow::anyhow!("compression timed out"))??;

        Ok(response.text)
    }
}

/// Deterministic fallback lesson: structured concatenation of the key fields.
fn raw_lesson(state: &RunState, deliverable: &str, route: &str, score: u8) -> String {
    let mut parts = vec![
        format!("Query: {}", state.query),
        format!("Route: {} | Score: {}/10", route, score),
    ];
    if !state.validation_errors.is_empty() {
        parts.push(format!("Errors fixed: {}", state.validation_errors.join("; ")));
    }
    let excerpt: String = deliverable.chars().take(1500).collect();
    parts.push(format!("Solution (summary): {}", excerpt));
    parts.join("\n")
}

/// Default category detector: first keyword family that matches wins.
pub fn keyword_category(query: &str, solution: &str) -> Option<&'static str> {
    let excerpt: String = solution.chars().take(500).collect();
    let haystack = format!("{} {}", query, excerpt).to_lowercase();

    if haystack.contains("terraform") || haystack.contains(".tf") {
        Some("terraform")
    } else if haystack.contains("powershell") || haystack.contains(".ps1") || haystack.contains("get-") {
        Some("powershell")
    } else if haystack.contains("runbook") || haystack.contains("incident") {
        Some("runbook")
    } else if haystack.contains("ansible") || haystack.contains("playbook") {
        Some("ansible")
    } else if haystack.contains("entra") || haystack.contains("active directory") {
        Some("identity")
    } else if haystack.contains("azure") {
        Some("azure")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm::{GenerationResponse, LLMError, TokenUsage};
    use crate::domain::memory::{MemoryHit, MemoryQuery};
    use crate::domain::run::{ReviewVerdict, Route};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn category_detection_prefers_specific_matches() {
        assert_eq!(keyword_category("Create a Terraform module", ""), Some("terraform"));
        assert_eq!(keyword_category("Export users", "Get-ADUser -Filter *"), Some("powershell"));
        assert_eq!(keyword_category("Write an incident runbook", ""), Some("runbook"));
        assert_eq!(keyword_category("Fix Entra sync", ""), Some("identity"));
        assert_eq!(keyword_category("Resize the azure vm", ""), Some("azure"));
        assert_eq!(keyword_category("What is BGP?", "BGP is a routing protocol"), None);
    }

    #[test]
    fn raw_lesson_is_deterministic_and_structured() {
        let mut state = RunState::new("Create a VPN gateway module", 3);
        state.route = Some(Route::Engineer);
        state.validation_errors = vec!["missing diagnostic_setting".to_string()];

        let lesson = raw_lesson(&state, "resource \"azurerm_vpn_gateway\" ...", "engineer", 8);
        assert!(lesson.starts_with("Query: Create a VPN gateway module"));
        assert!(lesson.contains("Route: engineer | Score: 8/10"));
        assert!(lesson.contains("Errors fixed: missing diagnostic_setting"));
        assert!(lesson.contains("Solution (summary):"));
    }

    struct NoBackend;

    #[async_trait]
    impl GenerationBackend for NoBackend {
        async fn generate(
            &self,
            _tier: ModelTier,
            _messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> Result<GenerationResponse, LLMError> {
            Err(LLMError::Provider("unavailable".into()))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        upserts: Mutex<Vec<(String, String, HashMap<String, serde_json::Value>)>>,
        accept: bool,
    }

    #[async_trait]
    impl MemoryStore for RecordingStore {
        async fn query(&self, _query: &MemoryQuery) -> anyhow::Result<Vec<MemoryHit>> {
            Ok(Vec::new())
        }

        async fn upsert(
            &self,
            id: &str,
            content: &str,
            metadata: HashMap<String, serde_json::Value>,
        ) -> anyhow::Result<bool> {
            self.upserts.lock().unwrap().push((id.to_string(), content.to_string(), metadata));
            Ok(self.accept)
        }
    }

    fn delivered_state() -> RunState {
        let mut state = RunState::new("Create a Terraform module for a VPN gateway", 3);
        state.route = Some(Route::Engineer);
        state.iteration = 2;
        state.review = Some(ReviewVerdict::fixed_accept(8, "approved"));
        state.final_deliverable = Some("short solution".to_string());
        state
    }

    #[tokio::test]
    async fn distill_stores_lesson_with_metadata() {
        let store = Arc::new(RecordingStore { accept: true, ..Default::default() });
        let service =
            DistillService::new(Arc::new(NoBackend), store.clone(), Duration::from_secs(5));

        let doc_id = service.distill(&delivered_state()).await.unwrap();
        assert!(doc_id.starts_with("exp-"));
        assert!(doc_id.ends_with("-engineer"));

        let upserts = store.upserts.lock().unwrap();
        let (_, content, metadata) = &upserts[0];
        assert!(content.contains("Route: engineer | Score: 8/10"));
        assert_eq!(metadata["category"], json!("terraform"));
        assert_eq!(metadata["iterations"], json!(2));
        assert_eq!(metadata["had_errors"], json!(false));
    }

    #[tokio::test]
    async fn compression_failure_falls_back_to_raw_lesson() {
        let store = Arc::new(RecordingStore { accept: true, ..Default::default() });
        let service =
            DistillService::new(Arc::new(NoBackend), store.clone(), Duration::from_secs(5));

        let mut state = delivered_state();
        state.final_deliverable = Some("x".repeat(600)); // over the compression threshold

        assert!(service.distill(&state).await.is_some());
        let upserts = store.upserts.lock().unwrap();
        assert!(upserts[0].1.starts_with("Query:"));
    }

    #[tokio::test]
    async fn custom_categorizer_replaces_keyword_matching() {
        fn always_networking(_query: &str, _solution: &str) -> Option<&'static str> {
            Some("networking")
        }

        let store = Arc::new(RecordingStore { accept: true, ..Default::default() });
        let service = DistillService::new(Arc::new(NoBackend), store.clone(), Duration::from_secs(5))
            .with_categorizer(always_networking);

        service.distill(&delivered_state()).await.unwrap();
        let upserts = store.upserts.lock().unwrap();
        assert_eq!(upserts[0].2["category"], json!("networking"));
    }

    #[tokio::test]
    async fn rejected_upsert_yields_none() {
        let store = Arc::new(RecordingStore { accept: false, ..Default::default() });
        let service = DistillService::new(Arc::new(NoBackend), store, Duration::from_secs(5));
        assert!(service.distill(&delivered_state()).await.is_none());
    }

    #[tokio::test]
    async fn undelivered_runs_are_skipped() {
        let store = Arc::new(RecordingStore { accept: true, ..Default::default() });
        let service =
            DistillService::new(Arc::new(NoBackend), store.clone(), Duration::from_secs(5));

        let state = RunState::new("q", 3); // no final_deliverable
        assert!(service.distill(&state).await.is_none());
        assert!(store.upserts.lock().unwrap().is_empty());
    }
}
