// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Generation Backend Domain Interface (Anti-Corruption Layer)
//
// Defines the domain interface for generation backends. Prevents vendor
// lock-in by abstracting external LLM APIs; implementations live in
// infrastructure/llm/.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Model routing tiers. Each tier resolves to a provider/model pair via the
/// registry configuration; the orchestrator never names concrete models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Fast/cheap classification and summarization.
    Triage,
    /// Primary drafting backend.
    Engineer,
    /// Quality-gate review backend.
    Critic,
    /// Deeper-reasoning backend for complex troubleshooting routes.
    Reasoner,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Triage => "triage",
            ModelTier::Engineer => "engineer",
            ModelTier::Critic => "critic",
            ModelTier::Reasoner => "reasoner",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry in the ordered, role-tagged message sequence sent to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Options for a generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 = deterministic, 1.0 = creative)
    pub temperature: Option<f32>,

    /// Ask the backend for structured (JSON) output
    pub json_mode: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { max_tokens: Some(4096), temperature: Some(0.7), json_mode: false }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    /// Generated text
    pub text: String,

    /// Token usage stats
    pub usage: TokenUsage,

    /// Provider name (e.g. "anthropic", "openai")
    pub provider: String,

    /// Model used
    pub model: String,

    /// Dollar cost of the call, populated by the registry from per-model
    /// pricing config. Adapters leave this at 0.0.
    pub cost_usd: f64,

    /// Why generation stopped
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural completion (model decided to stop)
    Stop,

    /// Hit max_tokens limit
    Length,

    /// Blocked by content filter
    ContentFilter,
}

/// Errors that can occur during generation calls
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Per-vendor adapter interface. One instance per configured provider.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a completion from an ordered message sequence
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError>;

    /// Check if provider is healthy and accessible
    async fn health_check(&self) -> Result<(), LLMError>;
}

/// Tier-addressed generation facade the orchestration loop talks to.
/// The production implementation is the provider registry; tests script it.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        tier: ModelTier,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError>;
}
