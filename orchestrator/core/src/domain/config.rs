// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Defines the YAML configuration schema for an OpsForge node, including:
// - LLM provider configuration (BYOLLM support)
// - Model tier aliases for provider independence
// - Semantic memory, live research and sandbox collaborator settings
// - Trace persistence/export and run budget settings
//
// API keys support "env:VAR_NAME" indirection resolved at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// LLM provider configurations
    #[serde(default)]
    pub llm_providers: Vec<LLMProviderConfig>,

    /// Retry/fallback strategy across providers
    #[serde(default)]
    pub llm_selection: LLMSelection,

    /// Model tier → model alias mapping
    #[serde(default)]
    pub tiers: TierAliases,

    /// Semantic memory store (vector similarity search)
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Live research tool
    #[serde(default)]
    pub research: ResearchConfig,

    /// Sandbox validation runtime
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Trace persistence and optional export backend
    #[serde(default)]
    pub trace: TraceConfig,

    /// Run budgets and timeouts
    #[serde(default)]
    pub run: RunSettings,
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMProviderConfig {
    /// Unique provider name (e.g., "anthropic", "openrouter")
    pub name: String,

    /// Provider type: "anthropic", "openai", "openai-compatible"
    #[serde(rename = "type")]
    pub provider_type: String,

    /// API endpoint URL (ignored by the anthropic adapter's default)
    #[serde(default)]
    pub endpoint: String,

    /// API key (supports "env:VAR_NAME" for environment variables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Whether this provider is active
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Available models on this provider
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model alias referenced by tier mappings (e.g., "fast", "smart")
    pub alias: String,

    /// Actual model identifier for the provider API
    pub model: String,

    /// Cost per 1,000 tokens (0.0 for local models)
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMSelection {
    /// Fallback provider if primary fails after all retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,

    /// Maximum retry attempts on failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for LLMSelection {
    fn default() -> Self {
        Self {
            fallback_provider: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Maps each routing tier to a model alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierAliases {
    #[serde(default = "default_triage_alias")]
    pub triage: String,
    #[serde(default = "default_engineer_alias")]
    pub engineer: String,
    #[serde(default = "default_critic_alias")]
    pub critic: String,
    #[serde(default = "default_reasoner_alias")]
    pub reasoner: String,
}

impl Default for TierAliases {
    fn default() -> Self {
        Self {
            triage: default_triage_alias(),
            engineer: default_engineer_alias(),
            critic: default_critic_alias(),
            reasoner: default_reasoner_alias(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Disable to run without semantic recall (lookups return nothing)
    #[serde(default)]
    pub enabled: bool,

    /// Vector index endpoint
    #[serde(default)]
    pub endpoint: String,

    /// API key (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Embeddings endpoint (OpenAI-compatible)
    #[serde(default = "default_embedding_endpoint")]
    pub embedding_endpoint: String,

    /// Embedding model identifier
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// API key for the embeddings endpoint (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_api_key: Option<String>,

    /// Minimum cosine similarity for a hit to be considered relevant
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            api_key: None,
            embedding_endpoint: default_embedding_endpoint(),
            embedding_model: default_embedding_model(),
            embedding_api_key: None,
            min_similarity: default_min_similarity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Disable to run without live web research
    #[serde(default)]
    pub enabled: bool,

    /// Chat-completions endpoint of the research backend
    #[serde(default = "default_research_endpoint")]
    pub endpoint: String,

    /// API key (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Research model identifier
    #[serde(default = "default_research_model")]
    pub model: String,

    /// Max tokens for the synthesized answer
    #[serde(default = "default_research_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_research_endpoint(),
            api_key: None,
            model: default_research_model(),
            max_tokens: default_research_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxIsolation {
    /// Disposable Docker containers running the canonical toolchains
    Docker,
    /// Local delimiter/pattern checks only
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Isolation backend, selected once at startup
    #[serde(default = "default_isolation")]
    pub isolation: SandboxIsolation,

    /// Path to Docker socket (None = auto-detect)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,

    /// Image for terraform checks
    #[serde(default = "default_terraform_image")]
    pub terraform_image: String,

    /// Image for PowerShell lint checks
    #[serde(default = "default_powershell_image")]
    pub powershell_image: String,

    /// Bound on each in-sandbox command
    #[serde(default = "default_sandbox_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: default_isolation(),
            docker_socket: None,
            terraform_image: default_terraform_image(),
            powershell_image: default_powershell_image(),
            timeout: default_sandbox_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Directory for local JSONL trace files (always written)
    #[serde(default = "default_trace_dir")]
    pub dir: PathBuf,

    /// Optional remote telemetry backend; None selects the no-op exporter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_endpoint: Option<String>,

    /// API key for the export backend (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_api_key: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { dir: default_trace_dir(), export_endpoint: None, export_api_key: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Default draft↔review budget (caller-overridable, hard ceiling 5)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Bound on every generation backend call
    #[serde(default = "default_generation_timeout", with = "humantime_serde")]
    pub generation_timeout: Duration,

    /// Bound on memory/research lookups
    #[serde(default = "default_tool_timeout", with = "humantime_serde")]
    pub tool_timeout: Duration,

    /// Compress lessons with a summarization call before storage; disabled
    /// falls back to the deterministic structured lesson
    #[serde(default = "default_true")]
    pub distill_compression: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            generation_timeout: default_generation_timeout(),
            tool_timeout: default_tool_timeout(),
            distill_compression: default_true(),
        }
    }
}

/// Resolve a configured secret, supporting "env:VAR_NAME" indirection.
pub fn resolve_secret(key: &Option<String>) -> anyhow::Result<String> {
    match key {
        Some(k) if k.starts_with("env:") => {
            let var_name = k.strip_prefix("env:").unwrap();
            std::env::var(var_name)
                .map_err(|_| anyhow::anyhow!("Environment variable not set: {}", var_name))
        }
        Some(k) => Ok(k.clone()),
        None => Ok(String::new()), // For local backends without auth
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    250
}

fn default_triage_alias() -> String {
    "triage".to_string()
}

fn default_engineer_alias() -> String {
    "engineer".to_string()
}

fn default_critic_alias() -> String {
    "critic".to_string()
}

fn default_reasoner_alias() -> String {
    "reasoner".to_string()
}

fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_min_similarity() -> f64 {
    0.7
}

fn default_research_endpoint() -> String {
    "https://api.perplexity.ai".to_string()
}

fn default_research_model() -> String {
    "sonar-pro".to_string()
}

fn default_research_max_tokens() -> u32 {
    1024
}

fn default_isolation() -> SandboxIsolation {
    SandboxIsolation::Docker
}

fn default_terraform_image() -> String {
    "hashicorp/terraform:1.9".to_string()
}

fn default_powershell_image() -> String {
    "mcr.microsoft.com/powershell:7.4-ubuntu-22.04".to_string()
}

fn default_sandbox_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("traces")
}

fn default_max_iterations() -> u32 {
    3
}

fn default_generation_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(30)
}
