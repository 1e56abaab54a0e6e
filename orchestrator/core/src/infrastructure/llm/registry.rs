// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// LLM Provider Registry - Tier Resolution and Provider Management
//
// Manages provider adapters and resolves model tiers to (provider, model)
// pairs via configured aliases. Implements retry with exponential backoff,
// an optional fallback provider, and per-call cost accounting from the
// per-model pricing config.

use crate::domain::config::{resolve_secret, LLMProviderConfig, ModelConfig, OrchestratorConfig};
use crate::domain::llm::{
    ChatMessage, GenerationBackend, GenerationOptions, GenerationResponse, LLMError, LLMProvider,
    ModelTier,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::anthropic::AnthropicAdapter;
use super::openai::OpenAIAdapter;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    alias_map: HashMap<String, (String, ModelConfig)>, // alias -> (provider_name, model_config)
    tier_map: HashMap<ModelTier, String>,              // tier -> alias
    fallback_provider: Option<String>,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl ProviderRegistry {
    /// Create provider registry from orchestrator configuration
    pub fn from_config(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let mut providers = HashMap::new();
        let mut alias_map = HashMap::new();

        info!("Initializing LLM provider registry");

        for provider_config in &config.llm_providers {
            if !provider_config.enabled {
                info!("Provider '{}' disabled, skipping", provider_config.name);
                continue;
            }

            match Self::create_provider(provider_config) {
                Ok(built) => {
                    for model_config in &provider_config.models {
                        debug!(
                            "Mapping alias '{}' -> {} ({})",
                            model_config.alias, model_config.model, provider_config.name
                        );
                        alias_map.insert(
                            model_config.alias.clone(),
                            (provider_config.name.clone(), model_config.clone()),
                        );
                    }
                    providers.extend(built);
                }
                Err(e) => {
                    warn!("Failed to initialize provider '{}': {}", provider_config.name, e);
                    // Continue with other providers
                }
            }
        }

        if providers.is_empty() {
            warn!("No LLM providers configured - generation will not be available");
        }

        let tier_map = HashMap::from([
            (ModelTier::Triage, config.tiers.triage.clone()),
            (ModelTier::Engineer, config.tiers.engineer.clone()),
            (ModelTier::Critic, config.tiers.critic.clone()),
            (ModelTier::Reasoner, config.tiers.reasoner.clone()),
        ]);

        Ok(Self {
            providers,
            alias_map,
            tier_map,
            fallback_provider: config.llm_selection.fallback_provider.clone(),
            max_retries: config.llm_selection.max_retries.max(1),
            retry_delay_ms: config.llm_selection.retry_delay_ms,
        })
    }

    /// Build the adapter instances for one provider entry. One adapter is
    /// created per model so each alias resolves to its own bound model; they
    /// all share the provider name key suffixed with the alias.
    fn create_provider(
        config: &LLMProviderConfig,
    ) -> anyhow::Result<HashMap<String, Arc<dyn LLMProvider>>> {
        let api_key = resolve_secret(&config.api_key)?;
        let mut adapters: HashMap<String, Arc<dyn LLMProvider>> = HashMap::new();

        for model_config in &config.models {
            let adapter: Arc<dyn LLMProvider> = match config.provider_type.as_str() {
                "anthropic" => {
                    let adapter = AnthropicAdapter::new(api_key.clone(), model_config.model.clone());
                    if config.endpoint.is_empty() {
                        Arc::new(adapter)
                    } else {
                        Arc::new(adapter.with_endpoint(config.endpoint.clone()))
                    }
                }
                "openai" | "openai-compatible" => Arc::new(OpenAIAdapter::new(
                    config.endpoint.clone(),
                    api_key.clone(),
                    model_config.model.clone(),
                )),
                _ => anyhow::bail!("Unsupported provider type: {}", config.provider_type),
            };
            adapters.insert(Self::adapter_key(&config.name, &model_config.alias), adapter);
        }

        Ok(adapters)
    }

    fn adapter_key(provider_name: &str, alias: &str) -> String {
        format!("{}/{}", provider_name, alias)
    }

    fn lookup(&self, alias: &str) -> Result<(&Arc<dyn LLMProvider>, &ModelConfig), LLMError> {
        let (provider_name, model_config) = self
            .alias_map
            .get(alias)
            .ok_or_else(|| LLMError::ModelNotFound(format!("Model alias '{}' not found", alias)))?;

        let provider = self
            .providers
            .get(&Self::adapter_key(provider_name, alias))
            .ok_or_else(|| LLMError::Provider(format!("Provider '{}' not found", provider_name)))?;

        Ok((provider, model_config))
    }

    /// Generate via a model alias, with retries and fallback
    async fn generate_alias(
        &self,
        alias: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let (provider, model_config) = self.lookup(alias)?;

        let mut last_error = None;

        for attempt in 0..self.max_retries {
            match provider.generate(messages, options).await {
                Ok(mut response) => {
                    response.cost_usd = f64::from(response.usage.total_tokens) / 1000.0
                        * model_config.cost_per_1k_tokens;
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        "Generation failed for alias '{}' (attempt {}/{}): {}",
                        alias,
                        attempt + 1,
                        self.max_retries,
                        e
                    );
                    last_error = Some(e);

                    // Try fallback provider on last attempt
                    if attempt == self.max_retries - 1 {
                        if let Some(fallback) = &self.fallback_provider {
                            if let Some(fallback_provider) =
                                self.providers.get(&Self::adapter_key(fallback, alias))
                            {
                                info!("Trying fallback provider: {}", fallback);
                                return fallback_provider.generate(messages, options).await;
                            }
                        }
                        break;
                    }

                    tokio::time::sleep(tokio::time::Duration::from_millis(
                        self.retry_delay_ms * 2_u64.pow(attempt),
                    ))
                    .await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LLMError::Provider("Unknown error".into())))
    }

    /// Check health of all providers
    pub async fn health_check_all(&self) -> HashMap<String, Result<(), LLMError>> {
        let mut results = HashMap::new();

        for (name, provider) in &self.providers {
            results.insert(name.clone(), provider.health_check().await);
        }

        results
    }

    /// Get list of available model aliases
    pub fn available_aliases(&self) -> Vec<String> {
        self.alias_map.keys().cloned().collect()
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.alias_map.contains_key(alias)
    }
}

#[async_trait]
impl GenerationBackend for ProviderRegistry {
    async fn generate(
        &self,
        tier: ModelTier,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let alias = self
            .tier_map
            .get(&tier)
            .ok_or_else(|| LLMError::ModelNotFound(format!("No alias mapped for tier '{}'", tier)))?;
        self.generate_alias(alias, messages, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{LLMSelection, TierAliases};

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            llm_providers: vec![LLMProviderConfig {
                name: "openrouter".to_string(),
                provider_type: "openai-compatible".to_string(),
                endpoint: "http://localhost:8080/v1".to_string(),
                api_key: None,
                enabled: true,
                models: vec![
                    ModelConfig {
                        alias: "fast".to_string(),
                        model: "small-model".to_string(),
                        cost_per_1k_tokens: 0.0005,
                    },
                    ModelConfig {
                        alias: "smart".to_string(),
                        model: "big-model".to_string(),
                        cost_per_1k_tokens: 0.01,
                    },
                ],
            }],
            llm_selection: LLMSelection::default(),
            tiers: TierAliases {
                triage: "fast".to_string(),
                engineer: "smart".to_string(),
                critic: "smart".to_string(),
                reasoner: "smart".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn registry_builds_aliases_from_config() {
        let registry = ProviderRegistry::from_config(&test_config()).unwrap();
        assert!(registry.has_alias("fast"));
        assert!(registry.has_alias("smart"));
        assert_eq!(registry.available_aliases().len(), 2);
    }

    #[test]
    fn disabled_providers_are_skipped() {
        let mut config = test_config();
        config.llm_providers[0].enabled = false;
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert!(!registry.has_alias("fast"));
    }

    #[test]
    fn unknown_provider_type_is_rejected_but_not_fatal() {
        let mut config = test_config();
        config.llm_providers[0].provider_type = "mystery".to_string();
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert!(registry.available_aliases().is_empty());
    }

    #[tokio::test]
    async fn unmapped_alias_yields_model_not_found() {
        let mut config = test_config();
        config.tiers.triage = "missing".to_string();
        let registry = ProviderRegistry::from_config(&config).unwrap();
        let err = registry
            .generate(ModelTier::Triage, &[ChatMessage::user("x")], &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::ModelNotFound(_)));
    }
}
