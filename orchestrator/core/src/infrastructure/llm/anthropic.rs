// Anthropic LLM Provider Adapter
//
// Anti-Corruption Layer for the Anthropic Messages API

use crate::domain::llm::{
    ChatMessage, FinishReason, GenerationOptions, GenerationResponse, LLMError, LLMProvider, Role,
    TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            model,
        }
    }

    /// Point the adapter at a non-default endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Split the domain message sequence into the Messages API shape:
    /// system turns go into the top-level `system` field, the rest keep
    /// their order.
    fn build_request(&self, messages: &[ChatMessage], options: &GenerationOptions) -> AnthropicRequest {
        let mut system_parts = Vec::new();
        let mut turns = Vec::new();

        for message in messages {
            match message.role {
                Role::System => system_parts.push(message.content.clone()),
                Role::User => turns.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: message.content.clone(),
                }),
                Role::Assistant => turns.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: message.content.clone(),
                }),
            }
        }

        // The Messages API has no native JSON response mode; prefill an
        // opening brace and re-attach it when parsing the response.
        if options.json_mode {
            turns.push(AnthropicMessage { role: "assistant".to_string(), content: "{".to_string() });
        }

        AnthropicRequest {
            model: self.model.clone(),
            messages: turns,
            max_tokens: options.max_tokens.unwrap_or(4096),
            temperature: options.temperature,
            system: if system_parts.is_empty() { None } else { Some(system_parts.join("\n\n")) },
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicAdapter {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let request = self.build_request(messages, options);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.endpoint.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            return Err(if status == 401 || status == 403 {
                LLMError::Authentication(error_text)
            } else if status == 429 {
                LLMError::RateLimit
            } else if status == 404 {
                LLMError::ModelNotFound(self.model.clone())
            } else {
                LLMError::Provider(format!("HTTP {}: {}", status, error_text))
            });
        }

        let anthropic_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("Failed to parse response: {}", e)))?;

        let mut text = anthropic_response
            .content
            .first()
            .map(|c| c.text.clone())
            .unwrap_or_default();
        if options.json_mode {
            text = format!("{{{}", text.trim_start());
        }

        Ok(GenerationResponse {
            text,
            usage: TokenUsage {
                prompt_tokens: anthropic_response.usage.input_tokens,
                completion_tokens: anthropic_response.usage.output_tokens,
                total_tokens: anthropic_response.usage.input_tokens
                    + anthropic_response.usage.output_tokens,
            },
            provider: "anthropic".to_string(),
            model: self.model.clone(),
            cost_usd: 0.0,
            finish_reason: match anthropic_response.stop_reason.as_deref() {
                Some("max_tokens") => FinishReason::Length,
                _ => FinishReason::Stop,
            },
        })
    }

    async fn health_check(&self) -> Result<(), LLMError> {
        // Anthropic has no models-list endpoint; a GET against /v1/messages
        // returning 404/405 still proves the key is accepted.
        let response = self
            .client
            .get(format!("{}/v1/messages", self.endpoint.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if response.status().is_success() || response.status() == 404 || response.status() == 405 {
            Ok(())
        } else if response.status() == 401 || response.status() == 403 {
            Err(LLMError::Authentication("Invalid API key".into()))
        } else {
            Err(LLMError::Network(format!("HTTP {}", response.status())))
        }
    }
}
