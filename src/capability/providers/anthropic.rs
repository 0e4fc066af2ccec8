use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{clean_code_output, code_as_text_request, http_client};
use crate::capability::{
    CapabilityOutput, CapabilityProvider, CapabilityRequest, CapabilityType, MessageRole,
    ProviderError, TextRequest, TokenUsage,
};
use crate::config::ProviderConfig;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";
const API_VERSION: &str = "2023-06-01";

const CAPABILITIES: &[CapabilityType] =
    &[CapabilityType::TextGeneration, CapabilityType::CodeGeneration];

// Anthropic API structures
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

pub struct AnthropicProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = http_client(&config, 120)?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }

    fn build_request(&self, request: &TextRequest) -> AnthropicRequest {
        let mut system = request.system_prompt.clone();
        let mut messages = Vec::with_capacity(request.context.len() + 1);

        for msg in &request.context {
            match msg.role {
                MessageRole::System => system = Some(msg.content.clone()),
                MessageRole::User => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: msg.content.clone(),
                }),
                MessageRole::Assistant => messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: msg.content.clone(),
                }),
                // No tool role in the Messages API
                MessageRole::Tool => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: format!("Tool result: {}", msg.content),
                }),
            }
        }
        messages.push(AnthropicMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        AnthropicRequest {
            model: request
                .model
                .clone()
                .or_else(|| self.config.default_model.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            messages,
            max_tokens: request
                .max_tokens
                .or(self.config.max_tokens)
                .unwrap_or(4096),
            temperature: request.temperature,
            system,
        }
    }

    async fn complete(&self, request: &TextRequest) -> Result<(String, String, TokenUsage)> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or(ProviderError::MissingApiKey)?;

        let url = format!("{}/messages", self.base_url());
        let api_request = self.build_request(request);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))
            .context("Failed to send request to Anthropic")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("Anthropic {}: {}", status, error_text)).into());
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        let content = api_response
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage {
            prompt_tokens: api_response.usage.input_tokens,
            completion_tokens: api_response.usage.output_tokens,
            total_tokens: api_response.usage.input_tokens + api_response.usage.output_tokens,
        };

        Ok((content, api_response.model, usage))
    }
}

#[async_trait]
impl CapabilityProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[CapabilityType] {
        CAPABILITIES
    }

    async fn initialize(&self) -> Result<()> {
        if self.config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ProviderError::MissingApiKey.into());
        }
        Ok(())
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput> {
        match request {
            CapabilityRequest::Text(text) => {
                let (text, model, usage) = self.complete(&text).await?;
                Ok(CapabilityOutput::Text {
                    text,
                    model,
                    usage: Some(usage),
                })
            }
            CapabilityRequest::Code(code) => {
                let (raw, model, _) = self.complete(&code_as_text_request(&code)).await?;
                Ok(CapabilityOutput::Code {
                    code: clean_code_output(&raw, &code.language),
                    language: code.language,
                    model,
                })
            }
            other => Err(ProviderError::Unsupported {
                provider: self.config.name.clone(),
                capability: other.capability(),
            }
            .into()),
        }
    }
}
