use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{clean_code_output, code_as_text_request, http_client};
use crate::capability::{
    CapabilityOutput, CapabilityProvider, CapabilityRequest, CapabilityType, MessageRole,
    ProviderError, TextRequest, TokenUsage,
};
use crate::config::ProviderConfig;

const CAPABILITIES: &[CapabilityType] =
    &[CapabilityType::TextGeneration, CapabilityType::CodeGeneration];

/// Chat-completions provider for OpenAI and servers speaking the same
/// protocol (Ollama, LM Studio, llama.cpp, vLLM)
pub struct OpenAICompatibleProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    requires_key: bool,
}

// OpenAI API structures
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<Model>,
}

#[derive(Debug, Deserialize)]
struct Model {
    id: String,
}

impl OpenAICompatibleProvider {
    /// Generic local server; no API key required
    pub fn new(config: ProviderConfig) -> Result<Self> {
        // Longer timeout for local models
        let client = http_client(&config, 300)?;
        Ok(Self {
            config,
            client,
            requires_key: false,
        })
    }

    pub fn openai(mut config: ProviderConfig) -> Result<Self> {
        config
            .base_url
            .get_or_insert_with(|| "https://api.openai.com/v1".to_string());
        config.default_model.get_or_insert_with(|| "gpt-4o".to_string());
        let client = http_client(&config, 120)?;
        Ok(Self {
            config,
            client,
            requires_key: true,
        })
    }

    pub fn ollama(mut config: ProviderConfig) -> Result<Self> {
        config
            .base_url
            .get_or_insert_with(|| "http://localhost:11434/v1".to_string());
        Self::new(config)
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434/v1")
            .trim_end_matches('/')
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url());

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context("Failed to list models")?;

        if !response.status().is_success() {
            return Err(ProviderError::Api(format!("Failed to list models: {}", response.status())).into());
        }

        let models_response: ModelsResponse = response.json().await?;
        Ok(models_response.data.into_iter().map(|m| m.id).collect())
    }

    fn build_request(&self, request: &TextRequest) -> Result<ChatCompletionRequest> {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| {
                ProviderError::InvalidConfig(format!("{}: no model specified", self.config.name))
            })?;

        let mut messages = Vec::with_capacity(request.context.len() + 2);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.context.iter().map(|m| ChatMessage {
            role: match m.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            }
            .to_string(),
            content: m.content.clone(),
        }));
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        Ok(ChatCompletionRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens.or(self.config.max_tokens),
            stream: false,
        })
    }

    async fn complete(&self, request: &TextRequest) -> Result<(String, String, Option<TokenUsage>)> {
        let url = format!("{}/chat/completions", self.base_url());
        let api_request = self.build_request(request)?;
        let requested_model = api_request.model.clone();

        let response = self
            .authorize(self.client.post(&url))
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))
            .with_context(|| format!("Failed to send request to {}", self.config.name))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{} {}: {}", self.config.name, status, error_text)).into());
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let usage = api_response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok((content, api_response.model.unwrap_or(requested_model), usage))
    }
}

#[async_trait]
impl CapabilityProvider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[CapabilityType] {
        CAPABILITIES
    }

    async fn initialize(&self) -> Result<()> {
        if self.requires_key {
            if self.config.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(ProviderError::MissingApiKey.into());
            }
            return Ok(());
        }

        // Local servers: make sure something is listening
        let models = self.list_models().await?;
        tracing::debug!("{} serves {} models", self.config.name, models.len());
        Ok(())
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput> {
        match request {
            CapabilityRequest::Text(text) => {
                let (text, model, usage) = self.complete(&text).await?;
                Ok(CapabilityOutput::Text { text, model, usage })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Message;

    #[test]
    fn test_openai_defaults() {
        let provider = OpenAICompatibleProvider::openai(ProviderConfig::new("openai", "openai")).unwrap();
        assert_eq!(provider.base_url(), "https://api.openai.com/v1");

        let api_request = provider.build_request(&TextRequest::new("hi")).unwrap();
        assert_eq!(api_request.model, "gpt-4o");
        assert_eq!(api_request.messages.len(), 1);
    }

    #[test]
    fn test_build_request_orders_messages() {
        let mut config = ProviderConfig::new("local", "ollama");
        config.default_model = Some("llama3".to_string());
        let provider = OpenAICompatibleProvider::ollama(config).unwrap();

        let mut request = TextRequest::new("question");
        request.system_prompt = Some("sys".to_string());
        request.context = vec![Message::user("earlier"), Message::tool("42")];

        let api_request = provider.build_request(&request).unwrap();
        let roles: Vec<&str> = api_request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "tool", "user"]);
    }

    #[test]
    fn test_missing_model_is_config_error() {
        let provider = OpenAICompatibleProvider::new(ProviderConfig::new("local", "openai_compatible")).unwrap();
        assert!(provider.build_request(&TextRequest::new("hi")).is_err());
    }

    #[tokio::test]
    async fn test_openai_initialize_requires_key() {
        let provider = OpenAICompatibleProvider::openai(ProviderConfig::new("openai", "openai")).unwrap();
        assert!(provider.initialize().await.is_err());
    }
}
