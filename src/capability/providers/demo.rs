use anyhow::Result;
use async_trait::async_trait;

use super::clean_code_output;
use crate::capability::{
    CapabilityOutput, CapabilityProvider, CapabilityRequest, CapabilityType, ProviderError,
    TokenUsage,
};

const CAPABILITIES: &[CapabilityType] =
    &[CapabilityType::TextGeneration, CapabilityType::CodeGeneration];

/// Offline responder; answers from a small keyword table so the assistant
/// works without any API key or network access.
pub struct DemoProvider {
    name: String,
    responses: Vec<(&'static str, &'static str)>,
}

impl DemoProvider {
    pub fn new() -> Self {
        Self::named("demo")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: vec![
                ("hello", "Hello! I'm Nexus running in demo mode. I work without any external API keys or services."),
                ("help", "I can help you with:\n- Routing requests to language models, browsers and vector stores\n- Running agents with tools\n- Loading plugins\n\nTo use real AI models, configure Anthropic, OpenAI or Ollama."),
                ("setup", "To set up real providers:\n\n1. Anthropic: set ANTHROPIC_API_KEY\n2. OpenAI: set OPENAI_API_KEY\n3. Ollama: install it and run `ollama pull llama3`\n\nThen restart Nexus."),
                ("plugin", "Plugins live in sub-directories of the plugin directory, each with a manifest.json naming its class and dependencies."),
            ],
        }
    }

    fn find_response(&self, input: &str) -> String {
        let input_lower = input.to_lowercase();

        for (keyword, response) in &self.responses {
            if input_lower.contains(keyword) {
                return response.to_string();
            }
        }

        format!(
            "I'm running in demo mode with limited capabilities. Your message: \"{}\"\n\n\
            For full AI capabilities, please configure a real provider (Anthropic, OpenAI or Ollama).",
            input
        )
    }
}

impl Default for DemoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityProvider for DemoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[CapabilityType] {
        CAPABILITIES
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput> {
        match request {
            CapabilityRequest::Text(text) => {
                let response = self.find_response(&text.prompt);
                let prompt_tokens = text.prompt.len() as u32 / 4;
                let completion_tokens = response.len() as u32 / 4;

                Ok(CapabilityOutput::Text {
                    text: response,
                    model: "demo-assistant".to_string(),
                    usage: Some(TokenUsage {
                        prompt_tokens,
                        completion_tokens,
                        total_tokens: prompt_tokens + completion_tokens,
                    }),
                })
            }
            CapabilityRequest::Code(code) => {
                let comment = match code.language.to_lowercase().as_str() {
                    "python" | "ruby" | "bash" | "sh" => "#",
                    "sql" | "lua" => "--",
                    _ => "//",
                };
                let raw = format!(
                    "```{}\n{} demo mode: no code model configured\n{} task: {}\n```",
                    code.language, comment, comment, code.prompt
                );
                Ok(CapabilityOutput::Code {
                    code: clean_code_output(&raw, &code.language),
                    language: code.language,
                    model: "demo-assistant".to_string(),
                })
            }
            other => Err(ProviderError::Unsupported {
                provider: self.name.clone(),
                capability: other.capability(),
            }
            .into()),
        }
    }
}
