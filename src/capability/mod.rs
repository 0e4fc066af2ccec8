use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod manager;
pub mod providers;
pub mod service;

pub use manager::CapabilityManager;
pub use service::CapabilityService;

/// Categories of functionality a provider can implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    TextGeneration,
    CodeGeneration,
    WebBrowsing,
    VectorStorage,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 4] = [
        CapabilityType::TextGeneration,
        CapabilityType::CodeGeneration,
        CapabilityType::WebBrowsing,
        CapabilityType::VectorStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::TextGeneration => "text_generation",
            CapabilityType::CodeGeneration => "code_generation",
            CapabilityType::WebBrowsing => "web_browsing",
            CapabilityType::VectorStorage => "vector_storage",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
    /// Prior conversation turns, oldest first
    #[serde(default)]
    pub context: Vec<Message>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl TextRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub prompt: String,
    pub language: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseRequest {
    pub url: String,
    #[serde(default = "default_true")]
    pub extract_text: bool,
    pub wait_for_selector: Option<String>,
    pub user_agent: Option<String>,
}

impl BrowseRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extract_text: true,
            wait_for_selector: None,
            user_agent: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorOperation {
    Upsert,
    Query,
    Get,
    Delete,
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRequest {
    pub operation: VectorOperation,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub vectors: Vec<Vec<f32>>,
    #[serde(default)]
    pub metadata: Vec<serde_json::Value>,
    pub query_vector: Option<Vec<f32>>,
    pub top_k: Option<usize>,
}

impl VectorRequest {
    pub fn new(operation: VectorOperation) -> Self {
        Self {
            operation,
            collection: None,
            ids: Vec::new(),
            vectors: Vec::new(),
            metadata: Vec::new(),
            query_vector: None,
            top_k: None,
        }
    }
}

/// A typed capability invocation. Each variant belongs to exactly one
/// [`CapabilityType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "snake_case")]
pub enum CapabilityRequest {
    Text(TextRequest),
    Code(CodeRequest),
    Browse(BrowseRequest),
    Vector(VectorRequest),
}

impl CapabilityRequest {
    pub fn capability(&self) -> CapabilityType {
        match self {
            CapabilityRequest::Text(_) => CapabilityType::TextGeneration,
            CapabilityRequest::Code(_) => CapabilityType::CodeGeneration,
            CapabilityRequest::Browse(_) => CapabilityType::WebBrowsing,
            CapabilityRequest::Vector(_) => CapabilityType::VectorStorage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityOutput {
    Text {
        text: String,
        model: String,
        usage: Option<TokenUsage>,
    },
    Code {
        code: String,
        language: String,
        model: String,
    },
    Page {
        url: String,
        title: String,
        content: String,
        status: u16,
    },
    Vector {
        operation: VectorOperation,
        ids: Vec<String>,
        matches: Vec<VectorMatch>,
        count: usize,
    },
}

/// Result of a routed capability call, stamped with the provider that answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub provider: String,
    #[serde(flatten)]
    pub output: CapabilityOutput,
}

impl CapabilityResponse {
    /// Primary textual payload of the response, if it has one
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            CapabilityOutput::Text { text, .. } => Some(text),
            CapabilityOutput::Code { code, .. } => Some(code),
            CapabilityOutput::Page { content, .. } => Some(content),
            CapabilityOutput::Vector { .. } => None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match &self.output {
            CapabilityOutput::Text { model, .. } | CapabilityOutput::Code { model, .. } => {
                Some(model)
            }
            _ => None,
        }
    }
}

/// Contract every backend adapter implements.
///
/// A provider declares the capabilities it supports up front; the manager
/// only routes matching requests to it. `initialize` may probe connectivity;
/// an error there disables the provider for the rest of the process.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Unique provider name
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[CapabilityType];

    fn supports(&self, capability: CapabilityType) -> bool {
        self.capabilities().contains(&capability)
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, request: CapabilityRequest) -> anyhow::Result<CapabilityOutput>;
}

/// Error types for provider adapters
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Provider {provider} does not handle {capability}")]
    Unsupported {
        provider: String,
        capability: CapabilityType,
    },
}

/// Routing failures surfaced by [`CapabilityManager`]
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("No provider available for {0}")]
    NoProviderAvailable(CapabilityType),

    #[error("All providers failed for {capability}: {last_error}")]
    AllProvidersFailed {
        capability: CapabilityType,
        last_error: String,
    },

    #[error("Provider {provider} failed: {source}")]
    ProviderFailed {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Provider {0} not registered")]
    UnknownProvider(String),

    #[error("Provider {provider} doesn't support {capability}")]
    UnsupportedCapability {
        provider: String,
        capability: CapabilityType,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout {
        provider: String,
        after: std::time::Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_capability_mapping() {
        assert_eq!(
            CapabilityRequest::Text(TextRequest::new("hi")).capability(),
            CapabilityType::TextGeneration
        );
        assert_eq!(
            CapabilityRequest::Browse(BrowseRequest::new("https://example.com")).capability(),
            CapabilityType::WebBrowsing
        );
        assert_eq!(
            CapabilityRequest::Vector(VectorRequest::new(VectorOperation::Count)).capability(),
            CapabilityType::VectorStorage
        );
    }

    #[test]
    fn test_response_serializes_provider_alongside_output() {
        let response = CapabilityResponse {
            provider: "B".to_string(),
            output: CapabilityOutput::Text {
                text: "ok".to_string(),
                model: "stub".to_string(),
                usage: None,
            },
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["provider"], "B");
        assert_eq!(json["text"], "ok");
        assert_eq!(json["kind"], "text");
        assert_eq!(response.text(), Some("ok"));
    }
}
