use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fmt::Write;
use std::sync::Arc;

use crate::capability::{BrowseRequest, CapabilityOutput, CapabilityService, CodeRequest};

/// A named action an agent may call mid-execution
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object
    fn parameters(&self) -> Value;

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value>;
}

pub fn describe_tool(tool: &dyn Tool) -> Value {
    json!({
        "name": tool.name(),
        "description": tool.description(),
        "parameters": tool.parameters(),
    })
}

fn required_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .with_context(|| format!("Missing required argument: {}", key))
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {"type": "string", "description": "strftime format, default %Y-%m-%d %H:%M:%S UTC"}
            }
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let now = chrono::Utc::now();
        let format = arguments
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("%Y-%m-%d %H:%M:%S UTC");

        let mut content = String::new();
        write!(content, "{}", now.format(format))
            .map_err(|_| anyhow::anyhow!("Invalid time format: {}", format))?;

        Ok(json!({
            "content": content,
            "timestamp": now.to_rfc3339(),
        }))
    }
}

/// Fetches a page through the web-browsing capability
pub struct WebBrowseTool {
    capabilities: Arc<CapabilityService>,
    max_chars: usize,
}

impl WebBrowseTool {
    pub fn new(capabilities: Arc<CapabilityService>) -> Self {
        Self {
            capabilities,
            max_chars: 4000,
        }
    }
}

#[async_trait]
impl Tool for WebBrowseTool {
    fn name(&self) -> &str {
        "web_browse"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL"},
                "wait_for_selector": {"type": "string", "description": "CSS selector to wait for"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let url = required_str(arguments, "url")?;
        let mut request = BrowseRequest::new(url);
        request.wait_for_selector = arguments
            .get("wait_for_selector")
            .and_then(Value::as_str)
            .map(str::to_string);

        let response = self.capabilities.browse_url(request, None, true).await?;
        let (title, content) = match &response.output {
            CapabilityOutput::Page { title, content, .. } => (title.clone(), content.clone()),
            _ => (String::new(), response.text().unwrap_or_default().to_string()),
        };
        let truncated = content.chars().count() > self.max_chars;
        let content: String = content.chars().take(self.max_chars).collect();

        Ok(json!({
            "url": url,
            "title": title,
            "content": content,
            "truncated": truncated,
            "provider": response.provider,
        }))
    }
}

/// Generates source code through the code-generation capability
pub struct GenerateCodeTool {
    capabilities: Arc<CapabilityService>,
}

impl GenerateCodeTool {
    pub fn new(capabilities: Arc<CapabilityService>) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl Tool for GenerateCodeTool {
    fn name(&self) -> &str {
        "generate_code"
    }

    fn description(&self) -> &str {
        "Generate source code from a description"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "What the code should do"},
                "language": {"type": "string", "description": "Target language, default python"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let prompt = required_str(arguments, "prompt")?;
        let language = arguments
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("python");

        let response = self
            .capabilities
            .generate_code(
                CodeRequest {
                    prompt: prompt.to_string(),
                    language: language.to_string(),
                    model: None,
                },
                None,
                true,
            )
            .await?;

        Ok(json!({
            "content": response.text().unwrap_or_default(),
            "language": language,
            "provider": response.provider,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::manager::tests::StubProvider;
    use crate::capability::{CapabilityManager, CapabilityType};

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn service_with(provider: StubProvider) -> Arc<CapabilityService> {
        let mut manager = CapabilityManager::new();
        manager.register_provider(Arc::new(provider));
        Arc::new(CapabilityService::new(manager))
    }

    #[tokio::test]
    async fn test_current_time_formats() {
        let result = CurrentTimeTool
            .execute(&args(json!({"format": "%Y"})))
            .await
            .unwrap();
        let year = result["content"].as_str().unwrap();
        assert_eq!(year.len(), 4);
        assert!(year.parse::<i32>().unwrap() >= 2024);

        let default = CurrentTimeTool.execute(&Map::new()).await.unwrap();
        assert!(default["content"].as_str().unwrap().ends_with("UTC"));
    }

    #[tokio::test]
    async fn test_web_browse_truncates_and_requires_url() {
        let long_page = "x".repeat(5000);
        let tool = WebBrowseTool::new(service_with(
            StubProvider::ok("web", &long_page).with_capabilities(vec![CapabilityType::WebBrowsing]),
        ));

        let result = tool
            .execute(&args(json!({"url": "https://example.com"})))
            .await
            .unwrap();
        assert_eq!(result["content"].as_str().unwrap().len(), 4000);
        assert_eq!(result["truncated"], true);
        assert_eq!(result["provider"], "web");

        let err = tool.execute(&Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing required argument: url");
    }

    #[tokio::test]
    async fn test_generate_code_uses_capability() {
        let tool = GenerateCodeTool::new(service_with(
            StubProvider::ok("coder", "fn main() {}").with_capabilities(vec![CapabilityType::CodeGeneration]),
        ));

        let result = tool
            .execute(&args(json!({"prompt": "hello world", "language": "rust"})))
            .await
            .unwrap();
        assert_eq!(result["content"], "fn main() {}");
        assert_eq!(result["language"], "rust");
        assert_eq!(describe_tool(&tool)["name"], "generate_code");
    }
}
