use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CapabilityProvider, CodeRequest, TextRequest};
use crate::config::ProviderConfig;

pub mod anthropic;
pub mod browserless;
pub mod demo;
pub mod html;
pub mod http_fetch;
pub mod memory_vector;
pub mod openai_compatible;

pub use anthropic::AnthropicProvider;
pub use browserless::BrowserlessProvider;
pub use demo::DemoProvider;
pub use http_fetch::HttpFetchProvider;
pub use memory_vector::MemoryVectorProvider;
pub use openai_compatible::OpenAICompatibleProvider;

/// Constructor for a provider from its config entry
pub type ProviderFactory = fn(&ProviderConfig) -> Result<Arc<dyn CapabilityProvider>>;

/// Maps a provider `type` string to its constructor
pub struct ProviderFactoryRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderFactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every provider shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("anthropic", |config| {
            Ok(Arc::new(AnthropicProvider::new(config.clone())?))
        });
        registry.register("openai", |config| {
            Ok(Arc::new(OpenAICompatibleProvider::openai(config.clone())?))
        });
        registry.register("ollama", |config| {
            Ok(Arc::new(OpenAICompatibleProvider::ollama(config.clone())?))
        });
        registry.register("openai_compatible", |config| {
            Ok(Arc::new(OpenAICompatibleProvider::new(config.clone())?))
        });
        registry.register("browserless", |config| {
            Ok(Arc::new(BrowserlessProvider::new(config.clone())?))
        });
        registry.register("http_fetch", |config| {
            Ok(Arc::new(HttpFetchProvider::new(config.clone())?))
        });
        registry.register("memory_vector", |config| {
            Ok(Arc::new(MemoryVectorProvider::new(config.name.clone())))
        });
        registry.register("demo", |config| Ok(Arc::new(DemoProvider::named(config.name.clone()))));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn CapabilityProvider>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            super::ProviderError::InvalidConfig(format!("unknown provider type: {}", config.kind))
        })?;
        factory(config)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for ProviderFactoryRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub(crate) fn http_client(config: &ProviderConfig, default_timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout(default_timeout_secs))
        .build()?;
    Ok(client)
}

/// Accepts only absolute http(s) URLs with a host
pub(crate) fn parse_web_url(url: &str) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| super::ProviderError::InvalidConfig(format!("Invalid URL {}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(super::ProviderError::InvalidConfig(format!("Invalid URL: {}", url)).into()),
    }
}

/// Rewrites a code request as a low-temperature text request asking for raw code
pub(crate) fn code_as_text_request(request: &CodeRequest) -> TextRequest {
    let language = &request.language;
    TextRequest {
        prompt: format!("Write {} code for the following task:\n\n{}", language, request.prompt),
        context: Vec::new(),
        model: request.model.clone(),
        temperature: Some(0.2),
        max_tokens: None,
        system_prompt: Some(format!(
            "You are an expert {language} programmer. Generate clean, efficient {language} code. \
             Respond ONLY with the raw code, without explanations or markdown formatting like ```."
        )),
    }
}

/// Strips a surrounding markdown fence and a leading language hint line
pub fn clean_code_output(raw: &str, language: &str) -> String {
    let code = raw.trim();
    if !(code.len() >= 6 && code.starts_with("```") && code.ends_with("```")) {
        return code.to_string();
    }

    let inner = code[3..code.len() - 3].trim();
    match inner.split_once('\n') {
        Some((first, rest)) if first.trim().eq_ignore_ascii_case(language) => {
            rest.trim().to_string()
        }
        _ => inner.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityType;

    #[test]
    fn test_clean_code_output_strips_fence_and_hint() {
        let raw = "```python\nprint('hi')\n```";
        assert_eq!(clean_code_output(raw, "python"), "print('hi')");
        assert_eq!(clean_code_output(raw, "Python"), "print('hi')");
    }

    #[test]
    fn test_clean_code_output_keeps_unfenced_code() {
        assert_eq!(clean_code_output("  x = 1\n", "python"), "x = 1");
        // Hint line for another language is kept
        assert_eq!(
            clean_code_output("```rust\nfn main() {}\n```", "python"),
            "rust\nfn main() {}"
        );
    }

    #[test]
    fn test_parse_web_url() {
        assert!(parse_web_url("https://example.com/a?b=c").is_ok());
        assert!(parse_web_url("ftp://example.com").is_err());
        assert!(parse_web_url("not a url").is_err());
    }

    #[test]
    fn test_factory_builds_by_type() {
        let registry = ProviderFactoryRegistry::with_builtins();
        let provider = registry
            .create(&ProviderConfig::new("offline", "demo"))
            .unwrap();
        assert_eq!(provider.name(), "offline");
        assert!(provider.supports(CapabilityType::TextGeneration));

        let vector = registry
            .create(&ProviderConfig::new("vectors", "memory_vector"))
            .unwrap();
        assert!(vector.supports(CapabilityType::VectorStorage));
    }

    #[test]
    fn test_factory_rejects_unknown_type() {
        let registry = ProviderFactoryRegistry::with_builtins();
        let err = registry
            .create(&ProviderConfig::new("x", "carrier_pigeon"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("carrier_pigeon"));
        assert!(registry.kinds().contains(&"ollama"));
    }
}
