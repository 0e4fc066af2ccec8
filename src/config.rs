use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capability::CapabilityType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NexusConfig {
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Providers in registration order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    pub default_text_provider: Option<String>,
    pub default_code_provider: Option<String>,
    pub default_web_provider: Option<String>,
    pub default_vector_provider: Option<String>,
    /// Budget for each individual provider call
    pub call_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Factory key, e.g. `anthropic`, `ollama`, `memory_vector`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub default_model: Option<String>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            enabled: true,
            api_key: None,
            base_url: None,
            timeout_secs: None,
            default_model: None,
            max_tokens: None,
            options: HashMap::new(),
        }
    }

    pub fn timeout(&self, fallback_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(fallback_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub max_steps: usize,
    pub default_agent: String,
    pub default_model: String,
    /// Wall-clock budget for one agent execution
    pub execution_timeout_secs: Option<u64>,
    #[serde(default)]
    pub blocked_terms: Vec<String>,
    /// Requests allowed per user before the rate limit guardrail rejects
    pub requests_per_user: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub directory: PathBuf,
    pub hot_reload: bool,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub max_parallel_plugins: usize,
    pub dedup_threshold: f32,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        let mut anthropic = ProviderConfig::new("anthropic", "anthropic");
        anthropic.base_url = Some("https://api.anthropic.com/v1".to_string());
        anthropic.default_model = Some("claude-3-5-sonnet-20240620".to_string());
        anthropic.timeout_secs = Some(120);

        let mut openai = ProviderConfig::new("openai", "openai");
        openai.base_url = Some("https://api.openai.com/v1".to_string());
        openai.default_model = Some("gpt-4o".to_string());

        let mut ollama = ProviderConfig::new("ollama", "ollama");
        ollama.base_url = Some("http://localhost:11434/v1".to_string());
        ollama.default_model = Some("llama3".to_string());
        ollama.timeout_secs = Some(300);

        let mut browserless = ProviderConfig::new("browserless", "browserless");
        browserless.base_url = Some("https://chrome.browserless.io".to_string());

        Self {
            providers: vec![
                anthropic,
                openai,
                ollama,
                browserless,
                ProviderConfig::new("http_fetch", "http_fetch"),
                ProviderConfig::new("memory_vector", "memory_vector"),
                ProviderConfig::new("demo", "demo"),
            ],
            default_text_provider: None,
            default_code_provider: None,
            default_web_provider: None,
            default_vector_provider: None,
            call_timeout_secs: None,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            default_agent: "general_agent".to_string(),
            default_model: "gpt-4o".to_string(),
            execution_timeout_secs: None,
            blocked_terms: vec![
                "harmful instructions".to_string(),
                "illegal activity".to_string(),
                "violence".to_string(),
                "explicit content".to_string(),
            ],
            requests_per_user: 10,
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
            hot_reload: false,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            max_parallel_plugins: 3,
            dedup_threshold: 0.85,
        }
    }
}

impl CapabilityConfig {
    pub fn default_for(&self, capability: CapabilityType) -> Option<&str> {
        match capability {
            CapabilityType::TextGeneration => self.default_text_provider.as_deref(),
            CapabilityType::CodeGeneration => self.default_code_provider.as_deref(),
            CapabilityType::WebBrowsing => self.default_web_provider.as_deref(),
            CapabilityType::VectorStorage => self.default_vector_provider.as_deref(),
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

impl AgentsConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}

impl NexusConfig {
    /// Load the user config, writing the defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            let default_config = Self::default();
            default_config.save_to(&config_path)?;
            default_config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn config_file_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".config").join("nexus").join("config.toml"))
    }

    /// Fill missing API keys from the environment
    pub fn apply_env_overrides(&mut self) {
        for provider in &mut self.capability.providers {
            if provider.api_key.is_some() {
                continue;
            }
            let var = match provider.kind.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY",
                "openai" => "OPENAI_API_KEY",
                "browserless" => "BROWSERLESS_API_KEY",
                _ => continue,
            };
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    provider.api_key = Some(key);
                }
            }
        }
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.capability.providers.iter().find(|p| p.name == name)
    }
}
