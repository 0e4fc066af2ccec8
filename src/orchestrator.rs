use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::agents::AgentService;
use crate::capability::{CapabilityService, TextRequest};
use crate::config::AssistantConfig;
use crate::intelligence::roles::{fan_out, AssistantRole, RoleRegistry, RoleResponse};
use crate::intelligence::SuggestionAggregator;
use crate::plugins::PluginLoader;
use crate::Status;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Force the agent path
    pub agentic: bool,
    /// Run this agent instead of routing
    pub agent: Option<String>,
    /// Preferred text-generation provider
    pub provider: Option<String>,
    pub plugin_inputs: Map<String, Value>,
    /// Passed to agents as execution context
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Plugin,
    Agent,
    Text,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResponse {
    pub status: Status,
    pub route: Route,
    pub text: String,
    pub details: Value,
}

/// Entry point for user requests: picks the plugin, agent or plain text
/// generation path and always answers with a response object.
pub struct Orchestrator {
    capabilities: Arc<CapabilityService>,
    agents: Arc<AgentService>,
    plugins: Arc<PluginLoader>,
    aggregator: SuggestionAggregator,
    max_parallel_plugins: usize,
}

impl Orchestrator {
    pub fn new(
        capabilities: Arc<CapabilityService>,
        agents: Arc<AgentService>,
        plugins: Arc<PluginLoader>,
        assistant: &AssistantConfig,
    ) -> Self {
        Self {
            capabilities,
            agents,
            plugins,
            aggregator: SuggestionAggregator::new(assistant.dedup_threshold),
            max_parallel_plugins: assistant.max_parallel_plugins,
        }
    }

    pub fn capabilities(&self) -> &CapabilityService {
        &self.capabilities
    }

    pub fn agents(&self) -> &AgentService {
        &self.agents
    }

    pub fn plugins(&self) -> &PluginLoader {
        &self.plugins
    }

    /// Loaded plugin named by `use X`, `using X`, `with X` or `X plugin`.
    /// Longer names win over names they contain.
    pub async fn detect_plugin(&self, request: &str) -> Option<String> {
        let mut names: Vec<String> = self
            .plugins
            .loaded_plugins()
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));

        names.into_iter().find(|name| {
            let escaped = regex::escape(name);
            let pattern = format!(
                r"(?i)\b(?:use|using|with)\s+{0}\b|\b{0}\s+plugin\b",
                escaped
            );
            Regex::new(&pattern)
                .map(|re| re.is_match(request))
                .unwrap_or(false)
        })
    }

    pub async fn process_request(&self, request: &str, options: &RequestOptions) -> OrchestratorResponse {
        if let Some(plugin) = self.detect_plugin(request).await {
            tracing::info!("Routing request to plugin {}", plugin);
            let response = self
                .plugins
                .execute_plugin(&plugin, request, &options.plugin_inputs)
                .await;
            return OrchestratorResponse {
                status: response.status,
                route: Route::Plugin,
                text: response
                    .text()
                    .or_else(|| response.message.clone())
                    .unwrap_or_default(),
                details: serde_json::to_value(&response).unwrap_or(Value::Null),
            };
        }

        if options.agentic || options.agent.is_some() {
            tracing::info!("Routing request to the agent service");
            let response = self
                .agents
                .process(request, options.agent.as_deref(), &options.context)
                .await;
            return OrchestratorResponse {
                status: response.status,
                route: Route::Agent,
                text: response.text.clone(),
                details: serde_json::to_value(&response).unwrap_or(Value::Null),
            };
        }

        tracing::debug!("Routing request to text generation");
        match self
            .capabilities
            .generate_text(TextRequest::new(request), options.provider.as_deref(), true)
            .await
        {
            Ok(response) => OrchestratorResponse {
                status: Status::Success,
                route: Route::Text,
                text: response.text().unwrap_or_default().to_string(),
                details: serde_json::to_value(&response).unwrap_or(Value::Null),
            },
            Err(e) => {
                tracing::error!("Text generation failed: {}", e);
                OrchestratorResponse {
                    status: Status::Error,
                    route: Route::Text,
                    text: format!("Error generating response: {}", e),
                    details: Value::Null,
                }
            }
        }
    }

    /// Fan a role request out to the plugins currently serving that role
    pub async fn process_role_request(&self, role: AssistantRole, context: &Map<String, Value>) -> RoleResponse {
        let registry = RoleRegistry::from_loader(&self.plugins).await;
        fan_out(
            &self.plugins,
            &registry,
            &self.aggregator,
            role,
            context,
            self.max_parallel_plugins,
        )
        .await
    }
}
