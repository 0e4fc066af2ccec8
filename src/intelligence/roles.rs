use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use super::aggregator::{Suggestion, SuggestionAggregator};
use crate::plugins::PluginLoader;
use crate::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantRole {
    Completion,
    Analysis,
    Documentation,
    Refactoring,
    Testing,
}

impl AssistantRole {
    pub const ALL: [AssistantRole; 5] = [
        AssistantRole::Completion,
        AssistantRole::Analysis,
        AssistantRole::Documentation,
        AssistantRole::Refactoring,
        AssistantRole::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssistantRole::Completion => "completion",
            AssistantRole::Analysis => "analysis",
            AssistantRole::Documentation => "documentation",
            AssistantRole::Refactoring => "refactoring",
            AssistantRole::Testing => "testing",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AssistantRole::Completion => "Code completion and inline suggestions",
            AssistantRole::Analysis => "Static analysis and issue detection",
            AssistantRole::Documentation => "Documentation generation",
            AssistantRole::Refactoring => "Refactoring proposals",
            AssistantRole::Testing => "Test generation",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for AssistantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One plugin's successful answer in a fan-out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcedResult {
    pub source: String,
    pub priority: u8,
    pub result: Value,
}

/// Role → plugins serving it, highest priority first
#[derive(Debug, Default, Clone)]
pub struct RoleRegistry {
    roles: HashMap<AssistantRole, Vec<(String, u8)>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every loaded plugin under the roles it declares
    pub async fn from_loader(loader: &PluginLoader) -> Self {
        let mut registry = Self::new();
        for (name, plugin) in loader.loaded_plugins().await {
            let priority = plugin.priority();
            for role in plugin.supported_roles() {
                registry.register(role, &name, priority);
            }
        }
        registry
    }

    /// Registering the same plugin twice replaces its priority
    pub fn register(&mut self, role: AssistantRole, plugin: &str, priority: u8) {
        let plugins = self.roles.entry(role).or_default();
        plugins.retain(|(name, _)| name != plugin);
        let index = plugins
            .iter()
            .position(|(_, existing)| *existing < priority)
            .unwrap_or(plugins.len());
        plugins.insert(index, (plugin.to_string(), priority));
    }

    pub fn plugins_for_role(&self, role: AssistantRole) -> Vec<String> {
        self.roles
            .get(&role)
            .map(|plugins| plugins.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    fn priority_of(&self, role: AssistantRole, plugin: &str) -> u8 {
        self.roles
            .get(&role)
            .and_then(|plugins| plugins.iter().find(|(name, _)| name == plugin))
            .map(|(_, priority)| *priority)
            .unwrap_or(5)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleResponse {
    pub status: Status,
    pub role: AssistantRole,
    pub results: Vec<SourcedResult>,
    pub suggestions: Vec<Suggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Run the top `max_parallel` plugins of a role concurrently.
///
/// Each plugin receives `request:<role>` with the context as inputs. Failed
/// plugins are logged and left out; the response is an error only when no
/// plugin succeeded.
pub async fn fan_out(
    loader: &PluginLoader,
    registry: &RoleRegistry,
    aggregator: &SuggestionAggregator,
    role: AssistantRole,
    context: &Map<String, Value>,
    max_parallel: usize,
) -> RoleResponse {
    let selected: Vec<String> = registry
        .plugins_for_role(role)
        .into_iter()
        .take(max_parallel.max(1))
        .collect();

    if selected.is_empty() {
        return RoleResponse {
            status: Status::Error,
            role,
            results: Vec::new(),
            suggestions: Vec::new(),
            message: Some(format!("No plugins available for role {}", role)),
        };
    }

    let request = format!("request:{}", role);
    let calls = selected.iter().map(|name| {
        let request = request.as_str();
        async move {
            let Some(plugin) = loader.plugin(name).await else {
                return (name, Err(anyhow::anyhow!("plugin is not loaded")));
            };
            (name, plugin.process(request, context).await)
        }
    });

    let mut results = Vec::new();
    for (name, outcome) in join_all(calls).await {
        match outcome {
            Ok(result) => results.push(SourcedResult {
                source: name.clone(),
                priority: registry.priority_of(role, name),
                result,
            }),
            Err(e) => tracing::warn!("Plugin {} failed for role {}: {}", name, role, e),
        }
    }

    if results.is_empty() {
        return RoleResponse {
            status: Status::Error,
            role,
            results,
            suggestions: Vec::new(),
            message: Some(format!("All plugins failed for role {}", role)),
        };
    }

    tracing::debug!("Role {} answered by {} plugin(s)", role, results.len());
    RoleResponse {
        status: Status::Success,
        role,
        suggestions: aggregator.aggregate(&results),
        results,
        message: None,
    }
}
