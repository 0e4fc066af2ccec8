use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::agent::Agent;
use super::guardrails::{ContentFilterGuardrail, Guardrail, RateLimitGuardrail};
use super::llm::LanguageModel;
use super::tools::{describe_tool, CurrentTimeTool, GenerateCodeTool, Tool, WebBrowseTool};
use crate::capability::{CapabilityService, Message};
use crate::config::AgentsConfig;
use crate::Status;

pub const NO_CONTENT_MESSAGE: &str = "Agent execution finished, but no content was returned.";

const GENERAL_AGENT_INSTRUCTIONS: &str =
    "You are a helpful assistant that can answer general questions and use tools when they help.";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentServiceResponse {
    pub status: Status,
    pub text: String,
    pub agent: String,
    pub details: Value,
    pub execution_id: Option<String>,
}

/// Registry of agents, tools and guardrails, and the router that picks an
/// agent for a request
pub struct AgentService {
    config: AgentsConfig,
    llm: Arc<dyn LanguageModel>,
    agents: Vec<Arc<Agent>>,
    tools: Vec<Arc<dyn Tool>>,
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl AgentService {
    pub fn new(config: AgentsConfig, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            config,
            llm,
            agents: Vec::new(),
            tools: Vec::new(),
            guardrails: Vec::new(),
        }
    }

    /// Built-in tools and guardrails plus the default agent using all of them
    pub fn with_defaults(
        config: AgentsConfig,
        llm: Arc<dyn LanguageModel>,
        capabilities: Arc<CapabilityService>,
    ) -> Self {
        let mut service = Self::new(config, llm);

        service.register_tool(Arc::new(CurrentTimeTool));
        service.register_tool(Arc::new(WebBrowseTool::new(capabilities.clone())));
        service.register_tool(Arc::new(GenerateCodeTool::new(capabilities)));

        service.register_guardrail(Arc::new(ContentFilterGuardrail::new(
            &service.config.blocked_terms,
        )));
        service.register_guardrail(Arc::new(RateLimitGuardrail::new(HashMap::from([(
            "user_id".to_string(),
            service.config.requests_per_user,
        )]))));

        let default_agent = service.config.default_agent.clone();
        service.create_agent(
            &default_agent,
            None,
            GENERAL_AGENT_INSTRUCTIONS,
            &["current_time", "web_browse", "generate_code"],
            &["content_filter", "rate_limit"],
        );
        service
    }

    /// Returns false (and logs) when the tool has no name
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> bool {
        if tool.name().trim().is_empty() {
            tracing::warn!("Refusing to register a tool without a name");
            return false;
        }
        self.tools.retain(|t| t.name() != tool.name());
        tracing::info!("Registered tool {}", tool.name());
        self.tools.push(tool);
        true
    }

    pub fn register_guardrail(&mut self, guardrail: Arc<dyn Guardrail>) -> bool {
        if guardrail.name().trim().is_empty() {
            tracing::warn!("Refusing to register a guardrail without a name");
            return false;
        }
        self.guardrails.retain(|g| g.name() != guardrail.name());
        tracing::info!("Registered guardrail {}", guardrail.name());
        self.guardrails.push(guardrail);
        true
    }

    /// Create and register an agent. An existing agent with the same name is
    /// returned unchanged.
    pub fn create_agent(
        &mut self,
        name: &str,
        model: Option<&str>,
        instructions: &str,
        tool_names: &[&str],
        guardrail_names: &[&str],
    ) -> Arc<Agent> {
        if let Some(existing) = self.get_agent(name) {
            tracing::info!("Agent {} already exists", name);
            return existing;
        }

        let mut tools = Vec::new();
        for tool_name in tool_names {
            match self.tools.iter().find(|t| t.name() == *tool_name) {
                Some(tool) => tools.push(tool.clone()),
                None => tracing::warn!("Unknown tool {} for agent {}", tool_name, name),
            }
        }
        let mut guardrails = Vec::new();
        for guardrail_name in guardrail_names {
            match self.guardrails.iter().find(|g| g.name() == *guardrail_name) {
                Some(guardrail) => guardrails.push(guardrail.clone()),
                None => tracing::warn!("Unknown guardrail {} for agent {}", guardrail_name, name),
            }
        }

        let agent = Arc::new(
            Agent::new(
                name,
                model.unwrap_or(self.config.default_model.as_str()),
                instructions,
                self.llm.clone(),
            )
            .with_tools(tools)
            .with_guardrails(guardrails)
            .with_max_steps(self.config.max_steps)
            .with_timeout(self.config.execution_timeout()),
        );
        tracing::info!("Created agent {} with model {}", name, agent.model());
        self.agents.push(agent.clone());
        agent
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.name() == name).cloned()
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    pub fn list_agents(&self) -> Vec<Value> {
        self.agents
            .iter()
            .map(|agent| {
                json!({
                    "name": agent.name(),
                    "model": agent.model(),
                    "instructions": agent.instructions(),
                    "tools": agent.tool_names(),
                    "guardrails": agent.guardrail_names(),
                })
            })
            .collect()
    }

    pub fn list_tools(&self) -> Vec<Value> {
        self.tools.iter().map(|t| describe_tool(t.as_ref())).collect()
    }

    pub fn list_guardrails(&self) -> Vec<Value> {
        self.guardrails
            .iter()
            .map(|g| {
                json!({
                    "name": g.name(),
                    "description": g.description(),
                    "stages": g.stages(),
                })
            })
            .collect()
    }

    /// Ask the model which agent fits the request. Anything that does not
    /// name a registered agent falls back to the default agent.
    pub async fn route(&self, request: &str) -> String {
        let fallback = || self.config.default_agent.clone();
        if self.agents.is_empty() {
            tracing::info!("No agents registered, routing to {}", self.config.default_agent);
            return fallback();
        }

        let catalog: Vec<String> = self
            .agents
            .iter()
            .map(|a| format!("- {}: {}", a.name(), a.instructions()))
            .collect();
        let prompt = vec![
            Message::system(format!(
                "Choose the agent best suited to the user's request. \
                 Answer with exactly one agent name and nothing else.\n\nAgents:\n{}",
                catalog.join("\n")
            )),
            Message::user(request),
        ];

        let reply = match self.llm.complete(&prompt, None).await {
            Ok(reply) => reply.content,
            Err(e) => {
                tracing::warn!("Agent routing failed, using {}: {}", self.config.default_agent, e);
                return fallback();
            }
        };

        match self.match_agent_name(&reply) {
            Some(name) => {
                tracing::debug!("Routed request to agent {}", name);
                name
            }
            None => {
                tracing::info!(
                    "Routing answer {:?} names no agent, using {}",
                    reply.trim(),
                    self.config.default_agent
                );
                fallback()
            }
        }
    }

    fn match_agent_name(&self, reply: &str) -> Option<String> {
        let cleaned = reply
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .trim();
        if let Some(agent) = self.agents.iter().find(|a| a.name().eq_ignore_ascii_case(cleaned)) {
            return Some(agent.name().to_string());
        }

        // Accept prose only when it mentions exactly one agent
        let lower = reply.to_lowercase();
        let mentioned: Vec<&Arc<Agent>> = self
            .agents
            .iter()
            .filter(|a| lower.contains(&a.name().to_lowercase()))
            .collect();
        match mentioned.as_slice() {
            [only] => Some(only.name().to_string()),
            _ => None,
        }
    }

    pub async fn process(
        &self,
        request: &str,
        agent_override: Option<&str>,
        context: &Map<String, Value>,
    ) -> AgentServiceResponse {
        let agent_name = match agent_override {
            Some(name) if self.get_agent(name).is_some() => name.to_string(),
            Some(name) => {
                tracing::warn!("Requested agent {} is not registered, routing instead", name);
                self.route(request).await
            }
            None => self.route(request).await,
        };

        let Some(agent) = self.get_agent(&agent_name) else {
            tracing::error!("Agent {} is not registered", agent_name);
            return AgentServiceResponse {
                status: Status::Error,
                text: format!("Agent {} is not registered", agent_name),
                agent: agent_name,
                details: Value::Null,
                execution_id: None,
            };
        };

        let result = agent.execute(request, context).await;
        let text = match (&result.status, &result.result, &result.error) {
            (Status::Error, _, Some(error)) => error.clone(),
            (_, Some(output), _) if !output.content.trim().is_empty() => output.content.clone(),
            _ => NO_CONTENT_MESSAGE.to_string(),
        };

        AgentServiceResponse {
            status: result.status,
            text,
            agent: agent_name,
            execution_id: Some(result.execution_id.clone()),
            details: serde_json::to_value(&result).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::llm::tests::{FailingModel, ScriptedModel};
    use crate::capability::CapabilityManager;

    fn config() -> AgentsConfig {
        AgentsConfig {
            max_steps: 3,
            ..AgentsConfig::default()
        }
    }

    fn service(model: Arc<dyn LanguageModel>) -> AgentService {
        let capabilities = Arc::new(CapabilityService::new(CapabilityManager::new()));
        AgentService::with_defaults(config(), model, capabilities)
    }

    #[test]
    fn test_defaults_registered() {
        let service = service(Arc::new(FailingModel));
        assert_eq!(service.agent_names(), vec!["general_agent"]);
        assert_eq!(service.list_tools().len(), 3);
        assert_eq!(service.list_guardrails().len(), 2);
        assert_eq!(
            service.list_agents()[0]["tools"],
            json!(["current_time", "web_browse", "generate_code"])
        );
    }

    #[test]
    fn test_create_agent_is_idempotent_and_skips_unknown_names() {
        let mut service = service(Arc::new(FailingModel));
        let first = service.create_agent("coder", Some("gpt-4o-mini"), "Write code.", &["generate_code", "nope"], &[]);
        let second = service.create_agent("coder", None, "Something else.", &[], &[]);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tool_names(), vec!["generate_code"]);
        assert_eq!(first.model(), "gpt-4o-mini");
        assert_eq!(service.agent_names(), vec!["general_agent", "coder"]);
    }

    #[test]
    fn test_nameless_tool_rejected() {
        struct Nameless;

        #[async_trait::async_trait]
        impl Tool for Nameless {
            fn name(&self) -> &str {
                " "
            }
            fn description(&self) -> &str {
                ""
            }
            fn parameters(&self) -> Value {
                json!({})
            }
            async fn execute(&self, _arguments: &Map<String, Value>) -> anyhow::Result<Value> {
                Ok(Value::Null)
            }
        }

        let mut service = service(Arc::new(FailingModel));
        assert!(!service.register_tool(Arc::new(Nameless)));
        assert_eq!(service.list_tools().len(), 3);
    }

    #[tokio::test]
    async fn test_router_picks_named_agent() {
        let model = Arc::new(ScriptedModel::new(&[
            "\"coder\"",
            r#"{"action": "final_answer", "content": "done"}"#,
        ]));
        let mut service = service(model.clone());
        service.create_agent("coder", None, "Write code.", &[], &[]);

        let response = service.process("write a parser", None, &Map::new()).await;
        assert_eq!(response.agent, "coder");
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.text, "done");
        assert_eq!(response.details["status"], "success");
    }

    #[tokio::test]
    async fn test_unrecognised_choice_falls_back() {
        let model = Arc::new(ScriptedModel::new(&[
            "the travel agent",
            r#"{"action": "final_answer", "content": ""}"#,
        ]));
        let service = service(model);

        let response = service.process("book a flight", None, &Map::new()).await;
        assert_eq!(response.agent, "general_agent");
        assert_eq!(response.text, NO_CONTENT_MESSAGE);
    }

    #[tokio::test]
    async fn test_override_skips_routing() {
        let model = Arc::new(ScriptedModel::new(&[r#"{"action": "final_answer", "content": "hi"}"#]));
        let service = service(model.clone());

        let response = service
            .process("hello", Some("general_agent"), &Map::new())
            .await;
        assert_eq!(response.text, "hi");
        assert_eq!(model.calls(), 1);
        assert!(response.execution_id.is_some());
    }

    #[tokio::test]
    async fn test_missing_default_agent_is_an_error() {
        let service = AgentService::new(config(), Arc::new(FailingModel));
        let response = service.process("hello", None, &Map::new()).await;

        assert_eq!(response.status, Status::Error);
        assert_eq!(response.agent, "general_agent");
        assert!(response.execution_id.is_none());
    }

    #[tokio::test]
    async fn test_guardrail_rejection_surfaces_as_error_text() {
        let model = Arc::new(ScriptedModel::new(&[r#"{"action": "final_answer", "content": "x"}"#]));
        let service = service(model);

        let response = service
            .process("explain violence", Some("general_agent"), &Map::new())
            .await;
        assert_eq!(response.status, Status::Error);
        assert!(response.text.starts_with("Guardrail validation failed at input stage"));
    }
}
