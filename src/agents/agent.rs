use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::guardrails::{apply_guardrails, Guardrail, GuardrailStage};
use super::llm::LanguageModel;
use super::tools::{describe_tool, Tool};
use super::AgentError;
use crate::capability::Message;
use crate::Status;

pub const DEFAULT_MAX_STEPS: usize = 10;

lazy_static! {
    static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    ExecutionStart,
    StepStart,
    LlmPrompt,
    LlmResponse,
    ToolCallAttempt,
    ToolResult,
    ToolError,
    Correction,
    FinalAnswer,
    MaxStepsReached,
    GuardrailRejected,
    ExecutionError,
    ExecutionComplete,
}

/// One entry of an agent's append-only execution log
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub kind: ObservationKind,
    pub agent: String,
    /// 0 outside the step loop
    pub step: usize,
    pub payload: Value,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    FinalAnswer { content: String },
    CallTool { tool_name: String, arguments: Value },
}

impl AgentAction {
    /// Parse a model reply. JSON may be bare, fenced or surrounded by prose;
    /// anything that is not a recognised action is a final answer holding
    /// the raw text.
    pub fn parse(raw: &str) -> Self {
        let fallback = || AgentAction::FinalAnswer {
            content: raw.trim().to_string(),
        };

        let Some(action) = extract_json(raw) else {
            return fallback();
        };
        match action.get("action").and_then(Value::as_str) {
            Some("final_answer") => AgentAction::FinalAnswer {
                content: match action.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            },
            Some("call_tool") => {
                let Some(tool_name) = action
                    .get("tool_name")
                    .or_else(|| action.get("tool"))
                    .and_then(Value::as_str)
                else {
                    return fallback();
                };
                AgentAction::CallTool {
                    tool_name: tool_name.to_string(),
                    arguments: action
                        .get("arguments")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                }
            }
            _ => fallback(),
        }
    }
}

fn extract_json(raw: &str) -> Option<Value> {
    let candidate = match FENCED_JSON.captures(raw) {
        Some(captures) => captures.get(1)?.as_str(),
        None => {
            let start = raw.find('{')?;
            let end = raw.rfind('}')?;
            raw.get(start..=end)?
        }
    };
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(Value::is_object)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub content: String,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: Status,
    pub result: Option<AgentOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_id: String,
    pub steps: usize,
    pub max_steps_reached: bool,
}

struct LoopOutcome {
    content: String,
    model: String,
    max_steps_reached: bool,
}

/// Instructions, tools and guardrails bound to a language model, run as a
/// bounded think/act loop.
pub struct Agent {
    name: String,
    model: String,
    instructions: String,
    llm: Arc<dyn LanguageModel>,
    tools: Vec<Arc<dyn Tool>>,
    guardrails: Vec<Arc<dyn Guardrail>>,
    max_steps: usize,
    timeout: Option<Duration>,
    observations: RwLock<Vec<Observation>>,
    events: broadcast::Sender<Observation>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        instructions: impl Into<String>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            model: model.into(),
            instructions: instructions.into(),
            llm,
            tools: Vec::new(),
            guardrails: Vec::new(),
            max_steps: DEFAULT_MAX_STEPS,
            timeout: None,
            observations: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_guardrails(mut self, guardrails: Vec<Arc<dyn Guardrail>>) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn guardrail_names(&self) -> Vec<&str> {
        self.guardrails.iter().map(|g| g.name()).collect()
    }

    /// Live stream of observations as they are recorded
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.events.subscribe()
    }

    /// Snapshot of the log
    pub async fn observations(&self) -> Vec<Observation> {
        self.observations.read().await.clone()
    }

    pub async fn observations_for(&self, execution_id: &str) -> Vec<Observation> {
        self.observations
            .read()
            .await
            .iter()
            .filter(|o| o.execution_id == execution_id)
            .cloned()
            .collect()
    }

    async fn record(&self, kind: ObservationKind, step: usize, execution_id: &str, payload: Value) {
        let observation = Observation {
            kind,
            agent: self.name.clone(),
            step,
            payload,
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
        };
        self.observations.write().await.push(observation.clone());
        // No subscribers is fine
        let _ = self.events.send(observation);
    }

    fn system_prompt(&self) -> String {
        let mut prompt = self.instructions.clone();
        if self.tools.is_empty() {
            prompt.push_str("\n\nYou have no tools available.");
        } else {
            prompt.push_str("\n\nAvailable tools:");
            for tool in &self.tools {
                prompt.push_str(&format!("\n{}", describe_tool(tool.as_ref())));
            }
        }
        prompt.push_str(
            "\n\nRespond with a single JSON object, either\n\
             {\"action\": \"call_tool\", \"tool_name\": \"<name>\", \"arguments\": {...}}\n\
             or\n\
             {\"action\": \"final_answer\", \"content\": \"<answer>\"}",
        );
        prompt
    }

    fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub async fn execute(&self, task: &str, context: &Map<String, Value>) -> ExecutionResult {
        let execution_id = match context.get("execution_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        tracing::info!("Agent {} starting execution {}", self.name, execution_id);
        self.record(ObservationKind::ExecutionStart, 0, &execution_id, json!({ "task": task }))
            .await;

        let input = json!({ "task": task, "context": context });
        if let Some(error) = self
            .check_guardrails(&input, GuardrailStage::Input, &execution_id)
            .await
        {
            return self.failure(execution_id, 0, error);
        }

        let mut steps = 0;
        let run = self.run_loop(task, &execution_id, &mut steps);
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .unwrap_or(Err(AgentError::Timeout(limit))),
            None => run.await,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!("Agent {} execution {} failed: {}", self.name, execution_id, error);
                self.record(
                    ObservationKind::ExecutionError,
                    steps,
                    &execution_id,
                    json!({ "error": error.to_string() }),
                )
                .await;
                return self.failure(execution_id, steps, error);
            }
        };

        let output = json!({ "result": outcome.content });
        if let Some(error) = self
            .check_guardrails(&output, GuardrailStage::Output, &execution_id)
            .await
        {
            return self.failure(execution_id, steps, error);
        }

        self.record(
            ObservationKind::ExecutionComplete,
            steps,
            &execution_id,
            json!({ "steps": steps, "max_steps_reached": outcome.max_steps_reached }),
        )
        .await;

        ExecutionResult {
            status: Status::Success,
            result: Some(AgentOutput {
                content: outcome.content,
                model_used: outcome.model,
            }),
            error: None,
            execution_id,
            steps,
            max_steps_reached: outcome.max_steps_reached,
        }
    }

    async fn check_guardrails(
        &self,
        payload: &Value,
        stage: GuardrailStage,
        execution_id: &str,
    ) -> Option<AgentError> {
        let payload = payload.as_object()?;
        let (guardrail, reason) = apply_guardrails(&self.guardrails, payload, stage).err()?;
        tracing::warn!("Guardrail {} rejected {} of agent {}: {}", guardrail, stage, self.name, reason);
        self.record(
            ObservationKind::GuardrailRejected,
            0,
            execution_id,
            json!({ "stage": stage, "guardrail": guardrail, "reason": reason }),
        )
        .await;
        Some(AgentError::GuardrailRejected { stage, reason })
    }

    fn failure(&self, execution_id: String, steps: usize, error: AgentError) -> ExecutionResult {
        ExecutionResult {
            status: Status::Error,
            result: None,
            error: Some(error.to_string()),
            execution_id,
            steps,
            max_steps_reached: false,
        }
    }

    async fn correct(
        &self,
        history: &mut Vec<Message>,
        step: usize,
        execution_id: &str,
        reason: &str,
        error: AgentError,
    ) {
        let message = format!("{}. Available tools: {}", error, self.tool_names().join(", "));
        self.record(
            ObservationKind::Correction,
            step,
            execution_id,
            json!({ "reason": reason, "message": message }),
        )
        .await;
        history.push(Message::system(message));
    }

    async fn run_loop(
        &self,
        task: &str,
        execution_id: &str,
        steps: &mut usize,
    ) -> Result<LoopOutcome, AgentError> {
        let system = self.system_prompt();
        let mut history = vec![Message::user(task)];
        let mut model_used = self.model.clone();

        for step in 1..=self.max_steps {
            *steps = step;
            self.record(ObservationKind::StepStart, step, execution_id, json!({})).await;

            let mut prompt = Vec::with_capacity(history.len() + 1);
            prompt.push(Message::system(system.clone()));
            prompt.extend(history.iter().cloned());
            self.record(
                ObservationKind::LlmPrompt,
                step,
                execution_id,
                json!({ "messages": prompt.len(), "last": history.last().map(|m| m.content.as_str()) }),
            )
            .await;

            let reply = self
                .llm
                .complete(&prompt, Some(&self.model))
                .await
                .map_err(|e| AgentError::LanguageModel(e.to_string()))?;
            model_used = reply.model.clone();
            self.record(
                ObservationKind::LlmResponse,
                step,
                execution_id,
                json!({ "content": reply.content, "model": reply.model }),
            )
            .await;

            let (tool_name, arguments) = match AgentAction::parse(&reply.content) {
                AgentAction::FinalAnswer { content } => {
                    self.record(
                        ObservationKind::FinalAnswer,
                        step,
                        execution_id,
                        json!({ "content": content }),
                    )
                    .await;
                    return Ok(LoopOutcome {
                        content,
                        model: model_used,
                        max_steps_reached: false,
                    });
                }
                AgentAction::CallTool { tool_name, arguments } => (tool_name, arguments),
            };

            history.push(Message::assistant(reply.content));
            // Nothing could read the outcome of a tool called on the last step
            if step == self.max_steps {
                break;
            }

            self.record(
                ObservationKind::ToolCallAttempt,
                step,
                execution_id,
                json!({ "tool": tool_name, "arguments": arguments }),
            )
            .await;

            let Value::Object(arguments) = arguments else {
                let error = AgentError::MalformedToolArguments(tool_name);
                self.correct(&mut history, step, execution_id, "malformed_tool_arguments", error)
                    .await;
                continue;
            };
            let Some(tool) = self.tool(&tool_name) else {
                let error = AgentError::ToolNotFound(tool_name);
                self.correct(&mut history, step, execution_id, "tool_not_found", error)
                    .await;
                continue;
            };

            match tool.execute(&arguments).await {
                Ok(result) => {
                    self.record(
                        ObservationKind::ToolResult,
                        step,
                        execution_id,
                        json!({ "tool": tool_name, "result": result }),
                    )
                    .await;
                    history.push(Message::tool(format!("Tool {} returned: {}", tool_name, result)));
                }
                Err(e) => {
                    tracing::warn!("Tool {} failed in agent {}: {}", tool_name, self.name, e);
                    self.record(
                        ObservationKind::ToolError,
                        step,
                        execution_id,
                        json!({ "tool": tool_name, "error": e.to_string() }),
                    )
                    .await;
                    history.push(Message::system(format!("Tool {} failed: {}", tool_name, e)));
                }
            }
        }

        let last = history.last().map(|m| m.content.as_str()).unwrap_or_default();
        let content = format!(
            "Max steps reached ({}) without a final answer. Last message: {}",
            self.max_steps, last
        );
        tracing::warn!("Agent {} hit the step limit in {}", self.name, execution_id);
        self.record(
            ObservationKind::MaxStepsReached,
            *steps,
            execution_id,
            json!({ "content": content }),
        )
        .await;

        Ok(LoopOutcome {
            content,
            model: model_used,
            max_steps_reached: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::guardrails::ContentFilterGuardrail;
    use crate::agents::llm::tests::{FailingModel, ScriptedModel};
    use crate::agents::llm::LanguageModelReply;
    use crate::capability::MessageRole;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the arguments"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value> {
            if arguments.contains_key("fail") {
                anyhow::bail!("echo refused");
            }
            Ok(json!({ "echo": arguments }))
        }
    }

    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn complete(&self, _messages: &[Message], _model: Option<&str>) -> anyhow::Result<LanguageModelReply> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(LanguageModelReply {
                content: "late".to_string(),
                model: "slow".to_string(),
            })
        }
    }

    const FINAL_X: &str = r#"{"action": "final_answer", "content": "X"}"#;
    const UNKNOWN_TOOL: &str = r#"{"action": "call_tool", "tool_name": "teleport", "arguments": {}}"#;

    fn agent(model: Arc<dyn LanguageModel>) -> Agent {
        Agent::new("tester", "gpt-4o", "You test things.", model)
            .with_tools(vec![Arc::new(EchoTool) as Arc<dyn Tool>])
    }

    fn count(observations: &[Observation], kind: ObservationKind) -> usize {
        observations.iter().filter(|o| o.kind == kind).count()
    }

    #[test]
    fn test_parse_action_forms() {
        assert_eq!(
            AgentAction::parse(FINAL_X),
            AgentAction::FinalAnswer { content: "X".to_string() }
        );
        assert_eq!(
            AgentAction::parse(
                "Sure.\n```json\n{\"action\": \"call_tool\", \"tool\": \"echo\", \"arguments\": {\"a\": {\"b\": 1}}}\n```"
            ),
            AgentAction::CallTool {
                tool_name: "echo".to_string(),
                arguments: json!({"a": {"b": 1}})
            }
        );
        assert_eq!(
            AgentAction::parse("I think {\"action\": \"final_answer\", \"content\": \"Y\"} works"),
            AgentAction::FinalAnswer { content: "Y".to_string() }
        );
        assert_eq!(
            AgentAction::parse("  just prose {broken "),
            AgentAction::FinalAnswer { content: "just prose {broken".to_string() }
        );
        assert_eq!(
            AgentAction::parse(r#"{"answer": 42}"#),
            AgentAction::FinalAnswer { content: r#"{"answer": 42}"#.to_string() }
        );
    }

    #[tokio::test]
    async fn test_final_answer_in_one_step() {
        let model = Arc::new(ScriptedModel::new(&[FINAL_X]));
        let agent = agent(model.clone());

        let result = agent.execute("say X", &Map::new()).await;
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.steps, 1);
        assert!(!result.max_steps_reached);
        assert_eq!(result.result.unwrap().content, "X");
        assert_eq!(model.calls(), 1);

        let observations = agent.observations().await;
        assert_eq!(observations.first().unwrap().kind, ObservationKind::ExecutionStart);
        assert_eq!(observations.last().unwrap().kind, ObservationKind::ExecutionComplete);
        assert_eq!(count(&observations, ObservationKind::StepStart), 1);
        assert!(observations.iter().all(|o| o.execution_id == result.execution_id));
    }

    #[tokio::test]
    async fn test_unknown_tool_stops_at_step_limit() {
        let model = Arc::new(ScriptedModel::new(&[UNKNOWN_TOOL]));
        let agent = agent(model.clone()).with_max_steps(4);

        let result = agent.execute("go somewhere", &Map::new()).await;
        assert_eq!(result.status, Status::Success);
        assert!(result.max_steps_reached);
        assert_eq!(result.steps, 4);
        assert_eq!(model.calls(), 4);
        assert!(result.result.unwrap().content.starts_with("Max steps reached (4)"));

        let observations = agent.observations().await;
        let not_found = observations
            .iter()
            .filter(|o| o.kind == ObservationKind::Correction && o.payload["reason"] == "tool_not_found")
            .count();
        assert_eq!(not_found, 3);
        assert_eq!(count(&observations, ObservationKind::StepStart), 4);
        assert_eq!(count(&observations, ObservationKind::MaxStepsReached), 1);
    }

    #[tokio::test]
    async fn test_input_guardrail_blocks_before_any_step() {
        let model = Arc::new(ScriptedModel::new(&[FINAL_X]));
        let agent = agent(model.clone()).with_guardrails(vec![Arc::new(ContentFilterGuardrail::new(&[
            "violence".to_string(),
        ])) as Arc<dyn Guardrail>]);

        let result = agent.execute("write about violence", &Map::new()).await;
        assert_eq!(result.status, Status::Error);
        assert!(result.error.unwrap().contains("input stage"));
        assert_eq!(model.calls(), 0);

        let observations = agent.observations().await;
        assert_eq!(count(&observations, ObservationKind::StepStart), 0);
        assert_eq!(count(&observations, ObservationKind::GuardrailRejected), 1);
    }

    #[tokio::test]
    async fn test_output_guardrail_keeps_recorded_steps() {
        let model = Arc::new(ScriptedModel::new(&[r#"{"action": "final_answer", "content": "more violence"}"#]));
        let agent = agent(model).with_guardrails(vec![Arc::new(ContentFilterGuardrail::new(&[
            "violence".to_string(),
        ])) as Arc<dyn Guardrail>]);

        let result = agent.execute("tell a story", &Map::new()).await;
        assert_eq!(result.status, Status::Error);
        assert!(result.error.unwrap().contains("output stage"));

        let observations = agent.observations().await;
        assert_eq!(count(&observations, ObservationKind::FinalAnswer), 1);
        assert_eq!(count(&observations, ObservationKind::ExecutionComplete), 0);
    }

    #[tokio::test]
    async fn test_tool_result_and_error_feed_history() {
        let model = Arc::new(ScriptedModel::new(&[
            r#"{"action": "call_tool", "tool_name": "echo", "arguments": {"word": "hi"}}"#,
            r#"{"action": "call_tool", "tool_name": "echo", "arguments": {"fail": true}}"#,
            r#"{"action": "call_tool", "tool_name": "echo", "arguments": "not an object"}"#,
            FINAL_X,
        ]));
        let agent = agent(model.clone());

        let result = agent.execute("echo hi", &Map::new()).await;
        assert_eq!(result.steps, 4);
        assert_eq!(result.result.unwrap().content, "X");

        let prompts = model.prompts.lock().unwrap();
        let after_success = prompts[1].last().unwrap();
        assert_eq!(after_success.role, MessageRole::Tool);
        assert!(after_success.content.contains("\"word\":\"hi\""));

        let after_failure = prompts[2].last().unwrap();
        assert_eq!(after_failure.role, MessageRole::System);
        assert_eq!(after_failure.content, "Tool echo failed: echo refused");

        let after_malformed = prompts[3].last().unwrap();
        assert!(after_malformed.content.starts_with("Arguments for tool echo must be a JSON object"));
        assert_eq!(prompts[3][0].role, MessageRole::System);
        assert_eq!(prompts[3][1].content, "echo hi");

        drop(prompts);
        let observations = agent.observations().await;
        assert_eq!(count(&observations, ObservationKind::ToolResult), 1);
        assert_eq!(count(&observations, ObservationKind::ToolError), 1);
        assert_eq!(count(&observations, ObservationKind::Correction), 1);
    }

    #[tokio::test]
    async fn test_model_failure_is_execution_error() {
        let agent = agent(Arc::new(FailingModel));
        let result = agent.execute("anything", &Map::new()).await;

        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error.as_deref(), Some("Language model call failed: model offline"));
        assert_eq!(count(&agent.observations().await, ObservationKind::ExecutionError), 1);
    }

    #[tokio::test]
    async fn test_timeout_and_execution_id_from_context() {
        let agent = agent(Arc::new(SlowModel)).with_timeout(Some(Duration::from_millis(20)));
        let context = json!({"execution_id": "exec-42"}).as_object().cloned().unwrap();

        let result = agent.execute("hurry", &context).await;
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.execution_id, "exec-42");
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(agent.observations_for("exec-42").await.len(), agent.observations().await.len());
    }

    #[tokio::test]
    async fn test_subscribers_see_observations() {
        let agent = agent(Arc::new(ScriptedModel::new(&[FINAL_X])));
        let mut events = agent.subscribe();

        agent.execute("say X", &Map::new()).await;
        assert_eq!(events.recv().await.unwrap().kind, ObservationKind::ExecutionStart);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ExecutionResult {
            status: Status::Success,
            result: Some(AgentOutput {
                content: "X".to_string(),
                model_used: "gpt-4o".to_string(),
            }),
            error: None,
            execution_id: "e".to_string(),
            steps: 1,
            max_steps_reached: false,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["result"]["modelUsed"], "gpt-4o");
        assert_eq!(value["executionId"], "e");
        assert_eq!(value["maxStepsReached"], false);
        assert_eq!(value["status"], "success");
    }
}
