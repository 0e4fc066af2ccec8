pub mod agent;
pub mod guardrails;
pub mod llm;
pub mod service;
pub mod tools;

use std::time::Duration;

pub use agent::{Agent, AgentAction, AgentOutput, ExecutionResult, Observation, ObservationKind};
pub use guardrails::{
    CompositeGuardrail, ContentFilterGuardrail, DataValidationGuardrail, Guardrail, GuardrailStage,
    RateLimitGuardrail,
};
pub use llm::{CapabilityLanguageModel, LanguageModel, LanguageModelReply};
pub use service::{AgentService, AgentServiceResponse};
pub use tools::{CurrentTimeTool, GenerateCodeTool, Tool, WebBrowseTool};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Guardrail validation failed at {stage} stage: {reason}")]
    GuardrailRejected { stage: GuardrailStage, reason: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Arguments for tool {0} must be a JSON object")]
    MalformedToolArguments(String),

    #[error("Language model call failed: {0}")]
    LanguageModel(String),

    #[error("Agent execution timed out after {0:?}")]
    Timeout(Duration),
}
