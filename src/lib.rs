pub mod agents;
pub mod capability;
pub mod config;
pub mod intelligence;
pub mod orchestrator;
pub mod plugins;

use serde::{Deserialize, Serialize};

pub use config::NexusConfig;
pub use orchestrator::{Orchestrator, OrchestratorResponse, RequestOptions};

/// Outcome carried by every service-level response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}
