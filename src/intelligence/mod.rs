pub mod aggregator;
pub mod roles;

pub use aggregator::{Suggestion, SuggestionAggregator};
pub use roles::{AssistantRole, RoleRegistry, RoleResponse, SourcedResult};
