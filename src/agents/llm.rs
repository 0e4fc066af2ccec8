use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::capability::{CapabilityService, Message, MessageRole, TextRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct LanguageModelReply {
    pub content: String,
    pub model: String,
}

/// The model an agent thinks with. `messages` is the full prompt, oldest
/// first; `model` is the agent's preference and may be ignored.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, messages: &[Message], model: Option<&str>) -> Result<LanguageModelReply>;
}

/// Routes completions through the text-generation capability with failover
pub struct CapabilityLanguageModel {
    capabilities: Arc<CapabilityService>,
    provider: Option<String>,
    temperature: f32,
}

impl CapabilityLanguageModel {
    pub fn new(capabilities: Arc<CapabilityService>) -> Self {
        Self {
            capabilities,
            provider: None,
            temperature: 0.2,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

#[async_trait]
impl LanguageModel for CapabilityLanguageModel {
    async fn complete(&self, messages: &[Message], model: Option<&str>) -> Result<LanguageModelReply> {
        let Some((last, earlier)) = messages.split_last() else {
            anyhow::bail!("cannot complete an empty conversation");
        };

        let mut request = TextRequest::new(last.content.clone());
        request.model = model.map(str::to_string);
        request.temperature = Some(self.temperature);
        // Trailing system corrections are sent as the user's turn
        if last.role == MessageRole::System {
            request.prompt = format!("System: {}", last.content);
        }
        request.context = earlier.to_vec();

        let response = self
            .capabilities
            .generate_text(request, self.provider.as_deref(), true)
            .await?;

        Ok(LanguageModelReply {
            content: response.text().unwrap_or_default().to_string(),
            model: response
                .model()
                .map(str::to_string)
                .unwrap_or_else(|| response.provider.clone()),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::manager::tests::StubProvider;
    use crate::capability::CapabilityManager;
    use std::sync::Mutex;

    /// Replays canned replies in order, repeating the last one, and keeps
    /// every prompt it was given
    pub(crate) struct ScriptedModel {
        replies: Vec<String>,
        pub prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, messages: &[Message], model: Option<&str>) -> Result<LanguageModelReply> {
            let mut prompts = self.prompts.lock().unwrap();
            let index = prompts.len().min(self.replies.len().saturating_sub(1));
            prompts.push(messages.to_vec());
            Ok(LanguageModelReply {
                content: self.replies.get(index).cloned().unwrap_or_default(),
                model: model.unwrap_or("scripted").to_string(),
            })
        }
    }

    pub(crate) struct FailingModel;

    #[async_trait]
    impl LanguageModel for FailingModel {
        async fn complete(&self, _messages: &[Message], _model: Option<&str>) -> Result<LanguageModelReply> {
            anyhow::bail!("model offline")
        }
    }

    #[tokio::test]
    async fn test_capability_model_fails_over() {
        let mut manager = CapabilityManager::new();
        manager.register_provider(Arc::new(StubProvider::failing("primary")));
        manager.register_provider(Arc::new(StubProvider::ok("backup", "hello there")));
        let model = CapabilityLanguageModel::new(Arc::new(CapabilityService::new(manager)));

        let reply = model
            .complete(&[Message::system("be brief"), Message::user("hi")], Some("gpt-4o"))
            .await
            .unwrap();
        assert_eq!(reply.content, "hello there");
        assert_eq!(reply.model, "stub");
    }

    #[tokio::test]
    async fn test_empty_conversation_is_an_error() {
        let model = CapabilityLanguageModel::new(Arc::new(CapabilityService::new(CapabilityManager::new())));
        assert!(model.complete(&[], None).await.is_err());
    }
}
