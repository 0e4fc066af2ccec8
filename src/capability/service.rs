use super::providers::ProviderFactoryRegistry;
use super::{
    BrowseRequest, CapabilityError, CapabilityManager, CapabilityRequest, CapabilityResponse,
    CapabilityType, CodeRequest, TextRequest, VectorRequest,
};
use crate::config::CapabilityConfig;

/// Front door to the capability layer: builds providers from config, owns
/// the [`CapabilityManager`] and exposes one typed call per capability.
pub struct CapabilityService {
    manager: CapabilityManager,
    pinned_defaults: Vec<CapabilityType>,
    initialized: bool,
}

impl CapabilityService {
    pub fn new(manager: CapabilityManager) -> Self {
        Self {
            manager,
            pinned_defaults: Vec::new(),
            initialized: false,
        }
    }

    /// Register every enabled provider in `config` (in order) and apply the
    /// configured defaults. Providers that cannot be constructed are skipped.
    pub fn from_config(config: &CapabilityConfig, factories: &ProviderFactoryRegistry) -> Self {
        let mut manager = CapabilityManager::new().with_call_timeout(config.call_timeout());

        for provider_config in &config.providers {
            if !provider_config.enabled {
                tracing::debug!("Provider {} disabled in config", provider_config.name);
                continue;
            }
            match factories.create(provider_config) {
                Ok(provider) => manager.register_provider(provider),
                Err(e) => tracing::warn!(
                    "Could not create provider {} ({}): {}",
                    provider_config.name,
                    provider_config.kind,
                    e
                ),
            }
        }

        let mut pinned_defaults = Vec::new();
        for capability in CapabilityType::ALL {
            if let Some(name) = config.default_for(capability) {
                match manager.set_default_provider(capability, name) {
                    Ok(()) => pinned_defaults.push(capability),
                    Err(e) => tracing::warn!("Could not set default {} provider: {}", capability, e),
                }
            }
        }

        Self {
            manager,
            pinned_defaults,
            initialized: false,
        }
    }

    pub fn manager(&self) -> &CapabilityManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut CapabilityManager {
        &mut self.manager
    }

    /// Initialize all providers once. A default whose provider was disabled
    /// during initialization moves to the first enabled provider supporting
    /// that capability.
    pub async fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        tracing::info!("Initializing capability service");

        self.manager.initialize_all().await;

        for capability in CapabilityType::ALL {
            let current = match self.manager.default_provider(capability) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if self.manager.is_enabled(&current) {
                continue;
            }

            let replacement = self
                .manager
                .providers_for_capability(capability)
                .first()
                .map(|s| s.to_string());
            match replacement {
                Some(name) => {
                    if self.pinned_defaults.contains(&capability) {
                        tracing::warn!(
                            "Configured default {} for {} is unavailable, using {}",
                            current,
                            capability,
                            name
                        );
                    }
                    if let Err(e) = self.manager.set_default_provider(capability, &name) {
                        tracing::warn!("Could not move default for {}: {}", capability, e);
                    }
                }
                None => {
                    tracing::warn!("No enabled provider for {}", capability);
                    self.manager.clear_default_provider(capability);
                }
            }
        }

        tracing::info!("Capability service initialized");
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down capability service");
        self.manager.shutdown_all().await;
    }

    pub async fn execute(
        &self,
        request: CapabilityRequest,
        provider: Option<&str>,
        fallback: bool,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.manager.execute(request, provider, fallback).await
    }

    pub async fn generate_text(
        &self,
        request: TextRequest,
        provider: Option<&str>,
        fallback: bool,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.execute(CapabilityRequest::Text(request), provider, fallback)
            .await
    }

    pub async fn generate_code(
        &self,
        request: CodeRequest,
        provider: Option<&str>,
        fallback: bool,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.execute(CapabilityRequest::Code(request), provider, fallback)
            .await
    }

    pub async fn browse_url(
        &self,
        request: BrowseRequest,
        provider: Option<&str>,
        fallback: bool,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.execute(CapabilityRequest::Browse(request), provider, fallback)
            .await
    }

    pub async fn vector_operation(
        &self,
        request: VectorRequest,
        provider: Option<&str>,
        fallback: bool,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.execute(CapabilityRequest::Vector(request), provider, fallback)
            .await
    }

    pub fn available_providers(&self, capability: CapabilityType) -> Vec<&str> {
        self.manager.providers_for_capability(capability)
    }

    pub fn default_provider(&self, capability: CapabilityType) -> Option<&str> {
        self.manager.default_provider(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::manager::tests::StubProvider;
    use crate::capability::{CapabilityOutput, VectorOperation};
    use crate::config::ProviderConfig;
    use std::sync::Arc;

    fn offline_config() -> CapabilityConfig {
        CapabilityConfig {
            providers: vec![
                ProviderConfig::new("vectors", "memory_vector"),
                ProviderConfig::new("demo", "demo"),
            ],
            default_text_provider: None,
            default_code_provider: None,
            default_web_provider: None,
            default_vector_provider: None,
            call_timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_builds_providers_from_config() {
        let mut service =
            CapabilityService::from_config(&offline_config(), &ProviderFactoryRegistry::with_builtins());
        service.initialize().await;

        assert_eq!(service.default_provider(CapabilityType::TextGeneration), Some("demo"));
        assert_eq!(service.default_provider(CapabilityType::VectorStorage), Some("vectors"));
        assert_eq!(service.default_provider(CapabilityType::WebBrowsing), None);

        let response = service
            .generate_text(TextRequest::new("hello"), None, true)
            .await
            .unwrap();
        assert_eq!(response.provider, "demo");

        let response = service
            .vector_operation(VectorRequest::new(VectorOperation::Count), None, false)
            .await
            .unwrap();
        assert!(matches!(response.output, CapabilityOutput::Vector { count: 0, .. }));
    }

    #[tokio::test]
    async fn test_skips_disabled_and_unknown_providers() {
        let mut config = offline_config();
        config.providers[0].enabled = false;
        config.providers.push(ProviderConfig::new("ghost", "no_such_type"));

        let service = CapabilityService::from_config(&config, &ProviderFactoryRegistry::with_builtins());
        assert_eq!(service.manager().provider_names(), vec!["demo"]);
    }

    #[tokio::test]
    async fn test_configured_default_applies() {
        let mut config = offline_config();
        config.providers.push(ProviderConfig::new("second_demo", "demo"));
        config.default_text_provider = Some("second_demo".to_string());

        let service = CapabilityService::from_config(&config, &ProviderFactoryRegistry::with_builtins());
        assert_eq!(
            service.default_provider(CapabilityType::TextGeneration),
            Some("second_demo")
        );
    }

    #[tokio::test]
    async fn test_default_moves_off_provider_that_failed_init() {
        let mut manager = CapabilityManager::new();
        manager.register_provider(Arc::new(StubProvider::ok("primary", "a").failing_init()));
        manager.register_provider(Arc::new(StubProvider::ok("backup", "b")));

        let mut service = CapabilityService::new(manager);
        service.initialize().await;

        assert_eq!(service.default_provider(CapabilityType::TextGeneration), Some("backup"));
        let response = service
            .generate_text(TextRequest::new("hi"), None, false)
            .await
            .unwrap();
        assert_eq!(response.text(), Some("b"));
    }

    #[tokio::test]
    async fn test_default_cleared_when_no_enabled_provider_remains() {
        let mut manager = CapabilityManager::new();
        manager.register_provider(Arc::new(StubProvider::ok("only", "a").failing_init()));

        let mut service = CapabilityService::new(manager);
        service.initialize().await;

        assert!(!service.manager().is_enabled("only"));
        assert_eq!(service.default_provider(CapabilityType::TextGeneration), None);
        let err = service
            .generate_text(TextRequest::new("hi"), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::NoProviderAvailable(_)));
    }
}
