use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    CapabilityError, CapabilityProvider, CapabilityRequest, CapabilityResponse, CapabilityType,
};

struct ProviderEntry {
    provider: Arc<dyn CapabilityProvider>,
    enabled: AtomicBool,
}

/// Registry of capability providers with default routing and ordered failover.
///
/// Registration order is significant: it decides the first-registered default
/// for each capability and the order in which fallback candidates are tried.
pub struct CapabilityManager {
    entries: Vec<ProviderEntry>,
    index: HashMap<String, usize>,
    default_providers: HashMap<CapabilityType, String>,
    call_timeout: Option<Duration>,
}

impl CapabilityManager {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            default_providers: HashMap::new(),
            call_timeout: None,
        }
    }

    /// Bound every individual provider call. A candidate that exceeds the
    /// budget counts as a failed candidate.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Register a provider. Re-registering a name replaces the provider but
    /// keeps its original position.
    pub fn register_provider(&mut self, provider: Arc<dyn CapabilityProvider>) {
        let name = provider.name().to_string();
        let entry = ProviderEntry {
            provider,
            enabled: AtomicBool::new(true),
        };

        match self.index.get(&name) {
            Some(&position) => self.entries[position] = entry,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        tracing::info!("Registered provider: {}", name);

        let supported: Vec<CapabilityType> = self.entries[self.index[&name]]
            .provider
            .capabilities()
            .to_vec();
        for capability in supported {
            if !self.default_providers.contains_key(&capability) {
                self.default_providers.insert(capability, name.clone());
                tracing::info!("Set {} as default for {}", name, capability);
            }
        }
    }

    pub fn set_default_provider(
        &mut self,
        capability: CapabilityType,
        provider_name: &str,
    ) -> Result<(), CapabilityError> {
        let entry = self
            .entry(provider_name)
            .ok_or_else(|| CapabilityError::UnknownProvider(provider_name.to_string()))?;

        if !entry.provider.supports(capability) {
            return Err(CapabilityError::UnsupportedCapability {
                provider: provider_name.to_string(),
                capability,
            });
        }

        self.default_providers
            .insert(capability, provider_name.to_string());
        tracing::info!("Set {} as default for {}", provider_name, capability);
        Ok(())
    }

    /// Forget the default for `capability`, e.g. once its provider is disabled
    pub fn clear_default_provider(&mut self, capability: CapabilityType) {
        if let Some(previous) = self.default_providers.remove(&capability) {
            tracing::info!("Cleared default {} for {}", previous, capability);
        }
    }

    pub fn default_provider(&self, capability: CapabilityType) -> Option<&str> {
        self.default_providers.get(&capability).map(|s| s.as_str())
    }

    /// Enabled providers supporting `capability`, in registration order
    pub fn providers_for_capability(&self, capability: CapabilityType) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.enabled.load(Ordering::Relaxed) && e.provider.supports(capability))
            .map(|e| e.provider.name())
            .collect()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.provider.name()).collect()
    }

    pub fn is_enabled(&self, provider_name: &str) -> bool {
        self.entry(provider_name)
            .map(|e| e.enabled.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Flip a provider's availability from outside the manager
    pub fn set_enabled(&self, provider_name: &str, enabled: bool) -> Result<(), CapabilityError> {
        let entry = self
            .entry(provider_name)
            .ok_or_else(|| CapabilityError::UnknownProvider(provider_name.to_string()))?;
        entry.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    fn entry(&self, name: &str) -> Option<&ProviderEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    fn candidates(
        &self,
        capability: CapabilityType,
        provider_name: Option<&str>,
        fallback: bool,
    ) -> Vec<String> {
        let mut candidates: Vec<String> = match provider_name {
            Some(name) => vec![name.to_string()],
            None => self
                .default_providers
                .get(&capability)
                .cloned()
                .into_iter()
                .collect(),
        };

        if fallback {
            for name in self.providers_for_capability(capability) {
                if !candidates.iter().any(|c| c == name) {
                    candidates.push(name.to_string());
                }
            }
        }

        candidates
    }

    /// Route `request` to a provider.
    ///
    /// Candidates are the explicit provider (or the capability's default)
    /// followed, when `fallback` is set, by every other enabled supporting
    /// provider in registration order. Candidates are tried one at a time and
    /// the first success is returned. Without `fallback` the first failure is
    /// returned as is.
    pub async fn execute(
        &self,
        request: CapabilityRequest,
        provider_name: Option<&str>,
        fallback: bool,
    ) -> Result<CapabilityResponse, CapabilityError> {
        let capability = request.capability();
        let candidates = self.candidates(capability, provider_name, fallback);

        if candidates.is_empty() {
            return Err(CapabilityError::NoProviderAvailable(capability));
        }

        let mut last_error: Option<String> = None;
        for name in &candidates {
            let Some(entry) = self.entry(name) else {
                tracing::warn!("Provider {} not found", name);
                continue;
            };
            if !entry.enabled.load(Ordering::Relaxed) || !entry.provider.supports(capability) {
                continue;
            }

            tracing::info!("Executing {} with provider {}", capability, name);
            match self.invoke(entry, request.clone()).await {
                Ok(output) => {
                    return Ok(CapabilityResponse {
                        provider: name.clone(),
                        output,
                    });
                }
                Err(e) => {
                    tracing::warn!("Error with provider {}: {}", name, e);
                    if !fallback {
                        return Err(CapabilityError::ProviderFailed {
                            provider: name.clone(),
                            source: e,
                        });
                    }
                    last_error = Some(e.to_string());
                }
            }
        }

        let error = CapabilityError::AllProvidersFailed {
            capability,
            last_error: last_error.unwrap_or_else(|| "no usable provider".to_string()),
        };
        tracing::error!("{}", error);
        Err(error)
    }

    async fn invoke(
        &self,
        entry: &ProviderEntry,
        request: CapabilityRequest,
    ) -> anyhow::Result<super::CapabilityOutput> {
        match self.call_timeout {
            Some(budget) => tokio::time::timeout(budget, entry.provider.execute(request))
                .await
                .map_err(|_| {
                    anyhow::Error::new(CapabilityError::Timeout {
                        provider: entry.provider.name().to_string(),
                        after: budget,
                    })
                })?,
            None => entry.provider.execute(request).await,
        }
    }

    /// Initialize every provider; a provider whose initialization fails is
    /// disabled for the rest of the process.
    pub async fn initialize_all(&self) {
        for entry in &self.entries {
            let name = entry.provider.name();
            match entry.provider.initialize().await {
                Ok(()) => tracing::info!("Initialized provider: {}", name),
                Err(e) => {
                    tracing::error!("Error initializing provider {}: {}", name, e);
                    entry.enabled.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    pub async fn shutdown_all(&self) {
        for entry in &self.entries {
            let name = entry.provider.name();
            match entry.provider.shutdown().await {
                Ok(()) => tracing::info!("Shut down provider: {}", name),
                Err(e) => tracing::error!("Error shutting down provider {}: {}", name, e),
            }
        }
    }
}

impl Default for CapabilityManager {
    fn default() -> Self {
        Self::new()
    }
}
