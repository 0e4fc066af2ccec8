use anyhow::{Context, Result};
use async_trait::async_trait;

use super::browserless::DEFAULT_USER_AGENT;
use super::{html, http_client, parse_web_url};
use crate::capability::{
    CapabilityOutput, CapabilityProvider, CapabilityRequest, CapabilityType, ProviderError,
};
use crate::config::ProviderConfig;

const CAPABILITIES: &[CapabilityType] = &[CapabilityType::WebBrowsing];

/// Plain GET without JavaScript rendering; the local fallback when no
/// browser service is configured
pub struct HttpFetchProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpFetchProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = http_client(&config, 30)?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl CapabilityProvider for HttpFetchProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[CapabilityType] {
        CAPABILITIES
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput> {
        let browse = match request {
            CapabilityRequest::Browse(browse) => browse,
            other => {
                return Err(ProviderError::Unsupported {
                    provider: self.config.name.clone(),
                    capability: other.capability(),
                }
                .into())
            }
        };

        if browse.wait_for_selector.is_some() {
            tracing::debug!("{} ignores wait_for_selector", self.config.name);
        }

        let url = parse_web_url(&browse.url)?;
        let response = self
            .client
            .get(url)
            .header(
                "User-Agent",
                browse.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
            )
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))
            .with_context(|| format!("Failed to fetch {}", browse.url))?;

        let status = response.status();
        let body = response.text().await.context("Failed to read response body")?;
        if !status.is_success() {
            return Err(ProviderError::Api(format!("GET {} returned {}", browse.url, status)).into());
        }

        Ok(CapabilityOutput::Page {
            title: html::extract_title(&body).unwrap_or_default(),
            content: if browse.extract_text {
                html::extract_text(&body)
            } else {
                body
            },
            url: browse.url,
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BrowseRequest, TextRequest};

    #[tokio::test]
    async fn test_rejects_invalid_url_before_network() {
        let provider = HttpFetchProvider::new(ProviderConfig::new("http_fetch", "http_fetch")).unwrap();
        let result = provider
            .execute(CapabilityRequest::Browse(BrowseRequest::new("example.com")))
            .await;
        assert!(result.unwrap_err().to_string().contains("Invalid URL"));
    }

    #[tokio::test]
    async fn test_text_is_unsupported() {
        let provider = HttpFetchProvider::new(ProviderConfig::new("http_fetch", "http_fetch")).unwrap();
        let result = provider
            .execute(CapabilityRequest::Text(TextRequest::new("hi")))
            .await;
        assert!(result.is_err());
    }
}
