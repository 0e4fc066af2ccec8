use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::{html, http_client, parse_web_url};
use crate::capability::{
    BrowseRequest, CapabilityOutput, CapabilityProvider, CapabilityRequest, CapabilityType,
    ProviderError,
};
use crate::config::ProviderConfig;

const DEFAULT_BASE_URL: &str = "https://chrome.browserless.io";
pub(crate) const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const CAPABILITIES: &[CapabilityType] = &[CapabilityType::WebBrowsing];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    url: &'a str,
    wait_for: u64,
    user_agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_selector: Option<&'a str>,
}

/// Renders pages in a hosted headless Chrome via the Browserless `/content` endpoint
pub struct BrowserlessProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl BrowserlessProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = http_client(&config, 60)?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }

    fn wait_ms(&self, request: &BrowseRequest) -> u64 {
        let configured = self
            .config
            .options
            .get("wait_ms")
            .and_then(|v| v.parse().ok());
        match (configured, &request.wait_for_selector) {
            (Some(ms), _) => ms,
            (None, Some(_)) => 30_000,
            (None, None) => 5_000,
        }
    }

    async fn fetch(&self, request: &BrowseRequest) -> Result<CapabilityOutput> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or(ProviderError::MissingApiKey)?;
        parse_web_url(&request.url)?;

        let payload = ContentRequest {
            url: &request.url,
            wait_for: self.wait_ms(request),
            user_agent: request.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
            wait_for_selector: request.wait_for_selector.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/content", self.base_url()))
            .query(&[("token", api_key.as_str())])
            .header("Cache-Control", "no-cache")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))
            .context("Failed to reach Browserless")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read Browserless response")?;
        if !status.is_success() {
            return Err(ProviderError::Api(format!(
                "Failed to retrieve content ({}): {}",
                status, body
            ))
            .into());
        }

        Ok(CapabilityOutput::Page {
            url: request.url.clone(),
            title: html::extract_title(&body).unwrap_or_default(),
            content: if request.extract_text {
                html::extract_text(&body)
            } else {
                body
            },
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl CapabilityProvider for BrowserlessProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> &[CapabilityType] {
        CAPABILITIES
    }

    async fn initialize(&self) -> Result<()> {
        if self.config.api_key.as_deref().map_or(true, str::is_empty) {
            tracing::warn!("Browserless API key not provided, provider will be disabled");
            return Err(ProviderError::MissingApiKey.into());
        }
        Ok(())
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityOutput> {
        match request {
            CapabilityRequest::Browse(browse) => self.fetch(&browse).await,
            other => Err(ProviderError::Unsupported {
                provider: self.config.name.clone(),
                capability: other.capability(),
            }
            .into()),
        }
    }
}
