//! Third-party rendering-proxy capability (spec §4.3 step 5, §6 "Rendering proxy").
//!
//! Grounded on the teacher's `FirecrawlClient`: a direct-HTTP REST client rather than a
//! vendored SDK, so error messages and timeouts stay under our control. Enabled iff an API
//! token is configured (`proxy_enabled = token present`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::AnalyserError;

/// HTML returned by a proxy strategy, plus timing for the verdict's `load_time_ms`.
#[derive(Debug, Clone)]
pub struct ProxyPage {
    pub status: u16,
    pub html: String,
    pub response_time_ms: i64,
}

/// Capability: fetch `url` through an external rendering proxy. `user_agent_profile` selects
/// one of [`super::render::USER_AGENT_PROFILES`].
#[async_trait]
pub trait RenderProxy: Send + Sync {
    fn enabled(&self) -> bool;

    async fn fetch(
        &self,
        url: &str,
        user_agent_profile: &str,
        render: bool,
        timeout: Duration,
    ) -> Result<ProxyPage, AnalyserError>;
}

#[derive(Serialize)]
struct ProxyFetchRequest<'a> {
    url: &'a str,
    #[serde(rename = "userAgentProfile")]
    user_agent_profile: &'a str,
    render: bool,
}

#[derive(Deserialize)]
struct ProxyFetchResponse {
    success: bool,
    status: Option<u16>,
    html: Option<String>,
    #[serde(rename = "responseTimeMs")]
    response_time_ms: Option<i64>,
    error: Option<String>,
}

/// REST-backed rendering proxy. Disabled (and never dialled) when no token is configured.
pub struct HttpRenderProxy {
    client: Client,
    api_base: String,
    api_token: Option<String>,
}

impl HttpRenderProxy {
    pub fn new(api_base: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into(),
            api_token,
        }
    }
}

#[async_trait]
impl RenderProxy for HttpRenderProxy {
    fn enabled(&self) -> bool {
        self.api_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    async fn fetch(
        &self,
        url: &str,
        user_agent_profile: &str,
        render: bool,
        timeout: Duration,
    ) -> Result<ProxyPage, AnalyserError> {
        let token = self
            .api_token
            .as_deref()
            .ok_or(AnalyserError::Inconclusive)?;

        let request = ProxyFetchRequest {
            url,
            user_agent_profile,
            render,
        };

        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(format!("{}/fetch", self.api_base))
                .bearer_auth(token)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| AnalyserError::TransientFetch(format!("proxy timed out fetching {url}")))?
        .map_err(|e| AnalyserError::TransientFetch(format!("proxy request failed: {e}")))?;

        let parsed: ProxyFetchResponse = response
            .json()
            .await
            .map_err(|e| AnalyserError::TransientFetch(format!("proxy returned bad json: {e}")))?;

        if !parsed.success {
            let message = parsed.error.unwrap_or_else(|| "proxy fetch failed".into());
            return Err(AnalyserError::TransientFetch(message));
        }

        Ok(ProxyPage {
            status: parsed.status.unwrap_or(0),
            html: parsed.html.unwrap_or_default(),
            response_time_ms: parsed.response_time_ms.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_token() {
        let proxy = HttpRenderProxy::new("https://proxy.example.com", None);
        assert!(!proxy.enabled());
    }

    #[test]
    fn enabled_with_nonempty_token() {
        let proxy = HttpRenderProxy::new("https://proxy.example.com", Some("tok".into()));
        assert!(proxy.enabled());
    }
}
