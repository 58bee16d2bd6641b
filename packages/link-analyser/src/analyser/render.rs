//! Direct-render capability (spec §4.3 step 1, §6 "Rendering engine").
//!
//! The crate orchestrates a rendering capability rather than embedding one; this module's
//! `HttpRenderEngine` is the bundled default — a plain HTTP fetch with manual redirect
//! following and `scraper`-based DOM access. It does not execute JavaScript, so it inherits the
//! same "static HTML only" caveat the teacher's own `SimpleScraper` documents; a production
//! deployment that needs JS-rendered pages swaps in a browser-backed `RenderEngine`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::AnalyserError;

/// User-agent rotation used across retry attempts (spec §4.3 step 1 and step 5).
pub const USER_AGENT_PROFILES: &[(&str, &str)] = &[
    (
        "desktop-chrome",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ),
    (
        "desktop-firefox-like",
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    ),
    (
        "mobile-safari",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    ),
];

/// A navigated page: the primary document's status/headers plus the HTML the DOM pass runs
/// against. `final_url` is the effective URL after redirects (capped at 5 hops).
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub primary_status: u16,
    pub final_url: String,
    pub x_robots_tag: Option<String>,
    pub html: String,
    pub load_time_ms: i64,
}

/// Capability: navigate to `url` and return the primary document. Implementations own their
/// rendering context for the duration of the call and must release it on every exit path
/// (spec §5) — for an HTTP-only implementation that's just the `reqwest::Client`'s connection,
/// but the contract still applies to e.g. a headless-browser-backed implementation.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn render(
        &self,
        url: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<RenderedPage, AnalyserError>;
}

/// Default `RenderEngine`: reqwest with a manual, capped redirect walk so the primary
/// document's status/headers are always the *final* hop's, even past reqwest's own redirect
/// policy.
pub struct HttpRenderEngine {
    client: Client,
}

impl HttpRenderEngine {
    pub fn new() -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpRenderEngine {
    fn default() -> Self {
        Self::new()
    }
}

const MAX_REDIRECT_HOPS: u8 = 5;

#[async_trait]
impl RenderEngine for HttpRenderEngine {
    async fn render(
        &self,
        url: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<RenderedPage, AnalyserError> {
        let start = std::time::Instant::now();
        let mut current = url.to_string();

        for hop in 0..=MAX_REDIRECT_HOPS {
            let is_last_allowed_hop = hop == MAX_REDIRECT_HOPS;

            let response = tokio::time::timeout(
                timeout,
                self.client
                    .get(&current)
                    .header(reqwest::header::USER_AGENT, user_agent)
                    .send(),
            )
            .await
            .map_err(|_| AnalyserError::TransientFetch(format!("timed out fetching {current}")))?
            .map_err(|e| classify_reqwest_error(&current, &e))?;

            let status = response.status();

            if status.is_redirection() && !is_last_allowed_hop {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AnalyserError::TransientFetch(format!(
                            "redirect from {current} with no Location header"
                        ))
                    })?;
                current = resolve_redirect(&current, location)?;
                continue;
            }

            if status.as_u16() == 403 {
                return Err(AnalyserError::Blocked403);
            }
            if !status.is_success() && !status.is_redirection() {
                return Err(AnalyserError::HttpError(status.as_u16()));
            }

            let x_robots_tag = response
                .headers()
                .get("x-robots-tag")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let primary_status = status.as_u16();
            let html = response
                .text()
                .await
                .map_err(|e| AnalyserError::TransientFetch(e.to_string()))?;

            return Ok(RenderedPage {
                primary_status,
                final_url: current,
                x_robots_tag,
                html,
                load_time_ms: start.elapsed().as_millis() as i64,
            });
        }

        // Redirect chain exceeded MAX_REDIRECT_HOPS while still redirecting: the spec says to
        // use the 5th hop as the final URL. `current` already holds it.
        Err(AnalyserError::TransientFetch(format!(
            "redirect chain exceeded {MAX_REDIRECT_HOPS} hops, stopped at {current}"
        )))
    }
}

fn classify_reqwest_error(url: &str, e: &reqwest::Error) -> AnalyserError {
    if e.is_timeout() {
        AnalyserError::TransientFetch(format!("timeout fetching {url}"))
    } else if e.is_connect() {
        AnalyserError::TransientFetch(format!("connection error fetching {url}: {e}"))
    } else if let Some(status) = e.status() {
        if status.as_u16() == 403 {
            AnalyserError::Blocked403
        } else {
            AnalyserError::HttpError(status.as_u16())
        }
    } else {
        AnalyserError::TransientFetch(e.to_string())
    }
}

fn resolve_redirect(base: &str, location: &str) -> Result<String, AnalyserError> {
    let base_url = url::Url::parse(base)
        .map_err(|e| AnalyserError::TransientFetch(format!("invalid base url {base}: {e}")))?;
    base_url
        .join(location)
        .map(|u| u.to_string())
        .map_err(|e| AnalyserError::TransientFetch(format!("invalid redirect target: {e}")))
}
