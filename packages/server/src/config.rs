use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
///
/// Defaults mirror the execution plane's own defaults (§6): a value configured here
/// simply overrides what `link-analyser` would otherwise assume.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// N workers draining the priority queue. Default 5.
    pub worker_concurrency: usize,
    /// Rendering-proxy API token. Proxy fallback (§4.3 step 5) is enabled iff this is set.
    pub render_proxy_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            worker_concurrency: env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("WORKER_CONCURRENCY must be a valid number")?,
            render_proxy_token: env::var("RENDER_PROXY_TOKEN").ok(),
        })
    }
}
