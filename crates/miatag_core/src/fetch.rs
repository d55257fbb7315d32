use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use tracing::debug;

use crate::config::MiaConfig;
use crate::error::{MiaError, Result};

/// Somewhere MIA list pages can be read from.
pub trait ListSource {
    fn fetch(&mut self, url: &str) -> Result<String>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct HttpListSourceConfig {
    pub user_agent: String,
    pub timeout: Duration,
}

impl HttpListSourceConfig {
    pub fn from_config(config: &MiaConfig) -> Self {
        Self {
            user_agent: config.user_agent().to_string(),
            timeout: config.timeout(),
        }
    }
}

/// Single-attempt HTTP reader. There are no retries: a failed fetch is
/// reported and the user re-runs.
pub struct HttpListSource {
    client: Client,
    config: HttpListSourceConfig,
    request_count: usize,
}

impl HttpListSource {
    pub fn new(config: HttpListSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| MiaError::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self::with_client(client, config))
    }

    fn with_client(client: Client, config: HttpListSourceConfig) -> Self {
        Self {
            client,
            config,
            request_count: 0,
        }
    }
}

impl ListSource for HttpListSource {
    fn fetch(&mut self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|error| fetch_error(url, format!("invalid URL: {error}")))?;
        self.request_count += 1;
        debug!(%url, "fetching MIA list page");

        let response = self
            .client
            .get(parsed)
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "text/html, text/plain;q=0.9,*/*;q=0.1")
            .send()
            .map_err(|error| {
                let reason = if error.is_timeout() {
                    "timed out".to_string()
                } else {
                    error.to_string()
                };
                fetch_error(url, reason)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(url, format!("HTTP {}", status.as_u16())));
        }
        response
            .text()
            .map_err(|error| fetch_error(url, format!("failed to read body: {error}")))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Resolve an href from a wiki page against the page it came from.
pub fn resolve_link(base_url: &str, href: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    base.join(href.trim()).ok().map(|url| url.to_string())
}

fn fetch_error(url: &str, reason: String) -> MiaError {
    MiaError::Fetch {
        url: url.to_string(),
        reason,
    }
}
