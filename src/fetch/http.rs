// src/fetch/http.rs
//! Direct HTTP fetcher with a browser identity.
//!
//! Several merch blogs return 403 to default clients, so requests carry a real
//! browser User-Agent plus the Accept headers a browser would send.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, UPGRADE_INSECURE_REQUESTS};
use reqwest::Client;

use super::{classify_status, url_tag, Fetch, FetchResponse};
use crate::config::pipeline::FetchSection;
use crate::error::FetchError;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_retries: u8,
    backoff_base: Duration,
}

impl HttpFetcher {
    pub fn new(cfg: &FetchSection) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/rss+xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

        let user_agent = cfg
            .user_agent
            .clone()
            .unwrap_or_else(|| BROWSER_USER_AGENT.to_string());

        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(cfg.timeout_secs.min(10)))
            .redirect(reqwest::redirect::Policy::limited(5))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("building http client: {e}"),
                retryable: false,
            })?;

        Ok(Self {
            client,
            max_retries: cfg.max_retries,
            backoff_base: Duration::from_millis(500),
        })
    }

    /// Shorter backoff for tests.
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn attempt(&self, url: &str) -> Result<FetchResponse, FetchError> {
        counter!("fetch_requests_total", "route" => "direct").increment(1);
        let resp = self.client.get(url).send().await.map_err(|e| map_reqwest(url, e))?;
        let status = resp.status().as_u16();
        if let Some(err) = classify_status(url, status) {
            return Err(err);
        }
        let body = resp.text().await.map_err(|e| map_reqwest(url, e))?;
        Ok(FetchResponse {
            url: url.to_string(),
            status,
            body,
            via_proxy: false,
        })
    }
}

pub(crate) fn map_reqwest(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        // reqwest echoes the request URL, which carries the proxy key.
        FetchError::network(url, e.without_url())
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.attempt(url).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    tracing::debug!(target: "fetch", url = %url_tag(url), attempt, error = %e, "transient fetch failure, retrying");
                    tokio::time::sleep(self.backoff_base * (1u32 << (attempt - 1).min(6))).await;
                }
                Err(e) => {
                    tracing::warn!(target: "fetch", url = %url_tag(url), attempt, error = %e, "fetch failed");
                    return Err(e);
                }
            }
        }
    }
}
