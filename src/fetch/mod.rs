// src/fetch/mod.rs
//! Fetcher: raw content retrieval for feed listings, articles and images pages.
//!
//! `HttpFetcher` talks to sources directly with a browser identity, `ProxyFetcher`
//! goes through the third-party fetch-proxy, and `PolicyFetcher` decides which
//! route to take. A block (403/429) from a blocklisted host is routed through the
//! proxy exactly once; it is never retried directly.

pub mod http;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;

use crate::error::FetchError;

pub use http::HttpFetcher;
pub use proxy::ProxyFetcher;

/// Body of a successful fetch. Always treated as untrusted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub via_proxy: bool,
}

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

pub type DynFetch = Arc<dyn Fetch>;

/// Map a response status to the fetch taxonomy. `None` means success.
pub fn classify_status(url: &str, status: u16) -> Option<FetchError> {
    match status {
        200..=299 => None,
        403 | 429 => Some(FetchError::Blocked {
            url: url.to_string(),
            status,
        }),
        500..=599 => Some(FetchError::network(url, format!("HTTP {status}"))),
        _ => Some(FetchError::Network {
            url: url.to_string(),
            message: format!("HTTP {status}"),
            retryable: false,
        }),
    }
}

/// Host of `url`, lowercased, if it parses.
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// True if `host` equals a listed domain or is a subdomain of one.
pub fn host_matches(host: &str, domains: &[String]) -> bool {
    let host = host.trim_start_matches("www.");
    domains.iter().any(|d| {
        let d = d.trim_start_matches("www.");
        host == d || host.ends_with(&format!(".{d}"))
    })
}

/// Short SHA-256 prefix identifying a URL in logs without echoing it.
pub fn url_tag(url: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(url.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Direct fetch with a proxy route for hosts on the blocklist.
pub struct PolicyFetcher {
    direct: DynFetch,
    proxy: Option<DynFetch>,
    blocked_domains: Vec<String>,
}

impl PolicyFetcher {
    pub fn new(direct: DynFetch, proxy: Option<DynFetch>, blocked_domains: Vec<String>) -> Self {
        Self {
            direct,
            proxy,
            blocked_domains,
        }
    }

    fn on_blocklist(&self, url: &str) -> bool {
        host_of(url).is_some_and(|h| host_matches(&h, &self.blocked_domains))
    }
}

#[async_trait]
impl Fetch for PolicyFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        match self.direct.fetch(url).await {
            Err(FetchError::Blocked { status, .. }) if self.on_blocklist(url) => {
                let Some(proxy) = &self.proxy else {
                    tracing::warn!(target: "fetch", url = %url_tag(url), status, "blocked and no proxy configured");
                    return Err(FetchError::Blocked {
                        url: url.to_string(),
                        status,
                    });
                };
                tracing::info!(target: "fetch", url = %url_tag(url), status, "blocked by known-hostile host, routing via proxy");
                counter!("fetch_proxy_fallbacks_total").increment(1);
                proxy.fetch(url).await
            }
            other => other,
        }
    }
}
