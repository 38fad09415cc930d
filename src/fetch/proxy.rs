// src/fetch/proxy.rs
//! Third-party fetch-proxy route: `GET {endpoint}?api_key={key}&url={target}`.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use url::Url;

use super::http::map_reqwest;
use super::{classify_status, Fetch, FetchResponse};
use crate::config::pipeline::{FetchSection, ProxySection};
use crate::error::FetchError;

pub struct ProxyFetcher {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl ProxyFetcher {
    pub fn new(endpoint: &str, api_key: String, timeout: Duration) -> Result<Self, FetchError> {
        let endpoint = Url::parse(endpoint).map_err(|e| FetchError::Network {
            url: endpoint.to_string(),
            message: format!("invalid proxy endpoint: {e}"),
            retryable: false,
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| FetchError::Network {
                url: endpoint.to_string(),
                message: format!("building proxy client: {e}"),
                retryable: false,
            })?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    /// Build from config; `None` when no endpoint is configured or the key env var is unset.
    pub fn from_config(proxy: &ProxySection, fetch: &FetchSection) -> Option<Self> {
        let endpoint = proxy.endpoint.as_deref()?;
        let Ok(api_key) = std::env::var(&proxy.api_key_env) else {
            tracing::warn!(target: "fetch", env = %proxy.api_key_env, "proxy endpoint configured but key env var is unset");
            return None;
        };
        // Proxies render the page on their side; give them double the direct budget.
        let timeout = Duration::from_secs(fetch.timeout_secs.saturating_mul(2));
        match Self::new(endpoint, api_key, timeout) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(target: "fetch", error = %e, "proxy disabled");
                None
            }
        }
    }

    pub fn request_url(&self, target: &str) -> Url {
        let mut u = self.endpoint.clone();
        u.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("url", target);
        u
    }
}

#[async_trait]
impl Fetch for ProxyFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        counter!("fetch_requests_total", "route" => "proxy").increment(1);
        let resp = self
            .client
            .get(self.request_url(url))
            .send()
            .await
            .map_err(|e| map_reqwest(url, e))?;
        let status = resp.status().as_u16();
        if let Some(err) = classify_status(url, status) {
            return Err(err);
        }
        let body = resp.text().await.map_err(|e| map_reqwest(url, e))?;
        Ok(FetchResponse {
            url: url.to_string(),
            status,
            body,
            via_proxy: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_query_encoded() {
        let p = ProxyFetcher::new(
            "https://proxy.example/fetch",
            "k3y".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        let u = p.request_url("https://wdwnt.com/2025/03/new-ears/?utm=x&a=b");
        let pairs: Vec<(String, String)> = u
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("api_key".into(), "k3y".into()));
        assert_eq!(
            pairs[1],
            (
                "url".into(),
                "https://wdwnt.com/2025/03/new-ears/?utm=x&a=b".into()
            )
        );
    }

    #[tokio::test]
    async fn unreachable_proxy_error_omits_api_key() {
        let p = ProxyFetcher::new(
            "http://127.0.0.1:1/fetch",
            "SECRETKEY123".into(),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = p.fetch("https://wdwnt.com/feed/").await.unwrap_err();
        let shown = err.to_string();
        assert!(shown.contains("https://wdwnt.com/feed/"), "{shown}");
        assert!(!shown.contains("SECRETKEY123"), "{shown}");
        assert!(!shown.contains("api_key"), "{shown}");
    }
}
