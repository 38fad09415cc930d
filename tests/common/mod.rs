// tests/common/mod.rs
// Shared fakes for integration tests: scripted fetcher, scripted inference, fixtures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use merch_radar::error::{FetchError, InferenceError};
use merch_radar::extract::inference::InferenceFuture;
use merch_radar::extract::InferenceClient;
use merch_radar::fetch::{Fetch, FetchResponse};
use merch_radar::model::{Source, SourceKind};

/// URL -> canned result. Unknown URLs fail with a non-retryable 404.
#[derive(Default)]
pub struct ScriptedFetch {
    routes: Mutex<HashMap<String, Result<String, FetchError>>>,
    hits: Mutex<HashMap<String, usize>>,
    via_proxy: bool,
}

impl ScriptedFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful response is flagged as coming through the proxy.
    pub fn proxied() -> Self {
        Self {
            via_proxy: true,
            ..Self::default()
        }
    }

    pub fn page(self, url: &str, body: &str) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.to_string()));
        self
    }

    pub fn fail(self, url: &str, err: FetchError) -> Self {
        self.routes.lock().unwrap().insert(url.to_string(), Err(err));
        self
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetch for ScriptedFetch {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let route = self.routes.lock().unwrap().get(url).cloned();
        match route {
            Some(Ok(body)) => Ok(FetchResponse {
                url: url.to_string(),
                status: 200,
                body,
                via_proxy: self.via_proxy,
            }),
            Some(Err(e)) => Err(e),
            None => Err(FetchError::Network {
                url: url.to_string(),
                message: "HTTP 404".into(),
                retryable: false,
            }),
        }
    }
}

/// Inference fake keyed by the article title line of the prompt.
/// Unknown titles get an empty item list.
#[derive(Default)]
pub struct ScriptedInference {
    replies: Mutex<HashMap<String, String>>,
    pub calls: AtomicUsize,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, title: &str, json: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(title.to_string(), json.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceClient for ScriptedInference {
    fn complete<'a>(&'a self, prompt: &'a str) -> InferenceFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let title = prompt
            .lines()
            .find_map(|l| l.strip_prefix("Title: "))
            .unwrap_or_default()
            .trim()
            .to_string();
        let reply = self.replies.lock().unwrap().get(&title).cloned();
        Box::pin(async move {
            match reply {
                Some(r) if r == "!transport" => Err(InferenceError::Transport("connection reset".into())),
                Some(r) => Ok(r),
                None => Ok(r#"{"items":[]}"#.to_string()),
            }
        })
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

pub fn feed_source(id: &str, url: &str, park: Option<&str>) -> Source {
    Source {
        id: id.to_string(),
        name: id.to_string(),
        url: url.to_string(),
        kind: SourceKind::Feed,
        park: park.map(str::to_string),
        poll_interval_secs: 3600,
        active: true,
        last_checked_at: None,
        last_error: None,
    }
}

/// Minimal RSS document with `(title, link)` items.
pub fn rss(items: &[(&str, &str)]) -> String {
    let mut body = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title>"#);
    for (title, link) in items {
        body.push_str(&format!(
            "<item><title>{title}</title><link>{link}</link><description>summary of {title}</description></item>"
        ));
    }
    body.push_str("</channel></rss>");
    body
}

pub fn shared<T>(v: T) -> Arc<T> {
    Arc::new(v)
}

/// Delegating fetcher that runs `hook` the first time `url` is requested.
pub struct HookedFetch {
    inner: Arc<ScriptedFetch>,
    url: String,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HookedFetch {
    pub fn new(inner: Arc<ScriptedFetch>, url: &str, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            url: url.to_string(),
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }
}

#[async_trait]
impl Fetch for HookedFetch {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        if url == self.url {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.inner.fetch(url).await
    }
}
