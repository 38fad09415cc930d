//! Text-inference collaborator: provider abstraction + file cache + daily limit.

use std::fs;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::AiConfig;
use crate::error::InferenceError;

pub type InferenceFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, InferenceError>> + Send + 'a>>;

/// Trait object used by the extractor. Returns the raw JSON text of the reply.
pub trait InferenceClient: Send + Sync {
    fn complete<'a>(&'a self, prompt: &'a str) -> InferenceFuture<'a>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynInference = Arc<dyn InferenceClient>;

/// Build a client according to config and environment.
///
/// * `AI_TEST_MODE=mock` gives the deterministic mock, still behind the cache and limit.
/// * A disabled config (or an unknown provider) gives `DisabledClient`.
/// * Otherwise the OpenAI provider wrapped with caching + daily limit.
pub fn client_from_config(config: &AiConfig) -> DynInference {
    let cache_dir = PathBuf::from(&config.cache_dir);
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(CachingClient::new(MockProvider, cache_dir, config.daily_limit));
    }

    if !config.enabled {
        return Arc::new(DisabledClient);
    }

    match config.provider.as_str() {
        "openai" => match OpenAiProvider::new(&config.model, config.api_key.clone()) {
            Ok(p) => Arc::new(CachingClient::new(p, cache_dir, config.daily_limit)),
            Err(e) => {
                tracing::warn!(target: "extract", error = %e, "openai provider unavailable, inference disabled");
                Arc::new(DisabledClient)
            }
        },
        other => {
            tracing::warn!(target: "extract", provider = %other, "unsupported inference provider, inference disabled");
            Arc::new(DisabledClient)
        }
    }
}

// ------------------------------------------------------------
// Providers
// ------------------------------------------------------------

/// Low-level provider doing the real remote call. Kept separate so the same
/// caching wrapper serves production and tests.
pub trait Provider: Send + Sync + 'static {
    fn fetch<'a>(&'a self, prompt: &'a str) -> InferenceFuture<'a>;
    fn name(&self) -> &'static str;
}

const SYSTEM_PROMPT: &str = "You read theme park blog articles and list the NEW merchandise they announce. \
Respond with JSON only, shaped as {\"items\":[{\"title\":string,\"description\":string,\"category\":string|null,\
\"price\":number|null,\"park\":string|null,\"limited_edition\":boolean}]}. \
Use the product name as the title. Return {\"items\":[]} when the article announces no merchandise.";

/// OpenAI Chat Completions with JSON response format.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(model: &str, api_key: String) -> Result<Self, InferenceError> {
        if api_key.trim().is_empty() {
            return Err(InferenceError::Transport("missing api key".into()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(45))
            .build()
            .map_err(|e| InferenceError::Transport(format!("building client: {e}")))?;
        Ok(Self {
            http,
            api_key,
            model: model.to_string(),
        })
    }
}

impl Provider for OpenAiProvider {
    fn fetch<'a>(&'a self, prompt: &'a str) -> InferenceFuture<'a> {
        Box::pin(async move {
            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct ResponseFormat {
                #[serde(rename = "type")]
                kind: &'static str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                max_tokens: u32,
                response_format: ResponseFormat,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: Option<String>,
            }

            let req = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: SYSTEM_PROMPT,
                    },
                    Msg {
                        role: "user",
                        content: prompt,
                    },
                ],
                temperature: 0.0,
                max_tokens: 1200,
                response_format: ResponseFormat {
                    kind: "json_object",
                },
            };

            let resp = self
                .http
                .post("https://api.openai.com/v1/chat/completions")
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
                .map_err(|e| InferenceError::Transport(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(InferenceError::Transport(format!("HTTP {status}")));
            }
            let body: Resp = resp
                .json()
                .await
                .map_err(|e| InferenceError::Transport(format!("decoding reply: {e}")))?;
            Ok(body
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default())
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Always fails with `Disabled`; used when inference is switched off.
pub struct DisabledClient;

impl InferenceClient for DisabledClient {
    fn complete<'a>(&'a self, _prompt: &'a str) -> InferenceFuture<'a> {
        Box::pin(async { Err(InferenceError::Disabled) })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic provider for local runs: reports one item named after the
/// article title line of the prompt.
#[derive(Clone, Copy, Default)]
pub struct MockProvider;

impl Provider for MockProvider {
    fn fetch<'a>(&'a self, prompt: &'a str) -> InferenceFuture<'a> {
        let title = prompt
            .lines()
            .find_map(|l| l.strip_prefix("Title: "))
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        Box::pin(async move {
            let items = if title.is_empty() {
                serde_json::json!([])
            } else {
                serde_json::json!([{
                    "title": title,
                    "description": "",
                    "category": null,
                    "price": null,
                    "park": null,
                    "limited_edition": false,
                }])
            };
            Ok(serde_json::json!({ "items": items }).to_string())
        })
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Caching client wrapper (file cache + daily limit)
// ------------------------------------------------------------

pub struct CachingClient<P: Provider> {
    inner: P,
    cache_dir: PathBuf,
    daily_limit_max: u32,
    counter: Mutex<DailyCounter>,
}

impl<P: Provider> CachingClient<P> {
    pub fn new(inner: P, cache_dir: PathBuf, daily_limit_max: u32) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            tracing::warn!(target: "extract", dir = %cache_dir.display(), error = %e, "inference cache dir unavailable");
        }
        let counter = Mutex::new(load_daily_counter(&cache_dir).unwrap_or_default());
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter,
        }
    }

    /// Real calls made today.
    pub fn calls_today(&self) -> u32 {
        let g = self.counter.lock().unwrap_or_else(|p| p.into_inner());
        if g.is_expired() {
            0
        } else {
            g.count
        }
    }

    async fn complete_impl(&self, prompt: &str) -> Result<String, InferenceError> {
        // Cache hits never count against the limit.
        let key = cache_key(self.inner.name(), prompt);
        if let Some(hit) = read_cache_file(&self.cache_dir, &key) {
            tracing::debug!(target: "extract", key = %&key[..12], "inference cache hit");
            return Ok(hit.reply);
        }

        {
            let mut g = self.counter.lock().unwrap_or_else(|p| p.into_inner());
            if g.is_expired() {
                g.reset_to_today();
                let _ = save_daily_counter(&self.cache_dir, &g);
            }
            if g.count >= self.daily_limit_max {
                return Err(InferenceError::Limited(self.daily_limit_max));
            }
        }

        let reply = self.inner.fetch(prompt).await?;
        if let Err(e) = write_cache_file(&self.cache_dir, &key, &CachedReply { reply: reply.clone() }) {
            tracing::debug!(target: "extract", error = %e, "inference cache write failed");
        }
        let mut g = self.counter.lock().unwrap_or_else(|p| p.into_inner());
        g.count = g.count.saturating_add(1);
        let _ = save_daily_counter(&self.cache_dir, &g);
        Ok(reply)
    }
}

impl<P: Provider> InferenceClient for CachingClient<P> {
    fn complete<'a>(&'a self, prompt: &'a str) -> InferenceFuture<'a> {
        Box::pin(self.complete_impl(prompt))
    }
    fn provider_name(&self) -> &'static str {
        self.inner.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedReply {
    reply: String,
}

fn cache_key(provider: &str, prompt: &str) -> String {
    let mut h = Sha256::new();
    h.update(provider.as_bytes());
    h.update([0u8]);
    h.update(SYSTEM_PROMPT.as_bytes());
    h.update([0u8]);
    h.update(prompt.as_bytes());
    h.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cache_file(dir: &Path, key: &str) -> Option<CachedReply> {
    let s = fs::read_to_string(cache_path(dir, key)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(contents)?;
    fs::rename(tmp, path)
}

fn write_cache_file(dir: &Path, key: &str, value: &CachedReply) -> io::Result<()> {
    let json = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&cache_path(dir, key), &json)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}

impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}

impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    Utc::now().date_naive().to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

fn load_daily_counter(dir: &Path) -> io::Result<DailyCounter> {
    let s = fs::read_to_string(counter_path(dir))?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_daily_counter(dir: &Path, dc: &DailyCounter) -> io::Result<()> {
    let json = serde_json::to_vec(dc).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&counter_path(dir), &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: Arc<AtomicU32>,
    }

    impl Provider for Counting {
        fn fetch<'a>(&'a self, _prompt: &'a str) -> InferenceFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(r#"{"items":[]}"#.to_string()) })
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn cache_hits_skip_provider_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let client = CachingClient::new(
            Counting {
                calls: calls.clone(),
            },
            dir.path().to_path_buf(),
            1,
        );

        assert!(client.complete("Title: A").await.is_ok());
        assert!(client.complete("Title: A").await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.calls_today(), 1);

        assert_eq!(
            client.complete("Title: B").await,
            Err(InferenceError::Limited(1))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn daily_count_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        {
            let c = CachingClient::new(
                Counting {
                    calls: calls.clone(),
                },
                dir.path().to_path_buf(),
                5,
            );
            c.complete("Title: one").await.unwrap();
        }
        let c = CachingClient::new(Counting { calls }, dir.path().to_path_buf(), 5);
        assert_eq!(c.calls_today(), 1);
    }

    #[tokio::test]
    async fn mock_echoes_title_line() {
        let reply = MockProvider
            .fetch("Title: Figment Popcorn Bucket\nURL: https://x\n\nbody")
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["items"][0]["title"], "Figment Popcorn Bucket");
    }

    #[tokio::test]
    async fn disabled_client_reports_disabled() {
        assert_eq!(
            DisabledClient.complete("x").await,
            Err(InferenceError::Disabled)
        );
    }
}
