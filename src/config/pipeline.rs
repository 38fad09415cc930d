// src/config/pipeline.rs
//! Pipeline settings loaded from TOML (`config/pipeline.toml` by default).
//!
//! Every section is optional; a missing file yields defaults. The dedup policy
//! values can be overridden from the environment for quick tuning against real
//! title corpora.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{normalize_label, Source, SourceKind};

pub const DEFAULT_PIPELINE_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_PIPELINE_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_DEDUP_THRESHOLD: &str = "DEDUP_THRESHOLD";
pub const ENV_DEDUP_MIN_TOKEN_LEN: &str = "DEDUP_MIN_TOKEN_LEN";

pub const DEFAULT_DEDUP_THRESHOLD: f32 = 0.7;
pub const DEFAULT_MIN_TOKEN_LEN: usize = 3;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dedup: DedupSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub images: ImageSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupSection {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Tokens shorter than this are ignored by fuzzy matching.
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
    /// Write a merged audit row when a fuzzy match folds a candidate away.
    #[serde(default = "default_true")]
    pub audit_merged_rows: bool,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_token_len: default_min_token_len(),
            audit_merged_rows: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// Overrides the built-in browser user agent.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Hosts known to refuse direct fetches; a block from these goes through the proxy.
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            user_agent: None,
            blocked_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// e.g. "https://api.scraperapi.com/"; unset disables the proxy route.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_proxy_key_env")]
    pub api_key_env: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_proxy_key_env(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSection {
    #[serde(default = "default_min_dimension")]
    pub min_dimension: u32,
    #[serde(default = "default_image_denylist")]
    pub denylist: Vec<String>,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            min_dimension: default_min_dimension(),
            denylist: default_image_denylist(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    #[serde(default = "default_max_articles_per_source")]
    pub max_articles_per_source: usize,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_concurrent_sources: default_max_concurrent_sources(),
            max_articles_per_source: default_max_articles_per_source(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

/// A `[[sources]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub park: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl SourceEntry {
    pub fn into_source(self) -> Source {
        Source {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            url: self.url,
            kind: self.kind,
            park: normalize_label(self.park.as_deref()),
            poll_interval_secs: self.poll_interval_secs,
            active: self.active,
            last_checked_at: None,
            last_error: None,
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_DEDUP_THRESHOLD
}
fn default_min_token_len() -> usize {
    DEFAULT_MIN_TOKEN_LEN
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u8 {
    2
}
fn default_proxy_key_env() -> String {
    "FETCH_PROXY_API_KEY".to_string()
}
fn default_min_dimension() -> u32 {
    100
}
fn default_image_denylist() -> Vec<String> {
    ["icon", "avatar", "logo", "gravatar", "emoji"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_concurrent_sources() -> usize {
    4
}
fn default_max_articles_per_source() -> usize {
    25
}
fn default_max_content_chars() -> usize {
    12_000
}
fn default_poll_interval_secs() -> u64 {
    3600
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_threshold_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
}

impl PipelineConfig {
    /// Resolve the path from `PIPELINE_CONFIG_PATH` or the default, load it, and
    /// apply env overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(ENV_PIPELINE_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PIPELINE_CONFIG_PATH));
        let mut cfg = if path.exists() {
            Self::from_path(&path)?
        } else {
            tracing::info!(path = %path.display(), "pipeline config not found, using defaults");
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing pipeline config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: PipelineConfig = toml::from_str(s)?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(t) = parse_threshold_env(std::env::var(ENV_DEDUP_THRESHOLD).ok()) {
            self.dedup.threshold = t;
        }
        if let Some(n) = std::env::var(ENV_DEDUP_MIN_TOKEN_LEN)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.dedup.min_token_len = n;
        }
        self.sanitize();
    }

    fn sanitize(&mut self) {
        if !self.dedup.threshold.is_finite() || !(0.0..=1.0).contains(&self.dedup.threshold) {
            self.dedup.threshold = DEFAULT_DEDUP_THRESHOLD;
        }
        self.run.max_concurrent_sources = self.run.max_concurrent_sources.max(1);
        self.fetch.timeout_secs = self.fetch.timeout_secs.max(1);
        self.fetch.blocked_domains = self
            .fetch
            .blocked_domains
            .iter()
            .map(|d| d.trim().trim_start_matches("*.").to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
    }

    /// Configured sources converted to model rows.
    pub fn source_rows(&self) -> Vec<Source> {
        self.sources.iter().cloned().map(SourceEntry::into_source).collect()
    }
}
