// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

pub const DEFAULT_AI_CONFIG_PATH: &str = "config/ai.json";
pub const ENV_AI_CONFIG_PATH: &str = "AI_CONFIG_PATH";

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_daily_limit() -> u32 {
    500
}
fn default_cache_dir() -> String {
    "cache/ai".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    /// "openai" (case-insensitive); anything else yields a disabled client.
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Real (non-cached) inference calls allowed per UTC day.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "openai".to_string(),
            model: default_model(),
            daily_limit: default_daily_limit(),
            api_key: String::new(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl AiConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut cfg: AiConfig = serde_json::from_str(&data)?;

        // Normalize provider
        cfg.provider = cfg.provider.trim().to_lowercase();

        // Resolve api key if "ENV"; a disabled config never needs one.
        if cfg.enabled && cfg.api_key.trim().eq_ignore_ascii_case("env") {
            cfg.api_key = match cfg.provider.as_str() {
                "openai" => env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var"))?,
                other => anyhow::bail!("Unsupported provider in config: {other}"),
            };
        }

        if cfg.daily_limit == 0 {
            cfg.daily_limit = default_daily_limit();
        }

        Ok(cfg)
    }

    /// `$AI_CONFIG_PATH` or `config/ai.json`; a missing file means AI disabled.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var(ENV_AI_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_AI_CONFIG_PATH.into());
        if !Path::new(&path).exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }
}
