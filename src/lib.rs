// src/lib.rs
// Public library surface for the service binary, the one-shot runner and integration tests.

pub mod api;
pub mod config;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod images;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::pipeline::{RunCoordinator, RunReport, RunScope};
pub use crate::store::{MemoryStore, Store};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AiConfig, PipelineConfig};
use crate::notify::{notifier_from_env, NotificationDispatcher};

pub const ENV_STORE_SNAPSHOT_PATH: &str = "STORE_SNAPSHOT_PATH";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// Install the global tracing subscriber. `LOG_FORMAT=json` selects JSON lines,
/// anything else the compact formatter. Safe to call more than once.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("merch_radar=info,warn"));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

/// Everything a process needs to run the pipeline, wired from config + env.
pub struct Runtime {
    pub store: Arc<MemoryStore>,
    pub coordinator: Arc<RunCoordinator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub pipeline_cfg: PipelineConfig,
    pub snapshot_path: Option<PathBuf>,
}

impl Runtime {
    /// Load configuration, open (or restore) the store and seed configured sources.
    pub async fn bootstrap() -> anyhow::Result<Self> {
        let pipeline_cfg = PipelineConfig::load().context("loading pipeline config")?;
        let ai_cfg = AiConfig::load().context("loading ai config")?;

        let snapshot_path = std::env::var(ENV_STORE_SNAPSHOT_PATH)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let store = match &snapshot_path {
            Some(p) => Arc::new(MemoryStore::load_snapshot(p)?),
            None => Arc::new(MemoryStore::new()),
        };

        pipeline::seed_sources(store.as_ref(), &pipeline_cfg).await?;

        let dyn_store: Arc<dyn Store> = store.clone();
        let coordinator = Arc::new(RunCoordinator::from_config(
            dyn_store.clone(),
            &pipeline_cfg,
            &ai_cfg,
        )?);
        let dispatcher = Arc::new(NotificationDispatcher::new(dyn_store, notifier_from_env()));

        Ok(Self {
            store,
            coordinator,
            dispatcher,
            pipeline_cfg,
            snapshot_path,
        })
    }

    /// Write the store snapshot if persistence is enabled.
    pub fn persist(&self) -> anyhow::Result<()> {
        if let Some(p) = &self.snapshot_path {
            self.store.save_snapshot(p)?;
        }
        Ok(())
    }

    /// Periodically persist the store until `cancel` fires (one last save on the way out).
    pub fn spawn_snapshot_task(&self, every: Duration, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let path = self.snapshot_path.clone()?;
        let store = self.store.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                let stop = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = ticker.tick() => false,
                };
                if let Err(e) = store.save_snapshot(&path) {
                    tracing::warn!(target: "pipeline", error = %e, "snapshot save failed");
                }
                if stop {
                    break;
                }
            }
        }))
    }

    pub fn app_state(&self, shutdown: CancellationToken) -> AppState {
        AppState::new(
            self.coordinator.clone(),
            self.dispatcher.clone(),
            AppState::secret_from_env(),
            shutdown,
        )
    }
}
