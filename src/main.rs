//! merch-radar service entrypoint.
//! Boots the Axum HTTP server (trigger, admin and metrics routes) and the
//! background scheduler on Shuttle.

use std::time::Duration;

use merch_radar::metrics::Metrics;
use merch_radar::pipeline::scheduler::{interval_from_env, spawn_scheduler};
use merch_radar::{create_router, init_tracing, Runtime};
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;

const SNAPSHOT_EVERY: Duration = Duration::from_secs(60);

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let rt = Runtime::bootstrap().await?;
    let shutdown = CancellationToken::new();

    match interval_from_env() {
        Some(every) => {
            tracing::info!(target: "pipeline", secs = every.as_secs(), "scheduler enabled");
            spawn_scheduler(rt.coordinator.clone(), every, shutdown.clone());
        }
        None => tracing::info!(target: "pipeline", "scheduler disabled; use POST /process"),
    }
    if rt.spawn_snapshot_task(SNAPSHOT_EVERY, shutdown.clone()).is_some() {
        tracing::info!(target: "pipeline", "store snapshots enabled");
    }

    let mut router = create_router(rt.app_state(shutdown));
    match Metrics::init() {
        Ok(m) => router = router.merge(m.router()),
        Err(e) => tracing::warn!(target: "api", error = %e, "metrics endpoint disabled"),
    }

    Ok(router.into())
}
