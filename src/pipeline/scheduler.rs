// src/pipeline/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{RunCoordinator, RunScope};

pub const ENV_SCHEDULE_INTERVAL_SECS: &str = "SCHEDULE_INTERVAL_SECS";

/// `SCHEDULE_INTERVAL_SECS` as a duration; unset, zero or unparsable disables the scheduler.
pub fn interval_from_env() -> Option<Duration> {
    std::env::var(ENV_SCHEDULE_INTERVAL_SECS)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Spawn a loop that runs a full pass every `every` until `cancel` fires.
/// Per-source cadence still applies, so a short tick only picks up due sources.
pub fn spawn_scheduler(
    coordinator: Arc<RunCoordinator>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(target: "pipeline", "scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match coordinator.run(RunScope::All, &cancel).await {
                Ok(report) => tracing::info!(
                    target: "pipeline",
                    created = report.items_created,
                    merged = report.items_merged,
                    errors = report.errors.len(),
                    "scheduled run tick"
                ),
                Err(e) => tracing::error!(target: "pipeline", error = %e, "scheduled run failed"),
            }
        }
    })
}
