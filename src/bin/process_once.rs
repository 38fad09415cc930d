//! One processing pass from the command line; prints the run report as JSON.
//!
//! Usage: `cargo run --bin process_once [SOURCE_ID]`

use anyhow::Context;
use merch_radar::{init_tracing, RunScope, Runtime};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let rt = Runtime::bootstrap().await?;
    let scope = match std::env::args().nth(1) {
        Some(id) => RunScope::Source(id),
        None => RunScope::All,
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = rt.coordinator.run(scope, &cancel).await?;
    rt.persist().context("saving store snapshot")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
