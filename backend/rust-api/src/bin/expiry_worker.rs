use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::fmt::init;

use examroom_api::{
    config::{Config, StoreBackend},
    services::{expiry_worker::ExpiryWorker, AppState},
};

/// Standalone sweeper for deployments that run API replicas without the
/// embedded worker.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let config = Config::load().context("Failed to load configuration")?;
    if config.store_backend == StoreBackend::Memory {
        anyhow::bail!("expiry-worker needs a shared store; set STORE_BACKEND=mongo");
    }

    let interval = config.worker_interval();
    let app_state = Arc::new(
        AppState::new(config)
            .await
            .context("Failed to initialize app state")?,
    );

    let worker = ExpiryWorker::new(app_state.sessions.clone(), interval);
    worker.run().await?;

    Ok(())
}
