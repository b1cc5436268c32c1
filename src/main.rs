use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use kiln::discover::SystemDiscovery;
use kiln::model::store::ModelStore;
use kiln::runner::spawner::SubprocessSpawner;
use kiln::sched::{Scheduler, SchedulerConfig};
use kiln::server::{self, AppState};
use kiln::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load(&Settings::default_path());
    tracing::info!(
        "Starting kiln (models={}, keep_alive={}s, max_runners={})",
        settings.models_dir().display(),
        settings.keep_alive_secs,
        settings.max_runners,
    );

    let discovery = Arc::new(SystemDiscovery::new(settings.visible_devices.clone()));
    let spawner = Arc::new(SubprocessSpawner::new(settings.runner_bin.clone()));
    let scheduler = Scheduler::new(SchedulerConfig::from(&settings), discovery, spawner);

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        store: ModelStore::new(settings.models_dir()),
        client: reqwest::Client::new(),
    });

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received interrupt, draining");
        })
        .await?;

    scheduler.shutdown(settings.shutdown_timeout()).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
