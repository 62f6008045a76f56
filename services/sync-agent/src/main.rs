//! cfgsync Agent
//!
//! Reads line-delimited JSON release events from stdin and keeps each
//! configured application's configuration files on the published release.
//!
//! ## Architecture
//!
//! - **Event reader**: forwards stdin lines to the scheduler
//! - **Scheduler**: decodes events and queues jobs per application
//! - **App runtimes**: one control loop per application applying releases

use std::sync::Arc;

use anyhow::{Context, Result};
use cfgsync_agent::{AppRegistry, Config, FetcherTable, Scheduler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVENT_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        data_dir = %config.data_dir.display(),
        apps = config.apps.len(),
        limiter_weight = config.download.limiter_weight,
        object_store = config.object_store.is_some(),
        "Starting cfgsync agent"
    );
    if config.apps.is_empty() {
        warn!("No applications configured; every event will be rejected");
    }

    let fetchers = Arc::new(FetcherTable::from_config(&config).context("failed to build fetchers")?);
    let registry = Arc::new(AppRegistry::new(&config, fetchers).context("failed to build app registry")?);
    let scheduler = Scheduler::new(Arc::clone(&registry), config.retry.policy());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtimes = registry.start(shutdown_rx.clone());

    // Forward stdin lines as events
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let reader_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if events_tx.send(line.into_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Event input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read event input");
                    break;
                }
            }
        }
    });

    // Run until Ctrl-C; a closed input keeps already queued work going
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = async {
            scheduler.run(events_rx, shutdown_rx.clone()).await;
            std::future::pending::<()>().await
        } => {}
    }

    // Signal shutdown to all runtimes
    let _ = shutdown_tx.send(true);
    reader_handle.abort();

    info!("Waiting for app runtimes to stop...");
    for handle in runtimes {
        if let Err(e) = handle.await {
            error!(error = %e, "App runtime panicked");
        }
    }

    for app_id in registry.app_ids() {
        if let Some(stats) = registry.stats(app_id) {
            info!(
                app_id = %app_id,
                applied = stats.applied,
                failed_attempts = stats.failed_attempts,
                abandoned = stats.abandoned,
                superseded = stats.superseded,
                "App runtime summary"
            );
        }
    }

    info!("cfgsync agent shutdown complete");
    Ok(())
}
