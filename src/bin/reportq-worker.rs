//! Main entry point for a reportq worker process.
//!
//! Starts one worker loop with configuration from environment variables.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reportq::{Config, Database, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting reportq worker");

    let config = Config::from_env()?;
    info!(
        worker_id = %config.worker_id,
        log_dir = %config.log_dir.display(),
        "Loaded configuration"
    );

    std::fs::create_dir_all(&config.log_dir)?;

    let db = Database::connect(&config.database_url).await?;
    info!("Connected to database, migrations complete");

    let worker = Worker::start(config, db);

    info!("Worker started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    worker.shutdown().await?;

    Ok(())
}
