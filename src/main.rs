use anyhow::{Context, Result};
use fsm_exec::{config, server};
use tracing::info;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// `RUST_LOG` wins over the configured level; a bad configured level is fatal.
fn init_tracing(configured_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level: LevelFilter = configured_level.parse().map_err(|_| {
                anyhow::anyhow!(
                    "Invalid log level: '{}'. Valid levels: error, warn, info, debug, trace",
                    configured_level
                )
            })?;
            EnvFilter::default().add_directive(level.into())
        }
    };

    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration comes first: it decides the log level.
    let config = config::load()
        .await
        .context("Failed to load configuration")?;

    init_tracing(&config.server.logs.level)?;

    info!(
        machine = ?config.machine,
        backend = ?config.storage.backend,
        "🚀 Starting fsm-exec server"
    );

    server::run(config).await?;

    Ok(())
}
