//! Keep cache volumes under their size ceiling.
//!
//! Configured entirely from the environment; see
//! [`CleanerConfig::from_env`]. Exits non-zero on any failure so the
//! scheduler that runs it periodically sees the error.

use std::process::ExitCode;

use retrieval_worker::config::{CleanerConfig, env_lookup};
use retrieval_worker::janitor::Janitor;
use retrieval_worker::logging::{LogFormat, init_logging};
use retrieval_worker::volume::parse_data_volumes_config;
use tracing::{error, info};

async fn run() -> anyhow::Result<()> {
    let config = CleanerConfig::from_env()?;
    let volumes = parse_data_volumes_config(config.data_volumes_config.as_deref(), &env_lookup)?;
    info!(
        volumes = volumes.len(),
        max_size = config.max_size,
        method = %config.method,
        use_database = config.use_database,
        "Cleaner configured"
    );

    let janitor = Janitor::connect(config).await?;
    janitor.run(&volumes).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(e) = init_logging(LogFormat::from_env_or(LogFormat::Pretty)) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    info!("Running cache cleaner: {}", chrono::Utc::now().to_rfc3339());
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Cache cleaner crashed: {:?}", e);
            ExitCode::FAILURE
        }
    }
}
