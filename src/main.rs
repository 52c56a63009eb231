//! camrelay: live camera frames relayed to HTTP clients

use std::time::Duration;

use camrelay::supervisor::Supervisor;
use camrelay::{utils, Config};
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camrelay=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camrelay launching...");

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    info!(
        "Loaded {} stream(s) from {}",
        config.streams.len(),
        path.as_deref().unwrap_or("defaults")
    );

    let mut supervisor = Supervisor::start(&config).await?;
    let outcome = supervisor.run(utils::shutdown_signal()).await;

    // Terminate grace plus a forced kill plus the server join, with slack
    utils::arm_watchdog(config.shutdown_timeout() * 2 + Duration::from_secs(2));
    supervisor.shutdown().await;
    info!("camrelay stopped");

    outcome?;
    Ok(())
}
