use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gkv_server::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => ServerConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node = gkv_server::start(config).await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    node.abort();
    Ok(())
}
