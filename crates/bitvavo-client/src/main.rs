//! Bitvavo streaming client - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Streaming market-data client for the Bitvavo v2 API
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via BITVAVO_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection
    bitvavo_ws::init_crypto();

    let args = Args::parse();

    bitvavo_telemetry::init_logging()?;

    info!("Starting bitvavo-client v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > BITVAVO_CONFIG > default
    let config_path = args
        .config
        .or_else(|| std::env::var("BITVAVO_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let mut config = bitvavo_client::AppConfig::from_file(&config_path)?;
    config.apply_env();
    info!(
        markets = ?config.markets,
        ws_url = %config.websocket.url,
        rest_url = %config.rest.base_url,
        "Configuration loaded"
    );

    let app = bitvavo_client::Application::new(config)?;
    app.run().await?;

    Ok(())
}
