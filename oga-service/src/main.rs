//! OpenGnsys agent service — entry point.
//!
//! ```text
//! oga-service                  Run in the foreground
//! oga-service --config <path>  Load a custom config TOML
//! oga-service --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oga_service::config::ServiceConfig;
use oga_service::service::AgentService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "oga-service", about = "OpenGnsys agent service and session bus")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "oga-service.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServiceConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = ServiceConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("oga-service v{}", env!("CARGO_PKG_VERSION"));

    let service = AgentService::new(config)?;
    info!("session bus: {}", service.bus_addr().await?);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            return;
        }
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
