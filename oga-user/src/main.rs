//! OpenGnsys session agent — entry point.
//!
//! ```text
//! oga-user                         Run for the current session
//! oga-user --config <path>         Load a custom config TOML
//! oga-user --user bob --language es
//! oga-user --gen-config            Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oga_ipc::{ClientAgentLink, LocalOperations, Operations};
use oga_user::config::UserConfig;
use oga_user::session::UserSession;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "oga-user", about = "OpenGnsys per-session user agent")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "oga-user.toml")]
    config: PathBuf,

    /// Login name to announce instead of the session's user.
    #[arg(long)]
    user: Option<String>,

    /// Two-letter language to announce instead of the session's locale.
    #[arg(long)]
    language: Option<String>,

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
        let text = toml::to_string_pretty(&UserConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = UserConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("oga-user v{}", env!("CARGO_PKG_VERSION"));

    let operations = Arc::new(LocalOperations);
    let user = cli
        .user
        .or_else(|| operations.current_user())
        .unwrap_or_else(|| "unknown".into());
    let language = cli
        .language
        .or_else(|| operations.session_language())
        .unwrap_or_else(|| "en".into());
    info!("session user: {user} ({language})");

    let link = ClientAgentLink::connect(&config.client).await;
    let session = UserSession::new(link, operations, config.session, user, language);
    let stop = session.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            return;
        }
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let end = session.run().await;
    info!("exiting: {end:?}");

    Ok(())
}
