//! Scribe collaboration server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ws://127.0.0.1:9090/collab/{room_id}, anonymous guests refused
//! scribe-server
//!
//! # Load a TOML configuration and override the port
//! scribe-server --config scribe.toml --port 9000
//! ```

use clap::Parser;
use scribe_collab::{CollabConfig, CollabServer, StaticTokenAuthenticator};
use std::path::PathBuf;
use std::sync::Arc;

/// Realtime collaborative editing server
#[derive(Parser, Debug)]
#[command(name = "scribe-server")]
#[command(about = "Realtime collaborative editing server")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides the configuration)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Allow connections without a token
    #[arg(long)]
    allow_anonymous: bool,

    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            CollabConfig::load(path)?
        }
        None => CollabConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.allow_anonymous {
        config.auth.allow_anonymous = true;
    }

    let authenticator = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));
    if !config.auth.allow_anonymous && config.auth.tokens.is_empty() {
        log::warn!("No tokens configured and anonymous access disabled; every connection will be refused");
    }

    let server = CollabServer::new(config, authenticator)?;
    log::info!("Scribe server starting on {}", server.config().bind_addr());

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
