// brokerd: Device control and telemetry broker daemon.
//
// Loads TOML config, assembles the broker with every enabled transport,
// and runs until interrupted.

use std::path::Path;
use tracing::info;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "brokerd starting");

    let cfg = {
        let result = match std::env::args().nth(1) {
            Some(path) => brokerd::config::load_config_from_path(Path::new(&path)),
            None => brokerd::config::load_config(),
        };
        match result {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        }
    };

    let daemon = match brokerd::start(cfg).await {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("FATAL: failed to start broker: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("FATAL: failed to listen for shutdown signal: {}", e);
        std::process::exit(1);
    }
    info!("shutdown signal received");
    daemon.shutdown().await;
}
