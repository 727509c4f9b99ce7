//! sniproxy - Main entry point
//!
//! A TLS-terminating, SNI-aware reverse proxy

use anyhow::{Context, Result};
use clap::Parser;
use sniproxy::{ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// sniproxy - TLS-terminating host/path reverse proxy
#[derive(Parser, Debug)]
#[command(name = "sniproxy")]
#[command(author = "sniproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating, SNI-aware reverse proxy")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "SNIPROXY_CONFIG", default_value = "./sniproxy.json")]
    config: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(long, env = "LISTEN_ADDR")]
    listen: Option<SocketAddr>,

    /// tar/tar.gz bundle holding the certificate files, overriding the configuration file
    #[arg(long, env = "SNIPROXY_CERT_ARCHIVE")]
    archive: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting sniproxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ProxyConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(archive) = args.archive {
        // Given on the command line, so relative to the working directory
        config.certificate_archive = Some(std::env::current_dir()?.join(archive));
    }

    // Certificate paths are relative to the configuration file
    let base_dir = args
        .config
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let source = config
        .certificate_source(&base_dir)
        .context("Failed to open certificate source")?;

    let server = ProxyServer::from_config(&config, source.as_ref()).context("Invalid configuration")?;

    info!(
        "Loaded {} certificate(s) and {} route(s)",
        server.certificates().len(),
        server.routes().len()
    );

    let server = Arc::new(server);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {:#}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
