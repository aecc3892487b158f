//! kangaroo: SSH forwarding gateway.
//!
//! Serves SSH `direct-tcpip` channels and lets each one through only if the
//! ordered address policy allows the (source, destination) pair and, where the
//! policy demands it, the destination proves to be on the local link.

mod config;
mod gateway;
mod server;

use clap::Parser;
use config::ServerConfig;
use gateway::ProbeStrategy;
use server::KangarooServer;
use std::path::PathBuf;
use tracing::{error, info};

/// kangaroo: policy-gated SSH forwarding gateway
#[derive(Parser, Debug)]
#[command(name = "kangaroo", version, about = "Policy-gated SSH forwarding gateway")]
struct Cli {
    /// Config file path (JSON, or TOML by extension)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    addr: Option<String>,

    /// Adjacency prober: neighbor or ttl
    #[arg(long)]
    prober: Option<ProbeStrategy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting kangaroo");

    // Load server config (file + CLI overrides)
    let config_path = cli.config.as_ref().map(PathBuf::from);
    let server_config = match ServerConfig::load(
        config_path.as_deref(),
        cli.port,
        cli.addr.as_deref(),
        cli.prober,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match KangarooServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("kangaroo stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
