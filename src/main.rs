//! toh - TCP over HTTP
//!
//! Carry TCP connections through an HTTP-only path: run `toh server` next to
//! the target network and `toh client` next to the application.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{
    build_client_config, build_server_config, load_config_file, ClientArgs, ConfigFile, ServerArgs,
};
use std::path::PathBuf;
use toh_client::TunnelClient;
use toh_server::ProxyServer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// toh - Tunnel TCP connections over plain HTTP requests
#[derive(Parser, Debug)]
#[command(name = "toh")]
#[command(about = "toh - Tunnel TCP connections over plain HTTP requests")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Path to YAML configuration file
    #[arg(short, long, global = true, env = "TOH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Terminate tunnel frames and connect to targets
    #[command(long_about = r#"
Accept tunnel frames over HTTP and open one TCP connection per session
to the target named by the client.

EXAMPLES:
  # Listen on port 9000, frames posted to /proxy
  toh server --port 9000

  # Custom frame path
  toh server --port 8080 --path /tunnel

ENVIRONMENT VARIABLES:
  TOH_PORT   HTTP listen port
  TOH_PATH   Frame endpoint path
    "#)]
    Server {
        /// HTTP listen port [default: 80]
        #[arg(long, env = "TOH_PORT")]
        port: Option<u16>,

        /// Frame endpoint path [default: /proxy]
        #[arg(short, long, env = "TOH_PATH")]
        path: Option<String>,
    },

    /// Accept local connections and tunnel them to a server
    #[command(long_about = r#"
Listen for local TCP connections and carry each one to the tunnel server
as HTTP frames. The server dials the target on the client's behalf.

EXAMPLES:
  # Reach mysql:3306 behind the server through local port 13306
  toh client --port 13306 \
    --url http://tunnel.example.com:9000/proxy \
    --target mysql:3306

ENVIRONMENT VARIABLES:
  TOH_PORT       Local listen port
  TOH_URL        Proxy endpoint of the tunnel server
  TOH_TARGET     Target address as seen from the server
  TOH_MAX_CHAIN  Continuation frames allowed per response
    "#)]
    Client {
        /// Local listen port [default: 9090]
        #[arg(short, long, env = "TOH_PORT")]
        port: Option<u16>,

        /// Proxy endpoint of the tunnel server (e.g., http://host:9000/proxy)
        #[arg(short, long, env = "TOH_URL")]
        url: Option<String>,

        /// Target address as seen from the server [default: mysql:3306]
        #[arg(short, long, env = "TOH_TARGET")]
        target: Option<String>,

        /// Continuation frames allowed after one response [default: 64]
        #[arg(long, env = "TOH_MAX_CHAIN")]
        max_chain: Option<usize>,
    },
}

/// Setup logging; `RUST_LOG` takes precedence over the CLI level
fn setup_logging(log_level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { log_level };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                    _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
                }
            }
            _ => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.verbose);

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Server { port, path } => {
            let config = build_server_config(ServerArgs { port, path }, file.server);

            info!("Listen address: {}", config.listen_addr);
            info!("Frame path: {}", config.path);

            ProxyServer::new(config)
                .run(shutdown_signal())
                .await
                .context("Proxy server failed")?;
        }
        Commands::Client {
            port,
            url,
            target,
            max_chain,
        } => {
            let args = ClientArgs {
                port,
                url,
                target,
                max_chain,
            };
            let config = build_client_config(args, file.client)?;

            info!("Listen address: {}", config.listen_addr);
            info!("Proxy url: {}", config.url);
            info!("Target: {}", config.target);

            TunnelClient::new(config)
                .context("Failed to create proxy client")?
                .run(shutdown_signal())
                .await
                .context("Proxy client failed")?;
        }
    }

    info!("toh stopped");
    Ok(())
}
