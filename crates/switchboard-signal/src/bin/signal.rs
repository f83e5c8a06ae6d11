//! Switchboard signaling relay
//!
//! # Usage
//!
//! ```bash
//! # Defaults (0.0.0.0:8443, 30s keepalive, /health)
//! switchboard-signal
//!
//! # Custom port and keepalive
//! switchboard-signal --port 9000 --keepalive-timeout 10
//!
//! # From a TOML config file, flags still win
//! switchboard-signal --config /etc/switchboard/config.toml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use switchboard_core::Config;
use switchboard_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "switchboard-signal")]
#[command(about = "Switchboard signaling relay for two-party session negotiation")]
#[command(version)]
struct Args {
    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Keepalive timeout in seconds
    #[arg(short, long)]
    keepalive_timeout: Option<u64>,

    /// Health check route
    #[arg(long)]
    health_path: Option<String>,

    /// TOML configuration file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::default(),
        };

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.keepalive_timeout {
            config.keepalive_timeout_secs = secs;
        }
        if let Some(path) = self.health_path {
            config.health_path = path;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Args::parse().into_config()?;
    let addr = config.listen_addr();

    info!("Starting Switchboard signaling relay");

    // The registry never survives a relay restart: a fatal accept-loop
    // error gets a fresh server with empty state
    loop {
        let server = SignalServer::new(config.clone());

        tokio::select! {
            result = server.serve(addr) => {
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!("Accept loop failed: {}, restarting", e);
                        server.shutdown();
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                server.shutdown();
                break;
            }
        }
    }

    Ok(())
}
