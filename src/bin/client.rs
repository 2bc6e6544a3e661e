//! Tunnel client binary
//!
//! Usage: shroud-client <COMMAND>
//!
//! Commands:
//!   list     List configured relay locations
//!   connect  Run a SOCKS5 proxy through a named location
//!   socks    Run a SOCKS5 proxy through a relay address
//!   forward  Forward a local port to a fixed target through a relay

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use shroud::client::{ClientConfig, LocationCatalog, TunnelClient};
use shroud::protocol::TargetAddr;
use shroud::proxy::{run_port_forward, run_socks5_proxy};
use shroud::DEFAULT_SOCKS_PORT;

#[derive(Parser, Debug)]
#[command(name = "shroud-client", version, about = "Encrypted tunnel client")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured relay locations
    List {
        /// Location catalog
        #[arg(short, long, default_value = "servers.json")]
        config: PathBuf,
    },

    /// Run a local SOCKS5 proxy through a named location
    Connect {
        /// Location id from the catalog
        #[arg(short, long)]
        location: String,

        /// Location catalog
        #[arg(short, long, default_value = "servers.json")]
        config: PathBuf,

        /// Shared password (overrides the catalog entry)
        #[arg(long)]
        password: Option<String>,

        /// Local SOCKS5 port
        #[arg(short, long, default_value_t = DEFAULT_SOCKS_PORT)]
        port: u16,
    },

    /// Run a local SOCKS5 proxy through a relay address
    Socks {
        /// Relay address, host[:port]
        #[arg(short, long)]
        relay: String,

        /// Shared password
        #[arg(long)]
        password: Option<String>,

        /// Local listen address
        #[arg(short, long, default_value = "127.0.0.1:1080")]
        listen: SocketAddr,
    },

    /// Forward a local port to a fixed target through a relay
    Forward {
        /// Relay address, host[:port]
        #[arg(short, long)]
        relay: String,

        /// Destination, host:port
        #[arg(short, long)]
        target: String,

        /// Shared password
        #[arg(long)]
        password: Option<String>,

        /// Local listen address; port 0 picks a free port
        #[arg(short, long, default_value = "127.0.0.1:0")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&cli.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match cli.command {
        Command::List { config } => list_locations(&config),
        Command::Connect {
            location,
            config,
            password,
            port,
        } => {
            let catalog = LocationCatalog::load(&config)?;
            let entry = catalog.resolve(&location)?;
            tracing::info!(
                "Connecting via {} ({}) at {}:{}",
                location,
                entry.country,
                entry.host,
                entry.port
            );
            let listen = SocketAddr::from(([127, 0, 0, 1], port));
            run_socks(entry.client_config(password), listen).await
        }
        Command::Socks {
            relay,
            password,
            listen,
        } => {
            let config = ClientConfig::from_relay_addr(&relay)?.with_password(password);
            run_socks(config, listen).await
        }
        Command::Forward {
            relay,
            target,
            password,
            listen,
        } => {
            let config = ClientConfig::from_relay_addr(&relay)?.with_password(password);
            let target = TargetAddr::parse(&target)?;
            run_forward(config, target, listen).await
        }
    }
}

fn list_locations(path: &Path) -> anyhow::Result<()> {
    let catalog = LocationCatalog::load(path)
        .with_context(|| format!("loading locations from {}", path.display()))?;

    if catalog.is_empty() {
        println!("No locations configured in {}", path.display());
        return Ok(());
    }

    println!("Available locations:");
    for (id, location) in catalog.iter() {
        let status = if location.is_configured(id) {
            format!("{}:{}", location.host, location.port)
        } else {
            "not configured".to_string()
        };
        println!(
            "  {:<12} {:<16} {:<24} {}",
            id, location.country, status, location.description
        );
    }

    Ok(())
}

async fn run_socks(config: ClientConfig, listen: SocketAddr) -> anyhow::Result<()> {
    let client = Arc::new(TunnelClient::new(config)?);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding SOCKS5 listener on {}", listen))?;

    let shutdown = spawn_signal_handler();
    run_socks5_proxy(listener, client, shutdown).await?;
    Ok(())
}

async fn run_forward(
    config: ClientConfig,
    target: TargetAddr,
    listen: SocketAddr,
) -> anyhow::Result<()> {
    let client = Arc::new(TunnelClient::new(config)?);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding forward listener on {}", listen))?;

    let shutdown = spawn_signal_handler();
    run_port_forward(listener, client, target, shutdown).await?;
    Ok(())
}

/// Token cancelled on Ctrl+C or SIGTERM.
fn spawn_signal_handler() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });
    shutdown
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
