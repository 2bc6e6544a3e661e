//! Relay node binary
//!
//! Usage: shroud-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a configuration template
//!   -h, --help           Print help information

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shroud::server::{RelayServer, ServerConfigFile};

/// Relay node for shroud tunnels.
#[derive(Parser, Debug)]
#[command(name = "shroud-server", version, about = "Encrypted tunnel relay node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a configuration template and exit
    #[arg(short, long)]
    generate: bool,

    /// Listen address (overrides the file)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides the file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared password (overrides the file)
    #[arg(long)]
    password: Option<String>,

    /// KDF salt as hex (overrides the file)
    #[arg(long)]
    salt_hex: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&args.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if args.generate {
        return generate_config();
    }

    run_server(args).await
}

fn generate_config() -> anyhow::Result<()> {
    let template = ServerConfigFile::default();

    println!("# shroud relay node configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!("#");
    println!("# Without a password every run uses a fresh random key.");
    println!("# With a password, set kdf_salt_hex to a value unique to this deployment:");
    println!("# password = \"change-me\"");
    println!("# token_ttl_secs = 120");
    println!();
    println!("{}", template.to_toml()?);

    Ok(())
}

async fn run_server(args: Args) -> anyhow::Result<()> {
    let mut file = match &args.config {
        Some(path) => ServerConfigFile::load(path)?,
        None => ServerConfigFile::default(),
    };

    if let Some(host) = args.host {
        file.listen_addr = host;
    }
    if let Some(port) = args.port {
        file.listen_port = port;
    }
    if let Some(password) = args.password {
        file.password = Some(password);
    }
    if let Some(salt_hex) = args.salt_hex {
        file.kdf_salt_hex = salt_hex;
    }

    let config = file.to_config()?;
    tracing::info!(
        "Starting relay node on {} (max {} sessions)",
        config.bind_addr(),
        config.max_sessions
    );

    let server = Arc::new(RelayServer::new(config)?);
    let listener = server.bind().await?;

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_server.shutdown();
    });

    server.serve(listener).await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
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
