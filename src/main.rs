//! Standalone workspace SSH server.
//!
//! Runs the embedded SSH server on its own, driven by a TOML configuration
//! file. The embedding agent normally constructs [`workspace_sshd::Server`]
//! directly; this binary exists for development and for workspaces that run
//! the server as a separate process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use workspace_sshd::{FileConfig, Server};

/// Workspace SSH server - terminates SSH for a remote development agent
#[derive(Parser, Debug)]
#[command(name = "workspace-sshd", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/workspace-sshd/config.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let config = FileConfig::default();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut config = FileConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!("Starting workspace-sshd");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Block file transfer: {}", config.block_file_transfer);

    let server = Server::new(config.runtime_config());
    server
        .update_host_signer(config.host_key_seed)
        .context("Failed to install host key")?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            server.shutdown(Duration::from_secs(30)).await?;
        }
    }

    Ok(())
}
