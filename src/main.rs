//! pgrelay: a transaction-pooling PostgreSQL proxy.
//!
//! # Usage
//!
//! ```text
//! pgrelay --config pgrelay.toml
//! pgrelay --listen 0.0.0.0:6432 --dsn postgres://app:secret@db/orders
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use pgrelay::{ProxyConfig, Server};

#[derive(Parser)]
#[command(name = "pgrelay", about = "Transaction-pooling PostgreSQL proxy")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to accept clients on (overrides the config file).
    #[arg(long)]
    listen: Option<String>,

    /// Backend connection string (overrides the config file).
    #[arg(long)]
    dsn: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pgrelay=debug")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_address = listen;
    }
    if let Some(dsn) = cli.dsn {
        config.dsn = dsn;
    }

    info!(
        listen = %config.listen_address,
        max_open = config.pool.max_open,
        max_idle = config.pool.max_idle,
        "starting pgrelay"
    );

    let server = Server::bind(&config).await?;
    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!("pgrelay stopped");
    Ok(())
}
