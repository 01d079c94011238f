use std::net::SocketAddr;

use clap::Parser;
use tracing::info;

use overlord::cli::{Cli, Command};
use overlord::config::BrokerConfig;
use overlord::logging::{self, LogConfig};
use overlord::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the broker.
        None => run_server(None, None).await,
        Some(Command::Start {
            ghost_bind,
            http_bind,
        }) => run_server(ghost_bind, http_bind).await,

        Some(Command::Version) => {
            println!("overlordd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(
    ghost_bind: Option<SocketAddr>,
    http_bind: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let mut config = BrokerConfig::load()?;
    if let Some(addr) = ghost_bind {
        config.ghost_bind = addr;
    }
    if let Some(addr) = http_bind {
        config.http_bind = addr;
    }

    let handle = server::run_broker(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

/// Initialize logging based on the OVERLORD_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("OVERLORD_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        LogConfig::development()
    } else {
        LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}
