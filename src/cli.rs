//! CLI subcommand definitions.
//!
//! Uses clap derive:
//! - `start` (default) -- start the broker
//! - `version` -- print build/version info

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

/// Overlord fleet-management broker.
#[derive(Parser, Debug)]
#[command(
    name = "overlordd",
    version = env!("CARGO_PKG_VERSION"),
    about = "Overlord — fleet-management broker for ghost agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker (default when no subcommand is given).
    Start {
        /// Address for the ghost TCP listener (overrides config).
        #[arg(long)]
        ghost_bind: Option<SocketAddr>,

        /// Address for the operator HTTP/WS front-end (overrides config).
        #[arg(long)]
        http_bind: Option<SocketAddr>,
    },

    /// Print version information.
    Version,
}
