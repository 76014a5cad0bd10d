//! # CLI Interface
//!
//! Command-line argument structure for `veil-node` using `clap` derive.
//! Three subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// VEIL overlay network daemon.
///
/// Runs one overlay node: listens on the configured transports, replicates
/// authenticated and mailbox data, relays confidential messages, and exposes
/// a status/metrics endpoint for operators.
#[derive(Parser, Debug)]
#[command(
    name = "veil-node",
    about = "VEIL overlay network daemon",
    version,
    propagate_version = true
)]
pub struct VeilNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the VEIL node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the overlay node.
    Run(RunArgs),
    /// Initialize a data directory and generate a fresh identity.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Node data directory (stores, identity, keys). Created on first run.
    #[arg(long, short = 'd', env = "VEIL_DATA_DIR", default_value = ".veil")]
    pub data_dir: PathBuf,

    /// Clearnet P2P listening port.
    #[arg(long, env = "VEIL_P2P_PORT", default_value_t = veil_protocol::config::DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Port for the HTTP status and Prometheus metrics endpoint.
    #[arg(long, env = "VEIL_API_PORT", default_value_t = veil_protocol::config::DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Seed addresses (`host:port`) to bootstrap the clearnet peer group.
    #[arg(long = "seed", env = "VEIL_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// SOCKS5 endpoint of a local Tor daemon (e.g. `127.0.0.1:9050`).
    /// Enables the Tor transport.
    #[arg(long, env = "VEIL_TOR_PROXY")]
    pub tor_proxy: Option<String>,

    /// Externally visible onion address (`x.onion:port`) forwarded to the
    /// local Tor listener. Required when --tor-proxy is set.
    #[arg(long, env = "VEIL_TOR_ADDRESS")]
    pub tor_address: Option<String>,

    /// SOCKS5 endpoint of a local I2P tunnel. Enables the I2P transport.
    #[arg(long, env = "VEIL_I2P_PROXY")]
    pub i2p_proxy: Option<String>,

    /// Externally visible I2P destination (`x.i2p:port`).
    #[arg(long, env = "VEIL_I2P_ADDRESS")]
    pub i2p_address: Option<String>,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "VEIL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "VEIL_DATA_DIR", default_value = ".veil")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        VeilNodeCli::command().debug_assert();
    }
}
