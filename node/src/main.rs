// Copyright (c) 2026 VEIL Contributors. MIT License.
// See LICENSE for details.

//! # VEIL Overlay Daemon
//!
//! Entry point for the `veil-node` binary. Parses CLI arguments, loads (or
//! creates) the node identity, wires the storage and transport stacks, and
//! serves the operator HTTP endpoint until a shutdown signal arrives.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the overlay node
//! - `init`    — initialize the data directory and generate an identity
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

use veil_protocol::crypto::KeyBundle;
use veil_protocol::data_service::DataService;
use veil_protocol::identity::IdentityStore;
use veil_protocol::inventory::InventoryConfig;
use veil_protocol::node::{Address, NodeConfig};
use veil_protocol::peer_group::PeerGroupConfig;
use veil_protocol::service_node::ServiceNodeConfig;
use veil_protocol::service_nodes::{ServiceNodesByTransport, TransportSetup};
use veil_protocol::storage::StorageService;
use veil_protocol::transport::{TransportConfig, TransportType};

use cli::{Commands, InitArgs, RunArgs, VeilNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

/// File inside the data directory holding the identity secrets: two hex
/// lines, the Ed25519 seed and the X25519 secret.
const KEY_FILE: &str = "node_key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = VeilNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the full overlay node: transports, replication, confidential
/// messaging, and the operator HTTP endpoint.
async fn run_node(args: RunArgs) -> Result<()> {
    logging::init_logging(
        "veil_node=info,veil_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        p2p_port = args.p2p_port,
        api_port = args.api_port,
        data_dir = %args.data_dir.display(),
        "starting veil-node"
    );

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data directory: {}", args.data_dir.display()))?;

    // --- Identity ---
    let key_bundle = Arc::new(load_or_generate_keys(&args.data_dir)?);
    tracing::info!(identity = %key_bundle.public_key().to_hex(), "identity loaded");

    // --- Storage ---
    let db_path = args.data_dir.join("db");
    let storage = Arc::new(
        StorageService::open(&db_path)
            .with_context(|| format!("failed to open storage at {}", db_path.display()))?,
    );
    let data_service = DataService::new(storage);

    let identity_store = Arc::new(
        IdentityStore::open_at(args.data_dir.join("identity"))
            .context("failed to open identity store")?,
    );

    // --- Transports ---
    let setups = build_transport_setups(&args)?;
    let transport_count = setups.len();
    let facade = ServiceNodesByTransport::new(
        setups,
        key_bundle,
        Some(data_service.clone()),
        identity_store,
    );

    let results = facade.get_initialized_default_node_by_transport().await;
    let mut initialized = 0usize;
    for (transport, result) in &results {
        match result {
            Ok(node) => {
                initialized += 1;
                tracing::info!(
                    %transport,
                    address = ?node.my_address().map(|a| a.to_full()),
                    "transport initialized"
                );
            }
            Err(e) => tracing::warn!(%transport, error = %e, "transport failed to initialize"),
        }
    }
    if initialized == 0 {
        bail!("no transport initialized ({transport_count} configured)");
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());
    node_metrics.initialized_transports.set(initialized as i64);
    spawn_gauge_refresher(facade.clone(), data_service.clone(), node_metrics.clone());

    // --- Status API ---
    let app_state = api::AppState {
        facade: facade.clone(),
        data_service: data_service.clone(),
        metrics: node_metrics,
        started_at: chrono::Utc::now(),
    };
    let router = api::build_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(("127.0.0.1", args.api_port))
        .await
        .with_context(|| format!("failed to bind status API on port {}", args.api_port))?;
    tracing::info!(port = args.api_port, "status API listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, router).await {
            tracing::error!(error = %e, "status API server failed");
        }
    });

    // --- Run until signalled ---
    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    facade.shutdown().await;
    data_service.storage().shutdown();
    tracing::info!("shutdown complete");
    Ok(())
}

/// Clearnet always; Tor and I2P when a proxy endpoint is configured.
fn build_transport_setups(args: &RunArgs) -> Result<Vec<TransportSetup>> {
    let seeds: BTreeSet<Address> = args
        .seeds
        .iter()
        .map(|s| parse_address(s))
        .collect::<Result<_>>()?;

    let mut setups = vec![TransportSetup {
        node_config: NodeConfig::new(TransportConfig::clear()),
        service_config: ServiceNodeConfig::all(),
        peer_group_config: PeerGroupConfig::default(),
        inventory_config: InventoryConfig::default(),
        seed_addresses: seeds,
        listen_port: args.p2p_port,
    }];

    if let Some(proxy) = &args.tor_proxy {
        let Some(external) = &args.tor_address else {
            bail!("--tor-proxy requires --tor-address");
        };
        setups.push(proxied_setup(
            TransportType::Tor,
            parse_address(proxy)?,
            parse_address(external)?,
        ));
    }
    if let Some(proxy) = &args.i2p_proxy {
        let Some(external) = &args.i2p_address else {
            bail!("--i2p-proxy requires --i2p-address");
        };
        setups.push(proxied_setup(
            TransportType::I2p,
            parse_address(proxy)?,
            parse_address(external)?,
        ));
    }
    Ok(setups)
}

fn proxied_setup(transport: TransportType, proxy: Address, external: Address) -> TransportSetup {
    TransportSetup {
        node_config: NodeConfig::new(TransportConfig::proxied(transport, proxy, Some(external))),
        service_config: ServiceNodeConfig::all(),
        peer_group_config: PeerGroupConfig::default(),
        inventory_config: InventoryConfig::default(),
        seed_addresses: BTreeSet::new(),
        listen_port: 0,
    }
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_full(s).with_context(|| format!("invalid address: {s}"))
}

/// Keep the coarse gauges roughly current. Five seconds is plenty for
/// operator dashboards.
fn spawn_gauge_refresher(
    facade: Arc<ServiceNodesByTransport>,
    data_service: Arc<DataService>,
    metrics: Arc<NodeMetrics>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let mut connections = 0usize;
            for transport in facade.transports() {
                if let Some(service_node) = facade.service_node(transport) {
                    if let Some(node) = service_node.default_node() {
                        connections += node.connection_count();
                    }
                }
            }
            metrics.connected_peers.set(connections as i64);
            metrics
                .stored_entries
                .set(data_service.storage().total_entries() as i64);
        }
    });
}

/// Initialize a data directory and print the fresh identity to stdout.
fn init_node(args: InitArgs) -> Result<()> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data directory: {}", args.data_dir.display()))?;
    let key_path = args.data_dir.join(KEY_FILE);
    if key_path.exists() {
        bail!("data directory already initialized: {}", key_path.display());
    }
    let bundle = generate_and_store_keys(&key_path)?;
    println!(
        "{}",
        serde_json::json!({
            "data_dir": args.data_dir.display().to_string(),
            "public_key": bundle.public_key().to_hex(),
            "address_book_key": bundle.public_key().to_base58(),
        })
    );
    Ok(())
}

fn load_or_generate_keys(data_dir: &Path) -> Result<KeyBundle> {
    let key_path = data_dir.join(KEY_FILE);
    if !key_path.exists() {
        return generate_and_store_keys(&key_path);
    }
    let content = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read key file: {}", key_path.display()))?;
    let mut lines = content.lines();
    let signing = decode_key_line(lines.next())?;
    let encryption = decode_key_line(lines.next())?;
    Ok(KeyBundle::from_secrets(&signing, &encryption))
}

fn generate_and_store_keys(key_path: &Path) -> Result<KeyBundle> {
    let bundle = KeyBundle::generate();
    let (signing, encryption) = bundle.to_secret_bytes();
    let content = format!("{}\n{}\n", hex::encode(signing), hex::encode(encryption));
    std::fs::write(key_path, content)
        .with_context(|| format!("failed to write key file: {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .context("failed to restrict key file permissions")?;
    }
    tracing::info!(path = %key_path.display(), "generated new identity");
    Ok(bundle)
}

fn decode_key_line(line: Option<&str>) -> Result<[u8; 32]> {
    let line = line.context("key file is truncated")?;
    let bytes = hex::decode(line.trim()).context("key file contains invalid hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file line has the wrong length"))
}

fn print_version() {
    println!(
        "veil-node {} (wire protocol version {})",
        env!("CARGO_PKG_VERSION"),
        veil_protocol::config::PROTOCOL_VERSION
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_keys(dir.path()).unwrap();
        let second = load_or_generate_keys(dir.path()).unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.encryption_public_key(), second.encryption_public_key());
    }

    #[test]
    fn truncated_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEY_FILE), "deadbeef\n").unwrap();
        assert!(load_or_generate_keys(dir.path()).is_err());
    }

    #[test]
    fn parse_address_accepts_host_port() {
        assert!(parse_address("seed.veilnetwork.io:8940").is_ok());
        assert!(parse_address("nonsense").is_err());
    }
}
