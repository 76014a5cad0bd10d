//! # Transports
//!
//! One overlay, several ways to move bytes. A [`Transport`] turns an
//! [`Address`] into a TCP stream and a local port into a listener; everything
//! above this module (handshake, nodes, storage gossip) is transport-blind.
//!
//! Three implementations exist:
//!
//! - **Clearnet**: plain TCP. Fast, cheap, and tells the whole world your IP.
//! - **Tor**: outbound through the Tor SOCKS5 proxy; inbound via a hidden
//!   service the local Tor router forwards to our loopback listener. The
//!   externally visible address is the `.onion` address from the config.
//! - **I2P**: same shape as Tor, pointed at the local I2P SOCKS tunnel.
//!
//! The proxied transports deliberately do not talk the Tor control protocol
//! or the I2P SAM bridge. Provisioning hidden services is an operator
//! concern; the overlay only needs a proxy endpoint and the resulting
//! external address.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::node::address::Address;

// ---------------------------------------------------------------------------
// TransportType
// ---------------------------------------------------------------------------

/// The transport families a peer can be reached over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    /// Direct TCP on the public internet.
    Clear,
    /// Tor hidden services via the local Tor SOCKS proxy.
    Tor,
    /// I2P destinations via the local I2P SOCKS tunnel.
    I2p,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Clear => write!(f, "clear"),
            TransportType::Tor => write!(f, "tor"),
            TransportType::I2p => write!(f, "i2p"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while binding or dialing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("socks5 proxy refused the connection: {0}")]
    ProxyRefused(String),

    #[error("no proxy endpoint configured for {0} transport")]
    MissingProxy(TransportType),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Per-transport configuration, supplied at construction. There is no
/// runtime reload; changing transports means restarting the node.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub transport_type: TransportType,
    /// Host to bind listeners on. Loopback for proxied transports (the
    /// router forwards to us), a routable interface for clearnet.
    pub bind_host: String,
    /// SOCKS5 proxy endpoint for the Tor/I2P transports. Unused on clearnet.
    pub proxy: Option<Address>,
    /// The externally reachable address for proxied transports (the
    /// `.onion`/`.i2p` name the router publishes for our listener).
    pub external_address: Option<Address>,
    /// How long a dial may take, proxy handshake included.
    pub dial_timeout: Duration,
}

impl TransportConfig {
    /// Clearnet defaults binding all interfaces.
    pub fn clear() -> Self {
        Self {
            transport_type: TransportType::Clear,
            bind_host: "0.0.0.0".to_string(),
            proxy: None,
            external_address: None,
            dial_timeout: Duration::from_secs(10),
        }
    }

    /// Loopback clearnet config for tests and single-machine setups.
    pub fn localhost() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            ..Self::clear()
        }
    }

    /// A proxied transport (Tor or I2P) behind the given SOCKS5 endpoint.
    pub fn proxied(
        transport_type: TransportType,
        proxy: Address,
        external_address: Option<Address>,
    ) -> Self {
        Self {
            transport_type,
            bind_host: "127.0.0.1".to_string(),
            proxy: Some(proxy),
            external_address,
            // Tor circuits are slow to build; don't give up early.
            dial_timeout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// The seam between the overlay and the operating system's sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Bind a listener on the configured host. Returns the listener and the
    /// address peers should use to reach it (for proxied transports that is
    /// the configured external address, not the loopback bind).
    async fn bind(&self, port: u16) -> Result<(TcpListener, Address), TransportError>;

    /// Open a stream to the given peer address.
    async fn dial(&self, address: &Address) -> Result<TcpStream, TransportError>;
}

/// Construct the transport implementation for a config.
pub fn create_transport(config: TransportConfig) -> Arc<dyn Transport> {
    match config.transport_type {
        TransportType::Clear => Arc::new(ClearNetTransport { config }),
        TransportType::Tor | TransportType::I2p => Arc::new(ProxiedTransport { config }),
    }
}

// ---------------------------------------------------------------------------
// Clearnet
// ---------------------------------------------------------------------------

/// Plain TCP transport.
pub struct ClearNetTransport {
    config: TransportConfig,
}

#[async_trait]
impl Transport for ClearNetTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn bind(&self, port: u16) -> Result<(TcpListener, Address), TransportError> {
        let listener = TcpListener::bind((self.config.bind_host.as_str(), port)).await?;
        let local = listener.local_addr()?;
        let address = Address::new(local.ip().to_string(), local.port());
        info!(%address, "clearnet listener bound");
        Ok((listener, address))
    }

    async fn dial(&self, address: &Address) -> Result<TcpStream, TransportError> {
        let timeout = self.config.dial_timeout;
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| TransportError::DialTimeout(timeout))??;
        stream.set_nodelay(true)?;
        debug!(peer = %address, "clearnet connection established");
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Proxied (Tor / I2P)
// ---------------------------------------------------------------------------

/// Transport that reaches peers through a local SOCKS5 proxy (the Tor
/// daemon's SocksPort or an I2P SOCKS tunnel).
pub struct ProxiedTransport {
    config: TransportConfig,
}

#[async_trait]
impl Transport for ProxiedTransport {
    fn transport_type(&self) -> TransportType {
        self.config.transport_type
    }

    async fn bind(&self, port: u16) -> Result<(TcpListener, Address), TransportError> {
        // The router forwards hidden-service traffic to this loopback
        // listener. Peers never see the loopback address.
        let listener = TcpListener::bind((self.config.bind_host.as_str(), port)).await?;
        let local = listener.local_addr()?;
        let address = self
            .config
            .external_address
            .clone()
            .unwrap_or_else(|| Address::new(local.ip().to_string(), local.port()));
        info!(transport = %self.transport_type(), %address, "proxied listener bound");
        Ok((listener, address))
    }

    async fn dial(&self, address: &Address) -> Result<TcpStream, TransportError> {
        let proxy = self
            .config
            .proxy
            .as_ref()
            .ok_or(TransportError::MissingProxy(self.config.transport_type))?;
        let timeout = self.config.dial_timeout;
        let stream = tokio::time::timeout(timeout, socks5_connect(proxy, address))
            .await
            .map_err(|_| TransportError::DialTimeout(timeout))??;
        debug!(transport = %self.transport_type(), peer = %address, "proxied connection established");
        Ok(stream)
    }
}

/// Minimal SOCKS5 CONNECT (RFC 1928, no authentication). The destination is
/// always sent as a domain name so the proxy resolves `.onion`/`.i2p` names
/// itself; leaking name resolution to the local resolver would deanonymize
/// the dial.
async fn socks5_connect(proxy: &Address, destination: &Address) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    // Greeting: version 5, one auth method, "no authentication".
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(TransportError::ProxyRefused(format!(
            "auth negotiation failed: {:02x?}",
            reply
        )));
    }

    // CONNECT request with ATYP=3 (domain name).
    let host = destination.host.as_bytes();
    if host.len() > 255 {
        return Err(TransportError::ProxyRefused("hostname too long".to_string()));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host);
    request.extend_from_slice(&destination.port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(TransportError::ProxyRefused(format!(
            "connect rejected with code {:#04x}",
            head[1]
        )));
    }
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(TransportError::ProxyRefused(format!(
                "unknown address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}
