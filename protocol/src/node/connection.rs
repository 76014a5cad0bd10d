//! Established transport links.
//!
//! A [`Connection`] is one authorized TCP stream to a peer, created only
//! after a successful handshake. The write half lives here behind an async
//! mutex, which is what gives the overlay its per-connection ordering
//! guarantee: one connection, one ordered stream of envelopes. The read
//! half is consumed by the node's reader task at registration time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

use crate::config::now_millis;
use crate::envelope::{write_envelope, NetworkEnvelope};

use super::capability::{Capability, NetworkLoad};
use super::ConnectionError;

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Why a connection was torn down. Logged and passed to disconnect
/// listeners; never sent to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// No traffic inside the socket timeout.
    IdleTimeout,
    /// The peer landed on the ban list while connected.
    PeerBanned,
    /// Bad version, failed authorization, or a malformed frame.
    ProtocolViolation,
    /// Local node is shutting down.
    Shutdown,
    /// The socket failed or the peer closed it.
    SocketClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::PeerBanned => "peer banned",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::Shutdown => "shutdown",
            CloseReason::SocketClosed => "socket closed",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// ConnectionMetrics
// ---------------------------------------------------------------------------

/// Per-connection counters, updated lock-free from the send and read paths
/// and surfaced in the node status report.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    sent_envelopes: AtomicU64,
    received_envelopes: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    /// Round-trip time of the handshake in milliseconds.
    handshake_rtt_millis: AtomicU64,
}

impl ConnectionMetrics {
    pub fn on_sent(&self, bytes: usize) {
        self.sent_envelopes.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_received(&self, bytes: usize) {
        self.received_envelopes.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn set_handshake_rtt(&self, millis: u64) {
        self.handshake_rtt_millis.store(millis, Ordering::Relaxed);
    }

    pub fn sent_envelopes(&self) -> u64 {
        self.sent_envelopes.load(Ordering::Relaxed)
    }

    pub fn received_envelopes(&self) -> u64 {
        self.received_envelopes.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn handshake_rtt_millis(&self) -> u64 {
        self.handshake_rtt_millis.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One established, authorized link to a peer. Owned exclusively by the
/// [`Node`](super::node::Node) that created it.
pub struct Connection {
    id: String,
    peer_capability: Capability,
    peer_load: parking_lot::RwLock<NetworkLoad>,
    outbound: bool,
    created_at: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    metrics: ConnectionMetrics,
    closed: AtomicBool,
    /// Counter for outgoing authorization tokens on this connection. Each
    /// envelope gets a fresh value; the receiver rejects repeats.
    message_counter: AtomicU32,
}

impl Connection {
    pub(crate) fn new(
        peer_capability: Capability,
        peer_load: NetworkLoad,
        outbound: bool,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_capability,
            peer_load: parking_lot::RwLock::new(peer_load),
            outbound,
            created_at: now_millis(),
            writer: tokio::sync::Mutex::new(writer),
            metrics: ConnectionMetrics::default(),
            closed: AtomicBool::new(false),
            message_counter: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_capability(&self) -> &Capability {
        &self.peer_capability
    }

    pub fn peer_address(&self) -> &super::address::Address {
        &self.peer_capability.address
    }

    pub fn peer_load(&self) -> NetworkLoad {
        *self.peer_load.read()
    }

    pub fn update_peer_load(&self, load: NetworkLoad) {
        *self.peer_load.write() = load;
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next outgoing message counter. Strictly increasing per connection.
    pub fn next_message_counter(&self) -> u32 {
        self.message_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Write one envelope. Envelopes from concurrent callers are serialized
    /// by the writer lock, preserving send order per connection.
    pub async fn send_envelope(&self, envelope: &NetworkEnvelope) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        let bytes = write_envelope(&mut *writer, envelope).await?;
        self.metrics.on_sent(bytes);
        Ok(())
    }

    /// Mark closed and shut the write half down. Idempotent; the reader
    /// task notices the closed stream and finishes the teardown.
    pub async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection = %self.id, %reason, peer = %self.peer_capability.address, "closing connection");
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer_capability.address)
            .field("outbound", &self.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}
