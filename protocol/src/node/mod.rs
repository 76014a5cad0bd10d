//! # Node Layer
//!
//! Everything between a raw transport stream and an authorized peer link:
//! addresses and capabilities, the connection handshake, established
//! connections, the [`Node`](node::Node) that owns them, and the
//! [`NodesById`](nodes_by_id::NodesById) registry multiplexing several
//! identities over one transport.

pub mod address;
pub mod capability;
pub mod connection;
pub mod handshake;
pub mod node;
pub mod nodes_by_id;

pub use address::{Address, AddressByTransport};
pub use capability::{Capability, Feature, NetworkLoad, NetworkLoadSnapshot};
pub use connection::{CloseReason, Connection, ConnectionMetrics};
pub use handshake::{ConnectionHandshake, HandshakeResult, HandshakeState};
pub use node::{Node, NodeConfig, NodeListener};
pub use nodes_by_id::NodesById;

use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::transport::TransportError;

/// Connection-layer failures: protocol violations, failed authorization,
/// and transport errors. Connections failing with one of these are torn
/// down and never retried automatically.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("expected exactly one handshake response, got {count}")]
    ResponseCountInvalid { count: usize },

    #[error("expected {expected} payload, got {got}")]
    UnexpectedPayload {
        expected: &'static str,
        got: &'static str,
    },

    #[error("peer address is banned: {0}")]
    PeerBanned(Address),

    #[error("authorization failed")]
    AuthorizationFailed,

    #[error("operation timed out")]
    Timeout,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("node is not initialized")]
    NodeNotInitialized,

    #[error("node is shut down")]
    NodeShutDown,

    #[error("node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("no node registered under id: {0}")]
    NodeNotFound(String),
}
