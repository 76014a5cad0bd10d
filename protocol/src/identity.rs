//! # Network Identities
//!
//! A [`NetworkId`] is the stable, shareable identity of one peer: its
//! Ed25519 public key, its X25519 encryption key, and the addresses it is
//! reachable at per transport. Identities are persisted keyed by local node
//! id so an address (a Tor hidden service in particular) survives restarts
//! instead of being regenerated every run.
//!
//! Secret key material never appears here; see
//! [`KeyBundle`](crate::crypto::KeyBundle) for the private half.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{KeyBundle, KeyHash, VeilPublicKey};
use crate::node::address::{Address, AddressByTransport};
use crate::storage::StoreError;
use crate::transport::TransportType;

/// Identifier of the default node of a service node. Non-default nodes get
/// caller-chosen ids.
pub const DEFAULT_NODE_ID: &str = "default";

// ---------------------------------------------------------------------------
// NetworkId
// ---------------------------------------------------------------------------

/// The public identity of a peer across transports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkId {
    /// Local node id this identity belongs to (e.g. `"default"`).
    pub id: String,
    /// Ed25519 identity key.
    pub pub_key: VeilPublicKey,
    /// Static X25519 key peers seal confidential messages with.
    pub encryption_key: [u8; 32],
    /// Where this identity listens, per transport.
    pub addresses: AddressByTransport,
}

impl NetworkId {
    /// Identity for a local key bundle, before any address is known.
    pub fn from_key_bundle(id: impl Into<String>, bundle: &KeyBundle) -> Self {
        Self {
            id: id.into(),
            pub_key: bundle.public_key(),
            encryption_key: bundle.encryption_public_key(),
            addresses: AddressByTransport::new(),
        }
    }

    pub fn key_hash(&self) -> KeyHash {
        self.pub_key.key_hash()
    }

    pub fn address_for(&self, transport: TransportType) -> Option<&Address> {
        self.addresses.get(&transport)
    }

    /// Record (or replace) the address this identity listens at on one
    /// transport. Called once the transport has actually bound.
    pub fn with_address(mut self, transport: TransportType, address: Address) -> Self {
        self.addresses.insert(transport, address);
        self
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, &self.pub_key.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// IdentityStore
// ---------------------------------------------------------------------------

/// Persisted `node id → NetworkId` map backed by a sled tree.
pub struct IdentityStore {
    tree: sled::Tree,
}

impl IdentityStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree("network_ids")?,
        })
    }

    /// Open a dedicated identity database at the given directory.
    pub fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::open(&db)
    }

    pub fn put(&self, network_id: &NetworkId) -> Result<(), StoreError> {
        let bytes = bincode::serialize(network_id)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.tree.insert(network_id.id.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Result<Option<NetworkId>, StoreError> {
        match self.tree.get(node_id.as_bytes())? {
            Some(bytes) => {
                let network_id = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(network_id))
            }
            None => Ok(None),
        }
    }
}
