//! Peer capabilities and load reporting.
//!
//! A [`Capability`] is the immutable self-description a peer presents during
//! the connection handshake: where it can be reached, which transports it
//! speaks, which optional features it supports, and its protocol version.
//! A [`NetworkLoad`] is the peer's self-reported resource pressure, used to
//! scale the proof-of-work difficulty we demand from it (and it from us).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::PROTOCOL_VERSION;
use crate::node::address::Address;
use crate::transport::TransportType;

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

/// Optional protocol features a peer can advertise. Unknown features from
/// newer peers deserialize into nothing here, so the set is closed per
/// release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    /// Peer serves inventory requests for its data stores.
    InventoryExchange,
    /// Peer acknowledges confidential messages with an ack payload.
    MessageAck,
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A peer's advertised address and supported feature set.
///
/// Never mutated after creation. The handshake response echoes the
/// requester's version (see [`Capability::with_version`]) so both ends mint
/// proof-of-work over identical material on mixed-version networks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub address: Address,
    pub supported_transports: BTreeSet<TransportType>,
    pub features: BTreeSet<Feature>,
    pub version: u32,
}

impl Capability {
    pub fn new(
        address: Address,
        supported_transports: BTreeSet<TransportType>,
        features: BTreeSet<Feature>,
    ) -> Self {
        Self {
            address,
            supported_transports,
            features,
            version: PROTOCOL_VERSION,
        }
    }

    /// Copy of this capability carrying a different protocol version.
    pub fn with_version(&self, version: u32) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkLoad
// ---------------------------------------------------------------------------

/// A peer's self-reported load in `[0.0, 1.0]`.
///
/// This is advisory data from an untrusted source. It is only ever used to
/// make things *more* expensive for us when talking to a busy peer; lying
/// with a low value does not let a peer demand less work from others, since
/// each side verifies against the load *it* published.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkLoad {
    value: f64,
}

impl NetworkLoad {
    /// The load assumed for a peer we have never talked to. Connection
    /// requests are minted against this value because the real load is
    /// unknown until the handshake response arrives.
    pub const INITIAL: NetworkLoad = NetworkLoad { value: 0.1 };

    pub fn new(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Default for NetworkLoad {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// The most recent load reading of the local node, shared across services.
///
/// Refreshed per handshake and whenever the node recomputes its own
/// pressure; readers take a cheap copy.
#[derive(Default)]
pub struct NetworkLoadSnapshot {
    current: RwLock<NetworkLoad>,
}

impl NetworkLoadSnapshot {
    pub fn new(initial: NetworkLoad) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> NetworkLoad {
        *self.current.read()
    }

    pub fn update(&self, load: NetworkLoad) {
        *self.current.write() = load;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(version: u32) -> Capability {
        let mut cap = Capability::new(
            Address::new("127.0.0.1".to_string(), 8940),
            BTreeSet::from([TransportType::Clear]),
            BTreeSet::from([Feature::InventoryExchange]),
        );
        cap.version = version;
        cap
    }

    #[test]
    fn with_version_only_changes_version() {
        let cap = capability(PROTOCOL_VERSION);
        let echoed = cap.with_version(7);
        assert_eq!(echoed.version, 7);
        assert_eq!(echoed.address, cap.address);
        assert_eq!(echoed.features, cap.features);
    }

    #[test]
    fn load_is_clamped() {
        assert_eq!(NetworkLoad::new(-1.0).value(), 0.0);
        assert_eq!(NetworkLoad::new(2.5).value(), 1.0);
        assert_eq!(NetworkLoad::new(0.4).value(), 0.4);
    }

    #[test]
    fn snapshot_updates() {
        let snapshot = NetworkLoadSnapshot::default();
        assert_eq!(snapshot.current(), NetworkLoad::INITIAL);
        snapshot.update(NetworkLoad::new(0.8));
        assert_eq!(snapshot.current().value(), 0.8);
    }
}
