//! Network addresses.
//!
//! An [`Address`] is a `host:port` pair. The host may be an IP, a DNS name,
//! a `.onion` address, or an `.i2p` destination; which transport can dial it
//! is decided by the map it is stored in, not by parsing the string.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::transport::TransportType;

/// A reachable endpoint of a peer on one transport.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Parse `host:port`. The last colon splits host and port so IPv6
    /// literals with brackets survive.
    pub fn from_full(full: &str) -> Option<Self> {
        let (host, port) = full.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The canonical `host:port` form used in proof-of-work challenges and
    /// logs. Both sides of a handshake must render an address identically
    /// or the challenge hashes won't match.
    pub fn to_full(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_full())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_full())
    }
}

/// The set of addresses one identity is reachable at, keyed by transport.
///
/// A `BTreeMap` rather than a `HashMap` so that serialization is
/// deterministic: this structure is part of signed material.
pub type AddressByTransport = BTreeMap<TransportType, Address>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let addr = Address::from_full("example.onion:8940").unwrap();
        assert_eq!(addr.host, "example.onion");
        assert_eq!(addr.port, 8940);
        assert_eq!(addr.to_full(), "example.onion:8940");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Address::from_full("no-port").is_none());
        assert!(Address::from_full(":8940").is_none());
        assert!(Address::from_full("host:notaport").is_none());
    }

    #[test]
    fn ordering_is_stable() {
        let a = Address::new("a.example".to_string(), 1);
        let b = Address::new("b.example".to_string(), 1);
        assert!(a < b);
    }
}
