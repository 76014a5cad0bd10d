//! Per-payload-type storage descriptors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{DEFAULT_AUTHENTICATED_DATA_TTL, DEFAULT_MAX_MAP_SIZE, MAX_AGE};

/// Describes how one payload type is stored: which store it lands in, how
/// long entries live, and how large the store may grow.
///
/// `MetaData` travels inside signed requests but is never trusted for
/// security decisions. It tunes resource budgets only, and the TTL is capped
/// at [`MAX_AGE`] no matter what a peer claims.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// Name of the payload type; selects the backing store. One store per
    /// name, so unrelated payload families never contend on a lock.
    pub class_name: String,
    /// Time-to-live in milliseconds from the entry's creation timestamp.
    pub ttl_millis: u64,
    /// Relative priority used when ordering inventory responses. Higher
    /// wins. Purely advisory.
    pub priority: u8,
    /// Maximum number of entries the store for this payload type holds.
    pub max_map_size: usize,
}

impl MetaData {
    pub fn new(class_name: impl Into<String>, ttl: Duration, max_map_size: usize) -> Self {
        Self {
            class_name: class_name.into(),
            ttl_millis: ttl.as_millis() as u64,
            priority: 0,
            max_map_size,
        }
    }

    /// Defaults for an application payload type: standard TTL and map size.
    pub fn with_defaults(class_name: impl Into<String>) -> Self {
        Self::new(class_name, DEFAULT_AUTHENTICATED_DATA_TTL, DEFAULT_MAX_MAP_SIZE)
    }

    /// Effective TTL, clamped to the protocol-wide age ceiling.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis).min(MAX_AGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_capped_at_max_age() {
        let meta = MetaData::new("Evil", Duration::from_secs(365 * 24 * 60 * 60), 100);
        assert_eq!(meta.ttl(), MAX_AGE);
    }

    #[test]
    fn defaults_are_reasonable() {
        let meta = MetaData::with_defaults("OfferListing");
        assert_eq!(meta.class_name, "OfferListing");
        assert_eq!(meta.max_map_size, DEFAULT_MAX_MAP_SIZE);
        assert!(meta.ttl() <= MAX_AGE);
    }
}
