//! # Protocol Configuration & Constants
//!
//! Every magic number in VEIL lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! These values define the behavior of the overlay. Several of them (the
//! wire version, the proof-of-work difficulty bounds, the storage caps) are
//! consensus-adjacent: changing them after peers are deployed in the wild
//! splits the network. Choose wisely during devnet.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Wire envelope version. Receivers reject any envelope whose version is not
/// exactly this value. There is no negotiation and no backward-compatibility
/// window: a version bump is a network-wide flag day.
pub const PROTOCOL_VERSION: u32 = 1;

/// The crate version string, assembled at compile time so we don't allocate
/// for something this trivial at runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 signing key length in bytes.
pub const SIGNING_KEY_LENGTH: usize = 32;

/// Ed25519 public (verifying) key length in bytes.
pub const VERIFYING_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes. If yours isn't, something
/// has gone terribly wrong.
pub const SIGNATURE_LENGTH: usize = 64;

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits is the standard and the only
/// length you should use. 12 bytes. Not 16. Not 8. Twelve.
pub const AES_NONCE_LENGTH: usize = 12;

/// Hash output length in bytes. Both SHA-256 and BLAKE3 produce 32-byte
/// digests; content hashes and key hashes are always this size.
pub const HASH_OUTPUT_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Authorization (Proof of Work)
// ---------------------------------------------------------------------------

/// Minimum hashcash difficulty. 2^7 = 128 expected hashes: about 3 ms on an
/// old CPU, under 1 ms on anything recent. The floor exists so that even an
/// idle network imposes a nonzero cost per message.
pub const MIN_DIFFICULTY: f64 = 128.0;

/// Maximum hashcash difficulty. 2^16 = 65536 expected hashes, roughly a
/// second of work on weak hardware. Above this, mobile peers start timing
/// out before they finish minting, which defeats the purpose.
pub const MAX_DIFFICULTY: f64 = 65_536.0;

/// Tolerance band when verifying a proof's difficulty against the expected
/// value. Load readings on both sides of a connection are snapshots taken at
/// slightly different times, so a small shortfall is accepted (and logged)
/// rather than rejected.
pub const DIFFICULTY_TOLERANCE: f64 = 50_000.0;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Hard age limit for persisted store entries. Anything older is dropped
/// when a persisted snapshot is loaded, regardless of its own TTL.
pub const MAX_AGE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Default cap on the number of entries a single store will hold. Stores can
/// override this through their payload `MetaData`.
pub const DEFAULT_MAX_MAP_SIZE: usize = 10_000;

/// Minimum interval between two persistence writes of the same store. Write
/// requests arriving earlier are coalesced into the next scheduled flush,
/// bounding disk I/O under gossip churn.
pub const MIN_PERSIST_INTERVAL: Duration = Duration::from_millis(1000);

/// How often the background task scans stores for entries whose TTL has
/// lapsed while in memory.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Default time-to-live for mailbox entries. Ten days gives an offline
/// receiver a realistic window to come back and fetch their messages.
pub const DEFAULT_MAILBOX_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Default time-to-live for authenticated data entries.
pub const DEFAULT_AUTHENTICATED_DATA_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Networking
// ---------------------------------------------------------------------------

/// Default clearnet listening port.
pub const DEFAULT_P2P_PORT: u16 = 8940;

/// Default HTTP status/metrics port for the daemon.
pub const DEFAULT_API_PORT: u16 = 8941;

/// Socket timeout used by the default node (seed and service traffic).
pub const DEFAULT_NODE_SOCKET_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket timeout used by user nodes (interactive traffic, shorter patience).
pub const USER_NODE_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum wire frame size. A frame larger than this is a protocol violation
/// and the connection is closed. 8 MiB comfortably covers inventory
/// responses while keeping a single malicious frame from exhausting memory.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound on entries packed into a single inventory response.
pub const MAX_INVENTORY_ENTRIES: usize = 2_000;

/// Target number of connected peers a peer group tries to maintain.
pub const DEFAULT_MIN_CONNECTIONS: usize = 3;

/// Hard cap on connections a peer group will hold open.
pub const DEFAULT_MAX_CONNECTIONS: usize = 12;

/// Interval of the peer-group maintenance loop (reconnects, keep-alive).
pub const PEER_GROUP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Current Unix time in milliseconds. All protocol timestamps (entry
/// creation, handshake signature dates) use this representation; `Duration`
/// stays internal to the process.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_bounds_ordered() {
        // If the floor is above the ceiling, difficulty clamping would
        // silently invert. Stranger things have shipped to production.
        assert!(MIN_DIFFICULTY < MAX_DIFFICULTY);
        assert!(MIN_DIFFICULTY >= 1.0);
    }

    #[test]
    fn storage_constants_sanity() {
        assert!(MIN_PERSIST_INTERVAL < PRUNE_INTERVAL);
        assert!(DEFAULT_AUTHENTICATED_DATA_TTL <= MAX_AGE);
        assert!(DEFAULT_MAILBOX_TTL <= MAX_AGE);
        assert!(DEFAULT_MAX_MAP_SIZE > 0);
    }

    #[test]
    fn crypto_parameter_sizes() {
        assert_eq!(SIGNING_KEY_LENGTH, 32);
        assert_eq!(VERIFYING_KEY_LENGTH, 32);
        assert_eq!(SIGNATURE_LENGTH, 64);
        assert_eq!(AES_KEY_LENGTH, 32);
        assert_eq!(AES_NONCE_LENGTH, 12);
        assert_eq!(HASH_OUTPUT_LENGTH, 32);
    }

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        // Sanity: we are past 2020 and before the heat death of the universe.
        assert!(a > 1_577_836_800_000);
    }
}
