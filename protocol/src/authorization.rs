//! # Authorization
//!
//! Every envelope on the overlay carries an [`AuthorizationToken`]: a small
//! hashcash proof-of-work binding the message bytes, the receiver's address,
//! and a per-connection message counter. Peers are untrusted; the token is
//! what makes flooding them expensive.
//!
//! The difficulty is not fixed. It scales with two inputs:
//!
//! - the **cost factor** of the message type (a handshake request is cheap,
//!   an inventory response is not), and
//! - the **receiver's advertised load**: the busier a peer says it is, the
//!   more work it demands before it will look at your message.
//!
//! Verification allows a bounded shortfall ([`DIFFICULTY_TOLERANCE`]) since
//! the load value the sender minted against may be one refresh older than
//! the one we verify against. Shortfalls inside the band are logged and
//! accepted; outside it, the message is rejected.
//!
//! A token is single-use per connection: the message counter must never
//! repeat on one connection, otherwise a peer could replay a single minted
//! proof forever.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::{DIFFICULTY_TOLERANCE, MAX_DIFFICULTY, MIN_DIFFICULTY};
use crate::crypto::sha256;
use crate::node::capability::NetworkLoad;

// ---------------------------------------------------------------------------
// ProofOfWork
// ---------------------------------------------------------------------------

/// A solved hashcash puzzle.
///
/// The work function is SHA-256 over `payload_hash || challenge || solution`.
/// A proof is valid for `difficulty` if the first 128 bits of the digest,
/// read as a big-endian integer, are below `2^128 / difficulty`. Expected
/// minting cost is `difficulty` hash evaluations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofOfWork {
    /// SHA-256 of the serialized message this proof covers. Hash rather
    /// than the message itself, so the token stays small on the wire.
    pub payload_hash: [u8; 32],
    /// SHA-256 of the receiver address and the message counter.
    pub challenge: [u8; 32],
    /// The difficulty the proof was minted at.
    pub difficulty: f64,
    /// The counter value that solved the puzzle.
    pub solution: u64,
}

impl ProofOfWork {
    /// Mint a proof by brute force. Runs on the caller's thread; at
    /// [`MAX_DIFFICULTY`] this is on the order of a second on weak hardware,
    /// so callers on a latency-sensitive path should move it to a blocking
    /// task.
    pub fn mint(payload_hash: [u8; 32], challenge: [u8; 32], difficulty: f64) -> Self {
        let mut solution: u64 = 0;
        loop {
            if Self::solves(&payload_hash, &challenge, solution, difficulty) {
                return Self {
                    payload_hash,
                    challenge,
                    difficulty,
                    solution,
                };
            }
            solution = solution.wrapping_add(1);
        }
    }

    /// Re-run the work function once and check the threshold.
    pub fn verify(&self) -> bool {
        Self::solves(&self.payload_hash, &self.challenge, self.solution, self.difficulty)
    }

    fn solves(payload_hash: &[u8; 32], challenge: &[u8; 32], solution: u64, difficulty: f64) -> bool {
        let mut input = [0u8; 72];
        input[..32].copy_from_slice(payload_hash);
        input[32..64].copy_from_slice(challenge);
        input[64..].copy_from_slice(&solution.to_be_bytes());
        let digest = sha256(&input);

        let head = u128::from_be_bytes(digest[..16].try_into().expect("16 bytes"));
        // Compare in f64 space; the loss of precision is irrelevant next to
        // the orders of magnitude involved.
        (head as f64) <= (u128::MAX as f64) / difficulty.max(1.0)
    }
}

// ---------------------------------------------------------------------------
// AuthorizationToken
// ---------------------------------------------------------------------------

/// The proof-of-work plus the per-connection message counter it was minted
/// for. Mandatory on every envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub proof_of_work: ProofOfWork,
    pub message_counter: u32,
}

// ---------------------------------------------------------------------------
// AuthorizationService
// ---------------------------------------------------------------------------

/// Mints tokens for outbound messages and validates tokens on inbound ones.
///
/// One instance per transport service node; the replay bookkeeping is keyed
/// by connection id and dropped when the connection closes.
#[derive(Default)]
pub struct AuthorizationService {
    /// Message counters already seen per connection. A repeat means a
    /// replayed proof and fails authorization.
    received_counters: DashMap<String, HashSet<u32>>,
}

impl AuthorizationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for `message_bytes` addressed to `peer_address`.
    ///
    /// `cost_factor` comes from the message type; `peer_load` is the load
    /// the receiver last advertised (or [`NetworkLoad::INITIAL`] before the
    /// handshake completes).
    pub fn create_token(
        &self,
        message_bytes: &[u8],
        cost_factor: f64,
        peer_load: NetworkLoad,
        peer_address: &str,
        message_counter: u32,
    ) -> AuthorizationToken {
        let difficulty = calculate_difficulty(cost_factor, peer_load);
        let payload_hash = sha256(message_bytes);
        let challenge = challenge_for(peer_address, message_counter);
        let proof_of_work = ProofOfWork::mint(payload_hash, challenge, difficulty);
        debug!(
            difficulty,
            message_counter, peer_address, "minted authorization token"
        );
        AuthorizationToken {
            proof_of_work,
            message_counter,
        }
    }

    /// Validate a token attached to an inbound message.
    ///
    /// `my_address` is the address the sender dialed (our own full address);
    /// `my_load` is the load value we currently advertise. Returns plain
    /// `bool`: authorization is a gate, not a diagnosis.
    pub fn is_authorized(
        &self,
        message_bytes: &[u8],
        cost_factor: f64,
        token: &AuthorizationToken,
        my_load: NetworkLoad,
        connection_id: &str,
        my_address: &str,
    ) -> bool {
        // Replay check first; it is the cheapest.
        {
            let mut seen = self
                .received_counters
                .entry(connection_id.to_string())
                .or_default();
            if !seen.insert(token.message_counter) {
                warn!(
                    connection_id,
                    counter = token.message_counter,
                    "rejected reused proof-of-work counter"
                );
                return false;
            }
        }

        let pow = &token.proof_of_work;

        if sha256(message_bytes) != pow.payload_hash {
            warn!(connection_id, "proof-of-work payload hash does not match message");
            return false;
        }

        if challenge_for(my_address, token.message_counter) != pow.challenge {
            warn!(connection_id, "proof-of-work challenge does not match our address");
            return false;
        }

        if self.is_difficulty_invalid(cost_factor, pow.difficulty, my_load) {
            return false;
        }

        pow.verify()
    }

    /// Forget the replay bookkeeping of a closed connection.
    pub fn on_connection_closed(&self, connection_id: &str) {
        self.received_counters.remove(connection_id);
    }

    fn is_difficulty_invalid(&self, cost_factor: f64, provided: f64, my_load: NetworkLoad) -> bool {
        let expected = calculate_difficulty(cost_factor, my_load);
        if provided >= expected {
            return false;
        }
        let missing = expected - provided;
        if missing <= DIFFICULTY_TOLERANCE {
            info!(
                expected,
                provided, missing, "proof-of-work difficulty short but inside tolerance"
            );
            return false;
        }
        warn!(
            expected,
            provided, missing, "proof-of-work difficulty outside tolerance"
        );
        true
    }
}

/// Challenge bytes for an address/counter pair: both ends must derive the
/// identical value, so the address uses its canonical `host:port` rendering.
fn challenge_for(address: &str, message_counter: u32) -> [u8; 32] {
    let mut input = Vec::with_capacity(address.len() + 4);
    input.extend_from_slice(address.as_bytes());
    input.extend_from_slice(&message_counter.to_be_bytes());
    sha256(&input)
}

/// Difficulty from message cost and receiver load, clamped to the protocol
/// bounds. Both factors are floored at 0.01 so nothing is ever free.
fn calculate_difficulty(cost_factor: f64, load: NetworkLoad) -> f64 {
    let cost = cost_factor.clamp(0.01, 1.0);
    let load_value = load.value().clamp(0.01, 1.0);
    (MAX_DIFFICULTY * cost + MAX_DIFFICULTY * load_value).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COST: f64 = 0.05;

    fn low_load() -> NetworkLoad {
        NetworkLoad::new(0.01)
    }

    #[test]
    fn mint_and_verify() {
        let pow = ProofOfWork::mint([1u8; 32], [2u8; 32], MIN_DIFFICULTY);
        assert!(pow.verify());
    }

    #[test]
    fn claimed_difficulty_is_checked() {
        // A proof minted at the floor cannot claim an astronomically higher
        // difficulty: verify() re-checks the threshold with the claimed value.
        let mut pow = ProofOfWork::mint([1u8; 32], [2u8; 32], MIN_DIFFICULTY);
        pow.difficulty = f64::MAX;
        assert!(!pow.verify());
    }

    #[test]
    fn token_roundtrip_authorizes() {
        let service = AuthorizationService::new();
        let message = b"handshake request bytes";
        let token = service.create_token(message, COST, low_load(), "10.0.0.2:8940", 1);

        assert!(service.is_authorized(message, COST, &token, low_load(), "conn-1", "10.0.0.2:8940"));
    }

    #[test]
    fn reused_counter_rejected() {
        let service = AuthorizationService::new();
        let message = b"payload";
        let token = service.create_token(message, COST, low_load(), "10.0.0.2:8940", 7);

        assert!(service.is_authorized(message, COST, &token, low_load(), "conn-1", "10.0.0.2:8940"));
        // Same counter on the same connection: replay.
        assert!(!service.is_authorized(message, COST, &token, low_load(), "conn-1", "10.0.0.2:8940"));
        // Fresh connection id starts a fresh counter space.
        assert!(service.is_authorized(message, COST, &token, low_load(), "conn-2", "10.0.0.2:8940"));
    }

    #[test]
    fn wrong_address_rejected() {
        let service = AuthorizationService::new();
        let message = b"payload";
        let token = service.create_token(message, COST, low_load(), "10.0.0.2:8940", 1);

        // Verifier's own address differs from the one the proof targeted.
        assert!(!service.is_authorized(message, COST, &token, low_load(), "conn-1", "10.9.9.9:8940"));
    }

    #[test]
    fn wrong_payload_rejected() {
        let service = AuthorizationService::new();
        let token = service.create_token(b"original", COST, low_load(), "10.0.0.2:8940", 1);

        assert!(!service.is_authorized(b"tampered", COST, &token, low_load(), "conn-1", "10.0.0.2:8940"));
    }

    #[test]
    fn difficulty_shortfall_outside_tolerance_rejected() {
        let service = AuthorizationService::new();
        let message = b"payload";
        // Mint at the floor difficulty.
        let payload_hash = sha256(message);
        let challenge = challenge_for("10.0.0.2:8940", 1);
        let token = AuthorizationToken {
            proof_of_work: ProofOfWork::mint(payload_hash, challenge, MIN_DIFFICULTY),
            message_counter: 1,
        };

        // Verify against a saturated load: expected difficulty is MAX, and
        // MAX - MIN exceeds the tolerance band.
        assert!(MAX_DIFFICULTY - MIN_DIFFICULTY > DIFFICULTY_TOLERANCE);
        assert!(!service.is_authorized(
            message,
            1.0,
            &token,
            NetworkLoad::new(1.0),
            "conn-1",
            "10.0.0.2:8940"
        ));
    }

    #[test]
    fn difficulty_shortfall_inside_tolerance_accepted() {
        let service = AuthorizationService::new();
        let message = b"payload";
        // Mint against a slightly lower load than we verify with; the
        // difference stays inside the tolerance band.
        let token = service.create_token(message, COST, NetworkLoad::new(0.10), "10.0.0.2:8940", 1);
        assert!(service.is_authorized(
            message,
            COST,
            &token,
            NetworkLoad::new(0.12),
            "conn-1",
            "10.0.0.2:8940"
        ));
    }

    #[test]
    fn closed_connection_forgets_counters() {
        let service = AuthorizationService::new();
        let message = b"payload";
        let token = service.create_token(message, COST, low_load(), "10.0.0.2:8940", 3);

        assert!(service.is_authorized(message, COST, &token, low_load(), "conn-1", "10.0.0.2:8940"));
        service.on_connection_closed("conn-1");
        assert!(service.is_authorized(message, COST, &token, low_load(), "conn-1", "10.0.0.2:8940"));
    }

    #[test]
    fn difficulty_is_clamped() {
        // Zero inputs are floored at 0.01 each, so nothing is ever free.
        assert_eq!(
            calculate_difficulty(0.0, NetworkLoad::new(0.0)),
            MAX_DIFFICULTY * 0.02
        );
        // Saturated inputs would be 2x MAX before clamping.
        assert_eq!(calculate_difficulty(1.0, NetworkLoad::new(1.0)), MAX_DIFFICULTY);
    }
}
