//! # Connection Handshake
//!
//! Before a transport link carries anything, both ends exchange capabilities
//! and prove they spent work. The initiator sends a `Request` carrying its
//! capability and current load, wrapped in an envelope whose token was
//! minted against the assumed initial load (it cannot know the responder's
//! real load yet). The responder validates the token, consults its ban
//! list, and answers with a `Response` minted against the load the
//! initiator just advertised.
//!
//! The exchange is strictly one request, one response. `finish` receiving
//! zero or several response envelopes is a protocol violation, not a
//! recoverable condition.
//!
//! One [`ConnectionHandshake`] serves one attempt:
//!
//! ```text
//! Init -> RequestSent -> ResponseReceived -> { Authorized, Rejected }
//! ```
//!
//! Terminal states are never reused; a retry builds a fresh handshake.
//! There is no internal timeout or retry loop; a missing response surfaces
//! as an error to the caller, who owns the retry policy.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::authorization::AuthorizationService;
use crate::envelope::{EnvelopePayload, NetworkEnvelope};
use crate::peer_group::BanList;

use super::address::Address;
use super::capability::{Capability, NetworkLoad};
use super::ConnectionError;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Opening message of the initiator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub capability: Capability,
    pub network_load: NetworkLoad,
}

/// The responder's answer. Its capability echoes the initiator's protocol
/// version so both ends mint proof-of-work over identical material on
/// mixed-version networks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub capability: Capability,
    pub network_load: NetworkLoad,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Progress of one handshake attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    RequestSent,
    ResponseReceived,
    Authorized,
    Rejected,
}

/// What the caller adopts after a successful handshake.
#[derive(Clone, Debug)]
pub struct HandshakeResult {
    pub peer_capability: Capability,
    pub peer_load: NetworkLoad,
}

// ---------------------------------------------------------------------------
// ConnectionHandshake
// ---------------------------------------------------------------------------

/// One handshake attempt, initiator or responder side. Purely a negotiation
/// value object: no shared state is mutated beyond logging, and the result
/// is handed back for the caller to adopt.
pub struct ConnectionHandshake {
    /// Unique id of this attempt; scopes proof-of-work replay tracking.
    id: String,
    my_capability: Capability,
    ban_list: Arc<BanList>,
    authorization_service: Arc<AuthorizationService>,
    state: Mutex<HandshakeState>,
}

impl ConnectionHandshake {
    pub fn new(
        my_capability: Capability,
        ban_list: Arc<BanList>,
        authorization_service: Arc<AuthorizationService>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            my_capability,
            ban_list,
            authorization_service,
            state: Mutex::new(HandshakeState::Init),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock()
    }

    // -- Initiator side ------------------------------------------------------

    /// Build the request envelope for `peer_address`. The token is minted
    /// against [`NetworkLoad::INITIAL`]: the peer's real load is unknown
    /// until its response arrives.
    pub fn create_request(&self, my_load: NetworkLoad, peer_address: &Address) -> NetworkEnvelope {
        {
            let mut state = self.state.lock();
            assert_eq!(
                *state,
                HandshakeState::Init,
                "create_request on a used handshake"
            );
            *state = HandshakeState::RequestSent;
        }

        let payload = EnvelopePayload::HandshakeRequest(Request {
            capability: self.my_capability.clone(),
            network_load: my_load,
        });
        let token = self.authorization_service.create_token(
            &payload.serialize_for_authorization(),
            payload.cost_factor(),
            NetworkLoad::INITIAL,
            &peer_address.to_full(),
            0,
        );
        NetworkEnvelope::new(token, payload)
    }

    /// Validate the collected response envelopes and complete the attempt.
    ///
    /// Exactly one envelope must have arrived. The envelope must carry our
    /// protocol version, a `Response` payload, a responder that is not
    /// banned, and a valid authorization token. Anything else rejects the
    /// handshake; terminal either way.
    pub fn finish(
        &self,
        responses: Vec<NetworkEnvelope>,
        my_load: NetworkLoad,
    ) -> Result<HandshakeResult, ConnectionError> {
        {
            let mut state = self.state.lock();
            assert_eq!(
                *state,
                HandshakeState::RequestSent,
                "finish before create_request or on a finished handshake"
            );
            *state = HandshakeState::ResponseReceived;
        }

        if responses.len() != 1 {
            return Err(self.reject(ConnectionError::ResponseCountInvalid {
                count: responses.len(),
            }));
        }
        let envelope = responses.into_iter().next().expect("one response");

        if let Err(e) = envelope.verify_version() {
            return Err(self.reject(e.into()));
        }

        let EnvelopePayload::HandshakeResponse(response) = &envelope.payload else {
            return Err(self.reject(ConnectionError::UnexpectedPayload {
                expected: "HandshakeResponse",
                got: envelope.payload.name(),
            }));
        };

        let responder_address = response.capability.address.clone();
        if self.ban_list.is_banned(&responder_address) {
            return Err(self.reject(ConnectionError::PeerBanned(responder_address)));
        }

        let authorized = self.authorization_service.is_authorized(
            &envelope.payload.serialize_for_authorization(),
            envelope.payload.cost_factor(),
            &envelope.authorization_token,
            my_load,
            &self.id,
            &self.my_capability.address.to_full(),
        );
        if !authorized {
            return Err(self.reject(ConnectionError::AuthorizationFailed));
        }

        *self.state.lock() = HandshakeState::Authorized;
        debug!(handshake = %self.id, peer = %response.capability.address, "handshake authorized");
        Ok(HandshakeResult {
            peer_capability: response.capability.clone(),
            peer_load: response.network_load,
        })
    }

    // -- Responder side ------------------------------------------------------

    /// Validate an inbound request envelope and produce the response
    /// envelope plus the result to adopt. Symmetric to the initiator side:
    /// the request token is checked before any response is produced, and a
    /// banned initiator is refused.
    pub fn on_request(
        &self,
        envelope: NetworkEnvelope,
        my_load: NetworkLoad,
    ) -> Result<(NetworkEnvelope, HandshakeResult), ConnectionError> {
        assert_eq!(
            self.state(),
            HandshakeState::Init,
            "on_request on a used handshake"
        );

        if let Err(e) = envelope.verify_version() {
            return Err(self.reject(e.into()));
        }

        let EnvelopePayload::HandshakeRequest(request) = &envelope.payload else {
            return Err(self.reject(ConnectionError::UnexpectedPayload {
                expected: "HandshakeRequest",
                got: envelope.payload.name(),
            }));
        };
        let requester_capability = request.capability.clone();
        let requester_load = request.network_load;

        if self.ban_list.is_banned(&requester_capability.address) {
            return Err(self.reject(ConnectionError::PeerBanned(
                requester_capability.address,
            )));
        }

        // The initiator could not know our load, so its token was minted
        // against the initial load; validate against the same.
        let authorized = self.authorization_service.is_authorized(
            &envelope.payload.serialize_for_authorization(),
            envelope.payload.cost_factor(),
            &envelope.authorization_token,
            NetworkLoad::INITIAL,
            &self.id,
            &self.my_capability.address.to_full(),
        );
        if !authorized {
            return Err(self.reject(ConnectionError::AuthorizationFailed));
        }

        let response_payload = EnvelopePayload::HandshakeResponse(Response {
            capability: self.my_capability.with_version(requester_capability.version),
            network_load: my_load,
        });
        let token = self.authorization_service.create_token(
            &response_payload.serialize_for_authorization(),
            response_payload.cost_factor(),
            requester_load,
            &requester_capability.address.to_full(),
            0,
        );

        *self.state.lock() = HandshakeState::Authorized;
        debug!(handshake = %self.id, peer = %requester_capability.address, "inbound handshake authorized");
        Ok((
            NetworkEnvelope::new(token, response_payload),
            HandshakeResult {
                peer_capability: requester_capability,
                peer_load: requester_load,
            },
        ))
    }

    fn reject(&self, error: ConnectionError) -> ConnectionError {
        *self.state.lock() = HandshakeState::Rejected;
        debug!(handshake = %self.id, %error, "handshake rejected");
        error
    }
}
