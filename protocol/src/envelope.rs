//! # Wire Envelope
//!
//! Every message on the overlay travels as a [`NetworkEnvelope`]: a version
//! tag, an [`AuthorizationToken`], and one payload from the closed
//! [`EnvelopePayload`] enum. Receivers reject any envelope whose version is
//! not exactly the locally implemented protocol version; there is no
//! cross-version negotiation.
//!
//! The payload enum is deliberately closed. Dispatch happens by matching on
//! the variant, so every handler the overlay supports is visible in one
//! place and an unknown payload is a deserialization error at the frame
//! boundary, not a runtime type-cast surprise deep in a handler.
//!
//! ## Framing
//!
//! Frames are length-prefixed bincode: a big-endian `u32` length followed
//! by that many payload bytes. One frame, one envelope. Oversized frames
//! are rejected before allocation so a single malicious length header
//! cannot reserve gigabytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::authorization::AuthorizationToken;
use crate::confidential::{AckMessage, ConfidentialMessage};
use crate::config::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::inventory::{InventoryRequest, InventoryResponse};
use crate::node::handshake;
use crate::storage::{
    AddAuthenticatedDataRequest, AddMailboxRequest, RemoveAuthenticatedDataRequest,
    RemoveMailboxRequest,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("envelope serialization error: {0}")]
    Serialization(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("envelope version {got} does not match local protocol version {expected}")]
    VersionMismatch { expected: u32, got: u32 },
}

// ---------------------------------------------------------------------------
// EnvelopePayload
// ---------------------------------------------------------------------------

/// Every message type the overlay speaks. Closed by design.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnvelopePayload {
    HandshakeRequest(handshake::Request),
    HandshakeResponse(handshake::Response),
    AddAuthenticatedData(AddAuthenticatedDataRequest),
    RemoveAuthenticatedData(RemoveAuthenticatedDataRequest),
    AddMailboxData(AddMailboxRequest),
    RemoveMailboxData(RemoveMailboxRequest),
    Confidential(ConfidentialMessage),
    Ack(AckMessage),
    InventoryRequest(InventoryRequest),
    InventoryResponse(InventoryResponse),
    /// Peer-group liveness probe. Pure traffic; receivers count it as
    /// activity and otherwise drop it.
    KeepAlive { nonce: u64 },
}

impl EnvelopePayload {
    /// Relative proof-of-work cost of this message type. Multiplied with
    /// the maximum difficulty and the receiver's load to price a message.
    /// Storage mutations and inventory responses are the expensive ones.
    pub fn cost_factor(&self) -> f64 {
        match self {
            EnvelopePayload::HandshakeRequest(_) | EnvelopePayload::HandshakeResponse(_) => 0.05,
            EnvelopePayload::AddAuthenticatedData(_)
            | EnvelopePayload::RemoveAuthenticatedData(_)
            | EnvelopePayload::AddMailboxData(_)
            | EnvelopePayload::RemoveMailboxData(_) => 0.25,
            EnvelopePayload::Confidential(_) => 0.25,
            EnvelopePayload::Ack(_) => 0.05,
            EnvelopePayload::InventoryRequest(_) => 0.1,
            EnvelopePayload::InventoryResponse(_) => 0.5,
            EnvelopePayload::KeepAlive { .. } => 0.01,
        }
    }

    /// Stable payload name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            EnvelopePayload::HandshakeRequest(_) => "HandshakeRequest",
            EnvelopePayload::HandshakeResponse(_) => "HandshakeResponse",
            EnvelopePayload::AddAuthenticatedData(_) => "AddAuthenticatedData",
            EnvelopePayload::RemoveAuthenticatedData(_) => "RemoveAuthenticatedData",
            EnvelopePayload::AddMailboxData(_) => "AddMailboxData",
            EnvelopePayload::RemoveMailboxData(_) => "RemoveMailboxData",
            EnvelopePayload::Confidential(_) => "Confidential",
            EnvelopePayload::Ack(_) => "Ack",
            EnvelopePayload::InventoryRequest(_) => "InventoryRequest",
            EnvelopePayload::InventoryResponse(_) => "InventoryResponse",
            EnvelopePayload::KeepAlive { .. } => "KeepAlive",
        }
    }

    /// The bytes the proof-of-work token commits to.
    pub fn serialize_for_authorization(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// NetworkEnvelope
// ---------------------------------------------------------------------------

/// The unit of transmission: version, token, payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkEnvelope {
    pub version: u32,
    pub authorization_token: AuthorizationToken,
    pub payload: EnvelopePayload,
}

impl NetworkEnvelope {
    pub fn new(authorization_token: AuthorizationToken, payload: EnvelopePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            authorization_token,
            payload,
        }
    }

    /// Reject any envelope not carrying our exact protocol version.
    pub fn verify_version(&self) -> Result<(), EnvelopeError> {
        if self.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one envelope as a length-prefixed frame. Returns the number of
/// bytes put on the wire (prefix included).
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &NetworkEnvelope,
) -> Result<usize, EnvelopeError> {
    let bytes =
        bincode::serialize(envelope).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(EnvelopeError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(4 + bytes.len())
}

/// Read one envelope frame. Returns the envelope and the bytes consumed.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(NetworkEnvelope, usize), EnvelopeError> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(EnvelopeError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes).await?;
    let envelope =
        bincode::deserialize(&bytes).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
    Ok((envelope, 4 + length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::ProofOfWork;

    fn stub_token() -> AuthorizationToken {
        AuthorizationToken {
            proof_of_work: ProofOfWork::mint([0u8; 32], [1u8; 32], 2.0),
            message_counter: 1,
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let envelope = NetworkEnvelope::new(stub_token(), EnvelopePayload::KeepAlive { nonce: 42 });

        let (mut client, mut server) = tokio::io::duplex(1024);
        let written = write_envelope(&mut client, &envelope).await.unwrap();
        let (decoded, read) = read_envelope(&mut server).await.unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(written, read);
    }

    #[tokio::test]
    async fn oversized_length_header_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge)
            .await
            .unwrap();

        let result = read_envelope(&mut server).await;
        assert!(matches!(result, Err(EnvelopeError::FrameTooLarge { .. })));
    }

    #[test]
    fn version_check() {
        let mut envelope =
            NetworkEnvelope::new(stub_token(), EnvelopePayload::KeepAlive { nonce: 1 });
        assert!(envelope.verify_version().is_ok());

        envelope.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            envelope.verify_version(),
            Err(EnvelopeError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn cost_factors_are_bounded() {
        // Whatever the variant, the cost factor must stay inside the range
        // the difficulty formula clamps to.
        let payload = EnvelopePayload::KeepAlive { nonce: 1 };
        assert!(payload.cost_factor() > 0.0 && payload.cost_factor() <= 1.0);
    }
}
