//! Typed outcomes of storage operations.
//!
//! Validation failures in the storage layer never raise errors: a single
//! stale or malicious request must not abort processing of the batch it
//! arrived with. Every `add`/`remove` returns a [`DataStorageResult`]
//! carrying a success flag and, on failure, exactly one [`RejectReason`].
//!
//! Callers must not infer success from listener notification. Two of the
//! failure reasons (`PayloadAlreadyStored`, `RequestAlreadyReceived`)
//! describe requests that updated bookkeeping but deliberately did not
//! notify anyone.

use std::fmt;

/// Why a storage request was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The store is at its configured capacity; new hashes are turned away
    /// before any other validation runs.
    MaxMapSizeReached,
    /// Bit-identical request already stored; duplicate gossip.
    RequestAlreadyReceived,
    /// Sequence number does not exceed the stored one.
    SequenceNrInvalid,
    /// The payload's age exceeds its TTL.
    Expired,
    /// The payload failed its own semantic validation.
    DataInvalid,
    /// The embedded public key does not hash to the claimed identity.
    PublicKeyHashInvalid,
    /// The signature does not verify against the embedded key.
    SignatureInvalid,
    /// Known data arrived with a fresh sequence number; bookkeeping was
    /// updated but listeners were not re-notified.
    PayloadAlreadyStored,
    /// Remove for a hash we never stored; a tombstone was recorded so a
    /// late-arriving add for it still fails the sequence check.
    NoEntry,
    /// The entry was already a tombstone. The newest tombstone is kept.
    AlreadyRemoved,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectReason::MaxMapSizeReached => "maxMapSizeReached",
            RejectReason::RequestAlreadyReceived => "requestAlreadyReceived",
            RejectReason::SequenceNrInvalid => "sequenceNrInvalid",
            RejectReason::Expired => "expired",
            RejectReason::DataInvalid => "dataInvalid",
            RejectReason::PublicKeyHashInvalid => "publicKeyHashInvalid",
            RejectReason::SignatureInvalid => "signatureInvalid",
            RejectReason::PayloadAlreadyStored => "payloadAlreadyStored",
            RejectReason::NoEntry => "noEntry",
            RejectReason::AlreadyRemoved => "alreadyRemoved",
        };
        write!(f, "{name}")
    }
}

/// Outcome of one storage operation.
///
/// On a successful `add`, [`added_data`](Self::added_data) holds the payload
/// that was stored; on a successful `remove`, [`removed_data`](Self::removed_data)
/// holds the payload that was retracted.
#[derive(Clone, Debug)]
pub struct DataStorageResult<T> {
    success: bool,
    reason: Option<RejectReason>,
    added: Option<T>,
    removed: Option<T>,
}

impl<T> DataStorageResult<T> {
    pub fn added(data: T) -> Self {
        Self {
            success: true,
            reason: None,
            added: Some(data),
            removed: None,
        }
    }

    pub fn removed(data: T) -> Self {
        Self {
            success: true,
            reason: None,
            added: None,
            removed: Some(data),
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            added: None,
            removed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn reason(&self) -> Option<RejectReason> {
        self.reason
    }

    pub fn added_data(&self) -> Option<&T> {
        self.added.as_ref()
    }

    pub fn removed_data(&self) -> Option<&T> {
        self.removed.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_carries_payload() {
        let result = DataStorageResult::added("payload");
        assert!(result.is_success());
        assert_eq!(result.added_data(), Some(&"payload"));
        assert!(result.reason().is_none());
    }

    #[test]
    fn rejection_carries_exactly_one_reason() {
        let result: DataStorageResult<()> = DataStorageResult::rejected(RejectReason::Expired);
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::Expired));
        assert!(result.added_data().is_none());
        assert!(result.removed_data().is_none());
    }

    #[test]
    fn reason_display_is_stable() {
        // These strings end up in logs and operator tooling; renaming them
        // is a compatibility break.
        assert_eq!(RejectReason::SequenceNrInvalid.to_string(), "sequenceNrInvalid");
        assert_eq!(RejectReason::MaxMapSizeReached.to_string(), "maxMapSizeReached");
    }
}
