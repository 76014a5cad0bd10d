//! # Authenticated Data Storage
//!
//! The conflict-resolution engine for publicly replicated data. Peers gossip
//! add and remove requests for content-addressed payloads; each store keeps
//! only the latest request per content hash and decides winners with
//! monotonic sequence numbers. No global clock is assumed anywhere in this
//! module: timestamps feed pruning and TTLs, never conflict resolution.
//!
//! ## The rules
//!
//! - A request is applied only if its sequence number strictly exceeds the
//!   stored one for the same hash.
//! - A stored remove request is a **tombstone**: it reports the maximum
//!   sequence number, so no future add for that hash can ever win. Removed
//!   data stays removed.
//! - Only the original publisher may retract an entry, proven by the hash
//!   of the remover's public key matching the publisher hash recorded at
//!   add time, plus a signature check.
//! - Listener notification is precise: `on_added` fires only when a hash is
//!   stored for the first time. A sequence-number refresh of known data
//!   updates the map silently, so gossip re-broadcast cannot double-fire
//!   application logic.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::now_millis;
use crate::crypto::{ContentHash, KeyHash, VeilKeypair, VeilPublicKey, VeilSignature};

use super::meta_data::MetaData;
use super::result::{DataStorageResult, RejectReason};
use super::store::{DataRequest, DataStore, StoreError};

// ---------------------------------------------------------------------------
// DistributedData
// ---------------------------------------------------------------------------

/// One replicated payload: opaque application bytes plus the storage
/// descriptor. Content-addressed by the BLAKE3 hash of its serialized form
/// and immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedData {
    /// Application-serialized payload bytes. The overlay never looks inside.
    pub payload: Vec<u8>,
    /// Storage descriptor: store name, TTL, size class.
    pub meta_data: MetaData,
    /// Optional author binding. When present, the publisher's key hash must
    /// equal this value or the data is semantically invalid (e.g. a public
    /// chat message claiming someone else's author id).
    pub declared_author: Option<KeyHash>,
}

impl DistributedData {
    pub fn new(payload: Vec<u8>, meta_data: MetaData) -> Self {
        Self {
            payload,
            meta_data,
            declared_author: None,
        }
    }

    /// Payload with an author binding that `add` will enforce.
    pub fn with_author(payload: Vec<u8>, meta_data: MetaData, author: KeyHash) -> Self {
        Self {
            payload,
            meta_data,
            declared_author: Some(author),
        }
    }

    /// The canonical serialized form used for content addressing.
    pub fn serialize_for_hash(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// The content hash keying this payload in its store.
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.serialize_for_hash())
    }

    /// Domain validation against the publisher identity recorded in the
    /// enclosing request.
    pub fn is_data_invalid(&self, publisher: &KeyHash) -> bool {
        match &self.declared_author {
            Some(author) => author != publisher,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A payload together with its replication bookkeeping: sequence number,
/// publisher key hash, and creation time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedSequentialData {
    pub data: DistributedData,
    pub sequence_number: u32,
    pub pub_key_hash: KeyHash,
    pub created_at: u64,
}

impl AuthenticatedSequentialData {
    pub fn new(data: DistributedData, sequence_number: u32, pub_key_hash: KeyHash) -> Self {
        Self {
            data,
            sequence_number,
            pub_key_hash,
            created_at: now_millis(),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_millis().saturating_sub(self.created_at) > self.data.meta_data.ttl().as_millis() as u64
    }

    fn signed_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

/// A signed request to add (or refresh) an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAuthenticatedDataRequest {
    pub data: AuthenticatedSequentialData,
    pub owner_public_key: VeilPublicKey,
    pub signature: VeilSignature,
}

impl AddAuthenticatedDataRequest {
    /// Build and sign an add request as the publisher.
    pub fn sign(data: AuthenticatedSequentialData, keypair: &VeilKeypair) -> Self {
        let signature = keypair.sign(&data.signed_bytes());
        Self {
            data,
            owner_public_key: keypair.public_key(),
            signature,
        }
    }

    /// Convenience: wrap a payload with the next sequence number and sign it.
    pub fn from_data(data: DistributedData, sequence_number: u32, keypair: &VeilKeypair) -> Self {
        let sequential =
            AuthenticatedSequentialData::new(data, sequence_number, keypair.public_key().key_hash());
        Self::sign(sequential, keypair)
    }

    pub fn is_public_key_invalid(&self) -> bool {
        self.owner_public_key.key_hash() != self.data.pub_key_hash
    }

    pub fn is_signature_invalid(&self) -> bool {
        !self
            .owner_public_key
            .verify(&self.data.signed_bytes(), &self.signature)
    }
}

/// A signed request to retract an entry. Once accepted it stays in the map
/// as a tombstone and permanently blocks re-adding the hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAuthenticatedDataRequest {
    pub hash: ContentHash,
    pub sequence_number: u32,
    pub owner_public_key: VeilPublicKey,
    pub signature: VeilSignature,
    /// Descriptor of the payload type, carried so tombstones age out of the
    /// persisted snapshot like everything else.
    pub meta_data: MetaData,
    pub created_at: u64,
}

impl RemoveAuthenticatedDataRequest {
    /// Build and sign a remove request as the original publisher.
    pub fn sign(
        hash: ContentHash,
        sequence_number: u32,
        meta_data: MetaData,
        keypair: &VeilKeypair,
    ) -> Self {
        let signature = keypair.sign(&Self::signed_bytes(&hash, sequence_number));
        Self {
            hash,
            sequence_number,
            owner_public_key: keypair.public_key(),
            signature,
            meta_data,
            created_at: now_millis(),
        }
    }

    fn signed_bytes(hash: &ContentHash, sequence_number: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(36);
        bytes.extend_from_slice(hash.as_bytes());
        bytes.extend_from_slice(&sequence_number.to_be_bytes());
        bytes
    }

    /// The remover must be the publisher recorded in the stored entry.
    pub fn is_public_key_hash_invalid(&self, stored: &AuthenticatedSequentialData) -> bool {
        self.owner_public_key.key_hash() != stored.pub_key_hash
    }

    pub fn is_signature_invalid(&self) -> bool {
        !self.owner_public_key.verify(
            &Self::signed_bytes(&self.hash, self.sequence_number),
            &self.signature,
        )
    }

    pub fn is_expired(&self) -> bool {
        now_millis().saturating_sub(self.created_at) > self.meta_data.ttl().as_millis() as u64
    }
}

/// The latest request stored per content hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuthenticatedDataRequest {
    Add(AddAuthenticatedDataRequest),
    Remove(RemoveAuthenticatedDataRequest),
}

impl DataRequest for AuthenticatedDataRequest {
    fn sequence_number(&self) -> u32 {
        match self {
            // A tombstone reports the maximum: nothing supersedes a remove.
            AuthenticatedDataRequest::Add(add) => add.data.sequence_number,
            AuthenticatedDataRequest::Remove(_) => u32::MAX,
        }
    }

    fn created_at(&self) -> u64 {
        match self {
            AuthenticatedDataRequest::Add(add) => add.data.created_at,
            AuthenticatedDataRequest::Remove(remove) => remove.created_at,
        }
    }

    fn is_expired(&self) -> bool {
        match self {
            AuthenticatedDataRequest::Add(add) => add.data.is_expired(),
            AuthenticatedDataRequest::Remove(remove) => remove.is_expired(),
        }
    }

    fn is_add(&self) -> bool {
        matches!(self, AuthenticatedDataRequest::Add(_))
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Application callbacks for store changes. Implementations run on the
/// storage path; keep them cheap and never let them panic (if one does
/// anyway, it is isolated and logged and the remaining listeners still run).
pub trait AuthenticatedDataListener: Send + Sync {
    fn on_added(&self, data: &DistributedData);
    fn on_removed(&self, data: &DistributedData);
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// One conflict-resolution engine per payload type.
pub struct AuthenticatedDataStorageService {
    store: DataStore<AuthenticatedDataRequest>,
    listeners: RwLock<Vec<Arc<dyn AuthenticatedDataListener>>>,
}

impl AuthenticatedDataStorageService {
    pub fn open(tree: sled::Tree, meta_data: &MetaData) -> Result<Self, StoreError> {
        let store = DataStore::open(tree, meta_data.class_name.clone(), meta_data.max_map_size)?;
        Ok(Self {
            store,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Apply an add request. See the module docs for the rule set; the
    /// check order is part of the protocol (the size cap is checked before
    /// any signature work so oversize floods stay cheap to reject).
    pub fn add(&self, request: AddAuthenticatedDataRequest) -> DataStorageResult<DistributedData> {
        let hash = request.data.data.content_hash();
        let existed;
        {
            let mut map = self.store.lock_map();

            if map.len() >= self.store.max_map_size() && !map.contains_key(&hash) {
                return DataStorageResult::rejected(RejectReason::MaxMapSizeReached);
            }

            if let Some(stored) = map.get(&hash) {
                if let AuthenticatedDataRequest::Add(stored_add) = stored {
                    if *stored_add == request {
                        return DataStorageResult::rejected(RejectReason::RequestAlreadyReceived);
                    }
                }
                if request.data.sequence_number <= stored.sequence_number() {
                    return DataStorageResult::rejected(RejectReason::SequenceNrInvalid);
                }
            }

            if request.data.is_expired() {
                info!(store = %self.store.store_key(), "expired payload at add");
                return DataStorageResult::rejected(RejectReason::Expired);
            }

            if request.data.data.is_data_invalid(&request.data.pub_key_hash) {
                warn!(store = %self.store.store_key(), "semantically invalid payload at add");
                return DataStorageResult::rejected(RejectReason::DataInvalid);
            }

            if request.is_public_key_invalid() {
                warn!(store = %self.store.store_key(), "public key hash mismatch at add");
                return DataStorageResult::rejected(RejectReason::PublicKeyHashInvalid);
            }

            if request.is_signature_invalid() {
                warn!(store = %self.store.store_key(), "invalid signature at add");
                return DataStorageResult::rejected(RejectReason::SignatureInvalid);
            }

            existed = map.contains_key(&hash);
            map.insert(hash, AuthenticatedDataRequest::Add(request.clone()));
        }

        self.store.persist();

        if existed {
            // Known data with a fresh sequence number: bookkeeping only.
            // Re-notifying here would double-fire application logic on
            // every gossip re-broadcast.
            return DataStorageResult::rejected(RejectReason::PayloadAlreadyStored);
        }

        let payload = request.data.data;
        self.notify(|listener| listener.on_added(&payload));
        DataStorageResult::added(payload)
    }

    /// Apply a remove request.
    pub fn remove(
        &self,
        request: RemoveAuthenticatedDataRequest,
    ) -> DataStorageResult<DistributedData> {
        let hash = request.hash;
        let removed_payload;
        {
            let mut map = self.store.lock_map();

            let Some(stored) = map.get(&hash) else {
                // A remove may arrive before the matching add. Keep the
                // tombstone so the sequence bookkeeping survives.
                map.insert(hash, AuthenticatedDataRequest::Remove(request));
                drop(map);
                self.store.persist();
                return DataStorageResult::rejected(RejectReason::NoEntry);
            };

            match stored {
                AuthenticatedDataRequest::Remove(stored_remove) => {
                    // Keep the freshest tombstone.
                    if request.sequence_number > stored_remove.sequence_number {
                        map.insert(hash, AuthenticatedDataRequest::Remove(request));
                        drop(map);
                        self.store.persist();
                    }
                    return DataStorageResult::rejected(RejectReason::AlreadyRemoved);
                }
                AuthenticatedDataRequest::Add(stored_add) => {
                    let stored_data = &stored_add.data;
                    if request.sequence_number <= stored_data.sequence_number {
                        warn!(store = %self.store.store_key(), "sequence number not increased at remove");
                        return DataStorageResult::rejected(RejectReason::SequenceNrInvalid);
                    }
                    if request.is_public_key_hash_invalid(stored_data) {
                        warn!(store = %self.store.store_key(), "remover is not the publisher");
                        return DataStorageResult::rejected(RejectReason::PublicKeyHashInvalid);
                    }
                    if request.is_signature_invalid() {
                        warn!(store = %self.store.store_key(), "invalid signature at remove");
                        return DataStorageResult::rejected(RejectReason::SignatureInvalid);
                    }
                    removed_payload = stored_data.data.clone();
                    map.insert(hash, AuthenticatedDataRequest::Remove(request));
                }
            }
        }

        self.store.persist();
        self.notify(|listener| listener.on_removed(&removed_payload));
        DataStorageResult::removed(removed_payload)
    }

    /// Drop entries whose TTL has lapsed while in memory. Runs on a timer;
    /// retracted add entries are reported through `on_removed` so the
    /// application state follows the store.
    pub fn prune_expired(&self) {
        let mut expired_payloads = Vec::new();
        {
            let mut map = self.store.lock_map();
            let expired_hashes: Vec<ContentHash> = map
                .iter()
                .filter(|(_, request)| request.is_expired())
                .map(|(hash, _)| *hash)
                .collect();
            for hash in expired_hashes {
                if let Some(AuthenticatedDataRequest::Add(add)) = map.remove(&hash) {
                    expired_payloads.push(add.data.data);
                }
            }
        }
        if !expired_payloads.is_empty() {
            info!(
                store = %self.store.store_key(),
                count = expired_payloads.len(),
                "pruned expired entries"
            );
            self.store.persist();
            for payload in &expired_payloads {
                self.notify(|listener| listener.on_removed(payload));
            }
        }
    }

    /// Flush any coalesced persistence request and stop.
    pub fn shutdown(&self) {
        self.store.flush_if_dirty();
    }

    pub fn add_listener(&self, listener: Arc<dyn AuthenticatedDataListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub(crate) fn store(&self) -> &DataStore<AuthenticatedDataRequest> {
        &self.store
    }

    /// Stored sequence number for a hash, 0 if unknown. A tombstone reports
    /// `u32::MAX` here, which is exactly what pre-add checks need.
    pub fn sequence_number(&self, hash: &ContentHash) -> u32 {
        self.store
            .lock_map()
            .get(hash)
            .map(|request| request.sequence_number())
            .unwrap_or(0)
    }

    fn notify(&self, f: impl Fn(&Arc<dyn AuthenticatedDataListener>)) {
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                error!(store = %self.store.store_key(), "storage listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingListener {
        added: Mutex<Vec<DistributedData>>,
        removed: Mutex<Vec<DistributedData>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }
    }

    impl AuthenticatedDataListener for RecordingListener {
        fn on_added(&self, data: &DistributedData) {
            self.added.lock().push(data.clone());
        }
        fn on_removed(&self, data: &DistributedData) {
            self.removed.lock().push(data.clone());
        }
    }

    struct PanickingListener;

    impl AuthenticatedDataListener for PanickingListener {
        fn on_added(&self, _: &DistributedData) {
            panic!("listener bug");
        }
        fn on_removed(&self, _: &DistributedData) {
            panic!("listener bug");
        }
    }

    fn service_with_size(max_map_size: usize) -> AuthenticatedDataStorageService {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("TestPayload").unwrap();
        let meta = MetaData::new("TestPayload", Duration::from_secs(3600), max_map_size);
        AuthenticatedDataStorageService::open(tree, &meta).unwrap()
    }

    fn service() -> AuthenticatedDataStorageService {
        service_with_size(100)
    }

    fn payload(tag: &[u8]) -> DistributedData {
        DistributedData::new(
            tag.to_vec(),
            MetaData::new("TestPayload", Duration::from_secs(3600), 100),
        )
    }

    fn add_request(tag: &[u8], seq: u32, keypair: &VeilKeypair) -> AddAuthenticatedDataRequest {
        AddAuthenticatedDataRequest::from_data(payload(tag), seq, keypair)
    }

    #[test]
    fn first_add_succeeds_and_notifies_once() {
        let service = service();
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());

        let keypair = VeilKeypair::generate();
        let result = service.add(add_request(b"p1", 1, &keypair));

        assert!(result.is_success());
        assert_eq!(result.added_data().unwrap().payload, b"p1");
        assert_eq!(listener.added.lock().len(), 1);
    }

    #[test]
    fn exact_duplicate_is_rejected_without_renotify() {
        let service = service();
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());

        let keypair = VeilKeypair::generate();
        let request = add_request(b"p1", 1, &keypair);

        assert!(service.add(request.clone()).is_success());
        let second = service.add(request);
        assert!(!second.is_success());
        assert_eq!(second.reason(), Some(RejectReason::RequestAlreadyReceived));
        assert_eq!(listener.added.lock().len(), 1);
    }

    #[test]
    fn sequence_refresh_updates_silently() {
        let service = service();
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());

        let keypair = VeilKeypair::generate();
        // Same payload, higher sequence number: a refresh, not new data.
        // (Creation timestamps differ, so the requests are not bit-equal,
        // but the content hash is identical.)
        let data = payload(b"p1");
        let first = AddAuthenticatedDataRequest::sign(
            AuthenticatedSequentialData {
                data: data.clone(),
                sequence_number: 1,
                pub_key_hash: keypair.public_key().key_hash(),
                created_at: now_millis(),
            },
            &keypair,
        );
        let refresh = AddAuthenticatedDataRequest::sign(
            AuthenticatedSequentialData {
                data: data.clone(),
                sequence_number: 2,
                pub_key_hash: keypair.public_key().key_hash(),
                created_at: now_millis() + 1,
            },
            &keypair,
        );

        assert!(service.add(first).is_success());
        let result = service.add(refresh);
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::PayloadAlreadyStored));
        // The map took the new sequence number anyway.
        assert_eq!(service.sequence_number(&data.content_hash()), 2);
        // But the application saw exactly one add.
        assert_eq!(listener.added.lock().len(), 1);
    }

    #[test]
    fn stale_sequence_number_rejected() {
        let service = service();
        let keypair = VeilKeypair::generate();

        // Distinct creation timestamps keep the replays from being
        // bit-identical, which would take the duplicate path instead.
        let request_with = |seq: u32, created_at: u64| {
            AddAuthenticatedDataRequest::sign(
                AuthenticatedSequentialData {
                    data: payload(b"p1"),
                    sequence_number: seq,
                    pub_key_hash: keypair.public_key().key_hash(),
                    created_at,
                },
                &keypair,
            )
        };
        let base = now_millis();

        assert!(service.add(request_with(5, base)).is_success());
        let result = service.add(request_with(5, base + 1));
        assert_eq!(result.reason(), Some(RejectReason::SequenceNrInvalid));
        let result = service.add(request_with(4, base + 2));
        assert_eq!(result.reason(), Some(RejectReason::SequenceNrInvalid));
    }

    #[test]
    fn map_size_cap_rejects_new_hashes() {
        let service = service_with_size(2);
        let keypair = VeilKeypair::generate();

        assert!(service.add(add_request(b"a", 1, &keypair)).is_success());
        assert!(service.add(add_request(b"b", 1, &keypair)).is_success());
        let result = service.add(add_request(b"c", 1, &keypair));
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::MaxMapSizeReached));
    }

    #[test]
    fn expired_payload_rejected() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("ShortLived").unwrap();
        let meta = MetaData::new("ShortLived", Duration::from_millis(10), 100);
        let service = AuthenticatedDataStorageService::open(tree, &meta).unwrap();

        let keypair = VeilKeypair::generate();
        let data = DistributedData::new(b"old".to_vec(), meta);
        let sequential = AuthenticatedSequentialData {
            data,
            sequence_number: 1,
            pub_key_hash: keypair.public_key().key_hash(),
            // Created well past its 10ms TTL.
            created_at: now_millis() - 1000,
        };
        let result = service.add(AddAuthenticatedDataRequest::sign(sequential, &keypair));
        assert_eq!(result.reason(), Some(RejectReason::Expired));
    }

    #[test]
    fn author_binding_is_enforced() {
        let service = service();
        let keypair = VeilKeypair::generate();
        let somebody_else = VeilKeypair::generate();

        let data = DistributedData::with_author(
            b"chat message".to_vec(),
            MetaData::new("TestPayload", Duration::from_secs(3600), 100),
            somebody_else.public_key().key_hash(),
        );
        let result = service.add(AddAuthenticatedDataRequest::from_data(data, 1, &keypair));
        assert_eq!(result.reason(), Some(RejectReason::DataInvalid));
    }

    #[test]
    fn forged_key_hash_rejected() {
        let service = service();
        let keypair = VeilKeypair::generate();
        let victim = VeilKeypair::generate();

        // Claim the victim's identity but sign with our own key.
        let sequential = AuthenticatedSequentialData::new(
            payload(b"p1"),
            1,
            victim.public_key().key_hash(),
        );
        let request = AddAuthenticatedDataRequest::sign(sequential, &keypair);
        let result = service.add(request);
        assert_eq!(result.reason(), Some(RejectReason::PublicKeyHashInvalid));
    }

    #[test]
    fn tampered_signature_rejected() {
        let service = service();
        let keypair = VeilKeypair::generate();

        let mut request = add_request(b"p1", 1, &keypair);
        request.data.sequence_number = 9; // invalidates the signature
        let result = service.add(request);
        assert_eq!(result.reason(), Some(RejectReason::SignatureInvalid));
    }

    #[test]
    fn remove_then_add_is_permanently_blocked() {
        let service = service();
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());

        let keypair = VeilKeypair::generate();
        let request = add_request(b"p1", 1, &keypair);
        let hash = request.data.data.content_hash();
        let meta = request.data.data.meta_data.clone();

        assert!(service.add(request).is_success());

        let remove = RemoveAuthenticatedDataRequest::sign(hash, 2, meta, &keypair);
        let result = service.remove(remove);
        assert!(result.is_success());
        assert_eq!(result.removed_data().unwrap().payload, b"p1");
        assert_eq!(listener.removed.lock().len(), 1);

        // The tombstone reports u32::MAX; no sequence number beats it.
        let late_add = service.add(add_request(b"p1", 3, &keypair));
        assert_eq!(late_add.reason(), Some(RejectReason::SequenceNrInvalid));
        assert_eq!(service.sequence_number(&hash), u32::MAX);
    }

    #[test]
    fn remove_by_non_publisher_rejected() {
        let service = service();
        let publisher = VeilKeypair::generate();
        let attacker = VeilKeypair::generate();

        let request = add_request(b"p1", 1, &publisher);
        let hash = request.data.data.content_hash();
        let meta = request.data.data.meta_data.clone();
        assert!(service.add(request).is_success());

        let remove = RemoveAuthenticatedDataRequest::sign(hash, 2, meta, &attacker);
        let result = service.remove(remove);
        assert_eq!(result.reason(), Some(RejectReason::PublicKeyHashInvalid));
    }

    #[test]
    fn remove_with_stale_sequence_rejected() {
        let service = service();
        let keypair = VeilKeypair::generate();

        let request = add_request(b"p1", 5, &keypair);
        let hash = request.data.data.content_hash();
        let meta = request.data.data.meta_data.clone();
        assert!(service.add(request).is_success());

        let remove = RemoveAuthenticatedDataRequest::sign(hash, 5, meta, &keypair);
        assert_eq!(
            service.remove(remove).reason(),
            Some(RejectReason::SequenceNrInvalid)
        );
    }

    #[test]
    fn remove_before_add_leaves_tombstone() {
        let service = service();
        let keypair = VeilKeypair::generate();

        let data = payload(b"p1");
        let hash = data.content_hash();
        let meta = data.meta_data.clone();

        let remove = RemoveAuthenticatedDataRequest::sign(hash, 1, meta, &keypair);
        let result = service.remove(remove);
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::NoEntry));

        // The add that arrives late loses against the tombstone.
        let late_add = service.add(add_request(b"p1", 2, &keypair));
        assert_eq!(late_add.reason(), Some(RejectReason::SequenceNrInvalid));
    }

    #[test]
    fn second_remove_reports_already_removed() {
        let service = service();
        let keypair = VeilKeypair::generate();

        let request = add_request(b"p1", 1, &keypair);
        let hash = request.data.data.content_hash();
        let meta = request.data.data.meta_data.clone();
        assert!(service.add(request).is_success());

        let remove = RemoveAuthenticatedDataRequest::sign(hash, 2, meta.clone(), &keypair);
        assert!(service.remove(remove).is_success());

        let again = RemoveAuthenticatedDataRequest::sign(hash, 3, meta, &keypair);
        let result = service.remove(again);
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::AlreadyRemoved));
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let service = service();
        service.add_listener(Arc::new(PanickingListener));
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());

        let keypair = VeilKeypair::generate();
        assert!(service.add(add_request(b"p1", 1, &keypair)).is_success());
        assert_eq!(listener.added.lock().len(), 1);
    }

    #[test]
    fn concurrent_adds_for_different_hashes() {
        let service = Arc::new(service());
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    let keypair = VeilKeypair::generate();
                    let result = service.add(add_request(&[i], 1, &keypair));
                    assert!(result.is_success());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(service.len(), 4);
    }
}
