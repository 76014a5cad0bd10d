//! # Mailbox Data Storage
//!
//! Store-and-forward delivery for confidential messages. When a receiver is
//! offline, the sender parks the sealed message in the receiver's mailbox
//! store on the overlay; the receiver fetches it later, decrypts it, and
//! retracts it.
//!
//! The engine is the same sequence-number machine as the authenticated
//! store, with two differences:
//!
//! - The payload is an encrypted [`ConfidentialMessage`] wrapper, so the TTL
//!   and size class come from the wrapper's `MetaData`, never from the
//!   plaintext (which nobody here can read).
//! - Removal authority belongs to the **receiver**, the party who consumed
//!   the message, proven by their key hash matching the receiver hash
//!   recorded at add time. The sender hands the message over and loses
//!   control of it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::confidential::ConfidentialMessage;
use crate::config::now_millis;
use crate::crypto::{ContentHash, KeyHash, VeilKeypair, VeilPublicKey, VeilSignature};

use super::meta_data::MetaData;
use super::result::{DataStorageResult, RejectReason};
use super::store::{DataRequest, DataStore, StoreError};

// ---------------------------------------------------------------------------
// MailboxData
// ---------------------------------------------------------------------------

/// One parked message: the sealed payload plus its storage descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxData {
    pub confidential_message: ConfidentialMessage,
    pub meta_data: MetaData,
}

impl MailboxData {
    pub fn new(confidential_message: ConfidentialMessage, meta_data: MetaData) -> Self {
        Self {
            confidential_message,
            meta_data,
        }
    }

    pub fn serialize_for_hash(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.serialize_for_hash())
    }

    /// The envelope's receiver hash and the sealed message's receiver hash
    /// must agree, otherwise removal authority would not match the party
    /// able to decrypt.
    pub fn is_data_invalid(&self, receiver_key_hash: &KeyHash) -> bool {
        self.confidential_message.receiver_key_hash != *receiver_key_hash
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A mailbox payload with its replication bookkeeping. Records both party
/// hashes: the sender's (who may add) and the receiver's (who may remove).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSequentialData {
    pub mailbox_data: MailboxData,
    pub sequence_number: u32,
    pub sender_key_hash: KeyHash,
    pub receiver_key_hash: KeyHash,
    pub created_at: u64,
}

impl MailboxSequentialData {
    pub fn new(
        mailbox_data: MailboxData,
        sequence_number: u32,
        sender_key_hash: KeyHash,
        receiver_key_hash: KeyHash,
    ) -> Self {
        Self {
            mailbox_data,
            sequence_number,
            sender_key_hash,
            receiver_key_hash,
            created_at: now_millis(),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_millis().saturating_sub(self.created_at)
            > self.mailbox_data.meta_data.ttl().as_millis() as u64
    }

    fn signed_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

/// Signed by the sender to park a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMailboxRequest {
    pub data: MailboxSequentialData,
    pub sender_public_key: VeilPublicKey,
    pub signature: VeilSignature,
}

impl AddMailboxRequest {
    pub fn sign(data: MailboxSequentialData, sender: &VeilKeypair) -> Self {
        let signature = sender.sign(&data.signed_bytes());
        Self {
            data,
            sender_public_key: sender.public_key(),
            signature,
        }
    }

    /// Wrap a mailbox payload for the given receiver and sign it.
    pub fn from_data(
        mailbox_data: MailboxData,
        sequence_number: u32,
        receiver_key_hash: KeyHash,
        sender: &VeilKeypair,
    ) -> Self {
        let sequential = MailboxSequentialData::new(
            mailbox_data,
            sequence_number,
            sender.public_key().key_hash(),
            receiver_key_hash,
        );
        Self::sign(sequential, sender)
    }

    pub fn is_public_key_invalid(&self) -> bool {
        self.sender_public_key.key_hash() != self.data.sender_key_hash
    }

    pub fn is_signature_invalid(&self) -> bool {
        !self
            .sender_public_key
            .verify(&self.data.signed_bytes(), &self.signature)
    }
}

/// Signed by the receiver to retract a consumed message. Stays in the map
/// as a tombstone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMailboxRequest {
    pub hash: ContentHash,
    pub sequence_number: u32,
    pub receiver_public_key: VeilPublicKey,
    pub signature: VeilSignature,
    pub meta_data: MetaData,
    pub created_at: u64,
}

impl RemoveMailboxRequest {
    pub fn sign(
        hash: ContentHash,
        sequence_number: u32,
        meta_data: MetaData,
        receiver: &VeilKeypair,
    ) -> Self {
        let signature = receiver.sign(&Self::signed_bytes(&hash, sequence_number));
        Self {
            hash,
            sequence_number,
            receiver_public_key: receiver.public_key(),
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

    /// The remover must be the receiver recorded in the stored entry, not
    /// the sender and not an arbitrary peer.
    pub fn is_public_key_hash_invalid(&self, stored: &MailboxSequentialData) -> bool {
        self.receiver_public_key.key_hash() != stored.receiver_key_hash
    }

    pub fn is_signature_invalid(&self) -> bool {
        !self.receiver_public_key.verify(
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
pub enum MailboxRequest {
    Add(AddMailboxRequest),
    Remove(RemoveMailboxRequest),
}

impl DataRequest for MailboxRequest {
    fn sequence_number(&self) -> u32 {
        match self {
            MailboxRequest::Add(add) => add.data.sequence_number,
            MailboxRequest::Remove(_) => u32::MAX,
        }
    }

    fn created_at(&self) -> u64 {
        match self {
            MailboxRequest::Add(add) => add.data.created_at,
            MailboxRequest::Remove(remove) => remove.created_at,
        }
    }

    fn is_expired(&self) -> bool {
        match self {
            MailboxRequest::Add(add) => add.data.is_expired(),
            MailboxRequest::Remove(remove) => remove.is_expired(),
        }
    }

    fn is_add(&self) -> bool {
        matches!(self, MailboxRequest::Add(_))
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub trait MailboxDataListener: Send + Sync {
    fn on_added(&self, data: &MailboxData);
    fn on_removed(&self, data: &MailboxData);
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The mailbox store engine. One instance per mailbox payload class.
pub struct MailboxDataStorageService {
    store: DataStore<MailboxRequest>,
    listeners: RwLock<Vec<Arc<dyn MailboxDataListener>>>,
}

impl MailboxDataStorageService {
    pub fn open(tree: sled::Tree, meta_data: &MetaData) -> Result<Self, StoreError> {
        let store = DataStore::open(tree, meta_data.class_name.clone(), meta_data.max_map_size)?;
        Ok(Self {
            store,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn add(&self, request: AddMailboxRequest) -> DataStorageResult<MailboxData> {
        let hash = request.data.mailbox_data.content_hash();
        let existed;
        {
            let mut map = self.store.lock_map();

            if map.len() >= self.store.max_map_size() && !map.contains_key(&hash) {
                return DataStorageResult::rejected(RejectReason::MaxMapSizeReached);
            }

            if let Some(stored) = map.get(&hash) {
                if let MailboxRequest::Add(stored_add) = stored {
                    if *stored_add == request {
                        return DataStorageResult::rejected(RejectReason::RequestAlreadyReceived);
                    }
                }
                if request.data.sequence_number <= stored.sequence_number() {
                    return DataStorageResult::rejected(RejectReason::SequenceNrInvalid);
                }
            }

            if request.data.is_expired() {
                info!(store = %self.store.store_key(), "expired mailbox payload at add");
                return DataStorageResult::rejected(RejectReason::Expired);
            }

            if request
                .data
                .mailbox_data
                .is_data_invalid(&request.data.receiver_key_hash)
            {
                warn!(store = %self.store.store_key(), "receiver hash mismatch at mailbox add");
                return DataStorageResult::rejected(RejectReason::DataInvalid);
            }

            if request.is_public_key_invalid() {
                warn!(store = %self.store.store_key(), "sender key hash mismatch at mailbox add");
                return DataStorageResult::rejected(RejectReason::PublicKeyHashInvalid);
            }

            if request.is_signature_invalid() {
                warn!(store = %self.store.store_key(), "invalid signature at mailbox add");
                return DataStorageResult::rejected(RejectReason::SignatureInvalid);
            }

            existed = map.contains_key(&hash);
            map.insert(hash, MailboxRequest::Add(request.clone()));
        }

        self.store.persist();

        if existed {
            return DataStorageResult::rejected(RejectReason::PayloadAlreadyStored);
        }

        let payload = request.data.mailbox_data;
        self.notify(|listener| listener.on_added(&payload));
        DataStorageResult::added(payload)
    }

    pub fn remove(&self, request: RemoveMailboxRequest) -> DataStorageResult<MailboxData> {
        let hash = request.hash;
        let removed_payload;
        {
            let mut map = self.store.lock_map();

            let Some(stored) = map.get(&hash) else {
                // Tombstone for a message we never saw; the sequence
                // bookkeeping must survive for a late-arriving add.
                map.insert(hash, MailboxRequest::Remove(request));
                drop(map);
                self.store.persist();
                return DataStorageResult::rejected(RejectReason::NoEntry);
            };

            match stored {
                MailboxRequest::Remove(stored_remove) => {
                    if request.sequence_number > stored_remove.sequence_number {
                        map.insert(hash, MailboxRequest::Remove(request));
                        drop(map);
                        self.store.persist();
                    }
                    return DataStorageResult::rejected(RejectReason::AlreadyRemoved);
                }
                MailboxRequest::Add(stored_add) => {
                    let stored_data = &stored_add.data;
                    if request.sequence_number <= stored_data.sequence_number {
                        return DataStorageResult::rejected(RejectReason::SequenceNrInvalid);
                    }
                    if request.is_public_key_hash_invalid(stored_data) {
                        warn!(store = %self.store.store_key(), "remover is not the mailbox receiver");
                        return DataStorageResult::rejected(RejectReason::PublicKeyHashInvalid);
                    }
                    if request.is_signature_invalid() {
                        warn!(store = %self.store.store_key(), "invalid signature at mailbox remove");
                        return DataStorageResult::rejected(RejectReason::SignatureInvalid);
                    }
                    removed_payload = stored_data.mailbox_data.clone();
                    map.insert(hash, MailboxRequest::Remove(request));
                }
            }
        }

        self.store.persist();
        self.notify(|listener| listener.on_removed(&removed_payload));
        DataStorageResult::removed(removed_payload)
    }

    /// Whether a message can still be parked under this hash. False once
    /// the receiver's tombstone is in place.
    pub fn can_add(&self, mailbox_data: &MailboxData) -> bool {
        self.sequence_number(&mailbox_data.content_hash()) < u32::MAX
    }

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
                if let Some(MailboxRequest::Add(add)) = map.remove(&hash) {
                    expired_payloads.push(add.data.mailbox_data);
                }
            }
        }
        if !expired_payloads.is_empty() {
            info!(
                store = %self.store.store_key(),
                count = expired_payloads.len(),
                "pruned expired mailbox entries"
            );
            self.store.persist();
            for payload in &expired_payloads {
                self.notify(|listener| listener.on_removed(payload));
            }
        }
    }

    pub fn shutdown(&self) {
        self.store.flush_if_dirty();
    }

    pub fn add_listener(&self, listener: Arc<dyn MailboxDataListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub(crate) fn store(&self) -> &DataStore<MailboxRequest> {
        &self.store
    }

    pub fn sequence_number(&self, hash: &ContentHash) -> u32 {
        self.store
            .lock_map()
            .get(hash)
            .map(|request| request.sequence_number())
            .unwrap_or(0)
    }

    fn notify(&self, f: impl Fn(&Arc<dyn MailboxDataListener>)) {
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                error!(store = %self.store.store_key(), "mailbox listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyBundle, SealedBox};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingListener {
        added: Mutex<usize>,
        removed: Mutex<usize>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(0),
                removed: Mutex::new(0),
            })
        }
    }

    impl MailboxDataListener for RecordingListener {
        fn on_added(&self, _: &MailboxData) {
            *self.added.lock() += 1;
        }
        fn on_removed(&self, _: &MailboxData) {
            *self.removed.lock() += 1;
        }
    }

    fn service() -> MailboxDataStorageService {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("MailboxMessage").unwrap();
        let meta = MetaData::new("MailboxMessage", Duration::from_secs(3600), 100);
        MailboxDataStorageService::open(tree, &meta).unwrap()
    }

    /// A sealed message from `sender` to `receiver` with a unique body.
    fn mailbox_data(sender: &VeilKeypair, receiver: &KeyBundle, body: &[u8]) -> MailboxData {
        let sealed = SealedBox::seal(body, &receiver.encryption_public_key(), sender).unwrap();
        let message = ConfidentialMessage::new(sealed, receiver.key_hash());
        MailboxData::new(
            message,
            MetaData::new("MailboxMessage", Duration::from_secs(3600), 100),
        )
    }

    #[test]
    fn sender_parks_message_receiver_retracts_it() {
        let service = service();
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());

        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let data = mailbox_data(&sender, &receiver, b"hello");
        let hash = data.content_hash();
        let meta = data.meta_data.clone();

        let add = AddMailboxRequest::from_data(data, 1, receiver.key_hash(), &sender);
        assert!(service.add(add).is_success());
        assert_eq!(*listener.added.lock(), 1);

        // The receiver consumed the message and retracts it with their own
        // keypair; the remove is accepted and notifies.
        let remove = RemoveMailboxRequest::sign(hash, 2, meta, receiver.keypair());
        let result = service.remove(remove);
        assert!(result.is_success());
        assert!(result.removed_data().is_some());
        assert_eq!(*listener.removed.lock(), 1);

        assert!(!service.can_add(result.removed_data().unwrap()));
    }

    #[test]
    fn sender_cannot_retract_a_parked_message() {
        let service = service();
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let data = mailbox_data(&sender, &receiver, b"hello");
        let hash = data.content_hash();
        let meta = data.meta_data.clone();

        let add = AddMailboxRequest::from_data(data, 1, receiver.key_hash(), &sender);
        assert!(service.add(add).is_success());

        // The sender handed the message over; they have no removal authority.
        let remove = RemoveMailboxRequest::sign(hash, 2, meta, &sender);
        let result = service.remove(remove);
        assert_eq!(result.reason(), Some(RejectReason::PublicKeyHashInvalid));
    }

    #[test]
    fn tombstone_blocks_re_adding_the_message() {
        let service = service();
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let data = mailbox_data(&sender, &receiver, b"hello");
        let hash = data.content_hash();
        let meta = data.meta_data.clone();

        let add = AddMailboxRequest::from_data(data.clone(), 1, receiver.key_hash(), &sender);
        assert!(service.add(add).is_success());
        let remove = RemoveMailboxRequest::sign(hash, 2, meta, receiver.keypair());
        assert!(service.remove(remove).is_success());

        let re_add = AddMailboxRequest::from_data(data, 3, receiver.key_hash(), &sender);
        let result = service.add(re_add);
        assert_eq!(result.reason(), Some(RejectReason::SequenceNrInvalid));
        assert_eq!(service.sequence_number(&hash), u32::MAX);
    }

    #[test]
    fn mismatched_receiver_hash_is_data_invalid() {
        let service = service();
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let other = KeyBundle::generate();
        let data = mailbox_data(&sender, &receiver, b"hello");

        // Envelope claims a different receiver than the sealed message.
        let add = AddMailboxRequest::from_data(data, 1, other.key_hash(), &sender);
        let result = service.add(add);
        assert_eq!(result.reason(), Some(RejectReason::DataInvalid));
    }

    #[test]
    fn remove_before_add_stores_tombstone() {
        let service = service();
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let data = mailbox_data(&sender, &receiver, b"hello");
        let hash = data.content_hash();
        let meta = data.meta_data.clone();

        let remove = RemoveMailboxRequest::sign(hash, 1, meta, receiver.keypair());
        let result = service.remove(remove);
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::NoEntry));

        // The add arriving late cannot beat the tombstone.
        let add = AddMailboxRequest::from_data(data, 2, receiver.key_hash(), &sender);
        assert_eq!(
            service.add(add).reason(),
            Some(RejectReason::SequenceNrInvalid)
        );
    }

    #[test]
    fn second_remove_reports_already_removed() {
        let service = service();
        let sender = VeilKeypair::generate();
        let receiver = KeyBundle::generate();
        let data = mailbox_data(&sender, &receiver, b"hello");
        let hash = data.content_hash();
        let meta = data.meta_data.clone();

        let add = AddMailboxRequest::from_data(data, 1, receiver.key_hash(), &sender);
        assert!(service.add(add).is_success());
        let remove = RemoveMailboxRequest::sign(hash, 2, meta.clone(), receiver.keypair());
        assert!(service.remove(remove).is_success());

        let again = RemoveMailboxRequest::sign(hash, 3, meta, receiver.keypair());
        assert_eq!(
            service.remove(again).reason(),
            Some(RejectReason::AlreadyRemoved)
        );
    }
}
