//! # Data Service
//!
//! The seam between the storage engine and the rest of the world. Local
//! callers publish and retract payloads here; inbound storage requests from
//! peers are funneled here by the per-transport [`DataNetworkService`];
//! application subsystems register a [`DataServiceListener`] to follow the
//! replicated state.
//!
//! Accepted requests are re-broadcast to the connected peer group (minus
//! the peer that delivered them), which is the whole replication mechanism:
//! flooding with the storage layer's sequence-number rules as the
//! convergence guarantee. Rejected requests are dropped silently; a stale
//! or duplicate request is routine gossip noise, not an error.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use crate::crypto::{KeyHash, VeilKeypair};
use crate::envelope::EnvelopePayload;
use crate::node::{Address, Connection, Node, NodeListener};
use crate::storage::{
    AddAuthenticatedDataRequest, AddMailboxRequest, AuthenticatedDataListener, DataStorageResult,
    DistributedData, MailboxData, MailboxDataListener, RemoveAuthenticatedDataRequest,
    RemoveMailboxRequest, StorageService, StoreError,
};

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Application-facing view of replicated state changes. All methods default
/// to no-ops so implementors subscribe to what they care about.
pub trait DataServiceListener: Send + Sync {
    fn on_authenticated_data_added(&self, data: &DistributedData) {
        let _ = data;
    }
    fn on_authenticated_data_removed(&self, data: &DistributedData) {
        let _ = data;
    }
    fn on_mailbox_data_added(&self, data: &MailboxData) {
        let _ = data;
    }
    fn on_mailbox_data_removed(&self, data: &MailboxData) {
        let _ = data;
    }
}

// ---------------------------------------------------------------------------
// DataService
// ---------------------------------------------------------------------------

/// Facade over all stores plus the broadcast fan-out.
pub struct DataService {
    storage: Arc<StorageService>,
    listeners: RwLock<Vec<Arc<dyn DataServiceListener>>>,
    broadcasters: RwLock<Vec<Weak<DataNetworkService>>>,
    /// Store classes whose events are already forwarded to our listeners.
    /// Stores must not be subscribed twice or every event doubles.
    attached_auth_stores: parking_lot::Mutex<std::collections::HashSet<String>>,
    attached_mailbox_stores: parking_lot::Mutex<std::collections::HashSet<String>>,
}

impl DataService {
    pub fn new(storage: Arc<StorageService>) -> Arc<Self> {
        let service = Arc::new(Self {
            storage,
            listeners: RwLock::new(Vec::new()),
            broadcasters: RwLock::new(Vec::new()),
            attached_auth_stores: parking_lot::Mutex::new(std::collections::HashSet::new()),
            attached_mailbox_stores: parking_lot::Mutex::new(std::collections::HashSet::new()),
        });

        // Forward store events of everything already persisted; stores
        // created later are wired in the get-or-create paths below.
        let mut auth_stores = Vec::new();
        service.storage.for_each_authenticated_store(|name, store| {
            auth_stores.push((name.to_string(), store.clone()));
        });
        for (name, store) in auth_stores {
            service.attach_store_adapter_auth(&name, &store);
        }
        let mut mailbox_stores = Vec::new();
        service.storage.for_each_mailbox_store(|name, store| {
            mailbox_stores.push((name.to_string(), store.clone()));
        });
        for (name, store) in mailbox_stores {
            service.attach_store_adapter_mailbox(&name, &store);
        }
        service
    }

    pub fn storage(&self) -> &Arc<StorageService> {
        &self.storage
    }

    pub fn add_listener(&self, listener: Arc<dyn DataServiceListener>) {
        self.listeners.write().push(listener);
    }

    /// Hook one transport's broadcaster in. Held weakly; a torn-down
    /// service node disappears from the fan-out on its own.
    pub fn register_broadcaster(self: &Arc<Self>, broadcaster: &Arc<DataNetworkService>) {
        self.broadcasters.write().push(Arc::downgrade(broadcaster));
    }

    // -- Local publication ---------------------------------------------------

    /// Publish a payload as `keypair`. Assigns the next sequence number for
    /// the content hash, stores locally, and broadcasts on success.
    pub fn add_authenticated_data(
        self: &Arc<Self>,
        data: DistributedData,
        keypair: &VeilKeypair,
    ) -> Result<DataStorageResult<DistributedData>, StoreError> {
        let store = self
            .storage
            .get_or_create_authenticated_store(&data.meta_data)?;
        self.attach_store_adapter_auth(&data.meta_data.class_name, &store);

        let next_sequence = store.sequence_number(&data.content_hash()).saturating_add(1);
        let request = AddAuthenticatedDataRequest::from_data(data, next_sequence, keypair);
        let result = store.add(request.clone());
        if result.is_success() {
            self.broadcast(EnvelopePayload::AddAuthenticatedData(request), None);
        }
        Ok(result)
    }

    /// Retract a payload we published earlier.
    pub fn remove_authenticated_data(
        self: &Arc<Self>,
        data: &DistributedData,
        keypair: &VeilKeypair,
    ) -> Result<DataStorageResult<DistributedData>, StoreError> {
        let store = self
            .storage
            .get_or_create_authenticated_store(&data.meta_data)?;
        let hash = data.content_hash();
        let next_sequence = store.sequence_number(&hash).saturating_add(1);
        let request = RemoveAuthenticatedDataRequest::sign(
            hash,
            next_sequence,
            data.meta_data.clone(),
            keypair,
        );
        let result = store.remove(request.clone());
        if result.is_success() {
            self.broadcast(EnvelopePayload::RemoveAuthenticatedData(request), None);
        }
        Ok(result)
    }

    /// Park a sealed message in the receiver's mailbox store and broadcast.
    pub fn add_mailbox_data(
        self: &Arc<Self>,
        mailbox_data: MailboxData,
        receiver_key_hash: KeyHash,
        sender_keypair: &VeilKeypair,
    ) -> Result<DataStorageResult<MailboxData>, StoreError> {
        let store = self
            .storage
            .get_or_create_mailbox_store(&mailbox_data.meta_data)?;
        self.attach_store_adapter_mailbox(&mailbox_data.meta_data.class_name, &store);

        let next_sequence = store
            .sequence_number(&mailbox_data.content_hash())
            .saturating_add(1);
        let request =
            AddMailboxRequest::from_data(mailbox_data, next_sequence, receiver_key_hash, sender_keypair);
        let result = store.add(request.clone());
        if result.is_success() {
            self.broadcast(EnvelopePayload::AddMailboxData(request), None);
        }
        Ok(result)
    }

    /// Retract a consumed mailbox message as its receiver.
    pub fn remove_mailbox_data(
        self: &Arc<Self>,
        mailbox_data: &MailboxData,
        receiver_keypair: &VeilKeypair,
    ) -> Result<DataStorageResult<MailboxData>, StoreError> {
        let store = self
            .storage
            .get_or_create_mailbox_store(&mailbox_data.meta_data)?;
        // A mailbox retraction is final; the maximum sequence number makes
        // the tombstone unbeatable from the start.
        let request = RemoveMailboxRequest::sign(
            mailbox_data.content_hash(),
            u32::MAX,
            mailbox_data.meta_data.clone(),
            receiver_keypair,
        );
        let result = store.remove(request.clone());
        if result.is_success() {
            self.broadcast(EnvelopePayload::RemoveMailboxData(request), None);
        }
        Ok(result)
    }

    // -- Network ingestion ---------------------------------------------------

    /// Apply a storage request that arrived from a peer. On acceptance the
    /// request is re-broadcast, excluding the delivering peer; `rebroadcast`
    /// is false for inventory reconciliation, which is pull-based.
    pub fn process_storage_payload(
        self: &Arc<Self>,
        payload: &EnvelopePayload,
        source: Option<&Address>,
        rebroadcast: bool,
    ) {
        let accepted = match payload {
            EnvelopePayload::AddAuthenticatedData(request) => self
                .storage
                .get_or_create_authenticated_store(&request.data.data.meta_data)
                .map(|store| {
                    self.attach_store_adapter_auth(&request.data.data.meta_data.class_name, &store);
                    store.add(request.clone()).is_success()
                }),
            EnvelopePayload::RemoveAuthenticatedData(request) => self
                .storage
                .get_or_create_authenticated_store(&request.meta_data)
                .map(|store| store.remove(request.clone()).is_success()),
            EnvelopePayload::AddMailboxData(request) => self
                .storage
                .get_or_create_mailbox_store(&request.data.mailbox_data.meta_data)
                .map(|store| {
                    self.attach_store_adapter_mailbox(
                        &request.data.mailbox_data.meta_data.class_name,
                        &store,
                    );
                    store.add(request.clone()).is_success()
                }),
            EnvelopePayload::RemoveMailboxData(request) => self
                .storage
                .get_or_create_mailbox_store(&request.meta_data)
                .map(|store| store.remove(request.clone()).is_success()),
            _ => return,
        };

        match accepted {
            Ok(true) if rebroadcast => self.broadcast(payload.clone(), source),
            Ok(_) => {}
            Err(e) => error!(error = %e, "store unavailable for inbound request"),
        }
    }

    fn broadcast(&self, payload: EnvelopePayload, exclude: Option<&Address>) {
        let mut broadcasters = self.broadcasters.write();
        broadcasters.retain(|weak| weak.strong_count() > 0);
        for weak in broadcasters.iter() {
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.broadcast(payload.clone(), exclude);
            }
        }
    }

    fn attach_store_adapter_auth(
        self: &Arc<Self>,
        class_name: &str,
        store: &Arc<crate::storage::AuthenticatedDataStorageService>,
    ) {
        if self.attached_auth_stores.lock().insert(class_name.to_string()) {
            store.add_listener(Arc::new(StoreEventAdapter {
                data_service: Arc::downgrade(self),
            }));
        }
    }

    fn attach_store_adapter_mailbox(
        self: &Arc<Self>,
        class_name: &str,
        store: &Arc<crate::storage::MailboxDataStorageService>,
    ) {
        if self
            .attached_mailbox_stores
            .lock()
            .insert(class_name.to_string())
        {
            store.add_listener(Arc::new(StoreEventAdapter {
                data_service: Arc::downgrade(self),
            }));
        }
    }

    fn notify(&self, f: impl Fn(&Arc<dyn DataServiceListener>)) {
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                error!("data service listener panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store event adapter
// ---------------------------------------------------------------------------

/// Forwards per-store events to the aggregated data-service listeners.
struct StoreEventAdapter {
    data_service: Weak<DataService>,
}

impl AuthenticatedDataListener for StoreEventAdapter {
    fn on_added(&self, data: &DistributedData) {
        if let Some(service) = self.data_service.upgrade() {
            service.notify(|listener| listener.on_authenticated_data_added(data));
        }
    }
    fn on_removed(&self, data: &DistributedData) {
        if let Some(service) = self.data_service.upgrade() {
            service.notify(|listener| listener.on_authenticated_data_removed(data));
        }
    }
}

impl MailboxDataListener for StoreEventAdapter {
    fn on_added(&self, data: &MailboxData) {
        if let Some(service) = self.data_service.upgrade() {
            service.notify(|listener| listener.on_mailbox_data_added(data));
        }
    }
    fn on_removed(&self, data: &MailboxData) {
        if let Some(service) = self.data_service.upgrade() {
            service.notify(|listener| listener.on_mailbox_data_removed(data));
        }
    }
}

// ---------------------------------------------------------------------------
// DataNetworkService
// ---------------------------------------------------------------------------

/// Per-transport glue between a node and the data service: feeds inbound
/// storage requests into the engine and floods accepted requests to the
/// connected peers.
pub struct DataNetworkService {
    node: Arc<Node>,
    data_service: Arc<DataService>,
}

impl DataNetworkService {
    pub fn new(node: Arc<Node>, data_service: Arc<DataService>) -> Arc<Self> {
        let service = Arc::new(Self { node, data_service });
        service.data_service.register_broadcaster(&service);
        service
    }

    /// Flood a storage payload to every connected peer except `exclude`.
    /// Sends are fire-and-forget; a peer that cannot be reached right now
    /// will converge later through inventory reconciliation.
    pub fn broadcast(&self, payload: EnvelopePayload, exclude: Option<&Address>) {
        for address in self.node.connected_addresses() {
            if Some(&address) == exclude {
                continue;
            }
            let node = self.node.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = node.send(&address, payload).await {
                    debug!(peer = %address, error = %e, "broadcast delivery failed");
                }
            });
        }
    }

    pub fn shutdown(&self) {}
}

impl NodeListener for DataNetworkService {
    fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>) {
        self.data_service
            .process_storage_payload(payload, Some(connection.peer_address()), true);
    }

    fn on_connection(&self, _connection: &Arc<Connection>) {}

    fn on_disconnect(&self, _connection: &Arc<Connection>, _reason: crate::node::CloseReason) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MetaData, RejectReason};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingListener {
        auth_added: Mutex<usize>,
        auth_removed: Mutex<usize>,
        mailbox_added: Mutex<usize>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                auth_added: Mutex::new(0),
                auth_removed: Mutex::new(0),
                mailbox_added: Mutex::new(0),
            })
        }
    }

    impl DataServiceListener for RecordingListener {
        fn on_authenticated_data_added(&self, _: &DistributedData) {
            *self.auth_added.lock() += 1;
        }
        fn on_authenticated_data_removed(&self, _: &DistributedData) {
            *self.auth_removed.lock() += 1;
        }
        fn on_mailbox_data_added(&self, _: &MailboxData) {
            *self.mailbox_added.lock() += 1;
        }
    }

    fn data_service() -> Arc<DataService> {
        DataService::new(Arc::new(StorageService::open_temporary().unwrap()))
    }

    fn payload(tag: &[u8]) -> DistributedData {
        DistributedData::new(
            tag.to_vec(),
            MetaData::new("TestPayload", Duration::from_secs(3600), 100),
        )
    }

    #[test]
    fn publish_assigns_increasing_sequence_numbers() {
        let service = data_service();
        let keypair = VeilKeypair::generate();

        let result = service.add_authenticated_data(payload(b"a"), &keypair).unwrap();
        assert!(result.is_success());

        // Retract, which parks a tombstone at the next sequence number.
        let result = service
            .remove_authenticated_data(&payload(b"a"), &keypair)
            .unwrap();
        assert!(result.is_success());

        // Publishing the same content again loses against the tombstone.
        let result = service.add_authenticated_data(payload(b"a"), &keypair).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.reason(), Some(RejectReason::SequenceNrInvalid));
    }

    #[test]
    fn listeners_follow_the_replicated_state() {
        let service = data_service();
        let listener = RecordingListener::new();
        service.add_listener(listener.clone());
        let keypair = VeilKeypair::generate();

        service.add_authenticated_data(payload(b"a"), &keypair).unwrap();
        service.add_authenticated_data(payload(b"b"), &keypair).unwrap();
        service
            .remove_authenticated_data(&payload(b"a"), &keypair)
            .unwrap();

        assert_eq!(*listener.auth_added.lock(), 2);
        assert_eq!(*listener.auth_removed.lock(), 1);
    }

    #[test]
    fn network_requests_flow_through_process() {
        let publisher = data_service();
        let replica = data_service();
        let keypair = VeilKeypair::generate();

        // Build the request on one service, apply it on another, the way a
        // gossiped envelope would arrive.
        let request = AddAuthenticatedDataRequest::from_data(payload(b"a"), 1, &keypair);
        let envelope_payload = EnvelopePayload::AddAuthenticatedData(request);

        let listener = RecordingListener::new();
        replica.add_listener(listener.clone());
        replica.process_storage_payload(&envelope_payload, None, true);

        assert_eq!(*listener.auth_added.lock(), 1);
        // Duplicate gossip does not re-notify.
        replica.process_storage_payload(&envelope_payload, None, true);
        assert_eq!(*listener.auth_added.lock(), 1);
        let _ = publisher;
    }
}
