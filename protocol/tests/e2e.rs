//! End-to-end integration tests for the VEIL overlay.
//!
//! These tests wire two (or three) full service-node stacks together over
//! loopback TCP and prove that the layers compose: transport bind, the
//! proof-of-work handshake, peer-group bootstrap via seeds, flood
//! replication with sequence-number conflict resolution, inventory
//! reconciliation for late joiners, and confidential messaging with acks
//! and mailbox fallback.
//!
//! Each test stands alone with its own temporary databases and ephemeral
//! ports. No shared state, no test ordering dependencies.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use veil_protocol::confidential::{ConfidentialMessageListener, MessageDeliveryStatus};
use veil_protocol::crypto::{KeyBundle, VeilPublicKey};
use veil_protocol::data_service::DataService;
use veil_protocol::identity::{IdentityStore, NetworkId, DEFAULT_NODE_ID};
use veil_protocol::inventory::InventoryConfig;
use veil_protocol::node::{Address, NodeConfig};
use veil_protocol::peer_group::PeerGroupConfig;
use veil_protocol::service_node::{ServiceNodeConfig, ServiceNodeState};
use veil_protocol::service_nodes::{ServiceNodesByTransport, TransportSetup};
use veil_protocol::storage::{DistributedData, MetaData, StorageService};
use veil_protocol::transport::{TransportConfig, TransportType};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// One full overlay peer: facade, data service, and key material.
struct Peer {
    facade: Arc<ServiceNodesByTransport>,
    data_service: Arc<DataService>,
    key_bundle: Arc<KeyBundle>,
}

impl Peer {
    /// Build and initialize a clearnet peer seeded with `seeds`.
    async fn start(seeds: BTreeSet<Address>) -> Self {
        let key_bundle = Arc::new(KeyBundle::generate());
        let data_service = DataService::new(Arc::new(
            StorageService::open_temporary().expect("temp storage"),
        ));
        let identity_db = sled::Config::new().temporary(true).open().expect("temp db");
        let identity_store = Arc::new(IdentityStore::open(&identity_db).expect("identity store"));

        let setup = TransportSetup {
            node_config: NodeConfig::new(TransportConfig::localhost()),
            service_config: ServiceNodeConfig::all(),
            peer_group_config: PeerGroupConfig::default(),
            inventory_config: InventoryConfig::default(),
            seed_addresses: seeds,
            listen_port: 0,
        };
        let facade = ServiceNodesByTransport::new(
            vec![setup],
            key_bundle.clone(),
            Some(data_service.clone()),
            identity_store,
        );

        let results = facade.get_initialized_default_node_by_transport().await;
        assert!(
            results[&TransportType::Clear].is_ok(),
            "clearnet must initialize"
        );

        Self {
            facade,
            data_service,
            key_bundle,
        }
    }

    /// The peer's clearnet listening address.
    fn address(&self) -> Address {
        self.facade
            .default_network_id()
            .address_for(TransportType::Clear)
            .expect("clearnet address")
            .clone()
    }

    /// The peer's shareable identity.
    fn network_id(&self) -> NetworkId {
        self.facade.default_network_id()
    }

    async fn stop(&self) {
        self.facade.shutdown().await;
    }
}

fn test_payload(tag: &str) -> DistributedData {
    DistributedData::new(
        tag.as_bytes().to_vec(),
        MetaData::new("E2ePayload", Duration::from_secs(3600), 1000),
    )
}

/// Poll until `condition` holds or the deadline passes.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

struct RecordingListener {
    received: Mutex<Vec<(Vec<u8>, String)>>,
}

impl RecordingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }
}

impl ConfidentialMessageListener for RecordingListener {
    fn on_message(&self, plaintext: &[u8], _sender: &VeilPublicKey, message_id: &str) {
        self.received
            .lock()
            .push((plaintext.to_vec(), message_id.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn seeded_peer_connects_and_reaches_initialized() {
    let seed_peer = Peer::start(BTreeSet::new()).await;
    let joiner = Peer::start(BTreeSet::from([seed_peer.address()])).await;

    assert!(joiner.facade.is_initialized(TransportType::Clear));
    assert_eq!(
        joiner
            .facade
            .service_node(TransportType::Clear)
            .unwrap()
            .state(),
        ServiceNodeState::Initialized
    );

    // Bootstrap dialed the seed during initialization.
    let service_node = joiner.facade.service_node(TransportType::Clear).unwrap();
    let node = service_node.default_node().unwrap();
    assert!(node.connection_count() >= 1);

    joiner.stop().await;
    seed_peer.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn published_data_replicates_to_connected_peer() {
    let publisher = Peer::start(BTreeSet::new()).await;
    let replica = Peer::start(BTreeSet::from([publisher.address()])).await;

    let keypair = publisher.key_bundle.keypair();
    let result = publisher
        .data_service
        .add_authenticated_data(test_payload("replicated-offer"), keypair)
        .unwrap();
    assert!(result.is_success());

    let replica_storage = replica.data_service.storage().clone();
    wait_for("payload to replicate", move || {
        replica_storage
            .authenticated_store("E2ePayload")
            .map(|store| store.len() == 1)
            .unwrap_or(false)
    })
    .await;

    replica.stop().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retraction_replicates_and_blocks_re_add() {
    let publisher = Peer::start(BTreeSet::new()).await;
    let replica = Peer::start(BTreeSet::from([publisher.address()])).await;

    let keypair = publisher.key_bundle.keypair();
    let payload = test_payload("short-lived");
    let hash = payload.content_hash();

    publisher
        .data_service
        .add_authenticated_data(payload.clone(), keypair)
        .unwrap();
    let replica_storage = replica.data_service.storage().clone();
    wait_for("add to replicate", {
        let storage = replica_storage.clone();
        move || {
            storage
                .authenticated_store("E2ePayload")
                .map(|store| store.sequence_number(&hash) >= 1)
                .unwrap_or(false)
        }
    })
    .await;

    publisher
        .data_service
        .remove_authenticated_data(&payload, keypair)
        .unwrap();
    wait_for("tombstone to replicate", {
        let storage = replica_storage.clone();
        move || {
            storage
                .authenticated_store("E2ePayload")
                .map(|store| store.sequence_number(&hash) == u32::MAX)
                .unwrap_or(false)
        }
    })
    .await;

    replica.stop().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_joiner_converges_through_inventory() {
    let publisher = Peer::start(BTreeSet::new()).await;

    // Publish before the second peer even exists.
    let keypair = publisher.key_bundle.keypair();
    for tag in ["inv-1", "inv-2", "inv-3"] {
        publisher
            .data_service
            .add_authenticated_data(test_payload(tag), keypair)
            .unwrap();
    }

    let late_joiner = Peer::start(BTreeSet::from([publisher.address()])).await;
    let storage = late_joiner.data_service.storage().clone();
    wait_for("inventory reconciliation", move || {
        storage
            .authenticated_store("E2ePayload")
            .map(|store| store.len() == 3)
            .unwrap_or(false)
    })
    .await;

    late_joiner.stop().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn confidential_message_is_delivered_and_acked() {
    let sender = Peer::start(BTreeSet::new()).await;
    let receiver = Peer::start(BTreeSet::from([sender.address()])).await;

    let listener = RecordingListener::new();
    receiver
        .facade
        .service_node(TransportType::Clear)
        .unwrap()
        .confidential_message_service()
        .unwrap()
        .add_listener(listener.clone());

    let results = sender
        .facade
        .confidential_send(b"meet at dawn", &receiver.network_id(), DEFAULT_NODE_ID)
        .await;
    assert!(ServiceNodesByTransport::any_delivery_succeeded(&results));
    let message_id = results[&TransportType::Clear].message_id.clone();

    wait_for("message to arrive", {
        let listener = listener.clone();
        move || !listener.received.lock().is_empty()
    })
    .await;
    {
        let received = listener.received.lock();
        assert_eq!(received[0].0, b"meet at dawn");
        assert_eq!(received[0].1, message_id);
    }

    // The receiver acked; the sender's delivery status follows.
    let confidential = sender
        .facade
        .service_node(TransportType::Clear)
        .unwrap()
        .confidential_message_service()
        .unwrap();
    wait_for("ack to arrive", move || {
        confidential.delivery_status(&message_id) == Some(MessageDeliveryStatus::AckReceived)
    })
    .await;

    receiver.stop().await;
    sender.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_receiver_falls_back_to_mailbox() {
    let sender = Peer::start(BTreeSet::new()).await;

    // A receiver identity that advertises an address nobody listens on.
    let ghost_bundle = KeyBundle::generate();
    let ghost = NetworkId::from_key_bundle(DEFAULT_NODE_ID, &ghost_bundle).with_address(
        TransportType::Clear,
        Address::new("127.0.0.1".to_string(), 9),
    );

    let results = sender
        .facade
        .confidential_send(b"catch up later", &ghost, DEFAULT_NODE_ID)
        .await;
    assert_eq!(
        results[&TransportType::Clear].status,
        MessageDeliveryStatus::StoredInMailbox
    );

    // The sealed message sits in the local mailbox store, ready to gossip
    // to whoever connects.
    assert_eq!(sender.data_service.storage().total_entries(), 1);

    sender.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_tears_down_both_sides() {
    let seed_peer = Peer::start(BTreeSet::new()).await;
    let joiner = Peer::start(BTreeSet::from([seed_peer.address()])).await;

    let seed_service_node = seed_peer.facade.service_node(TransportType::Clear).unwrap();
    joiner.stop().await;
    assert!(joiner.facade.transports().is_empty());

    // The seed notices the peer going away.
    let node = seed_service_node.default_node().unwrap();
    wait_for("seed to drop the connection", move || {
        node.connection_count() == 0
    })
    .await;

    seed_peer.stop().await;
}
