//! # Service Nodes By Transport
//!
//! The top-level facade of the overlay: one [`ServiceNode`] per supported
//! transport, initialized concurrently, addressed collectively. Sends fan
//! out over every transport the receiver advertises an address for, and the
//! per-transport results come back keyed by transport so callers decide
//! what partial success means to them. One transport failing never blocks
//! delivery attempts on the others.
//!
//! The local identity (key material plus per-transport addresses) is
//! persisted keyed by node id, so a restart reuses yesterday's addresses
//! instead of minting new ones.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::confidential::{MessageDeliveryStatus, SendConfidentialMessageResult};
use crate::crypto::KeyBundle;
use crate::data_service::DataService;
use crate::envelope::EnvelopePayload;
use crate::identity::{IdentityStore, NetworkId, DEFAULT_NODE_ID};
use crate::inventory::InventoryConfig;
use crate::node::{Address, ConnectionError, Node, NodeConfig};
use crate::peer_group::PeerGroupConfig;
use crate::service_node::{ServiceNode, ServiceNodeConfig, ServiceNodeListener};
use crate::transport::TransportType;

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Everything needed to build one transport's service node.
pub struct TransportSetup {
    pub node_config: NodeConfig,
    pub service_config: ServiceNodeConfig,
    pub peer_group_config: PeerGroupConfig,
    pub inventory_config: InventoryConfig,
    pub seed_addresses: BTreeSet<Address>,
    /// Port to listen on; 0 lets the OS choose (tests, ephemeral setups).
    pub listen_port: u16,
}

// ---------------------------------------------------------------------------
// ServiceNodesByTransport
// ---------------------------------------------------------------------------

pub struct ServiceNodesByTransport {
    service_nodes: DashMap<TransportType, Arc<ServiceNode>>,
    listen_ports: DashMap<TransportType, u16>,
    key_bundle: Arc<KeyBundle>,
    identity_store: Arc<IdentityStore>,
}

impl ServiceNodesByTransport {
    pub fn new(
        setups: Vec<TransportSetup>,
        key_bundle: Arc<KeyBundle>,
        data_service: Option<Arc<DataService>>,
        identity_store: Arc<IdentityStore>,
    ) -> Arc<Self> {
        let facade = Arc::new(Self {
            service_nodes: DashMap::new(),
            listen_ports: DashMap::new(),
            key_bundle,
            identity_store,
        });
        for setup in setups {
            let transport_type = setup.node_config.transport_config.transport_type;
            let service_node = ServiceNode::new(
                setup.service_config,
                setup.node_config,
                setup.peer_group_config,
                setup.inventory_config,
                facade.key_bundle.clone(),
                data_service.clone(),
                setup.seed_addresses,
            );
            facade.service_nodes.insert(transport_type, service_node);
            facade.listen_ports.insert(transport_type, setup.listen_port);
        }
        facade
    }

    pub fn transports(&self) -> Vec<TransportType> {
        self.service_nodes.iter().map(|entry| *entry.key()).collect()
    }

    pub fn service_node(&self, transport: TransportType) -> Option<Arc<ServiceNode>> {
        self.service_nodes.get(&transport).map(|entry| entry.clone())
    }

    /// The persisted identity for the default node, or a fresh one derived
    /// from the key bundle.
    pub fn default_network_id(&self) -> NetworkId {
        match self.identity_store.get(DEFAULT_NODE_ID) {
            Ok(Some(network_id)) => network_id,
            Ok(None) => NetworkId::from_key_bundle(DEFAULT_NODE_ID, &self.key_bundle),
            Err(e) => {
                warn!(error = %e, "identity store unreadable, using fresh identity");
                NetworkId::from_key_bundle(DEFAULT_NODE_ID, &self.key_bundle)
            }
        }
    }

    /// Launch the default-node initialization of every transport
    /// concurrently and collect the per-transport outcomes. The identity is
    /// re-persisted with each transport's actual bound address, so a
    /// restart advertises the same endpoints.
    pub async fn get_initialized_default_node_by_transport(
        self: &Arc<Self>,
    ) -> HashMap<TransportType, Result<Arc<Node>, ConnectionError>> {
        let network_id = self.default_network_id();

        let mut tasks = Vec::new();
        for entry in self.service_nodes.iter() {
            let transport_type = *entry.key();
            let service_node = entry.value().clone();
            let port = self
                .listen_ports
                .get(&transport_type)
                .map(|p| *p)
                .unwrap_or(0);
            let network_id = network_id.clone();
            tasks.push(tokio::spawn(async move {
                let result = service_node
                    .get_initialized_default_node(network_id, port)
                    .await;
                (transport_type, result)
            }));
        }

        let mut results = HashMap::new();
        let mut persisted_identity = network_id;
        for task in tasks {
            match task.await {
                Ok((transport_type, result)) => {
                    if let Ok(node) = &result {
                        if let Some(address) = node.my_address() {
                            persisted_identity =
                                persisted_identity.with_address(transport_type, address);
                        }
                    }
                    results.insert(transport_type, result);
                }
                Err(e) => warn!(error = %e, "initialization task panicked"),
            }
        }

        if let Err(e) = self.identity_store.put(&persisted_identity) {
            warn!(error = %e, "failed to persist network identity");
        } else {
            info!(identity = %persisted_identity, "network identity persisted");
        }
        results
    }

    pub fn is_initialized(&self, transport: TransportType) -> bool {
        self.service_node(transport)
            .is_some_and(|service_node| service_node.is_initialized())
    }

    pub fn is_node_on_all_transports_initialized(&self) -> bool {
        !self.service_nodes.is_empty()
            && self
                .service_nodes
                .iter()
                .all(|entry| entry.value().is_initialized())
    }

    /// Send a confidential message over every transport the receiver has an
    /// address for. Results are keyed by transport; transports this node
    /// does not run, or that lack confidential support, are skipped.
    pub async fn confidential_send(
        self: &Arc<Self>,
        plaintext: &[u8],
        receiver: &NetworkId,
        sender_node_id: &str,
    ) -> HashMap<TransportType, SendConfidentialMessageResult> {
        let mut results = HashMap::new();
        for (transport_type, address) in &receiver.addresses {
            let Some(service_node) = self.service_node(*transport_type) else {
                continue;
            };
            let Some(confidential) = service_node.confidential_message_service() else {
                continue;
            };
            let result = confidential
                .send(plaintext, receiver, address, sender_node_id)
                .await;
            results.insert(*transport_type, result);
        }
        results
    }

    /// True when at least one transport reports a delivery that reached the
    /// receiver or their mailbox.
    pub fn any_delivery_succeeded(
        results: &HashMap<TransportType, SendConfidentialMessageResult>,
    ) -> bool {
        results.values().any(|result| {
            matches!(
                result.status,
                MessageDeliveryStatus::Sent
                    | MessageDeliveryStatus::StoredInMailbox
                    | MessageDeliveryStatus::AckReceived
            )
        })
    }

    /// Plain send over every transport the receiver advertises.
    pub async fn send(
        self: &Arc<Self>,
        sender_node_id: &str,
        payload: EnvelopePayload,
        receiver: &NetworkId,
    ) -> HashMap<TransportType, Result<(), ConnectionError>> {
        let mut results = HashMap::new();
        for (transport_type, address) in &receiver.addresses {
            let Some(service_node) = self.service_node(*transport_type) else {
                continue;
            };
            let result = service_node
                .send(sender_node_id, address, payload.clone())
                .await;
            results.insert(*transport_type, result);
        }
        results
    }

    pub fn add_service_node_listener(&self, listener: Arc<dyn ServiceNodeListener>) {
        for entry in self.service_nodes.iter() {
            entry.value().add_listener(listener.clone());
        }
    }

    pub fn add_seed_address(&self, transport: TransportType, address: Address) {
        if let Some(service_node) = self.service_node(transport) {
            service_node.add_seed_address(address);
        }
    }

    /// Shut down every transport's service node and clear the map only
    /// after all of them finished, successfully or not.
    pub async fn shutdown(self: &Arc<Self>) {
        let service_nodes: Vec<Arc<ServiceNode>> = self
            .service_nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut tasks = Vec::new();
        for service_node in service_nodes {
            tasks.push(tokio::spawn(async move {
                service_node.shutdown().await;
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "service node shutdown task panicked");
            }
        }
        self.service_nodes.clear();
        self.listen_ports.clear();
        info!("all transports shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageService;
    use crate::transport::TransportConfig;

    fn clearnet_setup() -> TransportSetup {
        TransportSetup {
            node_config: NodeConfig::new(TransportConfig::localhost()),
            service_config: ServiceNodeConfig::all(),
            peer_group_config: PeerGroupConfig::default(),
            inventory_config: InventoryConfig::default(),
            seed_addresses: BTreeSet::new(),
            listen_port: 0,
        }
    }

    fn facade() -> Arc<ServiceNodesByTransport> {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let identity_store = Arc::new(IdentityStore::open(&db).unwrap());
        let data_service = DataService::new(Arc::new(StorageService::open_temporary().unwrap()));
        ServiceNodesByTransport::new(
            vec![clearnet_setup()],
            Arc::new(KeyBundle::generate()),
            Some(data_service),
            identity_store,
        )
    }

    #[tokio::test]
    async fn initializes_and_persists_identity() {
        let facade = facade();
        assert!(!facade.is_node_on_all_transports_initialized());

        let results = facade.get_initialized_default_node_by_transport().await;
        assert_eq!(results.len(), 1);
        assert!(results[&TransportType::Clear].is_ok());
        assert!(facade.is_initialized(TransportType::Clear));
        assert!(facade.is_node_on_all_transports_initialized());

        // The identity now carries the bound clearnet address.
        let identity = facade.default_network_id();
        assert!(identity.address_for(TransportType::Clear).is_some());

        facade.shutdown().await;
        assert!(facade.transports().is_empty());
    }

    #[tokio::test]
    async fn one_failing_transport_does_not_block_the_others() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let identity_store = Arc::new(IdentityStore::open(&db).unwrap());
        let data_service = DataService::new(Arc::new(StorageService::open_temporary().unwrap()));

        // A transport that cannot bind: the host is TEST-NET space, not a
        // local interface.
        let mut broken = clearnet_setup();
        broken.node_config.transport_config.transport_type = TransportType::Tor;
        broken.node_config.transport_config.bind_host = "203.0.113.1".to_string();

        let facade = ServiceNodesByTransport::new(
            vec![clearnet_setup(), broken],
            Arc::new(KeyBundle::generate()),
            Some(data_service),
            identity_store,
        );

        let results = facade.get_initialized_default_node_by_transport().await;
        assert!(results[&TransportType::Clear].is_ok());
        assert!(results[&TransportType::Tor].is_err());

        // The healthy transport is initialized and usable.
        assert!(facade.is_initialized(TransportType::Clear));
        assert!(!facade.is_initialized(TransportType::Tor));
        assert!(!facade.is_node_on_all_transports_initialized());

        facade.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_transport_is_skipped_in_sends() {
        let facade = facade();
        facade.get_initialized_default_node_by_transport().await;

        // Receiver only reachable over Tor, which this facade does not run.
        let receiver = NetworkId::from_key_bundle("peer", &KeyBundle::generate()).with_address(
            TransportType::Tor,
            Address::new("peerexample.onion".to_string(), 8940),
        );
        let results = facade.confidential_send(b"hello", &receiver, DEFAULT_NODE_ID).await;
        assert!(results.is_empty());
        assert!(!ServiceNodesByTransport::any_delivery_succeeded(&results));

        facade.shutdown().await;
    }
}
