//! # Service Node
//!
//! One transport's bundle of overlay services sharing a default node: peer
//! group, data replication, inventory reconciliation, and confidential
//! messaging, each constructed only when the transport's supported-service
//! set asks for it.
//!
//! The lifecycle is a strictly monotonic state machine:
//!
//! ```text
//! NEW -> INITIALIZING -> INITIALIZED -> STOPPING -> TERMINATED
//! ```
//!
//! Moving backward (or standing still) through `set_state` is a programming
//! error and asserts, because it can only happen when lifecycle code is
//! wired wrong, never as a runtime data condition. Shutdown is best-effort:
//! every sub-service is stopped even when an earlier one fails, and the
//! terminal state is reached regardless.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info};

use crate::authorization::AuthorizationService;
use crate::confidential::{ConfidentialMessageService, SendConfidentialMessageResult};
use crate::crypto::KeyBundle;
use crate::data_service::{DataNetworkService, DataService};
use crate::envelope::EnvelopePayload;
use crate::identity::NetworkId;
use crate::inventory::{InventoryConfig, InventoryService};
use crate::node::{
    Address, ConnectionError, NetworkLoadSnapshot, Node, NodeConfig, NodesById,
};
use crate::peer_group::{BanList, PeerGroupConfig, PeerGroupManager, PeerGroupService};
use crate::transport::{create_transport, TransportType};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state, ordered. Transitions must strictly increase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceNodeState {
    New,
    Initializing,
    Initialized,
    Stopping,
    Terminated,
}

impl ServiceNodeState {
    fn ordinal(self) -> u8 {
        match self {
            ServiceNodeState::New => 0,
            ServiceNodeState::Initializing => 1,
            ServiceNodeState::Initialized => 2,
            ServiceNodeState::Stopping => 3,
            ServiceNodeState::Terminated => 4,
        }
    }
}

/// The optional services a transport can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SupportedService {
    PeerGroup,
    Data,
    Confidential,
    Ack,
}

/// Which services this transport runs. Data replication additionally
/// requires a peer group to gossip through; a `Data` entry without
/// `PeerGroup` is inert.
#[derive(Clone, Debug)]
pub struct ServiceNodeConfig {
    pub supported_services: BTreeSet<SupportedService>,
}

impl ServiceNodeConfig {
    pub fn all() -> Self {
        Self {
            supported_services: BTreeSet::from([
                SupportedService::PeerGroup,
                SupportedService::Data,
                SupportedService::Confidential,
                SupportedService::Ack,
            ]),
        }
    }

    pub fn supports(&self, service: SupportedService) -> bool {
        self.supported_services.contains(&service)
    }
}

/// Lifecycle observer.
pub trait ServiceNodeListener: Send + Sync {
    fn on_state_changed(&self, state: ServiceNodeState);
}

// ---------------------------------------------------------------------------
// ServiceNode
// ---------------------------------------------------------------------------

pub struct ServiceNode {
    config: ServiceNodeConfig,
    peer_group_config: PeerGroupConfig,
    inventory_config: InventoryConfig,
    transport_type: TransportType,
    key_bundle: Arc<KeyBundle>,
    /// The node-wide data service, shared across transports. Absent when
    /// the deployment runs without replication entirely.
    data_service: Option<Arc<DataService>>,

    nodes_by_id: Arc<NodesById>,
    ban_list: Arc<BanList>,
    peer_group_service: Arc<PeerGroupService>,
    load_snapshot: Arc<NetworkLoadSnapshot>,

    default_node: RwLock<Option<Arc<Node>>>,
    peer_group_manager: RwLock<Option<Arc<PeerGroupManager>>>,
    data_network_service: RwLock<Option<Arc<DataNetworkService>>>,
    inventory_service: RwLock<Option<Arc<InventoryService>>>,
    confidential_message_service: RwLock<Option<Arc<ConfidentialMessageService>>>,

    state: RwLock<ServiceNodeState>,
    listeners: RwLock<Vec<Arc<dyn ServiceNodeListener>>>,
}

impl ServiceNode {
    pub fn new(
        config: ServiceNodeConfig,
        node_config: NodeConfig,
        peer_group_config: PeerGroupConfig,
        inventory_config: InventoryConfig,
        key_bundle: Arc<KeyBundle>,
        data_service: Option<Arc<DataService>>,
        seed_addresses: BTreeSet<Address>,
    ) -> Arc<Self> {
        let transport_type = node_config.transport_config.transport_type;
        let transport = create_transport(node_config.transport_config.clone());
        let ban_list = Arc::new(BanList::default());
        let load_snapshot = Arc::new(NetworkLoadSnapshot::default());
        let nodes_by_id = Arc::new(NodesById::new(
            node_config,
            transport,
            Arc::new(AuthorizationService::new()),
            ban_list.clone(),
            load_snapshot.clone(),
        ));
        let peer_group_service =
            Arc::new(PeerGroupService::new(seed_addresses, ban_list.clone()));

        Arc::new(Self {
            config,
            peer_group_config,
            inventory_config,
            transport_type,
            key_bundle,
            data_service,
            nodes_by_id,
            ban_list,
            peer_group_service,
            load_snapshot,
            default_node: RwLock::new(None),
            peer_group_manager: RwLock::new(None),
            data_network_service: RwLock::new(None),
            inventory_service: RwLock::new(None),
            confidential_message_service: RwLock::new(None),
            state: RwLock::new(ServiceNodeState::New),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn state(&self) -> ServiceNodeState {
        *self.state.read()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ServiceNodeState::Initialized
    }

    pub fn nodes_by_id(&self) -> &Arc<NodesById> {
        &self.nodes_by_id
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    pub fn default_node(&self) -> Option<Arc<Node>> {
        self.default_node.read().clone()
    }

    pub fn confidential_message_service(&self) -> Option<Arc<ConfidentialMessageService>> {
        self.confidential_message_service.read().clone()
    }

    pub fn peer_group_manager(&self) -> Option<Arc<PeerGroupManager>> {
        self.peer_group_manager.read().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ServiceNodeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn add_seed_address(&self, address: Address) {
        self.peer_group_service.add_seed(address.clone());
        if let Some(manager) = self.peer_group_manager() {
            manager.add_seed(address);
        }
    }

    pub fn remove_seed_address(&self, address: &Address) {
        self.peer_group_service.remove_seed(address);
        if let Some(manager) = self.peer_group_manager() {
            manager.remove_seed(address);
        }
    }

    /// Create the default node for `network_id`, construct the services the
    /// config asks for, and bring everything up. Blocking: transport bind,
    /// node initialization, and peer-group bootstrap all complete before
    /// this returns. Run it off latency-sensitive tasks.
    pub async fn get_initialized_default_node(
        self: &Arc<Self>,
        network_id: NetworkId,
        listen_port: u16,
    ) -> Result<Arc<Node>, ConnectionError> {
        let default_node = self.nodes_by_id.create_and_config_node(network_id, true)?;
        *self.default_node.write() = Some(default_node.clone());

        let has_peer_group = self.config.supports(SupportedService::PeerGroup);
        if has_peer_group {
            *self.peer_group_manager.write() = Some(Arc::new(PeerGroupManager::new(
                default_node.clone(),
                self.peer_group_service.clone(),
                self.peer_group_config.clone(),
            )));
        }

        // Replication needs a peer group to gossip through.
        let data_enabled = has_peer_group && self.config.supports(SupportedService::Data);
        if data_enabled {
            let data_service = self
                .data_service
                .as_ref()
                .expect("DATA service configured but no DataService was provided")
                .clone();
            let data_network_service =
                DataNetworkService::new(default_node.clone(), data_service.clone());
            default_node.add_listener(data_network_service.clone());
            *self.data_network_service.write() = Some(data_network_service);

            let inventory_service = InventoryService::new(
                self.inventory_config.clone(),
                default_node.clone(),
                data_service,
            );
            default_node.add_listener(inventory_service.clone());
            *self.inventory_service.write() = Some(inventory_service);
        }

        if self.config.supports(SupportedService::Confidential) {
            let confidential = ConfidentialMessageService::new(
                self.nodes_by_id.clone(),
                default_node.clone(),
                self.key_bundle.clone(),
                self.data_service.clone(),
            );
            default_node.add_listener(confidential.clone());
            if let Some(data_service) = &self.data_service {
                // Mailbox deliveries arrive through the replicated store.
                data_service.add_listener(confidential.clone());
            }
            *self.confidential_message_service.write() = Some(confidential);
        }

        self.set_state(ServiceNodeState::Initializing);

        default_node.initialize(listen_port).await?;
        if data_enabled {
            if let Some(data_service) = &self.data_service {
                data_service.storage().start_maintenance();
            }
        }
        let manager = self.peer_group_manager();
        if let Some(manager) = manager {
            manager.initialize().await;
        }
        self.set_state(ServiceNodeState::Initialized);

        Ok(default_node)
    }

    /// Thin delegation to the confidential service.
    ///
    /// # Panics
    ///
    /// When this transport was configured without `CONFIDENTIAL` support.
    /// Sending confidentially over a transport that cannot is a
    /// construction-time misconfiguration, not a runtime condition.
    pub async fn confidential_send(
        self: &Arc<Self>,
        plaintext: &[u8],
        receiver: &NetworkId,
        address: &Address,
        sender_node_id: &str,
    ) -> SendConfidentialMessageResult {
        let service = self
            .confidential_message_service()
            .expect("ConfidentialMessageService not supported on this transport");
        service.send(plaintext, receiver, address, sender_node_id).await
    }

    /// Plain (unencrypted payload) send via the node registry.
    pub async fn send(
        &self,
        sender_node_id: &str,
        address: &Address,
        payload: EnvelopePayload,
    ) -> Result<(), ConnectionError> {
        self.nodes_by_id.send(sender_node_id, address, payload).await
    }

    /// Stop every sub-service, then the node registry. Best-effort: each
    /// step runs regardless of earlier failures, and the state ends at
    /// `Terminated`. Calling shutdown on an already stopping or terminated
    /// service node is a no-op.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.state() >= ServiceNodeState::Stopping {
            return;
        }
        self.set_state(ServiceNodeState::Stopping);

        if let Some(manager) = self.peer_group_manager.write().take() {
            manager.shutdown();
        }
        if let Some(data_network_service) = self.data_network_service.write().take() {
            data_network_service.shutdown();
        }
        if let Some(inventory_service) = self.inventory_service.write().take() {
            inventory_service.shutdown();
        }
        if let Some(confidential) = self.confidential_message_service.write().take() {
            confidential.shutdown();
        }

        self.nodes_by_id.shutdown().await;
        *self.default_node.write() = None;

        self.set_state(ServiceNodeState::Terminated);
    }

    /// Advance the lifecycle. Each call must strictly increase the state's
    /// ordinal; anything else is a wiring bug and asserts loudly.
    fn set_state(&self, new_state: ServiceNodeState) {
        {
            let mut state = self.state.write();
            assert!(
                new_state.ordinal() > state.ordinal(),
                "state must advance: {:?} -> {:?}",
                *state,
                new_state
            );
            *state = new_state;
        }
        info!(transport = %self.transport_type, state = ?new_state, "service node state changed");
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_state_changed(new_state))).is_err() {
                error!("service node listener panicked");
            }
        }
    }

    /// Current load snapshot, refreshed from connection statistics.
    pub fn load_snapshot(&self) -> &Arc<NetworkLoadSnapshot> {
        &self.load_snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageService;
    use crate::transport::TransportConfig;
    use parking_lot::Mutex;

    fn localhost_service_node(
        config: ServiceNodeConfig,
        data_service: Option<Arc<DataService>>,
    ) -> Arc<ServiceNode> {
        ServiceNode::new(
            config,
            NodeConfig::new(TransportConfig::localhost()),
            PeerGroupConfig::default(),
            InventoryConfig::default(),
            Arc::new(KeyBundle::generate()),
            data_service,
            BTreeSet::new(),
        )
    }

    fn network_id(bundle: &KeyBundle) -> NetworkId {
        NetworkId::from_key_bundle("default", bundle)
    }

    struct StateRecorder {
        states: Mutex<Vec<ServiceNodeState>>,
    }

    impl ServiceNodeListener for StateRecorder {
        fn on_state_changed(&self, state: ServiceNodeState) {
            self.states.lock().push(state);
        }
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_terminated() {
        let data_service = DataService::new(Arc::new(StorageService::open_temporary().unwrap()));
        let service_node = localhost_service_node(ServiceNodeConfig::all(), Some(data_service));
        let recorder = Arc::new(StateRecorder {
            states: Mutex::new(Vec::new()),
        });
        service_node.add_listener(recorder.clone());

        assert_eq!(service_node.state(), ServiceNodeState::New);
        let bundle = KeyBundle::generate();
        service_node
            .get_initialized_default_node(network_id(&bundle), 0)
            .await
            .unwrap();
        assert!(service_node.is_initialized());
        assert!(service_node.confidential_message_service().is_some());
        assert!(service_node.peer_group_manager().is_some());

        service_node.shutdown().await;
        assert_eq!(service_node.state(), ServiceNodeState::Terminated);
        assert_eq!(
            *recorder.states.lock(),
            vec![
                ServiceNodeState::Initializing,
                ServiceNodeState::Initialized,
                ServiceNodeState::Stopping,
                ServiceNodeState::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn services_follow_the_supported_set() {
        // Peer group only: no data plumbing, no confidential service.
        let service_node = localhost_service_node(
            ServiceNodeConfig {
                supported_services: BTreeSet::from([SupportedService::PeerGroup]),
            },
            None,
        );
        let bundle = KeyBundle::generate();
        service_node
            .get_initialized_default_node(network_id(&bundle), 0)
            .await
            .unwrap();

        assert!(service_node.peer_group_manager().is_some());
        assert!(service_node.confidential_message_service().is_none());
        assert!(service_node.inventory_service.read().is_none());
        service_node.shutdown().await;
    }

    #[tokio::test]
    async fn data_without_peer_group_stays_inert() {
        let data_service = DataService::new(Arc::new(StorageService::open_temporary().unwrap()));
        let service_node = localhost_service_node(
            ServiceNodeConfig {
                supported_services: BTreeSet::from([SupportedService::Data]),
            },
            Some(data_service),
        );
        let bundle = KeyBundle::generate();
        service_node
            .get_initialized_default_node(network_id(&bundle), 0)
            .await
            .unwrap();

        // No peer group means no gossip path, so no data plumbing either.
        assert!(service_node.data_network_service.read().is_none());
        service_node.shutdown().await;
    }

    #[tokio::test]
    #[should_panic(expected = "not supported on this transport")]
    async fn confidential_send_without_support_panics() {
        let service_node = localhost_service_node(
            ServiceNodeConfig {
                supported_services: BTreeSet::from([SupportedService::PeerGroup]),
            },
            None,
        );
        let bundle = KeyBundle::generate();
        service_node
            .get_initialized_default_node(network_id(&bundle), 0)
            .await
            .unwrap();

        let receiver = NetworkId::from_key_bundle("peer", &KeyBundle::generate());
        service_node
            .confidential_send(
                b"nope",
                &receiver,
                &Address::new("127.0.0.1".to_string(), 1),
                "default",
            )
            .await;
    }

    #[test]
    #[should_panic(expected = "state must advance")]
    fn state_regression_asserts() {
        let service_node = localhost_service_node(ServiceNodeConfig::all(), None);
        service_node.set_state(ServiceNodeState::Initializing);
        service_node.set_state(ServiceNodeState::Initializing);
    }

    #[test]
    #[should_panic(expected = "state must advance")]
    fn state_backward_asserts() {
        let service_node = localhost_service_node(ServiceNodeConfig::all(), None);
        service_node.set_state(ServiceNodeState::Initialized);
        service_node.set_state(ServiceNodeState::Initializing);
    }
}
