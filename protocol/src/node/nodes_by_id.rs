//! Registry of the nodes of one transport.
//!
//! A service node usually runs a single default node, but additional
//! identities (one per user profile, say) can each get their own [`Node`]
//! with its own listener and connections. [`NodesById`] owns them all,
//! hands out the shared ban list and authorization service at construction,
//! and fans registered listeners out to every node, present and future.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::authorization::AuthorizationService;
use crate::envelope::EnvelopePayload;
use crate::identity::NetworkId;
use crate::peer_group::BanList;
use crate::transport::Transport;

use super::address::Address;
use super::capability::NetworkLoadSnapshot;
use super::node::{Node, NodeConfig, NodeListener};
use super::ConnectionError;

pub struct NodesById {
    node_config: NodeConfig,
    transport: Arc<dyn Transport>,
    authorization_service: Arc<AuthorizationService>,
    ban_list: Arc<BanList>,
    load_snapshot: Arc<NetworkLoadSnapshot>,
    nodes: DashMap<String, Arc<Node>>,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
    default_node_id: RwLock<Option<String>>,
}

impl NodesById {
    pub fn new(
        node_config: NodeConfig,
        transport: Arc<dyn Transport>,
        authorization_service: Arc<AuthorizationService>,
        ban_list: Arc<BanList>,
        load_snapshot: Arc<NetworkLoadSnapshot>,
    ) -> Self {
        Self {
            node_config,
            transport,
            authorization_service,
            ban_list,
            load_snapshot,
            nodes: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            default_node_id: RwLock::new(None),
        }
    }

    /// Allocate a node for `network_id`. Fails if one is already registered
    /// under that id; replacing a live node implicitly would orphan its
    /// connections.
    pub fn create_and_config_node(
        &self,
        network_id: NetworkId,
        is_default: bool,
    ) -> Result<Arc<Node>, ConnectionError> {
        let node_id = network_id.id.clone();
        if self.nodes.contains_key(&node_id) {
            return Err(ConnectionError::NodeAlreadyExists(node_id));
        }

        let node = Arc::new(Node::new(
            self.node_config.clone(),
            network_id,
            self.transport.clone(),
            self.authorization_service.clone(),
            self.ban_list.clone(),
            self.load_snapshot.clone(),
        ));
        for listener in self.listeners.read().iter() {
            node.add_listener(listener.clone());
        }
        self.nodes.insert(node_id.clone(), node.clone());
        if is_default {
            *self.default_node_id.write() = Some(node_id.clone());
        }
        info!(node = %node_id, is_default, "node registered");
        Ok(node)
    }

    /// Initialize (bind) a registered node. Idempotent: an initialized node
    /// just reports its address.
    pub async fn initialize_node(&self, node_id: &str, port: u16) -> Result<Address, ConnectionError> {
        let node = self.find_node(node_id).ok_or_else(|| {
            ConnectionError::NodeNotFound(node_id.to_string())
        })?;
        node.initialize(port).await
    }

    pub fn is_node_initialized(&self, node_id: &str) -> bool {
        self.find_node(node_id).is_some_and(|node| node.is_initialized())
    }

    pub fn find_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.get(node_id).map(|entry| entry.clone())
    }

    pub fn default_node(&self) -> Option<Arc<Node>> {
        let id = self.default_node_id.read().clone()?;
        self.find_node(&id)
    }

    /// Send via the identified sender node. Connection setup and handshake
    /// happen lazily inside the node; failures surface with no retry.
    pub async fn send(
        &self,
        sender_node_id: &str,
        address: &Address,
        payload: EnvelopePayload,
    ) -> Result<(), ConnectionError> {
        let node = self.find_node(sender_node_id).ok_or_else(|| {
            ConnectionError::NodeNotFound(sender_node_id.to_string())
        })?;
        node.send(address, payload).await
    }

    pub async fn is_peer_online(&self, node_id: &str, address: &Address) -> bool {
        match self.find_node(node_id) {
            Some(node) => node.is_peer_online(address).await,
            None => false,
        }
    }

    /// Register a listener on every current and future node.
    pub fn add_node_listener(&self, listener: Arc<dyn NodeListener>) {
        for entry in self.nodes.iter() {
            entry.value().add_listener(listener.clone());
        }
        self.listeners.write().push(listener);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_connections(&self) -> usize {
        self.nodes.iter().map(|entry| entry.value().connection_count()).sum()
    }

    /// Shut down every node; completes when all are closed.
    pub async fn shutdown(&self) {
        let nodes: Vec<Arc<Node>> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        for node in nodes {
            node.shutdown().await;
        }
        self.nodes.clear();
        *self.default_node_id.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyBundle;
    use crate::transport::{create_transport, TransportConfig};

    fn registry() -> NodesById {
        let config = NodeConfig::new(TransportConfig::localhost());
        let transport = create_transport(config.transport_config.clone());
        NodesById::new(
            config,
            transport,
            Arc::new(AuthorizationService::new()),
            Arc::new(BanList::default()),
            Arc::new(NetworkLoadSnapshot::default()),
        )
    }

    fn network_id(id: &str) -> NetworkId {
        NetworkId::from_key_bundle(id, &KeyBundle::generate())
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let registry = registry();
        registry.create_and_config_node(network_id("default"), true).unwrap();
        let result = registry.create_and_config_node(network_id("default"), false);
        assert!(matches!(result, Err(ConnectionError::NodeAlreadyExists(_))));
    }

    #[test]
    fn default_node_is_tracked() {
        let registry = registry();
        assert!(registry.default_node().is_none());
        registry.create_and_config_node(network_id("default"), true).unwrap();
        registry.create_and_config_node(network_id("profile-2"), false).unwrap();
        assert_eq!(registry.default_node().unwrap().network_id().id, "default");
        assert_eq!(registry.node_count(), 2);
    }

    #[tokio::test]
    async fn initialize_unknown_node_fails() {
        let registry = registry();
        let result = registry.initialize_node("ghost", 0).await;
        assert!(matches!(result, Err(ConnectionError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn initialize_is_idempotent_through_registry() {
        let registry = registry();
        registry.create_and_config_node(network_id("default"), true).unwrap();
        let first = registry.initialize_node("default", 0).await.unwrap();
        let second = registry.initialize_node("default", 0).await.unwrap();
        assert_eq!(first, second);
        assert!(registry.is_node_initialized("default"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn send_via_unknown_sender_fails() {
        let registry = registry();
        let result = registry
            .send(
                "ghost",
                &Address::new("127.0.0.1".to_string(), 1),
                EnvelopePayload::KeepAlive { nonce: 1 },
            )
            .await;
        assert!(matches!(result, Err(ConnectionError::NodeNotFound(_))));
    }
}
