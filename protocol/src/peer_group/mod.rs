//! # Peer Group
//!
//! Membership bookkeeping for one transport: the seed addresses used for
//! bootstrap, the ban list every handshake consults, and a maintenance loop
//! that keeps the connection count above the configured floor.
//!
//! The connection-scoring and peer-exchange machinery that a large overlay
//! eventually wants lives behind this module's surface; the rest of the
//! stack only ever asks two questions: is this address banned, and which
//! peers are we connected to right now.

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MIN_CONNECTIONS, PEER_GROUP_INTERVAL};
use crate::envelope::EnvelopePayload;
use crate::node::address::Address;
use crate::node::node::Node;

// ---------------------------------------------------------------------------
// BanList
// ---------------------------------------------------------------------------

/// Addresses excluded from handshake and connection acceptance. Read-mostly
/// shared state; consulted on every handshake on both sides.
#[derive(Default)]
pub struct BanList {
    banned: DashSet<Address>,
}

impl BanList {
    pub fn ban(&self, address: Address) {
        info!(%address, "address banned");
        self.banned.insert(address);
    }

    pub fn unban(&self, address: &Address) {
        self.banned.remove(address);
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.banned.contains(address)
    }

    pub fn len(&self) -> usize {
        self.banned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tuning knobs of the peer-group maintenance loop.
#[derive(Clone, Debug)]
pub struct PeerGroupConfig {
    /// Reconnect to seeds whenever the connection count drops below this.
    pub min_connections: usize,
    /// Stop dialing once this many connections are open.
    pub max_connections: usize,
    /// Cadence of the maintenance loop.
    pub interval: Duration,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            interval: PEER_GROUP_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerGroupService
// ---------------------------------------------------------------------------

/// The seed bootstrap set and ban list for one transport.
pub struct PeerGroupService {
    seeds: RwLock<BTreeSet<Address>>,
    ban_list: Arc<BanList>,
}

impl PeerGroupService {
    pub fn new(seeds: BTreeSet<Address>, ban_list: Arc<BanList>) -> Self {
        Self {
            seeds: RwLock::new(seeds),
            ban_list,
        }
    }

    pub fn add_seed(&self, address: Address) {
        self.seeds.write().insert(address);
    }

    pub fn remove_seed(&self, address: &Address) {
        self.seeds.write().remove(address);
    }

    pub fn seed_addresses(&self) -> BTreeSet<Address> {
        self.seeds.read().clone()
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.ban_list.is_banned(address)
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }
}

// ---------------------------------------------------------------------------
// PeerGroupManager
// ---------------------------------------------------------------------------

/// Drives bootstrap and keep-alive for one node.
pub struct PeerGroupManager {
    node: Arc<Node>,
    service: Arc<PeerGroupService>,
    config: PeerGroupConfig,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PeerGroupManager {
    pub fn new(node: Arc<Node>, service: Arc<PeerGroupService>, config: PeerGroupConfig) -> Self {
        Self {
            node,
            service,
            config,
            maintenance: Mutex::new(None),
        }
    }

    /// Dial the seed set until the connection floor is met, then start the
    /// periodic maintenance loop. Blocking in the sense that it awaits the
    /// initial dials; callers run it off latency-sensitive paths.
    pub async fn initialize(self: &Arc<Self>) {
        self.maintain_connections().await;

        let manager = Arc::clone(self);
        let mut slot = self.maintenance.lock();
        if slot.is_none() {
            *slot = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.config.interval);
                // The first tick fires immediately and we already dialed.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    manager.maintain_connections().await;
                    manager.send_keep_alives().await;
                }
            }));
        }
    }

    /// Addresses of the peers currently connected on this node.
    pub fn connected_peer_addresses(&self) -> BTreeSet<Address> {
        self.node.connected_addresses().into_iter().collect()
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.service.is_banned(address)
    }

    pub fn add_seed(&self, address: Address) {
        self.service.add_seed(address);
    }

    pub fn remove_seed(&self, address: &Address) {
        self.service.remove_seed(address);
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }

    async fn maintain_connections(&self) {
        let connected = self.node.connection_count();
        if connected >= self.config.min_connections {
            return;
        }
        for seed in self.service.seed_addresses() {
            if self.node.connection_count() >= self.config.max_connections {
                break;
            }
            if self.service.is_banned(&seed) || self.node.find_connection(&seed).is_some() {
                continue;
            }
            match self.node.connect(&seed).await {
                Ok(_) => debug!(%seed, "connected to seed"),
                Err(e) => warn!(%seed, error = %e, "seed dial failed"),
            }
        }
    }

    async fn send_keep_alives(&self) {
        for address in self.node.connected_addresses() {
            let nonce = rand::random::<u64>();
            if let Err(e) = self
                .node
                .send(&address, EnvelopePayload::KeepAlive { nonce })
                .await
            {
                debug!(peer = %address, error = %e, "keep-alive failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> Address {
        Address::new(host.to_string(), 8940)
    }

    #[test]
    fn ban_list_round_trip() {
        let ban_list = BanList::default();
        assert!(!ban_list.is_banned(&addr("peer.example")));

        ban_list.ban(addr("peer.example"));
        assert!(ban_list.is_banned(&addr("peer.example")));
        assert_eq!(ban_list.len(), 1);

        ban_list.unban(&addr("peer.example"));
        assert!(!ban_list.is_banned(&addr("peer.example")));
    }

    #[test]
    fn seed_set_management() {
        let service = PeerGroupService::new(
            BTreeSet::from([addr("seed1.example")]),
            Arc::new(BanList::default()),
        );
        service.add_seed(addr("seed2.example"));
        assert_eq!(service.seed_addresses().len(), 2);

        service.remove_seed(&addr("seed1.example"));
        let seeds = service.seed_addresses();
        assert_eq!(seeds.len(), 1);
        assert!(seeds.contains(&addr("seed2.example")));
    }

    #[test]
    fn banned_seed_is_reported() {
        let ban_list = Arc::new(BanList::default());
        let service = PeerGroupService::new(BTreeSet::new(), ban_list.clone());
        ban_list.ban(addr("evil.example"));
        assert!(service.is_banned(&addr("evil.example")));
    }
}
