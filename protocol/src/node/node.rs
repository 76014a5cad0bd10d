//! # Node
//!
//! A [`Node`] owns the connections of one network identity over one
//! transport. It binds the transport listener, answers inbound handshakes,
//! lazily dials and handshakes outbound peers on first send, and pumps every
//! authorized inbound envelope to its listeners.
//!
//! Everything inbound passes two gates before any listener sees it: the
//! envelope version check and the authorization token check. A failure of
//! either is a protocol violation and closes the connection; it does not
//! touch the rest of the node.
//!
//! Send failures surface to the caller with no implicit retry. Whether a
//! failed delivery is retried against another address or another transport
//! is a policy decision that belongs to the layers above.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::authorization::AuthorizationService;
use crate::config::DEFAULT_NODE_SOCKET_TIMEOUT;
use crate::envelope::{read_envelope, write_envelope, EnvelopeError, EnvelopePayload, NetworkEnvelope};
use crate::identity::NetworkId;
use crate::peer_group::BanList;
use crate::transport::{Transport, TransportConfig, TransportType};

use super::address::Address;
use super::capability::{Capability, Feature, NetworkLoad, NetworkLoadSnapshot};
use super::connection::{CloseReason, Connection};
use super::handshake::ConnectionHandshake;
use super::ConnectionError;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Construction-time configuration of a node. No runtime reload.
#[derive(Clone)]
pub struct NodeConfig {
    pub transport_config: TransportConfig,
    /// Transports this identity is reachable over, advertised in the
    /// capability during handshakes.
    pub supported_transports: BTreeSet<TransportType>,
    /// Optional protocol features advertised in the capability.
    pub features: BTreeSet<Feature>,
    /// Read and handshake deadline per socket.
    pub socket_timeout: Duration,
}

impl NodeConfig {
    pub fn new(transport_config: TransportConfig) -> Self {
        let transport_type = transport_config.transport_type;
        Self {
            transport_config,
            supported_transports: BTreeSet::from([transport_type]),
            features: BTreeSet::new(),
            socket_timeout: DEFAULT_NODE_SOCKET_TIMEOUT,
        }
    }

    /// Config for additional user-identity nodes, which run with the
    /// shorter interactive socket timeout.
    pub fn for_user_node(transport_config: TransportConfig) -> Self {
        Self {
            socket_timeout: crate::config::USER_NODE_SOCKET_TIMEOUT,
            ..Self::new(transport_config)
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Callbacks for connection lifecycle and inbound traffic. Implementations
/// are isolated: a panic in one listener is logged and the others still run.
pub trait NodeListener: Send + Sync {
    fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>);
    fn on_connection(&self, connection: &Arc<Connection>);
    fn on_disconnect(&self, connection: &Arc<Connection>, reason: CloseReason);
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One identity's connection endpoint on one transport.
pub struct Node {
    config: NodeConfig,
    network_id: NetworkId,
    transport: Arc<dyn Transport>,
    authorization_service: Arc<AuthorizationService>,
    ban_list: Arc<BanList>,
    load_snapshot: Arc<NetworkLoadSnapshot>,
    connections: DashMap<Address, Arc<Connection>>,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
    my_capability: RwLock<Option<Capability>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    reader_tasks: DashMap<String, JoinHandle<()>>,
    init_lock: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        network_id: NetworkId,
        transport: Arc<dyn Transport>,
        authorization_service: Arc<AuthorizationService>,
        ban_list: Arc<BanList>,
        load_snapshot: Arc<NetworkLoadSnapshot>,
    ) -> Self {
        Self {
            config,
            network_id,
            transport,
            authorization_service,
            ban_list,
            load_snapshot,
            connections: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            my_capability: RwLock::new(None),
            accept_task: Mutex::new(None),
            reader_tasks: DashMap::new(),
            init_lock: tokio::sync::Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    /// Our capability, available after [`initialize`](Self::initialize).
    pub fn my_capability(&self) -> Option<Capability> {
        self.my_capability.read().clone()
    }

    /// The address peers can reach us at, once initialized.
    pub fn my_address(&self) -> Option<Address> {
        self.my_capability.read().as_ref().map(|c| c.address.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.my_capability.read().is_some()
    }

    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn find_connection(&self, address: &Address) -> Option<Arc<Connection>> {
        self.connections.get(address).map(|entry| entry.clone())
    }

    pub fn connected_addresses(&self) -> Vec<Address> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind the transport listener and start accepting. Idempotent: a
    /// second call returns the already-bound address. Blocking bind; run
    /// off latency-sensitive threads.
    pub async fn initialize(self: &Arc<Self>, port: u16) -> Result<Address, ConnectionError> {
        let _guard = self.init_lock.lock().await;
        if let Some(capability) = self.my_capability() {
            return Ok(capability.address);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::NodeShutDown);
        }

        let (listener, address) = self.transport.bind(port).await?;
        let capability = Capability::new(
            address.clone(),
            self.config.supported_transports.clone(),
            self.config.features.clone(),
        );
        *self.my_capability.write() = Some(capability);

        let node = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_inbound(stream).await {
                                debug!(%remote, error = %e, "inbound connection attempt failed");
                            }
                        });
                    }
                    Err(e) => {
                        if node.shut_down.load(Ordering::Acquire) {
                            break;
                        }
                        // One bad accept must not kill the listener.
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(task);

        info!(node = %self.network_id, %address, transport = %self.transport_type(), "node initialized");
        Ok(address)
    }

    /// Resolve or lazily create an authorized outbound connection.
    pub async fn connect(self: &Arc<Self>, address: &Address) -> Result<Arc<Connection>, ConnectionError> {
        if let Some(existing) = self.find_connection(address) {
            if !existing.is_closed() {
                return Ok(existing);
            }
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::NodeShutDown);
        }
        if self.ban_list.is_banned(address) {
            return Err(ConnectionError::PeerBanned(address.clone()));
        }
        let capability = self.my_capability().ok_or(ConnectionError::NodeNotInitialized)?;

        let stream = self.transport.dial(address).await?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let handshake = ConnectionHandshake::new(
            capability,
            self.ban_list.clone(),
            self.authorization_service.clone(),
        );
        let my_load = self.load_snapshot.current();
        let request = handshake.create_request(my_load, address);

        let started = Instant::now();
        let bytes_out = write_envelope(&mut write_half, &request).await?;
        let (response, bytes_in) =
            tokio::time::timeout(self.config.socket_timeout, read_envelope(&mut read_half))
                .await
                .map_err(|_| ConnectionError::Timeout)??;
        let result = handshake.finish(vec![response], my_load)?;

        let connection = Arc::new(Connection::new(
            result.peer_capability,
            result.peer_load,
            true,
            write_half,
        ));
        connection.metrics().on_sent(bytes_out);
        connection.metrics().on_received(bytes_in);
        connection
            .metrics()
            .set_handshake_rtt(started.elapsed().as_millis() as u64);

        // Register under the dialed address, not the advertised one, so the
        // caller's lookup key always resolves to this link.
        self.register(address.clone(), connection.clone(), read_half).await;
        Ok(connection)
    }

    /// Send one payload to `address`, dialing and handshaking first if no
    /// authorized connection exists. The token is minted against the load
    /// the peer advertised during the handshake. On a transport failure the
    /// connection is dropped and the error surfaces; no retry.
    pub async fn send(
        self: &Arc<Self>,
        address: &Address,
        payload: EnvelopePayload,
    ) -> Result<(), ConnectionError> {
        let connection = self.connect(address).await?;
        let token = self.authorization_service.create_token(
            &payload.serialize_for_authorization(),
            payload.cost_factor(),
            connection.peer_load(),
            &address.to_full(),
            connection.next_message_counter(),
        );
        let envelope = NetworkEnvelope::new(token, payload);
        match connection.send_envelope(&envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_connection(&connection, CloseReason::SocketClosed).await;
                Err(e)
            }
        }
    }

    /// Liveness probe: can we establish (or do we hold) an authorized
    /// connection to the address?
    pub async fn is_peer_online(self: &Arc<Self>, address: &Address) -> bool {
        self.connect(address).await.is_ok()
    }

    /// Close every connection and the listener. Idempotent and safe to call
    /// concurrently with `initialize`.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.network_id, "node shutting down");
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|entry| entry.value().clone()).collect();
        for connection in connections {
            self.drop_connection(&connection, CloseReason::Shutdown).await;
        }
        for entry in self.reader_tasks.iter() {
            entry.value().abort();
        }
        self.reader_tasks.clear();
        self.connections.clear();
    }

    // -- Internals -----------------------------------------------------------

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) -> Result<(), ConnectionError> {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let (envelope, bytes_in) =
            tokio::time::timeout(self.config.socket_timeout, read_envelope(&mut read_half))
                .await
                .map_err(|_| ConnectionError::Timeout)??;

        let capability = self.my_capability().ok_or(ConnectionError::NodeNotInitialized)?;
        let handshake = ConnectionHandshake::new(
            capability,
            self.ban_list.clone(),
            self.authorization_service.clone(),
        );
        let started = Instant::now();
        let (response, result) = handshake.on_request(envelope, self.load_snapshot.current())?;
        let bytes_out = write_envelope(&mut write_half, &response).await?;

        let peer_address = result.peer_capability.address.clone();
        let connection = Arc::new(Connection::new(
            result.peer_capability,
            result.peer_load,
            false,
            write_half,
        ));
        connection.metrics().on_received(bytes_in);
        connection.metrics().on_sent(bytes_out);
        connection
            .metrics()
            .set_handshake_rtt(started.elapsed().as_millis() as u64);

        self.register(peer_address, connection, read_half).await;
        Ok(())
    }

    async fn register(
        self: &Arc<Self>,
        address: Address,
        connection: Arc<Connection>,
        read_half: OwnedReadHalf,
    ) {
        if let Some(replaced) = self.connections.insert(address, connection.clone()) {
            // A fresh link to the same peer supersedes the old one.
            self.drop_connection(&replaced, CloseReason::SocketClosed).await;
        }
        debug!(
            connection = %connection.id(),
            peer = %connection.peer_address(),
            outbound = connection.is_outbound(),
            "connection established"
        );
        self.notify(|listener| listener.on_connection(&connection));

        let node = Arc::clone(self);
        let reader_connection = connection.clone();
        let task = tokio::spawn(async move {
            node.read_loop(reader_connection, read_half).await;
        });
        self.reader_tasks.insert(connection.id().to_string(), task);
    }

    async fn read_loop(self: Arc<Self>, connection: Arc<Connection>, mut read_half: OwnedReadHalf) {
        let reason = loop {
            let read =
                tokio::time::timeout(self.config.socket_timeout, read_envelope(&mut read_half)).await;
            let (envelope, bytes) = match read {
                Err(_) => break CloseReason::IdleTimeout,
                Ok(Err(EnvelopeError::Io(_))) => break CloseReason::SocketClosed,
                Ok(Err(e)) => {
                    warn!(connection = %connection.id(), error = %e, "malformed frame");
                    break CloseReason::ProtocolViolation;
                }
                Ok(Ok(frame)) => frame,
            };
            connection.metrics().on_received(bytes);

            if let Err(e) = envelope.verify_version() {
                warn!(connection = %connection.id(), error = %e, "envelope version rejected");
                break CloseReason::ProtocolViolation;
            }

            let Some(my_address) = self.my_address() else {
                break CloseReason::Shutdown;
            };
            let authorized = self.authorization_service.is_authorized(
                &envelope.payload.serialize_for_authorization(),
                envelope.payload.cost_factor(),
                &envelope.authorization_token,
                self.load_snapshot.current(),
                connection.id(),
                &my_address.to_full(),
            );
            if !authorized {
                warn!(
                    connection = %connection.id(),
                    payload = envelope.payload.name(),
                    "unauthorized envelope"
                );
                break CloseReason::ProtocolViolation;
            }

            if let EnvelopePayload::KeepAlive { nonce } = &envelope.payload {
                trace!(connection = %connection.id(), nonce, "keep-alive");
                continue;
            }

            trace!(
                connection = %connection.id(),
                payload = envelope.payload.name(),
                "dispatching inbound payload"
            );
            self.notify(|listener| listener.on_message(&envelope.payload, &connection));
        };
        self.drop_connection(&connection, reason).await;
    }

    async fn drop_connection(&self, connection: &Arc<Connection>, reason: CloseReason) {
        if connection.is_closed() {
            // Teardown already ran (or is running) for this connection.
            return;
        }
        connection.close(reason).await;
        self.connections
            .remove_if(connection.peer_address(), |_, mapped| Arc::ptr_eq(mapped, connection));
        if let Some((_, task)) = self.reader_tasks.remove(connection.id()) {
            // When the reader itself is tearing down, aborting the current
            // task would cut the disconnect notification short; the loop
            // has already exited by the time we get here on that path.
            if reason == CloseReason::Shutdown {
                task.abort();
            }
        }
        self.authorization_service.on_connection_closed(connection.id());
        self.notify(|listener| listener.on_disconnect(connection, reason));
    }

    fn notify(&self, f: impl Fn(&Arc<dyn NodeListener>)) {
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                error!(node = %self.network_id, "node listener panicked");
            }
        }
    }
}
