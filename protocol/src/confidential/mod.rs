//! # Confidential Messaging
//!
//! Private, signed, end-to-end encrypted messages between identities. The
//! sender seals the payload for the receiver's encryption key, then tries a
//! direct connection; if the receiver is unreachable the sealed message is
//! parked in the receiver's mailbox store on the overlay and delivered when
//! they come back.
//!
//! Relays and mailbox stores only ever see ciphertext and the receiver's
//! key hash. The receiver, after decrypting, answers with an [`AckMessage`]
//! and, for mailbox deliveries, retracts the entry so it stops occupying
//! replicated storage.
//!
//! Delivery status is tracked per message id. Resend is deliberately
//! manual: the service keeps enough bookkeeping to resend, and exposes
//! which messages never got an ack, but *when* to retry is the
//! application's call.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_MAILBOX_TTL, DEFAULT_MAX_MAP_SIZE};
use crate::crypto::{KeyBundle, KeyHash, SealedBox, VeilPublicKey};
use crate::data_service::{DataService, DataServiceListener};
use crate::envelope::EnvelopePayload;
use crate::identity::NetworkId;
use crate::node::{Address, CloseReason, Connection, Node, NodeListener, NodesById};
use crate::storage::{MailboxData, MetaData};

/// Store class mailbox entries land in.
pub const MAILBOX_STORE_CLASS: &str = "MailboxMessage";

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// A sealed message in flight or at rest in a mailbox store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialMessage {
    /// Message id, generated by the sender; echoed in the ack.
    pub id: String,
    /// Hash of the receiver's identity key. Routing and removal authority;
    /// everything else about the receiver stays hidden.
    pub receiver_key_hash: KeyHash,
    /// The encrypted, signed payload.
    pub sealed: SealedBox,
}

impl ConfidentialMessage {
    pub fn new(sealed: SealedBox, receiver_key_hash: KeyHash) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            receiver_key_hash,
            sealed,
        }
    }
}

/// Receipt for one confidential message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Delivery tracking
// ---------------------------------------------------------------------------

/// Where a sent message currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDeliveryStatus {
    /// Handed to a live connection; no receipt yet.
    Sent,
    /// Receiver unreachable; parked in their mailbox store.
    StoredInMailbox,
    /// The receiver confirmed decryption.
    AckReceived,
    /// Neither direct delivery nor mailbox fallback worked.
    Failed,
}

/// Outcome of a send attempt.
#[derive(Clone, Debug)]
pub struct SendConfidentialMessageResult {
    pub message_id: String,
    pub status: MessageDeliveryStatus,
}

/// Bookkeeping to retry a message that never got acked.
struct ResendItem {
    plaintext: Vec<u8>,
    receiver: NetworkId,
    address: Address,
    sender_node_id: String,
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Application callback for decrypted inbound messages.
pub trait ConfidentialMessageListener: Send + Sync {
    fn on_message(&self, plaintext: &[u8], sender: &VeilPublicKey, message_id: &str);
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Sends, receives, acks, and resends confidential messages for one
/// transport's default node.
pub struct ConfidentialMessageService {
    nodes_by_id: Arc<NodesById>,
    default_node: Arc<Node>,
    key_bundle: Arc<KeyBundle>,
    /// Present when the transport supports data replication; without it
    /// there is no mailbox fallback and sends to offline peers fail.
    data_service: Option<Arc<DataService>>,
    listeners: RwLock<Vec<Arc<dyn ConfidentialMessageListener>>>,
    delivery_status: DashMap<String, MessageDeliveryStatus>,
    resend_items: DashMap<String, ResendItem>,
}

impl ConfidentialMessageService {
    pub fn new(
        nodes_by_id: Arc<NodesById>,
        default_node: Arc<Node>,
        key_bundle: Arc<KeyBundle>,
        data_service: Option<Arc<DataService>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes_by_id,
            default_node,
            key_bundle,
            data_service,
            listeners: RwLock::new(Vec::new()),
            delivery_status: DashMap::new(),
            resend_items: DashMap::new(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfidentialMessageListener>) {
        self.listeners.write().push(listener);
    }

    pub fn delivery_status(&self, message_id: &str) -> Option<MessageDeliveryStatus> {
        self.delivery_status.get(message_id).map(|entry| *entry)
    }

    /// Message ids that were sent but never acked. Candidates for
    /// [`resend`](Self::resend).
    pub fn unacknowledged_messages(&self) -> Vec<String> {
        self.resend_items.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Seal and deliver `plaintext` to `receiver` at `address`, falling
    /// back to the receiver's mailbox if the direct path fails.
    pub async fn send(
        self: &Arc<Self>,
        plaintext: &[u8],
        receiver: &NetworkId,
        address: &Address,
        sender_node_id: &str,
    ) -> SendConfidentialMessageResult {
        let Ok(sealed) = SealedBox::seal(
            plaintext,
            &receiver.encryption_key,
            self.key_bundle.keypair(),
        ) else {
            return SendConfidentialMessageResult {
                message_id: String::new(),
                status: MessageDeliveryStatus::Failed,
            };
        };
        let message = ConfidentialMessage::new(sealed, receiver.key_hash());
        let message_id = message.id.clone();

        self.resend_items.insert(
            message_id.clone(),
            ResendItem {
                plaintext: plaintext.to_vec(),
                receiver: receiver.clone(),
                address: address.clone(),
                sender_node_id: sender_node_id.to_string(),
            },
        );

        let status = self.deliver(message, receiver, address, sender_node_id).await;
        if status == MessageDeliveryStatus::Failed {
            self.resend_items.remove(&message_id);
        }
        self.delivery_status.insert(message_id.clone(), status);
        SendConfidentialMessageResult { message_id, status }
    }

    /// Retry an unacknowledged message. Re-seals with a fresh ephemeral
    /// key; the new attempt keeps the original message id for status
    /// continuity.
    pub async fn resend(self: &Arc<Self>, message_id: &str) -> Option<SendConfidentialMessageResult> {
        let (plaintext, receiver, address, sender_node_id) = {
            let item = self.resend_items.get(message_id)?;
            (
                item.plaintext.clone(),
                item.receiver.clone(),
                item.address.clone(),
                item.sender_node_id.clone(),
            )
        };
        let Ok(sealed) = SealedBox::seal(
            &plaintext,
            &receiver.encryption_key,
            self.key_bundle.keypair(),
        ) else {
            return None;
        };
        let mut message = ConfidentialMessage::new(sealed, receiver.key_hash());
        message.id = message_id.to_string();

        info!(message_id, "resending unacknowledged message");
        let status = self
            .deliver(message, &receiver, &address, &sender_node_id)
            .await;
        self.delivery_status.insert(message_id.to_string(), status);
        Some(SendConfidentialMessageResult {
            message_id: message_id.to_string(),
            status,
        })
    }

    async fn deliver(
        &self,
        message: ConfidentialMessage,
        receiver: &NetworkId,
        address: &Address,
        sender_node_id: &str,
    ) -> MessageDeliveryStatus {
        let direct = self
            .nodes_by_id
            .send(
                sender_node_id,
                address,
                EnvelopePayload::Confidential(message.clone()),
            )
            .await;

        match direct {
            Ok(()) => MessageDeliveryStatus::Sent,
            Err(e) => {
                debug!(peer = %address, error = %e, "direct delivery failed, trying mailbox");
                self.park_in_mailbox(message, receiver)
            }
        }
    }

    fn park_in_mailbox(
        &self,
        message: ConfidentialMessage,
        receiver: &NetworkId,
    ) -> MessageDeliveryStatus {
        let Some(data_service) = &self.data_service else {
            return MessageDeliveryStatus::Failed;
        };
        let meta = MetaData::new(MAILBOX_STORE_CLASS, DEFAULT_MAILBOX_TTL, DEFAULT_MAX_MAP_SIZE);
        let mailbox_data = MailboxData::new(message, meta);
        match data_service.add_mailbox_data(
            mailbox_data,
            receiver.key_hash(),
            self.key_bundle.keypair(),
        ) {
            Ok(result) if result.is_success() => MessageDeliveryStatus::StoredInMailbox,
            Ok(result) => {
                warn!(reason = ?result.reason(), "mailbox fallback rejected");
                MessageDeliveryStatus::Failed
            }
            Err(e) => {
                warn!(error = %e, "mailbox fallback failed");
                MessageDeliveryStatus::Failed
            }
        }
    }

    // -- Receiving -----------------------------------------------------------

    /// Decrypt and dispatch a message addressed to us. Returns the message
    /// id when the message was for us and valid.
    pub fn process_confidential_message(&self, message: &ConfidentialMessage) -> Option<String> {
        if message.receiver_key_hash != self.key_bundle.key_hash() {
            // Not ours. Mailbox stores hold messages for everyone; skipping
            // foreign ciphertext is the normal case, not an error.
            return None;
        }
        let plaintext = match message.sealed.open(&self.key_bundle) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to open confidential message");
                return None;
            }
        };
        let sender = message.sealed.sender_public_key.clone();
        debug!(message_id = %message.id, sender = %sender.to_hex(), "confidential message received");
        self.notify(|listener| listener.on_message(&plaintext, &sender, &message.id));
        Some(message.id.clone())
    }

    /// Record a receipt: the message reached its receiver and was decrypted.
    pub fn process_ack(&self, ack: &AckMessage) {
        self.delivery_status
            .insert(ack.message_id.clone(), MessageDeliveryStatus::AckReceived);
        self.resend_items.remove(&ack.message_id);
        debug!(message_id = %ack.message_id, "delivery acknowledged");
    }

    pub fn shutdown(&self) {
        self.resend_items.clear();
    }

    fn notify(&self, f: impl Fn(&Arc<dyn ConfidentialMessageListener>)) {
        for listener in self.listeners.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
                error!("confidential message listener panicked");
            }
        }
    }
}

/// Direct deliveries over the node.
impl NodeListener for ConfidentialMessageService {
    fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>) {
        match payload {
            EnvelopePayload::Confidential(message) => {
                if let Some(message_id) = self.process_confidential_message(message) {
                    // Receipt goes back over the connection that delivered.
                    let node = self.default_node.clone();
                    let peer = connection.peer_address().clone();
                    tokio::spawn(async move {
                        let ack = EnvelopePayload::Ack(AckMessage { message_id });
                        if let Err(e) = node.send(&peer, ack).await {
                            debug!(%peer, error = %e, "ack delivery failed");
                        }
                    });
                }
            }
            EnvelopePayload::Ack(ack) => self.process_ack(ack),
            _ => {}
        }
    }

    fn on_connection(&self, _connection: &Arc<Connection>) {}

    fn on_disconnect(&self, _connection: &Arc<Connection>, _reason: CloseReason) {}
}

/// Mailbox deliveries via the replicated store.
impl DataServiceListener for ConfidentialMessageService {
    fn on_mailbox_data_added(&self, data: &MailboxData) {
        if self
            .process_confidential_message(&data.confidential_message)
            .is_some()
        {
            // Consumed: retract the entry so it stops occupying the
            // overlay. Only we can; removal authority is ours.
            if let Some(data_service) = &self.data_service {
                match data_service.remove_mailbox_data(data, self.key_bundle.keypair()) {
                    Ok(result) if result.is_success() => {
                        debug!(message_id = %data.confidential_message.id, "mailbox entry retracted")
                    }
                    Ok(result) => {
                        debug!(reason = ?result.reason(), "mailbox retraction not applied")
                    }
                    Err(e) => warn!(error = %e, "mailbox retraction failed"),
                }
            }
        }
    }
}
