//! # Inventory Reconciliation
//!
//! Flooding replicates data to whoever is connected at broadcast time; a
//! peer that was offline converges by asking a fresh connection for its
//! inventory. The responder streams back the stored requests themselves
//! (adds and tombstones alike), and the requester applies them through the
//! normal storage path, so every validation rule and listener-notification
//! rule holds for reconciled data exactly as it does for gossiped data.
//!
//! Responses are bounded by an entry budget. Entries are ranked by payload
//! priority, then freshness; whatever does not fit is left for the next
//! round. The budget is advisory for the responder but enforced by the
//! requester: an oversized response is truncated, not trusted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::MAX_INVENTORY_ENTRIES;
use crate::data_service::DataService;
use crate::envelope::EnvelopePayload;
use crate::node::{CloseReason, Connection, Node, NodeListener};
use crate::storage::{AuthenticatedDataRequest, DataRequest, MailboxRequest};

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Ask a peer for its stored requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryRequest {
    /// Store classes of interest; empty means everything.
    pub store_classes: Vec<String>,
    /// Upper bound on entries the requester will accept.
    pub max_entries: u32,
}

/// The stored requests of the responder, bounded by the requested budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub authenticated: Vec<AuthenticatedDataRequest>,
    pub mailbox: Vec<MailboxRequest>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct InventoryConfig {
    /// Budget used for our own requests and as a ceiling on responses.
    pub max_entries: usize,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            max_entries: MAX_INVENTORY_ENTRIES,
        }
    }
}

// ---------------------------------------------------------------------------
// InventoryService
// ---------------------------------------------------------------------------

/// Answers inventory requests from peers and requests inventory from every
/// freshly connected peer.
pub struct InventoryService {
    config: InventoryConfig,
    node: Arc<Node>,
    data_service: Arc<DataService>,
}

impl InventoryService {
    pub fn new(config: InventoryConfig, node: Arc<Node>, data_service: Arc<DataService>) -> Arc<Self> {
        Arc::new(Self {
            config,
            node,
            data_service,
        })
    }

    /// Build the response for a request against our stores.
    pub fn collect_inventory(&self, request: &InventoryRequest) -> InventoryResponse {
        let budget = (request.max_entries as usize).min(self.config.max_entries);
        let wants = |class: &str| {
            request.store_classes.is_empty()
                || request.store_classes.iter().any(|wanted| wanted == class)
        };

        let mut authenticated: Vec<(u8, u64, AuthenticatedDataRequest)> = Vec::new();
        self.data_service
            .storage()
            .for_each_authenticated_store(|class, store| {
                if !wants(class) {
                    return;
                }
                let map = store.store().lock_map();
                for request in map.values() {
                    let priority = match request {
                        AuthenticatedDataRequest::Add(add) => add.data.data.meta_data.priority,
                        AuthenticatedDataRequest::Remove(remove) => remove.meta_data.priority,
                    };
                    authenticated.push((priority, request.created_at(), request.clone()));
                }
            });

        let mut mailbox: Vec<(u8, u64, MailboxRequest)> = Vec::new();
        self.data_service.storage().for_each_mailbox_store(|class, store| {
            if !wants(class) {
                return;
            }
            let map = store.store().lock_map();
            for request in map.values() {
                let priority = match request {
                    MailboxRequest::Add(add) => add.data.mailbox_data.meta_data.priority,
                    MailboxRequest::Remove(remove) => remove.meta_data.priority,
                };
                mailbox.push((priority, request.created_at(), request.clone()));
            }
        });

        // Highest priority first, newest first within a priority class.
        authenticated.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        mailbox.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let auth_take = budget.min(authenticated.len());
        let mailbox_take = budget.saturating_sub(auth_take).min(mailbox.len());
        if authenticated.len() > auth_take || mailbox.len() > mailbox_take {
            debug!(
                budget,
                authenticated = authenticated.len(),
                mailbox = mailbox.len(),
                "inventory truncated to budget"
            );
        }

        InventoryResponse {
            authenticated: authenticated
                .into_iter()
                .take(auth_take)
                .map(|(_, _, r)| r)
                .collect(),
            mailbox: mailbox.into_iter().take(mailbox_take).map(|(_, _, r)| r).collect(),
        }
    }

    /// Apply a response through the normal storage path. No re-broadcast:
    /// reconciliation is pull-based and every peer pulls for itself.
    pub fn apply_inventory(&self, response: &InventoryResponse) {
        let budget = self.config.max_entries;
        for request in response.authenticated.iter().take(budget) {
            let payload = match request {
                AuthenticatedDataRequest::Add(add) => {
                    EnvelopePayload::AddAuthenticatedData(add.clone())
                }
                AuthenticatedDataRequest::Remove(remove) => {
                    EnvelopePayload::RemoveAuthenticatedData(remove.clone())
                }
            };
            self.data_service.process_storage_payload(&payload, None, false);
        }
        for request in response.mailbox.iter().take(budget) {
            let payload = match request {
                MailboxRequest::Add(add) => EnvelopePayload::AddMailboxData(add.clone()),
                MailboxRequest::Remove(remove) => EnvelopePayload::RemoveMailboxData(remove.clone()),
            };
            self.data_service.process_storage_payload(&payload, None, false);
        }
    }

    pub fn shutdown(&self) {}
}

impl NodeListener for InventoryService {
    fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>) {
        match payload {
            EnvelopePayload::InventoryRequest(request) => {
                let response = self.collect_inventory(request);
                let node = self.node.clone();
                let peer = connection.peer_address().clone();
                tokio::spawn(async move {
                    if let Err(e) = node
                        .send(&peer, EnvelopePayload::InventoryResponse(response))
                        .await
                    {
                        debug!(%peer, error = %e, "inventory response delivery failed");
                    }
                });
            }
            EnvelopePayload::InventoryResponse(response) => {
                self.apply_inventory(response);
            }
            _ => {}
        }
    }

    fn on_connection(&self, connection: &Arc<Connection>) {
        // Reconcile against every fresh peer; sequence numbers make
        // re-application of known data harmless.
        let request = InventoryRequest {
            store_classes: Vec::new(),
            max_entries: self.config.max_entries as u32,
        };
        let node = self.node.clone();
        let peer = connection.peer_address().clone();
        tokio::spawn(async move {
            if let Err(e) = node
                .send(&peer, EnvelopePayload::InventoryRequest(request))
                .await
            {
                debug!(%peer, error = %e, "inventory request delivery failed");
            }
        });
    }

    fn on_disconnect(&self, _connection: &Arc<Connection>, _reason: CloseReason) {}
}
