//! # Storage Module
//!
//! The replicated key-value layer of the overlay. Data lives in *stores*,
//! one per payload-type name, each an independent `hash → latest request`
//! map with its own lock, its own TTL class, and its own sled tree. The
//! [`StorageService`] is the registry that owns them.
//!
//! ## Architecture
//!
//! ```text
//! meta_data.rs — per-payload-type descriptor (TTL, priority, size class)
//! result.rs    — typed operation outcomes and reject reasons
//! store.rs     — the generic persisted map (coarse lock, rate-limited
//!                writes, prune-on-load)
//! auth.rs      — authenticated data: add/remove with sequence-number
//!                conflict resolution and publisher-only removal
//! mailbox.rs   — mailbox data: encrypted store-and-forward entries with
//!                receiver-only removal
//! ```
//!
//! Persisted state uses one sled database with a named tree per store
//! (`auth/<class>` and `mailbox/<class>`), so everything an operator needs
//! to back up is a single directory.

pub mod auth;
pub mod mailbox;
pub mod meta_data;
pub mod result;
pub mod store;

pub use auth::{
    AddAuthenticatedDataRequest, AuthenticatedDataListener, AuthenticatedDataRequest,
    AuthenticatedDataStorageService, AuthenticatedSequentialData, DistributedData,
    RemoveAuthenticatedDataRequest,
};
pub use mailbox::{
    AddMailboxRequest, MailboxData, MailboxDataListener, MailboxDataStorageService,
    MailboxRequest, MailboxSequentialData, RemoveMailboxRequest,
};
pub use meta_data::MetaData;
pub use result::{DataStorageResult, RejectReason};
pub use store::{DataRequest, DataStore, StoreError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{MIN_PERSIST_INTERVAL, PRUNE_INTERVAL};

/// Tree name prefixes inside the shared sled database.
const AUTH_TREE_PREFIX: &str = "auth/";
const MAILBOX_TREE_PREFIX: &str = "mailbox/";

/// Registry of all stores of one node.
///
/// Stores persisted in earlier runs are reopened eagerly at construction,
/// so replicated data is available before any application payload class
/// registers interest in it.
pub struct StorageService {
    db: sled::Db,
    authenticated_stores: DashMap<String, Arc<AuthenticatedDataStorageService>>,
    mailbox_stores: DashMap<String, Arc<MailboxDataStorageService>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl StorageService {
    /// Open (or create) the storage database at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// A database that lives in memory and disappears on drop. For tests.
    pub fn open_temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let service = Self {
            db,
            authenticated_stores: DashMap::new(),
            mailbox_stores: DashMap::new(),
            maintenance: Mutex::new(None),
        };

        // Reopen every store that was persisted by an earlier run.
        for name in service.db.tree_names() {
            let Ok(name) = std::str::from_utf8(&name) else {
                continue;
            };
            if let Some(class_name) = name.strip_prefix(AUTH_TREE_PREFIX) {
                let meta = MetaData::with_defaults(class_name);
                service.get_or_create_authenticated_store(&meta)?;
            } else if let Some(class_name) = name.strip_prefix(MAILBOX_TREE_PREFIX) {
                let meta = MetaData::with_defaults(class_name);
                service.get_or_create_mailbox_store(&meta)?;
            }
        }
        Ok(service)
    }

    /// The store for an authenticated payload class, created on first use.
    pub fn get_or_create_authenticated_store(
        &self,
        meta_data: &MetaData,
    ) -> Result<Arc<AuthenticatedDataStorageService>, StoreError> {
        match self
            .authenticated_stores
            .entry(meta_data.class_name.clone())
        {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let tree = self
                    .db
                    .open_tree(format!("{AUTH_TREE_PREFIX}{}", meta_data.class_name))?;
                let store = Arc::new(AuthenticatedDataStorageService::open(tree, meta_data)?);
                info!(store = %meta_data.class_name, "opened authenticated data store");
                entry.insert(store.clone());
                Ok(store)
            }
        }
    }

    /// The store for a mailbox payload class, created on first use.
    pub fn get_or_create_mailbox_store(
        &self,
        meta_data: &MetaData,
    ) -> Result<Arc<MailboxDataStorageService>, StoreError> {
        match self.mailbox_stores.entry(meta_data.class_name.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let tree = self
                    .db
                    .open_tree(format!("{MAILBOX_TREE_PREFIX}{}", meta_data.class_name))?;
                let store = Arc::new(MailboxDataStorageService::open(tree, meta_data)?);
                info!(store = %meta_data.class_name, "opened mailbox data store");
                entry.insert(store.clone());
                Ok(store)
            }
        }
    }

    pub fn authenticated_store(&self, class_name: &str) -> Option<Arc<AuthenticatedDataStorageService>> {
        self.authenticated_stores
            .get(class_name)
            .map(|entry| entry.clone())
    }

    pub fn mailbox_store(&self, class_name: &str) -> Option<Arc<MailboxDataStorageService>> {
        self.mailbox_stores.get(class_name).map(|entry| entry.clone())
    }

    /// Visit every authenticated store.
    pub fn for_each_authenticated_store(
        &self,
        mut f: impl FnMut(&str, &Arc<AuthenticatedDataStorageService>),
    ) {
        for entry in self.authenticated_stores.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Visit every mailbox store.
    pub fn for_each_mailbox_store(&self, mut f: impl FnMut(&str, &Arc<MailboxDataStorageService>)) {
        for entry in self.mailbox_stores.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Total number of entries across all stores, tombstones included.
    pub fn total_entries(&self) -> usize {
        let auth: usize = self.authenticated_stores.iter().map(|e| e.value().len()).sum();
        let mailbox: usize = self.mailbox_stores.iter().map(|e| e.value().len()).sum();
        auth + mailbox
    }

    /// Write out any coalesced persistence requests.
    pub fn flush_all(&self) {
        for entry in self.authenticated_stores.iter() {
            entry.value().store().flush_if_dirty();
        }
        for entry in self.mailbox_stores.iter() {
            entry.value().store().flush_if_dirty();
        }
    }

    /// Drop TTL-expired entries from every store.
    pub fn prune_all_expired(&self) {
        for entry in self.authenticated_stores.iter() {
            entry.value().prune_expired();
        }
        for entry in self.mailbox_stores.iter() {
            entry.value().prune_expired();
        }
    }

    /// Start the background maintenance loop: periodic flush of coalesced
    /// writes and periodic TTL pruning. Idempotent.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let service = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut flush = tokio::time::interval(MIN_PERSIST_INTERVAL);
            let mut prune = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = flush.tick() => service.flush_all(),
                    _ = prune.tick() => service.prune_all_expired(),
                }
            }
        }));
    }

    /// Stop maintenance and flush everything to disk.
    pub fn shutdown(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        for entry in self.authenticated_stores.iter() {
            entry.value().shutdown();
        }
        for entry in self.mailbox_stores.iter() {
            entry.value().shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::VeilKeypair;
    use std::time::Duration;

    fn meta(class: &str) -> MetaData {
        MetaData::new(class, Duration::from_secs(3600), 100)
    }

    #[test]
    fn get_or_create_returns_same_store() {
        let service = StorageService::open_temporary().unwrap();
        let a = service.get_or_create_authenticated_store(&meta("Offers")).unwrap();
        let b = service.get_or_create_authenticated_store(&meta("Offers")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn stores_are_sharded_by_class_name() {
        let service = StorageService::open_temporary().unwrap();
        let offers = service.get_or_create_authenticated_store(&meta("Offers")).unwrap();
        let chat = service.get_or_create_authenticated_store(&meta("Chat")).unwrap();
        assert!(!Arc::ptr_eq(&offers, &chat));
    }

    #[test]
    fn persisted_stores_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();

        {
            let service = StorageService::open(dir.path()).unwrap();
            let store = service.get_or_create_authenticated_store(&meta("Offers")).unwrap();
            let keypair = VeilKeypair::generate();
            let data = DistributedData::new(b"offer-1".to_vec(), meta("Offers"));
            let request = AddAuthenticatedDataRequest::from_data(data, 1, &keypair);
            assert!(store.add(request).is_success());
            service.shutdown();
        }

        // A fresh service over the same directory sees the store without
        // anyone registering the payload class first.
        let service = StorageService::open(dir.path()).unwrap();
        let store = service.authenticated_store("Offers").expect("store reopened");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn total_entries_spans_store_kinds() {
        let service = StorageService::open_temporary().unwrap();
        let store = service.get_or_create_authenticated_store(&meta("Offers")).unwrap();
        service.get_or_create_mailbox_store(&meta("Mailbox")).unwrap();

        let keypair = VeilKeypair::generate();
        let data = DistributedData::new(b"offer-1".to_vec(), meta("Offers"));
        assert!(store
            .add(AddAuthenticatedDataRequest::from_data(data, 1, &keypair))
            .is_success());
        assert_eq!(service.total_entries(), 1);
    }
}
