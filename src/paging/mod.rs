//! Per-address overflow to disk.
//!
//! The [`PagingManager`] owns one [`PagingStore`] per address, created the
//! first time the address is asked for. Depaged messages go back through a
//! [`DepageRouter`], normally the post office, which routes them without
//! consulting the store's threshold.

mod executor;
pub mod page;
mod store;
mod transaction;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, info};

use crate::message::Message;
use crate::settings::SettingsRepository;
use crate::storage::StorageManager;
use crate::{Error, Result};

pub use executor::SerialExecutor;
pub use page::PagedMessage;
pub use store::PagingStore;
pub use transaction::{PageTransactionInfo, PageTransactionState};

/// Receives messages coming back from page files.
pub trait DepageRouter: Send + Sync {
    fn route_depaged(&self, message: Message) -> Result<()>;
}

pub struct PagingManager {
    directory: PathBuf,
    settings: Arc<SettingsRepository>,
    storage: Arc<dyn StorageManager>,
    stores: RwLock<HashMap<String, Arc<PagingStore>>>,
    transactions: Mutex<HashMap<u64, Arc<PageTransactionInfo>>>,
    recovered: RwLock<HashSet<u64>>,
    router: RwLock<Option<Weak<dyn DepageRouter>>>,
}

/// Directory name for an address. Characters outside `[A-Za-z0-9._-]` are
/// replaced; the real address is kept in the store's `address` file.
fn store_dir_name(address: &str) -> String {
    address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

impl PagingManager {
    pub fn new(
        directory: impl Into<PathBuf>,
        settings: Arc<SettingsRepository>,
        storage: Arc<dyn StorageManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory: directory.into(),
            settings,
            storage,
            stores: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            recovered: RwLock::new(HashSet::new()),
            router: RwLock::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn set_router(&self, router: Weak<dyn DepageRouter>) {
        *self.router.write().unwrap_or_else(|e| e.into_inner()) = Some(router);
    }

    /// Ids of messages already restored from the journal. Depaging skips
    /// them.
    pub fn set_recovered_ids(&self, ids: impl IntoIterator<Item = u64>) {
        let mut recovered = self.recovered.write().unwrap_or_else(|e| e.into_inner());
        recovered.clear();
        recovered.extend(ids);
    }

    pub(crate) fn is_recovered(&self, message_id: u64) -> bool {
        self.recovered
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&message_id)
    }

    pub(crate) fn route_depaged(&self, message: Message) -> Result<()> {
        let router = self
            .router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::illegal_state("no router for depaged messages"))?;
        router.route_depaged(message)
    }

    /// Opens every store found on disk and resumes depaging.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        let mut resumed = 0;
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(address) = PagingStore::read_address(&entry.path())? else {
                debug!("ignoring {} without an address file", entry.path().display());
                continue;
            };
            let store = self.get_store(&address)?;
            if store.is_paging() {
                store.schedule_depage();
                resumed += 1;
            }
        }
        info!("paging started under {}, {resumed} addresses resuming depage", self.directory.display());
        Ok(())
    }

    /// The store of `address`, created on first use.
    pub fn get_store(self: &Arc<Self>, address: &str) -> Result<Arc<PagingStore>> {
        if let Some(store) = self.store(address) {
            return Ok(store);
        }
        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = stores.get(address) {
            return Ok(Arc::clone(store));
        }
        let settings = self.settings.match_address(address);
        let store = PagingStore::open(
            Arc::downgrade(self),
            address,
            self.directory.join(store_dir_name(address)),
            &settings,
        )?;
        stores.insert(address.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// The store of `address` if it is open or its settings enable paging.
    pub fn store_for(self: &Arc<Self>, address: &str) -> Result<Option<Arc<PagingStore>>> {
        if let Some(store) = self.store(address) {
            return Ok(Some(store));
        }
        if self.settings.match_address(address).page_max_messages.is_none() {
            return Ok(None);
        }
        self.get_store(address).map(Some)
    }

    /// The store of `address` if it has been opened.
    pub fn store(&self, address: &str) -> Option<Arc<PagingStore>> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    pub fn stores(&self) -> Vec<Arc<PagingStore>> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn add_page_transaction(&self, info: Arc<PageTransactionInfo>) {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.tx_id(), info);
    }

    pub fn page_transaction(&self, tx_id: u64) -> Option<Arc<PageTransactionInfo>> {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tx_id)
            .cloned()
    }

    pub fn remove_page_transaction(&self, tx_id: u64) -> Option<Arc<PageTransactionInfo>> {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tx_id)
    }

    pub fn page_transaction_count(&self) -> usize {
        self.transactions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every message of the transaction has been depaged.
    pub(crate) fn finish_page_transaction(&self, info: &PageTransactionInfo) -> Result<()> {
        self.remove_page_transaction(info.tx_id());
        self.storage.delete_page_transaction(info.record_id())?;
        debug!("page transaction {} fully depaged", info.tx_id());
        Ok(())
    }

    pub fn stop(&self) {
        for store in self.stores() {
            store.stop();
        }
        for info in self.transactions.lock().unwrap_or_else(|e| e.into_inner()).values() {
            if info.state() == PageTransactionState::Pending {
                debug!("page transaction {} still pending at shutdown", info.tx_id());
            }
        }
    }
}
