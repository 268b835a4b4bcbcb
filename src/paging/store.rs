use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::AddressSettings;
use crate::message::Message;
use crate::paging::executor::SerialExecutor;
use crate::paging::page::{self, Page, PagedMessage};
use crate::paging::transaction::PageTransactionInfo;
use crate::paging::PagingManager;
use crate::Result;

const ADDRESS_FILE: &str = "address";
const STOP_POLL: Duration = Duration::from_millis(100);

struct StoreState {
    paging: bool,
    /// Closed pages, oldest first.
    pages: VecDeque<u64>,
    current: Option<Page>,
    next_page_id: u64,
}

/// Overflow storage of one address.
///
/// The store pages once the address holds `page_max_messages` messages in
/// memory, and keeps paging until every page has been depaged so that
/// messages come back in the order they were sent.
pub struct PagingStore {
    address: String,
    directory: PathBuf,
    max_messages: Option<usize>,
    page_size: usize,
    memory: AtomicUsize,
    state: Mutex<StoreState>,
    depage_scheduled: AtomicBool,
    stopped: AtomicBool,
    executor: SerialExecutor,
    manager: Weak<PagingManager>,
}

impl PagingStore {
    pub(crate) fn open(
        manager: Weak<PagingManager>,
        address: &str,
        directory: PathBuf,
        settings: &AddressSettings,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&directory)?;
        let address_file = directory.join(ADDRESS_FILE);
        if !address_file.exists() {
            fs::write(&address_file, address)?;
        }
        let pages: VecDeque<u64> = page::discover_pages(&directory)?.into();
        let next_page_id = pages.back().map_or(1, |id| id + 1);
        let paging = !pages.is_empty();
        if paging {
            info!("address {address} has {} pages on disk", pages.len());
        }
        Ok(Arc::new(Self {
            address: address.to_string(),
            executor: SerialExecutor::spawn(&format!("depage-{address}"))?,
            directory,
            max_messages: settings.page_max_messages,
            page_size: settings.page_size_bytes(),
            memory: AtomicUsize::new(0),
            state: Mutex::new(StoreState {
                paging,
                pages,
                current: None,
                next_page_id,
            }),
            depage_scheduled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            manager,
        }))
    }

    /// Reads the address a store directory belongs to.
    pub(crate) fn read_address(directory: &Path) -> Result<Option<String>> {
        match fs::read_to_string(directory.join(ADDRESS_FILE)) {
            Ok(address) => Ok(Some(address)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_paging(&self) -> bool {
        self.lock().paging
    }

    /// Number of page files, including the one being written.
    pub fn page_count(&self) -> usize {
        let state = self.lock();
        state.pages.len() + usize::from(state.current.is_some())
    }

    pub fn memory_messages(&self) -> usize {
        self.memory.load(Ordering::SeqCst)
    }

    pub fn max_messages(&self) -> Option<usize> {
        self.max_messages
    }

    fn below_threshold(&self) -> bool {
        self.max_messages
            .map_or(true, |max| self.memory.load(Ordering::SeqCst) < max)
    }

    /// Pages `message` if the address is paging or has reached its
    /// threshold. Otherwise the message is counted as in memory and `false`
    /// is returned.
    pub fn page(&self, message: &Message, tx_id: Option<u64>) -> Result<bool> {
        let mut state = self.lock();
        let threshold_reached = self
            .max_messages
            .is_some_and(|max| state.paging || self.memory.load(Ordering::SeqCst) >= max);
        if !threshold_reached {
            self.memory.fetch_add(1, Ordering::SeqCst);
            return Ok(false);
        }
        self.write_locked(&mut state, message, tx_id)?;
        Ok(true)
    }

    /// Pages `message` regardless of the threshold.
    pub fn force_page(&self, message: &Message, tx_id: Option<u64>) -> Result<()> {
        let mut state = self.lock();
        self.write_locked(&mut state, message, tx_id)
    }

    fn write_locked(&self, state: &mut StoreState, message: &Message, tx_id: Option<u64>) -> Result<()> {
        if !state.paging {
            state.paging = true;
            info!(
                "address {} started paging with {} messages in memory",
                self.address,
                self.memory.load(Ordering::SeqCst)
            );
        }
        let full = state
            .current
            .as_ref()
            .map_or(true, |page| page.size() >= self.page_size);
        if full {
            if let Some(page) = state.current.take() {
                state.pages.push_back(page.id());
            }
            let id = state.next_page_id;
            state.next_page_id += 1;
            state.current = Some(Page::create(&self.directory, id)?);
        }
        let paged = PagedMessage {
            tx_id,
            message: message.clone(),
        };
        if let Some(page) = state.current.as_mut() {
            page.write(&paged, message.durable)?;
        }
        Ok(())
    }

    pub fn add_memory(&self) {
        self.memory.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a message leaving memory and starts depaging when the address
    /// dropped below its threshold.
    pub fn release_memory(self: &Arc<Self>) {
        let _ = self
            .memory
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if self.below_threshold() && self.is_paging() {
            self.schedule_depage();
        }
    }

    /// Queues a depage on the store's executor unless one is pending.
    pub fn schedule_depage(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.depage_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = Arc::clone(self);
        if !self.executor.execute(move || store.run_depage()) {
            self.depage_scheduled.store(false, Ordering::SeqCst);
        }
    }

    fn run_depage(self: &Arc<Self>) {
        let progressed = match self.depage() {
            Ok(progressed) => progressed,
            Err(err) => {
                error!("depaging {} failed: {err}", self.address);
                false
            }
        };
        self.depage_scheduled.store(false, Ordering::SeqCst);
        if progressed && self.below_threshold() && self.is_paging() {
            self.schedule_depage();
        }
    }

    /// Re-routes the messages of the oldest page and deletes it. Returns
    /// false when there was nothing to depage.
    pub fn depage(&self) -> Result<bool> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(manager) = self.manager.upgrade() else {
            return Ok(false);
        };
        let page_id = {
            let mut state = self.lock();
            if state.pages.is_empty() {
                if let Some(current) = state.current.take() {
                    state.pages.push_back(current.id());
                }
            }
            match state.pages.pop_front() {
                Some(id) => id,
                None => {
                    if state.paging {
                        state.paging = false;
                        info!("address {} stopped paging", self.address);
                    }
                    return Ok(false);
                }
            }
        };

        let messages = page::read_page(&self.directory, page_id)?;
        debug!(
            "depaging {} messages from page {page_id} of {}",
            messages.len(),
            self.address
        );
        let mut routed = 0usize;
        for paged in messages {
            let info = match paged.tx_id {
                Some(tx_id) => match manager.page_transaction(tx_id) {
                    Some(info) => {
                        if !self.wait_for(&info) {
                            if self.stopped.load(Ordering::SeqCst) {
                                return Ok(false);
                            }
                            debug!("skipping message {} of rolled back transaction {tx_id}", paged.message.id);
                            continue;
                        }
                        Some(info)
                    }
                    None => {
                        debug!("skipping message {} of unknown page transaction {tx_id}", paged.message.id);
                        continue;
                    }
                },
                None => None,
            };

            let id = paged.message.id;
            if manager.is_recovered(id) {
                debug!("message {id} was already recovered from the journal");
            } else if let Err(err) = manager.route_depaged(paged.message) {
                warn!("dropping depaged message {id} of {}: {err}", self.address);
            } else {
                routed += 1;
            }

            if let Some(info) = info {
                if info.decrement()? == 0 {
                    manager.finish_page_transaction(&info)?;
                }
            }
        }
        page::delete_page(&self.directory, page_id)?;

        let mut state = self.lock();
        if state.pages.is_empty() && state.current.is_none() && state.paging {
            state.paging = false;
            info!("address {} stopped paging after depaging {routed} messages", self.address);
        }
        Ok(true)
    }

    fn wait_for(&self, info: &PageTransactionInfo) -> bool {
        loop {
            if let Some(complete) = info.wait_completion_timeout(STOP_POLL) {
                return complete;
            }
            if self.stopped.load(Ordering::SeqCst) {
                return false;
            }
        }
    }

    /// Waits until no depage is queued or running.
    pub fn flush_executor(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline || !self.executor.flush(deadline - now) {
                return false;
            }
            if !self.depage_scheduled.load(Ordering::SeqCst) {
                return true;
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.executor.shutdown();
        if let Some(page) = self.lock().current.as_ref() {
            if let Err(err) = page.sync() {
                warn!("failed to sync page of {}: {err}", self.address);
            }
        }
    }
}
