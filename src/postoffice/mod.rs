//! Address to binding table and message routing.
//!
//! Bindings are kept per binding address in registration order. A binding
//! address may use `*` and `#` wildcards (see [`address`]); routing offers a
//! message to every binding whose address matches the message's address and
//! whose filter accepts it.
//!
//! The post office is also the [`ReferenceSink`] of every queue it creates:
//! acknowledgements, delivery counts and dead-letter moves end up here, where
//! they are journaled and where the message's memory is released once its
//! last reference goes.

pub mod address;
mod binding;
mod duplicate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::clock::Clock;
use crate::filter::Filter;
use crate::message::{
    Message, MessageReference, ServerMessage, TypedValue, HDR_ORIGINAL_ADDRESS, HDR_ORIGINAL_QUEUE,
};
use crate::paging::{DepageRouter, PagingManager};
use crate::queue::{DefaultQueueFactory, HandleStatus, Queue, QueueFactory, QueueOptions, ReferenceSink};
use crate::settings::SettingsRepository;
use crate::storage::{BindingRecord, DuplicateIdRecord, StorageManager};
use crate::transaction::Transaction;
use crate::{Error, Result};

pub use binding::{Binding, RemoteQueueBinding};
pub use duplicate::DuplicateIdCache;

#[derive(Debug, Clone, Copy)]
pub struct PostOfficeOptions {
    pub require_destinations: bool,
    pub reject_duplicates: bool,
    pub id_cache_size: usize,
}

impl Default for PostOfficeOptions {
    fn default() -> Self {
        Self {
            require_destinations: false,
            reject_duplicates: false,
            id_cache_size: 2000,
        }
    }
}

/// Outcome of [`PostOffice::route`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteResult {
    pub message_id: u64,
    /// Local queues that got (or will get, on commit) a reference.
    pub queues: usize,
    pub remote_queue_ids: Vec<u64>,
    pub paged: bool,
    /// Dropped as a duplicate.
    pub duplicate: bool,
}

#[derive(Default)]
struct BindingTable {
    /// Binding addresses in first-registration order.
    addresses: Vec<String>,
    by_address: HashMap<String, Vec<Arc<Binding>>>,
    by_name: HashMap<String, Arc<Binding>>,
    queues: HashMap<u64, Arc<Queue>>,
}

impl BindingTable {
    fn insert(&mut self, binding: Arc<Binding>) {
        let address = binding.address().to_string();
        if !self.by_address.contains_key(&address) {
            self.addresses.push(address.clone());
        }
        self.by_address.entry(address).or_default().push(Arc::clone(&binding));
        if let Some(queue) = binding.queue() {
            self.queues.insert(queue.id(), Arc::clone(queue));
        }
        self.by_name.insert(binding.name().to_string(), binding);
    }

    fn remove(&mut self, name: &str) -> Option<Arc<Binding>> {
        let binding = self.by_name.remove(name)?;
        let address = binding.address();
        if let Some(list) = self.by_address.get_mut(address) {
            list.retain(|b| !Arc::ptr_eq(b, &binding));
            if list.is_empty() {
                self.by_address.remove(address);
                self.addresses.retain(|a| a != address);
            }
        }
        if let Some(queue) = binding.queue() {
            self.queues.remove(&queue.id());
        }
        Some(binding)
    }
}

struct PostOfficeSink(Weak<PostOffice>);

impl PostOfficeSink {
    fn post_office(&self) -> Result<Arc<PostOffice>> {
        self.0
            .upgrade()
            .ok_or(Error::ObjectClosed("post office"))
    }
}

impl ReferenceSink for PostOfficeSink {
    fn acknowledge(&self, reference: &MessageReference) -> Result<()> {
        self.post_office()?.acknowledge_reference(reference)
    }

    fn update_delivery_count(&self, reference: &MessageReference) -> Result<()> {
        self.post_office()?.update_delivery_count(reference)
    }

    fn move_reference(&self, reference: &MessageReference, address: &str) -> Result<()> {
        self.post_office()?.move_reference(reference, address)
    }
}

pub struct PostOffice {
    storage: Arc<dyn StorageManager>,
    paging: Arc<PagingManager>,
    factory: Arc<dyn QueueFactory>,
    clock: Arc<dyn Clock>,
    options: PostOfficeOptions,
    bindings: RwLock<BindingTable>,
    duplicates: Mutex<HashMap<String, DuplicateIdCache>>,
}

impl PostOffice {
    pub fn new(
        storage: Arc<dyn StorageManager>,
        paging: Arc<PagingManager>,
        settings: Arc<SettingsRepository>,
        clock: Arc<dyn Clock>,
        options: PostOfficeOptions,
    ) -> Arc<Self> {
        let factory = Arc::new(DefaultQueueFactory::new(settings, Arc::clone(&clock)));
        let post_office = Arc::new(Self {
            storage,
            paging: Arc::clone(&paging),
            factory: Arc::clone(&factory) as Arc<dyn QueueFactory>,
            clock,
            options,
            bindings: RwLock::new(BindingTable::default()),
            duplicates: Mutex::new(HashMap::new()),
        });
        factory.set_sink(Arc::new(PostOfficeSink(Arc::downgrade(&post_office))));
        let router: Weak<PostOffice> = Arc::downgrade(&post_office);
        paging.set_router(router);
        post_office
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    pub fn paging(&self) -> &Arc<PagingManager> {
        &self.paging
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Creates a queue bound to `address`. Durable bindings are persisted.
    pub fn add_binding(
        &self,
        address: &str,
        queue_name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        let filter = Filter::parse_optional(filter)?;
        let mut table = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        if table.by_name.contains_key(queue_name) {
            return Err(Error::QueueExists(queue_name.to_string()));
        }
        let id = self.storage.generate_id()?;
        if durable {
            self.storage.add_binding(&BindingRecord {
                queue_id: id,
                address: address.to_string(),
                queue_name: queue_name.to_string(),
                filter: filter.as_ref().map(|f| f.as_str().to_string()),
            })?;
        }
        let queue = self.factory.create_queue(QueueOptions {
            id,
            name: queue_name.to_string(),
            address: address.to_string(),
            filter,
            durable,
            temporary,
        })?;
        table.insert(Arc::new(Binding::Local {
            address: address.to_string(),
            queue: Arc::clone(&queue),
        }));
        info!("bound queue {queue_name} ({id}) to {address}, durable: {durable}");
        Ok(queue)
    }

    /// Re-creates a persisted binding at startup.
    pub(crate) fn restore_binding(&self, record: &BindingRecord) -> Result<Arc<Queue>> {
        let filter = Filter::parse_optional(record.filter.as_deref())?;
        let queue = self.factory.create_queue(QueueOptions {
            id: record.queue_id,
            name: record.queue_name.clone(),
            address: record.address.clone(),
            filter,
            durable: true,
            temporary: false,
        })?;
        let mut table = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        if table.by_name.contains_key(&record.queue_name) {
            return Err(Error::QueueExists(record.queue_name.clone()));
        }
        table.insert(Arc::new(Binding::Local {
            address: record.address.clone(),
            queue: Arc::clone(&queue),
        }));
        Ok(queue)
    }

    pub fn add_remote_binding(
        &self,
        address: &str,
        name: &str,
        remote_queue_id: u64,
        filter: Option<&str>,
    ) -> Result<()> {
        let filter = Filter::parse_optional(filter)?;
        let mut table = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        if table.by_name.contains_key(name) {
            return Err(Error::QueueExists(name.to_string()));
        }
        table.insert(Arc::new(Binding::Remote(RemoteQueueBinding {
            address: address.to_string(),
            name: name.to_string(),
            remote_queue_id,
            filter,
        })));
        debug!("remote binding {name} -> {remote_queue_id} on {address}");
        Ok(())
    }

    /// Deregisters a binding. A local queue loses its pending references and
    /// its persisted binding.
    pub fn remove_binding(&self, name: &str) -> Result<Arc<Binding>> {
        let binding = self
            .bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .ok_or_else(|| Error::QueueDoesNotExist(name.to_string()))?;
        if let Some(queue) = binding.queue() {
            let removed = queue.remove_references(None)?;
            if queue.is_durable() {
                self.storage.delete_binding(queue.id())?;
            }
            info!("removed queue {name} with {removed} pending references");
        }
        Ok(binding)
    }

    pub fn binding(&self, name: &str) -> Option<Arc<Binding>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .get(name)
            .cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.binding(name).and_then(|b| b.queue().cloned())
    }

    pub fn queue_by_id(&self, id: u64) -> Option<Arc<Queue>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .queues
            .get(&id)
            .cloned()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .queues
            .values()
            .cloned()
            .collect()
    }

    /// Bindings registered under exactly `address`, in registration order.
    pub fn bindings_for_address(&self, address: &str) -> Vec<Arc<Binding>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_address
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Local queues and remote queue ids that would receive `message` if it
    /// were sent to `address`.
    fn resolve(&self, address: &str, message: &Message) -> (Vec<Arc<Queue>>, Vec<u64>) {
        let table = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        let mut queues = Vec::new();
        let mut remote = Vec::new();
        for binding_address in &table.addresses {
            if !address::matches(binding_address, address) {
                continue;
            }
            for binding in table.by_address.get(binding_address).into_iter().flatten() {
                if !binding.accepts(message) {
                    continue;
                }
                match binding.as_ref() {
                    Binding::Local { queue, .. } => queues.push(Arc::clone(queue)),
                    Binding::Remote(r) => remote.push(r.remote_queue_id),
                }
            }
        }
        (queues, remote)
    }

    pub fn is_duplicate(&self, address: &str, id: &[u8]) -> bool {
        self.duplicates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .is_some_and(|cache| cache.contains(id))
    }

    pub(crate) fn remember_duplicate(&self, address: &str, id: Bytes, record_id: u64) {
        let evicted = self
            .duplicates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_insert_with(|| DuplicateIdCache::new(self.options.id_cache_size))
            .add(id, record_id);
        for record in evicted {
            if let Err(err) = self.storage.delete_duplicate_id(record) {
                warn!("failed to delete duplicate id record {record}: {err}");
            }
        }
    }

    pub(crate) fn restore_duplicates(&self, records: &[DuplicateIdRecord]) {
        for record in records {
            self.remember_duplicate(&record.address, Bytes::from(record.duplicate_id.clone()), record.id);
        }
    }

    fn record_duplicate(&self, address: &str, id: Bytes, tx: Option<&Arc<Transaction>>) -> Result<()> {
        let record = DuplicateIdRecord {
            id: self.storage.generate_id()?,
            address: address.to_string(),
            duplicate_id: id.to_vec(),
        };
        self.storage.store_duplicate_id(&record, tx.map(|t| t.id()))?;
        match tx {
            Some(tx) => {
                tx.mark_journaled();
                tx.add_duplicate(record.address, id, record.id);
            }
            None => self.remember_duplicate(address, id, record.id),
        }
        Ok(())
    }

    /// Routes a message to every matching binding.
    ///
    /// Assigns the message id and timestamp when unset. Inside a transaction
    /// the references are held by `tx` until it commits.
    pub fn route(&self, mut message: Message, tx: Option<&Arc<Transaction>>) -> Result<RouteResult> {
        let duplicate_id = message.duplicate_id();
        if let Some(id) = &duplicate_id {
            if self.is_duplicate(&message.address, id) {
                if self.options.reject_duplicates {
                    return Err(Error::DuplicateId(String::from_utf8_lossy(id).into_owned()));
                }
                debug!("dropping duplicate message on {}", message.address);
                return Ok(RouteResult {
                    duplicate: true,
                    ..RouteResult::default()
                });
            }
        }
        if message.id == 0 {
            message.id = self.storage.generate_id()?;
        }
        if message.timestamp == 0 {
            message.timestamp = self.clock.now_millis();
        }

        let address = message.address.clone();
        let (queues, remote) = self.resolve(&address, &message);
        for remote_id in &remote {
            message.add_route_to(*remote_id);
        }
        let mut result = RouteResult {
            message_id: message.id,
            queues: queues.len(),
            remote_queue_ids: remote,
            ..RouteResult::default()
        };
        if queues.is_empty() {
            if result.remote_queue_ids.is_empty() {
                if self.options.require_destinations {
                    return Err(Error::Routing(address));
                }
                debug!("no bindings for {address}, message {} dropped", message.id);
            }
            return Ok(result);
        }

        if let Some(id) = duplicate_id {
            self.record_duplicate(&address, id, tx)?;
        }
        if self.page_if_needed(&message, &queues, tx)? {
            result.paged = true;
            return Ok(result);
        }
        self.deliver_to_queues(message, queues, tx, false)?;
        Ok(result)
    }

    fn page_if_needed(&self, message: &Message, queues: &[Arc<Queue>], tx: Option<&Arc<Transaction>>) -> Result<bool> {
        let full = queues.iter().find(|q| q.is_full());
        let Some(store) = self.paging.store_for(&message.address)? else {
            return match full {
                Some(queue) => Err(Error::QueueFull(queue.name().to_string())),
                None => Ok(false),
            };
        };
        if let (Some(queue), None) = (full, store.max_messages()) {
            return Err(Error::QueueFull(queue.name().to_string()));
        }

        let info = tx.map(|tx| tx.page_transaction()).transpose()?;
        if let Some(info) = &info {
            info.increment();
        }
        let tx_id = tx.map(|t| t.id());
        let paged = if full.is_some() {
            store.force_page(message, tx_id).map(|_| true)
        } else {
            store.page(message, tx_id)
        };
        match (paged, &info) {
            (Ok(true), _) => {
                debug!("message {} paged on {}", message.id, message.address);
                Ok(true)
            }
            (Ok(false), Some(info)) => {
                info.decrement()?;
                Ok(false)
            }
            (Ok(false), None) => Ok(false),
            (Err(err), info) => {
                if let Some(info) = info {
                    info.decrement()?;
                }
                Err(err)
            }
        }
    }

    /// Hands a message to its target queues. Depaged messages were already
    /// accepted by the address once, so they bypass queue size limits.
    fn deliver_to_queues(
        &self,
        message: Message,
        queues: Vec<Arc<Queue>>,
        tx: Option<&Arc<Transaction>>,
        depaged: bool,
    ) -> Result<()> {
        let persist = message.durable && self.storage.is_persistent() && queues.iter().any(|q| q.is_durable());
        let server = ServerMessage::new(message);
        let references: Vec<(Arc<Queue>, MessageReference)> = queues
            .into_iter()
            .map(|queue| {
                server.increment_refs(queue.is_durable());
                let reference = MessageReference::new(Arc::clone(&server), queue.id(), queue.is_durable());
                (queue, reference)
            })
            .collect();

        if persist {
            if let Err(err) = self.persist(&server, &references, tx) {
                for (_, reference) in &references {
                    self.release_reference(reference);
                }
                return Err(err);
            }
        }

        match tx {
            Some(tx) => {
                for (queue, reference) in references {
                    tx.add_reference(queue, reference)?;
                }
            }
            None => {
                for (queue, reference) in references {
                    if depaged {
                        queue.add_unbounded(reference);
                    } else if queue.add_last(reference.clone()) == HandleStatus::Busy {
                        warn!("queue {} filled up while routing message {}", queue.name(), server.id());
                        self.acknowledge_reference(&reference)?;
                        continue;
                    }
                    queue.deliver();
                }
            }
        }
        Ok(())
    }

    fn persist(
        &self,
        server: &ServerMessage,
        references: &[(Arc<Queue>, MessageReference)],
        tx: Option<&Arc<Transaction>>,
    ) -> Result<()> {
        match tx {
            None => self.storage.store_message(&server.message())?,
            Some(tx) => {
                self.storage.store_message_transactional(tx.id(), &server.message())?;
                tx.mark_journaled();
            }
        }
        for (queue, reference) in references.iter().filter(|(_, r)| r.is_durable()) {
            match tx {
                None => self
                    .storage
                    .store_reference(queue.id(), server.id(), reference.scheduled_delivery)?,
                Some(tx) => self.storage.store_reference_transactional(
                    tx.id(),
                    queue.id(),
                    server.id(),
                    reference.scheduled_delivery,
                )?,
            }
        }
        Ok(())
    }

    /// Drops one reference of a message. The last reference releases the
    /// message's memory on its paging store.
    pub fn release_reference(&self, reference: &MessageReference) {
        let message = reference.message();
        if message.decrement_refs() == 0 {
            if let Some(store) = self.paging.store(message.address()) {
                store.release_memory();
            }
        }
    }

    pub(crate) fn acknowledge_reference(&self, reference: &MessageReference) -> Result<()> {
        if reference.is_durable() && self.storage.is_persistent() {
            let message_id = reference.message_id();
            if reference.message().decrement_durable_refs() == 0 {
                self.storage.delete_message(message_id)?;
            } else {
                self.storage.store_acknowledge(reference.queue_id(), message_id)?;
            }
        }
        self.release_reference(reference);
        Ok(())
    }

    fn update_delivery_count(&self, reference: &MessageReference) -> Result<()> {
        if reference.is_durable() && self.storage.is_persistent() {
            self.storage.update_delivery_count(
                reference.queue_id(),
                reference.message_id(),
                reference.delivery_count,
            )?;
        }
        Ok(())
    }

    /// Moves a reference's message to the queues bound at `address`, keeping
    /// the message id, then acknowledges the original reference.
    fn move_reference(&self, reference: &MessageReference, address: &str) -> Result<()> {
        let server = reference.message();
        server.put_header(HDR_ORIGINAL_ADDRESS, TypedValue::from(server.address()));
        if let Some(queue) = self.queue_by_id(reference.queue_id()) {
            server.put_header(HDR_ORIGINAL_QUEUE, TypedValue::from(queue.name()));
        }
        let snapshot = server.snapshot();
        let (targets, _) = self.resolve(address, &snapshot);
        if targets.is_empty() {
            warn!("no queues bound to {address}, dropping message {}", server.id());
        }

        let persistent = self.storage.is_persistent();
        let durable_targets = server.durable() && targets.iter().any(|q| q.is_durable());
        if persistent && durable_targets && server.durable_ref_count() == 0 {
            self.storage.store_message(&snapshot)?;
        }
        for queue in &targets {
            server.increment_refs(queue.is_durable());
            let mut moved = MessageReference::new(Arc::clone(server), queue.id(), queue.is_durable());
            moved.scheduled_delivery = 0;
            if moved.is_durable() && persistent {
                self.storage.store_reference(queue.id(), server.id(), 0)?;
            }
            queue.add_unbounded(moved);
        }
        self.acknowledge_reference(reference)?;
        for queue in &targets {
            queue.deliver();
        }
        Ok(())
    }
}

impl DepageRouter for PostOffice {
    fn route_depaged(&self, message: Message) -> Result<()> {
        let address = message.address.clone();
        let (queues, _) = self.resolve(&address, &message);
        if queues.is_empty() {
            debug!("depaged message {} has no bindings left on {address}", message.id);
            return Ok(());
        }
        if let Some(store) = self.paging.store(&address) {
            store.add_memory();
        }
        self.deliver_to_queues(message, queues, None, true)
    }
}
