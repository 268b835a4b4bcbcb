//! The broker instance.
//!
//! [`Broker::start`] opens storage, rebuilds bindings, messages, prepared
//! transactions and page transactions from it, resumes depaging, and only
//! then accepts connections. A ticker thread promotes scheduled references
//! and reaps timed-out transactions for as long as the broker runs.

mod browser;
mod connection;
mod consumer;
mod security;
mod session;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BrokerConfig;
use crate::message::{MessageReference, ServerMessage};
use crate::paging::{PageTransactionInfo, PagingManager};
use crate::postoffice::{PostOffice, PostOfficeOptions};
use crate::remoting::{intercept, Channel, Connection, InVmConnection, Interceptor, TcpAcceptor, TcpConnection};
use crate::settings::SettingsRepository;
use crate::storage::{JournalStorageManager, LoadedState, NullStorageManager, PreparedRecord, StorageManager};
use crate::transaction::{ResourceManager, Transaction, Xid};
use crate::{Error, Result};

pub use browser::ServerBrowser;
pub use connection::ServerConnection;
pub use consumer::ServerConsumer;
pub use security::{AllowAllSecurityManager, SecurityManager, UserListSecurityManager};
pub use session::ServerSession;

/// Everything sessions and connections share.
pub struct ServerContext {
    pub(crate) config: BrokerConfig,
    pub(crate) storage: Arc<dyn StorageManager>,
    pub(crate) paging: Arc<PagingManager>,
    pub(crate) post_office: Arc<PostOffice>,
    pub(crate) resource_manager: Arc<ResourceManager>,
    pub(crate) security: Arc<dyn SecurityManager>,
    pub(crate) clock: Arc<dyn Clock>,
    next_id: AtomicU64,
}

impl ServerContext {
    /// Ids for sessions and consumers. They never reach storage.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

type Connections = Arc<Mutex<HashMap<u64, Arc<Channel>>>>;

pub struct Broker {
    context: Arc<ServerContext>,
    connections: Connections,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    acceptor: Mutex<Option<TcpAcceptor>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl Broker {
    pub fn start(config: BrokerConfig, security: Arc<dyn SecurityManager>) -> Result<Arc<Self>> {
        Self::start_with_clock(config, security, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: BrokerConfig,
        security: Arc<dyn SecurityManager>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let storage: Arc<dyn StorageManager> = if config.persistence_enabled {
            Arc::new(JournalStorageManager::new(config.journal.clone(), config.id_batch_size)?)
        } else {
            Arc::new(NullStorageManager::new())
        };
        let settings = Arc::new(SettingsRepository::from_config(&config.address_settings));
        let paging = PagingManager::new(
            config.paging_directory.clone(),
            Arc::clone(&settings),
            Arc::clone(&storage),
        );
        let post_office = PostOffice::new(
            Arc::clone(&storage),
            Arc::clone(&paging),
            settings,
            Arc::clone(&clock),
            PostOfficeOptions {
                require_destinations: config.require_destinations,
                reject_duplicates: config.reject_duplicates,
                id_cache_size: config.id_cache_size,
            },
        );
        let resource_manager = Arc::new(ResourceManager::new(config.transaction_timeout_ms));
        let context = Arc::new(ServerContext {
            config,
            storage,
            paging,
            post_office,
            resource_manager,
            security,
            clock,
            next_id: AtomicU64::new(1),
        });

        let state = context.storage.load()?;
        let recovered_ids: Vec<u64> = state.message_ids().collect();
        Self::recover(&context, state)?;
        context.paging.set_recovered_ids(recovered_ids);
        context.paging.start()?;

        let broker = Arc::new(Self {
            context,
            connections: Arc::new(Mutex::new(HashMap::new())),
            interceptors: RwLock::new(Vec::new()),
            acceptor: Mutex::new(None),
            ticker: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        });
        broker.start_ticker()?;
        info!(
            "broker started with {} queues, {} in-doubt transactions",
            broker.context.post_office.queues().len(),
            broker.context.resource_manager.in_doubt_xids().len()
        );
        Ok(broker)
    }

    fn recover(context: &ServerContext, state: LoadedState) -> Result<()> {
        let post_office = &context.post_office;
        for record in &state.bindings {
            post_office.restore_binding(record)?;
        }

        let mut messages: HashMap<u64, Arc<ServerMessage>> = HashMap::new();
        let mut restored = 0usize;
        for loaded in state.messages {
            let message = ServerMessage::new(loaded.message);
            for stored in loaded.references {
                let Some(queue) = post_office.queue_by_id(stored.queue_id) else {
                    warn!("message {} references unknown queue {}", message.id(), stored.queue_id);
                    continue;
                };
                message.increment_refs(queue.is_durable());
                let mut reference = MessageReference::new(Arc::clone(&message), queue.id(), queue.is_durable());
                reference.delivery_count = stored.delivery_count;
                reference.scheduled_delivery = stored.scheduled_delivery;
                queue.add_unbounded(reference);
                restored += 1;
            }
            if let Some(store) = context.paging.store_for(message.address())? {
                store.add_memory();
            }
            messages.insert(message.id(), message);
        }
        debug!("restored {restored} references of {} messages", messages.len());

        for prepared in state.prepared {
            Self::recover_prepared(context, prepared, &mut messages)?;
        }
        for record in &state.page_transactions {
            context
                .paging
                .add_page_transaction(Arc::new(PageTransactionInfo::recovered(record, true)));
        }
        post_office.restore_duplicates(&state.duplicate_ids);
        Ok(())
    }

    /// Rebuilds a transaction that was prepared when the broker stopped and
    /// hands it to the resource manager as in doubt.
    fn recover_prepared(
        context: &ServerContext,
        prepared: PreparedRecord,
        messages: &mut HashMap<u64, Arc<ServerMessage>>,
    ) -> Result<()> {
        let post_office = &context.post_office;
        let xid = if prepared.data.is_empty() {
            None
        } else {
            Some(Xid::from_bytes(&prepared.data)?)
        };
        let tx = Transaction::recovered(
            prepared.tx_id,
            xid.clone(),
            Arc::clone(&context.storage),
            Arc::clone(post_office),
            context.clock.now_millis(),
        );
        for message in prepared.messages {
            let message = ServerMessage::new(message);
            messages.insert(message.id(), message);
        }
        for (queue_id, message_id, scheduled_delivery) in prepared.references {
            let (Some(queue), Some(message)) = (post_office.queue_by_id(queue_id), messages.get(&message_id)) else {
                warn!("prepared transaction {} references unknown queue {queue_id} or message {message_id}", prepared.tx_id);
                continue;
            };
            message.increment_refs(queue.is_durable());
            let mut reference = MessageReference::new(Arc::clone(message), queue.id(), queue.is_durable());
            reference.scheduled_delivery = scheduled_delivery;
            tx.add_recovered_reference(queue, reference);
        }
        for (queue_id, message_id) in prepared.acknowledgements {
            let Some(queue) = post_office.queue_by_id(queue_id) else {
                warn!("prepared transaction {} acknowledges on unknown queue {queue_id}", prepared.tx_id);
                continue;
            };
            let Some(reference) = queue.take_reference(message_id) else {
                warn!("prepared transaction {} acknowledges missing message {message_id}", prepared.tx_id);
                continue;
            };
            if reference.is_durable() {
                reference.message().decrement_durable_refs();
            }
            queue.hold_delivering(reference.clone());
            tx.add_recovered_acknowledgement(queue, reference);
        }
        for record in &prepared.page_transactions {
            let info = Arc::new(PageTransactionInfo::recovered(record, false));
            context.paging.add_page_transaction(Arc::clone(&info));
            tx.set_page_transaction(info);
        }
        for record in prepared.duplicate_ids {
            tx.add_duplicate(record.address, Bytes::from(record.duplicate_id), record.id);
        }

        match xid {
            Some(xid) => {
                info!("transaction {} ({xid:?}) recovered in doubt", prepared.tx_id);
                context.resource_manager.put(xid, tx)
            }
            None => {
                warn!("rolling back prepared local transaction {}", prepared.tx_id);
                tx.rollback()
            }
        }
    }

    fn start_ticker(&self) -> Result<()> {
        let context = Arc::downgrade(&self.context);
        let stopped = Arc::clone(&self.stopped);
        let period = Duration::from_millis(self.context.config.scheduler_tick_ms.max(1));
        let handle = thread::Builder::new()
            .name("courier-ticker".into())
            .spawn(move || ticker_loop(context, stopped, period))?;
        *self.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Runs one round of the ticker's work: scheduled references whose time
    /// has come are promoted and delivered, expired transactions are rolled
    /// back.
    pub fn tick(&self) {
        tick(&self.context);
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.context.post_office
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.context.storage
    }

    pub fn paging(&self) -> &Arc<PagingManager> {
        &self.context.paging
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.context.resource_manager
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.context.config
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.context.config.call_timeout_ms)
    }

    /// Interceptors apply to connections accepted afterwards.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(interceptor);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Serves a client on `connection`.
    pub fn accept(&self, connection: Arc<dyn Connection>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ObjectClosed("broker"));
        }
        let id = connection.id();
        let channel = Channel::new(connection, self.call_timeout());
        let connections: Weak<Mutex<HashMap<u64, Arc<Channel>>>> = Arc::downgrade(&self.connections);
        let handler = ServerConnection::new(Arc::clone(&self.context), &channel, move |id| {
            if let Some(connections) = connections.upgrade() {
                connections.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }
        });
        let interceptors = self
            .interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        channel.set_handler(intercept(handler, &interceptors));
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&channel));
        channel.start()?;
        debug!("accepted connection {id} from {}", channel.connection().remote_address());
        Ok(())
    }

    /// The client end of a new in-process connection to this broker.
    pub fn connect_in_vm(&self) -> Result<Arc<InVmConnection>> {
        let (client, server) = InVmConnection::pair();
        self.accept(server)?;
        Ok(client)
    }

    /// Starts accepting TCP connections. Returns the bound address.
    pub fn listen_tcp(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let broker = Arc::downgrade(self);
        let max_frame_size = self.context.config.max_frame_size;
        let acceptor = TcpAcceptor::bind(addr, move |connection: Arc<TcpConnection>| {
            let Some(broker) = broker.upgrade() else {
                connection.close();
                return;
            };
            connection.set_max_frame_size(max_frame_size);
            if let Err(err) = broker.accept(connection) {
                warn!("failed to accept connection: {err}");
            }
        })?;
        let local = acceptor.local_addr();
        info!("listening on {local}");
        *self.acceptor.lock().unwrap_or_else(|e| e.into_inner()) = Some(acceptor);
        Ok(local)
    }

    /// Closes every connection, stops the ticker, paging and storage.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut acceptor) = self.acceptor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            acceptor.stop();
        }
        let channels: Vec<Arc<Channel>> = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for channel in channels {
            channel.close();
        }
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        self.context.paging.stop();
        self.context.storage.stop();
        info!("broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(context: &ServerContext) {
    let now = context.clock.now_millis();
    for queue in context.post_office.queues() {
        if queue.promote_scheduled(now) > 0 {
            queue.deliver();
        }
    }
    let reaped = context.resource_manager.reap_timed_out(now);
    if reaped > 0 {
        debug!("reaped {reaped} timed out transactions");
    }
}

/// Ticks every `period` until `stopped` is set. `stop()` unparks the thread
/// so it never waits out a whole period.
fn ticker_loop(context: Weak<ServerContext>, stopped: Arc<AtomicBool>, period: Duration) {
    let mut next = Instant::now() + period;
    while !stopped.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next {
            thread::park_timeout(next - now);
            continue;
        }
        next = now + period;
        let Some(context) = context.upgrade() else {
            return;
        };
        tick(&context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::{Message, HDR_SCHEDULED_DELIVERY_TIME};
    use crate::queue::tests::TestConsumer;
    use std::path::Path;

    fn config(dir: &Path) -> BrokerConfig {
        let mut config = BrokerConfig::with_data_dir(dir);
        config.journal.file_size = 64 * 1024;
        config.scheduler_tick_ms = 3_600_000;
        config
    }

    fn start(dir: &Path, clock: Arc<ManualClock>) -> Arc<Broker> {
        Broker::start_with_clock(config(dir), Arc::new(AllowAllSecurityManager), clock).unwrap()
    }

    #[test]
    fn stop_does_not_wait_for_the_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let broker = start(dir.path(), Arc::new(ManualClock::new(1_000)));
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        broker.stop();
        assert!(started.elapsed() < Duration::from_secs(5), "stop took {:?}", started.elapsed());
        assert!(broker.ticker.lock().unwrap().is_none());
    }

    #[test]
    fn durable_messages_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        {
            let broker = start(dir.path(), Arc::clone(&clock));
            let post_office = broker.post_office();
            let queue = post_office.add_binding("orders", "q1", None, true, false).unwrap();
            for i in 0..3 {
                let message = Message::new("orders", format!("m{i}")).with_durable(true);
                post_office.route(message, None).unwrap();
            }
            post_office
                .route(Message::new("orders", "transient"), None)
                .unwrap();
            let consumer = TestConsumer::new(1);
            queue.add_consumer(consumer.clone());
            queue.deliver();
            let first = consumer.received()[0];
            queue.acknowledge(first).unwrap();
            broker.stop();
        }

        let broker = start(dir.path(), clock);
        let queue = broker.post_office().queue("q1").unwrap();
        assert!(queue.is_durable());
        let ids: Vec<u64> = queue.list(None).iter().map(|r| r.message_id()).collect();
        assert_eq!(ids.len(), 2);
        assert!(queue
            .list(None)
            .iter()
            .all(|r| r.message().durable() && r.message().durable_ref_count() == 1));
    }

    #[test]
    fn prepared_transaction_is_in_doubt_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let xid = Xid::new(7, b"global".to_vec(), b"branch".to_vec());
        {
            let broker = start(dir.path(), Arc::clone(&clock));
            let post_office = broker.post_office();
            post_office.add_binding("orders", "q1", None, true, false).unwrap();
            let tx = Transaction::new(
                Arc::clone(broker.storage()),
                Arc::clone(post_office),
                Some(xid.clone()),
                0,
                clock.now_millis(),
            )
            .unwrap();
            post_office
                .route(Message::new("orders", "in doubt").with_durable(true), Some(&tx))
                .unwrap();
            tx.prepare().unwrap();
            broker.stop();
        }

        let broker = start(dir.path(), clock);
        let queue = broker.post_office().queue("q1").unwrap();
        assert_eq!(queue.message_count(), 0);
        assert_eq!(broker.resource_manager().in_doubt_xids(), vec![xid.clone()]);

        broker.resource_manager().commit_prepared(&xid).unwrap();
        assert_eq!(queue.message_count(), 1);
        assert!(broker.resource_manager().is_empty());
    }

    #[test]
    fn prepared_acknowledgement_holds_the_reference() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());
        {
            let broker = start(dir.path(), Arc::clone(&clock));
            let post_office = broker.post_office();
            let queue = post_office.add_binding("orders", "q1", None, true, false).unwrap();
            post_office
                .route(Message::new("orders", "acked").with_durable(true), None)
                .unwrap();
            let consumer = TestConsumer::new(1);
            queue.add_consumer(consumer.clone());
            queue.deliver();
            let message_id = consumer.received()[0];
            let tx = Transaction::new(
                Arc::clone(broker.storage()),
                Arc::clone(post_office),
                Some(xid.clone()),
                0,
                clock.now_millis(),
            )
            .unwrap();
            let reference = queue.delivering_reference(message_id).unwrap();
            tx.acknowledge(Arc::clone(&queue), reference).unwrap();
            tx.prepare().unwrap();
            broker.stop();
        }

        let broker = start(dir.path(), clock);
        let queue = broker.post_office().queue("q1").unwrap();
        assert_eq!(queue.delivering_count(), 1);
        assert!(queue.list(None).is_empty());

        broker.resource_manager().rollback_prepared(&xid).unwrap();
        assert_eq!(queue.delivering_count(), 0);
        let pending = queue.list(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_count, 1);
    }

    #[test]
    fn tick_promotes_scheduled_references() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let broker = start(dir.path(), Arc::clone(&clock));
        let post_office = broker.post_office();
        let queue = post_office.add_binding("later", "q1", None, false, false).unwrap();
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());

        let message = Message::new("later", "x").with_header(HDR_SCHEDULED_DELIVERY_TIME, 1_500i64);
        post_office.route(message, None).unwrap();
        assert_eq!(queue.scheduled_count(), 1);

        broker.tick();
        assert!(consumer.received().is_empty());

        clock.set(1_500);
        broker.tick();
        assert_eq!(queue.scheduled_count(), 0);
        assert_eq!(consumer.received().len(), 1);
    }

    #[test]
    fn tick_reaps_timed_out_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let broker = start(dir.path(), Arc::clone(&clock));
        let xid = Xid::new(1, b"slow".to_vec(), b"b".to_vec());
        let tx = Transaction::new(
            Arc::clone(broker.storage()),
            Arc::clone(broker.post_office()),
            Some(xid.clone()),
            500,
            clock.now_millis(),
        )
        .unwrap();
        broker.resource_manager().put(xid.clone(), tx).unwrap();

        clock.advance(499);
        broker.tick();
        assert!(broker.resource_manager().get(&xid).is_some());
        clock.advance(1);
        broker.tick();
        assert!(broker.resource_manager().get(&xid).is_none());
    }
}
