//! Server side of a client session.
//!
//! A non-XA session always works inside a local transaction when sends or
//! acknowledgements are not auto-committed; the transaction is created on
//! first use and replaced after every commit or rollback. An XA session works
//! inside whatever branch is associated through `start`/`join`/`resume`, and
//! auto-commits outside of one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::error::XaCode;
use crate::filter::Filter;
use crate::message::Message;
use crate::queue::Consumer;
use crate::remoting::{Channel, Packet, PacketBody, QueueQueryResult};
use crate::server::browser::ServerBrowser;
use crate::server::consumer::ServerConsumer;
use crate::server::ServerContext;
use crate::transaction::{Transaction, TransactionState, Xid};
use crate::{Error, Result};

#[derive(Default)]
struct SessionState {
    tx: Option<Arc<Transaction>>,
    suspended: Option<Arc<Transaction>>,
    consumers: HashMap<u64, Arc<ServerConsumer>>,
    browsers: HashMap<u64, ServerBrowser>,
    temporary_queues: Vec<String>,
    closed: bool,
}

pub struct ServerSession {
    id: u64,
    context: Arc<ServerContext>,
    channel: Arc<Channel>,
    xa: bool,
    auto_commit_sends: bool,
    auto_commit_acks: bool,
    started: AtomicBool,
    xa_timeout_ms: AtomicU64,
    state: Mutex<SessionState>,
}

impl ServerSession {
    pub(crate) fn new(
        id: u64,
        context: Arc<ServerContext>,
        channel: Arc<Channel>,
        xa: bool,
        auto_commit_sends: bool,
        auto_commit_acks: bool,
        started: bool,
    ) -> Arc<Self> {
        let xa_timeout_ms = context.resource_manager.default_timeout_ms();
        Arc::new(Self {
            id,
            context,
            channel,
            xa,
            auto_commit_sends,
            auto_commit_acks,
            started: AtomicBool::new(started),
            xa_timeout_ms: AtomicU64::new(xa_timeout_ms),
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(state: &SessionState) -> Result<()> {
        if state.closed {
            return Err(Error::ObjectClosed("session"));
        }
        Ok(())
    }

    fn new_local_transaction(&self) -> Result<Arc<Transaction>> {
        Transaction::new(
            Arc::clone(&self.context.storage),
            Arc::clone(&self.context.post_office),
            None,
            0,
            self.context.clock.now_millis(),
        )
    }

    /// The transaction new work joins, if any. `auto_commit` is the
    /// session's flag for the kind of work.
    fn transaction_for(&self, auto_commit: bool) -> Result<Option<Arc<Transaction>>> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        if self.xa {
            return Ok(state.tx.clone());
        }
        if auto_commit {
            return Ok(None);
        }
        if let Some(tx) = &state.tx {
            return Ok(Some(Arc::clone(tx)));
        }
        let tx = self.new_local_transaction()?;
        state.tx = Some(Arc::clone(&tx));
        Ok(Some(tx))
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
        let consumers: Vec<Arc<ServerConsumer>> = self.lock().consumers.values().cloned().collect();
        for consumer in consumers {
            consumer.set_started(started);
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn send(&self, message: Message) -> Result<()> {
        let tx = self.transaction_for(self.auto_commit_sends)?;
        self.context.post_office.route(message, tx.as_ref())?;
        Ok(())
    }

    pub fn create_consumer(
        &self,
        queue_name: &str,
        filter: Option<&str>,
        window_size: i32,
    ) -> Result<Arc<ServerConsumer>> {
        let queue = self
            .context
            .post_office
            .queue(queue_name)
            .ok_or_else(|| Error::QueueDoesNotExist(queue_name.to_string()))?;
        let filter = Filter::parse_optional(filter)?;
        let mut state = self.lock();
        Self::check_open(&state)?;
        let consumer = ServerConsumer::new(
            self.context.next_id(),
            self.id,
            Arc::clone(&queue),
            filter,
            Arc::clone(&self.channel),
            self.started.load(Ordering::SeqCst),
            window_size,
        );
        let handle: Arc<dyn Consumer> = Arc::clone(&consumer) as Arc<dyn Consumer>;
        queue.add_consumer(handle);
        state.consumers.insert(consumer.id(), Arc::clone(&consumer));
        debug!("session {} created consumer {} on {queue_name}", self.id, consumer.id());
        Ok(consumer)
    }

    fn consumer(&self, consumer_id: u64) -> Result<Arc<ServerConsumer>> {
        let state = self.lock();
        Self::check_open(&state)?;
        state
            .consumers
            .get(&consumer_id)
            .cloned()
            .ok_or_else(|| Error::illegal_state(format!("session {} has no consumer {consumer_id}", self.id)))
    }

    pub fn close_consumer(&self, consumer_id: u64) -> Result<()> {
        let consumer = self
            .lock()
            .consumers
            .remove(&consumer_id)
            .ok_or_else(|| Error::illegal_state(format!("session {} has no consumer {consumer_id}", self.id)))?;
        consumer.close()
    }

    pub fn add_credits(&self, consumer_id: u64, credits: u32) -> Result<()> {
        self.consumer(consumer_id)?.add_credits(credits);
        Ok(())
    }

    pub fn create_browser(&self, queue_name: &str, filter: Option<&str>) -> Result<u64> {
        let queue = self
            .context
            .post_office
            .queue(queue_name)
            .ok_or_else(|| Error::QueueDoesNotExist(queue_name.to_string()))?;
        let filter = Filter::parse_optional(filter)?;
        let mut state = self.lock();
        Self::check_open(&state)?;
        let browser = ServerBrowser::new(self.context.next_id(), queue, filter);
        let browser_id = browser.id();
        state.browsers.insert(browser_id, browser);
        debug!("session {} created browser {browser_id} on {queue_name}", self.id);
        Ok(browser_id)
    }

    fn with_browser<T>(&self, browser_id: u64, f: impl FnOnce(&mut ServerBrowser) -> T) -> Result<T> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        let browser = state
            .browsers
            .get_mut(&browser_id)
            .ok_or_else(|| Error::illegal_state(format!("session {} has no browser {browser_id}", self.id)))?;
        Ok(f(browser))
    }

    pub fn browser_next(&self, browser_id: u64) -> Result<Option<Message>> {
        self.with_browser(browser_id, |browser| browser.next_message())
    }

    pub fn browser_reset(&self, browser_id: u64) -> Result<()> {
        self.with_browser(browser_id, |browser| browser.reset())
    }

    pub fn close_browser(&self, browser_id: u64) -> Result<()> {
        self.lock()
            .browsers
            .remove(&browser_id)
            .map(|_| ())
            .ok_or_else(|| Error::illegal_state(format!("session {} has no browser {browser_id}", self.id)))
    }

    pub fn acknowledge(&self, consumer_id: u64, message_id: u64) -> Result<()> {
        let consumer = self.consumer(consumer_id)?;
        let reference = consumer.take_in_flight(message_id).ok_or_else(|| {
            Error::illegal_state(format!("message {message_id} is not in flight to consumer {consumer_id}"))
        })?;
        match self.transaction_for(self.auto_commit_acks)? {
            Some(tx) => tx.acknowledge(Arc::clone(consumer.queue()), reference),
            None => consumer.queue().acknowledge(message_id),
        }
    }

    /// Gives a delivered message back to its queue.
    pub fn cancel(&self, consumer_id: u64, message_id: u64) -> Result<()> {
        let consumer = self.consumer(consumer_id)?;
        if let Some(reference) = consumer.take_in_flight(message_id) {
            consumer.queue().cancel(reference)?;
            consumer.queue().deliver();
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        if self.xa {
            return Err(Error::illegal_state("commit on an XA session, use XA commit"));
        }
        let tx = self.lock().tx.take();
        match tx {
            Some(tx) => tx.commit(),
            None => Ok(()),
        }
    }

    /// Rolls back the local transaction and returns every message still in
    /// flight to its queue. Consumers stay stopped until the client restarts
    /// the session, so deliveries already on the wire can be told apart from
    /// redeliveries.
    pub fn rollback(&self) -> Result<()> {
        if self.xa {
            return Err(Error::illegal_state("rollback on an XA session, use XA rollback"));
        }
        let (tx, consumers) = {
            let mut state = self.lock();
            Self::check_open(&state)?;
            (state.tx.take(), state.consumers.values().cloned().collect::<Vec<_>>())
        };
        for consumer in &consumers {
            consumer.set_started(false);
            consumer.cancel_in_flight()?;
        }
        match tx {
            Some(tx) => tx.rollback(),
            None => Ok(()),
        }
    }

    /// Restarts consumers stopped by a rollback, if the session is started.
    pub fn resume(&self) {
        self.set_started(self.started.load(Ordering::SeqCst));
    }

    pub fn queue_query(&self, queue_name: &str) -> QueueQueryResult {
        let Some(queue) = self.context.post_office.queue(queue_name) else {
            return QueueQueryResult::default();
        };
        QueueQueryResult {
            exists: true,
            durable: queue.is_durable(),
            temporary: queue.is_temporary(),
            filter: queue.filter().map(|f| f.as_str().to_string()),
            address: Some(queue.address().to_string()),
            message_count: queue.message_count() as u64,
            consumer_count: queue.consumer_count() as u32,
        }
    }

    pub fn create_queue(
        &self,
        address: &str,
        queue_name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<()> {
        if durable && temporary {
            return Err(Error::illegal_state("a temporary queue cannot be durable"));
        }
        self.context
            .post_office
            .add_binding(address, queue_name, filter, durable, temporary)?;
        if temporary {
            self.lock().temporary_queues.push(queue_name.to_string());
        }
        Ok(())
    }

    pub fn delete_queue(&self, queue_name: &str) -> Result<()> {
        let queue = self
            .context
            .post_office
            .queue(queue_name)
            .ok_or_else(|| Error::QueueDoesNotExist(queue_name.to_string()))?;
        if queue.consumer_count() > 0 {
            return Err(Error::illegal_state(format!("queue {queue_name} has consumers")));
        }
        self.context.post_office.remove_binding(queue_name)?;
        self.lock().temporary_queues.retain(|name| name != queue_name);
        Ok(())
    }

    fn associated(&self, xid: &Xid) -> bool {
        self.lock().tx.as_ref().is_some_and(|tx| tx.xid() == Some(xid))
    }

    fn branch(&self, xid: &Xid) -> Result<Arc<Transaction>> {
        self.context
            .resource_manager
            .get(xid)
            .ok_or_else(|| Error::xa(XaCode::NoTransaction, format!("unknown {xid:?}")))
    }

    pub fn xa_start(&self, xid: Xid) -> Result<()> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        if state.tx.is_some() {
            return Err(Error::xa(XaCode::Protocol, "session already has a transaction"));
        }
        let tx = Transaction::new(
            Arc::clone(&self.context.storage),
            Arc::clone(&self.context.post_office),
            Some(xid.clone()),
            self.xa_timeout_ms.load(Ordering::Relaxed),
            self.context.clock.now_millis(),
        )?;
        self.context.resource_manager.put(xid, Arc::clone(&tx))?;
        state.tx = Some(tx);
        Ok(())
    }

    /// Dissociates the branch. A failed end dooms it to roll back.
    pub fn xa_end(&self, xid: &Xid, failed: bool) -> Result<()> {
        let mut state = self.lock();
        if state.tx.as_ref().is_some_and(|tx| tx.xid() == Some(xid)) {
            if let Some(tx) = state.tx.take() {
                if failed {
                    tx.mark_rollback_only();
                }
            }
            return Ok(());
        }
        if state.suspended.as_ref().is_some_and(|tx| tx.xid() == Some(xid)) {
            return Err(Error::xa(XaCode::Protocol, format!("{xid:?} is suspended")));
        }
        drop(state);
        self.branch(xid).map(|_| ())
    }

    pub fn xa_prepare(&self, xid: &Xid) -> Result<()> {
        if self.associated(xid) {
            return Err(Error::xa(XaCode::Protocol, format!("{xid:?} is still associated")));
        }
        let tx = self.branch(xid)?;
        if tx.state() != TransactionState::Active {
            return Err(Error::xa(XaCode::Protocol, format!("{xid:?} is {:?}", tx.state())));
        }
        if let Err(err) = tx.prepare() {
            if tx.is_rollback_only() {
                let _ = tx.rollback();
                self.context.resource_manager.remove(xid);
                return Err(Error::xa(XaCode::RollbackOther, err.to_string()));
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn xa_commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        if self.associated(xid) {
            return Err(Error::xa(XaCode::Protocol, format!("{xid:?} is still associated")));
        }
        let tx = self.branch(xid)?;
        match (one_phase, tx.state()) {
            (true, TransactionState::Active) | (false, TransactionState::Prepared) => {}
            (_, state) => {
                return Err(Error::xa(
                    XaCode::Protocol,
                    format!("{xid:?} is {state:?}, cannot commit with one_phase={one_phase}"),
                ))
            }
        }
        let result = tx.commit();
        self.context.resource_manager.remove(xid);
        result.map_err(|err| match err {
            Error::TransactionRolledBack(message) => Error::xa(XaCode::RollbackOther, message),
            err => err,
        })
    }

    pub fn xa_rollback(&self, xid: &Xid) -> Result<()> {
        if self.associated(xid) {
            return Err(Error::xa(XaCode::Protocol, format!("{xid:?} is still associated")));
        }
        let tx = self.branch(xid)?;
        tx.rollback()?;
        self.context.resource_manager.remove(xid);
        Ok(())
    }

    pub fn xa_join(&self, xid: &Xid) -> Result<()> {
        let tx = self.branch(xid)?;
        if tx.state() != TransactionState::Active {
            return Err(Error::xa(XaCode::Protocol, format!("cannot join {xid:?}, it is {:?}", tx.state())));
        }
        let mut state = self.lock();
        Self::check_open(&state)?;
        if state.tx.is_some() {
            return Err(Error::xa(XaCode::Protocol, "session already has a transaction"));
        }
        state.tx = Some(tx);
        Ok(())
    }

    pub fn xa_suspend(&self) -> Result<()> {
        let mut state = self.lock();
        let tx = state
            .tx
            .take()
            .ok_or_else(|| Error::xa(XaCode::Protocol, "no transaction to suspend"))?;
        state.suspended = Some(tx);
        Ok(())
    }

    pub fn xa_resume(&self, xid: &Xid) -> Result<()> {
        let mut state = self.lock();
        if state.tx.is_some() {
            return Err(Error::xa(XaCode::Protocol, "session already has a transaction"));
        }
        match state.suspended.take() {
            Some(tx) if tx.xid() == Some(xid) => {
                state.tx = Some(tx);
                Ok(())
            }
            other => {
                state.suspended = other;
                Err(Error::xa(XaCode::Protocol, format!("{xid:?} is not suspended")))
            }
        }
    }

    pub fn xa_forget(&self, xid: &Xid) -> Result<()> {
        self.context
            .resource_manager
            .remove(xid)
            .map(|_| ())
            .ok_or_else(|| Error::xa(XaCode::NoTransaction, format!("unknown {xid:?}")))
    }

    pub fn xa_set_timeout(&self, seconds: u32) {
        let timeout_ms = u64::from(seconds) * 1000;
        self.xa_timeout_ms.store(timeout_ms, Ordering::Relaxed);
        if let Some(tx) = &self.lock().tx {
            tx.set_timeout_ms(timeout_ms);
        }
    }

    pub fn xa_timeout_seconds(&self) -> u32 {
        (self.xa_timeout_ms.load(Ordering::Relaxed) / 1000) as u32
    }

    /// Rolls back the open transaction, closes every consumer and deletes
    /// the session's temporary queues.
    pub fn close(&self) -> Result<()> {
        let (tx, consumers, temporary) = {
            let mut state = self.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.suspended = None;
            state.browsers.clear();
            (
                state.tx.take(),
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.temporary_queues),
            )
        };
        for consumer in consumers.into_values() {
            consumer.close()?;
        }
        if let Some(tx) = tx {
            if tx.state() == TransactionState::Active {
                tx.rollback()?;
                if let Some(xid) = tx.xid() {
                    self.context.resource_manager.remove(xid);
                }
            }
        }
        for name in temporary {
            if let Err(err) = self.context.post_office.remove_binding(&name) {
                warn!("failed to delete temporary queue {name}: {err}");
            }
        }
        debug!("session {} closed", self.id);
        Ok(())
    }

    fn xa_response(result: Result<()>) -> PacketBody {
        match result {
            Ok(()) => PacketBody::XaResp {
                error: false,
                code: 0,
                message: None,
            },
            Err(Error::Xa { code, message }) => PacketBody::XaResp {
                error: true,
                code: code as i32,
                message: Some(message),
            },
            Err(err) => PacketBody::XaResp {
                error: true,
                code: XaCode::ResourceError as i32,
                message: Some(err.to_string()),
            },
        }
    }

    /// Executes one session packet and answers it on `channel`.
    pub(crate) fn handle(&self, packet: Packet, channel: &Channel) {
        let result: Result<PacketBody> = match &packet.body {
            PacketBody::Send { message } => self.send(message.clone()).map(|_| PacketBody::NullResponse),
            PacketBody::CreateConsumer {
                queue_name,
                filter,
                window_size,
            } => {
                match self.create_consumer(queue_name, filter.as_deref(), *window_size) {
                    Ok(consumer) => {
                        let consumer_id = consumer.id();
                        if let Err(err) = channel.respond(&packet, PacketBody::CreateConsumerResp { consumer_id }) {
                            warn!("failed to answer consumer creation: {err}");
                        }
                        // deliveries only after the client knows the id
                        consumer.queue().deliver();
                        return;
                    }
                    Err(err) => Err(err),
                }
            }
            PacketBody::ConsumerClose { consumer_id } => {
                self.close_consumer(*consumer_id).map(|_| PacketBody::NullResponse)
            }
            PacketBody::ConsumerCredits { consumer_id, credits } => {
                self.add_credits(*consumer_id, *credits).map(|_| PacketBody::NullResponse)
            }
            PacketBody::CreateBrowser { queue_name, filter } => self
                .create_browser(queue_name, filter.as_deref())
                .map(|browser_id| PacketBody::CreateBrowserResp { browser_id }),
            PacketBody::BrowserNext { browser_id } => self
                .browser_next(*browser_id)
                .map(|message| PacketBody::BrowserNextResp { message }),
            PacketBody::BrowserReset { browser_id } => {
                self.browser_reset(*browser_id).map(|_| PacketBody::NullResponse)
            }
            PacketBody::BrowserClose { browser_id } => {
                self.close_browser(*browser_id).map(|_| PacketBody::NullResponse)
            }
            PacketBody::Acknowledge {
                consumer_id,
                message_id,
            } => self
                .acknowledge(*consumer_id, *message_id)
                .map(|_| PacketBody::NullResponse),
            PacketBody::Cancel {
                consumer_id,
                message_id,
            } => self.cancel(*consumer_id, *message_id).map(|_| PacketBody::NullResponse),
            PacketBody::Commit => self.commit().map(|_| PacketBody::NullResponse),
            PacketBody::Rollback => self.rollback().map(|_| PacketBody::NullResponse),
            PacketBody::ConnStart => {
                self.resume();
                Ok(PacketBody::NullResponse)
            }
            PacketBody::QueueQuery { queue_name } => Ok(PacketBody::QueueQueryResp(self.queue_query(queue_name))),
            PacketBody::CreateQueue {
                address,
                queue_name,
                filter,
                durable,
                temporary,
            } => self
                .create_queue(address, queue_name, filter.as_deref(), *durable, *temporary)
                .map(|_| PacketBody::NullResponse),
            PacketBody::DeleteQueue { queue_name } => self.delete_queue(queue_name).map(|_| PacketBody::NullResponse),
            PacketBody::Close => self.close().map(|_| PacketBody::NullResponse),
            PacketBody::XaStart { xid } => Ok(Self::xa_response(self.xa_start(xid.clone()))),
            PacketBody::XaEnd { xid, failed } => Ok(Self::xa_response(self.xa_end(xid, *failed))),
            PacketBody::XaPrepare { xid } => Ok(Self::xa_response(self.xa_prepare(xid))),
            PacketBody::XaCommit { xid, one_phase } => Ok(Self::xa_response(self.xa_commit(xid, *one_phase))),
            PacketBody::XaRollback { xid } => Ok(Self::xa_response(self.xa_rollback(xid))),
            PacketBody::XaJoin { xid } => Ok(Self::xa_response(self.xa_join(xid))),
            PacketBody::XaSuspend => Ok(Self::xa_response(self.xa_suspend())),
            PacketBody::XaResume { xid } => Ok(Self::xa_response(self.xa_resume(xid))),
            PacketBody::XaForget { xid } => Ok(Self::xa_response(self.xa_forget(xid))),
            PacketBody::XaInDoubtXids => Ok(PacketBody::XaInDoubtXidsResp {
                xids: self.context.resource_manager.in_doubt_xids(),
            }),
            PacketBody::XaSetTimeout { seconds } => {
                self.xa_set_timeout(*seconds);
                Ok(PacketBody::XaSetTimeoutResp { ok: true })
            }
            PacketBody::XaGetTimeout => Ok(PacketBody::XaGetTimeoutResp {
                seconds: self.xa_timeout_seconds(),
            }),
            other => Err(Error::UnsupportedPacket(other.packet_type().as_u8())),
        };
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                debug!("session {} failed {:?}: {err}", self.id, packet.packet_type());
                Packet::exception(&err)
            }
        };
        if let Err(err) = channel.respond(&packet, body) {
            warn!("failed to answer {:?} on session {}: {err}", packet.packet_type(), self.id);
        }
    }
}
