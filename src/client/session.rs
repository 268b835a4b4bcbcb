use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};

use crate::client::connection::{unexpected, ConsumerBuffer, Dispatcher};
use crate::client::{ClientBrowser, ClientConsumer, ClientProducer, ClientSession, SessionOptions};
use crate::error::XaCode;
use crate::message::Message;
use crate::remoting::{Channel, Packet, PacketBody, QueueQueryResult};
use crate::transaction::Xid;
use crate::{Error, Result};

/// State shared by a session and its producers, consumers and received
/// messages.
struct SessionInner {
    id: u64,
    channel: Arc<Channel>,
    dispatcher: Arc<Dispatcher>,
    options: SessionOptions,
    /// Window size of each open consumer.
    consumers: Mutex<HashMap<u64, i32>>,
    closed: AtomicBool,
}

pub struct CoreSession {
    inner: Arc<SessionInner>,
}

impl CoreSession {
    pub(crate) fn new(
        id: u64,
        channel: Arc<Channel>,
        dispatcher: Arc<Dispatcher>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SessionInner {
                id,
                channel,
                dispatcher,
                options,
                consumers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.mark_closed();
    }
}

impl SessionInner {
    fn consumers(&self) -> MutexGuard<'_, HashMap<u64, i32>> {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.channel.is_closed() {
            return Err(Error::ObjectClosed("session"));
        }
        Ok(())
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (consumer_id, _) in self.consumers().drain() {
            self.dispatcher.remove(consumer_id);
        }
    }

    fn blocking(&self, body: PacketBody) -> Result<Packet> {
        self.check_open()?;
        self.channel.send_blocking(Packet::to_target(self.id, body))
    }

    fn expect_null(&self, body: PacketBody) -> Result<()> {
        let response = self.blocking(body)?;
        match response.body {
            PacketBody::NullResponse => Ok(()),
            _ => Err(unexpected(&response)),
        }
    }

    fn xa_call(&self, body: PacketBody) -> Result<()> {
        let response = self.blocking(body)?;
        match response.body {
            PacketBody::XaResp { error: false, .. } => Ok(()),
            PacketBody::XaResp { code, message, .. } => {
                Err(Error::xa(XaCode::from_i32(code), message.unwrap_or_default()))
            }
            _ => Err(unexpected(&response)),
        }
    }

    fn send_message(&self, message: Message) -> Result<()> {
        self.check_open()?;
        let packet = Packet::to_target(self.id, PacketBody::Send { message });
        let blocking = self.options.block_on_non_durable_send
            || matches!(&packet.body, PacketBody::Send { message } if message.durable);
        if blocking {
            self.channel.send_blocking(packet).map(|_| ())
        } else {
            self.channel.send(packet).map(|_| ())
        }
    }

    fn forget_consumer(&self, consumer_id: u64) {
        self.consumers().remove(&consumer_id);
        self.dispatcher.remove(consumer_id);
    }

    /// Hands `consumed` credits back once half a window is owed, or all of
    /// them at once when `flush` is set.
    fn return_credits(
        &self,
        consumer_id: u64,
        window_size: i32,
        buffer: &ConsumerBuffer,
        consumed: u32,
        flush: bool,
    ) {
        let Ok(window) = u32::try_from(window_size) else {
            return;
        };
        let threshold = if flush { 0 } else { (window / 2).max(1) };
        let Some(credits) = buffer.owe_credits(consumed, threshold) else {
            return;
        };
        let packet = Packet::to_target(self.id, PacketBody::ConsumerCredits { consumer_id, credits });
        if let Err(err) = self.channel.send(packet) {
            warn!("failed to return {credits} credits for consumer {consumer_id}: {err}");
        }
    }

    fn create_consumer(&self, queue_name: &str, filter: Option<&str>, window_size: i32) -> Result<u64> {
        let response = self.blocking(PacketBody::CreateConsumer {
            queue_name: queue_name.to_string(),
            filter: filter.map(str::to_string),
            window_size,
        })?;
        let PacketBody::CreateConsumerResp { consumer_id } = response.body else {
            return Err(unexpected(&response));
        };
        self.consumers().insert(consumer_id, window_size);
        Ok(consumer_id)
    }
}

impl ClientSession for CoreSession {
    fn create_queue(
        &self,
        address: &str,
        queue_name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<()> {
        self.inner.expect_null(PacketBody::CreateQueue {
            address: address.to_string(),
            queue_name: queue_name.to_string(),
            filter: filter.map(str::to_string),
            durable,
            temporary,
        })
    }

    fn delete_queue(&self, queue_name: &str) -> Result<()> {
        self.inner.expect_null(PacketBody::DeleteQueue {
            queue_name: queue_name.to_string(),
        })
    }

    fn queue_query(&self, queue_name: &str) -> Result<QueueQueryResult> {
        let response = self.inner.blocking(PacketBody::QueueQuery {
            queue_name: queue_name.to_string(),
        })?;
        match response.body {
            PacketBody::QueueQueryResp(result) => Ok(result),
            _ => Err(unexpected(&response)),
        }
    }

    fn create_producer(&self, address: Option<&str>) -> Result<Box<dyn ClientProducer>> {
        self.inner.check_open()?;
        Ok(Box::new(CoreProducer {
            session: Arc::clone(&self.inner),
            address: address.map(str::to_string),
            closed: AtomicBool::new(false),
        }))
    }

    fn create_consumer(&self, queue_name: &str, filter: Option<&str>) -> Result<Box<dyn ClientConsumer>> {
        self.create_consumer_with_window(queue_name, filter, self.inner.options.consumer_window_size)
    }

    fn create_consumer_with_window(
        &self,
        queue_name: &str,
        filter: Option<&str>,
        window_size: i32,
    ) -> Result<Box<dyn ClientConsumer>> {
        let consumer_id = self.inner.create_consumer(queue_name, filter, window_size)?;
        Ok(Box::new(CoreConsumer {
            id: consumer_id,
            window_size,
            session: Arc::clone(&self.inner),
            buffer: self.inner.dispatcher.buffer(consumer_id),
            closed: AtomicBool::new(false),
        }))
    }

    fn create_browser(&self, queue_name: &str, filter: Option<&str>) -> Result<Box<dyn ClientBrowser>> {
        let response = self.inner.blocking(PacketBody::CreateBrowser {
            queue_name: queue_name.to_string(),
            filter: filter.map(str::to_string),
        })?;
        let PacketBody::CreateBrowserResp { browser_id } = response.body else {
            return Err(unexpected(&response));
        };
        Ok(Box::new(CoreBrowser {
            id: browser_id,
            session: Arc::clone(&self.inner),
            peeked: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn commit(&self) -> Result<()> {
        self.inner.expect_null(PacketBody::Commit)
    }

    fn rollback(&self) -> Result<()> {
        self.inner.expect_null(PacketBody::Rollback)?;
        // Everything buffered before the answer was cancelled on the broker
        // and will be delivered again once the session restarts.
        let consumers = self.inner.consumers().clone();
        let mut dropped = 0;
        for (consumer_id, window_size) in consumers {
            let buffer = self.inner.dispatcher.buffer(consumer_id);
            let cleared = buffer.clear();
            // Cleared deliveries were never received, so their credits are
            // still out.
            let cleared_credits = u32::try_from(cleared).unwrap_or(u32::MAX);
            self.inner
                .return_credits(consumer_id, window_size, &buffer, cleared_credits, true);
            dropped += cleared;
        }
        debug!("session {} rolled back, {dropped} buffered deliveries dropped", self.inner.id);
        self.inner
            .channel
            .send(Packet::to_target(self.inner.id, PacketBody::ConnStart))
            .map(|_| ())
    }

    fn xa_start(&self, xid: &Xid) -> Result<()> {
        self.inner.xa_call(PacketBody::XaStart { xid: xid.clone() })
    }

    fn xa_end(&self, xid: &Xid, failed: bool) -> Result<()> {
        self.inner.xa_call(PacketBody::XaEnd {
            xid: xid.clone(),
            failed,
        })
    }

    fn xa_prepare(&self, xid: &Xid) -> Result<()> {
        self.inner.xa_call(PacketBody::XaPrepare { xid: xid.clone() })
    }

    fn xa_commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.inner.xa_call(PacketBody::XaCommit {
            xid: xid.clone(),
            one_phase,
        })
    }

    fn xa_rollback(&self, xid: &Xid) -> Result<()> {
        self.inner.xa_call(PacketBody::XaRollback { xid: xid.clone() })
    }

    fn xa_join(&self, xid: &Xid) -> Result<()> {
        self.inner.xa_call(PacketBody::XaJoin { xid: xid.clone() })
    }

    fn xa_suspend(&self) -> Result<()> {
        self.inner.xa_call(PacketBody::XaSuspend)
    }

    fn xa_resume(&self, xid: &Xid) -> Result<()> {
        self.inner.xa_call(PacketBody::XaResume { xid: xid.clone() })
    }

    fn xa_forget(&self, xid: &Xid) -> Result<()> {
        self.inner.xa_call(PacketBody::XaForget { xid: xid.clone() })
    }

    fn xa_recover(&self) -> Result<Vec<Xid>> {
        let response = self.inner.blocking(PacketBody::XaInDoubtXids)?;
        match response.body {
            PacketBody::XaInDoubtXidsResp { xids } => Ok(xids),
            _ => Err(unexpected(&response)),
        }
    }

    fn xa_set_timeout(&self, seconds: u32) -> Result<bool> {
        let response = self.inner.blocking(PacketBody::XaSetTimeout { seconds })?;
        match response.body {
            PacketBody::XaSetTimeoutResp { ok } => Ok(ok),
            _ => Err(unexpected(&response)),
        }
    }

    fn xa_get_timeout(&self) -> Result<u32> {
        let response = self.inner.blocking(PacketBody::XaGetTimeout)?;
        match response.body {
            PacketBody::XaGetTimeoutResp { seconds } => Ok(seconds),
            _ => Err(unexpected(&response)),
        }
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = if self.inner.channel.is_closed() {
            Ok(())
        } else {
            self.inner.expect_null(PacketBody::Close)
        };
        self.inner.mark_closed();
        result
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.channel.is_closed()
    }
}

pub struct CoreProducer {
    session: Arc<SessionInner>,
    address: Option<String>,
    closed: AtomicBool,
}

impl ClientProducer for CoreProducer {
    fn send(&self, message: Message) -> Result<()> {
        match &self.address {
            Some(address) => self.send_to(address, message),
            None => {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(Error::ObjectClosed("producer"));
                }
                self.session.send_message(message)
            }
        }
    }

    fn send_to(&self, address: &str, mut message: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ObjectClosed("producer"));
        }
        message.address = address.to_string();
        self.session.send_message(message)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A received message. Acknowledge it through [`ClientMessage::acknowledge`]
/// once processed.
pub struct ClientMessage {
    message: Message,
    delivery_count: u32,
    consumer_id: u64,
    session: Arc<SessionInner>,
}

impl ClientMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn id(&self) -> u64 {
        self.message.id
    }

    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    /// Failed deliveries before this one.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn acknowledge(&self) -> Result<()> {
        self.session.expect_null(PacketBody::Acknowledge {
            consumer_id: self.consumer_id,
            message_id: self.message.id,
        })
    }

    /// Hands the message back for redelivery.
    pub fn cancel(&self) -> Result<()> {
        self.session.expect_null(PacketBody::Cancel {
            consumer_id: self.consumer_id,
            message_id: self.message.id,
        })
    }
}

impl std::fmt::Debug for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMessage")
            .field("message", &self.message)
            .field("delivery_count", &self.delivery_count)
            .field("consumer_id", &self.consumer_id)
            .finish()
    }
}

pub struct CoreConsumer {
    id: u64,
    window_size: i32,
    session: Arc<SessionInner>,
    buffer: Arc<ConsumerBuffer>,
    closed: AtomicBool,
}

impl CoreConsumer {
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl ClientConsumer for CoreConsumer {
    fn id(&self) -> u64 {
        self.id
    }

    fn receive(&self, timeout: Duration) -> Result<Option<ClientMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ObjectClosed("consumer"));
        }
        let Some(delivery) = self.buffer.pop(timeout) else {
            return Ok(None);
        };
        self.session
            .return_credits(self.id, self.window_size, &self.buffer, 1, false);
        Ok(Some(ClientMessage {
            message: delivery.message,
            delivery_count: delivery.delivery_count,
            consumer_id: self.id,
            session: Arc::clone(&self.session),
        }))
    }

    fn receive_immediate(&self) -> Result<Option<ClientMessage>> {
        self.receive(Duration::ZERO)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = if self.session.channel.is_closed() {
            Ok(())
        } else {
            self.session.expect_null(PacketBody::ConsumerClose { consumer_id: self.id })
        };
        self.session.forget_consumer(self.id);
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for CoreConsumer {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}

pub struct CoreBrowser {
    id: u64,
    session: Arc<SessionInner>,
    /// Fetched by `has_next` and not yet returned.
    peeked: Mutex<Option<Message>>,
    closed: AtomicBool,
}

impl CoreBrowser {
    fn peeked(&self) -> MutexGuard<'_, Option<Message>> {
        self.peeked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fetch(&self) -> Result<Option<Message>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ObjectClosed("browser"));
        }
        let response = self.session.blocking(PacketBody::BrowserNext { browser_id: self.id })?;
        match response.body {
            PacketBody::BrowserNextResp { message } => Ok(message),
            _ => Err(unexpected(&response)),
        }
    }
}

impl ClientBrowser for CoreBrowser {
    fn has_next(&self) -> Result<bool> {
        let mut peeked = self.peeked();
        if peeked.is_none() {
            *peeked = self.fetch()?;
        }
        Ok(peeked.is_some())
    }

    fn next_message(&self) -> Result<Option<Message>> {
        let mut peeked = self.peeked();
        match peeked.take() {
            Some(message) => Ok(Some(message)),
            None => self.fetch(),
        }
    }

    fn reset(&self) -> Result<()> {
        let mut peeked = self.peeked();
        self.session.expect_null(PacketBody::BrowserReset { browser_id: self.id })?;
        *peeked = None;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) || self.session.channel.is_closed() {
            return Ok(());
        }
        self.session.expect_null(PacketBody::BrowserClose { browser_id: self.id })
    }
}

impl Drop for CoreBrowser {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}
