use std::collections::{HashMap, VecDeque};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::client::session::CoreSession;
use crate::client::{ClientConnection, ClientSession, SessionOptions};
use crate::message::Message;
use crate::remoting::{Channel, Connection, Packet, PacketBody, PacketHandler, TcpConnection, PROTOCOL_VERSION};
use crate::server::Broker;
use crate::{Error, Result};

/// A delivery waiting to be received.
pub(crate) struct Delivery {
    pub(crate) message: Message,
    pub(crate) delivery_count: u32,
}

/// Deliveries of one consumer, filled by the reader thread.
#[derive(Default)]
pub(crate) struct ConsumerBuffer {
    deliveries: Mutex<VecDeque<Delivery>>,
    ready: Condvar,
    closed: AtomicBool,
    /// Consumed deliveries whose credits have not gone back yet.
    credits_owed: AtomicU32,
}

impl ConsumerBuffer {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, delivery: Delivery) {
        self.lock().push_back(delivery);
        self.ready.notify_one();
    }

    /// Waits up to `timeout` for a delivery. `None` on timeout or once the
    /// buffer is closed.
    pub(crate) fn pop(&self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        let mut deliveries = self.lock();
        loop {
            if let Some(delivery) = deliveries.pop_front() {
                return Some(delivery);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            deliveries = self
                .ready
                .wait_timeout(deliveries, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Drops everything buffered. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut deliveries = self.lock();
        let dropped = deliveries.len();
        deliveries.clear();
        dropped
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear();
        self.ready.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Records `consumed` deliveries. Once at least `threshold` credits are
    /// owed, returns them all for sending.
    pub(crate) fn owe_credits(&self, consumed: u32, threshold: u32) -> Option<u32> {
        let owed = self.credits_owed.fetch_add(consumed, Ordering::SeqCst) + consumed;
        if owed < threshold {
            return None;
        }
        match self.credits_owed.swap(0, Ordering::SeqCst) {
            0 => None,
            owed => Some(owed),
        }
    }
}

/// Routes deliveries to consumer buffers by consumer id.
#[derive(Default)]
pub(crate) struct Dispatcher {
    buffers: Mutex<HashMap<u64, Arc<ConsumerBuffer>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    fn buffers(&self) -> MutexGuard<'_, HashMap<u64, Arc<ConsumerBuffer>>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The buffer of `consumer_id`. Deliveries can arrive before the
    /// consumer's creation returns, so the buffer is created by whichever
    /// side gets there first.
    pub(crate) fn buffer(&self, consumer_id: u64) -> Arc<ConsumerBuffer> {
        Arc::clone(self.buffers().entry(consumer_id).or_default())
    }

    pub(crate) fn remove(&self, consumer_id: u64) {
        if let Some(buffer) = self.buffers().remove(&consumer_id) {
            buffer.close();
        }
    }
}

impl PacketHandler for Dispatcher {
    fn handle(&self, packet: Packet, _channel: &Channel) {
        match packet.body {
            PacketBody::Deliver {
                consumer_id,
                delivery_count,
                message,
            } => {
                trace!("delivery of {} to consumer {consumer_id}", message.id);
                self.buffer(consumer_id).push(Delivery {
                    message,
                    delivery_count,
                });
            }
            other => debug!("client ignoring {:?}", other.packet_type()),
        }
    }

    fn connection_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for buffer in self.buffers().values() {
            buffer.close();
        }
    }
}

pub struct CoreConnection {
    channel: Arc<Channel>,
    dispatcher: Arc<Dispatcher>,
    connection_id: u64,
    closed: AtomicBool,
    sessions: Mutex<Vec<Arc<CoreSession>>>,
}

impl CoreConnection {
    /// Performs the connection handshake over `connection`.
    pub fn connect(
        connection: Arc<dyn Connection>,
        user: Option<&str>,
        password: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let channel = Channel::new(connection, call_timeout);
        let dispatcher = Arc::new(Dispatcher::default());
        channel.set_handler(Arc::clone(&dispatcher) as Arc<dyn PacketHandler>);
        channel.start()?;
        let response = channel.send_blocking(Packet::new(PacketBody::CreateConnection {
            version: PROTOCOL_VERSION,
            username: user.map(str::to_string),
            password: password.map(str::to_string),
        }));
        let connection_id = match response {
            Ok(Packet {
                body: PacketBody::CreateConnectionResp { connection_id },
                ..
            }) => connection_id,
            Ok(other) => {
                channel.close();
                return Err(unexpected(&other));
            }
            Err(err) => {
                channel.close();
                return Err(err);
            }
        };
        debug!("connected as connection {connection_id}");
        Ok(Arc::new(Self {
            channel,
            dispatcher,
            connection_id,
            closed: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        }))
    }

    /// The broker-side id of this connection.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.channel.is_closed() {
            return Err(Error::ObjectClosed("connection"));
        }
        Ok(())
    }

    fn blocking(&self, body: PacketBody) -> Result<Packet> {
        self.check_open()?;
        self.channel.send_blocking(Packet::new(body))
    }
}

impl ClientConnection for CoreConnection {
    fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn ClientSession>> {
        let response = self.blocking(PacketBody::CreateSession {
            xa: options.xa,
            auto_commit_sends: options.auto_commit_sends,
            auto_commit_acks: options.auto_commit_acks,
        })?;
        let PacketBody::CreateSessionResp { session_id } = response.body else {
            return Err(unexpected(&response));
        };
        let session = CoreSession::new(
            session_id,
            Arc::clone(&self.channel),
            Arc::clone(&self.dispatcher),
            options,
        );
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&session));
        Ok(session)
    }

    fn start(&self) -> Result<()> {
        self.blocking(PacketBody::ConnStart).map(|_| ())
    }

    fn stop(&self) -> Result<()> {
        self.blocking(PacketBody::ConnStop).map(|_| ())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap_or_else(|e| e.into_inner()));
        for session in &sessions {
            session.mark_closed();
        }
        let result = if self.channel.is_closed() {
            Ok(())
        } else {
            self.channel.send_blocking(Packet::new(PacketBody::Close)).map(|_| ())
        };
        self.channel.close();
        self.dispatcher.connection_closed();
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.channel.is_closed()
    }
}

impl Drop for CoreConnection {
    fn drop(&mut self) {
        self.channel.close();
    }
}

pub(crate) fn unexpected(packet: &Packet) -> Error {
    Error::illegal_state(format!("unexpected response {:?}", packet.packet_type()))
}

/// Connects to `broker` in process.
pub fn connect_in_vm(broker: &Broker, user: Option<&str>, password: Option<&str>) -> Result<Arc<CoreConnection>> {
    let connection = broker.connect_in_vm()?;
    CoreConnection::connect(connection, user, password, broker.call_timeout())
}

pub fn connect_tcp(
    addr: impl ToSocketAddrs,
    user: Option<&str>,
    password: Option<&str>,
    call_timeout: Duration,
) -> Result<Arc<CoreConnection>> {
    let connection = TcpConnection::connect(addr)?;
    CoreConnection::connect(connection, user, password, call_timeout)
}
