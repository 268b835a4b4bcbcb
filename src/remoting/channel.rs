//! Request/response and fire-and-forget messaging over one connection.
//!
//! Every command a channel sends gets the next command id, carried as the
//! packet's correlation id, and stays in the replay buffer until the peer
//! confirms it. A response confirms everything up to the request it answers;
//! one-way traffic is confirmed in batches with `PACKETS_CONFIRMED`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::remoting::connection::{Connection, Inbound};
use crate::remoting::packet::{Packet, PacketBody};
use crate::{Error, Result};

/// One-way commands received before a `PACKETS_CONFIRMED` goes back.
pub const DEFAULT_CONFIRMATION_BATCH: u32 = 32;

/// Handles the commands a channel receives, in arrival order.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, packet: Packet, channel: &Channel);

    fn connection_closed(&self) {}
}

pub struct Channel {
    connection: RwLock<Arc<dyn Connection>>,
    handler: RwLock<Option<Arc<dyn PacketHandler>>>,
    next_command_id: AtomicI64,
    pending: Mutex<HashMap<i64, SyncSender<Packet>>>,
    replay: Mutex<VecDeque<Packet>>,
    last_received: AtomicI64,
    unconfirmed: AtomicU32,
    confirmation_batch: u32,
    call_timeout: Duration,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(connection: Arc<dyn Connection>, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connection: RwLock::new(connection),
            handler: RwLock::new(None),
            next_command_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            replay: Mutex::new(VecDeque::new()),
            last_received: AtomicI64::new(0),
            unconfirmed: AtomicU32::new(0),
            confirmation_batch: DEFAULT_CONFIRMATION_BATCH,
            call_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Starts reading from the connection.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let inbound: Weak<Channel> = Arc::downgrade(self);
        self.connection().start(inbound)
    }

    pub fn set_handler(&self, handler: Arc<dyn PacketHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn connection_id(&self) -> u64 {
        self.connection().id()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ObjectClosed("channel"));
        }
        Ok(())
    }

    fn next_command(&self, packet: &mut Packet, one_way: bool) -> i64 {
        let id = self.next_command_id.fetch_add(1, Ordering::SeqCst) + 1;
        packet.correlation_id = id;
        packet.one_way = one_way;
        self.replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(packet.clone());
        id
    }

    /// Sends a one-way command. Returns its command id.
    pub fn send(&self, mut packet: Packet) -> Result<i64> {
        self.check_open()?;
        let id = self.next_command(&mut packet, true);
        trace!("send {:?} #{id}", packet.packet_type());
        self.connection().write(&packet)?;
        Ok(id)
    }

    /// Sends a command and parks until its response arrives or the call
    /// timeout passes. Exception responses come back as typed errors.
    pub fn send_blocking(&self, mut packet: Packet) -> Result<Packet> {
        self.check_open()?;
        let (tx, rx) = mpsc::sync_channel(1);
        let id = self.next_command(&mut packet, false);
        let packet_type = packet.packet_type();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        if let Err(err) = self.connection().write(&packet) {
            self.remove_pending(id);
            return Err(err);
        }
        match rx.recv_timeout(self.call_timeout) {
            Ok(response) => match response.body {
                PacketBody::Exception { code, message } => Err(Error::from_remote(code, message)),
                _ => Ok(response),
            },
            Err(RecvTimeoutError::Timeout) => {
                self.remove_pending(id);
                Err(Error::ConnectionTimedOut(format!("{packet_type:?} #{id}")))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.remove_pending(id);
                Err(Error::ConnectionFailed(format!("channel closed awaiting {packet_type:?} #{id}")))
            }
        }
    }

    fn remove_pending(&self, id: i64) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Answers `request`. One-way requests get no answer.
    pub fn respond(&self, request: &Packet, body: PacketBody) -> Result<()> {
        if request.one_way {
            if let PacketBody::Exception { code, message } = &body {
                warn!("one-way {:?} failed with {code}: {message}", request.packet_type());
            }
            return Ok(());
        }
        let response = Packet {
            correlation_id: request.correlation_id,
            target_id: request.target_id.clone(),
            callback_id: None,
            one_way: false,
            body,
        };
        self.connection().write(&response)
    }

    /// Drops buffered commands up to and including `command_id`.
    pub fn confirm(&self, command_id: i64) {
        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        while replay.front().is_some_and(|p| p.correlation_id <= command_id) {
            replay.pop_front();
        }
    }

    pub fn replay_buffer_len(&self) -> usize {
        self.replay.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Id of the last command received from the peer.
    pub fn last_received_command_id(&self) -> i64 {
        self.last_received.load(Ordering::SeqCst)
    }

    /// Resends every buffered command after `last_received`, the id the
    /// peer reports as the last one it got. Returns how many were resent.
    pub fn replay_commands(&self, last_received: i64) -> Result<usize> {
        self.confirm(last_received);
        let packets: Vec<Packet> = self
            .replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        let connection = self.connection();
        for packet in &packets {
            connection.write(packet)?;
        }
        debug!("replayed {} commands after #{last_received}", packets.len());
        Ok(packets.len())
    }

    /// Moves the channel onto a new connection after failover and starts
    /// reading from it. Buffered commands are not resent until
    /// [`replay_commands`](Self::replay_commands).
    pub fn transfer_connection(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Result<()> {
        let old = std::mem::replace(
            &mut *self.connection.write().unwrap_or_else(|e| e.into_inner()),
            Arc::clone(&connection),
        );
        old.close();
        self.closed.store(false, Ordering::SeqCst);
        let inbound: Weak<Channel> = Arc::downgrade(self);
        connection.start(inbound)?;
        debug!("channel moved from connection {} to {}", old.id(), connection.id());
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection().close();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn handler(&self) -> Option<Arc<dyn PacketHandler>> {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_control(&self, body: PacketBody) {
        let mut packet = Packet::new(body);
        packet.one_way = true;
        if let Err(err) = self.connection().write(&packet) {
            debug!("failed to write {:?}: {err}", packet.packet_type());
        }
    }
}

impl Inbound for Channel {
    fn on_packet(&self, packet: Packet) {
        if packet.body.is_response() {
            let waiter = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&packet.correlation_id);
            self.confirm(packet.correlation_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(packet);
                }
                None => debug!(
                    "dropping {:?} for #{}: nobody is waiting",
                    packet.packet_type(),
                    packet.correlation_id
                ),
            }
            return;
        }
        match packet.body {
            PacketBody::PacketsConfirmed { command_id } => {
                self.confirm(command_id);
                return;
            }
            PacketBody::Ping => {
                if let Err(err) = self.respond(&packet, PacketBody::Pong) {
                    debug!("failed to answer ping: {err}");
                }
                return;
            }
            _ => {}
        }

        self.last_received.store(packet.correlation_id, Ordering::SeqCst);
        if packet.one_way {
            let unconfirmed = self.unconfirmed.fetch_add(1, Ordering::SeqCst) + 1;
            if unconfirmed >= self.confirmation_batch {
                self.unconfirmed.store(0, Ordering::SeqCst);
                self.write_control(PacketBody::PacketsConfirmed {
                    command_id: packet.correlation_id,
                });
            }
        }
        match self.handler() {
            Some(handler) => handler.handle(packet, self),
            None => warn!("no handler for {:?}, dropping it", packet.packet_type()),
        }
    }

    fn on_closed(&self) {
        if !self.connection().is_closed() {
            // a reader of a connection we already moved away from
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        if let Some(handler) = self.handler() {
            handler.connection_closed();
        }
    }
}
