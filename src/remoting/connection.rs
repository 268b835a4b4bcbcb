//! Byte transports under a [`Channel`](super::Channel).
//!
//! A connection writes encoded packets and, once started, runs one reader
//! thread that hands every decoded packet to an [`Inbound`] in arrival
//! order.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};

use crate::remoting::codec::{Codec, Decodable, DEFAULT_MAX_FRAME_SIZE};
use crate::remoting::packet::Packet;
use crate::{Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Receives what a connection's reader thread reads.
pub trait Inbound: Send + Sync {
    fn on_packet(&self, packet: Packet);
    /// The peer went away or the stream broke. Called once.
    fn on_closed(&self);
}

pub trait Connection: Send + Sync {
    fn id(&self) -> u64;
    fn write(&self, packet: &Packet) -> Result<()>;
    /// Spawns the reader thread. A connection can be started once.
    fn start(&self, inbound: Weak<dyn Inbound>) -> Result<()>;
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn remote_address(&self) -> String;
}

fn notify_closed(inbound: &Weak<dyn Inbound>) {
    if let Some(inbound) = inbound.upgrade() {
        inbound.on_closed();
    }
}

/// One end of an in-process connection. Packets cross as values.
pub struct InVmConnection {
    id: u64,
    peer_id: u64,
    peer: Arc<Mutex<Option<Sender<Packet>>>>,
    inbox: Mutex<Option<Receiver<Packet>>>,
    closed: Arc<AtomicBool>,
}

impl InVmConnection {
    /// Two connected ends.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (to_b, b_inbox) = mpsc::channel();
        let (to_a, a_inbox) = mpsc::channel();
        let (a_id, b_id) = (next_connection_id(), next_connection_id());
        let end = |id, peer_id, peer, inbox| {
            Arc::new(Self {
                id,
                peer_id,
                peer: Arc::new(Mutex::new(Some(peer))),
                inbox: Mutex::new(Some(inbox)),
                closed: Arc::new(AtomicBool::new(false)),
            })
        };
        (end(a_id, b_id, to_b, a_inbox), end(b_id, a_id, to_a, b_inbox))
    }
}

impl Connection for InVmConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, packet: &Packet) -> Result<()> {
        let peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        let sender = peer
            .as_ref()
            .ok_or_else(|| Error::ConnectionFailed(format!("in-vm connection {} is closed", self.id)))?;
        sender
            .send(packet.clone())
            .map_err(|_| Error::ConnectionFailed(format!("in-vm peer {} is gone", self.peer_id)))
    }

    fn start(&self, inbound: Weak<dyn Inbound>) -> Result<()> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::illegal_state(format!("in-vm connection {} already started", self.id)))?;
        let closed = Arc::clone(&self.closed);
        let peer = Arc::clone(&self.peer);
        thread::Builder::new()
            .name(format!("courier-invm-{}", self.id))
            .spawn(move || {
                for packet in inbox.iter() {
                    match inbound.upgrade() {
                        Some(inbound) => inbound.on_packet(packet),
                        None => break,
                    }
                }
                closed.store(true, Ordering::SeqCst);
                peer.lock().unwrap_or_else(|e| e.into_inner()).take();
                notify_closed(&inbound);
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing in-vm connection {}", self.id);
        }
        // Dropping the sender ends the peer's reader, which drops its own
        // sender and ends ours.
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> String {
        format!("invm:{}", self.peer_id)
    }
}

/// A connection over a TCP stream.
pub struct TcpConnection {
    id: u64,
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    closed: Arc<AtomicBool>,
    started: AtomicBool,
    max_frame_size: AtomicUsize,
}

impl TcpConnection {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Arc::new(Self {
            id: next_connection_id(),
            stream: Mutex::new(stream),
            peer,
            closed: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            max_frame_size: AtomicUsize::new(DEFAULT_MAX_FRAME_SIZE),
        }))
    }

    /// Frames above this size close the connection. Takes effect for
    /// connections not yet started.
    pub fn set_max_frame_size(&self, max_frame_size: usize) {
        self.max_frame_size.store(max_frame_size, Ordering::SeqCst);
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn write(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionFailed(format!("connection to {} is closed", self.peer)));
        }
        let mut buf = BytesMut::new();
        Codec::encode(packet, &mut buf);
        self.stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_all(&buf)
            .map_err(|e| Error::ConnectionFailed(format!("{}: {e}", self.peer)))
    }

    fn start(&self, inbound: Weak<dyn Inbound>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::illegal_state(format!("connection {} already started", self.id)));
        }
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner()).try_clone()?;
        let closed = Arc::clone(&self.closed);
        let peer = self.peer;
        let max_frame_size = self.max_frame_size.load(Ordering::SeqCst);
        thread::Builder::new()
            .name(format!("courier-tcp-{}", self.id))
            .spawn(move || {
                read_loop(&mut stream, &inbound, peer, max_frame_size);
                closed.store(true, Ordering::SeqCst);
                let _ = stream.shutdown(Shutdown::Both);
                notify_closed(&inbound);
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing connection {} to {}", self.id, self.peer);
        let _ = self
            .stream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> String {
        self.peer.to_string()
    }
}

fn read_loop(stream: &mut TcpStream, inbound: &Weak<dyn Inbound>, peer: SocketAddr, max_frame_size: usize) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        loop {
            match Codec::decodable(&buf, max_frame_size) {
                Decodable::NeedData => break,
                Decodable::Invalid => {
                    warn!("dropping connection to {peer}: unframeable or oversized data");
                    return;
                }
                Decodable::Ok(len) => {
                    let frame = buf.split_to(len);
                    match Codec::decode(&frame) {
                        Ok(packet) => match inbound.upgrade() {
                            Some(inbound) => inbound.on_packet(packet),
                            None => return,
                        },
                        Err(err) => {
                            warn!("dropping connection to {peer}: {err}");
                            return;
                        }
                    }
                }
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("connection to {peer} closed by peer");
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("read from {peer} failed: {e}");
                return;
            }
        }
    }
}

/// Accepts TCP connections on a background thread.
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TcpAcceptor {
    pub fn bind<F>(addr: impl ToSocketAddrs, on_connection: F) -> Result<Self>
    where
        F: Fn(Arc<TcpConnection>) + Send + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let handle = thread::Builder::new()
            .name(format!("courier-acceptor-{}", local_addr.port()))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            let accepted = stream
                                .set_nonblocking(false)
                                .map_err(Error::Io)
                                .and_then(|_| TcpConnection::from_stream(stream));
                            match accepted {
                                Ok(connection) => on_connection(connection),
                                Err(err) => warn!("failed to accept {peer}: {err}"),
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => warn!("accept on {local_addr} failed: {e}"),
                    }
                }
            })
            .map_err(Error::Io)?;
        info!("accepting connections on {local_addr}");
        Ok(Self {
            local_addr,
            stopped,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("stopped accepting on {}", self.local_addr);
        }
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}
