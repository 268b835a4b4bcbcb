use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};

use crate::remoting::{Channel, Packet, PacketBody, PacketHandler, PROTOCOL_VERSION};
use crate::server::session::ServerSession;
use crate::server::ServerContext;
use crate::{Error, Result};

/// Handles everything a client sends on one connection. Session packets
/// are routed by target id.
pub struct ServerConnection {
    context: Arc<ServerContext>,
    channel: Weak<Channel>,
    authenticated: AtomicBool,
    started: AtomicBool,
    sessions: Mutex<HashMap<u64, Arc<ServerSession>>>,
    on_close: Box<dyn Fn(u64) + Send + Sync>,
}

impl ServerConnection {
    pub(crate) fn new(
        context: Arc<ServerContext>,
        channel: &Arc<Channel>,
        on_close: impl Fn(u64) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            channel: Arc::downgrade(channel),
            authenticated: AtomicBool::new(false),
            started: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            on_close: Box::new(on_close),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<ServerSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    fn create_connection(&self, version: u32, user: Option<&str>, password: Option<&str>) -> Result<()> {
        if version != PROTOCOL_VERSION {
            return Err(Error::IncompatibleVersions(version));
        }
        if self.context.config.security_enabled && !self.context.security.validate_user(user, password) {
            return Err(Error::Security(format!("unable to validate user {}", user.unwrap_or("<anonymous>"))));
        }
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create_session(&self, xa: bool, auto_commit_sends: bool, auto_commit_acks: bool) -> Result<u64> {
        let channel = self.channel.upgrade().ok_or(Error::ObjectClosed("connection"))?;
        let id = self.context.next_id();
        let session = ServerSession::new(
            id,
            Arc::clone(&self.context),
            channel,
            xa,
            auto_commit_sends,
            auto_commit_acks,
            self.started.load(Ordering::SeqCst),
        );
        self.sessions().insert(id, session);
        debug!("created session {id} (xa={xa})");
        Ok(id)
    }

    fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
        let sessions: Vec<Arc<ServerSession>> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.set_started(started);
        }
    }

    fn close_sessions(&self) {
        let sessions: Vec<Arc<ServerSession>> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(err) = session.close() {
                warn!("failed to close session {}: {err}", session.id());
            }
        }
    }

    fn handle_connection_packet(&self, packet: &Packet) -> Result<PacketBody> {
        match &packet.body {
            PacketBody::CreateConnection {
                version,
                username,
                password,
            } => {
                self.create_connection(*version, username.as_deref(), password.as_deref())?;
                let connection_id = self.channel.upgrade().map_or(0, |c| c.connection_id());
                info!("connection {connection_id} created for {}", username.as_deref().unwrap_or("<anonymous>"));
                Ok(PacketBody::CreateConnectionResp { connection_id })
            }
            _ if !self.authenticated.load(Ordering::SeqCst) => {
                Err(Error::Security("connection is not authenticated".into()))
            }
            PacketBody::CreateSession {
                xa,
                auto_commit_sends,
                auto_commit_acks,
            } => self
                .create_session(*xa, *auto_commit_sends, *auto_commit_acks)
                .map(|session_id| PacketBody::CreateSessionResp { session_id }),
            PacketBody::ConnStart => {
                self.set_started(true);
                Ok(PacketBody::NullResponse)
            }
            PacketBody::ConnStop => {
                self.set_started(false);
                Ok(PacketBody::NullResponse)
            }
            PacketBody::Close => {
                self.close_sessions();
                Ok(PacketBody::NullResponse)
            }
            other => Err(Error::UnsupportedPacket(other.packet_type().as_u8())),
        }
    }
}

impl PacketHandler for ServerConnection {
    fn handle(&self, packet: Packet, channel: &Channel) {
        if let Some(target) = packet.target() {
            let session = self.sessions().get(&target).cloned();
            match session {
                Some(session) => {
                    let closing = matches!(packet.body, PacketBody::Close);
                    session.handle(packet, channel);
                    if closing {
                        self.sessions().remove(&target);
                    }
                }
                None => {
                    let err = Error::ObjectClosed("session");
                    if let Err(err) = channel.respond(&packet, Packet::exception(&err)) {
                        debug!("failed to answer packet for unknown session {target}: {err}");
                    }
                }
            }
            return;
        }
        let body = self
            .handle_connection_packet(&packet)
            .unwrap_or_else(|err| Packet::exception(&err));
        if let Err(err) = channel.respond(&packet, body) {
            warn!("failed to answer {:?}: {err}", packet.packet_type());
        }
    }

    fn connection_closed(&self) {
        self.close_sessions();
        if let Some(channel) = self.channel.upgrade() {
            debug!("connection {} closed", channel.connection_id());
            (self.on_close)(channel.connection_id());
        }
    }
}
