//! Packet interceptors.
//!
//! Interceptors wrap a [`PacketHandler`] as a chain built once when the
//! handler is created. Each link sees the packet before the next one.

use std::sync::Arc;

use log::debug;

use crate::remoting::channel::{Channel, PacketHandler};
use crate::remoting::packet::Packet;
use crate::{Error, Result};

pub trait Interceptor: Send + Sync {
    /// Returns `Ok(false)` to stop the packet here. An error is sent back to
    /// the caller of a blocking request.
    fn intercept(&self, packet: &Packet, connection_id: u64) -> Result<bool>;
}

struct Intercepted {
    interceptor: Arc<dyn Interceptor>,
    next: Arc<dyn PacketHandler>,
}

impl PacketHandler for Intercepted {
    fn handle(&self, packet: Packet, channel: &Channel) {
        let rejected = match self.interceptor.intercept(&packet, channel.connection_id()) {
            Ok(true) => return self.next.handle(packet, channel),
            Ok(false) => Error::illegal_state(format!("{:?} stopped by an interceptor", packet.packet_type())),
            Err(err) => err,
        };
        debug!("intercepted {:?}: {rejected}", packet.packet_type());
        if let Err(err) = channel.respond(&packet, Packet::exception(&rejected)) {
            debug!("failed to report interception: {err}");
        }
    }

    fn connection_closed(&self) {
        self.next.connection_closed();
    }
}

/// Wraps `handler` so that `interceptors` run first, in slice order.
pub fn intercept(handler: Arc<dyn PacketHandler>, interceptors: &[Arc<dyn Interceptor>]) -> Arc<dyn PacketHandler> {
    interceptors.iter().rev().fold(handler, |next, interceptor| {
        Arc::new(Intercepted {
            interceptor: Arc::clone(interceptor),
            next,
        })
    })
}
