use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::filter::Filter;
use crate::message::MessageReference;
use crate::queue::{Consumer, HandleStatus, Queue};
use crate::remoting::{Channel, Packet, PacketBody};
use crate::Result;

/// A client consumer as seen by its queue. Deliveries go out as
/// `SESS_DELIVER` packets on the session's channel.
///
/// A consumer created with a window may only be sent that many messages
/// ahead of the credits its client returns. Without credits left it answers
/// [`HandleStatus::Busy`] and the queue keeps the message.
pub struct ServerConsumer {
    id: u64,
    session_id: u64,
    queue: Arc<Queue>,
    filter: Option<Filter>,
    channel: Arc<Channel>,
    started: AtomicBool,
    closed: AtomicBool,
    /// `None` when flow control is off.
    credits: Option<AtomicU32>,
    /// Handed out and not yet acknowledged.
    in_flight: Mutex<HashSet<u64>>,
}

impl ServerConsumer {
    pub fn new(
        id: u64,
        session_id: u64,
        queue: Arc<Queue>,
        filter: Option<Filter>,
        channel: Arc<Channel>,
        started: bool,
        window_size: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            session_id,
            queue,
            filter,
            channel,
            started: AtomicBool::new(started),
            closed: AtomicBool::new(false),
            credits: u32::try_from(window_size).ok().map(|w| AtomicU32::new(w.max(1))),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
        if started {
            self.queue.deliver();
        }
    }

    /// Returns credits from the client and resumes delivery.
    pub fn add_credits(&self, credits: u32) {
        let Some(available) = &self.credits else {
            return;
        };
        let _ = available.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_add(credits)));
        trace!("consumer {} received {credits} credits", self.id);
        self.queue.deliver();
    }

    /// Credits left, or `None` without flow control.
    pub fn credits(&self) -> Option<u32> {
        self.credits.as_ref().map(|c| c.load(Ordering::SeqCst))
    }

    /// The reference of an in-flight message, removed from the in-flight
    /// set.
    pub fn take_in_flight(&self, message_id: u64) -> Option<MessageReference> {
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message_id)
        {
            return None;
        }
        self.queue.delivering_reference(message_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns every unacknowledged reference to the queue. Newest go back
    /// first so the oldest ends up at the head.
    pub fn cancel_in_flight(&self) -> Result<usize> {
        let mut in_flight: Vec<u64> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        in_flight.sort_unstable_by(|a, b| b.cmp(a));
        let mut cancelled = 0;
        for message_id in in_flight {
            if let Some(reference) = self.queue.delivering_reference(message_id) {
                self.queue.cancel(reference)?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops delivery and cancels everything in flight.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue.remove_consumer(self.id);
        let cancelled = self.cancel_in_flight()?;
        debug!(
            "consumer {} on {} closed, {cancelled} references cancelled",
            self.id,
            self.queue.name()
        );
        self.queue.deliver();
        Ok(())
    }
}

impl Consumer for ServerConsumer {
    fn id(&self) -> u64 {
        self.id
    }

    fn handle(&self, reference: &MessageReference) -> HandleStatus {
        if self.closed.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return HandleStatus::Busy;
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(&reference.message().message()) {
                return HandleStatus::NoMatch;
            }
        }
        if let Some(credits) = &self.credits {
            if credits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
                .is_err()
            {
                return HandleStatus::Busy;
            }
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reference.message_id());
        HandleStatus::Handled
    }

    fn deliver(&self, reference: MessageReference) -> Result<()> {
        let packet = Packet::to_target(
            self.session_id,
            PacketBody::Deliver {
                consumer_id: self.id,
                delivery_count: reference.delivery_count,
                message: reference.message().snapshot(),
            },
        );
        if let Err(err) = self.channel.send(packet) {
            warn!("delivery of {} to consumer {} failed: {err}", reference.message_id(), self.id);
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&reference.message_id());
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::Message;
    use crate::queue::tests::{queue_with, reference_to};
    use crate::remoting::InVmConnection;

    fn consumer(window_size: i32) -> (Arc<ServerConsumer>, Arc<Queue>) {
        let (queue, _, _) = queue_with(Default::default());
        let queue = Arc::new(queue);
        let (a, _b) = InVmConnection::pair();
        let channel = Channel::new(a, Duration::from_secs(5));
        let consumer = ServerConsumer::new(1, 2, Arc::clone(&queue), None, channel, true, window_size);
        (consumer, queue)
    }

    #[test]
    fn window_limits_handled_references() {
        let (consumer, queue) = consumer(2);
        let references: Vec<_> = (0..3)
            .map(|i| reference_to(&queue, Message::new("q", format!("m{i}"))))
            .collect();
        assert_eq!(consumer.handle(&references[0]), HandleStatus::Handled);
        assert_eq!(consumer.handle(&references[1]), HandleStatus::Handled);
        assert_eq!(consumer.handle(&references[2]), HandleStatus::Busy);
        assert_eq!(consumer.credits(), Some(0));

        consumer.add_credits(1);
        assert_eq!(consumer.credits(), Some(1));
        assert_eq!(consumer.handle(&references[2]), HandleStatus::Handled);
        assert_eq!(consumer.in_flight_count(), 3);
    }

    #[test]
    fn negative_window_disables_flow_control() {
        let (consumer, queue) = consumer(-1);
        for i in 0..100 {
            let reference = reference_to(&queue, Message::new("q", format!("m{i}")));
            assert_eq!(consumer.handle(&reference), HandleStatus::Handled);
        }
        assert_eq!(consumer.credits(), None);
        consumer.add_credits(5);
        assert_eq!(consumer.credits(), None);

        let (zero, _) = self::consumer(0);
        assert_eq!(zero.credits(), Some(1));
    }
}
