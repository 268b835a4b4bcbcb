//! Queues of message references.
//!
//! A queue keeps its pending references in a [`PriorityList`], references
//! with a future delivery time in [`ScheduledReferences`], and references
//! handed to consumers in a delivering table until they are acknowledged or
//! cancelled. One mutex covers all of it plus the consumer list, so a
//! reference is never offered to two consumers at once. Handing a reference
//! to a consumer happens after the lock is released, under a second delivery
//! lock that keeps handoffs in selection order.
//!
//! A queue never touches storage or other queues directly. Anything that
//! outlives the reference (journal records, dead-letter moves, releasing the
//! message) goes through its [`ReferenceSink`].

mod factory;
mod list;
mod scheduled;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use log::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::{AddressSettings, DistributionPolicy};
use crate::filter::Filter;
use crate::message::MessageReference;
use crate::{Error, Result};

pub use factory::{DefaultQueueFactory, QueueFactory};
pub use list::{PriorityList, Scan};
pub use scheduled::ScheduledReferences;

/// A consumer's answer when offered a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// The consumer takes the reference.
    Handled,
    /// The consumer cannot take anything right now.
    Busy,
    /// The consumer does not want this reference but may want others.
    NoMatch,
}

pub trait Consumer: Send + Sync {
    fn id(&self) -> u64;

    /// Offered a reference under the queue lock. Must not block or call back
    /// into the queue.
    fn handle(&self, reference: &MessageReference) -> HandleStatus;

    /// Receives a reference it accepted in [`handle`](Consumer::handle),
    /// outside the queue lock. An error removes the consumer and puts the
    /// reference back.
    fn deliver(&self, reference: MessageReference) -> Result<()>;
}

/// Where references go when they leave a queue for good.
pub trait ReferenceSink: Send + Sync {
    /// The reference is done: record the acknowledgement and release the
    /// message if this was its last reference.
    fn acknowledge(&self, reference: &MessageReference) -> Result<()>;

    /// Persists the reference's delivery count.
    fn update_delivery_count(&self, reference: &MessageReference) -> Result<()>;

    /// Routes the reference's message to `address` and then acknowledges the
    /// reference.
    fn move_reference(&self, reference: &MessageReference, address: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub filter: Option<Filter>,
    pub durable: bool,
    pub temporary: bool,
}

#[derive(Default)]
struct QueueState {
    messages: PriorityList<MessageReference>,
    scheduled: ScheduledReferences,
    delivering: HashMap<u64, MessageReference>,
    consumers: Vec<Arc<dyn Consumer>>,
    position: usize,
    messages_added: u64,
}

pub struct Queue {
    id: u64,
    name: String,
    address: String,
    filter: Option<Filter>,
    durable: bool,
    temporary: bool,
    settings: AddressSettings,
    state: Mutex<QueueState>,
    /// Held from selection through handoff.
    delivery: Mutex<()>,
    /// Set by callers that found the delivery lock taken.
    redeliver: AtomicBool,
    sink: Arc<dyn ReferenceSink>,
    clock: Arc<dyn Clock>,
}

impl Queue {
    pub fn new(
        options: QueueOptions,
        settings: AddressSettings,
        sink: Arc<dyn ReferenceSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: options.id,
            name: options.name,
            address: options.address,
            filter: options.filter,
            durable: options.durable,
            temporary: options.temporary,
            settings,
            state: Mutex::new(QueueState::default()),
            delivery: Mutex::new(()),
            redeliver: AtomicBool::new(false),
            sink,
            clock,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn settings(&self) -> &AddressSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the queue's filter lets the reference's message in.
    pub fn accepts(&self, reference: &MessageReference) -> bool {
        match &self.filter {
            Some(filter) => filter.matches(&reference.message().message()),
            None => true,
        }
    }

    pub fn is_full(&self) -> bool {
        self.settings
            .max_size_messages
            .is_some_and(|max| self.message_count() >= max)
    }

    fn insert(&self, state: &mut QueueState, reference: MessageReference, first: bool) {
        if reference.scheduled_delivery > self.clock.now_millis() {
            trace!(
                "queue {} holds message {} until {}",
                self.name,
                reference.message_id(),
                reference.scheduled_delivery
            );
            state.scheduled.add(reference);
        } else if first {
            let priority = reference.priority();
            state.messages.add_first(reference, priority);
        } else {
            let priority = reference.priority();
            state.messages.add_last(reference, priority);
        }
    }

    /// Appends a new reference. A full queue answers [`HandleStatus::Busy`]
    /// and keeps nothing.
    pub fn add_last(&self, reference: MessageReference) -> HandleStatus {
        let mut state = self.lock();
        if let Some(max) = self.settings.max_size_messages {
            let count = state.messages.len() + state.scheduled.len() + state.delivering.len();
            if count >= max {
                return HandleStatus::Busy;
            }
        }
        state.messages_added += 1;
        self.insert(&mut state, reference, false);
        HandleStatus::Handled
    }

    /// Puts a reference back at the head of its priority level.
    pub fn add_first(&self, reference: MessageReference) {
        let mut state = self.lock();
        self.insert(&mut state, reference, true);
    }

    /// Adds a reference ignoring the size limit. Used for recovered references
    /// and committed transactions.
    pub fn add_unbounded(&self, reference: MessageReference) {
        let mut state = self.lock();
        state.messages_added += 1;
        self.insert(&mut state, reference, false);
    }

    /// Parks a reference in the delivering table without a consumer. Used for
    /// references acknowledged by a prepared transaction.
    pub fn hold_delivering(&self, reference: MessageReference) {
        self.lock().delivering.insert(reference.message_id(), reference);
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) {
        debug!("queue {} gained consumer {}", self.name, consumer.id());
        self.lock().consumers.push(consumer);
    }

    pub fn remove_consumer(&self, consumer_id: u64) -> Option<Arc<dyn Consumer>> {
        let mut state = self.lock();
        let pos = state.consumers.iter().position(|c| c.id() == consumer_id)?;
        let consumer = state.consumers.remove(pos);
        if state.position > pos {
            state.position -= 1;
        }
        Some(consumer)
    }

    /// Offers pending references to consumers until every consumer is busy
    /// or nothing is left. A call made while another delivery is running
    /// returns at once and the running one makes an extra pass.
    pub fn deliver(&self) {
        self.redeliver.store(true, Ordering::SeqCst);
        loop {
            // the holder may be further up this stack
            let guard = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while self.redeliver.swap(false, Ordering::SeqCst) {
                self.deliver_pass();
            }
            drop(guard);
            if !self.redeliver.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn deliver_pass(&self) {
        loop {
            let (handoffs, expired) = self.select();
            for reference in expired {
                self.expire(reference);
            }
            let mut failed = false;
            for (consumer, reference) in handoffs {
                let message_id = reference.message_id();
                if let Err(err) = consumer.deliver(reference) {
                    warn!(
                        "removing consumer {} from queue {} after failed delivery: {err}",
                        consumer.id(),
                        self.name
                    );
                    self.remove_consumer(consumer.id());
                    self.requeue(message_id);
                    failed = true;
                }
            }
            if !failed {
                return;
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn select(&self) -> (Vec<(Arc<dyn Consumer>, MessageReference)>, Vec<MessageReference>) {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let state = &mut *guard;
        let n = state.consumers.len();
        if n == 0 || state.messages.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let round_robin = self.settings.distribution() == DistributionPolicy::RoundRobin;
        let mut start = if round_robin { state.position % n } else { 0 };
        let mut busy = vec![false; n];
        // None marks an expired reference.
        let mut decisions: Vec<Option<usize>> = Vec::new();
        let consumers = &state.consumers;
        let taken = state.messages.scan(|reference| {
            if reference.message().is_expired(now) {
                decisions.push(None);
                return Scan::Take;
            }
            for k in 0..n {
                let c = (start + k) % n;
                if busy[c] {
                    continue;
                }
                match consumers[c].handle(reference) {
                    HandleStatus::Handled => {
                        decisions.push(Some(c));
                        if round_robin {
                            start = (c + 1) % n;
                        }
                        return Scan::Take;
                    }
                    HandleStatus::Busy => busy[c] = true,
                    HandleStatus::NoMatch => {}
                }
            }
            if busy.iter().all(|b| *b) {
                Scan::Stop
            } else {
                Scan::Keep
            }
        });
        if round_robin {
            state.position = start;
        }

        let mut handoffs = Vec::new();
        let mut expired = Vec::new();
        for (reference, decision) in taken.into_iter().zip(decisions) {
            match decision {
                Some(c) => {
                    state.delivering.insert(reference.message_id(), reference.clone());
                    handoffs.push((Arc::clone(&state.consumers[c]), reference));
                }
                None => expired.push(reference),
            }
        }
        (handoffs, expired)
    }

    fn requeue(&self, message_id: u64) {
        let mut state = self.lock();
        if let Some(reference) = state.delivering.remove(&message_id) {
            let priority = reference.priority();
            state.messages.add_first(reference, priority);
        }
    }

    fn expire(&self, reference: MessageReference) {
        let result = match self.settings.expiry_address.as_deref() {
            Some(address) => {
                debug!("message {} expired, moving to {address}", reference.message_id());
                self.sink.move_reference(&reference, address)
            }
            None => {
                debug!("message {} expired in queue {}", reference.message_id(), self.name);
                self.sink.acknowledge(&reference)
            }
        };
        if let Err(err) = result {
            warn!("failed to expire message {}: {err}", reference.message_id());
        }
    }

    /// Removes a delivered reference for good.
    pub fn acknowledge(&self, message_id: u64) -> Result<()> {
        let reference = self.lock().delivering.remove(&message_id).ok_or_else(|| {
            Error::illegal_state(format!("message {message_id} is not being delivered from {}", self.name))
        })?;
        self.sink.acknowledge(&reference)
    }

    /// Whether the message still has a reference here: pending, scheduled or
    /// out for delivery.
    pub fn holds(&self, message_id: u64) -> bool {
        let state = self.lock();
        state.delivering.contains_key(&message_id)
            || state.messages.iter().any(|r| r.message_id() == message_id)
            || state.scheduled.iter().any(|r| r.message_id() == message_id)
    }

    /// A clone of a reference currently out for delivery.
    pub fn delivering_reference(&self, message_id: u64) -> Option<MessageReference> {
        self.lock().delivering.get(&message_id).cloned()
    }

    /// Removes a delivered reference without telling the sink. The caller
    /// owns whatever bookkeeping the acknowledgement needs.
    pub fn take_delivering(&self, message_id: u64) -> Option<MessageReference> {
        self.lock().delivering.remove(&message_id)
    }

    /// Removes a pending or scheduled reference without telling the sink.
    pub fn take_reference(&self, message_id: u64) -> Option<MessageReference> {
        let mut state = self.lock();
        let mut taken = state.messages.remove_where(|r| r.message_id() == message_id);
        if taken.is_empty() {
            taken = state.scheduled.remove_where(|r| r.message_id() == message_id);
        }
        taken.pop()
    }

    /// Returns a reference after a failed or abandoned delivery.
    ///
    /// The delivery count goes up. At `max_delivery_attempts` the reference
    /// moves to the dead-letter address (or is dropped without one);
    /// otherwise it goes back to the head of the queue, or is rescheduled
    /// when a redelivery delay is configured. The caller runs
    /// [`deliver`](Self::deliver) afterwards.
    pub fn cancel(&self, reference: MessageReference) -> Result<()> {
        let mut reference = self
            .lock()
            .delivering
            .remove(&reference.message_id())
            .unwrap_or(reference);
        reference.delivery_count += 1;

        let max = self.settings.max_delivery_attempts();
        if max > 0 && reference.delivery_count >= max {
            return self.send_to_dead_letter(reference);
        }
        self.sink.update_delivery_count(&reference)?;

        let delay = self.settings.redelivery_delay_ms();
        if delay > 0 {
            reference.scheduled_delivery = self.clock.now_millis() + delay;
        }
        let mut state = self.lock();
        self.insert(&mut state, reference, true);
        Ok(())
    }

    fn send_to_dead_letter(&self, reference: MessageReference) -> Result<()> {
        match self.settings.dead_letter_address.as_deref() {
            Some(address) => {
                debug!(
                    "message {} reached {} delivery attempts on {}, moving to {address}",
                    reference.message_id(),
                    reference.delivery_count,
                    self.name
                );
                self.sink.move_reference(&reference, address)
            }
            None => {
                warn!(
                    "dropping message {} after {} delivery attempts on {}: no dead letter address",
                    reference.message_id(),
                    reference.delivery_count,
                    self.name
                );
                self.sink.acknowledge(&reference)
            }
        }
    }

    /// Moves scheduled references whose time has come into the queue.
    pub fn promote_scheduled(&self, now: u64) -> usize {
        let mut state = self.lock();
        let due = state.scheduled.take_due(now);
        let count = due.len();
        for reference in due {
            let priority = reference.priority();
            state.messages.add_last(reference, priority);
        }
        count
    }

    pub fn next_scheduled(&self) -> Option<u64> {
        self.lock().scheduled.next_due()
    }

    fn selected(filter: Option<&Filter>, reference: &MessageReference) -> bool {
        filter.map_or(true, |f| f.matches(&reference.message().message()))
    }

    /// Pending and scheduled references matching `filter`.
    pub fn list(&self, filter: Option<&Filter>) -> Vec<MessageReference> {
        let state = self.lock();
        state
            .messages
            .iter()
            .chain(state.scheduled.iter())
            .filter(|r| Self::selected(filter, r))
            .cloned()
            .collect()
    }

    /// Drops pending and scheduled references matching `filter`, returning
    /// how many went.
    pub fn remove_references(&self, filter: Option<&Filter>) -> Result<usize> {
        let removed = {
            let mut state = self.lock();
            let mut removed = state.messages.remove_where(|r| Self::selected(filter, r));
            removed.extend(state.scheduled.remove_where(|r| Self::selected(filter, r)));
            removed
        };
        for reference in &removed {
            self.sink.acknowledge(reference)?;
        }
        Ok(removed.len())
    }

    /// Pending, scheduled and delivering references.
    pub fn message_count(&self) -> usize {
        let state = self.lock();
        state.messages.len() + state.scheduled.len() + state.delivering.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn delivering_count(&self) -> usize {
        self.lock().delivering.len()
    }

    pub fn scheduled_count(&self) -> usize {
        self.lock().scheduled.len()
    }

    pub fn messages_added(&self) -> u64 {
        self.lock().messages_added
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("durable", &self.durable)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::{Message, ServerMessage, HDR_SCHEDULED_DELIVERY_TIME};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub acked: Mutex<Vec<u64>>,
        pub moved: Mutex<Vec<(u64, String)>>,
        pub counts: Mutex<Vec<(u64, u32)>>,
    }

    impl ReferenceSink for RecordingSink {
        fn acknowledge(&self, reference: &MessageReference) -> Result<()> {
            self.acked.lock().unwrap().push(reference.message_id());
            Ok(())
        }

        fn update_delivery_count(&self, reference: &MessageReference) -> Result<()> {
            self.counts
                .lock()
                .unwrap()
                .push((reference.message_id(), reference.delivery_count));
            Ok(())
        }

        fn move_reference(&self, reference: &MessageReference, address: &str) -> Result<()> {
            self.moved
                .lock()
                .unwrap()
                .push((reference.message_id(), address.to_string()));
            Ok(())
        }
    }

    pub(crate) struct TestConsumer {
        id: u64,
        filter: Option<Filter>,
        pub busy: AtomicBool,
        pub fail: AtomicBool,
        pub received: Mutex<Vec<u64>>,
    }

    impl TestConsumer {
        pub fn new(id: u64) -> Arc<Self> {
            Self::with_filter(id, None)
        }

        pub fn with_filter(id: u64, filter: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                id,
                filter: filter.map(|f| Filter::parse(f).unwrap()),
                busy: AtomicBool::new(false),
                fail: AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn received(&self) -> Vec<u64> {
            self.received.lock().unwrap().clone()
        }
    }

    impl Consumer for TestConsumer {
        fn id(&self) -> u64 {
            self.id
        }

        fn handle(&self, reference: &MessageReference) -> HandleStatus {
            if self.busy.load(Ordering::SeqCst) {
                return HandleStatus::Busy;
            }
            match &self.filter {
                Some(f) if !f.matches(&reference.message().message()) => HandleStatus::NoMatch,
                _ => HandleStatus::Handled,
            }
        }

        fn deliver(&self, reference: MessageReference) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ConnectionFailed("gone".into()));
            }
            self.received.lock().unwrap().push(reference.message_id());
            Ok(())
        }
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    pub(crate) fn reference_to(queue: &Queue, message: Message) -> MessageReference {
        let mut message = message;
        message.id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        let server = ServerMessage::new(message);
        server.increment_refs(queue.is_durable());
        MessageReference::new(server, queue.id(), queue.is_durable())
    }

    pub(crate) fn queue_with(settings: AddressSettings) -> (Queue, Arc<RecordingSink>, Arc<ManualClock>) {
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = Queue::new(
            QueueOptions {
                id: 1,
                name: "Q1".into(),
                address: "testaddress".into(),
                filter: None,
                durable: false,
                temporary: false,
            },
            settings,
            sink.clone(),
            clock.clone(),
        );
        (queue, sink, clock)
    }

    fn add(queue: &Queue, body: &'static str) -> u64 {
        let reference = reference_to(queue, Message::new("testaddress", body));
        let id = reference.message_id();
        assert_eq!(queue.add_last(reference), HandleStatus::Handled);
        id
    }

    #[test]
    fn delivers_in_order_and_acknowledges() {
        let (queue, sink, _) = queue_with(AddressSettings::default());
        let ids: Vec<u64> = ["a", "b", "c"].into_iter().map(|b| add(&queue, b)).collect();
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(consumer.received(), ids);
        assert_eq!(queue.delivering_count(), 3);
        for id in &ids {
            queue.acknowledge(*id).unwrap();
        }
        assert_eq!(queue.message_count(), 0);
        assert_eq!(*sink.acked.lock().unwrap(), ids);
        assert!(queue.acknowledge(ids[0]).is_err());
    }

    #[test]
    fn round_robin_spreads_evenly() {
        let (queue, _, _) = queue_with(AddressSettings::default());
        let consumers: Vec<_> = (0..3).map(TestConsumer::new).collect();
        for c in &consumers {
            queue.add_consumer(c.clone());
        }
        for _ in 0..9 {
            add(&queue, "m");
            queue.deliver();
        }
        for c in &consumers {
            assert_eq!(c.received().len(), 3);
        }
    }

    #[test]
    fn first_available_prefers_the_first_consumer() {
        let (queue, _, _) = queue_with(AddressSettings {
            distribution: Some(DistributionPolicy::FirstAvailable),
            ..AddressSettings::default()
        });
        let first = TestConsumer::new(1);
        let second = TestConsumer::new(2);
        queue.add_consumer(first.clone());
        queue.add_consumer(second.clone());
        for _ in 0..4 {
            add(&queue, "m");
        }
        queue.deliver();
        assert_eq!(first.received().len(), 4);

        first.busy.store(true, Ordering::SeqCst);
        add(&queue, "m");
        queue.deliver();
        assert_eq!(second.received().len(), 1);
    }

    #[test]
    fn busy_consumers_stop_delivery() {
        let (queue, _, _) = queue_with(AddressSettings::default());
        let consumer = TestConsumer::new(1);
        consumer.busy.store(true, Ordering::SeqCst);
        queue.add_consumer(consumer.clone());
        add(&queue, "a");
        add(&queue, "b");
        queue.deliver();
        assert!(consumer.received().is_empty());
        assert_eq!(queue.message_count(), 2);
        assert_eq!(queue.delivering_count(), 0);
    }

    #[test]
    fn no_match_scans_further() {
        let (queue, _, _) = queue_with(AddressSettings::default());
        let consumer = TestConsumer::with_filter(1, Some("color = 'red'"));
        queue.add_consumer(consumer.clone());
        let blue = reference_to(&queue, Message::new("testaddress", "b").with_header("color", "blue"));
        let red = reference_to(&queue, Message::new("testaddress", "r").with_header("color", "red"));
        let red_id = red.message_id();
        queue.add_last(blue);
        queue.add_last(red);
        queue.deliver();
        assert_eq!(consumer.received(), vec![red_id]);
        assert_eq!(queue.list(None).len(), 1);
    }

    #[test]
    fn higher_priority_is_delivered_first() {
        let (queue, _, _) = queue_with(AddressSettings::default());
        let low = reference_to(&queue, Message::new("testaddress", "l").with_priority(1));
        let high = reference_to(&queue, Message::new("testaddress", "h").with_priority(8));
        let (low_id, high_id) = (low.message_id(), high.message_id());
        queue.add_last(low);
        queue.add_last(high);
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(consumer.received(), vec![high_id, low_id]);
    }

    #[test]
    fn cancel_redelivers_then_dead_letters() {
        let (queue, sink, _) = queue_with(AddressSettings {
            max_delivery_attempts: Some(3),
            dead_letter_address: Some("dlq".into()),
            ..AddressSettings::default()
        });
        let id = add(&queue, "poison");
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        for attempt in 1..=3 {
            queue.deliver();
            assert_eq!(consumer.received().len(), attempt);
            let reference = queue.delivering_reference(id).unwrap();
            queue.cancel(reference).unwrap();
        }
        assert_eq!(*sink.moved.lock().unwrap(), vec![(id, "dlq".to_string())]);
        assert_eq!(*sink.counts.lock().unwrap(), vec![(id, 1), (id, 2)]);
        assert_eq!(queue.message_count(), 0);
        queue.deliver();
        assert_eq!(consumer.received().len(), 3);
    }

    #[test]
    fn redelivery_delay_reschedules() {
        let (queue, _, clock) = queue_with(AddressSettings {
            redelivery_delay_ms: Some(500),
            ..AddressSettings::default()
        });
        let id = add(&queue, "m");
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        queue.cancel(queue.delivering_reference(id).unwrap()).unwrap();
        assert_eq!(queue.scheduled_count(), 1);
        queue.deliver();
        assert_eq!(consumer.received().len(), 1);

        clock.advance(500);
        assert_eq!(queue.promote_scheduled(clock.now_millis()), 1);
        queue.deliver();
        assert_eq!(consumer.received(), vec![id, id]);
    }

    #[test]
    fn scheduled_references_wait_for_their_time() {
        let (queue, _, clock) = queue_with(AddressSettings::default());
        let later = reference_to(
            &queue,
            Message::new("testaddress", "later").with_header(HDR_SCHEDULED_DELIVERY_TIME, 5_000i64),
        );
        let later_id = later.message_id();
        queue.add_last(later);
        let now_id = add(&queue, "now");
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(consumer.received(), vec![now_id]);
        assert_eq!(queue.next_scheduled(), Some(5_000));
        assert_eq!(queue.message_count(), 2);

        clock.set(5_000);
        queue.promote_scheduled(clock.now_millis());
        queue.deliver();
        assert_eq!(consumer.received(), vec![now_id, later_id]);
    }

    #[test]
    fn expired_references_move_to_expiry_address() {
        let (queue, sink, clock) = queue_with(AddressSettings {
            expiry_address: Some("expired".into()),
            ..AddressSettings::default()
        });
        let reference = reference_to(&queue, Message::new("testaddress", "old").with_expiration(2_000));
        let id = reference.message_id();
        queue.add_last(reference);
        clock.set(2_000);
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert!(consumer.received().is_empty());
        assert_eq!(*sink.moved.lock().unwrap(), vec![(id, "expired".to_string())]);
    }

    #[test]
    fn full_queue_is_busy() {
        let (queue, _, _) = queue_with(AddressSettings {
            max_size_messages: Some(2),
            ..AddressSettings::default()
        });
        add(&queue, "a");
        add(&queue, "b");
        assert!(queue.is_full());
        let extra = reference_to(&queue, Message::new("testaddress", "c"));
        assert_eq!(queue.add_last(extra), HandleStatus::Busy);
        assert_eq!(queue.messages_added(), 2);
    }

    #[test]
    fn failing_consumer_is_removed_and_reference_kept() {
        let (queue, _, _) = queue_with(AddressSettings::default());
        let broken = TestConsumer::new(1);
        broken.fail.store(true, Ordering::SeqCst);
        let healthy = TestConsumer::new(2);
        queue.add_consumer(broken.clone());
        queue.add_consumer(healthy.clone());
        let id = add(&queue, "m");
        queue.deliver();
        assert_eq!(queue.consumer_count(), 1);
        assert_eq!(healthy.received(), vec![id]);
    }

    #[test]
    fn remove_references_by_filter() {
        let (queue, sink, _) = queue_with(AddressSettings::default());
        for color in ["red", "blue", "red"] {
            let reference = reference_to(&queue, Message::new("testaddress", "x").with_header("color", color));
            queue.add_last(reference);
        }
        let red = Filter::parse("color = 'red'").unwrap();
        assert_eq!(queue.list(Some(&red)).len(), 2);
        assert_eq!(queue.remove_references(Some(&red)).unwrap(), 2);
        assert_eq!(queue.message_count(), 1);
        assert_eq!(sink.acked.lock().unwrap().len(), 2);
    }

    struct SlowConsumer {
        queue: Mutex<Option<Arc<Queue>>>,
        received: Mutex<Vec<u64>>,
    }

    impl Consumer for SlowConsumer {
        fn id(&self) -> u64 {
            7
        }

        fn handle(&self, _reference: &MessageReference) -> HandleStatus {
            HandleStatus::Handled
        }

        fn deliver(&self, reference: MessageReference) -> Result<()> {
            std::thread::sleep(std::time::Duration::from_micros(200));
            self.received.lock().unwrap().push(reference.message_id());
            // a handoff that triggers delivery on the same queue
            if let Some(queue) = self.queue.lock().unwrap().as_ref() {
                queue.deliver();
            }
            Ok(())
        }
    }

    #[test]
    fn concurrent_deliveries_keep_handoff_order() {
        let (queue, _, _) = queue_with(AddressSettings::default());
        let queue = Arc::new(queue);
        let consumer = Arc::new(SlowConsumer {
            queue: Mutex::new(Some(Arc::clone(&queue))),
            received: Mutex::new(Vec::new()),
        });
        queue.add_consumer(consumer.clone());

        let done = Arc::new(AtomicBool::new(false));
        let deliverers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        queue.deliver();
                    }
                })
            })
            .collect();
        let ids: Vec<u64> = (0..200).map(|_| add(&queue, "m")).collect();
        queue.deliver();
        done.store(true, Ordering::SeqCst);
        for handle in deliverers {
            handle.join().unwrap();
        }
        queue.deliver();

        assert_eq!(*consumer.received.lock().unwrap(), ids);
        assert_eq!(queue.delivering_count(), 200);
        consumer.queue.lock().unwrap().take();
    }
}
