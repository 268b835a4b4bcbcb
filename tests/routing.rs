use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use courier::clock::ManualClock;
use courier::config::{AddressSettings, BrokerConfig, DistributionPolicy};
use courier::journal::{self, Record};
use courier::message::{MessageReference, HDR_ORIGINAL_ADDRESS, HDR_ORIGINAL_QUEUE};
use courier::queue::{Consumer, HandleStatus};
use courier::server::AllowAllSecurityManager;
use courier::transaction::{Transaction, TransactionState};
use courier::{Broker, Error, Message, TypedValue};

struct Collector {
    id: u64,
    busy: AtomicBool,
    received: Mutex<Vec<MessageReference>>,
}

impl Collector {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            busy: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn take(&self) -> Vec<MessageReference> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }
}

impl Consumer for Collector {
    fn id(&self) -> u64 {
        self.id
    }

    fn handle(&self, _reference: &MessageReference) -> HandleStatus {
        if self.busy.load(Ordering::SeqCst) {
            HandleStatus::Busy
        } else {
            HandleStatus::Handled
        }
    }

    fn deliver(&self, reference: MessageReference) -> courier::Result<()> {
        self.received.lock().unwrap().push(reference);
        Ok(())
    }
}

fn config(dir: &Path, settings: BTreeMap<String, AddressSettings>) -> BrokerConfig {
    let mut config = BrokerConfig::with_data_dir(dir);
    config.journal.file_size = 64 * 1024;
    config.scheduler_tick_ms = 3_600_000;
    config.address_settings = settings;
    config
}

fn start(config: BrokerConfig) -> Arc<Broker> {
    Broker::start_with_clock(config, Arc::new(AllowAllSecurityManager), Arc::new(ManualClock::new(1_000)))
        .expect("broker")
}

#[test]
fn every_binding_gets_a_reference_and_the_message_is_deleted_once() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), BTreeMap::new());
    let message_id;
    {
        let broker = start(cfg.clone());
        let post_office = broker.post_office();
        let queues = vec![
            post_office.add_binding("orders", "q1", None, true, false).unwrap(),
            post_office.add_binding("orders", "q2", None, true, false).unwrap(),
            post_office.add_binding("orders", "q3", None, false, false).unwrap(),
            post_office.add_binding("#", "audit", None, true, false).unwrap(),
        ];
        post_office.add_binding("invoices", "elsewhere", None, true, false).unwrap();

        let result = post_office
            .route(Message::new("orders", "payload").with_durable(true), None)
            .unwrap();
        message_id = result.message_id;
        assert_eq!(result.queues, 4);
        for queue in &queues {
            assert_eq!(queue.message_count(), 1, "queue {}", queue.name());
        }
        assert_eq!(post_office.queue("elsewhere").unwrap().message_count(), 0);

        let pending = queues[0].list(None);
        assert_eq!(pending[0].message().ref_count(), 4);
        assert_eq!(pending[0].message().durable_ref_count(), 3);

        for (n, queue) in queues.iter().enumerate() {
            let consumer = Collector::new(n as u64);
            queue.add_consumer(consumer.clone());
            queue.deliver();
            let delivered = consumer.take();
            assert_eq!(delivered.len(), 1);
            queue.acknowledge(delivered[0].message_id()).unwrap();
            assert_eq!(queue.message_count(), 0);
        }
        broker.stop();
    }

    let (records, _) = journal::scan(&cfg.journal.directory, &cfg.journal.file_extension).unwrap();
    let deletes = records
        .iter()
        .filter(|r| matches!(r.record, Record::Delete { id } if id == message_id))
        .count();
    assert_eq!(deletes, 1);

    let broker = start(cfg);
    for name in ["q1", "q2", "audit"] {
        assert_eq!(broker.post_office().queue(name).unwrap().message_count(), 0);
    }
    assert!(broker.post_office().queue("q3").is_none());
}

#[test]
fn round_robin_spreads_messages_evenly() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), BTreeMap::new()));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("work", "jobs", None, false, false).unwrap();
    let consumers: Vec<Arc<Collector>> = (1..=3).map(Collector::new).collect();
    for consumer in &consumers {
        queue.add_consumer(consumer.clone());
    }

    for i in 0..12 {
        post_office.route(Message::new("work", format!("job {i}")), None).unwrap();
    }
    for consumer in &consumers {
        assert_eq!(consumer.count(), 4, "consumer {}", consumer.id);
    }
    assert_eq!(queue.delivering_count(), 12);
}

#[test]
fn first_available_prefers_the_first_free_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let settings = BTreeMap::from([(
        "work".to_string(),
        AddressSettings {
            distribution: Some(DistributionPolicy::FirstAvailable),
            ..AddressSettings::default()
        },
    )]);
    let broker = start(config(dir.path(), settings));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("work", "jobs", None, false, false).unwrap();
    let first = Collector::new(1);
    let second = Collector::new(2);
    queue.add_consumer(first.clone());
    queue.add_consumer(second.clone());

    for i in 0..4 {
        post_office.route(Message::new("work", format!("job {i}")), None).unwrap();
    }
    assert_eq!((first.count(), second.count()), (4, 0));

    first.busy.store(true, Ordering::SeqCst);
    post_office.route(Message::new("work", "overflow"), None).unwrap();
    assert_eq!(second.count(), 1);
}

#[test]
fn busy_consumers_leave_messages_pending() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), BTreeMap::new()));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("work", "jobs", None, false, false).unwrap();
    let consumer = Collector::new(1);
    consumer.busy.store(true, Ordering::SeqCst);
    queue.add_consumer(consumer.clone());

    for i in 0..3 {
        post_office.route(Message::new("work", format!("job {i}")), None).unwrap();
    }
    assert_eq!(consumer.count(), 0);
    assert_eq!(queue.message_count(), 3);

    consumer.busy.store(false, Ordering::SeqCst);
    queue.deliver();
    assert_eq!(consumer.count(), 3);
}

#[test]
fn exhausted_redeliveries_move_to_the_dead_letter_address() {
    let dir = tempfile::tempdir().unwrap();
    let settings = BTreeMap::from([(
        "orders".to_string(),
        AddressSettings {
            max_delivery_attempts: Some(3),
            dead_letter_address: Some("dlq".to_string()),
            ..AddressSettings::default()
        },
    )]);
    let broker = start(config(dir.path(), settings));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("orders", "q1", None, true, false).unwrap();
    let dead_letters = post_office.add_binding("dlq", "dead", None, true, false).unwrap();
    let consumer = Collector::new(1);
    queue.add_consumer(consumer.clone());

    let id = post_office
        .route(Message::new("orders", "poison").with_durable(true), None)
        .unwrap()
        .message_id;

    for attempt in 1..=3u32 {
        let delivered = consumer.take();
        assert_eq!(delivered.len(), 1, "attempt {attempt}");
        assert_eq!(delivered[0].delivery_count, attempt - 1);
        queue.cancel(delivered[0].clone()).unwrap();
        queue.deliver();
    }

    assert_eq!(consumer.count(), 0);
    assert_eq!(queue.message_count(), 0);
    let dead = dead_letters.list(None);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id(), id);
    let message = dead[0].message().snapshot();
    assert_eq!(message.header(HDR_ORIGINAL_ADDRESS), Some(&TypedValue::from("orders")));
    assert_eq!(message.header(HDR_ORIGINAL_QUEUE), Some(&TypedValue::from("q1")));
}

#[test]
fn committing_twice_does_not_apply_twice() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), BTreeMap::new()));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("orders", "q1", None, true, false).unwrap();
    let tx = Transaction::new(Arc::clone(broker.storage()), Arc::clone(post_office), None, 0, 1_000).unwrap();

    post_office
        .route(Message::new("orders", "once").with_durable(true), Some(&tx))
        .unwrap();
    assert_eq!(queue.message_count(), 0);

    tx.commit().unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(queue.message_count(), 1);

    assert!(matches!(tx.commit(), Err(Error::TransactionRolledBack(_))));
    assert!(matches!(tx.prepare(), Err(Error::TransactionRolledBack(_))));
    assert_eq!(queue.message_count(), 1);
}

#[test]
fn rollback_returns_acknowledged_references() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), BTreeMap::new()));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("orders", "q1", None, false, false).unwrap();
    let consumer = Collector::new(1);
    queue.add_consumer(consumer.clone());
    post_office.route(Message::new("orders", "a"), None).unwrap();

    let delivered = consumer.take();
    let tx = Transaction::new(Arc::clone(broker.storage()), Arc::clone(post_office), None, 0, 1_000).unwrap();
    tx.acknowledge(Arc::clone(&queue), delivered[0].clone()).unwrap();
    tx.rollback().unwrap();
    tx.rollback().unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);

    queue.deliver();
    let redelivered = consumer.take();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].message_id(), delivered[0].message_id());
    assert_eq!(redelivered[0].delivery_count, 1);
}

#[test]
fn wildcards_and_filters_select_bindings() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), BTreeMap::new()));
    let post_office = broker.post_office();
    let all = post_office.add_binding("news.#", "all", None, false, false).unwrap();
    let sport = post_office.add_binding("news.*.sport", "sport", None, false, false).unwrap();
    let urgent = post_office
        .add_binding("news.#", "urgent", Some("priority > 6"), false, false)
        .unwrap();

    post_office
        .route(Message::new("news.uk.sport", "goal").with_priority(9), None)
        .unwrap();
    post_office.route(Message::new("news.uk.politics", "vote"), None).unwrap();
    post_office.route(Message::new("news", "headline"), None).unwrap();
    post_office.route(Message::new("weather", "rain"), None).unwrap();

    assert_eq!(all.message_count(), 3);
    assert_eq!(sport.message_count(), 1);
    assert_eq!(urgent.message_count(), 1);
}

#[test]
fn duplicate_ids_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), BTreeMap::new()));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("orders", "q1", None, false, false).unwrap();
    let message = || Message::new("orders", "x").with_header(courier::message::HDR_DUPLICATE_DETECTION_ID, "order-17");

    assert!(!post_office.route(message(), None).unwrap().duplicate);
    assert!(post_office.route(message(), None).unwrap().duplicate);
    assert_eq!(queue.message_count(), 1);
}
