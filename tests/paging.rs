use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use courier::clock::ManualClock;
use courier::config::{AddressSettings, BrokerConfig};
use courier::message::MessageReference;
use courier::paging::PagingStore;
use courier::queue::{Consumer, HandleStatus};
use courier::server::AllowAllSecurityManager;
use courier::transaction::Transaction;
use courier::{Broker, Message};

const FLUSH: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Collector {
    received: Mutex<Vec<MessageReference>>,
}

impl Collector {
    fn take(&self) -> Vec<MessageReference> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }

    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl Consumer for Collector {
    fn id(&self) -> u64 {
        1
    }

    fn handle(&self, _reference: &MessageReference) -> HandleStatus {
        HandleStatus::Handled
    }

    fn deliver(&self, reference: MessageReference) -> courier::Result<()> {
        self.received.lock().unwrap().push(reference);
        Ok(())
    }
}

fn config(dir: &Path, page_max_messages: usize) -> BrokerConfig {
    let mut config = BrokerConfig::with_data_dir(dir);
    config.journal.file_size = 64 * 1024;
    config.scheduler_tick_ms = 3_600_000;
    config.address_settings = BTreeMap::from([(
        "paged".to_string(),
        AddressSettings {
            page_max_messages: Some(page_max_messages),
            ..AddressSettings::default()
        },
    )]);
    config
}

fn start(config: BrokerConfig) -> Arc<Broker> {
    Broker::start_with_clock(config, Arc::new(AllowAllSecurityManager), Arc::new(ManualClock::new(1_000)))
        .expect("broker")
}

fn page_files(store: &PagingStore) -> usize {
    std::fs::read_dir(store.directory())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "address")
        .count()
}

fn bodies(references: &[MessageReference]) -> Vec<String> {
    references
        .iter()
        .map(|r| String::from_utf8(r.message().snapshot().body.to_vec()).unwrap())
        .collect()
}

fn acknowledge_all(queue: &courier::queue::Queue, references: &[MessageReference]) {
    for reference in references {
        queue.acknowledge(reference.message_id()).unwrap();
    }
}

#[test]
fn overflow_pages_and_comes_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), 2));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("paged", "q1", None, false, false).unwrap();

    let mut paged = 0;
    for i in 0..5 {
        if post_office.route(Message::new("paged", format!("m{i}")), None).unwrap().paged {
            paged += 1;
        }
    }
    let store = broker.paging().store("paged").expect("store");
    assert_eq!(paged, 3);
    assert_eq!(queue.message_count(), 2);
    assert_eq!(store.memory_messages(), 2);
    assert!(store.is_paging());
    assert_eq!(store.page_count(), 1);

    let consumer = Arc::new(Collector::default());
    queue.add_consumer(consumer.clone());
    queue.deliver();
    let mut received = consumer.take();
    assert_eq!(bodies(&received), vec!["m0", "m1"]);
    acknowledge_all(&queue, &received);

    assert!(store.flush_executor(FLUSH));
    let depaged = consumer.take();
    acknowledge_all(&queue, &depaged);
    received.extend(depaged);
    assert!(store.flush_executor(FLUSH));

    assert_eq!(bodies(&received), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(queue.message_count(), 0);
    assert!(!store.is_paging());
    assert_eq!(store.page_count(), 0);
    assert_eq!(page_files(&store), 0);
}

#[test]
fn paged_messages_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 2);
    {
        let broker = start(cfg.clone());
        let post_office = broker.post_office();
        post_office.add_binding("paged", "q1", None, true, false).unwrap();
        for i in 0..5 {
            post_office
                .route(Message::new("paged", format!("m{i}")).with_durable(true), None)
                .unwrap();
        }
        assert_eq!(broker.paging().store("paged").unwrap().page_count(), 1);
        broker.stop();
    }

    let broker = start(cfg);
    let store = broker.paging().store("paged").expect("store reopened");
    assert!(store.flush_executor(FLUSH));
    let queue = broker.post_office().queue("q1").unwrap();
    assert_eq!(queue.message_count(), 5);
    assert_eq!(store.page_count(), 0);

    let consumer = Arc::new(Collector::default());
    queue.add_consumer(consumer.clone());
    queue.deliver();
    assert_eq!(bodies(&consumer.take()), vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[test]
fn depage_waits_for_a_concurrent_commit() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), 1));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("paged", "q1", None, false, false).unwrap();
    post_office.route(Message::new("paged", "plain"), None).unwrap();

    let tx = Transaction::new(Arc::clone(broker.storage()), Arc::clone(post_office), None, 0, 1_000).unwrap();
    for i in 0..3 {
        let result = post_office
            .route(Message::new("paged", format!("tx{i}")), Some(&tx))
            .unwrap();
        assert!(result.paged);
    }
    assert_eq!(broker.paging().page_transaction_count(), 1);

    let consumer = Arc::new(Collector::default());
    queue.add_consumer(consumer.clone());
    queue.deliver();
    let plain = consumer.take();
    assert_eq!(bodies(&plain), vec!["plain"]);
    // Releasing the only in-memory message starts the depager, which has to
    // wait on the open transaction.
    acknowledge_all(&queue, &plain);

    let committer = {
        let tx = Arc::clone(&tx);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            tx.commit()
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(consumer.count(), 0);

    committer.join().unwrap().unwrap();
    let store = broker.paging().store("paged").unwrap();
    assert!(store.flush_executor(FLUSH));
    assert_eq!(bodies(&consumer.take()), vec!["tx0", "tx1", "tx2"]);
    assert_eq!(broker.paging().page_transaction_count(), 0);
    assert_eq!(page_files(&store), 0);
}

#[test]
fn depage_skips_rolled_back_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start(config(dir.path(), 1));
    let post_office = broker.post_office();
    let queue = post_office.add_binding("paged", "q1", None, false, false).unwrap();
    post_office.route(Message::new("paged", "plain"), None).unwrap();

    let tx = Transaction::new(Arc::clone(broker.storage()), Arc::clone(post_office), None, 0, 1_000).unwrap();
    post_office.route(Message::new("paged", "doomed"), Some(&tx)).unwrap();
    post_office.route(Message::new("paged", "after"), None).unwrap();
    tx.rollback().unwrap();

    let consumer = Arc::new(Collector::default());
    queue.add_consumer(consumer.clone());
    queue.deliver();
    let plain = consumer.take();
    acknowledge_all(&queue, &plain);

    let store = broker.paging().store("paged").unwrap();
    assert!(store.flush_executor(FLUSH));
    assert_eq!(bodies(&consumer.take()), vec!["after"]);
    assert_eq!(store.page_count(), 0);
}

#[test]
fn depaging_into_a_full_queue_keeps_every_message() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), 10);
    if let Some(settings) = cfg.address_settings.get_mut("paged") {
        settings.max_size_messages = Some(1);
    }
    let broker = start(cfg);
    let post_office = broker.post_office();
    let queue = post_office.add_binding("paged", "q1", None, false, false).unwrap();
    for i in 0..3 {
        post_office.route(Message::new("paged", format!("m{i}")), None).unwrap();
    }
    let store = broker.paging().store("paged").expect("store");
    assert_eq!(queue.message_count(), 1);
    assert_eq!(store.page_count(), 1);

    let consumer = Arc::new(Collector::default());
    queue.add_consumer(consumer.clone());
    queue.deliver();
    let mut received = consumer.take();
    acknowledge_all(&queue, &received);

    // The whole page comes back even though the queue only holds one.
    assert!(store.flush_executor(FLUSH));
    let depaged = consumer.take();
    acknowledge_all(&queue, &depaged);
    received.extend(depaged);
    assert!(store.flush_executor(FLUSH));

    assert_eq!(bodies(&received), vec!["m0", "m1", "m2"]);
    assert_eq!(queue.message_count(), 0);
    assert_eq!(store.page_count(), 0);
    assert_eq!(page_files(&store), 0);
}
