use std::sync::Arc;
use std::vec::IntoIter;

use crate::filter::Filter;
use crate::message::{Message, MessageReference};
use crate::queue::Queue;

/// A read-only cursor over a queue.
///
/// The cursor walks the references that were pending when it was created or
/// last reset. Browsing never delivers or acknowledges anything, and messages
/// acknowledged on this queue in the meantime are skipped, even while other
/// queues still hold them.
pub struct ServerBrowser {
    id: u64,
    queue: Arc<Queue>,
    filter: Option<Filter>,
    pending: IntoIter<MessageReference>,
}

impl ServerBrowser {
    pub fn new(id: u64, queue: Arc<Queue>, filter: Option<Filter>) -> Self {
        let pending = queue.list(filter.as_ref()).into_iter();
        Self {
            id,
            queue,
            filter,
            pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn next_message(&mut self) -> Option<Message> {
        let queue = &self.queue;
        self.pending
            .by_ref()
            .find(|reference| queue.holds(reference.message_id()))
            .map(|reference| reference.message().snapshot())
    }

    /// Starts over from the queue's current contents.
    pub fn reset(&mut self) {
        self.pending = self.queue.list(self.filter.as_ref()).into_iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::{queue_with, reference_to, TestConsumer};

    fn queue() -> Arc<Queue> {
        let (queue, _, _) = queue_with(Default::default());
        Arc::new(queue)
    }

    #[test]
    fn walks_a_snapshot_and_resets() {
        let queue = queue();
        for body in ["a", "b"] {
            let reference = reference_to(&queue, Message::new("q", body));
            queue.add_last(reference);
        }
        let filter = Filter::parse_optional(Some("priority >= 0")).unwrap();
        let mut browser = ServerBrowser::new(1, Arc::clone(&queue), filter);

        let first = browser.next_message().expect("first");
        assert_eq!(&first.body[..], b"a");
        queue.add_last(reference_to(&queue, Message::new("q", "c")));
        assert_eq!(&browser.next_message().expect("second").body[..], b"b");
        assert!(browser.next_message().is_none());

        browser.reset();
        let bodies: Vec<_> = std::iter::from_fn(|| browser.next_message())
            .map(|m| m.body.to_vec())
            .collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(queue.message_count(), 3);
    }

    #[test]
    fn skips_messages_acknowledged_on_this_queue() {
        let queue = queue();
        let shared = reference_to(&queue, Message::new("q", "shared"));
        // a second queue still references the message
        shared.message().increment_refs(false);
        let shared_id = shared.message_id();
        queue.add_last(shared);
        queue.add_last(reference_to(&queue, Message::new("q", "kept")));
        let mut browser = ServerBrowser::new(1, Arc::clone(&queue), None);

        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        queue.acknowledge(shared_id).unwrap();

        let next = browser.next_message().expect("kept");
        assert_eq!(&next.body[..], b"kept");
        assert!(browser.next_message().is_none());
    }
}
