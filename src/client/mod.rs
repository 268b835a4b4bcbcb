//! Thin client API over a [`Channel`](crate::remoting::Channel).
//!
//! Everything that can fail on the broker is a blocking call, except sends
//! of non-durable messages, which are one-way unless the session asks for
//! blocking sends. Deliveries are buffered per consumer by the connection's
//! reader thread and taken with [`ClientConsumer::receive`].

mod connection;
mod session;

use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;
use crate::remoting::QueueQueryResult;
use crate::transaction::Xid;
use crate::Result;

pub use connection::{connect_in_vm, connect_tcp, CoreConnection};
pub use session::{ClientMessage, CoreBrowser, CoreConsumer, CoreProducer, CoreSession};

/// Deliveries a consumer lets the broker push ahead of `receive`.
pub const DEFAULT_CONSUMER_WINDOW_SIZE: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub xa: bool,
    pub auto_commit_sends: bool,
    pub auto_commit_acks: bool,
    /// Wait for the broker to route non-durable messages too.
    pub block_on_non_durable_send: bool,
    /// Window of consumers created with [`ClientSession::create_consumer`].
    /// Negative turns flow control off.
    pub consumer_window_size: i32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            xa: false,
            auto_commit_sends: true,
            auto_commit_acks: true,
            block_on_non_durable_send: false,
            consumer_window_size: DEFAULT_CONSUMER_WINDOW_SIZE,
        }
    }
}

impl SessionOptions {
    /// Sends and acknowledgements wait for `commit`.
    pub fn transacted() -> Self {
        Self {
            auto_commit_sends: false,
            auto_commit_acks: false,
            ..Self::default()
        }
    }

    pub fn xa() -> Self {
        Self {
            xa: true,
            ..Self::default()
        }
    }
}

pub trait ClientConnection: Send + Sync {
    fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn ClientSession>>;

    /// Starts delivery to every consumer of the connection.
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Closes every session and the underlying connection.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

pub trait ClientSession: Send + Sync {
    fn create_queue(
        &self,
        address: &str,
        queue_name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<()>;

    fn delete_queue(&self, queue_name: &str) -> Result<()>;

    fn queue_query(&self, queue_name: &str) -> Result<QueueQueryResult>;

    /// A producer bound to `address`, or an anonymous one for
    /// [`ClientProducer::send_to`] when `None`.
    fn create_producer(&self, address: Option<&str>) -> Result<Box<dyn ClientProducer>>;

    fn create_consumer(&self, queue_name: &str, filter: Option<&str>) -> Result<Box<dyn ClientConsumer>>;

    /// A consumer the broker sends at most `window_size` messages ahead of
    /// what it has received. Negative turns flow control off.
    fn create_consumer_with_window(
        &self,
        queue_name: &str,
        filter: Option<&str>,
        window_size: i32,
    ) -> Result<Box<dyn ClientConsumer>>;

    /// Walks a queue's pending messages without consuming them.
    fn create_browser(&self, queue_name: &str, filter: Option<&str>) -> Result<Box<dyn ClientBrowser>>;

    fn commit(&self) -> Result<()>;

    /// Rolls back and redelivers everything not acknowledged.
    fn rollback(&self) -> Result<()>;

    fn xa_start(&self, xid: &Xid) -> Result<()>;
    fn xa_end(&self, xid: &Xid, failed: bool) -> Result<()>;
    fn xa_prepare(&self, xid: &Xid) -> Result<()>;
    fn xa_commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;
    fn xa_rollback(&self, xid: &Xid) -> Result<()>;
    fn xa_join(&self, xid: &Xid) -> Result<()>;
    fn xa_suspend(&self) -> Result<()>;
    fn xa_resume(&self, xid: &Xid) -> Result<()>;
    fn xa_forget(&self, xid: &Xid) -> Result<()>;
    /// XIDs of prepared branches the broker holds.
    fn xa_recover(&self) -> Result<Vec<Xid>>;
    fn xa_set_timeout(&self, seconds: u32) -> Result<bool>;
    fn xa_get_timeout(&self) -> Result<u32>;

    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

pub trait ClientProducer: Send + Sync {
    /// Sends to the producer's address.
    fn send(&self, message: Message) -> Result<()>;

    fn send_to(&self, address: &str, message: Message) -> Result<()>;

    fn close(&self) -> Result<()>;
}

pub trait ClientConsumer: Send + Sync {
    fn id(&self) -> u64;

    /// Waits up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> Result<Option<ClientMessage>>;

    /// The next buffered message, without waiting.
    fn receive_immediate(&self) -> Result<Option<ClientMessage>>;

    /// Closes the consumer. Unacknowledged messages go back to the queue.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

pub trait ClientBrowser: Send + Sync {
    fn has_next(&self) -> Result<bool>;

    /// The next pending message, or `None` at the end.
    fn next_message(&self) -> Result<Option<Message>>;

    /// Starts over from the queue's current contents.
    fn reset(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}
