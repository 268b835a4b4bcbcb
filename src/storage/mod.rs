//! Persistence facade over the journal.
//!
//! The broker never writes journal records directly. It goes through
//! [`StorageManager`], which knows how messages, references, bindings, page
//! transactions and duplicate ids map onto ADD/UPDATE/DELETE records, and how
//! to turn a replayed journal back into broker state.

mod journal_storage;
mod null;
pub mod records;

use crate::message::Message;
use crate::Result;

pub use journal_storage::JournalStorageManager;
pub use null::NullStorageManager;
pub use records::{BindingRecord, DuplicateIdRecord, PageTransactionRecord};

/// A durable reference recovered from the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedReference {
    pub queue_id: u64,
    pub delivery_count: u32,
    pub scheduled_delivery: u64,
}

#[derive(Debug, Clone)]
pub struct LoadedMessage {
    pub message: Message,
    pub references: Vec<LoadedReference>,
}

/// Contents of a transaction prepared before the broker stopped.
#[derive(Debug, Clone, Default)]
pub struct PreparedRecord {
    pub tx_id: u64,
    /// Opaque prepare payload, the encoded XID.
    pub data: Vec<u8>,
    pub messages: Vec<Message>,
    /// (queue id, message id, scheduled delivery)
    pub references: Vec<(u64, u64, u64)>,
    /// (queue id, message id)
    pub acknowledgements: Vec<(u64, u64)>,
    pub deleted_messages: Vec<u64>,
    pub page_transactions: Vec<PageTransactionRecord>,
    pub duplicate_ids: Vec<DuplicateIdRecord>,
}

/// Everything the broker rebuilds at startup.
#[derive(Debug, Clone, Default)]
pub struct LoadedState {
    pub bindings: Vec<BindingRecord>,
    pub messages: Vec<LoadedMessage>,
    pub prepared: Vec<PreparedRecord>,
    pub page_transactions: Vec<PageTransactionRecord>,
    pub duplicate_ids: Vec<DuplicateIdRecord>,
}

impl LoadedState {
    /// Ids of every message recovered from the journal, committed or prepared.
    pub fn message_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.messages
            .iter()
            .map(|m| m.message.id)
            .chain(self.prepared.iter().flat_map(|p| p.messages.iter().map(|m| m.id)))
    }
}

pub trait StorageManager: Send + Sync {
    /// Replays storage. Called once, before any other method.
    fn load(&self) -> Result<LoadedState>;

    fn is_persistent(&self) -> bool;

    /// Unique, increasing ids for messages, queues, transactions and records.
    fn generate_id(&self) -> Result<u64>;

    fn store_message(&self, message: &Message) -> Result<()>;
    fn store_reference(&self, queue_id: u64, message_id: u64, scheduled_delivery: u64) -> Result<()>;
    fn store_acknowledge(&self, queue_id: u64, message_id: u64) -> Result<()>;
    fn update_delivery_count(&self, queue_id: u64, message_id: u64, count: u32) -> Result<()>;
    fn delete_message(&self, message_id: u64) -> Result<()>;

    fn store_message_transactional(&self, tx_id: u64, message: &Message) -> Result<()>;
    fn store_reference_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
        scheduled_delivery: u64,
    ) -> Result<()>;
    fn store_acknowledge_transactional(&self, tx_id: u64, queue_id: u64, message_id: u64) -> Result<()>;
    fn delete_message_transactional(&self, tx_id: u64, message_id: u64) -> Result<()>;

    fn prepare(&self, tx_id: u64, data: &[u8]) -> Result<()>;
    fn commit(&self, tx_id: u64) -> Result<()>;
    fn rollback(&self, tx_id: u64) -> Result<()>;

    fn store_page_transaction(&self, tx_id: u64, record: &PageTransactionRecord) -> Result<()>;
    fn delete_page_transaction(&self, record_id: u64) -> Result<()>;

    fn store_duplicate_id(&self, record: &DuplicateIdRecord, tx_id: Option<u64>) -> Result<()>;
    fn delete_duplicate_id(&self, record_id: u64) -> Result<()>;

    fn add_binding(&self, binding: &BindingRecord) -> Result<()>;
    fn delete_binding(&self, queue_id: u64) -> Result<()>;

    fn stop(&self) {}
}
