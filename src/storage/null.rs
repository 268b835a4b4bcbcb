use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Message;
use crate::storage::{
    BindingRecord, DuplicateIdRecord, LoadedState, PageTransactionRecord, StorageManager,
};
use crate::Result;

/// Storage for brokers running with persistence disabled. Every write is
/// accepted and forgotten.
#[derive(Debug)]
pub struct NullStorageManager {
    next_id: AtomicU64,
}

impl Default for NullStorageManager {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl NullStorageManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageManager for NullStorageManager {
    fn load(&self) -> Result<LoadedState> {
        Ok(LoadedState::default())
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn generate_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn store_message(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn store_reference(&self, _queue_id: u64, _message_id: u64, _scheduled: u64) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn update_delivery_count(&self, _queue_id: u64, _message_id: u64, _count: u32) -> Result<()> {
        Ok(())
    }

    fn delete_message(&self, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_message_transactional(&self, _tx_id: u64, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn store_reference_transactional(
        &self,
        _tx_id: u64,
        _queue_id: u64,
        _message_id: u64,
        _scheduled: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge_transactional(&self, _tx_id: u64, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn delete_message_transactional(&self, _tx_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _tx_id: u64, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_page_transaction(&self, _tx_id: u64, _record: &PageTransactionRecord) -> Result<()> {
        Ok(())
    }

    fn delete_page_transaction(&self, _record_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_duplicate_id(&self, _record: &DuplicateIdRecord, _tx_id: Option<u64>) -> Result<()> {
        Ok(())
    }

    fn delete_duplicate_id(&self, _record_id: u64) -> Result<()> {
        Ok(())
    }

    fn add_binding(&self, _binding: &BindingRecord) -> Result<()> {
        Ok(())
    }

    fn delete_binding(&self, _queue_id: u64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nothing_is_loaded() {
        let storage = NullStorageManager::new();
        let a = storage.generate_id().unwrap();
        let b = storage.generate_id().unwrap();
        assert!(b > a);
        assert!(!storage.is_persistent());
        let state = storage.load().unwrap();
        assert!(state.bindings.is_empty() && state.messages.is_empty());
    }
}
