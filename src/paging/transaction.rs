use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::storage::PageTransactionRecord;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTransactionState {
    /// Messages are paged but the transaction has not resolved.
    Pending,
    Complete,
    Forgotten,
}

/// Bookkeeping for messages a transaction paged.
///
/// The depager must not re-route a paged transactional message until the
/// transaction resolved, so it parks in [`wait_completion`] until
/// [`complete`] or [`forget`] is called.
///
/// [`wait_completion`]: PageTransactionInfo::wait_completion
/// [`complete`]: PageTransactionInfo::complete
/// [`forget`]: PageTransactionInfo::forget
#[derive(Debug)]
pub struct PageTransactionInfo {
    record_id: u64,
    tx_id: u64,
    messages: AtomicU32,
    state: Mutex<PageTransactionState>,
    resolved: Condvar,
}

impl PageTransactionInfo {
    pub fn new(record_id: u64, tx_id: u64) -> Self {
        Self {
            record_id,
            tx_id,
            messages: AtomicU32::new(0),
            state: Mutex::new(PageTransactionState::Pending),
            resolved: Condvar::new(),
        }
    }

    /// Rebuilds the info of a committed (`complete`) or prepared transaction
    /// from its journal record.
    pub fn recovered(record: &PageTransactionRecord, complete: bool) -> Self {
        let info = Self::new(record.id, record.tx_id);
        info.messages.store(record.message_count, Ordering::SeqCst);
        if complete {
            info.complete();
        }
        info
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    pub fn message_count(&self) -> u32 {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> u32 {
        self.messages.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Counts one depaged message, returning how many remain.
    pub fn decrement(&self) -> Result<u32> {
        self.messages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| Error::illegal_state(format!("page transaction {} went negative", self.tx_id)))
    }

    pub fn to_record(&self) -> PageTransactionRecord {
        PageTransactionRecord {
            id: self.record_id,
            tx_id: self.tx_id,
            message_count: self.message_count(),
        }
    }

    pub fn state(&self) -> PageTransactionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn complete(&self) {
        self.resolve(PageTransactionState::Complete);
    }

    /// Releases waiters of a rolled back transaction; its messages are
    /// skipped.
    pub fn forget(&self) {
        self.resolve(PageTransactionState::Forgotten);
    }

    fn resolve(&self, to: PageTransactionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = to;
        self.resolved.notify_all();
    }

    /// Blocks until the transaction resolves. Returns true when it committed.
    pub fn wait_completion(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state == PageTransactionState::Pending {
            state = self.resolved.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        *state == PageTransactionState::Complete
    }

    /// Like [`wait_completion`](Self::wait_completion) with a deadline.
    /// Returns `None` if the transaction is still pending.
    pub fn wait_completion_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *state == PageTransactionState::Pending {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .resolved
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        Some(*state == PageTransactionState::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waiters_wake_on_complete() {
        let info = Arc::new(PageTransactionInfo::new(1, 2));
        let waiter = {
            let info = Arc::clone(&info);
            thread::spawn(move || info.wait_completion())
        };
        thread::sleep(Duration::from_millis(20));
        info.complete();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn forget_releases_without_completing() {
        let info = PageTransactionInfo::new(1, 2);
        assert_eq!(info.wait_completion_timeout(Duration::from_millis(10)), None);
        info.forget();
        assert_eq!(info.wait_completion_timeout(Duration::from_millis(10)), Some(false));
        assert!(!info.wait_completion());
    }

    #[test]
    fn counts_cannot_go_negative() {
        let info = PageTransactionInfo::new(1, 2);
        info.increment();
        assert_eq!(info.decrement().unwrap(), 0);
        assert!(info.decrement().is_err());

        let recovered = PageTransactionInfo::recovered(&info.to_record(), true);
        assert_eq!(recovered.state(), PageTransactionState::Complete);
    }
}
