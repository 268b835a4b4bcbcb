use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::error::XaCode;
use crate::transaction::{Transaction, TransactionState, Xid};
use crate::{Error, Result};

/// XA transactions of one broker, by XID.
pub struct ResourceManager {
    transactions: Mutex<HashMap<Xid, Arc<Transaction>>>,
    default_timeout_ms: AtomicU64,
}

impl ResourceManager {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            default_timeout_ms: AtomicU64::new(default_timeout_ms),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Xid, Arc<Transaction>>> {
        self.transactions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_default_timeout_ms(&self, timeout_ms: u64) {
        self.default_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn put(&self, xid: Xid, transaction: Arc<Transaction>) -> Result<()> {
        let mut transactions = self.lock();
        if transactions.contains_key(&xid) {
            return Err(Error::xa(XaCode::DuplicateXid, format!("{xid:?} already exists")));
        }
        transactions.insert(xid, transaction);
        Ok(())
    }

    pub fn get(&self, xid: &Xid) -> Option<Arc<Transaction>> {
        self.lock().get(xid).cloned()
    }

    pub fn remove(&self, xid: &Xid) -> Option<Arc<Transaction>> {
        self.lock().remove(xid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// XIDs of prepared transactions waiting for a coordinator.
    pub fn in_doubt_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .lock()
            .iter()
            .filter(|(_, tx)| tx.state() == TransactionState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect();
        xids.sort_by(|a, b| {
            (a.format_id, &a.global_transaction_id, &a.branch_qualifier)
                .cmp(&(b.format_id, &b.global_transaction_id, &b.branch_qualifier))
        });
        xids
    }

    fn prepared(&self, xid: &Xid) -> Result<Arc<Transaction>> {
        let tx = self
            .get(xid)
            .ok_or_else(|| Error::xa(XaCode::NoTransaction, format!("unknown {xid:?}")))?;
        if tx.state() != TransactionState::Prepared {
            return Err(Error::xa(XaCode::Protocol, format!("{xid:?} is not prepared")));
        }
        Ok(tx)
    }

    pub fn commit_prepared(&self, xid: &Xid) -> Result<()> {
        let tx = self.prepared(xid)?;
        tx.commit()?;
        self.remove(xid);
        info!("committed in-doubt transaction {xid:?}");
        Ok(())
    }

    pub fn rollback_prepared(&self, xid: &Xid) -> Result<()> {
        let tx = self.prepared(xid)?;
        tx.rollback()?;
        self.remove(xid);
        info!("rolled back in-doubt transaction {xid:?}");
        Ok(())
    }

    /// Rolls back and forgets every active transaction past its timeout.
    /// Returns how many were reaped.
    pub fn reap_timed_out(&self, now_ms: u64) -> usize {
        let expired: Vec<(Xid, Arc<Transaction>)> = self
            .lock()
            .iter()
            .filter(|(_, tx)| tx.is_timed_out(now_ms))
            .map(|(xid, tx)| (xid.clone(), Arc::clone(tx)))
            .collect();
        for (xid, tx) in &expired {
            warn!("rolling back {xid:?} after {} ms timeout", tx.timeout_ms());
            if let Err(err) = tx.rollback() {
                warn!("timeout rollback of {xid:?} failed: {err}");
            }
            self.remove(xid);
        }
        expired.len()
    }
}
