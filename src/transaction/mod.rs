//! Local and XA transactions.
//!
//! A transaction buffers the references it routes and the references it
//! acknowledges. Durable work is journaled under the transaction's id as it
//! happens; nothing becomes visible to consumers until commit. Acknowledgement
//! records are written at prepare, or at commit for one-phase transactions.

mod resource_manager;
mod xid;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use log::{debug, warn};

use crate::message::MessageReference;
use crate::paging::PageTransactionInfo;
use crate::postoffice::PostOffice;
use crate::queue::{HandleStatus, Queue};
use crate::storage::StorageManager;
use crate::{Error, Result};

pub use resource_manager::ResourceManager;
pub use xid::Xid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Active,
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Default)]
struct TxInner {
    state: TransactionState,
    refs_to_add: Vec<(Arc<Queue>, MessageReference)>,
    acknowledgements: Vec<(Arc<Queue>, MessageReference)>,
    page_transaction: Option<Arc<PageTransactionInfo>>,
    duplicates: Vec<(String, Bytes, u64)>,
    /// Something was written to the journal under this transaction's id.
    journaled: bool,
    acks_journaled: bool,
    rollback_only: bool,
}

pub struct Transaction {
    id: u64,
    xid: Option<Xid>,
    storage: Arc<dyn StorageManager>,
    post_office: Arc<PostOffice>,
    created_ms: u64,
    timeout_ms: AtomicU64,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub fn new(
        storage: Arc<dyn StorageManager>,
        post_office: Arc<PostOffice>,
        xid: Option<Xid>,
        timeout_ms: u64,
        now_ms: u64,
    ) -> Result<Arc<Self>> {
        let id = storage.generate_id()?;
        Ok(Arc::new(Self {
            id,
            xid,
            storage,
            post_office,
            created_ms: now_ms,
            timeout_ms: AtomicU64::new(timeout_ms),
            inner: Mutex::new(TxInner::default()),
        }))
    }

    /// A transaction found prepared in the journal at startup.
    pub(crate) fn recovered(
        id: u64,
        xid: Option<Xid>,
        storage: Arc<dyn StorageManager>,
        post_office: Arc<PostOffice>,
        now_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            xid,
            storage,
            post_office,
            created_ms: now_ms,
            timeout_ms: AtomicU64::new(0),
            inner: Mutex::new(TxInner {
                state: TransactionState::Prepared,
                journaled: true,
                acks_journaled: true,
                ..TxInner::default()
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, TxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// An active transaction older than its timeout. Prepared transactions
    /// never time out.
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        let timeout = self.timeout_ms();
        timeout > 0
            && now_ms.saturating_sub(self.created_ms) >= timeout
            && self.state() == TransactionState::Active
    }

    /// Marks the transaction so that commit turns into a rollback.
    pub fn mark_rollback_only(&self) {
        self.lock().rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.lock().rollback_only
    }

    fn active(inner: &TxInner, id: u64) -> Result<()> {
        match inner.state {
            TransactionState::Active => Ok(()),
            state => Err(Error::TransactionRolledBack(format!(
                "transaction {id} is {state:?}"
            ))),
        }
    }

    /// Holds a routed reference until commit.
    pub fn add_reference(&self, queue: Arc<Queue>, reference: MessageReference) -> Result<()> {
        let mut inner = self.lock();
        Self::active(&inner, self.id)?;
        inner.refs_to_add.push((queue, reference));
        Ok(())
    }

    pub(crate) fn mark_journaled(&self) {
        self.lock().journaled = true;
    }

    /// Records an acknowledgement. The reference stays in its queue's
    /// delivering table until the transaction ends.
    pub fn acknowledge(&self, queue: Arc<Queue>, reference: MessageReference) -> Result<()> {
        let mut inner = self.lock();
        Self::active(&inner, self.id)?;
        inner.acknowledgements.push((queue, reference));
        Ok(())
    }

    /// The page transaction of this transaction, registered with the paging
    /// manager on first use.
    pub fn page_transaction(&self) -> Result<Arc<PageTransactionInfo>> {
        let mut inner = self.lock();
        Self::active(&inner, self.id)?;
        if let Some(info) = &inner.page_transaction {
            return Ok(Arc::clone(info));
        }
        let info = Arc::new(PageTransactionInfo::new(self.storage.generate_id()?, self.id));
        self.post_office.paging().add_page_transaction(Arc::clone(&info));
        inner.page_transaction = Some(Arc::clone(&info));
        Ok(info)
    }

    pub(crate) fn set_page_transaction(&self, info: Arc<PageTransactionInfo>) {
        self.lock().page_transaction = Some(info);
    }

    pub(crate) fn add_duplicate(&self, address: String, id: Bytes, record_id: u64) {
        self.lock().duplicates.push((address, id, record_id));
    }

    pub(crate) fn add_recovered_reference(&self, queue: Arc<Queue>, reference: MessageReference) {
        self.lock().refs_to_add.push((queue, reference));
    }

    pub(crate) fn add_recovered_acknowledgement(&self, queue: Arc<Queue>, reference: MessageReference) {
        self.lock().acknowledgements.push((queue, reference));
    }

    /// Number of references routed and acknowledged so far.
    pub fn operation_count(&self) -> usize {
        let inner = self.lock();
        inner.refs_to_add.len() + inner.acknowledgements.len()
    }

    fn journal_acknowledgements(&self, inner: &mut TxInner) -> Result<()> {
        if inner.acks_journaled {
            return Ok(());
        }
        for (queue, reference) in &inner.acknowledgements {
            if !reference.is_durable() || !self.storage.is_persistent() {
                continue;
            }
            let message_id = reference.message_id();
            self.storage
                .store_acknowledge_transactional(self.id, queue.id(), message_id)?;
            if reference.message().decrement_durable_refs() == 0 {
                self.storage.delete_message_transactional(self.id, message_id)?;
            }
            inner.journaled = true;
        }
        if let Some(info) = inner.page_transaction.as_ref().filter(|i| i.message_count() > 0) {
            self.storage.store_page_transaction(self.id, &info.to_record())?;
            inner.journaled = true;
        }
        inner.acks_journaled = true;
        Ok(())
    }

    /// First phase of two-phase commit. Writes every pending record plus a
    /// PREPARE carrying the encoded XID.
    pub fn prepare(&self) -> Result<()> {
        let mut inner = self.lock();
        Self::active(&inner, self.id)?;
        if inner.rollback_only {
            return Err(Error::TransactionRolledBack(format!(
                "transaction {} is marked rollback only",
                self.id
            )));
        }
        self.journal_acknowledgements(&mut inner)?;
        let data = self.xid.as_ref().map(Xid::to_bytes).unwrap_or_default();
        self.storage.prepare(self.id, &data)?;
        inner.journaled = true;
        inner.state = TransactionState::Prepared;
        debug!("transaction {} prepared", self.id);
        Ok(())
    }

    /// Makes the transaction's work visible. Committing a finished
    /// transaction fails with `TransactionRolledBack`.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            TransactionState::Active | TransactionState::Prepared => {}
            state => {
                return Err(Error::TransactionRolledBack(format!(
                    "transaction {} is already {state:?}",
                    self.id
                )))
            }
        }
        if inner.rollback_only {
            drop(inner);
            self.rollback()?;
            return Err(Error::TransactionRolledBack(format!(
                "transaction {} was marked rollback only",
                self.id
            )));
        }
        self.journal_acknowledgements(&mut inner)?;
        if inner.journaled {
            self.storage.commit(self.id)?;
        }
        inner.state = TransactionState::Committed;

        let acknowledgements = std::mem::take(&mut inner.acknowledgements);
        let refs_to_add = std::mem::take(&mut inner.refs_to_add);
        let page_transaction = inner.page_transaction.take();
        let duplicates = std::mem::take(&mut inner.duplicates);
        drop(inner);

        let mut touched: HashMap<u64, Arc<Queue>> = HashMap::new();
        for (queue, reference) in acknowledgements {
            let reference = queue
                .take_delivering(reference.message_id())
                .unwrap_or(reference);
            self.post_office.release_reference(&reference);
            touched.insert(queue.id(), queue);
        }
        for (queue, reference) in refs_to_add {
            if queue.add_last(reference.clone()) == HandleStatus::Busy {
                debug!("queue {} is full, adding committed message {} anyway", queue.name(), reference.message_id());
                queue.add_unbounded(reference);
            }
            touched.insert(queue.id(), queue);
        }
        if let Some(info) = page_transaction {
            info.complete();
            if info.message_count() == 0 {
                self.post_office.paging().remove_page_transaction(self.id);
            }
        }
        for (address, id, record_id) in duplicates {
            self.post_office.remember_duplicate(&address, id, record_id);
        }
        for queue in touched.values() {
            queue.deliver();
        }
        debug!("transaction {} committed", self.id);
        Ok(())
    }

    /// Undoes the transaction. Acknowledged references go back to their
    /// queues with a higher delivery count. Rolling back twice is a no-op.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            TransactionState::RolledBack => return Ok(()),
            TransactionState::Committed => {
                return Err(Error::illegal_state(format!("transaction {} already committed", self.id)))
            }
            TransactionState::Active | TransactionState::Prepared => {}
        }
        if inner.journaled {
            self.storage.rollback(self.id)?;
        }
        if inner.acks_journaled {
            for (_, reference) in &inner.acknowledgements {
                if reference.is_durable() && self.storage.is_persistent() {
                    reference.message().restore_durable_ref();
                }
            }
        }
        inner.state = TransactionState::RolledBack;

        let acknowledgements = std::mem::take(&mut inner.acknowledgements);
        let refs_to_add = std::mem::take(&mut inner.refs_to_add);
        let page_transaction = inner.page_transaction.take();
        inner.duplicates.clear();
        drop(inner);

        let mut touched: HashMap<u64, Arc<Queue>> = HashMap::new();
        for (queue, reference) in acknowledgements.into_iter().rev() {
            if let Err(err) = queue.cancel(reference) {
                warn!("failed to return a rolled back reference to {}: {err}", queue.name());
            }
            touched.insert(queue.id(), queue);
        }
        for (_, reference) in refs_to_add {
            self.post_office.release_reference(&reference);
        }
        if let Some(info) = page_transaction {
            info.forget();
            self.post_office.paging().remove_page_transaction(self.id);
        }
        for queue in touched.values() {
            queue.deliver();
        }
        debug!("transaction {} rolled back", self.id);
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("xid", &self.xid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::XaCode;
    use crate::message::Message;
    use crate::paging::PagingManager;
    use crate::postoffice::PostOfficeOptions;
    use crate::queue::tests::TestConsumer;
    use crate::settings::SettingsRepository;
    use crate::storage::NullStorageManager;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<dyn StorageManager>, Arc<PostOffice>) {
        let storage: Arc<dyn StorageManager> = Arc::new(NullStorageManager::new());
        let settings = Arc::new(SettingsRepository::default());
        let paging = PagingManager::new(dir.path(), Arc::clone(&settings), Arc::clone(&storage));
        let post_office = PostOffice::new(
            Arc::clone(&storage),
            paging,
            settings,
            Arc::new(ManualClock::new(0)),
            PostOfficeOptions::default(),
        );
        (storage, post_office)
    }

    fn begin(storage: &Arc<dyn StorageManager>, post_office: &Arc<PostOffice>, xid: Option<Xid>) -> Arc<Transaction> {
        Transaction::new(Arc::clone(storage), Arc::clone(post_office), xid, 0, 0).unwrap()
    }

    #[test]
    fn routed_messages_appear_on_commit() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let queue = po.add_binding("a", "q", None, false, false).unwrap();
        let tx = begin(&storage, &po, None);
        po.route(Message::new("a", "1"), Some(&tx)).unwrap();
        po.route(Message::new("a", "2"), Some(&tx)).unwrap();
        assert_eq!(queue.message_count(), 0);
        assert_eq!(tx.operation_count(), 2);

        tx.commit().unwrap();
        assert_eq!(queue.message_count(), 2);
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(matches!(tx.commit(), Err(Error::TransactionRolledBack(_))));
    }

    #[test]
    fn rollback_discards_sends_and_redelivers_acks() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let queue = po.add_binding("a", "q", None, false, false).unwrap();
        let id = po.route(Message::new("a", "kept"), None).unwrap().message_id;
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();
        assert_eq!(consumer.received(), vec![id]);

        let tx = begin(&storage, &po, None);
        po.route(Message::new("a", "dropped"), Some(&tx)).unwrap();
        tx.acknowledge(Arc::clone(&queue), queue.delivering_reference(id).unwrap())
            .unwrap();
        queue.remove_consumer(1);
        tx.rollback().unwrap();
        tx.rollback().unwrap();

        let pending = queue.list(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id(), id);
        assert_eq!(pending[0].delivery_count, 1);
        assert!(matches!(tx.commit(), Err(Error::TransactionRolledBack(_))));
    }

    #[test]
    fn committed_acks_remove_references() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let queue = po.add_binding("a", "q", None, false, false).unwrap();
        let id = po.route(Message::new("a", "x"), None).unwrap().message_id;
        let consumer = TestConsumer::new(1);
        queue.add_consumer(consumer.clone());
        queue.deliver();

        let tx = begin(&storage, &po, None);
        let reference = queue.delivering_reference(id).unwrap();
        tx.acknowledge(Arc::clone(&queue), reference.clone()).unwrap();
        tx.commit().unwrap();
        assert_eq!(queue.message_count(), 0);
        assert_eq!(reference.message().ref_count(), 0);
    }

    #[test]
    fn rollback_only_commit_fails() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let queue = po.add_binding("a", "q", None, false, false).unwrap();
        let tx = begin(&storage, &po, None);
        po.route(Message::new("a", "x"), Some(&tx)).unwrap();
        tx.mark_rollback_only();
        assert!(matches!(tx.prepare(), Err(Error::TransactionRolledBack(_))));
        assert!(matches!(tx.commit(), Err(Error::TransactionRolledBack(_))));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(queue.message_count(), 0);
    }

    #[test]
    fn timeouts_only_apply_to_active_transactions() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let tx = Transaction::new(Arc::clone(&storage), Arc::clone(&po), None, 100, 1_000).unwrap();
        assert!(!tx.is_timed_out(1_050));
        assert!(tx.is_timed_out(1_100));
        tx.prepare().unwrap();
        assert!(!tx.is_timed_out(5_000));
    }

    #[test]
    fn resource_manager_tracks_xids() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let rm = ResourceManager::new(0);
        let xid = Xid::new(1, b"gtrid".to_vec(), b"bq".to_vec());
        let tx = begin(&storage, &po, Some(xid.clone()));
        rm.put(xid.clone(), Arc::clone(&tx)).unwrap();
        assert!(matches!(
            rm.put(xid.clone(), Arc::clone(&tx)),
            Err(Error::Xa { code: XaCode::DuplicateXid, .. })
        ));
        assert!(matches!(
            rm.commit_prepared(&xid),
            Err(Error::Xa { code: XaCode::Protocol, .. })
        ));
        tx.prepare().unwrap();
        assert_eq!(rm.in_doubt_xids(), vec![xid.clone()]);
        rm.commit_prepared(&xid).unwrap();
        assert!(rm.is_empty());
        assert!(matches!(
            rm.rollback_prepared(&xid),
            Err(Error::Xa { code: XaCode::NoTransaction, .. })
        ));
    }

    #[test]
    fn reaper_rolls_back_expired_transactions() {
        let dir = TempDir::new().unwrap();
        let (storage, po) = setup(&dir);
        let rm = ResourceManager::new(50);
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());
        let tx = Transaction::new(Arc::clone(&storage), Arc::clone(&po), Some(xid.clone()), 50, 0).unwrap();
        rm.put(xid, Arc::clone(&tx)).unwrap();
        assert_eq!(rm.reap_timed_out(10), 0);
        assert_eq!(rm.reap_timed_out(60), 1);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(rm.is_empty());
    }
}
