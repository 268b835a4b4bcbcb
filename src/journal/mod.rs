//! Append-only durable journal.
//!
//! Records go to the current memory-mapped file under a single lock. When a
//! record does not fit, the journal moves on to a free file (or creates one) and
//! stamps it with the next sequence number. A flusher thread makes appends
//! durable in batches and fires their completions. Files whose records are all
//! dead are released back to the free pool; see [`reclaimer`] for the rules.
//!
//! `load()` must be called once before appending. It replays every data file in
//! sequence order and returns the live records plus the transactions that were
//! prepared but never completed.

pub mod completion;
pub mod file;
mod flusher;
mod mapped;
mod reclaimer;
pub mod record;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::JournalConfig;
use crate::error::ErrorCode;
use crate::{Error, Result};

pub use completion::{FnCompletion, IoCompletion, SyncCompletion};
pub use record::{Decoded, Record};

use completion::SyncSignal;
use file::{JournalFile, FILE_DATA_OFFSET, FILE_HEADER_SIZE};
use mapped::MappedFile;
use flusher::{FlushRequest, Flusher};
use reclaimer::ReclaimTracker;

/// A live record returned by [`Journal::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: u64,
    pub user_type: u8,
    pub data: Vec<u8>,
    pub is_update: bool,
}

/// A transaction that was prepared but neither committed nor rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub tx_id: u64,
    /// Data passed to `append_prepare_record`, typically the encoded XID.
    pub data: Vec<u8>,
    pub records: Vec<RecordInfo>,
    pub deletes: Vec<u64>,
}

#[derive(Debug, Default)]
pub struct LoadedJournal {
    pub committed: Vec<RecordInfo>,
    pub prepared: Vec<PreparedTransaction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub data_files: usize,
    pub free_files: usize,
    pub live_records: usize,
    pub pending_transactions: usize,
}

/// A record read back by [`scan`].
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    pub file_id: u64,
    pub sequence: u64,
    pub offset: usize,
    pub record: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxOpKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug)]
struct TxOp {
    kind: TxOpKind,
    id: u64,
    seq: u64,
    user_type: u8,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct PendingTx {
    ops: Vec<TxOp>,
    /// Sequence of the file holding PREPARE, and its data.
    prepare: Option<(u64, Vec<u8>)>,
}

struct DataFile {
    file: JournalFile,
    sync: Arc<File>,
}

struct JournalState {
    loaded: bool,
    files: BTreeMap<u64, DataFile>,
    current: Option<u64>,
    free: VecDeque<(u64, MappedFile)>,
    next_sequence: u64,
    next_file_id: u64,
    tracker: ReclaimTracker,
    transactions: HashMap<u64, PendingTx>,
    flush_tx: Option<Sender<FlushRequest>>,
}

struct JournalInner {
    config: JournalConfig,
    state: Mutex<JournalState>,
}

pub struct Journal {
    inner: Arc<JournalInner>,
    flusher: Mutex<Option<Flusher>>,
}

impl Journal {
    pub fn new(config: JournalConfig) -> Result<Self> {
        file::validate_file_size(config.file_size)?;
        if config.min_files == 0 {
            return Err(Error::Unsupported("journal needs at least one file"));
        }
        Ok(Self {
            inner: Arc::new(JournalInner {
                config,
                state: Mutex::new(JournalState {
                    loaded: false,
                    files: BTreeMap::new(),
                    current: None,
                    free: VecDeque::new(),
                    next_sequence: 1,
                    next_file_id: 0,
                    tracker: ReclaimTracker::default(),
                    transactions: HashMap::new(),
                    flush_tx: None,
                }),
            }),
            flusher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &JournalConfig {
        &self.inner.config
    }

    /// Replays the journal and starts the flusher.
    pub fn load(&self) -> Result<LoadedJournal> {
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        if state.loaded {
            return Err(Error::illegal_state("journal already loaded"));
        }
        std::fs::create_dir_all(&config.directory)?;

        let mut data_files = Vec::new();
        for file_id in file::discover_files(&config.directory, &config.file_extension)? {
            let path = file::file_path(&config.directory, file_id, &config.file_extension);
            let mut mapped = MappedFile::open(&path)?;
            let header = file::read_header(&mapped)?;
            state.next_file_id = state.next_file_id.max(file_id + 1);
            if header.is_free() {
                // A release interrupted after its header write leaves old
                // records behind. Reusing the file would bring them back.
                if !mapped.is_zero_from(FILE_DATA_OFFSET) {
                    warn!("journal free file {file_id} still holds data, zeroing it");
                    mapped.zero_from(FILE_DATA_OFFSET)?;
                }
                state.free.push_back((file_id, mapped));
            } else {
                data_files.push((header.sequence, file_id, mapped));
            }
        }
        data_files.sort_by_key(|(seq, _, _)| *seq);

        let mut live: BTreeMap<u64, Vec<RecordInfo>> = BTreeMap::new();
        let last = data_files.len().saturating_sub(1);
        for (index, (seq, file_id, mut mapped)) in data_files.into_iter().enumerate() {
            state.tracker.add_file(seq);
            let end = state.replay_file(seq, &mut mapped, index == last, &mut live)?;
            let sync = Arc::new(mapped.sync_handle()?);
            state.files.insert(
                seq,
                DataFile {
                    file: JournalFile {
                        file_id,
                        sequence: seq,
                        mapped,
                        write_offset: end,
                    },
                    sync,
                },
            );
            state.next_sequence = seq + 1;
            state.current = Some(seq);
        }

        let mut prepared = Vec::new();
        let tx_ids: Vec<u64> = state.transactions.keys().copied().collect();
        for tx_id in tx_ids {
            let Some(tx) = state.transactions.remove(&tx_id) else {
                continue;
            };
            match &tx.prepare {
                Some((_, data)) => {
                    let mut records = Vec::new();
                    let mut deletes = Vec::new();
                    for op in &tx.ops {
                        match op.kind {
                            TxOpKind::Delete => deletes.push(op.id),
                            kind => records.push(RecordInfo {
                                id: op.id,
                                user_type: op.user_type,
                                data: op.data.clone(),
                                is_update: kind == TxOpKind::Update,
                            }),
                        }
                    }
                    prepared.push(PreparedTransaction {
                        tx_id,
                        data: data.clone(),
                        records,
                        deletes,
                    });
                    state.transactions.insert(tx_id, tx);
                }
                None => {
                    warn!(
                        "discarding journal transaction {tx_id}: {} records without prepare or commit",
                        tx.ops.len()
                    );
                    state.discard_tx(tx);
                }
            }
        }
        prepared.sort_by_key(|p| p.tx_id);

        if state.current.is_none() {
            state.open_new_file(config)?;
        }
        while state.files.len() + state.free.len() < config.min_files {
            let file_id = state.next_file_id;
            state.next_file_id += 1;
            let mapped = file::create_free_file(
                &config.directory,
                file_id,
                &config.file_extension,
                config.file_size,
            )?;
            state.free.push_back((file_id, mapped));
        }
        state.loaded = true;

        let weak: Weak<JournalInner> = Arc::downgrade(&self.inner);
        let flusher = Flusher::spawn("journal", move || {
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.reclaim() {
                    warn!("journal reclaim failed: {err}");
                }
            }
        })?;
        state.flush_tx = Some(flusher.sender());
        let committed: Vec<RecordInfo> = live.into_values().flatten().collect();
        info!(
            "journal loaded from {}: {} data files, {} free, {} live records, {} prepared transactions",
            config.directory.display(),
            state.files.len(),
            state.free.len(),
            state.tracker.record_count(),
            prepared.len()
        );
        drop(state);
        *self.flusher.lock().unwrap_or_else(|e| e.into_inner()) = Some(flusher);

        Ok(LoadedJournal {
            committed,
            prepared,
        })
    }

    /// Stops the flusher after it drains pending syncs. Later appends fail.
    pub fn stop(&self) {
        self.inner.lock().flush_tx = None;
        if let Some(mut flusher) = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            flusher.shutdown();
        }
    }

    pub fn append_add_record(&self, id: u64, user_type: u8, data: &[u8]) -> Result<()> {
        self.append_blocking(|_| {
            Ok(Record::Add {
                id,
                user_type,
                data: data.to_vec(),
            })
        })
    }

    pub fn append_add_record_with(
        &self,
        id: u64,
        user_type: u8,
        data: &[u8],
        completion: Box<dyn IoCompletion>,
    ) -> Result<()> {
        self.append(
            |_| {
                Ok(Record::Add {
                    id,
                    user_type,
                    data: data.to_vec(),
                })
            },
            completion,
        )
    }

    pub fn append_update_record(&self, id: u64, user_type: u8, data: &[u8]) -> Result<()> {
        self.append_blocking(|state| {
            state.require_record(id)?;
            Ok(Record::Update {
                id,
                user_type,
                data: data.to_vec(),
            })
        })
    }

    pub fn append_update_record_with(
        &self,
        id: u64,
        user_type: u8,
        data: &[u8],
        completion: Box<dyn IoCompletion>,
    ) -> Result<()> {
        self.append(
            |state| {
                state.require_record(id)?;
                Ok(Record::Update {
                    id,
                    user_type,
                    data: data.to_vec(),
                })
            },
            completion,
        )
    }

    pub fn append_delete_record(&self, id: u64) -> Result<()> {
        self.append_blocking(|state| {
            state.require_record(id)?;
            Ok(Record::Delete { id })
        })
    }

    pub fn append_delete_record_with(&self, id: u64, completion: Box<dyn IoCompletion>) -> Result<()> {
        self.append(
            |state| {
                state.require_record(id)?;
                Ok(Record::Delete { id })
            },
            completion,
        )
    }

    pub fn append_add_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: &[u8],
    ) -> Result<()> {
        self.append_blocking(|state| {
            state.require_open_tx(tx_id)?;
            Ok(Record::AddTx {
                tx_id,
                id,
                user_type,
                data: data.to_vec(),
            })
        })
    }

    pub fn append_update_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: &[u8],
    ) -> Result<()> {
        self.append_blocking(|state| {
            state.require_open_tx(tx_id)?;
            state.require_record_in_tx(tx_id, id)?;
            Ok(Record::UpdateTx {
                tx_id,
                id,
                user_type,
                data: data.to_vec(),
            })
        })
    }

    pub fn append_delete_record_transactional(&self, tx_id: u64, id: u64) -> Result<()> {
        self.append_blocking(|state| {
            state.require_open_tx(tx_id)?;
            state.require_record_in_tx(tx_id, id)?;
            Ok(Record::DeleteTx { tx_id, id })
        })
    }

    pub fn append_prepare_record(&self, tx_id: u64, data: &[u8]) -> Result<()> {
        self.append_blocking(|state| state.prepare_record(tx_id, data))
    }

    pub fn append_prepare_record_with(
        &self,
        tx_id: u64,
        data: &[u8],
        completion: Box<dyn IoCompletion>,
    ) -> Result<()> {
        self.append(|state| state.prepare_record(tx_id, data), completion)
    }

    pub fn append_commit_record(&self, tx_id: u64) -> Result<()> {
        self.append_blocking(|state| Ok(state.commit_record(tx_id)))
    }

    pub fn append_commit_record_with(&self, tx_id: u64, completion: Box<dyn IoCompletion>) -> Result<()> {
        self.append(|state| Ok(state.commit_record(tx_id)), completion)
    }

    pub fn append_rollback_record(&self, tx_id: u64) -> Result<()> {
        self.append_blocking(|_| Ok(Record::Rollback { tx_id }))
    }

    pub fn append_rollback_record_with(&self, tx_id: u64, completion: Box<dyn IoCompletion>) -> Result<()> {
        self.append(|_| Ok(Record::Rollback { tx_id }), completion)
    }

    /// Releases every file that no longer holds live data. Returns the number
    /// of files released.
    pub fn check_and_reclaim_files(&self) -> Result<usize> {
        self.inner.reclaim()
    }

    pub fn data_files_count(&self) -> usize {
        self.inner.lock().files.len()
    }

    pub fn free_files_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn id_map_size(&self) -> usize {
        self.inner.lock().tracker.record_count()
    }

    pub fn file_size(&self) -> usize {
        self.inner.config.file_size
    }

    pub fn min_files(&self) -> usize {
        self.inner.config.min_files
    }

    pub fn stats(&self) -> JournalStats {
        let state = self.inner.lock();
        JournalStats {
            data_files: state.files.len(),
            free_files: state.free.len(),
            live_records: state.tracker.record_count(),
            pending_transactions: state.transactions.len(),
        }
    }

    /// Appends a record and blocks until it is durable when sync is enabled for
    /// its class, or until it is written when it is not.
    fn append_blocking<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&JournalState) -> Result<Record>,
    {
        let latch = Arc::new(SyncCompletion::new());
        self.append(build, Box::new(SyncSignal(Arc::clone(&latch))))?;
        latch.wait(Duration::from_millis(self.inner.config.sync_timeout_ms))
    }

    /// Appends the record built by `build`.
    ///
    /// An `Err` means the record was rejected before anything was written and
    /// `completion` was dropped without being called. Failures while writing
    /// or rotating files go to `completion.on_error` instead.
    fn append<F>(&self, build: F, completion: Box<dyn IoCompletion>) -> Result<()>
    where
        F: FnOnce(&JournalState) -> Result<Record>,
    {
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        if !state.loaded {
            return Err(Error::illegal_state("journal not loaded"));
        }
        let flush_tx = state
            .flush_tx
            .clone()
            .ok_or_else(|| Error::illegal_state("journal stopped"))?;
        let record = build(&state)?;
        let sync = if record.tx_id().is_some() {
            config.sync_transactional
        } else {
            config.sync_non_transactional
        };
        let reclaim = matches!(
            record,
            Record::Delete { .. } | Record::Commit { .. } | Record::Rollback { .. }
        );
        let bytes = record.encode()?;
        if bytes.len() > config.file_size - FILE_DATA_OFFSET {
            return Err(Error::Unsupported("record larger than a journal file"));
        }
        let written = state.write(config, &bytes).and_then(|seq| {
            state
                .files
                .get(&seq)
                .map(|f| (seq, Arc::clone(&f.sync)))
                .ok_or(Error::Corrupt("journal file vanished after write"))
        });
        let (seq, sync_file) = match written {
            Ok(written) => written,
            Err(err) => {
                drop(state);
                warn!("journal append failed: {err}");
                completion.on_error(ErrorCode::JournalIoError, err.to_string());
                return Ok(());
            }
        };
        state.apply(record, seq, None);
        drop(state);

        if sync {
            if let Err(std::sync::mpsc::SendError(FlushRequest::Sync { completion, .. })) =
                flush_tx.send(FlushRequest::Sync {
                    file: sync_file,
                    completion,
                })
            {
                completion.on_error(ErrorCode::JournalIoError, "journal flusher stopped".into());
            }
        } else {
            completion.done();
        }
        if reclaim {
            let _ = flush_tx.send(FlushRequest::Reclaim);
        }
        Ok(())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.stop();
    }
}

impl JournalInner {
    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reclaim(&self) -> Result<usize> {
        let config = &self.config;
        let mut state = self.lock();
        let candidates = state.tracker.reclaimable(state.current);
        let mut released = 0;
        for seq in candidates {
            state.tracker.remove_file(seq);
            let Some(data_file) = state.files.remove(&seq) else {
                continue;
            };
            let JournalFile { file_id, mut mapped, .. } = data_file.file;
            if state.files.len() + state.free.len() >= config.min_files {
                drop(mapped);
                let path = file::file_path(&config.directory, file_id, &config.file_extension);
                std::fs::remove_file(&path)?;
                debug!("journal deleted file {} (seq {seq})", path.display());
            } else {
                file::release_file(&mut mapped)?;
                state.free.push_back((file_id, mapped));
                debug!("journal released file {file_id} (seq {seq}) to the free pool");
            }
            released += 1;
        }
        if released > 0 {
            info!(
                "journal reclaimed {released} files ({} data, {} free)",
                state.files.len(),
                state.free.len()
            );
        }
        Ok(released)
    }
}

impl JournalState {
    fn require_record(&self, id: u64) -> Result<()> {
        if self.tracker.contains_record(id) {
            Ok(())
        } else {
            Err(Error::IllegalState(format!("journal record {id} does not exist")))
        }
    }

    fn require_open_tx(&self, tx_id: u64) -> Result<()> {
        match self.transactions.get(&tx_id) {
            Some(tx) if tx.prepare.is_some() => Err(Error::IllegalState(format!(
                "journal transaction {tx_id} is already prepared"
            ))),
            _ => Ok(()),
        }
    }

    fn require_record_in_tx(&self, tx_id: u64, id: u64) -> Result<()> {
        let added_in_tx = self
            .transactions
            .get(&tx_id)
            .is_some_and(|tx| tx.ops.iter().any(|op| op.id == id && op.kind == TxOpKind::Add));
        if added_in_tx {
            Ok(())
        } else {
            self.require_record(id)
        }
    }

    fn prepare_record(&self, tx_id: u64, data: &[u8]) -> Result<Record> {
        self.require_open_tx(tx_id)?;
        let record_count = self.transactions.get(&tx_id).map_or(0, |tx| tx.ops.len()) as u32;
        Ok(Record::Prepare {
            tx_id,
            record_count,
            data: data.to_vec(),
        })
    }

    fn commit_record(&self, tx_id: u64) -> Record {
        let record_count = self.transactions.get(&tx_id).map_or(0, |tx| tx.ops.len()) as u32;
        Record::Commit {
            tx_id,
            record_count,
        }
    }

    fn write(&mut self, config: &JournalConfig, bytes: &[u8]) -> Result<u64> {
        let fits = self
            .current
            .and_then(|seq| self.files.get(&seq))
            .is_some_and(|f| f.file.remaining() >= bytes.len());
        if !fits {
            self.open_new_file(config)?;
        }
        let seq = self
            .current
            .ok_or(Error::Corrupt("no current journal file"))?;
        let data_file = self
            .files
            .get_mut(&seq)
            .ok_or(Error::Corrupt("current journal file missing"))?;
        if data_file.file.remaining() < bytes.len() {
            return Err(Error::Unsupported("record larger than a journal file"));
        }
        let offset = data_file.file.write_offset;
        data_file.file.mapped.write_at(offset, bytes)?;
        data_file.file.write_offset += bytes.len();
        Ok(seq)
    }

    fn open_new_file(&mut self, config: &JournalConfig) -> Result<()> {
        let (file_id, mut mapped) = match self.free.pop_front() {
            Some(free) => free,
            None => {
                let file_id = self.next_file_id;
                self.next_file_id += 1;
                let mapped = file::create_free_file(
                    &config.directory,
                    file_id,
                    &config.file_extension,
                    config.file_size,
                )?;
                (file_id, mapped)
            }
        };
        let seq = self.next_sequence;
        self.next_sequence += 1;
        file::write_header(&mut mapped, seq, 0)?;
        mapped.flush(0, FILE_HEADER_SIZE)?;
        let sync = Arc::new(mapped.sync_handle()?);
        self.tracker.add_file(seq);
        self.files.insert(
            seq,
            DataFile {
                file: JournalFile {
                    file_id,
                    sequence: seq,
                    mapped,
                    write_offset: FILE_DATA_OFFSET,
                },
                sync,
            },
        );
        self.current = Some(seq);
        debug!("journal moved to file {file_id} (seq {seq})");
        Ok(())
    }

    /// Replays one file, returning the offset just past its last good record.
    fn replay_file(
        &mut self,
        seq: u64,
        mapped: &mut MappedFile,
        is_last: bool,
        live: &mut BTreeMap<u64, Vec<RecordInfo>>,
    ) -> Result<usize> {
        let mut offset = FILE_DATA_OFFSET;
        loop {
            let decoded = Record::decode(&mapped.bytes()[offset..]);
            match decoded {
                Decoded::End => break,
                Decoded::Record(record, len) => {
                    self.apply(record, seq, Some(live));
                    offset += len;
                }
                Decoded::Torn(reason) => {
                    if !is_last {
                        return Err(Error::Corrupt(reason));
                    }
                    warn!("journal file seq {seq}: truncating torn tail at offset {offset} ({reason})");
                    mapped.zero_from(offset)?;
                    break;
                }
            }
        }
        Ok(offset)
    }

    /// Applies a record written to (or replayed from) file `seq`. `live` is
    /// only given during load, to collect committed data.
    fn apply(&mut self, record: Record, seq: u64, mut live: Option<&mut BTreeMap<u64, Vec<RecordInfo>>>) {
        match record {
            Record::Add { id, user_type, data } => {
                self.tracker.add_record(id, seq);
                if let Some(live) = live {
                    live.entry(id).or_default().push(RecordInfo {
                        id,
                        user_type,
                        data,
                        is_update: false,
                    });
                }
            }
            Record::Update { id, user_type, data } => {
                if !self.tracker.update_record(id, seq) {
                    warn!("journal update for unknown record {id} ignored");
                    return;
                }
                if let Some(live) = live {
                    live.entry(id).or_default().push(RecordInfo {
                        id,
                        user_type,
                        data,
                        is_update: true,
                    });
                }
            }
            Record::Delete { id } => {
                if !self.tracker.delete_record(id, seq) {
                    debug!("journal delete for unknown record {id} ignored");
                }
                if let Some(live) = live {
                    live.remove(&id);
                }
            }
            Record::AddTx {
                tx_id,
                id,
                user_type,
                data,
            } => self.push_tx_op(tx_id, TxOpKind::Add, id, seq, user_type, data, live.is_some()),
            Record::UpdateTx {
                tx_id,
                id,
                user_type,
                data,
            } => self.push_tx_op(tx_id, TxOpKind::Update, id, seq, user_type, data, live.is_some()),
            Record::DeleteTx { tx_id, id } => {
                self.push_tx_op(tx_id, TxOpKind::Delete, id, seq, 0, Vec::new(), live.is_some())
            }
            Record::Prepare {
                tx_id,
                record_count,
                data,
            } => {
                let tx = self.transactions.entry(tx_id).or_default();
                if tx.ops.len() != record_count as usize {
                    warn!(
                        "discarding journal transaction {tx_id}: prepare expects {record_count} records, found {}",
                        tx.ops.len()
                    );
                    if let Some(tx) = self.transactions.remove(&tx_id) {
                        self.discard_tx(tx);
                    }
                    return;
                }
                tx.prepare = Some((seq, data));
                self.tracker.pin(seq);
            }
            Record::Commit {
                tx_id,
                record_count,
            } => {
                let tx = self.transactions.remove(&tx_id).unwrap_or_default();
                if tx.ops.len() != record_count as usize {
                    warn!(
                        "discarding journal transaction {tx_id}: commit expects {record_count} records, found {}",
                        tx.ops.len()
                    );
                    self.discard_tx(tx);
                    return;
                }
                for op in tx.ops {
                    self.tracker.unpin(op.seq);
                    self.tracker.add_dependency(seq, op.seq);
                    match op.kind {
                        TxOpKind::Add | TxOpKind::Update => {
                            let is_update = op.kind == TxOpKind::Update;
                            if !is_update || !self.tracker.update_record(op.id, op.seq) {
                                self.tracker.add_record(op.id, op.seq);
                            }
                            if let Some(live) = live.as_deref_mut() {
                                live.entry(op.id).or_default().push(RecordInfo {
                                    id: op.id,
                                    user_type: op.user_type,
                                    data: op.data,
                                    is_update,
                                });
                            }
                        }
                        TxOpKind::Delete => {
                            self.tracker.delete_record(op.id, op.seq);
                            if let Some(live) = live.as_deref_mut() {
                                live.remove(&op.id);
                            }
                        }
                    }
                }
                if let Some((prepare_seq, _)) = tx.prepare {
                    self.tracker.unpin(prepare_seq);
                    self.tracker.add_dependency(seq, prepare_seq);
                }
            }
            Record::Rollback { tx_id } => {
                let Some(tx) = self.transactions.remove(&tx_id) else {
                    return;
                };
                for op in &tx.ops {
                    self.tracker.add_dependency(seq, op.seq);
                }
                if let Some((prepare_seq, _)) = &tx.prepare {
                    self.tracker.add_dependency(seq, *prepare_seq);
                }
                self.discard_tx(tx);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_tx_op(
        &mut self,
        tx_id: u64,
        kind: TxOpKind,
        id: u64,
        seq: u64,
        user_type: u8,
        data: Vec<u8>,
        keep_data: bool,
    ) {
        self.tracker.pin(seq);
        self.transactions.entry(tx_id).or_default().ops.push(TxOp {
            kind,
            id,
            seq,
            user_type,
            data: if keep_data { data } else { Vec::new() },
        });
    }

    /// Releases the pins of a transaction without applying it.
    fn discard_tx(&mut self, tx: PendingTx) {
        for op in &tx.ops {
            self.tracker.unpin(op.seq);
        }
        if let Some((prepare_seq, _)) = tx.prepare {
            self.tracker.unpin(prepare_seq);
        }
    }
}

/// Reads every record of every data file without modifying anything.
///
/// Returns the records in replay order plus the number of free files. Stops at
/// the first damaged record of each file.
pub fn scan(dir: &Path, extension: &str) -> Result<(Vec<ScannedRecord>, usize)> {
    let mut data = Vec::new();
    let mut free = 0;
    for file_id in file::discover_files(dir, extension)? {
        let bytes = std::fs::read(file::file_path(dir, file_id, extension))?;
        let header = file::parse_header(&bytes)?;
        if header.is_free() {
            free += 1;
        } else {
            data.push((header.sequence, file_id, bytes));
        }
    }
    data.sort_by_key(|(seq, _, _)| *seq);

    let mut records = Vec::new();
    for (sequence, file_id, bytes) in data {
        let mut offset = FILE_DATA_OFFSET;
        while let Decoded::Record(record, len) = Record::decode(&bytes[offset..]) {
            records.push(ScannedRecord {
                file_id,
                sequence,
                offset,
                record,
            });
            offset += len;
        }
    }
    Ok((records, free))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn config(dir: &TempDir, file_size: usize) -> JournalConfig {
        JournalConfig {
            directory: dir.path().join("journal"),
            file_size,
            min_files: 2,
            ..JournalConfig::default()
        }
    }

    fn open(config: &JournalConfig) -> (Journal, LoadedJournal) {
        let journal = Journal::new(config.clone()).expect("journal");
        let loaded = journal.load().expect("load");
        (journal, loaded)
    }

    fn ids(records: &[RecordInfo]) -> Vec<u64> {
        let mut ids: Vec<u64> = records.iter().filter(|r| !r.is_update).map(|r| r.id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn fresh_journal_precreates_min_files() {
        let dir = TempDir::new().unwrap();
        let (journal, loaded) = open(&config(&dir, 8192));
        assert!(loaded.committed.is_empty());
        assert_eq!(journal.data_files_count() + journal.free_files_count(), 2);
        assert_eq!(journal.data_files_count(), 1);
    }

    #[test]
    fn appends_fail_before_load() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::new(config(&dir, 8192)).unwrap();
        assert!(matches!(
            journal.append_add_record(1, 1, b"x"),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn live_set_survives_reload() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 8192);
        {
            let (journal, _) = open(&cfg);
            for id in 1..=5 {
                journal.append_add_record(id, 1, &[id as u8; 10]).unwrap();
            }
            journal.append_update_record(2, 2, b"updated").unwrap();
            journal.append_delete_record(3).unwrap();
            journal.append_delete_record(5).unwrap();
            assert_eq!(journal.id_map_size(), 3);
        }
        let (journal, loaded) = open(&cfg);
        assert_eq!(ids(&loaded.committed), vec![1, 2, 4]);
        let update = loaded
            .committed
            .iter()
            .find(|r| r.is_update)
            .expect("update record");
        assert_eq!((update.id, update.user_type, update.data.as_slice()), (2, 2, &b"updated"[..]));
        assert_eq!(journal.id_map_size(), 3);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = open(&config(&dir, 8192));
        assert!(matches!(journal.append_delete_record(42), Err(Error::IllegalState(_))));
        assert!(matches!(
            journal.append_update_record(42, 1, b"x"),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            journal.append_delete_record_transactional(7, 42),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 8192);
        {
            let (journal, _) = open(&cfg);
            journal.append_add_record(1, 1, b"first").unwrap();
            journal.append_add_record(2, 1, b"second").unwrap();
        }
        // Chop the crc of the last record.
        let (records, _) = scan(&cfg.directory, "jrn").unwrap();
        let last = records.last().unwrap();
        let path = file::file_path(&cfg.directory, last.file_id, "jrn");
        let mut bytes = std::fs::read(&path).unwrap();
        let end = last.offset + last.record.encoded_len();
        bytes[end - 1] ^= 0xAA;
        std::fs::write(&path, &bytes).unwrap();

        let (journal, loaded) = open(&cfg);
        assert_eq!(ids(&loaded.committed), vec![1]);
        journal.append_add_record(3, 1, b"third").unwrap();
        drop(journal);

        let (_, loaded) = open(&cfg);
        assert_eq!(ids(&loaded.committed), vec![1, 3]);
    }

    #[test]
    fn corruption_before_the_last_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1024);
        {
            let (journal, _) = open(&cfg);
            for id in 0..20 {
                journal.append_add_record(id, 1, &[7u8; 100]).unwrap();
            }
            assert!(journal.data_files_count() > 1);
        }
        let (records, _) = scan(&cfg.directory, "jrn").unwrap();
        let first = &records[0];
        let path = file::file_path(&cfg.directory, first.file_id, "jrn");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[first.offset + 20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let journal = Journal::new(cfg).unwrap();
        assert!(matches!(journal.load(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn dead_files_are_reclaimed() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1024);
        let (journal, _) = open(&cfg);
        for id in 0..40 {
            journal.append_add_record(id, 1, &[1u8; 100]).unwrap();
        }
        let files_used = journal.data_files_count();
        assert!(files_used >= 4, "expected rotation, got {files_used} files");

        for id in 0..40 {
            journal.append_delete_record(id).unwrap();
        }
        journal.check_and_reclaim_files().unwrap();
        assert_eq!(journal.data_files_count(), 1);
        assert_eq!(journal.data_files_count() + journal.free_files_count(), cfg.min_files);
        assert_eq!(journal.id_map_size(), 0);
        drop(journal);

        let (_, loaded) = open(&cfg);
        assert!(loaded.committed.is_empty());
    }

    #[test]
    fn interrupted_release_cannot_resurrect_records() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 8192);
        {
            let (journal, _) = open(&cfg);
            for id in 100..=105 {
                journal.append_add_record(id, 1, &[id as u8; 32]).unwrap();
            }
        }
        // Leave the data file's records behind a FREE header, as a crash
        // between the header write and the zeroing would.
        let mut data = None;
        let mut free = None;
        for file_id in file::discover_files(&cfg.directory, "jrn").unwrap() {
            let path = file::file_path(&cfg.directory, file_id, "jrn");
            let bytes = std::fs::read(&path).unwrap();
            if file::parse_header(&bytes).unwrap().is_free() {
                free = Some((path, bytes));
            } else {
                data = Some(bytes);
            }
        }
        let data = data.expect("data file");
        let (free_path, mut free_bytes) = free.expect("free file");
        free_bytes[FILE_DATA_OFFSET..].copy_from_slice(&data[FILE_DATA_OFFSET..]);
        std::fs::write(&free_path, &free_bytes).unwrap();

        {
            let (journal, loaded) = open(&cfg);
            assert_eq!(ids(&loaded.committed), vec![100, 101, 102, 103, 104, 105]);
            for id in 100..=105 {
                journal.append_delete_record(id).unwrap();
            }
            let mut id = 200;
            while journal.data_files_count() < 2 {
                journal.append_add_record(id, 1, &[0u8; 16]).unwrap();
                id += 1;
            }
            journal.append_add_record(id, 1, &[0u8; 16]).unwrap();
        }

        let (_, loaded) = open(&cfg);
        assert!(ids(&loaded.committed).iter().all(|id| *id >= 200));
    }

    #[test]
    fn file_with_surviving_record_keeps_its_deletes() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 1024);
        {
            let (journal, _) = open(&cfg);
            journal.append_add_record(1, 1, &[1u8; 100]).unwrap();
            for id in 2..30 {
                journal.append_add_record(id, 1, &[1u8; 100]).unwrap();
                journal.append_delete_record(id).unwrap();
            }
            journal.check_and_reclaim_files().unwrap();
        }
        let (_, loaded) = open(&cfg);
        assert_eq!(ids(&loaded.committed), vec![1]);
    }

    #[test]
    fn transactions_commit_prepare_and_discard() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, 8192);
        {
            let (journal, _) = open(&cfg);
            journal.append_add_record(1, 1, b"base").unwrap();

            journal.append_add_record_transactional(10, 2, 1, b"committed").unwrap();
            journal.append_delete_record_transactional(10, 1).unwrap();
            journal.append_commit_record(10).unwrap();

            journal.append_add_record_transactional(11, 3, 1, b"prepared").unwrap();
            journal.append_delete_record_transactional(11, 2).unwrap();
            journal.append_prepare_record(11, b"xid-11").unwrap();

            journal.append_add_record_transactional(12, 4, 1, b"dangling").unwrap();

            journal.append_add_record_transactional(13, 5, 1, b"rolled back").unwrap();
            journal.append_rollback_record(13).unwrap();
        }

        let (journal, loaded) = open(&cfg);
        assert_eq!(ids(&loaded.committed), vec![2]);
        assert_eq!(loaded.prepared.len(), 1);
        let prepared = &loaded.prepared[0];
        assert_eq!(prepared.tx_id, 11);
        assert_eq!(prepared.data, b"xid-11");
        assert_eq!(prepared.records[0].id, 3);
        assert_eq!(prepared.deletes, vec![2]);

        // Recovered prepared transactions can still be completed.
        journal.append_commit_record(11).unwrap();
        drop(journal);
        let (_, loaded) = open(&cfg);
        assert_eq!(ids(&loaded.committed), vec![3]);
        assert!(loaded.prepared.is_empty());
    }

    #[test]
    fn prepared_transaction_rejects_more_records() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = open(&config(&dir, 8192));
        journal.append_add_record_transactional(1, 1, 1, b"a").unwrap();
        journal.append_prepare_record(1, b"xid").unwrap();
        assert!(matches!(
            journal.append_add_record_transactional(1, 2, 1, b"b"),
            Err(Error::IllegalState(_))
        ));
        assert_eq!(journal.stats().pending_transactions, 1);
    }

    #[test]
    fn completions_fire_once_durable() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 8192);
        cfg.sync_non_transactional = true;
        let (journal, _) = open(&cfg);
        let (tx, rx) = mpsc::channel();
        for id in 0..3 {
            let tx = tx.clone();
            journal
                .append_add_record_with(
                    id,
                    1,
                    b"x",
                    Box::new(FnCompletion(move |r: Result<()>| {
                        tx.send((id, r.is_ok())).unwrap();
                    })),
                )
                .unwrap();
        }
        let mut done: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("callback"))
            .collect();
        done.sort();
        assert_eq!(done, vec![(0, true), (1, true), (2, true)]);
    }

    #[test]
    fn write_failures_reach_the_completion() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 1024);
        cfg.min_files = 1;
        let (journal, _) = open(&cfg);
        assert_eq!(journal.free_files_count(), 0);
        // The current file stays mapped, but rotating needs a new file.
        std::fs::remove_dir_all(&cfg.directory).unwrap();

        let (tx, rx) = mpsc::channel();
        for id in 0..20 {
            let tx = tx.clone();
            journal
                .append_add_record_with(
                    id,
                    1,
                    &[1u8; 100],
                    Box::new(FnCompletion(move |r: Result<()>| {
                        tx.send(r.err().map(|e| e.code())).unwrap();
                    })),
                )
                .unwrap();
        }
        let codes: Vec<Option<ErrorCode>> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("callback"))
            .collect();
        assert!(codes.contains(&None));
        assert!(codes.contains(&Some(ErrorCode::JournalIoError)));

        assert!(matches!(
            journal.append_add_record(99, 1, &[1u8; 100]),
            Err(Error::JournalIo(_))
        ));
        assert!(journal.append_add_record(100, 1, &[0u8; 2048]).is_err());
    }

    #[test]
    fn rejected_append_drops_its_callback() {
        let dir = TempDir::new().unwrap();
        let (journal, _) = open(&config(&dir, 8192));
        let (tx, rx) = mpsc::channel::<bool>();
        let result = journal.append_delete_record_with(
            9,
            Box::new(FnCompletion(move |r: Result<()>| {
                tx.send(r.is_ok()).unwrap();
            })),
        );
        assert!(result.is_err());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
