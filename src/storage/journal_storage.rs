use std::collections::BTreeMap;
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::config::JournalConfig;
use crate::journal::{Journal, PreparedTransaction, RecordInfo};
use crate::message::Message;
use crate::storage::records::{self, *};
use crate::storage::{
    LoadedMessage, LoadedReference, LoadedState, PreparedRecord, StorageManager,
};
use crate::Result;

#[derive(Debug, Default)]
struct IdState {
    next: u64,
    ceiling: u64,
    counter_record: Option<u64>,
}

/// [`StorageManager`] backed by a [`Journal`].
///
/// Ids come from a batching generator: the journal holds a ceiling, and ids
/// below it are handed out from memory. After a restart the generator resumes
/// at the ceiling, or above the highest id seen in the journal.
pub struct JournalStorageManager {
    journal: Journal,
    ids: Mutex<IdState>,
    batch: u64,
}

impl JournalStorageManager {
    pub fn new(config: JournalConfig, id_batch_size: u64) -> Result<Self> {
        Ok(Self {
            journal: Journal::new(config)?,
            ids: Mutex::new(IdState::default()),
            batch: id_batch_size.max(1),
        })
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

fn prepared_record(tx: PreparedTransaction) -> PreparedRecord {
    let mut prepared = PreparedRecord {
        tx_id: tx.tx_id,
        data: tx.data,
        deleted_messages: tx.deletes,
        ..PreparedRecord::default()
    };
    for info in tx.records {
        let decoded = match info.user_type {
            ADD_MESSAGE => Message::from_bytes(&info.data).map(|m| prepared.messages.push(m)),
            ADD_REF => decode_add_ref(&info.data)
                .map(|(queue_id, scheduled)| prepared.references.push((queue_id, info.id, scheduled))),
            ACKNOWLEDGE_REF => {
                decode_queue_id(&info.data).map(|queue_id| prepared.acknowledgements.push((queue_id, info.id)))
            }
            PAGE_TRANSACTION => PageTransactionRecord::decode(info.id, &info.data)
                .map(|r| prepared.page_transactions.push(r)),
            DUPLICATE_ID => {
                DuplicateIdRecord::decode(info.id, &info.data).map(|r| prepared.duplicate_ids.push(r))
            }
            other => {
                warn!("prepared transaction {} has unexpected record type {other}", tx.tx_id);
                Ok(())
            }
        };
        if let Err(err) = decoded {
            warn!("skipping undecodable record {} of prepared transaction {}: {err}", info.id, tx.tx_id);
        }
    }
    prepared
}

impl StorageManager for JournalStorageManager {
    fn load(&self) -> Result<LoadedState> {
        let loaded = self.journal.load()?;
        let mut state = LoadedState::default();
        let mut messages: BTreeMap<u64, LoadedMessage> = BTreeMap::new();
        let mut counters: Vec<(u64, u64)> = Vec::new();
        let mut max_id = 0u64;

        for RecordInfo { id, user_type, data, .. } in loaded.committed {
            max_id = max_id.max(id);
            match user_type {
                ADD_MESSAGE => {
                    let message = Message::from_bytes(&data)?;
                    messages.insert(
                        id,
                        LoadedMessage {
                            message,
                            references: Vec::new(),
                        },
                    );
                }
                ADD_REF => {
                    let (queue_id, scheduled_delivery) = decode_add_ref(&data)?;
                    if let Some(loaded) = messages.get_mut(&id) {
                        loaded.references.push(LoadedReference {
                            queue_id,
                            delivery_count: 0,
                            scheduled_delivery,
                        });
                    }
                }
                ACKNOWLEDGE_REF => {
                    let queue_id = decode_queue_id(&data)?;
                    if let Some(loaded) = messages.get_mut(&id) {
                        if let Some(pos) = loaded.references.iter().position(|r| r.queue_id == queue_id) {
                            loaded.references.remove(pos);
                        }
                    }
                }
                UPDATE_DELIVERY_COUNT => {
                    let (queue_id, count) = decode_delivery_count(&data)?;
                    if let Some(reference) = messages
                        .get_mut(&id)
                        .and_then(|m| m.references.iter_mut().find(|r| r.queue_id == queue_id))
                    {
                        reference.delivery_count = count;
                    }
                }
                BINDING_RECORD => state.bindings.push(BindingRecord::decode(&data)?),
                ID_COUNTER_RECORD => counters.push((id, decode_id_counter(&data)?)),
                PAGE_TRANSACTION => state
                    .page_transactions
                    .push(PageTransactionRecord::decode(id, &data)?),
                DUPLICATE_ID => state.duplicate_ids.push(DuplicateIdRecord::decode(id, &data)?),
                other => warn!("ignoring journal record {id} with unknown type {other}"),
            }
        }

        for tx in loaded.prepared {
            max_id = max_id.max(tx.tx_id);
            for info in &tx.records {
                max_id = max_id.max(info.id);
            }
            state.prepared.push(prepared_record(tx));
        }

        // Messages with every reference acknowledged but no delete.
        let mut orphans = 0;
        for (id, loaded) in messages {
            if loaded.references.is_empty() {
                let still_needed = state
                    .prepared
                    .iter()
                    .any(|p| p.references.iter().any(|&(_, m, _)| m == id));
                if !still_needed {
                    self.journal.append_delete_record(id)?;
                    orphans += 1;
                    continue;
                }
            }
            state.messages.push(loaded);
        }
        if orphans > 0 {
            debug!("deleted {orphans} messages without references");
        }

        let ceiling = counters.iter().map(|&(_, c)| c).max().unwrap_or(0);
        let newest = counters.iter().max_by_key(|&&(_, c)| c).map(|&(id, _)| id);
        for &(record_id, _) in &counters {
            if Some(record_id) != newest {
                self.journal.append_delete_record(record_id)?;
            }
        }
        {
            let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
            ids.next = ceiling.max(max_id + 1).max(1);
            ids.ceiling = ids.next;
            ids.counter_record = newest;
        }

        info!(
            "storage loaded: {} bindings, {} messages, {} prepared transactions, {} page transactions",
            state.bindings.len(),
            state.messages.len(),
            state.prepared.len(),
            state.page_transactions.len()
        );
        Ok(state)
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn generate_id(&self) -> Result<u64> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if ids.next >= ids.ceiling {
            let record_id = ids.next;
            let ceiling = record_id + 1 + self.batch;
            self.journal
                .append_add_record(record_id, ID_COUNTER_RECORD, &encode_id_counter(ceiling))?;
            if let Some(previous) = ids.counter_record.replace(record_id) {
                self.journal.append_delete_record(previous)?;
            }
            ids.next = record_id + 1;
            ids.ceiling = ceiling;
        }
        let id = ids.next;
        ids.next += 1;
        Ok(id)
    }

    fn store_message(&self, message: &Message) -> Result<()> {
        self.journal
            .append_add_record(message.id, ADD_MESSAGE, &message.to_bytes())
    }

    fn store_reference(&self, queue_id: u64, message_id: u64, scheduled_delivery: u64) -> Result<()> {
        self.journal.append_update_record(
            message_id,
            ADD_REF,
            &encode_add_ref(queue_id, scheduled_delivery),
        )
    }

    fn store_acknowledge(&self, queue_id: u64, message_id: u64) -> Result<()> {
        self.journal
            .append_update_record(message_id, ACKNOWLEDGE_REF, &encode_queue_id(queue_id))
    }

    fn update_delivery_count(&self, queue_id: u64, message_id: u64, count: u32) -> Result<()> {
        self.journal.append_update_record(
            message_id,
            UPDATE_DELIVERY_COUNT,
            &encode_delivery_count(queue_id, count),
        )
    }

    fn delete_message(&self, message_id: u64) -> Result<()> {
        self.journal.append_delete_record(message_id)
    }

    fn store_message_transactional(&self, tx_id: u64, message: &Message) -> Result<()> {
        self.journal
            .append_add_record_transactional(tx_id, message.id, ADD_MESSAGE, &message.to_bytes())
    }

    fn store_reference_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
        scheduled_delivery: u64,
    ) -> Result<()> {
        self.journal.append_update_record_transactional(
            tx_id,
            message_id,
            ADD_REF,
            &encode_add_ref(queue_id, scheduled_delivery),
        )
    }

    fn store_acknowledge_transactional(&self, tx_id: u64, queue_id: u64, message_id: u64) -> Result<()> {
        self.journal.append_update_record_transactional(
            tx_id,
            message_id,
            ACKNOWLEDGE_REF,
            &encode_queue_id(queue_id),
        )
    }

    fn delete_message_transactional(&self, tx_id: u64, message_id: u64) -> Result<()> {
        self.journal.append_delete_record_transactional(tx_id, message_id)
    }

    fn prepare(&self, tx_id: u64, data: &[u8]) -> Result<()> {
        self.journal.append_prepare_record(tx_id, data)
    }

    fn commit(&self, tx_id: u64) -> Result<()> {
        self.journal.append_commit_record(tx_id)
    }

    fn rollback(&self, tx_id: u64) -> Result<()> {
        self.journal.append_rollback_record(tx_id)
    }

    fn store_page_transaction(&self, tx_id: u64, record: &PageTransactionRecord) -> Result<()> {
        self.journal
            .append_add_record_transactional(tx_id, record.id, PAGE_TRANSACTION, &record.encode())
    }

    fn delete_page_transaction(&self, record_id: u64) -> Result<()> {
        self.journal.append_delete_record(record_id)
    }

    fn store_duplicate_id(&self, record: &DuplicateIdRecord, tx_id: Option<u64>) -> Result<()> {
        let data = record.encode();
        match tx_id {
            Some(tx_id) => self
                .journal
                .append_add_record_transactional(tx_id, record.id, DUPLICATE_ID, &data),
            None => self.journal.append_add_record(record.id, DUPLICATE_ID, &data),
        }
    }

    fn delete_duplicate_id(&self, record_id: u64) -> Result<()> {
        self.journal.append_delete_record(record_id)
    }

    fn add_binding(&self, binding: &BindingRecord) -> Result<()> {
        self.journal
            .append_add_record(binding.queue_id, records::BINDING_RECORD, &binding.encode())
    }

    fn delete_binding(&self, queue_id: u64) -> Result<()> {
        self.journal.append_delete_record(queue_id)
    }

    fn stop(&self) {
        self.journal.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> JournalStorageManager {
        let config = JournalConfig {
            directory: dir.path().join("journal"),
            file_size: 64 * 1024,
            ..JournalConfig::default()
        };
        JournalStorageManager::new(config, 10).expect("storage")
    }

    fn message(storage: &JournalStorageManager, body: &'static str) -> Message {
        let mut message = Message::new("orders", Bytes::from_static(body.as_bytes())).with_durable(true);
        message.id = storage.generate_id().unwrap();
        message
    }

    #[test]
    fn ids_keep_increasing_across_restarts() {
        let dir = TempDir::new().unwrap();
        let last = {
            let storage = storage(&dir);
            storage.load().unwrap();
            let ids: Vec<u64> = (0..25).map(|_| storage.generate_id().unwrap()).collect();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            *ids.last().unwrap()
        };
        let storage = storage(&dir);
        storage.load().unwrap();
        assert!(storage.generate_id().unwrap() > last);
        // Only the newest counter record survives.
        assert_eq!(storage.journal().id_map_size(), 1);
    }

    #[test]
    fn references_acks_and_delivery_counts_reload() {
        let dir = TempDir::new().unwrap();
        let (a, b) = {
            let storage = storage(&dir);
            storage.load().unwrap();
            let a = message(&storage, "a");
            let b = message(&storage, "b");
            for m in [&a, &b] {
                storage.store_message(m).unwrap();
                storage.store_reference(100, m.id, 0).unwrap();
                storage.store_reference(200, m.id, 5_000).unwrap();
            }
            storage.store_acknowledge(100, a.id).unwrap();
            storage.update_delivery_count(200, a.id, 3).unwrap();
            storage.store_acknowledge(100, b.id).unwrap();
            storage.store_acknowledge(200, b.id).unwrap();
            (a, b)
        };

        let storage = storage(&dir);
        let state = storage.load().unwrap();
        assert_eq!(state.messages.len(), 1);
        let loaded = &state.messages[0];
        assert_eq!(loaded.message, a);
        assert_eq!(
            loaded.references,
            vec![LoadedReference {
                queue_id: 200,
                delivery_count: 3,
                scheduled_delivery: 5_000
            }]
        );
        // b had no references left and was deleted during load.
        assert!(!state.message_ids().any(|id| id == b.id));
    }

    #[test]
    fn bindings_persist_until_deleted() {
        let dir = TempDir::new().unwrap();
        {
            let storage = storage(&dir);
            storage.load().unwrap();
            for (name, filter) in [("q1", None), ("q2", Some("color = 'red'"))] {
                let queue_id = storage.generate_id().unwrap();
                storage
                    .add_binding(&BindingRecord {
                        queue_id,
                        address: "orders".into(),
                        queue_name: name.into(),
                        filter: filter.map(String::from),
                    })
                    .unwrap();
            }
        }
        let storage = storage(&dir);
        let state = storage.load().unwrap();
        assert_eq!(state.bindings.len(), 2);
        assert_eq!(state.bindings[1].filter.as_deref(), Some("color = 'red'"));
        storage.delete_binding(state.bindings[0].queue_id).unwrap();
        drop(storage);

        let storage = self::storage(&dir);
        let state = storage.load().unwrap();
        assert_eq!(state.bindings.len(), 1);
        assert_eq!(state.bindings[0].queue_name, "q2");
    }

    #[test]
    fn prepared_transactions_are_decoded() {
        let dir = TempDir::new().unwrap();
        let (tx_id, sent, acked) = {
            let storage = storage(&dir);
            storage.load().unwrap();
            let acked = message(&storage, "old");
            storage.store_message(&acked).unwrap();
            storage.store_reference(7, acked.id, 0).unwrap();

            let tx_id = storage.generate_id().unwrap();
            let sent = message(&storage, "new");
            storage.store_message_transactional(tx_id, &sent).unwrap();
            storage.store_reference_transactional(tx_id, 7, sent.id, 0).unwrap();
            storage.store_acknowledge_transactional(tx_id, 7, acked.id).unwrap();
            let page_tx = PageTransactionRecord {
                id: storage.generate_id().unwrap(),
                tx_id,
                message_count: 2,
            };
            storage.store_page_transaction(tx_id, &page_tx).unwrap();
            storage.prepare(tx_id, b"xid").unwrap();
            (tx_id, sent, acked)
        };

        let storage = storage(&dir);
        let state = storage.load().unwrap();
        assert_eq!(state.prepared.len(), 1);
        let prepared = &state.prepared[0];
        assert_eq!(prepared.tx_id, tx_id);
        assert_eq!(prepared.data, b"xid");
        assert_eq!(prepared.messages, vec![sent.clone()]);
        assert_eq!(prepared.references, vec![(7, sent.id, 0)]);
        assert_eq!(prepared.acknowledgements, vec![(7, acked.id)]);
        assert_eq!(prepared.page_transactions[0].message_count, 2);
        assert!(state.page_transactions.is_empty());
        // The acknowledged message is still committed until the tx resolves.
        assert_eq!(state.messages.len(), 1);
        assert!(state.message_ids().any(|id| id == sent.id));
    }
}
