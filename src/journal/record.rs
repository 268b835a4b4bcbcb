//! On-disk record framing.
//!
//! ```text
//! [type:1][record_id:8][user_type:1][data_len:4][data][tx_id:8, tx records only][crc32:4]
//! ```
//!
//! All integers are little-endian. The crc covers every preceding byte of the
//! record. A zero type byte marks the end of written data in a file. PREPARE,
//! COMMIT and ROLLBACK carry the transaction id in `record_id`; the data of
//! PREPARE and COMMIT starts with the number of records the transaction wrote.

use crate::{Error, Result};

pub const ADD_RECORD: u8 = 11;
pub const UPDATE_RECORD: u8 = 12;
pub const ADD_RECORD_TX: u8 = 13;
pub const UPDATE_RECORD_TX: u8 = 14;
pub const DELETE_RECORD: u8 = 15;
pub const DELETE_RECORD_TX: u8 = 16;
pub const PREPARE_RECORD: u8 = 17;
pub const COMMIT_RECORD: u8 = 18;
pub const ROLLBACK_RECORD: u8 = 19;

const FIXED_LEN: usize = 1 + 8 + 1 + 4;
const CRC_LEN: usize = 4;
const TX_LEN: usize = 8;

/// Largest data payload a single record may carry.
pub const MAX_DATA_LEN: usize = u32::MAX as usize - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Add { id: u64, user_type: u8, data: Vec<u8> },
    Update { id: u64, user_type: u8, data: Vec<u8> },
    Delete { id: u64 },
    AddTx { tx_id: u64, id: u64, user_type: u8, data: Vec<u8> },
    UpdateTx { tx_id: u64, id: u64, user_type: u8, data: Vec<u8> },
    DeleteTx { tx_id: u64, id: u64 },
    Prepare { tx_id: u64, record_count: u32, data: Vec<u8> },
    Commit { tx_id: u64, record_count: u32 },
    Rollback { tx_id: u64 },
}

/// Outcome of decoding at a file offset.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Record(Record, usize),
    /// Zeroed space: nothing more was written to this file.
    End,
    /// A partial or damaged record.
    Torn(&'static str),
}

impl Record {
    pub fn type_code(&self) -> u8 {
        match self {
            Record::Add { .. } => ADD_RECORD,
            Record::Update { .. } => UPDATE_RECORD,
            Record::Delete { .. } => DELETE_RECORD,
            Record::AddTx { .. } => ADD_RECORD_TX,
            Record::UpdateTx { .. } => UPDATE_RECORD_TX,
            Record::DeleteTx { .. } => DELETE_RECORD_TX,
            Record::Prepare { .. } => PREPARE_RECORD,
            Record::Commit { .. } => COMMIT_RECORD,
            Record::Rollback { .. } => ROLLBACK_RECORD,
        }
    }

    pub fn tx_id(&self) -> Option<u64> {
        match self {
            Record::AddTx { tx_id, .. }
            | Record::UpdateTx { tx_id, .. }
            | Record::DeleteTx { tx_id, .. }
            | Record::Prepare { tx_id, .. }
            | Record::Commit { tx_id, .. }
            | Record::Rollback { tx_id } => Some(*tx_id),
            _ => None,
        }
    }

    fn parts(&self) -> (u64, u8, DataRef<'_>, Option<u64>) {
        match self {
            Record::Add { id, user_type, data } | Record::Update { id, user_type, data } => {
                (*id, *user_type, DataRef::Plain(data), None)
            }
            Record::Delete { id } => (*id, 0, DataRef::Plain(&[]), None),
            Record::AddTx {
                tx_id,
                id,
                user_type,
                data,
            }
            | Record::UpdateTx {
                tx_id,
                id,
                user_type,
                data,
            } => (*id, *user_type, DataRef::Plain(data), Some(*tx_id)),
            Record::DeleteTx { tx_id, id } => (*id, 0, DataRef::Plain(&[]), Some(*tx_id)),
            Record::Prepare {
                tx_id,
                record_count,
                data,
            } => (*tx_id, 0, DataRef::Counted(*record_count, data), None),
            Record::Commit {
                tx_id,
                record_count,
            } => (*tx_id, 0, DataRef::Counted(*record_count, &[]), None),
            Record::Rollback { tx_id } => (*tx_id, 0, DataRef::Plain(&[]), None),
        }
    }

    pub fn encoded_len(&self) -> usize {
        let (_, _, data, tx) = self.parts();
        FIXED_LEN + data.len() + tx.map_or(0, |_| TX_LEN) + CRC_LEN
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let (id, user_type, data, tx) = self.parts();
        if data.len() > MAX_DATA_LEN {
            return Err(Error::Unsupported("journal record data too large"));
        }
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.type_code());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.push(user_type);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        match data {
            DataRef::Plain(bytes) => buf.extend_from_slice(bytes),
            DataRef::Counted(count, bytes) => {
                buf.extend_from_slice(&count.to_le_bytes());
                buf.extend_from_slice(bytes);
            }
        }
        if let Some(tx_id) = tx {
            buf.extend_from_slice(&tx_id.to_le_bytes());
        }
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes the record starting at `buf[0]`.
    pub fn decode(buf: &[u8]) -> Decoded {
        let Some(&code) = buf.first() else {
            return Decoded::End;
        };
        if code == 0 {
            return Decoded::End;
        }
        let has_tx = matches!(code, ADD_RECORD_TX | UPDATE_RECORD_TX | DELETE_RECORD_TX);
        if !(ADD_RECORD..=ROLLBACK_RECORD).contains(&code) {
            return Decoded::Torn("unknown record type");
        }
        if buf.len() < FIXED_LEN {
            return Decoded::Torn("truncated record header");
        }
        let id = u64::from_le_bytes(buf[1..9].try_into().expect("slice length"));
        let user_type = buf[9];
        let data_len = u32::from_le_bytes(buf[10..14].try_into().expect("slice length")) as usize;
        let total = FIXED_LEN
            .saturating_add(data_len)
            .saturating_add(if has_tx { TX_LEN } else { 0 })
            .saturating_add(CRC_LEN);
        if total > buf.len() {
            return Decoded::Torn("record extends past end of file");
        }
        let body_end = total - CRC_LEN;
        let stored_crc = u32::from_le_bytes(buf[body_end..total].try_into().expect("slice length"));
        if crc32(&buf[..body_end]) != stored_crc {
            return Decoded::Torn("record crc mismatch");
        }
        let data = &buf[FIXED_LEN..FIXED_LEN + data_len];
        let tx_id = if has_tx {
            u64::from_le_bytes(
                buf[FIXED_LEN + data_len..FIXED_LEN + data_len + TX_LEN]
                    .try_into()
                    .expect("slice length"),
            )
        } else {
            0
        };
        let counted = |data: &[u8]| -> Option<(u32, Vec<u8>)> {
            if data.len() < 4 {
                return None;
            }
            let count = u32::from_le_bytes(data[0..4].try_into().expect("slice length"));
            Some((count, data[4..].to_vec()))
        };
        let record = match code {
            ADD_RECORD => Record::Add {
                id,
                user_type,
                data: data.to_vec(),
            },
            UPDATE_RECORD => Record::Update {
                id,
                user_type,
                data: data.to_vec(),
            },
            DELETE_RECORD => Record::Delete { id },
            ADD_RECORD_TX => Record::AddTx {
                tx_id,
                id,
                user_type,
                data: data.to_vec(),
            },
            UPDATE_RECORD_TX => Record::UpdateTx {
                tx_id,
                id,
                user_type,
                data: data.to_vec(),
            },
            DELETE_RECORD_TX => Record::DeleteTx { tx_id, id },
            PREPARE_RECORD => match counted(data) {
                Some((record_count, data)) => Record::Prepare {
                    tx_id: id,
                    record_count,
                    data,
                },
                None => return Decoded::Torn("prepare record without count"),
            },
            COMMIT_RECORD => match counted(data) {
                Some((record_count, _)) => Record::Commit {
                    tx_id: id,
                    record_count,
                },
                None => return Decoded::Torn("commit record without count"),
            },
            _ => Record::Rollback { tx_id: id },
        };
        Decoded::Record(record, total)
    }
}

enum DataRef<'a> {
    Plain(&'a [u8]),
    Counted(u32, &'a [u8]),
}

impl DataRef<'_> {
    fn len(&self) -> usize {
        match self {
            DataRef::Plain(bytes) => bytes.len(),
            DataRef::Counted(_, bytes) => 4 + bytes.len(),
        }
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
