//! Journal user-record types and their payload encodings.

use bytes::{BufMut, BytesMut};

use crate::buffer;
use crate::Result;

pub const BINDING_RECORD: u8 = 21;
pub const ID_COUNTER_RECORD: u8 = 24;
pub const ADD_MESSAGE: u8 = 30;
pub const ADD_REF: u8 = 32;
pub const ACKNOWLEDGE_REF: u8 = 33;
pub const UPDATE_DELIVERY_COUNT: u8 = 34;
pub const PAGE_TRANSACTION: u8 = 35;
pub const DUPLICATE_ID: u8 = 36;

/// A durable queue binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRecord {
    pub queue_id: u64,
    pub address: String,
    pub queue_name: String,
    pub filter: Option<String>,
}

impl BindingRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u64(self.queue_id);
        buffer::put_string(&mut buf, &self.address);
        buffer::put_string(&mut buf, &self.queue_name);
        buffer::put_nullable_string(&mut buf, self.filter.as_deref());
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let buf = &mut data;
        Ok(Self {
            queue_id: buffer::get_u64(buf)?,
            address: buffer::get_string(buf)?,
            queue_name: buffer::get_string(buf)?,
            filter: buffer::get_nullable_string(buf)?,
        })
    }
}

/// Journal footprint of a transaction that sent messages while paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTransactionRecord {
    pub id: u64,
    pub tx_id: u64,
    pub message_count: u32,
}

impl PageTransactionRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.put_u64(self.tx_id);
        buf.put_u32(self.message_count);
        buf
    }

    pub fn decode(id: u64, mut data: &[u8]) -> Result<Self> {
        let buf = &mut data;
        Ok(Self {
            id,
            tx_id: buffer::get_u64(buf)?,
            message_count: buffer::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateIdRecord {
    pub id: u64,
    pub address: String,
    pub duplicate_id: Vec<u8>,
}

impl DuplicateIdRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buffer::put_string(&mut buf, &self.address);
        buffer::put_bytes(&mut buf, &self.duplicate_id);
        buf.to_vec()
    }

    pub fn decode(id: u64, mut data: &[u8]) -> Result<Self> {
        let buf = &mut data;
        Ok(Self {
            id,
            address: buffer::get_string(buf)?,
            duplicate_id: buffer::get_bytes(buf)?.to_vec(),
        })
    }
}

pub fn encode_add_ref(queue_id: u64, scheduled_delivery: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u64(queue_id);
    buf.put_u64(scheduled_delivery);
    buf
}

pub fn decode_add_ref(mut data: &[u8]) -> Result<(u64, u64)> {
    let buf = &mut data;
    Ok((buffer::get_u64(buf)?, buffer::get_u64(buf)?))
}

pub fn encode_queue_id(queue_id: u64) -> Vec<u8> {
    queue_id.to_be_bytes().to_vec()
}

pub fn decode_queue_id(mut data: &[u8]) -> Result<u64> {
    buffer::get_u64(&mut data)
}

pub fn encode_delivery_count(queue_id: u64, count: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.put_u64(queue_id);
    buf.put_u32(count);
    buf
}

pub fn decode_delivery_count(mut data: &[u8]) -> Result<(u64, u32)> {
    let buf = &mut data;
    Ok((buffer::get_u64(buf)?, buffer::get_u32(buf)?))
}

pub fn encode_id_counter(ceiling: u64) -> Vec<u8> {
    ceiling.to_be_bytes().to_vec()
}

pub fn decode_id_counter(mut data: &[u8]) -> Result<u64> {
    buffer::get_u64(&mut data)
}
