//! Messages, typed headers and server-side references.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer;
use crate::{Error, Result};

/// Scheduled delivery time, epoch millis (long).
pub const HDR_SCHEDULED_DELIVERY_TIME: &str = "_COURIER_SCHED_DELIVERY";
/// Duplicate detection id (string or bytes).
pub const HDR_DUPLICATE_DETECTION_ID: &str = "_COURIER_DUPL_ID";
/// Queue ids appended by remote bindings (bytes, big-endian u64s).
pub const HDR_ROUTE_TO: &str = "_COURIER_ROUTE_TO";
pub const HDR_ORIGINAL_ADDRESS: &str = "_COURIER_ORIG_ADDRESS";
pub const HDR_ORIGINAL_QUEUE: &str = "_COURIER_ORIG_QUEUE";

pub const DEFAULT_PRIORITY: u8 = 4;
pub const MAX_PRIORITY: u8 = 9;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Default = 0,
    Object = 2,
    Text = 3,
    Bytes = 4,
    Map = 5,
    Stream = 6,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Default,
            2 => Self::Object,
            3 => Self::Text,
            4 => Self::Bytes,
            5 => Self::Map,
            6 => Self::Stream,
            _ => return Err(Error::Corrupt("unknown message type")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
}

impl TypedValue {
    fn tag(&self) -> u8 {
        match self {
            TypedValue::Bool(_) => 1,
            TypedValue::Byte(_) => 2,
            TypedValue::Short(_) => 3,
            TypedValue::Int(_) => 4,
            TypedValue::Long(_) => 5,
            TypedValue::Float(_) => 6,
            TypedValue::Double(_) => 7,
            TypedValue::String(_) => 8,
            TypedValue::Bytes(_) => 9,
        }
    }

    /// Integral values widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            TypedValue::Byte(v) => Some(v as i64),
            TypedValue::Short(v) => Some(v as i64),
            TypedValue::Int(v) => Some(v as i64),
            TypedValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            TypedValue::Float(v) => Some(v as f64),
            TypedValue::Double(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn encoded_size(&self) -> usize {
        1 + match self {
            TypedValue::Bool(_) | TypedValue::Byte(_) => 1,
            TypedValue::Short(_) => 2,
            TypedValue::Int(_) | TypedValue::Float(_) => 4,
            TypedValue::Long(_) | TypedValue::Double(_) => 8,
            TypedValue::String(v) => 4 + v.len(),
            TypedValue::Bytes(v) => 4 + v.len(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag());
        match self {
            TypedValue::Bool(v) => buf.put_u8(*v as u8),
            TypedValue::Byte(v) => buf.put_i8(*v),
            TypedValue::Short(v) => buf.put_i16(*v),
            TypedValue::Int(v) => buf.put_i32(*v),
            TypedValue::Long(v) => buf.put_i64(*v),
            TypedValue::Float(v) => buf.put_f32(*v),
            TypedValue::Double(v) => buf.put_f64(*v),
            TypedValue::String(v) => buffer::put_string(buf, v),
            TypedValue::Bytes(v) => buffer::put_bytes(buf, v),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let tag = buffer::get_u8(buf)?;
        let width = match tag {
            1 | 2 => 1,
            3 => 2,
            4 | 6 => 4,
            5 | 7 => 8,
            _ => 0,
        };
        if buf.remaining() < width {
            return Err(Error::Corrupt("buffer underflow"));
        }
        Ok(match tag {
            1 => TypedValue::Bool(buf.get_u8() != 0),
            2 => TypedValue::Byte(buf.get_i8()),
            3 => TypedValue::Short(buf.get_i16()),
            4 => TypedValue::Int(buf.get_i32()),
            5 => TypedValue::Long(buf.get_i64()),
            6 => TypedValue::Float(buf.get_f32()),
            7 => TypedValue::Double(buf.get_f64()),
            8 => TypedValue::String(buffer::get_string(buf)?),
            9 => TypedValue::Bytes(buffer::get_bytes(buf)?),
            _ => return Err(Error::Corrupt("unknown header value type")),
        })
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Bool(v) => write!(f, "{v}"),
            TypedValue::Byte(v) => write!(f, "{v}"),
            TypedValue::Short(v) => write!(f, "{v}"),
            TypedValue::Int(v) => write!(f, "{v}"),
            TypedValue::Long(v) => write!(f, "{v}"),
            TypedValue::Float(v) => write!(f, "{v}"),
            TypedValue::Double(v) => write!(f, "{v}"),
            TypedValue::String(v) => write!(f, "{v}"),
            TypedValue::Bytes(v) => write!(f, "{} bytes", v.len()),
        }
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        TypedValue::String(v.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(v: String) -> Self {
        TypedValue::String(v)
    }
}

impl From<i32> for TypedValue {
    fn from(v: i32) -> Self {
        TypedValue::Int(v)
    }
}

impl From<i64> for TypedValue {
    fn from(v: i64) -> Self {
        TypedValue::Long(v)
    }
}

impl From<bool> for TypedValue {
    fn from(v: bool) -> Self {
        TypedValue::Bool(v)
    }
}

/// A message as sent by a client and stored by the broker.
///
/// `id` is assigned by the broker when the message is routed; client-built
/// messages carry 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u64,
    pub message_type: MessageType,
    pub durable: bool,
    pub priority: u8,
    /// Epoch millis after which the message is dropped, 0 = never.
    pub expiration: u64,
    pub timestamp: u64,
    pub address: String,
    headers: BTreeMap<String, TypedValue>,
    pub body: Bytes,
}

impl Message {
    pub fn new(address: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            message_type: MessageType::Default,
            durable: false,
            priority: DEFAULT_PRIORITY,
            expiration: 0,
            timestamp: 0,
            address: address.into(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_expiration(mut self, expiration: u64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        self.put_header(key, value);
        self
    }

    pub fn put_header(&mut self, key: impl Into<String>, value: impl Into<TypedValue>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&TypedValue> {
        self.headers.get(key)
    }

    pub fn remove_header(&mut self, key: &str) -> Option<TypedValue> {
        self.headers.remove(key)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &TypedValue)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration != 0 && now_ms >= self.expiration
    }

    pub fn scheduled_delivery_time(&self) -> Option<u64> {
        self.header(HDR_SCHEDULED_DELIVERY_TIME)
            .and_then(TypedValue::as_i64)
            .map(|t| t.max(0) as u64)
    }

    pub fn duplicate_id(&self) -> Option<Bytes> {
        match self.header(HDR_DUPLICATE_DETECTION_ID)? {
            TypedValue::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            TypedValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// Queue ids written by remote bindings during routing.
    pub fn route_to(&self) -> Vec<u64> {
        match self.header(HDR_ROUTE_TO) {
            Some(TypedValue::Bytes(b)) => b
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap_or_default()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn add_route_to(&mut self, queue_id: u64) {
        let mut ids = match self.header(HDR_ROUTE_TO) {
            Some(TypedValue::Bytes(b)) => BytesMut::from(&b[..]),
            _ => BytesMut::new(),
        };
        ids.put_u64(queue_id);
        self.put_header(HDR_ROUTE_TO, TypedValue::Bytes(ids.freeze()));
    }

    pub fn encoded_size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(key, value)| 4 + key.len() + value.encoded_size())
            .sum();
        8 + 3 + 8 + 8 + 4 + self.address.len() + 4 + headers + 4 + self.body.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.durable as u8);
        buf.put_u8(self.priority);
        buf.put_u64(self.expiration);
        buf.put_u64(self.timestamp);
        buffer::put_string(buf, &self.address);
        buf.put_i32(self.headers.len() as i32);
        for (key, value) in &self.headers {
            buffer::put_string(buf, key);
            value.encode(buf);
        }
        buffer::put_bytes(buf, &self.body);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let id = buffer::get_u64(buf)?;
        let message_type = MessageType::from_u8(buffer::get_u8(buf)?)?;
        let durable = buffer::get_bool(buf)?;
        let priority = buffer::get_u8(buf)?.min(MAX_PRIORITY);
        let expiration = buffer::get_u64(buf)?;
        let timestamp = buffer::get_u64(buf)?;
        let address = buffer::get_string(buf)?;
        let count = buffer::get_i32(buf)?;
        if count < 0 {
            return Err(Error::Corrupt("negative header count"));
        }
        let mut headers = BTreeMap::new();
        for _ in 0..count {
            let key = buffer::get_string(buf)?;
            headers.insert(key, TypedValue::decode(buf)?);
        }
        let body = buffer::get_bytes(buf)?;
        Ok(Self {
            id,
            message_type,
            durable,
            priority,
            expiration,
            timestamp,
            address,
            headers,
            body,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut bytes)
    }
}

/// A message held by the broker, shared by all of its references.
///
/// The header map can still change after routing (dead-letter moves stamp
/// the original address and queue), so the message sits behind a lock. Fields
/// read on every delivery decision are copied out.
#[derive(Debug)]
pub struct ServerMessage {
    id: u64,
    durable: bool,
    priority: u8,
    expiration: u64,
    address: String,
    message: RwLock<Message>,
    ref_count: AtomicU32,
    durable_ref_count: AtomicU32,
}

impl ServerMessage {
    pub fn new(message: Message) -> Arc<Self> {
        Arc::new(Self {
            id: message.id,
            durable: message.durable,
            priority: message.priority.min(MAX_PRIORITY),
            expiration: message.expiration,
            address: message.address.clone(),
            message: RwLock::new(message),
            ref_count: AtomicU32::new(0),
            durable_ref_count: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration != 0 && now_ms >= self.expiration
    }

    pub fn message(&self) -> RwLockReadGuard<'_, Message> {
        self.message.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_header(&self, key: &str, value: TypedValue) {
        self.message
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .put_header(key, value);
    }

    /// Snapshot of the message for delivery or paging.
    pub fn snapshot(&self) -> Message {
        self.message().clone()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn durable_ref_count(&self) -> u32 {
        self.durable_ref_count.load(Ordering::Acquire)
    }

    pub fn increment_refs(&self, durable_queue: bool) -> u32 {
        if durable_queue && self.durable {
            self.durable_ref_count.fetch_add(1, Ordering::AcqRel);
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Undoes a [`decrement_durable_refs`](Self::decrement_durable_refs) of a
    /// prepared acknowledgement that was rolled back.
    pub fn restore_durable_ref(&self) -> u32 {
        self.durable_ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the remaining durable references.
    pub fn decrement_durable_refs(&self) -> u32 {
        decrement(&self.durable_ref_count)
    }

    /// Returns the remaining references.
    pub fn decrement_refs(&self) -> u32 {
        decrement(&self.ref_count)
    }
}

fn decrement(counter: &AtomicU32) -> u32 {
    let previous = counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
        .unwrap_or(0);
    previous.saturating_sub(1)
}

/// One delivery obligation: a message in a particular queue.
#[derive(Debug, Clone)]
pub struct MessageReference {
    message: Arc<ServerMessage>,
    queue_id: u64,
    durable_queue: bool,
    pub delivery_count: u32,
    /// Epoch millis before which the reference is not delivered, 0 = now.
    pub scheduled_delivery: u64,
}

impl MessageReference {
    pub fn new(message: Arc<ServerMessage>, queue_id: u64, durable_queue: bool) -> Self {
        let scheduled_delivery = message.message().scheduled_delivery_time().unwrap_or(0);
        Self {
            message,
            queue_id,
            durable_queue,
            delivery_count: 0,
            scheduled_delivery,
        }
    }

    pub fn message(&self) -> &Arc<ServerMessage> {
        &self.message
    }

    pub fn message_id(&self) -> u64 {
        self.message.id()
    }

    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    pub fn durable_queue(&self) -> bool {
        self.durable_queue
    }

    /// Whether this reference is journaled.
    pub fn is_durable(&self) -> bool {
        self.durable_queue && self.message.durable()
    }

    pub fn priority(&self) -> u8 {
        self.message.priority()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_encoding_is_stable() {
        let message = Message::new("orders.eu", Bytes::from_static(b"body"))
            .with_durable(true)
            .with_priority(7)
            .with_type(MessageType::Text)
            .with_expiration(99)
            .with_header("count", 3i32)
            .with_header("name", "widget")
            .with_header(HDR_SCHEDULED_DELIVERY_TIME, 1_000i64);
        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), message.encoded_size());
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.scheduled_delivery_time(), Some(1_000));
        assert!(Message::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn priority_is_clamped() {
        assert_eq!(Message::new("a", Bytes::new()).with_priority(42).priority, MAX_PRIORITY);
        assert_eq!(Message::new("a", Bytes::new()).priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn route_to_accumulates_queue_ids() {
        let mut message = Message::new("a", Bytes::new());
        assert!(message.route_to().is_empty());
        message.add_route_to(7);
        message.add_route_to(11);
        assert_eq!(message.route_to(), vec![7, 11]);
    }

    #[test]
    fn duplicate_id_accepts_strings_and_bytes() {
        let message = Message::new("a", Bytes::new()).with_header(HDR_DUPLICATE_DETECTION_ID, "abc");
        assert_eq!(message.duplicate_id().unwrap(), Bytes::from_static(b"abc"));
        let message = Message::new("a", Bytes::new()).with_header(
            HDR_DUPLICATE_DETECTION_ID,
            TypedValue::Bytes(Bytes::from_static(&[1, 2])),
        );
        assert_eq!(message.duplicate_id().unwrap(), Bytes::from_static(&[1, 2]));
    }

    #[test]
    fn server_message_counts_durable_refs_only_for_durable_queues() {
        let mut message = Message::new("a", Bytes::new()).with_durable(true);
        message.id = 5;
        let server = ServerMessage::new(message);
        assert_eq!(server.increment_refs(true), 1);
        assert_eq!(server.increment_refs(false), 2);
        assert_eq!(server.durable_ref_count(), 1);
        assert_eq!(server.decrement_durable_refs(), 0);
        assert_eq!(server.decrement_refs(), 1);
        assert_eq!(server.decrement_refs(), 0);
        assert_eq!(server.decrement_refs(), 0);
    }

    #[test]
    fn expiry_uses_absolute_time() {
        let message = Message::new("a", Bytes::new()).with_expiration(100);
        assert!(!message.is_expired(99));
        assert!(message.is_expired(100));
        assert!(!Message::new("a", Bytes::new()).is_expired(u64::MAX));
    }
}
