//! Packet framing.
//!
//! ```text
//! [type u8][header_len i32][correlation_id i64][target_id nullable string]
//! [callback_id nullable string][one_way bool][body_len i32][body]
//! ```
//!
//! `header_len` covers the correlation id through the one-way flag. All
//! integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::buffer;
use crate::remoting::packet::{Packet, PacketBody, PacketType};
use crate::{Error, Result};

/// Framing state of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decodable {
    /// The next packet is not complete yet.
    NeedData,
    /// A complete packet of this many bytes is at the front of the buffer.
    Ok(usize),
    /// The buffer cannot start a packet.
    Invalid,
}

/// Largest frame a connection accepts unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

pub struct Codec;

impl Codec {
    pub fn encode(packet: &Packet, buf: &mut BytesMut) {
        let header_len = 8
            + buffer::nullable_string_len(packet.target_id.as_deref())
            + buffer::nullable_string_len(packet.callback_id.as_deref())
            + 1;
        buf.put_u8(packet.packet_type().as_u8());
        buf.put_i32(header_len as i32);
        buf.put_i64(packet.correlation_id);
        buffer::put_nullable_string(buf, packet.target_id.as_deref());
        buffer::put_nullable_string(buf, packet.callback_id.as_deref());
        buf.put_u8(packet.one_way as u8);

        let len_at = buf.len();
        buf.put_i32(0);
        packet.body.encode(buf);
        let body_len = (buf.len() - len_at - 4) as i32;
        buf[len_at..len_at + 4].copy_from_slice(&body_len.to_be_bytes());
    }

    /// Checks whether `buf` starts with a complete packet without consuming
    /// anything. Frames longer than `max_frame_size` are invalid.
    pub fn decodable(buf: &[u8], max_frame_size: usize) -> Decodable {
        if buf.is_empty() {
            return Decodable::NeedData;
        }
        if PacketType::from_u8(buf[0]).is_none() {
            return Decodable::Invalid;
        }
        let Some(header_len) = read_i32(buf, 1) else {
            return Decodable::NeedData;
        };
        if header_len < 9 {
            return Decodable::Invalid;
        }
        let body_len_at = 5 + header_len as usize;
        if body_len_at + 4 > max_frame_size {
            return Decodable::Invalid;
        }
        let Some(body_len) = read_i32(buf, body_len_at) else {
            return Decodable::NeedData;
        };
        if body_len < 0 {
            return Decodable::Invalid;
        }
        let total = body_len_at + 4 + body_len as usize;
        if total > max_frame_size {
            Decodable::Invalid
        } else if buf.len() < total {
            Decodable::NeedData
        } else {
            Decodable::Ok(total)
        }
    }

    /// Decodes one complete packet, as reported by [`Codec::decodable`].
    pub fn decode(mut frame: &[u8]) -> Result<Packet> {
        let buf = &mut frame;
        let type_byte = buffer::get_u8(buf)?;
        let packet_type = PacketType::from_u8(type_byte).ok_or(Error::UnsupportedPacket(type_byte))?;
        let _header_len = buffer::get_i32(buf)?;
        let correlation_id = buffer::get_i64(buf)?;
        let target_id = buffer::get_nullable_string(buf)?;
        let callback_id = buffer::get_nullable_string(buf)?;
        let one_way = buffer::get_bool(buf)?;
        let body_len = buffer::get_i32(buf)?;
        if body_len < 0 || buf.remaining() < body_len as usize {
            return Err(Error::Corrupt("truncated packet body"));
        }
        let mut body = &buf[..body_len as usize];
        let body = PacketBody::decode(packet_type, &mut body)?;
        Ok(Packet {
            correlation_id,
            target_id,
            callback_id,
            one_way,
            body,
        })
    }
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    let bytes = buf.get(at..at + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
