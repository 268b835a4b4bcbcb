//! Big-endian field helpers shared by the message and packet encodings.

use bytes::{Buf, BufMut, Bytes};

use crate::{Error, Result};

fn need(buf: &impl Buf, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Corrupt("buffer underflow"));
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

pub fn get_i32(buf: &mut impl Buf) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_len(buf: &mut impl Buf) -> Result<usize> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(Error::Corrupt("negative length"));
    }
    let len = len as usize;
    need(buf, len)?;
    Ok(len)
}

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

pub fn get_bytes(buf: &mut impl Buf) -> Result<Bytes> {
    let len = get_len(buf)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_string(buf: &mut impl BufMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn get_string(buf: &mut impl Buf) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupt("string is not utf-8"))
}

/// `0` for null, otherwise `1` followed by a length-prefixed string.
pub fn put_nullable_string(buf: &mut impl BufMut, value: Option<&str>) {
    match value {
        None => buf.put_u8(0),
        Some(value) => {
            buf.put_u8(1);
            put_string(buf, value);
        }
    }
}

pub fn get_nullable_string(buf: &mut impl Buf) -> Result<Option<String>> {
    match get_u8(buf)? {
        0 => Ok(None),
        1 => get_string(buf).map(Some),
        _ => Err(Error::Corrupt("bad nullable string marker")),
    }
}

pub fn nullable_string_len(value: Option<&str>) -> usize {
    1 + value.map_or(0, |v| 4 + v.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn nullable_strings() {
        let mut buf = BytesMut::new();
        put_nullable_string(&mut buf, None);
        put_nullable_string(&mut buf, Some("queue.a"));
        assert_eq!(buf.len(), nullable_string_len(None) + nullable_string_len(Some("queue.a")));
        assert_eq!(&buf[..6], &[0, 1, 0, 0, 0, 7]);

        let mut bytes = buf.freeze();
        assert_eq!(get_nullable_string(&mut bytes).unwrap(), None);
        assert_eq!(get_nullable_string(&mut bytes).unwrap().as_deref(), Some("queue.a"));
        assert!(get_nullable_string(&mut bytes).is_err());
    }

    #[test]
    fn short_buffers_fail_cleanly() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 9, b'a']);
        assert!(matches!(get_bytes(&mut bytes), Err(Error::Corrupt(_))));
        let mut bytes = Bytes::from_static(&[1, 2]);
        assert!(get_u64(&mut bytes).is_err());
    }
}
