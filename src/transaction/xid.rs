use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::buffer;
use crate::Result;

/// An XA transaction branch identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_transaction_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_transaction_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        4 + 4 + self.branch_qualifier.len() + 4 + self.global_transaction_id.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.format_id);
        buffer::put_bytes(buf, &self.branch_qualifier);
        buffer::put_bytes(buf, &self.global_transaction_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let format_id = buffer::get_i32(buf)?;
        let branch_qualifier = buffer::get_bytes(buf)?.to_vec();
        let global_transaction_id = buffer::get_bytes(buf)?.to_vec();
        Ok(Self {
            format_id,
            global_transaction_id,
            branch_qualifier,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.to_vec()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        Self::decode(&mut data)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({}:", self.format_id)?;
        for b in &self.global_transaction_id {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}
