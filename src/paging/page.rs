//! Page files.
//!
//! A page is an append-only file of framed entries:
//! `[len u32 LE][crc32 u32 LE][tx_id u64][message]`. `len` covers everything
//! after the crc. A tx id of zero means the message was paged outside a
//! transaction.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use log::warn;

use crate::journal::file;
use crate::message::Message;
use crate::Result;

pub const PAGE_EXTENSION: &str = "page";
const ENTRY_HEADER: usize = 8;

/// A message read back from a page.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedMessage {
    pub tx_id: Option<u64>,
    pub message: Message,
}

impl PagedMessage {
    fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(8 + self.message.encoded_size());
        body.put_u64(self.tx_id.unwrap_or(0));
        self.message.encode(&mut body);

        let mut entry = Vec::with_capacity(ENTRY_HEADER + body.len());
        entry.put_u32_le(body.len() as u32);
        entry.put_u32_le(crc32fast::hash(&body));
        entry.extend_from_slice(&body);
        entry
    }

    fn decode(mut body: &[u8]) -> Result<Self> {
        let tx_id = crate::buffer::get_u64(&mut body)?;
        let message = Message::decode(&mut body)?;
        Ok(Self {
            tx_id: (tx_id != 0).then_some(tx_id),
            message,
        })
    }
}

pub struct Page {
    id: u64,
    path: PathBuf,
    file: File,
    size: usize,
    messages: u32,
}

impl Page {
    pub fn create(dir: &Path, id: u64) -> Result<Self> {
        let path = file::file_path(dir, id, PAGE_EXTENSION);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let size = file.metadata()?.len() as usize;
        Ok(Self {
            id,
            path,
            file,
            size,
            messages: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn message_count(&self) -> u32 {
        self.messages
    }

    /// Appends one entry, syncing it when `sync` is set.
    pub fn write(&mut self, paged: &PagedMessage, sync: bool) -> Result<usize> {
        let entry = paged.encode();
        self.file.write_all(&entry)?;
        if sync {
            self.file.sync_data()?;
        }
        self.size += entry.len();
        self.messages += 1;
        Ok(entry.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Reads every complete entry of a page. A torn or corrupt entry ends the
/// page; the rest of the file is ignored.
pub fn read_page(dir: &Path, id: u64) -> Result<Vec<PagedMessage>> {
    let path = file::file_path(dir, id, PAGE_EXTENSION);
    let mut data = Vec::new();
    File::open(&path)?.read_to_end(&mut data)?;

    let mut messages = Vec::new();
    let mut buf = data.as_slice();
    while buf.remaining() >= ENTRY_HEADER {
        let len = (&buf[..4]).get_u32_le() as usize;
        let crc = (&buf[4..8]).get_u32_le();
        if len == 0 || buf.len() < ENTRY_HEADER + len {
            warn!("page {} ends with a torn entry", path.display());
            break;
        }
        let body = &buf[ENTRY_HEADER..ENTRY_HEADER + len];
        if crc32fast::hash(body) != crc {
            warn!("page {} has a corrupt entry, ignoring the rest", path.display());
            break;
        }
        messages.push(PagedMessage::decode(body)?);
        buf.advance(ENTRY_HEADER + len);
    }
    Ok(messages)
}

pub fn delete_page(dir: &Path, id: u64) -> Result<()> {
    match fs::remove_file(file::file_path(dir, id, PAGE_EXTENSION)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub fn discover_pages(dir: &Path) -> Result<Vec<u64>> {
    file::discover_files(dir, PAGE_EXTENSION)
}
