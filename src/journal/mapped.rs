use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// A journal file mapped read-write for its whole, fixed length.
pub struct MappedFile {
    file: File,
    map: MmapMut,
}

impl MappedFile {
    /// Creates (or truncates) `path` to `len` zero bytes and maps it. Every
    /// page is touched once so later appends do not fault.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("journal file length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mut mapped = Self::map(file, len)?;
        for offset in (PAGE_SIZE..len).step_by(PAGE_SIZE) {
            mapped.map[offset] = 0;
        }
        Ok(mapped)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("empty journal file"));
        }
        Self::map(file, len)
    }

    fn map(file: File, len: usize) -> Result<Self> {
        // The file stays open and sized for the lifetime of the mapping and
        // journal files are never truncated while mapped.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = self.end(offset, len)?;
        Ok(&self.map[offset..end])
    }

    /// Copies `bytes` in at `offset`. Nothing is flushed.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = self.end(offset, bytes.len())?;
        self.map[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Zeroes everything from `offset` to the end of the file and syncs.
    pub fn zero_from(&mut self, offset: usize) -> Result<()> {
        let len = self.len();
        if offset > len {
            return Err(Error::Corrupt("journal offset out of bounds"));
        }
        self.map[offset..].fill(0);
        self.sync()
    }

    pub fn is_zero_from(&self, offset: usize) -> bool {
        self.map.get(offset..).map_or(true, |rest| rest.iter().all(|b| *b == 0))
    }

    fn end(&self, offset: usize, len: usize) -> Result<usize> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("journal offset overflow"))?;
        if end > self.map.len() {
            return Err(Error::Corrupt("journal offset out of bounds"));
        }
        Ok(end)
    }

    pub fn flush(&self, offset: usize, len: usize) -> Result<()> {
        self.map.flush_range(offset, len)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// A second handle on the file for the flusher thread. `fdatasync` on it
    /// persists pages written through the mapping.
    pub fn sync_handle(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_stay_inside_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000000.jrn");
        let mut mapped = MappedFile::create(&path, 8192).unwrap();
        mapped.write_at(100, b"abc").unwrap();
        assert_eq!(mapped.read_at(100, 3).unwrap(), b"abc");
        assert!(mapped.write_at(8190, b"abc").is_err());
        assert!(mapped.read_at(usize::MAX, 2).is_err());

        mapped.sync().unwrap();
        drop(mapped);
        let mut reopened = MappedFile::open(&path).unwrap();
        assert_eq!(reopened.len(), 8192);
        assert_eq!(reopened.read_at(100, 3).unwrap(), b"abc");
        assert!(!reopened.is_zero_from(100));
        reopened.zero_from(101).unwrap();
        assert_eq!(reopened.read_at(100, 3).unwrap(), b"a\0\0");
        assert!(reopened.is_zero_from(101));
    }
}
