//! Journal file lifecycle.
//!
//! Journal files are fixed-size, memory-mapped and reused. A file is identified
//! on disk by its physical id (the file name) and ordered for replay by the
//! sequence number stamped in its header each time it is (re)used.
//!
//! ```text
//! {journal_dir}/
//!   000000000.jrn   ← seq 7 (data)
//!   000000001.jrn   ← free
//!   000000002.jrn   ← seq 8 (current)
//! ```

use std::path::{Path, PathBuf};

use super::mapped::MappedFile;
use crate::{Error, Result};

/// Size of the file header.
pub const FILE_HEADER_SIZE: usize = 64;

/// Offset where records begin.
pub const FILE_DATA_OFFSET: usize = 64;

/// Journal file magic ('JRN1').
pub const FILE_MAGIC: u32 = 0x4A52_4E31;

pub const FILE_VERSION: u32 = 1;

/// Flag marking a file as free for reuse. Free files are skipped on load.
pub const FILE_FLAG_FREE: u32 = 1;

/// Smallest usable journal file.
pub const MIN_FILE_SIZE: usize = 1024;

const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u64,
    pub flags: u32,
}

impl FileHeader {
    pub fn is_free(&self) -> bool {
        self.flags & FILE_FLAG_FREE != 0
    }
}

/// An open journal file.
pub struct JournalFile {
    pub file_id: u64,
    pub sequence: u64,
    pub mapped: MappedFile,
    pub write_offset: usize,
}

impl JournalFile {
    pub fn remaining(&self) -> usize {
        self.mapped.len().saturating_sub(self.write_offset)
    }
}

pub fn file_name(id: u64, extension: &str) -> String {
    format!("{:09}.{}", id, extension)
}

pub fn file_path(root: &Path, id: u64, extension: &str) -> PathBuf {
    root.join(file_name(id, extension))
}

pub fn temp_file_path(root: &Path, id: u64, extension: &str) -> PathBuf {
    root.join(format!("{}.tmp", file_name(id, extension)))
}

/// Returns the physical id if `name` is `NNNNNNNNN.<extension>`.
pub fn parse_file_name(name: &str, extension: &str) -> Option<u64> {
    let base = name.strip_suffix(extension)?.strip_suffix('.')?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

/// Discovers the physical ids of all journal files in a directory, sorted.
pub fn discover_files(dir: &Path, extension: &str) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(id) = parse_file_name(name, extension) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub fn validate_file_size(file_size: usize) -> Result<usize> {
    if file_size < MIN_FILE_SIZE {
        return Err(Error::Unsupported("journal file size too small"));
    }
    if file_size % PAGE_SIZE != 0 && file_size > PAGE_SIZE {
        return Err(Error::Unsupported("journal file size must be a multiple of 4096"));
    }
    Ok(file_size)
}

pub fn read_header(mapped: &MappedFile) -> Result<FileHeader> {
    parse_header(mapped.bytes())
}

pub fn parse_header(buf: &[u8]) -> Result<FileHeader> {
    if buf.len() < FILE_HEADER_SIZE {
        return Err(Error::Corrupt("journal file too small for header"));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length"));
    let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice length"));
    let sequence = u64::from_le_bytes(buf[8..16].try_into().expect("slice length"));
    let flags = u32::from_le_bytes(buf[16..20].try_into().expect("slice length"));
    if magic != FILE_MAGIC {
        return Err(Error::Corrupt("journal file magic mismatch"));
    }
    if version != FILE_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    Ok(FileHeader {
        magic,
        version,
        sequence,
        flags,
    })
}

pub fn write_header(mapped: &mut MappedFile, sequence: u64, flags: u32) -> Result<()> {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&sequence.to_le_bytes());
    buf[16..20].copy_from_slice(&flags.to_le_bytes());
    mapped.write_at(0, &buf)
}

/// Creates a new free file: written as `.tmp`, then published.
pub fn create_free_file(root: &Path, id: u64, extension: &str, file_size: usize) -> Result<MappedFile> {
    let temp = temp_file_path(root, id, extension);
    let _ = std::fs::remove_file(&temp);
    {
        let mut mapped = MappedFile::create(&temp, file_size)?;
        write_header(&mut mapped, 0, FILE_FLAG_FREE)?;
        mapped.sync()?;
    }
    let final_path = file_path(root, id, extension);
    publish_file(&temp, &final_path)?;
    MappedFile::open(&final_path)
}

/// Marks a file free, then zeroes its data region. Load zeroes any free file
/// whose data region a crash left dirty.
pub fn release_file(mapped: &mut MappedFile) -> Result<()> {
    write_header(mapped, 0, FILE_FLAG_FREE)?;
    mapped.flush(0, FILE_HEADER_SIZE)?;
    mapped.zero_from(FILE_DATA_OFFSET)
}

/// Atomically publish a temp file to its final name.
///
/// On Linux, uses `renameat2(RENAME_NOREPLACE)` so an existing file is never
/// clobbered.
pub fn publish_file(temp_path: &Path, final_path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let temp_c = CString::new(temp_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("journal temp path contains null byte"))?;
        let final_c = CString::new(final_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("journal path contains null byte"))?;

        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                temp_c.as_ptr(),
                libc::AT_FDCWD,
                final_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) && err.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Io(err));
        }
    }

    if final_path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "journal file already exists",
        )));
    }
    std::fs::rename(temp_path, final_path)?;
    Ok(())
}
