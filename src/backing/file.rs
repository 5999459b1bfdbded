//! File Backing
//!
//! A regular file, read through a memory map and written with positioned
//! writes. The file is locked exclusively for the lifetime of the handle.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use memmap2::{Mmap, MmapOptions};
use tracing::warn;

use crate::error::{BuddyError, Result};
use crate::format::MIN_SECTOR_SIZE;

use super::Backing;

/// File-backed storage with a read-only mapping of the whole file
pub struct FileBacking {
    /// Path the file was opened from (for logging)
    path: PathBuf,
    /// Open handle, holding the exclusive lock
    file: File,
    /// Mapping of `[0, len)`; `None` while the file is empty
    map: Option<Mmap>,
    /// Current file length
    len: u64,
    /// Atomic-write granularity
    sector_size: u64,
}

impl FileBacking {
    /// Open (optionally creating) `path` and lock it exclusively
    ///
    /// `sector_size` overrides the detected atomic-write granularity.
    pub fn open(path: &Path, create: bool, sector_size: Option<u64>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        file.try_lock_exclusive().map_err(BuddyError::Locked)?;

        let metadata = file.metadata()?;
        let len = metadata.len();
        let sector_size = sector_size.unwrap_or_else(|| detect_sector_size(&metadata));

        let mut backing = Self {
            path: path.to_path_buf(),
            file,
            map: None,
            len,
            sector_size,
        };
        backing.remap()?;
        Ok(backing)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remap(&mut self) -> Result<()> {
        if self.len == 0 {
            self.map = None;
            return Ok(());
        }
        let len = usize::try_from(self.len).map_err(|_| {
            BuddyError::Corruption(format!(
                "file of {} bytes cannot be mapped on this platform",
                self.len
            ))
        })?;
        // SAFETY: the file is locked exclusively and only ever written
        // through this handle, so the mapped bytes change only through our
        // own positioned writes.
        let map = unsafe { MmapOptions::new().len(len).map(&self.file)? };
        self.map = Some(map);
        Ok(())
    }

    /// Bring `len` and the view back in line with the file after a failed resize
    fn restore_view(&mut self) -> Result<()> {
        self.len = self.file.metadata()?.len();
        self.remap()
    }
}

impl Backing for FileBacking {
    fn len(&self) -> u64 {
        self.len
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        // A view past the end of the file faults on access, and Windows
        // refuses to resize a mapped file at all
        if len < self.len || cfg!(windows) {
            self.map = None;
        }
        if let Err(e) = self.file.set_len(len) {
            warn!(path = %self.path.display(), len, error = %e, "resize failed");
            if self.map.is_none() {
                self.restore_view()?;
            }
            return Err(e.into());
        }
        self.len = len;
        if let Err(e) = self.remap() {
            warn!(path = %self.path.display(), len, error = %e, "remap failed");
            self.restore_view()?;
            return Err(e);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn detect_sector_size(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    let block = metadata.blksize();
    if block.is_power_of_two() && block >= MIN_SECTOR_SIZE {
        block
    } else {
        MIN_SECTOR_SIZE
    }
}

#[cfg(not(unix))]
fn detect_sector_size(_metadata: &std::fs::Metadata) -> u64 {
    MIN_SECTOR_SIZE
}
