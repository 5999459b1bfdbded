//! Memory Backing
//!
//! A `Vec<u8>` standing in for a file. Optionally journals every write so a
//! test can replay any prefix of the write sequence onto a snapshot, which is
//! exactly what the disk holds if the process dies at that point.

use crate::error::Result;
use crate::format::MIN_SECTOR_SIZE;

use super::Backing;

/// One mutation applied to a backing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Positioned write
    Write { offset: u64, data: Vec<u8> },
    /// Resize to an exact length
    SetLen(u64),
}

impl WriteOp {
    /// Number of sector-aligned pieces this write touches.
    ///
    /// A device applies each piece atomically but may stop between pieces,
    /// so a write spanning `n` pieces has `n - 1` torn states.
    pub fn sector_count(&self, sector_size: u64) -> u64 {
        match self {
            WriteOp::Write { offset, data } if !data.is_empty() => {
                let first = offset / sector_size;
                let last = (offset + data.len() as u64 - 1) / sector_size;
                last - first + 1
            }
            _ => 1,
        }
    }
}

/// In-memory backing with an optional write journal
#[derive(Debug, Clone)]
pub struct MemoryBacking {
    data: Vec<u8>,
    sector_size: u64,
    journal: Option<Vec<WriteOp>>,
}

impl MemoryBacking {
    /// Empty backing with the minimum sector size
    pub fn new() -> Self {
        Self::with_sector_size(MIN_SECTOR_SIZE)
    }

    /// Empty backing with the given atomic-write granularity
    pub fn with_sector_size(sector_size: u64) -> Self {
        Self {
            data: Vec::new(),
            sector_size,
            journal: None,
        }
    }

    /// Backing holding a copy of an existing image
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            sector_size: MIN_SECTOR_SIZE,
            journal: None,
        }
    }

    /// Start recording every write (clears any previous journal)
    pub fn start_journal(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Stop recording and return what was recorded
    pub fn take_journal(&mut self) -> Vec<WriteOp> {
        self.journal.take().unwrap_or_default()
    }

    /// Writes recorded so far
    pub fn journal_len(&self) -> usize {
        self.journal.as_ref().map_or(0, Vec::len)
    }

    /// Apply a recorded write as-is
    pub fn apply(&mut self, op: &WriteOp) {
        match op {
            WriteOp::Write { offset, data } => self.put(*offset, data),
            WriteOp::SetLen(len) => self.data.resize(*len as usize, 0),
        }
    }

    /// Apply only the first `sectors` sector-aligned pieces of a write
    pub fn apply_torn(&mut self, op: &WriteOp, sectors: u64) {
        match op {
            WriteOp::Write { offset, data } => {
                let first = offset / self.sector_size;
                let stop = (first + sectors) * self.sector_size;
                let keep = stop.saturating_sub(*offset).min(data.len() as u64) as usize;
                self.put(*offset, &data[..keep]);
            }
            WriteOp::SetLen(_) => {
                if sectors > 0 {
                    self.apply(op);
                }
            }
        }
    }

    /// Current contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the backing, returning its contents
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn put(&mut self, offset: u64, buf: &[u8]) {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
    }

    fn record(&mut self, op: WriteOp) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(op);
        }
    }
}

impl Default for MemoryBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl Backing for MemoryBacking {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.put(offset, buf);
        if self.journal.is_some() {
            self.record(WriteOp::Write {
                offset,
                data: buf.to_vec(),
            });
        }
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.data.resize(len as usize, 0);
        self.record(WriteOp::SetLen(len));
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }
}
