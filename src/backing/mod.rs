//! Backing Store Module
//!
//! The byte-addressable storage a store lives in.
//!
//! ## Contract
//! - Reads go through `bytes()`, a view of the whole current contents
//! - Writes go through positioned writes only, and become visible in
//!   `bytes()` as soon as they return
//! - `set_len()` grows or truncates to an exact length and refreshes the view
//! - `sync()` makes every completed write durable
//! - `sector_size()` is the largest aligned write the device applies
//!   atomically (at least 512 bytes)

mod file;
mod memory;

pub use file::FileBacking;
pub use memory::{MemoryBacking, WriteOp};

use crate::error::Result;

/// Storage a [`Store`](crate::Store) reads and writes through
pub trait Backing {
    /// Current length in bytes
    fn len(&self) -> u64;

    /// Whether the backing holds no bytes at all
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read view of the full contents
    fn bytes(&self) -> &[u8];

    /// Write `buf` at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Write the concatenation of `bufs` at `offset` as one logical write
    fn write_vectored_at(&mut self, offset: u64, bufs: &[&[u8]]) -> Result<()> {
        let total = bufs.iter().map(|b| b.len()).sum();
        let mut joined = bytes::BytesMut::with_capacity(total);
        for buf in bufs {
            joined.extend_from_slice(buf);
        }
        self.write_at(offset, &joined)
    }

    /// Grow or truncate to exactly `len` bytes; new bytes read as zero
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Flush completed writes to durable storage
    fn sync(&mut self) -> Result<()>;

    /// Atomic-write granularity in bytes
    fn sector_size(&self) -> u64;
}
