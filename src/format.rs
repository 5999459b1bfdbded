//! On-disk Format
//!
//! Layout of the single backing file. All integers are little-endian u64.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Root Record (512 bytes, offset 0)                            │
//! │   +0   header: 512 | META                                    │
//! │   +8   signature "\0buddykv" (low byte = dirty flag)         │
//! │   +16  Hash Index address                                    │
//! │   +24  load (live + tombstone slots)                         │
//! │   +32  live entries                                          │
//! │   +40  59 free-list heads, classes 5..=63                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Heap: power-of-two blocks, each aligned to its own size      │
//! │                                                              │
//! │   Hash Index   [size|META][reserved][ptr,hash][ptr,hash]...  │
//! │   Data Record  [size|DATA][key_len][value_len][key][value]   │
//! │   Free Block   [size|FREE][next][back]                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The low five bits of a header word carry the block type; the rest is the
//! block size. A header word of zero marks space that a file growth created
//! and nothing has written yet.

use bytes::{Buf, BufMut};

use crate::error::{BuddyError, Result};

// =============================================================================
// Sizes and Classes
// =============================================================================

/// Size of the Root Record at offset 0
pub(crate) const ROOT_SIZE: u64 = 512;

/// Smallest size class (32 bytes)
pub(crate) const MIN_CLASS: u32 = 5;

/// Largest size class (2^63 bytes)
pub(crate) const MAX_CLASS: u32 = 63;

/// Smallest block size
pub(crate) const MIN_BLOCK_SIZE: u64 = 1 << MIN_CLASS;

/// Smallest atomic-write granularity any supported device guarantees
pub const MIN_SECTOR_SIZE: u64 = 512;

/// Length of a freshly laid out file
pub(crate) const INITIAL_FILE_SIZE: u64 = 4096;

/// Size of the Hash Index block in a fresh file (32 slots)
pub(crate) const INITIAL_INDEX_SIZE: u64 = 512;

// =============================================================================
// Block Types
// =============================================================================

pub(crate) const TAG_MASK: u64 = MIN_BLOCK_SIZE - 1;
pub(crate) const TAG_META: u64 = 1;
pub(crate) const TAG_DATA: u64 = 2;
pub(crate) const TAG_FREE: u64 = 3;

// =============================================================================
// Root Fields
// =============================================================================

pub(crate) const ROOT_SIGNATURE: u64 = 8;
pub(crate) const ROOT_INDEX: u64 = 16;
pub(crate) const ROOT_LOAD: u64 = 24;
pub(crate) const ROOT_ENTRIES: u64 = 32;
pub(crate) const ROOT_FREE_HEADS: u64 = 40;

/// Signature word; its low byte doubles as the dirty flag
pub(crate) const SIGNATURE: u64 = u64::from_le_bytes(*b"\0buddykv");

pub(crate) const FLAG_PASSIVE: u8 = 0;
pub(crate) const FLAG_ACTIVE: u8 = 1;

/// Free-list head value meaning "nothing this large has ever been carved"
pub(crate) const NEVER_CARVED: u64 = 1;

// =============================================================================
// Hash Index and Records
// =============================================================================

pub(crate) const SLOT_SIZE: u64 = 16;

/// Slot pointer of a never-used slot
pub(crate) const SLOT_EMPTY: u64 = 0;

/// Slot pointer of a deleted entry
pub(crate) const SLOT_TOMBSTONE: u64 = 1;

/// header + key length + value length
pub(crate) const DATA_HEADER_SIZE: u64 = 24;

/// header + next + back
pub(crate) const FREE_HEADER_SIZE: u64 = 24;

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn header(size: u64, tag: u64) -> u64 {
    size | tag
}

/// Root offset of the free-list head for `class`
pub(crate) fn free_head_offset(class: u32) -> u64 {
    ROOT_FREE_HEADS + 8 * u64::from(class - MIN_CLASS)
}

/// Size class needed to hold `min_bytes`, or `None` past the largest class
pub(crate) fn class_for(min_bytes: u64) -> Option<u32> {
    let size = min_bytes.max(MIN_BLOCK_SIZE).checked_next_power_of_two()?;
    Some(size.trailing_zeros())
}

/// Bytes a data record needs before rounding to its block size
pub(crate) fn record_len(key_len: usize, value_len: usize) -> Option<u64> {
    DATA_HEADER_SIZE
        .checked_add(key_len as u64)?
        .checked_add(value_len as u64)
}

/// Largest power of two dividing `addr`
pub(crate) fn alignment_of(addr: u64) -> u64 {
    addr & addr.wrapping_neg()
}

pub(crate) fn read_u64(bytes: &[u8], offset: u64) -> u64 {
    let start = offset as usize;
    let mut buf = &bytes[start..start + 8];
    buf.get_u64_le()
}

pub(crate) fn encode_free(size: u64, next: u64, back: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FREE_HEADER_SIZE as usize);
    buf.put_u64_le(header(size, TAG_FREE));
    buf.put_u64_le(next);
    buf.put_u64_le(back);
    buf
}

/// Key and value lengths, the part of a data header after the header word
pub(crate) fn encode_lengths(key_len: usize, value_len: usize) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let mut cursor = &mut buf[..];
    cursor.put_u64_le(key_len as u64);
    cursor.put_u64_le(value_len as u64);
    buf
}

pub(crate) fn encode_slot(pointer: u64, hash: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    let mut cursor = &mut buf[..];
    cursor.put_u64_le(pointer);
    cursor.put_u64_le(hash);
    buf
}

// =============================================================================
// Block Parsing
// =============================================================================

/// A heap block, decoded from its self-describing header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Block {
    Free { size: u64, next: u64, back: u64 },
    Data { size: u64, key_len: u64, value_len: u64 },
    Index { size: u64 },
    /// Zero header: grown but never written. Size is implied by alignment.
    Unwritten { size: u64 },
}

impl Block {
    pub(crate) fn size(&self) -> u64 {
        match *self {
            Block::Free { size, .. }
            | Block::Data { size, .. }
            | Block::Index { size }
            | Block::Unwritten { size } => size,
        }
    }

    /// Decode the block starting at `addr` of the heap image `bytes`
    pub(crate) fn parse(bytes: &[u8], addr: u64) -> Result<Block> {
        let file_len = bytes.len() as u64;
        if addr < ROOT_SIZE || addr + 8 > file_len {
            return Err(BuddyError::Corruption(format!(
                "block address 0x{:x} outside heap of 0x{:x} bytes",
                addr, file_len
            )));
        }

        let word = read_u64(bytes, addr);
        if word == 0 {
            return Ok(Block::Unwritten {
                size: alignment_of(addr),
            });
        }

        let size = word & !TAG_MASK;
        let tag = word & TAG_MASK;
        if !size.is_power_of_two() || size < MIN_BLOCK_SIZE {
            return Err(BuddyError::Corruption(format!(
                "block at 0x{:x} has invalid size 0x{:x}",
                addr, size
            )));
        }
        if addr % size != 0 {
            return Err(BuddyError::Corruption(format!(
                "block at 0x{:x} is not aligned to its size 0x{:x}",
                addr, size
            )));
        }
        if file_len - addr < size {
            return Err(BuddyError::Corruption(format!(
                "block at 0x{:x} of size 0x{:x} runs past end of file 0x{:x}",
                addr, size, file_len
            )));
        }

        match tag {
            TAG_FREE => Ok(Block::Free {
                size,
                next: read_u64(bytes, addr + 8),
                back: read_u64(bytes, addr + 16),
            }),
            TAG_DATA => {
                let key_len = read_u64(bytes, addr + 8);
                let value_len = read_u64(bytes, addr + 16);
                let used = DATA_HEADER_SIZE
                    .checked_add(key_len)
                    .and_then(|n| n.checked_add(value_len));
                match used {
                    Some(used) if used <= size => Ok(Block::Data {
                        size,
                        key_len,
                        value_len,
                    }),
                    _ => Err(BuddyError::Corruption(format!(
                        "data record at 0x{:x} claims {}+{} bytes in a 0x{:x} block",
                        addr, key_len, value_len, size
                    ))),
                }
            }
            TAG_META => Ok(Block::Index { size }),
            other => Err(BuddyError::Corruption(format!(
                "block at 0x{:x} has unknown type tag {}",
                addr, other
            ))),
        }
    }
}

/// Walks the heap block by block, each header giving the next address.
///
/// Stops after the first error.
pub(crate) struct HeapScan<'a> {
    bytes: &'a [u8],
    addr: u64,
}

impl<'a> HeapScan<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            addr: ROOT_SIZE,
        }
    }
}

impl Iterator for HeapScan<'_> {
    type Item = Result<(u64, Block)>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.bytes.len() as u64;
        if self.addr >= len {
            return None;
        }
        let addr = self.addr;
        match Block::parse(self.bytes, addr) {
            Ok(block) => {
                self.addr = addr + block.size();
                Some(Ok((addr, block)))
            }
            Err(e) => {
                self.addr = len;
                Some(Err(e))
            }
        }
    }
}
