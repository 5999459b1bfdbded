//! Block Allocator
//!
//! Buddy allocator over the heap. Blocks are power-of-two sized and aligned
//! to their size, so a block's buddy is `addr ^ size`. One doubly linked free
//! list per size class; list links are file offsets.
//!
//! ## Free-list heads
//! - `0`: empty, but blocks of this class have existed
//! - `1`: never carved, and nothing larger exists either (grow the file)
//! - otherwise: address of the first free block

use tracing::debug;

use crate::backing::Backing;
use crate::error::{BuddyError, Result};
use crate::format::{
    class_for, encode_free, free_head_offset, header, MAX_CLASS, NEVER_CARVED, TAG_FREE, TAG_MASK,
};
use crate::heap::Heap;

impl<B: Backing> Heap<B> {
    /// Allocate a block of at least `min_bytes`, growing the file as needed.
    ///
    /// The returned block still carries a stale header; the caller writes
    /// the real one.
    pub(crate) fn allocate(&mut self, min_bytes: u64) -> Result<u64> {
        let class = class_for(min_bytes).ok_or(BuddyError::AllocationTooLarge(min_bytes))?;
        loop {
            if let Some((found, addr)) = self.find_free(class) {
                self.unlink_free(addr)?;
                // Keep the lower half, hand the upper half to the class below
                let mut size = 1u64 << found;
                for split in (class..found).rev() {
                    size >>= 1;
                    self.push_free(addr + size, split)?;
                }
                return Ok(addr);
            }
            self.grow()?;
        }
    }

    /// Return a block to the heap, merging with free buddies first
    pub(crate) fn free(&mut self, addr: u64) -> Result<()> {
        let mut addr = addr;
        let mut size = self.read_u64(addr) & !TAG_MASK;
        loop {
            let buddy = addr ^ size;
            if self.read_u64(buddy) != header(size, TAG_FREE) {
                break;
            }
            self.unlink_free(buddy)?;
            addr &= !size;
            size <<= 1;
        }
        self.push_free(addr, size.trailing_zeros())
    }

    /// Write a free header at `addr` and make it the head of `class`
    pub(crate) fn push_free(&mut self, addr: u64, class: u32) -> Result<()> {
        let field = free_head_offset(class);
        let old = self.read_u64(field);
        let next = if old > NEVER_CARVED { old } else { 0 };
        self.write(addr, &encode_free(1 << class, next, field))?;
        if next != 0 {
            self.write_u64(next + 16, addr + 8)?;
        }
        self.write_u64(field, addr)
    }

    /// Detach a free block from its list
    fn unlink_free(&mut self, addr: u64) -> Result<()> {
        let next = self.read_u64(addr + 8);
        let back = self.read_u64(addr + 16);
        self.write_u64(back, next)?;
        if next != 0 {
            self.write_u64(next + 16, back)?;
        }
        Ok(())
    }

    /// First class at or above `class` with a free block, unless a
    /// never-carved class is reached first
    fn find_free(&self, class: u32) -> Option<(u32, u64)> {
        for c in class..=MAX_CLASS {
            match self.free_head(c) {
                NEVER_CARVED => return None,
                0 => continue,
                addr => return Some((c, addr)),
            }
        }
        None
    }

    /// Double the file; the new upper half becomes one free block
    fn grow(&mut self) -> Result<()> {
        let old_len = self.len();
        let new_len = old_len
            .checked_mul(2)
            .ok_or(BuddyError::AllocationTooLarge(old_len))?;
        self.set_len(new_len)?;
        self.push_free(old_len, old_len.trailing_zeros())?;
        debug!(old_len, new_len, "grew backing file");
        Ok(())
    }
}
