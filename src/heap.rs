//! Heap
//!
//! Owns the backing and every byte-level access to it. Reads come from the
//! backing's mapped view; writes are positioned writes. Allocator, index,
//! recovery and checker are all built on these primitives.

use tracing::debug;

use crate::backing::Backing;
use crate::error::Result;
use crate::format::{
    self, encode_free, free_head_offset, header, FLAG_ACTIVE, FLAG_PASSIVE, INITIAL_FILE_SIZE,
    INITIAL_INDEX_SIZE, MAX_CLASS, MIN_CLASS, NEVER_CARVED, ROOT_ENTRIES, ROOT_FREE_HEADS,
    ROOT_INDEX, ROOT_LOAD, ROOT_SIGNATURE, ROOT_SIZE, SIGNATURE, TAG_META,
};

/// The backing file viewed as Root Record plus heap
pub(crate) struct Heap<B: Backing> {
    backing: B,
    /// Mirrors the on-disk dirty flag
    dirty: bool,
}

impl<B: Backing> Heap<B> {
    pub(crate) fn new(backing: B, dirty: bool) -> Self {
        Self { backing, dirty }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub(crate) fn backing(&self) -> &B {
        &self.backing
    }

    pub(crate) fn into_backing(self) -> B {
        self.backing
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    pub(crate) fn len(&self) -> u64 {
        self.backing.len()
    }

    pub(crate) fn sector_size(&self) -> u64 {
        self.backing.sector_size()
    }

    pub(crate) fn read_u64(&self, offset: u64) -> u64 {
        format::read_u64(self.bytes(), offset)
    }

    pub(crate) fn slice(&self, offset: u64, len: u64) -> &[u8] {
        &self.bytes()[offset as usize..(offset + len) as usize]
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn index_addr(&self) -> u64 {
        self.read_u64(ROOT_INDEX)
    }

    pub(crate) fn load(&self) -> u64 {
        self.read_u64(ROOT_LOAD)
    }

    pub(crate) fn entries(&self) -> u64 {
        self.read_u64(ROOT_ENTRIES)
    }

    pub(crate) fn free_head(&self, class: u32) -> u64 {
        self.read_u64(free_head_offset(class))
    }

    /// Smallest class whose blocks cannot exist in a file of this length
    pub(crate) fn top_class(&self) -> u32 {
        self.len().trailing_zeros()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub(crate) fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.backing.write_at(offset, buf)
    }

    pub(crate) fn write_vectored(&mut self, offset: u64, bufs: &[&[u8]]) -> Result<()> {
        self.backing.write_vectored_at(offset, bufs)
    }

    pub(crate) fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub(crate) fn set_len(&mut self, len: u64) -> Result<()> {
        self.backing.set_len(len)
    }

    /// Write load and entry counters together
    pub(crate) fn set_counters(&mut self, load: u64, entries: u64) -> Result<()> {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&load.to_le_bytes());
        buf[8..].copy_from_slice(&entries.to_le_bytes());
        self.write(ROOT_LOAD, &buf)
    }

    /// Write index pointer, load and entry counters together
    pub(crate) fn set_index(&mut self, addr: u64, load: u64, entries: u64) -> Result<()> {
        let mut buf = [0u8; 24];
        buf[..8].copy_from_slice(&addr.to_le_bytes());
        buf[8..16].copy_from_slice(&load.to_le_bytes());
        buf[16..].copy_from_slice(&entries.to_le_bytes());
        self.write(ROOT_INDEX, &buf)
    }

    /// Rewrite every free-list head: empty below the file's top class,
    /// never-carved from it upwards
    pub(crate) fn clear_free_heads(&mut self) -> Result<()> {
        let heads = free_heads_for(self.top_class());
        self.write(ROOT_FREE_HEADS, &heads)
    }

    // =========================================================================
    // Dirty Flag
    // =========================================================================

    /// Flag the file active before the first mutation since open or sync.
    ///
    /// The flag must be durable before any later write can reach the disk,
    /// otherwise a crash could leave a modified file that claims to be clean.
    pub(crate) fn mark_dirty(&mut self) -> Result<()> {
        if self.dirty {
            return Ok(());
        }
        self.write(ROOT_SIGNATURE, &[FLAG_ACTIVE])?;
        self.backing.sync()?;
        self.dirty = true;
        Ok(())
    }

    /// Flush everything, then flag the file passive
    pub(crate) fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return self.backing.sync();
        }
        self.backing.sync()?;
        self.write(ROOT_SIGNATURE, &[FLAG_PASSIVE])?;
        self.backing.sync()?;
        self.dirty = false;
        Ok(())
    }

    // =========================================================================
    // Fresh Layout
    // =========================================================================

    /// Truncate and lay out an empty store:
    ///
    /// ```text
    /// [0, 512)      Root
    /// [512, 1024)   Hash Index (32 slots)
    /// [1024, 2048)  free, class 10
    /// [2048, 4096)  free, class 11
    /// ```
    ///
    /// The root is written last, so a crash part way leaves an all-zero root
    /// that the next open lays out again.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        self.set_len(0)?;
        self.set_len(INITIAL_FILE_SIZE)?;

        let index_addr = ROOT_SIZE;
        let mut index = vec![0u8; INITIAL_INDEX_SIZE as usize];
        index[..8].copy_from_slice(&header(INITIAL_INDEX_SIZE, TAG_META).to_le_bytes());
        self.write(index_addr, &index)?;

        let mut heads = free_heads_for(INITIAL_FILE_SIZE.trailing_zeros());
        let mut free_addr = index_addr + INITIAL_INDEX_SIZE;
        while free_addr < INITIAL_FILE_SIZE {
            // Each block is as large as its address, up to end of file
            let size = free_addr;
            let class = size.trailing_zeros();
            self.write(free_addr, &encode_free(size, 0, free_head_offset(class)))?;
            let at = (free_head_offset(class) - ROOT_FREE_HEADS) as usize;
            heads[at..at + 8].copy_from_slice(&free_addr.to_le_bytes());
            free_addr += size;
        }

        let mut root = Vec::with_capacity(ROOT_SIZE as usize);
        root.extend_from_slice(&header(ROOT_SIZE, TAG_META).to_le_bytes());
        root.extend_from_slice(&SIGNATURE.to_le_bytes());
        root.extend_from_slice(&index_addr.to_le_bytes());
        root.extend_from_slice(&0u64.to_le_bytes());
        root.extend_from_slice(&0u64.to_le_bytes());
        root.extend_from_slice(&heads);
        self.write(0, &root)?;

        self.backing.sync()?;
        self.dirty = false;
        debug!(len = INITIAL_FILE_SIZE, "laid out empty store");
        Ok(())
    }
}

/// Encoded free-list heads for a file whose top class is `top_class`
fn free_heads_for(top_class: u32) -> Vec<u8> {
    (MIN_CLASS..=MAX_CLASS)
        .flat_map(|class| {
            let head = if class >= top_class { NEVER_CARVED } else { 0 };
            head.to_le_bytes()
        })
        .collect()
}
