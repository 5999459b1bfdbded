//! Recovery
//!
//! Rebuilds allocator and index state after an unclean shutdown.
//!
//! ## Why a scan is enough
//! Every block describes itself, and every write that could leave a
//! half-built block behind is ordered so the half-built state is harmless:
//! - large records get their header last, so an interrupted record still
//!   reads as whatever free block it was carved from
//! - a grown file's new half reads as zero, which is taken as unwritten
//!   space sized by its alignment
//! - a replaced record may survive next to its replacement; the first one
//!   in scan order wins
//!
//! Free lists and the index are derived state and are rebuilt from scratch.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::backing::Backing;
use crate::error::Result;
use crate::format::{Block, HeapScan, DATA_HEADER_SIZE, SLOT_SIZE};
use crate::heap::Heap;
use crate::index::{build_table, hash_key, slots_for};

/// Summary of one recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Data Records that survived and were re-indexed
    pub records_kept: u64,

    /// Data Records dropped because an earlier record had the same key
    pub duplicates_dropped: u64,

    /// Hash Index blocks found on disk and discarded
    pub index_blocks_discarded: u64,

    /// Free blocks pushed onto the rebuilt free lists
    pub free_blocks: u64,
}

impl<B: Backing> Heap<B> {
    /// Scan the heap and rebuild free lists, index and counters
    pub(crate) fn recover(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        // Read-only pass: classify every block
        let (reclaimed, records) = {
            let bytes = self.bytes();
            let mut seen: HashSet<&[u8]> = HashSet::new();
            let mut reclaimed: Vec<(u64, u64)> = Vec::new();
            let mut records: Vec<(u64, u64)> = Vec::new();

            for item in HeapScan::new(bytes) {
                let (addr, block) = item?;
                match block {
                    Block::Data { size, key_len, .. } => {
                        let start = (addr + DATA_HEADER_SIZE) as usize;
                        let key = &bytes[start..start + key_len as usize];
                        if seen.insert(key) {
                            records.push((addr, hash_key(key)));
                        } else {
                            warn!(addr, "dropping duplicate record left by an interrupted update");
                            report.duplicates_dropped += 1;
                            coalesce(&mut reclaimed, addr, size);
                        }
                    }
                    Block::Index { size } => {
                        report.index_blocks_discarded += 1;
                        coalesce(&mut reclaimed, addr, size);
                    }
                    Block::Free { size, .. } | Block::Unwritten { size } => {
                        coalesce(&mut reclaimed, addr, size);
                    }
                }
            }
            (reclaimed, records)
        };

        // Rebuild free lists
        self.clear_free_heads()?;
        for &(addr, size) in &reclaimed {
            self.push_free(addr, size.trailing_zeros())?;
        }
        report.free_blocks = reclaimed.len() as u64;

        // Rebuild the index from the survivors
        let entries = records.len() as u64;
        let slots = slots_for(entries);
        let table = build_table(slots, &records);
        let addr = self.allocate(slots * SLOT_SIZE)?;
        self.write(addr, &table)?;
        self.set_index(addr, entries, entries)?;
        report.records_kept = entries;

        info!(
            records = report.records_kept,
            duplicates = report.duplicates_dropped,
            index_blocks = report.index_blocks_discarded,
            free_blocks = report.free_blocks,
            "recovered store after unclean shutdown"
        );
        Ok(report)
    }
}

/// Add a free region found at `addr`, merging with free buddies found
/// earlier in the scan.
///
/// Regions arrive in address order, so a region's lower buddy, if free, is
/// always the most recently pushed entry.
fn coalesce(regions: &mut Vec<(u64, u64)>, mut addr: u64, mut size: u64) {
    while let Some(&(last_addr, last_size)) = regions.last() {
        if last_size != size || addr & size == 0 || last_addr != addr ^ size {
            break;
        }
        regions.pop();
        addr = last_addr;
        size <<= 1;
    }
    regions.push((addr, size));
}
