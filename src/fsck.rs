//! Consistency Checker
//!
//! Read-only verification of every structural invariant. Diagnostic only:
//! normal operation never calls it.

use std::collections::{HashMap, HashSet};

use crate::backing::Backing;
use crate::error::{BuddyError, Result};
use crate::format::{
    free_head_offset, Block, HeapScan, INITIAL_FILE_SIZE, MAX_CLASS, MIN_CLASS, NEVER_CARVED,
    SLOT_EMPTY, SLOT_SIZE, SLOT_TOMBSTONE,
};
use crate::heap::Heap;
use crate::index::{hash_key, Probe};

/// What a successful check counted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Live Data Records
    pub data_blocks: u64,

    /// Bytes in blocks holding Data Records (padding included)
    pub data_bytes: u64,

    /// Free blocks across all lists
    pub free_blocks: u64,

    /// Bytes in free blocks
    pub free_bytes: u64,

    /// Hash Index slot count (slot 0 included)
    pub index_slots: u64,

    /// Tombstone slots awaiting the next rebuild
    pub tombstones: u64,
}

fn violation(message: String) -> BuddyError {
    BuddyError::Fsck(message)
}

impl<B: Backing> Heap<B> {
    pub(crate) fn check(&self) -> Result<FsckReport> {
        let len = self.len();
        if !len.is_power_of_two() || len < INITIAL_FILE_SIZE {
            return Err(violation(format!("file length 0x{:x} is not a valid size", len)));
        }

        // ---------------------------------------------------------------------
        // Walk every block
        // ---------------------------------------------------------------------
        let mut free: HashMap<u64, u64> = HashMap::new();
        let mut data: HashMap<u64, u64> = HashMap::new();
        let mut index_blocks = Vec::new();

        for item in HeapScan::new(self.bytes()) {
            let (addr, block) = item.map_err(|e| violation(e.to_string()))?;
            match block {
                Block::Free { size, .. } => {
                    free.insert(addr, size);
                }
                Block::Data { size, .. } => {
                    data.insert(addr, size);
                }
                Block::Index { size } => index_blocks.push((addr, size)),
                Block::Unwritten { size } => {
                    return Err(violation(format!(
                        "unwritten region at 0x{:x} (0x{:x} bytes)",
                        addr, size
                    )));
                }
            }
        }

        let index = self.index_addr();
        match index_blocks.as_slice() {
            [(addr, _)] if *addr == index => {}
            _ => {
                return Err(violation(format!(
                    "expected one hash index at 0x{:x}, found {:?}",
                    index, index_blocks
                )));
            }
        }

        // ---------------------------------------------------------------------
        // Free lists
        // ---------------------------------------------------------------------
        let top = self.top_class();
        let mut listed: HashSet<u64> = HashSet::new();

        for class in MIN_CLASS..=MAX_CLASS {
            let field = free_head_offset(class);
            let head = self.read_u64(field);
            if class >= top {
                if head != NEVER_CARVED {
                    return Err(violation(format!(
                        "class {} cannot exist in a 0x{:x} byte file but its head is 0x{:x}",
                        class, len, head
                    )));
                }
                continue;
            }
            if head == NEVER_CARVED {
                return Err(violation(format!(
                    "class {} is marked never carved below the top class {}",
                    class, top
                )));
            }

            let mut back = field;
            let mut current = head;
            while current != 0 {
                if free.get(&current) != Some(&(1u64 << class)) {
                    return Err(violation(format!(
                        "class {} list reaches 0x{:x}, not a free block of that class",
                        class, current
                    )));
                }
                if !listed.insert(current) {
                    return Err(violation(format!(
                        "free block 0x{:x} is reached twice",
                        current
                    )));
                }
                let recorded = self.read_u64(current + 16);
                if recorded != back {
                    return Err(violation(format!(
                        "free block 0x{:x} points back to 0x{:x}, expected 0x{:x}",
                        current, recorded, back
                    )));
                }
                back = current + 8;
                current = self.read_u64(current + 8);
            }
        }

        if let Some(addr) = free.keys().find(|addr| !listed.contains(addr)) {
            return Err(violation(format!(
                "free block 0x{:x} is on no free list",
                addr
            )));
        }

        for (&addr, &size) in &free {
            if free.get(&(addr ^ size)) == Some(&size) {
                return Err(violation(format!(
                    "buddies 0x{:x} and 0x{:x} of size 0x{:x} are both free",
                    addr,
                    addr ^ size,
                    size
                )));
            }
        }

        // ---------------------------------------------------------------------
        // Hash index
        // ---------------------------------------------------------------------
        let slots = self.slot_count();
        let mut referenced: HashSet<u64> = HashSet::new();
        let mut keys: HashSet<&[u8]> = HashSet::new();
        let mut live = 0u64;
        let mut tombstones = 0u64;

        for i in 1..slots {
            let slot = index + i * SLOT_SIZE;
            match self.read_u64(slot) {
                SLOT_EMPTY => {}
                SLOT_TOMBSTONE => tombstones += 1,
                record => {
                    if !data.contains_key(&record) {
                        return Err(violation(format!(
                            "slot {} points at 0x{:x}, not a data record",
                            i, record
                        )));
                    }
                    if !referenced.insert(record) {
                        return Err(violation(format!(
                            "data record 0x{:x} is referenced by more than one slot",
                            record
                        )));
                    }
                    let key = self.record_key(record);
                    let hash = self.read_u64(slot + 8);
                    if hash_key(key) != hash {
                        return Err(violation(format!(
                            "slot {} stores hash 0x{:x} for a key hashing to 0x{:x}",
                            i,
                            hash,
                            hash_key(key)
                        )));
                    }
                    if !keys.insert(key) {
                        return Err(violation(format!(
                            "key of record 0x{:x} is stored twice",
                            record
                        )));
                    }
                    // A gap in the probe chain would hide the entry
                    let found = self
                        .locate(hash, key)
                        .map_err(|e| violation(e.to_string()))?;
                    if found != (Probe::Found { slot, record }) {
                        return Err(violation(format!(
                            "record 0x{:x} in slot {} is unreachable by probing",
                            record, i
                        )));
                    }
                    live += 1;
                }
            }
        }

        if referenced.len() != data.len() {
            return Err(violation(format!(
                "{} data records on disk but {} indexed",
                data.len(),
                referenced.len()
            )));
        }

        // ---------------------------------------------------------------------
        // Counters and load bounds
        // ---------------------------------------------------------------------
        if self.entries() != live {
            return Err(violation(format!(
                "entry counter {} but {} live slots",
                self.entries(),
                live
            )));
        }
        if self.load() != live + tombstones {
            return Err(violation(format!(
                "load counter {} but {} live and {} tombstone slots",
                self.load(),
                live,
                tombstones
            )));
        }
        if live * 2 > slots || (live + tombstones) * 4 > slots * 3 {
            return Err(violation(format!(
                "index of {} slots holds {} live and {} tombstone slots",
                slots, live, tombstones
            )));
        }

        Ok(FsckReport {
            data_blocks: live,
            data_bytes: data.values().sum(),
            free_blocks: free.len() as u64,
            free_bytes: free.values().sum(),
            index_slots: slots,
            tombstones,
        })
    }
}
