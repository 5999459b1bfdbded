//! Hash Index
//!
//! Open-addressed table of `(pointer, hash)` slots stored in one heap block.
//! Slot 0 overlaps the block header and is never used. Linear probing with
//! wrap-around; deletions leave tombstones until the next rebuild.
//!
//! ## Load bounds
//! Checked before every insertion:
//! - live entries stay at or below half the slot count (else double)
//! - live + tombstones stay at or below three quarters (else rebuild in place)

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::backing::Backing;
use crate::error::{BuddyError, Result};
use crate::format::{
    encode_slot, header, read_u64, DATA_HEADER_SIZE, INITIAL_INDEX_SIZE, SLOT_EMPTY, SLOT_SIZE,
    SLOT_TOMBSTONE, TAG_MASK, TAG_META,
};
use crate::heap::Heap;

/// Hash stored alongside every slot
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Outcome of probing for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Key present: `slot` is the slot's file offset, `record` its Data Record
    Found { slot: u64, record: u64 },
    /// Key absent: `slot` is where it would go
    Vacant { slot: u64, reuses_tombstone: bool },
}

/// Home slot of `hash` in a table of `slots` slots, skipping slot 0
fn home_slot(hash: u64, slots: u64) -> u64 {
    match hash & (slots - 1) {
        0 => 1,
        i => i,
    }
}

fn next_slot(i: u64, slots: u64) -> u64 {
    if i + 1 == slots {
        1
    } else {
        i + 1
    }
}

/// Slot count for a rebuilt table holding `entries` live records with room
/// for one more insertion
pub(crate) fn slots_for(entries: u64) -> u64 {
    ((entries + 1) * 2)
        .next_power_of_two()
        .max(INITIAL_INDEX_SIZE / SLOT_SIZE)
}

/// Encode a whole table of `slots` slots holding `live` `(pointer, hash)`
/// pairs
pub(crate) fn build_table(slots: u64, live: &[(u64, u64)]) -> Vec<u8> {
    let size = slots * SLOT_SIZE;
    let mut table = vec![0u8; size as usize];
    table[..8].copy_from_slice(&header(size, TAG_META).to_le_bytes());
    for &(pointer, hash) in live {
        let mut i = home_slot(hash, slots);
        while read_u64(&table, i * SLOT_SIZE) != SLOT_EMPTY {
            i = next_slot(i, slots);
        }
        let at = (i * SLOT_SIZE) as usize;
        table[at..at + SLOT_SIZE as usize].copy_from_slice(&encode_slot(pointer, hash));
    }
    table
}

impl<B: Backing> Heap<B> {
    /// Number of slots in the current table, slot 0 included
    pub(crate) fn slot_count(&self) -> u64 {
        (self.read_u64(self.index_addr()) & !TAG_MASK) / SLOT_SIZE
    }

    pub(crate) fn record_key(&self, record: u64) -> &[u8] {
        let key_len = self.read_u64(record + 8);
        self.slice(record + DATA_HEADER_SIZE, key_len)
    }

    /// File offset and length of a record's value
    pub(crate) fn value_range(&self, record: u64) -> (u64, u64) {
        let key_len = self.read_u64(record + 8);
        let value_len = self.read_u64(record + 16);
        (record + DATA_HEADER_SIZE + key_len, value_len)
    }

    pub(crate) fn record_value(&self, record: u64) -> &[u8] {
        let (offset, len) = self.value_range(record);
        self.slice(offset, len)
    }

    /// Probe for `key`. The first tombstone on the way is remembered as the
    /// insertion point, but probing continues to the first empty slot.
    pub(crate) fn locate(&self, hash: u64, key: &[u8]) -> Result<Probe> {
        let index = self.index_addr();
        let slots = self.slot_count();
        let mut i = home_slot(hash, slots);
        let mut tombstone = None;

        for _ in 1..slots {
            let slot = index + i * SLOT_SIZE;
            match self.read_u64(slot) {
                SLOT_EMPTY => {
                    return Ok(Probe::Vacant {
                        slot: tombstone.unwrap_or(slot),
                        reuses_tombstone: tombstone.is_some(),
                    });
                }
                SLOT_TOMBSTONE => {
                    tombstone.get_or_insert(slot);
                }
                record => {
                    if self.read_u64(slot + 8) == hash && self.record_key(record) == key {
                        return Ok(Probe::Found { slot, record });
                    }
                }
            }
            i = next_slot(i, slots);
        }

        match tombstone {
            Some(slot) => Ok(Probe::Vacant {
                slot,
                reuses_tombstone: true,
            }),
            None => Err(BuddyError::Corruption(format!(
                "hash index at 0x{:x} has no empty slot",
                index
            ))),
        }
    }

    /// Every live `(pointer, hash)` pair in slot order
    pub(crate) fn live_slots(&self) -> Vec<(u64, u64)> {
        let index = self.index_addr();
        (1..self.slot_count())
            .map(|i| index + i * SLOT_SIZE)
            .map(|slot| (self.read_u64(slot), self.read_u64(slot + 8)))
            .filter(|&(pointer, _)| pointer != SLOT_EMPTY && pointer != SLOT_TOMBSTONE)
            .collect()
    }

    /// Keep the load bounds ahead of the next insertion
    pub(crate) fn rehash_if_needed(&mut self) -> Result<()> {
        let slots = self.slot_count();
        if (self.entries() + 1) * 2 > slots {
            self.rebuild_index(slots * 2)
        } else if (self.load() + 1) * 4 > slots * 3 {
            self.rebuild_index(slots)
        } else {
            Ok(())
        }
    }

    /// Re-insert every live slot into a table of `slots` slots, purging
    /// tombstones. Same size rewrites in place; a new size moves the table.
    fn rebuild_index(&mut self, slots: u64) -> Result<()> {
        let live = self.live_slots();
        let entries = live.len() as u64;
        let table = build_table(slots, &live);
        let old = self.index_addr();
        let old_slots = self.slot_count();

        if slots == old_slots {
            self.write(old, &table)?;
            self.set_counters(entries, entries)?;
            debug!(slots, entries, "purged tombstones from hash index");
        } else {
            let addr = self.allocate(slots * SLOT_SIZE)?;
            self.write(addr, &table)?;
            self.set_index(addr, entries, entries)?;
            self.free(old)?;
            debug!(old_slots, slots, entries, "resized hash index");
        }
        Ok(())
    }
}
