//! Store Module
//!
//! The public record manager: get/insert/remove over the allocator and the
//! hash index, plus open-time recovery and explicit durability.
//!
//! ## Responsibilities
//! - Decide on open whether the file is fresh, clean, or needs recovery
//! - Order writes so an interrupted operation is always recoverable
//! - Track the dirty flag
//! - Refuse further use after a failed mutation

use std::path::Path;

use tracing::{debug, info};

use crate::backing::{Backing, FileBacking};
use crate::config::Config;
use crate::error::{BuddyError, Result};
use crate::format::{
    class_for, encode_lengths, encode_slot, header, read_u64, record_len, FLAG_ACTIVE,
    FLAG_PASSIVE, INITIAL_FILE_SIZE, ROOT_ENTRIES, ROOT_SIGNATURE, ROOT_SIZE, SIGNATURE,
    SLOT_TOMBSTONE, TAG_DATA, TAG_MASK, TAG_META,
};
use crate::fsck::FsckReport;
use crate::heap::Heap;
use crate::index::{hash_key, Probe};
use crate::recovery::RecoveryReport;

/// What the root record says about the file at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenState {
    /// Empty, or a root that was never written
    Fresh,
    /// Closed cleanly; trusted as-is
    Clean,
    /// Crashed while holding no entries
    DirtyEmpty,
    /// Crashed; needs a recovery scan
    Dirty,
}

fn inspect(bytes: &[u8]) -> Result<OpenState> {
    let len = bytes.len() as u64;
    if len == 0 {
        return Ok(OpenState::Fresh);
    }
    if len == INITIAL_FILE_SIZE && bytes[..ROOT_SIZE as usize].iter().all(|&b| b == 0) {
        return Ok(OpenState::Fresh);
    }
    if !len.is_power_of_two() || len < INITIAL_FILE_SIZE {
        return Err(BuddyError::UnrecognizedFile(format!(
            "length {} is not a store size",
            len
        )));
    }
    if read_u64(bytes, 0) != header(ROOT_SIZE, TAG_META) {
        return Err(BuddyError::UnrecognizedFile(
            "missing root record header".to_string(),
        ));
    }
    let signature = read_u64(bytes, ROOT_SIGNATURE);
    if signature & !0xff != SIGNATURE & !0xff {
        return Err(BuddyError::UnrecognizedFile(format!(
            "unknown signature 0x{:016x}",
            signature
        )));
    }
    match signature as u8 {
        FLAG_PASSIVE => Ok(OpenState::Clean),
        FLAG_ACTIVE if read_u64(bytes, ROOT_ENTRIES) == 0 => Ok(OpenState::DirtyEmpty),
        FLAG_ACTIVE => Ok(OpenState::Dirty),
        flag => Err(BuddyError::UnrecognizedFile(format!(
            "invalid dirty flag {}",
            flag
        ))),
    }
}

/// Point-in-time figures about a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Backing file length in bytes
    pub file_len: u64,
    /// Live entries
    pub entries: u64,
    /// Live plus tombstone index slots
    pub load: u64,
    /// Index slot count (slot 0 included)
    pub slots: u64,
    /// Atomic-write granularity in use
    pub sector_size: u64,
    /// Whether mutations happened since the last sync
    pub dirty: bool,
}

/// A persistent byte-string to byte-string map in a single file
///
/// ## Concurrency Model: single writer, no internal locking
///
/// - Mutations take `&mut self`; views returned by `get`/`insert` borrow
///   `&self`, so no view can outlive the next mutation (which may remap)
/// - Two stores over one file are prevented by the backing's exclusive lock
/// - Share across threads with [`SharedStore`](crate::SharedStore)
///
/// ## Durability
///
/// Nothing is promised until [`sync`](Store::sync). Without it the file is
/// always recoverable, but a crash costs a full heap scan on the next open.
pub struct Store<B: Backing = FileBacking> {
    heap: Heap<B>,

    /// Set after a mutation failed part way
    poisoned: bool,

    /// Outcome of the recovery run at open, if one ran
    recovery: Option<RecoveryReport>,
}

impl Store<FileBacking> {
    /// Open or create a file-backed store with the given config
    ///
    /// On startup:
    /// 1. Open and exclusively lock the file
    /// 2. Lay out a fresh store if the file is empty
    /// 3. Trust a cleanly closed file as-is
    /// 4. Otherwise recover by scanning the heap
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let backing =
            FileBacking::open(&config.path, config.create_if_missing, config.sector_size)?;
        info!(path = %config.path.display(), sector_size = backing.sector_size(), "opening store");
        Self::with_backing(backing)
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified file
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().path(path).build())
    }
}

impl<B: Backing> Store<B> {
    /// Open a store over any backing
    pub fn with_backing(backing: B) -> Result<Self> {
        let state = inspect(backing.bytes())?;
        let mut heap = Heap::new(backing, state == OpenState::Dirty);
        let mut recovery = None;

        match state {
            OpenState::Fresh => {
                info!("initializing empty store");
                heap.initialize()?;
            }
            OpenState::Clean => {
                debug!(entries = heap.entries(), "store was closed cleanly");
            }
            OpenState::DirtyEmpty => {
                info!("store was not closed cleanly but held no entries; reinitializing");
                heap.initialize()?;
            }
            OpenState::Dirty => {
                recovery = Some(heap.recover()?);
            }
        }

        Ok(Self {
            heap,
            poisoned: false,
            recovery,
        })
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Get a value by key
    ///
    /// Returns a view straight into the mapped file.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        self.check_usable()?;
        match self.heap.locate(hash_key(key), key)? {
            Probe::Found { record, .. } => Ok(Some(self.heap.record_value(record))),
            Probe::Vacant { .. } => Ok(None),
        }
    }

    /// Whether `key` has a value
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or overwrite a key-value pair
    ///
    /// Steps:
    /// 1. Flag the file dirty
    /// 2. Grow or purge the index if the next insertion needs it
    /// 3. Same-size value in a sector-sized record: overwrite in place
    /// 4. Otherwise write a new record, free the old one, repoint the slot
    ///
    /// Returns a view of the stored value.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<&[u8]> {
        self.check_usable()?;
        let size = record_block_size(key.len(), value.len())?;
        let result = self.insert_record(key, value, size);
        let record = self.poison(result)?;
        Ok(self.heap.record_value(record))
    }

    /// Remove a key
    ///
    /// Returns whether a record was removed; removing an absent key is a
    /// no-op.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.check_usable()?;
        let Probe::Found { slot, record } = self.heap.locate(hash_key(key), key)? else {
            return Ok(false);
        };
        let result = self.remove_record(slot, record);
        self.poison(result)?;
        Ok(true)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Make every completed operation durable and flag the file clean
    pub fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self.heap.sync();
        self.poison(result)
    }

    /// Close the store gracefully
    ///
    /// Syncs, then releases the backing (and its lock)
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Discard every record and lay out an empty store
    ///
    /// Clears a poisoned state.
    pub fn reset(&mut self) -> Result<()> {
        info!("resetting store");
        let result = self.heap.initialize();
        self.poisoned = result.is_err();
        self.recovery = None;
        result
    }

    /// Verify every structural invariant
    ///
    /// Diagnostic only; walks the whole file.
    pub fn fsck(&self) -> Result<FsckReport> {
        self.check_usable()?;
        self.heap.check()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of live entries
    ///
    /// Zero if a failed resize left the store without a readable file.
    pub fn len(&self) -> usize {
        if !self.root_readable() {
            return 0;
        }
        self.heap.entries() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current figures
    pub fn stats(&self) -> StoreStats {
        if !self.root_readable() {
            return StoreStats {
                file_len: self.heap.len(),
                entries: 0,
                load: 0,
                slots: 0,
                sector_size: self.heap.sector_size(),
                dirty: self.heap.is_dirty(),
            };
        }
        StoreStats {
            file_len: self.heap.len(),
            entries: self.heap.entries(),
            load: self.heap.load(),
            slots: self.heap.slot_count(),
            sector_size: self.heap.sector_size(),
            dirty: self.heap.is_dirty(),
        }
    }

    /// Report of the recovery that ran at open, if the file needed one
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// The storage this store lives in
    pub fn backing(&self) -> &B {
        self.heap.backing()
    }

    /// Give up the store without syncing and return its storage
    ///
    /// Unsynced changes stay on the backing with the dirty flag set, exactly
    /// as a crash would leave them.
    pub fn into_backing(self) -> B {
        self.heap.into_backing()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Whether the mapped view still covers the whole file
    fn root_readable(&self) -> bool {
        let len = self.heap.len();
        len >= ROOT_SIZE && self.heap.bytes().len() as u64 == len
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(BuddyError::Poisoned);
        }
        Ok(())
    }

    fn poison<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Returns the address of the record now holding the value
    fn insert_record(&mut self, key: &[u8], value: &[u8], size: u64) -> Result<u64> {
        self.heap.mark_dirty()?;
        self.heap.rehash_if_needed()?;

        let hash = hash_key(key);
        let probe = self.heap.locate(hash, key)?;
        let sector = self.heap.sector_size();

        // A same-length value inside one sector is a single atomic write
        if let Probe::Found { record, .. } = probe {
            let (value_at, old_len) = self.heap.value_range(record);
            let block = self.heap.read_u64(record) & !TAG_MASK;
            if old_len == value.len() as u64 && block <= sector {
                self.heap.write(value_at, value)?;
                return Ok(record);
            }
        }

        let addr = self.heap.allocate(size)?;
        let head = header(size, TAG_DATA).to_le_bytes();
        let lengths = encode_lengths(key.len(), value.len());
        if size > sector {
            // Payload first: until the header lands the block still reads
            // as the free block it was carved from
            self.heap.write_vectored(addr + 8, &[&lengths, key, value])?;
            self.heap.write(addr, &head)?;
        } else {
            self.heap.write_vectored(addr, &[&head, &lengths, key, value])?;
        }

        let (load, entries) = (self.heap.load(), self.heap.entries());
        match probe {
            Probe::Found { slot, record } => {
                self.heap.free(record)?;
                self.heap.write(slot, &encode_slot(addr, hash))?;
            }
            Probe::Vacant {
                slot,
                reuses_tombstone,
            } => {
                self.heap.write(slot, &encode_slot(addr, hash))?;
                let load = if reuses_tombstone { load } else { load + 1 };
                self.heap.set_counters(load, entries + 1)?;
            }
        }
        Ok(addr)
    }

    fn remove_record(&mut self, slot: u64, record: u64) -> Result<()> {
        self.heap.mark_dirty()?;
        self.heap.free(record)?;
        self.heap.write_u64(slot, SLOT_TOMBSTONE)?;
        let entries = self.heap.entries();
        self.heap.write_u64(ROOT_ENTRIES, entries - 1)
    }
}

/// Block size of a record holding `key_len + value_len` bytes
fn record_block_size(key_len: usize, value_len: usize) -> Result<u64> {
    let used = record_len(key_len, value_len)
        .ok_or(BuddyError::AllocationTooLarge(u64::MAX))?;
    let class = class_for(used).ok_or(BuddyError::AllocationTooLarge(used))?;
    Ok(1 << class)
}
