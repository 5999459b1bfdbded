//! Tests for Store
//!
//! These tests verify:
//! - Basic get/insert/remove operations
//! - Overwrites, empty keys and values, large values
//! - Clean and unclean reopen of a file-backed store
//! - Exclusive locking and rejection of foreign files
//! - Poisoning after a failed write, and reset

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use buddykv::{Backing, BuddyError, Config, MemoryBacking, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store() -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open_path(&temp_dir.path().join("store.db")).unwrap();
    (temp_dir, store)
}

fn setup_memory_store() -> Store<MemoryBacking> {
    Store::with_backing(MemoryBacking::new()).unwrap()
}

/// Memory backing that fails every write once its budget runs out
struct FailingBacking {
    inner: MemoryBacking,
    writes_left: Arc<AtomicUsize>,
}

impl FailingBacking {
    fn take_budget(&self) -> std::io::Result<()> {
        let left = self.writes_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            ));
        }
        self.writes_left.store(left - 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Backing for FailingBacking {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> buddykv::Result<()> {
        self.take_budget()?;
        self.inner.write_at(offset, buf)
    }

    fn set_len(&mut self, len: u64) -> buddykv::Result<()> {
        self.take_budget()?;
        self.inner.set_len(len)
    }

    fn sync(&mut self) -> buddykv::Result<()> {
        self.inner.sync()
    }

    fn sector_size(&self) -> u64 {
        self.inner.sector_size()
    }
}

/// Memory backing whose view is lost when a resize fails, the way a file
/// mapping is dropped before the file is truncated
struct LostViewBacking {
    inner: MemoryBacking,
    fail_resize: Arc<AtomicBool>,
    view_lost: bool,
}

impl Backing for LostViewBacking {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn bytes(&self) -> &[u8] {
        if self.view_lost {
            return &[];
        }
        self.inner.bytes()
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> buddykv::Result<()> {
        self.inner.write_at(offset, buf)
    }

    fn set_len(&mut self, len: u64) -> buddykv::Result<()> {
        if self.fail_resize.load(Ordering::SeqCst) {
            self.view_lost = true;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "file too large").into());
        }
        self.inner.set_len(len)
    }

    fn sync(&mut self) -> buddykv::Result<()> {
        self.inner.sync()
    }

    fn sector_size(&self) -> u64 {
        self.inner.sector_size()
    }
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_open_creates_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("new.db");

    let store = Store::open_path(&path).unwrap();

    assert!(path.exists());
    assert_eq!(fs::metadata(&path).unwrap().len(), 4096);
    assert!(store.is_empty());
    assert!(store.recovery_report().is_none());
}

#[test]
fn test_open_missing_file_without_create() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("missing.db"))
        .create_if_missing(false)
        .build();

    let result = Store::open(config);

    assert!(matches!(result, Err(BuddyError::Io(_))));
}

#[test]
fn test_open_rejects_bad_sector_size() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("store.db"))
        .sector_size(1000)
        .build();

    let result = Store::open(config);

    assert!(matches!(result, Err(BuddyError::Config(_))));
}

#[test]
fn test_insert_and_get() {
    let (_dir, mut store) = setup_temp_store();

    let view = store.insert(b"key1", b"value1").unwrap();
    assert_eq!(view, b"value1");

    assert_eq!(store.get(b"key1").unwrap(), Some(&b"value1"[..]));
    assert_eq!(store.len(), 1);
}

#[test]
fn test_get_nonexistent_key() {
    let (_dir, store) = setup_temp_store();

    assert_eq!(store.get(b"nonexistent").unwrap(), None);
    assert!(!store.contains_key(b"nonexistent").unwrap());
}

#[test]
fn test_overwrite_value() {
    let mut store = setup_memory_store();

    store.insert(b"key", b"short").unwrap();
    store.insert(b"key", b"a considerably longer value").unwrap();

    assert_eq!(
        store.get(b"key").unwrap(),
        Some(&b"a considerably longer value"[..])
    );
    assert_eq!(store.len(), 1);
    store.fsck().unwrap();
}

#[test]
fn test_remove_key() {
    let mut store = setup_memory_store();

    store.insert(b"key", b"value").unwrap();
    assert!(store.remove(b"key").unwrap());

    assert_eq!(store.get(b"key").unwrap(), None);
    assert!(store.is_empty());
}

#[test]
fn test_remove_absent_key_is_noop() {
    let mut store = setup_memory_store();
    store.insert(b"key", b"value").unwrap();
    let before = store.stats();

    assert!(!store.remove(b"other").unwrap());
    assert!(store.remove(b"key").unwrap());
    assert!(!store.remove(b"key").unwrap());

    assert_eq!(store.len(), 0);
    assert_eq!(store.stats().slots, before.slots);
    store.fsck().unwrap();
}

#[test]
fn test_empty_key_and_value() {
    let mut store = setup_memory_store();

    store.insert(b"", b"empty key").unwrap();
    store.insert(b"empty value", b"").unwrap();

    assert_eq!(store.get(b"").unwrap(), Some(&b"empty key"[..]));
    assert_eq!(store.get(b"empty value").unwrap(), Some(&b""[..]));
    assert!(store.contains_key(b"empty value").unwrap());
    store.fsck().unwrap();
}

#[test]
fn test_binary_keys_and_values() {
    let mut store = setup_memory_store();
    let key = [0u8, 255, 1, 254, 0, 0];
    let value: Vec<u8> = (0..=255).collect();

    store.insert(&key, &value).unwrap();

    assert_eq!(store.get(&key).unwrap(), Some(&value[..]));
}

#[test]
fn test_large_value() {
    let (_dir, mut store) = setup_temp_store();
    let value: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    store.insert(b"big", &value).unwrap();

    assert_eq!(store.get(b"big").unwrap(), Some(&value[..]));
    // 24 + 3 + 100000 rounds up to a 128 KiB block
    assert!(store.stats().file_len >= 256 * 1024);
    store.fsck().unwrap();
}

#[test]
fn test_same_length_update_is_one_write() {
    let mut backing = MemoryBacking::new();
    backing.start_journal();
    let mut store = Store::with_backing(backing).unwrap();
    store.insert(b"counter", b"0001").unwrap();
    let before = store.backing().journal_len();
    let len_before = store.stats().file_len;

    store.insert(b"counter", b"0002").unwrap();

    assert_eq!(store.backing().journal_len(), before + 1);
    assert_eq!(store.get(b"counter").unwrap(), Some(&b"0002"[..]));
    assert_eq!(store.stats().file_len, len_before);
}

#[test]
fn test_changed_length_update_moves_record() {
    let mut backing = MemoryBacking::new();
    backing.start_journal();
    let mut store = Store::with_backing(backing).unwrap();
    store.insert(b"key", b"abc").unwrap();
    let before = store.backing().journal_len();

    store.insert(b"key", b"abcd").unwrap();

    assert!(store.backing().journal_len() > before + 1);
    assert_eq!(store.get(b"key").unwrap(), Some(&b"abcd"[..]));
    assert_eq!(store.fsck().unwrap().data_blocks, 1);
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_256_single_byte_keys() {
    let mut store = setup_memory_store();

    for k in 0..=255u8 {
        store.insert(&[k], &[k]).unwrap();
        assert_eq!(store.len(), k as usize + 1);
        store.fsck().unwrap();
    }
    for k in 0..=255u8 {
        assert_eq!(store.get(&[k]).unwrap(), Some(&[k][..]));
    }

    for k in (0..=255u8).rev() {
        assert!(store.remove(&[k]).unwrap());
        assert_eq!(store.len(), k as usize);
        store.fsck().unwrap();
    }
    assert!(store.is_empty());
}

#[test]
fn test_large_records_and_buddies() {
    let mut store = setup_memory_store();
    let value = vec![7u8; 2000];

    // Each record needs a 2048 block: 2048, then 4096 after one growth,
    // then its buddy 6144
    store.insert(b"1", &value).unwrap();
    store.insert(b"2", &value).unwrap();
    store.insert(b"3", &value).unwrap();
    assert_eq!(store.stats().file_len, 8192);

    store.remove(b"1").unwrap();
    store.remove(b"3").unwrap();

    // 2048 and 6144 are not buddies; neither can merge
    let report = store.fsck().unwrap();
    assert_eq!(report.data_blocks, 1);
    assert_eq!(report.free_blocks, 3);
    assert_eq!(report.free_bytes, 1024 + 2048 + 2048);
    assert_eq!(store.get(b"2").unwrap(), Some(&value[..]));

    // Freeing 4096 merges it with 6144
    store.remove(b"2").unwrap();
    let report = store.fsck().unwrap();
    assert_eq!(report.free_blocks, 3);
    assert_eq!(report.free_bytes, 1024 + 2048 + 4096);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_clean_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.db");

    {
        let mut store = Store::open_path(&path).unwrap();
        for i in 0..100 {
            let key = format!("key{}", i);
            let value = format!("value{}", i);
            store.insert(key.as_bytes(), value.as_bytes()).unwrap();
        }
        store.close().unwrap();
    }

    let store = Store::open_path(&path).unwrap();
    assert!(store.recovery_report().is_none());
    assert!(!store.stats().dirty);
    assert_eq!(store.len(), 100);
    for i in 0..100 {
        let key = format!("key{}", i);
        let value = format!("value{}", i);
        assert_eq!(store.get(key.as_bytes()).unwrap(), Some(value.as_bytes()));
    }
    store.fsck().unwrap();
}

#[test]
fn test_unclean_reopen_recovers() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.db");

    {
        let mut store = Store::open_path(&path).unwrap();
        store.insert(b"kept", b"synced").unwrap();
        store.sync().unwrap();
        store.insert(b"later", b"unsynced").unwrap();
        store.remove(b"kept").unwrap();
        store.insert(b"kept", b"again").unwrap();
        assert!(store.stats().dirty);
        // Dropped without sync
    }

    let store = Store::open_path(&path).unwrap();
    let report = store.recovery_report().unwrap();
    assert_eq!(report.records_kept, 2);
    assert_eq!(report.duplicates_dropped, 0);
    assert_eq!(store.get(b"kept").unwrap(), Some(&b"again"[..]));
    assert_eq!(store.get(b"later").unwrap(), Some(&b"unsynced"[..]));
    store.fsck().unwrap();
}

#[test]
fn test_sync_marks_clean() {
    let mut store = setup_memory_store();
    assert!(!store.stats().dirty);

    store.insert(b"key", b"value").unwrap();
    assert!(store.stats().dirty);

    store.sync().unwrap();
    assert!(!store.stats().dirty);

    let image = store.into_backing().into_bytes();
    let store = Store::with_backing(MemoryBacking::from_bytes(image)).unwrap();
    assert!(store.recovery_report().is_none());
    assert_eq!(store.get(b"key").unwrap(), Some(&b"value"[..]));
}

#[test]
fn test_second_open_is_locked_out() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.db");

    let _first = Store::open_path(&path).unwrap();
    let second = Store::open_path(&path);

    assert!(matches!(second, Err(BuddyError::Locked(_))));
}

#[test]
fn test_lock_released_on_close() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.db");

    let first = Store::open_path(&path).unwrap();
    first.close().unwrap();

    Store::open_path(&path).unwrap();
}

#[test]
fn test_unrecognized_file() {
    let temp_dir = TempDir::new().unwrap();

    let odd_len = temp_dir.path().join("odd.db");
    fs::write(&odd_len, vec![1u8; 100]).unwrap();
    assert!(matches!(
        Store::open_path(&odd_len),
        Err(BuddyError::UnrecognizedFile(_))
    ));

    let foreign = temp_dir.path().join("foreign.db");
    fs::write(&foreign, vec![0xabu8; 4096]).unwrap();
    assert!(matches!(
        Store::open_path(&foreign),
        Err(BuddyError::UnrecognizedFile(_))
    ));
}

#[test]
fn test_zeroed_file_is_initialized() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("zero.db");
    fs::write(&path, vec![0u8; 4096]).unwrap();

    let mut store = Store::open_path(&path).unwrap();

    store.insert(b"key", b"value").unwrap();
    store.fsck().unwrap();
}

#[test]
fn test_reset_discards_everything() {
    let mut store = setup_memory_store();
    store.insert(b"big", &vec![1u8; 10_000]).unwrap();
    store.insert(b"small", b"x").unwrap();

    store.reset().unwrap();

    assert!(store.is_empty());
    assert_eq!(store.get(b"small").unwrap(), None);
    assert_eq!(store.stats().file_len, 4096);
    store.fsck().unwrap();
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_write_poisons_store() {
    let budget = Arc::new(AtomicUsize::new(usize::MAX));
    let backing = FailingBacking {
        inner: MemoryBacking::new(),
        writes_left: Arc::clone(&budget),
    };
    let mut store = Store::with_backing(backing).unwrap();
    store.insert(b"before", b"ok").unwrap();

    budget.store(2, Ordering::SeqCst);
    let result = store.insert(b"key", &vec![9u8; 3000]);

    assert!(matches!(result, Err(BuddyError::Io(_))));
    assert!(store.is_poisoned());
    assert!(matches!(store.get(b"before"), Err(BuddyError::Poisoned)));
    assert!(matches!(store.insert(b"x", b"y"), Err(BuddyError::Poisoned)));

    // Whatever reached the backing is recoverable
    let image = store.into_backing().inner.into_bytes();
    let store = Store::with_backing(MemoryBacking::from_bytes(image)).unwrap();
    assert_eq!(store.get(b"before").unwrap(), Some(&b"ok"[..]));
    assert_eq!(store.get(b"key").unwrap(), None);
    store.fsck().unwrap();
}

#[test]
fn test_reset_clears_poison() {
    let budget = Arc::new(AtomicUsize::new(usize::MAX));
    let backing = FailingBacking {
        inner: MemoryBacking::new(),
        writes_left: Arc::clone(&budget),
    };
    let mut store = Store::with_backing(backing).unwrap();

    budget.store(0, Ordering::SeqCst);
    assert!(store.insert(b"key", b"value").is_err());
    assert!(store.is_poisoned());

    budget.store(usize::MAX, Ordering::SeqCst);
    store.reset().unwrap();

    assert!(!store.is_poisoned());
    store.insert(b"key", b"value").unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(&b"value"[..]));
}

#[test]
fn test_failed_growth_leaves_accessors_usable() {
    let fail_resize = Arc::new(AtomicBool::new(false));
    let backing = LostViewBacking {
        inner: MemoryBacking::new(),
        fail_resize: Arc::clone(&fail_resize),
        view_lost: false,
    };
    let mut store = Store::with_backing(backing).unwrap();
    store.insert(b"small", b"value").unwrap();
    assert_eq!(store.len(), 1);

    // Too large for the initial file, so the insert has to grow it
    fail_resize.store(true, Ordering::SeqCst);
    assert!(store.insert(b"big", &vec![7u8; 5000]).is_err());
    assert!(store.is_poisoned());

    assert_eq!(store.len(), 0);
    assert!(store.is_empty());
    let stats = store.stats();
    assert_eq!(stats.file_len, 4096);
    assert_eq!(stats.slots, 0);
    assert!(matches!(store.fsck(), Err(BuddyError::Poisoned)));
    assert!(matches!(store.get(b"small"), Err(BuddyError::Poisoned)));
}

#[test]
fn test_poisoned_store_refuses_fsck() {
    let budget = Arc::new(AtomicUsize::new(usize::MAX));
    let backing = FailingBacking {
        inner: MemoryBacking::new(),
        writes_left: Arc::clone(&budget),
    };
    let mut store = Store::with_backing(backing).unwrap();
    store.insert(b"key", b"value").unwrap();
    store.fsck().unwrap();

    budget.store(0, Ordering::SeqCst);
    assert!(store.insert(b"key", &vec![1u8; 5000]).is_err());

    assert!(matches!(store.fsck(), Err(BuddyError::Poisoned)));
    assert_eq!(store.len(), 1);
    assert_eq!(store.stats().entries, 1);
}
