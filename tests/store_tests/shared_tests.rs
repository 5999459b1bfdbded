//! Tests for SharedStore
//!
//! These tests verify:
//! - Concurrent writers on distinct keys
//! - Concurrent readers and writers on shared keys
//! - Handing the store back once all handles are gone

use std::thread;

use buddykv::{SharedStore, Store};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_shared() -> (TempDir, SharedStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open_path(&temp_dir.path().join("shared.db")).unwrap();
    (temp_dir, SharedStore::new(store))
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers() {
    let (_dir, shared) = setup_shared();
    let num_threads = 8;
    let writes_per_thread = 100;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let shared = shared.clone();
            thread::spawn(move || {
                for i in 0..writes_per_thread {
                    let key = format!("t{}_k{}", t, i);
                    let value = format!("t{}_v{}", t, i);
                    shared.insert(key.as_bytes(), value.as_bytes()).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.len(), num_threads * writes_per_thread);
    for t in 0..num_threads {
        for i in 0..writes_per_thread {
            let key = format!("t{}_k{}", t, i);
            let value = format!("t{}_v{}", t, i);
            assert_eq!(shared.get(key.as_bytes()).unwrap(), Some(value.into_bytes()));
        }
    }
    shared.with(|store| store.fsck()).unwrap();
}

#[test]
fn test_concurrent_readers_and_writers() {
    let (_dir, shared) = setup_shared();
    for i in 0..50u32 {
        shared.insert(&i.to_le_bytes(), b"initial").unwrap();
    }

    let writer = {
        let shared = shared.clone();
        thread::spawn(move || {
            for round in 0..20u32 {
                for i in 0..50u32 {
                    let value = format!("round{}", round);
                    shared.insert(&i.to_le_bytes(), value.as_bytes()).unwrap();
                }
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    for i in 0..50u32 {
                        // Every key always holds some complete value
                        let value = shared.get(&i.to_le_bytes()).unwrap().unwrap();
                        assert!(value == b"initial" || value.starts_with(b"round"));
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(shared.len(), 50);
    assert_eq!(
        shared.get(&7u32.to_le_bytes()).unwrap(),
        Some(b"round19".to_vec())
    );
}

#[test]
fn test_remove_and_contains() {
    let (_dir, shared) = setup_shared();

    shared.insert(b"key", b"value").unwrap();
    assert!(shared.contains_key(b"key").unwrap());
    assert!(shared.remove(b"key").unwrap());
    assert!(!shared.contains_key(b"key").unwrap());
    assert!(shared.is_empty());
}

#[test]
fn test_into_inner() {
    let (_dir, shared) = setup_shared();
    shared.insert(b"key", b"value").unwrap();
    shared.sync().unwrap();

    let other = shared.clone();
    let shared = match shared.into_inner() {
        Some(_) => panic!("another handle is still alive"),
        None => other,
    };

    let store = shared.into_inner().unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(&b"value"[..]));
    store.close().unwrap();
}
