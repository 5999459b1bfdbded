//! Shared Store
//!
//! The whole store behind one mutex, for callers that need it from several
//! threads. Every call holds the lock for the full operation, so calls are
//! serialized exactly as the single-writer contract requires. Values come
//! back as owned copies because views cannot outlive the lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backing::{Backing, FileBacking};
use crate::error::Result;
use crate::store::Store;

/// Cloneable, thread-safe handle to a [`Store`]
pub struct SharedStore<B: Backing = FileBacking> {
    inner: Arc<Mutex<Store<B>>>,
}

impl<B: Backing> Clone for SharedStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backing> SharedStore<B> {
    pub fn new(store: Store<B>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Get a copy of the value for `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let store = self.inner.lock();
        Ok(store.get(key)?.map(<[u8]>::to_vec))
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().insert(key, value)?;
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().remove(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    /// Run `f` with exclusive access to the store
    pub fn with<R>(&self, f: impl FnOnce(&mut Store<B>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Take the store back once this is the last handle
    pub fn into_inner(self) -> Option<Store<B>> {
        Arc::try_unwrap(self.inner).ok().map(Mutex::into_inner)
    }
}
