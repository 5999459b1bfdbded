//! # buddykv
//!
//! A single-file embedded key-value store with:
//! - A buddy block allocator over the file's heap
//! - An open-addressed hash index stored in the heap itself
//! - Zero-copy reads through a memory map
//! - Crash recovery that tolerates the process dying between any two writes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Store (get / insert / remove)               │
//! │              SharedStore (one mutex around it)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ Hash Index  │─────────▶│  Allocator  │
//!   │  (probing)  │          │   (buddy)   │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                         │
//!          └────────────┬────────────┘
//!                       ▼
//!               ┌───────────────┐        ┌──────────────────┐
//!               │     Heap      │◀───────│ Recovery / Fsck  │
//!               │ (root, flag)  │        │   (heap scan)    │
//!               └───────┬───────┘        └──────────────────┘
//!                       ▼
//!               ┌───────────────┐
//!               │    Backing    │
//!               │ (file + mmap) │
//!               └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use buddykv::Store;
//!
//! let mut store = Store::open_path("data.db".as_ref())?;
//! store.insert(b"hello", b"world")?;
//! assert_eq!(store.get(b"hello")?, Some(&b"world"[..]));
//! store.close()?;
//! # Ok::<(), buddykv::BuddyError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod backing;
mod format;
mod heap;
mod alloc;
mod index;
mod recovery;
mod fsck;
pub mod store;
pub mod shared;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use backing::{Backing, FileBacking, MemoryBacking, WriteOp};
pub use config::Config;
pub use error::{BuddyError, Result};
pub use format::MIN_SECTOR_SIZE;
pub use fsck::FsckReport;
pub use recovery::RecoveryReport;
pub use shared::SharedStore;
pub use store::{Store, StoreStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of buddykv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
