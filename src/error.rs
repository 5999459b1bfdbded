//! Error types for buddykv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using BuddyError
pub type Result<T> = std::result::Result<T, BuddyError>;

/// Unified error type for buddykv operations
#[derive(Debug, Error)]
pub enum BuddyError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to lock the backing file for exclusive use: {0}")]
    Locked(#[source] std::io::Error),

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Not a buddykv store: {0}")]
    UnrecognizedFile(String),

    #[error("Store corruption detected: {0}")]
    Corruption(String),

    #[error("Consistency check failed: {0}")]
    Fsck(String),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    #[error("Allocation of {0} bytes exceeds the largest size class")]
    AllocationTooLarge(u64),

    /// A mutation failed part way through. The in-memory view may disagree
    /// with the bytes on disk, so the instance refuses further use; reopening
    /// the file runs recovery.
    #[error("Store is poisoned by an earlier failed write; reopen to recover")]
    Poisoned,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
