#![forbid(unsafe_code)]
//! Identifiers, error types, and page-size constants shared by every layer.

use std::fmt;

pub mod checksum;

pub use checksum::{frame_crc32, Checksum, Crc32Fast};

/// Logical page number, stable across physical relocations.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Transaction identifier; write transactions receive strictly increasing ids.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

/// Identifier of one scratch buffer file inside the scratch pool.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ScratchFileId(pub u32);

impl TxId {
    /// The id observed before any write transaction committed.
    pub const ZERO: TxId = TxId(0);

    /// Returns the id that follows this one.
    pub const fn next(self) -> TxId {
        TxId(self.0 + 1)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ScratchFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<u64> for TxId {
    fn from(value: u64) -> Self {
        TxId(value)
    }
}

/// Errors surfaced by the page-storage core.
#[derive(thiserror::Error, Debug)]
pub enum PenumbraError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration or argument rejected at the call boundary.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested temporary page size is not a supported power of two.
    #[error("invalid page size {requested}: must be a power of two and at least {page_size}")]
    InvalidSize {
        /// Size requested by the caller.
        requested: usize,
        /// Base page size of the environment.
        page_size: usize,
    },
    /// Requested temporary page size exceeds the configured maximum.
    #[error("page size {requested} exceeds the maximum compressed page size {max}")]
    SizeTooLarge {
        /// Size requested by the caller.
        requested: usize,
        /// Configured upper bound.
        max: usize,
    },
    /// Scratch space cannot grow to satisfy an allocation.
    #[error("scratch space exhausted: requested {requested} pages, limit {limit} pages")]
    ScratchFull {
        /// Pages needed to satisfy the request.
        requested: u64,
        /// Maximum number of pages available.
        limit: u64,
    },
    /// Lifecycle bookkeeping was corrupted upstream (double free, id regression).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The pager backing a buffer has been disposed.
    #[error("pager disposed")]
    Disposed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PenumbraError>;

pub mod page {
    //! Page-size constants and validation.

    use super::{PenumbraError, Result};

    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;
    /// Smallest page size accepted by the pager.
    pub const MIN_PAGE_SIZE: u32 = 512;
    /// Largest page size accepted by the pager.
    pub const MAX_PAGE_SIZE: u32 = 64 * 1024;
    /// Default upper bound for a compressed page materialized in a temporary buffer.
    pub const DEFAULT_MAX_COMPRESSED_PAGE_SIZE: u32 = 64 * 1024;

    /// Validates that `page_size` is a power of two inside the supported range.
    pub fn validate_page_size(page_size: u32) -> Result<()> {
        if !page_size.is_power_of_two() {
            return Err(PenumbraError::Invalid("page size must be a power of two"));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(PenumbraError::Invalid("page size outside supported range"));
        }
        Ok(())
    }
}
