//! Page-lifecycle core for an MVCC storage engine.
//!
//! A single writer stages modified pages in scratch space and commits them as
//! new versions; readers pinned at a snapshot resolve pages without blocking the
//! writer. Committed pages are journaled as compact diffs, and scratch space is
//! reclaimed only once no reader can still observe it.

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{StorageEnv, StorageOptions};
pub use types::{PageId, PenumbraError, Result, ScratchFileId, TxId};
