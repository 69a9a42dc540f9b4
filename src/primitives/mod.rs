//! Low-level primitives for building the storage core.
//!
//! Includes file I/O abstractions and the page store the scratch and
//! decompression pools are carved from.

/// I/O abstractions and utilities.
///
/// Interfaces for positional reads/writes and file operations.
pub mod io;

/// Paging subsystem.
///
/// Growable page stores handing out guarded, bounds-checked page spans.
pub mod pager;
