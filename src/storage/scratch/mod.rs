#![forbid(unsafe_code)]
//! Copy-on-write staging space for write transactions.

mod file;
mod pool;

pub use file::{PageFromScratchBuffer, ScratchBufferFile, ScratchFileStats};
pub use pool::{ScratchBufferPool, ScratchPoolStats};
