//! Page-lifecycle core: scratch allocation, MVCC version lookup, temporary
//! pages for compressed data, and journaling of committed pages.

/// Run-length byte differ for page images.
pub mod diff;

/// Scratch files and the pool coordinating them.
///
/// Copy-on-write staging for pages modified by the write transaction.
pub mod scratch;

/// MVCC index from logical page to committed versions.
pub mod page_table;

/// Temporary pages for materializing compressed pages.
pub mod decompression;

/// Journal frames, writer and replay.
pub mod journal;

/// Write/read transaction handles and reader tracking.
pub mod txn;

mod env;
mod metrics;
mod options;

/// Storage environment facade.
pub use env::{EnvStats, FlushOutcome, StorageEnv};

/// Metrics and profiling.
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StorageMetrics};

/// Storage configuration.
pub use options::{default_config_path, ConfigError, StorageOptions};

pub use decompression::{compress_page, DecompressionBufferPool, TempPageScope};
pub use diff::PageDiff;
pub use journal::{JournalReader, JournalWriter, ReplayOutcome};
pub use page_table::{PagePosition, PageVersionTable, ScratchLocation, VersionLookup};
pub use scratch::{PageFromScratchBuffer, ScratchBufferFile, ScratchBufferPool};
pub use txn::{ReadTransaction, TransactionTracker, TxContext, WriteTransaction};
