#![forbid(unsafe_code)]

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::pager::PageSpanMut;
use crate::storage::decompression::{DecompressionBufferPool, DecompressionStats, TempPageScope};
use crate::storage::diff::{self, PageDiff};
use crate::storage::journal::JournalWriter;
use crate::storage::metrics::{default_metrics, StorageMetrics};
use crate::storage::options::StorageOptions;
use crate::storage::page_table::{PagePosition, PageVersionTable, VersionLookup};
use crate::storage::scratch::{PageFromScratchBuffer, ScratchBufferPool, ScratchPoolStats};
use crate::storage::txn::{
    ReadTransaction, ReaderSnapshot, TransactionTracker, TxContext, WriteTransaction,
};
use crate::types::{PageId, PenumbraError, Result, TxId};

/// Outcome of [`StorageEnv::flush_journal`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushOutcome {
    /// Newest transaction in the journal after the flush.
    pub journaled_up_to: TxId,
    /// Transactions written by this flush.
    pub transactions: usize,
    /// Frames written by this flush.
    pub frames: usize,
    /// Bytes written by this flush.
    pub bytes: u64,
    /// Boundary passed to version garbage collection.
    pub gc_boundary: TxId,
    /// Scratch allocations returned to the pending free lists.
    pub freed_allocations: usize,
}

/// Point-in-time view of the whole environment.
#[derive(Clone, Debug, Default)]
pub struct EnvStats {
    /// Newest committed transaction.
    pub last_committed: TxId,
    /// Newest journaled transaction.
    pub last_journaled: TxId,
    /// Logical pages with versions in the table.
    pub tracked_pages: usize,
    /// Collected pages served from their journaled image.
    pub journaled_pages: usize,
    /// Active reader summary.
    pub readers: ReaderSnapshot,
    /// Scratch pool statistics.
    pub scratch: ScratchPoolStats,
    /// Decompression pool statistics.
    pub decompression: DecompressionStats,
    /// Journal length in bytes.
    pub journal_bytes: u64,
}

/// Journaled image of a page whose versions were collected.
struct JournaledPage {
    tx: TxId,
    image: Arc<[u8]>,
}

/// Storage environment binding the scratch pool, version table, decompression
/// pool and journal behind one transactional API.
///
/// One write transaction at a time allocates scratch pages, fills them and
/// commits a page set. Any number of readers resolve pages at their snapshot
/// concurrently with the writer.
pub struct StorageEnv {
    options: StorageOptions,
    tracker: Arc<TransactionTracker>,
    scratch: ScratchBufferPool,
    page_table: PageVersionTable,
    journaled: DashMap<PageId, JournaledPage>,
    decompression: DecompressionBufferPool,
    journal: Mutex<JournalWriter>,
    maintenance: Mutex<()>,
    metrics: Arc<dyn StorageMetrics>,
}

impl StorageEnv {
    /// Opens an environment; the journal is replayed when it already has frames.
    pub fn open(options: StorageOptions) -> Result<Self> {
        if let Err(err) = options.validate() {
            error!(error = %err, "env.open.invalid_options");
            return Err(PenumbraError::Invalid("storage options rejected"));
        }
        let journal_io: Arc<dyn FileIo> = match &options.journal_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(StdFileIo::open(path)?)
            }
            None => Arc::new(MemFileIo::new()),
        };
        let journal = JournalWriter::open(journal_io, options.page_size as usize)?;
        let last_journaled = journal.last_journaled();
        let journaled: DashMap<PageId, JournaledPage> = journal
            .images()
            .map(|(page, image)| {
                let entry = JournaledPage {
                    tx: last_journaled,
                    image: Arc::from(image),
                };
                (page, entry)
            })
            .collect();
        let env = Self {
            tracker: Arc::new(TransactionTracker::new(last_journaled)),
            scratch: ScratchBufferPool::new(&options)?,
            page_table: PageVersionTable::new(),
            journaled,
            decompression: DecompressionBufferPool::new(&options)?,
            journal: Mutex::new(journal),
            maintenance: Mutex::new(()),
            metrics: default_metrics(),
            options,
        };
        info!(
            page_size = env.options.page_size,
            last_journaled = last_journaled.0,
            journaled_pages = env.journaled.len(),
            "env.open"
        );
        Ok(env)
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn StorageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Options the environment was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.options.page_size as usize
    }

    /// Transaction tracker shared by all handles.
    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        &self.tracker
    }

    /// Version table, for callers that drive commits directly.
    pub fn page_table(&self) -> &PageVersionTable {
        &self.page_table
    }

    /// Opens a read transaction at the last committed snapshot.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.tracker.begin_read()
    }

    /// Opens the single write transaction.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        self.tracker.begin_write()
    }

    /// Allocates `page_count` contiguous scratch pages for `tx`.
    pub fn allocate_scratch(
        &self,
        tx: &WriteTransaction,
        page_count: u64,
    ) -> Result<PageFromScratchBuffer> {
        let allocation = self.scratch.allocate(tx.context(), page_count)?;
        self.metrics.scratch_allocated(allocation.size);
        Ok(allocation)
    }

    /// Writable view of a scratch allocation owned by the writer.
    pub fn page_mut(&self, allocation: &PageFromScratchBuffer) -> Result<PageSpanMut> {
        self.scratch.page_mut(allocation)
    }

    /// Frees a scratch allocation.
    ///
    /// `None` is a rollback free, reusable at once. `Some(tx)` keeps the region
    /// away from reuse until every reader older than `tx` has finished; frees
    /// made inside a still-open transaction should pass its id.
    pub fn free_scratch(&self, allocation: &PageFromScratchBuffer, tx: Option<TxId>) -> Result<()> {
        self.scratch.free(
            allocation.scratch_file_id,
            allocation.position_in_scratch,
            tx,
        )?;
        self.metrics.scratch_freed(tx.is_some());
        Ok(())
    }

    /// Splits a multi-page allocation so its pages can be freed independently.
    pub fn break_large_allocation(&self, allocation: &PageFromScratchBuffer) -> Result<()> {
        self.scratch.break_large_allocation(allocation)
    }

    /// Records `items` as the page set of `tx` and publishes it to new readers.
    ///
    /// On error the transaction is rolled back.
    pub fn commit_versions(
        &self,
        tx: WriteTransaction,
        items: &FxHashMap<PageId, PagePosition>,
    ) -> Result<TxId> {
        let _maintenance = self.maintenance.lock();
        self.page_table.set_items(tx.context(), items)?;
        Ok(tx.commit())
    }

    /// Newest version of `page` visible at snapshot `tx`.
    pub fn resolve(&self, tx: TxId, page: PageId) -> Option<PagePosition> {
        let found = self.page_table.try_get_value(TxContext::solo(tx), page);
        self.metrics.page_resolved(found.is_some());
        found
    }

    /// Runs `f` over the image of `page` visible at `tx`.
    ///
    /// The image spans every page of the version's allocation. Pages whose
    /// versions were collected are served from their journaled image. Returns
    /// `None` when the page is deleted or was never written at `tx`.
    pub fn with_page<R>(
        &self,
        tx: TxId,
        page: PageId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<Option<R>> {
        let location = match self.page_table.lookup(TxContext::solo(tx), page) {
            VersionLookup::Visible(position) => position.location,
            VersionLookup::Deleted => None,
            VersionLookup::Untracked => {
                let image = self
                    .journaled
                    .get(&page)
                    .filter(|entry| entry.tx <= tx)
                    .map(|entry| Arc::clone(&entry.image));
                self.metrics.page_resolved(image.is_some());
                return Ok(image.map(|image| f(&image)));
            }
        };
        self.metrics.page_resolved(location.is_some());
        let Some(location) = location else {
            return Ok(None);
        };
        let span = self
            .scratch
            .read_page(location.file, location.position, location.pages)?;
        if span.page_count() == 1 {
            let bytes = span
                .page(0)
                .ok_or(PenumbraError::Invalid("empty page span"))?;
            return Ok(Some(f(bytes)));
        }
        Ok(Some(f(&span.to_vec())))
    }

    /// Copies the image of `page` visible at `tx`.
    pub fn read_page(&self, tx: TxId, page: PageId) -> Result<Option<Vec<u8>>> {
        self.with_page(tx, page, <[u8]>::to_vec)
    }

    /// Temporary page of `size` bytes for decoding a compressed page.
    pub fn acquire_decompression_buffer(&self, tx: TxContext, size: usize) -> Result<TempPageScope<'_>> {
        let scope = self.decompression.get_temporary_page(tx, size)?;
        self.metrics.temp_page_acquired(size);
        Ok(scope)
    }

    /// Decodes a snappy-compressed page into a temporary page.
    pub fn decompress_page(
        &self,
        tx: TxContext,
        compressed: &[u8],
        uncompressed_size: usize,
    ) -> Result<TempPageScope<'_>> {
        let scope = self
            .decompression
            .decompress_page(tx, compressed, uncompressed_size)?;
        self.metrics.temp_page_acquired(scope.size());
        Ok(scope)
    }

    /// Diff turning `old` into `new` over the first `size` bytes.
    pub fn diff(&self, old: &[u8], new: &[u8], size: usize) -> Result<PageDiff> {
        diff::compute_diff(old, new, size)
    }

    /// Applies an encoded diff to `destination`.
    pub fn apply_diff(&self, destination: &mut [u8], encoded: &[u8], size: usize) -> Result<()> {
        diff::apply(destination, encoded, size)
    }

    /// Journals every committed transaction not yet journaled, then reclaims
    /// versions no reader can still see.
    ///
    /// Garbage collection stops at the older of the journaled id and the oldest
    /// reader snapshot. Reclaimed allocations are freed behind the current
    /// committed id, so readers that already resolved them keep valid bytes.
    pub fn flush_journal(&self) -> Result<FlushOutcome> {
        let _maintenance = self.maintenance.lock();
        let mut journal = self.journal.lock();
        let last_committed = self.tracker.last_committed();
        let mut outcome = FlushOutcome::default();
        let pending = self
            .page_table
            .get_modified_pages_for_transaction_range(journal.last_journaled().next(), last_committed);
        for (tx, pages) in pending {
            let stats = journal.write_transaction(tx, &pages, &self.scratch)?;
            outcome.transactions += 1;
            outcome.frames += stats.frames;
            outcome.bytes += stats.bytes;
        }
        journal.sync()?;
        outcome.journaled_up_to = journal.last_journaled();
        self.metrics.journal_flushed(outcome.frames, outcome.bytes);

        let horizon = self.tracker.oldest_active_read(last_committed);
        outcome.gc_boundary = outcome.journaled_up_to.min(horizon);
        // Journaled images must be in place before their versions leave the table.
        for (page, newest) in self.page_table.settled_pages(outcome.gc_boundary) {
            if newest.is_freed_marker() {
                self.journaled.remove(&page);
                continue;
            }
            let Some(image) = journal.last_image(page) else {
                error!(
                    page = page.0,
                    tx = newest.transaction_id.0,
                    "env.flush.missing_image"
                );
                return Err(PenumbraError::InvariantViolation(format!(
                    "page {} collected without a journaled image",
                    page
                )));
            };
            let entry = JournaledPage {
                tx: newest.transaction_id,
                image: Arc::from(image),
            };
            self.journaled.insert(page, entry);
        }
        drop(journal);
        let mut unused = Vec::new();
        self.page_table
            .remove_keys_where_all_pages_older_than(outcome.gc_boundary, &mut unused);
        for position in unused {
            let Some(location) = position.location else {
                continue;
            };
            self.scratch
                .free(location.file, location.position, Some(last_committed))?;
            self.metrics.scratch_freed(true);
            outcome.freed_allocations += 1;
        }
        debug!(
            journaled_up_to = outcome.journaled_up_to.0,
            gc_boundary = outcome.gc_boundary.0,
            freed = outcome.freed_allocations,
            "env.flush_journal"
        );
        Ok(outcome)
    }

    /// Disposes superseded decompression pagers and unused scratch files.
    pub fn cleanup(&self) -> usize {
        let oldest = self
            .tracker
            .oldest_active_read(self.tracker.last_committed().next());
        self.decompression.cleanup() + self.scratch.cleanup(oldest)
    }

    /// Snapshot of environment statistics.
    pub fn stats(&self) -> EnvStats {
        let journal = self.journal.lock();
        EnvStats {
            last_committed: self.tracker.last_committed(),
            last_journaled: journal.last_journaled(),
            tracked_pages: self.page_table.count(),
            journaled_pages: self.journaled.len(),
            readers: self.tracker.reader_snapshot(),
            scratch: self.scratch.stats(),
            decompression: self.decompression.stats(),
            journal_bytes: journal.len(),
        }
    }
}

impl Drop for StorageEnv {
    fn drop(&mut self) {
        self.decompression.dispose();
        self.scratch.dispose();
    }
}
