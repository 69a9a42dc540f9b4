use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use super::file::{PageFromScratchBuffer, ScratchBufferFile, ScratchFileStats};
use crate::primitives::pager::{PageSpan, PageSpanMut, Pager, PagerOptions};
use crate::storage::options::StorageOptions;
use crate::storage::txn::TxContext;
use crate::types::{PenumbraError, Result, ScratchFileId, TxId};

struct ScratchFileEntry {
    file: Mutex<ScratchBufferFile>,
    pager: Arc<Pager>,
}

struct PoolState {
    current: ScratchFileId,
    next_id: u32,
    recycle: VecDeque<ScratchFileId>,
}

/// Aggregate statistics for the scratch pool.
#[derive(Clone, Debug, Default)]
pub struct ScratchPoolStats {
    /// File new allocations are served from.
    pub current_file: ScratchFileId,
    /// Files queued for recycling.
    pub recycle_queue: usize,
    /// Per-file statistics, ordered by id.
    pub files: Vec<ScratchFileStats>,
}

/// Set of scratch files that together serve every write transaction.
///
/// The writer allocates and frees through the pool; readers reach committed
/// scratch pages through [`ScratchBufferPool::read_page`], which goes straight to
/// the owning pager without touching allocation bookkeeping.
pub struct ScratchBufferPool {
    page_size: u32,
    max_file_pages: u64,
    max_files: usize,
    retained_recycled: usize,
    directory: Option<PathBuf>,
    files: RwLock<FxHashMap<ScratchFileId, Arc<ScratchFileEntry>>>,
    state: Mutex<PoolState>,
}

impl ScratchBufferPool {
    /// Creates the pool and its first scratch file.
    pub fn new(options: &StorageOptions) -> Result<Self> {
        if let Some(dir) = &options.scratch_dir {
            std::fs::create_dir_all(dir)?;
        }
        let pool = Self {
            page_size: options.page_size,
            max_file_pages: options.max_scratch_file_pages(),
            max_files: options.max_scratch_files,
            retained_recycled: options.retained_recycled_files,
            directory: options.scratch_dir.clone(),
            files: RwLock::new(FxHashMap::default()),
            state: Mutex::new(PoolState {
                current: ScratchFileId(0),
                next_id: 1,
                recycle: VecDeque::new(),
            }),
        };
        pool.create_file(ScratchFileId(0))?;
        Ok(pool)
    }

    fn create_file(&self, id: ScratchFileId) -> Result<Arc<ScratchFileEntry>> {
        let options = PagerOptions::new(self.page_size).max_pages(self.max_file_pages);
        let pager = match &self.directory {
            Some(dir) => Pager::create(dir.join(format!("scratch.{:010}.buffers", id.0)), options)?,
            None => Pager::in_memory(options)?,
        };
        let pager = Arc::new(pager);
        let entry = Arc::new(ScratchFileEntry {
            file: Mutex::new(ScratchBufferFile::new(id, Arc::clone(&pager))),
            pager,
        });
        self.files.write().insert(id, Arc::clone(&entry));
        info!(file = id.0, "scratch.pool.create_file");
        Ok(entry)
    }

    fn entry(&self, id: ScratchFileId) -> Result<Arc<ScratchFileEntry>> {
        self.files.read().get(&id).cloned().ok_or_else(|| {
            error!(file = id.0, "scratch.pool.unknown_file");
            PenumbraError::InvariantViolation(format!("unknown scratch file {id}"))
        })
    }

    /// Page size of every scratch file.
    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    /// File that currently serves new allocations.
    pub fn current_file_id(&self) -> ScratchFileId {
        self.state.lock().current
    }

    /// Allocates `number_of_pages` contiguous pages, rounded up to a power of two.
    pub fn allocate(&self, tx: TxContext, number_of_pages: u64) -> Result<PageFromScratchBuffer> {
        if number_of_pages == 0 {
            return Err(PenumbraError::Invalid("cannot allocate zero pages"));
        }
        let size = number_of_pages
            .checked_next_power_of_two()
            .ok_or(PenumbraError::Invalid("scratch allocation too large"))?;
        if size > self.max_file_pages {
            return Err(PenumbraError::ScratchFull {
                requested: size,
                limit: self.max_file_pages,
            });
        }
        let mut state = self.state.lock();
        let current = self.entry(state.current)?;
        {
            let mut file = current.file.lock();
            if let Some(allocation) = file.try_get_from_freed_buffer(tx, number_of_pages, size) {
                return Ok(allocation);
            }
            if file.last_used_page() + size <= self.max_file_pages {
                return file.allocate(tx, number_of_pages, size);
            }
        }
        let previous = state.current;
        let next = self.roll_over(&mut state, tx.oldest_active_read, size)?;
        state.current = next.file.lock().id();
        if self.entry(previous)?.file.lock().allocated_pages_count() == 0
            && !state.recycle.contains(&previous)
        {
            state.recycle.push_back(previous);
        }
        debug!(
            from = previous.0,
            to = state.current.0,
            tx = tx.id.0,
            "scratch.pool.roll_over"
        );
        let mut file = next.file.lock();
        file.allocate(tx, number_of_pages, size)
    }

    fn roll_over(
        &self,
        state: &mut PoolState,
        oldest_active: TxId,
        size: u64,
    ) -> Result<Arc<ScratchFileEntry>> {
        let queued = state.recycle.len();
        for _ in 0..queued {
            let Some(id) = state.recycle.pop_front() else {
                break;
            };
            let Ok(candidate) = self.entry(id) else {
                continue;
            };
            let mut file = candidate.file.lock();
            if file.has_actively_used_bytes(oldest_active) {
                drop(file);
                state.recycle.push_back(id);
                continue;
            }
            file.reset()?;
            debug!(file = id.0, "scratch.pool.recycle");
            drop(file);
            return Ok(candidate);
        }
        if self.files.read().len() >= self.max_files {
            return Err(PenumbraError::ScratchFull {
                requested: size,
                limit: self.max_file_pages * self.max_files as u64,
            });
        }
        let id = ScratchFileId(state.next_id);
        state.next_id += 1;
        self.create_file(id)
    }

    /// Frees the allocation at `position` in file `id`.
    ///
    /// See [`ScratchBufferFile::free`] for the meaning of `tx`.
    pub fn free(&self, id: ScratchFileId, position: u64, tx: Option<TxId>) -> Result<()> {
        let entry = self.entry(id)?;
        let mut state = self.state.lock();
        let mut file = entry.file.lock();
        file.free(position, tx)?;
        if id != state.current && file.allocated_pages_count() == 0 && !state.recycle.contains(&id)
        {
            state.recycle.push_back(id);
            debug!(file = id.0, "scratch.pool.queue_recycle");
        }
        Ok(())
    }

    /// Splits a multi-page allocation so its pages can be freed one by one.
    pub fn break_large_allocation(&self, allocation: &PageFromScratchBuffer) -> Result<()> {
        let entry = self.entry(allocation.scratch_file_id)?;
        let mut file = entry.file.lock();
        file.break_large_allocation_to_separate_pages(allocation)
    }

    /// Shared view of `count` pages starting at `position` in file `id`.
    pub fn read_page(&self, id: ScratchFileId, position: u64, count: u64) -> Result<PageSpan> {
        let entry = self.entry(id)?;
        entry.pager.read(position, count)
    }

    /// Writable view over a live allocation.
    pub fn page_mut(&self, allocation: &PageFromScratchBuffer) -> Result<PageSpanMut> {
        let entry = self.entry(allocation.scratch_file_id)?;
        let file = entry.file.lock();
        file.page_mut(allocation.position_in_scratch)
    }

    /// Disposes recycled files beyond the retained count once they hold nothing
    /// `oldest_active` could still read.
    pub fn cleanup(&self, oldest_active: TxId) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        while state.recycle.len() > self.retained_recycled {
            let Some(id) = state.recycle.pop_front() else {
                break;
            };
            let Ok(entry) = self.entry(id) else {
                continue;
            };
            if entry.file.lock().has_actively_used_bytes(oldest_active) {
                state.recycle.push_back(id);
                break;
            }
            self.files.write().remove(&id);
            entry.pager.dispose();
            removed += 1;
            debug!(file = id.0, "scratch.pool.dispose_file");
        }
        removed
    }

    /// Disposes every scratch pager.
    pub fn dispose(&self) {
        let files = std::mem::take(&mut *self.files.write());
        for entry in files.values() {
            entry.pager.dispose();
        }
    }

    /// Snapshot of pool statistics.
    pub fn stats(&self) -> ScratchPoolStats {
        let state = self.state.lock();
        let entries: Vec<_> = self.files.read().values().cloned().collect();
        let mut files: Vec<_> = entries
            .iter()
            .map(|entry| entry.file.lock().stats())
            .collect();
        files.sort_by_key(|stats| stats.id);
        ScratchPoolStats {
            current_file: state.current,
            recycle_queue: state.recycle.len(),
            files,
        }
    }
}
