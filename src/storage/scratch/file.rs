use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::primitives::pager::{PageSpan, PageSpanMut, Pager};
use crate::storage::txn::TxContext;
use crate::types::{PenumbraError, Result, ScratchFileId, TxId};

/// One allocation handed out by a scratch file.
///
/// `size` is the reserved run in pages (a power of two, or zero for the tail pages
/// of a broken-up allocation); `number_of_pages` is how many of them are in use.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PageFromScratchBuffer {
    /// File that owns the allocation.
    pub scratch_file_id: ScratchFileId,
    /// First page of the allocation inside the scratch file.
    pub position_in_scratch: u64,
    /// Reserved pages; zero marks a page that cannot be reused on its own.
    pub size: u64,
    /// Pages the caller asked for.
    pub number_of_pages: u64,
}

impl PageFromScratchBuffer {
    /// Reserved size in bytes.
    pub fn byte_size(&self, page_size: usize) -> u64 {
        self.size * page_size as u64
    }
}

#[derive(Clone, Copy, Debug)]
struct PendingFree {
    position: u64,
    valid_after: TxId,
}

/// Allocation statistics for a single scratch file.
#[derive(Clone, Debug, Default)]
pub struct ScratchFileStats {
    /// Scratch file identifier.
    pub id: ScratchFileId,
    /// Pages currently handed out.
    pub allocated_pages: u64,
    /// Live allocation entries.
    pub allocations: usize,
    /// Bump pointer; pages below it have been handed out at least once.
    pub last_used_page: u64,
    /// Regions waiting for readers older than their freeing transaction.
    pub pending_free: usize,
    /// Regions reusable right away.
    pub immediate_free: usize,
    /// Newest transaction that freed a region into the pending list.
    pub frees_available_after: TxId,
    /// Bytes held by the backing pager.
    pub size_in_bytes: u64,
}

/// Bump allocator over a pager with two size-bucketed free lists.
///
/// Regions freed on rollback go to the immediate list and are reused LIFO.
/// Regions freed by a committed transaction `X` go to the pending list and only
/// become reusable once the oldest active reader is newer than `X`.
pub struct ScratchBufferFile {
    id: ScratchFileId,
    pager: Arc<Pager>,
    last_used_page: u64,
    allocated_pages: u64,
    allocated: FxHashMap<u64, PageFromScratchBuffer>,
    free_immediately: FxHashMap<u64, Vec<u64>>,
    free_pending: FxHashMap<u64, Vec<PendingFree>>,
    frees_available_after: TxId,
}

impl ScratchBufferFile {
    /// Wraps `pager` as scratch file `id`.
    pub fn new(id: ScratchFileId, pager: Arc<Pager>) -> Self {
        Self {
            id,
            pager,
            last_used_page: 0,
            allocated_pages: 0,
            allocated: FxHashMap::default(),
            free_immediately: FxHashMap::default(),
            free_pending: FxHashMap::default(),
            frees_available_after: TxId::ZERO,
        }
    }

    /// Identifier of this scratch file.
    pub fn id(&self) -> ScratchFileId {
        self.id
    }

    /// Pager backing this file.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Bump pointer in pages.
    pub fn last_used_page(&self) -> u64 {
        self.last_used_page
    }

    /// Pages currently handed out.
    pub fn allocated_pages_count(&self) -> u64 {
        self.allocated_pages
    }

    /// Bytes the file would span after bump-allocating `size` more pages.
    pub fn size_after_allocation(&self, size: u64) -> u64 {
        (self.last_used_page + size) * self.pager.page_size() as u64
    }

    /// Bump-allocates `size` pages at the end of the file.
    pub fn allocate(
        &mut self,
        tx: TxContext,
        number_of_pages: u64,
        size: u64,
    ) -> Result<PageFromScratchBuffer> {
        if size == 0 || number_of_pages == 0 || number_of_pages > size {
            return Err(PenumbraError::Invalid("scratch allocation size mismatch"));
        }
        self.pager.ensure_continuous(self.last_used_page, size)?;
        let allocation = PageFromScratchBuffer {
            scratch_file_id: self.id,
            position_in_scratch: self.last_used_page,
            size,
            number_of_pages,
        };
        self.last_used_page += size;
        self.track(allocation);
        trace!(
            file = self.id.0,
            tx = tx.id.0,
            position = allocation.position_in_scratch,
            size,
            "scratch.allocate"
        );
        Ok(allocation)
    }

    /// Reuses a freed region of exactly `size` pages, if one is safe to hand out.
    pub fn try_get_from_freed_buffer(
        &mut self,
        tx: TxContext,
        number_of_pages: u64,
        size: u64,
    ) -> Option<PageFromScratchBuffer> {
        let position = self.pop_immediate(size).or_else(|| {
            let stack = self.free_pending.get_mut(&size)?;
            let candidate = stack.last()?;
            if candidate.valid_after >= tx.oldest_active_read {
                return None;
            }
            stack.pop().map(|pending| pending.position)
        })?;
        let allocation = PageFromScratchBuffer {
            scratch_file_id: self.id,
            position_in_scratch: position,
            size,
            number_of_pages,
        };
        self.track(allocation);
        trace!(
            file = self.id.0,
            tx = tx.id.0,
            position,
            size,
            "scratch.reuse"
        );
        Some(allocation)
    }

    fn pop_immediate(&mut self, size: u64) -> Option<u64> {
        self.free_immediately.get_mut(&size)?.pop()
    }

    fn track(&mut self, allocation: PageFromScratchBuffer) {
        self.allocated_pages += allocation.number_of_pages;
        self.allocated
            .insert(allocation.position_in_scratch, allocation);
    }

    /// Returns the region at `position` to a free list.
    ///
    /// `None` marks a rollback free that is reusable immediately; `Some(tx)` defers
    /// reuse until every reader older than `tx` has finished.
    pub fn free(&mut self, position: u64, tx: Option<TxId>) -> Result<()> {
        let Some(entry) = self.allocated.remove(&position) else {
            error!(file = self.id.0, position, "scratch.free.untracked");
            return Err(PenumbraError::InvariantViolation(format!(
                "scratch file {} freed untracked position {}",
                self.id, position
            )));
        };
        self.allocated_pages -= entry.number_of_pages;
        if entry.size == 0 {
            trace!(file = self.id.0, position, "scratch.free.marker");
            return Ok(());
        }
        match tx {
            None => {
                self.free_immediately
                    .entry(entry.size)
                    .or_default()
                    .push(position);
                trace!(file = self.id.0, position, size = entry.size, "scratch.free.immediate");
            }
            Some(tx) => {
                self.free_pending
                    .entry(entry.size)
                    .or_default()
                    .push(PendingFree {
                        position,
                        valid_after: tx,
                    });
                self.frees_available_after = self.frees_available_after.max(tx);
                trace!(
                    file = self.id.0,
                    position,
                    size = entry.size,
                    tx = tx.0,
                    "scratch.free.pending"
                );
            }
        }
        Ok(())
    }

    /// Splits a multi-page allocation into one entry per page so pages can be
    /// freed independently. The first page keeps the reusable size; the rest
    /// become zero-size markers.
    pub fn break_large_allocation_to_separate_pages(
        &mut self,
        allocation: &PageFromScratchBuffer,
    ) -> Result<()> {
        let position = allocation.position_in_scratch;
        let Some(existing) = self.allocated.remove(&position) else {
            error!(file = self.id.0, position, "scratch.break_up.untracked");
            return Err(PenumbraError::InvariantViolation(format!(
                "scratch file {} cannot break up untracked position {}",
                self.id, position
            )));
        };
        self.allocated_pages -= existing.number_of_pages;
        self.track(PageFromScratchBuffer {
            number_of_pages: 1,
            ..existing
        });
        for offset in 1..existing.number_of_pages {
            self.track(PageFromScratchBuffer {
                scratch_file_id: self.id,
                position_in_scratch: position + offset,
                size: 0,
                number_of_pages: 1,
            });
        }
        debug!(
            file = self.id.0,
            position,
            pages = existing.number_of_pages,
            "scratch.break_up"
        );
        Ok(())
    }

    /// Returns `true` while the file cannot be recycled: pages are still handed
    /// out, or a pending free may still be visible to `oldest_active`.
    pub fn has_actively_used_bytes(&self, oldest_active: TxId) -> bool {
        self.allocated_pages > 0 || self.frees_available_after >= oldest_active
    }

    /// Forgets every free list and rewinds the bump pointer.
    pub fn reset(&mut self) -> Result<()> {
        if !self.allocated.is_empty() {
            return Err(PenumbraError::InvariantViolation(format!(
                "scratch file {} reset with {} live allocations",
                self.id,
                self.allocated.len()
            )));
        }
        self.free_immediately.clear();
        self.free_pending.clear();
        self.last_used_page = 0;
        self.frees_available_after = TxId::ZERO;
        debug!(file = self.id.0, "scratch.reset");
        Ok(())
    }

    /// Returns the allocation recorded at `position`.
    pub fn allocation(&self, position: u64) -> Option<&PageFromScratchBuffer> {
        self.allocated.get(&position)
    }

    /// Shared view over the allocation at `position`.
    pub fn read_page(&self, position: u64) -> Result<PageSpan> {
        let entry = self.tracked(position)?;
        self.pager.read(position, entry.number_of_pages)
    }

    /// Writable view over the allocation at `position`.
    pub fn page_mut(&self, position: u64) -> Result<PageSpanMut> {
        let entry = self.tracked(position)?;
        self.pager.write(position, entry.number_of_pages)
    }

    fn tracked(&self, position: u64) -> Result<&PageFromScratchBuffer> {
        self.allocated
            .get(&position)
            .ok_or(PenumbraError::Invalid("scratch position not allocated"))
    }

    /// Free regions per reserved size, counting both lists.
    pub fn free_pages_by_size(&self) -> BTreeMap<u64, usize> {
        let mut out = BTreeMap::new();
        for (&size, stack) in &self.free_immediately {
            *out.entry(size).or_insert(0) += stack.len();
        }
        for (&size, stack) in &self.free_pending {
            *out.entry(size).or_insert(0) += stack.len();
        }
        out.retain(|_, count| *count > 0);
        out
    }

    /// Snapshot of allocation statistics.
    pub fn stats(&self) -> ScratchFileStats {
        ScratchFileStats {
            id: self.id,
            allocated_pages: self.allocated_pages,
            allocations: self.allocated.len(),
            last_used_page: self.last_used_page,
            pending_free: self.free_pending.values().map(Vec::len).sum(),
            immediate_free: self.free_immediately.values().map(Vec::len).sum(),
            frees_available_after: self.frees_available_after,
            size_in_bytes: self.pager.number_of_allocated_pages() * self.pager.page_size() as u64,
        }
    }
}
