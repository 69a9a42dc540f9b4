use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use smallvec::SmallVec;
use tracing::debug;

use super::frame::Frame;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{page, PenumbraError, Result};

static NEXT_PAGER_ID: AtomicU64 = AtomicU64::new(1);

type ReadFrameGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type WriteFrameGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Configuration options for a pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes (e.g., 4096).
    pub page_size: u32,
    /// Pages allocated eagerly when the pager is created.
    pub initial_pages: u64,
    /// Upper bound on allocated pages; growth past it fails with `ScratchFull`.
    pub max_pages: Option<u64>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            initial_pages: 0,
            max_pages: None,
        }
    }
}

impl PagerOptions {
    /// Creates options for the given page size with no eager allocation.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    /// Sets the number of pages allocated up front.
    pub fn initial_pages(mut self, pages: u64) -> Self {
        self.initial_pages = pages;
        self
    }

    /// Caps the number of pages the pager may hold.
    pub fn max_pages(mut self, pages: u64) -> Self {
        self.max_pages = Some(pages);
        self
    }
}

/// Point-in-time view of a pager's allocation state.
#[derive(Clone, Debug, Default)]
pub struct PagerStats {
    /// Process-unique pager identifier.
    pub id: u64,
    /// Page size in bytes.
    pub page_size: usize,
    /// Pages currently allocated.
    pub allocated_pages: u64,
    /// Number of times the frame table has been regrown.
    pub generation: u64,
    /// Whether the pager has been disposed.
    pub disposed: bool,
    /// Whether pages are mirrored to a file.
    pub file_backed: bool,
}

/// Growable page store handing out guarded, bounds-checked page spans.
///
/// Frames are individually locked, so a write span over scratch pages does not
/// block readers of other pages. Growth bumps [`Pager::generation`]; spans
/// acquired before a growth stay valid because frames are reference counted.
pub struct Pager {
    id: u64,
    page_size: usize,
    max_pages: Option<u64>,
    frames: RwLock<Vec<Frame>>,
    allocated: AtomicU64,
    generation: AtomicU64,
    disposed: AtomicBool,
    backing: Option<Arc<dyn FileIo>>,
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pager")
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .field("allocated", &self.number_of_allocated_pages())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Pager {
    /// Creates a pager whose pages live only in memory.
    pub fn in_memory(options: PagerOptions) -> Result<Self> {
        Self::build(options, None)
    }

    /// Creates a pager mirrored to a freshly truncated file at `path`.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        io.truncate(0)?;
        Self::with_backing(Arc::new(io), options)
    }

    /// Creates a pager mirrored to an arbitrary [`FileIo`] implementation.
    pub fn with_backing(io: Arc<dyn FileIo>, options: PagerOptions) -> Result<Self> {
        Self::build(options, Some(io))
    }

    fn build(options: PagerOptions, backing: Option<Arc<dyn FileIo>>) -> Result<Self> {
        page::validate_page_size(options.page_size)?;
        if let Some(max) = options.max_pages {
            if options.initial_pages > max {
                return Err(PenumbraError::Invalid("initial pages exceed pager budget"));
            }
        }
        let pager = Self {
            id: NEXT_PAGER_ID.fetch_add(1, AtomicOrdering::Relaxed),
            page_size: options.page_size as usize,
            max_pages: options.max_pages,
            frames: RwLock::new(Vec::new()),
            allocated: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            backing,
        };
        if options.initial_pages > 0 {
            pager.grow_to(options.initial_pages)?;
        }
        Ok(pager)
    }

    /// Returns the process-unique identifier of this pager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the configured page budget, if any.
    pub fn max_pages(&self) -> Option<u64> {
        self.max_pages
    }

    /// Returns the number of pages currently allocated.
    pub fn number_of_allocated_pages(&self) -> u64 {
        self.allocated.load(AtomicOrdering::Acquire)
    }

    /// Returns the growth generation; it changes whenever the frame table is regrown.
    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Acquire)
    }

    /// Returns `true` once [`Pager::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(AtomicOrdering::Acquire)
    }

    /// Returns `true` when pages are mirrored to a file.
    pub fn is_file_backed(&self) -> bool {
        self.backing.is_some()
    }

    /// Ensures pages `[start, start + count)` are allocated, growing if needed.
    ///
    /// Returns `true` when the frame table had to grow.
    pub fn ensure_continuous(&self, start: u64, count: u64) -> Result<bool> {
        if self.is_disposed() {
            return Err(PenumbraError::Disposed);
        }
        let end = start
            .checked_add(count)
            .ok_or(PenumbraError::Invalid("page range overflow"))?;
        if end <= self.number_of_allocated_pages() {
            return Ok(false);
        }
        self.grow_to(end)?;
        Ok(true)
    }

    fn grow_to(&self, target: u64) -> Result<()> {
        if let Some(max) = self.max_pages {
            if target > max {
                return Err(PenumbraError::ScratchFull {
                    requested: target,
                    limit: max,
                });
            }
        }
        let mut frames = self.frames.write();
        if self.is_disposed() {
            return Err(PenumbraError::Disposed);
        }
        let current = frames.len() as u64;
        if target <= current {
            return Ok(());
        }
        let mut new_len = target.max(current.saturating_mul(2));
        if let Some(max) = self.max_pages {
            new_len = new_len.min(max);
        }
        if let Some(io) = &self.backing {
            io.truncate(new_len * self.page_size as u64)?;
        }
        frames.extend((current..new_len).map(|_| Frame::new(self.page_size)));
        self.allocated.store(new_len, AtomicOrdering::Release);
        self.generation.fetch_add(1, AtomicOrdering::AcqRel);
        debug!(
            pager = self.id,
            from_pages = current,
            to_pages = new_len,
            "pager.grow"
        );
        Ok(())
    }

    fn frames_for(&self, start: u64, count: u64) -> Result<SmallVec<[Frame; 4]>> {
        if count == 0 {
            return Err(PenumbraError::Invalid("empty page range"));
        }
        let frames = self.frames.read();
        if self.is_disposed() {
            return Err(PenumbraError::Disposed);
        }
        let end = start
            .checked_add(count)
            .ok_or(PenumbraError::Invalid("page range overflow"))?;
        if end > frames.len() as u64 {
            return Err(PenumbraError::Invalid("page range beyond allocated pages"));
        }
        Ok(frames[start as usize..end as usize]
            .iter()
            .cloned()
            .collect())
    }

    /// Acquires a shared view of pages `[start, start + count)`.
    pub fn read(&self, start: u64, count: u64) -> Result<PageSpan> {
        let frames = self.frames_for(start, count)?;
        let guards = frames.iter().map(|frame| frame.buf.read_arc()).collect();
        Ok(PageSpan {
            start,
            page_size: self.page_size,
            guards,
        })
    }

    /// Acquires an exclusive view of pages `[start, start + count)`.
    ///
    /// The caller must not hold a [`PageSpan`] over the same pages on this thread.
    pub fn write(&self, start: u64, count: u64) -> Result<PageSpanMut> {
        let frames = self.frames_for(start, count)?;
        let guards = frames.iter().map(|frame| frame.buf.write_arc()).collect();
        Ok(PageSpanMut {
            start,
            page_size: self.page_size,
            guards,
        })
    }

    /// Writes pages `[start, start + count)` to the backing file, if any.
    pub fn flush(&self, start: u64, count: u64) -> Result<()> {
        let Some(io) = &self.backing else {
            return Ok(());
        };
        let span = self.read(start, count)?;
        for idx in 0..span.page_count() {
            let offset = (start + idx as u64) * self.page_size as u64;
            io.write_at(offset, span.guards[idx].as_ref())?;
        }
        Ok(())
    }

    /// Synchronizes the backing file to disk.
    pub fn sync(&self) -> Result<()> {
        match &self.backing {
            Some(io) => io.sync_all(),
            None => Ok(()),
        }
    }

    /// Releases every frame. Later accesses fail with [`PenumbraError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let mut frames = self.frames.write();
        let released = frames.len();
        frames.clear();
        self.allocated.store(0, AtomicOrdering::Release);
        debug!(pager = self.id, released_pages = released, "pager.dispose");
    }

    /// Returns a snapshot of pager statistics.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            id: self.id,
            page_size: self.page_size,
            allocated_pages: self.number_of_allocated_pages(),
            generation: self.generation(),
            disposed: self.is_disposed(),
            file_backed: self.is_file_backed(),
        }
    }
}

fn check_range(offset: usize, len: usize, total: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(PenumbraError::Invalid("access outside page span")),
    }
}

/// Walks `[offset, offset + len)` page by page, yielding
/// `(page_index, offset_in_page, offset_in_buffer, chunk_len)`.
fn chunks(
    offset: usize,
    len: usize,
    page_size: usize,
) -> impl Iterator<Item = (usize, usize, usize, usize)> {
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let abs = offset + done;
        let page_idx = abs / page_size;
        let in_page = abs % page_size;
        let chunk = (page_size - in_page).min(len - done);
        let item = (page_idx, in_page, done, chunk);
        done += chunk;
        Some(item)
    })
}

/// Shared, read-only view over a contiguous run of pages.
pub struct PageSpan {
    start: u64,
    page_size: usize,
    guards: SmallVec<[ReadFrameGuard; 4]>,
}

impl PageSpan {
    /// First page number covered by the span.
    pub fn start_page(&self) -> u64 {
        self.start
    }

    /// Number of pages covered.
    pub fn page_count(&self) -> usize {
        self.guards.len()
    }

    /// Total bytes covered.
    pub fn len(&self) -> usize {
        self.guards.len() * self.page_size
    }

    /// Returns `true` when the span covers no pages.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Returns the bytes of page `idx` within the span.
    pub fn page(&self, idx: usize) -> Option<&[u8]> {
        self.guards.get(idx).map(|guard| &guard[..])
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(offset, dst.len(), self.len())?;
        for (page_idx, in_page, at, len) in chunks(offset, dst.len(), self.page_size) {
            dst[at..at + len].copy_from_slice(&self.guards[page_idx][in_page..in_page + len]);
        }
        Ok(())
    }

    /// Copies the whole span into an owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for guard in &self.guards {
            out.extend_from_slice(guard);
        }
        out
    }
}

/// Exclusive, writable view over a contiguous run of pages.
pub struct PageSpanMut {
    start: u64,
    page_size: usize,
    guards: SmallVec<[WriteFrameGuard; 4]>,
}

impl PageSpanMut {
    /// First page number covered by the span.
    pub fn start_page(&self) -> u64 {
        self.start
    }

    /// Number of pages covered.
    pub fn page_count(&self) -> usize {
        self.guards.len()
    }

    /// Total bytes covered.
    pub fn len(&self) -> usize {
        self.guards.len() * self.page_size
    }

    /// Returns `true` when the span covers no pages.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Returns the bytes of page `idx` within the span.
    pub fn page(&self, idx: usize) -> Option<&[u8]> {
        self.guards.get(idx).map(|guard| &guard[..])
    }

    /// Returns the mutable bytes of page `idx` within the span.
    pub fn page_mut(&mut self, idx: usize) -> Option<&mut [u8]> {
        self.guards.get_mut(idx).map(|guard| &mut guard[..])
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(offset, dst.len(), self.len())?;
        for (page_idx, in_page, at, len) in chunks(offset, dst.len(), self.page_size) {
            dst[at..at + len].copy_from_slice(&self.guards[page_idx][in_page..in_page + len]);
        }
        Ok(())
    }

    /// Copies `src` into the span starting at `offset`.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        check_range(offset, src.len(), self.len())?;
        for (page_idx, in_page, at, len) in chunks(offset, src.len(), self.page_size) {
            self.guards[page_idx][in_page..in_page + len].copy_from_slice(&src[at..at + len]);
        }
        Ok(())
    }

    /// Replaces the whole span with `src`, which must match the span length.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.len() {
            return Err(PenumbraError::Invalid("source length differs from span"));
        }
        self.write_at(0, src)
    }

    /// Sets every byte in the span to `value`.
    pub fn fill(&mut self, value: u8) {
        for guard in &mut self.guards {
            guard.fill(value);
        }
    }

    /// Copies the whole span into an owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for guard in &self.guards {
            out.extend_from_slice(guard);
        }
        out
    }
}
