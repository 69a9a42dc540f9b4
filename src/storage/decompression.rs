#![forbid(unsafe_code)]
//! Size-bucketed pool of temporary pages for materializing compressed pages.
//!
//! Buffers are carved from a rotating "compression pager". When the current
//! pager runs out of budget it is superseded by a fresh one; superseded pagers
//! are disposed by [`DecompressionBufferPool::cleanup`] once in-flight demand no
//! longer needs them. Pooled buffers whose pager was disposed are skipped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::primitives::pager::{PageSpanMut, Pager, PagerOptions};
use crate::storage::options::StorageOptions;
use crate::storage::txn::TxContext;
use crate::types::{PenumbraError, Result};

/// A pooled run of pages inside a compression pager.
#[derive(Clone)]
pub struct DecompressionBuffer {
    pager: Arc<Pager>,
    position: u64,
    size: usize,
    pool_index: usize,
}

impl DecompressionBuffer {
    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bucket the buffer belongs to.
    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    /// First page of the buffer inside its pager.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Identifier of the backing pager.
    pub fn pager_id(&self) -> u64 {
        self.pager.id()
    }

    fn pages(&self) -> u64 {
        (self.size / self.pager.page_size()) as u64
    }

    fn acquire(&self) -> Result<PageSpanMut> {
        self.pager.write(self.position, self.pages())
    }
}

impl fmt::Debug for DecompressionBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecompressionBuffer")
            .field("pager", &self.pager.id())
            .field("position", &self.position)
            .field("size", &self.size)
            .field("pool_index", &self.pool_index)
            .finish()
    }
}

type Bucket = Arc<Mutex<Vec<DecompressionBuffer>>>;

struct CompressionPagers {
    current: Arc<Pager>,
    last_used_page: u64,
    superseded: Vec<Arc<Pager>>,
}

/// Pool statistics.
#[derive(Clone, Debug, Default)]
pub struct DecompressionStats {
    /// Size buckets created so far.
    pub buckets: usize,
    /// Buffers waiting in bucket queues.
    pub pooled_buffers: usize,
    /// Bytes currently handed out through [`TempPageScope`]s.
    pub in_flight_bytes: u64,
    /// Superseded pagers not yet disposed.
    pub superseded_pagers: usize,
}

/// Pool of reusable temporary pages, bucketed by power-of-two size.
pub struct DecompressionBufferPool {
    page_size: usize,
    max_size: usize,
    pager_pages: u64,
    buckets: RwLock<Vec<Bucket>>,
    pagers: Mutex<CompressionPagers>,
    in_flight: AtomicU64,
    disposed: AtomicBool,
}

impl DecompressionBufferPool {
    /// Creates a pool sized by `options`.
    pub fn new(options: &StorageOptions) -> Result<Self> {
        let pager_pages = options.decompression_pager_pages;
        let current = Arc::new(Self::new_pager(options.page_size, pager_pages)?);
        Ok(Self {
            page_size: options.page_size as usize,
            max_size: options.max_compressed_page_size as usize,
            pager_pages,
            buckets: RwLock::new(Vec::new()),
            pagers: Mutex::new(CompressionPagers {
                current,
                last_used_page: 0,
                superseded: Vec::new(),
            }),
            in_flight: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    fn new_pager(page_size: u32, pages: u64) -> Result<Pager> {
        Pager::in_memory(PagerOptions::new(page_size).max_pages(pages))
    }

    /// Bucket index serving `size`, or the validation error for it.
    pub fn bucket_index(&self, size: usize) -> Result<usize> {
        if size < self.page_size || !size.is_power_of_two() {
            return Err(PenumbraError::InvalidSize {
                requested: size,
                page_size: self.page_size,
            });
        }
        if size > self.max_size {
            return Err(PenumbraError::SizeTooLarge {
                requested: size,
                max: self.max_size,
            });
        }
        Ok((size / self.page_size).trailing_zeros() as usize)
    }

    fn bucket(&self, index: usize) -> Bucket {
        if let Some(bucket) = self.buckets.read().get(index) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write();
        while buckets.len() <= index {
            buckets.push(Arc::new(Mutex::new(Vec::new())));
        }
        Arc::clone(&buckets[index])
    }

    /// Hands out a temporary page of `requested_size` bytes.
    ///
    /// The most recently released buffer of that size is reused first; buffers
    /// whose pager has been disposed are dropped silently.
    pub fn get_temporary_page(&self, tx: TxContext, requested_size: usize) -> Result<TempPageScope<'_>> {
        let index = self.bucket_index(requested_size)?;
        if self.disposed.load(AtomicOrdering::Acquire) {
            return Err(PenumbraError::Disposed);
        }
        let bucket = self.bucket(index);
        loop {
            let Some(buffer) = bucket.lock().pop() else {
                break;
            };
            match buffer.acquire() {
                Ok(span) => {
                    trace!(tx = tx.id.0, index, position = buffer.position, "decompression.reuse");
                    return Ok(self.scope(buffer, span));
                }
                Err(PenumbraError::Disposed) | Err(PenumbraError::Invalid(_)) => {
                    debug!(
                        tx = tx.id.0,
                        index,
                        pager = buffer.pager.id(),
                        "decompression.skip_disposed"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        let buffer = self.allocate(index, requested_size)?;
        let span = buffer.acquire()?;
        trace!(
            tx = tx.id.0,
            index,
            pager = buffer.pager.id(),
            position = buffer.position,
            "decompression.allocate"
        );
        Ok(self.scope(buffer, span))
    }

    fn scope(&self, buffer: DecompressionBuffer, span: PageSpanMut) -> TempPageScope<'_> {
        self.in_flight
            .fetch_add(buffer.size as u64, AtomicOrdering::AcqRel);
        TempPageScope {
            span,
            ticket: BufferTicket { pool: self, buffer },
        }
    }

    fn allocate(&self, index: usize, size: usize) -> Result<DecompressionBuffer> {
        let pages = (size / self.page_size) as u64;
        let mut pagers = self.pagers.lock();
        let exhausted = pagers.last_used_page + pages > self.pager_pages;
        if exhausted || pagers.current.is_disposed() {
            let fresh = Arc::new(Self::new_pager(self.page_size as u32, self.pager_pages)?);
            let old = std::mem::replace(&mut pagers.current, fresh);
            debug!(
                old = old.id(),
                new = pagers.current.id(),
                disposed = old.is_disposed(),
                "decompression.supersede"
            );
            if !old.is_disposed() {
                pagers.superseded.push(old);
            }
            pagers.last_used_page = 0;
        }
        let position = pagers.last_used_page;
        pagers.current.ensure_continuous(position, pages)?;
        pagers.last_used_page += pages;
        Ok(DecompressionBuffer {
            pager: Arc::clone(&pagers.current),
            position,
            size,
            pool_index: index,
        })
    }

    fn release(&self, buffer: &DecompressionBuffer) {
        self.in_flight
            .fetch_sub(buffer.size as u64, AtomicOrdering::AcqRel);
        if buffer.pager.is_disposed() || self.disposed.load(AtomicOrdering::Acquire) {
            return;
        }
        let bucket = self.bucket(buffer.pool_index);
        bucket.lock().push(buffer.clone());
    }

    /// Decodes a snappy-compressed page into a temporary page.
    pub fn decompress_page(
        &self,
        tx: TxContext,
        compressed: &[u8],
        uncompressed_size: usize,
    ) -> Result<TempPageScope<'_>> {
        let len = snap::raw::decompress_len(compressed)
            .map_err(|_| PenumbraError::Corruption("compressed page header invalid"))?;
        if len != uncompressed_size {
            return Err(PenumbraError::Corruption("compressed page length mismatch"));
        }
        let size = uncompressed_size.max(self.page_size).next_power_of_two();
        let mut scope = self.get_temporary_page(tx, size)?;
        let mut decoded = vec![0u8; len];
        snap::raw::Decoder::new()
            .decompress(compressed, &mut decoded)
            .map_err(|_| PenumbraError::Corruption("compressed page payload invalid"))?;
        scope.span_mut().write_at(0, &decoded)?;
        Ok(scope)
    }

    /// Disposes superseded pagers that in-flight buffers cannot need.
    ///
    /// Walks from the newest superseded pager backward, keeping pagers until
    /// their combined capacity with the current pager covers the bytes in flight.
    pub fn cleanup(&self) -> usize {
        let mut pagers = self.pagers.lock();
        let necessary = self.in_flight.load(AtomicOrdering::Acquire);
        let page_size = self.page_size as u64;
        let mut available = pagers.current.number_of_allocated_pages() * page_size;
        let mut disposed = 0;
        for pager in pagers.superseded.iter().rev() {
            if available >= necessary {
                pager.dispose();
                disposed += 1;
            } else {
                available += pager.number_of_allocated_pages() * page_size;
            }
        }
        pagers.superseded.retain(|pager| !pager.is_disposed());
        drop(pagers);
        if disposed > 0 {
            for bucket in self.buckets.read().iter() {
                bucket.lock().retain(|buffer| !buffer.pager.is_disposed());
            }
            debug!(disposed, in_flight = necessary, "decompression.cleanup");
        }
        disposed
    }

    /// Disposes the current and every superseded pager.
    pub fn dispose(&self) {
        if self.disposed.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let mut pagers = self.pagers.lock();
        pagers.current.dispose();
        for pager in pagers.superseded.drain(..) {
            pager.dispose();
        }
        for bucket in self.buckets.read().iter() {
            bucket.lock().clear();
        }
        debug!("decompression.dispose");
    }

    /// Snapshot of pool statistics.
    pub fn stats(&self) -> DecompressionStats {
        let buckets = self.buckets.read();
        DecompressionStats {
            buckets: buckets.len(),
            pooled_buffers: buckets.iter().map(|bucket| bucket.lock().len()).sum(),
            in_flight_bytes: self.in_flight.load(AtomicOrdering::Acquire),
            superseded_pagers: self.pagers.lock().superseded.len(),
        }
    }

    #[cfg(test)]
    fn current_pager(&self) -> Arc<Pager> {
        Arc::clone(&self.pagers.lock().current)
    }
}

/// Exclusive temporary page; returns its buffer to the pool on drop.
pub struct TempPageScope<'a> {
    // Dropped before `ticket` so the page guards are released before the
    // buffer becomes visible to other requests.
    span: PageSpanMut,
    ticket: BufferTicket<'a>,
}

struct BufferTicket<'a> {
    pool: &'a DecompressionBufferPool,
    buffer: DecompressionBuffer,
}

impl Drop for BufferTicket<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.buffer);
    }
}

impl TempPageScope<'_> {
    /// Buffer backing this scope.
    pub fn buffer(&self) -> &DecompressionBuffer {
        &self.ticket.buffer
    }

    /// Size of the temporary page in bytes.
    pub fn size(&self) -> usize {
        self.ticket.buffer.size
    }

    /// Read access to the page bytes.
    pub fn span(&self) -> &PageSpanMut {
        &self.span
    }

    /// Write access to the page bytes.
    pub fn span_mut(&mut self) -> &mut PageSpanMut {
        &mut self.span
    }

    /// Copies the page into an owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.span.to_vec()
    }
}

/// Compresses a page image with snappy, the format [`DecompressionBufferPool::decompress_page`] reads.
pub fn compress_page(page: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(page)
        .map_err(|_| PenumbraError::Invalid("page cannot be compressed"))
}
