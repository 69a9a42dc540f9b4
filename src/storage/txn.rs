#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::types::{PenumbraError, Result, TxId};

/// Transaction identity handed to the storage components.
///
/// `oldest_active_read` is the gate for reusing scratch space freed by committed
/// transactions: a region freed at `X` may be reused only when it exceeds `X`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxContext {
    /// Id of the transaction performing the operation.
    pub id: TxId,
    /// Smallest snapshot id any live reader may still observe.
    pub oldest_active_read: TxId,
}

impl TxContext {
    /// Builds a context with an explicit reuse gate.
    pub const fn new(id: TxId, oldest_active_read: TxId) -> Self {
        Self {
            id,
            oldest_active_read,
        }
    }

    /// Builds a context for a transaction with no concurrent readers.
    pub const fn solo(id: TxId) -> Self {
        Self {
            id,
            oldest_active_read: id,
        }
    }
}

/// Unique identifier assigned to active readers for diagnostics.
pub type ReaderId = u32;

#[derive(Clone, Debug)]
struct ActiveReader {
    snapshot: TxId,
    begin_instant: Instant,
    thread_id: ThreadId,
}

#[derive(Debug, Default)]
struct ReaderTable {
    readers: FxHashMap<ReaderId, ActiveReader>,
    floor: BTreeMap<TxId, u32>,
    next_reader_id: ReaderId,
}

impl ReaderTable {
    fn register(&mut self, snapshot: TxId) -> Result<ReaderId> {
        let id = self.next_reader_id.wrapping_add(1).max(1);
        if self.readers.contains_key(&id) {
            return Err(PenumbraError::Invalid("reader id overflow"));
        }
        self.next_reader_id = id;
        let counter = self.floor.entry(snapshot).or_insert(0);
        if *counter == u32::MAX {
            return Err(PenumbraError::Invalid("reader floor overflow"));
        }
        *counter += 1;
        self.readers.insert(
            id,
            ActiveReader {
                snapshot,
                begin_instant: Instant::now(),
                thread_id: std::thread::current().id(),
            },
        );
        Ok(id)
    }

    fn release(&mut self, id: ReaderId) {
        let Some(reader) = self.readers.remove(&id) else {
            return;
        };
        if let Some(counter) = self.floor.get_mut(&reader.snapshot) {
            if *counter > 1 {
                *counter -= 1;
            } else {
                self.floor.remove(&reader.snapshot);
            }
        }
    }

    fn oldest(&self) -> Option<TxId> {
        self.floor.keys().next().copied()
    }
}

/// Summary of reader activity captured from the [`TransactionTracker`].
#[derive(Clone, Debug, Default)]
pub struct ReaderSnapshot {
    /// Total active readers currently registered.
    pub active: u64,
    /// Oldest snapshot held by any reader.
    pub oldest_snapshot: Option<TxId>,
    /// Newest snapshot held by any reader.
    pub newest_snapshot: Option<TxId>,
    /// Maximum observed reader age in milliseconds.
    pub max_age_ms: u64,
    /// Thread that has been reading the longest, when any reader is active.
    pub slowest_thread: Option<ThreadId>,
}

/// Hands out write transaction ids and tracks the snapshots pinned by readers.
///
/// Only one write transaction may be open at a time. Readers pin the last
/// committed id when they begin and keep it until their handle is dropped.
pub struct TransactionTracker {
    last_committed: AtomicU64,
    next_write: AtomicU64,
    writer_active: AtomicBool,
    readers: Mutex<ReaderTable>,
}

impl fmt::Debug for TransactionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTracker")
            .field("last_committed", &self.last_committed())
            .field("writer_active", &self.writer_active.load(AtomicOrdering::Acquire))
            .finish()
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new(TxId::ZERO)
    }
}

impl TransactionTracker {
    /// Creates a tracker whose first write transaction follows `last_committed`.
    pub fn new(last_committed: TxId) -> Self {
        Self {
            last_committed: AtomicU64::new(last_committed.0),
            next_write: AtomicU64::new(last_committed.0 + 1),
            writer_active: AtomicBool::new(false),
            readers: Mutex::new(ReaderTable::default()),
        }
    }

    /// Returns the newest id visible to new readers.
    pub fn last_committed(&self) -> TxId {
        TxId(self.last_committed.load(AtomicOrdering::Acquire))
    }

    /// Returns the minimum of `current` and every active reader's snapshot.
    pub fn oldest_active_read(&self, current: TxId) -> TxId {
        match self.readers.lock().oldest() {
            Some(oldest) => oldest.min(current),
            None => current,
        }
    }

    /// Builds the reuse context for a transaction with id `id`.
    pub fn context(&self, id: TxId) -> TxContext {
        TxContext::new(id, self.oldest_active_read(id))
    }

    /// Opens a read transaction pinned at the last committed id.
    pub fn begin_read(self: &Arc<Self>) -> Result<ReadTransaction> {
        let mut readers = self.readers.lock();
        // Sampled under the reader lock; publish() takes the same lock.
        let snapshot = self.last_committed();
        let reader = readers.register(snapshot)?;
        drop(readers);
        trace!(reader, snapshot = snapshot.0, "txn.begin_read");
        Ok(ReadTransaction {
            tracker: Arc::clone(self),
            reader,
            snapshot,
        })
    }

    /// Opens the single write transaction.
    pub fn begin_write(self: &Arc<Self>) -> Result<WriteTransaction> {
        if self
            .writer_active
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return Err(PenumbraError::Invalid("write transaction already active"));
        }
        let id = TxId(self.next_write.fetch_add(1, AtomicOrdering::AcqRel));
        debug!(tx = id.0, "txn.begin_write");
        Ok(WriteTransaction {
            tracker: Arc::clone(self),
            id,
            finished: false,
        })
    }

    fn publish(&self, id: TxId) {
        let _readers = self.readers.lock();
        self.last_committed.store(id.0, AtomicOrdering::Release);
    }

    fn release_writer(&self) {
        self.writer_active.store(false, AtomicOrdering::Release);
    }

    /// Returns a snapshot describing currently active readers.
    pub fn reader_snapshot(&self) -> ReaderSnapshot {
        let now = Instant::now();
        let readers = self.readers.lock();
        let mut snapshot = ReaderSnapshot::default();
        let mut slowest: Option<(u64, ThreadId)> = None;
        for info in readers.readers.values() {
            snapshot.active = snapshot.active.saturating_add(1);
            snapshot.oldest_snapshot = Some(
                snapshot
                    .oldest_snapshot
                    .map_or(info.snapshot, |current| current.min(info.snapshot)),
            );
            snapshot.newest_snapshot = Some(
                snapshot
                    .newest_snapshot
                    .map_or(info.snapshot, |current| current.max(info.snapshot)),
            );
            let age_ms = now
                .saturating_duration_since(info.begin_instant)
                .as_millis()
                .min(u64::MAX as u128) as u64;
            snapshot.max_age_ms = snapshot.max_age_ms.max(age_ms);
            if slowest.map_or(true, |(age, _)| age_ms >= age) {
                slowest = Some((age_ms, info.thread_id));
            }
        }
        snapshot.slowest_thread = slowest.map(|(_, thread)| thread);
        snapshot
    }
}

/// Read transaction pinned to an immutable snapshot; unregisters on drop.
pub struct ReadTransaction {
    tracker: Arc<TransactionTracker>,
    reader: ReaderId,
    snapshot: TxId,
}

impl ReadTransaction {
    /// Snapshot id this reader observes.
    pub fn id(&self) -> TxId {
        self.snapshot
    }

    /// Context for lookups and temporary page requests.
    pub fn context(&self) -> TxContext {
        self.tracker.context(self.snapshot)
    }
}

impl fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("reader", &self.reader)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.tracker.readers.lock().release(self.reader);
        trace!(reader = self.reader, "txn.end_read");
    }
}

/// The single in-flight write transaction. Dropping it without
/// [`WriteTransaction::commit`] rolls it back.
pub struct WriteTransaction {
    tracker: Arc<TransactionTracker>,
    id: TxId,
    finished: bool,
}

impl WriteTransaction {
    /// Id assigned to this transaction.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Context for scratch allocation, gated by the oldest active reader.
    pub fn context(&self) -> TxContext {
        self.tracker.context(self.id)
    }

    /// Publishes this transaction's id to new readers and ends it.
    pub fn commit(mut self) -> TxId {
        self.tracker.publish(self.id);
        self.finished = true;
        self.tracker.release_writer();
        debug!(tx = self.id.0, "txn.commit");
        self.id
    }
}

impl fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.release_writer();
            debug!(tx = self.id.0, "txn.rollback");
        }
    }
}
