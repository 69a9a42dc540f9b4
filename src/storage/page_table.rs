#![forbid(unsafe_code)]
//! MVCC index from logical page number to the scratch locations of its versions.
//!
//! The single writer appends a version per modified page at commit; readers scan
//! a page's versions backward without taking locks on the version array itself.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::storage::scratch::PageFromScratchBuffer;
use crate::storage::txn::TxContext;
use crate::types::{PageId, PenumbraError, Result, ScratchFileId, TxId};

const INITIAL_VERSION_CAPACITY: usize = 4;

/// Physical home of a page version inside the scratch pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ScratchLocation {
    /// Scratch file holding the page.
    pub file: ScratchFileId,
    /// Page offset inside that file.
    pub position: u64,
    /// Pages the version spans.
    pub pages: u64,
}

/// One committed version of a logical page.
///
/// A position without a location is a freed marker: the page was deleted by
/// `transaction_id`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PagePosition {
    /// Where the version lives; `None` for a freed marker.
    pub location: Option<ScratchLocation>,
    /// Transaction that committed this version.
    pub transaction_id: TxId,
}

impl PagePosition {
    /// Version stored at `location`, committed by `tx`.
    pub fn new(location: ScratchLocation, tx: TxId) -> Self {
        Self {
            location: Some(location),
            transaction_id: tx,
        }
    }

    /// Version held by a scratch allocation, committed by `tx`.
    pub fn from_allocation(allocation: &PageFromScratchBuffer, tx: TxId) -> Self {
        Self::new(
            ScratchLocation {
                file: allocation.scratch_file_id,
                position: allocation.position_in_scratch,
                pages: allocation.number_of_pages.max(1),
            },
            tx,
        )
    }

    /// Deletion of the page by `tx`.
    pub fn freed(tx: TxId) -> Self {
        Self {
            location: None,
            transaction_id: tx,
        }
    }

    /// Returns `true` for a deletion marker.
    pub fn is_freed_marker(&self) -> bool {
        self.location.is_none()
    }
}

/// Outcome of a snapshot lookup in the version table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionLookup {
    /// A version is visible at the snapshot.
    Visible(PagePosition),
    /// A freed marker at or before the snapshot hides the page.
    Deleted,
    /// The table holds no version at or before the snapshot.
    Untracked,
}

impl VersionLookup {
    /// The visible version, if any.
    pub fn position(self) -> Option<PagePosition> {
        match self {
            VersionLookup::Visible(position) => Some(position),
            VersionLookup::Deleted | VersionLookup::Untracked => None,
        }
    }
}

/// Append-only version history. Slots are written once; `end` is published
/// with release ordering after the slot is filled.
struct VersionArray {
    slots: Box<[OnceLock<PagePosition>]>,
    start: AtomicUsize,
    end: AtomicUsize,
}

impl VersionArray {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| OnceLock::new()).collect(),
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }

    fn live(&self) -> impl DoubleEndedIterator<Item = &PagePosition> {
        let end = self.end.load(AtomicOrdering::Acquire);
        let start = self.start.load(AtomicOrdering::Acquire).min(end);
        self.slots[start..end].iter().filter_map(OnceLock::get)
    }

    fn newest(&self) -> Option<&PagePosition> {
        self.live().next_back()
    }

    /// Appends in place; returns `false` when the array is full.
    fn push(&self, position: PagePosition) -> bool {
        let end = self.end.load(AtomicOrdering::Relaxed);
        if end >= self.slots.len() || self.slots[end].set(position).is_err() {
            return false;
        }
        self.end.store(end + 1, AtomicOrdering::Release);
        true
    }

    /// Copies the live window into a larger array and appends `position`.
    fn grown(&self, position: PagePosition) -> Self {
        let live: Vec<PagePosition> = self.live().copied().collect();
        let grown = Self::with_capacity((live.len() * 2).max(INITIAL_VERSION_CAPACITY));
        for entry in live.into_iter().chain(std::iter::once(position)) {
            grown.push(entry);
        }
        grown
    }
}

/// Page set committed by one transaction.
pub type TransactionPages = Arc<FxHashMap<PageId, PagePosition>>;

/// Version table shared by the writer and all readers.
pub struct PageVersionTable {
    values: DashMap<PageId, Arc<VersionArray>>,
    transactions: RwLock<BTreeMap<TxId, TransactionPages>>,
    last_seen: AtomicU64,
}

impl Default for PageVersionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageVersionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            transactions: RwLock::new(BTreeMap::new()),
            last_seen: AtomicU64::new(0),
        }
    }

    /// Records the page set committed by `tx`.
    ///
    /// `tx.id` must exceed every previously recorded id and every position must
    /// carry it as its `transaction_id`.
    pub fn set_items(&self, tx: TxContext, items: &FxHashMap<PageId, PagePosition>) -> Result<()> {
        let last = self.last_seen_transaction_id();
        if tx.id <= last {
            error!(tx = tx.id.0, last = last.0, "page_table.set_items.non_monotonic");
            return Err(PenumbraError::InvariantViolation(format!(
                "transaction {} recorded after {}",
                tx.id, last
            )));
        }
        if let Some((page, position)) = items
            .iter()
            .find(|(_, position)| position.transaction_id != tx.id)
        {
            error!(tx = tx.id.0, page = page.0, "page_table.set_items.foreign_version");
            return Err(PenumbraError::InvariantViolation(format!(
                "page {} version tagged with transaction {} inside transaction {}",
                page, position.transaction_id, tx.id
            )));
        }
        for (&page, &position) in items {
            self.append(page, position);
        }
        self.transactions
            .write()
            .insert(tx.id, Arc::new(items.clone()));
        self.last_seen.store(tx.id.0, AtomicOrdering::Release);
        debug!(tx = tx.id.0, pages = items.len(), "page_table.set_items");
        Ok(())
    }

    fn append(&self, page: PageId, position: PagePosition) {
        let current = self.values.get(&page).map(|entry| Arc::clone(entry.value()));
        match current {
            Some(array) if array.push(position) => {}
            Some(array) => {
                let grown = Arc::new(array.grown(position));
                self.values.insert(page, grown);
                trace!(page = page.0, "page_table.grow");
            }
            None => {
                let array = VersionArray::with_capacity(INITIAL_VERSION_CAPACITY);
                array.push(position);
                self.values.insert(page, Arc::new(array));
            }
        }
    }

    /// Returns the newest version of `page` visible to `tx`.
    ///
    /// A freed marker at or before the horizon hides every older version.
    pub fn try_get_value(&self, tx: TxContext, page: PageId) -> Option<PagePosition> {
        self.lookup(tx, page).position()
    }

    /// Like [`PageVersionTable::try_get_value`], but tells a deleted page apart
    /// from one the table holds no version of.
    pub fn lookup(&self, tx: TxContext, page: PageId) -> VersionLookup {
        let Some(array) = self.values.get(&page).map(|entry| Arc::clone(entry.value())) else {
            return VersionLookup::Untracked;
        };
        for position in array.live().rev() {
            if position.transaction_id > tx.id {
                continue;
            }
            if position.is_freed_marker() {
                return VersionLookup::Deleted;
            }
            return VersionLookup::Visible(*position);
        }
        VersionLookup::Untracked
    }

    /// Newest version of every page whose history ends at or before `boundary`;
    /// these are the pages the next collection at `boundary` drops.
    pub fn settled_pages(&self, boundary: TxId) -> Vec<(PageId, PagePosition)> {
        self.values
            .iter()
            .filter_map(|entry| {
                let newest = *entry.value().newest()?;
                (newest.transaction_id <= boundary).then_some((*entry.key(), newest))
            })
            .collect()
    }

    /// Drops every page whose newest version is at or before `last_synced` and
    /// moves its versions into `unused_pages`. Transaction log entries at or
    /// before the boundary are discarded.
    ///
    /// `last_synced` must already be durable.
    pub fn remove_keys_where_all_pages_older_than(
        &self,
        last_synced: TxId,
        unused_pages: &mut Vec<PagePosition>,
    ) {
        let candidates: Vec<PageId> = self
            .values
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .newest()
                    .map_or(true, |newest| newest.transaction_id <= last_synced)
            })
            .map(|entry| *entry.key())
            .collect();
        let before = unused_pages.len();
        for page in candidates {
            let removed = self.values.remove_if(&page, |_, array| {
                array
                    .newest()
                    .map_or(true, |newest| newest.transaction_id <= last_synced)
            });
            if let Some((_, array)) = removed {
                array.start.store(
                    array.end.load(AtomicOrdering::Acquire),
                    AtomicOrdering::Release,
                );
                unused_pages.extend(
                    array
                        .slots
                        .iter()
                        .filter_map(OnceLock::get)
                        .filter(|position| position.transaction_id <= last_synced)
                        .copied(),
                );
            }
        }
        let mut log = self.transactions.write();
        let retained = log.split_off(&last_synced.next());
        *log = retained;
        debug!(
            boundary = last_synced.0,
            unused = unused_pages.len() - before,
            "page_table.gc"
        );
    }

    /// Page sets of every recorded transaction in `[min_inclusive, max_inclusive]`.
    pub fn get_modified_pages_for_transaction_range(
        &self,
        min_inclusive: TxId,
        max_inclusive: TxId,
    ) -> Vec<(TxId, TransactionPages)> {
        if min_inclusive > max_inclusive {
            return Vec::new();
        }
        self.transactions
            .read()
            .range(min_inclusive..=max_inclusive)
            .map(|(&tx, pages)| (tx, Arc::clone(pages)))
            .collect()
    }

    /// Newest transaction id among the versions still tracked.
    pub fn max_transaction_id(&self) -> TxId {
        self.values
            .iter()
            .filter_map(|entry| entry.value().newest().map(|p| p.transaction_id))
            .max()
            .unwrap_or(TxId::ZERO)
    }

    /// High-water mark of ids passed to [`PageVersionTable::set_items`].
    pub fn last_seen_transaction_id(&self) -> TxId {
        TxId(self.last_seen.load(AtomicOrdering::Acquire))
    }

    /// Returns `true` when no page has a tracked version.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of logical pages with tracked versions.
    pub fn count(&self) -> usize {
        self.values.len()
    }
}
