//! Storage Environment Tests
//!
//! Drives the full environment the way an engine would:
//! - the tracker reports the oldest live reader and enforces one writer
//! - journal flushes reclaim versions only once readers move past them
//! - reclaimed scratch pages are reused only after older readers finish
//! - collected pages stay readable from their journaled image
//! - metrics observe allocations, frees and lookups

#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use penumbra::storage::{
    CounterMetrics, PagePosition, StorageEnv, StorageMetrics, StorageOptions, TransactionTracker,
    WriteTransaction,
};
use penumbra::types::{PageId, PenumbraError, TxId};
use rustc_hash::FxHashMap;

const PAGE: usize = 512;

fn open() -> StorageEnv {
    StorageEnv::open(
        StorageOptions::default()
            .page_size(PAGE as u32)
            .max_compressed_page_size(4096)
            .decompression_pager_pages(64)
            .max_scratch_file_size(PAGE as u64 * 64),
    )
    .unwrap()
}

fn stage(env: &StorageEnv, tx: &WriteTransaction, page: u64, fill: u8) -> (PageId, PagePosition) {
    let alloc = env.allocate_scratch(tx, 1).unwrap();
    env.page_mut(&alloc).unwrap().fill(fill);
    (PageId(page), PagePosition::from_allocation(&alloc, tx.id()))
}

fn commit_page(env: &StorageEnv, page: u64, fill: u8) -> TxId {
    let tx = env.begin_write().unwrap();
    let entry = stage(env, &tx, page, fill);
    let items: FxHashMap<_, _> = [entry].into_iter().collect();
    env.commit_versions(tx, &items).unwrap()
}

#[test]
fn tracker_reports_oldest_reader() {
    let tracker = Arc::new(TransactionTracker::new(TxId::ZERO));
    let w1 = tracker.begin_write().unwrap();
    assert!(matches!(tracker.begin_write(), Err(PenumbraError::Invalid(_))));
    assert_eq!(w1.commit(), TxId(1));

    let r1 = tracker.begin_read().unwrap();
    let w2 = tracker.begin_write().unwrap();
    w2.commit();
    let r2 = tracker.begin_read().unwrap();
    assert_eq!(r1.id(), TxId(1));
    assert_eq!(r2.id(), TxId(2));
    assert_eq!(tracker.oldest_active_read(TxId(3)), TxId(1));
    assert_eq!(tracker.context(TxId(3)).oldest_active_read, TxId(1));

    let snapshot = tracker.reader_snapshot();
    assert_eq!(snapshot.active, 2);
    assert_eq!(snapshot.oldest_snapshot, Some(TxId(1)));
    assert_eq!(snapshot.newest_snapshot, Some(TxId(2)));

    drop(r1);
    assert_eq!(tracker.oldest_active_read(TxId(3)), TxId(2));
    drop(r2);
    assert_eq!(tracker.oldest_active_read(TxId(3)), TxId(3));
    assert_eq!(tracker.reader_snapshot().active, 0);
}

#[test]
fn rolled_back_writer_publishes_nothing() {
    let env = open();
    commit_page(&env, 1, 0x11);
    {
        let tx = env.begin_write().unwrap();
        let (_, position) = stage(&env, &tx, 1, 0x22);
        assert_eq!(position.transaction_id, TxId(2));
    }
    assert_eq!(env.tracker().last_committed(), TxId(1));
    let read = env.begin_read().unwrap();
    let page = env.read_page(read.id(), PageId(1)).unwrap().unwrap();
    assert!(page.iter().all(|&b| b == 0x11));
    let next = env.begin_write().unwrap();
    assert_eq!(next.id(), TxId(3));
}

#[test]
fn deleted_page_disappears_for_new_readers() {
    let env = open();
    commit_page(&env, 4, 0x44);
    let before = env.begin_read().unwrap();
    let tx = env.begin_write().unwrap();
    let items: FxHashMap<_, _> = [(PageId(4), PagePosition::freed(tx.id()))]
        .into_iter()
        .collect();
    env.commit_versions(tx, &items).unwrap();

    let after = env.begin_read().unwrap();
    assert!(env.read_page(before.id(), PageId(4)).unwrap().is_some());
    assert!(env.read_page(after.id(), PageId(4)).unwrap().is_none());
    assert!(env.resolve(after.id(), PageId(4)).is_none());
}

#[test]
fn reclaimed_pages_wait_for_readers_before_reuse() {
    let env = open();
    commit_page(&env, 1, 0xA1);
    let old = env.resolve(TxId(1), PageId(1)).unwrap().location.unwrap();
    commit_page(&env, 1, 0xA2);

    let pinned = env.begin_read().unwrap();
    let outcome = env.flush_journal().unwrap();
    assert_eq!(outcome.gc_boundary, TxId(2));
    assert_eq!(outcome.freed_allocations, 2);

    let tx = env.begin_write().unwrap();
    let fresh = env.allocate_scratch(&tx, 1).unwrap();
    assert_ne!(fresh.position_in_scratch, old.position);
    env.free_scratch(&fresh, None).unwrap();
    drop(tx);
    drop(pinned);

    let tx = env.begin_write().unwrap();
    let reused = env.allocate_scratch(&tx, 1).unwrap();
    assert_eq!(reused.position_in_scratch, fresh.position_in_scratch);
    let again = env.allocate_scratch(&tx, 1).unwrap();
    assert!(again.position_in_scratch < fresh.position_in_scratch);
}

#[test]
fn collected_pages_stay_visible_to_pinned_readers() {
    let env = open();
    let before = env.begin_read().unwrap();
    commit_page(&env, 1, 0x31);
    let pinned = env.begin_read().unwrap();
    assert_eq!(pinned.id(), TxId(1));

    let outcome = env.flush_journal().unwrap();
    assert_eq!(outcome.gc_boundary, TxId(0));
    drop(before);
    let outcome = env.flush_journal().unwrap();
    assert_eq!(outcome.gc_boundary, TxId(1));
    assert_eq!(outcome.freed_allocations, 1);
    assert_eq!(env.stats().tracked_pages, 0);
    assert_eq!(env.stats().journaled_pages, 1);
    let page = env.read_page(pinned.id(), PageId(1)).unwrap().unwrap();
    assert!(page.iter().all(|&b| b == 0x31));

    commit_page(&env, 1, 0x32);
    let latest = env.begin_read().unwrap();
    let page = env.read_page(pinned.id(), PageId(1)).unwrap().unwrap();
    assert!(page.iter().all(|&b| b == 0x31));
    let page = env.read_page(latest.id(), PageId(1)).unwrap().unwrap();
    assert!(page.iter().all(|&b| b == 0x32));

    let tx = env.begin_write().unwrap();
    let items: FxHashMap<_, _> = [(PageId(1), PagePosition::freed(tx.id()))]
        .into_iter()
        .collect();
    env.commit_versions(tx, &items).unwrap();
    drop(pinned);
    drop(latest);
    let outcome = env.flush_journal().unwrap();
    assert_eq!(outcome.gc_boundary, TxId(3));
    assert_eq!(env.stats().journaled_pages, 0);
    let after = env.begin_read().unwrap();
    assert!(env.read_page(after.id(), PageId(1)).unwrap().is_none());
}

#[test]
fn broken_up_allocation_frees_page_by_page() {
    let env = open();
    let tx = env.begin_write().unwrap();
    let big = env.allocate_scratch(&tx, 4).unwrap();
    env.break_large_allocation(&big).unwrap();
    let mut marker = big;
    for offset in 1..4 {
        marker.position_in_scratch = big.position_in_scratch + offset;
        env.free_scratch(&marker, None).unwrap();
    }
    env.free_scratch(&big, None).unwrap();
    let reused = env.allocate_scratch(&tx, 4).unwrap();
    assert_eq!(reused.position_in_scratch, big.position_in_scratch);
}

#[test]
fn metrics_count_activity() {
    let metrics = Arc::new(CounterMetrics::default());
    let sink: Arc<dyn StorageMetrics> = metrics.clone();
    let env = open().with_metrics(sink);
    commit_page(&env, 1, 1);
    commit_page(&env, 1, 2);
    let read = env.begin_read().unwrap();
    assert!(env.read_page(read.id(), PageId(1)).unwrap().is_some());
    assert!(env.read_page(read.id(), PageId(2)).unwrap().is_none());
    drop(read);
    let outcome = env.flush_journal().unwrap();

    assert_eq!(metrics.scratch_pages_allocated.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.resolve_hits.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.resolve_misses.load(Ordering::Relaxed), 1);
    assert_eq!(
        metrics.journal_frames.load(Ordering::Relaxed),
        outcome.frames as u64
    );
    assert_eq!(
        metrics.scratch_pending_frees.load(Ordering::Relaxed),
        outcome.freed_allocations as u64
    );
}

#[test]
fn readers_and_flushes_interleave_with_writer() {
    let env = Arc::new(open());
    thread::scope(|scope| {
        for _ in 0..3 {
            let env = Arc::clone(&env);
            scope.spawn(move || {
                for _ in 0..300 {
                    let read = env.begin_read().unwrap();
                    for page in 0..4 {
                        if let Some(bytes) = env.read_page(read.id(), PageId(page)).unwrap() {
                            let fill = bytes[0];
                            assert!(bytes.iter().all(|&b| b == fill));
                            assert!(u64::from(fill) <= read.id().0);
                        }
                    }
                }
            });
        }
        for round in 1..=120u64 {
            let tx = env.begin_write().unwrap();
            let mut items = FxHashMap::default();
            for page in 0..4 {
                let entry = stage(&env, &tx, page, tx.id().0 as u8);
                items.insert(entry.0, entry.1);
            }
            env.commit_versions(tx, &items).unwrap();
            if round % 8 == 0 {
                env.flush_journal().unwrap();
                env.cleanup();
            }
        }
    });
    let outcome = env.flush_journal().unwrap();
    assert_eq!(outcome.journaled_up_to, TxId(120));
    assert_eq!(env.stats().readers.active, 0);
}
