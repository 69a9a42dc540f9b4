//! MVCC Visibility Tests
//!
//! Validates snapshot resolution through the page version table and the
//! storage environment:
//! - readers see the newest version at or before their snapshot
//! - freed markers hide older versions
//! - garbage collection is idempotent and respects newer versions
//! - concurrent readers never observe bytes from a newer transaction

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use penumbra::storage::{
    PagePosition, PageVersionTable, ScratchLocation, StorageEnv, StorageOptions, TxContext,
};
use penumbra::types::{PageId, PenumbraError, ScratchFileId, TxId};
use rustc_hash::FxHashMap;

const PAGE: PageId = PageId(7);

fn version(position: u64, tx: u64) -> PagePosition {
    PagePosition::new(
        ScratchLocation {
            file: ScratchFileId(0),
            position,
            pages: 1,
        },
        TxId(tx),
    )
}

fn commit(table: &PageVersionTable, tx: u64, entries: &[(PageId, PagePosition)]) {
    let items: FxHashMap<_, _> = entries.iter().copied().collect();
    table
        .set_items(TxContext::solo(TxId(tx)), &items)
        .unwrap();
}

fn seen_at(table: &PageVersionTable, tx: u64) -> Option<TxId> {
    table
        .try_get_value(TxContext::solo(TxId(tx)), PAGE)
        .map(|position| position.transaction_id)
}

#[test]
fn readers_see_version_at_or_before_snapshot() {
    let table = PageVersionTable::new();
    commit(&table, 10, &[(PAGE, version(1, 10))]);
    commit(&table, 20, &[(PAGE, version(2, 20))]);

    assert_eq!(seen_at(&table, 5), None);
    assert_eq!(seen_at(&table, 10), Some(TxId(10)));
    assert_eq!(seen_at(&table, 15), Some(TxId(10)));
    assert_eq!(seen_at(&table, 25), Some(TxId(20)));
    assert_eq!(table.max_transaction_id(), TxId(20));
    assert_eq!(table.last_seen_transaction_id(), TxId(20));
}

#[test]
fn freed_marker_hides_older_versions() {
    let table = PageVersionTable::new();
    commit(&table, 10, &[(PAGE, version(1, 10))]);
    commit(&table, 20, &[(PAGE, version(2, 20))]);
    commit(&table, 30, &[(PAGE, PagePosition::freed(TxId(30)))]);

    assert_eq!(seen_at(&table, 25), Some(TxId(20)));
    assert_eq!(seen_at(&table, 30), None);
    assert_eq!(seen_at(&table, 35), None);
}

#[test]
fn gc_is_idempotent() {
    let table = PageVersionTable::new();
    commit(&table, 10, &[(PAGE, version(1, 10))]);
    commit(&table, 20, &[(PAGE, version(2, 20))]);

    let mut unused = Vec::new();
    table.remove_keys_where_all_pages_older_than(TxId(20), &mut unused);
    let mut reclaimed: Vec<_> = unused.iter().map(|p| p.transaction_id).collect();
    reclaimed.sort();
    assert_eq!(reclaimed, vec![TxId(10), TxId(20)]);
    assert!(table.is_empty());
    assert_eq!(seen_at(&table, 25), None);

    table.remove_keys_where_all_pages_older_than(TxId(20), &mut unused);
    assert_eq!(unused.len(), 2);
    assert!(table
        .get_modified_pages_for_transaction_range(TxId(1), TxId(20))
        .is_empty());
}

#[test]
fn gc_keeps_pages_with_newer_versions() {
    let table = PageVersionTable::new();
    let other = PageId(8);
    commit(&table, 10, &[(PAGE, version(1, 10)), (other, version(2, 10))]);
    commit(&table, 30, &[(PAGE, version(3, 30))]);

    let mut unused = Vec::new();
    table.remove_keys_where_all_pages_older_than(TxId(20), &mut unused);
    assert_eq!(unused, vec![version(2, 10)]);
    assert_eq!(table.count(), 1);
    assert_eq!(seen_at(&table, 15), Some(TxId(10)));
    assert_eq!(seen_at(&table, 30), Some(TxId(30)));

    let remaining = table.get_modified_pages_for_transaction_range(TxId(1), TxId(40));
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0, TxId(30));
}

#[test]
fn transaction_ids_must_increase() {
    let table = PageVersionTable::new();
    commit(&table, 20, &[(PAGE, version(1, 20))]);

    for stale in [20, 19] {
        let items: FxHashMap<_, _> = [(PAGE, version(2, stale))].into_iter().collect();
        let err = table
            .set_items(TxContext::solo(TxId(stale)), &items)
            .unwrap_err();
        assert!(matches!(err, PenumbraError::InvariantViolation(_)));
    }

    let foreign: FxHashMap<_, _> = [(PAGE, version(2, 22))].into_iter().collect();
    let err = table
        .set_items(TxContext::solo(TxId(21)), &foreign)
        .unwrap_err();
    assert!(matches!(err, PenumbraError::InvariantViolation(_)));
    assert_eq!(seen_at(&table, 30), Some(TxId(20)));
}

#[test]
fn version_arrays_grow_without_losing_history() {
    let table = PageVersionTable::new();
    for tx in 1..=64u64 {
        commit(&table, tx * 2, &[(PAGE, version(tx, tx * 2))]);
    }
    for tx in 1..=64u64 {
        assert_eq!(seen_at(&table, tx * 2 + 1), Some(TxId(tx * 2)));
    }
    let range = table.get_modified_pages_for_transaction_range(TxId(10), TxId(20));
    let ids: Vec<_> = range.iter().map(|(tx, _)| tx.0).collect();
    assert_eq!(ids, vec![10, 12, 14, 16, 18, 20]);
}

fn env() -> Arc<StorageEnv> {
    Arc::new(
        StorageEnv::open(
            StorageOptions::default()
                .page_size(512)
                .max_compressed_page_size(4096)
                .decompression_pager_pages(64)
                .max_scratch_file_size(512 * 1024),
        )
        .unwrap(),
    )
}

fn stamp(bytes: &mut [u8], tx: TxId) {
    bytes.fill((tx.0 % 251) as u8);
    bytes[..8].copy_from_slice(&tx.0.to_le_bytes());
}

fn check_stamp(bytes: &[u8]) -> u64 {
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&bytes[..8]);
    let tx = u64::from_le_bytes(tag);
    assert!(
        bytes[8..].iter().all(|&b| b == (tx % 251) as u8),
        "torn page for transaction {tx}"
    );
    tx
}

#[test]
fn concurrent_readers_never_see_newer_versions() {
    let env = env();
    let stop = Arc::new(AtomicBool::new(false));
    let lookups = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let env = Arc::clone(&env);
            let stop = Arc::clone(&stop);
            let lookups = Arc::clone(&lookups);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let read = env.begin_read().unwrap();
                    for page in 0..4 {
                        if let Some(tx) = env
                            .with_page(read.id(), PageId(page), check_stamp)
                            .unwrap()
                        {
                            assert!(tx <= read.id().0, "reader {} saw tx {tx}", read.id());
                        }
                        lookups.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for round in 0..200u64 {
        let tx = env.begin_write().unwrap();
        let mut items = FxHashMap::default();
        for page in 0..4 {
            let alloc = env.allocate_scratch(&tx, 1).unwrap();
            stamp(env.page_mut(&alloc).unwrap().page_mut(0).unwrap(), tx.id());
            items.insert(PageId(page), PagePosition::from_allocation(&alloc, tx.id()));
        }
        env.commit_versions(tx, &items).unwrap();
        if round % 16 == 15 {
            env.flush_journal().unwrap();
        }
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(lookups.load(Ordering::Relaxed) > 0);
    assert_eq!(env.tracker().last_committed(), TxId(200));
}
