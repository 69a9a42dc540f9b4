//! Scratch Space Lifecycle Tests
//!
//! Exercises scratch files and the scratch pool end to end:
//! - rollback frees are reused at the same position
//! - committed frees wait for every older reader
//! - broken-up allocations release their markers
//! - the pool rolls over to fresh files and recycles drained ones

#![allow(missing_docs)]

use std::sync::Arc;

use penumbra::primitives::pager::{Pager, PagerOptions};
use penumbra::storage::scratch::{ScratchBufferFile, ScratchBufferPool};
use penumbra::storage::{StorageOptions, TxContext};
use penumbra::types::{PenumbraError, ScratchFileId, TxId};
use tempfile::tempdir;

const PAGE: u32 = 512;

fn scratch_file(max_pages: u64) -> ScratchBufferFile {
    let pager = Pager::in_memory(PagerOptions::new(PAGE).max_pages(max_pages)).unwrap();
    ScratchBufferFile::new(ScratchFileId(0), Arc::new(pager))
}

fn pool_options(pages_per_file: u64, files: usize) -> StorageOptions {
    StorageOptions::default()
        .page_size(PAGE)
        .max_compressed_page_size(4096)
        .decompression_pager_pages(8)
        .max_scratch_file_size(pages_per_file * PAGE as u64)
        .max_scratch_files(files)
        .retained_recycled_files(0)
}

#[test]
fn rollback_free_is_reused_at_same_position() {
    let mut file = scratch_file(64);
    let tx = TxContext::solo(TxId(1));
    let first = file.allocate(tx, 1, 1).unwrap();
    let _second = file.allocate(tx, 1, 1).unwrap();
    file.free(first.position_in_scratch, None).unwrap();

    let reused = file.try_get_from_freed_buffer(tx, 1, 1).unwrap();
    assert_eq!(reused.position_in_scratch, first.position_in_scratch);
    assert_eq!(reused.scratch_file_id, ScratchFileId(0));
    assert!(file.try_get_from_freed_buffer(tx, 1, 1).is_none());
}

#[test]
fn immediate_frees_are_reused_lifo() {
    let mut file = scratch_file(64);
    let tx = TxContext::solo(TxId(1));
    let a = file.allocate(tx, 2, 2).unwrap();
    let b = file.allocate(tx, 2, 2).unwrap();
    file.free(a.position_in_scratch, None).unwrap();
    file.free(b.position_in_scratch, None).unwrap();
    let reused = file.try_get_from_freed_buffer(tx, 2, 2).unwrap();
    assert_eq!(reused.position_in_scratch, b.position_in_scratch);
    assert!(file.try_get_from_freed_buffer(tx, 1, 1).is_none());
}

#[test]
fn pending_free_waits_for_older_readers() {
    let mut file = scratch_file(64);
    let page = file.allocate(TxContext::solo(TxId(1)), 1, 1).unwrap();
    file.free(page.position_in_scratch, Some(TxId(2))).unwrap();

    let blocked = TxContext::new(TxId(3), TxId(2));
    assert!(file.try_get_from_freed_buffer(blocked, 1, 1).is_none());
    assert!(file.has_actively_used_bytes(TxId(2)));

    let clear = TxContext::new(TxId(3), TxId(3));
    assert!(!file.has_actively_used_bytes(TxId(3)));
    let reused = file.try_get_from_freed_buffer(clear, 1, 1).unwrap();
    assert_eq!(reused.position_in_scratch, page.position_in_scratch);
}

#[test]
fn broken_up_allocation_releases_markers() {
    let mut file = scratch_file(64);
    let tx = TxContext::solo(TxId(1));
    let big = file.allocate(tx, 4, 4).unwrap();
    assert_eq!(file.allocated_pages_count(), 4);
    file.break_large_allocation_to_separate_pages(&big).unwrap();
    assert_eq!(file.allocation(big.position_in_scratch).unwrap().size, 4);
    assert_eq!(file.allocation(big.position_in_scratch + 1).unwrap().size, 0);

    for offset in 1..4 {
        file.free(big.position_in_scratch + offset, None).unwrap();
    }
    assert!(file.free_pages_by_size().is_empty());
    file.free(big.position_in_scratch, None).unwrap();
    assert_eq!(file.free_pages_by_size().get(&4), Some(&1));
    assert_eq!(file.allocated_pages_count(), 0);
}

#[test]
fn double_free_is_an_invariant_violation() {
    let mut file = scratch_file(64);
    let page = file.allocate(TxContext::solo(TxId(1)), 1, 1).unwrap();
    file.free(page.position_in_scratch, None).unwrap();
    let err = file.free(page.position_in_scratch, None).unwrap_err();
    assert!(matches!(err, PenumbraError::InvariantViolation(_)));
}

#[test]
fn file_growth_beyond_budget_is_scratch_full() {
    let mut file = scratch_file(4);
    let tx = TxContext::solo(TxId(1));
    file.allocate(tx, 4, 4).unwrap();
    let err = file.allocate(tx, 1, 1).unwrap_err();
    assert!(matches!(err, PenumbraError::ScratchFull { .. }));
}

#[test]
fn pool_writes_are_visible_through_reads() {
    let pool = ScratchBufferPool::new(&pool_options(64, 2)).unwrap();
    let alloc = pool.allocate(TxContext::solo(TxId(1)), 3).unwrap();
    assert_eq!(alloc.size, 4);
    {
        let mut span = pool.page_mut(&alloc).unwrap();
        assert_eq!(span.len(), 3 * PAGE as usize);
        span.fill(0x5A);
        span.write_at(PAGE as usize, b"second").unwrap();
    }
    let span = pool
        .read_page(alloc.scratch_file_id, alloc.position_in_scratch, 3)
        .unwrap();
    assert!(span.page(0).unwrap().iter().all(|&b| b == 0x5A));
    assert_eq!(&span.page(1).unwrap()[..6], b"second");
}

#[test]
fn pool_rolls_over_and_recycles_drained_files() {
    let pool = ScratchBufferPool::new(&pool_options(4, 2)).unwrap();
    let tx = TxContext::solo(TxId(1));
    let full = pool.allocate(tx, 4).unwrap();
    assert_eq!(full.scratch_file_id, ScratchFileId(0));

    let spill = pool.allocate(tx, 1).unwrap();
    assert_eq!(spill.scratch_file_id, ScratchFileId(1));
    assert_eq!(pool.current_file_id(), ScratchFileId(1));

    pool.free(full.scratch_file_id, full.position_in_scratch, None)
        .unwrap();
    assert_eq!(pool.stats().recycle_queue, 1);

    pool.allocate(tx, 2).unwrap();
    let recycled = pool.allocate(tx, 2).unwrap();
    assert_eq!(recycled.scratch_file_id, ScratchFileId(0));
    assert_eq!(recycled.position_in_scratch, 0);
    assert_eq!(pool.stats().files.len(), 2);

    pool.allocate(tx, 2).unwrap();
    let err = pool.allocate(tx, 4).unwrap_err();
    assert!(matches!(err, PenumbraError::ScratchFull { .. }));
}

#[test]
fn pool_keeps_pending_files_out_of_recycling() {
    let pool = ScratchBufferPool::new(&pool_options(4, 3)).unwrap();
    let full = pool.allocate(TxContext::solo(TxId(1)), 4).unwrap();
    pool.allocate(TxContext::solo(TxId(1)), 4).unwrap();
    pool.free(full.scratch_file_id, full.position_in_scratch, Some(TxId(5)))
        .unwrap();

    let reader_at_five = TxContext::new(TxId(6), TxId(5));
    let next = pool.allocate(reader_at_five, 1).unwrap();
    assert_eq!(next.scratch_file_id, ScratchFileId(2));
    assert_eq!(pool.cleanup(TxId(5)), 0);

    assert_eq!(pool.cleanup(TxId(6)), 1);
    assert_eq!(pool.stats().files.len(), 2);
}

#[test]
fn oversized_and_empty_requests_are_rejected() {
    let pool = ScratchBufferPool::new(&pool_options(8, 2)).unwrap();
    let tx = TxContext::solo(TxId(1));
    assert!(matches!(
        pool.allocate(tx, 0),
        Err(PenumbraError::Invalid(_))
    ));
    assert!(matches!(
        pool.allocate(tx, 9),
        Err(PenumbraError::ScratchFull { .. })
    ));
}

#[test]
fn file_backed_pool_creates_scratch_files() {
    let dir = tempdir().unwrap();
    let options = pool_options(16, 2).scratch_dir(dir.path().join("scratch"));
    let pool = ScratchBufferPool::new(&options).unwrap();
    let alloc = pool.allocate(TxContext::solo(TxId(1)), 1).unwrap();
    pool.page_mut(&alloc).unwrap().fill(7);
    assert!(dir
        .path()
        .join("scratch")
        .join("scratch.0000000000.buffers")
        .exists());
    let span = pool
        .read_page(alloc.scratch_file_id, alloc.position_in_scratch, 1)
        .unwrap();
    assert!(span.page(0).unwrap().iter().all(|&b| b == 7));
    pool.dispose();
}
