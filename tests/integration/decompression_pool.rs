//! Decompression Buffer Pool Tests
//!
//! Covers temporary page handling under the storage environment:
//! - buffers land in stable power-of-two buckets and are reused LIFO
//! - pager roll-over and cleanup never invalidate pages in flight
//! - concurrent requests receive exclusive buffers

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use penumbra::storage::{compress_page, DecompressionBufferPool, StorageEnv, StorageOptions, TxContext};
use penumbra::types::{PenumbraError, TxId};

const PAGE: usize = 1024;

fn options(pager_pages: u64) -> StorageOptions {
    StorageOptions::default()
        .page_size(PAGE as u32)
        .max_compressed_page_size(16 * PAGE as u32)
        .decompression_pager_pages(pager_pages)
}

fn tx() -> TxContext {
    TxContext::solo(TxId(1))
}

#[test]
fn buckets_are_stable_per_size() {
    let pool = DecompressionBufferPool::new(&options(128)).unwrap();
    for (size, index) in [(PAGE, 0), (2 * PAGE, 1), (4 * PAGE, 2), (16 * PAGE, 4)] {
        assert_eq!(pool.bucket_index(size).unwrap(), index);
        let scope = pool.get_temporary_page(tx(), size).unwrap();
        assert_eq!(scope.buffer().pool_index(), index);
        assert_eq!(scope.size(), size);
        assert_eq!(scope.span().len(), size);
    }
    assert_eq!(pool.stats().buckets, 5);
}

#[test]
fn last_released_buffer_is_handed_out_first() {
    let pool = DecompressionBufferPool::new(&options(128)).unwrap();
    let first = pool.get_temporary_page(tx(), 2 * PAGE).unwrap();
    let second = pool.get_temporary_page(tx(), 2 * PAGE).unwrap();
    let first_pos = first.buffer().position();
    let second_pos = second.buffer().position();
    assert_ne!(first_pos, second_pos);
    drop(first);
    drop(second);

    let again = pool.get_temporary_page(tx(), 2 * PAGE).unwrap();
    assert_eq!(again.buffer().position(), second_pos);
    let next = pool.get_temporary_page(tx(), 2 * PAGE).unwrap();
    assert_eq!(next.buffer().position(), first_pos);
    assert_eq!(pool.stats().pooled_buffers, 0);
}

#[test]
fn pool_keeps_serving_after_cleanup_disposes_pagers() {
    let pool = DecompressionBufferPool::new(&options(4)).unwrap();
    let old_pager = {
        let scope = pool.get_temporary_page(tx(), PAGE).unwrap();
        scope.buffer().pager_id()
    };
    let mut held = pool.get_temporary_page(tx(), 4 * PAGE).unwrap();
    assert_ne!(held.buffer().pager_id(), old_pager);
    held.span_mut().fill(0xC3);

    assert_eq!(pool.cleanup(), 1);
    assert_eq!(pool.stats().superseded_pagers, 0);
    assert_eq!(pool.stats().pooled_buffers, 0);
    assert!(held.to_vec().iter().all(|&b| b == 0xC3));

    let fresh = pool.get_temporary_page(tx(), PAGE).unwrap();
    assert_ne!(fresh.buffer().pager_id(), old_pager);
    drop(fresh);
    drop(held);
    assert_eq!(pool.stats().in_flight_bytes, 0);
}

#[test]
fn invalid_sizes_are_rejected() {
    let pool = DecompressionBufferPool::new(&options(16)).unwrap();
    assert!(matches!(
        pool.get_temporary_page(tx(), PAGE / 2),
        Err(PenumbraError::InvalidSize { .. })
    ));
    assert!(matches!(
        pool.get_temporary_page(tx(), 3 * PAGE),
        Err(PenumbraError::InvalidSize { .. })
    ));
    assert!(matches!(
        pool.get_temporary_page(tx(), 32 * PAGE),
        Err(PenumbraError::SizeTooLarge { .. })
    ));
}

#[test]
fn concurrent_requests_get_exclusive_pages() {
    let pool = Arc::new(DecompressionBufferPool::new(&options(32)).unwrap());
    thread::scope(|scope| {
        for worker in 0..4u8 {
            let pool = Arc::clone(&pool);
            scope.spawn(move || {
                for round in 0..200usize {
                    let size = PAGE << (round % 3);
                    let mut page = pool.get_temporary_page(tx(), size).unwrap();
                    page.span_mut().fill(worker);
                    thread::yield_now();
                    assert!(page.to_vec().iter().all(|&b| b == worker));
                    drop(page);
                    if round % 50 == 49 {
                        pool.cleanup();
                    }
                }
            });
        }
    });
    assert_eq!(pool.stats().in_flight_bytes, 0);
}

#[test]
fn env_decompresses_into_temporary_pages() {
    let env = StorageEnv::open(options(64)).unwrap();
    let page: Vec<u8> = (0..PAGE).map(|i| (i * 7 % 256) as u8).collect();
    let compressed = compress_page(&page).unwrap();
    let read = env.begin_read().unwrap();
    {
        let scope = env.decompress_page(read.context(), &compressed, PAGE).unwrap();
        assert_eq!(scope.to_vec(), page);
    }
    let scope = env
        .acquire_decompression_buffer(read.context(), 2 * PAGE)
        .unwrap();
    assert_eq!(scope.size(), 2 * PAGE);
    drop(scope);
    assert!(env.stats().decompression.pooled_buffers >= 2);
}
