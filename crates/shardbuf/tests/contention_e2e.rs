#![forbid(unsafe_code)]
//! Multithreaded contention tests: mutual exclusion on a single block,
//! uniqueness of slots, and pool consistency under churn.

use shardbuf::{BufCache, CacheConfig, MemoryBlockStore};
use shardbuf_types::{BlockNumber, BlockSize, DeviceId};
use std::sync::{Arc, Barrier};

const BS: u32 = 512;

fn make_cache(total_slots: usize, shard_count: usize) -> Arc<BufCache<MemoryBlockStore>> {
    let store = MemoryBlockStore::new(BlockSize::new(BS).expect("block size"));
    Arc::new(
        BufCache::new(
            store,
            CacheConfig {
                total_slots,
                shard_count,
            },
        )
        .expect("cache"),
    )
}

#[test]
fn concurrent_increments_on_one_block_serialize() {
    let cache = make_cache(8, 3);
    let num_threads = 8_usize;
    let increments_per_thread = 200_u64;
    let barrier = Arc::new(Barrier::new(num_threads));

    // Every thread increments a counter stored in the block payload. The
    // exclusive slot lock is the only thing making this read-modify-write
    // atomic; a lost update means two threads held the same block at once
    // or two slots cached the same key.
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for _ in 0..increments_per_thread {
                    let mut guard = cache.read(DeviceId(0), BlockNumber(7)).expect("read");
                    let mut counter = [0_u8; 8];
                    counter.copy_from_slice(&guard.bytes()[..8]);
                    let value = u64::from_le_bytes(counter) + 1;
                    guard.bytes_mut()[..8].copy_from_slice(&value.to_le_bytes());
                    guard.release();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let guard = cache.read(DeviceId(0), BlockNumber(7)).expect("read");
    let mut counter = [0_u8; 8];
    counter.copy_from_slice(&guard.bytes()[..8]);
    let expected = u64::try_from(num_threads).expect("fits") * increments_per_thread;
    assert_eq!(u64::from_le_bytes(counter), expected, "lost update");
}

#[test]
fn concurrent_writers_to_distinct_blocks_persist() {
    // 16 blocks through an 8-slot pool: the pool turns over under load and
    // every write must still land on its own block.
    let cache = make_cache(8, 3);
    let num_threads = 16_usize;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let block = BlockNumber(u64::try_from(i).expect("fits"));
                let fill = u8::try_from(i + 1).expect("fits");
                let mut guard = cache.read(DeviceId(0), block).expect("read");
                guard.bytes_mut().fill(fill);
                guard.write().expect("write");
                guard.release();
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked");
    }

    for i in 0..num_threads {
        let block = BlockNumber(u64::try_from(i).expect("fits"));
        let fill = u8::try_from(i + 1).expect("fits");
        let guard = cache.read(DeviceId(0), block).expect("read");
        assert!(
            guard.bytes().iter().all(|&b| b == fill),
            "block {i} corrupted"
        );
    }
}

#[test]
fn churn_over_a_small_pool_stays_consistent() {
    let cache = make_cache(4, 2);
    let num_threads = 4_usize;
    let reads_per_thread = 500_usize;
    let barrier = Arc::new(Barrier::new(num_threads));

    // Each thread holds at most one guard at a time, so the pool of 4 can
    // never exhaust; every read must succeed.
    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for j in 0..reads_per_thread {
                    let block =
                        u64::try_from(thread_id * reads_per_thread + j).expect("fits") % 64;
                    let mut guard = cache.read(DeviceId(0), BlockNumber(block)).expect("read");
                    let bumped = guard.bytes()[0].wrapping_add(1);
                    guard.bytes_mut()[0] = bumped;
                    guard.release();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked");
    }

    // Every reference was released and every lookup was either a hit or a
    // miss, nothing dropped on the floor.
    assert_eq!(cache.free_slots(), cache.total_slots());
    let m = cache.metrics();
    let total_reads = u64::try_from(num_threads * reads_per_thread).expect("fits");
    assert_eq!(m.hits + m.misses, total_reads);

    // The pool never grows: shard lists always account for every slot.
    let occupancy: usize = cache.shard_occupancy().into_iter().sum();
    assert_eq!(occupancy, cache.total_slots());
}

#[test]
fn exhaustion_surfaces_while_other_threads_hold_guards() {
    let cache = make_cache(2, 2);

    // Hold both slots on the main thread, then let another thread observe
    // exhaustion.
    let a = cache.read(DeviceId(0), BlockNumber(0)).expect("read");
    let b = cache.read(DeviceId(0), BlockNumber(1)).expect("read");

    let observer = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || cache.read(DeviceId(0), BlockNumber(2)).map(|g| g.release()))
    };
    let err = observer
        .join()
        .expect("thread panicked")
        .expect_err("pool is exhausted");
    assert!(err.is_unrecoverable());

    a.release();
    b.release();
    assert_eq!(cache.free_slots(), 2);
}
