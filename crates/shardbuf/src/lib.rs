#![forbid(unsafe_code)]
//! Lock-sharded LRU block cache with cross-shard work stealing.
//!
//! [`BufCache`] sits between a file-system consumer and a block-addressed
//! store. It keeps a fixed pool of slots, guarantees at most one in-memory
//! copy of a given (device, block) pair is in use at a time, serializes
//! access to each cached block through a per-slot blocking lock, and
//! reclaims slots least-recently-freed first.
//!
//! # Locking protocol
//!
//! Slots are partitioned across shards by `block % shard_count`, each shard
//! guarding its own recency list. A global coordinator lock is taken only
//! on a cache miss, making the eviction/steal sequence atomic. The order is
//! fixed: coordinator before shard, and a shard lock is never held while
//! the coordinator is being acquired. At most one shard lock is held at a
//! time, except for the remove-then-insert pair of cross-shard stealing,
//! which the held coordinator serializes. The per-slot payload lock is
//! acquired only after every bookkeeping lock has been released, so it
//! never participates in the ordering chain.
//!
//! # Consumer contract
//!
//! Call [`BufCache::read`] to obtain an exclusively locked [`BlockGuard`];
//! mutate the payload in place; call [`BlockGuard::write`] to persist; drop
//! or [`BlockGuard::release`] the guard when finished. Do not hold a guard
//! across unbounded unrelated work: it starves every other thread waiting
//! on that exact block. Subsystems that need a block to stay resident
//! without continuously holding its lock use [`BufCache::pin`] /
//! [`BufCache::unpin`].

mod store;

pub use shardbuf_error::{CacheError, Result};
pub use store::{BlockStore, FileBlockStore, MemoryBlockStore};

use parking_lot::{Mutex, MutexGuard};
use shardbuf_types::{BlockKey, BlockNumber, BlockSize, DeviceId, FreeStamp, SlotIndex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace};

// ── Configuration ──────────────────────────────────────────────────────

/// Pool geometry for a [`BufCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Total number of slots, allocated once at startup.
    pub total_slots: usize,
    /// Number of lock shards. A prime count spreads sequential block
    /// numbers evenly.
    pub shard_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_slots: 64,
            shard_count: 13,
        }
    }
}

// ── Slot pool ──────────────────────────────────────────────────────────

/// Membership and bookkeeping state of one slot.
///
/// Guarded by its own mutex, but only ever locked while holding the owning
/// shard's lock (or the coordinator-protected miss sequence), so it is a
/// leaf lock: never held across another acquisition.
#[derive(Debug)]
struct SlotMeta {
    /// Identity of the cached block, `None` until first use.
    key: Option<BlockKey>,
    /// Whether the payload holds the block's contents. `false` after an
    /// eviction rewrites the identity, until the next load.
    valid: bool,
    /// Total references: outstanding guards plus pins. Zero means free.
    refcount: u32,
    /// The subset of `refcount` contributed by `pin`, tracked separately
    /// so an unbalanced `unpin` is detectable.
    pins: u32,
    /// Recency stamp from the last in-use -> free transition.
    free_stamp: FreeStamp,
}

#[derive(Debug)]
struct Slot {
    meta: Mutex<SlotMeta>,
    /// Exclusive payload lock. Contending threads block here, outside any
    /// bookkeeping lock.
    payload: Mutex<Box<[u8]>>,
}

impl Slot {
    fn new(block_size: usize) -> Self {
        Self {
            meta: Mutex::new(SlotMeta {
                key: None,
                valid: false,
                refcount: 0,
                pins: 0,
                free_stamp: FreeStamp::NEVER_USED,
            }),
            payload: Mutex::new(vec![0_u8; block_size].into_boxed_slice()),
        }
    }
}

/// One shard's recency list: slot indices, most recently inserted first.
#[derive(Debug, Default)]
struct ShardState {
    order: VecDeque<usize>,
}

// ── Metrics ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    steals: AtomicU64,
}

/// Point-in-time snapshot of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups satisfied by a resident slot (fast path or double-check).
    pub hits: u64,
    /// Lookups that allocated a slot.
    pub misses: u64,
    /// Allocations that discarded a previously cached block.
    pub evictions: u64,
    /// Allocations that migrated a slot from another shard.
    pub steals: u64,
}

// ── Cache ──────────────────────────────────────────────────────────────

/// Sharded block cache over a [`BlockStore`].
#[derive(Debug)]
pub struct BufCache<S: BlockStore> {
    store: S,
    slots: Vec<Slot>,
    shards: Vec<Mutex<ShardState>>,
    /// Taken only during miss handling; makes cross-shard eviction atomic.
    coordinator: Mutex<()>,
    /// Source of free stamps. Starts at 1 so 0 stays the never-used
    /// sentinel.
    free_clock: AtomicU64,
    counters: Counters,
}

impl<S: BlockStore> BufCache<S> {
    /// Create a cache over `store` with the given geometry.
    ///
    /// Slots are assigned to shards round-robin (`slot i` to shard
    /// `i % shard_count`) and never deallocated afterwards; eviction
    /// rewrites a free slot's identity in place.
    pub fn new(store: S, config: CacheConfig) -> Result<Self> {
        if config.shard_count == 0 {
            return Err(CacheError::Config("shard_count must be > 0".to_owned()));
        }
        if config.total_slots < config.shard_count {
            return Err(CacheError::Config(format!(
                "total_slots={} must be >= shard_count={}",
                config.total_slots, config.shard_count
            )));
        }

        let block_size = store.block_size();
        let slots: Vec<Slot> = (0..config.total_slots)
            .map(|_| Slot::new(block_size.as_usize()))
            .collect();
        let mut shards: Vec<ShardState> = (0..config.shard_count)
            .map(|_| ShardState::default())
            .collect();
        for slot_idx in 0..config.total_slots {
            shards[slot_idx % config.shard_count].order.push_front(slot_idx);
        }

        info!(
            total_slots = config.total_slots,
            shard_count = config.shard_count,
            block_size = block_size.get(),
            "buf_cache: initializing"
        );

        Ok(Self {
            store,
            slots,
            shards: shards.into_iter().map(Mutex::new).collect(),
            coordinator: Mutex::new(()),
            free_clock: AtomicU64::new(1),
            counters: Counters::default(),
        })
    }

    /// Return an exclusively locked guard for `(device, block)`, loading
    /// the payload from the store if the slot is not yet valid.
    ///
    /// Blocks while another holder owns the slot's exclusive lock. Fails
    /// with [`CacheError::Exhausted`] when every slot in every shard is
    /// referenced; that error is unrecoverable and must not be retried.
    pub fn read(&self, device: DeviceId, block: BlockNumber) -> Result<BlockGuard<'_, S>> {
        let key = BlockKey::new(device, block);
        let slot_idx = self.acquire_slot(key)?;
        let slot = &self.slots[slot_idx];

        // Every bookkeeping lock has been released by now, so blocking
        // here cannot deadlock against the shard or coordinator locks.
        let mut payload = slot.payload.lock();

        let needs_load = !slot.meta.lock().valid;
        if needs_load {
            if let Err(err) = self.store.load(key, &mut payload) {
                // Roll back the reference so the slot is not leaked.
                drop(payload);
                self.release_slot(slot_idx);
                return Err(err);
            }
            slot.meta.lock().valid = true;
        }

        Ok(BlockGuard {
            cache: self,
            slot: slot_idx,
            key,
            payload: Some(payload),
        })
    }

    /// Keep `guard`'s block resident past the guard's lifetime.
    ///
    /// Increments the reference count without touching the exclusive lock
    /// or recency. Every pin must be balanced by exactly one
    /// [`BufCache::unpin`].
    pub fn pin(&self, guard: &BlockGuard<'_, S>) {
        let shard = self.shards[self.shard_index(guard.key.block)].lock();
        let mut meta = self.slots[guard.slot].meta.lock();
        meta.refcount += 1;
        meta.pins += 1;
        drop(meta);
        drop(shard);
        trace!(key = %guard.key, slot = guard.slot, "slot_pinned");
    }

    /// Balance a previous [`BufCache::pin`] of `(device, block)`.
    ///
    /// Unpinning a block that is not resident, or that has no outstanding
    /// pin, is a fatal [`CacheError::ContractViolation`]; cache state is
    /// untouched in that case but the caller must not continue.
    ///
    /// Unpin never restamps recency, even when it drops the reference
    /// count to zero; only a guard release does.
    pub fn unpin(&self, device: DeviceId, block: BlockNumber) -> Result<()> {
        let key = BlockKey::new(device, block);
        let shard = self.shards[self.shard_index(block)].lock();
        let resident = shard
            .order
            .iter()
            .copied()
            .find(|&idx| self.slots[idx].meta.lock().key == Some(key));
        let Some(slot_idx) = resident else {
            drop(shard);
            error!(%key, "unpin of a block that is not resident");
            return Err(CacheError::contract(format!(
                "unpin of non-resident block: {key}"
            )));
        };

        let mut meta = self.slots[slot_idx].meta.lock();
        if meta.pins == 0 {
            drop(meta);
            drop(shard);
            error!(%key, "unpin without a matching pin");
            return Err(CacheError::contract(format!(
                "unpin without a matching pin: {key}"
            )));
        }
        meta.pins -= 1;
        meta.refcount -= 1;
        drop(meta);
        drop(shard);
        trace!(%key, slot = slot_idx, "slot_unpinned");
        Ok(())
    }

    // ── Introspection ──────────────────────────────────────────────────

    /// Snapshot of activity counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
        }
    }

    /// Total number of slots in the pool.
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with no outstanding references.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.meta.lock().refcount == 0)
            .count()
    }

    /// Current slot count per shard (work stealing makes this uneven).
    #[must_use]
    pub fn shard_occupancy(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.lock().order.len()).collect()
    }

    /// Block size of the backing store.
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.store.block_size()
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    // ── Lookup / allocation ────────────────────────────────────────────

    /// Locate or allocate the slot for `key`, incrementing its refcount.
    ///
    /// Returns with no locks held; the caller acquires the slot's payload
    /// lock afterwards.
    fn acquire_slot(&self, key: BlockKey) -> Result<usize> {
        let home = self.shard_index(key.block);

        // Fast path: shard-local scan.
        {
            let shard = self.shards[home].lock();
            if let Some(idx) = self.scan_shard(&shard, key) {
                drop(shard);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%key, slot = idx, "cache_hit");
                return Ok(idx);
            }
        }

        // Miss escalation. The home shard lock was dropped above: holding
        // a shard lock while taking the coordinator would invert the fixed
        // coordinator-then-shard order.
        let coordinator = self.coordinator.lock();
        let mut home_shard = self.shards[home].lock();

        // Another thread may have inserted the key between the unlock and
        // the re-lock.
        if let Some(idx) = self.scan_shard(&home_shard, key) {
            drop(home_shard);
            drop(coordinator);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(%key, slot = idx, "cache_hit_double_check");
            return Ok(idx);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // In-shard eviction: oldest free slot in the home shard.
        if let Some((_, idx)) = self.victim_in(&home_shard) {
            let evicted = self.rewrite_slot(idx, key);
            drop(home_shard);
            drop(coordinator);
            if evicted {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            debug!(%key, slot = idx, evicted, "slot_allocated_in_shard");
            return Ok(idx);
        }

        // Cross-shard stealing in fixed shard order. The held coordinator
        // serializes the whole remove-then-insert pair, which is the one
        // place two shard locks overlap.
        for donor_idx in 0..self.shards.len() {
            if donor_idx == home {
                continue;
            }
            let mut donor = self.shards[donor_idx].lock();
            let Some((pos, idx)) = self.victim_in(&donor) else {
                continue;
            };
            let _ = donor.order.remove(pos);
            drop(donor);
            home_shard.order.push_front(idx);
            let evicted = self.rewrite_slot(idx, key);
            drop(home_shard);
            drop(coordinator);
            self.counters.steals.fetch_add(1, Ordering::Relaxed);
            if evicted {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            debug!(%key, slot = idx, donor = donor_idx, home, evicted, "slot_stolen");
            return Ok(idx);
        }

        drop(home_shard);
        drop(coordinator);
        error!(%key, total_slots = self.slots.len(), "cache exhausted: every slot is referenced");
        Err(CacheError::Exhausted {
            total_slots: self.slots.len(),
        })
    }

    /// Scan a shard for `key`; on a match, take a reference.
    fn scan_shard(&self, shard: &ShardState, key: BlockKey) -> Option<usize> {
        for &idx in &shard.order {
            let mut meta = self.slots[idx].meta.lock();
            if meta.key == Some(key) {
                meta.refcount += 1;
                return Some(idx);
            }
        }
        None
    }

    /// Lowest-stamp free slot in a shard, as (position, slot index).
    ///
    /// A never-used slot (sentinel stamp) is necessarily oldest, so the
    /// scan stops as soon as the running best is one.
    fn victim_in(&self, shard: &ShardState) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, FreeStamp)> = None;
        for (pos, &idx) in shard.order.iter().enumerate() {
            let meta = self.slots[idx].meta.lock();
            if meta.refcount != 0 {
                continue;
            }
            if best.is_none_or(|(_, _, stamp)| meta.free_stamp < stamp) {
                best = Some((pos, idx, meta.free_stamp));
            }
            if best.is_some_and(|(_, _, stamp)| stamp.is_never_used()) {
                break;
            }
        }
        best.map(|(pos, idx, _)| (pos, idx))
    }

    /// Repurpose a free slot for `key`. Returns whether a previously
    /// cached block was discarded.
    fn rewrite_slot(&self, idx: usize, key: BlockKey) -> bool {
        let mut meta = self.slots[idx].meta.lock();
        let had_identity = meta.key.is_some();
        meta.key = Some(key);
        meta.valid = false;
        meta.refcount = 1;
        meta.pins = 0;
        had_identity
    }

    /// Drop one reference; on the last, stamp the slot freshly free.
    fn release_slot(&self, idx: usize) {
        let slot = &self.slots[idx];
        let key = slot.meta.lock().key;
        let Some(key) = key else {
            debug_assert!(false, "released slot has no identity");
            return;
        };

        let shard = self.shards[self.shard_index(key.block)].lock();
        let mut meta = slot.meta.lock();
        debug_assert!(meta.refcount > 0, "refcount underflow on release");
        meta.refcount = meta.refcount.saturating_sub(1);
        if meta.refcount == 0 {
            meta.free_stamp = FreeStamp(self.free_clock.fetch_add(1, Ordering::SeqCst));
            trace!(%key, slot = idx, stamp = meta.free_stamp.0, "slot_freed");
        }
        drop(meta);
        drop(shard);
    }

    /// Map a block number to its home shard.
    #[inline]
    fn shard_index(&self, block: BlockNumber) -> usize {
        let shard_count = u64::try_from(self.shards.len()).expect("shard count must fit in u64");
        usize::try_from(block.0 % shard_count).expect("remainder must fit in usize")
    }
}

// ── Guard ──────────────────────────────────────────────────────────────

/// Exclusive handle to one cached block.
///
/// The guard *is* the slot's held exclusive lock: while it exists, no other
/// thread can touch the payload, and the slot cannot be evicted (the guard
/// owns a reference). Dropping the guard releases the lock, wakes the next
/// waiter for this exact slot, and on the last reference stamps the slot
/// freshly free.
#[must_use = "dropping the guard releases the block"]
pub struct BlockGuard<'a, S: BlockStore> {
    cache: &'a BufCache<S>,
    slot: usize,
    key: BlockKey,
    // `Some` until drop; taken first so the payload lock is released
    // before bookkeeping runs.
    payload: Option<MutexGuard<'a, Box<[u8]>>>,
}

impl<S: BlockStore> BlockGuard<'_, S> {
    #[must_use]
    pub fn key(&self) -> BlockKey {
        self.key
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.key.device
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.key.block
    }

    /// Pool index of the slot backing this guard. Stable for the lifetime
    /// of the cache; useful for identity assertions.
    #[must_use]
    pub fn slot_index(&self) -> SlotIndex {
        SlotIndex(self.slot)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_ref().expect("payload lock must be held")
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.payload.as_mut().expect("payload lock must be held")
    }

    /// Synchronously persist the payload through the store.
    ///
    /// Does not alter the reference count or recency.
    pub fn write(&self) -> Result<()> {
        self.cache.store.store(self.key, self.bytes())
    }

    /// Release the block. Equivalent to dropping the guard; provided so
    /// call sites can name the release explicitly.
    pub fn release(self) {}
}

impl<S: BlockStore> Drop for BlockGuard<'_, S> {
    fn drop(&mut self) {
        // Unlock the payload first so the next waiter can proceed while
        // bookkeeping takes the shard lock.
        self.payload.take();
        self.cache.release_slot(self.slot);
    }
}

impl<S: BlockStore> fmt::Debug for BlockGuard<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGuard")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}
