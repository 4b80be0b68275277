//! Capacity-class buckets.
//!
//! A bucket stores idle buffers of exactly one capacity. Storage is split into
//! a primary fast sub-pool, capped at a small constant to keep lock contention
//! low on typical thread counts, and an optional secondary sub-pool holding
//! the configured overflow. Acquisition and release try the primary first;
//! eviction drains the secondary first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer::Storage;

/// Maximum entries in a bucket's primary sub-pool.
pub const SUBPOOL_FAST_MAX: usize = 64;

/// One tier of idle storage within a bucket.
#[derive(Debug)]
struct SubPool {
    limit: usize,
    idle: Mutex<VecDeque<Storage>>,
}

impl SubPool {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    fn pop(&self) -> Option<Storage> {
        self.idle.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.idle.lock().len()
    }

    fn drain(&self) -> usize {
        let mut idle = self.idle.lock();
        let n = idle.len();
        idle.clear();
        n
    }
}

/// Outcome of handing a buffer back to its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The entry was installed into a sub-pool.
    Installed,
    /// Both sub-pools were full; the entry was destroyed.
    Dropped,
    /// The bucket was cleared since the buffer was acquired; destroyed.
    Stale,
}

/// Idle storage and counters for one capacity class.
#[derive(Debug)]
pub(crate) struct Bucket {
    capacity: usize,
    primary: SubPool,
    secondary: Option<SubPool>,
    /// Bumped by `clear()`; buffers released under an older generation are
    /// destroyed rather than re-pooled.
    generation: AtomicU64,
    acquires: AtomicU64,
    hits: AtomicU64,
    releases: AtomicU64,
    non_pooled: AtomicU64,
    evicts: AtomicU64,
    removes: AtomicU64,
}

impl Bucket {
    pub(crate) fn new(capacity: usize, max_entries: usize) -> Self {
        let primary = max_entries.min(SUBPOOL_FAST_MAX);
        let overflow = max_entries.saturating_sub(primary);
        Self {
            capacity,
            primary: SubPool::new(primary),
            secondary: (overflow > 0).then(|| SubPool::new(overflow)),
            generation: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            non_pooled: AtomicU64::new(0),
            evicts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Pops an idle entry, counting the acquisition either way.
    pub(crate) fn acquire(&self) -> Option<Storage> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        let found = self
            .primary
            .pop()
            .or_else(|| self.secondary.as_ref().and_then(|s| s.pop()));
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Hands a reset buffer back. The generation captured at acquisition must
    /// still match, checked under the sub-pool lock so a concurrent `clear()`
    /// cannot leave a stale entry behind.
    pub(crate) fn release(&self, storage: Storage, generation: u64) -> Release {
        debug_assert_eq!(storage.capacity(), self.capacity);
        self.releases.fetch_add(1, Ordering::Relaxed);

        let storage = {
            let mut idle = self.primary.idle.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                return Release::Stale;
            }
            if idle.len() < self.primary.limit {
                idle.push_back(storage);
                return Release::Installed;
            }
            storage
        };

        if let Some(secondary) = &self.secondary {
            let mut idle = secondary.idle.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                return Release::Stale;
            }
            if idle.len() < secondary.limit {
                idle.push_back(storage);
                return Release::Installed;
            }
        }

        self.non_pooled.fetch_add(1, Ordering::Relaxed);
        Release::Dropped
    }

    /// Removes and destroys one idle entry, secondary tier first. Returns
    /// true if an entry was evicted.
    pub(crate) fn evict_one(&self) -> bool {
        let evicted = self
            .secondary
            .as_ref()
            .and_then(|s| s.pop())
            .or_else(|| self.primary.pop());
        match evicted {
            Some(_) => {
                self.evicts.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Counts a buffer withdrawn from circulation via
    /// [`BufferPool::remove_and_release`](crate::pool::BufferPool::remove_and_release).
    pub(crate) fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Idle entries currently stored.
    pub(crate) fn idle(&self) -> usize {
        self.primary.len() + self.secondary.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    /// Bumps the generation and destroys all idle entries. Buffers in flight
    /// observe the generation mismatch on release and are destroyed too.
    pub(crate) fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.primary.drain();
        if let Some(secondary) = &self.secondary {
            secondary.drain();
        }
        self.acquires.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.releases.store(0, Ordering::Relaxed);
        self.non_pooled.store(0, Ordering::Relaxed);
        self.evicts.store(0, Ordering::Relaxed);
        self.removes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> BucketStats {
        let acquires = self.acquires.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let releases = self.releases.load(Ordering::Relaxed);
        BucketStats {
            capacity: self.capacity,
            in_use: acquires.saturating_sub(releases),
            idle: self.idle() as u64,
            acquires,
            hits,
            releases,
            hit_rate: if acquires > 0 {
                hits as f64 / acquires as f64
            } else {
                0.0
            },
            non_pooled: self.non_pooled.load(Ordering::Relaxed),
            evicts: self.evicts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one bucket.
#[derive(Debug, Clone)]
pub struct BucketStats {
    /// Capacity class in bytes.
    pub capacity: usize,
    /// Buffers handed out and not yet released.
    pub in_use: u64,
    /// Idle entries currently pooled.
    pub idle: u64,
    /// Total acquisition attempts.
    pub acquires: u64,
    /// Acquisitions served from the pool.
    pub hits: u64,
    /// Buffers handed back (pooled or not).
    pub releases: u64,
    /// Hit rate (0.0 - 1.0).
    pub hit_rate: f64,
    /// Releases dropped because both sub-pools were full.
    pub non_pooled: u64,
    /// Entries destroyed by the evictor.
    pub evicts: u64,
    /// Buffers withdrawn from circulation.
    pub removes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_miss_then_hit() {
        let bucket = Bucket::new(1024, 4);
        assert!(bucket.acquire().is_none());

        let generation = bucket.generation();
        assert_eq!(
            bucket.release(Storage::new(1024), generation),
            Release::Installed
        );
        assert!(bucket.acquire().is_some());

        let stats = bucket.stats();
        assert_eq!(stats.acquires, 2);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_release_overflows_to_secondary() {
        let bucket = Bucket::new(64, SUBPOOL_FAST_MAX + 2);
        let generation = bucket.generation();
        for _ in 0..SUBPOOL_FAST_MAX + 2 {
            assert_eq!(
                bucket.release(Storage::new(64), generation),
                Release::Installed
            );
        }
        assert_eq!(bucket.idle(), SUBPOOL_FAST_MAX + 2);

        // Both tiers full now.
        assert_eq!(
            bucket.release(Storage::new(64), generation),
            Release::Dropped
        );
        assert_eq!(bucket.stats().non_pooled, 1);
    }

    #[test]
    fn test_evict_prefers_secondary() {
        let bucket = Bucket::new(64, SUBPOOL_FAST_MAX + 1);
        let generation = bucket.generation();
        for _ in 0..SUBPOOL_FAST_MAX + 1 {
            bucket.release(Storage::new(64), generation);
        }
        assert!(bucket.evict_one());
        // The single secondary entry went first.
        assert_eq!(bucket.primary.len(), SUBPOOL_FAST_MAX);
        assert_eq!(bucket.stats().evicts, 1);
    }

    #[test]
    fn test_clear_invalidates_in_flight_release() {
        let bucket = Bucket::new(64, 4);
        let generation = bucket.generation();
        bucket.release(Storage::new(64), generation);
        bucket.clear();
        assert_eq!(bucket.idle(), 0);

        // A buffer acquired before the clear comes back stale.
        assert_eq!(bucket.release(Storage::new(64), generation), Release::Stale);
        assert_eq!(bucket.idle(), 0);
    }
}
