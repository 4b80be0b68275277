//! Bucketed buffer pool with per-domain memory caps.
//!
//! The pool keeps one array of [`Bucket`]s per memory domain, indexed by a
//! monotonic size-to-bucket mapping ([`Sizing`]). Acquisition rounds the
//! requested size up to the bucket's capacity class; out-of-range sizes fall
//! back to unpooled buffers of exactly the requested size.
//!
//! Releases are checked against the domain's configured memory cap: every
//! release that installs an entry, and every [`CAP_CHECK_INTERVAL`]th release
//! regardless, totals the idle bytes and runs the evictor when over cap. Only
//! one evictor runs at a time per domain (CAS-guarded); it starts at a random
//! bucket and rotates once around, destroying one idle entry per bucket until
//! the excess is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketStats, Release};
use crate::buffer::{PooledBuf, Storage};

/// Release count between periodic memory-cap checks.
pub const CAP_CHECK_INTERVAL: u64 = 100;

/// Memory domain a buffer is accounted against.
///
/// Domains share the allocation path but carry independent bucket arrays and
/// memory caps, so transport-mapped buffers can be budgeted separately from
/// ordinary heap scratch space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Ordinary heap buffers.
    Heap,
    /// Buffers reserved for transport-mapped I/O.
    Mapped,
}

/// Size-to-bucket index mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    /// Capacity classes at linear multiples of `factor`.
    Linear { factor: usize },
    /// Capacity classes at powers of two.
    PowerOfTwo,
}

impl Sizing {
    /// Bucket index for a requested size (`size >= 1`).
    pub fn index_for(&self, size: usize) -> usize {
        match self {
            Sizing::Linear { factor } => (size - 1) / factor,
            Sizing::PowerOfTwo => {
                if size <= 1 {
                    0
                } else {
                    (usize::BITS - (size - 1).leading_zeros()) as usize
                }
            }
        }
    }

    /// Capacity of the bucket at `index`.
    pub fn capacity_of(&self, index: usize) -> usize {
        match self {
            Sizing::Linear { factor } => (index + 1) * factor,
            Sizing::PowerOfTwo => 1 << index,
        }
    }
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Smallest size served from a bucket; smaller requests are unpooled.
    pub min_capacity: usize,
    /// Largest size served from a bucket; larger requests are unpooled.
    pub max_capacity: usize,
    /// Size-to-bucket mapping.
    pub sizing: Sizing,
    /// Maximum idle entries per bucket (primary + secondary tiers).
    pub max_bucket_entries: usize,
    /// Idle-byte cap for the heap domain (0 = unlimited).
    pub max_heap_bytes: usize,
    /// Idle-byte cap for the mapped domain (0 = unlimited).
    pub max_mapped_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_capacity: crate::DEFAULT_MAX_CAPACITY,
            sizing: Sizing::Linear {
                factor: crate::DEFAULT_FACTOR,
            },
            max_bucket_entries: 128,
            max_heap_bytes: 0,
            max_mapped_bytes: 0,
        }
    }
}

/// Back-pointer from a checked-out buffer to its bucket.
#[derive(Debug)]
pub(crate) struct Home {
    domain: Weak<DomainPool>,
    bucket: usize,
    generation: u64,
}

/// Buckets and cap accounting for one memory domain.
#[derive(Debug)]
pub(crate) struct DomainPool {
    domain: Domain,
    sizing: Sizing,
    min_capacity: usize,
    max_capacity: usize,
    buckets: Box<[Bucket]>,
    max_bytes: usize,
    evicting: AtomicBool,
    release_count: AtomicU64,
    /// Unpooled acquisitions keyed by the rounded capacity class.
    no_bucket: Mutex<HashMap<usize, u64>>,
}

impl DomainPool {
    fn new(domain: Domain, config: &PoolConfig, max_bytes: usize) -> Arc<Self> {
        let count = config.sizing.index_for(config.max_capacity) + 1;
        let buckets = (0..count)
            .map(|i| Bucket::new(config.sizing.capacity_of(i), config.max_bucket_entries))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            domain,
            sizing: config.sizing,
            min_capacity: config.min_capacity,
            max_capacity: config.max_capacity,
            buckets,
            max_bytes,
            evicting: AtomicBool::new(false),
            release_count: AtomicU64::new(0),
            no_bucket: Mutex::new(HashMap::new()),
        })
    }

    fn acquire(self: &Arc<Self>, size: usize) -> PooledBuf {
        if size < self.min_capacity || size > self.max_capacity {
            let key = self.sizing.capacity_of(self.sizing.index_for(size.max(1)));
            *self.no_bucket.lock().entry(key).or_insert(0) += 1;
            return PooledBuf::unpooled(Storage::new(size));
        }

        let index = self.sizing.index_for(size.max(1));
        let bucket = &self.buckets[index];
        let storage = bucket
            .acquire()
            .unwrap_or_else(|| Storage::new(bucket.capacity()));
        let home = Home {
            domain: Arc::downgrade(self),
            bucket: index,
            generation: bucket.generation(),
        };
        PooledBuf::pooled(storage, home)
    }

    fn idle_bytes(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.idle() * b.capacity())
            .sum()
    }

    /// Cap check on the release path. `installed` is true when this release
    /// put an entry back into a bucket.
    fn released(&self, installed: bool) {
        let count = self.release_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_bytes == 0 {
            return;
        }
        if installed || count % CAP_CHECK_INTERVAL == 0 {
            let total = self.idle_bytes();
            if total > self.max_bytes {
                self.evict(total - self.max_bytes);
            }
        }
    }

    /// Destroys idle entries until `excess` bytes are reclaimed or every
    /// bucket has been visited once. Only one evictor runs at a time.
    fn evict(&self, excess: usize) {
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut remaining = excess as i64;
        let mut reclaimed = 0usize;
        let start = random_index(self.buckets.len());
        for offset in 0..self.buckets.len() {
            if remaining <= 0 {
                break;
            }
            let bucket = &self.buckets[(start + offset) % self.buckets.len()];
            if bucket.evict_one() {
                remaining -= bucket.capacity() as i64;
                reclaimed += bucket.capacity();
            }
        }
        self.evicting.store(false, Ordering::Release);

        debug!(
            domain = ?self.domain,
            excess,
            reclaimed,
            "buffer pool eviction"
        );
        if remaining > 0 {
            warn!(
                domain = ?self.domain,
                over_by = remaining,
                "buffer pool still over memory cap after eviction pass"
            );
        }
    }

    fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
        self.release_count.store(0, Ordering::Relaxed);
        self.no_bucket.lock().clear();
    }

    fn stats(&self) -> DomainStats {
        let mut no_bucket: Vec<(usize, u64)> =
            self.no_bucket.lock().iter().map(|(k, v)| (*k, *v)).collect();
        no_bucket.sort_unstable();
        DomainStats {
            domain: self.domain,
            max_bytes: self.max_bytes,
            idle_bytes: self.idle_bytes(),
            buckets: self.buckets.iter().map(|b| b.stats()).collect(),
            no_bucket_acquires: no_bucket,
        }
    }
}

/// Re-pools a buffer's storage on its final release.
pub(crate) fn return_storage(home: Home, storage: Storage) {
    let Some(domain) = home.domain.upgrade() else {
        return;
    };
    let bucket = &domain.buckets[home.bucket];
    let installed = matches!(
        bucket.release(storage, home.generation),
        Release::Installed
    );
    domain.released(installed);
}

fn random_index(len: usize) -> usize {
    let mut seed = [0u8; 8];
    getrandom::getrandom(&mut seed).expect("RNG failed");
    (u64::from_le_bytes(seed) % len.max(1) as u64) as usize
}

/// Point-in-time view of one memory domain.
#[derive(Debug, Clone)]
pub struct DomainStats {
    /// Which domain this snapshot covers.
    pub domain: Domain,
    /// Configured idle-byte cap (0 = unlimited).
    pub max_bytes: usize,
    /// Idle bytes currently pooled.
    pub idle_bytes: usize,
    /// Per-bucket counters, ordered by capacity class.
    pub buckets: Vec<BucketStats>,
    /// Unpooled acquisitions keyed by rounded capacity, sorted by key.
    pub no_bucket_acquires: Vec<(usize, u64)>,
}

/// A shared pool of fixed-capacity byte buffers.
///
/// # Example
/// ```
/// use shroud_core::pool::{BufferPool, Domain, PoolConfig};
///
/// let pool = BufferPool::new(PoolConfig::default());
/// let mut buf = pool.acquire(4096, Domain::Heap);
/// buf.append(b"hello");
/// // Returned to its bucket when dropped.
/// ```
pub struct BufferPool {
    heap: Arc<DomainPool>,
    mapped: Arc<DomainPool>,
}

impl BufferPool {
    /// Creates a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            heap: DomainPool::new(Domain::Heap, &config, config.max_heap_bytes),
            mapped: DomainPool::new(Domain::Mapped, &config, config.max_mapped_bytes),
        })
    }

    /// Creates a pool with default sizing (1 KB linear classes up to 64 KB).
    pub fn with_defaults() -> Arc<Self> {
        Self::new(PoolConfig::default())
    }

    fn domain(&self, domain: Domain) -> &Arc<DomainPool> {
        match domain {
            Domain::Heap => &self.heap,
            Domain::Mapped => &self.mapped,
        }
    }

    /// Returns a buffer of capacity >= `size` drawn from the matching bucket,
    /// or a freshly allocated one. Sizes outside the configured range yield
    /// unpooled buffers of exactly `size` bytes.
    pub fn acquire(&self, size: usize, domain: Domain) -> PooledBuf {
        self.domain(domain).acquire(size)
    }

    /// Withdraws `buf` from circulation: its storage is destroyed on final
    /// release instead of returning to a bucket.
    pub fn remove_and_release(&self, buf: PooledBuf) {
        if let Some(home) = buf.take_home() {
            if let Some(domain) = home.domain.upgrade() {
                domain.buckets[home.bucket].record_remove();
            }
        }
        drop(buf);
    }

    /// Empties every bucket and zeroes all counters. Buffers already handed
    /// out are destroyed on release rather than re-pooled.
    pub fn clear(&self) {
        self.heap.clear();
        self.mapped.clear();
    }

    /// Snapshot of one domain's buckets and counters.
    pub fn stats(&self, domain: Domain) -> DomainStats {
        self.domain(domain).stats()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("heap_idle_bytes", &self.heap.idle_bytes())
            .field("mapped_idle_bytes", &self.mapped.idle_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(factor: usize, max_capacity: usize, max_heap: usize) -> Arc<BufferPool> {
        BufferPool::new(PoolConfig {
            min_capacity: 1,
            max_capacity,
            sizing: Sizing::Linear { factor },
            max_bucket_entries: 16,
            max_heap_bytes: max_heap,
            max_mapped_bytes: 0,
        })
    }

    #[test]
    fn test_linear_mapping() {
        let pool = pool_with(1024, 16384, 0);

        assert_eq!(pool.acquire(1, Domain::Heap).capacity(), 1024);
        assert_eq!(pool.acquire(1024, Domain::Heap).capacity(), 1024);
        assert_eq!(pool.acquire(1025, Domain::Heap).capacity(), 2048);
        assert_eq!(pool.acquire(16384, Domain::Heap).capacity(), 16384);

        // Above the range: unpooled, exact size.
        let big = pool.acquire(16385, Domain::Heap);
        assert_eq!(big.capacity(), 16385);
        assert!(!big.is_pooled());
    }

    #[test]
    fn test_power_of_two_mapping() {
        let pool = BufferPool::new(PoolConfig {
            sizing: Sizing::PowerOfTwo,
            max_capacity: 16384,
            ..PoolConfig::default()
        });
        assert_eq!(pool.acquire(1, Domain::Heap).capacity(), 1);
        assert_eq!(pool.acquire(3, Domain::Heap).capacity(), 4);
        assert_eq!(pool.acquire(1024, Domain::Heap).capacity(), 1024);
        assert_eq!(pool.acquire(1025, Domain::Heap).capacity(), 2048);
    }

    #[test]
    fn test_smallest_sufficient_capacity() {
        let pool = pool_with(1024, 16384, 0);
        for size in [1, 512, 1024, 1500, 2048, 4097, 16000, 16384] {
            let buf = pool.acquire(size, Domain::Heap);
            assert!(buf.capacity() >= size);
            // The class below would not fit.
            assert!(buf.capacity() < size + 1024);
        }
    }

    #[test]
    fn test_release_returns_to_bucket() {
        let pool = pool_with(1024, 16384, 0);
        drop(pool.acquire(1000, Domain::Heap));

        let stats = pool.stats(Domain::Heap);
        assert_eq!(stats.idle_bytes, 1024);
        assert_eq!(stats.buckets[0].idle, 1);
        assert_eq!(stats.buckets[0].releases, 1);

        // Next acquisition of the same class is a hit.
        drop(pool.acquire(512, Domain::Heap));
        assert_eq!(pool.stats(Domain::Heap).buckets[0].hits, 1);
    }

    #[test]
    fn test_domains_are_independent() {
        let pool = pool_with(1024, 16384, 0);
        drop(pool.acquire(100, Domain::Heap));
        drop(pool.acquire(100, Domain::Mapped));
        assert_eq!(pool.stats(Domain::Heap).idle_bytes, 1024);
        assert_eq!(pool.stats(Domain::Mapped).idle_bytes, 1024);
    }

    #[test]
    fn test_no_bucket_counter() {
        let pool = pool_with(1024, 16384, 0);
        drop(pool.acquire(20000, Domain::Heap));
        drop(pool.acquire(20001, Domain::Heap));

        let stats = pool.stats(Domain::Heap);
        // Both round to the 20480 class.
        assert_eq!(stats.no_bucket_acquires, vec![(20480, 2)]);
    }

    #[test]
    fn test_eviction_enforces_cap() {
        // Ten 1024-byte entries fit under the cap; the eleventh release
        // triggers the evictor.
        let pool = pool_with(1024, 16384, 10_000);
        let bufs: Vec<_> = (0..11)
            .map(|_| pool.acquire(1024, Domain::Heap))
            .collect();
        for buf in bufs {
            drop(buf);
        }

        let stats = pool.stats(Domain::Heap);
        assert!(stats.idle_bytes <= 10_000 + 1024, "idle = {}", stats.idle_bytes);
        assert!(stats.buckets[0].evicts > 0);
    }

    #[test]
    fn test_cap_overshoot_bounded_by_one_class() {
        let pool = pool_with(1024, 4096, 8_000);
        let bufs: Vec<_> = (0..6).map(|_| pool.acquire(4096, Domain::Heap)).collect();
        for buf in bufs {
            drop(buf);
        }
        let stats = pool.stats(Domain::Heap);
        assert!(stats.idle_bytes <= 8_000 + 4096, "idle = {}", stats.idle_bytes);
    }

    #[test]
    fn test_single_evictor_flag_blocks_reentry() {
        let pool = pool_with(1024, 16384, 1);
        let dp = Arc::clone(&pool.heap);
        for _ in 0..4 {
            drop(pool.acquire(1024, Domain::Heap));
        }

        // Hold the evictor flag; a release that would evict must not run a
        // second eviction pass concurrently.
        dp.evicting.store(true, Ordering::Release);
        let before = dp.idle_bytes();
        drop(pool.acquire(1024, Domain::Heap));
        assert!(dp.idle_bytes() >= before);
        dp.evicting.store(false, Ordering::Release);
    }

    #[test]
    fn test_clear_discards_in_flight_buffers() {
        let pool = pool_with(1024, 16384, 0);
        let buf = pool.acquire(1024, Domain::Heap);
        pool.clear();
        drop(buf);

        // Released after clear: destroyed, not re-pooled.
        assert_eq!(pool.stats(Domain::Heap).idle_bytes, 0);
    }

    #[test]
    fn test_remove_and_release() {
        let pool = pool_with(1024, 16384, 0);
        let buf = pool.acquire(1024, Domain::Heap);
        pool.remove_and_release(buf);

        let stats = pool.stats(Domain::Heap);
        assert_eq!(stats.idle_bytes, 0);
        assert_eq!(stats.buckets[0].removes, 1);
    }

    #[test]
    fn test_retained_buffer_returns_on_final_release() {
        let pool = pool_with(1024, 16384, 0);
        let buf = pool.acquire(1024, Domain::Heap);
        let retention = buf.retain();
        drop(buf);

        // Still held by the retention token.
        assert_eq!(pool.stats(Domain::Heap).idle_bytes, 0);
        drop(retention);
        assert_eq!(pool.stats(Domain::Heap).idle_bytes, 1024);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = pool_with(1024, 16384, 64 * 1024);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let mut buf = pool.acquire(1 + (i % 8) * 1024, Domain::Heap);
                    buf.append(b"data");
                    drop(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let stats = pool.stats(Domain::Heap);
        let acquires: u64 = stats.buckets.iter().map(|b| b.acquires).sum();
        let releases: u64 = stats.buckets.iter().map(|b| b.releases).sum();
        assert_eq!(acquires, 2000);
        assert_eq!(releases, 2000);
    }
}
