//! Pooled, refcounted byte buffers.
//!
//! A [`PooledBuf`] is a fixed-capacity byte region with read/write cursors,
//! handed out by [`BufferPool`](crate::pool::BufferPool). The owning handle has
//! direct slice access and implements [`bytes::Buf`] over the readable region.
//! Dropping the handle releases the buffer; when the reference count reaches
//! zero the storage is reset and returned to the bucket it came from (or to the
//! heap for unpooled buffers).
//!
//! [`PooledBuf::retain`] hands out [`BufRetention`] tokens that pin the storage
//! past the owner handle's drop: the storage is parked in a shared cell and the
//! final release, whichever holder performs it, re-pools it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Buf;
use parking_lot::Mutex;

use crate::pool::Home;

/// Fixed-capacity byte storage with head/tail cursors.
///
/// Bytes in `[head, tail)` are readable; `[tail, capacity)` is writable space.
#[derive(Debug)]
pub(crate) struct Storage {
    bytes: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Storage {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Clears both cursors so the full capacity is writable again.
    pub(crate) fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// Shared cell tying a buffer checkout to its owning bucket.
#[derive(Debug)]
struct BufShared {
    /// Holder count; the final release returns the storage.
    refs: AtomicUsize,
    /// Back-pointer into the owning bucket; `None` for unpooled buffers and
    /// for buffers severed via `remove_and_release`.
    home: Mutex<Option<Home>>,
    /// Storage parked here when the owner handle drops before the last
    /// retention token.
    parked: Mutex<Option<Storage>>,
}

fn release_shared(shared: &BufShared, storage: Option<Storage>) {
    if let Some(storage) = storage {
        *shared.parked.lock() = Some(storage);
    }
    if shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        if let Some(mut storage) = shared.parked.lock().take() {
            storage.reset();
            match shared.home.lock().take() {
                Some(home) => crate::pool::return_storage(home, storage),
                None => drop(storage),
            }
        }
    }
}

/// A byte buffer checked out of a [`BufferPool`](crate::pool::BufferPool).
///
/// The handle owns the storage exclusively; dropping it releases one
/// reference. Read with the [`Buf`] cursor methods or [`take_into`]; write
/// with [`append`] or the [`space_mut`]/[`add_filled`] pair.
///
/// [`take_into`]: PooledBuf::take_into
/// [`append`]: PooledBuf::append
/// [`space_mut`]: PooledBuf::space_mut
/// [`add_filled`]: PooledBuf::add_filled
pub struct PooledBuf {
    storage: Option<Storage>,
    shared: Arc<BufShared>,
}

impl PooledBuf {
    pub(crate) fn pooled(storage: Storage, home: Home) -> Self {
        Self::checkout(storage, Some(home))
    }

    pub(crate) fn unpooled(storage: Storage) -> Self {
        Self::checkout(storage, None)
    }

    fn checkout(storage: Storage, home: Option<Home>) -> Self {
        Self {
            storage: Some(storage),
            shared: Arc::new(BufShared {
                refs: AtomicUsize::new(1),
                home: Mutex::new(home),
                parked: Mutex::new(None),
            }),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map(|s| s.capacity()).unwrap_or(0)
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.storage.as_ref().map(|s| s.tail - s.head).unwrap_or(0)
    }

    /// Returns true if there are no readable bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writable bytes left after the tail cursor.
    pub fn space(&self) -> usize {
        self.storage
            .as_ref()
            .map(|s| s.capacity() - s.tail)
            .unwrap_or(0)
    }

    /// True when the readable region spans the whole capacity.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// The writable region after the tail cursor. Pair with
    /// [`add_filled`](PooledBuf::add_filled) to commit bytes written into it.
    pub fn space_mut(&mut self) -> &mut [u8] {
        match self.storage.as_mut() {
            Some(s) => &mut s.bytes[s.tail..],
            None => &mut [],
        }
    }

    /// Commits `n` bytes written into [`space_mut`](PooledBuf::space_mut).
    pub fn add_filled(&mut self, n: usize) {
        if let Some(s) = self.storage.as_mut() {
            assert!(s.tail + n <= s.bytes.len(), "filled past capacity");
            s.tail += n;
        }
    }

    /// Copies as much of `src` as fits, advancing the tail cursor. Returns the
    /// number of bytes copied.
    pub fn append(&mut self, src: &[u8]) -> usize {
        match self.storage.as_mut() {
            Some(s) => {
                let n = src.len().min(s.capacity() - s.tail);
                s.bytes[s.tail..s.tail + n].copy_from_slice(&src[..n]);
                s.tail += n;
                n
            }
            None => 0,
        }
    }

    /// Copies readable bytes into `dst`, advancing the head cursor. Returns
    /// the number of bytes copied. Cursors rewind to zero once drained.
    pub fn take_into(&mut self, dst: &mut [u8]) -> usize {
        match self.storage.as_mut() {
            Some(s) => {
                let n = dst.len().min(s.tail - s.head);
                dst[..n].copy_from_slice(&s.bytes[s.head..s.head + n]);
                s.head += n;
                if s.head == s.tail {
                    s.reset();
                }
                n
            }
            None => 0,
        }
    }

    /// Moves the readable region to the front, reclaiming consumed space.
    pub fn compact(&mut self) {
        if let Some(s) = self.storage.as_mut() {
            if s.head > 0 {
                s.bytes.copy_within(s.head..s.tail, 0);
                s.tail -= s.head;
                s.head = 0;
            }
        }
    }

    /// Drops all readable bytes and rewinds both cursors.
    pub fn clear(&mut self) {
        if let Some(s) = self.storage.as_mut() {
            s.reset();
        }
    }

    /// Increments the reference count and returns a retention token pinning
    /// the storage until every holder has released.
    pub fn retain(&self) -> BufRetention {
        let prev = self.shared.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain from a released buffer");
        BufRetention {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// True if the buffer will return to a bucket on final release.
    pub fn is_pooled(&self) -> bool {
        self.shared.home.lock().is_some()
    }

    /// Severs the bucket back-pointer so the final release destroys the
    /// buffer instead of re-pooling it.
    pub(crate) fn take_home(&self) -> Option<Home> {
        self.shared.home.lock().take()
    }
}

impl Buf for PooledBuf {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        match self.storage.as_ref() {
            Some(s) => &s.bytes[s.head..s.tail],
            None => &[],
        }
    }

    fn advance(&mut self, cnt: usize) {
        if let Some(s) = self.storage.as_mut() {
            assert!(s.head + cnt <= s.tail, "advanced past readable bytes");
            s.head += cnt;
            if s.head == s.tail {
                s.reset();
            }
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        release_shared(&self.shared, self.storage.take());
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Lifetime token produced by [`PooledBuf::retain`].
///
/// Holds one reference; the buffer's storage is not returned to its bucket
/// until every token and the owner handle have dropped.
pub struct BufRetention {
    shared: Arc<BufShared>,
}

impl BufRetention {
    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }
}

impl Clone for BufRetention {
    fn clone(&self) -> Self {
        let prev = self.shared.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain from a released buffer");
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for BufRetention {
    fn drop(&mut self) {
        release_shared(&self.shared, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpooled(capacity: usize) -> PooledBuf {
        PooledBuf::unpooled(Storage::new(capacity))
    }

    #[test]
    fn test_cursor_roundtrip() {
        let mut buf = unpooled(16);
        assert_eq!(buf.capacity(), 16);
        assert!(buf.is_empty());
        assert_eq!(buf.space(), 16);

        assert_eq!(buf.append(b"hello"), 5);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.chunk(), b"hello");

        let mut out = [0u8; 3];
        assert_eq!(buf.take_into(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(buf.chunk(), b"lo");

        // Draining rewinds the cursors.
        let mut rest = [0u8; 8];
        assert_eq!(buf.take_into(&mut rest), 2);
        assert!(buf.is_empty());
        assert_eq!(buf.space(), 16);
    }

    #[test]
    fn test_append_caps_at_capacity() {
        let mut buf = unpooled(4);
        assert_eq!(buf.append(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.append(b"x"), 0);
    }

    #[test]
    fn test_space_mut_commit() {
        let mut buf = unpooled(8);
        buf.space_mut()[..3].copy_from_slice(b"xyz");
        buf.add_filled(3);
        assert_eq!(buf.chunk(), b"xyz");
        assert_eq!(buf.space(), 5);
    }

    #[test]
    fn test_compact_reclaims_consumed_space() {
        let mut buf = unpooled(8);
        buf.append(b"abcdefgh");
        buf.advance(6);
        assert_eq!(buf.space(), 0);
        buf.compact();
        assert_eq!(buf.chunk(), b"gh");
        assert_eq!(buf.space(), 6);
    }

    #[test]
    fn test_refcount_retain_release() {
        let buf = unpooled(8);
        assert_eq!(buf.ref_count(), 1);

        let r1 = buf.retain();
        let r2 = r1.clone();
        assert_eq!(buf.ref_count(), 3);

        drop(r1);
        assert_eq!(buf.ref_count(), 2);
        drop(buf);
        // Storage survives parked until the last retention drops.
        assert_eq!(r2.ref_count(), 1);
        drop(r2);
    }
}
