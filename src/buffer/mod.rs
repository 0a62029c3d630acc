// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pooled byte buffers for the transmit and receive paths.
//!
//! Each processor thread owns its own [`BufferPool`] instances so the hot
//! acquisition path never crosses a global lock. Buffers are checked out as
//! owned [`ByteBuf`] values and return themselves to their home pool when
//! dropped (or via an explicit [`BufferPool::release`]).
//!
//! Pool exhaustion is backpressure, never a crash: acquisition retries a
//! bounded number of times, yielding the scheduler between attempts, then
//! reports exhaustion through a counter the caller can observe.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Retries before an acquisition is reported as exhausted.
const ACQUIRE_RETRIES: usize = 3;

// ============================================================================
// ByteBuf
// ============================================================================

/// An owned byte buffer with read/write cursors.
///
/// Invariant: `read <= write <= capacity` after every codec call. The
/// mutating methods keep the invariant; a write that would exceed capacity
/// fails with [`crate::Error::BufferOverflow`] instead of growing the
/// allocation.
pub struct ByteBuf {
    data: Vec<u8>,
    read: usize,
    write: usize,
    home: Option<(Arc<PoolInner>, usize)>,
}

impl ByteBuf {
    /// Create a free-standing buffer that is not owned by any pool.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read: 0,
            write: 0,
            home: None,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes between the read and write cursors.
    pub fn remaining(&self) -> usize {
        self.write - self.read
    }

    /// Bytes that can still be written.
    pub fn writable(&self) -> usize {
        self.data.len() - self.write
    }

    /// Whether no unread data remains.
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// The unread portion of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// The unwritten tail, for direct socket reads.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write..]
    }

    /// Current read cursor.
    pub fn read_pos(&self) -> usize {
        self.read
    }

    /// Current write cursor.
    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// Reset both cursors to the start of the buffer.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Advance the write cursor after an external write into `spare_mut`.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.write + n <= self.data.len());
        self.write += n;
    }

    /// Advance the read cursor after consuming `n` bytes.
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(self.read + n <= self.write);
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Move both cursors to `pos` without touching contents.
    ///
    /// Used by the codec to reserve framing headroom before a payload.
    pub fn set_cursors(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.read = pos;
        self.write = pos;
    }

    /// Move only the read cursor (must stay `<= write`).
    pub fn set_read(&mut self, pos: usize) {
        debug_assert!(pos <= self.write);
        self.read = pos;
    }

    /// Write a single byte at the write cursor.
    pub fn put_u8(&mut self, v: u8) -> crate::Result<()> {
        if self.write >= self.data.len() {
            return Err(crate::Error::BufferOverflow);
        }
        self.data[self.write] = v;
        self.write += 1;
        Ok(())
    }

    /// Write a big-endian u16 at the write cursor.
    pub fn put_u16(&mut self, v: u16) -> crate::Result<()> {
        self.put_slice(&v.to_be_bytes())
    }

    /// Write a big-endian u32 at the write cursor.
    pub fn put_u32(&mut self, v: u32) -> crate::Result<()> {
        self.put_slice(&v.to_be_bytes())
    }

    /// Write a byte slice at the write cursor.
    pub fn put_slice(&mut self, src: &[u8]) -> crate::Result<()> {
        if self.write + src.len() > self.data.len() {
            return Err(crate::Error::BufferOverflow);
        }
        self.data[self.write..self.write + src.len()].copy_from_slice(src);
        self.write += src.len();
        Ok(())
    }

    /// Write a length-prefixed (u16) byte string at the write cursor.
    pub fn put_lp_bytes(&mut self, src: &[u8]) -> crate::Result<()> {
        debug_assert!(src.len() <= u16::MAX as usize);
        self.put_u16(src.len() as u16)?;
        self.put_slice(src)
    }

    /// Overwrite bytes at an absolute position already inside the written
    /// region or the reserved prefix. Used to back-fill frame headers.
    pub fn overwrite(&mut self, pos: usize, src: &[u8]) -> crate::Result<()> {
        if pos + src.len() > self.data.len() {
            return Err(crate::Error::BufferOverflow);
        }
        self.data[pos..pos + src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("capacity", &self.data.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for ByteBuf {
    fn drop(&mut self) {
        if let Some((home, class)) = self.home.take() {
            home.put_back(class, std::mem::take(&mut self.data));
        }
    }
}

// ============================================================================
// BufferPool
// ============================================================================

struct PoolClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    /// Buffers handed out and not yet returned.
    outstanding: AtomicUsize,
    capacity: usize,
}

struct PoolInner {
    classes: Vec<PoolClass>,
    exhausted: AtomicU64,
}

impl PoolInner {
    fn put_back(&self, class: usize, mut data: Vec<u8>) {
        let pc = &self.classes[class];
        data.clear();
        data.resize(pc.size, 0);
        pc.free.lock().push(data);
        pc.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Size-class buffer pool.
///
/// One TX pool instance is created per processor thread; RX pools likewise.
/// The submitter path may also draw from a processor's TX pool, so the free
/// lists are individually locked, but no lock is shared between pools.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool from `(buffer_size, buffer_count)` size classes.
    /// Classes must be sorted by ascending size.
    pub fn new(classes: &[(usize, usize)]) -> Self {
        debug_assert!(classes.windows(2).all(|w| w[0].0 < w[1].0));
        let classes = classes
            .iter()
            .map(|&(size, count)| PoolClass {
                size,
                free: Mutex::new((0..count).map(|_| vec![0u8; size]).collect()),
                outstanding: AtomicUsize::new(0),
                capacity: count,
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                classes,
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire one buffer with capacity of at least `size`.
    ///
    /// Tries the best-fit size class first, falling back to larger classes.
    /// When every candidate class is empty the acquisition is retried
    /// [`ACQUIRE_RETRIES`] times with a scheduler yield in between; after
    /// that it either allocates a fresh unpooled buffer (`force`) or reports
    /// exhaustion with `None`.
    pub fn acquire(&self, size: usize, force: bool) -> Option<ByteBuf> {
        for attempt in 0..=ACQUIRE_RETRIES {
            if let Some(buf) = self.try_acquire(size) {
                return Some(buf);
            }
            if attempt < ACQUIRE_RETRIES {
                std::thread::yield_now();
            }
        }

        self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
        if force {
            // Oversubscribe rather than stall the caller.
            return Some(ByteBuf::with_capacity(size.max(self.min_class_size())));
        }
        None
    }

    /// Acquire a batch of same-sized buffers, all-or-nothing.
    pub fn acquire_batch(&self, size: usize, count: usize, force: bool) -> Option<Vec<ByteBuf>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire(size, force) {
                Some(buf) => out.push(buf),
                None => return None, // drops (and thus returns) the partial batch
            }
        }
        Some(out)
    }

    /// Return a buffer to its home pool. Equivalent to dropping it.
    pub fn release(&self, buf: ByteBuf) {
        drop(buf);
    }

    /// Number of acquisitions that found every class empty.
    pub fn exhausted_count(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }

    /// Buffers currently checked out across all classes.
    pub fn outstanding(&self) -> usize {
        self.inner
            .classes
            .iter()
            .map(|c| c.outstanding.load(Ordering::Relaxed))
            .sum()
    }

    fn min_class_size(&self) -> usize {
        self.inner.classes.first().map(|c| c.size).unwrap_or(64)
    }

    fn try_acquire(&self, size: usize) -> Option<ByteBuf> {
        let start = self
            .inner
            .classes
            .iter()
            .position(|c| c.size >= size)?;

        for (idx, pc) in self.inner.classes.iter().enumerate().skip(start) {
            let data = pc.free.lock().pop();
            if let Some(data) = data {
                pc.outstanding.fetch_add(1, Ordering::Relaxed);
                return Some(ByteBuf {
                    data,
                    read: 0,
                    write: 0,
                    home: Some((Arc::clone(&self.inner), idx)),
                });
            }
        }
        None
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("classes", &self.inner.classes.len())
            .field("outstanding", &self.outstanding())
            .field("exhausted", &self.exhausted_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> BufferPool {
        BufferPool::new(&[(64, 2), (256, 2)])
    }

    #[test]
    fn test_cursor_invariant() {
        let mut buf = ByteBuf::with_capacity(16);
        buf.put_slice(b"hello").unwrap();
        assert_eq!(buf.remaining(), 5);
        assert_eq!(buf.bytes(), b"hello");

        buf.advance_read(2);
        assert_eq!(buf.bytes(), b"llo");

        // Consuming everything resets the cursors.
        buf.advance_read(3);
        assert!(buf.is_empty());
        assert_eq!(buf.write_pos(), 0);
    }

    #[test]
    fn test_put_overflow_is_error() {
        let mut buf = ByteBuf::with_capacity(4);
        buf.put_u32(1).unwrap();
        assert!(matches!(buf.put_u8(0), Err(crate::Error::BufferOverflow)));
        assert!(matches!(
            buf.put_slice(b"xy"),
            Err(crate::Error::BufferOverflow)
        ));
    }

    #[test]
    fn test_acquire_best_fit() {
        let pool = small_pool();
        let b = pool.acquire(10, false).unwrap();
        assert_eq!(b.capacity(), 64);
        let b2 = pool.acquire(100, false).unwrap();
        assert_eq!(b2.capacity(), 256);
    }

    #[test]
    fn test_release_on_drop() {
        let pool = small_pool();
        {
            let _a = pool.acquire(64, false).unwrap();
            let _b = pool.acquire(64, false).unwrap();
            assert_eq!(pool.outstanding(), 2);
        }
        assert_eq!(pool.outstanding(), 0);
        // Both slots usable again.
        assert!(pool.acquire(64, false).is_some());
    }

    #[test]
    fn test_fallback_to_larger_class() {
        let pool = small_pool();
        let _a = pool.acquire(64, false).unwrap();
        let _b = pool.acquire(64, false).unwrap();
        // 64B class empty, falls through to 256B.
        let c = pool.acquire(64, false).unwrap();
        assert_eq!(c.capacity(), 256);
    }

    #[test]
    fn test_exhaustion_counted_not_fatal() {
        let pool = small_pool();
        let held: Vec<_> = (0..4).map(|_| pool.acquire(64, false).unwrap()).collect();
        assert_eq!(held.len(), 4);

        assert!(pool.acquire(64, false).is_none());
        assert_eq!(pool.exhausted_count(), 1);

        // Force allocates an unpooled buffer instead of failing.
        let forced = pool.acquire(64, true).unwrap();
        assert!(forced.capacity() >= 64);
        assert_eq!(pool.exhausted_count(), 2);
        drop(forced);
        // Unpooled buffers do not perturb outstanding accounting.
        assert_eq!(pool.outstanding(), 4);
    }

    #[test]
    fn test_acquire_batch() {
        let pool = small_pool();
        let batch = pool.acquire_batch(64, 2, false).unwrap();
        assert_eq!(batch.len(), 2);
        drop(batch);

        assert!(pool.acquire_batch(64, 5, false).is_none());
        // The partial batch was returned on failure.
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_returned_buffer_is_clean() {
        let pool = small_pool();
        let mut b = pool.acquire(64, false).unwrap();
        b.put_slice(b"dirty").unwrap();
        drop(b);

        let b = pool.acquire(64, false).unwrap();
        assert!(b.is_empty());
        assert_eq!(b.capacity(), 64);
    }

    #[test]
    fn test_oversize_request() {
        let pool = small_pool();
        assert!(pool.acquire(1024, false).is_none());
    }
}
