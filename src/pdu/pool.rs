//! The receive-buffer pool.
//!
//! Buffers are handed out rounded up to a multiple of [`PDU_CHUNK`]
//! bytes and returned to the pool when their pin count reaches zero.
//! `maxsize` only ever grows, so a reader may consult it without the
//! pool lock; seeing a stale smaller value is benign.

use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use super::PDU_CHUNK;

static MAXSIZE: AtomicUsize = AtomicUsize::new(PDU_CHUNK);
static FREE: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

const MAX_SPARES: usize = 32;

/// High-water mark of the largest frame seen so far.
pub fn maxsize() -> usize {
    MAXSIZE.load(Ordering::Relaxed)
}

/// Grow the high-water mark to cover a frame of `len` bytes, rounded up
/// to the next chunk boundary.  Never shrinks.
pub fn grow_maxsize(len: usize) -> usize {
    let want = PDU_CHUNK * (1 + len / PDU_CHUNK);
    MAXSIZE.fetch_max(want, Ordering::Relaxed);
    MAXSIZE.load(Ordering::Relaxed)
}

/// Take a writable buffer with at least `size` bytes of capacity.
pub fn acquire(size: usize) -> BytesMut {
    let want = PDU_CHUNK * ((size + PDU_CHUNK - 1) / PDU_CHUNK);
    let mut free = FREE.lock();
    if let Some(pos) = free.iter().position(|b| b.capacity() >= want) {
        let mut buf = free.swap_remove(pos);
        buf.clear();
        return buf;
    }
    drop(free);
    BytesMut::with_capacity(want)
}

fn reclaim(mut buf: BytesMut) {
    buf.clear();
    let mut free = FREE.lock();
    if free.len() < MAX_SPARES {
        free.push(buf);
    }
}

/// Drop all pooled spares.  `maxsize` is preserved; it is a monotonic
/// high-water mark, not an allocation.
pub fn teardown() {
    FREE.lock().clear();
}

struct Pinned {
    data: BytesMut,
}

impl Drop for Pinned {
    fn drop(&mut self) {
        reclaim(mem::take(&mut self.data));
    }
}

/// A filled receive buffer.  Every clone is a pin; the buffer returns
/// to the pool when the last pin is released, so a decoded structure
/// that borrows from the buffer keeps it alive by holding a clone.
pub struct PinnedBuf {
    inner: Arc<Pinned>,
}

impl PinnedBuf {
    pub fn new(data: BytesMut) -> PinnedBuf {
        PinnedBuf {
            inner: Arc::new(Pinned { data }),
        }
    }

    /// Number of live pins on the underlying buffer.
    pub fn pin_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Add a pin.
    pub fn pin(&self) -> PinnedBuf {
        PinnedBuf {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Release this pin.  Equivalent to dropping the handle.
    pub fn unpin(self) {}
}

impl Clone for PinnedBuf {
    fn clone(&self) -> PinnedBuf {
        self.pin()
    }
}

impl Deref for PinnedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner.data
    }
}

impl AsRef<[u8]> for PinnedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.inner.data
    }
}

impl std::fmt::Debug for PinnedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "PinnedBuf(len={}, pins={})",
            self.inner.data.len(),
            self.pin_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_chunk_sized() {
        let buf = acquire(1);
        assert!(buf.capacity() >= PDU_CHUNK);
        let buf = acquire(PDU_CHUNK + 1);
        assert!(buf.capacity() >= 2 * PDU_CHUNK);
    }

    #[test]
    fn maxsize_is_monotonic() {
        let before = maxsize();
        let grown = grow_maxsize(before + PDU_CHUNK);
        assert!(grown > before);
        grow_maxsize(PDU_CHUNK);
        assert!(maxsize() >= grown);
    }

    #[test]
    fn pin_counting() {
        let mut data = acquire(16);
        data.extend_from_slice(b"0123456789abcdef");
        let buf = PinnedBuf::new(data);
        assert_eq!(buf.pin_count(), 1);
        let second = buf.pin();
        assert_eq!(buf.pin_count(), 2);
        second.unpin();
        assert_eq!(buf.pin_count(), 1);
        assert_eq!(&buf[0..4], b"0123");
    }

    #[test]
    #[serial_test::serial(pdu_pool)]
    fn reclaimed_buffers_are_reused() {
        teardown();
        let mut data = acquire(PDU_CHUNK * 3);
        data.extend_from_slice(b"x");
        let cap = data.capacity();
        PinnedBuf::new(data).unpin();
        let again = acquire(PDU_CHUNK * 3);
        assert!(again.capacity() >= cap);
        teardown();
    }
}
