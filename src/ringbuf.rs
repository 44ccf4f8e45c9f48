//! A lock-free single-producer/single-consumer byte ring buffer.
//!
//! A line-for-line semantic port of `pulsecore/ringbuffer.c`'s `peek` /
//! `drop` / `begin_write` / `end_write` API, backed by `AtomicUsize` instead
//! of a raw `pa_atomic_t`. Capacity need not be a power of two; indices wrap
//! with a modulo instead of a mask.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    data: Vec<u8>,
    capacity: usize,
    /// Number of valid, unread bytes currently in the buffer.
    fill: AtomicUsize,
    /// Index of the next byte to be read.
    read_idx: AtomicUsize,
    /// Index of the next byte to be written.
    write_idx: AtomicUsize,
}

/// Creates a ring buffer of the given byte capacity, returning its writer
/// and reader halves.
///
/// `capacity` must be nonzero.
pub fn channel(capacity: usize) -> (Writer, Reader) {
    assert!(capacity > 0, "ring buffer capacity must be nonzero");

    let shared = Arc::new(Shared {
        data: vec![0u8; capacity],
        capacity,
        fill: AtomicUsize::new(0),
        read_idx: AtomicUsize::new(0),
        write_idx: AtomicUsize::new(0),
    });

    (
        Writer {
            shared: shared.clone(),
        },
        Reader { shared },
    )
}

/// The producer half of a ring buffer channel.
pub struct Writer {
    shared: Arc<Shared>,
}

/// The consumer half of a ring buffer channel.
pub struct Reader {
    shared: Arc<Shared>,
}

impl Writer {
    /// Total byte capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of unread bytes currently stored.
    pub fn len(&self) -> usize {
        self.shared.fill.load(Ordering::Acquire)
    }

    /// Bytes of free space available to write.
    pub fn writable(&self) -> usize {
        self.shared.capacity - self.len()
    }

    /// Returns a writable, contiguous span at the current write position,
    /// clipped to the buffer's physical end-of-array boundary and to the
    /// amount of free space.
    ///
    /// The caller fills some prefix of the returned slice, then calls
    /// [`end_write`](Self::end_write) with how many bytes it actually wrote.
    /// If the free region wraps around the end of the backing array, the
    /// caller must call this twice: once for the span up to the physical
    /// end, and again (after `end_write`) for the remainder.
    pub fn begin_write(&mut self) -> &mut [u8] {
        let free = self.writable();
        if free == 0 {
            return &mut [];
        }

        let w = self.shared.write_idx.load(Ordering::Relaxed);
        let until_wrap = self.shared.capacity - w;
        let span = free.min(until_wrap);

        // SAFETY: the writer is the sole mutator of `data` in [w, w+span);
        // the reader only ever touches [read_idx, read_idx+fill), which by
        // construction of `free`/`span` never overlaps this span.
        let data = unsafe {
            let ptr = self.shared.data.as_ptr() as *mut u8;
            std::slice::from_raw_parts_mut(ptr.add(w), span)
        };
        data
    }

    /// Commits `n` bytes previously written into the span returned by
    /// [`begin_write`](Self::begin_write).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the free space.
    pub fn end_write(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        assert!(n <= self.writable(), "end_write exceeds free space");

        let w = self.shared.write_idx.load(Ordering::Relaxed);
        self.shared
            .write_idx
            .store((w + n) % self.shared.capacity, Ordering::Relaxed);
        self.shared.fill.fetch_add(n, Ordering::Release);
    }

    /// Writes `bytes` into the buffer, wrapping across the physical end of
    /// the array as needed. Returns the number of bytes actually written,
    /// which is less than `bytes.len()` if the buffer filled up.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let mut written = 0;
        while written < bytes.len() {
            let span = self.begin_write();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(bytes.len() - written);
            span[..n].copy_from_slice(&bytes[written..written + n]);
            self.end_write(n);
            written += n;
        }
        written
    }
}

impl Reader {
    /// Total byte capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of unread bytes currently available.
    pub fn len(&self) -> usize {
        self.shared.fill.load(Ordering::Acquire)
    }

    /// True iff there are no bytes available to read.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a readable, contiguous span at the current read position,
    /// clipped to the buffer's physical end-of-array boundary and to the
    /// number of unread bytes available.
    ///
    /// The data is not consumed until [`drop_read`](Self::drop_read) is
    /// called. If the readable region wraps around the end of the backing
    /// array, the caller must call this again (after `drop_read`) to see
    /// the remainder.
    pub fn peek(&self) -> &[u8] {
        let avail = self.len();
        if avail == 0 {
            return &[];
        }

        let r = self.shared.read_idx.load(Ordering::Relaxed);
        let until_wrap = self.shared.capacity - r;
        let span = avail.min(until_wrap);
        &self.shared.data[r..r + span]
    }

    /// Consumes `n` bytes previously returned by [`peek`](Self::peek).
    ///
    /// Returns `true` if the buffer was exactly full immediately before
    /// this drop — mirroring `pa_ringbuffer_drop`'s return value, used by
    /// callers that need to know when a writer stalled on a full buffer
    /// has newly gained room.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the number of unread bytes.
    pub fn drop_read(&mut self, n: usize) -> bool {
        let avail = self.len();
        assert!(n <= avail, "drop_read exceeds available bytes");

        let was_full = avail == self.shared.capacity;
        if n == 0 {
            return false;
        }

        let r = self.shared.read_idx.load(Ordering::Relaxed);
        self.shared
            .read_idx
            .store((r + n) % self.shared.capacity, Ordering::Relaxed);
        self.shared.fill.fetch_sub(n, Ordering::Release);
        was_full
    }

    /// Reads up to `out.len()` bytes, wrapping across the physical end of
    /// the array as needed. Returns the number of bytes actually read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut n_read = 0;
        while n_read < out.len() {
            let span = self.peek();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(out.len() - n_read);
            out[n_read..n_read + n].copy_from_slice(&span[..n]);
            self.drop_read(n);
            n_read += n;
        }
        n_read
    }
}

// SAFETY: `Writer` and `Reader` each touch disjoint index ranges of the
// shared buffer (see `begin_write`/`peek`), so sending either to another
// thread is sound as long as the two halves aren't used concurrently from
// the same side.
unsafe impl Send for Writer {}
unsafe impl Send for Reader {}
