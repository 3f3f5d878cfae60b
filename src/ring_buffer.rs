// src/ring_buffer.rs
//
// Fixed-capacity single-producer/single-consumer byte ring. The capture loop
// is the producer (serial reads) and the frame decoder the consumer; in the
// threaded-writer variant the same type carries encoded records between the
// capture thread and the pipe thread, so head and tail are atomics.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    /// Slot count, always capacity + 1: one slot stays open so full and
    /// empty are distinguishable from the indices alone.
    slots: usize,
    /// Next write position. Only the producer stores it.
    head: AtomicUsize,
    /// Next read position. Only the consumer stores it.
    tail: AtomicUsize,
}

// Safe for one producer thread and one consumer thread: the producer only
// writes slots in [head, tail) (mod slots) and the consumer only reads
// [tail, head), with Release/Acquire ordering on the index handoff.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring that can hold `capacity` unread bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let slots = capacity + 1;
        let storage = (0..slots).map(|_| UnsafeCell::new(0u8)).collect();
        RingBuffer {
            storage,
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots - 1
    }

    /// Unread bytes currently in the ring.
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + self.slots - tail) % self.slots
    }

    /// Bytes the producer may still write.
    pub fn free(&self) -> usize {
        self.capacity() - self.count()
    }

    /// Writable bytes at the head before the wrap boundary.
    pub fn free_contiguous(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        std::cmp::min(self.free(), self.slots - head)
    }

    /// Readable bytes at the tail before the wrap boundary.
    pub fn occupied_contiguous(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        std::cmp::min(self.count(), self.slots - tail)
    }

    /// Copy as much of `data` as fits, splitting across the wrap boundary.
    /// Returns the number of bytes accepted; unread data is never overwritten.
    pub fn write(&self, data: &[u8]) -> usize {
        let n = std::cmp::min(data.len(), self.free());
        if n == 0 {
            return 0;
        }
        let head = self.head.load(Ordering::Acquire);
        let base = self.storage.as_ptr() as *mut u8;
        let first = std::cmp::min(n, self.slots - head);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(head), first);
            if n > first {
                std::ptr::copy_nonoverlapping(data.as_ptr().add(first), base, n - first);
            }
        }
        self.head.store((head + n) % self.slots, Ordering::Release);
        n
    }

    /// Read the unconsumed byte `offset` positions past the tail.
    ///
    /// Panics if `offset` is not backed by unread data; that is a consumer
    /// bug, not a runtime condition.
    pub fn peek_at(&self, offset: usize) -> u8 {
        assert!(
            offset < self.count(),
            "peek_at({}) with only {} bytes buffered",
            offset,
            self.count()
        );
        let tail = self.tail.load(Ordering::Acquire);
        let idx = (tail + offset) % self.slots;
        unsafe { *self.storage[idx].get() }
    }

    /// Copy up to `out.len()` bytes out of the ring and consume them.
    /// Returns the number of bytes copied.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let n = std::cmp::min(out.len(), self.count());
        if n == 0 {
            return 0;
        }
        let tail = self.tail.load(Ordering::Acquire);
        let base = self.storage.as_ptr() as *const u8;
        let first = std::cmp::min(n, self.slots - tail);
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(tail), out.as_mut_ptr(), first);
            if n > first {
                std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), n - first);
            }
        }
        self.tail.store((tail + n) % self.slots, Ordering::Release);
        n
    }

    /// Consume `n` bytes without copying them out.
    ///
    /// Panics when `n` exceeds the unread count; advancing the tail past the
    /// head is a contract violation.
    pub fn advance_tail(&self, n: usize) {
        assert!(
            n <= self.count(),
            "advance_tail({}) with only {} bytes buffered",
            n,
            self.count()
        );
        let tail = self.tail.load(Ordering::Acquire);
        self.tail.store((tail + n) % self.slots, Ordering::Release);
    }

    /// Drop all unread bytes (consumer-side operation).
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tracks_writes_and_reads() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(ring.count(), 5);

        let mut out = [0u8; 2];
        assert_eq!(ring.read_into(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.count(), 3);
    }

    #[test]
    fn full_ring_rejects_excess_instead_of_overwriting() {
        let ring = RingBuffer::new(4);
        assert_eq!(ring.write(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(&[9]), 0);

        let mut out = [0u8; 4];
        assert_eq!(ring.read_into(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn write_and_read_split_across_wrap() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write(&[0; 6]), 6);
        ring.advance_tail(6);
        assert_eq!(ring.free_contiguous(), 3);

        // Head is near the physical end now; this write must wrap.
        let data = [1, 2, 3, 4, 5];
        assert_eq!(ring.write(&data), 5);
        assert!(ring.occupied_contiguous() < 5);

        let mut out = [0u8; 5];
        assert_eq!(ring.read_into(&mut out), 5);
        assert_eq!(out, data);
    }

    #[test]
    fn peek_does_not_consume() {
        let ring = RingBuffer::new(8);
        ring.write(&[0xAA, 0xBB]);
        assert_eq!(ring.peek_at(0), 0xAA);
        assert_eq!(ring.peek_at(1), 0xBB);
        assert_eq!(ring.count(), 2);
    }

    #[test]
    #[should_panic(expected = "advance_tail")]
    fn advancing_past_head_panics() {
        let ring = RingBuffer::new(8);
        ring.write(&[1, 2]);
        ring.advance_tail(3);
    }

    #[test]
    fn clear_empties_the_ring() {
        let ring = RingBuffer::new(8);
        ring.write(&[1, 2, 3]);
        ring.clear();
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.free(), 8);
    }
}
