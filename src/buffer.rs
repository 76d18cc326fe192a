//! Fixed-capacity direct buffer shared between the kernel and handlers.
//!
//! Every stream of every process owns exactly one [`IoBuffer`], allocated once
//! at spawn and repositioned for every handler invocation. The buffer is the
//! backpressure mechanism: a handler reports consumption by advancing
//! `position`, and whatever it leaves behind is carried over (compacted) into
//! the next kernel read.
//!
//! The buffer has two alternating modes, distinguished only by how `position`
//! and `limit` are set:
//!
//! - **fill**: `position..limit` is the writable region (`limit == capacity`);
//!   the kernel or a handler appends bytes and `position` advances.
//! - **drain**: `position..limit` is the readable region; consumers advance
//!   `position` as they take bytes.
//!
//! [`flip`](IoBuffer::flip) switches fill → drain, [`compact`](IoBuffer::compact)
//! switches drain → fill while preserving unconsumed bytes, and
//! [`clear`](IoBuffer::clear) resets to an empty fill region.
//!
//! The buffer handed to a handler is only valid for the duration of the
//! callback; it is reused for the next event as soon as the callback returns.

use bytes::{BufMut, BytesMut};

/// Default capacity for stream buffers (64 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// A fixed-capacity byte buffer with an explicit position and limit.
///
/// Capacity is constant for the buffer's lifetime; no operation reallocates.
pub struct IoBuffer {
    data: BytesMut,
    position: usize,
    limit: usize,
}

impl IoBuffer {
    /// Create a buffer with the given capacity, in fill mode.
    pub fn new(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Self {
            data,
            position: 0,
            limit: capacity,
        }
    }

    /// Total capacity in bytes. Constant for the buffer's lifetime.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current position.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the position.
    ///
    /// In drain mode this is how a handler reports consumption.
    ///
    /// # Panics
    ///
    /// Panics if `position > limit`.
    #[inline]
    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.limit, "position beyond limit");
        self.position = position;
    }

    /// Current limit.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// True if no bytes remain between position and limit.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.position == self.limit
    }

    /// The readable region (`position..limit`) in drain mode.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// The writable region (`position..limit`) in fill mode.
    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Raw view of `range` bytes starting at an absolute offset, independent
    /// of position/limit. Used by the write pipeline, which tracks its own
    /// offset into the buffer.
    #[inline]
    pub(crate) fn region(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Advance the position by `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes remain.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance beyond limit");
        self.position += n;
    }

    /// Copy `src` into the buffer at the current position and advance.
    ///
    /// # Panics
    ///
    /// Panics if `src` does not fit in the remaining region.
    pub fn put_slice(&mut self, src: &[u8]) {
        assert!(src.len() <= self.remaining(), "put_slice overflows buffer");
        self.data[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
    }

    /// Switch fill → drain: the bytes written so far become the readable
    /// region.
    #[inline]
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Reset to an empty fill region covering the whole capacity.
    #[inline]
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Switch drain → fill, preserving unconsumed bytes.
    ///
    /// Moves `position..limit` to the front; the new position is the carried
    /// byte count and the limit returns to capacity. A full buffer after
    /// compaction means the handler consumed nothing and there is no room for
    /// the next read.
    pub fn compact(&mut self) {
        let len = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = len;
        self.limit = self.capacity();
    }

    /// True if the fill region is exhausted (no room for further bytes).
    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.position == self.capacity()
    }

    /// Switch to drain mode after the kernel deposited `n` bytes at the
    /// current position: the readable region becomes `[0, position + n)`.
    pub(crate) fn assume_filled(&mut self, n: usize) {
        debug_assert!(self.position + n <= self.capacity());
        self.limit = self.position + n;
        self.position = 0;
    }

    /// Copy as much of `src` as fits into the remaining fill region, starting
    /// at the current position. Returns the number of bytes copied.
    pub(crate) fn put_up_to(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }

    /// Drain the readable region into a `Vec`, advancing past it.
    ///
    /// Convenience for handlers and tests that consume everything.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        let out = self.as_slice().to_vec();
        self.position = self.limit;
        out
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}

// BufMut is handy for handlers that already speak bytes::Buf; forwarded to the
// remaining fill region.
unsafe impl BufMut for IoBuffer {
    #[inline]
    fn remaining_mut(&self) -> usize {
        self.remaining()
    }

    #[inline]
    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.advance(cnt);
    }

    #[inline]
    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        let region = self.writable();
        bytes::buf::UninitSlice::new(region)
    }
}
