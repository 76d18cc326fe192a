//! Per-stream pipe state.
//!
//! A [`PipeBundle`] holds everything the processor needs to drive one parent
//! side of one standard stream: the endpoint, the fixed direct buffer, the
//! pending-write FIFO, and the write-pipeline bookkeeping. The bundle is a
//! passive container — it never performs I/O itself. It is owned and mutated
//! by the processor thread; the only cross-thread operation is
//! [`enqueue_write`](PipeBundle::enqueue_write), which goes through a
//! lock-free queue shared with the process handle.

use std::sync::Arc;

use bytes::{Buf, Bytes};
use crossbeam_queue::SegQueue;

use crate::buffer::IoBuffer;

/// Pending-write FIFO, shared between the user-facing process handle (which
/// pushes) and the processor-owned bundle (which pops).
pub(crate) type WriteQueue = Arc<SegQueue<Bytes>>;

/// Parent-side state for one standard stream of one process.
///
/// `E` is the platform endpoint: an owned fd on POSIX, a handle plus
/// overlapped context on Windows.
pub(crate) struct PipeBundle<E> {
    /// The parent-side endpoint. Closed by dropping the bundle.
    pub(crate) endpoint: E,
    /// Fixed direct buffer for kernel/handler transfers.
    pub(crate) buffer: IoBuffer,
    /// Caller-supplied source buffers awaiting the write pipeline, strictly
    /// in enqueue order.
    pending: WriteQueue,
    /// Head of the FIFO currently being copied into the direct buffer.
    current_source: Option<Bytes>,
    /// Bytes in the direct buffer still to be written, starting at
    /// `write_offset`.
    pub(crate) remaining_write: usize,
    /// Offset of the next unwritten byte in the direct buffer.
    pub(crate) write_offset: usize,
    /// Set once end-of-stream or teardown has been observed; no further
    /// events are delivered and no further writes accepted.
    pub(crate) closed: bool,
    /// `close_stdin` was requested; the endpoint closes once already-enqueued
    /// writes have drained. Meaningful for stdin bundles only.
    pub(crate) close_pending: bool,
    /// Whether the endpoint is currently attached to the multiplexer.
    pub(crate) registered: bool,
}

impl<E> PipeBundle<E> {
    pub(crate) fn new(endpoint: E, capacity: usize, pending: WriteQueue) -> Self {
        Self {
            endpoint,
            buffer: IoBuffer::new(capacity),
            pending,
            current_source: None,
            remaining_write: 0,
            write_offset: 0,
            closed: false,
            close_pending: false,
            registered: false,
        }
    }

    /// Append a caller-owned source buffer to the pending FIFO.
    ///
    /// Constant time, safe to call from any thread.
    #[allow(dead_code)]
    pub(crate) fn enqueue_write(&self, source: Bytes) {
        self.pending.push(source);
    }

    /// Idempotent.
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// True while any enqueued source still holds unwritten bytes.
    pub(crate) fn has_pending_writes(&self) -> bool {
        self.current_source.is_some() || !self.pending.is_empty()
    }

    /// Record `n` bytes written from the direct buffer.
    pub(crate) fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.remaining_write);
        self.write_offset += n;
        self.remaining_write -= n;
    }

    /// Refill the direct buffer from the pending FIFO.
    ///
    /// Copies up to the buffer capacity from the head source, dropping the
    /// source once exhausted. Returns true if bytes were staged for writing.
    pub(crate) fn refill_from_pending(&mut self) -> bool {
        debug_assert_eq!(self.remaining_write, 0);
        self.buffer.clear();
        self.write_offset = 0;

        while self.buffer.position() < self.buffer.capacity() {
            if self.current_source.is_none() {
                self.current_source = self.pending.pop();
            }
            let Some(source) = self.current_source.as_mut() else {
                break;
            };
            let copied = self.buffer.put_up_to(source.as_ref());
            source.advance(copied);
            if !source.has_remaining() {
                self.current_source = None;
            }
        }

        self.remaining_write = self.buffer.position();
        self.remaining_write > 0
    }
}
