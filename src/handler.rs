//! The handler contract: per-process event callbacks.
//!
//! A [`ProcessHandler`] receives every lifecycle and I/O event for one spawned
//! process. All callbacks except [`on_pre_start`](ProcessHandler::on_pre_start)
//! run on the processor's event-loop thread, which drives every process
//! assigned to that processor — a handler that blocks stalls all of them.
//! Callbacks for one process are never invoked concurrently and always observe
//! the ordering `on_start` first, `on_exit` last.
//!
//! # Buffer discipline
//!
//! The same fixed buffer is handed to the handler on every call, repositioned.
//! `on_stdout`/`on_stderr` receive the buffer in drain mode; the handler
//! advances the position to mark bytes consumed, and anything left over is
//! presented again (with fresh bytes appended) on the next call. The buffer is
//! invalidated as soon as the callback returns — bytes that must outlive the
//! call have to be copied out.
//!
//! `on_stdin_ready` receives the buffer empty; the handler appends with
//! [`IoBuffer::put_slice`](crate::IoBuffer::put_slice) and returns `true` to
//! be invoked again when stdin is next writable.
//!
//! # Example
//!
//! ```ignore
//! use procpool::{NopProcessHandler, ProcessBuilder, ProcessHandler, IoBuffer};
//!
//! struct Collect(Vec<u8>);
//!
//! impl ProcessHandler for Collect {
//!     fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
//!         self.0.extend_from_slice(buffer.as_slice());
//!         buffer.set_position(buffer.limit());
//!     }
//! }
//! ```

use crate::buffer::IoBuffer;
use crate::process::{ExitStatus, ProcessHandle};

/// Event callbacks for one spawned process.
///
/// Every method has a no-op default, so implementations only override what
/// they care about.
#[allow(unused_variables)]
pub trait ProcessHandler: Send {
    /// Called on the spawning thread before any pipe exists.
    ///
    /// This is the place to stash the [`ProcessHandle`] or swap in a
    /// different handler via
    /// [`set_process_handler`](ProcessHandle::set_process_handler). Panics are
    /// caught and logged.
    fn on_pre_start(&mut self, process: &ProcessHandle) {}

    /// Called on the processor thread once pipes are wired and the child is
    /// running, before any I/O callback for this process.
    fn on_start(&mut self, process: &ProcessHandle) {}

    /// Bytes arrived on the child's stdout.
    ///
    /// Advance the buffer's position to mark consumption. `closed` is true
    /// exactly once, on end-of-stream, and carries any final bytes.
    fn on_stdout(&mut self, buffer: &mut IoBuffer, closed: bool) {}

    /// Bytes arrived on the child's stderr. Same contract as
    /// [`on_stdout`](ProcessHandler::on_stdout).
    fn on_stderr(&mut self, buffer: &mut IoBuffer, closed: bool) {}

    /// Stdin is writable and the pending-write queue is empty.
    ///
    /// Fill the buffer from position 0 and return `true` to be called again
    /// the next time stdin has room.
    fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
        false
    }

    /// Terminal callback, delivered exactly once after the last I/O callback.
    fn on_exit(&mut self, status: ExitStatus) {}
}

/// A handler that ignores every event.
///
/// Useful as a base for tests and for fire-and-forget spawns.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopProcessHandler;

impl ProcessHandler for NopProcessHandler {}

impl<H: ProcessHandler + ?Sized> ProcessHandler for Box<H> {
    fn on_pre_start(&mut self, process: &ProcessHandle) {
        (**self).on_pre_start(process);
    }

    fn on_start(&mut self, process: &ProcessHandle) {
        (**self).on_start(process);
    }

    fn on_stdout(&mut self, buffer: &mut IoBuffer, closed: bool) {
        (**self).on_stdout(buffer, closed);
    }

    fn on_stderr(&mut self, buffer: &mut IoBuffer, closed: bool) {
        (**self).on_stderr(buffer, closed);
    }

    fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
        (**self).on_stdin_ready(buffer)
    }

    fn on_exit(&mut self, status: ExitStatus) {
        (**self).on_exit(status);
    }
}
