//! Per-process state machine and the user-facing process handle.
//!
//! A spawned child is represented by two cooperating pieces:
//!
//! - [`ProcessShared`] — the `Arc`-shared core: handler slot, exit gate,
//!   write-intent flag, pending-write FIFO, and the platform-independent
//!   dispatch pipeline (read delivery, stdin refill, exit delivery). The
//!   platform event loops drive I/O and call into these methods.
//! - [`ProcessHandle`] — the cheaply cloneable public surface handed to
//!   callers and to handlers.
//!
//! Lifecycle: NEW (constructed) → STARTING (pipes opened) → RUNNING (child
//! executing) → EXITED (OS wait confirmed, `on_exit` delivered). All handler
//! callbacks except `on_pre_start` run on the owning processor's thread, so
//! callbacks for one process are serialized by construction.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::SegQueue;

use crate::buffer::IoBuffer;
use crate::error::{ProcPoolError, Result};
use crate::handler::ProcessHandler;
use crate::pipe::{PipeBundle, WriteQueue};
use crate::processor::{Processor, Request};

/// Why a process reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The child exited on its own; `code` is its exit code.
    Exited,
    /// The child was killed by the given signal (POSIX only). `code` carries
    /// the wait status's exit byte, which is zero for signal deaths.
    Signaled(i32),
    /// The child was terminated through [`ProcessHandle::destroy`].
    Destroyed {
        /// Whether the forced (no-grace) variant was used.
        force: bool,
    },
    /// The child never ran: pipe creation or exec failed.
    SpawnFailed,
    /// The process was killed because its handler left a stream buffer full
    /// without consuming anything.
    HandlerFault,
}

/// Terminal status delivered to [`ProcessHandler::on_exit`] and returned by
/// [`ProcessHandle::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code as reported by the OS wait (zero for signal deaths).
    pub code: i32,
    /// Explicit cause, replacing in-band sentinel codes.
    pub cause: ExitCause,
}

impl ExitStatus {
    pub(crate) fn spawn_failed() -> Self {
        Self {
            code: -1,
            cause: ExitCause::SpawnFailed,
        }
    }

    /// True for a plain, un-signaled, un-destroyed exit.
    pub fn exited_normally(&self) -> bool {
        matches!(self.cause, ExitCause::Exited)
    }
}

/// Which output stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    pub(crate) fn name(self) -> &'static str {
        match self {
            StreamId::Stdout => "stdout",
            StreamId::Stderr => "stderr",
        }
    }
}

/// One-shot latch carrying the terminal status.
///
/// Opened exactly once by the processor; any number of threads may wait.
pub(crate) struct ExitGate {
    state: Mutex<Option<ExitStatus>>,
    cvar: Condvar,
}

impl ExitGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cvar: Condvar::new(),
        }
    }

    /// Open the gate. The first status wins; later calls are ignored.
    pub(crate) fn open(&self, status: ExitStatus) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(status);
            self.cvar.notify_all();
        }
    }

    /// Block until the gate opens. A zero timeout waits forever.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if timeout.is_zero() {
            while state.is_none() {
                state = self
                    .cvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *state
        } else {
            let (state, _timed_out) = self
                .cvar
                .wait_timeout_while(state, timeout, |s| s.is_none())
                .unwrap_or_else(PoisonError::into_inner);
            *state
        }
    }

    pub(crate) fn status(&self) -> Option<ExitStatus> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// destroy() escalation levels, stored as a fetch_max'd atomic.
const DESTROY_NONE: u8 = 0;
const DESTROY_POLITE: u8 = 1;
const DESTROY_FORCE: u8 = 2;

/// The `Arc`-shared core of one spawned process.
pub(crate) struct ProcessShared {
    /// OS process id; zero until the child has been created.
    pid: AtomicU32,
    /// The active handler. Locked only around callback invocations, which all
    /// happen on the processor thread (plus `on_pre_start` on the spawner).
    handler: Mutex<Box<dyn ProcessHandler>>,
    /// Staged replacement from `set_process_handler`, applied at the next
    /// callback boundary so a handler may replace itself from a callback.
    replacement: Mutex<Option<Box<dyn ProcessHandler>>>,
    running: AtomicBool,
    /// Caller-asserted intent to be invoked when stdin is next writable.
    pub(crate) user_wants_write: AtomicBool,
    /// False before spawn and after `close_stdin`.
    stdin_open: AtomicBool,
    /// Sources enqueued by `write_stdin`, shared with the stdin bundle.
    pending_writes: WriteQueue,
    destroy_level: AtomicU8,
    /// Set when the handler-did-not-consume fault kills this process.
    handler_fault: AtomicBool,
    exit_delivered: AtomicBool,
    exit_gate: ExitGate,
    /// The processor this process was assigned to, set once at registration.
    processor: OnceLock<Processor>,
}

impl ProcessShared {
    pub(crate) fn new(handler: Box<dyn ProcessHandler>) -> Arc<Self> {
        Arc::new(Self {
            pid: AtomicU32::new(0),
            handler: Mutex::new(handler),
            replacement: Mutex::new(None),
            running: AtomicBool::new(false),
            user_wants_write: AtomicBool::new(false),
            stdin_open: AtomicBool::new(false),
            pending_writes: Arc::new(SegQueue::new()),
            destroy_level: AtomicU8::new(DESTROY_NONE),
            handler_fault: AtomicBool::new(false),
            exit_delivered: AtomicBool::new(false),
            exit_gate: ExitGate::new(),
            processor: OnceLock::new(),
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Transition STARTING → RUNNING once the child exists.
    pub(crate) fn mark_started(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
        self.stdin_open.store(true, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn assign_processor(&self, processor: Processor) {
        let _ = self.processor.set(processor);
    }

    pub(crate) fn write_queue(&self) -> WriteQueue {
        Arc::clone(&self.pending_writes)
    }

    pub(crate) fn handler_fault(&self) -> bool {
        self.handler_fault.load(Ordering::Acquire)
    }

    pub(crate) fn set_handler_fault(&self) {
        self.handler_fault.store(true, Ordering::Release);
    }

    pub(crate) fn mark_stdin_closed(&self) {
        self.stdin_open.store(false, Ordering::Release);
    }

    /// The destroy level observed so far, if any, as `(force)` flag.
    pub(crate) fn destroy_requested(&self) -> Option<bool> {
        match self.destroy_level.load(Ordering::Acquire) {
            DESTROY_NONE => None,
            DESTROY_FORCE => Some(true),
            _ => Some(false),
        }
    }

    /// Run a callback against the current handler, applying any staged
    /// replacement first. Panics are caught and logged; `None` means the
    /// callback panicked.
    pub(crate) fn with_handler<R>(
        &self,
        f: impl FnOnce(&mut dyn ProcessHandler) -> R,
    ) -> Option<R> {
        let mut handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = self
            .replacement
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            *handler = next;
        }
        match catch_unwind(AssertUnwindSafe(|| f(handler.as_mut()))) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::error!(pid = self.pid.load(Ordering::Relaxed), "process handler panicked");
                None
            }
        }
    }

    pub(crate) fn call_pre_start(self: &Arc<Self>) {
        let handle = ProcessHandle::from_shared(Arc::clone(self));
        self.with_handler(|h| h.on_pre_start(&handle));
    }

    pub(crate) fn call_start(self: &Arc<Self>) {
        let handle = ProcessHandle::from_shared(Arc::clone(self));
        self.with_handler(|h| h.on_start(&handle));
    }

    /// Deliver freshly read bytes: expose `[0, carried + n)`, invoke the
    /// handler, compact, and fail the process if the buffer came back full.
    pub(crate) fn dispatch_read(
        &self,
        stream: StreamId,
        buffer: &mut IoBuffer,
        n: usize,
    ) -> Result<()> {
        buffer.assume_filled(n);
        self.with_handler(|h| match stream {
            StreamId::Stdout => h.on_stdout(buffer, false),
            StreamId::Stderr => h.on_stderr(buffer, false),
        });
        buffer.compact();
        if buffer.is_full() {
            tracing::error!(
                stream = stream.name(),
                "handler left the buffer full without consuming; killing process"
            );
            return Err(ProcPoolError::HandlerDidNotConsume(stream.name()));
        }
        Ok(())
    }

    /// Deliver end-of-stream with any final unconsumed bytes.
    pub(crate) fn dispatch_eof(&self, stream: StreamId, buffer: &mut IoBuffer) {
        buffer.flip();
        self.with_handler(|h| match stream {
            StreamId::Stdout => h.on_stdout(buffer, true),
            StreamId::Stderr => h.on_stderr(buffer, true),
        });
    }

    /// Stage the next chunk of stdin bytes in the bundle's direct buffer.
    ///
    /// Order of supply: the pending-write FIFO first; once that is dry, the
    /// handler via `on_stdin_ready` (unless a deferred close is in progress).
    /// Returns true when bytes were staged.
    pub(crate) fn refill_stdin<E>(&self, bundle: &mut PipeBundle<E>) -> bool {
        if bundle.refill_from_pending() {
            return true;
        }
        if bundle.close_pending {
            return false;
        }
        if self
            .user_wants_write
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            bundle.buffer.clear();
            bundle.write_offset = 0;
            let again = self
                .with_handler(|h| h.on_stdin_ready(&mut bundle.buffer))
                .unwrap_or(false);
            if again {
                // OR, not overwrite: want_write() called from inside the
                // callback must survive the return value.
                self.user_wants_write.store(true, Ordering::Release);
            }
            bundle.remaining_write = bundle.buffer.position();
            return bundle.remaining_write > 0;
        }
        false
    }

    /// Terminal transition: runs at most once, after the last I/O callback.
    pub(crate) fn deliver_exit(&self, status: ExitStatus) {
        if self
            .exit_delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.stdin_open.store(false, Ordering::Release);
        self.with_handler(|h| h.on_exit(status));
        self.exit_gate.open(status);
    }
}

/// Handle to a spawned child process.
///
/// Cheap to clone; all methods are safe to call from any thread. I/O and
/// lifecycle callbacks are delivered to the [`ProcessHandler`] supplied at
/// spawn, on the owning processor's event-loop thread.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<ProcessShared>,
}

impl ProcessHandle {
    pub(crate) fn from_shared(shared: Arc<ProcessShared>) -> Self {
        Self { shared }
    }

    /// OS process id, once the child has been created.
    pub fn pid(&self) -> Option<u32> {
        self.shared.pid()
    }

    /// True between `on_start` and the terminal transition.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// True while enqueued `write_stdin` buffers await the write pipeline.
    pub fn has_pending_writes(&self) -> bool {
        !self.shared.pending_writes.is_empty()
    }

    /// Express intent to write: the handler's `on_stdin_ready` is invoked the
    /// next time stdin has room.
    ///
    /// Silently does nothing once stdin is closed. Multiple calls between
    /// invocations coalesce into one.
    pub fn want_write(&self) {
        if !self.shared.stdin_open.load(Ordering::Acquire) {
            return;
        }
        self.shared.user_wants_write.store(true, Ordering::Release);
        if let Some(processor) = self.shared.processor.get() {
            processor.submit(Request::WantWrite(Arc::clone(&self.shared)));
        }
    }

    /// Enqueue a caller-owned buffer for writing to the child's stdin.
    ///
    /// Buffers drain strictly in enqueue order, including across threads.
    ///
    /// # Errors
    ///
    /// [`ProcPoolError::StdinClosed`] once `close_stdin` has been called (or
    /// the process has exited).
    pub fn write_stdin(&self, buffer: impl Into<Bytes>) -> Result<()> {
        if !self.shared.stdin_open.load(Ordering::Acquire) {
            return Err(ProcPoolError::StdinClosed);
        }
        self.shared.pending_writes.push(buffer.into());
        if let Some(processor) = self.shared.processor.get() {
            processor.submit(Request::WantWrite(Arc::clone(&self.shared)));
        }
        Ok(())
    }

    /// Close the child's stdin.
    ///
    /// Already-enqueued writes drain first; the endpoint is then closed by
    /// the owning processor (never on the caller's thread). Idempotent.
    pub fn close_stdin(&self) {
        if !self.shared.stdin_open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(processor) = self.shared.processor.get() {
            processor.submit(Request::CloseStdin(Arc::clone(&self.shared)));
        }
    }

    /// Terminate the child.
    ///
    /// `force = false` sends a polite terminate (SIGTERM); `force = true`
    /// kills without grace (SIGKILL). On completion-based platforms only
    /// forced termination exists and the flag is recorded but ignored.
    ///
    /// Asynchronous: returns immediately after issuing the signal; the exit
    /// is observed through the normal event-loop detection and `on_exit` is
    /// delivered exactly once no matter how many times `destroy` is called.
    pub fn destroy(&self, force: bool) {
        let level = if force { DESTROY_FORCE } else { DESTROY_POLITE };
        self.shared.destroy_level.fetch_max(level, Ordering::AcqRel);
        if let Some(pid) = self.shared.pid() {
            crate::sys::terminate(pid, force);
        }
    }

    /// Block until the process exits or the timeout elapses.
    ///
    /// A zero timeout waits forever. Returns `None` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> Option<ExitStatus> {
        self.shared.exit_gate.wait(timeout)
    }

    /// The terminal status, if the process has already exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.exit_gate.status()
    }

    /// Replace the handler receiving this process's events.
    ///
    /// Applied at the next callback boundary, so a handler may replace
    /// itself from inside a callback.
    pub fn set_process_handler(&self, handler: Box<dyn ProcessHandler>) {
        *self
            .shared
            .replacement
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.shared.pid())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NopProcessHandler;
    use std::sync::atomic::AtomicUsize;

    fn shared() -> Arc<ProcessShared> {
        ProcessShared::new(Box::new(NopProcessHandler))
    }

    fn stdin_bundle(shared: &ProcessShared, capacity: usize) -> PipeBundle<()> {
        PipeBundle::new((), capacity, shared.write_queue())
    }

    #[test]
    fn test_exit_gate_times_out_then_returns_status() {
        let gate = ExitGate::new();
        assert_eq!(gate.wait(Duration::from_millis(10)), None);

        let status = ExitStatus {
            code: 3,
            cause: ExitCause::Exited,
        };
        gate.open(status);
        assert_eq!(gate.wait(Duration::from_millis(10)), Some(status));
        // Zero timeout means forever, and the gate is already open.
        assert_eq!(gate.wait(Duration::ZERO), Some(status));
    }

    #[test]
    fn test_exit_gate_first_status_wins() {
        let gate = ExitGate::new();
        let first = ExitStatus {
            code: 0,
            cause: ExitCause::Exited,
        };
        let second = ExitStatus {
            code: 9,
            cause: ExitCause::HandlerFault,
        };
        gate.open(first);
        gate.open(second);
        assert_eq!(gate.status(), Some(first));
    }

    #[test]
    fn test_write_stdin_rejected_before_spawn_and_after_close() {
        let shared = shared();
        let handle = ProcessHandle::from_shared(Arc::clone(&shared));

        // Not yet started: stdin does not exist.
        assert!(matches!(
            handle.write_stdin(Bytes::from_static(b"x")),
            Err(ProcPoolError::StdinClosed)
        ));

        shared.mark_started(1234);
        assert!(handle.write_stdin(Bytes::from_static(b"x")).is_ok());

        handle.close_stdin();
        assert!(matches!(
            handle.write_stdin(Bytes::from_static(b"y")),
            Err(ProcPoolError::StdinClosed)
        ));
    }

    #[test]
    fn test_refill_stdin_drains_fifo_before_handler() {
        let shared = shared();
        shared.mark_started(1);
        shared.user_wants_write.store(true, Ordering::Release);
        let mut bundle = stdin_bundle(&shared, 64);
        bundle.enqueue_write(Bytes::from_static(b"queued"));

        assert!(shared.refill_stdin(&mut bundle));
        assert_eq!(bundle.buffer.region(0, 6), b"queued");
        // FIFO took priority; the want-write flag is untouched.
        assert!(shared.user_wants_write.load(Ordering::Acquire));
    }

    #[test]
    fn test_refill_stdin_invokes_handler_and_rearms() {
        struct Feed(usize);
        impl ProcessHandler for Feed {
            fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
                self.0 += 1;
                buffer.put_slice(b"chunk");
                self.0 < 3
            }
        }

        let shared = ProcessShared::new(Box::new(Feed(0)));
        shared.mark_started(1);
        shared.user_wants_write.store(true, Ordering::Release);
        let mut bundle = stdin_bundle(&shared, 64);

        assert!(shared.refill_stdin(&mut bundle));
        assert_eq!(bundle.remaining_write, 5);
        assert!(shared.user_wants_write.load(Ordering::Acquire));

        bundle.advance_write(5);
        assert!(shared.refill_stdin(&mut bundle));
        bundle.advance_write(5);

        // Third call returns false: no re-arm.
        assert!(shared.refill_stdin(&mut bundle));
        bundle.advance_write(5);
        assert!(!shared.user_wants_write.load(Ordering::Acquire));
        assert!(!shared.refill_stdin(&mut bundle));
    }

    #[test]
    fn test_refill_stdin_skips_handler_during_deferred_close() {
        let shared = shared();
        shared.mark_started(1);
        shared.user_wants_write.store(true, Ordering::Release);
        let mut bundle = stdin_bundle(&shared, 64);
        bundle.close_pending = true;

        assert!(!shared.refill_stdin(&mut bundle));
        // Flag untouched: the handler was never consulted.
        assert!(shared.user_wants_write.load(Ordering::Acquire));
    }

    #[test]
    fn test_dispatch_read_carries_unconsumed_prefix() {
        struct Record {
            seen: Arc<Mutex<Vec<Vec<u8>>>>,
            consume: bool,
        }
        impl ProcessHandler for Record {
            fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
                self.seen.lock().unwrap().push(buffer.as_slice().to_vec());
                if self.consume {
                    buffer.set_position(buffer.limit());
                }
                self.consume = true;
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = ProcessShared::new(Box::new(Record {
            seen: Arc::clone(&seen),
            consume: false,
        }));
        let mut buffer = IoBuffer::new(64);

        // First read: "abc" lands in the fill region; handler consumes
        // nothing, so compaction carries the full prefix.
        buffer.writable()[..3].copy_from_slice(b"abc");
        assert!(shared.dispatch_read(StreamId::Stdout, &mut buffer, 3).is_ok());
        assert_eq!(buffer.position(), 3);

        // Second read: "def" appended after the carried bytes; handler sees
        // the same prefix followed by the new data, and consumes all of it.
        buffer.writable()[..3].copy_from_slice(b"def");
        assert!(shared.dispatch_read(StreamId::Stdout, &mut buffer, 3).is_ok());
        assert_eq!(buffer.position(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[b"abc".to_vec(), b"abcdef".to_vec()]);
    }

    #[test]
    fn test_dispatch_read_full_buffer_is_fatal() {
        // Handler never consumes; a capacity-sized read must fault.
        let shared = shared();
        let mut buffer = IoBuffer::new(8);
        let result = shared.dispatch_read(StreamId::Stdout, &mut buffer, 8);
        assert!(matches!(
            result,
            Err(ProcPoolError::HandlerDidNotConsume("stdout"))
        ));
    }

    #[test]
    fn test_dispatch_eof_flips_leftovers() {
        struct Final(Arc<AtomicUsize>);
        impl ProcessHandler for Final {
            fn on_stderr(&mut self, buffer: &mut IoBuffer, closed: bool) {
                assert!(closed);
                self.0.store(buffer.remaining(), Ordering::Release);
            }
        }

        let remaining = Arc::new(AtomicUsize::new(usize::MAX));
        let shared = ProcessShared::new(Box::new(Final(Arc::clone(&remaining))));
        let mut buffer = IoBuffer::new(16);
        buffer.put_slice(b"tail");
        shared.dispatch_eof(StreamId::Stderr, &mut buffer);
        assert_eq!(remaining.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_deliver_exit_exactly_once() {
        struct CountExits(Arc<AtomicUsize>);
        impl ProcessHandler for CountExits {
            fn on_exit(&mut self, _status: ExitStatus) {
                self.0.fetch_add(1, Ordering::AcqRel);
            }
        }

        let exits = Arc::new(AtomicUsize::new(0));
        let shared = ProcessShared::new(Box::new(CountExits(Arc::clone(&exits))));
        shared.mark_started(42);

        let status = ExitStatus {
            code: 0,
            cause: ExitCause::Exited,
        };
        shared.deliver_exit(status);
        shared.deliver_exit(status);
        assert_eq!(exits.load(Ordering::Acquire), 1);

        let handle = ProcessHandle::from_shared(shared);
        assert!(!handle.is_running());
        assert_eq!(handle.wait_for(Duration::ZERO), Some(status));
    }

    #[test]
    fn test_handler_panic_is_contained() {
        struct Panics;
        impl ProcessHandler for Panics {
            fn on_stdout(&mut self, _buffer: &mut IoBuffer, _closed: bool) {
                panic!("user bug");
            }
        }

        let shared = ProcessShared::new(Box::new(Panics));
        let mut buffer = IoBuffer::new(64);
        // Panic is caught; the read itself is not fatal (buffer not full).
        assert!(shared.dispatch_read(StreamId::Stdout, &mut buffer, 3).is_ok());
    }

    #[test]
    fn test_replacement_handler_applied_at_next_callback() {
        struct Tag(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl ProcessHandler for Tag {
            fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
                self.1.lock().unwrap().push(self.0);
                buffer.set_position(buffer.limit());
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = ProcessShared::new(Box::new(Tag("first", Arc::clone(&log))));
        let handle = ProcessHandle::from_shared(Arc::clone(&shared));

        let mut buffer = IoBuffer::new(64);
        shared
            .dispatch_read(StreamId::Stdout, &mut buffer, 1)
            .unwrap();

        handle.set_process_handler(Box::new(Tag("second", Arc::clone(&log))));
        shared
            .dispatch_read(StreamId::Stdout, &mut buffer, 1)
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_destroy_levels_escalate_but_never_downgrade() {
        let shared = shared();
        let handle = ProcessHandle::from_shared(Arc::clone(&shared));
        assert_eq!(shared.destroy_requested(), None);
        handle.destroy(false);
        assert_eq!(shared.destroy_requested(), Some(false));
        handle.destroy(true);
        assert_eq!(shared.destroy_requested(), Some(true));
        handle.destroy(false);
        assert_eq!(shared.destroy_requested(), Some(true));
    }
}
