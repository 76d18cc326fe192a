//! Processor shell: the cross-thread surface of one event loop.
//!
//! Each processor owns one kernel multiplexer and a single thread driving a
//! subset of processes. Everything other threads may do to a processor goes
//! through [`Processor::submit`]: requests land on a lock-free queue that the
//! loop drains at the top of every iteration, and a wakeup is posted to the
//! multiplexer so a sleeping loop notices immediately.
//!
//! The thread itself is started lazily, on the first registration after the
//! loop last went idle. The registering caller synchronizes with the new
//! thread through a two-party barrier so the loop is fully initialized before
//! the registration returns. When a loop's process map drains empty it parks
//! its multiplexer state back into the shell and the thread exits; the next
//! registration starts a fresh one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::thread;

use crossbeam_queue::SegQueue;

use crate::process::ProcessShared;
use crate::sys;

/// A cross-thread request to a processor, drained on its loop thread.
pub(crate) enum Request {
    /// Hand a freshly spawned process (with its pipe endpoints) to the loop.
    Register(sys::Registration),
    /// Arm the stdin endpoint: enqueued writes or `want_write` intent exist.
    WantWrite(Arc<ProcessShared>),
    /// Close the stdin endpoint once already-enqueued writes have drained.
    CloseStdin(Arc<ProcessShared>),
    /// Stop the loop thread.
    Shutdown,
}

pub(crate) struct ProcessorInner {
    pub(crate) index: usize,
    pub(crate) inbound: SegQueue<Request>,
    pub(crate) running: AtomicBool,
    /// Pairs the lazy-started loop thread with the registering caller.
    pub(crate) start_barrier: Barrier,
    /// Multiplexer state, parked here while no thread is running.
    pub(crate) io: Mutex<Option<sys::LoopIo>>,
    pub(crate) waker: sys::LoopWaker,
    /// Whether closed output streams gate exit polling (soft-exit fast path).
    pub(crate) soft_exit_detection: bool,
}

/// Cloneable handle to one processor.
#[derive(Clone)]
pub(crate) struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    pub(crate) fn new(index: usize, soft_exit_detection: bool) -> std::io::Result<Self> {
        let (io, waker) = sys::LoopIo::new()?;
        Ok(Self {
            inner: Arc::new(ProcessorInner {
                index,
                inbound: SegQueue::new(),
                running: AtomicBool::new(false),
                start_barrier: Barrier::new(2),
                io: Mutex::new(Some(io)),
                waker,
                soft_exit_detection,
            }),
        })
    }

    /// Enqueue a request and wake the loop.
    pub(crate) fn submit(&self, request: Request) {
        self.inner.inbound.push(request);
        self.inner.waker.wake();
    }

    /// Register a process: enqueue the registration, then make sure a loop
    /// thread is running to serve it. Blocks (briefly) only when this call is
    /// the one that starts the thread.
    pub(crate) fn register(&self, registration: sys::Registration) {
        self.submit(Request::Register(registration));
        self.ensure_running();
    }

    fn ensure_running(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let name = format!("procpool-io-{}", self.inner.index);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            inner.start_barrier.wait();
            sys::run(&inner);
        });
        match spawned {
            Ok(_) => {
                self.inner.start_barrier.wait();
            }
            Err(err) => {
                tracing::error!(processor = self.inner.index, %err, "failed to start I/O thread");
                self.inner.running.store(false, Ordering::Release);
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.inner.running.load(Ordering::Acquire) {
            self.submit(Request::Shutdown);
        }
    }
}

impl ProcessorInner {
    /// Park the multiplexer state and try to stop.
    ///
    /// Returns the state back if a request raced in after the loop went
    /// idle, in which case the loop must continue.
    pub(crate) fn try_stop(&self, io: sys::LoopIo) -> Option<sys::LoopIo> {
        *self.io.lock().unwrap_or_else(PoisonError::into_inner) = Some(io);
        self.running.store(false, Ordering::Release);

        if !self.inbound.is_empty()
            && self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // We won the race against ensure_running; reclaim the state.
            return self
                .io
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        None
    }

    /// Park the multiplexer state unconditionally (shutdown path).
    pub(crate) fn stop(&self, io: sys::LoopIo) {
        *self.io.lock().unwrap_or_else(PoisonError::into_inner) = Some(io);
        self.running.store(false, Ordering::Release);
    }
}
