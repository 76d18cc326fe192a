//! The POSIX event loop.
//!
//! One thread per running processor. Each iteration drains the inbound
//! request queue, waits on the multiplexer with a bounded timeout, translates
//! readiness into read/write attempts (looping until the kernel reports
//! `WouldBlock`, as edge-triggered registration requires), and finally polls
//! for child exits. Exit is delivered only once the OS wait has confirmed it
//! AND both output streams have reported end-of-stream, so the final bytes
//! always precede `on_exit`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::unix::SourceFd;
use mio::{Interest, Poll, Token};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::pipe::PipeBundle;
use crate::process::{ExitCause, ExitStatus, ProcessShared, StreamId};
use crate::processor::{ProcessorInner, Request};

use super::{spawn::terminate, LoopIo, Registration, WAKE_TOKEN};

/// Bound on one multiplexer wait; also bounds how stale the inbound queue
/// can get if a wakeup is lost.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-process state owned by the loop thread.
struct ProcState {
    shared: Arc<ProcessShared>,
    child: std::process::Child,
    stdin: Option<PipeBundle<OwnedFd>>,
    stdout: Option<PipeBundle<OwnedFd>>,
    stderr: Option<PipeBundle<OwnedFd>>,
    out_closed: bool,
    err_closed: bool,
    /// OS-confirmed exit, held until both outputs have drained.
    reaped: Option<ExitStatus>,
}

impl ProcState {
    fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Which endpoint a multiplexer token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointId {
    Stdin,
    Stdout,
    Stderr,
}

type Routes = HashMap<Token, (u32, EndpointId)>;

/// Outcome of draining one readable endpoint.
enum ReadOutcome {
    /// Kernel has no more bytes for now; stay registered.
    Blocked,
    /// End-of-stream.
    Eof,
    /// Handler left the buffer full; fatal for the process.
    Fault,
    /// Kernel error on the endpoint; tear it down.
    Error(io::Error),
}

/// Outcome of running the stdin write pipeline.
enum WriteOutcome {
    /// Kernel buffer is full; arm write readiness.
    Blocked,
    /// Nothing left to write and no write intent.
    Dry,
    /// The pipe broke (EPIPE or similar); close the endpoint.
    Broken,
}

/// Event-loop body. Takes the parked multiplexer state, runs until the
/// process map drains (or shutdown), and parks the state back.
pub(crate) fn run(inner: &ProcessorInner) {
    let taken = {
        let mut slot = inner.io.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take()
    };
    let Some(mut io) = taken else {
        tracing::error!(processor = inner.index, "loop started without multiplexer state");
        inner.running.store(false, Ordering::Release);
        return;
    };

    tracing::debug!(processor = inner.index, "processor loop starting");
    let mut procs: HashMap<u32, ProcState> = HashMap::new();
    let mut routes: Routes = HashMap::new();

    loop {
        // 1. Drain cross-thread requests. Bounded by the queue length at
        // entry so a request re-enqueued during the drain (the zero-byte
        // want-write retry) waits for the next iteration.
        for _ in 0..inner.inbound.len() {
            let Some(request) = inner.inbound.pop() else {
                break;
            };
            match request {
                Request::Register(registration) => {
                    register_process(&mut io.poll, &mut routes, &mut procs, inner, registration);
                }
                Request::WantWrite(shared) => {
                    if let Some(proc) = shared.pid().and_then(|pid| procs.get_mut(&pid)) {
                        pump_stdin(&io.poll, &mut routes, proc, inner);
                    }
                }
                Request::CloseStdin(shared) => {
                    if let Some(proc) = shared.pid().and_then(|pid| procs.get_mut(&pid)) {
                        if let Some(bundle) = proc.stdin.as_mut() {
                            bundle.close_pending = true;
                        }
                        pump_stdin(&io.poll, &mut routes, proc, inner);
                    }
                }
                Request::Shutdown => {
                    tracing::debug!(processor = inner.index, "processor loop shutting down");
                    inner.stop(io);
                    return;
                }
            }
        }

        // The loop winds down when it has nothing left to drive.
        if procs.is_empty() {
            match inner.try_stop(io) {
                Some(reclaimed) => {
                    io = reclaimed;
                    continue;
                }
                None => {
                    tracing::debug!(processor = inner.index, "processor loop idle, stopping");
                    return;
                }
            }
        }

        // 2. Wait for readiness.
        if let Err(err) = io.poll.poll(&mut io.events, Some(POLL_TIMEOUT)) {
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!(processor = inner.index, %err, "multiplexer wait failed");
            }
        }

        // 3. Dispatch events.
        let LoopIo { poll, events } = &mut io;
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let Some(&(pid, endpoint)) = routes.get(&token) else {
                continue;
            };
            let Some(proc) = procs.get_mut(&pid) else {
                continue;
            };
            match endpoint {
                EndpointId::Stdout => pump_read(poll, &mut routes, proc, StreamId::Stdout),
                EndpointId::Stderr => pump_read(poll, &mut routes, proc, StreamId::Stderr),
                EndpointId::Stdin => pump_stdin(poll, &mut routes, proc, inner),
            }
        }

        // 4./5. Reap exits; deliver once both outputs have drained.
        reap_exits(inner, &mut io.poll, &mut routes, &mut procs);
    }
}

/// Wire a freshly spawned process into the loop.
///
/// `on_start` runs first, before any endpoint can produce an event, which
/// pins the callback ordering guarantee.
fn register_process(
    poll: &mut Poll,
    routes: &mut Routes,
    procs: &mut HashMap<u32, ProcState>,
    inner: &ProcessorInner,
    registration: Registration,
) {
    let Registration { shared, spawned } = registration;
    shared.call_start();

    let pid = spawned.child.id();
    let mut proc = ProcState {
        stdin: Some(PipeBundle::new(
            spawned.stdin,
            DEFAULT_BUFFER_CAPACITY,
            shared.write_queue(),
        )),
        stdout: Some(PipeBundle::new(
            spawned.stdout,
            DEFAULT_BUFFER_CAPACITY,
            Arc::new(SegQueue::new()),
        )),
        stderr: Some(PipeBundle::new(
            spawned.stderr,
            DEFAULT_BUFFER_CAPACITY,
            Arc::new(SegQueue::new()),
        )),
        out_closed: false,
        err_closed: false,
        reaped: None,
        shared,
        child: spawned.child,
    };

    register_output(poll, routes, &mut proc, pid, StreamId::Stdout);
    register_output(poll, routes, &mut proc, pid, StreamId::Stderr);

    // Edge-triggered registration reports nothing for data that arrived
    // before the add; drain both outputs once immediately.
    pump_read(poll, routes, &mut proc, StreamId::Stdout);
    pump_read(poll, routes, &mut proc, StreamId::Stderr);

    // Writes enqueued (or intent asserted) before registration need an
    // initial pump for the same reason.
    if proc.shared.user_wants_write.load(Ordering::Acquire)
        || proc.stdin.as_ref().is_some_and(|b| b.has_pending_writes())
    {
        pump_stdin(poll, routes, &mut proc, inner);
    }

    procs.insert(pid, proc);
}

/// Attach one output endpoint to the multiplexer for read readiness.
///
/// A registration failure is a kernel error on the endpoint: it is torn
/// down and the stream reported closed, but the process keeps running.
fn register_output(
    poll: &Poll,
    routes: &mut Routes,
    proc: &mut ProcState,
    pid: u32,
    stream: StreamId,
) {
    let endpoint = match stream {
        StreamId::Stdout => EndpointId::Stdout,
        StreamId::Stderr => EndpointId::Stderr,
    };
    let slot = match stream {
        StreamId::Stdout => &mut proc.stdout,
        StreamId::Stderr => &mut proc.stderr,
    };
    let registered = if let Some(bundle) = slot.as_mut() {
        let fd = bundle.endpoint.as_raw_fd();
        match poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
        {
            Ok(()) => {
                bundle.registered = true;
                routes.insert(Token(fd as usize), (pid, endpoint));
                true
            }
            Err(err) => {
                tracing::error!(pid, stream = stream.name(), %err, "failed to register endpoint");
                false
            }
        }
    } else {
        true
    };
    if !registered {
        close_output(poll, routes, proc, stream);
    }
}

/// Drain one readable output endpoint until the kernel blocks, EOF, or a
/// handler fault.
fn pump_read(poll: &Poll, routes: &mut Routes, proc: &mut ProcState, stream: StreamId) {
    let shared = Arc::clone(&proc.shared);
    let slot = match stream {
        StreamId::Stdout => &mut proc.stdout,
        StreamId::Stderr => &mut proc.stderr,
    };
    let Some(bundle) = slot.as_mut() else {
        return;
    };
    if bundle.closed {
        return;
    }

    let outcome = drain_endpoint(&shared, bundle, stream);
    match outcome {
        ReadOutcome::Blocked => {}
        ReadOutcome::Eof => close_output(poll, routes, proc, stream),
        ReadOutcome::Error(err) => {
            tracing::warn!(pid = proc.pid(), stream = stream.name(), %err, "endpoint error");
            close_output(poll, routes, proc, stream);
        }
        ReadOutcome::Fault => fault_process(poll, routes, proc),
    }
}

fn drain_endpoint(
    shared: &ProcessShared,
    bundle: &mut PipeBundle<OwnedFd>,
    stream: StreamId,
) -> ReadOutcome {
    loop {
        let fd = bundle.endpoint.as_raw_fd();
        let region = bundle.buffer.writable();
        if region.is_empty() {
            // No room to read: the handler stopped consuming.
            return ReadOutcome::Fault;
        }
        let n = unsafe { libc::read(fd, region.as_mut_ptr().cast(), region.len()) };
        if n > 0 {
            if shared
                .dispatch_read(stream, &mut bundle.buffer, n as usize)
                .is_err()
            {
                return ReadOutcome::Fault;
            }
        } else if n == 0 {
            return ReadOutcome::Eof;
        } else {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return ReadOutcome::Blocked,
                io::ErrorKind::Interrupted => continue,
                _ => return ReadOutcome::Error(err),
            }
        }
    }
}

/// Tear down one output endpoint, delivering the final `closed = true`
/// callback with any unconsumed bytes.
fn close_output(poll: &Poll, routes: &mut Routes, proc: &mut ProcState, stream: StreamId) {
    let slot = match stream {
        StreamId::Stdout => &mut proc.stdout,
        StreamId::Stderr => &mut proc.stderr,
    };
    let Some(mut bundle) = slot.take() else {
        return;
    };
    bundle.mark_closed();
    deregister(poll, routes, &bundle);
    proc.shared.dispatch_eof(stream, &mut bundle.buffer);
    match stream {
        StreamId::Stdout => proc.out_closed = true,
        StreamId::Stderr => proc.err_closed = true,
    }
    // Dropping the bundle closes the fd and frees the direct buffer.
}

/// Handler-did-not-consume: kill the child and force every endpoint down.
/// The terminal status is delivered by the reap pass with `HandlerFault`.
fn fault_process(poll: &Poll, routes: &mut Routes, proc: &mut ProcState) {
    proc.shared.set_handler_fault();
    terminate(proc.pid(), true);
    if !proc.out_closed {
        close_output(poll, routes, proc, StreamId::Stdout);
    }
    if !proc.err_closed {
        close_output(poll, routes, proc, StreamId::Stderr);
    }
    close_stdin(poll, routes, proc);
}

/// Run the stdin write pipeline until the kernel blocks or it runs dry.
fn pump_stdin(poll: &Poll, routes: &mut Routes, proc: &mut ProcState, inner: &ProcessorInner) {
    let shared = Arc::clone(&proc.shared);
    let pid = proc.pid();

    let (outcome, fd, registered, close_requested) = {
        let Some(bundle) = proc.stdin.as_mut() else {
            return;
        };
        if bundle.closed {
            return;
        }
        let outcome = loop {
            if bundle.remaining_write > 0 {
                let fd = bundle.endpoint.as_raw_fd();
                let slice = bundle
                    .buffer
                    .region(bundle.write_offset, bundle.remaining_write);
                let n = unsafe { libc::write(fd, slice.as_ptr().cast(), slice.len()) };
                if n > 0 {
                    bundle.advance_write(n as usize);
                } else if n == 0 {
                    break WriteOutcome::Blocked;
                } else {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::WouldBlock => break WriteOutcome::Blocked,
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            tracing::debug!(pid, %err, "stdin write failed");
                            break WriteOutcome::Broken;
                        }
                    }
                }
            } else if !shared.refill_stdin(bundle) {
                break WriteOutcome::Dry;
            }
        };
        (
            outcome,
            bundle.endpoint.as_raw_fd(),
            bundle.registered,
            bundle.close_pending,
        )
    };

    match outcome {
        WriteOutcome::Blocked => {
            // Arm write readiness; the next writable edge resumes the pump.
            if !registered {
                match poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(fd as usize), Interest::WRITABLE)
                {
                    Ok(()) => {
                        if let Some(bundle) = proc.stdin.as_mut() {
                            bundle.registered = true;
                        }
                        routes.insert(Token(fd as usize), (pid, EndpointId::Stdin));
                    }
                    Err(err) => {
                        tracing::error!(pid, %err, "failed to arm stdin");
                        shared.mark_stdin_closed();
                        close_stdin(poll, routes, proc);
                    }
                }
            }
        }
        WriteOutcome::Broken => {
            shared.mark_stdin_closed();
            close_stdin(poll, routes, proc);
        }
        WriteOutcome::Dry => {
            if registered {
                deregister_fd(poll, routes, fd);
                if let Some(bundle) = proc.stdin.as_mut() {
                    bundle.registered = false;
                }
            }
            if close_requested {
                close_stdin(poll, routes, proc);
            } else if shared.user_wants_write.load(Ordering::Acquire) {
                // A handler returned true without staging bytes; try again
                // on the next loop iteration rather than spinning here.
                inner.inbound.push(Request::WantWrite(shared));
                inner.waker.wake();
            }
        }
    }
}

/// Close the stdin endpoint without callbacks. Idempotent.
fn close_stdin(poll: &Poll, routes: &mut Routes, proc: &mut ProcState) {
    if let Some(bundle) = proc.stdin.take() {
        deregister(poll, routes, &bundle);
    }
}

fn deregister(poll: &Poll, routes: &mut Routes, bundle: &PipeBundle<OwnedFd>) {
    if bundle.registered {
        deregister_fd(poll, routes, bundle.endpoint.as_raw_fd());
    } else {
        routes.remove(&Token(bundle.endpoint.as_raw_fd() as usize));
    }
}

fn deregister_fd(poll: &Poll, routes: &mut Routes, fd: std::os::fd::RawFd) {
    if let Err(err) = poll.registry().deregister(&mut SourceFd(&fd)) {
        tracing::warn!(fd, %err, "failed to deregister endpoint");
    }
    routes.remove(&Token(fd as usize));
}

/// Poll for child exits and deliver terminal transitions.
///
/// A process exits when the OS wait has confirmed termination and both
/// output streams have reported end-of-stream. With soft-exit detection
/// enabled, only processes whose outputs are already closed are polled
/// (closure of both streams is the exit hint); without it every child is
/// polled every iteration.
fn reap_exits(
    inner: &ProcessorInner,
    poll: &mut Poll,
    routes: &mut Routes,
    procs: &mut HashMap<u32, ProcState>,
) {
    let mut finished: Vec<u32> = Vec::new();

    for (pid, proc) in procs.iter_mut() {
        if proc.reaped.is_none() {
            let candidate =
                !inner.soft_exit_detection || (proc.out_closed && proc.err_closed);
            if candidate {
                match proc.child.try_wait() {
                    Ok(Some(status)) => {
                        proc.reaped = Some(map_exit(&proc.shared, status));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(pid, %err, "wait failed; treating child as exited");
                        proc.reaped = Some(ExitStatus {
                            code: -1,
                            cause: ExitCause::Exited,
                        });
                    }
                }
            }
        }
        if proc.reaped.is_some() && proc.out_closed && proc.err_closed {
            finished.push(*pid);
        }
    }

    for pid in finished {
        if let Some(mut proc) = procs.remove(&pid) {
            close_stdin(poll, routes, &mut proc);
            if let Some(status) = proc.reaped {
                tracing::trace!(pid, code = status.code, "delivering exit");
                proc.shared.deliver_exit(status);
            }
        }
    }
}

/// Translate an OS wait status into the crate's explicit exit shape.
fn map_exit(shared: &ProcessShared, status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    let (code, base) = match status.code() {
        Some(code) => (code, ExitCause::Exited),
        None => (0, ExitCause::Signaled(status.signal().unwrap_or(0))),
    };
    let cause = if shared.handler_fault() {
        ExitCause::HandlerFault
    } else if status.code().is_none() {
        match shared.destroy_requested() {
            Some(force) => ExitCause::Destroyed { force },
            None => base,
        }
    } else {
        base
    };
    ExitStatus { code, cause }
}
