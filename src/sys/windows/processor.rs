//! The Windows event loop.
//!
//! One thread per running processor, parked in `GetQueuedCompletionStatus`.
//! Overlapped reads stay posted on both output pipes; each completion is
//! dispatched through the shared pipeline and the next operation re-posted.
//! Writes keep at most one overlapped operation in flight per process, with
//! the shared refill pipeline staging bytes between completions. Exit is
//! confirmed by polling the process handle's exit code and delivered only
//! once both output pipes have broken, so the final bytes always precede
//! `on_exit`.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use crossbeam_queue::SegQueue;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING,
    ERROR_OPERATION_ABORTED,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::Threading::{GetExitCodeProcess, ResumeThread};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::pipe::PipeBundle;
use crate::process::{ExitCause, ExitStatus, ProcessShared, StreamId};
use crate::processor::{ProcessorInner, Request};

use super::{spawn::terminate, Handle, LoopIo, Registration, WinEndpoint, WAKE_KEY};

/// Bound on one completion wait, in milliseconds.
const WAIT_TIMEOUT_MS: u32 = 100;

/// `GetExitCodeProcess` sentinel for a live process. A child that really
/// exits with 259 is indistinguishable; that is a platform-wide caveat.
const STILL_ACTIVE: u32 = 259;

struct ProcState {
    shared: Arc<ProcessShared>,
    process: Handle,
    pid: u32,
    stdin: Option<PipeBundle<WinEndpoint>>,
    stdout: Option<PipeBundle<WinEndpoint>>,
    stderr: Option<PipeBundle<WinEndpoint>>,
    out_closed: bool,
    err_closed: bool,
    reaped: Option<ExitStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointId {
    Stdin,
    Stdout,
    Stderr,
}

type Routes = HashMap<usize, (u32, EndpointId)>;

/// Endpoints closed while an overlapped operation was still in flight are
/// held here until their abort completion arrives, keeping the buffer and
/// OVERLAPPED record alive for the kernel.
type Graveyard = HashMap<usize, PipeBundle<WinEndpoint>>;

enum PostOutcome {
    /// Operation pending (or already complete); a completion will arrive.
    Pending,
    /// The pipe has broken: end-of-stream.
    Broken,
    /// Some other kernel error.
    Error(io::Error),
}

pub(crate) fn run(inner: &ProcessorInner) {
    let taken = {
        let mut slot = inner.io.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take()
    };
    let Some(mut io) = taken else {
        tracing::error!(processor = inner.index, "loop started without completion port");
        inner.running.store(false, Ordering::Release);
        return;
    };

    tracing::debug!(processor = inner.index, "processor loop starting");
    let mut procs: HashMap<u32, ProcState> = HashMap::new();
    let mut routes: Routes = HashMap::new();
    let mut graveyard: Graveyard = HashMap::new();

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
                    register_process(
                        &io,
                        &mut routes,
                        &mut graveyard,
                        &mut procs,
                        inner,
                        registration,
                    );
                }
                Request::WantWrite(shared) => {
                    if let Some(proc) = shared.pid().and_then(|pid| procs.get_mut(&pid)) {
                        pump_stdin(&mut routes, &mut graveyard, proc, inner);
                    }
                }
                Request::CloseStdin(shared) => {
                    if let Some(proc) = shared.pid().and_then(|pid| procs.get_mut(&pid)) {
                        if let Some(bundle) = proc.stdin.as_mut() {
                            bundle.close_pending = true;
                        }
                        pump_stdin(&mut routes, &mut graveyard, proc, inner);
                    }
                }
                Request::Shutdown => {
                    tracing::debug!(processor = inner.index, "processor loop shutting down");
                    inner.stop(io);
                    return;
                }
            }
        }

        if procs.is_empty() && graveyard.is_empty() {
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

        // 2./3. Wait for one completion, then drain without blocking.
        let mut timeout = WAIT_TIMEOUT_MS;
        loop {
            let mut transferred: u32 = 0;
            let mut key: usize = 0;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            let ok = unsafe {
                GetQueuedCompletionStatus(
                    io.port.raw(),
                    &mut transferred,
                    &mut key,
                    &mut overlapped,
                    timeout,
                )
            };
            timeout = 0;

            if ok == 0 {
                if overlapped.is_null() {
                    // Timed out: the queue is drained.
                    break;
                }
                let err = unsafe { GetLastError() };
                dispatch_failure(&mut routes, &mut graveyard, &mut procs, key, err);
            } else {
                if key == WAKE_KEY {
                    continue;
                }
                dispatch_success(
                    &mut routes,
                    &mut graveyard,
                    &mut procs,
                    inner,
                    key,
                    transferred as usize,
                );
            }
        }

        // 4./5. Reap exits; deliver once both outputs have broken.
        reap_exits(inner, &mut routes, &mut graveyard, &mut procs);
    }
}

fn register_process(
    io: &LoopIo,
    routes: &mut Routes,
    graveyard: &mut Graveyard,
    procs: &mut HashMap<u32, ProcState>,
    inner: &ProcessorInner,
    registration: Registration,
) {
    let Registration { shared, spawned } = registration;
    shared.call_start();

    let pid = spawned.pid;
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
        process: spawned.process,
        pid,
    };

    for (endpoint, stream) in [
        (EndpointId::Stdout, Some(StreamId::Stdout)),
        (EndpointId::Stderr, Some(StreamId::Stderr)),
        (EndpointId::Stdin, None),
    ] {
        let bundle = match endpoint {
            EndpointId::Stdout => proc.stdout.as_ref(),
            EndpointId::Stderr => proc.stderr.as_ref(),
            EndpointId::Stdin => proc.stdin.as_ref(),
        };
        let Some(bundle) = bundle else { continue };
        let key = bundle.endpoint.key;
        let associated = unsafe {
            CreateIoCompletionPort(bundle.endpoint.handle.raw(), io.port.raw(), key, 0)
        };
        if associated.is_null() {
            let err = io::Error::last_os_error();
            tracing::error!(pid, %err, "failed to associate endpoint with completion port");
            if let Some(stream) = stream {
                close_output(routes, graveyard, &mut proc, stream);
            }
            continue;
        }
        routes.insert(key, (pid, endpoint));
    }

    // Keep a read posted on both outputs from the start.
    start_read(routes, graveyard, &mut proc, StreamId::Stdout);
    start_read(routes, graveyard, &mut proc, StreamId::Stderr);

    if proc.shared.user_wants_write.load(Ordering::Acquire)
        || proc.stdin.as_ref().is_some_and(|b| b.has_pending_writes())
    {
        pump_stdin(routes, graveyard, &mut proc, inner);
    }

    // The child was created suspended; everything is wired, let it run.
    unsafe {
        ResumeThread(spawned.thread.raw());
    }
    drop(spawned.thread);

    procs.insert(pid, proc);
}

/// Post (or re-post) the overlapped read on one output endpoint.
fn start_read(routes: &mut Routes, graveyard: &mut Graveyard, proc: &mut ProcState, stream: StreamId) {
    let slot = match stream {
        StreamId::Stdout => &mut proc.stdout,
        StreamId::Stderr => &mut proc.stderr,
    };
    let outcome = {
        let Some(bundle) = slot.as_mut() else { return };
        if bundle.closed || bundle.registered {
            return;
        }
        post_read(bundle)
    };
    match outcome {
        PostOutcome::Pending => {}
        PostOutcome::Broken => close_output(routes, graveyard, proc, stream),
        PostOutcome::Error(err) => {
            tracing::warn!(pid = proc.pid, stream = stream.name(), %err, "endpoint error");
            close_output(routes, graveyard, proc, stream);
        }
    }
}

fn post_read(bundle: &mut PipeBundle<WinEndpoint>) -> PostOutcome {
    let handle = bundle.endpoint.handle.raw();
    *bundle.endpoint.overlapped = unsafe { mem::zeroed() };
    let overlapped: *mut OVERLAPPED = &mut *bundle.endpoint.overlapped;
    let region = bundle.buffer.writable();
    if region.is_empty() {
        // No room: the handler stopped consuming. Surfaced as a fault by the
        // completion path before this can be reached, but guard anyway.
        return PostOutcome::Error(io::Error::other("read buffer full"));
    }
    let ok = unsafe {
        ReadFile(
            handle,
            region.as_mut_ptr(),
            region.len() as u32,
            std::ptr::null_mut(),
            overlapped,
        )
    };
    if ok != 0 {
        // Completed synchronously; the completion is still queued.
        bundle.registered = true;
        return PostOutcome::Pending;
    }
    match unsafe { GetLastError() } {
        ERROR_IO_PENDING => {
            bundle.registered = true;
            PostOutcome::Pending
        }
        ERROR_BROKEN_PIPE | ERROR_HANDLE_EOF => PostOutcome::Broken,
        err => PostOutcome::Error(io::Error::from_raw_os_error(err as i32)),
    }
}

fn post_write(bundle: &mut PipeBundle<WinEndpoint>) -> PostOutcome {
    let handle = bundle.endpoint.handle.raw();
    *bundle.endpoint.overlapped = unsafe { mem::zeroed() };
    let overlapped: *mut OVERLAPPED = &mut *bundle.endpoint.overlapped;
    let slice = bundle
        .buffer
        .region(bundle.write_offset, bundle.remaining_write);
    let ok = unsafe {
        WriteFile(
            handle,
            slice.as_ptr(),
            slice.len() as u32,
            std::ptr::null_mut(),
            overlapped,
        )
    };
    if ok != 0 {
        bundle.registered = true;
        return PostOutcome::Pending;
    }
    match unsafe { GetLastError() } {
        ERROR_IO_PENDING => {
            bundle.registered = true;
            PostOutcome::Pending
        }
        ERROR_BROKEN_PIPE => PostOutcome::Broken,
        err => PostOutcome::Error(io::Error::from_raw_os_error(err as i32)),
    }
}

fn dispatch_success(
    routes: &mut Routes,
    graveyard: &mut Graveyard,
    procs: &mut HashMap<u32, ProcState>,
    inner: &ProcessorInner,
    key: usize,
    transferred: usize,
) {
    if graveyard.remove(&key).is_some() {
        return;
    }
    let Some(&(pid, endpoint)) = routes.get(&key) else {
        return;
    };
    let Some(proc) = procs.get_mut(&pid) else {
        return;
    };
    match endpoint {
        EndpointId::Stdout => complete_read(routes, graveyard, proc, StreamId::Stdout, transferred),
        EndpointId::Stderr => complete_read(routes, graveyard, proc, StreamId::Stderr, transferred),
        EndpointId::Stdin => {
            if let Some(bundle) = proc.stdin.as_mut() {
                bundle.registered = false;
                bundle.advance_write(transferred.min(bundle.remaining_write));
            }
            pump_stdin(routes, graveyard, proc, inner);
        }
    }
}

fn dispatch_failure(
    routes: &mut Routes,
    graveyard: &mut Graveyard,
    procs: &mut HashMap<u32, ProcState>,
    key: usize,
    err: u32,
) {
    if graveyard.remove(&key).is_some() {
        return;
    }
    let Some(&(pid, endpoint)) = routes.get(&key) else {
        return;
    };
    let Some(proc) = procs.get_mut(&pid) else {
        return;
    };
    if err != ERROR_BROKEN_PIPE && err != ERROR_HANDLE_EOF && err != ERROR_OPERATION_ABORTED {
        tracing::warn!(
            pid,
            err = %io::Error::from_raw_os_error(err as i32),
            "endpoint completion failed"
        );
    }
    match endpoint {
        EndpointId::Stdout => {
            mark_unposted(proc.stdout.as_mut());
            close_output(routes, graveyard, proc, StreamId::Stdout);
        }
        EndpointId::Stderr => {
            mark_unposted(proc.stderr.as_mut());
            close_output(routes, graveyard, proc, StreamId::Stderr);
        }
        EndpointId::Stdin => {
            mark_unposted(proc.stdin.as_mut());
            proc.shared.mark_stdin_closed();
            close_stdin(routes, graveyard, proc);
        }
    }
}

fn mark_unposted(bundle: Option<&mut PipeBundle<WinEndpoint>>) {
    if let Some(bundle) = bundle {
        bundle.registered = false;
    }
}

/// A read completion: deliver through the shared pipeline and re-post.
fn complete_read(
    routes: &mut Routes,
    graveyard: &mut Graveyard,
    proc: &mut ProcState,
    stream: StreamId,
    transferred: usize,
) {
    let shared = Arc::clone(&proc.shared);
    let faulted = {
        let slot = match stream {
            StreamId::Stdout => &mut proc.stdout,
            StreamId::Stderr => &mut proc.stderr,
        };
        let Some(bundle) = slot.as_mut() else { return };
        bundle.registered = false;
        if bundle.closed {
            return;
        }
        if transferred == 0 {
            // Zero-byte completion on a byte pipe: treat as end-of-stream.
            None
        } else {
            match shared.dispatch_read(stream, &mut bundle.buffer, transferred) {
                Ok(()) => Some(false),
                Err(_) => Some(true),
            }
        }
    };
    match faulted {
        None => close_output(routes, graveyard, proc, stream),
        Some(true) => fault_process(routes, graveyard, proc),
        Some(false) => start_read(routes, graveyard, proc, stream),
    }
}

fn close_output(routes: &mut Routes, graveyard: &mut Graveyard, proc: &mut ProcState, stream: StreamId) {
    let slot = match stream {
        StreamId::Stdout => &mut proc.stdout,
        StreamId::Stderr => &mut proc.stderr,
    };
    let Some(mut bundle) = slot.take() else {
        return;
    };
    bundle.mark_closed();
    routes.remove(&bundle.endpoint.key);
    proc.shared.dispatch_eof(stream, &mut bundle.buffer);
    match stream {
        StreamId::Stdout => proc.out_closed = true,
        StreamId::Stderr => proc.err_closed = true,
    }
    retire(graveyard, bundle);
}

fn close_stdin(routes: &mut Routes, graveyard: &mut Graveyard, proc: &mut ProcState) {
    if let Some(bundle) = proc.stdin.take() {
        routes.remove(&bundle.endpoint.key);
        retire(graveyard, bundle);
    }
}

/// Drop a bundle, or park it until its in-flight completion lands so the
/// kernel never writes into freed memory.
fn retire(graveyard: &mut Graveyard, bundle: PipeBundle<WinEndpoint>) {
    if bundle.registered {
        graveyard.insert(bundle.endpoint.key, bundle);
    }
}

fn fault_process(routes: &mut Routes, graveyard: &mut Graveyard, proc: &mut ProcState) {
    proc.shared.set_handler_fault();
    terminate(proc.pid, true);
    if !proc.out_closed {
        close_output(routes, graveyard, proc, StreamId::Stdout);
    }
    if !proc.err_closed {
        close_output(routes, graveyard, proc, StreamId::Stderr);
    }
    proc.shared.mark_stdin_closed();
    close_stdin(routes, graveyard, proc);
}

/// Advance the stdin write pipeline, keeping at most one overlapped write
/// in flight.
fn pump_stdin(
    routes: &mut Routes,
    graveyard: &mut Graveyard,
    proc: &mut ProcState,
    inner: &ProcessorInner,
) {
    let shared = Arc::clone(&proc.shared);
    let (outcome, close_requested) = {
        let Some(bundle) = proc.stdin.as_mut() else {
            return;
        };
        if bundle.closed || bundle.registered {
            return;
        }
        let outcome = loop {
            if bundle.remaining_write > 0 {
                break Some(post_write(bundle));
            } else if !shared.refill_stdin(bundle) {
                break None;
            }
        };
        (outcome, bundle.close_pending)
    };

    match outcome {
        Some(PostOutcome::Pending) => {}
        Some(PostOutcome::Broken) | Some(PostOutcome::Error(_)) => {
            shared.mark_stdin_closed();
            close_stdin(routes, graveyard, proc);
        }
        None => {
            if close_requested {
                close_stdin(routes, graveyard, proc);
            } else if shared.user_wants_write.load(Ordering::Acquire) {
                // A handler returned true without staging bytes; retry on
                // the next iteration rather than spinning here.
                inner.inbound.push(Request::WantWrite(shared));
                inner.waker.wake();
            }
        }
    }
}

fn reap_exits(
    inner: &ProcessorInner,
    routes: &mut Routes,
    graveyard: &mut Graveyard,
    procs: &mut HashMap<u32, ProcState>,
) {
    let mut finished: Vec<u32> = Vec::new();

    for (pid, proc) in procs.iter_mut() {
        if proc.reaped.is_none() {
            let candidate = !inner.soft_exit_detection || (proc.out_closed && proc.err_closed);
            if candidate {
                let mut code: u32 = 0;
                let ok = unsafe { GetExitCodeProcess(proc.process.raw(), &mut code) };
                if ok == 0 {
                    let err = io::Error::last_os_error();
                    tracing::warn!(pid, %err, "exit-code query failed; treating child as exited");
                    proc.reaped = Some(ExitStatus {
                        code: -1,
                        cause: ExitCause::Exited,
                    });
                } else if code != STILL_ACTIVE {
                    proc.reaped = Some(map_exit(&proc.shared, code));
                }
            }
        }
        if proc.reaped.is_some() && proc.out_closed && proc.err_closed {
            finished.push(*pid);
        }
    }

    for pid in finished {
        if let Some(mut proc) = procs.remove(&pid) {
            close_stdin(routes, graveyard, &mut proc);
            if let Some(status) = proc.reaped {
                tracing::trace!(pid, code = status.code, "delivering exit");
                proc.shared.deliver_exit(status);
            }
        }
    }
}

fn map_exit(shared: &ProcessShared, code: u32) -> ExitStatus {
    let cause = if shared.handler_fault() {
        ExitCause::HandlerFault
    } else if let Some(force) = shared.destroy_requested() {
        ExitCause::Destroyed { force }
    } else {
        ExitCause::Exited
    };
    ExitStatus {
        code: code as i32,
        cause,
    }
}
