//! Windows dialect: named pipes with overlapped I/O over a completion port.

mod processor;
mod spawn;

pub(crate) use processor::run;
pub(crate) use spawn::{spawn_child, terminate, Spawned};

use std::io;
use std::sync::Arc;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, PostQueuedCompletionStatus, OVERLAPPED,
};

use crate::process::ProcessShared;

/// Completion key reserved for cross-thread wakeups.
pub(crate) const WAKE_KEY: usize = usize::MAX;

/// Raw handle wrapper that closes on drop and may cross threads.
///
/// Kernel handles are thread-agnostic; the raw-pointer representation is
/// what keeps `HANDLE` from being `Send` on its own.
pub(crate) struct Handle(pub(crate) HANDLE);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub(crate) fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

/// One parent-side pipe endpoint: the overlapped handle, its completion key,
/// and the stable overlapped record reused for every operation.
pub(crate) struct WinEndpoint {
    pub(crate) handle: Handle,
    pub(crate) key: usize,
    /// Boxed so the kernel-visible address never moves.
    pub(crate) overlapped: Box<OVERLAPPED>,
}

/// A spawned (still suspended) child and its endpoints.
pub(crate) struct Spawned {
    pub(crate) process: Handle,
    /// Main-thread handle, resumed by the processor after `on_start`.
    pub(crate) thread: Handle,
    pub(crate) pid: u32,
    pub(crate) stdin: WinEndpoint,
    pub(crate) stdout: WinEndpoint,
    pub(crate) stderr: WinEndpoint,
}

/// A freshly spawned child queued to a processor.
pub(crate) struct Registration {
    pub(crate) shared: Arc<ProcessShared>,
    pub(crate) spawned: Spawned,
}

/// The completion port owned by the loop thread.
pub(crate) struct LoopIo {
    pub(crate) port: Arc<Handle>,
}

/// Cross-thread wakeup: posts a zero-byte completion under [`WAKE_KEY`].
pub(crate) struct LoopWaker {
    port: Arc<Handle>,
}

impl LoopIo {
    pub(crate) fn new() -> io::Result<(Self, LoopWaker)> {
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        let port = Arc::new(Handle(port));
        Ok((
            Self {
                port: Arc::clone(&port),
            },
            LoopWaker { port },
        ))
    }
}

impl LoopWaker {
    pub(crate) fn wake(&self) {
        let posted = unsafe {
            PostQueuedCompletionStatus(self.port.raw(), 0, WAKE_KEY, std::ptr::null())
        };
        if posted == 0 {
            tracing::warn!(
                err = %io::Error::last_os_error(),
                "failed to wake processor loop"
            );
        }
    }
}
