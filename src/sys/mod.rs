//! Platform dialects.
//!
//! Two implementations of the same contract sit below this module:
//!
//! - `unix` — readiness-based: anonymous pipes made non-blocking, an
//!   epoll/kqueue multiplexer (via `mio`), and non-blocking child reaping.
//!   Readiness events are translated into read/write attempts that loop
//!   until the kernel reports `WouldBlock`.
//! - `windows` — completion-based: named pipes opened overlapped, an I/O
//!   completion port, and suspended process creation. Completion records
//!   carry the transferred byte count directly and each consumed completion
//!   re-posts the next overlapped operation.
//!
//! Everything above this boundary — the write pipeline, handler dispatch,
//! exit detection and delivery — is shared code in `process`/`pipe`; the
//! dialects only perform the syscalls and feed the results in.
//!
//! Each dialect exports the same surface: `LoopIo`/`LoopWaker` (multiplexer
//! state and its cross-thread wakeup), `Registration` (a freshly spawned
//! child plus its endpoints), `spawn_child`, `terminate`, and `run` (the
//! event-loop body).

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::{run, spawn_child, terminate, LoopIo, LoopWaker, Registration};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{run, spawn_child, terminate, LoopIo, LoopWaker, Registration};
