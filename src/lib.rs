//! # procpool
//!
//! Non-blocking child-process I/O over a small, fixed pool of event-loop
//! threads.
//!
//! Spawn hundreds or thousands of concurrent children and stream bytes in
//! and out of all of them without allocating a thread per process: each
//! spawned child is dealt (round-robin) to one of a handful of *processors*,
//! single-threaded event loops that each own one kernel multiplexer and
//! drive every pipe of every process assigned to them.
//!
//! ## Architecture
//!
//! ```text
//! spawn ──► ProcessBuilder ──► round robin ──► Processor 0 ─► epoll/kqueue/IOCP
//!                                        └───► Processor 1 ─► epoll/kqueue/IOCP
//!                                                  │
//!                               on_start / on_stdout / on_stderr
//!                               on_stdin_ready / on_exit  (your handler)
//! ```
//!
//! I/O is delivered through a [`ProcessHandler`]: a fixed 64 KiB direct
//! buffer per stream is handed to the handler on every event, and the
//! handler communicates backpressure by advancing the buffer's position.
//! Writes go through [`ProcessHandle::write_stdin`] (a lock-free FIFO) or
//! the pull-style [`ProcessHandle::want_write`] / `on_stdin_ready` pair.
//!
//! Handlers run on the processor's thread: they must never block, and a slow
//! handler stalls every process on the same processor.
//!
//! ## Example
//!
//! ```ignore
//! use procpool::{IoBuffer, ProcessBuilder, ProcessHandler, ExitStatus};
//!
//! struct Echo;
//!
//! impl ProcessHandler for Echo {
//!     fn on_start(&mut self, process: &procpool::ProcessHandle) {
//!         process.write_stdin("hello\n").unwrap();
//!         process.close_stdin();
//!     }
//!     fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
//!         print!("{}", String::from_utf8_lossy(buffer.as_slice()));
//!         buffer.set_position(buffer.limit());
//!     }
//!     fn on_exit(&mut self, status: ExitStatus) {
//!         println!("exited: {}", status.code);
//!     }
//! }
//!
//! let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(Echo));
//! process.wait_for(std::time::Duration::ZERO);
//! ```
//!
//! Async callers can use [`bridge::AsyncProcess`] instead of implementing a
//! handler.

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;

mod builder;
mod pipe;
mod pool;
mod process;
mod processor;
mod sys;

pub use buffer::{IoBuffer, DEFAULT_BUFFER_CAPACITY};
pub use builder::ProcessBuilder;
pub use config::{Config, Threads};
pub use error::{ProcPoolError, Result};
pub use handler::{NopProcessHandler, ProcessHandler};
pub use pool::init;
pub use process::{ExitCause, ExitStatus, ProcessHandle};
