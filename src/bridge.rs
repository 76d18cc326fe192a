//! Async adapter over the callback surface.
//!
//! The core API is event-driven: handlers run on processor threads and must
//! never block. [`AsyncProcess`] bridges that surface to tokio for callers
//! who prefer `await`: an adapter handler forwards each stdout/stderr chunk
//! into an unbounded channel (a non-blocking send, so the processor is never
//! stalled) and resolves a oneshot on exit.
//!
//! # Example
//!
//! ```ignore
//! use procpool::bridge::AsyncProcess;
//! use procpool::ProcessBuilder;
//!
//! # async fn demo() {
//! let mut process = AsyncProcess::spawn(&ProcessBuilder::new("/bin/cat"));
//! process.write_stdin("hello\n").unwrap();
//! process.close_stdin();
//!
//! while let Some(chunk) = process.next_stdout().await {
//!     println!("{} bytes", chunk.len());
//! }
//! let status = process.wait().await;
//! assert_eq!(status.code, 0);
//! # }
//! ```

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::buffer::IoBuffer;
use crate::builder::ProcessBuilder;
use crate::error::Result;
use crate::handler::ProcessHandler;
use crate::process::{ExitStatus, ProcessHandle};

/// A spawned process with channel-based I/O.
pub struct AsyncProcess {
    handle: ProcessHandle,
    stdout: mpsc::UnboundedReceiver<Bytes>,
    stderr: mpsc::UnboundedReceiver<Bytes>,
    exit: Option<oneshot::Receiver<ExitStatus>>,
    status: Option<ExitStatus>,
}

impl AsyncProcess {
    /// Spawn `builder` with the bridging handler installed.
    pub fn spawn(builder: &ProcessBuilder) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let handler = BridgeHandler {
            stdout: Some(stdout_tx),
            stderr: Some(stderr_tx),
            exit: Some(exit_tx),
        };
        let handle = builder.spawn(Box::new(handler));

        Self {
            handle,
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: Some(exit_rx),
            status: None,
        }
    }

    /// The underlying callback-surface handle.
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Next chunk of stdout; `None` once the stream has closed.
    pub async fn next_stdout(&mut self) -> Option<Bytes> {
        self.stdout.recv().await
    }

    /// Next chunk of stderr; `None` once the stream has closed.
    pub async fn next_stderr(&mut self) -> Option<Bytes> {
        self.stderr.recv().await
    }

    /// Enqueue bytes for the child's stdin.
    pub fn write_stdin(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.handle.write_stdin(bytes)
    }

    /// Close the child's stdin once enqueued writes have drained.
    pub fn close_stdin(&self) {
        self.handle.close_stdin();
    }

    /// Terminate the child (see [`ProcessHandle::destroy`]).
    pub fn destroy(&self, force: bool) {
        self.handle.destroy(force);
    }

    /// Wait for the terminal status. Subsequent calls return the same value.
    pub async fn wait(&mut self) -> ExitStatus {
        if let Some(status) = self.status {
            return status;
        }
        let status = match self.exit.take() {
            Some(rx) => match rx.await {
                Ok(status) => status,
                // The sender is dropped only after delivery, so this is
                // unreachable in practice; fall back to the gate.
                Err(_) => self
                    .handle
                    .exit_status()
                    .unwrap_or(ExitStatus::spawn_failed()),
            },
            None => self
                .handle
                .exit_status()
                .unwrap_or(ExitStatus::spawn_failed()),
        };
        self.status = Some(status);
        status
    }
}

/// Adapter handler: copies chunks out of the shared buffers into channels.
///
/// Sends are non-blocking; the processor thread is never suspended.
struct BridgeHandler {
    stdout: Option<mpsc::UnboundedSender<Bytes>>,
    stderr: Option<mpsc::UnboundedSender<Bytes>>,
    exit: Option<oneshot::Sender<ExitStatus>>,
}

impl BridgeHandler {
    fn forward(slot: &mut Option<mpsc::UnboundedSender<Bytes>>, buffer: &mut IoBuffer, closed: bool) {
        if let Some(tx) = slot.as_ref() {
            if buffer.remaining() > 0 {
                let _ = tx.send(Bytes::from(buffer.take_bytes()));
            } else {
                buffer.set_position(buffer.limit());
            }
        } else {
            buffer.set_position(buffer.limit());
        }
        if closed {
            // Dropping the sender ends the receiver stream.
            *slot = None;
        }
    }
}

impl ProcessHandler for BridgeHandler {
    fn on_stdout(&mut self, buffer: &mut IoBuffer, closed: bool) {
        Self::forward(&mut self.stdout, buffer, closed);
    }

    fn on_stderr(&mut self, buffer: &mut IoBuffer, closed: bool) {
        Self::forward(&mut self.stderr, buffer, closed);
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.stdout = None;
        self.stderr = None;
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(status);
        }
    }
}
