//! Error types for procpool.

use thiserror::Error;

/// Main error type for all procpool operations.
#[derive(Debug, Error)]
pub enum ProcPoolError {
    /// I/O error during pipe or multiplexer operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Child process could not be spawned (pipe creation or exec failure).
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    /// `write_stdin` was called after `close_stdin`.
    #[error("stdin has already been closed")]
    StdinClosed,

    /// A handler left a stream buffer full without consuming any bytes.
    ///
    /// Fatal for the affected process: it is killed and `on_exit` is
    /// delivered with [`ExitCause::HandlerFault`](crate::ExitCause).
    #[error("handler did not consume any bytes from a full {0} buffer")]
    HandlerDidNotConsume(&'static str),

    /// The kernel reported an error on a registered endpoint.
    ///
    /// The endpoint is torn down and the stream is reported closed to the
    /// handler; the process itself keeps running.
    #[error("kernel error on endpoint: {0}")]
    Kernel(std::io::Error),
}

/// Result type alias using ProcPoolError.
pub type Result<T> = std::result::Result<T, ProcPoolError>;
