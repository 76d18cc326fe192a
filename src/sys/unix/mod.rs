//! POSIX dialect: non-blocking pipes plus an epoll/kqueue multiplexer.

mod processor;
mod spawn;

pub(crate) use processor::run;
pub(crate) use spawn::{spawn_child, terminate, Spawned};

use std::io;
use std::sync::Arc;

use crate::process::ProcessShared;

/// A spawned child and its parent-side endpoints, queued to a processor.
pub(crate) struct Registration {
    pub(crate) shared: Arc<ProcessShared>,
    pub(crate) spawned: Spawned,
}

/// Multiplexer state owned by the loop thread, parked in the processor
/// shell while no thread is running.
pub(crate) struct LoopIo {
    pub(crate) poll: mio::Poll,
    pub(crate) events: mio::Events,
}

/// Cross-thread wakeup for a sleeping loop.
pub(crate) struct LoopWaker(mio::Waker);

/// Token reserved for the wakeup event; pipe tokens are raw fds and can
/// never collide with it.
pub(crate) const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

impl LoopIo {
    pub(crate) fn new() -> io::Result<(Self, LoopWaker)> {
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok((
            Self {
                poll,
                events: mio::Events::with_capacity(256),
            },
            LoopWaker(waker),
        ))
    }
}

impl LoopWaker {
    pub(crate) fn wake(&self) {
        if let Err(err) = self.0.wake() {
            tracing::warn!(%err, "failed to wake processor loop");
        }
    }
}
