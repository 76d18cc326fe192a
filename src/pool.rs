//! The processor pool: a fixed set of event loops shared by every spawn.
//!
//! The pool is created on first use (or explicitly via [`init`]) and lives
//! for the rest of the program. Processes are dealt to processors by strict
//! round-robin; each processor starts its thread lazily and winds it down
//! when it has no processes left. An optional `atexit` hook asks every loop
//! to stop when the host process exits.

use std::sync::{Mutex, OnceLock, PoisonError};

use crate::config::Config;
use crate::processor::Processor;

static CONFIG: OnceLock<Config> = OnceLock::new();
static POOL: OnceLock<Pool> = OnceLock::new();

/// Install a configuration before the pool is first used.
///
/// Returns false if the pool (or an earlier configuration) already exists,
/// in which case the call has no effect.
pub fn init(config: Config) -> bool {
    CONFIG.set(config).is_ok() && POOL.get().is_none()
}

/// The process-wide pool, created on first touch.
pub(crate) fn pool() -> &'static Pool {
    POOL.get_or_init(|| {
        let config = CONFIG.get_or_init(Config::from_env).clone();
        Pool::new(config)
    })
}

pub(crate) struct Pool {
    processors: Vec<Processor>,
    next: Mutex<usize>,
}

impl Pool {
    fn new(config: Config) -> Self {
        let size = config.threads.resolve();
        tracing::debug!(processors = size, "initializing processor pool");

        let mut processors = Vec::with_capacity(size);
        for index in 0..size {
            let processor = Processor::new(index, config.soft_exit_detection)
                .expect("failed to create I/O multiplexer for processor pool");
            processors.push(processor);
        }

        if config.enable_shutdown_hook {
            install_shutdown_hook();
        }

        Self {
            processors,
            next: Mutex::new(0),
        }
    }

    /// Strict round-robin assignment. The mutex guards only the counter.
    pub(crate) fn assign(&self) -> Processor {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = *next;
        *next = (*next + 1) % self.processors.len();
        self.processors[slot].clone()
    }

    pub(crate) fn shutdown(&self) {
        for processor in &self.processors {
            processor.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.processors.len()
    }
}

#[cfg(unix)]
fn install_shutdown_hook() {
    extern "C" fn pool_shutdown() {
        if let Some(pool) = POOL.get() {
            pool.shutdown();
        }
    }
    unsafe {
        libc::atexit(pool_shutdown);
    }
}

#[cfg(not(unix))]
fn install_shutdown_hook() {
    // Loop threads never outlive main on their own; nothing to do without a
    // portable atexit.
}
