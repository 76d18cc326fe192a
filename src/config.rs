//! Pool configuration.
//!
//! Configuration is read once, when the processor pool is first touched. It
//! comes from environment variables, or programmatically via
//! [`crate::init`] before any process is spawned.
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `PROCPOOL_THREADS` | `auto`, `cores`, positive integer | `auto` (= cores / 2) |
//! | `PROCPOOL_SOFT_EXIT_DETECTION` | `true`, `false` | `true` |
//! | `PROCPOOL_ENABLE_SHUTDOWN_HOOK` | `true`, `false` | `true` |

use std::thread;

/// Environment variable selecting the processor pool size.
pub const THREADS_ENV: &str = "PROCPOOL_THREADS";

/// Environment variable toggling the soft-exit heuristic.
pub const SOFT_EXIT_ENV: &str = "PROCPOOL_SOFT_EXIT_DETECTION";

/// Environment variable toggling pool teardown at process exit.
pub const SHUTDOWN_HOOK_ENV: &str = "PROCPOOL_ENABLE_SHUTDOWN_HOOK";

/// Processor pool sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threads {
    /// Half the available cores, at least one.
    #[default]
    Auto,
    /// One processor per available core.
    Cores,
    /// An explicit processor count (clamped to at least one).
    Fixed(usize),
}

impl Threads {
    /// Resolve the policy to a concrete processor count.
    pub fn resolve(self) -> usize {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        match self {
            Threads::Auto => (cores / 2).max(1),
            Threads::Cores => cores,
            Threads::Fixed(n) => n.max(1),
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim() {
            "auto" => Threads::Auto,
            "cores" => Threads::Cores,
            other => match other.parse::<usize>() {
                Ok(n) if n > 0 => Threads::Fixed(n),
                _ => {
                    tracing::warn!(value = other, "invalid {THREADS_ENV}, using auto");
                    Threads::Auto
                }
            },
        }
    }
}

/// Pool configuration, captured once at initialization.
#[derive(Debug, Clone)]
pub struct Config {
    /// Processor pool sizing policy.
    pub threads: Threads,
    /// Whether closure of both output streams marks a process as a reap
    /// candidate (exit is still confirmed through the OS wait).
    pub soft_exit_detection: bool,
    /// Whether to tear the pool down when the host process exits.
    pub enable_shutdown_hook: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: Threads::Auto,
            soft_exit_detection: true,
            enable_shutdown_hook: true,
        }
    }
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults
    /// for unset or unparseable variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(threads) = std::env::var(THREADS_ENV) {
            config.threads = Threads::parse(&threads);
        }
        if let Ok(soft) = std::env::var(SOFT_EXIT_ENV) {
            config.soft_exit_detection = parse_bool(&soft, true);
        }
        if let Ok(hook) = std::env::var(SHUTDOWN_HOOK_ENV) {
            config.enable_shutdown_hook = parse_bool(&hook, true);
        }
        config
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim() {
        "true" | "1" => true,
        "false" | "0" => false,
        _ => default,
    }
}
