//! Integration tests for procpool.
//!
//! These exercise the full stack — spawn, pipe plumbing, processor loops,
//! exit detection — against real children (`/bin/cat`, `/bin/sh`,
//! `/bin/sleep`).

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use procpool::{
    Config, ExitCause, ExitStatus, IoBuffer, NopProcessHandler, ProcPoolError, ProcessBuilder,
    ProcessHandle, ProcessHandler, Threads,
};

/// All tests in this binary share one pool; pin it to two processors so the
/// many-processes tests exercise multiplexing rather than thread-per-child.
fn init_pool() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        procpool::init(Config {
            threads: Threads::Fixed(2),
            soft_exit_detection: true,
            enable_shutdown_hook: false,
        });
    });
}

const WAIT: Duration = Duration::from_secs(10);

/// Handler that records the full callback sequence for invariant checks.
#[derive(Default)]
struct RecordingState {
    events: Mutex<Vec<String>>,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    stdout_closes: AtomicUsize,
    exits: AtomicUsize,
}

struct Recording(Arc<RecordingState>);

impl ProcessHandler for Recording {
    fn on_pre_start(&mut self, _process: &ProcessHandle) {
        self.0.events.lock().unwrap().push("pre_start".into());
    }

    fn on_start(&mut self, _process: &ProcessHandle) {
        self.0.events.lock().unwrap().push("start".into());
    }

    fn on_stdout(&mut self, buffer: &mut IoBuffer, closed: bool) {
        self.0.events.lock().unwrap().push("stdout".into());
        self.0
            .stdout
            .lock()
            .unwrap()
            .extend_from_slice(buffer.as_slice());
        buffer.set_position(buffer.limit());
        if closed {
            self.0.stdout_closes.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn on_stderr(&mut self, buffer: &mut IoBuffer, closed: bool) {
        self.0.events.lock().unwrap().push("stderr".into());
        self.0
            .stderr
            .lock()
            .unwrap()
            .extend_from_slice(buffer.as_slice());
        buffer.set_position(buffer.limit());
        let _ = closed;
    }

    fn on_exit(&mut self, _status: ExitStatus) {
        self.0.events.lock().unwrap().push("exit".into());
        self.0.exits.fetch_add(1, Ordering::AcqRel);
    }
}

#[test]
fn test_echo_roundtrip_and_callback_order() {
    init_pool();
    let state = Arc::new(RecordingState::default());
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(Recording(Arc::clone(&state))));

    process.write_stdin("hello procpool\n").unwrap();
    process.close_stdin();

    let status = process.wait_for(WAIT).expect("cat should exit");
    assert_eq!(status.code, 0);
    assert_eq!(status.cause, ExitCause::Exited);

    assert_eq!(state.stdout.lock().unwrap().as_slice(), b"hello procpool\n");
    assert_eq!(state.stdout_closes.load(Ordering::Acquire), 1);
    assert_eq!(state.exits.load(Ordering::Acquire), 1);

    let events = state.events.lock().unwrap();
    assert_eq!(events.first().map(String::as_str), Some("pre_start"));
    assert_eq!(events.get(1).map(String::as_str), Some("start"));
    assert_eq!(events.last().map(String::as_str), Some("exit"));
    // Exactly one terminal event.
    assert_eq!(events.iter().filter(|e| *e == "exit").count(), 1);
}

#[test]
fn test_large_payload_roundtrip_preserves_bytes_and_order() {
    init_pool();
    // Large enough to force multiple buffer refills and partial pipe writes.
    let payload: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();

    let state = Arc::new(RecordingState::default());
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(Recording(Arc::clone(&state))));

    // Enqueue in chunks; FIFO order must be preserved end to end.
    for chunk in payload.chunks(7001) {
        process.write_stdin(chunk.to_vec()).unwrap();
    }
    process.close_stdin();

    let status = process.wait_for(WAIT).expect("cat should exit");
    assert_eq!(status.code, 0);
    assert_eq!(state.stdout.lock().unwrap().as_slice(), payload.as_slice());
}

/// Pump stdin via `want_write` until 10 000 bytes of output are observed,
/// then destroy; the exit must arrive with code 0.
#[test]
fn test_want_write_pump_then_destroy() {
    init_pool();

    struct Pump {
        count: Arc<AtomicUsize>,
    }
    impl ProcessHandler for Pump {
        fn on_start(&mut self, process: &ProcessHandle) {
            process.want_write();
        }
        fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
            buffer.put_slice(b"This is a test");
            true
        }
        fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
            self.count.fetch_add(buffer.remaining(), Ordering::AcqRel);
            buffer.set_position(buffer.limit());
        }
    }

    let count = Arc::new(AtomicUsize::new(0));
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(Pump {
        count: Arc::clone(&count),
    }));

    let deadline = Instant::now() + WAIT;
    while count.load(Ordering::Acquire) <= 10_000 {
        assert!(Instant::now() < deadline, "stdout pump stalled");
        std::thread::sleep(Duration::from_millis(20));
    }

    process.destroy(false);
    let status = process.wait_for(WAIT).expect("destroyed cat should exit");
    assert_eq!(status.code, 0);
    assert_eq!(status.cause, ExitCause::Destroyed { force: false });
}

/// A child that prints one byte more than the buffer size produces at least
/// two stdout callbacks, the last with `closed = true`, with `on_exit` after.
#[test]
fn test_output_larger_than_buffer_splits_callbacks() {
    init_pool();

    let state = Arc::new(RecordingState::default());
    let builder = ProcessBuilder::new("/bin/sh")
        .arg("-c")
        .arg("dd if=/dev/zero bs=65537 count=1 2>/dev/null");
    let process = builder.spawn(Box::new(Recording(Arc::clone(&state))));
    process.close_stdin();

    let status = process.wait_for(WAIT).expect("dd should exit");
    assert_eq!(status.code, 0);
    assert_eq!(state.stdout.lock().unwrap().len(), 65_537);
    assert_eq!(state.stdout_closes.load(Ordering::Acquire), 1);

    let events = state.events.lock().unwrap();
    let stdout_calls = events.iter().filter(|e| *e == "stdout").count();
    assert!(stdout_calls >= 2, "expected split reads, got {stdout_calls}");
    assert_eq!(events.last().map(String::as_str), Some("exit"));
}

/// `write_stdin` after `close_stdin` is a caller error.
#[test]
fn test_write_after_close_stdin_errors() {
    init_pool();
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(NopProcessHandler));

    process.write_stdin("first\n").unwrap();
    process.close_stdin();
    // Idempotent.
    process.close_stdin();

    let err = process.write_stdin("second\n").unwrap_err();
    assert!(matches!(err, ProcPoolError::StdinClosed));

    let status = process.wait_for(WAIT).expect("cat should exit");
    assert_eq!(status.code, 0);
}

/// `wait_for` with a short timeout returns None on a sleeper; a zero
/// timeout then waits for the real exit.
#[test]
fn test_wait_for_timeout_then_forever() {
    init_pool();
    let process = ProcessBuilder::new("/bin/sleep")
        .arg("0.4")
        .spawn(Box::new(NopProcessHandler));

    assert_eq!(process.wait_for(Duration::from_millis(10)), None);

    let status = process.wait_for(Duration::ZERO).expect("sleep should exit");
    assert_eq!(status.code, 0);
    assert_eq!(status.cause, ExitCause::Exited);
    assert!(!process.is_running());
}

#[test]
fn test_stderr_delivery() {
    init_pool();
    let state = Arc::new(RecordingState::default());
    let builder = ProcessBuilder::new("/bin/sh")
        .arg("-c")
        .arg("echo out; echo err >&2");
    let process = builder.spawn(Box::new(Recording(Arc::clone(&state))));
    process.close_stdin();

    let status = process.wait_for(WAIT).expect("sh should exit");
    assert_eq!(status.code, 0);
    assert_eq!(state.stdout.lock().unwrap().as_slice(), b"out\n");
    assert_eq!(state.stderr.lock().unwrap().as_slice(), b"err\n");
}

#[test]
fn test_exit_code_propagates() {
    init_pool();
    let process = ProcessBuilder::new("/bin/sh")
        .arg("-c")
        .arg("exit 17")
        .spawn(Box::new(NopProcessHandler));
    process.close_stdin();

    let status = process.wait_for(WAIT).expect("sh should exit");
    assert_eq!(status.code, 17);
    assert_eq!(status.cause, ExitCause::Exited);
}

#[test]
fn test_spawn_failure_delivers_spawn_failed_exit() {
    init_pool();
    let state = Arc::new(RecordingState::default());
    let process = ProcessBuilder::new("/definitely/not/a/binary")
        .spawn(Box::new(Recording(Arc::clone(&state))));

    let status = process.wait_for(WAIT).expect("terminal state is immediate");
    assert_eq!(status.cause, ExitCause::SpawnFailed);
    assert!(!process.is_running());
    assert_eq!(state.exits.load(Ordering::Acquire), 1);
    // No stream callbacks ever fired.
    assert_eq!(state.stdout_closes.load(Ordering::Acquire), 0);
}

#[test]
fn test_environment_reaches_child() {
    init_pool();
    let state = Arc::new(RecordingState::default());
    let builder = ProcessBuilder::new("/bin/sh")
        .arg("-c")
        .arg("printf '%s' \"$PROCPOOL_PROBE\"")
        .env("PROCPOOL_PROBE", "it-works");
    let process = builder.spawn(Box::new(Recording(Arc::clone(&state))));
    process.close_stdin();

    let status = process.wait_for(WAIT).expect("sh should exit");
    assert_eq!(status.code, 0);
    assert_eq!(state.stdout.lock().unwrap().as_slice(), b"it-works");
}

/// A handler that refuses to consume faults the process: it is killed and
/// `on_exit` arrives with `HandlerFault`.
#[test]
fn test_handler_did_not_consume_is_fatal() {
    init_pool();

    struct NeverConsumes {
        exited: Arc<Mutex<Option<ExitStatus>>>,
    }
    impl ProcessHandler for NeverConsumes {
        fn on_stdout(&mut self, _buffer: &mut IoBuffer, _closed: bool) {
            // Deliberately leaves every byte in place.
        }
        fn on_exit(&mut self, status: ExitStatus) {
            *self.exited.lock().unwrap() = Some(status);
        }
    }

    let exited = Arc::new(Mutex::new(None));
    let builder = ProcessBuilder::new("/bin/sh")
        .arg("-c")
        // More than one buffer's worth, so the full-buffer condition trips.
        .arg("dd if=/dev/zero bs=65536 count=4 2>/dev/null; sleep 10");
    let process = builder.spawn(Box::new(NeverConsumes {
        exited: Arc::clone(&exited),
    }));

    let status = process.wait_for(WAIT).expect("faulted process should exit");
    assert_eq!(status.cause, ExitCause::HandlerFault);
    assert_eq!(exited.lock().unwrap().expect("on_exit delivered"), status);
}

/// Repeated destroys still produce exactly one exit delivery.
#[test]
fn test_destroy_is_idempotent() {
    init_pool();
    let state = Arc::new(RecordingState::default());
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(Recording(Arc::clone(&state))));

    process.destroy(true);
    process.destroy(true);
    process.destroy(false);

    let status = process.wait_for(WAIT).expect("killed cat should exit");
    assert_eq!(status.cause, ExitCause::Destroyed { force: true });
    assert_eq!(state.exits.load(Ordering::Acquire), 1);
}

/// Waves of concurrent cats on a two-processor pool, all destroyed in
/// arbitrary order; every process reaches `on_exit` exactly once and no
/// handle leaks a running child.
#[test]
fn test_chaos_waves_all_exit_exactly_once() {
    init_pool();

    struct Chatty {
        exits: Arc<AtomicUsize>,
    }
    impl ProcessHandler for Chatty {
        fn on_start(&mut self, process: &ProcessHandle) {
            process.want_write();
        }
        fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
            buffer.put_slice(b"This is a test");
            true
        }
        fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
            buffer.set_position(buffer.limit());
        }
        fn on_exit(&mut self, _status: ExitStatus) {
            self.exits.fetch_add(1, Ordering::AcqRel);
        }
    }

    let exits = Arc::new(AtomicUsize::new(0));
    let waves = 3;
    let per_wave = 25;

    for wave in 0..waves {
        let mut handles = Vec::with_capacity(per_wave);
        for _ in 0..per_wave {
            handles.push(ProcessBuilder::new("/bin/cat").spawn(Box::new(Chatty {
                exits: Arc::clone(&exits),
            })));
        }

        // Kill in a scattered order.
        while !handles.is_empty() {
            std::thread::sleep(Duration::from_millis(2));
            let victim = (wave * 7 + handles.len() * 3) % handles.len();
            let handle = handles.swap_remove(victim);
            handle.destroy(true);
            assert!(
                handle.wait_for(WAIT).is_some(),
                "destroyed process never exited"
            );
        }
    }

    assert_eq!(exits.load(Ordering::Acquire), waves * per_wave);
}

/// `want_write` from inside `on_stdin_ready` behaves like returning true.
#[test]
fn test_want_write_inside_on_stdin_ready() {
    init_pool();

    struct InnerWant {
        rounds: usize,
        done: Arc<AtomicBool>,
    }
    impl ProcessHandler for InnerWant {
        fn on_start(&mut self, process: &ProcessHandle) {
            process.want_write();
        }
        fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
            self.rounds += 1;
            buffer.put_slice(b"x");
            if self.rounds >= 5 {
                self.done.store(true, Ordering::Release);
                return false;
            }
            false
        }
        fn on_stdout(&mut self, buffer: &mut IoBuffer, _closed: bool) {
            buffer.set_position(buffer.limit());
        }
    }

    // Each callback returns false but re-asserts intent through the handle,
    // which must keep the pump alive for all five rounds.
    struct InnerWantDriver {
        inner: InnerWant,
        handle: Arc<Mutex<Option<ProcessHandle>>>,
    }
    impl ProcessHandler for InnerWantDriver {
        fn on_start(&mut self, process: &ProcessHandle) {
            *self.handle.lock().unwrap() = Some(process.clone());
            self.inner.on_start(process);
        }
        fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
            let again = self.inner.on_stdin_ready(buffer);
            if !again && !self.inner.done.load(Ordering::Acquire) {
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    handle.want_write();
                }
            }
            again
        }
        fn on_stdout(&mut self, buffer: &mut IoBuffer, closed: bool) {
            self.inner.on_stdout(buffer, closed);
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(InnerWantDriver {
        inner: InnerWant {
            rounds: 0,
            done: Arc::clone(&done),
        },
        handle: Arc::new(Mutex::new(None)),
    }));

    let deadline = Instant::now() + WAIT;
    while !done.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "inner want_write never re-armed");
        std::thread::sleep(Duration::from_millis(10));
    }

    process.destroy(true);
    assert!(process.wait_for(WAIT).is_some());
}

/// Processor threads wind down when idle and restart for later spawns.
#[test]
fn test_sequential_spawns_across_idle_pool() {
    init_pool();
    for i in 0..5 {
        let process = ProcessBuilder::new("/bin/sh")
            .arg("-c")
            .arg(format!("exit {i}"))
            .spawn(Box::new(NopProcessHandler));
        process.close_stdin();
        let status = process.wait_for(WAIT).expect("child should exit");
        assert_eq!(status.code, i);
        // Give loops a moment to go idle between spawns.
        std::thread::sleep(Duration::from_millis(20));
    }
}
