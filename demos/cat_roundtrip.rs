//! Pipe a payload through `/bin/cat` and print what comes back.
//!
//! Run with: `cargo run --example cat_roundtrip`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procpool::{ExitStatus, IoBuffer, ProcessBuilder, ProcessHandle, ProcessHandler};

struct Pump {
    rounds: usize,
    received: Arc<AtomicUsize>,
}

impl ProcessHandler for Pump {
    fn on_start(&mut self, process: &ProcessHandle) {
        println!("started pid {:?}", process.pid());
        process.want_write();
    }

    fn on_stdin_ready(&mut self, buffer: &mut IoBuffer) -> bool {
        buffer.put_slice(b"This is a test\n");
        self.rounds += 1;
        self.rounds < 1000
    }

    fn on_stdout(&mut self, buffer: &mut IoBuffer, closed: bool) {
        self.received.fetch_add(buffer.remaining(), Ordering::AcqRel);
        buffer.set_position(buffer.limit());
        if closed {
            println!("stdout closed");
        }
    }

    fn on_exit(&mut self, status: ExitStatus) {
        println!("exited with code {} ({:?})", status.code, status.cause);
    }
}

fn main() {
    let received = Arc::new(AtomicUsize::new(0));
    let process = ProcessBuilder::new("/bin/cat").spawn(Box::new(Pump {
        rounds: 0,
        received: Arc::clone(&received),
    }));

    while received.load(Ordering::Acquire) < 15_000 {
        std::thread::sleep(Duration::from_millis(20));
    }
    process.close_stdin();

    let status = process
        .wait_for(Duration::from_secs(10))
        .expect("cat should exit");
    println!(
        "echoed {} bytes, exit code {}",
        received.load(Ordering::Acquire),
        status.code
    );
}
