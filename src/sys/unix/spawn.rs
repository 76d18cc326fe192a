//! Child creation and signaling on POSIX.
//!
//! Spawning goes through `std::process::Command` (fork-and-exec with exec
//! failures reported synchronously through the CLOEXEC status pipe), after
//! which the parent-side pipe ends are extracted and switched to
//! non-blocking for multiplexer registration.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::{Child, Command, Stdio};

use crate::builder::ProcessBuilder;

/// A freshly created child with its parent-side stream endpoints, all
/// non-blocking.
pub(crate) struct Spawned {
    pub(crate) child: Child,
    pub(crate) stdin: OwnedFd,
    pub(crate) stdout: OwnedFd,
    pub(crate) stderr: OwnedFd,
}

pub(crate) fn spawn_child(builder: &ProcessBuilder) -> io::Result<Spawned> {
    let mut command = Command::new(builder.program());
    command.args(builder.argv());
    if builder.env_cleared() {
        command.env_clear();
    }
    for (key, value) in builder.env_overrides() {
        command.env(key, value);
    }
    if let Some(dir) = builder.working_dir() {
        command.current_dir(dir);
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    let stdin = take_endpoint(child.stdin.take().map(OwnedFd::from), "stdin")?;
    let stdout = take_endpoint(child.stdout.take().map(OwnedFd::from), "stdout")?;
    let stderr = take_endpoint(child.stderr.take().map(OwnedFd::from), "stderr")?;

    Ok(Spawned {
        child,
        stdin,
        stdout,
        stderr,
    })
}

fn take_endpoint(fd: Option<OwnedFd>, name: &str) -> io::Result<OwnedFd> {
    let fd = fd.ok_or_else(|| io::Error::other(format!("{name} pipe missing after spawn")))?;
    set_nonblocking(fd.as_raw_fd())?;
    Ok(fd)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send a terminate signal to `pid`.
///
/// Asynchronous by design: failures (typically ESRCH for an already-dead
/// child) are ignored, and the exit is observed through the event loop.
pub(crate) fn terminate(pid: u32, force: bool) {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
