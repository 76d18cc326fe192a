//! Child creation and termination on Windows.
//!
//! Each standard stream gets its own single-instance named pipe: the child
//! ("widow") end is created inheritable and synchronous, the parent end is
//! opened overlapped for completion-port registration. The child itself is
//! created suspended; the processor resumes its main thread only after
//! `on_start` has run, so no pipe event can precede the callback.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, OpenProcess, TerminateProcess, CREATE_NO_WINDOW, CREATE_SUSPENDED,
    CREATE_UNICODE_ENVIRONMENT, PROCESS_INFORMATION, PROCESS_TERMINATE, STARTF_USESTDHANDLES,
    STARTUPINFOW,
};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::builder::{command_line, ProcessBuilder};

use super::{Handle, Spawned, WinEndpoint};

/// Names pipes uniquely across the host process.
static PIPE_COUNTER: AtomicUsize = AtomicUsize::new(100);

/// Exit code handed to `TerminateProcess`; the recorded destroy level, not
/// this value, is what decides the reported cause.
const TERMINATE_EXIT_CODE: u32 = 1;

struct PipePair {
    /// Parent end, overlapped.
    ours: WinEndpoint,
    /// Child end, inheritable; closed once the child owns it.
    widow: Handle,
}

pub(crate) fn spawn_child(builder: &ProcessBuilder) -> io::Result<Spawned> {
    // Child writes into these, the parent reads.
    let stdout = create_pipe_pair(PIPE_ACCESS_INBOUND, GENERIC_READ, FILE_SHARE_READ)?;
    let stderr = create_pipe_pair(PIPE_ACCESS_INBOUND, GENERIC_READ, FILE_SHARE_READ)?;
    // Parent writes into this one.
    let stdin = create_pipe_pair(PIPE_ACCESS_OUTBOUND, GENERIC_WRITE, FILE_SHARE_WRITE)?;

    let program = builder.program().to_string_lossy().into_owned();
    let args: Vec<String> = builder
        .argv()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let mut cmdline = command_line(&program, &args);
    let environment = builder.environment_block();

    let cwd: Option<Vec<u16>> = builder.working_dir().map(|dir| {
        let mut wide: Vec<u16> = dir.to_string_lossy().encode_utf16().collect();
        wide.push(0);
        wide
    });

    let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
    startup.cb = mem::size_of::<STARTUPINFOW>() as u32;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = stdin.widow.raw();
    startup.hStdOutput = stdout.widow.raw();
    startup.hStdError = stderr.widow.raw();

    let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    let flags = CREATE_NO_WINDOW | CREATE_UNICODE_ENVIRONMENT | CREATE_SUSPENDED;

    let created = unsafe {
        CreateProcessW(
            std::ptr::null(),
            cmdline.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            1,
            flags,
            environment.as_ptr().cast(),
            cwd.as_ref()
                .map_or(std::ptr::null(), |wide| wide.as_ptr()),
            &startup,
            &mut info,
        )
    };
    if created == 0 {
        return Err(io::Error::last_os_error());
    }

    // The widow handles drop here, leaving the child as their only owner.
    Ok(Spawned {
        process: Handle(info.hProcess),
        thread: Handle(info.hThread),
        pid: info.dwProcessId,
        stdin: stdin.ours,
        stdout: stdout.ours,
        stderr: stderr.ours,
    })
}

fn create_pipe_pair(open_mode: u32, parent_access: u32, share_mode: u32) -> io::Result<PipePair> {
    let key = PIPE_COUNTER.fetch_add(1, Ordering::AcqRel);
    let name = format!(r"\\.\pipe\procpool-{}-{}", std::process::id(), key);
    let mut wide_name: Vec<u16> = name.encode_utf16().collect();
    wide_name.push(0);

    let mut security: SECURITY_ATTRIBUTES = unsafe { mem::zeroed() };
    security.nLength = mem::size_of::<SECURITY_ATTRIBUTES>() as u32;
    security.bInheritHandle = 1;

    let widow = unsafe {
        CreateNamedPipeW(
            wide_name.as_ptr(),
            open_mode,
            0,
            1,
            DEFAULT_BUFFER_CAPACITY as u32,
            DEFAULT_BUFFER_CAPACITY as u32,
            0,
            &security,
        )
    };
    if widow == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let widow = Handle(widow);

    let ours = unsafe {
        CreateFileW(
            wide_name.as_ptr(),
            parent_access,
            share_mode,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
            std::ptr::null_mut(),
        )
    };
    if ours == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let ours = Handle(ours);

    let connected = unsafe { ConnectNamedPipe(widow.raw(), std::ptr::null_mut()) };
    if connected == 0 {
        let err = unsafe { GetLastError() };
        // Both ends already open: the expected outcome.
        if err != ERROR_PIPE_CONNECTED {
            return Err(io::Error::from_raw_os_error(err as i32));
        }
    }

    Ok(PipePair {
        ours: WinEndpoint {
            handle: ours,
            key,
            overlapped: Box::new(unsafe { mem::zeroed() }),
        },
        widow,
    })
}

/// Terminate `pid`.
///
/// Only forced termination exists on this platform; `force` is recorded by
/// the caller for the reported exit cause but does not change the syscall.
pub(crate) fn terminate(pid: u32, _force: bool) {
    unsafe {
        let handle: HANDLE = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if !handle.is_null() {
            TerminateProcess(handle, TERMINATE_EXIT_CODE);
            windows_sys::Win32::Foundation::CloseHandle(handle);
        }
    }
}
