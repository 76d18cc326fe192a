//! Fluent builder for spawning processes.
//!
//! [`ProcessBuilder`] assembles a command line, environment, and working
//! directory, then hands the process to the pool. Builders are reusable: one
//! builder can spawn any number of children.
//!
//! # Example
//!
//! ```ignore
//! use procpool::{NopProcessHandler, ProcessBuilder};
//!
//! let builder = ProcessBuilder::new("/bin/cat").arg("-u");
//! let process = builder.spawn(Box::new(NopProcessHandler));
//! ```
//!
//! Spawn failure is not an error return: the process transitions straight to
//! its terminal state and `on_exit` is delivered with
//! [`ExitCause::SpawnFailed`](crate::ExitCause::SpawnFailed).

use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::handler::ProcessHandler;
use crate::pool;
use crate::process::{ExitStatus, ProcessHandle, ProcessShared};
use crate::sys;

/// Builder for one command, reusable across spawns.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    clear_env: bool,
    working_dir: Option<PathBuf>,
}

impl ProcessBuilder {
    /// Start building a command for `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            working_dir: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set (or override) one environment variable for the child.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Do not inherit the parent environment; only variables given via
    /// [`env`](Self::env) are passed to the child.
    pub fn env_clear(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Set the child's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Spawn the command, delivering all events to `handler`.
    ///
    /// Returns immediately with a [`ProcessHandle`]. If the pipes or the exec
    /// fail, the handle is already terminal and `on_exit` has been delivered
    /// with `SpawnFailed`.
    pub fn spawn(&self, handler: Box<dyn ProcessHandler>) -> ProcessHandle {
        let shared = ProcessShared::new(handler);
        shared.call_pre_start();

        match sys::spawn_child(self) {
            Ok(spawned) => {
                let pid = spawned.child.id();
                shared.mark_started(pid);

                let processor = pool::pool().assign();
                shared.assign_processor(processor.clone());
                let handle = ProcessHandle::from_shared(shared.clone());
                processor.register(sys::Registration { shared, spawned });
                handle
            }
            Err(err) => {
                tracing::warn!(program = ?self.program, %err, "spawn failed");
                shared.deliver_exit(ExitStatus::spawn_failed());
                ProcessHandle::from_shared(shared)
            }
        }
    }

    pub(crate) fn program(&self) -> &OsStr {
        &self.program
    }

    pub(crate) fn argv(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }

    pub(crate) fn env_overrides(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.env
            .iter()
            .map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub(crate) fn env_cleared(&self) -> bool {
        self.clear_env
    }

    pub(crate) fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Merged child environment: the parent's (unless cleared) with the
    /// builder's overrides applied, sorted by the canonical collation.
    pub(crate) fn merged_env(&self) -> Vec<(String, String)> {
        let mut map: Vec<(String, String)> = Vec::new();
        if !self.clear_env {
            for (key, value) in std::env::vars() {
                map.push((key, value));
            }
        }
        for (key, value) in &self.env {
            let key = key.to_string_lossy().into_owned();
            let value = value.to_string_lossy().into_owned();
            match map.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => map.push((key, value)),
            }
        }
        map.sort_by(|a, b| env_name_cmp(&a.0, &b.0));
        map
    }

    /// Canonical environment block: `KEY=value` entries sorted by
    /// case-insensitive name, each null-terminated, with a final extra null.
    #[allow(dead_code)]
    pub(crate) fn environment_block(&self) -> Vec<u16> {
        let mut block: Vec<u16> = Vec::new();
        for (key, value) in self.merged_env() {
            block.extend(key.encode_utf16());
            block.push(u16::from(b'='));
            block.extend(value.encode_utf16());
            block.push(0);
        }
        block.push(0);
        block
    }
}

/// Compare environment names by uppercased code units, then by length.
pub(crate) fn env_name_cmp(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars();
    let mut cb = b.chars();
    loop {
        match (ca.next(), cb.next()) {
            (Some(x), Some(y)) => {
                if x != y {
                    let ux = upper(x);
                    let uy = upper(y);
                    if ux != uy {
                        return ux.cmp(&uy);
                    }
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

fn upper(c: char) -> char {
    c.to_uppercase().next().unwrap_or(c)
}

/// Build the quoted command line used by the completion-based dialect:
/// argv[0] is quoted if it contains spaces and is not already quoted,
/// space-containing arguments are double-quoted, tokens are joined with
/// single spaces, and the result ends with a null code unit.
#[allow(dead_code)]
pub(crate) fn command_line(program: &str, args: &[String]) -> Vec<u16> {
    let mut line = String::new();
    if program.contains(' ') && !(program.starts_with('"') && program.ends_with('"')) {
        line.push('"');
        line.push_str(program);
        line.push('"');
    } else {
        line.push_str(program);
    }

    for arg in args {
        line.push(' ');
        if arg.contains(' ') {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }

    let mut encoded: Vec<u16> = line.encode_utf16().collect();
    encoded.push(0);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(units: &[u16]) -> String {
        String::from_utf16(units).unwrap()
    }

    #[test]
    fn test_builder_accumulates_command() {
        let builder = ProcessBuilder::new("/bin/echo")
            .arg("-n")
            .args(["a", "b"])
            .env("KEY", "value")
            .current_dir("/tmp");

        assert_eq!(builder.program(), OsStr::new("/bin/echo"));
        let args: Vec<_> = builder.argv().collect();
        assert_eq!(args, vec!["-n", "a", "b"]);
        assert_eq!(builder.working_dir(), Some(Path::new("/tmp")));
        assert!(!builder.env_cleared());
    }

    #[test]
    fn test_env_name_cmp_is_case_insensitive() {
        assert_eq!(env_name_cmp("PATH", "path"), Ordering::Equal);
        assert_eq!(env_name_cmp("alpha", "BETA"), Ordering::Less);
        assert_eq!(env_name_cmp("Zed", "apple"), Ordering::Greater);
        // Equal prefixes order by length.
        assert_eq!(env_name_cmp("AB", "ABC"), Ordering::Less);
    }

    #[test]
    fn test_merged_env_sorted_and_overridden() {
        let builder = ProcessBuilder::new("x")
            .env_clear()
            .env("b_lower", "1")
            .env("A_UPPER", "2")
            .env("b_lower", "3");

        let env = builder.merged_env();
        assert_eq!(
            env,
            vec![
                ("A_UPPER".to_string(), "2".to_string()),
                ("b_lower".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_environment_block_null_terminated() {
        let builder = ProcessBuilder::new("x").env_clear().env("K", "v").env("J", "w");
        let block = builder.environment_block();
        let text = decode(&block);
        assert_eq!(text, "J=w\0K=v\0\0");
    }

    #[test]
    fn test_environment_block_empty_env() {
        let builder = ProcessBuilder::new("x").env_clear();
        assert_eq!(builder.environment_block(), vec![0]);
    }

    #[test]
    fn test_command_line_quotes_spaced_argv0() {
        let line = command_line("C:\\Program Files\\tool.exe", &[]);
        assert_eq!(decode(&line), "\"C:\\Program Files\\tool.exe\"\0");
    }

    #[test]
    fn test_command_line_leaves_prequoted_argv0() {
        let line = command_line("\"C:\\Program Files\\tool.exe\"", &[]);
        assert_eq!(decode(&line), "\"C:\\Program Files\\tool.exe\"\0");
    }

    #[test]
    fn test_command_line_quotes_spaced_arguments() {
        let line = command_line(
            "tool",
            &["plain".to_string(), "has space".to_string()],
        );
        assert_eq!(decode(&line), "tool plain \"has space\"\0");
    }
}
