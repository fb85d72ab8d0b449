//! External command execution
//!
//! Every host tool the provisioning engine drives (image tools, the NBD bind
//! tool, mkfs, mount, chown, ...) is executed through [`CommandRunner`].
//! Runners block until the child exits; a non-zero exit is not an error at
//! this layer, it is reported through [`CommandResult`] so the caller can
//! attach the tool name and captured output to its own error.

use crate::error::{HalError, HalResult};
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command as StdCommand, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Command execution result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandResult {
    /// Create a new command result
    pub fn new(exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
        }
    }

    /// Create a successful result with output
    pub fn success_with_output(output: impl Into<String>) -> Self {
        Self::new(0, output.into().into_bytes(), Vec::new())
    }

    /// Create a failed result carrying an error message on stderr
    pub fn failure(exit_code: i32, message: impl Into<String>) -> Self {
        Self::new(exit_code, Vec::new(), message.into().into_bytes())
    }

    /// Check if the command was successful
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded lossily
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stderr followed by stdout, trimmed. This is what gets surfaced to
    /// callers when a tool fails.
    pub fn combined_output(&self) -> String {
        let stderr = self.stderr_lossy();
        let stdout = self.stdout_lossy();
        let mut combined = String::new();
        if !stderr.trim().is_empty() {
            combined.push_str(stderr.trim());
        }
        if !stdout.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stdout.trim());
        }
        combined
    }
}

/// Executes host programs synchronously.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output.
    fn run(&self, program: &str, args: &[String]) -> HalResult<CommandResult>;

    /// Run `program` with `args`, feeding `input` on stdin.
    fn run_with_input(&self, program: &str, args: &[String], input: &[u8]) -> HalResult<CommandResult>;
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill any child still running after `timeout` and report
    /// [`HalError::Timeout`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn execute(&self, program: &str, args: &[String], input: Option<&[u8]>) -> HalResult<CommandResult> {
        debug!(program, ?args, "executing");

        let mut cmd = StdCommand::new(program);
        cmd.args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| HalError::process_error("spawn", program, &e.to_string()))?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(bytes)
                    .map_err(|e| HalError::process_error("stdin", program, &e.to_string()))?;
                // stdin is closed here so the child sees EOF
            }
        }

        // Drain both pipes concurrently so a chatty child cannot block on a
        // full pipe while we wait for it.
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let exit_code = match self.timeout {
            Some(limit) => wait_with_limit(&mut child, program, limit)?,
            None => child
                .wait()
                .map_err(|e| HalError::process_error("wait", program, &e.to_string()))?
                .code()
                .unwrap_or(-1),
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        debug!(program, exit_code, "finished");
        Ok(CommandResult::new(exit_code, stdout, stderr))
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> HalResult<CommandResult> {
        self.execute(program, args, None)
    }

    fn run_with_input(&self, program: &str, args: &[String], input: &[u8]) -> HalResult<CommandResult> {
        self.execute(program, args, Some(input))
    }
}

fn wait_with_limit(child: &mut Child, program: &str, limit: Duration) -> HalResult<i32> {
    match child
        .wait_timeout(limit)
        .map_err(|e| HalError::process_error("wait", program, &e.to_string()))?
    {
        Some(status) => Ok(status.code().unwrap_or(-1)),
        None => {
            warn!(program, ?limit, "timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            Err(HalError::timeout(program, limit))
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Check if a command exists in PATH
pub fn command_exists<S: AsRef<OsStr>>(command: S) -> bool {
    let command = Path::new(command.as_ref());
    if command.components().count() > 1 {
        return command.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}
