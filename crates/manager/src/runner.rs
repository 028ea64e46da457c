//! Process execution behind a trait so host commands can be recorded in tests.

use std::io::Write;
use std::process::{Command, ExitStatus, Output, Stdio};

use tracing::debug;

use crate::error::{ManagerError, Result};

pub trait CommandRunner {
    /// Run a program to completion and capture its output. A non-zero exit
    /// status is not an error here; callers decide.
    fn run(&self, program: &str, args: &[&str]) -> Result<Output>;
    /// Same as `run`, with `stdin` piped to the child.
    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output>;
    /// Run with the terminal attached, for output the operator watches live.
    fn run_interactive(&self, program: &str, args: &[&str]) -> Result<ExitStatus>;
}

/// Runs commands on the local machine with `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

fn spawn_error(program: &str, e: std::io::Error) -> ManagerError {
    ManagerError::collaborator(program, format!("failed to spawn: {}", e))
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        debug!(program, ?args, "running");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(program, e))
    }

    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output> {
        debug!(program, ?args, bytes = stdin.len(), "running with stdin");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)
                .map_err(|e| ManagerError::collaborator(program, format!("writing stdin: {}", e)))?;
        }

        child
            .wait_with_output()
            .map_err(|e| ManagerError::collaborator(program, format!("waiting: {}", e)))
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> Result<ExitStatus> {
        debug!(program, ?args, "running interactively");
        Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| spawn_error(program, e))
    }
}

/// Turn a finished command into an error when it exited non-zero.
pub fn check(step: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = match stderr.trim() {
        "" => format!("exited with {}", output.status),
        msg => format!("exited with {}: {}", output.status, msg),
    };
    Err(ManagerError::collaborator(step, detail))
}
