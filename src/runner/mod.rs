//! Runner module - Execution abstraction layer
//!
//! This module provides the interface for running a candidate program:
//! - `JailedRunner`: runs the untrusted candidate inside the jail with a
//!   hard wall-clock timeout
//!
//! The runner module does NOT:
//! - Compare outputs or determine verdicts
//! - Provision the jail itself
//! - Know about the expected-result layout

pub mod jailed;

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit status reported for a run killed on timeout. Normal exits are
/// `0..=255` and signal deaths `-1..=-64`, so no program can produce it.
pub const TIMEOUT_STATUS: i32 = -256;
/// Exit status recorded when the candidate could not be launched at all
pub const NOT_LAUNCHED_STATUS: i32 = -257;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path as seen inside the jail
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key=value)
    pub env: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.clone());
        v
    }

    /// Parsed `key=value` environment pairs; malformed entries are dropped
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|e| e.split_once('='))
    }
}

/// Resource limits for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock timeout
    pub timeout: Duration,
    /// Bytes kept from each of stdout and stderr
    pub max_output_bytes: usize,
}

impl RunLimits {
    pub fn new(timeout_secs: u64, max_output_bytes: usize) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            max_output_bytes,
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::new(5, 16 * 1024 * 1024)
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
    /// Killed by the runner after the timeout expired
    TimedOut,
}

impl RunStatus {
    /// Platform exit status: the exit code, `-signal`, or [`TIMEOUT_STATUS`]
    pub fn exit_status(&self) -> i32 {
        match *self {
            RunStatus::Exited(code) => code,
            RunStatus::Signaled(sig) => -sig,
            RunStatus::TimedOut => TIMEOUT_STATUS,
        }
    }
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Execution status
    pub status: RunStatus,
    /// Wall-clock time in milliseconds
    pub elapsed_ms: u64,
    /// Stdout content (as string, may have UTF-8 conversion losses)
    pub stdout: String,
    /// Stdout content (as raw bytes)
    pub stdout_bytes: Vec<u8>,
    /// Stderr content (as string, may have UTF-8 conversion losses)
    pub stderr: String,
    /// Stderr content (as raw bytes)
    pub stderr_bytes: Vec<u8>,
}

impl RunOutcome {
    pub fn new(status: RunStatus, elapsed_ms: u64, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            status,
            elapsed_ms,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stdout_bytes: stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stderr_bytes: stderr,
        }
    }

    pub fn exit_status(&self) -> i32 {
        self.status.exit_status()
    }

    pub fn timed_out(&self) -> bool {
        self.status == RunStatus::TimedOut
    }
}

/// Reasons a candidate could not be run at all
#[derive(Debug, Error)]
pub enum JailError {
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
    #[error("no program specified for execution")]
    EmptyCommand,
    #[error("jail root {0} is not available")]
    JailUnavailable(PathBuf),
    #[error("executable {0} does not exist")]
    NotFound(PathBuf),
    #[error("{0} is not an executable regular file")]
    NotExecutable(PathBuf),
    #[error("executable {0} resolves outside the jail")]
    OutsideJail(PathBuf),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unrecognized wait status {0:#x}")]
    UnknownStatus(i32),
    #[error("failed to wait for the candidate: {0}")]
    Wait(#[source] io::Error),
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command with the given limits and optional stdin
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
    ) -> Result<RunOutcome, JailError>;
}

// Re-exports
pub use jailed::JailedRunner;
