// src/execution/mod.rs

//! External process execution.
//!
//! Every external tool the pipeline drives (clone, scanner, container
//! toolchain, proxy reload, privileged delete) goes through a
//! [`CommandRunner`]. Each invocation carries its own timeout; running past it
//! is an error, a nonzero exit is not.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// One external command invocation
#[derive(Clone)]
pub struct CommandSpec {
    /// Program to run
    pub program: String,

    /// Arguments
    pub args: Vec<String>,

    /// Working directory
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,

    /// Wall-clock limit
    pub timeout: Duration,
}

impl CommandSpec {
    /// Creates a command with no arguments, inheriting the current directory
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    /// Builds a command from a configured argv (`["sudo", "rm", "-rf"]`)
    pub fn from_argv(argv: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), timeout).args(args.iter().cloned()))
    }

    /// Appends one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Program and arguments joined for log output
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Environment values carry secrets
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &self.env.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteResult {
    /// Exit code (-1 if terminated by a signal)
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Execution duration in milliseconds
    pub duration_ms: u64,
}

impl ExecuteResult {
    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion or until its timeout elapses
    async fn run(&self, spec: &CommandSpec) -> Result<ExecuteResult, ExecError>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Creates a new process runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecuteResult, ExecError> {
        debug!("Running {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let started = Instant::now();
        let child = command.spawn().map_err(|e| ExecError::Spawn {
            program: spec.program.clone(),
            error: e.to_string(),
        })?;

        // Dropping the future on timeout kills the child
        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| ExecError::Spawn {
                program: spec.program.clone(),
                error: e.to_string(),
            })?,
            Err(_) => {
                warn!("{} timed out after {:?}", spec.display(), spec.timeout);
                return Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    seconds: spec.timeout.as_secs(),
                });
            }
        };

        let result = ExecuteResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        debug!(
            "{} exited with {} after {}ms",
            spec.program, result.exit_code, result.duration_ms
        );

        Ok(result)
    }
}

/// External process errors
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be started
    #[error("Failed to run {program}: {error}")]
    Spawn {
        /// Program that was run
        program: String,
        /// Underlying failure
        error: String,
    },

    /// The program outlived its timeout
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// Program that was run
        program: String,
        /// Timeout that elapsed
        seconds: u64,
    },
}
