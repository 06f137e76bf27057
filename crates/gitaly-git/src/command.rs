//! Subprocess execution for git and hook programs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};

/// Only the tail of stderr is kept; that is where git and hooks put the
/// message that matters.
const MAX_STDERR_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.env.retain(|(existing, _)| existing != &name);
        self.env.push((name, value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {timeout:?} while running `{program}`")]
    Timeout { program: String, timeout: Duration },
    #[error("failed waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.run_inner(spec, None, None).await
    }

    pub async fn run_with_timeout(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.run_inner(spec, None, Some(timeout)).await
    }

    pub async fn run_with_input(
        &self,
        spec: &CommandSpec,
        stdin: &[u8],
    ) -> Result<CommandOutput, CommandError> {
        self.run_inner(spec, Some(stdin), None).await
    }

    pub async fn run_with_input_timeout(
        &self,
        spec: &CommandSpec,
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.run_inner(spec, Some(stdin), Some(timeout)).await
    }

    async fn run_inner(
        &self,
        spec: &CommandSpec,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let execution = execute(spec, stdin);
        let mut output = match timeout {
            Some(deadline) => tokio::time::timeout(deadline, execution)
                .await
                .map_err(|_| CommandError::Timeout {
                    program: spec.program.clone(),
                    timeout: deadline,
                })??,
            None => execution.await?,
        };

        keep_stderr_tail(&mut output.stderr);
        Ok(output)
    }
}

async fn execute(spec: &CommandSpec, stdin: Option<&[u8]>) -> Result<CommandOutput, CommandError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(name, value)| (name, value)))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let wait_error = |source| CommandError::Wait {
        program: spec.program.clone(),
        source,
    };

    // stdin is fed while stdout/stderr drain so large payloads cannot
    // deadlock against a full output pipe.
    let output = match (stdin, child.stdin.take()) {
        (Some(payload), Some(child_stdin)) => {
            let (written, output) =
                tokio::join!(feed_stdin(child_stdin, payload), child.wait_with_output());
            let output = output.map_err(wait_error)?;
            written.map_err(wait_error)?;
            output
        }
        _ => child.wait_with_output().await.map_err(wait_error)?,
    };

    Ok(CommandOutput {
        status_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

async fn feed_stdin(mut child_stdin: ChildStdin, payload: &[u8]) -> std::io::Result<()> {
    let result = async {
        child_stdin.write_all(payload).await?;
        child_stdin.shutdown().await
    }
    .await;

    match result {
        // Programs are free to exit without reading their input.
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

fn keep_stderr_tail(stderr: &mut Vec<u8>) {
    if stderr.len() > MAX_STDERR_BYTES {
        let excess = stderr.len() - MAX_STDERR_BYTES;
        stderr.drain(..excess);
    }
}
