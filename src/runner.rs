//! Tool Execution
//!
//! Runs the wrapped tool as a child process. Every wait races Ctrl-C; on
//! interrupt the child is killed and `Interrupted` is returned.

use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Output of a tool run whose stdout was captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    /// Exit code
    pub code: i32,

    /// Captured standard output
    pub stdout: Vec<u8>,
}

/// Runs tool executables
///
/// Standard error is always inherited so the tool's own diagnostics reach the user.
#[allow(async_fn_in_trait)]
pub trait ToolRunner {
    /// Run and capture standard output
    async fn capture(&self, program: &str, args: &[String]) -> Result<Captured>;

    /// Run with `input` on standard input; standard output is inherited
    async fn feed(&self, program: &str, args: &[String], input: Vec<u8>) -> Result<i32>;

    /// Run with all standard streams inherited
    async fn inherit(&self, program: &str, args: &[String]) -> Result<i32>;
}

/// Runs tools as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(program: &str, args: &[String]) -> Command {
        tracing::debug!("running {} {}", program, args.join(" "));
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        command
    }
}

impl ToolRunner for ProcessRunner {
    async fn capture(&self, program: &str, args: &[String]) -> Result<Captured> {
        let child = Self::command(program, args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                Ok(Captured {
                    code: exit_code(output.status),
                    stdout: output.stdout,
                })
            }
            _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
        }
    }

    async fn feed(&self, program: &str, args: &[String], input: Vec<u8>) -> Result<i32> {
        let mut child = Self::command(program, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // dropping stdin closes the pipe
                stdin.write_all(&input).await
            })
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::signal::ctrl_c() => return Err(Error::Interrupted),
        };

        if let Some(writer) = writer {
            match writer.await {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                Ok(_) => {}
                Err(e) => tracing::warn!("stdin writer for {} failed: {}", program, e),
            }
        }

        Ok(exit_code(status))
    }

    async fn inherit(&self, program: &str, args: &[String]) -> Result<i32> {
        let mut child = Self::command(program, args)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        tokio::select! {
            status = child.wait() => Ok(exit_code(status?)),
            _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
        }
    }
}

fn spawn_error(program: &str, source: std::io::Error) -> Error {
    Error::SubprocessSpawn {
        tool: program.to_string(),
        source,
    }
}

/// Exit code of a finished process; `128 + signal` when killed by a signal
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
