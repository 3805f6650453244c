//! Engine program execution
//!
//! `ProcessInvoker` runs one program to completion: the optional stdin
//! payload is written while stdout and stderr are drained, so a chatty
//! program never blocks on a full pipe. The outcome is classified as
//! - success
//! - tool-reported error: a stdout line starting with [`TOOL_ERROR_MARKER`],
//!   regardless of the exit status
//! - resource exhaustion: status 137/139, or killed by SIGKILL/SIGSEGV
//! - tool failure: any other non-zero status

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::files::RunLog;

/// Line prefix the engine prints before aborting.
pub const TOOL_ERROR_MARKER: &str = " TINKER is Unable to Continue";

/// One program invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Command line as written to the run log.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Short program name for error messages.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

/// Captured output of a finished program.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub lines: Vec<String>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProcessOutput {
    /// First stdout line carrying the engine's fatal-error marker.
    pub fn tool_error(&self) -> Option<&str> {
        self.lines
            .iter()
            .find(|l| l.starts_with(TOOL_ERROR_MARKER))
            .map(String::as_str)
    }

    /// First stdout line starting with `prefix`.
    pub fn line_starting_with(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|l| l.starts_with(prefix))
            .map(String::as_str)
    }
}

/// Exit status classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    ResourceExhausted(i32),
    Failure(i32),
}

/// Classify a shell-style exit code (signals as `128 + signo`).
pub fn classify_exit(code: i32) -> ExitOutcome {
    match code {
        0 => ExitOutcome::Success,
        137 | 139 => ExitOutcome::ResourceExhausted(code),
        other => ExitOutcome::Failure(other),
    }
}

#[cfg(unix)]
fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Runs engine programs, recording each one in the run log.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker {
    log: Option<RunLog>,
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: RunLog) -> Self {
        Self { log: Some(log) }
    }

    pub fn log(&self) -> Option<&RunLog> {
        self.log.as_ref()
    }

    /// Run to completion and classify the outcome.
    pub async fn run(&self, invocation: &Invocation) -> ProcessResult<ProcessOutput> {
        let output = self.execute(invocation).await?;
        let program = invocation.program_name();

        if let Some(line) = output.tool_error() {
            return Err(ProcessError::ToolReported {
                program,
                line: line.trim().to_string(),
            });
        }
        match classify_exit(output.exit_code) {
            ExitOutcome::Success => Ok(output),
            ExitOutcome::ResourceExhausted(code) => {
                Err(ProcessError::ResourceExhausted { program, code })
            }
            ExitOutcome::Failure(code) => Err(ProcessError::ToolExit { program, code }),
        }
    }

    /// Run to completion without classifying the exit status.
    pub async fn execute(&self, invocation: &Invocation) -> ProcessResult<ProcessOutput> {
        let command_line = invocation.command_line();
        let program = invocation.program_name();
        debug!(command = %command_line, "Running engine program");

        let io_err = |source: std::io::Error| ProcessError::Io {
            program: program.clone(),
            source,
        };

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let payload = invocation.stdin.as_deref();

        let write = async move {
            if let (Some(mut pipe), Some(payload)) = (stdin, payload) {
                pipe.write_all(payload.as_bytes()).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let read_out = async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<Vec<u8>, std::io::Error>(buf)
        };
        let read_err = async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<Vec<u8>, std::io::Error>(buf)
        };

        let (written, out, err) = tokio::join!(write, read_out, read_err);
        match written {
            // the program may exit without reading all of its input
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(program = %program, "stdin closed early");
            }
            other => other.map_err(io_err)?,
        }
        let out = out.map_err(io_err)?;
        let err = err.map_err(io_err)?;
        let status = child.wait().await.map_err(io_err)?;

        let output = ProcessOutput {
            lines: String::from_utf8_lossy(&out)
                .lines()
                .map(str::to_string)
                .collect(),
            stderr: String::from_utf8_lossy(&err).to_string(),
            exit_code: exit_code(&status),
        };

        if let Some(log) = &self.log {
            if let Err(e) = log.record(&command_line, &output.lines, &output.stderr) {
                warn!(path = %log.path().display(), error = %e, "Could not write run log");
            }
        }
        debug!(program = %program, code = output.exit_code, lines = output.lines.len(), "Program finished");
        Ok(output)
    }
}
