//! Session trait definitions for batch schedulers
//!
//! These traits define the scheduler abstraction used by the cluster fan-out:
//! - `BatchSystem`: opens a session (one per cluster run)
//! - `BatchSession`: submits jobs, reports their state, terminates and closes
//!
//! Sessions have an explicit open/close lifecycle. Once `close` has been
//! called every other operation fails with `BatchError::SessionClosed`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BatchResult;

// ---------------------------------------------------------------------------
// JobId / JobState
// ---------------------------------------------------------------------------

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a remote job as seen by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted by the scheduler, not yet started.
    Submitted,
    /// Executing (or queued and active).
    Running,
    /// Finished with a zero exit status.
    Done,
    /// Finished abnormally, was killed, or exited non-zero.
    Failed,
    /// The scheduler could not tell (e.g. accounting lag).
    Unknown,
}

impl JobState {
    /// Whether the job has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// JobTemplate
// ---------------------------------------------------------------------------

/// Description of one remote job.
///
/// Standard output and error are written by the scheduler into
/// `output_dir` / `error_dir` as `<job_name>.o<id>` and `<job_name>.e<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Job name shown by the scheduler; also the log file stem.
    pub job_name: String,

    /// Executable run on the execution host.
    pub remote_command: PathBuf,

    /// Arguments passed to `remote_command`.
    pub args: Vec<String>,

    /// Absolute working directory of the job.
    pub working_directory: PathBuf,

    /// Directory receiving the stdout log.
    pub output_dir: PathBuf,

    /// Directory receiving the stderr log.
    pub error_dir: PathBuf,

    /// Scheduler-specific resource selector (e.g. `-q all.q`).
    pub native_specification: String,
}

impl JobTemplate {
    /// Create a template whose logs go to the working directory.
    pub fn new(
        job_name: impl Into<String>,
        remote_command: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        let working_directory = working_directory.into();
        Self {
            job_name: job_name.into(),
            remote_command: remote_command.into(),
            args: Vec::new(),
            output_dir: working_directory.clone(),
            error_dir: working_directory.clone(),
            working_directory,
            native_specification: String::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_native_specification(mut self, spec: impl Into<String>) -> Self {
        self.native_specification = spec.into();
        self
    }

    /// Command and arguments as one line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.remote_command.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Path of the stdout log for a submitted job.
    pub fn stdout_log(&self, id: &JobId) -> PathBuf {
        log_path(&self.output_dir, &self.job_name, 'o', id)
    }

    /// Path of the stderr log for a submitted job.
    pub fn stderr_log(&self, id: &JobId) -> PathBuf {
        log_path(&self.error_dir, &self.job_name, 'e', id)
    }
}

fn log_path(dir: &Path, job_name: &str, stream: char, id: &JobId) -> PathBuf {
    dir.join(format!("{}.{}{}", job_name, stream, id))
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An open connection to a batch scheduler.
///
/// Guarantees:
/// - `submit` returns a fresh id for every accepted job.
/// - `terminate_all` targets every job submitted through this session.
/// - After `close`, all operations fail with `SessionClosed`.
#[async_trait]
pub trait BatchSession: Send + Sync {
    /// Submit a job. Returns the scheduler id.
    async fn submit(&self, template: &JobTemplate) -> BatchResult<JobId>;

    /// Current state of a submitted job.
    async fn status(&self, job: &JobId) -> BatchResult<JobState>;

    /// Terminate every job submitted in this session that is still alive.
    async fn terminate_all(&self) -> BatchResult<()>;

    /// Release the session.
    async fn close(&self) -> BatchResult<()>;

    /// Whether `close` has not been called yet.
    fn is_open(&self) -> bool;
}

/// Factory for scheduler sessions.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    /// Open a new session.
    async fn open_session(&self) -> BatchResult<Arc<dyn BatchSession>>;

    /// Scheduler name, for logging.
    fn name(&self) -> &str;
}
