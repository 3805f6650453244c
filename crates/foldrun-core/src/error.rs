//! Error types for the reconstruction pipeline
//!
//! Each layer has its own enum: `ProcessError` for one engine invocation,
//! `ParseError` for statistics extraction, `ClusterError` for the fan-out,
//! `StageError` for anything a pipeline stage can fail with, and `ReconError`
//! for what the caller of the orchestrator sees.

use std::path::PathBuf;

use thiserror::Error;

use foldrun_batch::BatchError;

use crate::config::ConfigError;
use crate::restraints::RestraintError;
use crate::stage::Stage;

/// Failure of a single engine program invocation.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine printed its fatal-error marker.
    #[error("{program} reported an error: {line}")]
    ToolReported { program: String, line: String },

    #[error("{program} exited with status {code}")]
    ToolExit { program: String, code: i32 },

    /// Exit status 137/139 or death by SIGKILL/SIGSEGV.
    #[error("{program} ran out of resources (status {code})")]
    ResourceExhausted { program: String, code: i32 },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Failure to extract statistics from engine output.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("expected statistics for {expected} model(s), found {found}")]
    ShortOutput { expected: usize, found: usize },

    #[error("no `{label}` value in engine output")]
    MissingValue { label: String },
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Failure of a cluster fan-out run.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("could not open batch session: {0}")]
    SessionOpen(#[source] BatchError),

    #[error("{failures} job submission(s) failed, budget is {budget}")]
    SubmissionFailure { failures: usize, budget: usize },

    #[error("{failures} job(s) failed, budget is {budget}")]
    JobFailure { failures: usize, budget: usize },

    #[error("only {done} of {needed} model(s) finished within {timeout_secs}s")]
    PollTimeout {
        done: usize,
        needed: usize,
        timeout_secs: u64,
    },

    /// Every job reached a final state but too few succeeded.
    #[error("all jobs finished with only {done} of {needed} model(s)")]
    Exhausted { done: usize, needed: usize },

    #[error("output {} of job {job} not visible after {attempts} attempt(s)", path.display())]
    MissingOutput {
        job: String,
        path: PathBuf,
        attempts: u32,
    },

    #[error("cluster run interrupted")]
    Interrupted,

    #[error("statistics of job {job}: {source}")]
    Statistics {
        job: String,
        #[source]
        source: ParseError,
    },

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Anything a pipeline stage can fail with.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Restraints(#[from] RestraintError),

    /// An engine output file never appeared.
    #[error("expected output {} not found after {attempts} attempt(s)", path.display())]
    MissingOutput { path: PathBuf, attempts: u32 },

    /// The engine reported a problem with its input coordinates.
    #[error("{program} rejected its input coordinates: {line}")]
    InputWarning { program: String, line: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StageResult<T> = std::result::Result<T, StageError>;

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Error returned to callers of the orchestrator.
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("{operation} failed: {source}")]
    Tool {
        operation: &'static str,
        #[source]
        source: StageError,
    },

    #[error("no reconstruction has completed yet")]
    NoResult,

    #[error("model {model} out of range 1..={count}")]
    ModelOutOfRange { model: usize, count: usize },
}

pub type ReconResult<T> = std::result::Result<T, ReconError>;

impl ReconError {
    /// Whether the failure was caused by an interrupt.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            ReconError::Stage {
                source: StageError::Cluster(ClusterError::Interrupted),
                ..
            }
        )
    }
}
