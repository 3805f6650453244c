//! Error types for batch scheduler sessions

use thiserror::Error;

/// Errors raised while talking to a batch scheduler
#[derive(Error, Debug)]
pub enum BatchError {
    /// The session was already closed
    #[error("batch session is closed")]
    SessionClosed,

    /// The scheduler could not be contacted
    #[error("could not open batch session: {0}")]
    SessionOpen(String),

    /// A scheduler command could not be launched
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A scheduler command exited with a non-zero status
    #[error("`{command}` exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The scheduler refused a job
    #[error("job submission rejected: {0}")]
    SubmissionRejected(String),

    /// The job id is not known to this session
    #[error("unknown job id: {0}")]
    UnknownJob(String),

    /// Scheduler output did not have the expected shape
    #[error("unexpected scheduler output: {0}")]
    UnexpectedOutput(String),
}

/// Result type for batch operations
pub type BatchResult<T> = std::result::Result<T, BatchError>;
