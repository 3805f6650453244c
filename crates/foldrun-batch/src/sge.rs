//! Grid-engine driver
//!
//! Talks to a grid-engine style scheduler through its command-line tools:
//! - `qsub -terse` to submit, returning the job id on stdout
//! - `qstat -j <id>` to check whether a job is still known to the scheduler
//! - `qacct -j <id>` to read the final `failed` / `exit_status` of a finished job
//! - `qdel <ids>` to terminate jobs of the session

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BatchError, BatchResult};
use crate::session::{BatchSession, BatchSystem, JobId, JobState, JobTemplate};

/// Locations of the scheduler client tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridEngine {
    pub qsub: PathBuf,
    pub qstat: PathBuf,
    pub qacct: PathBuf,
    pub qdel: PathBuf,
}

impl Default for GridEngine {
    fn default() -> Self {
        Self {
            qsub: PathBuf::from("qsub"),
            qstat: PathBuf::from("qstat"),
            qacct: PathBuf::from("qacct"),
            qdel: PathBuf::from("qdel"),
        }
    }
}

impl GridEngine {
    /// Use the client tools found in `bin_dir`.
    pub fn from_bin_dir(bin_dir: impl Into<PathBuf>) -> Self {
        let bin_dir = bin_dir.into();
        Self {
            qsub: bin_dir.join("qsub"),
            qstat: bin_dir.join("qstat"),
            qacct: bin_dir.join("qacct"),
            qdel: bin_dir.join("qdel"),
        }
    }
}

#[async_trait]
impl BatchSystem for GridEngine {
    async fn open_session(&self) -> BatchResult<Arc<dyn BatchSession>> {
        // qstat with no arguments is the cheapest way to see whether the
        // scheduler answers at all
        let output = run_tool(&self.qstat, &[]).await?;
        if output.code != 0 {
            return Err(BatchError::SessionOpen(format!(
                "{} exited with status {}: {}",
                self.qstat.display(),
                output.code,
                output.stderr.trim()
            )));
        }
        info!("Opened grid engine session");
        Ok(Arc::new(GridEngineSession::new(self.clone())))
    }

    fn name(&self) -> &str {
        "grid-engine"
    }
}

/// A session tracking the jobs it submitted.
pub struct GridEngineSession {
    tools: GridEngine,
    submitted: Mutex<Vec<JobId>>,
    open: AtomicBool,
}

impl GridEngineSession {
    pub fn new(tools: GridEngine) -> Self {
        Self {
            tools,
            submitted: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> BatchResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BatchError::SessionClosed)
        }
    }

    /// Build the `qsub` argument list for a template.
    fn submit_args(template: &JobTemplate) -> Vec<String> {
        let mut args = vec![
            "-terse".to_string(),
            "-b".to_string(),
            "y".to_string(),
            "-N".to_string(),
            template.job_name.clone(),
            "-wd".to_string(),
            template.working_directory.to_string_lossy().to_string(),
            // the leading ':' stops the scheduler from rewriting the path
            // relative to the submission host
            "-o".to_string(),
            format!(":{}", template.output_dir.to_string_lossy()),
            "-e".to_string(),
            format!(":{}", template.error_dir.to_string_lossy()),
        ];
        args.extend(
            template
                .native_specification
                .split_whitespace()
                .map(str::to_string),
        );
        args.push(template.remote_command.to_string_lossy().to_string());
        args.extend(template.args.iter().cloned());
        args
    }
}

#[async_trait]
impl BatchSession for GridEngineSession {
    async fn submit(&self, template: &JobTemplate) -> BatchResult<JobId> {
        self.ensure_open()?;

        let args = Self::submit_args(template);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_tool(&self.tools.qsub, &arg_refs).await?;
        if output.code != 0 {
            return Err(BatchError::SubmissionRejected(format!(
                "{} (status {})",
                output.stderr.trim(),
                output.code
            )));
        }

        let id = parse_job_id(&output.stdout)?;
        debug!(job = %id, name = %template.job_name, "Submitted job");
        self.submitted.lock().await.push(id.clone());
        Ok(id)
    }

    async fn status(&self, job: &JobId) -> BatchResult<JobState> {
        self.ensure_open()?;

        let stat = run_tool(&self.tools.qstat, &["-j", job.as_str()]).await?;
        if stat.code == 0 {
            let state = parse_job_status(&stat.stdout);
            if state == JobState::Failed {
                warn!(job = %job, "Job is in an error state");
            }
            return Ok(state);
        }

        // no longer known to qstat: the job has finished one way or the other
        let acct = run_tool(&self.tools.qacct, &["-j", job.as_str()]).await?;
        if acct.code != 0 {
            // accounting records are written with some delay
            return Ok(JobState::Unknown);
        }
        Ok(parse_accounting(&acct.stdout).unwrap_or(JobState::Unknown))
    }

    async fn terminate_all(&self) -> BatchResult<()> {
        self.ensure_open()?;

        let ids = self.submitted.lock().await.clone();
        if ids.is_empty() {
            return Ok(());
        }

        info!(count = ids.len(), "Terminating session jobs");
        let arg_refs: Vec<&str> = ids.iter().map(JobId::as_str).collect();
        let output = run_tool(&self.tools.qdel, &arg_refs).await?;
        if output.code != 0 {
            // qdel complains about ids that already finished; the rest were removed
            warn!(
                code = output.code,
                stderr = %output.stderr.trim(),
                "qdel reported errors while terminating jobs"
            );
        }
        Ok(())
    }

    async fn close(&self) -> BatchResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BatchError::SessionClosed);
        }
        debug!("Closed grid engine session");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct ToolOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

async fn run_tool(program: &Path, args: &[&str]) -> BatchResult<ToolOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| BatchError::Spawn {
            command: program.display().to_string(),
            source,
        })?;

    Ok(ToolOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Extract the job id from `qsub -terse` output.
///
/// Array jobs print `<id>.<range>`; only the id part is kept.
pub fn parse_job_id(stdout: &str) -> BatchResult<JobId> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| BatchError::UnexpectedOutput("empty qsub output".to_string()))?;

    let id = line.split('.').next().unwrap_or(line);
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(BatchError::UnexpectedOutput(format!(
            "not a job id: {:?}",
            line
        )));
    }
    Ok(JobId::new(id))
}

/// Derive the final state of a job from `qacct -j` output.
///
/// Returns `None` when either the `failed` or `exit_status` field is missing.
/// State of a job still listed by `qstat -j`.
///
/// Jobs held in an error state (`Eqw`) never run; they show an
/// `error reason` line or an `E` in `job_state`.
pub fn parse_job_status(stdout: &str) -> JobState {
    for line in stdout.lines() {
        let line = line.trim_start();
        if line.starts_with("error reason") {
            return JobState::Failed;
        }
        if let Some(rest) = line.strip_prefix("job_state") {
            // "job_state             1:    Eqw"
            let state = rest.rsplit(':').next().unwrap_or("").trim();
            if state.contains('E') {
                return JobState::Failed;
            }
        }
    }
    JobState::Running
}

pub fn parse_accounting(stdout: &str) -> Option<JobState> {
    let mut failed = None;
    let mut exit_status = None;

    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("failed"), Some(v)) => failed = Some(v.to_string()),
            (Some("exit_status"), Some(v)) => exit_status = Some(v.to_string()),
            _ => {}
        }
    }

    match (failed?.as_str(), exit_status?.as_str()) {
        ("0", "0") => Some(JobState::Done),
        _ => Some(JobState::Failed),
    }
}
