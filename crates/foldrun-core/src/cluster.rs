//! Fault-tolerant fan-out of single-model jobs to a batch scheduler
//!
//! For `N` models the coordinator submits `M = ceil((1+f)N)` jobs, each
//! embedding one model from its own copy of the input with its own random
//! seed, and polls until `N` of them are done. Up to `floor(f*N)` submission
//! failures and, independently, `floor(f*N)` execution failures are
//! tolerated. The first `N` successes in submission order become models
//! `1..=N`, whatever order they finished in.
//!
//! The batch session is owned by a [`SessionGuard`]: every exit path
//! (success, error, interrupt, or the future being dropped) terminates what
//! is still running and closes the session exactly once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use foldrun_batch::{BatchSession, BatchSystem, JobId, JobState, JobTemplate};

use crate::config::{ClusterConfig, EngineConfig, MAX_SEED};
use crate::context::PipelineContext;
use crate::error::{ClusterError, ClusterResult};
use crate::files::{predict_output, wait_for_file};
use crate::interrupt::InterruptHandle;
use crate::parser::{parse_statistics, ModelStatistics};
use crate::progress::ProgressEvent;
use crate::stage::EngineProgram;

// ---------------------------------------------------------------------------
// SessionGuard
// ---------------------------------------------------------------------------

/// Owns a batch session and releases it exactly once.
pub struct SessionGuard {
    session: Arc<dyn BatchSession>,
    released: AtomicBool,
}

impl SessionGuard {
    pub fn new(session: Arc<dyn BatchSession>) -> Self {
        Self {
            session,
            released: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &dyn BatchSession {
        self.session.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Optionally terminate the session's jobs, then close it. Later calls
    /// do nothing.
    pub async fn release(&self, terminate: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        teardown(self.session.as_ref(), terminate).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { teardown(session.as_ref(), true).await });
            }
            Err(_) => warn!("Batch session dropped outside a runtime; remote jobs may keep running"),
        }
    }
}

async fn teardown(session: &dyn BatchSession, terminate: bool) {
    if terminate {
        if let Err(e) = session.terminate_all().await {
            warn!(error = %e, "Could not terminate remote jobs");
        }
    }
    if let Err(e) = session.close().await {
        warn!(error = %e, "Could not close batch session");
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// One submitted job.
#[derive(Debug, Clone)]
struct RemoteJob {
    /// 1-based submission index.
    index: usize,
    id: JobId,
    template: JobTemplate,
    xyz: PathBuf,
    key: PathBuf,
    output: PathBuf,
}

impl RemoteJob {
    fn stdout_log(&self) -> PathBuf {
        self.template.stdout_log(&self.id)
    }

    fn files(&self) -> [PathBuf; 5] {
        [
            self.xyz.clone(),
            self.key.clone(),
            self.output.clone(),
            self.template.stdout_log(&self.id),
            self.template.stderr_log(&self.id),
        ]
    }

    fn remove_files(&self) {
        for path in self.files() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Could not remove job file");
                }
            }
        }
    }
}

/// Spreads the embedding of `N` models over a batch scheduler.
pub struct ClusterJobCoordinator<'a> {
    system: &'a dyn BatchSystem,
    engine: &'a EngineConfig,
    config: &'a ClusterConfig,
    interrupt: InterruptHandle,
}

impl<'a> ClusterJobCoordinator<'a> {
    pub fn new(
        system: &'a dyn BatchSystem,
        engine: &'a EngineConfig,
        config: &'a ClusterConfig,
        interrupt: InterruptHandle,
    ) -> Self {
        Self {
            system,
            engine,
            config,
            interrupt,
        }
    }

    /// Embed `models` models from `<base>.xyz` / `<base>.key` and leave them
    /// as `<base>.001` .. `<base>.NNN`.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        models: usize,
    ) -> ClusterResult<Vec<ModelStatistics>> {
        let session = self
            .system
            .open_session()
            .await
            .map_err(ClusterError::SessionOpen)?;
        let guard = SessionGuard::new(session);

        let result = self.fan_out(&guard, ctx, models).await;
        // no-op when the success path already released the session
        guard.release(true).await;
        result
    }

    async fn fan_out(
        &self,
        guard: &SessionGuard,
        ctx: &mut PipelineContext,
        models: usize,
    ) -> ClusterResult<Vec<ModelStatistics>> {
        let jobs = self.config.job_count(models);
        let budget = self.config.failure_budget(models);
        info!(
            scheduler = self.system.name(),
            models,
            jobs,
            budget,
            "Submitting cluster jobs"
        );

        let submitted = self.submit_all(guard.session(), ctx, jobs, budget).await?;
        let (done, pending, failures) =
            self.poll(guard.session(), ctx, submitted, models, budget).await?;

        // the session is not needed past this point; stop surplus jobs and
        // failed jobs the scheduler still holds
        guard.release(!pending.is_empty() || failures > 0).await;
        for job in &pending {
            job.remove_files();
        }

        self.reassemble(ctx, done, models).await
    }

    async fn submit_all(
        &self,
        session: &dyn BatchSession,
        ctx: &mut PipelineContext,
        jobs: usize,
        budget: usize,
    ) -> ClusterResult<Vec<RemoteJob>> {
        let xyz = ctx.file("xyz");
        let key_text = std::fs::read_to_string(ctx.file("key")).map_err(|source| {
            ClusterError::Io {
                path: ctx.file("key"),
                source,
            }
        })?;
        let program = self.engine.program(EngineProgram::Distgeom);

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut submitted = Vec::with_capacity(jobs);
        let mut failures = 0usize;

        for index in 1..=jobs {
            if self.interrupt.is_interrupted() {
                return Err(ClusterError::Interrupted);
            }

            let job_base = format!("{}_{}", ctx.base(), index);
            let job_xyz = ctx.out_dir().join(format!("{}.xyz", job_base));
            let job_key = ctx.out_dir().join(format!("{}.key", job_base));
            let seed = rng.gen_range(0..MAX_SEED);

            copy_file(&xyz, &job_xyz)?;
            write_file(&job_key, &format!("RANDOMSEED {}\n{}", seed, key_text))?;
            ctx.track(&job_xyz);
            ctx.track(&job_key);

            let output = predict_output(ctx.out_dir(), &format!("{}.001", job_base));
            ctx.track(&output);

            let template = JobTemplate::new(
                format!("{}{}", self.config.job_prefix, job_base),
                &program,
                ctx.out_dir(),
            )
            .with_args(
                [job_xyz.to_string_lossy().to_string(), "1".to_string()]
                    .into_iter()
                    .chain(self.engine.embed_flags()),
            )
            .with_native_specification(self.config.native_spec.clone());

            match session.submit(&template).await {
                Ok(id) => {
                    debug!(index, job = %id, seed, "Submitted");
                    ctx.track(template.stdout_log(&id));
                    ctx.track(template.stderr_log(&id));
                    submitted.push(RemoteJob {
                        index,
                        id,
                        template,
                        xyz: job_xyz,
                        key: job_key,
                        output,
                    });
                }
                Err(e) => {
                    failures += 1;
                    warn!(index, error = %e, failures, budget, "Job submission failed");
                    if failures > budget {
                        return Err(ClusterError::SubmissionFailure { failures, budget });
                    }
                }
            }
        }
        Ok(submitted)
    }

    /// Poll until `models` jobs are done. Returns the done jobs keyed by
    /// submission index, the jobs still pending and the failure count.
    async fn poll(
        &self,
        session: &dyn BatchSession,
        ctx: &mut PipelineContext,
        mut pending: Vec<RemoteJob>,
        models: usize,
        budget: usize,
    ) -> ClusterResult<(BTreeMap<usize, RemoteJob>, Vec<RemoteJob>, usize)> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let start = Instant::now();

        let mut done: BTreeMap<usize, RemoteJob> = BTreeMap::new();
        let mut failures = 0usize;

        while done.len() < models {
            if start.elapsed() > timeout {
                warn!(done = done.len(), needed = models, "Polling timed out");
                return Err(ClusterError::PollTimeout {
                    done: done.len(),
                    needed: models,
                    timeout_secs: self.config.timeout_secs,
                });
            }
            if pending.is_empty() {
                return Err(ClusterError::Exhausted {
                    done: done.len(),
                    needed: models,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.interrupt.interrupted() => {
                    warn!("Cluster run interrupted");
                    return Err(ClusterError::Interrupted);
                }
            }

            let before = done.len();
            let mut still_pending = Vec::with_capacity(pending.len());
            for job in std::mem::take(&mut pending) {
                match session.status(&job.id).await {
                    Ok(JobState::Done) => {
                        debug!(index = job.index, job = %job.id, "Job done");
                        done.insert(job.index, job);
                    }
                    Ok(JobState::Failed) => {
                        failures += 1;
                        warn!(index = job.index, job = %job.id, failures, budget, "Job failed");
                    }
                    Ok(_) => still_pending.push(job),
                    Err(e) => {
                        // treated like an unknown state; the job stays pending
                        warn!(job = %job.id, error = %e, "Status query failed");
                        still_pending.push(job);
                    }
                }
            }
            pending = still_pending;

            if failures > budget {
                return Err(ClusterError::JobFailure { failures, budget });
            }
            if done.len() > before {
                ctx.notify(ProgressEvent::ModelsDone {
                    done: done.len().min(models),
                    total: models,
                });
            }
        }

        info!(done = done.len(), pending = pending.len(), failures, "Enough jobs finished");
        Ok((done, pending, failures))
    }

    async fn reassemble(
        &self,
        ctx: &mut PipelineContext,
        done: BTreeMap<usize, RemoteJob>,
        models: usize,
    ) -> ClusterResult<Vec<ModelStatistics>> {
        let attempts = self.config.output_retries;
        let delay = Duration::from_millis(self.config.output_retry_ms);

        for job in done.values() {
            for path in [&job.output, &job.stdout_log()] {
                if wait_for_file(path, attempts, delay).await.is_none() {
                    return Err(ClusterError::MissingOutput {
                        job: job.id.to_string(),
                        path: path.clone(),
                        attempts,
                    });
                }
            }
        }

        let mut kept = done.into_values();
        let mut statistics = Vec::with_capacity(models);
        for model in 1..=models {
            let Some(job) = kept.next() else {
                break;
            };
            let target = ctx.model_file(model);
            std::fs::rename(&job.output, &target).map_err(|source| ClusterError::Io {
                path: job.output.clone(),
                source,
            })?;
            ctx.track(&target);

            let log = job.stdout_log();
            let text = std::fs::read_to_string(&log)
                .map_err(|source| ClusterError::Io { path: log, source })?;
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            if let Some(run_log) = ctx.run_log() {
                // the stderr log is optional on most schedulers
                let stderr =
                    std::fs::read_to_string(job.template.stderr_log(&job.id)).unwrap_or_default();
                if let Err(e) = run_log.record(&job.template.command_line(), &lines, &stderr) {
                    warn!(path = %run_log.path().display(), error = %e, "Could not write run log");
                }
            }
            let parsed = parse_statistics(&lines, 1).map_err(|source| ClusterError::Statistics {
                job: job.id.to_string(),
                source,
            })?;
            if parsed.tool_error_seen {
                warn!(job = %job.id, "Job log carries an engine error marker");
            }

            let mut stats = parsed.statistics.into_iter().next().unwrap_or_default();
            stats.model = model;
            debug!(model, index = job.index, job = %job.id, "Model assembled");
            statistics.push(stats);
        }

        let surplus: Vec<_> = kept.collect();
        if !surplus.is_empty() {
            debug!(count = surplus.len(), "Discarding surplus models");
        }
        for job in &surplus {
            job.remove_files();
        }

        Ok(statistics)
    }
}

fn copy_file(from: &Path, to: &Path) -> ClusterResult<()> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| ClusterError::Io {
            path: from.to_path_buf(),
            source,
        })
}

fn write_file(path: &Path, contents: &str) -> ClusterResult<()> {
    std::fs::write(path, contents).map_err(|source| ClusterError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldrun_batch::fakes::{JobScript, ScriptedBatchSystem};

    #[tokio::test]
    async fn test_guard_releases_once() {
        let system = ScriptedBatchSystem::new(vec![]).with_default(JobScript::Hang);
        let session = system.open_session().await.unwrap();
        session
            .submit(&JobTemplate::new("RC_m_1", "/bin/true", "/tmp"))
            .await
            .unwrap();

        let guard = SessionGuard::new(session);
        guard.release(true).await;
        guard.release(true).await;
        assert!(guard.is_released());

        let fake = system.last_session().unwrap();
        assert_eq!(fake.close_calls(), 1);
        assert_eq!(fake.terminate_calls(), 1);
        assert_eq!(fake.alive_jobs(), 0);
    }

    #[tokio::test]
    async fn test_guard_drop_tears_down() {
        let system = ScriptedBatchSystem::new(vec![]).with_default(JobScript::Hang);
        let session = system.open_session().await.unwrap();
        session
            .submit(&JobTemplate::new("RC_m_1", "/bin/true", "/tmp"))
            .await
            .unwrap();

        drop(SessionGuard::new(session));
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let fake = system.last_session().unwrap();
        assert_eq!(fake.close_calls(), 1);
        assert_eq!(fake.alive_jobs(), 0);
    }

    #[tokio::test]
    async fn test_release_without_terminate_keeps_jobs() {
        let system = ScriptedBatchSystem::new(vec![]).with_default(JobScript::Hang);
        let session = system.open_session().await.unwrap();
        session
            .submit(&JobTemplate::new("RC_m_1", "/bin/true", "/tmp"))
            .await
            .unwrap();

        let guard = SessionGuard::new(session);
        guard.release(false).await;

        let fake = system.last_session().unwrap();
        assert_eq!(fake.terminate_calls(), 0);
        assert!(!fake.is_open());
    }
}
