//! Scripted in-memory scheduler (testing only)
//!
//! `ScriptedBatchSystem` hands out `ScriptedSession`s whose jobs follow a
//! per-submission script: the n-th `submit` call uses the n-th `JobScript`.
//! A completion hook lets tests materialize the files a real job would leave
//! behind at the moment the job is first reported as done.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{BatchError, BatchResult};
use crate::session::{BatchSession, BatchSystem, JobId, JobState, JobTemplate};

/// Behaviour of one scripted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobScript {
    /// The scheduler rejects the submission.
    RejectSubmission,
    /// Reported done on the `after_polls`-th status query.
    Succeed { after_polls: u32 },
    /// Reported failed on the `after_polls`-th status query.
    Fail { after_polls: u32 },
    /// Keeps running until terminated.
    Hang,
}

/// Called once per job when it first reports `Done`.
pub type CompletionHook = Arc<dyn Fn(&JobTemplate, &JobId) + Send + Sync>;

// ---------------------------------------------------------------------------
// ScriptedBatchSystem
// ---------------------------------------------------------------------------

/// Scheduler whose jobs follow a fixed script.
pub struct ScriptedBatchSystem {
    scripts: Vec<JobScript>,
    default_script: JobScript,
    hook: Option<CompletionHook>,
    refuse_open: bool,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedBatchSystem {
    /// Jobs beyond the end of `scripts` succeed on their first poll.
    pub fn new(scripts: Vec<JobScript>) -> Self {
        Self {
            scripts,
            default_script: JobScript::Succeed { after_polls: 1 },
            hook: None,
            refuse_open: false,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, script: JobScript) -> Self {
        self.default_script = script;
        self
    }

    pub fn on_completion(mut self, hook: CompletionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Make `open_session` fail.
    pub fn refusing_sessions(mut self) -> Self {
        self.refuse_open = true;
        self
    }

    /// Most recently opened session.
    pub fn last_session(&self) -> Option<Arc<ScriptedSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchSystem for ScriptedBatchSystem {
    async fn open_session(&self) -> BatchResult<Arc<dyn BatchSession>> {
        if self.refuse_open {
            return Err(BatchError::SessionOpen("scheduler unreachable".to_string()));
        }
        let session = Arc::new(ScriptedSession::new(
            self.scripts.clone(),
            self.default_script,
            self.hook.clone(),
        ));
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// ScriptedSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeJob {
    id: JobId,
    template: JobTemplate,
    script: JobScript,
    polls: u32,
    state: JobState,
}

#[derive(Debug, Default)]
struct SessionState {
    submit_attempts: usize,
    jobs: Vec<FakeJob>,
}

/// Session of a `ScriptedBatchSystem`.
pub struct ScriptedSession {
    scripts: Vec<JobScript>,
    default_script: JobScript,
    hook: Option<CompletionHook>,
    state: Mutex<SessionState>,
    open: AtomicBool,
    close_calls: AtomicU32,
    terminate_calls: AtomicU32,
}

impl ScriptedSession {
    fn new(scripts: Vec<JobScript>, default_script: JobScript, hook: Option<CompletionHook>) -> Self {
        Self {
            scripts,
            default_script,
            hook,
            state: Mutex::new(SessionState::default()),
            open: AtomicBool::new(true),
            close_calls: AtomicU32::new(0),
            terminate_calls: AtomicU32::new(0),
        }
    }

    fn ensure_open(&self) -> BatchResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BatchError::SessionClosed)
        }
    }

    /// Number of `submit` calls, rejected ones included.
    pub fn submit_attempts(&self) -> usize {
        self.state.lock().unwrap().submit_attempts
    }

    /// Templates of accepted submissions, in submission order.
    pub fn submitted(&self) -> Vec<JobTemplate> {
        let state = self.state.lock().unwrap();
        state.jobs.iter().map(|j| j.template.clone()).collect()
    }

    /// Jobs that were neither finished nor terminated.
    pub fn alive_jobs(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .iter()
            .filter(|j| !j.state.is_terminal())
            .count()
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSession for ScriptedSession {
    async fn submit(&self, template: &JobTemplate) -> BatchResult<JobId> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.submit_attempts += 1;
        let script = self
            .scripts
            .get(state.submit_attempts - 1)
            .copied()
            .unwrap_or(self.default_script);

        if script == JobScript::RejectSubmission {
            return Err(BatchError::SubmissionRejected(format!(
                "scripted rejection of {}",
                template.job_name
            )));
        }

        let id = JobId::new((1000 + state.submit_attempts).to_string());
        state.jobs.push(FakeJob {
            id: id.clone(),
            template: template.clone(),
            script,
            polls: 0,
            state: JobState::Submitted,
        });
        Ok(id)
    }

    async fn status(&self, job: &JobId) -> BatchResult<JobState> {
        self.ensure_open()?;

        let (state, completed) = {
            let mut state = self.state.lock().unwrap();
            let fake = state
                .jobs
                .iter_mut()
                .find(|j| &j.id == job)
                .ok_or_else(|| BatchError::UnknownJob(job.to_string()))?;

            if fake.state.is_terminal() {
                return Ok(fake.state);
            }

            fake.polls += 1;
            fake.state = match fake.script {
                JobScript::Succeed { after_polls } if fake.polls >= after_polls => JobState::Done,
                JobScript::Fail { after_polls } if fake.polls >= after_polls => JobState::Failed,
                _ => JobState::Running,
            };
            let completed = (fake.state == JobState::Done).then(|| fake.template.clone());
            (fake.state, completed)
        };

        if let (Some(template), Some(hook)) = (completed, &self.hook) {
            hook(&template, job);
        }
        Ok(state)
    }

    async fn terminate_all(&self) -> BatchResult<()> {
        self.ensure_open()?;
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        for job in state.jobs.iter_mut().filter(|j| !j.state.is_terminal()) {
            job.state = JobState::Failed;
        }
        Ok(())
    }

    async fn close(&self) -> BatchResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BatchError::SessionClosed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
