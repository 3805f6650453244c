//! Per-call pipeline state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::files::{RunLog, ScratchFiles};
use crate::invoker::ProcessInvoker;
use crate::progress::{ProgressEvent, ProgressSink};

/// Working directory, naming, generated-file ownership and progress sink of
/// one reconstruction call.
///
/// Dropping the context deletes every tracked file when cleanup was
/// requested, so failed calls leave nothing behind. A successful call moves
/// the tracked files into its result with [`PipelineContext::into_scratch`].
pub struct PipelineContext {
    out_dir: PathBuf,
    base: String,
    progress: Arc<dyn ProgressSink>,
    scratch: ScratchFiles,
    invoker: ProcessInvoker,
}

impl PipelineContext {
    /// `out_dir` must exist; it is made absolute because remote jobs run
    /// from it.
    pub fn new(
        out_dir: &Path,
        base: impl Into<String>,
        cleanup: bool,
        progress: Arc<dyn ProgressSink>,
    ) -> std::io::Result<Self> {
        let out_dir = out_dir.canonicalize()?;
        let base = base.into();
        let log = RunLog::create(out_dir.join(format!("{}.engine.log", base)))?;
        Self::with_run_log(&out_dir, base, cleanup, progress, log)
    }

    /// Like [`PipelineContext::new`] but recording into an existing log.
    pub fn with_run_log(
        out_dir: &Path,
        base: impl Into<String>,
        cleanup: bool,
        progress: Arc<dyn ProgressSink>,
        log: RunLog,
    ) -> std::io::Result<Self> {
        Ok(Self {
            out_dir: out_dir.canonicalize()?,
            base: base.into(),
            progress,
            scratch: ScratchFiles::new(cleanup),
            invoker: ProcessInvoker::with_log(log),
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<out_dir>/<base>.<ext>`
    pub fn file(&self, ext: &str) -> PathBuf {
        self.out_dir.join(format!("{}.{}", self.base, ext))
    }

    /// `<out_dir>/<base>.NNN`
    pub fn model_file(&self, model: usize) -> PathBuf {
        model_file(&self.out_dir, &self.base, model)
    }

    /// `<out_dir>/<base>.NNN.pdb`
    pub fn model_pdb(&self, model: usize) -> PathBuf {
        model_pdb(&self.out_dir, &self.base, model)
    }

    pub fn invoker(&self) -> &ProcessInvoker {
        &self.invoker
    }

    /// Transcript shared by every engine run of this call.
    pub fn run_log(&self) -> Option<&RunLog> {
        self.invoker.log()
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.scratch.track(path);
    }

    pub fn cleanup_enabled(&self) -> bool {
        self.scratch.cleanup_enabled()
    }

    pub fn notify(&self, event: ProgressEvent) {
        self.progress.notify(event);
    }

    pub fn into_scratch(self) -> ScratchFiles {
        self.scratch
    }
}

pub(crate) fn model_file(dir: &Path, base: &str, model: usize) -> PathBuf {
    dir.join(format!("{}.{:03}", base, model))
}

pub(crate) fn model_pdb(dir: &Path, base: &str, model: usize) -> PathBuf {
    dir.join(format!("{}.{:03}.pdb", base, model))
}
