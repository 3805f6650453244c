//! Reconstruction orchestrator
//!
//! `Reconstructor::reconstruct` walks the four stages in order:
//! 1. protein - build the unfolded chain `<base>.xyz` / `<base>.seq` / `<base>.pdb`
//! 2. constraints - compile the restraints into `<base>.key`
//! 3. structures - embed N models locally or on the cluster
//! 4. selection - convert every model to PDB and pick the best
//!
//! Any stage failure ends the call with `ReconError::Stage`. Files generated
//! by a call are owned by its context and, with cleanup requested, deleted
//! on failure or when the result is replaced by the next call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use foldrun_batch::BatchSystem;

use crate::cluster::ClusterJobCoordinator;
use crate::config::{ClusterConfig, EngineConfig};
use crate::context::{self, PipelineContext};
use crate::error::{ReconError, ReconResult, StageError, StageResult};
use crate::files::{file_stem, predict_output, wait_for_file, RunLog, ScratchFiles};
use crate::interrupt::InterruptHandle;
use crate::invoker::Invocation;
use crate::parser::{find_value, ModelStatistics};
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::restraints::{KeyFileCompiler, RestraintCompiler, RestraintSpec};
use crate::selection::pick_best;
use crate::serial::SerialJobRunner;
use crate::stage::{EngineProgram, Stage};

/// Title line given to the chain builder.
const CHAIN_TITLE: &str = "Unfolded chain created by tinker's protein program";

/// Line prefix of the engine's coordinate-check warning.
const CHKXYZ_WARNING: &str = " CHKXYZ";

/// Energy mode of the analysis program.
const ANALYZE_ENERGY_MODE: &str = "E";

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// Parameters of one reconstruction call.
#[derive(Clone)]
pub struct ReconstructRequest {
    pub out_dir: PathBuf,
    pub base_name: String,
    pub models: usize,
    /// Fan out to the batch scheduler instead of one local process.
    pub parallel: bool,
    /// Delete generated files once they are no longer needed.
    pub cleanup: bool,
    pub progress: Arc<dyn ProgressSink>,
}

impl ReconstructRequest {
    pub fn new(out_dir: impl Into<PathBuf>, base_name: impl Into<String>, models: usize) -> Self {
        Self {
            out_dir: out_dir.into(),
            base_name: base_name.into(),
            models,
            parallel: false,
            cleanup: false,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }
}

/// Outcome of a successful reconstruction.
#[derive(Debug)]
pub struct ReconstructionResult {
    out_dir: PathBuf,
    base_name: String,
    statistics: Vec<ModelStatistics>,
    best_model: usize,
    // generated files, deleted on drop when cleanup was requested
    _scratch: ScratchFiles,
}

impl ReconstructionResult {
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn model_count(&self) -> usize {
        self.statistics.len()
    }

    pub fn statistics(&self) -> &[ModelStatistics] {
        &self.statistics
    }

    /// Model with the fewest bound violations.
    pub fn best_model(&self) -> usize {
        self.best_model
    }

    pub fn best_pdb_file(&self) -> PathBuf {
        context::model_pdb(&self.out_dir, &self.base_name, self.best_model)
    }

    pub fn model_statistics(&self, model: usize) -> ReconResult<&ModelStatistics> {
        self.check_model(model)?;
        Ok(&self.statistics[model - 1])
    }

    /// `<base>.NNN.pdb` of model `model` (1-based).
    pub fn out_pdb_file(&self, model: usize) -> ReconResult<PathBuf> {
        self.check_model(model)?;
        Ok(context::model_pdb(&self.out_dir, &self.base_name, model))
    }

    /// PDB files of all models, in model order.
    pub fn model_files(&self) -> Vec<PathBuf> {
        (1..=self.model_count())
            .map(|m| context::model_pdb(&self.out_dir, &self.base_name, m))
            .collect()
    }

    pub fn bound_violations(&self, model: usize) -> ReconResult<u32> {
        Ok(self.model_statistics(model)?.bound_violations())
    }

    fn check_model(&self, model: usize) -> ReconResult<()> {
        if model == 0 || model > self.model_count() {
            return Err(ReconError::ModelOutOfRange {
                model,
                count: self.model_count(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconstructor
// ---------------------------------------------------------------------------

fn at(stage: Stage) -> impl FnOnce(StageError) -> ReconError {
    move |source| ReconError::Stage { stage, source }
}

fn tool(operation: &'static str) -> impl FnOnce(StageError) -> ReconError {
    move |source| ReconError::Tool { operation, source }
}

/// Drives the engine through the reconstruction stages.
///
/// One instance runs one reconstruction at a time (`&mut self`); the last
/// successful result is kept until the next call starts.
pub struct Reconstructor {
    engine: EngineConfig,
    cluster: ClusterConfig,
    batch: Option<Arc<dyn BatchSystem>>,
    compiler: Arc<dyn RestraintCompiler>,
    interrupt: InterruptHandle,
    last: Option<ReconstructionResult>,
}

impl Reconstructor {
    /// Checks the engine installation and the cluster parameters.
    pub fn new(engine: EngineConfig, cluster: ClusterConfig) -> ReconResult<Self> {
        engine.preflight()?;
        cluster.validate()?;
        Ok(Self {
            engine,
            cluster,
            batch: None,
            compiler: Arc::new(KeyFileCompiler),
            interrupt: InterruptHandle::new(),
            last: None,
        })
    }

    pub fn with_batch_system(mut self, system: Arc<dyn BatchSystem>) -> Self {
        self.batch = Some(system);
        self
    }

    pub fn with_restraint_compiler(mut self, compiler: Arc<dyn RestraintCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Handle that can stop an in-flight cluster run from elsewhere.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Terminate the remote jobs of the in-flight cluster run.
    pub fn stop(&self) {
        self.interrupt.interrupt();
    }

    pub fn last_result(&self) -> ReconResult<&ReconstructionResult> {
        self.last.as_ref().ok_or(ReconError::NoResult)
    }

    /// Run all stages and keep the result as the last result.
    pub async fn reconstruct(
        &mut self,
        restraints: &RestraintSpec,
        request: &ReconstructRequest,
    ) -> ReconResult<&ReconstructionResult> {
        // releases the previous run's files before new ones are generated
        self.last = None;
        self.interrupt.reset();

        let models = request.models;
        if models == 0 {
            return Err(ReconError::InvalidRequest(
                "at least one model is required".to_string(),
            ));
        }
        if request.parallel && self.batch.is_none() {
            return Err(ReconError::InvalidRequest(
                "parallel run requested without a batch system".to_string(),
            ));
        }
        restraints
            .validate()
            .map_err(|e| ReconError::InvalidRequest(e.to_string()))?;

        let mut ctx = PipelineContext::new(
            &request.out_dir,
            request.base_name.clone(),
            request.cleanup,
            Arc::clone(&request.progress),
        )
        .map_err(|e| {
            ReconError::InvalidRequest(format!(
                "output directory {}: {}",
                request.out_dir.display(),
                e
            ))
        })?;

        info!(
            base = %request.base_name,
            models,
            parallel = request.parallel,
            cleanup = request.cleanup,
            "Starting reconstruction"
        );

        ctx.notify(ProgressEvent::Stage(Stage::Protein));
        self.build_chain(&mut ctx, restraints)
            .await
            .map_err(at(Stage::Protein))?;

        ctx.notify(ProgressEvent::Stage(Stage::Constraints));
        let key = ctx.file("key");
        ctx.track(&key);
        self.compiler
            .compile(restraints, &self.engine.forcefield, &key)
            .map_err(|e| at(Stage::Constraints)(e.into()))?;

        ctx.notify(ProgressEvent::Stage(Stage::Structures));
        let statistics = match (&self.batch, request.parallel) {
            (Some(system), true) => ClusterJobCoordinator::new(
                system.as_ref(),
                &self.engine,
                &self.cluster,
                self.interrupt.clone(),
            )
            .run(&mut ctx, models)
            .await
            .map_err(StageError::from),
            _ => SerialJobRunner::new(&self.engine).run(&mut ctx, models).await,
        }
        .map_err(at(Stage::Structures))?;

        ctx.notify(ProgressEvent::Stage(Stage::Selection));
        for model in 1..=models {
            let coords = ctx.model_file(model);
            let pdb = ctx.model_pdb(model);
            xyz_to_pdb(&self.engine, &mut ctx, &coords, &pdb)
                .await
                .map_err(at(Stage::Selection))?;
            ctx.track(pdb);
        }
        let best_model = pick_best(&statistics).ok_or(ReconError::NoResult)?;

        info!(
            base = %request.base_name,
            best_model,
            violations = statistics[best_model - 1].bound_violations(),
            "Reconstruction finished"
        );
        let result = ReconstructionResult {
            out_dir: ctx.out_dir().to_path_buf(),
            base_name: ctx.base().to_string(),
            statistics,
            best_model,
            _scratch: ctx.into_scratch(),
        };
        Ok(self.last.insert(result))
    }

    /// PROTEIN: unfolded chain as `<base>.xyz`, `<base>.seq` and `<base>.pdb`.
    async fn build_chain(
        &self,
        ctx: &mut PipelineContext,
        restraints: &RestraintSpec,
    ) -> StageResult<()> {
        let base = ctx.base().to_string();
        let predicted: Vec<(PathBuf, PathBuf)> = ["xyz", "seq", "int"]
            .into_iter()
            .map(|ext| {
                (
                    predict_output(ctx.out_dir(), &format!("{}.{}", base, ext)),
                    ctx.file(ext),
                )
            })
            .collect();
        for (produced, canonical) in &predicted {
            ctx.track(produced);
            ctx.track(canonical);
        }

        let invocation = Invocation::new(self.engine.program(EngineProgram::Protein), ctx.out_dir())
            .stdin(chain_builder_input(&base, &self.engine.forcefield, restraints));
        ctx.invoker().run(&invocation).await?;

        let (xyz_out, xyz) = &predicted[0];
        self.await_output(xyz_out).await?;
        for (produced, canonical) in &predicted {
            if produced != canonical && produced.exists() {
                std::fs::rename(produced, canonical).map_err(|e| StageError::io(produced, e))?;
            }
        }

        let pdb = ctx.file("pdb");
        xyz_to_pdb(&self.engine, ctx, xyz, &pdb).await?;
        ctx.track(pdb);
        Ok(())
    }

    async fn await_output(&self, path: &Path) -> StageResult<()> {
        let delay = Duration::from_millis(self.engine.probe_delay_ms);
        match wait_for_file(path, self.engine.probe_retries, delay).await {
            Some(_) => Ok(()),
            None => Err(StageError::MissingOutput {
                path: path.to_path_buf(),
                attempts: self.engine.probe_retries,
            }),
        }
    }

    /// Minimize a PDB structure, writing `<name>.min.pdb` next to it.
    /// Returns the final energy.
    pub async fn minimize(&self, pdb: &Path, rms_gradient: f64) -> ReconResult<f64> {
        let mut ctx = tool_context(pdb)?;
        let xyz = pdb_to_xyz(&self.engine, &mut ctx, pdb)
            .await
            .map_err(tool("minimize"))?;

        let energy = self
            .run_minimize(&ctx, &xyz, rms_gradient)
            .await
            .map_err(tool("minimize"))?;

        let min_pdb = ctx.file("min.pdb");
        xyz_to_pdb(&self.engine, &mut ctx, &xyz, &min_pdb)
            .await
            .map_err(tool("minimize"))?;
        info!(pdb = %min_pdb.display(), energy, "Minimization finished");
        Ok(energy)
    }

    async fn run_minimize(
        &self,
        ctx: &PipelineContext,
        xyz: &Path,
        rms_gradient: f64,
    ) -> StageResult<f64> {
        // the minimized structure comes out under the next free xyz name
        let produced = predict_output(ctx.out_dir(), &format!("{}.xyz", ctx.base()));
        let invocation = Invocation::new(self.engine.program(EngineProgram::Minimize), ctx.out_dir())
            .path_arg(xyz)
            .path_arg(&self.engine.forcefield)
            .arg(rms_gradient.to_string());
        let output = ctx.invoker().run(&invocation).await?;

        if let Some(line) = output.line_starting_with(CHKXYZ_WARNING) {
            return Err(StageError::InputWarning {
                program: invocation.program_name(),
                line: line.trim().to_string(),
            });
        }
        let energy = find_value(&output.lines, "Final Function Value")?;

        self.await_output(&produced).await?;
        std::fs::rename(&produced, xyz).map_err(|e| StageError::io(&produced, e))?;
        Ok(energy)
    }

    /// Potential energy of a PDB structure.
    pub async fn compute_energy(&self, pdb: &Path) -> ReconResult<f64> {
        let mut ctx = tool_context(pdb)?;
        let xyz = pdb_to_xyz(&self.engine, &mut ctx, pdb)
            .await
            .map_err(tool("energy evaluation"))?;

        let invocation = Invocation::new(self.engine.program(EngineProgram::Analyze), ctx.out_dir())
            .path_arg(&xyz)
            .path_arg(&self.engine.forcefield)
            .arg(ANALYZE_ENERGY_MODE);
        let output = ctx
            .invoker()
            .run(&invocation)
            .await
            .map_err(|e| tool("energy evaluation")(e.into()))?;
        let energy = find_value(&output.lines, "Total Potential Energy")
            .map_err(|e| tool("energy evaluation")(e.into()))?;
        debug!(pdb = %pdb.display(), energy, "Energy computed");
        Ok(energy)
    }
}

/// Stdin of the chain builder.
pub fn chain_builder_input(base: &str, forcefield: &Path, restraints: &RestraintSpec) -> String {
    let mut lines = vec![
        base.to_string(),
        CHAIN_TITLE.to_string(),
        forcefield.to_string_lossy().to_string(),
    ];
    lines.extend(restraints.chain_residues());
    // blank line ends the sequence, then "not cyclic"
    lines.push(String::new());
    lines.push("N".to_string());
    let mut input = lines.join("\n");
    input.push('\n');
    input
}

/// Context for the single-structure tools; temporaries are always removed.
fn tool_context(pdb: &Path) -> ReconResult<PipelineContext> {
    if !pdb.is_file() {
        return Err(ReconError::InvalidRequest(format!(
            "{} is not a file",
            pdb.display()
        )));
    }
    let dir = match pdb.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = file_stem(pdb);
    let log = RunLog::append_to(dir.join(format!("{}.tools.log", base)));
    PipelineContext::with_run_log(&dir, base, true, Arc::new(NoProgress), log)
        .map_err(|e| ReconError::InvalidRequest(format!("{}: {}", dir.display(), e)))
}

/// Convert a PDB file to `<stem>.xyz` (plus `<stem>.seq`), both temporary.
async fn pdb_to_xyz(
    engine: &EngineConfig,
    ctx: &mut PipelineContext,
    pdb: &Path,
) -> StageResult<PathBuf> {
    let stem = file_stem(pdb);
    let xyz = ctx.out_dir().join(format!("{}.xyz", stem));
    let seq = ctx.out_dir().join(format!("{}.seq", stem));
    let xyz_out = predict_output(ctx.out_dir(), &format!("{}.xyz", stem));
    let seq_out = predict_output(ctx.out_dir(), &format!("{}.seq", stem));
    for path in [&xyz, &seq, &xyz_out, &seq_out] {
        ctx.track(path);
    }

    let invocation = Invocation::new(engine.program(EngineProgram::Pdbxyz), ctx.out_dir())
        .path_arg(pdb)
        .path_arg(&engine.forcefield);
    ctx.invoker().run(&invocation).await?;

    let delay = Duration::from_millis(engine.probe_delay_ms);
    if wait_for_file(&xyz_out, engine.probe_retries, delay)
        .await
        .is_none()
    {
        return Err(StageError::MissingOutput {
            path: xyz_out,
            attempts: engine.probe_retries,
        });
    }
    for (produced, canonical) in [(&xyz_out, &xyz), (&seq_out, &seq)] {
        if produced != canonical && produced.exists() {
            std::fs::rename(produced, canonical).map_err(|e| StageError::io(produced, e))?;
        }
    }
    Ok(xyz)
}

/// Convert coordinates to PDB.
///
/// The engine reads `<stem>.seq` next to the coordinates and writes the next
/// free `<stem>.pdb` name, which is then moved to `pdb`.
async fn xyz_to_pdb(
    engine: &EngineConfig,
    ctx: &mut PipelineContext,
    coords: &Path,
    pdb: &Path,
) -> StageResult<()> {
    let dir = coords
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.out_dir().to_path_buf());
    let stem = file_stem(coords);
    for required in [coords.to_path_buf(), dir.join(format!("{}.seq", stem))] {
        if !required.is_file() {
            return Err(StageError::MissingOutput {
                path: required,
                attempts: 1,
            });
        }
    }

    let produced = predict_output(&dir, &format!("{}.pdb", stem));
    ctx.track(&produced);

    let invocation = Invocation::new(engine.program(EngineProgram::Xyzpdb), &dir)
        .path_arg(coords)
        .path_arg(&engine.forcefield);
    ctx.invoker().run(&invocation).await?;

    let delay = Duration::from_millis(engine.probe_delay_ms);
    if wait_for_file(&produced, engine.probe_retries, delay)
        .await
        .is_none()
    {
        return Err(StageError::MissingOutput {
            path: produced,
            attempts: engine.probe_retries,
        });
    }
    if produced != pdb {
        std::fs::rename(&produced, pdb).map_err(|e| StageError::io(&produced, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builder_input() {
        let spec = RestraintSpec::new("GCA");
        let input = chain_builder_input("1abc", Path::new("/ff/amber99.prm"), &spec);
        assert_eq!(
            input,
            "1abc\n\
             Unfolded chain created by tinker's protein program\n\
             /ff/amber99.prm\n\
             G\nCYS\nA\n\nN\n"
        );
    }

    #[test]
    fn test_result_accessors() {
        let stats = |model, upper| ModelStatistics {
            model,
            num_upper_bound_violations: upper,
            ..ModelStatistics::default()
        };
        let result = ReconstructionResult {
            out_dir: PathBuf::from("/work"),
            base_name: "m".to_string(),
            statistics: vec![stats(1, 4), stats(2, 1)],
            best_model: 2,
            _scratch: ScratchFiles::new(false),
        };

        assert_eq!(result.model_count(), 2);
        assert_eq!(result.out_pdb_file(1).unwrap(), PathBuf::from("/work/m.001.pdb"));
        assert_eq!(result.best_pdb_file(), PathBuf::from("/work/m.002.pdb"));
        assert_eq!(result.bound_violations(1).unwrap(), 4);
        assert_eq!(result.model_files().len(), 2);
        assert!(matches!(
            result.out_pdb_file(3),
            Err(ReconError::ModelOutOfRange { model: 3, count: 2 })
        ));
        assert!(result.bound_violations(0).is_err());
    }

    #[test]
    fn test_new_requires_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineConfig {
            bin_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            Reconstructor::new(engine, ClusterConfig::default()),
            Err(ReconError::Config(_))
        ));
    }

    #[test]
    fn test_last_result_before_any_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("distgeom"), "").unwrap();
        let engine = EngineConfig {
            bin_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let recon = Reconstructor::new(engine, ClusterConfig::default()).unwrap();
        assert!(matches!(recon.last_result(), Err(ReconError::NoResult)));
    }
}
