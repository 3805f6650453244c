//! Local embedding of all models in one engine process.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::context::PipelineContext;
use crate::error::{StageError, StageResult};
use crate::files::{predict_output, wait_for_file};
use crate::invoker::Invocation;
use crate::parser::{parse_statistics, ModelStatistics};
use crate::progress::ProgressEvent;
use crate::stage::EngineProgram;

/// Runs the embedding engine once for `N` models.
#[derive(Debug, Clone, Copy)]
pub struct SerialJobRunner<'a> {
    engine: &'a EngineConfig,
}

impl<'a> SerialJobRunner<'a> {
    pub fn new(engine: &'a EngineConfig) -> Self {
        Self { engine }
    }

    /// Embed `models` models from `<base>.xyz` / `<base>.key` and leave them
    /// as `<base>.001` .. `<base>.NNN`.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        models: usize,
    ) -> StageResult<Vec<ModelStatistics>> {
        let xyz = ctx.file("xyz");
        for required in [&xyz, &ctx.file("key")] {
            if !required.is_file() {
                return Err(StageError::MissingOutput {
                    path: required.clone(),
                    attempts: 1,
                });
            }
        }

        // the engine numbers its outputs <base>.001.. and never overwrites
        let predicted: Vec<_> = (1..=models)
            .map(|k| predict_output(ctx.out_dir(), &format!("{}.{:03}", ctx.base(), k)))
            .collect();
        for path in &predicted {
            ctx.track(path);
        }

        let invocation = Invocation::new(self.engine.program(EngineProgram::Distgeom), ctx.out_dir())
            .path_arg(&xyz)
            .arg(models.to_string())
            .args(self.engine.embed_flags());

        info!(models, "Embedding models locally");
        let output = ctx.invoker().run(&invocation).await?;
        let parsed = parse_statistics(&output.lines, models)?;

        let delay = Duration::from_millis(self.engine.probe_delay_ms);
        for (k, produced) in predicted.into_iter().enumerate() {
            let model = k + 1;
            if wait_for_file(&produced, self.engine.probe_retries, delay)
                .await
                .is_none()
            {
                return Err(StageError::MissingOutput {
                    path: produced,
                    attempts: self.engine.probe_retries,
                });
            }
            let target = ctx.model_file(model);
            if produced != target {
                debug!(from = %produced.display(), to = %target.display(), "Renaming model");
                std::fs::rename(&produced, &target).map_err(|e| StageError::io(&produced, e))?;
            }
            ctx.track(target);
        }

        ctx.notify(ProgressEvent::ModelsDone {
            done: models,
            total: models,
        });
        Ok(parsed.statistics)
    }
}
