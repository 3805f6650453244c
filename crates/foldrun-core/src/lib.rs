//! foldrun-core: structure reconstruction orchestration
//!
//! Drives an external distance-geometry engine from a sequence and a
//! restraint set to a ranked set of 3-D models:
//! - `ProcessInvoker`: runs one engine program and classifies its outcome
//! - `parser`: extracts per-model violation statistics from engine output
//! - `Reconstructor`: protein -> constraints -> structures -> selection
//! - `SerialJobRunner`: all models in one local engine process
//! - `ClusterJobCoordinator`: over-provisioned fan-out to a batch scheduler
//! - `pick_best`: model with the fewest bound violations

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod interrupt;
pub mod invoker;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod restraints;
pub mod selection;
pub mod serial;
pub mod stage;
pub mod telemetry;

pub use cluster::{ClusterJobCoordinator, SessionGuard};
pub use config::{ClusterConfig, ConfigError, EngineConfig, FoldrunConfig, Refinement};
pub use context::PipelineContext;
pub use error::{
    ClusterError, ClusterResult, ParseError, ProcessError, ReconError, ReconResult, StageError,
    StageResult,
};
pub use interrupt::InterruptHandle;
pub use invoker::{Invocation, ProcessInvoker, ProcessOutput, TOOL_ERROR_MARKER};
pub use parser::{parse_statistics, ModelStatistics, ParsedRun};
pub use pipeline::{ReconstructRequest, ReconstructionResult, Reconstructor};
pub use progress::{LogProgress, NoProgress, ProgressEvent, ProgressSink};
pub use restraints::{KeyFileCompiler, RestraintCompiler, RestraintError, RestraintSpec};
pub use selection::pick_best;
pub use serial::SerialJobRunner;
pub use stage::{EngineProgram, Stage};
pub use telemetry::init_tracing;
