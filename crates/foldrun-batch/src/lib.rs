//! foldrun-batch: batch scheduler sessions for cluster fan-out
//!
//! This crate is the scheduler layer of foldrun. It defines the session
//! abstraction used by the cluster coordinator to submit single-model jobs,
//! poll their state and tear them down:
//! - `BatchSystem`: opens sessions against a scheduler
//! - `BatchSession`: submit / status / terminate / close
//! - `GridEngine`: driver for grid-engine style schedulers (`qsub`, `qstat`, `qacct`, `qdel`)
//!
//! In-memory scripted fakes for tests live in the `fakes` module.

pub mod error;
pub mod fakes;
pub mod session;
pub mod sge;

pub use error::{BatchError, BatchResult};
pub use session::{BatchSession, BatchSystem, JobId, JobState, JobTemplate};
pub use sge::{GridEngine, GridEngineSession};
