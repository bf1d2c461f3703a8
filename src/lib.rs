//! Supervisor for a rebuild-and-run simulation job.
//!
//! A run rewrites the job's build-time constants, rebuilds it, launches the
//! executable and turns its step lines into progress, a time-remaining
//! estimate and frame previews. Runs can be cancelled at any point; the job
//! is always reaped.
//!
//! Nothing here has a timeout: a job that hangs without closing its output
//! keeps the run in `Running` until it is cancelled.

pub mod cli;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod telemetry;
pub mod text_summary;

pub use error::{BuildError, ConfigError, ProcessError, RunError, RunStateError};
pub use model::{
    ArtifactReference, ProgressEstimate, ProgressSample, RunConfig, RunEvent, RunId,
    RunParameters, RunState,
};
pub use orchestrator::{CancelOutcome, RunController, RunHandle};
