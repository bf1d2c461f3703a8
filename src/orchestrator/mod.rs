//! Application-level orchestration.
//!
//! This module owns run lifecycle control (start/cancel, the worker pipeline)
//! and post-run processing such as summaries and exports. UI/CLI layers call
//! into this module and only ever see [`RunEvent`](crate::model::RunEvent)s.

mod controller;
mod post_process;
mod worker;

pub use controller::{CancelOutcome, RunController, RunHandle};
pub use post_process::{process_run_completion, write_summary_json, ProcessedRun, RunRecorder};
