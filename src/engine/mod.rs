//! Leaf components of a run: configuration injection, build, process
//! supervision, progress estimation and artifact lookup.

pub mod artifacts;
pub mod build;
pub mod inject;
pub mod progress;
pub mod supervisor;

pub use artifacts::ArtifactWatcher;
pub use build::{BuildInvoker, BuildReport};
pub use progress::{OutputEvent, ProgressEstimator};
pub use supervisor::{ExitStatus, OutputLine, OutputLines, ProcessHandle, ProcessTerminator};
