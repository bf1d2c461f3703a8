//! The per-run pipeline: inject, build, spawn, monitor, reap.

use super::controller::{lock, Shared};
use crate::engine::{
    inject, supervisor, ArtifactWatcher, BuildInvoker, ExitStatus, OutputLine, OutputLines,
    ProcessHandle, ProgressEstimator,
};
use crate::error::{ConfigError, RunError};
use crate::model::{
    ErrorKind, InfoEvent, OutputStream, RunConfig, RunEvent, RunId, RunParameters, RunState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// How a pipeline that did not hit a [`RunError`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
    JobFailed(ExitStatus),
}

/// Highest step already surfaced as a preview.
#[derive(Debug, Default)]
struct PreviewCursor {
    shown: Option<u64>,
}

impl PreviewCursor {
    fn is_new(&self, step: u64) -> bool {
        self.shown.map_or(true, |s| step > s)
    }
}

pub(crate) struct Worker {
    run_id: RunId,
    params: RunParameters,
    cfg: Arc<RunConfig>,
    shared: Shared,
    event_tx: UnboundedSender<RunEvent>,
}

impl Worker {
    pub(crate) fn new(
        run_id: RunId,
        params: RunParameters,
        cfg: Arc<RunConfig>,
        shared: Shared,
        event_tx: UnboundedSender<RunEvent>,
    ) -> Self {
        Self {
            run_id,
            params,
            cfg,
            shared,
            event_tx,
        }
    }

    pub(crate) async fn run(self) {
        match self.pipeline().await {
            Ok(Outcome::Completed) => {
                let dir = self.cfg.artifact_dir();
                self.advance(
                    RunState::Completed,
                    format!("Complete! Frames saved to {}", dir.display()),
                );
            }
            Ok(Outcome::Cancelled) => {
                self.advance(RunState::Cancelled, "Simulation stopped by user".into());
            }
            Ok(Outcome::JobFailed(status)) => {
                let message = match status {
                    ExitStatus::NormalExit(code) => format!("Simulation exited with code {code}"),
                    ExitStatus::TerminatedExternally { signal: Some(sig) } => {
                        format!("Simulation killed by signal {sig}")
                    }
                    _ => "Simulation terminated unexpectedly".to_string(),
                };
                self.send(RunEvent::Error {
                    run_id: self.run_id,
                    kind: ErrorKind::Process,
                    message,
                    diagnostics: None,
                });
                self.advance(RunState::Failed, "Simulation failed!".into());
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "run failed");
                let status = match e.kind() {
                    ErrorKind::Config => "Error writing configuration!",
                    ErrorKind::Build => "Compilation failed!",
                    ErrorKind::Process => "Failed to start simulation!",
                };
                self.send(RunEvent::Error {
                    run_id: self.run_id,
                    kind: e.kind(),
                    message: e.to_string(),
                    diagnostics: e.diagnostics().map(str::to_owned),
                });
                self.advance(RunState::Failed, status.into());
            }
        }
    }

    async fn pipeline(&self) -> Result<Outcome, RunError> {
        self.write_config().await?;

        self.advance(RunState::Building, "Compiling…".into());
        let report = BuildInvoker::new(self.cfg.build_command.clone(), &self.cfg.build_dir)
            .build()
            .await?;
        if !report.diagnostics.trim().is_empty() {
            tracing::debug!(diagnostics = %report.diagnostics, "build output");
        }
        self.send(RunEvent::Info {
            run_id: self.run_id,
            info: InfoEvent::BuildFinished {
                elapsed_ms: report.elapsed.as_millis() as u64,
            },
        });

        if lock(&self.shared).cancel_requested {
            return Ok(Outcome::Cancelled);
        }

        let (handle, lines) = supervisor::start(
            &self.cfg.executable_path(),
            &[self.params.frame_count.to_string()],
            &self.cfg.build_dir,
        )?;

        {
            let mut h = lock(&self.shared);
            let terminator = handle.terminator();
            h.process = Some(terminator.clone());
            self.advance_locked(&mut h.state, RunState::Running, "Running simulation…".into());
            self.send(RunEvent::Info {
                run_id: self.run_id,
                info: InfoEvent::JobSpawned {
                    pid: terminator.pid(),
                },
            });
            // Cancelled between the build check and here.
            if h.cancel_requested {
                terminator.terminate();
            }
        }

        self.monitor(handle, lines).await
    }

    async fn write_config(&self) -> Result<(), ConfigError> {
        let params = self.params;
        let path = self.cfg.constants_path.clone();
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || inject::inject(&params, &task_path))
            .await
            .unwrap_or_else(|e| {
                Err(ConfigError::Io {
                    path,
                    source: std::io::Error::other(e),
                })
            })
    }

    /// Drain job output until both pipes close, then reap the job.
    async fn monitor(
        &self,
        handle: ProcessHandle,
        mut lines: OutputLines,
    ) -> Result<Outcome, RunError> {
        let mut estimator = ProgressEstimator::new(&self.cfg.marker, self.cfg.eta_window);
        let watcher = ArtifactWatcher::new(self.cfg.artifact_dir(), self.cfg.artifacts.clone());
        let mut cursor = PreviewCursor::default();
        let mut notice_sent = false;
        let mut watchdog = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line else { break };
                    self.handle_line(line, &mut estimator, &watcher, &mut cursor);
                }
                // A job that ignores the stop request only gets a notice; there is no kill timeout.
                _ = watchdog.tick(), if !notice_sent => {
                    let requested_at = lock(&self.shared).cancel_requested_at;
                    if requested_at.is_some_and(|t| t.elapsed() >= self.cfg.cancel_notice_after) {
                        self.send(RunEvent::Info {
                            run_id: self.run_id,
                            info: InfoEvent::StillStopping,
                        });
                        notice_sent = true;
                    }
                }
            }
        }

        let status = handle.wait().await?;
        lock(&self.shared).process = None;

        match status {
            ExitStatus::NormalExit(0) => {
                // The last frame is written after its step line; look once more.
                if let Some(step) = estimator.latest_step() {
                    self.surface_preview(&watcher, &mut cursor, &[step]);
                }
                Ok(Outcome::Completed)
            }
            ExitStatus::TerminatedBySupervisor => Ok(Outcome::Cancelled),
            other => Ok(Outcome::JobFailed(other)),
        }
    }

    fn handle_line(
        &self,
        line: OutputLine,
        estimator: &mut ProgressEstimator,
        watcher: &ArtifactWatcher,
        cursor: &mut PreviewCursor,
    ) {
        let is_stdout = line.stream == OutputStream::Stdout;
        let sample = if is_stdout {
            estimator.observe(&line.text)
        } else {
            None
        };
        if is_stdout && sample.is_none() {
            tracing::debug!(line = %line.text, "unrecognized job output");
        }
        self.send(RunEvent::JobOutput {
            run_id: self.run_id,
            stream: line.stream,
            line: line.text,
        });

        let Some(sample) = sample else { return };
        let estimate = estimator.estimate(sample, self.params.frame_count);
        let step = estimator.latest_step().unwrap_or(sample.step_index);

        {
            let h = lock(&self.shared);
            if h.cancel_requested {
                return;
            }
            self.send(RunEvent::ProgressUpdated {
                run_id: self.run_id,
                step_index: step,
                total_frames: self.params.frame_count,
                estimate,
            });
        }

        // The announced frame may still be in flight; the previous one is complete.
        self.surface_preview(watcher, cursor, &[sample.step_index, sample.step_index.saturating_sub(1)]);
    }

    fn surface_preview(&self, watcher: &ArtifactWatcher, cursor: &mut PreviewCursor, steps: &[u64]) {
        let Some(artifact) = steps
            .iter()
            .filter(|s| cursor.is_new(**s))
            .find_map(|s| watcher.locate(*s))
        else {
            return;
        };

        let h = lock(&self.shared);
        if h.cancel_requested {
            return;
        }
        cursor.shown = Some(artifact.step_index);
        self.send(RunEvent::PreviewAvailable {
            run_id: self.run_id,
            artifact,
        });
    }

    fn advance(&self, next: RunState, message: String) {
        let mut h = lock(&self.shared);
        if self.advance_locked(&mut h.state, next, message) && next.is_terminal() {
            h.process = None;
        }
    }

    fn advance_locked(&self, state: &mut RunState, next: RunState, message: String) -> bool {
        if !state.can_advance_to(next) {
            tracing::warn!(run_id = %self.run_id, from = ?*state, to = ?next, "invalid state transition ignored");
            return false;
        }
        tracing::info!(run_id = %self.run_id, from = ?*state, to = ?next, "run state changed");
        *state = next;
        self.send(RunEvent::StatusChanged {
            run_id: self.run_id,
            state: next,
            message,
            percent: next.baseline_percent(),
        });
        true
    }

    fn send(&self, ev: RunEvent) {
        let _ = self.event_tx.send(ev);
    }
}

/// Move a run whose worker died to `Failed`, reporting `message` once.
pub(crate) fn force_failed(
    shared: &Shared,
    event_tx: &UnboundedSender<RunEvent>,
    run_id: RunId,
    message: String,
) {
    let mut h = lock(shared);
    if h.run_id != Some(run_id) || h.state.is_terminal() {
        return;
    }
    if let Some(process) = h.process.take() {
        process.terminate();
    }
    h.state = RunState::Failed;
    let _ = event_tx.send(RunEvent::Error {
        run_id,
        kind: ErrorKind::Process,
        message,
        diagnostics: None,
    });
    let _ = event_tx.send(RunEvent::StatusChanged {
        run_id,
        state: RunState::Failed,
        message: "Run aborted".into(),
        percent: None,
    });
}
