//! Run lifecycle controller.
//!
//! Owns start/cancel for the single active run and emits events for
//! presentation layers. All blocking work happens on the run's worker task;
//! callers only ever touch the controller from their own context.

use super::worker::Worker;
use crate::engine::ProcessTerminator;
use crate::error::RunStateError;
use crate::model::{InfoEvent, RunConfig, RunEvent, RunId, RunParameters, RunState};
use rand::RngCore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Snapshot of the active (or most recent) run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Option<RunId>,
    /// Present while the job process is alive.
    pub process: Option<ProcessTerminator>,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<Instant>,
    pub state: RunState,
}

impl RunHandle {
    fn idle() -> Self {
        Self {
            run_id: None,
            process: None,
            cancel_requested: false,
            cancel_requested_at: None,
            state: RunState::Idle,
        }
    }
}

/// What a cancel call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No run in a cancellable state (or a different run id).
    NotActive,
    /// Cancel was already requested for this run.
    AlreadyRequested,
    /// Marked, but no signal was needed: the build is still running (the
    /// job will not be launched) or the job has already exited.
    Deferred,
    /// Termination was sent to the running job.
    Terminating,
}

pub(crate) type Shared = Arc<Mutex<RunHandle>>;

pub(crate) fn lock(shared: &Mutex<RunHandle>) -> MutexGuard<'_, RunHandle> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generate a random run identifier.
fn gen_run_id() -> RunId {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    RunId(u64::from_le_bytes(b))
}

pub struct RunController {
    cfg: Arc<RunConfig>,
    shared: Shared,
    event_tx: UnboundedSender<RunEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RunController {
    /// Create a controller and the receiver its events are delivered on.
    pub fn new(cfg: RunConfig) -> (Self, UnboundedReceiver<RunEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = Self {
            cfg: Arc::new(cfg),
            shared: Arc::new(Mutex::new(RunHandle::idle())),
            event_tx,
            worker: Mutex::new(None),
        };
        (controller, event_rx)
    }

    pub fn state(&self) -> RunState {
        lock(&self.shared).state
    }

    pub fn handle(&self) -> RunHandle {
        lock(&self.shared).clone()
    }

    /// Validate `params` and start a run on a new worker task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_run(&self, params: RunParameters) -> Result<RunId, RunStateError> {
        params.validate()?;
        let run_id = gen_run_id();
        {
            let mut h = lock(&self.shared);
            if !h.state.accepts_start() {
                return Err(RunStateError::AlreadyRunning { state: h.state });
            }
            *h = RunHandle {
                run_id: Some(run_id),
                state: RunState::WritingConfig,
                ..RunHandle::idle()
            };
            let _ = self.event_tx.send(RunEvent::StatusChanged {
                run_id,
                state: RunState::WritingConfig,
                message: "Writing configuration…".into(),
                percent: RunState::WritingConfig.baseline_percent(),
            });
        }

        tracing::info!(%run_id, ?params, "run started");

        let worker = Worker::new(
            run_id,
            params,
            self.cfg.clone(),
            self.shared.clone(),
            self.event_tx.clone(),
        );
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            // A panicking worker must not leave the controller stuck mid-run.
            if let Err(e) = tokio::spawn(worker.run()).await {
                tracing::error!(%run_id, error = %e, "run worker aborted");
                super::worker::force_failed(&shared, &event_tx, run_id, format!("Run worker failed: {e}"));
            }
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(run_id)
    }

    /// Cancel the active run, whatever its id.
    pub fn cancel(&self) -> CancelOutcome {
        self.cancel_matching(None)
    }

    /// Cancel `run_id` if it is the active run; otherwise a no-op.
    pub fn cancel_run(&self, run_id: RunId) -> CancelOutcome {
        self.cancel_matching(Some(run_id))
    }

    fn cancel_matching(&self, run_id: Option<RunId>) -> CancelOutcome {
        let mut h = lock(&self.shared);
        let Some(active) = h.run_id else {
            return CancelOutcome::NotActive;
        };
        if run_id.is_some_and(|id| id != active) || !h.state.accepts_cancel() {
            return CancelOutcome::NotActive;
        }
        if h.cancel_requested {
            return CancelOutcome::AlreadyRequested;
        }

        h.cancel_requested = true;
        h.cancel_requested_at = Some(Instant::now());
        let during = h.state;
        let outcome = match (during, h.process.as_ref()) {
            (RunState::Running, Some(process)) if process.terminate() => CancelOutcome::Terminating,
            _ => CancelOutcome::Deferred,
        };
        // Sent under the lock so no progress event can follow it.
        let _ = self.event_tx.send(RunEvent::Info {
            run_id: active,
            info: InfoEvent::StopRequested { during },
        });
        tracing::info!(run_id = %active, state = ?during, ?outcome, "cancel requested");
        outcome
    }

    /// Escalate an already requested stop of `run_id` to a hard kill of the
    /// job. Returns `true` if a kill was requested by this call.
    pub fn force_stop(&self, run_id: RunId) -> bool {
        let h = lock(&self.shared);
        if h.run_id != Some(run_id) || !h.cancel_requested {
            return false;
        }
        match h.process.as_ref() {
            Some(process) => process.kill(),
            None => false,
        }
    }

    /// Wait for the current worker (if any) to finish.
    pub async fn join(&self) {
        let task = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "run supervisor task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RunParameters {
        RunParameters {
            body_count: 10,
            frame_count: 2,
            image_width: 8,
            image_height: 8,
        }
    }

    #[test]
    fn cancel_on_idle_controller_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = RunController::new(RunConfig::for_project(dir.path()));
        assert_eq!(controller.cancel(), CancelOutcome::NotActive);
        assert_eq!(controller.cancel_run(RunId(7)), CancelOutcome::NotActive);
        assert_eq!(controller.state(), RunState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn invalid_parameters_are_rejected_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _rx) = RunController::new(RunConfig::for_project(dir.path()));
        let bad = RunParameters {
            frame_count: 0,
            ..params()
        };
        assert_eq!(
            controller.start_run(bad),
            Err(RunStateError::InvalidParameter {
                name: "frame_count"
            })
        );
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_after_job_exit_sends_no_signal() {
        use crate::engine::supervisor;
        use std::path::Path;

        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = RunController::new(RunConfig::for_project(dir.path()));

        let (job, mut lines) =
            supervisor::start(Path::new("sh"), &["-c".into(), "exit 0".into()], dir.path()).unwrap();
        while lines.next_line().await.is_some() {}
        let terminator = job.terminator();
        job.wait().await.unwrap();

        let run_id = RunId(3);
        *lock(&controller.shared) = RunHandle {
            run_id: Some(run_id),
            process: Some(terminator.clone()),
            state: RunState::Running,
            ..RunHandle::idle()
        };

        assert_eq!(controller.cancel(), CancelOutcome::Deferred);
        assert_eq!(terminator.signals_sent(), 0);
        assert!(!controller.force_stop(run_id));
        assert!(matches!(
            rx.try_recv(),
            Ok(RunEvent::Info {
                info: InfoEvent::StopRequested {
                    during: RunState::Running
                },
                ..
            })
        ));
    }

    #[test]
    fn force_stop_needs_a_pending_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _rx) = RunController::new(RunConfig::for_project(dir.path()));
        assert!(!controller.force_stop(RunId(1)));
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let dir = tempfile::tempdir().unwrap();
        // No configuration document: the run fails quickly in WritingConfig.
        let (controller, _rx) = RunController::new(RunConfig::for_project(dir.path()));
        controller.start_run(params()).unwrap();
        // Current-thread runtime: the worker has not been polled yet.
        assert_eq!(
            controller.start_run(params()),
            Err(RunStateError::AlreadyRunning {
                state: RunState::WritingConfig
            })
        );
        controller.join().await;
        assert_eq!(controller.state(), RunState::Failed);
        // A terminal state accepts a new run.
        assert!(controller.start_run(params()).is_ok());
        controller.join().await;
    }
}
