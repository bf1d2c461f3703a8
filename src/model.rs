use crate::error::RunStateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Everything the supervisor needs to know about the project it drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    /// Build-time configuration document rewritten before each build.
    pub constants_path: PathBuf,
    pub build_dir: PathBuf,
    /// Build tool program followed by its arguments, run inside `build_dir`.
    pub build_command: Vec<String>,
    /// Job executable, resolved relative to `build_dir` when not absolute.
    pub executable: PathBuf,
    pub artifacts: ArtifactLayout,
    /// Case-sensitive word that opens a step-completion line.
    pub marker: String,
    /// Number of recent step durations averaged for the ETA.
    pub eta_window: usize,
    #[serde(with = "humantime_serde")]
    pub cancel_notice_after: Duration,
}

impl RunConfig {
    /// Defaults matching the conventional `src/` + `build/` project layout.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            constants_path: project_dir.join("src").join("Constants.h"),
            build_dir: project_dir.join("build"),
            project_dir,
            build_command: vec!["cmake".into(), "--build".into(), ".".into()],
            executable: PathBuf::from("./gpu_nbody"),
            artifacts: ArtifactLayout::default(),
            marker: "Step".into(),
            eta_window: 32,
            cancel_notice_after: Duration::from_secs(3),
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.build_dir.join(&self.artifacts.dir)
    }

    pub fn executable_path(&self) -> PathBuf {
        if self.executable.is_absolute() {
            self.executable.clone()
        } else {
            self.build_dir.join(&self.executable)
        }
    }
}

/// Naming convention of the per-step artifacts the job writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    /// Directory relative to the build directory.
    pub dir: PathBuf,
    pub prefix: String,
    /// Zero-padded width of the step index.
    pub width: usize,
    pub extension: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("images"),
            prefix: "Step".into(),
            width: 5,
            extension: "ppm".into(),
        }
    }
}

/// User-facing knobs for one run. Immutable once the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    pub body_count: u64,
    pub frame_count: u32,
    pub image_width: u32,
    pub image_height: u32,
}

impl RunParameters {
    /// Reject any zero-valued field.
    pub fn validate(&self) -> Result<(), RunStateError> {
        let fields: [(&'static str, u64); 4] = [
            ("body_count", self.body_count),
            ("frame_count", u64::from(self.frame_count)),
            ("image_width", u64::from(self.image_width)),
            ("image_height", u64::from(self.image_height)),
        ];
        match fields.into_iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(RunStateError::InvalidParameter { name }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    WritingConfig,
    Building,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Terminal states end a run; a new run may start from any of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    /// Whether `start` is accepted in this state.
    pub fn accepts_start(self) -> bool {
        self == RunState::Idle || self.is_terminal()
    }

    /// Whether `cancel` has any effect in this state.
    pub fn accepts_cancel(self) -> bool {
        matches!(self, RunState::Building | RunState::Running)
    }

    /// Allowed forward transitions of the run state machine.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle | Completed | Failed | Cancelled, WritingConfig) => true,
            (WritingConfig, Building | Failed) => true,
            (Building, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    /// Progress budget reached on entering the state.
    ///
    /// Configuration and build own the first 30%, the job's frames the next
    /// 60%, and wrap-up the last 10%. This weighting is a fixed convention,
    /// not a measurement; keep it stable so progress bars stay comparable
    /// until measured phase durations replace it.
    pub fn baseline_percent(self) -> Option<f64> {
        match self {
            RunState::WritingConfig => Some(0.0),
            RunState::Building => Some(10.0),
            RunState::Running => Some(RUNNING_BASE_PERCENT),
            RunState::Completed => Some(100.0),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::WritingConfig => "writing configuration",
            RunState::Building => "building",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

/// Percent at which the job starts reporting frames.
pub const RUNNING_BASE_PERCENT: f64 = 30.0;
/// Share of the bar covered by the job's frames.
pub const RUNNING_SPAN_PERCENT: f64 = 60.0;

/// One parsed step line. Consumed immediately by the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub step_index: u64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEstimate {
    pub percent_complete: f64,
    pub eta_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub step_index: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    Build,
    Process,
}

/// Events delivered from the run worker to whoever owns the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    StatusChanged {
        run_id: RunId,
        state: RunState,
        message: String,
        percent: Option<f64>,
    },
    ProgressUpdated {
        run_id: RunId,
        step_index: u64,
        total_frames: u32,
        estimate: ProgressEstimate,
    },
    PreviewAvailable {
        run_id: RunId,
        artifact: ArtifactReference,
    },
    JobOutput {
        run_id: RunId,
        stream: OutputStream,
        line: String,
    },
    Error {
        run_id: RunId,
        kind: ErrorKind,
        message: String,
        diagnostics: Option<String>,
    },
    Info {
        run_id: RunId,
        info: InfoEvent,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::StatusChanged { run_id, .. }
            | RunEvent::ProgressUpdated { run_id, .. }
            | RunEvent::PreviewAvailable { run_id, .. }
            | RunEvent::JobOutput { run_id, .. }
            | RunEvent::Error { run_id, .. }
            | RunEvent::Info { run_id, .. } => *run_id,
        }
    }

    /// The state carried by a terminal `StatusChanged`, if this is one.
    pub fn terminal_state(&self) -> Option<RunState> {
        match self {
            RunEvent::StatusChanged { state, .. } if state.is_terminal() => Some(*state),
            _ => None,
        }
    }
}

/// Structured info events for UI/CLI layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoEvent {
    StopRequested { during: RunState },
    StillStopping,
    BuildFinished { elapsed_ms: u64 },
    JobSpawned { pid: Option<u32> },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::StopRequested { during } => match during {
                RunState::Building => "Stop requested; finishing build first…".to_string(),
                _ => "Stopping simulation…".to_string(),
            },
            InfoEvent::StillStopping => "Still stopping…".to_string(),
            InfoEvent::BuildFinished { elapsed_ms } => {
                format!("Build finished in {:.1}s", *elapsed_ms as f64 / 1000.0)
            }
            InfoEvent::JobSpawned { pid } => match pid {
                Some(pid) => format!("Simulation started (pid {pid})"),
                None => "Simulation started".to_string(),
            },
        }
    }
}

/// Post-run record, printed or exported once a run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    #[serde(default)]
    pub timestamp_utc: String,
    pub params: RunParameters,
    pub final_state: RunState,
    pub steps_observed: u64,
    pub last_step: Option<u64>,
    pub percent_complete: Option<f64>,
    pub step_seconds_mean: Option<f64>,
    pub step_seconds_median: Option<f64>,
    pub step_seconds_p25: Option<f64>,
    pub step_seconds_p75: Option<f64>,
    pub elapsed_secs: f64,
    #[serde(default)]
    pub last_preview: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    pub job_output_lines: u64,
}
