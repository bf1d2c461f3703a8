use crate::engine::inject;
use crate::model::{ArtifactLayout, RunConfig, RunEvent, RunId, RunParameters, RunState};
use crate::orchestrator::{self, CancelOutcome, RunController, RunRecorder};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Upper bound for `--eta-window`.
pub const MAX_ETA_WINDOW: u64 = 4096;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sim-supervisor",
    version,
    about = "Rebuild and run a simulation job with live progress and frame previews"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Number of bodies to simulate
    #[arg(long, default_value_t = 100_000)]
    pub bodies: u64,

    /// Number of frames the job should generate
    #[arg(long, default_value_t = 100)]
    pub frames: u32,

    /// Image width in pixels
    #[arg(long, default_value_t = 2048)]
    pub width: u32,

    /// Image height in pixels
    #[arg(long, default_value_t = 2048)]
    pub height: u32,

    /// Project root
    #[arg(long, default_value = ".")]
    pub project_dir: PathBuf,

    /// Constants header rewritten before each build [default: <project>/src/Constants.h]
    #[arg(long)]
    pub constants: Option<PathBuf>,

    /// Build directory [default: <project>/build]
    #[arg(long)]
    pub build_dir: Option<PathBuf>,

    /// Build command, run inside the build directory
    #[arg(long, default_value = "cmake --build .")]
    pub build_command: String,

    /// Job executable, relative to the build directory unless absolute
    #[arg(long, default_value = "./gpu_nbody")]
    pub executable: PathBuf,

    /// Frame output directory, relative to the build directory
    #[arg(long, default_value = "images")]
    pub artifact_dir: PathBuf,

    /// File name prefix of frame images
    #[arg(long, default_value = "Step")]
    pub artifact_prefix: String,

    /// Zero-padded width of the frame index in file names
    #[arg(long, default_value_t = 5)]
    pub artifact_width: usize,

    /// Frame image extension
    #[arg(long, default_value = "ppm")]
    pub artifact_extension: String,

    /// Word that opens a step-completion line in the job's output
    #[arg(long, default_value = "Step")]
    pub marker: String,

    /// Number of recent steps averaged for the time estimate
    #[arg(
        long,
        default_value_t = 32,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..=MAX_ETA_WINDOW)
    )]
    pub eta_window: usize,

    /// Report a still-running job this long after a stop request
    #[arg(long, default_value = "3s")]
    pub cancel_notice_after: humantime::Duration,

    /// Stop the run automatically after this long
    #[arg(long)]
    pub cancel_after: Option<humantime::Duration>,

    /// Print events and the final summary as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Hide the job's raw output in text mode
    #[arg(long)]
    pub quiet: bool,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show the recognized declarations in the constants header
    ShowConfig,
}

pub async fn run(args: Cli) -> Result<()> {
    match args.command {
        Some(Command::ShowConfig) => show_config(&args),
        None => run_supervised(args).await,
    }
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    let mut cfg = RunConfig::for_project(&args.project_dir);
    if let Some(constants) = args.constants.as_ref() {
        cfg.constants_path = args.project_dir.join(constants);
    }
    if let Some(build_dir) = args.build_dir.as_ref() {
        cfg.build_dir = args.project_dir.join(build_dir);
    }
    cfg.build_command = args
        .build_command
        .split_whitespace()
        .map(str::to_owned)
        .collect();
    cfg.executable = args.executable.clone();
    cfg.artifacts = ArtifactLayout {
        dir: args.artifact_dir.clone(),
        prefix: args.artifact_prefix.clone(),
        width: args.artifact_width,
        extension: args.artifact_extension.clone(),
    };
    cfg.marker = args.marker.clone();
    cfg.eta_window = args.eta_window;
    cfg.cancel_notice_after = Duration::from(args.cancel_notice_after);
    cfg
}

pub fn build_params(args: &Cli) -> RunParameters {
    RunParameters {
        body_count: args.bodies,
        frame_count: args.frames,
        image_width: args.width,
        image_height: args.height,
    }
}

fn show_config(args: &Cli) -> Result<()> {
    let cfg = build_config(args);
    let decls = inject::read_declarations_at(&cfg.constants_path)
        .with_context(|| format!("failed to read {}", cfg.constants_path.display()))?;
    if args.json {
        let map: serde_json::Map<String, serde_json::Value> = decls
            .iter()
            .map(|d| (d.name.to_string(), serde_json::Value::String(d.value.clone())))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for d in decls {
            println!("{:<12} {:<12} (line {})", d.name, d.value, d.line);
        }
    }
    Ok(())
}

/// Render one event as text-mode lines.
fn render_event(ev: &RunEvent, quiet: bool) -> Vec<String> {
    match ev {
        RunEvent::StatusChanged {
            message, percent, ..
        } => match percent {
            Some(p) => vec![format!("== [{p:>3.0}%] {message} ==")],
            None => vec![format!("== {message} ==")],
        },
        RunEvent::ProgressUpdated {
            step_index,
            total_frames,
            estimate,
            ..
        } => vec![format!(
            "Generating frame {step_index}/{total_frames} [{:>3.0}%] {}",
            estimate.percent_complete, estimate.eta_text
        )],
        RunEvent::PreviewAvailable { artifact, .. } => {
            vec![format!("Latest frame: {}", artifact.path.display())]
        }
        RunEvent::JobOutput { line, .. } => {
            if quiet {
                Vec::new()
            } else {
                vec![format!("  | {line}")]
            }
        }
        RunEvent::Error {
            message,
            diagnostics,
            ..
        } => {
            let mut out = vec![format!("Error: {message}")];
            if let Some(d) = diagnostics {
                out.extend(d.lines().map(|l| format!("  ! {l}")));
            }
            out
        }
        RunEvent::Info { info, .. } => vec![info.to_message()],
    }
}

/// React to the `press`-th interrupt. Returns a notice for the user, if any.
fn handle_interrupt(controller: &RunController, run_id: RunId, press: u32) -> Option<&'static str> {
    if press <= 1 {
        match controller.cancel_run(run_id) {
            CancelOutcome::NotActive => None,
            _ => Some("Stopping… press Ctrl-C again to kill the simulation"),
        }
    } else if controller.force_stop(run_id) {
        Some("Killing simulation…")
    } else {
        None
    }
}

async fn run_supervised(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let params = build_params(&args);
    let (out_tx, out_handle) = spawn_output_writer();

    let (controller, mut events) = RunController::new(cfg);
    let controller = Arc::new(controller);
    let run_id = controller
        .start_run(params)
        .context("failed to start run")?;

    // First Ctrl-C stops the job cleanly, later ones kill it.
    let ctrl = controller.clone();
    let signal_tx = out_tx.clone();
    let signal_task = tokio::spawn(async move {
        let mut presses = 0u32;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            if let Some(msg) = handle_interrupt(&ctrl, run_id, presses) {
                let _ = signal_tx.send(OutputLine::Stderr(msg.into()));
            }
        }
    });
    let timer_task = args.cancel_after.map(|after| {
        let ctrl = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from(after)).await;
            ctrl.cancel_run(run_id);
        })
    });

    let mut recorder = RunRecorder::new(run_id, params);
    while let Some(ev) = events.recv().await {
        recorder.observe(&ev);
        if args.json {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&ev)?));
        } else {
            for line in render_event(&ev, args.quiet) {
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
        }
        if ev.terminal_state().is_some() {
            break;
        }
    }

    controller.join().await;
    signal_task.abort();
    let _ = signal_task.await;
    if let Some(t) = timer_task {
        t.abort();
    }

    let processed = orchestrator::process_run_completion(args.export_json.as_deref(), &recorder);
    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&processed.summary)?));
    } else {
        for line in crate::text_summary::build_text_summary(&processed.summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    for msg in processed.export_messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }

    drop(out_tx);
    let _ = out_handle.await;

    match processed.summary.final_state {
        RunState::Failed => Err(anyhow::anyhow!(
            processed
                .summary
                .error
                .unwrap_or_else(|| "simulation run failed".into())
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArtifactReference, InfoEvent};

    #[test]
    fn defaults_match_project_layout() {
        let args = Cli::parse_from(["sim-supervisor", "--project-dir", "/proj"]);
        let cfg = build_config(&args);
        assert_eq!(cfg.constants_path, PathBuf::from("/proj/src/Constants.h"));
        assert_eq!(cfg.build_dir, PathBuf::from("/proj/build"));
        assert_eq!(cfg.build_command, vec!["cmake", "--build", "."]);
        assert_eq!(cfg.cancel_notice_after, Duration::from_secs(3));

        let p = build_params(&args);
        assert_eq!(p.body_count, 100_000);
        assert_eq!(p.frame_count, 100);
        assert_eq!((p.image_width, p.image_height), (2048, 2048));
    }

    #[test]
    fn overrides_are_applied() {
        let args = Cli::parse_from([
            "sim-supervisor",
            "--project-dir",
            "/p",
            "--build-dir",
            "out",
            "--build-command",
            "make -j4",
            "--frames",
            "10",
            "--artifact-width",
            "3",
            "--cancel-after",
            "1m",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.build_dir, PathBuf::from("/p/out"));
        assert_eq!(cfg.build_command, vec!["make", "-j4"]);
        assert_eq!(cfg.artifacts.width, 3);
        assert_eq!(build_params(&args).frame_count, 10);
        assert_eq!(
            args.cancel_after.map(Duration::from),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn eta_window_is_bounded() {
        let ok = Cli::try_parse_from(["sim-supervisor", "--eta-window", "4096"]).unwrap();
        assert_eq!(build_config(&ok).eta_window, 4096);
        for bad in ["0", "4097", "10000000000"] {
            assert!(
                Cli::try_parse_from(["sim-supervisor", "--eta-window", bad]).is_err(),
                "{bad}"
            );
        }
    }

    #[test]
    fn interrupts_without_an_active_run_are_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _rx) = RunController::new(RunConfig::for_project(dir.path()));
        assert_eq!(handle_interrupt(&controller, RunId(1), 1), None);
        assert_eq!(handle_interrupt(&controller, RunId(1), 2), None);
    }

    #[test]
    fn show_config_subcommand_parses() {
        let args = Cli::parse_from(["sim-supervisor", "--project-dir", "/p", "show-config"]);
        assert!(matches!(args.command, Some(Command::ShowConfig)));
    }

    #[test]
    fn renders_events_for_text_mode() {
        let id = RunId(1);
        let lines = render_event(
            &RunEvent::StatusChanged {
                run_id: id,
                state: RunState::Running,
                message: "Running simulation…".into(),
                percent: Some(30.0),
            },
            false,
        );
        assert_eq!(lines, vec!["== [ 30%] Running simulation… =="]);

        let lines = render_event(
            &RunEvent::PreviewAvailable {
                run_id: id,
                artifact: ArtifactReference {
                    step_index: 2,
                    path: PathBuf::from("images/Step00002.ppm"),
                },
            },
            false,
        );
        assert_eq!(lines, vec!["Latest frame: images/Step00002.ppm"]);

        let quiet = render_event(
            &RunEvent::JobOutput {
                run_id: id,
                stream: crate::model::OutputStream::Stdout,
                line: "Step 1".into(),
            },
            true,
        );
        assert!(quiet.is_empty());

        let info = render_event(
            &RunEvent::Info {
                run_id: id,
                info: InfoEvent::StillStopping,
            },
            false,
        );
        assert_eq!(info, vec!["Still stopping…"]);
    }

    #[test]
    fn build_errors_render_diagnostics() {
        let lines = render_event(
            &RunEvent::Error {
                run_id: RunId(1),
                kind: crate::model::ErrorKind::Build,
                message: "build failed (exit code Some(1))".into(),
                diagnostics: Some("a.cpp:1: syntax error\nnote: here".into()),
            },
            false,
        );
        assert_eq!(
            lines,
            vec![
                "Error: build failed (exit code Some(1))",
                "  ! a.cpp:1: syntax error",
                "  ! note: here",
            ]
        );
    }
}
