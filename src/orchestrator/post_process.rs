//! Post-run processing utilities.
//!
//! Folds the event stream of one run into a summary, then handles exports.

use crate::metrics;
use crate::model::{RunEvent, RunId, RunParameters, RunState, RunSummary};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Collects what presentation layers need from a run's events.
#[derive(Debug)]
pub struct RunRecorder {
    run_id: RunId,
    params: RunParameters,
    started: Instant,
    step_points: Vec<(f64, u64)>,
    last_percent: Option<f64>,
    last_preview: Option<PathBuf>,
    final_state: Option<RunState>,
    error: Option<String>,
    job_output_lines: u64,
}

impl RunRecorder {
    pub fn new(run_id: RunId, params: RunParameters) -> Self {
        Self {
            run_id,
            params,
            started: Instant::now(),
            step_points: Vec::new(),
            last_percent: None,
            last_preview: None,
            final_state: None,
            error: None,
            job_output_lines: 0,
        }
    }

    pub fn observe(&mut self, ev: &RunEvent) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.observe_at(ev, elapsed);
    }

    /// Record `ev` as seen `elapsed` seconds into the run.
    pub fn observe_at(&mut self, ev: &RunEvent, elapsed: f64) {
        if ev.run_id() != self.run_id {
            return;
        }
        match ev {
            RunEvent::ProgressUpdated {
                step_index,
                estimate,
                ..
            } => {
                self.step_points.push((elapsed, *step_index));
                self.last_percent = Some(estimate.percent_complete);
            }
            RunEvent::PreviewAvailable { artifact, .. } => {
                self.last_preview = Some(artifact.path.clone());
            }
            RunEvent::JobOutput { .. } => self.job_output_lines += 1,
            RunEvent::Error { message, .. } => {
                if self.error.is_none() {
                    self.error = Some(message.clone());
                }
            }
            RunEvent::StatusChanged { state, percent, .. } => {
                if let Some(p) = percent {
                    self.last_percent = Some(*p);
                }
                if state.is_terminal() {
                    self.final_state = Some(*state);
                }
            }
            RunEvent::Info { .. } => {}
        }
    }

    pub fn summary(&self) -> RunSummary {
        let durations = metrics::step_durations(&self.step_points);
        let stats = metrics::compute_metrics(&durations);
        RunSummary {
            run_id: self.run_id,
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            params: self.params,
            final_state: self.final_state.unwrap_or(RunState::Idle),
            steps_observed: self.step_points.len() as u64,
            last_step: self.step_points.iter().map(|(_, s)| *s).max(),
            percent_complete: self.last_percent,
            step_seconds_mean: stats.map(|s| s.0),
            step_seconds_median: stats.map(|s| s.1),
            step_seconds_p25: stats.map(|s| s.2),
            step_seconds_p75: stats.map(|s| s.3),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            last_preview: self.last_preview.clone(),
            error: self.error.clone(),
            job_output_lines: self.job_output_lines,
        }
    }
}

/// Result of post-run processing, ready for presentation layers.
pub struct ProcessedRun {
    pub summary: RunSummary,
    pub export_messages: Vec<String>,
}

/// Process a finished run: summarize it and write the requested export.
pub fn process_run_completion(export_json: Option<&Path>, recorder: &RunRecorder) -> ProcessedRun {
    let summary = recorder.summary();

    let mut export_messages = Vec::new();
    if let Some(path) = export_json {
        match write_summary_json(path, &summary) {
            Ok(()) => export_messages.push(format!("Exported JSON: {}", path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedRun {
        summary,
        export_messages,
    }
}

pub fn write_summary_json(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
