//! Text summary builder for CLI output.
//!
//! Formats a finished run as human-readable lines for text mode.

use crate::model::{RunState, RunSummary};

/// Pre-formatted lines for text output.
pub struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_secs(s: Option<f64>) -> String {
    s.map(|v| format!("{v:.2}s")).unwrap_or_else(|| "-".into())
}

/// Build a text summary from a run summary.
pub fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let mut lines = Vec::new();
    let p = &summary.params;

    lines.push(format!(
        "Run {}: {}",
        summary.run_id,
        summary.final_state.label()
    ));
    lines.push(format!(
        "Parameters: {} bodies, {} frames, {}x{} px",
        p.body_count, p.frame_count, p.image_width, p.image_height
    ));

    let last = summary
        .last_step
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".into());
    lines.push(format!(
        "Frames: {last}/{} ({} step events)",
        p.frame_count, summary.steps_observed
    ));

    if summary.step_seconds_mean.is_some() {
        lines.push(format!(
            "Step time: avg {} med {} p25 {} p75 {}",
            fmt_secs(summary.step_seconds_mean),
            fmt_secs(summary.step_seconds_median),
            fmt_secs(summary.step_seconds_p25),
            fmt_secs(summary.step_seconds_p75),
        ));
    }
    lines.push(format!("Elapsed: {:.1}s", summary.elapsed_secs));

    if let Some(preview) = summary.last_preview.as_deref() {
        lines.push(format!("Last frame: {}", preview.display()));
    }
    if let Some(err) = summary.error.as_deref() {
        lines.push(format!("Error: {err}"));
    }
    if summary.final_state == RunState::Cancelled {
        lines.push("Stopped by user before completion.".into());
    }

    TextSummary { lines }
}
