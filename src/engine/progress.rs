//! Step-line parsing and time-remaining estimation.

use crate::model::{ProgressEstimate, ProgressSample, RUNNING_BASE_PERCENT, RUNNING_SPAN_PERCENT};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const UNKNOWN_ETA: &str = "unknown";

/// A job output line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    StepCompleted(u64),
    Unrecognized(String),
}

/// Classify `line`: exactly `<marker> <base-10 index>`, surrounding
/// whitespace allowed, anything else is unrecognized.
pub fn tokenize(marker: &str, line: &str) -> OutputEvent {
    let mut tokens = line.split_whitespace();
    let step = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(word), Some(index), None) if word == marker => parse_index(index),
        _ => None,
    };
    match step {
        Some(step) => OutputEvent::StepCompleted(step),
        None => OutputEvent::Unrecognized(line.to_string()),
    }
}

fn parse_index(token: &str) -> Option<u64> {
    if token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

/// Rolling per-step timing over the last `window` observed steps.
#[derive(Debug)]
pub struct ProgressEstimator {
    marker: String,
    window: usize,
    durations: VecDeque<Duration>,
    /// Highest-index sample seen so far; regressions never replace it.
    last: Option<ProgressSample>,
}

impl ProgressEstimator {
    pub fn new(marker: impl Into<String>, window: usize) -> Self {
        Self {
            marker: marker.into(),
            window: window.max(1),
            durations: VecDeque::new(),
            last: None,
        }
    }

    pub fn tokenize(&self, line: &str) -> OutputEvent {
        tokenize(&self.marker, line)
    }

    /// Parse `line`, stamping a sample with the current instant.
    pub fn observe(&self, line: &str) -> Option<ProgressSample> {
        self.observe_at(line, Instant::now())
    }

    pub fn observe_at(&self, line: &str, timestamp: Instant) -> Option<ProgressSample> {
        match self.tokenize(line) {
            OutputEvent::StepCompleted(step_index) => Some(ProgressSample {
                step_index,
                timestamp,
            }),
            OutputEvent::Unrecognized(_) => None,
        }
    }

    /// Fold `sample` into the history and recompute the estimate.
    ///
    /// Percent runs from 30 at step 0 to 90 at the last frame; the first 30%
    /// belongs to configuration and build, the final 10% to wrap-up. Those
    /// weights are a convention shared with [`crate::model::RunState::baseline_percent`].
    pub fn estimate(&mut self, sample: ProgressSample, total_frames: u32) -> ProgressEstimate {
        match self.last {
            None => self.last = Some(sample),
            Some(prev) if sample.step_index > prev.step_index => {
                let elapsed = sample.timestamp.saturating_duration_since(prev.timestamp);
                let steps = (sample.step_index - prev.step_index) as f64;
                self.record(elapsed.div_f64(steps));
                self.last = Some(sample);
            }
            Some(prev) => {
                tracing::debug!(
                    step = sample.step_index,
                    latest = prev.step_index,
                    "duplicate or out-of-order step ignored"
                );
            }
        }

        let step = self.last.map(|s| s.step_index).unwrap_or(0);
        let total = u64::from(total_frames);
        let percent_complete = if total == 0 {
            RUNNING_BASE_PERCENT + RUNNING_SPAN_PERCENT
        } else {
            RUNNING_BASE_PERCENT + (step.min(total) as f64 / total as f64) * RUNNING_SPAN_PERCENT
        };

        let eta_text = match self.mean_step_duration() {
            Some(mean) => format_eta(mean.mul_f64(total.saturating_sub(step) as f64)),
            None => UNKNOWN_ETA.to_string(),
        };

        ProgressEstimate {
            percent_complete,
            eta_text,
        }
    }

    fn record(&mut self, d: Duration) {
        if self.durations.len() == self.window {
            self.durations.pop_front();
        }
        self.durations.push_back(d);
    }

    pub fn mean_step_duration(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some(total / self.durations.len() as u32)
    }

    pub fn history_len(&self) -> usize {
        self.durations.len()
    }

    pub fn latest_step(&self) -> Option<u64> {
        self.last.map(|s| s.step_index)
    }
}

/// `"42s remaining"`, `"3m 7s remaining"` or `"2h 15m remaining"`.
pub fn format_eta(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    if secs < 60 {
        format!("{secs}s remaining")
    } else if secs < 3600 {
        format!("{}m {}s remaining", secs / 60, secs % 60)
    } else {
        format!("{}h {}m remaining", secs / 3600, (secs % 3600) / 60)
    }
}
