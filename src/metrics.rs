/// Compute metrics (mean, median, 25th percentile, 75th percentile) from samples
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Per-step durations from (seconds since start, step index) points.
///
/// Points that do not advance the step index are skipped; a jump of several
/// steps spreads its elapsed time evenly.
pub fn step_durations(points: &[(f64, u64)]) -> Vec<f64> {
    let mut out = Vec::with_capacity(points.len().saturating_sub(1));
    let mut prev: Option<(f64, u64)> = None;
    for &(t, step) in points {
        match prev {
            Some((pt, ps)) if step > ps => {
                out.push((t - pt).max(0.0) / (step - ps) as f64);
                prev = Some((t, step));
            }
            Some(_) => {}
            None => prev = Some((t, step)),
        }
    }
    out
}
