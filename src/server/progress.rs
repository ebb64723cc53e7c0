//! Progress tracking across the request sequence

use crate::server::message::RequestKind;
use crate::server::state::{MAX_PROGRESS, StepProgress, progress_band};
use serde::Serialize;

/// Progress as reported to the owner of the reader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub step: RequestKind,
    /// Fraction of the current step, in [0, 1], non-decreasing within a step
    pub fraction: f64,
    /// Fraction of the whole parse cycle, in [0, 1]
    pub overall: f64,
    pub message: String,
}

/// Keeps reported progress monotonic within one step.
/// The server restarts its counters per step, so a new step resets the floor.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    step: Option<RequestKind>,
    floor: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.step = None;
        self.floor = 0.0;
    }

    pub fn observe(&mut self, progress: StepProgress) -> ProgressUpdate {
        if self.step != Some(progress.step) {
            self.step = Some(progress.step);
            self.floor = 0.0;
        }
        self.floor = self.floor.max(progress.fraction.clamp(0.0, 1.0));

        let (low, high) = progress_band(progress.step);
        let overall = (low as f64 + self.floor * (high - low) as f64) / MAX_PROGRESS as f64;

        ProgressUpdate {
            step: progress.step,
            fraction: self.floor,
            overall,
            message: progress.message,
        }
    }

    /// Overall value at the start of `step`, used when a request is sent
    pub fn step_started(&mut self, step: RequestKind) -> f64 {
        self.step = Some(step);
        self.floor = 0.0;
        progress_band(step).0 as f64 / MAX_PROGRESS as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step: RequestKind, fraction: f64) -> StepProgress {
        StepProgress {
            step,
            fraction,
            message: String::new(),
        }
    }

    #[test]
    fn test_fraction_never_decreases_within_step() {
        let mut tracker = ProgressTracker::new();

        let values: Vec<f64> = [0.2, 0.6, 0.4, 0.9, 0.1]
            .into_iter()
            .map(|f| tracker.observe(step(RequestKind::Compute, f)).fraction)
            .collect();

        assert_eq!(values, vec![0.2, 0.6, 0.6, 0.9, 0.9]);
    }

    #[test]
    fn test_new_step_resets_floor_and_maps_overall() {
        let mut tracker = ProgressTracker::new();
        tracker.observe(step(RequestKind::Configure, 0.8));

        let update = tracker.observe(step(RequestKind::Compute, 0.5));
        assert_eq!(update.fraction, 0.5);
        assert_eq!(update.overall, 1100.0 / 1400.0);

        let done = tracker.observe(step(RequestKind::CmakeInputs, 1.0));
        assert_eq!(done.overall, 1.0);
    }

    #[test]
    fn test_step_started_reports_band_start() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.step_started(RequestKind::Configure), 0.0);
        assert_eq!(tracker.step_started(RequestKind::CodeModel), 1200.0 / 1400.0);
    }
}
