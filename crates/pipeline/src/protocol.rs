//! Line-based progress protocol.
//!
//! The pipeline reports progress on stdout as plain text. Rather than
//! guessing at arbitrary output, the adapter recognizes a small set of
//! documented markers and ignores everything else: an unmatched line is
//! appended to the job log verbatim and is never an error.
//!
//! Stage markers (case-insensitive substring match):
//!
//! | marker                | stage         |
//! |-----------------------|---------------|
//! | `PREPROCESSING DATA`  | preprocessing |
//! | `TRAINING MODELS`     | training      |
//! | `SAMPLING DATA`       | sampling      |
//! | `RUNNING EVALUATION`  | evaluation    |
//! | `SAVING OUTPUTS`      | finalizing    |
//!
//! Epoch markers of the form `Epoch i/n` interpolate the percentage
//! within the current stage's band. Reported percentages never decrease.

use std::sync::OnceLock;

use regex::Regex;
use tabsyn_core::job::Stage;

/// Percent band `(start, end)` a stage occupies in the overall run.
///
/// The bands mirror the relative cost of the pipeline phases: training
/// dominates, sampling and evaluation share most of the rest.
fn band(stage: Stage) -> (u8, u8) {
    match stage {
        Stage::Starting => (1, 5),
        Stage::Preprocessing => (5, 10),
        Stage::Training => (10, 60),
        Stage::Sampling => (60, 80),
        Stage::Evaluation => (80, 95),
        Stage::Finalizing => (95, 99),
        Stage::Queued => (0, 0),
        Stage::Completed | Stage::Failed => (100, 100),
    }
}

fn stage_for_line(line: &str) -> Option<Stage> {
    let upper = line.trim().to_uppercase();
    if upper.contains("PREPROCESSING DATA") {
        Some(Stage::Preprocessing)
    } else if upper.contains("TRAINING MODELS") {
        Some(Stage::Training)
    } else if upper.contains("SAMPLING DATA") {
        Some(Stage::Sampling)
    } else if upper.contains("RUNNING EVALUATION") {
        Some(Stage::Evaluation)
    } else if upper.contains("SAVING OUTPUTS") {
        Some(Stage::Finalizing)
    } else {
        None
    }
}

fn epoch_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bepoch[ :]+(\d+)\s*/\s*(\d+)").expect("valid epoch regex"))
}

/// Tracks the current stage and percentage across output lines.
pub struct ProgressTracker {
    stage: Stage,
    percent: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            stage: Stage::Starting,
            percent: band(Stage::Starting).0,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Feed one output line. Returns the new `(stage, percent)` when the
    /// line carried a marker that moved progress forward, `None` for
    /// everything else.
    pub fn observe(&mut self, line: &str) -> Option<(Stage, u8)> {
        if let Some(stage) = stage_for_line(line) {
            self.stage = stage;
            self.percent = self.percent.max(band(stage).0);
            return Some((self.stage, self.percent));
        }

        if let Some(caps) = epoch_regex().captures(line) {
            let current: u32 = caps[1].parse().ok()?;
            let total: u32 = caps[2].parse().ok()?;
            if total == 0 {
                return None;
            }
            let (start, end) = band(self.stage);
            let span = u32::from(end - start);
            let offset = (span * current.min(total) / total) as u8;
            let percent = self.percent.max(start + offset);
            if percent != self.percent {
                self.percent = percent;
                return Some((self.stage, self.percent));
            }
        }

        None
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_markers_are_recognized_case_insensitively() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(
            tracker.observe("== Preprocessing data =="),
            Some((Stage::Preprocessing, 5))
        );
        assert_eq!(
            tracker.observe("TRAINING MODELS"),
            Some((Stage::Training, 10))
        );
        assert_eq!(
            tracker.observe("now sampling data from the model"),
            Some((Stage::Sampling, 60))
        );
    }

    #[test]
    fn unknown_lines_are_not_progress() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe("loaded 1523 rows from patients.csv"), None);
        assert_eq!(tracker.observe(""), None);
        assert_eq!(tracker.stage(), Stage::Starting);
    }

    #[test]
    fn epochs_interpolate_within_the_stage_band() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("TRAINING MODELS");
        assert_eq!(tracker.observe("Epoch 5/10"), Some((Stage::Training, 35)));
        assert_eq!(tracker.observe("Epoch 10/10"), Some((Stage::Training, 60)));
    }

    #[test]
    fn epoch_format_variants_parse() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("TRAINING MODELS");
        assert!(tracker.observe("epoch: 2/4").is_some());
    }

    #[test]
    fn percent_never_decreases_across_stage_changes() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("TRAINING MODELS");
        tracker.observe("Epoch 10/10");
        assert_eq!(tracker.percent(), 60);

        // A repeated early epoch must not move progress backwards.
        assert_eq!(tracker.observe("Epoch 1/10"), None);
        assert_eq!(tracker.percent(), 60);
    }

    #[test]
    fn zero_total_epochs_ignored() {
        let mut tracker = ProgressTracker::new();
        tracker.observe("TRAINING MODELS");
        assert_eq!(tracker.observe("Epoch 1/0"), None);
    }
}
