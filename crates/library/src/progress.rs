use serde::{Deserialize, Serialize};

/// One progress update from a running scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Completed share of the work, in `[0, 1]`.
    pub fraction: f64,
    pub message: String,
    /// Set on the single terminal event of a scan.
    pub done: bool,
    pub processed: usize,
    pub total: usize,
}

impl ScanProgress {
    pub fn running(processed: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            fraction: fraction(processed, total),
            message: message.into(),
            done: false,
            processed,
            total,
        }
    }

    pub fn finished(processed: usize, total: usize, fraction: f64, message: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
            done: true,
            processed,
            total,
        }
    }
}

pub fn fraction(processed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (processed as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Receives scan progress. Called on the scan's worker thread, never while
/// scan state is locked.
///
/// The coordinator is already idle when the terminal (`done`) event arrives,
/// so a listener may start the next scan from it. If the same listener is
/// handed to that new scan, its first events can arrive before the old
/// terminal call returns.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: &ScanProgress);
}

impl<F> ProgressListener for F
where
    F: Fn(&ScanProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &ScanProgress) {
        self(progress)
    }
}
