//! Progress reporting and cooperative cancellation.
//!
//! Long-running operations report status text and a completion percentage,
//! and poll [`ProgressSink::is_aborted`] at well-defined points (segment
//! boundaries, cluster writes). There is no preemption; cancellation only
//! takes effect at those polling points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receiver for progress updates and source of the abort signal.
pub trait ProgressSink {
    /// A new phase of the operation has started.
    fn update_status(&self, _status: &str) {}

    /// Completion of the current phase, in the range `0.0..=100.0`.
    fn update_percentage(&self, _percentage: f64) {}

    /// Whether the operation should stop at the next polling point.
    fn is_aborted(&self) -> bool {
        false
    }
}

/// Sink that ignores all updates and never aborts.
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Shareable abort flag.
///
/// Clones observe the same flag, so one handle can be kept by the caller
/// while another is passed to the running operation.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl ProgressSink for AbortFlag {
    fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
