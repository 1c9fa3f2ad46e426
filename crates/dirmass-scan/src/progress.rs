//! Cooperative progress reporting.
//!
//! The walker calls the monitor once per entry, the importer once per batch.
//! This is the scan's only suspension point: the handler may redraw, process
//! input, and ask the scan to stop.

use std::path::Path;

/// Snapshot handed to the monitor at each tick.
#[derive(Debug, Clone, Copy)]
pub struct ScanProgress<'a> {
    /// Entries materialized so far.
    pub items: u64,
    /// Apparent bytes accumulated so far.
    pub bytes: u64,
    /// Path currently being processed.
    pub current_path: &'a Path,
    /// Most recent path that failed to read, if any.
    pub last_error: Option<&'a Path>,
}

/// What the monitor wants the producer to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Continue,
    /// Abort at the next iteration; in-flight syscalls are not interrupted.
    Stop,
}

/// Callback seam between a producer and whatever renders progress.
pub trait ScanMonitor {
    fn tick(&mut self, progress: &ScanProgress<'_>) -> Feedback;
}

/// Monitor that never interferes.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl ScanMonitor for NullMonitor {
    fn tick(&mut self, _progress: &ScanProgress<'_>) -> Feedback {
        Feedback::Continue
    }
}
