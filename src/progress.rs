//! Transfer progress reporting.

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::DfuError;

/// Receiver of progress updates for one transfer.
///
/// Implementations should tolerate the same percentage being reported twice.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, percent: u8);
    fn on_complete(&self);
    fn on_error(&self, error: &DfuError);
}

/// `floor(sent * 100 / total)`, clamped to 100. A zero total reports 0.
pub fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let sent = sent.min(total) as u64;
    (sent * 100 / total as u64) as u8
}

/// Turns byte counts into percentages and forwards changes to a sink.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    last: Option<u8>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self { sink, last: None }
    }

    pub fn update(&mut self, sent: usize, total: usize) {
        let pct = percent(sent, total);
        if self.last != Some(pct) {
            self.last = Some(pct);
            self.sink.on_progress(pct);
        }
    }

    /// Reports 100% and completion regardless of what was sent before.
    pub fn finish(&mut self) {
        self.last = Some(100);
        self.sink.on_progress(100);
        self.sink.on_complete();
    }
}

/// Terminal progress bar.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn on_progress(&self, percent: u8) {
        self.bar.set_position(percent as u64);
    }

    fn on_complete(&self) {
        self.bar.finish_with_message("done");
    }

    fn on_error(&self, error: &DfuError) {
        self.bar.abandon_with_message(format!("failed: {}", error));
    }
}
