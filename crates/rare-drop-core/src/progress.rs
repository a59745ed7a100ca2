use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One progress notification from a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
    pub rows_written: u64,
    pub rows_total: u64,
    /// Estimated time to completion, once at least one row has been written.
    pub eta: Option<Duration>,
}

impl ProgressUpdate {
    #[must_use]
    pub fn message(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
            rows_written: 0,
            rows_total: 0,
            eta: None,
        }
    }
}

/// Receiver of progress notifications.
pub trait ProgressSink {
    fn on_progress(&mut self, update: &ProgressUpdate);
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_progress(&mut self, _update: &ProgressUpdate) {}
}

impl ProgressSink for Vec<ProgressUpdate> {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        self.push(update.clone());
    }
}

/// Linear extrapolation of the remaining time from the observed write rate.
#[must_use]
pub fn estimate_remaining(elapsed: Duration, written: u64, total: u64) -> Option<Duration> {
    if written == 0 || written > total {
        return None;
    }
    let remaining = total - written;
    let seconds = elapsed.as_secs_f64() * to_f64(remaining) / to_f64(written);
    Some(Duration::from_secs_f64(seconds))
}

/// Completion percentage within the `[start, end]` band of the overall run.
#[must_use]
pub fn scaled_percent(start: u8, end: u8, done: u64, total: u64) -> u8 {
    if total == 0 || end <= start {
        return end;
    }
    let span = u64::from(end - start);
    let offset = span * done.min(total) / total;
    start + u8::try_from(offset).unwrap_or(end - start)
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(value: u64) -> f64 {
    value as f64
}
