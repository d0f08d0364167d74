// THEORY:
// The pipeline talks to its front end through two channels. The persistent log
// receives one line per milestone (file loaded, reference set, run started,
// run finished or failed, file saved). The ephemeral status line is overwritten
// with high-frequency progress while a run is in flight. Both sit behind the
// `StatusSink` trait so the core never knows whether it is driving a GUI, a
// terminal or a test.
//
// Alongside the user-facing lines every message is also emitted as a `tracing`
// event, so a host application gets structured logs for free.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of processed steps between two progress updates.
pub const PROGRESS_INTERVAL: usize = 10;

/// Receiver for user-facing progress and milestone text.
///
/// Implementations must be cheap: `log_ephemeral` is called from inside the
/// frame loop.
pub trait StatusSink: Send + Sync {
    /// Append a line to the durable log.
    fn log_persistent(&self, text: &str);
    /// Replace the single-line status indicator.
    fn log_ephemeral(&self, text: &str);
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn log_persistent(&self, text: &str) {
        tracing::info!("{text}");
    }

    fn log_ephemeral(&self, text: &str) {
        tracing::debug!("{text}");
    }
}

/// Keeps every line in memory. Useful for embedding and for tests.
#[derive(Debug, Default)]
pub struct StatusLog {
    persistent: Mutex<Vec<String>>,
    ephemeral: Mutex<Vec<String>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persistent(&self) -> Vec<String> {
        self.persistent.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn ephemeral(&self) -> Vec<String> {
        self.ephemeral.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl StatusSink for StatusLog {
    fn log_persistent(&self, text: &str) {
        tracing::info!("{text}");
        if let Ok(mut lines) = self.persistent.lock() {
            lines.push(text.to_string());
        }
    }

    fn log_ephemeral(&self, text: &str) {
        if let Ok(mut lines) = self.ephemeral.lock() {
            lines.push(text.to_string());
        }
    }
}

/// Tracks read-stage throughput and renders progress/ETA lines.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    last_frame: usize,
    step: usize,
    planned: usize,
}

impl ProgressTracker {
    /// `last_frame` is the exclusive end of the sampled index range.
    pub fn new(last_frame: usize, step: usize) -> Self {
        let step = step.max(1);
        Self {
            started: Instant::now(),
            last_frame,
            step,
            planned: last_frame.div_ceil(step),
        }
    }

    /// Number of frames the run expects to read.
    pub fn planned(&self) -> usize {
        self.planned
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns a status line when frame `index` completes a block of
    /// `PROGRESS_INTERVAL` steps.
    pub fn update(&self, index: usize, frames_read: usize) -> Option<String> {
        if frames_read == 0 || (index + self.step) % (self.step * PROGRESS_INTERVAL) != 0 {
            return None;
        }
        Some(self.render(index, frames_read, self.started.elapsed()))
    }

    pub fn render(&self, index: usize, frames_read: usize, elapsed: Duration) -> String {
        let percent = if self.last_frame == 0 {
            100
        } else {
            (index as f64 / self.last_frame as f64 * 100.0).round() as u64
        };
        let avg_ms = elapsed.as_secs_f64() * 1000.0 / frames_read.max(1) as f64;
        let to_go = self.planned.saturating_sub(frames_read);
        let eta_secs = (to_go as f64 * avg_ms / 1000.0).round() as u64;
        format!(
            "[{percent}%] [{to_go} remaining] [{} ms/frame] ETA: [{eta_secs} sec.]",
            avg_ms as u64
        )
    }
}
