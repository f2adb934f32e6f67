//! Progress reporting for long running batches
//!
//! Reporting is fire-and-forget: a tracker that fails never aborts the batch
//! that reports to it.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub trait ProgressTracker: Send + Sync {
    fn report(&self, stage: &str, percent: f64, message: &str) -> anyhow::Result<()>;
}

/// Report and log, but otherwise ignore, a failure of the tracker.
pub fn report_progress(tracker: &dyn ProgressTracker, stage: &str, percent: f64, message: &str) {
    if let Err(e) = tracker.report(stage, percent.clamp(0.0, 100.0), message) {
        warn!("failed to report progress for {stage}: {e}");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressTracker for NoopProgress {
    fn report(&self, _stage: &str, _percent: f64, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes progress to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressTracker for TracingProgress {
    fn report(&self, stage: &str, percent: f64, message: &str) -> anyhow::Result<()> {
        info!("[{stage}] {percent:.0}% {message}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: String,
    pub percent: f64,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Forwards progress over a bounded channel without waiting
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: mpsc::Sender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ProgressTracker for ChannelProgress {
    fn report(&self, stage: &str, percent: f64, message: &str) -> anyhow::Result<()> {
        self.sender.try_send(ProgressUpdate {
            stage: stage.to_string(),
            percent,
            message: message.to_string(),
            at: Utc::now(),
        })?;
        Ok(())
    }
}
