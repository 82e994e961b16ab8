//! Per-transfer progress reporting.

use std::path::PathBuf;
use tokio::time::Instant;

/// Progress information for one download.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub title: String,
    pub destination: PathBuf,
    /// Bytes in the partial file so far, including resumed bytes.
    pub bytes_transferred: u64,
    /// Total bytes (if known).
    pub total_bytes: Option<u64>,
    /// Transfer speed of this attempt in bytes per second.
    pub speed_bytes_per_sec: f64,
    /// Percentage complete (0-100).
    pub percent: Option<f64>,
    /// Estimated time remaining in seconds.
    pub eta_seconds: Option<f64>,
}

impl TransferProgress {
    pub(crate) fn new(
        title: &str,
        destination: PathBuf,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        speed: f64,
    ) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_transferred as f64 / total as f64) * 100.0
            } else {
                0.0
            }
        });

        let eta_seconds = total_bytes.and_then(|total| {
            if speed > 0.0 && bytes_transferred < total {
                Some((total - bytes_transferred) as f64 / speed)
            } else {
                None
            }
        });

        Self {
            title: title.to_string(),
            destination,
            bytes_transferred,
            total_bytes,
            speed_bytes_per_sec: speed,
            percent,
            eta_seconds,
        }
    }
}

/// Average speed since the start of an attempt.
pub(crate) struct SpeedTracker {
    start_time: Instant,
    total_bytes: u64,
}

impl SpeedTracker {
    pub(crate) fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
        }
    }

    pub(crate) fn record(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    pub(crate) fn speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_bytes as f64 / elapsed
        } else {
            0.0
        }
    }
}
