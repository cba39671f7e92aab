//! Progress tracking
//!
//! Throughput logging for long byte-oriented operations (download,
//! decompression, hashing, block writes) and a percent gate so callers only
//! publish an event when the integer percentage moves.

use std::time::Instant;

use super::{bytes_to_mb, percent_of};
use crate::{log_debug, log_info};

/// Tracks bytes processed for one operation
pub struct ProgressTracker {
    operation: String,
    module: String,
    total_bytes: u64,
    processed_bytes: u64,
    start_time: Instant,
    last_log_time: Instant,
    last_log_bytes: u64,
    log_interval_bytes: u64,
    last_percent: Option<u8>,
}

/// Snapshot returned when an update crosses a log interval
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub current_mb: f64,
    pub total_mb: f64,
    pub percent: u8,
    pub speed_mbps: f64,
}

/// Final summary data
#[derive(Debug, Clone, Copy)]
pub struct ProgressSummary {
    pub total_mb: f64,
    pub elapsed_secs: f64,
    pub avg_speed_mbps: f64,
}

impl ProgressTracker {
    /// `total_bytes` may be 0 when unknown
    pub fn new(operation: &str, module: &str, total_bytes: u64, log_interval_mb: u64) -> Self {
        let now = Instant::now();
        Self {
            operation: operation.to_string(),
            module: module.to_string(),
            total_bytes,
            processed_bytes: 0,
            start_time: now,
            last_log_time: now,
            last_log_bytes: 0,
            log_interval_bytes: log_interval_mb * 1024 * 1024,
            last_percent: None,
        }
    }

    /// Start from an offset (resumed downloads)
    pub fn resume_from(mut self, already_processed: u64) -> Self {
        self.processed_bytes = already_processed;
        self.last_log_bytes = already_processed;
        self
    }

    pub fn processed(&self) -> u64 {
        self.processed_bytes
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    pub fn percent(&self) -> u8 {
        percent_of(self.processed_bytes, self.total_bytes)
    }

    /// Returns the new percentage if it changed since the last call
    pub fn percent_changed(&mut self) -> Option<u8> {
        let percent = self.percent();
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }

    /// Record `bytes_added` and log throughput when a log interval is crossed
    pub fn update(&mut self, bytes_added: u64) -> Option<ProgressUpdate> {
        self.processed_bytes += bytes_added;

        if self.log_interval_bytes == 0 {
            return None;
        }

        let crossed = self.processed_bytes / self.log_interval_bytes
            > self.last_log_bytes / self.log_interval_bytes;
        if !crossed {
            return None;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_log_time).as_secs_f64();
        let speed_mbps = if elapsed > 0.0 {
            bytes_to_mb(self.processed_bytes - self.last_log_bytes) / elapsed
        } else {
            0.0
        };
        self.last_log_time = now;
        self.last_log_bytes = self.processed_bytes;

        let update = ProgressUpdate {
            current_mb: bytes_to_mb(self.processed_bytes),
            total_mb: bytes_to_mb(self.total_bytes),
            percent: self.percent(),
            speed_mbps,
        };

        if self.total_bytes > 0 {
            log_debug!(
                &self.module,
                "{} progress: {:.1} MB / {:.1} MB ({}%) @ {:.1} MB/s",
                self.operation,
                update.current_mb,
                update.total_mb,
                update.percent,
                update.speed_mbps
            );
        } else {
            log_debug!(
                &self.module,
                "{} progress: {:.1} MB @ {:.1} MB/s",
                self.operation,
                update.current_mb,
                update.speed_mbps
            );
        }

        Some(update)
    }

    /// Log the completion summary with average throughput
    pub fn finish(&self) -> ProgressSummary {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        let total_mb = bytes_to_mb(self.processed_bytes);
        let summary = ProgressSummary {
            total_mb,
            elapsed_secs,
            avg_speed_mbps: if elapsed_secs > 0.0 {
                total_mb / elapsed_secs
            } else {
                0.0
            },
        };

        log_info!(
            &self.module,
            "{} complete: {:.1} MB in {:.1}s (avg {:.1} MB/s)",
            self.operation,
            summary.total_mb,
            summary.elapsed_secs,
            summary.avg_speed_mbps
        );

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_crosses_interval() {
        let mut tracker = ProgressTracker::new("Test", "progress", 4 * 1024 * 1024, 1);
        assert!(tracker.update(512 * 1024).is_none());
        let update = tracker.update(512 * 1024).unwrap();
        assert_eq!(update.percent, 25);
        assert_eq!(tracker.processed(), 1024 * 1024);
    }

    #[test]
    fn test_percent_changed_only_on_change() {
        let mut tracker = ProgressTracker::new("Test", "progress", 200, 0);
        assert_eq!(tracker.percent_changed(), Some(0));
        tracker.update(1);
        assert_eq!(tracker.percent_changed(), None);
        tracker.update(1);
        assert_eq!(tracker.percent_changed(), Some(1));
    }

    #[test]
    fn test_resume_from() {
        let tracker = ProgressTracker::new("Test", "progress", 100, 0).resume_from(40);
        assert_eq!(tracker.percent(), 40);
    }
}
