use std::time::Duration;

use echo_proto::FrameStats;
use tokio::time::Instant;
use tracing::info;

/// Application-level counters for the ingestion pipeline
pub struct AppMetrics {
    /// Number of packets decoded
    pub packets: u64,
    /// Frames dropped on a checksum mismatch
    pub checksum_errors: u64,
    /// Frames dropped because of their size
    pub length_errors: u64,
    /// Bytes skipped while resynchronising on the start byte
    pub discarded_bytes: u64,
    /// Reader open/read failures
    pub transport_errors: u64,
    /// Reader restarts caused by settings updates
    pub restarts: u64,
    /// Failed deliveries to the telemetry broadcast
    pub telemetry_errors: u64,
    /// Failed deliveries to the depth outputs
    pub depth_errors: u64,
}

impl AppMetrics {
    /// Create a new AppMetrics instance with all counters at zero
    pub fn new() -> Self {
        Self {
            packets: 0,
            checksum_errors: 0,
            length_errors: 0,
            discarded_bytes: 0,
            transport_errors: 0,
            restarts: 0,
            telemetry_errors: 0,
            depth_errors: 0,
        }
    }

    /// Add the framing counters reported by a reader
    pub fn record_frames(&mut self, stats: FrameStats) {
        self.checksum_errors += stats.checksum_errors;
        self.length_errors += stats.length_errors;
        self.discarded_bytes += stats.discarded_bytes;
    }

    /// Reset all counters to zero
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Log current metrics to the info log
    pub fn log(&self) {
        info!(
            "[Metrics] Packets: {}, Checksum errors: {}, Length errors: {}, Discarded bytes: {}, Transport errors: {}, Restarts: {}, Sink errors: {}/{}",
            self.packets,
            self.checksum_errors,
            self.length_errors,
            self.discarded_bytes,
            self.transport_errors,
            self.restarts,
            self.telemetry_errors,
            self.depth_errors
        );
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs the counters once per window, then starts a fresh window
pub struct MetricsLogger {
    window_start: Instant,
    window: Duration,
}

impl MetricsLogger {
    pub fn new(window: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            window,
        }
    }

    /// Log and reset `metrics` once the current window is over; true when it did
    pub fn check_and_log(&mut self, metrics: &mut AppMetrics) -> bool {
        if self.window_start.elapsed() < self.window {
            return false;
        }
        metrics.log();
        metrics.reset();
        self.window_start = Instant::now();
        true
    }
}
