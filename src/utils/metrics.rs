//! Pipeline statistics for Dredge
//!
//! Counters are shared between the capture thread, the flow workers and the
//! publisher. A snapshot is logged periodically and once more on shutdown.

use crate::utils::{format_bytes, format_duration};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Counters for every stage of the pipeline
#[derive(Debug)]
pub struct PipelineMetrics {
    /// Start time
    start_time: Instant,
    /// Frames read from the capture source
    frames_read: AtomicU64,
    /// Bytes read from the capture source
    bytes_read: AtomicU64,
    /// Frames the decoder rejected
    decode_errors: AtomicU64,
    /// Read errors reported by the capture source
    capture_errors: AtomicU64,
    /// Frames cut short by the snapshot length
    truncated_frames: AtomicU64,
    /// Frames the kernel dropped, as last reported
    kernel_drops: AtomicU64,
    /// Packets dropped because a flow worker fell behind
    flow_queue_drops: AtomicU64,
    /// Queries turned into shapes
    documents_shaped: AtomicU64,
    /// Wire protocol errors
    protocol_errors: AtomicU64,
    records_published: AtomicU64,
    publish_drops: AtomicU64,
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_read: u64,
    pub bytes_read: u64,
    pub decode_errors: u64,
    pub capture_errors: u64,
    pub truncated_frames: u64,
    pub kernel_drops: u64,
    pub flow_queue_drops: u64,
    pub documents_shaped: u64,
    pub protocol_errors: u64,
    pub records_published: u64,
    pub publish_drops: u64,
    /// Seconds since the metrics were created
    pub uptime_secs: u64,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create new pipeline metrics
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames_read: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            capture_errors: AtomicU64::new(0),
            truncated_frames: AtomicU64::new(0),
            kernel_drops: AtomicU64::new(0),
            flow_queue_drops: AtomicU64::new(0),
            documents_shaped: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            records_published: AtomicU64::new(0),
            publish_drops: AtomicU64::new(0),
        }
    }

    /// Record a frame read from the capture source
    pub fn record_frame(&self, size: usize, truncated: bool) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        if truncated {
            self.truncated_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_error(&self) {
        self.capture_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Store the kernel drop count reported by the capture source
    pub fn set_kernel_drops(&self, dropped: u64) {
        self.kernel_drops.store(dropped, Ordering::Relaxed);
    }

    pub fn record_flow_queue_drop(&self) {
        self.flow_queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_document_shaped(&self) {
        self.documents_shaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.records_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_drop(&self) {
        self.publish_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the metrics were created
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            truncated_frames: self.truncated_frames.load(Ordering::Relaxed),
            kernel_drops: self.kernel_drops.load(Ordering::Relaxed),
            flow_queue_drops: self.flow_queue_drops.load(Ordering::Relaxed),
            documents_shaped: self.documents_shaped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            publish_drops: self.publish_drops.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }

    /// Log a snapshot as one structured event
    pub fn log_snapshot(&self) {
        let stats: MetricsSnapshot = self.snapshot();
        info!(
            frames_read = stats.frames_read,
            bytes_read = %format_bytes(stats.bytes_read),
            decode_errors = stats.decode_errors,
            capture_errors = stats.capture_errors,
            truncated_frames = stats.truncated_frames,
            kernel_drops = stats.kernel_drops,
            flow_queue_drops = stats.flow_queue_drops,
            documents_shaped = stats.documents_shaped,
            protocol_errors = stats.protocol_errors,
            records_published = stats.records_published,
            publish_drops = stats.publish_drops,
            uptime = %format_duration(Duration::from_secs(stats.uptime_secs)),
            "dredge statistics"
        );
    }
}

/// Log a snapshot every `interval` until the task is aborted
pub async fn report_periodically(metrics: Arc<PipelineMetrics>, interval: Duration) {
    let mut ticker: tokio::time::Interval = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        metrics.log_snapshot();
    }
}
