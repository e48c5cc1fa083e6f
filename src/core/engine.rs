//! Capture loop implementation
//!
//! This module drives a packet source through the frame decoder and hands
//! decoded packets to a sink. Errors inside the loop are counted and logged;
//! only the end of the stream or a cleared running flag stops it.

use crate::capture::{CaptureError, CaptureStats, Frame, PacketSource};
use crate::core::packet::{DecodeError, FrameDecoder, PacketInfo};
use crate::utils::metrics::PipelineMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frames read between two kernel drop refreshes
const STATS_REFRESH_FRAMES: u64 = 4096;

/// Consumer of decoded packets
pub trait PacketSink: Send {
    fn deliver(&mut self, packet: PacketInfo);
}

/// Why the capture loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The source has no more frames
    EndOfStream,
    /// The running flag was cleared
    Stopped,
}

/// Read, decode and deliver frames until the stream ends or a stop is requested
pub struct CaptureLoop<S: PacketSink> {
    source: Box<dyn PacketSource>,
    decoder: FrameDecoder,
    sink: S,
    metrics: Arc<PipelineMetrics>,
    running: Arc<AtomicBool>,
    /// Frames read since the last kernel drop refresh
    since_refresh: u64,
}

impl<S: PacketSink> CaptureLoop<S> {
    pub fn new(
        source: Box<dyn PacketSource>,
        decoder: FrameDecoder,
        sink: S,
        metrics: Arc<PipelineMetrics>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            decoder,
            sink,
            metrics,
            running,
            since_refresh: 0,
        }
    }

    /// Run the loop on the calling thread
    pub fn run(&mut self) -> LoopExit {
        info!(link_type = ?self.decoder.link_type(), "Capture loop started");

        let exit: LoopExit = loop {
            if !self.running.load(Ordering::Relaxed) {
                info!("Capture stopped");
                break LoopExit::Stopped;
            }

            match self.source.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => {
                    info!("End of capture stream");
                    break LoopExit::EndOfStream;
                }
                Err(CaptureError::Timeout) => self.refresh_kernel_drops(),
                Err(e) => {
                    self.metrics.record_capture_error();
                    warn!(error = %e, "Capture read failed");
                }
            }
        };

        self.refresh_kernel_drops();
        if let Err(e) = self.source.close() {
            warn!(error = %e, "Failed to close capture source");
        }
        exit
    }

    fn handle_frame(&mut self, frame: Frame) {
        if frame.data.is_empty() {
            return;
        }

        self.metrics.record_frame(frame.data.len(), frame.is_truncated());
        self.since_refresh += 1;
        if self.since_refresh >= STATS_REFRESH_FRAMES {
            self.refresh_kernel_drops();
        }

        let decoded: Result<PacketInfo, DecodeError> = self.decoder.decode(&frame);
        match decoded {
            Ok(packet) => self.sink.deliver(packet),
            Err(e) => {
                self.metrics.record_decode_error();
                debug!(error = %e, len = frame.data.len(), "Dropping undecodable frame");
            }
        }
    }

    fn refresh_kernel_drops(&mut self) {
        self.since_refresh = 0;
        let stats: Result<CaptureStats, CaptureError> = self.source.stats();
        match stats {
            Ok(stats) => self.metrics.set_kernel_drops(stats.dropped),
            Err(e) => debug!(error = %e, "Capture statistics unavailable"),
        }
    }

    /// Give back the sink, dropping the source
    pub fn into_sink(self) -> S {
        self.sink
    }
}
