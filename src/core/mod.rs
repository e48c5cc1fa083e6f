//! Core engine module for Dredge
//!
//! This module contains the capture loop, frame decoding and flow dispatch,
//! and the engine that wires them to the protocol decoders and publisher.

pub mod engine;
pub mod flow;
pub mod packet;
#[cfg(test)]
pub mod test_utils;

use crate::capture::{self, PacketSource};
use crate::config::DredgeConfig;
use crate::core::engine::{CaptureLoop, LoopExit};
use crate::core::flow::{run_flow_worker, FlowDispatcher};
use crate::core::packet::FrameDecoder;
use crate::protocols::mongodb::MongoDecoder;
use crate::protocols::ProtocolDecoderRegistry;
use crate::publish::{self, BufferedPublisher, Publisher};
use crate::utils::metrics::{report_periodically, PipelineMetrics};
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The main Dredge engine that coordinates all components
pub struct DredgeEngine {
    config: Arc<DredgeConfig>,
    metrics: Arc<PipelineMetrics>,
    /// Cleared to stop the capture loop
    running: Arc<AtomicBool>,
    capture_thread: Option<thread::JoinHandle<()>>,
    /// Fires when the capture loop returns
    capture_exit: Option<oneshot::Receiver<LoopExit>>,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<std::io::Result<u64>>>,
    reporter: Option<JoinHandle<()>>,
}

impl DredgeEngine {
    /// Create a new Dredge engine with the given configuration
    pub fn new(config: DredgeConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(PipelineMetrics::new()),
            running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
            capture_exit: None,
            workers: Vec::new(),
            writer: None,
            reporter: None,
        }
    }

    /// Shared pipeline counters
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Open the capture source and start every pipeline stage
    ///
    /// Must be called from within a multi-threaded runtime.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let config: Arc<DredgeConfig> = Arc::clone(&self.config);

        let mut source: Box<dyn PacketSource> =
            capture::open_source(&config.capture).context("Failed to open capture source")?;
        self.install_filter(source.as_mut())?;
        let decoder: FrameDecoder = FrameDecoder::new(source.link_type());

        // Publisher and record writer
        let (publisher, records) = BufferedPublisher::new(config.publish.buffer_size, self.metrics());
        let output = publish::open_output(config.publish.output.as_deref())
            .await
            .context("Failed to open record output")?;
        self.writer = Some(tokio::spawn(publish::write_json_lines(records, output)));
        let publisher: Arc<dyn Publisher> = Arc::new(publisher);

        // Flow workers, each with its own decoder state
        let (dispatcher, receivers) = FlowDispatcher::new(
            config.general.workers,
            config.general.queue_depth,
            Duration::from_millis(config.general.enqueue_timeout_ms),
            Handle::current(),
            self.metrics(),
        );
        let flow_timeout: Duration = Duration::from_secs(config.general.flow_timeout);
        for (id, receiver) in receivers.into_iter().enumerate() {
            let mut registry: ProtocolDecoderRegistry = ProtocolDecoderRegistry::new();
            registry.register(Box::new(MongoDecoder::new(
                config.mongodb.port,
                config.mongodb.max_message_size,
            )));
            self.workers.push(tokio::spawn(run_flow_worker(
                id,
                receiver,
                registry,
                Arc::clone(&publisher),
                self.metrics(),
                flow_timeout,
            )));
        }
        info!(workers = self.workers.len(), port = config.mongodb.port, "Flow workers started");

        self.reporter = Some(tokio::spawn(report_periodically(
            self.metrics(),
            Duration::from_secs(config.logging.stats_interval),
        )));

        // Capture runs on its own thread; dropping the loop closes the worker queues
        self.running.store(true, Ordering::Relaxed);
        let mut capture_loop: CaptureLoop<FlowDispatcher> =
            CaptureLoop::new(source, decoder, dispatcher, self.metrics(), Arc::clone(&self.running));
        let (exit_tx, exit_rx) = oneshot::channel();
        let capture_thread: thread::JoinHandle<()> = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let exit: LoopExit = capture_loop.run();
                drop(capture_loop);
                let _ = exit_tx.send(exit);
            })
            .context("Failed to spawn capture thread")?;

        self.capture_thread = Some(capture_thread);
        self.capture_exit = Some(exit_rx);
        Ok(())
    }

    /// Install the configured filter, or narrow capture to the server port
    fn install_filter(&self, source: &mut dyn PacketSource) -> anyhow::Result<()> {
        match &self.config.capture.bpf_filter {
            Some(filter) => {
                source
                    .set_filter(filter)
                    .with_context(|| format!("Failed to install packet filter `{}`", filter))?;
                info!(filter = %filter, "Packet filter installed");
            }
            None if source.supports_filter() => {
                let filter: String = format!("tcp port {}", self.config.mongodb.port);
                source
                    .set_filter(&filter)
                    .with_context(|| format!("Failed to install packet filter `{}`", filter))?;
                info!(filter = %filter, "Packet filter installed");
            }
            None => warn!("Capture backend cannot filter, every frame will be decoded"),
        }
        Ok(())
    }

    /// Wait until the capture loop returns on its own
    pub async fn wait(&mut self) -> LoopExit {
        let exit: LoopExit = match self.capture_exit.as_mut() {
            Some(receiver) => receiver.await.unwrap_or(LoopExit::Stopped),
            None => LoopExit::Stopped,
        };
        self.capture_exit = None;
        exit
    }

    /// Stop capturing and drain every stage
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::Relaxed);

        if let Some(capture_thread) = self.capture_thread.take() {
            let joined = tokio::task::spawn_blocking(move || capture_thread.join())
                .await
                .context("Failed to join capture thread")?;
            if joined.is_err() {
                error!("Capture thread panicked");
            }
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Flow worker failed");
            }
        }

        if let Some(writer) = self.writer.take() {
            match writer.await {
                Ok(Ok(written)) => info!(written, "Record writer finished"),
                Ok(Err(e)) => error!(error = %e, "Record writer failed"),
                Err(e) => error!(error = %e, "Record writer task failed"),
            }
        }

        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
        self.metrics.log_snapshot();
        Ok(())
    }
}
