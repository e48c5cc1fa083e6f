//! Flow tracking module
//!
//! This module shards TCP flows onto worker tasks. Every packet of a
//! connection, in either direction, reaches the same worker, and that worker
//! alone owns the connection's reassembly state.

use crate::core::engine::PacketSink;
use crate::core::packet::PacketInfo;
use crate::protocols::ProtocolDecoderRegistry;
use crate::publish::{Publisher, QueryRecord};
use crate::utils::metrics::PipelineMetrics;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Directional identifier of a TCP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    /// Create a flow key from a packet with both an IP and a TCP layer
    pub fn from_packet(packet: &PacketInfo) -> Option<Self> {
        Some(Self {
            src_ip: packet.src_ip?,
            src_port: packet.src_port?,
            dst_ip: packet.dst_ip?,
            dst_port: packet.dst_port?,
        })
    }

    /// Create a reversed flow key (swapping source and destination)
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    /// Worker index for this flow; both directions map to the same shard
    pub fn shard(&self, workers: usize) -> usize {
        if workers <= 1 {
            return 0;
        }
        let source: (IpAddr, u16) = (self.src_ip, self.src_port);
        let destination: (IpAddr, u16) = (self.dst_ip, self.dst_port);
        let (low, high) = if source <= destination {
            (source, destination)
        } else {
            (destination, source)
        };

        let mut hasher: DefaultHasher = DefaultHasher::new();
        low.hash(&mut hasher);
        high.hash(&mut hasher);
        (hasher.finish() % workers as u64) as usize
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            SocketAddr::new(self.src_ip, self.src_port),
            SocketAddr::new(self.dst_ip, self.dst_port)
        )
    }
}

/// Hands packets from the capture thread to flow workers
pub struct FlowDispatcher {
    /// One bounded queue per worker
    senders: Vec<mpsc::Sender<PacketInfo>>,
    /// How long to wait on a full queue before dropping
    enqueue_timeout: Duration,
    /// Runtime used for the bounded wait
    handle: Handle,
    metrics: Arc<PipelineMetrics>,
}

impl FlowDispatcher {
    /// Create a dispatcher and the receiving end of every worker queue
    pub fn new(
        workers: usize,
        queue_depth: usize,
        enqueue_timeout: Duration,
        handle: Handle,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, Vec<mpsc::Receiver<PacketInfo>>) {
        let mut senders: Vec<mpsc::Sender<PacketInfo>> = Vec::with_capacity(workers);
        let mut receivers: Vec<mpsc::Receiver<PacketInfo>> = Vec::with_capacity(workers);
        for _ in 0..workers.max(1) {
            let (sender, receiver) = mpsc::channel(queue_depth.max(1));
            senders.push(sender);
            receivers.push(receiver);
        }

        let dispatcher: FlowDispatcher = Self {
            senders,
            enqueue_timeout,
            handle,
            metrics,
        };
        (dispatcher, receivers)
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Queue a packet for its flow worker
    ///
    /// Must not be called from inside the runtime: a full queue is waited on
    /// by blocking the calling thread. Returns whether the packet was queued.
    pub fn dispatch(&self, packet: PacketInfo) -> bool {
        let key: FlowKey = match FlowKey::from_packet(&packet) {
            Some(key) => key,
            None => return false,
        };
        // Pure ACKs carry nothing for the decoders
        if packet.payload.is_empty() && !packet.truncated && !packet.closes_stream() {
            return false;
        }

        let sender: &mpsc::Sender<PacketInfo> = &self.senders[key.shard(self.senders.len())];
        let queued: bool = match sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                let send = tokio::time::timeout(self.enqueue_timeout, sender.send(packet));
                matches!(self.handle.block_on(send), Ok(Ok(())))
            }
            Err(TrySendError::Closed(_)) => false,
        };

        if !queued {
            trace!(flow = %key, "Flow queue full, dropping packet");
            self.metrics.record_flow_queue_drop();
        }
        queued
    }
}

impl PacketSink for FlowDispatcher {
    fn deliver(&mut self, packet: PacketInfo) {
        self.dispatch(packet);
    }
}

/// Decode, shape and publish the packets of the flows assigned to one worker
///
/// Runs until the dispatcher is dropped and the queue is drained.
pub async fn run_flow_worker(
    id: usize,
    mut receiver: mpsc::Receiver<PacketInfo>,
    mut registry: ProtocolDecoderRegistry,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<PipelineMetrics>,
    flow_timeout: Duration,
) {
    let mut sweep: tokio::time::Interval = tokio::time::interval(flow_timeout);
    // The first tick completes immediately
    sweep.tick().await;
    debug!(worker = id, decoders = ?registry.names(), "Flow worker started");

    loop {
        tokio::select! {
            packet = receiver.recv() => match packet {
                Some(packet) => process_packet(&mut registry, publisher.as_ref(), &metrics, packet),
                None => break,
            },
            _ = sweep.tick() => {
                let evicted: usize = registry.evict_idle(flow_timeout);
                if evicted > 0 {
                    debug!(worker = id, evicted, "Evicted idle flows");
                }
            }
        }
    }

    debug!(worker = id, streams = registry.stream_count(), "Flow worker stopped");
}

fn process_packet(
    registry: &mut ProtocolDecoderRegistry,
    publisher: &dyn Publisher,
    metrics: &PipelineMetrics,
    packet: PacketInfo,
) {
    let stream: FlowKey = match FlowKey::from_packet(&packet) {
        Some(stream) => stream,
        None => return,
    };

    for result in registry.decode_packet(&stream, &packet) {
        match result {
            Ok(query) => {
                metrics.record_document_shaped();
                trace!(flow = %stream, shape = %query.shape, "Query shaped");
                publisher.publish(QueryRecord::new(&stream, packet.timestamp, query));
            }
            Err(e) => {
                metrics.record_protocol_error();
                debug!(flow = %stream, error = %e, "Protocol error");
            }
        }
    }
}
