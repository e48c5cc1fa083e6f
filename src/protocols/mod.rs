//! Protocol decoders module for Dredge
//!
//! This module turns per-flow TCP payload into query documents and their
//! shapes. Each decoder keeps its own stream buffers, so one decoder instance
//! must only ever be driven by a single flow worker.

pub mod document;
pub mod mongodb;

use crate::core::flow::FlowKey;
use crate::core::packet::PacketInfo;
use crate::protocols::document::Document;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message length {length} (maximum {max})")]
    InvalidMessageLength { length: i64, max: usize },

    #[error("Truncated {what}: need {needed} bytes, have {have}")]
    Truncated {
        what: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("Invalid BSON: {0}")]
    InvalidBson(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// One client request decoded from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    /// Request identifier from the message header
    pub request_id: i32,
    /// Wire operation name
    pub op: &'static str,
    /// Command name, when the request is a command
    pub command: Option<String>,
    pub database: Option<String>,
    pub collection: Option<String>,
    /// Query document to be shaped
    pub document: Document,
}

/// A decoded request together with its shape
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedQuery {
    /// Name of the decoder that produced the event
    pub protocol: &'static str,
    /// Canonical query shape
    pub shape: String,
    pub event: QueryEvent,
}

/// Protocol decoder trait
pub trait ProtocolDecoder: Send {
    /// Protocol name
    fn name(&self) -> &'static str;

    /// Check if this decoder handles the given packet
    fn can_decode(&self, packet: &PacketInfo) -> bool;

    /// Append payload bytes of one stream and decode every complete message
    ///
    /// Bytes of an incomplete message stay buffered until the next call.
    fn feed(&mut self, stream: &FlowKey, data: &[u8]) -> Vec<Result<QueryEvent, ProtocolError>>;

    /// Discard buffered bytes after a gap in the stream
    fn reset_stream(&mut self, stream: &FlowKey);

    /// Forget a stream that has been closed
    fn end_stream(&mut self, stream: &FlowKey);

    /// Drop streams idle for longer than `idle`, returning how many were dropped
    fn evict_idle(&mut self, idle: Duration) -> usize;

    /// Number of streams with buffered state
    fn stream_count(&self) -> usize;

    /// Canonical shape of a query document
    fn query_shape(&self, document: &Document) -> String;
}

/// Protocol decoder registry
#[derive(Default)]
pub struct ProtocolDecoderRegistry {
    decoders: Vec<Box<dyn ProtocolDecoder>>,
}

impl ProtocolDecoderRegistry {
    /// Create a new protocol decoder registry
    pub fn new() -> Self {
        Self {
            decoders: Vec::new(),
        }
    }

    /// Register a protocol decoder
    pub fn register(&mut self, decoder: Box<dyn ProtocolDecoder>) {
        self.decoders.push(decoder);
    }

    /// Names of the registered decoders
    pub fn names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    /// Decode a packet with every decoder that accepts it
    pub fn decode_packet(&mut self, stream: &FlowKey, packet: &PacketInfo) -> Vec<Result<ShapedQuery, ProtocolError>> {
        let mut results: Vec<Result<ShapedQuery, ProtocolError>> = Vec::new();

        for decoder in self.decoders.iter_mut() {
            if !decoder.can_decode(packet) {
                // A server FIN or RST ends the request stream as well
                if packet.closes_stream() {
                    decoder.end_stream(&stream.reversed());
                }
                continue;
            }

            if packet.truncated {
                // A partial segment leaves a hole the framing cannot recover from
                decoder.reset_stream(stream);
            } else if !packet.payload.is_empty() {
                let protocol: &'static str = decoder.name();
                for result in decoder.feed(stream, &packet.payload) {
                    results.push(result.map(|event: QueryEvent| ShapedQuery {
                        protocol,
                        shape: decoder.query_shape(&event.document),
                        event,
                    }));
                }
            }

            if packet.closes_stream() {
                decoder.end_stream(stream);
            }
        }

        results
    }

    /// Drop idle streams in every decoder
    pub fn evict_idle(&mut self, idle: Duration) -> usize {
        self.decoders.iter_mut().map(|d| d.evict_idle(idle)).sum()
    }

    /// Streams with buffered state across all decoders
    pub fn stream_count(&self) -> usize {
        self.decoders.iter().map(|d| d.stream_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{TCP_ACK, TCP_FIN, TCP_RST};
    use crate::protocols::document::Scalar;
    use std::collections::HashMap;
    use std::time::SystemTime;

    /// Emits one event per newline-terminated line
    #[derive(Default)]
    struct LineDecoder {
        buffers: HashMap<FlowKey, Vec<u8>>,
    }

    impl ProtocolDecoder for LineDecoder {
        fn name(&self) -> &'static str {
            "lines"
        }

        fn can_decode(&self, packet: &PacketInfo) -> bool {
            packet.dst_port == Some(7000)
        }

        fn feed(&mut self, stream: &FlowKey, data: &[u8]) -> Vec<Result<QueryEvent, ProtocolError>> {
            let buffer: &mut Vec<u8> = self.buffers.entry(*stream).or_default();
            buffer.extend_from_slice(data);
            let mut events: Vec<Result<QueryEvent, ProtocolError>> = Vec::new();
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                events.push(Ok(QueryEvent {
                    request_id: events.len() as i32,
                    op: "line",
                    command: None,
                    database: None,
                    collection: None,
                    document: Document::Scalar(Scalar::String(
                        String::from_utf8_lossy(&line).into_owned(),
                    )),
                }));
            }
            events
        }

        fn reset_stream(&mut self, stream: &FlowKey) {
            if let Some(buffer) = self.buffers.get_mut(stream) {
                buffer.clear();
            }
        }

        fn end_stream(&mut self, stream: &FlowKey) {
            self.buffers.remove(stream);
        }

        fn evict_idle(&mut self, _idle: Duration) -> usize {
            let count: usize = self.buffers.len();
            self.buffers.clear();
            count
        }

        fn stream_count(&self) -> usize {
            self.buffers.len()
        }

        fn query_shape(&self, _document: &Document) -> String {
            "1".to_string()
        }
    }

    fn packet(dst_port: u16, flags: u8, payload: &[u8]) -> PacketInfo {
        PacketInfo {
            src_ip: Some("10.0.0.5".parse().unwrap()),
            dst_ip: Some("10.0.0.9".parse().unwrap()),
            src_port: Some(51000),
            dst_port: Some(dst_port),
            tcp_flags: Some(flags),
            truncated: false,
            timestamp: SystemTime::UNIX_EPOCH,
            payload: payload.to_vec(),
        }
    }

    fn registry() -> ProtocolDecoderRegistry {
        let mut registry: ProtocolDecoderRegistry = ProtocolDecoderRegistry::new();
        registry.register(Box::new(LineDecoder::default()));
        registry
    }

    #[test]
    fn test_decode_across_packets() {
        let mut registry: ProtocolDecoderRegistry = registry();
        let first: PacketInfo = packet(7000, TCP_ACK, b"fir");
        let key: FlowKey = FlowKey::from_packet(&first).unwrap();

        assert!(registry.decode_packet(&key, &first).is_empty());
        assert_eq!(registry.stream_count(), 1);

        let results = registry.decode_packet(&key, &packet(7000, TCP_ACK, b"st\nsecond\n"));
        assert_eq!(results.len(), 2);
        let query: &ShapedQuery = results[0].as_ref().unwrap();
        assert_eq!(query.protocol, "lines");
        assert_eq!(query.shape, "1");
        assert_eq!(query.event.document.as_str(), Some("first\n"));
    }

    #[test]
    fn test_other_ports_ignored() {
        let mut registry: ProtocolDecoderRegistry = registry();
        let other: PacketInfo = packet(8080, TCP_ACK, b"line\n");
        let key: FlowKey = FlowKey::from_packet(&other).unwrap();
        assert!(registry.decode_packet(&key, &other).is_empty());
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_truncated_packet_resets_stream() {
        let mut registry: ProtocolDecoderRegistry = registry();
        let first: PacketInfo = packet(7000, TCP_ACK, b"partial");
        let key: FlowKey = FlowKey::from_packet(&first).unwrap();
        registry.decode_packet(&key, &first);

        let mut cut: PacketInfo = packet(7000, TCP_ACK, b" more\n");
        cut.truncated = true;
        assert!(registry.decode_packet(&key, &cut).is_empty());

        let results = registry.decode_packet(&key, &packet(7000, TCP_ACK, b"next\n"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().event.document.as_str(), Some("next\n"));
    }

    #[test]
    fn test_server_close_ends_request_stream() {
        let mut registry: ProtocolDecoderRegistry = registry();
        let request: PacketInfo = packet(7000, TCP_ACK, b"unfinished");
        let key: FlowKey = FlowKey::from_packet(&request).unwrap();
        registry.decode_packet(&key, &request);
        assert_eq!(registry.stream_count(), 1);

        let reset: PacketInfo = PacketInfo {
            src_ip: request.dst_ip,
            dst_ip: request.src_ip,
            src_port: request.dst_port,
            dst_port: request.src_port,
            tcp_flags: Some(TCP_RST),
            truncated: false,
            timestamp: SystemTime::UNIX_EPOCH,
            payload: Vec::new(),
        };
        let reply_key: FlowKey = FlowKey::from_packet(&reset).unwrap();
        assert_eq!(reply_key, key.reversed());

        assert!(registry.decode_packet(&reply_key, &reset).is_empty());
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_fin_ends_stream() {
        let mut registry: ProtocolDecoderRegistry = registry();
        let last: PacketInfo = packet(7000, TCP_FIN | TCP_ACK, b"bye\nleft");
        let key: FlowKey = FlowKey::from_packet(&last).unwrap();

        assert_eq!(registry.decode_packet(&key, &last).len(), 1);
        assert_eq!(registry.stream_count(), 0);
        assert_eq!(registry.names(), vec!["lines"]);
    }
}
