//! Record publishing for Dredge
//!
//! Shaped queries are handed to a bounded queue and written out as JSON
//! lines by a single writer task. Publishing never blocks the flow workers:
//! when the queue is full the record is dropped and counted.

use crate::core::flow::FlowKey;
use crate::protocols::ShapedQuery;
use crate::utils::metrics::PipelineMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// One shaped query as published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    /// Capture time of the segment that completed the request
    pub timestamp: DateTime<Utc>,
    pub protocol: &'static str,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    /// Wire operation name
    pub op: &'static str,
    pub request_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub query_shape: String,
}

impl QueryRecord {
    /// Build a record for a request sent on the client to server `stream`
    pub fn new(stream: &FlowKey, timestamp: SystemTime, query: ShapedQuery) -> Self {
        Self {
            timestamp: DateTime::<Utc>::from(timestamp),
            protocol: query.protocol,
            client_ip: stream.src_ip,
            client_port: stream.src_port,
            server_ip: stream.dst_ip,
            server_port: stream.dst_port,
            op: query.event.op,
            request_id: query.event.request_id,
            command: query.event.command,
            database: query.event.database,
            collection: query.event.collection,
            query_shape: query.shape,
        }
    }
}

/// Sink for finished records
pub trait Publisher: Send + Sync {
    /// Hand over a record without blocking
    fn publish(&self, record: QueryRecord);
}

/// Publisher backed by a bounded channel
#[derive(Clone)]
pub struct BufferedPublisher {
    sender: mpsc::Sender<QueryRecord>,
    metrics: Arc<PipelineMetrics>,
}

impl BufferedPublisher {
    /// Create a publisher holding at most `capacity` unwritten records
    pub fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> (Self, mpsc::Receiver<QueryRecord>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, metrics }, receiver)
    }
}

impl Publisher for BufferedPublisher {
    fn publish(&self, record: QueryRecord) {
        match self.sender.try_send(record) {
            Ok(()) => self.metrics.record_published(),
            Err(TrySendError::Full(record)) => {
                debug!(request_id = record.request_id, "Publish queue full, dropping record");
                self.metrics.record_publish_drop();
            }
            Err(TrySendError::Closed(_)) => self.metrics.record_publish_drop(),
        }
    }
}

/// Open the record output: an appended file, or stdout when unset
pub async fn open_output(path: Option<&str>) -> io::Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match path {
        Some(path) => {
            let file: tokio::fs::File = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &QueryRecord) -> io::Result<()> {
    let mut line: Vec<u8> = serde_json::to_vec(record)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

/// Write records as JSON lines until every sender is gone
///
/// The writer is flushed whenever the queue runs empty. Returns the number
/// of records written.
pub async fn write_json_lines<W: AsyncWrite + Unpin>(
    mut receiver: mpsc::Receiver<QueryRecord>,
    mut writer: W,
) -> io::Result<u64> {
    let mut written: u64 = 0;

    while let Some(record) = receiver.recv().await {
        write_record(&mut writer, &record).await?;
        written += 1;

        while let Ok(record) = receiver.try_recv() {
            write_record(&mut writer, &record).await?;
            written += 1;
        }
        writer.flush().await?;
    }

    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::document::Document;
    use crate::protocols::QueryEvent;

    fn stream() -> FlowKey {
        FlowKey {
            src_ip: "10.0.0.5".parse().unwrap(),
            src_port: 51000,
            dst_ip: "10.0.0.9".parse().unwrap(),
            dst_port: 27017,
        }
    }

    fn record(request_id: i32) -> QueryRecord {
        let query: ShapedQuery = ShapedQuery {
            protocol: "mongodb",
            shape: r#"{"filter":{"age":1}}"#.to_string(),
            event: QueryEvent {
                request_id,
                op: "OP_MSG",
                command: Some("find".to_string()),
                database: Some("shop".to_string()),
                collection: Some("users".to_string()),
                document: Document::map(),
            },
        };
        QueryRecord::new(&stream(), SystemTime::UNIX_EPOCH, query)
    }

    #[test]
    fn test_record_serialization() {
        let json: serde_json::Value = serde_json::to_value(record(7)).unwrap();
        assert_eq!(json["client_ip"], "10.0.0.5");
        assert_eq!(json["server_port"], 27017);
        assert_eq!(json["command"], "find");
        assert_eq!(json["query_shape"], r#"{"filter":{"age":1}}"#);
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let mut record: QueryRecord = record(1);
        record.collection = None;
        let json: serde_json::Value = serde_json::to_value(record).unwrap();
        assert!(json.get("collection").is_none());
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let metrics: Arc<PipelineMetrics> = Arc::new(PipelineMetrics::new());
        let (publisher, _receiver) = BufferedPublisher::new(2, Arc::clone(&metrics));

        for id in 0..5 {
            publisher.publish(record(id));
        }

        let stats = metrics.snapshot();
        assert_eq!(stats.records_published, 2);
        assert_eq!(stats.publish_drops, 3);
    }

    #[test]
    fn test_closed_queue_drops() {
        let metrics: Arc<PipelineMetrics> = Arc::new(PipelineMetrics::new());
        let (publisher, receiver) = BufferedPublisher::new(4, Arc::clone(&metrics));
        drop(receiver);

        publisher.publish(record(1));
        assert_eq!(metrics.snapshot().publish_drops, 1);
    }

    #[tokio::test]
    async fn test_write_json_lines() {
        let metrics: Arc<PipelineMetrics> = Arc::new(PipelineMetrics::new());
        let (publisher, receiver) = BufferedPublisher::new(8, metrics);
        publisher.publish(record(1));
        publisher.publish(record(2));
        drop(publisher);

        let mut output: Vec<u8> = Vec::new();
        let written: u64 = write_json_lines(receiver, &mut output).await.unwrap();
        assert_eq!(written, 2);

        let text: String = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["request_id"], 2);
    }

    #[tokio::test]
    async fn test_output_file_is_appended() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shapes.jsonl");
        let path_str: &str = path.to_str().unwrap();
        std::fs::write(&path, "existing\n").unwrap();

        let metrics: Arc<PipelineMetrics> = Arc::new(PipelineMetrics::new());
        let (publisher, receiver) = BufferedPublisher::new(8, metrics);
        publisher.publish(record(3));
        drop(publisher);

        let output = open_output(Some(path_str)).await.unwrap();
        write_json_lines(receiver, output).await.unwrap();

        let text: String = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("existing\n"));
        assert_eq!(text.lines().count(), 2);
    }
}
