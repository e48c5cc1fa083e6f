//! MongoDB wire protocol decoder
//!
//! This module reassembles client requests from per-flow byte streams and
//! extracts the query document of every OP_MSG and OP_QUERY message.

pub mod bson;
pub mod shape;
#[cfg(test)]
pub mod test_utils;

use crate::core::flow::FlowKey;
use crate::core::packet::PacketInfo;
use crate::protocols::document::Document;
use crate::protocols::mongodb::bson::{read_cstring, read_document, ParsedDocument};
use crate::protocols::{ProtocolDecoder, ProtocolError, QueryEvent};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

pub const DEFAULT_PORT: u16 = 27017;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Message header: length, request id, response to, op code
const HEADER_LEN: usize = 16;

/// OP_MSG flag bits
const CHECKSUM_PRESENT: u32 = 1 << 0;
const MORE_TO_COME: u32 = 1 << 1;
/// Low 16 bits are required; unknown ones must be rejected
const REQUIRED_FLAGS_MASK: u32 = 0xFFFF;

/// Namespace suffix of command queries
const COMMAND_COLLECTION: &str = "$cmd";

/// Wire protocol operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Compressed,
    Msg,
    Other(i32),
}

impl From<i32> for OpCode {
    fn from(code: i32) -> Self {
        match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2012 => OpCode::Compressed,
            2013 => OpCode::Msg,
            other => OpCode::Other(other),
        }
    }
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Update => "OP_UPDATE",
            OpCode::Insert => "OP_INSERT",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::Delete => "OP_DELETE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
            OpCode::Compressed => "OP_COMPRESSED",
            OpCode::Msg => "OP_MSG",
            OpCode::Other(_) => "OP_UNKNOWN",
        }
    }
}

/// Bytes of one client stream not yet framed into messages
struct StreamBuffer {
    data: Vec<u8>,
    last_seen: Instant,
}

/// Decoder for client to server MongoDB traffic
pub struct MongoDecoder {
    /// Server port
    port: u16,
    /// Largest message accepted
    max_message_size: usize,
    /// Buffered bytes per client stream
    streams: HashMap<FlowKey, StreamBuffer>,
}

impl MongoDecoder {
    pub fn new(port: u16, max_message_size: usize) -> Self {
        Self {
            port,
            max_message_size,
            streams: HashMap::new(),
        }
    }
}

impl Default for MongoDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl ProtocolDecoder for MongoDecoder {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn can_decode(&self, packet: &PacketInfo) -> bool {
        packet.dst_port == Some(self.port)
    }

    fn feed(&mut self, stream: &FlowKey, data: &[u8]) -> Vec<Result<QueryEvent, ProtocolError>> {
        let max_message_size: usize = self.max_message_size;
        let buffer: &mut StreamBuffer = self.streams.entry(*stream).or_insert_with(|| StreamBuffer {
            data: Vec::new(),
            last_seen: Instant::now(),
        });
        buffer.last_seen = Instant::now();
        buffer.data.extend_from_slice(data);

        let mut events: Vec<Result<QueryEvent, ProtocolError>> = Vec::new();
        let mut consumed: usize = 0;
        let mut desynchronized: bool = false;

        loop {
            let pending: &[u8] = &buffer.data[consumed..];
            if pending.len() < 4 {
                break;
            }

            let length: i64 = i32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]) as i64;
            if length < HEADER_LEN as i64 || length > max_message_size as i64 {
                events.push(Err(ProtocolError::InvalidMessageLength {
                    length,
                    max: max_message_size,
                }));
                desynchronized = true;
                break;
            }

            let length: usize = length as usize;
            if pending.len() < length {
                break;
            }

            match decode_message(&pending[..length]) {
                Ok(Some(event)) => events.push(Ok(event)),
                Ok(None) => {}
                Err(e) => events.push(Err(e)),
            }
            consumed += length;
        }

        if desynchronized {
            // Message boundaries are lost for the rest of the stream
            trace!(flow = %stream, "Discarding stream buffer");
            buffer.data.clear();
        } else {
            buffer.data.drain(..consumed);
        }

        events
    }

    fn reset_stream(&mut self, stream: &FlowKey) {
        if let Some(buffer) = self.streams.get_mut(stream) {
            buffer.data.clear();
        }
    }

    fn end_stream(&mut self, stream: &FlowKey) {
        self.streams.remove(stream);
    }

    fn evict_idle(&mut self, idle: Duration) -> usize {
        let before: usize = self.streams.len();
        self.streams.retain(|_, buffer| buffer.last_seen.elapsed() <= idle);
        before - self.streams.len()
    }

    fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn query_shape(&self, document: &Document) -> String {
        shape::query_shape(document)
    }
}

fn read_i32(data: &[u8], offset: usize, what: &'static str) -> Result<i32, ProtocolError> {
    match data.get(offset..offset + 4) {
        Some(bytes) => Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(ProtocolError::Truncated {
            what,
            needed: offset + 4,
            have: data.len(),
        }),
    }
}

/// Decode one complete message; requests without a query yield `None`
fn decode_message(message: &[u8]) -> Result<Option<QueryEvent>, ProtocolError> {
    let request_id: i32 = read_i32(message, 4, "message header")?;
    let op_code: OpCode = OpCode::from(read_i32(message, 12, "message header")?);
    let body: &[u8] = &message[HEADER_LEN..];

    match op_code {
        OpCode::Msg => decode_op_msg(request_id, body).map(Some),
        OpCode::Query => decode_op_query(request_id, body).map(Some),
        other => {
            trace!(op = other.name(), request_id, "Skipping message without a query");
            Ok(None)
        }
    }
}

fn decode_op_msg(request_id: i32, body: &[u8]) -> Result<QueryEvent, ProtocolError> {
    let flags: u32 = read_i32(body, 0, "OP_MSG flags")? as u32;
    let unknown: u32 = flags & REQUIRED_FLAGS_MASK & !(CHECKSUM_PRESENT | MORE_TO_COME);
    if unknown != 0 {
        return Err(ProtocolError::Malformed(format!("unknown required OP_MSG flags {:#x}", unknown)));
    }

    let mut end: usize = body.len();
    if flags & CHECKSUM_PRESENT != 0 {
        if end < 8 {
            return Err(ProtocolError::Truncated {
                what: "OP_MSG checksum",
                needed: 8,
                have: end,
            });
        }
        end -= 4;
    }

    let sections: &[u8] = &body[4..end];
    let mut main: Option<ParsedDocument> = None;
    let mut sequences: Vec<(String, Vec<Document>)> = Vec::new();
    let mut pos: usize = 0;

    while pos < sections.len() {
        let kind: u8 = sections[pos];
        pos += 1;
        match kind {
            0 => {
                let parsed: ParsedDocument = read_document(&sections[pos..])?;
                pos += parsed.len;
                if main.replace(parsed).is_some() {
                    return Err(ProtocolError::Malformed("more than one body section".to_string()));
                }
            }
            1 => {
                let size: i32 = read_i32(sections, pos, "document sequence")?;
                if size < 4 || pos + size as usize > sections.len() {
                    return Err(ProtocolError::Malformed(format!("document sequence size {}", size)));
                }
                let section: &[u8] = &sections[pos + 4..pos + size as usize];
                pos += size as usize;

                let (identifier, mut offset) = read_cstring(section)?;
                let mut documents: Vec<Document> = Vec::new();
                while offset < section.len() {
                    let parsed: ParsedDocument = read_document(&section[offset..])?;
                    offset += parsed.len;
                    documents.push(parsed.document);
                }
                sequences.push((identifier, documents));
            }
            other => {
                return Err(ProtocolError::Malformed(format!("unknown OP_MSG section kind {}", other)));
            }
        }
    }

    let parsed: ParsedDocument =
        main.ok_or_else(|| ProtocolError::Malformed("OP_MSG without a body section".to_string()))?;
    let mut document: Document = parsed.document;
    if let Document::Map(entries) = &mut document {
        for (identifier, documents) in sequences {
            entries.insert(identifier, Document::List(documents));
        }
    }

    let command: Option<String> = parsed.first_key;
    let database: Option<String> = document.get("$db").and_then(Document::as_str).map(str::to_string);
    let collection: Option<String> = command
        .as_deref()
        .and_then(|name| document.get(name))
        .and_then(Document::as_str)
        .map(str::to_string);

    Ok(QueryEvent {
        request_id,
        op: OpCode::Msg.name(),
        command,
        database,
        collection,
        document,
    })
}

fn decode_op_query(request_id: i32, body: &[u8]) -> Result<QueryEvent, ProtocolError> {
    // Flags precede the namespace
    read_i32(body, 0, "OP_QUERY flags")?;
    let (namespace, ns_len) = read_cstring(&body[4..])?;
    let offset: usize = 4 + ns_len;
    // Skip and return counts
    read_i32(body, offset + 4, "OP_QUERY counts")?;
    let parsed: ParsedDocument = read_document(&body[offset + 8..])?;

    let (database, collection) = match namespace.split_once('.') {
        Some((database, collection)) => (database.to_string(), collection.to_string()),
        None => (namespace.clone(), String::new()),
    };

    let (command, collection) = if collection == COMMAND_COLLECTION {
        let command: Option<String> = parsed.first_key.filter(|key| !key.starts_with('$'));
        let target: Option<String> = command
            .as_deref()
            .and_then(|name| parsed.document.get(name))
            .and_then(Document::as_str)
            .map(str::to_string);
        (command, target)
    } else if collection.is_empty() {
        (None, None)
    } else {
        (None, Some(collection))
    };

    Ok(QueryEvent {
        request_id,
        op: OpCode::Query.name(),
        command,
        database: Some(database),
        collection,
        document: parsed.document,
    })
}
