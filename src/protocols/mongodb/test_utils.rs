//! BSON and wire message builders shared by the MongoDB tests

use crate::protocols::document::{Document, Scalar};

pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;
pub const OP_REPLY: i32 = 1;

/// Order in which map keys are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    Sorted,
    Reversed,
}

/// Encode a map document; keys are written in sorted order
pub fn encode_document(document: &Document) -> Vec<u8> {
    encode_document_in(document, KeyOrder::Sorted)
}

/// Encode a map document, writing the keys of every nested map in `order`
pub fn encode_document_in(document: &Document, order: KeyOrder) -> Vec<u8> {
    match document {
        Document::Map(entries) => {
            let mut keyed: Vec<(&str, &Document)> = entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
            if order == KeyOrder::Reversed {
                keyed.reverse();
            }
            encode_entries(keyed.into_iter(), order)
        }
        other => panic!("only maps encode as documents, got {:?}", other),
    }
}

/// Encode a document with its keys in the given order
pub fn ordered_document(entries: Vec<(&str, Document)>) -> Vec<u8> {
    encode_entries(entries.iter().map(|(k, v)| (*k, v)), KeyOrder::Sorted)
}

fn encode_entries<'a>(entries: impl Iterator<Item = (&'a str, &'a Document)>, order: KeyOrder) -> Vec<u8> {
    let mut body: Vec<u8> = Vec::new();
    for (key, value) in entries {
        encode_element(&mut body, key, value, order);
    }
    let mut out: Vec<u8> = ((body.len() + 5) as i32).to_le_bytes().to_vec();
    out.extend_from_slice(&body);
    out.push(0);
    out
}

fn push_cstring(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn push_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&((value.len() + 1) as i32).to_le_bytes());
    push_cstring(out, value);
}

fn encode_element(out: &mut Vec<u8>, key: &str, value: &Document, order: KeyOrder) {
    let tag: u8 = match value {
        Document::Map(_) => 0x03,
        Document::List(_) => 0x04,
        Document::Opaque(tag) => panic!("opaque value {:#04x} cannot be encoded", tag),
        Document::Scalar(scalar) => match scalar {
            Scalar::Double(_) => 0x01,
            Scalar::String(_) => 0x02,
            Scalar::Binary { .. } => 0x05,
            Scalar::Undefined => 0x06,
            Scalar::ObjectId(_) => 0x07,
            Scalar::Bool(_) => 0x08,
            Scalar::DateTime(_) => 0x09,
            Scalar::Null => 0x0A,
            Scalar::Regex { .. } => 0x0B,
            Scalar::JavaScript(_) => 0x0D,
            Scalar::Symbol(_) => 0x0E,
            Scalar::Int32(_) => 0x10,
            Scalar::Timestamp(_) => 0x11,
            Scalar::Int64(_) => 0x12,
            Scalar::Decimal128(_) => 0x13,
            Scalar::MinKey => 0xFF,
            Scalar::MaxKey => 0x7F,
        },
    };
    out.push(tag);
    push_cstring(out, key);

    match value {
        Document::Map(_) => out.extend_from_slice(&encode_document_in(value, order)),
        Document::List(items) => {
            let keys: Vec<String> = (0..items.len()).map(|i| i.to_string()).collect();
            out.extend_from_slice(&encode_entries(keys.iter().map(String::as_str).zip(items.iter()), order));
        }
        Document::Opaque(_) => {}
        Document::Scalar(scalar) => match scalar {
            Scalar::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::String(v) | Scalar::JavaScript(v) | Scalar::Symbol(v) => push_string(out, v),
            Scalar::Binary { subtype, bytes } => {
                out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                out.push(*subtype);
                out.extend_from_slice(bytes);
            }
            Scalar::ObjectId(v) => out.extend_from_slice(v),
            Scalar::Bool(v) => out.push(*v as u8),
            Scalar::DateTime(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::Regex { pattern, options } => {
                push_cstring(out, pattern);
                push_cstring(out, options);
            }
            Scalar::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::Timestamp(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Scalar::Decimal128(v) => out.extend_from_slice(v),
            Scalar::Undefined | Scalar::Null | Scalar::MinKey | Scalar::MaxKey => {}
        },
    }
}

/// Wrap a body in a message header
pub fn message(request_id: i32, op_code: i32, body: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = ((body.len() + 16) as i32).to_le_bytes().to_vec();
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&op_code.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// OP_MSG with a single body section
pub fn op_msg(request_id: i32, body: &[u8]) -> Vec<u8> {
    let mut sections: Vec<u8> = 0u32.to_le_bytes().to_vec();
    sections.push(0);
    sections.extend_from_slice(body);
    message(request_id, OP_MSG, &sections)
}

/// OP_MSG with the checksum flag set and a trailing checksum
pub fn op_msg_with_checksum(request_id: i32, body: &[u8]) -> Vec<u8> {
    let mut sections: Vec<u8> = 1u32.to_le_bytes().to_vec();
    sections.push(0);
    sections.extend_from_slice(body);
    sections.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    message(request_id, OP_MSG, &sections)
}

/// OP_MSG with a body section followed by one document sequence
pub fn op_msg_with_sequence(request_id: i32, body: &[u8], identifier: &str, documents: &[Vec<u8>]) -> Vec<u8> {
    let mut sequence: Vec<u8> = Vec::new();
    push_cstring(&mut sequence, identifier);
    for document in documents {
        sequence.extend_from_slice(document);
    }

    let mut sections: Vec<u8> = 0u32.to_le_bytes().to_vec();
    sections.push(0);
    sections.extend_from_slice(body);
    sections.push(1);
    sections.extend_from_slice(&((sequence.len() + 4) as i32).to_le_bytes());
    sections.extend_from_slice(&sequence);
    message(request_id, OP_MSG, &sections)
}

/// Legacy OP_QUERY against `namespace`
pub fn op_query(request_id: i32, namespace: &str, query: &[u8]) -> Vec<u8> {
    let mut body: Vec<u8> = 0i32.to_le_bytes().to_vec();
    push_cstring(&mut body, namespace);
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(query);
    message(request_id, OP_QUERY, &body)
}

/// `find` command body against database `shop`
pub fn find_command(collection: &str, filter: Document) -> Vec<u8> {
    ordered_document(vec![
        ("find", Document::Scalar(Scalar::String(collection.to_string()))),
        ("filter", filter),
        ("$db", Document::Scalar(Scalar::String("shop".to_string()))),
    ])
}
