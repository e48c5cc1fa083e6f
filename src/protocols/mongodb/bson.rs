//! Bounds-checked BSON reader
//!
//! Decodes little-endian BSON documents into [`Document`] trees. Every read
//! is checked against the enclosing document length, so malformed input
//! yields an error instead of reading past the message.

use crate::protocols::document::{Document, Scalar};
use crate::protocols::ProtocolError;

/// Nesting limit for embedded documents and arrays
pub const MAX_DEPTH: usize = 100;

/// Smallest valid document: length prefix and terminator
const MIN_DOCUMENT_LEN: usize = 5;

/// A decoded document and its position in the input
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub document: Document,
    /// First key in wire order
    pub first_key: Option<String>,
    /// Bytes consumed, including the length prefix
    pub len: usize,
}

/// Read one document from the start of `data`
pub fn read_document(data: &[u8]) -> Result<ParsedDocument, ProtocolError> {
    let (entries, len) = read_entries(data, 0)?;
    let first_key: Option<String> = entries.first().map(|(key, _)| key.clone());

    Ok(ParsedDocument {
        document: Document::Map(entries.into_iter().collect()),
        first_key,
        len,
    })
}

/// Read a NUL-terminated string, returning it and the bytes consumed
pub fn read_cstring(data: &[u8]) -> Result<(String, usize), ProtocolError> {
    let end: usize = data
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProtocolError::InvalidBson("unterminated cstring".to_string()))?;
    let value: &str = std::str::from_utf8(&data[..end])
        .map_err(|e| ProtocolError::InvalidBson(format!("cstring is not UTF-8: {}", e)))?;
    Ok((value.to_string(), end + 1))
}

fn read_entries(data: &[u8], depth: usize) -> Result<(Vec<(String, Document)>, usize), ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::InvalidBson(format!(
            "documents nested deeper than {}",
            MAX_DEPTH
        )));
    }
    if data.len() < 4 {
        return Err(ProtocolError::Truncated {
            what: "BSON document",
            needed: MIN_DOCUMENT_LEN,
            have: data.len(),
        });
    }

    let declared: i32 = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if declared < MIN_DOCUMENT_LEN as i32 {
        return Err(ProtocolError::InvalidBson(format!("document length {}", declared)));
    }
    let len: usize = declared as usize;
    if len > data.len() {
        return Err(ProtocolError::Truncated {
            what: "BSON document",
            needed: len,
            have: data.len(),
        });
    }
    if data[len - 1] != 0 {
        return Err(ProtocolError::InvalidBson("missing document terminator".to_string()));
    }

    let mut reader: Reader<'_> = Reader::new(&data[4..len - 1]);
    let mut entries: Vec<(String, Document)> = Vec::new();
    while !reader.is_empty() {
        let tag: u8 = reader.u8("element type")?;
        let key: String = reader.cstring()?;
        let value: Document = read_value(&mut reader, tag, &key, depth)?;
        entries.push((key, value));
    }

    Ok((entries, len))
}

fn read_value(reader: &mut Reader<'_>, tag: u8, key: &str, depth: usize) -> Result<Document, ProtocolError> {
    let scalar: Scalar = match tag {
        0x01 => Scalar::Double(f64::from_le_bytes(reader.array("double")?)),
        0x02 => Scalar::String(reader.string()?),
        0x03 => {
            let (entries, len) = read_entries(reader.rest(), depth + 1)?;
            reader.skip(len, "embedded document")?;
            return Ok(Document::Map(entries.into_iter().collect()));
        }
        0x04 => {
            let (entries, len) = read_entries(reader.rest(), depth + 1)?;
            reader.skip(len, "array")?;
            return Ok(Document::List(entries.into_iter().map(|(_, value)| value).collect()));
        }
        0x05 => {
            let len: i32 = reader.i32("binary length")?;
            if len < 0 {
                return Err(ProtocolError::InvalidBson(format!("binary length {} for {}", len, key)));
            }
            let subtype: u8 = reader.u8("binary subtype")?;
            let bytes: Vec<u8> = reader.take(len as usize, "binary data")?.to_vec();
            Scalar::Binary { subtype, bytes }
        }
        0x06 => Scalar::Undefined,
        0x07 => Scalar::ObjectId(reader.array("object id")?),
        0x08 => match reader.u8("boolean")? {
            0 => Scalar::Bool(false),
            1 => Scalar::Bool(true),
            other => {
                return Err(ProtocolError::InvalidBson(format!("boolean value {} for {}", other, key)));
            }
        },
        0x09 => Scalar::DateTime(i64::from_le_bytes(reader.array("datetime")?)),
        0x0A => Scalar::Null,
        0x0B => {
            let pattern: String = reader.cstring()?;
            let options: String = reader.cstring()?;
            Scalar::Regex { pattern, options }
        }
        0x0C => {
            // DBPointer
            reader.string()?;
            reader.skip(12, "db pointer id")?;
            return Ok(Document::Opaque(tag));
        }
        0x0D => Scalar::JavaScript(reader.string()?),
        0x0E => Scalar::Symbol(reader.string()?),
        0x0F => {
            // Code with scope: the length covers the whole element value
            let len: i32 = reader.i32("code with scope length")?;
            if len < 4 + 5 + MIN_DOCUMENT_LEN as i32 {
                return Err(ProtocolError::InvalidBson(format!("code with scope length {}", len)));
            }
            reader.skip(len as usize - 4, "code with scope")?;
            return Ok(Document::Opaque(tag));
        }
        0x10 => Scalar::Int32(reader.i32("int32")?),
        0x11 => Scalar::Timestamp(u64::from_le_bytes(reader.array("timestamp")?)),
        0x12 => Scalar::Int64(i64::from_le_bytes(reader.array("int64")?)),
        0x13 => Scalar::Decimal128(reader.array("decimal128")?),
        0xFF => Scalar::MinKey,
        0x7F => Scalar::MaxKey,
        other => {
            return Err(ProtocolError::InvalidBson(format!(
                "unknown element type {:#04x} for {}",
                other, key
            )));
        }
    };

    Ok(Document::Scalar(scalar))
}

/// Cursor over the elements of one document
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        let remaining: usize = self.data.len() - self.pos;
        if len > remaining {
            return Err(ProtocolError::InvalidBson(format!(
                "{} needs {} bytes, {} left in document",
                what, len, remaining
            )));
        }
        let slice: &'a [u8] = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize, what: &str) -> Result<(), ProtocolError> {
        self.take(len, what).map(|_| ())
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], ProtocolError> {
        let mut out: [u8; N] = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn i32(&mut self, what: &str) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array(what)?))
    }

    fn cstring(&mut self) -> Result<String, ProtocolError> {
        let (value, len) = read_cstring(self.rest())?;
        self.pos += len;
        Ok(value)
    }

    /// Length-prefixed string including its terminator
    fn string(&mut self) -> Result<String, ProtocolError> {
        let len: i32 = self.i32("string length")?;
        if len < 1 {
            return Err(ProtocolError::InvalidBson(format!("string length {}", len)));
        }
        let bytes: &[u8] = self.take(len as usize, "string")?;
        let (text, terminator) = bytes.split_at(bytes.len() - 1);
        if terminator != [0] {
            return Err(ProtocolError::InvalidBson("unterminated string".to_string()));
        }
        String::from_utf8(text.to_vec())
            .map_err(|e| ProtocolError::InvalidBson(format!("string is not UTF-8: {}", e)))
    }
}
