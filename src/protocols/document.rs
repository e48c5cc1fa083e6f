//! Document model for decoded queries
//!
//! Protocol decoders produce query documents as a recursive tree of scalars,
//! lists and maps. Consumers never mutate a document in place.

use std::collections::BTreeMap;

/// Primitive values carried by a document
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Undefined,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    /// Binary blob with its BSON subtype
    Binary { subtype: u8, bytes: Vec<u8> },
    ObjectId([u8; 12]),
    /// Milliseconds since the Unix epoch
    DateTime(i64),
    Timestamp(u64),
    Regex { pattern: String, options: String },
    JavaScript(String),
    Symbol(String),
    Decimal128([u8; 16]),
    MinKey,
    MaxKey,
}

/// A semi-structured document value
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Primitive value
    Scalar(Scalar),
    /// Ordered list of values
    List(Vec<Document>),
    /// Mapping from unique, case-sensitive keys to values
    Map(BTreeMap<String, Document>),
    /// Value kind the decoder does not model structurally, kept by type tag
    Opaque(u8),
}

impl Document {
    /// Create an empty map document
    pub fn map() -> Self {
        Document::Map(BTreeMap::new())
    }

    /// Look up a key if this value is a map
    pub fn get(&self, key: &str) -> Option<&Document> {
        match self {
            Document::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Borrow the string if this value is a string scalar
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Document::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl From<Scalar> for Document {
    fn from(scalar: Scalar) -> Self {
        Document::Scalar(scalar)
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Document::Scalar(Scalar::Null),
            Value::Bool(b) => Document::Scalar(Scalar::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Document::Scalar(Scalar::Int64(i)),
                None => Document::Scalar(Scalar::Double(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Document::Scalar(Scalar::String(s)),
            Value::Array(items) => Document::List(items.into_iter().map(Document::from).collect()),
            Value::Object(entries) => Document::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Document::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let doc: Document = Document::from(json!({
            "name": "bob",
            "age": 30,
            "ratio": 0.5,
            "tags": ["a", null, true],
        }));

        assert_eq!(doc.get("name").and_then(Document::as_str), Some("bob"));
        assert_eq!(doc.get("age"), Some(&Document::Scalar(Scalar::Int64(30))));
        assert_eq!(doc.get("ratio"), Some(&Document::Scalar(Scalar::Double(0.5))));
        assert_eq!(
            doc.get("tags"),
            Some(&Document::List(vec![
                Document::Scalar(Scalar::String("a".to_string())),
                Document::Scalar(Scalar::Null),
                Document::Scalar(Scalar::Bool(true)),
            ]))
        );
    }

    #[test]
    fn test_get_on_non_map() {
        assert_eq!(Document::List(Vec::new()).get("a"), None);
        assert_eq!(Document::Scalar(Scalar::Null).as_str(), None);
    }
}
