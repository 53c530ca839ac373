use std::collections::HashMap;

/// A field value as decoded off the wire.
///
/// Mirrors the MessagePack value universe this system actually consumes.
/// Values the wire carries outside this set (booleans, nil, arrays,
/// extension types) are dropped at the decode boundary with a warning
/// rather than represented here — see `wire::value_to_field`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bytes(Vec<u8>),
    String(String),
    Int(i64),
    Float(f64),
    Map(FieldMap),
}

impl FieldValue {
    /// Byte view of this value if it is a `Bytes` or `String` variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

pub type FieldMap = HashMap<String, FieldValue>;

/// The fundamental unit flowing through the pipeline.
///
/// `id` is unset (`None`) until the record is stamped on its way into the
/// downstream send channel; from that point it is strictly increasing
/// across the lifetime of one receiver instance.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub tag: String,
    pub fields: FieldMap,
    pub id: Option<u64>,
}

impl Record {
    pub fn new(tag: String, fields: FieldMap) -> Self {
        Record {
            tag,
            fields,
            id: None,
        }
    }

    /// Reset this record to an empty, tag-less state so it can be reused
    /// from a pool. Callers must not retain the old `tag`/`fields`.
    pub fn reset(&mut self) {
        self.tag.clear();
        self.fields.clear();
        self.id = None;
    }
}
