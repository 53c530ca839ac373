//! Batch decoder: parses framed MessagePack batches off an async byte
//! stream.
//!
//! Frame shape (decision table):
//!
//! - top level: array of length 2 (`[tag, body]`) or 3 (`[tag, ts, body]`).
//! - `body` as an array of `[timestamp, fields]` tuples: one record per entry.
//! - `body` as a byte string: a concatenation of further `[timestamp, fields]`
//!   tuples, decoded recursively until the embedded buffer is exhausted.
//! - length-3 frames whose third element is itself a fields map: one record.
//! - anything else: logged and skipped, the connection stays open.

use std::io::Cursor;

use bytes::BytesMut;
use rmpv::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

use crate::record::{FieldMap, FieldValue, Record};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("stream ended mid-frame")]
    Truncated,
}

/// Decodes a sequence of framed MessagePack batches from any async byte
/// stream — a `TcpStream` in production, an in-memory buffer in tests.
pub struct BatchDecoder<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> BatchDecoder<R> {
    pub fn new(reader: R) -> Self {
        BatchDecoder {
            reader,
            buf: BytesMut::new(),
        }
    }

    /// Read and parse the next top-level frame, yielding zero or more
    /// records. Returns `Ok(None)` on a clean EOF between frames — the
    /// caller should close the connection quietly. Any other error is
    /// fatal to the connection.
    pub async fn next_records(&mut self) -> Result<Option<Vec<Record>>, DecodeError> {
        let value = match self.next_value().await? {
            Some(v) => v,
            None => return Ok(None),
        };
        Ok(Some(parse_frame(value)))
    }

    async fn next_value(&mut self) -> Result<Option<Value>, DecodeError> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        let _ = self.buf.split_to(consumed);
                        return Ok(Some(value));
                    }
                    Err(e) if is_truncated(&e) => {
                        // fall through and read more bytes
                    }
                    Err(e) => return Err(DecodeError::Malformed(e.to_string())),
                }
            }

            let n = self.fill_buf().await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(DecodeError::Truncated);
            }
        }
    }

    async fn fill_buf(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk).await?;
        if n > 0 {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }
}

fn is_truncated(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    let io_err = match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => e,
    };
    io_err.kind() == std::io::ErrorKind::UnexpectedEof
}

fn parse_frame(value: Value) -> Vec<Record> {
    let arr = match value {
        Value::Array(a) => a,
        other => {
            warn!(?other, "discard frame: not an array");
            return Vec::new();
        }
    };

    if arr.len() != 2 && arr.len() != 3 {
        warn!(len = arr.len(), "discard frame: unexpected array length");
        return Vec::new();
    }

    let tag = match tag_from_value(&arr[0]) {
        Some(t) => t,
        None => {
            warn!("discard frame: tag is empty or not bytes/string");
            return Vec::new();
        }
    };

    match arr[1].clone() {
        Value::Array(entries) => entries
            .into_iter()
            .filter_map(|entry| entry_to_record(entry, &tag))
            .collect(),
        Value::Binary(bytes) => decode_embedded(&bytes, &tag),
        _ => {
            if arr.len() == 3 {
                match value_to_fieldmap(arr[2].clone()) {
                    Some(fields) => vec![Record::new(tag, fields)],
                    None => {
                        warn!(tag, "discard frame: third element is not a fields map");
                        Vec::new()
                    }
                }
            } else {
                warn!(tag, "discard frame: unknown body shape");
                Vec::new()
            }
        }
    }
}

/// Decode a buffer of concatenated `[timestamp, fields]` tuples. A
/// structural failure partway through stops processing *this buffer* —
/// it does not abort the connection.
fn decode_embedded(bytes: &[u8], tag: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut cursor = Cursor::new(bytes);

    loop {
        if cursor.position() as usize >= bytes.len() {
            break;
        }
        match rmpv::decode::read_value(&mut cursor) {
            Ok(entry) => match entry_to_record(entry, tag) {
                Some(record) => records.push(record),
                None => warn!(tag, "discard embedded entry: unexpected shape"),
            },
            Err(e) if is_truncated(&e) => break,
            Err(e) => {
                warn!(tag, error = %e, "discard remainder of embedded buffer");
                break;
            }
        }
    }

    records
}

fn entry_to_record(entry: Value, tag: &str) -> Option<Record> {
    let arr = match entry {
        Value::Array(a) if a.len() >= 2 => a,
        _ => return None,
    };
    let fields = value_to_fieldmap(arr.into_iter().nth(1)?)?;
    Some(Record::new(tag.to_string(), fields))
}

fn tag_from_value(value: &Value) -> Option<String> {
    let tag = match value {
        Value::String(s) => s.as_str().map(str::to_owned)?,
        Value::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        _ => return None,
    };
    if tag.is_empty() {
        return None;
    }
    Some(tag)
}

fn value_to_fieldmap(value: Value) -> Option<FieldMap> {
    let entries = match value {
        Value::Map(entries) => entries,
        _ => return None,
    };

    let mut fields = FieldMap::with_capacity(entries.len());
    for (key, val) in entries {
        let key = match key {
            Value::String(s) => match s.into_str() {
                Some(s) => s,
                None => {
                    warn!("discard field: key is not valid utf-8");
                    continue;
                }
            },
            Value::Binary(b) => match String::from_utf8(b) {
                Ok(s) => s,
                Err(_) => {
                    warn!("discard field: binary key is not valid utf-8");
                    continue;
                }
            },
            other => {
                warn!(?other, "discard field: key is not string-like");
                continue;
            }
        };

        match value_to_field(val) {
            Some(field) => {
                fields.insert(key, field);
            }
            None => warn!(key, "discard field: unsupported value type"),
        }
    }

    Some(fields)
}

fn value_to_field(value: Value) -> Option<FieldValue> {
    match value {
        Value::Binary(b) => Some(FieldValue::Bytes(b)),
        Value::String(s) => s.into_str().map(FieldValue::String),
        Value::Integer(i) => i.as_i64().map(FieldValue::Int),
        Value::F32(f) => Some(FieldValue::Float(f64::from(f))),
        Value::F64(f) => Some(FieldValue::Float(f)),
        Value::Map(_) => value_to_fieldmap(value).map(FieldValue::Map),
        // Nil, Boolean, Array, Ext: outside the field-value universe this
        // system consumes. Dropped here rather than widening the enum.
        _ => None,
    }
}
