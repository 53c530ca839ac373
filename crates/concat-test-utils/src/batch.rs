//! MessagePack batch-fixture builder: constructs raw wire bytes for the
//! frame shapes the decoder understands, so tests don't hand-roll `rmpv`
//! trees inline.

use concat_protocol::FieldValue;
use rmpv::Value;

fn field_to_value(v: &FieldValue) -> Value {
    match v {
        FieldValue::Bytes(b) => Value::Binary(b.clone()),
        FieldValue::String(s) => Value::from(s.clone()),
        FieldValue::Int(i) => Value::from(*i),
        FieldValue::Float(f) => Value::from(*f),
        FieldValue::Map(m) => Value::Map(
            m.iter()
                .map(|(k, v)| (Value::from(k.clone()), field_to_value(v)))
                .collect(),
        ),
    }
}

fn fields_map(fields: &[(&str, FieldValue)]) -> Value {
    Value::Map(
        fields
            .iter()
            .map(|(k, v)| (Value::from(*k), field_to_value(v)))
            .collect(),
    )
}

/// `[tag, [[ts, fields], ...]]` -- the common array-of-entries shape.
pub fn array_batch(tag: &str, entries: &[(i64, &[(&str, FieldValue)])]) -> Vec<u8> {
    let inner: Vec<Value> = entries
        .iter()
        .map(|(ts, fields)| Value::Array(vec![Value::from(*ts), fields_map(fields)]))
        .collect();
    let frame = Value::Array(vec![Value::from(tag), Value::Array(inner)]);
    encode(&frame)
}

/// `[tag, <binary blob of concatenated [ts, fields] tuples>]`.
pub fn embedded_batch(tag: &str, entries: &[(i64, &[(&str, FieldValue)])]) -> Vec<u8> {
    let mut inner_bytes = Vec::new();
    for (ts, fields) in entries {
        let entry = Value::Array(vec![Value::from(*ts), fields_map(fields)]);
        rmpv::encode::write_value(&mut inner_bytes, &entry).expect("encode embedded entry");
    }
    let frame = Value::Array(vec![Value::from(tag), Value::Binary(inner_bytes)]);
    encode(&frame)
}

/// `[tag, ts, fields]` -- the length-3 single-map shape.
pub fn single_map_frame(tag: &str, ts: i64, fields: &[(&str, FieldValue)]) -> Vec<u8> {
    let frame = Value::Array(vec![Value::from(tag), Value::from(ts), fields_map(fields)]);
    encode(&frame)
}

fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).expect("encode msgpack frame");
    buf
}
