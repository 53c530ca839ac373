//! The filter contract every pipeline stage satisfies, plus the one
//! concrete post-filter the data model's invariants depend on.

use concat_protocol::{FieldValue, Record};
use tracing::warn;

/// A single stage in a tag's filter pipeline.
///
/// Returning `None` discards the record; the caller is responsible for
/// recycling it via [`crate::pool::RecordPool`].
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn filter(&self, record: Record) -> Option<Record>;
}

/// Rewrites field keys containing `.` to `__`, drops empty-string keys,
/// normalizes byte-sequence values to strings, and truncates any
/// string/byte-sequence value longer than `max_len`.
///
/// `max_len == 0` disables truncation. A configured `max_len` between 1
/// and 99 is almost certainly a misconfiguration (it would mangle most
/// real log lines) and is logged at warn level but still honored.
pub struct KeyNormalizeFilter {
    max_len: usize,
}

impl KeyNormalizeFilter {
    pub fn new(max_len: usize) -> Self {
        if max_len > 0 && max_len < 100 {
            warn!(max_len, "key_normalize_filter: max_len is suspiciously small");
        }
        KeyNormalizeFilter { max_len }
    }

    fn normalize_value(&self, value: FieldValue) -> FieldValue {
        match value {
            FieldValue::Bytes(b) => {
                let s = String::from_utf8_lossy(&b).into_owned();
                self.truncate(FieldValue::String(s))
            }
            FieldValue::String(_) => self.truncate(value),
            other => other,
        }
    }

    fn truncate(&self, value: FieldValue) -> FieldValue {
        if self.max_len == 0 {
            return value;
        }
        match value {
            FieldValue::String(mut s) => {
                if s.len() > self.max_len {
                    let mut cut = self.max_len;
                    while cut > 0 && !s.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    s.truncate(cut);
                }
                FieldValue::String(s)
            }
            other => other,
        }
    }
}

impl Filter for KeyNormalizeFilter {
    fn name(&self) -> &str {
        "key_normalize"
    }

    fn filter(&self, mut record: Record) -> Option<Record> {
        let entries: Vec<(String, FieldValue)> = record.fields.drain().collect();
        for (key, value) in entries {
            if key.is_empty() {
                continue;
            }
            let key = key.replace('.', "__");
            record.fields.insert(key, self.normalize_value(value));
        }
        Some(record)
    }
}

/// Demonstrates the [`Filter`] contract for an acceptor-side filter:
/// drops records whose body matches an ignore pattern, and stamps the
/// rest with a fixed identifier field. Not wired into any pipeline by
/// default; implementors live outside this crate.
pub struct SparkFilter {
    ignore: regex::Regex,
    identifier_key: String,
    identifier: String,
}

impl SparkFilter {
    pub fn new(ignore_pattern: &str, identifier_key: String, identifier: String) -> Result<Self, regex::Error> {
        Ok(SparkFilter {
            ignore: regex::Regex::new(ignore_pattern)?,
            identifier_key,
            identifier,
        })
    }
}

impl Filter for SparkFilter {
    fn name(&self) -> &str {
        "spark"
    }

    fn filter(&self, mut record: Record) -> Option<Record> {
        let body_matches_ignore = record
            .fields
            .get("log")
            .and_then(FieldValue::as_bytes)
            .is_some_and(|b| self.ignore.is_match(&String::from_utf8_lossy(b)));
        if body_matches_ignore {
            return None;
        }
        record
            .fields
            .insert(self.identifier_key.clone(), FieldValue::String(self.identifier.clone()));
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concat_protocol::FieldMap;

    #[test]
    fn key_normalize_rewrites_dots_and_drops_empty_keys() {
        let mut fields = FieldMap::new();
        fields.insert("a.b.c".to_owned(), FieldValue::String("x".into()));
        fields.insert(String::new(), FieldValue::String("gone".into()));
        let record = Record::new("t".to_owned(), fields);

        let filter = KeyNormalizeFilter::new(0);
        let out = filter.filter(record).expect("not discarded");
        assert_eq!(out.fields.get("a__b__c"), Some(&FieldValue::String("x".into())));
        assert_eq!(out.fields.len(), 1);
    }

    #[test]
    fn key_normalize_truncates_long_values() {
        let mut fields = FieldMap::new();
        fields.insert("log".to_owned(), FieldValue::String("x".repeat(500)));
        let record = Record::new("t".to_owned(), fields);

        let filter = KeyNormalizeFilter::new(100);
        let out = filter.filter(record).unwrap();
        match out.fields.get("log").unwrap() {
            FieldValue::String(s) => assert_eq!(s.len(), 100),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn key_normalize_converts_bytes_to_string() {
        let mut fields = FieldMap::new();
        fields.insert("log".to_owned(), FieldValue::Bytes(b"hi".to_vec()));
        let record = Record::new("t".to_owned(), fields);

        let filter = KeyNormalizeFilter::new(0);
        let out = filter.filter(record).unwrap();
        assert_eq!(out.fields.get("log"), Some(&FieldValue::String("hi".into())));
    }

    #[test]
    fn spark_filter_drops_matching_bodies() {
        let filter = SparkFilter::new("^DEBUG", "id".to_owned(), "spark-1".to_owned()).unwrap();
        let mut fields = FieldMap::new();
        fields.insert("log".to_owned(), FieldValue::String("DEBUG noisy".into()));
        let record = Record::new("t".to_owned(), fields);
        assert!(filter.filter(record).is_none());
    }

    #[test]
    fn spark_filter_stamps_identifier_otherwise() {
        let filter = SparkFilter::new("^DEBUG", "id".to_owned(), "spark-1".to_owned()).unwrap();
        let mut fields = FieldMap::new();
        fields.insert("log".to_owned(), FieldValue::String("ERROR boom".into()));
        let record = Record::new("t".to_owned(), fields);
        let out = filter.filter(record).unwrap();
        assert_eq!(out.fields.get("id"), Some(&FieldValue::String("spark-1".into())));
    }
}
