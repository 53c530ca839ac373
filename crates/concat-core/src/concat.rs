//! Concatenator shard: per-shard stateful multi-line reassembly.
//!
//! One shard owns one `identifier -> PendingEntry` map and a single task;
//! all access is single-threaded by construction (the shard's task is the
//! only thing that ever touches its map), matching the "no separate
//! sweeper task" design note.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use concat_protocol::{FieldValue, Record};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ConcatPolicy;
use crate::downstream::Downstream;
use crate::pool::RecordPool;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct PendingEntry {
    record: Record,
    last_updated_at: Instant,
}

pub struct ConcatShard {
    id: usize,
    policies: Arc<HashMap<String, ConcatPolicy>>,
    pool: Arc<RecordPool>,
    downstream: Arc<Downstream>,
    concat_wait: Duration,
    concat_max_len: usize,
    pending: HashMap<String, PendingEntry>,
}

impl ConcatShard {
    pub fn new(
        id: usize,
        policies: Arc<HashMap<String, ConcatPolicy>>,
        pool: Arc<RecordPool>,
        downstream: Arc<Downstream>,
        concat_wait: Duration,
        concat_max_len: usize,
    ) -> Self {
        ConcatShard {
            id,
            policies,
            pool,
            downstream,
            concat_wait,
            concat_max_len,
            pending: HashMap::new(),
        }
    }

    /// Run the shard's task: select over its input queue, the cancellation
    /// signal, and a periodic sweep tick. Returns once cancelled and all
    /// pending entries have been flushed.
    pub async fn run(mut self, mut input: mpsc::Receiver<Record>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.flush_all().await;
                    return;
                }
                record = input.recv() => {
                    match record {
                        Some(record) => self.handle(record).await,
                        None => {
                            self.flush_all().await;
                            return;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn handle(&mut self, record: Record) {
        let policy = match self.policies.get(&record.tag) {
            Some(p) => p.clone(),
            None => {
                let _ = self.downstream.send(record).await;
                return;
            }
        };

        let Some(id) = identifier_of(&record, &policy.identifier_key) else {
            warn!(shard = self.id, tag = %record.tag, "concat: missing/bad identifier, forwarding as-is");
            let _ = self.downstream.send(record).await;
            return;
        };

        let Some(body) = body_bytes_of(&mut record, &policy.message_key) else {
            warn!(shard = self.id, tag = %record.tag, "concat: missing/bad message body, forwarding as-is");
            let _ = self.downstream.send(record).await;
            return;
        };

        let matches_head = regex_matches(&policy.head_regex, &body);
        let now = Instant::now();

        match self.pending.remove(&id) {
            None => {
                if matches_head {
                    self.pending.insert(
                        id,
                        PendingEntry {
                            record,
                            last_updated_at: now,
                        },
                    );
                } else {
                    let _ = self.downstream.send(record).await;
                }
            }
            Some(existing) => {
                let stale = now.duration_since(existing.last_updated_at) > self.concat_wait;
                if matches_head || stale {
                    self.flush_entry(existing).await;
                    self.pending.insert(
                        id,
                        PendingEntry {
                            record,
                            last_updated_at: now,
                        },
                    );
                } else {
                    let mut existing = existing;
                    append_body(&mut existing.record, &policy.message_key, &body);
                    existing.last_updated_at = now;
                    self.pool.recycle(record);

                    let len = body_len(&existing.record, &policy.message_key);
                    if len >= self.concat_max_len {
                        self.flush_entry(existing).await;
                    } else {
                        self.pending.insert(id, existing);
                    }
                }
            }
        }
    }

    async fn flush_entry(&self, entry: PendingEntry) {
        let _ = self.downstream.send(entry.record).await;
    }

    async fn flush_all(&mut self) {
        for (_, entry) in self.pending.drain() {
            let _ = self.downstream.send(entry.record).await;
        }
    }

    async fn sweep(&mut self) {
        let wait = self.concat_wait;
        let stale_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, e)| e.last_updated_at.elapsed() > wait)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_ids {
            if let Some(entry) = self.pending.remove(&id) {
                self.flush_entry(entry).await;
            }
        }
    }
}

fn identifier_of(record: &Record, identifier_key: &str) -> Option<String> {
    record.fields.get(identifier_key).and_then(FieldValue::as_bytes).map(|b| String::from_utf8_lossy(b).into_owned())
}

/// Normalizes `message_key`'s value to `Bytes` in place and returns a copy
/// of the bytes for regex matching.
fn body_bytes_of(record: &mut Record, message_key: &str) -> Option<Vec<u8>> {
    let value = record.fields.get(message_key)?.clone();
    let bytes = match value {
        FieldValue::Bytes(b) => b,
        FieldValue::String(s) => s.into_bytes(),
        _ => return None,
    };
    record
        .fields
        .insert(message_key.to_owned(), FieldValue::Bytes(bytes.clone()));
    Some(bytes)
}

fn append_body(record: &mut Record, message_key: &str, body: &[u8]) {
    if let Some(FieldValue::Bytes(existing)) = record.fields.get_mut(message_key) {
        existing.extend_from_slice(body);
    }
}

fn body_len(record: &Record, message_key: &str) -> usize {
    match record.fields.get(message_key) {
        Some(FieldValue::Bytes(b)) => b.len(),
        _ => 0,
    }
}

fn regex_matches(pattern: &str, body: &[u8]) -> bool {
    if pattern.is_empty() {
        return false;
    }
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(&String::from_utf8_lossy(body)),
        Err(e) => {
            warn!(pattern, error = %e, "concat: invalid head_regex, treating as non-matching");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concat_protocol::FieldMap;
    use std::time::Duration as StdDuration;

    fn policy() -> ConcatPolicy {
        ConcatPolicy {
            message_key: "log".to_owned(),
            identifier_key: "container_id".to_owned(),
            head_regex: r"^\d{4}-\d{2}-\d{2}".to_owned(),
        }
    }

    fn record(container_id: &str, log: &str) -> Record {
        let mut fields = FieldMap::new();
        fields.insert("container_id".to_owned(), FieldValue::String(container_id.to_owned()));
        fields.insert("log".to_owned(), FieldValue::String(log.to_owned()));
        Record::new("java".to_owned(), fields)
    }

    async fn make_shard() -> (ConcatShard, mpsc::Sender<Record>, mpsc::Receiver<Record>) {
        let mut policies = HashMap::new();
        policies.insert("java".to_owned(), policy());
        let (dtx, drx) = mpsc::channel(64);
        let downstream = Arc::new(Downstream::new(dtx));
        let shard = ConcatShard::new(0, Arc::new(policies), Arc::new(RecordPool::new(64)), downstream, StdDuration::from_secs(3), 300_000);
        let (itx, _irx) = mpsc::channel(64);
        (shard, itx, drx)
    }

    #[tokio::test]
    async fn concatenates_continuation_lines() {
        let (mut shard, _itx, mut drx) = make_shard().await;

        shard.handle(record("c9", "2024-01-01 ERROR foo")).await;
        shard.handle(record("c9", "    at frame1")).await;
        shard.handle(record("c9", "    at frame2")).await;
        assert!(drx.try_recv().is_err());

        shard.flush_all().await;
        let out = drx.recv().await.unwrap();
        match out.fields.get("log").unwrap() {
            FieldValue::Bytes(b) => {
                assert_eq!(
                    String::from_utf8_lossy(b),
                    "2024-01-01 ERROR foo    at frame1    at frame2"
                );
            }
            other => panic!("expected Bytes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn orphan_continuation_forwarded_without_pending_entry() {
        let (mut shard, _itx, mut drx) = make_shard().await;
        shard.handle(record("c5", "    at frame_only")).await;
        let out = drx.recv().await.unwrap();
        assert!(matches!(out.fields.get("log"), Some(FieldValue::Bytes(_))));
        assert!(shard.pending.is_empty());
    }

    #[tokio::test]
    async fn new_head_flushes_old_pending_entry() {
        let (mut shard, _itx, mut drx) = make_shard().await;
        shard.handle(record("c1", "2024-01-01 ERROR first")).await;
        shard.handle(record("c1", "2024-01-02 ERROR second")).await;

        let first = drx.recv().await.unwrap();
        match first.fields.get("log").unwrap() {
            FieldValue::Bytes(b) => assert_eq!(String::from_utf8_lossy(b), "2024-01-01 ERROR first"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(shard.pending.len(), 1);
    }

    #[tokio::test]
    async fn max_len_flush_triggers_immediately() {
        let mut policies = HashMap::new();
        policies.insert("java".to_owned(), policy());
        let (dtx, mut drx) = mpsc::channel(64);
        let downstream = Arc::new(Downstream::new(dtx));
        let mut shard = ConcatShard::new(
            0,
            Arc::new(policies),
            Arc::new(RecordPool::new(64)),
            downstream,
            StdDuration::from_secs(3),
            50,
        );

        shard.handle(record("c2", "2024-01-01 head")).await;
        shard.handle(record("c2", &"x".repeat(100))).await;

        let out = drx.recv().await.unwrap();
        match out.fields.get("log").unwrap() {
            FieldValue::Bytes(b) => assert!(b.len() >= 50),
            other => panic!("unexpected {other:?}"),
        }
        assert!(shard.pending.is_empty());
    }

    #[tokio::test]
    async fn tag_without_policy_passes_through_unchanged() {
        let (mut shard, _itx, mut drx) = make_shard().await;
        let mut fields = FieldMap::new();
        fields.insert("log".to_owned(), FieldValue::String("hello".to_owned()));
        shard.handle(Record::new("other.tag".to_owned(), fields)).await;
        let out = drx.recv().await.unwrap();
        assert_eq!(out.fields.get("log"), Some(&FieldValue::String("hello".to_owned())));
    }
}
