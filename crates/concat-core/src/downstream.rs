//! Downstream send: the single point where every record gets its
//! monotonic `id` before leaving the receiver's ingest side.

use std::sync::atomic::{AtomicU64, Ordering};

use concat_protocol::Record;
use tokio::sync::mpsc;

pub struct Downstream {
    next_id: AtomicU64,
    tx: mpsc::Sender<Record>,
}

impl Downstream {
    pub fn new(tx: mpsc::Sender<Record>) -> Self {
        Downstream {
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Stamp `record` with the next id and enqueue it. This is a
    /// blocking send: a slow downstream consumer backs up into the
    /// concatenator shard or decoder that called this, which is the
    /// intended behavior (one slow connection shouldn't drop records
    /// silently the way dispatcher backpressure does).
    pub async fn send(&self, mut record: Record) -> Result<(), mpsc::error::SendError<Record>> {
        record.id = Some(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tx.send(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concat_protocol::FieldMap;

    #[tokio::test]
    async fn stamps_strictly_increasing_ids() {
        let (tx, mut rx) = mpsc::channel(8);
        let downstream = Downstream::new(tx);

        downstream
            .send(Record::new("t".to_owned(), FieldMap::new()))
            .await
            .unwrap();
        downstream
            .send(Record::new("t".to_owned(), FieldMap::new()))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.id.unwrap() > 0);
        assert!(second.id.unwrap() > first.id.unwrap());
    }
}
