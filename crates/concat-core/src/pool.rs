//! Object pool for `Record` reuse.
//!
//! Every component that decides to discard a record must return it here
//! via [`RecordPool::recycle`] instead of dropping it, to keep allocator
//! pressure off the hot path.

use std::sync::Mutex;

use concat_protocol::Record;

pub struct RecordPool {
    free: Mutex<Vec<Record>>,
    cap: usize,
}

impl RecordPool {
    pub fn new(cap: usize) -> Self {
        RecordPool {
            free: Mutex::new(Vec::with_capacity(cap.min(4096))),
            cap,
        }
    }

    /// Take a record from the pool, or allocate a fresh one.
    pub fn take(&self) -> Record {
        self.free
            .lock()
            .expect("record pool mutex poisoned")
            .pop()
            .unwrap_or_default()
    }

    /// Return a record to the pool. Resets it first; if the pool is at
    /// capacity the record is simply dropped.
    pub fn recycle(&self, mut record: Record) {
        record.reset();
        let mut free = self.free.lock().expect("record pool mutex poisoned");
        if free.len() < self.cap {
            free.push(record);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().expect("record pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordPool {
    fn default() -> Self {
        RecordPool::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_then_recycle_reuses_allocation() {
        let pool = RecordPool::new(8);
        let mut r = pool.take();
        r.tag = "app.log".to_owned();
        pool.recycle(r);
        assert_eq!(pool.len(), 1);

        let r2 = pool.take();
        assert_eq!(r2.tag, "");
        assert!(pool.is_empty());
    }

    #[test]
    fn recycle_past_capacity_drops_excess() {
        let pool = RecordPool::new(1);
        pool.recycle(concat_protocol::Record::default());
        pool.recycle(concat_protocol::Record::default());
        assert_eq!(pool.len(), 1);
    }
}
