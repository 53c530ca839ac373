//! Tag-routed dispatcher.
//!
//! Owns one bounded input queue fed by the rest of the receiver and
//! `n_fork_dispatch` worker tasks draining it. On first sight of a tag, a
//! worker lazily spawns that tag's pipeline; every subsequent record for
//! the tag is routed to the cached input channel with non-blocking
//! backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use concat_protocol::Record;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::filter::Filter;
use crate::metrics::MetricsRegistry;
use crate::pool::RecordPool;

#[derive(Debug, Error)]
pub enum PipelineSpawnError {
    #[error("pipeline spawn failed for tag '{tag}': {reason}")]
    Failed { tag: String, reason: String },
}

/// Factory for a tag's pipeline. Spawning is synchronous: the factory
/// either hands back a channel to feed the pipeline or fails immediately,
/// matching the contract the dispatcher's double-checked lazy-spawn
/// relies on (no lock is ever held across an `.await`).
pub trait TagPipelineFactory: Send + Sync {
    fn spawn(
        &self,
        cancel: CancellationToken,
        tag: &str,
        out_chan: mpsc::Sender<Record>,
        in_chan_size: usize,
    ) -> Result<mpsc::Sender<Record>, PipelineSpawnError>;
}

/// A concrete factory: a tag's pipeline is its configured filter chain,
/// draining an input queue and forwarding survivors to `out_chan`. Not the
/// only valid shape a pipeline may take -- just the one this crate ships.
pub struct FilterPipelineFactory {
    pub filters: Vec<Arc<dyn Filter>>,
    pub pool: Arc<RecordPool>,
}

impl TagPipelineFactory for FilterPipelineFactory {
    fn spawn(
        &self,
        cancel: CancellationToken,
        tag: &str,
        out_chan: mpsc::Sender<Record>,
        in_chan_size: usize,
    ) -> Result<mpsc::Sender<Record>, PipelineSpawnError> {
        let (tx, mut rx) = mpsc::channel::<Record>(in_chan_size);
        let filters = self.filters.clone();
        let pool = self.pool.clone();
        let tag = tag.to_owned();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    record = rx.recv() => {
                        let Some(mut record) = record else { return };
                        let mut discarded = false;
                        for filter in &filters {
                            match filter.filter(record) {
                                Some(r) => record = r,
                                None => { discarded = true; break; }
                            }
                        }
                        if discarded {
                            continue;
                        }
                        if out_chan.send(record).await.is_err() {
                            warn!(tag, "pipeline: downstream producer closed, stopping");
                            return;
                        }
                    }
                }
            }
        });

        Ok(tx)
    }
}

struct TagBinding {
    in_chan: mpsc::Sender<Record>,
    in_chan_cap: usize,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Coalesces the three bookkeeping maps the spec describes
/// (`tag -> in_chan`, `tag -> counter`, `tag -> cancel`) into one map
/// behind one lock, making "all three agree on the key set" a type-level
/// fact instead of a protocol every writer must uphold by hand.
struct TagTable {
    inner: RwLock<HashMap<String, TagBinding>>,
}

impl TagTable {
    fn new() -> Self {
        TagTable {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, tag: &str) -> Option<(mpsc::Sender<Record>, usize, Arc<AtomicU64>)> {
        let table = self.inner.read().expect("tag table poisoned");
        table
            .get(tag)
            .map(|b| (b.in_chan.clone(), b.in_chan_cap, b.counter.clone()))
    }

    fn insert(&self, tag: String, binding: TagBinding) {
        self.inner.write().expect("tag table poisoned").insert(tag, binding);
    }

    fn remove(&self, tag: &str) {
        self.inner.write().expect("tag table poisoned").remove(tag);
    }

    fn contains(&self, tag: &str) -> bool {
        self.inner.read().expect("tag table poisoned").contains_key(tag)
    }
}

pub struct Dispatcher {
    table: Arc<TagTable>,
    factory: Arc<dyn TagPipelineFactory>,
    out_chan: mpsc::Sender<Record>,
    in_chan_size: usize,
    spawn_lock: Mutex<()>,
    root_cancel: CancellationToken,
    metrics: Arc<MetricsRegistry>,
    msg_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        factory: Arc<dyn TagPipelineFactory>,
        out_chan: mpsc::Sender<Record>,
        in_chan_size: usize,
        root_cancel: CancellationToken,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            table: Arc::new(TagTable::new()),
            factory,
            out_chan,
            in_chan_size,
            spawn_lock: Mutex::new(()),
            root_cancel,
            metrics,
            msg_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        })
    }

    pub fn msg_total(&self) -> u64 {
        self.msg_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Spawn `n_fork_dispatch` worker tasks draining `input` and return
    /// their join handles.
    pub fn run(
        self: &Arc<Self>,
        input: mpsc::Receiver<Record>,
        n_fork_dispatch: usize,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let shared_input = Arc::new(tokio::sync::Mutex::new(input));
        (0..n_fork_dispatch.max(1))
            .map(|_| {
                let dispatcher = self.clone();
                let shared_input = shared_input.clone();
                tokio::spawn(async move { dispatcher.worker_loop(shared_input).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, input: Arc<tokio::sync::Mutex<mpsc::Receiver<Record>>>) {
        loop {
            let record = {
                let mut guard = input.lock().await;
                guard.recv().await
            };
            let Some(record) = record else { return };
            self.dispatch(record).await;
        }
    }

    /// Route one record: find (or lazily spawn) its tag's pipeline, then
    /// enqueue without blocking.
    pub async fn dispatch(&self, record: Record) {
        self.msg_total.fetch_add(1, Ordering::Relaxed);
        let tag = record.tag.clone();

        let binding = match self.table.get(&tag) {
            Some(b) => Some(b),
            None => self.get_or_spawn(&tag),
        };

        let Some((in_chan, _cap, counter)) = binding else {
            return;
        };

        match in_chan.try_send(record) {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                warn!(tag, "dispatcher: per-tag queue full, dropping record");
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn get_or_spawn(&self, tag: &str) -> Option<(mpsc::Sender<Record>, usize, Arc<AtomicU64>)> {
        let _guard = self.spawn_lock.lock().expect("dispatcher spawn lock poisoned");

        // Double check: another worker may have won the race while we
        // waited for the lock.
        if let Some(existing) = self.table.get(tag) {
            return Some(existing);
        }

        let tag_cancel = self.root_cancel.child_token();
        let result = self
            .factory
            .spawn(tag_cancel.clone(), tag, self.out_chan.clone(), self.in_chan_size);

        let in_chan = match result {
            Ok(tx) => tx,
            Err(e) => {
                warn!(tag, error = %e, "dispatcher: pipeline spawn failed, dropping record");
                tag_cancel.cancel();
                return None;
            }
        };

        let counter = Arc::new(AtomicU64::new(0));
        self.table.insert(
            tag.to_owned(),
            TagBinding {
                in_chan: in_chan.clone(),
                in_chan_cap: self.in_chan_size,
                counter: counter.clone(),
                cancel: tag_cancel.clone(),
            },
        );

        self.spawn_cleanup(tag.to_owned(), tag_cancel.clone());

        let tag_for_metrics = tag.to_owned();
        let counter_for_msg_per_sec = counter.clone();
        let counter_for_msg_total = counter.clone();
        let in_chan_for_metrics = in_chan.clone();
        let cap = self.in_chan_size;
        self.metrics.register_tag_metrics(
            &tag_for_metrics,
            move || counter_for_msg_per_sec.load(Ordering::Relaxed),
            move || counter_for_msg_total.load(Ordering::Relaxed),
            move || (cap - in_chan_for_metrics.capacity()) as u64,
            cap as u64,
        );

        Some((in_chan, self.in_chan_size, counter))
    }

    fn spawn_cleanup(&self, tag: String, cancel: CancellationToken) {
        let table = self.table.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            table.remove(&tag);
            metrics.unregister_tag_metrics(&tag);
        });
    }

    /// Whether the dispatcher currently has a live binding for `tag`.
    /// Exposed for tests exercising tag lifecycle.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.table.contains(tag)
    }
}
