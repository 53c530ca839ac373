//! Metrics observer hook.
//!
//! Components register a named snapshot closure; an external collector
//! (out of scope here) drives invocation. No exporter lives in this
//! crate — this is the registration surface only.

use std::collections::HashMap;
use std::sync::RwLock;

pub type SnapshotFn = Box<dyn Fn() -> u64 + Send + Sync>;

#[derive(Default)]
pub struct MetricsRegistry {
    snapshots: RwLock<HashMap<String, SnapshotFn>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Register (or replace) a named snapshot callback.
    pub fn register(&self, name: impl Into<String>, snapshot: SnapshotFn) {
        self.snapshots
            .write()
            .expect("metrics registry poisoned")
            .insert(name.into(), snapshot);
    }

    /// Register the standard per-tag quartet: `<tag>.msgPerSec`,
    /// `<tag>.msgTotal`, `<tag>.ChanLen`, `<tag>.ChanCap`.
    pub fn register_tag_metrics(
        &self,
        tag: &str,
        msg_per_sec: impl Fn() -> u64 + Send + Sync + 'static,
        msg_total: impl Fn() -> u64 + Send + Sync + 'static,
        chan_len: impl Fn() -> u64 + Send + Sync + 'static,
        chan_cap: u64,
    ) {
        self.register(format!("{tag}.msgPerSec"), Box::new(msg_per_sec));
        self.register(format!("{tag}.msgTotal"), Box::new(msg_total));
        self.register(format!("{tag}.ChanLen"), Box::new(chan_len));
        self.register(format!("{tag}.ChanCap"), Box::new(move || chan_cap));
    }

    pub fn unregister_tag_metrics(&self, tag: &str) {
        let mut snapshots = self.snapshots.write().expect("metrics registry poisoned");
        for suffix in ["msgPerSec", "msgTotal", "ChanLen", "ChanCap"] {
            snapshots.remove(&format!("{tag}.{suffix}"));
        }
    }

    /// Drive every registered snapshot once, returning the full metric map.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.snapshots
            .read()
            .expect("metrics registry poisoned")
            .iter()
            .map(|(name, f)| (name.clone(), f()))
            .collect()
    }
}
