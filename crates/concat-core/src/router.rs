//! Record shard router.
//!
//! Picks a concatenator shard for a decoded record by hashing its
//! load-balancing key, or routes it straight to the downstream channel
//! when no usable key is present.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use concat_protocol::{FieldValue, Record};
use tracing::warn;
use twox_hash::XxHash64;

/// Where a routed record should go next.
pub enum Route {
    /// Index of the concatenator shard to enqueue onto.
    Shard(usize),
    /// No usable LB key; send straight downstream.
    Bypass,
    /// Tag rewrite was configured but failed; record is dropped.
    Dropped,
}

pub struct Router {
    lb_key: String,
    n_shards: usize,
    rewrite_tag_key: Option<String>,
    bypass_count: AtomicU64,
    dropped_count: AtomicU64,
}

impl Router {
    pub fn new(lb_key: String, n_shards: usize, rewrite_tag_key: Option<String>) -> Self {
        assert!(n_shards >= 1, "n_fork_concat must be at least 1");
        Router {
            lb_key,
            n_shards,
            rewrite_tag_key,
            bypass_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        }
    }

    pub fn bypass_count(&self) -> u64 {
        self.bypass_count.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Apply the optional tag rewrite, then pick a route for `record`.
    pub fn route(&self, record: &mut Record) -> Route {
        if let Some(rewrite_key) = &self.rewrite_tag_key {
            match record.fields.get(rewrite_key).and_then(FieldValue::as_bytes) {
                Some(bytes) => record.tag = String::from_utf8_lossy(bytes).into_owned(),
                None => {
                    warn!(
                        tag = %record.tag,
                        rewrite_key,
                        "dropping record: tag rewrite key missing or wrong type"
                    );
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    return Route::Dropped;
                }
            }
        }

        if self.n_shards == 1 {
            return Route::Shard(0);
        }

        match record.fields.get(&self.lb_key).and_then(FieldValue::as_bytes) {
            Some(key_bytes) => {
                let mut hasher = XxHash64::with_seed(0);
                hasher.write(key_bytes);
                let shard = (hasher.finish() as usize) % self.n_shards;
                Route::Shard(shard)
            }
            None => {
                warn!(
                    tag = %record.tag,
                    lb_key = %self.lb_key,
                    "bypassing concatenator: lb key missing or wrong type"
                );
                self.bypass_count.fetch_add(1, Ordering::Relaxed);
                Route::Bypass
            }
        }
    }
}
