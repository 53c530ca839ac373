//! receiver: wires the ingest-and-concatenation pipeline and the tag
//! dispatcher from `concat-core` into one running system.
//!
//! This crate owns no business logic of its own -- it is assembly only,
//! matching the teacher's split between a thin binary/lib and the real
//! work living in library crates.

use std::collections::HashMap;
use std::sync::Arc;

use concat_core::{
    ConcatShard, Dispatcher, Downstream, FilterPipelineFactory, Filter, KeyNormalizeFilter,
    MetricsRegistry, ReceiveLoop, ReceiverConfig, RecordPool, Router,
};
use concat_protocol::Record;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Capacity of the channel carrying records from the concatenator shards
/// (and the router's bypass path) into the dispatcher. Not itself a named
/// config option -- the spec only requires the downstream channel's
/// capacity be "configurable", and `dispatch_out_chan_size` already covers
/// the queue depth that matters for backpressure (per-tag, post-dispatch).
const DOWNSTREAM_CHANNEL_SIZE: usize = 4096;

const RECORD_POOL_CAPACITY: usize = 4096;

/// A fully wired receiver instance, holding every handle needed to run it
/// and to inspect it from tests (metrics, dispatcher).
pub struct ReceiverApp {
    pub config: ReceiverConfig,
    pub metrics: Arc<MetricsRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    root_cancel: CancellationToken,
    receive_loop: Arc<ReceiveLoop>,
    shard_tasks: Vec<(ConcatShard, mpsc::Receiver<Record>)>,
    dispatch_input_rx: Option<mpsc::Receiver<Record>>,
    producer_rx: Option<mpsc::Receiver<Record>>,
}

impl ReceiverApp {
    /// Build every component described in spec.md §4, wired per §2's data
    /// flow, but do not spawn any tasks yet -- that happens in [`Self::spawn`].
    ///
    /// `root_cancel` seeds the cancellation tree: every per-connection,
    /// per-shard, and per-tag-pipeline signal is a derived child of it, so
    /// cancelling it tears the whole system down (spec.md §5).
    pub fn build(config: ReceiverConfig, root_cancel: CancellationToken) -> Self {
        let pool = Arc::new(RecordPool::new(RECORD_POOL_CAPACITY));
        let metrics = Arc::new(MetricsRegistry::new());

        let (downstream_tx, dispatch_input_rx) = mpsc::channel::<Record>(DOWNSTREAM_CHANNEL_SIZE);
        let downstream = Arc::new(Downstream::new(downstream_tx));

        let rewrite_tag_key = if config.is_rewrite_tag_from_tag_key {
            config.origin_rewrite_tag_key.clone()
        } else {
            None
        };
        let router = Arc::new(Router::new(
            config.lb_key.clone(),
            config.n_fork_concat,
            rewrite_tag_key,
        ));

        let policies: Arc<HashMap<_, _>> = Arc::new(config.concat_cfg.clone());
        let mut shard_senders = Vec::with_capacity(config.n_fork_concat);
        let mut shard_tasks = Vec::with_capacity(config.n_fork_concat);
        for i in 0..config.n_fork_concat {
            let (tx, rx) = mpsc::channel::<Record>(config.concat_buf_size);
            shard_senders.push(tx);
            let shard = ConcatShard::new(
                i,
                policies.clone(),
                pool.clone(),
                downstream.clone(),
                config.concat_wait,
                config.concat_max_len,
            );
            shard_tasks.push((shard, rx));
        }

        let receive_loop = Arc::new(ReceiveLoop::new(
            config.addr.clone(),
            config.tag_key.clone(),
            router,
            shard_senders,
            downstream,
            pool.clone(),
        ));

        let (producer_tx, producer_rx) = mpsc::channel::<Record>(config.dispatch_out_chan_size);
        let factory = Arc::new(FilterPipelineFactory {
            filters: vec![Arc::new(KeyNormalizeFilter::new(config.post_filter_max_len)) as Arc<dyn Filter>],
            pool: pool.clone(),
        });
        let dispatcher = Dispatcher::new(
            factory,
            producer_tx,
            config.dispatch_out_chan_size,
            root_cancel.child_token(),
            metrics.clone(),
        );

        ReceiverApp {
            config,
            metrics,
            dispatcher,
            root_cancel,
            receive_loop,
            shard_tasks,
            dispatch_input_rx: Some(dispatch_input_rx),
            producer_rx: Some(producer_rx),
        }
    }

    /// Spawn every task (concatenator shards, receive loop, dispatcher
    /// workers, the stub producer) under the cancellation tree rooted at
    /// the token passed to [`Self::build`]. Consumes `self` -- there is
    /// nothing left to configure once the system is running.
    pub fn spawn(mut self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for (shard, rx) in self.shard_tasks.drain(..) {
            let shard_cancel = self.root_cancel.child_token();
            handles.push(tokio::spawn(shard.run(rx, shard_cancel)));
        }

        let receive_cancel = self.root_cancel.child_token();
        let receive_loop = self.receive_loop.clone();
        handles.push(tokio::spawn(async move {
            receive_loop.run(receive_cancel).await;
        }));

        let dispatch_input_rx = self.dispatch_input_rx.take().expect("dispatch input already taken");
        handles.extend(self.dispatcher.run(dispatch_input_rx, self.config.n_fork_dispatch));

        let mut producer_rx = self.producer_rx.take().expect("producer rx already taken");
        let producer_cancel = self.root_cancel.child_token();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = producer_cancel.cancelled() => return,
                    record = producer_rx.recv() => {
                        match record {
                            Some(record) => info!(
                                tag = %record.tag,
                                id = record.id.unwrap_or_default(),
                                fields = record.fields.len(),
                                "producer: record delivered"
                            ),
                            None => return,
                        }
                    }
                }
            }
        }));

        handles
    }
}
