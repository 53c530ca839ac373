//! concat-core: record pooling, shard routing, multi-line concatenation,
//! the receive loop, and the tag dispatcher.
//!
//! Everything here deals in [`concat_protocol::Record`]; wire decoding
//! lives one layer down, in `concat-protocol`.

pub mod concat;
pub mod config;
pub mod dispatcher;
pub mod downstream;
pub mod filter;
pub mod metrics;
pub mod pool;
pub mod receive;
pub mod router;

pub use concat::ConcatShard;
pub use config::{ConcatPolicy, ConfigError, ReceiverConfig};
pub use dispatcher::{Dispatcher, FilterPipelineFactory, PipelineSpawnError, TagPipelineFactory};
pub use downstream::Downstream;
pub use filter::{Filter, KeyNormalizeFilter, SparkFilter};
pub use metrics::MetricsRegistry;
pub use pool::RecordPool;
pub use receive::ReceiveLoop;
pub use router::{Route, Router};
