//! Receiver configuration.
//!
//! TOML is the sole config source. Out-of-range values are reset to
//! their default with a warning ("reset and warn"), except two cases
//! that are fatal misconfigurations and panic at construction time:
//! rewrite-from-tag-key enabled without an origin key, and a concat
//! policy whose `identifier_key` is the empty string.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parsing TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-tag multi-line concatenation policy.
#[derive(Debug, Clone)]
pub struct ConcatPolicy {
    pub message_key: String,
    pub identifier_key: String,
    pub head_regex: String,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub addr: String,
    pub tag_key: String,
    pub lb_key: String,
    pub n_fork_concat: usize,
    pub concat_buf_size: usize,
    pub concat_wait: Duration,
    pub concat_max_len: usize,
    pub is_rewrite_tag_from_tag_key: bool,
    pub origin_rewrite_tag_key: Option<String>,
    pub concat_cfg: HashMap<String, ConcatPolicy>,
    pub n_fork_dispatch: usize,
    pub dispatch_out_chan_size: usize,
    pub post_filter_max_len: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            addr: "0.0.0.0:24225".to_owned(),
            tag_key: "tag".to_owned(),
            lb_key: "container_id".to_owned(),
            n_fork_concat: 1,
            concat_buf_size: 1024,
            concat_wait: Duration::from_secs(3),
            concat_max_len: 300_000,
            is_rewrite_tag_from_tag_key: false,
            origin_rewrite_tag_key: None,
            concat_cfg: HashMap::new(),
            n_fork_dispatch: 4,
            dispatch_out_chan_size: 1000,
            post_filter_max_len: 0,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    addr: Option<String>,
    tag_key: Option<String>,
    lb_key: Option<String>,
    n_fork_concat: Option<usize>,
    concat_buf_size: Option<usize>,
    concat_wait_secs: Option<u64>,
    concat_max_len: Option<usize>,
    is_rewrite_tag_from_tag_key: Option<bool>,
    origin_rewrite_tag_key: Option<String>,
    concat_cfg: Option<HashMap<String, RawConcatPolicy>>,
    n_fork_dispatch: Option<usize>,
    dispatch_out_chan_size: Option<usize>,
    post_filter_max_len: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawConcatPolicy {
    message_key: Option<String>,
    identifier_key: Option<String>,
    head_regex: Option<String>,
}

impl ReceiverConfig {
    pub fn load_from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(toml_str)?;
        Ok(Self::from_raw(raw))
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&toml_str)
    }

    fn from_raw(raw: RawConfig) -> Self {
        let defaults = ReceiverConfig::default();

        let n_fork_concat = raw.n_fork_concat.unwrap_or(defaults.n_fork_concat).max(1);

        let concat_buf_size = match raw.concat_buf_size {
            Some(0) => {
                warn!("concat_buf_size must be positive, resetting to default");
                defaults.concat_buf_size
            }
            Some(v) if v < 1000 => {
                warn!(value = v, "concat_buf_size below 1000, keeping as configured");
                v
            }
            Some(v) => v,
            None => defaults.concat_buf_size,
        };

        let concat_wait = match raw.concat_wait_secs {
            Some(secs) if secs < 1 => {
                warn!(secs, "concat_wait below the 1s minimum, resetting to default");
                defaults.concat_wait
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.concat_wait,
        };

        let is_rewrite_tag_from_tag_key = raw
            .is_rewrite_tag_from_tag_key
            .unwrap_or(defaults.is_rewrite_tag_from_tag_key);
        if is_rewrite_tag_from_tag_key && raw.origin_rewrite_tag_key.is_none() {
            panic!(
                "is_rewrite_tag_from_tag_key is set but origin_rewrite_tag_key is missing: \
                 this combination cannot route any record and is refused at startup"
            );
        }

        let mut concat_cfg = HashMap::new();
        for (tag, policy) in raw.concat_cfg.unwrap_or_default() {
            let identifier_key = policy.identifier_key.unwrap_or_default();
            if identifier_key.is_empty() {
                panic!("concat_cfg[\"{tag}\"].identifier_key must not be empty");
            }
            concat_cfg.insert(
                tag,
                ConcatPolicy {
                    message_key: policy.message_key.unwrap_or_else(|| "log".to_owned()),
                    identifier_key,
                    head_regex: policy.head_regex.unwrap_or_default(),
                },
            );
        }

        ReceiverConfig {
            addr: raw.addr.unwrap_or(defaults.addr),
            tag_key: raw.tag_key.unwrap_or(defaults.tag_key),
            lb_key: raw.lb_key.unwrap_or(defaults.lb_key),
            n_fork_concat,
            concat_buf_size,
            concat_wait,
            concat_max_len: raw.concat_max_len.unwrap_or(defaults.concat_max_len),
            is_rewrite_tag_from_tag_key,
            origin_rewrite_tag_key: raw.origin_rewrite_tag_key,
            concat_cfg,
            n_fork_dispatch: raw.n_fork_dispatch.unwrap_or(defaults.n_fork_dispatch).max(1),
            dispatch_out_chan_size: raw
                .dispatch_out_chan_size
                .unwrap_or(defaults.dispatch_out_chan_size),
            post_filter_max_len: raw.post_filter_max_len.unwrap_or(defaults.post_filter_max_len),
        }
    }
}
