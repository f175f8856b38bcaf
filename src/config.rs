//! Configuration module
//!
//! Plain structs with defaults matching the documented option table, loadable
//! from environment variables. The config value is threaded explicitly
//! through component constructors; there is no process-wide singleton.

use crate::defaults::*;
use crate::error::{Result, SiltError};

/// Main configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub collection: CollectionConfig,
    pub buffer: BufferConfig,
    pub btree: BTreeConfig,
    pub wal: WalConfig,
}

impl Config {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let config = Self {
            collection: CollectionConfig {
                dim: parse_var("SILT_COLLECTION_DIM", DEFAULT_DIMENSIONS),
            },
            buffer: BufferConfig {
                max_bytes: parse_var("SILT_BUFFER_MAX_BYTES", DEFAULT_MAX_BUFFER_BYTES),
                shard_count: parse_var("SILT_BUFFER_SHARD_COUNT", DEFAULT_SHARD_COUNT),
                flush_threshold_bytes: parse_var(
                    "SILT_BUFFER_FLUSH_THRESHOLD_BYTES",
                    DEFAULT_FLUSH_THRESHOLD_BYTES,
                ),
                dedupe_enabled: parse_var("SILT_BUFFER_DEDUPE_ENABLED", true),
            },
            btree: BTreeConfig {
                epsilon: parse_var("SILT_BTREE_EPSILON", DEFAULT_EPSILON),
                node_size_bytes: parse_var("SILT_BTREE_NODE_SIZE_BYTES", DEFAULT_NODE_SIZE_BYTES),
                fanout: parse_var("SILT_BTREE_FANOUT", DEFAULT_FANOUT),
                adaptive_epsilon: parse_var("SILT_BTREE_ADAPTIVE_EPSILON", true),
                hot_partition_threshold: parse_var(
                    "SILT_BTREE_HOT_PARTITION_THRESHOLD",
                    DEFAULT_HOT_PARTITION_THRESHOLD,
                ),
                direct_flush_threshold: parse_var(
                    "SILT_BTREE_DIRECT_FLUSH_THRESHOLD",
                    DEFAULT_DIRECT_FLUSH_THRESHOLD,
                ),
                epsilon_min: EPSILON_MIN,
                epsilon_max: EPSILON_MAX,
                max_flush_batch: parse_var("SILT_BTREE_MAX_FLUSH_BATCH", DEFAULT_MAX_FLUSH_BATCH),
                max_segments_per_leaf: parse_var(
                    "SILT_BTREE_MAX_SEGMENTS_PER_LEAF",
                    DEFAULT_MAX_SEGMENTS_PER_LEAF,
                ),
            },
            wal: WalConfig {
                sync_on_append: parse_var("SILT_WAL_SYNC_ON_APPEND", true),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.collection.dim == 0 {
            return Err(SiltError::config("collection dimension must be positive"));
        }
        if !self.buffer.shard_count.is_power_of_two() {
            return Err(SiltError::config(format!(
                "shard_count must be a power of two, got {}",
                self.buffer.shard_count
            )));
        }
        if self.buffer.flush_threshold_bytes > self.buffer.max_bytes {
            return Err(SiltError::config(
                "flush_threshold_bytes must not exceed max_bytes",
            ));
        }
        if !(0.0 < self.btree.epsilon && self.btree.epsilon < 1.0) {
            return Err(SiltError::config(format!(
                "epsilon must be in (0, 1), got {}",
                self.btree.epsilon
            )));
        }
        if self.btree.fanout < 2 {
            return Err(SiltError::config("fanout must be at least 2"));
        }
        if self.btree.hot_partition_threshold >= self.btree.direct_flush_threshold {
            return Err(SiltError::config(
                "hot_partition_threshold must be below direct_flush_threshold",
            ));
        }
        Ok(())
    }
}

/// Collection-level configuration
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Fixed vector dimension for every entry in the collection
    pub dim: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            dim: DEFAULT_DIMENSIONS,
        }
    }
}

/// Message buffer configuration
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Hard buffer cap; appends block past this
    pub max_bytes: usize,
    /// Parallelism of append (power of two)
    pub shard_count: usize,
    /// Soft threshold that triggers a flush
    pub flush_threshold_bytes: usize,
    /// Same-identity dedup within a shard
    pub dedupe_enabled: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BUFFER_BYTES,
            shard_count: DEFAULT_SHARD_COUNT,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
            dedupe_enabled: true,
        }
    }
}

/// B-epsilon tree configuration
#[derive(Debug, Clone)]
pub struct BTreeConfig {
    /// Buffer-vs-pivot split inside nodes
    pub epsilon: f32,
    /// Per-node byte budget
    pub node_size_bytes: usize,
    /// Maximum children per node
    pub fanout: usize,
    /// Enable epsilon tuning based on flush effectiveness
    pub adaptive_epsilon: bool,
    /// One-child dominance threshold that biases flush selection
    pub hot_partition_threshold: f32,
    /// Threshold above which a child's messages bypass the cascade
    pub direct_flush_threshold: f32,
    /// Lower bound for adaptive epsilon
    pub epsilon_min: f32,
    /// Upper bound for adaptive epsilon
    pub epsilon_max: f32,
    /// Maximum messages per leaf flush batch
    pub max_flush_batch: usize,
    /// Bound segments per leaf before a range split
    pub max_segments_per_leaf: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            node_size_bytes: DEFAULT_NODE_SIZE_BYTES,
            fanout: DEFAULT_FANOUT,
            adaptive_epsilon: true,
            hot_partition_threshold: DEFAULT_HOT_PARTITION_THRESHOLD,
            direct_flush_threshold: DEFAULT_DIRECT_FLUSH_THRESHOLD,
            epsilon_min: EPSILON_MIN,
            epsilon_max: EPSILON_MAX,
            max_flush_batch: DEFAULT_MAX_FLUSH_BATCH,
            max_segments_per_leaf: DEFAULT_MAX_SEGMENTS_PER_LEAF,
        }
    }
}

/// Write-ahead log configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// fsync after every append; disable only in tests
    pub sync_on_append: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_append: true,
        }
    }
}
