//! Configuration for SegKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, SegKvError};
use crate::segment::{MemorySegmentFactory, SegmentFactory};

/// Default segment size (32 MB)
pub const DEFAULT_SEGMENT_CAPACITY: u32 = 32 * 1024 * 1024;

/// Largest segment the on-disk offsets can address
pub const MAX_SEGMENT_CAPACITY: u32 = u32::MAX;

/// Main configuration for a SegKV store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Home directory of the store
    /// Internal structure:
    ///   {home_dir}/
    ///     ├── segment_000001.seg   (one file per segment)
    ///     ├── index.snapshot       (index checkpoint)
    ///     └── store.meta           (manifest)
    pub home_dir: PathBuf,

    /// Byte capacity of every segment
    pub segment_capacity: u32,

    /// Backing strategy used to create and reopen segments
    pub segment_factory: Arc<dyn SegmentFactory>,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Expected number of keys, used to pre-size the index
    pub initial_capacity: usize,

    /// Number of lock shards in the index (power of two)
    pub index_shards: usize,

    // -------------------------------------------------------------------------
    // Durability / Maintenance
    // -------------------------------------------------------------------------
    /// When to checkpoint automatically
    pub sync_policy: SyncPolicy,

    /// Sealed segments with a live-byte ratio below this are compacted
    pub compaction_threshold: f64,
}

/// Sync policy: when the store checkpoints on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Only an explicit `Store::sync` (or `close`) checkpoints
    Manual,

    /// Checkpoint after N writes (puts and deletes)
    EveryNWrites { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("./segkv_data"),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            segment_factory: Arc::new(MemorySegmentFactory),
            initial_capacity: 1_000_000,
            index_shards: 64,
            sync_policy: SyncPolicy::Manual,
            compaction_threshold: 0.5,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the configuration describes a usable store
    pub fn validate(&self) -> Result<()> {
        if self.segment_capacity == 0 {
            return Err(SegKvError::Config(
                "segment capacity must be non-zero".to_string(),
            ));
        }
        if self.index_shards == 0 || !self.index_shards.is_power_of_two() {
            return Err(SegKvError::Config(format!(
                "index shard count must be a power of two, got {}",
                self.index_shards
            )));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(SegKvError::Config(format!(
                "compaction threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        if let SyncPolicy::EveryNWrites { count: 0 } = self.sync_policy {
            return Err(SegKvError::Config(
                "sync policy write count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the home directory
    pub fn home_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.home_dir = path.into();
        self
    }

    /// Set the expected number of keys
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_capacity = capacity;
        self
    }

    /// Set the segment capacity (in bytes)
    pub fn segment_capacity(mut self, bytes: u32) -> Self {
        self.config.segment_capacity = bytes;
        self
    }

    /// Set the segment capacity (in megabytes), saturating at the addressable maximum
    pub fn segment_file_size_mb(mut self, mb: u32) -> Self {
        let bytes = u64::from(mb) * 1024 * 1024;
        self.config.segment_capacity = bytes.min(u64::from(MAX_SEGMENT_CAPACITY)) as u32;
        self
    }

    /// Set the segment backing strategy
    pub fn segment_factory(mut self, factory: impl SegmentFactory + 'static) -> Self {
        self.config.segment_factory = Arc::new(factory);
        self
    }

    /// Set the number of index lock shards
    pub fn index_shards(mut self, shards: usize) -> Self {
        self.config.index_shards = shards;
        self
    }

    /// Set the sync policy
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.config.sync_policy = policy;
        self
    }

    /// Set the compaction live-ratio threshold
    pub fn compaction_threshold(mut self, threshold: f64) -> Self {
        self.config.compaction_threshold = threshold;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
