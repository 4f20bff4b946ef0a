//! Configuration for burrowkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BurrowError, Result};

/// Smallest block size accepted; a block must hold at least a couple of
/// records with their headers.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Main configuration for a SortedStore instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Block Configuration
    // -------------------------------------------------------------------------
    /// Max encoded size of a data block before it is split (in bytes)
    pub max_block_size: usize,

    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Ceiling on bytes the store may allocate for blocks, index and chains
    pub memory_limit: u64,

    /// Publish local counters to the shared pool on every change.
    /// Disabled during bulk loads; see `SortedStore::sync_statistics`.
    pub statistics_enabled: bool,

    // -------------------------------------------------------------------------
    // Compression Configuration
    // -------------------------------------------------------------------------
    /// Codec used when a block is compressed
    pub codec: CodecKind,

    /// zstd compression level (Zstd and ZstdDictionary codecs)
    pub compression_level: i32,

    /// Blocks untouched for at least this long are compressed by
    /// `SortedStore::compress_idle_blocks`. `None` disables idle compression.
    pub idle_compression: Option<Duration>,

    // -------------------------------------------------------------------------
    // Dictionary Configuration
    // -------------------------------------------------------------------------
    /// Directory where trained dictionaries are persisted and loaded from
    /// Internal structure:
    ///   {dictionary_dir}/
    ///     ├── dict_000001.zdict
    ///     └── dict_000002.zdict
    pub dictionary_dir: Option<PathBuf>,

    /// Target size of a trained dictionary (in bytes)
    pub dictionary_size: usize,

    /// Sample volume collected before a training run is started (in bytes)
    pub dictionary_training_bytes: usize,
}

/// Block compression codec selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Blocks are always stored raw
    None,

    /// LZ4 block format (fast)
    Lz4,

    /// Zstandard (high compression)
    Zstd,

    /// Zstandard with a dictionary trained from block payloads
    ZstdDictionary,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_block_size: 4 * 1024,
            memory_limit: 1024 * 1024 * 1024, // 1 GiB
            statistics_enabled: true,
            codec: CodecKind::None,
            compression_level: 3,
            idle_compression: None,
            dictionary_dir: None,
            dictionary_size: 64 * 1024,
            dictionary_training_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that would otherwise break block invariants
    pub fn validate(&self) -> Result<()> {
        if self.max_block_size < MIN_BLOCK_SIZE {
            return Err(BurrowError::Config(format!(
                "max_block_size must be at least {} bytes, got {}",
                MIN_BLOCK_SIZE, self.max_block_size
            )));
        }
        if self.max_block_size > u32::MAX as usize {
            return Err(BurrowError::Config(format!(
                "max_block_size too large: {}",
                self.max_block_size
            )));
        }
        if self.memory_limit == 0 {
            return Err(BurrowError::Config("memory_limit must be non-zero".to_string()));
        }
        if self.codec == CodecKind::ZstdDictionary && self.dictionary_size == 0 {
            return Err(BurrowError::Config(
                "dictionary_size must be non-zero for the dictionary codec".to_string(),
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
    /// Set the maximum block size (in bytes)
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.config.max_block_size = size;
        self
    }

    /// Set the memory ceiling (in bytes)
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.memory_limit = bytes;
        self
    }

    /// Enable or disable eager statistics publishing
    pub fn statistics_enabled(mut self, enabled: bool) -> Self {
        self.config.statistics_enabled = enabled;
        self
    }

    /// Set the block compression codec
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.config.codec = codec;
        self
    }

    /// Set the zstd compression level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.config.compression_level = level;
        self
    }

    /// Compress blocks idle for at least `idle`
    pub fn idle_compression(mut self, idle: Duration) -> Self {
        self.config.idle_compression = Some(idle);
        self
    }

    /// Set the directory for trained dictionaries
    pub fn dictionary_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dictionary_dir = Some(path.into());
        self
    }

    /// Set the target trained dictionary size (in bytes)
    pub fn dictionary_size(mut self, size: usize) -> Self {
        self.config.dictionary_size = size;
        self
    }

    /// Set the sample volume that triggers dictionary training (in bytes)
    pub fn dictionary_training_bytes(mut self, bytes: usize) -> Self {
        self.config.dictionary_training_bytes = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
