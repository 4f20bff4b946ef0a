//! Compression Codec Module
//!
//! Pluggable whole-block compression.
//!
//! ## Responsibilities
//! - Compress/decompress block payloads
//! - Report the minimum payload size worth compressing
//! - Keep per-codec statistics (bytes processed, average ratio)
//! - Dictionary codec: train, persist and reload dictionaries
//!
//! ## Codec Ids (stored with every compressed block)
//! - 0x00: NONE (raw)
//! - 0x01: LZ4
//! - 0x02: ZSTD
//! - 0x03: ZSTD with trained dictionary
//!
//! Payloads shorter than [`Codec::compression_threshold`] are never handed
//! to a codec; callers store them raw.

mod dictionary;
mod lz4;
mod zstandard;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{CodecKind, Config};
use crate::error::{BurrowError, Result};

pub use self::dictionary::DictionaryCodec;
pub use self::lz4::Lz4Codec;
pub use self::zstandard::ZstdCodec;

/// Codec identifier persisted alongside compressed payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodecType {
    None = 0x00,
    Lz4 = 0x01,
    Zstd = 0x02,
    ZstdDictionary = 0x03,
}

impl CodecType {
    pub fn from_u8(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(CodecType::None),
            0x01 => Ok(CodecType::Lz4),
            0x02 => Ok(CodecType::Zstd),
            0x03 => Ok(CodecType::ZstdDictionary),
            other => Err(BurrowError::Corruption(format!(
                "unknown codec id: {:#04x}",
                other
            ))),
        }
    }

    pub fn kind(self) -> CodecKind {
        match self {
            CodecType::None => CodecKind::None,
            CodecType::Lz4 => CodecKind::Lz4,
            CodecType::Zstd => CodecKind::Zstd,
            CodecType::ZstdDictionary => CodecKind::ZstdDictionary,
        }
    }
}

impl From<CodecKind> for CodecType {
    fn from(kind: CodecKind) -> Self {
        match kind {
            CodecKind::None => CodecType::None,
            CodecKind::Lz4 => CodecType::Lz4,
            CodecKind::Zstd => CodecType::Zstd,
            CodecKind::ZstdDictionary => CodecType::ZstdDictionary,
        }
    }
}

/// A compress/decompress strategy
pub trait Codec: Send + Sync {
    fn codec_type(&self) -> CodecType;

    /// Payloads below this size are stored raw
    fn compression_threshold(&self) -> usize;

    /// Compress `src` into `dst` (cleared first). Returns the compressed length.
    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize>;

    /// Decompress `src` into `dst` (cleared first). `raw_len` is the exact
    /// expected output size; any other size is corruption.
    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, raw_len: usize) -> Result<usize>;

    fn stats(&self) -> &CodecStats;

    /// Write any trained dictionaries to `dir`. Returns how many were written.
    fn export_dictionaries(&self, _dir: &Path) -> Result<usize> {
        Ok(0)
    }

    /// Load dictionaries found in `dir`. Returns how many were loaded.
    fn import_dictionaries(&self, _dir: &Path) -> Result<usize> {
        Ok(0)
    }
}

impl fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("type", &self.codec_type())
            .field("threshold", &self.compression_threshold())
            .finish()
    }
}

/// Check a decompressed size against the size recorded with the payload
pub(crate) fn check_raw_len(codec: CodecType, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(BurrowError::Corruption(format!(
            "{:?} payload decompressed to {} bytes, expected {}",
            codec, actual, expected
        )));
    }
    Ok(())
}

// =============================================================================
// Statistics
// =============================================================================

/// Lock-free counters kept by every codec
#[derive(Debug, Default)]
pub struct CodecStats {
    compress_calls: AtomicU64,
    decompress_calls: AtomicU64,
    raw_bytes_in: AtomicU64,
    compressed_bytes_out: AtomicU64,
    decompressed_bytes: AtomicU64,
}

impl CodecStats {
    pub fn record_compress(&self, raw: usize, compressed: usize) {
        self.compress_calls.fetch_add(1, Ordering::Relaxed);
        self.raw_bytes_in.fetch_add(raw as u64, Ordering::Relaxed);
        self.compressed_bytes_out
            .fetch_add(compressed as u64, Ordering::Relaxed);
    }

    pub fn record_decompress(&self, raw: usize) {
        self.decompress_calls.fetch_add(1, Ordering::Relaxed);
        self.decompressed_bytes.fetch_add(raw as u64, Ordering::Relaxed);
    }

    pub fn compress_calls(&self) -> u64 {
        self.compress_calls.load(Ordering::Relaxed)
    }

    pub fn decompress_calls(&self) -> u64 {
        self.decompress_calls.load(Ordering::Relaxed)
    }

    /// Raw bytes in / compressed bytes out over all compress calls.
    /// 0.0 before the first call.
    pub fn average_ratio(&self) -> f64 {
        let out = self.compressed_bytes_out.load(Ordering::Relaxed);
        if out == 0 {
            return 0.0;
        }
        self.raw_bytes_in.load(Ordering::Relaxed) as f64 / out as f64
    }

    /// Uncompressed bytes processed in either direction
    pub fn total_bytes(&self) -> u64 {
        self.raw_bytes_in.load(Ordering::Relaxed) + self.decompressed_bytes.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Construction / Registry
// =============================================================================

/// Build the codec selected by `kind`; `None` for [`CodecKind::None`].
pub fn create(kind: CodecKind, config: &Config) -> Result<Option<Arc<dyn Codec>>> {
    let codec: Arc<dyn Codec> = match kind {
        CodecKind::None => return Ok(None),
        CodecKind::Lz4 => Arc::new(Lz4Codec::new()),
        CodecKind::Zstd => Arc::new(ZstdCodec::new(config.compression_level)),
        CodecKind::ZstdDictionary => Arc::new(DictionaryCodec::open(
            config.compression_level,
            config.dictionary_size,
            config.dictionary_training_bytes,
            config.dictionary_dir.clone(),
        )?),
    };
    Ok(Some(codec))
}

/// The active codec plus every codec a stored block may still need
pub struct CodecRegistry {
    active: RwLock<Option<Arc<dyn Codec>>>,
    known: RwLock<HashMap<CodecType, Arc<dyn Codec>>>,
    config: Config,
}

impl CodecRegistry {
    pub fn new(config: &Config) -> Result<Self> {
        let active = create(config.codec, config)?;
        let mut known = HashMap::new();
        if let Some(codec) = &active {
            known.insert(codec.codec_type(), Arc::clone(codec));
        }
        Ok(Self {
            active: RwLock::new(active),
            known: RwLock::new(known),
            config: config.clone(),
        })
    }

    /// Codec used for new compression, if any
    pub fn active(&self) -> Option<Arc<dyn Codec>> {
        self.active.read().clone()
    }

    /// Replace the active codec. The previous one stays available for
    /// blocks it already compressed.
    pub fn set_active(&self, codec: Option<Arc<dyn Codec>>) {
        if let Some(codec) = &codec {
            self.known
                .write()
                .insert(codec.codec_type(), Arc::clone(codec));
        }
        *self.active.write() = codec;
    }

    /// Every codec instantiated so far
    pub fn known(&self) -> Vec<Arc<dyn Codec>> {
        self.known.read().values().cloned().collect()
    }

    /// Codec able to decompress payloads tagged with `codec_type`
    pub fn resolve(&self, codec_type: CodecType) -> Result<Arc<dyn Codec>> {
        if let Some(codec) = self.known.read().get(&codec_type) {
            return Ok(Arc::clone(codec));
        }

        let mut known = self.known.write();
        if let Some(codec) = known.get(&codec_type) {
            return Ok(Arc::clone(codec));
        }
        let codec = create(codec_type.kind(), &self.config)?.ok_or_else(|| {
            BurrowError::Corruption("compressed payload tagged with codec NONE".to_string())
        })?;
        known.insert(codec_type, Arc::clone(&codec));
        Ok(codec)
    }
}
