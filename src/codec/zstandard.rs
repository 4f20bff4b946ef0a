//! Zstandard codec

use crate::error::{BurrowError, Result};

use super::{check_raw_len, Codec, CodecStats, CodecType};

/// zstd frame overhead makes tiny payloads grow
const ZSTD_THRESHOLD: usize = 128;

/// High-compression codec
#[derive(Debug)]
pub struct ZstdCodec {
    level: i32,
    stats: CodecStats,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self {
            level,
            stats: CodecStats::default(),
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Codec for ZstdCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Zstd
    }

    fn compression_threshold(&self) -> usize {
        ZSTD_THRESHOLD
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        let frame = zstd::bulk::compress(src, self.level)
            .map_err(|e| BurrowError::Compression(format!("zstd compress: {}", e)))?;
        dst.clear();
        dst.extend_from_slice(&frame);
        self.stats.record_compress(src.len(), dst.len());
        Ok(dst.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, raw_len: usize) -> Result<usize> {
        let raw = zstd::bulk::decompress(src, raw_len)
            .map_err(|e| BurrowError::Corruption(format!("zstd decompress: {}", e)))?;
        check_raw_len(CodecType::Zstd, raw.len(), raw_len)?;
        *dst = raw;
        self.stats.record_decompress(raw_len);
        Ok(raw_len)
    }

    fn stats(&self) -> &CodecStats {
        &self.stats
    }
}
