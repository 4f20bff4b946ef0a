//! LZ4 codec
//!
//! Raw LZ4 block format (no frame); the decompressed size comes from the
//! block header, so it is not repeated in the payload.

use crate::error::{BurrowError, Result};

use super::{check_raw_len, Codec, CodecStats, CodecType};

/// Below this size LZ4 rarely wins anything
const LZ4_THRESHOLD: usize = 64;

/// Fast codec
#[derive(Debug, Default)]
pub struct Lz4Codec {
    stats: CodecStats,
}

impl Lz4Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for Lz4Codec {
    fn codec_type(&self) -> CodecType {
        CodecType::Lz4
    }

    fn compression_threshold(&self) -> usize {
        LZ4_THRESHOLD
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        dst.clear();
        dst.resize(lz4_flex::block::get_maximum_output_size(src.len()), 0);
        let written = lz4_flex::block::compress_into(src, dst)
            .map_err(|e| BurrowError::Compression(format!("lz4 compress: {}", e)))?;
        dst.truncate(written);
        self.stats.record_compress(src.len(), written);
        Ok(written)
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, raw_len: usize) -> Result<usize> {
        dst.clear();
        dst.resize(raw_len, 0);
        let written = lz4_flex::block::decompress_into(src, dst)
            .map_err(|e| BurrowError::Corruption(format!("lz4 decompress: {}", e)))?;
        check_raw_len(CodecType::Lz4, written, raw_len)?;
        self.stats.record_decompress(written);
        Ok(written)
    }

    fn stats(&self) -> &CodecStats {
        &self.stats
    }
}
