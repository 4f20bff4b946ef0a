//! Block Image
//!
//! The persisted form of one data block inside a snapshot directory.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (24 bytes)                                            │
//! │   Magic: "BRWB" (4) | Version: u16 (2) | Codec: u8 (1)       │
//! │   Reserved: u8 (1) | Count: u32 (4) | RawLen: u32 (4)        │
//! │   PayloadLen: u32 (4) | FirstKeyLen: u32 (4)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ First key (FirstKeyLen bytes)                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload (PayloadLen bytes)                                   │
//! │   packed records, compressed with Codec unless Codec = NONE  │
//! │   nested values are inlined, never stored as handles         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Footer: CRC32 of everything above (4)                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//! All integers little-endian. The first key is the block's index key, so
//! the store index is rebuilt from headers alone.

use bytes::{Buf, BufMut};

use crate::codec::CodecType;
use crate::error::{BurrowError, Result};

/// Magic bytes identifying a block image
pub const IMAGE_MAGIC: &[u8; 4] = b"BRWB";

/// Current image format version
pub const IMAGE_VERSION: u16 = 1;

/// Magic (4) + Version (2) + Codec (1) + Reserved (1) + Count (4)
/// + RawLen (4) + PayloadLen (4) + FirstKeyLen (4)
const HEADER_SIZE: usize = 24;

const FOOTER_SIZE: usize = 4;

/// One block as stored in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockImage {
    /// Index key of the block
    pub first_key: Vec<u8>,
    pub codec: CodecType,
    /// Number of records in the payload
    pub count: u32,
    /// Size of the payload once decompressed
    pub raw_len: u32,
    pub payload: Vec<u8>,
}

impl BlockImage {
    /// Serialize to the on-disk format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_SIZE + self.first_key.len() + self.payload.len() + FOOTER_SIZE,
        );
        buf.put_slice(IMAGE_MAGIC);
        buf.put_u16_le(IMAGE_VERSION);
        buf.put_u8(self.codec as u8);
        buf.put_u8(0);
        buf.put_u32_le(self.count);
        buf.put_u32_le(self.raw_len);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(self.first_key.len() as u32);
        buf.put_slice(&self.first_key);
        buf.put_slice(&self.payload);

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Parse and verify an image. Any mismatch is corruption.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(BurrowError::Corruption(format!(
                "block image too short: {} bytes",
                bytes.len()
            )));
        }

        let (body, mut footer) = bytes.split_at(bytes.len() - FOOTER_SIZE);
        let stored_crc = footer.get_u32_le();
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(BurrowError::Corruption(format!(
                "block image CRC mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, actual_crc
            )));
        }

        let mut cursor = body;
        if &cursor[..4] != IMAGE_MAGIC {
            return Err(BurrowError::Corruption(format!(
                "invalid block image magic: {:?}",
                &cursor[..4]
            )));
        }
        cursor.advance(4);

        let version = cursor.get_u16_le();
        if version != IMAGE_VERSION {
            return Err(BurrowError::Corruption(format!(
                "unsupported block image version: {}",
                version
            )));
        }

        let codec = CodecType::from_u8(cursor.get_u8())?;
        let _reserved = cursor.get_u8();
        let count = cursor.get_u32_le();
        let raw_len = cursor.get_u32_le();
        let payload_len = cursor.get_u32_le() as usize;
        let key_len = cursor.get_u32_le() as usize;

        if cursor.len() != key_len + payload_len {
            return Err(BurrowError::Corruption(format!(
                "block image body is {} bytes, header claims {}",
                cursor.len(),
                key_len + payload_len
            )));
        }
        let (first_key, payload) = cursor.split_at(key_len);

        if codec == CodecType::None && payload.len() != raw_len as usize {
            return Err(BurrowError::Corruption(format!(
                "raw block image payload is {} bytes, header claims {}",
                payload.len(),
                raw_len
            )));
        }

        Ok(Self {
            first_key: first_key.to_vec(),
            codec,
            count,
            raw_len,
            payload: payload.to_vec(),
        })
    }
}
