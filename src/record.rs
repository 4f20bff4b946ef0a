//! Record format
//!
//! The binary layout of one key-value entry inside a data block.
//!
//! ## Layout
//! ```text
//! ┌─────────┬──────────┬───────────┬───────────┬──────────────┬─────┬───────┐
//! │ Kind (1)│ Flags (1)│ KeyLen (4)│ ValLen (4)│ ExpireAt (8)?│ Key │ Value │
//! └─────────┴──────────┴───────────┴───────────┴──────────────┴─────┴───────┘
//! ```
//! - All integers little-endian
//! - `ExpireAt` is present only when `FLAG_EXPIRE` is set
//! - `Kind` selects how the value is released and (de)serialized; a
//!   [`RecordKind::Chain`] value is a handle into the store's chain arena

use bytes::{Buf, BufMut};

use crate::error::{BurrowError, Result};

/// Fixed header size: kind (1) + flags (1) + key_len (4) + val_len (4)
pub const RECORD_HEADER_SIZE: usize = 10;

/// Size of the optional expiration timestamp
pub const EXPIRE_SIZE: usize = 8;

/// Flag bit: the record carries an expiration timestamp
pub const FLAG_EXPIRE: u8 = 0x01;

/// How a record's value is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Value bytes are stored inline
    Flat = 0x00,

    /// Value is an 8-byte handle to a chain of segments held outside the block
    Chain = 0x01,
}

impl RecordKind {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0x00 => Ok(RecordKind::Flat),
            0x01 => Ok(RecordKind::Chain),
            other => Err(BurrowError::Corruption(format!(
                "unknown record kind: {:#04x}",
                other
            ))),
        }
    }
}

/// An owned key-value record as returned to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Expiration timestamp (unix millis), if any
    pub expire_at: Option<u64>,
}

/// A record borrowed from a block buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub kind: RecordKind,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub expire_at: Option<u64>,
}

impl<'a> RecordView<'a> {
    /// Encoded size of this record
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.key.len(), self.value.len(), self.expire_at.is_some())
    }
}

/// Encoded size of a record with the given shape
pub fn encoded_len(key_len: usize, value_len: usize, has_expire: bool) -> usize {
    RECORD_HEADER_SIZE + if has_expire { EXPIRE_SIZE } else { 0 } + key_len + value_len
}

/// Append an encoded record to `buf`
pub fn encode_into(
    buf: &mut Vec<u8>,
    kind: RecordKind,
    key: &[u8],
    value: &[u8],
    expire_at: Option<u64>,
) {
    buf.reserve(encoded_len(key.len(), value.len(), expire_at.is_some()));
    buf.put_u8(kind as u8);
    buf.put_u8(if expire_at.is_some() { FLAG_EXPIRE } else { 0 });
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    if let Some(ts) = expire_at {
        buf.put_u64_le(ts);
    }
    buf.put_slice(key);
    buf.put_slice(value);
}

/// Encode a record into a fresh buffer
pub fn encode(kind: RecordKind, key: &[u8], value: &[u8], expire_at: Option<u64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(key.len(), value.len(), expire_at.is_some()));
    encode_into(&mut buf, kind, key, value, expire_at);
    buf
}

/// Decode the record starting at `offset` in `data`.
///
/// Every length is checked against the buffer; a record running past the
/// end is reported as corruption.
pub fn decode_at(data: &[u8], offset: usize) -> Result<RecordView<'_>> {
    let mut cursor = data.get(offset..).ok_or_else(|| {
        BurrowError::Corruption(format!(
            "record offset {} beyond block of {} bytes",
            offset,
            data.len()
        ))
    })?;

    if cursor.len() < RECORD_HEADER_SIZE {
        return Err(BurrowError::Corruption(format!(
            "truncated record header at offset {}",
            offset
        )));
    }

    let kind = RecordKind::from_u8(cursor.get_u8())?;
    let flags = cursor.get_u8();
    let key_len = cursor.get_u32_le() as usize;
    let val_len = cursor.get_u32_le() as usize;

    let expire_at = if flags & FLAG_EXPIRE != 0 {
        if cursor.len() < EXPIRE_SIZE {
            return Err(BurrowError::Corruption(format!(
                "truncated expiration at offset {}",
                offset
            )));
        }
        Some(cursor.get_u64_le())
    } else {
        None
    };

    if cursor.len() < key_len + val_len {
        return Err(BurrowError::Corruption(format!(
            "record at offset {} claims {} bytes, only {} left",
            offset,
            key_len + val_len,
            cursor.len()
        )));
    }

    let (key, rest) = cursor.split_at(key_len);
    let value = &rest[..val_len];

    Ok(RecordView {
        kind,
        key,
        value,
        expire_at,
    })
}

/// Walk a packed run of records and return each record's start offset.
/// Fails if the run does not end exactly on a record boundary.
pub fn scan_offsets(data: &[u8]) -> Result<Vec<u32>> {
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let record = decode_at(data, pos)?;
        offsets.push(pos as u32);
        pos += record.encoded_len();
    }
    Ok(offsets)
}
