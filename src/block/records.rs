//! Sorted record runs
//!
//! A run is a packed byte buffer of records in key order plus a parallel
//! offset table (`u32` LE per record). Both the live block buffers and the
//! scratch copies made for scanners and compressed blocks are read through
//! [`RecordsRef`].

use std::cmp::Ordering;

use crate::error::{BurrowError, Result};
use crate::record::{self, RecordView};

/// Size of one offset table entry
pub const OFFSET_SIZE: usize = 4;

/// Borrowed view over a sorted run
#[derive(Debug, Clone, Copy)]
pub struct RecordsRef<'a> {
    data: &'a [u8],
    offsets: &'a [u8],
}

impl<'a> RecordsRef<'a> {
    pub fn new(data: &'a [u8], offsets: &'a [u8]) -> Self {
        Self { data, offsets }
    }

    pub fn len(&self) -> usize {
        self.offsets.len() / OFFSET_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Packed record bytes
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Offset table (`u32` LE per record)
    pub fn offsets(&self) -> &'a [u8] {
        self.offsets
    }

    /// Start of record `i`
    pub fn offset(&self, i: usize) -> usize {
        read_offset(self.offsets, i)
    }

    /// One past the last byte of record `i`
    pub fn end_of(&self, i: usize) -> usize {
        if i + 1 < self.len() {
            self.offset(i + 1)
        } else {
            self.data.len()
        }
    }

    /// Byte range covered by records `[lo, hi)`
    pub fn span(&self, lo: usize, hi: usize) -> &'a [u8] {
        if lo >= hi {
            return &[];
        }
        &self.data[self.offset(lo)..self.end_of(hi - 1)]
    }

    pub fn record(&self, i: usize) -> Result<RecordView<'a>> {
        if i >= self.len() {
            return Err(BurrowError::Corruption(format!(
                "record {} out of range ({} records)",
                i,
                self.len()
            )));
        }
        record::decode_at(self.data, self.offset(i))
    }

    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        Ok(self.record(i)?.key)
    }

    pub fn first_key(&self) -> Result<Option<&'a [u8]>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.key(0).map(Some)
    }

    /// Binary search: `Ok(position)` if `key` is present, otherwise
    /// `Err(insertion point)`.
    pub fn find(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// First position whose key is `>= key`
    pub fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        Ok(match self.find(key)? {
            Ok(i) | Err(i) => i,
        })
    }

    /// Positions `[start, end)` of records with `lower <= key < upper`.
    /// `None` bounds are open.
    pub fn window(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Result<(usize, usize)> {
        let start = match lower {
            Some(lo) => self.lower_bound(lo)?,
            None => 0,
        };
        let end = match upper {
            Some(hi) => self.lower_bound(hi)?.max(start),
            None => self.len(),
        };
        Ok((start, end))
    }

    /// Copy records `[lo, hi)` into an owned run
    pub fn slice_owned(&self, lo: usize, hi: usize) -> OwnedRecords {
        if lo >= hi {
            return OwnedRecords::default();
        }
        let base = self.offset(lo);
        let mut offsets = Vec::with_capacity((hi - lo) * OFFSET_SIZE);
        for i in lo..hi {
            offsets.extend_from_slice(&((self.offset(i) - base) as u32).to_le_bytes());
        }
        OwnedRecords {
            data: self.span(lo, hi).to_vec(),
            offsets,
        }
    }

    /// Check that keys are strictly increasing
    pub fn check_sorted(&self) -> Result<()> {
        for i in 1..self.len() {
            if self.key(i - 1)? >= self.key(i)? {
                return Err(BurrowError::Corruption(format!(
                    "records {} and {} out of order",
                    i - 1,
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Owned sorted run (decompressed block or scanner copy)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedRecords {
    data: Vec<u8>,
    offsets: Vec<u8>,
}

impl OwnedRecords {
    /// Index a packed run; fails if it does not decode cleanly
    pub fn from_data(data: Vec<u8>) -> Result<Self> {
        let offsets = record::scan_offsets(&data)?
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect();
        Ok(Self { data, offsets })
    }

    pub fn view(&self) -> RecordsRef<'_> {
        RecordsRef::new(&self.data, &self.offsets)
    }

    pub fn len(&self) -> usize {
        self.offsets.len() / OFFSET_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offsets(&self) -> &[u8] {
        &self.offsets
    }
}

pub(crate) fn read_offset(offsets: &[u8], i: usize) -> usize {
    let at = i * OFFSET_SIZE;
    u32::from_le_bytes([offsets[at], offsets[at + 1], offsets[at + 2], offsets[at + 3]]) as usize
}

/// Add `delta` to every offset from entry `from` on
pub(crate) fn shift_offsets(offsets: &mut [u8], from: usize, delta: i64) {
    if delta == 0 {
        return;
    }
    for chunk in offsets[from * OFFSET_SIZE..].chunks_exact_mut(OFFSET_SIZE) {
        let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64 + delta;
        chunk.copy_from_slice(&(value as u32).to_le_bytes());
    }
}
