//! Data Block Module
//!
//! A capacity-bounded, sorted run of records. The store routes each key to
//! exactly one block; the block keeps its records packed in key order and
//! signals when it has grown past the configured maximum so the store can
//! split it.
//!
//! ## Responsibilities
//! - Binary search, insert, overwrite and delete within the run
//! - Split an oversized block at the byte median into sorted pieces
//! - Whole-block compression, undone transparently on the next write
//! - Run the per-kind release hook when a record is overwritten or deleted
//!
//! ## States
//! ```text
//!   ┌──────────────────────────┐   compress()   ┌───────────────────────────┐
//!   │ Raw                      │ ─────────────► │ Compressed                │
//!   │  data:    packed records │                │  payload (codec output)   │
//!   │  offsets: u32 per record │ ◄───────────── │  codec id, raw len, count │
//!   └──────────────────────────┘   make_raw()   └───────────────────────────┘
//! ```
//! Reads of a compressed block decode into a scratch copy; writes restore
//! the raw state first.

mod image;
mod records;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::chain::ChainArena;
use crate::codec::{Codec, CodecRegistry, CodecType};
use crate::error::{BurrowError, Result};
use crate::memory::{Allocation, MemoryTracker};
use crate::record::{self, RecordKind, RecordView};

pub use self::image::{BlockImage, IMAGE_MAGIC, IMAGE_VERSION};
pub use self::records::{OwnedRecords, RecordsRef, OFFSET_SIZE};

use self::records::shift_offsets;

/// Store-wide collaborators a block needs while mutating
pub struct BlockContext<'a> {
    pub codecs: &'a CodecRegistry,
    pub chains: &'a ChainArena,
    pub max_block_size: usize,
}

/// Outcome of [`DataBlock::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Stored; the block is within its size limit
    Done,
    /// Stored, but the block is now over its size limit
    MustSplit,
    /// Not stored: the memory ceiling would be breached
    OutOfMemory,
}

enum BlockState {
    Raw {
        data: Allocation,
        offsets: Allocation,
    },
    Compressed {
        payload: Allocation,
        codec: CodecType,
        raw_len: usize,
        count: usize,
    },
}

/// Records of a block as seen by a reader
pub enum BlockRecords<'a> {
    Raw(RecordsRef<'a>),
    Decompressed(OwnedRecords),
}

impl BlockRecords<'_> {
    pub fn view(&self) -> RecordsRef<'_> {
        match self {
            BlockRecords::Raw(records) => *records,
            BlockRecords::Decompressed(owned) => owned.view(),
        }
    }
}

/// A sorted, capacity-bounded run of records
pub struct DataBlock {
    state: BlockState,
    tracker: Arc<MemoryTracker>,
    /// Payload bytes currently reported through `add_data`
    accounted: i64,
    /// Milliseconds since the process clock origin of the last access
    last_access: AtomicU64,
}

impl DataBlock {
    /// Empty raw block
    pub fn new(tracker: &Arc<MemoryTracker>) -> Self {
        Self::from_parts(
            tracker,
            Allocation::copy_forced(tracker, &[]),
            Allocation::copy_forced(tracker, &[]),
        )
    }

    /// Raw block over an already sorted run. Returns `None` if the memory
    /// ceiling does not allow the copy.
    pub fn from_records(tracker: &Arc<MemoryTracker>, records: RecordsRef<'_>) -> Option<Self> {
        let data = Allocation::copy_from(tracker, records.data())?;
        let offsets = Allocation::copy_from(tracker, records.offsets())?;
        Some(Self::from_parts(tracker, data, offsets))
    }

    /// Block kept in compressed form. Returns `None` if the memory ceiling
    /// does not allow the copy.
    pub fn from_compressed(
        tracker: &Arc<MemoryTracker>,
        payload: &[u8],
        codec: CodecType,
        raw_len: usize,
        count: usize,
    ) -> Option<Self> {
        let payload = Allocation::copy_from(tracker, payload)?;
        let mut block = Self {
            state: BlockState::Compressed {
                payload,
                codec,
                raw_len,
                count,
            },
            tracker: Arc::clone(tracker),
            accounted: 0,
            last_access: AtomicU64::new(now_millis()),
        };
        block.account();
        Some(block)
    }

    fn from_parts(tracker: &Arc<MemoryTracker>, data: Allocation, offsets: Allocation) -> Self {
        let mut block = Self {
            state: BlockState::Raw { data, offsets },
            tracker: Arc::clone(tracker),
            accounted: 0,
            last_access: AtomicU64::new(now_millis()),
        };
        block.account();
        block
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of records
    pub fn len(&self) -> usize {
        match &self.state {
            BlockState::Raw { offsets, .. } => offsets.len() / OFFSET_SIZE,
            BlockState::Compressed { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded size of all records, independent of compression
    pub fn encoded_size(&self) -> usize {
        match &self.state {
            BlockState::Raw { data, .. } => data.len(),
            BlockState::Compressed { raw_len, .. } => *raw_len,
        }
    }

    /// Bytes the payload occupies right now
    pub fn stored_size(&self) -> usize {
        match &self.state {
            BlockState::Raw { data, .. } => data.len(),
            BlockState::Compressed { payload, .. } => payload.len(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.state, BlockState::Compressed { .. })
    }

    /// Codec of the stored form ([`CodecType::None`] when raw)
    pub fn codec_type(&self) -> CodecType {
        match &self.state {
            BlockState::Raw { .. } => CodecType::None,
            BlockState::Compressed { codec, .. } => *codec,
        }
    }

    /// Compressed payload, if the block is compressed
    pub fn compressed_payload(&self) -> Option<&[u8]> {
        match &self.state {
            BlockState::Raw { .. } => None,
            BlockState::Compressed { payload, .. } => Some(payload.as_slice()),
        }
    }

    /// Whether an insert pushed the block past `max_block_size`
    pub fn needs_split(&self, max_block_size: usize) -> bool {
        match &self.state {
            BlockState::Raw { data, offsets } => {
                data.len() > max_block_size && offsets.len() >= 2 * OFFSET_SIZE
            }
            BlockState::Compressed { .. } => false,
        }
    }

    /// Record the current time as the last access
    pub fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last access
    pub fn idle_for(&self) -> Duration {
        let last = self.last_access.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The block's records, decoded into a scratch copy if compressed
    pub fn records(&self, codecs: &CodecRegistry) -> Result<BlockRecords<'_>> {
        match &self.state {
            BlockState::Raw { data, offsets } => Ok(BlockRecords::Raw(RecordsRef::new(
                data.as_slice(),
                offsets.as_slice(),
            ))),
            BlockState::Compressed {
                payload,
                codec,
                raw_len,
                count,
            } => Ok(BlockRecords::Decompressed(decode_payload(
                codecs,
                *codec,
                payload.as_slice(),
                *raw_len,
                *count,
            )?)),
        }
    }

    /// Find `key` and hand its record to `f`
    pub fn lookup<R>(
        &self,
        key: &[u8],
        codecs: &CodecRegistry,
        f: impl FnOnce(RecordView<'_>) -> Result<R>,
    ) -> Result<Option<R>> {
        let records = self.records(codecs)?;
        let view = records.view();
        match view.find(key)? {
            Ok(i) => f(view.record(i)?).map(Some),
            Err(_) => Ok(None),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or overwrite a record in sorted position.
    ///
    /// On overwrite the previous record's release hook runs, after the new
    /// bytes are known to fit.
    pub fn insert(
        &mut self,
        kind: RecordKind,
        key: &[u8],
        value: &[u8],
        expire_at: Option<u64>,
        ctx: &BlockContext<'_>,
    ) -> Result<Insert> {
        let encoded = record::encode(kind, key, value, expire_at);
        let (data, offsets) = self.raw_mut(ctx.codecs)?;

        let (found, start, end, count) = {
            let records = RecordsRef::new(data.as_slice(), offsets.as_slice());
            let count = records.len();
            match records.find(key)? {
                Ok(i) => (Ok(i), records.offset(i), records.end_of(i), count),
                Err(i) if i < count => (Err(i), records.offset(i), records.offset(i), count),
                Err(i) => (Err(i), data.len(), data.len(), count),
            }
        };

        match found {
            Ok(i) => {
                let old_len = end - start;
                let needed = data.len() - old_len + encoded.len();
                if !data.ensure_capacity(needed) {
                    return Ok(Insert::OutOfMemory);
                }
                let previous = record::decode_at(data.as_slice(), start)?;
                let (old_kind, old_value) = (previous.kind, previous.value.to_vec());

                data.buf_mut().splice(start..end, encoded.iter().copied());
                shift_offsets(
                    offsets.buf_mut(),
                    i + 1,
                    encoded.len() as i64 - old_len as i64,
                );
                old_kind.release(&old_value, ctx.chains)?;
            }
            Err(i) => {
                if !data.ensure_capacity(data.len() + encoded.len())
                    || !offsets.ensure_capacity((count + 1) * OFFSET_SIZE)
                {
                    return Ok(Insert::OutOfMemory);
                }
                data.buf_mut().splice(start..start, encoded.iter().copied());
                let at = i * OFFSET_SIZE;
                offsets
                    .buf_mut()
                    .splice(at..at, (start as u32).to_le_bytes());
                shift_offsets(offsets.buf_mut(), i + 1, encoded.len() as i64);
            }
        }

        self.touch();
        self.account();
        if self.needs_split(ctx.max_block_size) {
            Ok(Insert::MustSplit)
        } else {
            Ok(Insert::Done)
        }
    }

    /// Remove `key`; false if it was absent
    pub fn delete(&mut self, key: &[u8], ctx: &BlockContext<'_>) -> Result<bool> {
        let (data, offsets) = self.raw_mut(ctx.codecs)?;

        let (i, start, end) = {
            let records = RecordsRef::new(data.as_slice(), offsets.as_slice());
            match records.find(key)? {
                Ok(i) => (i, records.offset(i), records.end_of(i)),
                Err(_) => return Ok(false),
            }
        };

        let removed = record::decode_at(data.as_slice(), start)?;
        let (kind, value) = (removed.kind, removed.value.to_vec());

        data.buf_mut().drain(start..end);
        offsets
            .buf_mut()
            .drain(i * OFFSET_SIZE..(i + 1) * OFFSET_SIZE);
        shift_offsets(offsets.buf_mut(), i, -((end - start) as i64));

        if data.is_empty() {
            data.shrink_to_fit();
            offsets.shrink_to_fit();
        }

        self.touch();
        self.account();
        kind.release(&value, ctx.chains)?;
        Ok(true)
    }

    /// Split an oversized block at the byte median, repeatedly, until every
    /// piece fits `max_block_size` or holds a single record.
    ///
    /// The first piece stays in `self`; the others are returned with their
    /// first keys, in key order. Returns `None` (block untouched) if the
    /// memory ceiling does not allow the new pieces.
    pub fn split(&mut self, max_block_size: usize) -> Result<Option<Vec<(Vec<u8>, DataBlock)>>> {
        let BlockState::Raw { data, offsets } = &mut self.state else {
            return Ok(Some(Vec::new()));
        };

        let (keep_bytes, keep_records, pieces) = {
            let records = RecordsRef::new(data.as_slice(), offsets.as_slice());
            let mut cuts = Vec::new();
            split_points(&records, 0, records.len(), max_block_size, &mut cuts);
            let Some(&first_cut) = cuts.first() else {
                return Ok(Some(Vec::new()));
            };

            let ends = cuts.iter().copied().skip(1).chain(std::iter::once(records.len()));
            let mut pieces = Vec::with_capacity(cuts.len());
            for (lo, hi) in cuts.iter().copied().zip(ends) {
                let owned = records.slice_owned(lo, hi);
                let Some(piece) = DataBlock::from_records(&self.tracker, owned.view()) else {
                    return Ok(None);
                };
                pieces.push((records.key(lo)?.to_vec(), piece));
            }
            (records.offset(first_cut), first_cut, pieces)
        };

        data.buf_mut().truncate(keep_bytes);
        offsets.buf_mut().truncate(keep_records * OFFSET_SIZE);
        data.shrink_to_fit();
        offsets.shrink_to_fit();
        self.account();

        tracing::debug!(
            "Split block into {} pieces ({} records kept)",
            pieces.len() + 1,
            keep_records
        );
        Ok(Some(pieces))
    }

    /// Compress the whole block with `codec`.
    ///
    /// Skipped (returns false) if already compressed, below the codec's
    /// threshold, when compression gains nothing, or when the payload copy
    /// would breach the memory ceiling.
    pub fn compress(&mut self, codec: &dyn Codec) -> Result<bool> {
        let BlockState::Raw { data, offsets } = &self.state else {
            return Ok(false);
        };
        if data.len() < codec.compression_threshold() {
            return Ok(false);
        }

        let mut out = Vec::new();
        codec.compress(data.as_slice(), &mut out)?;
        if out.len() >= data.len() {
            return Ok(false);
        }

        let raw_len = data.len();
        let count = offsets.len() / OFFSET_SIZE;
        let Some(payload) = Allocation::copy_from(&self.tracker, &out) else {
            return Ok(false);
        };

        self.state = BlockState::Compressed {
            payload,
            codec: codec.codec_type(),
            raw_len,
            count,
        };
        self.account();
        tracing::debug!(
            "Compressed block: {} -> {} bytes ({:?})",
            raw_len,
            out.len(),
            codec.codec_type()
        );
        Ok(true)
    }

    /// Restore the raw state if the block is compressed
    pub fn make_raw(&mut self, codecs: &CodecRegistry) -> Result<()> {
        self.raw_mut(codecs).map(|_| ())
    }

    fn raw_mut(&mut self, codecs: &CodecRegistry) -> Result<(&mut Allocation, &mut Allocation)> {
        if let BlockState::Compressed {
            payload,
            codec,
            raw_len,
            count,
        } = &self.state
        {
            let owned = decode_payload(codecs, *codec, payload.as_slice(), *raw_len, *count)?;
            self.state = BlockState::Raw {
                data: Allocation::copy_forced(&self.tracker, owned.data()),
                offsets: Allocation::copy_forced(&self.tracker, owned.offsets()),
            };
            self.account();
        }

        match &mut self.state {
            BlockState::Raw { data, offsets } => Ok((data, offsets)),
            BlockState::Compressed { .. } => Err(BurrowError::Corruption(
                "block still compressed after decompression".to_string(),
            )),
        }
    }

    fn account(&mut self) {
        let now = self.stored_size() as i64;
        if now != self.accounted {
            self.tracker.add_data(now - self.accounted);
            self.accounted = now;
        }
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        self.tracker.add_data(-self.accounted);
    }
}

/// Decompress a block payload and check it against the recorded shape
pub(crate) fn decode_payload(
    codecs: &CodecRegistry,
    codec: CodecType,
    payload: &[u8],
    raw_len: usize,
    count: usize,
) -> Result<OwnedRecords> {
    let raw = if codec == CodecType::None {
        payload.to_vec()
    } else {
        let mut raw = Vec::with_capacity(raw_len);
        codecs.resolve(codec)?.decompress(payload, &mut raw, raw_len)?;
        raw
    };
    if raw.len() != raw_len {
        return Err(BurrowError::Corruption(format!(
            "block payload is {} bytes, expected {}",
            raw.len(),
            raw_len
        )));
    }

    let owned = OwnedRecords::from_data(raw)?;
    if owned.len() != count {
        return Err(BurrowError::Corruption(format!(
            "block holds {} records, expected {}",
            owned.len(),
            count
        )));
    }
    Ok(owned)
}

/// Cut positions splitting `[lo, hi)` into pieces of at most `max` bytes
fn split_points(records: &RecordsRef<'_>, lo: usize, hi: usize, max: usize, out: &mut Vec<usize>) {
    if hi - lo < 2 {
        return;
    }
    let start = records.offset(lo);
    let end = records.end_of(hi - 1);
    if end - start <= max {
        return;
    }

    // First record starting at or past the byte median
    let half = start + (end - start) / 2;
    let (mut a, mut b) = (lo + 1, hi - 1);
    while a < b {
        let mid = a + (b - a) / 2;
        if records.offset(mid) < half {
            a = mid + 1;
        } else {
            b = mid;
        }
    }

    split_points(records, lo, a, max, out);
    out.push(a);
    split_points(records, a, hi, max, out);
}

fn clock_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

fn now_millis() -> u64 {
    clock_origin().elapsed().as_millis() as u64
}
