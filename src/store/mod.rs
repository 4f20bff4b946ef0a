//! Sorted Store Module
//!
//! The engine proper: an ordered index from each block's first key to the
//! block, with point operations, atomic execution, range scanners and
//! memory accounting on top.
//!
//! ## Layout
//! ```text
//!   index: RwLock<BTreeMap<first key, Arc<RwLock<DataBlock>>>>
//!
//!   ""        ──► [ a .. f ]      leftmost block, always present
//!   "g"       ──► [ g .. m ]
//!   "n"       ──► [ n .. z ]
//! ```
//! Every key belongs to the block with the greatest index key `<=` it.
//! Blocks only ever split to the right or (when emptied) disappear, so the
//! leftmost block under the empty key is permanent.
//!
//! ## Concurrency
//! - The index lock is held only for lookups and for inserting/removing
//!   entries; it is never held while waiting for a block lock.
//! - Each operation locks its block, then re-checks under the index read
//!   lock that the block still owns the key. A split or removal that raced
//!   with the lookup makes the check fail and the operation retries.
//! - Lock order is always block, then index. Splits hold the block's write
//!   lock while publishing the new pieces.
//! - Writers to different blocks never contend; readers of a block share
//!   its read lock.

mod snapshot;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::block::{BlockContext, DataBlock, Insert};
use crate::chain::{ChainArena, ChainHandle};
use crate::codec::{Codec, CodecRegistry};
use crate::config::{Config, MIN_BLOCK_SIZE};
use crate::error::{BurrowError, Result};
use crate::keys;
use crate::memory::{MemoryPool, MemoryStats, MemoryTracker};
use crate::ops::{AtomicOperation, Current, Update};
use crate::record::{Entry, RecordKind};
use crate::scanner::Scanner;

pub use self::snapshot::{Manifest, ManifestBlock};

type BlockRef = Arc<RwLock<DataBlock>>;

/// Fixed cost charged per index entry on top of its key
const INDEX_ENTRY_OVERHEAD: u64 = 48;

/// How to find a block in the index
#[derive(Debug, Clone, Copy)]
pub(crate) enum Probe<'k> {
    /// Block owning `key` (greatest index key `<= key`)
    Floor(&'k [u8]),
    /// Greatest index key `< key`
    Below(&'k [u8]),
    /// Rightmost block
    Last,
}

/// Where a locked block sits in the index
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockSlot<'s> {
    pub index_key: &'s [u8],
    /// Index key of the following block; only filled in when requested
    pub next_key: Option<&'s [u8]>,
}

/// Ordered collection of data blocks
pub struct SortedStore {
    index: RwLock<BTreeMap<Vec<u8>, BlockRef>>,
    tracker: Arc<MemoryTracker>,
    chains: ChainArena,
    codecs: CodecRegistry,
    max_block_size: AtomicUsize,
    idle_compression: Option<Duration>,
}

impl SortedStore {
    /// Create a store with its own memory pool (`config.memory_limit`)
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = MemoryPool::new(config.memory_limit);
        Self::with_pool(config, pool)
    }

    /// Create a store charging a shared pool; the pool's ceiling applies
    /// instead of `config.memory_limit`.
    pub fn with_pool(config: Config, pool: Arc<MemoryPool>) -> Result<Self> {
        config.validate()?;
        let tracker = MemoryTracker::new(pool, config.statistics_enabled);
        let codecs = CodecRegistry::new(&config)?;

        let store = Self {
            index: RwLock::new(BTreeMap::new()),
            chains: ChainArena::new(Arc::clone(&tracker)),
            codecs,
            max_block_size: AtomicUsize::new(config.max_block_size),
            idle_compression: config.idle_compression,
            tracker,
        };
        store.charge_index(&[]);
        store
            .index
            .write()
            .insert(Vec::new(), Arc::new(RwLock::new(DataBlock::new(&store.tracker))));

        tracing::debug!(
            "Created store: max_block_size={}, codec={:?}",
            config.max_block_size,
            config.codec
        );
        Ok(store)
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Insert or overwrite `key`.
    ///
    /// Returns false only when the memory ceiling prevents the write.
    pub fn put(&self, key: &[u8], value: &[u8], expire_at: Option<u64>) -> Result<bool> {
        self.insert_record(RecordKind::Flat, key, value, expire_at)
    }

    /// Store a value made of several segments without concatenating them.
    /// Reads through [`get`](Self::get) see the concatenation.
    pub fn put_chain<S: AsRef<[u8]>>(
        &self,
        key: &[u8],
        segments: &[S],
        expire_at: Option<u64>,
    ) -> Result<bool> {
        let Some(handle) = self.chains.allocate(segments) else {
            tracing::warn!("Chain allocation rejected: memory ceiling reached");
            return Ok(false);
        };

        match self.insert_record(RecordKind::Chain, key, &handle.to_bytes(), expire_at) {
            Ok(true) => Ok(true),
            other => {
                self.chains.release(handle)?;
                other
            }
        }
    }

    /// Value of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_at(key, |record| record.kind.materialize(record.value, &self.chains))
    }

    /// Key, value and expiration of `key`
    pub fn get_entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.read_at(key, |record| {
            Ok(Entry {
                key: record.key.to_vec(),
                value: record.kind.materialize(record.value, &self.chains)?,
                expire_at: record.expire_at,
            })
        })
    }

    /// Segments of `key`; a flat value comes back as a single segment
    pub fn get_chain(&self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        self.read_at(key, |record| match record.kind {
            RecordKind::Flat => Ok(vec![record.value.to_vec()]),
            RecordKind::Chain => self.chains.read(ChainHandle::from_bytes(record.value)?),
        })
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.read_at(key, |_| Ok(()))?.is_some())
    }

    /// Remove `key`; false if it was absent
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.write_locked(key, false, |_, block, ctx| block.delete(key, ctx))
    }

    /// Run a read-modify-write operation with the owning block held
    /// exclusively for its whole duration.
    ///
    /// Returns false when the memory ceiling prevents storing the result.
    pub fn execute(&self, op: &mut dyn AtomicOperation) -> Result<bool> {
        let key = op.key().to_vec();
        self.write_locked(&key, false, |_, block, ctx| {
            block.make_raw(ctx.codecs)?;
            let found = block.lookup(&key, ctx.codecs, |record| {
                if record.kind != RecordKind::Flat {
                    return Err(BurrowError::OperationFailed(format!(
                        "atomic operation on a {:?} record",
                        record.kind
                    )));
                }
                op.apply(Some(Current {
                    value: record.value,
                    expire_at: record.expire_at,
                }))
            })?;
            let update = match found {
                Some(update) => update,
                None => op.apply(None)?,
            };

            match update {
                Update::Keep => Ok(true),
                Update::Put { value, expire_at } => {
                    let outcome = block.insert(RecordKind::Flat, &key, &value, expire_at, ctx)?;
                    if outcome == Insert::OutOfMemory {
                        op.rejected();
                        return Ok(false);
                    }
                    Ok(true)
                }
                Update::Delete => {
                    block.delete(&key, ctx)?;
                    Ok(true)
                }
            }
        })
    }

    fn insert_record(
        &self,
        kind: RecordKind,
        key: &[u8],
        value: &[u8],
        expire_at: Option<u64>,
    ) -> Result<bool> {
        if key.len() > u32::MAX as usize || value.len() > u32::MAX as usize {
            return Err(BurrowError::OperationFailed(format!(
                "record too large: key {} bytes, value {} bytes",
                key.len(),
                value.len()
            )));
        }

        let outcome = self.write_locked(key, false, |_, block, ctx| {
            block.insert(kind, key, value, expire_at, ctx)
        })?;
        if outcome == Insert::OutOfMemory {
            tracing::warn!(
                "Write rejected: memory ceiling of {} bytes reached",
                self.tracker.pool().limit()
            );
            return Ok(false);
        }
        Ok(true)
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Cursor over `[start, end)`.
    ///
    /// `None` or a zero-length key is an open bound; `start == end` probes
    /// the single key. A reverse request over a range holding no records
    /// returns `None`; a forward one returns an exhausted scanner.
    pub fn scanner(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Option<Scanner<'_>>> {
        Scanner::open(self, start, end, reverse)
    }

    /// Forward cursor over every key starting with `prefix`
    pub fn prefix_scanner(&self, prefix: &[u8]) -> Result<Scanner<'_>> {
        let end = keys::prefix_successor(prefix);
        Scanner::open_forward(self, Some(prefix), end.as_deref())
    }

    /// Count every record by walking all blocks. O(number of blocks),
    /// intended for verification.
    pub fn count_records(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut target = Vec::new();
        loop {
            let step = self.read_slot(Probe::Floor(&target), false, |slot, block| {
                let count = if slot.index_key == target.as_slice() {
                    block.len()
                } else {
                    let records = block.records(&self.codecs)?;
                    let view = records.view();
                    view.len() - view.lower_bound(&target)?
                };
                Ok((count, slot.next_key.map(<[u8]>::to_vec)))
            })?;
            let Some((count, next)) = step else {
                break;
            };
            total += count as u64;
            match next {
                Some(key) => target = key,
                None => break,
            }
        }
        Ok(total)
    }

    // =========================================================================
    // Compression
    // =========================================================================

    /// Compress every raw block with the active codec. Returns how many
    /// blocks were compressed.
    pub fn compress_all(&self) -> Result<usize> {
        self.compress_blocks(None)
    }

    /// Compress blocks untouched for at least the configured idle time.
    /// Does nothing when idle compression is not configured.
    pub fn compress_idle_blocks(&self) -> Result<usize> {
        match self.idle_compression {
            Some(idle) => self.compress_blocks(Some(idle)),
            None => Ok(0),
        }
    }

    fn compress_blocks(&self, min_idle: Option<Duration>) -> Result<usize> {
        let Some(codec) = self.codecs.active() else {
            return Ok(0);
        };

        let mut compressed = 0usize;
        let mut target = Vec::new();
        loop {
            let next = self.write_locked(&target, true, |slot, block, _| {
                let idle_enough = min_idle.map_or(true, |idle| block.idle_for() >= idle);
                if idle_enough && block.compress(codec.as_ref())? {
                    compressed += 1;
                }
                Ok(slot.next_key.map(<[u8]>::to_vec))
            })?;
            match next {
                Some(key) => target = key,
                None => break,
            }
        }

        if compressed > 0 {
            tracing::debug!("Compressed {} blocks with {:?}", compressed, codec.codec_type());
        }
        Ok(compressed)
    }

    /// Replace the codec used for new compression. Blocks compressed with
    /// the previous codec stay readable.
    pub fn set_compression_codec(&self, codec: Option<Arc<dyn Codec>>) {
        self.codecs.set_active(codec);
    }

    /// The codec used for new compression, if any
    pub fn compression_codec(&self) -> Option<Arc<dyn Codec>> {
        self.codecs.active()
    }

    /// Change the split threshold. Existing blocks are split lazily on
    /// their next insert.
    pub fn set_max_block_size(&self, bytes: usize) -> Result<()> {
        if bytes < MIN_BLOCK_SIZE || bytes > u32::MAX as usize {
            return Err(BurrowError::Config(format!(
                "max_block_size must be between {} and {} bytes, got {}",
                MIN_BLOCK_SIZE,
                u32::MAX,
                bytes
            )));
        }
        self.max_block_size.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Accounting / Instrumentation
    // =========================================================================

    /// Counters of this store alone
    pub fn stats(&self) -> MemoryStats {
        self.tracker.stats()
    }

    /// The pool this store charges; its counters cover every store on it
    pub fn pool(&self) -> &Arc<MemoryPool> {
        self.tracker.pool()
    }

    pub fn block_count(&self) -> usize {
        self.index.read().len()
    }

    /// Keep counting locally but stop publishing to the pool
    pub fn disable_statistics(&self) {
        self.tracker.disable();
    }

    /// Publish pending counts and resume eager publishing
    pub fn enable_statistics(&self) {
        self.tracker.enable();
    }

    /// Publish pending counts without changing the mode
    pub fn sync_statistics(&self) {
        self.tracker.sync();
    }

    /// Release every block. Equivalent to dropping the store.
    pub fn dispose(self) {
        tracing::info!(
            "Disposing store: {} blocks, {} bytes allocated",
            self.block_count(),
            self.tracker.stats().allocated
        );
        drop(self);
    }

    // =========================================================================
    // Block Routing
    // =========================================================================

    fn context(&self) -> BlockContext<'_> {
        BlockContext {
            codecs: &self.codecs,
            chains: &self.chains,
            max_block_size: self.max_block_size(),
        }
    }

    pub(crate) fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub(crate) fn chains(&self) -> &ChainArena {
        &self.chains
    }

    fn route(&self, probe: Probe<'_>) -> Option<(Vec<u8>, BlockRef)> {
        let index = self.index.read();
        lookup(&index, probe).map(|(key, block)| (key.clone(), Arc::clone(block)))
    }

    /// Check that `probe` still resolves to `block`. `Some(next key)` on
    /// success, the next key being filled in only if `with_next`.
    fn confirm(&self, probe: Probe<'_>, block: &BlockRef, with_next: bool) -> Option<Option<Vec<u8>>> {
        let index = self.index.read();
        let (key, current) = lookup(&index, probe)?;
        if !Arc::ptr_eq(current, block) {
            return None;
        }
        if !with_next {
            return Some(None);
        }
        Some(
            index
                .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
                .next()
                .map(|(next, _)| next.clone()),
        )
    }

    /// Read the record stored under `key`
    fn read_at<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(crate::record::RecordView<'_>) -> Result<R>,
    ) -> Result<Option<R>> {
        let found = self.read_locked(Probe::Floor(key), true, false, |_, block| {
            block.touch();
            block.lookup(key, &self.codecs, f)
        })?;
        Ok(found.flatten())
    }

    /// Lock a block for reading together with its index neighbourhood
    pub(crate) fn read_slot<R>(
        &self,
        probe: Probe<'_>,
        inflate: bool,
        f: impl FnOnce(BlockSlot<'_>, &DataBlock) -> Result<R>,
    ) -> Result<Option<R>> {
        self.read_locked(probe, inflate, true, f)
    }

    /// Lock the block `probe` resolves to for reading and run `f` on it.
    /// With `inflate`, a compressed block is restored to raw first.
    /// `Ok(None)` if the probe matches no block.
    fn read_locked<R>(
        &self,
        probe: Probe<'_>,
        inflate: bool,
        with_next: bool,
        f: impl FnOnce(BlockSlot<'_>, &DataBlock) -> Result<R>,
    ) -> Result<Option<R>> {
        loop {
            let Some((index_key, block)) = self.route(probe) else {
                return Ok(None);
            };

            let mut guard = block.read();
            if inflate && guard.is_compressed() {
                drop(guard);
                let mut writer = block.write();
                writer.make_raw(&self.codecs)?;
                guard = RwLockWriteGuard::downgrade(writer);
            }

            let Some(next_key) = self.confirm(probe, &block, with_next) else {
                tracing::trace!("Block moved while locking, retrying");
                continue;
            };
            let slot = BlockSlot {
                index_key: &index_key,
                next_key: next_key.as_deref(),
            };
            return f(slot, &guard).map(Some);
        }
    }

    /// Lock the block owning `key` for writing, run `f`, then split or
    /// unlink the block if `f` left it oversized or empty.
    fn write_locked<R>(
        &self,
        key: &[u8],
        with_next: bool,
        f: impl FnOnce(BlockSlot<'_>, &mut DataBlock, &BlockContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let probe = Probe::Floor(key);
        loop {
            let Some((index_key, block)) = self.route(probe) else {
                return Err(BurrowError::Corruption(
                    "block index has no leftmost block".to_string(),
                ));
            };

            let mut guard = block.write();
            let Some(next_key) = self.confirm(probe, &block, with_next) else {
                tracing::trace!("Block moved while locking, retrying");
                continue;
            };

            let ctx = self.context();
            let slot = BlockSlot {
                index_key: &index_key,
                next_key: next_key.as_deref(),
            };
            let out = f(slot, &mut guard, &ctx)?;
            self.rebalance(&index_key, &block, &mut guard)?;
            return Ok(out);
        }
    }

    /// Split an oversized block or unlink an emptied one. The caller holds
    /// the block's write lock.
    fn rebalance(&self, index_key: &[u8], block: &BlockRef, guard: &mut DataBlock) -> Result<()> {
        let max = self.max_block_size();
        if guard.needs_split(max) {
            let Some(pieces) = guard.split(max)? else {
                tracing::warn!("Block split deferred: memory ceiling reached");
                return Ok(());
            };
            let mut index = self.index.write();
            for (first_key, piece) in pieces {
                self.charge_index(&first_key);
                index.insert(first_key, Arc::new(RwLock::new(piece)));
            }
        } else if guard.is_empty() && !index_key.is_empty() {
            let mut index = self.index.write();
            let indexed = index
                .get(index_key)
                .is_some_and(|current| Arc::ptr_eq(current, block));
            if indexed {
                index.remove(index_key);
                self.release_index(index_key);
                tracing::trace!("Unlinked empty block");
            }
        }
        Ok(())
    }

    fn charge_index(&self, key: &[u8]) {
        let bytes = key.len() as u64 + INDEX_ENTRY_OVERHEAD;
        self.tracker.force_charge(bytes);
        self.tracker.add_index(bytes as i64);
    }

    fn release_index(&self, key: &[u8]) {
        let bytes = key.len() as u64 + INDEX_ENTRY_OVERHEAD;
        self.tracker.release(bytes);
        self.tracker.add_index(-(bytes as i64));
    }
}

impl Drop for SortedStore {
    fn drop(&mut self) {
        let index = std::mem::take(self.index.get_mut());
        let index_keys: Vec<Vec<u8>> = index.keys().cloned().collect();
        drop(index);
        self.chains.clear();
        for key in &index_keys {
            self.release_index(key);
        }
        // Settle anything accumulated while statistics were disabled
        self.tracker.enable();
    }
}

fn lookup<'m>(
    index: &'m BTreeMap<Vec<u8>, BlockRef>,
    probe: Probe<'_>,
) -> Option<(&'m Vec<u8>, &'m BlockRef)> {
    match probe {
        Probe::Floor(key) => index
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back(),
        Probe::Below(key) => index
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back(),
        Probe::Last => index.iter().next_back(),
    }
}
