//! Memory accounting
//!
//! Every byte a store holds is charged against a [`MemoryPool`] shared by all
//! stores built on it, so instances can be inspected one by one
//! ([`MemoryTracker::stats`]) and in total ([`MemoryPool::stats`]).
//!
//! ## Model
//! ```text
//!   MemoryPool (shared, ceiling + global counters)
//!        ▲            ▲
//!        │ publish    │ publish
//!   MemoryTracker  MemoryTracker      one per SortedStore
//!        ▲
//!        │ charge / release (RAII)
//!   Allocation (block buffers, chain segments)
//! ```
//!
//! While statistics are disabled a tracker only updates its local counters;
//! `sync` publishes the accumulated difference in one step.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Point-in-time view of a set of memory counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes charged for buffers, index entries and chain segments
    pub allocated: u64,
    /// Bytes of block payloads (raw or compressed)
    pub data_bytes: u64,
    /// Bytes attributed to the block index
    pub index_bytes: u64,
}

/// Shared memory ceiling and global counters
#[derive(Debug)]
pub struct MemoryPool {
    limit: AtomicU64,
    allocated: AtomicU64,
    data_bytes: AtomicI64,
    index_bytes: AtomicI64,
}

impl MemoryPool {
    /// Create a pool with the given ceiling (in bytes)
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicU64::new(limit),
            allocated: AtomicU64::new(0),
            data_bytes: AtomicI64::new(0),
            index_bytes: AtomicI64::new(0),
        })
    }

    /// Reserve `bytes`, failing if the ceiling would be exceeded.
    ///
    /// `pending` is charge already accounted locally by a tracker running
    /// with statistics disabled; it counts against the ceiling too.
    fn try_reserve(&self, bytes: u64, pending: u64) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let wanted = current.saturating_add(pending).saturating_add(bytes);
            if wanted > limit {
                return false;
            }
            match self.allocated.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn charge(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Bytes currently allocated across every store on this pool
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Block payload bytes across every store on this pool
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes.load(Ordering::Acquire).max(0) as u64
    }

    /// Block index bytes across every store on this pool
    pub fn index_bytes(&self) -> u64 {
        self.index_bytes.load(Ordering::Acquire).max(0) as u64
    }

    /// The configured memory ceiling
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Change the memory ceiling. Existing allocations are not affected.
    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Snapshot of the global counters
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            allocated: self.allocated(),
            data_bytes: self.data_bytes(),
            index_bytes: self.index_bytes(),
        }
    }
}

/// Per-store counters, published to a [`MemoryPool`]
///
/// Every counter update holds `mode` for reading, so a switch between eager
/// and deferred publishing (which holds it for writing) sees each update
/// either fully applied to the pool or not at all.
#[derive(Debug)]
pub struct MemoryTracker {
    pool: Arc<MemoryPool>,
    allocated: AtomicU64,
    data_bytes: AtomicI64,
    index_bytes: AtomicI64,
    mode: RwLock<PublishMode>,
}

/// Publishing state of a tracker
#[derive(Debug, Default)]
struct PublishMode {
    enabled: bool,
    /// Local values the pool currently holds for this tracker; only
    /// maintained while publishing is disabled
    allocated: u64,
    data_bytes: i64,
    index_bytes: i64,
}

impl MemoryTracker {
    pub fn new(pool: Arc<MemoryPool>, statistics_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            allocated: AtomicU64::new(0),
            data_bytes: AtomicI64::new(0),
            index_bytes: AtomicI64::new(0),
            mode: RwLock::new(PublishMode {
                enabled: statistics_enabled,
                ..PublishMode::default()
            }),
        })
    }

    /// The shared pool this tracker publishes to
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Reserve `bytes` under the ceiling. Returns false when it would be
    /// breached; nothing is charged in that case.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        if bytes == 0 {
            return true;
        }
        let mode = self.mode.read();
        if mode.enabled {
            if !self.pool.try_reserve(bytes, 0) {
                return false;
            }
        } else {
            let pending = self
                .allocated
                .load(Ordering::Acquire)
                .saturating_sub(mode.allocated);
            if !self.pool.try_reserve(0, pending.saturating_add(bytes)) {
                return false;
            }
        }
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
        true
    }

    /// Charge `bytes` without a ceiling check (allocator rounding)
    pub fn force_charge(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mode = self.mode.read();
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
        if mode.enabled {
            self.pool.charge(bytes);
        }
    }

    /// Return `bytes` previously reserved
    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mode = self.mode.read();
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        if mode.enabled {
            self.pool.release(bytes);
        }
    }

    /// Adjust the block payload counter
    pub fn add_data(&self, delta: i64) {
        let mode = self.mode.read();
        self.data_bytes.fetch_add(delta, Ordering::AcqRel);
        if mode.enabled {
            self.pool.data_bytes.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Adjust the index counter
    pub fn add_index(&self, delta: i64) {
        let mode = self.mode.read();
        self.index_bytes.fetch_add(delta, Ordering::AcqRel);
        if mode.enabled {
            self.pool.index_bytes.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Stop publishing to the pool; local counters keep accumulating.
    pub fn disable(&self) {
        let mut mode = self.mode.write();
        if mode.enabled {
            mode.enabled = false;
            mode.allocated = self.allocated.load(Ordering::Acquire);
            mode.data_bytes = self.data_bytes.load(Ordering::Acquire);
            mode.index_bytes = self.index_bytes.load(Ordering::Acquire);
        }
    }

    /// Publish what accumulated while disabled and resume eager publishing.
    pub fn enable(&self) {
        let mut mode = self.mode.write();
        if !mode.enabled {
            self.publish_delta(&mut mode);
            mode.enabled = true;
        }
    }

    /// Publish the accumulated difference without changing the mode.
    pub fn sync(&self) {
        let mut mode = self.mode.write();
        if !mode.enabled {
            self.publish_delta(&mut mode);
        }
    }

    pub fn is_publishing(&self) -> bool {
        self.mode.read().enabled
    }

    /// Local counters of this store
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            allocated: self.allocated.load(Ordering::Acquire),
            data_bytes: self.data_bytes.load(Ordering::Acquire).max(0) as u64,
            index_bytes: self.index_bytes.load(Ordering::Acquire).max(0) as u64,
        }
    }

    /// Push the difference between the local counters and what the pool
    /// holds for this tracker. The caller holds `mode` for writing.
    fn publish_delta(&self, mode: &mut PublishMode) {
        let allocated = self.allocated.load(Ordering::Acquire);
        let data_bytes = self.data_bytes.load(Ordering::Acquire);
        let index_bytes = self.index_bytes.load(Ordering::Acquire);

        if allocated >= mode.allocated {
            self.pool.charge(allocated - mode.allocated);
        } else {
            self.pool.release(mode.allocated - allocated);
        }
        self.pool
            .data_bytes
            .fetch_add(data_bytes - mode.data_bytes, Ordering::AcqRel);
        self.pool
            .index_bytes
            .fetch_add(index_bytes - mode.index_bytes, Ordering::AcqRel);

        mode.allocated = allocated;
        mode.data_bytes = data_bytes;
        mode.index_bytes = index_bytes;
    }
}

/// A heap buffer whose capacity is charged to a [`MemoryTracker`] and
/// returned when the buffer is dropped.
#[derive(Debug)]
pub struct Allocation {
    buf: Vec<u8>,
    charged: u64,
    tracker: Arc<MemoryTracker>,
}

impl Allocation {
    /// Allocate an empty buffer with room for `capacity` bytes.
    /// Returns `None` if the ceiling does not allow it.
    pub fn with_capacity(tracker: &Arc<MemoryTracker>, capacity: usize) -> Option<Self> {
        if !tracker.try_reserve(capacity as u64) {
            return None;
        }
        let buf = Vec::with_capacity(capacity);
        let mut alloc = Self {
            buf,
            charged: capacity as u64,
            tracker: Arc::clone(tracker),
        };
        alloc.charge_rounding();
        Some(alloc)
    }

    /// Copy `bytes` into a new tracked buffer of exactly that size
    pub fn copy_from(tracker: &Arc<MemoryTracker>, bytes: &[u8]) -> Option<Self> {
        let mut alloc = Self::with_capacity(tracker, bytes.len())?;
        alloc.buf.extend_from_slice(bytes);
        Some(alloc)
    }

    /// Copy `bytes` into a tracked buffer, charged even past the ceiling.
    pub fn copy_forced(tracker: &Arc<MemoryTracker>, bytes: &[u8]) -> Self {
        tracker.force_charge(bytes.len() as u64);
        let mut alloc = Self {
            buf: bytes.to_vec(),
            charged: bytes.len() as u64,
            tracker: Arc::clone(tracker),
        };
        alloc.charge_rounding();
        alloc
    }

    /// Make room for at least `needed` bytes in total, growing geometrically.
    /// Returns false (leaving the buffer untouched) if the ceiling is hit.
    pub fn ensure_capacity(&mut self, needed: usize) -> bool {
        if needed <= self.buf.capacity() {
            return true;
        }
        let target = needed.max(self.buf.capacity() + self.buf.capacity() / 2);
        let extra = (target as u64).saturating_sub(self.charged);
        if !self.tracker.try_reserve(extra) {
            // Retry with the exact size before giving up
            let exact = (needed as u64).saturating_sub(self.charged);
            if !self.tracker.try_reserve(exact) {
                return false;
            }
            self.charged += exact;
            self.buf.reserve_exact(needed - self.buf.len());
        } else {
            self.charged += extra;
            self.buf.reserve_exact(target - self.buf.len());
        }
        self.charge_rounding();
        true
    }

    /// Give back unused capacity
    pub fn shrink_to_fit(&mut self) {
        self.buf.shrink_to_fit();
        let cap = self.buf.capacity() as u64;
        if cap < self.charged {
            self.tracker.release(self.charged - cap);
            self.charged = cap;
        }
    }

    /// Bytes charged for this buffer
    pub fn charged(&self) -> u64 {
        self.charged
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access to the buffer. Growth beyond the current capacity must
    /// go through [`Allocation::ensure_capacity`] first.
    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    fn charge_rounding(&mut self) {
        let cap = self.buf.capacity() as u64;
        if cap > self.charged {
            self.tracker.force_charge(cap - self.charged);
            self.charged = cap;
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.tracker.release(self.charged);
    }
}
