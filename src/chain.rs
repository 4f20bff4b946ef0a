//! Chain arena
//!
//! Values of [`RecordKind::Chain`] records are not stored in the block;
//! the block keeps an 8-byte [`ChainHandle`] pointing into this arena, which
//! owns the segments. Handles are generation-checked so a stale handle
//! (slot released and reused) is detected instead of reading someone else's
//! data.
//!
//! The per-kind hooks the block layer calls when a record is dropped,
//! overwritten or (de)serialized live on [`RecordKind`] at the bottom of
//! this file.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::error::{BurrowError, Result};
use crate::memory::{Allocation, MemoryTracker};
use crate::record::RecordKind;

/// Encoded size of a handle stored as a record value
pub const HANDLE_SIZE: usize = 8;

/// Reference to a chain of segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainHandle {
    index: u32,
    generation: u32,
}

impl ChainHandle {
    pub fn to_bytes(self) -> [u8; HANDLE_SIZE] {
        let mut out = [0u8; HANDLE_SIZE];
        out[..4].copy_from_slice(&self.index.to_le_bytes());
        out[4..].copy_from_slice(&self.generation.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HANDLE_SIZE {
            return Err(BurrowError::InvalidHandle(format!(
                "expected {} handle bytes, got {}",
                HANDLE_SIZE,
                bytes.len()
            )));
        }
        let mut cursor = bytes;
        Ok(Self {
            index: cursor.get_u32_le(),
            generation: cursor.get_u32_le(),
        })
    }
}

struct Slot {
    generation: u32,
    segments: Option<Vec<Allocation>>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked pool of segment chains
pub struct ChainArena {
    inner: Mutex<ArenaInner>,
    tracker: Arc<MemoryTracker>,
}

impl ChainArena {
    pub fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self {
            inner: Mutex::new(ArenaInner::default()),
            tracker,
        }
    }

    /// Store a chain of segments. Returns `None` if the memory ceiling does
    /// not allow it; nothing stays allocated in that case.
    pub fn allocate<S: AsRef<[u8]>>(&self, segments: &[S]) -> Option<ChainHandle> {
        let mut owned = Vec::with_capacity(segments.len());
        for segment in segments {
            owned.push(Allocation::copy_from(&self.tracker, segment.as_ref())?);
        }

        let mut inner = self.inner.lock();
        inner.live += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.segments = Some(owned);
            return Some(ChainHandle {
                index,
                generation: slot.generation,
            });
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            segments: Some(owned),
        });
        Some(ChainHandle {
            index,
            generation: 0,
        })
    }

    /// Copy out the segments of a chain
    pub fn read(&self, handle: ChainHandle) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        let segments = Self::live_slot(&inner, handle)?;
        Ok(segments.iter().map(|s| s.as_slice().to_vec()).collect())
    }

    /// Concatenation of all segments
    pub fn read_flat(&self, handle: ChainHandle) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let segments = Self::live_slot(&inner, handle)?;
        let total = segments.iter().map(|s| s.len()).sum();
        let mut out = Vec::with_capacity(total);
        for segment in segments {
            out.extend_from_slice(segment.as_slice());
        }
        Ok(out)
    }

    /// Free a chain; its memory returns to the tracker immediately.
    pub fn release(&self, handle: ChainHandle) -> Result<()> {
        let released = {
            let mut inner = self.inner.lock();
            Self::live_slot(&inner, handle)?;
            let slot = &mut inner.slots[handle.index as usize];
            let segments = slot.segments.take();
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(handle.index);
            inner.live -= 1;
            segments
        };
        drop(released);
        Ok(())
    }

    /// Drop every chain at once (store teardown)
    pub fn clear(&self) {
        let slots = {
            let mut inner = self.inner.lock();
            inner.free.clear();
            inner.live = 0;
            std::mem::take(&mut inner.slots)
        };
        drop(slots);
    }

    /// Number of live chains
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_slot(inner: &ArenaInner, handle: ChainHandle) -> Result<&Vec<Allocation>> {
        let slot = inner.slots.get(handle.index as usize).ok_or_else(|| {
            BurrowError::InvalidHandle(format!("slot {} out of range", handle.index))
        })?;
        if slot.generation != handle.generation {
            return Err(BurrowError::InvalidHandle(format!(
                "slot {} generation {} (handle has {})",
                handle.index, slot.generation, handle.generation
            )));
        }
        slot.segments.as_ref().ok_or_else(|| {
            BurrowError::InvalidHandle(format!("slot {} is free", handle.index))
        })
    }
}

// =============================================================================
// Per-kind value hooks
// =============================================================================

impl RecordKind {
    /// Release whatever the value references outside the block
    pub(crate) fn release(self, value: &[u8], chains: &ChainArena) -> Result<()> {
        match self {
            RecordKind::Flat => Ok(()),
            RecordKind::Chain => chains.release(ChainHandle::from_bytes(value)?),
        }
    }

    /// Resolve the value callers see
    pub(crate) fn materialize(self, value: &[u8], chains: &ChainArena) -> Result<Vec<u8>> {
        match self {
            RecordKind::Flat => Ok(value.to_vec()),
            RecordKind::Chain => chains.read_flat(ChainHandle::from_bytes(value)?),
        }
    }

    /// Write the persistent form of the value.
    ///
    /// Chains are inlined as `[count u32][len u32][bytes]...`.
    pub(crate) fn serialize_value(
        self,
        value: &[u8],
        chains: &ChainArena,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match self {
            RecordKind::Flat => {
                out.extend_from_slice(value);
                Ok(())
            }
            RecordKind::Chain => {
                let segments = chains.read(ChainHandle::from_bytes(value)?)?;
                out.put_u32_le(segments.len() as u32);
                for segment in &segments {
                    out.put_u32_le(segment.len() as u32);
                    out.put_slice(segment);
                }
                Ok(())
            }
        }
    }

    /// Rebuild the in-block value from its persistent form.
    /// Returns `Ok(None)` if the memory ceiling prevents it.
    pub(crate) fn deserialize_value(
        self,
        persisted: &[u8],
        chains: &ChainArena,
    ) -> Result<Option<Vec<u8>>> {
        match self {
            RecordKind::Flat => Ok(Some(persisted.to_vec())),
            RecordKind::Chain => {
                let segments = parse_inlined_chain(persisted)?;
                Ok(chains
                    .allocate(segments.as_slice())
                    .map(|handle| handle.to_bytes().to_vec()))
            }
        }
    }
}

fn parse_inlined_chain(mut bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let truncated = || BurrowError::Corruption("truncated inlined chain".to_string());
    if bytes.len() < 4 {
        return Err(truncated());
    }
    let count = bytes.get_u32_le() as usize;
    let mut segments = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if bytes.len() < 4 {
            return Err(truncated());
        }
        let len = bytes.get_u32_le() as usize;
        if bytes.len() < len {
            return Err(truncated());
        }
        let (segment, rest) = bytes.split_at(len);
        segments.push(segment);
        bytes = rest;
    }
    if !bytes.is_empty() {
        return Err(BurrowError::Corruption(format!(
            "{} trailing bytes after inlined chain",
            bytes.len()
        )));
    }
    Ok(segments)
}
