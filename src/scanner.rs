//! Range Scanner
//!
//! A cursor over `[lower, upper)` that walks the store block by block.
//!
//! ## Model
//! ```text
//!   index:   ""──►[a b c]   "d"──►[d e f]   "g"──►[g h]
//!                     ▲
//!   scanner copy:  [b c]   (in-range records of one block)
//!                   ^pos
//! ```
//! The scanner copies the in-range records of one block, releases the
//! block lock, and serves records from the copy. When the copy runs out it
//! moves to the block following the one it copied, using the index key
//! boundaries observed while the block was locked; records are therefore
//! never returned twice or skipped because of a concurrent split.
//!
//! A forward scanner starts on the first record and moves with
//! [`Scanner::next`]; a reverse scanner starts on the last record and moves
//! with [`Scanner::previous`]. Calling the method of the other direction is
//! a programming error and panics.

use std::borrow::Cow;
use std::ops::Range;

use crate::block::OwnedRecords;
use crate::error::{BurrowError, Result};
use crate::record::{Entry, RecordKind};
use crate::store::{Probe, SortedStore};

/// Decoded position of the current record inside the copy
#[derive(Debug, Clone)]
struct Cursor {
    kind: RecordKind,
    expire_at: Option<u64>,
    key: Range<usize>,
    value: Range<usize>,
}

/// In-range records copied out of one block
struct Loaded {
    records: OwnedRecords,
    index_key: Vec<u8>,
    next_key: Option<Vec<u8>>,
}

/// Directional cursor over a key range
pub struct Scanner<'a> {
    store: &'a SortedStore,
    /// Inclusive; `None` is open
    lower: Option<Vec<u8>>,
    /// Exclusive; `None` is open
    upper: Option<Vec<u8>>,
    reverse: bool,
    records: OwnedRecords,
    pos: usize,
    /// Index key of the block `records` came from
    block_key: Vec<u8>,
    /// Index key of the block after it, as seen when copying
    block_next: Option<Vec<u8>>,
    cursor: Option<Cursor>,
    /// Position of the current record in scan order
    ordinal: u64,
}

impl<'a> Scanner<'a> {
    pub(crate) fn open(
        store: &'a SortedStore,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Result<Option<Self>> {
        if !reverse {
            return Self::open_forward(store, start, end).map(Some);
        }

        let mut scanner = Self::unpositioned(store, start, end, true);
        if scanner.range_is_empty() {
            return Ok(None);
        }
        let upper = scanner.upper.clone();
        scanner.seek_reverse(upper, false)?;
        if scanner.has_next() {
            Ok(Some(scanner))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn open_forward(
        store: &'a SortedStore,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Self> {
        let mut scanner = Self::unpositioned(store, start, end, false);
        if !scanner.range_is_empty() {
            let target = scanner.lower.clone().unwrap_or_default();
            scanner.seek_forward(target)?;
        }
        Ok(scanner)
    }

    fn unpositioned(
        store: &'a SortedStore,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Self {
        let lower = start.filter(|k| !k.is_empty()).map(<[u8]>::to_vec);
        let mut upper = end.filter(|k| !k.is_empty()).map(<[u8]>::to_vec);

        // (S, S) probes S alone: S followed by a zero byte is its successor
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if lo == hi {
                let mut successor = lo.clone();
                successor.push(0);
                upper = Some(successor);
            }
        }

        Self {
            store,
            lower,
            upper,
            reverse,
            records: OwnedRecords::default(),
            pos: 0,
            block_key: Vec::new(),
            block_next: None,
            cursor: None,
            ordinal: 0,
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Whether the scanner is positioned on a record
    pub fn has_next(&self) -> bool {
        self.cursor.is_some()
    }

    /// Move to the following record. Returns whether there is one.
    ///
    /// # Panics
    /// On a reverse scanner.
    pub fn next(&mut self) -> Result<bool> {
        assert!(!self.reverse, "next() called on a reverse scanner");
        if self.cursor.is_none() {
            return Ok(false);
        }

        self.ordinal += 1;
        if self.pos + 1 < self.records.len() {
            self.pos += 1;
            self.settle()?;
            return Ok(true);
        }

        match self.block_next.take() {
            Some(next) if self.below_upper(&next) => self.seek_forward(next)?,
            _ => self.exhaust(),
        }
        Ok(self.has_next())
    }

    /// Move to the preceding record. Returns false, without error, once
    /// moved past the first record of the range.
    ///
    /// # Panics
    /// On a forward scanner.
    pub fn previous(&mut self) -> Result<bool> {
        assert!(self.reverse, "previous() called on a forward scanner");
        if self.cursor.is_none() {
            return Ok(false);
        }

        self.ordinal += 1;
        if self.pos > 0 {
            self.pos -= 1;
            self.settle()?;
            return Ok(true);
        }

        let block_key = std::mem::take(&mut self.block_key);
        if self.at_lower_edge(&block_key) {
            self.exhaust();
            return Ok(false);
        }
        self.seek_reverse(Some(block_key), true)?;
        Ok(self.has_next())
    }

    /// Advance to the record at `ordinal` in scan order without visiting
    /// the records in between. Returns the ordinal actually reached: the
    /// number of records in the range if it ends first. Never moves back.
    pub fn skip_to(&mut self, ordinal: u64) -> Result<u64> {
        if self.cursor.is_none() || ordinal <= self.ordinal {
            return Ok(self.ordinal);
        }

        let mut remaining = ordinal - self.ordinal;
        let ahead = if self.reverse {
            self.pos
        } else {
            self.records.len() - self.pos - 1
        } as u64;

        if remaining <= ahead {
            if self.reverse {
                self.pos -= remaining as usize;
            } else {
                self.pos += remaining as usize;
            }
            self.ordinal = ordinal;
            self.settle()?;
            return Ok(self.ordinal);
        }

        // Step off the copy onto the first record of the next block
        self.ordinal += ahead + 1;
        remaining -= ahead + 1;
        if self.reverse {
            self.skip_reverse(remaining)?;
        } else {
            self.skip_forward(remaining)?;
        }
        Ok(self.ordinal)
    }

    /// Release the scanner and its buffers
    pub fn close(self) {}

    /// Consume the scanner as an iterator of entries in scan order
    pub fn entries(self) -> Entries<'a> {
        Entries {
            scanner: self,
            pending: None,
        }
    }

    // =========================================================================
    // Current Record
    // =========================================================================

    fn current(&self) -> &Cursor {
        match &self.cursor {
            Some(cursor) => cursor,
            None => panic!("scanner is not positioned on a record"),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.records.data()[self.current().key.clone()]
    }

    /// Value bytes as stored; a handle for chain records
    pub fn raw_value(&self) -> &[u8] {
        &self.records.data()[self.current().value.clone()]
    }

    /// Value as callers see it (chains concatenated)
    pub fn value(&self) -> Result<Cow<'_, [u8]>> {
        match self.kind() {
            RecordKind::Flat => Ok(Cow::Borrowed(self.raw_value())),
            kind => Ok(Cow::Owned(kind.materialize(self.raw_value(), self.store.chains())?)),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.current().kind
    }

    pub fn expire_at(&self) -> Option<u64> {
        self.current().expire_at
    }

    pub fn entry(&self) -> Result<Entry> {
        Ok(Entry {
            key: self.key().to_vec(),
            value: self.value()?.into_owned(),
            expire_at: self.expire_at(),
        })
    }

    /// Position of the current record in scan order (0 = first)
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    // =========================================================================
    // Block Walking
    // =========================================================================

    fn range_is_empty(&self) -> bool {
        matches!((&self.lower, &self.upper), (Some(lo), Some(hi)) if lo >= hi)
    }

    fn below_upper(&self, key: &[u8]) -> bool {
        self.upper.as_deref().map_or(true, |hi| key < hi)
    }

    /// No in-range key can sort below `index_key`
    fn at_lower_edge(&self, index_key: &[u8]) -> bool {
        index_key.is_empty() || self.lower.as_deref().is_some_and(|lo| lo >= index_key)
    }

    /// Position on the first in-range record `>= target`
    fn seek_forward(&mut self, mut target: Vec<u8>) -> Result<()> {
        loop {
            let upper = self.upper.as_deref();
            let Some(loaded) = load(self.store, Probe::Floor(&target), Some(&target), upper)? else {
                self.exhaust();
                return Ok(());
            };

            let next = loaded.next_key.clone();
            if !loaded.records.is_empty() {
                return self.install(loaded, Some(0));
            }
            match next {
                Some(key) if self.below_upper(&key) => target = key,
                _ => {
                    self.exhaust();
                    return Ok(());
                }
            }
        }
    }

    /// Position on the last in-range record `< limit` (`None`: no limit
    /// beyond the range). With `strict`, start in the block before the one
    /// indexed at `limit`.
    fn seek_reverse(&mut self, mut limit: Option<Vec<u8>>, mut strict: bool) -> Result<()> {
        loop {
            let probe = match (&limit, strict) {
                (None, _) => Probe::Last,
                (Some(key), false) => Probe::Floor(key),
                (Some(key), true) => Probe::Below(key),
            };
            let lower = self.lower.as_deref();
            let Some(loaded) = load(self.store, probe, lower, limit.as_deref())? else {
                self.exhaust();
                return Ok(());
            };

            let index_key = loaded.index_key.clone();
            let len = loaded.records.len();
            if len > 0 {
                return self.install(loaded, Some(len - 1));
            }
            if self.at_lower_edge(&index_key) {
                self.exhaust();
                return Ok(());
            }
            limit = Some(index_key);
            strict = true;
        }
    }

    /// Forward skip across whole blocks; `remaining` counts from the first
    /// record after the current copy.
    fn skip_forward(&mut self, mut remaining: u64) -> Result<()> {
        let next = self.block_next.take();
        let Some(mut target) = next.filter(|key| self.below_upper(key)) else {
            self.exhaust();
            return Ok(());
        };

        let store = self.store;
        let upper = self.upper.clone();
        loop {
            let step = store.read_slot(Probe::Floor(&target), false, |slot, block| {
                let whole = slot.index_key == target.as_slice()
                    && match (upper.as_deref(), slot.next_key) {
                        (None, _) => true,
                        (Some(hi), Some(next)) => next <= hi,
                        (Some(_), None) => false,
                    };
                let count = if whole {
                    block.len()
                } else {
                    let records = block.records(store.codecs())?;
                    let (s, e) = records.view().window(Some(&target), upper.as_deref())?;
                    e - s
                };

                if remaining < count as u64 {
                    block.touch();
                    let records = block.records(store.codecs())?;
                    let view = records.view();
                    let (s, e) = view.window(Some(&target), upper.as_deref())?;
                    return Ok(Skip::Land(Loaded {
                        records: view.slice_owned(s, e),
                        index_key: slot.index_key.to_vec(),
                        next_key: slot.next_key.map(<[u8]>::to_vec),
                    }));
                }
                Ok(Skip::Pass(count as u64, slot.next_key.map(<[u8]>::to_vec)))
            })?;

            match step {
                Some(Skip::Land(loaded)) => {
                    self.ordinal += remaining;
                    return self.install(loaded, Some(remaining as usize));
                }
                Some(Skip::Pass(count, next)) => {
                    self.ordinal += count;
                    remaining -= count;
                    match next {
                        Some(key) if self.below_upper(&key) => target = key,
                        _ => {
                            self.exhaust();
                            return Ok(());
                        }
                    }
                }
                None => {
                    self.exhaust();
                    return Ok(());
                }
            }
        }
    }

    /// Reverse counterpart of [`skip_forward`](Self::skip_forward)
    fn skip_reverse(&mut self, mut remaining: u64) -> Result<()> {
        let mut limit = std::mem::take(&mut self.block_key);
        if self.at_lower_edge(&limit) {
            self.exhaust();
            return Ok(());
        }

        let store = self.store;
        let lower = self.lower.clone();
        loop {
            let step = store.read_slot(Probe::Below(&limit), false, |slot, block| {
                let whole = lower.as_deref().map_or(true, |lo| lo <= slot.index_key)
                    && slot.next_key.is_some_and(|next| next <= limit.as_slice());
                let count = if whole {
                    block.len()
                } else {
                    let records = block.records(store.codecs())?;
                    let (s, e) = records.view().window(lower.as_deref(), Some(&limit))?;
                    e - s
                };

                if remaining < count as u64 {
                    block.touch();
                    let records = block.records(store.codecs())?;
                    let view = records.view();
                    let (s, e) = view.window(lower.as_deref(), Some(&limit))?;
                    return Ok(Skip::Land(Loaded {
                        records: view.slice_owned(s, e),
                        index_key: slot.index_key.to_vec(),
                        next_key: slot.next_key.map(<[u8]>::to_vec),
                    }));
                }
                Ok(Skip::Pass(count as u64, Some(slot.index_key.to_vec())))
            })?;

            match step {
                Some(Skip::Land(loaded)) => {
                    self.ordinal += remaining;
                    let pos = loaded.records.len() - 1 - remaining as usize;
                    return self.install(loaded, Some(pos));
                }
                Some(Skip::Pass(count, Some(index_key))) => {
                    self.ordinal += count;
                    remaining -= count;
                    if self.at_lower_edge(&index_key) {
                        self.exhaust();
                        return Ok(());
                    }
                    limit = index_key;
                }
                _ => {
                    self.exhaust();
                    return Ok(());
                }
            }
        }
    }

    fn install(&mut self, loaded: Loaded, pos: Option<usize>) -> Result<()> {
        self.records = loaded.records;
        self.block_key = loaded.index_key;
        self.block_next = loaded.next_key;
        match pos {
            Some(pos) if pos < self.records.len() => {
                self.pos = pos;
                self.settle()
            }
            _ => {
                self.pos = 0;
                self.cursor = None;
                Ok(())
            }
        }
    }

    /// Decode the record at `pos` into the cursor
    fn settle(&mut self) -> Result<()> {
        let view = self.records.view();
        let start = view.offset(self.pos);
        let record = view.record(self.pos)?;
        let key_start = start + record.encoded_len() - record.key.len() - record.value.len();
        let key = key_start..key_start + record.key.len();
        let value = key.end..key.end + record.value.len();
        self.cursor = Some(Cursor {
            kind: record.kind,
            expire_at: record.expire_at,
            key,
            value,
        });
        Ok(())
    }

    fn exhaust(&mut self) {
        self.cursor = None;
        self.records = OwnedRecords::default();
        self.block_next = None;
    }
}

enum Skip {
    Land(Loaded),
    Pass(u64, Option<Vec<u8>>),
}

/// Copy the records of the block `probe` resolves to that fall in
/// `[lower, upper)`
fn load(
    store: &SortedStore,
    probe: Probe<'_>,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
) -> Result<Option<Loaded>> {
    store.read_slot(probe, true, |slot, block| {
        block.touch();
        let records = block.records(store.codecs())?;
        let view = records.view();
        let (start, end) = view.window(lower, upper)?;
        Ok(Loaded {
            records: view.slice_owned(start, end),
            index_key: slot.index_key.to_vec(),
            next_key: slot.next_key.map(<[u8]>::to_vec),
        })
    })
}

/// Iterator over a scanner's entries
pub struct Entries<'a> {
    scanner: Scanner<'a>,
    /// Error hit while moving past the last returned entry
    pending: Option<BurrowError>,
}

impl Iterator for Entries<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending.take() {
            self.scanner.exhaust();
            return Some(Err(err));
        }
        if !self.scanner.has_next() {
            return None;
        }

        let entry = match self.scanner.entry() {
            Ok(entry) => entry,
            Err(err) => {
                self.scanner.exhaust();
                return Some(Err(err));
            }
        };
        let moved = if self.scanner.reverse {
            self.scanner.previous()
        } else {
            self.scanner.next()
        };
        if let Err(err) = moved {
            self.pending = Some(err);
        }
        Some(Ok(entry))
    }
}
