//! Container helper
//!
//! A logical collection (hash, set, list chunk) stored as the contiguous
//! run of composite-keyed records sharing one container prefix:
//!
//! ```text
//!   [len "cart"] cart ∅         ──►  ""        sentinel: exists, no members
//!   [len "cart"] cart apple     ──►  "3"
//!   [len "cart"] cart pear      ──►  "1"
//! ```
//! The sentinel is present only while the container exists without members.
//! Inserting the first member removes it; removing the last member removes
//! the container entirely.

use crate::error::{BurrowError, Result};
use crate::keys;
use crate::record::Entry;
use crate::scanner::Scanner;
use crate::store::SortedStore;

/// View of one container inside a store
pub struct Container<'a> {
    store: &'a SortedStore,
    name: Vec<u8>,
    prefix: Vec<u8>,
}

impl<'a> Container<'a> {
    pub fn new(store: &'a SortedStore, name: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        let prefix = keys::container_prefix(&name);
        Self {
            store,
            name,
            prefix,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Whether the container has a sentinel or any member
    pub fn exists(&self) -> Result<bool> {
        Ok(self.store.prefix_scanner(&self.prefix)?.has_next())
    }

    /// Create the container without members. Returns false if the memory
    /// ceiling prevents it.
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.exists()? {
            return Ok(true);
        }
        self.store.put(&keys::sentinel_key(&self.name), &[], None)
    }

    /// Store `value` under `element`. Returns false if the memory ceiling
    /// prevents it.
    pub fn insert(&self, element: &[u8], value: &[u8]) -> Result<bool> {
        let key = self.member_key(element)?;
        if !self.store.put(&key, value, None)? {
            return Ok(false);
        }
        self.store.delete(&keys::sentinel_key(&self.name))?;
        Ok(true)
    }

    pub fn get(&self, element: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = self.member_key(element)?;
        self.store.get(&key)
    }

    pub fn contains(&self, element: &[u8]) -> Result<bool> {
        let key = self.member_key(element)?;
        self.store.exists(&key)
    }

    /// Remove `element`. The container disappears with its last member,
    /// since the sentinel never coexists with members.
    pub fn remove(&self, element: &[u8]) -> Result<bool> {
        let key = self.member_key(element)?;
        self.store.delete(&key)
    }

    /// Number of members, the sentinel excluded
    pub fn cardinality(&self) -> Result<u64> {
        let mut scanner = self.store.prefix_scanner(&self.prefix)?;
        let mut count = 0u64;
        while scanner.has_next() {
            if !self.is_sentinel(&scanner) {
                count += 1;
            }
            scanner.next()?;
        }
        Ok(count)
    }

    /// Member at `ordinal` in key order, reached without visiting the
    /// members before it
    pub fn nth(&self, ordinal: u64) -> Result<Option<Entry>> {
        let mut scanner = self.store.prefix_scanner(&self.prefix)?;
        if scanner.skip_to(ordinal)? != ordinal || !scanner.has_next() {
            return Ok(None);
        }
        if self.is_sentinel(&scanner) {
            return Ok(None);
        }
        let mut entry = scanner.entry()?;
        entry.key.drain(..self.prefix.len());
        Ok(Some(entry))
    }

    /// Every `(element, value)` pair in element order
    pub fn members(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut members = Vec::new();
        for entry in self.store.prefix_scanner(&self.prefix)?.entries() {
            let Entry { mut key, value, .. } = entry?;
            if keys::is_sentinel(&key, &value) {
                continue;
            }
            key.drain(..self.prefix.len());
            members.push((key, value));
        }
        Ok(members)
    }

    /// Remove every member and the sentinel. Returns the number of members
    /// removed.
    pub fn clear(&self) -> Result<u64> {
        let mut doomed = Vec::new();
        let mut removed = 0u64;
        {
            let mut scanner = self.store.prefix_scanner(&self.prefix)?;
            while scanner.has_next() {
                if !self.is_sentinel(&scanner) {
                    removed += 1;
                }
                doomed.push(scanner.key().to_vec());
                scanner.next()?;
            }
        }
        for key in &doomed {
            self.store.delete(key)?;
        }
        tracing::debug!("Cleared container: {} members", removed);
        Ok(removed)
    }

    fn member_key(&self, element: &[u8]) -> Result<Vec<u8>> {
        if element == keys::SENTINEL_ELEMENT {
            return Err(BurrowError::OperationFailed(
                "element collides with the container sentinel".to_string(),
            ));
        }
        Ok(keys::composite_key(&self.name, element))
    }

    fn is_sentinel(&self, scanner: &Scanner<'_>) -> bool {
        keys::is_sentinel(scanner.key(), scanner.raw_value())
    }
}
