//! Composite keys
//!
//! Collection types embed a whole container in the flat key space:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────┐
//! │ ContainerLen (4) │  Container key   │  Element bytes   │
//! └──────────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! The length is big-endian so every record of one container sorts into a
//! single contiguous run. An existing-but-empty container is marked by a
//! sentinel record: the container prefix followed by a single zero byte,
//! with an empty value.

/// Size of the container length prefix
pub const CONTAINER_LEN_SIZE: usize = 4;

/// Element suffix of a sentinel record
pub const SENTINEL_ELEMENT: &[u8] = &[0u8];

/// Prefix shared by every record of `container`
pub fn container_prefix(container: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(CONTAINER_LEN_SIZE + container.len());
    prefix.extend_from_slice(&(container.len() as u32).to_be_bytes());
    prefix.extend_from_slice(container);
    prefix
}

/// Key of `element` inside `container`
pub fn composite_key(container: &[u8], element: &[u8]) -> Vec<u8> {
    let mut key = container_prefix(container);
    key.extend_from_slice(element);
    key
}

/// Key of the sentinel record for `container`
pub fn sentinel_key(container: &[u8]) -> Vec<u8> {
    composite_key(container, SENTINEL_ELEMENT)
}

/// Split a composite key into (container, element)
pub fn split_composite(key: &[u8]) -> Option<(&[u8], &[u8])> {
    if key.len() < CONTAINER_LEN_SIZE {
        return None;
    }
    let (len_bytes, rest) = key.split_at(CONTAINER_LEN_SIZE);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Whether a record is a container sentinel
pub fn is_sentinel(key: &[u8], value: &[u8]) -> bool {
    value.is_empty()
        && matches!(split_composite(key), Some((_, element)) if element == SENTINEL_ELEMENT)
}

/// Smallest key greater than every key starting with `prefix`.
/// `None` means there is no such key (empty or all-0xFF prefix).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}
