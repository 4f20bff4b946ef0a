//! Tests for Scanner
//!
//! These tests verify:
//! - Range semantics: inclusive start, exclusive end, open bounds
//! - Forward/reverse symmetry across block boundaries
//! - Empty-range rule (reverse → None, forward → exhausted)
//! - skip_to in both directions
//! - Scanning while the store splits underneath

use std::collections::BTreeSet;

use burrowkv::{CodecKind, Config, Scanner, SortedStore};
use proptest::prelude::*;

// =============================================================================
// Helper Functions
// =============================================================================

fn key_for(i: u32) -> Vec<u8> {
    format!("k{:06}", i).into_bytes()
}

/// Store with keys k000000..k{n-1} spread over many small blocks
fn populated(n: u32, codec: CodecKind) -> SortedStore {
    let config = Config::builder().max_block_size(256).codec(codec).build();
    let store = SortedStore::new(config).unwrap();
    for i in 0..n {
        store.put(&key_for(i), format!("value-{}", i).as_bytes(), None).unwrap();
    }
    store
}

fn collect_forward(mut scanner: Scanner<'_>) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    while scanner.has_next() {
        keys.push(scanner.key().to_vec());
        scanner.next().unwrap();
    }
    keys
}

fn collect_reverse(mut scanner: Scanner<'_>) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    while scanner.has_next() {
        keys.push(scanner.key().to_vec());
        scanner.previous().unwrap();
    }
    keys
}

fn forward(store: &SortedStore, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Vec<u8>> {
    collect_forward(store.scanner(start, end, false).unwrap().unwrap())
}

fn reverse(store: &SortedStore, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<Vec<u8>> {
    store
        .scanner(start, end, true)
        .unwrap()
        .map(collect_reverse)
        .unwrap_or_default()
}

// =============================================================================
// Range Semantics Tests
// =============================================================================

#[test]
fn test_full_scan_both_directions() {
    let store = populated(1_000, CodecKind::None);
    let expected: Vec<Vec<u8>> = (0..1_000).map(key_for).collect();

    assert_eq!(forward(&store, None, None), expected);

    let mut backwards = reverse(&store, None, None);
    backwards.reverse();
    assert_eq!(backwards, expected);
}

#[test]
fn test_start_inclusive_end_exclusive() {
    let store = populated(500, CodecKind::None);
    let start = key_for(100);
    let end = key_for(200);

    let keys = forward(&store, Some(&start), Some(&end));
    assert_eq!(keys.len(), 100);
    assert_eq!(keys.first(), Some(&start));
    assert_eq!(keys.last(), Some(&key_for(199)));

    let keys = reverse(&store, Some(&start), Some(&end));
    assert_eq!(keys.len(), 100);
    assert_eq!(keys.first(), Some(&key_for(199)));
    assert_eq!(keys.last(), Some(&start));
}

#[test]
fn test_bounds_between_keys() {
    let store = populated(100, CodecKind::None);
    // "k000010x" sorts between k000010 and k000011
    let keys = forward(&store, Some(b"k000010x"), Some(b"k000020x"));
    assert_eq!(keys.first(), Some(&key_for(11)));
    assert_eq!(keys.last(), Some(&key_for(20)));
    assert_eq!(keys.len(), 10);
}

#[test]
fn test_empty_bound_is_open() {
    let store = populated(50, CodecKind::None);
    assert_eq!(forward(&store, Some(b""), Some(b"")).len(), 50);
    assert_eq!(forward(&store, Some(b""), None).len(), 50);
    assert_eq!(reverse(&store, None, Some(b"")).len(), 50);
}

#[test]
fn test_point_probe() {
    let store = populated(100, CodecKind::None);
    let key = key_for(42);

    assert_eq!(forward(&store, Some(&key), Some(&key)), vec![key.clone()]);
    assert_eq!(reverse(&store, Some(&key), Some(&key)), vec![key.clone()]);

    let absent = b"k000042x".to_vec();
    assert!(forward(&store, Some(&absent), Some(&absent)).is_empty());
    assert!(store.scanner(Some(&absent), Some(&absent), true).unwrap().is_none());
}

#[test]
fn test_empty_range_asymmetry() {
    let store = populated(100, CodecKind::None);
    let low = key_for(10);
    let high = key_for(20);

    // start > end
    let scanner = store.scanner(Some(&high), Some(&low), false).unwrap();
    assert!(!scanner.unwrap().has_next());
    assert!(store.scanner(Some(&high), Some(&low), true).unwrap().is_none());

    // Valid bounds, no records inside
    let scanner = store.scanner(Some(b"x"), Some(b"y"), false).unwrap();
    assert!(!scanner.unwrap().has_next());
    assert!(store.scanner(Some(b"x"), Some(b"y"), true).unwrap().is_none());

    // Empty store
    let empty = SortedStore::new(Config::default()).unwrap();
    assert!(!empty.scanner(None, None, false).unwrap().unwrap().has_next());
    assert!(empty.scanner(None, None, true).unwrap().is_none());
}

#[test]
fn test_previous_past_first_returns_false() {
    let store = populated(10, CodecKind::None);
    let mut scanner = store.scanner(None, Some(&key_for(2)), true).unwrap().unwrap();

    assert_eq!(scanner.key(), key_for(1).as_slice());
    assert!(scanner.previous().unwrap());
    assert_eq!(scanner.key(), key_for(0).as_slice());
    assert!(!scanner.previous().unwrap());
    assert!(!scanner.has_next());
    assert!(!scanner.previous().unwrap());
}

#[test]
#[should_panic(expected = "reverse scanner")]
fn test_next_on_reverse_scanner_panics() {
    let store = populated(10, CodecKind::None);
    let mut scanner = store.scanner(None, None, true).unwrap().unwrap();
    let _ = scanner.next();
}

#[test]
#[should_panic(expected = "forward scanner")]
fn test_previous_on_forward_scanner_panics() {
    let store = populated(10, CodecKind::None);
    let mut scanner = store.scanner(None, None, false).unwrap().unwrap();
    let _ = scanner.previous();
}

#[test]
fn test_values_and_entries() {
    let store = populated(20, CodecKind::None);
    store.put(&key_for(5), b"expiring", Some(99)).unwrap();
    store
        .put_chain(&key_for(6), &[b"ch".as_slice(), b"ain"], None)
        .unwrap();

    let mut scanner = store.scanner(Some(&key_for(5)), None, false).unwrap().unwrap();
    assert_eq!(scanner.value().unwrap().as_ref(), b"expiring");
    assert_eq!(scanner.expire_at(), Some(99));
    assert_eq!(scanner.ordinal(), 0);

    scanner.next().unwrap();
    assert_eq!(scanner.value().unwrap().as_ref(), b"chain");
    assert_eq!(scanner.raw_value().len(), 8);
    assert_eq!(scanner.ordinal(), 1);

    let entries: Vec<_> = scanner.entries().collect::<Result<_, _>>().unwrap();
    assert_eq!(entries.len(), 14);
    assert_eq!(entries[0].key, key_for(6));
    assert_eq!(entries[0].value, b"chain".to_vec());
}

#[test]
fn test_prefix_scanner() {
    let store = SortedStore::new(Config::builder().max_block_size(256).build()).unwrap();
    for i in 0..200u32 {
        store.put(format!("user:{:04}", i).as_bytes(), b"u", None).unwrap();
        store.put(format!("order:{:04}", i).as_bytes(), b"o", None).unwrap();
    }
    store.put(b"user;", b"after", None).unwrap();

    let users = collect_forward(store.prefix_scanner(b"user:").unwrap());
    assert_eq!(users.len(), 200);
    assert!(users.iter().all(|k| k.starts_with(b"user:")));

    assert!(!store.prefix_scanner(b"nobody").unwrap().has_next());
}

#[test]
fn test_scan_compressed_blocks() {
    let store = populated(2_000, CodecKind::Lz4);
    assert!(store.compress_all().unwrap() > 0);

    let start = key_for(300);
    let end = key_for(1_700);
    let fwd = forward(&store, Some(&start), Some(&end));
    let mut rev = reverse(&store, Some(&start), Some(&end));
    rev.reverse();
    assert_eq!(fwd.len(), 1_400);
    assert_eq!(fwd, rev);
}

// =============================================================================
// skip_to Tests
// =============================================================================

#[test]
fn test_skip_to_forward() {
    let store = populated(1_000, CodecKind::None);
    let mut scanner = store.scanner(None, None, false).unwrap().unwrap();

    assert_eq!(scanner.skip_to(0).unwrap(), 0);
    assert_eq!(scanner.skip_to(3).unwrap(), 3);
    assert_eq!(scanner.key(), key_for(3).as_slice());

    assert_eq!(scanner.skip_to(750).unwrap(), 750);
    assert_eq!(scanner.key(), key_for(750).as_slice());
    assert_eq!(scanner.value().unwrap().as_ref(), b"value-750");

    // Never moves back
    assert_eq!(scanner.skip_to(10).unwrap(), 750);

    scanner.next().unwrap();
    assert_eq!(scanner.key(), key_for(751).as_slice());

    assert_eq!(scanner.skip_to(5_000).unwrap(), 1_000);
    assert!(!scanner.has_next());
}

#[test]
fn test_skip_to_reverse() {
    let store = populated(1_000, CodecKind::None);
    let mut scanner = store.scanner(None, None, true).unwrap().unwrap();

    assert_eq!(scanner.key(), key_for(999).as_slice());
    assert_eq!(scanner.skip_to(499).unwrap(), 499);
    assert_eq!(scanner.key(), key_for(500).as_slice());

    scanner.previous().unwrap();
    assert_eq!(scanner.key(), key_for(499).as_slice());

    assert_eq!(scanner.skip_to(999).unwrap(), 999);
    assert_eq!(scanner.key(), key_for(0).as_slice());
    assert_eq!(scanner.skip_to(1_001).unwrap(), 1_000);
}

#[test]
fn test_skip_to_within_bounds_and_compressed() {
    let store = populated(3_000, CodecKind::Zstd);
    store.compress_all().unwrap();

    let start = key_for(1_000);
    let end = key_for(2_000);
    let mut scanner = store.scanner(Some(&start), Some(&end), false).unwrap().unwrap();
    assert_eq!(scanner.skip_to(600).unwrap(), 600);
    assert_eq!(scanner.key(), key_for(1_600).as_slice());
    assert_eq!(scanner.skip_to(2_000).unwrap(), 1_000);

    let mut scanner = store.scanner(Some(&start), Some(&end), true).unwrap().unwrap();
    assert_eq!(scanner.skip_to(600).unwrap(), 600);
    assert_eq!(scanner.key(), key_for(1_399).as_slice());
}

// =============================================================================
// Concurrent Modification Tests
// =============================================================================

#[test]
fn test_scan_while_splitting() {
    let config = Config::builder().max_block_size(256).build();
    let store = SortedStore::new(config).unwrap();
    for i in (0..2_000).step_by(2) {
        store.put(&key_for(i), b"even", None).unwrap();
    }

    let mut scanner = store.scanner(None, None, false).unwrap().unwrap();
    let mut seen = Vec::new();
    let mut next_odd = 1;
    while scanner.has_next() {
        seen.push(scanner.key().to_vec());
        // Force splits in blocks the scanner has not reached yet
        for _ in 0..3 {
            if next_odd < 2_000 {
                store.put(&key_for(next_odd), b"odd-odd-odd", None).unwrap();
                next_odd += 2;
            }
        }
        scanner.next().unwrap();
    }

    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    let seen: BTreeSet<Vec<u8>> = seen.into_iter().collect();
    for i in (0..2_000).step_by(2) {
        assert!(seen.contains(&key_for(i)), "missing even key {}", i);
    }
}

#[test]
fn test_scan_while_deleting_ahead() {
    let store = populated(1_000, CodecKind::None);
    let mut scanner = store.scanner(None, None, false).unwrap().unwrap();
    let mut seen = 0;
    while scanner.has_next() {
        seen += 1;
        // Delete everything in the upper half while the scan is in the lower half
        if seen == 10 {
            for i in 500..1_000 {
                store.delete(&key_for(i)).unwrap();
            }
        }
        scanner.next().unwrap();
    }
    // The copy of the current block may still hold a few deleted keys
    assert!(seen >= 500 && seen < 520);
}

// =============================================================================
// Property Tests
// =============================================================================

fn bound() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(0u8..6, 0..4))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_forward_reverse_symmetry(
        keys in prop::collection::btree_set(prop::collection::vec(0u8..6, 1..5), 0..300),
        start in bound(),
        end in bound(),
    ) {
        let store = SortedStore::new(Config::builder().max_block_size(256).build()).unwrap();
        for key in &keys {
            store.put(key, &[1u8; 8], None).unwrap();
        }

        let fwd = forward(&store, start.as_deref(), end.as_deref());
        let mut rev = reverse(&store, start.as_deref(), end.as_deref());
        rev.reverse();
        prop_assert_eq!(&fwd, &rev);

        let lo = start.filter(|s| !s.is_empty());
        let hi = end.filter(|e| !e.is_empty());
        let expected: Vec<Vec<u8>> = keys
            .iter()
            .filter(|k| match (&lo, &hi) {
                (Some(l), Some(h)) if l == h => *k == l,
                _ => {
                    lo.as_ref().map_or(true, |l| *k >= l)
                        && hi.as_ref().map_or(true, |h| *k < h)
                }
            })
            .cloned()
            .collect();
        prop_assert_eq!(fwd, expected);
    }

    #[test]
    fn prop_skip_to_matches_iteration(n in 1u32..600, target in 0u64..700, reverse_scan in any::<bool>()) {
        let store = populated(n, CodecKind::None);
        let mut scanner = store.scanner(None, None, reverse_scan).unwrap().unwrap();
        let reached = scanner.skip_to(target).unwrap();

        prop_assert_eq!(reached, target.min(n as u64));
        if target < n as u64 {
            let index = if reverse_scan { n as u64 - 1 - target } else { target };
            let expected_key = key_for(index as u32);
            prop_assert_eq!(scanner.key(), expected_key.as_slice());
        } else {
            prop_assert!(!scanner.has_next());
        }
    }
}
