//! Tests for atomic operations through SortedStore::execute
//!
//! These tests verify:
//! - Increment (text and binary), IncrementFloat and Append semantics
//! - Expiration survives an update
//! - Malformed values fail without modifying the record
//! - An update rejected by the memory ceiling reports no result
//! - No lost updates under concurrent execution

use std::sync::Arc;

use burrowkv::ops::{AtomicOperation, Current, Update};
use burrowkv::{
    Append, BurrowError, CodecKind, Config, Increment, IncrementFloat, SortedStore,
};

// =============================================================================
// Single-threaded Semantics
// =============================================================================

#[test]
fn test_increment_creates_and_updates() {
    let store = SortedStore::new(Config::default()).unwrap();

    let mut op = Increment::new("hits", 5);
    assert!(store.execute(&mut op).unwrap());
    assert_eq!(op.result(), Some(5));
    assert_eq!(store.get(b"hits").unwrap(), Some(b"5".to_vec()));

    let mut op = Increment::new("hits", -12);
    store.execute(&mut op).unwrap();
    assert_eq!(op.result(), Some(-7));
    assert_eq!(store.get(b"hits").unwrap(), Some(b"-7".to_vec()));
}

#[test]
fn test_increment_binary() {
    let store = SortedStore::new(Config::default()).unwrap();
    store.put(b"n", &40i64.to_be_bytes(), None).unwrap();

    let mut op = Increment::binary("n", 2);
    store.execute(&mut op).unwrap();
    assert_eq!(op.result(), Some(42));
    assert_eq!(store.get(b"n").unwrap(), Some(42i64.to_be_bytes().to_vec()));
}

#[test]
fn test_increment_malformed_leaves_value() {
    let store = SortedStore::new(Config::default()).unwrap();
    store.put(b"name", b"alice", None).unwrap();

    let mut op = Increment::new("name", 1);
    assert!(matches!(
        store.execute(&mut op),
        Err(BurrowError::OperationFailed(_))
    ));
    assert_eq!(op.result(), None);
    assert_eq!(store.get(b"name").unwrap(), Some(b"alice".to_vec()));
}

#[test]
fn test_increment_float() {
    let store = SortedStore::new(Config::default()).unwrap();
    store.put(b"temp", b"20.5", None).unwrap();

    let mut op = IncrementFloat::new("temp", 1.25);
    store.execute(&mut op).unwrap();
    assert_eq!(op.result(), Some(21.75));
    assert_eq!(store.get(b"temp").unwrap(), Some(b"21.75".to_vec()));
}

#[test]
fn test_append() {
    let store = SortedStore::new(Config::default()).unwrap();

    let mut op = Append::new("log", "a");
    store.execute(&mut op).unwrap();
    let mut op = Append::new("log", "bc");
    store.execute(&mut op).unwrap();

    assert_eq!(op.new_len(), Some(3));
    assert_eq!(store.get(b"log").unwrap(), Some(b"abc".to_vec()));
}

#[test]
fn test_update_keeps_expiration() {
    let store = SortedStore::new(Config::default()).unwrap();
    store.put(b"counter", b"1", Some(5_000)).unwrap();

    store.execute(&mut Increment::new("counter", 1)).unwrap();
    let entry = store.get_entry(b"counter").unwrap().unwrap();
    assert_eq!(entry.value, b"2".to_vec());
    assert_eq!(entry.expire_at, Some(5_000));
}

#[test]
fn test_execute_on_compressed_block() {
    let config = Config::builder().codec(CodecKind::Lz4).build();
    let store = SortedStore::new(config).unwrap();
    for i in 0..100u32 {
        store.put(format!("c{:03}", i).as_bytes(), b"0", None).unwrap();
    }
    assert!(store.compress_all().unwrap() > 0);

    store.execute(&mut Increment::new("c050", 9)).unwrap();
    assert_eq!(store.get(b"c050").unwrap(), Some(b"9".to_vec()));
    assert_eq!(store.get(b"c051").unwrap(), Some(b"0".to_vec()));
}

/// Custom operation: delete the record once it reaches zero
struct Decrement {
    key: Vec<u8>,
}

impl AtomicOperation for Decrement {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn apply(&mut self, current: Option<Current<'_>>) -> burrowkv::Result<Update> {
        let Some(current) = current else {
            return Ok(Update::Keep);
        };
        let n: i64 = std::str::from_utf8(current.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BurrowError::OperationFailed("not a number".to_string()))?;
        if n <= 1 {
            Ok(Update::Delete)
        } else {
            Ok(Update::Put {
                value: (n - 1).to_string().into_bytes(),
                expire_at: current.expire_at,
            })
        }
    }
}

#[test]
fn test_custom_operation_can_delete() {
    let store = SortedStore::new(Config::default()).unwrap();
    store.put(b"tickets", b"2", None).unwrap();

    let mut op = Decrement {
        key: b"tickets".to_vec(),
    };
    store.execute(&mut op).unwrap();
    assert_eq!(store.get(b"tickets").unwrap(), Some(b"1".to_vec()));
    store.execute(&mut op).unwrap();
    assert!(!store.exists(b"tickets").unwrap());

    // Absent key: nothing happens
    assert!(store.execute(&mut op).unwrap());
    assert!(!store.exists(b"tickets").unwrap());
}

#[test]
fn test_rejected_update_clears_result() {
    let config = Config::builder()
        .max_block_size(1024)
        .memory_limit(64 * 1024)
        .build();
    let store = SortedStore::new(config).unwrap();
    let mut filled = 0u32;
    while store
        .put(format!("fill:{:06}", filled).as_bytes(), &[1u8; 100], None)
        .unwrap()
    {
        filled += 1;
    }
    assert!(filled > 0);

    let key = b"fill:000000";
    let mut op = Append::new(key.to_vec(), vec![2u8; 32 * 1024]);
    assert!(!store.execute(&mut op).unwrap());
    assert_eq!(op.new_len(), None);
    assert_eq!(store.get(key).unwrap(), Some(vec![1u8; 100]));

    // Once there is room the update is stored and reported
    for i in filled / 2..filled {
        store.delete(format!("fill:{:06}", i).as_bytes()).unwrap();
    }
    let mut op = Append::new(key.to_vec(), b"!".to_vec());
    assert!(store.execute(&mut op).unwrap());
    assert_eq!(op.new_len(), Some(101));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_increments_lose_nothing() {
    let store = Arc::new(SortedStore::new(Config::default()).unwrap());
    let threads = 8;
    let per_thread = 2_000;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..per_thread {
                    store.execute(&mut Increment::new("shared", 1)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (threads * per_thread).to_string();
    assert_eq!(store.get(b"shared").unwrap(), Some(expected.into_bytes()));
}

#[test]
fn test_concurrent_appends_while_splitting() {
    let config = Config::builder().max_block_size(512).build();
    let store = SortedStore::new(config).unwrap();
    let threads = 4u32;
    let keys = 64u32;
    let rounds = 50u32;

    std::thread::scope(|s| {
        for t in 0..threads {
            let store = &store;
            s.spawn(move || {
                for r in 0..rounds {
                    for k in 0..keys {
                        let key = format!("list:{:03}", (k + t * 7 + r) % keys);
                        store.execute(&mut Append::new(key, "x")).unwrap();
                    }
                }
            });
        }
    });

    assert!(store.block_count() > 1);
    for k in 0..keys {
        let value = store.get(format!("list:{:03}", k).as_bytes()).unwrap().unwrap();
        assert_eq!(value.len(), (threads * rounds) as usize);
    }
}
