//! Tests for snapshot / restore
//!
//! These tests verify:
//! - Round trip of flat, chain and expiring records
//! - Compressed blocks (LZ4, Zstd, dictionary) survive a round trip
//! - Corrupted or missing images are detected
//! - Restore re-derives memory accounting
//! - Re-snapshotting into the same directory drops stale images
//! - A snapshot that fails partway leaves the previous one restorable
//! - Images from another snapshot generation are rejected

use std::fs;
use std::path::Path;
use std::sync::Arc;

use burrowkv::codec::DictionaryCodec;
use burrowkv::{BurrowError, CodecKind, Config, Entry, MemoryPool, SortedStore};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn key_for(i: u32) -> Vec<u8> {
    format!("snap:{:06}", i).into_bytes()
}

fn populated(n: u32, codec: CodecKind) -> SortedStore {
    let config = Config::builder().max_block_size(512).codec(codec).build();
    let store = SortedStore::new(config).unwrap();
    for i in 0..n {
        let value = format!("{{\"n\":{},\"kind\":\"snapshot-test\"}}", i);
        store.put(&key_for(i), value.as_bytes(), None).unwrap();
    }
    store
}

fn all_entries(store: &SortedStore) -> Vec<Entry> {
    store
        .scanner(None, None, false)
        .unwrap()
        .unwrap()
        .entries()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn fill(store: &SortedStore, n: u32, tag: &str) {
    for i in 0..n {
        let value = format!("{}:{:06}:generation-value", tag, i);
        assert!(store.put(&key_for(i), value.as_bytes(), None).unwrap());
    }
}

fn block_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".blk"))
        .collect();
    files.sort();
    files
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_raw() {
    let temp = TempDir::new().unwrap();
    let store = populated(2_000, CodecKind::None);
    store.put(&key_for(7), b"expiring", Some(123_456)).unwrap();

    let manifest = store.snapshot(temp.path()).unwrap();
    assert_eq!(manifest.record_count, 2_000);
    assert_eq!(manifest.blocks.len(), block_files(temp.path()).len());
    assert!(manifest.blocks[0].first_key.is_empty());

    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
    assert_eq!(restored.count_records().unwrap(), 2_000);
    assert_eq!(all_entries(&restored), all_entries(&store));
    assert_eq!(
        restored.get_entry(&key_for(7)).unwrap().unwrap().expire_at,
        Some(123_456)
    );
    assert_eq!(restored.max_block_size(), Config::default().max_block_size);
}

#[test]
fn test_round_trip_chains() {
    let temp = TempDir::new().unwrap();
    let store = populated(300, CodecKind::Lz4);
    store
        .put_chain(b"list:a", &[b"one".as_slice(), b"two", b"three"], None)
        .unwrap();
    store.put_chain(b"list:b", &[b"".as_slice()], Some(9)).unwrap();
    store.compress_all().unwrap();

    store.snapshot(temp.path()).unwrap();
    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();

    assert_eq!(
        restored.get_chain(b"list:a").unwrap(),
        Some(vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()])
    );
    assert_eq!(restored.get(b"list:a").unwrap(), Some(b"onetwothree".to_vec()));
    assert_eq!(restored.get_entry(b"list:b").unwrap().unwrap().expire_at, Some(9));
    assert_eq!(all_entries(&restored), all_entries(&store));

    // Restored chains are owned by the new store
    drop(store);
    assert_eq!(restored.get(b"list:a").unwrap(), Some(b"onetwothree".to_vec()));
}

#[test]
fn test_round_trip_compressed() {
    for codec in [CodecKind::Lz4, CodecKind::Zstd] {
        let temp = TempDir::new().unwrap();
        let store = populated(3_000, codec);
        assert!(store.compress_all().unwrap() > 0);

        let manifest = store.snapshot(temp.path()).unwrap();
        assert!(manifest.blocks.iter().any(|b| b.codec != 0));

        // The restoring store does not need the same active codec
        let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
        assert_eq!(all_entries(&restored), all_entries(&store));
    }
}

#[test]
fn test_round_trip_dictionary() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .max_block_size(512)
        .codec(CodecKind::ZstdDictionary)
        .dictionary_size(4096)
        .dictionary_training_bytes(usize::MAX)
        .build();
    let store = SortedStore::new(config).unwrap();
    for i in 0..3_000u32 {
        let value = format!("{{\"n\":{},\"kind\":\"snapshot-test\"}}", i);
        store.put(&key_for(i), value.as_bytes(), None).unwrap();
    }

    let trainer = DictionaryCodec::open(3, 4096, usize::MAX, None).unwrap();
    let samples: Vec<Vec<u8>> = all_entries(&store)
        .into_iter()
        .map(|e| [e.key, e.value].concat())
        .collect();
    trainer.train_from_samples(&samples).unwrap();
    store.set_compression_codec(Some(Arc::new(trainer)));
    assert!(store.compress_all().unwrap() > 0);

    let manifest = store.snapshot(temp.path()).unwrap();
    assert_eq!(manifest.dictionary_count, 1);
    assert!(temp
        .path()
        .join(&manifest.dictionary_dir)
        .join("dict_000001.zdict")
        .exists());

    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
    assert_eq!(all_entries(&restored), all_entries(&store));
}

#[test]
fn test_round_trip_empty_store() {
    let temp = TempDir::new().unwrap();
    let store = SortedStore::new(Config::default()).unwrap();
    let manifest = store.snapshot(temp.path()).unwrap();
    assert_eq!(manifest.blocks.len(), 1);
    assert_eq!(manifest.record_count, 0);

    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
    assert_eq!(restored.count_records().unwrap(), 0);
    assert!(restored.put(b"k", b"v", None).unwrap());
}

#[test]
fn test_resnapshot_removes_stale_images() {
    let temp = TempDir::new().unwrap();
    let store = populated(2_000, CodecKind::None);
    let first = store.snapshot(temp.path()).unwrap();

    for i in 0..1_900 {
        store.delete(&key_for(i)).unwrap();
    }
    let second = store.snapshot(temp.path()).unwrap();
    assert!(second.blocks.len() < first.blocks.len());
    assert_eq!(block_files(temp.path()).len(), second.blocks.len());

    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
    assert_eq!(restored.count_records().unwrap(), 100);
}

#[test]
fn test_resnapshot_advances_generation() {
    let temp = TempDir::new().unwrap();
    let store = populated(500, CodecKind::None);
    let first = store.snapshot(temp.path()).unwrap();
    let second = store.snapshot(temp.path()).unwrap();

    assert_eq!(second.generation, first.generation + 1);
    assert!(block_files(temp.path())
        .iter()
        .all(|name| second.blocks.iter().any(|b| &b.file == name)));
    assert!(first.blocks.iter().all(|b| !temp.path().join(&b.file).exists()));
}

// =============================================================================
// Interrupted Snapshot Tests
// =============================================================================

#[test]
fn test_failed_snapshot_keeps_previous_snapshot() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder().max_block_size(512).build();
    let store = SortedStore::new(config).unwrap();
    fill(&store, 200, "v");
    let first = store.snapshot(temp.path()).unwrap();
    assert!(first.blocks.len() > 3);

    fill(&store, 200, "w");
    // Occupy the temporary path of the third image of the next generation
    let blocker = temp
        .path()
        .join(format!("block_{:08}_{:08}.tmp", first.generation + 1, 2));
    fs::create_dir(&blocker).unwrap();
    assert!(store.snapshot(temp.path()).is_err());

    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
    assert_eq!(restored.count_records().unwrap(), 200);
    for i in 0..200 {
        let value = restored.get(&key_for(i)).unwrap().unwrap();
        assert!(value.starts_with(b"v:"), "key {} restored a newer value", i);
    }

    // The retry reuses the uncommitted generation and clears the old one
    fs::remove_dir(&blocker).unwrap();
    let retry = store.snapshot(temp.path()).unwrap();
    assert_eq!(retry.generation, first.generation + 1);
    assert_eq!(block_files(temp.path()).len(), retry.blocks.len());
    assert!(first.blocks.iter().all(|b| !temp.path().join(&b.file).exists()));

    let restored = SortedStore::restore(temp.path(), Config::default()).unwrap();
    assert_eq!(all_entries(&restored), all_entries(&store));
    assert!(all_entries(&restored).iter().all(|e| e.value.starts_with(b"w:")));
}

#[test]
fn test_image_from_other_generation_rejected() {
    let (old_dir, new_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let config = Config::builder().max_block_size(512).build();

    let store = SortedStore::new(config.clone()).unwrap();
    fill(&store, 200, "v");
    store.snapshot(old_dir.path()).unwrap();
    fill(&store, 200, "w");
    let manifest = store.snapshot(new_dir.path()).unwrap();

    // Same keys, same sizes: only the image contents differ
    let name = &manifest.blocks[2].file;
    assert!(old_dir.path().join(name).exists());
    fs::copy(old_dir.path().join(name), new_dir.path().join(name)).unwrap();

    assert!(matches!(
        SortedStore::restore(new_dir.path(), Config::default()),
        Err(BurrowError::Corruption(_))
    ));
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_byte_detected() {
    let temp = TempDir::new().unwrap();
    let store = populated(1_000, CodecKind::None);
    store.snapshot(temp.path()).unwrap();

    let victim = temp.path().join(&block_files(temp.path())[3]);
    let mut bytes = fs::read(&victim).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&victim, bytes).unwrap();

    assert!(matches!(
        SortedStore::restore(temp.path(), Config::default()),
        Err(BurrowError::Corruption(_))
    ));
}

#[test]
fn test_missing_image_detected() {
    let temp = TempDir::new().unwrap();
    let store = populated(1_000, CodecKind::None);
    store.snapshot(temp.path()).unwrap();

    fs::remove_file(temp.path().join(&block_files(temp.path())[1])).unwrap();
    assert!(matches!(
        SortedStore::restore(temp.path(), Config::default()),
        Err(BurrowError::Io(_))
    ));
}

#[test]
fn test_swapped_images_detected() {
    let temp = TempDir::new().unwrap();
    let store = populated(1_000, CodecKind::None);
    store.snapshot(temp.path()).unwrap();

    let files = block_files(temp.path());
    let a = temp.path().join(&files[1]);
    let b = temp.path().join(&files[2]);
    let (bytes_a, bytes_b) = (fs::read(&a).unwrap(), fs::read(&b).unwrap());
    fs::write(&a, bytes_b).unwrap();
    fs::write(&b, bytes_a).unwrap();

    assert!(matches!(
        SortedStore::restore(temp.path(), Config::default()),
        Err(BurrowError::Corruption(_))
    ));
}

#[test]
fn test_garbage_manifest_rejected() {
    let temp = TempDir::new().unwrap();
    populated(10, CodecKind::None).snapshot(temp.path()).unwrap();
    fs::write(temp.path().join("MANIFEST"), b"not a manifest").unwrap();

    assert!(SortedStore::restore(temp.path(), Config::default()).is_err());
    assert!(SortedStore::restore(&temp.path().join("absent"), Config::default()).is_err());
}

// =============================================================================
// Accounting Tests
// =============================================================================

#[test]
fn test_restore_accounting_matches_pool() {
    let temp = TempDir::new().unwrap();
    populated(2_000, CodecKind::Lz4).snapshot(temp.path()).unwrap();

    for statistics_enabled in [true, false] {
        let pool = MemoryPool::new(1 << 30);
        let config = Config::builder()
            .statistics_enabled(statistics_enabled)
            .build();
        let restored =
            SortedStore::restore_with_pool(temp.path(), config, Arc::clone(&pool)).unwrap();

        assert!(restored.stats().allocated > 0);
        assert_eq!(pool.stats(), restored.stats());

        restored.dispose();
        assert_eq!(pool.allocated(), 0);
    }
}

#[test]
fn test_restore_over_ceiling() {
    let temp = TempDir::new().unwrap();
    populated(5_000, CodecKind::None).snapshot(temp.path()).unwrap();

    let config = Config::builder().memory_limit(16 * 1024).build();
    assert!(matches!(
        SortedStore::restore(temp.path(), config),
        Err(BurrowError::CapacityExceeded(_))
    ));
}
