//! Snapshot / Restore
//!
//! ## Directory Layout
//! ```text
//! {dir}/
//!   ├── MANIFEST                       bincode-encoded [`Manifest`]
//!   ├── block_00000003_00000000.blk    generation 3, image 0
//!   ├── block_00000003_00000001.blk    one image per block, in key order
//!   └── dictionaries_00000003/
//!         └── dict_000001.zdict
//! ```
//! A snapshot walks the blocks left to right, holding one block at a time,
//! so writers keep running; every record is written exactly once even if
//! blocks split during the walk.
//!
//! Each snapshot writes a new generation next to the previous one and
//! switches to it by renaming `MANIFEST` into place. Files of other
//! generations are pruned only after that rename, so a snapshot that fails
//! partway leaves the previous one intact. The manifest records the CRC of
//! every image, so an image from another generation is rejected.
//!
//! Restore reads every image, verifies CRC, ordering and counts, and charges
//! memory from scratch instead of trusting any stored totals. Statistics are
//! published to the pool once at the end.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::block::{decode_payload, BlockImage, DataBlock, OwnedRecords};
use crate::codec::CodecType;
use crate::config::Config;
use crate::error::{BurrowError, Result};
use crate::memory::MemoryPool;
use crate::record::{self, RecordKind};

use super::{Probe, SortedStore};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_VERSION: u32 = 1;
const DICTIONARY_DIR_PREFIX: &str = "dictionaries_";
const BLOCK_FILE_PREFIX: &str = "block_";
const BLOCK_FILE_EXT: &str = "blk";
const TMP_EXT: &str = "tmp";

/// Snapshot table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Snapshot generation; every file written by this snapshot carries it
    pub generation: u64,
    /// Unix millis when the snapshot finished
    pub created_at: u64,
    pub max_block_size: u64,
    pub record_count: u64,
    /// Directory (relative to the snapshot) holding the dictionaries
    pub dictionary_dir: String,
    /// Dictionary files written under `dictionary_dir`
    pub dictionary_count: u64,
    /// Block images in key order
    pub blocks: Vec<ManifestBlock>,
}

/// Manifest entry for one block image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBlock {
    pub file: String,
    pub first_key: Vec<u8>,
    pub record_count: u32,
    pub codec: u8,
    /// CRC32 of the whole image file
    pub crc: u32,
}

impl SortedStore {
    /// Write every block to `dir`, replacing any previous snapshot there.
    /// On error the previous snapshot in `dir` is still the one restored.
    pub fn snapshot(&self, dir: &Path) -> Result<Manifest> {
        fs::create_dir_all(dir)?;
        let generation = next_generation(dir);

        let mut blocks = Vec::new();
        let mut record_count = 0u64;
        let mut target = Vec::new();
        loop {
            let step = self.read_slot(Probe::Floor(&target), false, |slot, block| {
                let image = self.block_image(&target, slot.index_key, block)?;
                Ok((image, slot.next_key.map(<[u8]>::to_vec)))
            })?;
            let Some((image, next)) = step else {
                break;
            };

            // Only the leftmost image may be empty
            if image.count > 0 || image.first_key.is_empty() {
                let file = format!(
                    "{}{:08}_{:08}.{}",
                    BLOCK_FILE_PREFIX,
                    generation,
                    blocks.len(),
                    BLOCK_FILE_EXT
                );
                let encoded = image.encode();
                write_atomic(&dir.join(&file), &encoded)?;
                record_count += image.count as u64;
                blocks.push(ManifestBlock {
                    file,
                    first_key: image.first_key,
                    record_count: image.count,
                    codec: image.codec as u8,
                    crc: crc32fast::hash(&encoded),
                });
            }

            match next {
                Some(key) => target = key,
                None => break,
            }
        }

        let dictionary_dir = format!("{}{:08}", DICTIONARY_DIR_PREFIX, generation);
        let mut dictionary_count = 0u64;
        for codec in self.codecs.known() {
            dictionary_count += codec.export_dictionaries(&dir.join(&dictionary_dir))? as u64;
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            generation,
            created_at: unix_millis(),
            max_block_size: self.max_block_size() as u64,
            record_count,
            dictionary_dir,
            dictionary_count,
            blocks,
        };
        write_atomic(&dir.join(MANIFEST_FILE), &bincode::serialize(&manifest)?)?;
        if let Err(e) = remove_stale_files(dir, &manifest) {
            tracing::warn!("Failed to prune old snapshot files in {}: {}", dir.display(), e);
        }

        tracing::info!(
            "Snapshot written to {}: {} blocks, {} records",
            dir.display(),
            manifest.blocks.len(),
            manifest.record_count
        );
        Ok(manifest)
    }

    /// Rebuild a store from a snapshot directory
    pub fn restore(dir: &Path, config: Config) -> Result<Self> {
        config.validate()?;
        let pool = MemoryPool::new(config.memory_limit);
        Self::restore_with_pool(dir, config, pool)
    }

    /// Rebuild a store from a snapshot directory, charging a shared pool
    pub fn restore_with_pool(dir: &Path, config: Config, pool: Arc<MemoryPool>) -> Result<Self> {
        let manifest = read_manifest(dir)?;
        let publish = config.statistics_enabled;
        let store = Self::with_pool(config, pool)?;

        let dictionary_dir = dir.join(&manifest.dictionary_dir);
        if dictionary_dir.is_dir() {
            let used: BTreeSet<u8> = manifest.blocks.iter().map(|b| b.codec).collect();
            for id in used {
                let codec_type = CodecType::from_u8(id)?;
                if codec_type != CodecType::None {
                    store
                        .codecs
                        .resolve(codec_type)?
                        .import_dictionaries(&dictionary_dir)?;
                }
            }
        }

        store.tracker.disable();
        let loaded = store.load_images(dir, &manifest);
        if publish {
            store.tracker.enable();
        } else {
            store.tracker.sync();
        }
        loaded?;

        tracing::info!(
            "Restored {} blocks, {} records from {}",
            manifest.blocks.len(),
            manifest.record_count,
            dir.display()
        );
        Ok(store)
    }

    /// Image of the records `>= target` held by `block`.
    ///
    /// A compressed block without nested values is written as is; anything
    /// else is re-encoded with nested values inlined and compressed with the
    /// active codec when worthwhile.
    fn block_image(&self, target: &[u8], index_key: &[u8], block: &DataBlock) -> Result<BlockImage> {
        let records = block.records(&self.codecs)?;
        let view = records.view();
        let start = if target == index_key {
            0
        } else {
            view.lower_bound(target)?
        };

        let mut has_chains = false;
        for i in start..view.len() {
            has_chains |= view.record(i)?.kind == RecordKind::Chain;
        }

        if start == 0 && !has_chains {
            if let Some(payload) = block.compressed_payload() {
                return Ok(BlockImage {
                    first_key: target.to_vec(),
                    codec: block.codec_type(),
                    count: block.len() as u32,
                    raw_len: block.encoded_size() as u32,
                    payload: payload.to_vec(),
                });
            }
        }

        let mut raw = Vec::with_capacity(view.span(start, view.len()).len());
        let mut value = Vec::new();
        for i in start..view.len() {
            let rec = view.record(i)?;
            value.clear();
            rec.kind.serialize_value(rec.value, &self.chains, &mut value)?;
            record::encode_into(&mut raw, rec.kind, rec.key, &value, rec.expire_at);
        }

        let count = (view.len() - start) as u32;
        let raw_len = raw.len() as u32;
        let (codec, payload) = match self.codecs.active() {
            Some(codec) if raw.len() >= codec.compression_threshold() => {
                let mut out = Vec::new();
                codec.compress(&raw, &mut out)?;
                if out.len() < raw.len() {
                    (codec.codec_type(), out)
                } else {
                    (CodecType::None, raw)
                }
            }
            _ => (CodecType::None, raw),
        };

        Ok(BlockImage {
            first_key: target.to_vec(),
            codec,
            count,
            raw_len,
            payload,
        })
    }

    fn load_images(&self, dir: &Path, manifest: &Manifest) -> Result<()> {
        let Some(first) = manifest.blocks.first() else {
            return Err(BurrowError::Corruption("snapshot has no blocks".to_string()));
        };
        if !first.first_key.is_empty() {
            return Err(BurrowError::Corruption(
                "first snapshot block does not start at the empty key".to_string(),
            ));
        }

        let mut index = self.index.write();
        let mut record_count = 0u64;
        for (n, entry) in manifest.blocks.iter().enumerate() {
            let bytes = fs::read(dir.join(&entry.file))?;
            if crc32fast::hash(&bytes) != entry.crc {
                return Err(BurrowError::Corruption(format!(
                    "{} does not belong to snapshot generation {}",
                    entry.file, manifest.generation
                )));
            }
            let image = BlockImage::decode(&bytes)?;
            if image.first_key != entry.first_key || image.count != entry.record_count {
                return Err(BurrowError::Corruption(format!(
                    "{} does not match its manifest entry",
                    entry.file
                )));
            }

            let upper = manifest.blocks.get(n + 1).map(|b| b.first_key.as_slice());
            if upper.is_some_and(|u| u <= image.first_key.as_slice()) {
                return Err(BurrowError::Corruption(format!(
                    "{} is out of key order",
                    entry.file
                )));
            }

            let block = self.load_block(&image, upper)?;
            record_count += block.len() as u64;
            if !image.first_key.is_empty() {
                self.charge_index(&image.first_key);
            }
            index.insert(image.first_key, Arc::new(parking_lot::RwLock::new(block)));
        }

        if record_count != manifest.record_count {
            return Err(BurrowError::Corruption(format!(
                "snapshot holds {} records, manifest claims {}",
                record_count, manifest.record_count
            )));
        }
        Ok(())
    }

    /// Decode and validate one image, then rebuild its block.
    /// Every record must lie in `[image.first_key, upper)`.
    fn load_block(&self, image: &BlockImage, upper: Option<&[u8]>) -> Result<DataBlock> {
        let owned = decode_payload(
            &self.codecs,
            image.codec,
            &image.payload,
            image.raw_len as usize,
            image.count as usize,
        )?;
        let view = owned.view();
        view.check_sorted()?;

        if let Some(first) = view.first_key()? {
            let last = view.key(view.len() - 1)?;
            if first < image.first_key.as_slice() || upper.is_some_and(|u| last >= u) {
                return Err(BurrowError::Corruption(
                    "block image holds keys outside its range".to_string(),
                ));
            }
        }

        let mut has_chains = false;
        for i in 0..view.len() {
            has_chains |= view.record(i)?.kind == RecordKind::Chain;
        }

        let ceiling = || {
            BurrowError::CapacityExceeded(format!(
                "restoring block at {:?}",
                String::from_utf8_lossy(&image.first_key)
            ))
        };

        if !has_chains {
            let block = if image.codec == CodecType::None {
                DataBlock::from_records(&self.tracker, view)
            } else {
                DataBlock::from_compressed(
                    &self.tracker,
                    &image.payload,
                    image.codec,
                    image.raw_len as usize,
                    image.count as usize,
                )
            };
            return block.ok_or_else(ceiling);
        }

        let mut raw = Vec::with_capacity(owned.data().len());
        for i in 0..view.len() {
            let rec = view.record(i)?;
            let value = rec
                .kind
                .deserialize_value(rec.value, &self.chains)?
                .ok_or_else(ceiling)?;
            record::encode_into(&mut raw, rec.kind, rec.key, &value, rec.expire_at);
        }
        let rebuilt = OwnedRecords::from_data(raw)?;
        DataBlock::from_records(&self.tracker, rebuilt.view()).ok_or_else(ceiling)
    }
}

fn read_manifest(dir: &Path) -> Result<Manifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = bincode::deserialize(&bytes)?;
    if manifest.version != MANIFEST_VERSION {
        return Err(BurrowError::Corruption(format!(
            "unsupported manifest version: {}",
            manifest.version
        )));
    }
    Ok(manifest)
}

/// Write through a synced temporary file so readers never see a partial
/// file
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(TMP_EXT);
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Generation following the committed one in `dir`. Files left by a failed
/// attempt at that generation are overwritten.
fn next_generation(dir: &Path) -> u64 {
    read_manifest(dir).map_or(0, |m| m.generation) + 1
}

/// "block_00000003_00000001.blk" → Some(3), "dictionaries_00000003" → Some(3)
fn parse_generation(name: &str) -> Option<u64> {
    if let Some(rest) = name.strip_prefix(BLOCK_FILE_PREFIX) {
        return rest.split('_').next()?.parse().ok();
    }
    name.strip_prefix(DICTIONARY_DIR_PREFIX)?.parse().ok()
}

/// Delete images and dictionary directories not referenced by `manifest`,
/// including leftovers of failed snapshots
fn remove_stale_files(dir: &Path, manifest: &Manifest) -> Result<()> {
    let live: BTreeSet<&str> = manifest.blocks.iter().map(|b| b.file.as_str()).collect();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if live.contains(name) || name == manifest.dictionary_dir {
            continue;
        }
        if parse_generation(name).is_none() {
            continue;
        }
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
