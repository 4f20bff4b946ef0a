//! Dictionary-trained Zstandard codec
//!
//! Block payloads are sampled while no dictionary exists. Once enough sample
//! bytes have accumulated, a background worker trains a dictionary, persists
//! it and makes it current; later payloads are compressed with it.
//!
//! ## Payload Format
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ DictionaryId (4) │         zstd frame           │
//! └──────────────────┴──────────────────────────────┘
//! ```
//! Id 0 means the frame was written without a dictionary. Dictionaries are
//! never dropped while the codec lives, so every id it ever produced stays
//! decodable.
//!
//! ## Dictionary Files
//! `{dir}/dict_{id:06}.zdict`, raw dictionary bytes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{BurrowError, Result};

use super::{check_raw_len, Codec, CodecStats, CodecType};

/// Same floor as the plain zstd codec, minus the id it does not pay for
const DICTIONARY_THRESHOLD: usize = 64;

/// Size of the dictionary id prefix
const DICT_ID_SIZE: usize = 4;

/// Single samples are capped so one huge block cannot dominate training
const MAX_SAMPLE_SIZE: usize = 16 * 1024;

const DICT_FILE_PREFIX: &str = "dict_";
const DICT_FILE_EXT: &str = "zdict";

#[derive(Default)]
struct SampleBuffer {
    samples: Vec<Vec<u8>>,
    bytes: usize,
}

struct DictionaryState {
    level: i32,
    dictionary_size: usize,
    training_bytes: usize,
    dir: Option<PathBuf>,
    dictionaries: RwLock<BTreeMap<u32, Arc<Vec<u8>>>>,
    current: AtomicU32,
    samples: Mutex<SampleBuffer>,
    training: AtomicBool,
    stats: CodecStats,
}

impl DictionaryState {
    fn dictionary(&self, id: u32) -> Option<Arc<Vec<u8>>> {
        self.dictionaries.read().get(&id).cloned()
    }

    /// Train a dictionary from `samples`, persist it and make it current
    fn train(&self, samples: &[Vec<u8>]) -> Result<u32> {
        let dict = ::zstd::dict::from_samples(samples, self.dictionary_size)
            .map_err(|e| BurrowError::Compression(format!("dictionary training: {}", e)))?;

        let id = {
            let mut dictionaries = self.dictionaries.write();
            let id = dictionaries.keys().next_back().map_or(1, |last| last + 1);
            if let Some(dir) = &self.dir {
                write_dictionary(dir, id, &dict)?;
            }
            dictionaries.insert(id, Arc::new(dict));
            id
        };
        self.current.store(id, Ordering::Release);

        tracing::debug!(
            "Trained dictionary {} from {} samples",
            id,
            samples.len()
        );
        Ok(id)
    }

    /// Keep a copy of `src` for training; returns the batch once it is
    /// large enough and no other training run is pending.
    fn collect_sample(&self, src: &[u8]) -> Option<Vec<Vec<u8>>> {
        if self.current.load(Ordering::Acquire) != 0 || self.training.load(Ordering::Acquire) {
            return None;
        }
        let mut buffer = self.samples.lock();
        let sample = &src[..src.len().min(MAX_SAMPLE_SIZE)];
        buffer.bytes += sample.len();
        buffer.samples.push(sample.to_vec());

        if buffer.bytes < self.training_bytes {
            return None;
        }
        if self
            .training
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        buffer.bytes = 0;
        Some(std::mem::take(&mut buffer.samples))
    }

    fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut loaded = 0;
        let mut dictionaries = self.dictionaries.write();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(id) = parse_dictionary_id(&path) else {
                continue;
            };
            if dictionaries.contains_key(&id) {
                continue;
            }
            dictionaries.insert(id, Arc::new(fs::read(&path)?));
            loaded += 1;
        }
        if let Some(&newest) = dictionaries.keys().next_back() {
            if newest > self.current.load(Ordering::Acquire) {
                self.current.store(newest, Ordering::Release);
            }
        }
        Ok(loaded)
    }
}

/// Zstandard codec with trained dictionaries
pub struct DictionaryCodec {
    state: Arc<DictionaryState>,
    trainer: Option<Sender<Vec<Vec<u8>>>>,
    worker: Option<JoinHandle<()>>,
}

impl DictionaryCodec {
    /// Create the codec, loading dictionaries already present in `dir`
    pub fn open(
        level: i32,
        dictionary_size: usize,
        training_bytes: usize,
        dir: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(dir) = &dir {
            fs::create_dir_all(dir)?;
        }

        let state = Arc::new(DictionaryState {
            level,
            dictionary_size,
            training_bytes,
            dir: dir.clone(),
            dictionaries: RwLock::new(BTreeMap::new()),
            current: AtomicU32::new(0),
            samples: Mutex::new(SampleBuffer::default()),
            training: AtomicBool::new(false),
            stats: CodecStats::default(),
        });

        if let Some(dir) = &dir {
            let loaded = state.load_dir(dir)?;
            if loaded > 0 {
                tracing::info!("Loaded {} dictionaries from {}", loaded, dir.display());
            }
        }

        let (tx, rx) = channel::unbounded::<Vec<Vec<u8>>>();
        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name("burrowkv-dict-trainer".to_string())
            .spawn(move || {
                for samples in rx {
                    if let Err(e) = worker_state.train(&samples) {
                        tracing::warn!("Dictionary training failed: {}", e);
                    }
                    worker_state.training.store(false, Ordering::Release);
                }
            })?;

        Ok(Self {
            state,
            trainer: Some(tx),
            worker: Some(worker),
        })
    }

    /// Train synchronously from the given samples. Returns the new id.
    pub fn train_from_samples(&self, samples: &[Vec<u8>]) -> Result<u32> {
        self.state.train(samples)
    }

    /// Id of the dictionary used for new payloads (0 = none yet)
    pub fn current_dictionary(&self) -> u32 {
        self.state.current.load(Ordering::Acquire)
    }

    /// Number of dictionaries available for decompression
    pub fn dictionary_count(&self) -> usize {
        self.state.dictionaries.read().len()
    }

    /// Whether a background training run is in flight
    pub fn is_training(&self) -> bool {
        self.state.training.load(Ordering::Acquire)
    }
}

impl Codec for DictionaryCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::ZstdDictionary
    }

    fn compression_threshold(&self) -> usize {
        DICTIONARY_THRESHOLD
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        if let Some(batch) = self.state.collect_sample(src) {
            let sent = self
                .trainer
                .as_ref()
                .map(|tx| tx.send(batch).is_ok())
                .unwrap_or(false);
            if !sent {
                self.state.training.store(false, Ordering::Release);
            }
        }

        let id = self.state.current.load(Ordering::Acquire);
        let frame = match self.state.dictionary(id) {
            Some(dict) => ::zstd::bulk::Compressor::with_dictionary(self.state.level, &dict)
                .and_then(|mut c| c.compress(src)),
            None => ::zstd::bulk::compress(src, self.state.level),
        }
        .map_err(|e| BurrowError::Compression(format!("zstd dictionary compress: {}", e)))?;

        let used = if self.state.dictionary(id).is_some() { id } else { 0 };
        dst.clear();
        dst.extend_from_slice(&used.to_le_bytes());
        dst.extend_from_slice(&frame);
        self.state.stats.record_compress(src.len(), dst.len());
        Ok(dst.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, raw_len: usize) -> Result<usize> {
        if src.len() < DICT_ID_SIZE {
            return Err(BurrowError::Corruption(
                "dictionary payload shorter than its id".to_string(),
            ));
        }
        let (id_bytes, frame) = src.split_at(DICT_ID_SIZE);
        let id = u32::from_le_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);

        let raw = if id == 0 {
            ::zstd::bulk::decompress(frame, raw_len)
        } else {
            let dict = self.state.dictionary(id).ok_or_else(|| {
                BurrowError::Corruption(format!("payload needs unknown dictionary {}", id))
            })?;
            ::zstd::bulk::Decompressor::with_dictionary(&dict)
                .and_then(|mut d| d.decompress(frame, raw_len))
        }
        .map_err(|e| BurrowError::Corruption(format!("zstd dictionary decompress: {}", e)))?;

        check_raw_len(CodecType::ZstdDictionary, raw.len(), raw_len)?;
        *dst = raw;
        self.state.stats.record_decompress(raw_len);
        Ok(raw_len)
    }

    fn stats(&self) -> &CodecStats {
        &self.state.stats
    }

    fn export_dictionaries(&self, dir: &Path) -> Result<usize> {
        let dictionaries = self.state.dictionaries.read();
        if dictionaries.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(dir)?;
        for (id, dict) in dictionaries.iter() {
            write_dictionary(dir, *id, dict)?;
        }
        Ok(dictionaries.len())
    }

    fn import_dictionaries(&self, dir: &Path) -> Result<usize> {
        self.state.load_dir(dir)
    }
}

impl Drop for DictionaryCodec {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.trainer.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn dictionary_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{}{:06}.{}", DICT_FILE_PREFIX, id, DICT_FILE_EXT))
}

/// "dict_000042.zdict" → Some(42)
fn parse_dictionary_id(path: &Path) -> Option<u32> {
    if path.extension()? != DICT_FILE_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_string_lossy();
    stem.strip_prefix(DICT_FILE_PREFIX)?.parse().ok()
}

fn write_dictionary(dir: &Path, id: u32, dict: &[u8]) -> Result<()> {
    let path = dictionary_path(dir, id);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, dict)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}
