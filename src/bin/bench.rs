//! burrowkv Demo Binary
//!
//! Drives load, scan, snapshot and restore workloads against an in-process
//! store and reports timings and memory accounting.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use burrowkv::{Append, CodecKind, Config, SortedStore};
use tracing_subscriber::{fmt, EnvFilter};

/// burrowkv workload driver
#[derive(Parser, Debug)]
#[command(name = "burrowkv-bench")]
#[command(about = "Load, scan and snapshot workloads for the burrowkv engine")]
#[command(version)]
struct Args {
    /// Maximum encoded bytes per data block
    #[arg(short, long, default_value = "4096", global = true)]
    block_size: usize,

    /// Memory ceiling in MB
    #[arg(short, long, default_value = "1024", global = true)]
    memory_mb: u64,

    /// Block compression codec
    #[arg(short, long, value_enum, default_value = "none", global = true)]
    codec: CodecArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert keys, then grow their values with appends
    Load {
        /// Number of distinct keys
        #[arg(short, long, default_value = "100000")]
        records: u64,

        /// Appends per key after the initial insert
        #[arg(short, long, default_value = "2")]
        appends: u64,
    },

    /// Load keys, then scan them forward and in reverse
    Scan {
        #[arg(short, long, default_value = "100000")]
        records: u64,
    },

    /// Load keys and write a snapshot
    Snapshot {
        #[arg(short, long, default_value = "100000")]
        records: u64,

        /// Snapshot directory
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Restore a snapshot and verify its record count
    Restore {
        /// Snapshot directory
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CodecArg {
    None,
    Lz4,
    Zstd,
    Dictionary,
}

impl From<CodecArg> for CodecKind {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::None => CodecKind::None,
            CodecArg::Lz4 => CodecKind::Lz4,
            CodecArg::Zstd => CodecKind::Zstd,
            CodecArg::Dictionary => CodecKind::ZstdDictionary,
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,burrowkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("burrowkv-bench v{}", burrowkv::VERSION);

    let config = Config::builder()
        .max_block_size(args.block_size)
        .memory_limit(args.memory_mb * 1024 * 1024)
        .codec(args.codec.into())
        .build();

    if let Err(e) = run(args.command, config) {
        tracing::error!("Workload failed: {}", e);
        process::exit(1);
    }
}

fn run(command: Command, config: Config) -> burrowkv::Result<()> {
    match command {
        Command::Load { records, appends } => {
            let store = SortedStore::new(config)?;
            load(&store, records)?;

            let start = Instant::now();
            for round in 0..appends {
                for i in 0..records {
                    // Vary the suffix so blocks grow unevenly
                    let suffix = vec![b'a' + (i % 26) as u8; 1 + ((i + round) % 5) as usize];
                    let mut op = Append::new(key_for(i), suffix);
                    store.execute(&mut op)?;
                }
            }
            tracing::info!(
                "Appended {} rounds in {:?}",
                appends,
                start.elapsed()
            );

            compress(&store)?;
            report(&store)?;
            store.dispose();
        }
        Command::Scan { records } => {
            let store = SortedStore::new(config)?;
            load(&store, records)?;
            compress(&store)?;

            let start = Instant::now();
            let mut forward = 0u64;
            if let Some(mut scanner) = store.scanner(None, None, false)? {
                while scanner.has_next() {
                    forward += 1;
                    scanner.next()?;
                }
            }
            tracing::info!("Forward scan: {} records in {:?}", forward, start.elapsed());

            let start = Instant::now();
            let mut reverse = 0u64;
            if let Some(mut scanner) = store.scanner(None, None, true)? {
                while scanner.has_next() {
                    reverse += 1;
                    scanner.previous()?;
                }
            }
            tracing::info!("Reverse scan: {} records in {:?}", reverse, start.elapsed());

            report(&store)?;
            store.dispose();
        }
        Command::Snapshot { records, dir } => {
            let store = SortedStore::new(config)?;
            load(&store, records)?;
            compress(&store)?;

            let start = Instant::now();
            let manifest = store.snapshot(&dir)?;
            tracing::info!(
                "Snapshot of {} records in {} blocks written to {} in {:?}",
                manifest.record_count,
                manifest.blocks.len(),
                dir.display(),
                start.elapsed()
            );
            store.dispose();
        }
        Command::Restore { dir } => {
            let start = Instant::now();
            let store = SortedStore::restore(&dir, config)?;
            tracing::info!("Restored {} in {:?}", dir.display(), start.elapsed());

            report(&store)?;
            store.dispose();
        }
    }
    Ok(())
}

fn key_for(i: u64) -> Vec<u8> {
    format!("key:{:012}", i).into_bytes()
}

fn load(store: &SortedStore, records: u64) -> burrowkv::Result<()> {
    let start = Instant::now();
    for i in 0..records {
        if !store.put(&key_for(i), &i.to_be_bytes(), None)? {
            tracing::warn!("Memory ceiling reached after {} records", i);
            break;
        }
    }
    tracing::info!("Loaded {} records in {:?}", records, start.elapsed());
    Ok(())
}

fn compress(store: &SortedStore) -> burrowkv::Result<()> {
    if store.compression_codec().is_none() {
        return Ok(());
    }
    let start = Instant::now();
    let compressed = store.compress_all()?;
    tracing::info!("Compressed {} blocks in {:?}", compressed, start.elapsed());
    Ok(())
}

fn report(store: &SortedStore) -> burrowkv::Result<()> {
    let stats = store.stats();
    tracing::info!(
        "records={} blocks={} allocated={} data={} index={}",
        store.count_records()?,
        store.block_count(),
        stats.allocated,
        stats.data_bytes,
        stats.index_bytes
    );
    if let Some(codec) = store.compression_codec() {
        tracing::info!(
            "codec={:?} average_ratio={:.3}",
            codec.codec_type(),
            codec.stats().average_ratio()
        );
    }
    Ok(())
}
