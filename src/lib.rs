//! # burrowkv
//!
//! An embeddable sorted key-value engine with:
//! - Capacity-bounded data blocks that split as they grow
//! - Transparent whole-block compression (LZ4, Zstd, dictionary Zstd)
//! - Bidirectional range scanners with ordinal skipping
//! - Atomic in-place increment and append
//! - A shared memory ceiling with per-store and global accounting
//! - Snapshot to and restore from a directory of checksummed block images
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Collection layer (Container, composite keys)       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ put / get / delete / execute / scanner
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     SortedStore                             │
//! │        index: first key ──► Arc<RwLock<DataBlock>>          │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//!  ┌───────────┐         ┌─────────────┐         ┌─────────────┐
//!  │ DataBlock │  ...    │  DataBlock  │  ...    │  DataBlock  │
//!  │ raw       │         │ compressed  │         │ raw         │
//!  └─────┬─────┘         └──────┬──────┘         └─────────────┘
//!        │                      │
//!        ▼                      ▼
//!  ┌───────────┐         ┌─────────────┐
//!  │ ChainArena│         │CodecRegistry│
//!  └───────────┘         └─────────────┘
//!        └──────────┬───────────┘
//!                   ▼
//!            ┌─────────────┐
//!            │ MemoryPool  │  ceiling + global counters
//!            └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod memory;

pub mod record;
pub mod keys;
pub mod chain;
pub mod codec;
pub mod block;
pub mod store;
pub mod scanner;
pub mod ops;
pub mod container;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BurrowError, Result};
pub use config::{CodecKind, Config};
pub use memory::{MemoryPool, MemoryStats};
pub use record::{Entry, RecordKind};
pub use store::{Manifest, SortedStore};
pub use scanner::Scanner;
pub use ops::{Append, AtomicOperation, Increment, IncrementFloat, NumberFormat};
pub use container::Container;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of burrowkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
