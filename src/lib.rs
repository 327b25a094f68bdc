//! # SegKV
//!
//! An embedded key-value store with:
//! - Fixed-capacity, append-only segment files
//! - An in-memory hashed index for O(1) lookups
//! - Explicit sync checkpoints (segment flush + index snapshot)
//! - Crash recovery by snapshot load and segment replay
//! - Compaction of segments left mostly orphaned by overwrites
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Store                               │
//! │         put / get / delete / sync / open / close            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌───────────────┐
//!   │    Index    │          │Segment Manager│
//!   │ (sharded    │          │ (active +     │
//!   │  RwLocks)   │          │  sealed)      │
//!   └──────┬──────┘          └───────┬───────┘
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌───────────────┐
//!   │  Snapshot   │          │   Segments    │
//!   │ (checkpoint)│          │ (memory /     │
//!   └─────────────┘          │  channel)     │
//!                            └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use segkv::{Config, Store};
//!
//! # fn main() -> segkv::Result<()> {
//! let config = Config::builder()
//!     .home_dir("/tmp/segkv-demo")
//!     .initial_capacity(1_000)
//!     .build();
//! let store = Store::open(config)?;
//!
//! store.put(b"key.1", b"Here is your data for key.1")?;
//! store.sync()?;
//! assert_eq!(store.get(b"key.1")?, Some(b"Here is your data for key.1".to_vec()));
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod record;
pub mod segment;
pub mod index;
pub mod manifest;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{SegKvError, Result};
pub use config::{Config, SyncPolicy};
pub use segment::{ChannelSegmentFactory, MemorySegmentFactory, Segment, SegmentFactory};
pub use store::{CompactionStats, RecoveryResult, Store};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of SegKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
