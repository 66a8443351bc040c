//! Core of the TideFS copy-on-write filesystem.
//!
//! This crate carries the mark-and-reconcile garbage collector and the
//! state it walks: per-device bucket arrays with live/shadow accounting, a
//! forest of versioned btrees over variable-length keys, the journal-key
//! overlay used for recovery repairs, and the allocator-facing bookkeeping
//! (freelists, open buckets, replica sets, erasure-coded stripes).
//!
//! Entry points: [`gc::gc`] for a full sweep and reconcile, [`gc::gc_gens`]
//! for the cheap oldest-gen refresh, [`coalesce::coalesce`] for merging
//! low-occupancy sibling nodes, and [`gc::gc_thread_start`] for the
//! periodic driver.

pub mod error;
pub mod os;
pub mod prelude;

pub mod config;
pub mod stats;
pub mod util;

pub mod bkey;
pub mod btree;
pub mod buckets;
pub mod ec;
pub mod fs;
pub mod fsck;
pub mod journal;
pub mod replicas;

pub mod coalesce;
pub mod gc;
pub mod pos;

pub use self::bkey::{BKey, BkeyVal, Bpos, DataType, Ptr};
pub use self::btree::BtreeId;
pub use self::coalesce::coalesce;
pub use self::config::{FsConfig, GcDebug};
pub use self::error::{Errno, Error, Result};
pub use self::fs::{DevConfig, Fs};
pub use self::gc::{gc, gc_gens, gc_thread_start, gc_thread_stop, mark_dev_superblock};
pub use self::pos::GcPos;
