//! Bittern: a block-level writeback/writethrough cache engine sitting
//! between a consumer of block I/O and a slow backing device, using a
//! persistent-memory-class device as the cache medium.
//!
//! This crate is the engine only: directory, state machine, background
//! workers, on-media layout and restore, and the backing-device flush/FUA
//! barrier layer. Device-mapper registration, a sysfs-style observability
//! surface, and trace plumbing are external collaborators (see
//! `bittern-cli` for the minimal glue a runnable binary needs).

pub mod bgwriter;
pub mod bufpool;
pub mod cache;
pub mod config;
pub mod deferred;
pub mod devio;
pub mod directory;
pub mod error;
pub mod hash;
pub mod invalidator;
pub mod layout;
pub mod pmem;
pub mod sequential;
pub mod statemachine;
pub mod verifier;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use cache::Cache;
pub use config::{CacheMode, ReplacementPolicy, Tunables};
pub use error::{Error, Result};
