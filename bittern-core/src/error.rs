//! Crate-wide error type.
//!
//! One variant per failure family named in the error handling design
//! (resource exhaustion, transient busy, corruption, device error), plus
//! the ambient edges (bad arguments, I/O failure from the host OS).

use std::fmt;
use thiserror::Error;

use crate::directory::BlockId;

/// Common error type used throughout the cache engine.
#[derive(Debug, Error)]
pub enum Error {
    /// No invalid block, no buffer, or the admission cap was hit.
    /// The caller should defer and retry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The target cache block is held by another work item.
    /// The caller should defer on the wait-busy queue.
    #[error("block {0} is busy")]
    TransientBusy(BlockId),

    /// On-media metadata failed a checksum, two slots raced to the same
    /// xid, or a restored state value was out of range.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A backing-device or cache-device I/O failed. The whole cache must
    /// move to the fail-all state; this variant is never retried.
    #[error("device I/O error on {device}: {source}")]
    DeviceError {
        device: DeviceKind,
        #[source]
        source: std::io::Error,
    },

    /// Bad argument to a public entry point or control message.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cache previously transitioned to fail-all and rejects new work.
    #[error("cache has failed permanently, rejecting request")]
    FailAll,

    /// Miscellaneous host I/O error not tied to a specific device role.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which physical device an I/O error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Backing,
    Cache,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Backing => write!(f, "backing device"),
            DeviceKind::Cache => write!(f, "cache device"),
        }
    }
}

impl Error {
    /// Resource exhaustion and transient-busy errors are expected steady
    /// state under load; the caller should enqueue on a deferred queue
    /// rather than fail the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::TransientBusy(_))
    }

    /// Corruption and device errors abort the containing scope: a restore
    /// failure, a rolled-back slot, or the whole cache moving to fail-all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::DeviceError { .. } | Error::FailAll)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
