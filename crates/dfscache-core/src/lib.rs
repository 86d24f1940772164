//! Core vocabulary for the DFS cache layer
//!
//! This crate provides:
//! - File system descriptors and request/file state types
//! - The error taxonomy shared across the cache layer
//! - TOML configuration with sensible defaults
//! - Deterministic local cache path derivation

pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use config::CacheConfig;
pub use error::{CacheError, DfsError};
pub use types::{
    FilePhase, FileProgress, FileState, FileSystemDescriptor, Priority, RequestIdentity,
    RequestKind, RequestState, RequestStats, RequestSummary, SessionId,
};

/// Default number of workers in the short (estimate) pool
pub const DEFAULT_SHORT_WORKERS: usize = 4;

/// Default number of workers in the long (download) pool
pub const DEFAULT_LONG_WORKERS: usize = 4;

/// Default transfer chunk size: 4MB
pub const DEFAULT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Default bandwidth assumption for estimates: 100 MB/s
pub const DEFAULT_BANDWIDTH_BPS: u64 = 100_000_000;

/// Default capacity of the finished-requests history ring
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;
