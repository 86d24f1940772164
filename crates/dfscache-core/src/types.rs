//! Request and file state types shared across the cache layer

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

/// Opaque client session identifier
pub type SessionId = u64;

/// Process-wide request sequence counter
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identity assigned to a client request at admission.
///
/// Unique for the process lifetime; used to poll progress and to cancel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Client session the request belongs to
    pub session: SessionId,
    /// Process-wide admission sequence number
    pub seq: u64,
}

impl RequestIdentity {
    /// Assign a fresh identity for the given session
    pub fn next(session: SessionId) -> Self {
        Self {
            session,
            seq: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.seq)
    }
}

/// Immutable connection configuration for a remote file system.
///
/// Serves as the key identifying a connection pool and, together with a
/// remote path, a cached file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSystemDescriptor {
    /// URI scheme, e.g. "hdfs". The literal "default" resolves against
    /// the configured default remote.
    pub scheme: String,
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Reference into external credential storage (never the material itself)
    pub credentials_ref: Option<String>,
}

impl FileSystemDescriptor {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            credentials_ref: None,
        }
    }

    /// Canonical string identifying this remote, used as a registry key
    pub fn key(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Resolve a "default" descriptor against the configured default remote.
    ///
    /// A descriptor with any other scheme is returned unchanged.
    pub fn resolve(mut self, config: &CacheConfig) -> Self {
        if self.scheme == "default" {
            self.scheme = config.remote.default_scheme.clone();
            if self.host.is_empty() {
                self.host = config.remote.default_host.clone();
            }
            if self.port == 0 {
                self.port = config.remote.default_port;
            }
        }
        self
    }
}

impl fmt::Display for FileSystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// What a client request asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Estimate the time to materialize the files locally
    Estimate,
    /// Materialize the files locally
    Prepare,
}

/// Priority lane a request is dispatched on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    /// Short estimation work, served by the short pool
    High,
    /// Bulk download work, served by the long pool
    Low,
}

impl RequestKind {
    /// Estimate-class work rides the high lane, prepare-class the low lane
    pub fn priority(self) -> Priority {
        match self {
            RequestKind::Estimate => Priority::High,
            RequestKind::Prepare => Priority::Low,
        }
    }
}

/// Lifecycle state of a client request.
///
/// Transitions are monotone along Pending → InProgress → terminal;
/// Canceled is reachable from Pending and InProgress only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Canceled
        )
    }
}

/// Phase of a single per-file operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilePhase {
    Queued,
    Estimating,
    Downloading,
    Done,
    Failed,
    Canceled,
}

impl FilePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, FilePhase::Done | FilePhase::Failed | FilePhase::Canceled)
    }
}

/// Registry state of a cached file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    /// Nothing known; not cached
    Unknown,
    /// A task is currently materializing this file
    InProgress,
    /// Present locally and size-verified
    Local,
    /// Present locally but no longer matching the remote
    Stale,
}

/// Mutable progress record for one per-file operation.
///
/// Written by the sync module that owns the task; read by the facade under
/// the task's lock. `bytes_done` never decreases.
#[derive(Clone, Debug)]
pub struct FileProgress {
    /// Remote path this record tracks
    pub path: String,
    /// Bytes transferred so far
    pub bytes_done: u64,
    /// Total bytes, -1 while unknown
    pub bytes_total: i64,
    /// Current phase
    pub phase: FilePhase,
    /// Error description for a Failed phase
    pub last_error: Option<String>,
    /// Estimated transfer time, filled in by estimate operations
    pub estimate: Option<Duration>,
}

impl FileProgress {
    pub fn queued(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bytes_done: 0,
            bytes_total: -1,
            phase: FilePhase::Queued,
            last_error: None,
            estimate: None,
        }
    }
}

/// Aggregate counters for one request, reported by `check_status`
#[derive(Clone, Debug, Default)]
pub struct RequestStats {
    pub files_total: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub files_in_progress: usize,
    /// Time since admission
    pub elapsed: Duration,
    /// Bytes transferred across all files
    pub bytes_done: u64,
    /// Average throughput in bytes per second
    pub throughput_bps: f64,
}

/// Final report delivered to a request's completion callback, exactly once
#[derive(Clone, Debug)]
pub struct RequestSummary {
    pub identity: RequestIdentity,
    pub kind: RequestKind,
    pub state: RequestState,
    /// Per-file outcome detail
    pub files: Vec<FileProgress>,
    pub stats: RequestStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_unique_and_ordered() {
        let a = RequestIdentity::next(7);
        let b = RequestIdentity::next(7);
        assert_ne!(a, b);
        assert!(b.seq > a.seq);
        assert_eq!(a.session, 7);
    }

    #[test]
    fn test_descriptor_key() {
        let d = FileSystemDescriptor::new("hdfs", "nn1.example.com", 8020);
        assert_eq!(d.key(), "hdfs://nn1.example.com:8020");
        assert_eq!(d.to_string(), d.key());
    }

    #[test]
    fn test_descriptor_resolve_default() {
        let config = CacheConfig::default();
        let d = FileSystemDescriptor::new("default", "", 0).resolve(&config);
        assert_eq!(d.scheme, config.remote.default_scheme);
        assert_eq!(d.host, config.remote.default_host);
        assert_eq!(d.port, config.remote.default_port);

        let explicit = FileSystemDescriptor::new("hdfs", "nn", 9000).resolve(&config);
        assert_eq!(explicit.key(), "hdfs://nn:9000");
    }

    #[test]
    fn test_kind_to_priority() {
        assert_eq!(RequestKind::Estimate.priority(), Priority::High);
        assert_eq!(RequestKind::Prepare.priority(), Priority::Low);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Canceled.is_terminal());
        assert!(!RequestState::InProgress.is_terminal());
        assert!(FilePhase::Failed.is_terminal());
        assert!(!FilePhase::Downloading.is_terminal());
    }
}
