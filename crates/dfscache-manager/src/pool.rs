//! Per-remote connection pool
//!
//! Maintains a set of DFS client handles for one remote file system, hands
//! one out on demand, recycles it on release, and evicts failed handles.
//!
//! # Design
//! - Elastic: acquisition never waits on a free handle; if none is idle a
//!   new one is opened. DFS clients are heavy to construct but cheap to
//!   hold, so elasticity avoids head-of-line blocking while keeping
//!   steady-state reuse.
//! - All handle-state transitions happen under one per-pool mutex.
//! - A borrowed handle is released by a scope guard on every exit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use dfscache_core::types::FileSystemDescriptor;
use dfscache_core::CacheError;

use crate::dfs::{DfsClient, DfsClientFactory};

/// Lifecycle of one pooled handle.
///
/// `Uninitialized → FreeInitialized ↔ BusyOk`, with the error states
/// reachable from the corresponding non-error state on any I/O failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    FreeInitialized,
    BusyOk,
    FreeError,
    BusyError,
}

struct PooledConnection {
    id: u64,
    state: ConnectionState,
    client: Box<dyn DfsClient>,
}

/// Counters for pool monitoring
#[derive(Debug, Default)]
struct PoolCounters {
    acquires: AtomicU64,
    reuses: AtomicU64,
    opened: AtomicU64,
    evicted: AtomicU64,
}

/// Snapshot of pool statistics
#[derive(Clone, Debug)]
pub struct PoolStats {
    pub acquires: u64,
    pub reuses: u64,
    pub opened: u64,
    pub evicted: u64,
    pub idle: usize,
}

/// Connection pool for one remote file system
pub struct ConnectionPool {
    descriptor: FileSystemDescriptor,
    factory: Arc<dyn DfsClientFactory>,
    /// Handles not currently borrowed; busy handles live inside their guard
    idle: Mutex<Vec<PooledConnection>>,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(descriptor: FileSystemDescriptor, factory: Arc<dyn DfsClientFactory>) -> Self {
        Self {
            descriptor,
            factory,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        }
    }

    pub fn descriptor(&self) -> &FileSystemDescriptor {
        &self.descriptor
    }

    /// Borrow a connection in `BusyOk` state.
    ///
    /// Sweeps out handles that failed since their last use, reuses the first
    /// idle initialized handle, and opens a new one when none is available.
    /// Fails with `CacheError::Connect` if opening a new handle fails.
    pub fn acquire(self: &Arc<Self>) -> Result<ScopedConnection, CacheError> {
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);

        {
            let mut idle = self.idle.lock();

            let before = idle.len();
            idle.retain(|c| c.state == ConnectionState::FreeInitialized);
            let swept = before - idle.len();
            if swept > 0 {
                self.counters.evicted.fetch_add(swept as u64, Ordering::Relaxed);
                debug!("{}: evicted {} failed connection(s)", self.descriptor, swept);
            }

            if let Some(mut conn) = idle.pop() {
                conn.state = ConnectionState::BusyOk;
                self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                trace!("{}: reusing connection {}", self.descriptor, conn.id);
                return Ok(ScopedConnection {
                    conn: Some(conn),
                    pool: Arc::clone(self),
                    failed: false,
                });
            }
        }

        // Nothing idle: open a new handle. The connect itself runs outside
        // the pool lock; only state transitions are serialized.
        let client = self.factory.connect(&self.descriptor).map_err(|e| {
            warn!("{}: connect failed: {}", self.descriptor, e);
            CacheError::Connect(e.to_string())
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!("{}: opened connection {}", self.descriptor, id);

        Ok(ScopedConnection {
            conn: Some(PooledConnection {
                id,
                state: ConnectionState::BusyOk,
                client,
            }),
            pool: Arc::clone(self),
            failed: false,
        })
    }

    fn release(&self, mut conn: PooledConnection, failed: bool) {
        conn.state = if failed {
            ConnectionState::FreeError
        } else {
            ConnectionState::FreeInitialized
        };
        trace!(
            "{}: released connection {} ({:?})",
            self.descriptor,
            conn.id,
            conn.state
        );
        self.idle.lock().push(conn);
    }

    /// Number of handles currently idle (including failed ones awaiting
    /// the next sweep)
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            opened: self.counters.opened.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            idle: self.idle_count(),
        }
    }
}

/// Exclusively borrowed connection - returns to the pool on drop.
///
/// If [`ScopedConnection::mark_error`] was called during use, the handle is
/// released in `FreeError` state and evicted at the next acquisition sweep;
/// otherwise it returns to `FreeInitialized` for reuse.
pub struct ScopedConnection {
    conn: Option<PooledConnection>,
    pool: Arc<ConnectionPool>,
    failed: bool,
}

impl ScopedConnection {
    /// Access the underlying client
    pub fn client(&mut self) -> &mut dyn DfsClient {
        // Present until drop; the Option only exists for take() in Drop.
        self.conn
            .as_mut()
            .map(|c| c.client.as_mut())
            .expect("connection taken before drop")
    }

    /// Handle id, for logging
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or(0)
    }

    /// Record that an I/O error occurred on this handle.
    ///
    /// One-way: the handle will not be reused after release.
    pub fn mark_error(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.state = ConnectionState::BusyError;
        }
        self.failed = true;
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.failed);
        }
    }
}
