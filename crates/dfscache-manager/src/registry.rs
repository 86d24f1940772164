//! Cache metadata registry
//!
//! Process-wide metadata: the connection pool for each remote file system
//! and a shared entry per (remote, path) recording what is cached, being
//! fetched, or stale.
//!
//! At most one request at a time owns an entry in `InProgress`; concurrent
//! requests for the same file subscribe as waiters and are completed from
//! the owner's outcome. Entry locks are short and never held across I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use dfscache_core::path::local_cache_path;
use dfscache_core::types::{FileState, FileSystemDescriptor, RequestIdentity};
use dfscache_core::CacheError;

use crate::dfs::DfsClientFactory;
use crate::pool::ConnectionPool;

/// A request subscribed to an in-flight fetch of the same file
#[derive(Clone, Debug)]
pub struct Waiter {
    pub request: RequestIdentity,
    pub path: String,
}

/// Outcome of admitting one file of a prepare request
#[derive(Debug)]
pub enum Admission {
    /// Already local and size-verified; no work needed
    Satisfied { bytes: u64 },
    /// Another request is fetching this file; completion will be shared
    Subscribed,
    /// The caller now owns the fetch
    Admitted,
}

struct EntryState {
    state: FileState,
    local_bytes: u64,
    /// Size the remote reported, -1 while unknown
    expected_bytes: i64,
    /// Request currently materializing the file, if any
    owner: Option<RequestIdentity>,
    waiters: Vec<Waiter>,
}

/// Shared metadata record for one (remote, path) pair
pub struct FileEntry {
    descriptor: FileSystemDescriptor,
    path: String,
    state: Mutex<EntryState>,
}

impl FileEntry {
    pub fn descriptor(&self) -> &FileSystemDescriptor {
        &self.descriptor
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// (state, local bytes, expected bytes) under a short lock
    pub fn snapshot(&self) -> (FileState, u64, i64) {
        let s = self.state.lock();
        (s.state, s.local_bytes, s.expected_bytes)
    }
}

/// Process-wide cache metadata store
pub struct Registry {
    cache_root: PathBuf,
    pools: DashMap<String, Arc<ConnectionPool>>,
    entries: DashMap<(String, String), Arc<FileEntry>>,
}

impl Registry {
    /// Create a registry rooted at `cache_root`, creating the directory if
    /// needed
    pub fn new(cache_root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_root = cache_root.into();
        std::fs::create_dir_all(&cache_root)?;
        info!("cache registry rooted at {:?}", cache_root);
        Ok(Self {
            cache_root,
            pools: DashMap::new(),
            entries: DashMap::new(),
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Deterministic local path for a remote file
    pub fn local_path(&self, descriptor: &FileSystemDescriptor, path: &str) -> PathBuf {
        local_cache_path(&self.cache_root, descriptor, path)
    }

    /// Get or lazily create the connection pool for a remote
    pub fn ensure_pool(
        &self,
        descriptor: &FileSystemDescriptor,
        factory: &Arc<dyn DfsClientFactory>,
    ) -> Arc<ConnectionPool> {
        self.pools
            .entry(descriptor.key())
            .or_insert_with(|| {
                debug!("creating connection pool for {}", descriptor);
                Arc::new(ConnectionPool::new(descriptor.clone(), Arc::clone(factory)))
            })
            .clone()
    }

    pub fn pool(&self, descriptor: &FileSystemDescriptor) -> Option<Arc<ConnectionPool>> {
        self.pools.get(&descriptor.key()).map(|p| p.clone())
    }

    fn entry(&self, descriptor: &FileSystemDescriptor, path: &str) -> Arc<FileEntry> {
        self.entries
            .entry((descriptor.key(), path.to_string()))
            .or_insert_with(|| {
                Arc::new(FileEntry {
                    descriptor: descriptor.clone(),
                    path: path.to_string(),
                    state: Mutex::new(EntryState {
                        state: FileState::Unknown,
                        local_bytes: 0,
                        expected_bytes: -1,
                        owner: None,
                        waiters: Vec::new(),
                    }),
                })
            })
            .clone()
    }

    /// A `Local` entry only counts if the file is actually at its
    /// deterministic path with the recorded size.
    fn verify_local(&self, entry: &FileEntry, local_bytes: u64) -> bool {
        let path = self.local_path(&entry.descriptor, &entry.path);
        match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == local_bytes,
            Err(_) => false,
        }
    }

    /// Admit one file of a prepare request.
    ///
    /// Local verified entries are satisfied without work; an in-progress
    /// entry gains a waiter; anything else hands ownership to `id`. Stale
    /// entries are re-fetched.
    pub fn admit(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &str,
        id: RequestIdentity,
    ) -> Admission {
        let entry = self.entry(descriptor, path);
        let mut s = entry.state.lock();

        match s.state {
            FileState::Local => {
                if self.verify_local(&entry, s.local_bytes) {
                    return Admission::Satisfied {
                        bytes: s.local_bytes,
                    };
                }
                warn!(
                    "{} {}: local file missing or wrong size, re-fetching",
                    descriptor, path
                );
            }
            FileState::InProgress => {
                s.waiters.push(Waiter {
                    request: id,
                    path: path.to_string(),
                });
                debug!("{} {}: subscribed {} to in-flight fetch", descriptor, path, id);
                return Admission::Subscribed;
            }
            FileState::Stale | FileState::Unknown => {}
        }

        s.state = FileState::InProgress;
        s.owner = Some(id);
        Admission::Admitted
    }

    /// Local verified size for a file, with no state transition.
    /// Used to pre-satisfy estimate requests.
    pub fn local_verified(&self, descriptor: &FileSystemDescriptor, path: &str) -> Option<u64> {
        let entry = self.entry(descriptor, path);
        let s = entry.state.lock();
        if s.state == FileState::Local && self.verify_local(&entry, s.local_bytes) {
            Some(s.local_bytes)
        } else {
            None
        }
    }

    /// Publish a completed fetch: the entry becomes `Local` and any waiters
    /// are drained atomically with the transition.
    pub fn set_local(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &str,
        bytes: u64,
    ) -> Vec<Waiter> {
        let entry = self.entry(descriptor, path);
        let mut s = entry.state.lock();
        s.state = FileState::Local;
        s.local_bytes = bytes;
        s.expected_bytes = bytes as i64;
        s.owner = None;
        std::mem::take(&mut s.waiters)
    }

    /// Revert a failed or canceled fetch: the entry returns to `Unknown`
    /// and any waiters are drained atomically with the transition.
    pub fn set_unknown(&self, descriptor: &FileSystemDescriptor, path: &str) -> Vec<Waiter> {
        let entry = self.entry(descriptor, path);
        let mut s = entry.state.lock();
        s.state = FileState::Unknown;
        s.owner = None;
        std::mem::take(&mut s.waiters)
    }

    /// Record the size the remote reported for a file
    pub fn set_expected(&self, descriptor: &FileSystemDescriptor, path: &str, bytes: u64) {
        let entry = self.entry(descriptor, path);
        entry.state.lock().expected_bytes = bytes as i64;
    }

    /// Demote a local entry whose backing data no longer matches
    pub fn mark_stale(&self, descriptor: &FileSystemDescriptor, path: &str) {
        let entry = self.entry(descriptor, path);
        let mut s = entry.state.lock();
        if s.state == FileState::Local {
            warn!("{} {}: marked stale", descriptor, path);
            s.state = FileState::Stale;
        }
    }

    /// Detach a canceled subscriber from an in-flight entry
    pub fn remove_waiter(
        &self,
        descriptor: &FileSystemDescriptor,
        path: &str,
        id: RequestIdentity,
    ) {
        let entry = self.entry(descriptor, path);
        entry.state.lock().waiters.retain(|w| w.request != id);
    }

    /// Entries currently in `Local` state, for validation sweeps
    pub fn local_entries(&self) -> Vec<Arc<FileEntry>> {
        self.entries
            .iter()
            .filter(|e| e.value().state.lock().state == FileState::Local)
            .map(|e| e.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::LocalDfsFactory;
    use tempfile::TempDir;

    fn descriptor() -> FileSystemDescriptor {
        FileSystemDescriptor::new("mock", "reg", 1)
    }

    fn registry(dir: &TempDir) -> Registry {
        Registry::new(dir.path().join("cache")).unwrap()
    }

    #[test]
    fn test_pool_created_lazily_once() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let factory: Arc<dyn DfsClientFactory> = Arc::new(LocalDfsFactory::new());

        assert!(reg.pool(&descriptor()).is_none());
        let a = reg.ensure_pool(&descriptor(), &factory);
        let b = reg.ensure_pool(&descriptor(), &factory);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(reg.pool(&descriptor()).is_some());
    }

    #[test]
    fn test_admit_unknown_takes_ownership() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = RequestIdentity::next(1);

        assert!(matches!(
            reg.admit(&descriptor(), "/a.dat", id),
            Admission::Admitted
        ));
        let entry = reg.entry(&descriptor(), "/a.dat");
        assert_eq!(entry.snapshot().0, FileState::InProgress);
    }

    #[test]
    fn test_admit_in_progress_subscribes() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let owner = RequestIdentity::next(1);
        let other = RequestIdentity::next(1);

        assert!(matches!(
            reg.admit(&descriptor(), "/a.dat", owner),
            Admission::Admitted
        ));
        assert!(matches!(
            reg.admit(&descriptor(), "/a.dat", other),
            Admission::Subscribed
        ));

        let waiters = reg.set_local(&descriptor(), "/a.dat", 10);
        assert_eq!(waiters.len(), 1);
        assert_eq!(waiters[0].request, other);
        // Drained exactly once
        assert!(reg.set_local(&descriptor(), "/a.dat", 10).is_empty());
    }

    #[test]
    fn test_admit_local_verified_satisfied() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = RequestIdentity::next(1);

        // Materialize the file at its deterministic path, then publish
        let local = reg.local_path(&descriptor(), "/a.dat");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"12345").unwrap();
        reg.set_local(&descriptor(), "/a.dat", 5);

        match reg.admit(&descriptor(), "/a.dat", id) {
            Admission::Satisfied { bytes } => assert_eq!(bytes, 5),
            other => panic!("expected Satisfied, got {:?}", other),
        }
        assert_eq!(reg.local_verified(&descriptor(), "/a.dat"), Some(5));
    }

    #[test]
    fn test_admit_local_unverified_refetches() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = RequestIdentity::next(1);

        // Registry says local but nothing is on disk
        reg.set_local(&descriptor(), "/a.dat", 5);

        assert!(matches!(
            reg.admit(&descriptor(), "/a.dat", id),
            Admission::Admitted
        ));
        assert!(reg.local_verified(&descriptor(), "/a.dat").is_none());
    }

    #[test]
    fn test_stale_refetched() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = RequestIdentity::next(1);

        let local = reg.local_path(&descriptor(), "/a.dat");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"12345").unwrap();
        reg.set_local(&descriptor(), "/a.dat", 5);
        reg.mark_stale(&descriptor(), "/a.dat");

        assert!(matches!(
            reg.admit(&descriptor(), "/a.dat", id),
            Admission::Admitted
        ));
    }

    #[test]
    fn test_remove_waiter() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let owner = RequestIdentity::next(1);
        let other = RequestIdentity::next(1);

        reg.admit(&descriptor(), "/a.dat", owner);
        reg.admit(&descriptor(), "/a.dat", other);
        reg.remove_waiter(&descriptor(), "/a.dat", other);

        assert!(reg.set_unknown(&descriptor(), "/a.dat").is_empty());
    }

    #[test]
    fn test_local_entries_listing() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        reg.set_local(&descriptor(), "/a.dat", 1);
        reg.set_unknown(&descriptor(), "/b.dat");

        let locals = reg.local_entries();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].path(), "/a.dat");
    }
}
