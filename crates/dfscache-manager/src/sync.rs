//! Sync module
//!
//! Executes exactly one per-file operation per call against a remote file
//! system, updating the task's progress record as it goes. Registry locks
//! are taken briefly before and after I/O, never across it.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use dfscache_core::path::staging_path;
use dfscache_core::types::FilePhase;
use dfscache_core::{CacheConfig, CacheError, DfsError};

use crate::registry::Registry;
use crate::task::Task;

/// Mediator for per-file remote operations
pub struct SyncModule {
    registry: Arc<Registry>,
    chunk_bytes: usize,
    bandwidth_bps: u64,
}

impl SyncModule {
    pub fn new(registry: Arc<Registry>, config: &CacheConfig) -> Self {
        Self {
            registry,
            chunk_bytes: config.transfer.chunk_bytes.max(1),
            bandwidth_bps: config.transfer.bandwidth_bps.max(1),
        }
    }

    /// Estimate the time to materialize one remote file locally.
    ///
    /// Stats the remote file and derives a size-based estimate from the
    /// configured bandwidth assumption. Too short to be worth interrupting;
    /// cancellation is not observed here.
    pub fn estimate(&self, task: &Task) -> Result<(), CacheError> {
        task.mark_estimating();

        let pool = self
            .registry
            .pool(&task.descriptor)
            .ok_or_else(|| self.fail(task, internal_no_pool(task)))?;

        let mut conn = pool.acquire().map_err(|e| self.fail(task, e))?;

        let stat = match conn.client().stat(&task.path) {
            Ok(stat) => stat,
            Err(DfsError::NotFound(p)) => {
                return Err(self.fail(task, CacheError::NotFound(p)));
            }
            Err(e) => {
                conn.mark_error();
                return Err(self.fail(task, CacheError::Remote(e.to_string())));
            }
        };

        task.set_total(stat.size as i64);
        task.set_estimate(Duration::from_secs_f64(
            stat.size as f64 / self.bandwidth_bps as f64,
        ));
        self.registry
            .set_expected(&task.descriptor, &task.path, stat.size);

        task.finish(FilePhase::Done, None);
        debug!("{} {}: estimated {} bytes", task.descriptor, task.path, stat.size);
        Ok(())
    }

    /// Materialize one remote file locally.
    ///
    /// Streams to a staging path, renames atomically into place on success,
    /// and publishes the registry transition. The cancellation flag is
    /// observed between chunks; a canceled download removes its staging
    /// file and reverts the registry entry.
    pub fn prepare(&self, task: &Task) -> Result<(), CacheError> {
        if task.is_canceled() {
            return Err(self.abort_prepare(task, FilePhase::Canceled, None, CacheError::Canceled));
        }

        let final_path = self.registry.local_path(&task.descriptor, &task.path);
        let staging = staging_path(&final_path);

        if let Some(parent) = final_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                let err = CacheError::LocalIo(e.to_string());
                return Err(self.abort_prepare(task, FilePhase::Failed, None, err));
            }
        }

        let pool = self
            .registry
            .pool(&task.descriptor)
            .ok_or_else(|| self.abort_prepare(task, FilePhase::Failed, None, internal_no_pool(task)))?;

        let mut conn = match pool.acquire() {
            Ok(conn) => conn,
            Err(e) => return Err(self.abort_prepare(task, FilePhase::Failed, None, e)),
        };

        let stat = match conn.client().stat(&task.path) {
            Ok(stat) => stat,
            Err(DfsError::NotFound(p)) => {
                let err = CacheError::NotFound(p);
                return Err(self.abort_prepare(task, FilePhase::Failed, None, err));
            }
            Err(e) => {
                conn.mark_error();
                let err = CacheError::Remote(e.to_string());
                return Err(self.abort_prepare(task, FilePhase::Failed, None, err));
            }
        };

        task.set_total(stat.size as i64);
        self.registry
            .set_expected(&task.descriptor, &task.path, stat.size);
        task.mark_downloading();

        let mut remote = match conn.client().open(&task.path) {
            Ok(remote) => remote,
            Err(e) => {
                conn.mark_error();
                let err = CacheError::Remote(e.to_string());
                return Err(self.abort_prepare(task, FilePhase::Failed, None, err));
            }
        };

        let mut out = match File::create(&staging) {
            Ok(out) => out,
            Err(e) => {
                let err = CacheError::LocalIo(e.to_string());
                return Err(self.abort_prepare(task, FilePhase::Failed, None, err));
            }
        };

        let mut buf = vec![0u8; self.chunk_bytes];
        let mut written: u64 = 0;

        loop {
            if task.is_canceled() {
                drop(out);
                return Err(self.abort_prepare(
                    task,
                    FilePhase::Canceled,
                    Some(&staging),
                    CacheError::Canceled,
                ));
            }

            let n = match remote.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    conn.mark_error();
                    drop(out);
                    let err = CacheError::Remote(e.to_string());
                    return Err(self.abort_prepare(task, FilePhase::Failed, Some(&staging), err));
                }
            };
            if n == 0 {
                break;
            }

            if let Err(e) = out.write_all(&buf[..n]) {
                drop(out);
                let err = CacheError::LocalIo(e.to_string());
                return Err(self.abort_prepare(task, FilePhase::Failed, Some(&staging), err));
            }

            written += n as u64;
            task.add_bytes(n as u64);
        }

        if let Err(e) = out.sync_all() {
            drop(out);
            let err = CacheError::LocalIo(e.to_string());
            return Err(self.abort_prepare(task, FilePhase::Failed, Some(&staging), err));
        }
        drop(out);

        if let Err(e) = std::fs::rename(&staging, &final_path) {
            let err = CacheError::LocalIo(e.to_string());
            return Err(self.abort_prepare(task, FilePhase::Failed, Some(&staging), err));
        }

        let waiters = self.registry.set_local(&task.descriptor, &task.path, written);
        task.stash_waiters(waiters);
        task.finish(FilePhase::Done, None);

        info!(
            "{} {}: cached {} bytes at {:?}",
            task.descriptor, task.path, written, final_path
        );
        Ok(())
    }

    /// Cancel a per-file operation.
    ///
    /// Sets the task's one-way cancellation flag; with `async_mode` false,
    /// blocks until the task is observed terminal.
    pub fn cancel(&self, task: &Task, async_mode: bool) {
        task.cancel();
        if !async_mode {
            task.wait_terminal();
        }
    }

    /// Finish a prepare task that will not run, reverting its registry entry
    pub fn abort_unstarted(&self, task: &Task) {
        let waiters = self.registry.set_unknown(&task.descriptor, &task.path);
        task.stash_waiters(waiters);
        task.finish(FilePhase::Canceled, None);
    }

    fn abort_prepare(
        &self,
        task: &Task,
        phase: FilePhase,
        staging: Option<&std::path::Path>,
        err: CacheError,
    ) -> CacheError {
        if let Some(staging) = staging {
            if let Err(e) = std::fs::remove_file(staging) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove staging file {:?}: {}", staging, e);
                }
            }
        }

        let waiters = self.registry.set_unknown(&task.descriptor, &task.path);
        task.stash_waiters(waiters);

        let message = match phase {
            FilePhase::Canceled => None,
            _ => Some(err.to_string()),
        };
        task.finish(phase, message);

        if phase == FilePhase::Failed {
            warn!("{} {}: prepare failed: {}", task.descriptor, task.path, err);
        }
        err
    }

    fn fail(&self, task: &Task, err: CacheError) -> CacheError {
        task.finish(FilePhase::Failed, Some(err.to_string()));
        err
    }

    /// Validate the local cache against the remotes.
    ///
    /// Re-stats every `Local` entry on disk and remotely and demotes
    /// mismatches to `Stale`. Returns true when everything checked out.
    /// Entries whose remote cannot be reached are left untouched.
    pub fn validate_local_cache(&self) -> bool {
        let mut all_valid = true;

        for entry in self.registry.local_entries() {
            let (_, local_bytes, _) = entry.snapshot();
            let local_path = self.registry.local_path(entry.descriptor(), entry.path());

            let local_ok = std::fs::metadata(&local_path)
                .map(|m| m.len() == local_bytes)
                .unwrap_or(false);

            if !local_ok {
                self.registry.mark_stale(entry.descriptor(), entry.path());
                all_valid = false;
                continue;
            }

            let Some(pool) = self.registry.pool(entry.descriptor()) else {
                continue;
            };

            let remote_ok = match pool.acquire() {
                Ok(mut conn) => match conn.client().stat(entry.path()) {
                    Ok(stat) => stat.size == local_bytes,
                    Err(DfsError::NotFound(_)) => false,
                    Err(e) => {
                        conn.mark_error();
                        warn!(
                            "{} {}: validation skipped, remote unreachable: {}",
                            entry.descriptor(),
                            entry.path(),
                            e
                        );
                        continue;
                    }
                },
                Err(e) => {
                    warn!(
                        "{} {}: validation skipped, connect failed: {}",
                        entry.descriptor(),
                        entry.path(),
                        e
                    );
                    continue;
                }
            };

            if !remote_ok {
                self.registry.mark_stale(entry.descriptor(), entry.path());
                all_valid = false;
            }
        }

        all_valid
    }
}

fn internal_no_pool(task: &Task) -> CacheError {
    CacheError::Internal(format!("no connection pool for {}", task.descriptor))
}
