//! Per-file unit of work
//!
//! A task bundles the operation kind, its target file, a progress record
//! and a one-way cancellation flag. The executing worker is the only writer
//! of the progress record; readers take a short lock for a snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use dfscache_core::types::{
    FilePhase, FileProgress, FileSystemDescriptor, RequestIdentity, RequestKind,
};

use crate::registry::Waiter;

/// Terminal outcome of a task, reported to the finalizer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed,
    Canceled,
}

/// One per-file operation owned by a parent request
pub struct Task {
    /// Parent request (back-reference by identity, not ownership)
    pub request: RequestIdentity,
    pub kind: RequestKind,
    pub descriptor: FileSystemDescriptor,
    pub path: String,

    progress: Mutex<FileProgress>,
    terminal: Condvar,
    cancel: AtomicBool,
    /// Waiters captured at the registry entry transition, carried to the
    /// finalizer together with the outcome
    waiters: Mutex<Vec<Waiter>>,
}

impl Task {
    pub fn new(
        request: RequestIdentity,
        kind: RequestKind,
        descriptor: FileSystemDescriptor,
        path: impl Into<String>,
    ) -> Arc<Self> {
        let path = path.into();
        Arc::new(Self {
            request,
            kind,
            descriptor,
            progress: Mutex::new(FileProgress::queued(path.clone())),
            path,
            terminal: Condvar::new(),
            cancel: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        })
    }

    /// Set the cancellation flag. One-way, idempotent, safe in any state.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Snapshot of the progress record
    pub fn snapshot(&self) -> FileProgress {
        self.progress.lock().clone()
    }

    pub fn mark_estimating(&self) {
        self.progress.lock().phase = FilePhase::Estimating;
    }

    pub fn mark_downloading(&self) {
        self.progress.lock().phase = FilePhase::Downloading;
    }

    pub fn set_total(&self, bytes_total: i64) {
        self.progress.lock().bytes_total = bytes_total;
    }

    pub fn set_estimate(&self, estimate: Duration) {
        self.progress.lock().estimate = Some(estimate);
    }

    /// Add transferred bytes; `bytes_done` only ever grows
    pub fn add_bytes(&self, n: u64) {
        self.progress.lock().bytes_done += n;
    }

    /// Record the terminal phase and wake threads blocked on it
    pub fn finish(&self, phase: FilePhase, error: Option<String>) {
        debug_assert!(phase.is_terminal());
        {
            let mut progress = self.progress.lock();
            progress.phase = phase;
            progress.last_error = error;
        }
        self.terminal.notify_all();
    }

    /// Block until the task reaches a terminal phase
    pub fn wait_terminal(&self) {
        let mut progress = self.progress.lock();
        while !progress.phase.is_terminal() {
            self.terminal.wait(&mut progress);
        }
    }

    /// Stash waiters drained from the registry entry for the finalizer
    pub fn stash_waiters(&self, mut drained: Vec<Waiter>) {
        self.waiters.lock().append(&mut drained);
    }

    /// Take the stashed waiters
    pub fn take_waiters(&self) -> Vec<Waiter> {
        std::mem::take(&mut *self.waiters.lock())
    }
}
