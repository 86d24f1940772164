//! Cache manager facade
//!
//! Correlates a client request over N files into N per-file tasks,
//! dispatches them on the matching priority lane, aggregates per-file
//! outcomes and fires the client's completion callback exactly once.
//!
//! Lifecycle is explicit: `init` creates the handle, `configure` wires the
//! registry and spawns the lanes and the finalizer, `shutdown` is
//! idempotent and joins every thread before returning. The handle is meant
//! to be created once per process and threaded through clients.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use dfscache_core::types::{
    FilePhase, FileProgress, FileSystemDescriptor, Priority, RequestIdentity, RequestKind,
    RequestState, RequestStats, RequestSummary, SessionId,
};
use dfscache_core::{CacheConfig, CacheError};

use crate::dfs::DfsClientFactory;
use crate::dispatcher::{Lane, TaskCompletion};
use crate::registry::{Admission, Registry};
use crate::sync::SyncModule;
use crate::task::Task;

/// Completion callback, invoked exactly once per admitted request
pub type CompletionCallback = Box<dyn FnOnce(RequestSummary) + Send + 'static>;

/// Per-file progress list plus aggregate counters, from `check_status`
pub type StatusReport = (Vec<FileProgress>, RequestStats);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Mutable per-request state, guarded by one mutex
struct RequestBook {
    state: RequestState,
    /// Terminal per-file records, keyed by path
    outcomes: HashMap<String, FileProgress>,
    /// Files without a terminal record yet
    pending: usize,
    callback: Option<CompletionCallback>,
}

/// A request between admission and finalization
struct ActiveRequest {
    id: RequestIdentity,
    kind: RequestKind,
    descriptor: FileSystemDescriptor,
    /// Deduplicated paths in client order
    paths: Vec<String>,
    created_at: Instant,
    /// Tasks this request owns; subscribed files have none
    tasks: Mutex<Vec<Arc<Task>>>,
    book: Mutex<RequestBook>,
    /// Signaled when the request reaches a terminal state
    done: Condvar,
}

impl ActiveRequest {
    fn has_task(&self, path: &str) -> bool {
        self.tasks.lock().iter().any(|t| t.path == path)
    }
}

/// Threads and wiring owned between configure and shutdown
struct Runtime {
    high: Lane,
    low: Lane,
    done_tx: Option<Sender<TaskCompletion>>,
    finalizer: Option<JoinHandle<()>>,
    registry: Arc<Registry>,
    sync: Arc<SyncModule>,
    factory: Arc<dyn DfsClientFactory>,
}

/// The cache manager facade
pub struct CacheManager {
    config: CacheConfig,
    lifecycle: Mutex<Lifecycle>,
    shutdown_flag: AtomicBool,
    active: DashMap<RequestIdentity, Arc<ActiveRequest>>,
    history: Mutex<VecDeque<RequestSummary>>,
    runtime: Mutex<Option<Runtime>>,
}

impl CacheManager {
    /// Create the manager handle. Call [`CacheManager::configure`] before
    /// submitting requests.
    pub fn init(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            lifecycle: Mutex::new(Lifecycle::Created),
            shutdown_flag: AtomicBool::new(false),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            runtime: Mutex::new(None),
        })
    }

    /// Wire the registry and client factory, and start the dispatcher
    /// lanes and the finalizer.
    pub fn configure(
        self: &Arc<Self>,
        registry: Arc<Registry>,
        factory: Arc<dyn DfsClientFactory>,
    ) -> Result<(), CacheError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Err(CacheError::AlreadyInitialized),
            Lifecycle::Stopped => return Err(CacheError::Shutdown),
            Lifecycle::Created => {}
        }

        let sync = Arc::new(SyncModule::new(Arc::clone(&registry), &self.config));
        let (done_tx, done_rx) = unbounded::<TaskCompletion>();

        let high = Lane::new(
            Priority::High,
            "short",
            self.config.pools.short_workers,
            Arc::clone(&sync),
            done_tx.clone(),
        );
        let low = Lane::new(
            Priority::Low,
            "long",
            self.config.pools.long_workers,
            Arc::clone(&sync),
            done_tx.clone(),
        );

        let mgr = Arc::clone(self);
        let finalizer = thread::Builder::new()
            .name("cache-finalizer".into())
            .spawn(move || {
                while let Ok(completion) = done_rx.recv() {
                    mgr.finalize_task(completion);
                }
                trace!("finalizer exiting");
            })
            .expect("failed to spawn finalizer thread");

        *self.runtime.lock() = Some(Runtime {
            high,
            low,
            done_tx: Some(done_tx),
            finalizer: Some(finalizer),
            registry,
            sync,
            factory,
        });
        *lifecycle = Lifecycle::Running;

        info!(
            "cache manager configured ({} short / {} long workers)",
            self.config.pools.short_workers, self.config.pools.long_workers
        );
        Ok(())
    }

    /// Estimate the time to make `paths` available locally.
    ///
    /// Always returns the assigned identity. With `async_mode` false the
    /// call blocks until every per-file estimate is terminal and also
    /// returns the aggregate time; zero means everything is already local.
    /// Per-file failures are reported through the callback and
    /// `check_status`, not as an error here.
    pub fn estimate(
        &self,
        session: SessionId,
        descriptor: &FileSystemDescriptor,
        paths: &[&str],
        callback: Option<CompletionCallback>,
        async_mode: bool,
    ) -> Result<(RequestIdentity, Option<Duration>), CacheError> {
        let request = self.submit(session, descriptor, paths, RequestKind::Estimate, callback)?;
        if async_mode {
            return Ok((request.id, None));
        }

        let mut book = request.book.lock();
        while !book.state.is_terminal() {
            request.done.wait(&mut book);
        }
        let total: Duration = book.outcomes.values().filter_map(|p| p.estimate).sum();
        Ok((request.id, Some(total)))
    }

    /// Materialize `paths` locally. The callback fires once with the
    /// aggregate outcome and per-file detail.
    pub fn prepare(
        &self,
        session: SessionId,
        descriptor: &FileSystemDescriptor,
        paths: &[&str],
        callback: CompletionCallback,
    ) -> Result<RequestIdentity, CacheError> {
        let request = self.submit(
            session,
            descriptor,
            paths,
            RequestKind::Prepare,
            Some(callback),
        )?;
        Ok(request.id)
    }

    /// Cancel an admitted request.
    ///
    /// Sets the cancellation flag on every unfinished task; finalization
    /// occurs naturally as each task observes the flag. Subscribed files
    /// are detached from the fetch they were waiting on. `NotFound` if the
    /// identity is unknown or already terminal.
    pub fn cancel(&self, id: RequestIdentity) -> Result<(), CacheError> {
        let Some(request) = self.active.get(&id).map(|r| Arc::clone(r.value())) else {
            return Err(CacheError::NotFound(id.to_string()));
        };

        {
            let book = request.book.lock();
            if book.state.is_terminal() {
                return Err(CacheError::NotFound(id.to_string()));
            }
        }

        info!("cancel requested for {}", id);
        for task in request.tasks.lock().iter() {
            task.cancel();
        }

        // Files riding on another request's fetch: detach and record
        let subscribed: Vec<String> = {
            let book = request.book.lock();
            request
                .paths
                .iter()
                .filter(|p| !book.outcomes.contains_key(*p) && !request.has_task(p))
                .cloned()
                .collect()
        };

        if !subscribed.is_empty() {
            let registry = self.registry()?;
            for path in &subscribed {
                registry.remove_waiter(&request.descriptor, path, id);
            }
            for path in subscribed {
                let mut progress = FileProgress::queued(path.clone());
                progress.phase = FilePhase::Canceled;
                self.record_outcome_on(&request, &path, progress);
            }
        }

        Ok(())
    }

    /// Snapshot of per-file progress plus aggregate counters. Non-blocking.
    pub fn check_status(&self, id: RequestIdentity) -> Result<StatusReport, CacheError> {
        if let Some(request) = self.active.get(&id).map(|r| Arc::clone(r.value())) {
            let book = request.book.lock();
            let tasks = request.tasks.lock();
            let files: Vec<FileProgress> = request
                .paths
                .iter()
                .map(|path| {
                    book.outcomes
                        .get(path)
                        .cloned()
                        .or_else(|| {
                            tasks.iter().find(|t| &t.path == path).map(|t| t.snapshot())
                        })
                        // Subscribed files report as queued until the fetch
                        // they ride on finishes
                        .unwrap_or_else(|| FileProgress::queued(path.clone()))
                })
                .collect();
            let stats = compute_stats(request.created_at, &files);
            return Ok((files, stats));
        }

        let history = self.history.lock();
        if let Some(summary) = history.iter().rev().find(|s| s.identity == id) {
            return Ok((summary.files.clone(), summary.stats.clone()));
        }

        Err(CacheError::NotFound(id.to_string()))
    }

    /// Re-check every `Local` registry entry against disk and remote,
    /// demoting mismatches to `Stale`. Returns true when all entries held.
    pub fn validate_local_cache(&self) -> Result<bool, CacheError> {
        let sync = {
            let runtime = self.runtime.lock();
            match runtime.as_ref() {
                Some(rt) => Arc::clone(&rt.sync),
                None => return Err(self.offline_error()),
            }
        };
        Ok(sync.validate_local_cache())
    }

    /// Shut the manager down.
    ///
    /// With `force`, every in-flight task is flagged for cancellation;
    /// otherwise running work completes and only new admissions are
    /// refused. Joins both lanes and the finalizer before returning. With
    /// `update_clients`, callbacks still pending after the drain fire with
    /// the outcome that was reached. Idempotent.
    pub fn shutdown(&self, force: bool, update_clients: bool) -> Result<(), CacheError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Created => {
                    *lifecycle = Lifecycle::Stopped;
                    return Ok(());
                }
                Lifecycle::Running => *lifecycle = Lifecycle::Stopped,
            }
        }

        info!("shutting down (force={}, update_clients={})", force, update_clients);
        self.shutdown_flag.store(true, Ordering::Release);

        if force {
            for entry in self.active.iter() {
                for task in entry.value().tasks.lock().iter() {
                    task.cancel();
                }
            }
        }

        let runtime = self.runtime.lock().take();
        if let Some(mut runtime) = runtime {
            // Queue drain order: dispatchers first, then the pools they
            // feed, then the finalizer once every outcome producer is gone.
            runtime.high.shutdown();
            runtime.low.shutdown();
            runtime.done_tx.take();
            if let Some(handle) = runtime.finalizer.take() {
                if handle.join().is_err() {
                    warn!("finalizer thread panicked");
                }
            }
        }

        // Whatever is still active never produced outcomes for some files
        // (e.g. canceled before its owner published). Close the books.
        let remaining: Vec<Arc<ActiveRequest>> =
            self.active.iter().map(|r| Arc::clone(r.value())).collect();
        for request in remaining {
            {
                let mut book = request.book.lock();
                if book.state.is_terminal() {
                    continue;
                }
                for path in &request.paths {
                    if !book.outcomes.contains_key(path) {
                        let mut progress = FileProgress::queued(path.clone());
                        progress.phase = FilePhase::Canceled;
                        book.outcomes.insert(path.clone(), progress);
                        book.pending = book.pending.saturating_sub(1);
                    }
                }
            }
            self.complete_request(&request, update_clients);
        }

        info!("shutdown complete");
        Ok(())
    }

    // === Admission ===

    fn submit(
        &self,
        session: SessionId,
        descriptor: &FileSystemDescriptor,
        paths: &[&str],
        kind: RequestKind,
        callback: Option<CompletionCallback>,
    ) -> Result<Arc<ActiveRequest>, CacheError> {
        let (registry, factory) = self.engine()?;

        if paths.is_empty() {
            return Err(CacheError::InvalidArgument("empty path list".into()));
        }
        let mut seen = HashSet::new();
        let mut unique: Vec<String> = Vec::with_capacity(paths.len());
        for path in paths {
            if path.is_empty() {
                return Err(CacheError::InvalidArgument("empty path".into()));
            }
            if seen.insert(*path) {
                unique.push((*path).to_string());
            }
        }

        let descriptor = descriptor.clone().resolve(&self.config);
        registry.ensure_pool(&descriptor, &factory);

        let id = RequestIdentity::next(session);
        let request = Arc::new(ActiveRequest {
            id,
            kind,
            descriptor: descriptor.clone(),
            created_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
            book: Mutex::new(RequestBook {
                state: RequestState::Pending,
                outcomes: HashMap::new(),
                pending: unique.len(),
                callback,
            }),
            done: Condvar::new(),
            paths: unique,
        });

        // Visible before admission so waiter outcomes can find it
        self.active.insert(id, Arc::clone(&request));
        debug!(
            "admitted {} ({:?}, {} file(s), {})",
            id,
            kind,
            request.paths.len(),
            descriptor
        );

        let mut tasks: Vec<Arc<Task>> = Vec::new();
        for path in &request.paths {
            let admission = match kind {
                RequestKind::Prepare => registry.admit(&descriptor, path, id),
                // Estimates read metadata only; they neither own nor join a
                // fetch, but already-local files are answered in place
                RequestKind::Estimate => match registry.local_verified(&descriptor, path) {
                    Some(bytes) => Admission::Satisfied { bytes },
                    None => Admission::Admitted,
                },
            };

            match admission {
                Admission::Satisfied { bytes } => {
                    let mut progress = FileProgress::queued(path.clone());
                    progress.phase = FilePhase::Done;
                    progress.bytes_total = bytes as i64;
                    if kind == RequestKind::Estimate {
                        progress.estimate = Some(Duration::ZERO);
                    }
                    self.record_outcome_on(&request, path, progress);
                }
                Admission::Subscribed => {}
                Admission::Admitted => {
                    tasks.push(Task::new(id, kind, descriptor.clone(), path.clone()));
                }
            }
        }

        *request.tasks.lock() = tasks.clone();

        let complete = {
            let mut book = request.book.lock();
            if book.pending > 0 && !book.state.is_terminal() {
                book.state = RequestState::InProgress;
            }
            book.pending == 0 && !book.state.is_terminal()
        };
        if complete {
            // Everything pre-satisfied at admission
            self.complete_request(&request, true);
            return Ok(request);
        }

        if !tasks.is_empty() {
            let enqueued = {
                let runtime = self.runtime.lock();
                match runtime.as_ref() {
                    None => false,
                    Some(rt) => {
                        let lane = match kind.priority() {
                            Priority::High => &rt.high,
                            Priority::Low => &rt.low,
                        };
                        tasks.into_iter().all(|task| lane.enqueue(task).is_ok())
                    }
                }
            };
            if !enqueued {
                return Err(self.revoke_admission(&request, &registry));
            }
        }

        Ok(request)
    }

    /// Back out a request whose tasks could not be enqueued because
    /// shutdown raced with admission
    fn revoke_admission(&self, request: &Arc<ActiveRequest>, registry: &Arc<Registry>) -> CacheError {
        warn!("{}: shutdown raced admission, revoking", request.id);
        for task in request.tasks.lock().iter() {
            task.cancel();
            if task.kind == RequestKind::Prepare {
                registry.set_unknown(&task.descriptor, &task.path);
            }
        }
        self.active.remove(&request.id);
        CacheError::Shutdown
    }

    // === Finalization ===

    /// Consume one task outcome from a worker. Runs on the finalizer
    /// thread only.
    fn finalize_task(&self, completion: TaskCompletion) {
        let task = completion.task;
        let progress = task.snapshot();
        let waiters = task.take_waiters();

        self.record_outcome(task.request, &task.path, progress.clone());

        // Requests that subscribed to this fetch share its outcome
        for waiter in waiters {
            self.record_outcome(waiter.request, &waiter.path, progress.clone());
        }
    }

    fn record_outcome(&self, id: RequestIdentity, path: &str, progress: FileProgress) {
        let Some(request) = self.active.get(&id).map(|r| Arc::clone(r.value())) else {
            // Finalizing against a missing request is an internal
            // inconsistency; proceed best-effort
            warn!("internal: outcome for unknown request {} ({})", id, path);
            return;
        };
        self.record_outcome_on(&request, path, progress);
    }

    fn record_outcome_on(&self, request: &Arc<ActiveRequest>, path: &str, progress: FileProgress) {
        let complete = {
            let mut book = request.book.lock();
            if book.state.is_terminal() || book.outcomes.contains_key(path) {
                false
            } else {
                book.outcomes.insert(path.to_string(), progress);
                book.pending = book.pending.saturating_sub(1);
                book.pending == 0
            }
        };
        if complete {
            self.complete_request(request, true);
        }
    }

    /// Derive the aggregate state, fire the callback exactly once, move the
    /// request to history and wake synchronous waiters.
    fn complete_request(&self, request: &Arc<ActiveRequest>, fire_callback: bool) {
        let finished = {
            let mut book = request.book.lock();
            if book.state.is_terminal() {
                None
            } else {
                let mut any_failed = false;
                let mut any_canceled = false;
                for outcome in book.outcomes.values() {
                    match outcome.phase {
                        FilePhase::Failed => any_failed = true,
                        FilePhase::Canceled => any_canceled = true,
                        _ => {}
                    }
                }
                // Mixed failed+canceled reports as failed
                book.state = if any_failed {
                    RequestState::Failed
                } else if any_canceled {
                    RequestState::Canceled
                } else {
                    RequestState::Completed
                };

                let files: Vec<FileProgress> = request
                    .paths
                    .iter()
                    .filter_map(|p| book.outcomes.get(p).cloned())
                    .collect();
                let stats = compute_stats(request.created_at, &files);
                let summary = RequestSummary {
                    identity: request.id,
                    kind: request.kind,
                    state: book.state,
                    files,
                    stats,
                };
                Some((book.callback.take(), summary))
            }
        };

        let Some((callback, summary)) = finished else {
            return;
        };
        request.done.notify_all();

        info!(
            "request {} finished {:?} ({}/{} done, {} bytes)",
            summary.identity,
            summary.state,
            summary.stats.files_done,
            summary.stats.files_total,
            summary.stats.bytes_done
        );

        {
            let mut history = self.history.lock();
            if history.len() >= self.config.pools.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(summary.clone());
        }
        self.active.remove(&request.id);

        if fire_callback {
            if let Some(callback) = callback {
                callback(summary);
            }
        }
    }

    // === Lifecycle plumbing ===

    fn engine(&self) -> Result<(Arc<Registry>, Arc<dyn DfsClientFactory>), CacheError> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return Err(CacheError::Shutdown);
        }
        {
            let lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Created => return Err(CacheError::NotInitialized),
                Lifecycle::Stopped => return Err(CacheError::Shutdown),
                Lifecycle::Running => {}
            }
        }
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(rt) => Ok((Arc::clone(&rt.registry), Arc::clone(&rt.factory))),
            None => Err(CacheError::Shutdown),
        }
    }

    fn registry(&self) -> Result<Arc<Registry>, CacheError> {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(rt) => Ok(Arc::clone(&rt.registry)),
            None => Err(self.offline_error()),
        }
    }

    fn offline_error(&self) -> CacheError {
        match *self.lifecycle.lock() {
            Lifecycle::Created => CacheError::NotInitialized,
            _ => CacheError::Shutdown,
        }
    }
}

fn compute_stats(created_at: Instant, files: &[FileProgress]) -> RequestStats {
    let elapsed = created_at.elapsed();
    let bytes_done: u64 = files.iter().map(|f| f.bytes_done).sum();
    let files_done = files.iter().filter(|f| f.phase == FilePhase::Done).count();
    let files_failed = files.iter().filter(|f| f.phase == FilePhase::Failed).count();
    let files_in_progress = files.iter().filter(|f| !f.phase.is_terminal()).count();
    let secs = elapsed.as_secs_f64();
    RequestStats {
        files_total: files.len(),
        files_done,
        files_failed,
        files_in_progress,
        elapsed,
        bytes_done,
        throughput_bps: if secs > 0.0 { bytes_done as f64 / secs } else { 0.0 },
    }
}
