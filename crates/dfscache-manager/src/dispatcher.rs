//! Priority lanes and worker pools
//!
//! Two lanes, each owning an admission queue, a dispatcher thread and a
//! fixed worker pool. HIGH maps to the short pool (estimate-class work),
//! LOW to the long pool (prepare-class work); the physical separation gives
//! a hard isolation guarantee, so bulk downloads cannot starve estimates.
//!
//! Workers never call back into the manager. Every finished task is pushed
//! as a [`TaskCompletion`] onto a one-way channel the manager's finalizer
//! drains.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, trace, warn};

use dfscache_core::types::{FilePhase, Priority, RequestKind};
use dfscache_core::CacheError;

use crate::sync::SyncModule;
use crate::task::{Task, TaskOutcome};

/// Outcome of one task, sent from a worker to the finalizer
pub struct TaskCompletion {
    pub task: Arc<Task>,
    pub outcome: TaskOutcome,
}

/// Fixed pool of worker threads fed by a bounded channel.
///
/// The feed is sized to the worker count, so a dispatcher submitting to a
/// saturated pool blocks until a worker frees up.
pub struct WorkerPool {
    work_tx: Option<Sender<Arc<Task>>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        name: &str,
        workers: usize,
        sync: Arc<SyncModule>,
        done_tx: Sender<TaskCompletion>,
    ) -> Self {
        let workers = workers.max(1);
        let (work_tx, work_rx) = bounded::<Arc<Task>>(workers);

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let work_rx = work_rx.clone();
            let sync = Arc::clone(&sync);
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(task) = work_rx.recv() {
                        let outcome = run_task(&sync, &task);
                        if done_tx.send(TaskCompletion { task, outcome }).is_err() {
                            break;
                        }
                    }
                    trace!("worker exiting");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            work_tx: Some(work_tx),
            handles,
        }
    }

    fn feed(&self) -> Sender<Arc<Task>> {
        self.work_tx.as_ref().expect("pool already joined").clone()
    }

    /// Drop the feed and wait for every worker to exit
    pub fn join(&mut self) {
        self.work_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

/// Execute one task against the sync module and map the result
fn run_task(sync: &SyncModule, task: &Task) -> TaskOutcome {
    // A task canceled while still queued never starts its operation
    if task.is_canceled() {
        match task.kind {
            RequestKind::Prepare => sync.abort_unstarted(task),
            RequestKind::Estimate => task.finish(FilePhase::Canceled, None),
        }
        return TaskOutcome::Canceled;
    }

    let result = match task.kind {
        RequestKind::Estimate => sync.estimate(task),
        RequestKind::Prepare => sync.prepare(task),
    };

    match result {
        Ok(()) => TaskOutcome::Done,
        Err(CacheError::Canceled) => TaskOutcome::Canceled,
        Err(_) => TaskOutcome::Failed,
    }
}

enum LaneCommand {
    Run(Arc<Task>),
    Shutdown,
}

/// One priority lane: admission queue + dispatcher thread + worker pool
pub struct Lane {
    priority: Priority,
    queue_tx: Sender<LaneCommand>,
    dispatcher: Option<JoinHandle<()>>,
    pool: WorkerPool,
}

impl Lane {
    pub fn new(
        priority: Priority,
        label: &str,
        workers: usize,
        sync: Arc<SyncModule>,
        done_tx: Sender<TaskCompletion>,
    ) -> Self {
        let pool = WorkerPool::new(&format!("cache-{}", label), workers, sync, done_tx);
        let feed = pool.feed();

        let (queue_tx, queue_rx) = unbounded::<LaneCommand>();
        let dispatcher = thread::Builder::new()
            .name(format!("cache-dispatch-{}", label))
            .spawn(move || {
                while let Ok(command) = queue_rx.recv() {
                    match command {
                        LaneCommand::Run(task) => {
                            // Blocks while the pool is saturated; tasks stay
                            // FIFO by admission order
                            if feed.send(task).is_err() {
                                break;
                            }
                        }
                        LaneCommand::Shutdown => break,
                    }
                }
                trace!("dispatcher exiting");
            })
            .expect("failed to spawn dispatcher thread");

        debug!("{:?} lane up with {} worker(s)", priority, workers.max(1));
        Self {
            priority,
            queue_tx,
            dispatcher: Some(dispatcher),
            pool,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Enqueue a task in admission order
    pub fn enqueue(&self, task: Arc<Task>) -> Result<(), CacheError> {
        self.queue_tx
            .send(LaneCommand::Run(task))
            .map_err(|_| CacheError::Shutdown)
    }

    /// Stop accepting work, drain the queue, and join dispatcher and pool.
    ///
    /// Commands enqueued before the shutdown sentinel are still dispatched;
    /// a forced shutdown relies on the cancellation flags already being set
    /// so drained tasks short-circuit.
    pub fn shutdown(&mut self) {
        let _ = self.queue_tx.send(LaneCommand::Shutdown);
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                warn!("{:?} dispatcher thread panicked", self.priority);
            }
        }
        self.pool.join();
        debug!("{:?} lane down", self.priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfs::{DfsClientFactory, LocalDfsFactory};
    use crate::registry::Registry;
    use dfscache_core::types::{FileSystemDescriptor, RequestIdentity};
    use dfscache_core::CacheConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn descriptor() -> FileSystemDescriptor {
        FileSystemDescriptor::new("mock", "lane", 1)
    }

    struct Fixture {
        _dir: TempDir,
        remote_root: std::path::PathBuf,
        registry: Arc<Registry>,
        sync: Arc<SyncModule>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let remote_root = dir.path().join("remote");
        std::fs::create_dir_all(&remote_root).unwrap();

        let registry = Arc::new(Registry::new(dir.path().join("cache")).unwrap());
        let factory = LocalDfsFactory::new();
        factory.register(&descriptor(), &remote_root);
        let factory: Arc<dyn DfsClientFactory> = Arc::new(factory);
        registry.ensure_pool(&descriptor(), &factory);

        let sync = Arc::new(SyncModule::new(
            Arc::clone(&registry),
            &CacheConfig::default(),
        ));
        Fixture {
            _dir: dir,
            remote_root,
            registry,
            sync,
        }
    }

    #[test]
    fn test_lane_runs_tasks_and_reports() {
        let fx = fixture();
        std::fs::write(fx.remote_root.join("a.dat"), b"abc").unwrap();

        let (done_tx, done_rx) = unbounded();
        let mut lane = Lane::new(Priority::Low, "long", 2, Arc::clone(&fx.sync), done_tx);

        let id = RequestIdentity::next(1);
        let task = Task::new(id, RequestKind::Prepare, descriptor(), "/a.dat");
        fx.registry.admit(&descriptor(), "/a.dat", id);
        lane.enqueue(Arc::clone(&task)).unwrap();

        let completion = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.outcome, TaskOutcome::Done);
        assert_eq!(completion.task.request, id);

        lane.shutdown();
    }

    #[test]
    fn test_canceled_queued_task_short_circuits() {
        let fx = fixture();
        let (done_tx, done_rx) = unbounded();
        let mut lane = Lane::new(Priority::Low, "long", 1, Arc::clone(&fx.sync), done_tx);

        let id = RequestIdentity::next(1);
        let task = Task::new(id, RequestKind::Prepare, descriptor(), "/never.dat");
        fx.registry.admit(&descriptor(), "/never.dat", id);
        task.cancel();
        lane.enqueue(Arc::clone(&task)).unwrap();

        let completion = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.outcome, TaskOutcome::Canceled);
        assert_eq!(completion.task.snapshot().phase, FilePhase::Canceled);

        lane.shutdown();
    }

    #[test]
    fn test_lane_fifo_within_priority() {
        let fx = fixture();
        for i in 0..6 {
            std::fs::write(fx.remote_root.join(format!("f{}.dat", i)), b"x").unwrap();
        }

        let (done_tx, done_rx) = unbounded();
        // Single worker forces strictly sequential execution
        let mut lane = Lane::new(Priority::Low, "long", 1, Arc::clone(&fx.sync), done_tx);

        let id = RequestIdentity::next(1);
        for i in 0..6 {
            let path = format!("/f{}.dat", i);
            let task = Task::new(id, RequestKind::Prepare, descriptor(), path.clone());
            fx.registry.admit(&descriptor(), &path, id);
            lane.enqueue(task).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            let completion = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            seen.push(completion.task.path.clone());
        }
        let expected: Vec<String> = (0..6).map(|i| format!("/f{}.dat", i)).collect();
        assert_eq!(seen, expected);

        lane.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let fx = fixture();
        std::fs::write(fx.remote_root.join("a.dat"), b"abc").unwrap();
        std::fs::write(fx.remote_root.join("b.dat"), b"def").unwrap();

        let (done_tx, done_rx) = unbounded();
        let mut lane = Lane::new(Priority::Low, "long", 1, Arc::clone(&fx.sync), done_tx);

        let id = RequestIdentity::next(1);
        for path in ["/a.dat", "/b.dat"] {
            let task = Task::new(id, RequestKind::Prepare, descriptor(), path);
            fx.registry.admit(&descriptor(), path, id);
            lane.enqueue(task).unwrap();
        }

        lane.shutdown();

        // Both completions were produced before the pool wound down
        let mut outcomes = Vec::new();
        while let Ok(c) = done_rx.try_recv() {
            outcomes.push(c.outcome);
        }
        assert_eq!(outcomes, vec![TaskOutcome::Done, TaskOutcome::Done]);
    }
}
