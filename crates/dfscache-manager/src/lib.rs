//! DFS cache manager - request-lifecycle engine
//!
//! This crate materializes remote files onto local storage ahead of compute,
//! estimates materialization time, and keeps the authoritative registry of
//! what is cached, being fetched, or scheduled.
//!
//! # Architecture
//!
//! ```text
//! client ──► CacheManager (facade)
//!               │  splits a request into per-file tasks
//!               ▼
//!          Priority lanes (HIGH ► short pool, LOW ► long pool)
//!               │  dispatcher thread per lane, fixed worker pool
//!               ▼
//!          SyncModule (one operation per call)
//!               │  borrows a connection from the per-remote pool
//!               ▼
//!          remote DFS (behind the DfsClient seam)
//! ```
//!
//! Workers never call back into the manager; they push task outcomes onto a
//! one-way channel drained by a finalizer thread, which aggregates per-file
//! outcomes, fires each request's completion callback exactly once, and
//! publishes registry transitions.

pub mod dfs;
pub mod dispatcher;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod sync;
pub mod task;

pub use dfs::{DfsClient, DfsClientFactory, DfsFile, LocalDfs, LocalDfsFactory, RemoteStat};
pub use manager::{CacheManager, CompletionCallback, StatusReport};
pub use pool::{ConnectionPool, ScopedConnection};
pub use registry::Registry;
pub use sync::SyncModule;
pub use task::{Task, TaskOutcome};
