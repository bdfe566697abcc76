//! Dynamic thread pool with a bounded backlog and operational statistics.
//!
//! Workers grow eagerly up to `max_threads` as tasks are submitted and
//! shrink back toward `min_threads` after sitting idle for the keep-alive
//! period. Shutdown is synchronous and tolerates being driven from inside
//! one of the pool's own tasks.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{ConcurrencyError, ConcurrencyResult};
use crate::queue::{BlockingQueue, PushError};

type Job = Box<dyn FnOnce() + Send>;

/// Hard ceiling on worker threads per pool.
pub const MAX_POOL_THREADS: u16 = 64;
/// Hard ceiling on the backlog capacity.
pub const MAX_POOL_BACKLOG: u32 = 128;
/// How long `execute` waits for backlog space before rejecting.
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(10);
/// Idle time after which a worker beyond `min_threads` exits.
const KEEP_ALIVE: Duration = Duration::from_secs(2);
/// Thread names beyond this many bytes are silently truncated (pthread
/// limit).
const THREAD_NAME_MAX: usize = 15;

/// Pool construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// Informational pool name; worker threads are named `{name}-wN`.
    pub name: String,
    /// Workers kept alive even when idle.
    pub min_threads: u16,
    /// Upper bound on concurrent workers (at most 64).
    pub max_threads: u16,
    /// Backlog capacity (at most 128).
    pub backlog: u32,
}

impl ThreadPoolConfig {
    fn validate(&self) -> ConcurrencyResult<()> {
        if self.name.is_empty() {
            return Err(ConcurrencyError::InvalidArgument(
                "pool name must not be empty".to_string(),
            ));
        }
        if self.max_threads == 0 || self.max_threads > MAX_POOL_THREADS {
            return Err(ConcurrencyError::InvalidArgument(format!(
                "max_threads must be in 1..={MAX_POOL_THREADS}, got {}",
                self.max_threads
            )));
        }
        if self.min_threads > self.max_threads {
            return Err(ConcurrencyError::InvalidArgument(format!(
                "min_threads {} exceeds max_threads {}",
                self.min_threads, self.max_threads
            )));
        }
        if self.backlog == 0 || self.backlog > MAX_POOL_BACKLOG {
            return Err(ConcurrencyError::InvalidArgument(format!(
                "backlog must be in 1..={MAX_POOL_BACKLOG}, got {}",
                self.backlog
            )));
        }
        Ok(())
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Tasks accepted into the backlog since creation (or the last clear).
    pub total_tasks_queued: u64,
    /// Tasks a worker picked up and ran.
    pub total_tasks_ran: u64,
    /// High-water mark of backlog depth.
    pub max_tasks_queued: u64,
    /// High-water mark of tasks running at the same time.
    pub max_concurrent_tasks: u64,
}

struct WorkerSet {
    threads: HashMap<ThreadId, thread::JoinHandle<()>>,
    next_seq: u64,
}

struct PoolInner {
    name: String,
    backlog: BlockingQueue<Job>,
    running: AtomicBool,
    active: AtomicUsize,
    min_threads: usize,
    max_threads: usize,
    workers: Mutex<WorkerSet>,
    stats: Mutex<PoolStats>,
}

/// Dynamic worker pool over a bounded backlog.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Create a pool and pre-start `min_threads` workers.
    pub fn new(config: ThreadPoolConfig) -> ConcurrencyResult<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            name: config.name,
            // Backlog fits in u16 because MAX_POOL_BACKLOG is 128.
            backlog: BlockingQueue::new(config.backlog as u16),
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            min_threads: config.min_threads as usize,
            max_threads: config.max_threads as usize,
            workers: Mutex::new(WorkerSet {
                threads: HashMap::new(),
                next_seq: 0,
            }),
            stats: Mutex::new(PoolStats::default()),
        });
        for _ in 0..inner.min_threads {
            spawn_worker(&inner)?;
        }
        debug!(pool = %inner.name, min = inner.min_threads, max = inner.max_threads, "thread pool created");
        Ok(Self { inner })
    }

    /// Submit a task.
    ///
    /// Waits a short bounded time for backlog space; a pool at its thread
    /// ceiling with a full backlog rejects with `Timeout`. On acceptance one
    /// extra worker is started eagerly (up to `max_threads`) so the task does
    /// not have to wait behind long-running work.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> ConcurrencyResult<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(ConcurrencyError::ShuttingDown);
        }
        match self.inner.backlog.push_timeout(Box::new(task), SUBMIT_TIMEOUT) {
            Ok(()) => {}
            Err(PushError::Timeout(_)) => {
                warn!(pool = %self.inner.name, "backlog full: task rejected");
                return Err(ConcurrencyError::Timeout);
            }
            Err(PushError::Interrupted(_)) => return Err(ConcurrencyError::ShuttingDown),
        }
        {
            let mut stats = self.inner.stats.lock();
            stats.total_tasks_queued += 1;
            let depth = self.inner.backlog.len() as u64;
            if depth > stats.max_tasks_queued {
                stats.max_tasks_queued = depth;
            }
        }
        if let Err(e) = spawn_worker(&self.inner) {
            // The task is queued; existing workers will get to it.
            warn!(pool = %self.inner.name, error = %e, "could not add eager worker");
        }
        Ok(())
    }

    /// Tasks currently being run by workers.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Live worker threads.
    pub fn thread_count(&self) -> usize {
        self.inner.workers.lock().threads.len()
    }

    /// Tasks waiting in the backlog.
    pub fn backlog_count(&self) -> usize {
        self.inner.backlog.len()
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True until [`shutdown`](Self::shutdown) runs.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Statistics snapshot, optionally resetting the counters.
    pub fn stats(&self, clear: bool) -> PoolStats {
        let mut stats = self.inner.stats.lock();
        let snapshot = *stats;
        if clear {
            *stats = PoolStats::default();
        }
        snapshot
    }

    /// Stop the pool: disable the backlog, join every worker, and drop any
    /// task that never started.
    ///
    /// Synchronous and idempotent. May be called from inside one of the
    /// pool's own tasks; the calling worker is skipped when joining and
    /// exits on its own once the task returns.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.inner.name, "thread pool shutting down");
        self.inner.backlog.disable();
        let handles: Vec<_> = {
            let mut workers = self.inner.workers.lock();
            workers.threads.drain().collect()
        };
        let me = thread::current().id();
        for (thread_id, handle) in handles {
            if thread_id == me {
                // A task is destroying its own pool; never join ourselves.
                trace!(pool = %self.inner.name, "skipping self-join during shutdown");
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.inner.name, "pool worker panicked");
            }
        }
        self.inner.backlog.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .field("threads", &self.thread_count())
            .field("backlog", &self.backlog_count())
            .finish()
    }
}

fn spawn_worker(inner: &Arc<PoolInner>) -> ConcurrencyResult<()> {
    if !inner.running.load(Ordering::SeqCst) {
        return Ok(());
    }
    let mut workers = inner.workers.lock();
    if workers.threads.len() >= inner.max_threads {
        return Ok(());
    }
    let seq = workers.next_seq;
    workers.next_seq += 1;
    let name = truncate_thread_name(format!("{}-w{}", inner.name, seq));
    let worker_inner = Arc::clone(inner);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(&worker_inner))
        .map_err(|e| ConcurrencyError::Spawn(e.to_string()))?;
    workers.threads.insert(handle.thread().id(), handle);
    Ok(())
}

fn worker_loop(inner: &PoolInner) {
    trace!(pool = %inner.name, "worker started");
    loop {
        let job = match inner.backlog.pop_timeout(KEEP_ALIVE) {
            Ok(job) => job,
            Err(ConcurrencyError::Timeout) => {
                // Idle past the keep-alive: shrink if beyond the minimum.
                let mut workers = inner.workers.lock();
                if inner.running.load(Ordering::SeqCst)
                    && workers.threads.len() > inner.min_threads
                {
                    workers.threads.remove(&thread::current().id());
                    trace!(pool = %inner.name, "idle worker exiting");
                    return;
                }
                continue;
            }
            // Backlog disabled: the pool is shutting down.
            Err(_) => break,
        };
        if !inner.running.load(Ordering::SeqCst) {
            // Stopped while the job was in flight; drop it unrun.
            drop(job);
            break;
        }
        let concurrent = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = inner.stats.lock();
            stats.total_tasks_ran += 1;
            if concurrent as u64 > stats.max_concurrent_tasks {
                stats.max_concurrent_tasks = concurrent as u64;
            }
        }
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(pool = %inner.name, "pool task panicked");
        }
        inner.active.fetch_sub(1, Ordering::SeqCst);
    }
    // Shutdown may have drained our registration already; self-removal here
    // covers the self-destruct path.
    inner.workers.lock().threads.remove(&thread::current().id());
    trace!(pool = %inner.name, "worker exiting");
}

pub(crate) fn truncate_thread_name(name: String) -> String {
    if name.len() <= THREAD_NAME_MAX {
        return name;
    }
    let mut end = THREAD_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
