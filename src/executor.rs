//! Single-worker serial FIFO executor with drain and cancel lifecycles.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{ConcurrencyError, ConcurrencyResult};
use crate::queue::{BlockingQueue, PushError};

type Job = Box<dyn FnOnce() + Send>;

const EXECUTOR_BACKLOG: u16 = 100;
/// Pop timeout; bounds how long the worker takes to observe a state change.
const STATE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Run,
    Finish,
    Cancel,
}

struct ExecutorInner {
    backlog: BlockingQueue<Job>,
    state: Mutex<ExecState>,
}

/// Single-worker FIFO executor.
///
/// Tasks run strictly in submission order on one dedicated thread. Two
/// shutdown flavors exist: [`shutdown`](Self::shutdown) cancels whatever is
/// still queued, [`drain_and_shutdown`](Self::drain_and_shutdown) runs the
/// backlog to empty first.
pub struct SerialExecutor {
    inner: Arc<ExecutorInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialExecutor {
    /// Create the executor and start its worker thread.
    pub fn new() -> ConcurrencyResult<Self> {
        let inner = Arc::new(ExecutorInner {
            backlog: BlockingQueue::new(EXECUTOR_BACKLOG),
            state: Mutex::new(ExecState::Run),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("serial-exec".to_string())
            .spawn(move || worker_loop(&worker_inner))
            .map_err(|e| ConcurrencyError::Spawn(e.to_string()))?;
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `task` for execution.
    ///
    /// Accepted only while the executor is running; during a drain or after
    /// shutdown the closure is dropped and `ShuttingDown` is returned.
    pub fn append(&self, task: impl FnOnce() + Send + 'static) -> ConcurrencyResult<()> {
        {
            let state = self.inner.state.lock();
            if *state != ExecState::Run {
                return Err(ConcurrencyError::ShuttingDown);
            }
        }
        match self.inner.backlog.push(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(PushError::Interrupted(_)) => Err(ConcurrencyError::ShuttingDown),
            Err(PushError::Timeout(_)) => Err(ConcurrencyError::Timeout),
        }
    }

    /// Drop every task still waiting in the backlog.
    pub fn clear(&self) {
        self.inner.backlog.clear();
    }

    /// Number of tasks waiting in the backlog.
    pub fn pending_count(&self) -> usize {
        self.inner.backlog.len()
    }

    /// True while the executor accepts new tasks.
    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == ExecState::Run
    }

    /// Cancel: drop pending tasks, stop the worker, and join it.
    /// Idempotent and synchronous.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            *state = ExecState::Cancel;
        }
        self.inner.backlog.disable();
        self.join_worker();
        self.inner.backlog.clear();
        debug!("serial executor shut down");
    }

    /// Finish: let the worker drain the backlog to empty, then stop and join
    /// it. Tasks appended after this call are rejected.
    pub fn drain_and_shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ExecState::Run {
                *state = ExecState::Finish;
            }
        }
        self.join_worker();
        self.inner.backlog.disable();
        debug!("serial executor drained and shut down");
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("serial executor worker panicked");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &ExecutorInner) {
    loop {
        match *inner.state.lock() {
            ExecState::Cancel => break,
            ExecState::Finish => {
                if inner.backlog.is_empty() {
                    break;
                }
            }
            ExecState::Run => {}
        }
        let job = match inner.backlog.pop_timeout(STATE_POLL) {
            Ok(job) => job,
            // Timeout or interrupted: loop back and re-check the state.
            Err(_) => continue,
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("serial executor task panicked");
        }
    }
    debug!("serial executor worker exiting");
}
