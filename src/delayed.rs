//! One-shot deferred task execution behind opaque handles.
//!
//! Every scheduled task owns a worker thread that waits out the delay on a
//! per-record condition variable, recomputing the remaining time on every
//! wake-up so reschedules and spurious wakes are handled uniformly. Records
//! live in a handle-keyed registry; callers hold only the handle, so a task
//! that already finished can never be touched after the fact.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Local, TimeDelta};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::{ConcurrencyError, ConcurrencyResult};
use crate::handle::{Registry, TaskHandle};
use crate::pool::truncate_thread_name;

/// Type-erased payload handed back by [`DelayedScheduler::cancel`].
pub type Payload = Box<dyn Any + Send>;

type Callback = Box<dyn FnOnce(Payload) + Send>;

/// Occurrences closer than this many seconds roll over to the next day.
const TIME_OF_DAY_FUDGE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayedState {
    Idle,
    Waiting,
    Running,
    Canceled,
}

struct DelayedBody {
    state: DelayedState,
    delay: Duration,
    started_at: Instant,
    payload: Option<Payload>,
    callback: Option<Callback>,
    worker: Option<thread::JoinHandle<()>>,
}

struct DelayedRecord {
    handle: TaskHandle,
    body: Mutex<DelayedBody>,
    cond: Condvar,
}

/// Scheduler for one-shot deferred callbacks.
///
/// Prefer owning an instance per runtime so tests get isolation; callers that
/// want the process-wide form use [`DelayedScheduler::global`].
pub struct DelayedScheduler {
    registry: Arc<Registry<DelayedRecord>>,
}

impl DelayedScheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Process-wide scheduler instance.
    pub fn global() -> &'static DelayedScheduler {
        static GLOBAL: OnceLock<DelayedScheduler> = OnceLock::new();
        GLOBAL.get_or_init(DelayedScheduler::new)
    }

    /// Run `callback(payload)` once, `delay` from now.
    ///
    /// Returns a handle usable with [`cancel`](Self::cancel),
    /// [`reschedule`](Self::reschedule), and
    /// [`force_execute`](Self::force_execute).
    pub fn schedule<A, F>(
        &self,
        delay: Duration,
        payload: A,
        callback: F,
    ) -> ConcurrencyResult<TaskHandle>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let erased: Callback = Box::new(move |payload: Payload| match payload.downcast::<A>() {
            Ok(arg) => callback(*arg),
            // Unreachable by construction: the payload is boxed right below.
            Err(_) => error!("delayed payload type mismatch"),
        });
        self.schedule_erased(delay, Box::new(payload), erased)
    }

    /// Run `callback(payload)` at the next wall-clock occurrence of
    /// `hour:minute`.
    ///
    /// Occurrences less than 60 seconds away roll to the next day. The day
    /// increment is naive date arithmetic: a DST boundary between now and the
    /// target can shift the fire time by an hour. Callers that need
    /// DST-correct firing should compose a wall-clock-aware layer on top.
    pub fn schedule_time_of_day<A, F>(
        &self,
        hour: u32,
        minute: u32,
        payload: A,
        callback: F,
    ) -> ConcurrencyResult<TaskHandle>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        let delay = delay_until_time_of_day(hour, minute)?;
        self.schedule(delay, payload, callback)
    }

    fn schedule_erased(
        &self,
        delay: Duration,
        payload: Payload,
        callback: Callback,
    ) -> ConcurrencyResult<TaskHandle> {
        let handle = self.registry.allocate();
        let record = Arc::new(DelayedRecord {
            handle,
            body: Mutex::new(DelayedBody {
                state: DelayedState::Idle,
                delay,
                started_at: Instant::now(),
                payload: Some(payload),
                callback: Some(callback),
                worker: None,
            }),
            cond: Condvar::new(),
        });
        self.registry.insert(handle, Arc::clone(&record));

        let registry = Arc::clone(&self.registry);
        let worker_record = Arc::clone(&record);
        let spawned = thread::Builder::new()
            .name(truncate_thread_name(format!("delayed-{handle}")))
            .spawn(move || delayed_worker(&registry, &worker_record));
        match spawned {
            Ok(join) => {
                record.body.lock().worker = Some(join);
                trace!(%handle, ?delay, "delayed task scheduled");
                Ok(handle)
            }
            Err(e) => {
                self.registry.remove(handle);
                Err(ConcurrencyError::Spawn(e.to_string()))
            }
        }
    }

    /// Cancel `handle`.
    ///
    /// Returns the original payload when the callback had not yet started, so
    /// the caller can reclaim whatever it carries; `None` once the task is
    /// running or finished. Idempotent: a second cancel finds no record.
    ///
    /// Must not be called while holding a lock the task's callback also
    /// acquires.
    pub fn cancel(&self, handle: TaskHandle) -> Option<Payload> {
        let record = self.registry.remove(handle)?;
        let mut body = record.body.lock();
        match body.state {
            DelayedState::Idle | DelayedState::Waiting => {
                body.state = DelayedState::Canceled;
                body.callback = None;
                let payload = body.payload.take();
                record.cond.notify_all();
                drop(body);
                debug!(%handle, "delayed task canceled");
                payload
            }
            _ => None,
        }
    }

    /// True while the task exists and its callback has not started.
    pub fn is_waiting(&self, handle: TaskHandle) -> bool {
        match self.registry.get(handle) {
            Some(record) => {
                let body = record.body.lock();
                matches!(body.state, DelayedState::Idle | DelayedState::Waiting)
            }
            None => false,
        }
    }

    /// Re-arm `handle` with a new delay measured from now.
    pub fn reschedule(&self, handle: TaskHandle, delay: Duration) -> ConcurrencyResult<()> {
        let record = self.registry.get(handle).ok_or(ConcurrencyError::NotFound)?;
        let mut body = record.body.lock();
        match body.state {
            DelayedState::Idle | DelayedState::Waiting => {
                body.delay = delay;
                body.started_at = Instant::now();
                record.cond.notify_all();
                trace!(%handle, ?delay, "delayed task rescheduled");
                Ok(())
            }
            _ => Err(ConcurrencyError::InvalidState),
        }
    }

    /// Run `handle`'s callback now instead of waiting out the delay.
    pub fn force_execute(&self, handle: TaskHandle) -> ConcurrencyResult<()> {
        let record = self.registry.get(handle).ok_or(ConcurrencyError::NotFound)?;
        let mut body = record.body.lock();
        match body.state {
            DelayedState::Idle | DelayedState::Waiting => {
                body.state = DelayedState::Running;
                record.cond.notify_all();
                trace!(%handle, "delayed task forced");
                Ok(())
            }
            _ => Err(ConcurrencyError::InvalidState),
        }
    }

    /// Currently-live task count.
    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    /// Cancel everything still pending and join every worker. Intended for
    /// process shutdown and tests.
    pub fn shutdown_all(&self) {
        let mut joins = Vec::new();
        for handle in self.registry.live_handles() {
            let Some(record) = self.registry.remove(handle) else {
                continue;
            };
            let mut body = record.body.lock();
            if matches!(body.state, DelayedState::Idle | DelayedState::Waiting) {
                body.state = DelayedState::Canceled;
                body.callback = None;
                body.payload = None;
            }
            let join = body.worker.take();
            record.cond.notify_all();
            drop(body);
            if let Some(join) = join {
                joins.push(join);
            }
        }
        for join in joins {
            if join.join().is_err() {
                error!("delayed worker panicked");
            }
        }
    }
}

impl Default for DelayedScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn delayed_worker(registry: &Registry<DelayedRecord>, record: &Arc<DelayedRecord>) {
    let mut body = record.body.lock();
    if body.state == DelayedState::Idle {
        body.state = DelayedState::Waiting;
    }
    // Recompute the remaining time on every wake so reschedule and spurious
    // wake-ups are handled uniformly.
    while body.state == DelayedState::Waiting {
        let elapsed = body.started_at.elapsed();
        if elapsed >= body.delay {
            break;
        }
        let remaining = body.delay - elapsed;
        record.cond.wait_for(&mut body, remaining);
    }
    let run = match body.state {
        // Waiting: the delay ran out. Running: force_execute signalled us.
        DelayedState::Waiting | DelayedState::Running => {
            body.state = DelayedState::Running;
            true
        }
        _ => false,
    };
    let callback = if run { body.callback.take() } else { None };
    let payload = if run { body.payload.take() } else { None };
    drop(body);

    if let (Some(callback), Some(payload)) = (callback, payload) {
        if catch_unwind(AssertUnwindSafe(move || callback(payload))).is_err() {
            error!(handle = %record.handle, "delayed callback panicked");
        }
    }

    // Cancel already removed the record on its path; this covers the run and
    // shutdown paths. The per-record lock is not held across the registry op,
    // and the identity check keeps a re-used handle's record intact.
    registry.remove_same(record.handle, record);
    trace!(handle = %record.handle, "delayed task finished");
}

fn delay_until_time_of_day(hour: u32, minute: u32) -> ConcurrencyResult<Duration> {
    let now = Local::now().naive_local();
    let mut target = now
        .date()
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| {
            ConcurrencyError::InvalidArgument(format!("invalid time of day {hour:02}:{minute:02}"))
        })?;
    if target - now < TimeDelta::seconds(TIME_OF_DAY_FUDGE_SECS) {
        target = target + TimeDelta::days(1);
    }
    (target - now)
        .to_std()
        .map_err(|e| ConcurrencyError::InvalidArgument(e.to_string()))
}
