//! Periodic task execution: fixed-delay, fixed-rate, and exponential
//! back-off policies.
//!
//! Each task owns a worker thread cycling `Waiting → Running → Waiting`
//! against a monotonic target instant. A `ShortCircuit` state forces the next
//! cycle to run immediately without permanently disturbing the cadence, and a
//! `did_complete` flag arbitrates the race between a back-off task finishing
//! itself and an external cancel.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::error::{ConcurrencyError, ConcurrencyResult};
use crate::handle::{Registry, TaskHandle};
use crate::pool::truncate_thread_name;

/// Type-erased payload handed back by [`RepeatingScheduler::cancel`].
pub type Payload = Box<dyn Any + Send>;

/// Exponential back-off parameters. Every field must be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first (immediate) run.
    pub initial: Duration,
    /// Ceiling the delay grows toward.
    pub max: Duration,
    /// Step added to the delay after each run.
    pub increment: Duration,
}

impl BackoffConfig {
    fn validate(&self) -> ConcurrencyResult<()> {
        if self.initial.is_zero() || self.max.is_zero() || self.increment.is_zero() {
            return Err(ConcurrencyError::InvalidArgument(
                "back-off initial, max, and increment must all be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn next_delay(&self, current: Duration) -> Duration {
        if current < self.initial {
            self.initial
        } else {
            (current + self.increment).min(self.max)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepeatState {
    Idle,
    Waiting,
    Running,
    Canceled,
    ShortCircuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepeatPolicy {
    FixedDelay,
    FixedRate,
    Backoff,
}

enum RepeatAction {
    Plain(Box<dyn FnMut(&mut Payload) + Send>),
    Backoff {
        run: Box<dyn FnMut(&mut Payload) -> bool + Send>,
        on_done: Option<Box<dyn FnOnce(Payload) + Send>>,
    },
}

struct RepeatBody {
    state: RepeatState,
    policy: RepeatPolicy,
    delay: Duration,
    pending_delay: Option<Duration>,
    backoff: Option<BackoffConfig>,
    target: Instant,
    payload: Option<Payload>,
    action: Option<RepeatAction>,
    did_complete: bool,
    worker: Option<thread::JoinHandle<()>>,
}

struct RepeatRecord {
    handle: TaskHandle,
    body: Mutex<RepeatBody>,
    cond: Condvar,
}

/// Scheduler for periodic callbacks.
///
/// Prefer owning an instance per runtime; [`RepeatingScheduler::global`] is
/// the thin process-wide form.
pub struct RepeatingScheduler {
    registry: Arc<Registry<RepeatRecord>>,
}

impl RepeatingScheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Process-wide scheduler instance.
    pub fn global() -> &'static RepeatingScheduler {
        static GLOBAL: OnceLock<RepeatingScheduler> = OnceLock::new();
        GLOBAL.get_or_init(RepeatingScheduler::new)
    }

    /// Run `callback` repeatedly, waiting `delay` after the *end* of each run
    /// before the next.
    pub fn fixed_delay<A, F>(
        &self,
        delay: Duration,
        payload: A,
        callback: F,
    ) -> ConcurrencyResult<TaskHandle>
    where
        A: Send + 'static,
        F: FnMut(&mut A) + Send + 'static,
    {
        require_nonzero(delay)?;
        self.spawn_task(
            RepeatPolicy::FixedDelay,
            delay,
            None,
            Box::new(payload),
            RepeatAction::Plain(erase_plain(callback)),
        )
    }

    /// Run `callback` repeatedly, scheduling each run `period` after the
    /// previous *target* so the cadence is preserved even when runs overrun.
    pub fn fixed_rate<A, F>(
        &self,
        period: Duration,
        payload: A,
        callback: F,
    ) -> ConcurrencyResult<TaskHandle>
    where
        A: Send + 'static,
        F: FnMut(&mut A) + Send + 'static,
    {
        require_nonzero(period)?;
        self.spawn_task(
            RepeatPolicy::FixedRate,
            period,
            None,
            Box::new(payload),
            RepeatAction::Plain(erase_plain(callback)),
        )
    }

    /// Run `run` with exponential back-off until it reports completion.
    ///
    /// The first run is immediate; afterwards the delay grows by
    /// `config.increment` up to `config.max`. When `run` returns `true`,
    /// `on_done` consumes the payload and the task removes itself.
    pub fn backoff<A, R, D>(
        &self,
        config: BackoffConfig,
        payload: A,
        run: R,
        on_done: D,
    ) -> ConcurrencyResult<TaskHandle>
    where
        A: Send + 'static,
        R: FnMut(&mut A) -> bool + Send + 'static,
        D: FnOnce(A) + Send + 'static,
    {
        config.validate()?;
        let mut run = run;
        let erased_run: Box<dyn FnMut(&mut Payload) -> bool + Send> =
            Box::new(move |payload: &mut Payload| match payload.downcast_mut::<A>() {
                Some(arg) => run(arg),
                None => {
                    error!("back-off payload type mismatch");
                    true
                }
            });
        let erased_done: Box<dyn FnOnce(Payload) + Send> =
            Box::new(move |payload: Payload| match payload.downcast::<A>() {
                Ok(arg) => on_done(*arg),
                Err(_) => error!("back-off payload type mismatch"),
            });
        self.spawn_task(
            RepeatPolicy::Backoff,
            // First run is immediate; next_delay() raises this to `initial`.
            Duration::ZERO,
            Some(config),
            Box::new(payload),
            RepeatAction::Backoff {
                run: erased_run,
                on_done: Some(erased_done),
            },
        )
    }

    fn spawn_task(
        &self,
        policy: RepeatPolicy,
        delay: Duration,
        backoff: Option<BackoffConfig>,
        payload: Payload,
        action: RepeatAction,
    ) -> ConcurrencyResult<TaskHandle> {
        let handle = self.registry.allocate();
        let record = Arc::new(RepeatRecord {
            handle,
            body: Mutex::new(RepeatBody {
                state: RepeatState::Idle,
                policy,
                delay,
                pending_delay: None,
                backoff,
                target: Instant::now() + delay,
                payload: Some(payload),
                action: Some(action),
                did_complete: false,
                worker: None,
            }),
            cond: Condvar::new(),
        });
        self.registry.insert(handle, Arc::clone(&record));

        let registry = Arc::clone(&self.registry);
        let worker_record = Arc::clone(&record);
        let spawned = thread::Builder::new()
            .name(truncate_thread_name(format!("repeat-{handle}")))
            .spawn(move || repeating_worker(&registry, &worker_record));
        match spawned {
            Ok(join) => {
                record.body.lock().worker = Some(join);
                trace!(%handle, ?policy, ?delay, "repeating task created");
                Ok(handle)
            }
            Err(e) => {
                self.registry.remove(handle);
                Err(ConcurrencyError::Spawn(e.to_string()))
            }
        }
    }

    /// Cancel `handle` and join its worker.
    ///
    /// Returns the payload unless the task already completed on its own
    /// (back-off success), in which case the worker released it first.
    ///
    /// Must not be called from inside the task's own callback, nor while
    /// holding a lock the callback acquires.
    pub fn cancel(&self, handle: TaskHandle) -> Option<Payload> {
        let record = self.registry.remove(handle)?;
        let (payload, join) = {
            let mut body = record.body.lock();
            let payload = if body.did_complete {
                None
            } else {
                body.state = RepeatState::Canceled;
                body.action = None;
                body.payload.take()
            };
            record.cond.notify_all();
            (payload, body.worker.take())
        };
        if let Some(join) = join {
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                error!(%handle, "repeating worker panicked");
            }
        }
        debug!(%handle, "repeating task canceled");
        payload
    }

    /// Make the next cycle run immediately without disturbing the cadence.
    pub fn short_circuit(&self, handle: TaskHandle) -> ConcurrencyResult<()> {
        let record = self.registry.get(handle).ok_or(ConcurrencyError::NotFound)?;
        let mut body = record.body.lock();
        match body.state {
            RepeatState::Canceled => Err(ConcurrencyError::InvalidState),
            _ => {
                body.state = RepeatState::ShortCircuit;
                record.cond.notify_all();
                trace!(%handle, "repeating task short-circuited");
                Ok(())
            }
        }
    }

    /// Change the delay between runs.
    ///
    /// With `change_now` the target run time is recomputed from now and the
    /// worker is woken; otherwise the new delay applies from the next cycle.
    pub fn change(
        &self,
        handle: TaskHandle,
        delay: Duration,
        change_now: bool,
    ) -> ConcurrencyResult<()> {
        require_nonzero(delay)?;
        let record = self.registry.get(handle).ok_or(ConcurrencyError::NotFound)?;
        let mut body = record.body.lock();
        if body.state == RepeatState::Canceled {
            return Err(ConcurrencyError::InvalidState);
        }
        if change_now {
            body.delay = delay;
            body.pending_delay = None;
            body.target = Instant::now() + delay;
            record.cond.notify_all();
        } else {
            body.pending_delay = Some(delay);
        }
        trace!(%handle, ?delay, change_now, "repeating task delay changed");
        Ok(())
    }

    /// True while the task is live in the registry.
    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.registry.contains(handle)
    }

    /// Currently-live task count.
    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    /// Cancel every live task and join the workers.
    pub fn shutdown_all(&self) {
        for handle in self.registry.live_handles() {
            self.cancel(handle);
        }
    }
}

impl Default for RepeatingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn require_nonzero(delay: Duration) -> ConcurrencyResult<()> {
    if delay.is_zero() {
        return Err(ConcurrencyError::InvalidArgument(
            "delay must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn erase_plain<A, F>(mut callback: F) -> Box<dyn FnMut(&mut Payload) + Send>
where
    A: Send + 'static,
    F: FnMut(&mut A) + Send + 'static,
{
    Box::new(move |payload: &mut Payload| match payload.downcast_mut::<A>() {
        Some(arg) => callback(arg),
        None => error!("repeating payload type mismatch"),
    })
}

fn repeating_worker(registry: &Registry<RepeatRecord>, record: &Arc<RepeatRecord>) {
    let mut body = record.body.lock();
    if body.state == RepeatState::Idle {
        body.state = RepeatState::Waiting;
    }
    loop {
        // Timed wait until the target instant or an interrupting state
        // change; the target is re-read on every wake so `change` and
        // spurious wake-ups are handled uniformly.
        while body.state == RepeatState::Waiting {
            let now = Instant::now();
            if now >= body.target {
                break;
            }
            let remaining = body.target - now;
            record.cond.wait_for(&mut body, remaining);
        }
        let entered_from = body.state;
        if entered_from == RepeatState::Canceled {
            break;
        }
        body.state = RepeatState::Running;
        if let Some(new_delay) = body.pending_delay.take() {
            body.delay = new_delay;
        }
        let scheduled = body.target;

        // The record lock is held across the callback; see `cancel` docs.
        let done = run_cycle(record.handle, &mut body);

        if done {
            // Back-off success: the worker owns the payload from here; a
            // concurrent cancel observes did_complete and returns None.
            body.did_complete = true;
            body.state = RepeatState::Canceled;
            let payload = body.payload.take();
            let on_done = match body.action.take() {
                Some(RepeatAction::Backoff { on_done, .. }) => on_done,
                _ => None,
            };
            drop(body);
            if let (Some(on_done), Some(payload)) = (on_done, payload) {
                if catch_unwind(AssertUnwindSafe(move || on_done(payload))).is_err() {
                    error!(handle = %record.handle, "back-off completion callback panicked");
                }
            }
            registry.remove_same(record.handle, record);
            trace!(handle = %record.handle, "back-off task completed");
            return;
        }

        match body.state {
            RepeatState::Canceled => break,
            // Short-circuited during the run: skip the wait once more.
            RepeatState::ShortCircuit => {}
            _ => body.state = RepeatState::Waiting,
        }

        let now = Instant::now();
        if let (RepeatPolicy::Backoff, Some(config)) = (body.policy, body.backoff) {
            body.delay = config.next_delay(body.delay);
        }
        body.target = if body.policy == RepeatPolicy::FixedRate
            && entered_from != RepeatState::ShortCircuit
        {
            // Rate-preserving: measure from the previous target so slow runs
            // are caught up. A short-circuited run resets from now, exactly
            // once.
            scheduled + body.delay
        } else {
            now + body.delay
        };
    }
    trace!(handle = %record.handle, "repeating worker exiting");
}

fn run_cycle(handle: TaskHandle, body: &mut MutexGuard<'_, RepeatBody>) -> bool {
    let mut action = body.action.take();
    let mut payload = body.payload.take();
    let mut done = false;
    if let (Some(action), Some(payload)) = (action.as_mut(), payload.as_mut()) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match action {
            RepeatAction::Plain(run) => {
                run(payload);
                false
            }
            RepeatAction::Backoff { run, .. } => run(payload),
        }));
        match outcome {
            Ok(finished) => done = finished,
            Err(_) => error!(%handle, "repeating callback panicked"),
        }
    }
    body.action = action;
    body.payload = payload;
    done
}
