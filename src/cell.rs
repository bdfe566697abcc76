//! Read/modify thread-safe wrapper: many concurrent readers, deferred
//! writers, and awaitable completion futures.
//!
//! Reads run with the cell lock released, under a shared view of the value.
//! Modifications apply immediately when no readers are active; otherwise they
//! queue in order and the last reader out applies them. Releasing the cell
//! while readers are in flight detaches the inner ref: the slot clears at
//! once, the ref lives until the last reader leaves, and modifications still
//! queued on it are discarded with their futures completed `applied = false`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::error::{ConcurrencyError, ConcurrencyResult};
use crate::timing::{wait_deadline, Deadline, WaitOutcome};

type ModifyFn<T> = Box<dyn FnOnce(&mut T) + Send>;
type BuilderFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type PredicateFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// How often `modify_blocking` re-checks its future while waiting.
const FUTURE_POLL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct FutureFlags {
    complete: bool,
    applied: bool,
}

/// Completion future for a queued modification.
///
/// Once `complete` is set it never clears, and `applied` is final from that
/// point on.
pub struct ModifyFuture {
    flags: Mutex<FutureFlags>,
    cond: Condvar,
}

impl ModifyFuture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flags: Mutex::new(FutureFlags::default()),
            cond: Condvar::new(),
        })
    }

    /// Block until the future completes or `timeout` expires; `None` waits
    /// forever. Returns whether the future is complete. Instantaneous and
    /// idempotent once completed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        let mut flags = self.flags.lock();
        while !flags.complete {
            if wait_deadline(&self.cond, &mut flags, &deadline) == WaitOutcome::TimedOut {
                return flags.complete;
            }
        }
        true
    }

    /// True once the associated modification ran or was discarded.
    pub fn is_complete(&self) -> bool {
        self.flags.lock().complete
    }

    /// True when the modification actually ran. Meaningful once complete.
    pub fn is_applied(&self) -> bool {
        self.flags.lock().applied
    }

    fn finish(&self, applied: bool) {
        let mut flags = self.flags.lock();
        if flags.complete {
            return;
        }
        flags.complete = true;
        flags.applied = applied;
        self.cond.notify_all();
    }
}

struct Modification<T> {
    apply: ModifyFn<T>,
    future: Option<Arc<ModifyFuture>>,
}

struct RefNode<T> {
    /// Value behind `Arc` so readers can hold a view with the lock released;
    /// the strong count is 1 whenever `readers == 0`.
    value: Arc<T>,
    readers: usize,
    pending: VecDeque<Modification<T>>,
    detached: bool,
}

type NodeRef<T> = Arc<Mutex<RefNode<T>>>;

/// A single mutable cell shared by many threads.
///
/// See the [module docs](self) for the reader/writer protocol. An optional
/// builder creates the value lazily, and an optional release predicate lets
/// expensive state self-purge once idle.
pub struct SharedCell<T> {
    slot: Mutex<Option<NodeRef<T>>>,
    builder: Option<BuilderFn<T>>,
    release_predicate: Option<PredicateFn<T>>,
}

impl<T> SharedCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            builder: None,
            release_predicate: None,
        }
    }

    /// Lazily build the value on first use.
    #[must_use]
    pub fn with_builder(mut self, builder: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.builder = Some(Box::new(builder));
        self
    }

    /// Auto-release the value when this returns true after a modification.
    #[must_use]
    pub fn with_release_predicate(
        mut self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.release_predicate = Some(Box::new(predicate));
        self
    }

    /// Install `value`; fails with `AlreadyAssigned` when a value is present.
    pub fn assign(&self, value: T) -> ConcurrencyResult<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(ConcurrencyError::AlreadyAssigned);
        }
        *slot = Some(new_node(value));
        Ok(())
    }

    /// Install via the builder, only when currently unassigned.
    ///
    /// Returns whether this call installed the value; fails with `NotFound`
    /// when no builder was configured.
    pub fn assign_if_released(&self) -> ConcurrencyResult<bool> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Ok(false);
        }
        match &self.builder {
            Some(builder) => {
                *slot = Some(new_node(builder()));
                Ok(true)
            }
            None => Err(ConcurrencyError::NotFound),
        }
    }

    /// True while a value is assigned.
    pub fn is_assigned(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drop the value.
    ///
    /// Safe with readers in flight: the slot clears immediately and the inner
    /// ref lives until the last reader leaves. Modifications still queued on
    /// it are discarded with `applied = false`.
    pub fn release(&self) {
        let node = self.slot.lock().take();
        if let Some(node) = node {
            detach(&node);
        }
    }

    /// Release only if `predicate` (or the configured release predicate when
    /// `None`) approves the current value. Returns whether a release
    /// happened; unassigned cells return false.
    pub fn conditional_release(&self, predicate: Option<&dyn Fn(&T) -> bool>) -> bool {
        let node = match &*self.slot.lock() {
            Some(node) => Arc::clone(node),
            None => return false,
        };
        let approved = {
            let n = node.lock();
            match predicate {
                Some(p) => p(&n.value),
                None => self
                    .release_predicate
                    .as_ref()
                    .is_some_and(|p| p(&n.value)),
            }
        };
        if !approved {
            return false;
        }
        let taken = {
            let mut slot = self.slot.lock();
            match &*slot {
                Some(current) if Arc::ptr_eq(current, &node) => slot.take(),
                _ => None,
            }
        };
        if let Some(node) = taken {
            detach(&node);
            true
        } else {
            false
        }
    }

    /// Run `f` with shared access to the value.
    ///
    /// The cell lock is released while `f` runs, so reads may overlap each
    /// other; they never overlap a modification. If this read is the last one
    /// out, queued modifications are applied in order and the release
    /// predicate is evaluated.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> ConcurrencyResult<R> {
        let (node, value) = loop {
            let node = self.acquire_node()?;
            let mut n = node.lock();
            if n.detached {
                // Released between the slot lookup and the lock; take the
                // reader token on whatever is current instead.
                continue;
            }
            n.readers += 1;
            let value = Arc::clone(&n.value);
            drop(n);
            break (node, value);
        };
        let result = catch_unwind(AssertUnwindSafe(|| f(&value)));
        // Drop our view before the decrement so the last reader's apply pass
        // sees a sole owner.
        drop(value);
        self.finish_read(&node);
        match result {
            Ok(value) => Ok(value),
            Err(panic) => {
                error!("cell read callback panicked");
                resume_unwind(panic)
            }
        }
    }

    /// Apply `f` to the value, or queue it behind in-flight readers.
    ///
    /// Succeeds on both outcomes; the future (when given) completes in both
    /// cases and `applied` is set only when the closure actually ran. The
    /// only failure is an unassigned cell with no builder: the closure is
    /// dropped and the future completes `applied = false`.
    pub fn enqueue_modification(
        &self,
        f: impl FnOnce(&mut T) + Send + 'static,
        future: Option<Arc<ModifyFuture>>,
    ) -> ConcurrencyResult<()> {
        let modification = Modification {
            apply: Box::new(f),
            future,
        };
        loop {
            let node = match self.acquire_node() {
                Ok(node) => node,
                Err(e) => {
                    if let Some(future) = modification.future {
                        future.finish(false);
                    }
                    return Err(e);
                }
            };
            let purge = {
                let mut n = node.lock();
                if n.detached {
                    // A release detached this node between the slot lookup
                    // and the lock; retry against the current slot.
                    continue;
                }
                if n.readers > 0 {
                    n.pending.push_back(modification);
                    trace!(queued = n.pending.len(), "modification deferred");
                    false
                } else {
                    apply_one(&mut n.value, modification);
                    self.should_release(&n)
                }
            };
            if purge {
                self.clear_slot_if_current(&node);
            }
            return Ok(());
        }
    }

    /// Apply `f`, waiting for in-flight readers to drain first.
    ///
    /// Returns whether the modification ran (a detached ref discards it).
    pub fn modify_blocking(
        &self,
        f: impl FnOnce(&mut T) + Send + 'static,
    ) -> ConcurrencyResult<bool> {
        let future = ModifyFuture::new();
        self.enqueue_modification(f, Some(Arc::clone(&future)))?;
        // Periodic short waits; completion normally arrives via the last
        // reader's drain pass.
        while !future.wait(Some(FUTURE_POLL)) {}
        Ok(future.is_applied())
    }

    fn acquire_node(&self) -> ConcurrencyResult<NodeRef<T>> {
        let mut slot = self.slot.lock();
        if let Some(node) = &*slot {
            return Ok(Arc::clone(node));
        }
        match &self.builder {
            Some(builder) => {
                let node = new_node(builder());
                *slot = Some(Arc::clone(&node));
                Ok(node)
            }
            None => Err(ConcurrencyError::NotFound),
        }
    }

    fn finish_read(&self, node: &NodeRef<T>) {
        let purge = {
            let mut n = node.lock();
            n.readers -= 1;
            if n.readers > 0 {
                return;
            }
            if n.detached {
                // Last reader out of a detached ref; the node drops with the
                // final Arc and pending work was already discarded.
                return;
            }
            while let Some(modification) = n.pending.pop_front() {
                apply_one(&mut n.value, modification);
            }
            self.should_release(&n)
        };
        if purge {
            self.clear_slot_if_current(node);
        }
    }

    fn should_release(&self, n: &RefNode<T>) -> bool {
        self.release_predicate
            .as_ref()
            .is_some_and(|predicate| predicate(&n.value))
    }

    fn clear_slot_if_current(&self, node: &NodeRef<T>) {
        let mut slot = self.slot.lock();
        if let Some(current) = &*slot {
            if Arc::ptr_eq(current, node) {
                *slot = None;
                trace!("cell value auto-released");
            }
        }
    }
}

impl<T> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn new_node<T>(value: T) -> NodeRef<T> {
    Arc::new(Mutex::new(RefNode {
        value: Arc::new(value),
        readers: 0,
        pending: VecDeque::new(),
        detached: false,
    }))
}

fn detach<T>(node: &NodeRef<T>) {
    let mut n = node.lock();
    n.detached = true;
    while let Some(modification) = n.pending.pop_front() {
        if let Some(future) = modification.future {
            future.finish(false);
        }
    }
}

fn apply_one<T>(value: &mut Arc<T>, modification: Modification<T>) {
    let applied = match Arc::get_mut(value) {
        Some(value) => {
            let apply = modification.apply;
            if catch_unwind(AssertUnwindSafe(move || apply(value))).is_err() {
                error!("cell modification panicked");
            }
            true
        }
        // A reader still holds a view; callers only reach here with
        // readers == 0, so this is unreachable in practice.
        None => false,
    };
    if let Some(future) = modification.future {
        future.finish(applied);
    }
}
