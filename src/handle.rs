//! Opaque task handles and the registries that back them.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Opaque identifier naming a scheduled background task.
///
/// Handles are positive integers, unique among currently-live tasks, and safe
/// to hold after the task completes: operations on a dead handle fail with
/// [`ConcurrencyError::NotFound`](crate::ConcurrencyError::NotFound) rather
/// than touching freed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(NonZeroU32);

impl TaskHandle {
    /// Raw integer form of the handle.
    pub fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically wrapping handle source.
///
/// Wraps from `u32::MAX` back to 1; zero is skipped so it can keep meaning
/// "invalid" at FFI boundaries.
struct HandleSource {
    next: AtomicU32,
}

impl HandleSource {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    fn next(&self) -> TaskHandle {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            if let Some(raw) = NonZeroU32::new(raw) {
                return TaskHandle(raw);
            }
        }
    }
}

/// Handle-keyed record registry shared by the schedulers.
///
/// Lock discipline: the registry shard lock is never held while a per-record
/// mutex is held. Callers clone the `Arc` out of the map and drop the shard
/// guard before locking the record.
pub(crate) struct Registry<R> {
    tasks: DashMap<TaskHandle, Arc<R>>,
    handles: HandleSource,
}

impl<R> Registry<R> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            handles: HandleSource::new(),
        }
    }

    /// Draw a handle no currently-live task is using.
    pub(crate) fn allocate(&self) -> TaskHandle {
        loop {
            let handle = self.handles.next();
            if !self.tasks.contains_key(&handle) {
                return handle;
            }
        }
    }

    pub(crate) fn insert(&self, handle: TaskHandle, record: Arc<R>) {
        self.tasks.insert(handle, record);
    }

    pub(crate) fn remove(&self, handle: TaskHandle) -> Option<Arc<R>> {
        self.tasks.remove(&handle).map(|(_, record)| record)
    }

    /// Remove `handle` only while it still names `record`.
    ///
    /// A worker cleaning up after itself must not evict an unrelated record
    /// that re-used its handle after a cancel already freed it.
    pub(crate) fn remove_same(&self, handle: TaskHandle, record: &Arc<R>) {
        self.tasks
            .remove_if(&handle, |_, current| Arc::ptr_eq(current, record));
    }

    pub(crate) fn get(&self, handle: TaskHandle) -> Option<Arc<R>> {
        self.tasks.get(&handle).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn contains(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(&handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn live_handles(&self) -> Vec<TaskHandle> {
        self.tasks.iter().map(|entry| *entry.key()).collect()
    }
}
