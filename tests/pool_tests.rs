//! Thread pool integration tests: task execution, statistics, backlog
//! rejection, dynamic sizing, and self-destruct.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use knhk_concurrent::{ConcurrencyError, ThreadPool, ThreadPoolConfig};
use parking_lot::{Condvar, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn config(name: &str, min: u16, max: u16, backlog: u32) -> ThreadPoolConfig {
    ThreadPoolConfig {
        name: name.to_string(),
        min_threads: min,
        max_threads: max,
        backlog,
    }
}

/// A latch tasks can block on until the test opens it.
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

mod execution {
    use super::*;

    #[test]
    fn test_all_submitted_tasks_run() {
        // Arrange
        super::init_tracing();
        let pool = ThreadPool::new(config("exec", 2, 4, 64)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        // Act
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        pool.shutdown();

        // Assert
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_stats_track_queued_and_ran() {
        // Arrange
        let pool = ThreadPool::new(config("stats", 1, 2, 64)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        // Act
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        // Assert: snapshot, then clear, then verify the clear took.
        let stats = pool.stats(true);
        assert_eq!(stats.total_tasks_queued, 10);
        assert_eq!(stats.total_tasks_ran, 10);
        assert!(stats.max_concurrent_tasks >= 1);
        let cleared = pool.stats(false);
        assert_eq!(cleared.total_tasks_queued, 0);
        assert_eq!(cleared.total_tasks_ran, 0);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_does_not_kill_the_pool() {
        let pool = ThreadPool::new(config("panics", 1, 1, 16)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.execute(|| panic!("task failure")).unwrap();
        let counter_in_task = Arc::clone(&counter);
        pool.execute(move || {
            counter_in_task.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }
}

mod backpressure {
    use super::*;

    #[test]
    fn test_full_backlog_at_max_workers_rejects() {
        // Arrange: one worker parked on the gate, backlog filled to capacity.
        let pool = ThreadPool::new(config("reject", 1, 1, 2)).unwrap();
        let gate = Gate::new();
        let task_gate = Arc::clone(&gate);
        pool.execute(move || task_gate.wait()).unwrap();
        // Give the worker a moment to claim the blocking task.
        thread::sleep(Duration::from_millis(100));
        pool.execute(|| {}).unwrap();
        pool.execute(|| {}).unwrap();

        // Act: queue is full and the only worker is busy.
        let result = pool.execute(|| {});

        // Assert
        assert_eq!(result, Err(ConcurrencyError::Timeout));
        gate.open();
        pool.shutdown();
    }
}

mod sizing {
    use super::*;

    #[test]
    fn test_grows_toward_max_under_load() {
        // Arrange
        let pool = ThreadPool::new(config("grow", 1, 4, 32)).unwrap();
        let gate = Gate::new();

        // Act: four blocking tasks force eager worker creation.
        for _ in 0..4 {
            let task_gate = Arc::clone(&gate);
            pool.execute(move || task_gate.wait()).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.active_count() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        // Assert
        assert_eq!(pool.active_count(), 4);
        assert_eq!(pool.thread_count(), 4);
        gate.open();
        pool.shutdown();
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_idle_workers_shrink_toward_min() {
        // Arrange: grow to several workers with a quick burst.
        let pool = ThreadPool::new(config("shrink", 1, 4, 32)).unwrap();
        for _ in 0..8 {
            pool.execute(|| thread::sleep(Duration::from_millis(20)))
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.thread_count() > 1 && Instant::now() < deadline {
            // Keep-alive is two seconds; idle workers exit one at a time.
            thread::sleep(Duration::from_millis(100));
        }

        // Assert
        assert_eq!(pool.thread_count(), 1);
        pool.shutdown();
    }
}

mod shutdown {
    use super::*;

    #[test]
    fn test_shutdown_drops_unstarted_tasks() {
        // Arrange: the only worker is parked, backlog holds undispatched
        // tasks whose side effects must never happen.
        let pool = ThreadPool::new(config("drops", 1, 1, 8)).unwrap();
        let gate = Gate::new();
        let task_gate = Arc::clone(&gate);
        pool.execute(move || task_gate.wait()).unwrap();
        thread::sleep(Duration::from_millis(100));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            pool.execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        // Act: start the shutdown first (it blocks joining the parked
        // worker), then open the gate. Everything the worker pops after the
        // stop flag is dropped unrun.
        let pool_for_shutdown = Arc::new(pool);
        let pool_in_thread = Arc::clone(&pool_for_shutdown);
        let shutdown_thread = thread::spawn(move || pool_in_thread.shutdown());
        thread::sleep(Duration::from_millis(100));
        gate.open();
        shutdown_thread.join().unwrap();

        // Assert: none of the queued tasks ran.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!pool_for_shutdown.is_running());
        assert_eq!(
            pool_for_shutdown.execute(|| {}),
            Err(ConcurrencyError::ShuttingDown)
        );
    }

    #[test]
    fn test_task_may_destroy_its_own_pool() {
        // Arrange
        let pool = Arc::new(ThreadPool::new(config("selfd", 1, 2, 8)).unwrap());
        let pool_in_task = Arc::clone(&pool);
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_in_task = Arc::clone(&finished);

        // Act: the task shuts down the pool it is running on.
        pool.execute(move || {
            pool_in_task.shutdown();
            finished_in_task.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while finished.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        // Assert: the task survived its own pool's shutdown.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!pool.is_running());
    }
}
