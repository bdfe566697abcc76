//! Monotonic timed-wait support.
//!
//! Every relative timeout in this crate funnels through [`Deadline`]: the
//! caller's budget is converted once into an absolute instant on the
//! monotonic clock, and each wake-up re-derives the remaining budget from
//! that instant. Spurious wake-ups can therefore only shrink a wait, never
//! extend it, and wall-clock adjustments have no effect.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

/// Outcome of a single timed condition-variable wait.
///
/// `Signaled` covers spurious wake-ups as well as real signals; callers must
/// re-check their predicate after every return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condvar was signaled, or the wait woke spuriously.
    Signaled,
    /// The deadline elapsed.
    TimedOut,
}

/// Coarse delay units for callers holding (amount, unit) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayUnit {
    Hours,
    Mins,
    Secs,
    Millis,
}

impl DelayUnit {
    /// Convert `amount` of this unit into a [`Duration`].
    pub fn duration(self, amount: u64) -> Duration {
        match self {
            DelayUnit::Hours => Duration::from_secs(amount * 3600),
            DelayUnit::Mins => Duration::from_secs(amount * 60),
            DelayUnit::Secs => Duration::from_secs(amount),
            DelayUnit::Millis => Duration::from_millis(amount),
        }
    }
}

/// An absolute deadline on the monotonic clock, or unbounded.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    /// A deadline `budget` from now; `None` never expires.
    pub fn after(budget: Option<Duration>) -> Self {
        Self {
            end: budget.map(|d| Instant::now() + d),
        }
    }

    /// An already-expired deadline, for zero-timeout polls.
    pub fn expired() -> Self {
        Self {
            end: Some(Instant::now()),
        }
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self { end: None }
    }

    /// Remaining budget, clamped at zero. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.end
            .map(|end| end.saturating_duration_since(Instant::now()))
    }

    /// True once no budget remains.
    pub fn is_elapsed(&self) -> bool {
        self.remaining().is_some_and(|d| d.is_zero())
    }
}

/// One timed wait against `deadline`.
///
/// The mutex behind `guard` is released for the duration of the sleep and
/// re-acquired before returning. A [`WaitOutcome::Signaled`] return says
/// nothing about the caller's predicate.
pub fn wait_deadline<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: &Deadline,
) -> WaitOutcome {
    match deadline.remaining() {
        None => {
            cond.wait(guard);
            WaitOutcome::Signaled
        }
        Some(budget) if budget.is_zero() => WaitOutcome::TimedOut,
        Some(budget) => {
            if cond.wait_for(guard, budget).timed_out() {
                WaitOutcome::TimedOut
            } else {
                WaitOutcome::Signaled
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use test_case::test_case;

    #[test_case(DelayUnit::Hours, 2, Duration::from_secs(7200) ; "hours")]
    #[test_case(DelayUnit::Mins, 3, Duration::from_secs(180) ; "minutes")]
    #[test_case(DelayUnit::Secs, 42, Duration::from_secs(42) ; "seconds")]
    #[test_case(DelayUnit::Millis, 1500, Duration::from_millis(1500) ; "milliseconds")]
    fn test_delay_unit_conversion(unit: DelayUnit, amount: u64, expected: Duration) {
        assert_eq!(unit.duration(amount), expected);
    }

    #[test]
    fn test_deadline_budget_only_shrinks() {
        let deadline = Deadline::after(Some(Duration::from_millis(50)));
        let first = deadline.remaining().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let second = deadline.remaining().unwrap();
        assert!(second <= first);
    }

    #[test]
    fn test_deadline_clamps_at_zero() {
        let deadline = Deadline::expired();
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
        assert!(deadline.is_elapsed());
    }

    #[test]
    fn test_unbounded_deadline_never_elapses() {
        let deadline = Deadline::never();
        assert_eq!(deadline.remaining(), None);
        assert!(!deadline.is_elapsed());
    }

    #[test]
    fn test_expired_deadline_times_out_without_sleeping() {
        let mutex = Mutex::new(());
        let cond = Condvar::new();
        let mut guard = mutex.lock();
        let start = Instant::now();
        let outcome = wait_deadline(&cond, &mut guard, &Deadline::expired());
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_timed_wait_expires() {
        let mutex = Mutex::new(());
        let cond = Condvar::new();
        let mut guard = mutex.lock();
        let deadline = Deadline::after(Some(Duration::from_millis(20)));
        let outcome = wait_deadline(&cond, &mut guard, &deadline);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(deadline.is_elapsed());
    }
}
