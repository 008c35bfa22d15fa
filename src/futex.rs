//! The wait/wake adapter every blocking primitive is built on
//! (spec.md §2 component B, §9 "Coroutine/async dual API").
//!
//! `wait_blocking` parks the calling OS thread on a control word until it
//! changes away from an `expected` value, using the `atomic-wait` crate for
//! a real OS wait (Linux `futex(2)`, macOS `os_sync_wait_on_address`,
//! Windows `WaitOnAddress`) rather than a spin loop. `wait_async` gets the
//! same behaviour without blocking the calling task's OS thread by running
//! the blocking wait on a `tokio` blocking-pool thread, per the design
//! note's "implement the async variant in terms of the blocking one on a
//! background executor."
//!
//! `atomic-wait` has no notion of a deadline, so a timed wait is built the
//! same way the SAB lock guards in this crate's lineage build their timed
//! acquire: poll with exponential backoff instead of parking indefinitely.
//! An untimed wait always parks (zero busy CPU); a timed wait trades that
//! for a bounded deadline.

use std::time::{Duration, Instant};

use crate::region::SharedRegion;

const BACKOFF_START: Duration = Duration::from_micros(50);
const BACKOFF_MAX: Duration = Duration::from_millis(2);

/// Outcome of a wait: did the word change, or did the deadline pass first?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The word no longer holds `expected` — re-check the predicate.
    Woken,
    /// `expected` still held at the deadline.
    TimedOut,
}

/// Block the calling thread until `region`'s word at `index` no longer
/// equals `expected`, or `timeout` elapses.
pub fn wait_blocking(
    region: &SharedRegion,
    index: u32,
    expected: i32,
    timeout: Option<Duration>,
) -> WaitOutcome {
    match timeout {
        None => {
            atomic_wait::wait(region.as_atomic_u32(index), expected as u32);
            WaitOutcome::Woken
        }
        Some(limit) => wait_with_backoff(region, index, expected, limit),
    }
}

fn wait_with_backoff(
    region: &SharedRegion,
    index: u32,
    expected: i32,
    limit: Duration,
) -> WaitOutcome {
    let deadline = Instant::now() + limit;
    let mut backoff = BACKOFF_START;
    loop {
        if region.load(index) != expected {
            return WaitOutcome::Woken;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        std::thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// `async` counterpart of [`wait_blocking`]: suspends the calling task, not
/// the worker thread, by running the blocking wait on a `tokio`
/// blocking-pool thread.
pub async fn wait_async(
    region: SharedRegion,
    index: u32,
    expected: i32,
    timeout: Option<Duration>,
) -> WaitOutcome {
    tokio::task::spawn_blocking(move || wait_blocking(&region, index, expected, timeout))
        .await
        .expect("futex wait task panicked")
}

/// Wake one thread parked on `region`'s word at `index`.
pub fn notify_one(region: &SharedRegion, index: u32) {
    atomic_wait::wake_one(region.as_atomic_u32(index));
}

/// Wake every thread parked on `region`'s word at `index`.
pub fn notify_all(region: &SharedRegion, index: u32) {
    atomic_wait::wake_all(region.as_atomic_u32(index));
}

/// Wake up to `n` threads parked on `region`'s word at `index`.
///
/// `atomic-wait` only exposes "wake one" and "wake all" — there is no
/// portable "wake exactly n" futex primitive across Linux/macOS/Windows.
/// Waking more than `n` is harmless here because every waiter re-checks its
/// own predicate after waking and re-parks if it lost the race (spec.md
/// §4.4's "waiters is a hint ... must not gate correctness"), so a large
/// `n` collapses to a single `wake_all`.
pub fn notify_n(region: &SharedRegion, index: u32, n: u32) {
    if n == 0 {
        return;
    }
    if n >= 8 {
        notify_all(region, index);
        return;
    }
    for _ in 0..n {
        atomic_wait::wake_one(region.as_atomic_u32(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_wakes_on_notify() {
        let region = Arc::new(SharedRegion::new(16));
        let waiter_region = SharedRegion::clone(&region);
        let handle = thread::spawn(move || wait_blocking(&waiter_region, 0, 0, None));

        // Give the waiter a moment to park, then change and wake it.
        thread::sleep(Duration::from_millis(20));
        region.store(0, 1);
        notify_all(&region, 0);

        assert_eq!(handle.join().unwrap(), WaitOutcome::Woken);
    }

    #[test]
    fn wait_returns_immediately_when_already_changed() {
        let region = SharedRegion::new(16);
        region.store(0, 5);
        let outcome = wait_blocking(&region, 0, 0, Some(Duration::from_millis(10)));
        assert_eq!(outcome, WaitOutcome::Woken);
    }

    #[test]
    fn timed_wait_times_out() {
        let region = SharedRegion::new(16);
        let outcome = wait_blocking(&region, 0, 0, Some(Duration::from_millis(20)));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn async_wait_wakes_on_notify() {
        let region = SharedRegion::new(16);
        let waiter = {
            let region = region.clone();
            tokio::spawn(async move { wait_async(region, 0, 0, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        region.store(0, 1);
        notify_all(&region, 0);
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Woken);
    }
}
