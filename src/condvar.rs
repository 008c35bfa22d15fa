//! Sequence-counter condition variable tied to a [`Mutex`] guard
//! (spec.md §4.5), grounded on this crate's lineage's `Epoch` signal
//! (a monotonic counter waiters compare against to detect a wakeup).
//!
//! The Condvar never stores a reference to the Mutex it's used with —
//! it receives the release/re-acquire operation through the guard itself
//! at call time, which sidesteps the Condvar-holds-Mutex cycle entirely
//! (spec.md §9's chosen model for "Cyclic references").

use std::time::Duration;

use crate::futex::{self, WaitOutcome};
use crate::layout::CONDVAR_IDX_SEQ;
use crate::mutex::{Mutex, MutexGuard};
use crate::region::SharedRegion;

#[derive(Clone)]
pub struct Condvar {
    region: SharedRegion,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub fn new() -> Self {
        Self::from_region(SharedRegion::new(4))
    }

    pub fn from_region(region: SharedRegion) -> Self {
        Condvar { region }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Release `guard`'s mutex, park until notified, then re-acquire it.
    /// Spurious wakeups are possible; callers must re-check their
    /// predicate in a loop, per spec.md §4.5.
    pub fn wait_blocking<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.controller();
        let seq = self.region.load(CONDVAR_IDX_SEQ);
        drop(guard);
        futex::wait_blocking(&self.region, CONDVAR_IDX_SEQ, seq, None);
        mutex.lock_blocking()
    }

    pub async fn wait_async<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.controller();
        let seq = self.region.load(CONDVAR_IDX_SEQ);
        drop(guard);
        futex::wait_async(self.region.clone(), CONDVAR_IDX_SEQ, seq, None).await;
        mutex.lock_async().await
    }

    /// Like [`Self::wait_blocking`] but gives up after `timeout`, still
    /// returning a freshly re-acquired guard either way (spec.md §5:
    /// "no state changes beyond the wait itself" on timeout).
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitOutcome) {
        let mutex: &'a Mutex<T> = guard.controller();
        let seq = self.region.load(CONDVAR_IDX_SEQ);
        drop(guard);
        let outcome = futex::wait_blocking(&self.region, CONDVAR_IDX_SEQ, seq, Some(timeout));
        (mutex.lock_blocking(), outcome)
    }

    pub fn notify_one(&self) {
        self.region.fetch_add(CONDVAR_IDX_SEQ, 1);
        futex::notify_one(&self.region, CONDVAR_IDX_SEQ);
    }

    pub fn notify_all(&self) {
        self.region.fetch_add(CONDVAR_IDX_SEQ, 1);
        futex::notify_all(&self.region, CONDVAR_IDX_SEQ);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_before_wait_is_not_lost_forever() {
        // Notifying with nobody parked yet is a legal no-op; the next
        // waiter still observes the bumped `seq` on its own load and only
        // blocks on a subsequent notify.
        let cv = Condvar::new();
        cv.notify_all();
        assert_eq!(cv.region().load(CONDVAR_IDX_SEQ), 1);
    }

    #[test]
    fn wait_wakes_and_reacquires() {
        let mutex = Arc::new(Mutex::new(false));
        let cv = Arc::new(Condvar::new());

        let waiter_mutex = Arc::clone(&mutex);
        let waiter_cv = Arc::clone(&cv);
        let waiter = thread::spawn(move || {
            let mut guard = waiter_mutex.lock_blocking();
            while !*guard {
                guard = waiter_cv.wait_blocking(guard);
            }
            true
        });

        thread::sleep(Duration::from_millis(20));
        {
            let mut guard = mutex.lock_blocking();
            *guard = true;
        }
        cv.notify_all();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_timeout_returns_timed_out() {
        let mutex = Mutex::new(());
        let cv = Condvar::new();
        let guard = mutex.lock_blocking();
        let (_guard, outcome) = cv.wait_timeout(guard, Duration::from_millis(20));
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
