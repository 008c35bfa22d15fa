//! Counting semaphore over a `[permits, waiters]` shared-region header
//! (spec.md §4.4).
//!
//! `waiters` is advisory only — it lets [`Semaphore::release`] skip a
//! notify when nobody is parked, but correctness never depends on it being
//! exact (spec.md: "it is not authoritative and must not gate
//! correctness").

use std::fmt;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::futex::{self, WaitOutcome};
use crate::layout::{SEM_IDX_PERMITS, SEM_IDX_WAITERS};
use crate::region::SharedRegion;

#[derive(Clone)]
pub struct Semaphore {
    region: SharedRegion,
}

impl Semaphore {
    pub fn new(permits: i32) -> Self {
        Self::from_region(SharedRegion::new(8), permits)
    }

    pub fn from_region(region: SharedRegion, permits: i32) -> Self {
        region.store(SEM_IDX_PERMITS, permits);
        region.store(SEM_IDX_WAITERS, 0);
        Semaphore { region }
    }

    /// Wrap a region whose header already holds a live permit count —
    /// reconstruction from an envelope, or a sub-view into a composite
    /// region another primitive initialized (`channel::bounded`'s four
    /// semaphores). Unlike [`Self::from_region`], this never touches the
    /// header, since doing so would silently reset an in-flight permit
    /// count or waiter tally.
    pub(crate) fn from_existing_region(region: SharedRegion) -> Self {
        Semaphore { region }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn available_permits(&self) -> i32 {
        self.region.load(SEM_IDX_PERMITS)
    }

    pub fn try_acquire(&self, n: i32) -> Option<SemaphorePermit<'_>> {
        let current = self.region.load(SEM_IDX_PERMITS);
        if current < n {
            return None;
        }
        if self.region.compare_and_swap(SEM_IDX_PERMITS, current, current - n) == current {
            Some(SemaphorePermit {
                semaphore: self,
                count: n,
                released: false,
            })
        } else {
            None
        }
    }

    pub fn acquire_blocking(&self, n: i32) -> SemaphorePermit<'_> {
        loop {
            if let Some(permit) = self.try_acquire(n) {
                return permit;
            }
            let cur = self.region.load(SEM_IDX_PERMITS);
            self.region.fetch_add(SEM_IDX_WAITERS, 1);
            futex::wait_blocking(&self.region, SEM_IDX_PERMITS, cur, None);
            self.region.fetch_sub(SEM_IDX_WAITERS, 1);
        }
    }

    pub async fn acquire_async(&self, n: i32) -> SemaphorePermit<'_> {
        loop {
            if let Some(permit) = self.try_acquire(n) {
                return permit;
            }
            let cur = self.region.load(SEM_IDX_PERMITS);
            self.region.fetch_add(SEM_IDX_WAITERS, 1);
            futex::wait_async(self.region.clone(), SEM_IDX_PERMITS, cur, None).await;
            self.region.fetch_sub(SEM_IDX_WAITERS, 1);
        }
    }

    pub fn acquire_timeout(&self, n: i32, timeout: Duration) -> Result<SemaphorePermit<'_>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(permit) = self.try_acquire(n) {
                return Ok(permit);
            }
            let cur = self.region.load(SEM_IDX_PERMITS);
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::Timeout);
            }
            self.region.fetch_add(SEM_IDX_WAITERS, 1);
            let outcome = futex::wait_blocking(&self.region, SEM_IDX_PERMITS, cur, Some(remaining));
            self.region.fetch_sub(SEM_IDX_WAITERS, 1);
            if outcome == WaitOutcome::TimedOut {
                return Err(SyncError::Timeout);
            }
        }
    }

    /// Release `n` permits directly, without a corresponding permit object.
    /// Used by [`SemaphorePermit::dispose`] and by components (the MPMC
    /// channel's close protocol) that release a bulk permit count that was
    /// never acquired through this semaphore.
    ///
    /// Saturates at `i32::MAX` rather than a plain `fetch_add`: a close
    /// protocol releasing a very large permit count on top of a nonzero
    /// live count (an unconsumed backlog, spare ring-buffer room) must not
    /// wrap past `i32::MAX` into a negative permit count, which would make
    /// every subsequent `try_acquire` fail forever and hang the next
    /// waiter on a futex value that can never change again.
    pub fn release(&self, n: i32) {
        if n == 0 {
            return;
        }
        loop {
            let current = self.region.load(SEM_IDX_PERMITS);
            let new = current.saturating_add(n);
            if self.region.compare_and_swap(SEM_IDX_PERMITS, current, new) == current {
                break;
            }
        }
        if self.region.load(SEM_IDX_WAITERS) > 0 {
            futex::notify_n(&self.region, SEM_IDX_PERMITS, n.max(0) as u32);
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.region.load(SEM_IDX_PERMITS))
            .field("waiters", &self.region.load(SEM_IDX_WAITERS))
            .finish()
    }
}

/// RAII guard holding `count` permits; releases exactly that many on drop.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
    count: i32,
    released: bool,
}

impl<'a> SemaphorePermit<'a> {
    pub fn count(&self) -> i32 {
        self.count
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.semaphore.release(self.count);
    }

    pub fn dispose(mut self) {
        self.release_once();
    }
}

impl<'a> Drop for SemaphorePermit<'a> {
    fn drop(&mut self) {
        self.release_once();
    }
}
