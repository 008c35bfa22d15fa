//! Many-reader / one-writer lock over a single shared-region state word
//! (spec.md §4.3), grounded on the reader-count/writer-sentinel packing
//! this crate's lineage uses in its SAB-backed `SABRwLock`.
//!
//! The state word doubles as both the reader count (`>= 0`) and the
//! writer-held sentinel (`-1`); no state may be simultaneously positive and
//! `-1`. Writers are not preferred over readers — a continuous stream of
//! readers can starve a writer, matching `std::sync::RwLock`.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::futex;
use crate::layout::RWLOCK_IDX_STATE;
use crate::region::SharedRegion;

const UNLOCKED: i32 = 0;
const WRITER: i32 = -1;

pub struct RwLock<T> {
    region: SharedRegion,
    data: Arc<UnsafeCell<T>>,
}

unsafe impl<T: Send + Sync> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> Clone for RwLock<T> {
    fn clone(&self) -> Self {
        RwLock {
            region: self.region.clone(),
            data: Arc::clone(&self.data),
        }
    }
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self::from_region(SharedRegion::new(4), value)
    }

    pub fn from_region(region: SharedRegion, value: T) -> Self {
        RwLock {
            region,
            data: Arc::new(UnsafeCell::new(value)),
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let current = self.region.load(RWLOCK_IDX_STATE);
        if current == WRITER {
            return None;
        }
        let prev = self
            .region
            .compare_and_swap(RWLOCK_IDX_STATE, current, current + 1);
        if prev == current {
            Some(RwLockReadGuard {
                lock: self,
                released: false,
            })
        } else {
            None
        }
    }

    pub fn read_blocking(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let current = self.region.load(RWLOCK_IDX_STATE);
            if current == WRITER {
                log::trace!("rwlock read contended on writer, parking");
                futex::wait_blocking(&self.region, RWLOCK_IDX_STATE, WRITER, None);
                continue;
            }
            if self.region.compare_and_swap(RWLOCK_IDX_STATE, current, current + 1) == current {
                return RwLockReadGuard {
                    lock: self,
                    released: false,
                };
            }
        }
    }

    pub async fn read_async(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let current = self.region.load(RWLOCK_IDX_STATE);
            if current == WRITER {
                futex::wait_async(self.region.clone(), RWLOCK_IDX_STATE, WRITER, None).await;
                continue;
            }
            if self.region.compare_and_swap(RWLOCK_IDX_STATE, current, current + 1) == current {
                return RwLockReadGuard {
                    lock: self,
                    released: false,
                };
            }
        }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let prev = self.region.compare_and_swap(RWLOCK_IDX_STATE, UNLOCKED, WRITER);
        if prev == UNLOCKED {
            Some(RwLockWriteGuard {
                lock: self,
                released: false,
            })
        } else {
            None
        }
    }

    pub fn write_blocking(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let current = self.region.load(RWLOCK_IDX_STATE);
            if current != UNLOCKED {
                log::trace!("rwlock write contended, parking");
                futex::wait_blocking(&self.region, RWLOCK_IDX_STATE, current, None);
                continue;
            }
            if self.region.compare_and_swap(RWLOCK_IDX_STATE, UNLOCKED, WRITER) == UNLOCKED {
                return RwLockWriteGuard {
                    lock: self,
                    released: false,
                };
            }
        }
    }

    pub async fn write_async(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            let current = self.region.load(RWLOCK_IDX_STATE);
            if current != UNLOCKED {
                futex::wait_async(self.region.clone(), RWLOCK_IDX_STATE, current, None).await;
                continue;
            }
            if self.region.compare_and_swap(RWLOCK_IDX_STATE, UNLOCKED, WRITER) == UNLOCKED {
                return RwLockWriteGuard {
                    lock: self,
                    released: false,
                };
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("state", &self.region.load(RWLOCK_IDX_STATE))
            .finish()
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    released: bool,
}

impl<'a, T> RwLockReadGuard<'a, T> {
    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let prev = self.lock.region.fetch_sub(RWLOCK_IDX_STATE, 1);
        if prev == 1 {
            futex::notify_one(&self.lock.region, RWLOCK_IDX_STATE);
        }
    }

    pub fn dispose(mut self) {
        self.release_once();
    }
}

impl<'a, T> Deref for RwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a read guard guarantees no writer is concurrently
        // mutating `data` — the state word can't be `-1` while this guard
        // contributed to a positive reader count.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.release_once();
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    released: bool,
}

impl<'a, T> RwLockWriteGuard<'a, T> {
    fn release_once(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let prev = self.lock.region.compare_and_swap(RWLOCK_IDX_STATE, WRITER, UNLOCKED);
        if prev != WRITER {
            return Err(SyncError::InvariantViolation("unlocked by wrong holder"));
        }
        futex::notify_all(&self.lock.region, RWLOCK_IDX_STATE);
        Ok(())
    }

    pub fn dispose(mut self) -> Result<()> {
        self.release_once()
    }
}

impl<'a, T> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: see `DerefMut`.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a write guard is proof the state word is `-1`, held
        // exclusively by this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        if let Err(err) = self.release_once() {
            log::error!("rwlock write guard drop failed to release: {err}");
        }
    }
}
