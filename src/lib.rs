//! Shared-memory synchronization primitives, a compacting JSON arena, and
//! an MPMC channel for threads of a single process (spec.md §1–2).
//!
//! Every primitive here is built on the same two layers: a
//! [`region::SharedRegion`] of raw, atomically-addressable bytes, and the
//! [`futex`] wait/wake adapter that parks a thread (or suspends a task) on
//! one of that region's words without ever going through a host-provided
//! mutex. [`mutex`], [`rwlock`], [`semaphore`], [`condvar`], and [`barrier`]
//! each add one CAS-then-futex protocol over a fixed header layout
//! ([`layout`] is the single source of truth for every such layout);
//! [`channel`] composes four semaphores and a ring buffer the same way;
//! [`json`] is a bump-allocated, GC-compacted arena for values shared
//! between threads without per-access serialization. [`envelope`] is the
//! only piece that actually serializes anything — it is how a primitive's
//! region crosses a boundary that only carries bytes.

pub mod barrier;
pub mod channel;
pub mod condvar;
pub mod config;
pub mod envelope;
pub mod error;
pub mod futex;
pub mod json;
pub mod layout;
pub mod logging;
pub mod mutex;
pub mod region;
pub mod rwlock;
pub mod semaphore;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::Condvar;
pub use config::RuntimeConfig;
pub use error::{Result, SyncError};
pub use json::{JsonHandle, SharedJsonBuffer};
pub use mutex::{Mutex, MutexGuard};
pub use region::SharedRegion;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
