//! The shared region: a contiguous, thread-shareable byte allocation
//! addressable as aligned 32-bit integers (spec.md §3 "Shared region").
//!
//! Every primitive in this crate owns a `SharedRegion` (or a sub-view of
//! one). Cloning a `SharedRegion` is cheap — it bumps an `Arc` refcount —
//! and every clone observes the same bytes, which is what lets a primitive
//! be reconstructed on another thread from nothing but its backing region
//! (`envelope::to_serialized`/`from_serialized`).
//!
//! Two access modes are exposed:
//!
//! - Atomic word ops (`load`, `store`, `compare_exchange`, `fetch_add`,
//!   `fetch_sub`) for the header control words every primitive polls
//!   without holding any lock (Mutex state, Semaphore permits, channel
//!   head/tail, ...). These are sound without any external synchronization
//!   because they go through `AtomicI32::from_ptr`/`AtomicU32::from_ptr`.
//! - Plain byte slice access (`read_bytes`, `write_bytes`) for the
//!   Shared-JSON Buffer heap, which spec.md §3 invariant 3 guarantees is
//!   only ever mutated while the enclosing Mutex/RwLock is held — plain
//!   (non-atomic) access is sound there because the lock rules out a
//!   concurrent writer by construction.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

struct Inner {
    bytes: Box<[u8]>,
}

/// A cheaply-cloneable handle to a process-shared byte region.
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<Inner>,
    base_offset: usize,
    capacity: usize,
}

impl SharedRegion {
    /// Allocate a fresh, zero-filled region of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                bytes: vec![0u8; capacity].into_boxed_slice(),
            }),
            base_offset: 0,
            capacity,
        }
    }

    /// A view into a sub-range of an existing region, sharing its backing
    /// allocation. Used by components that carve a single SAB-style region
    /// into fixed sub-regions (e.g. a channel's ring buffer inside a larger
    /// arena).
    pub fn sub_view(&self, offset: usize, size: usize) -> Self {
        assert!(
            offset + size <= self.capacity,
            "sub_view out of bounds: {offset} + {size} > {}",
            self.capacity
        );
        Self {
            inner: Arc::clone(&self.inner),
            base_offset: self.base_offset + offset,
            capacity: size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// True if two handles share the same backing allocation (used by
    /// reconstruction to confirm "all threads that reconstruct from the
    /// same region share the same logical object").
    pub fn same_allocation(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Decompose into the raw parts an [`crate::envelope::RegionDescriptor`]
    /// carries across a wire envelope: an `Arc<Inner>` pointer (as bits) plus
    /// the view's own offset/capacity. Consumes one strong reference — the
    /// returned pointer owns it until [`Self::from_raw_parts`] reclaims it.
    pub(crate) fn into_raw_parts(self) -> (usize, usize, usize) {
        let ptr = Arc::into_raw(self.inner) as usize;
        (ptr, self.base_offset, self.capacity)
    }

    /// Reconstruct a region from parts produced by [`Self::into_raw_parts`].
    ///
    /// # Safety
    ///
    /// `ptr` must be a value returned by a prior `into_raw_parts` call on a
    /// `SharedRegion` whose backing allocation is still alive, and this
    /// function must be called at most once per such value (it reclaims the
    /// strong reference `into_raw_parts` handed off). Passing a pointer that
    /// crossed an actual process boundary is undefined behavior — this
    /// mechanism only supports handing a region between threads in the same
    /// process (spec.md Non-goals: no cross-process shared memory).
    pub(crate) unsafe fn from_raw_parts(ptr: usize, base_offset: usize, capacity: usize) -> Self {
        let inner = unsafe { Arc::from_raw(ptr as *const Inner) };
        Self { inner, base_offset, capacity }
    }

    fn bounds_check(&self, offset: usize, len: usize) {
        assert!(
            offset + len <= self.capacity,
            "out of bounds: {offset} + {len} > {}",
            self.capacity
        );
    }

    fn word_ptr(&self, index: u32) -> *mut i32 {
        let byte_offset = self.base_offset + index as usize * 4;
        self.bounds_check(index as usize * 4, 4);
        debug_assert_eq!(byte_offset % 4, 0, "word index must be 4-byte aligned");
        // SAFETY: `byte_offset` was bounds-checked above and the backing
        // allocation is kept alive for as long as any `SharedRegion` handle
        // (via `Arc`) exists, so this pointer is valid and aligned for the
        // remainder of the access.
        unsafe { self.inner.bytes.as_ptr().add(byte_offset) as *mut i32 }
    }

    fn atomic_i32(&self, index: u32) -> &AtomicI32 {
        // SAFETY: see `word_ptr`; `AtomicI32::from_ptr` requires only a
        // valid, aligned, non-dangling pointer for the lifetime borrowed,
        // which `self` provides.
        unsafe { AtomicI32::from_ptr(self.word_ptr(index)) }
    }

    fn atomic_u32(&self, index: u32) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.word_ptr(index) as *mut u32) }
    }

    pub fn load(&self, index: u32) -> i32 {
        self.atomic_i32(index).load(Ordering::Acquire)
    }

    pub fn store(&self, index: u32, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Release);
    }

    /// Compare-and-swap. Returns the value observed before the attempt;
    /// the swap succeeded iff the returned value equals `expected`.
    pub fn compare_and_swap(&self, index: u32, expected: i32, new: i32) -> i32 {
        match self
            .atomic_i32(index)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    pub fn fetch_add(&self, index: u32, delta: i32) -> i32 {
        self.atomic_i32(index).fetch_add(delta, Ordering::AcqRel)
    }

    pub fn fetch_sub(&self, index: u32, delta: i32) -> i32 {
        self.atomic_i32(index).fetch_sub(delta, Ordering::AcqRel)
    }

    pub(crate) fn as_atomic_u32(&self, index: u32) -> &AtomicU32 {
        self.atomic_u32(index)
    }

    /// Read `len` raw bytes starting at `offset`. Callers must hold
    /// whatever lock protects this region's heap; this performs a plain
    /// (non-atomic) copy.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bounds_check(offset, len);
        let start = self.base_offset + offset;
        // SAFETY: bounds-checked above; no concurrent writer is possible
        // because SJB mutation requires the caller to hold the enclosing
        // lock (spec.md §3 invariant 3).
        unsafe {
            let ptr = self.inner.bytes.as_ptr().add(start);
            std::slice::from_raw_parts(ptr, len).to_vec()
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.bounds_check(offset, data.len());
        let start = self.base_offset + offset;
        // SAFETY: see `read_bytes`.
        unsafe {
            let ptr = self.inner.bytes.as_ptr().add(start) as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
    }
}

// SAFETY: all interior mutation goes through atomics or is protected by an
// externally-held lock, per spec.md §3 invariant 3.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}
