//! Wire envelope for moving a primitive handle, or a plain JSON value,
//! across a boundary that only carries bytes (spec.md §4.9).
//!
//! A [`SharedRegion`] is already a cheap, `Arc`-backed handle — the whole
//! point of the envelope is to let one thread hand that handle to another
//! through something byte-shaped (a channel message, a queue, anything
//! `bincode` can round-trip) without re-deriving which allocation it points
//! at. `Envelope::Lib` carries a [`RegionDescriptor`] plus the primitive's
//! `type_id`; the receiving side looks the id up in [`registry`] to learn
//! how to turn that descriptor back into a concrete, `Any`-erased handle.
//!
//! Every primitive here is non-generic at the region boundary — a `Mutex<T>`
//! guards a `T` that lives in a sibling `Arc`, not in the region itself
//! (spec.md §9), so there is no general way to recover an arbitrary `T` from
//! bytes alone. The registry therefore reconstructs `Mutex<()>`/`RwLock<()>`:
//! a lock whose region is the thing actually being shared, with any real
//! payload carried alongside it (e.g. as a [`crate::json::SharedJsonBuffer`]
//! sent in its own envelope) rather than folded into the lock's type
//! parameter.

use std::any::Any;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::barrier::Barrier;
use crate::channel::{self, Receiver, Sender};
use crate::condvar::Condvar;
use crate::error::{Result, SyncError};
use crate::json::SharedJsonBuffer;
use crate::layout::{
    TYPE_ID_BARRIER, TYPE_ID_CONDVAR, TYPE_ID_MUTEX, TYPE_ID_RECEIVER, TYPE_ID_RWLOCK,
    TYPE_ID_SEMAPHORE, TYPE_ID_SENDER, TYPE_ID_SHARED_JSON_BUFFER,
};
use crate::mutex::Mutex;
use crate::region::SharedRegion;
use crate::rwlock::RwLock;
use crate::semaphore::Semaphore;

/// Enough information to reconstruct a [`SharedRegion`] view on another
/// thread without re-deriving its backing allocation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct RegionDescriptor {
    arena_ptr: usize,
    base_offset: usize,
    capacity: usize,
}

impl RegionDescriptor {
    fn from_region(region: SharedRegion) -> Self {
        let (arena_ptr, base_offset, capacity) = region.into_raw_parts();
        RegionDescriptor { arena_ptr, base_offset, capacity }
    }

    /// # Safety
    ///
    /// See [`SharedRegion::from_raw_parts`]: `self` must not have already
    /// been reconstructed, and the region it was built from must still be
    /// alive somewhere in this process.
    unsafe fn into_region(self) -> SharedRegion {
        unsafe { SharedRegion::from_raw_parts(self.arena_ptr, self.base_offset, self.capacity) }
    }
}

/// The tagged-union wire format itself.
#[derive(Serialize, Deserialize, Debug)]
pub enum Envelope {
    /// An arbitrary payload with no shared-memory component — typically a
    /// `serde_json`-encoded value, sent as already-serialized bytes so this
    /// module stays agnostic to what "raw" actually contains.
    Raw(Vec<u8>),
    /// A handle onto one of this crate's primitives, keyed by its
    /// [`crate::layout`] type id.
    Lib { type_id: u8, region: RegionDescriptor },
}

/// Serialize a plain value as a [`Envelope::Raw`] wire message.
pub fn to_serialized<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)
        .map_err(|_| SyncError::InvariantViolation("value is not JSON-serializable"))?;
    bincode::serialize(&Envelope::Raw(payload))
        .map_err(|_| SyncError::InvariantViolation("envelope encoding failed"))
}

/// Deserialize a value previously produced by [`to_serialized`].
pub fn from_serialized<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    let envelope: Envelope = bincode::deserialize(bytes)
        .map_err(|_| SyncError::InvariantViolation("envelope decoding failed"))?;
    match envelope {
        Envelope::Raw(payload) => serde_json::from_slice(&payload)
            .map_err(|_| SyncError::InvariantViolation("payload is not the requested type")),
        Envelope::Lib { .. } => Err(SyncError::InvariantViolation(
            "expected a raw envelope, found a library handle",
        )),
    }
}

/// Serialize a library primitive's region into a [`Envelope::Lib`] wire
/// message, tagged with `type_id`. Call sites are the primitives'
/// constructors (`Mutex::to_serialized`, etc.) rather than user code
/// directly, since only they know their own type id.
pub(crate) fn serialize_region(type_id: u8, region: SharedRegion) -> Result<Vec<u8>> {
    let envelope = Envelope::Lib {
        type_id,
        region: RegionDescriptor::from_region(region),
    };
    bincode::serialize(&envelope)
        .map_err(|_| SyncError::InvariantViolation("envelope encoding failed"))
}

/// Reconstruct whichever primitive `bytes` describes, dispatching through
/// [`registry`] on its `type_id`. The result is `Any`-erased because the
/// registry is a single flat map over every primitive type; callers that
/// know what they asked for downcast with [`Any::downcast_ref`] or
/// `Box::downcast`.
pub fn from_serialized_handle(bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>> {
    let envelope: Envelope = bincode::deserialize(bytes)
        .map_err(|_| SyncError::InvariantViolation("envelope decoding failed"))?;
    match envelope {
        Envelope::Raw(_) => Err(SyncError::InvariantViolation(
            "expected a library handle, found a raw envelope",
        )),
        Envelope::Lib { type_id, region } => {
            let constructor = registry::REGISTRY
                .get(&type_id)
                .ok_or(SyncError::InvariantViolation("unknown envelope type id"))?;
            Ok(constructor(region))
        }
    }
}

/// The process-wide class registry (spec.md §4.9): each primitive module
/// registers how to turn a [`RegionDescriptor`] back into its own concrete
/// type, erased behind `Box<dyn Any + Send + Sync>`.
pub mod registry {
    use super::*;

    pub(super) type Constructor = fn(RegionDescriptor) -> Box<dyn Any + Send + Sync>;

    pub(super) static REGISTRY: Lazy<DashMap<u8, Constructor>> = Lazy::new(|| {
        let registry: DashMap<u8, Constructor> = DashMap::new();
        registry.insert(TYPE_ID_MUTEX, ctor_mutex as Constructor);
        registry.insert(TYPE_ID_RWLOCK, ctor_rwlock as Constructor);
        registry.insert(TYPE_ID_SEMAPHORE, ctor_semaphore as Constructor);
        registry.insert(TYPE_ID_CONDVAR, ctor_condvar as Constructor);
        registry.insert(TYPE_ID_BARRIER, ctor_barrier as Constructor);
        registry.insert(TYPE_ID_SHARED_JSON_BUFFER, ctor_sjb as Constructor);
        registry.insert(TYPE_ID_SENDER, ctor_sender as Constructor);
        registry.insert(TYPE_ID_RECEIVER, ctor_receiver as Constructor);
        registry
    });

    fn ctor_mutex(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        // SAFETY: `desc` only ever originates from `serialize_region`, which
        // is only ever called on a region that's still alive (the caller
        // holds the primitive it came from until this returns).
        let region = unsafe { desc.into_region() };
        Box::new(Mutex::from_region(region, ()))
    }

    fn ctor_rwlock(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        Box::new(RwLock::from_region(region, ()))
    }

    fn ctor_semaphore(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        // The permit count already lives in the region's header; reusing
        // `from_region` here would reset it, so this goes through the
        // non-resetting constructor instead.
        Box::new(Semaphore::from_existing_region(region))
    }

    fn ctor_condvar(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        Box::new(Condvar::from_region(region))
    }

    fn ctor_barrier(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        Box::new(Barrier::from_region(region))
    }

    fn ctor_sjb(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        Box::new(SharedJsonBuffer::from_region(region))
    }

    /// Reconstructs the `Sender` this region came from as a move
    /// (spec.md §4.8.5): `tx_count` is not incremented here, so the
    /// caller must have disposed the source handle (`Sender::dispose`)
    /// before handing its region to `serialize_region` — otherwise the
    /// same counted slot ends up governed by two live, undisposed
    /// handles.
    fn ctor_sender(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        let sender: Sender = channel::sender_from_region(region);
        Box::new(sender)
    }

    /// Receiver-side mirror of [`ctor_sender`].
    fn ctor_receiver(desc: RegionDescriptor) -> Box<dyn Any + Send + Sync> {
        let region = unsafe { desc.into_region() };
        let receiver: Receiver = channel::receiver_from_region(region);
        Box::new(receiver)
    }
}
