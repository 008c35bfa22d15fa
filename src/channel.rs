//! Bounded MPMC channel of JSON-serializable messages (spec.md §4.8).
//!
//! The ring buffer itself needs no lock: `send_lock`/`recv_lock` are
//! binary semaphores that admit one writer (resp. reader) at a time to
//! move `tail`/`head` and touch a slot, exactly the same CAS-then-futex
//! discipline as [`crate::mutex::Mutex`] but expressed through
//! [`crate::semaphore::Semaphore`] since that's also what throttles
//! `slots_available`/`items_available`.
//!
//! Header, semaphores, and slot storage all live as sub-views of one
//! backing [`SharedRegion`] (the same "carve a single SAB-style region into
//! fixed sub-regions" pattern the region module documents), so a whole
//! channel endpoint reduces to a single region for envelope purposes —
//! `envelope::registry` reconstructs a `Sender`/`Receiver` from nothing but
//! that region. The header stays bit-exact at six words
//! (`[head, tail, closed, capacity, tx_count, rx_count]`); `slot_stride`
//! is never written to the wire, since it is already recoverable as
//! `(backing.capacity() - SLOTS_OFFSET) / capacity`.
//!
//! Closing is refcounted on both ends (spec.md §4.8.4): the last `Sender`
//! to drop marks the channel closed and wakes every blocked receiver by
//! releasing a saturating flood of permits into `items_available`; the
//! last `Receiver` to drop does the same into `slots_available` so blocked
//! senders unblock immediately instead of waiting for a send that will
//! never be read.
//!
//! `Sender`/`Receiver` both carry a local `disposed` flag (spec.md §4.8.5):
//! `clone()` increments `tx_count`/`rx_count` and hands back an
//! independently counted handle, but moving a handle across threads
//! through `envelope::registry` does not — the reconstructed handle
//! inherits the same counted slot, so the source must be disposed (not
//! simply dropped) to avoid double-counting it.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::CLOSE_WAKE_PERMITS;
use crate::error::{Result, SyncError};
use crate::layout::{
    CHAN_HEADER_WORDS, CHAN_IDX_CAPACITY, CHAN_IDX_CLOSED, CHAN_IDX_HEAD, CHAN_IDX_RX_COUNT,
    CHAN_IDX_TAIL, CHAN_IDX_TX_COUNT,
};
use crate::region::SharedRegion;
use crate::semaphore::Semaphore;

const TX_CLOSED: i32 = 1;
const RX_CLOSED: i32 = 2;

const SLOT_LEN_PREFIX: usize = 4;
const SEM_BYTES: usize = 8;

const CHAN_HEADER_BYTES: usize = CHAN_HEADER_WORDS as usize * 4;
const SEND_LOCK_OFFSET: usize = CHAN_HEADER_BYTES;
const RECV_LOCK_OFFSET: usize = SEND_LOCK_OFFSET + SEM_BYTES;
const SLOTS_AVAILABLE_OFFSET: usize = RECV_LOCK_OFFSET + SEM_BYTES;
const ITEMS_AVAILABLE_OFFSET: usize = SLOTS_AVAILABLE_OFFSET + SEM_BYTES;
const SLOTS_OFFSET: usize = ITEMS_AVAILABLE_OFFSET + SEM_BYTES;

struct ChannelInternals {
    backing: SharedRegion,
    header: SharedRegion,
    slots: SharedRegion,
    slot_stride: usize,
    send_lock: Semaphore,
    recv_lock: Semaphore,
    slots_available: Semaphore,
    items_available: Semaphore,
}

impl ChannelInternals {
    /// Carve every sub-view out of `backing`. `fresh` distinguishes a
    /// brand-new channel (whose semaphore headers need their initial
    /// permit counts written) from one being reconstructed from an
    /// existing region, whose headers must be left untouched.
    fn from_backing(backing: SharedRegion, capacity: u32, slot_stride: usize, fresh: bool) -> Self {
        let header = backing.sub_view(0, CHAN_HEADER_BYTES);
        let send_lock_region = backing.sub_view(SEND_LOCK_OFFSET, SEM_BYTES);
        let recv_lock_region = backing.sub_view(RECV_LOCK_OFFSET, SEM_BYTES);
        let slots_available_region = backing.sub_view(SLOTS_AVAILABLE_OFFSET, SEM_BYTES);
        let items_available_region = backing.sub_view(ITEMS_AVAILABLE_OFFSET, SEM_BYTES);
        let slots = backing.sub_view(SLOTS_OFFSET, slot_stride * capacity as usize);

        let (send_lock, recv_lock, slots_available, items_available) = if fresh {
            (
                Semaphore::from_region(send_lock_region, 1),
                Semaphore::from_region(recv_lock_region, 1),
                Semaphore::from_region(slots_available_region, capacity as i32),
                Semaphore::from_region(items_available_region, 0),
            )
        } else {
            (
                Semaphore::from_existing_region(send_lock_region),
                Semaphore::from_existing_region(recv_lock_region),
                Semaphore::from_existing_region(slots_available_region),
                Semaphore::from_existing_region(items_available_region),
            )
        };

        ChannelInternals {
            backing,
            header,
            slots,
            slot_stride,
            send_lock,
            recv_lock,
            slots_available,
            items_available,
        }
    }

    fn capacity(&self) -> u32 {
        self.header.load(CHAN_IDX_CAPACITY) as u32
    }

    fn closed_bits(&self) -> i32 {
        self.header.load(CHAN_IDX_CLOSED)
    }

    fn mark_closed(&self, bit: i32) -> i32 {
        loop {
            let current = self.closed_bits();
            if current & bit != 0 {
                return current;
            }
            if self
                .header
                .compare_and_swap(CHAN_IDX_CLOSED, current, current | bit)
                == current
            {
                return current | bit;
            }
        }
    }

    fn slot_offset(&self, index: u32) -> usize {
        index as usize * self.slot_stride
    }

    fn write_slot(&self, index: u32, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.slot_stride - SLOT_LEN_PREFIX,
            "message of {} bytes exceeds channel slot size",
            bytes.len()
        );
        let offset = self.slot_offset(index);
        self.slots
            .write_bytes(offset, &(bytes.len() as u32).to_le_bytes());
        self.slots.write_bytes(offset + SLOT_LEN_PREFIX, bytes);
    }

    fn read_slot(&self, index: u32) -> Vec<u8> {
        let offset = self.slot_offset(index);
        let len_bytes = self.slots.read_bytes(offset, SLOT_LEN_PREFIX);
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        self.slots.read_bytes(offset + SLOT_LEN_PREFIX, len)
    }
}

/// Create a bounded channel with room for `capacity` in-flight messages,
/// each at most `max_message_len` bytes.
pub fn bounded(capacity: u32, max_message_len: usize) -> (Sender, Receiver) {
    assert!(capacity > 0, "channel capacity must be positive");
    let slot_stride = SLOT_LEN_PREFIX + max_message_len;
    let backing = SharedRegion::new(SLOTS_OFFSET + slot_stride * capacity as usize);

    let internals = Arc::new(ChannelInternals::from_backing(
        backing,
        capacity,
        slot_stride,
        true,
    ));
    internals.header.store(CHAN_IDX_HEAD, 0);
    internals.header.store(CHAN_IDX_TAIL, 0);
    internals.header.store(CHAN_IDX_CLOSED, 0);
    internals.header.store(CHAN_IDX_CAPACITY, capacity as i32);
    internals.header.store(CHAN_IDX_TX_COUNT, 1);
    internals.header.store(CHAN_IDX_RX_COUNT, 1);

    (
        Sender {
            internals: Arc::clone(&internals),
            disposed: AtomicBool::new(false),
        },
        Receiver {
            internals,
            disposed: AtomicBool::new(false),
        },
    )
}

/// Reconstruct a channel endpoint's internals from a backing region
/// produced by a prior [`Sender::region`]/[`Receiver::region`] (used by
/// `envelope::registry`). `capacity` is read back out of the wire-exact
/// header; `slot_stride` is never stored on the wire at all — it is
/// recovered from the backing region's own byte length, which is exactly
/// `SLOTS_OFFSET + slot_stride * capacity` by construction, so dividing out
/// `capacity` recovers it without widening the header.
fn internals_from_backing(backing: SharedRegion) -> Arc<ChannelInternals> {
    let header = backing.sub_view(0, CHAN_HEADER_BYTES);
    let capacity = header.load(CHAN_IDX_CAPACITY) as u32;
    let slot_stride = (backing.capacity() - SLOTS_OFFSET) / capacity as usize;
    Arc::new(ChannelInternals::from_backing(
        backing,
        capacity,
        slot_stride,
        false,
    ))
}

/// Reconstruct a `Sender` from a backing region produced by
/// [`Sender::region`], as `envelope::registry` does. This is the spec's
/// move path (§4.8.5): ownership of the one logical sender slot the
/// region already accounts for is transferred here, not duplicated, so
/// `tx_count` is left untouched. The caller is responsible for disposing
/// the handle this region came from (`Sender::dispose`) so its own `Drop`
/// does not also decrement — disposing first and reconstructing after is
/// the only correct order.
pub(crate) fn sender_from_region(backing: SharedRegion) -> Sender {
    let internals = internals_from_backing(backing);
    Sender {
        internals,
        disposed: AtomicBool::new(false),
    }
}

/// Reconstruct a `Receiver` from a backing region; see
/// [`sender_from_region`] — the receiver-side mirror of the same move path.
pub(crate) fn receiver_from_region(backing: SharedRegion) -> Receiver {
    let internals = internals_from_backing(backing);
    Receiver {
        internals,
        disposed: AtomicBool::new(false),
    }
}

pub struct Sender {
    internals: Arc<ChannelInternals>,
    disposed: AtomicBool,
}

impl Clone for Sender {
    fn clone(&self) -> Self {
        self.internals.header.fetch_add(CHAN_IDX_TX_COUNT, 1);
        Sender {
            internals: Arc::clone(&self.internals),
            disposed: AtomicBool::new(false),
        }
    }
}

impl Sender {
    /// The backing region this endpoint was built from — what
    /// `envelope::registry` serializes to hand a `Sender` to another
    /// thread.
    pub fn region(&self) -> &SharedRegion {
        &self.internals.backing
    }

    /// Mark this handle disposed without touching `tx_count` (spec.md
    /// §4.8.5: "the source handle is marked disposed locally ... without
    /// decrementing the count"). Idempotent. Used both as an explicit
    /// scoped release for environments without deterministic destruction,
    /// and as the required step before handing this endpoint's region to
    /// `envelope::registry` for reconstruction on another thread, so the
    /// two handles don't double-count the same logical sender.
    pub fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Enqueue `bytes`, blocking while the channel is full. Errs
    /// immediately (without blocking) once every receiver has dropped,
    /// since nothing will ever read a slot again.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.is_disposed() {
            return Err(SyncError::DisposedHandle);
        }
        let internals = &self.internals;
        if internals.closed_bits() & RX_CLOSED != 0 {
            return Err(SyncError::channel_closed_no_receivers());
        }
        let slot = internals.slots_available.acquire_blocking(1);
        if internals.closed_bits() & RX_CLOSED != 0 {
            // Not spending the slot after all; let the guard's Drop give
            // it straight back instead of leaking it.
            return Err(SyncError::channel_closed_no_receivers());
        }
        // From here the slot is a transferred token, not a scope-bound
        // lock: it stays "spent" until `recv` frees it back, so forget
        // the guard instead of letting it auto-release.
        std::mem::forget(slot);
        let _lock = internals.send_lock.acquire_blocking(1);
        let tail = internals.header.load(CHAN_IDX_TAIL) as u32;
        internals.write_slot(tail, bytes);
        let next = (tail + 1) % internals.capacity();
        internals.header.store(CHAN_IDX_TAIL, next as i32);
        drop(_lock);
        internals.items_available.release(1);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.internals.closed_bits() != 0
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if self.disposed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            // Already disposed (explicitly, or as the source of a move):
            // the count was never incremented for this handle's current
            // state, so it must not be decremented either.
            return;
        }
        let remaining = self.internals.header.fetch_sub(CHAN_IDX_TX_COUNT, 1) - 1;
        if remaining == 0 {
            self.internals.mark_closed(TX_CLOSED);
            self.internals.items_available.release(CLOSE_WAKE_PERMITS);
        }
    }
}

pub struct Receiver {
    internals: Arc<ChannelInternals>,
    disposed: AtomicBool,
}

impl Clone for Receiver {
    fn clone(&self) -> Self {
        self.internals.header.fetch_add(CHAN_IDX_RX_COUNT, 1);
        Receiver {
            internals: Arc::clone(&self.internals),
            disposed: AtomicBool::new(false),
        }
    }
}

impl Receiver {
    /// The backing region this endpoint was built from.
    pub fn region(&self) -> &SharedRegion {
        &self.internals.backing
    }

    /// Mark this handle disposed without touching `rx_count` — the
    /// receiver-side mirror of [`Sender::dispose`].
    pub fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Dequeue the next message, blocking while the channel is empty.
    /// Returns `ChannelClosed` once every sender has dropped and the
    /// buffered backlog is exhausted (spec.md §4.8.4).
    pub fn recv(&self) -> Result<Vec<u8>> {
        if self.is_disposed() {
            return Err(SyncError::DisposedHandle);
        }
        let internals = &self.internals;
        let item = internals.items_available.acquire_blocking(1);
        let _lock = internals.recv_lock.acquire_blocking(1);
        let head = internals.header.load(CHAN_IDX_HEAD) as u32;
        let tail = internals.header.load(CHAN_IDX_TAIL) as u32;
        if head == tail {
            // Woken by the close flood with nothing left to drain;
            // the item token was never real, so let it drop normally.
            if internals.closed_bits() & TX_CLOSED != 0 {
                return Err(SyncError::channel_closed());
            }
            // Otherwise this permit was never backed by a real item —
            // a genuine bug, not a condition to retry around (spec.md
            // §4.8.3 treats it as a hard error).
            return Err(SyncError::SpuriousWakeup);
        }
        // An item really was consumed: it stays spent until the
        // corresponding send's slot is reused, not returned here.
        std::mem::forget(item);
        let bytes = internals.read_slot(head);
        let next = (head + 1) % internals.capacity();
        internals.header.store(CHAN_IDX_HEAD, next as i32);
        drop(_lock);
        internals.slots_available.release(1);
        Ok(bytes)
    }

    pub fn is_closed(&self) -> bool {
        let internals = &self.internals;
        let head = internals.header.load(CHAN_IDX_HEAD);
        let tail = internals.header.load(CHAN_IDX_TAIL);
        internals.closed_bits() & TX_CLOSED != 0 && head == tail
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.disposed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        let remaining = self.internals.header.fetch_sub(CHAN_IDX_RX_COUNT, 1) - 1;
        if remaining == 0 {
            self.internals.mark_closed(RX_CLOSED);
            self.internals.slots_available.release(CLOSE_WAKE_PERMITS);
        }
    }
}

impl Iterator for Receiver {
    type Item = std::result::Result<Vec<u8>, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.recv() {
            Ok(bytes) => Some(Ok(bytes)),
            Err(err) if err.is_closed() => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved_under_contention() {
        let (tx, rx) = bounded(8, 32);
        let producer = {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..1000u32 {
                    tx.send(&i.to_le_bytes()).unwrap();
                }
            })
        };
        drop(tx);
        let mut received = Vec::new();
        for _ in 0..1000 {
            let bytes = rx.recv().unwrap();
            received.push(u32::from_le_bytes(bytes.try_into().unwrap()));
        }
        producer.join().unwrap();
        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn recv_errs_after_all_senders_drop_and_backlog_drains() {
        let (tx, rx) = bounded(4, 16);
        tx.send(b"one").unwrap();
        tx.send(b"two").unwrap();
        drop(tx);

        assert_eq!(rx.recv().unwrap(), b"one");
        assert_eq!(rx.recv().unwrap(), b"two");
        let err = rx.recv().unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn send_errs_once_every_receiver_has_dropped() {
        let (tx, rx) = bounded(4, 16);
        drop(rx);
        let err = tx.send(b"hello").unwrap_err();
        assert!(matches!(
            err,
            SyncError::ChannelClosed { no_receivers: true }
        ));
    }

    #[test]
    fn blocked_receiver_wakes_on_close_instead_of_hanging() {
        let (tx, rx) = bounded(1, 16);
        let closer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            drop(tx);
        });
        let err = rx.recv().unwrap_err();
        assert!(err.is_closed());
        closer.join().unwrap();
    }

    #[test]
    fn receiver_as_iterator_stops_at_close() {
        let (tx, rx) = bounded(4, 16);
        tx.send(b"a").unwrap();
        tx.send(b"b").unwrap();
        drop(tx);
        let items: Vec<_> = rx.collect::<Result<_>>().unwrap();
        assert_eq!(items, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn sender_and_receiver_move_from_their_own_backing_region() {
        // A move must dispose the source first: the reconstructed handle
        // inherits the same counted slot rather than adding a new one.
        let (tx, rx) = bounded(4, 16);
        let region = tx.region().clone();
        tx.dispose();
        let tx2 = sender_from_region(region);

        tx2.send(b"hi").unwrap();
        assert_eq!(rx.recv().unwrap(), b"hi");

        let rx_region = rx.region().clone();
        rx.dispose();
        let rx2 = receiver_from_region(rx_region);

        tx2.send(b"again").unwrap();
        assert_eq!(rx2.recv().unwrap(), b"again");

        drop(tx2);
        drop(rx2);
        // That was the only sender/receiver slot throughout: once the
        // moved-to handles drop, the channel is closed for real.
        assert!(rx.is_closed() || rx.recv().unwrap_err().is_closed());
    }

    #[test]
    fn disposed_handle_is_an_error_on_send_and_recv() {
        let (tx, rx) = bounded(4, 16);
        tx.dispose();
        rx.dispose();
        assert!(matches!(tx.send(b"x"), Err(SyncError::DisposedHandle)));
        assert!(matches!(rx.recv(), Err(SyncError::DisposedHandle)));
    }

    #[test]
    fn disposing_does_not_affect_other_live_handles() {
        let (tx, rx) = bounded(4, 16);
        let tx2 = tx.clone();
        tx.dispose();
        assert!(matches!(tx.send(b"x"), Err(SyncError::DisposedHandle)));
        // tx2 is an independently counted clone; disposing tx must not
        // close the channel out from under it.
        tx2.send(b"still fine").unwrap();
        assert_eq!(rx.recv().unwrap(), b"still fine");
    }
}
