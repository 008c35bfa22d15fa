//! Low-level Shared-JSON-Buffer node layout: the bump allocator, node
//! field accessors, and MOVED-chain resolution (spec.md §4.7.1–§4.7.2).
//!
//! Every function here operates on raw heap bytes and assumes the caller
//! already holds whatever Mutex/RwLock guards the buffer — spec.md §3
//! invariant 3 is what makes the plain (non-atomic) reads and writes in
//! [`SharedRegion::read_bytes`]/[`SharedRegion::write_bytes`] sound.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Result, SyncError};
use crate::layout::{
    align_up, ARRAY_ENTRY_STRIDE, NODE_OFFSET_CAPACITY, NODE_OFFSET_COUNT, NODE_OFFSET_ENTRIES,
    NODE_OFFSET_TAG, OBJECT_ENTRY_STRIDE, SJB_ALIGNMENT, SJB_HEADER_SIZE, SJB_OFFSET_FREE_PTR,
    SJB_OFFSET_ROOT_PTR, TAG_ARRAY, TAG_FALSE, TAG_MOVED, TAG_NULL, TAG_NUMBER, TAG_OBJECT,
    TAG_STRING, TAG_TRUE,
};
use crate::region::SharedRegion;

use super::interner::StringInterner;

/// Sentinel returned by [`Heap::find_entry`] to distinguish "key absent"
/// from "key present with a `null` value" (spec.md §4.7.4.4).
pub(crate) enum Lookup {
    Found { index: u32, tag: u32, payload: u32 },
    Missing,
}

/// The mutable arena state shared by every [`super::value::JsonHandle`]
/// bound to one [`super::value::SharedJsonBuffer`].
pub struct Heap {
    pub(crate) region: SharedRegion,
    pub(crate) capacity: usize,
    pub(crate) interner: StringInterner,
    pub(crate) hints: Mutex<HashMap<(u32, String), u32>>,
    pub(crate) pins: Mutex<Vec<Weak<AtomicU32>>>,
    /// `(ptr, tag)` pairs. The tag is recorded by the pusher because leaf
    /// payload nodes (NUMBER/STRING) don't self-tag the way OBJECT/ARRAY
    /// nodes do, so a bare address alone isn't enough for the collector
    /// to know how to walk it.
    pub(crate) temp_roots: Mutex<Vec<(u32, u32)>>,
}

impl Heap {
    pub(crate) fn new(capacity: usize) -> Self {
        let region = SharedRegion::new(capacity);
        region.store(word_index(SJB_OFFSET_FREE_PTR), SJB_HEADER_SIZE as i32);
        region.store(word_index(SJB_OFFSET_ROOT_PTR), 0);
        Heap {
            region,
            capacity,
            interner: StringInterner::new(),
            hints: Mutex::new(HashMap::new()),
            pins: Mutex::new(Vec::new()),
            temp_roots: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn from_region(region: SharedRegion) -> Self {
        let capacity = region.capacity();
        Heap {
            region,
            capacity,
            interner: StringInterner::new(),
            hints: Mutex::new(HashMap::new()),
            pins: Mutex::new(Vec::new()),
            temp_roots: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub(crate) fn free_ptr(&self) -> u32 {
        self.region.load(word_index(SJB_OFFSET_FREE_PTR)) as u32
    }

    pub(crate) fn set_free_ptr(&self, value: u32) {
        self.region.store(word_index(SJB_OFFSET_FREE_PTR), value as i32);
    }

    pub(crate) fn root_ptr(&self) -> u32 {
        self.region.load(word_index(SJB_OFFSET_ROOT_PTR)) as u32
    }

    pub(crate) fn set_root_ptr(&self, value: u32) {
        self.region.store(word_index(SJB_OFFSET_ROOT_PTR), value as i32);
    }

    pub(crate) fn register_pin(&self, cell: &Arc<AtomicU32>) {
        self.pins.lock().unwrap().push(Arc::downgrade(cell));
    }

    /// Push `ptr` (a node of the given `tag`) onto the temporary-root
    /// stack for the lifetime of the returned guard (spec.md §4.7.5). Any
    /// allocation that runs while the guard is alive may trigger a GC; the
    /// guard's slot is rewritten in place by compaction, so
    /// [`TempRoot::get`] always returns an address valid in the *current*
    /// arena, never a stale one.
    pub(crate) fn push_temp_root(&self, ptr: u32, tag: u32) -> TempRoot<'_> {
        let index = {
            let mut roots = self.temp_roots.lock().unwrap();
            roots.push((ptr, tag));
            roots.len() - 1
        };
        TempRoot { heap: self, index }
    }

    pub(crate) fn pins(&self) -> &Mutex<Vec<Weak<AtomicU32>>> {
        &self.pins
    }

    pub(crate) fn temp_roots(&self) -> &Mutex<Vec<(u32, u32)>> {
        &self.temp_roots
    }

    pub(crate) fn clear_caches(&self) {
        self.interner.clear();
        self.hints.lock().unwrap().clear();
    }

    // ===== raw field access =====

    pub(crate) fn read_u32(&self, offset: u32) -> u32 {
        let bytes = self.region.read_bytes(offset as usize, 4);
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    pub(crate) fn write_u32(&self, offset: u32, value: u32) {
        self.region.write_bytes(offset as usize, &value.to_le_bytes());
    }

    pub(crate) fn read_f64(&self, offset: u32) -> f64 {
        let bytes = self.region.read_bytes(offset as usize, 8);
        f64::from_le_bytes(bytes.try_into().unwrap())
    }

    pub(crate) fn write_f64(&self, offset: u32, value: f64) {
        self.region.write_bytes(offset as usize, &value.to_le_bytes());
    }

    pub(crate) fn read_string_at(&self, ptr: u32) -> String {
        self.interner.get_or_decode(&self.region, ptr)
    }

    /// Follow a MOVED chain to the live node. Every live payload either
    /// points at a non-MOVED node or is the caller's own leaf tag/payload
    /// pair (spec.md §4.7.2).
    pub(crate) fn resolve(&self, ptr: u32) -> u32 {
        let mut current = ptr;
        loop {
            let tag = self.read_u32(current + NODE_OFFSET_TAG as u32);
            if tag == TAG_MOVED {
                current = self.read_u32(current + 4);
            } else {
                return current;
            }
        }
    }

    // ===== allocation =====

    fn try_bump(&self, size: usize) -> Option<u32> {
        let aligned = align_up(size, SJB_ALIGNMENT) as u32;
        let free = self.free_ptr();
        let new_free = free as u64 + aligned as u64;
        if new_free as usize > self.capacity {
            return None;
        }
        self.set_free_ptr(new_free as u32);
        Some(free)
    }

    /// Bump-allocate `size` bytes, compacting exactly once on failure
    /// before giving up with [`SyncError::HeapExhausted`] (spec.md §4.7.1).
    pub(crate) fn alloc(&self, size: usize) -> Result<u32> {
        if let Some(ptr) = self.try_bump(size) {
            return Ok(ptr);
        }
        super::gc::collect(self)?;
        self.try_bump(size).ok_or(SyncError::HeapExhausted)
    }

    pub(crate) fn alloc_number(&self, value: f64) -> Result<u32> {
        let ptr = self.alloc(8)?;
        self.write_f64(ptr, value);
        Ok(ptr)
    }

    pub(crate) fn alloc_string(&self, value: &str) -> Result<u32> {
        let bytes = value.as_bytes();
        let ptr = self.alloc(4 + bytes.len())?;
        self.write_u32(ptr, bytes.len() as u32);
        self.region.write_bytes((ptr + 4) as usize, bytes);
        Ok(ptr)
    }

    pub(crate) fn alloc_object_node(&self, capacity: u32) -> Result<u32> {
        let size = NODE_OFFSET_ENTRIES + capacity as usize * OBJECT_ENTRY_STRIDE;
        let ptr = self.alloc(size)?;
        self.write_u32(ptr + NODE_OFFSET_TAG as u32, TAG_OBJECT);
        self.write_u32(ptr + NODE_OFFSET_CAPACITY as u32, capacity);
        self.write_u32(ptr + NODE_OFFSET_COUNT as u32, 0);
        let entries_len = capacity as usize * OBJECT_ENTRY_STRIDE;
        if entries_len > 0 {
            self.region
                .write_bytes((ptr as usize) + NODE_OFFSET_ENTRIES, &vec![0u8; entries_len]);
        }
        Ok(ptr)
    }

    pub(crate) fn alloc_array_node(&self, capacity: u32) -> Result<u32> {
        let size = NODE_OFFSET_ENTRIES + capacity as usize * ARRAY_ENTRY_STRIDE;
        let ptr = self.alloc(size)?;
        self.write_u32(ptr + NODE_OFFSET_TAG as u32, TAG_ARRAY);
        self.write_u32(ptr + NODE_OFFSET_CAPACITY as u32, capacity);
        self.write_u32(ptr + NODE_OFFSET_COUNT as u32, 0);
        let entries_len = capacity as usize * ARRAY_ENTRY_STRIDE;
        if entries_len > 0 {
            self.region
                .write_bytes((ptr as usize) + NODE_OFFSET_ENTRIES, &vec![0u8; entries_len]);
        }
        Ok(ptr)
    }

    // ===== object entries =====

    pub(crate) fn object_capacity(&self, live: u32) -> u32 {
        self.read_u32(live + NODE_OFFSET_CAPACITY as u32)
    }

    pub(crate) fn object_count(&self, live: u32) -> u32 {
        self.read_u32(live + NODE_OFFSET_COUNT as u32)
    }

    fn object_entry_offset(live: u32, index: u32) -> u32 {
        live + NODE_OFFSET_ENTRIES as u32 + index * OBJECT_ENTRY_STRIDE as u32
    }

    /// Look up `key`, populating the hint cache on a scan hit. For writers
    /// (`object_set`/`object_delete`) that go on to mutate this same entry,
    /// so the cache stays warm for whatever comes next.
    pub(crate) fn find_entry(&self, ptr: u32, key: &str) -> (u32, Lookup) {
        self.find_entry_impl(ptr, key, true)
    }

    /// Read-only lookup: identical to [`Self::find_entry`] but never writes
    /// into `self.hints`. Pure readers (`JsonHandle::get`/`get_handle`,
    /// container snapshotting) must use this — a read taken under a
    /// `RwLock` read guard must not mutate shared cache state.
    pub(crate) fn find_entry_readonly(&self, ptr: u32, key: &str) -> (u32, Lookup) {
        self.find_entry_impl(ptr, key, false)
    }

    fn find_entry_impl(&self, ptr: u32, key: &str, cache_writes: bool) -> (u32, Lookup) {
        let live = self.resolve(ptr);
        if let Some(&cached_index) = self.hints.lock().unwrap().get(&(live, key.to_string())) {
            let count = self.object_count(live);
            if cached_index < count {
                let offset = Self::object_entry_offset(live, cached_index);
                let key_ptr = self.read_u32(offset);
                if self.read_string_at(key_ptr) == key {
                    let tag = self.read_u32(offset + 4);
                    let payload = self.read_u32(offset + 8);
                    return (live, Lookup::Found { index: cached_index, tag, payload });
                }
            }
        }
        let count = self.object_count(live);
        for index in 0..count {
            let offset = Self::object_entry_offset(live, index);
            let key_ptr = self.read_u32(offset);
            if self.read_string_at(key_ptr) == key {
                if cache_writes {
                    self.hints
                        .lock()
                        .unwrap()
                        .insert((live, key.to_string()), index);
                }
                let tag = self.read_u32(offset + 4);
                let payload = self.read_u32(offset + 8);
                return (live, Lookup::Found { index, tag, payload });
            }
        }
        (live, Lookup::Missing)
    }

    /// Insert or overwrite `key`'s entry, growing (and forwarding) the
    /// node if it's at capacity. Returns the (possibly new) live pointer.
    ///
    /// Both `ptr` and, when it addresses a heap node, `payload` are
    /// temp-rooted for the whole call: `alloc_string` (for the key) and
    /// `grow_object` can each trigger a compacting GC before `payload` is
    /// ever written into an entry, and a value built by the caller in the
    /// same breath as this call (an object/array shell still being
    /// populated, say) has no other root yet.
    pub(crate) fn object_set(&self, ptr: u32, key: &str, tag: u32, payload: u32) -> Result<u32> {
        let root = self.push_temp_root(ptr, TAG_OBJECT);
        let value_root = (payload != 0).then(|| self.push_temp_root(payload, tag));
        let current_payload = || value_root.as_ref().map_or(payload, TempRoot::get);
        loop {
            let (live, lookup) = self.find_entry(root.get(), key);
            if let Lookup::Found { index, .. } = lookup {
                let offset = Self::object_entry_offset(live, index);
                self.write_u32(offset + 4, tag);
                self.write_u32(offset + 8, current_payload());
                return Ok(live);
            }

            let capacity = self.object_capacity(live);
            let count = self.object_count(live);
            if count < capacity {
                let key_ptr = self.alloc_string(key)?;
                let live = self.resolve(root.get());
                let count = self.object_count(live);
                let capacity = self.object_capacity(live);
                if count < capacity {
                    let offset = Self::object_entry_offset(live, count);
                    self.write_u32(offset, key_ptr);
                    self.write_u32(offset + 4, tag);
                    self.write_u32(offset + 8, current_payload());
                    self.write_u32(live + NODE_OFFSET_COUNT as u32, count + 1);
                    return Ok(live);
                }
                continue;
            }

            self.grow_object(root.get())?;
        }
    }

    fn grow_object(&self, ptr: u32) -> Result<u32> {
        let root = self.push_temp_root(ptr, TAG_OBJECT);
        let live = self.resolve(root.get());
        let old_capacity = self.object_capacity(live);
        let new_capacity = (old_capacity * 2).max(4);
        let new_ptr = self.alloc_object_node(new_capacity)?;
        let live = self.resolve(root.get());
        let count = self.object_count(live);
        for index in 0..count {
            let src = Self::object_entry_offset(live, index);
            let dst = Self::object_entry_offset(new_ptr, index);
            let bytes = self.region.read_bytes(src as usize, OBJECT_ENTRY_STRIDE);
            self.region.write_bytes(dst as usize, &bytes);
        }
        self.write_u32(new_ptr + NODE_OFFSET_COUNT as u32, count);
        self.write_u32(live + NODE_OFFSET_TAG as u32, TAG_MOVED);
        self.write_u32(live + 4, new_ptr);
        self.hints.lock().unwrap().retain(|(p, _), _| *p != live);
        Ok(new_ptr)
    }

    /// Swap-with-last then decrement count (spec.md §4.7.4's delete).
    /// Returns `true` if the key was present.
    pub(crate) fn object_delete(&self, ptr: u32, key: &str) -> bool {
        let (live, lookup) = self.find_entry(ptr, key);
        let Lookup::Found { index, .. } = lookup else {
            return false;
        };
        let count = self.object_count(live);
        let last = count - 1;
        if index != last {
            let src = Self::object_entry_offset(live, last);
            let dst = Self::object_entry_offset(live, index);
            let bytes = self.region.read_bytes(src as usize, OBJECT_ENTRY_STRIDE);
            self.region.write_bytes(dst as usize, &bytes);
        }
        self.write_u32(Self::object_entry_offset(live, last), 0);
        self.write_u32(Self::object_entry_offset(live, last) + 4, TAG_NULL);
        self.write_u32(Self::object_entry_offset(live, last) + 8, 0);
        self.write_u32(live + NODE_OFFSET_COUNT as u32, last);
        self.hints.lock().unwrap().retain(|(p, _), _| *p != live);
        true
    }

    pub(crate) fn object_keys(&self, ptr: u32) -> Vec<String> {
        let live = self.resolve(ptr);
        let count = self.object_count(live);
        (0..count)
            .map(|index| {
                let offset = Self::object_entry_offset(live, index);
                let key_ptr = self.read_u32(offset);
                self.read_string_at(key_ptr)
            })
            .collect()
    }

    // ===== array entries =====

    fn array_entry_offset(live: u32, index: u32) -> u32 {
        live + NODE_OFFSET_ENTRIES as u32 + index * ARRAY_ENTRY_STRIDE as u32
    }

    pub(crate) fn array_capacity(&self, live: u32) -> u32 {
        self.read_u32(live + NODE_OFFSET_CAPACITY as u32)
    }

    pub(crate) fn array_len(&self, live: u32) -> u32 {
        self.read_u32(live + NODE_OFFSET_COUNT as u32)
    }

    pub(crate) fn array_get(&self, ptr: u32, index: u32) -> Option<(u32, u32)> {
        let live = self.resolve(ptr);
        if index >= self.array_len(live) {
            return None;
        }
        let offset = Self::array_entry_offset(live, index);
        Some((self.read_u32(offset), self.read_u32(offset + 4)))
    }

    pub(crate) fn array_set(&self, ptr: u32, index: u32, tag: u32, payload: u32) -> Option<u32> {
        let live = self.resolve(ptr);
        if index >= self.array_len(live) {
            return None;
        }
        let offset = Self::array_entry_offset(live, index);
        self.write_u32(offset, tag);
        self.write_u32(offset + 4, payload);
        Some(live)
    }

    /// Append one element, growing (and forwarding) as needed. Returns
    /// the (possibly new) live pointer. See [`Self::object_set`] for why
    /// `payload` is temp-rooted alongside `ptr`.
    pub(crate) fn array_push(&self, ptr: u32, tag: u32, payload: u32) -> Result<u32> {
        let root = self.push_temp_root(ptr, TAG_ARRAY);
        let value_root = (payload != 0).then(|| self.push_temp_root(payload, tag));
        let current_payload = || value_root.as_ref().map_or(payload, TempRoot::get);
        loop {
            let live = self.resolve(root.get());
            let capacity = self.array_capacity(live);
            let len = self.array_len(live);
            if len < capacity {
                let offset = Self::array_entry_offset(live, len);
                self.write_u32(offset, tag);
                self.write_u32(offset + 4, current_payload());
                self.write_u32(live + NODE_OFFSET_COUNT as u32, len + 1);
                return Ok(live);
            }
            self.grow_array(root.get())?;
        }
    }

    fn grow_array(&self, ptr: u32) -> Result<u32> {
        let root = self.push_temp_root(ptr, TAG_ARRAY);
        let live = self.resolve(root.get());
        let capacity = self.array_capacity(live);
        let new_capacity = (capacity * 2).max(4);
        let new_ptr = self.alloc_array_node(new_capacity)?;
        let live = self.resolve(root.get());
        let len = self.array_len(live);
        for index in 0..len {
            let src = Self::array_entry_offset(live, index);
            let dst = Self::array_entry_offset(new_ptr, index);
            let bytes = self.region.read_bytes(src as usize, ARRAY_ENTRY_STRIDE);
            self.region.write_bytes(dst as usize, &bytes);
        }
        self.write_u32(new_ptr + NODE_OFFSET_COUNT as u32, len);
        self.write_u32(live + NODE_OFFSET_TAG as u32, TAG_MOVED);
        self.write_u32(live + 4, new_ptr);
        Ok(new_ptr)
    }

    /// Remove and return the last element's (tag, payload), if any.
    pub(crate) fn array_pop(&self, ptr: u32) -> Option<(u32, u32)> {
        let live = self.resolve(ptr);
        let len = self.array_len(live);
        if len == 0 {
            return None;
        }
        let offset = Self::array_entry_offset(live, len - 1);
        let result = (self.read_u32(offset), self.read_u32(offset + 4));
        self.write_u32(offset, TAG_NULL);
        self.write_u32(offset + 4, 0);
        self.write_u32(live + NODE_OFFSET_COUNT as u32, len - 1);
        Some(result)
    }

    // ===== leaf tag helpers =====

    pub(crate) fn is_leaf_tag(tag: u32) -> bool {
        tag == TAG_NULL || tag == TAG_TRUE || tag == TAG_FALSE
    }

    pub(crate) fn is_number(tag: u32) -> bool {
        tag == TAG_NUMBER
    }

    pub(crate) fn is_string(tag: u32) -> bool {
        tag == TAG_STRING
    }

    pub(crate) fn is_container(tag: u32) -> bool {
        tag == TAG_OBJECT || tag == TAG_ARRAY
    }
}

/// RAII handle into one slot of the heap's temporary-root stack.
///
/// A compacting [`super::gc::collect`] relocates everything reachable from
/// `root_ptr`, every live pin, and every outstanding `TempRoot` slot, then
/// overwrites the rest of the arena — so a bare `u32` held across any call
/// that might allocate is not safe to dereference afterwards. Wrapping it
/// in a `TempRoot` keeps the slot current across the call; always re-read
/// [`Self::get`] rather than trusting the pointer you pushed with.
pub(crate) struct TempRoot<'a> {
    heap: &'a Heap,
    index: usize,
}

impl<'a> TempRoot<'a> {
    pub(crate) fn get(&self) -> u32 {
        self.heap.temp_roots.lock().unwrap()[self.index].0
    }

    pub(crate) fn set(&self, ptr: u32) {
        self.heap.temp_roots.lock().unwrap()[self.index].0 = ptr;
    }
}

impl<'a> Drop for TempRoot<'a> {
    fn drop(&mut self) {
        let mut roots = self.heap.temp_roots.lock().unwrap();
        // Guards are pushed and dropped in strict LIFO order by every
        // caller in this module, matching spec.md's "temporary-root stack".
        debug_assert_eq!(self.index, roots.len() - 1, "temp roots released out of order");
        roots.truncate(self.index);
    }
}

fn word_index(byte_offset: usize) -> u32 {
    (byte_offset / 4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_insert_and_lookup() {
        let heap = Heap::new(4096);
        let ptr = heap.alloc_object_node(4).unwrap();
        let updated = heap.object_set(ptr, "a", TAG_NUMBER, heap.alloc_number(1.0).unwrap()).unwrap();
        assert_eq!(updated, ptr);
        let (_, lookup) = heap.find_entry(ptr, "a");
        assert!(matches!(lookup, Lookup::Found { tag, .. } if tag == TAG_NUMBER));
    }

    #[test]
    fn object_grows_past_capacity() {
        let heap = Heap::new(65536);
        let mut ptr = heap.alloc_object_node(1).unwrap();
        for i in 0..10 {
            let key = format!("k{i}");
            let payload = heap.alloc_number(i as f64).unwrap();
            ptr = heap.object_set(ptr, &key, TAG_NUMBER, payload).unwrap();
        }
        assert_eq!(heap.object_count(heap.resolve(ptr)), 10);
    }

    #[test]
    fn array_push_pop_round_trip() {
        let heap = Heap::new(4096);
        let mut ptr = heap.alloc_array_node(1).unwrap();
        for i in 0..5 {
            ptr = heap.array_push(ptr, TAG_NUMBER, heap.alloc_number(i as f64).unwrap()).unwrap();
        }
        assert_eq!(heap.array_len(heap.resolve(ptr)), 5);
        let (tag, payload) = heap.array_pop(ptr).unwrap();
        assert_eq!(tag, TAG_NUMBER);
        assert_eq!(heap.read_f64(payload), 4.0);
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let heap = Heap::new(4096);
        let ptr = heap.alloc_object_node(4).unwrap();
        assert!(!heap.object_delete(ptr, "missing"));
    }
}
