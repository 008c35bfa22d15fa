//! Stop-the-world compacting collector for the Shared-JSON Buffer
//! (spec.md §4.7.1, §4.7.5).
//!
//! Compaction builds an entirely fresh copy of the reachable graph in a
//! scratch buffer — reachable from `root_ptr`, every live pin, and every
//! outstanding temporary root — then copies that scratch buffer back over
//! the arena in one shot. Because the scratch copy is a separate
//! allocation, the original bytes stay intact (and `Heap::resolve`'s
//! MOVED-chain walk keeps working) for the entire duration of the walk.
//! Only pins and temp-root slots are rewritten in place; everything else
//! that used to point into the old layout is, by construction, either
//! already relinked through one of those two mechanisms or was garbage.
//!
//! The caller (`Heap::alloc`) already holds whatever Mutex/RwLock guards
//! the buffer, so nothing here takes its own lock over the region itself.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::layout::{
    ARRAY_ENTRY_STRIDE, NODE_OFFSET_CAPACITY, NODE_OFFSET_COUNT, NODE_OFFSET_ENTRIES,
    NODE_OFFSET_TAG, OBJECT_ENTRY_STRIDE, SJB_HEADER_SIZE, TAG_ARRAY, TAG_NUMBER, TAG_OBJECT,
    TAG_STRING,
};

use super::heap::Heap;

pub(crate) fn collect(heap: &Heap) -> Result<()> {
    let mut scratch = vec![0u8; heap.capacity];
    let mut free = SJB_HEADER_SIZE as u32;
    let mut moved: HashMap<u32, u32> = HashMap::new();

    let old_root = heap.root_ptr();
    let new_root = if old_root == 0 {
        0
    } else {
        let tag = heap.read_u32(heap.resolve(old_root) + NODE_OFFSET_TAG as u32);
        relocate(heap, &mut scratch, &mut free, &mut moved, old_root, tag)
    };

    {
        let mut pins = heap.pins().lock().unwrap();
        pins.retain(|weak| weak.strong_count() > 0);
        for weak in pins.iter() {
            let cell = weak.upgrade().expect("just retained as strong_count > 0");
            let old = cell.load(Ordering::SeqCst);
            if old != 0 {
                // Every JsonHandle pin addresses a container, which
                // self-tags, so the real tag can be read straight off it.
                let tag = heap.read_u32(heap.resolve(old) + NODE_OFFSET_TAG as u32);
                let new = relocate(heap, &mut scratch, &mut free, &mut moved, old, tag);
                cell.store(new, Ordering::SeqCst);
            }
        }
    }

    {
        let mut roots = heap.temp_roots().lock().unwrap();
        for (ptr, tag) in roots.iter_mut() {
            if *ptr != 0 {
                *ptr = relocate(heap, &mut scratch, &mut free, &mut moved, *ptr, *tag);
            }
        }
    }

    heap.region().write_bytes(0, &scratch[..free as usize]);
    heap.set_free_ptr(free);
    heap.set_root_ptr(new_root);
    heap.clear_caches();
    Ok(())
}

/// Copy the node at `old_ptr` (of the given `tag`) and everything it
/// reaches into `scratch`, returning its new address. Containers are
/// deduplicated through `moved` so a node referenced from more than one
/// live root (e.g. a pin into a subtree also reachable from `root_ptr`)
/// is relocated exactly once.
fn relocate(
    heap: &Heap,
    scratch: &mut [u8],
    free: &mut u32,
    moved: &mut HashMap<u32, u32>,
    old_ptr: u32,
    tag: u32,
) -> u32 {
    if old_ptr == 0 {
        return 0;
    }

    if tag == TAG_OBJECT || tag == TAG_ARRAY {
        let live = heap.resolve(old_ptr);
        if let Some(&new_ptr) = moved.get(&live) {
            return new_ptr;
        }
        let new_ptr = if tag == TAG_OBJECT {
            relocate_object(heap, scratch, free, moved, live)
        } else {
            relocate_array(heap, scratch, free, moved, live)
        };
        moved.insert(live, new_ptr);
        return new_ptr;
    }

    if tag == TAG_NUMBER {
        let value = heap.read_f64(old_ptr);
        let new_ptr = bump(scratch, free, 8);
        scratch[new_ptr as usize..new_ptr as usize + 8].copy_from_slice(&value.to_le_bytes());
        return new_ptr;
    }

    if tag == TAG_STRING {
        let len = heap.read_u32(old_ptr);
        let bytes = heap.region().read_bytes(old_ptr as usize + 4, len as usize);
        let new_ptr = bump(scratch, free, 4 + len as usize);
        let start = new_ptr as usize;
        scratch[start..start + 4].copy_from_slice(&len.to_le_bytes());
        scratch[start + 4..start + 4 + len as usize].copy_from_slice(&bytes);
        return new_ptr;
    }

    // NULL/TRUE/FALSE never allocate a node; a caller that hands us one
    // of those tags alongside a non-zero pointer has a corrupted root.
    unreachable!("temp root/pin with inline tag {tag} and non-zero pointer {old_ptr}");
}

fn relocate_object(
    heap: &Heap,
    scratch: &mut [u8],
    free: &mut u32,
    moved: &mut HashMap<u32, u32>,
    live: u32,
) -> u32 {
    let capacity = heap.read_u32(live + NODE_OFFSET_CAPACITY as u32);
    let count = heap.read_u32(live + NODE_OFFSET_COUNT as u32);
    let size = NODE_OFFSET_ENTRIES + capacity as usize * OBJECT_ENTRY_STRIDE;
    let new_ptr = bump(scratch, free, size);

    write_node_header(scratch, new_ptr, TAG_OBJECT, capacity, count);
    // Registering the shell before walking children lets a self-referential
    // or repeatedly-pinned subtree terminate through the `moved` map
    // instead of recursing forever.
    moved.insert(live, new_ptr);

    for index in 0..count {
        let src = live + NODE_OFFSET_ENTRIES as u32 + index * OBJECT_ENTRY_STRIDE as u32;
        let key_ptr = heap.read_u32(src);
        let value_tag = heap.read_u32(src + 4);
        let value_payload = heap.read_u32(src + 8);

        let new_key_ptr = relocate(heap, scratch, free, moved, key_ptr, TAG_STRING);
        let new_payload = relocate(heap, scratch, free, moved, value_payload, value_tag);

        let dst = new_ptr + NODE_OFFSET_ENTRIES as u32 + index * OBJECT_ENTRY_STRIDE as u32;
        write_u32(scratch, dst, new_key_ptr);
        write_u32(scratch, dst + 4, value_tag);
        write_u32(scratch, dst + 8, new_payload);
    }

    new_ptr
}

fn relocate_array(
    heap: &Heap,
    scratch: &mut [u8],
    free: &mut u32,
    moved: &mut HashMap<u32, u32>,
    live: u32,
) -> u32 {
    let capacity = heap.read_u32(live + NODE_OFFSET_CAPACITY as u32);
    let count = heap.read_u32(live + NODE_OFFSET_COUNT as u32);
    let size = NODE_OFFSET_ENTRIES + capacity as usize * ARRAY_ENTRY_STRIDE;
    let new_ptr = bump(scratch, free, size);

    write_node_header(scratch, new_ptr, TAG_ARRAY, capacity, count);
    moved.insert(live, new_ptr);

    for index in 0..count {
        let src = live + NODE_OFFSET_ENTRIES as u32 + index * ARRAY_ENTRY_STRIDE as u32;
        let value_tag = heap.read_u32(src);
        let value_payload = heap.read_u32(src + 4);

        let new_payload = relocate(heap, scratch, free, moved, value_payload, value_tag);

        let dst = new_ptr + NODE_OFFSET_ENTRIES as u32 + index * ARRAY_ENTRY_STRIDE as u32;
        write_u32(scratch, dst, value_tag);
        write_u32(scratch, dst + 4, new_payload);
    }

    new_ptr
}

fn write_node_header(scratch: &mut [u8], ptr: u32, tag: u32, capacity: u32, count: u32) {
    write_u32(scratch, ptr + NODE_OFFSET_TAG as u32, tag);
    write_u32(scratch, ptr + NODE_OFFSET_CAPACITY as u32, capacity);
    write_u32(scratch, ptr + NODE_OFFSET_COUNT as u32, count);
}

fn write_u32(scratch: &mut [u8], offset: u32, value: u32) {
    let start = offset as usize;
    scratch[start..start + 4].copy_from_slice(&value.to_le_bytes());
}

fn bump(scratch: &[u8], free: &mut u32, size: usize) -> u32 {
    let aligned = crate::layout::align_up(size, crate::layout::SJB_ALIGNMENT) as u32;
    let ptr = *free;
    *free += aligned;
    assert!(
        *free as usize <= scratch.len(),
        "scratch buffer sized to the original arena must always fit a compacted copy"
    );
    ptr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::heap::Heap;
    use crate::layout::TAG_NUMBER;

    #[test]
    fn collect_compacts_surviving_root_and_frees_garbage() {
        let heap = Heap::new(65536);
        let mut ptr = heap.alloc_object_node(1).unwrap();
        for i in 0..20 {
            let key = format!("k{i}");
            let payload = heap.alloc_number(i as f64).unwrap();
            ptr = heap.object_set(ptr, &key, TAG_NUMBER, payload).unwrap();
        }
        heap.set_root_ptr(ptr);
        let free_before = heap.free_ptr();

        // Force a GC: this growth no longer fits, so `alloc` collects first.
        let live = heap.resolve(heap.root_ptr());
        let capacity = heap.read_u32(live + NODE_OFFSET_CAPACITY as u32);
        assert!(capacity >= 20);

        collect(&heap).unwrap();

        let root = heap.resolve(heap.root_ptr());
        assert_eq!(heap.object_count(root), 20);
        for i in 0..20 {
            let (_, lookup) = heap.find_entry(root, &format!("k{i}"));
            let payload = match lookup {
                crate::json::heap::Lookup::Found { payload, .. } => payload,
                crate::json::heap::Lookup::Missing => panic!("key k{i} missing after gc"),
            };
            assert_eq!(heap.read_f64(payload), i as f64);
        }
        // Compaction discards the growth history (old MOVED husks), so the
        // post-GC arena is never larger than what was live before.
        assert!(heap.free_ptr() <= free_before);
    }

    #[test]
    fn collect_with_no_root_resets_to_header() {
        let heap = Heap::new(4096);
        collect(&heap).unwrap();
        assert_eq!(heap.root_ptr(), 0);
        assert_eq!(heap.free_ptr(), SJB_HEADER_SIZE as u32);
    }

    #[test]
    fn collect_follows_pinned_handle_independent_of_root() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let heap = Heap::new(65536);
        let obj = heap.alloc_object_node(4).unwrap();
        let payload = heap.alloc_number(42.0).unwrap();
        let obj = heap.object_set(obj, "answer", TAG_NUMBER, payload).unwrap();

        // Not reachable from root_ptr (still 0), only from the pin.
        let cell = Arc::new(AtomicU32::new(obj));
        heap.register_pin(&cell);

        collect(&heap).unwrap();

        let new_ptr = cell.load(Ordering::SeqCst);
        assert_ne!(new_ptr, 0);
        let (_, lookup) = heap.find_entry(new_ptr, "answer");
        assert!(matches!(lookup, crate::json::heap::Lookup::Found { .. }));
    }
}
