//! The public Shared-JSON Buffer surface: [`SharedJsonBuffer`] and
//! [`JsonHandle`] (spec.md §4.7.3–§4.7.6).
//!
//! A handle pins the live pointer it currently addresses via
//! [`Heap::register_pin`] so that a compacting GC running underneath a
//! long-lived handle relocates it instead of leaving it dangling — the
//! same mechanism a temp root gives a value mid-construction, just scoped
//! to the handle's own lifetime instead of one call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use crate::error::{Result, SyncError};
use crate::layout::{
    NODE_OFFSET_TAG, TAG_ARRAY, TAG_FALSE, TAG_NULL, TAG_NUMBER, TAG_OBJECT, TAG_STRING, TAG_TRUE,
};
use crate::region::SharedRegion;

use super::heap::{Heap, Lookup};

const DEFAULT_CAPACITY: usize = 1 << 20; // 1 MiB, per the runtime's default config

/// A shared, GC-managed JSON document. Cheap to clone: every clone shares
/// the same underlying arena (spec.md §4.7's "SJB instance").
#[derive(Clone)]
pub struct SharedJsonBuffer {
    heap: Arc<Heap>,
}

impl SharedJsonBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SharedJsonBuffer {
            heap: Arc::new(Heap::new(capacity)),
        }
    }

    pub fn from_region(region: SharedRegion) -> Self {
        SharedJsonBuffer {
            heap: Arc::new(Heap::from_region(region)),
        }
    }

    pub fn region(&self) -> &SharedRegion {
        self.heap.region()
    }

    /// A handle onto the top-level node, allocating an empty object the
    /// first time a fresh buffer is rooted (spec.md: "root_ptr addresses
    /// the top-level object/array node").
    pub fn root(&self) -> Result<JsonHandle> {
        let existing = self.heap.root_ptr();
        let ptr = if existing != 0 {
            existing
        } else {
            let ptr = self.heap.alloc_object_node(4)?;
            self.heap.set_root_ptr(ptr);
            ptr
        };
        Ok(JsonHandle::new(Arc::clone(&self.heap), ptr))
    }
}

impl Default for SharedJsonBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A live, pinned reference to one object or array node inside a
/// [`SharedJsonBuffer`]. Scalars are never wrapped in a handle — reading
/// one back from `get`/`get_index`/`pop` yields a materialized
/// [`serde_json::Value`] directly.
#[derive(Clone)]
pub struct JsonHandle {
    heap: Arc<Heap>,
    cell: Arc<AtomicU32>,
}

impl JsonHandle {
    fn new(heap: Arc<Heap>, ptr: u32) -> Self {
        let cell = Arc::new(AtomicU32::new(heap.resolve(ptr)));
        heap.register_pin(&cell);
        JsonHandle { heap, cell }
    }

    fn live(&self) -> u32 {
        self.heap.resolve(self.cell.load(Ordering::Acquire))
    }

    fn set_live(&self, ptr: u32) {
        self.cell.store(ptr, Ordering::Release);
    }

    fn tag(&self) -> u32 {
        self.heap.read_u32(self.live() + NODE_OFFSET_TAG as u32)
    }

    pub fn is_object(&self) -> bool {
        self.tag() == TAG_OBJECT
    }

    pub fn is_array(&self) -> bool {
        self.tag() == TAG_ARRAY
    }

    pub fn len(&self) -> u32 {
        let live = self.live();
        if self.tag() == TAG_ARRAY {
            self.heap.array_len(live)
        } else {
            self.heap.object_count(live)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Object property lookup. `None` if `key` is absent; a present `null`
    /// comes back as `Some(Value::Null)` (spec.md §4.7.4.4 distinguishes
    /// the two).
    pub fn get(&self, key: &str) -> Option<Value> {
        let (_, lookup) = self.heap.find_entry_readonly(self.live(), key);
        match lookup {
            Lookup::Found { tag, payload, .. } => Some(self.materialize(tag, payload)),
            Lookup::Missing => None,
        }
    }

    pub fn get_index(&self, index: u32) -> Option<Value> {
        let (tag, payload) = self.heap.array_get(self.live(), index)?;
        Some(self.materialize(tag, payload))
    }

    /// If `key` addresses a nested object/array, return a handle onto it
    /// rather than a materialized snapshot, so further mutation goes
    /// straight to the shared arena.
    pub fn get_handle(&self, key: &str) -> Option<JsonHandle> {
        let (_, lookup) = self.heap.find_entry_readonly(self.live(), key);
        match lookup {
            Lookup::Found { tag, payload, .. } if Heap::is_container(tag) => {
                Some(JsonHandle::new(Arc::clone(&self.heap), payload))
            }
            _ => None,
        }
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let (tag, payload) = self.alloc_value(value)?;
        let new_live = self.heap.object_set(self.live(), key, tag, payload)?;
        self.set_live(new_live);
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.heap.object_delete(self.live(), key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.heap.object_keys(self.live())
    }

    pub fn push(&self, value: Value) -> Result<()> {
        let (tag, payload) = self.alloc_value(value)?;
        let new_live = self.heap.array_push(self.live(), tag, payload)?;
        self.set_live(new_live);
        Ok(())
    }

    pub fn pop(&self) -> Option<Value> {
        let (tag, payload) = self.heap.array_pop(self.live())?;
        Some(self.materialize(tag, payload))
    }

    /// Snapshot the whole subtree rooted at this handle into an owned
    /// `serde_json::Value`.
    pub fn to_value(&self) -> Value {
        self.materialize_container(self.live())
    }

    /// Overwrite this handle's contents with `value`'s top-level entries.
    /// `value` must be an object if this handle is an object, and an
    /// array if it's an array (spec.md's root is always one or the
    /// other, never a bare scalar).
    pub fn set_from_value(&self, value: Value) -> Result<()> {
        match (self.tag(), value) {
            (TAG_OBJECT, Value::Object(map)) => {
                for (key, item) in map {
                    self.set(&key, item)?;
                }
                Ok(())
            }
            (TAG_ARRAY, Value::Array(items)) => {
                for item in items {
                    self.push(item)?;
                }
                Ok(())
            }
            _ => Err(SyncError::InvariantViolation(
                "set_from_value kind must match the handle's own object/array kind",
            )),
        }
    }

    fn materialize(&self, tag: u32, payload: u32) -> Value {
        match tag {
            TAG_NULL => Value::Null,
            TAG_TRUE => Value::Bool(true),
            TAG_FALSE => Value::Bool(false),
            TAG_NUMBER => Number::from_f64(self.heap.read_f64(payload))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            TAG_STRING => Value::String(self.heap.read_string_at(payload)),
            TAG_OBJECT | TAG_ARRAY => self.materialize_container(payload),
            other => unreachable!("unknown SJB value tag {other}"),
        }
    }

    fn materialize_container(&self, ptr: u32) -> Value {
        let live = self.heap.resolve(ptr);
        let tag = self.heap.read_u32(live + NODE_OFFSET_TAG as u32);
        if tag == TAG_OBJECT {
            let mut map = Map::new();
            for key in self.heap.object_keys(live) {
                if let (_, Lookup::Found { tag, payload, .. }) =
                    self.heap.find_entry_readonly(live, &key)
                {
                    map.insert(key, self.materialize(tag, payload));
                }
            }
            Value::Object(map)
        } else {
            let len = self.heap.array_len(live);
            let mut items = Vec::with_capacity(len as usize);
            for index in 0..len {
                let (tag, payload) = self.heap.array_get(live, index).expect("index < len");
                items.push(self.materialize(tag, payload));
            }
            Value::Array(items)
        }
    }

    /// Build `value` as a fresh subtree and return its `(tag, payload)`
    /// pair. The container "shell" is temp-rooted across the whole
    /// population loop; each child's own payload is temp-rooted inside
    /// `object_set`/`array_push` for the instant it takes to link it in,
    /// so nothing here is ever left unrooted across an allocation.
    fn alloc_value(&self, value: Value) -> Result<(u32, u32)> {
        match value {
            Value::Null => Ok((TAG_NULL, 0)),
            Value::Bool(true) => Ok((TAG_TRUE, 0)),
            Value::Bool(false) => Ok((TAG_FALSE, 0)),
            Value::Number(n) => {
                let f = n
                    .as_f64()
                    .ok_or(SyncError::InvariantViolation("JSON number out of f64 range"))?;
                Ok((TAG_NUMBER, self.heap.alloc_number(f)?))
            }
            Value::String(s) => Ok((TAG_STRING, self.heap.alloc_string(&s)?)),
            Value::Array(items) => {
                let shell = self.heap.alloc_array_node(items.len().max(1) as u32)?;
                let shell_root = self.heap.push_temp_root(shell, TAG_ARRAY);
                for item in items {
                    let (tag, payload) = self.alloc_value(item)?;
                    let new_shell = self.heap.array_push(shell_root.get(), tag, payload)?;
                    shell_root.set(new_shell);
                }
                Ok((TAG_ARRAY, shell_root.get()))
            }
            Value::Object(map) => {
                let shell = self.heap.alloc_object_node(map.len().max(1) as u32)?;
                let shell_root = self.heap.push_temp_root(shell, TAG_OBJECT);
                for (key, item) in map {
                    let (tag, payload) = self.alloc_value(item)?;
                    let new_shell = self.heap.object_set(shell_root.get(), &key, tag, payload)?;
                    shell_root.set(new_shell);
                }
                Ok((TAG_OBJECT, shell_root.get()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get_round_trips_scalars_and_containers() {
        let buf = SharedJsonBuffer::new();
        let root = buf.root().unwrap();
        root.set("name", json!("alice")).unwrap();
        root.set("age", json!(30)).unwrap();
        root.set("tags", json!(["admin", "beta"])).unwrap();

        assert_eq!(root.get("name"), Some(json!("alice")));
        assert_eq!(root.get("age"), Some(json!(30.0)));
        assert_eq!(root.get("tags"), Some(json!(["admin", "beta"])));
        assert_eq!(root.get("missing"), None);
    }

    #[test]
    fn nested_object_mutation_is_visible_through_a_child_handle() {
        let buf = SharedJsonBuffer::new();
        let root = buf.root().unwrap();
        root.set("profile", json!({"city": "nyc"})).unwrap();

        let profile = root.get_handle("profile").unwrap();
        profile.set("city", json!("sf")).unwrap();

        assert_eq!(root.get("profile"), Some(json!({"city": "sf"})));
    }

    #[test]
    fn array_push_and_pop() {
        let buf = SharedJsonBuffer::new();
        let root = buf.root().unwrap();
        root.set("list", json!([])).unwrap();
        let list = root.get_handle("list").unwrap();
        for i in 0..5 {
            list.push(json!(i)).unwrap();
        }
        assert_eq!(list.len(), 5);
        assert_eq!(list.pop(), Some(json!(4.0)));
        assert_eq!(root.get("list"), Some(json!([0.0, 1.0, 2.0, 3.0])));
    }

    #[test]
    fn delete_removes_key() {
        let buf = SharedJsonBuffer::new();
        let root = buf.root().unwrap();
        root.set("a", json!(1)).unwrap();
        root.set("b", json!(2)).unwrap();
        assert!(root.delete("a"));
        assert!(!root.delete("a"));
        assert_eq!(root.get("a"), None);
        assert_eq!(root.get("b"), Some(json!(2.0)));
    }

    #[test]
    fn survives_gc_while_holding_many_keys() {
        // A tiny arena forces several compacting collections during this
        // loop; every insert must still land correctly afterwards.
        let buf = SharedJsonBuffer::with_capacity(4096);
        let root = buf.root().unwrap();
        for i in 0..60 {
            root.set(&format!("k{i}"), json!(i)).unwrap();
        }
        assert_eq!(root.len(), 60);
        for i in 0..60 {
            assert_eq!(root.get(&format!("k{i}")), Some(json!(i as f64)));
        }
    }

    #[test]
    fn set_from_value_populates_root() {
        let buf = SharedJsonBuffer::new();
        let root = buf.root().unwrap();
        root.set_from_value(json!({"a": 1, "b": [true, false, null]}))
            .unwrap();
        assert_eq!(root.to_value(), json!({"a": 1.0, "b": [true, false, null]}));
    }
}
