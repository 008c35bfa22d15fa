//! Per-buffer string decode cache (spec.md §4.7.6).
//!
//! Decoding a key's UTF-8 bytes on every property access would make the
//! accessor proxy's "O(1) after one warm lookup" claim meaningless. The
//! cache maps a string node's pointer to its decoded value; [`clear`]
//! is called once per GC cycle, since compaction invalidates every
//! pointer the cache could be keyed on.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::region::SharedRegion;

pub(crate) struct StringInterner {
    cache: Mutex<HashMap<u32, String>>,
}

impl StringInterner {
    pub(crate) fn new() -> Self {
        StringInterner {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get_or_decode(&self, region: &SharedRegion, ptr: u32) -> String {
        if let Some(cached) = self.cache.lock().unwrap().get(&ptr) {
            return cached.clone();
        }
        let len_bytes = region.read_bytes(ptr as usize, 4);
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        let bytes = region.read_bytes(ptr as usize + 4, len);
        let decoded = String::from_utf8(bytes).expect("SJB string node holds invalid UTF-8");
        self.cache.lock().unwrap().insert(ptr, decoded.clone());
        decoded
    }

    pub(crate) fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_caches() {
        let region = SharedRegion::new(64);
        let bytes = b"hello";
        region.write_bytes(0, &(bytes.len() as u32).to_le_bytes());
        region.write_bytes(4, bytes);
        let interner = StringInterner::new();
        assert_eq!(interner.get_or_decode(&region, 0), "hello");
        // Second read must come from the cache, not re-decode; mutate the
        // underlying bytes to prove it.
        region.write_bytes(4, b"wrong");
        assert_eq!(interner.get_or_decode(&region, 0), "hello");
    }

    #[test]
    fn clear_forces_redecode() {
        let region = SharedRegion::new(64);
        region.write_bytes(0, &5u32.to_le_bytes());
        region.write_bytes(4, b"first");
        let interner = StringInterner::new();
        assert_eq!(interner.get_or_decode(&region, 0), "first");
        interner.clear();
        region.write_bytes(4, b"secnd");
        assert_eq!(interner.get_or_decode(&region, 0), "secnd");
    }
}
